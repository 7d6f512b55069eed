//! Janitor sweep: pending rows older than the grace period get their job
//! re-enqueued; fresh and already-progressed rows are left alone.

use std::sync::Arc;

use swd_bus::EventBus;
use swd_clock::{Clock, ManualClock};
use swd_queue::{JobQueue, MemoryQueue, QueueConfig};
use swd_router::Router;
use swd_schemas::{ExecuteRequest, Order, OrderKind, OrderStatus};
use swd_store::{MemoryOrderRepository, OrderRepository};
use swd_venues::{SimVenue, Venue};
use swd_worker::{reclaim_pending, Worker, WorkerConfig};
use uuid::Uuid;

fn order(clock: &ManualClock) -> Order {
    Order::new(
        Uuid::new_v4(),
        OrderKind::Market,
        "SOL",
        "USDC",
        "1.0".parse().unwrap(),
        "0.05".parse().unwrap(),
        clock.now(),
    )
}

#[tokio::test]
async fn orphaned_pending_orders_are_reenqueued_and_complete() {
    let clock = Arc::new(ManualClock::fixed());
    let repo = Arc::new(MemoryOrderRepository::new(clock.clone()));
    let queue = Arc::new(MemoryQueue::new(clock.clone(), QueueConfig::default()));

    // Admission created the row but the enqueue never happened.
    let orphan = order(&clock);
    let orphan_id = orphan.id;
    repo.create(orphan).await.unwrap();

    clock.advance_secs(120);

    // A fresh pending row, still within the grace period.
    let fresh = order(&clock);
    let fresh_id = fresh.id;
    repo.create(fresh).await.unwrap();

    let repo_dyn = repo.clone() as Arc<dyn OrderRepository>;
    let queue_dyn = queue.clone() as Arc<dyn JobQueue>;
    let clock_dyn = clock.clone() as swd_clock::SharedClock;

    let swept = reclaim_pending(&repo_dyn, &queue_dyn, &clock_dyn, chrono::Duration::seconds(60))
        .await
        .unwrap();
    assert_eq!(swept, 1, "only the orphan is swept");
    assert_eq!(queue.depth().await.unwrap().waiting, 1);

    // Sweeping again is harmless: enqueue is idempotent per order.
    let swept = reclaim_pending(&repo_dyn, &queue_dyn, &clock_dyn, chrono::Duration::seconds(60))
        .await
        .unwrap();
    assert_eq!(swept, 1);
    assert_eq!(queue.depth().await.unwrap().waiting, 1, "no duplicate job");

    // The reclaimed order completes end to end.
    let venue = Arc::new(
        SimVenue::new("orca", "100".parse().unwrap(), "0.001".parse().unwrap(), Some(6))
            .with_variance_bps(0)
            .with_latency(std::time::Duration::ZERO),
    );
    venue.set_executed_price("100".parse().unwrap());
    let worker = Worker::new(
        WorkerConfig::default(),
        repo_dyn.clone(),
        queue_dyn.clone(),
        Arc::new(Router::new(vec![venue as Arc<dyn Venue>])),
        EventBus::new(),
        clock.clone(),
    );
    assert!(worker.process_next().await.unwrap());
    assert_eq!(
        repo.fetch(orphan_id).await.unwrap().unwrap().status,
        OrderStatus::Confirmed
    );
    assert_eq!(
        repo.fetch(fresh_id).await.unwrap().unwrap().status,
        OrderStatus::Pending,
        "fresh row untouched"
    );
}

#[tokio::test]
async fn janitor_reconstructs_the_original_request() {
    let clock = Arc::new(ManualClock::fixed());
    let repo = Arc::new(MemoryOrderRepository::new(clock.clone()));
    let queue = Arc::new(MemoryQueue::new(clock.clone(), QueueConfig::default()));

    let o = order(&clock);
    let id = o.id;
    repo.create(o).await.unwrap();
    clock.advance_secs(120);

    let repo_dyn = repo.clone() as Arc<dyn OrderRepository>;
    let queue_dyn = queue.clone() as Arc<dyn JobQueue>;
    let clock_dyn = clock.clone() as swd_clock::SharedClock;
    reclaim_pending(&repo_dyn, &queue_dyn, &clock_dyn, chrono::Duration::seconds(60))
        .await
        .unwrap();

    let job = queue.lease("w1").await.unwrap().expect("job enqueued");
    assert_eq!(job.order_id, id);
    assert_eq!(
        job.request,
        ExecuteRequest {
            kind: "market".into(),
            token_in: "SOL".into(),
            token_out: "USDC".into(),
            amount: "1.0".into(),
            slippage: "0.05".into(),
        }
    );
}
