//! A venue that never recovers: three retries at 2 s / 4 s / 8 s, then the
//! order fails terminally with the last error on record.

use std::sync::Arc;
use std::time::Duration;

use swd_bus::EventBus;
use swd_clock::{Clock, ManualClock};
use swd_queue::{JobQueue, MemoryQueue, QueueConfig};
use swd_router::Router;
use swd_schemas::{ExecuteRequest, Order, OrderKind, OrderStatus};
use swd_store::{MemoryOrderRepository, OrderRepository};
use swd_venues::{SimVenue, Venue};
use swd_worker::{Worker, WorkerConfig};
use uuid::Uuid;

#[tokio::test]
async fn permanently_failing_venue_dead_letters_after_three_retries() {
    let clock = Arc::new(ManualClock::fixed());
    let repo = Arc::new(MemoryOrderRepository::new(clock.clone()));
    let queue = Arc::new(MemoryQueue::new(clock.clone(), QueueConfig::default()));
    let bus = EventBus::new();

    // Every quote call fails, so every delivery sees quote_unavailable.
    let venue = Arc::new(
        SimVenue::new("orca", "100".parse().unwrap(), "0.001".parse().unwrap(), Some(5))
            .with_variance_bps(0)
            .with_latency(Duration::ZERO),
    );
    venue.fail_next_quotes(u32::MAX);

    let worker = Worker::new(
        WorkerConfig::default(),
        repo.clone() as Arc<dyn OrderRepository>,
        queue.clone() as Arc<dyn JobQueue>,
        Arc::new(Router::new(vec![venue as Arc<dyn Venue>])),
        bus.clone(),
        clock.clone(),
    );

    let order = Order::new(
        Uuid::new_v4(),
        OrderKind::Market,
        "SOL",
        "USDC",
        "1.0".parse().unwrap(),
        "0.05".parse().unwrap(),
        clock.now(),
    );
    let order_id = order.id;
    repo.create(order).await.unwrap();
    queue
        .enqueue(
            order_id,
            ExecuteRequest {
                kind: "market".into(),
                token_in: "SOL".into(),
                token_out: "USDC".into(),
                amount: "1.0".into(),
                slippage: "0.05".into(),
            },
        )
        .await
        .unwrap();

    // Delivery 1 fails -> retries scheduled at +2 s, +4 s, +8 s; delivery 4
    // exhausts the budget.
    assert!(worker.process_next().await.unwrap());
    for backoff in [2, 4, 8] {
        clock.advance_secs(backoff);
        assert!(worker.process_next().await.unwrap(), "retry after {backoff}s");
    }

    let row = repo.fetch(order_id).await.unwrap().unwrap();
    assert_eq!(row.status, OrderStatus::Failed);
    let reason = row.failure_reason.expect("reason recorded");
    assert!(
        reason.contains("quote_unavailable"),
        "last error surfaces: {reason}"
    );
    assert!(reason.contains("4 attempts"), "attempt count surfaces: {reason}");

    // Exactly three retry entries on the log.
    let retries = row
        .logs
        .iter()
        .filter(|l| l.stage == "retry_scheduled")
        .count();
    assert_eq!(retries, 3);

    let depth = queue.depth().await.unwrap();
    assert_eq!(depth.failed, 1, "job dead-lettered");
    assert_eq!(depth.retrying + depth.waiting + depth.active, 0);

    // Nothing further is delivered, even much later.
    clock.advance_secs(3600);
    assert!(!worker.process_next().await.unwrap());
}
