//! Janitor: re-enqueues pending orders whose enqueue step never landed.
//!
//! Admission writes the order row first and enqueues second. If the enqueue
//! fails, the row stays `pending` with no job; this loop sweeps such rows
//! after a grace period and re-enqueues them (enqueue is idempotent per
//! order, so sweeping an order that does have a job is a no-op).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{info, warn};

use swd_clock::{Clock, SharedClock};
use swd_queue::JobQueue;
use swd_schemas::{ExecuteRequest, Order};
use swd_store::OrderRepository;

#[derive(Debug, Clone)]
pub struct JanitorConfig {
    /// How long a pending row may sit before it is considered orphaned.
    pub grace: chrono::Duration,
    /// Sweep interval.
    pub interval: Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            grace: chrono::Duration::seconds(60),
            interval: Duration::from_secs(15),
        }
    }
}

/// One sweep: enqueue every pending order older than the grace period.
/// Returns how many orders were swept.
pub async fn reclaim_pending(
    repo: &Arc<dyn OrderRepository>,
    queue: &Arc<dyn JobQueue>,
    clock: &SharedClock,
    grace: chrono::Duration,
) -> Result<usize> {
    let cutoff = clock.now() - grace;
    let stale = repo.stale_pending(cutoff).await?;
    let mut swept = 0;

    for order_id in stale {
        let Some(order) = repo.fetch(order_id).await? else {
            continue;
        };
        queue.enqueue(order_id, request_from_order(&order)).await?;
        swept += 1;
        info!(%order_id, "janitor re-enqueued stale pending order");
    }
    Ok(swept)
}

pub fn spawn_janitor(
    repo: Arc<dyn OrderRepository>,
    queue: Arc<dyn JobQueue>,
    clock: SharedClock,
    cfg: JanitorConfig,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(cfg.interval) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(err) = reclaim_pending(&repo, &queue, &clock, cfg.grace).await {
                warn!(%err, "janitor sweep failed");
            }
        }
    })
}

/// Rebuild the wire request from the persisted row (the row is
/// authoritative; amounts re-serialize exactly).
fn request_from_order(order: &Order) -> ExecuteRequest {
    ExecuteRequest {
        kind: order.kind.as_str().to_string(),
        token_in: order.token_in.clone(),
        token_out: order.token_out.clone(),
        amount: order.amount_in.to_string(),
        slippage: order.slippage.to_string(),
    }
}
