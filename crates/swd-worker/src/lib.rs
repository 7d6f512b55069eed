//! Worker: consumes leased jobs and drives the order lifecycle state
//! machine.
//!
//! # Idempotency under at-least-once delivery
//!
//! The queue may deliver a job twice (visibility-timeout reclaim after a
//! crash). Every stage therefore starts by reading the persisted status and
//! resuming from the next unfinished stage; every write is a conditional
//! transition (`where status = expected`), so a replayed stage surfaces as a
//! conflict and the worker simply re-reads and moves on. No stage is ever
//! applied twice.
//!
//! # Publish-after-persist
//!
//! Every persisted state change is **followed** by a publish on the order's
//! bus topic. A failed publish is logged and never rolls back the write; the
//! subscription service reconstructs current state from backfill.
//!
//! # Failure classification
//!
//! Transient errors (venue timeouts/outages, backend hiccups) are `nack`ed —
//! the queue owns the retry schedule, and the worker only reports what the
//! queue decided (a `retry_scheduled` event, or the terminal failure once
//! retries are exhausted). Non-retriable errors (slippage violation, the
//! 30 s per-job deadline) persist `failed` immediately.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use swd_bus::EventBus;
use swd_clock::{Clock, SharedClock};
use swd_queue::{Job, JobQueue, NackOutcome};
use swd_router::{Router, RouterError};
use swd_schemas::{LogEntry, Order, OrderEvent, OrderStatus, RetryInfo};
use swd_store::{OrderRepository, TransitionOutcome, TransitionPatch};

mod janitor;

pub use janitor::{reclaim_pending, spawn_janitor, JanitorConfig};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Jobs in flight at once (the queue also enforces its own cap).
    pub concurrency: usize,
    /// Idle sleep between lease attempts.
    pub poll_interval: Duration,
    /// Hard wall-clock budget per job delivery.
    pub job_deadline: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-1".to_string(),
            concurrency: 10,
            poll_interval: Duration::from_millis(50),
            job_deadline: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage failures
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum StageFailure {
    /// Worth a queue-scheduled retry.
    Retriable(String),
    /// Persist `failed` now; no retry.
    Fatal(String),
}

impl From<RouterError> for StageFailure {
    fn from(err: RouterError) -> Self {
        if err.is_retriable() {
            StageFailure::Retriable(err.to_string())
        } else {
            StageFailure::Fatal(err.to_string())
        }
    }
}

enum DriveOutcome {
    /// Order reached a terminal state (or already was there).
    Completed,
    /// Shutdown requested between stages; lease is released.
    Parked,
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct Worker {
    cfg: WorkerConfig,
    repo: Arc<dyn OrderRepository>,
    queue: Arc<dyn JobQueue>,
    router: Arc<Router>,
    bus: EventBus,
    clock: SharedClock,
}

impl Worker {
    pub fn new(
        cfg: WorkerConfig,
        repo: Arc<dyn OrderRepository>,
        queue: Arc<dyn JobQueue>,
        router: Arc<Router>,
        bus: EventBus,
        clock: SharedClock,
    ) -> Self {
        Self {
            cfg,
            repo,
            queue,
            router,
            bus,
            clock,
        }
    }

    /// Run the lease loop until `shutdown` flips. In-flight jobs finish
    /// their current stage, then release their lease.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.cfg.worker_id, "worker started");
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut shutdown_rx = shutdown.clone();

        loop {
            while tasks.try_join_next().is_some() {}

            if *shutdown_rx.borrow() {
                break;
            }

            if tasks.len() < self.cfg.concurrency {
                match self.queue.lease(&self.cfg.worker_id).await {
                    Ok(Some(job)) => {
                        let worker = Arc::clone(&self);
                        let sd = shutdown.clone();
                        tasks.spawn(async move { worker.process(job, Some(sd)).await });
                        continue; // try to fill remaining slots immediately
                    }
                    Ok(None) => {}
                    Err(err) => warn!(%err, "lease failed"),
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.cfg.poll_interval) => {}
                _ = shutdown_rx.changed() => {}
            }
        }

        while tasks.join_next().await.is_some() {}
        info!(worker_id = %self.cfg.worker_id, "worker stopped");
    }

    /// Lease and fully process at most one job. Returns whether a job was
    /// processed. The run loop is this in a loop; scenario tests call it
    /// directly to step deliveries deterministically.
    pub async fn process_next(&self) -> Result<bool> {
        match self.queue.lease(&self.cfg.worker_id).await? {
            Some(job) => {
                self.process(job, None).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn process(&self, job: Job, shutdown: Option<watch::Receiver<bool>>) {
        let outcome = tokio::time::timeout(self.cfg.job_deadline, self.drive(&job, &shutdown)).await;

        match outcome {
            Ok(Ok(DriveOutcome::Completed)) => {
                if let Err(err) = self.queue.ack(job.id).await {
                    warn!(order_id = %job.order_id, %err, "ack failed");
                }
            }
            Ok(Ok(DriveOutcome::Parked)) => {
                info!(order_id = %job.order_id, "shutdown mid-job; releasing lease");
                if let Err(err) = self.queue.release(job.id).await {
                    warn!(order_id = %job.order_id, %err, "lease release failed");
                }
            }
            Ok(Err(StageFailure::Fatal(reason))) => {
                self.fail_order(&job, &reason).await;
                if let Err(err) = self.queue.ack(job.id).await {
                    warn!(order_id = %job.order_id, %err, "ack failed");
                }
            }
            Ok(Err(StageFailure::Retriable(reason))) => {
                self.handle_retriable(&job, &reason).await;
            }
            Err(_elapsed) => {
                let reason = format!(
                    "timeout: job exceeded {:?} deadline",
                    self.cfg.job_deadline
                );
                self.fail_order(&job, &reason).await;
                if let Err(err) = self.queue.ack(job.id).await {
                    warn!(order_id = %job.order_id, %err, "ack failed");
                }
            }
        }
    }

    /// Drive the order from its current persisted status to a terminal
    /// state, one stage per iteration. Duplicate deliveries skip forward
    /// to the next unfinished stage.
    async fn drive(
        &self,
        job: &Job,
        shutdown: &Option<watch::Receiver<bool>>,
    ) -> std::result::Result<DriveOutcome, StageFailure> {
        loop {
            if let Some(rx) = shutdown {
                if *rx.borrow() {
                    return Ok(DriveOutcome::Parked);
                }
            }

            let order = self
                .repo
                .fetch(job.order_id)
                .await
                .map_err(|e| StageFailure::Retriable(format!("fetch order: {e:#}")))?
                .ok_or_else(|| {
                    StageFailure::Fatal(format!("order {} not found", job.order_id))
                })?;

            match order.status {
                OrderStatus::Pending => self.stage_begin(&order).await?,
                OrderStatus::Routing => self.stage_route(&order).await?,
                OrderStatus::Building => self.stage_submit(&order).await?,
                OrderStatus::Submitted => self.stage_settle(&order).await?,
                OrderStatus::Confirmed | OrderStatus::Failed => {
                    return Ok(DriveOutcome::Completed)
                }
            }
        }
    }

    // -- stages ------------------------------------------------------------

    /// pending → routing: unconditional upon lease.
    async fn stage_begin(&self, order: &Order) -> std::result::Result<(), StageFailure> {
        let log = LogEntry::new("routing", self.clock.now());
        self.apply(
            order.id,
            OrderStatus::Pending,
            OrderStatus::Routing,
            TransitionPatch::default(),
            log,
        )
        .await
    }

    /// routing → building: fan out quotes, pick the winner, persist both in
    /// the same atomic update as the status change.
    async fn stage_route(&self, order: &Order) -> std::result::Result<(), StageFailure> {
        let quotes = self
            .router
            .quotes(&order.token_in, &order.token_out, order.amount_in)
            .await?;
        let (venue, net_price) = Router::select_best(&quotes)?;
        let winning = quotes[&venue];

        // normalize() drops trailing zeros so "99.700" persists as "99.7".
        let net_prices: std::collections::BTreeMap<String, String> = quotes
            .iter()
            .map(|(id, q)| (id.clone(), q.net_price().normalize().to_string()))
            .collect();

        // The winner's gross quote is the slippage reference for the later
        // stages; it rides in this log entry so a resumed delivery can
        // settle without re-quoting.
        let log = LogEntry::new("routing_complete", self.clock.now())
            .with_field("quotes", json!(net_prices))
            .with_field("selected", json!(venue))
            .with_field("price", json!(winning.price.to_string()))
            .with_field("fee", json!(winning.fee.to_string()))
            .with_field("netPrice", json!(net_price.normalize().to_string()));

        self.apply(
            order.id,
            OrderStatus::Routing,
            OrderStatus::Building,
            TransitionPatch {
                quotes: Some(net_prices),
                dex_used: Some(venue),
                ..TransitionPatch::default()
            },
            log,
        )
        .await
    }

    /// building → submitted: execute on the selected venue; the transition
    /// carries the tx hash. The executed price rides in the log entry so a
    /// resumed delivery can settle without re-executing.
    async fn stage_submit(&self, order: &Order) -> std::result::Result<(), StageFailure> {
        let venue = order.dex_used.as_deref().ok_or_else(|| {
            StageFailure::Fatal("building without a selected venue".to_string())
        })?;
        let expected = expected_price_from_logs(order).ok_or_else(|| {
            StageFailure::Fatal("building without a recorded winning quote".to_string())
        })?;

        let result = self
            .router
            .execute(
                venue,
                &order.token_in,
                &order.token_out,
                order.amount_in,
                expected,
                order.slippage,
            )
            .await?;

        let log = LogEntry::new("submitted", self.clock.now())
            .with_field("txHash", json!(result.tx_hash))
            .with_field("executedPrice", json!(result.executed_price.to_string()));

        self.apply(
            order.id,
            OrderStatus::Building,
            OrderStatus::Submitted,
            TransitionPatch {
                tx_hash: Some(result.tx_hash),
                ..TransitionPatch::default()
            },
            log,
        )
        .await
    }

    /// submitted → confirmed: validate slippage against the executed price
    /// and settle `amount_out = amount_in × executed_price`.
    async fn stage_settle(&self, order: &Order) -> std::result::Result<(), StageFailure> {
        let expected = expected_price_from_logs(order).ok_or_else(|| {
            StageFailure::Fatal("submitted without a recorded winning quote".to_string())
        })?;
        let executed = executed_price_from_logs(order).ok_or_else(|| {
            StageFailure::Fatal("submitted without an executed price on record".to_string())
        })?;

        if !Router::check_slippage(expected, executed, order.slippage) {
            return Err(RouterError::SlippageExceeded {
                expected,
                actual: executed,
                max: order.slippage,
            }
            .into());
        }

        let amount_out = order.amount_in * executed;
        let log = LogEntry::new("confirmed", self.clock.now())
            .with_field("amountOut", json!(amount_out.to_string()))
            .with_field("executedPrice", json!(executed.to_string()));

        self.apply(
            order.id,
            OrderStatus::Submitted,
            OrderStatus::Confirmed,
            TransitionPatch {
                amount_out: Some(amount_out),
                ..TransitionPatch::default()
            },
            log,
        )
        .await
    }

    // -- plumbing ----------------------------------------------------------

    /// Conditional transition + publish. A conflict means a duplicate
    /// delivery already advanced the row; the drive loop re-reads and
    /// resumes, so it is not an error here.
    async fn apply(
        &self,
        order_id: uuid::Uuid,
        expected: OrderStatus,
        to: OrderStatus,
        patch: TransitionPatch,
        log: LogEntry,
    ) -> std::result::Result<(), StageFailure> {
        let outcome = self
            .repo
            .transition(order_id, expected, to, patch, log)
            .await
            .map_err(|e| StageFailure::Retriable(format!("transition: {e:#}")))?;

        match outcome {
            TransitionOutcome::Applied(order) => {
                self.bus.publish(&OrderEvent::status_change(&order));
            }
            TransitionOutcome::Conflict(current) => {
                info!(
                    %order_id,
                    expected = %expected,
                    current = %current,
                    "duplicate delivery detected; resuming from current status"
                );
            }
        }
        Ok(())
    }

    /// A transient failure: hand the job back to the queue and report what
    /// it decided.
    async fn handle_retriable(&self, job: &Job, reason: &str) {
        match self.queue.nack(job.id, reason).await {
            Ok(NackOutcome::RetryScheduled {
                attempt,
                max_attempts,
                next_run_at,
            }) => {
                warn!(
                    order_id = %job.order_id,
                    attempt,
                    max_attempts,
                    %reason,
                    "retry scheduled"
                );
                let entry = LogEntry::new("retry_scheduled", self.clock.now())
                    .with_field("attempt", json!(attempt))
                    .with_field("maxAttempts", json!(max_attempts))
                    .with_field("nextRunAt", json!(next_run_at))
                    .with_field("error", json!(reason));
                if let Err(err) = self.repo.append_log(job.order_id, entry).await {
                    warn!(order_id = %job.order_id, %err, "retry log append failed");
                }

                if let Ok(Some(order)) = self.repo.fetch(job.order_id).await {
                    let mut event = OrderEvent::status_change(&order);
                    event.retry = Some(RetryInfo {
                        attempt,
                        max_attempts,
                        next_run_at,
                    });
                    self.bus.publish(&event);
                }
            }
            Ok(NackOutcome::FailedTerminal { attempts }) => {
                let reason = format!("{reason} (after {attempts} attempts)");
                self.fail_order(job, &reason).await;
            }
            Err(err) => {
                error!(order_id = %job.order_id, %err, "nack failed; job will be reclaimed");
            }
        }
    }

    /// Persist the terminal failure from whatever non-terminal status the
    /// order is currently in, then publish.
    async fn fail_order(&self, job: &Job, reason: &str) {
        for _ in 0..4 {
            let order = match self.repo.fetch(job.order_id).await {
                Ok(Some(order)) => order,
                Ok(None) => {
                    error!(order_id = %job.order_id, "order vanished while failing");
                    return;
                }
                Err(err) => {
                    error!(order_id = %job.order_id, %err, "fetch failed while failing order");
                    return;
                }
            };
            if order.status.is_terminal() {
                return;
            }

            let log = LogEntry::new("failed", self.clock.now())
                .with_field("reason", json!(reason))
                .with_field("attempt", json!(job.attempt + 1));
            let outcome = self
                .repo
                .transition(
                    order.id,
                    order.status,
                    OrderStatus::Failed,
                    TransitionPatch {
                        failure_reason: Some(reason.to_string()),
                        ..TransitionPatch::default()
                    },
                    log,
                )
                .await;

            match outcome {
                Ok(TransitionOutcome::Applied(order)) => {
                    warn!(order_id = %order.id, %reason, "order failed");
                    self.bus.publish(&OrderEvent::status_change(&order));
                    return;
                }
                // Another delivery moved the row; re-read and retry the
                // failure from the new status.
                Ok(TransitionOutcome::Conflict(_)) => continue,
                Err(err) => {
                    error!(order_id = %job.order_id, %err, "failed to persist terminal failure");
                    return;
                }
            }
        }
    }
}

/// The winning venue's gross quote is recorded in the `routing_complete`
/// log entry, atomically with the building transition. It is the expected
/// price that slippage is measured against.
fn expected_price_from_logs(order: &Order) -> Option<Decimal> {
    log_decimal_field(order, "routing_complete", "price")
}

/// The executed price is recorded in the `submitted` log entry, atomically
/// with the submitted transition — a crash between submit and settle resumes
/// from here.
fn executed_price_from_logs(order: &Order) -> Option<Decimal> {
    log_decimal_field(order, "submitted", "executedPrice")
}

fn log_decimal_field(order: &Order, stage: &str, field: &str) -> Option<Decimal> {
    order
        .logs
        .iter()
        .rev()
        .find(|l| l.stage == stage)
        .and_then(|l| l.fields.get(field))
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<Decimal>().ok())
}
