//! Durable job queue with at-least-once delivery.
//!
//! # Contract
//! - `enqueue` is idempotent per order: while a non-terminal job exists for
//!   an order id, re-enqueueing returns the existing job id and changes
//!   nothing.
//! - `lease` hands a due `waiting` job exclusively to one worker, honoring a
//!   per-worker concurrency cap and a global jobs/minute ceiling. A job
//!   whose lease outlives the visibility timeout (worker crash) returns to
//!   `waiting` — the sole source of duplicate delivery, which is why worker
//!   transitions are idempotent.
//! - `nack` schedules retries itself: `next_run_at = now + 2^attempt` seconds
//!   (2 s, 4 s, 8 s), then dead-letters after `max_retries` retries. The
//!   outcome is returned so the caller can publish the retry event or
//!   persist the terminal failure — the queue never touches orders.
//! - `ack` is terminal success.
//!
//! Retries are scheduled by the queue, not the worker. A job is lost only if
//! its persistence medium is lost.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use swd_schemas::ExecuteRequest;

mod memory;
mod pg;

pub use memory::MemoryQueue;
pub use pg::PgQueue;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    Active,
    Succeeded,
    FailedTerminal,
    RetryScheduled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "WAITING",
            JobState::Active => "ACTIVE",
            JobState::Succeeded => "SUCCEEDED",
            JobState::FailedTerminal => "FAILED_TERMINAL",
            JobState::RetryScheduled => "RETRY_SCHEDULED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WAITING" => Some(JobState::Waiting),
            "ACTIVE" => Some(JobState::Active),
            "SUCCEEDED" => Some(JobState::Succeeded),
            "FAILED_TERMINAL" => Some(JobState::FailedTerminal),
            "RETRY_SCHEDULED" => Some(JobState::RetryScheduled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::FailedTerminal)
    }
}

/// The queue-owned job envelope. Workers consume it but never mutate it
/// except through the queue API.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub order_id: Uuid,
    pub request: ExecuteRequest,
    pub correlation_id: Uuid,
    /// Completed (failed) deliveries so far; the delivery in flight is
    /// `attempt + 1`.
    pub attempt: u32,
    pub next_run_at: DateTime<Utc>,
    pub state: JobState,
}

/// What `nack` decided, so the caller can react without peeking at queue
/// internals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    RetryScheduled {
        /// Retry number being scheduled (1-based; equals the just-failed
        /// delivery).
        attempt: u32,
        max_attempts: u32,
        next_run_at: DateTime<Utc>,
    },
    FailedTerminal {
        attempts: u32,
    },
}

/// Queue depth snapshot; feeds submission backpressure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub waiting: u64,
    pub active: u64,
    pub retrying: u64,
    pub failed: u64,
}

// ---------------------------------------------------------------------------
// Config / errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Retries after the initial delivery (so 4 deliveries total by default).
    pub max_retries: u32,
    /// Concurrency cap per leasing worker.
    pub per_worker_cap: usize,
    /// Global lease ceiling over a sliding 60 s window.
    pub global_per_minute: u32,
    /// How long an `active` lease may go silent before the job is reclaimed.
    pub visibility_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            per_worker_cap: 10,
            global_per_minute: 100,
            visibility_timeout: Duration::seconds(60),
        }
    }
}

/// Backoff before retry `attempt` (1-based): `2^attempt` seconds, so 2, 4, 8.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::seconds(2i64.pow(attempt.min(16)))
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("unknown job {0}")]
    UnknownJob(Uuid),
    #[error("job {0} is not active")]
    NotActive(Uuid),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// JobQueue trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Idempotent per order id; returns the (possibly pre-existing) job id.
    async fn enqueue(&self, order_id: Uuid, request: ExecuteRequest) -> Result<Uuid, QueueError>;

    /// Atomically move one due `waiting` job to `active` for this worker, or
    /// `None` when nothing is due / a cap is hit.
    async fn lease(&self, worker_id: &str) -> Result<Option<Job>, QueueError>;

    /// Terminal success.
    async fn ack(&self, job_id: Uuid) -> Result<(), QueueError>;

    /// Record a failed delivery; the queue decides between a scheduled retry
    /// and terminal dead-lettering.
    async fn nack(&self, job_id: Uuid, error: &str) -> Result<NackOutcome, QueueError>;

    /// Hand an active job back to `waiting` without counting an attempt.
    /// Used on graceful shutdown; the effect matches a visibility-timeout
    /// reclaim but takes effect immediately.
    async fn release(&self, job_id: Uuid) -> Result<(), QueueError>;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;
}
