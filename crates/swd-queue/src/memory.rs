//! In-memory queue backend.
//!
//! Default backend when no `DATABASE_URL` is configured, and the one the
//! deterministic scenario tests drive (time flows through the injected
//! clock, so backoff and visibility timeouts never sleep for real).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use swd_clock::{Clock, SharedClock};
use swd_schemas::ExecuteRequest;

use crate::{
    backoff_delay, Job, JobQueue, JobState, NackOutcome, QueueConfig, QueueDepth, QueueError,
};

struct JobRecord {
    job: Job,
    seq: u64,
    leased_by: Option<String>,
    leased_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, JobRecord>,
    /// order id → its single non-terminal job.
    open_by_order: HashMap<Uuid, Uuid>,
    /// FIFO tie-break for leasing.
    seq: u64,
    /// Lease timestamps within the last minute (global throughput ceiling).
    lease_log: VecDeque<DateTime<Utc>>,
}

pub struct MemoryQueue {
    clock: SharedClock,
    cfg: QueueConfig,
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new(clock: SharedClock, cfg: QueueConfig) -> Self {
        Self {
            clock,
            cfg,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Test/observability helper: current view of a job.
    pub fn job(&self, job_id: Uuid) -> Option<Job> {
        self.inner
            .lock()
            .expect("queue lock poisoned")
            .jobs
            .get(&job_id)
            .map(|r| r.job.clone())
    }

    /// Test/observability helper: last error recorded on a job.
    pub fn last_error(&self, job_id: Uuid) -> Option<String> {
        self.inner
            .lock()
            .expect("queue lock poisoned")
            .jobs
            .get(&job_id)
            .and_then(|r| r.last_error.clone())
    }

    fn housekeep(inner: &mut Inner, cfg: &QueueConfig, now: DateTime<Utc>) {
        // Reclaim leases that outlived the visibility timeout.
        for rec in inner.jobs.values_mut() {
            if rec.job.state == JobState::Active {
                if let Some(leased_at) = rec.leased_at {
                    if leased_at + cfg.visibility_timeout <= now {
                        rec.job.state = JobState::Waiting;
                        rec.leased_by = None;
                        rec.leased_at = None;
                    }
                }
            }
            // Promote due retries so the lease scan below sees them.
            if rec.job.state == JobState::RetryScheduled && rec.job.next_run_at <= now {
                rec.job.state = JobState::Waiting;
            }
        }

        let window_start = now - Duration::seconds(60);
        while inner
            .lease_log
            .front()
            .is_some_and(|t| *t <= window_start)
        {
            inner.lease_log.pop_front();
        }
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, order_id: Uuid, request: ExecuteRequest) -> Result<Uuid, QueueError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().expect("queue lock poisoned");

        if let Some(existing) = inner.open_by_order.get(&order_id) {
            return Ok(*existing);
        }

        let job = Job {
            id: Uuid::new_v4(),
            order_id,
            request,
            correlation_id: Uuid::new_v4(),
            attempt: 0,
            next_run_at: now,
            state: JobState::Waiting,
        };
        let job_id = job.id;
        inner.seq += 1;
        let seq = inner.seq;
        inner.jobs.insert(
            job_id,
            JobRecord {
                job,
                seq,
                leased_by: None,
                leased_at: None,
                last_error: None,
            },
        );
        inner.open_by_order.insert(order_id, job_id);
        Ok(job_id)
    }

    async fn lease(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        Self::housekeep(&mut inner, &self.cfg, now);

        if inner.lease_log.len() >= self.cfg.global_per_minute as usize {
            return Ok(None);
        }

        let active_for_worker = inner
            .jobs
            .values()
            .filter(|r| r.job.state == JobState::Active && r.leased_by.as_deref() == Some(worker_id))
            .count();
        if active_for_worker >= self.cfg.per_worker_cap {
            return Ok(None);
        }

        let candidate = inner
            .jobs
            .values()
            .filter(|r| r.job.state == JobState::Waiting && r.job.next_run_at <= now)
            .min_by_key(|r| r.seq)
            .map(|r| r.job.id);

        let Some(job_id) = candidate else {
            return Ok(None);
        };

        inner.lease_log.push_back(now);
        let rec = inner.jobs.get_mut(&job_id).expect("candidate exists");
        rec.job.state = JobState::Active;
        rec.leased_by = Some(worker_id.to_string());
        rec.leased_at = Some(now);
        Ok(Some(rec.job.clone()))
    }

    async fn ack(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let order_id = {
            let rec = inner
                .jobs
                .get_mut(&job_id)
                .ok_or(QueueError::UnknownJob(job_id))?;
            match rec.job.state {
                JobState::Active => {
                    rec.job.state = JobState::Succeeded;
                    rec.leased_by = None;
                    rec.leased_at = None;
                    rec.job.order_id
                }
                // Duplicate ack after a crash replay is harmless.
                JobState::Succeeded => return Ok(()),
                _ => return Err(QueueError::NotActive(job_id)),
            }
        };
        if inner.open_by_order.get(&order_id) == Some(&job_id) {
            inner.open_by_order.remove(&order_id);
        }
        Ok(())
    }

    async fn nack(&self, job_id: Uuid, error: &str) -> Result<NackOutcome, QueueError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let (outcome, terminal_order) = {
            let rec = inner
                .jobs
                .get_mut(&job_id)
                .ok_or(QueueError::UnknownJob(job_id))?;

            if rec.job.state != JobState::Active {
                return Err(QueueError::NotActive(job_id));
            }

            rec.job.attempt += 1;
            rec.leased_by = None;
            rec.leased_at = None;
            rec.last_error = Some(error.to_string());

            if rec.job.attempt <= self.cfg.max_retries {
                let next_run_at = now + backoff_delay(rec.job.attempt);
                rec.job.state = JobState::RetryScheduled;
                rec.job.next_run_at = next_run_at;
                (
                    NackOutcome::RetryScheduled {
                        attempt: rec.job.attempt,
                        max_attempts: self.cfg.max_retries,
                        next_run_at,
                    },
                    None,
                )
            } else {
                rec.job.state = JobState::FailedTerminal;
                (
                    NackOutcome::FailedTerminal {
                        attempts: rec.job.attempt,
                    },
                    Some(rec.job.order_id),
                )
            }
        };

        if let Some(order_id) = terminal_order {
            if inner.open_by_order.get(&order_id) == Some(&job_id) {
                inner.open_by_order.remove(&order_id);
            }
        }
        Ok(outcome)
    }

    async fn release(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let rec = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::UnknownJob(job_id))?;
        if rec.job.state != JobState::Active {
            return Err(QueueError::NotActive(job_id));
        }
        rec.job.state = JobState::Waiting;
        rec.leased_by = None;
        rec.leased_at = None;
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let inner = self.inner.lock().expect("queue lock poisoned");
        let mut depth = QueueDepth::default();
        for rec in inner.jobs.values() {
            match rec.job.state {
                JobState::Waiting => depth.waiting += 1,
                JobState::Active => depth.active += 1,
                JobState::RetryScheduled => depth.retrying += 1,
                JobState::FailedTerminal => depth.failed += 1,
                JobState::Succeeded => {}
            }
        }
        Ok(depth)
    }
}
