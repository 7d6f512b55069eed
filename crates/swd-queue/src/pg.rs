//! Postgres queue backend.
//!
//! Leasing uses `for update skip locked` so concurrent workers never claim
//! the same row; enqueue dedupes on a partial unique index over open jobs.
//! The `swd_jobs` schema lives in the swd-store migrations, which own the
//! whole database schema.
//!
//! This backend reads time from the database (`now()`), not the injected
//! clock — the deterministic backoff scenarios run against [`MemoryQueue`].

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use swd_schemas::ExecuteRequest;

use crate::{Job, JobQueue, JobState, NackOutcome, QueueConfig, QueueDepth, QueueError};

pub struct PgQueue {
    pool: PgPool,
    cfg: QueueConfig,
}

impl PgQueue {
    pub fn new(pool: PgPool, cfg: QueueConfig) -> Self {
        Self { pool, cfg }
    }
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<Job, QueueError> {
    let state_str: String = row.try_get("state").context("decode state")?;
    let state = JobState::parse(&state_str)
        .with_context(|| format!("invalid job state in database: {state_str}"))?;
    let request: serde_json::Value = row.try_get("request").context("decode request")?;
    Ok(Job {
        id: row.try_get("job_id").context("decode job_id")?,
        order_id: row.try_get("order_id").context("decode order_id")?,
        request: serde_json::from_value(request).context("decode request json")?,
        correlation_id: row
            .try_get("correlation_id")
            .context("decode correlation_id")?,
        attempt: row.try_get::<i32, _>("attempt").context("decode attempt")? as u32,
        next_run_at: row.try_get("next_run_at").context("decode next_run_at")?,
        state,
    })
}

#[async_trait]
impl JobQueue for PgQueue {
    async fn enqueue(&self, order_id: Uuid, request: ExecuteRequest) -> Result<Uuid, QueueError> {
        let payload = serde_json::to_value(&request).context("encode request json")?;

        // Two passes cover the race where another submitter inserts between
        // our conflict-miss and our read-back.
        for _ in 0..2 {
            let inserted: Option<(Uuid,)> = sqlx::query_as(
                r#"
                insert into swd_jobs (job_id, order_id, request, correlation_id, state, next_run_at)
                values ($1, $2, $3, $4, 'WAITING', now())
                on conflict (order_id) where state in ('WAITING','ACTIVE','RETRY_SCHEDULED')
                do nothing
                returning job_id
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(order_id)
            .bind(&payload)
            .bind(Uuid::new_v4())
            .fetch_optional(&self.pool)
            .await
            .context("enqueue insert failed")?;

            if let Some((job_id,)) = inserted {
                return Ok(job_id);
            }

            let existing: Option<(Uuid,)> = sqlx::query_as(
                r#"
                select job_id from swd_jobs
                where order_id = $1
                  and state in ('WAITING','ACTIVE','RETRY_SCHEDULED')
                "#,
            )
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await
            .context("enqueue read-back failed")?;

            if let Some((job_id,)) = existing {
                return Ok(job_id);
            }
        }

        Err(QueueError::Backend(anyhow::anyhow!(
            "enqueue raced for order {order_id}"
        )))
    }

    async fn lease(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        // Reclaim leases that outlived the visibility timeout.
        sqlx::query(
            r#"
            update swd_jobs
               set state = 'WAITING', leased_by = null, leased_at = null
             where state = 'ACTIVE'
               and leased_at <= now() - ($1 * interval '1 second')
            "#,
        )
        .bind(self.cfg.visibility_timeout.num_seconds())
        .execute(&self.pool)
        .await
        .context("lease reclaim failed")?;

        // Promote due retries.
        sqlx::query(
            r#"
            update swd_jobs
               set state = 'WAITING'
             where state = 'RETRY_SCHEDULED'
               and next_run_at <= now()
            "#,
        )
        .execute(&self.pool)
        .await
        .context("retry promotion failed")?;

        // Global throughput ceiling over the trailing minute.
        let (recent,): (i64,) = sqlx::query_as(
            "select count(*)::bigint from swd_jobs where leased_at > now() - interval '60 seconds'",
        )
        .fetch_one(&self.pool)
        .await
        .context("throughput count failed")?;
        if recent >= self.cfg.global_per_minute as i64 {
            return Ok(None);
        }

        // Per-worker concurrency cap.
        let (active,): (i64,) = sqlx::query_as(
            "select count(*)::bigint from swd_jobs where state = 'ACTIVE' and leased_by = $1",
        )
        .bind(worker_id)
        .fetch_one(&self.pool)
        .await
        .context("worker active count failed")?;
        if active >= self.cfg.per_worker_cap as i64 {
            return Ok(None);
        }

        let row = sqlx::query(
            r#"
            with to_claim as (
                select job_id
                from swd_jobs
                where state = 'WAITING'
                  and next_run_at <= now()
                order by created_at asc, job_id asc
                limit 1
                for update skip locked
            )
            update swd_jobs
               set state = 'ACTIVE', leased_by = $1, leased_at = now()
             where job_id in (select job_id from to_claim)
            returning job_id, order_id, request, correlation_id, attempt, next_run_at, state
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .context("lease claim failed")?;

        match row {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    async fn ack(&self, job_id: Uuid) -> Result<(), QueueError> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            update swd_jobs
               set state = 'SUCCEEDED', leased_by = null, leased_at = null
             where job_id = $1
               and state in ('ACTIVE', 'SUCCEEDED')
            returning job_id
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .context("ack failed")?;

        match row {
            Some(_) => Ok(()),
            None => Err(QueueError::NotActive(job_id)),
        }
    }

    async fn nack(&self, job_id: Uuid, error: &str) -> Result<NackOutcome, QueueError> {
        let row = sqlx::query(
            r#"
            update swd_jobs
               set attempt     = attempt + 1,
                   state       = case when attempt + 1 <= $2
                                      then 'RETRY_SCHEDULED'
                                      else 'FAILED_TERMINAL' end,
                   next_run_at = case when attempt + 1 <= $2
                                      then now() + (power(2, attempt + 1) * interval '1 second')
                                      else next_run_at end,
                   leased_by   = null,
                   leased_at   = null,
                   last_error  = $3
             where job_id = $1
               and state = 'ACTIVE'
            returning attempt, state, next_run_at
            "#,
        )
        .bind(job_id)
        .bind(self.cfg.max_retries as i32)
        .bind(error)
        .fetch_optional(&self.pool)
        .await
        .context("nack failed")?;

        let Some(row) = row else {
            return Err(QueueError::NotActive(job_id));
        };

        let attempt = row.try_get::<i32, _>("attempt").context("decode attempt")? as u32;
        let state_str: String = row.try_get("state").context("decode state")?;
        let next_run_at: DateTime<Utc> =
            row.try_get("next_run_at").context("decode next_run_at")?;

        match state_str.as_str() {
            "RETRY_SCHEDULED" => Ok(NackOutcome::RetryScheduled {
                attempt,
                max_attempts: self.cfg.max_retries,
                next_run_at,
            }),
            _ => Ok(NackOutcome::FailedTerminal { attempts: attempt }),
        }
    }

    async fn release(&self, job_id: Uuid) -> Result<(), QueueError> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            update swd_jobs
               set state = 'WAITING', leased_by = null, leased_at = null
             where job_id = $1
               and state = 'ACTIVE'
            returning job_id
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .context("release failed")?;

        match row {
            Some(_) => Ok(()),
            None => Err(QueueError::NotActive(job_id)),
        }
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "select state, count(*)::bigint from swd_jobs group by state",
        )
        .fetch_all(&self.pool)
        .await
        .context("depth query failed")?;

        let mut depth = QueueDepth::default();
        for (state, count) in rows {
            match JobState::parse(&state) {
                Some(JobState::Waiting) => depth.waiting = count as u64,
                Some(JobState::Active) => depth.active = count as u64,
                Some(JobState::RetryScheduled) => depth.retrying = count as u64,
                Some(JobState::FailedTerminal) => depth.failed = count as u64,
                _ => {}
            }
        }
        Ok(depth)
    }
}
