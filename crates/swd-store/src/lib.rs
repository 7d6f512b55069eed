//! Persistence layer: order repository (memory + Postgres), idempotency
//! store and rate limiter.
//!
//! This crate also owns the entire database schema — the embedded sqlx
//! migrations create both `swd_orders` and `swd_jobs` (the latter is driven
//! by `swd-queue`'s Postgres backend), so there is exactly one migration
//! history for the whole engine.

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

mod idempotency;
mod memory;
mod pg;
mod rate_limit;
mod repo;

pub use idempotency::{IdempotencyStore, Reservation, IDEMPOTENCY_TTL_SECS};
pub use memory::MemoryOrderRepository;
pub use pg::PgOrderRepository;
pub use rate_limit::{RateDecision, RateLimiter};
pub use repo::{OrderRepository, TransitionOutcome, TransitionPatch};

pub const ENV_DB_URL: &str = "DATABASE_URL";

/// Connect to Postgres.
pub async fn connect(url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Connect using `DATABASE_URL`.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}
