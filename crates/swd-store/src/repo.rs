//! Order repository contract.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use uuid::Uuid;

use swd_schemas::{LogEntry, Order, OrderStatus};

/// Stage-specific fields carried along with a status transition. Only the
/// fields a stage produces are set; everything else stays untouched.
#[derive(Debug, Clone, Default)]
pub struct TransitionPatch {
    pub quotes: Option<BTreeMap<String, String>>,
    pub dex_used: Option<String>,
    pub tx_hash: Option<String>,
    pub amount_out: Option<Decimal>,
    pub failure_reason: Option<String>,
}

/// Result of a conditional transition.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// The row moved; here is its new state.
    Applied(Order),
    /// The row was not in the expected status. Carries what it actually was
    /// — under at-least-once delivery this means a duplicate; callers
    /// re-read and resume.
    Conflict(OrderStatus),
}

/// Persistence contract for order rows.
///
/// Writers: the admission pipeline (creation) and the worker driving the
/// order's job (transitions). The subscription service only reads.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn create(&self, order: Order) -> Result<()>;

    async fn fetch(&self, id: Uuid) -> Result<Option<Order>>;

    /// Conditional status transition, in one atomic write:
    /// `set status = to where id = ? and status = expected`, applying the
    /// patch and appending the log entry (bounded at
    /// [`swd_schemas::LOG_CAP`]). Illegal edges
    /// (`!expected.can_transition_to(to)`) are programmer errors and return
    /// `Err`; a row in a different status returns
    /// [`TransitionOutcome::Conflict`].
    ///
    /// Two invariants are enforced here, not trusted to callers:
    /// `tx_hash` is cleared on entry to `failed`, and `failure_reason` is
    /// only ever written on entry to `failed`.
    async fn transition(
        &self,
        id: Uuid,
        expected: OrderStatus,
        to: OrderStatus,
        patch: TransitionPatch,
        log: LogEntry,
    ) -> Result<TransitionOutcome>;

    /// Append an observability log entry (retry attempts) without touching
    /// status. Atomic with the `updated_at` bump.
    async fn append_log(&self, id: Uuid, log: LogEntry) -> Result<()>;

    /// Pending orders created at or before `older_than` — the janitor
    /// re-enqueues these after an enqueue-after-create failure.
    async fn stale_pending(&self, older_than: DateTime<Utc>) -> Result<Vec<Uuid>>;

    /// Dependency health for `GET /health`.
    async fn healthy(&self) -> bool;
}
