//! In-memory order repository. Default backend without `DATABASE_URL`, and
//! the one the deterministic scenario tests run against.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use swd_clock::{Clock, SharedClock};
use swd_schemas::{append_log_bounded, LogEntry, Order, OrderStatus};

use crate::repo::{OrderRepository, TransitionOutcome, TransitionPatch};

pub struct MemoryOrderRepository {
    clock: SharedClock,
    orders: Mutex<HashMap<Uuid, Order>>,
}

impl MemoryOrderRepository {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            orders: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.orders.lock().expect("repo lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl OrderRepository for MemoryOrderRepository {
    async fn create(&self, order: Order) -> Result<()> {
        let mut orders = self.orders.lock().expect("repo lock poisoned");
        if orders.contains_key(&order.id) {
            bail!("order {} already exists", order.id);
        }
        orders.insert(order.id, order);
        Ok(())
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<Order>> {
        let orders = self.orders.lock().expect("repo lock poisoned");
        Ok(orders.get(&id).cloned())
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: OrderStatus,
        to: OrderStatus,
        patch: TransitionPatch,
        log: LogEntry,
    ) -> Result<TransitionOutcome> {
        if !expected.can_transition_to(to) {
            bail!("illegal order transition: {expected} -> {to}");
        }

        let mut orders = self.orders.lock().expect("repo lock poisoned");
        let order = orders
            .get_mut(&id)
            .ok_or_else(|| anyhow!("unknown order {id}"))?;

        if order.status != expected {
            return Ok(TransitionOutcome::Conflict(order.status));
        }

        let now = bump(order.updated_at, self.clock.now());
        order.status = to;
        if let Some(quotes) = patch.quotes {
            order.quotes = quotes;
        }
        if let Some(dex_used) = patch.dex_used {
            order.dex_used = Some(dex_used);
        }
        if to == OrderStatus::Failed {
            order.tx_hash = None;
            order.failure_reason = patch.failure_reason;
        } else if let Some(tx_hash) = patch.tx_hash {
            order.tx_hash = Some(tx_hash);
        }
        if let Some(amount_out) = patch.amount_out {
            order.amount_out = Some(amount_out);
        }
        append_log_bounded(&mut order.logs, log, now);
        order.updated_at = now;

        Ok(TransitionOutcome::Applied(order.clone()))
    }

    async fn append_log(&self, id: Uuid, log: LogEntry) -> Result<()> {
        let mut orders = self.orders.lock().expect("repo lock poisoned");
        let order = orders
            .get_mut(&id)
            .ok_or_else(|| anyhow!("unknown order {id}"))?;
        let now = bump(order.updated_at, self.clock.now());
        append_log_bounded(&mut order.logs, log, now);
        order.updated_at = now;
        Ok(())
    }

    async fn stale_pending(&self, older_than: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let orders = self.orders.lock().expect("repo lock poisoned");
        Ok(orders
            .values()
            .filter(|o| o.status == OrderStatus::Pending && o.created_at <= older_than)
            .map(|o| o.id)
            .collect())
    }

    async fn healthy(&self) -> bool {
        true
    }
}

/// `updated_at` must be monotone non-decreasing even if the wall clock
/// steps backwards.
fn bump(prev: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    now.max(prev)
}
