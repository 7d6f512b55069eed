//! Shared runtime state for swd-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum; everything inside
//! provides its own interior synchronization.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use chrono::Duration as ChronoDuration;
use tokio::sync::watch;
use uuid::Uuid;

use swd_bus::EventBus;
use swd_clock::SharedClock;
use swd_config::EngineConfig;
use swd_queue::JobQueue;
use swd_store::{IdempotencyStore, OrderRepository, RateLimiter};

/// Concurrent stream subscriptions allowed per (order, client IP).
pub const SUBSCRIPTION_CAP: u32 = 3;

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

pub struct AppState {
    pub cfg: EngineConfig,
    pub clock: SharedClock,
    pub repo: Arc<dyn OrderRepository>,
    pub queue: Arc<dyn JobQueue>,
    pub bus: EventBus,
    pub idempotency: IdempotencyStore,
    pub limiter: RateLimiter,
    pub subscriptions: Arc<SubscriptionRegistry>,
    /// Flips to `true` when the process is shutting down; long-lived
    /// streams watch it so graceful shutdown can drain them.
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    pub fn new(
        cfg: EngineConfig,
        clock: SharedClock,
        repo: Arc<dyn OrderRepository>,
        queue: Arc<dyn JobQueue>,
        bus: EventBus,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let limiter = RateLimiter::new(
            clock.clone(),
            cfg.rate_limit,
            ChronoDuration::seconds(60),
        );
        Self {
            idempotency: IdempotencyStore::new(clock.clone()),
            limiter,
            subscriptions: Arc::new(SubscriptionRegistry::new(SUBSCRIPTION_CAP)),
            cfg,
            clock,
            repo,
            queue,
            bus,
            shutdown,
        }
    }
}

// ---------------------------------------------------------------------------
// SubscriptionRegistry
// ---------------------------------------------------------------------------

/// Per-(order, IP) connection counter enforcing [`SUBSCRIPTION_CAP`].
pub struct SubscriptionRegistry {
    cap: u32,
    counts: Mutex<HashMap<(Uuid, IpAddr), u32>>,
}

impl SubscriptionRegistry {
    pub fn new(cap: u32) -> Self {
        Self {
            cap,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Claim a slot; `None` when the cap is already reached. The permit
    /// releases the slot on drop.
    pub fn try_acquire(
        self: &Arc<Self>,
        order_id: Uuid,
        ip: IpAddr,
    ) -> Option<SubscriptionPermit> {
        let mut counts = self.counts.lock().expect("registry lock poisoned");
        let count = counts.entry((order_id, ip)).or_insert(0);
        if *count >= self.cap {
            return None;
        }
        *count += 1;
        Some(SubscriptionPermit {
            registry: Arc::clone(self),
            key: (order_id, ip),
        })
    }

    pub fn active(&self, order_id: Uuid, ip: IpAddr) -> u32 {
        self.counts
            .lock()
            .expect("registry lock poisoned")
            .get(&(order_id, ip))
            .copied()
            .unwrap_or(0)
    }

    fn release(&self, key: (Uuid, IpAddr)) {
        let mut counts = self.counts.lock().expect("registry lock poisoned");
        if let Some(count) = counts.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&key);
            }
        }
    }
}

pub struct SubscriptionPermit {
    registry: Arc<SubscriptionRegistry>,
    key: (Uuid, IpAddr),
}

impl Drop for SubscriptionPermit {
    fn drop(&mut self) {
        self.registry.release(self.key);
    }
}
