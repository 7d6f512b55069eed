//! Idempotency store: short-TTL mapping `key → (body fingerprint, order id)`.
//!
//! The reservation is written set-if-absent **before** the order row exists,
//! with the freshly minted order id inside, so two simultaneous submissions
//! sharing a key can never both create rows: the loser reads the winner's
//! record in the same atomic step that would have reserved its own.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use swd_clock::{Clock, SharedClock};

/// Records live for five minutes; a replay after that is a fresh submission.
pub const IDEMPOTENCY_TTL_SECS: i64 = 300;

#[derive(Debug, Clone)]
struct IdemRecord {
    fingerprint: String,
    order_id: Uuid,
    created_at: DateTime<Utc>,
}

/// Outcome of an atomic reserve-if-absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// Key was free; the caller's order id is now recorded. Proceed to
    /// create the row.
    Fresh,
    /// Same key, same body fingerprint: return this order id, no new row,
    /// no enqueue.
    Replay(Uuid),
    /// Same key, different body: `idempotency_conflict`.
    Conflict,
}

pub struct IdempotencyStore {
    clock: SharedClock,
    ttl: Duration,
    entries: Mutex<HashMap<String, IdemRecord>>,
}

impl IdempotencyStore {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_ttl(clock, Duration::seconds(IDEMPOTENCY_TTL_SECS))
    }

    pub fn with_ttl(clock: SharedClock, ttl: Duration) -> Self {
        Self {
            clock,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Canonical body fingerprint: SHA-256 over the raw request bytes.
    pub fn fingerprint(body: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(body);
        hex::encode(hasher.finalize())
    }

    /// Atomic set-if-absent. Expired entries are purged on the way in, so a
    /// key reused after the TTL behaves as fresh.
    pub fn reserve(&self, key: &str, fingerprint: &str, order_id: Uuid) -> Reservation {
        let now = self.clock.now();
        let mut entries = self.entries.lock().expect("idempotency lock poisoned");
        entries.retain(|_, rec| rec.created_at + self.ttl > now);

        match entries.get(key) {
            Some(rec) if rec.fingerprint == fingerprint => Reservation::Replay(rec.order_id),
            Some(_) => Reservation::Conflict,
            None => {
                entries.insert(
                    key.to_string(),
                    IdemRecord {
                        fingerprint: fingerprint.to_string(),
                        order_id,
                        created_at: now,
                    },
                );
                Reservation::Fresh
            }
        }
    }

    /// Drop a reservation whose order row could not be created, so a later
    /// retry of the same key is not pinned to a ghost order id.
    pub fn release(&self, key: &str) {
        self.entries
            .lock()
            .expect("idempotency lock poisoned")
            .remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("idempotency lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
