//! Injected time source.
//!
//! Backoff schedules, TTLs, rate windows and visibility timeouts all read
//! time through [`Clock`] so scenario tests can drive them deterministically
//! with [`ManualClock`] instead of sleeping wall-clock seconds.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

/// A source of "now". Implementations must be cheap and thread-safe.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Shared handle used throughout the engine.
pub type SharedClock = Arc<dyn Clock>;

// ---------------------------------------------------------------------------
// SystemClock
// ---------------------------------------------------------------------------

/// Wall-clock time. The production clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Convenience constructor for the common `Arc<dyn Clock>` wiring.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

// ---------------------------------------------------------------------------
// ManualClock
// ---------------------------------------------------------------------------

/// Test clock that only moves when told to. Never goes backwards.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Starts at a fixed, arbitrary epoch. Tests that only care about
    /// relative time use this.
    pub fn fixed() -> Self {
        Self::new(
            "2025-01-01T00:00:00Z"
                .parse()
                .expect("static timestamp parses"),
        )
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now += by;
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance(Duration::seconds(secs));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock poisoned")
    }
}
