//! Sliding-window rate limiter keyed by client IP.
//!
//! Trim, count and insert happen under one lock so two racing requests from
//! the same IP can never both squeeze through the last slot.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use swd_clock::{Clock, SharedClock};

/// What a rate check decided, with everything the HTTP layer needs for the
/// `X-RateLimit-*` and `Retry-After` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the oldest counted request leaves the window.
    pub reset_secs: u64,
}

pub struct RateLimiter {
    clock: SharedClock,
    limit: u32,
    window: Duration,
    buckets: Mutex<HashMap<IpAddr, VecDeque<DateTime<Utc>>>>,
}

impl RateLimiter {
    /// `limit` requests per sliding `window` (default: 30 per 60 s).
    pub fn new(clock: SharedClock, limit: u32, window: Duration) -> Self {
        Self {
            clock,
            limit,
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Count this request against `ip`'s window. Atomic
    /// trim-count-insert.
    pub fn check(&self, ip: IpAddr) -> RateDecision {
        self.decide(ip, true)
    }

    /// Read the current window without consuming a slot (header values on
    /// responses that never reached the rate-limit step).
    pub fn peek(&self, ip: IpAddr) -> RateDecision {
        self.decide(ip, false)
    }

    fn decide(&self, ip: IpAddr, consume: bool) -> RateDecision {
        let now = self.clock.now();
        let cutoff = now - self.window;
        let mut buckets = self.buckets.lock().expect("rate lock poisoned");
        let bucket = buckets.entry(ip).or_default();

        while bucket.front().is_some_and(|t| *t <= cutoff) {
            bucket.pop_front();
        }

        let used = bucket.len() as u32;
        let allowed = used < self.limit;
        if allowed && consume {
            bucket.push_back(now);
        }

        let used_after = bucket.len() as u32;
        let reset_secs = bucket
            .front()
            .map(|oldest| {
                let until = (*oldest + self.window) - now;
                until.num_seconds().max(0) as u64
            })
            .unwrap_or(0);

        RateDecision {
            allowed,
            limit: self.limit,
            remaining: self.limit.saturating_sub(used_after),
            reset_secs,
        }
    }
}
