//! Deterministic venue simulator.
//!
//! Design decisions (kept intentionally simple/deterministic):
//! - Quote price = base price ± a bounded basis-point jitter drawn from the
//!   venue's own RNG; fee is fixed per venue.
//! - Executed price = the same jittered model at half amplitude, unless a
//!   test pins it with [`SimVenue::set_executed_price`].
//! - Tx hashes are 32 RNG bytes, hex-encoded — stable under a fixed seed.
//! - Failures are scripted, not random: [`SimVenue::fail_next_quotes`] /
//!   [`SimVenue::fail_next_executes`] arm a countdown of transport errors,
//!   which is how the retry scenarios drive "fail twice, succeed third".

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::Rng;
use rust_decimal::Decimal;

use swd_schemas::{ExecutionResult, Quote};

use crate::rng::seeded_rng;
use crate::{Venue, VenueError};

#[derive(Debug, Default)]
struct FailurePlan {
    quote_failures: u32,
    execute_failures: u32,
}

/// In-memory venue with bounded latency, price variance and scriptable
/// failures.
pub struct SimVenue {
    id: String,
    base_price: Decimal,
    fee: Decimal,
    variance_bps: i64,
    latency: Duration,
    rng: Mutex<StdRng>,
    plan: Mutex<FailurePlan>,
    executed_price: Mutex<Option<Decimal>>,
}

impl SimVenue {
    pub fn new(id: impl Into<String>, base_price: Decimal, fee: Decimal, seed: Option<u64>) -> Self {
        Self {
            id: id.into(),
            base_price,
            fee,
            variance_bps: 30,
            latency: Duration::from_millis(10),
            rng: Mutex::new(seeded_rng(seed)),
            plan: Mutex::new(FailurePlan::default()),
            executed_price: Mutex::new(None),
        }
    }

    /// Quote jitter amplitude in basis points (default 30).
    pub fn with_variance_bps(mut self, bps: i64) -> Self {
        self.variance_bps = bps;
        self
    }

    /// Simulated per-call latency (default 10 ms). Zero disables the sleep.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Arm `n` consecutive quote transport failures.
    pub fn fail_next_quotes(&self, n: u32) {
        self.plan.lock().expect("plan lock").quote_failures = n;
    }

    /// Arm `n` consecutive execute transport failures.
    pub fn fail_next_executes(&self, n: u32) {
        self.plan.lock().expect("plan lock").execute_failures = n;
    }

    /// Pin the executed price (slippage-violation scenarios).
    pub fn set_executed_price(&self, price: Decimal) {
        *self.executed_price.lock().expect("price lock") = Some(price);
    }

    fn jittered(&self, base: Decimal, amplitude_bps: i64) -> Decimal {
        let bps = if amplitude_bps == 0 {
            0
        } else {
            self.rng
                .lock()
                .expect("rng lock")
                .gen_range(-amplitude_bps..=amplitude_bps)
        };
        base * Decimal::from(10_000 + bps) / Decimal::from(10_000)
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl Venue for SimVenue {
    fn id(&self) -> &str {
        &self.id
    }

    async fn quote(
        &self,
        _token_in: &str,
        _token_out: &str,
        _amount: Decimal,
    ) -> Result<Quote, VenueError> {
        self.simulate_latency().await;

        {
            let mut plan = self.plan.lock().expect("plan lock");
            if plan.quote_failures > 0 {
                plan.quote_failures -= 1;
                return Err(VenueError::Transport(format!(
                    "{}: simulated quote outage",
                    self.id
                )));
            }
        }

        Ok(Quote {
            price: self.jittered(self.base_price, self.variance_bps),
            fee: self.fee,
        })
    }

    async fn execute(
        &self,
        _token_in: &str,
        _token_out: &str,
        _amount: Decimal,
        expected_price: Decimal,
        _slippage: Decimal,
    ) -> Result<ExecutionResult, VenueError> {
        self.simulate_latency().await;

        {
            let mut plan = self.plan.lock().expect("plan lock");
            if plan.execute_failures > 0 {
                plan.execute_failures -= 1;
                return Err(VenueError::Transport(format!(
                    "{}: simulated execute outage",
                    self.id
                )));
            }
        }

        let executed_price = match *self.executed_price.lock().expect("price lock") {
            Some(p) => p,
            // Fills land near the expected price: half the quote amplitude.
            None => self.jittered(expected_price, self.variance_bps / 2),
        };

        let mut bytes = [0u8; 32];
        self.rng.lock().expect("rng lock").fill(&mut bytes[..]);

        Ok(ExecutionResult {
            tx_hash: format!("0x{}", hex::encode(bytes)),
            executed_price,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
