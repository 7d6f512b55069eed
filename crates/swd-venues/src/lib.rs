//! Venue boundary: the contract the router executes against, plus the
//! deterministic simulator used in place of real venue connectivity.
//!
//! This crate defines **only** the venue trait, its error type and the
//! simulator. Routing decisions (which venue wins, slippage validation)
//! belong to `swd-router`; persistence and events never reach this layer.

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use swd_schemas::{ExecutionResult, Quote};

mod rng;
mod sim;

pub use rng::seeded_rng;
pub use sim::SimVenue;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors a venue may return. Both are transient from the engine's point of
/// view; the router decides retry policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VenueError {
    /// Network or transport failure.
    #[error("venue transport error: {0}")]
    Transport(String),
    /// The venue understood the request and refused it.
    #[error("venue rejected request: {0}")]
    Rejected(String),
}

// ---------------------------------------------------------------------------
// Venue trait
// ---------------------------------------------------------------------------

/// An execution provider. Implementations must be object-safe so the router
/// can hold `Arc<dyn Venue>` without knowing the concrete type, and
/// `Send + Sync` so quote fan-out can run concurrently.
///
/// Deadlines are the **caller's** job: the router wraps both operations in
/// hard timeouts (5 s quotes, 10 s execute); implementations just do the
/// work.
#[async_trait]
pub trait Venue: Send + Sync {
    /// Stable venue identifier (e.g. `"orca"`). Used as the map key in
    /// quote sets and as the tie-break ordering, so it must never change
    /// for a given venue.
    fn id(&self) -> &str;

    /// Price an exchange of `amount` `token_in` for `token_out`.
    async fn quote(
        &self,
        token_in: &str,
        token_out: &str,
        amount: Decimal,
    ) -> Result<Quote, VenueError>;

    /// Execute the exchange. `expected_price` and `slippage` are forwarded
    /// so a real venue could enforce its own bounds; the engine re-validates
    /// slippage on the result regardless.
    async fn execute(
        &self,
        token_in: &str,
        token_out: &str,
        amount: Decimal,
        expected_price: Decimal,
        slippage: Decimal,
    ) -> Result<ExecutionResult, VenueError>;
}

/// Default simulator pair used by the daemon when no venue wiring is
/// injected. Seeding with `Some(seed)` makes every quote and tx hash
/// reproducible across runs.
pub fn default_venues(seed: Option<u64>) -> Vec<std::sync::Arc<dyn Venue>> {
    let orca = SimVenue::new(
        "orca",
        "100.50".parse().expect("static decimal"),
        "0.002".parse().expect("static decimal"),
        seed.map(|s| s.wrapping_add(1)),
    );
    let raydium = SimVenue::new(
        "raydium",
        "100.00".parse().expect("static decimal"),
        "0.003".parse().expect("static decimal"),
        seed.map(|s| s.wrapping_add(2)),
    );
    vec![
        std::sync::Arc::new(orca) as std::sync::Arc<dyn Venue>,
        std::sync::Arc::new(raydium) as std::sync::Arc<dyn Venue>,
    ]
}
