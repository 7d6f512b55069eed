//! Router: deterministic execution boundary between the worker and the
//! venue adapters.
//!
//! # Purpose
//! All quote and execution traffic passes through this thin layer. It fans a
//! quote request out to every venue concurrently, picks the best net-of-fee
//! price, executes against the winner and validates slippage — nothing else.
//!
//! # Why it must remain thin
//! - No persistence, no event bus, no retry policy; those belong to the
//!   worker and the queue. Errors propagate upward as typed failures.
//! - All price arithmetic is `Decimal`. No binary floats on the decision
//!   surface: two quotes that differ in the 9th fractional digit must stay
//!   distinguishable.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use rust_decimal::Decimal;
use thiserror::Error;

use swd_schemas::{ExecutionResult, Quote};
use swd_venues::{Venue, VenueError};

/// Hard wall-clock deadline for the whole quote fan-out.
pub const QUOTE_DEADLINE: Duration = Duration::from_secs(5);
/// Hard wall-clock deadline for a single execution call.
pub const EXECUTE_DEADLINE: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// RouterError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RouterError {
    /// No venue returned a quote inside the deadline.
    #[error("quote_unavailable: no venue returned a quote")]
    QuoteUnavailable,

    /// The selected venue id is not wired into this router.
    #[error("unknown venue: {0}")]
    UnknownVenue(String),

    /// A venue call exceeded its hard deadline.
    #[error("venue {venue} timed out during {op}")]
    VenueTimeout { venue: String, op: &'static str },

    /// A venue call failed outright.
    #[error("venue {venue} failed: {source}")]
    VenueFailure {
        venue: String,
        #[source]
        source: VenueError,
    },

    /// Executed price deviated beyond the client's tolerance.
    #[error("slippage exceeded: expected {expected}, executed {actual}, max {max}")]
    SlippageExceeded {
        expected: Decimal,
        actual: Decimal,
        max: Decimal,
    },
}

impl RouterError {
    /// Whether the failure is worth a queue-scheduled retry. Slippage
    /// violations and mis-wiring are final; everything else is transient.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            RouterError::SlippageExceeded { .. } | RouterError::UnknownVenue(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub struct Router {
    venues: Vec<Arc<dyn Venue>>,
    quote_deadline: Duration,
    execute_deadline: Duration,
}

impl Router {
    pub fn new(venues: Vec<Arc<dyn Venue>>) -> Self {
        Self {
            venues,
            quote_deadline: QUOTE_DEADLINE,
            execute_deadline: EXECUTE_DEADLINE,
        }
    }

    /// Override the hard deadlines (scenario tests).
    pub fn with_deadlines(mut self, quote: Duration, execute: Duration) -> Self {
        self.quote_deadline = quote;
        self.execute_deadline = execute;
        self
    }

    /// Fan a quote request out to every venue concurrently under one hard
    /// deadline. Venues that fail or time out are omitted; the call only
    /// fails when **no** venue answered.
    pub async fn quotes(
        &self,
        token_in: &str,
        token_out: &str,
        amount: Decimal,
    ) -> Result<BTreeMap<String, Quote>, RouterError> {
        let calls = self.venues.iter().map(|v| {
            let venue = Arc::clone(v);
            async move {
                let id = venue.id().to_string();
                let res =
                    tokio::time::timeout(self.quote_deadline, venue.quote(token_in, token_out, amount))
                        .await;
                (id, res)
            }
        });

        let mut quotes = BTreeMap::new();
        for (id, res) in join_all(calls).await {
            if let Ok(Ok(quote)) = res {
                quotes.insert(id, quote);
            }
        }

        if quotes.is_empty() {
            return Err(RouterError::QuoteUnavailable);
        }
        Ok(quotes)
    }

    /// Pick the venue with the highest net-of-fee price
    /// (`price * (1 - fee)`, decimal arithmetic). Ties break toward the
    /// lexicographically smallest venue id, deterministically.
    pub fn select_best(
        quotes: &BTreeMap<String, Quote>,
    ) -> Result<(String, Decimal), RouterError> {
        let mut best: Option<(&str, Decimal)> = None;
        // BTreeMap iterates in key order, so a strict `>` keeps the
        // lexicographically smallest id on ties.
        for (id, quote) in quotes {
            let net = quote.net_price();
            match best {
                Some((_, best_net)) if net <= best_net => {}
                _ => best = Some((id, net)),
            }
        }
        best.map(|(id, net)| (id.to_string(), net))
            .ok_or(RouterError::QuoteUnavailable)
    }

    /// Execute against a specific venue under the execution deadline.
    pub async fn execute(
        &self,
        venue_id: &str,
        token_in: &str,
        token_out: &str,
        amount: Decimal,
        expected_price: Decimal,
        slippage: Decimal,
    ) -> Result<ExecutionResult, RouterError> {
        let venue = self
            .venues
            .iter()
            .find(|v| v.id() == venue_id)
            .ok_or_else(|| RouterError::UnknownVenue(venue_id.to_string()))?;

        let fut = venue.execute(token_in, token_out, amount, expected_price, slippage);
        match tokio::time::timeout(self.execute_deadline, fut).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(RouterError::VenueFailure {
                venue: venue_id.to_string(),
                source: err,
            }),
            Err(_) => Err(RouterError::VenueTimeout {
                venue: venue_id.to_string(),
                op: "execute",
            }),
        }
    }

    /// Relative-deviation slippage check:
    /// passes iff `|expected − actual| / expected ≤ max_slippage`.
    pub fn check_slippage(expected: Decimal, actual: Decimal, max_slippage: Decimal) -> bool {
        if expected <= Decimal::ZERO {
            return false;
        }
        let deviation = (expected - actual).abs() / expected;
        deviation <= max_slippage
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Scriptable venue for router tests.
    struct StubVenue {
        id: &'static str,
        behavior: StubBehavior,
    }

    enum StubBehavior {
        Quote(Quote),
        Fail,
        /// Never answers; exercises the deadline path.
        Hang,
        Execute(ExecutionResult),
    }

    #[async_trait]
    impl Venue for StubVenue {
        fn id(&self) -> &str {
            self.id
        }

        async fn quote(
            &self,
            _token_in: &str,
            _token_out: &str,
            _amount: Decimal,
        ) -> Result<Quote, VenueError> {
            match &self.behavior {
                StubBehavior::Quote(q) => Ok(*q),
                StubBehavior::Fail => Err(VenueError::Transport("stub down".into())),
                StubBehavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!("hung venue must be cut off by the deadline")
                }
                StubBehavior::Execute(_) => Err(VenueError::Rejected("no quotes here".into())),
            }
        }

        async fn execute(
            &self,
            _token_in: &str,
            _token_out: &str,
            _amount: Decimal,
            _expected_price: Decimal,
            _slippage: Decimal,
        ) -> Result<ExecutionResult, VenueError> {
            match &self.behavior {
                StubBehavior::Execute(r) => Ok(r.clone()),
                StubBehavior::Fail => Err(VenueError::Transport("stub down".into())),
                StubBehavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!("hung venue must be cut off by the deadline")
                }
                StubBehavior::Quote(_) => Err(VenueError::Rejected("quote-only stub".into())),
            }
        }
    }

    fn quote(price: &str, fee: &str) -> Quote {
        Quote {
            price: price.parse().unwrap(),
            fee: fee.parse().unwrap(),
        }
    }

    fn stub(id: &'static str, behavior: StubBehavior) -> Arc<dyn Venue> {
        Arc::new(StubVenue { id, behavior })
    }

    #[tokio::test]
    async fn quotes_collects_every_healthy_venue() {
        let router = Router::new(vec![
            stub("a", StubBehavior::Quote(quote("100", "0.003"))),
            stub("b", StubBehavior::Quote(quote("100.5", "0.002"))),
        ]);
        let quotes = router.quotes("SOL", "USDC", Decimal::ONE).await.unwrap();
        assert_eq!(quotes.len(), 2);
        assert_eq!(quotes["a"].price, "100".parse::<Decimal>().unwrap());
    }

    #[tokio::test]
    async fn failing_venue_is_omitted_not_fatal() {
        let router = Router::new(vec![
            stub("a", StubBehavior::Fail),
            stub("b", StubBehavior::Quote(quote("99", "0.001"))),
        ]);
        let quotes = router.quotes("SOL", "USDC", Decimal::ONE).await.unwrap();
        assert_eq!(quotes.len(), 1);
        assert!(quotes.contains_key("b"));
    }

    #[tokio::test]
    async fn all_venues_failing_is_quote_unavailable() {
        let router = Router::new(vec![
            stub("a", StubBehavior::Fail),
            stub("b", StubBehavior::Fail),
        ]);
        let err = router.quotes("SOL", "USDC", Decimal::ONE).await.unwrap_err();
        assert!(matches!(err, RouterError::QuoteUnavailable));
        assert!(err.is_retriable());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_venue_is_cut_off_by_the_quote_deadline() {
        let router = Router::new(vec![
            stub("slow", StubBehavior::Hang),
            stub("fast", StubBehavior::Quote(quote("100", "0.001"))),
        ]);
        let quotes = router.quotes("SOL", "USDC", Decimal::ONE).await.unwrap();
        assert_eq!(quotes.len(), 1);
        assert!(quotes.contains_key("fast"));
    }

    #[test]
    fn select_best_picks_highest_net_of_fee_price() {
        // A nets 100 * 0.997 = 99.7; B nets 100.5 * 0.998 = 100.299.
        let mut quotes = BTreeMap::new();
        quotes.insert("a".to_string(), quote("100", "0.003"));
        quotes.insert("b".to_string(), quote("100.5", "0.002"));
        let (venue, net) = Router::select_best(&quotes).unwrap();
        assert_eq!(venue, "b");
        assert_eq!(net, "100.299".parse::<Decimal>().unwrap());
    }

    #[test]
    fn select_best_breaks_ties_lexicographically() {
        let mut quotes = BTreeMap::new();
        quotes.insert("raydium".to_string(), quote("100", "0.002"));
        quotes.insert("orca".to_string(), quote("100", "0.002"));
        let (venue, _) = Router::select_best(&quotes).unwrap();
        assert_eq!(venue, "orca");
    }

    #[test]
    fn select_best_requires_at_least_one_quote() {
        let err = Router::select_best(&BTreeMap::new()).unwrap_err();
        assert!(matches!(err, RouterError::QuoteUnavailable));
    }

    #[tokio::test]
    async fn execute_delegates_to_the_named_venue() {
        let router = Router::new(vec![stub(
            "b",
            StubBehavior::Execute(ExecutionResult {
                tx_hash: "0xfeed".into(),
                executed_price: "100.2".parse().unwrap(),
            }),
        )]);
        let res = router
            .execute(
                "b",
                "SOL",
                "USDC",
                Decimal::ONE,
                "100.299".parse().unwrap(),
                "0.05".parse().unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.tx_hash, "0xfeed");
    }

    #[tokio::test]
    async fn execute_against_unknown_venue_is_non_retriable() {
        let router = Router::new(vec![]);
        let err = router
            .execute(
                "ghost",
                "SOL",
                "USDC",
                Decimal::ONE,
                "100".parse().unwrap(),
                "0.01".parse().unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::UnknownVenue(_)));
        assert!(!err.is_retriable());
    }

    #[tokio::test(start_paused = true)]
    async fn execute_deadline_produces_retriable_timeout() {
        let router = Router::new(vec![stub("slow", StubBehavior::Hang)]);
        let err = router
            .execute(
                "slow",
                "SOL",
                "USDC",
                Decimal::ONE,
                "100".parse().unwrap(),
                "0.01".parse().unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::VenueTimeout { .. }));
        assert!(err.is_retriable());
    }

    #[test]
    fn slippage_within_tolerance_passes() {
        // |100.5 − 100.2| / 100.5 ≈ 0.002985 ≤ 0.05
        assert!(Router::check_slippage(
            "100.5".parse().unwrap(),
            "100.2".parse().unwrap(),
            "0.05".parse().unwrap(),
        ));
    }

    #[test]
    fn slippage_beyond_tolerance_fails() {
        // |100 − 95| / 100 = 0.05 > 0.001
        assert!(!Router::check_slippage(
            "100".parse().unwrap(),
            "95".parse().unwrap(),
            "0.001".parse().unwrap(),
        ));
    }

    #[test]
    fn slippage_exact_boundary_passes() {
        assert!(Router::check_slippage(
            "100".parse().unwrap(),
            "95".parse().unwrap(),
            "0.05".parse().unwrap(),
        ));
    }

    #[test]
    fn slippage_is_symmetric_around_expected() {
        assert!(Router::check_slippage(
            "100".parse().unwrap(),
            "104".parse().unwrap(),
            "0.05".parse().unwrap(),
        ));
        assert!(!Router::check_slippage(
            "100".parse().unwrap(),
            "106".parse().unwrap(),
            "0.05".parse().unwrap(),
        ));
    }

    #[test]
    fn slippage_classified_non_retriable() {
        let err = RouterError::SlippageExceeded {
            expected: "100".parse().unwrap(),
            actual: "95".parse().unwrap(),
            max: "0.001".parse().unwrap(),
        };
        assert!(!err.is_retriable());
    }
}
