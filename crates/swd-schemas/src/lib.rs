//! Shared domain and wire types for the SwapDesk execution engine.
//!
//! Everything here is plain data: serde-serializable structs and enums used
//! across the admission edge, the queue, the worker and the subscription
//! stream. Decimal amounts ride the wire as strings to preserve precision;
//! all arithmetic on them happens in `rust_decimal::Decimal`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// OrderStatus
// ---------------------------------------------------------------------------

/// Lifecycle states of an order.
///
/// The legal transition graph is a straight line with a single failure sink:
///
/// ```text
/// pending → routing → building → submitted → confirmed
///     └────────┴─────────┴───────────┴──────────────────▶ failed
/// ```
///
/// `confirmed` and `failed` are terminal. [`OrderStatus::can_transition_to`]
/// is the single source of truth for legality; repositories reject any edge
/// it does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Routing,
    Building,
    Submitted,
    Confirmed,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Routing => "routing",
            OrderStatus::Building => "building",
            OrderStatus::Submitted => "submitted",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "routing" => Some(OrderStatus::Routing),
            "building" => Some(OrderStatus::Building),
            "submitted" => Some(OrderStatus::Submitted),
            "confirmed" => Some(OrderStatus::Confirmed),
            "failed" => Some(OrderStatus::Failed),
            _ => None,
        }
    }

    /// Returns `true` if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Confirmed | OrderStatus::Failed)
    }

    /// Legal-transition table. Any edge not listed here is a programmer
    /// error and must be rejected by the repository.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Routing)
                | (Routing, Building)
                | (Building, Submitted)
                | (Submitted, Confirmed)
                | (Pending, Failed)
                | (Routing, Failed)
                | (Building, Failed)
                | (Submitted, Failed)
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// OrderKind
// ---------------------------------------------------------------------------

/// Order type. Only immediate-execution market orders exist today; the enum
/// keeps the wire format forward-compatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Market,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Market => "market",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "market" => Some(OrderKind::Market),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// LogEntry
// ---------------------------------------------------------------------------

/// Maximum number of log entries retained per order. Older entries are
/// truncated, keeping a single marker entry at the head.
pub const LOG_CAP: usize = 100;

/// One append-only lifecycle log entry. `fields` carries stage-specific data
/// (quotes for routing, txHash for submitted, reason+attempt for failed) and
/// is flattened into the wire object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub stage: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

impl LogEntry {
    pub fn new(stage: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            stage: stage.into(),
            timestamp,
            fields: serde_json::Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Marker entry left at the head of a truncated log.
    pub fn truncation_marker(timestamp: DateTime<Utc>) -> Self {
        Self::new("truncated", timestamp)
    }
}

/// Append `entry` to `logs`, enforcing [`LOG_CAP`]. When the cap is
/// exceeded the oldest entries are dropped and a `truncated` marker is kept
/// at index 0, so the resulting length never exceeds `LOG_CAP`.
pub fn append_log_bounded(logs: &mut Vec<LogEntry>, entry: LogEntry, now: DateTime<Utc>) {
    logs.push(entry);
    if logs.len() > LOG_CAP {
        let excess = logs.len() - LOG_CAP;
        // Remove the overflow plus one more slot for the marker itself.
        logs.drain(0..=excess);
        logs.insert(0, LogEntry::truncation_marker(now));
    }
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

/// A persisted order row.
///
/// Single writer is the worker driving its job (plus the admission pipeline
/// at creation); the subscription service only reads. `tx_hash` is set iff
/// status ∈ {submitted, confirmed}; `failure_reason` iff failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: OrderKind,
    pub token_in: String,
    pub token_out: String,
    pub amount_in: Decimal,
    pub slippage: Decimal,
    pub status: OrderStatus,
    pub amount_out: Option<Decimal>,
    pub dex_used: Option<String>,
    pub tx_hash: Option<String>,
    pub failure_reason: Option<String>,
    /// Last observed net-of-fee price per venue, as decimal strings.
    /// Observability only; never used for settlement arithmetic.
    pub quotes: BTreeMap<String, String>,
    pub logs: Vec<LogEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Fresh `pending` order with its initial log entry.
    pub fn new(
        id: Uuid,
        kind: OrderKind,
        token_in: impl Into<String>,
        token_out: impl Into<String>,
        amount_in: Decimal,
        slippage: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            kind,
            token_in: token_in.into(),
            token_out: token_out.into(),
            amount_in,
            slippage,
            status: OrderStatus::Pending,
            amount_out: None,
            dex_used: None,
            tx_hash: None,
            failure_reason: None,
            quotes: BTreeMap::new(),
            logs: vec![LogEntry::new("pending", now)],
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// ExecuteRequest (wire)
// ---------------------------------------------------------------------------

/// Raw `POST /orders/execute` body. Fields stay strings here; the admission
/// pipeline parses and validates them into typed values and reports
/// per-field errors on the originals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub token_in: String,
    pub token_out: String,
    pub amount: String,
    pub slippage: String,
}

// ---------------------------------------------------------------------------
// Venue wire types
// ---------------------------------------------------------------------------

/// A venue's answer to a quote request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub price: Decimal,
    /// Fee as a fraction of notional (e.g. 0.003 = 30 bps).
    pub fee: Decimal,
}

impl Quote {
    /// Net-of-fee price: `price * (1 - fee)`.
    pub fn net_price(&self) -> Decimal {
        self.price * (Decimal::ONE - self.fee)
    }
}

/// Result of executing against a venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub tx_hash: String,
    pub executed_price: Decimal,
}

// ---------------------------------------------------------------------------
// OrderEvent (bus)
// ---------------------------------------------------------------------------

/// Retry metadata carried on a `retry_scheduled` bus event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryInfo {
    pub attempt: u32,
    pub max_attempts: u32,
    pub next_run_at: DateTime<Utc>,
}

/// One message on an order's bus topic. Every event reflects a state that is
/// already persisted (or, for retries, a schedule already recorded by the
/// queue); the bus is best-effort and the database remains authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEvent {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quotes: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dex_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_out: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryInfo>,
}

impl OrderEvent {
    pub fn status_change(order: &Order) -> Self {
        Self {
            order_id: order.id,
            status: order.status,
            timestamp: order.updated_at,
            quotes: if order.quotes.is_empty() {
                None
            } else {
                Some(order.quotes.clone())
            },
            dex_used: order.dex_used.clone(),
            tx_hash: order.tx_hash.clone(),
            amount_out: order.amount_out,
            failure_reason: order.failure_reason.clone(),
            retry: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Stream messages (server → client)
// ---------------------------------------------------------------------------

/// Key order attributes included in the backfill message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAttrs {
    pub token_in: String,
    pub token_out: String,
    pub amount_in: Decimal,
    pub amount_out: Option<Decimal>,
    pub dex_used: Option<String>,
    pub tx_hash: Option<String>,
    pub failure_reason: Option<String>,
}

impl From<&Order> for OrderAttrs {
    fn from(o: &Order) -> Self {
        Self {
            token_in: o.token_in.clone(),
            token_out: o.token_out.clone(),
            amount_in: o.amount_in,
            amount_out: o.amount_out,
            dex_used: o.dex_used.clone(),
            tx_hash: o.tx_hash.clone(),
            failure_reason: o.failure_reason.clone(),
        }
    }
}

/// Initial stream message: the persisted order state at subscription time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillMsg {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub logs: Vec<LogEntry>,
    pub order: OrderAttrs,
    pub timestamp: DateTime<Utc>,
}

/// Stream-level error message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamErrorMsg {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Messages delivered on the subscription stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMsg {
    Backfill(BackfillMsg),
    StatusUpdate(OrderEvent),
    Error(StreamErrorMsg),
}

impl StreamMsg {
    pub fn backfill(order: &Order, now: DateTime<Utc>) -> Self {
        StreamMsg::Backfill(BackfillMsg {
            order_id: order.id,
            status: order.status,
            logs: order.logs.clone(),
            order: OrderAttrs::from(order),
            timestamp: now,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        "2025-01-01T00:00:00Z".parse().unwrap()
    }

    #[test]
    fn happy_path_transitions_are_legal() {
        use OrderStatus::*;
        for (from, to) in [
            (Pending, Routing),
            (Routing, Building),
            (Building, Submitted),
            (Submitted, Confirmed),
        ] {
            assert!(from.can_transition_to(to), "{from} -> {to} must be legal");
        }
    }

    #[test]
    fn every_non_terminal_state_may_fail() {
        use OrderStatus::*;
        for from in [Pending, Routing, Building, Submitted] {
            assert!(from.can_transition_to(Failed), "{from} -> failed");
        }
    }

    #[test]
    fn status_never_regresses_or_skips() {
        use OrderStatus::*;
        assert!(!Routing.can_transition_to(Pending));
        assert!(!Building.can_transition_to(Routing));
        assert!(!Pending.can_transition_to(Building));
        assert!(!Pending.can_transition_to(Confirmed));
        assert!(!Confirmed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Routing));
        assert!(!Confirmed.can_transition_to(Confirmed));
    }

    #[test]
    fn terminal_states() {
        assert!(OrderStatus::Confirmed.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
        assert!(!OrderStatus::Submitted.is_terminal());
    }

    #[test]
    fn status_round_trips_through_strings() {
        use OrderStatus::*;
        for s in [Pending, Routing, Building, Submitted, Confirmed, Failed] {
            assert_eq!(OrderStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(OrderStatus::parse("cancelled"), None);
    }

    #[test]
    fn execute_request_parses_camel_case_wire_body() {
        let body = r#"{
            "type": "market",
            "tokenIn": "SOL",
            "tokenOut": "USDC",
            "amount": "1.5",
            "slippage": "0.01"
        }"#;
        let req: ExecuteRequest = serde_json::from_str(body).unwrap();
        assert_eq!(req.kind, "market");
        assert_eq!(req.token_in, "SOL");
        assert_eq!(req.amount, "1.5");
    }

    #[test]
    fn net_price_is_price_times_one_minus_fee() {
        let q = Quote {
            price: "100.5".parse().unwrap(),
            fee: "0.002".parse().unwrap(),
        };
        assert_eq!(q.net_price(), "100.299".parse::<Decimal>().unwrap());
    }

    #[test]
    fn order_event_serializes_with_snake_case_status_and_camel_fields() {
        let ev = OrderEvent {
            order_id: Uuid::nil(),
            status: OrderStatus::Submitted,
            timestamp: t0(),
            quotes: None,
            dex_used: Some("orca".into()),
            tx_hash: Some("0xabc".into()),
            amount_out: None,
            failure_reason: None,
            retry: None,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["status"], "submitted");
        assert_eq!(v["dexUsed"], "orca");
        assert_eq!(v["txHash"], "0xabc");
        assert!(v.get("amountOut").is_none(), "unset fields are omitted");
    }

    #[test]
    fn stream_msg_is_tagged_with_type() {
        let msg = StreamMsg::Error(StreamErrorMsg {
            message: "boom".into(),
            timestamp: t0(),
        });
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "error");
        assert_eq!(v["message"], "boom");

        let ev = OrderEvent {
            order_id: Uuid::nil(),
            status: OrderStatus::Routing,
            timestamp: t0(),
            quotes: None,
            dex_used: None,
            tx_hash: None,
            amount_out: None,
            failure_reason: None,
            retry: None,
        };
        let v = serde_json::to_value(&StreamMsg::StatusUpdate(ev)).unwrap();
        assert_eq!(v["type"], "status_update");
        assert_eq!(v["status"], "routing");
    }

    #[test]
    fn amounts_serialize_as_strings() {
        let q = Quote {
            price: "100.123456789".parse().unwrap(),
            fee: "0.003".parse().unwrap(),
        };
        let v = serde_json::to_value(&q).unwrap();
        assert_eq!(v["price"], "100.123456789");
    }

    #[test]
    fn log_append_under_cap_keeps_everything() {
        let mut logs = Vec::new();
        for i in 0..LOG_CAP {
            append_log_bounded(&mut logs, LogEntry::new(format!("s{i}"), t0()), t0());
        }
        assert_eq!(logs.len(), LOG_CAP);
        assert_eq!(logs[0].stage, "s0");
    }

    #[test]
    fn log_append_over_cap_truncates_with_marker() {
        let mut logs = Vec::new();
        for i in 0..(LOG_CAP + 5) {
            append_log_bounded(&mut logs, LogEntry::new(format!("s{i}"), t0()), t0());
        }
        assert_eq!(logs.len(), LOG_CAP);
        assert_eq!(logs[0].stage, "truncated");
        // Newest entry always survives.
        assert_eq!(logs.last().unwrap().stage, format!("s{}", LOG_CAP + 4));
        // Entries are still in chronological order after the marker.
        assert_eq!(logs[1].stage.cmp(&logs[2].stage), std::cmp::Ordering::Less);
    }

    #[test]
    fn new_order_starts_pending_with_initial_log() {
        let o = Order::new(
            Uuid::nil(),
            OrderKind::Market,
            "SOL",
            "USDC",
            "1".parse().unwrap(),
            "0.05".parse().unwrap(),
            t0(),
        );
        assert_eq!(o.status, OrderStatus::Pending);
        assert_eq!(o.logs.len(), 1);
        assert_eq!(o.logs[0].stage, "pending");
        assert!(o.tx_hash.is_none());
    }
}
