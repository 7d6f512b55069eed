//! In-process scenario tests for the admission pipeline.
//!
//! These drive the Axum router without binding a TCP socket, via
//! `tower::ServiceExt::oneshot`. The client address is injected through the
//! `ConnectInfo` request extension.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Request, StatusCode};
use futures_util::future::join_all;
use http_body_util::BodyExt;
use tokio::sync::watch;
use tower::ServiceExt; // oneshot

use swd_bus::EventBus;
use swd_clock::{ManualClock, SharedClock};
use swd_config::EngineConfig;
use swd_daemon::{routes, state::AppState};
use swd_queue::{JobQueue, MemoryQueue, QueueConfig};
use swd_schemas::ExecuteRequest;
use swd_store::{MemoryOrderRepository, OrderRepository};

const BODY: &str =
    r#"{"type":"market","tokenIn":"SOL","tokenOut":"USDC","amount":"1.0","slippage":"0.05"}"#;

struct Harness {
    clock: Arc<ManualClock>,
    repo: Arc<MemoryOrderRepository>,
    queue: Arc<MemoryQueue>,
    state: Arc<AppState>,
    _shutdown_tx: watch::Sender<bool>,
}

fn harness() -> Harness {
    harness_with(EngineConfig::default())
}

fn harness_with(cfg: EngineConfig) -> Harness {
    let clock = Arc::new(ManualClock::fixed());
    let repo = Arc::new(MemoryOrderRepository::new(clock.clone()));
    let queue = Arc::new(MemoryQueue::new(clock.clone(), QueueConfig::default()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(AppState::new(
        cfg,
        clock.clone() as SharedClock,
        repo.clone() as Arc<dyn OrderRepository>,
        queue.clone() as Arc<dyn JobQueue>,
        EventBus::new(),
        shutdown_rx,
    ));
    Harness {
        clock,
        repo,
        queue,
        state,
        _shutdown_tx: shutdown_tx,
    }
}

async fn post(
    state: &Arc<AppState>,
    body: &str,
    idempotency_key: Option<&str>,
    ip: [u8; 4],
) -> (StatusCode, HeaderMap, serde_json::Value) {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/orders/execute")
        .header("content-type", "application/json");
    if let Some(key) = idempotency_key {
        builder = builder.header("Idempotency-Key", key);
    }
    let mut req = builder
        .body(axum::body::Body::from(body.to_string()))
        .unwrap();
    req.extensions_mut()
        .insert(ConnectInfo(SocketAddr::from((ip, 40000))));

    let resp = routes::build_router(state.clone())
        .oneshot(req)
        .await
        .expect("oneshot failed");
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, headers, json)
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn accepted_submission_creates_row_and_job() {
    let h = harness();
    let (status, headers, json) = post(&h.state, BODY, None, [127, 0, 0, 1]).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    let order_id: uuid::Uuid = json["orderId"].as_str().unwrap().parse().unwrap();

    let row = h.repo.fetch(order_id).await.unwrap().expect("row created");
    assert_eq!(row.status, swd_schemas::OrderStatus::Pending);
    assert_eq!(h.queue.depth().await.unwrap().waiting, 1);

    assert_eq!(headers["X-RateLimit-Limit"], "30");
    assert_eq!(headers["X-RateLimit-Remaining"], "29");
    assert!(headers.contains_key("X-RateLimit-Reset"));
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalid_body_is_rejected_with_field_errors() {
    let h = harness();
    let bad =
        r#"{"type":"market","tokenIn":"SOL","tokenOut":"SOL","amount":"-1","slippage":"0.9"}"#;
    let (status, headers, json) = post(&h.state, bad, None, [127, 0, 0, 1]).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "invalid_body");
    let fields = json["fields"].as_array().unwrap();
    assert!(fields.len() >= 3, "tokenOut, amount, slippage all flagged");

    assert!(h.repo.is_empty(), "no row for a rejected body");
    assert_eq!(h.queue.depth().await.unwrap().waiting, 0);
    // Rate headers ride on every response, and validation failures do not
    // consume quota.
    assert_eq!(headers["X-RateLimit-Remaining"], "30");
}

#[tokio::test]
async fn malformed_json_is_invalid_body() {
    let h = harness();
    let (status, _headers, json) = post(&h.state, "{not json", None, [127, 0, 0, 1]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "invalid_body");
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rate_limit_rejects_the_n_plus_first_within_the_window() {
    let h = harness_with(EngineConfig {
        rate_limit: 2,
        ..EngineConfig::default()
    });

    for _ in 0..2 {
        let (status, _, _) = post(&h.state, BODY, None, [10, 0, 0, 7]).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, headers, json) = post(&h.state, BODY, None, [10, 0, 0, 7]).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json["error"], "rate_limited");
    assert!(json["retryAfter"].as_u64().unwrap() > 0);
    assert!(headers.contains_key("Retry-After"));
    assert_eq!(headers["X-RateLimit-Remaining"], "0");

    // Another IP is unaffected; the window eventually slides.
    let (status, _, _) = post(&h.state, BODY, None, [10, 0, 0, 8]).await;
    assert_eq!(status, StatusCode::OK);
    h.clock.advance_secs(61);
    let (status, _, _) = post(&h.state, BODY, None, [10, 0, 0, 7]).await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(h.repo.len(), 4, "only accepted submissions created rows");
}

// ---------------------------------------------------------------------------
// Backpressure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn saturated_queue_sheds_load() {
    let h = harness_with(EngineConfig {
        queue_waiting_limit: 1,
        ..EngineConfig::default()
    });

    for _ in 0..2 {
        h.queue
            .enqueue(uuid::Uuid::new_v4(), request())
            .await
            .unwrap();
    }

    let (status, headers, json) = post(&h.state, BODY, None, [127, 0, 0, 1]).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json["error"], "queue_full");
    assert_eq!(headers["Retry-After"], "5");
    assert!(h.repo.is_empty(), "no row under backpressure");
}

// ---------------------------------------------------------------------------
// Idempotency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_replays_share_one_order_and_one_job() {
    let h = harness();

    let calls = (0..5).map(|_| post(&h.state, BODY, Some("key-1"), [127, 0, 0, 1]));
    let results = join_all(calls).await;

    let mut order_ids = std::collections::BTreeSet::new();
    for (status, _, json) in &results {
        assert_eq!(*status, StatusCode::OK);
        assert_eq!(json["success"], true);
        order_ids.insert(json["orderId"].as_str().unwrap().to_string());
    }
    assert_eq!(order_ids.len(), 1, "every response carries the same orderId");
    assert_eq!(h.repo.len(), 1, "exactly one row");
    assert_eq!(h.queue.depth().await.unwrap().waiting, 1, "exactly one job");
}

#[tokio::test]
async fn same_key_different_body_conflicts() {
    let h = harness();

    let (status, _, first) = post(&h.state, BODY, Some("key-2"), [127, 0, 0, 1]).await;
    assert_eq!(status, StatusCode::OK);

    let other =
        r#"{"type":"market","tokenIn":"SOL","tokenOut":"USDC","amount":"2.0","slippage":"0.05"}"#;
    let (status, _, json) = post(&h.state, other, Some("key-2"), [127, 0, 0, 1]).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"], "idempotency_conflict");

    assert_eq!(h.repo.len(), 1, "no second row");

    // The original mapping still replays.
    let (status, _, replay) = post(&h.state, BODY, Some("key-2"), [127, 0, 0, 1]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replay["orderId"], first["orderId"]);
}

#[tokio::test]
async fn replay_after_ttl_is_a_fresh_submission() {
    let h = harness();

    let (_, _, first) = post(&h.state, BODY, Some("key-3"), [127, 0, 0, 1]).await;
    h.clock.advance_secs(301);
    let (status, _, second) = post(&h.state, BODY, Some("key-3"), [127, 0, 0, 1]).await;

    assert_eq!(status, StatusCode::OK);
    assert_ne!(first["orderId"], second["orderId"]);
    assert_eq!(h.repo.len(), 2);
}

#[tokio::test]
async fn oversized_idempotency_key_is_rejected() {
    let h = harness();
    let key = "k".repeat(129);
    let (status, _, json) = post(&h.state, BODY, Some(&key), [127, 0, 0, 1]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "invalid_body");
    assert!(h.repo.is_empty());
}

fn request() -> ExecuteRequest {
    ExecuteRequest {
        kind: "market".into(),
        token_in: "SOL".into(),
        token_out: "USDC".into(),
        amount: "1.0".into(),
        slippage: "0.05".into(),
    }
}
