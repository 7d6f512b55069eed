//! Admission pipeline for `POST /orders/execute`.
//!
//! Sequenced checks, each short-circuiting: validate → rate limit →
//! backpressure → idempotency → create row → enqueue. The row is written
//! before the enqueue so a failed enqueue leaves a durable `pending` intent
//! for the janitor; the client still gets its order id.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use swd_clock::Clock;
use swd_schemas::{ExecuteRequest, Order, OrderKind};
use swd_store::{IdempotencyStore, RateDecision, Reservation};

use crate::api_types::{ErrorResponse, FieldError, SubmitOkResponse};
use crate::state::AppState;

const MAX_TOKEN_LEN: usize = 64;
const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;
/// Suggested client backoff when the queue is saturated.
const QUEUE_FULL_RETRY_AFTER_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

pub(crate) async fn submit_order(
    State(st): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ip = addr.ip();

    // 1. Validate the body. Validation failures do not consume rate quota,
    //    but every response still carries the rate headers.
    let valid = match validate(&body) {
        Ok(v) => v,
        Err(fields) => {
            let decision = st.limiter.peek(ip);
            return error_response(
                StatusCode::BAD_REQUEST,
                ErrorResponse {
                    fields: Some(fields),
                    ..ErrorResponse::new("invalid_body", "request body failed validation")
                },
                &decision,
            );
        }
    };

    // 2. Rate limit by client IP (sliding window).
    let decision = st.limiter.check(ip);
    if !decision.allowed {
        let mut body = ErrorResponse::new("rate_limited", "too many requests from this address");
        body.retry_after = Some(decision.reset_secs);
        return error_response(StatusCode::TOO_MANY_REQUESTS, body, &decision);
    }

    // 3. Backpressure on queue depth.
    let depth = match st.queue.depth().await {
        Ok(d) => d,
        Err(err) => {
            warn!(%err, "queue depth unavailable");
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorResponse::new("service_unavailable", "queue unavailable"),
                &decision,
            );
        }
    };
    if depth.waiting > st.cfg.queue_waiting_limit {
        let mut body = ErrorResponse::new("queue_full", "execution queue is saturated");
        body.retry_after = Some(QUEUE_FULL_RETRY_AFTER_SECS);
        return error_response(StatusCode::TOO_MANY_REQUESTS, body, &decision);
    }

    // 4. Idempotency. The reservation carries the freshly minted order id,
    //    so concurrent duplicates resolve to the winner without waiting.
    let order_id = Uuid::new_v4();
    let reserved_key = match idempotency_key(&headers) {
        Ok(None) => None,
        Ok(Some(key)) => {
            let fingerprint = IdempotencyStore::fingerprint(&body);
            match st.idempotency.reserve(&key, &fingerprint, order_id) {
                Reservation::Fresh => Some(key),
                Reservation::Replay(existing) => {
                    return ok_response(existing, &decision);
                }
                Reservation::Conflict => {
                    return error_response(
                        StatusCode::CONFLICT,
                        ErrorResponse::new(
                            "idempotency_conflict",
                            "idempotency key was already used with a different body",
                        ),
                        &decision,
                    );
                }
            }
        }
        Err(field) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                ErrorResponse {
                    fields: Some(vec![field]),
                    ..ErrorResponse::new("invalid_body", "request headers failed validation")
                },
                &decision,
            );
        }
    };

    // 5. Create the row first, then enqueue.
    let order = Order::new(
        order_id,
        valid.kind,
        valid.token_in,
        valid.token_out,
        valid.amount_in,
        valid.slippage,
        st.clock.now(),
    );
    if let Err(err) = st.repo.create(order).await {
        warn!(%order_id, %err, "order create failed");
        if let Some(key) = reserved_key {
            st.idempotency.release(&key);
        }
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorResponse::new("service_unavailable", "order store unavailable"),
            &decision,
        );
    }

    // Enqueue failure is not fatal: the pending row is durable and the
    // janitor re-enqueues it after the grace period.
    if let Err(err) = st.queue.enqueue(order_id, valid.raw).await {
        warn!(%order_id, %err, "enqueue failed; janitor will reclaim");
    }

    info!(%order_id, ip = %ip, "order accepted");
    ok_response(order_id, &decision)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ValidRequest {
    kind: OrderKind,
    token_in: String,
    token_out: String,
    amount_in: Decimal,
    slippage: Decimal,
    raw: ExecuteRequest,
}

fn validate(body: &[u8]) -> Result<ValidRequest, Vec<FieldError>> {
    let raw: ExecuteRequest = serde_json::from_slice(body).map_err(|err| {
        vec![FieldError {
            field: "body".to_string(),
            message: format!("invalid JSON: {err}"),
        }]
    })?;

    let mut fields = Vec::new();

    let kind = OrderKind::parse(&raw.kind);
    if kind.is_none() {
        fields.push(FieldError {
            field: "type".to_string(),
            message: format!("unknown order type: {}", raw.kind),
        });
    }

    for (name, value) in [("tokenIn", &raw.token_in), ("tokenOut", &raw.token_out)] {
        if value.is_empty() {
            fields.push(FieldError {
                field: name.to_string(),
                message: "must not be empty".to_string(),
            });
        } else if value.len() > MAX_TOKEN_LEN {
            fields.push(FieldError {
                field: name.to_string(),
                message: format!("must be at most {MAX_TOKEN_LEN} characters"),
            });
        }
    }
    if !raw.token_in.is_empty() && raw.token_in == raw.token_out {
        fields.push(FieldError {
            field: "tokenOut".to_string(),
            message: "must differ from tokenIn".to_string(),
        });
    }

    let amount_in = match raw.amount.parse::<Decimal>() {
        Ok(a) if a > Decimal::ZERO => Some(a),
        Ok(_) => {
            fields.push(FieldError {
                field: "amount".to_string(),
                message: "must be greater than zero".to_string(),
            });
            None
        }
        Err(_) => {
            fields.push(FieldError {
                field: "amount".to_string(),
                message: format!("not a decimal: {}", raw.amount),
            });
            None
        }
    };

    let half = Decimal::new(5, 1); // 0.5
    let slippage = match raw.slippage.parse::<Decimal>() {
        Ok(s) if s >= Decimal::ZERO && s <= half => Some(s),
        Ok(_) => {
            fields.push(FieldError {
                field: "slippage".to_string(),
                message: "must be within [0, 0.5]".to_string(),
            });
            None
        }
        Err(_) => {
            fields.push(FieldError {
                field: "slippage".to_string(),
                message: format!("not a decimal: {}", raw.slippage),
            });
            None
        }
    };

    if !fields.is_empty() {
        return Err(fields);
    }

    Ok(ValidRequest {
        kind: kind.expect("checked above"),
        token_in: raw.token_in.clone(),
        token_out: raw.token_out.clone(),
        amount_in: amount_in.expect("checked above"),
        slippage: slippage.expect("checked above"),
        raw,
    })
}

fn idempotency_key(headers: &HeaderMap) -> Result<Option<String>, FieldError> {
    let Some(value) = headers.get("Idempotency-Key") else {
        return Ok(None);
    };
    let key = value.to_str().map_err(|_| FieldError {
        field: "Idempotency-Key".to_string(),
        message: "must be a printable string".to_string(),
    })?;
    if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(FieldError {
            field: "Idempotency-Key".to_string(),
            message: format!("must be 1..={MAX_IDEMPOTENCY_KEY_LEN} characters"),
        });
    }
    Ok(Some(key.to_string()))
}

// ---------------------------------------------------------------------------
// Response plumbing
// ---------------------------------------------------------------------------

fn ok_response(order_id: Uuid, decision: &RateDecision) -> Response {
    let resp = (
        StatusCode::OK,
        Json(SubmitOkResponse {
            success: true,
            order_id,
        }),
    )
        .into_response();
    with_rate_headers(resp, decision)
}

fn error_response(status: StatusCode, body: ErrorResponse, decision: &RateDecision) -> Response {
    let retry_after = body.retry_after;
    let mut resp = with_rate_headers((status, Json(body)).into_response(), decision);
    if let Some(secs) = retry_after {
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            resp.headers_mut().insert(header_retry_after(), value);
        }
    }
    resp
}

/// `X-RateLimit-Limit` / `-Remaining` / `-Reset` ride on every
/// `/orders/execute` response.
fn with_rate_headers(mut resp: Response, decision: &RateDecision) -> Response {
    let headers = resp.headers_mut();
    let pairs = [
        ("x-ratelimit-limit", decision.limit as u64),
        ("x-ratelimit-remaining", decision.remaining as u64),
        ("x-ratelimit-reset", decision.reset_secs),
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
    resp
}

fn header_retry_after() -> HeaderName {
    HeaderName::from_static("retry-after")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(amount: &str, slippage: &str) -> Vec<u8> {
        format!(
            r#"{{"type":"market","tokenIn":"SOL","tokenOut":"USDC","amount":"{amount}","slippage":"{slippage}"}}"#
        )
        .into_bytes()
    }

    #[test]
    fn valid_body_parses_decimals() {
        let v = validate(&body("1.5", "0.01")).unwrap();
        assert_eq!(v.kind, OrderKind::Market);
        assert_eq!(v.amount_in, "1.5".parse().unwrap());
        assert_eq!(v.slippage, "0.01".parse().unwrap());
    }

    #[test]
    fn zero_and_negative_amounts_are_rejected() {
        for amount in ["0", "-1"] {
            let fields = validate(&body(amount, "0.01")).unwrap_err();
            assert!(fields.iter().any(|f| f.field == "amount"), "{amount}");
        }
    }

    #[test]
    fn slippage_outside_range_is_rejected() {
        for slippage in ["0.51", "-0.1", "nope"] {
            let fields = validate(&body("1", slippage)).unwrap_err();
            assert!(fields.iter().any(|f| f.field == "slippage"), "{slippage}");
        }
        assert!(validate(&body("1", "0.5")).is_ok(), "0.5 is inclusive");
        assert!(validate(&body("1", "0")).is_ok(), "0 is inclusive");
    }

    #[test]
    fn identical_tokens_are_rejected() {
        let raw = br#"{"type":"market","tokenIn":"SOL","tokenOut":"SOL","amount":"1","slippage":"0.01"}"#;
        let fields = validate(raw).unwrap_err();
        assert!(fields.iter().any(|f| f.field == "tokenOut"));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let raw = br#"{"type":"limit","tokenIn":"SOL","tokenOut":"USDC","amount":"1","slippage":"0.01"}"#;
        let fields = validate(raw).unwrap_err();
        assert!(fields.iter().any(|f| f.field == "type"));
    }

    #[test]
    fn multiple_problems_are_all_reported() {
        let raw = br#"{"type":"limit","tokenIn":"","tokenOut":"","amount":"x","slippage":"2"}"#;
        let fields = validate(raw).unwrap_err();
        assert!(fields.len() >= 4, "got {fields:?}");
    }
}
