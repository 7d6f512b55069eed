//! Axum router and the small read-only handlers.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. Handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use uuid::Uuid;

use crate::api_types::{ErrorResponse, HealthResponse, HealthServices};
use crate::state::AppState;
use crate::{submission, subscription};

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // POST submits; GET on the same path is the stream upgrade.
        .route(
            "/orders/execute",
            axum::routing::post(submission::submit_order).get(subscription::subscribe),
        )
        .route("/orders/:id", get(get_order))
        .route("/health", get(health))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /orders/{id}
// ---------------------------------------------------------------------------

/// Read-only polling fallback: the full order row, or 404.
pub(crate) async fn get_order(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let not_found = || {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("not_found", "no such order")),
        )
            .into_response()
    };

    let Ok(order_id) = Uuid::parse_str(&id) else {
        return not_found();
    };

    match st.repo.fetch(order_id).await {
        Ok(Some(order)) => (StatusCode::OK, Json(order)).into_response(),
        Ok(None) => not_found(),
        Err(err) => {
            tracing::warn!(%order_id, %err, "order read failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse::new("service_unavailable", "order store unavailable")),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> Response {
    let queue_ok = st.queue.depth().await.is_ok();
    let db_ok = st.repo.healthy().await;
    let all_ok = queue_ok && db_ok;

    let body = HealthResponse {
        status: if all_ok { "ok" } else { "degraded" }.to_string(),
        services: HealthServices {
            queue: service_str(queue_ok),
            db: service_str(db_ok),
        },
    };
    let status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

fn service_str(ok: bool) -> String {
    if ok { "ok" } else { "error" }.to_string()
}
