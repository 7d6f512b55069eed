//! Subscription service: bridges an order's bus topic onto a WebSocket.
//!
//! Protocol per connection:
//! 1. Admission — well-formed `orderId` (else close 4000), subscription cap
//!    per (order, IP) (else 4029), order must exist (else 4004).
//! 2. Subscribe to the bus topic **first**, then send the `backfill` message
//!    from the persisted row; events published meanwhile buffer in the
//!    channel and replay after backfill, preserving causal order.
//! 3. Tail: every bus event becomes a `status_update`. A terminal event (or
//!    a terminal status already present at backfill) ends the stream.
//! 4. Heartbeat: ping every `PING_INTERVAL`; two consecutively missed pongs
//!    (`PONG_TIMEOUT` each) terminate the connection.
//!
//! Client disconnect cancels only the subscription — the job keeps running
//! and the terminal state is observable on reconnect via backfill.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use swd_clock::Clock;
use swd_schemas::StreamMsg;

use crate::state::AppState;

// Close codes for the stream surface.
const CLOSE_MISSING_ORDER_ID: u16 = 4000;
const CLOSE_NOT_FOUND: u16 = 4004;
const CLOSE_TOO_MANY_CONNECTIONS: u16 = 4029;
const CLOSE_SERVER_ERROR: u16 = 1011;
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_GOING_AWAY: u16 = 1001;

/// How long a stream whose order is already terminal at backfill lingers
/// before the server closes it.
const TERMINAL_LINGER: std::time::Duration = std::time::Duration::from_millis(100);

#[derive(Debug, Deserialize)]
pub(crate) struct SubscribeParams {
    #[serde(rename = "orderId")]
    order_id: Option<String>,
}

pub(crate) async fn subscribe(
    ws: WebSocketUpgrade,
    Query(params): Query<SubscribeParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(st): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| run(socket, st, params.order_id, addr.ip()))
}

async fn run(socket: WebSocket, st: Arc<AppState>, order_param: Option<String>, ip: IpAddr) {
    let order_id = match order_param.as_deref().map(Uuid::parse_str) {
        Some(Ok(id)) => id,
        _ => {
            close(socket, CLOSE_MISSING_ORDER_ID, "missing_orderId").await;
            return;
        }
    };

    let Some(_permit) = st.subscriptions.try_acquire(order_id, ip) else {
        debug!(%order_id, %ip, "subscription cap reached");
        close(socket, CLOSE_TOO_MANY_CONNECTIONS, "too_many_connections").await;
        return;
    };

    // Subscribe before reading the row: anything the worker publishes while
    // we backfill buffers in the topic and replays afterwards.
    let mut live = st.bus.subscribe(order_id);

    let order = match st.repo.fetch(order_id).await {
        Ok(Some(order)) => order,
        Ok(None) => {
            close(socket, CLOSE_NOT_FOUND, "not_found").await;
            return;
        }
        Err(err) => {
            warn!(%order_id, %err, "backfill read failed");
            let msg = StreamMsg::Error(swd_schemas::StreamErrorMsg {
                message: "backfill unavailable".to_string(),
                timestamp: st.clock.now(),
            });
            let mut socket = socket;
            if let Ok(text) = serde_json::to_string(&msg) {
                let _ = socket.send(Message::Text(text)).await;
            }
            close(socket, CLOSE_SERVER_ERROR, "server_error").await;
            return;
        }
    };

    let (mut tx, mut rx) = socket.split();

    let backfill = StreamMsg::backfill(&order, st.clock.now());
    if send_msg(&mut tx, &backfill).await.is_err() {
        return;
    }

    // Terminal at backfill: nothing further will ever arrive. Linger
    // briefly so the client can read the backfill, then close.
    if order.status.is_terminal() {
        tokio::time::sleep(TERMINAL_LINGER).await;
        close_split(&mut tx, CLOSE_NORMAL, "complete").await;
        return;
    }

    info!(%order_id, %ip, "subscription established");

    let mut ping = tokio::time::interval(st.cfg.ping_interval);
    ping.tick().await; // the first tick fires immediately; skip it
    let mut missed_pongs = 0u32;
    let mut pong_deadline: Option<Instant> = None;
    let mut shutdown = st.shutdown.clone();

    loop {
        // A disabled select branch still evaluates its expression, so the
        // deadline future needs a value even when no pong is pending.
        let deadline = pong_deadline
            .unwrap_or_else(|| Instant::now() + std::time::Duration::from_secs(86_400));

        tokio::select! {
            event = live.recv() => match event {
                Some(event) => {
                    let terminal = event.status.is_terminal() && event.retry.is_none();
                    if send_msg(&mut tx, &StreamMsg::StatusUpdate(event)).await.is_err() {
                        return;
                    }
                    if terminal {
                        close_split(&mut tx, CLOSE_NORMAL, "complete").await;
                        return;
                    }
                }
                None => {
                    close_split(&mut tx, CLOSE_SERVER_ERROR, "server_error").await;
                    return;
                }
            },

            msg = rx.next() => match msg {
                Some(Ok(Message::Pong(_))) => {
                    missed_pongs = 0;
                    pong_deadline = None;
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(%order_id, "client disconnected");
                    return;
                }
                Some(Ok(_)) => {} // inbound text/binary is ignored
                Some(Err(err)) => {
                    debug!(%order_id, %err, "socket error");
                    return;
                }
            },

            _ = ping.tick() => {
                if tx.send(Message::Ping(Vec::new())).await.is_err() {
                    return;
                }
                if pong_deadline.is_none() {
                    pong_deadline = Some(Instant::now() + st.cfg.pong_timeout);
                }
            },

            _ = tokio::time::sleep_until(deadline), if pong_deadline.is_some() => {
                missed_pongs += 1;
                pong_deadline = None;
                if missed_pongs >= 2 {
                    info!(%order_id, "heartbeat lost; terminating subscription");
                    close_split(&mut tx, CLOSE_GOING_AWAY, "heartbeat_timeout").await;
                    return;
                }
            },

            _ = shutdown.changed() => {
                close_split(&mut tx, CLOSE_GOING_AWAY, "shutting_down").await;
                return;
            },
        }
    }
}

async fn send_msg(
    tx: &mut (impl SinkExt<Message> + Unpin),
    msg: &StreamMsg,
) -> Result<(), ()> {
    let text = serde_json::to_string(msg).map_err(|_| ())?;
    tx.send(Message::Text(text)).await.map_err(|_| ())
}

async fn close(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn close_split(tx: &mut (impl SinkExt<Message> + Unpin), code: u16, reason: &'static str) {
    let _ = tx
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}
