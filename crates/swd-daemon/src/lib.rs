//! swd-daemon: the HTTP/WebSocket edge of the execution engine.
//!
//! Thin transport translation only — admission logic lives in
//! [`submission`], the stream bridge in [`subscription`], shared wiring in
//! [`state`]. `main.rs` assembles backends, worker and janitor around the
//! router built here.

pub mod api_types;
pub mod routes;
pub mod state;
pub mod submission;
pub mod subscription;
