//! # cc-relay-gateway
//!
//! The HTTP surface of cc-relay: a transparent streaming reverse proxy in
//! front of Anthropic-Messages-compatible backends. This crate wires the
//! request-plane engine from `cc-relay-core` into an axum server with
//! hot-reloadable configuration.
//!
//! ## Modules
//!
//! - [`config`] — TOML configuration with `${VAR}` expansion and
//!   validation.
//! - [`lifecycle`] — atomic config snapshots and the live views rebuilt
//!   on reload (pools, router, tracker, checker).
//! - [`proxy`] — the `/v1/messages` handler: auth, routing, byte-faithful
//!   forwarding, outcome classification.
//! - [`sse`] — chunk-for-chunk response streaming with canonical SSE
//!   headers.
//! - [`signature`] — the thinking-block signature cache interceptor.
//! - [`auth`] — proxy-key and passthrough client authentication.
//! - [`error`] — Anthropic-shape error responses.

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod middleware;
pub mod proxy;
pub mod request_context;
pub mod server;
pub mod signature;
pub mod sse;

pub use config::Config;
pub use error::GatewayError;
pub use lifecycle::Lifecycle;
pub use server::{create_server, AppState};
