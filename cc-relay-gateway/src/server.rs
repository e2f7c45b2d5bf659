//! # HTTP Server Module
//!
//! Router assembly and shared application state. The server exposes:
//!
//! - `POST /v1/messages` (and `/v1/messages/count_tokens`) — the proxy.
//! - `GET /v1/models` — union of providers' advertised models.
//! - `GET /health` — liveness plus breaker and pool snapshots.
//!
//! Layered middleware: request logging, then a request timeout sized for
//! long streaming responses.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;

use crate::config::Config;
use crate::handlers;
use crate::lifecycle::Lifecycle;
use crate::middleware::logging_middleware;
use crate::proxy;

/// Outbound connect timeout; request deadlines are enforced per-attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// State shared across all handlers. Cheap to clone — everything is an
/// `Arc` or an `Arc`-backed client.
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<Lifecycle>,
    pub http: reqwest::Client,
}

/// Build the outbound HTTP client the proxy dispatches through.
///
/// No global timeout: streaming responses legitimately run for minutes.
/// Connection pooling is reqwest's default.
pub fn build_http_client(config: &Config) -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .redirect(reqwest::redirect::Policy::none());
    if !config.server.http2 {
        builder = builder.http1_only();
    }
    builder.build().unwrap_or_default()
}

/// Assemble the axum application around an initialised lifecycle.
pub fn create_server(lifecycle: Arc<Lifecycle>) -> Router {
    let config = lifecycle.config();
    let state = AppState {
        lifecycle,
        http: build_http_client(&config),
    };

    Router::new()
        .route("/v1/messages", post(proxy::messages))
        .route("/v1/messages/count_tokens", post(proxy::messages))
        .route("/v1/models", get(handlers::list_models))
        .route("/health", get(handlers::health_check))
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(logging_middleware))
                .layer(TimeoutLayer::new(config.server.timeout())),
        )
        .with_state(state)
}
