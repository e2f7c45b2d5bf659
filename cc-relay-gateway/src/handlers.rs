//! # Auxiliary Handlers
//!
//! The non-proxy endpoints: model listing and liveness.

use std::collections::BTreeSet;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::server::AppState;

/// GET `/v1/models` — the union of every enabled provider's advertised
/// models, in the Anthropic list shape.
pub async fn list_models(State(state): State<AppState>) -> Response {
    let live = state.lifecycle.state();
    let mut models = BTreeSet::new();
    for info in &live.providers {
        models.extend(info.provider.models());
    }

    let data: Vec<_> = models
        .iter()
        .map(|id| json!({ "type": "model", "id": id }))
        .collect();

    Json(json!({
        "data": data,
        "has_more": false,
        "first_id": models.iter().next(),
        "last_id": models.iter().next_back(),
    }))
    .into_response()
}

/// GET `/health` — liveness plus per-provider breaker state and key-pool
/// stats.
pub async fn health_check(State(state): State<AppState>) -> Response {
    let live = state.lifecycle.state();
    let pools: Vec<_> = live.pools.values().map(|pool| pool.stats()).collect();
    let providers = state.lifecycle.tracker().snapshot();

    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "providers": providers,
            "pools": pools,
        })),
    )
        .into_response()
}
