//! # Transparent Streaming Proxy Handler
//!
//! The `/v1/messages` path. One request flows through:
//! authenticate → select provider (router) → select key (pool) → rewrite →
//! dispatch → stream → classify outcome.
//!
//! The handler never deserialises or modifies the request body — tool-use
//! ids, thinking blocks and unknown future fields survive because the
//! bytes pass through untouched. Responses stream chunk-for-chunk with the
//! canonical SSE headers forced on before the first write.
//!
//! Outcome bookkeeping per dispatch:
//!
//! - `< 400` — breaker success (recorded when the body finishes draining),
//!   rate limits learned from `anthropic-ratelimit-*` headers.
//! - `429` — key put on cooldown for `Retry-After`; counts against the
//!   breaker unless the rate-limit failover trigger was removed.
//! - other `4xx` — the provider did its job; breaker success.
//! - `5xx` / transport — breaker failure.
//! - client abort — neutral everywhere.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use axum::http::Method;
use axum::response::{IntoResponse, Response};
use chrono::Utc;

use cc_relay_core::error::RelayError;
use cc_relay_core::pool::KeyLease;
use cc_relay_core::providers::Provider;
use cc_relay_core::routing::ProviderInfo;

use crate::auth::{authenticate, AuthMode};
use crate::error::GatewayError;
use crate::lifecycle::Lifecycle;
use crate::request_context::RequestContext;
use crate::server::AppState;
use crate::signature::SignatureObserver;
use crate::sse;

/// Cooldown applied to a 429 without a parseable `Retry-After`.
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// Headers that terminate at this hop (RFC 9110 §7.6.1).
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Request headers always forwarded upstream alongside `anthropic-*`.
const STANDARD_FORWARD: [&str; 3] = ["content-type", "accept", "user-agent"];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.contains(&name)
}

/// Everything an attempt needs, shared by the primary try and the race.
struct AttemptContext {
    lifecycle: Arc<Lifecycle>,
    http: reqwest::Client,
    method: Method,
    path_and_query: String,
    headers: HeaderMap,
    body: Bytes,
    mode: AuthMode,
}

/// A dispatch that produced a success-class upstream response.
struct UpstreamOutcome {
    response: reqwest::Response,
    permit: cc_relay_core::breaker::BreakerPermit,
    lease: Option<KeyLease>,
}

/// POST `/v1/messages` (and `/v1/messages/count_tokens`).
pub async fn messages(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let config = state.lifecycle.config();

    let mut ctx = RequestContext::new(
        parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok()),
    );

    let mode = match authenticate(&config.auth, &parts.headers) {
        Ok(mode) => mode,
        Err(message) => {
            tracing::warn!(request_id = %ctx.request_id, %message, "authentication failed");
            return finalize(
                GatewayError::Auth { message }.into_response(),
                &ctx,
                None,
                config.routing.debug,
            );
        }
    };

    let body = match axum::body::to_bytes(body, config.server.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return finalize(
                GatewayError::InvalidRequest {
                    message: "request body too large or unreadable".to_string(),
                }
                .into_response(),
                &ctx,
                None,
                config.routing.debug,
            );
        }
    };

    let live = state.lifecycle.state();
    // Fetched through the lifecycle on every request so a hot strategy
    // swap takes effect without a restart.
    let router = state.lifecycle.router();
    ctx.strategy = Some(router.strategy_name().to_string());

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let attempt_ctx = Arc::new(AttemptContext {
        lifecycle: Arc::clone(&state.lifecycle),
        http: state.http.clone(),
        method: parts.method.clone(),
        path_and_query,
        headers: parts.headers.clone(),
        body,
        mode,
    });

    let attempt = {
        let attempt_ctx = Arc::clone(&attempt_ctx);
        move |info: Arc<ProviderInfo>| {
            let attempt_ctx = Arc::clone(&attempt_ctx);
            async move { attempt_ctx.dispatch(info).await }
        }
    };

    match router.select_with_retry(&live.providers, attempt).await {
        Ok((chosen, outcome)) => {
            ctx.provider = Some(chosen.name().to_string());
            ctx.key_id = outcome.lease.as_ref().map(|l| l.key_id.clone());
            let response = stream_response(&state, &config, outcome);
            tracing::info!(
                request_id = %ctx.request_id,
                provider = ctx.provider.as_deref().unwrap_or("-"),
                key_id = ctx.key_id.as_deref().unwrap_or("-"),
                strategy = ctx.strategy.as_deref().unwrap_or("-"),
                status = response.status().as_u16(),
                latency_ms = ctx.elapsed_ms() as u64,
                "request dispatched"
            );
            finalize(response, &ctx, ctx.provider.as_deref(), config.routing.debug)
        }
        Err(error) => {
            tracing::warn!(
                request_id = %ctx.request_id,
                strategy = ctx.strategy.as_deref().unwrap_or("-"),
                error = %error,
                latency_ms = ctx.elapsed_ms() as u64,
                "request failed"
            );
            let response = error_response(&state, error);
            finalize(response, &ctx, None, config.routing.debug)
        }
    }
}

impl AttemptContext {
    /// One outbound try against one provider.
    async fn dispatch(
        self: Arc<Self>,
        info: Arc<ProviderInfo>,
    ) -> Result<UpstreamOutcome, RelayError> {
        let provider = &info.provider;
        let name = provider.name().to_string();

        let passthrough = matches!(self.mode, AuthMode::Passthrough { .. })
            && provider.supports_transparent_auth();

        // Keyless pools (local backends) dispatch without a lease.
        let lease = if passthrough {
            None
        } else {
            match self.lifecycle.pool(&name) {
                Some(pool) if !pool.is_empty() => Some(pool.get_key()?),
                _ => None,
            }
        };

        // Pessimistic output-token accounting: the request's max_tokens is
        // observed (never modified) and reserved up front; learned headers
        // reconcile the balance after the response.
        if let Some(lease) = &lease {
            if let (Some(max_tokens), Some(pool)) =
                (extract_max_tokens(&self.body), self.lifecycle.pool(&name))
            {
                pool.reserve_tokens(&lease.key_id, max_tokens);
            }
        }

        let permit = self.lifecycle.tracker().allow(&name)?;

        let mut headers = build_outbound_headers(&self.headers, provider.as_ref());
        match (&self.mode, passthrough, &lease) {
            (AuthMode::Passthrough { authorization }, true, _) => {
                if let Ok(value) = HeaderValue::from_str(authorization) {
                    headers.insert(AUTHORIZATION, value);
                }
            }
            (_, _, Some(lease)) => provider.authenticate(&mut headers, &lease.api_key),
            (_, _, None) => provider.authenticate(&mut headers, ""),
        }

        let url = format!("{}{}", provider.base_url(), self.path_and_query);
        let sent = self
            .http
            .request(self.method.clone(), &url)
            .headers(headers)
            .body(self.body.clone())
            .send()
            .await;

        let response = match sent {
            Ok(response) => response,
            Err(source) => {
                let error = RelayError::Transport(source);
                permit.done(Some(&error));
                return Err(error);
            }
        };

        let status = response.status().as_u16();
        if status < 400 {
            if let (Some(lease), Some(pool)) = (&lease, self.lifecycle.pool(&name)) {
                pool.update_key_from_headers(&lease.key_id, response.headers());
            }
            return Ok(UpstreamOutcome {
                response,
                permit,
                lease,
            });
        }

        let retry_after = parse_retry_after(response.headers());
        let body = response.bytes().await.unwrap_or_default();
        let error = RelayError::from_status(status, retry_after).with_body(body.to_vec());

        if status == 429 {
            if let (Some(lease), Some(pool)) = (&lease, self.lifecycle.pool(&name)) {
                pool.mark_key_exhausted(&lease.key_id, retry_after.unwrap_or(DEFAULT_COOLDOWN));
            }
            // Operators may strip the rate-limit trigger, demoting 429 to
            // a neutral outcome for the breaker.
            if self.lifecycle.router().matching_trigger(&error).is_none() {
                permit.done(None);
            } else {
                permit.done(Some(&error));
            }
        } else {
            permit.done(Some(&error));
        }

        Err(error)
    }
}

/// Rewrite the client's headers for the upstream hop.
///
/// Hop-by-hop, addressing and credential headers are dropped; the
/// standard content headers and everything the provider asks to forward
/// (the `anthropic-*` family) are copied through.
fn build_outbound_headers(client: &HeaderMap, provider: &dyn Provider) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in client {
        let name_str = name.as_str();
        if is_hop_by_hop(name_str) {
            continue;
        }
        if matches!(
            name_str,
            "host" | "content-length" | "authorization" | "x-api-key" | "x-request-id"
        ) {
            continue;
        }
        if STANDARD_FORWARD.contains(&name_str) || provider.forwards_header(name_str) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Read `max_tokens` out of the request body without touching it.
///
/// Lenient: anything that does not parse as a Messages body simply skips
/// the reservation.
fn extract_max_tokens(body: &Bytes) -> Option<u64> {
    #[derive(serde::Deserialize)]
    struct MaxTokensOnly {
        max_tokens: Option<u64>,
    }
    serde_json::from_slice::<MaxTokensOnly>(body)
        .ok()
        .and_then(|b| b.max_tokens)
}

/// Parse `Retry-After` seconds; http-date forms are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Build the streamed client response out of a winning upstream response.
fn stream_response(
    state: &AppState,
    config: &crate::config::Config,
    outcome: UpstreamOutcome,
) -> Response {
    let status = outcome.response.status();

    let mut headers = HeaderMap::new();
    for (name, value) in outcome.response.headers() {
        let name_str = name.as_str();
        // Framing is re-decided by this hop.
        if is_hop_by_hop(name_str) || name_str == "content-length" {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let streaming = sse::is_event_stream(&headers);
    if streaming {
        sse::apply_sse_headers(&mut headers);
    }

    let observer = if streaming && config.cache.enabled {
        Some(SignatureObserver::new(state.lifecycle.signature_cache()))
    } else {
        None
    };

    let body = sse::forward_body(outcome.response, Some(outcome.permit), observer);

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Convert a routing failure into the client-facing error response.
fn error_response(state: &AppState, error: RelayError) -> Response {
    match error {
        RelayError::AllKeysExhausted { ref provider } => {
            let retry_after_secs = state
                .lifecycle
                .pool(provider)
                .and_then(|pool| pool.earliest_reset())
                .map(|reset| (reset - Utc::now()).num_seconds().max(1) as u64)
                .unwrap_or(1);
            GatewayError::RateLimited { retry_after_secs }.into_response()
        }
        other => GatewayError::from(other).into_response(),
    }
}

/// Stamp correlation and debug headers onto an outgoing response.
fn finalize(
    mut response: Response,
    ctx: &RequestContext,
    provider: Option<&str>,
    debug: bool,
) -> Response {
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-request-id"), value);
    }
    if debug {
        if let Some(strategy) = ctx.strategy.as_deref() {
            if let Ok(value) = HeaderValue::from_str(strategy) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static("x-cc-relay-strategy"), value);
            }
        }
        if let Some(provider) = provider {
            if let Ok(value) = HeaderValue::from_str(provider) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static("x-cc-relay-provider"), value);
            }
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use cc_relay_core::providers::create_provider;

    fn anthropic() -> Arc<dyn Provider> {
        create_provider("anthropic", "main", "https://api.anthropic.com", vec![]).unwrap()
    }

    #[test]
    fn outbound_headers_drop_hop_by_hop_and_credentials() {
        let mut client = HeaderMap::new();
        client.insert("connection", HeaderValue::from_static("keep-alive"));
        client.insert("host", HeaderValue::from_static("relay.local"));
        client.insert("x-api-key", HeaderValue::from_static("client-key"));
        client.insert("authorization", HeaderValue::from_static("Bearer t"));
        client.insert("content-type", HeaderValue::from_static("application/json"));
        client.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
        client.insert("anthropic-beta", HeaderValue::from_static("tools-2024"));
        client.insert("x-random-junk", HeaderValue::from_static("nope"));

        let provider = anthropic();
        let out = build_outbound_headers(&client, provider.as_ref());

        assert_eq!(out.get("content-type").unwrap(), "application/json");
        assert_eq!(out.get("anthropic-version").unwrap(), "2023-06-01");
        assert_eq!(out.get("anthropic-beta").unwrap(), "tools-2024");
        assert!(out.get("connection").is_none());
        assert!(out.get("host").is_none());
        assert!(out.get("x-api-key").is_none());
        assert!(out.get("authorization").is_none());
        assert!(out.get("x-random-junk").is_none());
    }

    #[test]
    fn max_tokens_is_observed_not_required() {
        let body = Bytes::from_static(br#"{"model":"claude","max_tokens":1024,"messages":[]}"#);
        assert_eq!(extract_max_tokens(&body), Some(1024));

        let body = Bytes::from_static(br#"{"model":"claude","messages":[]}"#);
        assert_eq!(extract_max_tokens(&body), None);

        let body = Bytes::from_static(b"not json at all");
        assert_eq!(extract_max_tokens(&body), None);
    }

    #[test]
    fn retry_after_parses_seconds_only() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("30"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(30)));

        headers.insert(
            "retry-after",
            HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }
}
