//! # Gateway Error Types Module
//!
//! Conversion point between the core's [`RelayError`] taxonomy and the
//! wire. Every error leaves this process in the Anthropic error JSON shape
//! (`{"type":"error","error":{"type":"<kind>","message":"…"}}`) with the
//! matching HTTP status, except upstream failures whose original status
//! and body are propagated verbatim.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use cc_relay_core::error::RelayError;

/// Errors the HTTP surface can answer with.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Client credentials missing or invalid.
    #[error("authentication error: {message}")]
    Auth { message: String },

    /// Every key in every eligible pool is out of budget.
    #[error("rate limited")]
    RateLimited {
        /// Seconds until the earliest key is expected to admit again.
        retry_after_secs: u64,
    },

    /// No healthy provider remains.
    #[error("all providers unavailable")]
    Overloaded { message: String },

    /// Upstream error being propagated with its own status and body.
    #[error("upstream returned {status}")]
    UpstreamPassthrough { status: u16, body: Vec<u8> },

    /// Gateway-side failure with no upstream response to propagate.
    #[error("api error: {message}")]
    Api { status: u16, message: String },

    /// The request itself was unusable.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
}

impl GatewayError {
    /// The Anthropic error JSON body for this error.
    fn anthropic_body(kind: &str, message: &str) -> serde_json::Value {
        json!({
            "type": "error",
            "error": { "type": kind, "message": message }
        })
    }
}

impl From<RelayError> for GatewayError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Authentication { message } => GatewayError::Auth { message },
            RelayError::AllKeysExhausted { .. } | RelayError::CapacityExhausted => {
                GatewayError::RateLimited {
                    retry_after_secs: 1,
                }
            }
            RelayError::AllProvidersUnhealthy
            | RelayError::NoProviders
            | RelayError::CircuitOpen { .. } => GatewayError::Overloaded {
                message: err.to_string(),
            },
            RelayError::Upstream {
                status,
                body: Some(body),
                ..
            } => GatewayError::UpstreamPassthrough { status, body },
            RelayError::Upstream { status, .. } => GatewayError::Api {
                status,
                message: format!("upstream returned {status}"),
            },
            RelayError::FailoverTimeout { .. } => GatewayError::Api {
                status: 504,
                message: err.to_string(),
            },
            RelayError::Transport(_) => GatewayError::Api {
                status: 502,
                message: err.to_string(),
            },
            RelayError::ClientCancelled => GatewayError::InvalidRequest {
                message: "request cancelled by client".to_string(),
            },
            other => GatewayError::Api {
                status: 500,
                message: other.to_string(),
            },
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            GatewayError::Auth { message } => (
                StatusCode::UNAUTHORIZED,
                Json(Self::anthropic_body("authentication_error", &message)),
            )
                .into_response(),

            GatewayError::RateLimited { retry_after_secs } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(Self::anthropic_body(
                        "rate_limit_error",
                        "all keys exhausted, retry later",
                    )),
                )
                    .into_response();
                if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                response
            }

            GatewayError::Overloaded { message } => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(Self::anthropic_body("overloaded_error", &message)),
            )
                .into_response(),

            GatewayError::UpstreamPassthrough { status, body } => {
                let status =
                    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let mut response = (status, body).into_response();
                response.headers_mut().insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                response
            }

            GatewayError::Api { status, message } => {
                let status =
                    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                (status, Json(Self::anthropic_body("api_error", &message))).into_response()
            }

            GatewayError::InvalidRequest { message } => (
                StatusCode::BAD_REQUEST,
                Json(Self::anthropic_body("invalid_request_error", &message)),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn auth_errors_are_anthropic_shaped() {
        let response = GatewayError::Auth {
            message: "bad key".to_string(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "authentication_error");
    }

    #[tokio::test]
    async fn rate_limited_sets_retry_after() {
        let response = GatewayError::RateLimited {
            retry_after_secs: 42,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "rate_limit_error");
    }

    #[tokio::test]
    async fn upstream_bodies_pass_through_unchanged() {
        let upstream = br#"{"type":"error","error":{"type":"api_error","message":"boom"}}"#;
        let err: GatewayError =
            RelayError::from_status(502, None).with_body(upstream.to_vec()).into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], &upstream[..]);
    }

    #[tokio::test]
    async fn unhealthy_maps_to_503() {
        let err: GatewayError = RelayError::AllProvidersUnhealthy.into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "overloaded_error");
    }
}
