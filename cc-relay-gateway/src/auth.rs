//! # Client Authentication
//!
//! Two modes, either or both active per configuration:
//!
//! - **Fixed key** — clients present the configured proxy key in
//!   `x-api-key`. Both sides are hashed with SHA-256 before comparison,
//!   so inputs of different lengths compare in constant time and the
//!   configured key never participates in a length-dependent branch.
//! - **Passthrough** — clients present `Authorization: Bearer …` and the
//!   relay forwards it untouched to backends advertising transparent
//!   auth; other backends fall back to their configured key pools.

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::config::AuthConfig;

/// How the accepted request will authenticate upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// Validated against the proxy key; upstream uses pool keys.
    ProxyKey,
    /// Client bearer token rides through to transparent-auth backends.
    Passthrough { authorization: String },
}

/// Outcome of validating one request's credentials.
pub fn authenticate(config: &AuthConfig, headers: &HeaderMap) -> Result<AuthMode, String> {
    // Passthrough first: a bearer credential is an explicit ask to use the
    // client's own subscription.
    if config.allow_passthrough {
        if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
            if value.len() > "Bearer ".len() && value[..7].eq_ignore_ascii_case("bearer ") {
                return Ok(AuthMode::Passthrough {
                    authorization: value.to_string(),
                });
            }
        }
    }

    if let Some(expected) = config.api_key.as_deref() {
        if let Some(presented) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
            if hashed_eq(presented, expected) {
                return Ok(AuthMode::ProxyKey);
            }
            return Err("invalid x-api-key".to_string());
        }
        return Err("missing x-api-key".to_string());
    }

    if config.allow_passthrough {
        return Err("missing bearer credentials".to_string());
    }

    // No proxy key configured and no passthrough: open relay (development
    // setups); upstream still authenticates with pool keys.
    Ok(AuthMode::ProxyKey)
}

/// Constant-time equality via fixed-length SHA-256 digests.
fn hashed_eq(a: &str, b: &str) -> bool {
    let digest_a = Sha256::digest(a.as_bytes());
    let digest_b = Sha256::digest(b.as_bytes());
    // 32-byte array comparison: length never depends on the inputs.
    digest_a == digest_b
}
