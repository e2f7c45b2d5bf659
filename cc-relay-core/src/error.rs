//! # Error Handling Module
//!
//! This module defines the error taxonomy for the cc-relay request plane.
//! Every failure mode a request can hit on its way to a backend is a
//! variant of [`RelayError`], so the proxy handler has a single place to
//! map internal failures onto HTTP responses.
//!
//! ## Error Categories
//!
//! - **Capacity errors**: a single key is out of budget
//!   (`CapacityExhausted`) or the whole pool is (`AllKeysExhausted`).
//! - **Health errors**: a provider's circuit is open (`CircuitOpen`) or
//!   every candidate is (`AllProvidersUnhealthy`).
//! - **Upstream errors**: classified from the backend HTTP status
//!   (`Upstream`, with a `retry_after` attached for 429s).
//! - **Transport errors**: connection refused, DNS, TLS, peer reset —
//!   anything below HTTP (`Transport`).
//! - **Cancellation**: the client went away (`ClientCancelled`); never a
//!   provider fault.
//! - **Failover**: the parallel race elapsed without a winner
//!   (`FailoverTimeout`).
//!
//! ## Classification
//!
//! [`RelayError::from_status`] converts a backend status into the matching
//! variant, and [`RelayError::is_client_fault`] captures the rule that
//! non-429 4xx responses must not trip circuit breakers.

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the request-plane engine.
#[derive(Error, Debug)]
pub enum RelayError {
    /// A single key's request bucket rejected the admission attempt.
    #[error("key capacity exhausted")]
    CapacityExhausted,

    /// Every key in the pool failed admission.
    #[error("all keys exhausted for provider {provider}")]
    AllKeysExhausted { provider: String },

    /// The provider's circuit breaker is open.
    #[error("circuit open for provider {provider}")]
    CircuitOpen { provider: String },

    /// No providers were supplied to the router.
    #[error("no providers configured")]
    NoProviders,

    /// Every candidate provider reported unhealthy.
    #[error("all providers unhealthy")]
    AllProvidersUnhealthy,

    /// The failover race elapsed before any candidate succeeded.
    #[error("failover timed out after {timeout:?} (primary: {primary})")]
    FailoverTimeout { primary: String, timeout: Duration },

    /// The backend answered with an error status.
    #[error("upstream returned {status}")]
    Upstream {
        status: u16,
        /// Present on 429 responses that carried a `Retry-After` header.
        retry_after: Option<Duration>,
        /// The upstream error body, kept so a failed failover can
        /// propagate the last observed response to the client verbatim.
        body: Option<Vec<u8>>,
    },

    /// Connection-level failure: refused, DNS, TLS, reset mid-stream.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The client aborted before the request completed.
    #[error("client cancelled request")]
    ClientCancelled,

    /// Client credentials did not validate.
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    /// Provider type named in configuration has no adapter.
    #[error("provider type not supported: {kind}")]
    ProviderNotSupported { kind: String },

    /// Invalid or missing configuration for a core component.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Signature-cache backend failure.
    #[error("cache error: {message}")]
    Cache { message: String },
}

impl RelayError {
    /// Classify a backend HTTP status into the relay taxonomy.
    ///
    /// Statuses below 400 are not errors and panic in debug builds if
    /// passed here; release builds map them to a generic upstream error.
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
        debug_assert!(status >= 400, "from_status called with success status");
        RelayError::Upstream {
            status,
            retry_after: if status == 429 { retry_after } else { None },
            body: None,
        }
    }

    /// Attach the upstream response body to an upstream error.
    pub fn with_body(self, bytes: Vec<u8>) -> Self {
        match self {
            RelayError::Upstream {
                status,
                retry_after,
                ..
            } => RelayError::Upstream {
                status,
                retry_after,
                body: Some(bytes),
            },
            other => other,
        }
    }

    /// Whether this error is the client's fault rather than the provider's.
    ///
    /// Client-fault errors (4xx other than 429, bad credentials, client
    /// cancellation) count as *success* from the circuit breaker's
    /// perspective: the provider did its job.
    pub fn is_client_fault(&self) -> bool {
        match self {
            RelayError::Upstream { status, .. } => {
                (400..500).contains(status) && *status != 429
            }
            RelayError::ClientCancelled => true,
            RelayError::Authentication { .. } => true,
            _ => false,
        }
    }

    /// The HTTP status observed upstream, if this error carries one.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            RelayError::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The retry-after hint carried by a 429, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RelayError::Upstream { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_carries_retry_after_only_for_429() {
        let err = RelayError::from_status(429, Some(Duration::from_secs(30)));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));

        let err = RelayError::from_status(503, Some(Duration::from_secs(30)));
        assert_eq!(err.retry_after(), None);
        assert_eq!(err.upstream_status(), Some(503));
    }

    #[test]
    fn client_fault_excludes_429_and_5xx() {
        assert!(RelayError::from_status(401, None).is_client_fault());
        assert!(RelayError::from_status(404, None).is_client_fault());
        assert!(RelayError::from_status(422, None).is_client_fault());
        assert!(!RelayError::from_status(429, None).is_client_fault());
        assert!(!RelayError::from_status(502, None).is_client_fault());
        assert!(RelayError::ClientCancelled.is_client_fault());
    }
}
