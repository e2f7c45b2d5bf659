//! # Request Context Module
//!
//! Per-request bookkeeping threaded through the proxy path: the
//! correlation id (echoed back as `X-Request-ID`), start time, and the
//! routing decisions made along the way. The context lives exactly as
//! long as the HTTP request.

use std::time::Instant;

use uuid::Uuid;

/// Tracking state for one in-flight request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Correlation id; generated when the client did not send one.
    pub request_id: String,
    /// Request start, for latency logging.
    pub start_time: Instant,
    /// Provider chosen by the router, once known.
    pub provider: Option<String>,
    /// Key id leased from the provider's pool, once known.
    pub key_id: Option<String>,
    /// Routing strategy in effect when the request was dispatched.
    pub strategy: Option<String>,
}

impl RequestContext {
    /// Create a context, keeping the client's `X-Request-ID` if present.
    pub fn new(incoming_id: Option<&str>) -> Self {
        let request_id = match incoming_id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        Self {
            request_id,
            start_time: Instant::now(),
            provider: None,
            key_id: None,
            strategy: None,
        }
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.start_time.elapsed().as_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echoes_client_request_id() {
        let ctx = RequestContext::new(Some("req-abc-123"));
        assert_eq!(ctx.request_id, "req-abc-123");
    }

    #[test]
    fn generates_id_when_absent_or_blank() {
        let generated = RequestContext::new(None);
        assert!(!generated.request_id.is_empty());

        let blank = RequestContext::new(Some("   "));
        assert!(!blank.request_id.trim().is_empty());
        assert_ne!(blank.request_id, "   ");
    }
}
