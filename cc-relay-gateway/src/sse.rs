//! # SSE Forwarding
//!
//! Streams an upstream response body to the client chunk-for-chunk. Every
//! chunk is yielded the moment it arrives — there is no intermediate
//! buffer, so client-observed event order and pacing match the backend's.
//! The canonical SSE headers are forced onto streaming responses before
//! the first write so nginx-class proxies and CDNs in front of the relay
//! do not buffer.
//!
//! The circuit-breaker permit for the request rides inside the stream and
//! is resolved when the body settles: a clean end reports success, a
//! mid-stream transport error reports failure. If the client disconnects,
//! the stream is dropped and the permit's drop handler records a neutral
//! outcome.

use axum::body::Body;
use axum::http::header::{HeaderMap, HeaderValue, CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use futures::StreamExt;

use cc_relay_core::breaker::BreakerPermit;
use cc_relay_core::error::RelayError;

use crate::signature::SignatureObserver;

/// Does this response stream server-sent events?
pub fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream"))
}

/// Force the canonical SSE headers so intermediaries do not buffer.
pub fn apply_sse_headers(headers: &mut HeaderMap) {
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    );
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
}

/// Forward an upstream body, resolving the breaker permit at stream end.
///
/// `observer`, when present, sees every chunk before it is forwarded; it
/// never modifies them.
pub fn forward_body(
    upstream: reqwest::Response,
    permit: Option<BreakerPermit>,
    observer: Option<SignatureObserver>,
) -> Body {
    let stream = async_stream::stream! {
        let mut permit = permit;
        let mut observer = observer;
        let mut chunks = upstream.bytes_stream();

        while let Some(next) = chunks.next().await {
            match next {
                Ok(bytes) => {
                    if let Some(observer) = observer.as_mut() {
                        observer.observe(&bytes).await;
                    }
                    yield Ok::<_, RelayError>(bytes);
                }
                Err(err) => {
                    // The stream is already committed; the client sees an
                    // abrupt EOF and the breaker sees a provider fault.
                    let err = RelayError::Transport(err);
                    tracing::warn!(error = %err, "upstream stream failed mid-body");
                    if let Some(permit) = permit.take() {
                        permit.done(Some(&err));
                    }
                    yield Err(err);
                    return;
                }
            }
        }

        if let Some(permit) = permit.take() {
            permit.done(None);
        }
    };

    Body::from_stream(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_stream_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_event_stream(&headers));

        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream; charset=utf-8"),
        );
        assert!(is_event_stream(&headers));

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        assert!(!is_event_stream(&headers));
    }

    #[test]
    fn sse_headers_are_canonical() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        apply_sse_headers(&mut headers);

        assert_eq!(headers[CONTENT_TYPE], "text/event-stream");
        assert_eq!(headers[CACHE_CONTROL], "no-cache, no-transform");
        assert_eq!(headers["x-accel-buffering"], "no");
        assert_eq!(headers[CONNECTION], "keep-alive");
    }
}
