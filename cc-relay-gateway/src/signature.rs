//! # Thinking-Signature Cache
//!
//! Streaming responses with extended thinking carry a `signature` for each
//! `thinking` block. Clients that later resend the block must include the
//! signature verbatim; caching it keyed by the block's content hash lets
//! tooling recover a signature it dropped.
//!
//! The observer is a pure bystander on the SSE stream: it reassembles
//! `data:` lines across chunk boundaries, accumulates `thinking_delta`
//! text per content-block index, and on `signature_delta` stores the
//! signature under the SHA-256 of the accumulated text. Forwarded bytes
//! are never altered.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use cc_relay_core::cache::CacheBackend;

const KEY_PREFIX: &str = "thinking-sig:";

/// Signature store over a pluggable cache backend.
pub struct SignatureCache {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
}

impl SignatureCache {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// Store a signature under the hex content hash.
    pub async fn store(&self, content_hash: &str, signature: &str) {
        let key = format!("{KEY_PREFIX}{content_hash}");
        if let Err(err) = self
            .backend
            .set(&key, signature.as_bytes().to_vec(), self.ttl)
            .await
        {
            // Cache trouble must never interfere with the stream.
            tracing::warn!(error = %err, "failed to store thinking signature");
        }
    }

    /// Look up a signature by hex content hash.
    pub async fn lookup(&self, content_hash: &str) -> Option<String> {
        let key = format!("{KEY_PREFIX}{content_hash}");
        match self.backend.get(&key).await {
            Ok(Some(bytes)) => String::from_utf8(bytes).ok(),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read thinking signature");
                None
            }
        }
    }
}

/// Hex SHA-256 of a thinking block's text.
pub fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[derive(Deserialize)]
struct SseEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    index: usize,
    #[serde(default)]
    delta: Option<SseDelta>,
}

#[derive(Deserialize)]
struct SseDelta {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    signature: Option<String>,
}

/// Stateful observer fed every forwarded chunk of one SSE response.
pub struct SignatureObserver {
    cache: Arc<SignatureCache>,
    line_buffer: String,
    thinking: HashMap<usize, String>,
}

impl SignatureObserver {
    pub fn new(cache: Arc<SignatureCache>) -> Self {
        Self {
            cache,
            line_buffer: String::new(),
            thinking: HashMap::new(),
        }
    }

    /// Observe one forwarded chunk.
    pub async fn observe(&mut self, chunk: &[u8]) {
        self.line_buffer.push_str(&String::from_utf8_lossy(chunk));
        while let Some(newline) = self.line_buffer.find('\n') {
            let line: String = self.line_buffer.drain(..=newline).collect();
            let line = line.trim_end();
            if let Some(payload) = line.strip_prefix("data: ") {
                self.observe_event(payload).await;
            }
        }
    }

    async fn observe_event(&mut self, payload: &str) {
        let Ok(event) = serde_json::from_str::<SseEvent>(payload) else {
            return;
        };
        match event.kind.as_str() {
            "content_block_delta" => {
                let Some(delta) = event.delta else { return };
                match delta.kind.as_str() {
                    "thinking_delta" => {
                        if let Some(text) = delta.thinking {
                            self.thinking.entry(event.index).or_default().push_str(&text);
                        }
                    }
                    "signature_delta" => {
                        if let Some(signature) = delta.signature {
                            if let Some(text) = self.thinking.get(&event.index) {
                                let hash = content_hash(text);
                                self.cache.store(&hash, &signature).await;
                                tracing::debug!(
                                    index = event.index,
                                    hash = %hash,
                                    "thinking signature cached"
                                );
                            }
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                self.thinking.remove(&event.index);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cc_relay_core::cache::MemoryCache;

    fn cache() -> Arc<SignatureCache> {
        Arc::new(SignatureCache::new(
            Arc::new(MemoryCache::new(64)),
            Duration::from_secs(60),
        ))
    }

    #[tokio::test]
    async fn captures_signature_keyed_by_content_hash() {
        let cache = cache();
        let mut observer = SignatureObserver::new(Arc::clone(&cache));

        observer
            .observe(
                concat!(
                    "event: content_block_delta\n",
                    "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"thinking_delta\",\"thinking\":\"let me \"}}\n",
                    "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"thinking_delta\",\"thinking\":\"reason\"}}\n",
                    "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"signature_delta\",\"signature\":\"sig-abc\"}}\n",
                )
                .as_bytes(),
            )
            .await;

        let hash = content_hash("let me reason");
        assert_eq!(cache.lookup(&hash).await, Some("sig-abc".to_string()));
    }

    #[tokio::test]
    async fn reassembles_lines_split_across_chunks() {
        let cache = cache();
        let mut observer = SignatureObserver::new(Arc::clone(&cache));

        let event = "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"thinking_delta\",\"thinking\":\"split\"}}\n";
        let (left, right) = event.split_at(40);
        observer.observe(left.as_bytes()).await;
        observer.observe(right.as_bytes()).await;
        observer
            .observe(
                "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"signature_delta\",\"signature\":\"sig-split\"}}\n"
                    .as_bytes(),
            )
            .await;

        assert_eq!(
            cache.lookup(&content_hash("split")).await,
            Some("sig-split".to_string())
        );
    }

    #[tokio::test]
    async fn block_stop_clears_accumulated_text() {
        let cache = cache();
        let mut observer = SignatureObserver::new(Arc::clone(&cache));
        observer
            .observe(
                concat!(
                    "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"thinking_delta\",\"thinking\":\"one\"}}\n",
                    "data: {\"type\":\"content_block_stop\",\"index\":0}\n",
                    "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"signature_delta\",\"signature\":\"late\"}}\n",
                )
                .as_bytes(),
            )
            .await;
        // Signature after stop has no content to key against.
        assert_eq!(cache.lookup(&content_hash("one")).await, None);
    }

    #[tokio::test]
    async fn non_thinking_streams_are_ignored() {
        let cache = cache();
        let mut observer = SignatureObserver::new(Arc::clone(&cache));
        observer
            .observe(
                concat!(
                    "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"hello\"}}\n",
                    "data: [DONE]\n",
                    "not an sse line\n",
                )
                .as_bytes(),
            )
            .await;
        // Nothing cached, nothing panicked.
        assert_eq!(cache.lookup(&content_hash("hello")).await, None);
    }
}
