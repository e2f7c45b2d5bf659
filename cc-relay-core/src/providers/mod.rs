//! # Provider System Module
//!
//! Adapters for Anthropic-Messages-compatible backends. The relay never
//! translates request bodies — an adapter only knows how to *address* its
//! backend (base URL), how to *authenticate* against it, which request
//! headers to forward, and which capabilities it advertises.
//!
//! ## Supported backends
//!
//! - **`anthropic`** — the Anthropic API or any byte-compatible clone
//!   (Z.AI exposes one; point `base_url` at it).
//! - **`ollama`** — a local Ollama instance serving the Messages-compatible
//!   endpoint; no credential is injected.
//!
//! Cloud types (`bedrock`, `vertex`, `azure`) require request signing or
//! body translation handled by out-of-tree adapters; the factory names the
//! missing adapter rather than silently proxying unsigned requests.

use std::sync::Arc;

use reqwest::header::HeaderMap;

use crate::error::RelayError;

pub mod anthropic;
pub mod ollama;

pub use anthropic::AnthropicProvider;
pub use ollama::OllamaProvider;

/// Capability surface of one configured backend.
///
/// Implementations are stateless and cheap to share; a new set is built on
/// every configuration reload.
pub trait Provider: Send + Sync + std::fmt::Debug {
    /// Configured provider name (unique per relay instance).
    fn name(&self) -> &str;

    /// Base URL requests are rewritten onto.
    fn base_url(&self) -> &str;

    /// Inject this provider's credentials into an outbound request.
    ///
    /// Called with the key selected from the provider's pool; adapters for
    /// unauthenticated backends ignore it.
    fn authenticate(&self, headers: &mut HeaderMap, api_key: &str);

    /// Whether a client request header should be forwarded upstream.
    fn forwards_header(&self, name: &str) -> bool {
        name.to_ascii_lowercase().starts_with("anthropic-")
    }

    /// Whether the client's own `Authorization` header may be passed
    /// through unchanged (subscription / OAuth mode).
    fn supports_transparent_auth(&self) -> bool;

    /// Whether SSE streaming responses are supported.
    fn supports_streaming(&self) -> bool {
        true
    }

    /// Models advertised by this backend, for `GET /v1/models`.
    fn models(&self) -> Vec<String>;

    /// URL the synthetic health checker probes, `None` for a no-op check.
    fn probe_url(&self) -> Option<String> {
        Some(self.base_url().to_string())
    }
}

/// Build an adapter for a configured provider type.
pub fn create_provider(
    kind: &str,
    name: &str,
    base_url: &str,
    models: Vec<String>,
) -> Result<Arc<dyn Provider>, RelayError> {
    match kind {
        "anthropic" | "zai" => Ok(Arc::new(AnthropicProvider::new(name, base_url, models))),
        "ollama" => Ok(Arc::new(OllamaProvider::new(name, base_url, models))),
        "bedrock" | "vertex" | "azure" => Err(RelayError::Configuration {
            message: format!(
                "provider {name}: type {kind} needs its cloud adapter, which is not built into this relay"
            ),
        }),
        other => Err(RelayError::ProviderNotSupported {
            kind: other.to_string(),
        }),
    }
}
