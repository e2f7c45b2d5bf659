//! Adapter for the Anthropic API and byte-compatible clones (Z.AI and
//! friends). Credentials ride in `x-api-key`; a default `anthropic-version`
//! is supplied when the client did not send one.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};

use super::Provider;

/// API version injected when the client omits `anthropic-version`.
const DEFAULT_API_VERSION: &str = "2023-06-01";

#[derive(Debug)]
pub struct AnthropicProvider {
    name: String,
    base_url: String,
    models: Vec<String>,
}

impl AnthropicProvider {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, models: Vec<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            models,
        }
    }
}

impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authenticate(&self, headers: &mut HeaderMap, api_key: &str) {
        // Configured-key mode replaces whatever credential the client sent.
        headers.remove(AUTHORIZATION);
        if let Ok(value) = HeaderValue::from_str(api_key) {
            headers.insert("x-api-key", value);
        }
        if !headers.contains_key("anthropic-version") {
            headers.insert(
                "anthropic-version",
                HeaderValue::from_static(DEFAULT_API_VERSION),
            );
        }
    }

    fn supports_transparent_auth(&self) -> bool {
        true
    }

    fn models(&self) -> Vec<String> {
        self.models.clone()
    }
}
