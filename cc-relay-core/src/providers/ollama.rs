//! Adapter for a local Ollama instance exposing the Messages-compatible
//! endpoint. Ollama is unauthenticated, so credential injection is a no-op
//! and any client credential headers are simply dropped.

use reqwest::header::{HeaderMap, AUTHORIZATION};

use super::Provider;

#[derive(Debug)]
pub struct OllamaProvider {
    name: String,
    base_url: String,
    models: Vec<String>,
}

impl OllamaProvider {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, models: Vec<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            models,
        }
    }
}

impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authenticate(&self, headers: &mut HeaderMap, _api_key: &str) {
        headers.remove(AUTHORIZATION);
        headers.remove("x-api-key");
    }

    fn supports_transparent_auth(&self) -> bool {
        true
    }

    fn models(&self) -> Vec<String> {
        self.models.clone()
    }

    // The Ollama root answers 200 with a plain-text banner, which is all
    // the synthetic checker needs.
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn strips_client_credentials() {
        let provider = OllamaProvider::new("local", "http://localhost:11434", vec![]);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        headers.insert("x-api-key", HeaderValue::from_static("sk-123"));
        provider.authenticate(&mut headers, "ignored");
        assert!(headers.is_empty());
    }

    #[test]
    fn probe_targets_the_base_url() {
        let provider = OllamaProvider::new("local", "http://localhost:11434/", vec![]);
        assert_eq!(
            provider.probe_url().as_deref(),
            Some("http://localhost:11434")
        );
    }
}
