//! # Configuration Management Module
//!
//! TOML configuration for the relay: server binding, logging, the
//! signature cache, providers with their key pools, routing strategy and
//! health-check parameters.
//!
//! `${VAR}` references in the file are expanded from the environment
//! before parsing, so API keys never need to live on disk:
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8787
//!
//! [auth]
//! api_key = "${CC_RELAY_API_KEY}"
//! allow_passthrough = true
//!
//! [[providers]]
//! name = "anthropic"
//! type = "anthropic"
//! base_url = "https://api.anthropic.com"
//! models = ["claude-sonnet-4-20250514"]
//!
//! [[providers.keys]]
//! api_key = "${ANTHROPIC_KEY_1}"
//! rpm = 50
//!
//! [[providers.keys]]
//! api_key = "${ANTHROPIC_KEY_2}"
//! rpm = 50
//!
//! [routing]
//! strategy = "round-robin"
//! failover_timeout_ms = 5000
//! debug = false
//!
//! [health]
//! enabled = true
//! check_interval_ms = 30000
//! failure_threshold = 5
//! open_duration_ms = 60000
//! half_open_probes = 3
//! ```
//!
//! A parsed snapshot is validated before it is published; reloads that
//! fail validation leave the last-good snapshot in place.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cc_relay_core::breaker::BreakerConfig;
use cc_relay_core::keys::KeyPriority;

/// Root configuration snapshot. Immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// HTTP server settings. Fixed for the process lifetime — changing the
/// listener address or HTTP/2 flag requires a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Write timeout; generous because streaming responses run long.
    pub timeout_secs: u64,
    /// How long shutdown waits for in-flight requests to drain.
    pub drain_timeout_secs: u64,
    pub http2: bool,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            timeout_secs: 600,
            drain_timeout_secs: 30,
            http2: true,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

/// Signature-cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub backend: CacheBackendKind,
    /// Redis URL; only read for the redis backend.
    pub url: Option<String>,
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: CacheBackendKind::Memory,
            url: None,
            ttl_secs: 3600,
            max_entries: 10_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    Memory,
    Redis,
}

/// One backend and its key pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub base_url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub models: Vec<String>,
    /// Routing weight for the weighted strategy.
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Routing priority for the failover strategy; higher wins.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_key_strategy")]
    pub key_strategy: String,
    #[serde(default)]
    pub keys: Vec<KeyConfig>,
}

/// One API key inside a provider's pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    /// Optional label used in logs and stats; defaults to `key-<index>`.
    pub name: Option<String>,
    pub api_key: String,
    /// Requests per minute; zero = learn from response headers.
    #[serde(default)]
    pub rpm: u64,
    #[serde(default)]
    pub input_tpm: u64,
    #[serde(default)]
    pub output_tpm: u64,
    #[serde(default)]
    pub priority: KeyPriority,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoutingConfig {
    pub strategy: String,
    pub failover_timeout_ms: u64,
    /// Annotate responses with X-CC-Relay-Strategy / X-CC-Relay-Provider.
    #[serde(default)]
    pub debug: bool,
    /// Failover trigger names; `None` selects the default set.
    #[serde(default)]
    pub failover_triggers: Option<Vec<String>>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: "round-robin".to_string(),
            failover_timeout_ms: 5000,
            debug: false,
            failover_triggers: None,
        }
    }
}

impl RoutingConfig {
    pub fn failover_timeout(&self) -> Duration {
        Duration::from_millis(self.failover_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub check_interval_ms: u64,
    pub failure_threshold: u32,
    pub open_duration_ms: u64,
    pub half_open_probes: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: 30_000,
            failure_threshold: 5,
            open_duration_ms: 60_000,
            half_open_probes: 3,
        }
    }
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            open_duration: Duration::from_millis(self.open_duration_ms),
            half_open_probes: self.half_open_probes,
        }
    }
}

/// Client-facing authentication modes. Both may be active at once.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Fixed proxy API key clients present in `x-api-key`.
    pub api_key: Option<String>,
    /// Forward the client's `Authorization: Bearer …` to backends that
    /// advertise transparent auth.
    #[serde(default)]
    pub allow_passthrough: bool,
}

fn default_true() -> bool {
    true
}

fn default_weight() -> u32 {
    1
}

fn default_key_strategy() -> String {
    "least-loaded".to_string()
}

impl Config {
    /// Load, env-expand, parse and validate a configuration file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parse and validate configuration text.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let expanded = expand_env_vars(raw);
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.validate_server()?;
        self.validate_providers()?;
        self.validate_routing()?;
        self.validate_health()?;
        self.validate_cache()?;
        Ok(())
    }

    fn validate_server(&self) -> anyhow::Result<()> {
        if self.server.host.is_empty() {
            anyhow::bail!("server host cannot be empty");
        }
        if self.server.port == 0 {
            anyhow::bail!("server port must be between 1 and 65535");
        }
        if self.server.timeout_secs == 0 {
            anyhow::bail!("server timeout cannot be 0");
        }
        if self.server.max_body_bytes == 0 {
            anyhow::bail!("max body size cannot be 0");
        }
        Ok(())
    }

    fn validate_providers(&self) -> anyhow::Result<()> {
        if self.enabled_providers().next().is_none() {
            anyhow::bail!("at least one provider must be enabled");
        }

        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.name.is_empty() {
                anyhow::bail!("provider name cannot be empty");
            }
            if !seen.insert(&provider.name) {
                anyhow::bail!("duplicate provider name: {}", provider.name);
            }
            if !provider.base_url.starts_with("http://")
                && !provider.base_url.starts_with("https://")
            {
                anyhow::bail!(
                    "provider {} base_url must start with http:// or https://",
                    provider.name
                );
            }
            if !provider.enabled {
                continue;
            }
            if provider.keys.is_empty()
                && provider.kind != "ollama"
                && !self.auth.allow_passthrough
            {
                anyhow::bail!(
                    "provider {} has no keys and passthrough auth is disabled",
                    provider.name
                );
            }
            for (i, key) in provider.keys.iter().enumerate() {
                if key.api_key.is_empty() {
                    anyhow::bail!("provider {} key {} has an empty api_key", provider.name, i);
                }
            }
        }
        Ok(())
    }

    fn validate_routing(&self) -> anyhow::Result<()> {
        const KNOWN: [&str; 6] = [
            "round-robin",
            "round_robin",
            "shuffle",
            "weighted",
            "weighted-round-robin",
            "failover",
        ];
        if !KNOWN.contains(&self.routing.strategy.as_str()) {
            anyhow::bail!(
                "unknown routing strategy: {} (expected one of {})",
                self.routing.strategy,
                KNOWN.join(", ")
            );
        }
        if self.routing.failover_timeout_ms == 0 {
            anyhow::bail!("failover timeout cannot be 0");
        }
        Ok(())
    }

    fn validate_health(&self) -> anyhow::Result<()> {
        if self.health.failure_threshold == 0 {
            anyhow::bail!("health failure_threshold cannot be 0");
        }
        if self.health.open_duration_ms == 0 {
            anyhow::bail!("health open_duration_ms cannot be 0");
        }
        if self.health.half_open_probes == 0 {
            anyhow::bail!("health half_open_probes cannot be 0");
        }
        if self.health.enabled && self.health.check_interval_ms == 0 {
            anyhow::bail!("health check_interval_ms cannot be 0 while enabled");
        }
        Ok(())
    }

    fn validate_cache(&self) -> anyhow::Result<()> {
        if self.cache.enabled {
            if self.cache.ttl_secs == 0 {
                anyhow::bail!("cache ttl cannot be 0 while enabled");
            }
            if self.cache.backend == CacheBackendKind::Redis && self.cache.url.is_none() {
                anyhow::bail!("redis cache backend requires a url");
            }
        }
        Ok(())
    }

    /// Providers that participate in routing.
    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.iter().filter(|p| p.enabled)
    }
}

/// Expand `${VAR}` references from the environment.
///
/// Unset variables expand to the empty string with a warning; `$` not
/// followed by `{` passes through untouched.
pub fn expand_env_vars(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                match env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => {
                        tracing::warn!(var = name, "environment variable not set, expanding empty");
                    }
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                // Unterminated reference; keep the text as written.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
