//! # Live-Config Lifecycle
//!
//! Owns the hot-reloadable half of the relay. The configuration snapshot
//! sits behind an atomic pointer ([`arc_swap::ArcSwap`]); a reload parses
//! and validates the file, then republishes the snapshot and rebuilds the
//! dependent live views:
//!
//! - **Key pools** are rebuilt from scratch. Requests already holding the
//!   old pool keep using it until they finish — the `Arc` keeps it alive —
//!   while new requests see the new pool.
//! - **Health tracker** is reset only when the breaker parameters
//!   actually changed; otherwise accumulated state survives.
//! - **Health checker** re-registers its probe set; it is restarted only
//!   when the interval or the enabled flag changed.
//! - **Router** is swapped only when the strategy, failover timeout or
//!   trigger set changed. An unchanged router keeps its counters, so
//!   round-robin does not regress to provider zero on every reload —
//!   [`Lifecycle::router`] must return the same instance for the same
//!   routing configuration.
//!
//! An invalid reload leaves every snapshot in place and logs the parse or
//! validation error.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use cc_relay_core::cache::{CacheBackend, MemoryCache, RedisCache};
use cc_relay_core::checker::{HealthChecker, ProbeKind, ProviderCheck};
use cc_relay_core::health::HealthTracker;
use cc_relay_core::pool::{KeyPool, PooledKey};
use cc_relay_core::providers::create_provider;
use cc_relay_core::routing::{
    default_triggers, strategy_from_name, triggers_from_names, ProviderInfo, ProviderRouter,
};
use cc_relay_core::selector::selector_from_name;
use cc_relay_core::keys::KeyMetadata;

use crate::config::{CacheBackendKind, Config, RoutingConfig};
use crate::signature::SignatureCache;

/// The per-reload product: provider views plus their key pools.
pub struct LiveState {
    pub providers: Vec<Arc<ProviderInfo>>,
    pub pools: HashMap<String, Arc<KeyPool>>,
}

/// Hot-reload coordinator and live accessor hub.
pub struct Lifecycle {
    config_path: Option<String>,
    config: ArcSwap<Config>,
    state: ArcSwap<LiveState>,
    router: ArcSwap<ProviderRouter>,
    tracker: Arc<HealthTracker>,
    checker: tokio::sync::Mutex<Arc<HealthChecker>>,
    signature_cache: ArcSwap<SignatureCache>,
    cache_backend: Arc<dyn CacheBackend>,
}

impl Lifecycle {
    /// Build all live views from a validated startup configuration.
    pub async fn new(config: Config, config_path: Option<String>) -> anyhow::Result<Arc<Self>> {
        let cache_backend = build_cache_backend(&config).await?;
        let signature_cache = SignatureCache::new(Arc::clone(&cache_backend), config.cache.ttl());

        let tracker = Arc::new(HealthTracker::new(config.health.breaker_config()));
        let state = build_state(&config, &tracker)?;

        let router = build_router(&config.routing);

        let checker = Arc::new(HealthChecker::new(
            Arc::clone(&tracker),
            config.health.check_interval(),
        ));
        checker.register(build_checks(&state));
        if config.health.enabled {
            checker.start();
        }

        Ok(Arc::new(Self {
            config_path,
            config: ArcSwap::from_pointee(config),
            state: ArcSwap::new(Arc::new(state)),
            router: ArcSwap::new(Arc::new(router)),
            tracker,
            checker: tokio::sync::Mutex::new(checker),
            signature_cache: ArcSwap::from_pointee(signature_cache),
            cache_backend,
        }))
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    /// Current provider views and pools.
    pub fn state(&self) -> Arc<LiveState> {
        self.state.load_full()
    }

    /// Current router. Re-fetched per request by the handler, which is
    /// what makes strategy swaps hot.
    pub fn router(&self) -> Arc<ProviderRouter> {
        self.router.load_full()
    }

    pub fn tracker(&self) -> Arc<HealthTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn signature_cache(&self) -> Arc<SignatureCache> {
        self.signature_cache.load_full()
    }

    /// Key pool for a provider, if it exists in the current snapshot.
    pub fn pool(&self, provider: &str) -> Option<Arc<KeyPool>> {
        self.state.load().pools.get(provider).cloned()
    }

    /// Re-read the configuration file and apply it.
    ///
    /// Any parse or validation failure leaves the last-good snapshot in
    /// place.
    pub async fn reload_from_file(&self) {
        let Some(path) = self.config_path.as_deref() else {
            tracing::warn!("reload requested but no config file path is set");
            return;
        };
        match Config::load(path) {
            Ok(config) => {
                if let Err(err) = self.apply(config).await {
                    tracing::error!(error = %err, "reload failed, keeping previous configuration");
                }
            }
            Err(err) => {
                tracing::error!(error = %err, path, "invalid configuration, keeping previous");
            }
        }
    }

    /// Apply an already-validated configuration snapshot.
    pub async fn apply(&self, config: Config) -> anyhow::Result<()> {
        let previous = self.config.load_full();

        // Breakers are reset only when their parameters changed; the loss
        // of accumulated state is acceptable exactly because the operator
        // changed the rules.
        if previous.health.breaker_config() != config.health.breaker_config() {
            self.tracker.reset(config.health.breaker_config());
        }

        // Build the new pools and provider views before publishing
        // anything, so a bad provider entry aborts the whole reload.
        let state = Arc::new(build_state(&config, &self.tracker)?);

        // Router identity is preserved unless the routing section changed;
        // a fresh router would reset round-robin counters and WRR credit.
        if routing_changed(&previous.routing, &config.routing) {
            self.router.store(Arc::new(build_router(&config.routing)));
            tracing::info!(strategy = %config.routing.strategy, "router rebuilt");
        }

        // Checker: re-register always; restart only when its own knobs
        // changed.
        {
            let mut checker = self.checker.lock().await;
            let cadence_changed = previous.health.check_interval() != config.health.check_interval()
                || previous.health.enabled != config.health.enabled;
            if cadence_changed {
                checker.stop().await;
                let fresh = Arc::new(HealthChecker::new(
                    Arc::clone(&self.tracker),
                    config.health.check_interval(),
                ));
                fresh.register(build_checks(&state));
                if config.health.enabled {
                    fresh.start();
                }
                *checker = fresh;
            } else {
                checker.register(build_checks(&state));
            }
        }

        if previous.cache.ttl() != config.cache.ttl() {
            self.signature_cache.store(Arc::new(SignatureCache::new(
                Arc::clone(&self.cache_backend),
                config.cache.ttl(),
            )));
        }

        self.state.store(state);
        self.config.store(Arc::new(config));
        tracing::info!("configuration reloaded");
        Ok(())
    }

    /// Stop background workers; called during shutdown after the listener
    /// has drained.
    pub async fn shutdown(&self) {
        self.checker.lock().await.stop().await;
    }
}

fn routing_changed(previous: &RoutingConfig, next: &RoutingConfig) -> bool {
    previous.strategy != next.strategy
        || previous.failover_timeout_ms != next.failover_timeout_ms
        || previous.failover_triggers != next.failover_triggers
}

fn build_router(routing: &RoutingConfig) -> ProviderRouter {
    let triggers = match &routing.failover_triggers {
        Some(names) => triggers_from_names(names),
        None => default_triggers(),
    };
    ProviderRouter::new(
        strategy_from_name(&routing.strategy),
        triggers,
        routing.failover_timeout(),
    )
}

fn build_state(config: &Config, tracker: &Arc<HealthTracker>) -> anyhow::Result<LiveState> {
    let mut providers = Vec::new();
    let mut pools = HashMap::new();

    for entry in config.enabled_providers() {
        let provider = create_provider(
            &entry.kind,
            &entry.name,
            &entry.base_url,
            entry.models.clone(),
        )
        .map_err(|err| anyhow::anyhow!("provider {}: {err}", entry.name))?;

        let keys: Vec<Arc<PooledKey>> = entry
            .keys
            .iter()
            .enumerate()
            .map(|(i, key)| {
                let id = key.name.clone().unwrap_or_else(|| format!("key-{i}"));
                let meta = KeyMetadata::new(key.rpm, key.input_tpm, key.output_tpm)
                    .with_priority(key.priority)
                    .with_weight(key.weight);
                Arc::new(PooledKey::new(id, key.api_key.clone(), meta))
            })
            .collect();

        pools.insert(
            entry.name.clone(),
            Arc::new(KeyPool::new(
                entry.name.clone(),
                keys,
                selector_from_name(&entry.key_strategy),
            )),
        );

        providers.push(Arc::new(ProviderInfo::new(
            provider,
            entry.weight,
            entry.priority,
            tracker.is_healthy_fn(&entry.name),
        )));
    }

    Ok(LiveState { providers, pools })
}

fn build_checks(state: &LiveState) -> Vec<ProviderCheck> {
    state
        .providers
        .iter()
        .map(|info| ProviderCheck {
            provider: info.name().to_string(),
            probe: match info.provider.probe_url() {
                Some(url) => ProbeKind::Http { url },
                None => ProbeKind::AlwaysHealthy,
            },
        })
        .collect()
}

async fn build_cache_backend(config: &Config) -> anyhow::Result<Arc<dyn CacheBackend>> {
    match (&config.cache.enabled, &config.cache.backend) {
        (false, _) | (true, CacheBackendKind::Memory) => {
            Ok(Arc::new(MemoryCache::new(config.cache.max_entries)))
        }
        (true, CacheBackendKind::Redis) => {
            let url = config
                .cache
                .url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("redis cache backend requires a url"))?;
            Ok(Arc::new(RedisCache::connect(url).await?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(strategy: &str, debug: bool) -> Config {
        let raw = format!(
            r#"
            [[providers]]
            name = "a"
            type = "anthropic"
            base_url = "https://a.test"

            [[providers.keys]]
            api_key = "sk-a"
            rpm = 100

            [[providers]]
            name = "b"
            type = "anthropic"
            base_url = "https://b.test"

            [[providers.keys]]
            api_key = "sk-b"
            rpm = 100

            [routing]
            strategy = "{strategy}"
            failover_timeout_ms = 5000
            debug = {debug}
            "#
        );
        Config::parse(&raw).expect("test config")
    }

    #[tokio::test]
    async fn builds_pools_and_providers() {
        let lifecycle = Lifecycle::new(config("round-robin", false), None)
            .await
            .unwrap();
        let state = lifecycle.state();
        assert_eq!(state.providers.len(), 2);
        assert!(lifecycle.pool("a").is_some());
        assert!(lifecycle.pool("b").is_some());
        assert!(lifecycle.pool("missing").is_none());
        lifecycle.shutdown().await;
    }

    #[tokio::test]
    async fn router_identity_survives_unrelated_reload() {
        let lifecycle = Lifecycle::new(config("round-robin", false), None)
            .await
            .unwrap();
        let before = lifecycle.router();

        // Toggling debug does not touch the routing strategy or timeout.
        lifecycle.apply(config("round-robin", true)).await.unwrap();
        let after = lifecycle.router();
        assert!(Arc::ptr_eq(&before, &after), "router must not be rebuilt");
        lifecycle.shutdown().await;
    }

    #[tokio::test]
    async fn router_is_rebuilt_when_strategy_changes() {
        let lifecycle = Lifecycle::new(config("round-robin", false), None)
            .await
            .unwrap();
        let before = lifecycle.router();

        lifecycle.apply(config("failover", false)).await.unwrap();
        let after = lifecycle.router();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.strategy_name(), "failover");
        lifecycle.shutdown().await;
    }

    #[tokio::test]
    async fn old_pool_survives_for_inflight_requests() {
        let lifecycle = Lifecycle::new(config("round-robin", false), None)
            .await
            .unwrap();
        let held = lifecycle.pool("a").unwrap();

        lifecycle.apply(config("round-robin", true)).await.unwrap();
        let fresh = lifecycle.pool("a").unwrap();
        assert!(!Arc::ptr_eq(&held, &fresh), "pools are rebuilt on reload");
        // The held reference still works for the request that owns it.
        assert!(held.get_key().is_ok());
        lifecycle.shutdown().await;
    }

    #[tokio::test]
    async fn breaker_state_survives_reload_with_same_params() {
        let lifecycle = Lifecycle::new(config("round-robin", false), None)
            .await
            .unwrap();
        let tracker = lifecycle.tracker();
        tracker.record_failure("a");
        tracker.record_failure("a");

        lifecycle.apply(config("round-robin", true)).await.unwrap();
        assert_eq!(lifecycle.tracker().breaker("a").consecutive_failures(), 2);
        lifecycle.shutdown().await;
    }
}
