//! # Health Tracker
//!
//! Thread-safe map from provider name to its circuit breaker, created
//! lazily on first reference. The tracker is the only owner of breakers;
//! everything else sees health through the boolean closures handed out by
//! [`HealthTracker::is_healthy_fn`], which keeps the router free of any
//! dependency on breaker types.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use crate::error::RelayError;

/// Closure reporting whether a provider is currently routable.
pub type IsHealthyFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// Snapshot of one provider's breaker for the health surface.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub provider: String,
    pub state: String,
    pub consecutive_failures: u32,
}

/// Owns one circuit breaker per provider name.
pub struct HealthTracker {
    config: RwLock<BreakerConfig>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl HealthTracker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config: RwLock::new(config),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch the breaker for a provider, creating it on first reference.
    pub fn breaker(&self, provider: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().unwrap().get(provider) {
            return Arc::clone(breaker);
        }
        // Double-checked: another thread may have created it between the
        // read unlock and the write lock.
        let mut breakers = self.breakers.write().unwrap();
        Arc::clone(breakers.entry(provider.to_string()).or_insert_with(|| {
            let config = self.config.read().unwrap().clone();
            Arc::new(CircuitBreaker::new(provider, config))
        }))
    }

    /// Admission handshake for a provider; see [`CircuitBreaker::allow`].
    pub fn allow(&self, provider: &str) -> Result<crate::breaker::BreakerPermit, RelayError> {
        self.breaker(provider).allow()
    }

    /// A closure over this tracker reporting `state != OPEN` for `provider`.
    ///
    /// The closure lazily creates the breaker on first call, so providers
    /// registered after the closure was built still resolve.
    pub fn is_healthy_fn(self: &Arc<Self>, provider: &str) -> IsHealthyFn {
        let tracker = Arc::clone(self);
        let provider = provider.to_string();
        Arc::new(move || tracker.breaker(&provider).state() != CircuitState::Open)
    }

    pub fn record_success(&self, provider: &str) {
        self.breaker(provider).record_success();
    }

    pub fn record_failure(&self, provider: &str) {
        self.breaker(provider).record_failure();
    }

    pub fn state(&self, provider: &str) -> CircuitState {
        self.breaker(provider).state()
    }

    /// Drop all breakers and install new transition parameters.
    ///
    /// Called on hot-reload when breaker parameters changed; accumulated
    /// state is intentionally discarded along with the old parameters.
    pub fn reset(&self, config: BreakerConfig) {
        *self.config.write().unwrap() = config;
        self.breakers.write().unwrap().clear();
        tracing::info!("health tracker reset with new breaker parameters");
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        self.config.read().unwrap().clone()
    }

    /// Per-provider snapshot for the health endpoint.
    pub fn snapshot(&self) -> Vec<ProviderHealth> {
        let breakers = self.breakers.read().unwrap();
        let mut entries: Vec<ProviderHealth> = breakers
            .iter()
            .map(|(name, breaker)| ProviderHealth {
                provider: name.clone(),
                state: match breaker.state() {
                    CircuitState::Closed => "closed".to_string(),
                    CircuitState::Open => "open".to_string(),
                    CircuitState::HalfOpen => "half-open".to_string(),
                },
                consecutive_failures: breaker.consecutive_failures(),
            })
            .collect();
        entries.sort_by(|a, b| a.provider.cmp(&b.provider));
        entries
    }
}
