//! # cc-relay-core
//!
//! The request-plane engine behind cc-relay: everything needed to spread
//! Anthropic-Messages traffic across providers and keys while tolerating
//! backend failure.
//!
//! ## Components
//!
//! - **Key plane** — [`limiter`] (per-key token buckets), [`keys`]
//!   (metadata learned from `anthropic-ratelimit-*` headers), [`selector`]
//!   (least-loaded / round-robin key choice) and [`pool`] (the per-provider
//!   coordinator tying those together).
//! - **Health plane** — [`breaker`] (three-state circuit breaker with a
//!   two-step outcome handshake), [`health`] (one breaker per provider,
//!   handed out as boolean closures) and [`checker`] (synthetic probes for
//!   open circuits).
//! - **Routing plane** — [`routing`]: round-robin, shuffle, smooth-weighted
//!   and failover strategies, pluggable failover triggers, and the
//!   first-success-wins parallel race.
//! - **Edges** — [`providers`] (backend capability adapters) and [`cache`]
//!   (the byte-oriented backend the signature interceptor stores against).
//!
//! The HTTP surface (proxy handler, configuration lifecycle, SSE
//! forwarding) lives in the `cc-relay-gateway` crate; this crate has no
//! opinion about how requests arrive.

pub mod breaker;
pub mod cache;
pub mod checker;
pub mod error;
pub mod health;
pub mod keys;
pub mod limiter;
pub mod pool;
pub mod providers;
pub mod routing;
pub mod selector;

pub use breaker::{BreakerConfig, BreakerPermit, CircuitBreaker, CircuitState};
pub use cache::{CacheBackend, MemoryCache, RedisCache};
pub use checker::{HealthChecker, ProbeKind, ProviderCheck};
pub use error::RelayError;
pub use health::{HealthTracker, IsHealthyFn};
pub use keys::{KeyMetadata, KeyPriority, RateLimitHeaders};
pub use limiter::{KeyLimiter, LimiterUsage};
pub use pool::{KeyLease, KeyPool, PoolStats, PooledKey};
pub use providers::{create_provider, Provider};
pub use routing::{
    default_triggers, strategy_from_name, triggers_from_names, FailoverTrigger, ProviderInfo,
    ProviderRouter, RouterStrategy,
};
pub use selector::{selector_from_name, KeySelector};
