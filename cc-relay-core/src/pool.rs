//! # Key Pool
//!
//! One [`KeyPool`] per provider coordinates key selection, per-key rate
//! limiting and header-driven limit learning. The pool exclusively owns its
//! keys: they are created at construction and replaced only when the pool
//! is rebuilt after a configuration reload.
//!
//! ## Admission
//!
//! [`KeyPool::get_key`] snapshots the key list under a read lock, asks the
//! selector for a candidate, then runs that candidate through its request
//! bucket *after* dropping the pool lock — the limiter's mutex is never
//! held under the pool's. Rejected candidates are excluded for the rest of
//! the call and selection retries up to the key count before surfacing
//! `all-keys-exhausted`.
//!
//! ## Learning
//!
//! [`KeyPool::update_key_from_headers`] merges `anthropic-ratelimit-*`
//! response headers into the key's metadata and re-parameterises its
//! buckets in the same per-key critical section, so request N's learned
//! limits are visible to request N+1's admission check.

use std::collections::HashSet;
use std::sync::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde::Serialize;

use crate::error::RelayError;
use crate::keys::{KeyMetadata, KeyPriority, RateLimitHeaders};
use crate::limiter::KeyLimiter;
use crate::selector::KeySelector;

/// A configured key and its runtime state.
///
/// The limiter is authoritative for admission; the metadata is advisory
/// and steers selection.
pub struct PooledKey {
    id: String,
    secret: String,
    limiter: KeyLimiter,
    meta: Mutex<KeyMetadata>,
}

impl PooledKey {
    pub fn new(id: impl Into<String>, secret: impl Into<String>, meta: KeyMetadata) -> Self {
        let limiter = KeyLimiter::new(meta.rpm_limit, meta.itpm_limit + meta.otpm_limit);
        Self {
            id: id.into(),
            secret: secret.into(),
            limiter,
            meta: Mutex::new(meta),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn limiter(&self) -> &KeyLimiter {
        &self.limiter
    }

    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.meta.lock().unwrap().is_available(now)
    }

    pub fn capacity_score(&self, now: DateTime<Utc>) -> f64 {
        self.meta.lock().unwrap().capacity_score(now)
    }

    pub fn priority(&self) -> KeyPriority {
        self.meta.lock().unwrap().priority
    }

    pub fn metadata(&self) -> KeyMetadata {
        self.meta.lock().unwrap().clone()
    }

    pub fn set_cooldown(&self, until: DateTime<Utc>) {
        self.meta.lock().unwrap().cooldown_until = Some(until);
    }

    /// Merge learned headers and resynchronise the buckets.
    ///
    /// The per-key mutex serialises header updates; `set_limit` happens
    /// after the metadata write inside the same critical section.
    fn learn(&self, headers: &RateLimitHeaders) {
        let mut meta = self.meta.lock().unwrap();
        meta.apply(headers);
        self.limiter
            .set_limit(meta.rpm_limit, meta.itpm_limit + meta.otpm_limit);
        let token_remaining = match (meta.itpm_remaining, meta.otpm_remaining) {
            (Some(input), Some(output)) => Some(input + output),
            (Some(input), None) => Some(input),
            (None, Some(output)) => Some(output),
            (None, None) => None,
        };
        self.limiter.sync_remaining(meta.rpm_remaining, token_remaining);
    }

    /// Earliest instant at which this key could admit another request.
    fn next_admission(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let meta = self.meta.lock().unwrap();
        let bucket_ready = now
            + chrono::Duration::from_std(self.limiter.next_request_available())
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut earliest = bucket_ready;
        if let Some(reset) = meta.rpm_reset {
            earliest = earliest.min(reset.max(now));
        }
        if let Some(cooldown) = meta.cooldown_until {
            earliest = earliest.max(cooldown);
        }
        earliest
    }

    #[cfg(test)]
    pub fn for_tests(id: &str, meta: KeyMetadata) -> Self {
        Self::new(id, format!("sk-test-{id}"), meta)
    }
}

impl std::fmt::Debug for PooledKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never leak the secret through Debug output.
        f.debug_struct("PooledKey").field("id", &self.id).finish()
    }
}

/// A successful key acquisition.
#[derive(Debug, Clone)]
pub struct KeyLease {
    pub key_id: String,
    pub api_key: String,
}

/// Per-key observability snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct KeyStats {
    pub id: String,
    pub available: bool,
    pub capacity_score: f64,
    pub requests_available: u64,
    pub tokens_available: u64,
    pub cooldown_until: Option<DateTime<Utc>>,
}

/// Aggregate pool snapshot for the health surface.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub provider: String,
    pub total_keys: usize,
    pub available_keys: usize,
    pub keys: Vec<KeyStats>,
}

/// All keys configured for a single provider, plus a selection strategy.
pub struct KeyPool {
    provider: String,
    keys: RwLock<Vec<Arc<PooledKey>>>,
    selector: Box<dyn KeySelector>,
}

impl KeyPool {
    pub fn new(
        provider: impl Into<String>,
        keys: Vec<Arc<PooledKey>>,
        selector: Box<dyn KeySelector>,
    ) -> Self {
        Self {
            provider: provider.into(),
            keys: RwLock::new(keys),
            selector,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn len(&self) -> usize {
        self.keys.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Select a key and admit one request against its bucket.
    ///
    /// Candidates rejected by their request bucket are excluded for the
    /// remainder of this call; after every key has been tried the pool
    /// reports exhaustion.
    pub fn get_key(&self) -> Result<KeyLease, RelayError> {
        // Snapshot the Arc list so the pool lock is not held across the
        // selector or the limiter.
        let snapshot: Vec<Arc<PooledKey>> = self.keys.read().unwrap().clone();
        if snapshot.is_empty() {
            return Err(RelayError::AllKeysExhausted {
                provider: self.provider.clone(),
            });
        }

        let mut excluded: HashSet<String> = HashSet::new();
        for _ in 0..snapshot.len() {
            let candidates: Vec<Arc<PooledKey>> = snapshot
                .iter()
                .filter(|key| !excluded.contains(key.id()))
                .cloned()
                .collect();

            let candidate = match self.selector.select(&candidates) {
                Ok(key) => key,
                Err(_) => break,
            };

            match candidate.limiter().allow() {
                Ok(()) => {
                    tracing::debug!(
                        provider = %self.provider,
                        key_id = %candidate.id(),
                        strategy = self.selector.name(),
                        "key admitted"
                    );
                    return Ok(KeyLease {
                        key_id: candidate.id().to_string(),
                        api_key: candidate.secret().to_string(),
                    });
                }
                Err(_) => {
                    excluded.insert(candidate.id().to_string());
                }
            }
        }

        Err(RelayError::AllKeysExhausted {
            provider: self.provider.clone(),
        })
    }

    /// Pessimistically debit expected output tokens from a key's budget.
    ///
    /// The reservation saturates at an empty bucket; learned headers true
    /// the balance up once the real usage is known.
    pub fn reserve_tokens(&self, key_id: &str, tokens: u64) {
        if let Some(key) = self.find(key_id) {
            key.limiter().reserve(tokens);
        }
    }

    /// Learn limits from a backend response's rate-limit headers.
    pub fn update_key_from_headers(&self, key_id: &str, headers: &HeaderMap) {
        let parsed = RateLimitHeaders::parse(headers);
        if parsed.is_empty() {
            return;
        }
        if let Some(key) = self.find(key_id) {
            key.learn(&parsed);
            tracing::debug!(
                provider = %self.provider,
                key_id,
                "rate limits learned from response headers"
            );
        }
    }

    /// Put a key on cooldown after a backend 429.
    pub fn mark_key_exhausted(&self, key_id: &str, retry_after: Duration) {
        if let Some(key) = self.find(key_id) {
            let until = Utc::now()
                + chrono::Duration::from_std(retry_after)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));
            key.set_cooldown(until);
            tracing::info!(
                provider = %self.provider,
                key_id,
                retry_after_secs = retry_after.as_secs(),
                "key marked exhausted"
            );
        }
    }

    /// The earliest instant any key could admit a request again.
    ///
    /// Drives the `Retry-After` header when the whole pool is exhausted.
    pub fn earliest_reset(&self) -> Option<DateTime<Utc>> {
        let now = Utc::now();
        self.keys
            .read()
            .unwrap()
            .iter()
            .map(|key| key.next_admission(now))
            .min()
    }

    /// Aggregate snapshot for observability.
    pub fn stats(&self) -> PoolStats {
        let now = Utc::now();
        let keys = self.keys.read().unwrap();
        let key_stats: Vec<KeyStats> = keys
            .iter()
            .map(|key| {
                let usage = key.limiter().usage();
                let meta = key.metadata();
                KeyStats {
                    id: key.id().to_string(),
                    available: meta.is_available(now),
                    capacity_score: meta.capacity_score(now),
                    requests_available: usage.requests_available,
                    tokens_available: usage.tokens_available,
                    cooldown_until: meta.cooldown_until,
                }
            })
            .collect();
        PoolStats {
            provider: self.provider.clone(),
            total_keys: keys.len(),
            available_keys: key_stats.iter().filter(|k| k.available).count(),
            keys: key_stats,
        }
    }

    fn find(&self, key_id: &str) -> Option<Arc<PooledKey>> {
        self.keys
            .read()
            .unwrap()
            .iter()
            .find(|key| key.id() == key_id)
            .cloned()
    }
}
