//! # Key Selection Strategies
//!
//! A [`KeySelector`] picks one key out of a provider's pool. Two
//! implementations ship:
//!
//! - **Least-loaded** — highest capacity score wins; ties go to the first
//!   key in iteration order (stable, not random).
//! - **Round-robin** — an atomic counter indexed modulo the *available*
//!   subset, so the counter always lands on a usable key and drift stays
//!   even over long runs.
//!
//! Both filter out keys failing availability before deciding. Selection is
//! advisory — the pool still runs the chosen key through its rate limiter
//! and retries on rejection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;

use crate::error::RelayError;
use crate::pool::PooledKey;

/// Strategy contract: one key out of the slice, or nothing usable.
pub trait KeySelector: Send + Sync {
    /// Strategy name as it appears in configuration and logs.
    fn name(&self) -> &'static str;

    /// Pick a key, or fail with [`RelayError::CapacityExhausted`] when no
    /// key in the slice is available.
    fn select(&self, keys: &[Arc<PooledKey>]) -> Result<Arc<PooledKey>, RelayError>;
}

/// Picks the key with the most remaining capacity.
#[derive(Debug, Default)]
pub struct LeastLoadedSelector;

impl KeySelector for LeastLoadedSelector {
    fn name(&self) -> &'static str {
        "least-loaded"
    }

    fn select(&self, keys: &[Arc<PooledKey>]) -> Result<Arc<PooledKey>, RelayError> {
        let now = Utc::now();
        let mut best: Option<(&Arc<PooledKey>, f64)> = None;
        for key in keys {
            if !key.is_available(now) {
                continue;
            }
            let score = key.capacity_score(now);
            match best {
                // Strictly-greater keeps the first key on ties.
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((key, score)),
            }
        }
        best.map(|(key, _)| Arc::clone(key))
            .ok_or(RelayError::CapacityExhausted)
    }
}

/// Cycles over the available subset with an atomic counter.
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    counter: AtomicU64,
}

impl KeySelector for RoundRobinSelector {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn select(&self, keys: &[Arc<PooledKey>]) -> Result<Arc<PooledKey>, RelayError> {
        let now = Utc::now();
        let available: Vec<&Arc<PooledKey>> =
            keys.iter().filter(|k| k.is_available(now)).collect();
        if available.is_empty() {
            return Err(RelayError::CapacityExhausted);
        }
        let turn = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::clone(available[(turn % available.len() as u64) as usize]))
    }
}

/// Map a configured strategy name onto a selector.
///
/// Unknown names fall back to least-loaded with a warning rather than
/// failing the whole pool build.
pub fn selector_from_name(name: &str) -> Box<dyn KeySelector> {
    match name {
        "round-robin" | "round_robin" => Box::new(RoundRobinSelector::default()),
        "least-loaded" | "least_loaded" => Box::new(LeastLoadedSelector),
        other => {
            tracing::warn!(
                strategy = other,
                "unknown key selection strategy, using least-loaded"
            );
            Box::new(LeastLoadedSelector)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyMetadata;

    fn key(id: &str, rpm_limit: u64, rpm_remaining: Option<u64>) -> Arc<PooledKey> {
        let mut meta = KeyMetadata::new(rpm_limit, 0, 0);
        meta.rpm_remaining = rpm_remaining;
        Arc::new(PooledKey::for_tests(id, meta))
    }

    #[test]
    fn least_loaded_prefers_highest_score() {
        let keys = vec![
            key("a", 100, Some(10)),
            key("b", 100, Some(90)),
            key("c", 100, Some(50)),
        ];
        let selected = LeastLoadedSelector.select(&keys).unwrap();
        assert_eq!(selected.id(), "b");
    }

    #[test]
    fn least_loaded_ties_go_to_first() {
        let keys = vec![key("a", 100, Some(50)), key("b", 100, Some(50))];
        let selected = LeastLoadedSelector.select(&keys).unwrap();
        assert_eq!(selected.id(), "a");
    }

    #[test]
    fn round_robin_cycles_available_subset() {
        let selector = RoundRobinSelector::default();
        let keys = vec![key("a", 0, None), key("b", 0, None), key("c", 0, None)];

        let picks: Vec<String> = (0..6)
            .map(|_| selector.select(&keys).unwrap().id().to_string())
            .collect();
        assert_eq!(picks, ["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn round_robin_skips_cooled_down_keys() {
        let selector = RoundRobinSelector::default();
        let cooled = key("a", 0, None);
        cooled.set_cooldown(Utc::now() + chrono::Duration::seconds(60));
        let keys = vec![cooled, key("b", 0, None), key("c", 0, None)];

        for _ in 0..4 {
            let picked = selector.select(&keys).unwrap();
            assert_ne!(picked.id(), "a");
        }
    }

    #[test]
    fn empty_slice_is_exhausted() {
        assert!(matches!(
            LeastLoadedSelector.select(&[]),
            Err(RelayError::CapacityExhausted)
        ));
        assert!(matches!(
            RoundRobinSelector::default().select(&[]),
            Err(RelayError::CapacityExhausted)
        ));
    }
}
