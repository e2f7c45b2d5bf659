//! # Provider Routing Module
//!
//! Strategy-driven provider selection plus parallel-race failover. A
//! [`ProviderRouter`] owns one strategy and a set of failover triggers;
//! [`ProviderRouter::select_with_retry`] drives a whole dispatch: primary
//! attempt, trigger consultation, then a first-success-wins race across
//! every healthy candidate.
//!
//! ## Strategies
//!
//! - **Round-robin** — atomic counter modulo the healthy subset; filtering
//!   is redone per call so transient unhealth reshapes the rotation.
//! - **Shuffle** — deals the healthy set like a deck of cards: Fisher-Yates
//!   shuffle, serve from a cursor, reshuffle when the deck runs out or the
//!   healthy count changes. Every provider is dealt once before any is
//!   dealt twice.
//! - **Weighted** — Nginx's smooth weighted round-robin: per-provider
//!   credit grows by its weight each round and the winner pays the total
//!   back, interleaving evenly under unequal weights.
//! - **Failover** — healthy providers sorted by descending priority,
//!   stable on ties; `select` returns the primary.
//!
//! ## Failover triggers
//!
//! Triggers are named predicates over the attempt's error deciding whether
//! the race is worth running. The defaults cover 5xx, 429, timed-out
//! attempts and transport-level failures; anything else (a 404, a client
//! abort) is returned to the caller untouched — retrying a request the
//! client got wrong only burns budget.
//!
//! ## The race
//!
//! One task per healthy candidate (the primary included — transient errors
//! often clear on retry), each publishing into a channel buffered to the
//! candidate count so no sender ever blocks. The first success cancels the
//! losers by aborting their tasks; losers' results are simply never read.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::mpsc;

use crate::error::RelayError;
use crate::health::IsHealthyFn;
use crate::providers::Provider;

/// Router view over one configured provider.
///
/// Built fresh on every configuration reload and treated immutably after.
/// Health is observed through a closure so the router never depends on the
/// tracker's types.
pub struct ProviderInfo {
    pub provider: Arc<dyn Provider>,
    pub weight: u32,
    pub priority: i32,
    pub is_healthy: IsHealthyFn,
}

impl ProviderInfo {
    pub fn new(
        provider: Arc<dyn Provider>,
        weight: u32,
        priority: i32,
        is_healthy: IsHealthyFn,
    ) -> Self {
        Self {
            provider,
            weight,
            priority,
            is_healthy,
        }
    }

    pub fn name(&self) -> &str {
        self.provider.name()
    }

    pub fn healthy(&self) -> bool {
        (self.is_healthy)()
    }
}

impl std::fmt::Debug for ProviderInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderInfo")
            .field("name", &self.name())
            .field("weight", &self.weight)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Drop unhealthy providers, preserving order.
fn healthy_subset(providers: &[Arc<ProviderInfo>]) -> Result<Vec<Arc<ProviderInfo>>, RelayError> {
    if providers.is_empty() {
        return Err(RelayError::NoProviders);
    }
    let healthy: Vec<Arc<ProviderInfo>> = providers
        .iter()
        .filter(|p| p.healthy())
        .cloned()
        .collect();
    if healthy.is_empty() {
        return Err(RelayError::AllProvidersUnhealthy);
    }
    Ok(healthy)
}

/// Provider selection contract shared by all strategies.
pub trait RouterStrategy: Send + Sync {
    /// Strategy name as configured and logged.
    fn name(&self) -> &'static str;

    /// Pick one healthy provider out of the slice.
    fn select(&self, providers: &[Arc<ProviderInfo>]) -> Result<Arc<ProviderInfo>, RelayError>;
}

/// Atomic-counter rotation over the healthy subset.
#[derive(Default)]
pub struct RoundRobinStrategy {
    counter: AtomicU64,
}

impl RouterStrategy for RoundRobinStrategy {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn select(&self, providers: &[Arc<ProviderInfo>]) -> Result<Arc<ProviderInfo>, RelayError> {
        let healthy = healthy_subset(providers)?;
        let turn = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::clone(&healthy[(turn % healthy.len() as u64) as usize]))
    }
}

#[derive(Default)]
struct ShuffleDeck {
    order: Vec<usize>,
    cursor: usize,
}

/// Card-dealing selection: randomized but fair within each deck.
#[derive(Default)]
pub struct ShuffleStrategy {
    deck: Mutex<ShuffleDeck>,
}

impl RouterStrategy for ShuffleStrategy {
    fn name(&self) -> &'static str {
        "shuffle"
    }

    fn select(&self, providers: &[Arc<ProviderInfo>]) -> Result<Arc<ProviderInfo>, RelayError> {
        let healthy = healthy_subset(providers)?;
        let mut deck = self.deck.lock().unwrap();
        if deck.cursor >= deck.order.len() || deck.order.len() != healthy.len() {
            deck.order = (0..healthy.len()).collect();
            deck.order.shuffle(&mut rand::thread_rng());
            deck.cursor = 0;
        }
        let index = deck.order[deck.cursor];
        deck.cursor += 1;
        Ok(Arc::clone(&healthy[index]))
    }
}

#[derive(Default)]
struct WrrState {
    /// Identities the credits belong to; a healthy-set change reinitialises.
    names: Vec<String>,
    current: Vec<i64>,
}

/// Smooth weighted round-robin (the Nginx algorithm).
#[derive(Default)]
pub struct WeightedStrategy {
    state: Mutex<WrrState>,
}

impl RouterStrategy for WeightedStrategy {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn select(&self, providers: &[Arc<ProviderInfo>]) -> Result<Arc<ProviderInfo>, RelayError> {
        let healthy = healthy_subset(providers)?;
        let names: Vec<String> = healthy.iter().map(|p| p.name().to_string()).collect();

        let mut state = self.state.lock().unwrap();
        if state.names != names {
            state.names = names;
            state.current = vec![0; healthy.len()];
        }

        let mut total: i64 = 0;
        for (i, provider) in healthy.iter().enumerate() {
            let weight = i64::from(provider.weight.max(1));
            state.current[i] += weight;
            total += weight;
        }

        let mut best = 0;
        for i in 1..state.current.len() {
            // Strictly-greater keeps the earlier provider on ties.
            if state.current[i] > state.current[best] {
                best = i;
            }
        }
        state.current[best] -= total;

        Ok(Arc::clone(&healthy[best]))
    }
}

/// Highest-priority-first selection; the race handles the rest.
#[derive(Default)]
pub struct FailoverStrategy;

impl FailoverStrategy {
    fn sorted(providers: &[Arc<ProviderInfo>]) -> Result<Vec<Arc<ProviderInfo>>, RelayError> {
        let mut healthy = healthy_subset(providers)?;
        // Stable sort keeps configuration order on equal priorities.
        healthy.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(healthy)
    }
}

impl RouterStrategy for FailoverStrategy {
    fn name(&self) -> &'static str {
        "failover"
    }

    fn select(&self, providers: &[Arc<ProviderInfo>]) -> Result<Arc<ProviderInfo>, RelayError> {
        Ok(Arc::clone(&Self::sorted(providers)?[0]))
    }
}

/// Map a configured strategy name onto an instance.
pub fn strategy_from_name(name: &str) -> Box<dyn RouterStrategy> {
    match name {
        "round-robin" | "round_robin" => Box::new(RoundRobinStrategy::default()),
        "shuffle" => Box::new(ShuffleStrategy::default()),
        "weighted" | "weighted-round-robin" => Box::new(WeightedStrategy::default()),
        "failover" => Box::new(FailoverStrategy),
        other => {
            tracing::warn!(strategy = other, "unknown routing strategy, using round-robin");
            Box::new(RoundRobinStrategy::default())
        }
    }
}

/// Named predicate deciding whether an attempt error warrants failover.
pub trait FailoverTrigger: Send + Sync {
    fn name(&self) -> &'static str;
    fn should_failover(&self, error: &RelayError) -> bool;
}

/// Backend answered 5xx.
pub struct ServerErrorTrigger;

impl FailoverTrigger for ServerErrorTrigger {
    fn name(&self) -> &'static str {
        "server-error"
    }

    fn should_failover(&self, error: &RelayError) -> bool {
        error.upstream_status().is_some_and(|s| s >= 500)
    }
}

/// Backend answered 429.
pub struct RateLimitTrigger;

impl FailoverTrigger for RateLimitTrigger {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    fn should_failover(&self, error: &RelayError) -> bool {
        error.upstream_status() == Some(429)
    }
}

/// The attempt's own deadline elapsed.
pub struct TimeoutTrigger;

impl FailoverTrigger for TimeoutTrigger {
    fn name(&self) -> &'static str {
        "timeout"
    }

    fn should_failover(&self, error: &RelayError) -> bool {
        matches!(error, RelayError::Transport(e) if e.is_timeout())
    }
}

/// Connection-level failure of any kind.
pub struct TransportTrigger;

impl FailoverTrigger for TransportTrigger {
    fn name(&self) -> &'static str {
        "transport"
    }

    fn should_failover(&self, error: &RelayError) -> bool {
        matches!(error, RelayError::Transport(_))
    }
}

/// The default trigger set: 5xx, 429, deadline, transport.
pub fn default_triggers() -> Vec<Arc<dyn FailoverTrigger>> {
    vec![
        Arc::new(ServerErrorTrigger),
        Arc::new(RateLimitTrigger),
        Arc::new(TimeoutTrigger),
        Arc::new(TransportTrigger),
    ]
}

/// Resolve configured trigger names; unknown names are skipped with a
/// warning so a typo cannot silently disable the rest of the set.
pub fn triggers_from_names(names: &[String]) -> Vec<Arc<dyn FailoverTrigger>> {
    let mut triggers: Vec<Arc<dyn FailoverTrigger>> = Vec::with_capacity(names.len());
    for name in names {
        match name.as_str() {
            "server-error" => triggers.push(Arc::new(ServerErrorTrigger)),
            "rate-limit" => triggers.push(Arc::new(RateLimitTrigger)),
            "timeout" => triggers.push(Arc::new(TimeoutTrigger)),
            "transport" => triggers.push(Arc::new(TransportTrigger)),
            other => tracing::warn!(trigger = other, "unknown failover trigger, skipping"),
        }
    }
    triggers
}

/// Strategy plus failover policy: the unit the lifecycle swaps on reload.
pub struct ProviderRouter {
    strategy: Box<dyn RouterStrategy>,
    triggers: Vec<Arc<dyn FailoverTrigger>>,
    failover_timeout: Duration,
}

impl ProviderRouter {
    pub fn new(
        strategy: Box<dyn RouterStrategy>,
        triggers: Vec<Arc<dyn FailoverTrigger>>,
        failover_timeout: Duration,
    ) -> Self {
        Self {
            strategy,
            triggers,
            failover_timeout,
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn failover_timeout(&self) -> Duration {
        self.failover_timeout
    }

    /// Whether any configured trigger matches, and which one (for logs).
    pub fn matching_trigger(&self, error: &RelayError) -> Option<&'static str> {
        self.triggers
            .iter()
            .find(|t| t.should_failover(error))
            .map(|t| t.name())
    }

    /// Informational single selection, no dispatch.
    pub fn select(
        &self,
        providers: &[Arc<ProviderInfo>],
    ) -> Result<Arc<ProviderInfo>, RelayError> {
        self.strategy.select(providers)
    }

    /// Full dispatch: primary attempt, trigger check, parallel race.
    ///
    /// `attempt` is called once for the primary and once per candidate if
    /// the race runs; the first success wins and losing attempts are
    /// aborted. Non-retryable primary errors are returned as-is.
    pub async fn select_with_retry<T, F, Fut>(
        &self,
        providers: &[Arc<ProviderInfo>],
        attempt: F,
    ) -> Result<(Arc<ProviderInfo>, T), RelayError>
    where
        T: Send + 'static,
        F: Fn(Arc<ProviderInfo>) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<T, RelayError>> + Send + 'static,
    {
        let primary = self.strategy.select(providers)?;

        let primary_error = match attempt(Arc::clone(&primary)).await {
            Ok(value) => return Ok((primary, value)),
            Err(error) => error,
        };

        let Some(trigger) = self.matching_trigger(&primary_error) else {
            return Err(primary_error);
        };

        let candidates = healthy_subset(providers)?;
        tracing::info!(
            primary = primary.name(),
            trigger,
            candidates = candidates.len(),
            error = %primary_error,
            "entering parallel failover race"
        );

        // Buffered to the candidate count so no sender ever blocks on a
        // receiver that already found its winner.
        let (tx, mut rx) =
            mpsc::channel::<(Arc<ProviderInfo>, Result<T, RelayError>)>(candidates.len());
        let mut tasks = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            let candidate = Arc::clone(candidate);
            let attempt = attempt.clone();
            let tx = tx.clone();
            tasks.push(tokio::spawn(async move {
                let result = attempt(Arc::clone(&candidate)).await;
                let _ = tx.send((candidate, result)).await;
            }));
        }
        drop(tx);

        let race = async {
            let mut last_error = primary_error;
            let mut pending = candidates.len();
            while pending > 0 {
                match rx.recv().await {
                    Some((candidate, Ok(value))) => return Ok((candidate, value)),
                    Some((candidate, Err(error))) => {
                        tracing::debug!(
                            provider = candidate.name(),
                            error = %error,
                            "race candidate failed"
                        );
                        last_error = error;
                        pending -= 1;
                    }
                    None => break,
                }
            }
            Err(last_error)
        };

        let outcome = match tokio::time::timeout(self.failover_timeout, race).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::FailoverTimeout {
                primary: primary.name().to_string(),
                timeout: self.failover_timeout,
            }),
        };

        // Cancel the losers promptly; we do not wait for them to unwind.
        for task in &tasks {
            task.abort();
        }

        outcome
    }
}
