//! # Circuit Breaker Module
//!
//! One three-state circuit breaker per provider. Breakers keep a failing
//! backend from soaking up requests while it recovers, and reopen the path
//! gradually through a bounded probe phase.
//!
//! ## States
//!
//! - **Closed** — requests pass; consecutive failures are counted and the
//!   threshold trips the breaker open.
//! - **Open** — requests are rejected outright. After `open_duration` the
//!   *next* admission attempt moves to half-open; the transition is lazy,
//!   no timer task exists.
//! - **Half-open** — at most `half_open_probes` requests may be in flight.
//!   One probe failure reopens the breaker; `half_open_probes` successes
//!   close it.
//!
//! ## The two-step handshake
//!
//! Streaming responses resolve long after their headers, so the breaker
//! cannot wrap the call. [`CircuitBreaker::allow`] hands back a
//! [`BreakerPermit`]; the caller reports the final outcome with
//! [`BreakerPermit::done`] once the body has drained. A permit dropped
//! without a verdict — the client walked away, or a losing failover
//! attempt was cancelled — is neutral: client aborts must never trip a
//! breaker, and must not reset its failure count either.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::RelayError;

/// Transition parameters for a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing.
    pub open_duration: Duration,
    /// Probe budget while half-open.
    pub half_open_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(60),
            half_open_probes: 3,
        }
    }
}

/// Circuit breaker operational states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
}

impl Default for BreakerInner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            half_open_in_flight: 0,
            opened_at: None,
        }
    }
}

impl BreakerInner {
    /// Apply the lazy open → half-open transition if the window elapsed.
    fn refresh(&mut self, config: &BreakerConfig, name: &str) {
        if self.state == CircuitState::Open {
            let elapsed = self.opened_at.map(|at| at.elapsed()).unwrap_or_default();
            if elapsed >= config.open_duration {
                self.state = CircuitState::HalfOpen;
                self.half_open_in_flight = 0;
                self.consecutive_successes = 0;
                tracing::info!(provider = name, "circuit transitioning to HALF_OPEN");
            }
        }
    }
}

/// Per-provider three-state admission gate.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request admission. On success the returned permit must be resolved
    /// with [`BreakerPermit::done`] after the response (body included) has
    /// settled.
    pub fn allow(self: &Arc<Self>) -> Result<BreakerPermit, RelayError> {
        let mut inner = self.inner.lock().unwrap();
        inner.refresh(&self.config, &self.name);

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(RelayError::CircuitOpen {
                provider: self.name.clone(),
            }),
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_probes {
                    inner.half_open_in_flight += 1;
                    Ok(())
                } else {
                    Err(RelayError::CircuitOpen {
                        provider: self.name.clone(),
                    })
                }
            }
        }?;

        Ok(BreakerPermit {
            breaker: Arc::clone(self),
            resolved: false,
        })
    }

    /// Current state, applying the lazy recovery transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().unwrap();
        inner.refresh(&self.config, &self.name);
        inner.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().unwrap().consecutive_failures
    }

    /// Release an admission without a verdict (abandoned request).
    ///
    /// Frees the half-open probe slot but moves no counters: a cancelled
    /// request says nothing about the provider.
    fn release(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Record a success outside the permit handshake (synthetic probes).
    pub fn record_success(&self) {
        self.record(false);
    }

    /// Record a failure outside the permit handshake.
    pub fn record_failure(&self) {
        self.record(true);
    }

    fn record(&self, failed: bool) {
        let mut inner = self.inner.lock().unwrap();
        if failed {
            self.on_failure(&mut inner);
        } else {
            self.on_success(&mut inner);
        }
    }

    fn on_success(&self, inner: &mut BreakerInner) {
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.half_open_probes {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.opened_at = None;
                    tracing::info!(provider = %self.name, "circuit CLOSED");
                }
            }
            // A late success from before the reopen changes nothing.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, inner: &mut BreakerInner) {
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        provider = %self.name,
                        failures = inner.consecutive_failures,
                        "circuit OPEN"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_in_flight = 0;
                inner.consecutive_successes = 0;
                tracing::warn!(provider = %self.name, "probe failed, circuit re-OPENED");
            }
            CircuitState::Open => {
                inner.consecutive_failures += 1;
            }
        }
    }
}

/// The second half of the admission handshake.
///
/// `None`, a client cancellation, or a client-fault error all count as
/// success — only provider faults move the breaker.
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    resolved: bool,
}

impl BreakerPermit {
    /// Report the request's final outcome.
    pub fn done(mut self, outcome: Option<&RelayError>) {
        let failed = outcome.map_or(false, |err| !err.is_client_fault());
        self.breaker.record(failed);
        self.resolved = true;
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        // An unresolved permit means the request was abandoned mid-flight
        // (client hung up, or a losing race attempt was cancelled). That
        // is neutral: neither success nor failure.
        if !self.resolved {
            self.breaker.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, open: Duration, probes: u32) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: threshold,
                open_duration: open,
                half_open_probes: probes,
            },
        ))
    }

    fn fail(breaker: &Arc<CircuitBreaker>) {
        let permit = breaker.allow().expect("admission");
        permit.done(Some(&RelayError::from_status(502, None)));
    }

    fn succeed(breaker: &Arc<CircuitBreaker>) {
        let permit = breaker.allow().expect("admission");
        permit.done(None);
    }

    #[test]
    fn stays_closed_on_success() {
        let cb = breaker(2, Duration::from_secs(1), 2);
        succeed(&cb);
        succeed(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn opens_after_threshold_failures() {
        let cb = breaker(2, Duration::from_secs(60), 2);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(cb.allow(), Err(RelayError::CircuitOpen { .. })));
    }

    #[test]
    fn success_resets_failure_count() {
        let cb = breaker(2, Duration::from_secs(60), 2);
        fail(&cb);
        succeed(&cb);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn recovers_through_half_open() {
        let cb = breaker(1, Duration::from_millis(20), 2);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        succeed(&cb);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn probe_failure_reopens() {
        let cb = breaker(1, Duration::from_millis(20), 2);
        fail(&cb);
        std::thread::sleep(Duration::from_millis(30));
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_bounds_in_flight_probes() {
        let cb = breaker(1, Duration::from_millis(20), 2);
        fail(&cb);
        std::thread::sleep(Duration::from_millis(30));

        let first = cb.allow().expect("probe 1");
        let second = cb.allow().expect("probe 2");
        assert!(matches!(cb.allow(), Err(RelayError::CircuitOpen { .. })));

        first.done(None);
        second.done(None);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn client_faults_and_cancellations_do_not_trip() {
        let cb = breaker(1, Duration::from_secs(60), 2);

        let permit = cb.allow().unwrap();
        permit.done(Some(&RelayError::from_status(404, None)));
        assert_eq!(cb.state(), CircuitState::Closed);

        let permit = cb.allow().unwrap();
        permit.done(Some(&RelayError::ClientCancelled));
        assert_eq!(cb.state(), CircuitState::Closed);

        // Abandoned permit: client gave up mid-stream.
        let permit = cb.allow().unwrap();
        drop(permit);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn abandoned_permit_is_neutral_not_success() {
        let cb = breaker(2, Duration::from_secs(60), 2);
        fail(&cb);
        assert_eq!(cb.consecutive_failures(), 1);

        // A cancelled attempt must not reset the failure streak.
        drop(cb.allow().unwrap());
        assert_eq!(cb.consecutive_failures(), 1);

        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn rate_limit_counts_as_failure() {
        let cb = breaker(1, Duration::from_secs(60), 2);
        let permit = cb.allow().unwrap();
        permit.done(Some(&RelayError::from_status(
            429,
            Some(Duration::from_secs(5)),
        )));
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
