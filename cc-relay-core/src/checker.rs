//! # Synthetic Health Checker
//!
//! A background task that probes providers whose circuit is open. Closed
//! and half-open circuits are left alone — real traffic is the better
//! probe there. A successful synthetic probe records a success on the
//! tracker, warming the path without forcing the time-gated OPEN →
//! HALF_OPEN transition.
//!
//! Each relay instance draws a random jitter in `[0, 2s)` once at
//! construction and adds it to every sleep. Replicas started together
//! de-phase from each other while a single instance stays on a constant
//! cadence.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::rngs::OsRng;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::breaker::CircuitState;
use crate::health::HealthTracker;

/// Probe deadline; a backend that cannot answer in this window is down.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound of the per-instance startup jitter.
const MAX_JITTER: Duration = Duration::from_secs(2);

/// What probing a provider means.
#[derive(Debug, Clone)]
pub enum ProbeKind {
    /// HTTP GET expecting any 2xx. Redirects are not followed and no
    /// credentials are sent.
    Http { url: String },
    /// No probe endpoint exists; report healthy unconditionally.
    AlwaysHealthy,
}

/// One registered provider probe.
#[derive(Debug, Clone)]
pub struct ProviderCheck {
    pub provider: String,
    pub probe: ProbeKind,
}

/// Periodic prober for open circuits.
pub struct HealthChecker {
    tracker: Arc<HealthTracker>,
    interval: Duration,
    jitter: Duration,
    checks: RwLock<Vec<ProviderCheck>>,
    client: reqwest::Client,
    worker: std::sync::Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl HealthChecker {
    pub fn new(tracker: Arc<HealthTracker>, interval: Duration) -> Self {
        let jitter_ms = OsRng.gen_range(0..MAX_JITTER.as_millis() as u64);
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            tracker,
            interval,
            jitter: Duration::from_millis(jitter_ms),
            checks: RwLock::new(Vec::new()),
            client,
            worker: std::sync::Mutex::new(None),
        }
    }

    /// Replace the registered probe set (called on configuration reload).
    pub fn register(&self, checks: Vec<ProviderCheck>) {
        *self.checks.write().unwrap() = checks;
    }

    /// Spawn the probe worker. A second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let checker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let period = checker.interval + checker.jitter;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(period) => checker.run_once().await,
                }
            }
        });
        *worker = Some((shutdown_tx, handle));
        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            jitter_ms = self.jitter.as_millis() as u64,
            "health checker started"
        );
    }

    /// Cancel the worker and wait for it to finish.
    pub async fn stop(&self) {
        let taken = self.worker.lock().unwrap().take();
        if let Some((shutdown_tx, handle)) = taken {
            let _ = shutdown_tx.send(true);
            let _ = handle.await;
            tracing::info!("health checker stopped");
        }
    }

    /// One probing pass over every registered provider with an open circuit.
    pub async fn run_once(&self) {
        let checks: Vec<ProviderCheck> = self.checks.read().unwrap().clone();
        for check in checks {
            if self.tracker.state(&check.provider) != CircuitState::Open {
                continue;
            }
            match self.probe(&check.probe).await {
                Ok(()) => {
                    tracing::info!(provider = %check.provider, "synthetic probe succeeded");
                    self.tracker.record_success(&check.provider);
                }
                Err(reason) => {
                    tracing::warn!(provider = %check.provider, reason, "synthetic probe failed");
                }
            }
        }
    }

    async fn probe(&self, probe: &ProbeKind) -> Result<(), String> {
        match probe {
            ProbeKind::AlwaysHealthy => Ok(()),
            ProbeKind::Http { url } => {
                let response = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| e.to_string())?;
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(format!("status {}", response.status()))
                }
            }
        }
    }
}
