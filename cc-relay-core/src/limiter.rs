//! # Per-Key Rate Limiter
//!
//! Two token buckets per API key: one metered in requests, one in tokens
//! (input + output combined). A bucket refills continuously at
//! `limit / 60s` and bursts up to one minute's worth, so a client that was
//! idle can legitimately spend its whole minute budget at once.
//!
//! The request bucket is the admission gate — [`KeyLimiter::allow`] is
//! non-blocking and consults it alone. The token bucket is debited after
//! the fact ([`KeyLimiter::reserve`] / [`KeyLimiter::consume_tokens`])
//! because output token counts are only known once a response finishes.
//!
//! Limits learned from `anthropic-ratelimit-*` response headers are applied
//! through [`KeyLimiter::set_limit`], which re-parameterises the buckets in
//! place; [`KeyLimiter::sync_remaining`] then clamps availability down to
//! what the backend says is actually left. A configured limit of zero means
//! "unknown, learn from headers" and is rendered as an effectively
//! unlimited bucket until the first learned value arrives.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::RelayError;

/// Refill rate used for zero/negative configured limits, in tokens per
/// second. High enough that the bucket never rejects in practice.
const UNLIMITED_RATE: f64 = 1_000_000.0;

/// Burst ceiling paired with [`UNLIMITED_RATE`].
const UNLIMITED_BURST: f64 = 1_000_000_000.0;

/// A single continuously-refilling token bucket.
#[derive(Debug)]
struct Bucket {
    /// Tokens added per second.
    rate: f64,
    /// Maximum tokens the bucket holds.
    burst: f64,
    /// Tokens currently available (refilled lazily on access).
    available: f64,
    /// Last refill instant.
    refilled_at: Instant,
}

impl Bucket {
    fn new(per_minute: u64) -> Self {
        let (rate, burst) = if per_minute == 0 {
            (UNLIMITED_RATE, UNLIMITED_BURST)
        } else {
            (per_minute as f64 / 60.0, per_minute as f64)
        };
        Self {
            rate,
            burst,
            available: burst,
            refilled_at: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.refilled_at).as_secs_f64();
        self.available = (self.available + elapsed * self.rate).min(self.burst);
        self.refilled_at = now;
    }

    fn try_take(&mut self, n: f64) -> bool {
        self.refill(Instant::now());
        if self.available >= n {
            self.available -= n;
            true
        } else {
            false
        }
    }

    /// How long until `n` tokens will be available, `None` if they already are.
    fn wait_for(&mut self, n: f64) -> Option<Duration> {
        self.refill(Instant::now());
        if self.available >= n {
            None
        } else {
            let deficit = n - self.available;
            Some(Duration::from_secs_f64(deficit / self.rate))
        }
    }

    fn reparameterise(&mut self, per_minute: u64) {
        let now = Instant::now();
        self.refill(now);
        if per_minute == 0 {
            self.rate = UNLIMITED_RATE;
            self.burst = UNLIMITED_BURST;
        } else {
            self.rate = per_minute as f64 / 60.0;
            self.burst = per_minute as f64;
        }
        // Keep what was already accrued, but never above the new burst.
        self.available = self.available.min(self.burst);
    }
}

/// Snapshot of a limiter's current headroom.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimiterUsage {
    /// Request tokens currently available.
    pub requests_available: u64,
    /// Token-bucket tokens currently available.
    pub tokens_available: u64,
}

/// Request + token buckets for one API key.
///
/// All remaining/reset metadata elsewhere is advisory; these buckets are the
/// authoritative admission gate.
#[derive(Debug)]
pub struct KeyLimiter {
    requests: Mutex<Bucket>,
    tokens: Mutex<Bucket>,
}

impl KeyLimiter {
    /// Create a limiter with the configured per-minute limits.
    /// Zero means unknown/unlimited until learned.
    pub fn new(rpm: u64, tpm: u64) -> Self {
        Self {
            requests: Mutex::new(Bucket::new(rpm)),
            tokens: Mutex::new(Bucket::new(tpm)),
        }
    }

    /// Non-blocking admission check against the request bucket only.
    pub fn allow(&self) -> Result<(), RelayError> {
        let mut bucket = self.requests.lock().unwrap();
        if bucket.try_take(1.0) {
            Ok(())
        } else {
            Err(RelayError::CapacityExhausted)
        }
    }

    /// Reserve `n` tokens from the token bucket without blocking.
    ///
    /// Used to pessimistically account for expected output tokens; the
    /// reservation fails silently into a debt (the bucket goes no lower
    /// than empty) so streaming is never blocked mid-response.
    pub fn reserve(&self, n: u64) {
        let mut bucket = self.tokens.lock().unwrap();
        bucket.refill(Instant::now());
        bucket.available = (bucket.available - n as f64).max(0.0);
    }

    /// Debit `n` tokens, waiting until the bucket can cover them.
    ///
    /// Waits at most `wait_limit`; an expired wait returns
    /// [`RelayError::ClientCancelled`], matching the caller-side deadline
    /// semantics. Dropping the returned future abandons the wait without
    /// consuming anything.
    pub async fn consume_tokens(&self, n: u64, wait_limit: Duration) -> Result<(), RelayError> {
        let deadline = Instant::now() + wait_limit;
        loop {
            let wait = {
                let mut bucket = self.tokens.lock().unwrap();
                match bucket.wait_for(n as f64) {
                    None => {
                        bucket.available -= n as f64;
                        return Ok(());
                    }
                    Some(wait) => wait,
                }
            };
            let now = Instant::now();
            if now + wait > deadline {
                return Err(RelayError::ClientCancelled);
            }
            tokio::time::sleep_until(now + wait).await;
        }
    }

    /// Atomically replace both buckets' rate and burst.
    ///
    /// Burst is always the per-minute limit itself so a full minute's worth
    /// of capacity can be spent in one burst.
    pub fn set_limit(&self, rpm: u64, tpm: u64) {
        self.requests.lock().unwrap().reparameterise(rpm);
        self.tokens.lock().unwrap().reparameterise(tpm);
    }

    /// Clamp availability down to backend-reported remaining capacity.
    ///
    /// Only ever lowers availability — a backend reporting more headroom
    /// than we have locally does not mint tokens the refill hasn't earned.
    pub fn sync_remaining(&self, requests_remaining: Option<u64>, tokens_remaining: Option<u64>) {
        if let Some(remaining) = requests_remaining {
            let mut bucket = self.requests.lock().unwrap();
            bucket.refill(Instant::now());
            bucket.available = bucket.available.min(remaining as f64);
        }
        if let Some(remaining) = tokens_remaining {
            let mut bucket = self.tokens.lock().unwrap();
            bucket.refill(Instant::now());
            bucket.available = bucket.available.min(remaining as f64);
        }
    }

    /// Time until the request bucket could admit one more request.
    ///
    /// Zero when a request would be admitted right now. Used to derive the
    /// `Retry-After` hint when a whole pool is exhausted.
    pub fn next_request_available(&self) -> Duration {
        let mut bucket = self.requests.lock().unwrap();
        bucket.wait_for(1.0).unwrap_or(Duration::ZERO)
    }

    /// Snapshot of both buckets' availability.
    pub fn usage(&self) -> LimiterUsage {
        let mut requests = self.requests.lock().unwrap();
        requests.refill(Instant::now());
        let requests_available = requests.available as u64;
        drop(requests);

        let mut tokens = self.tokens.lock().unwrap();
        tokens.refill(Instant::now());
        LimiterUsage {
            requests_available,
            tokens_available: tokens.available as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allow_drains_the_request_bucket() {
        let limiter = KeyLimiter::new(3, 0);
        assert!(limiter.allow().is_ok());
        assert!(limiter.allow().is_ok());
        assert!(limiter.allow().is_ok());
        assert!(matches!(
            limiter.allow(),
            Err(RelayError::CapacityExhausted)
        ));
    }

    #[tokio::test]
    async fn zero_limit_is_effectively_unlimited() {
        let limiter = KeyLimiter::new(0, 0);
        for _ in 0..10_000 {
            assert!(limiter.allow().is_ok());
        }
    }

    #[tokio::test]
    async fn set_limit_replaces_rate_and_burst() {
        let limiter = KeyLimiter::new(0, 0);
        limiter.set_limit(5, 100);
        for _ in 0..5 {
            assert!(limiter.allow().is_ok());
        }
        assert!(limiter.allow().is_err());
    }

    #[tokio::test]
    async fn sync_remaining_clamps_downward_only() {
        let limiter = KeyLimiter::new(50, 0);
        limiter.sync_remaining(Some(42), None);
        let usage = limiter.usage();
        assert_eq!(usage.requests_available, 42);

        // Reporting more than the burst must not inflate availability.
        limiter.sync_remaining(Some(10_000), None);
        assert!(limiter.usage().requests_available <= 50);
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_at_limit_per_minute() {
        let limiter = KeyLimiter::new(60, 0);
        for _ in 0..60 {
            assert!(limiter.allow().is_ok());
        }
        assert!(limiter.allow().is_err());

        // One token per second at rpm=60.
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(limiter.allow().is_ok());
        assert!(limiter.allow().is_ok());
        assert!(limiter.allow().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn consume_tokens_waits_for_refill() {
        let limiter = KeyLimiter::new(0, 60);
        limiter.reserve(60);
        assert_eq!(limiter.usage().tokens_available, 0);

        let fut = limiter.consume_tokens(5, Duration::from_secs(30));
        tokio::pin!(fut);
        // Not ready immediately.
        assert!(futures::poll!(fut.as_mut()).is_pending());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(fut.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn consume_tokens_times_out() {
        let limiter = KeyLimiter::new(0, 60);
        limiter.reserve(60);
        let result = limiter.consume_tokens(60, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(RelayError::ClientCancelled)));
    }
}
