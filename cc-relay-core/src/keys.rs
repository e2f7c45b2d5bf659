//! # Key Metadata
//!
//! Per-key bookkeeping learned from `anthropic-ratelimit-*` response
//! headers: limits, remaining capacity, reset instants, cooldown and a
//! health flag. Everything here is advisory — admission is decided by the
//! key's token buckets — but the capacity score steers the least-loaded
//! selector toward keys with the most headroom.
//!
//! Header parsing is lenient by design: a malformed or negative value is
//! ignored and the previous metadata stays in place, because a single bad
//! proxy hop upstream must not blind the whole pool.

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

/// Static selection priority carried by a configured key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// One capacity dimension parsed from response headers.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LimitWindow {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset: Option<DateTime<Utc>>,
}

/// The three rate-limit dimensions Anthropic-compatible backends report.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub requests: LimitWindow,
    pub input_tokens: LimitWindow,
    pub output_tokens: LimitWindow,
}

impl RateLimitHeaders {
    /// Parse `anthropic-ratelimit-{requests,input-tokens,output-tokens}-
    /// {limit,remaining,reset}` out of a response header map.
    ///
    /// Missing, malformed and negative values yield `None` for that field.
    pub fn parse(headers: &HeaderMap) -> Self {
        Self {
            requests: Self::parse_window(headers, "requests"),
            input_tokens: Self::parse_window(headers, "input-tokens"),
            output_tokens: Self::parse_window(headers, "output-tokens"),
        }
    }

    /// True when no recognised field was present at all.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn parse_window(headers: &HeaderMap, dimension: &str) -> LimitWindow {
        LimitWindow {
            limit: Self::parse_count(headers, dimension, "limit"),
            remaining: Self::parse_count(headers, dimension, "remaining"),
            reset: Self::parse_reset(headers, dimension),
        }
    }

    fn parse_count(headers: &HeaderMap, dimension: &str, field: &str) -> Option<u64> {
        let name = format!("anthropic-ratelimit-{dimension}-{field}");
        headers
            .get(&name)?
            .to_str()
            .ok()?
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|v| u64::try_from(v).ok())
    }

    fn parse_reset(headers: &HeaderMap, dimension: &str) -> Option<DateTime<Utc>> {
        let name = format!("anthropic-ratelimit-{dimension}-reset");
        let raw = headers.get(&name)?.to_str().ok()?;
        DateTime::parse_from_rfc3339(raw.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Advisory state for one API key.
///
/// `*_limit` of zero means "unknown — learn from headers".
#[derive(Debug, Clone)]
pub struct KeyMetadata {
    pub rpm_limit: u64,
    pub itpm_limit: u64,
    pub otpm_limit: u64,
    pub priority: KeyPriority,
    pub weight: u32,
    pub rpm_remaining: Option<u64>,
    pub itpm_remaining: Option<u64>,
    pub otpm_remaining: Option<u64>,
    pub rpm_reset: Option<DateTime<Utc>>,
    pub itpm_reset: Option<DateTime<Utc>>,
    pub otpm_reset: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub healthy: bool,
}

impl KeyMetadata {
    pub fn new(rpm_limit: u64, itpm_limit: u64, otpm_limit: u64) -> Self {
        Self {
            rpm_limit,
            itpm_limit,
            otpm_limit,
            priority: KeyPriority::Normal,
            weight: 1,
            rpm_remaining: None,
            itpm_remaining: None,
            otpm_remaining: None,
            rpm_reset: None,
            itpm_reset: None,
            otpm_reset: None,
            cooldown_until: None,
            healthy: true,
        }
    }

    pub fn with_priority(mut self, priority: KeyPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    /// Merge a parsed header set into this metadata.
    ///
    /// Fields absent from the headers keep their previous values; a learned
    /// limit never shrinks `remaining` above it (`remaining <= limit` when
    /// the limit is known).
    pub fn apply(&mut self, headers: &RateLimitHeaders) {
        if let Some(limit) = headers.requests.limit {
            self.rpm_limit = limit;
        }
        if let Some(remaining) = headers.requests.remaining {
            self.rpm_remaining = Some(Self::clamp(remaining, self.rpm_limit));
        }
        if let Some(reset) = headers.requests.reset {
            self.rpm_reset = Some(reset);
        }

        if let Some(limit) = headers.input_tokens.limit {
            self.itpm_limit = limit;
        }
        if let Some(remaining) = headers.input_tokens.remaining {
            self.itpm_remaining = Some(Self::clamp(remaining, self.itpm_limit));
        }
        if let Some(reset) = headers.input_tokens.reset {
            self.itpm_reset = Some(reset);
        }

        if let Some(limit) = headers.output_tokens.limit {
            self.otpm_limit = limit;
        }
        if let Some(remaining) = headers.output_tokens.remaining {
            self.otpm_remaining = Some(Self::clamp(remaining, self.otpm_limit));
        }
        if let Some(reset) = headers.output_tokens.reset {
            self.otpm_reset = Some(reset);
        }
    }

    fn clamp(remaining: u64, limit: u64) -> u64 {
        if limit > 0 {
            remaining.min(limit)
        } else {
            remaining
        }
    }

    /// Healthy and past any cooldown window.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.healthy && self.cooldown_until.map_or(true, |until| now >= until)
    }

    /// Fraction of capacity left, in `[0, 1]`.
    ///
    /// Average of the request-dimension ratio and the combined token ratio.
    /// Unknown dimensions count as full headroom so fresh keys sort first.
    /// Unavailable keys score zero.
    pub fn capacity_score(&self, now: DateTime<Utc>) -> f64 {
        if !self.is_available(now) {
            return 0.0;
        }

        let request_ratio = match (self.rpm_remaining, self.rpm_limit) {
            (Some(remaining), limit) if limit > 0 => remaining as f64 / limit as f64,
            _ => 1.0,
        };

        let token_limit = self.itpm_limit + self.otpm_limit;
        let token_ratio = match (self.itpm_remaining, self.otpm_remaining) {
            (Some(input), Some(output)) if token_limit > 0 => {
                (input + output) as f64 / token_limit as f64
            }
            (Some(input), None) if self.itpm_limit > 0 => input as f64 / self.itpm_limit as f64,
            (None, Some(output)) if self.otpm_limit > 0 => output as f64 / self.otpm_limit as f64,
            _ => 1.0,
        };

        ((request_ratio + token_ratio) / 2.0).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use reqwest::header::{HeaderName, HeaderValue};

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                name.parse::<HeaderName>().unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn parses_all_three_dimensions() {
        let map = headers(&[
            ("anthropic-ratelimit-requests-limit", "50"),
            ("anthropic-ratelimit-requests-remaining", "42"),
            ("anthropic-ratelimit-requests-reset", "2026-08-01T00:01:00Z"),
            ("anthropic-ratelimit-input-tokens-limit", "30000"),
            ("anthropic-ratelimit-input-tokens-remaining", "29000"),
            ("anthropic-ratelimit-output-tokens-limit", "8000"),
            ("anthropic-ratelimit-output-tokens-remaining", "7000"),
        ]);
        let parsed = RateLimitHeaders::parse(&map);
        assert_eq!(parsed.requests.limit, Some(50));
        assert_eq!(parsed.requests.remaining, Some(42));
        assert!(parsed.requests.reset.is_some());
        assert_eq!(parsed.input_tokens.limit, Some(30000));
        assert_eq!(parsed.output_tokens.remaining, Some(7000));
    }

    #[test]
    fn malformed_and_negative_values_are_ignored() {
        let map = headers(&[
            ("anthropic-ratelimit-requests-limit", "not-a-number"),
            ("anthropic-ratelimit-requests-remaining", "-3"),
            ("anthropic-ratelimit-requests-reset", "tomorrow-ish"),
        ]);
        let parsed = RateLimitHeaders::parse(&map);
        assert_eq!(parsed.requests, LimitWindow::default());
        assert!(parsed.is_empty());
    }

    #[test]
    fn apply_preserves_existing_fields() {
        let mut meta = KeyMetadata::new(0, 0, 0);
        meta.apply(&RateLimitHeaders::parse(&headers(&[
            ("anthropic-ratelimit-requests-limit", "50"),
            ("anthropic-ratelimit-requests-remaining", "42"),
        ])));
        assert_eq!(meta.rpm_limit, 50);
        assert_eq!(meta.rpm_remaining, Some(42));

        // A later response missing the limit keeps the learned one.
        meta.apply(&RateLimitHeaders::parse(&headers(&[(
            "anthropic-ratelimit-requests-remaining",
            "41",
        )])));
        assert_eq!(meta.rpm_limit, 50);
        assert_eq!(meta.rpm_remaining, Some(41));
    }

    #[test]
    fn remaining_is_clamped_to_limit() {
        let mut meta = KeyMetadata::new(10, 0, 0);
        meta.apply(&RateLimitHeaders::parse(&headers(&[(
            "anthropic-ratelimit-requests-remaining",
            "500",
        )])));
        assert_eq!(meta.rpm_remaining, Some(10));
    }

    #[test]
    fn cooldown_gates_availability() {
        let now = Utc::now();
        let mut meta = KeyMetadata::new(10, 0, 0);
        assert!(meta.is_available(now));

        meta.cooldown_until = Some(now + ChronoDuration::seconds(30));
        assert!(!meta.is_available(now));
        assert_eq!(meta.capacity_score(now), 0.0);
        assert!(meta.is_available(now + ChronoDuration::seconds(31)));
    }

    #[test]
    fn capacity_score_averages_dimensions() {
        let now = Utc::now();
        let mut meta = KeyMetadata::new(100, 1000, 1000);
        meta.rpm_remaining = Some(50);
        meta.itpm_remaining = Some(500);
        meta.otpm_remaining = Some(500);
        assert!((meta.capacity_score(now) - 0.5).abs() < 1e-9);

        // Unknown dimensions count as full headroom.
        let fresh = KeyMetadata::new(0, 0, 0);
        assert!((fresh.capacity_score(now) - 1.0).abs() < 1e-9);
    }
}
