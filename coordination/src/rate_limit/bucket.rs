//! Per-key token bucket limiter.
//!
//! A bucket starts full at `max_requests` tokens and refills continuously
//! at `max_requests / window` tokens per millisecond, never beyond the
//! maximum. Each admitted request takes one whole token.
//!
//! A bucket that has refilled to the maximum is indistinguishable from a
//! fresh one, so the limiter drops such buckets once per window instead of
//! keeping one entry per key forever.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

/// Limit of `max_requests` per `window_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub max_requests: u32,
    pub window_ms: u64,
}

impl RateLimitRule {
    pub const fn new(max_requests: u32, window_ms: u64) -> Self {
        Self {
            max_requests,
            window_ms,
        }
    }
}

/// Outcome of a `consume` or `check` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Whole tokens left after this call.
    pub remaining: u32,
    /// When the bucket will be full again.
    pub reset_at: DateTime<Utc>,
    /// How long until one token is available; zero when tokens remain.
    #[serde(serialize_with = "serialize_millis")]
    pub retry_after: Duration,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Token state for one key.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    max_tokens: f64,
    window_ms: f64,
}

impl TokenBucket {
    pub fn new(rule: RateLimitRule, now: Instant) -> Self {
        let max_tokens = f64::from(rule.max_requests);
        Self {
            tokens: max_tokens,
            last_refill: now,
            max_tokens,
            window_ms: rule.window_ms as f64,
        }
    }

    /// Current token count, including any fractional refill.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    fn refill(&mut self, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(self.last_refill).as_secs_f64() * 1000.0;
        if elapsed_ms > 0.0 {
            let refill = if self.window_ms > 0.0 {
                elapsed_ms * self.max_tokens / self.window_ms
            } else {
                self.max_tokens
            };
            self.tokens = (self.tokens + refill).min(self.max_tokens);
            self.last_refill = now;
        }
    }

    fn time_to_tokens(&self, target: f64) -> Duration {
        let missing = (target - self.tokens).max(0.0);
        if missing == 0.0 || self.window_ms == 0.0 {
            return Duration::ZERO;
        }
        if self.max_tokens == 0.0 {
            return Duration::from_secs(u64::from(u32::MAX));
        }
        let ms = missing * self.window_ms / self.max_tokens;
        Duration::from_secs_f64((ms / 1000.0).min(f64::from(u32::MAX)))
    }

    fn decision(&self, allowed: bool) -> RateLimitDecision {
        let until_full = self.time_to_tokens(self.max_tokens);
        let reset_at = chrono::Duration::from_std(until_full)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        RateLimitDecision {
            allowed,
            remaining: self.tokens.floor().max(0.0) as u32,
            reset_at,
            retry_after: self.time_to_tokens(1.0),
        }
    }

    /// Refill, then take one token if a whole token is available.
    pub fn consume(&mut self, now: Instant) -> RateLimitDecision {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            self.decision(true)
        } else {
            self.decision(false)
        }
    }

    /// Full after refilling to `now`.
    fn is_full_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        self.tokens >= self.max_tokens
    }

    /// Refill and report whether a token is available, without taking it.
    pub fn check(&mut self, now: Instant) -> RateLimitDecision {
        self.refill(now);
        let allowed = self.tokens >= 1.0;
        self.decision(allowed)
    }
}

type BucketMap = HashMap<String, Arc<Mutex<TokenBucket>>>;

#[derive(Debug)]
struct Buckets {
    map: BucketMap,
    last_sweep: Instant,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keyed token buckets sharing one rule.
///
/// The key map and each bucket are locked independently, so calls for
/// different keys only contend while looking up the bucket.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    rule: RateLimitRule,
    buckets: Mutex<Buckets>,
}

impl TokenBucketLimiter {
    pub fn new(rule: RateLimitRule) -> Self {
        Self {
            rule,
            buckets: Mutex::new(Buckets {
                map: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    pub fn rule(&self) -> RateLimitRule {
        self.rule
    }

    fn bucket(&self, key: &str, now: Instant) -> Arc<Mutex<TokenBucket>> {
        let mut buckets = lock(&self.buckets);
        let window = Duration::from_millis(self.rule.window_ms);
        if now.saturating_duration_since(buckets.last_sweep) >= window {
            Self::sweep(&mut buckets, now);
        }
        Arc::clone(
            buckets
                .map
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::new(self.rule, now)))),
        )
    }

    /// Drop buckets that are full again. A bucket still referenced outside
    /// the map is in use and stays; new references are only handed out
    /// under the map lock held here.
    fn sweep(buckets: &mut Buckets, now: Instant) {
        let before = buckets.map.len();
        buckets
            .map
            .retain(|_, bucket| Arc::strong_count(bucket) > 1 || !lock(bucket).is_full_at(now));
        buckets.last_sweep = now;
        let pruned = before - buckets.map.len();
        if pruned > 0 {
            debug!(pruned, remaining = buckets.map.len(), "Pruned idle rate-limit buckets");
        }
    }

    /// Drop every bucket that has refilled to the maximum by `now`.
    pub fn prune_idle_at(&self, now: Instant) {
        Self::sweep(&mut lock(&self.buckets), now);
    }

    pub fn consume(&self, key: &str) -> RateLimitDecision {
        self.consume_at(key, Instant::now())
    }

    pub fn consume_at(&self, key: &str, now: Instant) -> RateLimitDecision {
        let bucket = self.bucket(key, now);
        let decision = lock(&bucket).consume(now);
        decision
    }

    pub fn check(&self, key: &str) -> RateLimitDecision {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&self, key: &str, now: Instant) -> RateLimitDecision {
        let bucket = self.bucket(key, now);
        let decision = lock(&bucket).check(now);
        decision
    }

    /// Forget one key; its next use starts from a full bucket.
    pub fn reset(&self, key: &str) {
        lock(&self.buckets).map.remove(key);
    }

    pub fn reset_all(&self) {
        lock(&self.buckets).map.clear();
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        lock(&self.buckets).map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PER_MINUTE: RateLimitRule = RateLimitRule::new(10, 60_000);

    #[test]
    fn test_eleventh_request_denied() {
        let limiter = TokenBucketLimiter::new(PER_MINUTE);
        let now = Instant::now();

        for n in 0..10 {
            let decision = limiter.consume_at("agent", now);
            assert!(decision.allowed, "request {} should pass", n + 1);
            assert_eq!(decision.remaining, 9 - n);
        }

        let denied = limiter.consume_at("agent", now);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after, Duration::from_secs(6));
    }

    #[test]
    fn test_refill_is_time_proportional() {
        let limiter = TokenBucketLimiter::new(PER_MINUTE);
        let start = Instant::now();
        for _ in 0..10 {
            limiter.consume_at("k", start);
        }

        // 10 per 60s is one token every 6s
        assert!(!limiter.check_at("k", start + Duration::from_secs(5)).allowed);
        let after = limiter.check_at("k", start + Duration::from_secs(6));
        assert!(after.allowed);
        assert_eq!(after.remaining, 1);
    }

    #[test]
    fn test_refill_caps_at_max() {
        let limiter = TokenBucketLimiter::new(PER_MINUTE);
        let start = Instant::now();
        limiter.consume_at("k", start);

        let later = limiter.check_at("k", start + Duration::from_secs(3600));
        assert_eq!(later.remaining, 10);
        assert_eq!(later.retry_after, Duration::ZERO);
    }

    #[test]
    fn test_check_does_not_consume() {
        let limiter = TokenBucketLimiter::new(RateLimitRule::new(1, 60_000));
        let now = Instant::now();

        for _ in 0..5 {
            assert!(limiter.check_at("k", now).allowed);
        }
        assert!(limiter.consume_at("k", now).allowed);
        assert!(!limiter.check_at("k", now).allowed);
    }

    #[test]
    fn test_never_allows_fractional_token() {
        let limiter = TokenBucketLimiter::new(RateLimitRule::new(1, 1_000));
        let now = Instant::now();
        assert!(limiter.consume_at("k", now).allowed);

        let half = limiter.consume_at("k", now + Duration::from_millis(500));
        assert!(!half.allowed);
        assert_eq!(half.remaining, 0);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = TokenBucketLimiter::new(RateLimitRule::new(1, 60_000));
        let now = Instant::now();
        assert!(limiter.consume_at("a", now).allowed);
        assert!(limiter.consume_at("b", now).allowed);
        assert!(!limiter.consume_at("a", now).allowed);
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[test]
    fn test_reset() {
        let limiter = TokenBucketLimiter::new(RateLimitRule::new(1, 60_000));
        let now = Instant::now();
        limiter.consume_at("a", now);
        limiter.consume_at("b", now);

        limiter.reset("a");
        assert!(limiter.consume_at("a", now).allowed);
        assert!(!limiter.consume_at("b", now).allowed);

        limiter.reset_all();
        assert_eq!(limiter.tracked_keys(), 0);
        assert!(limiter.consume_at("b", now).allowed);
    }

    #[test]
    fn test_full_buckets_are_pruned_after_a_window() {
        let limiter = TokenBucketLimiter::new(RateLimitRule::new(2, 1_000));
        let start = Instant::now();
        limiter.consume_at("idle", start);
        limiter.consume_at("busy", start);
        limiter.consume_at("busy", start);
        assert_eq!(limiter.tracked_keys(), 2);

        // "idle" is full again at 500ms, "busy" only at 1000ms
        limiter.prune_idle_at(start + Duration::from_millis(500));
        assert_eq!(limiter.tracked_keys(), 1);
        // kept with its refill progress, not restarted full
        assert_eq!(limiter.check_at("busy", start + Duration::from_millis(500)).remaining, 1);

        // the next lookup a window later sweeps on its own
        limiter.check_at("other", start + Duration::from_millis(1_500));
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_pruning_keeps_partial_buckets() {
        let limiter = TokenBucketLimiter::new(PER_MINUTE);
        let start = Instant::now();
        for _ in 0..10 {
            limiter.consume_at("k", start);
        }
        limiter.prune_idle_at(start + Duration::from_secs(30));
        let decision = limiter.consume_at("k", start + Duration::from_secs(30));
        // five tokens refilled, not a fresh bucket of ten
        assert_eq!(decision.remaining, 4);
    }

    #[test]
    fn test_decision_serializes_camel_case() {
        let limiter = TokenBucketLimiter::new(PER_MINUTE);
        let json = serde_json::to_value(limiter.check("k")).unwrap();
        assert_eq!(json["allowed"], true);
        assert_eq!(json["remaining"], 10);
        assert_eq!(json["retryAfter"], 0);
        assert!(json.get("resetAt").is_some());
    }
}
