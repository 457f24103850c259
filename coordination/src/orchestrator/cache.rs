//! Bounded result cache with lazy expiry.
//!
//! Entries are keyed by a blake3 hash of `(to, tool, args)`. The caller is
//! not part of the key, so two agents asking the same question share one
//! answer. Storage is a `moka` cache with LRU eviction; each entry also
//! carries a deadline on the tokio clock, checked on lookup, so expiry
//! follows paused test time as well as wall time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use super::types::InvocationResult;

/// Default time-to-live of a cached result.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Default number of cached results.
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// Hash `(to, tool, args)` into a cache key.
///
/// `serde_json` keeps object keys sorted, so argument maps built in a
/// different order hash the same.
pub fn cache_key(to: &str, tool: &str, args: &Value) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(to.as_bytes());
    hasher.update(&[0]);
    hasher.update(tool.as_bytes());
    hasher.update(&[0]);
    hasher.update(args.to_string().as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// A stored result and its lifetime.
#[derive(Debug, Clone)]
pub struct CachedResult {
    pub result: InvocationResult,
    pub cached_at: DateTime<Utc>,
    expires_at: Instant,
}

impl CachedResult {
    pub fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct ResultCache {
    entries: Cache<String, CachedResult>,
    ttl: Duration,
    capacity: usize,
    counters: Arc<Counters>,
}

impl ResultCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        let counters = Arc::new(Counters::default());
        let removals = Arc::clone(&counters);
        let entries = Cache::builder()
            .max_capacity(capacity as u64)
            .time_to_live(ttl)
            .eviction_policy(EvictionPolicy::lru())
            .eviction_listener(move |_key, _value, cause: RemovalCause| match cause {
                RemovalCause::Size => Counters::bump(&removals.evictions),
                RemovalCause::Expired => Counters::bump(&removals.expirations),
                _ => {}
            })
            .build();
        Self {
            entries,
            ttl,
            capacity,
            counters,
        }
    }

    /// Fresh result for `key`, refreshing its recency.
    pub fn get(&self, key: &str, now: Instant) -> Option<InvocationResult> {
        match self.entries.get(key) {
            Some(entry) if entry.is_fresh(now) => {
                Counters::bump(&self.counters.hits);
                Some(entry.result)
            }
            Some(_) => {
                self.entries.invalidate(key);
                self.entries.run_pending_tasks();
                Counters::bump(&self.counters.expirations);
                Counters::bump(&self.counters.misses);
                None
            }
            None => {
                Counters::bump(&self.counters.misses);
                None
            }
        }
    }

    pub fn insert(&self, key: String, result: InvocationResult, now: Instant) {
        if self.capacity == 0 {
            return;
        }
        self.entries.insert(
            key,
            CachedResult {
                result,
                cached_at: Utc::now(),
                expires_at: now + self.ttl,
            },
        );
        // apply recency updates and evictions now so the bound holds
        // after every insert
        self.entries.run_pending_tasks();
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks();
    }

    pub fn len(&self) -> usize {
        self.entries.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.entries.run_pending_tasks();
        CacheStats {
            entries: self.len(),
            capacity: self.capacity,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
        }
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL, DEFAULT_CACHE_CAPACITY)
    }
}
