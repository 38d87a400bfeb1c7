use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use http::HeaderMap;
use http::header::CACHE_CONTROL;
use tracing::debug;

use crate::response::RawResponse;
use crate::util::lock_unpoisoned;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

struct CacheEntry {
    response: Arc<RawResponse>,
    created_at: Instant,
    expires_at: Instant,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub evictions: u64,
    pub entries: usize,
}

/// Shared response store keyed by `METHOD:url`.
///
/// Entries are replaced rather than updated; an entry whose expiry has passed
/// is evicted by the read that observes it.
pub struct ResponseCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    evictions: AtomicU64,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ResponseCache")
            .field("entries", &self.len())
            .finish()
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn key(method: &http::Method, url: &str) -> String {
        format!("{method}:{url}")
    }

    pub fn get(&self, key: &str) -> Option<Arc<RawResponse>> {
        let now = self.clock.now();
        let mut entries = lock_unpoisoned(&self.entries);
        let expired = match entries.get(key) {
            Some(entry) if now > entry.expires_at => true,
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(
                    key,
                    age_ms = now.saturating_duration_since(entry.created_at).as_millis() as u64,
                    "cache hit"
                );
                return Some(Arc::clone(&entry.response));
            }
            None => false,
        };
        if expired {
            entries.remove(key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key, "evicted expired cache entry");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn set(&self, key: impl Into<String>, response: Arc<RawResponse>, ttl: Duration) {
        let created_at = self.clock.now();
        let entry = CacheEntry {
            response,
            created_at,
            expires_at: created_at + ttl,
        };
        lock_unpoisoned(&self.entries).insert(key.into(), entry);
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invalidate(&self, key: &str) -> bool {
        lock_unpoisoned(&self.entries).remove(key).is_some()
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn prune_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = lock_unpoisoned(&self.entries);
        let before = entries.len();
        entries.retain(|_, entry| now <= entry.expires_at);
        let removed = before - entries.len();
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.entries).clear();
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

/// TTL from a positive `cache-control: max-age=N` directive.
pub(crate) fn max_age(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|directive| {
            let (name, value) = directive.trim().split_once('=')?;
            if !name.trim().eq_ignore_ascii_case("max-age") {
                return None;
            }
            value.trim().trim_matches('"').parse::<u64>().ok()
        })
        .find(|seconds| *seconds > 0)
        .map(Duration::from_secs)
}
