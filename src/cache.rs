//! Content-addressed result cache with TTL staleness and single-flight
//! coordination.
//!
//! Keys are SHA-256 digests of the normalized query plus page index. Expired
//! entries are treated as absent and lazily evicted on lookup; a separate
//! `peek` keeps them reachable for explicit stale-serve fallbacks. The
//! single-flight claim ensures concurrent fetches for one (query, page) hit
//! the network exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Notify;

/// Cache key for a (query, page) pair: whitespace-collapsed, lowercased
/// query hashed together with the page index.
pub fn cache_key(query: &str, page: u32) -> String {
    let normalized = query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update([0u8]);
    hasher.update(page.to_be_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
struct Entry {
    html: Arc<String>,
    stored_at: Instant,
    /// Wall-clock stamp, kept for checkpointing across processes.
    stored_wall: SystemTime,
    ttl: Duration,
}

impl Entry {
    fn is_fresh(&self) -> bool {
        self.stored_at.elapsed() < self.ttl
    }
}

/// Cache observability counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

/// Outcome of a single-flight claim for a key.
pub enum Claim {
    /// The caller owns the fetch; dropping the guard wakes waiters.
    Leader(FlightGuard),
    /// Another caller is already fetching; wait on the notify and re-read.
    Wait(Arc<Notify>),
}

type InflightMap = Arc<Mutex<HashMap<String, Arc<Notify>>>>;

/// Held by the single caller fetching a key. Dropping it, on success or
/// failure, releases the flight and notifies waiters to re-check the cache.
pub struct FlightGuard {
    inflight: InflightMap,
    key: String,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let notify = self.inflight.lock().remove(&self.key);
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }
}

/// Concurrent (query, page) → HTML store.
pub struct ResultCache {
    default_ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
    inflight: InflightMap,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            entries: Mutex::new(HashMap::new()),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Fresh lookup. Expired entries count as misses and are evicted.
    pub fn get(&self, key: &str) -> Option<Arc<String>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_fresh() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&entry.html))
            }
            Some(_) => {
                entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Lookup ignoring freshness and counters. Lets the orchestrator hold a
    /// stale copy before a refetch, for the explicit stale-serve fallback.
    pub fn peek(&self, key: &str) -> Option<Arc<String>> {
        self.entries
            .lock()
            .get(key)
            .map(|entry| Arc::clone(&entry.html))
    }

    /// Store a page under the default TTL.
    pub fn put(&self, key: &str, html: String) -> Arc<String> {
        let html = Arc::new(html);
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                html: Arc::clone(&html),
                stored_at: Instant::now(),
                stored_wall: SystemTime::now(),
                ttl: self.default_ttl,
            },
        );
        html
    }

    /// Claim the single-flight slot for a key.
    pub fn claim(&self, key: &str) -> Claim {
        let mut inflight = self.inflight.lock();
        if let Some(notify) = inflight.get(key) {
            return Claim::Wait(Arc::clone(notify));
        }
        inflight.insert(key.to_string(), Arc::new(Notify::new()));
        Claim::Leader(FlightGuard {
            inflight: Arc::clone(&self.inflight),
            key: key.to_string(),
        })
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.entries.lock().len(),
        }
    }

    /// Export entries for checkpointing.
    pub(crate) fn export(&self) -> Vec<(String, Arc<String>, SystemTime, Duration)> {
        self.entries
            .lock()
            .iter()
            .map(|(key, entry)| {
                (
                    key.clone(),
                    Arc::clone(&entry.html),
                    entry.stored_wall,
                    entry.ttl,
                )
            })
            .collect()
    }

    /// Restore a checkpointed entry, preserving its remaining TTL. Returns
    /// false if the entry already expired.
    pub(crate) fn restore(
        &self,
        key: String,
        html: String,
        stored_wall: SystemTime,
        ttl: Duration,
    ) -> bool {
        let age = SystemTime::now()
            .duration_since(stored_wall)
            .unwrap_or(Duration::ZERO);
        if age >= ttl {
            return false;
        }
        let Some(stored_at) = Instant::now().checked_sub(age) else {
            return false;
        };
        self.entries.lock().insert(
            key,
            Entry {
                html: Arc::new(html),
                stored_at,
                stored_wall,
                ttl,
            },
        );
        true
    }
}
