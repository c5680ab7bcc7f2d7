use lru::LruCache;
use sha2::{Digest, Sha256};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::metrics::{CACHE_HITS, CACHE_MISSES, CACHE_SIZE};

// Which pipeline stage a cached value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Analysis,
    Recommendation,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Recommendation => "recommendation",
        }
    }
}

// Cache key derived from request content plus the operation it serves.
//
// With `prefix_len` set only the first `prefix_len` bytes of the payload are hashed,
// so distinct payloads sharing that prefix share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(payload: &str, kind: OperationKind, prefix_len: Option<usize>) -> Self {
        let bytes = payload.as_bytes();
        let hashed = match prefix_len {
            Some(n) => &bytes[..n.min(bytes.len())],
            None => bytes,
        };

        let mut hasher = Sha256::new();
        hasher.update(hashed);
        hasher.update([0x1f]); // unit separator keeps payload and tag apart
        hasher.update(kind.as_str());
        Self(format!("{:x}", hasher.finalize()))
    }

}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // the first few hex digits are enough to correlate log lines
        write!(f, "{}", &self.0[..8])
    }
}

// Cache entry with timestamp
#[derive(Clone)]
pub struct CacheEntry {
    pub value: String,
    pub inserted_at: Instant,
}

// Bounded LRU cache whose entries expire `ttl` after insertion.
//
// Expiry is lazy: stale entries are dropped when a `get` finds them. One mutex guards
// the whole structure so lookup+promote and insert+evict are atomic.
pub struct ResponseCache {
    entries: Mutex<LruCache<Fingerprint, CacheEntry>>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn get(&self, key: &Fingerprint) -> Option<String> {
        self.get_at(key, Instant::now())
    }

    pub fn set(&self, key: Fingerprint, value: String) {
        self.set_at(key, value, Instant::now());
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    pub(crate) fn get_at(&self, key: &Fingerprint, now: Instant) -> Option<String> {
        let mut entries = self.lock();

        let expired = match entries.peek(key) {
            None => {
                CACHE_MISSES.inc();
                return None;
            }
            Some(entry) => now.saturating_duration_since(entry.inserted_at) > self.ttl,
        };

        if expired {
            entries.pop(key);
            CACHE_SIZE.set(entries.len() as f64);
            CACHE_MISSES.inc();
            return None;
        }

        CACHE_HITS.inc();
        // `get` promotes the entry to most recently used
        entries.get(key).map(|entry| entry.value.clone())
    }

    pub(crate) fn set_at(&self, key: Fingerprint, value: String, now: Instant) {
        let mut entries = self.lock();
        // `put` refreshes an existing key in place, or evicts the LRU entry when full
        entries.put(
            key,
            CacheEntry {
                value,
                inserted_at: now,
            },
        );
        CACHE_SIZE.set(entries.len() as f64);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<Fingerprint, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
