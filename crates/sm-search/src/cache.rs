//! TTL-bounded LRU cache for hybrid results.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use sha2::{Digest, Sha256};

use crate::hybrid::HybridResult;

/// Default cache capacity (distinct query/option pairs).
pub const DEFAULT_CAPACITY: usize = 64;

/// Default entry time-to-live.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Cache key from the query text and an options digest.
pub fn cache_key(query: &str, options_digest: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    hasher.update([0x1f]);
    hasher.update(options_digest.as_bytes());
    hex::encode(hasher.finalize())
}

/// Small LRU of recent result lists.
pub struct ResultCache {
    inner: LruCache<String, (Instant, Vec<HybridResult>)>,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        ResultCache {
            inner: LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("capacity is non-zero"),
            ),
            ttl,
        }
    }

    pub fn get(&mut self, key: &str) -> Option<Vec<HybridResult>> {
        let expired = match self.inner.get(key) {
            Some((stored_at, results)) => {
                if stored_at.elapsed() <= self.ttl {
                    return Some(results.clone());
                }
                true
            }
            None => false,
        };
        if expired {
            self.inner.pop(key);
        }
        None
    }

    pub fn put(&mut self, key: String, results: Vec<HybridResult>) {
        self.inner.put(key, (Instant::now(), results));
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        ResultCache::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}
