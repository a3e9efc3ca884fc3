//! Response caching for conditional GET requests.
//!
//! Entries are keyed by relative URL and carry the change vector the server
//! returned for them. A session sends the cached change vector with a
//! multi-get sub-request; a `304 Not Modified` reply means the cached body is
//! still current.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// A cached response body.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    /// Change vector (ETag) returned with the body.
    pub change_vector: String,
    pub body: Value,
}

/// Cache hook an executor may expose to sessions.
///
/// Implementations are shared between sessions and must be thread-safe.
pub trait ResponseCache: Send + Sync {
    /// Look up a cached response by URL.
    fn get(&self, url: &str) -> Option<CachedResponse>;

    /// Store a response body with its change vector.
    fn set(&self, url: &str, change_vector: &str, body: Value);

    /// Drop a cached entry.
    fn remove(&self, url: &str);
}

#[derive(Debug, Clone)]
struct CacheEntry {
    response: CachedResponse,
    last_used: Instant,
    hit_count: u64,
}

/// In-memory LRU response cache.
///
/// When the cache exceeds `max_size`, the least-recently-used entry is evicted.
///
/// # Example
///
/// ```
/// use docdb_core::{MemoryResponseCache, ResponseCache};
/// use serde_json::json;
///
/// let cache = MemoryResponseCache::new(100);
/// cache.set("/docs?id=users%2F1", "A:1-abc", json!({ "Results": [] }));
///
/// let hit = cache.get("/docs?id=users%2F1").unwrap();
/// assert_eq!(hit.change_vector, "A:1-abc");
/// assert!(cache.get("/docs?id=users%2F2").is_none());
/// ```
#[derive(Debug)]
pub struct MemoryResponseCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    max_size: usize,
}

impl MemoryResponseCache {
    /// Create a new cache with the given maximum number of entries.
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::with_capacity(max_size.min(256))),
            max_size,
        }
    }

    /// Check if a URL is cached.
    pub fn contains(&self, url: &str) -> bool {
        self.lock().contains_key(url)
    }

    /// Number of times a cached entry has been served.
    pub fn hit_count(&self, url: &str) -> u64 {
        self.lock().get(url).map_or(0, |entry| entry.hit_count)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Clear all cached responses.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn evict_lru(entries: &mut HashMap<String, CacheEntry>) {
        let lru_key = entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone());
        if let Some(key) = lru_key {
            tracing::trace!(url = %key, "Evicting cached response");
            entries.remove(&key);
        }
    }
}

impl Default for MemoryResponseCache {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl ResponseCache for MemoryResponseCache {
    fn get(&self, url: &str) -> Option<CachedResponse> {
        let mut entries = self.lock();
        let entry = entries.get_mut(url)?;
        entry.last_used = Instant::now();
        entry.hit_count += 1;
        Some(entry.response.clone())
    }

    fn set(&self, url: &str, change_vector: &str, body: Value) {
        if self.max_size == 0 {
            return;
        }
        let mut entries = self.lock();
        if !entries.contains_key(url) && entries.len() >= self.max_size {
            Self::evict_lru(&mut entries);
        }
        entries.insert(
            url.to_string(),
            CacheEntry {
                response: CachedResponse {
                    change_vector: change_vector.to_string(),
                    body,
                },
                last_used: Instant::now(),
                hit_count: 0,
            },
        );
    }

    fn remove(&self, url: &str) {
        self.lock().remove(url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cache_hit_and_miss() {
        let cache = MemoryResponseCache::new(10);
        cache.set("/a", "A:1", json!(1));
        assert_eq!(cache.get("/a").map(|r| r.body), Some(json!(1)));
        assert!(cache.get("/b").is_none());
        assert_eq!(cache.hit_count("/a"), 1);
    }

    #[test]
    fn test_overwrite_keeps_size() {
        let cache = MemoryResponseCache::new(2);
        cache.set("/a", "A:1", json!(1));
        cache.set("/a", "A:2", json!(2));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("/a").map(|r| r.change_vector).as_deref(), Some("A:2"));
    }

    #[test]
    fn test_eviction() {
        let cache = MemoryResponseCache::new(2);
        cache.set("/1", "A:1", json!(1));
        std::thread::sleep(std::time::Duration::from_millis(2));
        cache.set("/2", "A:2", json!(2));
        std::thread::sleep(std::time::Duration::from_millis(2));
        cache.set("/3", "A:3", json!(3));

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("/1"));
        assert!(cache.contains("/2"));
        assert!(cache.contains("/3"));
    }

    #[test]
    fn test_lru_ordering() {
        let cache = MemoryResponseCache::new(2);
        cache.set("/1", "A:1", json!(1));
        std::thread::sleep(std::time::Duration::from_millis(2));
        cache.set("/2", "A:2", json!(2));
        std::thread::sleep(std::time::Duration::from_millis(2));

        // Touch /1 so /2 becomes least recently used
        assert!(cache.get("/1").is_some());
        std::thread::sleep(std::time::Duration::from_millis(2));
        cache.set("/3", "A:3", json!(3));

        assert!(cache.contains("/1"));
        assert!(!cache.contains("/2"));
        assert!(cache.contains("/3"));
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = MemoryResponseCache::default();
        cache.set("/1", "A:1", json!(1));
        cache.set("/2", "A:2", json!(2));
        cache.remove("/1");
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_capacity_stores_nothing() {
        let cache = MemoryResponseCache::new(0);
        cache.set("/1", "A:1", json!(1));
        assert!(cache.is_empty());
    }
}
