//! Manifest LRU cache, keyed by absolute URL (spec §5, §9 — replaces the
//! source's FIFO-by-insertion map with a proper bounded LRU).

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use tracing::debug;

pub struct ManifestCache {
    inner: Mutex<LruCache<String, String>>,
}

impl ManifestCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, url: &str) -> Option<String> {
        let mut cache = self.inner.lock().expect("manifest cache mutex poisoned");
        let hit = cache.get(url).cloned();
        if hit.is_some() {
            debug!(url, "manifest cache hit");
        } else {
            debug!(url, "manifest cache miss");
        }
        hit
    }

    pub fn put(&self, url: String, body: String) {
        let mut cache = self.inner.lock().expect("manifest cache mutex poisoned");
        cache.put(url, body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caches_and_evicts_at_capacity() {
        let cache = ManifestCache::new(2);
        cache.put("a".to_string(), "body-a".to_string());
        cache.put("b".to_string(), "body-b".to_string());
        assert_eq!(cache.get("a"), Some("body-a".to_string()));
        cache.put("c".to_string(), "body-c".to_string());
        // "b" was least-recently-used once "a" was touched above.
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("c"), Some("body-c".to_string()));
    }
}
