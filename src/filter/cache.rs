// Parsed-tree cache, keyed by expression text within a resource, bounded
// by LRU (§4.A "Caching"). Built the way the teacher's `cache::query_cache`
// module is: entries + capacity + eviction counter, not a bespoke one-off.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::ast::FilterNode;

struct LruEntry {
    node: Arc<FilterNode>,
    recency: u64,
}

/// Per-resource bounded LRU cache of compiled filter trees.
pub struct FilterCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    entries: HashMap<(String, String), LruEntry>,
    clock: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl FilterCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                clock: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    pub fn get(&self, resource: &str, expr: &str) -> Option<Arc<FilterNode>> {
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let clock = inner.clock;
        let key = (resource.to_string(), expr.to_string());
        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.recency = clock;
            inner.hits += 1;
            return Some(entry.node.clone());
        }
        inner.misses += 1;
        None
    }

    pub fn insert(&self, resource: &str, expr: &str, node: Arc<FilterNode>) {
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let clock = inner.clock;
        let key = (resource.to_string(), expr.to_string());
        if inner.entries.len() >= self.capacity && !inner.entries.contains_key(&key) {
            if let Some(evict_key) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.recency)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&evict_key);
                inner.evictions += 1;
            }
        }
        inner.entries.insert(key, LruEntry { node, recency: clock });
    }

    pub fn stats(&self) -> (u64, u64, u64) {
        let inner = self.inner.lock();
        (inner.hits, inner.misses, inner.evictions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used_when_full() {
        let cache = FilterCache::new(2);
        cache.insert("widgets", "a", Arc::new(FilterNode::True));
        cache.insert("widgets", "b", Arc::new(FilterNode::True));
        // touch "a" so "b" becomes the least recently used
        assert!(cache.get("widgets", "a").is_some());
        cache.insert("widgets", "c", Arc::new(FilterNode::True));
        assert!(cache.get("widgets", "b").is_none());
        assert!(cache.get("widgets", "a").is_some());
        assert!(cache.get("widgets", "c").is_some());
    }

    #[test]
    fn cache_is_scoped_per_resource() {
        let cache = FilterCache::new(10);
        cache.insert("widgets", "x", Arc::new(FilterNode::True));
        assert!(cache.get("gadgets", "x").is_none());
    }
}
