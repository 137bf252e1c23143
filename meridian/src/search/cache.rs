//! Shard-level query result cache.
//!
//! Keyed by (reader generation, request fingerprint): a cached entry is only
//! ever served against the exact point-in-time view it was computed from.
//! When the reader moves to a new generation, entries of dead generations are
//! swept in one pass under the cache lock, so a shard close racing a reader
//! change can never observe a half-evicted set. Eviction within a generation
//! is weight-bounded LRU.

use crate::search::request::ShardQueryResult;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub reader_generation: u64,
    pub fingerprint: String,
}

struct CacheEntry {
    value: Arc<ShardQueryResult>,
    weight: u64,
    last_accessed: u64,
}

struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    current_weight: u64,
    access_counter: u64,
    hits: u64,
    misses: u64,
}

pub struct QueryCache {
    inner: Mutex<CacheInner>,
    max_weight: u64,
}

impl QueryCache {
    pub fn new(max_weight_bytes: u64) -> QueryCache {
        QueryCache {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                current_weight: 0,
                access_counter: 0,
                hits: 0,
                misses: 0,
            }),
            max_weight: max_weight_bytes,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<ShardQueryResult>> {
        let mut inner = self.inner.lock();
        inner.access_counter += 1;
        let counter = inner.access_counter;
        let value = inner.entries.get_mut(key).map(|entry| {
            entry.last_accessed = counter;
            Arc::clone(&entry.value)
        });
        match value {
            Some(value) => {
                inner.hits += 1;
                Some(value)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn put(&self, key: CacheKey, value: Arc<ShardQueryResult>) {
        let weight = bincode::serialized_size(&*value).unwrap_or(1024);
        if weight > self.max_weight {
            return;
        }
        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.remove(&key) {
            inner.current_weight -= old.weight;
        }
        while inner.current_weight + weight > self.max_weight {
            let victim = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone());
            match victim {
                Some(k) => {
                    if let Some(entry) = inner.entries.remove(&k) {
                        inner.current_weight -= entry.weight;
                    }
                }
                None => break,
            }
        }
        inner.access_counter += 1;
        let counter = inner.access_counter;
        inner.current_weight += weight;
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                weight,
                last_accessed: counter,
            },
        );
    }

    /// Atomically drop every entry that does not belong to the live reader
    /// generation.
    pub fn purge_other_generations(&self, live_generation: u64) {
        let mut inner = self.inner.lock();
        let mut freed = 0;
        inner.entries.retain(|key, entry| {
            let keep = key.reader_generation == live_generation;
            if !keep {
                freed += entry.weight;
            }
            keep
        });
        inner.current_weight -= freed;
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.current_weight = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn weight(&self) -> u64 {
        self.inner.lock().current_weight
    }

    /// (hits, misses)
    pub fn stats(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.hits, inner.misses)
    }
}
