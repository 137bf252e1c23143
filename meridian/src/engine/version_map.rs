//! Live version map: the engine's in-memory view of recent writes.
//!
//! Tiers, consulted in order:
//!
//! 1. `live` — operations accepted since the last refresh. These are not yet
//!    visible to the searcher, so index entries pin the document source for
//!    real-time gets.
//! 2. `refreshing` — the previous live tier while a refresh is in flight.
//!    Writes arriving mid-refresh land in the fresh live tier and survive;
//!    the refreshing tier is dropped only once the new searcher is open.
//! 3. `tombstones` — deletes, retained past refresh so that a version lookup
//!    racing a delete cannot resurrect the old version. Pruned by age.
//! 4. `cache` — a bounded recency cache of (version, seq_no) for documents
//!    already visible in the index; avoids a searcher lookup per write.
//!
//! A miss in all tiers falls through to the searcher.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What the map knows about a document id.
#[derive(Debug, Clone)]
pub struct VersionLookup {
    pub version: u64,
    pub seq_no: u64,
    pub deleted: bool,
    /// Present only for uncommitted index operations (tier 1).
    pub source: Option<Arc<Value>>,
}

#[derive(Debug, Clone)]
struct LiveEntry {
    version: u64,
    seq_no: u64,
    source: Arc<Value>,
}

#[derive(Debug, Clone)]
struct Tombstone {
    version: u64,
    seq_no: u64,
    at: Instant,
}

struct CacheEntry {
    version: u64,
    seq_no: u64,
    deleted: bool,
    last_accessed: AtomicU64,
}

const DEFAULT_CACHE_CAPACITY: usize = 16 * 1024;

pub struct LiveVersionMap {
    live: RwLock<HashMap<String, LiveEntry>>,
    refreshing: RwLock<HashMap<String, LiveEntry>>,
    tombstones: RwLock<HashMap<String, Tombstone>>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    cache_capacity: usize,
    access_counter: AtomicU64,
}

impl Default for LiveVersionMap {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl LiveVersionMap {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            live: RwLock::new(HashMap::new()),
            refreshing: RwLock::new(HashMap::new()),
            tombstones: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
            cache_capacity: cache_capacity.max(1),
            access_counter: AtomicU64::new(0),
        }
    }

    /// Record an accepted index operation. Must be called under the id lock.
    pub fn put_index(&self, id: &str, version: u64, seq_no: u64, source: Arc<Value>) {
        self.tombstones.write().remove(id);
        self.live.write().insert(
            id.to_string(),
            LiveEntry {
                version,
                seq_no,
                source,
            },
        );
        self.cache_put(id, version, seq_no, false);
    }

    /// Record an accepted delete operation. Must be called under the id lock.
    pub fn put_delete(&self, id: &str, version: u64, seq_no: u64) {
        self.live.write().remove(id);
        self.refreshing.write().remove(id);
        self.tombstones.write().insert(
            id.to_string(),
            Tombstone {
                version,
                seq_no,
                at: Instant::now(),
            },
        );
        self.cache_put(id, version, seq_no, true);
    }

    /// Look an id up across the tiers.
    pub fn lookup(&self, id: &str) -> Option<VersionLookup> {
        for tier in [&self.live, &self.refreshing] {
            if let Some(entry) = tier.read().get(id) {
                return Some(VersionLookup {
                    version: entry.version,
                    seq_no: entry.seq_no,
                    deleted: false,
                    source: Some(Arc::clone(&entry.source)),
                });
            }
        }
        if let Some(t) = self.tombstones.read().get(id) {
            return Some(VersionLookup {
                version: t.version,
                seq_no: t.seq_no,
                deleted: true,
                source: None,
            });
        }
        let cache = self.cache.read();
        cache.get(id).map(|e| {
            let access = self.access_counter.fetch_add(1, Ordering::Relaxed);
            e.last_accessed.store(access, Ordering::Relaxed);
            VersionLookup {
                version: e.version,
                seq_no: e.seq_no,
                deleted: e.deleted,
                source: None,
            }
        })
    }

    /// Move the live tier aside before the refresh commit. Writes accepted
    /// while the refresh runs land in the fresh live tier.
    pub fn begin_refresh(&self) {
        let mut live = self.live.write();
        let mut refreshing = self.refreshing.write();
        // A previous refresh may have failed mid-way; keep its entries
        // visible rather than dropping them.
        for (k, v) in live.drain() {
            refreshing.insert(k, v);
        }
    }

    /// Drop the refreshing tier once the new searcher is open: those
    /// documents are searchable now. The (version, seq_no) tuples survive in
    /// the cache tier.
    pub fn end_refresh(&self) {
        self.refreshing.write().clear();
    }

    /// Remove tombstones older than `max_age`. Called on flush.
    pub fn prune_tombstones(&self, max_age: Duration) {
        self.tombstones.write().retain(|_, t| t.at.elapsed() < max_age);
    }

    pub fn live_len(&self) -> usize {
        self.live.read().len()
    }

    pub fn tombstone_len(&self) -> usize {
        self.tombstones.read().len()
    }

    fn cache_put(&self, id: &str, version: u64, seq_no: u64, deleted: bool) {
        let mut cache = self.cache.write();
        if cache.len() >= self.cache_capacity && !cache.contains_key(id) {
            // Evict the least recently touched entry.
            if let Some(victim) = cache
                .iter()
                .min_by_key(|(_, e)| e.last_accessed.load(Ordering::Relaxed))
                .map(|(k, _)| k.clone())
            {
                cache.remove(&victim);
            }
        }
        let access = self.access_counter.fetch_add(1, Ordering::Relaxed);
        cache.insert(
            id.to_string(),
            CacheEntry {
                version,
                seq_no,
                deleted,
                last_accessed: AtomicU64::new(access),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_index_then_lookup_carries_source() {
        let map = LiveVersionMap::default();
        map.put_index("a", 1, 0, Arc::new(json!({"f": 1})));

        let hit = map.lookup("a").unwrap();
        assert_eq!(hit.version, 1);
        assert_eq!(hit.seq_no, 0);
        assert!(!hit.deleted);
        assert!(hit.source.is_some());
    }

    #[test]
    fn test_delete_shadows_index() {
        let map = LiveVersionMap::default();
        map.put_index("a", 1, 0, Arc::new(json!({})));
        map.put_delete("a", 2, 1);

        let hit = map.lookup("a").unwrap();
        assert!(hit.deleted);
        assert_eq!(hit.version, 2);
        assert!(hit.source.is_none());
    }

    #[test]
    fn test_refresh_clears_sources_but_keeps_versions() {
        let map = LiveVersionMap::default();
        map.put_index("a", 3, 7, Arc::new(json!({"x": true})));
        map.begin_refresh();
        map.end_refresh();

        let hit = map.lookup("a").unwrap();
        assert_eq!(hit.version, 3);
        assert!(hit.source.is_none(), "source must not be pinned past refresh");
    }

    #[test]
    fn test_write_during_refresh_survives() {
        let map = LiveVersionMap::default();
        map.put_index("a", 1, 0, Arc::new(json!({"n": 1})));
        map.begin_refresh();
        // "a" is parked in the refreshing tier but still answers lookups.
        assert!(map.lookup("a").unwrap().source.is_some());

        map.put_index("b", 1, 1, Arc::new(json!({"n": 2})));
        map.end_refresh();

        assert!(map.lookup("a").unwrap().source.is_none());
        assert!(
            map.lookup("b").unwrap().source.is_some(),
            "a write racing the refresh must keep its pinned source"
        );
    }

    #[test]
    fn test_tombstones_survive_refresh() {
        let map = LiveVersionMap::default();
        map.put_delete("gone", 5, 11);
        map.begin_refresh();
        map.end_refresh();

        let hit = map.lookup("gone").unwrap();
        assert!(hit.deleted);

        map.prune_tombstones(Duration::from_secs(0));
        // After pruning, the cache tier may still answer; the tombstone map
        // itself must be empty.
        assert_eq!(map.tombstone_len(), 0);
    }

    #[test]
    fn test_cache_is_bounded() {
        let map = LiveVersionMap::new(4);
        for i in 0..20 {
            map.put_index(&format!("doc-{}", i), 1, i, Arc::new(json!({})));
        }
        map.begin_refresh();
        map.end_refresh();
        let hits = (0..20)
            .filter(|i| map.lookup(&format!("doc-{}", i)).is_some())
            .count();
        assert!(hits <= 4);
    }

    #[test]
    fn test_miss_returns_none() {
        let map = LiveVersionMap::default();
        assert!(map.lookup("never-seen").is_none());
    }
}
