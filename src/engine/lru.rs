// Capacity-bounded LRU store of per-object download metadata.

use hashlink::LinkedHashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::debug;

use super::entry::{CacheEntry, CacheKey};
use crate::error::{CacheError, Result};

/// Unit in which the metadata cache bound is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheCapacity {
    /// Sum of object sizes tracked by the cache.
    Bytes(u64),
    /// Number of tracked objects.
    Entries(u64),
}

impl CacheCapacity {
    pub fn limit(&self) -> u64 {
        match *self {
            CacheCapacity::Bytes(n) | CacheCapacity::Entries(n) => n,
        }
    }

    fn weight(&self, entry: &CacheEntry) -> u64 {
        match self {
            CacheCapacity::Bytes(_) => entry.size,
            CacheCapacity::Entries(_) => 1,
        }
    }
}

struct LruState {
    /// Front is least recently used.
    entries: LinkedHashMap<CacheKey, CacheEntry>,
    used: u64,
}

pub struct MetadataCache {
    capacity: CacheCapacity,
    state: Mutex<LruState>,
}

impl MetadataCache {
    pub fn new(capacity: CacheCapacity) -> Self {
        Self {
            capacity,
            state: Mutex::new(LruState {
                entries: LinkedHashMap::new(),
                used: 0,
            }),
        }
    }

    /// Look up an entry and mark it most recently used.
    pub fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        let mut state = self.state.lock();
        let entry = state.entries.remove(key)?;
        state.entries.insert(key.clone(), entry.clone());
        Some(entry)
    }

    /// Look up an entry without touching recency.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.state.lock().entries.get(key).cloned()
    }

    /// Insert or replace an entry as most recently used, evicting least recently used entries
    /// until it fits. Returns the evicted entries, oldest first.
    pub fn insert(&self, key: CacheKey, entry: CacheEntry) -> Result<Vec<CacheEntry>> {
        let weight = self.capacity.weight(&entry);
        if weight > self.capacity.limit() {
            return Err(CacheError::EntryTooLarge {
                size: weight,
                capacity: self.capacity.limit(),
            });
        }

        let mut state = self.state.lock();
        if let Some(old) = state.entries.remove(&key) {
            state.used -= self.capacity.weight(&old);
        }

        let mut evicted = Vec::new();
        while state.used + weight > self.capacity.limit() {
            let Some((evicted_key, victim)) = state.entries.pop_front() else {
                break;
            };
            state.used -= self.capacity.weight(&victim);
            debug!("metadata cache evicted {}", evicted_key);
            evicted.push(victim);
        }

        state.entries.insert(key, entry);
        state.used += weight;
        Ok(evicted)
    }

    /// Record download progress made by a job.
    ///
    /// Only updates an entry that is already cached, in place, so progress writes never change
    /// recency and never admit or evict anything. The confirmed offset only moves forward and
    /// never passes the entry size. Returns `false` when the entry is gone (evicted or
    /// invalidated); the job must then stop. Fails with `GenerationConflict` when the cached
    /// entry belongs to another generation.
    pub fn record_progress(&self, key: &CacheKey, generation: i64, offset: u64) -> Result<bool> {
        let mut state = self.state.lock();
        let Some(existing) = state.entries.get_mut(key) else {
            return Ok(false);
        };
        if existing.generation != generation {
            return Err(CacheError::GenerationConflict {
                job: generation,
                cached: existing.generation,
            });
        }
        existing.downloaded_offset = existing.downloaded_offset.max(offset).min(existing.size);
        Ok(true)
    }

    pub fn remove(&self, key: &CacheKey) -> Option<CacheEntry> {
        let mut state = self.state.lock();
        let entry = state.entries.remove(key)?;
        state.used -= self.capacity.weight(&entry);
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity units currently in use.
    pub fn used(&self) -> u64 {
        self.state.lock().used
    }

    pub fn capacity(&self) -> CacheCapacity {
        self.capacity
    }

    /// Keys from least to most recently used.
    pub fn keys_by_recency(&self) -> Vec<CacheKey> {
        self.state.lock().entries.keys().cloned().collect()
    }

    /// Assert that accounting, recency list and entries agree. Panics on violation; meant for
    /// tests, not for production error handling.
    pub fn check_invariants(&self) {
        let state = self.state.lock();
        let mut total = 0u64;
        for (key, entry) in state.entries.iter() {
            match entry.identity.key() {
                Ok(expected) if &expected == key => {}
                other => panic!("entry stored under {key} but identity keys to {other:?}"),
            }
            assert!(
                entry.downloaded_offset <= entry.size,
                "entry {key} downloaded {} of {} bytes",
                entry.downloaded_offset,
                entry.size
            );
            total += self.capacity.weight(entry);
        }
        assert_eq!(total, state.used, "tracked usage out of sync with entries");
        assert!(
            state.used <= self.capacity.limit(),
            "usage {} exceeds capacity {}",
            state.used,
            self.capacity.limit()
        );
    }
}
