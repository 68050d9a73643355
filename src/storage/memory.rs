//! In-memory storage engine: `RwLock<HashMap<String, Entry>>` plus a bounded
//! `(node_id, seq)` dedup index, holding LWW-ordered `Entry` values.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Mutex, RwLock};

use lru::LruCache;

use crate::error::Result;
use crate::model::Entry;

use super::{accepts_incoming, BucketRange, StorageEngine, GC_TOMBSTONE_AGE_MS};

const DEFAULT_DEDUP_CAPACITY: usize = 65_536;

/// Thread-safe in-memory engine. Multiple readers proceed concurrently;
/// writes take the exclusive lock.
pub struct MemoryEngine {
    data: RwLock<HashMap<String, Entry>>,
    dedup: Mutex<LruCache<(String, u64), ()>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::with_dedup_capacity(DEFAULT_DEDUP_CAPACITY)
    }

    pub fn with_dedup_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            data: RwLock::new(HashMap::new()),
            dedup: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn already_seen(&self, entry: &Entry) -> bool {
        let mut dedup = self.dedup.lock().unwrap();
        let key = entry.dedup_key();
        if dedup.contains(&key) {
            return true;
        }
        dedup.put(key, ());
        false
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine for MemoryEngine {
    fn get(&self, key: &str) -> Result<Option<Entry>> {
        let data = self.data.read().unwrap();
        Ok(data.get(key).filter(|e| !e.is_tombstone).cloned())
    }

    fn put(&self, entry: Entry) -> Result<bool> {
        if self.already_seen(&entry) {
            return Ok(false);
        }
        let mut data = self.data.write().unwrap();
        let accepted = accepts_incoming(data.get(&entry.key), &entry);
        if accepted {
            data.insert(entry.key.clone(), entry);
        }
        Ok(accepted)
    }

    fn delete(&self, key: &str, timestamp_ms: u64, node_id: &str, seq: u64) -> Result<bool> {
        self.put(Entry::tombstone(key.to_string(), timestamp_ms, node_id.to_string(), seq))
    }

    fn gc_tombstones(&self, now_ms: u64) -> Result<u32> {
        let cutoff = now_ms.saturating_sub(GC_TOMBSTONE_AGE_MS);
        let mut data = self.data.write().unwrap();
        let before = data.len();
        data.retain(|_, e| !(e.is_tombstone && e.timestamp_ms < cutoff));
        Ok((before - data.len()) as u32)
    }

    fn all_entries(&self) -> Result<Vec<Entry>> {
        let data = self.data.read().unwrap();
        Ok(data.values().cloned().collect())
    }

    fn snapshot_digest(
        &self,
        range: BucketRange,
        bucket_of: &dyn Fn(&str) -> u16,
    ) -> Result<HashMap<u16, u64>> {
        let data = self.data.read().unwrap();
        let mut acc: HashMap<u16, u64> = HashMap::new();
        for entry in data.values() {
            let bucket = bucket_of(&entry.key);
            if bucket < range.start || bucket >= range.end {
                continue;
            }
            let mut bytes = Vec::with_capacity(entry.key.len() + 32);
            bytes.extend_from_slice(entry.key.as_bytes());
            bytes.extend_from_slice(&entry.timestamp_ms.to_be_bytes());
            bytes.extend_from_slice(entry.node_id.as_bytes());
            bytes.extend_from_slice(&entry.seq.to_be_bytes());
            bytes.push(entry.is_tombstone as u8);
            let entry_hash = xxhash_rust::xxh3::xxh3_64(&bytes);
            let slot = acc.entry(bucket).or_insert(0);
            *slot ^= entry_hash;
        }
        Ok(acc)
    }

    fn len(&self) -> Result<usize> {
        Ok(self.data.read().unwrap().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn e(key: &str, value: &str, ts: u64, node: &str, seq: u64) -> Entry {
        Entry::live(key.into(), value.into(), ts, node.into(), seq)
    }

    #[test]
    fn put_accepts_newer_rejects_older() {
        let store = MemoryEngine::new();
        assert!(store.put(e("k", "v1", 100, "A", 1)).unwrap());
        assert!(!store.put(e("k", "v0", 50, "A", 2)).unwrap());
        assert_eq!(store.get("k").unwrap().unwrap().value, Some("v1".into()));
    }

    #[test]
    fn tiebreak_on_node_id_lexicographic() {
        let store = MemoryEngine::new();
        assert!(store.put(e("k", "v1", 100, "A", 1)).unwrap());
        assert!(store.put(e("k", "v2", 100, "B", 2)).unwrap());
        assert_eq!(store.get("k").unwrap().unwrap().value, Some("v2".into()));
    }

    #[test]
    fn equal_timestamp_and_node_id_is_duplicate() {
        let store = MemoryEngine::new();
        assert!(store.put(e("k", "v1", 100, "A", 1)).unwrap());
        assert!(!store.put(e("k", "v2", 100, "A", 2)).unwrap());
        assert_eq!(store.get("k").unwrap().unwrap().value, Some("v1".into()));
    }

    #[test]
    fn dedup_index_drops_exact_replay() {
        let store = MemoryEngine::new();
        let entry = e("k", "v1", 100, "A", 1);
        assert!(store.put(entry.clone()).unwrap());
        assert!(!store.put(entry).unwrap());
    }

    #[test]
    fn tombstone_hides_get_but_survives_until_gc() {
        let store = MemoryEngine::new();
        assert!(store.put(e("k", "v1", 100, "A", 1)).unwrap());
        assert!(store.delete("k", 200, "A", 2).unwrap());
        assert!(store.get("k").unwrap().is_none());
        assert_eq!(store.gc_tombstones(200 + GC_TOMBSTONE_AGE_MS - 1).unwrap(), 0);
        assert_eq!(store.gc_tombstones(200 + GC_TOMBSTONE_AGE_MS + 1).unwrap(), 1);
    }

    #[test]
    fn gc_never_collects_live_entries() {
        let store = MemoryEngine::new();
        assert!(store.put(e("k", "v1", 100, "A", 1)).unwrap());
        assert_eq!(store.gc_tombstones(u64::MAX).unwrap(), 0);
        assert!(store.get("k").unwrap().is_some());
    }

    #[test]
    fn snapshot_digest_is_order_independent_within_bucket() {
        let store = MemoryEngine::new();
        store.put(e("k1", "v1", 100, "A", 1)).unwrap();
        store.put(e("k2", "v2", 101, "A", 2)).unwrap();
        let all_bucket = |_: &str| 0u16;
        let digest = store.snapshot_digest(BucketRange { start: 0, end: 1 }, &all_bucket).unwrap();
        assert_eq!(digest.len(), 1);
        assert_ne!(*digest.get(&0).unwrap(), 0);
    }
}
