//! Storage engine trait and implementations.
//!
//! The trait is deliberately narrow: `get`/`put`/`delete` plus the handful
//! of bulk operations anti-entropy and GC need. `MemoryEngine` holds
//! `Entry` values under LWW rules behind a `RwLock<HashMap>`;
//! `PersistentEngine` does the same over a `sled::Tree`.

mod memory;
mod persistent;

pub use memory::MemoryEngine;
pub use persistent::PersistentEngine;

use crate::error::Result;
use crate::model::Entry;

/// A range over the anti-entropy bucket space, used by `snapshot_digest`.
#[derive(Debug, Clone, Copy)]
pub struct BucketRange {
    pub start: u16,
    pub end: u16,
}

/// Storage engine contract shared by all backends.
///
/// Implementations own `Entry` state exclusively: all cross-component
/// mutation goes through `put`, never direct map access.
pub trait StorageEngine: Send + Sync {
    /// Returns the live value for `key`; tombstones surface as `None`.
    fn get(&self, key: &str) -> Result<Option<Entry>>;

    /// Applies the LWW merge rule: the incoming entry is accepted iff its
    /// `(timestamp_ms, node_id)` is strictly greater than the stored one, or
    /// the slot is empty. Returns `true` if the entry was accepted, `false`
    /// if rejected as stale or as an exact replay (dedup hit).
    fn put(&self, entry: Entry) -> Result<bool>;

    /// Equivalent to `put` with `is_tombstone = true`.
    fn delete(&self, key: &str, timestamp_ms: u64, node_id: &str, seq: u64) -> Result<bool>;

    /// Removes tombstones older than `now_ms - 86_400_000`. Returns the
    /// number removed. Live entries are never collected.
    fn gc_tombstones(&self, now_ms: u64) -> Result<u32>;

    /// Every entry currently held, live and tombstoned alike, for
    /// anti-entropy bucket hashing.
    fn all_entries(&self) -> Result<Vec<Entry>>;

    /// A digest (bucket id -> content hash) over the given bucket range,
    /// computed by whatever bucketing function the anti-entropy module
    /// supplies via `bucket_of`.
    fn snapshot_digest(
        &self,
        range: BucketRange,
        bucket_of: &dyn Fn(&str) -> u16,
    ) -> Result<std::collections::HashMap<u16, u64>>;

    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

pub(crate) const GC_TOMBSTONE_AGE_MS: u64 = 86_400_000;

pub(crate) fn accepts_incoming(stored: Option<&Entry>, incoming: &Entry) -> bool {
    match stored {
        None => true,
        Some(s) => incoming.version() > s.version(),
    }
}
