//! Anti-Entropy Protocol: bucketed digest exchange and
//! targeted repair for bounded reconciliation after prolonged divergence.
//!
//! A fixed 256-bucket digest scheme: each bucket's digest is an XOR of
//! per-entry `xxh3_64` hashes, order-independent so nodes with the same
//! entries in different insertion order still agree. Digest diffing drives
//! a repair-entry exchange sized against a 300 KiB / 30s budget.

use std::collections::HashMap;
use std::time::Duration;

use log::info;

use crate::command::SYNC_TIMEOUT;
use crate::error::{Error, Result};
use crate::model::Entry;
use crate::storage::{BucketRange, StorageEngine};

pub const BUCKET_COUNT: u16 = 256;
/// Soft cap on a digest request payload.
pub const DIGEST_REQUEST_BUDGET_BYTES: usize = 300 * 1024;
pub const SESSION_DEADLINE: Duration = SYNC_TIMEOUT;

/// Stable bucket assignment for a key: `xxh3_64(key) % BUCKET_COUNT`.
pub fn bucket_of(key: &str) -> u16 {
    (xxhash_rust::xxh3::xxh3_64(key.as_bytes()) % BUCKET_COUNT as u64) as u16
}

/// A peer's per-bucket digest, keyed by bucket id.
pub type Digest = HashMap<u16, u64>;

/// Computes the digest over every bucket for the local dataset.
pub fn compute_digest(storage: &dyn StorageEngine) -> Result<Digest> {
    storage.snapshot_digest(BucketRange { start: 0, end: BUCKET_COUNT }, &bucket_of)
}

/// Buckets present in one digest but not the other, or present in both
/// with differing hashes — the set that needs a detail exchange.
pub fn diff_buckets(local: &Digest, remote: &Digest) -> Vec<u16> {
    let mut mismatched: Vec<u16> = Vec::new();
    for bucket in 0..BUCKET_COUNT {
        let l = local.get(&bucket).copied().unwrap_or(0);
        let r = remote.get(&bucket).copied().unwrap_or(0);
        if l != r {
            mismatched.push(bucket);
        }
    }
    mismatched
}

/// Per-bucket detail: every `(key, ts, node_id, seq, is_tombstone)` entry
/// in that bucket, used to identify which specific keys diverged.
pub fn bucket_entries(storage: &dyn StorageEngine, bucket: u16) -> Result<Vec<Entry>> {
    Ok(storage
        .all_entries()?
        .into_iter()
        .filter(|e| bucket_of(&e.key) == bucket)
        .collect())
}

/// Given the local entries for a mismatched bucket and the peer's entries
/// for the same bucket, returns the entries the local side is missing or
/// holds a strictly older version of — these become repair
/// `ReplicationEvent`s sent back to the peer's Storage via the normal
/// `put` path (LWW decides the winner on apply; this function does not
/// itself judge who's right, `StorageEngine::put` already does).
pub fn entries_to_pull(local: &[Entry], remote: &[Entry]) -> Vec<Entry> {
    let local_by_key: HashMap<&str, &Entry> = local.iter().map(|e| (e.key.as_str(), e)).collect();
    remote
        .iter()
        .filter(|r| match local_by_key.get(r.key.as_str()) {
            None => true,
            Some(l) => r.version() > l.version(),
        })
        .cloned()
        .collect()
}

/// Runs one reconciliation session against a single peer's digest and
/// entry set, applying anything the peer has that's newer. Bounded by
/// `SESSION_DEADLINE`; a session that runs long is cut short rather than
/// left to block indefinitely, matching the transport's cancellable-wait
/// discipline.
pub async fn reconcile_with_peer(
    storage: &dyn StorageEngine,
    peer_digest: &Digest,
    fetch_bucket_entries: impl Fn(u16) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<Entry>>> + Send>>,
) -> Result<u32> {
    tokio::time::timeout(SESSION_DEADLINE, async {
        let local_digest = compute_digest(storage)?;
        let mismatched = diff_buckets(&local_digest, peer_digest);
        let mut repaired = 0u32;
        for bucket in mismatched {
            let local_entries = bucket_entries(storage, bucket)?;
            let remote_entries = fetch_bucket_entries(bucket).await?;
            for entry in entries_to_pull(&local_entries, &remote_entries) {
                if storage.put(entry)? {
                    repaired += 1;
                }
            }
        }
        info!("anti-entropy session repaired {repaired} entries across mismatched buckets");
        Ok(repaired)
    })
    .await
    .map_err(|_| Error::timeout("anti-entropy session exceeded 30s deadline"))?
}
