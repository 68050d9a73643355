//! Replication Subscriber / Applier.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use log::warn;

use crate::codec;
use crate::error::Result;
use crate::model::ReplicationEvent;
use crate::storage::StorageEngine;

#[derive(Default)]
struct PeerState {
    contiguous_seq: u64,
    pending: BTreeSet<u64>,
}

impl PeerState {
    /// Records `seq` as applied and advances `contiguous_seq` as far as the
    /// run of consecutive applied sequence numbers allows.
    fn observe(&mut self, seq: u64) {
        if seq == self.contiguous_seq + 1 {
            self.contiguous_seq = seq;
            while self.pending.remove(&(self.contiguous_seq + 1)) {
                self.contiguous_seq += 1;
            }
        } else if seq > self.contiguous_seq {
            self.pending.insert(seq);
        }
    }
}

/// Decodes, validates, applies, and watermark-tracks inbound replication
/// events. A malformed event is logged and dropped; the stream is never
/// torn down over one bad record.
pub struct Subscriber {
    storage: std::sync::Arc<dyn StorageEngine>,
    local_node_id: String,
    watermarks: Mutex<HashMap<String, PeerState>>,
}

impl Subscriber {
    pub fn new(storage: std::sync::Arc<dyn StorageEngine>, local_node_id: String) -> Self {
        Self { storage, local_node_id, watermarks: Mutex::new(HashMap::new()) }
    }

    /// Applies one inbound replication payload. Returns `Ok(true)` if the
    /// event was applied (merge accepted), `Ok(false)` if decoded but
    /// rejected by LWW/dedup, and never propagates a decode error — those
    /// are logged and treated as dropped.
    pub fn apply(&self, payload: &[u8]) -> bool {
        let event = match codec::decode(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("dropping malformed replication event: {e}");
                return false;
            }
        };
        if event.node_id == self.local_node_id {
            // Loop prevention: never re-apply our own published event.
            return false;
        }
        self.apply_decoded(event).unwrap_or_else(|e| {
            warn!("dropping replication event after storage error: {e}");
            false
        })
    }

    fn apply_decoded(&self, event: ReplicationEvent) -> Result<bool> {
        let node_id = event.node_id.clone();
        let seq = event.seq;
        let entry = event.into_entry();
        let accepted = self.storage.put(entry)?;

        let mut watermarks = self.watermarks.lock().unwrap();
        watermarks.entry(node_id).or_default().observe(seq);
        Ok(accepted)
    }

    /// The highest contiguous `seq` observed from `node_id`, used by
    /// anti-entropy to bound what still needs reconciling.
    pub fn watermark(&self, node_id: &str) -> u64 {
        self.watermarks.lock().unwrap().get(node_id).map(|s| s.contiguous_seq).unwrap_or(0)
    }
}
