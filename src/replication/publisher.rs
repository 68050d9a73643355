//! Replication Publisher.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use crate::codec;
use crate::error::Result;
use crate::model::{Entry, Operation, Priority, QueuedOperation, ReplicationEvent};
use crate::offline_queue::OfflineQueue;
use crate::topic::TopicScheme;
use crate::transport::{PublishRequest, TransportHandle};

/// Allocates a per-node monotonic `seq` starting at 1 and publishes
/// accepted local mutations on the replication topic at QoS=1. Falls back
/// to the Offline Queue when the transport is not connected.
pub struct Publisher {
    node_id: String,
    next_seq: AtomicU64,
    transport: TransportHandle,
    topics: TopicScheme,
    offline_queue: Arc<OfflineQueue>,
}

impl Publisher {
    pub fn new(
        node_id: String,
        transport: TransportHandle,
        topics: TopicScheme,
        offline_queue: Arc<OfflineQueue>,
    ) -> Self {
        Self { node_id, next_seq: AtomicU64::new(1), transport, topics, offline_queue }
    }

    /// Allocates the next monotonic outbound `seq`. Callers stamp the
    /// `Entry` they are about to store with this value *before* storing it,
    /// so the stored entry and the published event agree on `seq` (storage
    /// dedup is keyed on `(node_id, seq)`, so a locally-originated entry
    /// must never reuse a prior local `seq`).
    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Encodes and publishes the `ReplicationEvent` for an already-stored
    /// local mutation — or, if disconnected, hands it to the Offline Queue
    /// (high priority for deletes, normal otherwise). `entry.node_id` and
    /// `entry.seq` must already be this node's id and an allocated `seq`.
    pub async fn publish_mutation(&self, op: Operation, entry: &Entry) -> Result<()> {
        debug_assert_eq!(entry.node_id, self.node_id, "publisher only republishes this node's own entries");
        let event = ReplicationEvent::from_entry(op, entry);
        let encoded = codec::encode(&event)?;

        if self.transport.state() == crate::model::ConnectionState::Connected {
            let request = PublishRequest { topic: self.topics.replication_events(), payload: encoded };
            if self.transport.publish(request).await.is_ok() {
                return Ok(());
            }
        }

        let priority = if event.tombstone { Priority::High } else { Priority::Normal };
        self.offline_queue.enqueue(QueuedOperation {
            operation_id: Uuid::new_v4(),
            operation_type: format!("{:?}", op),
            priority,
            command_bytes: encoded,
            queued_at_ms: entry.timestamp_ms,
            attempts: 0,
            last_error: None,
        })
    }

    /// Re-publishes a previously queued, already-encoded event (used when
    /// draining the Offline Queue after reconnection).
    pub async fn publish_encoded(&self, encoded: Vec<u8>) -> Result<()> {
        let request = PublishRequest { topic: self.topics.replication_events(), payload: encoded };
        self.transport.publish(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_allocation_is_monotonic_starting_at_one() {
        let next_seq = AtomicU64::new(1);
        let first = next_seq.fetch_add(1, Ordering::SeqCst);
        let second = next_seq.fetch_add(1, Ordering::SeqCst);
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }
}
