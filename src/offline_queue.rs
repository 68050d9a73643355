//! Durable, bounded FIFO-within-priority offline operation queue.
//! A `Mutex<VecDeque>` per priority tier holds operations while the
//! transport is down; `QueuePersistence` is a narrow trait-per-backend,
//! the same shape as `storage::StorageEngine`.

use std::collections::VecDeque;
use std::sync::Mutex;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Priority, QueuedOperation};

const DEFAULT_CAPACITY: usize = 1_000;
const DEFAULT_DRAIN_BATCH: usize = 10;
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_MAX_AGE_MS: u64 = 24 * 60 * 60 * 1000;

/// Pluggable durability backend. Semantics are identical regardless of
/// implementation; only durability across process restarts differs.
pub trait QueuePersistence: Send + Sync {
    fn save_all(&self, ops: &[QueuedOperation]) -> Result<()>;
    fn load_all(&self) -> Result<Vec<QueuedOperation>>;
}

/// In-memory persistence: nothing survives a restart. Used by default and
/// in tests.
#[derive(Default)]
pub struct NullPersistence;

impl QueuePersistence for NullPersistence {
    fn save_all(&self, _ops: &[QueuedOperation]) -> Result<()> {
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<QueuedOperation>> {
        Ok(Vec::new())
    }
}

/// Sled-backed persistence, reusing the `sled::Db` a `PersistentEngine`
/// already opened: one database, two named trees.
pub struct SledPersistence {
    tree: sled::Tree,
}

impl SledPersistence {
    pub fn new(db: &sled::Db) -> Result<Self> {
        let tree = db.open_tree(b"offline_queue")?;
        Ok(Self { tree })
    }
}

impl QueuePersistence for SledPersistence {
    fn save_all(&self, ops: &[QueuedOperation]) -> Result<()> {
        self.tree.clear()?;
        for op in ops {
            let bytes = serde_json::to_vec(op)
                .map_err(|e| Error::storage(format!("failed to serialize queued op: {e}")))?;
            self.tree.insert(op.operation_id.as_bytes(), bytes)?;
        }
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<QueuedOperation>> {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let (_, value) = item?;
            let op: QueuedOperation = serde_json::from_slice(&value)
                .map_err(|e| Error::storage(format!("corrupt queued op: {e}")))?;
            out.push(op);
        }
        Ok(out)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct QueueStats {
    pub high_count: usize,
    pub normal_count: usize,
    pub low_count: usize,
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_dropped: u64,
    pub oldest_age_ms: Option<u64>,
}

struct QueueInner {
    high: VecDeque<QueuedOperation>,
    normal: VecDeque<QueuedOperation>,
    low: VecDeque<QueuedOperation>,
    total_processed: u64,
    total_failed: u64,
    total_dropped: u64,
}

impl QueueInner {
    fn lane(&mut self, priority: Priority) -> &mut VecDeque<QueuedOperation> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }
}

/// Bounded, priority-ordered offline queue. `capacity`, `max_age_ms`,
/// `drain_batch`, and `max_retries` have sane defaults but are all
/// configurable through `Config`.
pub struct OfflineQueue {
    inner: Mutex<QueueInner>,
    persistence: Box<dyn QueuePersistence>,
    capacity: usize,
    max_age_ms: u64,
    drain_batch: usize,
    max_retries: u32,
}

impl OfflineQueue {
    pub fn new(persistence: Box<dyn QueuePersistence>) -> Result<Self> {
        Self::with_limits(
            persistence,
            DEFAULT_CAPACITY,
            DEFAULT_MAX_AGE_MS,
            DEFAULT_DRAIN_BATCH,
            DEFAULT_MAX_RETRIES,
        )
    }

    pub fn with_limits(
        persistence: Box<dyn QueuePersistence>,
        capacity: usize,
        max_age_ms: u64,
        drain_batch: usize,
        max_retries: u32,
    ) -> Result<Self> {
        let loaded = persistence.load_all()?;
        let mut inner = QueueInner {
            high: VecDeque::new(),
            normal: VecDeque::new(),
            low: VecDeque::new(),
            total_processed: 0,
            total_failed: 0,
            total_dropped: 0,
        };
        for op in loaded {
            inner.lane(op.priority).push_back(op);
        }
        Ok(Self { inner: Mutex::new(inner), persistence, capacity, max_age_ms, drain_batch, max_retries })
    }

    /// Enqueues an operation. If the queue is at capacity, evicts the
    /// oldest item in the lowest non-empty priority lane before admitting
    /// the new one; returns `ErrorKind::Backpressure` if the new operation
    /// itself is lower priority than everything already queued and nothing
    /// can be evicted to make room.
    pub fn enqueue(&self, op: QueuedOperation) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.len() >= self.capacity && !evict_lowest(&mut inner) {
            return Err(Error::backpressure("offline queue at capacity"));
        }
        inner.lane(op.priority).push_back(op);
        drop(inner);
        self.persist_locked()
    }

    fn persist_locked(&self) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let mut all: Vec<QueuedOperation> = Vec::with_capacity(inner.len());
        all.extend(inner.high.iter().cloned());
        all.extend(inner.normal.iter().cloned());
        all.extend(inner.low.iter().cloned());
        self.persistence.save_all(&all)
    }

    /// Removes operations older than `max_age_ms`, counting them as dropped.
    pub fn evict_expired(&self, now_ms: u64) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let cutoff = now_ms.saturating_sub(self.max_age_ms);
        let mut dropped = 0usize;
        for lane in [Priority::High, Priority::Normal, Priority::Low] {
            let before = inner.lane(lane).len();
            inner.lane(lane).retain(|op| op.queued_at_ms >= cutoff);
            dropped += before - inner.lane(lane).len();
        }
        inner.total_dropped += dropped as u64;
        dropped
    }

    /// Pops up to `drain_batch` operations in priority-then-FIFO order.
    pub fn drain_batch(&self) -> Vec<QueuedOperation> {
        let mut inner = self.inner.lock().unwrap();
        let mut out = Vec::with_capacity(self.drain_batch);
        for lane in [Priority::High, Priority::Normal, Priority::Low] {
            while out.len() < self.drain_batch {
                match inner.lane(lane).pop_front() {
                    Some(op) => out.push(op),
                    None => break,
                }
            }
            if out.len() >= self.drain_batch {
                break;
            }
        }
        out
    }

    /// Drains only the high-priority lane, leaving normal/low priority
    /// items queued. Used while the lifecycle adapter has signaled
    /// `defer_non_critical_requests`.
    pub fn drain_high_priority_batch(&self) -> Vec<QueuedOperation> {
        let mut inner = self.inner.lock().unwrap();
        let mut out = Vec::with_capacity(self.drain_batch);
        while out.len() < self.drain_batch {
            match inner.lane(Priority::High).pop_front() {
                Some(op) => out.push(op),
                None => break,
            }
        }
        out
    }

    /// Reports a successful delivery.
    pub fn report_success(&self) {
        self.inner.lock().unwrap().total_processed += 1;
    }

    /// Reports a failed delivery; re-queues at the tail of its lane unless
    /// retries are exhausted, in which case it is dropped.
    pub fn report_failure(&self, mut op: QueuedOperation, error: String) {
        op.attempts += 1;
        op.last_error = Some(error);
        let mut inner = self.inner.lock().unwrap();
        if op.attempts >= self.max_retries {
            inner.total_dropped += 1;
            inner.total_failed += 1;
        } else {
            inner.total_failed += 1;
            inner.lane(op.priority).push_back(op);
        }
    }

    pub fn stats(&self, now_ms: u64) -> QueueStats {
        let inner = self.inner.lock().unwrap();
        let oldest_age_ms = [&inner.high, &inner.normal, &inner.low]
            .into_iter()
            .filter_map(|lane| lane.front())
            .map(|op| now_ms.saturating_sub(op.queued_at_ms))
            .max();
        QueueStats {
            high_count: inner.high.len(),
            normal_count: inner.normal.len(),
            low_count: inner.low.len(),
            total_processed: inner.total_processed,
            total_failed: inner.total_failed,
            total_dropped: inner.total_dropped,
            oldest_age_ms,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Evicts the oldest item in the lowest non-empty priority lane. Returns
/// `true` if room was made.
fn evict_lowest(inner: &mut QueueInner) -> bool {
    for lane in [Priority::Low, Priority::Normal, Priority::High] {
        if inner.lane(lane).pop_front().is_some() {
            inner.total_dropped += 1;
            return true;
        }
    }
    false
}

pub fn new_operation_id() -> Uuid {
    Uuid::new_v4()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(priority: Priority, queued_at_ms: u64) -> QueuedOperation {
        QueuedOperation {
            operation_id: Uuid::new_v4(),
            operation_type: "SET".into(),
            priority,
            command_bytes: vec![1, 2, 3],
            queued_at_ms,
            attempts: 0,
            last_error: None,
        }
    }

    fn queue() -> OfflineQueue {
        OfflineQueue::new(Box::new(NullPersistence)).unwrap()
    }

    #[test]
    fn drains_high_before_normal_before_low() {
        let q = queue();
        q.enqueue(op(Priority::Low, 0)).unwrap();
        q.enqueue(op(Priority::Normal, 0)).unwrap();
        q.enqueue(op(Priority::High, 0)).unwrap();
        let batch = q.drain_batch();
        assert_eq!(batch[0].priority, Priority::High);
        assert_eq!(batch[1].priority, Priority::Normal);
        assert_eq!(batch[2].priority, Priority::Low);
    }

    #[test]
    fn fifo_within_a_priority_lane() {
        let q = queue();
        let first = op(Priority::Normal, 0);
        let second = op(Priority::Normal, 1);
        q.enqueue(first.clone()).unwrap();
        q.enqueue(second.clone()).unwrap();
        let batch = q.drain_batch();
        assert_eq!(batch[0].operation_id, first.operation_id);
        assert_eq!(batch[1].operation_id, second.operation_id);
    }

    #[test]
    fn overflow_evicts_lowest_priority_first() {
        let q = OfflineQueue::with_limits(Box::new(NullPersistence), 2, DEFAULT_MAX_AGE_MS, 10, 5).unwrap();
        q.enqueue(op(Priority::Low, 0)).unwrap();
        q.enqueue(op(Priority::Normal, 0)).unwrap();
        q.enqueue(op(Priority::High, 0)).unwrap();
        assert_eq!(q.len(), 2);
        let batch = q.drain_batch();
        assert!(batch.iter().all(|o| o.priority != Priority::Low));
    }

    #[test]
    fn retries_exhausted_drops_and_counts() {
        let q = OfflineQueue::with_limits(Box::new(NullPersistence), 10, DEFAULT_MAX_AGE_MS, 10, 2).unwrap();
        let queued = op(Priority::Normal, 0);
        q.enqueue(queued.clone()).unwrap();
        let popped = q.drain_batch().remove(0);
        q.report_failure(popped, "e1".into());
        let popped2 = q.drain_batch().remove(0);
        q.report_failure(popped2, "e2".into());
        assert!(q.is_empty());
        assert_eq!(q.stats(0).total_dropped, 1);
    }

    #[test]
    fn evict_expired_drops_aged_entries() {
        let q = queue();
        q.enqueue(op(Priority::Normal, 0)).unwrap();
        let dropped = q.evict_expired(DEFAULT_MAX_AGE_MS + 1);
        assert_eq!(dropped, 1);
        assert!(q.is_empty());
    }
}
