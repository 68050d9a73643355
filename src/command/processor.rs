//! Command Processor implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{
    Entry, Operation, Response, ResponseValue, MAX_KEY_BYTES, MAX_VALUE_BYTES,
};
use crate::replication::Publisher;
use crate::storage::StorageEngine;

use super::IdempotencyCache;

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::validation("key must not be empty"));
    }
    if key.len() > MAX_KEY_BYTES {
        return Err(Error::validation(format!("key exceeds {} bytes", MAX_KEY_BYTES)));
    }
    Ok(())
}

fn validate_value(value: &str) -> Result<()> {
    if value.len() > MAX_VALUE_BYTES {
        return Err(Error::validation(format!("value exceeds {} bytes", MAX_VALUE_BYTES)));
    }
    Ok(())
}

/// Executes validated key-value operations against storage, publishing
/// each accepted mutation through the Publisher and deduping repeated
/// command ids via the idempotency cache. One processor instance is shared
/// across every inbound command for a node.
pub struct CommandProcessor {
    storage: Arc<dyn StorageEngine>,
    publisher: Arc<Publisher>,
    idempotency: IdempotencyCache,
    node_id: String,
}

impl CommandProcessor {
    pub fn new(storage: Arc<dyn StorageEngine>, publisher: Arc<Publisher>, node_id: String) -> Self {
        Self { storage, publisher, idempotency: IdempotencyCache::new(), node_id }
    }

    /// Resolves a caller-supplied or freshly-assigned command id, consulting
    /// the idempotency cache first. Returns `Some(cached_response)` when the
    /// id has already been processed within TTL.
    fn resolve_id(&self, id: Option<Uuid>) -> (Uuid, Option<Response>) {
        let id = id.unwrap_or_else(Uuid::new_v4);
        let cached = self.idempotency.get(id, now_ms());
        (id, cached)
    }

    fn remember(&self, id: Uuid, response: &Response) {
        self.idempotency.insert(id, response.clone(), now_ms());
    }

    async fn publish(&self, op: Operation, entry: &Entry) -> Result<()> {
        self.publisher.publish_mutation(op, entry).await
    }

    pub async fn set(&self, id: Option<Uuid>, key: String, value: String) -> Result<Response> {
        let (id, cached) = self.resolve_id(id);
        if let Some(resp) = cached {
            return Ok(resp);
        }
        let response = match self.set_inner(&key, &value).await {
            Ok(()) => Response::ok(id, Some(ResponseValue::Str(value))),
            Err(e) => Response::err(id, &e),
        };
        self.remember(id, &response);
        Ok(response)
    }

    async fn set_inner(&self, key: &str, value: &str) -> Result<()> {
        validate_key(key)?;
        validate_value(value)?;
        let entry = Entry::live(key.to_string(), value.to_string(), now_ms(), self.node_id.clone(), self.publisher.next_seq());
        self.storage.put(entry.clone())?;
        self.publish(Operation::Set, &entry).await
    }

    pub async fn get(&self, id: Option<Uuid>, key: String) -> Result<Response> {
        let (id, cached) = self.resolve_id(id);
        if let Some(resp) = cached {
            return Ok(resp);
        }
        let response = match self.get_inner(&key) {
            Ok(Some(value)) => Response::ok(id, Some(ResponseValue::Str(value))),
            Ok(None) => Response::ok(id, None),
            Err(e) => Response::err(id, &e),
        };
        self.remember(id, &response);
        Ok(response)
    }

    fn get_inner(&self, key: &str) -> Result<Option<String>> {
        validate_key(key)?;
        Ok(self.storage.get(key)?.and_then(|e| e.value))
    }

    pub async fn delete(&self, id: Option<Uuid>, key: String) -> Result<Response> {
        let (id, cached) = self.resolve_id(id);
        if let Some(resp) = cached {
            return Ok(resp);
        }
        let response = match self.delete_inner(&key).await {
            Ok(()) => Response::ok(id, None),
            Err(e) => Response::err(id, &e),
        };
        self.remember(id, &response);
        Ok(response)
    }

    async fn delete_inner(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let entry = Entry::tombstone(key.to_string(), now_ms(), self.node_id.clone(), self.publisher.next_seq());
        self.storage.put(entry.clone())?;
        self.publish(Operation::Del, &entry).await
    }

    pub async fn increment(&self, id: Option<Uuid>, key: String, amount: Option<i64>) -> Result<Response> {
        self.apply_numeric(id, key, amount.unwrap_or(1), Operation::Incr).await
    }

    pub async fn decrement(&self, id: Option<Uuid>, key: String, amount: Option<i64>) -> Result<Response> {
        self.apply_numeric(id, key, -amount.unwrap_or(1), Operation::Decr).await
    }

    async fn apply_numeric(&self, id: Option<Uuid>, key: String, delta: i64, op: Operation) -> Result<Response> {
        let (id, cached) = self.resolve_id(id);
        if let Some(resp) = cached {
            return Ok(resp);
        }
        let response = match self.apply_numeric_inner(&key, delta, op).await {
            Ok(new_value) => Response::ok(id, Some(ResponseValue::Int(new_value))),
            Err(e) => Response::err(id, &e),
        };
        self.remember(id, &response);
        Ok(response)
    }

    async fn apply_numeric_inner(&self, key: &str, delta: i64, op: Operation) -> Result<i64> {
        validate_key(key)?;
        let current: i64 = match self.storage.get(key)?.and_then(|e| e.value) {
            None => 0,
            Some(raw) => raw
                .parse()
                .map_err(|_| Error::type_mismatch(format!("value at {key} is not numeric")))?,
        };
        let new_value = current
            .checked_add(delta)
            .ok_or_else(|| Error::overflow(format!("{key} increment/decrement would overflow i64")))?;
        let entry = Entry::live(key.to_string(), new_value.to_string(), now_ms(), self.node_id.clone(), self.publisher.next_seq());
        self.storage.put(entry.clone())?;
        self.publish(op, &entry).await?;
        Ok(new_value)
    }

    pub async fn append(&self, id: Option<Uuid>, key: String, value: String) -> Result<Response> {
        self.apply_string_op(id, key, value, Operation::Append).await
    }

    pub async fn prepend(&self, id: Option<Uuid>, key: String, value: String) -> Result<Response> {
        self.apply_string_op(id, key, value, Operation::Prepend).await
    }

    async fn apply_string_op(
        &self,
        id: Option<Uuid>,
        key: String,
        value: String,
        op: Operation,
    ) -> Result<Response> {
        let (id, cached) = self.resolve_id(id);
        if let Some(resp) = cached {
            return Ok(resp);
        }
        let response = match self.apply_string_op_inner(&key, &value, op).await {
            Ok(new_value) => Response::ok(id, Some(ResponseValue::Str(new_value))),
            Err(e) => Response::err(id, &e),
        };
        self.remember(id, &response);
        Ok(response)
    }

    async fn apply_string_op_inner(&self, key: &str, value: &str, op: Operation) -> Result<String> {
        validate_key(key)?;
        let current = self.storage.get(key)?.and_then(|e| e.value).unwrap_or_default();
        let new_value = match op {
            Operation::Append => format!("{current}{value}"),
            Operation::Prepend => format!("{value}{current}"),
            _ => unreachable!("apply_string_op_inner only called with Append/Prepend"),
        };
        validate_value(&new_value)?;
        let entry = Entry::live(key.to_string(), new_value.clone(), now_ms(), self.node_id.clone(), self.publisher.next_seq());
        self.storage.put(entry.clone())?;
        self.publish(op, &entry).await?;
        Ok(new_value)
    }

    /// Bulk read: per-key success/failure map; the call itself succeeds if
    /// well-formed, individual key errors are reported in `value`.
    pub async fn mget(&self, id: Option<Uuid>, keys: Vec<String>) -> Result<Response> {
        let (id, cached) = self.resolve_id(id);
        if let Some(resp) = cached {
            return Ok(resp);
        }
        let mut out: HashMap<String, Option<String>> = HashMap::new();
        for key in keys {
            let value = validate_key(&key).ok().and_then(|_| {
                self.storage.get(&key).ok().flatten().and_then(|e| e.value)
            });
            out.insert(key, value);
        }
        let response = Response::ok(id, Some(ResponseValue::Map(out)));
        self.remember(id, &response);
        Ok(response)
    }

    /// Bulk write: not transactional across keys. Reports per-key status in
    /// `value`; keys that fail validation or publish are surfaced as
    /// `None`.
    pub async fn mset(&self, id: Option<Uuid>, kvs: HashMap<String, String>) -> Result<Response> {
        let (id, cached) = self.resolve_id(id);
        if let Some(resp) = cached {
            return Ok(resp);
        }
        let mut out: HashMap<String, Option<String>> = HashMap::new();
        for (key, value) in kvs {
            let result = self.set_inner(&key, &value).await;
            out.insert(key, result.ok().map(|_| value));
        }
        let response = Response::ok(id, Some(ResponseValue::Map(out)));
        self.remember(id, &response);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline_queue::{NullPersistence, OfflineQueue};
    use crate::storage::MemoryEngine;
    use crate::topic::TopicScheme;
    use crate::transport::Transport;

    fn processor() -> CommandProcessor {
        let storage: Arc<dyn StorageEngine> = Arc::new(MemoryEngine::new());
        let (_transport, handle, _rx) = Transport::new(
            "client-a", "127.0.0.1", 1883, "p/responses/client-a", vec![], 60, None,
        );
        let topics = TopicScheme::new("p", "client-a").unwrap();
        let queue = Arc::new(OfflineQueue::new(Box::new(NullPersistence)).unwrap());
        let publisher = Arc::new(Publisher::new("node-a".into(), handle, topics, queue));
        CommandProcessor::new(storage, publisher, "node-a".into())
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let p = processor();
        p.set(None, "k".into(), "v".into()).await.unwrap();
        let resp = p.get(None, "k".into()).await.unwrap();
        match resp.value {
            Some(ResponseValue::Str(s)) => assert_eq!(s, "v"),
            other => panic!("unexpected response value: {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_on_missing_key_is_ok_with_absent_value() {
        let p = processor();
        let resp = p.get(None, "missing".into()).await.unwrap();
        assert_eq!(resp.status, crate::model::ResponseStatus::Ok);
        assert!(resp.value.is_none());
        assert!(resp.error.is_none());
    }

    #[tokio::test]
    async fn repeated_command_id_is_not_reapplied() {
        let p = processor();
        let id = Uuid::new_v4();
        p.increment(Some(id), "counter".into(), Some(5)).await.unwrap();
        let second = p.increment(Some(id), "counter".into(), Some(5)).await.unwrap();
        match second.value {
            Some(ResponseValue::Int(n)) => assert_eq!(n, 5),
            other => panic!("unexpected response value: {other:?}"),
        }
    }

    #[tokio::test]
    async fn increment_on_absent_key_starts_at_zero() {
        let p = processor();
        let resp = p.increment(None, "counter".into(), Some(3)).await.unwrap();
        match resp.value {
            Some(ResponseValue::Int(n)) => assert_eq!(n, 3),
            other => panic!("unexpected response value: {other:?}"),
        }
    }

    #[tokio::test]
    async fn increment_on_non_numeric_value_is_type_mismatch() {
        let p = processor();
        p.set(None, "k".into(), "not-a-number".into()).await.unwrap();
        let resp = p.increment(None, "k".into(), Some(1)).await.unwrap();
        assert_eq!(resp.error.unwrap().code, "TYPE_MISMATCH");
    }

    #[tokio::test]
    async fn increment_overflow_is_reported() {
        let p = processor();
        p.set(None, "k".into(), i64::MAX.to_string()).await.unwrap();
        let resp = p.increment(None, "k".into(), Some(1)).await.unwrap();
        assert_eq!(resp.error.unwrap().code, "OVERFLOW_ARITHMETIC");
    }

    #[tokio::test]
    async fn append_and_prepend_compose() {
        let p = processor();
        p.set(None, "k".into(), "b".into()).await.unwrap();
        p.append(None, "k".into(), "c".into()).await.unwrap();
        let resp = p.prepend(None, "k".into(), "a".into()).await.unwrap();
        match resp.value {
            Some(ResponseValue::Str(s)) => assert_eq!(s, "abc"),
            other => panic!("unexpected response value: {other:?}"),
        }
    }

    #[tokio::test]
    async fn mget_reports_missing_keys_as_none() {
        let p = processor();
        p.set(None, "k1".into(), "v1".into()).await.unwrap();
        let resp = p.mget(None, vec!["k1".into(), "missing".into()]).await.unwrap();
        match resp.value.unwrap() {
            ResponseValue::Map(m) => {
                assert_eq!(m.get("k1").unwrap().as_deref(), Some("v1"));
                assert_eq!(m.get("missing").unwrap(), &None);
            }
            other => panic!("unexpected response value: {other:?}"),
        }
    }

    #[tokio::test]
    async fn mset_applies_every_key_independently() {
        let p = processor();
        let mut kvs = HashMap::new();
        kvs.insert("a".to_string(), "1".to_string());
        kvs.insert("b".to_string(), "2".to_string());
        p.mset(None, kvs).await.unwrap();
        assert_eq!(p.get(None, "a".into()).await.unwrap().value.is_some(), true);
        assert_eq!(p.get(None, "b".into()).await.unwrap().value.is_some(), true);
    }

    #[tokio::test]
    async fn empty_key_is_a_validation_error() {
        let p = processor();
        let resp = p.set(None, String::new(), "v".into()).await.unwrap();
        assert_eq!(resp.error.unwrap().code, "VALIDATION");
    }
}
