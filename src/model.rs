//! Core data model shared by storage, replication, and the command
//! processor: `Entry`, `ReplicationEvent`, the JSON `Command`/`Response`
//! envelope, `QueuedOperation`, `ConnectionState`, and `PeerWatermark`.
//!
//! Field and size limits match the wire-format boundary constants below.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Maximum UTF-8 byte length of a key.
pub const MAX_KEY_BYTES: usize = 256;
/// Maximum UTF-8 byte length of a value.
pub const MAX_VALUE_BYTES: usize = 262_144;
/// Maximum size of a JSON command payload.
pub const MAX_COMMAND_BYTES: usize = 524_288;
/// Maximum size of an encoded replication event.
pub const MAX_REPLICATION_BYTES: usize = 307_200;

/// A single stored version of a key: a value or a tombstone, stamped with
/// the `(timestamp_ms, node_id)` pair used for LWW ordering and the
/// `(node_id, seq)` pair used for dedup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    /// `None` when `is_tombstone` is true.
    pub value: Option<String>,
    pub timestamp_ms: u64,
    pub node_id: String,
    pub seq: u64,
    pub is_tombstone: bool,
}

impl Entry {
    pub fn live(key: String, value: String, timestamp_ms: u64, node_id: String, seq: u64) -> Self {
        Self { key, value: Some(value), timestamp_ms, node_id, seq, is_tombstone: false }
    }

    pub fn tombstone(key: String, timestamp_ms: u64, node_id: String, seq: u64) -> Self {
        Self { key, value: None, timestamp_ms, node_id, seq, is_tombstone: true }
    }

    /// The `(timestamp_ms, node_id)` ordering key used for LWW comparisons.
    /// `node_id` compares lexicographically on its bytes.
    pub fn version(&self) -> (u64, &str) {
        (self.timestamp_ms, self.node_id.as_str())
    }

    /// `(node_id, seq)` dedup key.
    pub fn dedup_key(&self) -> (String, u64) {
        (self.node_id.clone(), self.seq)
    }
}

/// The operation an accepted mutation represents, carried in the
/// replication envelope. INCR/DECR/APPEND/PREPEND carry their post-image
/// value rather than a delta, so on the
/// wire they are indistinguishable in *effect* from SET — the tag is kept
/// only so subscribers and statistics can report what kind of write
/// produced a given event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Set,
    Del,
    Incr,
    Decr,
    Append,
    Prepend,
}

/// Self-contained replication envelope for one accepted local mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationEvent {
    pub op: Operation,
    pub key: String,
    /// Post-image value; `None` for deletes.
    pub value: Option<String>,
    pub tombstone: bool,
    pub timestamp_ms: u64,
    pub node_id: String,
    pub seq: u64,
}

impl ReplicationEvent {
    pub fn into_entry(self) -> Entry {
        Entry {
            key: self.key,
            value: self.value,
            timestamp_ms: self.timestamp_ms,
            node_id: self.node_id,
            seq: self.seq,
            is_tombstone: self.tombstone,
        }
    }

    pub fn from_entry(op: Operation, entry: &Entry) -> Self {
        Self {
            op,
            key: entry.key.clone(),
            value: entry.value.clone(),
            tombstone: entry.is_tombstone,
            timestamp_ms: entry.timestamp_ms,
            node_id: entry.node_id.clone(),
            seq: entry.seq,
        }
    }
}

/// Operation kind carried by the JSON command envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandOp {
    #[serde(rename = "SET")]
    Set,
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "INCR")]
    Incr,
    #[serde(rename = "DECR")]
    Decr,
    #[serde(rename = "APPEND")]
    Append,
    #[serde(rename = "PREPEND")]
    Prepend,
    #[serde(rename = "MGET")]
    MGet,
    #[serde(rename = "MSET")]
    MSet,
}

/// Inbound command as received on the `{prefix}/commands/{clientId}` topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Caller-supplied correlation id; the Command Processor assigns a
    /// fresh UUIDv4 when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub op: CommandOp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kvs: Option<HashMap<String, String>>,
}

/// Status discriminant for `Response`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ERROR")]
    Error,
}

/// Structured error payload within a `Response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: String,
    pub message: String,
}

/// The value carried back to the caller for a successful operation. Kept as
/// a small enum rather than `serde_json::Value` so single vs. bulk results
/// serialize predictably.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseValue {
    Str(String),
    Int(i64),
    Map(HashMap<String, Option<String>>),
}

/// Response published on `{prefix}/responses/{clientId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: Uuid,
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<ResponseValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    pub fn ok(id: Uuid, value: Option<ResponseValue>) -> Self {
        Self { id, status: ResponseStatus::Ok, value, error: None }
    }

    pub fn err(id: Uuid, err: &crate::error::Error) -> Self {
        Self {
            id,
            status: ResponseStatus::Error,
            value: None,
            error: Some(ResponseError { code: err.code().to_string(), message: err.to_string() }),
        }
    }
}

/// Relative scheduling priority for offline-queued operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// An operation buffered while the transport is not `connected`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub operation_id: Uuid,
    pub operation_type: String,
    pub priority: Priority,
    pub command_bytes: Vec<u8>,
    pub queued_at_ms: u64,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// MQTT transport connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Suspended,
}

/// Highest contiguous `seq` observed from a peer node.
#[derive(Debug, Clone, Default)]
pub struct PeerWatermark {
    pub node_id: String,
    pub contiguous_seq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_version_orders_by_timestamp_then_node_id() {
        let a = Entry::live("k".into(), "v1".into(), 1000, "A".into(), 1);
        let b = Entry::live("k".into(), "v2".into(), 1000, "B".into(), 1);
        assert!(b.version() > a.version());
    }

    #[test]
    fn command_json_round_trips_minimal_fields() {
        let cmd = Command {
            id: Some(Uuid::new_v4()),
            op: CommandOp::Get,
            key: Some("k".into()),
            keys: None,
            value: None,
            amount: None,
            kvs: None,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(!json.contains("\"keys\""));
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, cmd.id);
    }

    #[test]
    fn response_id_matches_command_id() {
        let id = Uuid::new_v4();
        let resp = Response::ok(id, Some(ResponseValue::Str("v".into())));
        assert_eq!(resp.id, id);
    }
}
