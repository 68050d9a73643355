//! Deterministic binary codec for `ReplicationEvent`.
//!
//! Bincode's representation is an implementation detail of the library
//! version, and CBOR/JSON both carry self-describing overhead the
//! replication topic's size budget can't afford. This module hand-rolls a
//! small fixed-tag format instead: one byte op tag, then length-prefixed
//! fields in a fixed order, no floats anywhere.

use crate::error::Error;
use crate::model::{Operation, ReplicationEvent, MAX_REPLICATION_BYTES};

const TAG_SET: u8 = 1;
const TAG_DEL: u8 = 2;
const TAG_INCR: u8 = 3;
const TAG_DECR: u8 = 4;
const TAG_APPEND: u8 = 5;
const TAG_PREPEND: u8 = 6;

fn op_tag(op: Operation) -> u8 {
    match op {
        Operation::Set => TAG_SET,
        Operation::Del => TAG_DEL,
        Operation::Incr => TAG_INCR,
        Operation::Decr => TAG_DECR,
        Operation::Append => TAG_APPEND,
        Operation::Prepend => TAG_PREPEND,
    }
}

fn tag_op(tag: u8) -> Option<Operation> {
    match tag {
        TAG_SET => Some(Operation::Set),
        TAG_DEL => Some(Operation::Del),
        TAG_INCR => Some(Operation::Incr),
        TAG_DECR => Some(Operation::Decr),
        TAG_APPEND => Some(Operation::Append),
        TAG_PREPEND => Some(Operation::Prepend),
        _ => None,
    }
}

fn push_str16(buf: &mut Vec<u8>, s: &str) -> Result<(), Error> {
    let bytes = s.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(Error::codec(format!("string field too long: {} bytes", bytes.len())));
    }
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

fn read_str16(buf: &[u8], pos: &mut usize) -> Result<String, Error> {
    let len = read_u16(buf, pos)? as usize;
    if *pos + len > buf.len() {
        return Err(Error::codec("truncated string field"));
    }
    let s = std::str::from_utf8(&buf[*pos..*pos + len])
        .map_err(|_| Error::codec("non-UTF-8 string field"))?
        .to_string();
    *pos += len;
    Ok(s)
}

fn read_u16(buf: &[u8], pos: &mut usize) -> Result<u16, Error> {
    if *pos + 2 > buf.len() {
        return Err(Error::codec("truncated input"));
    }
    let v = u16::from_be_bytes([buf[*pos], buf[*pos + 1]]);
    *pos += 2;
    Ok(v)
}

fn read_u8(buf: &[u8], pos: &mut usize) -> Result<u8, Error> {
    if *pos >= buf.len() {
        return Err(Error::codec("truncated input"));
    }
    let v = buf[*pos];
    *pos += 1;
    Ok(v)
}

fn read_u64(buf: &[u8], pos: &mut usize) -> Result<u64, Error> {
    if *pos + 8 > buf.len() {
        return Err(Error::codec("truncated input"));
    }
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&buf[*pos..*pos + 8]);
    *pos += 8;
    Ok(u64::from_be_bytes(arr))
}

/// Encode a `ReplicationEvent` into the canonical binary wire format.
///
/// Field order is fixed: op tag, key, value (presence flag + bytes),
/// tombstone flag, timestamp, node_id, seq. Returns `ErrorKind::Codec` if
/// the encoded size would exceed the 307,200-byte ceiling.
pub fn encode(event: &ReplicationEvent) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::with_capacity(64 + event.key.len() + event.value.as_ref().map_or(0, |v| v.len()));
    buf.push(op_tag(event.op));
    push_str16(&mut buf, &event.key)?;

    match &event.value {
        Some(v) => {
            buf.push(1);
            let bytes = v.as_bytes();
            if bytes.len() > u32::MAX as usize {
                return Err(Error::codec("value field too long"));
            }
            buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            buf.extend_from_slice(bytes);
        }
        None => buf.push(0),
    }

    buf.push(if event.tombstone { 1 } else { 0 });
    buf.extend_from_slice(&event.timestamp_ms.to_be_bytes());
    push_str16(&mut buf, &event.node_id)?;
    buf.extend_from_slice(&event.seq.to_be_bytes());

    if buf.len() > MAX_REPLICATION_BYTES {
        return Err(Error::codec(format!(
            "encoded replication event is {} bytes, exceeds {} byte ceiling",
            buf.len(),
            MAX_REPLICATION_BYTES
        )));
    }
    Ok(buf)
}

/// Decode a `ReplicationEvent` from its canonical binary wire format.
///
/// Fails with `ErrorKind::Codec` on: unknown op tag, truncated input,
/// oversize input, non-UTF-8 strings, or trailing bytes after the last
/// field (this format has no repeatable fields, so trailing bytes are the
/// signal of a malformed/duplicated record).
pub fn decode(buf: &[u8]) -> Result<ReplicationEvent, Error> {
    if buf.len() > MAX_REPLICATION_BYTES {
        return Err(Error::codec(format!(
            "input is {} bytes, exceeds {} byte ceiling",
            buf.len(),
            MAX_REPLICATION_BYTES
        )));
    }
    let mut pos = 0usize;
    let tag = read_u8(buf, &mut pos)?;
    let op = tag_op(tag).ok_or_else(|| Error::codec(format!("unknown op tag {}", tag)))?;
    let key = read_str16(buf, &mut pos)?;

    let has_value = read_u8(buf, &mut pos)?;
    let value = match has_value {
        0 => None,
        1 => {
            if pos + 4 > buf.len() {
                return Err(Error::codec("truncated value length"));
            }
            let mut len_arr = [0u8; 4];
            len_arr.copy_from_slice(&buf[pos..pos + 4]);
            pos += 4;
            let len = u32::from_be_bytes(len_arr) as usize;
            if pos + len > buf.len() {
                return Err(Error::codec("truncated value field"));
            }
            let s = std::str::from_utf8(&buf[pos..pos + len])
                .map_err(|_| Error::codec("non-UTF-8 value field"))?
                .to_string();
            pos += len;
            Some(s)
        }
        other => return Err(Error::codec(format!("invalid value presence flag {}", other))),
    };

    let tombstone_flag = read_u8(buf, &mut pos)?;
    let tombstone = match tombstone_flag {
        0 => false,
        1 => true,
        other => return Err(Error::codec(format!("invalid tombstone flag {}", other))),
    };

    let timestamp_ms = read_u64(buf, &mut pos)?;
    let node_id = read_str16(buf, &mut pos)?;
    let seq = read_u64(buf, &mut pos)?;

    if pos != buf.len() {
        return Err(Error::codec("trailing bytes after decoded record"));
    }

    Ok(ReplicationEvent { op, key, value, tombstone, timestamp_ms, node_id, seq })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(op: Operation, value: Option<&str>, tombstone: bool) -> ReplicationEvent {
        ReplicationEvent {
            op,
            key: "user:123".into(),
            value: value.map(String::from),
            tombstone,
            timestamp_ms: 1_700_000_000_000,
            node_id: "nodeA".into(),
            seq: 42,
        }
    }

    #[test]
    fn round_trip_set() {
        let e = sample(Operation::Set, Some("hello"), false);
        let bytes = encode(&e).unwrap();
        assert_eq!(decode(&bytes).unwrap(), e);
    }

    #[test]
    fn round_trip_delete_has_no_value() {
        let e = sample(Operation::Del, None, true);
        let bytes = encode(&e).unwrap();
        let back = decode(&bytes).unwrap();
        assert_eq!(back, e);
        assert!(back.value.is_none());
    }

    #[test]
    fn round_trip_all_op_kinds() {
        for op in [
            Operation::Set,
            Operation::Del,
            Operation::Incr,
            Operation::Decr,
            Operation::Append,
            Operation::Prepend,
        ] {
            let e = sample(op, Some("42"), false);
            assert_eq!(decode(&encode(&e).unwrap()).unwrap(), e);
        }
    }

    #[test]
    fn unknown_tag_is_codec_error() {
        let mut bytes = encode(&sample(Operation::Set, Some("x"), false)).unwrap();
        bytes[0] = 0xFF;
        let err = decode(&bytes).unwrap_err();
        assert_eq!(err.code(), "CODEC");
    }

    #[test]
    fn truncated_input_is_codec_error() {
        let bytes = encode(&sample(Operation::Set, Some("x"), false)).unwrap();
        let truncated = &bytes[..bytes.len() - 3];
        assert!(decode(truncated).is_err());
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = encode(&sample(Operation::Set, Some("x"), false)).unwrap();
        bytes.push(0);
        let err = decode(&bytes).unwrap_err();
        assert_eq!(err.code(), "CODEC");
    }

    #[test]
    fn non_utf8_key_is_rejected() {
        // Hand-build a buffer with an invalid UTF-8 key.
        let mut buf = vec![TAG_SET];
        let bad = [0xFF, 0xFE];
        buf.extend_from_slice(&(bad.len() as u16).to_be_bytes());
        buf.extend_from_slice(&bad);
        let err = decode(&buf).unwrap_err();
        assert_eq!(err.code(), "CODEC");
    }

    #[test]
    fn oversize_payload_is_rejected() {
        let huge_value = "x".repeat(MAX_REPLICATION_BYTES);
        let e = sample(Operation::Set, Some(&huge_value), false);
        let err = encode(&e).unwrap_err();
        assert_eq!(err.code(), "CODEC");
    }

    #[test]
    fn boundary_size_307200_encodes_ok() {
        // key(2+8) + value flag/len(5) + tombstone(1) + ts(8) + node(2+5) + seq(8) = 39 overhead
        let overhead = 1 + (2 + 8) + 5 + 1 + 8 + (2 + 5) + 8;
        let value_len = MAX_REPLICATION_BYTES - overhead;
        let value = "x".repeat(value_len);
        let e = sample(Operation::Set, Some(&value), false);
        let bytes = encode(&e).unwrap();
        assert_eq!(bytes.len(), MAX_REPLICATION_BYTES);
        assert_eq!(decode(&bytes).unwrap(), e);
    }
}
