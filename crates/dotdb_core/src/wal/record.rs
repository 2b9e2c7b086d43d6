//! WAL record types and serialization.

use crate::error::{CoreError, CoreResult};
use crate::types::Lsn;
use dotdb_codec::{from_json_slice, to_json_vec, Value};

/// Magic bytes identifying a WAL record.
pub const WAL_MAGIC: [u8; 4] = *b"DWAL";

/// Fixed header size: magic (4) + lsn (8) + op (1) + path_len (4).
pub const HEADER_SIZE: usize = 17;

/// CRC trailer size.
pub const CRC_SIZE: usize = 4;

/// Operation encoded in a WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalOp {
    /// Replace the subtree at a path.
    Set = 0,
    /// Remove the subtree at a path.
    Delete = 1,
    /// Deduplicating array append; the payload is the item list.
    Push = 2,
    /// Numeric read-modify-write; the payload is the delta.
    AddNum = 3,
    /// Checkpoint marker; records at or before its LSN are reflected in
    /// the snapshot.
    Checkpoint = 4,
}

impl WalOp {
    /// Converts a byte to an operation.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Set),
            1 => Some(Self::Delete),
            2 => Some(Self::Push),
            3 => Some(Self::AddNum),
            4 => Some(Self::Checkpoint),
            _ => None,
        }
    }

    /// Converts the operation to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A single mutation in the write-ahead log.
#[derive(Debug, Clone, PartialEq)]
pub struct WalRecord {
    /// Log sequence number, assigned under the write lock.
    pub lsn: Lsn,
    /// The operation.
    pub op: WalOp,
    /// Target path in dotted form; empty for the root and for
    /// checkpoint markers.
    pub path: String,
    /// JSON payload for `Set`/`Push`/`AddNum`; `None` otherwise.
    pub payload: Option<Value>,
}

impl WalRecord {
    /// Creates a set record.
    pub fn set(lsn: Lsn, path: impl Into<String>, value: Value) -> Self {
        Self {
            lsn,
            op: WalOp::Set,
            path: path.into(),
            payload: Some(value),
        }
    }

    /// Creates a delete record.
    pub fn delete(lsn: Lsn, path: impl Into<String>) -> Self {
        Self {
            lsn,
            op: WalOp::Delete,
            path: path.into(),
            payload: None,
        }
    }

    /// Creates a push record carrying the full item list.
    pub fn push(lsn: Lsn, path: impl Into<String>, items: Vec<Value>) -> Self {
        Self {
            lsn,
            op: WalOp::Push,
            path: path.into(),
            payload: Some(Value::Array(items)),
        }
    }

    /// Creates an add-num record; `subtract` is a negative delta.
    pub fn add_num(lsn: Lsn, path: impl Into<String>, delta: f64) -> Self {
        Self {
            lsn,
            op: WalOp::AddNum,
            path: path.into(),
            payload: Some(Value::Number(delta)),
        }
    }

    /// Creates a checkpoint marker.
    #[must_use]
    pub fn checkpoint(lsn: Lsn) -> Self {
        Self {
            lsn,
            op: WalOp::Checkpoint,
            path: String::new(),
            payload: None,
        }
    }

    /// Serializes the record, little-endian throughout:
    ///
    /// ```text
    /// | magic (4) | lsn (8) | op (1) | path_len (4) | path (n)
    /// | payload_len (4) | payload (m) | crc32 (4) |
    /// ```
    ///
    /// The CRC covers all preceding bytes of the record.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let payload = match &self.payload {
            Some(value) => to_json_vec(value)?,
            None => Vec::new(),
        };
        let path = self.path.as_bytes();

        let mut buf =
            Vec::with_capacity(HEADER_SIZE + path.len() + 4 + payload.len() + CRC_SIZE);
        buf.extend_from_slice(&WAL_MAGIC);
        buf.extend_from_slice(&self.lsn.as_u64().to_le_bytes());
        buf.push(self.op.as_byte());
        buf.extend_from_slice(&(path.len() as u32).to_le_bytes());
        buf.extend_from_slice(path);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);

        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Deserializes a record body (path and payload bytes, after the
    /// fixed header has been read and the CRC verified).
    pub fn decode_body(lsn: Lsn, op: WalOp, path: &[u8], payload: &[u8]) -> CoreResult<Self> {
        let path = std::str::from_utf8(path)
            .map_err(|_| CoreError::corruption("WAL record path is not UTF-8"))?
            .to_owned();
        let payload = if payload.is_empty() {
            None
        } else {
            Some(from_json_slice(payload).map_err(|e| {
                CoreError::corruption(format!("WAL record payload is not valid JSON: {e}"))
            })?)
        };
        Ok(Self {
            lsn,
            op,
            path,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotdb_codec::from_json;

    fn roundtrip(record: &WalRecord) -> WalRecord {
        let bytes = record.encode().unwrap();

        // Manual re-parse mirroring the reader's framing.
        assert_eq!(&bytes[0..4], &WAL_MAGIC);
        let lsn = u64::from_le_bytes(bytes[4..12].try_into().unwrap());
        let op = WalOp::from_byte(bytes[12]).unwrap();
        let path_len = u32::from_le_bytes(bytes[13..17].try_into().unwrap()) as usize;
        let path = &bytes[17..17 + path_len];
        let payload_len_at = 17 + path_len;
        let payload_len =
            u32::from_le_bytes(bytes[payload_len_at..payload_len_at + 4].try_into().unwrap())
                as usize;
        let payload = &bytes[payload_len_at + 4..payload_len_at + 4 + payload_len];

        let crc_at = payload_len_at + 4 + payload_len;
        let stored_crc = u32::from_le_bytes(bytes[crc_at..].try_into().unwrap());
        assert_eq!(stored_crc, crc32fast::hash(&bytes[..crc_at]));

        WalRecord::decode_body(Lsn::new(lsn), op, path, payload).unwrap()
    }

    #[test]
    fn op_byte_roundtrip() {
        for op in [
            WalOp::Set,
            WalOp::Delete,
            WalOp::Push,
            WalOp::AddNum,
            WalOp::Checkpoint,
        ] {
            assert_eq!(WalOp::from_byte(op.as_byte()), Some(op));
        }
        assert_eq!(WalOp::from_byte(99), None);
    }

    #[test]
    fn set_record_roundtrip() {
        let record = WalRecord::set(
            Lsn::new(7),
            "users.alice",
            from_json("{\"name\":\"Alice\"}").unwrap(),
        );
        assert_eq!(roundtrip(&record), record);
    }

    #[test]
    fn delete_record_roundtrip() {
        let record = WalRecord::delete(Lsn::new(8), "users.alice");
        assert_eq!(roundtrip(&record), record);
    }

    #[test]
    fn push_record_roundtrip() {
        let record = WalRecord::push(
            Lsn::new(9),
            "tags",
            vec![Value::from("a"), Value::from("b")],
        );
        assert_eq!(roundtrip(&record), record);
    }

    #[test]
    fn add_num_record_roundtrip() {
        let record = WalRecord::add_num(Lsn::new(10), "counter", -3.5);
        assert_eq!(roundtrip(&record), record);
    }

    #[test]
    fn checkpoint_record_roundtrip() {
        let record = WalRecord::checkpoint(Lsn::new(11));
        let decoded = roundtrip(&record);
        assert_eq!(decoded, record);
        assert!(decoded.path.is_empty());
        assert!(decoded.payload.is_none());
    }

    #[test]
    fn empty_root_path_encodes() {
        let record = WalRecord::set(Lsn::new(1), "", Value::object());
        assert_eq!(roundtrip(&record), record);
    }
}
