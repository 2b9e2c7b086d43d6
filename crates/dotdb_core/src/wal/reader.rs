//! Streaming WAL replay.
//!
//! Recovery walks records sequentially and tolerates a torn tail: the
//! first record that truncates mid-record, fails its CRC, or carries an
//! unrecognized frame stops replay, and the WAL is truncated back to the
//! last good record boundary. Everything before that boundary is intact
//! by construction (append-only writes, CRC per record).

use crate::error::CoreResult;
use crate::wal::record::{WalOp, WalRecord, CRC_SIZE, HEADER_SIZE, WAL_MAGIC};
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::Path as StdPath;
use tracing::warn;

/// Outcome of scanning a WAL file.
#[derive(Debug)]
pub struct WalScan {
    /// Well-formed records in file order.
    pub records: Vec<WalRecord>,
    /// Byte length of the prefix containing only well-formed records.
    pub valid_len: u64,
    /// Whether a torn or corrupt tail was found past `valid_len`.
    pub truncated_tail: bool,
}

/// Reads every well-formed record from a WAL file.
///
/// Returns an empty scan if the file does not exist.
///
/// # Errors
///
/// Returns an error only for I/O failures while reading; malformed
/// content is reported through `truncated_tail`, not as an error.
pub fn scan(path: &StdPath) -> CoreResult<WalScan> {
    if !path.exists() {
        return Ok(WalScan {
            records: Vec::new(),
            valid_len: 0,
            truncated_tail: false,
        });
    }

    let mut file = File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let mut records = Vec::new();
    let mut offset = 0usize;

    loop {
        match parse_record(&buf[offset..]) {
            Parsed::Record { record, consumed } => {
                records.push(record);
                offset += consumed;
            }
            Parsed::End => break,
            Parsed::Corrupt { reason } => {
                warn!(
                    offset,
                    reason, "WAL tail is torn or corrupt; truncating to last good record"
                );
                return Ok(WalScan {
                    records,
                    valid_len: offset as u64,
                    truncated_tail: true,
                });
            }
        }
    }

    Ok(WalScan {
        records,
        valid_len: offset as u64,
        truncated_tail: false,
    })
}

/// Truncates the WAL file to `valid_len` bytes.
pub fn truncate_to(path: &StdPath, valid_len: u64) -> CoreResult<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(valid_len)?;
    file.sync_all()?;
    Ok(())
}

enum Parsed {
    Record { record: WalRecord, consumed: usize },
    End,
    Corrupt { reason: &'static str },
}

fn read_u32_le(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64_le(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn parse_record(buf: &[u8]) -> Parsed {
    if buf.is_empty() {
        return Parsed::End;
    }
    if buf.len() < HEADER_SIZE {
        return Parsed::Corrupt {
            reason: "truncated header",
        };
    }

    if buf[0..4] != WAL_MAGIC {
        return Parsed::Corrupt {
            reason: "bad magic",
        };
    }

    let lsn = read_u64_le(buf, 4);
    let Some(op) = WalOp::from_byte(buf[12]) else {
        return Parsed::Corrupt {
            reason: "unknown op",
        };
    };
    let path_len = read_u32_le(buf, 13) as usize;

    let payload_len_at = HEADER_SIZE + path_len;
    if buf.len() < payload_len_at + 4 {
        return Parsed::Corrupt {
            reason: "truncated path",
        };
    }
    let payload_len = read_u32_le(buf, payload_len_at) as usize;

    let crc_at = payload_len_at + 4 + payload_len;
    if buf.len() < crc_at + CRC_SIZE {
        return Parsed::Corrupt {
            reason: "truncated payload",
        };
    }

    let stored_crc = read_u32_le(buf, crc_at);
    if crc32fast::hash(&buf[..crc_at]) != stored_crc {
        return Parsed::Corrupt {
            reason: "crc mismatch",
        };
    }

    let path = &buf[HEADER_SIZE..payload_len_at];
    let payload = &buf[payload_len_at + 4..crc_at];
    match WalRecord::decode_body(crate::types::Lsn::new(lsn), op, path, payload) {
        Ok(record) => Parsed::Record {
            record,
            consumed: crc_at + CRC_SIZE,
        },
        Err(_) => Parsed::Corrupt {
            reason: "undecodable body",
        },
    }
}
