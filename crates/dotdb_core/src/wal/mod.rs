//! Write-ahead log.
//!
//! All mutations are logged before being acknowledged; on crash the log
//! is replayed on top of the last snapshot. Records carry a
//! monotonically increasing LSN and a per-record CRC32.
//!
//! ## Record format
//!
//! ```text
//! | magic (4) | lsn (8) | op (1) | path_len (4) | path (n)
//! | payload_len (4) | payload (m) | crc32 (4) |
//! ```
//!
//! All integers are little-endian; the payload is UTF-8 JSON; the CRC
//! covers every preceding byte of the record.
//!
//! ## Recovery policy
//!
//! A torn tail (crash mid-write) and a CRC mismatch both stop replay at
//! the last good record boundary; the file is truncated there and the
//! event is logged. Records with an LSN at or below the snapshot's
//! `checkpoint_lsn` are skipped.
//!
//! ## Durability
//!
//! The flusher thread groups appends into a single write + fsync per
//! batch. `sync` durability blocks the writer on a per-record ack;
//! `batched` and `lazy` only differ in flush cadence; `none` means no
//! WAL at all.

mod reader;
mod record;
mod writer;

pub use reader::{scan, truncate_to, WalScan};
pub use record::{WalOp, WalRecord, CRC_SIZE, HEADER_SIZE, WAL_MAGIC};
pub use writer::{FlushPolicy, WalWriter};
