//! Group-commit WAL writer.
//!
//! A background flusher thread owns the log file. Appends are handed to
//! it over a channel and batched: the batch is written with one
//! `write_all` and made durable with one fsync, either when
//! `batch_size` records accumulate or when `flush_interval` elapses,
//! whichever comes first. `sync` durability threads an ack through the
//! channel so the caller blocks until its record is on disk.

use crate::error::{CoreError, CoreResult};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path as StdPath;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Capacity of the command channel between writers and the flusher.
const CHANNEL_CAPACITY: usize = 100_000;

/// How long `sync()` waits for the flusher before giving up.
const SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// Flush policy for the background thread.
#[derive(Debug, Clone, Copy)]
pub struct FlushPolicy {
    /// Maximum records to batch before an fsync.
    pub batch_size: usize,
    /// Maximum time between fsyncs.
    pub flush_interval: Duration,
}

enum Command {
    Append {
        bytes: Vec<u8>,
        lsn: u64,
        ack: Option<Sender<io::Result<()>>>,
    },
    Sync {
        ack: Sender<io::Result<()>>,
    },
    /// Rewrite the log as `marker` followed by the bytes currently at
    /// and past `cut`. Used by checkpoint.
    Rewrite {
        marker: Vec<u8>,
        cut: u64,
        ack: Sender<io::Result<()>>,
    },
    Shutdown,
}

/// Handle to the group-commit WAL.
pub struct WalWriter {
    tx: Sender<Command>,
    /// Highest LSN whose record has been fsynced.
    durable_lsn: Arc<AtomicU64>,
    /// Total bytes queued for the file (append order equals queue order).
    queued_len: Arc<AtomicU64>,
    /// First I/O error hit by the flusher, surfaced on the next call.
    poisoned: Arc<Mutex<Option<String>>>,
    handle: Option<JoinHandle<()>>,
}

impl WalWriter {
    /// Opens the WAL file and starts the flusher thread.
    ///
    /// `existing_len` is the file length after recovery truncation and
    /// `recovered_lsn` the highest LSN already in the file (both durable
    /// by definition); new appends land after them.
    pub fn open(
        path: &StdPath,
        existing_len: u64,
        recovered_lsn: u64,
        policy: FlushPolicy,
    ) -> CoreResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.seek(SeekFrom::Start(existing_len))?;

        let (tx, rx) = bounded(CHANNEL_CAPACITY);
        let durable_lsn = Arc::new(AtomicU64::new(recovered_lsn));
        let queued_len = Arc::new(AtomicU64::new(existing_len));
        let poisoned = Arc::new(Mutex::new(None));

        let thread_durable = Arc::clone(&durable_lsn);
        let thread_poisoned = Arc::clone(&poisoned);
        let handle = std::thread::Builder::new()
            .name("dotdb-wal-flush".into())
            .spawn(move || flusher(file, rx, thread_durable, thread_poisoned, policy))?;

        Ok(Self {
            tx,
            durable_lsn,
            queued_len,
            poisoned,
            handle: Some(handle),
        })
    }

    /// Queues a record for the flusher. Returns once the record is
    /// accepted, not once it is durable.
    pub fn append(&self, bytes: Vec<u8>, lsn: u64) -> CoreResult<()> {
        self.check_poisoned()?;
        self.queued_len
            .fetch_add(bytes.len() as u64, Ordering::SeqCst);
        self.tx
            .send(Command::Append {
                bytes,
                lsn,
                ack: None,
            })
            .map_err(|_| flusher_gone())
    }

    /// Queues a record and blocks until it has been fsynced.
    pub fn append_durable(&self, bytes: Vec<u8>, lsn: u64) -> CoreResult<()> {
        self.check_poisoned()?;
        self.queued_len
            .fetch_add(bytes.len() as u64, Ordering::SeqCst);
        let (ack_tx, ack_rx) = bounded(1);
        self.tx
            .send(Command::Append {
                bytes,
                lsn,
                ack: Some(ack_tx),
            })
            .map_err(|_| flusher_gone())?;
        wait_ack(&ack_rx)
    }

    /// Blocks until every previously accepted record has been fsynced.
    pub fn sync(&self) -> CoreResult<()> {
        self.check_poisoned()?;
        let (ack_tx, ack_rx) = bounded(1);
        self.tx
            .send(Command::Sync { ack: ack_tx })
            .map_err(|_| flusher_gone())?;
        wait_ack(&ack_rx)
    }

    /// Rewrites the log as `marker` followed by the current contents at
    /// and past byte offset `cut`. Blocks until the rewrite is durable.
    pub fn rewrite_from(&self, marker: Vec<u8>, cut: u64) -> CoreResult<()> {
        self.check_poisoned()?;
        let marker_len = marker.len() as u64;
        let (ack_tx, ack_rx) = bounded(1);
        self.tx
            .send(Command::Rewrite {
                marker,
                cut,
                ack: ack_tx,
            })
            .map_err(|_| flusher_gone())?;
        wait_ack(&ack_rx)?;
        // queued_len = marker + preserved tail
        let old = self.queued_len.load(Ordering::SeqCst);
        self.queued_len
            .store(marker_len + old.saturating_sub(cut), Ordering::SeqCst);
        Ok(())
    }

    /// Returns the file length once every queued append has been
    /// written. Appends issued after this call land past the returned
    /// offset.
    #[must_use]
    pub fn queued_len(&self) -> u64 {
        self.queued_len.load(Ordering::SeqCst)
    }

    /// Returns the highest LSN known to be durable.
    #[must_use]
    pub fn durable_lsn(&self) -> u64 {
        self.durable_lsn.load(Ordering::Acquire)
    }

    fn check_poisoned(&self) -> CoreResult<()> {
        match self.poisoned.lock().take() {
            Some(message) => Err(CoreError::Io(io::Error::other(message))),
            None => Ok(()),
        }
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for WalWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalWriter")
            .field("durable_lsn", &self.durable_lsn())
            .finish_non_exhaustive()
    }
}

fn flusher_gone() -> CoreError {
    CoreError::Io(io::Error::other("WAL flusher thread stopped"))
}

fn wait_ack(rx: &Receiver<io::Result<()>>) -> CoreResult<()> {
    match rx.recv_timeout(SYNC_TIMEOUT) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(CoreError::Io(e)),
        Err(_) => Err(CoreError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "WAL sync timed out",
        ))),
    }
}

struct Batch {
    buf: Vec<u8>,
    max_lsn: u64,
    acks: Vec<Sender<io::Result<()>>>,
}

impl Batch {
    fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity * 128),
            max_lsn: 0,
            acks: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty() && self.acks.is_empty()
    }
}

fn flusher(
    mut file: std::fs::File,
    rx: Receiver<Command>,
    durable_lsn: Arc<AtomicU64>,
    poisoned: Arc<Mutex<Option<String>>>,
    policy: FlushPolicy,
) {
    let mut batch = Batch::new(policy.batch_size.min(1024));
    let mut pending_records = 0usize;
    let mut last_flush = Instant::now();

    loop {
        let deadline = last_flush + policy.flush_interval;
        let timeout = deadline.saturating_duration_since(Instant::now());

        let mut shutdown = false;
        let mut flush_now = false;

        match rx.recv_timeout(timeout) {
            Ok(Command::Append { bytes, lsn, ack }) => {
                batch.buf.extend_from_slice(&bytes);
                batch.max_lsn = batch.max_lsn.max(lsn);
                if let Some(ack) = ack {
                    batch.acks.push(ack);
                    flush_now = true;
                }
                pending_records += 1;
                if pending_records >= policy.batch_size {
                    flush_now = true;
                }
            }
            Ok(Command::Sync { ack }) => {
                batch.acks.push(ack);
                flush_now = true;
            }
            Ok(Command::Rewrite { marker, cut, ack }) => {
                // Flush whatever is pending so the file is complete
                // before splicing.
                flush_batch(&mut file, &mut batch, &durable_lsn, &poisoned);
                pending_records = 0;
                let result = rewrite(&mut file, &marker, cut);
                if let Err(e) = &result {
                    *poisoned.lock() = Some(e.to_string());
                }
                let _ = ack.send(result);
                last_flush = Instant::now();
                continue;
            }
            Ok(Command::Shutdown) => {
                shutdown = true;
                flush_now = true;
            }
            Err(RecvTimeoutError::Timeout) => {
                flush_now = true;
            }
            Err(RecvTimeoutError::Disconnected) => {
                shutdown = true;
                flush_now = true;
            }
        }

        if flush_now {
            if !batch.is_empty() {
                flush_batch(&mut file, &mut batch, &durable_lsn, &poisoned);
                pending_records = 0;
            }
            last_flush = Instant::now();
        }
        if shutdown {
            return;
        }
    }
}

fn flush_batch(
    file: &mut std::fs::File,
    batch: &mut Batch,
    durable_lsn: &AtomicU64,
    poisoned: &Mutex<Option<String>>,
) {
    let result = write_and_sync(file, &batch.buf);
    match &result {
        Ok(()) => {
            if batch.max_lsn > 0 {
                durable_lsn.store(batch.max_lsn, Ordering::Release);
            }
        }
        Err(e) => {
            *poisoned.lock() = Some(e.to_string());
        }
    }
    for ack in batch.acks.drain(..) {
        let _ = ack.send(
            result
                .as_ref()
                .map(|()| ())
                .map_err(|e| io::Error::other(e.to_string())),
        );
    }
    batch.buf.clear();
    batch.max_lsn = 0;
}

fn write_and_sync(file: &mut std::fs::File, buf: &[u8]) -> io::Result<()> {
    if !buf.is_empty() {
        file.write_all(buf)?;
    }
    file.sync_all()
}

fn rewrite(file: &mut std::fs::File, marker: &[u8], cut: u64) -> io::Result<()> {
    // Read the tail that must survive the checkpoint.
    file.seek(SeekFrom::Start(cut))?;
    let mut tail = Vec::new();
    file.read_to_end(&mut tail)?;

    // Splice: marker first, preserved tail after.
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(marker)?;
    file.write_all(&tail)?;
    file.sync_all()?;
    Ok(())
}
