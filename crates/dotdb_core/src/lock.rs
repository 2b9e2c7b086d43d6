//! Multi-process advisory file locking.
//!
//! The engine locks `<path>.lock` (created if missing) on open.
//! `exclusive` mode locks out every other locker; `shared` mode allows
//! other shared lockers but makes this engine read-only; `none` takes no
//! lock and assumes single-process usage. The lock is released when the
//! handle is dropped, on `close`.

use crate::config::LockMode;
use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path as StdPath;
use std::time::{Duration, Instant};
use tracing::debug;

/// Retry cadence while waiting for a contended lock.
const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// A held advisory lock on the database lockfile.
#[derive(Debug)]
pub struct FileLock {
    /// Lock file handle; the OS lock is tied to its lifetime.
    _file: File,
    mode: LockMode,
}

impl FileLock {
    /// Acquires the lock for `mode`, retrying up to `timeout_ms`.
    ///
    /// Returns `None` for `LockMode::None`.
    ///
    /// # Errors
    ///
    /// Returns `Lock` if the lock is still held elsewhere when the
    /// timeout expires, or `Io` if the lockfile cannot be created.
    pub fn acquire(
        lock_path: &StdPath,
        mode: LockMode,
        timeout_ms: u64,
    ) -> CoreResult<Option<Self>> {
        if mode == LockMode::None {
            return Ok(None);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let locked = match mode {
                LockMode::Exclusive => file.try_lock_exclusive().is_ok(),
                LockMode::Shared => file.try_lock_shared().is_ok(),
                LockMode::None => unreachable!("handled above"),
            };

            if locked {
                debug!(path = %lock_path.display(), ?mode, "file lock acquired");
                return Ok(Some(Self { _file: file, mode }));
            }

            if Instant::now() >= deadline {
                return Err(CoreError::lock(format!(
                    "could not acquire {mode:?} lock on {} within {timeout_ms} ms",
                    lock_path.display()
                )));
            }
            std::thread::sleep(RETRY_INTERVAL.min(
                deadline.saturating_duration_since(Instant::now()),
            ));
        }
    }

    /// Returns the mode this lock was taken in.
    #[must_use]
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}
