//! Database configuration.

use crate::schema::Schema;

/// Durability mode for the write-ahead log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// WAL disabled; the snapshot file is rewritten by `save()` only.
    None,
    /// Append and flush to the OS, fsync roughly every 100 ms.
    Lazy,
    /// Group commit: fsync every `wal_flush_ms` or every `wal_batch_size`
    /// records, whichever comes first.
    Batched,
    /// Fsync after every record.
    Sync,
}

impl Durability {
    /// Parses a durability mode from its configuration string.
    ///
    /// Unknown strings map to `None`, matching the permissive behavior
    /// of the host-facing option surface.
    #[must_use]
    pub fn from_str(s: &str) -> Self {
        match s {
            "lazy" => Durability::Lazy,
            "batched" => Durability::Batched,
            "sync" => Durability::Sync,
            _ => Durability::None,
        }
    }

    /// Checks whether this mode writes a WAL at all.
    #[must_use]
    pub fn wal_enabled(self) -> bool {
        !matches!(self, Durability::None)
    }
}

/// File lock mode taken on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// OS advisory exclusive lock; other processes are locked out.
    Exclusive,
    /// Shared lock; the engine rejects all mutations.
    Shared,
    /// No lock; single-process usage is assumed.
    None,
}

impl LockMode {
    /// Parses a lock mode from its configuration string.
    #[must_use]
    pub fn from_str(s: &str) -> Self {
        match s {
            "exclusive" => LockMode::Exclusive,
            "shared" => LockMode::Shared,
            _ => LockMode::None,
        }
    }
}

/// Declaration of an equality index, supplied at open time.
#[derive(Debug, Clone)]
pub struct IndexSpec {
    /// Index name, used for lookups and the sidecar file name.
    pub name: String,
    /// Collection path whose direct children are indexed.
    pub path: String,
    /// Field extracted from each child object.
    pub field: String,
}

impl IndexSpec {
    /// Creates an index declaration.
    pub fn new(
        name: impl Into<String>,
        path: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            field: field.into(),
        }
    }
}

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Options {
    /// Equality indexes to maintain.
    pub indices: Vec<IndexSpec>,

    /// Durability mode for the WAL.
    pub durability: Durability,

    /// File lock mode.
    pub lock_mode: LockMode,

    /// How long to keep retrying lock acquisition before failing.
    pub lock_timeout_ms: u64,

    /// Group-commit batch size.
    pub wal_batch_size: usize,

    /// Group-commit flush interval in milliseconds.
    pub wal_flush_ms: u64,

    /// Encryption key for the snapshot file.
    ///
    /// When set, the snapshot round-trips through AES-256-GCM with an
    /// scrypt-derived key. The WAL is not encrypted.
    pub encryption_key: Option<String>,

    /// Debounce window for checkpoints when the WAL is disabled.
    pub auto_save_interval_ms: u64,

    /// Schemas validated on writes, keyed by path prefix.
    pub schemas: Vec<(String, Schema)>,

    /// Parallel queries slower than this log a `slow_query` warning.
    pub slow_query_threshold_ms: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            indices: Vec::new(),
            durability: Durability::None,
            lock_mode: LockMode::None,
            lock_timeout_ms: 0,
            wal_batch_size: 1000,
            wal_flush_ms: 10,
            encryption_key: None,
            auto_save_interval_ms: 1000,
            schemas: Vec::new(),
            slow_query_threshold_ms: 100,
        }
    }
}

impl Options {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience switch: enables the WAL with batched group commit and
    /// an exclusive file lock.
    #[must_use]
    pub fn wal(mut self, enabled: bool) -> Self {
        if enabled {
            self.durability = Durability::Batched;
            self.lock_mode = LockMode::Exclusive;
        }
        self
    }

    /// Adds an equality index declaration.
    #[must_use]
    pub fn index(mut self, spec: IndexSpec) -> Self {
        self.indices.push(spec);
        self
    }

    /// Sets the durability mode.
    #[must_use]
    pub const fn durability(mut self, mode: Durability) -> Self {
        self.durability = mode;
        self
    }

    /// Sets the lock mode.
    #[must_use]
    pub const fn lock_mode(mut self, mode: LockMode) -> Self {
        self.lock_mode = mode;
        self
    }

    /// Sets the lock acquisition timeout in milliseconds.
    #[must_use]
    pub const fn lock_timeout_ms(mut self, ms: u64) -> Self {
        self.lock_timeout_ms = ms;
        self
    }

    /// Sets the group-commit batch size.
    #[must_use]
    pub const fn wal_batch_size(mut self, size: usize) -> Self {
        self.wal_batch_size = size;
        self
    }

    /// Sets the group-commit flush interval in milliseconds.
    #[must_use]
    pub const fn wal_flush_ms(mut self, ms: u64) -> Self {
        self.wal_flush_ms = ms;
        self
    }

    /// Sets the snapshot encryption key.
    #[must_use]
    pub fn encryption_key(mut self, key: impl Into<String>) -> Self {
        self.encryption_key = Some(key.into());
        self
    }

    /// Sets the auto-save debounce window in milliseconds.
    #[must_use]
    pub const fn auto_save_interval_ms(mut self, ms: u64) -> Self {
        self.auto_save_interval_ms = ms;
        self
    }

    /// Registers a schema against a path prefix.
    #[must_use]
    pub fn schema(mut self, prefix: impl Into<String>, schema: Schema) -> Self {
        self.schemas.push((prefix.into(), schema));
        self
    }

    /// Sets the slow-query warning threshold in milliseconds.
    #[must_use]
    pub const fn slow_query_threshold_ms(mut self, ms: u64) -> Self {
        self.slow_query_threshold_ms = ms;
        self
    }
}
