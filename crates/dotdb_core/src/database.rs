//! Database facade and recovery.

use crate::config::{Durability, LockMode, Options};
use crate::crypto::SnapshotCipher;
use crate::error::{CoreError, CoreResult};
use crate::events::{AfterFn, BeforeFn, Hooks, Method, SubscriberFn, SubscriptionId};
use crate::executor::{self, Aggregate, Filter, FilterOp};
use crate::index::IndexStore;
use crate::lock::FileLock;
use crate::schema::SchemaSet;
use crate::snapshot;
use crate::transaction::{Applied, BatchOp, Transaction};
use crate::tree;
use crate::types::Lsn;
use crate::wal::{self, FlushPolicy, WalOp, WalRecord, WalWriter};
use dotdb_codec::{Path, Value};
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// WAL enablement and durability as reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalStatus {
    /// Whether a WAL is being written.
    pub enabled: bool,
    /// Highest LSN known to be fsynced.
    pub durable_lsn: u64,
}

/// The main database handle.
///
/// `Database` owns the in-memory tree, the WAL, the indexes, and the
/// on-disk files derived from the base path:
///
/// ```text
/// <path>            snapshot (JSON, or encrypted hex envelope)
/// <path>.wal        write-ahead log
/// <path>.<name>.idx index sidecars
/// <path>.lock       advisory lockfile
/// <path>.tmp        transient staging file
/// ```
///
/// Writes are serialized through a single write lock; reads take a
/// shared guard on the tree and never wait on WAL I/O.
///
/// # Example
///
/// ```rust,ignore
/// use dotdb_core::{Database, Options, Value};
///
/// let db = Database::open_with_options("app.db", Options::new().wal(true))?;
/// db.set("users.alice.email", Value::from("a@x"))?;
/// assert!(db.has("users.alice")?);
/// db.close()?;
/// ```
pub struct Database {
    options: Options,
    /// Base path as a string, used to derive sidecar names.
    base_path: String,
    snapshot_path: PathBuf,
    wal_path: PathBuf,

    tree: RwLock<Value>,
    /// Serializes writers: LSN assignment, apply, WAL append, index
    /// update all happen under it.
    write_lock: Mutex<()>,
    /// Serializes checkpoints against each other.
    checkpoint_lock: Mutex<()>,

    next_lsn: AtomicU64,
    checkpoint_lsn: AtomicU64,

    wal: Option<WalWriter>,
    indexes: RwLock<IndexStore>,
    schemas: SchemaSet,
    hooks: Hooks,
    cipher: Option<SnapshotCipher>,

    file_lock: Mutex<Option<FileLock>>,
    read_only: bool,
    is_open: RwLock<bool>,
    last_autosave: Mutex<Instant>,
}

impl Database {
    /// Opens a database with default options.
    pub fn open(path: impl Into<PathBuf>) -> CoreResult<Self> {
        Self::open_with_options(path, Options::default())
    }

    /// Opens a database: acquires the file lock, loads the snapshot,
    /// replays the WAL tail, and adopts or rebuilds the indexes.
    pub fn open_with_options(path: impl Into<PathBuf>, options: Options) -> CoreResult<Self> {
        let snapshot_path: PathBuf = path.into();
        let base_path = snapshot_path.display().to_string();
        let wal_path = PathBuf::from(format!("{base_path}.wal"));
        let lock_path = PathBuf::from(format!("{base_path}.lock"));

        // 1. File lock per the configured mode.
        let file_lock = FileLock::acquire(&lock_path, options.lock_mode, options.lock_timeout_ms)?;
        let read_only = options.lock_mode == LockMode::Shared;

        let cipher = options.encryption_key.as_deref().map(SnapshotCipher::new);

        // 2. Snapshot, or a fresh empty root.
        let (mut root, checkpoint_lsn) = match snapshot::load(&snapshot_path, cipher.as_ref())? {
            Some(loaded) => loaded,
            None => (Value::object(), Lsn::ZERO),
        };

        // 3. Replay the WAL tail past the checkpoint.
        let mut max_lsn = checkpoint_lsn.as_u64();
        let mut replayed_paths: Vec<Path> = Vec::new();
        let mut wal_len = 0u64;

        if options.durability.wal_enabled() {
            let scan = wal::scan(&wal_path)?;
            wal_len = scan.valid_len;
            if scan.truncated_tail && !read_only {
                wal::truncate_to(&wal_path, scan.valid_len)?;
            }
            for record in &scan.records {
                max_lsn = max_lsn.max(record.lsn.as_u64());
                if record.lsn <= checkpoint_lsn {
                    continue;
                }
                match Self::apply_record(&mut root, record) {
                    Ok(Some(path)) => replayed_paths.push(path),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(lsn = record.lsn.as_u64(), error = %e, "skipping unreplayable WAL record");
                    }
                }
            }
            debug!(
                records = scan.records.len(),
                checkpoint = checkpoint_lsn.as_u64(),
                "WAL replay complete"
            );
        }

        // 4. Indexes: adopt sidecars (converged below) or rebuild.
        let mut indexes = IndexStore::open(&options.indices, &base_path, &root)?;
        for path in &replayed_paths {
            indexes.on_mutation(&root, path);
        }

        // 5. Start the flusher for write-enabled WAL modes.
        let wal = if options.durability.wal_enabled() && !read_only {
            Some(WalWriter::open(
                &wal_path,
                wal_len,
                max_lsn,
                Self::flush_policy(&options),
            )?)
        } else {
            None
        };

        let schemas = SchemaSet::new(options.schemas.clone())?;

        Ok(Self {
            options,
            base_path,
            snapshot_path,
            wal_path,
            tree: RwLock::new(root),
            write_lock: Mutex::new(()),
            checkpoint_lock: Mutex::new(()),
            next_lsn: AtomicU64::new(max_lsn + 1),
            checkpoint_lsn: AtomicU64::new(checkpoint_lsn.as_u64()),
            wal,
            indexes: RwLock::new(indexes),
            schemas,
            hooks: Hooks::new(),
            cipher,
            file_lock: Mutex::new(file_lock),
            read_only,
            is_open: RwLock::new(true),
            last_autosave: Mutex::new(Instant::now()),
        })
    }

    fn flush_policy(options: &Options) -> FlushPolicy {
        match options.durability {
            // Per-record durability comes from the append ack; the
            // interval only bounds idle wakeups.
            Durability::Sync => FlushPolicy {
                batch_size: 1,
                flush_interval: Duration::from_millis(1000),
            },
            Durability::Lazy => FlushPolicy {
                batch_size: 1000,
                flush_interval: Duration::from_millis(100),
            },
            Durability::Batched => FlushPolicy {
                batch_size: options.wal_batch_size.max(1),
                flush_interval: Duration::from_millis(options.wal_flush_ms.max(1)),
            },
            Durability::None => FlushPolicy {
                batch_size: 1,
                flush_interval: Duration::from_millis(1000),
            },
        }
    }

    /// Applies one replayed record to the tree.
    fn apply_record(root: &mut Value, record: &WalRecord) -> CoreResult<Option<Path>> {
        if record.op == WalOp::Checkpoint {
            return Ok(None);
        }
        let path = Path::parse(&record.path).map_err(|e| CoreError::path(e.to_string()))?;

        match record.op {
            WalOp::Set => {
                let value = record.payload.clone().unwrap_or(Value::Null);
                tree::set_at(root, &path, value)?;
            }
            WalOp::Delete => {
                tree::delete_at(root, &path)?;
            }
            WalOp::Push => {
                let items = match &record.payload {
                    Some(Value::Array(items)) => items.clone(),
                    Some(other) => vec![other.clone()],
                    None => Vec::new(),
                };
                tree::push_at(root, &path, items)?;
            }
            WalOp::AddNum => {
                let delta = record
                    .payload
                    .as_ref()
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
                let base = tree::numeric_base(root, &path)?;
                tree::set_at(root, &path, Value::Number(base + delta))?;
            }
            WalOp::Checkpoint => unreachable!("handled above"),
        }
        Ok(Some(path))
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Reads the value at `path`.
    ///
    /// Never blocks on WAL I/O or on the serialized write path beyond
    /// the in-memory apply of a concurrent mutation.
    pub fn get(&self, path: &str) -> CoreResult<Option<Value>> {
        self.ensure_open()?;
        let path = parse_path(path)?;
        let tree = self.tree.read();
        Ok(tree::get_at(&tree, &path).cloned())
    }

    /// Checks whether `path` is present.
    pub fn has(&self, path: &str) -> CoreResult<bool> {
        Ok(self.get(path)?.is_some())
    }

    /// Single-document lookup through a declared index.
    ///
    /// Ordered with respect to prior writes accepted by this process.
    ///
    /// # Errors
    ///
    /// Returns `Index` for an unknown index name.
    pub fn find_by_index(&self, name: &str, value: &Value) -> CoreResult<Option<Value>> {
        self.ensure_open()?;
        // Lock order is tree before indexes everywhere else; avoid
        // nesting here by releasing the index guard before reading.
        let doc_path = {
            let indexes = self.indexes.read();
            let index = indexes.by_name(name)?;
            match index.find_first(value) {
                Some(doc_path) => doc_path.clone(),
                None => return Ok(None),
            }
        };
        let path = parse_path(&doc_path)?;
        let tree = self.tree.read();
        Ok(tree::get_at(&tree, &path).cloned())
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Replaces the value at `path`, returning the previous value.
    pub fn set(&self, path: &str, value: Value) -> CoreResult<Option<Value>> {
        let applied = self.write_single(BatchOp::Set {
            path: path.to_owned(),
            value,
        })?;
        Ok(applied.and_then(|a| a.old))
    }

    /// Removes the value at `path`, returning it if present.
    pub fn delete(&self, path: &str) -> CoreResult<Option<Value>> {
        let applied = self.write_single(BatchOp::Delete {
            path: path.to_owned(),
        })?;
        Ok(applied.and_then(|a| a.old))
    }

    /// Appends `items` to the array at `path`, deduplicating by deep
    /// equality. One WAL record is written per call.
    pub fn push(&self, path: &str, items: Vec<Value>) -> CoreResult<()> {
        self.write_single(BatchOp::Push {
            path: path.to_owned(),
            items,
        })?;
        Ok(())
    }

    /// Removes every deep-equal match of `items` from the array at
    /// `path`. A missing target is a no-op.
    pub fn pull(&self, path: &str, items: Vec<Value>) -> CoreResult<()> {
        self.write_single(BatchOp::Pull {
            path: path.to_owned(),
            items,
        })?;
        Ok(())
    }

    /// Adds `delta` to the number at `path` (0 if absent) and returns
    /// the new value.
    pub fn add(&self, path: &str, delta: f64) -> CoreResult<f64> {
        let applied = self.write_single(BatchOp::Add {
            path: path.to_owned(),
            delta,
        })?;
        Ok(applied
            .and_then(|a| a.new)
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0))
    }

    /// Subtracts `delta` from the number at `path` and returns the new
    /// value.
    pub fn subtract(&self, path: &str, delta: f64) -> CoreResult<f64> {
        self.add(path, -delta)
    }

    /// Applies a sequence of operations under one write-lock
    /// acquisition and one WAL flush boundary.
    ///
    /// The batch is atomic from the caller's perspective: the first
    /// failing operation rolls back everything already applied and its
    /// error is returned.
    pub fn batch(&self, ops: Vec<BatchOp>) -> CoreResult<()> {
        self.transaction(|tx| {
            for op in ops {
                tx.apply(op)?;
            }
            Ok(())
        })
    }

    /// Runs `f` inside a transaction.
    ///
    /// Commits on `Ok`, rolls back to the pre-image on `Err`. Inside
    /// `f` the transaction supports savepoints and nested transactions.
    /// No WAL record from a rolled-back span survives replay.
    pub fn transaction<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> CoreResult<T>,
    {
        self.ensure_writable()?;
        let guard = self.write_lock.lock();
        let begin_image = self.tree.read().clone();
        let mut tx = Transaction::new(self, begin_image);

        match f(&mut tx) {
            Ok(value) => {
                let buffered = tx.into_buffered();
                self.commit_buffered(&buffered)?;
                drop(guard);
                self.maybe_autosave();
                Ok(value)
            }
            Err(e) => {
                let (image, touched) = tx.into_rollback();
                self.restore_image(image, &touched);
                Err(e)
            }
        }
    }

    /// Applies one operation under the write lock and logs it.
    fn write_single(&self, op: BatchOp) -> CoreResult<Option<Applied>> {
        self.ensure_writable()?;
        let guard = self.write_lock.lock();

        let Some(applied) = self.apply_one(op)? else {
            return Ok(None);
        };

        match self.log_and_notify(std::slice::from_ref(&applied)) {
            Ok(()) => {
                drop(guard);
                self.maybe_autosave();
                Ok(Some(applied))
            }
            Err(e) => {
                self.revert_one(&applied);
                Err(e)
            }
        }
    }

    /// Validates, applies, and index-maintains one operation.
    ///
    /// Assumes the write lock is held. Returns `None` for no-ops
    /// (deleting an absent path, pulling from an absent array).
    pub(crate) fn apply_one(&self, op: BatchOp) -> CoreResult<Option<Applied>> {
        match op {
            BatchOp::Set { path, value } => {
                let path = parse_path(&path)?;
                let dotted = path.as_dotted();
                let value = self.hooks.run_before(Method::Set, &dotted, value);
                self.schemas.check_set(&path, &value)?;

                let mut tree = self.tree.write();
                let old = tree::set_at(&mut tree, &path, value.clone())?;
                self.indexes.write().on_mutation(&tree, &path);

                Ok(Some(Applied {
                    wal_op: WalOp::Set,
                    method: Method::Set,
                    path,
                    wal_payload: Some(value.clone()),
                    old,
                    new: Some(value),
                }))
            }

            BatchOp::Delete { path } => {
                let path = parse_path(&path)?;
                let mut tree = self.tree.write();
                let old = tree::delete_at(&mut tree, &path)?;
                if old.is_none() {
                    return Ok(None);
                }
                self.indexes.write().on_mutation(&tree, &path);

                Ok(Some(Applied {
                    wal_op: WalOp::Delete,
                    method: Method::Delete,
                    path,
                    wal_payload: None,
                    old,
                    new: None,
                }))
            }

            BatchOp::Push { path, items } => {
                let path = parse_path(&path)?;
                let dotted = path.as_dotted();
                let items = match self
                    .hooks
                    .run_before(Method::Push, &dotted, Value::Array(items))
                {
                    Value::Array(items) => items,
                    other => vec![other],
                };

                let mut tree = self.tree.write();
                let old = tree::get_at(&tree, &path).cloned();
                tree::push_at(&mut tree, &path, items.clone())?;
                let new = tree::get_at(&tree, &path).cloned();
                self.indexes.write().on_mutation(&tree, &path);

                Ok(Some(Applied {
                    wal_op: WalOp::Push,
                    method: Method::Push,
                    path,
                    wal_payload: Some(Value::Array(items)),
                    old,
                    new,
                }))
            }

            BatchOp::Pull { path, items } => {
                let path = parse_path(&path)?;
                let dotted = path.as_dotted();

                let mut tree = self.tree.write();
                let Some(pulled) = tree::pulled_array(&tree, &path, &items)? else {
                    return Ok(None);
                };
                let new_array = self
                    .hooks
                    .run_before(Method::Set, &dotted, Value::Array(pulled));
                self.schemas.check_set(&path, &new_array)?;

                let old = tree::set_at(&mut tree, &path, new_array.clone())?;
                self.indexes.write().on_mutation(&tree, &path);

                Ok(Some(Applied {
                    wal_op: WalOp::Set,
                    method: Method::Set,
                    path,
                    wal_payload: Some(new_array.clone()),
                    old,
                    new: Some(new_array),
                }))
            }

            BatchOp::Add { path, delta } => {
                let path = parse_path(&path)?;
                let dotted = path.as_dotted();
                let delta = self
                    .hooks
                    .run_before(Method::Add, &dotted, Value::Number(delta))
                    .as_f64()
                    .unwrap_or(delta);

                let mut tree = self.tree.write();
                let old = tree::get_at(&tree, &path).cloned();
                let base = tree::numeric_base(&tree, &path)?;
                let result = Value::Number(base + delta);
                tree::set_at(&mut tree, &path, result.clone())?;
                self.indexes.write().on_mutation(&tree, &path);

                Ok(Some(Applied {
                    wal_op: WalOp::AddNum,
                    method: Method::Add,
                    path,
                    wal_payload: Some(Value::Number(delta)),
                    old,
                    new: Some(result),
                }))
            }
        }
    }

    /// Assigns LSNs, appends to the WAL, then notifies subscribers in
    /// LSN order. Assumes the write lock is held.
    pub(crate) fn log_and_notify(&self, applied: &[Applied]) -> CoreResult<()> {
        for entry in applied {
            let lsn = Lsn::new(self.next_lsn.fetch_add(1, Ordering::SeqCst));
            if let Some(wal) = &self.wal {
                let record = WalRecord {
                    lsn,
                    op: entry.wal_op,
                    path: entry.path.as_dotted(),
                    payload: entry.wal_payload.clone(),
                };
                let bytes = record.encode()?;
                if self.options.durability == Durability::Sync {
                    wal.append_durable(bytes, lsn.as_u64())?;
                } else {
                    wal.append(bytes, lsn.as_u64())?;
                }
            }

            let dotted = entry.path.as_dotted();
            self.hooks
                .notify(&dotted, entry.new.as_ref(), entry.old.as_ref());
            self.hooks.run_after(entry.method, &dotted, entry.new.as_ref());
        }
        Ok(())
    }

    /// Commits buffered transaction operations: all records inside one
    /// flush boundary, notifications in LSN order.
    fn commit_buffered(&self, buffered: &[Applied]) -> CoreResult<()> {
        self.log_and_notify(buffered)?;
        if self.options.durability == Durability::Sync {
            if let Some(wal) = &self.wal {
                wal.sync()?;
            }
        }
        Ok(())
    }

    /// Undoes a single applied operation after a WAL failure.
    fn revert_one(&self, applied: &Applied) {
        let mut tree = self.tree.write();
        let result = match &applied.old {
            Some(old) => tree::set_at(&mut tree, &applied.path, old.clone()).map(|_| ()),
            None => tree::delete_at(&mut tree, &applied.path).map(|_| ()),
        };
        if let Err(e) = result {
            warn!(path = %applied.path, error = %e, "failed to revert after WAL error");
        }
        self.indexes.write().on_mutation(&tree, &applied.path);
    }

    /// Restores a pre-image and re-derives indexes for touched paths.
    pub(crate) fn restore_image(&self, image: Value, touched: &[Path]) {
        let mut tree = self.tree.write();
        *tree = image;
        let mut indexes = self.indexes.write();
        for path in touched {
            indexes.on_mutation(&tree, path);
        }
    }

    /// Clones the current tree (transaction pre-images).
    pub(crate) fn clone_tree(&self) -> Value {
        self.tree.read().clone()
    }

    // ========================================================================
    // Parallel execution
    // ========================================================================

    /// Filters the children of `collection`, in parallel above the
    /// executor's threshold. Result order matches collection order.
    ///
    /// When an equality filter's field is covered by an index, the scan
    /// is seeded from the index instead of the full child set; every
    /// filter is still applied, so results are identical either way.
    pub fn parallel_query(&self, collection: &str, filters: &[Filter]) -> CoreResult<Vec<Value>> {
        self.ensure_open()?;
        let started = Instant::now();
        let collection_path = parse_path(collection)?;

        let items: Vec<Value> = {
            let tree = self.tree.read();
            let indexes = self.indexes.read();

            let seed = filters.iter().find_map(|filter| {
                if filter.op == FilterOp::Eq && !filter.field.contains('.') {
                    indexes
                        .covering(&collection_path, &filter.field)
                        .map(|index| (filter, index))
                } else {
                    None
                }
            });

            match seed {
                Some((filter, index)) => {
                    let mut items = Vec::new();
                    if let Some(paths) = index.find(&filter.value) {
                        for doc_path in paths {
                            if let Ok(path) = Path::parse(doc_path) {
                                if let Some(doc) = tree::get_at(&tree, &path) {
                                    items.push(doc.clone());
                                }
                            }
                        }
                    }
                    items
                }
                None => tree::collection_children(&tree, &collection_path)
                    .into_iter()
                    .map(|(_, value)| value)
                    .collect(),
            }
        };

        let results = executor::filter_items(items, filters);
        self.warn_if_slow("parallel_query", collection, started);
        Ok(results)
    }

    /// Runs an aggregation over the children of `collection`.
    pub fn parallel_aggregate(
        &self,
        collection: &str,
        op: Aggregate,
        field: Option<&str>,
    ) -> CoreResult<Option<Value>> {
        self.ensure_open()?;
        let started = Instant::now();
        let collection_path = parse_path(collection)?;

        let items: Vec<Value> = {
            let tree = self.tree.read();
            tree::collection_children(&tree, &collection_path)
                .into_iter()
                .map(|(_, value)| value)
                .collect()
        };

        let result = executor::aggregate_items(&items, op, field);
        self.warn_if_slow("parallel_aggregate", collection, started);
        Ok(result)
    }

    /// Hash-joins two collections, attaching each left item's matching
    /// right items under `as_field`. Left order is preserved.
    pub fn parallel_lookup(
        &self,
        left: &str,
        right: &str,
        left_field: &str,
        right_field: &str,
        as_field: &str,
    ) -> CoreResult<Vec<Value>> {
        self.ensure_open()?;
        let started = Instant::now();
        let left_path = parse_path(left)?;
        let right_path = parse_path(right)?;

        let (left_items, right_items) = {
            let tree = self.tree.read();
            let left_items: Vec<Value> = tree::collection_children(&tree, &left_path)
                .into_iter()
                .map(|(_, value)| value)
                .collect();
            let right_items: Vec<Value> = tree::collection_children(&tree, &right_path)
                .into_iter()
                .map(|(_, value)| value)
                .collect();
            (left_items, right_items)
        };

        let results =
            executor::lookup_items(left_items, &right_items, left_field, right_field, as_field);
        self.warn_if_slow("parallel_lookup", left, started);
        Ok(results)
    }

    fn warn_if_slow(&self, op: &str, collection: &str, started: Instant) {
        let elapsed = started.elapsed();
        if elapsed.as_millis() as u64 > self.options.slow_query_threshold_ms {
            warn!(
                op,
                collection,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow_query"
            );
        }
    }

    // ========================================================================
    // Hooks
    // ========================================================================

    /// Subscribes to mutations matching `pattern` (`*` one segment,
    /// `**` any tail). The callback receives `(path, new, old)` after
    /// the WAL append, in LSN order. It must not write re-entrantly.
    pub fn subscribe<F>(&self, pattern: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&str, Option<&Value>, Option<&Value>) + Send + Sync + 'static,
    {
        self.hooks.subscribe(pattern, Box::new(callback) as SubscriberFn)
    }

    /// Removes a subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.hooks.unsubscribe(id);
    }

    /// Registers a before-hook that may rewrite incoming values. Runs
    /// inside the write-lock section; must not write re-entrantly.
    pub fn before<F>(&self, method: Method, pattern: &str, callback: F)
    where
        F: Fn(&str, Value) -> Value + Send + Sync + 'static,
    {
        self.hooks.before(method, pattern, Box::new(callback) as BeforeFn);
    }

    /// Registers an observational after-hook.
    pub fn after<F>(&self, method: Method, pattern: &str, callback: F)
    where
        F: Fn(&str, Option<&Value>) + Send + Sync + 'static,
    {
        self.hooks.after(method, pattern, Box::new(callback) as AfterFn);
    }

    // ========================================================================
    // Durability
    // ========================================================================

    /// Forces a checkpoint: writes a fresh snapshot atomically, marks
    /// the WAL, and truncates replayed records.
    ///
    /// Writers may proceed while the snapshot serializes; they are
    /// blocked only around the rename and WAL splice.
    pub fn save(&self) -> CoreResult<()> {
        self.ensure_writable()?;
        let _checkpoint = self.checkpoint_lock.lock();

        // Capture a consistent image, its LSN, and the WAL cut offset.
        let (image, snap_lsn, cut) = {
            let _guard = self.write_lock.lock();
            let tree = self.tree.read();
            let snap_lsn = Lsn::new(self.next_lsn.load(Ordering::SeqCst).saturating_sub(1));
            let cut = self.wal.as_ref().map_or(0, WalWriter::queued_len);
            (tree.clone(), snap_lsn, cut)
        };

        // Serialize and stage without blocking writers.
        snapshot::stage(&self.snapshot_path, &image, snap_lsn, self.cipher.as_ref())?;

        // Swap in the snapshot and splice the WAL under the write lock.
        {
            let _guard = self.write_lock.lock();
            snapshot::promote(&self.snapshot_path)?;
            if let Some(wal) = &self.wal {
                let marker = WalRecord::checkpoint(snap_lsn).encode()?;
                wal.rewrite_from(marker, cut)?;
            }
            self.checkpoint_lsn.store(snap_lsn.as_u64(), Ordering::SeqCst);
        }

        self.indexes.write().save_all(&self.base_path)?;
        debug!(checkpoint_lsn = snap_lsn.as_u64(), "checkpoint complete");
        Ok(())
    }

    /// Blocks until all accepted WAL records are fsynced.
    pub fn sync(&self) -> CoreResult<()> {
        self.ensure_open()?;
        match &self.wal {
            Some(wal) => wal.sync(),
            None => Ok(()),
        }
    }

    /// Returns the LSN the on-disk snapshot reflects.
    #[must_use]
    pub fn checkpoint_lsn(&self) -> Lsn {
        Lsn::new(self.checkpoint_lsn.load(Ordering::SeqCst))
    }

    /// Reports WAL enablement and the highest durable LSN.
    #[must_use]
    pub fn wal_status(&self) -> WalStatus {
        WalStatus {
            enabled: self.wal.is_some(),
            durable_lsn: self.wal.as_ref().map_or(0, WalWriter::durable_lsn),
        }
    }

    /// Flushes, checkpoints, and releases the file lock.
    pub fn close(&self) -> CoreResult<()> {
        if !*self.is_open.read() {
            return Ok(());
        }

        if !self.read_only {
            self.save()?;
            if let Some(wal) = &self.wal {
                wal.sync()?;
            }
        }

        *self.is_open.write() = false;
        self.file_lock.lock().take();
        debug!(path = %self.base_path, "database closed");
        Ok(())
    }

    /// Checks whether the database is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.is_open.read()
    }

    /// Returns the configured options.
    #[must_use]
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Returns the WAL file path (testing and tooling).
    #[must_use]
    pub fn wal_path(&self) -> &std::path::Path {
        &self.wal_path
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if *self.is_open.read() {
            Ok(())
        } else {
            Err(CoreError::Closed)
        }
    }

    fn ensure_writable(&self) -> CoreResult<()> {
        self.ensure_open()?;
        if self.read_only {
            return Err(CoreError::ReadOnly);
        }
        Ok(())
    }

    /// Debounced checkpoint when running without a WAL.
    fn maybe_autosave(&self) {
        if self.wal.is_some() || self.read_only {
            return;
        }
        {
            let last = self.last_autosave.lock();
            if last.elapsed() < Duration::from_millis(self.options.auto_save_interval_ms) {
                return;
            }
        }
        match self.save() {
            Ok(()) => *self.last_autosave.lock() = Instant::now(),
            Err(e) => warn!(error = %e, "auto-save failed"),
        }
    }
}

fn parse_path(raw: &str) -> CoreResult<Path> {
    Path::parse(raw).map_err(|e| CoreError::path(e.to_string()))
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.base_path)
            .field("is_open", &self.is_open())
            .field("durability", &self.options.durability)
            .finish_non_exhaustive()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
