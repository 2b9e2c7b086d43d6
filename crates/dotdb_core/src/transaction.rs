//! Transactions with savepoints.
//!
//! A transaction holds the write lock for its whole span. A pre-image
//! of the root is cloned at begin and at each savepoint; mutations
//! apply to the tree (and indexes) immediately but their WAL records
//! are buffered and appended only at commit, inside one flush
//! boundary. A rollback restores the relevant pre-image and discards
//! the buffered records, so an aborted span can never be observed by
//! replay. Nested transactions are savepoints.

use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use crate::events::Method;
use crate::wal::WalOp;
use dotdb_codec::{Path, Value};

/// One operation in a [`Database::batch`] call.
#[derive(Debug, Clone)]
pub enum BatchOp {
    /// Replace the value at a path.
    Set {
        /// Target path.
        path: String,
        /// Value to store.
        value: Value,
    },
    /// Remove the value at a path.
    Delete {
        /// Target path.
        path: String,
    },
    /// Deduplicating array append.
    Push {
        /// Target path.
        path: String,
        /// Items to append.
        items: Vec<Value>,
    },
    /// Remove deep-equal matches from an array.
    Pull {
        /// Target path.
        path: String,
        /// Items to remove.
        items: Vec<Value>,
    },
    /// Numeric read-modify-write.
    Add {
        /// Target path.
        path: String,
        /// Delta to add (negative for subtract).
        delta: f64,
    },
}

/// A mutation that has been applied to the tree but whose WAL record
/// is still pending.
#[derive(Debug)]
pub(crate) struct Applied {
    pub(crate) wal_op: WalOp,
    pub(crate) method: Method,
    pub(crate) path: Path,
    pub(crate) wal_payload: Option<Value>,
    pub(crate) old: Option<Value>,
    pub(crate) new: Option<Value>,
}

struct Savepoint {
    name: String,
    image: Value,
    op_len: usize,
}

/// An in-flight transaction. Created by [`Database::transaction`].
pub struct Transaction<'db> {
    db: &'db Database,
    begin_image: Value,
    savepoints: Vec<Savepoint>,
    buffered: Vec<Applied>,
}

impl<'db> Transaction<'db> {
    pub(crate) fn new(db: &'db Database, begin_image: Value) -> Self {
        Self {
            db,
            begin_image,
            savepoints: Vec::new(),
            buffered: Vec::new(),
        }
    }

    /// Replaces the value at `path`.
    pub fn set(&mut self, path: &str, value: Value) -> CoreResult<()> {
        self.apply(BatchOp::Set {
            path: path.to_owned(),
            value,
        })
    }

    /// Removes the value at `path`.
    pub fn delete(&mut self, path: &str) -> CoreResult<()> {
        self.apply(BatchOp::Delete {
            path: path.to_owned(),
        })
    }

    /// Deduplicating array append at `path`.
    pub fn push(&mut self, path: &str, items: Vec<Value>) -> CoreResult<()> {
        self.apply(BatchOp::Push {
            path: path.to_owned(),
            items,
        })
    }

    /// Removes deep-equal matches from the array at `path`.
    pub fn pull(&mut self, path: &str, items: Vec<Value>) -> CoreResult<()> {
        self.apply(BatchOp::Pull {
            path: path.to_owned(),
            items,
        })
    }

    /// Adds to the number at `path`, returning the new value.
    pub fn add(&mut self, path: &str, delta: f64) -> CoreResult<f64> {
        let before_len = self.buffered.len();
        self.apply(BatchOp::Add {
            path: path.to_owned(),
            delta,
        })?;
        Ok(self
            .buffered
            .get(before_len)
            .and_then(|applied| applied.new.as_ref())
            .and_then(Value::as_f64)
            .unwrap_or(0.0))
    }

    /// Subtracts from the number at `path`, returning the new value.
    pub fn subtract(&mut self, path: &str, delta: f64) -> CoreResult<f64> {
        self.add(path, -delta)
    }

    /// Reads a value; mutations made earlier in this transaction are
    /// visible.
    pub fn get(&self, path: &str) -> CoreResult<Option<Value>> {
        self.db.get(path)
    }

    /// Checks whether `path` is present.
    pub fn has(&self, path: &str) -> CoreResult<bool> {
        self.db.has(path)
    }

    /// Applies one batch operation inside this transaction.
    pub fn apply(&mut self, op: BatchOp) -> CoreResult<()> {
        if let Some(applied) = self.db.apply_one(op)? {
            self.buffered.push(applied);
        }
        Ok(())
    }

    /// Records a named savepoint: a pre-image that `rollback_to` can
    /// restore. A repeated name shadows the earlier savepoint.
    pub fn savepoint(&mut self, name: impl Into<String>) {
        self.savepoints.push(Savepoint {
            name: name.into(),
            image: self.db.clone_tree(),
            op_len: self.buffered.len(),
        });
    }

    /// Restores the pre-image captured at `savepoint(name)` and
    /// discards everything applied since. The savepoint itself stays
    /// valid for repeated rollbacks.
    ///
    /// # Errors
    ///
    /// Returns `TxConflict` for an unknown savepoint name.
    pub fn rollback_to(&mut self, name: &str) -> CoreResult<()> {
        let index = self
            .savepoints
            .iter()
            .rposition(|sp| sp.name == name)
            .ok_or_else(|| CoreError::no_such_savepoint(name))?;

        let image = self.savepoints[index].image.clone();
        let op_len = self.savepoints[index].op_len;

        let touched: Vec<Path> = self
            .buffered
            .drain(op_len..)
            .map(|applied| applied.path)
            .collect();
        self.db.restore_image(image, &touched);
        self.savepoints.truncate(index + 1);
        Ok(())
    }

    /// Runs `f` as a nested transaction, implemented as an anonymous
    /// savepoint: its mutations roll back if `f` fails, while the
    /// enclosing transaction stays alive.
    pub fn nested<F, T>(&mut self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut Self) -> CoreResult<T>,
    {
        let image = self.db.clone_tree();
        let mark = self.buffered.len();

        match f(self) {
            Ok(value) => Ok(value),
            Err(e) => {
                let touched: Vec<Path> = self
                    .buffered
                    .drain(mark..)
                    .map(|applied| applied.path)
                    .collect();
                self.db.restore_image(image, &touched);
                self.savepoints.retain(|sp| sp.op_len <= mark);
                Err(e)
            }
        }
    }

    /// Consumes the transaction for commit.
    pub(crate) fn into_buffered(self) -> Vec<Applied> {
        self.buffered
    }

    /// Consumes the transaction for rollback, yielding the begin
    /// pre-image and the touched paths.
    pub(crate) fn into_rollback(self) -> (Value, Vec<Path>) {
        let touched = self
            .buffered
            .into_iter()
            .map(|applied| applied.path)
            .collect();
        (self.begin_image, touched)
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("buffered_ops", &self.buffered.len())
            .field("savepoints", &self.savepoints.len())
            .finish_non_exhaustive()
    }
}
