//! # dotdb core
//!
//! An embedded, single-file JSON document store.
//!
//! The on-disk representation is a JSON tree (optionally an encrypted
//! envelope); the in-memory representation is a mutable tree of dynamic
//! values addressed by dot-separated paths (`users.alice.email`).
//!
//! This crate provides:
//! - Path-addressed mutations (`set`/`get`/`delete`/`push`/`pull`/`add`)
//! - A group-commit WAL with `none`/`lazy`/`batched`/`sync` durability
//! - Crash recovery: snapshot load plus WAL tail replay with torn-tail
//!   truncation
//! - Equality indexes with persisted sidecars
//! - Schema shape validation on writes
//! - A multi-process advisory file lock
//! - Transactions with savepoints
//! - Subscriptions and middleware hooks
//! - Parallel filter / aggregate / hash-join execution over collections
//! - Optional AES-256-GCM encryption of the snapshot
//!
//! ## Usage
//!
//! ```rust,ignore
//! use dotdb_core::{Database, Options, Value};
//!
//! let db = Database::open_with_options("app.db", Options::new().wal(true))?;
//! db.set("users.alice", dotdb_codec::from_json(r#"{"email":"a@x"}"#)?)?;
//! let alice = db.get("users.alice")?;
//! db.close()?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod crypto;
mod database;
mod error;
mod events;
mod executor;
mod index;
mod lock;
mod schema;
mod snapshot;
mod transaction;
mod tree;
mod types;
mod wal;

pub use config::{Durability, IndexSpec, LockMode, Options};
pub use database::{Database, WalStatus};
pub use error::{CoreError, CoreResult};
pub use events::{Method, SubscriptionId};
pub use executor::{worker_count, Aggregate, Filter, FilterOp};
pub use schema::{Schema, SchemaType};
pub use transaction::{BatchOp, Transaction};
pub use types::Lsn;
pub use wal::{WalOp, WalRecord};

pub use dotdb_codec::{from_json, to_json, to_json_pretty, Map, Path, Value};
