//! # vellum-txn
//!
//! Snapshot transactions over the Vellum storage engine.
//!
//! This crate provides:
//!
//! - **Db**: the shared database object with its read-lock ring, write
//!   mutex, async commit worker and optional backing file
//! - **Transaction**: a read, write or frozen view of one version, with
//!   promotion, advance, commit and rollback
//! - **Object store**: tables, typed columns, objects, links with
//!   tombstones, and list, set and dictionary collections
//! - **Applier**: replays changesets onto a write transaction
//! - **Notifier**: per-table and per-collection change sets computed on a
//!   background worker
//!
//! ## Example
//!
//! ```rust
//! use vellum_common::config::DbConfig;
//! use vellum_common::types::{ColumnAttrs, ColumnType, Mixed};
//! use vellum_txn::Db;
//!
//! let db = Db::open(DbConfig::for_testing()).unwrap();
//! let mut reader = db.start_read(None).unwrap();
//!
//! let mut tr = db.start_write().unwrap();
//! let t = tr.add_table("people").unwrap();
//! let age = tr.add_column(t, ColumnType::Int, "age", ColumnAttrs::NONE).unwrap();
//! let k = tr.create_object(t).unwrap();
//! tr.set(t, age, k, 42i64).unwrap();
//! tr.commit().unwrap();
//!
//! assert!(reader.find_table("people").unwrap().is_none());
//! reader.advance_read(None, None).unwrap();
//! assert_eq!(reader.get(t, age, k).unwrap(), Mixed::Int(42));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod applier;
pub mod collection;
pub mod db;
pub mod error;
mod group;
pub mod notifier;
pub mod transaction;

pub use applier::{apply_changeset, InstructionApplier};
pub use db::{AsyncWriteHandle, CommitStage, Db, DbStats, Snapshot};
pub use error::{TxnError, TxnResult};
pub use notifier::{NotificationToken, NotifierCoordinator, ObserveTarget};
pub use transaction::{TransactStage, Transaction};
