//! # vellum-replication
//!
//! Transact logs and sync bookkeeping for Vellum.
//!
//! Every mutation of a write transaction is encoded into a compact
//! instruction stream, the changeset. The same stream drives rollback
//! observation, change notifications and the sync protocol.
//!
//! - **Codec**: [`TransactLogEncoder`] and [`TransactLogParser`] over
//!   varint operands, with interned table and column names
//! - **Handlers**: the [`InstructionHandler`] trait, a recording handler, a
//!   null observer and a tracing observer
//! - **Reverser**: [`TransactReverser`] replays the inverse of a changeset
//! - **Replication**: per-transaction recording with selection tracking
//! - **History**: history type rules and schema migration hooks
//! - **Cursors**: [`DownloadCursor`], [`UploadCursor`] and [`SyncProgress`]
//!
//! ## Example
//!
//! ```rust
//! use vellum_common::types::{HistoryType, ObjKey, TableKey};
//! use vellum_replication::{parse_changeset, RecordingHandler, Replication};
//!
//! let mut repl = Replication::new(HistoryType::InRealm);
//! repl.initiate_transact(0);
//! repl.create_object(TableKey::new(0), ObjKey::new(1));
//! let changeset = repl.prepare_commit().unwrap();
//!
//! let mut rec = RecordingHandler::new();
//! parse_changeset(&changeset, &mut rec).unwrap();
//! assert_eq!(rec.instructions.len(), 2);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cursor;
pub mod encoder;
pub mod error;
pub mod handler;
pub mod history;
pub mod instruction;
pub mod parser;
pub mod replication;
pub mod reverser;
pub mod varint;

pub use cursor::{DownloadCursor, SaltedVersion, SyncProgress, UploadCursor};
pub use encoder::TransactLogEncoder;
pub use error::{ParseError, ParseResult, ReplicationError, ReplicationResult};
pub use handler::{
    dispatch, InstructionHandler, LoggingObserver, NullInstructionObserver, RecordingHandler,
};
pub use history::{resolve_history_type, upgrade_history_schema, HistoryMigration, NoMigration};
pub use instruction::{Instruction, InstructionTag};
pub use parser::{
    parse_changeset, ChangesetInputStream, InputStream, SimpleInputStream, TransactLogParser,
};
pub use replication::Replication;
pub use reverser::TransactReverser;
