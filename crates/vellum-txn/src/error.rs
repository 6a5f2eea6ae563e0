//! Error types for the transaction layer.
//!
//! Transaction errors unwind to the transaction boundary: after an error
//! the caller must not assume that any part of the failed operation was
//! applied, and a failed write is normally rolled back.

use thiserror::Error;
use vellum_common::types::{ObjKey, TableKey};
use vellum_common::{ErrorCode, Status};
use vellum_replication::{ParseError, ReplicationError};
use vellum_storage::StorageError;

use crate::transaction::TransactStage;

/// Result type for transaction operations.
pub type TxnResult<T> = Result<T, TxnError>;

/// Errors that can occur in transaction operations.
#[derive(Debug, Error)]
pub enum TxnError {
    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Replication or history error.
    #[error("replication error: {0}")]
    Replication(#[from] ReplicationError),

    /// Operation not legal in the transaction's current stage.
    #[error("wrong transaction state: expected {expected}, was {actual}")]
    WrongTransactionState {
        /// Stage(s) the operation needs.
        expected: &'static str,
        /// Stage the transaction was in.
        actual: TransactStage,
    },

    /// Operation not permitted in this configuration.
    #[error("illegal operation: {0}")]
    IllegalOperation(String),

    /// Requested snapshot is no longer pinned.
    #[error("version {0} is not available")]
    BadVersion(u64),

    /// The non-blocking write lock attempt failed.
    #[error("write lock is held by another transaction")]
    WriteLockBusy,

    /// Table does not exist.
    #[error("no such table: {0}")]
    NoSuchTable(String),

    /// Table name already taken.
    #[error("table name in use: {0}")]
    TableNameInUse(String),

    /// Object does not exist.
    #[error("no object {key} in table {table}")]
    KeyNotFound {
        /// Table searched.
        table: TableKey,
        /// Missing key.
        key: ObjKey,
    },

    /// Object key already taken.
    #[error("object key {key} already used in table {table}")]
    KeyAlreadyUsed {
        /// Table.
        table: TableKey,
        /// Duplicate key.
        key: ObjKey,
    },

    /// Column key unknown or of the wrong shape.
    #[error("invalid column key: {0}")]
    InvalidColumnKey(String),

    /// Value or accessor type disagrees with the column type.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Expected type.
        expected: String,
        /// Found type.
        found: String,
    },

    /// Commit could not be made durable.
    #[error("commit failed: {0}")]
    CommitFailed(String),

    /// Database file is malformed.
    #[error("file corrupted: {0}")]
    Corrupted(String),

    /// Configuration rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// File I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation was cancelled before it started.
    #[error("operation cancelled")]
    Cancelled,
}

impl From<ParseError> for TxnError {
    fn from(e: ParseError) -> Self {
        Self::Replication(ReplicationError::Parse(e))
    }
}

impl TxnError {
    /// Creates a wrong stage error.
    pub fn wrong_stage(expected: &'static str, actual: TransactStage) -> Self {
        Self::WrongTransactionState { expected, actual }
    }

    /// Creates an illegal operation error.
    pub fn illegal(msg: impl Into<String>) -> Self {
        Self::IllegalOperation(msg.into())
    }

    /// Creates a type mismatch error.
    pub fn type_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Creates an invalid column error.
    pub fn invalid_column(msg: impl Into<String>) -> Self {
        Self::InvalidColumnKey(msg.into())
    }

    /// Returns the stable error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Storage(e) => e.code(),
            Self::Replication(e) => e.code(),
            Self::WrongTransactionState { .. } => ErrorCode::WrongTransactionState,
            Self::IllegalOperation(_) => ErrorCode::IllegalOperation,
            Self::BadVersion(_) => ErrorCode::BadVersion,
            Self::WriteLockBusy => ErrorCode::WriteLockBusy,
            Self::NoSuchTable(_) => ErrorCode::NoSuchTable,
            Self::TableNameInUse(_) => ErrorCode::TableNameInUse,
            Self::KeyNotFound { .. } => ErrorCode::KeyNotFound,
            Self::KeyAlreadyUsed { .. } => ErrorCode::KeyAlreadyUsed,
            Self::InvalidColumnKey(_) => ErrorCode::InvalidColumnKey,
            Self::TypeMismatch { .. } => ErrorCode::TypeMismatch,
            Self::CommitFailed(_) => ErrorCode::CommitFailed,
            Self::Corrupted(_) => ErrorCode::Corrupted,
            Self::InvalidConfig(_) => ErrorCode::InvalidConfig,
            Self::Io(_) => ErrorCode::FileOperationFailed,
            Self::Cancelled => ErrorCode::Cancelled,
        }
    }

    /// Returns true if retrying the operation may succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::WriteLockBusy | Self::BadVersion(_) => true,
            Self::Storage(e) => e.is_recoverable(),
            _ => false,
        }
    }

    /// Converts into a `Status` for delivery through a callback.
    pub fn to_status(&self) -> Status {
        Status::new(self.code(), self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(TxnError::BadVersion(3).code(), ErrorCode::BadVersion);
        assert_eq!(
            TxnError::from(ParseError::UnexpectedEnd).code(),
            ErrorCode::BadTransactLog
        );
        let err = TxnError::wrong_stage("Writing", TransactStage::Reading);
        assert_eq!(err.code(), ErrorCode::WrongTransactionState);
        assert!(err.to_string().contains("Reading"));
    }

    #[test]
    fn test_recoverable_and_status() {
        assert!(TxnError::WriteLockBusy.is_recoverable());
        assert!(!TxnError::illegal("no history").is_recoverable());

        let status = TxnError::CommitFailed("disk full".into()).to_status();
        assert_eq!(status.code(), ErrorCode::CommitFailed);
        assert!(status.reason().contains("disk full"));
    }
}
