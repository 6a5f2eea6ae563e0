//! Stable error codes and the asynchronous `Status` value.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad class an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Errors without a more specific home.
    General,
    /// Ref allocation, translation and accessor validity.
    Allocator,
    /// Schema and value shape mismatches.
    Structural,
    /// Transaction lifecycle and versioning.
    Transaction,
    /// Transact-log decoding.
    Parse,
    /// Sync protocol and session handling.
    Protocol,
    /// Invalid configuration.
    Configuration,
    /// Operating system I/O.
    Io,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::General => "General",
            Self::Allocator => "Allocator",
            Self::Structural => "Structural",
            Self::Transaction => "Transaction",
            Self::Parse => "Parse",
            Self::Protocol => "Protocol",
            Self::Configuration => "Configuration",
            Self::Io => "I/O",
        };
        f.write_str(name)
    }
}

/// Error codes for categorizing errors.
///
/// These codes can be used for programmatic error handling and are
/// stable across versions. The high byte selects the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    // General errors (0x0000 - 0x00FF)
    /// No error.
    Ok = 0x0000,
    /// Unknown or unspecified error.
    Unknown = 0x0001,
    /// Internal error (bug).
    Internal = 0x0002,
    /// Operation not supported.
    NotSupported = 0x0003,
    /// Invalid argument provided.
    InvalidArgument = 0x0004,
    /// Operation was cancelled.
    Cancelled = 0x0005,
    /// Operation is not legal in the current state.
    IllegalOperation = 0x0006,

    // Allocator errors (0x0100 - 0x01FF)
    /// Allocation could not be satisfied.
    OutOfMemory = 0x0100,
    /// Accessor refers to memory of a detached or replaced snapshot.
    StaleAccessor = 0x0101,
    /// Mutation attempted outside a write transaction.
    WrongTransactionState = 0x0102,
    /// Ref does not name allocated storage.
    InvalidRef = 0x0103,

    // Structural errors (0x0200 - 0x02FF)
    /// Column key does not belong to the table.
    InvalidColumnKey = 0x0200,
    /// Value or accessor type disagrees with the stored column type.
    TypeMismatch = 0x0201,
    /// Object key not found.
    KeyNotFound = 0x0202,
    /// Object key already in use.
    KeyAlreadyUsed = 0x0203,
    /// Table name already used.
    TableNameInUse = 0x0204,
    /// Table does not exist.
    NoSuchTable = 0x0205,
    /// Index out of bounds.
    OutOfBounds = 0x0206,
    /// Persisted structure is corrupted.
    Corrupted = 0x0207,

    // Transaction errors (0x0300 - 0x03FF)
    /// Requested snapshot version is no longer available.
    BadVersion = 0x0300,
    /// File history type cannot be combined with the requested one.
    IncompatibleHistories = 0x0301,
    /// Write lock is held by another transaction.
    WriteLockBusy = 0x0302,
    /// History schema cannot be upgraded.
    IncompatibleHistorySchema = 0x0303,
    /// Commit could not be made durable.
    CommitFailed = 0x0304,

    // Parse errors (0x0400 - 0x04FF)
    /// Transact log is malformed or was rejected by its handler.
    BadTransactLog = 0x0400,
    /// Changeset received from the server could not be integrated.
    BadChangeset = 0x0401,

    // Protocol errors (0x0500 - 0x05FF)
    /// Connection-level protocol error.
    SyncConnectionFailed = 0x0500,
    /// Session-level protocol error.
    SyncSessionError = 0x0501,
    /// Protocol invariant violated by the peer.
    SyncProtocolInvariantFailed = 0x0502,
    /// Server requested a client reset.
    SyncClientResetRequired = 0x0503,
    /// Automatic client reset could not be completed.
    AutoClientResetFailed = 0x0504,
    /// Server rejected a write and compensated it.
    SyncCompensatingWrite = 0x0505,
    /// Sync permissions denied.
    SyncPermissionDenied = 0x0506,
    /// Access token expired or invalid.
    InvalidSession = 0x0507,
    /// Sync mode (PBS/FLX) mismatch.
    WrongSyncType = 0x0508,
    /// Connection closed by the peer.
    ConnectionClosed = 0x0509,

    // Configuration errors (0x0600 - 0x06FF)
    /// Configuration value is invalid.
    InvalidConfig = 0x0600,
    /// Server URL could not be parsed.
    InvalidServerUrl = 0x0601,

    // I/O errors (0x0700 - 0x07FF)
    /// File operation failed.
    FileOperationFailed = 0x0700,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(self) -> ErrorCategory {
        match (self as u16) >> 8 {
            0x01 => ErrorCategory::Allocator,
            0x02 => ErrorCategory::Structural,
            0x03 => ErrorCategory::Transaction,
            0x04 => ErrorCategory::Parse,
            0x05 => ErrorCategory::Protocol,
            0x06 => ErrorCategory::Configuration,
            0x07 => ErrorCategory::Io,
            _ => ErrorCategory::General,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Outcome of an operation reported asynchronously.
///
/// `Status` is the value handed to completion callbacks that run on a
/// different thread from the operation that triggered them, where a
/// `Result` cannot be propagated with `?`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{}", render(.code, .reason))]
pub struct Status {
    code: ErrorCode,
    reason: String,
}

impl Status {
    /// The successful status.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            code: ErrorCode::Ok,
            reason: String::new(),
        }
    }

    /// Creates a failure status.
    pub fn new(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Returns true if this status denotes success.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == ErrorCode::Ok
    }

    /// Returns the error code.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Returns the human-readable reason.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

fn render(code: &ErrorCode, reason: &str) -> String {
    if *code == ErrorCode::Ok {
        "OK".to_string()
    } else {
        format!("{code}: {reason}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_category() {
        assert_eq!(ErrorCode::OutOfMemory.category(), ErrorCategory::Allocator);
        assert_eq!(ErrorCode::TypeMismatch.category(), ErrorCategory::Structural);
        assert_eq!(ErrorCode::BadTransactLog.category(), ErrorCategory::Parse);
        assert_eq!(
            ErrorCode::SyncClientResetRequired.category(),
            ErrorCategory::Protocol
        );
        assert_eq!(ErrorCode::Cancelled.category(), ErrorCategory::General);
        assert_eq!(ErrorCode::StaleAccessor.as_u16(), 0x0101);
    }

    #[test]
    fn test_status() {
        let ok = Status::ok();
        assert!(ok.is_ok());
        assert_eq!(ok.to_string(), "OK");

        let status = Status::new(ErrorCode::ConnectionClosed, "peer went away");
        assert!(!status.is_ok());
        assert_eq!(status.code(), ErrorCode::ConnectionClosed);
        assert!(status.to_string().contains("peer went away"));

        let err: Box<dyn std::error::Error> = Box::new(status.clone());
        assert_eq!(err.to_string(), status.to_string());
    }
}
