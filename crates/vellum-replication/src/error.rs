//! Error types for the replication layer.

use thiserror::Error;
use vellum_common::types::HistoryType;
use vellum_common::ErrorCode;

/// Result type for transact-log parsing.
pub type ParseResult<T> = Result<T, ParseError>;

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// A malformed or rejected transact log. Always fatal: the parse stops at
/// the first error and nothing after it is applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Input ended inside an instruction.
    #[error("unexpected end of transact log")]
    UnexpectedEnd,

    /// Integer encoding is longer than any 64-bit value needs.
    #[error("bad varint at byte {offset}")]
    BadVarint {
        /// Position in the stream.
        offset: usize,
    },

    /// Integer does not fit the operand it encodes.
    #[error("operand out of range: {0}")]
    OutOfRange(i64),

    /// Unknown instruction tag.
    #[error("unknown instruction tag {0}")]
    UnknownInstruction(u8),

    /// Unknown value type tag.
    #[error("unknown value type {0}")]
    UnknownValueType(i64),

    /// String index that was never interned.
    #[error("string index {0} was not interned")]
    BadStringIndex(u64),

    /// String payload is not UTF-8.
    #[error("invalid UTF-8 in string operand")]
    BadString,

    /// The handler returned false.
    #[error("instruction {0} rejected by handler")]
    Rejected(&'static str),
}

impl ParseError {
    /// Returns the stable error code.
    pub fn code(&self) -> ErrorCode {
        ErrorCode::BadTransactLog
    }

    /// Parse errors are never recoverable.
    pub fn is_fatal(&self) -> bool {
        true
    }
}

/// Errors that can occur while recording or managing history.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// Transact log could not be parsed.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Operation called outside of a write transaction.
    #[error("replication not in a write transaction: {0}")]
    NotInTransaction(String),

    /// Stored history type cannot be opened with the requested one.
    #[error("incompatible histories: file has {stored:?}, requested {requested:?}")]
    IncompatibleHistories {
        /// Type recorded in the file.
        stored: HistoryType,
        /// Type requested by the opener.
        requested: HistoryType,
    },

    /// Stored history schema version cannot be upgraded.
    #[error("history schema version {found} cannot be upgraded to {supported}")]
    IncompatibleHistorySchema {
        /// Version found in the file.
        found: u32,
        /// Version this build writes.
        supported: u32,
    },
}

impl ReplicationError {
    /// Creates a not-in-transaction error.
    pub fn not_in_transaction(msg: impl Into<String>) -> Self {
        Self::NotInTransaction(msg.into())
    }

    /// Returns the stable error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Parse(e) => e.code(),
            Self::NotInTransaction(_) => ErrorCode::WrongTransactionState,
            Self::IncompatibleHistories { .. } => ErrorCode::IncompatibleHistories,
            Self::IncompatibleHistorySchema { .. } => ErrorCode::IncompatibleHistorySchema,
        }
    }

    /// Returns true if this error stems from a malformed log.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Parse(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_errors_are_fatal() {
        let err = ParseError::Rejected("create_object");
        assert!(err.is_fatal());
        assert_eq!(err.code(), ErrorCode::BadTransactLog);
        assert!(err.to_string().contains("create_object"));

        let err: ReplicationError = ParseError::UnexpectedEnd.into();
        assert!(err.is_fatal());
        assert_eq!(err.code(), ErrorCode::BadTransactLog);
    }

    #[test]
    fn test_history_errors() {
        let err = ReplicationError::IncompatibleHistories {
            stored: HistoryType::SyncClient,
            requested: HistoryType::InRealm,
        };
        assert_eq!(err.code(), ErrorCode::IncompatibleHistories);
        assert!(!err.is_fatal());
    }
}
