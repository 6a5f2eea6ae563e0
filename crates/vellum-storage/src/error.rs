//! Error types for the storage layer.
//!
//! This module defines all error types that can occur while allocating,
//! translating and mutating nodes.

use thiserror::Error;
use vellum_common::types::Ref;
use vellum_common::ErrorCode;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Allocation could not be satisfied.
    #[error("out of memory: requested {requested} bytes (slab limit {limit})")]
    OutOfMemory {
        /// Requested size in bytes.
        requested: usize,
        /// Largest slab the allocator may create.
        limit: usize,
    },

    /// Accessor refers to a detached or replaced snapshot.
    #[error("stale accessor: {0}")]
    StaleAccessor(String),

    /// Mutation attempted on read-only memory or outside a write.
    #[error("wrong transaction state: {0}")]
    WrongTransactionState(String),

    /// Allocation size is zero or not a multiple of 8.
    #[error("invalid allocation size: {0}")]
    InvalidSize(usize),

    /// Ref does not name allocated storage.
    #[error("invalid ref: {0:?}")]
    InvalidRef(Ref),

    /// Column key does not name a column of the expected shape.
    #[error("invalid column key: {0}")]
    InvalidColumnKey(String),

    /// Value or accessor type disagrees with the stored type.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Expected type.
        expected: String,
        /// Found type.
        found: String,
    },

    /// Index past the end of a sequence.
    #[error("index {index} out of bounds (size {size})")]
    OutOfBounds {
        /// Requested index.
        index: usize,
        /// Sequence size.
        size: usize,
    },

    /// Null stored into a non-nullable collection.
    #[error("null not allowed in non-nullable collection")]
    NullNotAllowed,

    /// Key not present in a dictionary.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Node contents violate a structural invariant.
    #[error("corrupted node at {at:?}: {reason}")]
    Corrupted {
        /// Node where the violation was found.
        at: Ref,
        /// Description of the violation.
        reason: String,
    },

    /// Value too large for a single node.
    #[error("node too large: {size} bytes (max: {max})")]
    NodeTooLarge {
        /// Required size.
        size: usize,
        /// Maximum node size.
        max: usize,
    },
}

impl StorageError {
    /// Creates a corrupted node error.
    pub fn corrupted(at: Ref, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            at,
            reason: reason.into(),
        }
    }

    /// Creates a wrong transaction state error.
    pub fn wrong_state(msg: impl Into<String>) -> Self {
        Self::WrongTransactionState(msg.into())
    }

    /// Creates a stale accessor error.
    pub fn stale(msg: impl Into<String>) -> Self {
        Self::StaleAccessor(msg.into())
    }

    /// Creates a type mismatch error.
    pub fn type_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Creates an out of bounds error.
    pub fn out_of_bounds(index: usize, size: usize) -> Self {
        Self::OutOfBounds { index, size }
    }

    /// Returns the stable error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::OutOfMemory { .. } | Self::NodeTooLarge { .. } => ErrorCode::OutOfMemory,
            Self::StaleAccessor(_) => ErrorCode::StaleAccessor,
            Self::WrongTransactionState(_) => ErrorCode::WrongTransactionState,
            Self::InvalidSize(_) => ErrorCode::InvalidArgument,
            Self::InvalidRef(_) => ErrorCode::InvalidRef,
            Self::InvalidColumnKey(_) => ErrorCode::InvalidColumnKey,
            Self::TypeMismatch { .. } | Self::NullNotAllowed => ErrorCode::TypeMismatch,
            Self::OutOfBounds { .. } => ErrorCode::OutOfBounds,
            Self::KeyNotFound(_) => ErrorCode::KeyNotFound,
            Self::Corrupted { .. } => ErrorCode::Corrupted,
        }
    }

    /// Returns true if retrying after freeing resources may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }

    /// Returns true if this is a corruption error.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupted { .. } | Self::InvalidRef(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::OutOfMemory {
            requested: 4096,
            limit: 1024,
        };
        assert!(err.to_string().contains("4096"));
        assert_eq!(err.code(), ErrorCode::OutOfMemory);
        assert!(err.is_recoverable());

        let err = StorageError::corrupted(Ref::new(64), "offsets not increasing");
        assert!(err.to_string().contains("offsets not increasing"));
        assert!(err.is_corruption());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            StorageError::wrong_state("read only").code(),
            ErrorCode::WrongTransactionState
        );
        assert_eq!(
            StorageError::type_mismatch("Int", "String").code(),
            ErrorCode::TypeMismatch
        );
        assert_eq!(StorageError::stale("gone").code(), ErrorCode::StaleAccessor);
    }
}
