//! Destination for serialized nodes.

use vellum_common::types::Ref;

use crate::error::StorageResult;

/// Receives nodes serialized by [`Array::write`](super::Array::write).
///
/// Implementations decide where each node lands and return its new ref.
/// `data` always starts with a node header whose capacity field equals
/// `data.len()` rounded up to 8.
pub trait ArrayWriter {
    /// Stores one node and returns its ref.
    fn write_array(&mut self, data: &[u8]) -> StorageResult<Ref>;
}
