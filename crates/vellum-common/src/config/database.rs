//! Database configuration structures.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::constants::{
    DEFAULT_MAX_INNER_SIZE, DEFAULT_MAX_LEAF_SIZE, DEFAULT_MAX_SLAB_BYTES, MIN_SLAB_SIZE,
};
use crate::types::HistoryType;

/// How commits are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    /// Snapshots live only in memory and vanish when the last `Db` handle
    /// is dropped.
    #[default]
    MemOnly,
    /// Every commit is written to `path` and synced before the commit
    /// returns (or before the async commit reports completion).
    Full,
}

/// Database configuration.
///
/// # Example
///
/// ```rust
/// use vellum_common::config::{DbConfig, Durability};
///
/// let config = DbConfig::default();
/// assert_eq!(config.durability, Durability::MemOnly);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    /// Persistence mode.
    pub durability: Durability,

    /// File backing the database. Required for `Durability::Full`.
    pub path: Option<PathBuf>,

    /// History kind requested by this handle.
    /// Default: `InRealm`
    pub history_type: HistoryType,

    /// Upper bound on a single slab of write-transaction memory.
    /// Default: 1 GB
    pub max_slab_bytes: usize,

    /// Size of the first slab; later slabs double.
    /// Default: 16 KB
    pub initial_slab_bytes: usize,

    /// Maximum number of elements in a B+Tree leaf.
    /// Default: 1000
    pub max_leaf_size: usize,

    /// Maximum number of children of a B+Tree inner node.
    /// Default: 1000
    pub max_inner_size: usize,

    /// Number of slots in the read-lock ring.
    /// Default: 64
    pub read_lock_slots: usize,

    /// Run commits requested through `async_commit` on a background worker.
    /// Default: true
    pub enable_async_commit: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            durability: Durability::MemOnly,
            path: None,
            history_type: HistoryType::InRealm,
            max_slab_bytes: DEFAULT_MAX_SLAB_BYTES,
            initial_slab_bytes: MIN_SLAB_SIZE,
            max_leaf_size: DEFAULT_MAX_LEAF_SIZE,
            max_inner_size: DEFAULT_MAX_INNER_SIZE,
            read_lock_slots: 64,
            enable_async_commit: true,
        }
    }
}

impl DbConfig {
    /// Creates an in-memory configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a file-backed configuration.
    #[must_use]
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            durability: Durability::Full,
            path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Creates a configuration with small nodes, so that tests exercise
    /// splits and merges with few elements.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            max_slab_bytes: 64 * 1024 * 1024,
            max_leaf_size: 4,
            max_inner_size: 4,
            read_lock_slots: 16,
            ..Default::default()
        }
    }

    /// Sets the history kind.
    #[must_use]
    pub fn with_history_type(mut self, history_type: HistoryType) -> Self {
        self.history_type = history_type;
        self
    }

    /// Sets the slab limit.
    #[must_use]
    pub fn with_max_slab_bytes(mut self, bytes: usize) -> Self {
        self.max_slab_bytes = bytes;
        self
    }

    /// Sets the leaf and inner node fan-out.
    #[must_use]
    pub fn with_node_sizes(mut self, leaf: usize, inner: usize) -> Self {
        self.max_leaf_size = leaf;
        self.max_inner_size = inner;
        self
    }

    /// Enables or disables the async commit worker.
    #[must_use]
    pub fn with_async_commit(mut self, enabled: bool) -> Self {
        self.enable_async_commit = enabled;
        self
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.durability == Durability::Full && self.path.is_none() {
            return Err("durability Full requires a path".to_string());
        }
        if self.max_leaf_size < 2 || self.max_inner_size < 2 {
            return Err("node fan-out must be at least 2".to_string());
        }
        if self.initial_slab_bytes == 0 || self.initial_slab_bytes % 8 != 0 {
            return Err("initial_slab_bytes must be a non-zero multiple of 8".to_string());
        }
        if self.max_slab_bytes < self.initial_slab_bytes {
            return Err("max_slab_bytes must be at least initial_slab_bytes".to_string());
        }
        if self.read_lock_slots == 0 {
            return Err("read_lock_slots must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(DbConfig::default().validate().is_ok());
        assert!(DbConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_full_durability_requires_path() {
        let mut config = DbConfig::default();
        config.durability = Durability::Full;
        assert!(config.validate().is_err());

        let config = DbConfig::with_path("/tmp/x.vellum");
        assert_eq!(config.durability, Durability::Full);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = DbConfig::new()
            .with_history_type(HistoryType::SyncClient)
            .with_node_sizes(1, 8);
        assert_eq!(config.history_type, HistoryType::SyncClient);
        assert!(config.validate().is_err());
    }
}
