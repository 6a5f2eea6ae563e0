//! History type and schema compatibility.
//!
//! A file records which kind of history it carries and the schema version
//! of that history. Opening a file checks both: the history kind can be
//! adopted once but never changed, and an older schema is only accepted if
//! a [`HistoryMigration`] knows how to upgrade it.

use std::fmt;

use tracing::info;
use vellum_common::constants::HISTORY_SCHEMA_VERSION;
use vellum_common::types::HistoryType;

use crate::error::{ReplicationError, ReplicationResult};

/// Upgrades stored history entries between schema versions.
pub trait HistoryMigration: Send + Sync + fmt::Debug {
    /// Returns true if entries written at schema `from` can be brought to
    /// schema `to`.
    fn is_upgradable(&self, from: u32, to: u32) -> bool;

    /// Rewrites `entries` from schema `from` to schema `to` in place.
    fn upgrade(&self, from: u32, to: u32, entries: &mut Vec<Vec<u8>>) -> ReplicationResult<()>;
}

/// Accepts only the current schema.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMigration;

impl HistoryMigration for NoMigration {
    fn is_upgradable(&self, from: u32, to: u32) -> bool {
        from == to
    }

    fn upgrade(&self, from: u32, to: u32, _entries: &mut Vec<Vec<u8>>) -> ReplicationResult<()> {
        if from == to {
            Ok(())
        } else {
            Err(ReplicationError::IncompatibleHistorySchema {
                found: from,
                supported: to,
            })
        }
    }
}

/// Decides which history type a file is opened with.
///
/// A file without history adopts the requested type; otherwise the types
/// must match.
pub fn resolve_history_type(
    stored: HistoryType,
    requested: HistoryType,
) -> ReplicationResult<HistoryType> {
    if requested == HistoryType::None && stored != HistoryType::None {
        // Opening without replication leaves the stored history alone
        return Ok(stored);
    }
    if requested.is_compatible_with(stored) {
        Ok(requested)
    } else {
        Err(ReplicationError::IncompatibleHistories { stored, requested })
    }
}

/// Brings stored history entries to [`HISTORY_SCHEMA_VERSION`].
///
/// Returns true if the entries were rewritten. A schema newer than this
/// build knows is never accepted.
pub fn upgrade_history_schema(
    found: u32,
    entries: &mut Vec<Vec<u8>>,
    migration: &dyn HistoryMigration,
) -> ReplicationResult<bool> {
    if found == HISTORY_SCHEMA_VERSION {
        return Ok(false);
    }
    if found > HISTORY_SCHEMA_VERSION || !migration.is_upgradable(found, HISTORY_SCHEMA_VERSION) {
        return Err(ReplicationError::IncompatibleHistorySchema {
            found,
            supported: HISTORY_SCHEMA_VERSION,
        });
    }
    migration.upgrade(found, HISTORY_SCHEMA_VERSION, entries)?;
    info!(
        from = found,
        to = HISTORY_SCHEMA_VERSION,
        entries = entries.len(),
        "history schema upgraded"
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct PrefixMigration;

    impl HistoryMigration for PrefixMigration {
        fn is_upgradable(&self, from: u32, to: u32) -> bool {
            from + 1 == to
        }

        fn upgrade(&self, _from: u32, _to: u32, entries: &mut Vec<Vec<u8>>) -> ReplicationResult<()> {
            for e in entries.iter_mut() {
                e.insert(0, 0xAA);
            }
            Ok(())
        }
    }

    #[test]
    fn test_history_type_rules() {
        use HistoryType::*;
        assert_eq!(resolve_history_type(None, InRealm).unwrap(), InRealm);
        assert_eq!(resolve_history_type(InRealm, InRealm).unwrap(), InRealm);
        assert_eq!(resolve_history_type(SyncClient, None).unwrap(), SyncClient);
        let err = resolve_history_type(SyncClient, InRealm).unwrap_err();
        assert!(matches!(
            err,
            ReplicationError::IncompatibleHistories {
                stored: SyncClient,
                requested: InRealm
            }
        ));
    }

    #[test]
    fn test_schema_upgrade_through_hook() {
        let mut entries = vec![vec![1], vec![2, 3]];
        assert!(!upgrade_history_schema(HISTORY_SCHEMA_VERSION, &mut entries, &NoMigration).unwrap());

        let old = HISTORY_SCHEMA_VERSION - 1;
        assert!(upgrade_history_schema(old, &mut entries, &NoMigration).is_err());
        assert!(upgrade_history_schema(old, &mut entries, &PrefixMigration).unwrap());
        assert_eq!(entries, vec![vec![0xAA, 1], vec![0xAA, 2, 3]]);

        let err = upgrade_history_schema(HISTORY_SCHEMA_VERSION + 1, &mut entries, &PrefixMigration)
            .unwrap_err();
        assert!(matches!(err, ReplicationError::IncompatibleHistorySchema { .. }));
    }
}
