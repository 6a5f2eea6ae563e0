//! Automatic client reset.
//!
//! When the server can no longer continue the history of a client file,
//! the client downloads a fresh copy of the server state into a shadow
//! database and then rewrites the local database in one write transaction:
//! every table is cleared, the fresh changesets are applied, and in the
//! recovery modes the local changes the server never acknowledged are
//! replayed on top. A failed recovery rolls the whole transaction back.

use bytes::{Bytes, BytesMut};
use tracing::{info, warn};
use vellum_common::config::ClientResyncMode;
use vellum_txn::{apply_changeset, Db, Transaction};

use crate::error::{SyncError, SyncResult};

/// Called with a frozen snapshot of the local state before the reset.
pub type BeforeResetHook = Box<dyn FnMut(&Transaction) + Send>;

/// Called with frozen snapshots from before and after the reset, and
/// whether local changes were recovered.
pub type AfterResetHook = Box<dyn FnMut(&Transaction, &Transaction, bool) + Send>;

/// Application hooks around a client reset.
#[derive(Default)]
pub struct ClientResetHooks {
    /// Runs before the local state is replaced.
    pub before: Option<BeforeResetHook>,
    /// Runs after the reset committed.
    pub after: Option<AfterResetHook>,
}

impl std::fmt::Debug for ClientResetHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientResetHooks")
            .field("before", &self.before.is_some())
            .field("after", &self.after.is_some())
            .finish()
    }
}

/// Result of a completed reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientResetOutcome {
    /// True if local changes were replayed.
    pub did_recover: bool,
    /// Local version produced by the reset.
    pub version: u64,
    /// Recovered changes, to be uploaded as one changeset.
    pub recovered: Option<Bytes>,
}

/// Mode after applying a server request to skip recovery.
#[must_use]
pub fn effective_mode(mode: ClientResyncMode, recovery_disabled: bool) -> ClientResyncMode {
    match (mode, recovery_disabled) {
        (ClientResyncMode::RecoverOrDiscard, true) => ClientResyncMode::DiscardLocal,
        (mode, _) => mode,
    }
}

fn rewrite(db: &Db, fresh: &[Bytes], local: &[Bytes]) -> SyncResult<u64> {
    let mut tr = db.start_write()?;
    for table in tr.table_keys()? {
        tr.clear_table(table)?;
    }
    for changeset in fresh.iter().chain(local) {
        apply_changeset(&mut tr, changeset)?;
    }
    Ok(tr.commit()?)
}

/// Replaces the local state of `db` with `fresh`, replaying `local` in the
/// recovery modes.
///
/// `recovery_disabled` is set when the server forbids recovery; in
/// `Recover` mode that makes the reset fail.
pub fn perform_client_reset(
    db: &Db,
    mode: ClientResyncMode,
    recovery_disabled: bool,
    fresh: &[Bytes],
    local: &[Bytes],
    hooks: &mut ClientResetHooks,
) -> SyncResult<ClientResetOutcome> {
    let mode = effective_mode(mode, recovery_disabled);
    match mode {
        ClientResyncMode::Manual => {
            return Err(SyncError::illegal(
                "manual client reset must be performed by the application",
            ))
        }
        ClientResyncMode::Recover if recovery_disabled => {
            return Err(SyncError::ClientResetFailed(
                "the server disabled recovery of local changes".into(),
            ))
        }
        _ => {}
    }

    let before = db.start_frozen(None)?;
    if let Some(hook) = hooks.before.as_mut() {
        hook(&before);
    }

    let recover = matches!(
        mode,
        ClientResyncMode::Recover | ClientResyncMode::RecoverOrDiscard
    ) && !local.is_empty();
    info!(
        ?mode,
        fresh = fresh.len(),
        local = local.len(),
        "performing client reset"
    );

    let (version, did_recover) = if recover {
        match rewrite(db, fresh, local) {
            Ok(version) => (version, true),
            Err(e) if mode == ClientResyncMode::RecoverOrDiscard => {
                warn!(error = %e, "recovery failed, discarding local changes");
                (rewrite(db, fresh, &[])?, false)
            }
            Err(e) => {
                return Err(SyncError::ClientResetFailed(format!(
                    "recovering local changes failed: {e}"
                )))
            }
        }
    } else {
        (rewrite(db, fresh, &[])?, false)
    };

    let recovered = did_recover.then(|| {
        let mut joined = BytesMut::new();
        for changeset in local {
            joined.extend_from_slice(changeset);
        }
        joined.freeze()
    });

    let after = db.start_frozen(Some(version))?;
    if let Some(hook) = hooks.after.as_mut() {
        hook(&before, &after, did_recover);
    }
    info!(version, did_recover, "client reset complete");
    Ok(ClientResetOutcome {
        did_recover,
        version,
        recovered,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use vellum_common::config::DbConfig;
    use vellum_common::types::{ColumnAttrs, ColumnType, Mixed, ObjKey, TableKey};
    use vellum_common::ColKey;

    struct Fixture {
        local: Db,
        table: TableKey,
        value: ColKey,
        fresh: Vec<Bytes>,
    }

    /// Server state: objects 1 and 2. The local copy also holds object 9.
    fn fixture() -> Fixture {
        let server = Db::open(DbConfig::for_testing()).unwrap();
        let pin = server.start_read(None).unwrap();
        let mut w = server.start_write().unwrap();
        let table = w.add_table("items").unwrap();
        let value = w
            .add_column(table, ColumnType::Int, "value", ColumnAttrs::NONE)
            .unwrap();
        for k in [1, 2] {
            w.create_object_with_key(table, ObjKey::new(k)).unwrap();
            w.set(table, value, ObjKey::new(k), k * 10).unwrap();
        }
        w.commit().unwrap();
        let fresh: Vec<Bytes> = server
            .start_read(None)
            .unwrap()
            .changesets_since(pin.version())
            .unwrap()
            .into_iter()
            .map(|(_, c)| c)
            .collect();
        drop(pin);

        let local = Db::open(DbConfig::for_testing()).unwrap();
        let mut w = local.start_write().unwrap();
        for changeset in &fresh {
            apply_changeset(&mut w, changeset).unwrap();
        }
        w.create_object_with_key(table, ObjKey::new(9)).unwrap();
        w.commit().unwrap();
        Fixture {
            local,
            table,
            value,
            fresh,
        }
    }

    fn local_change(f: &Fixture, edit: impl FnOnce(&mut Transaction)) -> Bytes {
        let pin = f.local.start_read(None).unwrap();
        let mut w = f.local.start_write().unwrap();
        edit(&mut w);
        w.commit().unwrap();
        f.local
            .start_read(None)
            .unwrap()
            .changesets_since(pin.version())
            .unwrap()
            .pop()
            .map(|(_, c)| c)
            .unwrap()
    }

    #[test]
    fn test_discard_local_replaces_state() {
        let f = fixture();
        let (t, v) = (f.table, f.value);
        let local = local_change(&f, |w| {
            w.set(t, v, ObjKey::new(1), 99i64).unwrap();
        });

        let outcome = perform_client_reset(
            &f.local,
            ClientResyncMode::DiscardLocal,
            false,
            &f.fresh,
            &[local],
            &mut ClientResetHooks::default(),
        )
        .unwrap();
        assert!(!outcome.did_recover);
        assert!(outcome.recovered.is_none());

        let r = f.local.start_read(None).unwrap();
        assert_eq!(r.object_keys(t).unwrap(), vec![ObjKey::new(1), ObjKey::new(2)]);
        assert_eq!(r.get(t, v, ObjKey::new(1)).unwrap(), Mixed::Int(10));
    }

    #[test]
    fn test_recover_replays_local_changes() {
        let f = fixture();
        let (t, v) = (f.table, f.value);
        let local = local_change(&f, |w| {
            w.set(t, v, ObjKey::new(2), 77i64).unwrap();
        });

        let calls = Arc::new(Mutex::new(Vec::new()));
        let (c1, c2) = (Arc::clone(&calls), Arc::clone(&calls));
        let mut hooks = ClientResetHooks {
            before: Some(Box::new(move |before: &Transaction| {
                c1.lock().push(format!("before:{}", before.table_size(t).unwrap()));
            })),
            after: Some(Box::new(move |_: &Transaction, after: &Transaction, recovered| {
                c2.lock()
                    .push(format!("after:{}:{recovered}", after.table_size(t).unwrap()));
            })),
        };

        let outcome = perform_client_reset(
            &f.local,
            ClientResyncMode::Recover,
            false,
            &f.fresh,
            &[local.clone()],
            &mut hooks,
        )
        .unwrap();
        assert!(outcome.did_recover);
        assert_eq!(outcome.recovered, Some(local));
        assert_eq!(*calls.lock(), vec!["before:3", "after:2:true"]);

        let r = f.local.start_read(None).unwrap();
        assert_eq!(r.get(t, v, ObjKey::new(2)).unwrap(), Mixed::Int(77));
        assert!(!r.has_object(t, ObjKey::new(9)).unwrap());
    }

    #[test]
    fn test_failed_recovery() {
        let f = fixture();
        let (t, v) = (f.table, f.value);
        // edits an object the server never had
        let local = local_change(&f, |w| {
            w.set(t, v, ObjKey::new(9), 1i64).unwrap();
        });

        let before = f.local.latest_version();
        let err = perform_client_reset(
            &f.local,
            ClientResyncMode::Recover,
            false,
            &f.fresh,
            &[local.clone()],
            &mut ClientResetHooks::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::ClientResetFailed(_)));
        assert_eq!(f.local.latest_version(), before);

        let outcome = perform_client_reset(
            &f.local,
            ClientResyncMode::RecoverOrDiscard,
            false,
            &f.fresh,
            &[local],
            &mut ClientResetHooks::default(),
        )
        .unwrap();
        assert!(!outcome.did_recover);
        let r = f.local.start_read(None).unwrap();
        assert_eq!(r.table_size(t).unwrap(), 2);
    }

    #[test]
    fn test_disabled_recovery() {
        assert_eq!(
            effective_mode(ClientResyncMode::RecoverOrDiscard, true),
            ClientResyncMode::DiscardLocal
        );
        let f = fixture();
        let err = perform_client_reset(
            &f.local,
            ClientResyncMode::Recover,
            true,
            &f.fresh,
            &[],
            &mut ClientResetHooks::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::ClientResetFailed(_)));

        let manual = perform_client_reset(
            &f.local,
            ClientResyncMode::Manual,
            false,
            &f.fresh,
            &[],
            &mut ClientResetHooks::default(),
        );
        assert!(manual.is_err());
    }
}
