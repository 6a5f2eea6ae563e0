//! Transactions.
//!
//! A [`Transaction`] is bound to one snapshot at a time through a read
//! lock. Its stage moves along
//!
//! ```text
//! Ready ◀──end_read── Reading ──promote_to_write──▶ Writing
//!                      │  ▲                           │
//!                      │  └── commit_and_continue_as_read / rollback_and_continue_as_read
//!                      ▼
//!                    Frozen (never promotes, never advances)
//! ```
//!
//! Reading and frozen transactions see exactly their snapshot. A writing
//! transaction sees its own uncommitted changes; nodes it modifies are
//! copied into private slab memory and only become visible to others when
//! the commit publishes a new snapshot.

mod data;
mod hook;

pub(crate) use hook::ReplicationHook;

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace, warn};
use vellum_common::types::{HistoryType, VersionId};
use vellum_replication::{
    parse_changeset, ChangesetInputStream, InstructionHandler, Replication, TransactLogParser,
    TransactReverser,
};
use vellum_storage::SlabAlloc;

use crate::db::{
    AsyncWriteHandle, CommitCallback, CommitMode, Db, Snapshot, WriteGrantCallback,
};
use crate::error::{TxnError, TxnResult};
use crate::group::Group;

/// Lifecycle stage of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactStage {
    /// Not bound to any snapshot.
    Ready,
    /// Bound to a snapshot, read-only.
    Reading,
    /// Holding the write lock with uncommitted changes.
    Writing,
    /// Bound to one snapshot forever.
    Frozen,
}

impl fmt::Display for TransactStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ready => "Ready",
            Self::Reading => "Reading",
            Self::Writing => "Writing",
            Self::Frozen => "Frozen",
        };
        f.write_str(name)
    }
}

/// A transaction on a [`Db`].
pub struct Transaction {
    db: Db,
    id: u64,
    stage: TransactStage,
    version: VersionId,
    snapshot: Snapshot,
    alloc: SlabAlloc,
    group: Group,
    repl: Option<Replication>,
    read_lock_held: bool,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("stage", &self.stage)
            .field("version", &self.version)
            .finish()
    }
}

impl Transaction {
    pub(crate) fn new(
        db: Db,
        version: VersionId,
        snapshot: Snapshot,
        stage: TransactStage,
    ) -> TxnResult<Self> {
        let id = db.inner().next_txn_id();
        Self::bind(db, id, version, snapshot, stage)
    }

    /// Wraps a read lock taken by a caller that already holds the write
    /// lock as `id`.
    pub(crate) fn new_writing(db: Db, id: u64, version: VersionId, snapshot: Snapshot) -> TxnResult<Self> {
        let mut tr = Self::bind(db, id, version, snapshot, TransactStage::Reading)?;
        tr.begin_write();
        Ok(tr)
    }

    fn bind(
        db: Db,
        id: u64,
        version: VersionId,
        snapshot: Snapshot,
        stage: TransactStage,
    ) -> TxnResult<Self> {
        let inner = Arc::clone(db.inner());
        let mut alloc = SlabAlloc::new(inner.slab_config());
        alloc.attach(Arc::clone(&snapshot.mapping), false);
        let group = match Group::attach(&alloc, snapshot.top_ref, inner.tree_config()) {
            Ok(g) => g,
            Err(e) => {
                inner.release_read_lock(version);
                inner.release_write(id);
                return Err(e);
            }
        };
        let history_type = inner.history_type();
        let repl = (history_type != HistoryType::None).then(|| Replication::new(history_type));
        trace!(id, version = version.version, %stage, "transaction bound");
        Ok(Self {
            db,
            id,
            stage,
            version,
            snapshot,
            alloc,
            group,
            repl,
            read_lock_held: true,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Current stage.
    pub fn stage(&self) -> TransactStage {
        self.stage
    }

    /// Version of the bound snapshot.
    pub fn version(&self) -> u64 {
        self.version.version
    }

    /// Read lock of the bound snapshot.
    pub fn version_id(&self) -> VersionId {
        self.version
    }

    /// Returns true for frozen transactions.
    pub fn is_frozen(&self) -> bool {
        self.stage == TransactStage::Frozen
    }

    /// The database this transaction belongs to.
    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Bytes recorded by the running write, empty outside a write.
    pub fn uncommitted_changes(&self) -> &[u8] {
        match (&self.repl, self.stage) {
            (Some(repl), TransactStage::Writing) => repl.get_uncommitted_changes(),
            _ => &[],
        }
    }

    pub(crate) fn read_parts(&self) -> TxnResult<(&SlabAlloc, &Group)> {
        match self.stage {
            TransactStage::Reading | TransactStage::Writing | TransactStage::Frozen => {
                Ok((&self.alloc, &self.group))
            }
            TransactStage::Ready => Err(TxnError::wrong_stage(
                "Reading, Writing or Frozen",
                self.stage,
            )),
        }
    }

    pub(crate) fn write_parts(
        &mut self,
    ) -> TxnResult<(&mut SlabAlloc, &mut Group, Option<&mut Replication>)> {
        self.check_writing()?;
        Ok((&mut self.alloc, &mut self.group, self.repl.as_mut()))
    }

    fn check_writing(&self) -> TxnResult<()> {
        if self.stage == TransactStage::Writing {
            Ok(())
        } else {
            Err(TxnError::wrong_stage("Writing", self.stage))
        }
    }

    fn check_reading(&self, op: &str) -> TxnResult<()> {
        match self.stage {
            TransactStage::Reading => Ok(()),
            TransactStage::Frozen => Err(TxnError::illegal(format!(
                "{op} is not allowed on a frozen transaction"
            ))),
            stage => Err(TxnError::wrong_stage("Reading", stage)),
        }
    }

    // =========================================================================
    // Stage transitions
    // =========================================================================

    /// Ends the transaction, rolling back a running write.
    pub fn end_read(&mut self) -> TxnResult<()> {
        match self.stage {
            TransactStage::Ready => return Ok(()),
            TransactStage::Writing => self.rollback_and_continue_as_read(None)?,
            TransactStage::Reading | TransactStage::Frozen => {}
        }
        self.release_read_lock();
        self.alloc.detach();
        self.stage = TransactStage::Ready;
        trace!(id = self.id, "transaction ended");
        Ok(())
    }

    fn release_read_lock(&mut self) {
        if self.read_lock_held {
            self.db.inner().release_read_lock(self.version);
            self.read_lock_held = false;
        }
    }

    fn begin_write(&mut self) {
        self.alloc.set_writable(true);
        if let Some(repl) = self.repl.as_mut() {
            repl.initiate_transact(self.version.version);
        }
        self.stage = TransactStage::Writing;
        debug!(id = self.id, version = self.version.version, "write started");
    }

    /// Takes the write lock, advances to the latest version and starts
    /// writing. Changes committed since the bound version are reported to
    /// `observer`.
    pub fn promote_to_write(&mut self, observer: Option<&mut dyn InstructionHandler>) -> TxnResult<()> {
        self.check_promotable()?;
        let inner = Arc::clone(self.db.inner());
        inner.acquire_write(self.id);
        self.finish_promotion(observer)
    }

    /// Like [`Transaction::promote_to_write`] but returns false instead of
    /// blocking when another transaction writes.
    pub fn try_promote_to_write(&mut self) -> TxnResult<bool> {
        self.check_promotable()?;
        if !self.db.inner().try_acquire_write(self.id) {
            return Ok(false);
        }
        self.finish_promotion(None)?;
        Ok(true)
    }

    fn check_promotable(&self) -> TxnResult<()> {
        self.check_reading("promote_to_write")?;
        if self.repl.is_none() {
            return Err(TxnError::illegal(
                "promote_to_write requires a history; use Db::start_write",
            ));
        }
        Ok(())
    }

    fn finish_promotion(&mut self, observer: Option<&mut dyn InstructionHandler>) -> TxnResult<()> {
        if let Err(e) = self.advance_to(observer, None) {
            self.db.inner().release_write(self.id);
            return Err(e);
        }
        self.begin_write();
        Ok(())
    }

    /// Moves a reading transaction to a newer version, the latest if
    /// `target` is `None`. Changes between the two versions are reported
    /// to `observer`.
    pub fn advance_read(
        &mut self,
        observer: Option<&mut dyn InstructionHandler>,
        target: Option<u64>,
    ) -> TxnResult<()> {
        self.check_reading("advance_read")?;
        self.advance_to(observer, target)
    }

    fn advance_to(&mut self, observer: Option<&mut dyn InstructionHandler>, target: Option<u64>) -> TxnResult<()> {
        let current = self.version.version;
        let inner = Arc::clone(self.db.inner());
        match target {
            Some(t) if t < current => {
                return Err(TxnError::illegal(format!(
                    "cannot advance from version {current} to older version {t}"
                )));
            }
            Some(t) if t == current => return Ok(()),
            None if inner.latest_version() == current => return Ok(()),
            _ => {}
        }
        if observer.is_some() && self.repl.is_none() {
            return Err(TxnError::illegal("observing changes requires a history"));
        }

        let (new_id, snapshot) = inner.grab_read_lock(target)?;
        if new_id.version == current {
            inner.release_read_lock(new_id);
            return Ok(());
        }
        let old_mapping = Arc::clone(&self.snapshot.mapping);
        self.alloc.update_reader_view(Arc::clone(&snapshot.mapping));
        let group = match Group::attach(&self.alloc, snapshot.top_ref, inner.tree_config()) {
            Ok(g) => g,
            Err(e) => {
                self.alloc.update_reader_view(old_mapping);
                inner.release_read_lock(new_id);
                return Err(e);
            }
        };
        self.release_read_lock();
        self.version = new_id;
        self.snapshot = snapshot;
        self.group = group;
        self.read_lock_held = true;
        inner.stats().advances.fetch_add(1, Ordering::Relaxed);
        debug!(id = self.id, from = current, to = new_id.version, "read advanced");

        if let Some(observer) = observer {
            let entries = self.group.history_entries_after(&self.alloc, current)?;
            let mut input = ChangesetInputStream::new(entries);
            TransactLogParser::new().parse(&mut input, observer)?;
        }
        Ok(())
    }

    /// Commits the running write and ends the transaction. Returns the new
    /// version.
    pub fn commit(&mut self) -> TxnResult<u64> {
        let version = self.commit_internal(CommitMode::Sync, false)?;
        self.end_read()?;
        Ok(version)
    }

    /// Commits and keeps reading at the new version.
    pub fn commit_and_continue_as_read(&mut self) -> TxnResult<u64> {
        self.commit_internal(CommitMode::Sync, false)
    }

    /// Commits and immediately starts a new write on top of the new
    /// version without releasing the write lock.
    pub fn commit_and_continue_writing(&mut self) -> TxnResult<u64> {
        let version = self.commit_internal(CommitMode::Sync, true)?;
        self.begin_write();
        Ok(version)
    }

    /// Publishes the running write without waiting for it to be persisted
    /// and continues reading at the new version. `callback` runs once the
    /// commit is durable.
    pub fn async_commit(&mut self, callback: Option<CommitCallback>) -> TxnResult<u64> {
        self.commit_internal(CommitMode::Async(callback), false)
    }

    fn commit_internal(&mut self, mode: CommitMode, keep_write_lock: bool) -> TxnResult<u64> {
        self.check_writing()?;
        let changeset = match self.repl.as_mut() {
            Some(repl) => repl.prepare_commit()?,
            None => Bytes::new(),
        };
        let inner = Arc::clone(self.db.inner());
        let published = inner.commit_snapshot(&mut self.alloc, &mut self.group, &changeset, mode);
        let (new_id, snapshot) = match published {
            Ok(p) => p,
            Err(e) => {
                warn!(id = self.id, error = %e, "commit failed, rolling back");
                self.discard_write();
                inner.release_write(self.id);
                self.stage = TransactStage::Reading;
                return Err(e);
            }
        };
        self.release_read_lock();
        self.alloc.update_reader_view(Arc::clone(&snapshot.mapping));
        self.alloc.set_writable(false);
        self.version = new_id;
        self.snapshot = snapshot;
        self.read_lock_held = true;
        self.stage = TransactStage::Reading;
        if !keep_write_lock {
            inner.release_write(self.id);
        }
        self.group = Group::attach(&self.alloc, self.snapshot.top_ref, inner.tree_config())?;
        Ok(new_id.version)
    }

    /// Drops the uncommitted state of a write and re-attaches to the bound
    /// snapshot.
    fn discard_write(&mut self) {
        if let Some(repl) = self.repl.as_mut() {
            repl.abort_transact();
        }
        self.alloc.reset_free_space_tracking();
        self.alloc.set_writable(false);
        match Group::attach(&self.alloc, self.snapshot.top_ref, self.db.inner().tree_config()) {
            Ok(g) => self.group = g,
            Err(e) => warn!(error = %e, "bound snapshot no longer attaches"),
        }
    }

    /// Discards the running write and ends the transaction.
    pub fn rollback(&mut self) -> TxnResult<()> {
        self.check_writing()?;
        self.rollback_and_continue_as_read(None)?;
        self.end_read()
    }

    /// Discards the running write and keeps reading at the bound version.
    /// `observer` first sees the inverse of every discarded instruction, in
    /// reverse order.
    pub fn rollback_and_continue_as_read(
        &mut self,
        observer: Option<&mut dyn InstructionHandler>,
    ) -> TxnResult<()> {
        self.check_writing()?;
        let mut replay_error = None;
        if let (Some(observer), Some(repl)) = (observer, self.repl.as_ref()) {
            let changes = Bytes::copy_from_slice(repl.get_uncommitted_changes());
            let mut reverser = TransactReverser::new();
            match parse_changeset(&changes, &mut reverser) {
                Ok(()) => {
                    reverser.reverse(observer);
                }
                Err(e) => replay_error = Some(e),
            }
        }
        self.discard_write();
        let inner = Arc::clone(self.db.inner());
        inner.release_write(self.id);
        self.stage = TransactStage::Reading;
        inner.stats().rollbacks.fetch_add(1, Ordering::Relaxed);
        debug!(id = self.id, version = self.version.version, "write rolled back");
        match replay_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Queues a request for the write lock. `callback` runs on the async
    /// worker once the lock is held for this transaction; a following
    /// [`Transaction::promote_to_write`] then succeeds without blocking.
    pub fn async_request_write(&self, callback: WriteGrantCallback) -> TxnResult<AsyncWriteHandle> {
        self.check_promotable()?;
        let shared = self
            .db
            .inner()
            .async_shared()
            .ok_or_else(|| TxnError::illegal("async commits are disabled"))?;
        Ok(shared.enqueue_request(self.id, callback))
    }

    /// Cancels a queued write request. Returns false if it was already
    /// granted.
    pub fn cancel_async_request(&self, handle: AsyncWriteHandle) -> bool {
        self.db
            .inner()
            .async_shared()
            .is_some_and(|s| s.cancel_request(handle))
    }

    /// Returns true while this transaction holds the write lock, including
    /// a granted async request it has not used yet.
    pub fn holds_write_lock(&self) -> bool {
        self.db.inner().holds_write(self.id)
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// A frozen transaction at the bound version.
    pub fn freeze(&self) -> TxnResult<Transaction> {
        match self.stage {
            TransactStage::Reading | TransactStage::Frozen => {
                self.db.start_frozen(Some(self.version.version))
            }
            stage => Err(TxnError::wrong_stage("Reading or Frozen", stage)),
        }
    }

    /// Another transaction of the same stage at the bound version.
    pub fn duplicate(&self) -> TxnResult<Transaction> {
        match self.stage {
            TransactStage::Reading => self.db.start_read(Some(self.version.version)),
            TransactStage::Frozen => self.db.start_frozen(Some(self.version.version)),
            stage => Err(TxnError::wrong_stage("Reading or Frozen", stage)),
        }
    }

    /// Blocks until a version newer than the bound one is published.
    pub fn wait_for_change(&self) -> bool {
        self.db.wait_for_change(self.version.version)
    }

    /// Changesets committed after `version` up to the bound version, each
    /// paired with the version it produced. Fails with `BadVersion` once
    /// the history no longer reaches back to `version`.
    pub fn changesets_since(&self, version: u64) -> TxnResult<Vec<(u64, Bytes)>> {
        let (alloc, group) = self.read_parts()?;
        let entries = group.history_entries_after(alloc, version)?;
        Ok(entries
            .into_iter()
            .zip(version + 1..)
            .map(|(changeset, v)| (v, changeset))
            .collect())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.stage == TransactStage::Writing {
            self.discard_write();
            debug!(id = self.id, "write dropped without commit");
        }
        self.db.inner().release_write(self.id);
        self.release_read_lock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_common::config::DbConfig;
    use vellum_common::types::{ColumnAttrs, ColumnType, ObjKey};
    use vellum_replication::RecordingHandler;

    fn db() -> Db {
        Db::open(DbConfig::for_testing()).unwrap()
    }

    #[test]
    fn test_stage_transitions() {
        let db = db();
        let mut tr = db.start_read(None).unwrap();
        assert_eq!(tr.stage(), TransactStage::Reading);
        tr.promote_to_write(None).unwrap();
        assert_eq!(tr.stage(), TransactStage::Writing);
        tr.add_table("a").unwrap();
        let v = tr.commit_and_continue_as_read().unwrap();
        assert_eq!(v, 1);
        assert_eq!(tr.stage(), TransactStage::Reading);
        assert!(tr.find_table("a").unwrap().is_some());
        tr.end_read().unwrap();
        assert_eq!(tr.stage(), TransactStage::Ready);
        assert!(matches!(
            tr.find_table("a"),
            Err(TxnError::WrongTransactionState { .. })
        ));
    }

    #[test]
    fn test_frozen_never_promotes() {
        let db = db();
        let tr = db.start_read(None).unwrap();
        let mut frozen = tr.freeze().unwrap();
        assert!(frozen.is_frozen());
        let err = frozen.promote_to_write(None).unwrap_err();
        assert!(matches!(err, TxnError::IllegalOperation(_)));
        assert!(matches!(
            frozen.advance_read(None, None),
            Err(TxnError::IllegalOperation(_))
        ));
        let dup = frozen.duplicate().unwrap();
        assert!(dup.is_frozen());
    }

    #[test]
    fn test_promote_without_history_is_illegal() {
        let db = Db::open(DbConfig::for_testing().with_history_type(HistoryType::None)).unwrap();
        let mut tr = db.start_read(None).unwrap();
        assert!(matches!(
            tr.promote_to_write(None),
            Err(TxnError::IllegalOperation(_))
        ));
        let mut w = db.start_write().unwrap();
        w.add_table("plain").unwrap();
        assert_eq!(w.commit().unwrap(), 1);
        tr.advance_read(None, None).unwrap();
        assert_eq!(tr.version(), 1);
    }

    #[test]
    fn test_advance_to_older_version_is_illegal() {
        let db = db();
        let mut w = db.start_write().unwrap();
        w.add_table("t").unwrap();
        w.commit_and_continue_as_read().unwrap();
        let err = w.advance_read(None, Some(0)).unwrap_err();
        assert!(matches!(err, TxnError::IllegalOperation(_)));
    }

    #[test]
    fn test_advance_reports_changes() {
        let db = db();
        let mut reader = db.start_read(None).unwrap();

        let mut w = db.start_write().unwrap();
        let t = w.add_table("people").unwrap();
        w.add_column(t, ColumnType::Int, "age", ColumnAttrs::NONE).unwrap();
        w.create_object_with_key(t, ObjKey::new(5)).unwrap();
        w.commit().unwrap();

        let mut rec = RecordingHandler::new();
        reader.advance_read(Some(&mut rec), None).unwrap();
        assert_eq!(reader.version(), 1);
        assert!(rec.instructions.len() >= 3);
        assert_eq!(reader.table_size(t).unwrap(), 1);
    }

    #[test]
    fn test_rollback_restores_snapshot() {
        let db = db();
        let mut w = db.start_write().unwrap();
        let t = w.add_table("t").unwrap();
        w.commit_and_continue_writing().unwrap();
        w.create_object(t).unwrap();
        assert_eq!(w.table_size(t).unwrap(), 1);

        let mut rec = RecordingHandler::new();
        w.rollback_and_continue_as_read(Some(&mut rec)).unwrap();
        assert_eq!(w.stage(), TransactStage::Reading);
        assert_eq!(w.table_size(t).unwrap(), 0);
        assert!(!rec.instructions.is_empty());
        assert!(!w.holds_write_lock());
        assert_eq!(db.stats().rollbacks.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_commit_and_continue_writing_keeps_lock() {
        let db = db();
        let mut w = db.start_write().unwrap();
        let t = w.add_table("t").unwrap();
        let v1 = w.commit_and_continue_writing().unwrap();
        assert!(w.holds_write_lock());
        assert!(db.try_start_write().unwrap().is_none());
        let key = w.create_object(t).unwrap();
        let v2 = w.commit().unwrap();
        assert_eq!((v1, v2), (1, 2));

        let r = db.start_read(None).unwrap();
        assert!(r.has_object(t, key).unwrap());
        assert_eq!(r.table_size(t).unwrap(), 1);
    }

    #[test]
    fn test_async_commit_completes() {
        let db = db();
        let mut w = db.start_write().unwrap();
        w.add_table("t").unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let v = w
            .async_commit(Some(Box::new(move |status| {
                tx.send(status).unwrap();
            })))
            .unwrap();
        assert_eq!(v, 1);
        assert_eq!(w.stage(), TransactStage::Reading);
        assert!(rx.recv().unwrap().is_none());
        db.wait_for_async_completion();
        assert!(!db.has_unsynced_commits());
        assert!(db.get_commit_exception().is_none());
    }

    #[test]
    fn test_async_write_request_is_granted() {
        let db = db();
        let mut tr = db.start_read(None).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        tr.async_request_write(Box::new(move || {
            tx.send(()).unwrap();
        }))
        .unwrap();
        rx.recv().unwrap();
        assert!(tr.holds_write_lock());
        tr.promote_to_write(None).unwrap();
        tr.add_table("t").unwrap();
        tr.commit().unwrap();
        assert!(db.try_start_write().unwrap().is_some());
    }

    #[test]
    fn test_cancel_queued_request() {
        let db = db();
        let blocker = db.start_write().unwrap();
        let tr = db.start_read(None).unwrap();
        let handle = tr.async_request_write(Box::new(|| {})).unwrap();
        assert!(tr.cancel_async_request(handle));
        assert!(!tr.cancel_async_request(handle));
        drop(blocker);
    }

    #[test]
    fn test_pinned_version_outlives_commits() {
        let db = db();
        let old = db.start_read(None).unwrap();
        for _ in 0..3 {
            let mut w = db.start_write().unwrap();
            w.add_table(&format!("t{}", w.version())).unwrap();
            w.commit().unwrap();
        }
        assert_eq!(db.retained_versions(), vec![0, 3]);
        let again = db.start_read(Some(0)).unwrap();
        assert!(again.table_keys().unwrap().is_empty());
        drop(old);
        drop(again);
        assert_eq!(db.retained_versions(), vec![3]);
        assert!(matches!(db.start_read(Some(0)), Err(TxnError::BadVersion(0))));
    }
}
