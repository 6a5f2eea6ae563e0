//! The shared database object.
//!
//! A [`Db`] owns the committed image, the read-lock ring pinning
//! snapshots, the write mutex, the optional backing file and the async
//! commit worker. Transactions are handed out by [`Db::start_read`],
//! [`Db::start_write`] and [`Db::start_frozen`].
//!
//! # Locks
//!
//! | lock | level | protects |
//! |------|-------|----------|
//! | `db.write_mutex` | 10 | identity of the writing transaction |
//! | `db.file` | 15 | backing file and its header slots |
//! | `db.state` | 20 | read-lock ring, durable version |
//! | `db.async_state` | 30 | async request and sync queues |
//!
//! The write mutex is held only long enough to record the holder; the
//! writing transaction keeps the write lock by being recorded as holder.

mod async_commit;
mod file;
mod read_lock;

pub use async_commit::{AsyncWriteHandle, CommitCallback, CommitStage, WriteGrantCallback};
pub use read_lock::Snapshot;

pub(crate) use async_commit::{AsyncShared, PendingSync};

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Condvar;
use tracing::{debug, info, trace};
use vellum_common::config::{DbConfig, Durability};
use vellum_common::constants::HISTORY_SCHEMA_VERSION;
use vellum_common::lock_tag;
use vellum_common::sync::Guarded;
use vellum_common::types::{HistoryType, Ref, VersionId};
use vellum_common::Status;
use vellum_replication::{resolve_history_type, upgrade_history_schema, HistoryMigration, NoMigration};
use vellum_storage::{FileImage, Mapping, SlabAlloc, SlabConfig, TreeConfig};

use crate::error::{TxnError, TxnResult};
use crate::group::Group;
use crate::transaction::{TransactStage, Transaction};
use file::{encode_header, DbFile};
use read_lock::ReadLockRing;

lock_tag!(pub(crate) WriteMutexLock, "db.write_mutex", 10);
lock_tag!(pub(crate) DbFileLock, "db.file", 15);
lock_tag!(pub(crate) DbStateLock, "db.state", 20);
lock_tag!(pub(crate) AsyncStateLock, "db.async_state", 30);

/// Database statistics.
#[derive(Debug, Default)]
pub struct DbStats {
    /// Commits published.
    pub commits: AtomicU64,
    /// Commits published through `async_commit`.
    pub async_commits: AtomicU64,
    /// Write transactions rolled back.
    pub rollbacks: AtomicU64,
    /// Read transactions advanced to a newer version.
    pub advances: AtomicU64,
    /// Read locks taken.
    pub read_locks: AtomicU64,
    /// Snapshots written to the backing file.
    pub syncs: AtomicU64,
}

#[derive(Debug)]
struct DbState {
    ring: ReadLockRing,
    wait_released: bool,
    durable_version: u64,
}

#[derive(Debug, Default)]
struct WriteMutex {
    holder: Option<u64>,
}

/// How a commit is made durable.
pub(crate) enum CommitMode {
    /// Persist before publishing.
    Sync,
    /// Publish now and let the worker persist.
    Async(Option<CommitCallback>),
}

pub(crate) struct DbInner {
    config: DbConfig,
    tree_config: TreeConfig,
    slab_config: SlabConfig,
    history_type: HistoryType,
    image: FileImage,
    state: Guarded<DbState, DbStateLock>,
    changed: Condvar,
    write_mutex: Guarded<WriteMutex, WriteMutexLock>,
    write_released: Condvar,
    file: Option<Guarded<DbFile, DbFileLock>>,
    async_shared: Option<Arc<AsyncShared>>,
    next_txn_id: AtomicU64,
    stats: DbStats,
}

impl Drop for DbInner {
    fn drop(&mut self) {
        if let Some(shared) = &self.async_shared {
            shared.shutdown();
        }
    }
}

impl DbInner {
    pub(crate) fn tree_config(&self) -> TreeConfig {
        self.tree_config
    }

    pub(crate) fn slab_config(&self) -> SlabConfig {
        self.slab_config
    }

    pub(crate) fn history_type(&self) -> HistoryType {
        self.history_type
    }

    pub(crate) fn stats(&self) -> &DbStats {
        &self.stats
    }

    pub(crate) fn next_txn_id(&self) -> u64 {
        self.next_txn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn async_shared(&self) -> Option<&Arc<AsyncShared>> {
        self.async_shared.as_ref()
    }

    // =========================================================================
    // Read locks
    // =========================================================================

    /// Pins the latest snapshot, or `version` if it is still retained.
    pub(crate) fn grab_read_lock(&self, version: Option<u64>) -> TxnResult<(VersionId, Snapshot)> {
        let mut state = self.state.lock();
        let grabbed = match version {
            None => state.ring.grab_latest(),
            Some(v) => state.ring.grab(v),
        };
        drop(state);
        let grabbed = grabbed.ok_or(TxnError::BadVersion(version.unwrap_or(0)))?;
        self.stats.read_locks.fetch_add(1, Ordering::Relaxed);
        Ok(grabbed)
    }

    pub(crate) fn release_read_lock(&self, id: VersionId) {
        self.state.lock().ring.release(id);
    }

    pub(crate) fn latest_version(&self) -> u64 {
        self.state.lock().ring.latest_version()
    }

    fn oldest_live_version(&self) -> u64 {
        let state = self.state.lock();
        let oldest = state.ring.oldest_live_version();
        if self.file.is_some() {
            // space of the persisted snapshot stays untouched until a newer
            // one is on disk
            oldest.min(state.durable_version)
        } else {
            oldest
        }
    }

    // =========================================================================
    // Write lock
    // =========================================================================

    /// Blocks until `owner` holds the write lock.
    pub(crate) fn acquire_write(&self, owner: u64) {
        let mut guard = self.write_mutex.lock();
        guard.wait_while(&self.write_released, |m| m.holder.is_some_and(|h| h != owner));
        guard.holder = Some(owner);
        trace!(owner, "write lock acquired");
    }

    pub(crate) fn try_acquire_write(&self, owner: u64) -> bool {
        let mut guard = self.write_mutex.lock();
        match guard.holder {
            Some(h) if h != owner => false,
            _ => {
                guard.holder = Some(owner);
                trace!(owner, "write lock acquired");
                true
            }
        }
    }

    pub(crate) fn holds_write(&self, owner: u64) -> bool {
        self.write_mutex.lock().holder == Some(owner)
    }

    /// Releases the write lock if `owner` holds it.
    pub(crate) fn release_write(&self, owner: u64) {
        let mut guard = self.write_mutex.lock();
        if guard.holder != Some(owner) {
            return;
        }
        guard.holder = None;
        drop(guard);
        trace!(owner, "write lock released");
        self.write_released.notify_all();
        if let Some(shared) = &self.async_shared {
            shared.on_write_released(owner);
        }
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Writes every node reachable from `top` that the write created into a
    /// new mapping and returns it with the new top ref.
    fn write_image(
        &self,
        alloc: &mut SlabAlloc,
        top: Ref,
        freed_version: u64,
        oldest_live: u64,
    ) -> TxnResult<(Mapping, Ref)> {
        write_image(&self.image, alloc, top, freed_version, oldest_live)
    }

    /// Publishes the write held in `alloc`/`group` as the next version and
    /// pins it for the committing transaction.
    pub(crate) fn commit_snapshot(
        &self,
        alloc: &mut SlabAlloc,
        group: &mut Group,
        changeset: &[u8],
        mode: CommitMode,
    ) -> TxnResult<(VersionId, Snapshot)> {
        let base = group.version(alloc);
        let new_version = base + 1;
        let oldest_live = self.oldest_live_version();

        group.history_append(alloc, changeset)?;
        group.history_trim(alloc, oldest_live)?;
        group.set_version(alloc, new_version)?;
        let (mapping, top_ref) = self.write_image(alloc, group.top_ref(), new_version, oldest_live)?;

        let is_async = matches!(mode, CommitMode::Async(_));
        if !is_async {
            self.persist_snapshot(new_version, top_ref, &mapping)?;
        }

        let mapping = self.image.publish(mapping);
        let snapshot = Snapshot {
            version: new_version,
            top_ref,
            mapping: Arc::clone(&mapping),
        };
        let mut state = self.state.lock();
        let id = state.ring.publish(snapshot.clone(), true);
        drop(state);
        self.changed.notify_all();
        let id = id.ok_or_else(|| TxnError::Corrupted("published snapshot has no slot".into()))?;

        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        info!(
            version = new_version,
            changeset_bytes = changeset.len(),
            size = mapping.size(),
            is_async,
            "commit published"
        );

        if let CommitMode::Async(callback) = mode {
            self.stats.async_commits.fetch_add(1, Ordering::Relaxed);
            match &self.async_shared {
                Some(shared) => shared.enqueue_sync(PendingSync {
                    version: new_version,
                    top_ref,
                    mapping,
                    callback,
                }),
                None => {
                    let status = self
                        .persist_snapshot(new_version, top_ref, &mapping)
                        .err()
                        .map(|e| e.to_status());
                    if let Some(cb) = callback {
                        cb(status);
                    }
                }
            }
        }
        Ok((id, snapshot))
    }

    /// Writes `mapping` to the backing file, if there is one.
    pub(crate) fn persist_snapshot(&self, version: u64, top_ref: Ref, mapping: &Mapping) -> TxnResult<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        file.lock()
            .persist(mapping, top_ref, version)
            .map_err(|e| TxnError::CommitFailed(e.to_string()))?;
        let mut state = self.state.lock();
        state.durable_version = state.durable_version.max(version);
        drop(state);
        self.stats.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Makes the next write to the backing file fail.
    #[cfg(test)]
    pub(crate) fn fail_next_persist(&self) {
        if let Some(file) = &self.file {
            file.lock().fail_next_persist = true;
        }
    }

    // =========================================================================
    // Change waiting
    // =========================================================================

    fn wait_for_change(&self, version: u64, deadline: Option<Instant>) -> bool {
        let mut state = self.state.lock();
        while state.ring.latest_version() == version && !state.wait_released {
            match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        break;
                    }
                    state.wait_for(&self.changed, d - now);
                }
                None => state.wait(&self.changed),
            }
        }
        state.ring.latest_version() != version
    }
}

/// Serialises a snapshot into a new mapping of `image`. Committed refs the
/// write released are recorded as freed by `freed_version`.
fn write_image(
    image: &FileImage,
    alloc: &mut SlabAlloc,
    top: Ref,
    freed_version: u64,
    oldest_live: u64,
) -> TxnResult<(Mapping, Ref)> {
    let freed = alloc.take_freed_read_only();
    let mut writer = image.writer(oldest_live);
    let top_ref = vellum_storage::array::write_node(alloc, top, true, true, &mut writer)?;
    writer.write_header(&encode_header([top_ref.as_u64(), 0], 0));
    let mapping = writer.finish();
    image.release(freed.iter().map(|c| (c.ref_, c.size)), freed_version);
    trace!(?top_ref, size = mapping.size(), freed = freed.len(), "image written");
    Ok((mapping, top_ref))
}

/// A database: the set of its snapshots and the machinery to create new
/// ones.
///
/// Cloning a `Db` yields another handle to the same database.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("durability", &self.inner.config.durability)
            .field("history_type", &self.inner.history_type)
            .field("latest_version", &self.latest_version())
            .finish()
    }
}

impl Db {
    /// Opens a database with the default history migration, which accepts
    /// only the current history schema.
    pub fn open(config: DbConfig) -> TxnResult<Self> {
        Self::open_with_migration(config, &NoMigration)
    }

    /// Opens a database, upgrading an older stored history through
    /// `migration`.
    pub fn open_with_migration(config: DbConfig, migration: &dyn HistoryMigration) -> TxnResult<Self> {
        config.validate().map_err(TxnError::InvalidConfig)?;
        let tree_config = TreeConfig::new(config.max_leaf_size, config.max_inner_size);
        let slab_config = SlabConfig {
            initial_slab_bytes: config.initial_slab_bytes,
            max_slab_bytes: config.max_slab_bytes,
        };

        let (mut file, existing) = match (config.durability, &config.path) {
            (Durability::Full, Some(path)) => {
                let (file, existing) = DbFile::open_or_create(path)?;
                (Some(file), existing)
            }
            _ => (None, None),
        };

        let mut alloc = SlabAlloc::new(slab_config);
        let (image, history_type, snapshot) = match existing {
            Some((mapping, top_ref)) => {
                let image = FileImage::with_mapping(mapping);
                alloc.attach(image.current(), true);
                let mut group = Group::attach(&alloc, top_ref, tree_config)?;
                let version = group.version(&alloc);
                let stored = group.history_type(&alloc);
                let resolved = resolve_history_type(stored, config.history_type)?;
                let mut entries = group.history_all_entries(&alloc)?;
                let upgraded = upgrade_history_schema(
                    group.history_schema_version(&alloc),
                    &mut entries,
                    migration,
                )?;
                let snapshot = if upgraded || resolved != stored {
                    if upgraded {
                        group.replace_history(&mut alloc, &entries)?;
                        group.set_history_schema_version(&mut alloc, HISTORY_SCHEMA_VERSION)?;
                    }
                    if resolved != stored {
                        info!(?stored, ?resolved, "history type adopted");
                        group.set_history_type(&mut alloc, resolved)?;
                    }
                    let (mapping, top_ref) =
                        write_image(&image, &mut alloc, group.top_ref(), version, version)?;
                    if let Some(f) = file.as_mut() {
                        f.persist(&mapping, top_ref, version)?;
                    }
                    Snapshot {
                        version,
                        top_ref,
                        mapping: image.publish(mapping),
                    }
                } else {
                    Snapshot {
                        version,
                        top_ref,
                        mapping: image.current(),
                    }
                };
                (image, resolved, snapshot)
            }
            None => {
                let image = FileImage::new();
                alloc.attach(image.current(), true);
                let group = Group::create(&mut alloc, tree_config, config.history_type)?;
                let (mapping, top_ref) = write_image(&image, &mut alloc, group.top_ref(), 0, 0)?;
                if let Some(f) = file.as_mut() {
                    f.persist(&mapping, top_ref, 0)?;
                }
                let snapshot = Snapshot {
                    version: 0,
                    top_ref,
                    mapping: image.publish(mapping),
                };
                (image, config.history_type, snapshot)
            }
        };
        alloc.detach();

        let version = snapshot.version;
        let state = DbState {
            ring: ReadLockRing::new(config.read_lock_slots, snapshot),
            wait_released: false,
            durable_version: version,
        };
        let async_shared = config.enable_async_commit.then(AsyncShared::new);
        let inner = Arc::new(DbInner {
            tree_config,
            slab_config,
            history_type,
            image,
            state: Guarded::new(state),
            changed: Condvar::new(),
            write_mutex: Guarded::new(WriteMutex::default()),
            write_released: Condvar::new(),
            file: file.map(Guarded::new),
            async_shared,
            next_txn_id: AtomicU64::new(1),
            stats: DbStats::default(),
            config,
        });
        if let Some(shared) = &inner.async_shared {
            shared.spawn_worker(Arc::downgrade(&inner))?;
        }
        info!(
            version,
            ?history_type,
            durability = ?inner.config.durability,
            "database opened"
        );
        Ok(Self { inner })
    }

    pub(crate) fn inner(&self) -> &Arc<DbInner> {
        &self.inner
    }

    /// Configuration the database was opened with.
    pub fn config(&self) -> &DbConfig {
        &self.inner.config
    }

    /// History kind in effect.
    pub fn history_type(&self) -> HistoryType {
        self.inner.history_type
    }

    /// Backing file, for file-backed databases.
    pub fn path(&self) -> Option<&Path> {
        self.inner.config.path.as_deref()
    }

    /// Statistics.
    pub fn stats(&self) -> &DbStats {
        &self.inner.stats
    }

    /// Latest published version.
    pub fn latest_version(&self) -> u64 {
        self.inner.latest_version()
    }

    /// Versions currently pinned or latest, oldest first.
    pub fn retained_versions(&self) -> Vec<u64> {
        self.inner.state.lock().ring.retained_versions()
    }

    /// Bytes of committed space released and awaiting reuse.
    pub fn free_space_bytes(&self) -> u64 {
        self.inner.image.free_bytes()
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Starts a read transaction on the latest version, or on `version` if
    /// it is still retained.
    pub fn start_read(&self, version: Option<u64>) -> TxnResult<Transaction> {
        let (id, snapshot) = self.inner.grab_read_lock(version)?;
        Transaction::new(self.clone(), id, snapshot, TransactStage::Reading)
    }

    /// Starts a frozen transaction, which never changes version and may be
    /// shared between threads.
    pub fn start_frozen(&self, version: Option<u64>) -> TxnResult<Transaction> {
        let (id, snapshot) = self.inner.grab_read_lock(version)?;
        Transaction::new(self.clone(), id, snapshot, TransactStage::Frozen)
    }

    /// Starts a write transaction, blocking while another one runs.
    pub fn start_write(&self) -> TxnResult<Transaction> {
        let txn_id = self.inner.next_txn_id();
        self.inner.acquire_write(txn_id);
        self.write_transaction(txn_id)
    }

    /// Starts a write transaction if the write lock is free.
    pub fn try_start_write(&self) -> TxnResult<Option<Transaction>> {
        let txn_id = self.inner.next_txn_id();
        if !self.inner.try_acquire_write(txn_id) {
            return Ok(None);
        }
        self.write_transaction(txn_id).map(Some)
    }

    fn write_transaction(&self, txn_id: u64) -> TxnResult<Transaction> {
        let grabbed = self.inner.grab_read_lock(None);
        let (id, snapshot) = match grabbed {
            Ok(g) => g,
            Err(e) => {
                self.inner.release_write(txn_id);
                return Err(e);
            }
        };
        Transaction::new_writing(self.clone(), txn_id, id, snapshot)
    }

    // =========================================================================
    // Change waiting
    // =========================================================================

    /// Blocks until a version newer than `version` is published. Returns
    /// false if woken by [`Db::wait_for_change_release`] without a change.
    pub fn wait_for_change(&self, version: u64) -> bool {
        self.inner.wait_for_change(version, None)
    }

    /// Like [`Db::wait_for_change`] but gives up after `timeout`.
    pub fn wait_for_change_for(&self, version: u64, timeout: Duration) -> bool {
        self.inner.wait_for_change(version, Some(Instant::now() + timeout))
    }

    /// Wakes every waiter of [`Db::wait_for_change`] and makes further waits
    /// return immediately.
    pub fn wait_for_change_release(&self) {
        self.inner.state.lock().wait_released = true;
        self.inner.changed.notify_all();
        debug!("change waiters released");
    }

    /// Re-enables blocking in [`Db::wait_for_change`].
    pub fn enable_wait_for_change(&self) {
        self.inner.state.lock().wait_released = false;
    }

    // =========================================================================
    // Async commits
    // =========================================================================

    /// Returns true while async commits are published but not yet synced.
    pub fn has_unsynced_commits(&self) -> bool {
        self.inner
            .async_shared
            .as_ref()
            .is_some_and(|s| s.has_unsynced_commits())
    }

    /// Error of the most recent failed async commit.
    pub fn get_commit_exception(&self) -> Option<Status> {
        self.inner.async_shared.as_ref().and_then(|s| s.last_error())
    }

    /// Blocks until every async commit has been synced.
    pub fn wait_for_async_completion(&self) {
        if let Some(shared) = &self.inner.async_shared {
            shared.wait_for_syncs();
        }
    }

    /// Current stage of the async commit machinery.
    pub fn commit_stage(&self) -> CommitStage {
        self.inner
            .async_shared
            .as_ref()
            .map_or(CommitStage::Idle, |s| s.stage())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_common::ErrorCode;

    #[test]
    fn test_open_in_memory() {
        let db = Db::open(DbConfig::for_testing()).unwrap();
        assert_eq!(db.latest_version(), 0);
        assert_eq!(db.history_type(), HistoryType::InRealm);
        assert!(db.path().is_none());
        assert_eq!(db.commit_stage(), CommitStage::Idle);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = DbConfig::for_testing().with_node_sizes(1, 1);
        let err = Db::open(config).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfig);
    }

    #[test]
    fn test_write_lock_is_exclusive() {
        let db = Db::open(DbConfig::for_testing()).unwrap();
        let w = db.start_write().unwrap();
        assert!(db.try_start_write().unwrap().is_none());
        drop(w);
        assert!(db.try_start_write().unwrap().is_some());
    }

    #[test]
    fn test_bad_version() {
        let db = Db::open(DbConfig::for_testing()).unwrap();
        let err = db.start_read(Some(5)).unwrap_err();
        assert!(matches!(err, TxnError::BadVersion(5)));
    }

    #[test]
    fn test_failed_async_sync_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("async.vellum");
        let db = Db::open(DbConfig::with_path(&path)).unwrap();
        db.inner.fail_next_persist();

        let mut first = db.start_write().unwrap();
        first.add_table("t").unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        first
            .async_commit(Some(Box::new(move |status| {
                tx.send(status).unwrap();
            })))
            .unwrap();
        drop(first);
        let status = rx.recv().unwrap().unwrap();
        assert_eq!(status.code(), ErrorCode::CommitFailed);

        db.wait_for_async_completion();
        assert!(!db.has_unsynced_commits());
        let latent = db.get_commit_exception().unwrap();
        assert_eq!(latent.code(), ErrorCode::CommitFailed);

        // the published version stays readable and the next commit persists
        let mut w = db.start_write().unwrap();
        assert!(w.find_table("t").unwrap().is_some());
        w.add_table("u").unwrap();
        w.commit().unwrap();
        drop(w);
        drop(db);

        let db = Db::open(DbConfig::with_path(&path)).unwrap();
        let r = db.start_read(None).unwrap();
        assert!(r.find_table("t").unwrap().is_some());
        assert!(r.find_table("u").unwrap().is_some());
    }

    #[test]
    fn test_wait_for_change_times_out_and_releases() {
        let db = Db::open(DbConfig::for_testing()).unwrap();
        assert!(!db.wait_for_change_for(0, Duration::from_millis(10)));
        db.wait_for_change_release();
        assert!(!db.wait_for_change(0));
        db.enable_wait_for_change();

        let mut w = db.start_write().unwrap();
        w.add_table("t").unwrap();
        w.commit().unwrap();
        assert!(db.wait_for_change(0));
    }
}
