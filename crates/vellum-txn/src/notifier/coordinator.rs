//! Background computation and delivery of change notifications.
//!
//! The coordinator keeps its own read transaction. Each pass advances it
//! to the latest version with a [`TransactionChangeInfo`] observer, turns
//! the observed instructions into per-registration change sets and hands
//! them to the callbacks.
//!
//! # Locks
//!
//! | lock | level | protects |
//! |------|-------|----------|
//! | `notifier.state` | 40 | reader transaction, registrations |
//! | `notifier.callbacks` | 50 | registered callbacks |
//!
//! Neither lock is held while advancing the reader or while a callback
//! runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};
use vellum_common::lock_tag;
use vellum_common::sync::Guarded;
use vellum_common::types::{HistoryType, TableKey};

use super::change_builder::CollectionChangeSet;
use super::change_info::{CollectionPath, ObjectChangeSet, TransactionChangeInfo};
use crate::db::Db;
use crate::error::{TxnError, TxnResult};
use crate::transaction::Transaction;

lock_tag!(NotifierStateLock, "notifier.state", 40);
lock_tag!(NotifierCallbackLock, "notifier.callbacks", 50);

/// What a registration observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveTarget {
    /// Object insertions, deletions and modifications of a table.
    Table(TableKey),
    /// Element changes of one collection field.
    Collection(CollectionPath),
}

/// The changes delivered to one callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    /// Changes of an observed table.
    Table(ObjectChangeSet),
    /// Changes of an observed collection.
    Collection(CollectionChangeSet),
}

/// One delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    /// Version the changes lead to.
    pub version: u64,
    /// The changes.
    pub changes: ChangeKind,
}

/// Callback invoked with every non-empty change of its target.
pub type NotificationCallback = Box<dyn FnMut(&ChangeNotification) + Send>;

/// Notifier statistics.
#[derive(Debug, Default)]
pub struct NotifierStats {
    /// Passes that advanced the reader.
    pub passes: AtomicU64,
    /// Callbacks invoked.
    pub deliveries: AtomicU64,
}

struct NotifierState {
    reader: Option<Transaction>,
    targets: HashMap<u64, ObserveTarget>,
    next_id: u64,
}

struct Shared {
    db: Db,
    state: Guarded<NotifierState, NotifierStateLock>,
    // A `None` slot marks a callback that is being invoked.
    callbacks: Guarded<HashMap<u64, Option<NotificationCallback>>, NotifierCallbackLock>,
    version: AtomicU64,
    stop: AtomicBool,
    stats: NotifierStats,
}

impl Shared {
    fn unregister(&self, id: u64) {
        let removed = self.state.lock().targets.remove(&id).is_some();
        self.callbacks.lock().remove(&id);
        if removed {
            trace!(id, "notification unregistered");
        }
    }

    fn process(&self) -> TxnResult<usize> {
        let Some(mut reader) = self.state.lock().reader.take() else {
            // another pass owns the reader
            return Ok(0);
        };
        let before = reader.version();
        let mut info = TransactionChangeInfo::new();
        let advanced = reader.advance_read(Some(&mut info), None);
        let after = reader.version();

        let pending = {
            let mut state = self.state.lock();
            state.reader = Some(reader);
            advanced?;
            if after == before {
                return Ok(0);
            }
            self.version.store(after, Ordering::Release);
            self.stats.passes.fetch_add(1, Ordering::Relaxed);
            let mut pending = Vec::new();
            for (&id, target) in &state.targets {
                let changes = match *target {
                    ObserveTarget::Table(t) => info
                        .table(t)
                        .filter(|c| !c.is_empty())
                        .map(|c| ChangeKind::Table(c.clone())),
                    ObserveTarget::Collection(path) => info
                        .collection(path)
                        .map(|b| b.clone().finalize())
                        .filter(|c| !c.is_empty())
                        .map(ChangeKind::Collection),
                };
                if let Some(changes) = changes {
                    pending.push((
                        id,
                        ChangeNotification {
                            version: after,
                            changes,
                        },
                    ));
                }
            }
            pending
        };
        debug!(from = before, to = after, pending = pending.len(), "notifier advanced");

        let mut delivered = 0;
        for (id, notification) in pending {
            let taken = self.callbacks.lock().get_mut(&id).and_then(Option::take);
            let Some(mut callback) = taken else {
                continue;
            };
            callback(&notification);
            delivered += 1;
            if let Some(slot) = self.callbacks.lock().get_mut(&id) {
                *slot = Some(callback);
            }
        }
        self.stats.deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
        Ok(delivered)
    }
}

/// Keeps a registration alive; dropping it unregisters the callback.
#[must_use = "dropping the token unregisters the callback"]
pub struct NotificationToken {
    id: u64,
    shared: Weak<Shared>,
}

impl NotificationToken {
    /// Registration id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl std::fmt::Debug for NotificationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationToken")
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for NotificationToken {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.unregister(self.id);
        }
    }
}

/// Computes change sets between versions and delivers them to callbacks.
pub struct NotifierCoordinator {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NotifierCoordinator {
    /// Creates a coordinator reading from the latest version of `db`.
    ///
    /// Changes are observed through the history, so a database opened
    /// without one is rejected.
    pub fn new(db: &Db) -> TxnResult<Self> {
        if db.history_type() == HistoryType::None {
            return Err(TxnError::illegal(
                "change notifications require a history",
            ));
        }
        let reader = db.start_read(None)?;
        let version = reader.version();
        info!(version, "notifier coordinator created");
        Ok(Self {
            shared: Arc::new(Shared {
                db: db.clone(),
                state: Guarded::new(NotifierState {
                    reader: Some(reader),
                    targets: HashMap::new(),
                    next_id: 1,
                }),
                callbacks: Guarded::new(HashMap::new()),
                version: AtomicU64::new(version),
                stop: AtomicBool::new(false),
                stats: NotifierStats::default(),
            }),
            worker: Mutex::new(None),
        })
    }

    /// Registers `callback` for changes of `target`.
    pub fn observe(
        &self,
        target: ObserveTarget,
        callback: impl FnMut(&ChangeNotification) + Send + 'static,
    ) -> NotificationToken {
        let id = {
            let mut state = self.shared.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.targets.insert(id, target);
            self.shared.callbacks.lock().insert(id, Some(Box::new(callback)));
            id
        };
        trace!(id, ?target, "notification registered");
        NotificationToken {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Number of live registrations.
    pub fn registration_count(&self) -> usize {
        self.shared.state.lock().targets.len()
    }

    /// Version the last pass advanced to.
    pub fn version(&self) -> u64 {
        self.shared.version.load(Ordering::Acquire)
    }

    /// Statistics.
    pub fn stats(&self) -> &NotifierStats {
        &self.shared.stats
    }

    /// Runs one pass on the calling thread. Returns the number of
    /// callbacks invoked.
    pub fn process(&self) -> TxnResult<usize> {
        self.shared.process()
    }

    /// Starts the background worker, which waits for new versions and runs
    /// a pass for each. Polls for shutdown every `poll`.
    pub fn start(&self, poll: Duration) -> TxnResult<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        self.shared.stop.store(false, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("vellum-notifier".into())
            .spawn(move || run_worker(&shared, poll))
            .map_err(|e| TxnError::illegal(format!("cannot spawn notifier worker: {e}")))?;
        *worker = Some(handle);
        debug!("notifier worker started");
        Ok(())
    }

    /// Stops the background worker and waits for it to exit.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("notifier worker panicked");
            }
            debug!("notifier worker stopped");
        }
    }
}

impl Drop for NotifierCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for NotifierCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifierCoordinator")
            .field("version", &self.version())
            .field("running", &self.worker.lock().is_some())
            .finish()
    }
}

fn run_worker(shared: &Shared, poll: Duration) {
    while !shared.stop.load(Ordering::Acquire) {
        let started = Instant::now();
        let version = shared.version.load(Ordering::Acquire);
        if !shared.db.wait_for_change_for(version, poll) {
            // released waiters return at once
            if let Some(rest) = poll.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
            continue;
        }
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        if let Err(e) = shared.process() {
            warn!(error = %e, "notifier pass failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use vellum_common::config::DbConfig;
    use vellum_common::types::{ColumnAttrs, ColumnType, ObjKey};

    use crate::collection::List;

    fn collect() -> (Arc<PlMutex<Vec<ChangeNotification>>>, impl FnMut(&ChangeNotification) + Send) {
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |n: &ChangeNotification| sink.lock().push(n.clone()))
    }

    #[test]
    fn test_requires_history() {
        let db = Db::open(DbConfig::for_testing().with_history_type(HistoryType::None)).unwrap();
        assert!(matches!(
            NotifierCoordinator::new(&db),
            Err(TxnError::IllegalOperation(_))
        ));
    }

    #[test]
    fn test_table_changes_are_delivered() {
        let db = Db::open(DbConfig::for_testing()).unwrap();
        let mut wt = db.start_write().unwrap();
        let t = wt.add_table("items").unwrap();
        let col = wt.add_column(t, ColumnType::Int, "n", ColumnAttrs::NONE).unwrap();
        wt.create_object_with_key(t, ObjKey::new(1)).unwrap();
        wt.commit().unwrap();

        let notifier = NotifierCoordinator::new(&db).unwrap();
        let (seen, callback) = collect();
        let _token = notifier.observe(ObserveTarget::Table(t), callback);

        let mut wt = db.start_write().unwrap();
        wt.create_object_with_key(t, ObjKey::new(2)).unwrap();
        wt.set(t, col, ObjKey::new(1), 5i64).unwrap();
        let version = wt.commit().unwrap();

        assert_eq!(notifier.process().unwrap(), 1);
        assert_eq!(notifier.version(), version);
        let seen = seen.lock();
        let ChangeKind::Table(changes) = &seen[0].changes else {
            panic!("expected table changes");
        };
        assert!(changes.insertions.contains(&ObjKey::new(2)));
        assert!(changes.column_modified(ObjKey::new(1), col));
    }

    #[test]
    fn test_collection_changes_are_delivered() {
        let db = Db::open(DbConfig::for_testing()).unwrap();
        let mut wt = db.start_write().unwrap();
        let t = wt.add_table("items").unwrap();
        let col = wt
            .add_column(t, ColumnType::Int, "xs", ColumnAttrs::LIST)
            .unwrap();
        let k = wt.create_object(t).unwrap();
        wt.commit().unwrap();

        let notifier = NotifierCoordinator::new(&db).unwrap();
        let (seen, callback) = collect();
        let _token = notifier.observe(ObserveTarget::Collection((t, col, k)), callback);

        let mut wt = db.start_write().unwrap();
        let list = List::<i64>::new(t, col, k);
        list.add(&mut wt, 1).unwrap();
        list.add(&mut wt, 2).unwrap();
        wt.commit().unwrap();

        notifier.process().unwrap();
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        let ChangeKind::Collection(changes) = &seen[0].changes else {
            panic!("expected collection changes");
        };
        assert_eq!(changes.insertions.to_vec(), vec![0, 1]);
    }

    #[test]
    fn test_dropped_token_stops_delivery() {
        let db = Db::open(DbConfig::for_testing()).unwrap();
        let mut wt = db.start_write().unwrap();
        let t = wt.add_table("items").unwrap();
        wt.commit().unwrap();

        let notifier = NotifierCoordinator::new(&db).unwrap();
        let (seen, callback) = collect();
        let token = notifier.observe(ObserveTarget::Table(t), callback);
        assert_eq!(notifier.registration_count(), 1);
        drop(token);
        assert_eq!(notifier.registration_count(), 0);

        let mut wt = db.start_write().unwrap();
        wt.create_object(t).unwrap();
        wt.commit().unwrap();
        assert_eq!(notifier.process().unwrap(), 0);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_worker_delivers_in_background() {
        let db = Db::open(DbConfig::for_testing()).unwrap();
        let mut wt = db.start_write().unwrap();
        let t = wt.add_table("items").unwrap();
        wt.commit().unwrap();

        let notifier = NotifierCoordinator::new(&db).unwrap();
        let (seen, callback) = collect();
        let _token = notifier.observe(ObserveTarget::Table(t), callback);
        notifier.start(Duration::from_millis(5)).unwrap();

        let mut wt = db.start_write().unwrap();
        wt.create_object(t).unwrap();
        wt.commit().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.lock().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        notifier.stop();
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(notifier.stats().passes.load(Ordering::Relaxed), 1);
    }
}
