//! Background worker for asynchronous write requests and commits.
//!
//! A transaction may queue a request for the write lock without blocking;
//! the worker grants it in order once the lock is free and runs the
//! request's callback. A transaction may also publish a commit without
//! waiting for it to be persisted; the worker then syncs it to the file
//! and reports completion through the commit's callback.
//!
//! ```text
//! Idle ──request──▶ Requesting ──grant──▶ HasLock ──async_commit──▶ HasCommits
//!   ▲                                                                  │
//!   └──────────────────────── Syncing ◀──────── worker picks ─────────┘
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Condvar;
use tracing::{debug, trace, warn};
use vellum_common::sync::Guarded;
use vellum_common::types::Ref;
use vellum_common::{ErrorCode, Status};
use vellum_storage::Mapping;

use super::{AsyncStateLock, DbInner};

/// How long the worker waits before retrying a busy write lock.
const GRANT_RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// Callback run once an async write request holds the write lock.
pub type WriteGrantCallback = Box<dyn FnOnce() + Send>;

/// Callback run once an async commit is durable, with the error if the
/// sync failed.
pub type CommitCallback = Box<dyn FnOnce(Option<Status>) + Send>;

/// Handle of a queued async write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsyncWriteHandle(u64);

impl AsyncWriteHandle {
    /// Raw handle value.
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Stage of the async commit machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStage {
    /// Nothing queued.
    Idle,
    /// A write request waits for the lock.
    Requesting,
    /// A request was granted and its owner has not committed yet.
    HasLock,
    /// Published commits wait to be synced.
    HasCommits,
    /// A commit is being synced.
    Syncing,
}

impl fmt::Display for CommitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Requesting => "Requesting",
            Self::HasLock => "HasLock",
            Self::HasCommits => "HasCommits",
            Self::Syncing => "Syncing",
        };
        f.write_str(name)
    }
}

struct WriteRequest {
    handle: AsyncWriteHandle,
    owner: u64,
    callback: WriteGrantCallback,
}

pub(crate) struct PendingSync {
    pub(crate) version: u64,
    pub(crate) top_ref: Ref,
    pub(crate) mapping: Arc<Mapping>,
    pub(crate) callback: Option<CommitCallback>,
}

#[derive(Default)]
struct AsyncState {
    requests: VecDeque<WriteRequest>,
    syncs: VecDeque<PendingSync>,
    granted: Option<u64>,
    syncing: bool,
    last_error: Option<Status>,
    next_handle: u64,
    shutdown: bool,
}

impl AsyncState {
    fn stage(&self) -> CommitStage {
        if self.syncing {
            CommitStage::Syncing
        } else if !self.syncs.is_empty() {
            CommitStage::HasCommits
        } else if self.granted.is_some() {
            CommitStage::HasLock
        } else if !self.requests.is_empty() {
            CommitStage::Requesting
        } else {
            CommitStage::Idle
        }
    }
}

enum Job {
    Grant { handle: AsyncWriteHandle, owner: u64 },
    Sync(PendingSync),
}

/// State shared between a database and its async worker.
pub(crate) struct AsyncShared {
    state: Guarded<AsyncState, AsyncStateLock>,
    changed: Condvar,
}

impl fmt::Debug for AsyncShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncShared")
            .field("stage", &self.stage())
            .finish()
    }
}

impl AsyncShared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Guarded::new(AsyncState::default()),
            changed: Condvar::new(),
        })
    }

    /// Starts the worker thread.
    pub(crate) fn spawn_worker(self: &Arc<Self>, db: Weak<DbInner>) -> std::io::Result<()> {
        let shared = Arc::clone(self);
        std::thread::Builder::new()
            .name("vellum-async-commit".into())
            .spawn(move || shared.run(db))?;
        Ok(())
    }

    pub(crate) fn stage(&self) -> CommitStage {
        self.state.lock().stage()
    }

    pub(crate) fn enqueue_request(&self, owner: u64, callback: WriteGrantCallback) -> AsyncWriteHandle {
        let mut state = self.state.lock();
        state.next_handle += 1;
        let handle = AsyncWriteHandle(state.next_handle);
        state.requests.push_back(WriteRequest {
            handle,
            owner,
            callback,
        });
        trace!(handle = handle.0, owner, queued = state.requests.len(), "async write requested");
        drop(state);
        self.changed.notify_all();
        handle
    }

    /// Removes a request that has not been granted yet.
    pub(crate) fn cancel_request(&self, handle: AsyncWriteHandle) -> bool {
        let mut state = self.state.lock();
        let Some(pos) = state.requests.iter().position(|r| r.handle == handle) else {
            return false;
        };
        state.requests.remove(pos);
        debug!(handle = handle.0, "async write request cancelled");
        true
    }

    pub(crate) fn enqueue_sync(&self, sync: PendingSync) {
        let mut state = self.state.lock();
        trace!(version = sync.version, "async commit queued for sync");
        state.syncs.push_back(sync);
        drop(state);
        self.changed.notify_all();
    }

    /// Called whenever the write lock is released.
    pub(crate) fn on_write_released(&self, owner: u64) {
        let mut state = self.state.lock();
        if state.granted == Some(owner) {
            state.granted = None;
        }
        drop(state);
        self.changed.notify_all();
    }

    pub(crate) fn has_unsynced_commits(&self) -> bool {
        let state = self.state.lock();
        state.syncing || !state.syncs.is_empty()
    }

    pub(crate) fn last_error(&self) -> Option<Status> {
        self.state.lock().last_error.clone()
    }

    /// Blocks until every queued commit has been synced.
    pub(crate) fn wait_for_syncs(&self) {
        let mut state = self.state.lock();
        state.wait_while(&self.changed, |s| !s.shutdown && (s.syncing || !s.syncs.is_empty()));
    }

    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        let dropped = state.requests.len();
        state.requests.clear();
        drop(state);
        if dropped > 0 {
            debug!(dropped, "async write requests dropped at shutdown");
        }
        self.changed.notify_all();
    }

    // =========================================================================
    // Worker
    // =========================================================================

    fn next_job(&self) -> Option<Job> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(sync) = state.syncs.pop_front() {
                state.syncing = true;
                return Some(Job::Sync(sync));
            }
            if state.granted.is_none() {
                if let Some(req) = state.requests.front() {
                    return Some(Job::Grant {
                        handle: req.handle,
                        owner: req.owner,
                    });
                }
            }
            state.wait(&self.changed);
        }
    }

    fn run(self: Arc<Self>, db: Weak<DbInner>) {
        debug!("async commit worker started");
        while let Some(job) = self.next_job() {
            let Some(inner) = db.upgrade() else {
                break;
            };
            match job {
                Job::Grant { handle, owner } => self.grant(&inner, handle, owner),
                Job::Sync(sync) => self.sync(&inner, sync),
            }
        }
        debug!("async commit worker stopped");
    }

    fn grant(&self, inner: &DbInner, handle: AsyncWriteHandle, owner: u64) {
        if !inner.try_acquire_write(owner) {
            let mut state = self.state.lock();
            if !state.shutdown {
                state.wait_for(&self.changed, GRANT_RETRY_INTERVAL);
            }
            return;
        }
        let mut state = self.state.lock();
        let Some(pos) = state.requests.iter().position(|r| r.handle == handle) else {
            // cancelled between the lock attempt and now
            drop(state);
            inner.release_write(owner);
            return;
        };
        let Some(request) = state.requests.remove(pos) else {
            return;
        };
        state.granted = Some(owner);
        drop(state);
        debug!(handle = handle.0, owner, "async write granted");
        (request.callback)();
    }

    fn sync(&self, inner: &DbInner, mut sync: PendingSync) {
        let result = inner.persist_snapshot(sync.version, sync.top_ref, &sync.mapping);
        let status = match result {
            Ok(()) => None,
            Err(e) => {
                warn!(version = sync.version, error = %e, "async commit failed to sync");
                Some(Status::new(ErrorCode::CommitFailed, e.to_string()))
            }
        };
        let mut state = self.state.lock();
        state.syncing = false;
        if let Some(s) = &status {
            state.last_error = Some(s.clone());
        }
        drop(state);
        self.changed.notify_all();
        if let Some(cb) = sync.callback.take() {
            cb(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_follows_queues() {
        let shared = AsyncShared::new();
        assert_eq!(shared.stage(), CommitStage::Idle);

        let handle = shared.enqueue_request(7, Box::new(|| {}));
        assert_eq!(shared.stage(), CommitStage::Requesting);
        assert!(shared.cancel_request(handle));
        assert!(!shared.cancel_request(handle));
        assert_eq!(shared.stage(), CommitStage::Idle);

        shared.enqueue_sync(PendingSync {
            version: 1,
            top_ref: Ref::new(24),
            mapping: Arc::new(Mapping::empty()),
            callback: None,
        });
        assert_eq!(shared.stage(), CommitStage::HasCommits);
        assert!(shared.has_unsynced_commits());
    }

    #[test]
    fn test_shutdown_drops_requests() {
        let shared = AsyncShared::new();
        shared.enqueue_request(1, Box::new(|| {}));
        shared.shutdown();
        assert_eq!(shared.stage(), CommitStage::Idle);
        assert!(shared.next_job().is_none());
    }
}
