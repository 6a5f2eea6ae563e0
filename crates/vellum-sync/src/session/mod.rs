//! Sync sessions.
//!
//! A [`SyncSession`] keeps one local database in sync with one server
//! file. Its lifecycle:
//!
//! ```text
//!            revive                   close (AfterChangesUploaded)
//! Inactive ─────────► Active ──────────────────────────────────► Dying
//!    ▲   token missing  │ ▲                                        │
//!    │        ▼         │ └──────────── revive ───────────────────┤
//!    │  WaitingForAccessToken                     uploads done    │
//!    └──────────────────┴─────────────────────────────────────────┘
//!
//! any state ── pause ──► Paused ── resume ──► Inactive ── revive ──► ...
//! ```
//!
//! While active, a background task owns the connection: it binds the
//! session, integrates downloads, uploads local changes and reconnects
//! with backoff. Everything the task shares with the application lives in
//! `SessionInner` behind the session lock. The database is never called
//! while that lock is held.

mod connection;
mod protocol;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};
use vellum_common::config::{StopPolicy, SyncConfig, SyncMode};
use vellum_common::lock_tag;
use vellum_common::sync::Guarded;
use vellum_common::{ErrorCode, Status};
use vellum_replication::cursor::SyncProgress;
use vellum_txn::{Db, Transaction};

use crate::auth::SyncUser;
use crate::client::SyncClient;
use crate::client_reset::{ClientResetHooks, ClientResetOutcome};
use crate::error::SyncResult;
use crate::progress::{ProgressCallback, ProgressDirection, ProgressValues, SyncProgressNotifier};
use crate::protocol::{Action, ClientMessage, CompensatingWriteInfo, ProtocolErrorInfo, SaltedFileIdent};

lock_tag!(UploadAnchorLock, "sync.upload_anchor", 5);
lock_tag!(ResetHooksLock, "sync.reset_hooks", 6);
lock_tag!(SessionLock, "sync.session", 100);

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected or trying to connect.
    Active,
    /// Closed by the application; uploading what is left before going
    /// inactive.
    Dying,
    /// Not syncing.
    Inactive,
    /// Needs an access token before it can connect.
    WaitingForAccessToken,
    /// Stopped by the application until resumed.
    Paused,
}

/// State of the session's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection.
    Disconnected,
    /// Connecting or waiting to reconnect.
    Connecting,
    /// Bound on an open connection.
    Connected,
}

/// Receives the outcome of a completion wait.
pub type CompletionCallback = Box<dyn FnOnce(Status) + Send>;

/// Error delivered to the application.
#[derive(Debug, Clone)]
pub struct SessionErrorInfo {
    /// Error code and message; fatal errors include the server log URL.
    pub status: Status,
    /// True if the session stopped because of the error.
    pub is_fatal: bool,
    /// What the server asked the client to do.
    pub action: Action,
    /// Server log entry describing the error.
    pub log_url: Option<String>,
    /// Writes the server reverted.
    pub compensating_writes: Vec<CompensatingWriteInfo>,
}

impl SessionErrorInfo {
    fn from_protocol(info: &ProtocolErrorInfo, is_fatal: bool) -> Self {
        let mut info = info.clone();
        info.is_fatal = is_fatal;
        Self {
            status: info.to_status(),
            is_fatal,
            action: info.action(),
            log_url: info.log_url.clone(),
            compensating_writes: info.compensating_writes,
        }
    }

    fn from_status(status: Status, action: Action) -> Self {
        Self {
            status,
            is_fatal: true,
            action,
            log_url: None,
            compensating_writes: Vec::new(),
        }
    }
}

/// Called with every error a session reports.
pub type SessionErrorHandler = Arc<dyn Fn(SessionErrorInfo) + Send + Sync>;

/// Stop and wake-up signals of one connection task.
pub(crate) struct TaskSignal {
    stopped: AtomicBool,
    stop: Notify,
    wake: Notify,
}

impl TaskSignal {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            stopped: AtomicBool::new(false),
            stop: Notify::new(),
            wake: Notify::new(),
        })
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop.notify_one();
    }

    async fn stopped(&self) {
        if !self.is_stopped() {
            self.stop.notified().await;
        }
    }
}

struct SessionData {
    state: SessionState,
    connection: ConnectionState,
    task: Option<Arc<TaskSignal>>,
    death_count: u64,
    mode: SyncMode,
    file_ident: Option<SaltedFileIdent>,
    progress: SyncProgress,
    /// Local versions up to here are never uploaded from history.
    upload_floor: u64,
    /// Local versions produced by integrating downloads.
    integrated: BTreeSet<u64>,
    /// Changes replayed by a client reset, uploaded under the reset version.
    recovered: Option<(u64, Bytes)>,
    in_flight: BTreeMap<u64, u64>,
    uploaded_bytes: u64,
    downloaded_bytes: u64,
    downloadable_bytes: u64,
    upload_waiters: Vec<(u64, CompletionCallback)>,
    download_waiters: Vec<(Option<u64>, CompletionCallback)>,
    last_disconnect: Option<Instant>,
    error_handler: Option<SessionErrorHandler>,
    last_error: Option<Status>,
}

impl SessionData {
    fn uploaded_through(&self) -> u64 {
        self.progress.upload.client_version.max(self.upload_floor)
    }

    fn progress_values(&self, snapshot_version: u64) -> ProgressValues {
        ProgressValues {
            uploaded: self.uploaded_bytes,
            uploadable: self.uploaded_bytes + self.in_flight.values().sum::<u64>(),
            downloaded: self.downloaded_bytes,
            downloadable: self.downloaded_bytes + self.downloadable_bytes,
            snapshot_version,
        }
    }

    fn take_finished_uploads(&mut self) -> Vec<CompletionCallback> {
        let done = self.uploaded_through();
        let (ready, waiting) = std::mem::take(&mut self.upload_waiters)
            .into_iter()
            .partition::<Vec<_>, _>(|(target, _)| *target <= done);
        self.upload_waiters = waiting;
        ready.into_iter().map(|(_, cb)| cb).collect()
    }

    /// Starts a connection task and returns its signal, stopping any
    /// previous one.
    fn start_task(&mut self, state: SessionState) -> Arc<TaskSignal> {
        self.stop_task();
        self.state = state;
        let signal = TaskSignal::new();
        self.task = Some(Arc::clone(&signal));
        signal
    }

    fn stop_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.stop();
        }
        self.connection = ConnectionState::Disconnected;
    }

    fn owns(&self, signal: &TaskSignal) -> bool {
        !signal.is_stopped()
            && self
                .task
                .as_ref()
                .map_or(false, |t| std::ptr::eq(t.as_ref(), signal))
    }

    fn wake_task(&self) {
        if let Some(task) = &self.task {
            task.wake.notify_one();
        }
    }
}

fn call_all(callbacks: Vec<CompletionCallback>, status: &Status) {
    for cb in callbacks {
        cb(status.clone());
    }
}

fn inactive_status() -> Status {
    Status::new(ErrorCode::Cancelled, "sync session became inactive")
}

pub(crate) struct SessionInner {
    ident: u64,
    path: String,
    config: SyncConfig,
    stop_policy: StopPolicy,
    client: Arc<SyncClient>,
    user: Arc<SyncUser>,
    db: Db,
    data: Guarded<SessionData, SessionLock>,
    anchor: Guarded<Option<Transaction>, UploadAnchorLock>,
    hooks: Guarded<ClientResetHooks, ResetHooksLock>,
    progress: SyncProgressNotifier,
}

/// Synchronizes one local database with the server.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct SyncSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("path", &self.inner.path)
            .field("state", &self.state())
            .finish()
    }
}

impl SyncSession {
    pub(crate) fn new(
        ident: u64,
        path: String,
        db: Db,
        config: SyncConfig,
        user: Arc<SyncUser>,
        client: Arc<SyncClient>,
    ) -> SyncResult<Self> {
        // history newer than the anchor stays available for uploading
        let (anchor, floor) = match db.start_read(Some(0)) {
            Ok(tr) => (tr, 0),
            Err(_) => {
                let tr = db.start_read(None)?;
                warn!(
                    path = %path,
                    version = tr.version(),
                    "local history before the session started is unavailable; it will not be uploaded"
                );
                let version = tr.version();
                (tr, version)
            }
        };
        let stop_policy = config.stop_policy.unwrap_or(client.config.stop_policy);
        let inner = SessionInner {
            ident,
            path,
            stop_policy,
            client,
            user,
            db,
            data: Guarded::new(SessionData {
                state: SessionState::Inactive,
                connection: ConnectionState::Disconnected,
                task: None,
                death_count: 0,
                mode: config.mode,
                file_ident: None,
                progress: SyncProgress::default(),
                upload_floor: floor,
                integrated: BTreeSet::new(),
                recovered: None,
                in_flight: BTreeMap::new(),
                uploaded_bytes: 0,
                downloaded_bytes: 0,
                downloadable_bytes: 0,
                upload_waiters: Vec::new(),
                download_waiters: Vec::new(),
                last_disconnect: None,
                error_handler: None,
                last_error: None,
            }),
            config,
            anchor: Guarded::new(Some(anchor)),
            hooks: Guarded::new(ClientResetHooks::default()),
            progress: SyncProgressNotifier::new(),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Local path the session was registered under.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Session configuration.
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Effective stop policy.
    #[must_use]
    pub fn stop_policy(&self) -> StopPolicy {
        self.inner.stop_policy
    }

    /// Owning user.
    #[must_use]
    pub fn user(&self) -> &Arc<SyncUser> {
        &self.inner.user
    }

    /// The synchronized database.
    #[must_use]
    pub fn db(&self) -> &Db {
        &self.inner.db
    }

    /// Lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.data.lock().state
    }

    /// Connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.data.lock().connection
    }

    /// Protocol flavor currently in use.
    pub fn sync_mode(&self) -> SyncMode {
        self.inner.data.lock().mode
    }

    /// Identifier the server assigned to the local file.
    pub fn file_ident(&self) -> Option<SaltedFileIdent> {
        self.inner.data.lock().file_ident
    }

    /// Upload and download cursors.
    pub fn sync_progress(&self) -> SyncProgress {
        self.inner.data.lock().progress
    }

    /// The error that last stopped the session.
    pub fn last_error(&self) -> Option<Status> {
        self.inner.data.lock().last_error.clone()
    }

    /// Installs the error handler.
    pub fn set_error_handler(&self, handler: SessionErrorHandler) {
        self.inner.data.lock().error_handler = Some(handler);
    }

    /// Installs hooks that run around an automatic client reset.
    pub fn set_client_reset_hooks(&self, hooks: ClientResetHooks) {
        *self.inner.hooks.lock() = hooks;
    }

    /// Starts syncing if the session is inactive, or cancels a pending
    /// shutdown if it is dying.
    pub fn revive_if_needed(&self) {
        self.inner.revive_if_needed();
    }

    /// Closes the session according to its stop policy.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Stops syncing at once, regardless of the stop policy.
    pub fn force_close(&self) {
        self.inner.become_inactive(None);
    }

    /// Stops syncing until [`resume`](Self::resume) is called.
    pub fn pause(&self) {
        self.inner.pause();
    }

    /// Restarts a paused session.
    pub fn resume(&self) {
        self.inner.resume();
    }

    /// Stores a new access token and reconnects a session that was
    /// waiting for one.
    pub fn update_access_token(&self, token: impl Into<String>) {
        self.inner.user.update_access_token(token, None);
        let waiting = self.state() == SessionState::WaitingForAccessToken;
        if waiting {
            debug!(path = %self.inner.path, "access token updated");
            self.inner.become_active();
        }
    }

    /// Tells the session that a local write committed `version`.
    pub fn nonsync_transact_notify(&self, version: u64) {
        debug!(path = %self.inner.path, version, "local commit");
        self.inner.data.lock().wake_task();
    }

    /// Registers a progress callback; returns a token for unregistering.
    pub fn register_progress_notifier(
        &self,
        direction: ProgressDirection,
        streaming: bool,
        callback: ProgressCallback,
    ) -> u64 {
        self.inner.progress.register(direction, streaming, callback)
    }

    /// Removes a progress callback.
    pub fn unregister_progress_notifier(&self, token: u64) {
        self.inner.progress.unregister(token);
    }

    /// Calls `callback` once every local change committed so far has been
    /// acknowledged by the server.
    pub fn wait_for_upload_completion(&self, callback: CompletionCallback) {
        self.inner.wait_for_upload_completion(callback);
    }

    /// Calls `callback` once everything the server had when the request
    /// reached it has been integrated.
    pub fn wait_for_download_completion(&self, callback: CompletionCallback) {
        self.inner.wait_for_download_completion(callback);
    }

    /// Waits until every local change committed so far has been uploaded.
    pub async fn upload_completion(&self) -> Result<(), Status> {
        let (tx, rx) = oneshot::channel();
        self.wait_for_upload_completion(Box::new(move |status| {
            let _ = tx.send(status);
        }));
        completion(rx).await
    }

    /// Waits until the server's current state has been downloaded.
    pub async fn download_completion(&self) -> Result<(), Status> {
        let (tx, rx) = oneshot::channel();
        self.wait_for_download_completion(Box::new(move |status| {
            let _ = tx.send(status);
        }));
        completion(rx).await
    }
}

async fn completion(rx: oneshot::Receiver<Status>) -> Result<(), Status> {
    let status = rx.await.unwrap_or_else(|_| inactive_status());
    if status.is_ok() {
        Ok(())
    } else {
        Err(status)
    }
}

impl SessionInner {
    fn server_path(&self, mode: SyncMode) -> String {
        match mode {
            SyncMode::Pbs => format!("/{}", self.config.partition_value),
            SyncMode::Flx => "/flx".to_string(),
        }
    }

    fn revive_if_needed(self: &Arc<Self>) {
        let state = self.data.lock().state;
        match state {
            SessionState::Inactive => self.become_active(),
            SessionState::Dying => {
                let mut data = self.data.lock();
                if data.state == SessionState::Dying {
                    data.state = SessionState::Active;
                    data.death_count += 1;
                    info!(path = %self.path, "session revived");
                }
            }
            SessionState::Active | SessionState::WaitingForAccessToken | SessionState::Paused => {}
        }
    }

    /// Starts a connection task, first refreshing the access token if
    /// needed.
    fn become_active(self: &Arc<Self>) {
        if !self.user.is_logged_in() {
            warn!(path = %self.path, user = %self.user.id(), "user is logged out; session stays inactive");
            return;
        }
        let needs_token = self.user.access_token_refresh_required();
        if needs_token && self.client.network.is_none() {
            let mut data = self.data.lock();
            data.stop_task();
            data.state = SessionState::WaitingForAccessToken;
            info!(path = %self.path, "waiting for an access token");
            return;
        }
        let state = if needs_token {
            SessionState::WaitingForAccessToken
        } else {
            SessionState::Active
        };
        let signal = {
            let mut data = self.data.lock();
            data.last_error = None;
            data.start_task(state)
        };
        info!(path = %self.path, ?state, "session starting");
        self.client
            .runtime
            .spawn(connection::run(Arc::clone(self), signal));
    }

    fn close(self: &Arc<Self>) {
        let state = self.data.lock().state;
        match state {
            SessionState::Active => match self.stop_policy {
                StopPolicy::Immediately => self.become_inactive(None),
                StopPolicy::LiveIndefinitely => {}
                StopPolicy::AfterChangesUploaded => self.become_dying(),
            },
            SessionState::WaitingForAccessToken => self.become_inactive(None),
            SessionState::Dying | SessionState::Inactive | SessionState::Paused => {}
        }
    }

    fn become_dying(self: &Arc<Self>) {
        let target = self.db.latest_version();
        let weak: Weak<Self> = Arc::downgrade(self);
        let ready = {
            let mut data = self.data.lock();
            if data.state != SessionState::Active {
                return;
            }
            data.state = SessionState::Dying;
            data.death_count += 1;
            let death = data.death_count;
            data.upload_waiters.push((
                target,
                Box::new(move |status: Status| {
                    if let Some(inner) = weak.upgrade() {
                        inner.finish_dying(death, status);
                    }
                }),
            ));
            data.wake_task();
            data.take_finished_uploads()
        };
        info!(path = %self.path, target, "session dying");
        call_all(ready, &Status::ok());
    }

    fn finish_dying(&self, death: u64, status: Status) {
        let dead = {
            let data = self.data.lock();
            data.state == SessionState::Dying && data.death_count == death
        };
        if dead && status.is_ok() {
            self.become_inactive(None);
        }
    }

    /// Stops syncing and fails every pending completion wait.
    pub(crate) fn become_inactive(&self, error: Option<Status>) {
        let (uploads, downloads) = {
            let mut data = self.data.lock();
            if data.state == SessionState::Inactive {
                return;
            }
            data.stop_task();
            data.state = SessionState::Inactive;
            data.last_disconnect = None;
            if error.is_some() {
                data.last_error = error.clone();
            }
            (
                std::mem::take(&mut data.upload_waiters),
                std::mem::take(&mut data.download_waiters),
            )
        };
        info!(path = %self.path, error = ?error.as_ref().map(Status::reason), "session inactive");
        let status = error.unwrap_or_else(inactive_status);
        call_all(uploads.into_iter().map(|(_, cb)| cb).collect(), &status);
        call_all(downloads.into_iter().map(|(_, cb)| cb).collect(), &status);
    }

    fn pause(&self) {
        let (uploads, downloads) = {
            let mut data = self.data.lock();
            if data.state == SessionState::Paused {
                return;
            }
            data.stop_task();
            data.state = SessionState::Paused;
            (
                std::mem::take(&mut data.upload_waiters),
                std::mem::take(&mut data.download_waiters),
            )
        };
        info!(path = %self.path, "session paused");
        let status = Status::new(ErrorCode::Cancelled, "sync session was paused");
        call_all(uploads.into_iter().map(|(_, cb)| cb).collect(), &status);
        call_all(downloads.into_iter().map(|(_, cb)| cb).collect(), &status);
    }

    fn resume(self: &Arc<Self>) {
        {
            let mut data = self.data.lock();
            if data.state != SessionState::Paused {
                return;
            }
            data.state = SessionState::Inactive;
        }
        info!(path = %self.path, "session resumed");
        self.become_active();
    }

    fn wait_for_upload_completion(&self, callback: CompletionCallback) {
        let target = self.db.latest_version();
        let ready = {
            let mut data = self.data.lock();
            data.upload_waiters.push((target, callback));
            data.wake_task();
            data.take_finished_uploads()
        };
        call_all(ready, &Status::ok());
    }

    fn wait_for_download_completion(&self, callback: CompletionCallback) {
        let mut data = self.data.lock();
        data.download_waiters.push((None, callback));
        data.wake_task();
    }

    /// Delivers an error to the application's handler.
    pub(crate) fn report(&self, error: SessionErrorInfo) {
        let handler = self.data.lock().error_handler.clone();
        if error.is_fatal {
            warn!(path = %self.path, status = %error.status, "fatal sync error");
        } else {
            debug!(path = %self.path, status = %error.status, "sync error");
        }
        if let Some(handler) = handler {
            handler(error);
        }
    }

    /// Reports `info` as fatal and stops the session.
    fn fail(&self, info: SessionErrorInfo) {
        let status = info.status.clone();
        self.report(info);
        self.become_inactive(Some(status));
    }

    // Connection task callbacks. Each one ignores a task that was stopped.

    fn connecting(&self, signal: &TaskSignal) -> Option<ConnectParams> {
        let mut data = self.data.lock();
        if !data.owns(signal) {
            return None;
        }
        data.connection = ConnectionState::Connecting;
        let fast_reconnect = data
            .last_disconnect
            .map_or(false, |at| at.elapsed() < self.client.config.fast_reconnect_limit());
        Some(ConnectParams {
            mode: data.mode,
            file_ident: data.file_ident,
            progress: data.progress,
            fast_reconnect,
        })
    }

    fn connected(&self, signal: &TaskSignal) -> bool {
        let mut data = self.data.lock();
        if !data.owns(signal) {
            return false;
        }
        data.connection = ConnectionState::Connected;
        info!(path = %self.path, "connected");
        true
    }

    fn disconnected(&self, signal: &TaskSignal) {
        let mut data = self.data.lock();
        if !data.owns(signal) {
            return;
        }
        data.connection = ConnectionState::Connecting;
        data.last_disconnect = Some(Instant::now());
        data.in_flight.clear();
        for (mark, _) in &mut data.download_waiters {
            *mark = None;
        }
    }

    fn set_state_if(&self, signal: &TaskSignal, from: SessionState, to: SessionState) {
        let mut data = self.data.lock();
        if data.owns(signal) && data.state == from {
            data.state = to;
            debug!(path = %self.path, ?from, ?to, "session state changed");
        }
    }

    /// Stops the task and waits for the application to supply a token.
    fn wait_for_access_token(&self, signal: &TaskSignal) {
        let mut data = self.data.lock();
        if data.owns(signal) {
            data.stop_task();
            data.state = SessionState::WaitingForAccessToken;
            info!(path = %self.path, "waiting for an access token");
        }
    }

    fn set_mode(&self, mode: SyncMode) {
        let mut data = self.data.lock();
        if data.mode != mode {
            info!(path = %self.path, from = ?data.mode, to = ?mode, "switching sync mode");
            data.mode = mode;
        }
    }

    fn mode(&self) -> SyncMode {
        self.data.lock().mode
    }

    fn set_file_ident(&self, signal: &TaskSignal, ident: SaltedFileIdent) {
        let mut data = self.data.lock();
        if data.owns(signal) {
            debug!(path = %self.path, ident = ident.ident, "file identifier assigned");
            data.file_ident = Some(ident);
        }
    }

    /// Binds waiters without a mark to `mark`.
    fn assign_marks(&self, mark: u64) {
        let mut data = self.data.lock();
        for (m, _) in &mut data.download_waiters {
            m.get_or_insert(mark);
        }
    }

    fn has_unmarked_download_waiters(&self) -> bool {
        self.data
            .lock()
            .download_waiters
            .iter()
            .any(|(m, _)| m.is_none())
    }

    fn download_completed(&self, signal: &TaskSignal, request: u64) {
        let ready = {
            let mut data = self.data.lock();
            if !data.owns(signal) {
                return;
            }
            let (ready, waiting) = std::mem::take(&mut data.download_waiters)
                .into_iter()
                .partition::<Vec<_>, _>(|(m, _)| m.map_or(false, |m| m <= request));
            data.download_waiters = waiting;
            ready
        };
        debug!(path = %self.path, request, "download complete");
        call_all(ready.into_iter().map(|(_, cb)| cb).collect(), &Status::ok());
    }

    /// Records a download message that was integrated into local version
    /// `version`, if any.
    fn downloaded(
        &self,
        signal: &TaskSignal,
        progress: SyncProgress,
        downloadable_bytes: u64,
        bytes: u64,
        version: Option<u64>,
    ) {
        let latest = self.db.latest_version();
        let (ready, values, acked) = {
            let mut data = self.data.lock();
            if !data.owns(signal) {
                return;
            }
            data.progress = progress;
            let acked = progress.upload.client_version;
            if let Some(v) = version {
                data.integrated.insert(v);
            }
            data.integrated.retain(|v| *v > acked);
            let still_in_flight = data.in_flight.split_off(&(acked + 1));
            let acked_bytes: u64 = std::mem::replace(&mut data.in_flight, still_in_flight)
                .values()
                .sum();
            data.uploaded_bytes += acked_bytes;
            if data.recovered.as_ref().map_or(false, |(v, _)| *v <= acked) {
                data.recovered = None;
            }
            data.downloaded_bytes += bytes;
            data.downloadable_bytes = downloadable_bytes;
            (
                data.take_finished_uploads(),
                data.progress_values(latest),
                acked,
            )
        };
        self.advance_anchor(acked);
        self.progress.update(values);
        call_all(ready, &Status::ok());
    }

    /// Moves the history anchor forward once the server acknowledged
    /// everything up to `acked`.
    fn advance_anchor(&self, acked: u64) {
        let floor = self.data.lock().upload_floor;
        let mut anchor = self.anchor.lock();
        let current = anchor.as_ref().map_or(0, Transaction::version);
        if acked <= current || acked <= floor {
            return;
        }
        if let Ok(tr) = self.db.start_read(Some(acked)) {
            *anchor = Some(tr);
        }
    }

    /// Local changesets not yet uploaded on this connection: everything
    /// after `from` except versions produced by downloads. Returns the
    /// newest version scanned.
    fn collect_uploads(&self, from: u64) -> SyncResult<Option<(u64, Vec<(u64, Bytes)>)>> {
        let reader = self.db.start_read(None)?;
        let latest = reader.version();
        if latest <= from {
            return Ok(None);
        }
        let (start, integrated, recovered) = {
            let data = self.data.lock();
            (
                from.max(data.upload_floor),
                data.integrated.clone(),
                data.recovered.clone(),
            )
        };
        let mut out = Vec::new();
        if let Some((v, bytes)) = recovered {
            if v > from {
                out.push((v, bytes));
            }
        }
        if latest > start {
            out.extend(
                reader
                    .changesets_since(start)?
                    .into_iter()
                    .filter(|(v, _)| !integrated.contains(v)),
            );
        }
        Ok(Some((latest, out)))
    }

    fn uploaded(&self, msg: &ClientMessage) {
        let ClientMessage::Upload { changesets, .. } = msg else {
            return;
        };
        let latest = self.db.latest_version();
        let values = {
            let mut data = self.data.lock();
            for c in changesets {
                data.in_flight.insert(c.client_version, c.data.len() as u64);
            }
            data.progress_values(latest)
        };
        self.progress.update(values);
    }

    /// Changes the server has not acknowledged, oldest first.
    fn unsynced_changesets(&self) -> SyncResult<Vec<Bytes>> {
        let acked = self.data.lock().uploaded_through();
        Ok(self
            .collect_uploads(acked)?
            .map(|(_, changesets)| changesets.into_iter().map(|(_, c)| c).collect())
            .unwrap_or_default())
    }

    /// Adopts the fresh server file after a client reset.
    fn reset_completed(
        &self,
        file_ident: SaltedFileIdent,
        progress: SyncProgress,
        outcome: ClientResetOutcome,
    ) {
        let anchor = self
            .db
            .start_read(Some(outcome.version))
            .or_else(|_| self.db.start_read(None))
            .ok();
        {
            // the database is already rewritten, stopped task or not
            let mut data = self.data.lock();
            data.file_ident = Some(file_ident);
            data.progress = progress;
            data.upload_floor = outcome.version;
            data.integrated.clear();
            data.in_flight.clear();
            data.recovered = outcome.recovered.map(|bytes| (outcome.version, bytes));
        }
        let previous = std::mem::replace(&mut *self.anchor.lock(), anchor);
        drop(previous);
        info!(
            path = %self.path,
            ident = file_ident.ident,
            version = outcome.version,
            recovered = outcome.did_recover,
            "client reset adopted"
        );
    }
}

struct ConnectParams {
    mode: SyncMode,
    file_ident: Option<SaltedFileIdent>,
    progress: SyncProgress,
    fast_reconnect: bool,
}
