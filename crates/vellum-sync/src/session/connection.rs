//! The connection task of an active session.
//!
//! One task per activation. It connects, binds, exchanges messages until
//! the connection ends, then decides from the error's action whether to
//! reconnect after a backoff, refresh the access token, perform a client
//! reset, or stop the session.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::task::JoinError;
use tracing::{debug, info, warn};
use vellum_common::config::{ClientResyncMode, DbConfig, SyncMode};
use vellum_common::HistoryType;
use vellum_replication::cursor::SyncProgress;
use vellum_txn::{apply_changeset, Db};

use super::protocol::{ProtocolEvent, ProtocolSession};
use super::{SessionErrorInfo, SessionInner, SessionState, TaskSignal};
use crate::auth::{http_base_url, refresh_access_token};
use crate::client_reset::perform_client_reset;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{
    make_subprotocols, parse_subprotocol, Action, ClientMessage, ProtocolError,
    ProtocolErrorInfo, RemoteChangeset, SaltedFileIdent, ServerMessage, WebSocketCloseCode,
};
use crate::resumption::ResumptionBackoff;
use crate::transport::{WebSocket, WebSocketEndpoint, WebSocketEvent};

enum Step {
    Event(Option<WebSocketEvent>),
    Wake,
    Stop,
}

pub(super) async fn run(inner: Arc<SessionInner>, signal: Arc<TaskSignal>) {
    let mut backoff = ResumptionBackoff::new(inner.client.resumption);
    while !signal.is_stopped() {
        let result = sync_once(&inner, &signal, &mut backoff).await;
        inner.disconnected(&signal);
        let error = match result {
            Ok(()) => break,
            Err(e) => e,
        };
        if signal.is_stopped() {
            break;
        }
        let Some(delay) = recover(&inner, &signal, &error, &mut backoff).await else {
            break;
        };
        if !delay.is_zero() {
            debug!(path = %inner.path, ?delay, "reconnecting after delay");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = signal.stopped() => {}
            }
        }
    }
    debug!(path = %inner.path, "connection task finished");
}

/// Runs one connection until it ends. `Ok` means the task was stopped.
async fn sync_once(
    inner: &Arc<SessionInner>,
    signal: &TaskSignal,
    backoff: &mut ResumptionBackoff,
) -> SyncResult<()> {
    if !ensure_access_token(inner, signal).await? {
        return Ok(());
    }
    let Some(params) = inner.connecting(signal) else {
        return Ok(());
    };
    let Some(mut socket) = open_socket(inner, signal, params.mode).await? else {
        return Ok(());
    };
    if !inner.connected(signal) {
        socket.close().await;
        return Ok(());
    }
    backoff.reset();

    let mut proto = ProtocolSession::new(
        inner.ident,
        params.file_ident,
        params.progress,
        params.fast_reconnect,
    );
    if params.fast_reconnect {
        debug!(path = %inner.path, "fast reconnect, uploads enabled");
    }
    let opening = proto.bind(&inner.server_path(params.mode), &inner.user.access_token());
    if proto.ident_sent() {
        inner.assign_marks(proto.last_mark_sent());
    }
    send_all(socket.as_mut(), opening).await?;

    loop {
        flush(inner, &mut proto, socket.as_mut()).await?;
        let step = tokio::select! {
            event = socket.next_event() => Step::Event(event),
            () = signal.wake.notified() => Step::Wake,
            () = signal.stopped() => Step::Stop,
        };
        match step {
            Step::Event(Some(WebSocketEvent::Message(frame))) => {
                let msg = ServerMessage::decode(&frame)?;
                handle_message(inner, signal, &mut proto, socket.as_mut(), msg).await?;
            }
            Step::Event(Some(WebSocketEvent::Closed { code, reason })) => {
                return Err(SyncError::WebSocketClosed { code, reason });
            }
            Step::Event(None) => return Err(connection_lost()),
            Step::Wake | Step::Stop => {}
        }
        if signal.is_stopped() {
            unbind_and_close(socket.as_mut(), &mut proto).await;
            return Ok(());
        }
    }
}

fn connection_lost() -> SyncError {
    SyncError::WebSocketClosed {
        code: WebSocketCloseCode::AbnormalClosure.code(),
        reason: "connection lost".into(),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

async fn send_all(socket: &mut dyn WebSocket, msgs: Vec<ClientMessage>) -> SyncResult<()> {
    for msg in msgs {
        socket.send(msg.encode()).await?;
    }
    Ok(())
}

async fn unbind_and_close(socket: &mut dyn WebSocket, proto: &mut ProtocolSession) {
    let unbind = proto.unbind();
    if let Err(e) = socket.send(unbind.encode()).await {
        debug!(error = %e, "unbind not sent");
    }
    socket.close().await;
}

async fn open_socket(
    inner: &SessionInner,
    signal: &TaskSignal,
    mode: SyncMode,
) -> SyncResult<Option<Box<dyn WebSocket>>> {
    let endpoint = WebSocketEndpoint {
        server: inner.client.endpoint(),
        protocols: make_subprotocols(mode),
    };
    debug!(path = %inner.path, endpoint = %endpoint.server, "connecting");
    let socket = tokio::select! {
        socket = inner.client.sockets.connect(endpoint) => socket?,
        () = signal.stopped() => return Ok(None),
    };
    let (selected, version) = parse_subprotocol(socket.protocol())?;
    if selected != mode {
        return Err(SyncError::protocol(
            ProtocolError::WrongProtocolVersion,
            format!("server selected '{}' for a {mode:?} session", socket.protocol()),
        ));
    }
    debug!(path = %inner.path, version, "subprotocol negotiated");
    Ok(Some(socket))
}

/// Refreshes a missing or expired access token. False means the task
/// must stop.
async fn ensure_access_token(inner: &SessionInner, signal: &TaskSignal) -> SyncResult<bool> {
    if !inner.user.access_token_refresh_required() {
        return Ok(true);
    }
    let Some(network) = inner.client.network.clone() else {
        inner.wait_for_access_token(signal);
        return Ok(false);
    };
    inner.set_state_if(signal, SessionState::Active, SessionState::WaitingForAccessToken);
    let base_url = http_base_url(&inner.client.endpoint());
    tokio::select! {
        refreshed = refresh_access_token(&inner.user, network.as_ref(), &base_url) => {
            refreshed?;
        }
        () = signal.stopped() => return Ok(false),
    }
    inner.set_state_if(signal, SessionState::WaitingForAccessToken, SessionState::Active);
    Ok(true)
}

/// Requests marks for new download waiters and uploads local changes.
async fn flush(
    inner: &SessionInner,
    proto: &mut ProtocolSession,
    socket: &mut dyn WebSocket,
) -> SyncResult<()> {
    if inner.has_unmarked_download_waiters() {
        if let Some(mark) = proto.request_mark() {
            inner.assign_marks(proto.last_mark_sent());
            socket.send(mark.encode()).await?;
        }
    }
    if proto.can_upload() {
        if let Some((scanned, changesets)) = inner.collect_uploads(proto.last_uploaded())? {
            if let Some(upload) = proto.upload(scanned, changesets, now_ms()) {
                inner.uploaded(&upload);
                socket.send(upload.encode()).await?;
            }
        }
    }
    Ok(())
}

async fn handle_message(
    inner: &SessionInner,
    signal: &TaskSignal,
    proto: &mut ProtocolSession,
    socket: &mut dyn WebSocket,
    msg: ServerMessage,
) -> SyncResult<()> {
    match proto.receive(msg)? {
        ProtocolEvent::FileIdentAssigned(ident) => {
            inner.set_file_ident(signal, ident);
            let msgs = proto.ident_and_mark();
            inner.assign_marks(proto.last_mark_sent());
            send_all(socket, msgs).await?;
        }
        ProtocolEvent::Download {
            progress,
            downloadable_bytes,
            changesets,
        } => {
            let bytes = changesets.iter().map(|c| c.data.len() as u64).sum();
            let version = integrate_blocking(inner.db.clone(), changesets).await?;
            inner.downloaded(signal, progress, downloadable_bytes, bytes, version);
        }
        ProtocolEvent::DownloadCompleted { request } => inner.download_completed(signal, request),
        ProtocolEvent::Unbound => {}
        ProtocolEvent::Error(info) => {
            if info.action() != Action::Warning {
                return Err(SyncError::Protocol(info));
            }
            inner.report(SessionErrorInfo::from_protocol(&info, false));
        }
    }
    Ok(())
}

/// Applies server changesets in one write transaction and returns the
/// local version produced, if any.
fn integrate(db: &Db, changesets: &[RemoteChangeset]) -> SyncResult<Option<u64>> {
    if changesets.iter().all(|c| c.data.is_empty()) {
        return Ok(None);
    }
    let mut tr = db.start_write()?;
    for c in changesets.iter().filter(|c| !c.data.is_empty()) {
        apply_changeset(&mut tr, &c.data).map_err(|e| {
            SyncError::protocol(
                ProtocolError::BadChangeset,
                format!("server version {}: {e}", c.remote_version),
            )
        })?;
    }
    Ok(Some(tr.commit()?))
}

async fn integrate_blocking(db: Db, changesets: Vec<RemoteChangeset>) -> SyncResult<Option<u64>> {
    tokio::task::spawn_blocking(move || integrate(&db, &changesets))
        .await
        .map_err(join_error)?
}

fn join_error(e: JoinError) -> SyncError {
    if e.is_cancelled() {
        SyncError::Cancelled
    } else {
        SyncError::illegal(format!("blocking task failed: {e}"))
    }
}

/// Decides what follows a failed connection. `None` stops the task.
async fn recover(
    inner: &Arc<SessionInner>,
    signal: &TaskSignal,
    error: &SyncError,
    backoff: &mut ResumptionBackoff,
) -> Option<Duration> {
    let info = error.to_protocol_info();
    if let Some(delay) = info.resumption_delay_interval {
        backoff.set_info(delay);
    }
    let action = info.action();
    warn!(path = %inner.path, %error, ?action, "sync connection ended");
    match action {
        Action::ClientReset => client_reset(inner, signal, &info, false, backoff).await,
        Action::ClientResetNoRecovery => client_reset(inner, signal, &info, true, backoff).await,
        Action::MigrateToFlx | Action::RevertToPbs => {
            let mode = if action == Action::MigrateToFlx {
                SyncMode::Flx
            } else {
                SyncMode::Pbs
            };
            inner.set_mode(mode);
            client_reset(inner, signal, &info, false, backoff).await
        }
        Action::RefreshUser | Action::RefreshLocation => {
            if action == Action::RefreshLocation {
                info!(path = %inner.path, "server asked for a location refresh");
            }
            inner.user.update_access_token("", None);
            Some(backoff.next_delay())
        }
        Action::LogOutUser => {
            inner.user.log_out();
            inner.fail(SessionErrorInfo::from_protocol(&info, true));
            None
        }
        _ if info.is_fatal => {
            inner.fail(SessionErrorInfo::from_protocol(&info, true));
            None
        }
        _ => {
            if matches!(error, SyncError::Protocol(_)) {
                inner.report(SessionErrorInfo::from_protocol(&info, false));
            }
            Some(backoff.next_delay())
        }
    }
}

async fn client_reset(
    inner: &Arc<SessionInner>,
    signal: &TaskSignal,
    info: &ProtocolErrorInfo,
    recovery_disabled: bool,
    backoff: &mut ResumptionBackoff,
) -> Option<Duration> {
    let mode = inner.config.client_resync_mode;
    if mode == ClientResyncMode::Manual {
        inner.fail(SessionErrorInfo::from_protocol(info, true));
        return None;
    }
    info!(path = %inner.path, ?mode, recovery_disabled, "starting automatic client reset");
    match reset_from_fresh_copy(inner, signal, mode, recovery_disabled).await {
        Ok(()) => {
            backoff.reset();
            Some(Duration::ZERO)
        }
        Err(_) if signal.is_stopped() => None,
        Err(e @ (SyncError::ConnectionFailed(_) | SyncError::WebSocketClosed { .. }))
            if e.is_recoverable() =>
        {
            debug!(path = %inner.path, error = %e, "fresh copy download interrupted");
            Some(backoff.next_delay())
        }
        Err(e) => {
            let status = SyncError::ClientResetFailed(e.to_string()).to_status();
            inner.fail(SessionErrorInfo::from_status(status, info.action()));
            None
        }
    }
}

struct FreshCopy {
    file_ident: SaltedFileIdent,
    progress: SyncProgress,
    changesets: Vec<Bytes>,
}

async fn reset_from_fresh_copy(
    inner: &Arc<SessionInner>,
    signal: &TaskSignal,
    mode: ClientResyncMode,
    recovery_disabled: bool,
) -> SyncResult<()> {
    let fresh = fetch_fresh_copy(inner, signal).await?;
    let local = inner.unsynced_changesets()?;
    let worker = Arc::clone(inner);
    let changesets = fresh.changesets;
    let outcome = tokio::task::spawn_blocking(move || {
        let mut hooks = worker.hooks.lock();
        perform_client_reset(&worker.db, mode, recovery_disabled, &changesets, &local, &mut hooks)
    })
    .await
    .map_err(join_error)??;
    inner.reset_completed(fresh.file_ident, fresh.progress, outcome);
    Ok(())
}

/// Downloads the server's current state into a scratch database under a
/// new file identifier.
async fn fetch_fresh_copy(inner: &SessionInner, signal: &TaskSignal) -> SyncResult<FreshCopy> {
    let scratch = Db::open(DbConfig::new().with_history_type(HistoryType::SyncClient))?;
    let pin = scratch.start_read(None)?;
    let mode = inner.mode();
    let Some(mut socket) = open_socket(inner, signal, mode).await? else {
        return Err(SyncError::Cancelled);
    };
    let mut proto = ProtocolSession::new(inner.ident, None, SyncProgress::default(), false);
    let opening = proto.bind(&inner.server_path(mode), &inner.user.access_token());
    send_all(socket.as_mut(), opening).await?;

    loop {
        let event = tokio::select! {
            event = socket.next_event() => event,
            () = signal.stopped() => return Err(SyncError::Cancelled),
        };
        let frame = match event {
            Some(WebSocketEvent::Message(frame)) => frame,
            Some(WebSocketEvent::Closed { code, reason }) => {
                return Err(SyncError::WebSocketClosed { code, reason })
            }
            None => return Err(connection_lost()),
        };
        match proto.receive(ServerMessage::decode(&frame)?)? {
            ProtocolEvent::FileIdentAssigned(_) => {
                let msgs = proto.ident_and_mark();
                send_all(socket.as_mut(), msgs).await?;
            }
            ProtocolEvent::Download { changesets, .. } => {
                integrate_blocking(scratch.clone(), changesets).await?;
            }
            ProtocolEvent::DownloadCompleted { .. } => break,
            ProtocolEvent::Unbound => {}
            ProtocolEvent::Error(info) => return Err(SyncError::Protocol(info)),
        }
    }
    unbind_and_close(socket.as_mut(), &mut proto).await;

    let file_ident = proto.file_ident().ok_or_else(|| {
        SyncError::protocol(
            ProtocolError::BadClientFileIdent,
            "fresh copy finished without a file identifier",
        )
    })?;
    let changesets: Vec<Bytes> = scratch
        .start_read(None)?
        .changesets_since(pin.version())?
        .into_iter()
        .map(|(_, c)| c)
        .collect();
    info!(
        path = %inner.path,
        ident = file_ident.ident,
        changesets = changesets.len(),
        "fresh copy downloaded"
    );
    Ok(FreshCopy {
        file_ident,
        progress: *proto.progress(),
        changesets,
    })
}
