//! Shared helpers for integration tests: tracing, an in-memory sync
//! server and database shortcuts.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Once};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use vellum_common::config::{DbConfig, SyncClientConfig};
use vellum_common::types::ObjKey;
use vellum_replication::cursor::{DownloadCursor, SaltedVersion, SyncProgress, UploadCursor};
use vellum_sync::protocol::{
    ClientMessage, ProtocolError, ProtocolErrorInfo, RemoteChangeset, SaltedFileIdent, ServerMessage,
};
use vellum_sync::transport::{
    memory_network, BoxFuture, GenericNetworkTransport, MemoryServer, MemoryServerConnection,
    MemorySocketProvider, Request, Response,
};
use vellum_sync::SyncManager;
use vellum_txn::Db;

static TRACING: Once = Once::new();

/// Server URL every test client connects to.
pub const SERVER_URL: &str = "ws://sync.test:9090";

/// Salt of every file identifier and server version the server hands out.
pub const SALT: u64 = 0x5eed;

/// Table the helpers write to.
pub const ITEMS: &str = "items";

/// Installs a test subscriber honouring `RUST_LOG`; safe to call from
/// every test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

struct Entry {
    origin: u64,
    data: Bytes,
}

#[derive(Default)]
struct FileState {
    last_integrated_client_version: u64,
    upload: UploadCursor,
}

#[derive(Default)]
struct ServerState {
    history: Vec<Entry>,
    files: BTreeMap<u64, FileState>,
    next_file_ident: u64,
    required_token: Option<String>,
    tokens_seen: Vec<String>,
    bind_errors: VecDeque<ProtocolErrorInfo>,
    upload_errors: VecDeque<ProtocolErrorInfo>,
    close_codes: VecDeque<u16>,
    binds: usize,
    connections: usize,
}

struct Bound {
    file: Option<u64>,
    sent_through: u64,
}

/// A sync server that keeps one history in memory.
///
/// Clients that bind without a file identifier get a fresh one; every
/// upload is appended to the history and pushed to the other bound
/// sessions. Failures can be scripted per bind.
pub struct TestServer {
    state: Mutex<ServerState>,
    changed: watch::Sender<u64>,
}

impl TestServer {
    /// Starts accepting connections from `server`.
    pub fn start(server: MemoryServer) -> Arc<Self> {
        init_tracing();
        let (changed, _) = watch::channel(0);
        let this = Arc::new(Self {
            state: Mutex::new(ServerState {
                next_file_ident: 1,
                ..Default::default()
            }),
            changed,
        });
        let acceptor = Arc::clone(&this);
        tokio::spawn(async move {
            while let Some(conn) = server.accept().await {
                acceptor.state.lock().connections += 1;
                tokio::spawn(Arc::clone(&acceptor).serve(conn));
            }
        });
        this
    }

    /// Rejects binds whose token differs from `token` with close code 4001.
    pub fn require_token(&self, token: &str) {
        self.state.lock().required_token = Some(token.to_string());
    }

    /// Answers the next bind with `info`.
    pub fn fail_next_bind(&self, info: ProtocolErrorInfo) {
        self.state.lock().bind_errors.push_back(info);
    }

    /// Answers the next upload with `info`.
    pub fn fail_next_upload(&self, info: ProtocolErrorInfo) {
        self.state.lock().upload_errors.push_back(info);
    }

    /// Closes the connection of the next bind with `code`.
    pub fn close_next_bind(&self, code: u16) {
        self.state.lock().close_codes.push_back(code);
    }

    /// Forgets every client file and all history after the first `keep`
    /// entries, as if the server was restored from a backup.
    pub fn restore_backup(&self, keep: usize) {
        let mut state = self.state.lock();
        state.history.truncate(keep);
        state.files.clear();
    }

    /// Number of changesets in the server history.
    pub fn history_len(&self) -> usize {
        self.state.lock().history.len()
    }

    /// Bind messages received so far.
    pub fn binds(&self) -> usize {
        self.state.lock().binds
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.state.lock().connections
    }

    /// Access tokens presented by binds, oldest first.
    pub fn tokens_seen(&self) -> Vec<String> {
        self.state.lock().tokens_seen.clone()
    }

    /// Number of client files the server knows.
    pub fn file_count(&self) -> usize {
        self.state.lock().files.len()
    }

    async fn serve(self: Arc<Self>, mut conn: MemoryServerConnection) {
        let mut changed = self.changed.subscribe();
        let mut sessions: BTreeMap<u64, Bound> = BTreeMap::new();
        loop {
            tokio::select! {
                frame = conn.recv() => {
                    let Some(frame) = frame else { return };
                    let Ok(msg) = ClientMessage::decode(&frame) else {
                        conn.close(1002, "undecodable frame");
                        return;
                    };
                    if !self.handle(&conn, &mut sessions, msg) {
                        return;
                    }
                }
                res = changed.changed() => {
                    if res.is_err() {
                        return;
                    }
                    for (session, bound) in &mut sessions {
                        self.send_download(&conn, *session, bound);
                    }
                }
            }
        }
    }

    /// Returns false once the connection was closed.
    fn handle(
        &self,
        conn: &MemoryServerConnection,
        sessions: &mut BTreeMap<u64, Bound>,
        msg: ClientMessage,
    ) -> bool {
        match msg {
            ClientMessage::Bind {
                session,
                signed_user_token,
                need_client_file_ident,
                ..
            } => {
                let mut state = self.state.lock();
                state.binds += 1;
                state.tokens_seen.push(signed_user_token.clone());
                if let Some(code) = state.close_codes.pop_front() {
                    conn.close(code, "scripted close");
                    return false;
                }
                if state
                    .required_token
                    .as_ref()
                    .map_or(false, |t| *t != signed_user_token)
                {
                    conn.close(4001, "access token expired");
                    return false;
                }
                if let Some(info) = state.bind_errors.pop_front() {
                    send(conn, &ServerMessage::Error { session, info });
                    return true;
                }
                sessions.insert(
                    session,
                    Bound {
                        file: None,
                        sent_through: 0,
                    },
                );
                if need_client_file_ident {
                    let ident = state.next_file_ident;
                    state.next_file_ident += 1;
                    state.files.insert(ident, FileState::default());
                    send(
                        conn,
                        &ServerMessage::Ident {
                            session,
                            file_ident: SaltedFileIdent { ident, salt: SALT },
                        },
                    );
                }
            }
            ClientMessage::Ident {
                session,
                file_ident,
                progress,
            } => {
                let known = file_ident.salt == SALT
                    && self.state.lock().files.contains_key(&file_ident.ident);
                if !known {
                    let info = ProtocolErrorInfo::from_error(ProtocolError::BadClientFileIdent, false);
                    send(conn, &ServerMessage::Error { session, info });
                    return true;
                }
                if let Some(bound) = sessions.get_mut(&session) {
                    bound.file = Some(file_ident.ident);
                    bound.sent_through = progress.download.server_version;
                    self.send_download(conn, session, bound);
                }
            }
            ClientMessage::Upload {
                session,
                progress,
                changesets,
                ..
            } => {
                let Some(bound) = sessions.get_mut(&session) else {
                    return true;
                };
                let Some(origin) = bound.file else {
                    return true;
                };
                let error = {
                    let mut state = self.state.lock();
                    let mut appended = Vec::new();
                    if let Some(file) = state.files.get_mut(&origin) {
                        for c in changesets {
                            if c.client_version > file.last_integrated_client_version {
                                file.last_integrated_client_version = c.client_version;
                                appended.push(Entry {
                                    origin,
                                    data: c.data,
                                });
                            }
                        }
                        file.upload = progress;
                    }
                    state.history.extend(appended);
                    state.upload_errors.pop_front()
                };
                if let Some(info) = error {
                    send(conn, &ServerMessage::Error { session, info });
                }
                self.send_download(conn, session, bound);
                self.changed.send_modify(|n| *n += 1);
            }
            ClientMessage::Mark {
                session,
                request_ident,
            } => {
                if let Some(bound) = sessions.get_mut(&session) {
                    self.send_download(conn, session, bound);
                }
                send(
                    conn,
                    &ServerMessage::Mark {
                        session,
                        request_ident,
                    },
                );
            }
            ClientMessage::Unbind { session } => {
                sessions.remove(&session);
                send(conn, &ServerMessage::Unbound { session });
            }
        }
        true
    }

    fn send_download(&self, conn: &MemoryServerConnection, session: u64, bound: &mut Bound) {
        let state = self.state.lock();
        let Some(ident) = bound.file else {
            return;
        };
        let Some(file) = state.files.get(&ident) else {
            return;
        };
        let latest = state.history.len() as u64;
        let changesets = state
            .history
            .iter()
            .enumerate()
            .skip(bound.sent_through as usize)
            .filter(|(_, e)| e.origin != ident)
            .map(|(i, e)| RemoteChangeset {
                remote_version: i as u64 + 1,
                last_integrated_local_version: file.last_integrated_client_version,
                origin_timestamp: 0,
                origin_file_ident: e.origin,
                original_changeset_size: e.data.len() as u64,
                data: e.data.clone(),
            })
            .collect();
        bound.sent_through = latest.max(bound.sent_through);
        let progress = SyncProgress {
            latest_server_version: SaltedVersion {
                version: latest,
                salt: SALT,
            },
            download: DownloadCursor::new(latest, file.last_integrated_client_version),
            upload: file.upload,
        };
        send(
            conn,
            &ServerMessage::Download {
                session,
                progress,
                downloadable_bytes: 0,
                changesets,
            },
        );
    }
}

fn send(conn: &MemoryServerConnection, msg: &ServerMessage) {
    let frame = msg.encode().expect("encode server message");
    let _ = conn.send(frame);
}

/// Answers every token refresh with `{"access_token": token}`.
pub struct TokenEndpoint {
    token: String,
    requests: Mutex<Vec<Request>>,
}

impl TokenEndpoint {
    pub fn new(token: &str) -> Arc<Self> {
        Arc::new(Self {
            token: token.to_string(),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn last_url(&self) -> Option<String> {
        self.requests.lock().last().map(|r| r.url.clone())
    }
}

impl GenericNetworkTransport for TokenEndpoint {
    fn send_request_to_server(&self, request: Request) -> BoxFuture<'_, Response> {
        self.requests.lock().push(request);
        Box::pin(async move {
            Response {
                http_status_code: 200,
                body: format!(r#"{{"access_token":"{}"}}"#, self.token),
                ..Default::default()
            }
        })
    }
}

/// A running server plus the socket provider clients connect with.
pub struct Harness {
    pub server: Arc<TestServer>,
    pub sockets: Arc<MemorySocketProvider>,
}

impl Harness {
    pub fn start() -> Self {
        let (sockets, server) = memory_network();
        Self {
            server: TestServer::start(server),
            sockets,
        }
    }

    /// A sync manager with short reconnect delays and one logged in user.
    pub fn manager(&self, network: Option<Arc<dyn GenericNetworkTransport>>) -> SyncManager {
        let config = SyncClientConfig::for_testing().with_server_url(SERVER_URL);
        let manager = SyncManager::new(config, self.sockets.clone(), network)
            .expect("create sync manager");
        manager.log_in_user("alice", "access-1", "refresh-1");
        manager
    }
}

/// An in-memory database with sync-capable history.
pub fn sync_db() -> Db {
    init_tracing();
    Db::open(DbConfig::for_testing()).expect("open in-memory db")
}

/// Commits one object with `key` to the items table, creating the table
/// if needed, and returns the new version.
pub fn add_item(db: &Db, key: i64) -> u64 {
    let mut w = db.start_write().expect("start write");
    let table = match w.find_table(ITEMS).expect("find table") {
        Some(t) => t,
        None => w.add_table(ITEMS).expect("add table"),
    };
    w.create_object_with_key(table, ObjKey::new(key))
        .expect("create object");
    w.commit().expect("commit")
}

/// Keys of every object in the items table.
pub fn item_keys(db: &Db) -> Vec<i64> {
    let r = db.start_read(None).expect("start read");
    match r.find_table(ITEMS).expect("find table") {
        Some(t) => r
            .object_keys(t)
            .expect("object keys")
            .into_iter()
            .map(ObjKey::value)
            .collect(),
        None => Vec::new(),
    }
}

/// Polls `done` until it holds, panicking after five seconds.
pub async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !done() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
