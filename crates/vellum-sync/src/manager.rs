//! The sync manager: users and the sessions of one client.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, info};
use vellum_common::config::{SyncClientConfig, SyncConfig};
use vellum_common::lock_tag;
use vellum_common::sync::Guarded;
use vellum_common::HistoryType;
use vellum_txn::Db;

use crate::auth::SyncUser;
use crate::client::SyncClient;
use crate::error::{SyncError, SyncResult};
use crate::session::{SessionState, SyncSession};
use crate::transport::{GenericNetworkTransport, SyncSocketProvider};

lock_tag!(ManagerLock, "sync.manager", 80);

struct ManagerState {
    sessions: BTreeMap<String, SyncSession>,
    users: BTreeMap<String, Arc<SyncUser>>,
    next_session_ident: u64,
    shut_down: bool,
}

impl ManagerState {
    fn new() -> Self {
        Self {
            sessions: BTreeMap::new(),
            users: BTreeMap::new(),
            next_session_ident: 1,
            shut_down: false,
        }
    }
}

/// Owns the users and sessions of one sync client.
pub struct SyncManager {
    client: Arc<SyncClient>,
    state: Guarded<ManagerState, ManagerLock>,
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SyncManager")
            .field("sessions", &state.sessions.len())
            .field("users", &state.users.len())
            .field("shut_down", &state.shut_down)
            .finish()
    }
}

impl SyncManager {
    /// Creates a manager whose sessions run on the current tokio runtime.
    ///
    /// `network` is used to refresh access tokens; without it a session
    /// whose token expired waits for [`SyncSession::update_access_token`].
    pub fn new(
        config: SyncClientConfig,
        sockets: Arc<dyn SyncSocketProvider>,
        network: Option<Arc<dyn GenericNetworkTransport>>,
    ) -> SyncResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|_| SyncError::InvalidConfig("no tokio runtime is running".into()))?;
        Self::with_runtime(config, sockets, network, runtime)
    }

    /// Creates a manager whose sessions run on `runtime`.
    pub fn with_runtime(
        config: SyncClientConfig,
        sockets: Arc<dyn SyncSocketProvider>,
        network: Option<Arc<dyn GenericNetworkTransport>>,
        runtime: Handle,
    ) -> SyncResult<Self> {
        let client = SyncClient::new(config, sockets, network, runtime)?;
        info!(endpoint = %client.endpoint(), "sync manager started");
        Ok(Self {
            client: Arc::new(client),
            state: Guarded::new(ManagerState::new()),
        })
    }

    /// Client configuration.
    #[must_use]
    pub fn config(&self) -> &SyncClientConfig {
        &self.client.config
    }

    /// Points future connections at another server.
    pub fn set_server_url(&self, url: &str) -> SyncResult<()> {
        self.client.set_server_url(url)
    }

    /// Logs a user in, or refreshes the tokens of a known user.
    pub fn log_in_user(
        &self,
        id: &str,
        access_token: &str,
        refresh_token: &str,
    ) -> Arc<SyncUser> {
        let mut state = self.state.lock();
        if let Some(user) = state.users.get(id) {
            user.log_in(access_token, refresh_token);
            return Arc::clone(user);
        }
        let user = Arc::new(SyncUser::new(id, access_token, refresh_token));
        state.users.insert(id.to_string(), Arc::clone(&user));
        debug!(user = id, "user logged in");
        user
    }

    /// A known user.
    pub fn get_user(&self, id: &str) -> Option<Arc<SyncUser>> {
        self.state.lock().users.get(id).cloned()
    }

    /// Every known user.
    pub fn all_users(&self) -> Vec<Arc<SyncUser>> {
        self.state.lock().users.values().cloned().collect()
    }

    fn sessions_of(&self, user_id: &str) -> Vec<SyncSession> {
        self.state
            .lock()
            .sessions
            .values()
            .filter(|s| s.user().id() == user_id)
            .cloned()
            .collect()
    }

    /// Logs a user out and stops their sessions.
    pub fn log_out_user(&self, id: &str) {
        let Some(user) = self.get_user(id) else {
            return;
        };
        user.log_out();
        for session in self.sessions_of(id) {
            session.force_close();
        }
        info!(user = id, "user logged out");
    }

    /// Logs a user out and forgets them and their sessions.
    pub fn remove_user(&self, id: &str) {
        let sessions = self.sessions_of(id);
        let user = {
            let mut state = self.state.lock();
            state.sessions.retain(|_, s| s.user().id() != id);
            state.users.remove(id)
        };
        for session in sessions {
            session.force_close();
        }
        if let Some(user) = user {
            user.mark_removed();
            info!(user = id, "user removed");
        }
    }

    /// Returns the session for `path`, creating and starting it if
    /// needed. The database must keep a history.
    pub fn get_session(&self, path: &str, db: &Db, config: SyncConfig) -> SyncResult<SyncSession> {
        if db.history_type() == HistoryType::None {
            return Err(SyncError::InvalidConfig(format!(
                "database for '{path}' keeps no history and cannot be synced"
            )));
        }
        let (existing, user, ident) = {
            let mut state = self.state.lock();
            if state.shut_down {
                return Err(SyncError::Shutdown);
            }
            let user = state.users.get(&config.user_id).cloned().ok_or_else(|| {
                SyncError::InvalidConfig(format!("unknown user '{}'", config.user_id))
            })?;
            let existing = state.sessions.get(path).cloned();
            let ident = state.next_session_ident;
            if existing.is_none() {
                state.next_session_ident += 1;
            }
            (existing, user, ident)
        };

        let session = match existing {
            Some(session) => {
                if session.config().mode != config.mode {
                    return Err(SyncError::WrongSyncType {
                        path: path.to_string(),
                        existing: session.config().mode,
                        requested: config.mode,
                    });
                }
                session
            }
            None => {
                let created = SyncSession::new(
                    ident,
                    path.to_string(),
                    db.clone(),
                    config,
                    user,
                    Arc::clone(&self.client),
                )?;
                let mut state = self.state.lock();
                if state.shut_down {
                    return Err(SyncError::Shutdown);
                }
                // a racing caller may have registered the path meanwhile
                let (session, unused) = match state.sessions.get(path) {
                    Some(raced) => (raced.clone(), Some(created)),
                    None => {
                        state.sessions.insert(path.to_string(), created.clone());
                        (created, None)
                    }
                };
                drop(state);
                drop(unused);
                debug!(path, ident, "session registered");
                session
            }
        };
        session.revive_if_needed();
        Ok(session)
    }

    /// The session for `path` if it exists.
    pub fn get_existing_session(&self, path: &str) -> Option<SyncSession> {
        self.state.lock().sessions.get(path).cloned()
    }

    /// The session for `path` if it is active or dying.
    pub fn get_existing_active_session(&self, path: &str) -> Option<SyncSession> {
        self.get_existing_session(path)
            .filter(|s| matches!(s.state(), SessionState::Active | SessionState::Dying))
    }

    /// Every registered session.
    pub fn all_sessions(&self) -> Vec<SyncSession> {
        self.state.lock().sessions.values().cloned().collect()
    }

    /// True if any session is still syncing or about to.
    pub fn has_existing_sessions(&self) -> bool {
        self.all_sessions()
            .iter()
            .any(|s| s.state() != SessionState::Inactive)
    }

    /// Closes every session according to its stop policy.
    pub fn close_all_sessions(&self) {
        for session in self.all_sessions() {
            session.close();
        }
    }

    /// Stops every session at once; later `get_session` calls fail.
    pub fn shutdown(&self) {
        let sessions = {
            let mut state = self.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            std::mem::take(&mut state.sessions)
        };
        for session in sessions.into_values() {
            session.force_close();
        }
        info!("sync manager shut down");
    }

    /// Stops every session and forgets all users and sessions.
    pub fn reset_for_testing(&self) {
        let sessions = {
            let mut state = self.state.lock();
            let sessions = std::mem::take(&mut state.sessions);
            *state = ManagerState::new();
            sessions
        };
        for session in sessions.into_values() {
            session.force_close();
        }
        debug!("sync manager reset");
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
