//! Users and access token refresh.
//!
//! A session binds with the user's access token. When the token is missing,
//! expired or rejected by the server, a new one is requested with the
//! refresh token over the application's [`GenericNetworkTransport`].

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::Deserialize;
use tracing::{debug, warn};
use vellum_common::lock_tag;
use vellum_common::sync::Guarded;

use crate::error::{SyncError, SyncResult};
use crate::protocol::ServerEndpoint;
use crate::transport::{GenericNetworkTransport, HttpMethod, Request};

lock_tag!(UserLock, "sync.user", 85);

/// Route of the session refresh endpoint.
pub const AUTH_SESSION_ROUTE: &str = "/api/client/v2.0/auth/session";

/// Default timeout of a refresh request.
pub const DEFAULT_REFRESH_TIMEOUT_MS: u64 = 60_000;

/// Login state of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserState {
    /// Tokens are usable.
    LoggedIn,
    /// Tokens were dropped; sessions cannot connect.
    LoggedOut,
    /// The user was removed from the client.
    Removed,
}

#[derive(Debug)]
struct UserData {
    access_token: String,
    refresh_token: String,
    access_token_expires_at: Option<SystemTime>,
    state: UserState,
}

/// A user owning sync sessions.
#[derive(Debug)]
pub struct SyncUser {
    id: String,
    data: Guarded<UserData, UserLock>,
}

impl SyncUser {
    /// Creates a logged in user.
    pub fn new(
        id: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            data: Guarded::new(UserData {
                access_token: access_token.into(),
                refresh_token: refresh_token.into(),
                access_token_expires_at: None,
                state: UserState::LoggedIn,
            }),
        }
    }

    /// User identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state.
    pub fn state(&self) -> UserState {
        self.data.lock().state
    }

    /// True while logged in.
    pub fn is_logged_in(&self) -> bool {
        self.state() == UserState::LoggedIn
    }

    /// Current access token.
    pub fn access_token(&self) -> String {
        self.data.lock().access_token.clone()
    }

    /// Current refresh token.
    pub fn refresh_token(&self) -> String {
        self.data.lock().refresh_token.clone()
    }

    /// Replaces the access token.
    pub fn update_access_token(&self, token: impl Into<String>, expires_at: Option<SystemTime>) {
        let mut data = self.data.lock();
        data.access_token = token.into();
        data.access_token_expires_at = expires_at;
    }

    /// Logs in again with fresh tokens.
    pub fn log_in(&self, access_token: impl Into<String>, refresh_token: impl Into<String>) {
        let mut data = self.data.lock();
        data.access_token = access_token.into();
        data.refresh_token = refresh_token.into();
        data.access_token_expires_at = None;
        data.state = UserState::LoggedIn;
    }

    /// Drops both tokens.
    pub fn log_out(&self) {
        let mut data = self.data.lock();
        if data.state == UserState::LoggedIn {
            debug!(user = %self.id, "logging out");
            data.state = UserState::LoggedOut;
        }
        data.access_token.clear();
        data.refresh_token.clear();
    }

    pub(crate) fn mark_removed(&self) {
        self.log_out();
        self.data.lock().state = UserState::Removed;
    }

    /// True if the access token is missing or expired.
    pub fn access_token_refresh_required(&self) -> bool {
        let data = self.data.lock();
        data.access_token.is_empty()
            || data
                .access_token_expires_at
                .map_or(false, |at| at <= SystemTime::now())
    }
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
}

/// HTTP base URL of the app server that hosts the sync endpoint.
#[must_use]
pub fn http_base_url(endpoint: &ServerEndpoint) -> String {
    let scheme = if endpoint.is_ssl() { "https" } else { "http" };
    format!("{scheme}://{}:{}", endpoint.host, endpoint.port)
}

/// Requests a new access token and stores it on the user.
///
/// A 401 answer means the refresh token was revoked; the user is logged
/// out and the error is fatal for every session of that user.
pub async fn refresh_access_token(
    user: &SyncUser,
    transport: &dyn GenericNetworkTransport,
    base_url: &str,
) -> SyncResult<String> {
    if !user.is_logged_in() {
        return Err(SyncError::UserLoggedOut(user.id().to_string()));
    }
    let mut headers = BTreeMap::new();
    headers.insert(
        "Authorization".to_string(),
        format!("Bearer {}", user.refresh_token()),
    );
    headers.insert("Content-Type".to_string(), "application/json".to_string());
    let request = Request {
        method: HttpMethod::Post,
        url: format!("{}{AUTH_SESSION_ROUTE}", base_url.trim_end_matches('/')),
        timeout_ms: DEFAULT_REFRESH_TIMEOUT_MS,
        headers,
        body: String::new(),
    };

    let response = transport.send_request_to_server(request).await;
    if response.custom_status_code != 0 {
        return Err(SyncError::TokenRefresh {
            status: 0,
            message: format!("transport error {}", response.custom_status_code),
        });
    }
    match response.http_status_code {
        200..=299 => {
            let parsed: RefreshResponse = serde_json::from_str(&response.body)?;
            user.update_access_token(parsed.access_token.clone(), None);
            debug!(user = %user.id(), "access token refreshed");
            Ok(parsed.access_token)
        }
        401 => {
            warn!(user = %user.id(), "refresh token rejected");
            user.log_out();
            Err(SyncError::TokenRefresh {
                status: 401,
                message: response.body,
            })
        }
        status => Err(SyncError::TokenRefresh {
            status,
            message: response.body,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{BoxFuture, Response};
    use parking_lot::Mutex;

    struct CannedTransport {
        status: u16,
        body: &'static str,
        seen: Mutex<Vec<Request>>,
    }

    impl GenericNetworkTransport for CannedTransport {
        fn send_request_to_server(&self, request: Request) -> BoxFuture<'_, Response> {
            self.seen.lock().push(request);
            Box::pin(async move {
                Response {
                    http_status_code: self.status,
                    body: self.body.to_string(),
                    ..Default::default()
                }
            })
        }
    }

    fn canned(status: u16, body: &'static str) -> CannedTransport {
        CannedTransport {
            status,
            body,
            seen: Mutex::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn test_refresh_stores_new_token() {
        let user = SyncUser::new("u1", "", "refresh-1");
        assert!(user.access_token_refresh_required());
        let transport = canned(200, r#"{"access_token":"access-2"}"#);

        let token = refresh_access_token(&user, &transport, "https://app.example.com/")
            .await
            .unwrap();
        assert_eq!(token, "access-2");
        assert_eq!(user.access_token(), "access-2");
        assert!(!user.access_token_refresh_required());

        let seen = transport.seen.lock();
        assert_eq!(seen[0].url, "https://app.example.com/api/client/v2.0/auth/session");
        assert_eq!(seen[0].method, HttpMethod::Post);
        assert_eq!(seen[0].headers["Authorization"], "Bearer refresh-1");
    }

    #[tokio::test]
    async fn test_revoked_refresh_token_logs_out() {
        let user = SyncUser::new("u1", "a", "r");
        let err = refresh_access_token(&user, &canned(401, "revoked"), "http://localhost")
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(user.state(), UserState::LoggedOut);
        assert!(user.refresh_token().is_empty());

        let again = refresh_access_token(&user, &canned(200, "{}"), "http://localhost").await;
        assert!(matches!(again, Err(SyncError::UserLoggedOut(_))));
    }

    #[tokio::test]
    async fn test_server_errors_are_retryable() {
        let user = SyncUser::new("u1", "a", "r");
        let err = refresh_access_token(&user, &canned(503, "busy"), "http://localhost")
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
        assert!(user.is_logged_in());
    }

    #[test]
    fn test_expired_token_needs_refresh() {
        let user = SyncUser::new("u1", "a", "r");
        assert!(!user.access_token_refresh_required());
        user.update_access_token("b", Some(SystemTime::UNIX_EPOCH));
        assert!(user.access_token_refresh_required());

        let ep = ServerEndpoint::parse("wss://sync.example.com").unwrap();
        assert_eq!(http_base_url(&ep), "https://sync.example.com:443");
    }
}
