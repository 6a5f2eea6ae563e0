//! Error types for the sync client.

use thiserror::Error;
use vellum_common::config::SyncMode;
use vellum_common::{ErrorCode, Status};
use vellum_txn::TxnError;

use crate::protocol::{close_error_info, Action, ProtocolError, ProtocolErrorInfo};

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors raised by the sync client.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Server URL could not be used.
    #[error("invalid server url '{url}': {reason}")]
    InvalidServerUrl {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The server selected a subprotocol the client does not speak.
    #[error("unsupported sync subprotocol '{0}'")]
    UnsupportedProtocol(String),

    /// Protocol error, sent by the server or detected locally.
    #[error("sync protocol error: {0}")]
    Protocol(ProtocolErrorInfo),

    /// The WebSocket was closed.
    #[error("websocket closed with code {code}: {reason}")]
    WebSocketClosed {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },

    /// No connection could be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Refreshing the access token failed.
    #[error("access token refresh failed with HTTP {status}: {message}")]
    TokenRefresh {
        /// HTTP status code, zero if no response arrived.
        status: u16,
        /// Server or transport message.
        message: String,
    },

    /// The user is logged out.
    #[error("user '{0}' is logged out")]
    UserLoggedOut(String),

    /// Automatic client reset could not complete.
    #[error("client reset failed: {0}")]
    ClientResetFailed(String),

    /// Operation not legal in the session's state.
    #[error("illegal operation: {0}")]
    IllegalOperation(String),

    /// Configuration rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A session already exists for the path with another protocol flavor.
    #[error("session '{path}' uses {existing:?} sync, not {requested:?}")]
    WrongSyncType {
        /// Local path of the session.
        path: String,
        /// Flavor of the existing session.
        existing: SyncMode,
        /// Flavor requested.
        requested: SyncMode,
    },

    /// The sync manager was shut down.
    #[error("sync manager is shut down")]
    Shutdown,

    /// Operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Local database error.
    #[error("transaction error: {0}")]
    Txn(#[from] TxnError),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Creates a locally detected protocol violation.
    pub fn protocol(error: ProtocolError, reason: impl Into<String>) -> Self {
        Self::Protocol(ProtocolErrorInfo::new(error.code(), reason, false))
    }

    /// Creates an illegal operation error.
    pub fn illegal(msg: impl Into<String>) -> Self {
        Self::IllegalOperation(msg.into())
    }

    /// Protocol details, if this is a protocol error.
    #[must_use]
    pub fn protocol_info(&self) -> Option<&ProtocolErrorInfo> {
        match self {
            Self::Protocol(info) => Some(info),
            _ => None,
        }
    }

    /// Describes the error the way the session reacts to it.
    #[must_use]
    pub fn to_protocol_info(&self) -> ProtocolErrorInfo {
        match self {
            Self::Protocol(info) => info.clone(),
            Self::WebSocketClosed { code, reason } => close_error_info(*code, reason),
            Self::ConnectionFailed(_) => {
                ProtocolErrorInfo::new(ProtocolError::OtherError.code(), self.to_string(), true)
                    .with_action(Action::Transient)
            }
            Self::TokenRefresh { status: 401, .. } | Self::UserLoggedOut(_) => {
                ProtocolErrorInfo::new(ProtocolError::BadAuthentication.code(), self.to_string(), false)
                    .with_action(Action::LogOutUser)
            }
            Self::TokenRefresh { .. } => {
                ProtocolErrorInfo::new(ProtocolError::OtherError.code(), self.to_string(), true)
                    .with_action(Action::Transient)
            }
            Self::UnsupportedProtocol(_) => ProtocolErrorInfo::new(
                ProtocolError::WrongProtocolVersion.code(),
                self.to_string(),
                false,
            ),
            _ => ProtocolErrorInfo::new(ProtocolError::OtherSessionError.code(), self.to_string(), false)
                .with_action(Action::ApplicationBug),
        }
    }

    /// Returns the stable error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidServerUrl { .. } => ErrorCode::InvalidServerUrl,
            Self::UnsupportedProtocol(_) => ErrorCode::SyncProtocolInvariantFailed,
            Self::Protocol(info) => info.error_code(),
            Self::WebSocketClosed { .. } => self.to_protocol_info().error_code(),
            Self::ConnectionFailed(_) => ErrorCode::SyncConnectionFailed,
            Self::TokenRefresh { .. } | Self::UserLoggedOut(_) => ErrorCode::InvalidSession,
            Self::ClientResetFailed(_) => ErrorCode::AutoClientResetFailed,
            Self::IllegalOperation(_) => ErrorCode::IllegalOperation,
            Self::InvalidConfig(_) => ErrorCode::InvalidConfig,
            Self::WrongSyncType { .. } => ErrorCode::WrongSyncType,
            Self::Shutdown | Self::Cancelled => ErrorCode::Cancelled,
            Self::Txn(e) => e.code(),
            Self::Json(_) => ErrorCode::BadChangeset,
        }
    }

    /// Returns true if the session cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Protocol(info) => info.is_fatal,
            Self::WebSocketClosed { .. } | Self::ConnectionFailed(_) => {
                self.to_protocol_info().is_fatal
            }
            Self::TokenRefresh { status, .. } => *status == 401,
            Self::Cancelled => false,
            _ => true,
        }
    }

    /// Returns true if reconnecting may succeed.
    pub fn is_recoverable(&self) -> bool {
        !self.is_fatal()
    }

    /// Converts into a `Status` for delivery through a callback.
    pub fn to_status(&self) -> Status {
        match self {
            Self::Protocol(info) => info.to_status(),
            _ => Status::new(self.code(), self.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_maps_to_action() {
        let err = SyncError::WebSocketClosed {
            code: 4001,
            reason: "token".into(),
        };
        assert!(err.is_recoverable());
        assert_eq!(err.to_protocol_info().action(), Action::RefreshUser);
        assert_eq!(err.code(), ErrorCode::InvalidSession);

        let err = SyncError::WebSocketClosed {
            code: 4002,
            reason: "forbidden".into(),
        };
        assert!(err.is_fatal());
        assert_eq!(err.to_protocol_info().action(), Action::LogOutUser);
    }

    #[test]
    fn test_protocol_error_status() {
        let err = SyncError::protocol(ProtocolError::BadSyntax, "garbage header");
        assert!(err.is_fatal());
        assert_eq!(err.code(), ErrorCode::SyncProtocolInvariantFailed);
        assert!(err.to_status().reason().contains("garbage header"));
    }

    #[test]
    fn test_refresh_failures() {
        let denied = SyncError::TokenRefresh {
            status: 401,
            message: "revoked".into(),
        };
        assert!(denied.is_fatal());
        assert_eq!(denied.to_protocol_info().action(), Action::LogOutUser);

        let flaky = SyncError::TokenRefresh {
            status: 503,
            message: "unavailable".into(),
        };
        assert!(flaky.is_recoverable());
        assert_eq!(flaky.to_protocol_info().action(), Action::Transient);
    }
}
