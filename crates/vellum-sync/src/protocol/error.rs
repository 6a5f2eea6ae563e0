//! Protocol error codes and the actions the client takes for them.
//!
//! Codes 100-199 concern the whole connection, codes 200-299 a single
//! session bound on it.

use std::fmt;

use serde::{Deserialize, Serialize};
use vellum_common::{ErrorCode, Status};

use crate::resumption::ResumptionDelayInfo;

use super::close::classify_close;

/// Error codes sent by the server in `ERROR` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ProtocolError {
    /// Connection closed (no error).
    ConnectionClosed = 100,
    /// Other connection level error.
    OtherError = 101,
    /// Unknown type of input message.
    UnknownMessage = 102,
    /// Bad syntax in input message head.
    BadSyntax = 103,
    /// Limits exceeded in input message.
    LimitsExceeded = 104,
    /// Wrong protocol version.
    WrongProtocolVersion = 105,
    /// Bad session identifier in input message.
    BadSessionIdent = 106,
    /// Overlapping reuse of session identifier.
    ReuseOfSessionIdent = 107,
    /// Client file bound in other session.
    BoundInOtherSession = 108,
    /// Bad input message order.
    BadMessageOrder = 109,
    /// Error in decompression.
    BadDecompression = 110,
    /// Bad syntax in a changeset header.
    BadChangesetHeaderSyntax = 111,
    /// Bad size specified in changeset header.
    BadChangesetSize = 112,
    /// Connected with the wrong wire protocol, should switch to flexible sync.
    SwitchToFlxSync = 113,
    /// Connected with the wrong wire protocol, should switch to partition sync.
    SwitchToPbs = 114,

    /// Session closed (no error).
    SessionClosed = 200,
    /// Other session level error.
    OtherSessionError = 201,
    /// Access token expired.
    TokenExpired = 202,
    /// Bad user authentication.
    BadAuthentication = 203,
    /// Illegal file path.
    IllegalRealmPath = 204,
    /// No such file on the server.
    NoSuchRealm = 205,
    /// Permission denied.
    PermissionDenied = 206,
    /// Bad server file identifier.
    BadServerFileIdent = 207,
    /// Bad client file identifier.
    BadClientFileIdent = 208,
    /// Bad server version.
    BadServerVersion = 209,
    /// Bad client version.
    BadClientVersion = 210,
    /// Diverging histories.
    DivergingHistories = 211,
    /// Bad changeset.
    BadChangeset = 212,
    /// Partial sync disabled.
    PartialSyncDisabled = 214,
    /// Unsupported session feature.
    UnsupportedSessionFeature = 215,
    /// Bad origin file identifier.
    BadOriginFileIdent = 216,
    /// Synchronization no longer possible for client-side file.
    BadClientFile = 217,
    /// Server file was deleted while session was bound to it.
    ServerFileDeleted = 218,
    /// Client file has been blacklisted.
    ClientFileBlacklisted = 219,
    /// User has been blacklisted.
    UserBlacklisted = 220,
    /// Serialized transaction before upload completion.
    TransactBeforeUpload = 221,
    /// Client file has expired.
    ClientFileExpired = 222,
    /// User mismatch for client file.
    UserMismatch = 223,
    /// Too many sessions in connection.
    TooManySessions = 224,
    /// Invalid schema change.
    InvalidSchemaChange = 225,
    /// Client query is invalid or malformed.
    BadQuery = 226,
    /// Client tried to create an object that already exists outside its view.
    ObjectAlreadyExists = 227,
    /// Server permissions for this file have changed.
    ServerPermissionsChanged = 228,
    /// Client tried to open a session before initial sync completed.
    InitialSyncNotCompleted = 229,
    /// Client attempted a write that is disallowed by permissions.
    WriteNotAllowed = 230,
    /// Client attempted a write that was reverted by the server.
    CompensatingWrite = 231,
    /// Server requests a migration to flexible sync.
    MigrateToFlx = 232,
    /// Bad progress information.
    BadProgress = 233,
    /// Server requests a rollback to partition sync.
    RevertToPbs = 234,
    /// Client tried to open a session with an invalid schema version.
    BadSchemaVersion = 235,
    /// Schema version changed while the session was active.
    SchemaVersionChanged = 236,
}

impl ProtocolError {
    const ALL: [ProtocolError; 51] = [
        Self::ConnectionClosed,
        Self::OtherError,
        Self::UnknownMessage,
        Self::BadSyntax,
        Self::LimitsExceeded,
        Self::WrongProtocolVersion,
        Self::BadSessionIdent,
        Self::ReuseOfSessionIdent,
        Self::BoundInOtherSession,
        Self::BadMessageOrder,
        Self::BadDecompression,
        Self::BadChangesetHeaderSyntax,
        Self::BadChangesetSize,
        Self::SwitchToFlxSync,
        Self::SwitchToPbs,
        Self::SessionClosed,
        Self::OtherSessionError,
        Self::TokenExpired,
        Self::BadAuthentication,
        Self::IllegalRealmPath,
        Self::NoSuchRealm,
        Self::PermissionDenied,
        Self::BadServerFileIdent,
        Self::BadClientFileIdent,
        Self::BadServerVersion,
        Self::BadClientVersion,
        Self::DivergingHistories,
        Self::BadChangeset,
        Self::PartialSyncDisabled,
        Self::UnsupportedSessionFeature,
        Self::BadOriginFileIdent,
        Self::BadClientFile,
        Self::ServerFileDeleted,
        Self::ClientFileBlacklisted,
        Self::UserBlacklisted,
        Self::TransactBeforeUpload,
        Self::ClientFileExpired,
        Self::UserMismatch,
        Self::TooManySessions,
        Self::InvalidSchemaChange,
        Self::BadQuery,
        Self::ObjectAlreadyExists,
        Self::ServerPermissionsChanged,
        Self::InitialSyncNotCompleted,
        Self::WriteNotAllowed,
        Self::CompensatingWrite,
        Self::MigrateToFlx,
        Self::BadProgress,
        Self::RevertToPbs,
        Self::BadSchemaVersion,
        Self::SchemaVersionChanged,
    ];

    /// Numeric wire value.
    #[must_use]
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Maps a wire value back to a known code.
    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|e| e.code() == code)
    }

    /// True for errors that concern one session rather than the whole
    /// connection.
    #[must_use]
    pub fn is_session_level(self) -> bool {
        is_session_level_code(self.code())
    }

    /// Generic description of the error.
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            Self::ConnectionClosed => "connection closed (no error)",
            Self::OtherError => "other connection level error",
            Self::UnknownMessage => "unknown type of input message",
            Self::BadSyntax => "bad syntax in input message head",
            Self::LimitsExceeded => "limits exceeded in input message",
            Self::WrongProtocolVersion => "wrong protocol version",
            Self::BadSessionIdent => "bad session identifier in input message",
            Self::ReuseOfSessionIdent => "overlapping reuse of session identifier",
            Self::BoundInOtherSession => "client file bound in other session",
            Self::BadMessageOrder => "bad input message order",
            Self::BadDecompression => "error in decompression",
            Self::BadChangesetHeaderSyntax => "bad syntax in a changeset header",
            Self::BadChangesetSize => "bad size specified in changeset header",
            Self::SwitchToFlxSync => "connected with wrong wire protocol, should switch to FLX sync",
            Self::SwitchToPbs => "connected with wrong wire protocol, should switch to PBS",
            Self::SessionClosed => "session closed (no error)",
            Self::OtherSessionError => "other session level error",
            Self::TokenExpired => "access token expired",
            Self::BadAuthentication => "bad user authentication",
            Self::IllegalRealmPath => "illegal file path",
            Self::NoSuchRealm => "no such file",
            Self::PermissionDenied => "permission denied",
            Self::BadServerFileIdent => "bad server file identifier",
            Self::BadClientFileIdent => "bad client file identifier",
            Self::BadServerVersion => "bad server version",
            Self::BadClientVersion => "bad client version",
            Self::DivergingHistories => "diverging histories",
            Self::BadChangeset => "bad changeset",
            Self::PartialSyncDisabled => "partial sync disabled",
            Self::UnsupportedSessionFeature => "unsupported session feature",
            Self::BadOriginFileIdent => "bad origin file identifier",
            Self::BadClientFile => "synchronization no longer possible for client-side file",
            Self::ServerFileDeleted => "server file was deleted while session was bound to it",
            Self::ClientFileBlacklisted => "client file has been blacklisted",
            Self::UserBlacklisted => "user has been blacklisted",
            Self::TransactBeforeUpload => "serialized transaction before upload completion",
            Self::ClientFileExpired => "client file has expired",
            Self::UserMismatch => "user mismatch for client file",
            Self::TooManySessions => "too many sessions in connection",
            Self::InvalidSchemaChange => "invalid schema change",
            Self::BadQuery => "client query is invalid or malformed",
            Self::ObjectAlreadyExists => "object already exists outside of the client's view",
            Self::ServerPermissionsChanged => "server permissions for this file have changed",
            Self::InitialSyncNotCompleted => "initial sync of the server file is not complete",
            Self::WriteNotAllowed => "write not allowed by permissions",
            Self::CompensatingWrite => "write was reverted by the server",
            Self::MigrateToFlx => "server requests migration to flexible sync",
            Self::BadProgress => "bad progress information",
            Self::RevertToPbs => "server requests revert to partition sync",
            Self::BadSchemaVersion => "invalid schema version",
            Self::SchemaVersionChanged => "schema version changed",
        }
    }

    /// Action taken when the server does not name one.
    #[must_use]
    pub fn default_action(self) -> Action {
        match self {
            Self::ConnectionClosed
            | Self::OtherError
            | Self::SessionClosed
            | Self::OtherSessionError
            | Self::TooManySessions
            | Self::InitialSyncNotCompleted
            | Self::TokenExpired
            | Self::BadAuthentication => Action::Transient,
            Self::UnknownMessage
            | Self::BadSyntax
            | Self::LimitsExceeded
            | Self::BadSessionIdent
            | Self::ReuseOfSessionIdent
            | Self::BoundInOtherSession
            | Self::BadMessageOrder
            | Self::BadDecompression
            | Self::BadChangesetHeaderSyntax
            | Self::BadChangesetSize
            | Self::BadChangeset => Action::ProtocolViolation,
            Self::SwitchToFlxSync | Self::MigrateToFlx => Action::MigrateToFlx,
            Self::SwitchToPbs | Self::RevertToPbs => Action::RevertToPbs,
            Self::BadServerFileIdent
            | Self::BadClientFileIdent
            | Self::BadServerVersion
            | Self::BadClientVersion
            | Self::DivergingHistories
            | Self::BadOriginFileIdent
            | Self::BadClientFile
            | Self::ServerFileDeleted
            | Self::ClientFileBlacklisted
            | Self::ClientFileExpired
            | Self::BadProgress
            | Self::ServerPermissionsChanged => Action::ClientReset,
            Self::CompensatingWrite => Action::Warning,
            Self::BadSchemaVersion | Self::SchemaVersionChanged => Action::MigrateSchema,
            Self::WrongProtocolVersion
            | Self::IllegalRealmPath
            | Self::NoSuchRealm
            | Self::PermissionDenied
            | Self::PartialSyncDisabled
            | Self::UnsupportedSessionFeature
            | Self::TransactBeforeUpload
            | Self::InvalidSchemaChange
            | Self::BadQuery
            | Self::ObjectAlreadyExists
            | Self::WriteNotAllowed
            | Self::UserBlacklisted
            | Self::UserMismatch => Action::ApplicationBug,
        }
    }

    /// Maps to the stable error code reported through `Status`.
    #[must_use]
    pub fn error_code(self) -> ErrorCode {
        match self {
            Self::CompensatingWrite => ErrorCode::SyncCompensatingWrite,
            Self::PermissionDenied | Self::WriteNotAllowed => ErrorCode::SyncPermissionDenied,
            Self::TokenExpired | Self::BadAuthentication => ErrorCode::InvalidSession,
            Self::SwitchToFlxSync | Self::SwitchToPbs => ErrorCode::WrongSyncType,
            Self::ConnectionClosed => ErrorCode::ConnectionClosed,
            e if e.default_action() == Action::ClientReset => ErrorCode::SyncClientResetRequired,
            e if e.default_action() == Action::ProtocolViolation => {
                ErrorCode::SyncProtocolInvariantFailed
            }
            e if e.is_session_level() => ErrorCode::SyncSessionError,
            _ => ErrorCode::SyncConnectionFailed,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

/// True for raw codes in the session level range.
#[must_use]
pub fn is_session_level_code(code: i32) -> bool {
    (200..300).contains(&code)
}

/// What the client does in response to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Action {
    /// Nothing beyond reporting.
    #[default]
    NoAction,
    /// The peer violated the protocol; fatal.
    ProtocolViolation,
    /// The application misused the API; fatal.
    ApplicationBug,
    /// Report and keep going.
    Warning,
    /// Reconnect after the resumption delay.
    Transient,
    /// The local file must be deleted.
    DeleteRealm,
    /// Reset the client file, recovery allowed.
    ClientReset,
    /// Reset the client file without recovering local changes.
    ClientResetNoRecovery,
    /// Reconnect speaking flexible sync.
    #[serde(rename = "MigrateToFLX")]
    MigrateToFlx,
    /// Reconnect speaking partition sync.
    #[serde(rename = "RevertToPBS")]
    RevertToPbs,
    /// Refresh the access token, then reconnect.
    RefreshUser,
    /// Re-resolve the server location, then reconnect.
    RefreshLocation,
    /// Log the user out; fatal.
    LogOutUser,
    /// Back up the local file, then delete it.
    BackupThenDeleteRealm,
    /// The local schema must be migrated.
    MigrateSchema,
}

impl Action {
    /// True if the session cannot continue after this action.
    #[must_use]
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation
                | Self::ApplicationBug
                | Self::DeleteRealm
                | Self::LogOutUser
                | Self::BackupThenDeleteRealm
                | Self::MigrateSchema
        )
    }
}

/// An object write the server reverted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensatingWriteInfo {
    /// Table the object belongs to.
    #[serde(rename = "table")]
    pub object_name: String,
    /// Primary key of the object, rendered as text.
    #[serde(rename = "pk")]
    pub primary_key: String,
    /// Why the write was reverted.
    pub reason: String,
}

/// A protocol error as delivered to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolErrorInfo {
    /// Code as sent by the server; may be outside the known range.
    pub raw_error_code: i32,
    /// Server supplied message.
    pub message: String,
    /// True if the connection may be retried.
    pub try_again: bool,
    /// True if the session cannot continue.
    pub is_fatal: bool,
    /// The server forbids recovering local changes during a reset.
    pub client_reset_recovery_is_disabled: bool,
    /// Explicit reset request, overriding the action.
    pub should_client_reset: Option<bool>,
    /// Server log entry describing the error.
    pub log_url: Option<String>,
    /// What the client must do.
    pub server_requests_action: Action,
    /// Server supplied reconnect delay.
    pub resumption_delay_interval: Option<ResumptionDelayInfo>,
    /// Writes the server reverted.
    pub compensating_writes: Vec<CompensatingWriteInfo>,
    /// Query to subscribe to after migrating to flexible sync.
    pub migration_query_string: Option<String>,
    /// Set when the error stands for a closed WebSocket.
    pub close_code: Option<u16>,
}

impl ProtocolErrorInfo {
    /// Creates an error with the default action for `code`.
    pub fn new(code: i32, message: impl Into<String>, try_again: bool) -> Self {
        let action = ProtocolError::from_code(code)
            .map_or(Action::ApplicationBug, ProtocolError::default_action);
        Self {
            raw_error_code: code,
            message: message.into(),
            try_again,
            is_fatal: !try_again && action != Action::Warning,
            client_reset_recovery_is_disabled: false,
            should_client_reset: None,
            log_url: None,
            server_requests_action: action,
            resumption_delay_interval: None,
            compensating_writes: Vec::new(),
            migration_query_string: None,
            close_code: None,
        }
    }

    /// Creates an error for a known code with its generic message.
    #[must_use]
    pub fn from_error(error: ProtocolError, try_again: bool) -> Self {
        Self::new(error.code(), error.message(), try_again)
    }

    /// Overrides the action.
    #[must_use]
    pub fn with_action(mut self, action: Action) -> Self {
        self.server_requests_action = action;
        self
    }

    /// Attaches a log URL.
    #[must_use]
    pub fn with_log_url(mut self, url: impl Into<String>) -> Self {
        self.log_url = Some(url.into());
        self
    }

    /// The code, if known.
    #[must_use]
    pub fn protocol_error(&self) -> Option<ProtocolError> {
        ProtocolError::from_code(self.raw_error_code)
    }

    /// True if the error concerns one session.
    #[must_use]
    pub fn is_session_level(&self) -> bool {
        is_session_level_code(self.raw_error_code)
    }

    /// Effective action after `should_client_reset` and the recovery flag.
    #[must_use]
    pub fn action(&self) -> Action {
        match (self.should_client_reset, self.server_requests_action) {
            (Some(true), _) => {
                if self.client_reset_recovery_is_disabled {
                    Action::ClientResetNoRecovery
                } else {
                    Action::ClientReset
                }
            }
            (_, Action::ClientReset) if self.client_reset_recovery_is_disabled => {
                Action::ClientResetNoRecovery
            }
            (_, action) => action,
        }
    }

    /// Stable error code for reporting.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        if let Some(code) = self.close_code {
            return classify_close(code).error_code;
        }
        match self.action() {
            Action::ClientReset | Action::ClientResetNoRecovery => {
                ErrorCode::SyncClientResetRequired
            }
            _ => self.protocol_error().map_or_else(
                || {
                    if self.is_session_level() {
                        ErrorCode::SyncSessionError
                    } else {
                        ErrorCode::SyncConnectionFailed
                    }
                },
                ProtocolError::error_code,
            ),
        }
    }

    /// Converts into a `Status`; fatal errors carry their log URL.
    #[must_use]
    pub fn to_status(&self) -> Status {
        let reason = match (&self.log_url, self.is_fatal) {
            (Some(url), true) => format!(
                "{} (code {}). Logs: {}",
                self.message, self.raw_error_code, url
            ),
            _ => format!("{} (code {})", self.message, self.raw_error_code),
        };
        Status::new(self.error_code(), reason)
    }
}

impl fmt::Display for ProtocolErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (code {}, action {:?})",
            self.message,
            self.raw_error_code,
            self.action()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_lookup() {
        assert_eq!(ProtocolError::from_code(202), Some(ProtocolError::TokenExpired));
        assert_eq!(ProtocolError::from_code(236), Some(ProtocolError::SchemaVersionChanged));
        assert_eq!(ProtocolError::from_code(213), None);
        assert!(ProtocolError::BadChangeset.is_session_level());
        assert!(!ProtocolError::BadSyntax.is_session_level());
    }

    #[test]
    fn test_default_actions() {
        assert_eq!(
            ProtocolError::DivergingHistories.default_action(),
            Action::ClientReset
        );
        assert_eq!(ProtocolError::SwitchToPbs.default_action(), Action::RevertToPbs);
        assert_eq!(
            ProtocolError::BadMessageOrder.error_code(),
            ErrorCode::SyncProtocolInvariantFailed
        );
    }

    #[test]
    fn test_user_actions_only_come_from_close_codes() {
        let expired = ProtocolErrorInfo::from_error(ProtocolError::TokenExpired, true);
        assert_eq!(expired.action(), Action::Transient);
        assert!(!expired.is_fatal);

        let banned = ProtocolErrorInfo::from_error(ProtocolError::UserBlacklisted, false);
        assert_eq!(banned.action(), Action::ApplicationBug);
        assert!(banned.is_fatal);

        for error in ProtocolError::ALL {
            let action = error.default_action();
            assert!(!matches!(
                action,
                Action::RefreshUser | Action::RefreshLocation | Action::LogOutUser
            ));
        }
    }

    #[test]
    fn test_recovery_flag_downgrades_reset() {
        let mut info = ProtocolErrorInfo::from_error(ProtocolError::BadClientFileIdent, false);
        assert_eq!(info.action(), Action::ClientReset);
        info.client_reset_recovery_is_disabled = true;
        assert_eq!(info.action(), Action::ClientResetNoRecovery);

        let mut warning = ProtocolErrorInfo::from_error(ProtocolError::PermissionDenied, false);
        warning.should_client_reset = Some(true);
        assert_eq!(warning.action(), Action::ClientReset);
        assert_eq!(warning.error_code(), ErrorCode::SyncClientResetRequired);
    }

    #[test]
    fn test_fatal_status_carries_log_url() {
        let info = ProtocolErrorInfo::from_error(ProtocolError::PermissionDenied, false)
            .with_log_url("https://logs.example.com/1");
        assert!(info.is_fatal);
        let status = info.to_status();
        assert_eq!(status.code(), ErrorCode::SyncPermissionDenied);
        assert!(status.reason().contains("https://logs.example.com/1"));

        let transient = ProtocolErrorInfo::from_error(ProtocolError::OtherSessionError, true)
            .with_log_url("https://logs.example.com/2");
        assert!(!transient.to_status().reason().contains("logs.example.com"));
    }
}
