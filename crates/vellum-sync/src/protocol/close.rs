//! WebSocket close codes and how the client reacts to them.
//!
//! Besides the RFC 6455 codes the server uses 4001-4006 to ask the client
//! to refresh credentials or location; 4400-4405 are produced locally by
//! the socket provider for failures that never reached the server.

use vellum_common::ErrorCode;

use super::error::{Action, ProtocolErrorInfo};

/// Close codes the client distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum WebSocketCloseCode {
    Normal = 1000,
    GoingAway = 1001,
    ProtocolError = 1002,
    UnsupportedData = 1003,
    Reserved = 1004,
    NoStatusReceived = 1005,
    AbnormalClosure = 1006,
    InvalidPayloadData = 1007,
    PolicyViolation = 1008,
    MessageTooBig = 1009,
    InvalidExtension = 1010,
    InternalServerError = 1011,
    TlsHandshakeFailed = 1015,
    Unauthorized = 4001,
    Forbidden = 4002,
    MovedPermanently = 4003,
    ClientTooOld = 4004,
    ClientTooNew = 4005,
    ProtocolMismatch = 4006,
    ResolveFailed = 4400,
    ConnectionFailed = 4401,
    ReadError = 4402,
    WriteError = 4403,
    RetryError = 4404,
    FatalError = 4405,
}

impl WebSocketCloseCode {
    /// Maps a raw close code.
    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        use WebSocketCloseCode::*;
        Some(match code {
            1000 => Normal,
            1001 => GoingAway,
            1002 => ProtocolError,
            1003 => UnsupportedData,
            1004 => Reserved,
            1005 => NoStatusReceived,
            1006 => AbnormalClosure,
            1007 => InvalidPayloadData,
            1008 => PolicyViolation,
            1009 => MessageTooBig,
            1010 => InvalidExtension,
            1011 => InternalServerError,
            1015 => TlsHandshakeFailed,
            4001 => Unauthorized,
            4002 => Forbidden,
            4003 => MovedPermanently,
            4004 => ClientTooOld,
            4005 => ClientTooNew,
            4006 => ProtocolMismatch,
            4400 => ResolveFailed,
            4401 => ConnectionFailed,
            4402 => ReadError,
            4403 => WriteError,
            4404 => RetryError,
            4405 => FatalError,
            _ => return None,
        })
    }

    /// Numeric value.
    #[must_use]
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// Classification of a closed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseClassification {
    /// What the client does next.
    pub action: Action,
    /// True if the session stops.
    pub is_fatal: bool,
    /// Code reported to the application.
    pub error_code: ErrorCode,
}

/// Decides how to react to a close code.
#[must_use]
pub fn classify_close(code: u16) -> CloseClassification {
    use WebSocketCloseCode::*;
    let (action, is_fatal, error_code) = match WebSocketCloseCode::from_code(code) {
        Some(Unauthorized) => (Action::RefreshUser, false, ErrorCode::InvalidSession),
        Some(Forbidden) => (Action::LogOutUser, true, ErrorCode::SyncPermissionDenied),
        Some(MovedPermanently) => (
            Action::RefreshLocation,
            false,
            ErrorCode::SyncConnectionFailed,
        ),
        Some(ClientTooOld | ClientTooNew | ProtocolMismatch) => (
            Action::ApplicationBug,
            true,
            ErrorCode::SyncProtocolInvariantFailed,
        ),
        Some(TlsHandshakeFailed | FatalError) => (
            Action::ApplicationBug,
            true,
            ErrorCode::SyncConnectionFailed,
        ),
        Some(Normal) => (Action::Transient, false, ErrorCode::ConnectionClosed),
        Some(
            GoingAway | ProtocolError | UnsupportedData | Reserved | NoStatusReceived
            | AbnormalClosure | InvalidPayloadData | PolicyViolation | MessageTooBig
            | InvalidExtension | InternalServerError | ResolveFailed | ConnectionFailed
            | ReadError | WriteError | RetryError,
        )
        | None => (Action::Transient, false, ErrorCode::SyncConnectionFailed),
    };
    CloseClassification {
        action,
        is_fatal,
        error_code,
    }
}

/// Builds the error the session handles for a closed connection.
#[must_use]
pub fn close_error_info(code: u16, reason: &str) -> ProtocolErrorInfo {
    let class = classify_close(code);
    let mut info = ProtocolErrorInfo::new(
        i32::from(code),
        format!("websocket closed with code {code}: {reason}"),
        !class.is_fatal,
    )
    .with_action(class.action);
    info.is_fatal = class.is_fatal;
    info.close_code = Some(code);
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_codes() {
        let c = classify_close(4001);
        assert_eq!(c.action, Action::RefreshUser);
        assert!(!c.is_fatal);

        let c = classify_close(4002);
        assert_eq!(c.action, Action::LogOutUser);
        assert!(c.is_fatal);

        assert_eq!(classify_close(4003).action, Action::RefreshLocation);
    }

    #[test]
    fn test_network_failures_are_transient() {
        for code in [1001, 1006, 1011, 4400, 4401, 4402, 4404, 4999] {
            let c = classify_close(code);
            assert_eq!(c.action, Action::Transient, "code {code}");
            assert!(!c.is_fatal);
        }
        assert!(classify_close(4405).is_fatal);
        assert!(classify_close(1015).is_fatal);
    }

    #[test]
    fn test_close_error_info() {
        let info = close_error_info(4003, "moved");
        assert_eq!(info.action(), Action::RefreshLocation);
        assert!(info.try_again);
        assert_eq!(info.close_code, Some(4003));
        assert!(info.message.contains("moved"));
    }
}
