//! The sync wire protocol.
//!
//! - [`message`]: client and server message codec
//! - [`error`]: protocol error codes, actions and error details
//! - [`close`]: WebSocket close code classification
//! - [`endpoint`]: server URL parsing and subprotocol negotiation

pub mod close;
pub mod endpoint;
pub mod error;
pub mod message;

pub use close::{classify_close, close_error_info, CloseClassification, WebSocketCloseCode};
pub use endpoint::{
    make_subprotocols, parse_subprotocol, ProtocolEnvelope, ServerEndpoint,
    CURRENT_PROTOCOL_VERSION, FLX_SUBPROTOCOL_PREFIX, OLDEST_PROTOCOL_VERSION,
    PBS_SUBPROTOCOL_PREFIX,
};
pub use error::{Action, CompensatingWriteInfo, ProtocolError, ProtocolErrorInfo};
pub use message::{
    ClientMessage, RemoteChangeset, SaltedFileIdent, ServerMessage, UploadChangeset,
};
