//! # vellum-sync
//!
//! Sync client for Vellum databases.
//!
//! This crate provides:
//!
//! - **Protocol**: the binary message codec, protocol error codes and the
//!   actions they request, WebSocket close code classification, server URL
//!   parsing and subprotocol negotiation
//! - **Sessions**: the session state machine, its connection task with
//!   reconnect backoff, upload and download completion waits, progress
//!   notifications and stop policies
//! - **Client reset**: discarding or recovering local changes when the
//!   server can no longer continue a client file's history
//! - **Auth**: users and access token refresh
//! - **Transport**: traits for WebSockets and HTTP, plus an in-memory
//!   WebSocket for tests
//! - **Manager**: users and the sessions of one client
//!
//! ## Example
//!
//! ```rust
//! use vellum_sync::protocol::{classify_close, Action, ServerEndpoint};
//!
//! let endpoint = ServerEndpoint::parse("realms://sync.example.com").unwrap();
//! assert_eq!(endpoint.port, 7801);
//! assert!(endpoint.is_ssl());
//!
//! let expired = classify_close(4001);
//! assert_eq!(expired.action, Action::RefreshUser);
//! assert!(!expired.is_fatal);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
mod client;
pub mod client_reset;
pub mod error;
pub mod manager;
pub mod progress;
pub mod protocol;
pub mod resumption;
pub mod session;
pub mod transport;

pub use auth::{SyncUser, UserState};
pub use client_reset::{ClientResetHooks, ClientResetOutcome};
pub use error::{SyncError, SyncResult};
pub use manager::SyncManager;
pub use progress::{ProgressDirection, ProgressValues, SyncProgressNotifier};
pub use protocol::{Action, ProtocolError, ProtocolErrorInfo};
pub use resumption::{ResumptionBackoff, ResumptionDelayInfo};
pub use session::{
    CompletionCallback, ConnectionState, SessionErrorHandler, SessionErrorInfo, SessionState,
    SyncSession,
};
