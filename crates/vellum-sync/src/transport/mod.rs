//! Network seams of the sync client.
//!
//! The client never opens sockets itself. WebSocket connections come from a
//! [`SyncSocketProvider`] and HTTP requests (access token refresh) go
//! through a [`GenericNetworkTransport`], both supplied by the application.
//! [`memory`] provides in-process implementations for tests.

pub mod memory;

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

use crate::error::SyncResult;
use crate::protocol::ServerEndpoint;

pub use memory::{memory_network, MemoryServer, MemoryServerConnection, MemorySocketProvider};

/// Boxed future returned by the transport traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Where to connect and which subprotocols to offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketEndpoint {
    /// Server address.
    pub server: ServerEndpoint,
    /// Offered subprotocols in order of preference.
    pub protocols: Vec<String>,
}

/// Something that happened on an open WebSocket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebSocketEvent {
    /// A binary frame arrived.
    Message(Bytes),
    /// The connection closed.
    Closed {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// An open WebSocket.
pub trait WebSocket: Send {
    /// Subprotocol the server selected during the handshake.
    fn protocol(&self) -> &str;

    /// Sends one binary frame.
    fn send(&mut self, frame: Bytes) -> BoxFuture<'_, SyncResult<()>>;

    /// Waits for the next event; `None` once the socket is gone.
    ///
    /// Must be cancel safe: dropping the future before it completes must
    /// not lose an event.
    fn next_event(&mut self) -> BoxFuture<'_, Option<WebSocketEvent>>;

    /// Closes the socket with a normal close code.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Opens WebSockets for the sync client.
pub trait SyncSocketProvider: Send + Sync {
    /// Connects and completes the handshake.
    fn connect(&self, endpoint: WebSocketEndpoint) -> BoxFuture<'_, SyncResult<Box<dyn WebSocket>>>;
}

/// HTTP method of a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// GET.
    Get,
    /// POST.
    Post,
    /// PUT.
    Put,
    /// PATCH.
    Patch,
    /// DELETE.
    Delete,
}

/// An HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Method.
    pub method: HttpMethod,
    /// Absolute URL.
    pub url: String,
    /// Timeout in milliseconds.
    pub timeout_ms: u64,
    /// Request headers.
    pub headers: BTreeMap<String, String>,
    /// Request body.
    pub body: String,
}

/// An HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Response {
    /// HTTP status code; zero if the request never got an answer.
    pub http_status_code: u16,
    /// Transport specific error code; zero on success.
    pub custom_status_code: i32,
    /// Response headers.
    pub headers: BTreeMap<String, String>,
    /// Response body.
    pub body: String,
}

/// Performs HTTP requests on behalf of the client.
pub trait GenericNetworkTransport: Send + Sync {
    /// Sends a request and waits for the response.
    fn send_request_to_server(&self, request: Request) -> BoxFuture<'_, Response>;
}
