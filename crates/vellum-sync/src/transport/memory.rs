//! In-memory WebSockets for testing.
//!
//! [`memory_network`] returns a socket provider for the client and the
//! server end that accepts its connections. Frames travel over tokio
//! channels; the server picks the first offered subprotocol.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;

use crate::error::{SyncError, SyncResult};
use crate::protocol::WebSocketCloseCode;

use super::{BoxFuture, SyncSocketProvider, WebSocket, WebSocketEndpoint, WebSocketEvent};

/// Creates a connected provider and server pair.
#[must_use]
pub fn memory_network() -> (Arc<MemorySocketProvider>, MemoryServer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let provider = MemorySocketProvider {
        accept: tx,
        refuse_next: AtomicU32::new(0),
        connects: AtomicU64::new(0),
    };
    let server = MemoryServer {
        accept: TokioMutex::new(rx),
    };
    (Arc::new(provider), server)
}

/// Client side: opens sockets to a [`MemoryServer`].
#[derive(Debug)]
pub struct MemorySocketProvider {
    accept: mpsc::UnboundedSender<MemoryServerConnection>,
    refuse_next: AtomicU32,
    connects: AtomicU64,
}

impl MemorySocketProvider {
    /// Makes the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.refuse_next.store(n, Ordering::SeqCst);
    }

    /// Connection attempts so far, failed ones included.
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    fn open(&self, endpoint: WebSocketEndpoint) -> SyncResult<Box<dyn WebSocket>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(SyncError::ConnectionFailed(format!(
                "{} refused the connection",
                endpoint.server
            )));
        }
        let protocol = endpoint
            .protocols
            .first()
            .cloned()
            .ok_or_else(|| SyncError::ConnectionFailed("no subprotocol offered".into()))?;

        let (to_client, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_client) = mpsc::unbounded_channel();
        let conn = MemoryServerConnection {
            endpoint,
            protocol: protocol.clone(),
            to_client,
            from_client,
        };
        self.accept
            .send(conn)
            .map_err(|_| SyncError::ConnectionFailed("memory server is gone".into()))?;
        Ok(Box::new(MemoryWebSocket {
            protocol,
            outgoing: Some(outgoing),
            incoming,
        }))
    }
}

impl SyncSocketProvider for MemorySocketProvider {
    fn connect(&self, endpoint: WebSocketEndpoint) -> BoxFuture<'_, SyncResult<Box<dyn WebSocket>>> {
        Box::pin(async move { self.open(endpoint) })
    }
}

struct MemoryWebSocket {
    protocol: String,
    outgoing: Option<mpsc::UnboundedSender<Bytes>>,
    incoming: mpsc::UnboundedReceiver<WebSocketEvent>,
}

impl WebSocket for MemoryWebSocket {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn send(&mut self, frame: Bytes) -> BoxFuture<'_, SyncResult<()>> {
        Box::pin(async move {
            let sent = self
                .outgoing
                .as_ref()
                .map_or(false, |tx| tx.send(frame).is_ok());
            if sent {
                Ok(())
            } else {
                Err(SyncError::WebSocketClosed {
                    code: WebSocketCloseCode::WriteError.code(),
                    reason: "peer is gone".into(),
                })
            }
        })
    }

    fn next_event(&mut self) -> BoxFuture<'_, Option<WebSocketEvent>> {
        Box::pin(async move {
            let event = self.incoming.recv().await;
            Some(event.unwrap_or_else(|| WebSocketEvent::Closed {
                code: WebSocketCloseCode::AbnormalClosure.code(),
                reason: "connection lost".into(),
            }))
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.outgoing = None;
        })
    }
}

/// Server side: accepts connections from a [`MemorySocketProvider`].
#[derive(Debug)]
pub struct MemoryServer {
    accept: TokioMutex<mpsc::UnboundedReceiver<MemoryServerConnection>>,
}

impl MemoryServer {
    /// Waits for the next connection; `None` once the provider is dropped.
    pub async fn accept(&self) -> Option<MemoryServerConnection> {
        self.accept.lock().await.recv().await
    }
}

/// Server end of one in-memory WebSocket.
#[derive(Debug)]
pub struct MemoryServerConnection {
    /// What the client connected to.
    pub endpoint: WebSocketEndpoint,
    /// Selected subprotocol.
    pub protocol: String,
    to_client: mpsc::UnboundedSender<WebSocketEvent>,
    from_client: mpsc::UnboundedReceiver<Bytes>,
}

impl MemoryServerConnection {
    /// Waits for the next client frame; `None` once the client closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.from_client.recv().await
    }

    /// Sends a frame to the client; false if the client is gone.
    pub fn send(&self, frame: Bytes) -> bool {
        self.to_client.send(WebSocketEvent::Message(frame)).is_ok()
    }

    /// Closes the connection with `code`.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.to_client.send(WebSocketEvent::Closed {
            code,
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{make_subprotocols, ServerEndpoint};
    use vellum_common::config::SyncMode;

    fn endpoint() -> WebSocketEndpoint {
        WebSocketEndpoint {
            server: ServerEndpoint::parse("ws://localhost").unwrap(),
            protocols: make_subprotocols(SyncMode::Pbs),
        }
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (provider, server) = memory_network();
        let mut socket = provider.connect(endpoint()).await.unwrap();
        let mut conn = server.accept().await.unwrap();
        assert_eq!(socket.protocol(), "com.mongodb.realm-sync#10");

        socket.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(conn.recv().await.unwrap(), Bytes::from_static(b"ping"));

        assert!(conn.send(Bytes::from_static(b"pong")));
        assert_eq!(
            socket.next_event().await,
            Some(WebSocketEvent::Message(Bytes::from_static(b"pong")))
        );

        conn.close(4001, "expired");
        assert_eq!(
            socket.next_event().await,
            Some(WebSocketEvent::Closed {
                code: 4001,
                reason: "expired".into()
            })
        );
    }

    #[tokio::test]
    async fn test_refused_connections() {
        let (provider, server) = memory_network();
        provider.fail_next_connects(2);
        assert!(provider.connect(endpoint()).await.is_err());
        assert!(provider.connect(endpoint()).await.is_err());
        assert!(provider.connect(endpoint()).await.is_ok());
        assert_eq!(provider.connect_count(), 3);
        assert!(server.accept().await.is_some());
    }

    #[tokio::test]
    async fn test_dropped_server_end_reads_as_abnormal_close() {
        let (provider, server) = memory_network();
        let mut socket = provider.connect(endpoint()).await.unwrap();
        drop(server.accept().await);
        assert!(matches!(
            socket.next_event().await,
            Some(WebSocketEvent::Closed { code: 1006, .. })
        ));
    }
}
