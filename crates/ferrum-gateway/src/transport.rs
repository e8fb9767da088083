//! Frame transports.
//!
//! The connection manager is written against [`Connector`] and
//! [`FrameTransport`] so the same session logic runs over a real WebSocket
//! (`ws` feature) or over [`MemoryConnector`] in tests.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use ferrum_core::{GatewayError, GatewayResult};

/// Something received from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A text frame.
    Text(String),
    /// The remote closed the connection.
    Closed { code: Option<u16>, reason: String },
}

/// One open bidirectional frame stream.
#[async_trait]
pub trait FrameTransport: Send {
    async fn send(&mut self, text: String) -> GatewayResult<()>;

    /// Returns the next inbound item; `None` once the stream has ended.
    async fn recv(&mut self) -> Option<GatewayResult<Inbound>>;

    async fn close(&mut self, code: u16);
}

/// Opens transports. Called once per connect and once per recovery attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> GatewayResult<Box<dyn FrameTransport>>;
}

/// Shared connector.
pub type BoxedConnector = Arc<dyn Connector>;

// =============================================================================
// In-memory transport
// =============================================================================

/// The remote end of an in-memory connection.
pub struct MemoryPeer {
    /// URL the client connected to.
    pub url: String,
    to_client: mpsc::UnboundedSender<Inbound>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    /// Sends a text frame to the client.
    pub fn send(&self, text: impl Into<String>) -> bool {
        self.to_client.send(Inbound::Text(text.into())).is_ok()
    }

    /// Closes the connection from the remote side.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.to_client.send(Inbound::Closed {
            code: Some(code),
            reason: reason.into(),
        });
    }

    /// Waits for the next frame the client sends; `None` once it hung up.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }
}

/// Connector that hands every new connection's remote end to a test.
#[derive(Clone)]
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    refuse: Arc<Mutex<u32>>,
}

impl MemoryConnector {
    /// Returns the connector and the stream of accepted peers.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers,
                refuse: Arc::new(Mutex::new(0)),
            },
            rx,
        )
    }

    /// Makes the next `count` connection attempts fail.
    pub fn refuse_next(&self, count: u32) {
        *self.refuse.lock() = count;
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> GatewayResult<Box<dyn FrameTransport>> {
        {
            let mut refuse = self.refuse.lock();
            if *refuse > 0 {
                *refuse -= 1;
                return Err(GatewayError::connection(format!("refused: {url}")));
            }
        }

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        self.peers
            .send(MemoryPeer {
                url: url.to_string(),
                to_client,
                from_client,
            })
            .map_err(|_| GatewayError::connection("memory server is gone"))?;

        Ok(Box::new(MemoryTransport {
            inbound,
            outbound: Some(outbound),
        }))
    }
}

struct MemoryTransport {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl FrameTransport for MemoryTransport {
    async fn send(&mut self, text: String) -> GatewayResult<()> {
        self.outbound
            .as_ref()
            .ok_or(GatewayError::Closed)?
            .send(text)
            .map_err(|_| GatewayError::connection("peer hung up"))
    }

    async fn recv(&mut self) -> Option<GatewayResult<Inbound>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self, _code: u16) {
        self.outbound = None;
        self.inbound.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_roundtrip() {
        let (connector, mut peers) = MemoryConnector::new();
        let mut transport = connector.connect("memory://gw").await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.url, "memory://gw");

        transport.send("hello".into()).await.unwrap();
        assert_eq!(peer.recv().await.as_deref(), Some("hello"));

        peer.send("world");
        assert_eq!(
            transport.recv().await.unwrap().unwrap(),
            Inbound::Text("world".into())
        );

        transport.close(1000).await;
        assert_eq!(peer.recv().await, None);
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let (connector, _peers) = MemoryConnector::new();
        connector.refuse_next(1);
        assert!(connector.connect("memory://gw").await.is_err());
        assert!(connector.connect("memory://gw").await.is_ok());
    }
}
