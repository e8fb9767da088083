//! WebSocket transport over `tokio-tungstenite`.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{info, trace, warn};

use ferrum_core::{GatewayError, GatewayResult};

use crate::transport::{Connector, FrameTransport, Inbound};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Opens WebSocket connections.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> GatewayResult<Box<dyn FrameTransport>> {
        info!(url = %url, "Connecting to WebSocket server");
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| GatewayError::connection(format!("WebSocket connection failed: {e}")))?;
        let (tx, rx) = stream.split();
        Ok(Box::new(WsTransport { tx, rx }))
    }
}

struct WsTransport {
    tx: WsSink,
    rx: WsSource,
}

#[async_trait]
impl FrameTransport for WsTransport {
    async fn send(&mut self, text: String) -> GatewayResult<()> {
        self.tx
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| GatewayError::connection(format!("send failed: {e}")))
    }

    async fn recv(&mut self) -> Option<GatewayResult<Inbound>> {
        loop {
            match self.rx.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(Inbound::Text(text.to_string()))),
                Ok(Message::Binary(data)) => {
                    return Some(Ok(Inbound::Text(String::from_utf8_lossy(&data).into_owned())));
                }
                Ok(Message::Ping(data)) => {
                    trace!("Received ping, sending pong");
                    let _ = self.tx.send(Message::Pong(data)).await;
                }
                Ok(Message::Pong(_)) => trace!("Received pong"),
                Ok(Message::Close(frame)) => {
                    info!(frame = ?frame, "Server closed connection");
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                        None => (None, String::new()),
                    };
                    return Some(Ok(Inbound::Closed { code, reason }));
                }
                Ok(Message::Frame(_)) => {}
                Err(e) => {
                    warn!(error = %e, "WebSocket error");
                    return Some(Err(GatewayError::connection(e.to_string())));
                }
            }
        }
    }

    async fn close(&mut self, code: u16) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        let _ = self.tx.send(Message::Close(Some(frame))).await;
        let _ = self.tx.close().await;
    }
}
