//! # Ferrum Gateway
//!
//! Session management for the Ferrum client runtime.
//!
//! ## Features
//!
//! - `ws`: WebSocket [`Connector`] over `tokio-tungstenite`
//! - `http`: REST [`RequestExecutor`](ferrum_core::RequestExecutor) over `reqwest`
//! - `full`: both
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────┐   Envelope   ┌──────────────────┐
//! │ ConnectionManager │─────────────▶│ mpsc → EventRouter│
//! │  handshake        │              └──────────────────┘
//! │  heartbeat        │◀──── GatewaySender (presence, raw frames)
//! │  resume/identify  │
//! ├───────────────────┤
//! │ Connector         │  (WebSocket, in-memory)
//! └───────────────────┘
//! ```
//!
//! The manager is written against [`Connector`] and [`FrameTransport`], so
//! tests drive full sessions through [`MemoryConnector`].

pub mod frame;
pub mod manager;
pub mod session;
pub mod transport;

#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "ws")]
pub mod ws;

pub use frame::{ConnectionProperties, GatewayFrame, Opcode};
pub use manager::{Backoff, ConnectionManager, Credentials, GatewayConfig, SessionHandle};
pub use session::{SessionState, SessionStatus};
pub use transport::{
    BoxedConnector, Connector, FrameTransport, Inbound, MemoryConnector, MemoryPeer,
};

#[cfg(feature = "http")]
pub use http::{HttpConfig, HttpExecutor};
#[cfg(feature = "ws")]
pub use ws::WsConnector;
