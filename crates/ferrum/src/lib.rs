//! # Ferrum
//!
//! An event-driven client runtime for a real-time chat platform, with a
//! prefix-command framework on top.
//!
//! ## Overview
//!
//! ```text
//! ┌───────────────────┐  Envelope  ┌─────────────┐     ┌────────────┐
//! │ ConnectionManager │───────────▶│ EventRouter │────▶│ CacheStore │
//! │  (gateway)        │            │             │────▶│ Listeners  │──▶ Pipeline ──▶ Commands
//! └───────────────────┘            └─────────────┘────▶│  Waiters   │
//!                                                      └────────────┘
//! ```
//!
//! - **Gateway**: session handshake, heartbeat, resume and reconnect
//! - **Core**: envelopes, the entity cache, listener fan-out and waiters
//! - **Commands**: registry, argument conversion, checks, cooldowns,
//!   concurrency limits, extensions and the invocation pipeline
//! - **Runtime**: configuration, logging and the [`Client`](runtime::Client)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ferrum::prelude::*;
//!
//! async fn ping(_ctx: Arc<Context>) -> &'static str {
//!     "pong"
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = Client::builder().config(load_config()?).build()?;
//!     client.add_command(Command::build("ping").handler(ping))?;
//!     client.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `toml-config` *(default)* / `yaml-config`: configuration file formats
//! - `json-log`: JSON log output
//! - `ws` / `http` *(default via `full`)*: network transports

pub use ferrum_commands as commands;
pub use ferrum_core as core;
pub use ferrum_gateway as gateway;
pub use ferrum_runtime as runtime;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use ferrum::prelude::*;
/// ```
pub mod prelude {
    // Runtime - main entry point
    pub use ferrum_runtime::{Client, ClientBuilder, ConfigLoader, FerrumConfig, Loop, load_config};

    // Commands and extensions
    pub use ferrum_commands::prelude::*;
    pub use ferrum_commands::{Args, CommandBuilder, Outcome, help_command};

    // Events and the client handle
    pub use ferrum_core::{ClientHandle, Envelope, Event, Id, Message, Owner, User};
}
