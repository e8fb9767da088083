//! # Ferrum Runtime
//!
//! Configuration, logging and the [`Client`] that wires the gateway,
//! router and command pipeline together.
//!
//! ## Features
//!
//! - `toml-config` *(default)*: load `ferrum.toml`
//! - `yaml-config`: load `ferrum.yaml` / `ferrum.yml`
//! - `json-log`: JSON log output
//! - `ws` / `http`: default network connector and executor
//!
//! ```rust,ignore
//! use ferrum_runtime::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = Client::builder().config(load_config()?).build()?;
//!     client.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod tasks;

pub use client::{Client, ClientBuilder};
pub use config::{
    ConfigError, ConfigLoader, ConfigResult, FerrumConfig, Profile, load_config,
    load_config_from_file,
};
pub use error::{RuntimeError, RuntimeResult};
pub use logging::{LoggingBuilder, SpanEvents, init_from_config};
pub use tasks::Loop;

// Re-export tracing for use by other crates
pub use tracing;
pub use tracing_subscriber;

/// Logging macros plus the client entry points.
pub mod prelude {
    pub use super::{Client, ClientBuilder, ConfigLoader, FerrumConfig, Loop, load_config};
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};
}
