//! Runtime error types.

use ferrum_commands::{ExtensionError, RegistrationError};
use ferrum_core::{GatewayError, RequestError};
use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can occur while building or running a client.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error("Extension error: {0}")]
    Extension(#[from] ExtensionError),

    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    /// No executor was supplied and the `http` feature is off.
    #[error("No request executor configured (enable the `http` feature or supply one)")]
    MissingExecutor,

    /// No connector was supplied and the `ws` feature is off.
    #[error("No gateway connector configured (enable the `ws` feature or supply one)")]
    MissingConnector,

    #[error("Client is already running")]
    AlreadyRunning,

    /// A client cannot be started again after shutdown.
    #[error("Client has been shut down")]
    ShutDown,
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
