//! Configuration for the Ferrum runtime.
//!
//! Layered loading through figment (defaults, files, environment,
//! overrides) plus validation that runs before anything connects.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile};
pub use schema::{
    BackoffConfig, CacheConfig, ClientConfig, CommandsConfig, ConcurrencyConfig, CooldownConfig,
    FerrumConfig, GatewaySettings, LogFormat, LogLevel, LogOutput, LogRotation, LoggingConfig,
    SpanEventConfig,
};
pub use validation::validate_config;

/// Loads from the default locations with environment overrides.
pub fn load_config() -> ConfigResult<FerrumConfig> {
    ConfigLoader::new().load()
}

/// Loads one file plus environment overrides.
pub fn load_config_from_file(path: impl AsRef<std::path::Path>) -> ConfigResult<FerrumConfig> {
    ConfigLoader::new().file(path.as_ref()).load()
}
