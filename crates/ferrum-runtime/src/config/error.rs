//! Configuration errors.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    /// An explicitly requested file does not exist.
    #[error("config file {} does not exist", .0.display())]
    FileNotFound(PathBuf),

    #[error("unsupported config file format: {0}")]
    UnsupportedFormat(String),

    /// A source could not be read or did not match the schema.
    #[error("could not extract configuration: {0}")]
    Extract(#[from] Box<figment::Error>),

    #[error("invalid configuration: {message}")]
    Invalid { message: String },

    #[error("required setting `{field}` is missing")]
    MissingField { field: String },

    #[error("`{url}` is not a valid URL here: {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self::Extract(Box::new(e))
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;
