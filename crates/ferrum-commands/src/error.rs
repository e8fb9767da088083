//! Error types for command handling.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use ferrum_core::BoxError;

use crate::cooldown::BucketScope;

// =============================================================================
// Pipeline errors
// =============================================================================

/// Everything an invocation can fail with.
///
/// Each variant corresponds to one pipeline stage. Errors are routed to the
/// command's error hook, then its extension's, then the global one; with no
/// hook registered they are logged.
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    /// The prefix matched but no command did.
    #[error("command \"{name}\" is not found")]
    NotFound { name: String },

    /// A parameter failed to convert.
    #[error("failed to convert parameter \"{param}\": {cause}")]
    BadArgument { param: String, cause: String },

    /// A required parameter had no token.
    #[error("missing required argument \"{param}\"")]
    MissingRequiredArgument { param: String },

    /// A check rejected the invocation.
    #[error("check \"{check}\" failed")]
    CheckFailure { check: String },

    /// The cooldown bucket is exhausted.
    #[error("command is on cooldown, retry in {:.2}s", .retry_after.as_secs_f64())]
    OnCooldown { retry_after: Duration },

    /// Every concurrency slot for this scope is taken.
    #[error("too many concurrent invocations (limit {limit} per {scope})")]
    MaxConcurrencyReached { limit: usize, scope: BucketScope },

    /// The handler or a hook returned an error or panicked.
    #[error("command raised an error: {0}")]
    InvokeError(Arc<BoxError>),
}

impl CommandError {
    pub fn bad_argument(param: impl Into<String>, cause: impl ToString) -> Self {
        Self::BadArgument {
            param: param.into(),
            cause: cause.to_string(),
        }
    }

    pub fn check_failure(check: impl Into<String>) -> Self {
        Self::CheckFailure {
            check: check.into(),
        }
    }

    pub fn invoke(cause: BoxError) -> Self {
        Self::InvokeError(Arc::new(cause))
    }

    /// The wrapped handler fault, for [`CommandError::InvokeError`].
    pub fn cause(&self) -> Option<&BoxError> {
        match self {
            Self::InvokeError(cause) => Some(&**cause),
            _ => None,
        }
    }

    /// Errors caused by what the user typed rather than by the command.
    pub fn is_user_input(&self) -> bool {
        matches!(
            self,
            Self::BadArgument { .. } | Self::MissingRequiredArgument { .. }
        )
    }
}

/// Result type for pipeline stages.
pub type CommandResult<T> = Result<T, CommandError>;

/// A handler or hook panicked. Wrapped in [`CommandError::InvokeError`].
#[derive(Debug, Error)]
#[error("handler panicked: {0}")]
pub struct HandlerPanicked(pub String);

/// Why a single argument failed to convert. Carried as the cause of
/// [`CommandError::BadArgument`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    #[error("{kind} \"{argument}\" not found")]
    NotFound { kind: &'static str, argument: String },

    #[error("{kind} lookups only work inside a guild")]
    GuildOnly { kind: &'static str },

    #[error("\"{0}\" is not a recognised boolean")]
    NotBoolean(String),

    #[error("\"{argument}\" is not a valid {kind}: {reason}")]
    Malformed {
        kind: &'static str,
        argument: String,
        reason: String,
    },
}

impl ConversionError {
    pub fn not_found(kind: &'static str, argument: &str) -> Self {
        Self::NotFound {
            kind,
            argument: argument.to_string(),
        }
    }
}

// =============================================================================
// Registration errors
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// A name or alias is already taken at that tree position.
    #[error("command \"{name}\" is already registered")]
    DuplicateCommand { name: String },

    /// The parent of a subcommand does not exist.
    #[error("parent command \"{parent}\" is not registered")]
    UnknownParent { parent: String },

    /// A parameter list that cannot be parsed unambiguously.
    #[error("invalid signature for \"{command}\": {reason}")]
    InvalidSignature { command: String, reason: String },
}

impl RegistrationError {
    pub fn duplicate(name: impl Into<String>) -> Self {
        Self::DuplicateCommand { name: name.into() }
    }
}

// =============================================================================
// Extension errors
// =============================================================================

#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("extension \"{0}\" is already loaded")]
    AlreadyLoaded(String),

    #[error("extension \"{0}\" is not loaded")]
    NotLoaded(String),

    /// Setup failed. Everything it registered has been removed again.
    #[error("extension \"{name}\" failed to set up: {cause}")]
    SetupFailed { name: String, cause: BoxError },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cooldown_message() {
        let err = CommandError::OnCooldown {
            retry_after: Duration::from_millis(4500),
        };
        assert_eq!(err.to_string(), "command is on cooldown, retry in 4.50s");
    }

    #[test]
    fn test_invoke_error_keeps_cause() {
        let err = CommandError::invoke("boom".into());
        assert_eq!(err.cause().unwrap().to_string(), "boom");
        assert_eq!(err.to_string(), "command raised an error: boom");
        assert!(!err.is_user_input());
    }

    #[test]
    fn test_max_concurrency_message() {
        let err = CommandError::MaxConcurrencyReached {
            limit: 1,
            scope: BucketScope::Global,
        };
        assert_eq!(
            err.to_string(),
            "too many concurrent invocations (limit 1 per global)"
        );
    }
}
