//! # Ferrum Commands
//!
//! Prefix commands on top of the event router.
//!
//! This layer provides:
//! - A command tree with groups, aliases and qualified names
//! - Typed parameters with async converters for entities
//! - Checks, cooldown buckets and concurrency limits
//! - An invocation pipeline with lifecycle hooks and error routing
//! - Extensions that load and unload bundles of commands and listeners
//!
//! # Example
//!
//! ```rust,ignore
//! use ferrum_commands::prelude::*;
//!
//! let registry = Arc::new(CommandRegistry::default());
//! registry.add_command(
//!     Command::build("add")
//!         .param(Param::required::<i64>("a"))
//!         .param(Param::required::<i64>("b"))
//!         .handler(|ctx: Arc<Context>| async move {
//!             let a = ctx.args().get::<i64>("a").copied().unwrap_or_default();
//!             let b = ctx.args().get::<i64>("b").copied().unwrap_or_default();
//!             (a + b).to_string()
//!         }),
//! )?;
//!
//! let pipeline = Arc::new(Pipeline::new(handle, registry, PipelineConfig::default()));
//! pipeline.attach();
//! ```

pub mod checks;
pub mod concurrency;
pub mod context;
pub mod convert;
pub mod cooldown;
pub mod error;
pub mod extension;
pub mod handler;
pub mod help;
pub mod pipeline;
pub mod prefix;
pub mod registry;
pub mod tokenize;

#[cfg(test)]
mod testing;

pub use checks::{
    Check, RoleRef, bot_has_any_role, bot_has_role, check_any, dm_only, guild_only, has_any_role,
    has_role, is_owner,
};
pub use concurrency::{ConcurrencyPermit, MaxConcurrency};
pub use context::{ArgValue, Args, Context};
pub use convert::{Converter, FnConverter, FromArgument, Param, ParamKind, Typed};
pub use cooldown::{BucketKey, BucketScope, Cooldown, CooldownMapping};
pub use error::{
    CommandError, CommandResult, ConversionError, ExtensionError, HandlerPanicked,
    RegistrationError,
};
pub use extension::{Extension, ExtensionScope};
pub use handler::{
    CatchPanic, CatchPanicLayer, CommandService, ErrorHook, Hook, IntoReply, error_hook,
    handler_fn, hook,
};
pub use help::{help_command, help_text};
pub use pipeline::{CooldownCharge, Outcome, Pipeline, PipelineConfig, Stage};
pub use prefix::{Prefix, when_mentioned, when_mentioned_or};
pub use registry::{
    Command, CommandBuilder, CommandRegistry, ConcurrencyPolicy, CooldownPolicy, RegistryOptions,
    Resolution,
};
pub use tokenize::{Token, shell_split, tokenize};

/// Everything needed to declare commands and extensions.
pub mod prelude {
    pub use std::sync::Arc;

    pub use async_trait::async_trait;
    pub use tower::BoxError;

    pub use super::{
        BucketScope, Check, Command, CommandError, CommandRegistry, Context, Extension,
        ExtensionScope, FromArgument, IntoReply, Param, Pipeline, PipelineConfig, Prefix,
        bot_has_any_role, bot_has_role, check_any, dm_only, guild_only, has_any_role, has_role,
        is_owner, when_mentioned, when_mentioned_or,
    };
}
