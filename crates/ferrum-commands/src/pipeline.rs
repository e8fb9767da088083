//! The invocation pipeline.
//!
//! Every `MESSAGE_CREATE` goes through the same stages:
//!
//! ```text
//! PrefixMatch → Tokenize → Resolve → Convert → Check → RateLimit → Invoke → Cleanup
//! ```
//!
//! A message that fails the prefix match (or carries nothing after it) is
//! ignored. Any later failure becomes a [`CommandError`] and is routed to the
//! nearest error hook: the command's own, then its enclosing groups', then
//! its extension's, then the global one. Unhandled errors are logged.
//!
//! Each message is processed on its own task, so an invocation waiting for a
//! concurrency slot or a request never holds up event dispatch.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower::{BoxError, ServiceExt};
use tracing::{Instrument, Level, Span, debug, error, field, info, span, warn};

use ferrum_core::{ClientHandle, Event, Id, ListenerId, Message, Owner};

use crate::checks::Check;
use crate::concurrency::ConcurrencyPermit;
use crate::context::Context;
use crate::convert::convert_arguments;
use crate::error::{CommandError, CommandResult};
use crate::extension::Extension;
use crate::handler::{ErrorHook, Hook, error_hook, hook, run_error_hook, run_hook};
use crate::help::help_command;
use crate::prefix::Prefix;
use crate::registry::{Command, CommandRegistry};
use crate::tokenize::{Token, tokenize};

// =============================================================================
// Configuration
// =============================================================================

/// When a waiting concurrency acquisition charges the cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownCharge {
    /// Charge the cooldown, then wait for a slot. Time spent waiting counts
    /// against the window.
    #[default]
    BeforeWait,
    /// Wait for a slot first, then charge the cooldown.
    AfterWait,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub prefix: Prefix,
    /// Skip messages whose author is flagged as a bot.
    pub ignore_bots: bool,
    /// Users that pass [`is_owner`](crate::checks::is_owner).
    pub owner_ids: HashSet<Id>,
    pub cooldown_charge: CooldownCharge,
    /// Register the built-in `help` command.
    pub help: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            prefix: Prefix::literal("!"),
            ignore_bots: true,
            owner_ids: HashSet::new(),
            cooldown_charge: CooldownCharge::default(),
            help: true,
        }
    }
}

impl PipelineConfig {
    pub fn with_prefix(mut self, prefix: impl Into<Prefix>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// Pipeline stages, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    PrefixMatch,
    Tokenize,
    Resolve,
    Convert,
    Check,
    RateLimit,
    Invoke,
    Cleanup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PrefixMatch => "prefix_match",
            Self::Tokenize => "tokenize",
            Self::Resolve => "resolve",
            Self::Convert => "convert",
            Self::Check => "check",
            Self::RateLimit => "rate_limit",
            Self::Invoke => "invoke",
            Self::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// How one message left the pipeline.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Not a command.
    Ignored,
    Completed { command: String },
    /// Already routed to an error hook or logged.
    Failed(CommandError),
}

impl Outcome {
    pub fn error(&self) -> Option<&CommandError> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}

// =============================================================================
// Hooks
// =============================================================================

/// Checks and hooks attached at bot or extension level.
#[derive(Clone, Default)]
pub(crate) struct HookSet {
    pub checks: Vec<Check>,
    pub before: Option<Hook>,
    pub after: Option<Hook>,
    pub on_error: Option<ErrorHook>,
}

#[derive(Default)]
struct GlobalHooks {
    hooks: HookSet,
    once_checks: Vec<Check>,
}

// =============================================================================
// Pipeline
// =============================================================================

/// Turns messages into command invocations.
pub struct Pipeline {
    handle: ClientHandle,
    registry: Arc<CommandRegistry>,
    config: PipelineConfig,
    owners: Arc<HashSet<Id>>,
    global: RwLock<GlobalHooks>,
    pub(crate) extension_hooks: RwLock<HashMap<Arc<str>, HookSet>>,
    pub(crate) extensions: tokio::sync::Mutex<IndexMap<String, Arc<dyn Extension>>>,
}

impl Pipeline {
    pub fn new(handle: ClientHandle, registry: Arc<CommandRegistry>, config: PipelineConfig) -> Self {
        if config.help && registry.get_command("help").is_none() {
            if let Err(e) = registry.add_command(help_command()) {
                warn!(error = %e, "Could not register the built-in help command");
            }
        }
        Self {
            handle,
            registry,
            owners: Arc::new(config.owner_ids.clone()),
            config,
            global: RwLock::new(GlobalHooks::default()),
            extension_hooks: RwLock::new(HashMap::new()),
            extensions: tokio::sync::Mutex::new(IndexMap::new()),
        }
    }

    pub fn handle(&self) -> &ClientHandle {
        &self.handle
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Starts processing `MESSAGE_CREATE` events from the router. Each
    /// message runs on its own task.
    pub fn attach(self: &Arc<Self>) -> ListenerId {
        let pipeline: Weak<Self> = Arc::downgrade(self);
        self.handle
            .router()
            .register_listener("MESSAGE_CREATE", Owner::Client, move |event: Event| {
                let pipeline = pipeline.clone();
                async move {
                    let Some(pipeline) = pipeline.upgrade() else {
                        return Ok(());
                    };
                    let message: Message = event.decode()?;
                    tokio::spawn(async move {
                        pipeline.process(Arc::new(message)).await;
                    });
                    Ok::<(), BoxError>(())
                }
            })
    }

    // -------------------------------------------------------------------------
    // Global hooks
    // -------------------------------------------------------------------------

    /// Adds a check evaluated for every node of the resolved command path.
    pub fn add_check(&self, check: Check) {
        self.global.write().hooks.checks.push(check);
    }

    /// Adds a check evaluated exactly once per invocation, before all others.
    pub fn add_check_once(&self, check: Check) {
        self.global.write().once_checks.push(check);
    }

    /// Removes global checks named `name`. Returns `true` if any was removed.
    pub fn remove_check(&self, name: &str) -> bool {
        let mut global = self.global.write();
        let before = global.hooks.checks.len() + global.once_checks.len();
        global.hooks.checks.retain(|c| c.name() != name);
        global.once_checks.retain(|c| c.name() != name);
        before != global.hooks.checks.len() + global.once_checks.len()
    }

    pub fn before_invoke<F, Fut>(&self, f: F)
    where
        F: Fn(Arc<Context>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.global.write().hooks.before = Some(hook(f));
    }

    pub fn after_invoke<F, Fut>(&self, f: F)
    where
        F: Fn(Arc<Context>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.global.write().hooks.after = Some(hook(f));
    }

    /// Handles every error no narrower hook claimed, including
    /// [`CommandError::NotFound`].
    pub fn on_error<F, Fut>(&self, f: F)
    where
        F: Fn(Arc<Context>, CommandError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.global.write().hooks.on_error = Some(error_hook(f));
    }

    // -------------------------------------------------------------------------
    // Processing
    // -------------------------------------------------------------------------

    /// Runs one message through every stage.
    pub async fn process(self: &Arc<Self>, message: Arc<Message>) -> Outcome {
        if self.config.ignore_bots && message.author.bot {
            return Outcome::Ignored;
        }

        let Some((prefix, rest)) = self.config.prefix.strip(&self.handle, &message) else {
            return Outcome::Ignored;
        };
        let rest = rest.to_string();

        let tokens = tokenize(&rest);
        if tokens.is_empty() {
            debug!(stage = %Stage::Tokenize, "Prefix without a command");
            return Outcome::Ignored;
        }

        let ctx = Context::new(self.handle.clone(), message.clone(), self.registry.clone())
            .with_pipeline(Arc::downgrade(self))
            .with_owners(self.owners.clone());
        let span = span!(
            Level::DEBUG,
            "invoke",
            id = %ctx.id(),
            message = %message.id,
            command = field::Empty,
        );
        self.invoke(ctx, prefix, rest, tokens)
            .instrument(span)
            .await
    }

    async fn invoke(
        &self,
        ctx: Context,
        prefix: String,
        input: String,
        tokens: Vec<Token>,
    ) -> Outcome {
        let texts: Vec<&str> = tokens.iter().map(|t| t.text.as_str()).collect();

        let Some(resolution) = self.registry.resolve(&texts) else {
            let err = CommandError::NotFound {
                name: tokens[0].text.clone(),
            };
            let ctx = ctx.with_prefix(prefix, tokens[0].text.clone());
            return self.fail(Arc::new(ctx), &[], Stage::Resolve, err).await;
        };

        let command = resolution.command().clone();
        Span::current().record("command", command.qualified_name());
        let remaining = resolution.remaining(&tokens);
        let mut ctx = ctx.with_prefix(prefix, tokens[resolution.consumed - 1].text.clone());
        ctx.set_command(
            command.clone(),
            remaining.iter().map(|t| t.text.clone()).collect(),
        );

        if !command.is_invocable() {
            let name = match remaining.first() {
                Some(token) => format!("{} {}", command.qualified_name(), token.text),
                None => command.qualified_name().to_string(),
            };
            let err = CommandError::NotFound { name };
            return self.fail(Arc::new(ctx), &[], Stage::Resolve, err).await;
        }

        match convert_arguments(&ctx, command.params(), &input, remaining).await {
            Ok(args) => ctx.set_args(args),
            Err(err) => {
                return self
                    .fail(Arc::new(ctx), &resolution.chain, Stage::Convert, err)
                    .await;
            }
        }
        let ctx = Arc::new(ctx);

        if let Err(err) = self.run_checks(&ctx, &resolution.chain).await {
            return self.fail(ctx, &resolution.chain, Stage::Check, err).await;
        }

        let permit = match self.rate_limit(&ctx, &command).await {
            Ok(permit) => permit,
            Err(err) => return self.fail(ctx, &resolution.chain, Stage::RateLimit, err).await,
        };

        let result = self.call(&ctx, &command).await;

        debug!(stage = %Stage::Cleanup, "Releasing invocation resources");
        drop(permit);

        match result {
            Ok(()) => {
                debug!("Command completed");
                Outcome::Completed {
                    command: command.qualified_name().to_string(),
                }
            }
            Err(err) => self.fail(ctx, &resolution.chain, Stage::Invoke, err).await,
        }
    }

    async fn run_checks(&self, ctx: &Arc<Context>, chain: &[Arc<Command>]) -> CommandResult<()> {
        let (once, global) = {
            let hooks = self.global.read();
            (hooks.once_checks.clone(), hooks.hooks.checks.clone())
        };
        let extension = self
            .hooks_for(ctx.command().and_then(|c| c.extension()))
            .map(|h| h.checks)
            .unwrap_or_default();

        let mut checks: Vec<Check> = once;
        checks.extend(extension);
        for node in chain {
            checks.extend(global.iter().cloned());
            checks.extend(node.checks().iter().cloned());
        }

        for check in checks {
            if !check.run(ctx.clone()).await {
                debug!(stage = %Stage::Check, check = %check.name(), "Check rejected invocation");
                return Err(CommandError::check_failure(check.name()));
            }
        }
        Ok(())
    }

    async fn rate_limit(
        &self,
        ctx: &Context,
        command: &Command,
    ) -> CommandResult<Option<ConcurrencyPermit>> {
        let message = ctx.message();
        match self.config.cooldown_charge {
            CooldownCharge::BeforeWait => {
                charge_cooldown(command, message)?;
                acquire_slot(command, message).await
            }
            CooldownCharge::AfterWait => {
                let permit = acquire_slot(command, message).await?;
                charge_cooldown(command, message)?;
                Ok(permit)
            }
        }
    }

    /// Before-hooks, handler, after-hooks.
    async fn call(&self, ctx: &Arc<Context>, command: &Arc<Command>) -> CommandResult<()> {
        let global = self.global.read().hooks.clone();
        let extension = self.hooks_for(command.extension()).unwrap_or_default();

        let before = [global.before.as_ref(), extension.before.as_ref(), command.before_hook()];
        for hook in before.into_iter().flatten() {
            if let Err(e) = run_hook(hook, ctx.clone()).await {
                debug!(error = %e, "Before-invoke hook rejected invocation");
                return Err(CommandError::check_failure("before_invoke"));
            }
        }

        let result = match command.service() {
            Some(service) => {
                debug!(stage = %Stage::Invoke, "Invoking handler");
                service
                    .clone()
                    .oneshot(ctx.clone())
                    .await
                    .map_err(CommandError::invoke)
            }
            None => Ok(()),
        };

        let after = [command.after_hook(), extension.after.as_ref(), global.after.as_ref()];
        for hook in after.into_iter().flatten() {
            if let Err(e) = run_hook(hook, ctx.clone()).await {
                warn!(error = %e, "After-invoke hook failed");
            }
        }

        result
    }

    fn hooks_for(&self, extension: Option<&Arc<str>>) -> Option<HookSet> {
        self.extension_hooks.read().get(extension?).cloned()
    }

    async fn fail(
        &self,
        ctx: Arc<Context>,
        chain: &[Arc<Command>],
        stage: Stage,
        err: CommandError,
    ) -> Outcome {
        debug!(stage = %stage, error = %err, "Invocation failed");
        self.dispatch_error(ctx, chain, err.clone()).await;
        Outcome::Failed(err)
    }

    /// Routes `err` to the nearest hook: command, enclosing groups,
    /// extension, global. Not-found errors only reach the global hook.
    async fn dispatch_error(&self, ctx: Arc<Context>, chain: &[Arc<Command>], err: CommandError) {
        let from_chain = chain.iter().rev().find_map(|c| c.error_hook().cloned());
        let from_extension = || {
            self.hooks_for(chain.last().and_then(|c| c.extension()))
                .and_then(|h| h.on_error)
        };
        let from_global = || self.global.read().hooks.on_error.clone();

        let target = from_chain.or_else(from_extension).or_else(from_global);
        if let Some(hook) = target {
            run_error_hook(&hook, ctx, err).await;
            return;
        }

        match &err {
            CommandError::NotFound { name } => {
                debug!(name = %name, "Unhandled command error: not found")
            }
            CommandError::OnCooldown { .. }
            | CommandError::CheckFailure { .. }
            | CommandError::MaxConcurrencyReached { .. } => {
                info!(error = %err, "Unhandled command error")
            }
            _ => error!(error = %err, "Unhandled command error"),
        }
    }
}

fn charge_cooldown(command: &Command, message: &Message) -> CommandResult<()> {
    let Some(cooldown) = command.cooldown() else {
        return Ok(());
    };
    match cooldown.update_rate_limit(message, Instant::now()) {
        Some(retry_after) => Err(CommandError::OnCooldown { retry_after }),
        None => Ok(()),
    }
}

async fn acquire_slot(
    command: &Command,
    message: &Message,
) -> CommandResult<Option<ConcurrencyPermit>> {
    match command.max_concurrency() {
        Some(limit) => limit.acquire(message).await.map(Some),
        None => Ok(None),
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
