//! The command tree.
//!
//! Commands are declared with [`Command::build`] and placed into a
//! [`CommandRegistry`]. Once registered a [`Command`] is immutable; adding a
//! subcommand later replaces the parent node (copy-on-write), so contexts
//! holding the old node are unaffected.
//!
//! Names are matched exactly unless the registry is case-insensitive. A
//! qualified name joins the path with single spaces (`"admin prune"`).

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::RwLock;
use tokio::time::Instant;
use tower::util::BoxCloneSyncService;
use tower::{BoxError, Service};
use tower_layer::Layer;
use tracing::debug;

use ferrum_core::Message;

use crate::checks::Check;
use crate::concurrency::MaxConcurrency;
use crate::context::Context;
use crate::convert::{Param, validate_params};
use crate::cooldown::{BucketScope, Cooldown, CooldownMapping};
use crate::error::{CommandError, RegistrationError};
use crate::handler::{
    CatchPanicLayer, CommandService, ErrorHook, Hook, IntoReply, error_hook, handler_fn, hook,
};

// =============================================================================
// Options
// =============================================================================

/// Cooldown applied to commands that declare none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownPolicy {
    pub rate: u32,
    pub per: Duration,
    pub scope: BucketScope,
}

/// Concurrency limit applied to commands that declare none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyPolicy {
    pub limit: usize,
    pub scope: BucketScope,
    pub wait: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RegistryOptions {
    /// Fold command names and aliases to lowercase.
    pub case_insensitive: bool,
    pub default_cooldown: Option<CooldownPolicy>,
    pub default_concurrency: Option<ConcurrencyPolicy>,
}

// =============================================================================
// Command
// =============================================================================

/// A registered command node: a leaf, or a group with children.
#[derive(Clone)]
pub struct Command {
    name: String,
    qualified_name: String,
    aliases: Vec<String>,
    help: Option<String>,
    brief: Option<String>,
    usage: Option<String>,
    hidden: bool,
    params: Vec<Param>,
    checks: Vec<Check>,
    cooldown: Option<Arc<CooldownMapping>>,
    concurrency: Option<Arc<MaxConcurrency>>,
    before: Option<Hook>,
    after: Option<Hook>,
    on_error: Option<ErrorHook>,
    service: Option<CommandService>,
    children: CommandMap,
    extension: Option<Arc<str>>,
}

impl Command {
    /// Starts declaring a command.
    pub fn build(name: impl Into<String>) -> CommandBuilder {
        CommandBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Space-joined path from the root, e.g. `"admin prune"`.
    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    pub fn help(&self) -> Option<&str> {
        self.help.as_deref()
    }

    pub fn usage(&self) -> Option<&str> {
        self.usage.as_deref()
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn checks(&self) -> &[Check] {
        &self.checks
    }

    /// The extension that registered this command, if any.
    pub fn extension(&self) -> Option<&Arc<str>> {
        self.extension.as_ref()
    }

    /// `true` when the node has children.
    pub fn is_group(&self) -> bool {
        !self.children.is_empty()
    }

    /// `true` when the node has a handler of its own.
    pub fn is_invocable(&self) -> bool {
        self.service.is_some()
    }

    /// Children in registration order.
    pub fn subcommands(&self) -> Vec<Arc<Command>> {
        self.children.commands.values().cloned().collect()
    }

    pub fn subcommand(&self, name: &str) -> Option<Arc<Command>> {
        self.children.get(name).cloned()
    }

    /// Parameter usage line, e.g. `<count> [reason...]`.
    pub fn signature(&self) -> String {
        self.params
            .iter()
            .map(Param::signature)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// The brief, or the first line of the help text.
    pub fn short_doc(&self) -> &str {
        self.brief
            .as_deref()
            .or_else(|| self.help.as_deref().and_then(|h| h.lines().next()))
            .unwrap_or_default()
    }

    pub fn cooldown(&self) -> Option<&Arc<CooldownMapping>> {
        self.cooldown.as_ref()
    }

    pub fn max_concurrency(&self) -> Option<&Arc<MaxConcurrency>> {
        self.concurrency.as_ref()
    }

    /// Restores the message's cooldown bucket to full.
    pub fn reset_cooldown(&self, message: &Message) {
        if let Some(cooldown) = &self.cooldown {
            cooldown.reset(message);
        }
    }

    /// Remaining wait before the message's bucket allows another use.
    pub fn cooldown_retry_after(&self, message: &Message) -> Option<Duration> {
        self.cooldown
            .as_ref()
            .and_then(|c| c.retry_after(message, Instant::now()))
    }

    pub fn is_on_cooldown(&self, message: &Message) -> bool {
        self.cooldown_retry_after(message).is_some()
    }

    pub(crate) fn service(&self) -> Option<&CommandService> {
        self.service.as_ref()
    }

    pub(crate) fn before_hook(&self) -> Option<&Hook> {
        self.before.as_ref()
    }

    pub(crate) fn after_hook(&self) -> Option<&Hook> {
        self.after.as_ref()
    }

    pub(crate) fn error_hook(&self) -> Option<&ErrorHook> {
        self.on_error.as_ref()
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("qualified_name", &self.qualified_name)
            .field("aliases", &self.aliases)
            .field("params", &self.params)
            .field("checks", &self.checks)
            .field("children", &self.children.commands.keys().collect::<Vec<_>>())
            .field("extension", &self.extension)
            .finish()
    }
}

// =============================================================================
// CommandBuilder
// =============================================================================

/// Declares a command. Finished by [`CommandRegistry::add_command`].
pub struct CommandBuilder {
    name: String,
    aliases: Vec<String>,
    help: Option<String>,
    brief: Option<String>,
    usage: Option<String>,
    hidden: bool,
    params: Vec<Param>,
    checks: Vec<Check>,
    cooldown: Option<(Cooldown, BucketScope)>,
    concurrency: Option<ConcurrencyPolicy>,
    before: Option<Hook>,
    after: Option<Hook>,
    on_error: Option<ErrorHook>,
    service: Option<CommandService>,
    layers: Vec<ApplyLayer>,
    subcommands: Vec<CommandBuilder>,
}

type ApplyLayer = Box<dyn FnOnce(CommandService) -> CommandService + Send>;

impl CommandBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            help: None,
            brief: None,
            usage: None,
            hidden: false,
            params: Vec::new(),
            checks: Vec::new(),
            cooldown: None,
            concurrency: None,
            before: None,
            after: None,
            on_error: None,
            service: None,
            layers: Vec::new(),
            subcommands: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// One-line summary for command listings.
    pub fn brief(mut self, brief: impl Into<String>) -> Self {
        self.brief = Some(brief.into());
        self
    }

    /// Replaces the generated signature in help output.
    pub fn usage(mut self, usage: impl Into<String>) -> Self {
        self.usage = Some(usage.into());
        self
    }

    pub fn hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }

    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    pub fn check(mut self, check: Check) -> Self {
        self.checks.push(check);
        self
    }

    /// Allows `rate` uses per `per` in each `scope` bucket.
    pub fn cooldown(mut self, rate: u32, per: Duration, scope: BucketScope) -> Self {
        self.cooldown = Some((Cooldown::new(rate, per), scope));
        self
    }

    /// Caps in-flight invocations per `scope` bucket. With `wait`, callers
    /// queue for a slot instead of failing.
    pub fn max_concurrency(mut self, limit: usize, scope: BucketScope, wait: bool) -> Self {
        self.concurrency = Some(ConcurrencyPolicy { limit, scope, wait });
        self
    }

    pub fn before_invoke<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Context>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.before = Some(hook(f));
        self
    }

    pub fn after_invoke<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Context>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.after = Some(hook(f));
        self
    }

    /// Handles this command's failures. On a group, also handles failures
    /// of its subcommands that have no hook of their own.
    pub fn on_error<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Context>, CommandError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_error = Some(error_hook(f));
        self
    }

    pub fn handler<F, Fut, R>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Context>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoReply + 'static,
    {
        self.service = Some(handler_fn(f));
        self
    }

    /// Uses an arbitrary tower service as the handler.
    pub fn service<S>(mut self, svc: S) -> Self
    where
        S: Service<Arc<Context>, Response = (), Error = BoxError> + Clone + Send + Sync + 'static,
        S::Future: Send + 'static,
    {
        self.service = Some(BoxCloneSyncService::new(CatchPanicLayer.layer(svc)));
        self
    }

    /// Wraps the handler in a tower layer. Layers added later sit further
    /// out.
    pub fn layer<L>(mut self, layer: L) -> Self
    where
        L: Layer<CommandService> + Send + 'static,
        L::Service: Service<Arc<Context>, Response = (), Error = BoxError>
            + Clone
            + Send
            + Sync
            + 'static,
        <L::Service as Service<Arc<Context>>>::Future: Send + 'static,
    {
        self.layers
            .push(Box::new(move |svc| BoxCloneSyncService::new(layer.layer(svc))));
        self
    }

    pub fn subcommand(mut self, sub: CommandBuilder) -> Self {
        self.subcommands.push(sub);
        self
    }

    pub(crate) fn finish(
        self,
        parent: Option<&str>,
        extension: Option<Arc<str>>,
        options: &RegistryOptions,
    ) -> Result<Command, RegistrationError> {
        let qualified_name = match parent {
            Some(parent) => format!("{parent} {}", self.name),
            None => self.name.clone(),
        };
        let invalid = |reason: &str| RegistrationError::InvalidSignature {
            command: qualified_name.clone(),
            reason: reason.to_string(),
        };

        if self.name.is_empty() || self.name.contains(char::is_whitespace) {
            return Err(invalid("names must be non-empty and contain no whitespace"));
        }
        if self.service.is_none() && self.subcommands.is_empty() {
            return Err(invalid("a command without subcommands needs a handler"));
        }
        validate_params(&qualified_name, &self.params)?;

        let mut children = CommandMap::new(options.case_insensitive);
        for sub in self.subcommands {
            let child = sub.finish(Some(&qualified_name), extension.clone(), options)?;
            children.insert(Arc::new(child))?;
        }

        let layers = self.layers;
        let service = self
            .service
            .map(|svc| layers.into_iter().fold(svc, |svc, apply| apply(svc)));
        let invocable = service.is_some();
        let cooldown = self
            .cooldown
            .or_else(|| {
                options
                    .default_cooldown
                    .filter(|_| invocable)
                    .map(|p| (Cooldown::new(p.rate, p.per), p.scope))
            })
            .map(|(cooldown, scope)| Arc::new(CooldownMapping::new(cooldown, scope)));
        let concurrency = self
            .concurrency
            .or(options.default_concurrency.filter(|_| invocable))
            .map(|p| Arc::new(MaxConcurrency::new(p.limit, p.scope, p.wait)));

        Ok(Command {
            name: self.name,
            qualified_name,
            aliases: self.aliases,
            help: self.help,
            brief: self.brief,
            usage: self.usage,
            hidden: self.hidden,
            params: self.params,
            checks: self.checks,
            cooldown,
            concurrency,
            before: self.before,
            after: self.after,
            on_error: self.on_error,
            service,
            children,
            extension,
        })
    }
}

// =============================================================================
// CommandMap
// =============================================================================

/// One level of the tree: names and aliases to nodes.
#[derive(Clone, Default)]
struct CommandMap {
    commands: IndexMap<String, Arc<Command>>,
    lookup: HashMap<String, String>,
    case_insensitive: bool,
}

impl CommandMap {
    fn new(case_insensitive: bool) -> Self {
        Self {
            case_insensitive,
            ..Default::default()
        }
    }

    fn key(&self, token: &str) -> String {
        if self.case_insensitive {
            token.to_lowercase()
        } else {
            token.to_string()
        }
    }

    fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    fn get(&self, token: &str) -> Option<&Arc<Command>> {
        let name = self.lookup.get(&self.key(token))?;
        self.commands.get(name)
    }

    fn get_mut(&mut self, token: &str) -> Option<&mut Arc<Command>> {
        let name = self.lookup.get(&self.key(token))?;
        self.commands.get_mut(name)
    }

    fn insert(&mut self, command: Arc<Command>) -> Result<(), RegistrationError> {
        let keys: Vec<String> = std::iter::once(&command.name)
            .chain(&command.aliases)
            .map(|n| self.key(n))
            .collect();
        for (i, key) in keys.iter().enumerate() {
            if self.lookup.contains_key(key) || keys[..i].contains(key) {
                return Err(RegistrationError::duplicate(key.clone()));
            }
        }
        for key in keys {
            self.lookup.insert(key, command.name.clone());
        }
        self.commands.insert(command.name.clone(), command);
        Ok(())
    }

    fn remove(&mut self, token: &str) -> Option<Arc<Command>> {
        let name = self.lookup.get(&self.key(token))?.clone();
        self.lookup.retain(|_, target| *target != name);
        self.commands.shift_remove(&name)
    }

    /// Walks `path` down the tree, unsharing every node on the way.
    fn descend_mut(&mut self, path: &[&str]) -> Option<&mut Command> {
        let (first, rest) = path.split_first()?;
        let node = Arc::make_mut(self.get_mut(first)?);
        if rest.is_empty() {
            Some(node)
        } else {
            node.children.descend_mut(rest)
        }
    }

    fn owned_by(&self, extension: &str) -> bool {
        self.commands.values().any(|c| {
            c.extension.as_deref() == Some(extension) || c.children.owned_by(extension)
        })
    }

    fn remove_owned(&mut self, extension: &str) -> usize {
        let doomed: Vec<String> = self
            .commands
            .values()
            .filter(|c| c.extension.as_deref() == Some(extension))
            .map(|c| c.name.clone())
            .collect();
        let mut removed = doomed.len();
        for name in doomed {
            self.remove(&name);
        }
        for command in self.commands.values_mut() {
            if command.children.owned_by(extension) {
                removed += Arc::make_mut(command).children.remove_owned(extension);
            }
        }
        removed
    }

    fn walk(&self, out: &mut Vec<Arc<Command>>) {
        for command in self.commands.values() {
            out.push(command.clone());
            command.children.walk(out);
        }
    }
}

// =============================================================================
// CommandRegistry
// =============================================================================

/// Outcome of [`CommandRegistry::resolve`].
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Root to matched node.
    pub chain: Vec<Arc<Command>>,
    /// Tokens that named the path.
    pub consumed: usize,
}

impl Resolution {
    /// The matched node.
    pub fn command(&self) -> &Arc<Command> {
        // `chain` always holds at least the root match.
        &self.chain[self.chain.len() - 1]
    }

    /// The tokens left over as arguments.
    pub fn remaining<'a, T>(&self, tokens: &'a [T]) -> &'a [T] {
        &tokens[self.consumed.min(tokens.len())..]
    }
}

pub struct CommandRegistry {
    options: RegistryOptions,
    root: RwLock<CommandMap>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new(RegistryOptions::default())
    }
}

impl CommandRegistry {
    pub fn new(options: RegistryOptions) -> Self {
        Self {
            root: RwLock::new(CommandMap::new(options.case_insensitive)),
            options,
        }
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    /// Registers a top-level command and its subcommands.
    pub fn add_command(&self, builder: CommandBuilder) -> Result<Arc<Command>, RegistrationError> {
        self.add(None, builder, None)
    }

    /// Registers `builder` under the group at `parent` (a qualified name).
    pub fn add_subcommand(
        &self,
        parent: &str,
        builder: CommandBuilder,
    ) -> Result<Arc<Command>, RegistrationError> {
        self.add(Some(parent), builder, None)
    }

    pub(crate) fn add(
        &self,
        parent: Option<&str>,
        builder: CommandBuilder,
        extension: Option<Arc<str>>,
    ) -> Result<Arc<Command>, RegistrationError> {
        let mut root = self.root.write();
        let command = match parent {
            None => {
                let command = Arc::new(builder.finish(None, extension, &self.options)?);
                root.insert(command.clone())?;
                command
            }
            Some(parent) => {
                let path: Vec<&str> = parent.split_whitespace().collect();
                let unknown = || RegistrationError::UnknownParent {
                    parent: parent.to_string(),
                };
                // Look up first so a failed insert leaves the tree unshared.
                let mut target = root.get(path.first().ok_or_else(unknown)?).ok_or_else(unknown)?;
                for segment in &path[1..] {
                    target = target.children.get(segment).ok_or_else(unknown)?;
                }
                let command = Arc::new(builder.finish(
                    Some(&target.qualified_name),
                    extension,
                    &self.options,
                )?);
                if target
                    .children
                    .get(&command.name)
                    .is_some()
                    || command.aliases.iter().any(|a| target.children.get(a).is_some())
                {
                    return Err(RegistrationError::duplicate(command.name.clone()));
                }
                let node = root.descend_mut(&path).ok_or_else(unknown)?;
                node.children.insert(command.clone())?;
                command
            }
        };
        debug!(command = %command.qualified_name, "Registered command");
        Ok(command)
    }

    /// Removes the command at `qualified` with its subtree.
    pub fn remove_command(&self, qualified: &str) -> Option<Arc<Command>> {
        let path: Vec<&str> = qualified.split_whitespace().collect();
        let (last, parents) = path.split_last()?;
        let mut root = self.root.write();
        let removed = if parents.is_empty() {
            root.remove(last)
        } else {
            root.descend_mut(parents)?.children.remove(last)
        };
        if let Some(command) = &removed {
            debug!(command = %command.qualified_name, "Removed command");
        }
        removed
    }

    /// Looks up a command by qualified name (names or aliases per level).
    pub fn get_command(&self, qualified: &str) -> Option<Arc<Command>> {
        let mut segments = qualified.split_whitespace();
        let root = self.root.read();
        let mut command = root.get(segments.next()?)?.clone();
        for segment in segments {
            command = command.children.get(segment)?.clone();
        }
        Some(command)
    }

    /// Walks the tree by `tokens`, descending while the next token names a
    /// child of the current node.
    pub fn resolve<T: AsRef<str>>(&self, tokens: &[T]) -> Option<Resolution> {
        let root = self.root.read();
        let mut command = root.get(tokens.first()?.as_ref())?.clone();
        let mut chain = vec![command.clone()];
        while let Some(token) = tokens.get(chain.len()) {
            let Some(child) = command.children.get(token.as_ref()).cloned() else {
                break;
            };
            chain.push(child.clone());
            command = child;
        }
        Some(Resolution {
            consumed: chain.len(),
            chain,
        })
    }

    /// Top-level commands in registration order.
    pub fn commands(&self) -> Vec<Arc<Command>> {
        self.root.read().commands.values().cloned().collect()
    }

    /// Every command, depth-first.
    pub fn walk(&self) -> Vec<Arc<Command>> {
        let mut out = Vec::new();
        self.root.read().walk(&mut out);
        out
    }

    /// Removes every command registered by `extension`.
    pub(crate) fn remove_extension(&self, extension: &str) -> usize {
        self.root.write().remove_owned(extension)
    }

    /// Number of top-level commands.
    pub fn len(&self) -> usize {
        self.root.read().commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.read().is_empty()
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("options", &self.options)
            .field("commands", &self.root.read().commands.keys().collect::<Vec<_>>())
            .finish()
    }
}
