//! Per-invocation context.

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, LazyLock, Weak};

use indexmap::IndexMap;
use regex::Regex;
use serde_json::json;
use tower::ServiceExt;
use uuid::Uuid;

use ferrum_core::{CacheStore, ClientHandle, Id, Message, RequestResult, User};

use crate::error::{CommandError, CommandResult};
use crate::help::{format_command, help_text};
use crate::pipeline::{Outcome, Pipeline};
use crate::registry::{Command, CommandRegistry};

static MENTION_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^<@!?(\d+)>\s*$").expect("valid regex"));

/// A converted argument value.
pub type ArgValue = Arc<dyn Any + Send + Sync>;

#[derive(Clone)]
enum Slot {
    One(ArgValue),
    Many(Vec<ArgValue>),
}

/// Converted arguments, by parameter name.
#[derive(Clone, Default)]
pub struct Args {
    slots: IndexMap<String, Slot>,
}

impl Args {
    pub(crate) fn insert_one(&mut self, name: &str, value: ArgValue) {
        self.slots.insert(name.to_string(), Slot::One(value));
    }

    pub(crate) fn insert_many(&mut self, name: &str, values: Vec<ArgValue>) {
        self.slots.insert(name.to_string(), Slot::Many(values));
    }

    /// The value of a single parameter, if present and of type `T`.
    pub fn get<T: Any>(&self, name: &str) -> Option<&T> {
        match self.slots.get(name)? {
            Slot::One(value) => value.downcast_ref(),
            Slot::Many(_) => None,
        }
    }

    /// Every value of a variadic parameter.
    pub fn get_all<T: Any>(&self, name: &str) -> Vec<&T> {
        match self.slots.get(name) {
            Some(Slot::Many(values)) => values.iter().filter_map(|v| v.downcast_ref()).collect(),
            Some(Slot::One(value)) => value.downcast_ref().into_iter().collect(),
            None => Vec::new(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl fmt::Debug for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.slots.keys()).finish()
    }
}

/// Everything one invocation needs.
///
/// Created when a message matches the prefix and dropped when the pipeline
/// finishes; never shared between invocations.
pub struct Context {
    id: Uuid,
    handle: ClientHandle,
    message: Arc<Message>,
    registry: Arc<CommandRegistry>,
    pipeline: Weak<Pipeline>,
    owners: Arc<HashSet<Id>>,
    prefix: String,
    invoked_with: String,
    command: Option<Arc<Command>>,
    raw_args: Vec<String>,
    args: Args,
}

impl Context {
    pub fn new(handle: ClientHandle, message: Arc<Message>, registry: Arc<CommandRegistry>) -> Self {
        Self {
            id: Uuid::new_v4(),
            handle,
            message,
            registry,
            pipeline: Weak::new(),
            owners: Arc::default(),
            prefix: String::new(),
            invoked_with: String::new(),
            command: None,
            raw_args: Vec::new(),
            args: Args::default(),
        }
    }

    pub(crate) fn with_owners(mut self, owners: Arc<HashSet<Id>>) -> Self {
        self.owners = owners;
        self
    }

    pub(crate) fn with_pipeline(mut self, pipeline: Weak<Pipeline>) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub(crate) fn with_prefix(mut self, prefix: String, invoked_with: String) -> Self {
        self.prefix = prefix;
        self.invoked_with = invoked_with;
        self
    }

    pub(crate) fn set_command(&mut self, command: Arc<Command>, raw_args: Vec<String>) {
        self.command = Some(command);
        self.raw_args = raw_args;
    }

    pub(crate) fn set_args(&mut self, args: Args) {
        self.args = args;
    }

    /// Unique id of this invocation, for log correlation.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn handle(&self) -> &ClientHandle {
        &self.handle
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        self.handle.cache()
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    /// The triggering message.
    pub fn message(&self) -> &Arc<Message> {
        &self.message
    }

    pub fn author(&self) -> &User {
        &self.message.author
    }

    pub fn channel_id(&self) -> Id {
        self.message.channel_id
    }

    pub fn guild_id(&self) -> Option<Id> {
        self.message.guild_id
    }

    pub fn is_private(&self) -> bool {
        self.message.is_private()
    }

    /// Whether `user` is one of the configured owners.
    pub fn is_owner(&self, user: Id) -> bool {
        self.owners.contains(&user)
    }

    /// The prefix as typed.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The prefix with a bot mention rendered as `@name `.
    pub fn clean_prefix(&self) -> String {
        let Some(caps) = MENTION_PREFIX.captures(&self.prefix) else {
            return self.prefix.clone();
        };
        let name = caps[1]
            .parse::<Id>()
            .ok()
            .and_then(|id| self.cache().user(id).or_else(|| self.cache().current_user().filter(|u| u.id == id)))
            .map(|u| u.display_name().to_string())
            .unwrap_or_else(|| caps[1].to_string());
        format!("@{name} ")
    }

    /// The name or alias the command was invoked with.
    pub fn invoked_with(&self) -> &str {
        &self.invoked_with
    }

    /// The resolved command. `None` only for not-found errors.
    pub fn command(&self) -> Option<&Arc<Command>> {
        self.command.as_ref()
    }

    /// Argument tokens left after the command path.
    pub fn raw_args(&self) -> &[String] {
        &self.raw_args
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    /// Posts `content` to the channel the command came from.
    pub async fn send(&self, content: &str) -> RequestResult<Message> {
        self.handle.send_message(self.channel_id(), content).await
    }

    /// Posts `content` as a reply to the triggering message.
    pub async fn reply(&self, content: &str) -> RequestResult<Message> {
        self.handle
            .create_message(
                self.channel_id(),
                json!({
                    "content": content,
                    "message_reference": {
                        "message_id": self.message.id,
                        "channel_id": self.message.channel_id,
                    },
                }),
            )
            .await
    }

    /// Shows the typing indicator in the invoking channel.
    pub async fn typing(&self) -> RequestResult<()> {
        self.handle.trigger_typing(self.channel_id()).await
    }

    /// Sends help for `query`, or for the current command when `None`. With
    /// neither, sends the command overview.
    pub async fn send_help(&self, query: Option<&str>) -> RequestResult<Message> {
        let prefix = self.clean_prefix();
        let text = match (query, &self.command) {
            (None, Some(command)) => format_command(command, &prefix),
            (query, _) => help_text(&self.registry, query, &prefix),
        };
        self.send(&text).await
    }

    /// Calls the handler of `command` (the current command when `None`)
    /// with this context. Checks, cooldowns and hooks do not run.
    pub async fn invoke(self: &Arc<Self>, command: Option<&Arc<Command>>) -> CommandResult<()> {
        let Some(target) = command.or(self.command.as_ref()) else {
            return Err(CommandError::NotFound {
                name: self.invoked_with.clone(),
            });
        };
        let Some(service) = target.service() else {
            return Err(CommandError::NotFound {
                name: target.qualified_name().to_string(),
            });
        };
        service
            .clone()
            .oneshot(Arc::clone(self))
            .await
            .map_err(CommandError::invoke)
    }

    /// Runs the triggering message through the whole pipeline again.
    ///
    /// Failures have already been routed to the error hooks when this
    /// returns them.
    pub async fn reinvoke(&self) -> CommandResult<()> {
        let Some(pipeline) = self.pipeline.upgrade() else {
            return Err(CommandError::invoke("the invocation pipeline is gone".into()));
        };
        match Box::pin(pipeline.process(Arc::clone(&self.message))).await {
            Outcome::Completed { .. } => Ok(()),
            Outcome::Failed(err) => Err(err),
            Outcome::Ignored => Err(CommandError::NotFound {
                name: self.invoked_with.clone(),
            }),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("message", &self.message.id)
            .field("prefix", &self.prefix)
            .field("command", &self.command.as_ref().map(|c| c.qualified_name()))
            .field("args", &self.args)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ferrum_core::Method;
    use serde_json::Value;

    use crate::pipeline::PipelineConfig;
    use crate::testing::{fixture, message};

    async fn noop(_ctx: Arc<Context>) {}

    #[test]
    fn test_args_lookup_by_type() {
        let mut args = Args::default();
        args.insert_one("count", Arc::new(5i64));
        args.insert_many("words", vec![Arc::new("a".to_string()), Arc::new("b".to_string())]);

        assert_eq!(args.get::<i64>("count"), Some(&5));
        assert_eq!(args.get::<String>("count"), None);
        assert_eq!(args.get_all::<String>("words"), vec!["a", "b"]);
        assert!(args.get::<String>("words").is_none());
        assert_eq!(args.len(), 2);
    }

    #[tokio::test]
    async fn test_reply_references_message() {
        let fx = fixture();
        let ctx = Context::new(fx.handle.clone(), Arc::new(message("hi")), fx.registry.clone());
        ctx.reply("pong").await.unwrap();

        let call = &fx.executor.calls()[0];
        let body = call.body.as_ref().unwrap();
        assert_eq!(body["content"], "pong");
        assert_eq!(body["message_reference"]["message_id"], ctx.message().id.to_string());
    }

    #[tokio::test]
    async fn test_typing_posts_to_channel() {
        let fx = fixture();
        fx.executor.respond(Method::Post, "/channels/7/typing", Ok(Value::Null));
        let ctx = fx.context(message("hi"));
        ctx.typing().await.unwrap();
        assert_eq!(fx.executor.calls()[0].path(), "/channels/7/typing");
    }

    #[tokio::test]
    async fn test_send_help() {
        let fx = fixture();
        fx.registry
            .add_command(Command::build("ping").brief("Checks latency").handler(noop))
            .unwrap();
        let mut ctx = fx.context(message("!x")).with_prefix("!".into(), "x".into());

        ctx.send_help(None).await.unwrap();
        ctx.send_help(Some("nope")).await.unwrap();
        ctx.set_command(fx.registry.get_command("ping").unwrap(), Vec::new());
        ctx.send_help(None).await.unwrap();

        assert_eq!(
            fx.executor.sent_messages(),
            [
                "Commands:\n!ping - Checks latency",
                "Command not found: nope",
                "Usage: !ping",
            ]
        );
    }

    #[tokio::test]
    async fn test_invoke_skips_pipeline() {
        let fx = fixture();
        let greet = fx
            .registry
            .add_command(
                Command::build("greet")
                    .check(crate::checks::guild_only())
                    .handler(|_ctx: Arc<Context>| async { "hi" }),
            )
            .unwrap();
        let group = fx
            .registry
            .add_command(Command::build("admin").subcommand(Command::build("kick").handler(noop)))
            .unwrap();
        let ctx = Arc::new(fx.context(message("!other")).with_prefix("!".into(), "other".into()));

        // A direct message would fail guild_only; invoke does not check.
        ctx.invoke(Some(&greet)).await.unwrap();
        assert_eq!(fx.executor.sent_messages(), ["hi"]);

        assert!(matches!(
            ctx.invoke(None).await,
            Err(CommandError::NotFound { name }) if name == "other"
        ));
        assert!(matches!(
            ctx.invoke(Some(&group)).await,
            Err(CommandError::NotFound { name }) if name == "admin"
        ));
    }

    #[tokio::test]
    async fn test_reinvoke_runs_pipeline_again() {
        let fx = fixture();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        fx.registry
            .add_command(Command::build("again").handler(move |ctx: Arc<Context>| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        ctx.reinvoke().await?;
                    }
                    Ok::<(), CommandError>(())
                }
            }))
            .unwrap();
        let pipeline = fx.pipeline(PipelineConfig {
            help: false,
            ..Default::default()
        });

        let outcome = pipeline.process(Arc::new(message("!again"))).await;
        assert!(matches!(outcome, Outcome::Completed { .. }));
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        let detached = fx.context(message("!again"));
        assert!(matches!(detached.reinvoke().await, Err(CommandError::InvokeError(_))));
    }

    #[test]
    fn test_clean_prefix_renders_mention() {
        let fx = fixture();
        let ctx = Context::new(fx.handle.clone(), Arc::new(message("hi")), fx.registry.clone())
            .with_prefix("<@1000000000001> ".into(), "ping".into());
        assert_eq!(ctx.clean_prefix(), "@1000000000001 ");

        let ctx = ctx.with_prefix("!".into(), "ping".into());
        assert_eq!(ctx.clean_prefix(), "!");
    }
}
