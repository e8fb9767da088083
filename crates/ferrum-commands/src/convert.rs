//! Typed argument conversion.
//!
//! A command declares its [`Param`]s; each param carries a [`Converter`]
//! that turns one raw token into a typed value. Built-in conversions live on
//! [`FromArgument`]: the numeric primitives, `bool`, `String`, [`Id`] and the
//! entity records, which are resolved against the cache first and the remote
//! API second.
//!
//! # Example
//!
//! ```rust,ignore
//! Command::build("prune")
//!     .param(Param::required::<i64>("count"))
//!     .param(Param::greedy::<String>("reason").not_required())
//! ```

use std::fmt::{self, Display};
use std::marker::PhantomData;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;

use ferrum_core::{BoxError, Channel, Guild, Id, Member, Message, Role, User};

use crate::context::{ArgValue, Args, Context};
use crate::error::{CommandError, CommandResult, ConversionError, RegistrationError};
use crate::tokenize::Token;

static USER_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^<@!?(\d+)>$").expect("valid regex"));
static CHANNEL_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^<#(\d+)>$").expect("valid regex"));
static ROLE_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^<@&(\d+)>$").expect("valid regex"));
static ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{10,}").expect("valid regex"));

// =============================================================================
// FromArgument
// =============================================================================

/// Types that can be built from one argument token.
#[async_trait]
pub trait FromArgument: Sized + Send + Sync + 'static {
    async fn from_argument(ctx: &Context, argument: &str) -> Result<Self, BoxError>;
}

macro_rules! parse_from_argument {
    ($($ty:ty => $kind:literal),* $(,)?) => {
        $(
            #[async_trait]
            impl FromArgument for $ty {
                async fn from_argument(_ctx: &Context, argument: &str) -> Result<Self, BoxError> {
                    argument.parse::<$ty>().map_err(|e| {
                        ConversionError::Malformed {
                            kind: $kind,
                            argument: argument.to_string(),
                            reason: e.to_string(),
                        }
                        .into()
                    })
                }
            }
        )*
    };
}

parse_from_argument! {
    i64 => "integer",
    i32 => "integer",
    u64 => "integer",
    u32 => "integer",
    usize => "integer",
    f64 => "number",
    f32 => "number",
}

#[async_trait]
impl FromArgument for String {
    async fn from_argument(_ctx: &Context, argument: &str) -> Result<Self, BoxError> {
        Ok(argument.to_string())
    }
}

#[async_trait]
impl FromArgument for bool {
    async fn from_argument(_ctx: &Context, argument: &str) -> Result<Self, BoxError> {
        match argument.to_lowercase().as_str() {
            "true" | "yes" | "y" | "on" | "1" | "enable" => Ok(true),
            "false" | "no" | "n" | "off" | "0" | "disable" => Ok(false),
            _ => Err(ConversionError::NotBoolean(argument.to_string()).into()),
        }
    }
}

/// Accepts a bare id or any mention form.
#[async_trait]
impl FromArgument for Id {
    async fn from_argument(_ctx: &Context, argument: &str) -> Result<Self, BoxError> {
        mentioned_id(argument, &[&USER_MENTION, &CHANNEL_MENTION, &ROLE_MENTION])
            .or_else(|| argument.parse().ok())
            .ok_or_else(|| {
                ConversionError::Malformed {
                    kind: "id",
                    argument: argument.to_string(),
                    reason: "expected digits or a mention".into(),
                }
                .into()
            })
    }
}

/// Id from a mention, or from a token that is nothing but a long id.
fn mentioned_id(argument: &str, patterns: &[&Regex]) -> Option<Id> {
    for pattern in patterns {
        if let Some(caps) = pattern.captures(argument) {
            return caps[1].parse().ok();
        }
    }
    ID.find(argument)
        .filter(|m| m.as_str() == argument)
        .and_then(|m| m.as_str().parse().ok())
}

fn require_guild(ctx: &Context, kind: &'static str) -> Result<Id, BoxError> {
    ctx.guild_id()
        .ok_or_else(|| ConversionError::GuildOnly { kind }.into())
}

#[async_trait]
impl FromArgument for User {
    async fn from_argument(ctx: &Context, argument: &str) -> Result<Self, BoxError> {
        if let Some(id) = mentioned_id(argument, &[&USER_MENTION]) {
            if let Some(user) = ctx.message().mentions.iter().find(|u| u.id == id) {
                return Ok(user.clone());
            }
            if let Some(user) = ctx.cache().user(id) {
                return Ok((*user).clone());
            }
            return ctx.handle().fetch_user(id).await.map_err(|e| {
                if e.is_not_found() {
                    ConversionError::not_found("user", argument).into()
                } else {
                    e.into()
                }
            });
        }

        let name = argument.strip_prefix('@').unwrap_or(argument);
        ctx.message()
            .mentions
            .iter()
            .find(|u| u.username == name || u.global_name.as_deref() == Some(name))
            .cloned()
            .or_else(|| ctx.cache().find_user(name).map(|u| (*u).clone()))
            .ok_or_else(|| ConversionError::not_found("user", argument).into())
    }
}

#[async_trait]
impl FromArgument for Member {
    async fn from_argument(ctx: &Context, argument: &str) -> Result<Self, BoxError> {
        let guild_id = require_guild(ctx, "member")?;
        if let Some(id) = mentioned_id(argument, &[&USER_MENTION]) {
            if let Some(member) = ctx.cache().member(guild_id, id) {
                return Ok((*member).clone());
            }
            return ctx.handle().fetch_member(guild_id, id).await.map_err(|e| {
                if e.is_not_found() {
                    ConversionError::not_found("member", argument).into()
                } else {
                    e.into()
                }
            });
        }

        let name = argument.strip_prefix('@').unwrap_or(argument);
        ctx.cache()
            .find_member(guild_id, name)
            .map(|m| (*m).clone())
            .ok_or_else(|| ConversionError::not_found("member", argument).into())
    }
}

#[async_trait]
impl FromArgument for Channel {
    async fn from_argument(ctx: &Context, argument: &str) -> Result<Self, BoxError> {
        if let Some(id) = mentioned_id(argument, &[&CHANNEL_MENTION]) {
            if let Some(channel) = ctx.cache().channel(id) {
                return Ok((*channel).clone());
            }
            return ctx.handle().fetch_channel(id).await.map_err(|e| {
                if e.is_not_found() {
                    ConversionError::not_found("channel", argument).into()
                } else {
                    e.into()
                }
            });
        }

        let name = argument.strip_prefix('#').unwrap_or(argument);
        ctx.cache()
            .find_channel(ctx.guild_id(), name)
            .map(|c| (*c).clone())
            .ok_or_else(|| ConversionError::not_found("channel", argument).into())
    }
}

#[async_trait]
impl FromArgument for Guild {
    async fn from_argument(ctx: &Context, argument: &str) -> Result<Self, BoxError> {
        let id = mentioned_id(argument, &[])
            .ok_or_else(|| ConversionError::not_found("guild", argument))?;
        if let Some(guild) = ctx.cache().guild(id) {
            return Ok((*guild).clone());
        }
        ctx.handle().fetch_guild(id).await.map_err(|e| {
            if e.is_not_found() {
                ConversionError::not_found("guild", argument).into()
            } else {
                e.into()
            }
        })
    }
}

#[async_trait]
impl FromArgument for Role {
    async fn from_argument(ctx: &Context, argument: &str) -> Result<Self, BoxError> {
        let guild_id = require_guild(ctx, "role")?;
        let by_id = mentioned_id(argument, &[&ROLE_MENTION]);

        let cached = match by_id {
            Some(id) => ctx.cache().role(id),
            None => ctx.cache().find_role(Some(guild_id), argument),
        };
        if let Some(role) = cached {
            return Ok((*role).clone());
        }

        let wanted = argument.to_lowercase();
        ctx.handle()
            .fetch_roles(guild_id)
            .await?
            .into_iter()
            .find(|r| match by_id {
                Some(id) => r.id == id,
                None => r.name.to_lowercase() == wanted,
            })
            .ok_or_else(|| ConversionError::not_found("role", argument).into())
    }
}

/// Accepts `message_id`, `channel_id-message_id`, or a message link.
#[async_trait]
impl FromArgument for Message {
    async fn from_argument(ctx: &Context, argument: &str) -> Result<Self, BoxError> {
        let ids: Vec<Id> = ID
            .find_iter(argument)
            .filter_map(|m| m.as_str().parse().ok())
            .collect();
        let (channel_id, message_id) = match ids.as_slice() {
            [] => return Err(ConversionError::not_found("message", argument).into()),
            [message] => (ctx.channel_id(), *message),
            [.., channel, message] => (*channel, *message),
        };

        if let Some(message) = ctx.cache().message(message_id) {
            return Ok((*message).clone());
        }
        ctx.handle()
            .fetch_message(channel_id, message_id)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    ConversionError::not_found("message", argument).into()
                } else {
                    e.into()
                }
            })
    }
}

// =============================================================================
// Converters
// =============================================================================

/// Object-safe conversion used by [`Param`].
#[async_trait]
pub trait Converter: Send + Sync + 'static {
    async fn convert(&self, ctx: &Context, argument: &str) -> Result<ArgValue, BoxError>;
}

/// Converter backed by a [`FromArgument`] impl.
pub struct Typed<T>(PhantomData<fn() -> T>);

impl<T> Default for Typed<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

#[async_trait]
impl<T: FromArgument> Converter for Typed<T> {
    async fn convert(&self, ctx: &Context, argument: &str) -> Result<ArgValue, BoxError> {
        let value: ArgValue = Arc::new(T::from_argument(ctx, argument).await?);
        Ok(value)
    }
}

/// Converter backed by a synchronous closure.
pub struct FnConverter<F, T> {
    f: F,
    _marker: PhantomData<fn() -> T>,
}

impl<F, T> FnConverter<F, T>
where
    F: Fn(&str) -> Result<T, BoxError> + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, T> Converter for FnConverter<F, T>
where
    F: Fn(&str) -> Result<T, BoxError> + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    async fn convert(&self, _ctx: &Context, argument: &str) -> Result<ArgValue, BoxError> {
        let value: ArgValue = Arc::new((self.f)(argument)?);
        Ok(value)
    }
}

// =============================================================================
// Parameters
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// One token.
    Single,
    /// The raw remainder of the input as one value.
    Rest,
    /// Every remaining token, each converted.
    Variadic,
}

/// One declared parameter of a command.
#[derive(Clone)]
pub struct Param {
    name: String,
    kind: ParamKind,
    required: bool,
    converter: Arc<dyn Converter>,
    default: Option<(ArgValue, String)>,
}

impl Param {
    /// A required single-token parameter with a custom converter.
    pub fn new(name: impl Into<String>, converter: impl Converter) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::Single,
            required: true,
            converter: Arc::new(converter),
            default: None,
        }
    }

    pub fn required<T: FromArgument>(name: impl Into<String>) -> Self {
        Self::new(name, Typed::<T>::default())
    }

    /// Absent from [`Args`] when no token is left.
    pub fn optional<T: FromArgument>(name: impl Into<String>) -> Self {
        Self::required::<T>(name).not_required()
    }

    /// Filled with `value` when no token is left.
    pub fn with_default<T: FromArgument + Display>(name: impl Into<String>, value: T) -> Self {
        let shown = value.to_string();
        let mut param = Self::optional::<T>(name);
        param.default = Some((Arc::new(value), shown));
        param
    }

    /// Consumes the rest of the input verbatim. Must be the last parameter.
    pub fn greedy<T: FromArgument>(name: impl Into<String>) -> Self {
        let mut param = Self::required::<T>(name);
        param.kind = ParamKind::Rest;
        param
    }

    /// Collects every remaining token. Must be the last parameter.
    pub fn variadic<T: FromArgument>(name: impl Into<String>) -> Self {
        let mut param = Self::optional::<T>(name);
        param.kind = ParamKind::Variadic;
        param
    }

    /// Lets any parameter kind be left out.
    pub fn not_required(mut self) -> Self {
        self.required = false;
        self
    }

    /// For variadic parameters: at least one token.
    pub fn at_least_one(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ParamKind {
        self.kind
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Usage fragment: `<name>`, `[name]`, `[name=default]` or `<name...>`.
    pub fn signature(&self) -> String {
        let dots = if self.kind == ParamKind::Single { "" } else { "..." };
        match (&self.default, self.required) {
            (Some((_, shown)), _) => format!("[{}={}]", self.name, shown),
            (None, true) => format!("<{}{}>", self.name, dots),
            (None, false) => format!("[{}{}]", self.name, dots),
        }
    }
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Param")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("required", &self.required)
            .finish()
    }
}

/// Rejects parameter lists that cannot be parsed unambiguously.
pub(crate) fn validate_params(command: &str, params: &[Param]) -> Result<(), RegistrationError> {
    let invalid = |reason: String| RegistrationError::InvalidSignature {
        command: command.to_string(),
        reason,
    };
    for (i, param) in params.iter().enumerate() {
        if param.kind != ParamKind::Single && i + 1 != params.len() {
            return Err(invalid(format!("\"{}\" consumes the rest and must be last", param.name)));
        }
        if params[..i].iter().any(|p| p.name == param.name) {
            return Err(invalid(format!("parameter \"{}\" is declared twice", param.name)));
        }
    }
    Ok(())
}

/// Converts the tokens after the command path into [`Args`].
///
/// `input` is the text the token offsets point into. Tokens beyond the
/// declared parameters are ignored.
pub(crate) async fn convert_arguments(
    ctx: &Context,
    params: &[Param],
    input: &str,
    tokens: &[Token],
) -> CommandResult<Args> {
    let mut args = Args::default();
    let mut cursor = 0;

    for param in params {
        let remaining = &tokens[cursor.min(tokens.len())..];
        match param.kind {
            ParamKind::Single => {
                let Some(token) = remaining.first() else {
                    fill_missing(&mut args, param)?;
                    continue;
                };
                let value = convert_one(ctx, param, &token.text).await?;
                args.insert_one(&param.name, value);
                cursor += 1;
            }
            ParamKind::Rest => {
                let raw = match remaining {
                    [] => None,
                    [only] => Some(only.text.clone()),
                    [first, ..] => Some(input[first.start..].trim_end().to_string()),
                };
                let Some(raw) = raw else {
                    fill_missing(&mut args, param)?;
                    continue;
                };
                let value = convert_one(ctx, param, &raw).await?;
                args.insert_one(&param.name, value);
                cursor = tokens.len();
            }
            ParamKind::Variadic => {
                if remaining.is_empty() && param.required {
                    return Err(CommandError::MissingRequiredArgument {
                        param: param.name.clone(),
                    });
                }
                let mut values = Vec::with_capacity(remaining.len());
                for token in remaining {
                    values.push(convert_one(ctx, param, &token.text).await?);
                }
                args.insert_many(&param.name, values);
                cursor = tokens.len();
            }
        }
    }

    Ok(args)
}

async fn convert_one(ctx: &Context, param: &Param, raw: &str) -> CommandResult<ArgValue> {
    param
        .converter
        .convert(ctx, raw)
        .await
        .map_err(|e| CommandError::bad_argument(&param.name, e))
}

fn fill_missing(args: &mut Args, param: &Param) -> CommandResult<()> {
    if param.required {
        return Err(CommandError::MissingRequiredArgument {
            param: param.name.clone(),
        });
    }
    if let Some((value, _)) = &param.default {
        args.insert_one(&param.name, value.clone());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture, message, message_in_guild};
    use crate::tokenize::tokenize;
    use ferrum_core::{Envelope, Method, RequestError};
    use serde_json::json;

    async fn run(ctx: &Context, params: &[Param], input: &str) -> CommandResult<Args> {
        convert_arguments(ctx, params, input, &tokenize(input)).await
    }

    #[tokio::test]
    async fn test_primitives() {
        let fx = fixture();
        let ctx = fx.context(message("x"));
        let params = [
            Param::required::<i64>("count"),
            Param::required::<bool>("flag"),
            Param::required::<f64>("ratio"),
        ];
        let args = run(&ctx, &params, "5 yes 0.5").await.unwrap();
        assert_eq!(args.get::<i64>("count"), Some(&5));
        assert_eq!(args.get::<bool>("flag"), Some(&true));
        assert_eq!(args.get::<f64>("ratio"), Some(&0.5));
    }

    #[tokio::test]
    async fn test_bad_argument_names_parameter() {
        let fx = fixture();
        let ctx = fx.context(message("x"));
        let err = run(&ctx, &[Param::required::<i64>("count")], "five")
            .await
            .unwrap_err();
        match err {
            CommandError::BadArgument { param, cause } => {
                assert_eq!(param, "count");
                assert!(cause.contains("five"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_and_default() {
        let fx = fixture();
        let ctx = fx.context(message("x"));

        let err = run(&ctx, &[Param::required::<i64>("count")], "").await.unwrap_err();
        assert!(matches!(err, CommandError::MissingRequiredArgument { param } if param == "count"));

        let params = [Param::with_default("count", 10i64), Param::optional::<String>("note")];
        let args = run(&ctx, &params, "").await.unwrap();
        assert_eq!(args.get::<i64>("count"), Some(&10));
        assert!(!args.contains("note"));
    }

    #[tokio::test]
    async fn test_greedy_takes_raw_remainder() {
        let fx = fixture();
        let ctx = fx.context(message("x"));
        let params = [Param::required::<i64>("n"), Param::greedy::<String>("text")];

        let args = run(&ctx, &params, r#"3 hello   "big" world "#).await.unwrap();
        assert_eq!(args.get::<String>("text").unwrap(), r#"hello   "big" world"#);

        let args = run(&ctx, &params, r#"3 "just one""#).await.unwrap();
        assert_eq!(args.get::<String>("text").unwrap(), "just one");
    }

    #[tokio::test]
    async fn test_variadic_collects_all() {
        let fx = fixture();
        let ctx = fx.context(message("x"));
        let args = run(&ctx, &[Param::variadic::<u32>("ids")], "1 2 3").await.unwrap();
        assert_eq!(args.get_all::<u32>("ids"), vec![&1, &2, &3]);

        let args = run(&ctx, &[Param::variadic::<u32>("ids")], "").await.unwrap();
        assert!(args.get_all::<u32>("ids").is_empty());

        let err = run(&ctx, &[Param::variadic::<u32>("ids").at_least_one()], "")
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::MissingRequiredArgument { .. }));
    }

    #[test]
    fn test_signature_and_validation() {
        let params = vec![
            Param::required::<i64>("count"),
            Param::with_default("limit", 5u32),
            Param::optional::<String>("note"),
            Param::greedy::<String>("reason"),
        ];
        let sig: Vec<String> = params.iter().map(Param::signature).collect();
        assert_eq!(sig, ["<count>", "[limit=5]", "[note]", "<reason...>"]);
        assert!(validate_params("cmd", &params).is_ok());

        let bad = [Param::greedy::<String>("text"), Param::required::<i64>("n")];
        assert!(matches!(
            validate_params("cmd", &bad),
            Err(RegistrationError::InvalidSignature { .. })
        ));
    }

    #[tokio::test]
    async fn test_user_from_mention_and_cache() {
        let fx = fixture();
        fx.handle.cache().apply(&Envelope::new(
            "READY",
            json!({"user": {"id": "1234567890123", "username": "ferris"}}),
        ));
        let ctx = fx.context(message("x"));

        let by_mention = User::from_argument(&ctx, "<@!1234567890123>").await.unwrap();
        assert_eq!(by_mention.username, "ferris");
        let by_name = User::from_argument(&ctx, "ferris").await.unwrap();
        assert_eq!(by_name.id, Id(1234567890123));
        assert!(User::from_argument(&ctx, "nobody").await.is_err());
    }

    #[tokio::test]
    async fn test_user_falls_back_to_remote() {
        let fx = fixture();
        fx.executor.respond(
            Method::Get,
            "/users/5555555555555",
            Ok(json!({"id": "5555555555555", "username": "remote"})),
        );
        fx.executor.respond(
            Method::Get,
            "/users/6666666666666",
            Err(RequestError::from_status(404, "Unknown User")),
        );
        let ctx = fx.context(message("x"));

        let user = User::from_argument(&ctx, "5555555555555").await.unwrap();
        assert_eq!(user.username, "remote");
        let err = User::from_argument(&ctx, "6666666666666").await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_role_lookups_need_guild() {
        let fx = fixture();
        fx.handle.cache().apply(&Envelope::new(
            "GUILD_CREATE",
            json!({"id": "100", "roles": [{"id": "1000000000042", "name": "Moderator"}]}),
        ));

        let ctx = fx.context(message_in_guild("x", 100));
        let role = Role::from_argument(&ctx, "moderator").await.unwrap();
        assert_eq!(role.id, Id(1000000000042));
        let role = Role::from_argument(&ctx, "<@&1000000000042>").await.unwrap();
        assert_eq!(role.name, "Moderator");

        let dm = fx.context(message("x"));
        let err = Role::from_argument(&dm, "moderator").await.unwrap_err();
        assert!(err.to_string().contains("inside a guild"));
    }

    #[tokio::test]
    async fn test_message_from_link() {
        let fx = fixture();
        fx.executor.respond(
            Method::Get,
            "/channels/2000000000002/messages/3000000000003",
            Ok(json!({
                "id": "3000000000003",
                "channel_id": "2000000000002",
                "author": {"id": "1", "username": "a"},
                "content": "linked",
            })),
        );
        let ctx = fx.context(message("x"));
        let msg = Message::from_argument(
            &ctx,
            "https://fluxer.app/channels/1000000000001/2000000000002/3000000000003",
        )
        .await
        .unwrap();
        assert_eq!(msg.content, "linked");
    }

    #[tokio::test]
    async fn test_fn_converter() {
        let fx = fixture();
        let ctx = fx.context(message("x"));
        let upper = FnConverter::new(|s: &str| Ok::<_, BoxError>(s.to_uppercase()));
        let args = run(&ctx, &[Param::new("word", upper)], "quiet").await.unwrap();
        assert_eq!(args.get::<String>("word").unwrap(), "QUIET");
    }
}
