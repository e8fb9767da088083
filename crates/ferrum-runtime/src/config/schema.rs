//! Configuration schema definitions.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use ferrum_commands::{
    BucketScope, ConcurrencyPolicy, CooldownCharge, CooldownPolicy, PipelineConfig, Prefix,
    RegistryOptions,
};
use ferrum_core::{CachePolicy, DEFAULT_MAX_MESSAGES, Id, Retention};
use ferrum_gateway::{Backoff, GatewayConfig};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FerrumConfig {
    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub gateway: GatewaySettings,

    #[serde(default)]
    pub commands: CommandsConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

// =============================================================================
// Client
// =============================================================================

/// Credentials and API endpoints.
#[derive(Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Bot token. A leading `Bot ` or `Bearer ` is stripped.
    #[serde(default)]
    pub token: String,

    #[serde(default = "default_api_base")]
    pub api_base: String,

    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Fixed gateway URL. Discovered through the REST API when unset.
    #[serde(default)]
    pub gateway_url: Option<String>,

    /// Intent bitfield sent with IDENTIFY.
    #[serde(default)]
    pub intents: u64,

    /// REST request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            api_base: default_api_base(),
            api_version: default_api_version(),
            gateway_url: None,
            intents: 0,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("token", &"<redacted>")
            .field("api_base", &self.api_base)
            .field("api_version", &self.api_version)
            .field("gateway_url", &self.gateway_url)
            .field("intents", &self.intents)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

fn default_api_base() -> String {
    "https://api.fluxer.app".to_string()
}

fn default_api_version() -> String {
    "1".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[cfg(feature = "http")]
    pub fn to_http_config(&self) -> ferrum_gateway::HttpConfig {
        ferrum_gateway::HttpConfig {
            base_url: self.api_base.clone(),
            api_version: self.api_version.clone(),
            timeout: self.request_timeout(),
        }
    }
}

// =============================================================================
// Gateway
// =============================================================================

/// Session recovery and timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Heartbeat ACK grace in milliseconds. Defaults to one interval.
    #[serde(default)]
    pub heartbeat_grace_ms: Option<u64>,

    #[serde(default = "default_resume_attempts")]
    pub resume_attempts: u32,

    /// Upper bound for HELLO through READY, in seconds.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Pause after a non-resumable invalid session, in milliseconds.
    #[serde(default = "default_invalid_session_delay_ms")]
    pub invalid_session_delay_ms: u64,

    #[serde(default)]
    pub backoff: BackoffConfig,

    /// How often expired waiters are swept, in milliseconds.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            heartbeat_grace_ms: None,
            resume_attempts: default_resume_attempts(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            invalid_session_delay_ms: default_invalid_session_delay_ms(),
            backoff: BackoffConfig::default(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

fn default_resume_attempts() -> u32 {
    3
}

fn default_handshake_timeout_secs() -> u64 {
    30
}

fn default_invalid_session_delay_ms() -> u64 {
    5000
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

impl GatewaySettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Exponential backoff between recovery attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl BackoffConfig {
    pub fn to_backoff(&self) -> Backoff {
        Backoff {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
        }
    }
}

impl FerrumConfig {
    /// Gateway settings merged with the client's intents.
    pub fn to_gateway_config(&self) -> GatewayConfig {
        let gateway = &self.gateway;
        GatewayConfig {
            intents: self.client.intents,
            handshake_timeout: Duration::from_secs(gateway.handshake_timeout_secs),
            heartbeat_grace: gateway.heartbeat_grace_ms.map(Duration::from_millis),
            resume_attempts: gateway.resume_attempts,
            backoff: gateway.backoff.to_backoff(),
            invalid_session_delay: Duration::from_millis(gateway.invalid_session_delay_ms),
            ..Default::default()
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsConfig {
    /// Literal prefixes, tried in order.
    #[serde(default = "default_prefixes")]
    pub prefixes: Vec<String>,

    /// Also accept a mention of the bot as prefix.
    #[serde(default)]
    pub when_mentioned: bool,

    #[serde(default)]
    pub case_insensitive: bool,

    #[serde(default = "default_true")]
    pub ignore_bots: bool,

    #[serde(default)]
    pub owner_ids: Vec<u64>,

    /// Register the built-in `help` command.
    #[serde(default = "default_true")]
    pub help: bool,

    #[serde(default)]
    pub cooldown_charge: CooldownCharge,

    /// Cooldown for commands that declare none.
    #[serde(default)]
    pub default_cooldown: Option<CooldownConfig>,

    /// Concurrency limit for commands that declare none.
    #[serde(default)]
    pub default_concurrency: Option<ConcurrencyConfig>,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            prefixes: default_prefixes(),
            when_mentioned: false,
            case_insensitive: false,
            ignore_bots: true,
            owner_ids: Vec::new(),
            help: true,
            cooldown_charge: CooldownCharge::default(),
            default_cooldown: None,
            default_concurrency: None,
        }
    }
}

fn default_prefixes() -> Vec<String> {
    vec!["!".to_string()]
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownConfig {
    pub rate: u32,
    /// Window length in seconds.
    pub per_secs: f64,
    #[serde(default)]
    pub scope: BucketScope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub limit: usize,
    #[serde(default)]
    pub scope: BucketScope,
    /// Queue instead of rejecting when the limit is reached.
    #[serde(default)]
    pub wait: bool,
}

impl CommandsConfig {
    pub fn prefix(&self) -> Prefix {
        match (self.when_mentioned, self.prefixes.as_slice()) {
            (true, _) => Prefix::MentionOr(self.prefixes.clone()),
            (false, [single]) => Prefix::literal(single.clone()),
            (false, _) => Prefix::List(self.prefixes.clone()),
        }
    }

    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            prefix: self.prefix(),
            ignore_bots: self.ignore_bots,
            owner_ids: self.owner_ids.iter().copied().map(Id).collect::<HashSet<_>>(),
            cooldown_charge: self.cooldown_charge,
            help: self.help,
        }
    }

    pub fn to_registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            case_insensitive: self.case_insensitive,
            default_cooldown: self.default_cooldown.as_ref().map(|c| CooldownPolicy {
                rate: c.rate,
                per: Duration::try_from_secs_f64(c.per_secs).unwrap_or_default(),
                scope: c.scope,
            }),
            default_concurrency: self.default_concurrency.as_ref().map(|c| ConcurrencyPolicy {
                limit: c.limit,
                scope: c.scope,
                wait: c.wait,
            }),
        }
    }
}

// =============================================================================
// Cache
// =============================================================================

/// Entries kept per entity kind. `0` keeps everything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default)]
    pub max_users: usize,
    #[serde(default)]
    pub max_channels: usize,
    #[serde(default)]
    pub max_guilds: usize,
    #[serde(default)]
    pub max_roles: usize,
    #[serde(default)]
    pub max_members: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            max_users: 0,
            max_channels: 0,
            max_guilds: 0,
            max_roles: 0,
            max_members: 0,
        }
    }
}

fn default_max_messages() -> usize {
    DEFAULT_MAX_MESSAGES
}

fn retention(max: usize) -> Retention {
    match max {
        0 => Retention::Unbounded,
        n => Retention::Bounded(n),
    }
}

impl CacheConfig {
    pub fn to_policy(&self) -> CachePolicy {
        CachePolicy {
            messages: retention(self.max_messages),
            users: retention(self.max_users),
            channels: retention(self.max_channels),
            guilds: retention(self.max_guilds),
            roles: retention(self.max_roles),
            members: retention(self.max_members),
        }
    }
}

// =============================================================================
// Logging
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    /// Needs the `json-log` feature; falls back to `full` without it.
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
}

/// When the log file rolls over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Never,
    Hourly,
    Daily,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SpanEventConfig {
    #[serde(default)]
    pub new: bool,
    #[serde(default)]
    pub enter: bool,
    #[serde(default)]
    pub exit: bool,
    #[serde(default)]
    pub close: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default)]
    pub output: LogOutput,

    #[serde(default)]
    pub span_events: SpanEventConfig,

    #[serde(default)]
    pub thread_ids: bool,

    /// Include file and line of each event.
    #[serde(default)]
    pub file_location: bool,

    /// Required when `output = "file"`.
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    #[serde(default)]
    pub rotation: LogRotation,

    /// Per-target levels, e.g. `ferrum_gateway = "debug"`.
    #[serde(default)]
    pub filters: HashMap<String, LogLevel>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_from_config() {
        let mut commands = CommandsConfig::default();
        assert!(matches!(commands.prefix(), Prefix::Literal(p) if p == "!"));

        commands.prefixes = vec!["!!".into(), "!".into()];
        assert!(matches!(commands.prefix(), Prefix::List(p) if p.len() == 2));

        commands.when_mentioned = true;
        assert!(matches!(commands.prefix(), Prefix::MentionOr(_)));
    }

    #[test]
    fn test_cache_retention_mapping() {
        let cache = CacheConfig {
            max_members: 50,
            ..Default::default()
        };
        let policy = cache.to_policy();
        assert_eq!(policy.messages, Retention::Bounded(DEFAULT_MAX_MESSAGES));
        assert_eq!(policy.members, Retention::Bounded(50));
        assert_eq!(policy.users, Retention::Unbounded);
    }

    #[test]
    fn test_registry_defaults_mapping() {
        let commands = CommandsConfig {
            case_insensitive: true,
            default_cooldown: Some(CooldownConfig {
                rate: 2,
                per_secs: 1.5,
                scope: BucketScope::Channel,
            }),
            ..Default::default()
        };
        let options = commands.to_registry_options();
        assert!(options.case_insensitive);
        let cooldown = options.default_cooldown.unwrap();
        assert_eq!(cooldown.per, Duration::from_millis(1500));
        assert_eq!(cooldown.scope, BucketScope::Channel);
        assert!(options.default_concurrency.is_none());
    }

    #[test]
    fn test_token_is_redacted() {
        let client = ClientConfig {
            token: "secret".into(),
            ..Default::default()
        };
        assert!(!format!("{client:?}").contains("secret"));
    }
}
