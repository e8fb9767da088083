//! Command Bot Example
//!
//! A small bot showing the pieces of the Ferrum command framework:
//!
//! - plain commands with typed parameters (`ping`, `add`, `echo`)
//! - a command group with an owner-only subcommand (`admin say`)
//! - cooldowns and concurrency limits (`roll`, `slow`)
//! - waiting for a follow-up message (`guess`)
//! - an extension bundling a listener, a command and a check (`stats`)
//! - a background loop refreshing the bot's presence
//!
//! # Usage
//!
//! ```bash
//! FERRUM_CLIENT__TOKEN=... cargo run --package command-bot -- --prefix '?'
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use ferrum::commands::{BucketScope, CommandError};
use ferrum::core::{Activity, Presence, WaitError};
use ferrum::prelude::*;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "command-bot", about = "A small prefix-command bot")]
struct Cli {
    /// Configuration file; searched for in the usual places when omitted.
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Configuration profile (development, production, ...).
    #[arg(long)]
    profile: Option<String>,

    /// Overrides the configured command prefix.
    #[arg(long)]
    prefix: Option<String>,

    /// Overrides the configured log level.
    #[arg(long)]
    log_level: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn ping(_ctx: Arc<Context>) -> &'static str {
    "pong"
}

async fn add(ctx: Arc<Context>) -> String {
    let a = ctx.args().get::<i64>("a").copied().unwrap_or_default();
    let b = ctx.args().get::<i64>("b").copied().unwrap_or_default();
    format!("{a} + {b} = {}", a.saturating_add(b))
}

async fn sum(ctx: Arc<Context>) -> String {
    let numbers = ctx.args().get_all::<i64>("numbers");
    let total: i64 = numbers.iter().copied().copied().sum();
    format!("{} numbers, total {total}", numbers.len())
}

async fn echo(ctx: Arc<Context>) -> Option<String> {
    ctx.args().get::<String>("text").cloned()
}

async fn roll(ctx: Arc<Context>) -> String {
    let sides = ctx.args().get::<u64>("sides").copied().unwrap_or(6).max(1);
    let seed = ctx.message().id.0 ^ ctx.author().id.0;
    format!("You rolled {} (d{sides})", seed % sides + 1)
}

async fn slow(_ctx: Arc<Context>) -> &'static str {
    tokio::time::sleep(Duration::from_secs(5)).await;
    "done"
}

async fn guess(ctx: Arc<Context>) -> Result<String, BoxError> {
    let secret = ctx.message().id.0 % 10 + 1;
    ctx.typing().await?;
    ctx.reply("I'm thinking of a number between 1 and 10.").await?;

    let author = ctx.author().id;
    let channel = ctx.channel_id();
    let waiter = ctx.handle().wait_for(
        "MESSAGE_CREATE",
        move |event: &Event| {
            event
                .decode::<Message>()
                .is_ok_and(|m| m.author.id == author && m.channel_id == channel)
        },
        Some(Duration::from_secs(15)),
    );

    let answer = match waiter.wait().await {
        Ok(event) => event.decode::<Message>()?,
        Err(WaitError::Timeout) => return Ok(format!("Too slow! It was {secret}.")),
        Err(e) => return Err(e.into()),
    };
    Ok(match answer.content.trim().parse::<u64>() {
        Ok(n) if n == secret => "Correct!".to_string(),
        Ok(_) => format!("Nope, it was {secret}."),
        Err(_) => "That's not a number.".to_string(),
    })
}

/// `admin` on its own lists its subcommands.
async fn admin(ctx: Arc<Context>) -> Result<(), BoxError> {
    ctx.send_help(None).await?;
    Ok(())
}

async fn say(ctx: Arc<Context>) -> Option<String> {
    ctx.args().get::<String>("text").cloned()
}

// ============================================================================
// Extension
// ============================================================================

/// Counts messages and reports the total.
#[derive(Default)]
struct Stats {
    seen: Arc<AtomicU64>,
}

#[async_trait]
impl Extension for Stats {
    fn name(&self) -> &str {
        "stats"
    }

    async fn setup(&self, scope: &mut ExtensionScope<'_>) -> Result<(), BoxError> {
        let seen = Arc::clone(&self.seen);
        scope.add_listener("MESSAGE_CREATE", move |_event: Event| {
            seen.fetch_add(1, Ordering::Relaxed);
            async { Ok::<(), BoxError>(()) }
        });

        let seen = Arc::clone(&self.seen);
        scope.add_command(
            Command::build("stats")
                .brief("Messages seen since the extension loaded")
                .check(guild_only())
                .handler(move |_ctx: Arc<Context>| {
                    let seen = Arc::clone(&seen);
                    async move { format!("{} messages seen", seen.load(Ordering::Relaxed)) }
                }),
        )?;
        Ok(())
    }
}

// ============================================================================
// Registration
// ============================================================================

fn register(client: &Client) -> Result<()> {
    client.add_command(Command::build("ping").brief("Checks the bot is alive").handler(ping))?;
    client.add_command(
        Command::build("add")
            .brief("Adds two integers")
            .param(Param::required::<i64>("a"))
            .param(Param::required::<i64>("b"))
            .handler(add),
    )?;
    client.add_command(
        Command::build("sum")
            .brief("Adds any number of integers")
            .param(Param::variadic::<i64>("numbers").at_least_one())
            .handler(sum),
    )?;
    client.add_command(
        Command::build("echo")
            .alias("say")
            .brief("Repeats what you said")
            .param(Param::greedy::<String>("text"))
            .handler(echo),
    )?;
    client.add_command(
        Command::build("roll")
            .brief("Rolls a die")
            .param(Param::with_default("sides", 6u64))
            .cooldown(2, Duration::from_secs(10), BucketScope::User)
            .handler(roll),
    )?;
    client.add_command(
        Command::build("slow")
            .hidden(true)
            .max_concurrency(1, BucketScope::Channel, false)
            .handler(slow),
    )?;
    client.add_command(Command::build("guess").brief("A guessing game").handler(guess))?;
    client.add_command(
        Command::build("admin")
            .brief("Owner tools")
            .check(is_owner())
            .handler(admin)
            .subcommand(
                Command::build("say")
                    .brief("Speaks as the bot")
                    .param(Param::greedy::<String>("text"))
                    .handler(say),
            ),
    )?;

    let pipeline = client.pipeline();
    pipeline.before_invoke(|ctx: Arc<Context>| async move {
        info!(user = %ctx.author().id, command = %ctx.invoked_with(), "Invoking command");
        Ok(())
    });
    pipeline.on_error(|ctx: Arc<Context>, error: CommandError| async move {
        let reply = match &error {
            CommandError::NotFound { .. } => return,
            CommandError::OnCooldown { retry_after } => {
                format!("Slow down! Try again in {:.1}s.", retry_after.as_secs_f64())
            }
            e if e.is_user_input() => format!("{e}"),
            CommandError::CheckFailure { .. } => "You can't use that here.".to_string(),
            e => {
                warn!(error = %e, "Command failed");
                "Something went wrong.".to_string()
            }
        };
        if let Err(e) = ctx.reply(&reply).await {
            warn!(error = %e, "Failed to send error reply");
        }
    });
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new().with_current_dir().with_user_config_dir();
    if let Some(profile) = &cli.profile {
        loader = loader.profile(profile);
    }
    if let Some(path) = &cli.config {
        loader = loader.file(path);
    }
    if let Some(prefix) = &cli.prefix {
        loader = loader.set("commands.prefixes", [prefix]);
    }
    if let Some(level) = &cli.log_level {
        loader = loader.set("logging.level", level);
    }
    let config = loader.load()?;

    let client = Client::builder().config(config).build()?;
    register(&client)?;
    client.load_extension(Stats::default()).await?;

    client.on("READY", |event: Event| async move {
        let name = event
            .payload()
            .pointer("/user/username")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        info!(user = %name, "Logged in");
        Ok::<(), BoxError>(())
    });

    let handle = client.handle().clone();
    let ready = client.handle().clone();
    let presence = Loop::new(Duration::from_secs(300), move || {
        let handle = handle.clone();
        async move {
            let seen = handle.cache().message_count();
            handle.update_presence(Presence {
                activities: vec![Activity::playing(format!("with {seen} cached messages"))],
                ..Default::default()
            })?;
            Ok(())
        }
    })
    .name("presence")
    .before_loop(move || {
        let waiter = ready.wait_for("READY", |_: &Event| true, None);
        async move {
            let _ = waiter.wait().await;
        }
    })
    .on_error(|e| async move { warn!(error = %e, "Presence update failed") });
    client.start_loop(&presence);

    client.run().await?;
    Ok(())
}
