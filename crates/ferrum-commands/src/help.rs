//! The built-in `help` command.

use std::fmt::Write;
use std::sync::Arc;

use crate::context::Context;
use crate::convert::Param;
use crate::registry::{Command, CommandBuilder, CommandRegistry};

/// `help [command...]`, also reachable as `commands`.
pub fn help_command() -> CommandBuilder {
    Command::build("help")
        .alias("commands")
        .brief("Shows this message")
        .help("Shows this message\n\nPass a command name for its usage.")
        .param(Param::greedy::<String>("command").not_required())
        .handler(|ctx: Arc<Context>| async move { render_help(&ctx) })
}

fn render_help(ctx: &Context) -> String {
    let query = ctx.args().get::<String>("command").map(String::as_str);
    help_text(ctx.registry(), query, &ctx.clean_prefix())
}

/// The overview, or one command's page when `query` names a visible command.
pub fn help_text(registry: &CommandRegistry, query: Option<&str>, prefix: &str) -> String {
    match query {
        None => format_overview(registry, prefix),
        Some(query) => match registry.get_command(query) {
            Some(command) if !command.is_hidden() => format_command(&command, prefix),
            _ => format!("Command not found: {query}"),
        },
    }
}

/// Lists every visible command, top level sorted by name and subcommands
/// indented beneath their group.
pub fn format_overview(registry: &CommandRegistry, prefix: &str) -> String {
    let mut top = registry.commands();
    top.sort_by(|a, b| a.name().cmp(b.name()));

    let mut out = String::from("Commands:");
    for command in &top {
        write_entry(&mut out, command, prefix, 0);
    }
    out
}

fn write_entry(out: &mut String, command: &Command, prefix: &str, depth: usize) {
    if command.is_hidden() {
        return;
    }
    let indent = "  ".repeat(depth);
    let _ = write!(out, "\n{indent}{prefix}{}", command.qualified_name());
    let signature = command.signature();
    if !signature.is_empty() {
        let _ = write!(out, " {signature}");
    }
    let doc = command.short_doc();
    if !doc.is_empty() {
        let _ = write!(out, " - {doc}");
    }
    for child in command.subcommands() {
        write_entry(out, &child, prefix, depth + 1);
    }
}

/// Usage line, full help text and visible subcommands of one command.
pub fn format_command(command: &Command, prefix: &str) -> String {
    let usage = match command.usage() {
        Some(usage) => usage.to_string(),
        None => format!("{} {}", command.qualified_name(), command.signature()),
    };
    let mut out = format!("Usage: {prefix}{}", usage.trim_end());
    if let Some(help) = command.help() {
        let _ = write!(out, "\n\n{help}");
    }
    let children: Vec<_> = command
        .subcommands()
        .into_iter()
        .filter(|c| !c.is_hidden())
        .map(|c| c.name().to_string())
        .collect();
    if !children.is_empty() {
        let _ = write!(out, "\n\nSubcommands: {}", children.join(", "));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Outcome, PipelineConfig};
    use crate::testing::{fixture, message};

    fn noop() -> impl Fn(Arc<Context>) -> std::future::Ready<()> + Clone + Send + Sync + 'static {
        |_ctx| std::future::ready(())
    }

    fn populate(registry: &CommandRegistry) {
        registry
            .add_command(
                Command::build("ping")
                    .brief("Checks latency")
                    .handler(noop()),
            )
            .unwrap();
        registry
            .add_command(
                Command::build("admin")
                    .help("Administration\nOwner only.")
                    .subcommand(
                        Command::build("prune")
                            .param(Param::required::<u32>("count"))
                            .handler(noop()),
                    )
                    .subcommand(Command::build("secret").hidden(true).handler(noop())),
            )
            .unwrap();
        registry
            .add_command(Command::build("debug").hidden(true).handler(noop()))
            .unwrap();
    }

    #[test]
    fn test_overview() {
        let fx = fixture();
        populate(&fx.registry);
        assert_eq!(
            format_overview(&fx.registry, "!"),
            "Commands:\n!admin - Administration\n  !admin prune <count>\n!ping - Checks latency"
        );
    }

    #[test]
    fn test_single_command() {
        let fx = fixture();
        populate(&fx.registry);
        let admin = fx.registry.get_command("admin").unwrap();
        assert_eq!(
            format_command(&admin, "!"),
            "Usage: !admin\n\nAdministration\nOwner only.\n\nSubcommands: prune"
        );
        let prune = fx.registry.get_command("admin prune").unwrap();
        assert_eq!(format_command(&prune, "?"), "Usage: ?admin prune <count>");
    }

    #[tokio::test]
    async fn test_help_replies() {
        let fx = fixture();
        populate(&fx.registry);
        let pipeline = fx.pipeline(PipelineConfig::default());

        let outcome = pipeline.process(Arc::new(message("!help admin prune"))).await;
        assert!(matches!(outcome, Outcome::Completed { .. }));
        let outcome = pipeline.process(Arc::new(message("!commands nope"))).await;
        assert!(matches!(outcome, Outcome::Completed { .. }));
        pipeline.process(Arc::new(message("!help debug"))).await;

        let sent = fx.executor.sent_messages();
        assert_eq!(
            sent,
            [
                "Usage: !admin prune <count>",
                "Command not found: nope",
                "Command not found: debug",
            ]
        );
    }
}
