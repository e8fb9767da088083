//! Logging setup on `tracing-subscriber`.
//!
//! ```rust,ignore
//! use ferrum_runtime::logging::{LoggingBuilder, SpanEvents};
//!
//! LoggingBuilder::new()
//!     .directive("ferrum_gateway=debug")
//!     .span_events(SpanEvents::LIFECYCLE)
//!     .init();
//! ```
//!
//! `RUST_LOG`, when set, replaces the configured base level. Directives are
//! added on top of it either way.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use tracing::warn;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::{LogFormat, LogOutput, LogRotation, LoggingConfig, SpanEventConfig};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Which span lifecycle events are logged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpanEvents {
    pub new: bool,
    pub enter: bool,
    pub exit: bool,
    pub close: bool,
}

impl SpanEvents {
    pub const NONE: Self = Self {
        new: false,
        enter: false,
        exit: false,
        close: false,
    };

    /// Creation and close. Shows how long each invocation span lived.
    pub const LIFECYCLE: Self = Self {
        new: true,
        enter: false,
        exit: false,
        close: true,
    };

    pub const ACTIVE: Self = Self {
        new: false,
        enter: true,
        exit: true,
        close: false,
    };

    pub const FULL: Self = Self {
        new: true,
        enter: true,
        exit: true,
        close: true,
    };

    fn to_fmt_span(self) -> FmtSpan {
        [
            (self.new, FmtSpan::NEW),
            (self.enter, FmtSpan::ENTER),
            (self.exit, FmtSpan::EXIT),
            (self.close, FmtSpan::CLOSE),
        ]
        .into_iter()
        .filter(|(on, _)| *on)
        .fold(FmtSpan::NONE, |acc, (_, flag)| acc | flag)
    }
}

impl From<&SpanEventConfig> for SpanEvents {
    fn from(config: &SpanEventConfig) -> Self {
        Self {
            new: config.new,
            enter: config.enter,
            exit: config.exit,
            close: config.close,
        }
    }
}

/// Initializes logging from configuration. A second call is a no-op.
pub fn init_from_config(config: &LoggingConfig) {
    let _ = LoggingBuilder::from_config(config).try_init();
}

#[derive(Debug, Clone)]
pub struct LoggingBuilder {
    directives: Vec<String>,
    level: tracing::Level,
    span_events: SpanEvents,
    format: LogFormat,
    output: LogOutput,
    with_target: bool,
    with_thread_ids: bool,
    with_file: bool,
    with_line_number: bool,
    file_path: Option<PathBuf>,
    rotation: LogRotation,
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingBuilder {
    pub fn new() -> Self {
        Self {
            directives: Vec::new(),
            level: tracing::Level::INFO,
            span_events: SpanEvents::NONE,
            format: LogFormat::Compact,
            output: LogOutput::Stdout,
            with_target: true,
            with_thread_ids: false,
            with_file: false,
            with_line_number: false,
            file_path: None,
            rotation: LogRotation::Never,
        }
    }

    pub fn from_config(config: &LoggingConfig) -> Self {
        let mut directives: Vec<String> = config
            .filters
            .iter()
            .map(|(target, level)| format!("{target}={level}"))
            .collect();
        directives.sort();

        Self {
            directives,
            level: config.level.to_tracing_level(),
            span_events: SpanEvents::from(&config.span_events),
            format: config.format,
            output: config.output,
            with_target: true,
            with_thread_ids: config.thread_ids,
            with_file: config.file_location,
            with_line_number: config.file_location,
            file_path: config.file_path.clone(),
            rotation: config.rotation,
        }
    }

    pub fn with_level(mut self, level: tracing::Level) -> Self {
        self.level = level;
        self
    }

    /// Adds a filter directive such as `ferrum_commands=trace`.
    pub fn directive(mut self, directive: &str) -> Self {
        self.directives.push(directive.to_string());
        self
    }

    pub fn span_events(mut self, events: SpanEvents) -> Self {
        self.span_events = events;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    pub fn with_thread_ids(mut self, enabled: bool) -> Self {
        self.with_thread_ids = enabled;
        self
    }

    /// File and line of each event.
    pub fn with_file_location(mut self, enabled: bool) -> Self {
        self.with_file = enabled;
        self.with_line_number = enabled;
        self
    }

    /// Writes to `path` instead of stdout.
    pub fn file(mut self, path: impl Into<PathBuf>, rotation: LogRotation) -> Self {
        self.output = LogOutput::File;
        self.file_path = Some(path.into());
        self.rotation = rotation;
        self
    }

    fn build_filter(&self) -> EnvFilter {
        let base = self.level.to_string().to_lowercase();
        self.directives.iter().fold(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&base)),
            |filter, directive| match directive.parse() {
                Ok(d) => filter.add_directive(d),
                Err(e) => {
                    eprintln!("ignoring invalid log directive {directive:?}: {e}");
                    filter
                }
            },
        )
    }

    fn build_writer(&self) -> BoxMakeWriter {
        match (&self.output, &self.file_path) {
            (LogOutput::Stdout, _) => BoxMakeWriter::new(std::io::stdout),
            (LogOutput::Stderr, _) => BoxMakeWriter::new(std::io::stderr),
            (LogOutput::File, Some(path)) => {
                let dir = path.parent().unwrap_or_else(|| Path::new("."));
                let name = path.file_name().unwrap_or_else(|| OsStr::new("ferrum.log"));
                let appender = match self.rotation {
                    LogRotation::Never => tracing_appender::rolling::never(dir, name),
                    LogRotation::Hourly => tracing_appender::rolling::hourly(dir, name),
                    LogRotation::Daily => tracing_appender::rolling::daily(dir, name),
                };
                BoxMakeWriter::new(appender)
            }
            (LogOutput::File, None) => {
                warn!("File output requested but no file path configured, falling back to stdout");
                BoxMakeWriter::new(std::io::stdout)
            }
        }
    }

    fn build_layer(&self, writer: BoxMakeWriter) -> BoxedLayer {
        let span_events = self.span_events.to_fmt_span();

        macro_rules! text_layer {
            ($layer:expr) => {
                $layer
                    .with_span_events(span_events.clone())
                    .with_target(self.with_target)
                    .with_thread_ids(self.with_thread_ids)
                    .with_file(self.with_file)
                    .with_line_number(self.with_line_number)
                    .with_writer(writer)
                    .boxed()
            };
        }

        match self.format {
            LogFormat::Compact => text_layer!(fmt::layer().compact()),
            LogFormat::Pretty => text_layer!(fmt::layer().pretty()),
            LogFormat::Full => text_layer!(fmt::layer()),
            #[cfg(feature = "json-log")]
            LogFormat::Json => fmt::layer()
                .json()
                .with_span_events(span_events)
                .with_writer(writer)
                .boxed(),
            #[cfg(not(feature = "json-log"))]
            LogFormat::Json => {
                eprintln!("json log format needs the json-log feature, using full format");
                text_layer!(fmt::layer())
            }
        }
    }

    pub fn init(self) {
        let _ = self.try_init();
    }

    pub fn try_init(self) -> Result<(), TryInitError> {
        let layer = self.build_layer(self.build_writer());
        tracing_subscriber::registry()
            .with(layer.with_filter(self.build_filter()))
            .try_init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_span_event_flags() {
        assert_eq!(SpanEvents::NONE.to_fmt_span(), FmtSpan::NONE);
        assert_eq!(
            SpanEvents::LIFECYCLE.to_fmt_span(),
            FmtSpan::NEW | FmtSpan::CLOSE
        );
        assert_eq!(SpanEvents::FULL.to_fmt_span(), FmtSpan::FULL);
    }

    #[test]
    fn test_from_config() {
        let mut config = LoggingConfig {
            level: LogLevel::Debug,
            thread_ids: true,
            ..Default::default()
        };
        config.filters.insert("ferrum_gateway".into(), LogLevel::Trace);
        config.filters.insert("ferrum_commands".into(), LogLevel::Warn);

        let builder = LoggingBuilder::from_config(&config);
        assert_eq!(builder.level, tracing::Level::DEBUG);
        assert!(builder.with_thread_ids);
        assert_eq!(
            builder.directives,
            ["ferrum_commands=warn", "ferrum_gateway=trace"]
        );
    }
}
