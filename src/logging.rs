//! Unified logging infrastructure for stryx.
//!
//! The parent process logs through a `tracing-subscriber` stack configured by
//! [`LogConfig`]. Worker processes never write log lines themselves: their
//! events are captured by [`WorkerLogLayer`], shipped to the parent as
//! protocol messages and re-emitted by [`forward_worker_log`].
//!
//! # Environment Variables
//!
//! - `STRYX_LOG` - Log filter (overrides RUST_LOG)
//! - `STRYX_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `STRYX_LOG_FORMAT` - Output format: pretty, compact, json
//! - `STRYX_LOG_FILE` - Path to log file (in addition to stderr)
//! - `STRYX_LOG_ROTATION` - Log file rotation: hourly, daily, never
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! # Example
//!
//! ```no_run
//! use stryx::logging::{LogConfig, init};
//!
//! init(LogConfig::default().with_env_overrides());
//! ```

use std::fmt::Write as _;
use std::path::PathBuf;
use std::str::FromStr;

use tokio::sync::mpsc::UnboundedSender;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, MakeWriter, format::FmtSpan},
    layer::{Context, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
};

use crate::worker::protocol::{LogRecord, WorkerMessage};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable pretty format (default)
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for log aggregation systems
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Log rotation configuration for file output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            _ => Err(format!(
                "Unknown log rotation: '{}'. Valid options: hourly, daily, never",
                s
            )),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Logging configuration.
///
/// Use the builder methods to customize, then pass to [`init`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: INFO)
    pub level: Level,
    /// Log format (default: Pretty)
    pub format: LogFormat,
    /// Path to log file (None = stderr only)
    pub file_path: Option<PathBuf>,
    /// Log rotation for file output (default: Daily)
    pub rotation: LogRotation,
    /// Log span timing on close
    pub span_events: bool,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
    /// Show target module in logs (default: true)
    pub show_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            file_path: None,
            rotation: LogRotation::Daily,
            span_events: false,
            filter: None,
            show_target: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply environment variable overrides.
    ///
    /// CLI arguments take precedence: if a filter is already set (from `-v` or
    /// `-q`), `STRYX_LOG`/`RUST_LOG`/`STRYX_LOG_LEVEL` are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("STRYX_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none()
            && let Ok(level_str) = std::env::var("STRYX_LOG_LEVEL")
        {
            self.level = parse_level(&level_str).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var("STRYX_LOG_FORMAT")
            && let Ok(f) = format.parse()
        {
            self.format = f;
        }

        if let Ok(path) = std::env::var("STRYX_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        if let Ok(rotation) = std::env::var("STRYX_LOG_ROTATION")
            && let Ok(r) = rotation.parse()
        {
            self.rotation = r;
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        if let Some(ref filter) = self.filter {
            EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                EnvFilter::new(self.level.to_string().to_lowercase())
            })
        } else {
            EnvFilter::new(self.level.to_string().to_lowercase())
        }
    }

    fn span_events(&self) -> FmtSpan {
        if self.span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    /// One formatting layer writing to `writer` in the configured format.
    fn fmt_layer<S, W>(&self, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let layer = fmt::layer()
            .with_span_events(self.span_events())
            .with_target(self.show_target)
            .with_ansi(ansi && crate::theme::colors_enabled())
            .with_writer(writer);
        match self.format {
            LogFormat::Json => layer.json().boxed(),
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Pretty => layer.boxed(),
        }
    }
}

/// Parse a log level string.
pub fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Initialize the global tracing subscriber for the parent process.
///
/// Logs to stderr, plus the configured file when `file_path` is set.
/// Subsequent calls are silently ignored.
pub fn init(config: LogConfig) {
    let file_layer = config.file_path.as_ref().map(|path| {
        let dir = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("stryx.log");
        let appender = RollingFileAppender::new(config.rotation.into(), dir, file_name);
        config.fmt_layer(appender, false)
    });

    let _ = tracing_subscriber::registry()
        .with(config.build_filter())
        .with(config.fmt_layer(std::io::stderr, true))
        .with(file_layer)
        .try_init();
}

/// Tracing layer used inside worker processes.
///
/// Every event at or above the configured level becomes a
/// [`WorkerMessage::Log`] on the worker's outgoing message channel.
pub struct WorkerLogLayer {
    sink: UnboundedSender<WorkerMessage>,
    level: Level,
    pid: u32,
}

impl WorkerLogLayer {
    pub fn new(sink: UnboundedSender<WorkerMessage>, level: Level) -> Self {
        Self {
            sink,
            level,
            pid: std::process::id(),
        }
    }
}

/// Collects the `message` field plus any structured fields of an event.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for WorkerLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // Level ordering in tracing: TRACE > DEBUG > ... > ERROR
        if *metadata.level() > self.level {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let record = LogRecord {
            level: metadata.level().to_string().to_lowercase(),
            category: metadata.target().to_string(),
            message: visitor.message + &visitor.fields,
            pid: self.pid,
            timestamp: chrono::Utc::now(),
        };
        // The parent may already be gone; nothing left to report to.
        let _ = self.sink.send(WorkerMessage::Log { record });
    }
}

/// Re-emit a log record received from a worker through the parent's subscriber.
pub fn forward_worker_log(record: &LogRecord) {
    let level = parse_level(&record.level).unwrap_or(Level::INFO);
    let LogRecord {
        category,
        message,
        pid,
        ..
    } = record;

    match level {
        Level::ERROR => tracing::error!(target: "stryx::worker", pid, category = %category, "{}", message),
        Level::WARN => tracing::warn!(target: "stryx::worker", pid, category = %category, "{}", message),
        Level::INFO => tracing::info!(target: "stryx::worker", pid, category = %category, "{}", message),
        Level::DEBUG => tracing::debug!(target: "stryx::worker", pid, category = %category, "{}", message),
        Level::TRACE => tracing::trace!(target: "stryx::worker", pid, category = %category, "{}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("full".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("invalid".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_log_rotation_from_str() {
        assert_eq!(
            "hourly".parse::<LogRotation>().unwrap(),
            LogRotation::Hourly
        );
        assert_eq!("never".parse::<LogRotation>().unwrap(), LogRotation::Never);
        assert!("weekly".parse::<LogRotation>().is_err());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("error"), Some(Level::ERROR));
        assert_eq!(parse_level("warning"), Some(Level::WARN));
        assert_eq!(parse_level("INFO"), Some(Level::INFO));
        assert_eq!(parse_level("trace"), Some(Level::TRACE));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_log_config_builder() {
        let config = LogConfig::new()
            .with_level(Level::DEBUG)
            .with_format(LogFormat::Json)
            .with_span_events(true)
            .with_file(PathBuf::from("/tmp/stryx.log"));

        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.span_events);
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/stryx.log")));
    }

    #[test]
    fn test_worker_layer_ships_records() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriber = tracing_subscriber::registry().with(WorkerLogLayer::new(tx, Level::INFO));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "stryx::fixture", tests = 3, "dry run finished");
            tracing::debug!("filtered out");
        });

        match rx.try_recv().unwrap() {
            WorkerMessage::Log { record } => {
                assert_eq!(record.level, "info");
                assert_eq!(record.category, "stryx::fixture");
                assert!(record.message.starts_with("dry run finished"));
                assert!(record.message.contains("tests=3"));
                assert_eq!(record.pid, std::process::id());
            }
            other => panic!("Expected Log message, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }
}
