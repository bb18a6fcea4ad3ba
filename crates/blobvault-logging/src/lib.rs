//! Structured logging for blobvault
//!
//! Sets up the global `tracing` subscriber used by blobvault binaries and
//! tests. Storage crates only emit events through `tracing` macros; this
//! crate decides where those events go.
//!
//! # Features
//!
//! - **JSONL Output**: Structured JSON lines format for log aggregation (default)
//! - **Pretty Console**: Human-readable output for development
//! - **File Rotation**: Daily/hourly log rotation via tracing-appender
//! - **RUST_LOG**: Filter directives from the environment override the config
//!
//! # Quick Start
//!
//! ```ignore
//! use blobvault_logging::{LogConfig, SubscriberBuilder};
//!
//! // Simple setup with defaults (JSONL to console)
//! SubscriberBuilder::new().init();
//!
//! // Production: JSONL into rolling files; keep the guard alive
//! let _guard = SubscriberBuilder::new()
//!     .with_config(LogConfig::production("/var/log/blobvault"))
//!     .try_init()?;
//! ```

pub mod config;

pub use config::{
    ConsoleConfig, DEFAULT_DIRECTIVE, FileConfig, JsonlConfig, LogConfig, RotationStrategy,
};
pub use tracing_appender::non_blocking::WorkerGuard;

use std::fs::{self, File};

use thiserror::Error;
use tracing_appender::non_blocking::NonBlocking;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Errors raised while building or installing the subscriber
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid filter directive {directive:?}: {reason}")]
    InvalidFilter { directive: String, reason: String },

    #[error("Failed to open log file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to create rolling log appender: {0}")]
    Appender(#[from] InitError),

    #[error("Global subscriber already set: {0}")]
    AlreadyInitialized(#[from] TryInitError),
}

type Base = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<Base> + Send + Sync>;

/// Subscriber produced by [`SubscriberBuilder::build`]
pub type BlobvaultSubscriber = Layered<Vec<BoxedLayer>, Base>;

/// Builder for configuring and initializing the logging subscriber
///
/// By default, console output uses JSONL format. Use `LogConfig::development()`
/// for human-readable pretty output during development.
#[derive(Debug, Clone, Default)]
pub struct SubscriberBuilder {
    config: LogConfig,
    test_writer: bool,
}

impl SubscriberBuilder {
    /// Create a new subscriber builder with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific configuration
    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the default log level
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.default_level = level.into();
        self
    }

    /// Enable or disable console output
    pub fn with_console(mut self, enabled: bool) -> Self {
        self.config.console.enabled = enabled;
        self
    }

    /// Configure file output
    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    /// Route console output through the test harness so it is captured
    pub fn with_test_writer(mut self) -> Self {
        self.test_writer = true;
        self
    }

    /// The configuration that will be applied
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Build the subscriber without installing it
    ///
    /// The returned guard flushes the file writer when dropped and must be
    /// kept alive as long as the subscriber is in use.
    pub fn build(self) -> Result<(BlobvaultSubscriber, Option<WorkerGuard>), LoggingError> {
        let env_filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(&self.config.default_level).map_err(|e| {
                LoggingError::InvalidFilter {
                    directive: self.config.default_level.clone(),
                    reason: e.to_string(),
                }
            })?,
        };

        let mut layers: Vec<BoxedLayer> = Vec::new();
        let mut guard = None;

        if self.config.console.enabled {
            layers.push(self.console_layer()?);
        }

        if let Some(file_config) = &self.config.file {
            let (writer, file_guard) = file_writer(file_config)?;
            guard = Some(file_guard);
            layers.push(json_layer(&self.config.jsonl).with_writer(writer).boxed());
        }

        let subscriber = Registry::default().with(env_filter).with(layers);
        Ok((subscriber, guard))
    }

    /// Initialize the subscriber globally
    ///
    /// Returns an error if the configuration is unusable or a global
    /// subscriber has already been set.
    pub fn try_init(self) -> Result<Option<WorkerGuard>, LoggingError> {
        let (subscriber, guard) = self.build()?;
        subscriber.try_init()?;
        Ok(guard)
    }

    /// Initialize the subscriber globally, reporting failure on stderr
    pub fn init(self) -> Option<WorkerGuard> {
        match self.try_init() {
            Ok(guard) => guard,
            Err(e) => {
                eprintln!("Warning: Failed to initialize logging: {}", e);
                None
            }
        }
    }

    fn console_layer(&self) -> Result<BoxedLayer, LoggingError> {
        let console = &self.config.console;
        let level = match &console.level {
            Some(level) => level
                .parse::<LevelFilter>()
                .map_err(|e| LoggingError::InvalidFilter {
                    directive: level.clone(),
                    reason: e.to_string(),
                })?,
            None => LevelFilter::TRACE,
        };

        // Separate arms because each writer/format combination is its own type
        let layer: BoxedLayer = match (console.pretty, self.test_writer) {
            (true, true) => tracing_subscriber::fmt::layer()
                .with_ansi(console.ansi)
                .with_target(true)
                .with_test_writer()
                .with_filter(level)
                .boxed(),
            (true, false) => tracing_subscriber::fmt::layer()
                .with_ansi(console.ansi)
                .with_target(true)
                .with_filter(level)
                .boxed(),
            (false, true) => json_layer(&self.config.jsonl)
                .with_test_writer()
                .with_filter(level)
                .boxed(),
            (false, false) => json_layer(&self.config.jsonl).with_filter(level).boxed(),
        };
        Ok(layer)
    }
}

fn json_layer<S>(
    jsonl: &JsonlConfig,
) -> tracing_subscriber::fmt::Layer<
    S,
    tracing_subscriber::fmt::format::JsonFields,
    tracing_subscriber::fmt::format::Format<tracing_subscriber::fmt::format::Json>,
> {
    tracing_subscriber::fmt::layer()
        .json()
        .with_ansi(false)
        .with_current_span(jsonl.include_current_span)
        .with_span_list(jsonl.include_spans)
        .flatten_event(jsonl.flatten_events)
        .with_file(jsonl.include_location)
        .with_line_number(jsonl.include_location)
        .with_thread_ids(jsonl.include_thread_info)
        .with_thread_names(jsonl.include_thread_info)
}

/// Create the file writer; truncates for `Never` rotation, appends otherwise
fn file_writer(config: &FileConfig) -> Result<(NonBlocking, WorkerGuard), LoggingError> {
    fs::create_dir_all(&config.directory)?;

    let rotation = match config.rotation {
        RotationStrategy::Never => {
            let file = File::create(config.directory.join(format!("{}.log", config.prefix)))?;
            return Ok(tracing_appender::non_blocking(file));
        }
        RotationStrategy::Daily => Rotation::DAILY,
        RotationStrategy::Hourly => Rotation::HOURLY,
    };

    let mut builder = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(config.prefix.as_str())
        .filename_suffix("log");
    if let Some(max_files) = config.max_files {
        builder = builder.max_log_files(max_files);
    }
    let appender = builder.build(&config.directory)?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Initialize logging with default settings (JSONL to console)
///
/// This is a convenience function for quick setup.
pub fn init_default() {
    SubscriberBuilder::new().init();
}

/// Initialize logging for development (verbose, pretty console output)
pub fn init_development() {
    SubscriberBuilder::new()
        .with_config(LogConfig::development())
        .init();
}

/// Initialize logging for testing (minimal output)
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_testing() {
    let _ = SubscriberBuilder::new()
        .with_config(LogConfig::testing())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_creation() {
        let builder = SubscriberBuilder::new();
        assert_eq!(builder.config().default_level, "info");
    }

    #[test]
    fn test_default_is_jsonl() {
        let builder = SubscriberBuilder::new();
        assert!(!builder.config().console.pretty); // JSONL by default
    }

    #[test]
    fn test_builder_with_config() {
        let builder = SubscriberBuilder::new().with_config(LogConfig::development());
        assert_eq!(builder.config().default_level, "info,blobvault_storage=debug");
        assert!(builder.config().console.pretty); // Development uses pretty
    }

    #[test]
    fn test_builder_with_level() {
        let builder = SubscriberBuilder::new().with_level("trace");
        assert_eq!(builder.config().default_level, "trace");
    }

    #[test]
    fn test_builder_with_console() {
        let builder = SubscriberBuilder::new().with_console(false);
        assert!(!builder.config().console.enabled);
    }

    #[test]
    fn test_invalid_console_level_rejected() {
        let mut config = LogConfig::default();
        config.console.level = Some("loud".to_string());

        let Err(err) = SubscriberBuilder::new().with_config(config).build() else {
            panic!("console level should be rejected");
        };
        assert!(matches!(err, LoggingError::InvalidFilter { directive, .. } if directive == "loud"));
    }

    #[test]
    fn test_file_output_writes_jsonl() {
        let dir = tempfile::TempDir::new().unwrap();
        let (subscriber, guard) = SubscriberBuilder::new()
            .with_console(false)
            .with_file_output(
                FileConfig::new(dir.path())
                    .with_prefix("index")
                    .with_rotation(RotationStrategy::Never),
            )
            .build()
            .unwrap();

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(blob_id = "sha1:aaa", "Marker write retried");
        });
        // Dropping the guard flushes the background writer
        drop(guard);

        let contents = std::fs::read_to_string(dir.path().join("index.log")).unwrap();
        let line = contents.lines().next().unwrap();
        assert!(line.starts_with('{'));
        assert!(line.contains("Marker write retried"));
        assert!(line.contains("sha1:aaa"));
    }

    #[test]
    fn test_rolling_file_output_builds() {
        let dir = tempfile::TempDir::new().unwrap();
        let (_subscriber, guard) = SubscriberBuilder::new()
            .with_config(LogConfig::production(dir.path().join("logs")))
            .build()
            .unwrap();

        assert!(guard.is_some());
        assert!(dir.path().join("logs").is_dir());
    }
}
