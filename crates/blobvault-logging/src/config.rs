//! Logging configuration
//!
//! A [`LogConfig`] is plain data: it can be built from a preset, tweaked in
//! code, or read from the `[logging]` table of a TOML file.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Filter directive used when neither the config nor RUST_LOG names one
pub const DEFAULT_DIRECTIVE: &str = "info";

/// Where log events go and how they are formatted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// EnvFilter directive, e.g. `"warn,blobvault_storage=debug"`.
    /// RUST_LOG wins when set.
    pub default_level: String,

    pub console: ConsoleConfig,

    /// Rolling JSONL files; `None` keeps logs on the console only
    pub file: Option<FileConfig>,

    /// Field layout shared by every JSONL writer
    pub jsonl: JsonlConfig,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: DEFAULT_DIRECTIVE.to_string(),
            console: ConsoleConfig::default(),
            file: None,
            jsonl: JsonlConfig::default(),
        }
    }
}

impl LogConfig {
    /// Pretty console output with storage internals at debug
    pub fn development() -> Self {
        Self {
            default_level: "info,blobvault_storage=debug".to_string(),
            console: ConsoleConfig::pretty(None),
            ..Default::default()
        }
    }

    /// Long-running collector: JSONL files under `log_dir`, no console
    ///
    /// Keeps a month of daily files and silences redb below warn.
    pub fn production(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            default_level: "info,redb=warn".to_string(),
            console: ConsoleConfig::disabled(),
            file: Some(FileConfig {
                max_files: Some(30),
                ..FileConfig::new(log_dir)
            }),
            jsonl: JsonlConfig::default(),
        }
    }

    /// Warnings only, uncolored so captured test output stays readable
    pub fn testing() -> Self {
        Self {
            default_level: "warn".to_string(),
            console: ConsoleConfig {
                ansi: false,
                ..ConsoleConfig::pretty(Some("warn"))
            },
            ..Default::default()
        }
    }

    /// Parse a config from TOML; missing fields take their defaults
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }
}

/// Console sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,
    /// Human-readable lines instead of JSONL
    pub pretty: bool,
    pub ansi: bool,
    /// Extra level cap for the console only, on top of `default_level`
    pub level: Option<String>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pretty: false,
            ansi: false,
            level: None,
        }
    }
}

impl ConsoleConfig {
    /// Colored human-readable output, optionally capped at `level`
    pub fn pretty(level: Option<&str>) -> Self {
        Self {
            enabled: true,
            pretty: true,
            ansi: true,
            level: level.map(str::to_string),
        }
    }

    /// No console sink at all
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Rolling file sink; always written as JSONL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub directory: PathBuf,
    /// Files are named `<prefix>.<date>.log`, or `<prefix>.log` without rotation
    pub prefix: String,
    pub rotation: RotationStrategy,
    /// Oldest rotated files beyond this count are deleted
    pub max_files: Option<usize>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./logs"),
            prefix: "blobvault".to_string(),
            rotation: RotationStrategy::Daily,
            max_files: Some(7),
        }
    }
}

impl FileConfig {
    /// File output into `directory` with default naming and rotation
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Default::default()
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_rotation(mut self, rotation: RotationStrategy) -> Self {
        self.rotation = rotation;
        self
    }
}

/// How often a new log file is started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RotationStrategy {
    #[default]
    Daily,
    Hourly,
    /// One file, truncated when logging starts
    Never,
}

/// Which fields each JSONL line carries
///
/// Index operations run on many threads at once and carry the blob id in
/// their span, so thread ids and span fields are on by default. Source
/// locations are off; the event target already names the module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonlConfig {
    /// Put event fields at the top level instead of under `fields`
    pub flatten_events: bool,
    /// Every enclosing span, outermost first
    pub include_spans: bool,
    /// The innermost span, e.g. the `add`/`remove` call and its blob id
    pub include_current_span: bool,
    pub include_thread_info: bool,
    pub include_location: bool,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            flatten_events: true,
            include_spans: false,
            include_current_span: true,
            include_thread_info: true,
            include_location: false,
        }
    }
}
