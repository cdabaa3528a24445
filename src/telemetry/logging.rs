//! Logging configuration and initialization
//!
//! Console output (compact or JSON) and optional file output through a
//! non-blocking appender.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::error::MediaError;

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "IMMERSIVE_MEDIA_LOG";
/// Environment variable selecting the output format ("json")
pub const LOG_FORMAT_ENV: &str = "IMMERSIVE_MEDIA_LOG_FORMAT";

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Enable console output (default: true)
    pub console_enabled: bool,
    /// Enable file logging (default: false)
    pub file_enabled: bool,
    /// Log file path (default: `media_bridge.log` in the working directory)
    pub file_path: Option<PathBuf>,
    /// Use JSON format for console logs (default: false)
    pub json_format: bool,
    /// Filter used when neither environment variable is set (default: "info")
    pub default_level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enabled: true,
            file_enabled: false,
            file_path: None,
            json_format: false,
            default_level: "info".to_string(),
        }
    }
}

impl LogConfig {
    /// JSON output if requested through the environment, else the configured value
    fn wants_json(&self) -> bool {
        std::env::var(LOG_FORMAT_ENV)
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(self.json_format)
    }

    fn log_path(&self) -> PathBuf {
        self.file_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("media_bridge.log"))
    }
}

/// `IMMERSIVE_MEDIA_LOG`, then `RUST_LOG`, then the configured default
fn build_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new(&config.default_level))
}

/// Initialize the global subscriber
///
/// Returns the file writer guard when file logging is enabled; keep it
/// alive for as long as logs should be flushed.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>, MediaError> {
    let use_json = config.wants_json();
    let registry = tracing_subscriber::registry().with(build_filter(config));

    let mut guard = None;
    let result = if config.file_enabled {
        let path = config.log_path();
        let file = std::fs::File::create(&path)?;
        let (writer, file_guard) = tracing_appender::non_blocking(file);
        guard = Some(file_guard);

        let file_layer = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false);

        if config.console_enabled {
            registry
                .with(file_layer)
                .with(fmt::layer().with_target(true).compact())
                .try_init()
        } else {
            registry.with(file_layer).try_init()
        }
    } else if config.console_enabled && use_json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
    } else if config.console_enabled {
        registry
            .with(fmt::layer().with_target(true).with_thread_names(true).compact())
            .try_init()
    } else {
        registry.try_init()
    };

    result.map_err(|e| MediaError::Config(format!("logging already initialized: {}", e)))?;

    tracing::info!(
        target: "immersive_media_bridge",
        version = env!("CARGO_PKG_VERSION"),
        json_format = use_json,
        file_enabled = config.file_enabled,
        "Logging initialized"
    );

    Ok(guard)
}

/// Initialize logging with the default configuration
pub fn init_logging_default() -> Result<Option<WorkerGuard>, MediaError> {
    init_logging(&LogConfig::default())
}

pub use tracing_appender::non_blocking::WorkerGuard as LogGuard;
