//! Telemetry and logging infrastructure
//!
//! Structured logging with tracing for sinks, players and content.

pub mod logging;

pub use logging::{init_logging, init_logging_default, LogConfig, LogGuard};
