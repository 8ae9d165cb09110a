//! Logging configuration.
//!
//! The configuration accepts the level names of the original operator
//! tooling (panic, fatal, error, warn, info, debug, trace); `panic` and
//! `fatal` are mapped to the closest tracing level.

use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub level: LevelFilter,
}

#[derive(Debug, Error)]
pub enum LogSettingsError {
    #[error("unknown log level '{0}', expected one of panic, fatal, error, warn, info, debug or trace")]
    UnknownLevel(String),
    #[error("cannot install the log subscriber")]
    Init(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn parse_level(level: &str) -> Result<LevelFilter, LogSettingsError> {
    match level.trim().to_lowercase().as_str() {
        "panic" | "fatal" | "error" => Ok(LevelFilter::ERROR),
        "warn" => Ok(LevelFilter::WARN),
        "info" => Ok(LevelFilter::INFO),
        "debug" => Ok(LevelFilter::DEBUG),
        "trace" => Ok(LevelFilter::TRACE),
        other => Err(LogSettingsError::UnknownLevel(other.to_string())),
    }
}

impl LogSettings {
    pub fn from_config(level: Option<&str>) -> Result<Self, LogSettingsError> {
        let level = match level {
            Some(level) => parse_level(level)?,
            None => LevelFilter::INFO,
        };
        Ok(LogSettings { level })
    }

    /// Install the global subscriber. The returned guard must be kept
    /// alive for the process lifetime, dropping it stops the log writer.
    pub fn init(&self) -> Result<WorkerGuard, LogSettingsError> {
        let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(self.level)
            .with_writer(writer)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
        Ok(guard)
    }
}
