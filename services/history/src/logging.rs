//! JSON tracing setup and the runtime log-level switch behind `/log`.

use crate::error::{HistoryError, Result};
use parking_lot::RwLock;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing_subscriber::{
    fmt as layer_fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

/// Level names accepted by the log administration interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }

    /// `tracing` has no level above error, so CRITICAL shares it.
    pub fn directive(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error | Self::Critical => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LogLevel {
    type Err = HistoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARNING" => Ok(Self::Warning),
            "ERROR" => Ok(Self::Error),
            "CRITICAL" => Ok(Self::Critical),
            _ => Err(HistoryError::invalid_parameter(
                "level",
                "Logging level must be DEBUG, INFO, WARNING, ERROR or CRITICAL!",
            )),
        }
    }
}

/// Handle to the installed filter plus the level name last applied.
#[derive(Clone)]
pub struct LogControl {
    handle: Option<reload::Handle<EnvFilter, Registry>>,
    current: Arc<RwLock<LogLevel>>,
}

impl LogControl {
    /// Tracks the level without a subscriber attached.
    pub fn detached(level: LogLevel) -> Self {
        Self {
            handle: None,
            current: Arc::new(RwLock::new(level)),
        }
    }

    pub fn level(&self) -> LogLevel {
        *self.current.read()
    }

    pub fn set_level(&self, level: LogLevel) -> Result<()> {
        if let Some(handle) = &self.handle {
            handle
                .reload(level_filter(level))
                .map_err(|e| HistoryError::Configuration(format!("log filter: {}", e)))?;
        }
        *self.current.write() = level;
        Ok(())
    }
}

/// Install the JSON subscriber at the configured level. `RUST_LOG` is not
/// consulted so that `/log` always reports the active level.
pub fn init_tracing(log_level: &str) -> LogControl {
    let level = initial_level(log_level);
    let (filter, handle) = reload::Layer::new(level_filter(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(layer_fmt::layer().json())
        .init();

    LogControl {
        handle: Some(handle),
        current: Arc::new(RwLock::new(level)),
    }
}

fn initial_level(log_level: &str) -> LogLevel {
    log_level.parse().unwrap_or(LogLevel::Info)
}

fn level_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::new(level.directive())
}
