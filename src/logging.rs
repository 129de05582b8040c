//! Tracing setup for the `scope-daq` binary.
//!
//! `RUST_LOG` always wins over the configured level, so
//! `RUST_LOG=scope_scpi=trace` shows every command on the wire without
//! editing the configuration file.
//!
//! # Example
//! ```no_run
//! use scope_daq::{config::ScopeConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ScopeConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!("Application started");
//! # Ok(())
//! # }
//! ```

use crate::config::{LogFormat, ScopeConfig};
use scope_core::{ScopeError, ScopeResult};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: Level,
    pub format: LogFormat,
    /// Emit span open/close events (shows each acquisition pass).
    pub with_span_events: bool,
    pub with_file_and_line: bool,
    /// Colours, pretty format only.
    pub with_ansi: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_ansi: true,
        }
    }
}

impl LoggingSettings {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn from_config(config: &ScopeConfig) -> ScopeResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.logging.level)?,
            format: config.logging.format,
            ..Default::default()
        })
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }
}

pub fn init_from_config(config: &ScopeConfig) -> ScopeResult<()> {
    init(LoggingSettings::from_config(config)?)
}

/// Install the global subscriber.
///
/// Idempotent: a second call, or a call after a test harness has installed
/// its own subscriber, returns `Ok(())`.
pub fn init(settings: LoggingSettings) -> ScopeResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.as_str().to_ascii_lowercase()));

    let span_events = if settings.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = match settings.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_file(settings.with_file_and_line)
            .with_line_number(settings.with_file_and_line)
            .with_ansi(settings.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_file(settings.with_file_and_line)
            .with_line_number(settings.with_file_and_line)
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_file(settings.with_file_and_line)
            .with_line_number(settings.with_file_and_line)
            .with_filter(env_filter)
            .boxed(),
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        // already set: expected in tests and when embedded
        Err(e) if e.to_string().contains("already been set") => Ok(()),
        Err(e) => Err(ScopeError::Config(format!(
            "Failed to initialize tracing: {}",
            e
        ))),
    }
}

fn parse_log_level(level: &str) -> ScopeResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(ScopeError::Config(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("WARN"), Ok(Level::WARN)));
        assert!(matches!(parse_log_level("Debug"), Ok(Level::DEBUG)));
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_from_config() {
        let mut config = ScopeConfig::default();
        config.logging.level = "error".into();
        config.logging.format = LogFormat::Compact;
        let settings = LoggingSettings::from_config(&config).unwrap();
        assert!(matches!(settings.level, Level::ERROR));
        assert_eq!(settings.format, LogFormat::Compact);
    }

    #[test]
    fn test_init_twice() {
        let settings = LoggingSettings::new(Level::WARN).with_format(LogFormat::Compact);
        init(settings.clone()).unwrap();
        init(settings.with_format(LogFormat::Json)).unwrap();
    }
}
