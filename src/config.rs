//! Application configuration using Figment.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults
//! 2. `scope-daq.toml` (or the path given with `--config`)
//! 3. Environment variables prefixed `SCOPE_DAQ_`, nested with `__`
//!    (`SCOPE_DAQ_LOGGING__LEVEL=debug`)
//!
//! # Example
//! ```no_run
//! use scope_daq::config::ScopeConfig;
//!
//! let config = ScopeConfig::load()?;
//! config.validate()?;
//! for instrument in config.enabled_instruments() {
//!     println!("{} -> {:?}", instrument.id, instrument.settings.get("host"));
//! }
//! # Ok::<(), scope_core::ScopeError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use scope_core::{ScopeError, ScopeResult};
use scope_drivers::{DriverFactory, ScopeDriverFactory};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Configuration file read when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "scope-daq.toml";

/// Environment prefix for overrides.
pub const ENV_PREFIX: &str = "SCOPE_DAQ_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub instruments: Vec<InstrumentDefinition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line with colours, for a terminal.
    #[default]
    Pretty,
    Compact,
    /// One JSON object per event.
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error; `RUST_LOG` takes precedence
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

/// Defaults shared by every instrument; an instrument table may override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Stop after each capture instead of re-arming.
    #[serde(default)]
    pub one_shot: bool,
    /// Captures held per instrument before the oldest is dropped.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    /// Download retries after a failed attempt.
    #[serde(default = "default_retries")]
    pub retries: usize,
    /// Delay between trigger polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            one_shot: false,
            max_pending: default_max_pending(),
            retries: default_retries(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

/// One `[[instruments]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentDefinition {
    /// Unique instrument identifier
    pub id: String,
    /// Factory that builds the driver
    #[serde(default = "default_type")]
    pub r#type: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Driver-specific fields, handed to the factory as a table.
    #[serde(flatten)]
    pub settings: toml::Table,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_max_pending() -> usize {
    scope_core::pending::DEFAULT_PENDING_DEPTH
}

fn default_retries() -> usize {
    3
}

fn default_poll_interval() -> u64 {
    10
}

fn default_type() -> String {
    "scope".to_string()
}

fn default_enabled() -> bool {
    true
}

impl ScopeConfig {
    /// Load from `scope-daq.toml` in the working directory and the environment.
    pub fn load() -> ScopeResult<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from a specific file. A missing file leaves the defaults in place.
    pub fn load_from<P: AsRef<Path>>(path: P) -> ScopeResult<Self> {
        Self::figment(path.as_ref())
            .extract()
            .map_err(|e| ScopeError::Config(e.to_string()))
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(ScopeConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Check what deserialisation cannot.
    pub fn validate(&self) -> ScopeResult<()> {
        let level = self.logging.level.to_ascii_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(ScopeError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                LOG_LEVELS.join(", ")
            )));
        }

        if self.acquisition.max_pending == 0 {
            return Err(ScopeError::Config(
                "acquisition.max_pending must be at least 1".to_string(),
            ));
        }

        let factory = ScopeDriverFactory;
        let mut ids = HashSet::new();
        for instrument in &self.instruments {
            if instrument.id.trim().is_empty() {
                return Err(ScopeError::Config("Instrument with empty id".to_string()));
            }
            if !ids.insert(instrument.id.as_str()) {
                return Err(ScopeError::Config(format!(
                    "Duplicate instrument ID: {}",
                    instrument.id
                )));
            }
            if instrument.r#type != factory.driver_type() {
                return Err(ScopeError::Config(format!(
                    "Instrument '{}': unknown type '{}'",
                    instrument.id, instrument.r#type
                )));
            }
            factory
                .validate(&self.driver_table(instrument))
                .map_err(|e| ScopeError::Config(format!("Instrument '{}': {:#}", instrument.id, e)))?;
        }
        Ok(())
    }

    pub fn enabled_instruments(&self) -> impl Iterator<Item = &InstrumentDefinition> {
        self.instruments.iter().filter(|i| i.enabled)
    }

    pub fn instrument(&self, id: &str) -> Option<&InstrumentDefinition> {
        self.instruments.iter().find(|i| i.id == id)
    }

    /// The table handed to the driver factory: the `[acquisition]` defaults
    /// overlaid with the instrument's own fields.
    pub fn driver_table(&self, instrument: &InstrumentDefinition) -> toml::Value {
        let acq = &self.acquisition;
        let mut table = toml::Table::new();
        table.insert("one_shot".into(), toml::Value::Boolean(acq.one_shot));
        table.insert(
            "queue_depth".into(),
            toml::Value::Integer(acq.max_pending as i64),
        );
        table.insert("retries".into(), toml::Value::Integer(acq.retries as i64));
        table.extend(instrument.settings.clone());
        toml::Value::Table(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(text: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    const SAMPLE: &str = r#"
[logging]
level = "debug"
format = "json"

[acquisition]
one_shot = true
max_pending = 4

[[instruments]]
id = "bench"
host = "192.168.1.50"
port = 1861
dedup = ["OFFSET"]

[[instruments]]
id = "sim"
transport = "mock"
mock_family = "tek"
enabled = false
"#;

    #[test]
    fn test_load_file() {
        let file = write_config(SAMPLE);
        let config = ScopeConfig::load_from(file.path()).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.instruments.len(), 2);
        assert_eq!(config.instruments[0].r#type, "scope");
        assert_eq!(
            config.instruments[0].settings.get("port"),
            Some(&toml::Value::Integer(1861))
        );
        assert_eq!(config.enabled_instruments().count(), 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = ScopeConfig::load_from("/nonexistent/scope-daq.toml").unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.acquisition.retries, 3);
        assert!(config.instruments.is_empty());
    }

    #[test]
    fn test_driver_table_overlays_acquisition() {
        let file = write_config(SAMPLE);
        let mut config = ScopeConfig::load_from(file.path()).unwrap();
        config.instruments[0]
            .settings
            .insert("retries".into(), toml::Value::Integer(7));

        let table = config.driver_table(&config.instruments[0]);
        assert_eq!(table.get("one_shot"), Some(&toml::Value::Boolean(true)));
        assert_eq!(table.get("queue_depth"), Some(&toml::Value::Integer(4)));
        assert_eq!(table.get("retries"), Some(&toml::Value::Integer(7)));
        assert_eq!(
            table.get("host").and_then(|v| v.as_str()),
            Some("192.168.1.50")
        );
    }

    #[test]
    fn test_validation_errors() {
        let config = ScopeConfig {
            logging: LoggingConfig {
                level: "verbose".into(),
                ..LoggingConfig::default()
            },
            ..ScopeConfig::default()
        };
        assert!(matches!(config.validate(), Err(ScopeError::Config(_))));

        let file = write_config(
            r#"
[[instruments]]
id = "a"
host = "scope-a"

[[instruments]]
id = "a"
host = "scope-b"
"#,
        );
        let config = ScopeConfig::load_from(file.path()).unwrap();
        assert!(matches!(config.validate(), Err(ScopeError::Config(m)) if m.contains("Duplicate")));

        let file = write_config("[[instruments]]\nid = \"a\"\nhost = \"\"\n");
        let config = ScopeConfig::load_from(file.path()).unwrap();
        assert!(config.validate().is_err());

        let file = write_config("[acquisition]\nmax_pending = 0\n");
        let config = ScopeConfig::load_from(file.path()).unwrap();
        assert!(config.validate().is_err());

        let file = write_config("[[instruments]]\nid = \"a\"\ntype = \"dmm\"\nhost = \"x\"\n");
        let config = ScopeConfig::load_from(file.path()).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("scope-daq.toml", "[logging]\nlevel = \"info\"\n")?;
            jail.set_env("SCOPE_DAQ_LOGGING__LEVEL", "warn");
            jail.set_env("SCOPE_DAQ_ACQUISITION__RETRIES", "5");
            let config = ScopeConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config.logging.level, "warn");
            assert_eq!(config.acquisition.retries, 5);
            Ok(())
        });
    }
}
