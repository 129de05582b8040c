//! Construction of drivers from configuration tables.
//!
//! Each `[[instruments]]` table in `scope-daq.toml` is handed to a
//! [`DriverFactory`] as a `toml::Value`. The factory checks it up front with
//! [`DriverFactory::validate`] so that configuration mistakes are reported
//! before any socket is opened, then [`DriverFactory::build`] connects.
//!
//! ```toml
//! [[instruments]]
//! id = "bench"
//! host = "192.168.1.50"
//! port = 1861
//! rate_limit_ms = 5
//! dedup = ["OFFSET"]
//!
//! [[instruments]]
//! id = "sim"
//! transport = "mock"
//! mock_family = "tek"
//! mock_options = "DVM,AFG"
//! ```

use crate::driver::{DriverSettings, ScopeDriver};
use crate::sim::lecroy::LeCroySim;
use crate::sim::siglent::SiglentSim;
use crate::sim::tek::TekSim;
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use scope_core::pending::DEFAULT_PENDING_DEPTH;
use scope_core::Transport;
use scope_scpi::tcp::{DEFAULT_PORT, DEFAULT_TIMEOUT_MS};
use scope_scpi::{MockTransport, TcpTransport};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    /// A simulated instrument in-process.
    Mock,
}

/// Which simulator backs a mock connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MockFamily {
    #[default]
    LeCroy,
    Tek,
    Siglent,
}

impl MockFamily {
    fn default_model(self) -> &'static str {
        match self {
            MockFamily::LeCroy => "WAVERUNNER9254M",
            MockFamily::Tek => "MSO64",
            MockFamily::Siglent => "SDS2104X Plus",
        }
    }
}

/// One instrument's connection table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeDriverConfig {
    /// Hostname or IP address; unused for mock connections.
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub transport: TransportKind,

    #[serde(default)]
    pub mock_family: MockFamily,

    /// Model string the simulator reports; defaults per family.
    #[serde(default)]
    pub mock_model: Option<String>,

    /// `*OPT?` reply of the simulator (LeCroy and Tek only).
    #[serde(default)]
    pub mock_options: String,

    /// Minimum write spacing; absent uses the family default.
    #[serde(default)]
    pub rate_limit_ms: Option<u64>,

    #[serde(default)]
    pub size_workaround: bool,

    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Command headers whose repeated writes collapse to the last one.
    #[serde(default)]
    pub dedup: Vec<String>,

    #[serde(default)]
    pub one_shot: bool,

    #[serde(default = "default_retries")]
    pub retries: usize,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_queue_depth() -> usize {
    DEFAULT_PENDING_DEPTH
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_retries() -> usize {
    3
}

impl ScopeDriverConfig {
    /// A mock connection with defaults everywhere else.
    pub fn mock(family: MockFamily) -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            transport: TransportKind::Mock,
            mock_family: family,
            mock_model: None,
            mock_options: String::new(),
            rate_limit_ms: None,
            size_workaround: false,
            queue_depth: default_queue_depth(),
            timeout_ms: default_timeout_ms(),
            dedup: Vec::new(),
            one_shot: false,
            retries: default_retries(),
        }
    }

    pub fn settings(&self) -> DriverSettings {
        DriverSettings {
            size_workaround: self.size_workaround,
            one_shot: self.one_shot,
            retries: self.retries,
            queue_depth: self.queue_depth,
            rate_limit: self.rate_limit_ms.map(Duration::from_millis),
            dedup: self.dedup.clone(),
        }
    }

    /// Check the fields that serde cannot.
    pub fn check(&self) -> Result<()> {
        if self.transport == TransportKind::Tcp {
            if self.host.trim().is_empty() {
                anyhow::bail!("'host' field cannot be empty");
            }
            if self.port == 0 {
                anyhow::bail!("'port' field cannot be 0");
            }
        }
        if self.queue_depth == 0 {
            anyhow::bail!("'queue_depth' must be at least 1");
        }
        if self.timeout_ms == 0 {
            anyhow::bail!("'timeout_ms' must be at least 1");
        }
        if let Some(header) = self.dedup.iter().find(|h| h.trim().is_empty()) {
            anyhow::bail!("'dedup' contains an empty header ({:?})", header);
        }
        Ok(())
    }

    async fn open_transport(&self) -> Result<Box<dyn Transport>> {
        match self.transport {
            TransportKind::Tcp => {
                let mut transport = TcpTransport::connect(&self.host, self.port)
                    .await
                    .with_context(|| format!("Failed to reach {}:{}", self.host, self.port))?;
                transport.set_timeout(Duration::from_millis(self.timeout_ms));
                Ok(Box::new(transport))
            }
            TransportKind::Mock => {
                let model = self
                    .mock_model
                    .as_deref()
                    .unwrap_or_else(|| self.mock_family.default_model());
                let transport = match self.mock_family {
                    MockFamily::LeCroy => {
                        MockTransport::new(LeCroySim::new(model, &self.mock_options))
                    }
                    MockFamily::Tek => MockTransport::new(TekSim::new(model, &self.mock_options)),
                    MockFamily::Siglent => MockTransport::new(
                        SiglentSim::new(model).with_options(&self.mock_options),
                    ),
                };
                Ok(Box::new(transport))
            }
        }
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Builds drivers from their TOML tables.
///
/// Factories are registered once at startup and live for the program's
/// lifetime, so they must not hold mutable state across builds.
pub trait DriverFactory: Send + Sync + 'static {
    /// Value of the `type` field that selects this factory.
    fn driver_type(&self) -> &'static str;

    /// Human-readable name for error messages.
    fn name(&self) -> &'static str;

    /// Validate configuration without connecting.
    ///
    /// # Arguments
    ///
    /// * `config` - one `[[instruments]]` table
    ///
    /// # Returns
    ///
    /// - `Ok(())` if the table is usable
    /// - `Err` naming the offending field otherwise
    fn validate(&self, config: &toml::Value) -> Result<()>;

    /// Connect and identify the instrument.
    ///
    /// # Returns
    ///
    /// - `Ok(driver)` once the instrument has answered `*IDN?` and the
    ///   channel table is built
    /// - `Err` if the table is invalid or the instrument cannot be reached
    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<Arc<ScopeDriver>>>;
}

/// Factory for every supported oscilloscope family.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScopeDriverFactory;

impl DriverFactory for ScopeDriverFactory {
    fn driver_type(&self) -> &'static str {
        "scope"
    }

    fn name(&self) -> &'static str {
        "LeCroy / Tektronix / Siglent Oscilloscope"
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: ScopeDriverConfig = config
            .clone()
            .try_into()
            .context("Invalid oscilloscope config")?;
        cfg.check()
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<Arc<ScopeDriver>>> {
        Box::pin(async move {
            let cfg: ScopeDriverConfig =
                config.try_into().context("Invalid oscilloscope config")?;
            cfg.check()?;

            let transport = cfg.open_transport().await?;
            let driver = ScopeDriver::connect(transport, cfg.settings())
                .await
                .context("Instrument did not identify")?;

            tracing::info!(
                family = %driver.family(),
                model = %driver.identity().model,
                transport = driver.transport_name(),
                "Oscilloscope ready"
            );
            Ok(Arc::new(driver))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::Vendor;

    fn table(text: &str) -> toml::Value {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cfg: ScopeDriverConfig = table("host = \"10.0.0.2\"").try_into().unwrap();
        assert_eq!(cfg.port, 5025);
        assert_eq!(cfg.transport, TransportKind::Tcp);
        assert_eq!(cfg.queue_depth, DEFAULT_PENDING_DEPTH);
        assert_eq!(cfg.settings().retries, 3);
        assert!(cfg.settings().rate_limit.is_none());
    }

    #[test]
    fn test_validate_rejects_bad_tables() {
        let factory = ScopeDriverFactory;
        assert!(factory.validate(&table("host = \"\"")).is_err());
        assert!(factory
            .validate(&table("host = \"scope\"\nport = 0"))
            .is_err());
        assert!(factory
            .validate(&table("host = \"scope\"\nqueue_depth = 0"))
            .is_err());
        assert!(factory
            .validate(&table("transport = \"serial\""))
            .is_err());
    }

    #[test]
    fn test_validate_accepts_mock_without_host() {
        let factory = ScopeDriverFactory;
        factory
            .validate(&table("transport = \"mock\"\nmock_family = \"tek\""))
            .unwrap();
    }

    #[tokio::test]
    async fn test_build_mock_per_vendor() {
        let factory = ScopeDriverFactory;
        for (family, vendor) in [
            ("lecroy", Vendor::LeCroy),
            ("tek", Vendor::Tektronix),
            ("siglent", Vendor::Siglent),
        ] {
            let text = format!("transport = \"mock\"\nmock_family = \"{}\"", family);
            let driver = factory.build(table(&text)).await.unwrap();
            assert_eq!(driver.vendor(), vendor);
            assert!(driver.analog_count() >= 2);
        }
    }

    #[tokio::test]
    async fn test_build_applies_settings() {
        let text = "transport = \"mock\"\nmock_family = \"tek\"\nmock_options = \"DVM\"\n\
                    one_shot = true\nretries = 1\nrate_limit_ms = 2";
        let driver = ScopeDriverFactory.build(table(text)).await.unwrap();
        assert!(driver.options().dvm);
        assert!(driver.settings().one_shot);
        assert_eq!(driver.settings().retries, 1);
        assert_eq!(driver.settings().rate_limit, Some(Duration::from_millis(2)));
    }
}
