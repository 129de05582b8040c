//! Instrument registry.
//!
//! Holds the driver factories by `type` and the connected instruments by id.
//! Instruments are built from [`ScopeConfig`] entries through their factory,
//! which validates the table before any connection is attempted.

use crate::config::{InstrumentDefinition, ScopeConfig};
use parking_lot::RwLock;
use scope_core::{ScopeError, ScopeResult};
use scope_drivers::{DriverFactory, ScopeDriver, ScopeDriverFactory};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub struct InstrumentRegistry {
    factories: RwLock<HashMap<String, Arc<dyn DriverFactory>>>,
    instruments: RwLock<BTreeMap<String, Arc<ScopeDriver>>>,
}

impl Default for InstrumentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InstrumentRegistry {
    /// A registry with the oscilloscope factory installed.
    pub fn new() -> Self {
        let registry = Self::empty();
        registry.register_factory(Arc::new(ScopeDriverFactory));
        registry
    }

    pub fn empty() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            instruments: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a factory, returning the one it replaces.
    pub fn register_factory(
        &self,
        factory: Arc<dyn DriverFactory>,
    ) -> Option<Arc<dyn DriverFactory>> {
        let driver_type = factory.driver_type().to_string();
        tracing::info!(driver_type = %driver_type, name = %factory.name(), "Registering driver factory");
        self.factories.write().insert(driver_type, factory)
    }

    pub fn has_factory(&self, driver_type: &str) -> bool {
        self.factories.read().contains_key(driver_type)
    }

    /// Validate and build one instrument, then register it under its id.
    pub async fn connect(
        &self,
        config: &ScopeConfig,
        instrument: &InstrumentDefinition,
    ) -> ScopeResult<Arc<ScopeDriver>> {
        if self.instruments.read().contains_key(&instrument.id) {
            return Err(ScopeError::Config(format!(
                "Instrument '{}' is already registered",
                instrument.id
            )));
        }

        let factory = self
            .factories
            .read()
            .get(&instrument.r#type)
            .cloned()
            .ok_or_else(|| {
                ScopeError::Config(format!(
                    "No factory registered for type '{}'",
                    instrument.r#type
                ))
            })?;

        let table = config.driver_table(instrument);
        factory
            .validate(&table)
            .map_err(|e| ScopeError::Config(format!("Instrument '{}': {:#}", instrument.id, e)))?;

        // build errors are reported as transport failures: the table was valid
        let driver = factory
            .build(table)
            .await
            .map_err(|e| ScopeError::Transport(format!("{}: {:#}", instrument.id, e)))?;

        tracing::info!(id = %instrument.id, model = %driver.identity().model, "Instrument registered");
        self.instruments
            .write()
            .insert(instrument.id.clone(), driver.clone());
        Ok(driver)
    }

    /// Connect every enabled instrument, stopping at the first failure.
    pub async fn connect_all(&self, config: &ScopeConfig) -> ScopeResult<usize> {
        let mut count = 0;
        for instrument in config.enabled_instruments() {
            self.connect(config, instrument).await?;
            count += 1;
        }
        Ok(count)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ScopeDriver>> {
        self.instruments.read().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.instruments.read().keys().cloned().collect()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<ScopeDriver>> {
        self.instruments.write().remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(text: &str) -> ScopeConfig {
        toml::from_str(text).unwrap()
    }

    #[tokio::test]
    async fn test_connect_mock_instruments() {
        let config = config(
            r#"
[[instruments]]
id = "wr"
transport = "mock"
mock_family = "lecroy"

[[instruments]]
id = "mso"
transport = "mock"
mock_family = "tek"

[[instruments]]
id = "off"
transport = "mock"
enabled = false
"#,
        );
        let registry = InstrumentRegistry::new();
        assert_eq!(registry.connect_all(&config).await.unwrap(), 2);
        assert_eq!(registry.ids(), vec!["mso".to_string(), "wr".to_string()]);
        assert!(registry.get("off").is_none());

        let again = registry.connect(&config, &config.instruments[0]).await;
        assert!(matches!(again, Err(ScopeError::Config(_))));
    }

    #[tokio::test]
    async fn test_unknown_type() {
        let config = config("[[instruments]]\nid = \"x\"\ntype = \"dmm\"\n");
        let registry = InstrumentRegistry::new();
        assert!(!registry.has_factory("dmm"));
        assert!(registry
            .connect(&config, &config.instruments[0])
            .await
            .is_err());
    }
}
