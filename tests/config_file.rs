//! The shipped configuration file loads, validates and connects.

use scope_daq::config::{LogFormat, ScopeConfig};
use scope_daq::{logging, InstrumentRegistry};

fn shipped() -> ScopeConfig {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/scope-daq.toml");
    ScopeConfig::load_from(path).unwrap()
}

#[test]
fn test_shipped_config_validates() {
    let config = shipped();
    config.validate().unwrap();
    assert_eq!(config.logging.format, LogFormat::Pretty);
    assert_eq!(config.acquisition.max_pending, 16);
    let enabled: Vec<_> = config.enabled_instruments().map(|i| i.id.as_str()).collect();
    assert_eq!(enabled, vec!["sim-lecroy", "sim-tek"]);
}

#[tokio::test]
async fn test_shipped_instruments_connect() {
    let config = shipped();
    logging::init_from_config(&config).unwrap();

    let registry = InstrumentRegistry::new();
    assert_eq!(registry.connect_all(&config).await.unwrap(), 2);
    let tek = registry.get("sim-tek").unwrap();
    assert_eq!(tek.identity().model, "MSO64");
    assert!(tek.options().dvm);
    assert!(tek.channel_by_name("CH4").is_some());
}
