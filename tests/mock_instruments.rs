//! End-to-end tests against the simulated instruments.
//!
//! Each test goes through the same path as the binary: a TOML configuration
//! is validated, the registry builds the driver through the factory, and the
//! instrument is driven through the vendor-neutral `Oscilloscope` interface.

use scope_core::{FunctionGenerator, InstrumentTypes, MultimeterMode, ScopeError, WaveShape};
use scope_daq::{InstrumentRegistry, Oscilloscope, ScopeConfig, ScopeDriver, Waveform};
use scope_drivers::{EdgeSlope, Trigger};
use std::sync::Arc;
use std::time::Duration;

const CONFIG: &str = r#"
[acquisition]
max_pending = 4

[[instruments]]
id = "wavepro"
transport = "mock"
mock_family = "lecroy"
mock_options = "DVM,AWG"

[[instruments]]
id = "mso"
transport = "mock"
mock_family = "tek"
mock_model = "MSO58"
mock_options = "DVM,AFG"

[[instruments]]
id = "sds"
transport = "mock"
mock_family = "siglent"
"#;

async fn bench() -> (ScopeConfig, InstrumentRegistry) {
    let config: ScopeConfig = toml::from_str(CONFIG).unwrap();
    config.validate().unwrap();
    let registry = InstrumentRegistry::new();
    assert_eq!(registry.connect_all(&config).await.unwrap(), 3);
    (config, registry)
}

fn scope(registry: &InstrumentRegistry, id: &str) -> Arc<ScopeDriver> {
    registry.get(id).unwrap()
}

#[tokio::test]
async fn test_every_vendor_captures() {
    let (_, registry) = bench().await;
    for id in ["wavepro", "mso", "sds"] {
        let scope: Arc<dyn Oscilloscope> = scope(&registry, id);
        scope.start_single_trigger().await.unwrap();
        let mut delivered = false;
        for _ in 0..100 {
            if scope.acquire_data().await.unwrap() {
                delivered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(delivered, "{} never triggered", id);

        let set = scope.pop_pending().unwrap();
        let waveform = set.get(0).and_then(Waveform::as_analog).unwrap();
        assert!(!waveform.is_empty());
        assert!(waveform.timing.timescale > 0);
        assert!(waveform.samples.as_slice().iter().all(|v| v.is_finite()));
    }
}

#[tokio::test]
async fn test_queue_depth_from_acquisition_section() {
    let (_, registry) = bench().await;
    let scope = scope(&registry, "wavepro");
    scope.start().await.unwrap();
    for _ in 0..6 {
        assert!(scope.acquire_data().await.unwrap());
    }
    assert_eq!(scope.pending_count(), 4);
    assert_eq!(scope.dropped_waveform_count(), 2);

    // oldest dropped, delivery order preserved
    let mut last = None;
    while let Some(set) = scope.pop_pending() {
        let start = set.start_key();
        if let Some(previous) = last {
            assert!(start > previous);
        }
        last = Some(start);
    }
    scope.stop().await.unwrap();
}

#[tokio::test]
async fn test_capability_dispatch() {
    let (_, registry) = bench().await;
    let mso = scope(&registry, "mso");
    let types = mso.instrument_types();
    assert!(types.contains(InstrumentTypes::MULTIMETER | InstrumentTypes::SPECTRUM));

    let afg = mso.channel_by_name("AFG").unwrap();
    let generator = mso.function_generator(afg).unwrap();
    generator.set_shape(afg, WaveShape::Square).await.unwrap();
    generator.set_duty_cycle(afg, 0.25).await.unwrap();
    assert_eq!(generator.shape(afg).await.unwrap(), WaveShape::Square);
    assert!((generator.duty_cycle(afg).await.unwrap() - 0.25).abs() < 1e-9);
    assert!(generator.set_rise_time(afg, 1_000_000).await.is_err());

    let meter = mso.multimeter().unwrap();
    meter.set_meter_mode(MultimeterMode::AcRmsAmplitude).await.unwrap();
    meter.start_meter().await.unwrap();
    assert!(meter.meter_value().await.unwrap().is_finite());

    let sds = scope(&registry, "sds");
    assert!(matches!(sds.multimeter(), Err(ScopeError::Unsupported(_))));
    assert!(matches!(sds.spectrum(0), Err(ScopeError::Unsupported(_))));
}

#[tokio::test]
async fn test_snapshot_between_instruments() {
    let (config, registry) = bench().await;
    let source = scope(&registry, "wavepro");
    source.set_voltage_range(0, 2.0).await.unwrap();
    source
        .set_trigger(Trigger::edge(0, -0.1, EdgeSlope::Falling))
        .await
        .unwrap();
    let snapshot = source.pull_config().await.unwrap();

    let mut second = config.instruments[0].clone();
    second.id = "wavepro-2".into();
    let target = registry.connect(&config, &second).await.unwrap();
    target.push_config(&snapshot).await.unwrap();
    target.flush_config_cache().await.unwrap();

    assert!((target.voltage_range(0).await.unwrap() - 2.0).abs() < 1e-9);
    let trigger = target.pull_trigger().await.unwrap();
    assert_eq!(trigger.slope(), EdgeSlope::Falling);
    assert!((trigger.level() + 0.1).abs() < 1e-9);
}

#[tokio::test]
async fn test_background_loop_and_stop() {
    let (_, registry) = bench().await;
    let scope = scope(&registry, "sds");
    scope.start().await.unwrap();
    let handle = scope.spawn_acquisition_loop(Duration::from_millis(1));
    while scope.pending_count() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    handle.stop().await;
    scope.stop().await.unwrap();
    assert!(!scope.is_armed());
    assert_eq!(scope.pending_count(), 0);
}
