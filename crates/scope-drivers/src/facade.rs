//! Vendor-neutral instrument interface.
//!
//! [`Oscilloscope`] is what applications program against. The instrument
//! advertises a bitmask of [`InstrumentTypes`] and each channel the subset
//! that applies to it; secondary modes are reached through the capability
//! accessors, which refuse with [`ScopeError::Unsupported`] when the
//! instrument or the addressed channel lacks them.

use crate::acquisition::TriggerStatus;
use crate::channel::Channel;
use crate::driver::ScopeDriver;
use crate::probe::Coupling;
use crate::snapshot::InstrumentConfig;
use crate::trigger::Trigger;
use async_trait::async_trait;
use scope_core::{
    FunctionGenerator, InstrumentTypes, Multimeter, ScopeError, ScopeResult, SequenceSet,
    SpectrumAnalyzer,
};

/// An oscilloscope, addressed by channel index.
#[async_trait]
pub trait Oscilloscope: Send + Sync {
    /// Everything the instrument can act as.
    fn instrument_types(&self) -> InstrumentTypes;

    /// Capabilities of one channel; empty for an unknown index.
    fn channel_types(&self, channel: usize) -> InstrumentTypes;

    fn channel_count(&self) -> usize;

    fn channel(&self, channel: usize) -> Option<Channel>;

    async fn is_channel_enabled(&self, channel: usize) -> ScopeResult<bool>;

    /// Enable or disable a channel for capture.
    ///
    /// The change reaches the instrument with the next arm; the capture in
    /// progress still reflects the old set of channels.
    async fn set_channel_enabled(&self, channel: usize, on: bool) -> ScopeResult<()>;

    async fn coupling(&self, channel: usize) -> ScopeResult<Coupling>;
    async fn set_coupling(&self, channel: usize, coupling: Coupling) -> ScopeResult<()>;

    /// Full-scale vertical range in volts.
    async fn voltage_range(&self, channel: usize) -> ScopeResult<f64>;
    async fn set_voltage_range(&self, channel: usize, volts: f64) -> ScopeResult<()>;

    async fn channel_offset(&self, channel: usize) -> ScopeResult<f64>;
    async fn set_channel_offset(&self, channel: usize, volts: f64) -> ScopeResult<()>;

    async fn sample_rate(&self) -> ScopeResult<u64>;
    async fn set_sample_rate(&self, rate: u64) -> ScopeResult<()>;
    async fn sample_depth(&self) -> ScopeResult<u64>;
    async fn set_sample_depth(&self, depth: u64) -> ScopeResult<()>;

    async fn start(&self) -> ScopeResult<()>;
    async fn start_single_trigger(&self) -> ScopeResult<()>;
    async fn force_trigger(&self) -> ScopeResult<()>;
    async fn stop(&self) -> ScopeResult<()>;
    fn is_armed(&self) -> bool;

    async fn poll_trigger(&self) -> ScopeResult<TriggerStatus>;

    /// One pass of poll, download and decode.
    ///
    /// # Returns
    /// - `Ok(true)` if a capture was queued for [`Oscilloscope::pop_pending`]
    /// - `Ok(false)` if the trigger has not fired
    /// - `Err` once retries are exhausted; the instrument is then disarmed
    async fn acquire_data(&self) -> ScopeResult<bool>;

    /// Oldest undelivered capture.
    fn pop_pending(&self) -> Option<SequenceSet>;

    async fn set_trigger(&self, trigger: Trigger) -> ScopeResult<()>;
    async fn trigger(&self) -> ScopeResult<Trigger>;

    async fn push_config(&self, config: &InstrumentConfig) -> ScopeResult<()>;
    async fn pull_config(&self) -> ScopeResult<InstrumentConfig>;

    /// The built-in meter, if fitted.
    fn multimeter(&self) -> ScopeResult<&dyn Multimeter>;

    /// The generator behind `channel`.
    fn function_generator(&self, channel: usize) -> ScopeResult<&dyn FunctionGenerator>;

    /// The spectrum view behind `channel`.
    fn spectrum(&self, channel: usize) -> ScopeResult<&dyn SpectrumAnalyzer>;
}

impl ScopeDriver {
    fn require_channel_type(&self, channel: usize, wanted: InstrumentTypes) -> ScopeResult<()> {
        let info = self.channel_info(channel)?;
        if info.instrument_types().contains(wanted) {
            Ok(())
        } else {
            Err(ScopeError::Unsupported(format!(
                "{} does not provide {:?}",
                info.hwname, wanted
            )))
        }
    }
}

#[async_trait]
impl Oscilloscope for ScopeDriver {
    fn instrument_types(&self) -> InstrumentTypes {
        let mut types = InstrumentTypes::OSCILLOSCOPE;
        let secondary = self.family.controls_secondary_instruments();
        if secondary && self.options().dvm {
            types |= InstrumentTypes::MULTIMETER;
        }
        if secondary && self.options().awg {
            types |= InstrumentTypes::FUNCTION_GENERATOR;
        }
        if self.family.supports_spectrum() {
            types |= InstrumentTypes::SPECTRUM;
        }
        types
    }

    fn channel_types(&self, channel: usize) -> InstrumentTypes {
        ScopeDriver::channel(self, channel)
            .map(|c| c.instrument_types())
            .unwrap_or_default()
    }

    fn channel_count(&self) -> usize {
        ScopeDriver::channel_count(self)
    }

    fn channel(&self, channel: usize) -> Option<Channel> {
        ScopeDriver::channel(self, channel)
    }

    async fn is_channel_enabled(&self, channel: usize) -> ScopeResult<bool> {
        ScopeDriver::is_channel_enabled(self, channel).await
    }

    async fn set_channel_enabled(&self, channel: usize, on: bool) -> ScopeResult<()> {
        ScopeDriver::set_channel_enabled(self, channel, on).await
    }

    async fn coupling(&self, channel: usize) -> ScopeResult<Coupling> {
        ScopeDriver::coupling(self, channel).await
    }

    async fn set_coupling(&self, channel: usize, coupling: Coupling) -> ScopeResult<()> {
        ScopeDriver::set_coupling(self, channel, coupling).await
    }

    async fn voltage_range(&self, channel: usize) -> ScopeResult<f64> {
        ScopeDriver::voltage_range(self, channel).await
    }

    async fn set_voltage_range(&self, channel: usize, volts: f64) -> ScopeResult<()> {
        ScopeDriver::set_voltage_range(self, channel, volts).await
    }

    async fn channel_offset(&self, channel: usize) -> ScopeResult<f64> {
        ScopeDriver::offset(self, channel).await
    }

    async fn set_channel_offset(&self, channel: usize, volts: f64) -> ScopeResult<()> {
        ScopeDriver::set_offset(self, channel, volts).await
    }

    async fn sample_rate(&self) -> ScopeResult<u64> {
        ScopeDriver::sample_rate(self).await
    }

    async fn set_sample_rate(&self, rate: u64) -> ScopeResult<()> {
        ScopeDriver::set_sample_rate(self, rate).await
    }

    async fn sample_depth(&self) -> ScopeResult<u64> {
        ScopeDriver::sample_depth(self).await
    }

    async fn set_sample_depth(&self, depth: u64) -> ScopeResult<()> {
        ScopeDriver::set_sample_depth(self, depth).await
    }

    async fn start(&self) -> ScopeResult<()> {
        ScopeDriver::start(self).await
    }

    async fn start_single_trigger(&self) -> ScopeResult<()> {
        ScopeDriver::start_single_trigger(self).await
    }

    async fn force_trigger(&self) -> ScopeResult<()> {
        ScopeDriver::force_trigger(self).await
    }

    async fn stop(&self) -> ScopeResult<()> {
        ScopeDriver::stop(self).await
    }

    fn is_armed(&self) -> bool {
        ScopeDriver::is_armed(self)
    }

    async fn poll_trigger(&self) -> ScopeResult<TriggerStatus> {
        ScopeDriver::poll_trigger(self).await
    }

    async fn acquire_data(&self) -> ScopeResult<bool> {
        ScopeDriver::acquire_data(self).await
    }

    fn pop_pending(&self) -> Option<SequenceSet> {
        ScopeDriver::pop_pending(self)
    }

    async fn set_trigger(&self, trigger: Trigger) -> ScopeResult<()> {
        ScopeDriver::set_trigger(self, trigger).await
    }

    async fn trigger(&self) -> ScopeResult<Trigger> {
        ScopeDriver::trigger(self).await
    }

    async fn push_config(&self, config: &InstrumentConfig) -> ScopeResult<()> {
        ScopeDriver::push_config(self, config).await
    }

    async fn pull_config(&self) -> ScopeResult<InstrumentConfig> {
        ScopeDriver::pull_config(self).await
    }

    fn multimeter(&self) -> ScopeResult<&dyn Multimeter> {
        if self.instrument_types().contains(InstrumentTypes::MULTIMETER) {
            Ok(self)
        } else if self.options().dvm {
            Err(ScopeError::Unsupported(format!(
                "DVM option is installed but cannot be driven on {}",
                self.family
            )))
        } else {
            Err(ScopeError::Unsupported(format!("multimeter on {}", self.family)))
        }
    }

    fn function_generator(&self, channel: usize) -> ScopeResult<&dyn FunctionGenerator> {
        if self.options().awg && !self.family.controls_secondary_instruments() {
            return Err(ScopeError::Unsupported(format!(
                "AWG option is installed but cannot be driven on {}",
                self.family
            )));
        }
        self.require_channel_type(channel, InstrumentTypes::FUNCTION_GENERATOR)?;
        Ok(self)
    }

    fn spectrum(&self, channel: usize) -> ScopeResult<&dyn SpectrumAnalyzer> {
        self.require_channel_type(channel, InstrumentTypes::SPECTRUM)?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverSettings;
    use crate::sim::lecroy::LeCroySim;
    use crate::sim::siglent::SiglentSim;
    use crate::sim::tek::TekSim;
    use scope_scpi::{MockTransport, Responder};
    use std::sync::Arc;

    async fn connect(sim: impl Responder + 'static) -> Arc<dyn Oscilloscope> {
        let transport = MockTransport::new(sim);
        let scope = ScopeDriver::connect(Box::new(transport), DriverSettings::default())
            .await
            .unwrap();
        Arc::new(scope)
    }

    fn index_of(scope: &dyn Oscilloscope, hwname: &str) -> usize {
        (0..scope.channel_count())
            .find(|&i| scope.channel(i).is_some_and(|c| c.hwname == hwname))
            .unwrap()
    }

    #[tokio::test]
    async fn test_instrument_types() {
        let scope = connect(TekSim::new("MSO64", "DVM,AFG")).await;
        let types = scope.instrument_types();
        assert!(types.contains(
            InstrumentTypes::OSCILLOSCOPE
                | InstrumentTypes::MULTIMETER
                | InstrumentTypes::FUNCTION_GENERATOR
                | InstrumentTypes::SPECTRUM
        ));
        assert_eq!(scope.channel_types(0), InstrumentTypes::OSCILLOSCOPE);
        let afg = index_of(scope.as_ref(), "AFG");
        assert_eq!(scope.channel_types(afg), InstrumentTypes::FUNCTION_GENERATOR);
        assert!(scope.channel_types(999).is_empty());

        let scope = connect(SiglentSim::new("SDS2104X Plus")).await;
        assert_eq!(scope.instrument_types(), InstrumentTypes::OSCILLOSCOPE);
        assert!(scope.multimeter().is_err());
    }

    #[tokio::test]
    async fn test_reported_options_without_command_set() {
        let scope = connect(SiglentSim::new("SDS2104X Plus").with_options("AWG,DVM")).await;
        assert_eq!(scope.instrument_types(), InstrumentTypes::OSCILLOSCOPE);
        assert!((0..scope.channel_count()).all(|i| scope.channel_types(i)
            != InstrumentTypes::FUNCTION_GENERATOR));

        let Err(ScopeError::Unsupported(message)) = scope.multimeter() else {
            panic!("multimeter should be unsupported");
        };
        assert!(message.contains("DVM"));
        let Err(ScopeError::Unsupported(message)) = scope.function_generator(0) else {
            panic!("generator should be unsupported");
        };
        assert!(message.contains("AWG"));
    }

    #[tokio::test]
    async fn test_dispatch_by_channel() {
        let scope = connect(TekSim::new("MSO64", "DVM,AFG")).await;
        let afg = index_of(scope.as_ref(), "AFG");
        let sv = index_of(scope.as_ref(), "CH1_SV_NORMAL");

        let generator = scope.function_generator(afg).unwrap();
        generator.set_frequency(afg, 10e3).await.unwrap();
        assert!((generator.frequency(afg).await.unwrap() - 10e3).abs() < 1e-6);

        assert!(matches!(
            scope.function_generator(sv),
            Err(ScopeError::Unsupported(_))
        ));
        assert!(scope.spectrum(sv).is_ok());
        assert!(scope.spectrum(afg).is_err());

        let meter = scope.multimeter().unwrap();
        assert_eq!(meter.meter_digits(), 4);
    }

    #[tokio::test]
    async fn test_capture_through_trait_object() {
        let scope = connect(LeCroySim::new("WAVERUNNER9254M", "")).await;
        scope.set_channel_offset(0, 0.1).await.unwrap();
        assert!((scope.channel_offset(0).await.unwrap() - 0.1).abs() < 1e-9);
        scope.start_single_trigger().await.unwrap();
        assert!(scope.acquire_data().await.unwrap());
        assert!(scope.pop_pending().is_some());
        assert!(!scope.is_armed());
    }
}
