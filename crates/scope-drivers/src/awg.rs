//! Built-in function generator: LeCroy `WaveSource` and the Tek MSO AFG.
//!
//! Amplitude and offset are exchanged with callers as volts at the load. The
//! instruments program their output as if driving a high-impedance load, so
//! with a 50 Ω termination the programmed value is twice the requested one.

use crate::channel::ChannelKind;
use crate::driver::ScopeDriver;
use crate::family::Vendor;
use crate::trigger::{fmt_sci, fs_to_seconds, seconds_to_fs};
use async_trait::async_trait;
use scope_core::{FunctionGenerator, OutputImpedance, ScopeError, ScopeResult, WaveShape};

const LECROY_SHAPES: &[(WaveShape, &str)] = &[
    (WaveShape::Sine, "Sine"),
    (WaveShape::Square, "Square"),
    (WaveShape::Triangle, "Triangle"),
    (WaveShape::Pulse, "Pulse"),
    (WaveShape::Dc, "DC"),
    (WaveShape::Noise, "Noise"),
    (WaveShape::Arbitrary, "Arbitrary"),
];

const TEK_SHAPES: &[(WaveShape, &str)] = &[
    (WaveShape::Sine, "SINE"),
    (WaveShape::Square, "SQUARE"),
    (WaveShape::Pulse, "PULSE"),
    (WaveShape::Triangle, "RAMP"),
    (WaveShape::Dc, "DC"),
    (WaveShape::Noise, "NOISE"),
    (WaveShape::Sinc, "SINC"),
    (WaveShape::Gaussian, "GAUSSIAN"),
    (WaveShape::Lorentz, "LORENTZ"),
    (WaveShape::ExponentialRise, "ERISE"),
    (WaveShape::ExponentialDecay, "EDECAY"),
    (WaveShape::HalfSine, "HAVERSINE"),
    (WaveShape::Cardiac, "CARDIAC"),
    (WaveShape::Arbitrary, "ARBITRARY"),
];

fn load_scale(z: OutputImpedance) -> f64 {
    match z {
        OutputImpedance::HighZ => 1.0,
        OutputImpedance::FiftyOhm => 2.0,
    }
}

impl ScopeDriver {
    fn shape_table(&self) -> &'static [(WaveShape, &'static str)] {
        match self.vendor() {
            Vendor::LeCroy => LECROY_SHAPES,
            Vendor::Tektronix => TEK_SHAPES,
            _ => &[],
        }
    }

    /// Check that `channel` is the generator output.
    fn require_awg(&self, channel: usize) -> ScopeResult<()> {
        let info = self.channel_info(channel)?;
        if info.kind != ChannelKind::FunctionGenerator {
            return Err(ScopeError::Unsupported(format!(
                "{} is not a function generator",
                info.hwname
            )));
        }
        Ok(())
    }

    async fn awg_get(&self, lecroy: &str, tek: &str) -> ScopeResult<String> {
        match self.vendor() {
            Vendor::LeCroy => self.vbs_get(&format!("WaveSource.{}", lecroy)).await,
            _ => self.query_text(&format!("AFG:{}?", tek)).await,
        }
    }

    async fn awg_number(&self, lecroy: &str, tek: &str) -> ScopeResult<f64> {
        crate::wire::parse_number(&self.awg_get(lecroy, tek).await?)
    }

    fn awg_set(&self, lecroy: &str, tek: &str, value: f64) {
        match self.vendor() {
            Vendor::LeCroy => self.vbs_set(&format!("WaveSource.{}", lecroy), value),
            _ => self
                .pipe
                .send_queued(format!("AFG:{} {}", tek, fmt_sci(value))),
        }
    }

    async fn cached_impedance(&self) -> ScopeResult<OutputImpedance> {
        let mut cache = self.cache.lock().await;
        if let Some(z) = cache.awg_impedance {
            return Ok(z);
        }
        let text = self.awg_get("Load", "OUTPUT:LOAD:IMPEDANCE").await?;
        let upper = text.to_ascii_uppercase();
        let z = if upper.starts_with("50") || upper.starts_with("FIFTY") {
            OutputImpedance::FiftyOhm
        } else {
            OutputImpedance::HighZ
        };
        cache.awg_impedance = Some(z);
        Ok(z)
    }
}

#[async_trait]
impl FunctionGenerator for ScopeDriver {
    fn available_shapes(&self, channel: usize) -> Vec<WaveShape> {
        if self.require_awg(channel).is_err() {
            return Vec::new();
        }
        self.shape_table().iter().map(|(shape, _)| *shape).collect()
    }

    async fn set_output_enable(&self, channel: usize, on: bool) -> ScopeResult<()> {
        self.require_awg(channel)?;
        match self.vendor() {
            Vendor::LeCroy => {
                self.vbs_set("WaveSource.Enable", if on { "True" } else { "False" })
            }
            _ => self
                .pipe
                .send_queued(format!("AFG:OUTPUT:STATE {}", u8::from(on))),
        }
        Ok(())
    }

    async fn output_enable(&self, channel: usize) -> ScopeResult<bool> {
        self.require_awg(channel)?;
        scope_scpi::parse_bool(&self.awg_get("Enable", "OUTPUT:STATE").await?)
    }

    async fn set_shape(&self, channel: usize, shape: WaveShape) -> ScopeResult<()> {
        self.require_awg(channel)?;
        let Some((_, name)) = self.shape_table().iter().find(|(s, _)| *s == shape) else {
            return Err(ScopeError::InvalidParameter(format!(
                "{} waveform on {}",
                shape, self.family
            )));
        };
        match self.vendor() {
            Vendor::LeCroy => self.vbs_set("WaveSource.Shape", format!("\"{}\"", name)),
            _ => self.pipe.send_queued(format!("AFG:FUNCTION {}", name)),
        }
        Ok(())
    }

    async fn shape(&self, channel: usize) -> ScopeResult<WaveShape> {
        self.require_awg(channel)?;
        let text = self.awg_get("Shape", "FUNCTION").await?;
        self.shape_table()
            .iter()
            .find(|(_, name)| name.eq_ignore_ascii_case(&text))
            .map(|(shape, _)| *shape)
            .ok_or_else(|| ScopeError::parse(&text, "waveform shape"))
    }

    async fn set_amplitude(&self, channel: usize, volts: f64) -> ScopeResult<()> {
        self.require_awg(channel)?;
        if volts.is_nan() || volts <= 0.0 {
            return Err(ScopeError::InvalidParameter(format!(
                "amplitude {} V",
                volts
            )));
        }
        let scale = load_scale(self.cached_impedance().await?);
        self.awg_set("Amplitude", "AMPLITUDE", volts * scale);
        Ok(())
    }

    async fn amplitude(&self, channel: usize) -> ScopeResult<f64> {
        self.require_awg(channel)?;
        let scale = load_scale(self.cached_impedance().await?);
        Ok(self.awg_number("Amplitude", "AMPLITUDE").await? / scale)
    }

    async fn set_offset(&self, channel: usize, volts: f64) -> ScopeResult<()> {
        self.require_awg(channel)?;
        let scale = load_scale(self.cached_impedance().await?);
        self.awg_set("Offset", "OFFSET", volts * scale);
        Ok(())
    }

    async fn offset(&self, channel: usize) -> ScopeResult<f64> {
        self.require_awg(channel)?;
        let scale = load_scale(self.cached_impedance().await?);
        Ok(self.awg_number("Offset", "OFFSET").await? / scale)
    }

    async fn set_frequency(&self, channel: usize, hz: f64) -> ScopeResult<()> {
        self.require_awg(channel)?;
        if hz.is_nan() || hz <= 0.0 {
            return Err(ScopeError::InvalidParameter(format!("frequency {} Hz", hz)));
        }
        self.awg_set("Frequency", "FREQUENCY", hz);
        Ok(())
    }

    async fn frequency(&self, channel: usize) -> ScopeResult<f64> {
        self.require_awg(channel)?;
        self.awg_number("Frequency", "FREQUENCY").await
    }

    async fn set_duty_cycle(&self, channel: usize, duty: f64) -> ScopeResult<()> {
        self.require_awg(channel)?;
        if !(0.0..=1.0).contains(&duty) {
            return Err(ScopeError::InvalidParameter(format!("duty cycle {}", duty)));
        }
        self.awg_set("DutyCycle", "SQUARE:DUTY", duty * 100.0);
        Ok(())
    }

    async fn duty_cycle(&self, channel: usize) -> ScopeResult<f64> {
        self.require_awg(channel)?;
        Ok(self.awg_number("DutyCycle", "SQUARE:DUTY").await? / 100.0)
    }

    async fn set_rise_time(&self, channel: usize, fs: i64) -> ScopeResult<()> {
        self.require_awg(channel)?;
        if self.vendor() != Vendor::LeCroy {
            return Err(ScopeError::Unsupported(format!("rise time on {}", self.family)));
        }
        self.vbs_set("WaveSource.RiseTime", fmt_sci(fs_to_seconds(fs)));
        Ok(())
    }

    async fn rise_time(&self, channel: usize) -> ScopeResult<i64> {
        self.require_awg(channel)?;
        if self.vendor() != Vendor::LeCroy {
            return Err(ScopeError::Unsupported(format!("rise time on {}", self.family)));
        }
        Ok(seconds_to_fs(self.vbs_f64("WaveSource.RiseTime").await?))
    }

    async fn set_fall_time(&self, channel: usize, fs: i64) -> ScopeResult<()> {
        self.require_awg(channel)?;
        if self.vendor() != Vendor::LeCroy {
            return Err(ScopeError::Unsupported(format!("fall time on {}", self.family)));
        }
        self.vbs_set("WaveSource.FallTime", fmt_sci(fs_to_seconds(fs)));
        Ok(())
    }

    async fn fall_time(&self, channel: usize) -> ScopeResult<i64> {
        self.require_awg(channel)?;
        if self.vendor() != Vendor::LeCroy {
            return Err(ScopeError::Unsupported(format!("fall time on {}", self.family)));
        }
        Ok(seconds_to_fs(self.vbs_f64("WaveSource.FallTime").await?))
    }

    async fn set_output_impedance(&self, channel: usize, z: OutputImpedance) -> ScopeResult<()> {
        self.require_awg(channel)?;
        let mut cache = self.cache.lock().await;
        cache.awg_impedance = Some(z);
        match (self.vendor(), z) {
            (Vendor::LeCroy, OutputImpedance::HighZ) => self.vbs_set("WaveSource.Load", "\"HiZ\""),
            (Vendor::LeCroy, OutputImpedance::FiftyOhm) => self.vbs_set("WaveSource.Load", "\"50\""),
            (_, OutputImpedance::HighZ) => {
                self.pipe.send_queued("AFG:OUTPUT:LOAD:IMPEDANCE HIGHZ")
            }
            (_, OutputImpedance::FiftyOhm) => {
                self.pipe.send_queued("AFG:OUTPUT:LOAD:IMPEDANCE FIFTY")
            }
        }
        Ok(())
    }

    async fn output_impedance(&self, channel: usize) -> ScopeResult<OutputImpedance> {
        self.require_awg(channel)?;
        self.cached_impedance().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverSettings;
    use crate::sim::lecroy::LeCroySim;
    use crate::sim::tek::TekSim;
    use scope_scpi::{MockHandle, MockTransport, Responder};

    async fn connect(sim: impl Responder + 'static) -> (ScopeDriver, MockHandle) {
        let transport = MockTransport::new(sim);
        let handle = transport.handle();
        let scope = ScopeDriver::connect(Box::new(transport), DriverSettings::default())
            .await
            .unwrap();
        (scope, handle)
    }

    #[tokio::test]
    async fn test_fifty_ohm_doubles_amplitude() {
        let (scope, handle) = connect(TekSim::new("MSO64", "AFG")).await;
        let afg = scope.channel_by_name("AFG").unwrap();
        assert_eq!(
            scope.output_impedance(afg).await.unwrap(),
            OutputImpedance::HighZ
        );
        assert!((scope.amplitude(afg).await.unwrap() - 0.5).abs() < 1e-9);

        scope
            .set_output_impedance(afg, OutputImpedance::FiftyOhm)
            .await
            .unwrap();
        scope.set_amplitude(afg, 1.0).await.unwrap();
        FunctionGenerator::set_offset(&scope, afg, 0.25).await.unwrap();
        scope.pipe.flush().await.unwrap();
        let commands = handle.commands();
        assert!(commands.contains(&"AFG:AMPLITUDE 2.000000e+00".to_string()));
        assert!(commands.contains(&"AFG:OFFSET 5.000000e-01".to_string()));

        assert!((scope.amplitude(afg).await.unwrap() - 1.0).abs() < 1e-9);
        let offset = FunctionGenerator::offset(&scope, afg).await.unwrap();
        assert!((offset - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_shapes_per_family() {
        let (scope, _) = connect(LeCroySim::new("WAVERUNNER9254M", "AWG")).await;
        let awg = scope.channel_by_name("AWG").unwrap();
        assert!(!scope.available_shapes(awg).contains(&WaveShape::Cardiac));
        assert!(matches!(
            scope.set_shape(awg, WaveShape::Cardiac).await,
            Err(ScopeError::InvalidParameter(_))
        ));
        scope.set_shape(awg, WaveShape::Square).await.unwrap();
        assert_eq!(scope.shape(awg).await.unwrap(), WaveShape::Square);

        let (tek, _) = connect(TekSim::new("MSO58", "AFG")).await;
        let afg = tek.channel_by_name("AFG").unwrap();
        tek.set_shape(afg, WaveShape::Cardiac).await.unwrap();
        assert_eq!(tek.shape(afg).await.unwrap(), WaveShape::Cardiac);
    }

    #[tokio::test]
    async fn test_lecroy_timing_parameters() {
        let (scope, _) = connect(LeCroySim::new("WAVERUNNER9254M", "AWG")).await;
        let awg = scope.channel_by_name("AWG").unwrap();
        assert_eq!(scope.rise_time(awg).await.unwrap(), 10_000_000);
        scope.set_fall_time(awg, 5_000_000).await.unwrap();
        assert_eq!(scope.fall_time(awg).await.unwrap(), 5_000_000);
        assert!((scope.duty_cycle(awg).await.unwrap() - 0.5).abs() < 1e-9);
        scope.set_duty_cycle(awg, 0.2).await.unwrap();
        assert!((scope.duty_cycle(awg).await.unwrap() - 0.2).abs() < 1e-9);
        assert!(scope.set_duty_cycle(awg, 1.5).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_other_channels() {
        let (scope, _) = connect(TekSim::new("MSO64", "AFG")).await;
        assert!(scope.available_shapes(0).is_empty());
        assert!(scope.set_frequency(0, 1e3).await.is_err());
        let afg = scope.channel_by_name("AFG").unwrap();
        assert!(matches!(
            scope.set_rise_time(afg, 1_000).await,
            Err(ScopeError::Unsupported(_))
        ));
    }
}
