//! Instrument capability vocabulary.
//!
//! An instrument advertises a bitmask of [`InstrumentTypes`]; each channel
//! advertises the subset that applies to it. The secondary instrument modes
//! (multimeter, function generator, spectrum view) are expressed as small
//! async traits so callers can work against them without knowing the vendor:
//!
//! ```rust,ignore
//! async fn log_meter<M: Multimeter + ?Sized>(meter: &M) -> ScopeResult<()> {
//!     meter.set_meter_mode(MultimeterMode::DcVoltage).await?;
//!     meter.start_meter().await?;
//!     tracing::info!(value = meter.meter_value().await?, "DMM reading");
//!     Ok(())
//! }
//! ```
//!
//! The oscilloscope trait itself lives with the driver because it speaks in
//! driver types (triggers, couplings).

use crate::error::ScopeResult;
use async_trait::async_trait;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

bitflags! {
    /// What an instrument (or one of its channels) can act as.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InstrumentTypes: u32 {
        const OSCILLOSCOPE       = 0b0001;
        const MULTIMETER         = 0b0010;
        const FUNCTION_GENERATOR = 0b0100;
        const SPECTRUM           = 0b1000;
    }
}

// =============================================================================
// Multimeter
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MultimeterMode {
    #[default]
    DcVoltage,
    DcRmsAmplitude,
    AcRmsAmplitude,
    Frequency,
}

impl MultimeterMode {
    pub const ALL: [MultimeterMode; 4] = [
        Self::DcVoltage,
        Self::DcRmsAmplitude,
        Self::AcRmsAmplitude,
        Self::Frequency,
    ];
}

#[async_trait]
pub trait Multimeter: Send + Sync {
    fn available_meter_modes(&self) -> Vec<MultimeterMode> {
        MultimeterMode::ALL.to_vec()
    }
    async fn set_meter_mode(&self, mode: MultimeterMode) -> ScopeResult<()>;
    async fn meter_mode(&self) -> ScopeResult<MultimeterMode>;
    async fn set_meter_autorange(&self, enable: bool) -> ScopeResult<()>;
    async fn meter_autorange(&self) -> ScopeResult<bool>;
    /// Select the analog channel the meter measures.
    async fn set_meter_channel(&self, channel: usize) -> ScopeResult<()>;
    async fn meter_channel(&self) -> ScopeResult<usize>;
    async fn start_meter(&self) -> ScopeResult<()>;
    async fn stop_meter(&self) -> ScopeResult<()>;
    async fn meter_value(&self) -> ScopeResult<f64>;
    fn meter_digits(&self) -> u32;
}

// =============================================================================
// Function generator
// =============================================================================

/// Output shapes a generator may offer. Families reject the ones they lack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WaveShape {
    Sine,
    Square,
    Triangle,
    Pulse,
    Noise,
    Dc,
    StaircaseUp,
    StaircaseDown,
    StaircaseUpDown,
    SawtoothUp,
    SawtoothDown,
    ExponentialRise,
    ExponentialDecay,
    LogRise,
    LogDecay,
    Sinc,
    Gaussian,
    Lorentz,
    HalfSine,
    Cardiac,
    Hamming,
    Hanning,
    Kaiser,
    Blackman,
    TriangleWindow,
    Harris,
    Bartlett,
    Tangent,
    Cotangent,
    SquareRoot,
    XSquared,
    Arbitrary,
}

impl fmt::Display for WaveShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OutputImpedance {
    #[default]
    HighZ,
    FiftyOhm,
}

#[async_trait]
pub trait FunctionGenerator: Send + Sync {
    fn available_shapes(&self, channel: usize) -> Vec<WaveShape>;
    async fn set_output_enable(&self, channel: usize, on: bool) -> ScopeResult<()>;
    async fn output_enable(&self, channel: usize) -> ScopeResult<bool>;
    async fn set_shape(&self, channel: usize, shape: WaveShape) -> ScopeResult<()>;
    async fn shape(&self, channel: usize) -> ScopeResult<WaveShape>;
    /// Peak-to-peak volts as seen by the load.
    async fn set_amplitude(&self, channel: usize, volts: f64) -> ScopeResult<()>;
    async fn amplitude(&self, channel: usize) -> ScopeResult<f64>;
    async fn set_offset(&self, channel: usize, volts: f64) -> ScopeResult<()>;
    async fn offset(&self, channel: usize) -> ScopeResult<f64>;
    async fn set_frequency(&self, channel: usize, hz: f64) -> ScopeResult<()>;
    async fn frequency(&self, channel: usize) -> ScopeResult<f64>;
    /// Duty cycle as a fraction in `[0, 1]`.
    async fn set_duty_cycle(&self, channel: usize, duty: f64) -> ScopeResult<()>;
    async fn duty_cycle(&self, channel: usize) -> ScopeResult<f64>;
    async fn set_rise_time(&self, channel: usize, fs: i64) -> ScopeResult<()>;
    async fn rise_time(&self, channel: usize) -> ScopeResult<i64>;
    async fn set_fall_time(&self, channel: usize, fs: i64) -> ScopeResult<()>;
    async fn fall_time(&self, channel: usize) -> ScopeResult<i64>;
    async fn set_output_impedance(&self, channel: usize, z: OutputImpedance) -> ScopeResult<()>;
    async fn output_impedance(&self, channel: usize) -> ScopeResult<OutputImpedance>;
}

// =============================================================================
// Spectrum view
// =============================================================================

#[async_trait]
pub trait SpectrumAnalyzer: Send + Sync {
    async fn set_span(&self, hz: i64) -> ScopeResult<()>;
    async fn span(&self) -> ScopeResult<i64>;
    async fn set_center_frequency(&self, channel: usize, hz: i64) -> ScopeResult<()>;
    async fn center_frequency(&self, channel: usize) -> ScopeResult<i64>;
    async fn set_resolution_bandwidth(&self, hz: i64) -> ScopeResult<()>;
    async fn resolution_bandwidth(&self) -> ScopeResult<i64>;
}
