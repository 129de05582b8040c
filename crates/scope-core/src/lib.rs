//! Core types for the scope-daq runtime.
//!
//! Everything the SCPI layer and the vendor drivers have in common:
//!
//! - [`error`]: `ScopeError` and its recovery classification
//! - [`units`]: display units with SI-prefix parsing
//! - [`parameter`]: typed parameter dictionaries used by triggers
//! - [`waveform`]: uniform/sparse waveforms and sequence sets
//! - [`pending`]: the bounded output queue of captured sets
//! - [`transport`]: the byte-conduit trait every connection implements
//! - [`convert`]: raw code to float conversion (CPU or GPU backed)
//! - [`capabilities`]: instrument type bitmask and secondary-mode traits

pub mod capabilities;
pub mod convert;
pub mod error;
pub mod parameter;
pub mod pending;
pub mod transport;
pub mod units;
pub mod waveform;

pub use capabilities::{
    FunctionGenerator, InstrumentTypes, Multimeter, MultimeterMode, OutputImpedance,
    SpectrumAnalyzer, WaveShape,
};
pub use convert::{CpuConverter, SampleConverter};
pub use error::{ScopeError, ScopeResult};
pub use parameter::{
    Disparity, FilterParameter, ParameterSet, ParameterValue, Symbol8b10b, SymbolKind,
};
pub use pending::PendingWaveforms;
pub use transport::{ProgressCallback, Transport};
pub use units::Unit;
pub use waveform::{
    SampleBuffer, SequenceSet, SparseWaveform, UniformWaveform, Waveform, WaveformFlags,
    WaveformTiming, FS_PER_SECOND,
};
