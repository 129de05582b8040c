//! Waveform containers.
//!
//! Time is integer femtoseconds throughout. A waveform records its sample
//! period (`timescale`), the sub-sample offset of the trigger
//! (`trigger_phase`) and its wall-clock start split into whole seconds since
//! the Unix epoch plus a femtosecond remainder.
//!
//! Samples live in a [`SampleBuffer`], which tracks whether the CPU or the GPU
//! copy is authoritative. The runtime never touches GPU memory itself; the flags
//! let a GPU sample converter and CPU consumers hand buffers back and forth.

use bitflags::bitflags;
use std::collections::BTreeMap;

/// Femtoseconds per second.
pub const FS_PER_SECOND: i64 = 1_000_000_000_000_000;

bitflags! {
    /// Per-waveform status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WaveformFlags: u8 {
        /// At least one sample hit the ADC rails.
        const CLIPPING = 0b0000_0001;
    }
}

// =============================================================================
// SampleBuffer
// =============================================================================

/// Sample storage with CPU/GPU residency tracking.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SampleBuffer<T> {
    data: Vec<T>,
    cpu_stale: bool,
    gpu_stale: bool,
}

impl<T: Clone + Default> SampleBuffer<T> {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            cpu_stale: false,
            gpu_stale: true,
        }
    }

    pub fn with_len(len: usize) -> Self {
        Self {
            data: vec![T::default(); len],
            cpu_stale: false,
            gpu_stale: true,
        }
    }

    pub fn from_vec(data: Vec<T>) -> Self {
        Self {
            data,
            cpu_stale: false,
            gpu_stale: true,
        }
    }

    pub fn resize(&mut self, len: usize) {
        self.data.resize(len, T::default());
    }

    pub fn push(&mut self, value: T) {
        self.data.push(value);
    }

    pub fn shrink_to_fit(&mut self) {
        self.data.shrink_to_fit();
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// CPU copy was written; the GPU copy must be re-uploaded before use.
    pub fn mark_modified_from_cpu(&mut self) {
        self.cpu_stale = false;
        self.gpu_stale = true;
    }

    /// GPU copy was written; the CPU copy must be downloaded before use.
    pub fn mark_modified_from_gpu(&mut self) {
        self.cpu_stale = true;
        self.gpu_stale = false;
    }

    /// Called after a download from the GPU copy has completed.
    pub fn prepare_for_cpu_access(&mut self) {
        self.cpu_stale = false;
    }

    pub fn is_cpu_stale(&self) -> bool {
        self.cpu_stale
    }

    pub fn is_gpu_stale(&self) -> bool {
        self.gpu_stale
    }
}

impl<T> std::ops::Index<usize> for SampleBuffer<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.data[index]
    }
}

// =============================================================================
// Waveforms
// =============================================================================

/// Timing metadata shared by every waveform shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WaveformTiming {
    /// Femtoseconds per sample (or per unit of offset, for sparse data).
    pub timescale: i64,
    /// Offset of the trigger within the first sample period, femtoseconds.
    pub trigger_phase: i64,
    /// Whole seconds since the Unix epoch.
    pub start_timestamp: i64,
    /// Fractional start, femtoseconds in `[0, FS_PER_SECOND)`.
    pub start_femtoseconds: i64,
    pub flags: WaveformFlags,
}

impl WaveformTiming {
    /// Start time as a single ordered key.
    pub fn start_key(&self) -> (i64, i64) {
        (self.start_timestamp, self.start_femtoseconds)
    }

    /// Set the start from a (seconds, femtoseconds) pair, normalising the remainder.
    pub fn set_start(&mut self, seconds: i64, femtoseconds: i64) {
        self.start_timestamp = seconds + femtoseconds.div_euclid(FS_PER_SECOND);
        self.start_femtoseconds = femtoseconds.rem_euclid(FS_PER_SECOND);
    }
}

/// Densely sampled waveform: sample `i` lies at `i * timescale + trigger_phase`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UniformWaveform<T> {
    pub timing: WaveformTiming,
    pub samples: SampleBuffer<T>,
}

impl<T: Clone + Default> UniformWaveform<T> {
    pub fn new(timing: WaveformTiming) -> Self {
        Self {
            timing,
            samples: SampleBuffer::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Sparsely sampled waveform: sample `i` starts at `offsets[i] * timescale`
/// and lasts `durations[i]` units.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SparseWaveform<T> {
    pub timing: WaveformTiming,
    pub offsets: SampleBuffer<i64>,
    pub durations: SampleBuffer<i64>,
    pub samples: SampleBuffer<T>,
}

impl<T: Clone + Default> SparseWaveform<T> {
    pub fn new(timing: WaveformTiming) -> Self {
        Self {
            timing,
            offsets: SampleBuffer::new(),
            durations: SampleBuffer::new(),
            samples: SampleBuffer::new(),
        }
    }

    pub fn push(&mut self, offset: i64, duration: i64, sample: T) {
        self.offsets.push(offset);
        self.durations.push(duration);
        self.samples.push(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn shrink_to_fit(&mut self) {
        self.offsets.shrink_to_fit();
        self.durations.shrink_to_fit();
        self.samples.shrink_to_fit();
    }

    /// Iterate `(offset, duration, sample)` tuples.
    pub fn iter(&self) -> impl Iterator<Item = (i64, i64, &T)> {
        self.offsets
            .as_slice()
            .iter()
            .zip(self.durations.as_slice())
            .zip(self.samples.as_slice())
            .map(|((o, d), s)| (*o, *d, s))
    }
}

/// Any waveform the runtime can deliver.
#[derive(Debug, Clone, PartialEq)]
pub enum Waveform {
    /// Calibrated analog samples in the channel's y-unit.
    Analog(UniformWaveform<f32>),
    /// Run-length-deduplicated digital lane.
    Digital(SparseWaveform<bool>),
    /// Frequency-domain trace; `timescale` holds Hz per bin.
    Spectrum(UniformWaveform<f32>),
}

impl Waveform {
    pub fn timing(&self) -> &WaveformTiming {
        match self {
            Self::Analog(w) | Self::Spectrum(w) => &w.timing,
            Self::Digital(w) => &w.timing,
        }
    }

    pub fn timing_mut(&mut self) -> &mut WaveformTiming {
        match self {
            Self::Analog(w) | Self::Spectrum(w) => &mut w.timing,
            Self::Digital(w) => &mut w.timing,
        }
    }

    /// Number of stored samples (runs, for digital data).
    pub fn len(&self) -> usize {
        match self {
            Self::Analog(w) | Self::Spectrum(w) => w.len(),
            Self::Digital(w) => w.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_analog(&self) -> Option<&UniformWaveform<f32>> {
        match self {
            Self::Analog(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_digital(&self) -> Option<&SparseWaveform<bool>> {
        match self {
            Self::Digital(w) => Some(w),
            _ => None,
        }
    }
}

// =============================================================================
// SequenceSet
// =============================================================================

/// One trigger event across every captured channel, keyed by channel index.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SequenceSet {
    waveforms: BTreeMap<usize, Waveform>,
}

impl SequenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, channel: usize, waveform: Waveform) {
        self.waveforms.insert(channel, waveform);
    }

    pub fn get(&self, channel: usize) -> Option<&Waveform> {
        self.waveforms.get(&channel)
    }

    pub fn channels(&self) -> impl Iterator<Item = usize> + '_ {
        self.waveforms.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Waveform)> {
        self.waveforms.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.waveforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waveforms.is_empty()
    }

    /// Earliest start among the member waveforms.
    pub fn start_key(&self) -> Option<(i64, i64)> {
        self.waveforms.values().map(|w| w.timing().start_key()).min()
    }

    /// Overwrite the start time of every member waveform.
    pub fn set_start(&mut self, seconds: i64, femtoseconds: i64) {
        for waveform in self.waveforms.values_mut() {
            waveform.timing_mut().set_start(seconds, femtoseconds);
        }
    }
}
