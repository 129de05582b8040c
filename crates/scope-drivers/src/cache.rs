//! Mirrored instrument state.
//!
//! Every field is an `Option` (or a map entry) that is either a valid copy of
//! the instrument's value or absent. Readers in the driver check the cache
//! first and only go to the wire on a miss; writers store the new value
//! optimistically and then drop whatever else the write may have changed
//! on the instrument side.
//!
//! The cache itself is plain data. The driver wraps it in a
//! `tokio::sync::Mutex` and always takes that lock before the pipeline lock.
//!
//! # Enable-dirty set
//!
//! Channels whose enable state changed since the last arm. Some firmware
//! reports data ready for a channel enabled after the trigger fired but then
//! returns an empty body for it, so the download path skips these channels on
//! the first capture after the change. Arming clears the set.

use crate::probe::{Coupling, ProbeKind};
use scope_core::{MultimeterMode, OutputImpedance};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default, Clone)]
pub struct ConfigCache {
    pub enabled: HashMap<usize, bool>,
    /// Full-scale range, volts.
    pub voltage_range: HashMap<usize, f64>,
    pub offset: HashMap<usize, f64>,
    pub coupling: HashMap<usize, Coupling>,
    /// Femtoseconds.
    pub deskew: HashMap<usize, i64>,
    pub attenuation: HashMap<usize, f64>,
    /// MHz, `0` for no limit.
    pub bandwidth_limit: HashMap<usize, u32>,
    pub digital_threshold: HashMap<usize, f64>,
    pub probe_active: HashMap<usize, bool>,
    pub probes: HashMap<usize, ProbeKind>,
    pub probe_names: HashMap<usize, String>,
    pub num_averages: HashMap<usize, i64>,
    /// Hz, spectrum channels only.
    pub center_frequency: HashMap<usize, i64>,
    pub invert: HashMap<usize, bool>,

    /// Samples per second.
    pub sample_rate: Option<u64>,
    pub sample_depth: Option<u64>,
    /// Femtoseconds from the trigger to the start of the record.
    pub trigger_offset: Option<i64>,
    pub interleaving: Option<bool>,
    pub segments: Option<usize>,
    pub meter_mode: Option<MultimeterMode>,
    pub meter_autorange: Option<bool>,
    pub meter_channel: Option<usize>,
    pub span: Option<i64>,
    pub rbw: Option<i64>,
    /// Generator load setting; amplitude and offset scale with it.
    pub awg_impedance: Option<OutputImpedance>,

    enable_dirty: BTreeSet<usize>,
}

impl ConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every cached value. The enable-dirty set survives: it describes
    /// the instrument's acquisition memory, not a mirrored setting.
    pub fn flush(&mut self) {
        let dirty = std::mem::take(&mut self.enable_dirty);
        *self = Self::default();
        self.enable_dirty = dirty;
    }

    // =========================================================================
    // Mutators with dependent invalidation
    // =========================================================================

    /// Record an enable change. Returns false if the cached state already matched.
    pub fn set_enabled(&mut self, channel: usize, on: bool) -> bool {
        if self.enabled.get(&channel) == Some(&on) {
            return false;
        }
        self.enabled.insert(channel, on);
        self.enable_dirty.insert(channel);
        // channel count feeds interleaving and the rate/depth tables
        self.interleaving = None;
        self.sample_rate = None;
        self.sample_depth = None;
        true
    }

    pub fn set_coupling(&mut self, channel: usize, coupling: Coupling) {
        self.coupling.insert(channel, coupling);
        self.voltage_range.remove(&channel);
        self.bandwidth_limit.remove(&channel);
    }

    pub fn set_attenuation(&mut self, channel: usize, attenuation: f64) {
        self.attenuation.insert(channel, attenuation);
        self.voltage_range.remove(&channel);
        self.offset.remove(&channel);
    }

    pub fn set_sample_rate(&mut self, rate: u64) {
        self.sample_rate = Some(rate);
        self.sample_depth = None;
    }

    pub fn set_sample_depth(&mut self, depth: u64) {
        self.sample_depth = Some(depth);
        self.sample_rate = None;
    }

    pub fn set_interleaving(&mut self, on: bool) {
        self.interleaving = Some(on);
        self.sample_rate = None;
        self.sample_depth = None;
    }

    /// Drop everything derived from one channel's probe.
    pub fn invalidate_probe(&mut self, channel: usize) {
        self.probes.remove(&channel);
        self.probe_active.remove(&channel);
        self.probe_names.remove(&channel);
        self.attenuation.remove(&channel);
        self.coupling.remove(&channel);
        self.voltage_range.remove(&channel);
        self.offset.remove(&channel);
    }

    // =========================================================================
    // Enable-dirty set
    // =========================================================================

    pub fn is_enable_dirty(&self, channel: usize) -> bool {
        self.enable_dirty.contains(&channel)
    }

    pub fn enable_dirty(&self) -> &BTreeSet<usize> {
        &self.enable_dirty
    }

    /// Clear the set, returning the channels that were in it. Called while
    /// arming, with the cache lock held.
    pub fn take_enable_dirty(&mut self) -> BTreeSet<usize> {
        std::mem::take(&mut self.enable_dirty)
    }

    pub fn probe(&self, channel: usize) -> Option<ProbeKind> {
        self.probes.get(&channel).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enable_marks_dirty_and_invalidates_timebase() {
        let mut cache = ConfigCache::new();
        cache.sample_rate = Some(1_000_000_000);
        cache.sample_depth = Some(10_000);
        cache.interleaving = Some(false);

        assert!(cache.set_enabled(1, true));
        assert!(cache.is_enable_dirty(1));
        assert!(cache.sample_rate.is_none());
        assert!(cache.sample_depth.is_none());
        assert!(cache.interleaving.is_none());

        // same state again is not a change
        assert!(!cache.set_enabled(1, true));
        assert_eq!(cache.take_enable_dirty().into_iter().collect::<Vec<_>>(), vec![1]);
        assert!(!cache.is_enable_dirty(1));
    }

    #[test]
    fn test_coupling_invalidates_range_and_bandwidth() {
        let mut cache = ConfigCache::new();
        cache.voltage_range.insert(0, 8.0);
        cache.bandwidth_limit.insert(0, 20);
        cache.offset.insert(0, 0.5);
        cache.set_coupling(0, Coupling::Dc50);
        assert!(!cache.voltage_range.contains_key(&0));
        assert!(!cache.bandwidth_limit.contains_key(&0));
        assert_eq!(cache.offset.get(&0), Some(&0.5));
    }

    #[test]
    fn test_attenuation_invalidates_range_and_offset() {
        let mut cache = ConfigCache::new();
        cache.voltage_range.insert(2, 1.0);
        cache.offset.insert(2, 0.1);
        cache.set_attenuation(2, 10.0);
        assert!(cache.voltage_range.get(&2).is_none());
        assert!(cache.offset.get(&2).is_none());
        assert_eq!(cache.attenuation.get(&2), Some(&10.0));
    }

    #[test]
    fn test_rate_depth_exclusive() {
        let mut cache = ConfigCache::new();
        cache.set_sample_rate(5_000_000_000);
        cache.set_sample_depth(1_000_000);
        assert!(cache.sample_rate.is_none());
        cache.set_sample_rate(1_000);
        assert!(cache.sample_depth.is_none());
    }

    #[test]
    fn test_flush_keeps_dirty_set() {
        let mut cache = ConfigCache::new();
        cache.set_enabled(3, true);
        cache.offset.insert(3, 1.0);
        cache.flush();
        assert!(cache.enabled.is_empty());
        assert!(cache.offset.is_empty());
        assert!(cache.is_enable_dirty(3));
    }
}
