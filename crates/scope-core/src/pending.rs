//! Bounded FIFO of captured sequence sets.
//!
//! The acquisition engine pushes, consumers pop. When the queue is full the
//! oldest set is discarded and counted, so a slow consumer never stalls capture
//! or grows memory without bound.

use crate::waveform::SequenceSet;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default number of sets held before drop-oldest kicks in.
pub const DEFAULT_PENDING_DEPTH: usize = 16;

#[derive(Debug)]
pub struct PendingWaveforms {
    queue: Mutex<VecDeque<SequenceSet>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl PendingWaveforms {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Append a set, discarding the oldest if the queue is full.
    pub fn push(&self, set: SequenceSet) {
        let mut queue = self.queue.lock();
        while queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(set);
    }

    /// Append several sets atomically with respect to consumers.
    pub fn extend(&self, sets: impl IntoIterator<Item = SequenceSet>) {
        let mut queue = self.queue.lock();
        for set in sets {
            while queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(set);
        }
    }

    pub fn pop(&self) -> Option<SequenceSet> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of sets discarded since construction.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for PendingWaveforms {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_DEPTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waveform::{UniformWaveform, Waveform, WaveformTiming};

    fn tagged(seconds: i64) -> SequenceSet {
        let mut timing = WaveformTiming::default();
        timing.set_start(seconds, 0);
        let mut set = SequenceSet::new();
        set.insert(0, Waveform::Analog(UniformWaveform::new(timing)));
        set
    }

    #[test]
    fn test_drop_oldest() {
        let pending = PendingWaveforms::new(2);
        pending.push(tagged(1));
        pending.push(tagged(2));
        pending.push(tagged(3));
        assert_eq!(pending.len(), 2);
        assert_eq!(pending.dropped_count(), 1);
        assert_eq!(pending.pop().unwrap().start_key(), Some((2, 0)));
        assert_eq!(pending.pop().unwrap().start_key(), Some((3, 0)));
        assert!(pending.pop().is_none());
    }

    #[test]
    fn test_clear() {
        let pending = PendingWaveforms::default();
        pending.extend(vec![tagged(1), tagged(2)]);
        pending.clear();
        assert!(pending.is_empty());
        assert_eq!(pending.dropped_count(), 0);
    }
}
