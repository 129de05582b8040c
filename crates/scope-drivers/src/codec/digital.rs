//! Digital lane demultiplexing and run-length deduplication.

use scope_core::{SparseWaveform, WaveformTiming};

/// Samples at the end of a capture that never start a merged run. Keeps the
/// last few edges individually addressable for renderers that clip the
/// final run.
pub const FINAL_RUN_GUARD: usize = 5;

/// Build a deduplicated sparse waveform from one lane's samples.
///
/// A sample merges into the current run when its value matches and the run
/// started before the final [`FINAL_RUN_GUARD`] samples. Durations always sum
/// to the sample count.
pub fn dedup_lane<I>(samples: I, timing: WaveformTiming) -> SparseWaveform<bool>
where
    I: ExactSizeIterator<Item = bool>,
{
    let n = samples.len();
    let mut out = SparseWaveform::new(timing);
    let mut run: Option<(usize, usize, bool)> = None;
    for (i, value) in samples.enumerate() {
        run = match run {
            Some((start, len, v)) if v == value && start + FINAL_RUN_GUARD < n => {
                Some((start, len + 1, v))
            }
            Some((start, len, v)) => {
                out.push(start as i64, len as i64, v);
                Some((i, 1, value))
            }
            None => Some((i, 1, value)),
        };
    }
    if let Some((start, len, v)) = run {
        out.push(start as i64, len as i64, v);
    }
    out.shrink_to_fit();
    out
}

/// Split a byte-per-sample stream into 8 lanes (`bit j` → lane `j`), each
/// deduplicated.
pub fn demux_lanes(bytes: &[u8], timing: WaveformTiming) -> Vec<SparseWaveform<bool>> {
    (0..8)
        .map(|lane| {
            let mask = 1u8 << lane;
            dedup_lane(bytes.iter().map(move |b| b & mask != 0), timing)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuples(w: &SparseWaveform<bool>) -> Vec<(i64, i64, bool)> {
        w.iter().map(|(o, d, s)| (o, d, *s)).collect()
    }

    #[test]
    fn test_three_runs() {
        let bits: Vec<bool> = (0..24).map(|i| (8..16).contains(&i)).collect();
        let w = dedup_lane(bits.into_iter(), WaveformTiming::default());
        assert_eq!(
            tuples(&w),
            vec![(0, 8, false), (8, 8, true), (16, 8, false)]
        );
    }

    #[test]
    fn test_final_guard() {
        // last run starts inside the final five samples: kept unmerged
        let mut bits = vec![false; 10];
        bits.extend([true; 3]);
        let w = dedup_lane(bits.into_iter(), WaveformTiming::default());
        assert_eq!(
            tuples(&w),
            vec![(0, 10, false), (10, 1, true), (11, 1, true), (12, 1, true)]
        );
        let total: i64 = w.iter().map(|(_, d, _)| d).sum();
        assert_eq!(total, 13);
    }

    #[test]
    fn test_adjacent_values_differ() {
        let bits: Vec<bool> = (0..100).map(|i| (i / 7) % 2 == 0).collect();
        let w = dedup_lane(bits.into_iter(), WaveformTiming::default());
        let t = tuples(&w);
        let guard_start = 100 - FINAL_RUN_GUARD as i64;
        for pair in t.windows(2) {
            if pair[1].0 < guard_start {
                assert_ne!(pair[0].2, pair[1].2);
            }
        }
        assert_eq!(t.iter().map(|x| x.1).sum::<i64>(), 100);
    }

    #[test]
    fn test_demux() {
        let bytes = [0b0000_0001u8, 0b0000_0011, 0b0000_0010, 0b0000_0000];
        let lanes = demux_lanes(&bytes, WaveformTiming::default());
        assert_eq!(lanes.len(), 8);
        assert_eq!(lanes[0].samples.as_slice(), &[true, true, false, false]);
        assert_eq!(lanes[7].len(), 4);
        assert!(lanes[7].samples.as_slice().iter().all(|s| !s));
    }

    #[test]
    fn test_empty() {
        let w = dedup_lane(Vec::<bool>::new().into_iter(), WaveformTiming::default());
        assert!(w.is_empty());
    }
}
