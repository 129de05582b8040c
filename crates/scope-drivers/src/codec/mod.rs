//! Waveform descriptor codecs and sample decoding.
//!
//! - [`wavedesc`]: LeCroy/Siglent 346-byte binary descriptor
//! - [`wfmpre`]: Tektronix semicolon-separated preamble
//! - [`samples`]: code decoding and gain/offset derivation with family quirks
//! - [`digital`]: lane demultiplexing and run-length deduplication
//! - [`lecroy_digital`]: LeCroy MSO XML/Base64 digital capture
//! - [`timestamp`]: instrument local time to epoch seconds + femtoseconds

pub mod digital;
pub mod lecroy_digital;
pub mod samples;
pub mod timestamp;
pub mod wavedesc;
pub mod wfmpre;

use scope_core::{WaveformTiming, FS_PER_SECOND};

/// Timing for a uniform record from its sample interval and the offset from
/// the trigger to the first sample, both in seconds.
///
/// `timescale` is the interval rounded to whole femtoseconds; `trigger_phase`
/// is the fractional-sample part of the offset, folded into `[0, timescale)`.
pub fn uniform_timing(interval: f64, trigger_offset: f64) -> WaveformTiming {
    let fs = FS_PER_SECOND as f64;
    let timescale = (interval * fs).round() as i64;
    let phase = (trigger_offset / interval).fract() * interval;
    let phase = (phase * fs).round() as i64;
    WaveformTiming {
        timescale,
        trigger_phase: phase.rem_euclid(timescale.max(1)),
        ..WaveformTiming::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timescale_rounding() {
        // 1/3 ns does not land on a whole femtosecond
        let t = uniform_timing(1.0 / 3.0e9, 0.0);
        assert_eq!(t.timescale, 333_333);
        let t = uniform_timing(2.5e-10, 0.0);
        assert_eq!(t.timescale, 250_000);
        // f32 interval from a descriptor
        let t = uniform_timing(f64::from(2e-10f32), 0.0);
        assert_eq!(t.timescale, 200_000);
    }

    #[test]
    fn test_trigger_phase() {
        // offset of -10.25 samples: phase is a quarter sample past the grid
        let interval = 1e-9;
        let t = uniform_timing(interval, -10.25e-9);
        assert_eq!(t.timescale, 1_000_000);
        assert_eq!(t.trigger_phase, 750_000);
        let t = uniform_timing(interval, 3.5e-9);
        assert_eq!(t.trigger_phase, 500_000);
        let t = uniform_timing(interval, -4e-9);
        assert_eq!(t.trigger_phase, 0);
    }
}
