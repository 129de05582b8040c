//! LeCroy `WAVEDESC` waveform descriptor.
//!
//! A fixed 346-byte little-endian struct returned ahead of every waveform by
//! MAUI instruments and by Siglent models that borrowed the format. Only the
//! fields the acquisition path consumes are decoded.
//!
//! | Offset | Type | Field |
//! |--------|------|-------|
//! | 0 | char[8] | `WAVEDESC` marker |
//! | 32 | u16 | comm type (0 = byte, 1 = word) |
//! | 48 | u32 | trigtime array length (16 bytes per segment) |
//! | 60 | u32 | wave array length, bytes |
//! | 116 | u32 | wave array count, points |
//! | 156 | f32 | vertical gain |
//! | 160 | f32 | vertical offset |
//! | 172 | i16 | nominal bits |
//! | 176 | f32 | horizontal interval, seconds |
//! | 180 | f64 | horizontal offset, seconds |
//! | 196 | char[48] | vertical unit |
//! | 296 | f64, u8 x4, u16 | trigger time |
//! | 328 | f32 | probe attenuation |
//! | 344 | u16 | wave source |

use super::timestamp::InstrumentTime;
use bytes::{Buf, BufMut, BytesMut};
use scope_core::{ScopeError, ScopeResult};

pub const WAVEDESC_SIZE: usize = 346;

const MARKER: &[u8] = b"WAVEDESC";
const UNIT_LEN: usize = 48;
/// Bytes per entry in the trigger-time array (f64 time + f64 offset).
const TRIGTIME_ENTRY: u32 = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct WaveDesc {
    /// True for 16-bit samples.
    pub word_samples: bool,
    pub trigtime_len: u32,
    pub wave_array_bytes: u32,
    pub point_count: u32,
    pub vertical_gain: f32,
    pub vertical_offset: f32,
    pub nominal_bits: i16,
    pub horiz_interval: f32,
    pub horiz_offset: f64,
    pub vertical_unit: String,
    pub trigger_time: InstrumentTime,
    pub probe_factor: f32,
    pub wave_source: u16,
}

impl Default for WaveDesc {
    fn default() -> Self {
        Self {
            word_samples: false,
            trigtime_len: 0,
            wave_array_bytes: 0,
            point_count: 0,
            vertical_gain: 1.0,
            vertical_offset: 0.0,
            nominal_bits: 8,
            horiz_interval: 1e-9,
            horiz_offset: 0.0,
            vertical_unit: "V".to_string(),
            trigger_time: InstrumentTime::default(),
            probe_factor: 1.0,
            wave_source: 0,
        }
    }
}

fn f32_at(raw: &[u8], offset: usize) -> f32 {
    (&raw[offset..]).get_f32_le()
}

fn u32_at(raw: &[u8], offset: usize) -> u32 {
    (&raw[offset..]).get_u32_le()
}

fn u16_at(raw: &[u8], offset: usize) -> u16 {
    (&raw[offset..]).get_u16_le()
}

impl WaveDesc {
    /// Decode a descriptor. Leading bytes before the `WAVEDESC` marker
    /// (`C1:WF DESC,` echoes on some firmware) are skipped.
    pub fn parse(raw: &[u8]) -> ScopeResult<Self> {
        let start = raw
            .windows(MARKER.len())
            .position(|w| w == MARKER)
            .ok_or_else(|| ScopeError::PreambleMalformed("no WAVEDESC marker".into()))?;
        let raw = &raw[start..];
        if raw.len() < WAVEDESC_SIZE {
            return Err(ScopeError::PreambleMalformed(format!(
                "WAVEDESC is {} bytes, expected {}",
                raw.len(),
                WAVEDESC_SIZE
            )));
        }

        let unit = &raw[196..196 + UNIT_LEN];
        let unit_end = unit.iter().position(|&b| b == 0).unwrap_or(UNIT_LEN);
        let vertical_unit = String::from_utf8_lossy(&unit[..unit_end]).trim().to_string();

        let mut tt = &raw[296..];
        let trigger_time = InstrumentTime {
            seconds: tt.get_f64_le(),
            minutes: tt.get_u8(),
            hours: tt.get_u8(),
            days: tt.get_u8(),
            months: tt.get_u8(),
            year: tt.get_u16_le(),
        };

        let desc = Self {
            word_samples: u16_at(raw, 32) == 1,
            trigtime_len: u32_at(raw, 48),
            wave_array_bytes: u32_at(raw, 60),
            point_count: u32_at(raw, 116),
            vertical_gain: f32_at(raw, 156),
            vertical_offset: f32_at(raw, 160),
            nominal_bits: (&raw[172..]).get_i16_le(),
            horiz_interval: f32_at(raw, 176),
            horiz_offset: (&raw[180..]).get_f64_le(),
            vertical_unit,
            trigger_time,
            probe_factor: f32_at(raw, 328),
            wave_source: u16_at(raw, 344),
        };

        if !(desc.horiz_interval.is_finite() && desc.horiz_interval > 0.0) {
            return Err(ScopeError::PreambleMalformed(format!(
                "horizontal interval {}",
                desc.horiz_interval
            )));
        }
        if !desc.vertical_gain.is_finite() {
            return Err(ScopeError::PreambleMalformed("vertical gain is not finite".into()));
        }
        Ok(desc)
    }

    /// Segments in the capture; `1` outside sequence mode.
    pub fn num_sequences(&self) -> usize {
        ((self.trigtime_len / TRIGTIME_ENTRY) as usize).max(1)
    }

    pub fn bytes_per_sample(&self) -> usize {
        if self.word_samples {
            2
        } else {
            1
        }
    }

    /// Serialise; used by the simulated instruments.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::zeroed(WAVEDESC_SIZE);
        buf[..MARKER.len()].copy_from_slice(MARKER);
        let mut put = |offset: usize, bytes: &[u8]| {
            buf[offset..offset + bytes.len()].copy_from_slice(bytes);
        };
        put(32, &u16::from(self.word_samples).to_le_bytes());
        put(36, &(WAVEDESC_SIZE as u32).to_le_bytes());
        put(48, &self.trigtime_len.to_le_bytes());
        put(60, &self.wave_array_bytes.to_le_bytes());
        put(116, &self.point_count.to_le_bytes());
        put(156, &self.vertical_gain.to_le_bytes());
        put(160, &self.vertical_offset.to_le_bytes());
        put(172, &self.nominal_bits.to_le_bytes());
        put(176, &self.horiz_interval.to_le_bytes());
        put(180, &self.horiz_offset.to_le_bytes());
        let unit = self.vertical_unit.as_bytes();
        put(196, &unit[..unit.len().min(UNIT_LEN - 1)]);

        let mut tt = BytesMut::with_capacity(12);
        tt.put_f64_le(self.trigger_time.seconds);
        tt.put_u8(self.trigger_time.minutes);
        tt.put_u8(self.trigger_time.hours);
        tt.put_u8(self.trigger_time.days);
        tt.put_u8(self.trigger_time.months);
        tt.put_u16_le(self.trigger_time.year);
        put(296, &tt);

        put(328, &self.probe_factor.to_le_bytes());
        put(344, &self.wave_source.to_le_bytes());
        buf.to_vec()
    }
}

/// Decode the sequence-mode trigger-time array: per segment an f64 trigger
/// time relative to the first segment and an f64 horizontal offset.
pub fn parse_trigtime(raw: &[u8], segments: usize) -> ScopeResult<Vec<(f64, f64)>> {
    let need = segments * TRIGTIME_ENTRY as usize;
    if raw.len() < need {
        return Err(ScopeError::LengthMismatch {
            expected: need,
            actual: raw.len(),
        });
    }
    let mut buf = &raw[..need];
    Ok((0..segments)
        .map(|_| (buf.get_f64_le(), buf.get_f64_le()))
        .collect())
}

/// Inverse of [`parse_trigtime`], for the simulated instruments.
pub fn encode_trigtime(entries: &[(f64, f64)]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(entries.len() * TRIGTIME_ENTRY as usize);
    for (time, offset) in entries {
        buf.put_f64_le(*time);
        buf.put_f64_le(*offset);
    }
    buf.to_vec()
}
