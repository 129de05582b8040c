//! Raw sample decoding and calibration.

use super::wavedesc::WaveDesc;
use crate::family::Family;
use scope_core::{SampleBuffer, SampleConverter, ScopeError, ScopeResult};

/// Codes per vertical division the legacy Siglent descriptor gain assumes.
pub const NOMINAL_CODES_PER_DIV: f64 = 25.0;

/// Actual codes per division on SDS1000 for a V/div setting.
pub fn codes_per_div(volts_per_div: f64) -> f64 {
    if volts_per_div < 0.010 {
        63.75
    } else if volts_per_div < 0.100 {
        127.5
    } else {
        170.0
    }
}

/// `value = gain * code - offset`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub gain: f64,
    pub offset: f64,
}

impl Calibration {
    /// Derive from a descriptor, applying the family quirks in order:
    /// variable codes per division, 8-bit codes in 16-bit words, probe factor.
    pub fn from_wavedesc(desc: &WaveDesc, family: Family) -> Self {
        let mut gain = f64::from(desc.vertical_gain);
        let mut offset = f64::from(desc.vertical_offset);

        if family.has_variable_codes_per_div() {
            // descriptor gain is V/div on these models
            let scaled = gain * (NOMINAL_CODES_PER_DIV / codes_per_div(gain));
            gain = scaled / NOMINAL_CODES_PER_DIV;
        }
        if desc.word_samples && desc.nominal_bits <= 8 {
            // 8-bit code in the high byte of each word
            gain /= 256.0;
        }
        if family.scales_by_probe_factor() && desc.probe_factor > 0.0 {
            gain *= f64::from(desc.probe_factor);
            offset *= f64::from(desc.probe_factor);
        }
        Self { gain, offset }
    }
}

/// Raw codes of one record.
#[derive(Debug, Clone, PartialEq)]
pub enum Codes {
    I8(Vec<i8>),
    I16(Vec<i16>),
}

impl Codes {
    pub fn len(&self) -> usize {
        match self {
            Codes::I8(c) => c.len(),
            Codes::I16(c) => c.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode a block body. Trailing odd bytes are an error.
    pub fn decode(raw: &[u8], bytes_per_sample: usize, big_endian: bool) -> ScopeResult<Self> {
        match bytes_per_sample {
            1 => Ok(Codes::I8(raw.iter().map(|&b| b as i8).collect())),
            2 => {
                if raw.len() % 2 != 0 {
                    return Err(ScopeError::LengthMismatch {
                        expected: raw.len() + 1,
                        actual: raw.len(),
                    });
                }
                Ok(Codes::I16(
                    raw.chunks_exact(2)
                        .map(|p| {
                            let pair = [p[0], p[1]];
                            if big_endian {
                                i16::from_be_bytes(pair)
                            } else {
                                i16::from_le_bytes(pair)
                            }
                        })
                        .collect(),
                ))
            }
            n => Err(ScopeError::PreambleMalformed(format!(
                "{} bytes per sample",
                n
            ))),
        }
    }

    /// Codes `[start, start + len)`, for splitting segmented captures.
    pub fn slice(&self, start: usize, len: usize) -> ScopeResult<Codes> {
        let end = start + len;
        if end > self.len() {
            return Err(ScopeError::LengthMismatch {
                expected: end,
                actual: self.len(),
            });
        }
        Ok(match self {
            Codes::I8(c) => Codes::I8(c[start..end].to_vec()),
            Codes::I16(c) => Codes::I16(c[start..end].to_vec()),
        })
    }

    /// Convert into `out`; returns true if any code clipped.
    pub fn convert(
        &self,
        converter: &dyn SampleConverter,
        cal: Calibration,
        out: &mut SampleBuffer<f32>,
    ) -> bool {
        match self {
            Codes::I8(c) => converter.convert_i8(c, cal.gain as f32, cal.offset as f32, out),
            Codes::I16(c) => converter.convert_i16(c, cal.gain as f32, cal.offset as f32, out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scope_core::CpuConverter;

    #[test]
    fn test_codes_per_div() {
        assert_eq!(codes_per_div(0.005), 63.75);
        assert_eq!(codes_per_div(0.05), 127.5);
        assert_eq!(codes_per_div(1.0), 170.0);
    }

    #[test]
    fn test_legacy_gain() {
        let desc = WaveDesc {
            vertical_gain: 0.5,
            ..WaveDesc::default()
        };
        let cal = Calibration::from_wavedesc(&desc, Family::Sds1000);
        // 0.5 V/div over 170 codes
        assert!((cal.gain - 0.5 / 170.0).abs() < 1e-12);
        let plain = Calibration::from_wavedesc(&desc, Family::LeCroyMaui);
        assert_eq!(plain.gain, 0.5);
    }

    #[test]
    fn test_word_with_byte_codes() {
        let desc = WaveDesc {
            vertical_gain: 0.01,
            word_samples: true,
            nominal_bits: 8,
            ..WaveDesc::default()
        };
        let cal = Calibration::from_wavedesc(&desc, Family::LeCroyMaui);
        assert!((cal.gain - 0.01 / 256.0).abs() < 1e-12);
        let hd = WaveDesc {
            nominal_bits: 12,
            ..desc
        };
        assert_eq!(Calibration::from_wavedesc(&hd, Family::LeCroyMaui).gain, 0.01f32 as f64);
    }

    #[test]
    fn test_probe_factor() {
        let desc = WaveDesc {
            vertical_gain: 0.001,
            vertical_offset: 0.2,
            probe_factor: 10.0,
            ..WaveDesc::default()
        };
        let cal = Calibration::from_wavedesc(&desc, Family::Sds2000Xp);
        assert!((cal.gain - 0.01).abs() < 1e-9);
        assert!((cal.offset - 2.0).abs() < 1e-6);
        let maui = Calibration::from_wavedesc(&desc, Family::LeCroyMaui);
        assert!((maui.gain - 0.001).abs() < 1e-9);
    }

    #[test]
    fn test_decode_and_convert() {
        let codes = Codes::decode(&[0x01, 0x00, 0xff, 0xff], 2, false).unwrap();
        assert_eq!(codes, Codes::I16(vec![1, -1]));
        let be = Codes::decode(&[0x01, 0x00], 2, true).unwrap();
        assert_eq!(be, Codes::I16(vec![256]));
        assert!(Codes::decode(&[1, 2, 3], 2, false).is_err());

        let mut out = SampleBuffer::new();
        let clipped = Codes::I8(vec![10, -128]).convert(
            &CpuConverter,
            Calibration {
                gain: 0.5,
                offset: 1.0,
            },
            &mut out,
        );
        assert!(clipped);
        assert_eq!(out.as_slice(), &[4.0, -65.0]);
    }

    #[test]
    fn test_slice() {
        let codes = Codes::I8(vec![1, 2, 3, 4]);
        assert_eq!(codes.slice(2, 2).unwrap(), Codes::I8(vec![3, 4]));
        assert!(codes.slice(3, 2).is_err());
    }
}
