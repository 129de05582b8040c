//! Raw ADC code to calibrated sample conversion.
//!
//! The acquisition engine hands each channel's codes to a [`SampleConverter`]
//! with a gain and offset: `value = gain * code - offset`. [`CpuConverter`] is
//! the reference implementation; a GPU-backed converter can be slotted in by
//! implementing the same trait and marking the output buffer GPU-resident.

use crate::waveform::SampleBuffer;

/// Convert N raw codes to float samples using `(gain, offset)`.
///
/// Both methods return `true` if any code sat on a rail of its type, which the
/// caller records as [`crate::WaveformFlags::CLIPPING`].
pub trait SampleConverter: Send + Sync {
    fn convert_i8(&self, codes: &[i8], gain: f32, offset: f32, out: &mut SampleBuffer<f32>)
        -> bool;

    fn convert_i16(
        &self,
        codes: &[i16],
        gain: f32,
        offset: f32,
        out: &mut SampleBuffer<f32>,
    ) -> bool;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CpuConverter;

impl SampleConverter for CpuConverter {
    fn convert_i8(
        &self,
        codes: &[i8],
        gain: f32,
        offset: f32,
        out: &mut SampleBuffer<f32>,
    ) -> bool {
        out.resize(codes.len());
        let mut clipped = false;
        for (dst, &code) in out.as_mut_slice().iter_mut().zip(codes) {
            clipped |= code == i8::MIN || code == i8::MAX;
            *dst = gain * f32::from(code) - offset;
        }
        out.mark_modified_from_cpu();
        clipped
    }

    fn convert_i16(
        &self,
        codes: &[i16],
        gain: f32,
        offset: f32,
        out: &mut SampleBuffer<f32>,
    ) -> bool {
        out.resize(codes.len());
        let mut clipped = false;
        for (dst, &code) in out.as_mut_slice().iter_mut().zip(codes) {
            clipped |= code == i16::MIN || code == i16::MAX;
            *dst = gain * f32::from(code) - offset;
        }
        out.mark_modified_from_cpu();
        clipped
    }

    fn name(&self) -> &'static str {
        "cpu"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_i8() {
        let mut out = SampleBuffer::new();
        let clipped = CpuConverter.convert_i8(&[0, 10, -10], 0.01, 0.5, &mut out);
        assert!(!clipped);
        let v = out.as_slice();
        assert!((v[0] + 0.5).abs() < 1e-6);
        assert!((v[1] + 0.4).abs() < 1e-6);
        assert!((v[2] + 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_convert_i16_clipping() {
        let mut out = SampleBuffer::new();
        assert!(CpuConverter.convert_i16(&[i16::MAX, 0], 1.0, 0.0, &mut out));
        assert_eq!(out.len(), 2);
        assert!(out.is_gpu_stale());
    }
}
