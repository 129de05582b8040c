//! Horizontal settings: sample rate and depth, trigger position,
//! interleaving, segmented capture and ADC resolution.
//!
//! The trigger offset is kept the way the waveform decoder sees it:
//! femtoseconds from the trigger back to the first sample of the record. The
//! instruments express the same thing as a delay of the trigger point from
//! the record centre, so `offset = record_length / 2 - delay`.

use crate::cache::ConfigCache;
use crate::driver::ScopeDriver;
use crate::family::{Family, Vendor};
use crate::trigger::{fmt_sci, fs_to_seconds, seconds_to_fs};
use crate::wire;
use scope_core::{ScopeError, ScopeResult};
use std::sync::atomic::Ordering;

/// Horizontal divisions on the legacy Siglent screen.
const LEGACY_DIVISIONS: f64 = 14.0;

const GIGA: u64 = 1_000_000_000;
const MEGA: u64 = 1_000_000;

/// `1, 2, 5 × 10^k` values in `[min, max]`, plus `max` itself.
fn one_two_five(min: u64, max: u64) -> Vec<u64> {
    let mut out = Vec::new();
    let mut decade = 1u64;
    while decade <= max {
        for step in [1, 2, 5] {
            let v = decade * step;
            if v >= min && v <= max {
                out.push(v);
            }
        }
        decade = match decade.checked_mul(10) {
            Some(d) => d,
            None => break,
        };
    }
    if out.last() != Some(&max) {
        out.push(max);
    }
    out
}

/// Highest real-time rate with every channel available, Sa/s.
fn max_rate(family: Family, bandwidth_mhz: u32) -> u64 {
    match family {
        Family::LeCroyMaui | Family::LeCroyMauiFastWavePort => {
            if bandwidth_mhz > 8000 {
                40 * GIGA
            } else {
                10 * GIGA
            }
        }
        Family::TekMso5 => 6_250_000_000,
        Family::TekMso6 => 25 * GIGA,
        Family::Sds5000X | Family::Sds6000A => 5 * GIGA,
        Family::Sds2000Xp | Family::Sds2000XHd | Family::Sds800XHd | Family::Sds2000Xe => 2 * GIGA,
        Family::Sds1000 | Family::Unknown => GIGA,
    }
}

impl ScopeDriver {
    // =========================================================================
    // Rate and depth tables
    // =========================================================================

    pub fn sample_rates_non_interleaved(&self) -> Vec<u64> {
        one_two_five(1_000, max_rate(self.family, self.max_bandwidth))
    }

    /// Rates with paired channels combined; identical to the non-interleaved
    /// table on families that cannot interleave.
    pub fn sample_rates_interleaved(&self) -> Vec<u64> {
        let max = max_rate(self.family, self.max_bandwidth);
        match self.vendor() {
            Vendor::LeCroy => one_two_five(1_000, max * 2),
            _ => one_two_five(1_000, max),
        }
    }

    fn max_depth(&self) -> u64 {
        let tier = self.options().max_memory_depth;
        match self.family {
            Family::TekMso5 | Family::TekMso6 => tier.max(62_500_000),
            Family::Sds6000A => 500 * MEGA,
            Family::Sds5000X => 250 * MEGA,
            Family::Sds2000Xp | Family::Sds2000XHd => 200 * MEGA,
            Family::Sds800XHd => 100 * MEGA,
            Family::Sds2000Xe => 28 * MEGA,
            Family::Sds1000 => 14 * MEGA,
            _ => tier,
        }
    }

    pub fn sample_depths_non_interleaved(&self) -> Vec<u64> {
        match self.family {
            // 14-point-per-division memory on the legacy line
            Family::Sds1000 | Family::Sds2000Xe => {
                let mut depths: Vec<u64> = vec![14_000, 140_000, 1_400_000, 14 * MEGA];
                if self.family == Family::Sds2000Xe {
                    depths.push(28 * MEGA);
                }
                depths
            }
            _ => one_two_five(1_000, self.max_depth()),
        }
    }

    /// Interleaved LeCroy channels pool their memory.
    pub fn sample_depths_interleaved(&self) -> Vec<u64> {
        match self.vendor() {
            Vendor::LeCroy => one_two_five(1_000, self.max_depth() * 2),
            _ => self.sample_depths_non_interleaved(),
        }
    }

    // =========================================================================
    // Sample rate
    // =========================================================================

    async fn read_sample_rate(&self) -> ScopeResult<u64> {
        let rate = match self.vendor() {
            Vendor::LeCroy => self.vbs_f64("Acquisition.Horizontal.SampleRate").await?,
            Vendor::Tektronix => self.query_number("HORIZONTAL:MODE:SAMPLERATE?").await?,
            Vendor::Siglent if self.is_legacy() => self.query_number("SARA?").await?,
            Vendor::Siglent => self.query_number(":ACQUIRE:SRATE?").await?,
            Vendor::Unknown => return Ok(0),
        };
        Ok(rate.round().max(0.0) as u64)
    }

    async fn cached_sample_rate(&self, cache: &mut ConfigCache) -> ScopeResult<u64> {
        if let Some(rate) = cache.sample_rate {
            return Ok(rate);
        }
        let rate = self.read_sample_rate().await?;
        cache.sample_rate = Some(rate);
        Ok(rate)
    }

    /// Samples per second.
    pub async fn sample_rate(&self) -> ScopeResult<u64> {
        let mut cache = self.cache.lock().await;
        self.cached_sample_rate(&mut cache).await
    }

    pub async fn set_sample_rate(&self, rate: u64) -> ScopeResult<()> {
        let mut cache = self.cache.lock().await;
        let interleaved = self.cached_interleaving(&mut cache).await?;
        let legal = if interleaved {
            self.sample_rates_interleaved()
        } else {
            self.sample_rates_non_interleaved()
        };
        if !legal.contains(&rate) {
            return Err(ScopeError::InvalidParameter(format!(
                "sample rate {} Sa/s",
                rate
            )));
        }

        match self.vendor() {
            Vendor::LeCroy => {
                self.vbs_set("Acquisition.Horizontal.Maximize", "\"FixedSampleRate\"");
                self.vbs_set("Acquisition.Horizontal.SampleRate", rate);
            }
            Vendor::Tektronix => {
                self.pipe.send_queued("HORIZONTAL:MODE MANUAL");
                self.pipe
                    .send_queued(format!("HORIZONTAL:MODE:SAMPLERATE {}", fmt_sci(rate as f64)));
            }
            Vendor::Siglent if self.is_legacy() => {
                // rate follows from memory size and time/div
                let depth = self.cached_sample_depth(&mut cache).await?;
                let tdiv = depth as f64 / (LEGACY_DIVISIONS * rate as f64);
                self.pipe.send_queued(format!("TDIV {}", fmt_sci(tdiv)));
            }
            Vendor::Siglent => {
                self.pipe.send_queued(":ACQUIRE:MMANAGEMENT FSRATE");
                self.pipe
                    .send_queued(format!(":ACQUIRE:SRATE {}", fmt_sci(rate as f64)));
            }
            Vendor::Unknown => {}
        }
        cache.set_sample_rate(rate);
        cache.trigger_offset = None;
        Ok(())
    }

    // =========================================================================
    // Sample depth
    // =========================================================================

    async fn read_sample_depth(&self) -> ScopeResult<u64> {
        let depth = match self.vendor() {
            Vendor::LeCroy => self.vbs_f64("Acquisition.Horizontal.MaxSamples").await?,
            Vendor::Tektronix => self.query_number("HORIZONTAL:MODE:RECORDLENGTH?").await?,
            Vendor::Siglent if self.is_legacy() => self.query_number("MSIZ?").await?,
            Vendor::Siglent => self.query_number(":ACQUIRE:MDEPTH?").await?,
            Vendor::Unknown => return Ok(0),
        };
        Ok(depth.round().max(0.0) as u64)
    }

    async fn cached_sample_depth(&self, cache: &mut ConfigCache) -> ScopeResult<u64> {
        if let Some(depth) = cache.sample_depth {
            return Ok(depth);
        }
        let depth = self.read_sample_depth().await?;
        cache.sample_depth = Some(depth);
        Ok(depth)
    }

    /// Points per acquisition (per segment in sequence mode).
    pub async fn sample_depth(&self) -> ScopeResult<u64> {
        let mut cache = self.cache.lock().await;
        self.cached_sample_depth(&mut cache).await
    }

    pub async fn set_sample_depth(&self, depth: u64) -> ScopeResult<()> {
        let mut cache = self.cache.lock().await;
        let interleaved = self.cached_interleaving(&mut cache).await?;
        let legal = if interleaved {
            self.sample_depths_interleaved()
        } else {
            self.sample_depths_non_interleaved()
        };
        if !legal.contains(&depth) {
            return Err(ScopeError::InvalidParameter(format!(
                "sample depth {} points",
                depth
            )));
        }

        match self.vendor() {
            Vendor::LeCroy => {
                self.vbs_set("Acquisition.Horizontal.Maximize", "\"SetMaximumMemory\"");
                self.vbs_set("Acquisition.Horizontal.MaxSamples", depth);
            }
            Vendor::Tektronix => {
                self.pipe.send_queued("HORIZONTAL:MODE MANUAL");
                self.pipe
                    .send_queued(format!("HORIZONTAL:MODE:RECORDLENGTH {}", depth));
            }
            Vendor::Siglent if self.is_legacy() => {
                self.pipe
                    .send_queued(format!("MSIZ {}", wire::fmt_depth(depth).to_ascii_uppercase()));
            }
            Vendor::Siglent => {
                self.pipe.send_queued(":ACQUIRE:MMANAGEMENT FMDEPTH");
                self.pipe
                    .send_queued(format!(":ACQUIRE:MDEPTH {}", wire::fmt_depth(depth)));
            }
            Vendor::Unknown => {}
        }
        cache.set_sample_depth(depth);
        cache.trigger_offset = None;
        Ok(())
    }

    // =========================================================================
    // Trigger position
    // =========================================================================

    fn delay_query(&self) -> &'static str {
        match self.vendor() {
            Vendor::Tektronix => "HORIZONTAL:DELAY:TIME",
            Vendor::Siglent if self.is_legacy() => "TRDL",
            _ => ":TIMEBASE:DELAY",
        }
    }

    /// Half the record length in seconds.
    async fn half_width(&self, cache: &mut ConfigCache) -> ScopeResult<f64> {
        let rate = self.cached_sample_rate(cache).await?;
        let depth = self.cached_sample_depth(cache).await?;
        if rate == 0 {
            return Ok(0.0);
        }
        Ok(depth as f64 / rate as f64 / 2.0)
    }

    /// Femtoseconds from the trigger back to the start of the record.
    pub async fn trigger_offset(&self) -> ScopeResult<i64> {
        let mut cache = self.cache.lock().await;
        if let Some(offset) = cache.trigger_offset {
            return Ok(offset);
        }
        let delay = match self.vendor() {
            Vendor::LeCroy => self.vbs_f64("Acquisition.Horizontal.HorOffset").await?,
            Vendor::Unknown => 0.0,
            _ => self.query_number(&format!("{}?", self.delay_query())).await?,
        };
        let offset = seconds_to_fs(self.half_width(&mut cache).await? - delay);
        cache.trigger_offset = Some(offset);
        Ok(offset)
    }

    pub async fn set_trigger_offset(&self, offset_fs: i64) -> ScopeResult<()> {
        let mut cache = self.cache.lock().await;
        let delay = fmt_sci(self.half_width(&mut cache).await? - fs_to_seconds(offset_fs));
        match self.vendor() {
            Vendor::LeCroy => self.vbs_set("Acquisition.Horizontal.HorOffset", delay),
            Vendor::Tektronix => {
                self.pipe.send_queued("HORIZONTAL:DELAY:MODE ON");
                self.pipe
                    .send_queued(format!("{} {}", self.delay_query(), delay));
            }
            Vendor::Siglent => self
                .pipe
                .send_queued(format!("{} {}", self.delay_query(), delay)),
            Vendor::Unknown => {}
        }
        cache.trigger_offset = Some(offset_fs);
        Ok(())
    }

    // =========================================================================
    // Interleaving
    // =========================================================================

    async fn cached_interleaving(&self, cache: &mut ConfigCache) -> ScopeResult<bool> {
        if self.vendor() != Vendor::LeCroy {
            return Ok(false);
        }
        if let Some(on) = cache.interleaving {
            return Ok(on);
        }
        let combined = self.query_text("COMBINE_CHANNELS?").await?;
        let on = combined.trim() == "2";
        cache.interleaving = Some(on);
        Ok(on)
    }

    pub async fn is_interleaving(&self) -> ScopeResult<bool> {
        let mut cache = self.cache.lock().await;
        self.cached_interleaving(&mut cache).await
    }

    /// Two analog channels that share an ADC when interleaved: 1&2, 3&4.
    pub fn is_interleaving_conflict(&self, a: usize, b: usize) -> bool {
        self.vendor() == Vendor::LeCroy
            && a != b
            && a < self.analog_count
            && b < self.analog_count
            && a / 2 == b / 2
    }

    /// Interleaving is possible when no ADC pair has both inputs enabled.
    pub async fn can_interleave(&self) -> ScopeResult<bool> {
        if self.vendor() != Vendor::LeCroy {
            return Ok(false);
        }
        for pair in (0..self.analog_count).step_by(2) {
            if pair + 1 < self.analog_count
                && self.is_channel_enabled(pair).await?
                && self.is_channel_enabled(pair + 1).await?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub async fn set_interleaving(&self, on: bool) -> ScopeResult<()> {
        if self.vendor() != Vendor::LeCroy {
            if on {
                return Err(ScopeError::Unsupported(format!(
                    "{} cannot interleave",
                    self.family
                )));
            }
            return Ok(());
        }
        if on && !self.can_interleave().await? {
            return Err(ScopeError::InvalidParameter(
                "both channels of an ADC pair are enabled".into(),
            ));
        }
        let mut cache = self.cache.lock().await;
        self.pipe
            .send_queued(format!("COMBINE_CHANNELS {}", if on { 2 } else { 1 }));
        cache.set_interleaving(on);
        cache.trigger_offset = None;
        Ok(())
    }

    // =========================================================================
    // Segmented capture
    // =========================================================================

    /// Segments per acquisition; `1` when sequence mode is off.
    pub async fn segment_count(&self) -> ScopeResult<usize> {
        let mut cache = self.cache.lock().await;
        if let Some(n) = cache.segments {
            return Ok(n);
        }
        let n = match self.vendor() {
            Vendor::LeCroy => {
                let mode = self.vbs_get("Acquisition.Horizontal.SampleMode").await?;
                if mode.eq_ignore_ascii_case("Sequence") {
                    self.vbs_f64("Acquisition.Horizontal.NumSegments").await?
                } else {
                    1.0
                }
            }
            Vendor::Siglent if !self.is_legacy() => {
                if self.query_flag(":ACQUIRE:SEQUENCE?").await? {
                    self.query_number(":ACQUIRE:SEQUENCE:COUNT?").await?
                } else {
                    1.0
                }
            }
            _ => 1.0,
        };
        let n = (n.round() as usize).max(1);
        cache.segments = Some(n);
        Ok(n)
    }

    /// Turn sequence mode on with `count` segments, or off with `1`.
    pub async fn set_segment_count(&self, count: usize) -> ScopeResult<()> {
        if count == 0 {
            return Err(ScopeError::InvalidParameter("zero segments".into()));
        }
        let mut cache = self.cache.lock().await;
        match self.vendor() {
            Vendor::LeCroy => {
                if count > 1 {
                    self.vbs_set("Acquisition.Horizontal.SampleMode", "\"Sequence\"");
                    self.vbs_set("Acquisition.Horizontal.NumSegments", count);
                } else {
                    self.vbs_set("Acquisition.Horizontal.SampleMode", "\"RealTime\"");
                }
            }
            Vendor::Siglent if !self.is_legacy() => {
                if count > 1 {
                    self.pipe.send_queued(":ACQUIRE:SEQUENCE ON");
                    self.pipe
                        .send_queued(format!(":ACQUIRE:SEQUENCE:COUNT {}", count));
                } else {
                    self.pipe.send_queued(":ACQUIRE:SEQUENCE OFF");
                }
            }
            _ if count == 1 => {}
            _ => {
                return Err(ScopeError::Unsupported(format!(
                    "segmented capture on {}",
                    self.family
                )))
            }
        }
        cache.segments = Some(count);
        Ok(())
    }

    // =========================================================================
    // ADC resolution
    // =========================================================================

    /// ADC bits per sample.
    pub async fn adc_resolution(&self) -> ScopeResult<u8> {
        if !self.family.supports_resolution_switch() {
            return Ok(8);
        }
        let reply = self.query_text(":ACQUIRE:RESOLUTION?").await?;
        let bits = wire::leading_number(&reply)
            .ok_or_else(|| ScopeError::parse(reply.clone(), "ADC resolution"))?;
        Ok(bits as u8)
    }

    /// Switch between 8- and 10-bit capture. The transfer width follows.
    pub async fn set_adc_resolution(&self, bits: u8) -> ScopeResult<()> {
        if !self.family.supports_resolution_switch() {
            if bits == 8 {
                return Ok(());
            }
            return Err(ScopeError::Unsupported(format!(
                "{}-bit capture on {}",
                bits, self.family
            )));
        }
        if bits != 8 && bits != 10 {
            return Err(ScopeError::InvalidParameter(format!("{}-bit ADC", bits)));
        }
        {
            let mut cache = self.cache.lock().await;
            self.pipe
                .send_queued(format!(":ACQUIRE:RESOLUTION {}Bits", bits));
            // the rate/depth tables differ between resolutions
            cache.sample_rate = None;
            cache.sample_depth = None;
            cache.trigger_offset = None;
        }
        self.word_transfer.store(bits > 8, Ordering::Relaxed);
        self.select_transfer_format().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverSettings;
    use crate::sim::lecroy::LeCroySim;
    use crate::sim::siglent::SiglentSim;
    use crate::sim::tek::TekSim;
    use scope_scpi::{MockHandle, MockTransport, Responder};

    async fn connect(sim: impl Responder + 'static) -> (ScopeDriver, MockHandle) {
        let transport = MockTransport::new(sim);
        let handle = transport.handle();
        let scope = ScopeDriver::connect(Box::new(transport), DriverSettings::default())
            .await
            .unwrap();
        (scope, handle)
    }

    #[test]
    fn test_one_two_five() {
        assert_eq!(one_two_five(1_000, 10_000), vec![1_000, 2_000, 5_000, 10_000]);
        assert_eq!(
            one_two_five(1, 6_250),
            vec![1, 2, 5, 10, 20, 50, 100, 200, 500, 1_000, 2_000, 5_000, 6_250]
        );
    }

    #[tokio::test]
    async fn test_rate_tables() {
        let (lecroy, _) = connect(LeCroySim::new("WAVERUNNER9254M", "")).await;
        assert_eq!(lecroy.sample_rates_non_interleaved().last(), Some(&(10 * GIGA)));
        assert_eq!(lecroy.sample_rates_interleaved().last(), Some(&(20 * GIGA)));
        assert_eq!(lecroy.sample_depths_non_interleaved().last(), Some(&(10 * MEGA)));

        let (legacy, _) = connect(SiglentSim::new("SDS1202X-E")).await;
        assert_eq!(
            legacy.sample_depths_non_interleaved(),
            vec![14_000, 140_000, 1_400_000, 14 * MEGA]
        );
        assert_eq!(
            legacy.sample_rates_interleaved(),
            legacy.sample_rates_non_interleaved()
        );
    }

    #[tokio::test]
    async fn test_rate_and_depth_round_trip() {
        let (scope, _) = connect(TekSim::new("MSO64", "")).await;
        assert_eq!(scope.sample_rate().await.unwrap(), 6_250_000_000);
        assert_eq!(scope.sample_depth().await.unwrap(), 1000);
        scope.set_sample_rate(GIGA).await.unwrap();
        scope.set_sample_depth(10_000).await.unwrap();
        scope.pipe.flush().await.unwrap();
        scope.flush_config_cache().await.unwrap();
        assert_eq!(scope.sample_rate().await.unwrap(), GIGA);
        assert_eq!(scope.sample_depth().await.unwrap(), 10_000);
        assert!(matches!(
            scope.set_sample_rate(3_000).await,
            Err(ScopeError::InvalidParameter(_))
        ));
    }

    #[tokio::test]
    async fn test_siglent_depth_uses_suffix() {
        let (scope, handle) = connect(SiglentSim::new("SDS2104X Plus")).await;
        assert_eq!(scope.sample_depth().await.unwrap(), 10_000);
        handle.clear_log();
        scope.set_sample_depth(2 * MEGA).await.unwrap();
        scope.pipe.flush().await.unwrap();
        assert!(handle.commands().contains(&":ACQUIRE:MDEPTH 2M".to_string()));
        scope.flush_config_cache().await.unwrap();
        assert_eq!(scope.sample_depth().await.unwrap(), 2 * MEGA);
    }

    #[tokio::test]
    async fn test_legacy_rate_sets_timebase() {
        let (scope, _) = connect(SiglentSim::new("SDS1202X-E")).await;
        assert_eq!(scope.sample_depth().await.unwrap(), 14_000);
        scope.set_sample_rate(100 * MEGA).await.unwrap();
        scope.pipe.flush().await.unwrap();
        scope.flush_config_cache().await.unwrap();
        assert_eq!(scope.sample_rate().await.unwrap(), 100 * MEGA);
    }

    #[tokio::test]
    async fn test_trigger_offset_round_trip() {
        let (scope, _) = connect(LeCroySim::new("WAVERUNNER9254M", "")).await;
        // 1000 points at 1 GS/s, trigger centred
        assert_eq!(scope.trigger_offset().await.unwrap(), 500_000_000);
        scope.set_trigger_offset(200_000_000).await.unwrap();
        scope.pipe.flush().await.unwrap();
        scope.flush_config_cache().await.unwrap();
        assert_eq!(scope.trigger_offset().await.unwrap(), 200_000_000);
    }

    #[tokio::test]
    async fn test_interleaving_pairs() {
        let (scope, _) = connect(LeCroySim::new("WAVERUNNER9254M", "")).await;
        assert!(scope.is_interleaving_conflict(0, 1));
        assert!(!scope.is_interleaving_conflict(1, 2));
        assert!(!scope.is_interleaving().await.unwrap());
        assert!(scope.can_interleave().await.unwrap());
        scope.set_interleaving(true).await.unwrap();
        assert!(scope.is_interleaving().await.unwrap());
        scope.set_sample_rate(20 * GIGA).await.unwrap();

        scope.set_interleaving(false).await.unwrap();
        scope.enable_channel(1).await.unwrap();
        assert!(!scope.can_interleave().await.unwrap());
        assert!(matches!(
            scope.set_interleaving(true).await,
            Err(ScopeError::InvalidParameter(_))
        ));

        let (tek, _) = connect(TekSim::new("MSO64", "")).await;
        assert!(matches!(
            tek.set_interleaving(true).await,
            Err(ScopeError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_segments() {
        let (scope, _) = connect(SiglentSim::new("SDS6204A")).await;
        assert_eq!(scope.segment_count().await.unwrap(), 1);
        scope.set_segment_count(4).await.unwrap();
        scope.pipe.flush().await.unwrap();
        scope.flush_config_cache().await.unwrap();
        assert_eq!(scope.segment_count().await.unwrap(), 4);

        let (tek, _) = connect(TekSim::new("MSO64", "")).await;
        assert!(matches!(
            tek.set_segment_count(2).await,
            Err(ScopeError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_adc_resolution_switches_width() {
        let (scope, handle) = connect(SiglentSim::new("SDS6204A")).await;
        assert_eq!(scope.adc_resolution().await.unwrap(), 8);
        handle.clear_log();
        scope.set_adc_resolution(10).await.unwrap();
        assert!(handle.commands().contains(&":WAVEFORM:WIDTH WORD".to_string()));
        assert_eq!(scope.adc_resolution().await.unwrap(), 10);
        assert!(matches!(
            scope.set_adc_resolution(12).await,
            Err(ScopeError::InvalidParameter(_))
        ));
    }
}
