//! Tek MSO5/6 spectrum view.
//!
//! Span and resolution bandwidth are global; the center frequency is per
//! analog input. Either the input or its `CHn_SV_NORMAL` channel may be used
//! to address it.

use crate::channel::ChannelKind;
use crate::driver::ScopeDriver;
use async_trait::async_trait;
use scope_core::{ScopeError, ScopeResult, SpectrumAnalyzer};

impl ScopeDriver {
    fn require_spectrum(&self) -> ScopeResult<()> {
        if self.family.supports_spectrum() {
            Ok(())
        } else {
            Err(ScopeError::Unsupported(format!("spectrum view on {}", self.family)))
        }
    }

    /// Analog index behind `channel`.
    fn spectrum_input(&self, channel: usize) -> ScopeResult<usize> {
        let info = self.channel_info(channel)?;
        match (info.kind, info.parent) {
            (ChannelKind::Analog, _) => Ok(channel),
            (ChannelKind::Spectrum, Some(parent)) => Ok(parent),
            _ => Err(ScopeError::Unsupported(format!(
                "{} has no spectrum view",
                info.hwname
            ))),
        }
    }
}

fn check_positive(hz: i64, what: &str) -> ScopeResult<()> {
    if hz <= 0 {
        return Err(ScopeError::InvalidParameter(format!("{} {} Hz", what, hz)));
    }
    Ok(())
}

#[async_trait]
impl SpectrumAnalyzer for ScopeDriver {
    async fn set_span(&self, hz: i64) -> ScopeResult<()> {
        self.require_spectrum()?;
        check_positive(hz, "span")?;
        let mut cache = self.cache.lock().await;
        cache.span = Some(hz);
        self.pipe.send_queued(format!("SV:SPAN {}", hz));
        Ok(())
    }

    async fn span(&self) -> ScopeResult<i64> {
        self.require_spectrum()?;
        let mut cache = self.cache.lock().await;
        if let Some(hz) = cache.span {
            return Ok(hz);
        }
        let hz = self.query_number("SV:SPAN?").await?.round() as i64;
        cache.span = Some(hz);
        Ok(hz)
    }

    async fn set_center_frequency(&self, channel: usize, hz: i64) -> ScopeResult<()> {
        self.require_spectrum()?;
        check_positive(hz, "center frequency")?;
        let input = self.spectrum_input(channel)?;
        let mut cache = self.cache.lock().await;
        cache.center_frequency.insert(input, hz);
        self.pipe
            .send_queued(format!("CH{}:SV:CENTERFREQUENCY {}", input + 1, hz));
        Ok(())
    }

    async fn center_frequency(&self, channel: usize) -> ScopeResult<i64> {
        self.require_spectrum()?;
        let input = self.spectrum_input(channel)?;
        let mut cache = self.cache.lock().await;
        if let Some(&hz) = cache.center_frequency.get(&input) {
            return Ok(hz);
        }
        let hz = self
            .query_number(&format!("CH{}:SV:CENTERFREQUENCY?", input + 1))
            .await?
            .round() as i64;
        cache.center_frequency.insert(input, hz);
        Ok(hz)
    }

    async fn set_resolution_bandwidth(&self, hz: i64) -> ScopeResult<()> {
        self.require_spectrum()?;
        check_positive(hz, "resolution bandwidth")?;
        let mut cache = self.cache.lock().await;
        cache.rbw = Some(hz);
        self.pipe.send_queued(format!("SV:RBW {}", hz));
        Ok(())
    }

    async fn resolution_bandwidth(&self) -> ScopeResult<i64> {
        self.require_spectrum()?;
        let mut cache = self.cache.lock().await;
        if let Some(hz) = cache.rbw {
            return Ok(hz);
        }
        let hz = self.query_number("SV:RBW?").await?.round() as i64;
        cache.rbw = Some(hz);
        Ok(hz)
    }
}
