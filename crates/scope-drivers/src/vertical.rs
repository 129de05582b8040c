//! Per-channel vertical settings: enable, coupling, attenuation, range,
//! offset, bandwidth limit, deskew, invert, digital threshold and averaging.
//!
//! Every getter reads through the [`ConfigCache`](crate::cache::ConfigCache):
//! a cached value is returned as is, a miss is fetched from the instrument and
//! stored. Setters validate first, then update the cache and queue the write.
//! A rejected value leaves both the cache and the instrument untouched.

use crate::channel::{Channel, ChannelKind};
use crate::driver::ScopeDriver;
use crate::family::Vendor;
use crate::probe::{self, Coupling, ProbeKind};
use crate::trigger::{fmt_sci, fs_to_seconds, seconds_to_fs};
use crate::wire;
use scope_core::{ScopeError, ScopeResult};

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

fn vbs_bool(on: bool) -> &'static str {
    if on {
        "True"
    } else {
        "False"
    }
}

/// `Full`, `20MHz`, `1GHz` → MHz, `0` for no limit.
fn parse_bandwidth_name(text: &str) -> Option<u32> {
    let upper = text.trim().trim_matches('"').to_ascii_uppercase();
    match upper.as_str() {
        "FULL" | "OFF" | "" => return Some(0),
        "ON" => return Some(20),
        _ => {}
    }
    let (digits, scale) = if let Some(v) = upper.strip_suffix("GHZ") {
        (v, 1000.0)
    } else if let Some(v) = upper.strip_suffix("MHZ") {
        (v, 1.0)
    } else if let Some(v) = upper.strip_suffix('M') {
        (v, 1.0)
    } else {
        (upper.as_str(), 1.0)
    };
    digits
        .trim()
        .parse::<f64>()
        .ok()
        .map(|v| (v * scale).round() as u32)
}

fn parse_lecroy_coupling(text: &str) -> Option<Coupling> {
    match text.trim().to_ascii_uppercase().as_str() {
        "D1M" => Some(Coupling::Dc1M),
        "A1M" => Some(Coupling::Ac1M),
        "D50" => Some(Coupling::Dc50),
        "A50" => Some(Coupling::Ac50),
        "GND" => Some(Coupling::Gnd),
        _ => None,
    }
}

fn lecroy_coupling_name(coupling: Coupling) -> &'static str {
    match coupling {
        Coupling::Dc1M => "D1M",
        Coupling::Ac1M => "A1M",
        Coupling::Dc50 => "D50",
        Coupling::Ac50 => "A50",
        Coupling::Gnd | Coupling::Synthetic => "GND",
    }
}

impl ScopeDriver {
    // =========================================================================
    // Enable
    // =========================================================================

    async fn query_enabled(&self, channel: &Channel) -> ScopeResult<bool> {
        let n = channel.number();
        match (channel.kind, self.vendor()) {
            (ChannelKind::Analog, Vendor::LeCroy) => {
                self.query_flag(&format!("C{}:TRACE?", n)).await
            }
            (ChannelKind::Analog, Vendor::Tektronix) => {
                self.query_flag(&format!("DISPLAY:GLOBAL:CH{}:STATE?", n)).await
            }
            (ChannelKind::Analog, Vendor::Siglent) if self.is_legacy() => {
                self.query_flag(&format!("C{}:TRA?", n)).await
            }
            (ChannelKind::Analog, Vendor::Siglent) => {
                self.query_flag(&format!(":CHANNEL{}:SWITCH?", n)).await
            }
            (ChannelKind::Digital, Vendor::Tektronix) => {
                self.query_flag(&format!("DISPLAY:GLOBAL:{}:STATE?", channel.hwname))
                    .await
            }
            (ChannelKind::Digital, Vendor::LeCroy) => {
                let lane = channel.lane.unwrap_or_default();
                let value = self
                    .vbs_get(&format!("LogicAnalyzer.Digital1.Digital{}", lane))
                    .await?;
                scope_scpi::parse_bool(&value)
            }
            (ChannelKind::Spectrum, Vendor::Tektronix) => {
                self.query_flag(&format!("CH{}:SV:STATE?", n)).await
            }
            _ => Ok(false),
        }
    }

    fn queue_enable(&self, channel: &Channel, on: bool) {
        let n = channel.number();
        match (channel.kind, self.vendor()) {
            (ChannelKind::Analog, Vendor::LeCroy) => {
                self.pipe.send_queued(format!("C{}:TRACE {}", n, on_off(on)));
            }
            (ChannelKind::Analog, Vendor::Tektronix) => {
                self.pipe
                    .send_queued(format!("DISPLAY:GLOBAL:CH{}:STATE {}", n, u8::from(on)));
            }
            (ChannelKind::Analog, Vendor::Siglent) if self.is_legacy() => {
                self.pipe.send_queued(format!("C{}:TRA {}", n, on_off(on)));
            }
            (ChannelKind::Analog, Vendor::Siglent) => {
                self.pipe
                    .send_queued(format!(":CHANNEL{}:SWITCH {}", n, on_off(on)));
            }
            (ChannelKind::Digital, Vendor::Tektronix) => {
                self.pipe.send_queued(format!(
                    "DISPLAY:GLOBAL:{}:STATE {}",
                    channel.hwname,
                    u8::from(on)
                ));
            }
            (ChannelKind::Digital, Vendor::LeCroy) => {
                let lane = channel.lane.unwrap_or_default();
                self.vbs_set(
                    &format!("LogicAnalyzer.Digital1.Digital{}", lane),
                    vbs_bool(on),
                );
            }
            (ChannelKind::Spectrum, Vendor::Tektronix) => {
                self.pipe
                    .send_queued(format!("CH{}:SV:STATE {}", n, on_off(on)));
            }
            _ => {}
        }
    }

    /// Whether channel `index` is enabled for capture. Unusable channels
    /// report `false`.
    pub async fn is_channel_enabled(&self, index: usize) -> ScopeResult<bool> {
        let channel = self.channel_info(index)?;
        let mut cache = self.cache.lock().await;
        if !self.usable_with(&cache, &channel) {
            return Ok(false);
        }
        if let Some(&on) = cache.enabled.get(&index) {
            return Ok(on);
        }
        let on = self.query_enabled(&channel).await?;
        cache.enabled.insert(index, on);
        Ok(on)
    }

    pub async fn enable_channel(&self, index: usize) -> ScopeResult<()> {
        self.set_channel_enabled(index, true).await
    }

    pub async fn disable_channel(&self, index: usize) -> ScopeResult<()> {
        self.set_channel_enabled(index, false).await
    }

    /// Change the enable state. Unusable channels (an analog input hosting a
    /// logic probe, lanes of an absent probe, trigger-only inputs) ignore the
    /// request.
    pub async fn set_channel_enabled(&self, index: usize, on: bool) -> ScopeResult<()> {
        let channel = self.channel_info(index)?;
        let mut cache = self.cache.lock().await;
        if !self.usable_with(&cache, &channel) {
            tracing::debug!(channel = %channel.hwname, on, "Channel not usable, ignoring enable");
            return Ok(());
        }
        if cache.set_enabled(index, on) {
            self.queue_enable(&channel, on);
        }
        Ok(())
    }

    // =========================================================================
    // Coupling
    // =========================================================================

    /// Couplings legal on analog channel `index` with its current probe.
    pub async fn available_couplings(&self, index: usize) -> ScopeResult<Vec<Coupling>> {
        self.analog_number(index)?;
        let probe = self.cache.lock().await.probe(index).unwrap_or_default();
        Ok(probe::available_couplings(self.family, probe))
    }

    async fn query_coupling(&self, n: usize) -> ScopeResult<Coupling> {
        match self.vendor() {
            Vendor::LeCroy => {
                let reply = self.query_text(&format!("C{}:COUPLING?", n)).await?;
                parse_lecroy_coupling(&reply).ok_or_else(|| ScopeError::parse(reply, "coupling"))
            }
            Vendor::Tektronix => {
                let mode = self.query_text(&format!("CH{}:COUPLING?", n)).await?;
                let termination = self.query_number(&format!("CH{}:TERMINATION?", n)).await?;
                let fifty = termination < 1000.0;
                Ok(match (mode.to_ascii_uppercase().as_str(), fifty) {
                    ("AC", false) => Coupling::Ac1M,
                    ("AC", true) => Coupling::Ac50,
                    (_, true) => Coupling::Dc50,
                    _ => Coupling::Dc1M,
                })
            }
            Vendor::Siglent if self.is_legacy() => {
                let reply = self.query_text(&format!("C{}:CPL?", n)).await?;
                parse_lecroy_coupling(&reply).ok_or_else(|| ScopeError::parse(reply, "coupling"))
            }
            Vendor::Siglent => {
                let mode = self.query_text(&format!(":CHANNEL{}:COUPLING?", n)).await?;
                let impedance = self.query_text(&format!(":CHANNEL{}:IMPEDANCE?", n)).await?;
                let fifty = impedance.eq_ignore_ascii_case("FIFTY");
                Ok(match (mode.to_ascii_uppercase().as_str(), fifty) {
                    ("GND", _) => Coupling::Gnd,
                    ("AC", false) => Coupling::Ac1M,
                    ("AC", true) => Coupling::Ac50,
                    (_, true) => Coupling::Dc50,
                    _ => Coupling::Dc1M,
                })
            }
            Vendor::Unknown => Ok(Coupling::Dc1M),
        }
    }

    pub async fn coupling(&self, index: usize) -> ScopeResult<Coupling> {
        let n = self.analog_number(index)?;
        let mut cache = self.cache.lock().await;
        if cache.probe(index).unwrap_or_default().is_digital() {
            return Ok(Coupling::Synthetic);
        }
        if let Some(&c) = cache.coupling.get(&index) {
            return Ok(c);
        }
        let c = self.query_coupling(n).await?;
        cache.coupling.insert(index, c);
        Ok(c)
    }

    pub async fn set_coupling(&self, index: usize, coupling: Coupling) -> ScopeResult<()> {
        let n = self.analog_number(index)?;
        let mut cache = self.cache.lock().await;
        let probe = cache.probe(index).unwrap_or_default();
        if probe.is_active() {
            tracing::warn!(channel = n, %coupling, "Active probe owns the coupling, ignoring");
            return Ok(());
        }
        if !probe::available_couplings(self.family, probe).contains(&coupling) {
            return Err(ScopeError::InvalidParameter(format!(
                "coupling {} not available on channel {}",
                coupling, n
            )));
        }
        cache.set_coupling(index, coupling);

        match self.vendor() {
            Vendor::LeCroy => {
                self.pipe.send_queued(format!(
                    "C{}:COUPLING {}",
                    n,
                    lecroy_coupling_name(coupling)
                ));
            }
            Vendor::Tektronix => {
                let mode = if matches!(coupling, Coupling::Ac1M | Coupling::Ac50) {
                    "AC"
                } else {
                    "DC"
                };
                let termination = if coupling.is_one_meg() { "1.0E+6" } else { "50" };
                self.pipe.send_queued(format!("CH{}:COUPLING {}", n, mode));
                self.pipe
                    .send_queued(format!("CH{}:TERMINATION {}", n, termination));
            }
            Vendor::Siglent if self.is_legacy() => {
                self.pipe.send_queued(format!(
                    "C{}:CPL {}",
                    n,
                    lecroy_coupling_name(coupling)
                ));
            }
            Vendor::Siglent => {
                let mode = match coupling {
                    Coupling::Ac1M | Coupling::Ac50 => "AC",
                    Coupling::Gnd => "GND",
                    _ => "DC",
                };
                self.pipe
                    .send_queued(format!(":CHANNEL{}:COUPLING {}", n, mode));
                if coupling != Coupling::Gnd {
                    let impedance = if coupling.is_one_meg() { "ONEMEG" } else { "FIFTY" };
                    self.pipe
                        .send_queued(format!(":CHANNEL{}:IMPEDANCE {}", n, impedance));
                }
            }
            Vendor::Unknown => {}
        }
        Ok(())
    }

    // =========================================================================
    // Attenuation
    // =========================================================================

    async fn query_attenuation(&self, n: usize) -> ScopeResult<f64> {
        match self.vendor() {
            Vendor::LeCroy => self.query_number(&format!("C{}:ATTENUATION?", n)).await,
            Vendor::Tektronix => {
                let gain = self.query_number(&format!("CH{}:PROBE:GAIN?", n)).await?;
                let external = self
                    .query_number(&format!("CH{}:PROBEFUNC:EXTATTEN?", n))
                    .await?;
                if gain <= 0.0 {
                    return Err(ScopeError::parse(gain.to_string(), "probe gain"));
                }
                Ok(external / gain)
            }
            Vendor::Siglent if self.is_legacy() => {
                self.query_number(&format!("C{}:ATTN?", n)).await
            }
            Vendor::Siglent => self.query_number(&format!(":CHANNEL{}:PROBE?", n)).await,
            Vendor::Unknown => Ok(1.0),
        }
    }

    /// Probe attenuation factor (10 for a 10:1 probe).
    pub async fn attenuation(&self, index: usize) -> ScopeResult<f64> {
        let n = self.analog_number(index)?;
        let mut cache = self.cache.lock().await;
        if let Some(&a) = cache.attenuation.get(&index) {
            return Ok(a);
        }
        let a = self.query_attenuation(n).await?;
        cache.attenuation.insert(index, a);
        Ok(a)
    }

    pub async fn set_attenuation(&self, index: usize, attenuation: f64) -> ScopeResult<()> {
        let n = self.analog_number(index)?;
        if !(attenuation.is_finite() && attenuation > 0.0) {
            return Err(ScopeError::InvalidParameter(format!(
                "attenuation {} on channel {}",
                attenuation, n
            )));
        }
        let mut cache = self.cache.lock().await;
        if cache.probe(index).unwrap_or_default().is_active() {
            tracing::warn!(channel = n, attenuation, "Active probe owns the attenuation, ignoring");
            return Ok(());
        }

        match self.vendor() {
            Vendor::LeCroy => {
                self.pipe
                    .send_queued(format!("C{}:ATTENUATION {}", n, attenuation));
            }
            Vendor::Tektronix => {
                // the probe's own gain is fixed; the remainder goes in EXTATTEN
                let gain = self.query_number(&format!("CH{}:PROBE:GAIN?", n)).await?;
                self.pipe.send_queued(format!(
                    "CH{}:PROBEFUNC:EXTATTEN {}",
                    n,
                    fmt_sci(attenuation * gain)
                ));
            }
            Vendor::Siglent if self.is_legacy() => {
                self.pipe.send_queued(format!("C{}:ATTN {}", n, attenuation));
            }
            Vendor::Siglent => {
                self.pipe
                    .send_queued(format!(":CHANNEL{}:PROBE VALUE,{}", n, attenuation));
            }
            Vendor::Unknown => {}
        }
        cache.set_attenuation(index, attenuation);
        Ok(())
    }

    // =========================================================================
    // Range and offset
    // =========================================================================

    fn volts_per_div_query(&self, n: usize) -> String {
        match self.vendor() {
            Vendor::LeCroy => format!("C{}:VOLT_DIV", n),
            Vendor::Tektronix => format!("CH{}:SCALE", n),
            Vendor::Siglent if self.is_legacy() => format!("C{}:VDIV", n),
            _ => format!(":CHANNEL{}:SCALE", n),
        }
    }

    fn offset_query(&self, n: usize) -> String {
        match self.vendor() {
            Vendor::LeCroy => format!("C{}:OFFSET", n),
            Vendor::Tektronix => format!("CH{}:OFFSET", n),
            Vendor::Siglent if self.is_legacy() => format!("C{}:OFST", n),
            _ => format!(":CHANNEL{}:OFFSET", n),
        }
    }

    /// Full-scale range in volts (V/div × vertical divisions).
    pub async fn voltage_range(&self, index: usize) -> ScopeResult<f64> {
        let n = self.analog_number(index)?;
        let mut cache = self.cache.lock().await;
        if let Some(&r) = cache.voltage_range.get(&index) {
            return Ok(r);
        }
        let vdiv = self
            .query_number(&format!("{}?", self.volts_per_div_query(n)))
            .await?;
        let range = vdiv * self.family.vertical_divisions();
        cache.voltage_range.insert(index, range);
        Ok(range)
    }

    pub async fn set_voltage_range(&self, index: usize, range: f64) -> ScopeResult<()> {
        let n = self.analog_number(index)?;
        if !(range.is_finite() && range > 0.0) {
            return Err(ScopeError::InvalidParameter(format!(
                "voltage range {} on channel {}",
                range, n
            )));
        }
        let mut cache = self.cache.lock().await;
        let vdiv = range / self.family.vertical_divisions();
        self.pipe
            .send_queued(format!("{} {}", self.volts_per_div_query(n), fmt_sci(vdiv)));
        cache.voltage_range.insert(index, range);
        Ok(())
    }

    /// Vertical offset in volts.
    pub async fn offset(&self, index: usize) -> ScopeResult<f64> {
        let n = self.analog_number(index)?;
        let mut cache = self.cache.lock().await;
        if let Some(&o) = cache.offset.get(&index) {
            return Ok(o);
        }
        let o = self
            .query_number(&format!("{}?", self.offset_query(n)))
            .await?;
        cache.offset.insert(index, o);
        Ok(o)
    }

    pub async fn set_offset(&self, index: usize, offset: f64) -> ScopeResult<()> {
        let n = self.analog_number(index)?;
        if !offset.is_finite() {
            return Err(ScopeError::InvalidParameter(format!(
                "offset {} on channel {}",
                offset, n
            )));
        }
        let mut cache = self.cache.lock().await;
        self.pipe
            .send_queued(format!("{} {}", self.offset_query(n), fmt_sci(offset)));
        cache.offset.insert(index, offset);
        Ok(())
    }

    // =========================================================================
    // Bandwidth limit
    // =========================================================================

    /// Legal limits in MHz for the channel's probe and coupling; `0` is full
    /// bandwidth.
    pub async fn available_bandwidth_limits(&self, index: usize) -> ScopeResult<Vec<u32>> {
        self.analog_number(index)?;
        let probe = self.cache.lock().await.probe(index).unwrap_or_default();
        if probe.is_digital() {
            return Ok(Vec::new());
        }
        let coupling = self.coupling(index).await?;
        Ok(probe::bandwidth_limits(self.family, probe, Some(coupling)))
    }

    async fn query_bandwidth_limit(&self, n: usize) -> ScopeResult<u32> {
        let text = match self.vendor() {
            Vendor::LeCroy => {
                self.vbs_get(&format!("Acquisition.C{}.BandwidthLimit", n))
                    .await?
            }
            Vendor::Tektronix => {
                let hz = self.query_number(&format!("CH{}:BANDWIDTH?", n)).await?;
                let mhz = (hz / 1e6).round() as u32;
                return Ok(if mhz >= self.max_bandwidth { 0 } else { mhz });
            }
            Vendor::Siglent if self.is_legacy() => {
                self.query_text(&format!("C{}:BWL?", n)).await?
            }
            Vendor::Siglent => self.query_text(&format!(":CHANNEL{}:BWLIMIT?", n)).await?,
            Vendor::Unknown => return Ok(0),
        };
        Ok(parse_bandwidth_name(&text).unwrap_or_else(|| {
            tracing::warn!(channel = n, reply = %text, "Unrecognised bandwidth limit, assuming full");
            0
        }))
    }

    /// Bandwidth limit in MHz, `0` for none.
    pub async fn bandwidth_limit(&self, index: usize) -> ScopeResult<u32> {
        let n = self.analog_number(index)?;
        let mut cache = self.cache.lock().await;
        if let Some(&bw) = cache.bandwidth_limit.get(&index) {
            return Ok(bw);
        }
        let bw = self.query_bandwidth_limit(n).await?;
        cache.bandwidth_limit.insert(index, bw);
        Ok(bw)
    }

    pub async fn set_bandwidth_limit(&self, index: usize, mhz: u32) -> ScopeResult<()> {
        let n = self.analog_number(index)?;
        let legal = self.available_bandwidth_limits(index).await?;
        if !legal.contains(&mhz) {
            return Err(ScopeError::InvalidParameter(format!(
                "bandwidth limit {} MHz on channel {} (legal: {:?})",
                mhz, n, legal
            )));
        }
        let mut cache = self.cache.lock().await;
        match self.vendor() {
            Vendor::LeCroy => {
                let name = if mhz == 0 {
                    "Full".to_string()
                } else if mhz >= 1000 && mhz % 1000 == 0 {
                    format!("{}GHz", mhz / 1000)
                } else {
                    format!("{}MHz", mhz)
                };
                self.vbs_set(
                    &format!("Acquisition.C{}.BandwidthLimit", n),
                    format!("\"{}\"", name),
                );
            }
            Vendor::Tektronix => {
                let limit = if mhz == 0 { self.max_bandwidth } else { mhz };
                self.pipe.send_queued(format!(
                    "CH{}:BANDWIDTH {}",
                    n,
                    fmt_sci(f64::from(limit) * 1e6)
                ));
            }
            Vendor::Siglent if self.is_legacy() => {
                self.pipe
                    .send_queued(format!("C{}:BWL {}", n, on_off(mhz != 0)));
            }
            Vendor::Siglent => {
                let name = if mhz == 0 {
                    "FULL".to_string()
                } else {
                    format!("{}M", mhz)
                };
                self.pipe
                    .send_queued(format!(":CHANNEL{}:BWLIMIT {}", n, name));
            }
            Vendor::Unknown => {}
        }
        cache.bandwidth_limit.insert(index, mhz);
        Ok(())
    }

    // =========================================================================
    // Deskew and invert
    // =========================================================================

    /// Deskew in femtoseconds.
    pub async fn deskew(&self, index: usize) -> ScopeResult<i64> {
        let n = self.analog_number(index)?;
        let mut cache = self.cache.lock().await;
        if let Some(&d) = cache.deskew.get(&index) {
            return Ok(d);
        }
        let seconds = match self.vendor() {
            Vendor::LeCroy => self.vbs_f64(&format!("Acquisition.C{}.Deskew", n)).await?,
            Vendor::Tektronix => self.query_number(&format!("CH{}:DESKEW?", n)).await?,
            Vendor::Siglent if self.is_legacy() => {
                self.query_number(&format!("C{}:SKEW?", n)).await?
            }
            Vendor::Siglent => self.query_number(&format!(":CHANNEL{}:SKEW?", n)).await?,
            Vendor::Unknown => 0.0,
        };
        let d = seconds_to_fs(seconds);
        cache.deskew.insert(index, d);
        Ok(d)
    }

    pub async fn set_deskew(&self, index: usize, fs: i64) -> ScopeResult<()> {
        let n = self.analog_number(index)?;
        let mut cache = self.cache.lock().await;
        let seconds = fmt_sci(fs_to_seconds(fs));
        match self.vendor() {
            Vendor::LeCroy => self.vbs_set(&format!("Acquisition.C{}.Deskew", n), seconds),
            Vendor::Tektronix => self.pipe.send_queued(format!("CH{}:DESKEW {}", n, seconds)),
            Vendor::Siglent if self.is_legacy() => {
                self.pipe.send_queued(format!("C{}:SKEW {}", n, seconds))
            }
            Vendor::Siglent => self
                .pipe
                .send_queued(format!(":CHANNEL{}:SKEW {}", n, seconds)),
            Vendor::Unknown => {}
        }
        cache.deskew.insert(index, fs);
        Ok(())
    }

    pub async fn is_inverted(&self, index: usize) -> ScopeResult<bool> {
        let n = self.analog_number(index)?;
        let mut cache = self.cache.lock().await;
        if let Some(&inv) = cache.invert.get(&index) {
            return Ok(inv);
        }
        let inv = match self.vendor() {
            Vendor::LeCroy => {
                scope_scpi::parse_bool(&self.vbs_get(&format!("Acquisition.C{}.Invert", n)).await?)?
            }
            Vendor::Tektronix => self.query_flag(&format!("CH{}:INVERT?", n)).await?,
            Vendor::Siglent if self.is_legacy() => {
                self.query_flag(&format!("C{}:INVS?", n)).await?
            }
            Vendor::Siglent => self.query_flag(&format!(":CHANNEL{}:INVERT?", n)).await?,
            Vendor::Unknown => false,
        };
        cache.invert.insert(index, inv);
        Ok(inv)
    }

    pub async fn set_inverted(&self, index: usize, invert: bool) -> ScopeResult<()> {
        let n = self.analog_number(index)?;
        let mut cache = self.cache.lock().await;
        match self.vendor() {
            Vendor::LeCroy => {
                self.vbs_set(&format!("Acquisition.C{}.Invert", n), vbs_bool(invert))
            }
            Vendor::Tektronix => self
                .pipe
                .send_queued(format!("CH{}:INVERT {}", n, on_off(invert))),
            Vendor::Siglent if self.is_legacy() => self
                .pipe
                .send_queued(format!("C{}:INVS {}", n, on_off(invert))),
            Vendor::Siglent => self
                .pipe
                .send_queued(format!(":CHANNEL{}:INVERT {}", n, on_off(invert))),
            Vendor::Unknown => {}
        }
        cache.invert.insert(index, invert);
        Ok(())
    }

    // =========================================================================
    // Digital threshold
    // =========================================================================

    /// Where the threshold of digital lane `channel` lives on the wire.
    fn threshold_path(&self, channel: &Channel) -> ScopeResult<String> {
        match (channel.kind, self.vendor()) {
            (ChannelKind::Digital, Vendor::Tektronix) => {
                Ok(format!("{}:THRESHOLD", channel.hwname))
            }
            // one threshold per group of eight lanes
            (ChannelKind::Digital, Vendor::LeCroy) => Ok(format!(
                "LogicAnalyzer.MSxxThreshold{}",
                channel.lane.unwrap_or_default() / 8 + 1
            )),
            _ => Err(ScopeError::Unsupported(format!(
                "{} has no digital threshold",
                channel.hwname
            ))),
        }
    }

    /// Logic threshold of digital channel `index`, volts.
    pub async fn digital_threshold(&self, index: usize) -> ScopeResult<f64> {
        let channel = self.channel_info(index)?;
        let path = self.threshold_path(&channel)?;
        let mut cache = self.cache.lock().await;
        if let Some(&t) = cache.digital_threshold.get(&index) {
            return Ok(t);
        }
        let t = match self.vendor() {
            Vendor::LeCroy => self.vbs_f64(&path).await?,
            _ => self.query_number(&format!("{}?", path)).await?,
        };
        cache.digital_threshold.insert(index, t);
        Ok(t)
    }

    pub async fn set_digital_threshold(&self, index: usize, volts: f64) -> ScopeResult<()> {
        let channel = self.channel_info(index)?;
        let path = self.threshold_path(&channel)?;
        if !volts.is_finite() {
            return Err(ScopeError::InvalidParameter(format!(
                "threshold {} on {}",
                volts, channel.hwname
            )));
        }
        let mut cache = self.cache.lock().await;
        match self.vendor() {
            Vendor::LeCroy => {
                self.vbs_set(&path, volts);
                // lanes of the same group share the setting
                let group = channel.lane.unwrap_or_default() / 8;
                let siblings: Vec<usize> = self
                    .channels
                    .read()
                    .iter()
                    .filter(|c| c.kind == ChannelKind::Digital && c.lane.map(|l| l / 8) == Some(group))
                    .map(|c| c.index)
                    .collect();
                for sibling in siblings {
                    cache.digital_threshold.insert(sibling, volts);
                }
            }
            _ => {
                self.pipe.send_queued(format!("{} {}", path, fmt_sci(volts)));
                cache.digital_threshold.insert(index, volts);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Averaging
    // =========================================================================

    /// Sweeps averaged per acquisition; `1` means no averaging. Global on
    /// every family but LeCroy.
    pub async fn num_averages(&self, index: usize) -> ScopeResult<i64> {
        let n = self.analog_number(index)?;
        let mut cache = self.cache.lock().await;
        if let Some(&a) = cache.num_averages.get(&index) {
            return Ok(a);
        }
        let averages = match self.vendor() {
            Vendor::LeCroy => {
                self.vbs_f64(&format!("Acquisition.C{}.AverageSweeps", n))
                    .await?
            }
            Vendor::Tektronix => self.query_number("ACQUIRE:NUMAVG?").await?,
            Vendor::Siglent if self.is_legacy() => self.query_number("AVGA?").await?,
            Vendor::Siglent => {
                let reply = self.query_text(":ACQUIRE:TYPE?").await?;
                match reply.split_once(',') {
                    Some((kind, count)) if kind.trim().eq_ignore_ascii_case("AVERAGE") => {
                        wire::parse_number(count)?
                    }
                    _ => 1.0,
                }
            }
            Vendor::Unknown => 1.0,
        };
        let averages = (averages.round() as i64).max(1);
        cache.num_averages.insert(index, averages);
        Ok(averages)
    }

    pub async fn set_num_averages(&self, index: usize, averages: i64) -> ScopeResult<()> {
        let n = self.analog_number(index)?;
        if averages < 1 {
            return Err(ScopeError::InvalidParameter(format!(
                "{} averages on channel {}",
                averages, n
            )));
        }
        let mut cache = self.cache.lock().await;
        match self.vendor() {
            Vendor::LeCroy => {
                self.vbs_set(&format!("Acquisition.C{}.AverageSweeps", n), averages);
                cache.num_averages.insert(index, averages);
                return Ok(());
            }
            Vendor::Tektronix => {
                self.pipe
                    .send_queued(format!("ACQUIRE:NUMAVG {}", averages));
            }
            Vendor::Siglent if self.is_legacy() => {
                self.pipe.send_queued(format!("AVGA {}", averages));
            }
            Vendor::Siglent => {
                if averages > 1 {
                    self.pipe
                        .send_queued(format!(":ACQUIRE:TYPE AVERAGE,{}", averages));
                } else {
                    self.pipe.send_queued(":ACQUIRE:TYPE NORMAL");
                }
            }
            Vendor::Unknown => {}
        }
        for i in 0..self.analog_count {
            cache.num_averages.insert(i, averages);
        }
        Ok(())
    }

    /// Re-read the probe on one channel, dropping everything derived from it.
    pub async fn refresh_probe(&self, index: usize) -> ScopeResult<ProbeKind> {
        self.analog_number(index)?;
        let mut cache = self.cache.lock().await;
        cache.invalidate_probe(index);
        self.detect_probes(&mut cache).await?;
        Ok(cache.probe(index).unwrap_or_default())
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
    fn test_parse_bandwidth_name() {
        assert_eq!(parse_bandwidth_name("Full"), Some(0));
        assert_eq!(parse_bandwidth_name("20MHz"), Some(20));
        assert_eq!(parse_bandwidth_name("1GHz"), Some(1000));
        assert_eq!(parse_bandwidth_name("200M"), Some(200));
        assert_eq!(parse_bandwidth_name("OFF"), Some(0));
        assert_eq!(parse_bandwidth_name("wide"), None);
    }

    #[tokio::test]
    async fn test_enable_disable_coherent() {
        let (scope, _) = connect(LeCroySim::new("WAVERUNNER9254M", "")).await;
        assert!(scope.is_channel_enabled(0).await.unwrap());
        assert!(!scope.is_channel_enabled(2).await.unwrap());
        scope.enable_channel(2).await.unwrap();
        assert!(scope.is_channel_enabled(2).await.unwrap());
        scope.disable_channel(2).await.unwrap();
        assert!(!scope.is_channel_enabled(2).await.unwrap());

        // the instrument agrees once the cache is gone
        scope.pipe.flush().await.unwrap();
        scope.flush_config_cache().await.unwrap();
        assert!(!scope.is_channel_enabled(2).await.unwrap());
    }

    #[tokio::test]
    async fn test_enable_twice_writes_once() {
        let (scope, handle) = connect(SiglentSim::new("SDS2104X Plus")).await;
        handle.clear_log();
        scope.enable_channel(1).await.unwrap();
        scope.enable_channel(1).await.unwrap();
        scope.pipe.flush().await.unwrap();
        let switches: Vec<_> = handle
            .commands()
            .into_iter()
            .filter(|c| c.starts_with(":CHANNEL2:SWITCH"))
            .collect();
        assert_eq!(switches, vec![":CHANNEL2:SWITCH ON".to_string()]);
    }

    #[tokio::test]
    async fn test_digital_probe_blocks_host() {
        let (scope, handle) = connect(TekSim::new("MSO64", "").with_digital_probe(1)).await;
        assert!(scope.available_couplings(0).await.unwrap().is_empty());
        assert_eq!(scope.coupling(0).await.unwrap(), Coupling::Synthetic);

        handle.clear_log();
        scope.enable_channel(0).await.unwrap();
        scope.pipe.flush().await.unwrap();
        assert!(handle.commands().is_empty());
        assert!(!scope.is_channel_enabled(0).await.unwrap());

        let d3 = scope.channel_by_name("CH1_D3").unwrap();
        scope.enable_channel(d3).await.unwrap();
        scope.pipe.flush().await.unwrap();
        assert_eq!(handle.commands(), vec!["DISPLAY:GLOBAL:CH1_D3:STATE 1".to_string()]);
    }

    #[tokio::test]
    async fn test_coupling_round_trip() {
        for (sim, family_name) in [
            (Box::new(LeCroySim::new("WAVERUNNER9254M", "")) as Box<dyn Responder>, "lecroy"),
            (Box::new(TekSim::new("MSO64", "")) as Box<dyn Responder>, "tek"),
            (Box::new(SiglentSim::new("SDS6204A")) as Box<dyn Responder>, "sds6000a"),
            (Box::new(SiglentSim::new("SDS1202X-E")) as Box<dyn Responder>, "legacy"),
        ] {
            let transport = MockTransport::new(BoxedSim(sim));
            let scope = ScopeDriver::connect(Box::new(transport), DriverSettings::default())
                .await
                .unwrap();
            for coupling in scope.available_couplings(0).await.unwrap() {
                scope.set_coupling(0, coupling).await.unwrap();
                scope.pipe.flush().await.unwrap();
                scope.flush_config_cache().await.unwrap();
                assert_eq!(scope.coupling(0).await.unwrap(), coupling, "{}", family_name);
            }
        }
    }

    struct BoxedSim(Box<dyn Responder>);

    impl Responder for BoxedSim {
        fn respond(&mut self, command: &str) -> Vec<scope_scpi::MockReply> {
            self.0.respond(command)
        }
    }

    #[tokio::test]
    async fn test_invalid_coupling_leaves_cache() {
        let (scope, handle) = connect(SiglentSim::new("SDS2104X Plus")).await;
        assert_eq!(scope.coupling(0).await.unwrap(), Coupling::Dc1M);
        handle.clear_log();
        let err = scope.set_coupling(0, Coupling::Dc50).await.unwrap_err();
        assert!(matches!(err, ScopeError::InvalidParameter(_)));
        assert_eq!(scope.coupling(0).await.unwrap(), Coupling::Dc1M);
        scope.pipe.flush().await.unwrap();
        assert!(handle.commands().is_empty());
    }

    #[tokio::test]
    async fn test_active_probe_ignores_coupling() {
        let sim = TekSim::new("MSO58", "").with_probe(1, "TDP1500");
        let (scope, handle) = connect(sim).await;
        assert_eq!(scope.available_couplings(0).await.unwrap(), vec![Coupling::Dc50]);
        handle.clear_log();
        scope.set_coupling(0, Coupling::Ac1M).await.unwrap();
        scope.set_attenuation(0, 10.0).await.unwrap();
        scope.pipe.flush().await.unwrap();
        assert!(handle.commands().is_empty());
    }

    #[tokio::test]
    async fn test_tek_attenuation_uses_probe_gain() {
        let (scope, handle) = connect(TekSim::new("MSO64", "")).await;
        assert!((scope.attenuation(1).await.unwrap() - 10.0).abs() < 1e-9);
        scope.set_attenuation(1, 100.0).await.unwrap();
        scope.pipe.flush().await.unwrap();
        assert!(handle
            .commands()
            .contains(&"CH2:PROBEFUNC:EXTATTEN 1.000000e+01".to_string()));
        scope.flush_config_cache().await.unwrap();
        assert!((scope.attenuation(1).await.unwrap() - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_range_uses_family_divisions() {
        let (tek, _) = connect(TekSim::new("MSO64", "")).await;
        assert!((tek.voltage_range(0).await.unwrap() - 1.0).abs() < 1e-9);
        let (legacy, _) = connect(SiglentSim::new("SDS1202X-E")).await;
        assert!((legacy.voltage_range(0).await.unwrap() - 0.8).abs() < 1e-9);
        legacy.set_offset(1, -0.25).await.unwrap();
        legacy.pipe.flush().await.unwrap();
        legacy.flush_config_cache().await.unwrap();
        assert!((legacy.offset(1).await.unwrap() + 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_bandwidth_limits() {
        let (scope, handle) = connect(TekSim::new("MSO64", "")).await;
        assert_eq!(scope.bandwidth_limit(0).await.unwrap(), 0);
        let legal = scope.available_bandwidth_limits(0).await.unwrap();
        assert!(legal.contains(&20));
        assert!(!legal.contains(&1000));
        assert!(matches!(
            scope.set_bandwidth_limit(0, 1000).await,
            Err(ScopeError::InvalidParameter(_))
        ));
        scope.set_bandwidth_limit(0, 20).await.unwrap();
        scope.set_bandwidth_limit(1, 0).await.unwrap();
        scope.pipe.flush().await.unwrap();
        let commands = handle.commands();
        assert!(commands.contains(&"CH1:BANDWIDTH 2.000000e+07".to_string()));
        assert!(commands.contains(&"CH2:BANDWIDTH 1.000000e+09".to_string()));
        scope.flush_config_cache().await.unwrap();
        assert_eq!(scope.bandwidth_limit(0).await.unwrap(), 20);
        assert_eq!(scope.bandwidth_limit(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lecroy_vbs_settings() {
        let (scope, _) = connect(LeCroySim::new("WAVERUNNER9254M", "")).await;
        scope.set_bandwidth_limit(0, 20).await.unwrap();
        scope.set_deskew(0, 1_500_000).await.unwrap();
        scope.set_inverted(0, true).await.unwrap();
        scope.set_num_averages(0, 32).await.unwrap();
        scope.pipe.flush().await.unwrap();
        scope.flush_config_cache().await.unwrap();
        assert_eq!(scope.bandwidth_limit(0).await.unwrap(), 20);
        assert_eq!(scope.deskew(0).await.unwrap(), 1_500_000);
        assert!(scope.is_inverted(0).await.unwrap());
        assert_eq!(scope.num_averages(0).await.unwrap(), 32);
        assert_eq!(scope.num_averages(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_siglent_averages_are_global() {
        let (scope, _) = connect(SiglentSim::new("SDS2104X Plus")).await;
        assert_eq!(scope.num_averages(0).await.unwrap(), 1);
        scope.set_num_averages(0, 64).await.unwrap();
        scope.pipe.flush().await.unwrap();
        scope.flush_config_cache().await.unwrap();
        assert_eq!(scope.num_averages(2).await.unwrap(), 64);
    }

    #[tokio::test]
    async fn test_lecroy_threshold_shared_by_group() {
        let (scope, _) = connect(LeCroySim::new("WAVERUNNER9254M", "MSXX")).await;
        let d0 = scope.channel_by_name("D0").unwrap();
        let d7 = scope.channel_by_name("D7").unwrap();
        let d8 = scope.channel_by_name("D8").unwrap();
        assert!((scope.digital_threshold(d8).await.unwrap() - 1.4).abs() < 1e-9);
        scope.set_digital_threshold(d0, 0.8).await.unwrap();
        assert!((scope.digital_threshold(d7).await.unwrap() - 0.8).abs() < 1e-9);
        assert!(matches!(
            scope.digital_threshold(0).await,
            Err(ScopeError::Unsupported(_))
        ));
    }
}
