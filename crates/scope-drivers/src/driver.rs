//! Driver construction and shared plumbing.
//!
//! [`ScopeDriver::connect`] runs the bring-up sequence:
//!
//! 1. Resynchronise the reply stream (an aborted session may have left
//!    replies in the socket).
//! 2. `*IDN?` and `*OPT?`: resolve the [`Family`] and the installed options.
//! 3. Count analog inputs (from the model number, or by probing the MAUI
//!    automation tree on models whose name carries no count).
//! 4. Build the channel table, configure rate limiting and deduplication.
//! 5. Select the waveform transfer format.
//! 6. Detect probes.
//!
//! The accessor groups live in their own modules ([`crate::vertical`],
//! [`crate::timebase`], [`crate::acquisition`], ...) as further `impl` blocks
//! on the same type.

use crate::cache::ConfigCache;
use crate::channel::{enumerate_channels, Channel, ChannelKind};
use crate::codec::timestamp::MonotonicStart;
use crate::family::{bandwidth_from_model, channel_count_from_model, Family, Vendor};
use crate::options::InstrumentOptions;
use crate::probe::{default_max_bandwidth, ProbeKind};
use crate::trigger::{Trigger, TriggerContext};
use crate::wire;
use parking_lot::{Mutex, RwLock};
use scope_core::{
    CpuConverter, PendingWaveforms, SampleConverter, ScopeError, ScopeResult, Transport, Unit,
};
use scope_scpi::{Identity, ResyncProbe, ScpiPipeline};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Highest channel number probed on models that do not encode a count.
const MAX_PROBED_CHANNELS: usize = 80;

/// Analog inputs assumed when nothing else tells us.
const FALLBACK_CHANNELS: usize = 4;

// =============================================================================
// Settings
// =============================================================================

/// Per-connection behaviour that is not discoverable from the instrument.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Firmware reports 16-bit sample counts instead of byte counts in block
    /// headers.
    pub size_workaround: bool,
    /// Stop after each capture instead of re-arming.
    pub one_shot: bool,
    /// Download retries after the first attempt.
    pub retries: usize,
    /// Capacity of the output queue, in sequence sets.
    pub queue_depth: usize,
    /// Minimum spacing between writes; `None` uses the family default.
    pub rate_limit: Option<Duration>,
    /// Extra command headers whose consecutive writes collapse to the last one.
    pub dedup: Vec<String>,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            size_workaround: false,
            one_shot: false,
            retries: 3,
            queue_depth: scope_core::pending::DEFAULT_PENDING_DEPTH,
            rate_limit: None,
            dedup: Vec::new(),
        }
    }
}

/// Headers UI sliders hammer, per family.
fn default_dedup(family: Family) -> &'static [&'static str] {
    match family.vendor() {
        Vendor::LeCroy => &["OFFSET", "VOLT_DIV", "TRACE"],
        Vendor::Tektronix => &["OFFSET", "SCALE"],
        Vendor::Siglent if family.is_legacy_siglent() => &["OFST", "VDIV", "TRA"],
        Vendor::Siglent => &["OFFSET", "SCALE", "SWITCH"],
        Vendor::Unknown => &[],
    }
}

// =============================================================================
// Acquisition state
// =============================================================================

#[derive(Debug, Default)]
pub(crate) struct AcqState {
    pub armed: bool,
    pub one_shot: bool,
    /// When a forced trigger may be reported as fired.
    pub force_at: Option<Instant>,
    /// Bumped by every `stop()`; a download that sees it change is stale.
    pub stops: u64,
}

// =============================================================================
// ScopeDriver
// =============================================================================

/// A connected oscilloscope.
pub struct ScopeDriver {
    pub(crate) pipe: ScpiPipeline,
    identity: Identity,
    pub(crate) family: Family,
    options: InstrumentOptions,
    pub(crate) channels: RwLock<Vec<Channel>>,
    pub(crate) analog_count: usize,
    /// Full analog bandwidth, MHz.
    pub(crate) max_bandwidth: u32,
    pub(crate) settings: DriverSettings,
    pub(crate) cache: tokio::sync::Mutex<ConfigCache>,
    pub(crate) trigger: tokio::sync::Mutex<Option<Trigger>>,
    pub(crate) pending: PendingWaveforms,
    converter: RwLock<Arc<dyn SampleConverter>>,
    pub(crate) acq: Mutex<AcqState>,
    pub(crate) starts: Mutex<MonotonicStart>,
    /// Waveforms are requested as 16-bit words.
    pub(crate) word_transfer: AtomicBool,
}

impl std::fmt::Debug for ScopeDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeDriver")
            .field("transport", &self.pipe.name())
            .field("identity", &self.identity)
            .field("family", &self.family)
            .field("analog_count", &self.analog_count)
            .finish_non_exhaustive()
    }
}

impl ScopeDriver {
    /// Identify the instrument on `transport` and bring it into a known state.
    pub async fn connect(
        transport: Box<dyn Transport>,
        settings: DriverSettings,
    ) -> ScopeResult<Self> {
        let pipe = ScpiPipeline::new(transport);

        // the vendor is unknown until *IDN? answers; any comma-separated reply will do
        let stale = pipe
            .resync(&ResyncProbe::idn(Family::Unknown.idn_magic()))
            .await?;
        if stale > 0 {
            tracing::warn!(stale, "Discarded replies left over from a previous session");
        }

        let identity = Identity::parse(&pipe.query("*IDN?").await?)?;
        let options = InstrumentOptions::parse(&pipe.query("*OPT?").await?);
        let family = Family::detect(&identity).with_options(options.xdev);
        if family == Family::Unknown {
            tracing::warn!(
                vendor = %identity.vendor,
                model = %identity.model,
                "Unrecognised instrument, using a minimal feature set"
            );
        }

        if (options.awg || options.dvm) && !family.controls_secondary_instruments() {
            tracing::warn!(
                family = %family,
                awg = options.awg,
                dvm = options.dvm,
                "Generator and voltmeter options are not supported on this family"
            );
        }

        let analog_count = match channel_count_from_model(&identity.model) {
            Some(n) => n,
            None if family.vendor() == Vendor::LeCroy => probe_channel_count(&pipe).await?,
            None => {
                tracing::warn!(model = %identity.model, "Model encodes no channel count");
                FALLBACK_CHANNELS
            }
        };
        let channels = enumerate_channels(family, analog_count, &options);
        let max_bandwidth = bandwidth_from_model(family, &identity.model)
            .unwrap_or_else(|| default_max_bandwidth(family));

        if let Some(interval) = settings.rate_limit.or_else(|| family.write_interval()) {
            pipe.enable_rate_limiting(interval);
        }
        for head in default_dedup(family) {
            pipe.deduplicate_command(head);
        }
        for head in &settings.dedup {
            pipe.deduplicate_command(head);
        }

        tracing::info!(
            %family,
            model = %identity.model,
            serial = %identity.serial,
            firmware = %identity.firmware,
            analog_count,
            channels = channels.len(),
            "Connected to oscilloscope"
        );

        let driver = Self {
            pipe,
            family,
            analog_count,
            max_bandwidth,
            channels: RwLock::new(channels),
            cache: tokio::sync::Mutex::new(ConfigCache::new()),
            trigger: tokio::sync::Mutex::new(None),
            pending: PendingWaveforms::new(settings.queue_depth.max(1)),
            converter: RwLock::new(Arc::new(CpuConverter)),
            acq: Mutex::new(AcqState {
                one_shot: settings.one_shot,
                ..AcqState::default()
            }),
            starts: Mutex::new(MonotonicStart::new()),
            word_transfer: AtomicBool::new(family.prefers_word_transfer()),
            identity,
            options,
            settings,
        };
        driver.select_transfer_format().await?;
        driver.flush_config_cache().await?;
        Ok(driver)
    }

    /// Headers off, binary transfers, and the sample width the family prefers.
    pub(crate) async fn select_transfer_format(&self) -> ScopeResult<()> {
        let word = self.word_transfer.load(Ordering::Relaxed);
        match self.vendor() {
            Vendor::LeCroy => {
                self.pipe.send_queued("COMM_HEADER OFF");
                self.pipe.send_queued(format!(
                    "COMM_FORMAT DEF9,{},BIN",
                    if word { "WORD" } else { "BYTE" }
                ));
                self.pipe.send_queued("COMM_ORDER LO");
            }
            Vendor::Tektronix => {
                self.pipe.send_queued("HEADER OFF");
                self.pipe.send_queued("DATA:ENCDG RIBINARY");
                self.pipe
                    .send_queued(format!("WFMOUTPRE:BYT_NR {}", if word { 2 } else { 1 }));
                self.pipe.send_queued("DATA:START 1");
                self.pipe
                    .send_queued(format!("DATA:STOP {}", self.options.max_memory_depth));
            }
            Vendor::Siglent if self.family.is_legacy_siglent() => {
                self.pipe.send_queued("CHDR OFF");
            }
            Vendor::Siglent => {
                self.pipe.send_queued("CHDR OFF");
                self.pipe.send_queued(format!(
                    ":WAVEFORM:WIDTH {}",
                    if word { "WORD" } else { "BYTE" }
                ));
                self.pipe.send_queued(":WAVEFORM:STARTPOINT 0");
                self.pipe.send_queued(":WAVEFORM:POINT 0");
                self.pipe.send_queued(":WAVEFORM:INTERVAL 1");
            }
            Vendor::Unknown => {}
        }
        self.pipe.flush().await
    }

    // =========================================================================
    // Identity
    // =========================================================================

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn vendor(&self) -> Vendor {
        self.family.vendor()
    }

    pub fn options(&self) -> &InstrumentOptions {
        &self.options
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    /// Transport name, for logs.
    pub fn transport_name(&self) -> &str {
        self.pipe.name()
    }

    /// Number of analog inputs.
    pub fn analog_count(&self) -> usize {
        self.analog_count
    }

    /// Full analog bandwidth of the model, MHz.
    pub fn max_bandwidth(&self) -> u32 {
        self.max_bandwidth
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    pub fn channel(&self, index: usize) -> Option<Channel> {
        self.channels.read().get(index).cloned()
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.channels.read().clone()
    }

    /// Index of the channel with wire name `hwname`, case-insensitive.
    pub fn channel_by_name(&self, hwname: &str) -> Option<usize> {
        self.channels
            .read()
            .iter()
            .position(|c| c.hwname.eq_ignore_ascii_case(hwname))
    }

    /// Replace the raw-code converter (e.g. with a GPU-backed one).
    pub fn set_sample_converter(&self, converter: Arc<dyn SampleConverter>) {
        tracing::info!(converter = converter.name(), "Sample converter selected");
        *self.converter.write() = converter;
    }

    pub(crate) fn converter(&self) -> Arc<dyn SampleConverter> {
        Arc::clone(&self.converter.read())
    }

    pub(crate) fn is_legacy(&self) -> bool {
        self.family.is_legacy_siglent()
    }

    pub(crate) fn trigger_context<'a>(&self, channels: &'a [Channel]) -> TriggerContext<'a> {
        TriggerContext {
            family: self.family,
            channels,
            serial_pattern: self.options.serial_pattern_trigger,
        }
    }

    // =========================================================================
    // Channel lookup
    // =========================================================================

    pub(crate) fn channel_info(&self, index: usize) -> ScopeResult<Channel> {
        self.channel(index)
            .ok_or_else(|| ScopeError::InvalidParameter(format!("no channel {}", index)))
    }

    /// 1-based input number of analog channel `index`.
    pub(crate) fn analog_number(&self, index: usize) -> ScopeResult<usize> {
        let channel = self.channel_info(index)?;
        if channel.kind != ChannelKind::Analog {
            return Err(ScopeError::Unsupported(format!(
                "{} is not an analog input",
                channel.hwname
            )));
        }
        Ok(channel.number())
    }

    /// Analog input `n` (1-based) as a channel index.
    pub(crate) fn analog_index(&self, number: usize) -> usize {
        number.saturating_sub(1)
    }

    /// Whether `index` can capture right now. Analog inputs lose that to a
    /// logic probe; its lanes gain it.
    pub(crate) fn usable_with(&self, cache: &ConfigCache, channel: &Channel) -> bool {
        let probe = |i: usize| cache.probe(i).unwrap_or_default();
        match channel.kind {
            ChannelKind::Analog => !probe(channel.index).is_digital(),
            ChannelKind::Digital => channel.parent.map_or(true, |p| probe(p).is_digital()),
            ChannelKind::Spectrum => channel.parent.is_some_and(|p| !probe(p).is_digital()),
            ChannelKind::Trigger | ChannelKind::FunctionGenerator | ChannelKind::DmmSource => {
                false
            }
        }
    }

    /// Whether channel `index` can be enabled for capture.
    pub async fn is_channel_usable(&self, index: usize) -> ScopeResult<bool> {
        let channel = self.channel_info(index)?;
        let cache = self.cache.lock().await;
        Ok(self.usable_with(&cache, &channel))
    }

    // =========================================================================
    // Wire helpers
    // =========================================================================

    /// Read a MAUI automation property below `app.`.
    pub(crate) async fn vbs_get(&self, path: &str) -> ScopeResult<String> {
        let reply = self
            .pipe
            .query(&format!("VBS? 'return=app.{}'", path))
            .await?;
        Ok(reply.trim().trim_matches('"').to_string())
    }

    pub(crate) async fn vbs_f64(&self, path: &str) -> ScopeResult<f64> {
        wire::parse_number(&self.vbs_get(path).await?)
    }

    /// Queue a MAUI automation property write; `value` is sent verbatim.
    pub(crate) fn vbs_set(&self, path: &str, value: impl std::fmt::Display) {
        self.pipe
            .send_queued(format!("VBS 'app.{} = {}'", path, value));
    }

    /// Text reply with any echoed header and quotes removed.
    pub(crate) async fn query_text(&self, query: &str) -> ScopeResult<String> {
        let reply = self.pipe.query(query).await?;
        let value = if self.is_legacy() {
            wire::strip_header(&reply)
        } else {
            reply.trim()
        };
        Ok(value.trim_matches('"').to_string())
    }

    /// Numeric reply, tolerating echoed headers, units and SI suffixes.
    pub(crate) async fn query_number(&self, query: &str) -> ScopeResult<f64> {
        wire::parse_number(&self.pipe.query(query).await?)
    }

    pub(crate) async fn query_flag(&self, query: &str) -> ScopeResult<bool> {
        scope_scpi::parse_bool(&self.query_text(query).await?)
    }

    // =========================================================================
    // Cache and probes
    // =========================================================================

    /// Forget every mirrored setting and re-detect probes.
    pub async fn flush_config_cache(&self) -> ScopeResult<()> {
        let mut cache = self.cache.lock().await;
        cache.flush();
        *self.trigger.lock().await = None;
        self.detect_probes(&mut cache).await
    }

    pub(crate) async fn detect_probes(&self, cache: &mut ConfigCache) -> ScopeResult<()> {
        for index in 0..self.analog_count {
            let n = index + 1;
            let (kind, known, name) = match self.vendor() {
                Vendor::LeCroy => {
                    let name = self.vbs_get(&format!("Acquisition.C{}.ProbeName", n)).await?;
                    let (kind, known) = ProbeKind::classify(Vendor::LeCroy, "", &name);
                    (kind, known, name)
                }
                Vendor::Tektronix => {
                    let ty = self.query_text(&format!("CH{}:PROBETYPE?", n)).await?;
                    let name = self.query_text(&format!("CH{}:PROBE:ID:TYPE?", n)).await?;
                    let (kind, known) = ProbeKind::classify(Vendor::Tektronix, &ty, &name);
                    (kind, known, name)
                }
                // no probe identification on the Siglent tree
                Vendor::Siglent | Vendor::Unknown => (ProbeKind::None, true, String::new()),
            };
            if !known {
                tracing::warn!(channel = n, probe = %name, "Unknown probe model, treating as passive");
            }
            if kind != ProbeKind::None {
                tracing::debug!(channel = n, probe = %name, ?kind, "Probe detected");
            }
            cache.probes.insert(index, kind);
            cache.probe_active.insert(index, kind.is_active());
            cache.probe_names.insert(index, name);

            let unit = if kind == ProbeKind::Current {
                Unit::Amps
            } else {
                Unit::Volts
            };
            if let Some(channel) = self.channels.write().get_mut(index) {
                channel.y_unit = unit;
            }
        }
        Ok(())
    }

    /// Probe kind on analog channel `index` as of the last detection.
    pub async fn probe_kind(&self, index: usize) -> ScopeResult<ProbeKind> {
        self.analog_number(index)?;
        Ok(self.cache.lock().await.probe(index).unwrap_or_default())
    }

    /// Probe model string on analog channel `index`, empty when unknown.
    pub async fn probe_name(&self, index: usize) -> ScopeResult<String> {
        self.analog_number(index)?;
        Ok(self
            .cache
            .lock()
            .await
            .probe_names
            .get(&index)
            .cloned()
            .unwrap_or_default())
    }
}

/// Count inputs on a MAUI instrument by asking which `app.Acquisition.Cn`
/// objects exist.
async fn probe_channel_count(pipe: &ScpiPipeline) -> ScopeResult<usize> {
    let mut count = 0;
    for n in 1..=MAX_PROBED_CHANNELS {
        let reply = pipe
            .query(&format!("VBS? 'return=IsObject(app.Acquisition.C{})'", n))
            .await?;
        if !scope_scpi::parse_bool(&reply).unwrap_or(false) {
            break;
        }
        count = n;
    }
    if count == 0 {
        tracing::warn!("No analog channels found by probing, assuming {}", FALLBACK_CHANNELS);
        return Ok(FALLBACK_CHANNELS);
    }
    tracing::debug!(count, "Analog channels found by probing");
    Ok(count)
}
