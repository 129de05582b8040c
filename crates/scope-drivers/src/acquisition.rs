//! Arming, trigger polling and waveform download.
//!
//! A capture moves through three phases. [`ScopeDriver::poll_trigger`] asks
//! the instrument whether it fired. The fetch phase then pulls descriptors
//! and sample blocks for every enabled channel under a single pipeline lock,
//! retrying with a PRBS resync when the reply stream goes bad. Continuous
//! acquisitions are re-armed as soon as the bytes are in, and only then are
//! codes converted into [`SequenceSet`]s and queued on the pending FIFO.
//!
//! Channels whose enable state changed after the last arm are skipped for
//! that capture: the instrument's memory does not hold data for them yet.

use crate::channel::{Channel, ChannelKind};
use crate::codec::digital::{dedup_lane, demux_lanes};
use crate::codec::lecroy_digital::DigitalCapture;
use crate::codec::samples::{Calibration, Codes};
use crate::codec::timestamp::{self, from_y2k_nanos};
use crate::codec::uniform_timing;
use crate::codec::wavedesc::{parse_trigtime, WaveDesc};
use crate::codec::wfmpre::{promote_unit, BinaryFormat, WfmPreamble};
use crate::driver::{AcqState, ScopeDriver};
use crate::family::Vendor;
use crate::trigger::{self, Trigger};
use scope_core::{
    SampleBuffer, ScopeError, ScopeResult, SequenceSet, UniformWaveform, Unit, Waveform,
    WaveformFlags, WaveformTiming, FS_PER_SECOND,
};
use scope_scpi::{BlockLength, PipelineGuard, ResyncProbe};
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

/// Trigger state as seen by one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerStatus {
    /// Armed, waiting for a trigger.
    Run,
    /// A capture is ready for download.
    Triggered,
    /// Not armed.
    Stop,
}

// =============================================================================
// Downloaded records
// =============================================================================

/// One analog channel as read off the wire.
struct AnalogRecord {
    channel: usize,
    codes: Codes,
    cal: Calibration,
    interval: f64,
    /// Trigger to first sample, one entry per segment.
    offsets: Vec<f64>,
    unit: Option<Unit>,
}

enum DigitalRecord {
    /// Byte-per-sample stream of an 8-lane probe; `lanes[bit]` is the
    /// channel fed by that bit, if enabled.
    Packed {
        bytes: Vec<u8>,
        interval: f64,
        offset: f64,
        lanes: [Option<usize>; 8],
    },
    /// Lines already unpacked, keyed by channel index.
    Lines {
        lines: Vec<(usize, Vec<bool>)>,
        interval: f64,
        offset: f64,
    },
}

struct SpectrumRecord {
    channel: usize,
    bins: Vec<f32>,
    hz_per_bin: f64,
    start_hz: f64,
}

/// Everything one capture produced, before conversion.
#[derive(Default)]
struct Download {
    analog: Vec<AnalogRecord>,
    digital: Vec<DigitalRecord>,
    spectrum: Vec<SpectrumRecord>,
    /// Start time of each segment as `(seconds, femtoseconds)`.
    starts: Vec<(i64, i64)>,
}

impl Download {
    fn is_empty(&self) -> bool {
        self.analog.is_empty() && self.digital.is_empty() && self.spectrum.is_empty()
    }

    fn segments(&self) -> usize {
        self.starts.len().max(1)
    }
}

/// Channels taking part in one capture.
struct Selection {
    analog: Vec<usize>,
    digital: Vec<usize>,
    spectrum: Vec<usize>,
}

/// `base` moved by `seconds`, normalised.
fn offset_start(base: (i64, i64), seconds: f64) -> (i64, i64) {
    let fs = base.1 + (seconds * FS_PER_SECOND as f64).round() as i64;
    (
        base.0 + fs.div_euclid(FS_PER_SECOND),
        fs.rem_euclid(FS_PER_SECOND),
    )
}

fn check_count(actual: usize, expected: usize) -> ScopeResult<()> {
    if actual != expected {
        return Err(ScopeError::LengthMismatch { expected, actual });
    }
    Ok(())
}

impl AcqState {
    /// `stop()` ran after `generation` was read.
    fn stopped_since(&self, generation: Option<u64>) -> bool {
        generation.is_some_and(|g| self.stops != g)
    }
}

/// Handle to a task started by [`ScopeDriver::spawn_acquisition_loop`].
pub struct AcquisitionHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl AcquisitionHandle {
    /// Ask the loop to exit and wait for it. A download in flight completes
    /// first.
    pub async fn stop(self) {
        let _ = self.cancel.send(true);
        if let Err(e) = self.task.await {
            tracing::error!("Acquisition task panicked: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl ScopeDriver {
    // =========================================================================
    // Arm / stop
    // =========================================================================

    fn arm_commands(&self) -> &'static [&'static str] {
        match self.vendor() {
            Vendor::LeCroy => &["TRIG_MODE SINGLE"],
            Vendor::Tektronix => &["ACQUIRE:STOPAFTER SEQUENCE", "ACQUIRE:STATE ON"],
            Vendor::Siglent if self.is_legacy() => &["TRMD SINGLE"],
            Vendor::Siglent => &[":TRIGGER:MODE SINGLE"],
            Vendor::Unknown => &[],
        }
    }

    /// Flush pending writes, forget which channels changed and arm a single
    /// capture.
    async fn arm(&self, one_shot: bool) -> ScopeResult<()> {
        self.arm_unless_stopped(one_shot, None).await.map(|_| ())
    }

    /// Arm as [`arm`](Self::arm) does. With `generation` set, give up if
    /// `stop()` ran since that generation was read and return `false`.
    async fn arm_unless_stopped(
        &self,
        one_shot: bool,
        generation: Option<u64>,
    ) -> ScopeResult<bool> {
        let mut cache = self.cache.lock().await;
        let mut guard = self.pipe.lock().await;
        if self.acq.lock().stopped_since(generation) {
            return Ok(false);
        }
        guard.flush_queue().await?;
        let settled = cache.take_enable_dirty();
        if !settled.is_empty() {
            tracing::debug!(?settled, "Enable changes take effect with this capture");
        }
        for command in self.arm_commands() {
            guard.send(command).await?;
        }
        drop(cache);

        let raced = {
            let mut acq = self.acq.lock();
            if acq.stopped_since(generation) {
                true
            } else {
                acq.armed = true;
                acq.one_shot = one_shot;
                acq.force_at = None;
                false
            }
        };
        if raced {
            // the stop command may have been flushed ahead of our arm
            if let Some(command) = self.stop_command() {
                guard.send(command).await?;
            }
            return Ok(false);
        }
        Ok(true)
    }

    fn stop_command(&self) -> Option<&'static str> {
        match self.vendor() {
            Vendor::LeCroy => Some("TRIG_MODE STOP"),
            Vendor::Tektronix => Some("ACQUIRE:STATE STOP"),
            Vendor::Siglent if self.is_legacy() => Some("STOP"),
            Vendor::Siglent => Some(":TRIGGER:STOP"),
            Vendor::Unknown => None,
        }
    }

    /// Arm and keep re-arming after every capture, unless the connection is
    /// configured one-shot.
    pub async fn start(&self) -> ScopeResult<()> {
        tracing::info!(family = %self.family, one_shot = self.settings.one_shot, "Starting acquisition");
        self.arm(self.settings.one_shot).await
    }

    /// Arm for exactly one capture.
    pub async fn start_single_trigger(&self) -> ScopeResult<()> {
        tracing::info!(family = %self.family, "Arming single acquisition");
        self.arm(true).await
    }

    /// Disarm and drop every undelivered capture. A download already in
    /// progress runs to completion but is thrown away.
    pub async fn stop(&self) -> ScopeResult<()> {
        {
            let mut acq = self.acq.lock();
            acq.armed = false;
            acq.force_at = None;
            acq.stops += 1;
        }
        if let Some(command) = self.stop_command() {
            self.pipe.send_queued(command);
            self.pipe.flush().await?;
        }
        self.pending.clear();
        Ok(())
    }

    /// Trigger now, arming a single capture first if idle.
    ///
    /// The capture is treated as ready once the family's force delay has
    /// passed; the status register is not consulted in between.
    pub async fn force_trigger(&self) -> ScopeResult<()> {
        if !self.is_armed() {
            self.arm(true).await?;
        }
        let command = match self.vendor() {
            Vendor::LeCroy => "FRTR",
            Vendor::Tektronix => "TRIGGER FORCE",
            Vendor::Siglent if self.is_legacy() => "FRTR",
            Vendor::Siglent => ":TRIGGER:MODE FTRIG",
            Vendor::Unknown => {
                return Err(ScopeError::Unsupported("force trigger".into()));
            }
        };
        self.pipe.send_immediate(command).await?;
        self.acq.lock().force_at = Some(Instant::now() + self.family.force_delay());
        Ok(())
    }

    pub fn is_armed(&self) -> bool {
        self.acq.lock().armed
    }

    /// Ask the instrument whether the armed capture has fired.
    pub async fn poll_trigger(&self) -> ScopeResult<TriggerStatus> {
        let (armed, force_at) = {
            let acq = self.acq.lock();
            (acq.armed, acq.force_at)
        };
        if !armed {
            return Ok(TriggerStatus::Stop);
        }
        if let Some(at) = force_at {
            if Instant::now() < at {
                return Ok(TriggerStatus::Run);
            }
            self.acq.lock().force_at = None;
            return Ok(TriggerStatus::Triggered);
        }

        let fired = match self.vendor() {
            // bit 0 of the internal state register: new signal acquired
            Vendor::LeCroy => self.pipe.query_i64("INR?").await? & 1 != 0,
            Vendor::Tektronix => self
                .query_text("TRIGGER:STATE?")
                .await?
                .eq_ignore_ascii_case("SAVE"),
            Vendor::Siglent if self.is_legacy() => {
                self.query_text("SAST?").await?.eq_ignore_ascii_case("Stop")
            }
            Vendor::Siglent => self
                .query_text(":TRIGGER:STATUS?")
                .await?
                .eq_ignore_ascii_case("Stop"),
            Vendor::Unknown => false,
        };
        Ok(if fired {
            TriggerStatus::Triggered
        } else {
            TriggerStatus::Run
        })
    }

    // =========================================================================
    // Acquire
    // =========================================================================

    /// Poll once and, if the trigger fired, download and queue the capture.
    ///
    /// Returns `true` when at least one [`SequenceSet`] was queued. Transient
    /// download errors are retried up to [`DriverSettings::retries`] times;
    /// after that the driver disarms and the error is returned.
    ///
    /// [`DriverSettings::retries`]: crate::driver::DriverSettings::retries
    pub async fn acquire_data(&self) -> ScopeResult<bool> {
        let span = tracing::info_span!("acquire", family = %self.family);
        self.acquire_inner().instrument(span).await
    }

    async fn acquire_inner(&self) -> ScopeResult<bool> {
        let generation = self.acq.lock().stops;
        if self.poll_trigger().await? != TriggerStatus::Triggered {
            return Ok(false);
        }

        let selection = self.select_channels().await?;
        let mut attempt = 0;
        let download = loop {
            match self.fetch(&selection).await {
                Ok(download) => break download,
                Err(e) if attempt < self.settings.retries && e.is_transient() => {
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        error = %e,
                        desync = e.requires_resync(),
                        "Waveform download failed, retrying"
                    );
                    if let Err(resync) = self.recover_link().await {
                        tracing::error!(error = %resync, "Reply stream could not be recovered");
                        self.acq.lock().armed = false;
                        return Err(resync);
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, attempts = attempt + 1, "Waveform download failed");
                    self.acq.lock().armed = false;
                    return Err(e);
                }
            }
        };

        // the instrument can capture again while we convert
        let rearmed = {
            let mut acq = self.acq.lock();
            if acq.stops != generation {
                None
            } else if acq.one_shot {
                acq.armed = false;
                Some(false)
            } else {
                Some(true)
            }
        };
        match rearmed {
            None => {
                tracing::debug!("Stopped during download, discarding capture");
                return Ok(false);
            }
            Some(true) => {
                if !self.arm_unless_stopped(false, Some(generation)).await? {
                    tracing::debug!("Stopped during download, discarding capture");
                    return Ok(false);
                }
            }
            Some(false) => {}
        }

        if download.is_empty() {
            tracing::debug!("No enabled channels in this capture");
            return Ok(false);
        }
        let sets = self.assemble(download)?;
        let count = sets.len();
        {
            // stop() clears the FIFO after bumping the generation
            let acq = self.acq.lock();
            if acq.stops != generation {
                tracing::debug!("Stopped during decode, discarding capture");
                return Ok(false);
            }
            self.pending.extend(sets);
        }
        tracing::debug!(sets = count, pending = self.pending.len(), "Capture queued");
        Ok(true)
    }

    /// Drop whatever a failed download left unread, then realign the reply
    /// stream.
    async fn recover_link(&self) -> ScopeResult<usize> {
        let mut guard = self.pipe.lock().await;
        guard.flush_rx().await?;
        guard
            .resync(&ResyncProbe::idn(self.family.idn_magic()))
            .await
    }

    /// Enabled channels that are not waiting for a re-arm.
    async fn select_channels(&self) -> ScopeResult<Selection> {
        let dirty: BTreeSet<usize> = self.cache.lock().await.enable_dirty().clone();
        let mut selection = Selection {
            analog: Vec::new(),
            digital: Vec::new(),
            spectrum: Vec::new(),
        };
        for channel in self.channels() {
            let list = match channel.kind {
                ChannelKind::Analog => &mut selection.analog,
                ChannelKind::Digital => &mut selection.digital,
                ChannelKind::Spectrum => &mut selection.spectrum,
                _ => continue,
            };
            if dirty.contains(&channel.index) {
                tracing::debug!(channel = %channel.hwname, "Enable changed since arming, skipping");
                continue;
            }
            if self.is_channel_enabled(channel.index).await? {
                list.push(channel.index);
            }
        }
        Ok(selection)
    }

    async fn fetch(&self, selection: &Selection) -> ScopeResult<Download> {
        match self.vendor() {
            Vendor::LeCroy => self.fetch_lecroy(selection).await,
            Vendor::Tektronix => self.fetch_tek(selection).await,
            Vendor::Siglent => self.fetch_siglent(selection).await,
            Vendor::Unknown => Ok(Download::default()),
        }
    }

    // =========================================================================
    // LeCroy
    // =========================================================================

    async fn fetch_lecroy(&self, selection: &Selection) -> ScopeResult<Download> {
        let word = self.word_transfer.load(Ordering::Relaxed);
        let data_length = if word && self.settings.size_workaround {
            BlockLength::Samples16
        } else {
            BlockLength::Bytes
        };
        // with nothing analog enabled, channel 1's descriptor still carries
        // the trigger time and segment count
        let described: Vec<usize> = if selection.analog.is_empty() {
            vec![0]
        } else {
            selection.analog.clone()
        };

        let mut guard = self.pipe.lock().await;
        let requests: Vec<String> = described
            .iter()
            .map(|&i| format!("C{}:WF? DESC", i + 1))
            .collect();
        guard.send_batch(&requests).await?;
        let mut descs = Vec::with_capacity(described.len());
        for _ in &described {
            let raw = guard.read_block(BlockLength::Bytes, None).await?;
            descs.push(WaveDesc::parse(&raw)?);
        }
        let first = &descs[0];
        let segments = first.num_sequences();
        let trigtimes = if segments > 1 {
            guard
                .send(&format!("C{}:WF? TIME", described[0] + 1))
                .await?;
            let raw = guard.read_block(BlockLength::Bytes, None).await?;
            parse_trigtime(&raw, segments)?
        } else {
            vec![(0.0, first.horiz_offset)]
        };

        let requests: Vec<String> = selection
            .analog
            .iter()
            .map(|&i| format!("C{}:WF? DAT1", i + 1))
            .collect();
        guard.send_batch(&requests).await?;
        let mut analog = Vec::with_capacity(selection.analog.len());
        for (&channel, desc) in selection.analog.iter().zip(&descs) {
            let raw = guard.read_block(data_length, None).await?;
            let codes = Codes::decode(&raw, desc.bytes_per_sample(), false)?;
            check_count(codes.len(), desc.point_count as usize)?;
            check_count(codes.len() % segments, 0)?;
            analog.push(AnalogRecord {
                channel,
                codes,
                cal: Calibration::from_wavedesc(desc, self.family),
                interval: f64::from(desc.horiz_interval),
                offsets: trigtimes.iter().map(|t| t.1).collect(),
                unit: promote_unit(&desc.vertical_unit),
            });
        }

        let capture = if selection.digital.is_empty() {
            None
        } else {
            Some(Self::read_lecroy_digital(&mut guard).await?)
        };
        drop(guard);

        let mut base = first.trigger_time.to_epoch();
        let mut digital = Vec::new();
        if let Some(capture) = capture {
            if selection.analog.is_empty() {
                base = from_y2k_nanos(capture.first_event_time);
            }
            let channels = self.channels();
            let lines = capture
                .lines
                .into_iter()
                .filter_map(|(line, samples)| {
                    channels
                        .iter()
                        .find(|c| c.kind == ChannelKind::Digital && c.lane == Some(line as u8))
                        .filter(|c| selection.digital.contains(&c.index))
                        .map(|c| (c.index, samples))
                })
                .collect();
            digital.push(DigitalRecord::Lines {
                lines,
                interval: capture.hor_per_step,
                offset: capture.hor_start,
            });
        }

        let base = base.unwrap_or_else(timestamp::now);
        Ok(Download {
            analog,
            digital,
            spectrum: Vec::new(),
            starts: trigtimes.iter().map(|t| offset_start(base, t.0)).collect(),
        })
    }

    async fn read_lecroy_digital(guard: &mut PipelineGuard<'_>) -> ScopeResult<DigitalCapture> {
        guard.send("DIGITAL1:WF?").await?;
        let raw = guard.read_block(BlockLength::Bytes, None).await?;
        let xml = std::str::from_utf8(&raw).map_err(|_| {
            ScopeError::PreambleMalformed("digital capture is not UTF-8".into())
        })?;
        DigitalCapture::parse(xml)
    }

    // =========================================================================
    // Siglent
    // =========================================================================

    async fn fetch_siglent(&self, selection: &Selection) -> ScopeResult<Download> {
        let legacy = self.is_legacy();
        let mut guard = self.pipe.lock().await;
        let mut analog = Vec::with_capacity(selection.analog.len());
        let mut base = None;
        let mut segments = 1;
        for &channel in &selection.analog {
            let n = channel + 1;
            let (desc, raw) = if legacy {
                guard.send(&format!("C{}:WF? DESC", n)).await?;
                let desc = WaveDesc::parse(&guard.read_block(BlockLength::Bytes, None).await?)?;
                guard.send(&format!("C{}:WF? DAT2", n)).await?;
                (desc, guard.read_block(BlockLength::Bytes, None).await?)
            } else {
                guard
                    .send_batch(&[
                        format!(":WAVEFORM:SOURCE C{}", n),
                        ":WAVEFORM:PREAMBLE?".to_string(),
                    ])
                    .await?;
                let desc = WaveDesc::parse(&guard.read_block(BlockLength::Bytes, None).await?)?;
                guard.send(":WAVEFORM:DATA?").await?;
                (desc, guard.read_block(BlockLength::Bytes, None).await?)
            };
            segments = desc.num_sequences();
            let codes = Codes::decode(&raw, desc.bytes_per_sample(), false)?;
            check_count(codes.len(), desc.point_count as usize)?;
            check_count(codes.len() % segments, 0)?;
            if base.is_none() {
                base = desc.trigger_time.to_epoch();
            }
            analog.push(AnalogRecord {
                channel,
                codes,
                cal: Calibration::from_wavedesc(&desc, self.family),
                interval: f64::from(desc.horiz_interval),
                offsets: vec![desc.horiz_offset],
                unit: promote_unit(&desc.vertical_unit),
            });
        }
        drop(guard);

        let base = base.unwrap_or_else(timestamp::now);
        Ok(Download {
            analog,
            starts: vec![base; segments],
            ..Download::default()
        })
    }

    // =========================================================================
    // Tektronix
    // =========================================================================

    async fn read_tek_source(
        guard: &mut PipelineGuard<'_>,
        source: &str,
    ) -> ScopeResult<(WfmPreamble, Vec<u8>)> {
        guard
            .send_batch(&[format!("DATA:SOURCE {}", source), "WFMOUTPRE?".to_string()])
            .await?;
        let preamble = WfmPreamble::parse(&guard.read_reply().await?)?;
        guard.send("CURVE?").await?;
        let raw = guard.read_block(BlockLength::Bytes, None).await?;
        Ok((preamble, raw))
    }

    async fn fetch_tek(&self, selection: &Selection) -> ScopeResult<Download> {
        let channels = self.channels();
        let mut guard = self.pipe.lock().await;

        let mut analog = Vec::with_capacity(selection.analog.len());
        for &channel in &selection.analog {
            let (pre, raw) = Self::read_tek_source(&mut guard, &channels[channel].hwname).await?;
            let codes = Codes::decode(&raw, pre.bytes_per_sample, pre.big_endian)?;
            check_count(codes.len(), pre.point_count)?;
            let (gain, offset) = pre.calibration();
            analog.push(AnalogRecord {
                channel,
                codes,
                cal: Calibration { gain, offset },
                interval: pre.x_increment,
                offsets: vec![pre.x_zero],
                unit: pre.y_unit(),
            });
        }

        // one download per probe serves all eight lanes
        let hosts: BTreeSet<usize> = selection
            .digital
            .iter()
            .filter_map(|&i| channels[i].parent)
            .collect();
        let mut digital = Vec::with_capacity(hosts.len());
        for host in hosts {
            let mut lanes = [None; 8];
            for &i in &selection.digital {
                let ch = &channels[i];
                if let (Some(parent), Some(lane)) = (ch.parent, ch.lane) {
                    if parent == host && usize::from(lane) < lanes.len() {
                        lanes[usize::from(lane)] = Some(i);
                    }
                }
            }
            let source = format!("CH{}_DALL", host + 1);
            let (pre, bytes) = Self::read_tek_source(&mut guard, &source).await?;
            check_count(bytes.len(), pre.point_count)?;
            digital.push(DigitalRecord::Packed {
                bytes,
                interval: pre.x_increment,
                offset: pre.x_zero,
                lanes,
            });
        }

        let mut spectrum = Vec::with_capacity(selection.spectrum.len());
        for &channel in &selection.spectrum {
            let (pre, raw) = Self::read_tek_source(&mut guard, &channels[channel].hwname).await?;
            if pre.binary_format != BinaryFormat::Fp || pre.bytes_per_sample != 4 {
                return Err(ScopeError::PreambleMalformed(format!(
                    "spectrum expects 4-byte floats, got {:?} x{}",
                    pre.binary_format, pre.bytes_per_sample
                )));
            }
            let bins: Vec<f32> = raw
                .chunks_exact(4)
                .map(|b| {
                    let bytes = [b[0], b[1], b[2], b[3]];
                    if pre.big_endian {
                        f32::from_be_bytes(bytes)
                    } else {
                        f32::from_le_bytes(bytes)
                    }
                })
                .collect();
            check_count(bins.len(), pre.point_count)?;
            spectrum.push(SpectrumRecord {
                channel,
                bins,
                hz_per_bin: pre.x_increment,
                start_hz: pre.x_zero,
            });
        }
        drop(guard);

        // no trigger timestamp in the preamble
        Ok(Download {
            analog,
            digital,
            spectrum,
            starts: vec![timestamp::now()],
        })
    }

    // =========================================================================
    // Decode
    // =========================================================================

    fn assemble(&self, download: Download) -> ScopeResult<Vec<SequenceSet>> {
        let segments = download.segments();
        let converter = self.converter();
        let mut sets: Vec<SequenceSet> = (0..segments).map(|_| SequenceSet::new()).collect();

        for record in download.analog {
            self.promote_channel_unit(record.channel, record.unit);
            let per_segment = record.codes.len() / segments;
            for (seg, set) in sets.iter_mut().enumerate() {
                let codes = if segments == 1 {
                    Cow::Borrowed(&record.codes)
                } else {
                    Cow::Owned(record.codes.slice(seg * per_segment, per_segment)?)
                };
                let offset = record
                    .offsets
                    .get(seg)
                    .or_else(|| record.offsets.first())
                    .copied()
                    .unwrap_or_default();
                let mut waveform = UniformWaveform::new(uniform_timing(record.interval, offset));
                if codes.convert(converter.as_ref(), record.cal, &mut waveform.samples) {
                    waveform.timing.flags |= WaveformFlags::CLIPPING;
                }
                set.insert(record.channel, Waveform::Analog(waveform));
            }
        }

        if let Some(first) = sets.first_mut() {
            for record in download.digital {
                match record {
                    DigitalRecord::Packed {
                        bytes,
                        interval,
                        offset,
                        lanes,
                    } => {
                        let timing = uniform_timing(interval, offset);
                        for (lane, waveform) in demux_lanes(&bytes, timing).into_iter().enumerate() {
                            if let Some(channel) = lanes[lane] {
                                first.insert(channel, Waveform::Digital(waveform));
                            }
                        }
                    }
                    DigitalRecord::Lines {
                        lines,
                        interval,
                        offset,
                    } => {
                        let timing = uniform_timing(interval, offset);
                        for (channel, samples) in lines {
                            let waveform = dedup_lane(samples.into_iter(), timing);
                            first.insert(channel, Waveform::Digital(waveform));
                        }
                    }
                }
            }

            for record in download.spectrum {
                let waveform = UniformWaveform {
                    timing: WaveformTiming {
                        timescale: record.hz_per_bin.round() as i64,
                        trigger_phase: record.start_hz.round() as i64,
                        ..WaveformTiming::default()
                    },
                    samples: SampleBuffer::from_vec(record.bins),
                };
                first.insert(record.channel, Waveform::Spectrum(waveform));
            }
        }

        let mut starts = self.starts.lock();
        for (set, &start) in sets.iter_mut().zip(&download.starts) {
            let (seconds, fs) = starts.next(start);
            set.set_start(seconds, fs);
        }
        Ok(sets)
    }

    fn promote_channel_unit(&self, index: usize, unit: Option<Unit>) {
        let Some(unit) = unit else { return };
        let mut channels = self.channels.write();
        if let Some(channel) = channels.get_mut(index) {
            if channel.y_unit != unit {
                tracing::debug!(channel = %channel.hwname, ?unit, "Vertical unit changed");
                channel.y_unit = unit;
            }
        }
    }

    // =========================================================================
    // Pending FIFO
    // =========================================================================

    /// Oldest undelivered capture.
    pub fn pop_pending(&self) -> Option<SequenceSet> {
        self.pending.pop()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Captures discarded because the FIFO was full.
    pub fn dropped_waveform_count(&self) -> u64 {
        self.pending.dropped_count()
    }

    // =========================================================================
    // Trigger configuration
    // =========================================================================

    /// Write `trigger` to the instrument and remember it.
    pub async fn set_trigger(&self, trigger: Trigger) -> ScopeResult<()> {
        let channels: Vec<Channel> = self.channels();
        let ctx = self.trigger_context(&channels);
        let mut slot = self.trigger.lock().await;
        match self.vendor() {
            Vendor::LeCroy => trigger::lecroy::push(&self.pipe, &ctx, &trigger).await?,
            Vendor::Tektronix => trigger::tek::push(&self.pipe, &ctx, &trigger).await?,
            Vendor::Siglent => trigger::siglent::push(&self.pipe, &ctx, &trigger).await?,
            Vendor::Unknown => return Err(ScopeError::Unsupported("trigger".into())),
        }
        tracing::debug!(kind = %trigger.kind(), source = trigger.source(), "Trigger configured");
        *slot = Some(trigger);
        Ok(())
    }

    /// The active trigger, read from the instrument on first use.
    pub async fn trigger(&self) -> ScopeResult<Trigger> {
        let mut slot = self.trigger.lock().await;
        if let Some(trigger) = slot.as_ref() {
            return Ok(trigger.clone());
        }
        let channels: Vec<Channel> = self.channels();
        let ctx = self.trigger_context(&channels);
        let trigger = match self.vendor() {
            Vendor::LeCroy => trigger::lecroy::pull(&self.pipe, &ctx).await?,
            Vendor::Tektronix => trigger::tek::pull(&self.pipe, &ctx).await?,
            Vendor::Siglent => trigger::siglent::pull(&self.pipe, &ctx).await?,
            Vendor::Unknown => return Err(ScopeError::Unsupported("trigger".into())),
        };
        *slot = Some(trigger.clone());
        Ok(trigger)
    }

    /// Forget the remembered trigger and read it back from the instrument.
    pub async fn pull_trigger(&self) -> ScopeResult<Trigger> {
        self.trigger.lock().await.take();
        self.trigger().await
    }

    /// Let the instrument measure the UART bit rate of the signal on the
    /// trigger source. Returns the detected rate.
    pub async fn autobaud(&self) -> ScopeResult<i64> {
        if self.vendor() != Vendor::LeCroy {
            return Err(ScopeError::Unsupported(format!(
                "autobaud on {}",
                self.family
            )));
        }
        let mut slot = self.trigger.lock().await;
        let rate = trigger::lecroy::autobaud(&self.pipe).await?;
        // the remembered trigger no longer matches the instrument
        slot.take();
        tracing::info!(rate, "UART bit rate detected");
        Ok(rate)
    }

    // =========================================================================
    // Background loop
    // =========================================================================

    /// Poll and download on a background task until the handle is stopped or
    /// the link fails for good.
    pub fn spawn_acquisition_loop(self: &Arc<Self>, poll_interval: Duration) -> AcquisitionHandle {
        let (cancel, mut cancelled) = watch::channel(false);
        let scope = Arc::clone(self);
        let task = tokio::spawn(async move {
            tracing::info!(family = %scope.family, "Acquisition loop started");
            loop {
                if *cancelled.borrow() {
                    break;
                }
                match scope.acquire_data().await {
                    // another capture may already be waiting
                    Ok(true) => {
                        tokio::task::yield_now().await;
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) if e.is_fatal() => {
                        tracing::error!(error = %e, "Acquisition loop giving up");
                        break;
                    }
                    Err(e) => tracing::warn!(error = %e, "Acquisition pass failed"),
                }
                tokio::select! {
                    changed = cancelled.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
            tracing::info!("Acquisition loop stopped");
        });
        AcquisitionHandle { cancel, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverSettings;
    use crate::sim::lecroy::LeCroySim;
    use crate::sim::siglent::SiglentSim;
    use crate::sim::tek::TekSim;
    use crate::trigger::EdgeSlope;
    use scope_scpi::{MockHandle, MockReply, MockTransport, Responder};

    async fn connect_with(
        sim: impl Responder + 'static,
        settings: DriverSettings,
    ) -> (ScopeDriver, MockHandle) {
        let transport = MockTransport::new(sim);
        let handle = transport.handle();
        let scope = ScopeDriver::connect(Box::new(transport), settings)
            .await
            .unwrap();
        (scope, handle)
    }

    async fn connect(sim: impl Responder + 'static) -> (ScopeDriver, MockHandle) {
        connect_with(sim, DriverSettings::default()).await
    }

    fn analog_len(set: &SequenceSet, channel: usize) -> usize {
        set.get(channel).and_then(Waveform::as_analog).unwrap().len()
    }

    /// Damage done to a reply the wrapped simulator produced.
    #[derive(Clone, Copy)]
    enum Fault {
        /// Cut binary blocks in half.
        Truncate,
        /// Answer with an undersized descriptor followed by stray lines.
        Corrupt,
        /// Send nothing back.
        Silence,
    }

    struct Rule {
        command: &'static str,
        fault: Fault,
        remaining: usize,
        after: Option<&'static str>,
    }

    /// Simulator that damages the replies to selected commands.
    struct Faulty<R> {
        inner: R,
        rules: Vec<Rule>,
        seen: BTreeSet<String>,
    }

    impl<R: Responder> Faulty<R> {
        fn new(inner: R) -> Self {
            Self {
                inner,
                rules: Vec::new(),
                seen: BTreeSet::new(),
            }
        }

        fn fail(self, command: &'static str, fault: Fault, times: usize) -> Self {
            self.rule(command, fault, times, None)
        }

        /// Like `fail`, but only once `after` has been received.
        fn fail_after(
            self,
            after: &'static str,
            command: &'static str,
            fault: Fault,
            times: usize,
        ) -> Self {
            self.rule(command, fault, times, Some(after))
        }

        fn rule(
            mut self,
            command: &'static str,
            fault: Fault,
            remaining: usize,
            after: Option<&'static str>,
        ) -> Self {
            self.rules.push(Rule {
                command,
                fault,
                remaining,
                after,
            });
            self
        }
    }

    impl<R: Responder> Responder for Faulty<R> {
        fn respond(&mut self, command: &str) -> Vec<MockReply> {
            let replies = self.inner.respond(command);
            let seen = &self.seen;
            let rule = self.rules.iter_mut().find(|r| {
                r.command == command
                    && r.remaining > 0
                    && r.after.map_or(true, |a| seen.contains(a))
            });
            let fault = rule.map(|r| {
                r.remaining -= 1;
                r.fault
            });
            self.seen.insert(command.to_string());
            match fault {
                None => replies,
                Some(Fault::Truncate) => replies
                    .into_iter()
                    .map(|reply| match reply {
                        MockReply::Raw(mut bytes) => {
                            bytes.truncate(bytes.len() / 2);
                            MockReply::Raw(bytes)
                        }
                        other => other,
                    })
                    .collect(),
                Some(Fault::Corrupt) => vec![
                    MockReply::block(b"WAVEDESC"),
                    MockReply::text("C1:VDIV 0.5"),
                    MockReply::text("C1:OFST 0"),
                    MockReply::text("C1:VDIV 0.5"),
                ],
                Some(Fault::Silence) => Vec::new(),
            }
        }
    }

    fn count(commands: &[String], command: &str) -> usize {
        commands.iter().filter(|c| *c == command).count()
    }

    #[test]
    fn test_offset_start_normalises() {
        assert_eq!(offset_start((10, 0), 1e-3), (10, 1_000_000_000_000));
        assert_eq!(
            offset_start((10, FS_PER_SECOND - 1), 2e-15),
            (11, 1)
        );
        assert_eq!(offset_start((10, 0), -1e-15), (9, FS_PER_SECOND - 1));
    }

    #[tokio::test]
    async fn test_lecroy_single_capture() {
        let (scope, _) = connect(LeCroySim::new("WAVERUNNER9254M", "")).await;
        assert_eq!(scope.poll_trigger().await.unwrap(), TriggerStatus::Stop);

        scope.start_single_trigger().await.unwrap();
        assert!(scope.acquire_data().await.unwrap());
        assert!(!scope.is_armed());

        let set = scope.pop_pending().unwrap();
        assert_eq!(set.channels().collect::<Vec<_>>(), vec![0]);
        let waveform = set.get(0).unwrap();
        assert_eq!(waveform.len(), 1000);
        assert_eq!(waveform.timing().timescale, 1_000_000);

        // one-shot: nothing more until re-armed
        assert!(!scope.acquire_data().await.unwrap());
        assert!(scope.pop_pending().is_none());
    }

    #[tokio::test]
    async fn test_sample_count_follows_depth() {
        let (scope, _) = connect(TekSim::new("MSO64", "")).await;
        scope.set_sample_depth(10_000).await.unwrap();
        scope.start_single_trigger().await.unwrap();
        assert!(scope.acquire_data().await.unwrap());
        let set = scope.pop_pending().unwrap();
        assert_eq!(analog_len(&set, 0), 10_000);
    }

    #[tokio::test]
    async fn test_sequence_capture_splits_segments() {
        let sim = LeCroySim::new("WAVERUNNER9254M", "")
            .with_setting("app.acquisition.horizontal.samplemode", "Sequence")
            .with_setting("app.acquisition.horizontal.numsegments", "2");
        let (scope, _) = connect(sim).await;
        scope.start_single_trigger().await.unwrap();
        assert!(scope.acquire_data().await.unwrap());

        assert_eq!(scope.pending_count(), 2);
        let a = scope.pop_pending().unwrap();
        let b = scope.pop_pending().unwrap();
        assert_eq!(analog_len(&a, 0), 1000);
        assert_eq!(analog_len(&b, 0), 1000);
        assert!(b.start_key() > a.start_key());
        assert_ne!(
            a.get(0).and_then(Waveform::as_analog).unwrap().samples.as_slice(),
            b.get(0).and_then(Waveform::as_analog).unwrap().samples.as_slice()
        );
    }

    #[tokio::test]
    async fn test_size_quirk_counts_samples() {
        let sim = LeCroySim::new("LECROY XDEV", "XDEV")
            .with_size_quirk()
            .with_setting("app.acquisition.horizontal.maxsamples", "100000");
        let settings = DriverSettings {
            size_workaround: true,
            ..DriverSettings::default()
        };
        let (scope, _) = connect_with(sim, settings).await;
        scope.start_single_trigger().await.unwrap();
        assert!(scope.acquire_data().await.unwrap());
        let set = scope.pop_pending().unwrap();
        assert_eq!(analog_len(&set, 0), 100_000);
    }

    #[tokio::test]
    async fn test_starts_strictly_increase() {
        let (scope, _) = connect(SiglentSim::new("SDS2104X Plus")).await;
        scope.start().await.unwrap();
        assert!(scope.acquire_data().await.unwrap());
        assert!(scope.acquire_data().await.unwrap());
        let a = scope.pop_pending().unwrap().start_key().unwrap();
        let b = scope.pop_pending().unwrap().start_key().unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_continuous_rearms_after_download() {
        let (scope, handle) = connect(LeCroySim::new("WAVERUNNER9254M", "")).await;
        scope.start().await.unwrap();
        handle.clear_log();
        assert!(scope.acquire_data().await.unwrap());
        assert!(scope.is_armed());

        let commands = handle.commands();
        let data = commands.iter().position(|c| c == "C1:WF? DAT1").unwrap();
        let rearm = commands.iter().rposition(|c| c == "TRIG_MODE SINGLE").unwrap();
        assert!(rearm > data);
    }

    #[tokio::test]
    async fn test_enable_after_arm_waits_for_next_capture() {
        let (scope, _) = connect(LeCroySim::new("WAVERUNNER9254M", "")).await;
        scope.start().await.unwrap();
        scope.enable_channel(2).await.unwrap();

        assert!(scope.acquire_data().await.unwrap());
        let set = scope.pop_pending().unwrap();
        assert!(set.get(0).is_some());
        assert!(set.get(2).is_none());

        assert!(scope.acquire_data().await.unwrap());
        let set = scope.pop_pending().unwrap();
        assert_eq!(analog_len(&set, 2), 1000);
    }

    #[tokio::test]
    async fn test_tek_digital_lanes() {
        let (scope, _) = connect(TekSim::new("MSO64", "").with_digital_probe(2)).await;
        let d0 = scope.channel_by_name("CH2_D0").unwrap();
        let d3 = scope.channel_by_name("CH2_D3").unwrap();
        scope.enable_channel(d0).await.unwrap();
        scope.enable_channel(d3).await.unwrap();

        scope.start_single_trigger().await.unwrap();
        assert!(scope.acquire_data().await.unwrap());
        let set = scope.pop_pending().unwrap();
        assert_eq!(analog_len(&set, 0), 1000);
        for lane in [d0, d3] {
            let waveform = set.get(lane).and_then(Waveform::as_digital).unwrap();
            let total: i64 = waveform.iter().map(|(_, d, _)| d).sum();
            assert_eq!(total, 1000);
        }
        let d1 = scope.channel_by_name("CH2_D1").unwrap();
        assert!(set.get(d1).is_none());
    }

    #[tokio::test]
    async fn test_tek_spectrum() {
        let (scope, _) = connect(TekSim::new("MSO58", "")).await;
        let sv = scope.channel_by_name("CH1_SV_NORMAL").unwrap();
        scope.enable_channel(sv).await.unwrap();
        scope.start_single_trigger().await.unwrap();
        assert!(scope.acquire_data().await.unwrap());
        let set = scope.pop_pending().unwrap();
        let Some(Waveform::Spectrum(spectrum)) = set.get(sv) else {
            panic!("no spectrum");
        };
        assert_eq!(spectrum.len(), 1000);
        assert_eq!(spectrum.timing.timescale, 500_000);
    }

    #[tokio::test]
    async fn test_lecroy_digital_lines() {
        let (scope, _) = connect(LeCroySim::new("WAVERUNNER8104-MS", "MSXX")).await;
        let d5 = scope.channel_by_name("D5").unwrap();
        scope.enable_channel(d5).await.unwrap();
        scope.start_single_trigger().await.unwrap();
        assert!(scope.acquire_data().await.unwrap());
        let set = scope.pop_pending().unwrap();
        let waveform = set.get(d5).and_then(Waveform::as_digital).unwrap();
        let total: i64 = waveform.iter().map(|(_, d, _)| d).sum();
        assert_eq!(total, 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_trigger_waits_for_delay() {
        let (scope, _) = connect(SiglentSim::new("SDS2104X Plus").with_auto_trigger(false)).await;
        scope.force_trigger().await.unwrap();
        assert!(scope.is_armed());
        assert_eq!(scope.poll_trigger().await.unwrap(), TriggerStatus::Run);

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(scope.acquire_data().await.unwrap());
        assert_eq!(analog_len(&scope.pop_pending().unwrap(), 0), 10_000);
    }

    #[tokio::test]
    async fn test_stop_clears_pending() {
        let (scope, handle) = connect(LeCroySim::new("WAVERUNNER9254M", "")).await;
        scope.start().await.unwrap();
        assert!(scope.acquire_data().await.unwrap());
        assert!(scope.acquire_data().await.unwrap());
        assert_eq!(scope.pending_count(), 2);

        scope.stop().await.unwrap();
        assert_eq!(scope.pending_count(), 0);
        assert!(!scope.is_armed());
        assert_eq!(scope.poll_trigger().await.unwrap(), TriggerStatus::Stop);
        assert!(handle.commands().iter().any(|c| c == "TRIG_MODE STOP"));
    }

    #[tokio::test]
    async fn test_legacy_siglent_capture() {
        let (scope, _) = connect(SiglentSim::new("SDS1202X-E")).await;
        scope.start_single_trigger().await.unwrap();
        assert!(scope.acquire_data().await.unwrap());
        let set = scope.pop_pending().unwrap();
        assert_eq!(analog_len(&set, 0), 14_000);
    }

    #[tokio::test]
    async fn test_edge_trigger_round_trip() {
        let (scope, _) = connect(LeCroySim::new("WAVERUNNER9254M", "")).await;
        scope
            .set_trigger(Trigger::edge(1, 0.125, EdgeSlope::Rising))
            .await
            .unwrap();
        scope.pipe.flush().await.unwrap();

        let pulled = scope.pull_trigger().await.unwrap();
        assert_eq!(pulled.kind(), crate::trigger::TriggerKind::Edge);
        assert_eq!(pulled.source(), 1);
        assert!((pulled.level() - 0.125).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_acquisition_loop_delivers() {
        let (scope, _) = connect(LeCroySim::new("WAVERUNNER9254M", "")).await;
        let scope = Arc::new(scope);
        scope.start().await.unwrap();
        let handle = scope.spawn_acquisition_loop(Duration::from_millis(1));
        while scope.pending_count() < 3 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        handle.stop().await;
        assert!(scope.pop_pending().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_download_discards_capture() {
        let settings = DriverSettings {
            rate_limit: Some(Duration::from_millis(10)),
            ..DriverSettings::default()
        };
        let (scope, handle) = connect_with(LeCroySim::new("WAVERUNNER9254M", ""), settings).await;
        let scope = Arc::new(scope);
        scope.enable_channel(1).await.unwrap();
        scope.start().await.unwrap();
        handle.clear_log();

        let task = tokio::spawn({
            let scope = Arc::clone(&scope);
            async move { scope.acquire_data().await }
        });
        tokio::time::sleep(Duration::from_millis(25)).await;
        scope.stop().await.unwrap();
        assert!(!task.await.unwrap().unwrap());

        assert!(!scope.is_armed());
        assert_eq!(scope.pending_count(), 0);
        let commands = handle.commands();
        assert_eq!(count(&commands, "TRIG_MODE STOP"), 1);
        assert_eq!(count(&commands, "TRIG_MODE SINGLE"), 0);
    }

    #[tokio::test]
    async fn test_truncated_block_is_retried() {
        let sim = Faulty::new(LeCroySim::new("WAVERUNNER9254M", "")).fail(
            "C1:WF? DAT1",
            Fault::Truncate,
            1,
        );
        let (scope, handle) = connect(sim).await;
        scope.start_single_trigger().await.unwrap();
        handle.clear_log();
        assert!(scope.acquire_data().await.unwrap());

        let commands = handle.commands();
        let data: Vec<usize> = commands
            .iter()
            .enumerate()
            .filter(|(_, c)| *c == "C1:WF? DAT1")
            .map(|(i, _)| i)
            .collect();
        assert_eq!(data.len(), 2);
        // realigned between the attempts
        assert_eq!(count(&commands[data[0]..data[1]], "*IDN?"), 4);
        assert_eq!(count(&commands[data[0]..data[1]], "*OPC?"), 3);
        assert_eq!(analog_len(&scope.pop_pending().unwrap(), 0), 1000);
    }

    #[tokio::test]
    async fn test_corrupt_descriptor_flushes_stray_replies() {
        let sim = Faulty::new(LeCroySim::new("WAVERUNNER9254M", "")).fail(
            "C1:WF? DESC",
            Fault::Corrupt,
            1,
        );
        let (scope, handle) = connect(sim).await;
        scope.start_single_trigger().await.unwrap();
        handle.clear_log();

        // three stray lines would defeat the correlation if left unread
        assert!(scope.acquire_data().await.unwrap());
        assert_eq!(count(&handle.commands(), "C1:WF? DESC"), 2);
        assert!(!scope.pipe.is_failed());
        assert_eq!(handle.pending_rx(), 0);
        assert_eq!(analog_len(&scope.pop_pending().unwrap(), 0), 1000);
    }

    #[tokio::test]
    async fn test_retries_exhausted_disarms() {
        let sim = Faulty::new(LeCroySim::new("WAVERUNNER9254M", "")).fail(
            "C1:WF? DESC",
            Fault::Corrupt,
            usize::MAX,
        );
        let (scope, handle) = connect(sim).await;
        scope.start().await.unwrap();
        handle.clear_log();

        let err = scope.acquire_data().await.unwrap_err();
        assert!(matches!(err, ScopeError::PreambleMalformed(_)));
        assert_eq!(count(&handle.commands(), "C1:WF? DESC"), 4);
        assert!(!scope.is_armed());
        assert_eq!(scope.pending_count(), 0);
        assert!(!scope.pipe.is_failed());
        assert_eq!(scope.poll_trigger().await.unwrap(), TriggerStatus::Stop);
    }

    #[tokio::test]
    async fn test_failed_resync_abandons_link() {
        let sim = Faulty::new(LeCroySim::new("WAVERUNNER9254M", ""))
            .fail("C1:WF? DESC", Fault::Corrupt, 1)
            .fail_after("C1:WF? DESC", "*IDN?", Fault::Silence, usize::MAX);
        let (scope, _) = connect(sim).await;
        scope.start().await.unwrap();

        let err = scope.acquire_data().await.unwrap_err();
        assert!(matches!(err, ScopeError::ResyncFailed(_)));
        assert!(err.is_fatal());
        assert!(!scope.is_armed());
        assert!(scope.pipe.is_failed());
        assert!(scope.start().await.is_err());
    }
}
