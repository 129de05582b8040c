//! Bulk configuration snapshots.
//!
//! [`ScopeDriver::pull_config`] reads channel state, timebase and trigger into
//! an [`InstrumentConfig`]; [`ScopeDriver::push_config`] writes one back.
//! Channels are keyed by hardware name so a snapshot taken on one instrument
//! can be applied to another of the same family.

use crate::channel::ChannelKind;
use crate::driver::ScopeDriver;
use crate::probe::Coupling;
use crate::trigger::{Trigger, TriggerKind};
use scope_core::{ParameterValue, ScopeError, ScopeResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub hwname: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coupling: Option<Coupling>,
    /// Full-scale volts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attenuation: Option<f64>,
    /// MHz, `0` for full bandwidth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deskew_fs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inverted: Option<bool>,
    /// Digital lanes only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub kind: TriggerKind,
    /// Hardware name of the source channel.
    pub source: String,
    pub level: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_level: Option<f64>,
    #[serde(default)]
    pub params: BTreeMap<String, ParameterValue>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InstrumentConfig {
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_depth: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_offset_fs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segments: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerConfig>,
}

impl InstrumentConfig {
    pub fn channel(&self, hwname: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.hwname == hwname)
    }
}

/// `Ok(None)` for settings the instrument does not have.
fn optional<T>(result: ScopeResult<T>) -> ScopeResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(ScopeError::Unsupported(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

impl ScopeDriver {
    /// Snapshot the current configuration.
    pub async fn pull_config(&self) -> ScopeResult<InstrumentConfig> {
        let mut config = InstrumentConfig::default();
        for channel in self.channels() {
            let i = channel.index;
            let mut entry = ChannelConfig {
                hwname: channel.hwname.clone(),
                ..ChannelConfig::default()
            };
            match channel.kind {
                ChannelKind::Analog => {
                    if !self.is_channel_usable(i).await? {
                        continue;
                    }
                    entry.enabled = self.is_channel_enabled(i).await?;
                    entry.coupling = Some(self.coupling(i).await?);
                    entry.range = Some(self.voltage_range(i).await?);
                    entry.offset = Some(self.offset(i).await?);
                    entry.attenuation = Some(self.attenuation(i).await?);
                    entry.bandwidth_limit = Some(self.bandwidth_limit(i).await?);
                    entry.deskew_fs = optional(self.deskew(i).await)?;
                    entry.inverted = optional(self.is_inverted(i).await)?;
                }
                ChannelKind::Digital => {
                    if !self.is_channel_usable(i).await? {
                        continue;
                    }
                    entry.enabled = self.is_channel_enabled(i).await?;
                    entry.threshold = optional(self.digital_threshold(i).await)?;
                }
                ChannelKind::Spectrum => {
                    if !self.is_channel_usable(i).await? {
                        continue;
                    }
                    entry.enabled = self.is_channel_enabled(i).await?;
                }
                _ => continue,
            }
            config.channels.push(entry);
        }

        config.sample_rate = Some(self.sample_rate().await?);
        config.sample_depth = Some(self.sample_depth().await?);
        config.trigger_offset_fs = Some(self.trigger_offset().await?);
        config.segments = Some(self.segment_count().await?);

        let channels = self.channels();
        config.trigger = optional(self.trigger().await)?.map(|t| TriggerConfig {
            kind: t.kind(),
            source: channels
                .get(t.source())
                .map(|c| c.hwname.clone())
                .unwrap_or_default(),
            level: t.level(),
            lower_level: t.lower_level(),
            params: t
                .params()
                .iter()
                .map(|(name, p)| (name.to_string(), p.value().clone()))
                .collect(),
        });
        tracing::debug!(channels = config.channels.len(), "Configuration pulled");
        Ok(config)
    }

    fn resolve(&self, hwname: &str) -> ScopeResult<usize> {
        self.channel_by_name(hwname)
            .ok_or_else(|| ScopeError::InvalidParameter(format!("no channel named {}", hwname)))
    }

    /// Apply a snapshot. Absent fields are left alone.
    pub async fn push_config(&self, config: &InstrumentConfig) -> ScopeResult<()> {
        for entry in &config.channels {
            let i = self.resolve(&entry.hwname)?;
            self.set_channel_enabled(i, entry.enabled).await?;
            if let Some(coupling) = entry.coupling {
                self.set_coupling(i, coupling).await?;
            }
            if let Some(attenuation) = entry.attenuation {
                self.set_attenuation(i, attenuation).await?;
            }
            if let Some(range) = entry.range {
                self.set_voltage_range(i, range).await?;
            }
            if let Some(offset) = entry.offset {
                self.set_offset(i, offset).await?;
            }
            if let Some(mhz) = entry.bandwidth_limit {
                self.set_bandwidth_limit(i, mhz).await?;
            }
            if let Some(fs) = entry.deskew_fs {
                self.set_deskew(i, fs).await?;
            }
            if let Some(invert) = entry.inverted {
                self.set_inverted(i, invert).await?;
            }
            if let Some(volts) = entry.threshold {
                self.set_digital_threshold(i, volts).await?;
            }
        }

        // depth before rate: each invalidates the other in the cache
        if let Some(depth) = config.sample_depth {
            self.set_sample_depth(depth).await?;
        }
        if let Some(rate) = config.sample_rate {
            self.set_sample_rate(rate).await?;
        }
        if let Some(segments) = config.segments {
            if segments > 1 || self.segment_count().await? != segments {
                self.set_segment_count(segments).await?;
            }
        }
        if let Some(offset) = config.trigger_offset_fs {
            self.set_trigger_offset(offset).await?;
        }

        if let Some(tc) = &config.trigger {
            let mut trigger = Trigger::new(tc.kind, self.resolve(&tc.source)?)?;
            trigger.set_level(tc.level);
            if let Some(lower) = tc.lower_level {
                trigger.set_lower_level(lower);
            }
            for (name, value) in &tc.params {
                trigger.params_mut().set(name, value.clone())?;
            }
            self.set_trigger(trigger).await?;
        }

        self.pipe.flush().await?;
        tracing::info!(channels = config.channels.len(), "Configuration pushed");
        Ok(())
    }
}
