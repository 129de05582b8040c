//! Instrument family detection.
//!
//! Every code path that differs between instruments switches on [`Family`].
//! The family is resolved once, from the `*IDN?` vendor and model strings, via
//! an ordered prefix table; anything unrecognised becomes [`Family::Unknown`]
//! and gets a minimal safe feature set.

use scope_scpi::Identity;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vendor {
    LeCroy,
    Tektronix,
    Siglent,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Family {
    LeCroyMaui,
    /// MAUI instrument with the XDEV option; same SCPI tree, 16-bit transfers.
    LeCroyMauiFastWavePort,
    TekMso5,
    TekMso6,
    /// Legacy SDS1000 series (LeCroy-style command set, 8-bit only).
    Sds1000,
    Sds2000Xe,
    Sds2000Xp,
    Sds2000XHd,
    Sds800XHd,
    Sds5000X,
    Sds6000A,
    Unknown,
}

/// `(vendor prefix, model prefix, model must also contain, family)`, first match wins.
const FAMILY_TABLE: &[(&str, &str, Option<&str>, Family)] = &[
    ("LECROY", "", None, Family::LeCroyMaui),
    ("TELEDYNE LECROY", "", None, Family::LeCroyMaui),
    ("TEKTRONIX", "MSO5", None, Family::TekMso5),
    ("TEKTRONIX", "MSO6", None, Family::TekMso6),
    ("TEKTRONIX", "LPD6", None, Family::TekMso6),
    ("SIGLENT", "SDS8", Some("HD"), Family::Sds800XHd),
    ("SIGLENT", "SDS2", Some("HD"), Family::Sds2000XHd),
    ("SIGLENT", "SDS2", Some("PLUS"), Family::Sds2000Xp),
    ("SIGLENT", "SDS2", Some("X+"), Family::Sds2000Xp),
    ("SIGLENT", "SDS2", Some("X-E"), Family::Sds2000Xe),
    ("SIGLENT", "SDS2", Some("X E"), Family::Sds2000Xe),
    ("SIGLENT", "SDS5", None, Family::Sds5000X),
    ("SIGLENT", "SDS6", None, Family::Sds6000A),
    ("SIGLENT", "SDS1", None, Family::Sds1000),
];

impl Family {
    /// Resolve from an identity. The FastWavePort variant is chosen later,
    /// once options are known (see [`Family::with_options`]).
    pub fn detect(identity: &Identity) -> Self {
        let vendor = identity.vendor.to_ascii_uppercase();
        let model = identity.model.to_ascii_uppercase();
        FAMILY_TABLE
            .iter()
            .find(|(v, m, extra, _)| {
                vendor.starts_with(v)
                    && model.starts_with(m)
                    && extra.map_or(true, |e| model.contains(e))
            })
            .map(|(_, _, _, family)| *family)
            .unwrap_or(Family::Unknown)
    }

    /// Upgrade to the FastWavePort family when XDEV is installed.
    pub fn with_options(self, xdev: bool) -> Self {
        match self {
            Family::LeCroyMaui if xdev => Family::LeCroyMauiFastWavePort,
            other => other,
        }
    }

    pub fn vendor(&self) -> Vendor {
        match self {
            Family::LeCroyMaui | Family::LeCroyMauiFastWavePort => Vendor::LeCroy,
            Family::TekMso5 | Family::TekMso6 => Vendor::Tektronix,
            Family::Sds1000
            | Family::Sds2000Xe
            | Family::Sds2000Xp
            | Family::Sds2000XHd
            | Family::Sds800XHd
            | Family::Sds5000X
            | Family::Sds6000A => Vendor::Siglent,
            Family::Unknown => Vendor::Unknown,
        }
    }

    /// Siglent models that speak the LeCroy-style short command set.
    pub fn is_legacy_siglent(&self) -> bool {
        matches!(self, Family::Sds1000 | Family::Sds2000Xe)
    }

    /// Codes per division depend on V/div (SDS1000 quirk).
    pub fn has_variable_codes_per_div(&self) -> bool {
        matches!(self, Family::Sds1000)
    }

    /// Transfers 16-bit words by default.
    pub fn prefers_word_transfer(&self) -> bool {
        matches!(
            self,
            Family::LeCroyMauiFastWavePort
                | Family::TekMso5
                | Family::TekMso6
                | Family::Sds2000XHd
                | Family::Sds800XHd
        )
    }

    /// Has an 8/10-bit ADC resolution switch.
    pub fn supports_resolution_switch(&self) -> bool {
        matches!(self, Family::Sds6000A)
    }

    /// The built-in generator and voltmeter have a command set here. Other
    /// families may report the options but are driven as plain scopes.
    pub fn controls_secondary_instruments(&self) -> bool {
        matches!(self.vendor(), Vendor::LeCroy | Vendor::Tektronix)
    }

    pub fn supports_spectrum(&self) -> bool {
        matches!(self, Family::TekMso5 | Family::TekMso6)
    }

    /// Digital probes attach to analog inputs as 8 sub-lanes.
    pub fn has_digital_probes(&self) -> bool {
        matches!(self, Family::TekMso5 | Family::TekMso6)
    }

    /// Waveform gain/offset must be post-scaled by the descriptor's probe factor.
    pub fn scales_by_probe_factor(&self) -> bool {
        matches!(
            self,
            Family::Sds2000Xp
                | Family::Sds2000XHd
                | Family::Sds800XHd
                | Family::Sds5000X
                | Family::Sds6000A
        )
    }

    /// How long a forced trigger takes before a poll may report it.
    pub fn force_delay(&self) -> Duration {
        match self.vendor() {
            Vendor::Siglent => Duration::from_secs(1),
            _ => Duration::ZERO,
        }
    }

    /// Minimum spacing between writes; some parsers drop commands above 20 Hz.
    pub fn write_interval(&self) -> Option<Duration> {
        match self {
            Family::Sds1000 | Family::Sds2000Xe => Some(Duration::from_millis(50)),
            _ => None,
        }
    }

    /// Substring present in every `*IDN?` reply, used for resync.
    pub fn idn_magic(&self) -> &'static str {
        match self.vendor() {
            Vendor::LeCroy => "LECROY",
            Vendor::Tektronix => "TEKTRONIX",
            Vendor::Siglent => "Siglent",
            Vendor::Unknown => ",",
        }
    }

    /// Vertical divisions on screen.
    pub fn vertical_divisions(&self) -> f64 {
        match self.vendor() {
            Vendor::Tektronix => 10.0,
            _ => 8.0,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Family::LeCroyMaui => "LeCroy MAUI",
            Family::LeCroyMauiFastWavePort => "LeCroy MAUI (FastWavePort)",
            Family::TekMso5 => "Tektronix MSO5",
            Family::TekMso6 => "Tektronix MSO6",
            Family::Sds1000 => "Siglent SDS1000",
            Family::Sds2000Xe => "Siglent SDS2000X-E",
            Family::Sds2000Xp => "Siglent SDS2000X+",
            Family::Sds2000XHd => "Siglent SDS2000X HD",
            Family::Sds800XHd => "Siglent SDS800X HD",
            Family::Sds5000X => "Siglent SDS5000X",
            Family::Sds6000A => "Siglent SDS6000A",
            Family::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// First run of ASCII digits in the model string.
fn first_digit_run(model: &str) -> Option<&str> {
    let start = model.find(|c: char| c.is_ascii_digit())?;
    let rest = &model[start..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Analog channel count encoded in the model number: the last digit of the
/// first digit run (`WAVERUNNER9254M` → 4, `MSO58` → 8, `SDS1202X-E` → 2).
///
/// Returns `None` when the model carries no usable count (e.g. LabMaster),
/// in which case the driver probes for channels.
pub fn channel_count_from_model(model: &str) -> Option<usize> {
    let digits = first_digit_run(model)?;
    let last = digits.chars().last()?.to_digit(10)? as usize;
    (1..=8).contains(&last).then_some(last)
}

/// Analog bandwidth in MHz implied by the model number, if the naming scheme
/// encodes it.
pub fn bandwidth_from_model(family: Family, model: &str) -> Option<u32> {
    let digits = first_digit_run(model)?;
    let value = |range: std::ops::Range<usize>| -> Option<u32> { digits.get(range)?.parse().ok() };
    match family.vendor() {
        // WaveRunner 9254 → 2.5 GHz
        Vendor::LeCroy => value(1..3).map(|v| v * 100),
        // SDS2104X Plus → 100 MHz, SDS2354X HD → 350 MHz
        Vendor::Siglent if digits.len() == 4 => value(1..3).map(|v| v * 10),
        // SDS804X HD → 70 MHz class
        Vendor::Siglent => value(1..2).map(|v| if v == 0 { 70 } else { v * 100 }),
        Vendor::Tektronix | Vendor::Unknown => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(vendor: &str, model: &str) -> Identity {
        Identity {
            vendor: vendor.into(),
            model: model.into(),
            serial: "SN".into(),
            firmware: "1.0".into(),
        }
    }

    #[test]
    fn test_detect() {
        assert_eq!(Family::detect(&id("LECROY", "WAVERUNNER9254M")), Family::LeCroyMaui);
        assert_eq!(Family::detect(&id("TEKTRONIX", "MSO64")), Family::TekMso6);
        assert_eq!(Family::detect(&id("TEKTRONIX", "MSO58")), Family::TekMso5);
        assert_eq!(
            Family::detect(&id("Siglent Technologies", "SDS2104X Plus")),
            Family::Sds2000Xp
        );
        assert_eq!(
            Family::detect(&id("Siglent Technologies", "SDS2354X HD")),
            Family::Sds2000XHd
        );
        assert_eq!(
            Family::detect(&id("Siglent Technologies", "SDS804X HD")),
            Family::Sds800XHd
        );
        assert_eq!(
            Family::detect(&id("Siglent Technologies", "SDS1202X-E")),
            Family::Sds1000
        );
        assert_eq!(
            Family::detect(&id("Siglent Technologies", "SDS6204A")),
            Family::Sds6000A
        );
        assert_eq!(Family::detect(&id("KEYSIGHT", "DSOX1204G")), Family::Unknown);
    }

    #[test]
    fn test_fastwaveport_upgrade() {
        assert_eq!(
            Family::LeCroyMaui.with_options(true),
            Family::LeCroyMauiFastWavePort
        );
        assert_eq!(Family::TekMso6.with_options(true), Family::TekMso6);
    }

    #[test]
    fn test_channel_count() {
        assert_eq!(channel_count_from_model("WAVERUNNER9254M"), Some(4));
        assert_eq!(channel_count_from_model("MSO58"), Some(8));
        assert_eq!(channel_count_from_model("SDS1202X-E"), Some(2));
        assert_eq!(channel_count_from_model("LABMASTER10ZI-A"), None);
        assert_eq!(channel_count_from_model("NOMODEL"), None);
    }

    #[test]
    fn test_bandwidth_from_model() {
        assert_eq!(
            bandwidth_from_model(Family::LeCroyMaui, "WAVERUNNER9254M"),
            Some(2500)
        );
        assert_eq!(
            bandwidth_from_model(Family::Sds2000Xp, "SDS2104X PLUS"),
            Some(100)
        );
        assert_eq!(bandwidth_from_model(Family::TekMso6, "MSO64"), None);
    }

    #[test]
    fn test_family_traits() {
        assert_eq!(Family::Sds2000Xp.force_delay(), Duration::from_secs(1));
        assert_eq!(Family::TekMso6.force_delay(), Duration::ZERO);
        assert!(Family::Sds1000.is_legacy_siglent());
        assert!(Family::TekMso5.has_digital_probes());
        assert_eq!(Family::TekMso6.vertical_divisions(), 10.0);
    }
}
