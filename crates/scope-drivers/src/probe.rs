//! Probes, couplings and bandwidth limits.
//!
//! Probe kind is detected per analog channel on connect and on every cache
//! flush. It decides which couplings, attenuations and bandwidth limits are
//! legal, and whether the channel is usable for analog capture at all.

use crate::family::{Family, Vendor};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ProbeKind {
    #[default]
    None,
    Passive1M,
    Passive250K,
    ActiveDifferential,
    Current,
    /// 8-lane logic probe; the host analog channel becomes unusable.
    Digital8Bit,
}

impl ProbeKind {
    /// Hardware owns coupling and attenuation for these.
    pub fn is_active(&self) -> bool {
        matches!(self, ProbeKind::ActiveDifferential | ProbeKind::Current)
    }

    pub fn is_digital(&self) -> bool {
        matches!(self, ProbeKind::Digital8Bit)
    }

    /// Classify from a vendor probe type and model string.
    ///
    /// Unknown models fall back to passive 1 MΩ; the caller logs the warning.
    pub fn classify(vendor: Vendor, probe_type: &str, probe_id: &str) -> (Self, bool) {
        let ty = probe_type.trim().trim_matches('"').to_ascii_uppercase();
        let id = probe_id.trim().trim_matches('"').to_ascii_uppercase();
        if ty == "DIGITAL" || id.starts_with("TLP0") || id.starts_with("MSO-DIG") {
            return (ProbeKind::Digital8Bit, true);
        }
        if id.is_empty() || id == "NONE" || id == "NO PROBE DETECTED" || id == "1X" {
            return (ProbeKind::None, true);
        }
        let known = match vendor {
            Vendor::LeCroy => {
                if id.starts_with("PP") || id.starts_with("PK") {
                    Some(if id.contains("250K") {
                        ProbeKind::Passive250K
                    } else {
                        ProbeKind::Passive1M
                    })
                } else if id.starts_with("AP") || id.starts_with("D") || id.starts_with("ZD") {
                    Some(ProbeKind::ActiveDifferential)
                } else if id.starts_with("CP") {
                    Some(ProbeKind::Current)
                } else {
                    None
                }
            }
            Vendor::Tektronix => {
                if id.starts_with("TPP") || id.starts_with("P6") {
                    Some(ProbeKind::Passive1M)
                } else if id.starts_with("TDP") || id.starts_with("TAP") || id.starts_with("TIVP") {
                    Some(ProbeKind::ActiveDifferential)
                } else if id.starts_with("TCP") || id.starts_with("TRCP") {
                    Some(ProbeKind::Current)
                } else {
                    None
                }
            }
            Vendor::Siglent | Vendor::Unknown => Some(ProbeKind::Passive1M),
        };
        match known {
            Some(kind) => (kind, true),
            None => (ProbeKind::Passive1M, false),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Coupling {
    Dc1M,
    Ac1M,
    Dc50,
    Ac50,
    Gnd,
    /// Math/reference sources with no physical input.
    Synthetic,
}

impl Coupling {
    pub fn is_one_meg(&self) -> bool {
        matches!(self, Coupling::Dc1M | Coupling::Ac1M)
    }
}

impl fmt::Display for Coupling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Coupling::Dc1M => "DC 1M",
            Coupling::Ac1M => "AC 1M",
            Coupling::Dc50 => "DC 50",
            Coupling::Ac50 => "AC 50",
            Coupling::Gnd => "GND",
            Coupling::Synthetic => "synthetic",
        };
        write!(f, "{}", s)
    }
}

/// Couplings a channel accepts given its probe.
pub fn available_couplings(family: Family, probe: ProbeKind) -> Vec<Coupling> {
    use Coupling::*;
    match probe {
        ProbeKind::Digital8Bit => return Vec::new(),
        ProbeKind::ActiveDifferential => return vec![Dc50],
        ProbeKind::Current => return vec![Dc1M],
        _ => {}
    }
    match family {
        Family::LeCroyMaui | Family::LeCroyMauiFastWavePort => vec![Dc1M, Ac1M, Dc50, Gnd],
        Family::TekMso5 | Family::TekMso6 => vec![Dc1M, Ac1M, Dc50],
        Family::Sds5000X | Family::Sds6000A => vec![Dc1M, Ac1M, Dc50, Ac50, Gnd],
        Family::Sds1000
        | Family::Sds2000Xe
        | Family::Sds2000Xp
        | Family::Sds2000XHd
        | Family::Sds800XHd => vec![Dc1M, Ac1M, Gnd],
        Family::Unknown => vec![Dc1M],
    }
}

/// Legal bandwidth limits in MHz; `0` means no limit.
pub fn bandwidth_limits(family: Family, probe: ProbeKind, coupling: Option<Coupling>) -> Vec<u32> {
    let mut limits: Vec<u32> = match family {
        Family::LeCroyMaui | Family::LeCroyMauiFastWavePort => vec![20, 200, 1000, 2000],
        Family::TekMso5 => vec![20, 250, 500],
        Family::TekMso6 => vec![20, 200, 250, 350, 500, 1000],
        Family::Sds2000Xp | Family::Sds2000XHd | Family::Sds5000X | Family::Sds6000A => {
            vec![20, 200]
        }
        Family::Sds1000 | Family::Sds2000Xe | Family::Sds800XHd => vec![20],
        Family::Unknown => Vec::new(),
    };
    // 1 MΩ front ends top out before the 50 Ω path
    let one_meg_ceiling = match family.vendor() {
        Vendor::LeCroy => Some(1000),
        Vendor::Tektronix => Some(500),
        _ => None,
    };
    if let (Some(ceiling), Some(c)) = (one_meg_ceiling, coupling) {
        if c.is_one_meg() && !probe.is_active() {
            limits.retain(|&bw| bw <= ceiling);
        }
    }
    limits.push(0);
    limits
}

/// Default full analog bandwidth in MHz when the model number does not encode it.
pub fn default_max_bandwidth(family: Family) -> u32 {
    match family {
        Family::LeCroyMaui | Family::LeCroyMauiFastWavePort => 4000,
        Family::TekMso5 => 1000,
        Family::TekMso6 => 1000,
        Family::Sds6000A => 2000,
        Family::Sds5000X => 1000,
        Family::Sds2000Xp | Family::Sds2000XHd => 350,
        Family::Sds2000Xe => 300,
        Family::Sds800XHd => 200,
        Family::Sds1000 => 100,
        Family::Unknown => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(
            ProbeKind::classify(Vendor::Tektronix, "DIGITAL", "TLP058"),
            (ProbeKind::Digital8Bit, true)
        );
        assert_eq!(
            ProbeKind::classify(Vendor::Tektronix, "ANALOG", "TPP1000"),
            (ProbeKind::Passive1M, true)
        );
        assert_eq!(
            ProbeKind::classify(Vendor::LeCroy, "", "PP026-250K"),
            (ProbeKind::Passive250K, true)
        );
        assert_eq!(
            ProbeKind::classify(Vendor::LeCroy, "", "CP031"),
            (ProbeKind::Current, true)
        );
        assert_eq!(
            ProbeKind::classify(Vendor::Tektronix, "ANALOG", "No Probe Detected"),
            (ProbeKind::None, true)
        );
        // unknown model: passive fallback, flagged for a warning
        assert_eq!(
            ProbeKind::classify(Vendor::Tektronix, "ANALOG", "XYZ123"),
            (ProbeKind::Passive1M, false)
        );
    }

    #[test]
    fn test_couplings_by_probe() {
        assert!(available_couplings(Family::TekMso6, ProbeKind::Digital8Bit).is_empty());
        assert_eq!(
            available_couplings(Family::TekMso6, ProbeKind::None),
            vec![Coupling::Dc1M, Coupling::Ac1M, Coupling::Dc50]
        );
        assert!(available_couplings(Family::LeCroyMaui, ProbeKind::Passive1M)
            .contains(&Coupling::Gnd));
        assert!(!available_couplings(Family::Sds2000Xp, ProbeKind::None).contains(&Coupling::Dc50));
    }

    #[test]
    fn test_bandwidth_limits_one_meg() {
        let fifty = bandwidth_limits(Family::TekMso6, ProbeKind::None, Some(Coupling::Dc50));
        assert!(fifty.contains(&1000));
        let one_meg = bandwidth_limits(Family::TekMso6, ProbeKind::None, Some(Coupling::Dc1M));
        assert!(!one_meg.contains(&1000));
        assert_eq!(one_meg.last(), Some(&0));
    }
}
