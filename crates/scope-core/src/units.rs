//! Physical units attached to channels and parameters.
//!
//! A `Unit` is used for display and dimension checking only; it never appears on
//! the wire. Values are stored in the unit's base quantity (volts, amps, hertz,
//! ...) except for time, which is stored as integer-valued femtoseconds.

use crate::error::{ScopeError, ScopeResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Display / dimension unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    Volts,
    Amps,
    /// Time, stored in femtoseconds but entered and shown in seconds.
    Femtoseconds,
    Hertz,
    BitsPerSecond,
    Counts,
    /// Stored as a fraction, shown as percent.
    Percent,
    SampleDepth,
    /// Stored in microvolts, shown in volts.
    Microvolts,
}

/// SI prefixes accepted by [`Unit::parse`], largest first.
const SI_PREFIXES: &[(&str, f64)] = &[
    ("T", 1e12),
    ("G", 1e9),
    ("M", 1e6),
    ("k", 1e3),
    ("m", 1e-3),
    ("u", 1e-6),
    ("\u{b5}", 1e-6),
    ("\u{3bc}", 1e-6),
    ("n", 1e-9),
    ("p", 1e-12),
    ("f", 1e-15),
];

impl Unit {
    /// Suffix used when printing a value of this unit.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Volts | Self::Microvolts => "V",
            Self::Amps => "A",
            Self::Femtoseconds => "s",
            Self::Hertz => "Hz",
            Self::BitsPerSecond => "b/s",
            Self::Counts => "",
            Self::Percent => "%",
            Self::SampleDepth => "pts",
        }
    }

    /// Factor from the displayed quantity to the stored one.
    fn storage_scale(&self) -> f64 {
        match self {
            Self::Femtoseconds => 1e15,
            Self::Microvolts => 1e6,
            Self::Percent => 0.01,
            _ => 1.0,
        }
    }

    /// Parse a human string such as `"12.5 mV"`, `"1.25GHz"` or `"500k"`.
    ///
    /// The unit suffix is optional, an SI prefix is honoured if present, and the
    /// result is returned in storage units (so `"10ns"` parses to `1e7` for
    /// [`Unit::Femtoseconds`]).
    pub fn parse(&self, text: &str) -> ScopeResult<f64> {
        let mut body = text.trim();
        let suffix = self.suffix();
        if !suffix.is_empty() {
            if let Some(stripped) = body.strip_suffix(suffix) {
                body = stripped.trim_end();
            }
        }
        let mut scale = 1.0;
        for (prefix, factor) in SI_PREFIXES {
            if let Some(stripped) = body.strip_suffix(prefix) {
                let stripped = stripped.trim_end();
                if stripped.parse::<f64>().is_ok() {
                    body = stripped;
                    scale = *factor;
                    break;
                }
            }
        }
        let value: f64 = body
            .parse()
            .map_err(|_| ScopeError::parse(text, "number with optional SI prefix"))?;
        Ok(value * scale * self.storage_scale())
    }

    /// Format a stored value with an SI prefix, e.g. `1.25e-3` volts as `"1.250 mV"`.
    pub fn pretty_print(&self, value: f64) -> String {
        let display = value / self.storage_scale();
        match self {
            Self::Counts | Self::SampleDepth => {
                let (scaled, prefix) = pick_prefix(display, false);
                if prefix.is_empty() {
                    format!("{:.0} {}", scaled, self.suffix()).trim_end().to_string()
                } else {
                    format!("{:.3} {}{}", scaled, prefix, self.suffix())
                        .trim_end()
                        .to_string()
                }
            }
            Self::Percent => format!("{:.2} %", display),
            _ => {
                let (scaled, prefix) = pick_prefix(display, true);
                format!("{:.3} {}{}", scaled, prefix, self.suffix())
            }
        }
    }
}

fn pick_prefix(value: f64, allow_small: bool) -> (f64, &'static str) {
    let magnitude = value.abs();
    if magnitude == 0.0 || !magnitude.is_finite() {
        return (value, "");
    }
    for (prefix, factor) in SI_PREFIXES {
        if *prefix == "\u{b5}" || *prefix == "\u{3bc}" {
            continue;
        }
        if !allow_small && *factor < 1.0 {
            continue;
        }
        if magnitude >= *factor {
            return (value / factor, *prefix);
        }
    }
    (value, "")
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Volts => "V",
            Self::Amps => "A",
            Self::Femtoseconds => "fs",
            Self::Hertz => "Hz",
            Self::BitsPerSecond => "bps",
            Self::Counts => "counts",
            Self::Percent => "%",
            Self::SampleDepth => "pts",
            Self::Microvolts => "uV",
        };
        write!(f, "{}", label)
    }
}

impl FromStr for Unit {
    type Err = ScopeError;

    /// Parse the unit strings instruments report in their descriptors.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned = s.trim().trim_matches('"').trim();
        match cleaned {
            "V" | "v" | "Volts" | "VOLTS" => Ok(Self::Volts),
            "A" | "a" | "Amps" | "AMPS" => Ok(Self::Amps),
            "s" | "S" | "fs" => Ok(Self::Femtoseconds),
            "Hz" | "HZ" | "hz" => Ok(Self::Hertz),
            "bps" | "b/s" => Ok(Self::BitsPerSecond),
            "counts" | "" => Ok(Self::Counts),
            "%" => Ok(Self::Percent),
            "pts" => Ok(Self::SampleDepth),
            "uV" => Ok(Self::Microvolts),
            other => Err(ScopeError::parse(other, "unit")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_prefixes() {
        assert!((Unit::Volts.parse("12.5 mV").unwrap() - 0.0125).abs() < 1e-12);
        assert!((Unit::Hertz.parse("1.25GHz").unwrap() - 1.25e9).abs() < 1.0);
        assert!((Unit::Hertz.parse("500k").unwrap() - 5e5).abs() < 1e-6);
        assert!((Unit::Volts.parse("-3").unwrap() + 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_parse_time_is_femtoseconds() {
        assert!((Unit::Femtoseconds.parse("10ns").unwrap() - 1e7).abs() < 1e-3);
        assert!((Unit::Femtoseconds.parse("1e-9").unwrap() - 1e6).abs() < 1e-3);
    }

    #[test]
    fn test_parse_exponent_not_prefix() {
        // trailing "m" would otherwise be taken for milli
        assert!(Unit::Volts.parse("1e-3m").is_ok());
        assert!((Unit::Counts.parse("2e3").unwrap() - 2000.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Unit::Volts.parse("abc").is_err());
    }

    #[test]
    fn test_pretty_print() {
        assert_eq!(Unit::Volts.pretty_print(0.00125), "1.250 mV");
        assert_eq!(Unit::Hertz.pretty_print(2.5e9), "2.500 GHz");
        assert_eq!(Unit::Femtoseconds.pretty_print(1e6), "1.000 ns");
        assert_eq!(Unit::Percent.pretty_print(0.5), "50.00 %");
    }

    #[test]
    fn test_from_str() {
        assert_eq!("\"V\"".parse::<Unit>().unwrap(), Unit::Volts);
        assert_eq!("A".parse::<Unit>().unwrap(), Unit::Amps);
        assert_eq!("Hz".parse::<Unit>().unwrap(), Unit::Hertz);
        assert!("furlongs".parse::<Unit>().is_err());
    }
}
