//! `*IDN?` reply parsing.

use scope_core::{ScopeError, ScopeResult};
use serde::Serialize;
use std::fmt;

/// `<vendor>,<model>,<serial>,<firmware>` as reported by the instrument.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Identity {
    pub vendor: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
}

impl Identity {
    pub fn parse(reply: &str) -> ScopeResult<Self> {
        let fields: Vec<&str> = reply.trim().splitn(4, ',').map(str::trim).collect();
        if fields.len() < 4 || fields[0].is_empty() || fields[1].is_empty() {
            return Err(ScopeError::parse(reply, "*IDN? reply"));
        }
        Ok(Self {
            vendor: fields[0].to_string(),
            model: fields[1].to_string(),
            serial: fields[2].to_string(),
            firmware: fields[3].to_string(),
        })
    }

    /// Leading numeric component of the firmware version, e.g. `9` for `9.6.0`.
    pub fn firmware_major(&self) -> Option<u32> {
        self.firmware
            .split(|c: char| !c.is_ascii_digit())
            .find(|s| !s.is_empty())
            .and_then(|s| s.parse().ok())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (serial {}, firmware {})",
            self.vendor, self.model, self.serial, self.firmware
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let id = Identity::parse("LECROY,WAVERUNNER9254M,LCRY4751N40408,9.6.0\n").unwrap();
        assert_eq!(id.vendor, "LECROY");
        assert_eq!(id.model, "WAVERUNNER9254M");
        assert_eq!(id.firmware_major(), Some(9));

        let tek = Identity::parse("TEKTRONIX,MSO64,C012345,CF:91.1CT FV:1.44.3.433").unwrap();
        assert_eq!(tek.firmware, "CF:91.1CT FV:1.44.3.433");
        assert_eq!(tek.firmware_major(), Some(91));
    }

    #[test]
    fn test_parse_rejects_short() {
        assert!(Identity::parse("garbage").is_err());
        assert!(Identity::parse(",,,").is_err());
    }
}
