//! Tektronix `WFMOutpre?` preamble.
//!
//! Semicolon-separated, headers off. The full reply has 22 fields; some
//! firmware drops the `WFID` string and sends 21. Both are accepted.

use scope_core::{ScopeError, ScopeResult, Unit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Binary,
    Ascii,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFormat {
    /// Signed integer.
    Ri,
    /// Unsigned integer.
    Rp,
    /// IEEE float.
    Fp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Time,
    Frequency,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WfmPreamble {
    pub bytes_per_sample: usize,
    pub bits_per_sample: u32,
    pub encoding: Encoding,
    pub binary_format: BinaryFormat,
    pub big_endian: bool,
    pub wfid: Option<String>,
    pub point_count: usize,
    pub point_format: String,
    pub x_unit: String,
    /// Seconds (or Hz) per point.
    pub x_increment: f64,
    pub x_zero: f64,
    pub point_offset: f64,
    pub y_unit: String,
    pub y_mult: f64,
    pub y_offset: f64,
    pub y_zero: f64,
    pub domain: Domain,
    pub waveform_type: String,
    pub center_frequency: f64,
    pub span: f64,
}

/// Split on `;` outside double quotes.
fn split_fields(reply: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in reply.trim().chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ';' if !quoted => out.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    out.push(current);
    out.into_iter().map(|f| f.trim().to_string()).collect()
}

fn unquote(s: &str) -> String {
    s.trim_matches('"').to_string()
}

fn num<T: std::str::FromStr>(field: &str, name: &str) -> ScopeResult<T> {
    field
        .parse()
        .map_err(|_| ScopeError::PreambleMalformed(format!("{} '{}'", name, field)))
}

impl WfmPreamble {
    pub fn parse(reply: &str) -> ScopeResult<Self> {
        let mut fields = split_fields(reply);
        let wfid = match fields.len() {
            22 => Some(unquote(&fields.remove(5))),
            21 => None,
            n => {
                return Err(ScopeError::PreambleMalformed(format!(
                    "WFMOutpre has {} fields, expected 21 or 22",
                    n
                )))
            }
        };
        // fields now: 0 BYT_NR, 1 BIT_NR, 2 ENCDG, 3 BN_FMT, 4 BYT_OR, 5 NR_PT,
        // 6 PT_FMT, 7 PT_ORDER, 8 XUNIT, 9 XINCR, 10 XZERO, 11 PT_OFF, 12 YUNIT,
        // 13 YMULT, 14 YOFF, 15 YZERO, 16 DOMAIN, 17 WFMTYPE, 18 CENTERFREQ,
        // 19 SPAN, 20 REFLEVEL
        let f = &fields;
        let encoding = match f[2].to_ascii_uppercase().as_str() {
            "BIN" | "BINARY" => Encoding::Binary,
            "ASC" | "ASCII" => Encoding::Ascii,
            other => {
                return Err(ScopeError::PreambleMalformed(format!("encoding '{}'", other)))
            }
        };
        let binary_format = match f[3].to_ascii_uppercase().as_str() {
            "RI" => BinaryFormat::Ri,
            "RP" => BinaryFormat::Rp,
            "FP" => BinaryFormat::Fp,
            other => {
                return Err(ScopeError::PreambleMalformed(format!(
                    "binary format '{}'",
                    other
                )))
            }
        };
        let domain = if f[16].to_ascii_uppercase().starts_with("FREQ") {
            Domain::Frequency
        } else {
            Domain::Time
        };

        let pre = Self {
            bytes_per_sample: num(&f[0], "BYT_NR")?,
            bits_per_sample: num(&f[1], "BIT_NR")?,
            encoding,
            binary_format,
            big_endian: f[4].eq_ignore_ascii_case("MSB"),
            wfid,
            point_count: num(&f[5], "NR_PT")?,
            point_format: f[6].clone(),
            x_unit: unquote(&f[8]),
            x_increment: num(&f[9], "XINCR")?,
            x_zero: num(&f[10], "XZERO")?,
            point_offset: num(&f[11], "PT_OFF")?,
            y_unit: unquote(&f[12]),
            y_mult: num(&f[13], "YMULT")?,
            y_offset: num(&f[14], "YOFF")?,
            y_zero: num(&f[15], "YZERO")?,
            domain,
            waveform_type: f[17].clone(),
            center_frequency: num(&f[18], "CENTERFREQUENCY")?,
            span: num(&f[19], "SPAN")?,
        };
        if !matches!(pre.bytes_per_sample, 1 | 2 | 4 | 8) {
            return Err(ScopeError::PreambleMalformed(format!(
                "BYT_NR {}",
                pre.bytes_per_sample
            )));
        }
        if !(pre.x_increment.is_finite() && pre.x_increment > 0.0) {
            return Err(ScopeError::PreambleMalformed(format!(
                "XINCR {}",
                pre.x_increment
            )));
        }
        Ok(pre)
    }

    /// Gain and offset for `value = gain * code - offset`.
    pub fn calibration(&self) -> (f64, f64) {
        // value = (code - YOFF) * YMULT + YZERO
        (self.y_mult, self.y_offset * self.y_mult - self.y_zero)
    }

    /// Promoted y-unit, if the preamble names one the runtime tracks.
    pub fn y_unit(&self) -> Option<Unit> {
        promote_unit(&self.y_unit)
    }

    /// Serialise (with `WFID` unless `drop_wfid`); used by the simulated instruments.
    pub fn encode(&self, drop_wfid: bool) -> String {
        let mut fields = vec![
            self.bytes_per_sample.to_string(),
            self.bits_per_sample.to_string(),
            match self.encoding {
                Encoding::Binary => "BINARY".into(),
                Encoding::Ascii => "ASCII".into(),
            },
            match self.binary_format {
                BinaryFormat::Ri => "RI".into(),
                BinaryFormat::Rp => "RP".into(),
                BinaryFormat::Fp => "FP".into(),
            },
            if self.big_endian { "MSB" } else { "LSB" }.to_string(),
        ];
        if !drop_wfid {
            fields.push(format!("\"{}\"", self.wfid.clone().unwrap_or_default()));
        }
        fields.extend([
            self.point_count.to_string(),
            self.point_format.clone(),
            "LINEAR".to_string(),
            format!("\"{}\"", self.x_unit),
            format!("{:e}", self.x_increment),
            format!("{:e}", self.x_zero),
            format!("{}", self.point_offset),
            format!("\"{}\"", self.y_unit),
            format!("{:e}", self.y_mult),
            format!("{:e}", self.y_offset),
            format!("{:e}", self.y_zero),
            match self.domain {
                Domain::Time => "TIME".into(),
                Domain::Frequency => "FREQUENCY".into(),
            },
            self.waveform_type.clone(),
            format!("{:e}", self.center_frequency),
            format!("{:e}", self.span),
            "0".to_string(),
        ]);
        fields.join(";")
    }
}

/// `"V"` stays volts, `"A"` promotes to amps; anything else leaves the
/// channel's unit unchanged.
pub fn promote_unit(unit: &str) -> Option<Unit> {
    match unit.trim().trim_matches('"') {
        "V" => Some(Unit::Volts),
        "A" => Some(Unit::Amps),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = "2;16;BINARY;RI;MSB;\"Ch1, DC coupling, 100.0mV/div, 4.000us/div, 10000 points, Sample mode\";\
        10000;Y;LINEAR;\"s\";4.0E-9;-2.0E-5;0;\"V\";1.5625E-5;0.0E+0;0.0E+0;TIME;ANALOG;0.0E+0;0.0E+0;0.0E+0";

    #[test]
    fn test_parse_22_fields() {
        let pre = WfmPreamble::parse(FULL).unwrap();
        assert_eq!(pre.bytes_per_sample, 2);
        assert_eq!(pre.bits_per_sample, 16);
        assert!(pre.big_endian);
        assert_eq!(pre.point_count, 10000);
        assert_eq!(pre.x_increment, 4.0e-9);
        assert_eq!(pre.x_zero, -2.0e-5);
        assert_eq!(pre.y_unit(), Some(Unit::Volts));
        assert_eq!(pre.domain, Domain::Time);
        assert!(pre.wfid.unwrap().starts_with("Ch1"));
    }

    #[test]
    fn test_parse_21_fields() {
        let short = FULL.replacen(
            "\"Ch1, DC coupling, 100.0mV/div, 4.000us/div, 10000 points, Sample mode\";",
            "",
            1,
        );
        let pre = WfmPreamble::parse(&short).unwrap();
        assert_eq!(pre.wfid, None);
        assert_eq!(pre.point_count, 10000);
        assert_eq!(pre.y_mult, 1.5625e-5);
    }

    #[test]
    fn test_field_count_rejected() {
        assert!(matches!(
            WfmPreamble::parse("1;8;BINARY"),
            Err(ScopeError::PreambleMalformed(_))
        ));
    }

    #[test]
    fn test_calibration() {
        let mut pre = WfmPreamble::parse(FULL).unwrap();
        pre.y_offset = 10.0;
        pre.y_zero = 0.5;
        let (gain, offset) = pre.calibration();
        // code 110: (110 - 10) * ymult + 0.5
        let value = gain * 110.0 - offset;
        assert!((value - (100.0 * 1.5625e-5 + 0.5)).abs() < 1e-12);
    }

    #[test]
    fn test_encode_parse() {
        let pre = WfmPreamble::parse(FULL).unwrap();
        let again = WfmPreamble::parse(&pre.encode(false)).unwrap();
        assert_eq!(again, pre);
        assert_eq!(WfmPreamble::parse(&pre.encode(true)).unwrap().wfid, None);
    }

    #[test]
    fn test_unit_promotion() {
        assert_eq!(promote_unit("\"A\""), Some(Unit::Amps));
        assert_eq!(promote_unit("V"), Some(Unit::Volts));
        assert_eq!(promote_unit("dBm"), None);
    }
}
