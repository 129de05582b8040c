//! LeCroy MSO digital capture (`Digital1:WF?`).
//!
//! The reply is an XML document whose `<BinaryData>` element carries the
//! samples in Base64: one byte per sample, one block of `NumSamples` bytes per
//! selected line, in line order. `<SelectedLines>` is a 16-character bitmask
//! whose character `i` enables line `Di`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use regex::Regex;
use scope_core::{ScopeError, ScopeResult};
use std::sync::OnceLock;

pub const LINE_COUNT: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct DigitalCapture {
    /// Seconds per sample.
    pub hor_per_step: f64,
    /// Seconds from trigger to the first sample.
    pub hor_start: f64,
    pub num_samples: usize,
    /// Nanoseconds since 2000-01-01 00:00 instrument-local time.
    pub first_event_time: i64,
    /// `(line, samples)` for every selected line.
    pub lines: Vec<(usize, Vec<bool>)>,
}

#[allow(clippy::expect_used)]
fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<(\w+)>([^<]*)</(\w+)>").expect("literal pattern"))
}

fn tag<'a>(xml: &'a str, name: &str) -> ScopeResult<&'a str> {
    tag_regex()
        .captures_iter(xml)
        .find(|c| &c[1] == name && &c[3] == name)
        .and_then(|c| c.get(2))
        .map(|m| m.as_str().trim())
        .ok_or_else(|| ScopeError::PreambleMalformed(format!("digital capture missing <{}>", name)))
}

fn number<T: std::str::FromStr>(xml: &str, name: &str) -> ScopeResult<T> {
    let text = tag(xml, name)?;
    text.parse()
        .map_err(|_| ScopeError::PreambleMalformed(format!("<{}> is not a number: {}", name, text)))
}

impl DigitalCapture {
    pub fn parse(xml: &str) -> ScopeResult<Self> {
        let mask = tag(xml, "SelectedLines")?;
        if mask.len() != LINE_COUNT {
            return Err(ScopeError::PreambleMalformed(format!(
                "SelectedLines '{}' is not {} characters",
                mask, LINE_COUNT
            )));
        }
        let selected: Vec<usize> = mask
            .chars()
            .enumerate()
            .filter(|(_, c)| *c == '1')
            .map(|(i, _)| i)
            .collect();

        let num_samples: usize = number(xml, "NumSamples")?;
        // FirstEventTime is an integer on current firmware, a float on older
        let first_event_time = match number::<i64>(xml, "FirstEventTime") {
            Ok(ns) => ns,
            Err(_) => number::<f64>(xml, "FirstEventTime")?.round() as i64,
        };
        let data: String = tag(xml, "BinaryData")?
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let bytes = STANDARD
            .decode(data.as_bytes())
            .map_err(|e| ScopeError::PreambleMalformed(format!("BinaryData: {}", e)))?;

        let expected = num_samples * selected.len();
        if bytes.len() < expected {
            return Err(ScopeError::LengthMismatch {
                expected,
                actual: bytes.len(),
            });
        }

        let lines = selected
            .iter()
            .zip(bytes.chunks(num_samples.max(1)))
            .map(|(&line, chunk)| (line, chunk.iter().map(|&b| b != 0).collect()))
            .collect();

        Ok(Self {
            hor_per_step: number(xml, "HorPerStep")?,
            hor_start: number(xml, "HorStart")?,
            num_samples,
            first_event_time,
            lines,
        })
    }

    /// Serialise; used by the simulated instruments.
    pub fn encode(&self) -> String {
        let mut mask = ['0'; LINE_COUNT];
        let mut data = Vec::with_capacity(self.num_samples * self.lines.len());
        for (line, samples) in &self.lines {
            if let Some(c) = mask.get_mut(*line) {
                *c = '1';
            }
            data.extend(samples.iter().map(|&s| u8::from(s)));
        }
        format!(
            "<?xml version=\"1.0\"?><LECROY_DIGITAL><SelectedLines>{}</SelectedLines>\
             <HorPerStep>{:e}</HorPerStep><HorStart>{:e}</HorStart>\
             <NumSamples>{}</NumSamples><FirstEventTime>{}</FirstEventTime>\
             <BinaryData>{}</BinaryData></LECROY_DIGITAL>",
            mask.iter().collect::<String>(),
            self.hor_per_step,
            self.hor_start,
            self.num_samples,
            self.first_event_time,
            STANDARD.encode(data)
        )
    }
}
