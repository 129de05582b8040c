//! Simulated instruments for mock mode and tests.
//!
//! Each simulator is a [`scope_scpi::Responder`]: it interprets the SCPI the
//! driver emits, keeps the settings it was sent, and answers queries from that
//! state. Waveform queries are answered with synthesised descriptors and
//! bodies derived from the stored timebase and vertical settings, so the full
//! acquisition path (descriptor parsing, block framing, segment splitting,
//! calibration) runs against realistic bytes.
//!
//! ```rust,ignore
//! let transport = MockTransport::new(LeCroySim::new("WAVERUNNER9254M", "MSXX"));
//! let driver = ScopeDriver::connect(Box::new(transport), DriverSettings::default()).await?;
//! ```
//!
//! Unknown settings read back as `0`, the way an instrument returns a default.

pub mod lecroy;
pub mod siglent;
pub mod tek;

use crate::wire::leading_number;
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::HashMap;

// =============================================================================
// Command parsing
// =============================================================================

/// One command split into header and argument.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Command {
    /// Uppercased, without the leading colon or the trailing `?`.
    pub head: String,
    pub arg: Option<String>,
    pub query: bool,
}

pub(crate) fn parse_command(command: &str) -> Command {
    let command = command.trim();
    let (head, arg) = match command.split_once(char::is_whitespace) {
        Some((h, a)) => (h, Some(a.trim().to_string())),
        None => (command, None),
    };
    let head = head.trim_start_matches(':').to_ascii_uppercase();
    let query = head.ends_with('?');
    Command {
        head: head.trim_end_matches('?').to_string(),
        arg: arg.filter(|a| !a.is_empty()),
        query,
    }
}

/// A MAUI automation command carried in `VBS '<statement>'`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Vbs {
    /// `return=<path>`
    Get(String),
    /// `<path> = <value>`
    Set(String, String),
    /// A bare method call such as `...AutoBaud`.
    Call(String),
}

/// Parse the statement of a `VBS`/`VBS?` command. Paths are lowercased; MAUI
/// property names are case-insensitive.
pub(crate) fn parse_vbs(command: &str) -> Option<Vbs> {
    let start = command.find('\'')?;
    let end = command.rfind('\'')?;
    if end <= start {
        return None;
    }
    let statement = command[start + 1..end].trim();
    if let Some(path) = statement.strip_prefix("return=") {
        return Some(Vbs::Get(path.trim().to_ascii_lowercase()));
    }
    match statement.split_once('=') {
        Some((path, value)) => Some(Vbs::Set(
            path.trim().to_ascii_lowercase(),
            value.trim().trim_matches('"').to_string(),
        )),
        None => Some(Vbs::Call(statement.to_ascii_lowercase())),
    }
}

// =============================================================================
// Settings store
// =============================================================================

/// Settings written by the driver, keyed by normalised header or VBS path.
#[derive(Debug, Default, Clone)]
pub(crate) struct Store {
    values: HashMap<String, String>,
}

impl Store {
    pub fn with_defaults(defaults: &[(&str, &str)]) -> Self {
        Self {
            values: defaults
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> String {
        self.values.get(key).cloned().unwrap_or_else(|| "0".to_string())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn f64(&self, key: &str) -> f64 {
        leading_number(&self.get(key)).unwrap_or(0.0)
    }

    /// Boolean setting in any of the spellings the instruments use.
    pub fn flag(&self, key: &str) -> bool {
        matches!(
            self.get(key).to_ascii_uppercase().as_str(),
            "ON" | "1" | "-1" | "TRUE"
        )
    }
}

// =============================================================================
// Acquisition model
// =============================================================================

/// Arm/trigger state shared by every simulator.
///
/// With `auto_trigger` set, an armed instrument fires on the first status
/// poll. Otherwise only a forced trigger fires it.
#[derive(Debug, Clone)]
pub(crate) struct ArmState {
    pub armed: bool,
    pub auto_trigger: bool,
    pub forced: bool,
    /// Completed acquisitions; the waveform queries describe the latest one.
    pub captures: u64,
}

impl Default for ArmState {
    fn default() -> Self {
        Self {
            armed: false,
            auto_trigger: true,
            forced: false,
            captures: 0,
        }
    }
}

impl ArmState {
    pub fn arm(&mut self) {
        self.armed = true;
    }

    pub fn stop(&mut self) {
        self.armed = false;
        self.forced = false;
    }

    pub fn force(&mut self) {
        self.forced = true;
    }

    /// Status poll. Returns true exactly when an acquisition completes.
    pub fn poll(&mut self) -> bool {
        if self.armed && (self.auto_trigger || self.forced) {
            self.armed = false;
            self.forced = false;
            self.captures += 1;
            true
        } else {
            false
        }
    }
}

/// Instrument wall clock: capture `n` happens `n` quarter-seconds after
/// 2024-03-01 12:00:00 local time.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SimClock {
    base: NaiveDateTime,
}

impl Default for SimClock {
    fn default() -> Self {
        let base = NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .unwrap_or_default();
        Self { base }
    }
}

impl SimClock {
    /// Whole-second time and fractional seconds of capture `n`.
    pub fn capture_time(&self, capture: u64) -> (NaiveDateTime, f64) {
        let quarters = capture as i64;
        let time = self.base + chrono::Duration::seconds(quarters / 4);
        (time, (quarters % 4) as f64 * 0.25)
    }

    /// Nanoseconds since 2000-01-01 00:00 local time.
    pub fn y2k_nanos(&self, capture: u64) -> i64 {
        let (time, fraction) = self.capture_time(capture);
        let epoch = NaiveDate::from_ymd_opt(2000, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap_or_default();
        let whole = (time - epoch).num_seconds();
        whole * 1_000_000_000 + (fraction * 1e9).round() as i64
    }
}

// =============================================================================
// Waveform synthesis
// =============================================================================

/// LCG matching glibc, for reproducible noise.
fn prng(seed: u64) -> u64 {
    seed.wrapping_mul(1103515245).wrapping_add(12345) & 0x7fffffff
}

/// Eight-bit codes of a noisy sine, two divisions in amplitude at 25 codes
/// per division. Each channel gets its own phase.
pub(crate) fn synth_codes(points: usize, channel: usize, capture: u64) -> Vec<i8> {
    let seed = capture.wrapping_mul(2654435761) ^ channel as u64;
    (0..points)
        .map(|i| {
            let phase = (i as f64 / 50.0 + channel as f64 * 0.25) * std::f64::consts::TAU;
            let noise = (prng(seed ^ i as u64) % 5) as f64 - 2.0;
            (50.0 * phase.sin() + noise).round().clamp(-127.0, 127.0) as i8
        })
        .collect()
}

/// Serialise codes as the instrument would: bytes, or the byte code in the
/// high half of a 16-bit word.
pub(crate) fn encode_codes(codes: &[i8], word: bool, big_endian: bool) -> Vec<u8> {
    if !word {
        return codes.iter().map(|&c| c as u8).collect();
    }
    let mut out = Vec::with_capacity(codes.len() * 2);
    for &c in codes {
        let w = i16::from(c) << 8;
        if big_endian {
            out.extend_from_slice(&w.to_be_bytes());
        } else {
            out.extend_from_slice(&w.to_le_bytes());
        }
    }
    out
}

/// Byte-per-sample logic pattern: bit `j` toggles every `2^(j+3)` samples.
pub(crate) fn synth_logic(points: usize) -> Vec<u8> {
    (0..points)
        .map(|i| {
            (0..8).fold(0u8, |acc, bit| {
                if (i >> (bit + 3)) & 1 == 1 {
                    acc | (1 << bit)
                } else {
                    acc
                }
            })
        })
        .collect()
}

/// Number of points per segment for a sample depth, never zero.
pub(crate) fn points_for(depth: f64) -> usize {
    (depth.round() as usize).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        let c = parse_command(":CHANNEL1:SCALE 0.5");
        assert_eq!(c.head, "CHANNEL1:SCALE");
        assert_eq!(c.arg.as_deref(), Some("0.5"));
        assert!(!c.query);
        let q = parse_command("c1:vdiv?");
        assert_eq!(q.head, "C1:VDIV");
        assert!(q.query);
        assert_eq!(q.arg, None);
    }

    #[test]
    fn test_parse_vbs() {
        assert_eq!(
            parse_vbs("VBS? 'app.Acquisition.Trigger.Type = \"Edge\"'"),
            Some(Vbs::Set("app.acquisition.trigger.type".into(), "Edge".into()))
        );
        assert_eq!(
            parse_vbs("VBS? 'return=app.Acquisition.C1.Deskew'"),
            Some(Vbs::Get("app.acquisition.c1.deskew".into()))
        );
        assert_eq!(
            parse_vbs("VBS? 'app.Acquisition.Trigger.Serial.UART.AutoBaud'"),
            Some(Vbs::Call("app.acquisition.trigger.serial.uart.autobaud".into()))
        );
    }

    #[test]
    fn test_arm_state() {
        let mut state = ArmState {
            auto_trigger: false,
            ..ArmState::default()
        };
        state.arm();
        assert!(!state.poll());
        state.force();
        assert!(state.poll());
        assert!(!state.poll());
        assert_eq!(state.captures, 1);
    }

    #[test]
    fn test_clock_increases() {
        let clock = SimClock::default();
        assert!(clock.y2k_nanos(2) > clock.y2k_nanos(1));
        let (t, f) = clock.capture_time(5);
        assert_eq!(f, 0.25);
        assert_eq!(t, clock.capture_time(4).0);
    }

    #[test]
    fn test_logic_pattern() {
        let bytes = synth_logic(32);
        assert_eq!(bytes[0], 0);
        assert_eq!(bytes[8] & 1, 1);
        assert_eq!(bytes[16] & 0b10, 0b10);
    }
}
