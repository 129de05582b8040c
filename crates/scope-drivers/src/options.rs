//! Installed-option detection from `*OPT?`.
//!
//! Only the options that change what the runtime exposes are recognised; the
//! rest are kept verbatim for display.

use serde::Serialize;

/// Default maximum memory depth when no tier option is installed.
pub const DEFAULT_MEMORY_DEPTH: u64 = 10_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct InstrumentOptions {
    /// Integrated function generator.
    pub awg: bool,
    /// Integrated digital voltmeter.
    pub dvm: bool,
    /// Mixed-signal option: 16 digital channels as 2×8.
    pub msxx: bool,
    /// Serial pattern triggers (8B/10B, NRZ).
    pub serial_pattern_trigger: bool,
    /// FastWavePort acquisition path.
    pub xdev: bool,
    /// Largest record length the memory tier allows, points.
    pub max_memory_depth: u64,
    /// Every option token as reported.
    pub raw: Vec<String>,
}

impl InstrumentOptions {
    /// Parse a comma-separated `*OPT?` reply. `0` or an empty reply means none.
    pub fn parse(reply: &str) -> Self {
        let mut options = Self {
            max_memory_depth: DEFAULT_MEMORY_DEPTH,
            ..Self::default()
        };
        for token in reply.split(',').map(|t| t.trim().trim_matches('"')) {
            if token.is_empty() || token == "0" {
                continue;
            }
            options.raw.push(token.to_string());
            let upper = token.to_ascii_uppercase();
            // Tek reports "AFG" / "DVM" with a license suffix (e.g. "5-AFG")
            let name = upper.rsplit('-').next().unwrap_or(&upper);
            match name {
                "AWG" | "AFG" => options.awg = true,
                "DVM" => options.dvm = true,
                "MSXX" | "MSO" => options.msxx = true,
                "SERIALPAT_T" => options.serial_pattern_trigger = true,
                "XDEV" => options.xdev = true,
                _ => {}
            }
            if let Some(depth) = memory_tier(&upper) {
                options.max_memory_depth = options.max_memory_depth.max(depth);
            }
        }
        options
    }
}

/// Depth implied by a memory option token: `-S`, `-M`, `-L`, `-V`, `-XL`
/// suffixes or an explicit `<n>MS` count.
fn memory_tier(token: &str) -> Option<u64> {
    const M: u64 = 1_000_000;
    if let Some(n) = token.strip_suffix("MS") {
        if let Ok(n) = n.parse::<u64>() {
            return Some(n * M);
        }
    }
    match token {
        "-S" => Some(25 * M),
        "-M" => Some(50 * M),
        "-L" => Some(100 * M),
        "-V" => Some(250 * M),
        "-XL" => Some(512 * M),
        _ => None,
    }
}
