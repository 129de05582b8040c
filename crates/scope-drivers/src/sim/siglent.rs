//! Simulated Siglent SDS oscilloscope.
//!
//! Current models speak the `:CHANnel<n>:*` / `:WAVeform:*` tree and answer
//! `:WAVEFORM:PREAMBLE?` with a binary WAVEDESC. The legacy SDS1000X-E /
//! SDS2000X-E command set is emulated too: short headers (`C1:VDIV`,
//! `TRSE`), replies that echo the header and carry a unit, and `WF?` blocks
//! behind a `C1:WF DAT2,` prefix.

use super::{encode_codes, parse_command, points_for, synth_codes, ArmState, SimClock, Store};
use crate::codec::timestamp::InstrumentTime;
use crate::codec::wavedesc::WaveDesc;
use crate::family::{channel_count_from_model, Family};
use scope_scpi::mock::encode_block;
use scope_scpi::{Identity, MockReply, Responder};

const CODES_PER_DIV: f64 = 25.0;
/// Horizontal divisions on the legacy models, for `SARA = MSIZ / (14 * TDIV)`.
const LEGACY_DIVISIONS: f64 = 14.0;

pub struct SiglentSim {
    model: String,
    /// `*OPT?` reply.
    options: String,
    legacy: bool,
    word_capable: bool,
    analog_count: usize,
    store: Store,
    arm: ArmState,
    clock: SimClock,
}

impl SiglentSim {
    pub fn new(model: &str) -> Self {
        let identity = Identity {
            vendor: "Siglent Technologies".into(),
            model: model.into(),
            ..Identity::default()
        };
        let family = Family::detect(&identity);
        let legacy = family.is_legacy_siglent();
        let analog_count = channel_count_from_model(model).unwrap_or(4);
        let store = if legacy {
            Self::legacy_defaults(analog_count)
        } else {
            Self::modern_defaults(analog_count)
        };
        Self {
            model: model.to_string(),
            options: "0".to_string(),
            legacy,
            word_capable: family.prefers_word_transfer() || family == Family::Sds6000A,
            analog_count,
            store,
            arm: ArmState::default(),
            clock: SimClock::default(),
        }
    }

    fn modern_defaults(analog_count: usize) -> Store {
        let mut store = Store::with_defaults(&[
            ("WAVEFORM:SOURCE", "C1"),
            ("WAVEFORM:WIDTH", "BYTE"),
            ("ACQUIRE:SRATE", "1.00E+09"),
            ("ACQUIRE:MDEPTH", "10k"),
            ("ACQUIRE:TYPE", "NORMAL"),
            ("ACQUIRE:SEQUENCE", "OFF"),
            ("ACQUIRE:SEQUENCE:COUNT", "2"),
            ("ACQUIRE:RESOLUTION", "8Bits"),
            ("TIMEBASE:DELAY", "0.00E+00"),
            ("TRIGGER:TYPE", "EDGE"),
            ("TRIGGER:EDGE:SOURCE", "C1"),
            ("TRIGGER:EDGE:SLOPE", "RISING"),
            ("TRIGGER:EDGE:LEVEL", "0.00E+00"),
        ]);
        for n in 1..=analog_count {
            store.set(format!("CHANNEL{}:SWITCH", n), if n == 1 { "ON" } else { "OFF" });
            store.set(format!("CHANNEL{}:COUPLING", n), "DC");
            store.set(format!("CHANNEL{}:IMPEDANCE", n), "ONEMEG");
            store.set(format!("CHANNEL{}:SCALE", n), "1.00E-01");
            store.set(format!("CHANNEL{}:PROBE", n), "1.00E+00");
            store.set(format!("CHANNEL{}:BWLIMIT", n), "FULL");
            store.set(format!("CHANNEL{}:INVERT", n), "OFF");
        }
        store
    }

    fn legacy_defaults(analog_count: usize) -> Store {
        let mut store = Store::with_defaults(&[
            ("TDIV", "1.00E-06"),
            ("MSIZ", "14K"),
            ("TRDL", "0.00E+00"),
            ("AVGA", "16"),
            ("TRSE", "EDGE,SR,C1,HT,OFF"),
        ]);
        for n in 1..=analog_count {
            store.set(format!("C{}:TRA", n), if n == 1 { "ON" } else { "OFF" });
            store.set(format!("C{}:CPL", n), "D1M");
            store.set(format!("C{}:VDIV", n), "1.00E-01");
            store.set(format!("C{}:OFST", n), "0.00E+00");
            store.set(format!("C{}:ATTN", n), "1");
            store.set(format!("C{}:BWL", n), "OFF");
            store.set(format!("C{}:INVS", n), "OFF");
            store.set(format!("C{}:SKEW", n), "0.00E+00");
            store.set(format!("C{}:TRLV", n), "0.00E+00");
            store.set(format!("C{}:TRSL", n), "POS");
        }
        store
    }

    pub fn with_auto_trigger(mut self, auto: bool) -> Self {
        self.arm.auto_trigger = auto;
        self
    }

    /// Installed options as reported by `*OPT?`; empty keeps the default.
    pub fn with_options(mut self, options: &str) -> Self {
        if !options.is_empty() {
            self.options = options.to_string();
        }
        self
    }

    pub fn with_setting(mut self, key: &str, value: &str) -> Self {
        self.store.set(key, value);
        self
    }

    fn channel_of(&self, name: &str) -> Option<usize> {
        let upper = name.trim().to_ascii_uppercase();
        let n: usize = upper
            .strip_prefix("CHANNEL")
            .or_else(|| upper.strip_prefix('C'))?
            .parse()
            .ok()?;
        (1..=self.analog_count).contains(&n).then_some(n)
    }

    // =========================================================================
    // Timebase model
    // =========================================================================

    fn points(&self) -> usize {
        if self.legacy {
            points_for(self.store.f64("MSIZ"))
        } else {
            points_for(self.store.f64("ACQUIRE:MDEPTH"))
        }
    }

    fn interval(&self) -> f64 {
        let rate = if self.legacy {
            self.points() as f64 / (LEGACY_DIVISIONS * self.store.f64("TDIV"))
        } else {
            self.store.f64("ACQUIRE:SRATE")
        };
        if rate.is_finite() && rate > 0.0 {
            1.0 / rate
        } else {
            1e-9
        }
    }

    fn segments(&self) -> usize {
        if !self.legacy && self.store.flag("ACQUIRE:SEQUENCE") {
            (self.store.f64("ACQUIRE:SEQUENCE:COUNT") as usize).max(1)
        } else {
            1
        }
    }

    fn word_mode(&self) -> bool {
        self.word_capable
            && !self.legacy
            && self.store.get("WAVEFORM:WIDTH").eq_ignore_ascii_case("WORD")
    }

    fn delay_key(&self) -> &'static str {
        if self.legacy {
            "TRDL"
        } else {
            "TIMEBASE:DELAY"
        }
    }

    // =========================================================================
    // Waveform synthesis
    // =========================================================================

    fn descriptor(&self, n: usize) -> WaveDesc {
        let word = self.word_mode();
        let total = self.points() * self.segments();
        let segments = self.segments();
        let (time, fraction) = self.clock.capture_time(self.arm.captures);
        let half = self.points() as f64 * self.interval() / 2.0;
        let (gain, offset, probe) = if self.legacy {
            // legacy descriptors carry V/div, not V/code
            (
                self.store.f64(&format!("C{}:VDIV", n)),
                self.store.f64(&format!("C{}:OFST", n)),
                self.store.f64(&format!("C{}:ATTN", n)),
            )
        } else {
            let probe = self.store.f64(&format!("CHANNEL{}:PROBE", n)).max(1e-3);
            (
                self.store.f64(&format!("CHANNEL{}:SCALE", n)) / CODES_PER_DIV / probe,
                self.store.f64(&format!("CHANNEL{}:OFFSET", n)) / probe,
                probe,
            )
        };
        WaveDesc {
            word_samples: word,
            trigtime_len: if segments > 1 { 16 * segments as u32 } else { 0 },
            wave_array_bytes: (total * if word { 2 } else { 1 }) as u32,
            point_count: total as u32,
            vertical_gain: gain as f32,
            vertical_offset: offset as f32,
            nominal_bits: 8,
            horiz_interval: self.interval() as f32,
            horiz_offset: self.store.f64(self.delay_key()) - half,
            vertical_unit: "V".to_string(),
            trigger_time: InstrumentTime::from_local(&time, fraction),
            probe_factor: probe as f32,
            wave_source: (n - 1) as u16,
        }
    }

    fn samples(&self, n: usize) -> Vec<u8> {
        let points = self.points();
        let segments = self.segments();
        let mut codes = Vec::with_capacity(points * segments);
        for seg in 0..segments {
            let capture = self.arm.captures * segments as u64 + seg as u64;
            codes.extend(synth_codes(points, n, capture));
        }
        encode_codes(&codes, self.word_mode(), false)
    }

    fn prefixed_block(prefix: &str, body: &[u8]) -> MockReply {
        let mut raw = prefix.as_bytes().to_vec();
        raw.extend(encode_block(body, body.len()));
        MockReply::Raw(raw)
    }

    // =========================================================================
    // Command sets
    // =========================================================================

    fn respond_modern(&mut self, head: &str, arg: Option<String>, query: bool) -> Vec<MockReply> {
        match (head, query) {
            ("TRIGGER:STATUS", true) => {
                let state = if self.arm.poll() {
                    "Stop"
                } else if self.arm.armed {
                    "Ready"
                } else {
                    "Stop"
                };
                return vec![MockReply::text(state)];
            }
            ("TRIGGER:MODE", false) => {
                match arg.as_deref().map(str::to_ascii_uppercase).as_deref() {
                    Some("FTRIG") => self.arm.force(),
                    Some("SINGLE") | Some("NORMAL") | Some("AUTO") => self.arm.arm(),
                    _ => {}
                }
            }
            ("TRIGGER:STOP", false) => {
                self.arm.stop();
                return vec![];
            }
            ("WAVEFORM:PREAMBLE", true) => {
                let source = self.store.get("WAVEFORM:SOURCE");
                return match self.channel_of(&source) {
                    Some(n) => vec![MockReply::block(&self.descriptor(n).encode())],
                    None => vec![MockReply::text("")],
                };
            }
            ("WAVEFORM:DATA", true) => {
                let source = self.store.get("WAVEFORM:SOURCE");
                return match self.channel_of(&source) {
                    Some(n) => vec![MockReply::block(&self.samples(n))],
                    None => vec![MockReply::text("")],
                };
            }
            _ => {}
        }

        if query {
            return vec![MockReply::text(self.store.get(head))];
        }
        if let Some(arg) = arg {
            // `:CHANNEL1:PROBE VALUE,10` reads back as the bare factor
            let arg = match arg.split_once(',') {
                Some((kind, value)) if head.ends_with(":PROBE") && kind.eq_ignore_ascii_case("VALUE") => {
                    value.trim().to_string()
                }
                _ => arg,
            };
            self.store.set(head, arg);
        }
        vec![]
    }

    fn legacy_unit(head: &str) -> &'static str {
        match head.rsplit(':').next().unwrap_or(head) {
            "VDIV" | "OFST" | "TRLV" => "V",
            "SKEW" | "TRDL" | "TDIV" => "S",
            _ => "",
        }
    }

    fn respond_legacy(&mut self, head: &str, arg: Option<String>, query: bool) -> Vec<MockReply> {
        match (head, query) {
            ("SAST", true) => {
                let state = if self.arm.poll() {
                    "Stop"
                } else if self.arm.armed {
                    "Ready"
                } else {
                    "Stop"
                };
                return vec![MockReply::text(format!("SAST {}", state))];
            }
            ("SARA", true) => {
                return vec![MockReply::text(format!(
                    "SARA {:.2E}Sa/s",
                    1.0 / self.interval()
                ))];
            }
            ("TRMD", false) => {
                if arg.as_deref().is_some_and(|a| !a.eq_ignore_ascii_case("STOP")) {
                    self.arm.arm();
                }
            }
            ("STOP", false) => {
                self.arm.stop();
                return vec![];
            }
            ("FRTR", false) => {
                self.arm.force();
                return vec![];
            }
            _ => {}
        }

        if let Some(n) = head
            .strip_prefix('C')
            .and_then(|rest| rest.strip_suffix(":WF"))
            .and_then(|n| n.parse::<usize>().ok())
            .filter(|n| (1..=self.analog_count).contains(n))
        {
            let part = arg.unwrap_or_default().to_ascii_uppercase();
            return if part == "DESC" {
                vec![Self::prefixed_block(
                    &format!("C{}:WF DESC,", n),
                    &self.descriptor(n).encode(),
                )]
            } else {
                vec![Self::prefixed_block(&format!("C{}:WF DAT2,", n), &self.samples(n))]
            };
        }

        if query {
            return vec![MockReply::text(format!(
                "{} {}{}",
                head,
                self.store.get(head),
                Self::legacy_unit(head)
            ))];
        }
        if let Some(arg) = arg {
            self.store.set(head, arg);
        }
        vec![]
    }
}

impl Responder for SiglentSim {
    fn respond(&mut self, command: &str) -> Vec<MockReply> {
        let cmd = parse_command(command);
        match cmd.head.as_str() {
            "*IDN" => {
                return vec![MockReply::text(format!(
                    "Siglent Technologies,{},SDS00000000001,3.8.12.1.1.3.8",
                    self.model
                ))]
            }
            "*OPT" => return vec![MockReply::text(self.options.clone())],
            "*OPC" => return vec![MockReply::text("1")],
            "*CLS" | "*RST" | "CHDR" => return vec![],
            _ => {}
        }
        if self.legacy {
            self.respond_legacy(&cmd.head, cmd.arg, cmd.query)
        } else {
            self.respond_modern(&cmd.head, cmd.arg, cmd.query)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(replies: Vec<MockReply>) -> String {
        match replies.into_iter().next() {
            Some(MockReply::Text(t)) => t,
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[test]
    fn test_legacy_echoes_header() {
        let mut sim = SiglentSim::new("SDS1202X-E");
        sim.respond("C2:VDIV 5.000000e-01");
        assert_eq!(text(sim.respond("C2:VDIV?")), "C2:VDIV 5.000000e-01V");
        assert_eq!(text(sim.respond("SARA?")), "SARA 1.00E9Sa/s");
        assert_eq!(text(sim.respond("TRSE?")), "TRSE EDGE,SR,C1,HT,OFF");
    }

    #[test]
    fn test_modern_probe_value() {
        let mut sim = SiglentSim::new("SDS2104X Plus");
        sim.respond(":CHANNEL2:PROBE VALUE,10");
        assert_eq!(text(sim.respond(":CHANNEL2:PROBE?")), "10");
    }

    #[test]
    fn test_modern_preamble_carries_probe_factor() {
        let mut sim = SiglentSim::new("SDS2104X Plus");
        sim.respond(":CHANNEL1:PROBE VALUE,10");
        sim.respond(":CHANNEL1:SCALE 1.0");
        let reply = sim.respond(":WAVEFORM:PREAMBLE?");
        let MockReply::Raw(raw) = &reply[0] else {
            panic!("expected raw block");
        };
        let desc = WaveDesc::parse(raw).unwrap();
        assert_eq!(desc.probe_factor, 10.0);
        assert!((f64::from(desc.vertical_gain) - 0.004).abs() < 1e-6);
    }

    #[test]
    fn test_force_trigger() {
        let mut sim = SiglentSim::new("SDS2104X Plus").with_auto_trigger(false);
        sim.respond(":TRIGGER:MODE SINGLE");
        assert_eq!(text(sim.respond(":TRIGGER:STATUS?")), "Ready");
        sim.respond(":TRIGGER:MODE FTRIG");
        assert_eq!(text(sim.respond(":TRIGGER:STATUS?")), "Stop");
    }
}
