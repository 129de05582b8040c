//! Simulated MSO5/MSO6 oscilloscope.
//!
//! Long-form SCPI with headers off. `CURVE?` answers for whatever
//! `DATA:SOURCE` selects: an analog channel, a digital probe's `CHn_DALL`
//! byte stream, or a spectrum view.

use super::{encode_codes, parse_command, points_for, synth_codes, synth_logic, ArmState, Store};
use crate::codec::wfmpre::{BinaryFormat, Domain, Encoding, WfmPreamble};
use crate::family::channel_count_from_model;
use scope_scpi::{MockReply, Responder};

const CODES_PER_DIV: f64 = 25.0;
const SPECTRUM_POINTS: usize = 1000;

pub struct TekSim {
    model: String,
    options: String,
    analog_count: usize,
    store: Store,
    arm: ArmState,
    short_preamble: bool,
}

/// What `DATA:SOURCE` points at.
enum Source {
    Analog(usize),
    DigitalAll(usize),
    Spectrum(usize),
}

impl TekSim {
    pub fn new(model: &str, options: &str) -> Self {
        let analog_count = channel_count_from_model(model).unwrap_or(4);
        let mut store = Store::with_defaults(&[
            ("DATA:SOURCE", "CH1"),
            ("WFMOUTPRE:BYT_NR", "1"),
            ("ACQUIRE:NUMAVG", "16"),
            ("ACQUIRE:STATE", "0"),
            ("HORIZONTAL:MODE:SAMPLERATE", "6.25E+9"),
            ("HORIZONTAL:MODE:RECORDLENGTH", "1000"),
            ("TRIGGER:A:TYPE", "EDGE"),
            ("TRIGGER:A:EDGE:SOURCE", "CH1"),
            ("TRIGGER:A:EDGE:SLOPE", "RISE"),
            ("SV:SPAN", "5.0E+8"),
            ("SV:RBW", "1.0E+6"),
            ("AFG:OUTPUT:STATE", "0"),
            ("AFG:FUNCTION", "SINE"),
            ("AFG:AMPLITUDE", "0.5"),
            ("AFG:FREQUENCY", "1.0E+6"),
            ("AFG:SQUARE:DUTY", "50"),
            ("AFG:OUTPUT:LOAD:IMPEDANCE", "HIGHZ"),
            ("DVM:MODE", "OFF"),
            ("DVM:SOURCE", "CH1"),
            ("DVM:AUTORANGE", "1"),
        ]);
        for n in 1..=analog_count {
            store.set(
                format!("DISPLAY:GLOBAL:CH{}:STATE", n),
                if n == 1 { "1" } else { "0" },
            );
            store.set(format!("CH{}:COUPLING", n), "DC");
            store.set(format!("CH{}:TERMINATION", n), "1.0E+6");
            store.set(format!("CH{}:SCALE", n), "0.1");
            store.set(format!("CH{}:PROBE:GAIN", n), "0.1");
            store.set(format!("CH{}:PROBEFUNC:EXTATTEN", n), "1");
            store.set(format!("CH{}:BANDWIDTH", n), "1.0E+9");
            store.set(format!("CH{}:PROBETYPE", n), "ANALOG");
            store.set(format!("CH{}:PROBE:ID:TYPE", n), "\"TPP1000\"");
            store.set(format!("CH{}:SV:CENTERFREQUENCY", n), "1.0E+9");
            for lane in 0..8 {
                store.set(format!("CH{}_D{}:THRESHOLD", n, lane), "1.4");
            }
        }
        Self {
            model: model.to_string(),
            options: options.to_string(),
            analog_count,
            store,
            arm: ArmState::default(),
            short_preamble: false,
        }
    }

    /// Put a TLP058 logic probe on analog input `n` (1-based).
    pub fn with_digital_probe(mut self, n: usize) -> Self {
        self.store.set(format!("CH{}:PROBETYPE", n), "DIGITAL");
        self.store.set(format!("CH{}:PROBE:ID:TYPE", n), "\"TLP058\"");
        self
    }

    /// Attach an analog probe model to input `n` (1-based).
    pub fn with_probe(mut self, n: usize, id: &str) -> Self {
        self.store
            .set(format!("CH{}:PROBE:ID:TYPE", n), format!("\"{}\"", id));
        self
    }

    /// Drop `WFID` from the preamble, as some firmware does.
    pub fn with_short_preamble(mut self) -> Self {
        self.short_preamble = true;
        self
    }

    pub fn with_auto_trigger(mut self, auto: bool) -> Self {
        self.arm.auto_trigger = auto;
        self
    }

    pub fn with_setting(mut self, key: &str, value: &str) -> Self {
        self.store.set(key, value);
        self
    }

    fn source(&self) -> Option<Source> {
        let name = self.store.get("DATA:SOURCE").to_ascii_uppercase();
        let rest = name.strip_prefix("CH")?;
        let (num, suffix) = rest.split_at(rest.find('_').unwrap_or(rest.len()));
        let n: usize = num.parse().ok()?;
        if n == 0 || n > self.analog_count {
            return None;
        }
        match suffix {
            "" => Some(Source::Analog(n)),
            "_DALL" => Some(Source::DigitalAll(n)),
            "_SV_NORMAL" => Some(Source::Spectrum(n)),
            _ => None,
        }
    }

    fn interval(&self) -> f64 {
        let rate = self.store.f64("HORIZONTAL:MODE:SAMPLERATE");
        if rate > 0.0 {
            1.0 / rate
        } else {
            1.6e-10
        }
    }

    fn points(&self) -> usize {
        points_for(self.store.f64("HORIZONTAL:MODE:RECORDLENGTH"))
    }

    fn x_zero(&self) -> f64 {
        self.store.f64("HORIZONTAL:DELAY:TIME") - self.points() as f64 * self.interval() / 2.0
    }

    fn word_mode(&self) -> bool {
        self.store.f64("WFMOUTPRE:BYT_NR") >= 2.0
    }

    fn preamble(&self, source: &Source) -> WfmPreamble {
        let base = WfmPreamble {
            bytes_per_sample: 1,
            bits_per_sample: 8,
            encoding: Encoding::Binary,
            binary_format: BinaryFormat::Ri,
            big_endian: true,
            wfid: None,
            point_count: self.points(),
            point_format: "Y".to_string(),
            x_unit: "s".to_string(),
            x_increment: self.interval(),
            x_zero: self.x_zero(),
            point_offset: 0.0,
            y_unit: "V".to_string(),
            y_mult: 1.0,
            y_offset: 0.0,
            y_zero: 0.0,
            domain: Domain::Time,
            waveform_type: "ANALOG".to_string(),
            center_frequency: 0.0,
            span: 0.0,
        };
        match *source {
            Source::Analog(n) => {
                let vdiv = self.store.f64(&format!("CH{}:SCALE", n));
                let word = self.word_mode();
                let probe = self.store.get(&format!("CH{}:PROBE:ID:TYPE", n));
                let amps = probe.trim_matches('"').to_ascii_uppercase().starts_with("TCP");
                WfmPreamble {
                    bytes_per_sample: if word { 2 } else { 1 },
                    bits_per_sample: if word { 16 } else { 8 },
                    wfid: Some(format!("Ch{}, DC coupling, {} points", n, self.points())),
                    y_unit: if amps { "A" } else { "V" }.to_string(),
                    y_mult: vdiv / CODES_PER_DIV / if word { 256.0 } else { 1.0 },
                    y_zero: self.store.f64(&format!("CH{}:OFFSET", n)),
                    ..base
                }
            }
            Source::DigitalAll(n) => WfmPreamble {
                binary_format: BinaryFormat::Rp,
                wfid: Some(format!("CH{}_DALL, {} points", n, self.points())),
                y_unit: "State".to_string(),
                waveform_type: "DIGITAL".to_string(),
                ..base
            },
            Source::Spectrum(n) => {
                let span = self.store.f64("SV:SPAN");
                let center = self.store.f64(&format!("CH{}:SV:CENTERFREQUENCY", n));
                WfmPreamble {
                    bytes_per_sample: 4,
                    bits_per_sample: 32,
                    binary_format: BinaryFormat::Fp,
                    wfid: Some(format!("CH{} spectrum", n)),
                    point_count: SPECTRUM_POINTS,
                    x_unit: "Hz".to_string(),
                    x_increment: span / SPECTRUM_POINTS as f64,
                    x_zero: center - span / 2.0,
                    y_unit: "dBm".to_string(),
                    domain: Domain::Frequency,
                    waveform_type: "SPECTRAL_MAG".to_string(),
                    center_frequency: center,
                    span,
                    ..base
                }
            }
        }
    }

    fn curve(&self, source: &Source) -> Vec<u8> {
        match *source {
            Source::Analog(n) => {
                let codes = synth_codes(self.points(), n, self.arm.captures);
                encode_codes(&codes, self.word_mode(), true)
            }
            Source::DigitalAll(_) => synth_logic(self.points()),
            Source::Spectrum(_) => (0..SPECTRUM_POINTS)
                .flat_map(|i| {
                    let distance = (i as f32 - SPECTRUM_POINTS as f32 / 2.0).abs();
                    (-80.0f32 + 70.0 / (1.0 + distance)).to_be_bytes()
                })
                .collect(),
        }
    }

    fn trigger_state(&mut self) -> &'static str {
        if self.arm.poll() {
            "SAVE"
        } else if self.arm.armed {
            "READY"
        } else {
            "SAVE"
        }
    }

    fn meter_value(&self) -> String {
        let mode = self.store.get("DVM:MODE").to_ascii_uppercase();
        if mode.starts_with("FREQ") {
            "1.0E+6".to_string()
        } else {
            "353.6E-3".to_string()
        }
    }
}

impl Responder for TekSim {
    fn respond(&mut self, command: &str) -> Vec<MockReply> {
        let cmd = parse_command(command);
        let arg = cmd.arg.clone().unwrap_or_default().to_ascii_uppercase();
        match (cmd.head.as_str(), cmd.query) {
            ("*IDN", true) => {
                return vec![MockReply::text(format!(
                    "TEKTRONIX,{},C012345,CF:91.1CT FV:2.0.3.950",
                    self.model
                ))]
            }
            ("*OPT", true) => {
                let opts = if self.options.is_empty() { "0" } else { &self.options };
                return vec![MockReply::text(opts)];
            }
            ("*OPC", true) => return vec![MockReply::text("1")],
            ("TRIGGER:STATE", true) => return vec![MockReply::text(self.trigger_state())],
            ("TRIGGER", false) if arg == "FORCE" => {
                self.arm.force();
                return vec![];
            }
            ("ACQUIRE:STATE", false) => match arg.as_str() {
                "ON" | "1" | "RUN" => self.arm.arm(),
                _ => self.arm.stop(),
            },
            ("WFMOUTPRE", true) => {
                let reply = match self.source() {
                    Some(source) => self.preamble(&source).encode(self.short_preamble),
                    None => String::new(),
                };
                return vec![MockReply::text(reply)];
            }
            ("CURVE", true) => {
                let body = match self.source() {
                    Some(source) => self.curve(&source),
                    None => Vec::new(),
                };
                return vec![MockReply::block(&body)];
            }
            ("DVM:MEASUREMENT:VALUE", true) => return vec![MockReply::text(self.meter_value())],
            _ => {}
        }

        if cmd.query {
            vec![MockReply::text(self.store.get(&cmd.head))]
        } else {
            if let Some(arg) = cmd.arg {
                self.store.set(cmd.head, arg);
            }
            vec![]
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
    fn test_digital_probe() {
        let mut sim = TekSim::new("MSO64", "").with_digital_probe(1);
        assert_eq!(text(sim.respond("CH1:PROBETYPE?")), "DIGITAL");
        assert_eq!(text(sim.respond("CH2:PROBETYPE?")), "ANALOG");
    }

    #[test]
    fn test_preamble_follows_source() {
        let mut sim = TekSim::new("MSO64", "");
        sim.respond("CH2:SCALE 0.5");
        sim.respond("DATA:SOURCE CH2");
        let pre = WfmPreamble::parse(&text(sim.respond("WFMOUTPRE?"))).unwrap();
        assert_eq!(pre.point_count, 1000);
        assert!((pre.y_mult - 0.02).abs() < 1e-12);

        sim.respond("DATA:SOURCE CH1_SV_NORMAL");
        let pre = WfmPreamble::parse(&text(sim.respond("WFMOUTPRE?"))).unwrap();
        assert_eq!(pre.domain, Domain::Frequency);
        assert_eq!(pre.binary_format, BinaryFormat::Fp);
    }

    #[test]
    fn test_short_preamble() {
        let mut sim = TekSim::new("MSO58", "").with_short_preamble();
        let pre = WfmPreamble::parse(&text(sim.respond("WFMOUTPRE?"))).unwrap();
        assert_eq!(pre.wfid, None);
    }

    #[test]
    fn test_trigger_state() {
        let mut sim = TekSim::new("MSO64", "").with_auto_trigger(false);
        sim.respond("ACQUIRE:STATE ON");
        assert_eq!(text(sim.respond("TRIGGER:STATE?")), "READY");
        sim.respond("TRIGGER FORCE");
        assert_eq!(text(sim.respond("TRIGGER:STATE?")), "SAVE");
    }
}
