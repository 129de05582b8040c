//! Simulated MAUI oscilloscope.
//!
//! Answers the short-form channel commands (`C1:VOLT_DIV`, `C1:TRACE`, ...),
//! the `VBS` automation tree, `INR?` polling and the `WF?` family of waveform
//! queries, including sequence mode and the MSXX digital capture.

use super::{
    encode_codes, parse_command, parse_vbs, points_for, synth_codes, synth_logic, ArmState,
    SimClock, Store, Vbs,
};
use crate::codec::lecroy_digital::DigitalCapture;
use crate::codec::timestamp::InstrumentTime;
use crate::codec::wavedesc::{encode_trigtime, WaveDesc};
use crate::family::channel_count_from_model;
use scope_scpi::mock::encode_block;
use scope_scpi::{MockReply, Responder};

/// Codes per vertical division in the synthesised data.
const CODES_PER_DIV: f64 = 25.0;

pub struct LeCroySim {
    model: String,
    options: String,
    analog_count: usize,
    store: Store,
    arm: ArmState,
    clock: SimClock,
    size_quirk: bool,
}

impl LeCroySim {
    pub fn new(model: &str, options: &str) -> Self {
        let analog_count = channel_count_from_model(model).unwrap_or(4);
        let mut store = Store::with_defaults(&[
            ("COMBINE_CHANNELS", "1"),
            ("COMM_FORMAT", "DEF9,BYTE,BIN"),
            ("TRIG_MODE", "STOP"),
            ("app.acquisition.horizontal.samplerate", "1000000000"),
            ("app.acquisition.horizontal.maxsamples", "1000"),
            ("app.acquisition.horizontal.samplemode", "RealTime"),
            ("app.acquisition.horizontal.numsegments", "1"),
            ("app.acquisition.trigger.type", "Edge"),
            ("app.acquisition.trigger.source", "C1"),
            ("app.acquisition.trigger.edge.slope", "Positive"),
            ("app.acquisition.dvm.dvmmode", "DC"),
            ("app.acquisition.dvm.dvmsource", "C1"),
            ("app.acquisition.dvm.voltage", "0.3536"),
            ("app.acquisition.dvm.frequency", "1000000"),
            ("app.wavesource.shape", "Sine"),
            ("app.wavesource.amplitude", "1"),
            ("app.wavesource.frequency", "1000000"),
            ("app.wavesource.dutycycle", "50"),
            ("app.wavesource.risetime", "1e-08"),
            ("app.wavesource.falltime", "1e-08"),
            ("app.wavesource.load", "HiZ"),
            ("app.logicanalyzer.msxxthreshold1", "1.4"),
            ("app.logicanalyzer.msxxthreshold2", "1.4"),
        ]);
        for n in 1..=analog_count {
            store.set(format!("C{}:TRACE", n), if n == 1 { "ON" } else { "OFF" });
            store.set(format!("C{}:COUPLING", n), "D1M");
            store.set(format!("C{}:VOLT_DIV", n), "0.1");
            store.set(format!("C{}:ATTENUATION", n), "1");
            store.set(format!("app.acquisition.c{}.bandwidthlimit", n), "Full");
            store.set(format!("app.acquisition.c{}.averagesweeps", n), "1");
            store.set(format!("app.acquisition.c{}.probename", n), "None");
        }
        Self {
            model: model.to_string(),
            options: options.to_string(),
            analog_count,
            store,
            arm: ArmState::default(),
            clock: SimClock::default(),
            size_quirk: false,
        }
    }

    /// Override the channel count (LabMaster models carry none in the name).
    pub fn with_channels(mut self, count: usize) -> Self {
        for n in self.analog_count + 1..=count {
            self.store.set(format!("C{}:TRACE", n), "OFF");
            self.store.set(format!("C{}:COUPLING", n), "D1M");
            self.store.set(format!("C{}:VOLT_DIV", n), "0.1");
            self.store.set(format!("C{}:ATTENUATION", n), "1");
            self.store.set(format!("app.acquisition.c{}.probename", n), "None");
        }
        self.analog_count = count;
        self
    }

    /// Report sample counts instead of byte counts in 16-bit block headers.
    pub fn with_size_quirk(mut self) -> Self {
        self.size_quirk = true;
        self
    }

    /// With `false`, an armed acquisition only completes when forced.
    pub fn with_auto_trigger(mut self, auto: bool) -> Self {
        self.arm.auto_trigger = auto;
        self
    }

    /// Attach a probe to analog input `n` (1-based).
    pub fn with_probe(mut self, n: usize, name: &str) -> Self {
        self.store
            .set(format!("app.acquisition.c{}.probename", n), name);
        self
    }

    /// Preset any stored setting, keyed as the simulator normalises it.
    pub fn with_setting(mut self, key: &str, value: &str) -> Self {
        self.store.set(key, value);
        self
    }

    fn word_mode(&self) -> bool {
        self.store.get("COMM_FORMAT").to_ascii_uppercase().contains("WORD")
    }

    fn segments(&self) -> usize {
        if self
            .store
            .get("app.acquisition.horizontal.samplemode")
            .eq_ignore_ascii_case("Sequence")
        {
            (self.store.f64("app.acquisition.horizontal.numsegments") as usize).max(1)
        } else {
            1
        }
    }

    fn interval(&self) -> f64 {
        let rate = self.store.f64("app.acquisition.horizontal.samplerate");
        if rate > 0.0 {
            1.0 / rate
        } else {
            1e-9
        }
    }

    fn points(&self) -> usize {
        points_for(self.store.f64("app.acquisition.horizontal.maxsamples"))
    }

    /// Seconds from the trigger to the first sample.
    fn horiz_offset(&self) -> f64 {
        let half = self.points() as f64 * self.interval() / 2.0;
        self.store.f64("app.acquisition.horizontal.horoffset") - half
    }

    fn descriptor(&self, n: usize) -> WaveDesc {
        let word = self.word_mode();
        let total = self.points() * self.segments();
        let vdiv = self.store.f64(&format!("C{}:VOLT_DIV", n));
        let (time, fraction) = self.clock.capture_time(self.arm.captures);
        let segments = self.segments();
        WaveDesc {
            word_samples: word,
            trigtime_len: if segments > 1 { 16 * segments as u32 } else { 0 },
            wave_array_bytes: (total * if word { 2 } else { 1 }) as u32,
            point_count: total as u32,
            vertical_gain: (vdiv / CODES_PER_DIV) as f32,
            vertical_offset: self.store.f64(&format!("C{}:OFFSET", n)) as f32,
            nominal_bits: 8,
            horiz_interval: self.interval() as f32,
            horiz_offset: self.horiz_offset(),
            vertical_unit: "V".to_string(),
            trigger_time: InstrumentTime::from_local(&time, fraction),
            probe_factor: self.store.f64(&format!("C{}:ATTENUATION", n)) as f32,
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

    fn prefixed_block(prefix: &str, body: &[u8], header_len: usize) -> MockReply {
        let mut raw = prefix.as_bytes().to_vec();
        raw.extend(encode_block(body, header_len));
        MockReply::Raw(raw)
    }

    fn waveform(&self, n: usize, part: &str) -> Vec<MockReply> {
        if n == 0 || n > self.analog_count {
            return vec![MockReply::text("")];
        }
        match part.to_ascii_uppercase().as_str() {
            "DESC" => {
                let desc = self.descriptor(n).encode();
                vec![Self::prefixed_block("DESC,", &desc, desc.len())]
            }
            "TIME" => {
                let offset = self.horiz_offset();
                let entries: Vec<(f64, f64)> = (0..self.segments())
                    .map(|seg| (seg as f64 * 1e-3, offset))
                    .collect();
                let body = encode_trigtime(&entries);
                vec![Self::prefixed_block("TIME,", &body, body.len())]
            }
            _ => {
                let body = self.samples(n);
                let header = if self.size_quirk && self.word_mode() {
                    body.len() / 2
                } else {
                    body.len()
                };
                vec![Self::prefixed_block("DAT1,", &body, header)]
            }
        }
    }

    fn digital_capture(&self) -> Vec<MockReply> {
        let points = self.points();
        let logic = synth_logic(points);
        let lines = (0..16usize)
            .filter(|j| {
                self.store
                    .flag(&format!("app.logicanalyzer.digital1.digital{}", j))
            })
            .map(|j| {
                let bit = j % 8;
                (j, logic.iter().map(|b| (b >> bit) & 1 == 1).collect())
            })
            .collect();
        let capture = DigitalCapture {
            hor_per_step: self.interval(),
            hor_start: self.horiz_offset(),
            num_samples: points,
            first_event_time: self.clock.y2k_nanos(self.arm.captures),
            lines,
        };
        vec![MockReply::block(capture.encode().as_bytes())]
    }

    fn vbs(&mut self, command: &str) -> Vec<MockReply> {
        match parse_vbs(command) {
            Some(Vbs::Get(path)) => {
                if let Some(inner) = path
                    .strip_prefix("isobject(app.acquisition.c")
                    .and_then(|s| s.strip_suffix(')'))
                {
                    let exists = inner
                        .parse::<usize>()
                        .is_ok_and(|n| n >= 1 && n <= self.analog_count);
                    return vec![MockReply::text(if exists { "-1" } else { "0" })];
                }
                vec![MockReply::text(self.store.get(&path))]
            }
            Some(Vbs::Set(path, value)) => {
                self.store.set(path, value);
                vec![]
            }
            Some(Vbs::Call(path)) => {
                if path.ends_with("uart.autobaud") {
                    self.store
                        .set("app.acquisition.trigger.serial.uart.bitrate", "115200");
                }
                vec![]
            }
            None => vec![],
        }
    }
}

impl Responder for LeCroySim {
    fn respond(&mut self, command: &str) -> Vec<MockReply> {
        let cmd = parse_command(command);
        match cmd.head.as_str() {
            "*IDN" => {
                return vec![MockReply::text(format!(
                    "LECROY,{},LCRY0001,9.6.0",
                    self.model
                ))]
            }
            "*OPT" => return vec![MockReply::text(self.options.clone())],
            "*OPC" => return vec![MockReply::text("1")],
            "*CLS" | "*RST" => return vec![],
            "VBS" => return self.vbs(command),
            "INR" => {
                let fired = self.arm.poll();
                return vec![MockReply::text(if fired { "8193" } else { "8192" })];
            }
            "FRTR" => {
                self.arm.force();
                return vec![];
            }
            "DIGITAL1:WF" => return self.digital_capture(),
            _ => {}
        }

        if cmd.head == "TRIG_MODE" && !cmd.query {
            match cmd.arg.as_deref().map(str::to_ascii_uppercase).as_deref() {
                Some("STOP") => self.arm.stop(),
                Some(_) => self.arm.arm(),
                None => {}
            }
        }

        if let Some(n) = cmd
            .head
            .strip_prefix('C')
            .and_then(|rest| rest.strip_suffix(":WF"))
            .and_then(|n| n.parse::<usize>().ok())
        {
            return self.waveform(n, cmd.arg.as_deref().unwrap_or("DAT1"));
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
    fn test_settings_echo() {
        let mut sim = LeCroySim::new("WAVERUNNER9254M", "");
        assert!(sim.respond("C2:VOLT_DIV 0.5").is_empty());
        assert_eq!(text(sim.respond("C2:VOLT_DIV?")), "0.5");
        assert_eq!(text(sim.respond("C1:TRACE?")), "ON");
        assert_eq!(text(sim.respond("C3:TRACE?")), "OFF");
        assert!(sim
            .respond("VBS? 'app.Acquisition.C1.Deskew = 1e-09'")
            .is_empty());
        assert_eq!(
            text(sim.respond("VBS? 'return=app.Acquisition.C1.Deskew'")),
            "1e-09"
        );
    }

    #[test]
    fn test_arm_and_poll() {
        let mut sim = LeCroySim::new("WAVERUNNER9254M", "");
        assert_eq!(text(sim.respond("INR?")), "8192");
        sim.respond("TRIG_MODE SINGLE");
        assert_eq!(text(sim.respond("INR?")), "8193");
        assert_eq!(text(sim.respond("INR?")), "8192");
    }

    #[test]
    fn test_sequence_descriptor() {
        let mut sim = LeCroySim::new("WAVERUNNER9254M", "")
            .with_setting("app.acquisition.horizontal.samplemode", "Sequence")
            .with_setting("app.acquisition.horizontal.numsegments", "2");
        let reply = sim.respond("C1:WF? DESC");
        let MockReply::Raw(raw) = &reply[0] else {
            panic!("expected raw block");
        };
        let desc = WaveDesc::parse(raw).unwrap();
        assert_eq!(desc.trigtime_len, 32);
        assert_eq!(desc.num_sequences(), 2);
        assert_eq!(desc.point_count, 2000);
    }

    #[test]
    fn test_size_quirk_header() {
        let mut sim = LeCroySim::new("WAVERUNNER9254M", "XDEV")
            .with_size_quirk()
            .with_setting("app.acquisition.horizontal.maxsamples", "100000");
        sim.respond("COMM_FORMAT DEF9,WORD,BIN");
        let reply = sim.respond("C1:WF? DAT1");
        let MockReply::Raw(raw) = &reply[0] else {
            panic!("expected raw block");
        };
        assert!(raw.starts_with(b"DAT1,#9000100000"));
        assert_eq!(raw.len(), "DAT1,#9000100000".len() + 200_000 + 1);
    }

    #[test]
    fn test_channel_probe() {
        let mut sim = LeCroySim::new("LABMASTER10ZI-A", "").with_channels(6);
        assert_eq!(
            text(sim.respond("VBS? 'return=IsObject(app.Acquisition.C6)'")),
            "-1"
        );
        assert_eq!(
            text(sim.respond("VBS? 'return=IsObject(app.Acquisition.C7)'")),
            "0"
        );
    }
}
