//! Channel descriptors and per-family enumeration.
//!
//! Channels are created once, at driver construction, in a fixed order:
//! analog inputs first, then digital lanes, spectrum views, trigger-only
//! inputs and finally the function-generator and meter pseudo-channels.
//! Their index in that list is the index every channel-typed operation takes.

use crate::family::{Family, Vendor};
use crate::options::InstrumentOptions;
use scope_core::{InstrumentTypes, Unit};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ChannelKind {
    Analog,
    Digital,
    /// Trigger-only input (external, line, fast-edge); no acquisition path.
    Trigger,
    Spectrum,
    FunctionGenerator,
    /// The built-in meter; measures one analog channel at a time.
    DmmSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Channel {
    pub index: usize,
    /// Name used on the wire (`C1`, `CH3`, `CH1_D5`, `EX`).
    pub hwname: String,
    pub display_name: String,
    pub kind: ChannelKind,
    pub color: String,
    pub x_unit: Unit,
    pub y_unit: Unit,
    /// Owning analog channel for digital lanes on probe-based MSOs and for spectrum views.
    pub parent: Option<usize>,
    /// Bit within the owning 8-lane group, or lane number on fixed MSO pods.
    pub lane: Option<u8>,
}

impl Channel {
    fn new(index: usize, hwname: impl Into<String>, kind: ChannelKind, color: &str) -> Self {
        let hwname = hwname.into();
        let (x_unit, y_unit) = match kind {
            ChannelKind::Spectrum => (Unit::Hertz, Unit::Volts),
            ChannelKind::Digital => (Unit::Femtoseconds, Unit::Counts),
            _ => (Unit::Femtoseconds, Unit::Volts),
        };
        Self {
            index,
            display_name: hwname.clone(),
            hwname,
            kind,
            color: color.to_string(),
            x_unit,
            y_unit,
            parent: None,
            lane: None,
        }
    }

    /// Capabilities this channel participates in.
    pub fn instrument_types(&self) -> InstrumentTypes {
        match self.kind {
            ChannelKind::Analog => InstrumentTypes::OSCILLOSCOPE,
            ChannelKind::Digital | ChannelKind::Trigger => InstrumentTypes::OSCILLOSCOPE,
            ChannelKind::Spectrum => InstrumentTypes::OSCILLOSCOPE | InstrumentTypes::SPECTRUM,
            ChannelKind::FunctionGenerator => InstrumentTypes::FUNCTION_GENERATOR,
            ChannelKind::DmmSource => InstrumentTypes::MULTIMETER,
        }
    }

    /// Analog input number, 1-based, as used in SCPI paths.
    pub fn number(&self) -> usize {
        self.hwname
            .trim_start_matches(|c: char| !c.is_ascii_digit())
            .split(|c: char| !c.is_ascii_digit())
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(self.index + 1)
    }
}

fn analog_color(vendor: Vendor, i: usize) -> &'static str {
    const LECROY: [&str; 8] = [
        "#ffff00", "#ff6abc", "#00ffff", "#00c100", "#d7ffd7", "#8482ff", "#ff0000", "#ff8000",
    ];
    const TEK: [&str; 8] = [
        "#ffff00", "#00ffff", "#ff00ff", "#00ff00", "#ff8000", "#4080ff", "#ff4040", "#c0c0c0",
    ];
    const SIGLENT: [&str; 4] = ["#ffff00", "#ff00ff", "#00ffff", "#00ff00"];
    match vendor {
        Vendor::LeCroy => LECROY[i % LECROY.len()],
        Vendor::Tektronix => TEK[i % TEK.len()],
        _ => SIGLENT[i % SIGLENT.len()],
    }
}

const DIGITAL_COLOR: &str = "#00c000";
const AUX_COLOR: &str = "#808080";

/// Build the channel table for a family.
pub fn enumerate_channels(
    family: Family,
    analog_count: usize,
    options: &InstrumentOptions,
) -> Vec<Channel> {
    let vendor = family.vendor();
    let mut channels: Vec<Channel> = Vec::new();
    let mut push = |channels: &mut Vec<Channel>, mut ch: Channel| {
        ch.index = channels.len();
        channels.push(ch);
    };

    let analog_name = |n: usize| match vendor {
        Vendor::Tektronix => format!("CH{}", n),
        _ => format!("C{}", n),
    };
    for i in 0..analog_count {
        push(
            &mut channels,
            Channel::new(0, analog_name(i + 1), ChannelKind::Analog, analog_color(vendor, i)),
        );
    }

    if family.has_digital_probes() {
        for parent in 0..analog_count {
            for lane in 0..8u8 {
                let mut ch = Channel::new(
                    0,
                    format!("CH{}_D{}", parent + 1, lane),
                    ChannelKind::Digital,
                    DIGITAL_COLOR,
                );
                ch.parent = Some(parent);
                ch.lane = Some(lane);
                push(&mut channels, ch);
            }
        }
    } else if vendor == Vendor::LeCroy && options.msxx {
        for lane in 0..16u8 {
            let mut ch = Channel::new(0, format!("D{}", lane), ChannelKind::Digital, DIGITAL_COLOR);
            ch.lane = Some(lane);
            push(&mut channels, ch);
        }
    }

    if family.supports_spectrum() {
        for parent in 0..analog_count {
            let mut ch = Channel::new(
                0,
                format!("CH{}_SV_NORMAL", parent + 1),
                ChannelKind::Spectrum,
                analog_color(vendor, parent),
            );
            ch.display_name = format!("CH{} Spectrum", parent + 1);
            ch.parent = Some(parent);
            push(&mut channels, ch);
        }
    }

    match vendor {
        Vendor::LeCroy => {
            push(&mut channels, Channel::new(0, "EX", ChannelKind::Trigger, AUX_COLOR));
            push(&mut channels, Channel::new(0, "LINE", ChannelKind::Trigger, AUX_COLOR));
            push(&mut channels, Channel::new(0, "FASTEDGE", ChannelKind::Trigger, AUX_COLOR));
        }
        Vendor::Tektronix => {
            push(&mut channels, Channel::new(0, "AUX", ChannelKind::Trigger, AUX_COLOR));
        }
        Vendor::Siglent => {
            push(&mut channels, Channel::new(0, "EX", ChannelKind::Trigger, AUX_COLOR));
        }
        Vendor::Unknown => {}
    }

    if options.awg && family.controls_secondary_instruments() {
        let name = if vendor == Vendor::Tektronix { "AFG" } else { "AWG" };
        push(
            &mut channels,
            Channel::new(0, name, ChannelKind::FunctionGenerator, "#ff8000"),
        );
    }
    if options.dvm && family.controls_secondary_instruments() {
        push(&mut channels, Channel::new(0, "DVM", ChannelKind::DmmSource, "#c0c0ff"));
    }

    channels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tek_layout() {
        let opts = InstrumentOptions::parse("AFG,DVM");
        let chans = enumerate_channels(Family::TekMso6, 4, &opts);
        // 4 analog + 32 digital + 4 spectrum + AUX + AFG + DVM
        assert_eq!(chans.len(), 4 + 32 + 4 + 3);
        assert_eq!(chans[0].hwname, "CH1");
        assert_eq!(chans[4].hwname, "CH1_D0");
        assert_eq!(chans[4].parent, Some(0));
        assert_eq!(chans[11].lane, Some(7));
        assert_eq!(chans[36].kind, ChannelKind::Spectrum);
        assert!(chans.iter().enumerate().all(|(i, c)| c.index == i));
        assert_eq!(chans.last().unwrap().kind, ChannelKind::DmmSource);
    }

    #[test]
    fn test_lecroy_msxx() {
        let opts = InstrumentOptions::parse("MSXX");
        let chans = enumerate_channels(Family::LeCroyMaui, 4, &opts);
        let digital: Vec<_> = chans
            .iter()
            .filter(|c| c.kind == ChannelKind::Digital)
            .collect();
        assert_eq!(digital.len(), 16);
        assert!(digital.iter().all(|c| c.parent.is_none()));
        assert!(chans.iter().any(|c| c.hwname == "FASTEDGE"));
    }

    #[test]
    fn test_number() {
        let opts = InstrumentOptions::default();
        let chans = enumerate_channels(Family::Sds2000Xp, 2, &opts);
        assert_eq!(chans[1].number(), 2);
        assert_eq!(chans[1].instrument_types(), InstrumentTypes::OSCILLOSCOPE);
    }
}
