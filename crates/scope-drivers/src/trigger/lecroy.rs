//! MAUI trigger tree (`app.Acquisition.Trigger.*` over `VBS`).

use super::{
    fmt_sci, fs_to_seconds, names, seconds_to_fs, warn_unsupported_condition, EdgeSlope, Trigger,
    TriggerCondition, TriggerContext, TriggerKind,
};
use scope_core::{Disparity, ScopeResult, Symbol8b10b, SymbolKind};
use scope_scpi::{parse_f64, ScpiPipeline};

const ROOT: &str = "app.Acquisition.Trigger";

fn set(pipe: &ScpiPipeline, path: &str, value: impl std::fmt::Display) {
    pipe.send_queued(format!("VBS? '{}.{} = {}'", ROOT, path, value));
}

fn set_str(pipe: &ScpiPipeline, path: &str, value: &str) {
    set(pipe, path, format!("\"{}\"", value));
}

async fn get(pipe: &ScpiPipeline, path: &str) -> ScopeResult<String> {
    let reply = pipe
        .query(&format!("VBS? 'return={}.{}'", ROOT, path))
        .await?;
    Ok(reply.trim().trim_matches('"').to_string())
}

async fn get_f64(pipe: &ScpiPipeline, path: &str) -> ScopeResult<f64> {
    parse_f64(&get(pipe, path).await?)
}

fn slope_name(slope: EdgeSlope) -> &'static str {
    match slope {
        EdgeSlope::Rising => "Positive",
        EdgeSlope::Falling => "Negative",
        EdgeSlope::Any => "Either",
    }
}

fn parse_slope(s: &str) -> EdgeSlope {
    match s {
        "Negative" => EdgeSlope::Falling,
        "Either" => EdgeSlope::Any,
        _ => EdgeSlope::Rising,
    }
}

fn condition_name(condition: TriggerCondition) -> Option<&'static str> {
    match condition {
        TriggerCondition::Less => Some("LessThan"),
        TriggerCondition::Greater => Some("GreaterThan"),
        TriggerCondition::Between => Some("InRange"),
        TriggerCondition::NotBetween => Some("OutOfRange"),
        _ => None,
    }
}

fn parse_condition(s: &str) -> Option<TriggerCondition> {
    match s {
        "LessThan" => Some(TriggerCondition::Less),
        "GreaterThan" => Some(TriggerCondition::Greater),
        "InRange" => Some(TriggerCondition::Between),
        "OutOfRange" => Some(TriggerCondition::NotBetween),
        _ => None,
    }
}

fn type_name(kind: TriggerKind) -> &'static str {
    match kind {
        TriggerKind::Edge => "Edge",
        TriggerKind::PulseWidth => "Width",
        TriggerKind::Glitch => "Glitch",
        TriggerKind::Runt => "Runt",
        TriggerKind::SlewRate => "SlewRate",
        TriggerKind::Dropout => "Dropout",
        TriggerKind::Window => "Window",
        _ => "Serial",
    }
}

/// Write `trigger` to the instrument.
pub async fn push(
    pipe: &ScpiPipeline,
    ctx: &TriggerContext<'_>,
    trigger: &Trigger,
) -> ScopeResult<()> {
    ctx.check_supported(trigger)?;
    let source = ctx.source_name(trigger.source())?;
    let kind = trigger.kind();
    let sub = type_name(kind);

    set_str(pipe, "Type", sub);
    set_str(pipe, "Source", source);

    match kind {
        TriggerKind::Edge => {
            set(pipe, "Edge.Level", fmt_sci(trigger.level()));
            set_str(pipe, "Edge.Slope", slope_name(trigger.slope()));
        }
        TriggerKind::PulseWidth | TriggerKind::Glitch | TriggerKind::Runt | TriggerKind::SlewRate => {
            if kind.is_two_level() {
                set(pipe, &format!("{}.UpperLevel", sub), fmt_sci(trigger.level()));
                set(
                    pipe,
                    &format!("{}.LowerLevel", sub),
                    fmt_sci(trigger.lower_level().unwrap_or_default()),
                );
            } else {
                set(pipe, &format!("{}.Level", sub), fmt_sci(trigger.level()));
            }
            set_str(pipe, &format!("{}.Slope", sub), slope_name(trigger.slope()));
            match trigger.condition().and_then(condition_name) {
                Some(c) => set_str(pipe, &format!("{}.Condition", sub), c),
                None => warn_unsupported_condition(kind, trigger.condition()),
            }
            set(
                pipe,
                &format!("{}.TimeLow", sub),
                fmt_sci(fs_to_seconds(trigger.lower_bound())),
            );
            set(
                pipe,
                &format!("{}.TimeHigh", sub),
                fmt_sci(fs_to_seconds(trigger.upper_bound())),
            );
        }
        TriggerKind::Dropout => {
            let p = trigger.params();
            set(pipe, "Dropout.Level", fmt_sci(trigger.level()));
            set_str(pipe, "Dropout.Slope", slope_name(trigger.slope()));
            set(
                pipe,
                "Dropout.DropoutTime",
                fmt_sci(fs_to_seconds(p.int(names::DROPOUT_TIME))),
            );
            let ignore_last = p.enum_name(names::RESET_MODE) == "No Edge";
            set(pipe, "Dropout.IgnoreLastEdge", if ignore_last { -1 } else { 0 });
        }
        TriggerKind::Window => {
            set(pipe, "Window.UpperLevel", fmt_sci(trigger.level()));
            set(
                pipe,
                "Window.LowerLevel",
                fmt_sci(trigger.lower_level().unwrap_or_default()),
            );
            if trigger.params().enum_name(names::CROSSING) == "Exit" {
                tracing::warn!("MAUI window trigger fires on entry and exit alike; crossing ignored");
            }
        }
        TriggerKind::Uart => push_uart(pipe, trigger),
        TriggerKind::Cdr8b10b => push_8b10b(pipe, trigger),
        TriggerKind::NrzPattern | TriggerKind::Cdr64b66b => {}
    }

    pipe.flush().await
}

fn push_uart(pipe: &ScpiPipeline, trigger: &Trigger) {
    let p = trigger.params();
    set_str(pipe, "Serial.Protocol", "UART");
    set(pipe, "Serial.UART.Level", fmt_sci(trigger.level()));
    set(pipe, "Serial.UART.BitRate", p.int(names::BIT_RATE));
    set_str(pipe, "Serial.UART.ParityType", p.enum_name(names::PARITY));
    let stop = match p.float(names::STOP_BITS) {
        s if s >= 2.0 => "2bits",
        s if s > 1.0 => "1.5bit",
        _ => "1bit",
    };
    set_str(pipe, "Serial.UART.StopBitLength", stop);
    let polarity = if p.enum_name(names::POLARITY) == "Idle Low" {
        "IdleLow"
    } else {
        "IdleHigh"
    };
    set_str(pipe, "Serial.UART.PolarityType", polarity);
    let condition = trigger.condition().and_then(|c| match c {
        TriggerCondition::Equal => Some("EqualTo"),
        TriggerCondition::NotEqual => Some("NotEqualTo"),
        TriggerCondition::Less => Some("Smaller"),
        TriggerCondition::Greater => Some("Greater"),
        TriggerCondition::Between => Some("InRange"),
        TriggerCondition::NotBetween => Some("OutRange"),
        _ => None,
    });
    match condition {
        Some(c) => set_str(pipe, "Serial.UART.PatternOperator", c),
        None => warn_unsupported_condition(TriggerKind::Uart, trigger.condition()),
    }
    set_str(pipe, "Serial.UART.PatternValue", p.string(names::PATTERN_1));
    set_str(pipe, "Serial.UART.PatternValue2", p.string(names::PATTERN_2));
}

fn symbol_kind_name(kind: SymbolKind) -> &'static str {
    match kind {
        SymbolKind::K => "K",
        SymbolKind::D => "D",
        SymbolKind::DontCare => "X",
    }
}

fn disparity_name(d: Disparity) -> &'static str {
    match d {
        Disparity::Any => "Any",
        Disparity::Positive => "Positive",
        Disparity::Negative => "Negative",
    }
}

fn push_8b10b(pipe: &ScpiPipeline, trigger: &Trigger) {
    let p = trigger.params();
    set_str(pipe, "Serial.Protocol", "8b10b");
    set(pipe, "Serial.8b10b.Level", fmt_sci(trigger.level()));
    set(pipe, "Serial.8b10b.BitRate", p.int(names::BIT_RATE));
    set_str(pipe, "Serial.8b10b.Equalizer", p.enum_name(names::EQUALIZER));
    set_str(pipe, "Serial.8b10b.TriggerPosition", p.enum_name(names::TRIGGER_POSITION));
    set_str(pipe, "Serial.8b10b.Polarity", p.enum_name(names::POLARITY));
    set_str(pipe, "Serial.8b10b.PatternType", p.enum_name(names::MODE));
    set_str(pipe, "Serial.8b10b.MatchType", p.enum_name(names::MATCH_MODE));
    set(pipe, "Serial.8b10b.PatternLength", p.int(names::PATTERN_LENGTH));
    for (i, sym) in trigger.pattern().iter().enumerate() {
        set_str(
            pipe,
            &format!("Serial.8b10b.Symbol{}Type", i),
            symbol_kind_name(sym.kind),
        );
        set(pipe, &format!("Serial.8b10b.Symbol{}Value", i), sym.value);
        set_str(
            pipe,
            &format!("Serial.8b10b.Symbol{}Disparity", i),
            disparity_name(sym.disparity),
        );
    }
}

/// Run the instrument's baud-rate search on the current UART trigger.
pub async fn autobaud(pipe: &ScpiPipeline) -> ScopeResult<i64> {
    pipe.send_immediate(&format!("VBS? '{}.Serial.UART.AutoBaud'", ROOT))
        .await?;
    let rate = get_f64(pipe, "Serial.UART.BitRate").await?;
    Ok(rate.round() as i64)
}

/// Read the active trigger back from the instrument.
pub async fn pull(pipe: &ScpiPipeline, ctx: &TriggerContext<'_>) -> ScopeResult<Trigger> {
    let ty = get(pipe, "Type").await?;
    let kind = match ty.as_str() {
        "Edge" => TriggerKind::Edge,
        "Width" => TriggerKind::PulseWidth,
        "Glitch" => TriggerKind::Glitch,
        "Runt" => TriggerKind::Runt,
        "SlewRate" => TriggerKind::SlewRate,
        "Dropout" => TriggerKind::Dropout,
        "Window" => TriggerKind::Window,
        "Serial" => match get(pipe, "Serial.Protocol").await?.as_str() {
            "UART" => TriggerKind::Uart,
            "8b10b" => TriggerKind::Cdr8b10b,
            other => {
                tracing::warn!(protocol = other, "Unsupported serial trigger, using edge");
                TriggerKind::Edge
            }
        },
        other => {
            tracing::warn!(trigger_type = other, "Unsupported trigger type, using edge");
            TriggerKind::Edge
        }
    };
    let source = ctx.source_index(&get(pipe, "Source").await?)?;
    let mut trigger = Trigger::new(kind, source)?;
    let sub = type_name(kind);

    match kind {
        TriggerKind::Edge => {
            trigger.set_level(get_f64(pipe, "Edge.Level").await?);
            trigger.set_slope(parse_slope(&get(pipe, "Edge.Slope").await?));
        }
        TriggerKind::PulseWidth | TriggerKind::Glitch | TriggerKind::Runt | TriggerKind::SlewRate => {
            if kind.is_two_level() {
                trigger.set_level(get_f64(pipe, &format!("{}.UpperLevel", sub)).await?);
                trigger.set_lower_level(get_f64(pipe, &format!("{}.LowerLevel", sub)).await?);
            } else {
                trigger.set_level(get_f64(pipe, &format!("{}.Level", sub)).await?);
            }
            trigger.set_slope(parse_slope(&get(pipe, &format!("{}.Slope", sub)).await?));
            let condition = get(pipe, &format!("{}.Condition", sub)).await?;
            if let Some(c) = parse_condition(&condition) {
                trigger.set_condition(c)?;
            }
            let low = get_f64(pipe, &format!("{}.TimeLow", sub)).await?;
            let high = get_f64(pipe, &format!("{}.TimeHigh", sub)).await?;
            trigger.set_bounds(seconds_to_fs(low), seconds_to_fs(high))?;
        }
        TriggerKind::Dropout => {
            trigger.set_level(get_f64(pipe, "Dropout.Level").await?);
            trigger.set_slope(parse_slope(&get(pipe, "Dropout.Slope").await?));
            let time = get_f64(pipe, "Dropout.DropoutTime").await?;
            let params = trigger.params_mut();
            params.set_int(names::DROPOUT_TIME, seconds_to_fs(time))?;
            let ignore = get_f64(pipe, "Dropout.IgnoreLastEdge").await? != 0.0;
            params.set_enum(
                names::RESET_MODE,
                if ignore { "No Edge" } else { "Opposite Edge" },
            )?;
        }
        TriggerKind::Window => {
            trigger.set_level(get_f64(pipe, "Window.UpperLevel").await?);
            trigger.set_lower_level(get_f64(pipe, "Window.LowerLevel").await?);
        }
        TriggerKind::Uart => pull_uart(pipe, &mut trigger).await?,
        TriggerKind::Cdr8b10b => pull_8b10b(pipe, &mut trigger).await?,
        TriggerKind::NrzPattern | TriggerKind::Cdr64b66b => {}
    }
    Ok(trigger)
}

async fn pull_uart(pipe: &ScpiPipeline, trigger: &mut Trigger) -> ScopeResult<()> {
    trigger.set_level(get_f64(pipe, "Serial.UART.Level").await?);
    let rate = get_f64(pipe, "Serial.UART.BitRate").await?;
    let parity = get(pipe, "Serial.UART.ParityType").await?;
    let stop = match get(pipe, "Serial.UART.StopBitLength").await?.as_str() {
        "2bits" => 2.0,
        "1.5bit" => 1.5,
        _ => 1.0,
    };
    let polarity = get(pipe, "Serial.UART.PolarityType").await?;
    let operator = get(pipe, "Serial.UART.PatternOperator").await?;
    let pattern1 = get(pipe, "Serial.UART.PatternValue").await?;
    let pattern2 = get(pipe, "Serial.UART.PatternValue2").await?;

    let p = trigger.params_mut();
    p.set_int(names::BIT_RATE, rate.round() as i64)?;
    if p.set_enum(names::PARITY, &parity).is_err() {
        tracing::warn!(parity = %parity, "Unknown UART parity");
    }
    p.set_float(names::STOP_BITS, stop)?;
    p.set_enum(
        names::POLARITY,
        if polarity == "IdleLow" { "Idle Low" } else { "Idle High" },
    )?;
    let condition = match operator.as_str() {
        "EqualTo" => Some(TriggerCondition::Equal),
        "NotEqualTo" => Some(TriggerCondition::NotEqual),
        "Smaller" => Some(TriggerCondition::Less),
        "Greater" => Some(TriggerCondition::Greater),
        "InRange" => Some(TriggerCondition::Between),
        "OutRange" => Some(TriggerCondition::NotBetween),
        _ => None,
    };
    if let Some(c) = condition {
        p.set_enum(names::CONDITION, c.name())?;
    }
    p.set_string(names::PATTERN_1, pattern1)?;
    p.set_string(names::PATTERN_2, pattern2)?;
    Ok(())
}

async fn pull_8b10b(pipe: &ScpiPipeline, trigger: &mut Trigger) -> ScopeResult<()> {
    trigger.set_level(get_f64(pipe, "Serial.8b10b.Level").await?);
    let rate = get_f64(pipe, "Serial.8b10b.BitRate").await?;
    let equalizer = get(pipe, "Serial.8b10b.Equalizer").await?;
    let position = get(pipe, "Serial.8b10b.TriggerPosition").await?;
    let polarity = get(pipe, "Serial.8b10b.Polarity").await?;
    let mode = get(pipe, "Serial.8b10b.PatternType").await?;
    let matching = get(pipe, "Serial.8b10b.MatchType").await?;
    let length = get_f64(pipe, "Serial.8b10b.PatternLength").await?.round() as usize;

    let mut pattern = Vec::with_capacity(length);
    for i in 0..length {
        let kind = match get(pipe, &format!("Serial.8b10b.Symbol{}Type", i)).await?.as_str() {
            "K" => SymbolKind::K,
            "X" => SymbolKind::DontCare,
            _ => SymbolKind::D,
        };
        let value = get_f64(pipe, &format!("Serial.8b10b.Symbol{}Value", i)).await? as u8;
        let disparity = match get(pipe, &format!("Serial.8b10b.Symbol{}Disparity", i))
            .await?
            .as_str()
        {
            "Positive" => Disparity::Positive,
            "Negative" => Disparity::Negative,
            _ => Disparity::Any,
        };
        pattern.push(Symbol8b10b::new(kind, value, disparity));
    }

    let p = trigger.params_mut();
    p.set_int(names::BIT_RATE, rate.round() as i64)?;
    p.set_enum(names::EQUALIZER, &equalizer)?;
    p.set_enum(names::TRIGGER_POSITION, &position)?;
    p.set_enum(names::POLARITY, &polarity)?;
    // mode first: it decides which lengths are legal
    p.set_enum(names::MODE, &mode)?;
    p.set_enum(names::MATCH_MODE, &matching)?;
    p.set_enum(names::PATTERN_LENGTH, &length.to_string())?;
    p.set_pattern(names::PATTERN, pattern)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::enumerate_channels;
    use crate::family::Family;
    use crate::options::InstrumentOptions;
    use crate::sim::lecroy::LeCroySim;
    use scope_scpi::MockTransport;

    fn setup() -> (ScpiPipeline, scope_scpi::MockHandle, Vec<crate::channel::Channel>) {
        let transport = MockTransport::new(LeCroySim::new("WAVERUNNER9254M", "SERIALPAT_T"));
        let handle = transport.handle();
        let channels = enumerate_channels(Family::LeCroyMaui, 4, &InstrumentOptions::default());
        (ScpiPipeline::new(Box::new(transport)), handle, channels)
    }

    #[tokio::test]
    async fn test_edge_push_wire_format() {
        let (pipe, handle, channels) = setup();
        let ctx = TriggerContext {
            family: Family::LeCroyMaui,
            channels: &channels,
            serial_pattern: true,
        };
        let trigger = Trigger::edge(1, 0.125, EdgeSlope::Rising);
        push(&pipe, &ctx, &trigger).await.unwrap();
        assert_eq!(
            handle.commands(),
            vec![
                "VBS? 'app.Acquisition.Trigger.Type = \"Edge\"'",
                "VBS? 'app.Acquisition.Trigger.Source = \"C2\"'",
                "VBS? 'app.Acquisition.Trigger.Edge.Level = 1.250000e-01'",
                "VBS? 'app.Acquisition.Trigger.Edge.Slope = \"Positive\"'",
            ]
        );

        let pulled = pull(&pipe, &ctx).await.unwrap();
        assert!(pulled.approx_eq(&trigger, 1e-3));
        assert_eq!(pulled.source(), 1);
    }

    #[tokio::test]
    async fn test_runt_round_trip() {
        let (pipe, _handle, channels) = setup();
        let ctx = TriggerContext {
            family: Family::LeCroyMaui,
            channels: &channels,
            serial_pattern: true,
        };
        let mut trigger = Trigger::new(TriggerKind::Runt, 2).unwrap();
        trigger.set_level(0.8);
        trigger.set_lower_level(0.2);
        trigger.set_slope(EdgeSlope::Falling);
        trigger.set_condition(TriggerCondition::Between).unwrap();
        trigger.set_bounds(2_000_000, 10_000_000).unwrap();
        push(&pipe, &ctx, &trigger).await.unwrap();
        let pulled = pull(&pipe, &ctx).await.unwrap();
        assert!(pulled.approx_eq(&trigger, 1e-3), "{:?}", pulled);
    }

    #[tokio::test]
    async fn test_8b10b_round_trip() {
        let (pipe, _handle, channels) = setup();
        let ctx = TriggerContext {
            family: Family::LeCroyMaui,
            channels: &channels,
            serial_pattern: true,
        };
        let mut trigger = Trigger::new(TriggerKind::Cdr8b10b, 0).unwrap();
        {
            let p = trigger.params_mut();
            p.set_enum(names::MODE, "List").unwrap();
            p.set_enum(names::PATTERN_LENGTH, "2").unwrap();
            p.set_pattern(
                names::PATTERN,
                vec![
                    Symbol8b10b::comma(),
                    Symbol8b10b::new(SymbolKind::D, 0x4a, Disparity::Negative),
                ],
            )
            .unwrap();
        }
        push(&pipe, &ctx, &trigger).await.unwrap();
        let pulled = pull(&pipe, &ctx).await.unwrap();
        assert_eq!(pulled.kind(), TriggerKind::Cdr8b10b);
        assert_eq!(pulled.pattern(), trigger.pattern());
        assert!(pulled.approx_eq(&trigger, 1e-3));
    }

    #[tokio::test]
    async fn test_8b10b_requires_option() {
        let (pipe, handle, channels) = setup();
        let ctx = TriggerContext {
            family: Family::LeCroyMaui,
            channels: &channels,
            serial_pattern: false,
        };
        let trigger = Trigger::new(TriggerKind::Cdr8b10b, 0).unwrap();
        assert!(push(&pipe, &ctx, &trigger).await.is_err());
        assert!(handle.commands().is_empty());
    }
}
