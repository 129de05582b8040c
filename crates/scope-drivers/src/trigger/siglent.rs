//! Siglent trigger trees.
//!
//! Current firmware (SDS2000X+, HD, SDS5000X, SDS6000A) uses the
//! `:TRIGger:<type>:*` tree. The legacy SDS1000/SDS2000X-E command set only
//! expresses edge triggers here, through `TRSE`/`TRLV`/`TRSL`.

use super::{
    fmt_sci, fs_to_seconds, names, seconds_to_fs, warn_unsupported_condition, EdgeSlope, Trigger,
    TriggerCondition, TriggerContext, TriggerKind,
};
use scope_core::{ScopeError, ScopeResult};
use scope_scpi::{parse_f64, ScpiPipeline};

fn type_name(kind: TriggerKind) -> Option<&'static str> {
    match kind {
        TriggerKind::Edge => Some("EDGE"),
        TriggerKind::PulseWidth => Some("PULSE"),
        TriggerKind::Runt => Some("RUNT"),
        TriggerKind::SlewRate => Some("SLOPE"),
        TriggerKind::Dropout => Some("DROPOUT"),
        TriggerKind::Window => Some("WINDOW"),
        TriggerKind::Uart => Some("UART"),
        _ => None,
    }
}

fn parse_type(s: &str) -> Option<TriggerKind> {
    let s = s.to_ascii_uppercase();
    Some(match s.as_str() {
        x if x.starts_with("EDGE") => TriggerKind::Edge,
        x if x.starts_with("PULS") => TriggerKind::PulseWidth,
        x if x.starts_with("RUNT") => TriggerKind::Runt,
        x if x.starts_with("SLOP") => TriggerKind::SlewRate,
        x if x.starts_with("DROP") => TriggerKind::Dropout,
        x if x.starts_with("WIND") => TriggerKind::Window,
        x if x.starts_with("UART") => TriggerKind::Uart,
        _ => return None,
    })
}

fn slope_name(slope: EdgeSlope) -> &'static str {
    match slope {
        EdgeSlope::Rising => "RISING",
        EdgeSlope::Falling => "FALLING",
        EdgeSlope::Any => "ALTERNATE",
    }
}

fn parse_slope(s: &str) -> EdgeSlope {
    let s = s.to_ascii_uppercase();
    if s.starts_with("FALL") || s.starts_with("NEG") {
        EdgeSlope::Falling
    } else if s.starts_with("ALT") || s.starts_with("WINDOW") {
        EdgeSlope::Any
    } else {
        EdgeSlope::Rising
    }
}

fn limit_name(condition: TriggerCondition) -> Option<&'static str> {
    match condition {
        TriggerCondition::Less => Some("LESSTHAN"),
        TriggerCondition::Greater => Some("GREATERTHAN"),
        TriggerCondition::Between => Some("INNER"),
        TriggerCondition::NotBetween => Some("OUTER"),
        _ => None,
    }
}

fn parse_limit(s: &str) -> Option<TriggerCondition> {
    let s = s.to_ascii_uppercase();
    Some(match s.as_str() {
        x if x.starts_with("LESS") => TriggerCondition::Less,
        x if x.starts_with("GREA") => TriggerCondition::Greater,
        x if x.starts_with("INN") => TriggerCondition::Between,
        x if x.starts_with("OUT") => TriggerCondition::NotBetween,
        _ => return None,
    })
}

/// Write `trigger` to the instrument.
pub async fn push(
    pipe: &ScpiPipeline,
    ctx: &TriggerContext<'_>,
    trigger: &Trigger,
) -> ScopeResult<()> {
    ctx.check_supported(trigger)?;
    if ctx.family.is_legacy_siglent() {
        return push_legacy(pipe, ctx, trigger).await;
    }
    let kind = trigger.kind();
    let Some(ty) = type_name(kind) else {
        return Err(ScopeError::Unsupported(format!(
            "{} trigger on {}",
            kind, ctx.family
        )));
    };
    let source = ctx.source_name(trigger.source())?;

    pipe.send_queued(format!(":TRIGGER:TYPE {}", ty));
    if kind == TriggerKind::Uart {
        push_uart(pipe, source, trigger);
        return pipe.flush().await;
    }

    let tree = format!(":TRIGGER:{}", ty);
    pipe.send_queued(format!("{}:SOURCE {}", tree, source));
    if kind.is_two_level() {
        pipe.send_queued(format!("{}:HLEVEL {}", tree, fmt_sci(trigger.level())));
        pipe.send_queued(format!(
            "{}:LLEVEL {}",
            tree,
            fmt_sci(trigger.lower_level().unwrap_or_default())
        ));
    } else {
        pipe.send_queued(format!("{}:LEVEL {}", tree, fmt_sci(trigger.level())));
    }

    match kind {
        TriggerKind::Edge => {
            pipe.send_queued(format!("{}:SLOPE {}", tree, slope_name(trigger.slope())));
        }
        TriggerKind::PulseWidth | TriggerKind::Runt | TriggerKind::SlewRate => {
            let polarity = if kind == TriggerKind::SlewRate {
                slope_name(trigger.slope())
            } else if trigger.slope() == EdgeSlope::Falling {
                "NEGATIVE"
            } else {
                "POSITIVE"
            };
            let key = if kind == TriggerKind::SlewRate { "SLOPE" } else { "POLARITY" };
            pipe.send_queued(format!("{}:{} {}", tree, key, polarity));
            match trigger.condition().and_then(limit_name) {
                Some(limit) => pipe.send_queued(format!("{}:LIMIT {}", tree, limit)),
                None => warn_unsupported_condition(kind, trigger.condition()),
            }
            pipe.send_queued(format!(
                "{}:TLOWER {}",
                tree,
                fmt_sci(fs_to_seconds(trigger.lower_bound()))
            ));
            pipe.send_queued(format!(
                "{}:TUPPER {}",
                tree,
                fmt_sci(fs_to_seconds(trigger.upper_bound()))
            ));
        }
        TriggerKind::Dropout => {
            let p = trigger.params();
            pipe.send_queued(format!("{}:SLOPE {}", tree, slope_name(trigger.slope())));
            let reset = if p.enum_name(names::RESET_MODE) == "No Edge" {
                "STATE"
            } else {
                "EDGE"
            };
            pipe.send_queued(format!("{}:TYPE {}", tree, reset));
            pipe.send_queued(format!(
                "{}:TIME {}",
                tree,
                fmt_sci(fs_to_seconds(p.int(names::DROPOUT_TIME)))
            ));
        }
        TriggerKind::Window => {
            if trigger.params().enum_name(names::CROSSING) == "Exit" {
                tracing::warn!("Window exit crossing not supported on this family, using enter");
            }
        }
        _ => {}
    }
    pipe.flush().await
}

fn push_uart(pipe: &ScpiPipeline, source: &str, trigger: &Trigger) {
    let p = trigger.params();
    let tree = ":TRIGGER:UART";
    pipe.send_queued(format!("{}:RXSOURCE {}", tree, source));
    pipe.send_queued(format!("{}:RXTHRESHOLD {}", tree, fmt_sci(trigger.level())));
    pipe.send_queued(format!("{}:BAUD CUSTOM,{}", tree, p.int(names::BIT_RATE)));
    pipe.send_queued(format!(
        "{}:PARITY {}",
        tree,
        p.enum_name(names::PARITY).to_ascii_uppercase()
    ));
    let stop = p.float(names::STOP_BITS);
    let stop = if stop >= 2.0 {
        "2"
    } else if stop > 1.0 {
        "1.5"
    } else {
        "1"
    };
    pipe.send_queued(format!("{}:STOP {}", tree, stop));
    let idle = if p.enum_name(names::POLARITY) == "Idle Low" {
        "LOW"
    } else {
        "HIGH"
    };
    pipe.send_queued(format!("{}:IDLE {}", tree, idle));
}

async fn push_legacy(
    pipe: &ScpiPipeline,
    ctx: &TriggerContext<'_>,
    trigger: &Trigger,
) -> ScopeResult<()> {
    if trigger.kind() != TriggerKind::Edge {
        return Err(ScopeError::Unsupported(format!(
            "{} trigger on {}",
            trigger.kind(),
            ctx.family
        )));
    }
    let source = ctx.source_name(trigger.source())?;
    let slope = match trigger.slope() {
        EdgeSlope::Rising => "POS",
        EdgeSlope::Falling => "NEG",
        EdgeSlope::Any => "WINDOW",
    };
    pipe.send_queued(format!("TRSE EDGE,SR,{},HT,OFF", source));
    pipe.send_queued(format!("{}:TRLV {}", source, fmt_sci(trigger.level())));
    pipe.send_queued(format!("{}:TRSL {}", source, slope));
    pipe.flush().await
}

/// Query and strip quotes and any echoed header (`C1:TRLV 1.5E-01V`).
async fn get(pipe: &ScpiPipeline, query: &str) -> ScopeResult<String> {
    let reply = pipe.query(query).await?;
    let reply = reply.trim();
    let value = match reply.split_once(' ') {
        Some((head, rest)) if head.contains(':') || head.chars().all(|c| c.is_ascii_uppercase()) => {
            rest
        }
        _ => reply,
    };
    Ok(value.trim().trim_matches('"').to_string())
}

async fn get_f64(pipe: &ScpiPipeline, query: &str) -> ScopeResult<f64> {
    let value = get(pipe, query).await?;
    parse_f64(value.trim_end_matches(|c: char| c.is_ascii_alphabetic()))
}

/// Read the active trigger back from the instrument.
pub async fn pull(pipe: &ScpiPipeline, ctx: &TriggerContext<'_>) -> ScopeResult<Trigger> {
    if ctx.family.is_legacy_siglent() {
        return pull_legacy(pipe, ctx).await;
    }
    let ty = get(pipe, ":TRIGGER:TYPE?").await?;
    let kind = parse_type(&ty).unwrap_or_else(|| {
        tracing::warn!(trigger_type = %ty, "Unsupported trigger type, using edge");
        TriggerKind::Edge
    });
    let Some(name) = type_name(kind) else {
        return Err(ScopeError::Unsupported(format!("{} trigger", kind)));
    };
    let tree = format!(":TRIGGER:{}", name);

    if kind == TriggerKind::Uart {
        return pull_uart(pipe, ctx).await;
    }

    let source = ctx.source_index(&get(pipe, &format!("{}:SOURCE?", tree)).await?)?;
    let mut trigger = Trigger::new(kind, source)?;
    if kind.is_two_level() {
        trigger.set_level(get_f64(pipe, &format!("{}:HLEVEL?", tree)).await?);
        trigger.set_lower_level(get_f64(pipe, &format!("{}:LLEVEL?", tree)).await?);
    } else {
        trigger.set_level(get_f64(pipe, &format!("{}:LEVEL?", tree)).await?);
    }

    match kind {
        TriggerKind::Edge => {
            trigger.set_slope(parse_slope(&get(pipe, &format!("{}:SLOPE?", tree)).await?));
        }
        TriggerKind::PulseWidth | TriggerKind::Runt | TriggerKind::SlewRate => {
            let key = if kind == TriggerKind::SlewRate { "SLOPE" } else { "POLARITY" };
            trigger.set_slope(parse_slope(&get(pipe, &format!("{}:{}?", tree, key)).await?));
            if let Some(c) = parse_limit(&get(pipe, &format!("{}:LIMIT?", tree)).await?) {
                trigger.set_condition(c)?;
            }
            let lower = get_f64(pipe, &format!("{}:TLOWER?", tree)).await?;
            let upper = get_f64(pipe, &format!("{}:TUPPER?", tree)).await?;
            trigger.set_bounds(seconds_to_fs(lower), seconds_to_fs(upper))?;
        }
        TriggerKind::Dropout => {
            trigger.set_slope(parse_slope(&get(pipe, &format!("{}:SLOPE?", tree)).await?));
            let reset = get(pipe, &format!("{}:TYPE?", tree)).await?;
            let reset = if reset.eq_ignore_ascii_case("STATE") {
                "No Edge"
            } else {
                "Opposite Edge"
            };
            let time = get_f64(pipe, &format!("{}:TIME?", tree)).await?;
            let p = trigger.params_mut();
            p.set_enum(names::RESET_MODE, reset)?;
            p.set_int(names::DROPOUT_TIME, seconds_to_fs(time))?;
        }
        _ => {}
    }
    Ok(trigger)
}

async fn pull_uart(pipe: &ScpiPipeline, ctx: &TriggerContext<'_>) -> ScopeResult<Trigger> {
    let tree = ":TRIGGER:UART";
    let source = ctx.source_index(&get(pipe, &format!("{}:RXSOURCE?", tree)).await?)?;
    let mut trigger = Trigger::new(TriggerKind::Uart, source)?;
    trigger.set_level(get_f64(pipe, &format!("{}:RXTHRESHOLD?", tree)).await?);

    // BAUD reads back as either a preset rate or "CUSTOM,<rate>"
    let baud = get(pipe, &format!("{}:BAUD?", tree)).await?;
    let rate = baud.rsplit(',').next().unwrap_or(&baud);
    let rate = parse_f64(rate)?.round() as i64;

    let parity = get(pipe, &format!("{}:PARITY?", tree)).await?;
    let parity = match parity.to_ascii_uppercase().as_str() {
        "EVEN" => "Even",
        "ODD" => "Odd",
        "MARK" => "Mark",
        "SPACE" => "Space",
        _ => "None",
    };
    let stop = get_f64(pipe, &format!("{}:STOP?", tree)).await?;
    let idle = get(pipe, &format!("{}:IDLE?", tree)).await?;

    let p = trigger.params_mut();
    p.set_int(names::BIT_RATE, rate)?;
    p.set_enum(names::PARITY, parity)?;
    p.set_float(names::STOP_BITS, stop)?;
    p.set_enum(
        names::POLARITY,
        if idle.eq_ignore_ascii_case("LOW") {
            "Idle Low"
        } else {
            "Idle High"
        },
    )?;
    Ok(trigger)
}

async fn pull_legacy(pipe: &ScpiPipeline, ctx: &TriggerContext<'_>) -> ScopeResult<Trigger> {
    // EDGE,SR,C1,HT,OFF
    let trse = get(pipe, "TRSE?").await?;
    let fields: Vec<&str> = trse.split(',').map(str::trim).collect();
    if !fields
        .first()
        .is_some_and(|t| t.eq_ignore_ascii_case("EDGE"))
    {
        tracing::warn!(trse = %trse, "Unsupported trigger type, using edge");
    }
    let source_name = fields
        .iter()
        .position(|f| f.eq_ignore_ascii_case("SR"))
        .and_then(|i| fields.get(i + 1))
        .ok_or_else(|| ScopeError::parse(&trse, "TRSE source"))?;
    let source = ctx.source_index(source_name)?;
    let hw = ctx.source_name(source)?.to_string();

    let level = get_f64(pipe, &format!("{}:TRLV?", hw)).await?;
    let slope = parse_slope(&get(pipe, &format!("{}:TRSL?", hw)).await?);
    Ok(Trigger::edge(source, level, slope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{enumerate_channels, Channel};
    use crate::family::Family;
    use crate::options::InstrumentOptions;
    use crate::sim::siglent::SiglentSim;
    use scope_scpi::MockTransport;

    fn setup(model: &str, family: Family) -> (ScpiPipeline, scope_scpi::MockHandle, Vec<Channel>) {
        let transport = MockTransport::new(SiglentSim::new(model));
        let handle = transport.handle();
        let channels = enumerate_channels(family, 4, &InstrumentOptions::default());
        (ScpiPipeline::new(Box::new(transport)), handle, channels)
    }

    #[tokio::test]
    async fn test_edge_round_trip() {
        let (pipe, _, channels) = setup("SDS2104X Plus", Family::Sds2000Xp);
        let ctx = TriggerContext {
            family: Family::Sds2000Xp,
            channels: &channels,
            serial_pattern: false,
        };
        let trigger = Trigger::edge(1, 0.125, EdgeSlope::Any);
        push(&pipe, &ctx, &trigger).await.unwrap();
        let pulled = pull(&pipe, &ctx).await.unwrap();
        assert!(pulled.approx_eq(&trigger, 1e-3), "{:?}", pulled);
    }

    #[tokio::test]
    async fn test_dropout_round_trip() {
        let (pipe, _, channels) = setup("SDS2104X Plus", Family::Sds2000Xp);
        let ctx = TriggerContext {
            family: Family::Sds2000Xp,
            channels: &channels,
            serial_pattern: false,
        };
        let mut trigger = Trigger::new(TriggerKind::Dropout, 3).unwrap();
        trigger.set_level(0.8);
        trigger.set_slope(EdgeSlope::Falling);
        let p = trigger.params_mut();
        p.set_int(names::DROPOUT_TIME, 2_000_000_000).unwrap();
        p.set_enum(names::RESET_MODE, "No Edge").unwrap();
        push(&pipe, &ctx, &trigger).await.unwrap();
        let pulled = pull(&pipe, &ctx).await.unwrap();
        assert!(pulled.approx_eq(&trigger, 1e-3), "{:?}", pulled);
    }

    #[tokio::test]
    async fn test_uart_round_trip() {
        let (pipe, _, channels) = setup("SDS2104X Plus", Family::Sds2000Xp);
        let ctx = TriggerContext {
            family: Family::Sds2000Xp,
            channels: &channels,
            serial_pattern: false,
        };
        let mut trigger = Trigger::new(TriggerKind::Uart, 0).unwrap();
        trigger.set_level(1.65);
        let p = trigger.params_mut();
        p.set_int(names::BIT_RATE, 9600).unwrap();
        p.set_enum(names::PARITY, "Odd").unwrap();
        p.set_float(names::STOP_BITS, 2.0).unwrap();
        p.set_enum(names::POLARITY, "Idle Low").unwrap();
        push(&pipe, &ctx, &trigger).await.unwrap();
        let pulled = pull(&pipe, &ctx).await.unwrap();
        assert_eq!(pulled.params().int(names::BIT_RATE), 9600);
        assert_eq!(pulled.params().enum_name(names::PARITY), "Odd");
        assert_eq!(pulled.params().float(names::STOP_BITS), 2.0);
        assert_eq!(pulled.params().enum_name(names::POLARITY), "Idle Low");
        assert!((pulled.level() - 1.65).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_legacy_edge_wire_format() {
        let (pipe, handle, channels) = setup("SDS1202X-E", Family::Sds1000);
        let channels = &channels[..2];
        let ctx = TriggerContext {
            family: Family::Sds1000,
            channels,
            serial_pattern: false,
        };
        let trigger = Trigger::edge(1, -0.5, EdgeSlope::Falling);
        push(&pipe, &ctx, &trigger).await.unwrap();
        assert_eq!(
            handle.commands(),
            vec![
                "TRSE EDGE,SR,C2,HT,OFF".to_string(),
                "C2:TRLV -5.000000e-01".to_string(),
                "C2:TRSL NEG".to_string(),
            ]
        );
        let pulled = pull(&pipe, &ctx).await.unwrap();
        assert!(pulled.approx_eq(&trigger, 1e-3), "{:?}", pulled);
    }

    #[tokio::test]
    async fn test_legacy_rejects_pulse_width() {
        let (pipe, handle, channels) = setup("SDS1202X-E", Family::Sds1000);
        let ctx = TriggerContext {
            family: Family::Sds1000,
            channels: &channels,
            serial_pattern: false,
        };
        let trigger = Trigger::new(TriggerKind::PulseWidth, 0).unwrap();
        assert!(push(&pipe, &ctx, &trigger).await.is_err());
        assert!(handle.commands().is_empty());
    }
}
