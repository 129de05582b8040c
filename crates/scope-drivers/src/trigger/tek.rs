//! MSO5/MSO6 trigger tree (`TRIGger:A:*`).
//!
//! Levels live per source (`TRIG:A:LEV:CHn`, `TRIG:A:UPP:CHn`,
//! `TRIG:A:LOW:CHn`), not per trigger type.

use super::{
    fs_to_seconds, names, seconds_to_fs, warn_unsupported_condition, EdgeSlope, Trigger,
    TriggerCondition, TriggerContext, TriggerKind,
};
use scope_core::{ScopeError, ScopeResult};
use scope_scpi::ScpiPipeline;

fn type_name(kind: TriggerKind) -> Option<&'static str> {
    match kind {
        TriggerKind::Edge => Some("EDGE"),
        TriggerKind::PulseWidth => Some("WIDTH"),
        TriggerKind::Runt => Some("RUNT"),
        TriggerKind::SlewRate => Some("TRANSITION"),
        TriggerKind::Dropout => Some("TIMEOUT"),
        TriggerKind::Window => Some("WINDOW"),
        _ => None,
    }
}

/// Subtree holding the per-type settings.
fn subtree(kind: TriggerKind) -> &'static str {
    match kind {
        TriggerKind::PulseWidth => "PULSEWIDTH",
        TriggerKind::Runt => "RUNT",
        TriggerKind::SlewRate => "TRANSITION",
        TriggerKind::Dropout => "TIMEOUT",
        TriggerKind::Window => "WINDOW",
        _ => "EDGE",
    }
}

fn polarity(kind: TriggerKind, slope: EdgeSlope) -> &'static str {
    match (kind, slope) {
        (TriggerKind::Edge, EdgeSlope::Rising) => "RISE",
        (TriggerKind::Edge, EdgeSlope::Falling) => "FALL",
        (TriggerKind::Dropout, EdgeSlope::Rising) => "STAYSHIGH",
        (TriggerKind::Dropout, EdgeSlope::Falling) => "STAYSLOW",
        (TriggerKind::PulseWidth, EdgeSlope::Falling) => "NEGATIVE",
        (TriggerKind::PulseWidth, _) => "POSITIVE",
        (_, EdgeSlope::Rising) => "POSITIVE",
        (_, EdgeSlope::Falling) => "NEGATIVE",
        (_, EdgeSlope::Any) => "EITHER",
    }
}

fn parse_polarity(s: &str) -> EdgeSlope {
    let s = s.to_ascii_uppercase();
    if s.starts_with("RIS") || s.starts_with("POS") || s.starts_with("STAYSH") {
        EdgeSlope::Rising
    } else if s.starts_with("FALL") || s.starts_with("NEG") || s.starts_with("STAYSL") {
        EdgeSlope::Falling
    } else {
        EdgeSlope::Any
    }
}

fn condition_name(kind: TriggerKind, condition: TriggerCondition) -> Option<&'static str> {
    match (kind, condition) {
        (TriggerKind::SlewRate, TriggerCondition::Less) => Some("FASTER"),
        (TriggerKind::SlewRate, TriggerCondition::Greater) => Some("SLOWER"),
        (_, TriggerCondition::Less) => Some("LESSTHAN"),
        (_, TriggerCondition::Greater) => Some("MORETHAN"),
        (_, TriggerCondition::Equal) => Some("EQUAL"),
        (_, TriggerCondition::NotEqual) => Some("UNEQUAL"),
        (TriggerKind::PulseWidth, TriggerCondition::Between) => Some("WITHIN"),
        (TriggerKind::PulseWidth, TriggerCondition::NotBetween) => Some("OUTSIDE"),
        (TriggerKind::Runt, TriggerCondition::Any) => Some("OCCURS"),
        _ => None,
    }
}

fn parse_condition(s: &str) -> Option<TriggerCondition> {
    let s = s.to_ascii_uppercase();
    Some(match s.as_str() {
        x if x.starts_with("LESS") || x.starts_with("FAST") => TriggerCondition::Less,
        x if x.starts_with("MORE") || x.starts_with("SLOW") => TriggerCondition::Greater,
        x if x.starts_with("EQ") => TriggerCondition::Equal,
        x if x.starts_with("UNEQ") => TriggerCondition::NotEqual,
        x if x.starts_with("WIT") => TriggerCondition::Between,
        x if x.starts_with("OUT") => TriggerCondition::NotBetween,
        x if x.starts_with("OCC") => TriggerCondition::Any,
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
    let kind = trigger.kind();
    let Some(ty) = type_name(kind) else {
        return Err(ScopeError::Unsupported(format!(
            "{} trigger on {}",
            kind, ctx.family
        )));
    };
    let source = ctx.source_name(trigger.source())?;
    let tree = subtree(kind);

    pipe.send_queued(format!("TRIGGER:A:TYPE {}", ty));
    pipe.send_queued(format!("TRIGGER:A:{}:SOURCE {}", tree, source));
    if kind.is_two_level() {
        pipe.send_queued(format!("TRIGGER:A:UPPERTHRESHOLD:{} {}", source, trigger.level()));
        pipe.send_queued(format!(
            "TRIGGER:A:LOWERTHRESHOLD:{} {}",
            source,
            trigger.lower_level().unwrap_or_default()
        ));
    } else {
        pipe.send_queued(format!("TRIGGER:A:LEVEL:{} {}", source, trigger.level()));
    }

    match kind {
        TriggerKind::Edge => {
            pipe.send_queued(format!(
                "TRIGGER:A:EDGE:SLOPE {}",
                polarity(kind, trigger.slope())
            ));
        }
        TriggerKind::PulseWidth | TriggerKind::Runt | TriggerKind::SlewRate => {
            pipe.send_queued(format!(
                "TRIGGER:A:{}:POLARITY {}",
                tree,
                polarity(kind, trigger.slope())
            ));
            match trigger.condition().and_then(|c| condition_name(kind, c)) {
                Some(c) => pipe.send_queued(format!("TRIGGER:A:{}:WHEN {}", tree, c)),
                None => warn_unsupported_condition(kind, trigger.condition()),
            }
            match kind {
                TriggerKind::PulseWidth => {
                    pipe.send_queued(format!(
                        "TRIGGER:A:PULSEWIDTH:LOWLIMIT {:e}",
                        fs_to_seconds(trigger.lower_bound())
                    ));
                    pipe.send_queued(format!(
                        "TRIGGER:A:PULSEWIDTH:HIGHLIMIT {:e}",
                        fs_to_seconds(trigger.upper_bound())
                    ));
                }
                TriggerKind::Runt => {
                    pipe.send_queued(format!(
                        "TRIGGER:A:RUNT:WIDTH {:e}",
                        fs_to_seconds(trigger.upper_bound())
                    ));
                }
                _ => {
                    pipe.send_queued(format!(
                        "TRIGGER:A:TRANSITION:DELTATIME {:e}",
                        fs_to_seconds(trigger.upper_bound())
                    ));
                }
            }
        }
        TriggerKind::Dropout => {
            let p = trigger.params();
            pipe.send_queued(format!(
                "TRIGGER:A:TIMEOUT:POLARITY {}",
                polarity(kind, trigger.slope())
            ));
            pipe.send_queued(format!(
                "TRIGGER:A:TIMEOUT:TIME {:e}",
                fs_to_seconds(p.int(names::DROPOUT_TIME))
            ));
            if p.enum_name(names::RESET_MODE) != "Opposite Edge" {
                tracing::warn!("Dropout reset mode is fixed on this family, ignoring");
            }
        }
        TriggerKind::Window => {
            let when = if trigger.params().enum_name(names::CROSSING) == "Exit" {
                "EXITSWINDOW"
            } else {
                "ENTERSWINDOW"
            };
            pipe.send_queued(format!("TRIGGER:A:WINDOW:WHEN {}", when));
        }
        _ => {}
    }
    pipe.flush().await
}

async fn get(pipe: &ScpiPipeline, query: &str) -> ScopeResult<String> {
    Ok(pipe.query(query).await?.trim().trim_matches('"').to_string())
}

/// Read the active trigger back from the instrument.
pub async fn pull(pipe: &ScpiPipeline, ctx: &TriggerContext<'_>) -> ScopeResult<Trigger> {
    let ty = get(pipe, "TRIGGER:A:TYPE?").await?.to_ascii_uppercase();
    let kind = if ty.starts_with("EDG") {
        TriggerKind::Edge
    } else if ty.starts_with("WID") || ty.starts_with("PULSEW") {
        TriggerKind::PulseWidth
    } else if ty.starts_with("RUNT") {
        TriggerKind::Runt
    } else if ty.starts_with("TRAN") {
        TriggerKind::SlewRate
    } else if ty.starts_with("TIMEO") {
        TriggerKind::Dropout
    } else if ty.starts_with("WIN") {
        TriggerKind::Window
    } else {
        tracing::warn!(trigger_type = %ty, "Unsupported trigger type, using edge");
        TriggerKind::Edge
    };
    let tree = subtree(kind);
    let source_name = get(pipe, &format!("TRIGGER:A:{}:SOURCE?", tree)).await?;
    let source = ctx.source_index(&source_name)?;
    let source_name = ctx.source_name(source)?.to_string();
    let mut trigger = Trigger::new(kind, source)?;

    if kind.is_two_level() {
        trigger.set_level(
            pipe.query_f64(&format!("TRIGGER:A:UPPERTHRESHOLD:{}?", source_name))
                .await?,
        );
        trigger.set_lower_level(
            pipe.query_f64(&format!("TRIGGER:A:LOWERTHRESHOLD:{}?", source_name))
                .await?,
        );
    } else {
        trigger.set_level(
            pipe.query_f64(&format!("TRIGGER:A:LEVEL:{}?", source_name))
                .await?,
        );
    }

    match kind {
        TriggerKind::Edge => {
            trigger.set_slope(parse_polarity(&get(pipe, "TRIGGER:A:EDGE:SLOPE?").await?));
        }
        TriggerKind::PulseWidth | TriggerKind::Runt | TriggerKind::SlewRate => {
            trigger.set_slope(parse_polarity(
                &get(pipe, &format!("TRIGGER:A:{}:POLARITY?", tree)).await?,
            ));
            if let Some(c) = parse_condition(&get(pipe, &format!("TRIGGER:A:{}:WHEN?", tree)).await?)
            {
                trigger.set_condition(c)?;
            }
            let (low, high) = match kind {
                TriggerKind::PulseWidth => (
                    pipe.query_f64("TRIGGER:A:PULSEWIDTH:LOWLIMIT?").await?,
                    pipe.query_f64("TRIGGER:A:PULSEWIDTH:HIGHLIMIT?").await?,
                ),
                TriggerKind::Runt => (0.0, pipe.query_f64("TRIGGER:A:RUNT:WIDTH?").await?),
                _ => (0.0, pipe.query_f64("TRIGGER:A:TRANSITION:DELTATIME?").await?),
            };
            trigger.set_bounds(seconds_to_fs(low), seconds_to_fs(high))?;
        }
        TriggerKind::Dropout => {
            trigger.set_slope(parse_polarity(
                &get(pipe, "TRIGGER:A:TIMEOUT:POLARITY?").await?,
            ));
            let time = pipe.query_f64("TRIGGER:A:TIMEOUT:TIME?").await?;
            trigger
                .params_mut()
                .set_int(names::DROPOUT_TIME, seconds_to_fs(time))?;
        }
        TriggerKind::Window => {
            let when = get(pipe, "TRIGGER:A:WINDOW:WHEN?").await?.to_ascii_uppercase();
            let crossing = if when.starts_with("EXIT") { "Exit" } else { "Enter" };
            trigger.params_mut().set_enum(names::CROSSING, crossing)?;
        }
        _ => {}
    }
    Ok(trigger)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::enumerate_channels;
    use crate::family::Family;
    use crate::options::InstrumentOptions;
    use crate::sim::tek::TekSim;
    use scope_scpi::MockTransport;

    fn setup() -> (ScpiPipeline, Vec<crate::channel::Channel>) {
        let transport = MockTransport::new(TekSim::new("MSO64", ""));
        let channels = enumerate_channels(Family::TekMso6, 4, &InstrumentOptions::default());
        (ScpiPipeline::new(Box::new(transport)), channels)
    }

    #[tokio::test]
    async fn test_edge_round_trip() {
        let (pipe, channels) = setup();
        let ctx = TriggerContext {
            family: Family::TekMso6,
            channels: &channels,
            serial_pattern: false,
        };
        let trigger = Trigger::edge(2, -0.3, EdgeSlope::Falling);
        push(&pipe, &ctx, &trigger).await.unwrap();
        let pulled = pull(&pipe, &ctx).await.unwrap();
        assert!(pulled.approx_eq(&trigger, 1e-3), "{:?}", pulled);
    }

    #[tokio::test]
    async fn test_pulse_width_round_trip() {
        let (pipe, channels) = setup();
        let ctx = TriggerContext {
            family: Family::TekMso6,
            channels: &channels,
            serial_pattern: false,
        };
        let mut trigger = Trigger::new(TriggerKind::PulseWidth, 0).unwrap();
        trigger.set_level(1.5);
        trigger.set_condition(TriggerCondition::NotBetween).unwrap();
        trigger.set_bounds(5_000_000, 50_000_000).unwrap();
        push(&pipe, &ctx, &trigger).await.unwrap();
        let pulled = pull(&pipe, &ctx).await.unwrap();
        assert!(pulled.approx_eq(&trigger, 1e-3), "{:?}", pulled);
    }

    #[tokio::test]
    async fn test_window_round_trip() {
        let (pipe, channels) = setup();
        let ctx = TriggerContext {
            family: Family::TekMso6,
            channels: &channels,
            serial_pattern: false,
        };
        let mut trigger = Trigger::new(TriggerKind::Window, 1).unwrap();
        trigger.set_level(2.0);
        trigger.set_lower_level(-2.0);
        trigger
            .params_mut()
            .set_enum(names::CROSSING, "Exit")
            .unwrap();
        push(&pipe, &ctx, &trigger).await.unwrap();
        let pulled = pull(&pipe, &ctx).await.unwrap();
        assert!(pulled.approx_eq(&trigger, 1e-3), "{:?}", pulled);
    }

    #[tokio::test]
    async fn test_uart_unsupported() {
        let (pipe, channels) = setup();
        let ctx = TriggerContext {
            family: Family::TekMso6,
            channels: &channels,
            serial_pattern: false,
        };
        let trigger = Trigger::new(TriggerKind::Uart, 0).unwrap();
        assert!(matches!(
            push(&pipe, &ctx, &trigger).await,
            Err(ScopeError::Unsupported(_))
        ));
    }
}
