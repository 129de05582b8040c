//! Trigger model.
//!
//! A [`Trigger`] is a tagged variant ([`TriggerKind`]) plus a source channel,
//! a level, an optional lower level for two-level variants, and a
//! [`ParameterSet`] holding everything variant-specific. The parameter names
//! are stable: they are what the UI shows and what configuration snapshots
//! store.
//!
//! Changing the variant replaces the trigger. Vendor adapters in the
//! submodules translate a trigger into SCPI (`push`) and rebuild one from the
//! instrument (`pull`).
//!
//! | Variant | Parameters |
//! |---------|------------|
//! | Edge | `Edge` |
//! | PulseWidth, Glitch | `Edge`, `Condition`, `Lower Bound`, `Upper Bound` |
//! | Runt, SlewRate | same, two levels |
//! | Dropout | `Edge`, `Dropout Time`, `Reset Mode` |
//! | Window | `Crossing`, two levels |
//! | Uart | `Bit Rate`, `Parity`, `Stop Bits`, `Polarity`, `Condition`, `Pattern 1`, `Pattern 2` |
//! | Cdr8b10b | `Bit Rate`, `Equalizer`, `Trigger Position`, `Polarity`, `Mode`, `Match Mode`, `Pattern Length`, `Pattern` |

pub mod lecroy;
pub mod siglent;
pub mod tek;

use crate::channel::Channel;
use crate::family::Family;
use scope_core::{
    FilterParameter, ParameterSet, ParameterValue, ScopeError, ScopeResult, Symbol8b10b, Unit,
};
use std::fmt;

/// Parameter names shared by the variants and the vendor adapters.
pub mod names {
    pub const EDGE: &str = "Edge";
    pub const CONDITION: &str = "Condition";
    pub const LOWER_BOUND: &str = "Lower Bound";
    pub const UPPER_BOUND: &str = "Upper Bound";
    pub const DROPOUT_TIME: &str = "Dropout Time";
    pub const RESET_MODE: &str = "Reset Mode";
    pub const CROSSING: &str = "Crossing";
    pub const BIT_RATE: &str = "Bit Rate";
    pub const PARITY: &str = "Parity";
    pub const STOP_BITS: &str = "Stop Bits";
    pub const POLARITY: &str = "Polarity";
    pub const PATTERN_1: &str = "Pattern 1";
    pub const PATTERN_2: &str = "Pattern 2";
    pub const EQUALIZER: &str = "Equalizer";
    pub const TRIGGER_POSITION: &str = "Trigger Position";
    pub const MODE: &str = "Mode";
    pub const MATCH_MODE: &str = "Match Mode";
    pub const PATTERN_LENGTH: &str = "Pattern Length";
    pub const PATTERN: &str = "Pattern";
}

/// Longest 8B/10B pattern in sequence mode.
pub const MAX_SEQUENCE_PATTERN: i64 = 8;
/// Longest 8B/10B pattern in list mode.
pub const MAX_LIST_PATTERN: i64 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TriggerKind {
    Edge,
    PulseWidth,
    Glitch,
    Runt,
    SlewRate,
    Dropout,
    Window,
    Uart,
    Cdr8b10b,
    /// Declared by the instruments but without known semantics.
    NrzPattern,
    /// Declared by the instruments but without known semantics.
    Cdr64b66b,
}

impl TriggerKind {
    /// Variants that carry a second (lower) threshold.
    pub fn is_two_level(&self) -> bool {
        matches!(self, Self::Runt | Self::SlewRate | Self::Window)
    }

    pub fn is_implemented(&self) -> bool {
        !matches!(self, Self::NrzPattern | Self::Cdr64b66b)
    }

    /// Variants that need the serial pattern trigger option.
    pub fn needs_pattern_option(&self) -> bool {
        matches!(self, Self::Cdr8b10b | Self::NrzPattern | Self::Cdr64b66b)
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Edge => "Edge",
            Self::PulseWidth => "Pulse Width",
            Self::Glitch => "Glitch",
            Self::Runt => "Runt",
            Self::SlewRate => "Slew Rate",
            Self::Dropout => "Dropout",
            Self::Window => "Window",
            Self::Uart => "UART",
            Self::Cdr8b10b => "8B/10B (CDR)",
            Self::NrzPattern => "NRZ Pattern",
            Self::Cdr64b66b => "64B/66B (CDR)",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerCondition {
    Less,
    Greater,
    Equal,
    NotEqual,
    Between,
    NotBetween,
    Any,
    LessOrEqual,
    GreaterOrEqual,
}

impl TriggerCondition {
    pub const ALL: [TriggerCondition; 9] = [
        Self::Less,
        Self::Greater,
        Self::Equal,
        Self::NotEqual,
        Self::Between,
        Self::NotBetween,
        Self::Any,
        Self::LessOrEqual,
        Self::GreaterOrEqual,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Less => "Less",
            Self::Greater => "Greater",
            Self::Equal => "Equal",
            Self::NotEqual => "Not Equal",
            Self::Between => "Between",
            Self::NotBetween => "Not Between",
            Self::Any => "Any",
            Self::LessOrEqual => "Less or Equal",
            Self::GreaterOrEqual => "Greater or Equal",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.name() == name)
    }

    fn choices() -> Vec<(String, i64)> {
        Self::ALL
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name().to_string(), i as i64))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeSlope {
    Rising,
    Falling,
    Any,
}

impl EdgeSlope {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Rising => "Rising",
            Self::Falling => "Falling",
            Self::Any => "Any",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Rising" => Some(Self::Rising),
            "Falling" => Some(Self::Falling),
            "Any" => Some(Self::Any),
            _ => None,
        }
    }
}

fn enum_param(choices: &[&str]) -> FilterParameter {
    let pairs: Vec<(&str, i64)> = choices
        .iter()
        .enumerate()
        .map(|(i, name)| (*name, i as i64))
        .collect();
    FilterParameter::enumeration(&pairs)
}

fn length_choices(max: i64) -> Vec<(String, i64)> {
    (1..=max).map(|n| (n.to_string(), n)).collect()
}

/// Mode hook: list mode accepts at most six symbols.
fn clamp_pattern_length(params: &mut ParameterSet) {
    let max = if params.enum_name(names::MODE) == "List" {
        MAX_LIST_PATTERN
    } else {
        MAX_SEQUENCE_PATTERN
    };
    if let Err(e) = params.update(names::PATTERN_LENGTH, |p| {
        p.set_choices(length_choices(max));
        Ok(())
    }) {
        tracing::warn!("Failed to narrow pattern length: {}", e);
    }
}

/// Pattern-length hook: keep the symbol vector the selected length.
fn resize_pattern(params: &mut ParameterSet) {
    let len = params.int(names::PATTERN_LENGTH).max(1) as usize;
    if let Err(e) = params.update(names::PATTERN, |p| {
        let mut pattern = p.as_pattern().to_vec();
        pattern.resize(len, Symbol8b10b::comma());
        p.set_value(ParameterValue::Pattern(pattern))
    }) {
        tracing::warn!("Failed to resize 8b10b pattern: {}", e);
    }
}

fn declare_parameters(kind: TriggerKind, params: &mut ParameterSet) {
    use names::*;
    let edge = || enum_param(&["Rising", "Falling", "Any"]);
    let condition = || {
        let mut p = enum_param(&["Less"]);
        p.set_choices(TriggerCondition::choices());
        p
    };
    match kind {
        TriggerKind::Edge => {
            params.declare(EDGE, edge());
        }
        TriggerKind::PulseWidth
        | TriggerKind::Glitch
        | TriggerKind::Runt
        | TriggerKind::SlewRate => {
            params
                .declare(EDGE, edge())
                .declare(CONDITION, condition())
                .declare(LOWER_BOUND, FilterParameter::int(Unit::Femtoseconds))
                .declare(UPPER_BOUND, FilterParameter::int(Unit::Femtoseconds));
        }
        TriggerKind::Dropout => {
            params
                .declare(EDGE, edge())
                .declare(DROPOUT_TIME, FilterParameter::int(Unit::Femtoseconds))
                .declare(RESET_MODE, enum_param(&["Opposite Edge", "No Edge"]));
        }
        TriggerKind::Window => {
            params.declare(CROSSING, enum_param(&["Enter", "Exit"]));
        }
        TriggerKind::Uart => {
            params
                .declare(BIT_RATE, FilterParameter::int(Unit::BitsPerSecond))
                .declare(PARITY, enum_param(&["None", "Even", "Odd", "Mark", "Space"]))
                .declare(STOP_BITS, FilterParameter::float(Unit::Counts))
                .declare(POLARITY, enum_param(&["Idle High", "Idle Low"]))
                .declare(CONDITION, condition())
                .declare(PATTERN_1, FilterParameter::string())
                .declare(PATTERN_2, FilterParameter::string());
        }
        TriggerKind::Cdr8b10b => {
            let mut length = enum_param(&["1"]);
            length.set_choices(length_choices(MAX_SEQUENCE_PATTERN));
            params
                .declare(BIT_RATE, FilterParameter::int(Unit::BitsPerSecond))
                .declare(EQUALIZER, enum_param(&["None", "Low", "Medium", "High"]))
                .declare(TRIGGER_POSITION, enum_param(&["Start", "End"]))
                .declare(POLARITY, enum_param(&["Normal", "Inverted"]))
                .declare(MODE, enum_param(&["Sequence", "List"]))
                .declare(MATCH_MODE, enum_param(&["Include", "Exclude"]))
                .declare(PATTERN_LENGTH, length)
                .declare(PATTERN, FilterParameter::pattern());
            params.on_change(MODE, clamp_pattern_length);
            params.on_change(PATTERN_LENGTH, resize_pattern);
        }
        TriggerKind::NrzPattern | TriggerKind::Cdr64b66b => {}
    }
}

/// Starting values that differ from the parameter defaults.
fn apply_defaults(kind: TriggerKind, params: &mut ParameterSet) -> ScopeResult<()> {
    use names::*;
    match kind {
        TriggerKind::Uart => {
            params.set_int(BIT_RATE, 115_200)?;
            params.set_float(STOP_BITS, 1.0)?;
            params.set_enum(CONDITION, "Equal")?;
        }
        TriggerKind::Cdr8b10b => {
            params.set_int(BIT_RATE, 1_250_000_000)?;
            params.set_pattern(PATTERN, vec![Symbol8b10b::comma()])?;
        }
        _ => {}
    }
    Ok(())
}

/// A configured trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    kind: TriggerKind,
    source: usize,
    level: f64,
    lower_level: f64,
    params: ParameterSet,
}

impl Trigger {
    /// New trigger of `kind` on channel `source`, with default parameters.
    pub fn new(kind: TriggerKind, source: usize) -> ScopeResult<Self> {
        if !kind.is_implemented() {
            return Err(ScopeError::Unsupported(format!(
                "{} trigger: not implemented",
                kind
            )));
        }
        let mut params = ParameterSet::new();
        declare_parameters(kind, &mut params);
        apply_defaults(kind, &mut params)?;
        Ok(Self {
            kind,
            source,
            level: 0.0,
            lower_level: 0.0,
            params,
        })
    }

    /// Edge trigger shorthand.
    pub fn edge(source: usize, level: f64, slope: EdgeSlope) -> Self {
        let mut params = ParameterSet::new();
        declare_parameters(TriggerKind::Edge, &mut params);
        let mut trigger = Self {
            kind: TriggerKind::Edge,
            source,
            level,
            lower_level: 0.0,
            params,
        };
        trigger.set_slope(slope);
        trigger
    }

    pub fn kind(&self) -> TriggerKind {
        self.kind
    }

    pub fn source(&self) -> usize {
        self.source
    }

    pub fn set_source(&mut self, channel: usize) {
        self.source = channel;
    }

    /// Trigger level, or the upper level for two-level variants.
    pub fn level(&self) -> f64 {
        self.level
    }

    pub fn set_level(&mut self, volts: f64) {
        self.level = volts;
    }

    pub fn lower_level(&self) -> Option<f64> {
        self.kind.is_two_level().then_some(self.lower_level)
    }

    pub fn set_lower_level(&mut self, volts: f64) {
        self.lower_level = volts;
    }

    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut ParameterSet {
        &mut self.params
    }

    pub fn slope(&self) -> EdgeSlope {
        EdgeSlope::from_name(self.params.enum_name(names::EDGE)).unwrap_or(EdgeSlope::Rising)
    }

    pub fn set_slope(&mut self, slope: EdgeSlope) {
        if self.params.contains(names::EDGE) {
            if let Err(e) = self.params.set_enum(names::EDGE, slope.name()) {
                tracing::warn!("Failed to set trigger slope: {}", e);
            }
        }
    }

    pub fn condition(&self) -> Option<TriggerCondition> {
        TriggerCondition::from_name(self.params.enum_name(names::CONDITION))
    }

    pub fn set_condition(&mut self, condition: TriggerCondition) -> ScopeResult<()> {
        self.params.set_enum(names::CONDITION, condition.name())
    }

    /// Lower time bound, femtoseconds.
    pub fn lower_bound(&self) -> i64 {
        self.params.int(names::LOWER_BOUND)
    }

    pub fn upper_bound(&self) -> i64 {
        self.params.int(names::UPPER_BOUND)
    }

    pub fn set_bounds(&mut self, lower_fs: i64, upper_fs: i64) -> ScopeResult<()> {
        self.params.set_int(names::LOWER_BOUND, lower_fs)?;
        self.params.set_int(names::UPPER_BOUND, upper_fs)
    }

    pub fn pattern(&self) -> &[Symbol8b10b] {
        self.params
            .get(names::PATTERN)
            .map(FilterParameter::as_pattern)
            .unwrap_or(&[])
    }

    /// Equal up to instrument quantisation: levels within `level_tolerance`
    /// volts, times and rates within one part in 10^6.
    pub fn approx_eq(&self, other: &Trigger, level_tolerance: f64) -> bool {
        if self.kind != other.kind || self.source != other.source {
            return false;
        }
        if (self.level - other.level).abs() > level_tolerance {
            return false;
        }
        if self.kind.is_two_level() && (self.lower_level - other.lower_level).abs() > level_tolerance
        {
            return false;
        }
        let close = |a: f64, b: f64| (a - b).abs() <= 1e-6 * a.abs().max(b.abs()).max(1.0);
        self.params.iter().all(|(name, p)| {
            let Some(q) = other.params.get(name) else {
                return false;
            };
            match (p.value(), q.value()) {
                (ParameterValue::Int(a), ParameterValue::Int(b)) => close(*a as f64, *b as f64),
                (ParameterValue::Float(a), ParameterValue::Float(b)) => close(*a, *b),
                (a, b) => a == b,
            }
        })
    }
}

// =============================================================================
// Adapter helpers
// =============================================================================

/// What a vendor adapter needs to know about the instrument.
pub struct TriggerContext<'a> {
    pub family: Family,
    pub channels: &'a [Channel],
    pub serial_pattern: bool,
}

impl TriggerContext<'_> {
    pub fn source_name(&self, index: usize) -> ScopeResult<&str> {
        self.channels
            .get(index)
            .map(|c| c.hwname.as_str())
            .ok_or_else(|| ScopeError::InvalidParameter(format!("no channel {}", index)))
    }

    /// Bind a source name read back from the instrument to a channel index.
    pub fn source_index(&self, name: &str) -> ScopeResult<usize> {
        let wanted = name.trim().trim_matches('"').to_ascii_uppercase();
        let wanted = wanted
            .strip_prefix("CHANNEL")
            .map(|n| format!("C{}", n))
            .unwrap_or(wanted);
        self.channels
            .iter()
            .find(|c| c.hwname.eq_ignore_ascii_case(&wanted))
            .map(|c| c.index)
            .ok_or_else(|| ScopeError::parse(name, "trigger source channel"))
    }

    pub(crate) fn check_supported(&self, trigger: &Trigger) -> ScopeResult<()> {
        if !trigger.kind().is_implemented() {
            return Err(ScopeError::Unsupported(format!(
                "{} trigger: not implemented",
                trigger.kind()
            )));
        }
        if trigger.kind().needs_pattern_option() && !self.serial_pattern {
            return Err(ScopeError::Unsupported(format!(
                "{} trigger requires the SERIALPAT_T option",
                trigger.kind()
            )));
        }
        Ok(())
    }
}

/// C-style `%e` formatting (`1.250000e-01`).
pub fn fmt_sci(value: f64) -> String {
    let s = format!("{:.6e}", value);
    match s.split_once('e') {
        Some((mantissa, exp)) => {
            let exp: i32 = exp.parse().unwrap_or(0);
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{}e{}{:02}", mantissa, sign, exp.abs())
        }
        None => s,
    }
}

/// Femtoseconds to seconds, for the wire.
pub fn fs_to_seconds(fs: i64) -> f64 {
    fs as f64 * 1e-15
}

/// Seconds from the wire to femtoseconds.
pub fn seconds_to_fs(seconds: f64) -> i64 {
    (seconds * 1e15).round() as i64
}

/// Log a condition the family cannot express and keep going.
pub(crate) fn warn_unsupported_condition(kind: TriggerKind, condition: Option<TriggerCondition>) {
    tracing::warn!(
        trigger = %kind,
        condition = condition.map(|c| c.name()).unwrap_or("unset"),
        "Trigger condition not supported on this family, ignoring"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use scope_core::{Disparity, SymbolKind};

    #[test]
    fn test_fmt_sci() {
        assert_eq!(fmt_sci(0.125), "1.250000e-01");
        assert_eq!(fmt_sci(-2.0), "-2.000000e+00");
        assert_eq!(fmt_sci(1.5e-9), "1.500000e-09");
        assert_eq!(fmt_sci(0.0), "0.000000e+00");
    }

    #[test]
    fn test_unimplemented_variants() {
        assert!(matches!(
            Trigger::new(TriggerKind::NrzPattern, 0),
            Err(ScopeError::Unsupported(_))
        ));
        assert!(Trigger::new(TriggerKind::Cdr64b66b, 0).is_err());
        assert!(Trigger::new(TriggerKind::Runt, 0).is_ok());
    }

    #[test]
    fn test_protocol_defaults() {
        let uart = Trigger::new(TriggerKind::Uart, 0).unwrap();
        assert_eq!(uart.params().int(names::BIT_RATE), 115_200);
        assert_eq!(uart.params().float(names::STOP_BITS), 1.0);
        assert_eq!(uart.condition(), Some(TriggerCondition::Equal));

        let cdr = Trigger::new(TriggerKind::Cdr8b10b, 0).unwrap();
        assert_eq!(cdr.params().int(names::BIT_RATE), 1_250_000_000);
        assert_eq!(cdr.pattern(), &[Symbol8b10b::comma()]);
    }

    #[test]
    fn test_two_level() {
        let mut t = Trigger::new(TriggerKind::Window, 1).unwrap();
        t.set_level(1.0);
        t.set_lower_level(-1.0);
        assert_eq!(t.lower_level(), Some(-1.0));
        let e = Trigger::edge(0, 0.5, EdgeSlope::Falling);
        assert_eq!(e.lower_level(), None);
        assert_eq!(e.slope(), EdgeSlope::Falling);
    }

    #[test]
    fn test_8b10b_pattern_length_bounds() {
        let mut t = Trigger::new(TriggerKind::Cdr8b10b, 0).unwrap();
        let params = t.params_mut();

        params.set_enum(names::PATTERN_LENGTH, "1").unwrap();
        assert_eq!(params.int(names::PATTERN_LENGTH), 1);
        assert_eq!(t.pattern().len(), 1);

        let params = t.params_mut();
        params.set_enum(names::PATTERN_LENGTH, "8").unwrap();
        assert_eq!(t.pattern().len(), 8);

        // list mode narrows to six and clamps the current length
        let params = t.params_mut();
        params.set_enum(names::MODE, "List").unwrap();
        assert_eq!(params.int(names::PATTERN_LENGTH), 6);
        assert_eq!(
            params.get(names::PATTERN_LENGTH).unwrap().enum_names().len(),
            6
        );
        assert!(params.set_enum(names::PATTERN_LENGTH, "7").is_err());
        assert_eq!(t.pattern().len(), 6);

        let params = t.params_mut();
        params.set_enum(names::MODE, "Sequence").unwrap();
        params.set_enum(names::PATTERN_LENGTH, "8").unwrap();
        assert_eq!(params.int(names::PATTERN_LENGTH), 8);
    }

    #[test]
    fn test_pattern_symbols_survive_resize() {
        let mut t = Trigger::new(TriggerKind::Cdr8b10b, 0).unwrap();
        let sym = Symbol8b10b::new(SymbolKind::D, 0x4a, Disparity::Negative);
        let params = t.params_mut();
        params.set_enum(names::PATTERN_LENGTH, "2").unwrap();
        params
            .set_pattern(names::PATTERN, vec![sym, Symbol8b10b::comma()])
            .unwrap();
        params.set_enum(names::PATTERN_LENGTH, "3").unwrap();
        assert_eq!(t.pattern()[0], sym);
        assert_eq!(t.pattern().len(), 3);
    }

    #[test]
    fn test_approx_eq() {
        let a = Trigger::edge(1, 0.125, EdgeSlope::Rising);
        let b = Trigger::edge(1, 0.1255, EdgeSlope::Rising);
        assert!(a.approx_eq(&b, 1e-3));
        assert!(!a.approx_eq(&b, 1e-4));
        let c = Trigger::edge(1, 0.125, EdgeSlope::Any);
        assert!(!a.approx_eq(&c, 1e-3));
    }
}
