//! Typed parameter dictionary carried by triggers and other filter-like objects.
//!
//! A [`FilterParameter`] is a tagged value (integer, float, enumeration, bool,
//! string, filename or 8B/10B symbol pattern) with a display [`Unit`].
//! Enumerations carry an ordered name ↔ value mapping that may be replaced at
//! runtime, e.g. when a trigger mode change narrows the legal pattern lengths.
//!
//! A [`ParameterSet`] owns the parameters of one object, keyed by name in
//! declaration order. Writes go through the set so that change hooks run:
//!
//! - **Hooks** (`fn(&mut ParameterSet)`) are registered by the owner and may
//!   rewrite sibling parameters. They run first.
//! - **Listeners** (`Arc<dyn Fn(&str, &FilterParameter)>`) are external
//!   observers (UI, logging) and only see the final state.
//!
//! ```rust,ignore
//! let mut params = ParameterSet::new();
//! params.declare("Bit Rate", FilterParameter::int(Unit::BitsPerSecond));
//! params.set_int("Bit Rate", 115_200)?;
//! assert_eq!(params.get("Bit Rate").unwrap().as_int(), 115_200);
//! ```

use crate::error::{ScopeError, ScopeResult};
use crate::units::Unit;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// 8B/10B symbols
// =============================================================================

/// Running disparity a pattern symbol must match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Disparity {
    #[default]
    Any,
    Positive,
    Negative,
}

/// Control (K) or data (D) symbol, or a wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SymbolKind {
    K,
    #[default]
    D,
    DontCare,
}

/// One element of an 8B/10B pattern.
///
/// `value` is the decoded byte; the conventional `D/K x.y` notation uses
/// `x = value & 0x1f` and `y = value >> 5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Symbol8b10b {
    pub disparity: Disparity,
    pub kind: SymbolKind,
    pub value: u8,
}

impl Symbol8b10b {
    pub fn new(kind: SymbolKind, value: u8, disparity: Disparity) -> Self {
        Self {
            disparity,
            kind,
            value,
        }
    }

    /// The K28.5 comma character, the usual alignment symbol.
    pub fn comma() -> Self {
        Self::new(SymbolKind::K, 0xbc, Disparity::Any)
    }

    pub fn x(&self) -> u8 {
        self.value & 0x1f
    }

    pub fn y(&self) -> u8 {
        self.value >> 5
    }
}

impl fmt::Display for Symbol8b10b {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = match self.disparity {
            Disparity::Any => "",
            Disparity::Positive => "+",
            Disparity::Negative => "-",
        };
        match self.kind {
            SymbolKind::DontCare => write!(f, "{}XX", sign),
            SymbolKind::K => write!(f, "{}K{}.{}", sign, self.x(), self.y()),
            SymbolKind::D => write!(f, "{}D{}.{}", sign, self.x(), self.y()),
        }
    }
}

// =============================================================================
// Values
// =============================================================================

/// Current value of a parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    /// Enumeration value (the numeric side of the name ↔ value mapping).
    Enum(i64),
    Bool(bool),
    String(String),
    Filename(String),
    Pattern(Vec<Symbol8b10b>),
}

impl ParameterValue {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Enum(_) => "enum",
            Self::Bool(_) => "bool",
            Self::String(_) => "string",
            Self::Filename(_) => "filename",
            Self::Pattern(_) => "8b10b pattern",
        }
    }
}

/// A single typed parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterParameter {
    value: ParameterValue,
    unit: Unit,
    /// Ordered name ↔ value mapping, enumerations only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    choices: Vec<(String, i64)>,
}

impl FilterParameter {
    pub fn int(unit: Unit) -> Self {
        Self::with_value(ParameterValue::Int(0), unit)
    }

    pub fn float(unit: Unit) -> Self {
        Self::with_value(ParameterValue::Float(0.0), unit)
    }

    pub fn boolean() -> Self {
        Self::with_value(ParameterValue::Bool(false), Unit::Counts)
    }

    pub fn string() -> Self {
        Self::with_value(ParameterValue::String(String::new()), Unit::Counts)
    }

    pub fn filename() -> Self {
        Self::with_value(ParameterValue::Filename(String::new()), Unit::Counts)
    }

    pub fn pattern() -> Self {
        Self::with_value(ParameterValue::Pattern(Vec::new()), Unit::Counts)
    }

    /// Enumeration with the given ordered choices; the first choice is selected.
    pub fn enumeration<S: AsRef<str>>(choices: &[(S, i64)]) -> Self {
        let choices: Vec<(String, i64)> = choices
            .iter()
            .map(|(name, value)| (name.as_ref().to_string(), *value))
            .collect();
        let first = choices.first().map(|(_, v)| *v).unwrap_or(0);
        Self {
            value: ParameterValue::Enum(first),
            unit: Unit::Counts,
            choices,
        }
    }

    fn with_value(value: ParameterValue, unit: Unit) -> Self {
        Self {
            value,
            unit,
            choices: Vec::new(),
        }
    }

    pub fn value(&self) -> &ParameterValue {
        &self.value
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    pub fn is_enum(&self) -> bool {
        matches!(self.value, ParameterValue::Enum(_))
    }

    /// Integer view; floats truncate, enums yield their numeric value.
    pub fn as_int(&self) -> i64 {
        match &self.value {
            ParameterValue::Int(v) | ParameterValue::Enum(v) => *v,
            ParameterValue::Float(v) => *v as i64,
            ParameterValue::Bool(v) => i64::from(*v),
            _ => 0,
        }
    }

    pub fn as_float(&self) -> f64 {
        match &self.value {
            ParameterValue::Float(v) => *v,
            ParameterValue::Int(v) | ParameterValue::Enum(v) => *v as f64,
            ParameterValue::Bool(v) => f64::from(u8::from(*v)),
            _ => 0.0,
        }
    }

    pub fn as_bool(&self) -> bool {
        match &self.value {
            ParameterValue::Bool(v) => *v,
            ParameterValue::Int(v) | ParameterValue::Enum(v) => *v != 0,
            ParameterValue::Float(v) => *v != 0.0,
            _ => false,
        }
    }

    /// Selected enumeration name, or `None` for non-enums and unmapped values.
    pub fn enum_name(&self) -> Option<&str> {
        match self.value {
            ParameterValue::Enum(v) => self
                .choices
                .iter()
                .find(|(_, value)| *value == v)
                .map(|(name, _)| name.as_str()),
            _ => None,
        }
    }

    pub fn enum_names(&self) -> Vec<&str> {
        self.choices.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn choices(&self) -> &[(String, i64)] {
        &self.choices
    }

    pub fn as_pattern(&self) -> &[Symbol8b10b] {
        match &self.value {
            ParameterValue::Pattern(p) => p,
            _ => &[],
        }
    }

    /// Replace the enumeration mapping. If the current value is no longer
    /// legal it is clamped to the nearest remaining value.
    pub fn set_choices(&mut self, choices: Vec<(String, i64)>) {
        self.choices = choices;
        if let ParameterValue::Enum(current) = self.value {
            if !self.choices.iter().any(|(_, v)| *v == current) {
                if let Some(nearest) = self
                    .choices
                    .iter()
                    .map(|(_, v)| *v)
                    .min_by_key(|v| (v - current).abs())
                {
                    self.value = ParameterValue::Enum(nearest);
                }
            }
        }
    }

    fn check_kind(&self, incoming: &ParameterValue) -> ScopeResult<()> {
        let compatible = matches!(
            (&self.value, incoming),
            (ParameterValue::Int(_), ParameterValue::Int(_))
                | (ParameterValue::Float(_), ParameterValue::Float(_))
                | (ParameterValue::Enum(_), ParameterValue::Enum(_))
                | (ParameterValue::Bool(_), ParameterValue::Bool(_))
                | (ParameterValue::String(_), ParameterValue::String(_))
                | (ParameterValue::Filename(_), ParameterValue::Filename(_))
                | (ParameterValue::Pattern(_), ParameterValue::Pattern(_))
        );
        if compatible {
            Ok(())
        } else {
            Err(ScopeError::InvalidParameter(format!(
                "cannot store {} in a {} parameter",
                incoming.type_name(),
                self.value.type_name()
            )))
        }
    }

    /// Store a value of matching type. Enum values must be one of the choices.
    pub fn set_value(&mut self, value: ParameterValue) -> ScopeResult<()> {
        self.check_kind(&value)?;
        if let ParameterValue::Enum(v) = value {
            if !self.choices.iter().any(|(_, c)| *c == v) {
                return Err(ScopeError::InvalidParameter(format!(
                    "enum value {} not in {:?}",
                    v,
                    self.enum_names()
                )));
            }
        }
        self.value = value;
        Ok(())
    }

    /// Select an enumeration entry by name.
    pub fn set_enum_name(&mut self, name: &str) -> ScopeResult<()> {
        let value = self
            .choices
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
            .ok_or_else(|| {
                ScopeError::InvalidParameter(format!(
                    "'{}' is not one of {:?}",
                    name,
                    self.enum_names()
                ))
            })?;
        self.set_value(ParameterValue::Enum(value))
    }

    /// Parse a user string according to the parameter type and unit.
    pub fn parse_and_set(&mut self, text: &str) -> ScopeResult<()> {
        let value = match &self.value {
            ParameterValue::Int(_) => ParameterValue::Int(self.unit.parse(text)?.round() as i64),
            ParameterValue::Float(_) => ParameterValue::Float(self.unit.parse(text)?),
            ParameterValue::Enum(_) => return self.set_enum_name(text.trim()),
            ParameterValue::Bool(_) => match text.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => ParameterValue::Bool(true),
                "0" | "false" | "off" | "no" => ParameterValue::Bool(false),
                _ => return Err(ScopeError::parse(text, "bool")),
            },
            ParameterValue::String(_) => ParameterValue::String(text.to_string()),
            ParameterValue::Filename(_) => ParameterValue::Filename(text.to_string()),
            ParameterValue::Pattern(_) => {
                return Err(ScopeError::InvalidParameter(
                    "8b10b patterns cannot be parsed from text".into(),
                ))
            }
        };
        self.set_value(value)
    }
}

impl fmt::Display for FilterParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            ParameterValue::Int(v) => write!(f, "{}", self.unit.pretty_print(*v as f64)),
            ParameterValue::Float(v) => write!(f, "{}", self.unit.pretty_print(*v)),
            ParameterValue::Enum(v) => match self.enum_name() {
                Some(name) => write!(f, "{}", name),
                None => write!(f, "{}", v),
            },
            ParameterValue::Bool(v) => write!(f, "{}", v),
            ParameterValue::String(s) | ParameterValue::Filename(s) => write!(f, "{}", s),
            ParameterValue::Pattern(p) => {
                let parts: Vec<String> = p.iter().map(ToString::to_string).collect();
                write!(f, "{}", parts.join(" "))
            }
        }
    }
}

// =============================================================================
// ParameterSet
// =============================================================================

/// Internal hook run after a named parameter changes.
pub type ChangeHook = fn(&mut ParameterSet);

/// External observer notified after every change.
pub type ChangeListener = Arc<dyn Fn(&str, &FilterParameter) + Send + Sync>;

/// Ordered, name-addressed collection of parameters with change notification.
#[derive(Clone, Default)]
pub struct ParameterSet {
    params: Vec<(String, FilterParameter)>,
    hooks: Vec<(String, ChangeHook)>,
    listeners: Vec<ChangeListener>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a parameter. Names are unique; a second declaration of the
    /// same name is ignored.
    pub fn declare(&mut self, name: impl Into<String>, param: FilterParameter) -> &mut Self {
        let name = name.into();
        if self.contains(&name) {
            tracing::warn!(parameter = %name, "Duplicate parameter declaration ignored");
        } else {
            self.params.push((name, param));
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.iter().any(|(n, _)| n == name)
    }

    pub fn get(&self, name: &str) -> Option<&FilterParameter> {
        self.params.iter().find(|(n, _)| n == name).map(|(_, p)| p)
    }

    fn get_mut(&mut self, name: &str) -> ScopeResult<&mut FilterParameter> {
        self.params
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p)
            .ok_or_else(|| ScopeError::InvalidParameter(format!("no parameter named '{}'", name)))
    }

    pub fn names(&self) -> Vec<&str> {
        self.params.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FilterParameter)> {
        self.params.iter().map(|(n, p)| (n.as_str(), p))
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Register an internal hook for `name`.
    pub fn on_change(&mut self, name: impl Into<String>, hook: ChangeHook) {
        self.hooks.push((name.into(), hook));
    }

    /// Register an external observer.
    pub fn subscribe(&mut self, listener: ChangeListener) {
        self.listeners.push(listener);
    }

    /// Mutate a parameter in place, then notify.
    pub fn update<F>(&mut self, name: &str, f: F) -> ScopeResult<()>
    where
        F: FnOnce(&mut FilterParameter) -> ScopeResult<()>,
    {
        f(self.get_mut(name)?)?;
        self.notify(name);
        Ok(())
    }

    pub fn set(&mut self, name: &str, value: ParameterValue) -> ScopeResult<()> {
        self.update(name, |p| p.set_value(value))
    }

    pub fn set_int(&mut self, name: &str, value: i64) -> ScopeResult<()> {
        self.set(name, ParameterValue::Int(value))
    }

    pub fn set_float(&mut self, name: &str, value: f64) -> ScopeResult<()> {
        self.set(name, ParameterValue::Float(value))
    }

    pub fn set_bool(&mut self, name: &str, value: bool) -> ScopeResult<()> {
        self.set(name, ParameterValue::Bool(value))
    }

    pub fn set_string(&mut self, name: &str, value: impl Into<String>) -> ScopeResult<()> {
        self.set(name, ParameterValue::String(value.into()))
    }

    pub fn set_enum(&mut self, name: &str, choice: &str) -> ScopeResult<()> {
        self.update(name, |p| p.set_enum_name(choice))
    }

    pub fn set_pattern(&mut self, name: &str, pattern: Vec<Symbol8b10b>) -> ScopeResult<()> {
        self.set(name, ParameterValue::Pattern(pattern))
    }

    /// Float value of `name`, 0.0 if absent.
    pub fn float(&self, name: &str) -> f64 {
        self.get(name).map(FilterParameter::as_float).unwrap_or(0.0)
    }

    /// Integer value of `name`, 0 if absent.
    pub fn int(&self, name: &str) -> i64 {
        self.get(name).map(FilterParameter::as_int).unwrap_or(0)
    }

    pub fn boolean(&self, name: &str) -> bool {
        self.get(name).map(FilterParameter::as_bool).unwrap_or(false)
    }

    /// String or filename value of `name`, empty if absent.
    pub fn string(&self, name: &str) -> &str {
        match self.get(name).map(FilterParameter::value) {
            Some(ParameterValue::String(s)) | Some(ParameterValue::Filename(s)) => s,
            _ => "",
        }
    }

    /// Selected enum name of `name`, empty if absent.
    pub fn enum_name(&self, name: &str) -> &str {
        self.get(name).and_then(FilterParameter::enum_name).unwrap_or("")
    }

    fn notify(&mut self, name: &str) {
        let hooks: Vec<ChangeHook> = self
            .hooks
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, h)| *h)
            .collect();
        for hook in hooks {
            hook(self);
        }
        if let Some(param) = self.get(name) {
            for listener in &self.listeners {
                listener(name, param);
            }
        }
    }

    /// Plain values keyed by name, for persistence and comparison.
    pub fn snapshot(&self) -> BTreeMap<String, ParameterValue> {
        self.params
            .iter()
            .map(|(n, p)| (n.clone(), p.value.clone()))
            .collect()
    }

    /// Load values from a snapshot. Unknown names are skipped with a warning;
    /// hooks run for every restored parameter, in declaration order.
    pub fn restore(&mut self, snapshot: &BTreeMap<String, ParameterValue>) -> ScopeResult<()> {
        let names: Vec<String> = self.params.iter().map(|(n, _)| n.clone()).collect();
        for name in &names {
            if let Some(value) = snapshot.get(name) {
                self.set(name, value.clone())?;
            }
        }
        for name in snapshot.keys() {
            if !names.contains(name) {
                tracing::warn!(parameter = %name, "Ignoring unknown parameter in snapshot");
            }
        }
        Ok(())
    }
}

impl PartialEq for ParameterSet {
    fn eq(&self, other: &Self) -> bool {
        self.params == other.params
    }
}

impl fmt::Debug for ParameterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.params.iter().map(|(n, p)| (n, p.to_string())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn length_choices(max: i64) -> Vec<(String, i64)> {
        (1..=max).map(|n| (n.to_string(), n)).collect()
    }

    fn clamp_length(params: &mut ParameterSet) {
        let max = if params.enum_name("Mode") == "List" { 6 } else { 8 };
        let _ = params.update("Length", |p| {
            p.set_choices(length_choices(max));
            Ok(())
        });
    }

    #[test]
    fn test_enum_roundtrip() {
        let mut p = FilterParameter::enumeration(&[("Rising", 0), ("Falling", 1), ("Any", 2)]);
        assert_eq!(p.enum_name(), Some("Rising"));
        p.set_enum_name("Falling").unwrap();
        assert_eq!(p.as_int(), 1);
        assert!(p.set_enum_name("Sideways").is_err());
        assert!(p.set_value(ParameterValue::Enum(9)).is_err());
        assert_eq!(p.enum_name(), Some("Falling"));
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let mut p = FilterParameter::float(Unit::Volts);
        assert!(p.set_value(ParameterValue::Int(3)).is_err());
        p.parse_and_set("250 mV").unwrap();
        assert!((p.as_float() - 0.25).abs() < 1e-12);
        assert_eq!(p.to_string(), "250.000 mV");
    }

    #[test]
    fn test_duplicate_declaration_keeps_first() {
        let mut set = ParameterSet::new();
        set.declare("Level", FilterParameter::float(Unit::Volts));
        set.declare("Level", FilterParameter::int(Unit::Counts));
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("Level").unwrap().unit(), Unit::Volts);
    }

    #[test]
    fn test_hook_clamps_choices() {
        let mut set = ParameterSet::new();
        set.declare(
            "Mode",
            FilterParameter::enumeration(&[("Sequence", 0), ("List", 1)]),
        );
        let mut length = FilterParameter::enumeration(&[("1", 1)]);
        length.set_choices(length_choices(8));
        set.declare("Length", length);
        set.on_change("Mode", clamp_length);

        set.set_enum("Length", "8").unwrap();
        set.set_enum("Mode", "List").unwrap();
        assert_eq!(set.get("Length").unwrap().enum_names().len(), 6);
        assert_eq!(set.int("Length"), 6);

        set.set_enum("Mode", "Sequence").unwrap();
        assert_eq!(set.get("Length").unwrap().enum_names().len(), 8);
        set.set_enum("Length", "8").unwrap();
        assert_eq!(set.int("Length"), 8);
    }

    #[test]
    fn test_listener_sees_changes() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let mut set = ParameterSet::new();
        set.declare("Bit Rate", FilterParameter::int(Unit::BitsPerSecond));
        set.subscribe(Arc::new(move |name, param| {
            assert_eq!(name, "Bit Rate");
            assert_eq!(param.as_int(), 9600);
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        set.set_int("Bit Rate", 9600).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(set.set_int("Missing", 1).is_err());
    }

    #[test]
    fn test_snapshot_restore() {
        let mut set = ParameterSet::new();
        set.declare("Level", FilterParameter::float(Unit::Volts));
        set.declare("Invert", FilterParameter::boolean());
        set.set_float("Level", 0.5).unwrap();
        set.set_bool("Invert", true).unwrap();
        let snap = set.snapshot();

        let mut other = ParameterSet::new();
        other.declare("Level", FilterParameter::float(Unit::Volts));
        other.declare("Invert", FilterParameter::boolean());
        other.restore(&snap).unwrap();
        assert_eq!(set, other);
    }

    #[test]
    fn test_value_serialization() {
        let value = ParameterValue::Pattern(vec![Symbol8b10b::comma()]);
        let json = serde_json::to_string(&value).unwrap();
        assert!(json.contains("\"type\":\"pattern\""));
        let back: ParameterValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_symbol_notation() {
        assert_eq!(Symbol8b10b::comma().to_string(), "K28.5");
        let sym = Symbol8b10b::new(SymbolKind::D, 0x4a, Disparity::Negative);
        assert_eq!(sym.to_string(), "-D10.2");
    }
}
