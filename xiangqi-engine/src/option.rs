//! Typed engine options and the case-insensitive option map.

use std::collections::HashMap;
use std::fmt::{self, Display};

use crate::error::EngineError;

/// Options the driver manages automatically; setting them through
/// `configure` is rejected.
const MANAGED_OPTIONS: [&str; 4] = ["uci_chess960", "uci_variant", "multipv", "ponder"];

/// A configuration value for an engine option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    /// No value; used by button-like options.
    None,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::None => Ok(()),
            OptionValue::Bool(value) => write!(f, "{value}"),
            OptionValue::Int(value) => write!(f, "{value}"),
            OptionValue::Str(value) => write!(f, "{value}"),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Bool(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Int(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Str(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        OptionValue::Str(value)
    }
}

/// The type of an engine option.
///
/// `Check`, `Spin`, `Combo`, `Button` and `Str` exist in both dialects;
/// `File`, `Path`, `Reset` and `Save` are XBoard extras.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Check,
    Spin,
    Combo,
    Button,
    Str,
    File,
    Path,
    Reset,
    Save,
}

impl OptionKind {
    pub fn from_name(name: &str) -> Option<OptionKind> {
        match name {
            "check" => Some(OptionKind::Check),
            "spin" => Some(OptionKind::Spin),
            "combo" => Some(OptionKind::Combo),
            "button" => Some(OptionKind::Button),
            "string" => Some(OptionKind::Str),
            "file" => Some(OptionKind::File),
            "path" => Some(OptionKind::Path),
            "reset" => Some(OptionKind::Reset),
            "save" => Some(OptionKind::Save),
            _ => None,
        }
    }
}

/// An option advertised by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOption {
    pub name: String,
    pub kind: OptionKind,
    /// Default value, [`OptionValue::None`] when the option has none.
    pub default: OptionValue,
    /// Minimum value of a spin option.
    pub min: Option<i64>,
    /// Maximum value of a spin option.
    pub max: Option<i64>,
    /// Allowed values of a combo option.
    pub var: Vec<String>,
}

impl EngineOption {
    /// Coerces and validates a host supplied value for this option.
    pub fn parse(&self, value: &OptionValue) -> Result<OptionValue, EngineError> {
        match self.kind {
            OptionKind::Check => Ok(OptionValue::Bool(match value {
                OptionValue::Bool(b) => *b,
                OptionValue::Int(i) => *i != 0,
                OptionValue::Str(s) => !s.is_empty() && s != "false",
                OptionValue::None => false,
            })),
            OptionKind::Spin => {
                let number = match value {
                    OptionValue::Int(i) => *i,
                    OptionValue::Bool(b) => i64::from(*b),
                    OptionValue::Str(s) => s.trim().parse().map_err(|_| {
                        EngineError::InvalidValue(format!(
                            "expected integer for spin option {:?}, got: {:?}",
                            self.name, s
                        ))
                    })?,
                    OptionValue::None => {
                        return Err(EngineError::InvalidValue(format!(
                            "expected integer for spin option {:?}, got nothing",
                            self.name
                        )))
                    }
                };
                if let Some(min) = self.min {
                    if number < min {
                        return Err(EngineError::InvalidValue(format!(
                            "expected value for option {:?} to be at least {}, got: {}",
                            self.name, min, number
                        )));
                    }
                }
                if let Some(max) = self.max {
                    if number > max {
                        return Err(EngineError::InvalidValue(format!(
                            "expected value for option {:?} to be at most {}, got: {}",
                            self.name, max, number
                        )));
                    }
                }
                Ok(OptionValue::Int(number))
            }
            OptionKind::Combo => {
                let text = value.to_string();
                if !self.var.iter().any(|choice| choice == &text) {
                    return Err(EngineError::InvalidValue(format!(
                        "invalid value for combo option {:?}, got: {} (available: {})",
                        self.name,
                        text,
                        if self.var.is_empty() { "-".to_string() } else { self.var.join(", ") }
                    )));
                }
                Ok(OptionValue::Str(text))
            }
            OptionKind::Button | OptionKind::Reset | OptionKind::Save => Ok(OptionValue::None),
            OptionKind::Str | OptionKind::File | OptionKind::Path => {
                let text = value.to_string();
                if text.contains('\n') || text.contains('\r') {
                    return Err(EngineError::InvalidValue(format!(
                        "invalid line-break in string option {:?}: {:?}",
                        self.name, text
                    )));
                }
                Ok(OptionValue::Str(text))
            }
        }
    }

    /// Whether the driver manages this option automatically.
    pub fn is_managed(&self) -> bool {
        is_managed(&self.name)
    }
}

pub(crate) fn is_managed(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    MANAGED_OPTIONS.contains(&lower.as_str())
}

/// Union of per-call options and the steady-state target configuration;
/// the caller wins on (case-insensitive) name collisions.
pub(crate) fn chain_config(
    options: &[(String, OptionValue)],
    target: &OptionMap<OptionValue>,
) -> Vec<(String, OptionValue)> {
    let mut merged: Vec<(String, OptionValue)> = options.to_vec();
    for (name, value) in target.iter() {
        if !options.iter().any(|(set, _)| set.eq_ignore_ascii_case(name)) {
            merged.push((name.to_string(), value.clone()));
        }
    }
    merged
}

/// Name-keyed map with case-insensitive lookup but preservation of the
/// last inserted casing on iteration.
#[derive(Debug, Clone)]
pub struct OptionMap<T> {
    store: HashMap<String, (String, T)>,
}

impl<T> OptionMap<T> {
    pub fn new() -> OptionMap<T> {
        OptionMap { store: HashMap::new() }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: T) {
        let name = name.into();
        self.store.insert(name.to_ascii_lowercase(), (name, value));
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.store.get(&name.to_ascii_lowercase()).map(|(_, value)| value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.store.contains_key(&name.to_ascii_lowercase())
    }

    pub fn remove(&mut self, name: &str) -> Option<T> {
        self.store.remove(&name.to_ascii_lowercase()).map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Iterates entries with their original casing.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.store.values().map(|(name, value)| (name.as_str(), value))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.store.values().map(|(name, _)| name.as_str())
    }

    /// Keys joined for error messages, in stable order.
    pub(crate) fn keys_joined(&self) -> String {
        let mut keys: Vec<&str> = self.keys().collect();
        keys.sort_unstable();
        keys.join(", ")
    }
}

impl<T> Default for OptionMap<T> {
    fn default() -> Self {
        OptionMap::new()
    }
}

impl<T: PartialEq> PartialEq for OptionMap<T> {
    fn eq(&self, other: &Self) -> bool {
        self.store.len() == other.store.len()
            && self.store.iter().all(|(lower, (_, value))| {
                other.store.get(lower).is_some_and(|(_, theirs)| theirs == value)
            })
    }
}

impl<T> FromIterator<(String, T)> for OptionMap<T> {
    fn from_iter<I: IntoIterator<Item = (String, T)>>(iter: I) -> Self {
        let mut map = OptionMap::new();
        for (name, value) in iter {
            map.insert(name, value);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spin(name: &str, default: i64, min: i64, max: i64) -> EngineOption {
        EngineOption {
            name: name.to_string(),
            kind: OptionKind::Spin,
            default: OptionValue::Int(default),
            min: Some(min),
            max: Some(max),
            var: vec![],
        }
    }

    #[test]
    fn spin_range_checks() {
        let option = spin("Hash", 16, 1, 1024);
        assert_eq!(option.parse(&OptionValue::Int(32)), Ok(OptionValue::Int(32)));
        assert_eq!(option.parse(&OptionValue::Str("64".into())), Ok(OptionValue::Int(64)));
        assert!(option.parse(&OptionValue::Int(0)).is_err());
        assert!(option.parse(&OptionValue::Int(2048)).is_err());
        assert!(option.parse(&OptionValue::Str("plenty".into())).is_err());
    }

    #[test]
    fn parse_is_idempotent() {
        let options = [
            spin("Hash", 16, 1, 1024),
            EngineOption {
                name: "Ponder".into(),
                kind: OptionKind::Check,
                default: OptionValue::Bool(false),
                min: None,
                max: None,
                var: vec![],
            },
            EngineOption {
                name: "Style".into(),
                kind: OptionKind::Combo,
                default: OptionValue::Str("Normal".into()),
                min: None,
                max: None,
                var: vec!["Solid".into(), "Normal".into(), "Risky".into()],
            },
            EngineOption {
                name: "BookFile".into(),
                kind: OptionKind::Str,
                default: OptionValue::Str(String::new()),
                min: None,
                max: None,
                var: vec![],
            },
        ];
        let samples = [
            OptionValue::Int(17),
            OptionValue::Bool(true),
            OptionValue::Str("Normal".into()),
            OptionValue::Str("book.bin".into()),
        ];
        for (option, sample) in options.iter().zip(samples) {
            let once = option.parse(&sample).unwrap();
            let twice = option.parse(&once).unwrap();
            assert_eq!(once, twice, "{}", option.name);
        }
    }

    #[test]
    fn check_coercions() {
        let option = EngineOption {
            name: "OwnBook".into(),
            kind: OptionKind::Check,
            default: OptionValue::Bool(false),
            min: None,
            max: None,
            var: vec![],
        };
        assert_eq!(option.parse(&OptionValue::Str("true".into())), Ok(OptionValue::Bool(true)));
        assert_eq!(option.parse(&OptionValue::Str("false".into())), Ok(OptionValue::Bool(false)));
        assert_eq!(option.parse(&OptionValue::Str(String::new())), Ok(OptionValue::Bool(false)));
        assert_eq!(option.parse(&OptionValue::Int(1)), Ok(OptionValue::Bool(true)));
    }

    #[test]
    fn buttons_take_no_value() {
        let option = EngineOption {
            name: "Clear Hash".into(),
            kind: OptionKind::Button,
            default: OptionValue::None,
            min: None,
            max: None,
            var: vec![],
        };
        assert_eq!(option.parse(&OptionValue::Str("anything".into())), Ok(OptionValue::None));
    }

    #[test]
    fn string_rejects_line_breaks() {
        let option = EngineOption {
            name: "SyzygyPath".into(),
            kind: OptionKind::Path,
            default: OptionValue::Str(String::new()),
            min: None,
            max: None,
            var: vec![],
        };
        assert!(option.parse(&OptionValue::Str("a\nb".into())).is_err());
        assert!(option.parse(&OptionValue::Str("tables".into())).is_ok());
    }

    #[test]
    fn managed_names() {
        assert!(is_managed("MultiPV"));
        assert!(is_managed("ponder"));
        assert!(is_managed("UCI_Chess960"));
        assert!(is_managed("UCI_Variant"));
        assert!(!is_managed("Hash"));
        assert!(!is_managed("UCI_AnalyseMode"));
    }

    #[test]
    fn option_map_case_insensitive() {
        let mut map = OptionMap::new();
        map.insert("Hash", 16);
        assert_eq!(map.get("hash"), Some(&16));
        assert_eq!(map.get("HASH"), Some(&16));
        assert!(map.contains("hAsH"));
        map.insert("HASH", 32);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("Hash"), Some(&32));
        let keys: Vec<&str> = map.keys().collect();
        assert_eq!(keys, vec!["HASH"]);
    }

    #[test]
    fn option_map_equality_ignores_case() {
        let mut a = OptionMap::new();
        a.insert("Hash", 16);
        a.insert("Threads", 4);
        let mut b = OptionMap::new();
        b.insert("hash", 16);
        b.insert("THREADS", 4);
        assert_eq!(a, b);
        b.insert("Threads", 8);
        assert_ne!(a, b);
    }
}
