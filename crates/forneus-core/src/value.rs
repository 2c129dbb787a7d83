//! Flat configuration values and Python-style literal coercion.
//!
//! Command-line overrides arrive as strings. [`literal_eval`] turns strings that
//! look like literals (`3`, `2e-4`, `True`, `None`, `'text'`, `[1, 2]`) into typed
//! [`ConfigValue`]s and leaves everything else as a plain string.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::{Error, Result};

/// A single typed configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    /// Absent value.
    None,
    /// Boolean flag.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// Free-form string.
    Str(String),
    /// List of values.
    List(Vec<ConfigValue>),
}

/// Kind of a [`ConfigValue`], used to pick the command-line parser for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// `None` default.
    None,
    /// Boolean.
    Bool,
    /// Integer.
    Int,
    /// Float.
    Float,
    /// String.
    Str,
    /// List.
    List,
}

impl ConfigValue {
    /// Returns the kind of this value.
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::None => ValueKind::None,
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
            Self::Str(_) => ValueKind::Str,
            Self::List(_) => ValueKind::List,
        }
    }

    /// Returns the string payload, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Converts a JSON value into a configuration value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for JSON objects, which cannot appear in a
    /// flat configuration.
    pub fn from_json(value: &Value) -> Result<Self> {
        Ok(match value {
            Value::Null => Self::None,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            }
            Value::String(s) => Self::Str(s.clone()),
            Value::Array(items) => {
                Self::List(items.iter().map(Self::from_json).collect::<Result<_>>()?)
            }
            Value::Object(_) => {
                return Err(Error::invalid_config(
                    "nested objects are not supported in a flat configuration",
                ))
            }
        })
    }

    /// Converts this value into JSON.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::None => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::Number((*i).into()),
            Self::Float(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
            Self::Str(s) => Value::String(s.clone()),
            Self::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Bool(true) => write!(f, "True"),
            Self::Bool(false) => write!(f, "False"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e16 => {
                write!(f, "{x:.1}")
            }
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => write!(f, "{s}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    match item {
                        Self::Str(s) => write!(f, "'{s}'")?,
                        other => write!(f, "{other}")?,
                    }
                }
                write!(f, "]")
            }
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for ConfigValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for ConfigValue {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

/// Ordered mapping from option name to value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigMap {
    entries: Vec<(String, ConfigValue)>,
}

impl ConfigMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a map from a serializable flat struct, keeping field order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the value does not serialize to a flat
    /// JSON object.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        match serde_json::to_value(value)? {
            Value::Object(map) => Self::from_json_map(&map),
            _ => Err(Error::invalid_config(
                "configuration must serialize to a map of fields",
            )),
        }
    }

    /// Builds a map from a JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if any field is itself an object.
    pub fn from_json_map(map: &Map<String, Value>) -> Result<Self> {
        let mut out = Self::new();
        for (key, value) in map {
            out.insert(key.clone(), ConfigValue::from_json(value)?);
        }
        Ok(out)
    }

    /// Converts the map to a JSON object.
    #[must_use]
    pub fn to_json_map(&self) -> Map<String, Value> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect()
    }

    /// Inserts or replaces a value, keeping the original position on replace.
    pub fn insert(&mut self, key: impl Into<String>, value: ConfigValue) {
        let key = key.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Returns the value for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConfigValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, ConfigValue)> for ConfigMap {
    fn from_iter<I: IntoIterator<Item = (K, ConfigValue)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

/// Interprets `input` as a Python-style literal.
///
/// Supports integers, floats, `True`, `False`, `None`, single- or double-quoted
/// strings, and lists or tuples of those. Returns `None` if the whole input is
/// not a single literal.
///
/// Integers may use `_` separators and `0x`, `0o` or `0b` prefixes. Integers
/// outside the `i64` range return `None`, so callers that fall back to the raw
/// text keep them as strings.
#[must_use]
pub fn literal_eval(input: &str) -> Option<ConfigValue> {
    let mut parser = LiteralParser::new(input.trim());
    let value = parser.value()?;
    parser.skip_ws();
    parser.at_end().then_some(value)
}

struct LiteralParser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> LiteralParser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn value(&mut self) -> Option<ConfigValue> {
        self.skip_ws();
        match self.peek()? {
            '[' => self.sequence('[', ']'),
            '(' => self.sequence('(', ')'),
            '\'' | '"' => self.string(),
            c if c.is_ascii_digit() || matches!(c, '+' | '-' | '.') => self.number(),
            c if c.is_ascii_alphabetic() => self.keyword(),
            _ => None,
        }
    }

    fn sequence(&mut self, open: char, close: char) -> Option<ConfigValue> {
        if self.bump()? != open {
            return None;
        }
        let mut items = Vec::new();
        let mut trailing_comma = false;
        loop {
            self.skip_ws();
            if self.peek()? == close {
                self.bump();
                break;
            }
            items.push(self.value()?);
            trailing_comma = false;
            self.skip_ws();
            match self.bump()? {
                ',' => trailing_comma = true,
                c if c == close => break,
                _ => return None,
            }
        }
        // `(1)` is a parenthesised scalar, `(1,)` is a tuple.
        if open == '(' && items.len() == 1 && !trailing_comma {
            return items.pop();
        }
        Some(ConfigValue::List(items))
    }

    fn string(&mut self) -> Option<ConfigValue> {
        let quote = self.bump()?;
        let mut out = String::new();
        loop {
            match self.bump()? {
                '\\' => match self.bump()? {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    '0' => out.push('\0'),
                    other => out.push(other),
                }
                c if c == quote => return Some(ConfigValue::Str(out)),
                c => out.push(c),
            }
        }
    }

    fn number(&mut self) -> Option<ConfigValue> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.' | '_'))
        {
            self.bump();
        }
        parse_number(&self.src[start..self.pos])
    }

    fn keyword(&mut self) -> Option<ConfigValue> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            self.bump();
        }
        match &self.src[start..self.pos] {
            "True" => Some(ConfigValue::Bool(true)),
            "False" => Some(ConfigValue::Bool(false)),
            "None" => Some(ConfigValue::None),
            _ => None,
        }
    }
}

fn parse_number(token: &str) -> Option<ConfigValue> {
    let (negative, body) = match token.as_bytes().first()? {
        b'-' => (true, &token[1..]),
        b'+' => (false, &token[1..]),
        _ => (false, token),
    };
    let signed = |digits: String| if negative { format!("-{digits}") } else { digits };

    if let Some((radix, digits)) = radix_prefix(body) {
        // `0x_ff` is allowed, `0x__ff` and `0xff_` are not.
        let digits = digits.strip_prefix('_').unwrap_or(digits);
        let cleaned = strip_separators(digits)?;
        if !cleaned.chars().all(|c| c.is_digit(radix)) {
            return None;
        }
        return i64::from_str_radix(&signed(cleaned), radix)
            .ok()
            .map(ConfigValue::Int);
    }

    if !body.starts_with(|c: char| c.is_ascii_digit() || c == '.')
        || !body
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-' | '_'))
    {
        return None;
    }
    let cleaned = strip_separators(body)?;
    if cleaned.chars().all(|c| c.is_ascii_digit()) {
        // Python rejects leading zeros on non-zero integers.
        if cleaned.len() > 1 && cleaned.starts_with('0') && cleaned.chars().any(|c| c != '0') {
            return None;
        }
        return signed(cleaned).parse().ok().map(ConfigValue::Int);
    }
    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    let value: f64 = cleaned.parse().ok()?;
    Some(ConfigValue::Float(if negative { -value } else { value }))
}

fn radix_prefix(body: &str) -> Option<(u32, &str)> {
    let radix = match body.get(..2)?.to_ascii_lowercase().as_str() {
        "0x" => 16,
        "0o" => 8,
        "0b" => 2,
        _ => return None,
    };
    Some((radix, &body[2..]))
}

/// Removes `_` digit separators, rejecting empty, leading, trailing or doubled ones.
fn strip_separators(digits: &str) -> Option<String> {
    if digits.is_empty()
        || digits.starts_with('_')
        || digits.ends_with('_')
        || digits.contains("__")
    {
        return None;
    }
    Some(digits.chars().filter(|&c| c != '_').collect())
}
