//! Scalar values carried by expected and actual rows.

use std::fmt;

/// A single scalar in a result row.
///
/// Engines usually hand back their own canonical text rendering (e.g. the
/// Postgres simple query protocol), while fixtures written in Rust may use
/// typed values. With normalization enabled the two are compared through
/// [`Value::render`], so `Value::Int(1)` matches `Value::Text("1")`.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// An ordered tuple of values.
pub type Row = Vec<Value>;

/// Builds a [`Row`] from anything convertible into a [`Value`].
///
/// ```
/// use sqlregress::{row, Value};
///
/// let r = row![1, "abc", Value::Null];
/// assert_eq!(r.len(), 3);
/// ```
#[macro_export]
macro_rules! row {
    ($($value:expr),* $(,)?) => {
        vec![$($crate::Value::from($value)),*]
    };
}

impl Value {
    /// Canonical text of the value, following the Postgres output conventions.
    pub fn render(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(true) => "t".to_string(),
            Value::Bool(false) => "f".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) if f.is_nan() => "NaN".to_string(),
            Value::Float(f) if f.is_infinite() && *f > 0.0 => "Infinity".to_string(),
            Value::Float(f) if f.is_infinite() => "-Infinity".to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => s.clone(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Equality after normalization: same-variant values compare directly,
    /// floats compare numerically against integers and engine text, other
    /// differing variants compare by their canonical text. `NULL` only equals
    /// `NULL`.
    pub fn loosely_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Null, _) | (_, Value::Null) => false,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            // Engines print floats their own way (`1e-05`, `1e+20`, `Infinity`).
            (Value::Float(a), Value::Text(b)) | (Value::Text(b), Value::Float(a)) => {
                parse_float(b).is_some_and(|b| float_eq(*a, b))
            }
            _ if std::mem::discriminant(self) == std::mem::discriminant(other) => self == other,
            _ => self.render() == other.render(),
        }
    }

    /// Ordering key for unordered comparison. Loosely equal values get equal
    /// keys: numbers (and text that parses as one) order by value, everything
    /// else by its canonical text.
    pub(crate) fn sort_key(&self) -> (bool, i64, String) {
        let number = match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => parse_float(s),
            Value::Null | Value::Bool(_) => None,
        };
        match number {
            Some(f) => (false, total_order_bits(f), String::new()),
            None => (true, 0, self.render()),
        }
    }

    /// Parses a value as written in the fixture text format.
    pub(crate) fn from_fixture_text(s: &str) -> Value {
        match s {
            "NULL" => Value::Null,
            "(empty)" => Value::Text(String::new()),
            s => Value::Text(s.to_string()),
        }
    }

    /// The inverse of [`Value::from_fixture_text`].
    pub(crate) fn to_fixture_text(&self) -> String {
        match self {
            Value::Text(s) if s.is_empty() => "(empty)".to_string(),
            v => v.render(),
        }
    }
}

/// Parses float text as printed by Postgres, including `NaN` and `[-]Infinity`.
fn parse_float(s: &str) -> Option<f64> {
    s.trim().parse().ok()
}

fn float_eq(a: f64, b: f64) -> bool {
    (a.is_nan() && b.is_nan()) || a == b
}

/// Maps a float to an integer with the same total order, folding `-0.0` into
/// `0.0` and every `NaN` into one value.
fn total_order_bits(f: f64) -> i64 {
    let f = if f == 0.0 {
        0.0
    } else if f.is_nan() {
        f64::NAN
    } else {
        f
    };
    let bits = f.to_bits() as i64;
    bits ^ (((bits >> 63) as u64) >> 1) as i64
}

/// Strict equality: the variants must agree. Two `NaN` floats are equal, so
/// that rows can be compared reflexively.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => float_eq(*a, *b),
            (Value::Text(a), Value::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) if s.is_empty() => write!(f, "(empty)"),
            Value::Text(s) => write!(f, "{s:?}"),
            v => write!(f, "{}", v.render()),
        }
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::Int(i64::from(v))
                }
            }
        )*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}
