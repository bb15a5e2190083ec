//! # Primary Values
//!
//! [`Primary`] is the runtime representation for every scalar the engine
//! touches: cell contents, variables, function arguments and results.
//! Coercion is lossy-aware: each `as_*` view returns `None` when the value
//! does not represent that kind, which callers surface as SQL NULL.

use super::datetime::{datetime_to_string, str_to_datetime};
use super::ternary::Ternary;
use crate::config::Timezone;
use chrono::{DateTime, FixedOffset};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Primary {
    Null,
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    Ternary(Ternary),
    Datetime(DateTime<FixedOffset>),
}

impl Primary {
    pub fn string(s: impl Into<String>) -> Primary {
        Primary::String(s.into())
    }

    pub fn ternary(t: Ternary) -> Primary {
        Primary::Ternary(t)
    }

    /// Normalizes a float: integral values in i64 range collapse to Integer
    /// so arithmetic like `1.0 + 2.0` yields `3`. The upper bound is
    /// strict: `i64::MAX as f64` rounds up to 2^63, which is not
    /// representable and would saturate on conversion.
    pub fn from_float(f: f64) -> Primary {
        if f.is_finite() && f == f.trunc() && f >= i64::MIN as f64 && f < i64::MAX as f64 {
            Primary::Integer(f as i64)
        } else {
            Primary::Float(f)
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Primary::Null)
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Primary::Integer(i) => Some(*i),
            Primary::String(s) => {
                let t = s.trim();
                t.parse::<i64>().ok().or_else(|| {
                    t.strip_prefix('+').and_then(|r| r.parse::<i64>().ok())
                })
            }
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Primary::Integer(i) => Some(*i as f64),
            Primary::Float(f) => Some(*f),
            Primary::String(s) => {
                let t = s.trim();
                if t.is_empty() {
                    None
                } else {
                    t.parse::<f64>().ok().filter(|f| f.is_finite())
                }
            }
            _ => None,
        }
    }

    pub fn as_datetime(
        &self,
        formats: &[String],
        tz: &Timezone,
    ) -> Option<DateTime<FixedOffset>> {
        match self {
            Primary::Datetime(dt) => Some(*dt),
            Primary::String(s) => str_to_datetime(s, formats, tz),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Primary::Boolean(b) => Some(*b),
            Primary::Ternary(Ternary::True) => Some(true),
            Primary::Ternary(Ternary::False) => Some(false),
            Primary::Integer(1) => Some(true),
            Primary::Integer(0) => Some(false),
            Primary::Float(f) if *f == 1.0 => Some(true),
            Primary::Float(f) if *f == 0.0 => Some(false),
            Primary::String(s) => match s.trim().to_ascii_uppercase().as_str() {
                "TRUE" | "T" | "1" => Some(true),
                "FALSE" | "F" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<String> {
        match self {
            Primary::Null => None,
            Primary::Ternary(Ternary::Unknown) => None,
            other => Some(other.to_string()),
        }
    }

    /// The truth value of this Primary when used as a predicate.
    pub fn as_ternary(&self) -> Ternary {
        match self {
            Primary::Boolean(b) => Ternary::from_bool(*b),
            Primary::Ternary(t) => *t,
            Primary::Integer(1) => Ternary::True,
            Primary::Integer(0) => Ternary::False,
            Primary::Float(f) if *f == 1.0 => Ternary::True,
            Primary::Float(f) if *f == 0.0 => Ternary::False,
            Primary::String(s) => Ternary::parse(s).unwrap_or(Ternary::Unknown),
            _ => Ternary::Unknown,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Primary::Null => "NULL",
            Primary::Integer(_) => "INTEGER",
            Primary::Float(_) => "FLOAT",
            Primary::String(_) => "STRING",
            Primary::Boolean(_) => "BOOLEAN",
            Primary::Ternary(_) => "TERNARY",
            Primary::Datetime(_) => "DATETIME",
        }
    }
}

impl fmt::Display for Primary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Primary::Null => write!(f, "NULL"),
            Primary::Integer(i) => write!(f, "{}", i),
            Primary::Float(v) => write!(f, "{}", v),
            Primary::String(s) => write!(f, "{}", s),
            Primary::Boolean(b) => write!(f, "{}", b),
            Primary::Ternary(t) => write!(f, "{}", t),
            Primary::Datetime(dt) => write!(f, "{}", datetime_to_string(dt)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_views() {
        assert_eq!(Primary::Integer(42).as_integer(), Some(42));
        assert_eq!(Primary::string(" 42 ").as_integer(), Some(42));
        assert_eq!(Primary::string("+7").as_integer(), Some(7));
        assert_eq!(Primary::string("4.2").as_integer(), None);
        assert_eq!(Primary::Float(4.0).as_integer(), None);
        assert_eq!(Primary::Null.as_integer(), None);
    }

    #[test]
    fn float_views() {
        assert_eq!(Primary::Integer(2).as_float(), Some(2.0));
        assert_eq!(Primary::string("1.5e2").as_float(), Some(150.0));
        assert_eq!(Primary::Boolean(true).as_float(), None);
    }

    #[test]
    fn from_float_collapses_integral_values() {
        assert_eq!(Primary::from_float(3.0), Primary::Integer(3));
        assert_eq!(Primary::from_float(3.5), Primary::Float(3.5));
        assert_eq!(Primary::from_float(-0.0), Primary::Integer(0));
        // 2^63 rounds out of i64 range and must stay a float.
        assert_eq!(
            Primary::from_float(i64::MAX as f64),
            Primary::Float(i64::MAX as f64)
        );
        assert_eq!(
            Primary::from_float(i64::MIN as f64),
            Primary::Integer(i64::MIN)
        );
    }

    #[test]
    fn boolean_views() {
        assert_eq!(Primary::string("true").as_boolean(), Some(true));
        assert_eq!(Primary::Integer(0).as_boolean(), Some(false));
        assert_eq!(Primary::Integer(2).as_boolean(), None);
    }

    #[test]
    fn ternary_of_values() {
        assert_eq!(Primary::Boolean(true).as_ternary(), Ternary::True);
        assert_eq!(Primary::string("0").as_ternary(), Ternary::False);
        assert_eq!(Primary::Null.as_ternary(), Ternary::Unknown);
        assert_eq!(Primary::string("hello").as_ternary(), Ternary::Unknown);
    }

    #[test]
    fn string_view_is_none_for_null_and_unknown() {
        assert_eq!(Primary::Null.as_string(), None);
        assert_eq!(Primary::Ternary(Ternary::Unknown).as_string(), None);
        assert_eq!(Primary::Integer(5).as_string(), Some("5".to_string()));
    }
}
