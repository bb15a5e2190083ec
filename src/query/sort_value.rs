//! # Sort Values
//!
//! A [`SortValue`] is the canonical comparison projection of a Primary. The
//! promotion ladder fixes one kind per value: integers (including integer
//! strings) carry pre-computed float/datetime/string forms, floats carry
//! datetime/string forms, datetimes collapse to integers or floats when the
//! conversion round-trips exactly, booleans carry a 0/1 integer form, and
//! anything left that is a string is keyed by its trimmed upper-case text.
//!
//! `less` is ternary: equal values answer UNKNOWN rather than FALSE so the
//! caller can fall through to the next sort key or to the null-ordering
//! policy. Serialization is deterministic and is used directly as the
//! grouping and DISTINCT key.

use crate::config::Timezone;
use crate::sql::ast::{NullPosition, OrderDirection};
use crate::value::{datetime_to_float, float_to_datetime, Primary, Ternary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortValueType {
    Null,
    Integer,
    Float,
    Datetime,
    Boolean,
    String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortValue {
    pub value_type: SortValueType,
    pub integer: i64,
    pub float: f64,
    pub datetime: i64,
    pub string: String,
    pub boolean: bool,
}

impl Default for SortValue {
    fn default() -> Self {
        Self {
            value_type: SortValueType::Null,
            integer: 0,
            float: 0.0,
            datetime: 0,
            string: String::new(),
            boolean: false,
        }
    }
}

impl SortValue {
    pub fn new(value: &Primary, datetime_formats: &[String], tz: &Timezone) -> SortValue {
        let mut sv = SortValue::default();

        if value.is_null() {
            return sv;
        }

        if let Some(i) = value.as_integer() {
            sv.value_type = SortValueType::Integer;
            sv.integer = i;
            sv.float = i as f64;
            sv.datetime = i.saturating_mul(1_000_000_000);
            sv.string = value.as_string().unwrap_or_default();
            return sv;
        }

        if let Some(f) = value.as_float() {
            sv.value_type = SortValueType::Float;
            sv.float = f;
            sv.datetime = (f * 1e9) as i64;
            sv.string = value.as_string().unwrap_or_default();
            return sv;
        }

        if let Some(dt) = value.as_datetime(datetime_formats, tz) {
            let nanos = dt.timestamp_subsec_nanos();
            if nanos > 0 {
                // Promote to float only when sub-second precision survives
                // the round trip through f64.
                let f = datetime_to_float(&dt);
                if float_to_datetime(f).map(|t2| t2 == dt).unwrap_or(false) {
                    sv.value_type = SortValueType::Float;
                    sv.float = f;
                    sv.datetime = dt.timestamp_nanos_opt().unwrap_or(0);
                    sv.string = f.to_string();
                } else {
                    sv.value_type = SortValueType::Datetime;
                    sv.datetime = dt.timestamp_nanos_opt().unwrap_or(0);
                }
            } else {
                let i = dt.timestamp();
                sv.value_type = SortValueType::Integer;
                sv.integer = i;
                sv.float = i as f64;
                sv.datetime = dt.timestamp_nanos_opt().unwrap_or(0);
                sv.string = i.to_string();
            }
            return sv;
        }

        if let Some(b) = value.as_boolean() {
            sv.value_type = SortValueType::Boolean;
            sv.boolean = b;
            sv.integer = i64::from(b);
            return sv;
        }

        if let Primary::String(s) = value {
            sv.value_type = SortValueType::String;
            sv.string = s.trim().to_uppercase();
            return sv;
        }

        sv
    }

    /// Ternary less-than. Equal values return UNKNOWN so composite keys can
    /// fall through; incomparable kind pairs also return UNKNOWN.
    pub fn less(&self, other: &SortValue) -> Ternary {
        use SortValueType as T;
        match self.value_type {
            T::Integer => match other.value_type {
                T::Integer => {
                    if self.integer == other.integer {
                        Ternary::Unknown
                    } else {
                        Ternary::from_bool(self.integer < other.integer)
                    }
                }
                T::Float => Ternary::from_bool(self.float < other.float),
                T::Datetime => Ternary::from_bool(self.datetime < other.datetime),
                T::String => Ternary::from_bool(self.string < other.string),
                _ => Ternary::Unknown,
            },
            T::Float => match other.value_type {
                T::Integer | T::Float => {
                    if self.float == other.float {
                        Ternary::Unknown
                    } else {
                        Ternary::from_bool(self.float < other.float)
                    }
                }
                T::Datetime => Ternary::from_bool(self.datetime < other.datetime),
                T::String => Ternary::from_bool(self.string < other.string),
                _ => Ternary::Unknown,
            },
            T::Datetime => match other.value_type {
                T::Integer | T::Float | T::Datetime => {
                    if self.datetime == other.datetime {
                        Ternary::Unknown
                    } else {
                        Ternary::from_bool(self.datetime < other.datetime)
                    }
                }
                _ => Ternary::Unknown,
            },
            T::String => match other.value_type {
                T::Integer | T::Float | T::String => {
                    if self.string == other.string {
                        Ternary::Unknown
                    } else {
                        Ternary::from_bool(self.string < other.string)
                    }
                }
                _ => Ternary::Unknown,
            },
            _ => Ternary::Unknown,
        }
    }

    /// Equivalence for grouping and DISTINCT. Booleans and their 0/1
    /// integer forms are equivalent; nulls are equivalent to each other.
    pub fn equivalent_to(&self, other: &SortValue) -> bool {
        use SortValueType as T;
        match self.value_type {
            T::Integer => matches!(other.value_type, T::Integer | T::Boolean)
                && self.integer == other.integer,
            T::Float => other.value_type == T::Float && self.float == other.float,
            T::Datetime => other.value_type == T::Datetime && self.datetime == other.datetime,
            T::Boolean => match other.value_type {
                T::Integer => self.integer == other.integer,
                T::Boolean => self.boolean == other.boolean,
                _ => false,
            },
            T::String => other.value_type == T::String && self.string == other.string,
            T::Null => other.value_type == T::Null,
        }
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        match self.value_type {
            SortValueType::Null => buf.push(b'N'),
            SortValueType::Integer => {
                buf.push(b'I');
                buf.extend_from_slice(&self.integer.to_be_bytes());
            }
            SortValueType::Float => {
                buf.push(b'F');
                buf.extend_from_slice(&self.float.to_be_bytes());
            }
            SortValueType::Datetime => {
                buf.push(b'D');
                buf.extend_from_slice(&self.datetime.to_be_bytes());
            }
            SortValueType::Boolean => {
                // Booleans serialize through their integer form so that
                // TRUE groups with 1 and FALSE with 0.
                buf.push(b'I');
                buf.extend_from_slice(&self.integer.to_be_bytes());
            }
            SortValueType::String => {
                // Length-prefixed: raw bytes could contain the tag and
                // separator characters and make distinct composite keys
                // collide.
                buf.push(b'S');
                buf.extend_from_slice(&(self.string.len() as u32).to_be_bytes());
                buf.extend_from_slice(self.string.as_bytes());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SortValues(pub Vec<SortValue>);

impl SortValues {
    pub fn new(values: Vec<SortValue>) -> Self {
        SortValues(values)
    }

    /// Composite ordering for ORDER BY: per-key direction and null
    /// position; ties fall through to the next key.
    pub fn less(
        &self,
        other: &SortValues,
        directions: &[OrderDirection],
        null_positions: &[NullPosition],
    ) -> bool {
        for (i, value) in self.0.iter().enumerate() {
            let t = value.less(&other.0[i]);
            if t != Ternary::Unknown {
                return if directions[i] == OrderDirection::Ascending {
                    t == Ternary::True
                } else {
                    t == Ternary::False
                };
            }

            let self_null = value.value_type == SortValueType::Null;
            let other_null = other.0[i].value_type == SortValueType::Null;
            if self_null && !other_null {
                return null_positions[i] == NullPosition::First;
            }
            if !self_null && other_null {
                return null_positions[i] != NullPosition::First;
            }
        }
        false
    }

    pub fn equivalent_to(&self, other: &SortValues) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(a, b)| a.equivalent_to(b))
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for (i, value) in self.0.iter().enumerate() {
            if 0 < i {
                buf.push(b':');
            }
            value.serialize(&mut buf);
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sv(value: Primary) -> SortValue {
        SortValue::new(&value, &[], &Timezone::Utc)
    }

    #[test]
    fn integer_strings_promote_to_integer() {
        let v = sv(Primary::string(" 42"));
        assert_eq!(v.value_type, SortValueType::Integer);
        assert_eq!(v.integer, 42);
        assert_eq!(v.float, 42.0);
    }

    #[test]
    fn float_strings_promote_to_float() {
        let v = sv(Primary::string("1.5"));
        assert_eq!(v.value_type, SortValueType::Float);
        assert_eq!(v.float, 1.5);
    }

    #[test]
    fn whole_second_datetimes_promote_to_integer() {
        let v = sv(Primary::string("2012-05-21 12:00:00"));
        assert_eq!(v.value_type, SortValueType::Integer);
        assert_eq!(v.integer, 1337601600);
    }

    #[test]
    fn booleans_promote_with_integer_form() {
        let v = sv(Primary::Boolean(true));
        assert_eq!(v.value_type, SortValueType::Boolean);
        assert_eq!(v.integer, 1);
        assert!(v.equivalent_to(&sv(Primary::Integer(1))));
    }

    #[test]
    fn plain_strings_key_on_trimmed_uppercase() {
        let v = sv(Primary::string("  abc "));
        assert_eq!(v.value_type, SortValueType::String);
        assert_eq!(v.string, "ABC");
    }

    #[test]
    fn less_is_never_true_both_ways() {
        let values = [
            sv(Primary::Integer(1)),
            sv(Primary::Integer(2)),
            sv(Primary::Float(1.5)),
            sv(Primary::string("abc")),
            sv(Primary::Boolean(true)),
            sv(Primary::Null),
        ];
        for a in &values {
            for b in &values {
                let ab = a.less(b) == Ternary::True;
                let ba = b.less(a) == Ternary::True;
                assert!(!(ab && ba));
            }
        }
    }

    #[test]
    fn equal_values_answer_unknown() {
        assert_eq!(
            sv(Primary::Integer(3)).less(&sv(Primary::Integer(3))),
            Ternary::Unknown
        );
    }

    #[test]
    fn serialization_is_deterministic_and_kind_sensitive() {
        let a = SortValues::new(vec![sv(Primary::Integer(1)), sv(Primary::string("x"))]);
        let b = SortValues::new(vec![sv(Primary::string("1")), sv(Primary::string("x"))]);
        assert_eq!(a.serialize(), a.serialize());
        // "1" promotes to Integer, so both serialize identically.
        assert_eq!(a.serialize(), b.serialize());

        let c = SortValues::new(vec![sv(Primary::string("a"))]);
        let d = SortValues::new(vec![sv(Primary::string("b"))]);
        assert_ne!(c.serialize(), d.serialize());
    }

    #[test]
    fn composite_string_keys_do_not_collide_on_separator_bytes() {
        // Without a length prefix both tuples would flatten to the same
        // byte string.
        let a = SortValues::new(vec![sv(Primary::string("A:SB")), sv(Primary::string("C"))]);
        let b = SortValues::new(vec![sv(Primary::string("A")), sv(Primary::string("B:SC"))]);
        assert_ne!(a.serialize(), b.serialize());
    }

    #[test]
    fn composite_ordering_with_null_positions() {
        let a = SortValues::new(vec![sv(Primary::Null)]);
        let b = SortValues::new(vec![sv(Primary::Integer(1))]);
        assert!(a.less(&b, &[OrderDirection::Ascending], &[NullPosition::First]));
        assert!(!a.less(&b, &[OrderDirection::Ascending], &[NullPosition::Last]));
        assert!(b.less(&a, &[OrderDirection::Ascending], &[NullPosition::Last]));
    }
}
