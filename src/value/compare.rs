//! # Comparison, Arithmetic and Pattern Matching
//!
//! Comparison first projects both operands onto a shared kind: integer,
//! float, datetime, boolean, then raw string (trimmed and upper-cased).
//! Operands that share no kind are incommensurable and every comparison on
//! them yields UNKNOWN. Arithmetic and concatenation propagate NULL.

use super::primary::Primary;
use super::ternary::Ternary;
use crate::config::Timezone;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
}

impl fmt::Display for ArithmeticOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArithmeticOp::Add => "+",
            ArithmeticOp::Subtract => "-",
            ArithmeticOp::Multiply => "*",
            ArithmeticOp::Divide => "/",
            ArithmeticOp::Modulo => "%",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComparisonOp::Equal => "=",
            ComparisonOp::NotEqual => "<>",
            ComparisonOp::LessThan => "<",
            ComparisonOp::LessThanOrEqual => "<=",
            ComparisonOp::GreaterThan => ">",
            ComparisonOp::GreaterThanOrEqual => ">=",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonResult {
    Equal,
    NotEqual,
    Less,
    Greater,
    Incommensurable,
}

/// Projects both operands onto the richest shared kind and compares.
/// `NotEqual` arises only from booleans, which compare for equality but do
/// not order.
pub fn compare_combinedly(
    lhs: &Primary,
    rhs: &Primary,
    formats: &[String],
    tz: &Timezone,
) -> ComparisonResult {
    if lhs.is_null() || rhs.is_null() {
        return ComparisonResult::Incommensurable;
    }

    if let (Some(a), Some(b)) = (lhs.as_integer(), rhs.as_integer()) {
        return order(a.cmp(&b));
    }
    if let (Some(a), Some(b)) = (lhs.as_float(), rhs.as_float()) {
        return order_partial(a, b);
    }
    if let (Some(a), Some(b)) = (lhs.as_datetime(formats, tz), rhs.as_datetime(formats, tz)) {
        return order(a.cmp(&b));
    }
    if let (Some(a), Some(b)) = (lhs.as_boolean(), rhs.as_boolean()) {
        return if a == b {
            ComparisonResult::Equal
        } else {
            ComparisonResult::NotEqual
        };
    }
    if let (Primary::String(a), Primary::String(b)) = (lhs, rhs) {
        let a = a.trim().to_uppercase();
        let b = b.trim().to_uppercase();
        return order(a.cmp(&b));
    }

    ComparisonResult::Incommensurable
}

fn order(o: std::cmp::Ordering) -> ComparisonResult {
    match o {
        std::cmp::Ordering::Less => ComparisonResult::Less,
        std::cmp::Ordering::Equal => ComparisonResult::Equal,
        std::cmp::Ordering::Greater => ComparisonResult::Greater,
    }
}

fn order_partial(a: f64, b: f64) -> ComparisonResult {
    match a.partial_cmp(&b) {
        Some(o) => order(o),
        None => ComparisonResult::Incommensurable,
    }
}

pub fn compare(
    lhs: &Primary,
    rhs: &Primary,
    op: ComparisonOp,
    formats: &[String],
    tz: &Timezone,
) -> Ternary {
    apply_op(compare_combinedly(lhs, rhs, formats, tz), op)
}

fn apply_op(r: ComparisonResult, op: ComparisonOp) -> Ternary {
    use ComparisonResult as R;
    if r == R::Incommensurable {
        return Ternary::Unknown;
    }
    match op {
        ComparisonOp::Equal => Ternary::from_bool(r == R::Equal),
        ComparisonOp::NotEqual => Ternary::from_bool(r != R::Equal),
        _ => {
            // Booleans compare for equality only.
            if r == R::NotEqual {
                return Ternary::Unknown;
            }
            match op {
                ComparisonOp::LessThan => Ternary::from_bool(r == R::Less),
                ComparisonOp::LessThanOrEqual => Ternary::from_bool(r != R::Greater),
                ComparisonOp::GreaterThan => Ternary::from_bool(r == R::Greater),
                ComparisonOp::GreaterThanOrEqual => Ternary::from_bool(r != R::Less),
                _ => unreachable!(),
            }
        }
    }
}

pub fn equal(lhs: &Primary, rhs: &Primary, formats: &[String], tz: &Timezone) -> Ternary {
    compare(lhs, rhs, ComparisonOp::Equal, formats, tz)
}

/// Row-value comparison. Errors when the lengths differ; the caller maps
/// that onto a positioned RowValueLengthInComparison error.
pub fn compare_row_values(
    lhs: &[Primary],
    rhs: &[Primary],
    op: ComparisonOp,
    formats: &[String],
    tz: &Timezone,
) -> Result<Ternary, ()> {
    if lhs.len() != rhs.len() {
        return Err(());
    }

    if matches!(op, ComparisonOp::Equal | ComparisonOp::NotEqual) {
        let mut unknown = false;
        let mut not_equal = false;
        for (a, b) in lhs.iter().zip(rhs.iter()) {
            match compare_combinedly(a, b, formats, tz) {
                ComparisonResult::Incommensurable => unknown = true,
                ComparisonResult::Equal => {}
                _ => not_equal = true,
            }
        }
        let eq = if not_equal {
            Ternary::False
        } else if unknown {
            Ternary::Unknown
        } else {
            Ternary::True
        };
        return Ok(if op == ComparisonOp::NotEqual {
            eq.not()
        } else {
            eq
        });
    }

    for (a, b) in lhs.iter().zip(rhs.iter()) {
        match compare_combinedly(a, b, formats, tz) {
            ComparisonResult::Equal => continue,
            ComparisonResult::Incommensurable | ComparisonResult::NotEqual => {
                return Ok(Ternary::Unknown)
            }
            r => return Ok(apply_op(r, op)),
        }
    }

    // Lexicographically equal.
    Ok(match op {
        ComparisonOp::LessThanOrEqual | ComparisonOp::GreaterThanOrEqual => Ternary::True,
        _ => Ternary::False,
    })
}

/// ANY semantics: OR over the list; an empty list is FALSE. The error value
/// is the index of a list element whose length does not match.
pub fn any_matches(
    lhs: &[Primary],
    list: &[Vec<Primary>],
    op: ComparisonOp,
    formats: &[String],
    tz: &Timezone,
) -> Result<Ternary, usize> {
    let mut result = Ternary::False;
    for (i, row) in list.iter().enumerate() {
        let t = compare_row_values(lhs, row, op, formats, tz).map_err(|_| i)?;
        if t == Ternary::True {
            return Ok(Ternary::True);
        }
        result = result.or(t);
    }
    Ok(result)
}

/// ALL semantics: AND over the list; an empty list is TRUE.
pub fn all_matches(
    lhs: &[Primary],
    list: &[Vec<Primary>],
    op: ComparisonOp,
    formats: &[String],
    tz: &Timezone,
) -> Result<Ternary, usize> {
    let mut result = Ternary::True;
    for (i, row) in list.iter().enumerate() {
        let t = compare_row_values(lhs, row, op, formats, tz).map_err(|_| i)?;
        if t == Ternary::False {
            return Ok(Ternary::False);
        }
        result = result.and(t);
    }
    Ok(result)
}

/// Arithmetic with SQL null propagation. Add/subtract/multiply stay in i64
/// when both operands are integers, falling back to float on overflow.
/// Division and modulo are float operations; a zero divisor yields NULL.
pub fn calculate(lhs: &Primary, rhs: &Primary, op: ArithmeticOp) -> Primary {
    if lhs.is_null() || rhs.is_null() {
        return Primary::Null;
    }

    match op {
        ArithmeticOp::Add | ArithmeticOp::Subtract | ArithmeticOp::Multiply => {
            if let (Some(a), Some(b)) = (lhs.as_integer(), rhs.as_integer()) {
                let checked = match op {
                    ArithmeticOp::Add => a.checked_add(b),
                    ArithmeticOp::Subtract => a.checked_sub(b),
                    ArithmeticOp::Multiply => a.checked_mul(b),
                    _ => unreachable!(),
                };
                return match checked {
                    Some(v) => Primary::Integer(v),
                    // The overflow result stays a float; collapsing it
                    // back to an integer would saturate.
                    None => {
                        let (a, b) = (a as f64, b as f64);
                        Primary::Float(match op {
                            ArithmeticOp::Add => a + b,
                            ArithmeticOp::Subtract => a - b,
                            ArithmeticOp::Multiply => a * b,
                            _ => unreachable!(),
                        })
                    }
                };
            }
            match (lhs.as_float(), rhs.as_float()) {
                (Some(a), Some(b)) => {
                    let v = match op {
                        ArithmeticOp::Add => a + b,
                        ArithmeticOp::Subtract => a - b,
                        ArithmeticOp::Multiply => a * b,
                        _ => unreachable!(),
                    };
                    Primary::from_float(v)
                }
                _ => Primary::Null,
            }
        }
        ArithmeticOp::Divide | ArithmeticOp::Modulo => match (lhs.as_float(), rhs.as_float()) {
            (Some(a), Some(b)) => {
                if b == 0.0 {
                    return Primary::Null;
                }
                let v = match op {
                    ArithmeticOp::Divide => a / b,
                    ArithmeticOp::Modulo => a % b,
                    _ => unreachable!(),
                };
                Primary::from_float(v)
            }
            _ => Primary::Null,
        },
    }
}

/// IS comparison. `x IS NULL` tests nullity; otherwise both sides reduce to
/// their ternary truth value and compare for equivalence, so
/// `x IS UNKNOWN` is TRUE for an UNKNOWN x.
pub fn is(lhs: &Primary, rhs: &Primary) -> Ternary {
    if rhs.is_null() {
        return Ternary::from_bool(lhs.is_null());
    }
    lhs.as_ternary().equivalent_to(rhs.as_ternary())
}

/// SQL LIKE with `%` and `_`, matched case-insensitively. A NULL value or
/// pattern yields UNKNOWN.
pub fn like(value: &Primary, pattern: &Primary) -> Ternary {
    let (v, p) = match (value.as_string(), pattern.as_string()) {
        (Some(v), Some(p)) => (v, p),
        _ => return Ternary::Unknown,
    };
    let text: Vec<char> = v.to_uppercase().chars().collect();
    let pat: Vec<char> = p.to_uppercase().chars().collect();
    Ternary::from_bool(like_match(&text, &pat))
}

fn like_match(text: &[char], pattern: &[char]) -> bool {
    // Iterative two-pointer matcher with single-level backtracking for '%'.
    let (mut t, mut p) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == text[t]) {
            t += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            star = Some((t, p));
            p += 1;
        } else if let Some((st, sp)) = star {
            t = st + 1;
            p = sp + 1;
            star = Some((st + 1, sp));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '%' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmp(lhs: Primary, rhs: Primary, op: ComparisonOp) -> Ternary {
        compare(&lhs, &rhs, op, &[], &Timezone::Utc)
    }

    #[test]
    fn numeric_strings_compare_numerically() {
        assert_eq!(
            cmp(Primary::string("10"), Primary::Integer(9), ComparisonOp::GreaterThan),
            Ternary::True
        );
        assert_eq!(
            cmp(Primary::string("1.5"), Primary::Integer(2), ComparisonOp::LessThan),
            Ternary::True
        );
    }

    #[test]
    fn null_comparison_is_unknown() {
        assert_eq!(
            cmp(Primary::Null, Primary::Integer(1), ComparisonOp::Equal),
            Ternary::Unknown
        );
        assert_eq!(
            cmp(Primary::Integer(1), Primary::Null, ComparisonOp::LessThan),
            Ternary::Unknown
        );
    }

    #[test]
    fn strings_compare_trimmed_and_case_insensitive() {
        assert_eq!(
            cmp(Primary::string(" abc "), Primary::string("ABC"), ComparisonOp::Equal),
            Ternary::True
        );
    }

    #[test]
    fn booleans_do_not_order() {
        assert_eq!(
            cmp(Primary::Boolean(true), Primary::Boolean(false), ComparisonOp::Equal),
            Ternary::False
        );
        assert_eq!(
            cmp(
                Primary::Boolean(true),
                Primary::Boolean(false),
                ComparisonOp::LessThan
            ),
            Ternary::Unknown
        );
    }

    #[test]
    fn row_value_length_mismatch_is_error() {
        let lhs = vec![Primary::Integer(1), Primary::Integer(2)];
        let rhs = vec![Primary::Integer(1)];
        assert!(compare_row_values(&lhs, &rhs, ComparisonOp::Equal, &[], &Timezone::Utc).is_err());
    }

    #[test]
    fn row_value_equality_with_unknown_component() {
        let lhs = vec![Primary::Integer(1), Primary::Null];
        let rhs = vec![Primary::Integer(1), Primary::Integer(2)];
        assert_eq!(
            compare_row_values(&lhs, &rhs, ComparisonOp::Equal, &[], &Timezone::Utc).unwrap(),
            Ternary::Unknown
        );
        let rhs2 = vec![Primary::Integer(9), Primary::Integer(2)];
        assert_eq!(
            compare_row_values(&lhs, &rhs2, ComparisonOp::Equal, &[], &Timezone::Utc).unwrap(),
            Ternary::False
        );
    }

    #[test]
    fn arithmetic_propagates_null() {
        assert_eq!(
            calculate(&Primary::Null, &Primary::Integer(1), ArithmeticOp::Add),
            Primary::Null
        );
        assert_eq!(
            calculate(&Primary::Integer(1), &Primary::Null, ArithmeticOp::Multiply),
            Primary::Null
        );
    }

    #[test]
    fn integer_arithmetic_stays_integer() {
        assert_eq!(
            calculate(&Primary::Integer(2), &Primary::Integer(3), ArithmeticOp::Add),
            Primary::Integer(5)
        );
        assert_eq!(
            calculate(&Primary::string("4"), &Primary::Integer(2), ArithmeticOp::Multiply),
            Primary::Integer(8)
        );
    }

    #[test]
    fn division_is_float_and_zero_divisor_is_null() {
        assert_eq!(
            calculate(&Primary::Integer(1), &Primary::Integer(2), ArithmeticOp::Divide),
            Primary::Float(0.5)
        );
        assert_eq!(
            calculate(&Primary::Integer(1), &Primary::Integer(0), ArithmeticOp::Divide),
            Primary::Null
        );
    }

    #[test]
    fn overflow_falls_back_to_float() {
        let r = calculate(
            &Primary::Integer(i64::MAX),
            &Primary::Integer(1),
            ArithmeticOp::Add,
        );
        assert!(matches!(r, Primary::Float(_)));
    }

    #[test]
    fn is_null_and_is_ternary() {
        assert_eq!(is(&Primary::Null, &Primary::Null), Ternary::True);
        assert_eq!(is(&Primary::Integer(1), &Primary::Null), Ternary::False);
        assert_eq!(
            is(&Primary::Null, &Primary::Ternary(Ternary::Unknown)),
            Ternary::True
        );
        assert_eq!(
            is(&Primary::Boolean(true), &Primary::Ternary(Ternary::True)),
            Ternary::True
        );
    }

    #[test]
    fn like_wildcards() {
        assert_eq!(
            like(&Primary::string("hello"), &Primary::string("h%o")),
            Ternary::True
        );
        assert_eq!(
            like(&Primary::string("hello"), &Primary::string("h_llo")),
            Ternary::True
        );
        assert_eq!(
            like(&Primary::string("hello"), &Primary::string("h_o")),
            Ternary::False
        );
        assert_eq!(
            like(&Primary::string("HELLO"), &Primary::string("hello")),
            Ternary::True
        );
        assert_eq!(like(&Primary::Null, &Primary::string("%")), Ternary::Unknown);
        assert_eq!(like(&Primary::string("x"), &Primary::Null), Ternary::Unknown);
    }
}
