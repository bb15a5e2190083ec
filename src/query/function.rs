//! # Built-in Functions
//!
//! Scalar functions over evaluated arguments, plus the aggregate and list
//! functions that consume a per-group value list. Dispatch is by
//! upper-cased name; names not found here fall through to user-defined
//! functions in the scope stack.
//!
//! Aggregates ignore NULL inputs. An aggregate over an empty or all-NULL
//! group yields NULL, except COUNT which yields 0.

use crate::config::Timezone;
use crate::error::{QueryError, QueryResult};
use crate::sql::token::Pos;
use crate::value::{
    calculate, compare_combinedly, datetime_to_string, ArithmeticOp, ComparisonResult, Primary,
    Ternary,
};
use chrono::{DateTime, Datelike, FixedOffset, Timelike};

pub struct FunctionContext<'a> {
    pub datetime_formats: &'a [String],
    pub timezone: &'a Timezone,
    pub now: DateTime<FixedOffset>,
}

pub const SCALAR_FUNCTION_NAMES: &[&str] = &[
    "COALESCE", "IF", "IFNULL", "NULLIF", "ABS", "CEIL", "FLOOR", "ROUND", "UPPER", "LOWER",
    "LTRIM", "RTRIM", "TRIM", "LEN", "SUBSTRING", "INSTR", "REPLACE", "NOW", "STRING", "INTEGER",
    "FLOAT", "BOOLEAN", "TERNARY", "DATETIME", "DATETIME_FORMAT", "YEAR", "MONTH", "DAY", "HOUR",
    "MINUTE", "SECOND",
];

pub fn is_scalar_function(name: &str) -> bool {
    SCALAR_FUNCTION_NAMES.contains(&name.to_ascii_uppercase().as_str())
}

fn args_error(pos: &Pos, name: &str, expected: &str) -> QueryError {
    QueryError::FunctionArgumentLength {
        pos: pos.clone(),
        function: name.to_string(),
        expected: expected.to_string(),
    }
}

fn require_len(pos: &Pos, name: &str, args: &[Primary], n: usize) -> QueryResult<()> {
    if args.len() != n {
        return Err(args_error(pos, name, &n.to_string()));
    }
    Ok(())
}

/// Evaluates a built-in scalar function over already-evaluated arguments.
pub fn call_scalar(
    pos: &Pos,
    name: &str,
    args: &[Primary],
    ctx: &FunctionContext,
) -> QueryResult<Primary> {
    let uname = name.to_ascii_uppercase();
    match uname.as_str() {
        "COALESCE" => {
            if args.is_empty() {
                return Err(args_error(pos, name, "at least 1"));
            }
            for arg in args {
                if !arg.is_null() {
                    return Ok(arg.clone());
                }
            }
            Ok(Primary::Null)
        }
        "IF" => {
            require_len(pos, name, args, 3)?;
            if args[0].as_ternary() == Ternary::True {
                Ok(args[1].clone())
            } else {
                Ok(args[2].clone())
            }
        }
        "IFNULL" => {
            require_len(pos, name, args, 2)?;
            if args[0].is_null() {
                Ok(args[1].clone())
            } else {
                Ok(args[0].clone())
            }
        }
        "NULLIF" => {
            require_len(pos, name, args, 2)?;
            let r = compare_combinedly(&args[0], &args[1], ctx.datetime_formats, ctx.timezone);
            if r == ComparisonResult::Equal {
                Ok(Primary::Null)
            } else {
                Ok(args[0].clone())
            }
        }
        "ABS" => numeric_unary(pos, name, args, f64::abs),
        "CEIL" => numeric_unary(pos, name, args, f64::ceil),
        "FLOOR" => numeric_unary(pos, name, args, f64::floor),
        "ROUND" => {
            if args.is_empty() || 2 < args.len() {
                return Err(args_error(pos, name, "1 or 2"));
            }
            let value = match args[0].as_float() {
                Some(f) => f,
                None => return Ok(Primary::Null),
            };
            let digits = if args.len() == 2 {
                match args[1].as_integer() {
                    Some(i) => i,
                    None => return Ok(Primary::Null),
                }
            } else {
                0
            };
            let factor = 10f64.powi(digits as i32);
            Ok(Primary::from_float((value * factor).round() / factor))
        }
        "UPPER" => string_unary(args, pos, name, |s| s.to_uppercase()),
        "LOWER" => string_unary(args, pos, name, |s| s.to_lowercase()),
        "LTRIM" => string_unary(args, pos, name, |s| s.trim_start().to_string()),
        "RTRIM" => string_unary(args, pos, name, |s| s.trim_end().to_string()),
        "TRIM" => string_unary(args, pos, name, |s| s.trim().to_string()),
        "LEN" => {
            require_len(pos, name, args, 1)?;
            match args[0].as_string() {
                Some(s) => Ok(Primary::Integer(s.chars().count() as i64)),
                None => Ok(Primary::Null),
            }
        }
        "SUBSTRING" => {
            if args.len() < 2 || 3 < args.len() {
                return Err(args_error(pos, name, "2 or 3"));
            }
            let s = match args[0].as_string() {
                Some(s) => s,
                None => return Ok(Primary::Null),
            };
            let start = match args[1].as_integer() {
                Some(i) => i,
                None => return Ok(Primary::Null),
            };
            let chars: Vec<char> = s.chars().collect();
            let len = chars.len() as i64;
            let mut from = if start < 0 {
                len + start
            } else {
                start - 1
            };
            if from < 0 {
                from = 0;
            }
            if len <= from {
                return Ok(Primary::string(String::new()));
            }
            let take = if args.len() == 3 {
                match args[2].as_integer() {
                    Some(i) if 0 <= i => i,
                    _ => return Ok(Primary::Null),
                }
            } else {
                len - from
            };
            let result: String = chars
                .into_iter()
                .skip(from as usize)
                .take(take as usize)
                .collect();
            Ok(Primary::string(result))
        }
        "INSTR" => {
            require_len(pos, name, args, 2)?;
            match (args[0].as_string(), args[1].as_string()) {
                (Some(s), Some(sub)) => match s.find(&sub) {
                    Some(byte_idx) => {
                        let char_idx = s[..byte_idx].chars().count();
                        Ok(Primary::Integer(char_idx as i64))
                    }
                    None => Ok(Primary::Null),
                },
                _ => Ok(Primary::Null),
            }
        }
        "REPLACE" => {
            require_len(pos, name, args, 3)?;
            match (
                args[0].as_string(),
                args[1].as_string(),
                args[2].as_string(),
            ) {
                (Some(s), Some(old), Some(new)) => Ok(Primary::string(s.replace(&old, &new))),
                _ => Ok(Primary::Null),
            }
        }
        "NOW" => {
            if !args.is_empty() {
                return Err(args_error(pos, name, "0"));
            }
            Ok(Primary::Datetime(ctx.now))
        }
        "STRING" => {
            require_len(pos, name, args, 1)?;
            Ok(match args[0].as_string() {
                Some(s) => Primary::string(s),
                None => Primary::Null,
            })
        }
        "INTEGER" => {
            require_len(pos, name, args, 1)?;
            if let Some(i) = args[0].as_integer() {
                return Ok(Primary::Integer(i));
            }
            Ok(match args[0].as_float() {
                Some(f) => Primary::Integer(f.round() as i64),
                None => Primary::Null,
            })
        }
        "FLOAT" => {
            require_len(pos, name, args, 1)?;
            Ok(match args[0].as_float() {
                Some(f) => Primary::Float(f),
                None => Primary::Null,
            })
        }
        "BOOLEAN" => {
            require_len(pos, name, args, 1)?;
            Ok(match args[0].as_boolean() {
                Some(b) => Primary::Boolean(b),
                None => Primary::Null,
            })
        }
        "TERNARY" => {
            require_len(pos, name, args, 1)?;
            Ok(Primary::Ternary(args[0].as_ternary()))
        }
        "DATETIME" => {
            require_len(pos, name, args, 1)?;
            Ok(
                match args[0].as_datetime(ctx.datetime_formats, ctx.timezone) {
                    Some(dt) => Primary::Datetime(dt),
                    None => Primary::Null,
                },
            )
        }
        "DATETIME_FORMAT" => {
            require_len(pos, name, args, 2)?;
            let dt = match args[0].as_datetime(ctx.datetime_formats, ctx.timezone) {
                Some(dt) => dt,
                None => return Ok(Primary::Null),
            };
            let format = match args[1].as_string() {
                Some(f) => f,
                None => return Ok(Primary::Null),
            };
            Ok(Primary::string(dt.format(&format).to_string()))
        }
        "YEAR" | "MONTH" | "DAY" | "HOUR" | "MINUTE" | "SECOND" => {
            require_len(pos, name, args, 1)?;
            let dt = match args[0].as_datetime(ctx.datetime_formats, ctx.timezone) {
                Some(dt) => dt,
                None => return Ok(Primary::Null),
            };
            let v = match uname.as_str() {
                "YEAR" => i64::from(dt.year()),
                "MONTH" => i64::from(dt.month()),
                "DAY" => i64::from(dt.day()),
                "HOUR" => i64::from(dt.hour()),
                "MINUTE" => i64::from(dt.minute()),
                _ => i64::from(dt.second()),
            };
            Ok(Primary::Integer(v))
        }
        _ => Err(QueryError::FunctionNotExist {
            pos: pos.clone(),
            function: name.to_string(),
        }),
    }
}

fn numeric_unary(
    pos: &Pos,
    name: &str,
    args: &[Primary],
    f: impl Fn(f64) -> f64,
) -> QueryResult<Primary> {
    require_len(pos, name, args, 1)?;
    Ok(match args[0].as_float() {
        Some(v) => Primary::from_float(f(v)),
        None => Primary::Null,
    })
}

fn string_unary(
    args: &[Primary],
    pos: &Pos,
    name: &str,
    f: impl Fn(&str) -> String,
) -> QueryResult<Primary> {
    require_len(pos, name, args, 1)?;
    Ok(match args[0].as_string() {
        Some(s) => Primary::string(f(&s)),
        None => Primary::Null,
    })
}

pub const AGGREGATE_FUNCTION_NAMES: &[&str] = &["COUNT", "MIN", "MAX", "SUM", "AVG", "MEDIAN"];

pub fn is_aggregate_function(name: &str) -> bool {
    AGGREGATE_FUNCTION_NAMES.contains(&name.to_ascii_uppercase().as_str())
}

/// Evaluates an aggregate over the per-group value list.
pub fn call_aggregate(
    name: &str,
    values: &[Primary],
    datetime_formats: &[String],
    tz: &Timezone,
) -> Primary {
    let non_null: Vec<&Primary> = values.iter().filter(|v| !v.is_null()).collect();

    match name.to_ascii_uppercase().as_str() {
        "COUNT" => Primary::Integer(non_null.len() as i64),
        "MIN" => extremum(&non_null, datetime_formats, tz, ComparisonResult::Less),
        "MAX" => extremum(&non_null, datetime_formats, tz, ComparisonResult::Greater),
        "SUM" => {
            if non_null.is_empty() {
                Primary::Null
            } else {
                let mut acc = Primary::Integer(0);
                for v in &non_null {
                    acc = calculate(&acc, v, ArithmeticOp::Add);
                }
                acc
            }
        }
        "AVG" => {
            if non_null.is_empty() {
                Primary::Null
            } else {
                let mut acc = Primary::Integer(0);
                for v in &non_null {
                    acc = calculate(&acc, v, ArithmeticOp::Add);
                }
                calculate(
                    &acc,
                    &Primary::Integer(non_null.len() as i64),
                    ArithmeticOp::Divide,
                )
            }
        }
        "MEDIAN" => {
            let mut floats: Vec<f64> = non_null.iter().filter_map(|v| v.as_float()).collect();
            if floats.is_empty() {
                return Primary::Null;
            }
            floats.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let mid = floats.len() / 2;
            if floats.len() % 2 == 1 {
                Primary::from_float(floats[mid])
            } else {
                Primary::from_float((floats[mid - 1] + floats[mid]) / 2.0)
            }
        }
        _ => Primary::Null,
    }
}

fn extremum(
    values: &[&Primary],
    datetime_formats: &[String],
    tz: &Timezone,
    keep_when: ComparisonResult,
) -> Primary {
    let mut result: Option<&Primary> = None;
    for v in values {
        match result {
            None => result = Some(v),
            Some(current) => {
                if compare_combinedly(v, current, datetime_formats, tz) == keep_when {
                    result = Some(v);
                }
            }
        }
    }
    result.cloned().unwrap_or(Primary::Null)
}

/// LISTAGG: non-null values joined with the separator in list order.
pub fn list_agg(values: &[Primary], separator: &str) -> Primary {
    let parts: Vec<String> = values
        .iter()
        .filter_map(|v| v.as_string())
        .collect();
    if parts.is_empty() {
        Primary::Null
    } else {
        Primary::string(parts.join(separator))
    }
}

/// JSON_AGG: the whole group, nulls included, as a JSON array literal.
pub fn json_agg(values: &[Primary]) -> Primary {
    let arr: Vec<serde_json::Value> = values.iter().map(primary_to_json).collect();
    Primary::string(serde_json::Value::Array(arr).to_string())
}

pub fn primary_to_json(value: &Primary) -> serde_json::Value {
    match value {
        Primary::Null => serde_json::Value::Null,
        Primary::Integer(i) => serde_json::Value::from(*i),
        Primary::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Primary::String(s) => serde_json::Value::from(s.clone()),
        Primary::Boolean(b) => serde_json::Value::from(*b),
        Primary::Ternary(Ternary::True) => serde_json::Value::from(true),
        Primary::Ternary(Ternary::False) => serde_json::Value::from(false),
        Primary::Ternary(Ternary::Unknown) => serde_json::Value::Null,
        Primary::Datetime(dt) => serde_json::Value::from(datetime_to_string(dt)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> FunctionContext<'static> {
        FunctionContext {
            datetime_formats: &[],
            timezone: &Timezone::Utc,
            now: DateTime::parse_from_rfc3339("2020-01-01T00:00:00+00:00").unwrap(),
        }
    }

    fn pos() -> Pos {
        Pos::new(1, 1)
    }

    #[test]
    fn coalesce_returns_first_non_null() {
        let result = call_scalar(
            &pos(),
            "COALESCE",
            &[Primary::Null, Primary::Integer(2), Primary::Integer(3)],
            &ctx(),
        )
        .unwrap();
        assert_eq!(result, Primary::Integer(2));
    }

    #[test]
    fn round_with_digits() {
        let result = call_scalar(
            &pos(),
            "ROUND",
            &[Primary::Float(1.255), Primary::Integer(1)],
            &ctx(),
        )
        .unwrap();
        assert_eq!(result, Primary::Float(1.3));
    }

    #[test]
    fn substring_is_one_based_and_negative_counts_from_end() {
        let s = Primary::string("abcdef");
        assert_eq!(
            call_scalar(&pos(), "SUBSTRING", &[s.clone(), Primary::Integer(2), Primary::Integer(3)], &ctx())
                .unwrap(),
            Primary::string("bcd")
        );
        assert_eq!(
            call_scalar(&pos(), "SUBSTRING", &[s, Primary::Integer(-2)], &ctx()).unwrap(),
            Primary::string("ef")
        );
    }

    #[test]
    fn wrong_argument_count_is_an_error() {
        let err = call_scalar(&pos(), "ABS", &[], &ctx()).unwrap_err();
        assert!(matches!(err, QueryError::FunctionArgumentLength { .. }));
    }

    #[test]
    fn unknown_function_is_an_error() {
        let err = call_scalar(&pos(), "NO_SUCH_FN", &[Primary::Null], &ctx()).unwrap_err();
        assert!(matches!(err, QueryError::FunctionNotExist { .. }));
    }

    #[test]
    fn aggregates_ignore_nulls() {
        let values = vec![
            Primary::Integer(1),
            Primary::Null,
            Primary::Integer(3),
            Primary::Null,
        ];
        assert_eq!(
            call_aggregate("COUNT", &values, &[], &Timezone::Utc),
            Primary::Integer(2)
        );
        assert_eq!(
            call_aggregate("SUM", &values, &[], &Timezone::Utc),
            Primary::Integer(4)
        );
        assert_eq!(
            call_aggregate("AVG", &values, &[], &Timezone::Utc),
            Primary::Integer(2)
        );
        assert_eq!(
            call_aggregate("MIN", &values, &[], &Timezone::Utc),
            Primary::Integer(1)
        );
        assert_eq!(
            call_aggregate("MAX", &values, &[], &Timezone::Utc),
            Primary::Integer(3)
        );
    }

    #[test]
    fn aggregates_over_all_nulls() {
        let values = vec![Primary::Null, Primary::Null];
        assert_eq!(
            call_aggregate("COUNT", &values, &[], &Timezone::Utc),
            Primary::Integer(0)
        );
        assert_eq!(
            call_aggregate("SUM", &values, &[], &Timezone::Utc),
            Primary::Null
        );
    }

    #[test]
    fn median_of_even_group() {
        let values = vec![
            Primary::Integer(1),
            Primary::Integer(2),
            Primary::Integer(3),
            Primary::Integer(4),
        ];
        assert_eq!(
            call_aggregate("MEDIAN", &values, &[], &Timezone::Utc),
            Primary::Float(2.5)
        );
    }

    #[test]
    fn listagg_joins_non_null_strings() {
        let values = vec![
            Primary::string("a"),
            Primary::Null,
            Primary::string("b"),
        ];
        assert_eq!(list_agg(&values, ","), Primary::string("a,b"));
    }

    #[test]
    fn json_agg_keeps_nulls() {
        let values = vec![Primary::Integer(1), Primary::Null];
        assert_eq!(json_agg(&values), Primary::string("[1,null]"));
    }
}
