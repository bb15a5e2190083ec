//! # Datetime Literal Parsing
//!
//! Datetime strings are recognized in three tiers: user-configured formats
//! (strftime syntax, tried first), the engine's own `YYYY-MM-DD[ HH:MM:SS]`
//! forms with optional fractional seconds and offset, and RFC 3339. Strings
//! without an explicit offset are interpreted in the configured timezone.

use crate::config::Timezone;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};

/// Built-in formats for naive datetime strings, tried in order.
const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S%.f",
];

const NAIVE_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d"];

const OFFSET_DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f %z", "%Y-%m-%d %H:%M:%S%.f%z"];

/// Parses a datetime literal. Returns None when the string matches none of
/// the accepted forms; callers treat that as "stays a plain string".
pub fn str_to_datetime(
    s: &str,
    formats: &[String],
    tz: &Timezone,
) -> Option<DateTime<FixedOffset>> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }

    for f in formats {
        if let Some(dt) = parse_with_format(trimmed, f, tz) {
            return Some(dt);
        }
    }

    for f in OFFSET_DATETIME_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(trimmed, f) {
            return Some(dt);
        }
    }
    for f in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, f) {
            return tz.from_local(naive);
        }
    }
    for f in NAIVE_DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, f) {
            return tz.from_local(date.and_hms_opt(0, 0, 0)?);
        }
    }

    DateTime::parse_from_rfc3339(trimmed).ok()
}

fn parse_with_format(s: &str, format: &str, tz: &Timezone) -> Option<DateTime<FixedOffset>> {
    if format.contains("%z") || format.contains("%Z") || format.contains("%:z") {
        return DateTime::parse_from_str(s, format).ok();
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
        return tz.from_local(naive);
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, format) {
        return tz.from_local(date.and_hms_opt(0, 0, 0)?);
    }
    None
}

/// Converts unix seconds held as a float into a datetime, preserving
/// sub-second precision to nanoseconds in the UTC offset.
pub fn float_to_datetime(f: f64) -> Option<DateTime<FixedOffset>> {
    let secs = f.trunc() as i64;
    let nanos = ((f - f.trunc()) * 1e9).round() as i64;
    let (secs, nanos) = if nanos < 0 {
        (secs - 1, (nanos + 1_000_000_000) as u32)
    } else {
        (secs, nanos as u32)
    };
    DateTime::from_timestamp(secs, nanos).map(|dt| dt.fixed_offset())
}

pub fn datetime_to_float(dt: &DateTime<FixedOffset>) -> f64 {
    dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_nanos()) / 1e9
}

/// Serialization used for display and text output. Whole-second values omit
/// the fraction.
pub fn datetime_to_string(dt: &DateTime<FixedOffset>) -> String {
    if dt.timestamp_subsec_nanos() == 0 {
        dt.format("%Y-%m-%dT%H:%M:%S%:z").to_string()
    } else {
        dt.format("%Y-%m-%dT%H:%M:%S%.9f%:z").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn parses_builtin_datetime_form() {
        let dt = str_to_datetime("2012-05-21 12:00:00", &[], &Timezone::Utc).unwrap();
        assert_eq!(dt.timestamp(), 1337601600);
    }

    #[test]
    fn parses_rfc3339() {
        let dt = str_to_datetime("2012-05-21T12:00:00-12:00", &[], &Timezone::Utc).unwrap();
        assert_eq!(dt.offset().local_minus_utc(), -12 * 3600);
    }

    #[test]
    fn parses_date_only_as_midnight() {
        let dt = str_to_datetime("2012-05-21", &[], &Timezone::Utc).unwrap();
        assert_eq!(dt.hour(), 0);
        assert_eq!(dt.minute(), 0);
    }

    #[test]
    fn parses_user_format_first() {
        let dt = str_to_datetime("20120521", &["%Y%m%d".to_string()], &Timezone::Utc).unwrap();
        assert_eq!(dt.format("%Y-%m-%d").to_string(), "2012-05-21");
    }

    #[test]
    fn rejects_plain_strings() {
        assert!(str_to_datetime("not a date", &[], &Timezone::Utc).is_none());
        assert!(str_to_datetime("123", &[], &Timezone::Utc).is_none());
    }

    #[test]
    fn float_round_trip_preserves_subseconds() {
        let dt = float_to_datetime(1337601600.5).unwrap();
        assert_eq!(datetime_to_float(&dt), 1337601600.5);
    }
}
