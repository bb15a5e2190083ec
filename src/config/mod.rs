//! # Session Configuration
//!
//! [`Flags`] carries every runtime setting the engine reads: import/export
//! formats, delimiters, datetime formats, the repository for relative paths,
//! the wait timeout for file locks, and the CPU budget for parallel record
//! evaluation. The SET statement mutates a flag by name; SHOW renders one.
//!
//! Flag names are fixed upper-case identifiers. Values are validated at the
//! point of assignment: WAIT_TIMEOUT is clamped to be non-negative, CPU to
//! `[1, available_parallelism]`, and enumerated flags reject values outside
//! their domain with an InvalidFlagValue error.

use crate::error::{QueryError, QueryResult};
use crate::sql::token::Pos;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::str::FromStr;

pub const VARIABLE_SIGN: &str = "@";
pub const FLAG_SIGN: &str = "@@";
pub const ENVIRONMENT_VARIABLE_SIGN: &str = "@%";
pub const RUNTIME_INFORMATION_SIGN: &str = "@#";

pub const DELIMIT_AUTOMATICALLY: &str = "SPACES";

pub const FLAG_LIST: &[&str] = &[
    "REPOSITORY",
    "TIMEZONE",
    "DATETIME_FORMAT",
    "WAIT_TIMEOUT",
    "IMPORT_FORMAT",
    "DELIMITER",
    "DELIMITER_POSITIONS",
    "JSON_QUERY",
    "ENCODING",
    "NO_HEADER",
    "WITHOUT_NULL",
    "FORMAT",
    "WRITE_ENCODING",
    "WRITE_DELIMITER",
    "WRITE_DELIMITER_POSITIONS",
    "WITHOUT_HEADER",
    "LINE_BREAK",
    "ENCLOSE_ALL",
    "JSON_ESCAPE",
    "PRETTY_PRINT",
    "EAST_ASIAN_ENCODING",
    "COUNT_DIACRITICAL_SIGN",
    "COUNT_FORMAT_CODE",
    "COLOR",
    "QUIET",
    "CPU",
    "STATS",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    AutoSelect,
    Csv,
    Tsv,
    Fixed,
    Json,
    Ltsv,
    Gfm,
    Org,
    Text,
}

impl Format {
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::AutoSelect => "AUTO",
            Format::Csv => "CSV",
            Format::Tsv => "TSV",
            Format::Fixed => "FIXED",
            Format::Json => "JSON",
            Format::Ltsv => "LTSV",
            Format::Gfm => "GFM",
            Format::Org => "ORG",
            Format::Text => "TEXT",
        }
    }

    pub fn is_import_format(&self) -> bool {
        matches!(
            self,
            Format::Csv | Format::Tsv | Format::Fixed | Format::Json | Format::Ltsv
        )
    }
}

impl FromStr for Format {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CSV" => Ok(Format::Csv),
            "TSV" => Ok(Format::Tsv),
            "FIXED" => Ok(Format::Fixed),
            "JSON" => Ok(Format::Json),
            "LTSV" => Ok(Format::Ltsv),
            "GFM" => Ok(Format::Gfm),
            "ORG" => Ok(Format::Org),
            "TEXT" => Ok(Format::Text),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Auto,
    Utf8,
    Utf8m,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Auto => "AUTO",
            Encoding::Utf8 => "UTF8",
            Encoding::Utf8m => "UTF8M",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineBreak {
    Lf,
    CrLf,
    Cr,
}

impl LineBreak {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineBreak::Lf => "LF",
            LineBreak::CrLf => "CRLF",
            LineBreak::Cr => "CR",
        }
    }

    pub fn value(&self) -> &'static str {
        match self {
            LineBreak::Lf => "\n",
            LineBreak::CrLf => "\r\n",
            LineBreak::Cr => "\r",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonEscape {
    Backslash,
    Hex,
    HexAll,
}

impl JsonEscape {
    pub fn as_str(&self) -> &'static str {
        match self {
            JsonEscape::Backslash => "BACKSLASH",
            JsonEscape::Hex => "HEX",
            JsonEscape::HexAll => "HEXALL",
        }
    }
}

/// Timezone resolution for datetime literals without an explicit offset.
#[derive(Debug, Clone, PartialEq)]
pub enum Timezone {
    Local,
    Utc,
    Named(Tz),
}

impl Timezone {
    pub fn parse(name: &str) -> Option<Timezone> {
        match name.to_ascii_uppercase().as_str() {
            "LOCAL" => Some(Timezone::Local),
            "UTC" => Some(Timezone::Utc),
            _ => name.parse::<Tz>().ok().map(Timezone::Named),
        }
    }

    pub fn name(&self) -> String {
        match self {
            Timezone::Local => "Local".to_string(),
            Timezone::Utc => "UTC".to_string(),
            Timezone::Named(tz) => tz.name().to_string(),
        }
    }

    /// Attaches this zone's offset to a naive local time. Ambiguous local
    /// times resolve to the earliest mapping.
    pub fn from_local(&self, naive: NaiveDateTime) -> Option<DateTime<FixedOffset>> {
        match self {
            Timezone::Local => chrono::Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.fixed_offset()),
            Timezone::Utc => Some(Utc.from_utc_datetime(&naive).fixed_offset()),
            Timezone::Named(tz) => tz
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.fixed_offset()),
        }
    }

    pub fn now(&self) -> DateTime<FixedOffset> {
        match self {
            Timezone::Local => chrono::Local::now().fixed_offset(),
            Timezone::Utc => Utc::now().fixed_offset(),
            Timezone::Named(tz) => Utc::now().with_timezone(tz).fixed_offset(),
        }
    }
}

pub fn default_cpu_count() -> usize {
    let n = available_cpus() / 2;
    n.max(1)
}

pub fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Flags {
    pub repository: String,
    pub timezone: Timezone,
    pub datetime_format: Vec<String>,
    pub wait_timeout: f64,
    pub retry_delay_ms: u64,

    pub import_format: Format,
    pub delimiter: char,
    pub delimiter_positions: Option<Vec<usize>>,
    pub single_line: bool,
    pub json_query: String,
    pub encoding: Encoding,
    pub no_header: bool,
    pub without_null: bool,

    pub format: Format,
    pub write_encoding: Encoding,
    pub write_delimiter: char,
    pub write_delimiter_positions: Option<Vec<usize>>,
    pub write_as_single_line: bool,
    pub without_header: bool,
    pub line_break: LineBreak,
    pub enclose_all: bool,
    pub json_escape: JsonEscape,
    pub pretty_print: bool,

    pub east_asian_encoding: bool,
    pub count_diacritical_sign: bool,
    pub count_format_code: bool,

    pub color: bool,
    pub quiet: bool,
    pub cpu: usize,
    pub stats: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            repository: String::new(),
            timezone: Timezone::Local,
            datetime_format: Vec::new(),
            wait_timeout: 10.0,
            retry_delay_ms: 10,
            import_format: Format::Csv,
            delimiter: ',',
            delimiter_positions: None,
            single_line: false,
            json_query: String::new(),
            encoding: Encoding::Auto,
            no_header: false,
            without_null: false,
            format: Format::Text,
            write_encoding: Encoding::Utf8,
            write_delimiter: ',',
            write_delimiter_positions: None,
            write_as_single_line: false,
            without_header: false,
            line_break: LineBreak::Lf,
            enclose_all: false,
            json_escape: JsonEscape::Backslash,
            pretty_print: false,
            east_asian_encoding: false,
            count_diacritical_sign: false,
            count_format_code: false,
            color: false,
            quiet: false,
            cpu: default_cpu_count(),
            stats: false,
        }
    }
}

impl Flags {
    /// Assigns a flag by its upper-cased name. String values arrive already
    /// evaluated; enumerated domains are validated here.
    pub fn set(&mut self, name: &str, value: &str, pos: &Pos) -> QueryResult<()> {
        let uname = name.to_ascii_uppercase();
        let invalid = |flag: &str, value: &str| QueryError::InvalidFlagValue {
            pos: pos.clone(),
            flag: flag.to_string(),
            value: value.to_string(),
        };

        match uname.as_str() {
            "REPOSITORY" => self.repository = value.to_string(),
            "TIMEZONE" => {
                self.timezone =
                    Timezone::parse(value).ok_or_else(|| invalid(&uname, value))?;
            }
            "DATETIME_FORMAT" => {
                self.datetime_format = parse_format_list(value);
            }
            "WAIT_TIMEOUT" => {
                let v: f64 = value.parse().map_err(|_| invalid(&uname, value))?;
                self.wait_timeout = if v < 0.0 { 0.0 } else { v };
            }
            "IMPORT_FORMAT" => {
                let f: Format = value.parse().map_err(|_| invalid(&uname, value))?;
                if !f.is_import_format() {
                    return Err(invalid(&uname, value));
                }
                self.import_format = f;
            }
            "DELIMITER" => {
                self.delimiter = parse_delimiter(value).ok_or_else(|| invalid(&uname, value))?;
            }
            "DELIMITER_POSITIONS" => {
                let (positions, single_line) =
                    parse_delimiter_positions(value).ok_or_else(|| invalid(&uname, value))?;
                self.delimiter_positions = positions;
                self.single_line = single_line;
            }
            "JSON_QUERY" => self.json_query = value.to_string(),
            "ENCODING" => {
                self.encoding = parse_encoding(value).ok_or_else(|| invalid(&uname, value))?;
            }
            "NO_HEADER" => self.no_header = parse_bool(value).ok_or_else(|| invalid(&uname, value))?,
            "WITHOUT_NULL" => {
                self.without_null = parse_bool(value).ok_or_else(|| invalid(&uname, value))?
            }
            "FORMAT" => {
                self.format = value.parse().map_err(|_| invalid(&uname, value))?;
            }
            "WRITE_ENCODING" => {
                let e = parse_encoding(value).ok_or_else(|| invalid(&uname, value))?;
                if e == Encoding::Auto {
                    return Err(invalid(&uname, value));
                }
                self.write_encoding = e;
            }
            "WRITE_DELIMITER" => {
                self.write_delimiter =
                    parse_delimiter(value).ok_or_else(|| invalid(&uname, value))?;
            }
            "WRITE_DELIMITER_POSITIONS" => {
                let (positions, single_line) =
                    parse_delimiter_positions(value).ok_or_else(|| invalid(&uname, value))?;
                self.write_delimiter_positions = positions;
                self.write_as_single_line = single_line;
            }
            "WITHOUT_HEADER" => {
                self.without_header = parse_bool(value).ok_or_else(|| invalid(&uname, value))?
            }
            "LINE_BREAK" => {
                self.line_break = match value.to_ascii_uppercase().as_str() {
                    "LF" => LineBreak::Lf,
                    "CRLF" => LineBreak::CrLf,
                    "CR" => LineBreak::Cr,
                    _ => return Err(invalid(&uname, value)),
                };
            }
            "ENCLOSE_ALL" => {
                self.enclose_all = parse_bool(value).ok_or_else(|| invalid(&uname, value))?
            }
            "JSON_ESCAPE" => {
                self.json_escape = match value.to_ascii_uppercase().as_str() {
                    "BACKSLASH" => JsonEscape::Backslash,
                    "HEX" => JsonEscape::Hex,
                    "HEXALL" => JsonEscape::HexAll,
                    _ => return Err(invalid(&uname, value)),
                };
            }
            "PRETTY_PRINT" => {
                self.pretty_print = parse_bool(value).ok_or_else(|| invalid(&uname, value))?
            }
            "EAST_ASIAN_ENCODING" => {
                self.east_asian_encoding = parse_bool(value).ok_or_else(|| invalid(&uname, value))?
            }
            "COUNT_DIACRITICAL_SIGN" => {
                self.count_diacritical_sign =
                    parse_bool(value).ok_or_else(|| invalid(&uname, value))?
            }
            "COUNT_FORMAT_CODE" => {
                self.count_format_code = parse_bool(value).ok_or_else(|| invalid(&uname, value))?
            }
            "COLOR" => self.color = parse_bool(value).ok_or_else(|| invalid(&uname, value))?,
            "QUIET" => self.quiet = parse_bool(value).ok_or_else(|| invalid(&uname, value))?,
            "CPU" => {
                let v: i64 = value.parse().map_err(|_| invalid(&uname, value))?;
                self.cpu = (v.max(1) as usize).min(available_cpus());
            }
            "STATS" => self.stats = parse_bool(value).ok_or_else(|| invalid(&uname, value))?,
            _ => {
                return Err(QueryError::InvalidFlagName {
                    pos: pos.clone(),
                    flag: name.to_string(),
                })
            }
        }
        Ok(())
    }

    /// Renders a flag's current value for SHOW.
    pub fn show(&self, name: &str, pos: &Pos) -> QueryResult<String> {
        let uname = name.to_ascii_uppercase();
        let s = match uname.as_str() {
            "REPOSITORY" => self.repository.clone(),
            "TIMEZONE" => self.timezone.name(),
            "DATETIME_FORMAT" => format!("{:?}", self.datetime_format),
            "WAIT_TIMEOUT" => self.wait_timeout.to_string(),
            "IMPORT_FORMAT" => self.import_format.as_str().to_string(),
            "DELIMITER" => self.delimiter.to_string(),
            "DELIMITER_POSITIONS" => match &self.delimiter_positions {
                Some(p) => format!("{:?}", p),
                None => DELIMIT_AUTOMATICALLY.to_string(),
            },
            "JSON_QUERY" => self.json_query.clone(),
            "ENCODING" => self.encoding.as_str().to_string(),
            "NO_HEADER" => self.no_header.to_string(),
            "WITHOUT_NULL" => self.without_null.to_string(),
            "FORMAT" => self.format.as_str().to_string(),
            "WRITE_ENCODING" => self.write_encoding.as_str().to_string(),
            "WRITE_DELIMITER" => self.write_delimiter.to_string(),
            "WRITE_DELIMITER_POSITIONS" => match &self.write_delimiter_positions {
                Some(p) => format!("{:?}", p),
                None => DELIMIT_AUTOMATICALLY.to_string(),
            },
            "WITHOUT_HEADER" => self.without_header.to_string(),
            "LINE_BREAK" => self.line_break.as_str().to_string(),
            "ENCLOSE_ALL" => self.enclose_all.to_string(),
            "JSON_ESCAPE" => self.json_escape.as_str().to_string(),
            "PRETTY_PRINT" => self.pretty_print.to_string(),
            "EAST_ASIAN_ENCODING" => self.east_asian_encoding.to_string(),
            "COUNT_DIACRITICAL_SIGN" => self.count_diacritical_sign.to_string(),
            "COUNT_FORMAT_CODE" => self.count_format_code.to_string(),
            "COLOR" => self.color.to_string(),
            "QUIET" => self.quiet.to_string(),
            "CPU" => self.cpu.to_string(),
            "STATS" => self.stats.to_string(),
            _ => {
                return Err(QueryError::InvalidFlagName {
                    pos: pos.clone(),
                    flag: name.to_string(),
                })
            }
        };
        Ok(s)
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_uppercase().as_str() {
        "TRUE" | "T" | "1" => Some(true),
        "FALSE" | "F" | "0" => Some(false),
        _ => None,
    }
}

fn parse_delimiter(s: &str) -> Option<char> {
    let unescaped = match s {
        "\\t" => "\t",
        other => other,
    };
    let mut chars = unescaped.chars();
    let c = chars.next()?;
    if chars.next().is_some() {
        return None;
    }
    Some(c)
}

/// DELIMITER_POSITIONS takes either the literal `SPACES`, a JSON integer
/// array, or either of those prefixed with `S` followed by the array for
/// single-line mode.
fn parse_delimiter_positions(s: &str) -> Option<(Option<Vec<usize>>, bool)> {
    let trimmed = s.trim();
    if trimmed.eq_ignore_ascii_case(DELIMIT_AUTOMATICALLY) {
        return Some((None, false));
    }
    let (body, single_line) = if let Some(rest) = trimmed.strip_prefix(['s', 'S']) {
        (rest.trim(), true)
    } else {
        (trimmed, false)
    };
    if body.eq_ignore_ascii_case(DELIMIT_AUTOMATICALLY) {
        return Some((None, single_line));
    }
    let parsed: serde_json::Value = serde_json::from_str(body).ok()?;
    let arr = parsed.as_array()?;
    let mut positions = Vec::with_capacity(arr.len());
    for v in arr {
        positions.push(v.as_u64()? as usize);
    }
    Some((Some(positions), single_line))
}

/// DATETIME_FORMAT accepts a single format string or a JSON string array.
pub fn parse_format_list(s: &str) -> Vec<String> {
    if let Ok(serde_json::Value::Array(arr)) = serde_json::from_str::<serde_json::Value>(s) {
        arr.into_iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect()
    } else if s.is_empty() {
        Vec::new()
    } else {
        vec![s.to_string()]
    }
}

fn parse_encoding(s: &str) -> Option<Encoding> {
    match s.to_ascii_uppercase().as_str() {
        "AUTO" => Some(Encoding::Auto),
        "UTF8" => Some(Encoding::Utf8),
        "UTF8M" => Some(Encoding::Utf8m),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_timeout_clamps_to_zero() {
        let mut flags = Flags::default();
        flags.set("WAIT_TIMEOUT", "-5", &Pos::new(1, 1)).unwrap();
        assert_eq!(flags.wait_timeout, 0.0);
    }

    #[test]
    fn cpu_clamps_to_available_range() {
        let mut flags = Flags::default();
        flags.set("CPU", "0", &Pos::new(1, 1)).unwrap();
        assert_eq!(flags.cpu, 1);
        flags.set("CPU", "100000", &Pos::new(1, 1)).unwrap();
        assert!(flags.cpu <= available_cpus());
    }

    #[test]
    fn unknown_flag_name_is_rejected() {
        let mut flags = Flags::default();
        let err = flags.set("NO_SUCH_FLAG", "1", &Pos::new(1, 1)).unwrap_err();
        assert!(matches!(err, QueryError::InvalidFlagName { .. }));
    }

    #[test]
    fn delimiter_positions_accepts_spaces_and_json_array() {
        assert_eq!(parse_delimiter_positions("SPACES"), Some((None, false)));
        assert_eq!(
            parse_delimiter_positions("[5, 10, 15]"),
            Some((Some(vec![5, 10, 15]), false))
        );
        assert_eq!(
            parse_delimiter_positions("S[5, 10]"),
            Some((Some(vec![5, 10]), true))
        );
        assert_eq!(parse_delimiter_positions("bogus"), None);
    }

    #[test]
    fn import_format_rejects_export_only_formats() {
        let mut flags = Flags::default();
        let err = flags
            .set("IMPORT_FORMAT", "GFM", &Pos::new(1, 1))
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidFlagValue { .. }));
    }

    #[test]
    fn timezone_accepts_local_utc_and_iana_names() {
        assert_eq!(Timezone::parse("Local"), Some(Timezone::Local));
        assert_eq!(Timezone::parse("UTC"), Some(Timezone::Utc));
        assert!(matches!(
            Timezone::parse("Asia/Tokyo"),
            Some(Timezone::Named(_))
        ));
        assert_eq!(Timezone::parse("Not/AZone"), None);
    }
}
