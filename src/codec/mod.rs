//! # File-Format Codecs
//!
//! Readers and writers for the supported table formats. The engine core
//! consumes exactly this interface: `read_text` turns file text into a
//! header and record set under [`ReadOptions`], `write_table` serializes a
//! header and record set under [`WriteOptions`], and `render` produces the
//! display-only TEXT/GFM/ORG forms for query output.
//!
//! Encodings are UTF-8 with optional BOM. `decode` strips a BOM on read;
//! the UTF8M write encoding prepends one.

pub mod csv;
pub mod fixed;
pub mod json;
pub mod ltsv;
pub mod table;

use crate::config::{Encoding, Flags, Format, JsonEscape, LineBreak};
use crate::error::{QueryError, QueryResult};
use crate::query::record::RecordSet;
use crate::value::Primary;

const UTF8_BOM: &str = "\u{feff}";

#[derive(Debug, Clone)]
pub struct ReadOptions {
    pub format: Format,
    pub delimiter: char,
    pub delimiter_positions: Option<Vec<usize>>,
    pub json_query: String,
    pub no_header: bool,
    pub without_null: bool,
}

impl ReadOptions {
    pub fn from_flags(flags: &Flags, format: Format) -> Self {
        Self {
            format,
            delimiter: if format == Format::Tsv {
                '\t'
            } else {
                flags.delimiter
            },
            delimiter_positions: flags.delimiter_positions.clone(),
            json_query: flags.json_query.clone(),
            no_header: flags.no_header,
            without_null: flags.without_null,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub format: Format,
    pub delimiter: char,
    pub delimiter_positions: Option<Vec<usize>>,
    pub line_break: LineBreak,
    pub without_header: bool,
    pub enclose_all: bool,
    pub json_escape: JsonEscape,
    pub pretty_print: bool,
    pub encoding: Encoding,
}

impl WriteOptions {
    pub fn from_flags(flags: &Flags, format: Format) -> Self {
        Self {
            format,
            delimiter: if format == Format::Tsv {
                '\t'
            } else {
                flags.write_delimiter
            },
            delimiter_positions: flags.write_delimiter_positions.clone(),
            line_break: flags.line_break,
            without_header: flags.without_header,
            enclose_all: flags.enclose_all,
            json_escape: flags.json_escape,
            pretty_print: flags.pretty_print,
            encoding: flags.write_encoding,
        }
    }
}

/// Strips a leading BOM and reports which encoding was detected.
pub fn decode(text: &str) -> (&str, Encoding) {
    match text.strip_prefix(UTF8_BOM) {
        Some(rest) => (rest, Encoding::Utf8m),
        None => (text, Encoding::Utf8),
    }
}

/// Parses file text into column names and records.
pub fn read_text(
    text: &str,
    options: &ReadOptions,
) -> QueryResult<(Vec<String>, Vec<Vec<Primary>>, Encoding)> {
    let (text, encoding) = decode(text);
    let (columns, records) = match options.format {
        Format::Csv | Format::Tsv => csv::read(text, options),
        Format::Ltsv => ltsv::read(text, options),
        Format::Fixed => fixed::read(text, options),
        Format::Json => json::read(text, options).map_err(|message| QueryError::LoadJson {
            pos: crate::sql::token::Pos::new(0, 0),
            message,
        })?,
        other => {
            return Err(QueryError::Io {
                message: format!("{} is not an importable format", other.as_str()),
            })
        }
    };
    Ok((columns, records, encoding))
}

/// Serializes a table for rewriting its backing file.
pub fn write_table(
    columns: &[String],
    records: &RecordSet,
    options: &WriteOptions,
) -> QueryResult<String> {
    let body = match options.format {
        Format::Csv | Format::Tsv => csv::write(columns, records, options),
        Format::Ltsv => ltsv::write(columns, records, options),
        Format::Fixed => fixed::write(columns, records, options),
        Format::Json => json::write(columns, records, options),
        Format::Gfm => table::render_gfm(columns, records),
        Format::Org => table::render_org(columns, records),
        Format::Text => table::render_text(columns, records),
        Format::AutoSelect => {
            return Err(QueryError::Io {
                message: format!("{} is not an exportable format", options.format.as_str()),
            })
        }
    };
    if options.encoding == Encoding::Utf8m {
        Ok(format!("{}{}", UTF8_BOM, body))
    } else {
        Ok(body)
    }
}

/// Field serialization shared by the delimited writers: NULL is an empty
/// unquoted field, everything else prints through its value form.
pub fn cell_to_string(value: &Primary) -> Option<String> {
    match value {
        Primary::Null => None,
        other => Some(other.to_string()),
    }
}

/// Builds a cell value from raw field text: empty unquoted text is NULL
/// unless WITHOUT_NULL is set.
pub fn field_to_value(text: &str, quoted: bool, without_null: bool) -> Primary {
    if text.is_empty() && !quoted && !without_null {
        Primary::Null
    } else {
        Primary::string(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_strips_bom() {
        let (text, encoding) = decode("\u{feff}c1,c2");
        assert_eq!(text, "c1,c2");
        assert_eq!(encoding, Encoding::Utf8m);

        let (text, encoding) = decode("c1,c2");
        assert_eq!(text, "c1,c2");
        assert_eq!(encoding, Encoding::Utf8);
    }

    #[test]
    fn empty_unquoted_field_is_null() {
        assert_eq!(field_to_value("", false, false), Primary::Null);
        assert_eq!(field_to_value("", true, false), Primary::string(""));
        assert_eq!(field_to_value("", false, true), Primary::string(""));
    }
}
