//! CSV and TSV: RFC-4180-style quoting with `"` doubled inside quoted
//! fields, a configurable delimiter, and LF/CRLF/CR record separators on
//! input. An unquoted empty field reads as NULL.

use super::{cell_to_string, field_to_value, ReadOptions, WriteOptions};
use crate::query::record::RecordSet;
use crate::value::Primary;

pub fn read(text: &str, options: &ReadOptions) -> (Vec<String>, Vec<Vec<Primary>>) {
    let rows = parse_rows(text, options.delimiter);
    let mut rows = rows.into_iter();

    let columns: Vec<String> = if options.no_header {
        Vec::new()
    } else {
        rows.next()
            .map(|row| row.into_iter().map(|(text, _)| text).collect())
            .unwrap_or_default()
    };

    let mut records: Vec<Vec<Primary>> = rows
        .map(|row| {
            row.into_iter()
                .map(|(text, quoted)| field_to_value(&text, quoted, options.without_null))
                .collect()
        })
        .collect();

    let width = records
        .iter()
        .map(|r| r.len())
        .chain(std::iter::once(columns.len()))
        .max()
        .unwrap_or(0);

    let columns = if options.no_header {
        (1..=width).map(|i| format!("c{}", i)).collect()
    } else {
        let mut columns = columns;
        while columns.len() < width {
            columns.push(format!("c{}", columns.len() + 1));
        }
        columns
    };

    for record in &mut records {
        while record.len() < width {
            record.push(Primary::Null);
        }
    }

    (columns, records)
}

/// Splits text into rows of (field text, was-quoted), respecting quoted
/// spans across line breaks.
fn parse_rows(text: &str, delimiter: char) -> Vec<Vec<(String, bool)>> {
    let mut rows = Vec::new();
    let mut row: Vec<(String, bool)> = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut in_quote = false;

    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quote {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quote = false;
                }
            } else {
                field.push(c);
            }
            continue;
        }

        match c {
            '"' if field.is_empty() && !quoted => {
                in_quote = true;
                quoted = true;
            }
            c if c == delimiter => {
                row.push((std::mem::take(&mut field), quoted));
                quoted = false;
            }
            '\n' | '\r' => {
                if c == '\r' && chars.peek() == Some(&'\n') {
                    chars.next();
                }
                row.push((std::mem::take(&mut field), quoted));
                quoted = false;
                if !(row.len() == 1 && row[0].0.is_empty() && !row[0].1) {
                    rows.push(std::mem::take(&mut row));
                } else {
                    row.clear();
                }
            }
            c => field.push(c),
        }
    }

    if !field.is_empty() || quoted || !row.is_empty() {
        row.push((field, quoted));
        rows.push(row);
    }

    rows
}

fn encode_field(text: &str, delimiter: char, enclose_all: bool) -> String {
    let needs_quote = enclose_all
        || text.contains(delimiter)
        || text.contains('"')
        || text.contains('\n')
        || text.contains('\r');
    if needs_quote {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}

pub fn write(columns: &[String], records: &RecordSet, options: &WriteOptions) -> String {
    let delimiter = options.delimiter;
    let line_break = options.line_break.value();
    let mut lines = Vec::with_capacity(records.len() + 1);

    if !options.without_header {
        let header: Vec<String> = columns
            .iter()
            .map(|c| encode_field(c, delimiter, options.enclose_all))
            .collect();
        lines.push(header.join(&delimiter.to_string()));
    }

    for record in records {
        let fields: Vec<String> = record
            .iter()
            .map(|cell| match cell_to_string(cell.value()) {
                Some(s) => encode_field(&s, delimiter, options.enclose_all),
                None => String::new(),
            })
            .collect();
        lines.push(fields.join(&delimiter.to_string()));
    }

    let mut out = lines.join(line_break);
    out.push_str(line_break);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Encoding, Format, JsonEscape, LineBreak};
    use crate::query::record::record_from_values;

    fn read_options() -> ReadOptions {
        ReadOptions {
            format: Format::Csv,
            delimiter: ',',
            delimiter_positions: None,
            json_query: String::new(),
            no_header: false,
            without_null: false,
        }
    }

    fn write_options() -> WriteOptions {
        WriteOptions {
            format: Format::Csv,
            delimiter: ',',
            delimiter_positions: None,
            line_break: LineBreak::Lf,
            without_header: false,
            enclose_all: false,
            json_escape: JsonEscape::Backslash,
            pretty_print: false,
            encoding: Encoding::Utf8,
        }
    }

    #[test]
    fn read_basic_csv() {
        let (columns, records) = read("c1,c2\n1,a\n2,b\n", &read_options());
        assert_eq!(columns, vec!["c1", "c2"]);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0][0], Primary::string("1"));
        assert_eq!(records[1][1], Primary::string("b"));
    }

    #[test]
    fn read_quoted_fields_and_embedded_delimiters() {
        let (_, records) = read("c1,c2\n\"a,b\",\"say \"\"hi\"\"\"\n", &read_options());
        assert_eq!(records[0][0], Primary::string("a,b"));
        assert_eq!(records[0][1], Primary::string("say \"hi\""));
    }

    #[test]
    fn read_quoted_field_spanning_lines() {
        let (_, records) = read("c1\n\"line1\nline2\"\n", &read_options());
        assert_eq!(records[0][0], Primary::string("line1\nline2"));
    }

    #[test]
    fn empty_unquoted_is_null_and_quoted_is_empty_string() {
        let (_, records) = read("c1,c2\n,\"\"\n", &read_options());
        assert_eq!(records[0][0], Primary::Null);
        assert_eq!(records[0][1], Primary::string(""));
    }

    #[test]
    fn no_header_generates_column_names() {
        let mut options = read_options();
        options.no_header = true;
        let (columns, records) = read("1,a\n2,b\n", &options);
        assert_eq!(columns, vec!["c1", "c2"]);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn short_records_pad_with_null() {
        let (columns, records) = read("c1,c2\n1\n", &read_options());
        assert_eq!(columns.len(), 2);
        assert_eq!(records[0][1], Primary::Null);
    }

    #[test]
    fn write_round_trips_quoting() {
        let columns = vec!["c1".to_string(), "c2".to_string()];
        let records = vec![record_from_values(vec![
            Primary::string("a,b"),
            Primary::Null,
        ])];
        let text = write(&columns, &records, &write_options());
        assert_eq!(text, "c1,c2\n\"a,b\",\n");

        let (cols2, recs2) = read(&text, &read_options());
        assert_eq!(cols2, columns);
        assert_eq!(recs2[0][0], Primary::string("a,b"));
        assert_eq!(recs2[0][1], Primary::Null);
    }

    #[test]
    fn write_crlf_line_break() {
        let mut options = write_options();
        options.line_break = LineBreak::CrLf;
        let columns = vec!["c1".to_string()];
        let records = vec![record_from_values(vec![Primary::Integer(1)])];
        assert_eq!(write(&columns, &records, &options), "c1\r\n1\r\n");
    }
}
