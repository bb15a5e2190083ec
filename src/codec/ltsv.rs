//! LTSV: one record per line, tab-separated `label:value` pairs. The
//! header is the union of labels in first-seen order; labels missing from
//! a line read as NULL.

use super::{cell_to_string, ReadOptions, WriteOptions};
use crate::query::record::RecordSet;
use crate::value::Primary;

pub fn read(text: &str, options: &ReadOptions) -> (Vec<String>, Vec<Vec<Primary>>) {
    let mut columns: Vec<String> = Vec::new();
    let mut raw_rows: Vec<Vec<(String, String)>> = Vec::new();

    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        let mut row = Vec::new();
        for pair in line.split('\t') {
            let (label, value) = match pair.split_once(':') {
                Some((label, value)) => (label.to_string(), value.to_string()),
                None => (pair.to_string(), String::new()),
            };
            if !columns.contains(&label) {
                columns.push(label.clone());
            }
            row.push((label, value));
        }
        raw_rows.push(row);
    }

    let records = raw_rows
        .into_iter()
        .map(|row| {
            columns
                .iter()
                .map(|column| {
                    row.iter()
                        .find(|(label, _)| label == column)
                        .map(|(_, value)| {
                            if value.is_empty() && !options.without_null {
                                Primary::Null
                            } else {
                                Primary::string(value.clone())
                            }
                        })
                        .unwrap_or(Primary::Null)
                })
                .collect()
        })
        .collect();

    (columns, records)
}

pub fn write(columns: &[String], records: &RecordSet, options: &WriteOptions) -> String {
    let line_break = options.line_break.value();
    let mut out = String::new();
    for record in records {
        let pairs: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, column)| {
                let value = record
                    .get(i)
                    .and_then(|c| cell_to_string(c.value()))
                    .unwrap_or_default();
                format!("{}:{}", column, value)
            })
            .collect();
        out.push_str(&pairs.join("\t"));
        out.push_str(line_break);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Format;

    #[test]
    fn read_merges_labels_across_lines() {
        let options = ReadOptions {
            format: Format::Ltsv,
            delimiter: ',',
            delimiter_positions: None,
            json_query: String::new(),
            no_header: false,
            without_null: false,
        };
        let (columns, records) = read("a:1\tb:2\nb:3\tc:4\n", &options);
        assert_eq!(columns, vec!["a", "b", "c"]);
        assert_eq!(records[0][2], Primary::Null);
        assert_eq!(records[1][1], Primary::string("3"));
    }
}
