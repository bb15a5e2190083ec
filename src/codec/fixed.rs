//! Fixed-width tables. `delimiter_positions` holds the end offset of each
//! field in characters; `SPACES` (no positions) splits on runs of
//! whitespace instead.

use super::{field_to_value, ReadOptions, WriteOptions};
use crate::query::record::RecordSet;
use crate::value::Primary;

fn split_line(line: &str, positions: &Option<Vec<usize>>) -> Vec<String> {
    match positions {
        Some(positions) => {
            let chars: Vec<char> = line.chars().collect();
            let mut fields = Vec::with_capacity(positions.len());
            let mut start = 0usize;
            for &end in positions {
                let end = end.min(chars.len());
                let field: String = chars[start.min(end)..end].iter().collect();
                fields.push(field.trim().to_string());
                start = end;
            }
            fields
        }
        None => line.split_whitespace().map(|s| s.to_string()).collect(),
    }
}

pub fn read(text: &str, options: &ReadOptions) -> (Vec<String>, Vec<Vec<Primary>>) {
    let mut lines = text.lines().filter(|l| !l.is_empty());

    let columns: Vec<String> = if options.no_header {
        Vec::new()
    } else {
        lines
            .next()
            .map(|line| split_line(line, &options.delimiter_positions))
            .unwrap_or_default()
    };

    let mut records: Vec<Vec<Primary>> = lines
        .map(|line| {
            split_line(line, &options.delimiter_positions)
                .into_iter()
                .map(|field| field_to_value(&field, false, options.without_null))
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
        columns
    };
    for record in &mut records {
        while record.len() < width {
            record.push(Primary::Null);
        }
    }

    (columns, records)
}

pub fn write(columns: &[String], records: &RecordSet, options: &WriteOptions) -> String {
    // Without explicit positions, columns are padded to their widest value.
    let mut widths: Vec<usize> = columns.iter().map(|c| c.chars().count()).collect();
    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|record| {
            record
                .iter()
                .map(|cell| super::cell_to_string(cell.value()).unwrap_or_default())
                .collect()
        })
        .collect();
    for row in &rows {
        for (i, field) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(field.chars().count());
            }
        }
    }
    if let Some(positions) = &options.delimiter_positions {
        let mut start = 0usize;
        for (i, &end) in positions.iter().enumerate() {
            if i < widths.len() {
                widths[i] = end.saturating_sub(start);
            }
            start = end;
        }
    }

    let pad = |s: &str, w: usize| {
        let len = s.chars().count();
        if len < w {
            format!("{}{}", s, " ".repeat(w - len))
        } else {
            s.to_string()
        }
    };

    let line_break = options.line_break.value();
    let mut out = String::new();
    if !options.without_header {
        let fields: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| pad(c, widths[i]))
            .collect();
        out.push_str(fields.join("").trim_end());
        out.push_str(line_break);
    }
    for row in &rows {
        let fields: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, f)| pad(f, widths.get(i).copied().unwrap_or(0)))
            .collect();
        out.push_str(fields.join("").trim_end());
        out.push_str(line_break);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Format;

    #[test]
    fn read_by_positions() {
        let options = ReadOptions {
            format: Format::Fixed,
            delimiter: ',',
            delimiter_positions: Some(vec![5, 10]),
            json_query: String::new(),
            no_header: false,
            without_null: false,
        };
        let (columns, records) = read("c1   c2\n1    a\n22   bb\n", &options);
        assert_eq!(columns, vec!["c1", "c2"]);
        assert_eq!(records[1][0], Primary::string("22"));
        assert_eq!(records[1][1], Primary::string("bb"));
    }

    #[test]
    fn read_by_spaces() {
        let options = ReadOptions {
            format: Format::Fixed,
            delimiter: ',',
            delimiter_positions: None,
            json_query: String::new(),
            no_header: false,
            without_null: false,
        };
        let (columns, records) = read("c1  c2\n1   a\n", &options);
        assert_eq!(columns, vec!["c1", "c2"]);
        assert_eq!(records[0][1], Primary::string("a"));
    }
}
