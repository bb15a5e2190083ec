//! JSON tables and JSON queries.
//!
//! A JSON table is an array of objects; the header is the union of object
//! keys in first-seen order. The JSON query language is a dot/bracket path:
//! `key.nested[0]` walks objects and arrays, and the empty query selects
//! the whole document.

use super::{ReadOptions, WriteOptions};
use crate::config::JsonEscape;
use crate::query::function::primary_to_json;
use crate::query::record::RecordSet;
use crate::value::{Primary, Ternary};
use serde_json::Value as Json;

fn json_to_primary(value: &Json) -> Primary {
    match value {
        Json::Null => Primary::Null,
        Json::Bool(b) => Primary::Boolean(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Primary::Integer(i)
            } else {
                Primary::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Json::String(s) => Primary::string(s.clone()),
        other => Primary::string(other.to_string()),
    }
}

/// Walks a dot/bracket path. Returns None when any step is missing.
fn select_path<'j>(doc: &'j Json, query: &str) -> Option<&'j Json> {
    let mut current = doc;
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Some(current);
    }
    for segment in trimmed.split('.') {
        let mut rest = segment.trim();
        // Leading name part, then zero or more [idx] suffixes.
        let name_end = rest.find('[').unwrap_or(rest.len());
        let name = &rest[..name_end];
        if !name.is_empty() {
            current = current.as_object()?.get(name)?;
        }
        rest = &rest[name_end..];
        while let Some(stripped) = rest.strip_prefix('[') {
            let close = stripped.find(']')?;
            let idx: usize = stripped[..close].trim().parse().ok()?;
            current = current.as_array()?.get(idx)?;
            rest = &stripped[close + 1..];
        }
    }
    Some(current)
}

fn object_keys(rows: &[&serde_json::Map<String, Json>]) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for obj in rows {
        for key in obj.keys() {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
    }
    keys
}

/// Loads an array of objects as a table: (column names, rows).
pub fn load_table(query: &str, text: &str) -> Result<(Vec<String>, Vec<Vec<Primary>>), String> {
    let doc: Json = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let selected = select_path(&doc, query)
        .ok_or_else(|| format!("json value does not exist for query {:?}", query))?;

    let objects: Vec<&serde_json::Map<String, Json>> = match selected {
        Json::Array(items) => items
            .iter()
            .map(|item| item.as_object().ok_or("json value must be an array of objects"))
            .collect::<Result<_, _>>()?,
        Json::Object(obj) => vec![obj],
        _ => return Err("json value must be an array of objects".to_string()),
    };

    let columns = object_keys(&objects);
    let rows = objects
        .iter()
        .map(|obj| {
            columns
                .iter()
                .map(|key| obj.get(key).map(json_to_primary).unwrap_or(Primary::Null))
                .collect()
        })
        .collect();
    Ok((columns, rows))
}

/// Loads an array of scalars as a single-column list.
pub fn load_array(query: &str, text: &str) -> Result<Vec<Primary>, String> {
    let doc: Json = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let selected = select_path(&doc, query)
        .ok_or_else(|| format!("json value does not exist for query {:?}", query))?;
    match selected {
        Json::Array(items) => Ok(items.iter().map(json_to_primary).collect()),
        other => Ok(vec![json_to_primary(other)]),
    }
}

pub fn read(text: &str, options: &ReadOptions) -> Result<(Vec<String>, Vec<Vec<Primary>>), String> {
    load_table(&options.json_query, text)
}

fn escape_non_ascii(text: &str, all: bool) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        let escape = if all {
            !c.is_ascii() || c.is_ascii_control()
        } else {
            !c.is_ascii_graphic() && c != ' '
        };
        if escape {
            let mut buf = [0u16; 2];
            for unit in c.encode_utf16(&mut buf) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        } else {
            out.push(c);
        }
    }
    out
}

pub fn write(columns: &[String], records: &RecordSet, options: &WriteOptions) -> String {
    let rows: Vec<Json> = records
        .iter()
        .map(|record| {
            let mut obj = serde_json::Map::new();
            for (i, column) in columns.iter().enumerate() {
                let value = record
                    .get(i)
                    .map(|c| c.value().clone())
                    .unwrap_or(Primary::Null);
                obj.insert(column.clone(), json_primary(&value));
            }
            Json::Object(obj)
        })
        .collect();
    let doc = Json::Array(rows);

    let body = if options.pretty_print {
        serde_json::to_string_pretty(&doc).unwrap_or_default()
    } else {
        serde_json::to_string(&doc).unwrap_or_default()
    };

    let mut body = match options.json_escape {
        JsonEscape::Backslash => body,
        JsonEscape::Hex => escape_non_ascii(&body, false),
        JsonEscape::HexAll => escape_non_ascii(&body, true),
    };
    body.push_str(options.line_break.value());
    body
}

fn json_primary(value: &Primary) -> Json {
    match value {
        Primary::Ternary(Ternary::Unknown) => Json::Null,
        other => primary_to_json(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_table_from_object_array() {
        let (columns, rows) =
            load_table("", r#"[{"a": 1, "b": "x"}, {"b": "y", "c": null}]"#).unwrap();
        assert_eq!(columns, vec!["a", "b", "c"]);
        assert_eq!(rows[0][0], Primary::Integer(1));
        assert_eq!(rows[1][0], Primary::Null);
        assert_eq!(rows[1][1], Primary::string("y"));
    }

    #[test]
    fn path_query_walks_objects_and_arrays() {
        let text = r#"{"data": {"items": [{"v": 1}, {"v": 2}]}}"#;
        let (columns, rows) = load_table("data.items", text).unwrap();
        assert_eq!(columns, vec!["v"]);
        assert_eq!(rows.len(), 2);

        let values = load_array("data.items[1].v", text).unwrap();
        assert_eq!(values, vec![Primary::Integer(2)]);
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(load_table("", "not json").is_err());
        assert!(load_table("missing", "{}").is_err());
    }

    #[test]
    fn write_emits_object_array() {
        use crate::config::{Encoding, Format, LineBreak};
        use crate::query::record::record_from_values;
        let options = WriteOptions {
            format: Format::Json,
            delimiter: ',',
            delimiter_positions: None,
            line_break: LineBreak::Lf,
            without_header: false,
            enclose_all: false,
            json_escape: JsonEscape::Backslash,
            pretty_print: false,
            encoding: Encoding::Utf8,
        };
        let text = write(
            &["a".to_string()],
            &vec![record_from_values(vec![Primary::Integer(1)])],
            &options,
        );
        assert_eq!(text, "[{\"a\":1}]\n");
    }
}
