//! Display-only table renderers for query output: the boxed TEXT frame,
//! GitHub-flavored markdown and Org tables. Numbers align right, other
//! values left; NULL renders as its keyword.

use crate::query::record::RecordSet;
use crate::value::Primary;

fn display_value(value: &Primary) -> String {
    value.to_string()
}

fn is_numeric(value: &Primary) -> bool {
    matches!(value, Primary::Integer(_) | Primary::Float(_))
}

struct Grid {
    columns: Vec<String>,
    rows: Vec<Vec<(String, bool)>>,
    widths: Vec<usize>,
}

fn build_grid(columns: &[String], records: &RecordSet) -> Grid {
    let rows: Vec<Vec<(String, bool)>> = records
        .iter()
        .map(|record| {
            record
                .iter()
                .map(|cell| (display_value(cell.value()), is_numeric(cell.value())))
                .collect()
        })
        .collect();

    let mut widths: Vec<usize> = columns.iter().map(|c| c.chars().count()).collect();
    for row in &rows {
        for (i, (text, _)) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(text.chars().count());
            }
        }
    }

    Grid {
        columns: columns.to_vec(),
        rows,
        widths,
    }
}

fn pad(text: &str, width: usize, right_align: bool) -> String {
    let len = text.chars().count();
    let fill = " ".repeat(width.saturating_sub(len));
    if right_align {
        format!("{}{}", fill, text)
    } else {
        format!("{}{}", text, fill)
    }
}

/// The boxed TEXT frame:
///
/// ```text
/// +----+-------+
/// | c1 | c2    |
/// +----+-------+
/// |  1 | abc   |
/// +----+-------+
/// ```
pub fn render_text(columns: &[String], records: &RecordSet) -> String {
    if columns.is_empty() {
        return "Empty Fields\n".to_string();
    }
    if records.is_empty() {
        return "Empty RecordSet\n".to_string();
    }
    let grid = build_grid(columns, records);

    let border: String = {
        let parts: Vec<String> = grid.widths.iter().map(|w| "-".repeat(w + 2)).collect();
        format!("+{}+", parts.join("+"))
    };

    let mut out = String::new();
    out.push_str(&border);
    out.push('\n');

    let header_cells: Vec<String> = grid
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!(" {} ", pad(c, grid.widths[i], false)))
        .collect();
    out.push_str(&format!("|{}|\n", header_cells.join("|")));
    out.push_str(&border);
    out.push('\n');

    for row in &grid.rows {
        let cells: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, (text, numeric))| format!(" {} ", pad(text, grid.widths[i], *numeric)))
            .collect();
        out.push_str(&format!("|{}|\n", cells.join("|")));
    }
    out.push_str(&border);
    out.push('\n');
    out
}

pub fn render_gfm(columns: &[String], records: &RecordSet) -> String {
    let grid = build_grid(columns, records);
    let mut out = String::new();

    let header_cells: Vec<String> = grid
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| pad(c, grid.widths[i], false))
        .collect();
    out.push_str(&format!("| {} |\n", header_cells.join(" | ")));

    let separators: Vec<String> = grid.widths.iter().map(|w| "-".repeat(*w)).collect();
    out.push_str(&format!("| {} |\n", separators.join(" | ")));

    for row in &grid.rows {
        let cells: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, (text, numeric))| pad(text, grid.widths[i], *numeric))
            .collect();
        out.push_str(&format!("| {} |\n", cells.join(" | ")));
    }
    out
}

pub fn render_org(columns: &[String], records: &RecordSet) -> String {
    let grid = build_grid(columns, records);
    let mut out = String::new();

    let header_cells: Vec<String> = grid
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| pad(c, grid.widths[i], false))
        .collect();
    out.push_str(&format!("| {} |\n", header_cells.join(" | ")));

    let separators: Vec<String> = grid.widths.iter().map(|w| "-".repeat(w + 2)).collect();
    out.push_str(&format!("|{}|\n", separators.join("+")));

    for row in &grid.rows {
        let cells: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, (text, numeric))| pad(text, grid.widths[i], *numeric))
            .collect();
        out.push_str(&format!("| {} |\n", cells.join(" | ")));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::record::record_from_values;

    #[test]
    fn text_frame_contains_value_row() {
        let out = render_text(
            &["1".to_string()],
            &vec![record_from_values(vec![Primary::Integer(1)])],
        );
        assert!(out.contains("| 1 |"), "got:\n{}", out);
        assert!(out.starts_with("+---+\n"));
    }

    #[test]
    fn empty_record_set_notice() {
        let out = render_text(&["c1".to_string()], &Vec::new());
        assert_eq!(out, "Empty RecordSet\n");
    }

    #[test]
    fn gfm_has_separator_row() {
        let out = render_gfm(
            &["c1".to_string()],
            &vec![record_from_values(vec![Primary::string("a")])],
        );
        assert_eq!(out, "| c1 |\n| -- |\n| a  |\n");
    }
}
