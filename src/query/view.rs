//! # View Model
//!
//! A view is an in-memory tabular value: a header, a record set, a grouping
//! flag and, for file-backed views, a [`FileInfo`] carrying provenance and
//! the restore-point snapshots that back rollback.
//!
//! Views are value-semantic for reads. The scope stack and the view cache
//! always hand out clones, so callers can append computed columns without
//! affecting the cached copy; the cached instance is only replaced
//! explicitly on write.
//!
//! ## Invariant
//!
//! Every record in `record_set` has exactly `header.len()` cells. All
//! mutating operations here preserve that.

use super::header::Header;
use super::record::{Cell, Record, RecordSet};
use super::sort_value::SortValues;
use super::worker::{self, CancellationToken};
use crate::config::{Encoding, Format, LineBreak};
use crate::error::QueryResult;
use crate::sql::ast::{Expression, NullPosition, OrderDirection};
use crate::transaction::container::FileHandle;
use crate::value::Primary;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Metadata and snapshots for a view's backing file. Temporary views carry
/// one as well, keyed by their upper-cased name, so rollback can restore
/// them the same way.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: String,
    pub format: Format,
    pub delimiter: char,
    pub delimiter_positions: Option<Vec<usize>>,
    pub json_query: String,
    pub encoding: Encoding,
    pub line_break: LineBreak,
    pub no_header: bool,
    pub enclose_all: bool,
    pub pretty_print: bool,
    pub is_temporary: bool,
    pub initial_header: Option<Header>,
    pub initial_record_set: Option<RecordSet>,
    pub handle: Option<Arc<FileHandle>>,
}

impl FileInfo {
    pub fn new(path: impl Into<String>, format: Format) -> Self {
        Self {
            path: path.into(),
            format,
            delimiter: ',',
            delimiter_positions: None,
            json_query: String::new(),
            encoding: Encoding::Utf8,
            line_break: LineBreak::Lf,
            no_header: false,
            enclose_all: false,
            pretty_print: false,
            is_temporary: false,
            initial_header: None,
            initial_record_set: None,
            handle: None,
        }
    }

    pub fn temporary(name: impl Into<String>) -> Self {
        let mut info = FileInfo::new(name, Format::Csv);
        info.is_temporary = true;
        info
    }

    pub fn key(&self) -> String {
        self.path.to_uppercase()
    }
}

#[derive(Debug, Clone, Default)]
pub struct View {
    pub header: Header,
    pub record_set: RecordSet,
    pub file_info: Option<FileInfo>,
    pub is_grouped: bool,
}

impl View {
    pub fn new(header: Header, record_set: RecordSet) -> View {
        View {
            header,
            record_set,
            file_info: None,
            is_grouped: false,
        }
    }

    pub fn field_len(&self) -> usize {
        self.header.len()
    }

    pub fn record_len(&self) -> usize {
        self.record_set.len()
    }

    pub fn field_index(&self, expr: &Expression) -> QueryResult<usize> {
        self.header.field_index(expr)
    }

    /// A copy with a synthetic leading column holding each record's index,
    /// computed in parallel. Used by DML to address records for update and
    /// delete after filtering.
    pub fn with_internal_id(&self, cpu: usize, cancel: &CancellationToken) -> QueryResult<View> {
        let view_name = self
            .header
            .fields
            .first()
            .map(|f| f.view.clone())
            .unwrap_or_default();
        let mut header_fields = vec![Header::with_internal_id(&view_name)];
        header_fields.extend(self.header.fields.clone());

        let slots: Vec<Mutex<Record>> = (0..self.record_len())
            .map(|_| Mutex::new(Record::new()))
            .collect();
        worker::run(self.record_len(), cpu, cancel, |i| {
            let mut record = Vec::with_capacity(self.header.len() + 1);
            record.push(Cell::new(Primary::Integer(i as i64)));
            record.extend(self.record_set[i].iter().cloned());
            *slots[i].lock() = record;
            Ok(())
        })?;

        Ok(View {
            header: Header {
                fields: header_fields,
            },
            record_set: slots.into_iter().map(|slot| slot.into_inner()).collect(),
            file_info: self.file_info.clone(),
            is_grouped: self.is_grouped,
        })
    }

    /// Stable sort by pre-computed sort values. `keys[i]` belongs to
    /// `record_set[i]`; records with equivalent keys keep their relative
    /// order. Returns the permutation applied, so callers can reorder
    /// parallel arrays such as the keys themselves.
    pub fn order_by_values(
        &mut self,
        keys: &[SortValues],
        directions: &[OrderDirection],
        null_positions: &[NullPosition],
    ) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.record_set.len()).collect();
        indices.sort_by(|&a, &b| {
            if keys[a].less(&keys[b], directions, null_positions) {
                std::cmp::Ordering::Less
            } else if keys[b].less(&keys[a], directions, null_positions) {
                std::cmp::Ordering::Greater
            } else {
                a.cmp(&b)
            }
        });
        let mut reordered = Vec::with_capacity(self.record_set.len());
        for &i in &indices {
            reordered.push(std::mem::take(&mut self.record_set[i]));
        }
        self.record_set = reordered;
        indices
    }

    /// Partitions records by serialized grouping key and collapses each
    /// partition into one record whose cells hold the group of values.
    /// `None` puts every record into a single group (aggregation without
    /// GROUP BY). Marks the view grouped.
    pub fn group(&mut self, keys: Option<&[Vec<u8>]>) {
        let mut order: Vec<Vec<usize>> = Vec::new();

        match keys {
            None => {
                order.push((0..self.record_set.len()).collect());
            }
            Some(keys) => {
                let mut groups: HashMap<&[u8], usize> = HashMap::new();
                for (i, key) in keys.iter().enumerate() {
                    match groups.get(key.as_slice()) {
                        Some(&g) => order[g].push(i),
                        None => {
                            groups.insert(key.as_slice(), order.len());
                            order.push(vec![i]);
                        }
                    }
                }
            }
        }

        let field_len = self.header.len();
        let mut grouped = Vec::with_capacity(order.len());
        for members in &order {
            let mut record: Record = Vec::with_capacity(field_len);
            for cell_idx in 0..field_len {
                let values: Vec<Primary> = members
                    .iter()
                    .map(|&r| self.record_set[r][cell_idx].value().clone())
                    .collect();
                record.push(Cell::group(values));
            }
            grouped.push(record);
        }

        self.record_set = grouped;
        self.is_grouped = true;
    }

    pub fn mark_group_keys(&mut self, indices: &[usize]) {
        for &i in indices {
            if let Some(field) = self.header.fields.get_mut(i) {
                field.is_group_key = true;
            }
        }
    }

    /// Expands one grouped record back into a flat view over the group
    /// members, for aggregate-argument evaluation.
    pub fn from_grouped_record(source: &View, record_index: usize) -> View {
        let record = &source.record_set[record_index];
        let group_len = record.first().map(|c| c.group_len()).unwrap_or(0);
        let mut record_set = Vec::with_capacity(group_len);
        for j in 0..group_len {
            let row: Record = record
                .iter()
                .map(|cell| {
                    let values = cell.group_values();
                    Cell::new(values.get(j).cloned().unwrap_or(Primary::Null))
                })
                .collect();
            record_set.push(row);
        }
        View {
            header: source.header.clone(),
            record_set,
            file_info: None,
            is_grouped: false,
        }
    }

    /// Hardens the current state as the restore point, called on commit and
    /// on first load.
    pub fn store_restore_point(&mut self) {
        if let Some(info) = &mut self.file_info {
            info.initial_header = Some(self.header.clone());
            info.initial_record_set = Some(self.record_set.clone());
        }
    }

    /// Restores header and records from the restore point, called on
    /// rollback.
    pub fn restore(&mut self) {
        let (header, records) = match &self.file_info {
            Some(info) => (info.initial_header.clone(), info.initial_record_set.clone()),
            None => (None, None),
        };
        if let Some(h) = header {
            self.header = h;
        }
        if let Some(r) = records {
            self.record_set = r;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timezone;
    use crate::query::record::record_from_values;
    use crate::query::sort_value::SortValue;

    fn test_view() -> View {
        let header = Header::from_table("t", &["c1".to_string(), "c2".to_string()]);
        let record_set = vec![
            record_from_values(vec![Primary::Integer(2), Primary::string("b")]),
            record_from_values(vec![Primary::Integer(1), Primary::string("a")]),
            record_from_values(vec![Primary::Integer(2), Primary::string("c")]),
        ];
        View::new(header, record_set)
    }

    fn keys_for_column(view: &View, idx: usize) -> Vec<SortValues> {
        view.record_set
            .iter()
            .map(|r| {
                SortValues::new(vec![SortValue::new(
                    r[idx].value(),
                    &[],
                    &Timezone::Utc,
                )])
            })
            .collect()
    }

    #[test]
    fn with_internal_id_prepends_record_indices() {
        let view = test_view();
        let with_id = view
            .with_internal_id(4, &CancellationToken::new())
            .unwrap();
        assert_eq!(with_id.field_len(), 3);
        for (i, record) in with_id.record_set.iter().enumerate() {
            assert_eq!(record[0].value(), &Primary::Integer(i as i64));
            assert_eq!(record.len(), with_id.header.len());
        }
    }

    #[test]
    fn order_by_is_stable() {
        let mut view = test_view();
        let keys = keys_for_column(&view, 0);
        view.order_by_values(
            &keys,
            &[OrderDirection::Ascending],
            &[NullPosition::First],
        );
        let c2: Vec<String> = view
            .record_set
            .iter()
            .map(|r| r[1].value().to_string())
            .collect();
        // The two records with c1 = 2 keep their original relative order.
        assert_eq!(c2, vec!["a", "b", "c"]);
    }

    #[test]
    fn group_collapses_by_serialized_key() {
        let mut view = test_view();
        let keys: Vec<Vec<u8>> = keys_for_column(&view, 0)
            .iter()
            .map(|sv| sv.serialize())
            .collect();
        view.group(Some(&keys));
        assert!(view.is_grouped);
        assert_eq!(view.record_len(), 2);
        assert_eq!(view.record_set[0][0].group_len(), 2);
        assert_eq!(view.record_set[1][0].group_len(), 1);
        for record in &view.record_set {
            assert_eq!(record.len(), view.header.len());
        }
    }

    #[test]
    fn group_without_keys_makes_single_group() {
        let mut view = test_view();
        view.group(None);
        assert_eq!(view.record_len(), 1);
        assert_eq!(view.record_set[0][0].group_len(), 3);
    }

    #[test]
    fn grouped_record_expands_back_to_rows() {
        let mut view = test_view();
        view.group(None);
        let expanded = View::from_grouped_record(&view, 0);
        assert_eq!(expanded.record_len(), 3);
        assert!(!expanded.is_grouped);
    }

    #[test]
    fn restore_point_round_trip() {
        let mut view = test_view();
        view.file_info = Some(FileInfo::new("/tmp/t.csv", Format::Csv));
        view.store_restore_point();
        view.record_set.pop();
        assert_eq!(view.record_len(), 2);
        view.restore();
        assert_eq!(view.record_len(), 3);
    }
}
