//! # Cursors
//!
//! A cursor binds a select query to an integer position over the
//! materialized result. DECLARE stores the query; OPEN materializes the
//! view; FETCH moves the position and hands back the record under it, or
//! nothing once the position leaves the range. The COUNT, OPEN and
//! IN-RANGE attributes are all derived from this state.

use crate::error::{QueryError, QueryResult};
use crate::query::view::View;
use crate::sql::ast::SelectQuery;
use crate::sql::token::{FetchPosition, Pos};
use crate::value::{Primary, Ternary};

#[derive(Debug, Clone)]
pub struct Cursor {
    pub name: String,
    pub query: SelectQuery,
    view: Option<View>,
    index: i64,
    fetched: bool,
}

impl Cursor {
    pub fn new(name: impl Into<String>, query: SelectQuery) -> Self {
        Self {
            name: name.into(),
            query,
            view: None,
            index: -1,
            fetched: false,
        }
    }

    pub fn open(&mut self, view: View, pos: &Pos) -> QueryResult<()> {
        if self.view.is_some() {
            return Err(QueryError::CursorOpen {
                pos: pos.clone(),
                cursor: self.name.clone(),
            });
        }
        self.view = Some(view);
        self.index = -1;
        self.fetched = false;
        Ok(())
    }

    pub fn close(&mut self) {
        self.view = None;
        self.index = -1;
        self.fetched = false;
    }

    pub fn is_open(&self) -> Ternary {
        Ternary::from_bool(self.view.is_some())
    }

    /// UNKNOWN before the first fetch, then whether the position is on a
    /// record.
    pub fn is_in_range(&self, pos: &Pos) -> QueryResult<Ternary> {
        let view = self.view.as_ref().ok_or_else(|| QueryError::CursorClosed {
            pos: pos.clone(),
            cursor: self.name.clone(),
        })?;
        if !self.fetched {
            return Ok(Ternary::Unknown);
        }
        Ok(Ternary::from_bool(
            0 <= self.index && (self.index as usize) < view.record_len(),
        ))
    }

    pub fn count(&self, pos: &Pos) -> QueryResult<usize> {
        let view = self.view.as_ref().ok_or_else(|| QueryError::CursorClosed {
            pos: pos.clone(),
            cursor: self.name.clone(),
        })?;
        Ok(view.record_len())
    }

    /// Moves the position and returns the record values under it, or None
    /// when the movement leaves the range.
    pub fn fetch(
        &mut self,
        position: FetchPosition,
        number: i64,
        pos: &Pos,
    ) -> QueryResult<Option<Vec<Primary>>> {
        let view = self.view.as_ref().ok_or_else(|| QueryError::CursorClosed {
            pos: pos.clone(),
            cursor: self.name.clone(),
        })?;
        self.fetched = true;

        self.index = match position {
            FetchPosition::Next => self.index + 1,
            FetchPosition::Prior => self.index - 1,
            FetchPosition::First => 0,
            FetchPosition::Last => view.record_len() as i64 - 1,
            FetchPosition::Absolute => number,
            FetchPosition::Relative => self.index + number,
        };

        if self.index < 0 {
            self.index = -1;
            return Ok(None);
        }
        if view.record_len() as i64 <= self.index {
            self.index = view.record_len() as i64;
            return Ok(None);
        }

        let record = &view.record_set[self.index as usize];
        Ok(Some(record.iter().map(|c| c.value().clone()).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::header::Header;
    use crate::query::record::record_from_values;
    use crate::sql::ast::{SelectClauses, SelectEntity};

    fn dummy_query() -> SelectQuery {
        SelectQuery {
            with: None,
            entity: SelectEntity::Select(SelectClauses {
                distinct: false,
                fields: Vec::new(),
                from: None,
                where_clause: None,
                group_by: Vec::new(),
                having: None,
                pos: Pos::new(1, 1),
            }),
            order_by: None,
            limit: None,
            offset: None,
            pos: Pos::new(1, 1),
        }
    }

    fn view_with_rows(n: i64) -> View {
        let header = Header::from_table("t", &["c1".to_string()]);
        let records = (0..n)
            .map(|i| record_from_values(vec![Primary::Integer(i)]))
            .collect();
        View::new(header, records)
    }

    fn pos() -> Pos {
        Pos::new(1, 1)
    }

    #[test]
    fn fetch_walks_forward_and_leaves_range() {
        let mut cur = Cursor::new("cur", dummy_query());
        cur.open(view_with_rows(2), &pos()).unwrap();

        assert_eq!(cur.is_in_range(&pos()).unwrap(), Ternary::Unknown);
        assert_eq!(
            cur.fetch(FetchPosition::Next, 0, &pos()).unwrap(),
            Some(vec![Primary::Integer(0)])
        );
        assert_eq!(cur.is_in_range(&pos()).unwrap(), Ternary::True);
        cur.fetch(FetchPosition::Next, 0, &pos()).unwrap();
        assert_eq!(cur.fetch(FetchPosition::Next, 0, &pos()).unwrap(), None);
        assert_eq!(cur.is_in_range(&pos()).unwrap(), Ternary::False);
    }

    #[test]
    fn fetch_on_empty_view_is_out_of_range_with_zero_count() {
        let mut cur = Cursor::new("cur", dummy_query());
        cur.open(view_with_rows(0), &pos()).unwrap();
        assert_eq!(cur.count(&pos()).unwrap(), 0);
        assert_eq!(cur.fetch(FetchPosition::Next, 0, &pos()).unwrap(), None);
        assert_eq!(cur.is_in_range(&pos()).unwrap(), Ternary::False);
    }

    #[test]
    fn absolute_and_relative_positions() {
        let mut cur = Cursor::new("cur", dummy_query());
        cur.open(view_with_rows(5), &pos()).unwrap();
        assert_eq!(
            cur.fetch(FetchPosition::Absolute, 3, &pos()).unwrap(),
            Some(vec![Primary::Integer(3)])
        );
        assert_eq!(
            cur.fetch(FetchPosition::Relative, -2, &pos()).unwrap(),
            Some(vec![Primary::Integer(1)])
        );
        assert_eq!(
            cur.fetch(FetchPosition::Last, 0, &pos()).unwrap(),
            Some(vec![Primary::Integer(4)])
        );
    }

    #[test]
    fn closed_cursor_attributes_error() {
        let cur = Cursor::new("cur", dummy_query());
        assert!(matches!(
            cur.count(&pos()).unwrap_err(),
            QueryError::CursorClosed { .. }
        ));
        assert_eq!(cur.is_open(), Ternary::False);
    }

    #[test]
    fn reopen_of_open_cursor_errors() {
        let mut cur = Cursor::new("cur", dummy_query());
        cur.open(view_with_rows(1), &pos()).unwrap();
        let err = cur.open(view_with_rows(1), &pos()).unwrap_err();
        assert!(matches!(err, QueryError::CursorOpen { .. }));
    }
}
