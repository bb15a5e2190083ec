//! # Header
//!
//! An ordered list of field descriptors for a view. Each descriptor records
//! the column name, the view or alias it came from, a 1-based column number
//! among that view's from-table fields, aliases attached by SELECT, and the
//! from-table / group-key flags the evaluator consults.

use crate::error::{QueryError, QueryResult};
use crate::sql::ast::{Expression, Identifier};

pub const INTERNAL_ID_COLUMN: &str = "@__internal_id";

#[derive(Debug, Clone, PartialEq, Default)]
pub struct HeaderField {
    pub view: String,
    pub column: String,
    pub aliases: Vec<String>,
    pub number: usize,
    pub is_from_table: bool,
    pub is_join_column: bool,
    pub is_group_key: bool,
}

impl HeaderField {
    fn matches_column(&self, name: &str) -> bool {
        self.column.eq_ignore_ascii_case(name)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Header {
    pub fields: Vec<HeaderField>,
}

impl Header {
    /// Builds a header whose columns all originate from one table.
    pub fn from_table(view: &str, columns: &[String]) -> Header {
        let fields = columns
            .iter()
            .enumerate()
            .map(|(i, column)| HeaderField {
                view: view.to_string(),
                column: column.clone(),
                number: i + 1,
                is_from_table: true,
                ..Default::default()
            })
            .collect();
        Header { fields }
    }

    /// Header for computed result columns with no table origin.
    pub fn from_columns(columns: &[String]) -> Header {
        let fields = columns
            .iter()
            .map(|column| HeaderField {
                column: column.clone(),
                ..Default::default()
            })
            .collect();
        Header { fields }
    }

    pub fn with_internal_id(view: &str) -> HeaderField {
        HeaderField {
            view: view.to_string(),
            column: INTERNAL_ID_COLUMN.to_string(),
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn merge(lhs: Header, rhs: Header) -> Header {
        let mut fields = lhs.fields;
        fields.extend(rhs.fields);
        Header { fields }
    }

    /// Renames the origin of every field, used when a table gets an alias.
    pub fn update_view_name(&mut self, name: &str) {
        for field in &mut self.fields {
            field.view = name.to_string();
        }
    }

    pub fn column_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.column.clone()).collect()
    }

    /// Resolves a field reference. Ambiguity and absence are both errors;
    /// the caller decides whether absence is fatal (outer records of a
    /// correlated subquery may still match).
    pub fn search_index(
        &self,
        view: Option<&Identifier>,
        column: &Identifier,
    ) -> QueryResult<usize> {
        let mut found: Option<usize> = None;
        for (i, field) in self.fields.iter().enumerate() {
            let matched = match view {
                Some(v) => {
                    field.view.eq_ignore_ascii_case(&v.literal)
                        && field.matches_column(&column.literal)
                }
                None => field.matches_column(&column.literal),
            };
            if matched {
                if found.is_some() {
                    return Err(QueryError::FieldAmbiguous {
                        pos: column.pos.clone(),
                        field: column.literal.clone(),
                    });
                }
                found = Some(i);
            }
        }
        found.ok_or_else(|| QueryError::FieldNotExist {
            pos: column.pos.clone(),
            field: column.literal.clone(),
        })
    }

    fn search_number(&self, view: &Identifier, number: i64) -> QueryResult<usize> {
        for (i, field) in self.fields.iter().enumerate() {
            if field.is_from_table
                && field.view.eq_ignore_ascii_case(&view.literal)
                && field.number == number as usize
            {
                return Ok(i);
            }
        }
        Err(QueryError::FieldNotExist {
            pos: view.pos.clone(),
            field: format!("{}.{}", view.literal, number),
        })
    }

    /// Resolves a FieldReference or ColumnNumber expression.
    pub fn field_index(&self, expr: &Expression) -> QueryResult<usize> {
        match expr {
            Expression::FieldReference { view, column } => {
                self.search_index(view.as_ref(), column)
            }
            Expression::ColumnNumber { view, number, .. } => self.search_number(view, *number),
            _ => Err(QueryError::FieldNotExist {
                pos: expr.pos().clone(),
                field: expr.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::token::Pos;

    fn header() -> Header {
        let mut h = Header::from_table("t1", &["id".to_string(), "name".to_string()]);
        h.fields
            .extend(Header::from_table("t2", &["id".to_string(), "city".to_string()]).fields);
        h
    }

    fn ident(s: &str) -> Identifier {
        Identifier::new(s, Pos::new(1, 1))
    }

    #[test]
    fn unqualified_unique_column_resolves() {
        let h = header();
        assert_eq!(h.search_index(None, &ident("name")).unwrap(), 1);
        assert_eq!(h.search_index(None, &ident("CITY")).unwrap(), 3);
    }

    #[test]
    fn unqualified_duplicate_column_is_ambiguous() {
        let h = header();
        let err = h.search_index(None, &ident("id")).unwrap_err();
        assert!(matches!(err, QueryError::FieldAmbiguous { .. }));
    }

    #[test]
    fn qualified_column_resolves_to_its_view() {
        let h = header();
        assert_eq!(h.search_index(Some(&ident("t2")), &ident("id")).unwrap(), 2);
    }

    #[test]
    fn missing_column_is_an_error() {
        let h = header();
        let err = h.search_index(None, &ident("nope")).unwrap_err();
        assert!(matches!(err, QueryError::FieldNotExist { .. }));
    }

    #[test]
    fn column_number_resolves_from_table_fields() {
        let h = header();
        let expr = Expression::ColumnNumber {
            view: ident("t2"),
            number: 2,
            pos: Pos::new(1, 1),
        };
        assert_eq!(h.field_index(&expr).unwrap(), 3);
    }

    #[test]
    fn alias_matches_in_resolution() {
        let mut h = header();
        h.fields[1].aliases.push("n".to_string());
        assert_eq!(h.search_index(None, &ident("n")).unwrap(), 1);
    }
}
