//! # Error Taxonomy
//!
//! Every user-visible failure in the engine is a [`QueryError`] variant.
//! Variants that originate from a parsed node carry the node's [`Pos`], and
//! the rendered message leads with `[L:<line> C:<col>]` so diagnostics point
//! back into the source text.
//!
//! The executor is responsible for rolling back uncommitted writes created
//! by a failing statement before the error propagates; cancellation errors
//! ([`QueryError::ContextDone`]) are recovered only at the statement
//! boundary.

use crate::sql::token::Pos;
use thiserror::Error;

pub type QueryResult<T> = Result<T, QueryError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    #[error("{pos} {message}")]
    Syntax { pos: Pos, message: String },
    #[error("{pos} field {field} does not exist")]
    FieldNotExist { pos: Pos, field: String },
    #[error("{pos} field {field} is ambiguous")]
    FieldAmbiguous { pos: Pos, field: String },
    #[error("{pos} field {field} is not a group key")]
    FieldIsNotGroupKey { pos: Pos, field: String },
    #[error("{pos} table {table} is not loaded")]
    TableNotLoaded { pos: Pos, table: String },
    #[error("{pos} view {table} is undeclared")]
    UndeclaredTemporaryTable { pos: Pos, table: String },
    #[error("{pos} table {table} already exists")]
    TemporaryTableRedeclared { pos: Pos, table: String },
    #[error("{pos} field name {field} is duplicated")]
    DuplicateFieldName { pos: Pos, field: String },
    #[error("{pos} function {function} does not exist")]
    FunctionNotExist { pos: Pos, function: String },
    #[error("{pos} function {function} takes {expected} argument(s)")]
    FunctionArgumentLength {
        pos: Pos,
        function: String,
        expected: String,
    },
    #[error("{pos} {message} for function {function}")]
    FunctionInvalidArgument {
        pos: Pos,
        function: String,
        message: String,
    },
    #[error("{pos} function {function} cannot be used as a statement")]
    UnpermittedFunctionStatement { pos: Pos, function: String },
    #[error("{pos} function {function} cannot aggregate not grouping records")]
    NotGroupingRecords { pos: Pos, function: String },
    #[error("{pos} function {function} is redeclared")]
    FunctionRedeclared { pos: Pos, function: String },
    #[error("{pos} subquery returns too many fields, should return only one field")]
    SubqueryTooManyFields { pos: Pos },
    #[error("{pos} subquery returns too many records, should return only one record")]
    SubqueryTooManyRecords { pos: Pos },
    #[error("{pos} row value should contain exactly {expected} value(s)")]
    RowValueLengthInComparison { pos: Pos, expected: usize },
    #[error("{pos} select query should return exactly {expected} field(s)")]
    SelectFieldLengthInComparison { pos: Pos, expected: usize },
    #[error("{pos} json query returns too many records, should return only one record")]
    JsonQueryTooManyRecords { pos: Pos },
    #[error("{pos} json loading error: {message}")]
    LoadJson { pos: Pos, message: String },
    #[error("{pos} replace value for {holder} is not specified")]
    StatementReplaceValueNotSpecified { pos: Pos, holder: String },
    #[error("{pos} {expr} is an invalid value expression")]
    InvalidValueExpression { pos: Pos, expr: String },
    #[error("{pos} variable {variable} is undeclared")]
    UndeclaredVariable { pos: Pos, variable: String },
    #[error("{pos} variable {variable} is redeclared")]
    VariableRedeclared { pos: Pos, variable: String },
    #[error("{pos} cursor {cursor} is undeclared")]
    UndeclaredCursor { pos: Pos, cursor: String },
    #[error("{pos} cursor {cursor} is closed")]
    CursorClosed { pos: Pos, cursor: String },
    #[error("{pos} cursor {cursor} is already open")]
    CursorOpen { pos: Pos, cursor: String },
    #[error("{pos} cursor {cursor} is redeclared")]
    CursorRedeclared { pos: Pos, cursor: String },
    #[error("{pos} statement {name} is undeclared")]
    UndeclaredStatement { pos: Pos, name: String },
    #[error("{pos} statement {name} is a duplicate")]
    StatementRedeclared { pos: Pos, name: String },
    #[error("{pos} table name {alias} is a duplicate")]
    DuplicateTableAlias { pos: Pos, alias: String },
    #[error("{pos} fields in set clause and select query are not matched")]
    InsertSelectFieldLength { pos: Pos, expected: usize },
    #[error("{pos} row value should contain exactly {expected} value(s)")]
    InsertRowValueLength { pos: Pos, expected: usize },
    #[error("{pos} field length does not match")]
    FieldLengthNotMatch { pos: Pos },
    #[error("{pos} flag {flag} does not exist")]
    InvalidFlagName { pos: Pos, flag: String },
    #[error("{pos} {value} for {flag} is not allowed")]
    InvalidFlagValue { pos: Pos, flag: String, value: String },
    #[error("{pos} invalid variable symbol")]
    InvalidVariableSymbol { pos: Pos },
    #[error("{pos} {name} is an unknown runtime information")]
    InvalidRuntimeInformation { pos: Pos, name: String },
    #[error("{pos} recursion exceeded the limit")]
    RecursionExceededLimit { pos: Pos },
    #[error("query execution has been terminated: {cause}")]
    ContextDone { cause: String },
    #[error("file {path}: lock wait timeout period exceeded")]
    LockTimeout { path: String },
    #[error("{pos} file {path} does not exist")]
    FileNotExist { pos: Pos, path: String },
    #[error("{pos} file {path} already exists")]
    FileAlreadyExist { pos: Pos, path: String },
    #[error("{messages:?}")]
    ForcedUnlock { messages: Vec<String> },
    #[error("{message}")]
    Io { message: String },
    #[error("exit")]
    Exit { code: i32 },
}

impl QueryError {
    pub fn syntax(pos: Pos, message: impl Into<String>) -> Self {
        QueryError::Syntax {
            pos,
            message: message.into(),
        }
    }

    pub fn io(err: std::io::Error) -> Self {
        QueryError::Io {
            message: err.to_string(),
        }
    }

    /// Exit requests and cancellations pass through control flow untouched;
    /// everything else is a reportable statement error.
    pub fn is_control_flow(&self) -> bool {
        matches!(self, QueryError::Exit { .. })
    }
}

impl From<std::io::Error> for QueryError {
    fn from(err: std::io::Error) -> Self {
        QueryError::io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syntax_error_message_leads_with_position() {
        let err = QueryError::syntax(
            Pos::new(1, 8),
            "syntax error: unexpected token \"from\"".to_string(),
        );
        assert_eq!(
            err.to_string(),
            "[L:1 C:8] syntax error: unexpected token \"from\""
        );
    }

    #[test]
    fn position_includes_source_file_when_present() {
        let mut pos = Pos::new(3, 4);
        pos.source_file = Some("query.sql".to_string());
        let err = QueryError::FieldNotExist {
            pos,
            field: "c1".to_string(),
        };
        assert_eq!(err.to_string(), "query.sql [L:3 C:4] field c1 does not exist");
    }
}
