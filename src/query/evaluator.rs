//! # Expression Evaluator
//!
//! Recursive evaluation of the expression tree against the scope stack and
//! a stack of current-record positions. The record stack makes correlated
//! subqueries work: a field reference searches the innermost record first
//! and falls outward until some view resolves it; ambiguity stops the walk
//! immediately.
//!
//! Field indices are cached per record pointer, keyed by the expression's
//! printed form, so repeated references inside one record's evaluation
//! resolve once.
//!
//! ## Parallel drive
//!
//! [`Evaluator::evaluate_for_records`] is the single entry point for
//! per-record evaluation. It consults the static purity annotation of the
//! expressions: a tree containing a variable substitution evaluates
//! sequentially (a shared-state write under parallel evaluation would be
//! non-deterministic), anything else fans out over the worker pool.
//! Cancellation is checked at every evaluation entry.

use crate::error::{QueryError, QueryResult};
use crate::query::executor;
use crate::query::function::{
    self, call_aggregate, call_scalar, is_aggregate_function, is_scalar_function, FunctionContext,
};
use crate::query::scope::Scopes;
use crate::query::sort_value::{SortValue, SortValues};
use crate::query::view::View;
use crate::query::worker::{self, CancellationToken};
use crate::sql::ast::{
    CaseWhen, CursorStatusType, Expression, LogicOp, NullPosition, OrderByClause, OrderDirection,
};
use crate::sql::token::Pos;
use crate::transaction::Transaction;
use crate::value::{
    all_matches, any_matches, calculate, compare, compare_row_values, equal, is, like,
    ComparisonOp, Primary, Ternary,
};
use chrono::{DateTime, FixedOffset};
use hashbrown::HashMap;
use std::sync::Arc;

/// Placeholder bindings for one statement execution, by ordinal and name.
#[derive(Debug, Clone, Default)]
pub struct ReplaceValues {
    pub values: Vec<Primary>,
    pub names: HashMap<String, usize>,
}

#[derive(Clone)]
pub struct FilterRecord {
    pub view: Arc<View>,
    pub record_index: usize,
    cache: HashMap<String, usize>,
}

impl FilterRecord {
    pub fn new(view: Arc<View>, record_index: usize) -> Self {
        Self {
            view,
            record_index,
            cache: HashMap::new(),
        }
    }
}

pub struct Evaluator<'a> {
    pub tx: &'a Transaction,
    pub scopes: Scopes,
    pub records: Vec<FilterRecord>,
    pub cancel: CancellationToken,
    pub replace_values: Option<Arc<ReplaceValues>>,
    pub now: DateTime<FixedOffset>,
}

impl<'a> Evaluator<'a> {
    pub fn new(tx: &'a Transaction, scopes: Scopes, cancel: CancellationToken) -> Self {
        let now = tx.now();
        Self {
            tx,
            scopes,
            records: Vec::new(),
            cancel,
            replace_values: None,
            now,
        }
    }

    /// A child standing on one record of a view, keeping the outer record
    /// stack visible for correlated references.
    pub fn child_for_record(&self, view: Arc<View>, record_index: usize) -> Evaluator<'a> {
        let mut records = Vec::with_capacity(self.records.len() + 1);
        records.push(FilterRecord::new(view, record_index));
        records.extend(self.records.iter().cloned());
        Evaluator {
            tx: self.tx,
            scopes: self.scopes.shared(),
            records,
            cancel: self.cancel.clone(),
            replace_values: self.replace_values.clone(),
            now: self.now,
        }
    }

    /// A child with the same record stack, for subquery execution.
    pub fn child(&self) -> Evaluator<'a> {
        Evaluator {
            tx: self.tx,
            scopes: self.scopes.shared(),
            records: self.records.clone(),
            cancel: self.cancel.clone(),
            replace_values: self.replace_values.clone(),
            now: self.now,
        }
    }

    /// Runs `f` once per record of `view`, in parallel when every given
    /// expression is pure for rows and the CPU budget allows. `f` receives
    /// an evaluator standing on the record.
    pub fn evaluate_for_records<F>(
        &self,
        view: &Arc<View>,
        exprs: &[&Expression],
        f: F,
    ) -> QueryResult<()>
    where
        F: Fn(&mut Evaluator<'a>, usize) -> QueryResult<()> + Sync,
    {
        let pure = exprs.iter().all(|e| e.is_pure_for_rows());
        let cpu = if pure { self.tx.flags().cpu } else { 1 };
        worker::run(view.record_len(), cpu, &self.cancel, |i| {
            let mut child = self.child_for_record(view.clone(), i);
            f(&mut child, i)
        })
    }

    fn function_context(&self) -> (Vec<String>, crate::config::Timezone) {
        let flags = self.tx.flags();
        (flags.datetime_format.clone(), flags.timezone.clone())
    }

    pub fn evaluate(&mut self, expr: &Expression) -> QueryResult<Primary> {
        self.cancel.check()?;

        match expr {
            Expression::Primitive(p) => Ok(p.value.clone()),
            Expression::Parentheses(e) => self.evaluate(e),
            Expression::FieldReference { .. } | Expression::ColumnNumber { .. } => {
                self.eval_field_reference(expr)
            }
            Expression::Arithmetic { lhs, op, rhs, .. } => {
                let lhs = self.evaluate(lhs)?;
                if lhs.is_null() {
                    return Ok(Primary::Null);
                }
                let rhs = self.evaluate(rhs)?;
                Ok(calculate(&lhs, &rhs, *op))
            }
            Expression::UnaryArithmetic {
                operand, negative, ..
            } => {
                let value = self.evaluate(operand)?;
                if let Some(i) = value.as_integer() {
                    return Ok(Primary::Integer(if *negative { -i } else { i }));
                }
                match value.as_float() {
                    Some(f) => Ok(Primary::from_float(if *negative { -f } else { f })),
                    None => Ok(Primary::Null),
                }
            }
            Expression::Concat { items, .. } => {
                let mut joined = String::new();
                for item in items {
                    let value = self.evaluate(item)?;
                    match value.as_string() {
                        Some(s) => joined.push_str(&s),
                        None => return Ok(Primary::Null),
                    }
                }
                Ok(Primary::string(joined))
            }
            Expression::Comparison { lhs, op, rhs, pos } => {
                self.eval_comparison(lhs, *op, rhs, pos)
            }
            Expression::Is {
                lhs, rhs, negated, ..
            } => {
                let lhs = self.evaluate(lhs)?;
                let rhs = self.evaluate(rhs)?;
                let mut t = is(&lhs, &rhs);
                if *negated {
                    t = t.not();
                }
                Ok(Primary::Ternary(t))
            }
            Expression::Between {
                lhs,
                low,
                high,
                negated,
                ..
            } => self.eval_between(lhs, low, high, *negated),
            Expression::Like {
                lhs,
                pattern,
                negated,
                ..
            } => {
                let value = self.evaluate(lhs)?;
                let pattern = self.evaluate(pattern)?;
                let mut t = like(&value, &pattern);
                if *negated {
                    t = t.not();
                }
                Ok(Primary::Ternary(t))
            }
            Expression::In {
                lhs,
                values,
                negated,
                ..
            } => {
                let t = self.eval_any(lhs, ComparisonOp::Equal, values)?;
                Ok(Primary::Ternary(if *negated { t.not() } else { t }))
            }
            Expression::Any {
                lhs, op, values, ..
            } => Ok(Primary::Ternary(self.eval_any(lhs, *op, values)?)),
            Expression::All {
                lhs, op, values, ..
            } => Ok(Primary::Ternary(self.eval_all(lhs, *op, values)?)),
            Expression::Exists { query, .. } => {
                let view = executor::select_as_subquery(self, query)?;
                Ok(Primary::Ternary(Ternary::from_bool(0 < view.record_len())))
            }
            Expression::Subquery { query, pos } => self.eval_scalar_subquery(query, pos),
            Expression::Function { name, args, pos } => self.eval_function(name, args, pos),
            Expression::AggregateFunction {
                name,
                distinct,
                args,
                pos,
            } => self.eval_aggregate_function(name, *distinct, args, pos),
            Expression::ListFunction {
                name,
                distinct,
                args,
                order_by,
                pos,
            } => self.eval_list_function(name, *distinct, args, order_by.as_ref(), pos),
            Expression::AnalyticFunction { pos, .. } => Err(QueryError::InvalidValueExpression {
                pos: pos.clone(),
                expr: expr.to_string(),
            }),
            Expression::Case {
                value,
                when,
                else_result,
                ..
            } => self.eval_case(value.as_deref(), when, else_result.as_deref()),
            Expression::Logic { lhs, op, rhs, .. } => {
                let lhs = self.evaluate(lhs)?.as_ternary();
                match op {
                    LogicOp::And if lhs == Ternary::False => {
                        return Ok(Primary::Ternary(Ternary::False))
                    }
                    LogicOp::Or if lhs == Ternary::True => {
                        return Ok(Primary::Ternary(Ternary::True))
                    }
                    _ => {}
                }
                let rhs = self.evaluate(rhs)?.as_ternary();
                let t = match op {
                    LogicOp::And => lhs.and(rhs),
                    LogicOp::Or => lhs.or(rhs),
                };
                Ok(Primary::Ternary(t))
            }
            Expression::UnaryLogic { operand, .. } => {
                let t = self.evaluate(operand)?.as_ternary();
                Ok(Primary::Ternary(t.not()))
            }
            Expression::Variable { name, pos } => self.scopes.variable(name, pos),
            Expression::VariableSubstitution { name, value, pos } => {
                let value = self.evaluate(value)?;
                self.scopes.substitute_variable(name, value, pos)
            }
            Expression::EnvironmentVariable { name, .. } => Ok(Primary::string(
                std::env::var(name).unwrap_or_default(),
            )),
            Expression::RuntimeInformation { name, pos } => self.eval_runtime_information(name, pos),
            Expression::Flag { name, pos } => self.eval_flag(name, pos),
            Expression::CursorStatus {
                cursor,
                status,
                negated,
                ..
            } => {
                let mut t = match status {
                    CursorStatusType::Open => self.scopes.cursor_is_open(cursor)?,
                    CursorStatusType::InRange => self.scopes.cursor_is_in_range(cursor)?,
                };
                if *negated {
                    t = t.not();
                }
                Ok(Primary::Ternary(t))
            }
            Expression::CursorAttribute { cursor, .. } => {
                let count = self.scopes.cursor_count(cursor)?;
                Ok(Primary::Integer(count as i64))
            }
            Expression::Placeholder { name, ordinal, pos } => {
                let replace = self.replace_values.clone().ok_or_else(|| {
                    QueryError::StatementReplaceValueNotSpecified {
                        pos: pos.clone(),
                        holder: display_holder(name, *ordinal),
                    }
                })?;
                let idx = if name.is_empty() {
                    *ordinal - 1
                } else {
                    *replace.names.get(&name.to_uppercase()).ok_or_else(|| {
                        QueryError::StatementReplaceValueNotSpecified {
                            pos: pos.clone(),
                            holder: display_holder(name, *ordinal),
                        }
                    })?
                };
                replace.values.get(idx).cloned().ok_or_else(|| {
                    QueryError::StatementReplaceValueNotSpecified {
                        pos: pos.clone(),
                        holder: display_holder(name, *ordinal),
                    }
                })
            }
            Expression::RowValue { .. }
            | Expression::RowValueList { .. }
            | Expression::ValueList { .. }
            | Expression::JsonQuery { .. }
            | Expression::AllColumns { .. } => Err(QueryError::InvalidValueExpression {
                pos: expr.pos().clone(),
                expr: expr.to_string(),
            }),
        }
    }

    fn eval_field_reference(&mut self, expr: &Expression) -> QueryResult<Primary> {
        let expr_str = expr.to_string();

        for idx in 0..self.records.len() {
            if let Some(&i) = self.records[idx].cache.get(&expr_str) {
                let rec = &self.records[idx];
                return Ok(rec.view.record_set[rec.record_index][i].value().clone());
            }

            match self.records[idx].view.field_index(expr) {
                Ok(i) => {
                    let rec = &self.records[idx];
                    let field = &rec.view.header.fields[i];
                    if rec.view.is_grouped && field.is_from_table && !field.is_group_key {
                        return Err(QueryError::FieldIsNotGroupKey {
                            pos: expr.pos().clone(),
                            field: expr_str,
                        });
                    }
                    let value = rec.view.record_set[rec.record_index][i].value().clone();
                    self.records[idx].cache.insert(expr_str, i);
                    return Ok(value);
                }
                Err(err @ QueryError::FieldAmbiguous { .. }) => return Err(err),
                Err(_) => continue,
            }
        }

        Err(QueryError::FieldNotExist {
            pos: expr.pos().clone(),
            field: expr_str,
        })
    }

    fn eval_comparison(
        &mut self,
        lhs: &Expression,
        op: ComparisonOp,
        rhs: &Expression,
        _pos: &Pos,
    ) -> QueryResult<Primary> {
        let (formats, tz) = self.function_context();

        let lhs_values = match self.eval_row_value(lhs)? {
            Some(values) => values,
            None => return Ok(Primary::Ternary(Ternary::Unknown)),
        };

        if lhs_values.len() == 1 {
            let lhs_value = &lhs_values[0];
            if lhs_value.is_null() {
                return Ok(Primary::Ternary(Ternary::Unknown));
            }
            let rhs_value = self.evaluate(rhs)?;
            return Ok(Primary::Ternary(compare(
                lhs_value, &rhs_value, op, &formats, &tz,
            )));
        }

        let rhs_values = self.eval_row_value(rhs)?.unwrap_or_default();
        match compare_row_values(&lhs_values, &rhs_values, op, &formats, &tz) {
            Ok(t) => Ok(Primary::Ternary(t)),
            Err(()) => Err(QueryError::RowValueLengthInComparison {
                pos: rhs.pos().clone(),
                expected: lhs_values.len(),
            }),
        }
    }

    fn eval_between(
        &mut self,
        lhs: &Expression,
        low: &Expression,
        high: &Expression,
        negated: bool,
    ) -> QueryResult<Primary> {
        let (formats, tz) = self.function_context();

        let lhs_values = match self.eval_row_value(lhs)? {
            Some(values) => values,
            None => return Ok(Primary::Ternary(Ternary::Unknown)),
        };

        let t = if lhs_values.len() == 1 {
            let value = &lhs_values[0];
            if value.is_null() {
                Ternary::Unknown
            } else {
                let low = self.evaluate(low)?;
                let low_result =
                    compare(value, &low, ComparisonOp::GreaterThanOrEqual, &formats, &tz);
                if low_result == Ternary::False {
                    Ternary::False
                } else {
                    let high = self.evaluate(high)?;
                    let high_result =
                        compare(value, &high, ComparisonOp::LessThanOrEqual, &formats, &tz);
                    low_result.and(high_result)
                }
            }
        } else {
            let low_values = self.eval_row_value(low)?.unwrap_or_default();
            let low_result = compare_row_values(
                &lhs_values,
                &low_values,
                ComparisonOp::GreaterThanOrEqual,
                &formats,
                &tz,
            )
            .map_err(|()| QueryError::RowValueLengthInComparison {
                pos: low.pos().clone(),
                expected: lhs_values.len(),
            })?;
            if low_result == Ternary::False {
                Ternary::False
            } else {
                let high_values = self.eval_row_value(high)?.unwrap_or_default();
                let high_result = compare_row_values(
                    &lhs_values,
                    &high_values,
                    ComparisonOp::LessThanOrEqual,
                    &formats,
                    &tz,
                )
                .map_err(|()| QueryError::RowValueLengthInComparison {
                    pos: high.pos().clone(),
                    expected: lhs_values.len(),
                })?;
                low_result.and(high_result)
            }
        };

        Ok(Primary::Ternary(if negated { t.not() } else { t }))
    }

    fn values_for_list_comparison(
        &mut self,
        lhs: &Expression,
        values: &Expression,
    ) -> QueryResult<(Option<Vec<Primary>>, Vec<Vec<Primary>>)> {
        let row_value = self.eval_row_value(lhs)?;
        let list = match &row_value {
            Some(rv) if 1 < rv.len() => self.eval_row_value_list(values)?,
            _ => self.eval_array(values)?,
        };
        Ok((row_value, list))
    }

    fn list_length_error(
        &self,
        values: &Expression,
        element_index: usize,
        expected: usize,
    ) -> QueryError {
        match values {
            Expression::Subquery { pos, .. } => QueryError::SelectFieldLengthInComparison {
                pos: pos.clone(),
                expected,
            },
            Expression::JsonQuery { pos, .. } => QueryError::RowValueLengthInComparison {
                pos: pos.clone(),
                expected,
            },
            Expression::RowValueList { rows, .. } => {
                let pos = rows
                    .get(element_index)
                    .map(|r| r.pos().clone())
                    .unwrap_or_else(|| values.pos().clone());
                QueryError::RowValueLengthInComparison { pos, expected }
            }
            other => QueryError::RowValueLengthInComparison {
                pos: other.pos().clone(),
                expected,
            },
        }
    }

    fn eval_any(
        &mut self,
        lhs: &Expression,
        op: ComparisonOp,
        values: &Expression,
    ) -> QueryResult<Ternary> {
        let (formats, tz) = self.function_context();
        let (row_value, list) = self.values_for_list_comparison(lhs, values)?;
        let row_value = match row_value {
            Some(rv) => rv,
            None => return Ok(Ternary::Unknown),
        };
        any_matches(&row_value, &list, op, &formats, &tz)
            .map_err(|i| self.list_length_error(values, i, row_value.len()))
    }

    fn eval_all(
        &mut self,
        lhs: &Expression,
        op: ComparisonOp,
        values: &Expression,
    ) -> QueryResult<Ternary> {
        let (formats, tz) = self.function_context();
        let (row_value, list) = self.values_for_list_comparison(lhs, values)?;
        let row_value = match row_value {
            Some(rv) => rv,
            None => return Ok(Ternary::Unknown),
        };
        all_matches(&row_value, &list, op, &formats, &tz)
            .map_err(|i| self.list_length_error(values, i, row_value.len()))
    }

    fn eval_scalar_subquery(
        &mut self,
        query: &crate::sql::ast::SelectQuery,
        pos: &Pos,
    ) -> QueryResult<Primary> {
        let view = executor::select_as_subquery(self, query)?;
        if 1 < view.field_len() {
            return Err(QueryError::SubqueryTooManyFields { pos: pos.clone() });
        }
        if 1 < view.record_len() {
            return Err(QueryError::SubqueryTooManyRecords { pos: pos.clone() });
        }
        if view.record_len() < 1 {
            return Ok(Primary::Null);
        }
        Ok(view.record_set[0][0].value().clone())
    }

    /// Single record, one or more fields.
    pub fn eval_row_value(&mut self, expr: &Expression) -> QueryResult<Option<Vec<Primary>>> {
        match expr {
            Expression::Subquery { query, pos } => {
                let view = executor::select_as_subquery(self, query)?;
                if view.record_len() < 1 {
                    return Ok(None);
                }
                if 1 < view.record_len() {
                    return Err(QueryError::SubqueryTooManyRecords { pos: pos.clone() });
                }
                Ok(Some(
                    view.record_set[0].iter().map(|c| c.value().clone()).collect(),
                ))
            }
            Expression::JsonQuery {
                query,
                json_text,
                pos,
            } => {
                let (query, text) = self.eval_json_query_parameters(query, json_text)?;
                let (query, text) = match (query, text) {
                    (Some(q), Some(t)) => (q, t),
                    _ => return Ok(None),
                };
                let (_, rows) = crate::codec::json::load_table(&query, &text).map_err(|e| {
                    QueryError::LoadJson {
                        pos: pos.clone(),
                        message: e,
                    }
                })?;
                if rows.is_empty() {
                    return Ok(None);
                }
                if 1 < rows.len() {
                    return Err(QueryError::JsonQueryTooManyRecords { pos: pos.clone() });
                }
                Ok(Some(rows.into_iter().next().unwrap()))
            }
            Expression::ValueList { values, .. } => {
                let mut list = Vec::with_capacity(values.len());
                for v in values {
                    list.push(self.evaluate(v)?);
                }
                Ok(Some(list))
            }
            Expression::RowValue { value, .. } => self.eval_row_value(value),
            Expression::Parentheses(inner) => self.eval_row_value(inner),
            _ => {
                let value = self.evaluate(expr)?;
                Ok(Some(vec![value]))
            }
        }
    }

    /// Multiple records, multiple fields: the right side of a row-value
    /// IN / ANY / ALL.
    fn eval_row_value_list(&mut self, expr: &Expression) -> QueryResult<Vec<Vec<Primary>>> {
        match expr {
            Expression::Subquery { query, .. } => {
                let view = executor::select_as_subquery(self, query)?;
                Ok(view
                    .record_set
                    .iter()
                    .map(|r| r.iter().map(|c| c.value().clone()).collect())
                    .collect())
            }
            Expression::JsonQuery {
                query,
                json_text,
                pos,
            } => {
                let (query, text) = self.eval_json_query_parameters(query, json_text)?;
                let (query, text) = match (query, text) {
                    (Some(q), Some(t)) => (q, t),
                    _ => return Ok(Vec::new()),
                };
                let (_, rows) = crate::codec::json::load_table(&query, &text).map_err(|e| {
                    QueryError::LoadJson {
                        pos: pos.clone(),
                        message: e,
                    }
                })?;
                Ok(rows)
            }
            Expression::RowValueList { rows, .. } => {
                let mut list = Vec::with_capacity(rows.len());
                for row in rows {
                    match self.eval_row_value(row)? {
                        Some(values) => list.push(values),
                        None => list.push(Vec::new()),
                    }
                }
                Ok(list)
            }
            _ => Err(QueryError::InvalidValueExpression {
                pos: expr.pos().clone(),
                expr: expr.to_string(),
            }),
        }
    }

    /// Multiple records, single field: the right side of a scalar
    /// IN / ANY / ALL.
    fn eval_array(&mut self, expr: &Expression) -> QueryResult<Vec<Vec<Primary>>> {
        match expr {
            Expression::Subquery { query, pos } => {
                let view = executor::select_as_subquery(self, query)?;
                if 1 < view.field_len() {
                    return Err(QueryError::SubqueryTooManyFields { pos: pos.clone() });
                }
                Ok(view
                    .record_set
                    .iter()
                    .map(|r| vec![r[0].value().clone()])
                    .collect())
            }
            Expression::JsonQuery {
                query,
                json_text,
                pos,
            } => {
                let (query, text) = self.eval_json_query_parameters(query, json_text)?;
                let (query, text) = match (query, text) {
                    (Some(q), Some(t)) => (q, t),
                    _ => return Ok(Vec::new()),
                };
                let values = crate::codec::json::load_array(&query, &text).map_err(|e| {
                    QueryError::LoadJson {
                        pos: pos.clone(),
                        message: e,
                    }
                })?;
                Ok(values.into_iter().map(|v| vec![v]).collect())
            }
            Expression::ValueList { values, .. } => {
                let mut list = Vec::with_capacity(values.len());
                for v in values {
                    list.push(vec![self.evaluate(v)?]);
                }
                Ok(list)
            }
            Expression::RowValue { value, .. } => self.eval_array(value),
            _ => Err(QueryError::InvalidValueExpression {
                pos: expr.pos().clone(),
                expr: expr.to_string(),
            }),
        }
    }

    fn eval_json_query_parameters(
        &mut self,
        query: &Expression,
        json_text: &Expression,
    ) -> QueryResult<(Option<String>, Option<String>)> {
        let query = self.evaluate(query)?.as_string();
        let text = self.evaluate(json_text)?.as_string();
        Ok((query, text))
    }

    fn eval_function(
        &mut self,
        name: &str,
        args: &[Expression],
        pos: &Pos,
    ) -> QueryResult<Primary> {
        if is_scalar_function(name) {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(self.evaluate(arg)?);
            }
            let (formats, tz) = self.function_context();
            let ctx = FunctionContext {
                datetime_formats: &formats,
                timezone: &tz,
                now: self.now,
            };
            return call_scalar(pos, name, &values, &ctx);
        }

        let udf = self
            .scopes
            .function(name)
            .ok_or_else(|| QueryError::FunctionNotExist {
                pos: pos.clone(),
                function: name.to_string(),
            })?;

        if udf.is_aggregate {
            return self.eval_aggregate_function(name, false, args, pos);
        }

        udf.check_args_len(pos, name, args.len())?;
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.evaluate(arg)?);
        }
        executor::execute_scalar_function(self, &udf, values, pos)
    }

    fn grouped_record_checks(&self, name: &str, pos: &Pos) -> QueryResult<()> {
        if self.records.is_empty() {
            return Err(QueryError::UnpermittedFunctionStatement {
                pos: pos.clone(),
                function: name.to_string(),
            });
        }
        if !self.records[0].view.is_grouped {
            return Err(QueryError::NotGroupingRecords {
                pos: pos.clone(),
                function: name.to_string(),
            });
        }
        Ok(())
    }

    fn eval_aggregate_function(
        &mut self,
        name: &str,
        distinct: bool,
        args: &[Expression],
        pos: &Pos,
    ) -> QueryResult<Primary> {
        let builtin = is_aggregate_function(name);
        let udf = if builtin {
            None
        } else {
            let udf = self
                .scopes
                .function(name)
                .filter(|f| f.is_aggregate)
                .ok_or_else(|| QueryError::FunctionNotExist {
                    pos: pos.clone(),
                    function: name.to_string(),
                })?;
            // The first argument is the value list; the rest bind to the
            // declared parameters.
            udf.check_args_len(pos, name, args.len().saturating_sub(1))?;
            Some(udf)
        };

        if builtin && args.len() != 1 {
            return Err(QueryError::FunctionArgumentLength {
                pos: pos.clone(),
                function: name.to_string(),
                expected: "1".to_string(),
            });
        }
        if !builtin && args.is_empty() {
            return Err(QueryError::FunctionArgumentLength {
                pos: pos.clone(),
                function: name.to_string(),
                expected: "at least 1".to_string(),
            });
        }

        self.grouped_record_checks(name, pos)?;

        let list_expr: &Expression = &args[0];

        // COUNT of a literal or of * is the group size.
        if builtin && name.eq_ignore_ascii_case("COUNT") {
            if matches!(
                list_expr,
                Expression::Primitive(_) | Expression::AllColumns { .. }
            ) {
                let rec = &self.records[0];
                let group_len = rec.view.record_set[rec.record_index]
                    .first()
                    .map(|c| c.group_len())
                    .unwrap_or(0);
                return Ok(Primary::Integer(group_len as i64));
            }
        }
        let one = Expression::Primitive(crate::sql::ast::PrimitiveLiteral::integer(
            1,
            pos.clone(),
        ));
        let list_expr: &Expression = if matches!(list_expr, Expression::AllColumns { .. }) {
            &one
        } else {
            list_expr
        };

        let group_view = Arc::new(View::from_grouped_record(
            &self.records[0].view,
            self.records[0].record_index,
        ));
        let list = self.list_values_for_aggregate(&group_view, list_expr, distinct)?;

        match udf {
            Some(udf) => {
                let mut extra = Vec::new();
                for arg in &args[1..] {
                    extra.push(self.evaluate(arg)?);
                }
                executor::execute_aggregate_function(self, &udf, list, extra, pos)
            }
            None => {
                let (formats, tz) = self.function_context();
                Ok(call_aggregate(name, &list, &formats, &tz))
            }
        }
    }

    fn eval_list_function(
        &mut self,
        name: &str,
        distinct: bool,
        args: &[Expression],
        order_by: Option<&OrderByClause>,
        pos: &Pos,
    ) -> QueryResult<Primary> {
        let uname = name.to_ascii_uppercase();

        let separator = match uname.as_str() {
            "JSON_AGG" => {
                if args.len() != 1 {
                    return Err(QueryError::FunctionArgumentLength {
                        pos: pos.clone(),
                        function: name.to_string(),
                        expected: "1".to_string(),
                    });
                }
                String::new()
            }
            _ => {
                if args.is_empty() || 2 < args.len() {
                    return Err(QueryError::FunctionArgumentLength {
                        pos: pos.clone(),
                        function: name.to_string(),
                        expected: "1 or 2".to_string(),
                    });
                }
                if args.len() == 2 {
                    let v = self.evaluate(&args[1])?;
                    v.as_string().ok_or_else(|| QueryError::FunctionInvalidArgument {
                        pos: pos.clone(),
                        function: name.to_string(),
                        message: "the second argument must be a string".to_string(),
                    })?
                } else {
                    String::new()
                }
            }
        };

        self.grouped_record_checks(name, pos)?;

        let mut group_view = View::from_grouped_record(
            &self.records[0].view,
            self.records[0].record_index,
        );
        if let Some(order_by) = order_by {
            self.sort_view(&mut group_view, order_by)?;
        }
        let group_view = Arc::new(group_view);
        let list = self.list_values_for_aggregate(&group_view, &args[0], distinct)?;

        match uname.as_str() {
            "JSON_AGG" => Ok(function::json_agg(&list)),
            _ => Ok(function::list_agg(&list, &separator)),
        }
    }

    /// Evaluates the aggregate argument for every member of the group,
    /// de-duplicating by serialized sort value when DISTINCT is set.
    pub fn list_values_for_aggregate(
        &self,
        group_view: &Arc<View>,
        expr: &Expression,
        distinct: bool,
    ) -> QueryResult<Vec<Primary>> {
        let slots: Vec<parking_lot::Mutex<Primary>> = (0..group_view.record_len())
            .map(|_| parking_lot::Mutex::new(Primary::Null))
            .collect();
        self.evaluate_for_records(group_view, &[expr], |child, i| {
            let value = child.evaluate(expr)?;
            *slots[i].lock() = value;
            Ok(())
        })?;
        let mut values: Vec<Primary> = slots.into_iter().map(|s| s.into_inner()).collect();

        if distinct {
            let (formats, tz) = self.function_context();
            let mut seen = hashbrown::HashSet::new();
            values.retain(|v| {
                let sv = SortValues::new(vec![SortValue::new(v, &formats, &tz)]);
                seen.insert(sv.serialize())
            });
        }
        Ok(values)
    }

    /// Sorts a view in place by an ORDER BY clause evaluated against its
    /// own records, sequentially.
    pub fn sort_view(&self, view: &mut View, order_by: &OrderByClause) -> QueryResult<()> {
        let (formats, tz) = self.function_context();
        let directions: Vec<OrderDirection> = order_by
            .items
            .iter()
            .map(|i| i.direction.unwrap_or(OrderDirection::Ascending))
            .collect();
        let null_positions: Vec<NullPosition> = order_by
            .items
            .iter()
            .enumerate()
            .map(|(n, i)| {
                i.null_position.unwrap_or(match directions[n] {
                    OrderDirection::Ascending => NullPosition::First,
                    OrderDirection::Descending => NullPosition::Last,
                })
            })
            .collect();

        let shared = Arc::new(std::mem::take(view));
        let mut keys = Vec::with_capacity(shared.record_len());
        for i in 0..shared.record_len() {
            let mut child = self.child_for_record(shared.clone(), i);
            let mut sort_values = Vec::with_capacity(order_by.items.len());
            for item in &order_by.items {
                let value = child.evaluate(&item.expr)?;
                sort_values.push(SortValue::new(&value, &formats, &tz));
            }
            keys.push(SortValues::new(sort_values));
        }
        *view = Arc::try_unwrap(shared).unwrap_or_else(|arc| (*arc).clone());
        view.order_by_values(&keys, &directions, &null_positions);
        Ok(())
    }

    fn eval_case(
        &mut self,
        value: Option<&Expression>,
        when: &[CaseWhen],
        else_result: Option<&Expression>,
    ) -> QueryResult<Primary> {
        let (formats, tz) = self.function_context();
        let base = match value {
            Some(v) => Some(self.evaluate(v)?),
            None => None,
        };

        for arm in when {
            let condition = self.evaluate(&arm.condition)?;
            let matched = match &base {
                Some(base) => equal(base, &condition, &formats, &tz),
                None => condition.as_ternary(),
            };
            if matched == Ternary::True {
                return self.evaluate(&arm.result);
            }
        }

        match else_result {
            Some(e) => self.evaluate(e),
            None => Ok(Primary::Null),
        }
    }

    fn eval_runtime_information(&self, name: &str, pos: &Pos) -> QueryResult<Primary> {
        match name.to_ascii_uppercase().as_str() {
            "UNCOMMITTED" => Ok(Primary::Boolean(!self.tx.uncommitted.lock().is_empty())),
            "CREATED" => Ok(Primary::Integer(
                self.tx.uncommitted.lock().created_len() as i64
            )),
            "UPDATED" => Ok(Primary::Integer(
                self.tx.uncommitted.lock().updated_len() as i64
            )),
            "WORKING_DIRECTORY" => Ok(Primary::string(
                std::env::current_dir()
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_default(),
            )),
            "VERSION" => Ok(Primary::string(env!("CARGO_PKG_VERSION"))),
            _ => Err(QueryError::InvalidRuntimeInformation {
                pos: pos.clone(),
                name: format!("@#{}", name),
            }),
        }
    }

    fn eval_flag(&self, name: &str, pos: &Pos) -> QueryResult<Primary> {
        let flags = self.tx.flags();
        match name.to_ascii_uppercase().as_str() {
            "WAIT_TIMEOUT" => Ok(Primary::Float(flags.wait_timeout)),
            "CPU" => Ok(Primary::Integer(flags.cpu as i64)),
            "NO_HEADER" => Ok(Primary::Boolean(flags.no_header)),
            "WITHOUT_NULL" => Ok(Primary::Boolean(flags.without_null)),
            "WITHOUT_HEADER" => Ok(Primary::Boolean(flags.without_header)),
            "ENCLOSE_ALL" => Ok(Primary::Boolean(flags.enclose_all)),
            "PRETTY_PRINT" => Ok(Primary::Boolean(flags.pretty_print)),
            "EAST_ASIAN_ENCODING" => Ok(Primary::Boolean(flags.east_asian_encoding)),
            "COUNT_DIACRITICAL_SIGN" => Ok(Primary::Boolean(flags.count_diacritical_sign)),
            "COUNT_FORMAT_CODE" => Ok(Primary::Boolean(flags.count_format_code)),
            "COLOR" => Ok(Primary::Boolean(flags.color)),
            "QUIET" => Ok(Primary::Boolean(flags.quiet)),
            "STATS" => Ok(Primary::Boolean(flags.stats)),
            _ => {
                drop(flags);
                let flags = self.tx.flags();
                flags.show(name, pos).map(Primary::string)
            }
        }
    }
}

fn display_holder(name: &str, ordinal: usize) -> String {
    if name.is_empty() {
        format!("?{{{}}}", ordinal)
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Flags;
    use crate::query::header::Header;
    use crate::query::record::record_from_values;
    use crate::transaction::Session;

    fn tx() -> Transaction {
        let (session, _) = Session::with_buffer();
        Transaction::new(Flags::default(), session)
    }

    fn eval_str(tx: &Transaction, input: &str) -> QueryResult<Primary> {
        let flags = tx.flags();
        let statements = crate::sql::parse(
            &format!("select {}", input),
            None,
            &flags.datetime_format,
            &flags.timezone,
            false,
        )
        .unwrap();
        drop(flags);
        let crate::sql::ast::Statement::Select(query) = &statements[0] else {
            panic!("expected select");
        };
        let crate::sql::ast::SelectEntity::Select(clauses) = &query.entity else {
            panic!("expected clauses");
        };
        let expr = clauses.fields[0].expr.clone();
        let mut ev = Evaluator::new(tx, Scopes::new(), CancellationToken::new());
        ev.evaluate(&expr)
    }

    #[test]
    fn arithmetic_null_propagation() {
        let tx = tx();
        assert_eq!(eval_str(&tx, "1 + null").unwrap(), Primary::Null);
        assert_eq!(eval_str(&tx, "null * 3").unwrap(), Primary::Null);
        assert_eq!(eval_str(&tx, "1 + 2 * 3").unwrap(), Primary::Integer(7));
    }

    #[test]
    fn concat_null_propagation() {
        let tx = tx();
        assert_eq!(
            eval_str(&tx, "'a' || 'b' || 'c'").unwrap(),
            Primary::string("abc")
        );
        assert_eq!(eval_str(&tx, "'a' || null").unwrap(), Primary::Null);
    }

    #[test]
    fn three_valued_logic() {
        let tx = tx();
        assert_eq!(
            eval_str(&tx, "false and null").unwrap(),
            Primary::Ternary(Ternary::False)
        );
        assert_eq!(
            eval_str(&tx, "true or null").unwrap(),
            Primary::Ternary(Ternary::True)
        );
        assert_eq!(
            eval_str(&tx, "not null").unwrap(),
            Primary::Ternary(Ternary::Unknown)
        );
    }

    #[test]
    fn comparison_with_null_is_unknown() {
        let tx = tx();
        assert_eq!(
            eval_str(&tx, "1 = null").unwrap(),
            Primary::Ternary(Ternary::Unknown)
        );
        assert_eq!(
            eval_str(&tx, "null < 3").unwrap(),
            Primary::Ternary(Ternary::Unknown)
        );
    }

    #[test]
    fn like_and_between() {
        let tx = tx();
        assert_eq!(
            eval_str(&tx, "'hello' like 'h%'").unwrap(),
            Primary::Ternary(Ternary::True)
        );
        assert_eq!(
            eval_str(&tx, "'hello' like null").unwrap(),
            Primary::Ternary(Ternary::Unknown)
        );
        assert_eq!(
            eval_str(&tx, "5 between 1 and 10").unwrap(),
            Primary::Ternary(Ternary::True)
        );
        assert_eq!(
            eval_str(&tx, "5 not between 1 and 10").unwrap(),
            Primary::Ternary(Ternary::False)
        );
    }

    #[test]
    fn in_with_value_list() {
        let tx = tx();
        assert_eq!(
            eval_str(&tx, "2 in (1, 2, 3)").unwrap(),
            Primary::Ternary(Ternary::True)
        );
        assert_eq!(
            eval_str(&tx, "9 in (1, 2, 3)").unwrap(),
            Primary::Ternary(Ternary::False)
        );
        // An unmatched value against a list containing NULL is UNKNOWN.
        assert_eq!(
            eval_str(&tx, "9 in (1, null)").unwrap(),
            Primary::Ternary(Ternary::Unknown)
        );
    }

    #[test]
    fn row_value_comparison() {
        let tx = tx();
        assert_eq!(
            eval_str(&tx, "(1, 2) = (1, 2)").unwrap(),
            Primary::Ternary(Ternary::True)
        );
        assert_eq!(
            eval_str(&tx, "(1, 2) < (1, 3)").unwrap(),
            Primary::Ternary(Ternary::True)
        );
        let err = eval_str(&tx, "(1, 2) = (1, 2, 3)").unwrap_err();
        assert!(matches!(err, QueryError::RowValueLengthInComparison { expected: 2, .. }));
    }

    #[test]
    fn row_value_in_row_value_list() {
        let tx = tx();
        assert_eq!(
            eval_str(&tx, "(1, 2) in ((3, 4), (1, 2))").unwrap(),
            Primary::Ternary(Ternary::True)
        );
        let err = eval_str(&tx, "(1, 2) in ((3, 4), (1, 2, 3))").unwrap_err();
        assert!(matches!(
            err,
            QueryError::RowValueLengthInComparison { expected: 2, .. }
        ));
    }

    #[test]
    fn case_expressions() {
        let tx = tx();
        assert_eq!(
            eval_str(&tx, "case when false then 1 when true then 2 end").unwrap(),
            Primary::Integer(2)
        );
        assert_eq!(
            eval_str(&tx, "case when false then 1 end").unwrap(),
            Primary::Null
        );
        assert_eq!(
            eval_str(&tx, "case 2 when 1 then 'a' when 2 then 'b' end").unwrap(),
            Primary::string("b")
        );
    }

    #[test]
    fn variables_and_substitution() {
        let tx = tx();
        let scopes = Scopes::new();
        scopes
            .declare_variable("a", Primary::Integer(1), &Pos::new(1, 1))
            .unwrap();
        let mut ev = Evaluator::new(&tx, scopes.shared(), CancellationToken::new());

        let statements = crate::sql::parse(
            "select @a := @a + 1",
            None,
            &[],
            &crate::config::Timezone::Utc,
            false,
        )
        .unwrap();
        let crate::sql::ast::Statement::Select(query) = &statements[0] else {
            panic!()
        };
        let crate::sql::ast::SelectEntity::Select(clauses) = &query.entity else {
            panic!()
        };
        assert_eq!(
            ev.evaluate(&clauses.fields[0].expr).unwrap(),
            Primary::Integer(2)
        );
        assert_eq!(
            scopes.variable("a", &Pos::new(1, 1)).unwrap(),
            Primary::Integer(2)
        );
    }

    #[test]
    fn field_reference_against_record() {
        let tx = tx();
        let header = Header::from_table("t", &["c1".to_string(), "c2".to_string()]);
        let view = Arc::new(View::new(
            header,
            vec![record_from_values(vec![
                Primary::Integer(10),
                Primary::string("x"),
            ])],
        ));
        let parent = Evaluator::new(&tx, Scopes::new(), CancellationToken::new());
        let mut ev = parent.child_for_record(view, 0);

        let statements =
            crate::sql::parse("select c1, t.c2, t.1", None, &[], &crate::config::Timezone::Utc, false)
                .unwrap();
        let crate::sql::ast::Statement::Select(query) = &statements[0] else {
            panic!()
        };
        let crate::sql::ast::SelectEntity::Select(clauses) = &query.entity else {
            panic!()
        };
        assert_eq!(
            ev.evaluate(&clauses.fields[0].expr).unwrap(),
            Primary::Integer(10)
        );
        assert_eq!(
            ev.evaluate(&clauses.fields[1].expr).unwrap(),
            Primary::string("x")
        );
        assert_eq!(
            ev.evaluate(&clauses.fields[2].expr).unwrap(),
            Primary::Integer(10)
        );
    }

    #[test]
    fn aggregate_outside_group_errors() {
        let tx = tx();
        let err = eval_str(&tx, "sum(1)").unwrap_err();
        assert!(matches!(
            err,
            QueryError::UnpermittedFunctionStatement { .. }
        ));
    }

    #[test]
    fn aggregate_over_grouped_record() {
        let tx = tx();
        let header = Header::from_table("t", &["c1".to_string()]);
        let mut view = View::new(
            header,
            (1..=4)
                .map(|i| record_from_values(vec![Primary::Integer(i)]))
                .collect(),
        );
        view.group(None);
        let view = Arc::new(view);

        let parent = Evaluator::new(&tx, Scopes::new(), CancellationToken::new());
        let mut ev = parent.child_for_record(view, 0);

        let statements = crate::sql::parse(
            "select sum(c1), count(*), avg(c1)",
            None,
            &[],
            &crate::config::Timezone::Utc,
            false,
        )
        .unwrap();
        let crate::sql::ast::Statement::Select(query) = &statements[0] else {
            panic!()
        };
        let crate::sql::ast::SelectEntity::Select(clauses) = &query.entity else {
            panic!()
        };
        assert_eq!(
            ev.evaluate(&clauses.fields[0].expr).unwrap(),
            Primary::Integer(10)
        );
        assert_eq!(
            ev.evaluate(&clauses.fields[1].expr).unwrap(),
            Primary::Integer(4)
        );
        assert_eq!(
            ev.evaluate(&clauses.fields[2].expr).unwrap(),
            Primary::Float(2.5)
        );
    }

    #[test]
    fn placeholder_resolution() {
        let tx = tx();
        let statements = crate::sql::parse(
            "select ? + :second",
            None,
            &[],
            &crate::config::Timezone::Utc,
            true,
        )
        .unwrap();
        let crate::sql::ast::Statement::Select(query) = &statements[0] else {
            panic!()
        };
        let crate::sql::ast::SelectEntity::Select(clauses) = &query.entity else {
            panic!()
        };

        let mut ev = Evaluator::new(&tx, Scopes::new(), CancellationToken::new());
        // Without bindings, resolution fails.
        assert!(matches!(
            ev.evaluate(&clauses.fields[0].expr).unwrap_err(),
            QueryError::StatementReplaceValueNotSpecified { .. }
        ));

        let mut names = HashMap::new();
        names.insert("SECOND".to_string(), 1);
        ev.replace_values = Some(Arc::new(ReplaceValues {
            values: vec![Primary::Integer(40), Primary::Integer(2)],
            names,
        }));
        assert_eq!(
            ev.evaluate(&clauses.fields[0].expr).unwrap(),
            Primary::Integer(42)
        );
    }

    #[test]
    fn parallel_and_sequential_evaluation_agree() {
        let tx = tx();
        tx.update_flags(|f| f.cpu = 4);
        let header = Header::from_table("t", &["c1".to_string()]);
        let view = Arc::new(View::new(
            header,
            (0..1000)
                .map(|i| record_from_values(vec![Primary::Integer(i)]))
                .collect(),
        ));

        let statements = crate::sql::parse(
            "select c1 * 2",
            None,
            &[],
            &crate::config::Timezone::Utc,
            false,
        )
        .unwrap();
        let crate::sql::ast::Statement::Select(query) = &statements[0] else {
            panic!()
        };
        let crate::sql::ast::SelectEntity::Select(clauses) = &query.entity else {
            panic!()
        };
        let expr = &clauses.fields[0].expr;

        let ev = Evaluator::new(&tx, Scopes::new(), CancellationToken::new());
        let run = |cpu: usize| -> Vec<Primary> {
            tx.update_flags(|f| f.cpu = cpu);
            let slots: Vec<parking_lot::Mutex<Primary>> =
                (0..view.record_len()).map(|_| parking_lot::Mutex::new(Primary::Null)).collect();
            ev.evaluate_for_records(&view, &[expr], |child, i| {
                *slots[i].lock() = child.evaluate(expr)?;
                Ok(())
            })
            .unwrap();
            slots.into_iter().map(|s| s.into_inner()).collect()
        };

        assert_eq!(run(1), run(4));
    }
}
