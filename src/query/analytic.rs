//! # Analytic Functions
//!
//! OVER-clause evaluation. Before projection, every analytic subtree in the
//! select fields and ORDER BY keys is computed into a synthetic column
//! appended to the working view, and the subtree is replaced by a reference
//! to that column. Evaluation is strictly sequential: analytic results
//! depend on other records by definition.
//!
//! Partitioning uses the serialized sort-value key of the PARTITION BY
//! expressions. Within a partition, an ORDER BY clause makes the
//! aggregates cumulative (running over the ordered prefix); without one
//! they cover the whole partition.

use crate::error::{QueryError, QueryResult};
use crate::query::evaluator::Evaluator;
use crate::query::function::{call_aggregate, is_aggregate_function, json_agg, list_agg};
use crate::query::header::HeaderField;
use crate::query::record::Cell;
use crate::query::sort_value::{SortValue, SortValues};
use crate::query::view::View;
use crate::sql::ast::{
    CaseWhen, Expression, Identifier, NullPosition, OrderByClause, OrderDirection,
};
use crate::sql::token::Pos;
use crate::value::Primary;
use hashbrown::HashMap;
use std::sync::Arc;

pub fn contains_analytic(expr: &Expression) -> bool {
    match expr {
        Expression::AnalyticFunction { .. } => true,
        Expression::Parentheses(e)
        | Expression::UnaryArithmetic { operand: e, .. }
        | Expression::UnaryLogic { operand: e, .. } => contains_analytic(e),
        Expression::Arithmetic { lhs, rhs, .. }
        | Expression::Comparison { lhs, rhs, .. }
        | Expression::Logic { lhs, rhs, .. }
        | Expression::Is { lhs, rhs, .. } => contains_analytic(lhs) || contains_analytic(rhs),
        Expression::Concat { items, .. } => items.iter().any(contains_analytic),
        Expression::Function { args, .. } => args.iter().any(contains_analytic),
        Expression::Case {
            value,
            when,
            else_result,
            ..
        } => {
            value.as_deref().map(contains_analytic).unwrap_or(false)
                || when
                    .iter()
                    .any(|w| contains_analytic(&w.condition) || contains_analytic(&w.result))
                || else_result.as_deref().map(contains_analytic).unwrap_or(false)
        }
        _ => false,
    }
}

/// Rewrites every analytic subtree in `exprs` into a reference to a
/// computed column appended to `view`.
pub fn replace_analytic_functions(
    ev: &Evaluator,
    view: &mut View,
    exprs: &mut [Expression],
) -> QueryResult<()> {
    let mut counter = 0usize;
    for expr in exprs.iter_mut() {
        if contains_analytic(expr) {
            let rewritten = rewrite(ev, view, std::mem::replace(expr, placeholder()), &mut counter)?;
            *expr = rewritten;
        }
    }
    Ok(())
}

fn placeholder() -> Expression {
    Expression::AllColumns {
        pos: Pos::default(),
    }
}

fn rewrite(
    ev: &Evaluator,
    view: &mut View,
    expr: Expression,
    counter: &mut usize,
) -> QueryResult<Expression> {
    Ok(match expr {
        Expression::AnalyticFunction {
            name,
            distinct,
            args,
            partition,
            order_by,
            pos,
        } => {
            let values = compute(ev, view, &name, distinct, &args, &partition, &order_by, &pos)?;
            let column = format!("@__analytic_{}", *counter);
            *counter += 1;
            view.header.fields.push(HeaderField {
                column: column.clone(),
                ..Default::default()
            });
            for (record, value) in view.record_set.iter_mut().zip(values.into_iter()) {
                record.push(Cell::new(value));
            }
            Expression::FieldReference {
                view: None,
                column: Identifier::new(column, pos),
            }
        }
        Expression::Parentheses(e) => {
            Expression::Parentheses(Box::new(rewrite(ev, view, *e, counter)?))
        }
        Expression::UnaryArithmetic {
            operand,
            negative,
            pos,
        } => Expression::UnaryArithmetic {
            operand: Box::new(rewrite(ev, view, *operand, counter)?),
            negative,
            pos,
        },
        Expression::UnaryLogic { operand, pos } => Expression::UnaryLogic {
            operand: Box::new(rewrite(ev, view, *operand, counter)?),
            pos,
        },
        Expression::Arithmetic { lhs, op, rhs, pos } => Expression::Arithmetic {
            lhs: Box::new(rewrite(ev, view, *lhs, counter)?),
            op,
            rhs: Box::new(rewrite(ev, view, *rhs, counter)?),
            pos,
        },
        Expression::Comparison { lhs, op, rhs, pos } => Expression::Comparison {
            lhs: Box::new(rewrite(ev, view, *lhs, counter)?),
            op,
            rhs: Box::new(rewrite(ev, view, *rhs, counter)?),
            pos,
        },
        Expression::Logic { lhs, op, rhs, pos } => Expression::Logic {
            lhs: Box::new(rewrite(ev, view, *lhs, counter)?),
            op,
            rhs: Box::new(rewrite(ev, view, *rhs, counter)?),
            pos,
        },
        Expression::Concat { items, pos } => Expression::Concat {
            items: items
                .into_iter()
                .map(|i| rewrite(ev, view, i, counter))
                .collect::<QueryResult<Vec<_>>>()?,
            pos,
        },
        Expression::Function { name, args, pos } => Expression::Function {
            name,
            args: args
                .into_iter()
                .map(|a| rewrite(ev, view, a, counter))
                .collect::<QueryResult<Vec<_>>>()?,
            pos,
        },
        Expression::Case {
            value,
            when,
            else_result,
            pos,
        } => Expression::Case {
            value: match value {
                Some(v) => Some(Box::new(rewrite(ev, view, *v, counter)?)),
                None => None,
            },
            when: when
                .into_iter()
                .map(|w| {
                    Ok(CaseWhen {
                        condition: rewrite(ev, view, w.condition, counter)?,
                        result: rewrite(ev, view, w.result, counter)?,
                    })
                })
                .collect::<QueryResult<Vec<_>>>()?,
            else_result: match else_result {
                Some(e) => Some(Box::new(rewrite(ev, view, *e, counter)?)),
                None => None,
            },
            pos,
        },
        other => other,
    })
}

#[allow(clippy::too_many_arguments)]
fn compute(
    ev: &Evaluator,
    view: &View,
    name: &str,
    distinct: bool,
    args: &[Expression],
    partition: &[Expression],
    order_by: &Option<OrderByClause>,
    pos: &Pos,
) -> QueryResult<Vec<Primary>> {
    let uname = name.to_ascii_uppercase();
    let (formats, tz) = {
        let flags = ev.tx.flags();
        (flags.datetime_format.clone(), flags.timezone.clone())
    };
    let shared = Arc::new(view.clone());
    let n = shared.record_len();

    // Partition membership by serialized key, in encounter order.
    let mut partitions: Vec<Vec<usize>> = Vec::new();
    if partition.is_empty() {
        partitions.push((0..n).collect());
    } else {
        let mut index: HashMap<Vec<u8>, usize> = HashMap::new();
        for i in 0..n {
            let mut child = ev.child_for_record(shared.clone(), i);
            let mut key_values = Vec::with_capacity(partition.len());
            for p in partition {
                let value = child.evaluate(p)?;
                key_values.push(SortValue::new(&value, &formats, &tz));
            }
            let key = SortValues::new(key_values).serialize();
            match index.get(&key) {
                Some(&p) => partitions[p].push(i),
                None => {
                    index.insert(key, partitions.len());
                    partitions.push(vec![i]);
                }
            }
        }
    }

    let arg_values = |expr: &Expression, members: &[usize]| -> QueryResult<Vec<Primary>> {
        let mut values = Vec::with_capacity(members.len());
        for &m in members {
            let mut child = ev.child_for_record(shared.clone(), m);
            values.push(child.evaluate(expr)?);
        }
        Ok(values)
    };

    let mut result = vec![Primary::Null; n];

    for members in &mut partitions {
        // Order within the partition.
        let order_keys: Option<Vec<SortValues>> = match order_by {
            Some(clause) => {
                let directions: Vec<OrderDirection> = clause
                    .items
                    .iter()
                    .map(|i| i.direction.unwrap_or(OrderDirection::Ascending))
                    .collect();
                let null_positions: Vec<NullPosition> = clause
                    .items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| {
                        item.null_position.unwrap_or(match directions[i] {
                            OrderDirection::Ascending => NullPosition::First,
                            OrderDirection::Descending => NullPosition::Last,
                        })
                    })
                    .collect();

                let mut keys: HashMap<usize, SortValues> = HashMap::new();
                for &m in members.iter() {
                    let mut child = ev.child_for_record(shared.clone(), m);
                    let mut key_values = Vec::with_capacity(clause.items.len());
                    for item in &clause.items {
                        let value = child.evaluate(&item.expr)?;
                        key_values.push(SortValue::new(&value, &formats, &tz));
                    }
                    keys.insert(m, SortValues::new(key_values));
                }
                members.sort_by(|&a, &b| {
                    if keys[&a].less(&keys[&b], &directions, &null_positions) {
                        std::cmp::Ordering::Less
                    } else if keys[&b].less(&keys[&a], &directions, &null_positions) {
                        std::cmp::Ordering::Greater
                    } else {
                        a.cmp(&b)
                    }
                });
                Some(members.iter().map(|m| keys[m].clone()).collect())
            }
            None => None,
        };

        match uname.as_str() {
            "ROW_NUMBER" => {
                for (i, &m) in members.iter().enumerate() {
                    result[m] = Primary::Integer(i as i64 + 1);
                }
            }
            "RANK" | "DENSE_RANK" => {
                let dense = uname == "DENSE_RANK";
                match &order_keys {
                    // Without ORDER BY every record ties at rank 1.
                    None => {
                        for &m in members.iter() {
                            result[m] = Primary::Integer(1);
                        }
                    }
                    Some(keys) => {
                        let mut rank = 1i64;
                        let mut dense_rank = 1i64;
                        for (i, &m) in members.iter().enumerate() {
                            if 0 < i && !keys[i - 1].equivalent_to(&keys[i]) {
                                rank = i as i64 + 1;
                                dense_rank += 1;
                            }
                            result[m] = Primary::Integer(if dense { dense_rank } else { rank });
                        }
                    }
                }
            }
            "FIRST_VALUE" | "LAST_VALUE" => {
                check_args(pos, name, args, 1)?;
                let values = arg_values(&args[0], members)?;
                let value = if uname == "FIRST_VALUE" {
                    values.first().cloned().unwrap_or(Primary::Null)
                } else {
                    values.last().cloned().unwrap_or(Primary::Null)
                };
                for &m in members.iter() {
                    result[m] = value.clone();
                }
            }
            _ if is_aggregate_function(&uname) || uname == "LISTAGG" || uname == "JSON_AGG" => {
                if uname == "LISTAGG" {
                    if args.is_empty() || 2 < args.len() {
                        return Err(QueryError::FunctionArgumentLength {
                            pos: pos.clone(),
                            function: name.to_string(),
                            expected: "1 or 2".to_string(),
                        });
                    }
                } else {
                    check_args(pos, name, args, 1)?;
                }
                let separator = if uname == "LISTAGG" && args.len() == 2 {
                    let mut child = ev.child_for_record(shared.clone(), members[0]);
                    child.evaluate(&args[1])?.as_string().unwrap_or_default()
                } else {
                    String::new()
                };
                let values = arg_values(&args[0], members)?;
                let cumulative = order_by.is_some();

                for (i, &m) in members.iter().enumerate() {
                    let window: Vec<Primary> = if cumulative {
                        values[..=i].to_vec()
                    } else {
                        values.clone()
                    };
                    let window = if distinct {
                        distinct_values(window, &formats, &tz)
                    } else {
                        window
                    };
                    result[m] = match uname.as_str() {
                        "LISTAGG" => list_agg(&window, &separator),
                        "JSON_AGG" => json_agg(&window),
                        _ => call_aggregate(&uname, &window, &formats, &tz),
                    };
                }
            }
            _ => {
                return Err(QueryError::FunctionNotExist {
                    pos: pos.clone(),
                    function: name.to_string(),
                })
            }
        }
    }

    Ok(result)
}

fn check_args(pos: &Pos, name: &str, args: &[Expression], expected: usize) -> QueryResult<()> {
    if args.len() != expected {
        return Err(QueryError::FunctionArgumentLength {
            pos: pos.clone(),
            function: name.to_string(),
            expected: expected.to_string(),
        });
    }
    Ok(())
}

fn distinct_values(
    values: Vec<Primary>,
    formats: &[String],
    tz: &crate::config::Timezone,
) -> Vec<Primary> {
    let mut seen = hashbrown::HashSet::new();
    values
        .into_iter()
        .filter(|v| {
            let key = SortValues::new(vec![SortValue::new(v, formats, tz)]).serialize();
            seen.insert(key)
        })
        .collect()
}
