//! # Statement Tree
//!
//! The parser emits this closed, tagged family of statements and expression
//! nodes. Every node that can appear in a diagnostic carries the source
//! position of the token that introduced it.
//!
//! Expression nodes implement `Display`; the printed form is canonical SQL
//! and serves two purposes: it is the fingerprint for per-record field-index
//! caching in the evaluator, and parse→print→parse yields an equivalent
//! tree for well-formed input.
//!
//! Purity: [`Expression::is_pure_for_rows`] is the static annotation that
//! gates parallel per-record evaluation. An expression is impure when any
//! subtree writes to shared state, which in this language means a variable
//! substitution. The check is a plain AST walk computed on demand; there is
//! no speculative evaluation pass.

use super::token::{FetchPosition, Pos};
use crate::value::{ArithmeticOp, ComparisonOp, Primary, Ternary};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct Identifier {
    pub literal: String,
    pub quoted: bool,
    pub pos: Pos,
}

impl Identifier {
    pub fn new(literal: impl Into<String>, pos: Pos) -> Self {
        Self {
            literal: literal.into(),
            quoted: false,
            pos,
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.quoted {
            write!(f, "`{}`", self.literal.replace('`', "\\`"))
        } else {
            write!(f, "{}", self.literal)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Or,
}

impl fmt::Display for LogicOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", if *self == LogicOp::And { "AND" } else { "OR" })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullPosition {
    First,
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorStatusType {
    Open,
    InRange,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrimitiveLiteral {
    pub value: Primary,
    pub literal: String,
    pub pos: Pos,
}

impl PrimitiveLiteral {
    pub fn integer(value: i64, pos: Pos) -> Self {
        Self {
            value: Primary::Integer(value),
            literal: value.to_string(),
            pos,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaseWhen {
    pub condition: Expression,
    pub result: Expression,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Primitive(PrimitiveLiteral),
    FieldReference {
        view: Option<Identifier>,
        column: Identifier,
    },
    ColumnNumber {
        view: Identifier,
        number: i64,
        pos: Pos,
    },
    Variable {
        name: String,
        pos: Pos,
    },
    EnvironmentVariable {
        name: String,
        quoted: bool,
        pos: Pos,
    },
    RuntimeInformation {
        name: String,
        pos: Pos,
    },
    Flag {
        name: String,
        pos: Pos,
    },
    Placeholder {
        name: String,
        ordinal: usize,
        pos: Pos,
    },
    Parentheses(Box<Expression>),
    Arithmetic {
        lhs: Box<Expression>,
        op: ArithmeticOp,
        rhs: Box<Expression>,
        pos: Pos,
    },
    UnaryArithmetic {
        operand: Box<Expression>,
        negative: bool,
        pos: Pos,
    },
    Concat {
        items: Vec<Expression>,
        pos: Pos,
    },
    Comparison {
        lhs: Box<Expression>,
        op: ComparisonOp,
        rhs: Box<Expression>,
        pos: Pos,
    },
    Is {
        lhs: Box<Expression>,
        rhs: Box<Expression>,
        negated: bool,
        pos: Pos,
    },
    Between {
        lhs: Box<Expression>,
        low: Box<Expression>,
        high: Box<Expression>,
        negated: bool,
        pos: Pos,
    },
    Like {
        lhs: Box<Expression>,
        pattern: Box<Expression>,
        negated: bool,
        pos: Pos,
    },
    In {
        lhs: Box<Expression>,
        values: Box<Expression>,
        negated: bool,
        pos: Pos,
    },
    Any {
        lhs: Box<Expression>,
        op: ComparisonOp,
        values: Box<Expression>,
        pos: Pos,
    },
    All {
        lhs: Box<Expression>,
        op: ComparisonOp,
        values: Box<Expression>,
        pos: Pos,
    },
    Exists {
        query: Box<SelectQuery>,
        pos: Pos,
    },
    Subquery {
        query: Box<SelectQuery>,
        pos: Pos,
    },
    Function {
        name: String,
        args: Vec<Expression>,
        pos: Pos,
    },
    AggregateFunction {
        name: String,
        distinct: bool,
        args: Vec<Expression>,
        pos: Pos,
    },
    ListFunction {
        name: String,
        distinct: bool,
        args: Vec<Expression>,
        order_by: Option<OrderByClause>,
        pos: Pos,
    },
    AnalyticFunction {
        name: String,
        distinct: bool,
        args: Vec<Expression>,
        partition: Vec<Expression>,
        order_by: Option<OrderByClause>,
        pos: Pos,
    },
    Case {
        value: Option<Box<Expression>>,
        when: Vec<CaseWhen>,
        else_result: Option<Box<Expression>>,
        pos: Pos,
    },
    Logic {
        lhs: Box<Expression>,
        op: LogicOp,
        rhs: Box<Expression>,
        pos: Pos,
    },
    UnaryLogic {
        operand: Box<Expression>,
        pos: Pos,
    },
    CursorStatus {
        cursor: Identifier,
        status: CursorStatusType,
        negated: bool,
        pos: Pos,
    },
    CursorAttribute {
        cursor: Identifier,
        pos: Pos,
    },
    RowValue {
        value: Box<Expression>,
        pos: Pos,
    },
    RowValueList {
        rows: Vec<Expression>,
        pos: Pos,
    },
    ValueList {
        values: Vec<Expression>,
        pos: Pos,
    },
    JsonQuery {
        query: Box<Expression>,
        json_text: Box<Expression>,
        pos: Pos,
    },
    VariableSubstitution {
        name: String,
        value: Box<Expression>,
        pos: Pos,
    },
    AllColumns {
        pos: Pos,
    },
}

impl Expression {
    pub fn pos(&self) -> &Pos {
        match self {
            Expression::Primitive(p) => &p.pos,
            Expression::FieldReference { view, column } => {
                view.as_ref().map(|v| &v.pos).unwrap_or(&column.pos)
            }
            Expression::Parentheses(e) => e.pos(),
            Expression::ColumnNumber { pos, .. }
            | Expression::Variable { pos, .. }
            | Expression::EnvironmentVariable { pos, .. }
            | Expression::RuntimeInformation { pos, .. }
            | Expression::Flag { pos, .. }
            | Expression::Placeholder { pos, .. }
            | Expression::Arithmetic { pos, .. }
            | Expression::UnaryArithmetic { pos, .. }
            | Expression::Concat { pos, .. }
            | Expression::Comparison { pos, .. }
            | Expression::Is { pos, .. }
            | Expression::Between { pos, .. }
            | Expression::Like { pos, .. }
            | Expression::In { pos, .. }
            | Expression::Any { pos, .. }
            | Expression::All { pos, .. }
            | Expression::Exists { pos, .. }
            | Expression::Subquery { pos, .. }
            | Expression::Function { pos, .. }
            | Expression::AggregateFunction { pos, .. }
            | Expression::ListFunction { pos, .. }
            | Expression::AnalyticFunction { pos, .. }
            | Expression::Case { pos, .. }
            | Expression::Logic { pos, .. }
            | Expression::UnaryLogic { pos, .. }
            | Expression::CursorStatus { pos, .. }
            | Expression::CursorAttribute { pos, .. }
            | Expression::RowValue { pos, .. }
            | Expression::RowValueList { pos, .. }
            | Expression::ValueList { pos, .. }
            | Expression::JsonQuery { pos, .. }
            | Expression::VariableSubstitution { pos, .. }
            | Expression::AllColumns { pos } => pos,
        }
    }

    /// True when evaluating this expression for one record cannot write to
    /// shared state. Variable substitution is the only impure node; its
    /// presence anywhere in the tree forces sequential evaluation.
    pub fn is_pure_for_rows(&self) -> bool {
        match self {
            Expression::VariableSubstitution { .. } => false,
            Expression::Parentheses(e) | Expression::UnaryLogic { operand: e, .. } => {
                e.is_pure_for_rows()
            }
            Expression::UnaryArithmetic { operand, .. } => operand.is_pure_for_rows(),
            Expression::Arithmetic { lhs, rhs, .. }
            | Expression::Comparison { lhs, rhs, .. }
            | Expression::Logic { lhs, rhs, .. }
            | Expression::Is { lhs, rhs, .. } => lhs.is_pure_for_rows() && rhs.is_pure_for_rows(),
            Expression::Between { lhs, low, high, .. } => {
                lhs.is_pure_for_rows() && low.is_pure_for_rows() && high.is_pure_for_rows()
            }
            Expression::Like { lhs, pattern, .. } => {
                lhs.is_pure_for_rows() && pattern.is_pure_for_rows()
            }
            Expression::In { lhs, values, .. } => {
                lhs.is_pure_for_rows() && values.is_pure_for_rows()
            }
            Expression::Any { lhs, values, .. } | Expression::All { lhs, values, .. } => {
                lhs.is_pure_for_rows() && values.is_pure_for_rows()
            }
            Expression::Concat { items, .. } | Expression::ValueList { values: items, .. } => {
                items.iter().all(Expression::is_pure_for_rows)
            }
            Expression::RowValue { value, .. } => value.is_pure_for_rows(),
            Expression::RowValueList { rows, .. } => rows.iter().all(Expression::is_pure_for_rows),
            Expression::JsonQuery {
                query, json_text, ..
            } => query.is_pure_for_rows() && json_text.is_pure_for_rows(),
            Expression::Function { args, .. } | Expression::AggregateFunction { args, .. } => {
                args.iter().all(Expression::is_pure_for_rows)
            }
            Expression::ListFunction { args, .. } | Expression::AnalyticFunction { args, .. } => {
                args.iter().all(Expression::is_pure_for_rows)
            }
            Expression::Case {
                value,
                when,
                else_result,
                ..
            } => {
                value.as_deref().map_or(true, Expression::is_pure_for_rows)
                    && when
                        .iter()
                        .all(|w| w.condition.is_pure_for_rows() && w.result.is_pure_for_rows())
                    && else_result
                        .as_deref()
                        .map_or(true, Expression::is_pure_for_rows)
            }
            _ => true,
        }
    }
}

fn quote_string(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Primitive(p) => match &p.value {
                Primary::String(_) | Primary::Datetime(_) => {
                    write!(f, "{}", quote_string(&p.literal))
                }
                Primary::Ternary(Ternary::Unknown) if p.literal.is_empty() => write!(f, "UNKNOWN"),
                _ => write!(f, "{}", p.literal),
            },
            Expression::FieldReference { view, column } => match view {
                Some(v) => write!(f, "{}.{}", v, column),
                None => write!(f, "{}", column),
            },
            Expression::ColumnNumber { view, number, .. } => write!(f, "{}.{}", view, number),
            Expression::Variable { name, .. } => write!(f, "@{}", name),
            Expression::EnvironmentVariable { name, quoted, .. } => {
                if *quoted {
                    write!(f, "@%`{}`", name)
                } else {
                    write!(f, "@%{}", name)
                }
            }
            Expression::RuntimeInformation { name, .. } => write!(f, "@#{}", name),
            Expression::Flag { name, .. } => write!(f, "@@{}", name),
            Expression::Placeholder { name, .. } => {
                if name.is_empty() {
                    write!(f, "?")
                } else {
                    write!(f, "{}", name)
                }
            }
            Expression::Parentheses(e) => write!(f, "({})", e),
            Expression::Arithmetic { lhs, op, rhs, .. } => write!(f, "{} {} {}", lhs, op, rhs),
            Expression::UnaryArithmetic {
                operand, negative, ..
            } => write!(f, "{}{}", if *negative { "-" } else { "+" }, operand),
            Expression::Concat { items, .. } => {
                let parts: Vec<String> = items.iter().map(|i| i.to_string()).collect();
                write!(f, "{}", parts.join(" || "))
            }
            Expression::Comparison { lhs, op, rhs, .. } => write!(f, "{} {} {}", lhs, op, rhs),
            Expression::Is {
                lhs, rhs, negated, ..
            } => write!(f, "{} IS {}{}", lhs, if *negated { "NOT " } else { "" }, rhs),
            Expression::Between {
                lhs,
                low,
                high,
                negated,
                ..
            } => write!(
                f,
                "{} {}BETWEEN {} AND {}",
                lhs,
                if *negated { "NOT " } else { "" },
                low,
                high
            ),
            Expression::Like {
                lhs,
                pattern,
                negated,
                ..
            } => write!(
                f,
                "{} {}LIKE {}",
                lhs,
                if *negated { "NOT " } else { "" },
                pattern
            ),
            Expression::In {
                lhs,
                values,
                negated,
                ..
            } => write!(
                f,
                "{} {}IN {}",
                lhs,
                if *negated { "NOT " } else { "" },
                values
            ),
            Expression::Any {
                lhs, op, values, ..
            } => write!(f, "{} {} ANY {}", lhs, op, values),
            Expression::All {
                lhs, op, values, ..
            } => write!(f, "{} {} ALL {}", lhs, op, values),
            Expression::Exists { query, .. } => write!(f, "EXISTS ({})", query),
            Expression::Subquery { query, .. } => write!(f, "({})", query),
            Expression::Function { name, args, .. } => {
                let parts: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                write!(f, "{}({})", name, parts.join(", "))
            }
            Expression::AggregateFunction {
                name,
                distinct,
                args,
                ..
            } => {
                let parts: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                write!(
                    f,
                    "{}({}{})",
                    name,
                    if *distinct { "DISTINCT " } else { "" },
                    parts.join(", ")
                )
            }
            Expression::ListFunction {
                name,
                distinct,
                args,
                order_by,
                ..
            } => {
                let parts: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                write!(
                    f,
                    "{}({}{})",
                    name,
                    if *distinct { "DISTINCT " } else { "" },
                    parts.join(", ")
                )?;
                if let Some(ob) = order_by {
                    write!(f, " WITHIN GROUP ({})", ob)?;
                }
                Ok(())
            }
            Expression::AnalyticFunction {
                name,
                distinct,
                args,
                partition,
                order_by,
                ..
            } => {
                let parts: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                write!(
                    f,
                    "{}({}{}) OVER (",
                    name,
                    if *distinct { "DISTINCT " } else { "" },
                    parts.join(", ")
                )?;
                let mut wrote = false;
                if !partition.is_empty() {
                    let keys: Vec<String> = partition.iter().map(|p| p.to_string()).collect();
                    write!(f, "PARTITION BY {}", keys.join(", "))?;
                    wrote = true;
                }
                if let Some(ob) = order_by {
                    if wrote {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", ob)?;
                }
                write!(f, ")")
            }
            Expression::Case {
                value,
                when,
                else_result,
                ..
            } => {
                write!(f, "CASE")?;
                if let Some(v) = value {
                    write!(f, " {}", v)?;
                }
                for w in when {
                    write!(f, " WHEN {} THEN {}", w.condition, w.result)?;
                }
                if let Some(e) = else_result {
                    write!(f, " ELSE {}", e)?;
                }
                write!(f, " END")
            }
            Expression::Logic { lhs, op, rhs, .. } => write!(f, "{} {} {}", lhs, op, rhs),
            Expression::UnaryLogic { operand, .. } => write!(f, "NOT {}", operand),
            Expression::CursorStatus {
                cursor,
                status,
                negated,
                ..
            } => {
                let status = match status {
                    CursorStatusType::Open => "OPEN",
                    CursorStatusType::InRange => "IN RANGE",
                };
                write!(
                    f,
                    "CURSOR {} IS {}{}",
                    cursor,
                    if *negated { "NOT " } else { "" },
                    status
                )
            }
            Expression::CursorAttribute { cursor, .. } => write!(f, "CURSOR {} COUNT", cursor),
            Expression::RowValue { value, .. } => write!(f, "{}", value),
            Expression::RowValueList { rows, .. } => {
                let parts: Vec<String> = rows.iter().map(|r| r.to_string()).collect();
                write!(f, "({})", parts.join(", "))
            }
            Expression::ValueList { values, .. } => {
                let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "({})", parts.join(", "))
            }
            Expression::JsonQuery {
                query, json_text, ..
            } => write!(f, "JSON_ROW({}, {})", query, json_text),
            Expression::VariableSubstitution { name, value, .. } => {
                write!(f, "@{} := {}", name, value)
            }
            Expression::AllColumns { .. } => write!(f, "*"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderByClause {
    pub items: Vec<OrderItem>,
}

impl fmt::Display for OrderByClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.items.iter().map(|i| i.to_string()).collect();
        write!(f, "ORDER BY {}", parts.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub expr: Expression,
    pub direction: Option<OrderDirection>,
    pub null_position: Option<NullPosition>,
}

impl fmt::Display for OrderItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr)?;
        match self.direction {
            Some(OrderDirection::Ascending) => write!(f, " ASC")?,
            Some(OrderDirection::Descending) => write!(f, " DESC")?,
            None => {}
        }
        match self.null_position {
            Some(NullPosition::First) => write!(f, " NULLS FIRST")?,
            Some(NullPosition::Last) => write!(f, " NULLS LAST")?,
            None => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    pub with: Option<WithClause>,
    pub entity: SelectEntity,
    pub order_by: Option<OrderByClause>,
    pub limit: Option<LimitClause>,
    pub offset: Option<OffsetClause>,
    pub pos: Pos,
}

impl fmt::Display for SelectQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(with) = &self.with {
            write!(f, "{} ", with)?;
        }
        write!(f, "{}", self.entity)?;
        if let Some(ob) = &self.order_by {
            write!(f, " {}", ob)?;
        }
        if let Some(limit) = &self.limit {
            write!(f, " {}", limit)?;
        }
        if let Some(offset) = &self.offset {
            write!(f, " {}", offset)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectEntity {
    Select(SelectClauses),
    SetOperation {
        lhs: Box<SelectEntity>,
        operator: SetOperator,
        all: bool,
        rhs: Box<SelectEntity>,
        pos: Pos,
    },
}

impl SelectEntity {
    pub fn pos(&self) -> &Pos {
        match self {
            SelectEntity::Select(c) => &c.pos,
            SelectEntity::SetOperation { pos, .. } => pos,
        }
    }
}

impl fmt::Display for SelectEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectEntity::Select(c) => write!(f, "{}", c),
            SelectEntity::SetOperation {
                lhs,
                operator,
                all,
                rhs,
                ..
            } => write!(
                f,
                "{} {}{} {}",
                lhs,
                operator,
                if *all { " ALL" } else { "" },
                rhs
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOperator {
    Union,
    Intersect,
    Except,
}

impl fmt::Display for SetOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SetOperator::Union => "UNION",
            SetOperator::Intersect => "INTERSECT",
            SetOperator::Except => "EXCEPT",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectClauses {
    pub distinct: bool,
    pub fields: Vec<QueryField>,
    pub from: Option<FromClause>,
    pub where_clause: Option<Expression>,
    pub group_by: Vec<Expression>,
    pub having: Option<Expression>,
    pub pos: Pos,
}

impl fmt::Display for SelectClauses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT ")?;
        if self.distinct {
            write!(f, "DISTINCT ")?;
        }
        let fields: Vec<String> = self.fields.iter().map(|x| x.to_string()).collect();
        write!(f, "{}", fields.join(", "))?;
        if let Some(from) = &self.from {
            write!(f, " {}", from)?;
        }
        if let Some(w) = &self.where_clause {
            write!(f, " WHERE {}", w)?;
        }
        if !self.group_by.is_empty() {
            let keys: Vec<String> = self.group_by.iter().map(|x| x.to_string()).collect();
            write!(f, " GROUP BY {}", keys.join(", "))?;
        }
        if let Some(h) = &self.having {
            write!(f, " HAVING {}", h)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryField {
    pub expr: Expression,
    pub alias: Option<Identifier>,
}

impl fmt::Display for QueryField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr)?;
        if let Some(alias) = &self.alias {
            write!(f, " AS {}", alias)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FromClause {
    pub tables: Vec<TableObject>,
    pub pos: Pos,
}

impl fmt::Display for FromClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.tables.iter().map(|t| t.to_string()).collect();
        write!(f, "FROM {}", parts.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableObject {
    pub expr: TableExpr,
    pub alias: Option<Identifier>,
    pub pos: Pos,
}

impl fmt::Display for TableObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr)?;
        if let Some(alias) = &self.alias {
            write!(f, " AS {}", alias)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableExpr {
    Identifier(Identifier),
    Dual(Pos),
    Subquery(Box<SelectQuery>),
    Join(Box<Join>),
}

impl fmt::Display for TableExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableExpr::Identifier(ident) => write!(f, "{}", ident),
            TableExpr::Dual(_) => write!(f, "DUAL"),
            TableExpr::Subquery(q) => write!(f, "({})", q),
            TableExpr::Join(j) => write!(f, "{}", j),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Cross,
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JoinCondition {
    On(Expression),
    Using(Vec<Identifier>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub lhs: TableObject,
    pub rhs: TableObject,
    pub join_type: JoinType,
    pub natural: bool,
    pub condition: Option<JoinCondition>,
    pub pos: Pos,
}

impl fmt::Display for Join {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.lhs)?;
        if self.natural {
            write!(f, "NATURAL ")?;
        }
        let jt = match self.join_type {
            JoinType::Cross => "CROSS JOIN",
            JoinType::Inner => "JOIN",
            JoinType::LeftOuter => "LEFT JOIN",
            JoinType::RightOuter => "RIGHT JOIN",
            JoinType::FullOuter => "FULL JOIN",
        };
        write!(f, "{} {}", jt, self.rhs)?;
        match &self.condition {
            Some(JoinCondition::On(e)) => write!(f, " ON {}", e),
            Some(JoinCondition::Using(fields)) => {
                let parts: Vec<String> = fields.iter().map(|x| x.to_string()).collect();
                write!(f, " USING ({})", parts.join(", "))
            }
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WithClause {
    pub tables: Vec<InlineTableDef>,
}

impl fmt::Display for WithClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.tables.iter().map(|t| t.to_string()).collect();
        write!(f, "WITH {}", parts.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InlineTableDef {
    pub recursive: bool,
    pub name: Identifier,
    pub columns: Option<Vec<Identifier>>,
    pub query: SelectQuery,
    pub pos: Pos,
}

impl fmt::Display for InlineTableDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.recursive {
            write!(f, "RECURSIVE ")?;
        }
        write!(f, "{}", self.name)?;
        if let Some(cols) = &self.columns {
            let parts: Vec<String> = cols.iter().map(|c| c.to_string()).collect();
            write!(f, " ({})", parts.join(", "))?;
        }
        write!(f, " AS ({})", self.query)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LimitClause {
    pub value: Expression,
    pub percent: bool,
    pub with_ties: bool,
    pub pos: Pos,
}

impl fmt::Display for LimitClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LIMIT {}", self.value)?;
        if self.percent {
            write!(f, " PERCENT")?;
        }
        if self.with_ties {
            write!(f, " WITH TIES")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OffsetClause {
    pub value: Expression,
    pub pos: Pos,
}

impl fmt::Display for OffsetClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OFFSET {}", self.value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertQuery {
    pub table: Identifier,
    pub fields: Vec<Expression>,
    pub values: Vec<Expression>,
    pub query: Option<SelectQuery>,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateQuery {
    pub table: Identifier,
    pub set_list: Vec<UpdateSet>,
    pub where_clause: Option<Expression>,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateSet {
    pub field: Expression,
    pub value: Expression,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteQuery {
    pub table: Identifier,
    pub where_clause: Option<Expression>,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateTable {
    pub table: Identifier,
    pub fields: Vec<Identifier>,
    pub query: Option<SelectQuery>,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDefault {
    pub column: Identifier,
    pub value: Option<Expression>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnPosition {
    First,
    Last,
    After(Identifier),
    Before(Identifier),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddColumns {
    pub table: Identifier,
    pub columns: Vec<ColumnDefault>,
    pub position: Option<ColumnPosition>,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DropColumns {
    pub table: Identifier,
    pub columns: Vec<Expression>,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenameColumn {
    pub table: Identifier,
    pub old: Expression,
    pub new: Identifier,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableAssignment {
    pub name: String,
    pub value: Option<Expression>,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDeclaration {
    pub name: Identifier,
    pub is_aggregate: bool,
    pub cursor: Option<Identifier>,
    pub parameters: Vec<VariableAssignment>,
    pub body: Vec<Statement>,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElseIf {
    pub condition: Expression,
    pub body: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfStatement {
    pub condition: Expression,
    pub body: Vec<Statement>,
    pub else_if: Vec<ElseIf>,
    pub else_body: Vec<Statement>,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WhileStatement {
    pub condition: Expression,
    pub body: Vec<Statement>,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WhileInCursor {
    pub variables: Vec<String>,
    pub cursor: Identifier,
    pub body: Vec<Statement>,
    pub pos: Pos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowObjectType {
    Tables,
    Views,
    Cursors,
    Functions,
    Statements,
    Flags,
    Env,
    Runinfo,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplaceValue {
    pub value: Expression,
    pub name: Option<Identifier>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(SelectQuery),
    Insert(InsertQuery),
    Update(UpdateQuery),
    Delete(DeleteQuery),
    CreateTable(CreateTable),
    AddColumns(AddColumns),
    DropColumns(DropColumns),
    RenameColumn(RenameColumn),
    DeclareView {
        view: Identifier,
        fields: Vec<Identifier>,
        query: Option<SelectQuery>,
        pos: Pos,
    },
    DisposeView {
        view: Identifier,
        pos: Pos,
    },
    VariableDeclaration {
        assignments: Vec<VariableAssignment>,
        pos: Pos,
    },
    VariableSubstitution {
        name: String,
        value: Expression,
        pos: Pos,
    },
    DisposeVariable {
        name: String,
        pos: Pos,
    },
    DeclareCursor {
        cursor: Identifier,
        query: SelectQuery,
        pos: Pos,
    },
    OpenCursor {
        cursor: Identifier,
        pos: Pos,
    },
    CloseCursor {
        cursor: Identifier,
        pos: Pos,
    },
    DisposeCursor {
        cursor: Identifier,
        pos: Pos,
    },
    FetchCursor {
        cursor: Identifier,
        position: FetchPosition,
        number: Option<Expression>,
        variables: Vec<String>,
        pos: Pos,
    },
    DeclareFunction(FunctionDeclaration),
    DisposeFunction {
        name: Identifier,
        pos: Pos,
    },
    If(IfStatement),
    While(WhileStatement),
    WhileInCursor(WhileInCursor),
    Continue {
        pos: Pos,
    },
    Break {
        pos: Pos,
    },
    Exit {
        code: Option<Expression>,
        pos: Pos,
    },
    Return {
        value: Option<Expression>,
        pos: Pos,
    },
    Print {
        value: Expression,
        pos: Pos,
    },
    Printf {
        format: Expression,
        values: Vec<Expression>,
        pos: Pos,
    },
    Source {
        file: Expression,
        pos: Pos,
    },
    Execute {
        statements: Expression,
        values: Vec<Expression>,
        pos: Pos,
    },
    SetFlag {
        name: String,
        value: Expression,
        pos: Pos,
    },
    SetEnvVar {
        name: String,
        value: Expression,
        pos: Pos,
    },
    UnsetEnvVar {
        name: String,
        pos: Pos,
    },
    ShowFlag {
        name: String,
        pos: Pos,
    },
    ShowObjects {
        object_type: ShowObjectType,
        pos: Pos,
    },
    ShowFields {
        table: Identifier,
        pos: Pos,
    },
    Prepare {
        name: Identifier,
        statement: String,
        pos: Pos,
    },
    ExecutePrepared {
        name: Identifier,
        values: Vec<ReplaceValue>,
        pos: Pos,
    },
    DisposePrepared {
        name: Identifier,
        pos: Pos,
    },
    Commit {
        pos: Pos,
    },
    Rollback {
        pos: Pos,
    },
    ExternalCommand {
        command: String,
        pos: Pos,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos() -> Pos {
        Pos::new(1, 1)
    }

    #[test]
    fn field_reference_prints_with_optional_view() {
        let bare = Expression::FieldReference {
            view: None,
            column: Identifier::new("c1", pos()),
        };
        assert_eq!(bare.to_string(), "c1");

        let qualified = Expression::FieldReference {
            view: Some(Identifier::new("t", pos())),
            column: Identifier::new("c1", pos()),
        };
        assert_eq!(qualified.to_string(), "t.c1");
    }

    #[test]
    fn string_literal_prints_quoted() {
        let e = Expression::Primitive(PrimitiveLiteral {
            value: Primary::string("it's"),
            literal: "it's".to_string(),
            pos: pos(),
        });
        assert_eq!(e.to_string(), "'it\\'s'");
    }

    #[test]
    fn substitution_is_impure_everywhere_in_the_tree() {
        let subst = Expression::VariableSubstitution {
            name: "a".to_string(),
            value: Box::new(Expression::Primitive(PrimitiveLiteral::integer(1, pos()))),
            pos: pos(),
        };
        assert!(!subst.is_pure_for_rows());

        let nested = Expression::Arithmetic {
            lhs: Box::new(Expression::Primitive(PrimitiveLiteral::integer(1, pos()))),
            op: ArithmeticOp::Add,
            rhs: Box::new(Expression::Parentheses(Box::new(subst))),
            pos: pos(),
        };
        assert!(!nested.is_pure_for_rows());

        let pure = Expression::Comparison {
            lhs: Box::new(Expression::FieldReference {
                view: None,
                column: Identifier::new("c1", pos()),
            }),
            op: ComparisonOp::Equal,
            rhs: Box::new(Expression::Primitive(PrimitiveLiteral::integer(1, pos()))),
            pos: pos(),
        };
        assert!(pure.is_pure_for_rows());
    }

    #[test]
    fn case_expression_prints_canonically() {
        let e = Expression::Case {
            value: None,
            when: vec![CaseWhen {
                condition: Expression::Primitive(PrimitiveLiteral {
                    value: Primary::Ternary(Ternary::True),
                    literal: "TRUE".to_string(),
                    pos: pos(),
                }),
                result: Expression::Primitive(PrimitiveLiteral::integer(1, pos())),
            }],
            else_result: Some(Box::new(Expression::Primitive(PrimitiveLiteral::integer(
                2,
                pos(),
            )))),
            pos: pos(),
        };
        assert_eq!(e.to_string(), "CASE WHEN TRUE THEN 1 ELSE 2 END");
    }
}
