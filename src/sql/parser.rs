//! # Parser
//!
//! A recursive descent parser over the scanner's token stream. Statement
//! dispatch is a switch on the leading token; expressions use precedence
//! climbing (OR < AND < NOT < comparison < concatenation < additive <
//! multiplicative < unary).
//!
//! ## Error Reporting
//!
//! Any unexpected token produces
//! `[L:<line> C:<col>] syntax error: unexpected token "<literal>"`; hitting
//! end of input mid-statement produces `…: unexpected termination`. The
//! offending token's own position is always used, so diagnostics point at
//! the first token the grammar could not accept.
//!
//! ## Parenthesis Disambiguation
//!
//! `(` introduces a subquery when followed by SELECT or WITH, a value list
//! when the enclosed expression is followed by a comma, and a plain
//! parenthesized expression otherwise. Comparison operands that turn out to
//! be value lists are wrapped as row values at the use site.

use super::ast::*;
use super::scanner::Scanner;
use super::token::{FetchPosition, Keyword, Pos, Token, TokenKind};
use crate::config::Timezone;
use crate::error::{QueryError, QueryResult};
use crate::value::{ArithmeticOp, ComparisonOp, Primary, Ternary};

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_str(input: &str) -> QueryResult<Vec<Statement>> {
        parse(input, None, &[], &Timezone::Utc, false)
    }

    fn parse_one(input: &str) -> Statement {
        let mut statements = parse_str(input).unwrap();
        assert_eq!(statements.len(), 1);
        statements.remove(0)
    }

    #[test]
    fn parse_select_literal_from_dual() {
        let stmt = parse_one("select 1 from dual");
        let Statement::Select(query) = stmt else {
            panic!("expected select");
        };
        let SelectEntity::Select(clauses) = &query.entity else {
            panic!("expected plain select");
        };
        assert_eq!(clauses.fields.len(), 1);
        assert!(clauses.from.is_some());
    }

    #[test]
    fn parse_select_missing_field_reports_offending_token() {
        let err = parse_str("select from").unwrap_err();
        assert_eq!(
            err.to_string(),
            "[L:1 C:8] syntax error: unexpected token \"from\""
        );
    }

    #[test]
    fn parse_unexpected_termination() {
        let err = parse_str("select 1 from").unwrap_err();
        assert_eq!(err.to_string(), "[L:1 C:14] syntax error: unexpected termination");
    }

    #[test]
    fn parse_var_declaration_and_print() {
        let statements = parse_str("var @a := 1; print @a;").unwrap();
        assert_eq!(statements.len(), 2);
        assert!(matches!(
            statements[0],
            Statement::VariableDeclaration { .. }
        ));
        assert!(matches!(statements[1], Statement::Print { .. }));
    }

    #[test]
    fn parse_expression_precedence() {
        let stmt = parse_one("select 1 + 2 * 3");
        let Statement::Select(query) = stmt else {
            panic!()
        };
        let SelectEntity::Select(clauses) = &query.entity else {
            panic!()
        };
        assert_eq!(clauses.fields[0].expr.to_string(), "1 + 2 * 3");
        let Expression::Arithmetic { op, .. } = &clauses.fields[0].expr else {
            panic!("expected addition at the root");
        };
        assert_eq!(*op, ArithmeticOp::Add);
    }

    #[test]
    fn parse_logic_precedence() {
        let stmt = parse_one("select 1 where true or false and true");
        let Statement::Select(query) = stmt else {
            panic!()
        };
        let SelectEntity::Select(clauses) = &query.entity else {
            panic!()
        };
        let Some(Expression::Logic { op, .. }) = &clauses.where_clause else {
            panic!("expected logic in where");
        };
        assert_eq!(*op, LogicOp::Or);
    }

    #[test]
    fn parse_in_with_value_list() {
        let stmt = parse_one("select 1 where 1 in (1, 2, 3)");
        let Statement::Select(query) = stmt else {
            panic!()
        };
        let SelectEntity::Select(clauses) = &query.entity else {
            panic!()
        };
        let Some(Expression::In { values, .. }) = &clauses.where_clause else {
            panic!("expected IN");
        };
        assert!(matches!(**values, Expression::ValueList { .. }));
    }

    #[test]
    fn parse_row_value_comparison() {
        let stmt = parse_one("select 1 where (1, 2) = (1, 2)");
        let Statement::Select(query) = stmt else {
            panic!()
        };
        let SelectEntity::Select(clauses) = &query.entity else {
            panic!()
        };
        let Some(Expression::Comparison { lhs, rhs, .. }) = &clauses.where_clause else {
            panic!("expected comparison");
        };
        assert!(matches!(**lhs, Expression::RowValue { .. }));
        assert!(matches!(**rhs, Expression::RowValue { .. }));
    }

    #[test]
    fn parse_aggregate_and_analytic_functions() {
        let stmt = parse_one("select sum(c1), row_number() over (order by c1) from t");
        let Statement::Select(query) = stmt else {
            panic!()
        };
        let SelectEntity::Select(clauses) = &query.entity else {
            panic!()
        };
        assert!(matches!(
            clauses.fields[0].expr,
            Expression::AggregateFunction { .. }
        ));
        assert!(matches!(
            clauses.fields[1].expr,
            Expression::AnalyticFunction { .. }
        ));
    }

    #[test]
    fn parse_joins() {
        let stmt = parse_one("select 1 from t1 join t2 on t1.id = t2.id left join t3 using (id)");
        let Statement::Select(query) = stmt else {
            panic!()
        };
        let SelectEntity::Select(clauses) = &query.entity else {
            panic!()
        };
        let from = clauses.from.as_ref().unwrap();
        assert_eq!(from.tables.len(), 1);
        assert!(matches!(from.tables[0].expr, TableExpr::Join(_)));
    }

    #[test]
    fn parse_with_recursive_cte() {
        let stmt = parse_one(
            "with recursive n (i) as (select 1 union all select i + 1 from n where i < 5) \
             select i from n",
        );
        let Statement::Select(query) = stmt else {
            panic!()
        };
        let with = query.with.as_ref().unwrap();
        assert!(with.tables[0].recursive);
        assert_eq!(with.tables[0].name.literal, "n");
    }

    #[test]
    fn parse_cursor_statements() {
        let statements = parse_str(
            "declare cur cursor for select 1; open cur; fetch cur into @a; close cur; \
             dispose cursor cur;",
        )
        .unwrap();
        assert_eq!(statements.len(), 5);
        assert!(matches!(statements[0], Statement::DeclareCursor { .. }));
        assert!(matches!(
            statements[2],
            Statement::FetchCursor {
                position: FetchPosition::Next,
                ..
            }
        ));
    }

    #[test]
    fn parse_cursor_status_expression() {
        let stmt = parse_one("select case when cursor cur is not open then 1 else 2 end");
        let Statement::Select(query) = stmt else {
            panic!()
        };
        let SelectEntity::Select(clauses) = &query.entity else {
            panic!()
        };
        let Expression::Case { when, .. } = &clauses.fields[0].expr else {
            panic!("expected case");
        };
        assert!(matches!(
            when[0].condition,
            Expression::CursorStatus {
                status: CursorStatusType::Open,
                negated: true,
                ..
            }
        ));
    }

    #[test]
    fn parse_function_declaration() {
        let stmt = parse_one(
            "declare add2 function (@a, @b default 1) as begin return @a + @b; end",
        );
        let Statement::DeclareFunction(decl) = stmt else {
            panic!("expected function declaration");
        };
        assert_eq!(decl.name.literal, "add2");
        assert_eq!(decl.parameters.len(), 2);
        assert!(decl.parameters[1].value.is_some());
        assert_eq!(decl.body.len(), 1);
    }

    #[test]
    fn parse_if_statement() {
        let stmt = parse_one(
            "if @a = 1 then print 1; elseif @a = 2 then print 2; else print 3; end if",
        );
        let Statement::If(if_stmt) = stmt else {
            panic!()
        };
        assert_eq!(if_stmt.else_if.len(), 1);
        assert_eq!(if_stmt.else_body.len(), 1);
    }

    #[test]
    fn parse_while_in_cursor() {
        let stmt = parse_one("while @a, @b in cur do print @a; end while");
        let Statement::WhileInCursor(w) = stmt else {
            panic!()
        };
        assert_eq!(w.variables, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(w.cursor.literal, "cur");
    }

    #[test]
    fn parse_dml_statements() {
        assert!(matches!(
            parse_one("insert into t (c1) values (1), (2)"),
            Statement::Insert(_)
        ));
        assert!(matches!(
            parse_one("update t set c1 = 1 where c2 = 2"),
            Statement::Update(_)
        ));
        assert!(matches!(
            parse_one("delete from t where c1 = 1"),
            Statement::Delete(_)
        ));
    }

    #[test]
    fn parse_ddl_statements() {
        assert!(matches!(
            parse_one("create table t (c1, c2)"),
            Statement::CreateTable(_)
        ));
        assert!(matches!(
            parse_one("alter table t add (c3 default 0) after c1"),
            Statement::AddColumns(_)
        ));
        assert!(matches!(
            parse_one("alter table t drop c2"),
            Statement::DropColumns(_)
        ));
        assert!(matches!(
            parse_one("alter table t rename c1 to c0"),
            Statement::RenameColumn(_)
        ));
        assert!(matches!(
            parse_one("declare tmp view (c1, c2)"),
            Statement::DeclareView { .. }
        ));
    }

    #[test]
    fn parse_set_and_show() {
        assert!(matches!(
            parse_one("set @@wait_timeout to 5"),
            Statement::SetFlag { .. }
        ));
        assert!(matches!(
            parse_one("show @@cpu"),
            Statement::ShowFlag { .. }
        ));
        assert!(matches!(
            parse_one("show tables"),
            Statement::ShowObjects {
                object_type: ShowObjectType::Tables,
                ..
            }
        ));
        assert!(matches!(
            parse_one("show fields from t"),
            Statement::ShowFields { .. }
        ));
    }

    #[test]
    fn parse_prepared_statements() {
        let statements = parse_str(
            "prepare st from 'select * from t where c1 = ?'; execute st using 1; \
             dispose prepare st;",
        )
        .unwrap();
        assert!(matches!(statements[0], Statement::Prepare { .. }));
        assert!(matches!(statements[1], Statement::ExecutePrepared { .. }));
        assert!(matches!(statements[2], Statement::DisposePrepared { .. }));
    }

    #[test]
    fn prepared_text_keeps_placeholders() {
        let statements = parse(
            "select * from t where c1 = ? and c2 = :v",
            None,
            &[],
            &Timezone::Utc,
            true,
        )
        .unwrap();
        assert_eq!(statements.len(), 1);
    }

    #[test]
    fn print_round_trip_for_select() {
        let sources = [
            "SELECT 1 + 2 * 3",
            "SELECT c1, c2 AS x FROM t WHERE c1 = 1 GROUP BY c1 HAVING COUNT(*) > 1",
            "SELECT DISTINCT c1 FROM t ORDER BY c1 DESC NULLS LAST LIMIT 10 OFFSET 2",
            "SELECT 1 FROM t1 JOIN t2 ON t1.id = t2.id",
            "SELECT CASE WHEN c1 = 1 THEN 'a' ELSE 'b' END FROM t",
        ];
        for src in sources {
            let Statement::Select(first) = parse_one(src) else {
                panic!()
            };
            let printed = first.to_string();
            let Statement::Select(second) = parse_one(&printed) else {
                panic!()
            };
            assert_eq!(printed, second.to_string(), "round trip failed for {}", src);
        }
    }

    #[test]
    fn parse_external_command_statement() {
        let stmt = parse_one("$echo hello;");
        assert!(matches!(stmt, Statement::ExternalCommand { .. }));
    }
}

const AGGREGATE_NAMES: &[&str] = &["COUNT", "MIN", "MAX", "SUM", "AVG", "MEDIAN"];
const LIST_FUNCTION_NAMES: &[&str] = &["LISTAGG", "JSON_AGG"];

/// Parses source text into a statement list.
pub fn parse(
    src: &str,
    source_file: Option<String>,
    datetime_formats: &[String],
    timezone: &Timezone,
    for_prepared: bool,
) -> QueryResult<Vec<Statement>> {
    let mut parser = Parser::new(src, source_file, datetime_formats, timezone, for_prepared)?;
    let mut statements = Vec::new();
    while !parser.current.is_eof() {
        statements.push(parser.parse_statement()?);
    }
    Ok(statements)
}

pub struct Parser {
    scanner: Scanner,
    current: Token,
}

impl Parser {
    fn new(
        src: &str,
        source_file: Option<String>,
        datetime_formats: &[String],
        timezone: &Timezone,
        for_prepared: bool,
    ) -> QueryResult<Self> {
        let mut scanner = Scanner::new(
            src,
            source_file,
            datetime_formats.to_vec(),
            timezone.clone(),
            for_prepared,
        );
        let current = scanner.scan()?;
        Ok(Self { scanner, current })
    }

    fn advance(&mut self) -> QueryResult<Token> {
        let next = self.scanner.scan()?;
        Ok(std::mem::replace(&mut self.current, next))
    }

    fn unexpected(&self) -> QueryError {
        if self.current.is_eof() {
            QueryError::syntax(
                self.current.pos.clone(),
                "syntax error: unexpected termination".to_string(),
            )
        } else {
            QueryError::syntax(
                self.current.pos.clone(),
                format!("syntax error: unexpected token \"{}\"", self.current.literal),
            )
        }
    }

    fn check_kind(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn check_keyword(&self, kw: Keyword) -> bool {
        self.current.is_keyword(kw)
    }

    fn consume_kind(&mut self, kind: TokenKind) -> QueryResult<bool> {
        if self.check_kind(kind) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn consume_keyword(&mut self, kw: Keyword) -> QueryResult<bool> {
        if self.check_keyword(kw) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect_kind(&mut self, kind: TokenKind) -> QueryResult<Token> {
        if self.check_kind(kind) {
            self.advance()
        } else {
            Err(self.unexpected())
        }
    }

    fn expect_keyword(&mut self, kw: Keyword) -> QueryResult<Token> {
        if self.check_keyword(kw) {
            self.advance()
        } else {
            Err(self.unexpected())
        }
    }

    fn expect_identifier(&mut self) -> QueryResult<Identifier> {
        if self.check_kind(TokenKind::Identifier) {
            let token = self.advance()?;
            Ok(Identifier {
                literal: token.literal,
                quoted: token.quoted,
                pos: token.pos,
            })
        } else {
            Err(self.unexpected())
        }
    }

    fn expect_variable(&mut self) -> QueryResult<(String, Pos)> {
        if self.check_kind(TokenKind::Variable) {
            let token = self.advance()?;
            Ok((token.literal, token.pos))
        } else {
            Err(self.unexpected())
        }
    }

    /// Statements end with a semicolon; the final statement may end at EOF.
    fn end_of_statement(&mut self) -> QueryResult<()> {
        if self.check_kind(TokenKind::Semicolon) {
            self.advance()?;
            Ok(())
        } else if self.current.is_eof() {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn parse_statement(&mut self) -> QueryResult<Statement> {
        let statement = self.parse_statement_body()?;
        self.end_of_statement()?;
        Ok(statement)
    }

    fn parse_statement_body(&mut self) -> QueryResult<Statement> {
        match self.current.kind {
            TokenKind::Keyword(Keyword::Select) | TokenKind::Keyword(Keyword::With) => {
                Ok(Statement::Select(self.parse_select_query()?))
            }
            TokenKind::Keyword(Keyword::Insert) => self.parse_insert(),
            TokenKind::Keyword(Keyword::Update) => self.parse_update(),
            TokenKind::Keyword(Keyword::Delete) => self.parse_delete(),
            TokenKind::Keyword(Keyword::Create) => self.parse_create_table(),
            TokenKind::Keyword(Keyword::Alter) => self.parse_alter_table(),
            TokenKind::Keyword(Keyword::Declare) => self.parse_declare(),
            TokenKind::Keyword(Keyword::Var) => {
                let pos = self.advance()?.pos;
                let assignments = self.parse_variable_assignments()?;
                Ok(Statement::VariableDeclaration { assignments, pos })
            }
            TokenKind::Variable => {
                let (name, pos) = self.expect_variable()?;
                self.expect_kind(TokenKind::Substitution)?;
                let value = self.parse_expression()?;
                Ok(Statement::VariableSubstitution { name, value, pos })
            }
            TokenKind::Keyword(Keyword::Dispose) => self.parse_dispose(),
            TokenKind::Keyword(Keyword::Open) => {
                let pos = self.advance()?.pos;
                let cursor = self.expect_identifier()?;
                Ok(Statement::OpenCursor { cursor, pos })
            }
            TokenKind::Keyword(Keyword::Close) => {
                let pos = self.advance()?.pos;
                let cursor = self.expect_identifier()?;
                Ok(Statement::CloseCursor { cursor, pos })
            }
            TokenKind::Keyword(Keyword::Fetch) => self.parse_fetch(),
            TokenKind::Keyword(Keyword::If) => self.parse_if(),
            TokenKind::Keyword(Keyword::While) => self.parse_while(),
            TokenKind::Keyword(Keyword::Continue) => {
                let pos = self.advance()?.pos;
                Ok(Statement::Continue { pos })
            }
            TokenKind::Keyword(Keyword::Break) => {
                let pos = self.advance()?.pos;
                Ok(Statement::Break { pos })
            }
            TokenKind::Keyword(Keyword::Exit) => {
                let pos = self.advance()?.pos;
                let code = if self.check_kind(TokenKind::Integer) {
                    Some(self.parse_expression()?)
                } else {
                    None
                };
                Ok(Statement::Exit { code, pos })
            }
            TokenKind::Keyword(Keyword::Return) => {
                let pos = self.advance()?.pos;
                let value = if self.check_kind(TokenKind::Semicolon) || self.current.is_eof() {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                Ok(Statement::Return { value, pos })
            }
            TokenKind::Keyword(Keyword::Print) => {
                let pos = self.advance()?.pos;
                let value = self.parse_expression()?;
                Ok(Statement::Print { value, pos })
            }
            TokenKind::Keyword(Keyword::Printf) => {
                let pos = self.advance()?.pos;
                let format = self.parse_expression()?;
                let values = if self.consume_keyword(Keyword::Using)? {
                    self.parse_expression_list()?
                } else {
                    Vec::new()
                };
                Ok(Statement::Printf {
                    format,
                    values,
                    pos,
                })
            }
            TokenKind::Keyword(Keyword::Source) => {
                let pos = self.advance()?.pos;
                let file = self.parse_expression()?;
                Ok(Statement::Source { file, pos })
            }
            TokenKind::Keyword(Keyword::Execute) => self.parse_execute(),
            TokenKind::Keyword(Keyword::Set) => self.parse_set(),
            TokenKind::Keyword(Keyword::Unset) => {
                let pos = self.advance()?.pos;
                if self.check_kind(TokenKind::EnvironmentVariable) {
                    let token = self.advance()?;
                    Ok(Statement::UnsetEnvVar {
                        name: token.literal,
                        pos,
                    })
                } else {
                    Err(self.unexpected())
                }
            }
            TokenKind::Keyword(Keyword::Show) => self.parse_show(),
            TokenKind::Keyword(Keyword::Prepare) => {
                let pos = self.advance()?.pos;
                let name = self.expect_identifier()?;
                self.expect_keyword(Keyword::From)?;
                let statement = self.expect_kind(TokenKind::String)?.literal;
                Ok(Statement::Prepare {
                    name,
                    statement,
                    pos,
                })
            }
            TokenKind::Keyword(Keyword::Commit) => {
                let pos = self.advance()?.pos;
                Ok(Statement::Commit { pos })
            }
            TokenKind::Keyword(Keyword::Rollback) => {
                let pos = self.advance()?.pos;
                Ok(Statement::Rollback { pos })
            }
            TokenKind::ExternalCommand => {
                let token = self.advance()?;
                Ok(Statement::ExternalCommand {
                    command: token.literal,
                    pos: token.pos,
                })
            }
            _ => Err(self.unexpected()),
        }
    }

    fn parse_statement_list(&mut self, terminators: &[Keyword]) -> QueryResult<Vec<Statement>> {
        let mut statements = Vec::new();
        loop {
            if self.current.is_eof() {
                return Err(self.unexpected());
            }
            if terminators.iter().any(|kw| self.check_keyword(*kw)) {
                return Ok(statements);
            }
            statements.push(self.parse_statement()?);
        }
    }

    fn parse_variable_assignments(&mut self) -> QueryResult<Vec<VariableAssignment>> {
        let mut assignments = Vec::new();
        loop {
            let (name, pos) = self.expect_variable()?;
            let value = if self.consume_kind(TokenKind::Substitution)? {
                Some(self.parse_expression()?)
            } else {
                None
            };
            assignments.push(VariableAssignment { name, value, pos });
            if !self.consume_kind(TokenKind::Comma)? {
                return Ok(assignments);
            }
        }
    }

    fn parse_declare(&mut self) -> QueryResult<Statement> {
        let pos = self.advance()?.pos;

        if self.check_kind(TokenKind::Variable) {
            let assignments = self.parse_variable_assignments()?;
            return Ok(Statement::VariableDeclaration { assignments, pos });
        }

        let name = self.expect_identifier()?;
        match self.current.kind {
            TokenKind::Keyword(Keyword::Cursor) => {
                self.advance()?;
                self.expect_keyword(Keyword::For)?;
                let query = self.parse_select_query()?;
                Ok(Statement::DeclareCursor {
                    cursor: name,
                    query,
                    pos,
                })
            }
            TokenKind::Keyword(Keyword::View) => {
                self.advance()?;
                let mut fields = Vec::new();
                if self.consume_kind(TokenKind::LParen)? {
                    loop {
                        fields.push(self.expect_identifier()?);
                        if !self.consume_kind(TokenKind::Comma)? {
                            break;
                        }
                    }
                    self.expect_kind(TokenKind::RParen)?;
                }
                let query = if self.consume_keyword(Keyword::As)? {
                    Some(self.parse_select_query()?)
                } else {
                    None
                };
                Ok(Statement::DeclareView {
                    view: name,
                    fields,
                    query,
                    pos,
                })
            }
            TokenKind::Keyword(Keyword::Function) => {
                self.advance()?;
                let parameters = self.parse_function_parameters()?;
                let body = self.parse_function_body()?;
                Ok(Statement::DeclareFunction(FunctionDeclaration {
                    name,
                    is_aggregate: false,
                    cursor: None,
                    parameters,
                    body,
                    pos,
                }))
            }
            TokenKind::Keyword(Keyword::Aggregate) => {
                self.advance()?;
                self.expect_kind(TokenKind::LParen)?;
                let cursor = self.expect_identifier()?;
                let mut parameters = Vec::new();
                while self.consume_kind(TokenKind::Comma)? {
                    let (pname, ppos) = self.expect_variable()?;
                    let value = if self.consume_keyword(Keyword::Default)? {
                        Some(self.parse_expression()?)
                    } else {
                        None
                    };
                    parameters.push(VariableAssignment {
                        name: pname,
                        value,
                        pos: ppos,
                    });
                }
                self.expect_kind(TokenKind::RParen)?;
                let body = self.parse_function_body()?;
                Ok(Statement::DeclareFunction(FunctionDeclaration {
                    name,
                    is_aggregate: true,
                    cursor: Some(cursor),
                    parameters,
                    body,
                    pos,
                }))
            }
            _ => Err(self.unexpected()),
        }
    }

    fn parse_function_parameters(&mut self) -> QueryResult<Vec<VariableAssignment>> {
        self.expect_kind(TokenKind::LParen)?;
        let mut parameters = Vec::new();
        if !self.check_kind(TokenKind::RParen) {
            loop {
                let (name, pos) = self.expect_variable()?;
                let value = if self.consume_keyword(Keyword::Default)? {
                    Some(self.parse_expression()?)
                } else {
                    None
                };
                parameters.push(VariableAssignment { name, value, pos });
                if !self.consume_kind(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.expect_kind(TokenKind::RParen)?;
        Ok(parameters)
    }

    fn parse_function_body(&mut self) -> QueryResult<Vec<Statement>> {
        self.expect_keyword(Keyword::As)?;
        self.expect_keyword(Keyword::Begin)?;
        let body = self.parse_statement_list(&[Keyword::End])?;
        self.expect_keyword(Keyword::End)?;
        Ok(body)
    }

    fn parse_dispose(&mut self) -> QueryResult<Statement> {
        let pos = self.advance()?.pos;
        match self.current.kind {
            TokenKind::Keyword(Keyword::Cursor) => {
                self.advance()?;
                let cursor = self.expect_identifier()?;
                Ok(Statement::DisposeCursor { cursor, pos })
            }
            TokenKind::Keyword(Keyword::Function) => {
                self.advance()?;
                let name = self.expect_identifier()?;
                Ok(Statement::DisposeFunction { name, pos })
            }
            TokenKind::Keyword(Keyword::View) | TokenKind::Keyword(Keyword::Table) => {
                self.advance()?;
                let view = self.expect_identifier()?;
                Ok(Statement::DisposeView { view, pos })
            }
            TokenKind::Keyword(Keyword::Prepare) => {
                self.advance()?;
                let name = self.expect_identifier()?;
                Ok(Statement::DisposePrepared { name, pos })
            }
            TokenKind::Variable => {
                let (name, _) = self.expect_variable()?;
                Ok(Statement::DisposeVariable { name, pos })
            }
            _ => Err(self.unexpected()),
        }
    }

    fn parse_fetch(&mut self) -> QueryResult<Statement> {
        let pos = self.advance()?.pos;

        let (position, number) = match self.current.kind {
            TokenKind::Keyword(Keyword::Next) => {
                self.advance()?;
                (FetchPosition::Next, None)
            }
            TokenKind::Keyword(Keyword::Prior) => {
                self.advance()?;
                (FetchPosition::Prior, None)
            }
            TokenKind::Keyword(Keyword::First) => {
                self.advance()?;
                (FetchPosition::First, None)
            }
            TokenKind::Keyword(Keyword::Last) => {
                self.advance()?;
                (FetchPosition::Last, None)
            }
            TokenKind::Keyword(Keyword::Absolute) => {
                self.advance()?;
                (FetchPosition::Absolute, Some(self.parse_expression()?))
            }
            TokenKind::Keyword(Keyword::Relative) => {
                self.advance()?;
                (FetchPosition::Relative, Some(self.parse_expression()?))
            }
            _ => (FetchPosition::Next, None),
        };

        let cursor = self.expect_identifier()?;
        self.expect_keyword(Keyword::Into)?;

        let mut variables = Vec::new();
        loop {
            let (name, _) = self.expect_variable()?;
            variables.push(name);
            if !self.consume_kind(TokenKind::Comma)? {
                break;
            }
        }

        Ok(Statement::FetchCursor {
            cursor,
            position,
            number,
            variables,
            pos,
        })
    }

    fn parse_if(&mut self) -> QueryResult<Statement> {
        let pos = self.advance()?.pos;
        let condition = self.parse_expression()?;
        self.expect_keyword(Keyword::Then)?;
        let body = self.parse_statement_list(&[Keyword::Elseif, Keyword::Else, Keyword::End])?;

        let mut else_if = Vec::new();
        while self.consume_keyword(Keyword::Elseif)? {
            let condition = self.parse_expression()?;
            self.expect_keyword(Keyword::Then)?;
            let body =
                self.parse_statement_list(&[Keyword::Elseif, Keyword::Else, Keyword::End])?;
            else_if.push(ElseIf { condition, body });
        }

        let else_body = if self.consume_keyword(Keyword::Else)? {
            self.parse_statement_list(&[Keyword::End])?
        } else {
            Vec::new()
        };

        self.expect_keyword(Keyword::End)?;
        self.expect_keyword(Keyword::If)?;
        Ok(Statement::If(IfStatement {
            condition,
            body,
            else_if,
            else_body,
            pos,
        }))
    }

    fn parse_while(&mut self) -> QueryResult<Statement> {
        let pos = self.advance()?.pos;

        if self.check_kind(TokenKind::Variable) {
            let mut variables = Vec::new();
            loop {
                let (name, _) = self.expect_variable()?;
                variables.push(name);
                if !self.consume_kind(TokenKind::Comma)? {
                    break;
                }
            }
            self.expect_keyword(Keyword::In)?;
            let cursor = self.expect_identifier()?;
            self.expect_keyword(Keyword::Do)?;
            let body = self.parse_statement_list(&[Keyword::End])?;
            self.expect_keyword(Keyword::End)?;
            self.expect_keyword(Keyword::While)?;
            return Ok(Statement::WhileInCursor(WhileInCursor {
                variables,
                cursor,
                body,
                pos,
            }));
        }

        let condition = self.parse_expression()?;
        self.expect_keyword(Keyword::Do)?;
        let body = self.parse_statement_list(&[Keyword::End])?;
        self.expect_keyword(Keyword::End)?;
        self.expect_keyword(Keyword::While)?;
        Ok(Statement::While(WhileStatement {
            condition,
            body,
            pos,
        }))
    }

    fn parse_execute(&mut self) -> QueryResult<Statement> {
        let pos = self.advance()?.pos;

        if self.check_kind(TokenKind::Identifier) {
            let name = self.expect_identifier()?;
            let mut values = Vec::new();
            if self.consume_keyword(Keyword::Using)? {
                loop {
                    let value = self.parse_expression()?;
                    let value_name = if self.consume_keyword(Keyword::As)? {
                        Some(self.expect_identifier()?)
                    } else {
                        None
                    };
                    values.push(ReplaceValue {
                        value,
                        name: value_name,
                    });
                    if !self.consume_kind(TokenKind::Comma)? {
                        break;
                    }
                }
            }
            return Ok(Statement::ExecutePrepared { name, values, pos });
        }

        let statements = self.parse_expression()?;
        let values = if self.consume_keyword(Keyword::Using)? {
            self.parse_expression_list()?
        } else {
            Vec::new()
        };
        Ok(Statement::Execute {
            statements,
            values,
            pos,
        })
    }

    fn parse_set(&mut self) -> QueryResult<Statement> {
        let pos = self.advance()?.pos;
        match self.current.kind {
            TokenKind::Flag => {
                let name = self.advance()?.literal;
                self.expect_keyword(Keyword::To)?;
                let value = self.parse_expression()?;
                Ok(Statement::SetFlag { name, value, pos })
            }
            TokenKind::EnvironmentVariable => {
                let name = self.advance()?.literal;
                self.expect_keyword(Keyword::To)?;
                let value = self.parse_expression()?;
                Ok(Statement::SetEnvVar { name, value, pos })
            }
            _ => Err(self.unexpected()),
        }
    }

    fn parse_show(&mut self) -> QueryResult<Statement> {
        let pos = self.advance()?.pos;

        if self.check_kind(TokenKind::Flag) {
            let name = self.advance()?.literal;
            return Ok(Statement::ShowFlag { name, pos });
        }
        if self.consume_keyword(Keyword::Fields)? {
            self.expect_keyword(Keyword::From)?;
            let table = self.expect_identifier()?;
            return Ok(Statement::ShowFields { table, pos });
        }

        let ident = self.expect_identifier()?;
        let object_type = match ident.literal.to_ascii_uppercase().as_str() {
            "TABLES" => ShowObjectType::Tables,
            "VIEWS" => ShowObjectType::Views,
            "CURSORS" => ShowObjectType::Cursors,
            "FUNCTIONS" => ShowObjectType::Functions,
            "STATEMENTS" => ShowObjectType::Statements,
            "FLAGS" => ShowObjectType::Flags,
            "ENV" => ShowObjectType::Env,
            "RUNINFO" => ShowObjectType::Runinfo,
            _ => {
                return Err(QueryError::syntax(
                    ident.pos,
                    format!("syntax error: unexpected token \"{}\"", ident.literal),
                ))
            }
        };
        Ok(Statement::ShowObjects { object_type, pos })
    }

    fn parse_insert(&mut self) -> QueryResult<Statement> {
        let pos = self.advance()?.pos;
        self.expect_keyword(Keyword::Into)?;
        let table = self.expect_identifier()?;

        let mut fields = Vec::new();
        if self.consume_kind(TokenKind::LParen)? {
            loop {
                fields.push(self.parse_field_reference()?);
                if !self.consume_kind(TokenKind::Comma)? {
                    break;
                }
            }
            self.expect_kind(TokenKind::RParen)?;
        }

        if self.consume_keyword(Keyword::Values)? {
            let mut values = Vec::new();
            loop {
                values.push(self.parse_row_value()?);
                if !self.consume_kind(TokenKind::Comma)? {
                    break;
                }
            }
            Ok(Statement::Insert(InsertQuery {
                table,
                fields,
                values,
                query: None,
                pos,
            }))
        } else {
            let query = self.parse_select_query()?;
            Ok(Statement::Insert(InsertQuery {
                table,
                fields,
                values: Vec::new(),
                query: Some(query),
                pos,
            }))
        }
    }

    fn parse_update(&mut self) -> QueryResult<Statement> {
        let pos = self.advance()?.pos;
        let table = self.expect_identifier()?;
        self.expect_keyword(Keyword::Set)?;

        let mut set_list = Vec::new();
        loop {
            let field = self.parse_field_reference()?;
            self.expect_kind(TokenKind::Eq)?;
            let value = self.parse_expression()?;
            set_list.push(UpdateSet { field, value });
            if !self.consume_kind(TokenKind::Comma)? {
                break;
            }
        }

        let where_clause = if self.consume_keyword(Keyword::Where)? {
            Some(self.parse_expression()?)
        } else {
            None
        };

        Ok(Statement::Update(UpdateQuery {
            table,
            set_list,
            where_clause,
            pos,
        }))
    }

    fn parse_delete(&mut self) -> QueryResult<Statement> {
        let pos = self.advance()?.pos;
        self.expect_keyword(Keyword::From)?;
        let table = self.expect_identifier()?;
        let where_clause = if self.consume_keyword(Keyword::Where)? {
            Some(self.parse_expression()?)
        } else {
            None
        };
        Ok(Statement::Delete(DeleteQuery {
            table,
            where_clause,
            pos,
        }))
    }

    fn parse_create_table(&mut self) -> QueryResult<Statement> {
        let pos = self.advance()?.pos;
        self.expect_keyword(Keyword::Table)?;
        let table = self.expect_identifier()?;

        let mut fields = Vec::new();
        if self.consume_kind(TokenKind::LParen)? {
            loop {
                fields.push(self.expect_identifier()?);
                if !self.consume_kind(TokenKind::Comma)? {
                    break;
                }
            }
            self.expect_kind(TokenKind::RParen)?;
        }

        let query = if self.consume_keyword(Keyword::As)? {
            Some(self.parse_select_query()?)
        } else {
            None
        };

        if fields.is_empty() && query.is_none() {
            return Err(self.unexpected());
        }

        Ok(Statement::CreateTable(CreateTable {
            table,
            fields,
            query,
            pos,
        }))
    }

    fn parse_alter_table(&mut self) -> QueryResult<Statement> {
        let pos = self.advance()?.pos;
        self.expect_keyword(Keyword::Table)?;
        let table = self.expect_identifier()?;

        match self.current.kind {
            TokenKind::Keyword(Keyword::Add) => {
                self.advance()?;
                let mut columns = Vec::new();
                if self.consume_kind(TokenKind::LParen)? {
                    loop {
                        columns.push(self.parse_column_default()?);
                        if !self.consume_kind(TokenKind::Comma)? {
                            break;
                        }
                    }
                    self.expect_kind(TokenKind::RParen)?;
                } else {
                    columns.push(self.parse_column_default()?);
                }

                let position = match self.current.kind {
                    TokenKind::Keyword(Keyword::First) => {
                        self.advance()?;
                        Some(ColumnPosition::First)
                    }
                    TokenKind::Keyword(Keyword::Last) => {
                        self.advance()?;
                        Some(ColumnPosition::Last)
                    }
                    TokenKind::Keyword(Keyword::After) => {
                        self.advance()?;
                        Some(ColumnPosition::After(self.expect_identifier()?))
                    }
                    TokenKind::Keyword(Keyword::Before) => {
                        self.advance()?;
                        Some(ColumnPosition::Before(self.expect_identifier()?))
                    }
                    _ => None,
                };

                Ok(Statement::AddColumns(AddColumns {
                    table,
                    columns,
                    position,
                    pos,
                }))
            }
            TokenKind::Keyword(Keyword::Drop) => {
                self.advance()?;
                let mut columns = Vec::new();
                if self.consume_kind(TokenKind::LParen)? {
                    loop {
                        columns.push(self.parse_field_reference()?);
                        if !self.consume_kind(TokenKind::Comma)? {
                            break;
                        }
                    }
                    self.expect_kind(TokenKind::RParen)?;
                } else {
                    columns.push(self.parse_field_reference()?);
                }
                Ok(Statement::DropColumns(DropColumns {
                    table,
                    columns,
                    pos,
                }))
            }
            TokenKind::Keyword(Keyword::Rename) => {
                self.advance()?;
                let old = self.parse_field_reference()?;
                self.expect_keyword(Keyword::To)?;
                let new = self.expect_identifier()?;
                Ok(Statement::RenameColumn(RenameColumn {
                    table,
                    old,
                    new,
                    pos,
                }))
            }
            _ => Err(self.unexpected()),
        }
    }

    fn parse_column_default(&mut self) -> QueryResult<ColumnDefault> {
        let column = self.expect_identifier()?;
        let value = if self.consume_keyword(Keyword::Default)? {
            Some(self.parse_expression()?)
        } else {
            None
        };
        Ok(ColumnDefault { column, value })
    }

    pub fn parse_select_query(&mut self) -> QueryResult<SelectQuery> {
        let pos = self.current.pos.clone();

        let with = if self.check_keyword(Keyword::With) {
            Some(self.parse_with_clause()?)
        } else {
            None
        };

        let entity = self.parse_select_entity()?;

        let order_by = if self.check_keyword(Keyword::Order) {
            Some(self.parse_order_by_clause()?)
        } else {
            None
        };

        let limit = if self.check_keyword(Keyword::Limit) {
            let pos = self.advance()?.pos;
            let value = self.parse_expression()?;
            let percent = self.consume_keyword(Keyword::Percent)?;
            let with_ties = if self.check_keyword(Keyword::With) {
                self.advance()?;
                self.expect_keyword(Keyword::Ties)?;
                true
            } else {
                false
            };
            Some(LimitClause {
                value,
                percent,
                with_ties,
                pos,
            })
        } else {
            None
        };

        let offset = if self.check_keyword(Keyword::Offset) {
            let pos = self.advance()?.pos;
            let value = self.parse_expression()?;
            Some(OffsetClause { value, pos })
        } else {
            None
        };

        Ok(SelectQuery {
            with,
            entity,
            order_by,
            limit,
            offset,
            pos,
        })
    }

    fn parse_with_clause(&mut self) -> QueryResult<WithClause> {
        self.expect_keyword(Keyword::With)?;
        let mut tables = Vec::new();
        loop {
            let pos = self.current.pos.clone();
            let recursive = self.consume_keyword(Keyword::Recursive)?;
            let name = self.expect_identifier()?;
            let columns = if self.consume_kind(TokenKind::LParen)? {
                let mut cols = Vec::new();
                loop {
                    cols.push(self.expect_identifier()?);
                    if !self.consume_kind(TokenKind::Comma)? {
                        break;
                    }
                }
                self.expect_kind(TokenKind::RParen)?;
                Some(cols)
            } else {
                None
            };
            self.expect_keyword(Keyword::As)?;
            self.expect_kind(TokenKind::LParen)?;
            let query = self.parse_select_query()?;
            self.expect_kind(TokenKind::RParen)?;
            tables.push(InlineTableDef {
                recursive,
                name,
                columns,
                query,
                pos,
            });
            if !self.consume_kind(TokenKind::Comma)? {
                break;
            }
        }
        Ok(WithClause { tables })
    }

    fn parse_select_entity(&mut self) -> QueryResult<SelectEntity> {
        let mut entity = SelectEntity::Select(self.parse_select_clauses()?);

        loop {
            let operator = match self.current.kind {
                TokenKind::Keyword(Keyword::Union) => SetOperator::Union,
                TokenKind::Keyword(Keyword::Intersect) => SetOperator::Intersect,
                TokenKind::Keyword(Keyword::Except) => SetOperator::Except,
                _ => return Ok(entity),
            };
            let pos = self.advance()?.pos;
            let all = self.consume_keyword(Keyword::All)?;
            let rhs = SelectEntity::Select(self.parse_select_clauses()?);
            entity = SelectEntity::SetOperation {
                lhs: Box::new(entity),
                operator,
                all,
                rhs: Box::new(rhs),
                pos,
            };
        }
    }

    fn parse_select_clauses(&mut self) -> QueryResult<SelectClauses> {
        let pos = self.current.pos.clone();
        self.expect_keyword(Keyword::Select)?;
        let distinct = self.consume_keyword(Keyword::Distinct)?;

        let mut fields = Vec::new();
        loop {
            fields.push(self.parse_query_field()?);
            if !self.consume_kind(TokenKind::Comma)? {
                break;
            }
        }

        let from = if self.check_keyword(Keyword::From) {
            Some(self.parse_from_clause()?)
        } else {
            None
        };

        let where_clause = if self.consume_keyword(Keyword::Where)? {
            Some(self.parse_expression()?)
        } else {
            None
        };

        let mut group_by = Vec::new();
        if self.check_keyword(Keyword::Group) {
            self.advance()?;
            self.expect_keyword(Keyword::By)?;
            loop {
                group_by.push(self.parse_expression()?);
                if !self.consume_kind(TokenKind::Comma)? {
                    break;
                }
            }
        }

        let having = if self.consume_keyword(Keyword::Having)? {
            Some(self.parse_expression()?)
        } else {
            None
        };

        Ok(SelectClauses {
            distinct,
            fields,
            from,
            where_clause,
            group_by,
            having,
            pos,
        })
    }

    fn parse_query_field(&mut self) -> QueryResult<QueryField> {
        if self.check_kind(TokenKind::Asterisk) {
            let token = self.advance()?;
            return Ok(QueryField {
                expr: Expression::AllColumns { pos: token.pos },
                alias: None,
            });
        }

        let expr = self.parse_expression()?;
        let alias = if self.consume_keyword(Keyword::As)? {
            Some(self.expect_identifier()?)
        } else if self.check_kind(TokenKind::Identifier) {
            Some(self.expect_identifier()?)
        } else {
            None
        };
        Ok(QueryField { expr, alias })
    }

    fn parse_from_clause(&mut self) -> QueryResult<FromClause> {
        let pos = self.current.pos.clone();
        self.expect_keyword(Keyword::From)?;
        let mut tables = Vec::new();
        loop {
            tables.push(self.parse_table_object()?);
            if !self.consume_kind(TokenKind::Comma)? {
                break;
            }
        }
        Ok(FromClause { tables, pos })
    }

    fn parse_table_object(&mut self) -> QueryResult<TableObject> {
        let mut table = self.parse_table_primary()?;

        loop {
            let pos = self.current.pos.clone();
            let natural = self.check_keyword(Keyword::Natural);
            if natural {
                self.advance()?;
            }

            let join_type = match self.current.kind {
                TokenKind::Keyword(Keyword::Cross) => {
                    self.advance()?;
                    self.expect_keyword(Keyword::Join)?;
                    JoinType::Cross
                }
                TokenKind::Keyword(Keyword::Inner) => {
                    self.advance()?;
                    self.expect_keyword(Keyword::Join)?;
                    JoinType::Inner
                }
                TokenKind::Keyword(Keyword::Join) => {
                    self.advance()?;
                    JoinType::Inner
                }
                TokenKind::Keyword(Keyword::Left) => {
                    self.advance()?;
                    self.consume_keyword(Keyword::Outer)?;
                    self.expect_keyword(Keyword::Join)?;
                    JoinType::LeftOuter
                }
                TokenKind::Keyword(Keyword::Right) => {
                    self.advance()?;
                    self.consume_keyword(Keyword::Outer)?;
                    self.expect_keyword(Keyword::Join)?;
                    JoinType::RightOuter
                }
                TokenKind::Keyword(Keyword::Full) => {
                    self.advance()?;
                    self.consume_keyword(Keyword::Outer)?;
                    self.expect_keyword(Keyword::Join)?;
                    JoinType::FullOuter
                }
                _ => {
                    if natural {
                        return Err(self.unexpected());
                    }
                    return Ok(table);
                }
            };

            let rhs = self.parse_table_primary()?;

            let condition = if natural || join_type == JoinType::Cross {
                None
            } else if self.consume_keyword(Keyword::On)? {
                Some(JoinCondition::On(self.parse_expression()?))
            } else if self.consume_keyword(Keyword::Using)? {
                self.expect_kind(TokenKind::LParen)?;
                let mut fields = Vec::new();
                loop {
                    fields.push(self.expect_identifier()?);
                    if !self.consume_kind(TokenKind::Comma)? {
                        break;
                    }
                }
                self.expect_kind(TokenKind::RParen)?;
                Some(JoinCondition::Using(fields))
            } else {
                None
            };

            let join = Join {
                lhs: table,
                rhs,
                join_type,
                natural,
                condition,
                pos: pos.clone(),
            };
            table = TableObject {
                expr: TableExpr::Join(Box::new(join)),
                alias: None,
                pos,
            };
        }
    }

    fn parse_table_primary(&mut self) -> QueryResult<TableObject> {
        let pos = self.current.pos.clone();

        let expr = match self.current.kind {
            TokenKind::Keyword(Keyword::Dual) => {
                self.advance()?;
                TableExpr::Dual(pos.clone())
            }
            TokenKind::LParen => {
                self.advance()?;
                let query = self.parse_select_query()?;
                self.expect_kind(TokenKind::RParen)?;
                TableExpr::Subquery(Box::new(query))
            }
            TokenKind::Identifier => TableExpr::Identifier(self.expect_identifier()?),
            _ => return Err(self.unexpected()),
        };

        let alias = if self.consume_keyword(Keyword::As)? {
            Some(self.expect_identifier()?)
        } else if self.check_kind(TokenKind::Identifier) {
            Some(self.expect_identifier()?)
        } else {
            None
        };

        Ok(TableObject { expr, alias, pos })
    }

    fn parse_order_by_clause(&mut self) -> QueryResult<OrderByClause> {
        self.expect_keyword(Keyword::Order)?;
        self.expect_keyword(Keyword::By)?;
        let mut items = Vec::new();
        loop {
            let expr = self.parse_expression()?;
            let direction = if self.consume_keyword(Keyword::Asc)? {
                Some(OrderDirection::Ascending)
            } else if self.consume_keyword(Keyword::Desc)? {
                Some(OrderDirection::Descending)
            } else {
                None
            };
            let null_position = if self.consume_keyword(Keyword::Nulls)? {
                if self.consume_keyword(Keyword::First)? {
                    Some(NullPosition::First)
                } else {
                    self.expect_keyword(Keyword::Last)?;
                    Some(NullPosition::Last)
                }
            } else {
                None
            };
            items.push(OrderItem {
                expr,
                direction,
                null_position,
            });
            if !self.consume_kind(TokenKind::Comma)? {
                break;
            }
        }
        Ok(OrderByClause { items })
    }

    fn parse_expression_list(&mut self) -> QueryResult<Vec<Expression>> {
        let mut list = Vec::new();
        loop {
            list.push(self.parse_expression()?);
            if !self.consume_kind(TokenKind::Comma)? {
                return Ok(list);
            }
        }
    }

    fn parse_field_reference(&mut self) -> QueryResult<Expression> {
        let first = self.expect_identifier()?;
        if self.consume_kind(TokenKind::Dot)? {
            if self.check_kind(TokenKind::Integer) {
                let token = self.advance()?;
                let number = token.literal.parse::<i64>().map_err(|_| {
                    QueryError::syntax(
                        token.pos.clone(),
                        format!("syntax error: unexpected token \"{}\"", token.literal),
                    )
                })?;
                return Ok(Expression::ColumnNumber {
                    pos: first.pos.clone(),
                    view: first,
                    number,
                });
            }
            let column = self.expect_identifier()?;
            return Ok(Expression::FieldReference {
                view: Some(first),
                column,
            });
        }
        Ok(Expression::FieldReference {
            view: None,
            column: first,
        })
    }

    pub fn parse_expression(&mut self) -> QueryResult<Expression> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> QueryResult<Expression> {
        let mut lhs = self.parse_and()?;
        while self.check_keyword(Keyword::Or) {
            let pos = self.advance()?.pos;
            let rhs = self.parse_and()?;
            lhs = Expression::Logic {
                lhs: Box::new(lhs),
                op: LogicOp::Or,
                rhs: Box::new(rhs),
                pos,
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> QueryResult<Expression> {
        let mut lhs = self.parse_not()?;
        while self.check_keyword(Keyword::And) {
            let pos = self.advance()?.pos;
            let rhs = self.parse_not()?;
            lhs = Expression::Logic {
                lhs: Box::new(lhs),
                op: LogicOp::And,
                rhs: Box::new(rhs),
                pos,
            };
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> QueryResult<Expression> {
        if self.check_keyword(Keyword::Not) {
            let pos = self.advance()?.pos;
            let operand = self.parse_not()?;
            return Ok(Expression::UnaryLogic {
                operand: Box::new(operand),
                pos,
            });
        }
        self.parse_comparison()
    }

    /// Wraps a value list operand as a row value; scalars pass through.
    fn as_comparison_operand(expr: Expression) -> Expression {
        match expr {
            Expression::ValueList { values, pos } => Expression::RowValue {
                value: Box::new(Expression::ValueList {
                    values,
                    pos: pos.clone(),
                }),
                pos,
            },
            other => other,
        }
    }

    fn parse_comparison(&mut self) -> QueryResult<Expression> {
        let lhs = self.parse_concat()?;

        let comparison_op = match self.current.kind {
            TokenKind::Eq => Some(ComparisonOp::Equal),
            TokenKind::NotEq => Some(ComparisonOp::NotEqual),
            TokenKind::Lt => Some(ComparisonOp::LessThan),
            TokenKind::LtEq => Some(ComparisonOp::LessThanOrEqual),
            TokenKind::Gt => Some(ComparisonOp::GreaterThan),
            TokenKind::GtEq => Some(ComparisonOp::GreaterThanOrEqual),
            _ => None,
        };

        if let Some(op) = comparison_op {
            let pos = self.advance()?.pos;
            let lhs = Self::as_comparison_operand(lhs);

            if self.check_keyword(Keyword::Any) {
                self.advance()?;
                let values = self.parse_comparison_values()?;
                return Ok(Expression::Any {
                    lhs: Box::new(lhs),
                    op,
                    values: Box::new(values),
                    pos,
                });
            }
            if self.check_keyword(Keyword::All) {
                self.advance()?;
                let values = self.parse_comparison_values()?;
                return Ok(Expression::All {
                    lhs: Box::new(lhs),
                    op,
                    values: Box::new(values),
                    pos,
                });
            }

            let rhs = Self::as_comparison_operand(self.parse_concat()?);
            return Ok(Expression::Comparison {
                lhs: Box::new(lhs),
                op,
                rhs: Box::new(rhs),
                pos,
            });
        }

        if self.check_keyword(Keyword::Is) {
            let pos = self.advance()?.pos;
            let negated = self.consume_keyword(Keyword::Not)?;
            let rhs = self.parse_concat()?;
            return Ok(Expression::Is {
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                negated,
                pos,
            });
        }

        let negated = if self.check_keyword(Keyword::Not) {
            // NOT here can only introduce BETWEEN / LIKE / IN.
            let saved = self.current.clone();
            self.advance()?;
            if self.check_keyword(Keyword::Between)
                || self.check_keyword(Keyword::Like)
                || self.check_keyword(Keyword::In)
            {
                true
            } else {
                return Err(QueryError::syntax(
                    saved.pos,
                    format!("syntax error: unexpected token \"{}\"", saved.literal),
                ));
            }
        } else {
            false
        };

        if self.check_keyword(Keyword::Between) {
            let pos = self.advance()?.pos;
            let low = Self::as_comparison_operand(self.parse_concat()?);
            self.expect_keyword(Keyword::And)?;
            let high = Self::as_comparison_operand(self.parse_concat()?);
            return Ok(Expression::Between {
                lhs: Box::new(Self::as_comparison_operand(lhs)),
                low: Box::new(low),
                high: Box::new(high),
                negated,
                pos,
            });
        }

        if self.check_keyword(Keyword::Like) {
            let pos = self.advance()?.pos;
            let pattern = self.parse_concat()?;
            return Ok(Expression::Like {
                lhs: Box::new(lhs),
                pattern: Box::new(pattern),
                negated,
                pos,
            });
        }

        if self.check_keyword(Keyword::In) {
            let pos = self.advance()?.pos;
            let values = self.parse_comparison_values()?;
            return Ok(Expression::In {
                lhs: Box::new(Self::as_comparison_operand(lhs)),
                values: Box::new(values),
                negated,
                pos,
            });
        }

        Ok(lhs)
    }

    /// Right side of IN / ANY / ALL: a subquery, a row-value list, a value
    /// list, or a JSON query.
    fn parse_comparison_values(&mut self) -> QueryResult<Expression> {
        if self.check_keyword(Keyword::JsonRow) {
            return self.parse_json_query();
        }

        let pos = self.expect_kind(TokenKind::LParen)?.pos;

        if self.check_keyword(Keyword::Select) || self.check_keyword(Keyword::With) {
            let query = self.parse_select_query()?;
            self.expect_kind(TokenKind::RParen)?;
            return Ok(Expression::Subquery {
                query: Box::new(query),
                pos,
            });
        }

        if self.check_kind(TokenKind::LParen) {
            // Row-value list: ((1, 2), (3, 4), ...)
            let mut rows = Vec::new();
            loop {
                rows.push(self.parse_row_value()?);
                if !self.consume_kind(TokenKind::Comma)? {
                    break;
                }
            }
            self.expect_kind(TokenKind::RParen)?;
            return Ok(Expression::RowValueList { rows, pos });
        }

        let values = self.parse_expression_list()?;
        self.expect_kind(TokenKind::RParen)?;
        Ok(Expression::ValueList { values, pos })
    }

    fn parse_row_value(&mut self) -> QueryResult<Expression> {
        let pos = self.expect_kind(TokenKind::LParen)?.pos;
        if self.check_keyword(Keyword::Select) || self.check_keyword(Keyword::With) {
            let query = self.parse_select_query()?;
            self.expect_kind(TokenKind::RParen)?;
            return Ok(Expression::RowValue {
                value: Box::new(Expression::Subquery {
                    query: Box::new(query),
                    pos: pos.clone(),
                }),
                pos,
            });
        }
        let values = self.parse_expression_list()?;
        self.expect_kind(TokenKind::RParen)?;
        Ok(Expression::RowValue {
            value: Box::new(Expression::ValueList {
                values,
                pos: pos.clone(),
            }),
            pos,
        })
    }

    fn parse_json_query(&mut self) -> QueryResult<Expression> {
        let pos = self.expect_keyword(Keyword::JsonRow)?.pos;
        self.expect_kind(TokenKind::LParen)?;
        let query = self.parse_expression()?;
        self.expect_kind(TokenKind::Comma)?;
        let json_text = self.parse_expression()?;
        self.expect_kind(TokenKind::RParen)?;
        Ok(Expression::JsonQuery {
            query: Box::new(query),
            json_text: Box::new(json_text),
            pos,
        })
    }

    fn parse_concat(&mut self) -> QueryResult<Expression> {
        let first = self.parse_additive()?;
        if !self.check_kind(TokenKind::Concat) {
            return Ok(first);
        }
        let pos = first.pos().clone();
        let mut items = vec![first];
        while self.consume_kind(TokenKind::Concat)? {
            items.push(self.parse_additive()?);
        }
        Ok(Expression::Concat { items, pos })
    }

    fn parse_additive(&mut self) -> QueryResult<Expression> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.current.kind {
                TokenKind::Plus => ArithmeticOp::Add,
                TokenKind::Minus => ArithmeticOp::Subtract,
                _ => return Ok(lhs),
            };
            let pos = self.advance()?.pos;
            let rhs = self.parse_multiplicative()?;
            lhs = Expression::Arithmetic {
                lhs: Box::new(lhs),
                op,
                rhs: Box::new(rhs),
                pos,
            };
        }
    }

    fn parse_multiplicative(&mut self) -> QueryResult<Expression> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.current.kind {
                TokenKind::Asterisk => ArithmeticOp::Multiply,
                TokenKind::Slash => ArithmeticOp::Divide,
                TokenKind::Modulo => ArithmeticOp::Modulo,
                _ => return Ok(lhs),
            };
            let pos = self.advance()?.pos;
            let rhs = self.parse_unary()?;
            lhs = Expression::Arithmetic {
                lhs: Box::new(lhs),
                op,
                rhs: Box::new(rhs),
                pos,
            };
        }
    }

    fn parse_unary(&mut self) -> QueryResult<Expression> {
        match self.current.kind {
            TokenKind::Minus => {
                let pos = self.advance()?.pos;
                let operand = self.parse_unary()?;
                Ok(Expression::UnaryArithmetic {
                    operand: Box::new(operand),
                    negative: true,
                    pos,
                })
            }
            TokenKind::Plus => {
                let pos = self.advance()?.pos;
                let operand = self.parse_unary()?;
                Ok(Expression::UnaryArithmetic {
                    operand: Box::new(operand),
                    negative: false,
                    pos,
                })
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> QueryResult<Expression> {
        match self.current.kind {
            TokenKind::Integer => {
                let token = self.advance()?;
                let value = match token.literal.parse::<i64>() {
                    Ok(i) => Primary::Integer(i),
                    Err(_) => match token.literal.parse::<f64>() {
                        Ok(f) => Primary::Float(f),
                        Err(_) => {
                            return Err(QueryError::syntax(
                                token.pos,
                                format!("syntax error: unexpected token \"{}\"", token.literal),
                            ))
                        }
                    },
                };
                Ok(Expression::Primitive(PrimitiveLiteral {
                    value,
                    literal: token.literal,
                    pos: token.pos,
                }))
            }
            TokenKind::Float => {
                let token = self.advance()?;
                let value = token.literal.parse::<f64>().map(Primary::Float).map_err(|_| {
                    QueryError::syntax(
                        token.pos.clone(),
                        format!("syntax error: unexpected token \"{}\"", token.literal),
                    )
                })?;
                Ok(Expression::Primitive(PrimitiveLiteral {
                    value,
                    literal: token.literal,
                    pos: token.pos,
                }))
            }
            TokenKind::String => {
                let token = self.advance()?;
                Ok(Expression::Primitive(PrimitiveLiteral {
                    value: Primary::string(token.literal.clone()),
                    literal: token.literal,
                    pos: token.pos,
                }))
            }
            TokenKind::Datetime => {
                let token = self.advance()?;
                Ok(Expression::Primitive(PrimitiveLiteral {
                    value: Primary::string(token.literal.clone()),
                    literal: token.literal,
                    pos: token.pos,
                }))
            }
            TokenKind::Ternary => {
                let token = self.advance()?;
                let t = Ternary::parse(&token.literal).unwrap_or(Ternary::Unknown);
                Ok(Expression::Primitive(PrimitiveLiteral {
                    value: Primary::Ternary(t),
                    literal: token.literal,
                    pos: token.pos,
                }))
            }
            TokenKind::Keyword(Keyword::Null) => {
                let token = self.advance()?;
                Ok(Expression::Primitive(PrimitiveLiteral {
                    value: Primary::Null,
                    literal: token.literal,
                    pos: token.pos,
                }))
            }
            TokenKind::Variable => {
                let token = self.advance()?;
                if self.consume_kind(TokenKind::Substitution)? {
                    let value = self.parse_expression()?;
                    return Ok(Expression::VariableSubstitution {
                        name: token.literal,
                        value: Box::new(value),
                        pos: token.pos,
                    });
                }
                Ok(Expression::Variable {
                    name: token.literal,
                    pos: token.pos,
                })
            }
            TokenKind::Flag => {
                let token = self.advance()?;
                Ok(Expression::Flag {
                    name: token.literal,
                    pos: token.pos,
                })
            }
            TokenKind::EnvironmentVariable => {
                let token = self.advance()?;
                Ok(Expression::EnvironmentVariable {
                    name: token.literal,
                    quoted: token.quoted,
                    pos: token.pos,
                })
            }
            TokenKind::RuntimeInformation => {
                let token = self.advance()?;
                Ok(Expression::RuntimeInformation {
                    name: token.literal,
                    pos: token.pos,
                })
            }
            TokenKind::Placeholder => {
                let token = self.advance()?;
                let name = if token.literal == "?" {
                    String::new()
                } else {
                    token.literal.clone()
                };
                Ok(Expression::Placeholder {
                    name,
                    ordinal: token.holder_ordinal,
                    pos: token.pos,
                })
            }
            TokenKind::Keyword(Keyword::Case) => self.parse_case(),
            TokenKind::Keyword(Keyword::Exists) => {
                let pos = self.advance()?.pos;
                self.expect_kind(TokenKind::LParen)?;
                let query = self.parse_select_query()?;
                self.expect_kind(TokenKind::RParen)?;
                Ok(Expression::Exists {
                    query: Box::new(query),
                    pos,
                })
            }
            TokenKind::Keyword(Keyword::Cursor) => {
                let pos = self.advance()?.pos;
                let cursor = self.expect_identifier()?;
                if self.consume_keyword(Keyword::Is)? {
                    let negated = self.consume_keyword(Keyword::Not)?;
                    if self.consume_keyword(Keyword::Open)? {
                        return Ok(Expression::CursorStatus {
                            cursor,
                            status: CursorStatusType::Open,
                            negated,
                            pos,
                        });
                    }
                    self.expect_keyword(Keyword::In)?;
                    self.expect_keyword(Keyword::Range)?;
                    return Ok(Expression::CursorStatus {
                        cursor,
                        status: CursorStatusType::InRange,
                        negated,
                        pos,
                    });
                }
                self.expect_keyword(Keyword::Count)?;
                Ok(Expression::CursorAttribute { cursor, pos })
            }
            TokenKind::Keyword(Keyword::JsonRow) => self.parse_json_query(),
            TokenKind::Keyword(Keyword::Count) | TokenKind::Keyword(Keyword::If) => {
                // COUNT and IF are keywords that double as function names.
                let token = self.advance()?;
                if !self.check_kind(TokenKind::LParen) {
                    return Err(QueryError::syntax(
                        token.pos,
                        format!("syntax error: unexpected token \"{}\"", token.literal),
                    ));
                }
                self.parse_function_call(token.literal, token.pos)
            }
            TokenKind::Identifier => {
                let ident = self.expect_identifier()?;
                if self.check_kind(TokenKind::LParen) && !ident.quoted {
                    return self.parse_function_call(ident.literal, ident.pos);
                }
                if self.consume_kind(TokenKind::Dot)? {
                    if self.check_kind(TokenKind::Integer) {
                        let token = self.advance()?;
                        let number = token.literal.parse::<i64>().map_err(|_| {
                            QueryError::syntax(
                                token.pos.clone(),
                                format!("syntax error: unexpected token \"{}\"", token.literal),
                            )
                        })?;
                        return Ok(Expression::ColumnNumber {
                            pos: ident.pos.clone(),
                            view: ident,
                            number,
                        });
                    }
                    let column = self.expect_identifier()?;
                    return Ok(Expression::FieldReference {
                        view: Some(ident),
                        column,
                    });
                }
                Ok(Expression::FieldReference {
                    view: None,
                    column: ident,
                })
            }
            TokenKind::LParen => {
                let pos = self.advance()?.pos;
                if self.check_keyword(Keyword::Select) || self.check_keyword(Keyword::With) {
                    let query = self.parse_select_query()?;
                    self.expect_kind(TokenKind::RParen)?;
                    return Ok(Expression::Subquery {
                        query: Box::new(query),
                        pos,
                    });
                }
                let first = self.parse_expression()?;
                if self.check_kind(TokenKind::Comma) {
                    let mut values = vec![first];
                    while self.consume_kind(TokenKind::Comma)? {
                        values.push(self.parse_expression()?);
                    }
                    self.expect_kind(TokenKind::RParen)?;
                    return Ok(Expression::ValueList { values, pos });
                }
                self.expect_kind(TokenKind::RParen)?;
                Ok(Expression::Parentheses(Box::new(first)))
            }
            _ => Err(self.unexpected()),
        }
    }

    fn parse_case(&mut self) -> QueryResult<Expression> {
        let pos = self.advance()?.pos;

        let value = if self.check_keyword(Keyword::When) {
            None
        } else {
            Some(Box::new(self.parse_expression()?))
        };

        let mut when = Vec::new();
        while self.consume_keyword(Keyword::When)? {
            let condition = self.parse_expression()?;
            self.expect_keyword(Keyword::Then)?;
            let result = self.parse_expression()?;
            when.push(CaseWhen { condition, result });
        }
        if when.is_empty() {
            return Err(self.unexpected());
        }

        let else_result = if self.consume_keyword(Keyword::Else)? {
            Some(Box::new(self.parse_expression()?))
        } else {
            None
        };

        self.expect_keyword(Keyword::End)?;
        Ok(Expression::Case {
            value,
            when,
            else_result,
            pos,
        })
    }

    fn parse_function_call(&mut self, name: String, pos: Pos) -> QueryResult<Expression> {
        self.expect_kind(TokenKind::LParen)?;
        let distinct = self.consume_keyword(Keyword::Distinct)?;

        let mut args = Vec::new();
        if !self.check_kind(TokenKind::RParen) {
            loop {
                if self.check_kind(TokenKind::Asterisk) {
                    let token = self.advance()?;
                    args.push(Expression::AllColumns { pos: token.pos });
                } else {
                    args.push(self.parse_expression()?);
                }
                if !self.consume_kind(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.expect_kind(TokenKind::RParen)?;

        let uname = name.to_ascii_uppercase();

        if self.check_keyword(Keyword::Over) {
            self.advance()?;
            self.expect_kind(TokenKind::LParen)?;
            let mut partition = Vec::new();
            if self.consume_keyword(Keyword::Partition)? {
                self.expect_keyword(Keyword::By)?;
                loop {
                    partition.push(self.parse_expression()?);
                    if !self.consume_kind(TokenKind::Comma)? {
                        break;
                    }
                }
            }
            let order_by = if self.check_keyword(Keyword::Order) {
                Some(self.parse_order_by_clause()?)
            } else {
                None
            };
            self.expect_kind(TokenKind::RParen)?;
            return Ok(Expression::AnalyticFunction {
                name,
                distinct,
                args,
                partition,
                order_by,
                pos,
            });
        }

        if LIST_FUNCTION_NAMES.contains(&uname.as_str()) {
            let order_by = if self.check_keyword(Keyword::Within) {
                self.advance()?;
                self.expect_keyword(Keyword::Group)?;
                self.expect_kind(TokenKind::LParen)?;
                let ob = self.parse_order_by_clause()?;
                self.expect_kind(TokenKind::RParen)?;
                Some(ob)
            } else {
                None
            };
            return Ok(Expression::ListFunction {
                name,
                distinct,
                args,
                order_by,
                pos,
            });
        }

        if AGGREGATE_NAMES.contains(&uname.as_str()) {
            return Ok(Expression::AggregateFunction {
                name,
                distinct,
                args,
                pos,
            });
        }

        if distinct {
            // DISTINCT is only meaningful for aggregates; treat unknown
            // names as user-defined aggregate calls.
            return Ok(Expression::AggregateFunction {
                name,
                distinct,
                args,
                pos,
            });
        }

        Ok(Expression::Function { name, args, pos })
    }
}
