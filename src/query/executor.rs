//! # Query Executor
//!
//! Translates the statement tree into view operations and procedural
//! control flow. The SELECT pipeline runs FROM (load + join) → WHERE →
//! GROUP BY → HAVING → analytic functions → SELECT projections → ORDER BY
//! → LIMIT/OFFSET, with set operations and recursive CTEs layered on top.
//!
//! Statements execute strictly sequentially; parallelism only ever happens
//! inside per-record evaluation through the evaluator's worker drive.
//!
//! ## Projection model
//!
//! Select fields are computed as columns appended to the working view, so
//! ORDER BY can reference both select aliases and columns that are not
//! projected. After ordering and LIMIT/OFFSET the view is fixed down to
//! the projected columns.
//!
//! ## Write discipline
//!
//! DML and DDL build the complete new state first, then publish it to the
//! temporary-view scope or the transaction's view cache and mark the path
//! uncommitted. An error mid-statement therefore leaves the visible state
//! untouched. COMMIT rewrites files through the codec and hardens restore
//! points; ROLLBACK restores every uncommitted view from its snapshot.

use crate::codec::{self, ReadOptions, WriteOptions};
use crate::config::Format;
use crate::error::{QueryError, QueryResult};
use crate::query::analytic;
use crate::query::cursor::Cursor;
use crate::query::evaluator::{Evaluator, ReplaceValues};
use crate::query::header::{Header, HeaderField};
use crate::query::record::{Cell, Record};
use crate::query::scope::{Scopes, UserDefinedFunction};
use crate::query::sort_value::{SortValue, SortValues};
use crate::query::view::{FileInfo, View};
use crate::query::worker::CancellationToken;
use crate::sql::ast::*;
use crate::sql::token::{FetchPosition, Pos};
use crate::sql::parse;
use crate::transaction::Transaction;
use crate::value::{Primary, Ternary};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info_span};

const RECURSION_ROW_LIMIT: usize = 1_000_000;

/// Control flow raised by procedural statements and consumed by the
/// enclosing loop, function body, or program.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    Normal,
    Continue,
    Break,
    Exit(i32),
    Return(Primary),
}

pub struct Processor<'a> {
    pub tx: &'a Transaction,
    pub scopes: Scopes,
    pub cancel: CancellationToken,
    pub replace_values: Option<Arc<ReplaceValues>>,
}

impl<'a> Processor<'a> {
    pub fn new(tx: &'a Transaction) -> Self {
        Self {
            tx,
            scopes: Scopes::new(),
            cancel: CancellationToken::new(),
            replace_values: None,
        }
    }

    fn evaluator(&self) -> Evaluator<'a> {
        let mut ev = Evaluator::new(self.tx, self.scopes.shared(), self.cancel.clone());
        ev.replace_values = self.replace_values.clone();
        ev
    }

    pub fn execute(&mut self, statements: &[Statement]) -> QueryResult<Flow> {
        for statement in statements {
            match self.execute_statement(statement)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    pub fn execute_statement(&mut self, statement: &Statement) -> QueryResult<Flow> {
        self.cancel.check()?;
        let span = info_span!("statement");
        let _enter = span.enter();

        match statement {
            Statement::Select(query) => {
                let ev = self.evaluator();
                let view = select_as_subquery(&ev, query)?;
                self.tx.counts.lock().selected += view.record_len();
                self.write_result_view(&view)?;
                Ok(Flow::Normal)
            }
            Statement::Insert(query) => self.execute_insert(query).map(|_| Flow::Normal),
            Statement::Update(query) => self.execute_update(query).map(|_| Flow::Normal),
            Statement::Delete(query) => self.execute_delete(query).map(|_| Flow::Normal),
            Statement::CreateTable(expr) => self.execute_create_table(expr).map(|_| Flow::Normal),
            Statement::AddColumns(expr) => self.execute_add_columns(expr).map(|_| Flow::Normal),
            Statement::DropColumns(expr) => self.execute_drop_columns(expr).map(|_| Flow::Normal),
            Statement::RenameColumn(expr) => self.execute_rename_column(expr).map(|_| Flow::Normal),
            Statement::DeclareView {
                view,
                fields,
                query,
                pos,
            } => self.execute_declare_view(view, fields, query.as_ref(), pos).map(|_| Flow::Normal),
            Statement::DisposeView { view, .. } => {
                self.scopes.dispose_temp_view(view)?;
                Ok(Flow::Normal)
            }
            Statement::VariableDeclaration { assignments, .. } => {
                for assignment in assignments {
                    let value = match &assignment.value {
                        Some(expr) => self.evaluator().evaluate(expr)?,
                        None => Primary::Null,
                    };
                    self.scopes
                        .declare_variable(&assignment.name, value, &assignment.pos)?;
                }
                Ok(Flow::Normal)
            }
            Statement::VariableSubstitution { name, value, pos } => {
                let value = self.evaluator().evaluate(value)?;
                self.scopes.substitute_variable(name, value, pos)?;
                Ok(Flow::Normal)
            }
            Statement::DisposeVariable { name, pos } => {
                self.scopes.dispose_variable(name, pos)?;
                Ok(Flow::Normal)
            }
            Statement::DeclareCursor { cursor, query, pos } => {
                self.scopes
                    .declare_cursor(Cursor::new(cursor.literal.clone(), query.clone()), pos)?;
                Ok(Flow::Normal)
            }
            Statement::OpenCursor { cursor, .. } => {
                let query = self.scopes.cursor_query(cursor)?;
                let ev = self.evaluator();
                let view = select_as_subquery(&ev, &query)?;
                self.scopes.open_cursor(cursor, view)?;
                Ok(Flow::Normal)
            }
            Statement::CloseCursor { cursor, .. } => {
                self.scopes.close_cursor(cursor)?;
                Ok(Flow::Normal)
            }
            Statement::DisposeCursor { cursor, .. } => {
                self.scopes.dispose_cursor(cursor)?;
                Ok(Flow::Normal)
            }
            Statement::FetchCursor {
                cursor,
                position,
                number,
                variables,
                pos,
            } => {
                let number = match number {
                    Some(expr) => self.scalar_integer(expr)?,
                    None => 0,
                };
                let fetched = self.scopes.fetch_cursor(cursor, *position, number)?;
                if let Some(values) = fetched {
                    if values.len() != variables.len() {
                        return Err(QueryError::FieldLengthNotMatch { pos: pos.clone() });
                    }
                    for (name, value) in variables.iter().zip(values.into_iter()) {
                        self.scopes.substitute_variable(name, value, pos)?;
                    }
                }
                Ok(Flow::Normal)
            }
            Statement::DeclareFunction(declaration) => {
                self.scopes.declare_function(UserDefinedFunction {
                    name: declaration.name.literal.clone(),
                    is_aggregate: declaration.is_aggregate,
                    cursor: declaration.cursor.as_ref().map(|c| c.literal.clone()),
                    parameters: declaration.parameters.clone(),
                    body: declaration.body.clone(),
                    pos: declaration.pos.clone(),
                })?;
                Ok(Flow::Normal)
            }
            Statement::DisposeFunction { name, .. } => {
                self.scopes.dispose_function(name)?;
                Ok(Flow::Normal)
            }
            Statement::If(stmt) => self.execute_if(stmt),
            Statement::While(stmt) => self.execute_while(stmt),
            Statement::WhileInCursor(stmt) => self.execute_while_in_cursor(stmt),
            Statement::Continue { .. } => Ok(Flow::Continue),
            Statement::Break { .. } => Ok(Flow::Break),
            Statement::Exit { code, .. } => {
                let code = match code {
                    Some(expr) => self.scalar_integer(expr)? as i32,
                    None => 0,
                };
                Ok(Flow::Exit(code))
            }
            Statement::Return { value, .. } => {
                let value = match value {
                    Some(expr) => self.evaluator().evaluate(expr)?,
                    None => Primary::Null,
                };
                Ok(Flow::Return(value))
            }
            Statement::Print { value, .. } => {
                let value = self.evaluator().evaluate(value)?;
                let rendered = match &value {
                    Primary::String(s) => format!("'{}'", s),
                    other => other.to_string(),
                };
                self.tx.session.write_out(&format!("{}\n", rendered));
                Ok(Flow::Normal)
            }
            Statement::Printf {
                format,
                values,
                pos,
            } => {
                let template = self
                    .evaluator()
                    .evaluate(format)?
                    .as_string()
                    .ok_or_else(|| QueryError::InvalidValueExpression {
                        pos: pos.clone(),
                        expr: format.to_string(),
                    })?;
                let mut args = Vec::with_capacity(values.len());
                for v in values {
                    args.push(self.evaluator().evaluate(v)?);
                }
                let formatted = format_template(&template, &args);
                self.tx.session.write_out(&format!("{}\n", formatted));
                Ok(Flow::Normal)
            }
            Statement::Source { file, pos } => self.execute_source(file, pos),
            Statement::Execute {
                statements,
                values,
                pos,
            } => self.execute_template(statements, values, pos),
            Statement::SetFlag { name, value, pos } => {
                let value = self.evaluator().evaluate(value)?;
                let text = match &value {
                    Primary::Boolean(b) => b.to_string(),
                    Primary::Ternary(t) => t.to_string(),
                    other => other.as_string().unwrap_or_default(),
                };
                self.tx.update_flags(|flags| flags.set(name, &text, pos))?;
                Ok(Flow::Normal)
            }
            Statement::SetEnvVar { name, value, .. } => {
                let value = self.evaluator().evaluate(value)?;
                std::env::set_var(name, value.as_string().unwrap_or_default());
                Ok(Flow::Normal)
            }
            Statement::UnsetEnvVar { name, .. } => {
                std::env::remove_var(name);
                Ok(Flow::Normal)
            }
            Statement::ShowFlag { name, pos } => {
                let value = self.tx.flags().show(name, pos)?;
                self.tx
                    .session
                    .write_out(&format!("@@{}: {}\n", name.to_uppercase(), value));
                Ok(Flow::Normal)
            }
            Statement::ShowObjects { object_type, .. } => {
                self.execute_show_objects(*object_type);
                Ok(Flow::Normal)
            }
            Statement::ShowFields { table, .. } => {
                let ev = self.evaluator();
                let object = TableObject {
                    expr: TableExpr::Identifier(table.clone()),
                    alias: None,
                    pos: table.pos.clone(),
                };
                let mut context = SelectContext::new(&ev);
                let view = load_table_object(&mut context, &object)?;
                self.tx
                    .session
                    .write_out(&format!("Fields in {}\n", table.literal));
                for (i, field) in view.header.fields.iter().enumerate() {
                    self.tx
                        .session
                        .write_out(&format!("  {}. {}\n", i + 1, field.column));
                }
                Ok(Flow::Normal)
            }
            Statement::Prepare {
                name,
                statement,
                pos,
            } => {
                let mut prepared = self.tx.prepared.lock();
                let key = name.literal.to_uppercase();
                if prepared.contains_key(&key) {
                    return Err(QueryError::StatementRedeclared {
                        pos: pos.clone(),
                        name: name.literal.clone(),
                    });
                }
                prepared.insert(
                    key,
                    crate::transaction::PreparedStatement {
                        name: name.literal.clone(),
                        statement: statement.clone(),
                    },
                );
                Ok(Flow::Normal)
            }
            Statement::ExecutePrepared { name, values, pos } => {
                self.execute_prepared(name, values, pos)
            }
            Statement::DisposePrepared { name, pos } => {
                let mut prepared = self.tx.prepared.lock();
                if prepared.remove(&name.literal.to_uppercase()).is_none() {
                    return Err(QueryError::UndeclaredStatement {
                        pos: pos.clone(),
                        name: name.literal.clone(),
                    });
                }
                Ok(Flow::Normal)
            }
            Statement::Commit { pos } => {
                self.commit(pos)?;
                Ok(Flow::Normal)
            }
            Statement::Rollback { .. } => {
                self.rollback()?;
                Ok(Flow::Normal)
            }
            Statement::ExternalCommand { command, .. } => {
                self.execute_external_command(command)?;
                Ok(Flow::Normal)
            }
        }
    }

    fn scalar_integer(&self, expr: &Expression) -> QueryResult<i64> {
        let value = self.evaluator().evaluate(expr)?;
        value
            .as_integer()
            .ok_or_else(|| QueryError::InvalidValueExpression {
                pos: expr.pos().clone(),
                expr: expr.to_string(),
            })
    }

    fn write_result_view(&self, view: &View) -> QueryResult<()> {
        let flags = self.tx.flags();
        let columns = view.header.column_names();
        let text = match flags.format {
            Format::Text => codec::table::render_text(&columns, &view.record_set),
            Format::Gfm => codec::table::render_gfm(&columns, &view.record_set),
            Format::Org => codec::table::render_org(&columns, &view.record_set),
            format => {
                let options = WriteOptions::from_flags(&flags, format);
                codec::write_table(&columns, &view.record_set, &options)?
            }
        };
        drop(flags);
        self.tx.session.write_out(&text);
        Ok(())
    }

    fn execute_if(&mut self, stmt: &IfStatement) -> QueryResult<Flow> {
        if self.evaluator().evaluate(&stmt.condition)?.as_ternary() == Ternary::True {
            return self.execute(&stmt.body);
        }
        for else_if in &stmt.else_if {
            if self.evaluator().evaluate(&else_if.condition)?.as_ternary() == Ternary::True {
                return self.execute(&else_if.body);
            }
        }
        self.execute(&stmt.else_body)
    }

    fn execute_while(&mut self, stmt: &WhileStatement) -> QueryResult<Flow> {
        loop {
            self.cancel.check()?;
            if self.evaluator().evaluate(&stmt.condition)?.as_ternary() != Ternary::True {
                return Ok(Flow::Normal);
            }
            match self.execute(&stmt.body)? {
                Flow::Normal | Flow::Continue => {}
                Flow::Break => return Ok(Flow::Normal),
                flow => return Ok(flow),
            }
        }
    }

    fn execute_while_in_cursor(&mut self, stmt: &WhileInCursor) -> QueryResult<Flow> {
        loop {
            self.cancel.check()?;
            let fetched = self
                .scopes
                .fetch_cursor(&stmt.cursor, FetchPosition::Next, 0)?;
            let values = match fetched {
                Some(values) => values,
                None => return Ok(Flow::Normal),
            };
            if values.len() != stmt.variables.len() {
                return Err(QueryError::FieldLengthNotMatch {
                    pos: stmt.pos.clone(),
                });
            }
            for (name, value) in stmt.variables.iter().zip(values.into_iter()) {
                self.scopes.substitute_variable(name, value, &stmt.pos)?;
            }
            match self.execute(&stmt.body)? {
                Flow::Normal | Flow::Continue => {}
                Flow::Break => return Ok(Flow::Normal),
                flow => return Ok(flow),
            }
        }
    }

    fn execute_source(&mut self, file: &Expression, pos: &Pos) -> QueryResult<Flow> {
        let path = self
            .evaluator()
            .evaluate(file)?
            .as_string()
            .ok_or_else(|| QueryError::InvalidValueExpression {
                pos: pos.clone(),
                expr: file.to_string(),
            })?;
        let text = std::fs::read_to_string(&path).map_err(|_| QueryError::FileNotExist {
            pos: pos.clone(),
            path: path.clone(),
        })?;
        let statements = {
            let flags = self.tx.flags();
            parse(
                &text,
                Some(path),
                &flags.datetime_format,
                &flags.timezone,
                false,
            )?
        };
        self.execute(&statements)
    }

    fn execute_template(
        &mut self,
        template: &Expression,
        values: &[Expression],
        pos: &Pos,
    ) -> QueryResult<Flow> {
        let template_text = self
            .evaluator()
            .evaluate(template)?
            .as_string()
            .ok_or_else(|| QueryError::InvalidValueExpression {
                pos: pos.clone(),
                expr: template.to_string(),
            })?;
        let mut args = Vec::with_capacity(values.len());
        for v in values {
            args.push(self.evaluator().evaluate(v)?);
        }
        let source = format_template(&template_text, &args);
        let statements = {
            let flags = self.tx.flags();
            parse(&source, None, &flags.datetime_format, &flags.timezone, false)?
        };
        self.execute(&statements)
    }

    fn execute_prepared(
        &mut self,
        name: &Identifier,
        values: &[ReplaceValue],
        pos: &Pos,
    ) -> QueryResult<Flow> {
        let prepared = {
            let prepared = self.tx.prepared.lock();
            prepared
                .get(&name.literal.to_uppercase())
                .cloned()
                .ok_or_else(|| QueryError::UndeclaredStatement {
                    pos: pos.clone(),
                    name: name.literal.clone(),
                })?
        };

        let mut replace = ReplaceValues::default();
        for (i, value) in values.iter().enumerate() {
            let evaluated = self.evaluator().evaluate(&value.value)?;
            replace.values.push(evaluated);
            if let Some(value_name) = &value.name {
                replace
                    .names
                    .insert(value_name.literal.to_uppercase(), i);
            }
        }

        let statements = {
            let flags = self.tx.flags();
            parse(
                &prepared.statement,
                None,
                &flags.datetime_format,
                &flags.timezone,
                true,
            )?
        };

        let saved = self.replace_values.take();
        self.replace_values = Some(Arc::new(replace));
        let result = self.execute(&statements);
        self.replace_values = saved;
        result
    }

    fn execute_show_objects(&self, object_type: ShowObjectType) {
        let names: Vec<String> = match object_type {
            ShowObjectType::Tables => self.tx.cached_view_keys(),
            ShowObjectType::Views => self.scopes.all_temp_view_names(),
            ShowObjectType::Cursors => self.scopes.all_cursor_names(),
            ShowObjectType::Functions => self.scopes.all_function_names(),
            ShowObjectType::Statements => {
                let mut names: Vec<String> =
                    self.tx.prepared.lock().values().map(|p| p.name.clone()).collect();
                names.sort();
                names
            }
            ShowObjectType::Flags => {
                let flags = self.tx.flags();
                crate::config::FLAG_LIST
                    .iter()
                    .map(|name| {
                        let value = flags.show(name, &Pos::default()).unwrap_or_default();
                        format!("@@{}: {}", name, value)
                    })
                    .collect()
            }
            ShowObjectType::Env => {
                let mut vars: Vec<String> = std::env::vars()
                    .map(|(k, v)| format!("@%{}: {}", k, v))
                    .collect();
                vars.sort();
                vars
            }
            ShowObjectType::Runinfo => {
                let uncommitted = self.tx.uncommitted.lock();
                vec![
                    format!("@#UNCOMMITTED: {}", !uncommitted.is_empty()),
                    format!("@#CREATED: {}", uncommitted.created_len()),
                    format!("@#UPDATED: {}", uncommitted.updated_len()),
                    format!("@#VERSION: {}", env!("CARGO_PKG_VERSION")),
                ]
            }
        };
        if names.is_empty() {
            self.tx.session.write_out("No items.\n");
        } else {
            for name in names {
                self.tx.session.write_out(&format!("{}\n", name));
            }
        }
    }

    fn execute_external_command(&self, command: &str) -> QueryResult<()> {
        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .map_err(|e| QueryError::Io {
                message: format!("external command failed: {}", e),
            })?;
        self.tx
            .session
            .write_out(&String::from_utf8_lossy(&output.stdout));
        if !output.status.success() {
            return Err(QueryError::Io {
                message: format!(
                    "external command exited with status {}",
                    output.status.code().unwrap_or(-1)
                ),
            });
        }
        Ok(())
    }

    // ---- update targets ----

    /// Loads a DML target. Temporary views take precedence over files.
    fn load_target(&self, table: &Identifier) -> QueryResult<(View, bool)> {
        if self.scopes.temp_view_exists(&table.literal) {
            return Ok((self.scopes.temp_view(table)?, true));
        }
        let ev = self.evaluator();
        let mut context = SelectContext::new(&ev);
        let view = load_file_table(&mut context, table, None)?;
        Ok((view, false))
    }

    /// Publishes a mutated target and marks it uncommitted.
    fn publish_target(&mut self, view: View, is_temp: bool) {
        let key = view
            .file_info
            .as_ref()
            .map(|i| i.key())
            .unwrap_or_default();
        if is_temp {
            self.scopes.replace_temp_view(view);
        } else {
            self.tx.replace_cached_view(view);
        }
        self.tx.uncommitted.lock().mark_updated(&key);
    }

    fn execute_insert(&mut self, query: &InsertQuery) -> QueryResult<usize> {
        let (mut view, is_temp) = self.load_target(&query.table)?;

        let indices: Vec<usize> = if query.fields.is_empty() {
            (0..view.field_len()).collect()
        } else {
            let mut indices = Vec::with_capacity(query.fields.len());
            for field in &query.fields {
                indices.push(view.field_index(field)?);
            }
            indices
        };

        let mut inserted = 0usize;
        let mut ev = self.evaluator();

        if let Some(select) = &query.query {
            let source = select_as_subquery(&ev, select)?;
            if source.field_len() != indices.len() {
                return Err(QueryError::InsertSelectFieldLength {
                    pos: select.pos.clone(),
                    expected: indices.len(),
                });
            }
            for record in &source.record_set {
                let mut new_record: Record = vec![Cell::new(Primary::Null); view.field_len()];
                for (n, &idx) in indices.iter().enumerate() {
                    new_record[idx] = Cell::new(record[n].value().clone());
                }
                view.record_set.push(new_record);
                inserted += 1;
            }
        } else {
            for row in &query.values {
                let values = ev.eval_row_value(row)?.unwrap_or_default();
                if values.len() != indices.len() {
                    return Err(QueryError::InsertRowValueLength {
                        pos: row.pos().clone(),
                        expected: indices.len(),
                    });
                }
                let mut new_record: Record = vec![Cell::new(Primary::Null); view.field_len()];
                for (n, &idx) in indices.iter().enumerate() {
                    new_record[idx] = Cell::new(values[n].clone());
                }
                view.record_set.push(new_record);
                inserted += 1;
            }
        }

        self.publish_target(view, is_temp);
        self.tx.counts.lock().inserted += inserted;
        debug!(inserted, table = %query.table.literal, "insert");
        Ok(inserted)
    }

    fn execute_update(&mut self, query: &UpdateQuery) -> QueryResult<usize> {
        let (mut view, is_temp) = self.load_target(&query.table)?;

        let ev = self.evaluator();
        let work = Arc::new(view.with_internal_id(self.tx.flags().cpu, &self.cancel)?);
        let matches = filter_records(&ev, &work, query.where_clause.as_ref())?;

        // Resolve assignment targets against the unmodified header.
        let mut target_indices = Vec::with_capacity(query.set_list.len());
        for set in &query.set_list {
            target_indices.push(view.field_index(&set.field)?);
        }

        let mut updated = 0usize;
        for (work_idx, matched) in matches.iter().enumerate() {
            if !matched {
                continue;
            }
            let original = match work.record_set[work_idx][0].value() {
                Primary::Integer(i) => *i as usize,
                _ => continue,
            };
            let mut child = ev.child_for_record(work.clone(), work_idx);
            for (set, &idx) in query.set_list.iter().zip(target_indices.iter()) {
                let value = child.evaluate(&set.value)?;
                view.record_set[original][idx] = Cell::new(value);
            }
            updated += 1;
        }

        self.publish_target(view, is_temp);
        self.tx.counts.lock().updated += updated;
        debug!(updated, table = %query.table.literal, "update");
        Ok(updated)
    }

    fn execute_delete(&mut self, query: &DeleteQuery) -> QueryResult<usize> {
        let (mut view, is_temp) = self.load_target(&query.table)?;

        let ev = self.evaluator();
        let shared = Arc::new(view.clone());
        let matches = filter_records(&ev, &shared, query.where_clause.as_ref())?;

        let mut kept = Vec::with_capacity(view.record_set.len());
        let mut deleted = 0usize;
        for (i, record) in view.record_set.drain(..).enumerate() {
            if matches[i] {
                deleted += 1;
            } else {
                kept.push(record);
            }
        }
        view.record_set = kept;

        self.publish_target(view, is_temp);
        self.tx.counts.lock().deleted += deleted;
        debug!(deleted, table = %query.table.literal, "delete");
        Ok(deleted)
    }

    fn execute_create_table(&mut self, expr: &CreateTable) -> QueryResult<()> {
        let flags = self.tx.flags();
        let mut path = PathBuf::from(&expr.table.literal);
        if path.extension().is_none() {
            path.set_extension("csv");
        }
        let path = if path.is_absolute() {
            path
        } else {
            base_directory(&flags.repository).join(path)
        };
        drop(flags);
        let path_str = path.to_string_lossy().to_string();

        if path.exists() || self.tx.cached_view_exists(&path_str.to_uppercase()) {
            return Err(QueryError::FileAlreadyExist {
                pos: expr.table.pos.clone(),
                path: expr.table.literal.clone(),
            });
        }

        let (columns, record_set) = match &expr.query {
            Some(query) => {
                let ev = self.evaluator();
                let source = select_as_subquery(&ev, query)?;
                let mut columns = source.header.column_names();
                if !expr.fields.is_empty() {
                    if expr.fields.len() != columns.len() {
                        return Err(QueryError::FieldLengthNotMatch {
                            pos: expr.pos.clone(),
                        });
                    }
                    columns = expr.fields.iter().map(|f| f.literal.clone()).collect();
                }
                (columns, source.record_set)
            }
            None => (
                expr.fields.iter().map(|f| f.literal.clone()).collect(),
                Vec::new(),
            ),
        };

        check_duplicate_columns(&columns, &expr.pos)?;

        let handle = self.tx.lock_file(&path_str)?;
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut info = FileInfo::new(path_str.clone(), format_for_path(&path, Format::Csv));
        info.delimiter = if info.format == Format::Tsv { '\t' } else { ',' };
        info.handle = Some(handle);

        let mut view = View::new(Header::from_table(&stem, &columns), record_set);
        view.file_info = Some(info);
        view.store_restore_point();

        self.tx.cache_view(view);
        self.tx.uncommitted.lock().mark_created(&path_str);
        debug!(path = %path_str, "create table");
        Ok(())
    }

    fn execute_declare_view(
        &mut self,
        name: &Identifier,
        fields: &[Identifier],
        query: Option<&SelectQuery>,
        pos: &Pos,
    ) -> QueryResult<()> {
        if self.scopes.temp_view_exists(&name.literal) {
            return Err(QueryError::TemporaryTableRedeclared {
                pos: pos.clone(),
                table: name.literal.clone(),
            });
        }

        let (columns, record_set) = match query {
            Some(query) => {
                let ev = self.evaluator();
                let source = select_as_subquery(&ev, query)?;
                let mut columns = source.header.column_names();
                if !fields.is_empty() {
                    if fields.len() != columns.len() {
                        return Err(QueryError::FieldLengthNotMatch { pos: pos.clone() });
                    }
                    columns = fields.iter().map(|f| f.literal.clone()).collect();
                }
                (columns, source.record_set)
            }
            None => (
                fields.iter().map(|f| f.literal.clone()).collect::<Vec<_>>(),
                Vec::new(),
            ),
        };

        check_duplicate_columns(&columns, pos)?;

        let mut view = View::new(Header::from_table(&name.literal, &columns), record_set);
        view.file_info = Some(FileInfo::temporary(name.literal.clone()));
        view.store_restore_point();
        self.scopes.set_temp_view(view);
        Ok(())
    }

    fn renumber_from_table_fields(header: &mut Header) {
        let mut number = 0usize;
        for field in &mut header.fields {
            if field.is_from_table {
                number += 1;
                field.number = number;
            }
        }
    }

    fn execute_add_columns(&mut self, expr: &AddColumns) -> QueryResult<usize> {
        let (mut view, is_temp) = self.load_target(&expr.table)?;

        for column in &expr.columns {
            if view
                .header
                .fields
                .iter()
                .any(|f| f.column.eq_ignore_ascii_case(&column.column.literal))
            {
                return Err(QueryError::DuplicateFieldName {
                    pos: column.column.pos.clone(),
                    field: column.column.literal.clone(),
                });
            }
        }

        let insert_at = match &expr.position {
            None | Some(ColumnPosition::Last) => view.field_len(),
            Some(ColumnPosition::First) => 0,
            Some(ColumnPosition::After(ident)) => {
                let field = Expression::FieldReference {
                    view: None,
                    column: ident.clone(),
                };
                view.field_index(&field)? + 1
            }
            Some(ColumnPosition::Before(ident)) => {
                let field = Expression::FieldReference {
                    view: None,
                    column: ident.clone(),
                };
                view.field_index(&field)?
            }
        };

        let view_name = view
            .header
            .fields
            .first()
            .map(|f| f.view.clone())
            .unwrap_or_default();

        // Evaluate defaults per record before mutating the header so the
        // expressions see the original fields.
        let ev = self.evaluator();
        let shared = Arc::new(view.clone());
        let mut default_columns: Vec<Vec<Primary>> = Vec::with_capacity(expr.columns.len());
        for column in &expr.columns {
            let values = match &column.value {
                Some(default) => {
                    let slots: Vec<Mutex<Primary>> = (0..shared.record_len())
                        .map(|_| Mutex::new(Primary::Null))
                        .collect();
                    ev.evaluate_for_records(&shared, &[default], |child, i| {
                        *slots[i].lock() = child.evaluate(default)?;
                        Ok(())
                    })?;
                    slots.into_iter().map(|s| s.into_inner()).collect()
                }
                None => vec![Primary::Null; shared.record_len()],
            };
            default_columns.push(values);
        }

        for (n, column) in expr.columns.iter().enumerate() {
            view.header.fields.insert(
                insert_at + n,
                HeaderField {
                    view: view_name.clone(),
                    column: column.column.literal.clone(),
                    is_from_table: true,
                    ..Default::default()
                },
            );
        }
        for (i, record) in view.record_set.iter_mut().enumerate() {
            for (n, values) in default_columns.iter().enumerate() {
                record.insert(insert_at + n, Cell::new(values[i].clone()));
            }
        }
        Self::renumber_from_table_fields(&mut view.header);

        let added = expr.columns.len();
        self.publish_target(view, is_temp);
        Ok(added)
    }

    fn execute_drop_columns(&mut self, expr: &DropColumns) -> QueryResult<usize> {
        let (mut view, is_temp) = self.load_target(&expr.table)?;

        let mut indices = Vec::with_capacity(expr.columns.len());
        for column in &expr.columns {
            indices.push(view.field_index(column)?);
        }
        indices.sort_unstable();
        indices.dedup();

        for &idx in indices.iter().rev() {
            view.header.fields.remove(idx);
            for record in &mut view.record_set {
                record.remove(idx);
            }
        }
        Self::renumber_from_table_fields(&mut view.header);

        let dropped = indices.len();
        self.publish_target(view, is_temp);
        Ok(dropped)
    }

    fn execute_rename_column(&mut self, expr: &RenameColumn) -> QueryResult<()> {
        let (mut view, is_temp) = self.load_target(&expr.table)?;
        let idx = view.field_index(&expr.old)?;

        let conflict = view
            .header
            .fields
            .iter()
            .enumerate()
            .any(|(i, f)| i != idx && f.column.eq_ignore_ascii_case(&expr.new.literal));
        if conflict {
            return Err(QueryError::DuplicateFieldName {
                pos: expr.new.pos.clone(),
                field: expr.new.literal.clone(),
            });
        }

        view.header.fields[idx].column = expr.new.literal.clone();
        self.publish_target(view, is_temp);
        Ok(())
    }

    // ---- transaction boundaries ----

    pub fn commit(&mut self, _pos: &Pos) -> QueryResult<()> {
        let keys = self.tx.uncommitted.lock().keys();
        if keys.is_empty() {
            return Ok(());
        }

        self.scopes.store_temp_views(&keys);

        let flags = self.tx.flags();
        let json_escape = flags.json_escape;
        let quiet = flags.quiet;
        drop(flags);

        for key in &keys {
            let Some(view) = self.tx.cached_view(key) else {
                continue;
            };
            let Some(info) = view.file_info.clone() else {
                continue;
            };
            let options = WriteOptions {
                format: info.format,
                delimiter: info.delimiter,
                delimiter_positions: info.delimiter_positions.clone(),
                line_break: info.line_break,
                without_header: info.no_header,
                enclose_all: info.enclose_all,
                json_escape,
                pretty_print: info.pretty_print,
                encoding: info.encoding,
            };
            let text =
                codec::write_table(&view.header.column_names(), &view.record_set, &options)?;
            std::fs::write(&info.path, text)?;
            let created = self.tx.uncommitted.lock().is_created(key);
            self.tx.with_cached_view(key, |v| v.store_restore_point());
            if !quiet {
                let verb = if created { "created" } else { "updated" };
                self.tx
                    .session
                    .write_out(&format!("Commit: file \"{}\" is {}.\n", info.path, verb));
            }
            debug!(path = %info.path, "commit");
        }

        self.tx.uncommitted.lock().clear();
        Ok(())
    }

    pub fn rollback(&mut self) -> QueryResult<()> {
        let keys = self.tx.uncommitted.lock().keys();
        if keys.is_empty() {
            return Ok(());
        }

        self.scopes.restore_temp_views(&keys);

        let quiet = self.tx.flags().quiet;
        for key in &keys {
            if self.tx.uncommitted.lock().is_created(key) {
                self.tx.dispose_cached_view(key)?;
                continue;
            }
            let restored = self.tx.with_cached_view(key, |v| {
                v.restore();
                v.file_info.as_ref().map(|i| i.path.clone())
            });
            if let Some(Some(path)) = restored {
                if !quiet {
                    self.tx
                        .session
                        .write_out(&format!("Rollback: file \"{}\" is restored.\n", path));
                }
                debug!(path = %path, "rollback");
            }
        }

        self.tx.uncommitted.lock().clear();
        Ok(())
    }
}

/// printf-style template expansion: `%s` consumes the next value, `%%`
/// prints a literal percent.
fn format_template(template: &str, values: &[Primary]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut values = values.iter();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('s') => {
                let rendered = values
                    .next()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "%s".to_string());
                out.push_str(&rendered);
            }
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

fn check_duplicate_columns(columns: &[String], pos: &Pos) -> QueryResult<()> {
    for (i, column) in columns.iter().enumerate() {
        if columns[..i].iter().any(|c| c.eq_ignore_ascii_case(column)) {
            return Err(QueryError::DuplicateFieldName {
                pos: pos.clone(),
                field: column.clone(),
            });
        }
    }
    Ok(())
}

fn base_directory(repository: &str) -> PathBuf {
    if repository.is_empty() {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    } else {
        PathBuf::from(repository)
    }
}

fn format_for_path(path: &Path, fallback: Format) -> Format {
    match path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .as_deref()
    {
        Some("csv") => Format::Csv,
        Some("tsv") => Format::Tsv,
        Some("json") => Format::Json,
        Some("ltsv") => Format::Ltsv,
        _ => fallback,
    }
}

/// Evaluates a WHERE-style condition per record, in parallel when pure.
/// `None` keeps every record.
fn filter_records(
    ev: &Evaluator,
    view: &Arc<View>,
    condition: Option<&Expression>,
) -> QueryResult<Vec<bool>> {
    let Some(condition) = condition else {
        return Ok(vec![true; view.record_len()]);
    };
    let slots: Vec<Mutex<bool>> = (0..view.record_len()).map(|_| Mutex::new(false)).collect();
    ev.evaluate_for_records(view, &[condition], |child, i| {
        let value = child.evaluate(condition)?;
        *slots[i].lock() = value.as_ternary() == Ternary::True;
        Ok(())
    })?;
    Ok(slots.into_iter().map(|s| s.into_inner()).collect())
}

// ---- SELECT pipeline ----

/// Per-query context: the evaluator whose scopes carry this query's node
/// frame (inline tables and aliases).
struct SelectContext<'a> {
    ev: Evaluator<'a>,
}

impl<'a> SelectContext<'a> {
    fn new(parent: &Evaluator<'a>) -> Self {
        let mut ev = parent.child();
        ev.scopes.push_node();
        Self { ev }
    }
}

/// Entry point for subqueries and top-level SELECT statements: runs the
/// query in a child node scope and returns the materialized view.
pub fn select_as_subquery(parent: &Evaluator, query: &SelectQuery) -> QueryResult<View> {
    let mut context = SelectContext::new(parent);
    select_query(&mut context, query)
}

fn select_query(context: &mut SelectContext, query: &SelectQuery) -> QueryResult<View> {
    if let Some(with) = &query.with {
        load_inline_tables(context, with)?;
    }

    // A plain select projects here; set operations project per operand, so
    // the combined view is already in its final column shape.
    let (mut view, projection) = match &query.entity {
        SelectEntity::Select(clauses) => {
            let mut view = select_clauses(context, clauses)?;
            let projection = build_projection(context, &mut view, clauses)?;
            (view, Some(projection))
        }
        set_operation => (select_entity(context, set_operation)?, None),
    };

    let order_keys = match &query.order_by {
        Some(order_by) => Some(apply_order_by(context, &mut view, order_by)?),
        None => None,
    };

    apply_offset_limit(context, &mut view, query, order_keys.as_deref())?;

    Ok(match projection {
        Some(projection) => fix_view(view, &projection),
        None => view,
    })
}

fn load_inline_tables(context: &mut SelectContext, with: &WithClause) -> QueryResult<()> {
    for def in &with.tables {
        let view = if def.recursive {
            load_recursive_table(context, def)?
        } else {
            let mut inner = SelectContext::new(&context.ev);
            let mut view = select_query(&mut inner, &def.query)?;
            rename_columns(&mut view, def.columns.as_deref(), &def.pos)?;
            view
        };
        let mut view = view;
        view.header.update_view_name(&def.name.literal);
        context.ev.scopes.set_inline_table(&def.name.literal, view);
    }
    Ok(())
}

fn load_recursive_table(context: &mut SelectContext, def: &InlineTableDef) -> QueryResult<View> {
    let SelectEntity::SetOperation {
        lhs,
        operator: SetOperator::Union,
        all,
        rhs,
        ..
    } = &def.query.entity
    else {
        // A RECURSIVE clause without a union is just an inline table.
        let mut inner = SelectContext::new(&context.ev);
        let mut view = select_query(&mut inner, &def.query)?;
        rename_columns(&mut view, def.columns.as_deref(), &def.pos)?;
        return Ok(view);
    };

    let mut anchor = {
        let mut inner = SelectContext::new(&context.ev);
        select_set_operand(&mut inner, lhs)?
    };
    rename_columns(&mut anchor, def.columns.as_deref(), &def.pos)?;
    anchor.header.update_view_name(&def.name.literal);

    let mut seen = hashbrown::HashSet::new();
    if !*all {
        let keys = record_keys(&context.ev, &anchor);
        let mut deduped = Vec::new();
        for (record, key) in anchor.record_set.drain(..).zip(keys.into_iter()) {
            if seen.insert(key) {
                deduped.push(record);
            }
        }
        anchor.record_set = deduped;
    }

    let mut total = anchor.clone();
    let mut current = anchor;

    loop {
        if current.record_len() == 0 {
            break;
        }
        if RECURSION_ROW_LIMIT < total.record_len() {
            return Err(QueryError::RecursionExceededLimit {
                pos: def.pos.clone(),
            });
        }

        let step = {
            let mut inner = SelectContext::new(&context.ev);
            inner
                .ev
                .scopes
                .set_inline_table(&def.name.literal, current.clone());
            select_set_operand(&mut inner, rhs)?
        };
        if step.field_len() != total.field_len() {
            return Err(QueryError::FieldLengthNotMatch {
                pos: def.pos.clone(),
            });
        }

        let mut fresh = Vec::new();
        let keys = record_keys(&context.ev, &step);
        for (record, key) in step.record_set.into_iter().zip(keys.into_iter()) {
            if *all || seen.insert(key) {
                fresh.push(record);
            }
        }
        if fresh.is_empty() {
            break;
        }

        total.record_set.extend(fresh.iter().cloned());
        current = View::new(total.header.clone(), fresh);
    }

    Ok(total)
}

fn rename_columns(
    view: &mut View,
    columns: Option<&[Identifier]>,
    pos: &Pos,
) -> QueryResult<()> {
    if let Some(columns) = columns {
        if columns.len() != view.field_len() {
            return Err(QueryError::FieldLengthNotMatch { pos: pos.clone() });
        }
        for (field, name) in view.header.fields.iter_mut().zip(columns.iter()) {
            field.column = name.literal.clone();
        }
    }
    Ok(())
}

/// Serialized whole-record keys, used by set operations and recursion.
fn record_keys(ev: &Evaluator, view: &View) -> Vec<Vec<u8>> {
    let (formats, tz) = {
        let flags = ev.tx.flags();
        (flags.datetime_format.clone(), flags.timezone.clone())
    };
    view.record_set
        .iter()
        .map(|record| {
            let values: Vec<SortValue> = record
                .iter()
                .map(|cell| SortValue::new(cell.value(), &formats, &tz))
                .collect();
            SortValues::new(values).serialize()
        })
        .collect()
}

fn select_entity(context: &mut SelectContext, entity: &SelectEntity) -> QueryResult<View> {
    match entity {
        SelectEntity::Select(clauses) => select_clauses(context, clauses),
        SelectEntity::SetOperation {
            lhs,
            operator,
            all,
            rhs,
            pos,
        } => {
            let lhs_view = select_set_operand(context, lhs)?;
            let rhs_view = select_set_operand(context, rhs)?;
            if lhs_view.field_len() != rhs_view.field_len() {
                return Err(QueryError::FieldLengthNotMatch { pos: pos.clone() });
            }

            let lhs_keys = record_keys(&context.ev, &lhs_view);
            let rhs_keys = record_keys(&context.ev, &rhs_view);

            let mut result = View::new(lhs_view.header.clone(), Vec::new());
            match operator {
                SetOperator::Union => {
                    let mut seen = hashbrown::HashSet::new();
                    for (record, key) in lhs_view
                        .record_set
                        .into_iter()
                        .zip(lhs_keys.into_iter())
                        .chain(rhs_view.record_set.into_iter().zip(rhs_keys.into_iter()))
                    {
                        if *all || seen.insert(key) {
                            result.record_set.push(record);
                        }
                    }
                }
                SetOperator::Intersect => {
                    let rhs_set: hashbrown::HashSet<Vec<u8>> = rhs_keys.into_iter().collect();
                    let mut seen = hashbrown::HashSet::new();
                    for (record, key) in
                        lhs_view.record_set.into_iter().zip(lhs_keys.into_iter())
                    {
                        if rhs_set.contains(&key) && (*all || seen.insert(key)) {
                            result.record_set.push(record);
                        }
                    }
                }
                SetOperator::Except => {
                    let rhs_set: hashbrown::HashSet<Vec<u8>> = rhs_keys.into_iter().collect();
                    let mut seen = hashbrown::HashSet::new();
                    for (record, key) in
                        lhs_view.record_set.into_iter().zip(lhs_keys.into_iter())
                    {
                        if !rhs_set.contains(&key) && (*all || seen.insert(key)) {
                            result.record_set.push(record);
                        }
                    }
                }
            }
            Ok(result)
        }
    }
}

/// A set-operation operand is a complete sub-select: its own projection
/// applies before records are combined.
fn select_set_operand(context: &mut SelectContext, entity: &SelectEntity) -> QueryResult<View> {
    match entity {
        SelectEntity::Select(clauses) => {
            let mut view = select_clauses(context, clauses)?;
            let projection = build_projection(context, &mut view, clauses)?;
            Ok(fix_view(view, &projection))
        }
        SelectEntity::SetOperation { .. } => select_entity(context, entity),
    }
}

fn select_clauses(context: &mut SelectContext, clauses: &SelectClauses) -> QueryResult<View> {
    // FROM
    let mut view = match &clauses.from {
        None => dual_view(),
        Some(from) => {
            let mut tables = from.tables.iter();
            let first = tables.next().ok_or_else(|| QueryError::syntax(
                from.pos.clone(),
                "syntax error: unexpected termination".to_string(),
            ))?;
            let mut view = load_table_object(context, first)?;
            for table in tables {
                let rhs = load_table_object(context, table)?;
                view = cross_join(view, rhs);
            }
            view
        }
    };

    // WHERE
    if let Some(condition) = &clauses.where_clause {
        let shared = Arc::new(view);
        let matches = filter_records(&context.ev, &shared, Some(condition))?;
        view = Arc::try_unwrap(shared).unwrap_or_else(|arc| (*arc).clone());
        let mut kept = Vec::new();
        for (i, record) in view.record_set.drain(..).enumerate() {
            if matches[i] {
                kept.push(record);
            }
        }
        view.record_set = kept;
    }

    // GROUP BY
    if !clauses.group_by.is_empty() {
        let mut key_indices = Vec::new();
        for key in &clauses.group_by {
            if matches!(
                key,
                Expression::FieldReference { .. } | Expression::ColumnNumber { .. }
            ) {
                if let Ok(idx) = view.field_index(key) {
                    key_indices.push(idx);
                }
            }
        }

        let (formats, tz) = {
            let flags = context.ev.tx.flags();
            (flags.datetime_format.clone(), flags.timezone.clone())
        };
        let shared = Arc::new(view);
        let exprs: Vec<&Expression> = clauses.group_by.iter().collect();
        let slots: Vec<Mutex<Vec<u8>>> = (0..shared.record_len())
            .map(|_| Mutex::new(Vec::new()))
            .collect();
        context.ev.evaluate_for_records(&shared, &exprs, |child, i| {
            let mut values = Vec::with_capacity(exprs.len());
            for key in &clauses.group_by {
                let value = child.evaluate(key)?;
                values.push(SortValue::new(&value, &formats, &tz));
            }
            *slots[i].lock() = SortValues::new(values).serialize();
            Ok(())
        })?;
        let keys: Vec<Vec<u8>> = slots.into_iter().map(|s| s.into_inner()).collect();

        view = Arc::try_unwrap(shared).unwrap_or_else(|arc| (*arc).clone());
        view.group(Some(&keys));
        view.mark_group_keys(&key_indices);
    } else if needs_implicit_grouping(&context.ev.scopes, clauses) {
        view.group(None);
    }

    // HAVING
    if let Some(condition) = &clauses.having {
        let shared = Arc::new(view);
        let matches = filter_records(&context.ev, &shared, Some(condition))?;
        view = Arc::try_unwrap(shared).unwrap_or_else(|arc| (*arc).clone());
        let mut kept = Vec::new();
        for (i, record) in view.record_set.drain(..).enumerate() {
            if matches[i] {
                kept.push(record);
            }
        }
        view.record_set = kept;
    }

    Ok(view)
}

fn needs_implicit_grouping(scopes: &Scopes, clauses: &SelectClauses) -> bool {
    clauses
        .fields
        .iter()
        .any(|f| contains_aggregate(&f.expr, scopes))
        || clauses
            .having
            .as_ref()
            .map(|h| contains_aggregate(h, scopes))
            .unwrap_or(false)
}

fn contains_aggregate(expr: &Expression, scopes: &Scopes) -> bool {
    match expr {
        Expression::AggregateFunction { .. } | Expression::ListFunction { .. } => true,
        Expression::Function { name, args, .. } => {
            scopes
                .function(name)
                .map(|f| f.is_aggregate)
                .unwrap_or(false)
                || args.iter().any(|a| contains_aggregate(a, scopes))
        }
        Expression::Parentheses(e)
        | Expression::UnaryArithmetic { operand: e, .. }
        | Expression::UnaryLogic { operand: e, .. } => contains_aggregate(e, scopes),
        Expression::Arithmetic { lhs, rhs, .. }
        | Expression::Comparison { lhs, rhs, .. }
        | Expression::Logic { lhs, rhs, .. }
        | Expression::Is { lhs, rhs, .. } => {
            contains_aggregate(lhs, scopes) || contains_aggregate(rhs, scopes)
        }
        Expression::Between { lhs, low, high, .. } => {
            contains_aggregate(lhs, scopes)
                || contains_aggregate(low, scopes)
                || contains_aggregate(high, scopes)
        }
        Expression::Like { lhs, pattern, .. } => {
            contains_aggregate(lhs, scopes) || contains_aggregate(pattern, scopes)
        }
        Expression::Concat { items, .. } => items.iter().any(|i| contains_aggregate(i, scopes)),
        Expression::Case {
            value,
            when,
            else_result,
            ..
        } => {
            value
                .as_deref()
                .map(|v| contains_aggregate(v, scopes))
                .unwrap_or(false)
                || when.iter().any(|w| {
                    contains_aggregate(&w.condition, scopes)
                        || contains_aggregate(&w.result, scopes)
                })
                || else_result
                    .as_deref()
                    .map(|e| contains_aggregate(e, scopes))
                    .unwrap_or(false)
        }
        _ => false,
    }
}

fn dual_view() -> View {
    View::new(Header::default(), vec![Record::new()])
}

// ---- FROM loading ----

fn load_table_object(context: &mut SelectContext, object: &TableObject) -> QueryResult<View> {
    match &object.expr {
        TableExpr::Dual(_) => Ok(dual_view()),
        TableExpr::Identifier(ident) => {
            let label = object
                .alias
                .as_ref()
                .map(|a| a.literal.clone());

            if let Some(mut view) = context.ev.scopes.inline_table(&ident.literal) {
                let label = label.unwrap_or_else(|| ident.literal.clone());
                view.header.update_view_name(&label);
                context
                    .ev
                    .scopes
                    .add_alias(&Identifier::new(label, ident.pos.clone()), &ident.literal)?;
                return Ok(view);
            }

            if context.ev.scopes.temp_view_exists(&ident.literal) {
                let mut view = context.ev.scopes.temp_view(ident)?;
                let label = label.unwrap_or_else(|| ident.literal.clone());
                view.header.update_view_name(&label);
                context
                    .ev
                    .scopes
                    .add_alias(&Identifier::new(label, ident.pos.clone()), &ident.literal)?;
                return Ok(view);
            }

            load_file_table(context, ident, label)
        }
        TableExpr::Subquery(query) => {
            let mut inner = SelectContext::new(&context.ev);
            let mut view = select_query(&mut inner, query)?;
            if let Some(alias) = &object.alias {
                view.header.update_view_name(&alias.literal);
                context.ev.scopes.add_alias(alias, "")?;
            }
            Ok(view)
        }
        TableExpr::Join(join) => {
            let lhs = load_table_object(context, &join.lhs)?;
            let rhs = load_table_object(context, &join.rhs)?;
            join_views(context, lhs, rhs, join)
        }
    }
}

fn resolve_file_path(base: &Path, literal: &str) -> Option<PathBuf> {
    let raw = PathBuf::from(literal);
    let candidates: Vec<PathBuf> = if raw.extension().is_some() {
        vec![raw.clone()]
    } else {
        ["csv", "tsv", "json", "ltsv", "txt"]
            .iter()
            .map(|ext| raw.with_extension(ext))
            .collect()
    };

    for candidate in candidates {
        let path = if candidate.is_absolute() {
            candidate
        } else {
            base.join(candidate)
        };
        if path.is_file() {
            return Some(path.canonicalize().unwrap_or(path));
        }
    }
    None
}

fn load_file_table(
    context: &mut SelectContext,
    ident: &Identifier,
    label: Option<String>,
) -> QueryResult<View> {
    let flags = context.ev.tx.flags();
    let base = base_directory(&flags.repository);
    let import_format = flags.import_format;
    drop(flags);

    let path = resolve_file_path(&base, &ident.literal).ok_or_else(|| {
        QueryError::FileNotExist {
            pos: ident.pos.clone(),
            path: ident.literal.clone(),
        }
    })?;
    let path_str = path.to_string_lossy().to_string();
    let key = path_str.to_uppercase();

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| ident.literal.clone());
    let label = label.unwrap_or(stem);

    let mut view = match context.ev.tx.cached_view(&key) {
        Some(view) => view,
        None => {
            let handle = context.ev.tx.lock_file(&path_str)?;
            let text = std::fs::read_to_string(&path)?;
            let format = format_for_path(&path, import_format);
            let flags = context.ev.tx.flags();
            let options = ReadOptions::from_flags(&flags, format);
            drop(flags);
            let (columns, rows, encoding) = codec::read_text(&text, &options)?;

            let mut info = FileInfo::new(path_str.clone(), format);
            info.delimiter = options.delimiter;
            info.delimiter_positions = options.delimiter_positions.clone();
            info.json_query = options.json_query.clone();
            info.encoding = encoding;
            info.no_header = options.no_header;
            info.handle = Some(handle);

            let record_set = rows
                .into_iter()
                .map(|row| row.into_iter().map(Cell::new).collect())
                .collect();
            let mut view = View::new(Header::from_table(&label, &columns), record_set);
            view.file_info = Some(info);
            view.store_restore_point();
            context.ev.tx.cache_view(view.clone());
            debug!(path = %path_str, "table loaded");
            view
        }
    };

    view.header.update_view_name(&label);
    context
        .ev
        .scopes
        .add_alias(&Identifier::new(label, ident.pos.clone()), &path_str)?;
    Ok(view)
}

// ---- joins ----

fn merge_records(lhs: &Record, rhs: &Record) -> Record {
    let mut merged = Vec::with_capacity(lhs.len() + rhs.len());
    merged.extend(lhs.iter().cloned());
    merged.extend(rhs.iter().cloned());
    merged
}

fn null_record(len: usize) -> Record {
    (0..len).map(|_| Cell::new(Primary::Null)).collect()
}

fn cross_join(lhs: View, rhs: View) -> View {
    let header = Header::merge(lhs.header, rhs.header);
    let mut record_set = Vec::with_capacity(lhs.record_set.len() * rhs.record_set.len().max(1));
    for l in &lhs.record_set {
        for r in &rhs.record_set {
            record_set.push(merge_records(l, r));
        }
    }
    View::new(header, record_set)
}

/// Common-column pairs for NATURAL and USING joins: (lhs index, rhs index).
fn join_key_pairs(
    lhs: &View,
    rhs: &View,
    join: &Join,
) -> QueryResult<Vec<(usize, usize)>> {
    match &join.condition {
        Some(JoinCondition::Using(columns)) => {
            let mut pairs = Vec::with_capacity(columns.len());
            for column in columns {
                let li = lhs.header.search_index(None, column)?;
                let ri = rhs.header.search_index(None, column)?;
                pairs.push((li, ri));
            }
            Ok(pairs)
        }
        _ if join.natural => {
            let mut pairs = Vec::new();
            for (li, lf) in lhs.header.fields.iter().enumerate() {
                for (ri, rf) in rhs.header.fields.iter().enumerate() {
                    if lf.column.eq_ignore_ascii_case(&rf.column) {
                        pairs.push((li, ri));
                    }
                }
            }
            Ok(pairs)
        }
        _ => Ok(Vec::new()),
    }
}

fn join_views(
    context: &mut SelectContext,
    lhs: View,
    rhs: View,
    join: &Join,
) -> QueryResult<View> {
    if join.join_type == JoinType::Cross {
        return Ok(cross_join(lhs, rhs));
    }

    let key_pairs = join_key_pairs(&lhs, &rhs, join)?;
    let (formats, tz) = {
        let flags = context.ev.tx.flags();
        (flags.datetime_format.clone(), flags.timezone.clone())
    };

    let lhs_len = lhs.header.len();
    let rhs_len = rhs.header.len();
    let merged_header = Header::merge(lhs.header.clone(), rhs.header.clone());

    // Materialize candidate pairs, then decide matches per pair.
    let mut pairs: Vec<(usize, usize)> = Vec::new();
    for li in 0..lhs.record_set.len() {
        for ri in 0..rhs.record_set.len() {
            pairs.push((li, ri));
        }
    }

    let matched: Vec<bool> = if let Some(JoinCondition::On(condition)) = &join.condition {
        let record_set: Vec<Record> = pairs
            .iter()
            .map(|&(li, ri)| merge_records(&lhs.record_set[li], &rhs.record_set[ri]))
            .collect();
        let cross = Arc::new(View::new(merged_header.clone(), record_set));
        filter_records(&context.ev, &cross, Some(condition))?
    } else if !key_pairs.is_empty() {
        pairs
            .iter()
            .map(|&(li, ri)| {
                key_pairs.iter().all(|&(lk, rk)| {
                    crate::value::equal(
                        lhs.record_set[li][lk].value(),
                        rhs.record_set[ri][rk].value(),
                        &formats,
                        &tz,
                    ) == Ternary::True
                })
            })
            .collect()
    } else {
        // An inner join without a condition degenerates to a cross join.
        vec![true; pairs.len()]
    };

    let mut lhs_matched = vec![false; lhs.record_set.len()];
    let mut rhs_matched = vec![false; rhs.record_set.len()];
    let mut record_set = Vec::new();
    for (&(li, ri), &m) in pairs.iter().zip(matched.iter()) {
        if m {
            lhs_matched[li] = true;
            rhs_matched[ri] = true;
            record_set.push(merge_records(&lhs.record_set[li], &rhs.record_set[ri]));
        }
    }

    match join.join_type {
        JoinType::LeftOuter | JoinType::FullOuter => {
            for (li, &m) in lhs_matched.iter().enumerate() {
                if !m {
                    record_set.push(merge_records(&lhs.record_set[li], &null_record(rhs_len)));
                }
            }
        }
        _ => {}
    }
    match join.join_type {
        JoinType::RightOuter | JoinType::FullOuter => {
            for (ri, &m) in rhs_matched.iter().enumerate() {
                if !m {
                    record_set.push(merge_records(&null_record(lhs_len), &rhs.record_set[ri]));
                }
            }
        }
        _ => {}
    }

    let mut view = View::new(merged_header, record_set);

    // NATURAL and USING joins collapse the key columns to the left side.
    if !key_pairs.is_empty() {
        let mut drop_indices: Vec<usize> =
            key_pairs.iter().map(|&(_, ri)| lhs_len + ri).collect();
        drop_indices.sort_unstable();
        for &idx in drop_indices.iter().rev() {
            view.header.fields.remove(idx);
            for record in &mut view.record_set {
                record.remove(idx);
            }
        }
    }

    Ok(view)
}

// ---- projection ----

enum ProjectionItem {
    Column(usize),
    Computed(usize),
}

/// The projected column indices into the working view, with their output
/// labels.
struct Projection {
    indices: Vec<usize>,
    labels: Vec<String>,
    distinct: bool,
}

fn field_label(field: &QueryField) -> String {
    if let Some(alias) = &field.alias {
        return alias.literal.clone();
    }
    match &field.expr {
        Expression::FieldReference { column, .. } => column.literal.clone(),
        other => other.to_string(),
    }
}

/// Computes select fields as columns appended to the working view and
/// returns the projection map. Analytic subtrees are materialized first.
fn build_projection(
    context: &mut SelectContext,
    view: &mut View,
    clauses: &SelectClauses,
) -> QueryResult<Projection> {
    // Expand `*` against the current header before any columns are added.
    let mut items: Vec<ProjectionItem> = Vec::new();
    let mut labels: Vec<String> = Vec::new();
    let mut computed: Vec<Expression> = Vec::new();
    let mut computed_aliases: Vec<Option<String>> = Vec::new();

    for field in &clauses.fields {
        match &field.expr {
            Expression::AllColumns { pos } => {
                if view.header.is_empty() {
                    return Err(QueryError::FieldNotExist {
                        pos: pos.clone(),
                        field: "*".to_string(),
                    });
                }
                for (i, header_field) in view.header.fields.iter().enumerate() {
                    if view.is_grouped
                        && header_field.is_from_table
                        && !header_field.is_group_key
                    {
                        return Err(QueryError::FieldIsNotGroupKey {
                            pos: pos.clone(),
                            field: header_field.column.clone(),
                        });
                    }
                    items.push(ProjectionItem::Column(i));
                    labels.push(header_field.column.clone());
                }
            }
            _ => {
                labels.push(field_label(field));
                items.push(ProjectionItem::Computed(computed.len()));
                computed.push(field.expr.clone());
                computed_aliases.push(field.alias.as_ref().map(|a| a.literal.clone()));
            }
        }
    }

    // Materialize analytic functions into columns; the expressions then
    // reference them like any other field.
    analytic::replace_analytic_functions(&context.ev, view, &mut computed)?;

    // Evaluate every computed expression per record and append columns.
    let base_len = view.header.len();
    if !computed.is_empty() {
        let shared = Arc::new(std::mem::take(view));
        let exprs: Vec<&Expression> = computed.iter().collect();
        let slots: Vec<Mutex<Vec<Primary>>> = (0..shared.record_len())
            .map(|_| Mutex::new(Vec::new()))
            .collect();
        context.ev.evaluate_for_records(&shared, &exprs, |child, i| {
            let mut values = Vec::with_capacity(exprs.len());
            for expr in &computed {
                values.push(child.evaluate(expr)?);
            }
            *slots[i].lock() = values;
            Ok(())
        })?;
        let mut computed_rows: Vec<Vec<Primary>> =
            slots.into_iter().map(|s| s.into_inner()).collect();

        *view = Arc::try_unwrap(shared).unwrap_or_else(|arc| (*arc).clone());
        for (n, expr) in computed.iter().enumerate() {
            let mut aliases = Vec::new();
            if let Some(alias) = &computed_aliases.get(n).cloned().flatten() {
                aliases.push(alias.clone());
            }
            view.header.fields.push(HeaderField {
                column: expr.to_string(),
                aliases,
                ..Default::default()
            });
        }
        for (record, mut values) in view.record_set.iter_mut().zip(computed_rows.drain(..)) {
            for value in values.drain(..) {
                record.push(Cell::new(value));
            }
        }
    }

    // Rebase computed items onto their appended column indices.
    let indices = items
        .into_iter()
        .map(|item| match item {
            ProjectionItem::Column(index) => index,
            ProjectionItem::Computed(index) => base_len + index,
        })
        .collect::<Vec<_>>();

    let projection = Projection {
        indices,
        labels,
        distinct: clauses.distinct,
    };

    if projection.distinct {
        apply_distinct(context, view, &projection);
    }

    Ok(projection)
}

fn apply_distinct(context: &SelectContext, view: &mut View, projection: &Projection) {
    let (formats, tz) = {
        let flags = context.ev.tx.flags();
        (flags.datetime_format.clone(), flags.timezone.clone())
    };
    let indices = &projection.indices;
    let mut seen = hashbrown::HashSet::new();
    let mut kept = Vec::new();
    for record in view.record_set.drain(..) {
        let key = SortValues::new(
            indices
                .iter()
                .map(|&i| SortValue::new(record[i].value(), &formats, &tz))
                .collect(),
        )
        .serialize();
        if seen.insert(key) {
            kept.push(record);
        }
    }
    view.record_set = kept;
}

/// Sorts the working view; returns the per-record serialized order keys in
/// final record order, for LIMIT WITH TIES.
fn apply_order_by(
    context: &mut SelectContext,
    view: &mut View,
    order_by: &OrderByClause,
) -> QueryResult<Vec<Vec<u8>>> {
    let (formats, tz) = {
        let flags = context.ev.tx.flags();
        (flags.datetime_format.clone(), flags.timezone.clone())
    };

    let directions: Vec<OrderDirection> = order_by
        .items
        .iter()
        .map(|i| i.direction.unwrap_or(OrderDirection::Ascending))
        .collect();
    let null_positions: Vec<NullPosition> = order_by
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

    let shared = Arc::new(std::mem::take(view));
    let exprs: Vec<&Expression> = order_by.items.iter().map(|i| &i.expr).collect();
    let slots: Vec<Mutex<SortValues>> = (0..shared.record_len())
        .map(|_| Mutex::new(SortValues::default()))
        .collect();
    context.ev.evaluate_for_records(&shared, &exprs, |child, i| {
        let mut values = Vec::with_capacity(order_by.items.len());
        for item in &order_by.items {
            let value = child.evaluate(&item.expr)?;
            values.push(SortValue::new(&value, &formats, &tz));
        }
        *slots[i].lock() = SortValues::new(values);
        Ok(())
    })?;
    let keys: Vec<SortValues> = slots.into_iter().map(|s| s.into_inner()).collect();

    *view = Arc::try_unwrap(shared).unwrap_or_else(|arc| (*arc).clone());
    let permutation = view.order_by_values(&keys, &directions, &null_positions);
    Ok(permutation.iter().map(|&i| keys[i].serialize()).collect())
}

fn apply_offset_limit(
    context: &mut SelectContext,
    view: &mut View,
    query: &SelectQuery,
    order_keys: Option<&[Vec<u8>]>,
) -> QueryResult<()> {
    let mut start = 0usize;
    if let Some(offset) = &query.offset {
        let value = {
            let mut child = context.ev.child();
            child.evaluate(&offset.value)?
        };
        let n = value
            .as_integer()
            .ok_or_else(|| QueryError::InvalidValueExpression {
                pos: offset.pos.clone(),
                expr: offset.value.to_string(),
            })?;
        start = n.max(0) as usize;
    }
    if 0 < start {
        if start < view.record_set.len() {
            view.record_set.drain(..start);
        } else {
            view.record_set.clear();
        }
    }

    if let Some(limit) = &query.limit {
        let value = {
            let mut child = context.ev.child();
            child.evaluate(&limit.value)?
        };
        let n = value
            .as_integer()
            .or_else(|| {
                if limit.percent {
                    value.as_float().map(|f| f as i64)
                } else {
                    None
                }
            })
            .ok_or_else(|| QueryError::InvalidValueExpression {
                pos: limit.pos.clone(),
                expr: limit.value.to_string(),
            })?;

        let mut count = if limit.percent {
            let pct = value.as_float().unwrap_or(n as f64).clamp(0.0, 100.0);
            ((view.record_set.len() as f64) * pct / 100.0).ceil() as usize
        } else {
            n.max(0) as usize
        };

        if limit.with_ties {
            if let Some(keys) = order_keys {
                // Keys are aligned pre-offset; re-slice to the window.
                let keys = &keys[start.min(keys.len())..];
                while count < view.record_set.len()
                    && count != 0
                    && keys.get(count) == keys.get(count - 1)
                {
                    count += 1;
                }
            }
        }

        view.record_set.truncate(count);
    }

    Ok(())
}

/// Final projection: picks the projected columns out of the working view
/// and names them by their labels.
fn fix_view(view: View, projection: &Projection) -> View {
    let indices = &projection.indices;
    let fields: Vec<HeaderField> = projection
        .labels
        .iter()
        .enumerate()
        .map(|(i, label)| HeaderField {
            column: label.clone(),
            number: i + 1,
            is_from_table: true,
            ..Default::default()
        })
        .collect();

    let record_set = view
        .record_set
        .into_iter()
        .map(|record| {
            indices
                .iter()
                .map(|&i| Cell::new(record[i].value().clone()))
                .collect()
        })
        .collect();

    View::new(Header { fields }, record_set)
}

// ---- user-defined functions ----

fn bind_parameters(
    ev: &Evaluator,
    scopes: &Scopes,
    udf: &UserDefinedFunction,
    args: &[Primary],
) -> QueryResult<()> {
    for (i, param) in udf.parameters.iter().enumerate() {
        let value = if i < args.len() {
            args[i].clone()
        } else {
            match &param.value {
                Some(default) => {
                    let mut child = ev.child();
                    child.scopes = scopes.shared();
                    child.evaluate(default)?
                }
                None => Primary::Null,
            }
        };
        scopes.declare_variable(&param.name, value, &param.pos)?;
    }
    Ok(())
}

fn run_function_body(
    ev: &Evaluator,
    scopes: Scopes,
    body: &[Statement],
) -> QueryResult<Primary> {
    let mut processor = Processor {
        tx: ev.tx,
        scopes,
        cancel: ev.cancel.clone(),
        replace_values: ev.replace_values.clone(),
    };
    match processor.execute(body)? {
        Flow::Return(value) => Ok(value),
        Flow::Exit(code) => Err(QueryError::Exit { code }),
        _ => Ok(Primary::Null),
    }
}

/// Runs a user-defined scalar function in its own block scope.
pub fn execute_scalar_function(
    ev: &Evaluator,
    udf: &UserDefinedFunction,
    args: Vec<Primary>,
    _pos: &Pos,
) -> QueryResult<Primary> {
    let mut scopes = ev.scopes.shared();
    scopes.push_block();
    bind_parameters(ev, &scopes, udf, &args)?;
    run_function_body(ev, scopes, &udf.body)
}

/// Runs a user-defined aggregate: the group values are exposed through the
/// declared pseudo-cursor, which the body fetches from.
pub fn execute_aggregate_function(
    ev: &Evaluator,
    udf: &UserDefinedFunction,
    values: Vec<Primary>,
    args: Vec<Primary>,
    pos: &Pos,
) -> QueryResult<Primary> {
    let mut scopes = ev.scopes.shared();
    scopes.push_block();
    bind_parameters(ev, &scopes, udf, &args)?;

    if let Some(cursor_name) = &udf.cursor {
        let list_view = View::new(
            Header::from_columns(&["LIST".to_string()]),
            values
                .into_iter()
                .map(|v| vec![Cell::new(v)])
                .collect(),
        );
        let mut cursor = Cursor::new(cursor_name.clone(), empty_select_query(pos));
        cursor.open(list_view, pos)?;
        scopes.declare_cursor(cursor, pos)?;
    }

    run_function_body(ev, scopes, &udf.body)
}

// ---- program runner ----

/// Parses and executes a program, commits on normal completion, rolls
/// back on EXIT or error, and prints statistics when STATS is on. Returns
/// the process exit code.
pub fn run_program(
    tx: &Transaction,
    source: &str,
    source_file: Option<String>,
) -> QueryResult<i32> {
    let started = std::time::Instant::now();

    let statements = {
        let flags = tx.flags();
        parse(
            source,
            source_file,
            &flags.datetime_format,
            &flags.timezone,
            false,
        )?
    };

    let mut processor = Processor::new(tx);
    let code = match processor.execute(&statements) {
        Ok(Flow::Exit(code)) | Err(QueryError::Exit { code }) => {
            processor.rollback()?;
            code
        }
        Ok(_) => {
            processor.commit(&Pos::default())?;
            0
        }
        Err(err) => {
            let _ = processor.rollback();
            let _ = tx.release_all_views_with_errors();
            return Err(err);
        }
    };
    tx.release_all_views()?;

    if tx.flags().stats {
        let elapsed = started.elapsed();
        let counts = *tx.counts.lock();
        tx.session.write_out(&format!(
            "Time: {:.6} seconds\nSelectedCount: {} InsertedCount: {} UpdatedCount: {} DeletedCount: {}\n",
            elapsed.as_secs_f64(),
            counts.selected,
            counts.inserted,
            counts.updated,
            counts.deleted,
        ));
    }

    Ok(code)
}

fn empty_select_query(pos: &Pos) -> SelectQuery {
    SelectQuery {
        with: None,
        entity: SelectEntity::Select(SelectClauses {
            distinct: false,
            fields: Vec::new(),
            from: None,
            where_clause: None,
            group_by: Vec::new(),
            having: None,
            pos: pos.clone(),
        }),
        order_by: None,
        limit: None,
        offset: None,
        pos: pos.clone(),
    }
}
