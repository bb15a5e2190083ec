//! # Scope Stack
//!
//! Name resolution runs over stacked maps, innermost frame first. Frames
//! are shared by reference while the stack itself is value-semantic: a
//! clone of [`Scopes`] sees the same bindings (a variable substitution in a
//! child evaluation is visible to the parent) but can push frames of its
//! own without affecting anyone else. Parallel workers clone the stack;
//! the purity gate guarantees they never write through it.
//!
//! Two frame families with different lifetimes:
//!
//! - **Block frames** hold variables, cursors, user-defined functions and
//!   temporary views. A block is pushed for function bodies; names
//!   declared inside die with the block.
//! - **Node frames** hold inline tables (WITH clauses) and table aliases,
//!   pushed per query node so a subquery sees the outer query's inline
//!   tables while its aliases stay its own.
//!
//! Writes go to the innermost frame. Substitution and replacement walk
//! outward to the first frame that already binds the name; resolution
//! walks the same way. All keys are upper-cased.

use crate::error::{QueryError, QueryResult};
use crate::query::cursor::Cursor;
use crate::query::view::View;
use crate::sql::ast::{Identifier, SelectQuery, Statement, VariableAssignment};
use crate::sql::token::{FetchPosition, Pos};
use crate::value::{Primary, Ternary};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct UserDefinedFunction {
    pub name: String,
    pub is_aggregate: bool,
    pub cursor: Option<String>,
    pub parameters: Vec<VariableAssignment>,
    pub body: Vec<Statement>,
    pub pos: Pos,
}

impl UserDefinedFunction {
    /// Validates a call's argument count against mandatory and optional
    /// parameters.
    pub fn check_args_len(&self, pos: &Pos, name: &str, args_len: usize) -> QueryResult<()> {
        let mandatory = self
            .parameters
            .iter()
            .filter(|p| p.value.is_none())
            .count();
        let max = self.parameters.len();
        if args_len < mandatory || max < args_len {
            let expected = if mandatory == max {
                format!("{}", mandatory)
            } else {
                format!("{} to {}", mandatory, max)
            };
            return Err(QueryError::FunctionArgumentLength {
                pos: pos.clone(),
                function: name.to_string(),
                expected,
            });
        }
        Ok(())
    }
}

type Frame<T> = Arc<Mutex<HashMap<String, T>>>;

fn new_frame<T>() -> Frame<T> {
    Arc::new(Mutex::new(HashMap::new()))
}

fn key(name: &str) -> String {
    name.to_uppercase()
}

#[derive(Debug, Clone, Default)]
pub struct Scopes {
    variables: Vec<Frame<Primary>>,
    temp_views: Vec<Frame<View>>,
    cursors: Vec<Frame<Cursor>>,
    functions: Vec<Frame<UserDefinedFunction>>,
    inline_tables: Vec<Frame<View>>,
    aliases: Vec<Frame<String>>,
}

impl Scopes {
    pub fn new() -> Self {
        let mut scopes = Scopes::default();
        scopes.push_block();
        scopes.push_node();
        scopes
    }

    pub fn push_block(&mut self) {
        self.variables.insert(0, new_frame());
        self.temp_views.insert(0, new_frame());
        self.cursors.insert(0, new_frame());
        self.functions.insert(0, new_frame());
    }

    pub fn pop_block(&mut self) {
        if 1 < self.variables.len() {
            self.variables.remove(0);
            self.temp_views.remove(0);
            self.cursors.remove(0);
            self.functions.remove(0);
        }
    }

    pub fn push_node(&mut self) {
        self.inline_tables.insert(0, new_frame());
        self.aliases.insert(0, new_frame());
    }

    pub fn pop_node(&mut self) {
        if 1 < self.inline_tables.len() {
            self.inline_tables.remove(0);
            self.aliases.remove(0);
        }
    }

    /// A stack sharing every frame with this one, for subqueries and
    /// parallel record evaluation.
    pub fn shared(&self) -> Scopes {
        self.clone()
    }

    // ---- variables ----

    pub fn declare_variable(&self, name: &str, value: Primary, pos: &Pos) -> QueryResult<()> {
        let k = key(name);
        let mut frame = self.variables[0].lock();
        if frame.contains_key(&k) {
            return Err(QueryError::VariableRedeclared {
                pos: pos.clone(),
                variable: format!("@{}", name),
            });
        }
        frame.insert(k, value);
        Ok(())
    }

    pub fn variable(&self, name: &str, pos: &Pos) -> QueryResult<Primary> {
        let k = key(name);
        for frame in &self.variables {
            if let Some(v) = frame.lock().get(&k) {
                return Ok(v.clone());
            }
        }
        Err(QueryError::UndeclaredVariable {
            pos: pos.clone(),
            variable: format!("@{}", name),
        })
    }

    /// Writes to the innermost frame where the name is already bound.
    pub fn substitute_variable(
        &self,
        name: &str,
        value: Primary,
        pos: &Pos,
    ) -> QueryResult<Primary> {
        let k = key(name);
        for frame in &self.variables {
            let mut frame = frame.lock();
            if let Some(slot) = frame.get_mut(&k) {
                *slot = value.clone();
                return Ok(value);
            }
        }
        Err(QueryError::UndeclaredVariable {
            pos: pos.clone(),
            variable: format!("@{}", name),
        })
    }

    pub fn dispose_variable(&self, name: &str, pos: &Pos) -> QueryResult<()> {
        let k = key(name);
        for frame in &self.variables {
            if frame.lock().remove(&k).is_some() {
                return Ok(());
            }
        }
        Err(QueryError::UndeclaredVariable {
            pos: pos.clone(),
            variable: format!("@{}", name),
        })
    }

    pub fn all_variables(&self) -> Vec<(String, Primary)> {
        let mut seen: HashMap<String, Primary> = HashMap::new();
        for frame in &self.variables {
            for (k, v) in frame.lock().iter() {
                seen.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        let mut list: Vec<(String, Primary)> = seen.into_iter().collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }

    // ---- temporary views ----

    pub fn temp_view_exists(&self, name: &str) -> bool {
        let k = key(name);
        self.temp_views.iter().any(|m| m.lock().contains_key(&k))
    }

    pub fn set_temp_view(&self, view: View) {
        if let Some(info) = &view.file_info {
            self.temp_views[0].lock().insert(info.key(), view);
        }
    }

    /// Copy-on-read: callers get a clone and must `replace_temp_view` to
    /// publish changes.
    pub fn temp_view(&self, name: &Identifier) -> QueryResult<View> {
        let k = key(&name.literal);
        for frame in &self.temp_views {
            if let Some(view) = frame.lock().get(&k) {
                return Ok(view.clone());
            }
        }
        Err(QueryError::TableNotLoaded {
            pos: name.pos.clone(),
            table: name.literal.clone(),
        })
    }

    /// Replaces the binding in the innermost frame that holds it.
    pub fn replace_temp_view(&self, view: View) {
        let k = match &view.file_info {
            Some(info) => info.key(),
            None => return,
        };
        for frame in &self.temp_views {
            let mut frame = frame.lock();
            if frame.contains_key(&k) {
                frame.insert(k, view);
                return;
            }
        }
    }

    pub fn dispose_temp_view(&self, name: &Identifier) -> QueryResult<()> {
        let k = key(&name.literal);
        for frame in &self.temp_views {
            let mut frame = frame.lock();
            let is_temp = frame
                .get(&k)
                .and_then(|v| v.file_info.as_ref())
                .map(|i| i.is_temporary)
                .unwrap_or(false);
            if is_temp {
                frame.remove(&k);
                return Ok(());
            }
        }
        Err(QueryError::UndeclaredTemporaryTable {
            pos: name.pos.clone(),
            table: name.literal.clone(),
        })
    }

    /// Hardens restore points for uncommitted temporary views on commit.
    pub fn store_temp_views(&self, uncommitted: &[String]) {
        for frame in &self.temp_views {
            let mut frame = frame.lock();
            for k in uncommitted {
                if let Some(view) = frame.get_mut(k) {
                    view.store_restore_point();
                }
            }
        }
    }

    /// Restores uncommitted temporary views from snapshots on rollback.
    pub fn restore_temp_views(&self, uncommitted: &[String]) {
        for frame in &self.temp_views {
            let mut frame = frame.lock();
            for k in uncommitted {
                if let Some(view) = frame.get_mut(k) {
                    view.restore();
                }
            }
        }
    }

    pub fn all_temp_view_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for frame in &self.temp_views {
            for view in frame.lock().values() {
                if let Some(info) = &view.file_info {
                    if info.is_temporary && !names.contains(&info.path) {
                        names.push(info.path.clone());
                    }
                }
            }
        }
        names.sort();
        names
    }

    // ---- cursors ----

    pub fn declare_cursor(&self, cursor: Cursor, pos: &Pos) -> QueryResult<()> {
        let k = key(&cursor.name);
        let mut frame = self.cursors[0].lock();
        if frame.contains_key(&k) {
            return Err(QueryError::CursorRedeclared {
                pos: pos.clone(),
                cursor: cursor.name,
            });
        }
        frame.insert(k, cursor);
        Ok(())
    }

    fn with_cursor<T>(
        &self,
        name: &Identifier,
        f: impl FnOnce(&mut Cursor) -> QueryResult<T>,
    ) -> QueryResult<T> {
        let k = key(&name.literal);
        for frame in &self.cursors {
            let mut frame = frame.lock();
            if let Some(cursor) = frame.get_mut(&k) {
                return f(cursor);
            }
        }
        Err(QueryError::UndeclaredCursor {
            pos: name.pos.clone(),
            cursor: name.literal.clone(),
        })
    }

    pub fn cursor_query(&self, name: &Identifier) -> QueryResult<SelectQuery> {
        self.with_cursor(name, |c| Ok(c.query.clone()))
    }

    pub fn open_cursor(&self, name: &Identifier, view: View) -> QueryResult<()> {
        self.with_cursor(name, |c| c.open(view, &name.pos))
    }

    pub fn close_cursor(&self, name: &Identifier) -> QueryResult<()> {
        self.with_cursor(name, |c| {
            c.close();
            Ok(())
        })
    }

    pub fn fetch_cursor(
        &self,
        name: &Identifier,
        position: FetchPosition,
        number: i64,
    ) -> QueryResult<Option<Vec<Primary>>> {
        self.with_cursor(name, |c| c.fetch(position, number, &name.pos))
    }

    pub fn cursor_is_open(&self, name: &Identifier) -> QueryResult<Ternary> {
        self.with_cursor(name, |c| Ok(c.is_open()))
    }

    pub fn cursor_is_in_range(&self, name: &Identifier) -> QueryResult<Ternary> {
        self.with_cursor(name, |c| c.is_in_range(&name.pos))
    }

    pub fn cursor_count(&self, name: &Identifier) -> QueryResult<usize> {
        self.with_cursor(name, |c| c.count(&name.pos))
    }

    pub fn dispose_cursor(&self, name: &Identifier) -> QueryResult<()> {
        let k = key(&name.literal);
        for frame in &self.cursors {
            if frame.lock().remove(&k).is_some() {
                return Ok(());
            }
        }
        Err(QueryError::UndeclaredCursor {
            pos: name.pos.clone(),
            cursor: name.literal.clone(),
        })
    }

    pub fn all_cursor_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for frame in &self.cursors {
            for cursor in frame.lock().values() {
                if !names.contains(&cursor.name) {
                    names.push(cursor.name.clone());
                }
            }
        }
        names.sort();
        names
    }

    // ---- user-defined functions ----

    pub fn declare_function(&self, function: UserDefinedFunction) -> QueryResult<()> {
        let k = key(&function.name);
        let mut frame = self.functions[0].lock();
        if frame.contains_key(&k) {
            return Err(QueryError::FunctionRedeclared {
                pos: function.pos.clone(),
                function: function.name,
            });
        }
        frame.insert(k, function);
        Ok(())
    }

    pub fn function(&self, name: &str) -> Option<UserDefinedFunction> {
        let k = key(name);
        for frame in &self.functions {
            if let Some(f) = frame.lock().get(&k) {
                return Some(f.clone());
            }
        }
        None
    }

    pub fn dispose_function(&self, name: &Identifier) -> QueryResult<()> {
        let k = key(&name.literal);
        for frame in &self.functions {
            if frame.lock().remove(&k).is_some() {
                return Ok(());
            }
        }
        Err(QueryError::FunctionNotExist {
            pos: name.pos.clone(),
            function: name.literal.clone(),
        })
    }

    pub fn all_function_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for frame in &self.functions {
            for f in frame.lock().values() {
                if !names.contains(&f.name) {
                    names.push(f.name.clone());
                }
            }
        }
        names.sort();
        names
    }

    // ---- inline tables (WITH) ----

    pub fn set_inline_table(&self, name: &str, view: View) {
        self.inline_tables[0].lock().insert(key(name), view);
    }

    pub fn inline_table(&self, name: &str) -> Option<View> {
        let k = key(name);
        for frame in &self.inline_tables {
            if let Some(view) = frame.lock().get(&k) {
                return Some(view.clone());
            }
        }
        None
    }

    // ---- aliases ----

    pub fn add_alias(&self, alias: &Identifier, path: &str) -> QueryResult<()> {
        let k = key(&alias.literal);
        let mut frame = self.aliases[0].lock();
        if frame.contains_key(&k) {
            return Err(QueryError::DuplicateTableAlias {
                pos: alias.pos.clone(),
                alias: alias.literal.clone(),
            });
        }
        frame.insert(k, path.to_string());
        Ok(())
    }

    pub fn alias_path(&self, alias: &str) -> Option<String> {
        let k = key(alias);
        for frame in &self.aliases {
            if let Some(path) = frame.lock().get(&k) {
                return Some(path.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Format;
    use crate::query::view::FileInfo;

    fn pos() -> Pos {
        Pos::new(1, 1)
    }

    #[test]
    fn variable_resolution_walks_outward() {
        let mut scopes = Scopes::new();
        scopes
            .declare_variable("outer", Primary::Integer(1), &pos())
            .unwrap();
        scopes.push_block();
        scopes
            .declare_variable("inner", Primary::Integer(2), &pos())
            .unwrap();

        assert_eq!(scopes.variable("outer", &pos()).unwrap(), Primary::Integer(1));
        assert_eq!(scopes.variable("inner", &pos()).unwrap(), Primary::Integer(2));

        scopes.pop_block();
        assert!(scopes.variable("inner", &pos()).is_err());
    }

    #[test]
    fn substitution_reaches_the_binding_frame() {
        let mut scopes = Scopes::new();
        scopes
            .declare_variable("a", Primary::Integer(1), &pos())
            .unwrap();
        scopes.push_block();
        scopes
            .substitute_variable("a", Primary::Integer(9), &pos())
            .unwrap();
        scopes.pop_block();
        assert_eq!(scopes.variable("a", &pos()).unwrap(), Primary::Integer(9));
    }

    #[test]
    fn shared_stacks_see_the_same_bindings() {
        let scopes = Scopes::new();
        scopes
            .declare_variable("a", Primary::Integer(1), &pos())
            .unwrap();
        let shared = scopes.shared();
        shared
            .substitute_variable("a", Primary::Integer(5), &pos())
            .unwrap();
        assert_eq!(scopes.variable("a", &pos()).unwrap(), Primary::Integer(5));
    }

    #[test]
    fn redeclaration_in_same_frame_errors() {
        let mut scopes = Scopes::new();
        scopes.declare_variable("a", Primary::Null, &pos()).unwrap();
        assert!(matches!(
            scopes.declare_variable("a", Primary::Null, &pos()).unwrap_err(),
            QueryError::VariableRedeclared { .. }
        ));
        // Shadowing in a nested block is fine.
        scopes.push_block();
        scopes
            .declare_variable("a", Primary::Integer(2), &pos())
            .unwrap();
    }

    #[test]
    fn temp_views_are_copy_on_read() {
        let scopes = Scopes::new();
        let mut view = View::default();
        view.file_info = Some(FileInfo::temporary("tmp"));
        scopes.set_temp_view(view);

        let ident = Identifier::new("tmp", pos());
        let mut copy = scopes.temp_view(&ident).unwrap();
        copy.record_set.push(Vec::new());
        // The stored view is unchanged until replace is called.
        assert_eq!(scopes.temp_view(&ident).unwrap().record_len(), 0);
        scopes.replace_temp_view(copy);
        assert_eq!(scopes.temp_view(&ident).unwrap().record_len(), 1);
    }

    #[test]
    fn dispose_of_file_backed_view_in_temp_scope_is_undeclared() {
        let scopes = Scopes::new();
        let mut view = View::default();
        view.file_info = Some(FileInfo::new("/tmp/file.csv", Format::Csv));
        scopes.set_temp_view(view);
        let err = scopes
            .dispose_temp_view(&Identifier::new("/tmp/file.csv", pos()))
            .unwrap_err();
        assert!(matches!(err, QueryError::UndeclaredTemporaryTable { .. }));
    }

    #[test]
    fn alias_conflicts_in_one_node_are_rejected() {
        let mut scopes = Scopes::new();
        scopes
            .add_alias(&Identifier::new("t", pos()), "/tmp/a.csv")
            .unwrap();
        assert!(scopes
            .add_alias(&Identifier::new("T", pos()), "/tmp/b.csv")
            .is_err());
        // A nested node may reuse the alias.
        scopes.push_node();
        scopes
            .add_alias(&Identifier::new("t", pos()), "/tmp/b.csv")
            .unwrap();
    }
}
