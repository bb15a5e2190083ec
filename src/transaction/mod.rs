//! # Session and Transaction State
//!
//! A [`Session`] owns the output sink, the color switch and the "now"
//! override used to pin the clock in tests. A [`Transaction`] owns the
//! flags, the file container, the cache of file-backed views, and the
//! uncommitted-view bookkeeping that commit and rollback consume.
//!
//! The transaction is shared as `&Transaction` by every evaluator,
//! including parallel workers, so its mutable parts sit behind locks:
//! flags behind a read-write lock (SET is statement-level and sequential),
//! the container and caches behind mutexes with short critical sections.
//!
//! ## Uncommitted views
//!
//! Every INSERT/UPDATE/DELETE and every DDL operation marks its target
//! path in the uncommitted set, split into created and updated paths.
//! Commit rewrites files and hardens restore points, then clears the set;
//! rollback restores every mentioned view from its snapshot and clears
//! the set. Inside a transaction each mutated path appears exactly once.

pub mod container;

use crate::config::Flags;
use crate::error::QueryResult;
use crate::query::view::View;
use chrono::{DateTime, FixedOffset};
use container::Container;
use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

/// Output sink; tests swap in a shared buffer to capture what the session
/// prints.
#[derive(Clone)]
pub enum Output {
    Stdout,
    Buffer(Arc<Mutex<Vec<u8>>>),
}

impl Output {
    fn write(&self, s: &str) {
        match self {
            Output::Stdout => {
                let mut stdout = std::io::stdout();
                let _ = stdout.write_all(s.as_bytes());
                let _ = stdout.flush();
            }
            Output::Buffer(buf) => {
                buf.lock().extend_from_slice(s.as_bytes());
            }
        }
    }
}

pub struct Session {
    pub out: Output,
    pub color: bool,
    now_override: Option<DateTime<FixedOffset>>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            out: Output::Stdout,
            color: false,
            now_override: None,
        }
    }

    pub fn with_buffer() -> (Self, Arc<Mutex<Vec<u8>>>) {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let session = Self {
            out: Output::Buffer(buf.clone()),
            color: false,
            now_override: None,
        };
        (session, buf)
    }

    pub fn write_out(&self, s: &str) {
        self.out.write(s);
    }

    /// Pins the clock for NOW() and datetime defaults. Single injection
    /// point for tests.
    pub fn override_now(&mut self, now: DateTime<FixedOffset>) {
        self.now_override = Some(now);
    }

    pub fn now(&self, flags: &Flags) -> DateTime<FixedOffset> {
        match self.now_override {
            Some(now) => now,
            None => flags.timezone.now(),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct UncommittedViews {
    created: HashSet<String>,
    updated: HashSet<String>,
}

impl UncommittedViews {
    pub fn mark_created(&mut self, key: &str) {
        self.created.insert(key.to_uppercase());
    }

    pub fn mark_updated(&mut self, key: &str) {
        let key = key.to_uppercase();
        if !self.created.contains(&key) {
            self.updated.insert(key);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        let key = key.to_uppercase();
        self.created.contains(&key) || self.updated.contains(&key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.created.union(&self.updated).cloned().collect();
        keys.sort();
        keys
    }

    pub fn created_len(&self) -> usize {
        self.created.len()
    }

    pub fn updated_len(&self) -> usize {
        self.updated.len()
    }

    pub fn is_created(&self, key: &str) -> bool {
        self.created.contains(&key.to_uppercase())
    }

    pub fn clear(&mut self) {
        self.created.clear();
        self.updated.clear();
    }
}

/// Statement counters reported when STATS is enabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct OperationCounts {
    pub selected: usize,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub name: String,
    pub statement: String,
}

pub struct Transaction {
    flags: RwLock<Flags>,
    pub session: Session,
    pub container: Mutex<Container>,
    /// File-backed views keyed by upper-cased absolute path. Reads hand
    /// out clones; writes replace the cached instance.
    cached_views: Mutex<HashMap<String, View>>,
    pub uncommitted: Mutex<UncommittedViews>,
    pub counts: Mutex<OperationCounts>,
    pub prepared: Mutex<HashMap<String, PreparedStatement>>,
}

impl Transaction {
    pub fn new(flags: Flags, session: Session) -> Self {
        Self {
            flags: RwLock::new(flags),
            session,
            container: Mutex::new(Container::new()),
            cached_views: Mutex::new(HashMap::new()),
            uncommitted: Mutex::new(UncommittedViews::default()),
            counts: Mutex::new(OperationCounts::default()),
            prepared: Mutex::new(HashMap::new()),
        }
    }

    pub fn flags(&self) -> RwLockReadGuard<'_, Flags> {
        self.flags.read()
    }

    pub fn update_flags<T>(&self, f: impl FnOnce(&mut Flags) -> T) -> T {
        f(&mut self.flags.write())
    }

    pub fn now(&self) -> DateTime<FixedOffset> {
        self.session.now(&self.flags.read())
    }

    /// Locks a file through the container using the configured wait
    /// timeout and retry delay.
    pub fn lock_file(
        &self,
        path: &str,
    ) -> QueryResult<Arc<container::FileHandle>> {
        let (wait_timeout, retry_delay) = {
            let flags = self.flags.read();
            (flags.wait_timeout, Duration::from_millis(flags.retry_delay_ms))
        };
        self.container.lock().lock(path, wait_timeout, retry_delay)
    }

    pub fn cache_view(&self, view: View) {
        if let Some(info) = &view.file_info {
            self.cached_views.lock().insert(info.key(), view);
        }
    }

    pub fn cached_view(&self, key: &str) -> Option<View> {
        self.cached_views.lock().get(&key.to_uppercase()).cloned()
    }

    pub fn cached_view_exists(&self, key: &str) -> bool {
        self.cached_views.lock().contains_key(&key.to_uppercase())
    }

    pub fn replace_cached_view(&self, view: View) {
        self.cache_view(view);
    }

    pub fn with_cached_view<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut View) -> T,
    ) -> Option<T> {
        self.cached_views
            .lock()
            .get_mut(&key.to_uppercase())
            .map(f)
    }

    pub fn cached_view_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.cached_views.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn dispose_cached_view(&self, key: &str) -> QueryResult<()> {
        let key = key.to_uppercase();
        if self.cached_views.lock().remove(&key).is_some() {
            self.container.lock().close(&key)?;
        }
        Ok(())
    }

    pub fn release_all_views(&self) -> QueryResult<()> {
        self.cached_views.lock().clear();
        self.container.lock().close_all()
    }

    pub fn release_all_views_with_errors(&self) -> QueryResult<()> {
        self.cached_views.lock().clear();
        self.container.lock().close_all_with_errors()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncommitted_updates_do_not_shadow_creates() {
        let mut u = UncommittedViews::default();
        u.mark_created("/tmp/a.csv");
        u.mark_updated("/tmp/a.csv");
        assert!(u.is_created("/TMP/A.CSV"));
        assert_eq!(u.keys().len(), 1);
    }

    #[test]
    fn clearing_uncommitted_set_empties_it() {
        let mut u = UncommittedViews::default();
        u.mark_updated("/tmp/a.csv");
        assert!(!u.is_empty());
        u.clear();
        assert!(u.is_empty());
    }

    #[test]
    fn session_buffer_captures_output() {
        let (session, buf) = Session::with_buffer();
        session.write_out("hello\n");
        assert_eq!(String::from_utf8(buf.lock().clone()).unwrap(), "hello\n");
    }

    #[test]
    fn now_override_pins_the_clock() {
        let mut session = Session::new();
        let pinned = DateTime::parse_from_rfc3339("2020-01-01T00:00:00+00:00").unwrap();
        session.override_now(pinned);
        let tx = Transaction::new(Flags::default(), session);
        assert_eq!(tx.now(), pinned);
    }
}
