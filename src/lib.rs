//! # flatq - SQL Query Engine for Delimited Text Files
//!
//! flatq treats delimited text files (CSV, TSV, fixed-width, JSON, LTSV)
//! as relational tables. It parses a SQL-like language with procedural
//! extensions (variables, cursors, user-defined functions, transactions),
//! executes queries against file-backed or in-memory tabular data, and
//! emits formatted output.
//!
//! ## Quick Start
//!
//! ```ignore
//! use flatq::config::Flags;
//! use flatq::query::executor::run_program;
//! use flatq::transaction::{Session, Transaction};
//!
//! let tx = Transaction::new(Flags::default(), Session::new());
//! run_program(&tx, "SELECT c1, c2 FROM `data.csv` WHERE c1 > 10", None)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │         CLI shim (bin/flatq)         │
//! ├─────────────────────────────────────┤
//! │   SQL Front End (scanner/parser)     │
//! ├─────────────────────────────────────┤
//! │  Executor │ Evaluator │ Scope Stack  │
//! ├───────────┼───────────┼─────────────┤
//! │ View Model │ Sort Keys │ Worker Pool │
//! ├─────────────────────────────────────┤
//! │  Transaction / Container / Locking   │
//! ├─────────────────────────────────────┤
//! │      Codecs (CSV/TSV/JSON/LTSV)      │
//! └─────────────────────────────────────┘
//! ```
//!
//! Statements execute sequentially; per-record evaluation inside one
//! statement is parallelized across a worker pool, gated on a static
//! purity annotation of the expression tree. All data lives as rewritten
//! text files: a transaction tracks uncommitted views, commit rewrites the
//! backing files in place, rollback restores snapshots.
//!
//! ## Module Overview
//!
//! - [`sql`]: scanner, statement tree, parser
//! - [`value`]: primary values, ternary logic, comparison, arithmetic
//! - [`query`]: views, scopes, evaluator, executor, workers
//! - [`transaction`]: session, transaction state, file container
//! - [`codec`]: file-format readers/writers and table renderers
//! - [`config`]: session flags
//! - [`error`]: the error taxonomy

pub mod codec;
pub mod config;
pub mod error;
pub mod query;
pub mod sql;
pub mod transaction;
pub mod value;

pub use config::Flags;
pub use error::{QueryError, QueryResult};
pub use query::executor::run_program;
pub use transaction::{Session, Transaction};
