//! Container and transaction invariants exercised through the public API:
//! lock files appear while a table is held and disappear on release,
//! concurrent sessions time out instead of corrupting each other, and the
//! uncommitted set drains on both commit and rollback.

use flatq::config::Flags;
use flatq::query::executor::run_program;
use flatq::sql::token::Pos;
use flatq::transaction::{Session, Transaction};
use flatq::QueryError;
use std::fs;
use tempfile::tempdir;

fn transaction_for(dir: &std::path::Path) -> Transaction {
    let (session, _) = Session::with_buffer();
    let mut flags = Flags::default();
    flags.quiet = true;
    flags
        .set("REPOSITORY", &dir.to_string_lossy(), &Pos::default())
        .unwrap();
    Transaction::new(flags, session)
}

#[test]
fn lock_file_is_released_after_program_completion() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("t.csv"), "c1\n1\n").unwrap();

    let tx = transaction_for(dir.path());
    run_program(&tx, "select c1 from t", None).unwrap();

    assert!(
        !dir.path().join(".t.csv.lock").exists(),
        "lock must be released when the program ends"
    );
}

#[test]
fn foreign_lock_makes_acquisition_time_out() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("t.csv"), "c1\n1\n").unwrap();
    fs::write(dir.path().join(".t.csv.lock"), "").unwrap();

    let tx = transaction_for(dir.path());
    tx.update_flags(|f| f.wait_timeout = 0.05);
    let err = run_program(&tx, "select c1 from t", None).unwrap_err();
    assert!(matches!(err, QueryError::LockTimeout { .. }));
}

#[test]
fn error_in_statement_rolls_back_uncommitted_writes() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("t.csv"), "c1\n1\n").unwrap();

    let tx = transaction_for(dir.path());
    let err = run_program(
        &tx,
        "insert into t values (2); select no_such_field from t;",
        None,
    )
    .unwrap_err();
    assert!(matches!(err, QueryError::FieldNotExist { .. }));

    // The failed program never rewrote the file.
    let content = fs::read_to_string(dir.path().join("t.csv")).unwrap();
    assert_eq!(content, "c1\n1\n");
    assert!(tx.uncommitted.lock().is_empty());
}

#[test]
fn commit_clears_the_uncommitted_set_and_rewrites_in_place() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("t.csv"), "c1\n1\n").unwrap();

    let tx = transaction_for(dir.path());
    run_program(&tx, "insert into t values (2); commit;", None).unwrap();
    assert!(tx.uncommitted.lock().is_empty());

    let content = fs::read_to_string(dir.path().join("t.csv")).unwrap();
    assert_eq!(content, "c1\n1\n2\n");
}

#[test]
fn exit_discards_uncommitted_writes() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("t.csv"), "c1\n1\n").unwrap();

    let tx = transaction_for(dir.path());
    let code = run_program(&tx, "insert into t values (2); exit 3;", None).unwrap();
    assert_eq!(code, 3);

    let content = fs::read_to_string(dir.path().join("t.csv")).unwrap();
    assert_eq!(content, "c1\n1\n");
}

#[test]
fn created_table_disappears_on_rollback() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("src.csv"), "c1\n1\n").unwrap();

    let tx = transaction_for(dir.path());
    run_program(
        &tx,
        "create table made.csv as select c1 from src; rollback;",
        None,
    )
    .unwrap();

    assert!(!dir.path().join("made.csv").exists());
    assert!(!dir.path().join(".made.csv.lock").exists());
}
