//! End-to-end tests through the public API: statements go in as text, and
//! assertions run against the session's captured output or the produced
//! error. File-backed cases build their fixtures in a temporary directory
//! that also serves as the repository for relative table names.

use flatq::config::Flags;
use flatq::query::executor::run_program;
use flatq::sql::token::Pos;
use flatq::transaction::{Session, Transaction};
use flatq::QueryError;
use parking_lot::Mutex;
use std::fs;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

struct Runner {
    tx: Transaction,
    out: Arc<Mutex<Vec<u8>>>,
    _dir: Option<TempDir>,
}

impl Runner {
    fn new() -> Runner {
        let (session, out) = Session::with_buffer();
        let mut flags = Flags::default();
        flags.quiet = true;
        Runner {
            tx: Transaction::new(flags, session),
            out,
            _dir: None,
        }
    }

    fn with_files(files: &[(&str, &str)]) -> Runner {
        let dir = tempdir().unwrap();
        for (name, content) in files {
            fs::write(dir.path().join(name), content).unwrap();
        }
        let (session, out) = Session::with_buffer();
        let mut flags = Flags::default();
        flags.quiet = true;
        flags
            .set("REPOSITORY", &dir.path().to_string_lossy(), &Pos::default())
            .unwrap();
        Runner {
            tx: Transaction::new(flags, session),
            out,
            _dir: Some(dir),
        }
    }

    fn run(&self, src: &str) -> Result<i32, QueryError> {
        run_program(&self.tx, src, None)
    }

    fn output(&self) -> String {
        String::from_utf8(self.out.lock().clone()).unwrap()
    }

    fn dir(&self) -> &std::path::Path {
        self._dir.as_ref().unwrap().path()
    }
}

mod select_pipeline {
    use super::*;

    #[test]
    fn select_literal_from_dual_renders_text_frame() {
        let runner = Runner::new();
        runner.run("select 1 from dual").unwrap();
        let output = runner.output();
        assert!(output.contains("| 1 |"), "got:\n{}", output);
    }

    #[test]
    fn select_without_from_behaves_like_dual() {
        let runner = Runner::new();
        runner.run("select 1 + 2 as three").unwrap();
        let output = runner.output();
        assert!(output.contains("three"), "got:\n{}", output);
        assert!(output.contains("| 3 |"), "got:\n{}", output);
    }

    #[test]
    fn where_group_having_order_limit() {
        let runner = Runner::with_files(&[(
            "sales.csv",
            "region,amount\neast,10\nwest,20\neast,30\nnorth,5\nwest,40\n",
        )]);
        runner
            .run(
                "select region, sum(amount) as total from sales \
                 where amount > 5 \
                 group by region \
                 having sum(amount) > 15 \
                 order by total desc \
                 limit 1",
            )
            .unwrap();
        let output = runner.output();
        assert!(output.contains("west"), "got:\n{}", output);
        assert!(output.contains("60"), "got:\n{}", output);
        assert!(!output.contains("east"), "got:\n{}", output);
    }

    #[test]
    fn joins_inner_and_left() {
        let runner = Runner::with_files(&[
            ("users.csv", "id,name\n1,ann\n2,bob\n3,cho\n"),
            ("orders.csv", "user_id,item\n1,book\n1,pen\n2,ink\n"),
        ]);
        runner
            .run("select name, item from users join orders on id = user_id order by name, item")
            .unwrap();
        let output = runner.output();
        assert!(output.contains("ann"));
        assert!(output.contains("pen"));
        assert!(!output.contains("cho"));

        let runner = Runner::with_files(&[
            ("users.csv", "id,name\n1,ann\n3,cho\n"),
            ("orders.csv", "user_id,item\n1,book\n"),
        ]);
        runner
            .run("select name, item from users left join orders on id = user_id order by name")
            .unwrap();
        let output = runner.output();
        assert!(output.contains("cho"), "left join keeps unmatched rows:\n{}", output);
    }

    #[test]
    fn distinct_and_set_operations() {
        let runner = Runner::with_files(&[("t.csv", "c1\n1\n1\n2\n3\n")]);
        runner
            .run("select distinct c1 from t order by c1")
            .unwrap();
        let first = runner.output();
        assert_eq!(first.matches("| 1 |").count(), 1, "got:\n{}", first);

        let runner = Runner::with_files(&[("t.csv", "c1\n1\n2\n")]);
        runner
            .run("select c1 from t union select 9 from dual order by c1")
            .unwrap();
        let output = runner.output();
        assert!(output.contains("9"));
    }

    #[test]
    fn correlated_subquery_and_exists() {
        let runner = Runner::with_files(&[
            ("a.csv", "id\n1\n2\n3\n"),
            ("b.csv", "ref\n2\n3\n"),
        ]);
        runner
            .run("select id from a where exists (select 1 from b where ref = id) order by id")
            .unwrap();
        let output = runner.output();
        assert!(!output.contains("| 1 |"), "got:\n{}", output);
        assert!(output.contains("| 2 |"));
        assert!(output.contains("| 3 |"));
    }

    #[test]
    fn scalar_subquery_limits() {
        let runner = Runner::with_files(&[("t.csv", "c1\n1\n2\n")]);
        let err = runner.run("select (select c1 from t)").unwrap_err();
        assert!(matches!(err, QueryError::SubqueryTooManyRecords { .. }));

        let err = runner
            .run("select (select 1, 2 from dual)")
            .unwrap_err();
        assert!(matches!(err, QueryError::SubqueryTooManyFields { .. }));
    }

    #[test]
    fn recursive_cte_counts_up() {
        let runner = Runner::new();
        runner
            .run(
                "with recursive n (i) as (\
                   select 1 \
                   union all \
                   select i + 1 from n where i < 5\
                 ) select count(*) from n",
            )
            .unwrap();
        let output = runner.output();
        assert!(output.contains("| 5 |"), "got:\n{}", output);
    }

    #[test]
    fn analytic_functions_rank_rows() {
        let runner = Runner::with_files(&[(
            "scores.csv",
            "player,score\nann,10\nbob,30\ncho,20\n",
        )]);
        runner
            .run(
                "select player, row_number() over (order by score desc) as rn \
                 from scores order by rn",
            )
            .unwrap();
        let output = runner.output();
        let bob = output.find("bob").unwrap();
        let cho = output.find("cho").unwrap();
        let ann = output.find("ann").unwrap();
        assert!(bob < cho && cho < ann, "got:\n{}", output);
    }

    #[test]
    fn aggregate_sum_matches_with_parallel_cpu() {
        let mut rows = String::from("c1\n");
        for i in 0..10_000 {
            rows.push_str(&format!("{}\n", i));
        }
        let runner = Runner::with_files(&[("t.csv", &rows)]);
        runner
            .run("set @@cpu to 4; select sum(c1) from t where c1 >= 0;")
            .unwrap();
        let output = runner.output();
        assert!(output.contains("49995000"), "got:\n{}", output);
    }
}

mod diagnostics {
    use super::*;

    #[test]
    fn syntax_error_points_at_offending_token() {
        let runner = Runner::new();
        let err = runner.run("select from").unwrap_err();
        assert_eq!(
            err.to_string(),
            "[L:1 C:8] syntax error: unexpected token \"from\""
        );
    }

    #[test]
    fn missing_field_and_ambiguity() {
        let runner = Runner::with_files(&[
            ("t1.csv", "id,v\n1,a\n"),
            ("t2.csv", "id,w\n1,b\n"),
        ]);
        let err = runner.run("select nope from t1").unwrap_err();
        assert!(matches!(err, QueryError::FieldNotExist { .. }));

        let err = runner
            .run("select id from t1 cross join t2")
            .unwrap_err();
        assert!(matches!(err, QueryError::FieldAmbiguous { .. }));
    }

    #[test]
    fn non_group_key_reference_is_rejected() {
        let runner = Runner::with_files(&[("t.csv", "c1,c2\n1,a\n1,b\n")]);
        let err = runner
            .run("select c2 from t group by c1")
            .unwrap_err();
        assert!(matches!(err, QueryError::FieldIsNotGroupKey { .. }));
    }

    #[test]
    fn missing_table_file() {
        let runner = Runner::with_files(&[]);
        let err = runner.run("select 1 from missing").unwrap_err();
        assert!(matches!(err, QueryError::FileNotExist { .. }));
    }

    #[test]
    fn stats_prints_time() {
        let runner = Runner::new();
        runner.run("set @@stats to true; select 1;").unwrap();
        let output = runner.output();
        assert!(output.contains("Time:"), "got:\n{}", output);
    }
}

mod procedural {
    use super::*;

    #[test]
    fn variable_declaration_and_print() {
        let runner = Runner::new();
        runner.run("var @a := 1; print @a;").unwrap();
        assert_eq!(runner.output(), "1\n");
    }

    #[test]
    fn print_quotes_strings() {
        let runner = Runner::new();
        runner.run("print 'hello';").unwrap();
        assert_eq!(runner.output(), "'hello'\n");
    }

    #[test]
    fn if_and_while_control_flow() {
        let runner = Runner::new();
        runner
            .run(
                "var @i := 0, @total := 0; \
                 while @i < 5 do \
                   @i := @i + 1; \
                   if @i = 3 then continue; end if; \
                   @total := @total + @i; \
                 end while; \
                 print @total;",
            )
            .unwrap();
        assert_eq!(runner.output(), "12\n");
    }

    #[test]
    fn user_defined_function() {
        let runner = Runner::new();
        runner
            .run(
                "declare add2 function (@x, @y default 10) as begin \
                   return @x + @y; \
                 end; \
                 print add2(1, 2); \
                 print add2(5);",
            )
            .unwrap();
        assert_eq!(runner.output(), "3\n15\n");
    }

    #[test]
    fn cursor_protocol_over_file() {
        let runner = Runner::with_files(&[("t.csv", "c1\n10\n20\n")]);
        runner
            .run(
                "var @v := null, @sum := 0; \
                 declare cur cursor for select c1 from t; \
                 open cur; \
                 fetch cur into @v; \
                 @sum := @sum + @v; \
                 fetch cur into @v; \
                 @sum := @sum + @v; \
                 close cur; \
                 dispose cursor cur; \
                 print @sum;",
            )
            .unwrap();
        assert_eq!(runner.output(), "30\n");
    }

    #[test]
    fn fetch_from_empty_table_leaves_range_false_count_zero() {
        let runner = Runner::with_files(&[("empty.csv", "c1\n")]);
        runner
            .run(
                "var @x := null; \
                 declare c cursor for select c1 from empty; \
                 open c; \
                 fetch c into @x; \
                 if cursor c is not in range then print 'out'; end if; \
                 print cursor c count;",
            )
            .unwrap();
        assert_eq!(runner.output(), "'out'\n0\n");
    }

    #[test]
    fn while_in_cursor_iterates_records() {
        let runner = Runner::with_files(&[("t.csv", "c1\n1\n2\n3\n")]);
        runner
            .run(
                "var @v := null, @total := 0; \
                 declare cur cursor for select c1 from t; \
                 open cur; \
                 while @v in cur do \
                   @total := @total + @v; \
                 end while; \
                 print @total;",
            )
            .unwrap();
        assert_eq!(runner.output(), "6\n");
    }

    #[test]
    fn prepared_statement_with_placeholders() {
        let runner = Runner::with_files(&[("t.csv", "c1\n1\n2\n3\n")]);
        runner
            .run(
                "prepare st from 'select c1 from t where c1 = ?'; \
                 execute st using 2; \
                 dispose prepare st;",
            )
            .unwrap();
        let output = runner.output();
        assert!(output.contains("| 2 |"), "got:\n{}", output);
        assert!(!output.contains("| 1 |"), "got:\n{}", output);
    }

    #[test]
    fn parallel_downgrade_with_substitution_matches_sequential() {
        let mut rows = String::from("c1\n");
        for i in 1..=100 {
            rows.push_str(&format!("{}\n", i));
        }
        let runner = Runner::with_files(&[("t.csv", &rows)]);
        runner
            .run(
                "set @@cpu to 4; \
                 var @count := 0; \
                 select count(*) from t where (@count := @count + 1) > 0; \
                 print @count;",
            )
            .unwrap();
        let output = runner.output();
        // The substitution forces sequential evaluation, so the counter
        // saw every record exactly once.
        assert!(output.contains("| 100 |"), "got:\n{}", output);
        assert!(output.ends_with("100\n"), "got:\n{}", output);
    }
}

mod dml_and_ddl {
    use super::*;

    #[test]
    fn insert_update_delete_with_commit_rewrites_file() {
        let runner = Runner::with_files(&[("t.csv", "c1,c2\n1,a\n2,b\n")]);
        runner
            .run(
                "insert into t (c1, c2) values (3, 'c'); \
                 update t set c2 = 'z' where c1 = 1; \
                 delete from t where c1 = 2; \
                 commit;",
            )
            .unwrap();
        let content = fs::read_to_string(runner.dir().join("t.csv")).unwrap();
        assert_eq!(content, "c1,c2\n1,z\n3,c\n");
    }

    #[test]
    fn rollback_restores_file_state() {
        let runner = Runner::with_files(&[("t.csv", "c1\n1\n")]);
        runner
            .run(
                "insert into t values (2); \
                 rollback; \
                 select count(*) from t;",
            )
            .unwrap();
        let output = runner.output();
        assert!(output.contains("| 1 |"), "got:\n{}", output);
        let content = fs::read_to_string(runner.dir().join("t.csv")).unwrap();
        assert_eq!(content, "c1\n1\n");
    }

    #[test]
    fn uncommitted_writes_are_visible_in_the_transaction_but_not_on_disk() {
        let runner = Runner::with_files(&[("t.csv", "c1\n1\n")]);
        runner
            .run("insert into t values (2); select count(*) from t;")
            .unwrap();
        assert!(runner.output().contains("| 2 |"));
        // run_program committed on success, so now the file has both rows.
        let content = fs::read_to_string(runner.dir().join("t.csv")).unwrap();
        assert_eq!(content, "c1\n1\n2\n");
    }

    #[test]
    fn create_table_as_select() {
        let runner = Runner::with_files(&[("src.csv", "c1\n5\n6\n")]);
        runner
            .run("create table made.csv (a) as select c1 from src; commit;")
            .unwrap();
        let content = fs::read_to_string(runner.dir().join("made.csv")).unwrap();
        assert_eq!(content, "a\n5\n6\n");
    }

    #[test]
    fn alter_table_add_drop_rename() {
        let runner = Runner::with_files(&[("t.csv", "c1,c2\n1,a\n")]);
        runner
            .run(
                "alter table t add (c3 default c1 * 10) after c1; \
                 alter table t drop c2; \
                 alter table t rename c3 to ten; \
                 commit;",
            )
            .unwrap();
        let content = fs::read_to_string(runner.dir().join("t.csv")).unwrap();
        assert_eq!(content, "c1,ten\n1,10\n");
    }

    #[test]
    fn temporary_view_lifecycle() {
        let runner = Runner::new();
        runner
            .run(
                "declare tmp view (a, b); \
                 insert into tmp values (1, 'x'), (2, 'y'); \
                 select count(*) from tmp; \
                 dispose view tmp;",
            )
            .unwrap();
        assert!(runner.output().contains("| 2 |"));
    }

    #[test]
    fn declared_view_survives_rollback_to_snapshot() {
        let runner = Runner::new();
        runner
            .run(
                "declare tmp view (a); \
                 insert into tmp values (1); \
                 commit; \
                 insert into tmp values (2); \
                 rollback; \
                 select count(*) from tmp;",
            )
            .unwrap();
        assert!(runner.output().contains("| 1 |"), "got:\n{}", runner.output());
    }

    #[test]
    fn insert_row_length_mismatch() {
        let runner = Runner::with_files(&[("t.csv", "c1,c2\n1,a\n")]);
        let err = runner
            .run("insert into t (c1, c2) values (1)")
            .unwrap_err();
        assert!(matches!(err, QueryError::InsertRowValueLength { expected: 2, .. }));
    }
}

mod formats {
    use super::*;

    #[test]
    fn reads_tsv_json_and_ltsv_tables() {
        let runner = Runner::with_files(&[
            ("a.tsv", "c1\tc2\n1\tx\n"),
            ("b.json", r#"[{"k": 1}, {"k": 2}]"#),
            ("c.ltsv", "k:9\tv:z\n"),
        ]);
        runner.run("select c2 from a").unwrap();
        assert!(runner.output().contains("x"));

        runner.run("select sum(k) from b").unwrap();
        assert!(runner.output().contains("| 3 |"));

        runner.run("select k from c").unwrap();
        assert!(runner.output().contains("| 9 |"));
    }

    #[test]
    fn json_row_value_in_comparison() {
        let runner = Runner::new();
        runner
            .run("select 2 in json_row('', '[1, 2, 3]')")
            .unwrap();
        assert!(runner.output().contains("TRUE"), "got:\n{}", runner.output());
    }

    #[test]
    fn output_format_switches_to_csv() {
        let runner = Runner::with_files(&[("t.csv", "c1,c2\n1,a\n")]);
        runner
            .run("set @@format to 'CSV'; select c1, c2 from t;")
            .unwrap();
        assert!(runner.output().contains("1,a"), "got:\n{}", runner.output());
    }
}
