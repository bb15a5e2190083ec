//! Thin CLI shim over the library: runs statements from the command line
//! or a source file through one session and exits non-zero on any
//! statement-level error.

use eyre::{bail, Result};
use flatq::config::Flags;
use flatq::query::executor::run_program;
use flatq::sql::token::Pos;
use flatq::transaction::{Session, Transaction};

fn print_usage() {
    eprintln!("usage: flatq [--repository DIR] [--format FORMAT] [--stats] [--quiet] (--file PATH | STATEMENTS)");
}

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let mut flags = Flags::default();
    let mut source_file: Option<String> = None;
    let mut statements: Option<String> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--repository" | "-r" => {
                let value = args.next().ok_or_else(|| eyre::eyre!("--repository requires a value"))?;
                flags.set("REPOSITORY", &value, &Pos::default())?;
            }
            "--format" | "-f" => {
                let value = args.next().ok_or_else(|| eyre::eyre!("--format requires a value"))?;
                flags.set("FORMAT", &value, &Pos::default())?;
            }
            "--delimiter" | "-d" => {
                let value = args.next().ok_or_else(|| eyre::eyre!("--delimiter requires a value"))?;
                flags.set("DELIMITER", &value, &Pos::default())?;
            }
            "--cpu" => {
                let value = args.next().ok_or_else(|| eyre::eyre!("--cpu requires a value"))?;
                flags.set("CPU", &value, &Pos::default())?;
            }
            "--stats" => flags.set("STATS", "true", &Pos::default())?,
            "--quiet" | "-q" => flags.set("QUIET", "true", &Pos::default())?,
            "--file" => {
                source_file = Some(
                    args.next()
                        .ok_or_else(|| eyre::eyre!("--file requires a value"))?,
                );
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            other if statements.is_none() && !other.starts_with('-') => {
                statements = Some(other.to_string());
            }
            other => bail!("unknown argument: {}", other),
        }
    }

    let (source, file_name) = match (&source_file, &statements) {
        (Some(path), None) => (std::fs::read_to_string(path)?, Some(path.clone())),
        (None, Some(src)) => (src.clone(), None),
        _ => {
            print_usage();
            std::process::exit(2);
        }
    };

    let tx = Transaction::new(flags, Session::new());
    match run_program(&tx, &source, file_name) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(1);
        }
    }
}
