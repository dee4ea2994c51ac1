//! Developer test runner.
//!
//! `runtests` with no argument runs itself once per database and sums the
//! failures; `runtests <db>` runs the scenario suite against one database.

use std::process::{Command, ExitCode};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Exit status for a malformed invocation.
const USAGE_EXIT: u8 = 100;

#[derive(Parser, Debug)]
#[command(name = "runtests")]
#[command(
    version,
    about = "Run the dbconstraints scenario suite against one or every database",
    long_about = None
)]
struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Cargo executable used to run the suites
    #[arg(long, env = "CARGO", default_value = "cargo")]
    cargo: String,

    /// SQLite database file for the libsql suite (a temp file when unset)
    #[arg(long, env = "DBCONSTRAINTS_LIBSQL_URL")]
    libsql_url: Option<String>,

    /// Postgres connection string (a container is started when unset)
    #[arg(long, env = "DBCONSTRAINTS_POSTGRES_URL")]
    postgres_url: Option<String>,

    /// MySQL connection URL (a container is started when unset)
    #[arg(long, env = "DBCONSTRAINTS_MYSQL_URL")]
    mysql_url: Option<String>,

    /// Database to test; all of them when omitted
    #[arg(value_enum)]
    databases: Vec<Database>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Database {
    Libsql,
    Postgres,
    Mysql,
    Memory,
}

impl Database {
    const ALL: [Database; 4] = [
        Database::Libsql,
        Database::Postgres,
        Database::Mysql,
        Database::Memory,
    ];

    fn name(self) -> &'static str {
        match self {
            Database::Libsql => "libsql",
            Database::Postgres => "postgres",
            Database::Mysql => "mysql",
            Database::Memory => "memory",
        }
    }

    fn package(self) -> &'static str {
        match self {
            Database::Libsql => "dbconstraints_libsql",
            Database::Postgres => "dbconstraints_tokio_postgres",
            Database::Mysql => "dbconstraints_mysql_async",
            Database::Memory => "tests_common",
        }
    }

    fn features(self) -> Option<&'static str> {
        match self {
            Database::Libsql => Some("libsql-backend"),
            Database::Postgres => Some("postgres-backend"),
            Database::Mysql => Some("mysql-async"),
            Database::Memory => None,
        }
    }
}

impl Cli {
    /// Connection settings forwarded to child processes.
    fn url_env(&self) -> Vec<(&'static str, &str)> {
        [
            ("DBCONSTRAINTS_LIBSQL_URL", self.libsql_url.as_deref()),
            ("DBCONSTRAINTS_POSTGRES_URL", self.postgres_url.as_deref()),
            ("DBCONSTRAINTS_MYSQL_URL", self.mysql_url.as_deref()),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k, v)))
        .collect()
    }
}

/// Determine log filter level from verbosity count
const fn log_filter_from_verbosity(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Run one suite through cargo; container-backed tests are ignored by
/// default, so they are included explicitly.
fn run_one(cli: &Cli, db: Database) -> anyhow::Result<ExitCode> {
    let mut cmd = Command::new(&cli.cargo);
    cmd.args(["test", "-p", db.package()]);
    if let Some(features) = db.features() {
        cmd.args(["--features", features]);
    }
    cmd.args(["--", "--include-ignored"]).envs(cli.url_env());

    info!(database = db.name(), package = db.package(), "running suite");
    let status = cmd
        .status()
        .with_context(|| format!("failed to run {} for {}", cli.cargo, db.name()))?;
    if status.success() {
        Ok(ExitCode::SUCCESS)
    } else {
        error!(database = db.name(), status = %status, "suite failed");
        Ok(ExitCode::from(1))
    }
}

/// Re-invoke this binary once per database and sum the failures.
fn run_all(cli: &Cli) -> anyhow::Result<ExitCode> {
    let exe = std::env::current_exe().context("cannot locate the runtests executable")?;
    let mut failures: u32 = 0;
    for db in Database::ALL {
        let status = Command::new(&exe)
            .arg(db.name())
            .env("CARGO", &cli.cargo)
            .envs(cli.url_env())
            .status()
            .with_context(|| format!("failed to re-run runtests for {}", db.name()))?;
        if !status.success() {
            failures += status.code().map(|c| c.max(1) as u32).unwrap_or(1);
        }
    }
    info!(failures, "all suites finished");
    Ok(ExitCode::from(failures.min(u32::from(USAGE_EXIT - 1)) as u8))
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(log_filter_from_verbosity(
            cli.verbose,
        )))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.databases.as_slice() {
        [] => run_all(&cli),
        [db] => run_one(&cli, *db),
        _ => {
            eprintln!("usage: runtests [libsql|postgres|mysql|memory]");
            Ok(ExitCode::from(USAGE_EXIT))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_accepts_one_database_name() {
        let cli = Cli::try_parse_from(["runtests", "postgres"]).unwrap();
        assert_eq!(cli.databases, vec![Database::Postgres]);
    }

    #[test]
    fn cli_collects_extra_positionals_for_usage_check() {
        let cli = Cli::try_parse_from(["runtests", "libsql", "mysql"]).unwrap();
        assert_eq!(cli.databases.len(), 2);
    }

    #[test]
    fn cli_rejects_unknown_database() {
        assert!(Cli::try_parse_from(["runtests", "oracle"]).is_err());
    }

    #[test]
    fn every_database_maps_to_a_workspace_package() {
        for db in Database::ALL {
            assert!(db.package().starts_with("dbconstraints_") || db == Database::Memory);
            assert_eq!(db.features().is_none(), db == Database::Memory);
        }
    }

    #[test]
    fn url_env_forwards_only_set_urls() {
        let cli = Cli::try_parse_from([
            "runtests",
            "--postgres-url",
            "postgres://localhost/test",
        ])
        .unwrap();
        let env = cli.url_env();
        assert!(env.contains(&("DBCONSTRAINTS_POSTGRES_URL", "postgres://localhost/test")));
    }

    #[test]
    fn verbosity_maps_to_filter() {
        assert_eq!(log_filter_from_verbosity(0), "warn");
        assert_eq!(log_filter_from_verbosity(1), "info");
        assert_eq!(log_filter_from_verbosity(9), "trace");
    }
}
