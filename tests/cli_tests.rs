//! CLI surface checks.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

fn conductor() -> Command {
    cargo_bin_cmd!("conductor")
}

#[test]
fn help_lists_subcommands() {
    conductor()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("init"))
        .stdout(predicate::str::contains("status"));
}

#[test]
fn version_prints() {
    conductor().arg("--version").assert().success();
}

#[test]
fn init_creates_database_file() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("state").join("conductor.db");
    conductor()
        .args(["--db-path", db_path.to_str().unwrap(), "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("initialized"));
    assert!(db_path.exists());
}

#[test]
fn status_on_fresh_database_reports_no_tasks() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("conductor.db");
    conductor()
        .args(["--db-path", db_path.to_str().unwrap(), "init"])
        .assert()
        .success();
    conductor()
        .args(["--db-path", db_path.to_str().unwrap(), "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No tasks"));
}
