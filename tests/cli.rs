//! CLI test cases.

use std::process::Command;

use assert_cmd::prelude::*;
use predicates::str::contains;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    Command::cargo_bin("docverify").unwrap()
}

#[test]
fn test_help() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("loan-deferment"));
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_missing_required_env_fails() {
    cmd()
        .env_remove("OCR_BASE_URL")
        .env_remove("LLM_ENDPOINT")
        .assert()
        .failure()
        .stderr(contains("OCR_BASE_URL"));
}
