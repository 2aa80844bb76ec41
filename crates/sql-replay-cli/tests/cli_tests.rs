//! CLI integration tests for sql-replay.
//!
//! These tests verify command-line argument parsing, help output,
//! and exit codes for error conditions that need no database.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

/// Get a command for the sql-replay binary.
fn cmd() -> Command {
    Command::cargo_bin("sql-replay").unwrap()
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("compat"))
        .stdout(predicate::str::contains("benchmark"))
        .stdout(predicate::str::contains("replay"))
        .stdout(predicate::str::contains("capture"))
        .stdout(predicate::str::contains("handoff"))
        .stdout(predicate::str::contains("health-check"));
}

#[test]
fn test_replay_subcommand_help() {
    cmd()
        .args(["replay", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--source-type"))
        .stdout(predicate::str::contains("capture-dir"))
        .stdout(predicate::str::contains("--mode"))
        .stdout(predicate::str::contains("--attempt-timeout-ms"))
        .stdout(predicate::str::contains("--max-malformed-lines"));
}

#[test]
fn test_capture_subcommand_help() {
    cmd()
        .args(["capture", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--duration-seconds"))
        .stdout(predicate::str::contains("--interval-seconds"))
        .stdout(predicate::str::contains("--dedup"))
        .stdout(predicate::str::contains("--no-binds"));
}

#[test]
fn test_benchmark_subcommand_help() {
    cmd()
        .args(["benchmark", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--iterations"))
        .stdout(predicate::str::contains("--concurrency"))
        .stdout(predicate::str::contains("--source-id"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("sql-replay"));
}

// =============================================================================
// Global Flags Tests
// =============================================================================

#[test]
fn test_global_flags_exist() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("--log-format"))
        .stdout(predicate::str::contains("[default: text]"))
        .stdout(predicate::str::contains("--verbosity"))
        .stdout(predicate::str::contains("[default: info]"))
        .stdout(predicate::str::contains("[default: config.yaml]"));
}

// =============================================================================
// Exit Code Tests
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_7() {
    // Missing file is an IO error (code 7), not config error (code 1)
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "health-check"])
        .assert()
        .code(7);
}

#[test]
fn test_invalid_yaml_exits_with_code_1() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "invalid: yaml: content: [").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(1);
}

#[test]
fn test_empty_config_exits_with_code_1() {
    let file = tempfile::NamedTempFile::new().unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(1);
}

#[test]
fn test_invalid_concurrency_exits_with_code_1() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "target:").unwrap();
    writeln!(file, "  host: localhost").unwrap();
    writeln!(file, "  database: app").unwrap();
    writeln!(file, "  user: app").unwrap();

    cmd()
        .args([
            "--config",
            file.path().to_str().unwrap(),
            "benchmark",
            "--sql",
            "select 1",
            "--concurrency",
            "0",
        ])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("concurrency"));
}

#[test]
fn test_capture_dir_without_statement_list_exits_with_code_1() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "target:").unwrap();
    writeln!(file, "  host: localhost").unwrap();
    writeln!(file, "  database: app").unwrap();
    writeln!(file, "  user: app").unwrap();
    let dir = tempfile::TempDir::new().unwrap();

    cmd()
        .args([
            "--config",
            file.path().to_str().unwrap(),
            "replay",
            "--source-type",
            "capture-dir",
            "--source-path",
            dir.path().to_str().unwrap(),
        ])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("external analysis step"));
}

// =============================================================================
// Handoff Tests
// =============================================================================

#[test]
fn test_handoff_reports_present_file() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("sqls.txt"), "select 1\n").unwrap();

    cmd()
        .args(["handoff", "--capture-dir", dir.path().to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("present"));
}

#[test]
fn test_handoff_missing_file_fails_without_config() {
    let dir = tempfile::TempDir::new().unwrap();

    cmd()
        .args([
            "--config",
            "nonexistent_config_file.yaml",
            "--output-json",
            "handoff",
            "--capture-dir",
            dir.path().to_str().unwrap(),
        ])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("\"status\": \"missing\""));
}

// =============================================================================
// Config Path Tests
// =============================================================================

#[test]
fn test_short_config_flag() {
    cmd()
        .args(["-c", "some_config.yaml", "--help"])
        .assert()
        .success();
}

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}
