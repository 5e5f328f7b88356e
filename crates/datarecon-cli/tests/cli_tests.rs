//! CLI integration tests for datarecon.
//!
//! These tests verify argument parsing, help output, type checks and exit
//! codes for error conditions that surface before any database is contacted.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::NamedTempFile;

/// Get a command for the datarecon binary.
fn cmd() -> Command {
    Command::cargo_bin("datarecon").unwrap()
}

fn config_file(yaml: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{}", yaml).unwrap();
    file
}

const CONNECTIONS: &str = r#"
source:
  type: mssql
  host: sqlhost
  database: Sales
  user: sa
  password: secret
target:
  type: postgres
  host: pghost
  database: sales
  user: postgres
  password: secret
"#;

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("check-types"))
        .stdout(predicate::str::contains("health-check"));
}

#[test]
fn test_run_subcommand_help() {
    cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--table"))
        .stdout(predicate::str::contains("--batch-size"))
        .stdout(predicate::str::contains("--output-mode"))
        .stdout(predicate::str::contains("--output-path"))
        .stdout(predicate::str::contains("--case-insensitive"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("datarecon"));
}

#[test]
fn test_global_flag_defaults() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("[default: config.yaml]"))
        .stdout(predicate::str::contains("--shutdown-timeout"))
        .stdout(predicate::str::contains("[default: 60]"))
        .stdout(predicate::str::contains("[default: text]"))
        .stdout(predicate::str::contains("[default: info]"))
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("--progress"));
}

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

// =============================================================================
// Exit Code Tests
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_7() {
    // Missing file is an IO error (code 7), not a config error (code 1)
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "health-check"])
        .assert()
        .code(7);
}

#[test]
fn test_invalid_yaml_exits_with_code_1() {
    let file = config_file("invalid: yaml: content: [\n");
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "run"])
        .assert()
        .code(1);
}

#[test]
fn test_empty_config_exits_with_code_1() {
    let file = NamedTempFile::new().unwrap();
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(1);
}

#[test]
fn test_missing_required_fields_exits_with_code_1() {
    let file = config_file("source:\n  type: mssql\n");
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(1);
}

#[test]
fn test_run_without_tables_exits_with_code_1() {
    let file = config_file(CONNECTIONS);
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "run"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no tables configured"));
}

#[test]
fn test_unknown_table_filter_exits_with_code_1() {
    let file = config_file(&format!("{}tables:\n  - source: dbo.Customers\n", CONNECTIONS));
    cmd()
        .args([
            "--config",
            file.path().to_str().unwrap(),
            "run",
            "--table",
            "Orders",
        ])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no configured table matches"));
}

#[test]
fn test_table_output_needs_postgres_target() {
    let yaml = r#"
source:
  type: postgres
  host: pghost
  database: sales
  user: postgres
target:
  type: mssql
  host: sqlhost
  database: Sales
  user: sa
tables:
  - source: public.customers
"#;
    let file = config_file(yaml);
    cmd()
        .args([
            "--config",
            file.path().to_str().unwrap(),
            "run",
            "--output-mode",
            "table",
        ])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("requires a postgres target"));
}

#[test]
fn test_zero_batch_size_override_rejected() {
    let file = config_file(&format!("{}tables:\n  - source: Customers\n", CONNECTIONS));
    cmd()
        .args([
            "--config",
            file.path().to_str().unwrap(),
            "run",
            "--batch-size",
            "0",
        ])
        .assert()
        .code(1);
}

// =============================================================================
// check-types
// =============================================================================

#[test]
fn test_check_types_without_config() {
    cmd()
        .args([
            "--config",
            "nonexistent_config_file.yaml",
            "check-types",
            "varchar(10)",
            "character varying",
            "bytea",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("varchar(10)"))
        .stdout(predicate::str::contains(
            "varchar(10) vs character varying: compatible (compared as text)",
        ))
        .stdout(predicate::str::contains("varchar(10) vs bytea: incompatible"));
}

#[test]
fn test_check_types_numeric_widening() {
    cmd()
        .args(["check-types", "int", "numeric(18,2)"])
        .assert()
        .success()
        .stdout(predicate::str::contains("compatible (compared as decimal)"));
}

#[test]
fn test_check_types_uses_config_rules() {
    let yaml = format!(
        "{}reconcile:\n  type_rules:\n    - {{ equivalent: [boolean, integer] }}\n",
        CONNECTIONS
    );
    let file = config_file(&yaml);
    cmd()
        .args([
            "--config",
            file.path().to_str().unwrap(),
            "check-types",
            "bit",
            "int",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("bit vs int: compatible (compared as integer)"));
}

#[test]
fn test_check_types_json_output() {
    let output = cmd()
        .args(["--output-json", "check-types", "int4", "bytea"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["types"][0]["class"], "integer");
    assert_eq!(value["types"][1]["class"], "binary");
    assert_eq!(value["pairs"][0]["compatible"], false);
    assert!(value["pairs"][0]["compare_as"].is_null());
}

#[test]
fn test_check_types_requires_a_type() {
    cmd()
        .arg("check-types")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}
