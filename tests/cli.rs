//! End-to-end CLI test cases, run against the built binary.

use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    Command::cargo_bin("llm-batch-engine").unwrap()
}

/// Point the engine at an address nothing listens on, so every HTTP call
/// fails fast (connection refused) instead of hanging or hitting a real
/// provider.
fn cmd_with_unreachable_endpoint() -> Command {
    let mut command = cmd();
    command.env("OPENAI_API_BASE", "http://127.0.0.1:1");
    command.env("OPENAI_API_KEY", "test-key");
    command
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_batch_missing_input_file_fails() {
    cmd()
        .arg("batch")
        .arg("tests/fixtures/does-not-exist.jsonl")
        .assert()
        .failure();
}

#[test]
fn test_batch_runs_to_completion_against_unreachable_endpoint() {
    // No host responds, so every request terminates as a failure, but the
    // pool still returns and the command itself exits successfully — a
    // transport failure is a per-request outcome, not a process error.
    cmd_with_unreachable_endpoint()
        .arg("batch")
        .arg("tests/fixtures/requests.jsonl")
        .arg("--jobs")
        .arg("2")
        .arg("--requests-per-minute")
        .arg("6000")
        .assert()
        .success()
        .stdout(predicate::str::contains("req-0"))
        .stdout(predicate::str::contains("req-1"));
}

#[test]
fn test_batch_writes_output_file() {
    let output_path = std::env::temp_dir().join(format!("llm-batch-engine-cli-test-{}.jsonl", uuid::Uuid::new_v4()));

    cmd_with_unreachable_endpoint()
        .arg("batch")
        .arg("tests/fixtures/requests.jsonl")
        .arg("--out")
        .arg(&output_path)
        .arg("--requests-per-minute")
        .arg("6000")
        .assert()
        .success();

    let written = std::fs::read_to_string(&output_path).unwrap();
    assert_eq!(written.lines().count(), 2);
    std::fs::remove_file(&output_path).ok();
}

#[test]
fn test_agent_runs_to_completion_against_unreachable_endpoint() {
    cmd_with_unreachable_endpoint()
        .arg("agent")
        .arg("tests/fixtures/agents.jsonl")
        .arg("--max-iterations")
        .arg("1")
        .assert()
        .success()
        .stdout(predicate::str::contains("agent-0"));
}
