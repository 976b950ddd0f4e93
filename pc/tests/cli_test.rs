//! CLI smoke tests

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// `pc` with its log file kept inside `home`
fn pc(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("pc").unwrap();
    cmd.env("XDG_DATA_HOME", home.path()).env("HOME", home.path());
    cmd
}

fn write_config(home: &TempDir, yaml: &str) -> std::path::PathBuf {
    let path = home.path().join("parallelchat.yml");
    fs::write(&path, yaml).unwrap();
    path
}

#[test]
fn test_help_lists_commands() {
    let home = TempDir::new().unwrap();
    pc(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("ask"))
        .stdout(predicate::str::contains("eval"))
        .stdout(predicate::str::contains("prompts"));
}

#[test]
fn test_prints_embedded_prompt() {
    let home = TempDir::new().unwrap();
    pc(&home)
        .args(["prompts", "decompose"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("# Query Decomposition"));
}

#[test]
fn test_prompt_override_dir_wins() {
    let home = TempDir::new().unwrap();
    let prompts = home.path().join("prompts");
    fs::create_dir_all(&prompts).unwrap();
    fs::write(prompts.join("branch.pmt"), "# Custom Branch\n{{{prompt}}}\n").unwrap();
    let config = write_config(&home, &format!("orchestrator:\n  prompts-dir: {}\n", prompts.display()));

    pc(&home)
        .arg("-c")
        .arg(&config)
        .args(["prompts", "branch"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("# Custom Branch"));
}

#[test]
fn test_unknown_prompt_fails() {
    let home = TempDir::new().unwrap();
    pc(&home).args(["prompts", "nonexistent"]).assert().failure();
}

#[test]
fn test_ask_without_api_key_fails() {
    let home = TempDir::new().unwrap();
    let config = write_config(&home, "llm:\n  api-key-env: PARALLELCHAT_CLI_TEST_UNSET_KEY\n");

    pc(&home)
        .arg("-c")
        .arg(&config)
        .args(["ask", "Compare X and Y"])
        .env_remove("PARALLELCHAT_CLI_TEST_UNSET_KEY")
        .assert()
        .failure()
        .stderr(predicate::str::contains("PARALLELCHAT_CLI_TEST_UNSET_KEY"));
}

#[test]
fn test_missing_config_file_fails() {
    let home = TempDir::new().unwrap();
    pc(&home)
        .args(["-c", "/nonexistent/parallelchat.yml", "prompts", "decompose"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load config"));
}

#[test]
fn test_eval_questions_and_generate_conflict() {
    let home = TempDir::new().unwrap();
    pc(&home)
        .args(["eval", "--questions", "questions.yml", "--generate", "3"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}
