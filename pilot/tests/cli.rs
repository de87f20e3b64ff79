//! CLI tests for the `pilot` binary.
//!
//! Spawns the binary and verifies exit codes and JSON output. No test here
//! reaches a model service.

use std::fs;
use std::process::Command;

use pilot::exit_codes;
use serde_json::Value;

fn pilot() -> Command {
    Command::new(env!("CARGO_BIN_EXE_pilot"))
}

#[test]
fn parse_prints_the_first_pair_as_json() {
    let temp = tempfile::tempdir().expect("tempdir");
    let reply = temp.path().join("reply.txt");
    fs::write(
        &reply,
        "Plan:\n[COMMAND]\ntouch a\n[/COMMAND]\n[CHECK]\ntest -f a && echo True\n[/CHECK]\n",
    )
    .expect("write reply");

    let output = pilot()
        .current_dir(temp.path())
        .args(["parse", "--protocol"])
        .arg(&reply)
        .output()
        .expect("pilot parse");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let parsed: Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(parsed["pair"]["do_command"], "touch a");
    assert_eq!(parsed["pair"]["check_command"], "test -f a && echo True");
    assert_eq!(parsed["malformed"], false);
}

#[test]
fn parse_lists_fenced_blocks() {
    let temp = tempfile::tempdir().expect("tempdir");
    let reply = temp.path().join("reply.md");
    fs::write(&reply, "Run this:\n```bash\necho hi\n```\n").expect("write reply");

    let output = pilot()
        .current_dir(temp.path())
        .arg("parse")
        .arg(&reply)
        .output()
        .expect("pilot parse");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let blocks: Vec<Value> = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[1]["content"], "echo hi");
    assert_eq!(blocks[1]["language"], "bash");
}

#[test]
fn parse_missing_file_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let status = pilot()
        .current_dir(temp.path())
        .args(["parse", "nope.txt"])
        .status()
        .expect("pilot parse");
    assert_eq!(status.code(), Some(exit_codes::INVALID));
}

#[test]
fn chat_without_provider_section_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = pilot()
        .current_dir(temp.path())
        .args(["chat", "make a file"])
        .output()
        .expect("pilot chat");
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("[provider]"));
}

#[test]
fn check_config_rejects_invalid_values() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(
        temp.path().join("pilot.toml"),
        "[session]\nmax_rounds = 0\n",
    )
    .expect("write config");

    let status = pilot()
        .current_dir(temp.path())
        .arg("check-config")
        .status()
        .expect("pilot check-config");
    assert_eq!(status.code(), Some(exit_codes::INVALID));
}

#[test]
fn check_config_accepts_a_provider() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = format!(
        "[provider]\napi_url = \"http://localhost:11434/api/chat\"\nmodel = \"llama3\"\nworking_directory = \"{}\"\n",
        temp.path().display()
    );
    fs::write(temp.path().join("pilot.toml"), config).expect("write config");

    let output = pilot()
        .current_dir(temp.path())
        .arg("check-config")
        .output()
        .expect("pilot check-config");
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&output.stdout).contains("llama3"));
}
