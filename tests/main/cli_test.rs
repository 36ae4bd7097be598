//! CLI contract tests against the built binary.

use std::path::Path;
use std::process::{Command, Output};

fn execgate(args: &[&str], config: Option<&Path>) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_execgate"));
    command.args(args).env("RUST_LOG", "error");
    if let Some(config) = config {
        command.env("EXECGATE_CONFIG_PATH", config);
    }
    command.output().expect("binary should run")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn rules_validate_reports_a_valid_file() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("rules.json");
    std::fs::write(
        &path,
        format!(
            r#"{{"rules":[{{"rule_type":"BINARY","policy":"ALLOWLIST","sha256":"{}","custom_msg":""}}]}}"#,
            "a".repeat(64)
        ),
    )
    .expect("write rules");

    let output = execgate(&["rules", "validate", &path.display().to_string()], None);

    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("status: Valid"), "stdout: {text}");
    assert!(text.contains("binary rules: 1"), "stdout: {text}");
}

#[test]
fn rules_validate_fails_on_an_invalid_file() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("rules.json");
    std::fs::write(&path, "{}").expect("write rules");

    let output = execgate(&["rules", "validate", &path.display().to_string()], None);

    assert!(!output.status.success());
    assert!(stdout(&output).contains("status: Invalid"));
}

#[test]
fn rules_validate_fails_on_a_missing_file() {
    let output = execgate(&["rules", "validate", "/nonexistent/rules.json"], None);
    assert!(!output.status.success());
}

#[test]
fn config_check_prints_the_resolved_policy() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("config.toml");
    std::fs::write(
        &path,
        "[policy]\nallow_unknown_programs = true\nmode = \"monitor\"\n",
    )
    .expect("write config");

    let output = execgate(&["config", "check"], Some(&path));

    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("mode: Monitor"), "stdout: {text}");
    assert!(text.contains("allow_unknown_programs: true"), "stdout: {text}");
    assert!(text.contains("allow_unsigned_programs: false"), "stdout: {text}");
}

#[test]
fn config_check_rejects_a_broken_file() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("config.toml");
    std::fs::write(&path, "[policy\n").expect("write config");

    let output = execgate(&["config", "check"], Some(&path));
    assert!(!output.status.success());
}

#[test]
fn unknown_subcommand_is_rejected() {
    let output = execgate(&["launch-missiles"], None);
    assert!(!output.status.success());
}
