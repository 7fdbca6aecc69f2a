use assert_cmd::Command;
use predicates::prelude::*;

fn colex() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("colex").unwrap()
}

#[test]
fn test_help_exits_successfully() {
    colex().arg("--help").assert().success();
}

#[test]
fn test_version_exits_successfully() {
    colex()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("colex"));
}

#[test]
fn test_no_args_shows_usage() {
    colex()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_unknown_subcommand_fails() {
    colex()
        .arg("nonexistent")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn test_help_lists_all_subcommands() {
    let assert = colex().arg("--help").assert().success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();

    for cmd in [
        "up",
        "down",
        "list",
        "set-host",
        "enable-enroll",
        "enroll",
    ] {
        assert!(
            output.contains(cmd),
            "Help output should list '{}' subcommand",
            cmd
        );
    }
}

#[test]
fn test_up_requires_conf_argument() {
    colex()
        .arg("up")
        .assert()
        .failure()
        .stderr(predicate::str::contains("CONF"));
}

#[test]
fn test_enroll_requires_key_and_name() {
    colex()
        .arg("enroll")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--key"));
}
