use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_help_lists_flags() {
    Command::cargo_bin("codoc-relay")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--bind"))
        .stdout(predicate::str::contains("--broadcast-capacity"));
}

#[test]
fn test_version_flag() {
    Command::cargo_bin("codoc-relay")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("codoc-relay"));
}

#[test]
fn test_rejects_unknown_flag() {
    Command::cargo_bin("codoc-relay")
        .unwrap()
        .arg("--no-such-flag")
        .assert()
        .failure();
}
