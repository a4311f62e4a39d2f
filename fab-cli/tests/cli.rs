use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_version_flag() {
    Command::cargo_bin("fab")
        .unwrap()
        .arg("-version")
        .assert()
        .success()
        .stdout(predicate::str::contains("fab 0.1.0"));
}

#[test]
fn test_missing_flow_fails() {
    Command::cargo_bin("fab")
        .unwrap()
        .args(["-design", "top"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no flow configured"));
}

#[test]
fn test_unknown_switch_fails() {
    Command::cargo_bin("fab")
        .unwrap()
        .args(["-nonesuch", "x"])
        .assert()
        .failure();
}

#[test]
fn test_unknown_target_fails() {
    Command::cargo_bin("fab")
        .unwrap()
        .args(["-design", "top", "-target", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot load target"));
}

#[test]
fn test_run_without_tool_setup_fails() {
    let dir = tempfile::tempdir().unwrap();
    // the quick target wires a flow, but the shell step has no exe
    // configured, so the pre-run manifest check must reject the run
    Command::cargo_bin("fab")
        .unwrap()
        .current_dir(dir.path())
        .args(["-design", "top", "-target", "quick"])
        .assert()
        .failure();
}
