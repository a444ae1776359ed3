//! End-to-end CLI tests driving the `hostwall` binary against temp
//! state files.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const POLICY: &str = r#"{
    "version": "v7",
    "default_action": "block",
    "rules": [
        {"id": "dns", "action": "allow", "direction": "outbound", "protocol": "udp",
         "remote": {"ports": "53"}},
        {"id": "web", "action": "allow", "direction": "outbound", "protocol": "tcp",
         "remote": {"ports": "80,443"}}
    ]
}"#;

fn hostwall() -> Command {
    Command::cargo_bin("hostwall").expect("binary")
}

fn write_policy(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("policy.json");
    std::fs::write(&path, POLICY).expect("write policy");
    path
}

fn apply(policy: &Path, state: &Path, lkg: &Path) -> assert_cmd::assert::Assert {
    hostwall()
        .arg("apply")
        .arg("--policy")
        .arg(policy)
        .arg("--state")
        .arg(state)
        .arg("--lkg-dir")
        .arg(lkg)
        .assert()
}

#[test]
fn validate_accepts_a_well_formed_policy() {
    let dir = TempDir::new().expect("tempdir");
    hostwall()
        .arg("validate")
        .arg("--policy")
        .arg(write_policy(&dir))
        .assert()
        .success()
        .stdout(predicate::str::contains("\"is_valid\": true"));
}

#[test]
fn validate_reports_every_issue_and_exits_2() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("bad.json");
    std::fs::write(
        &path,
        r#"{"version": "", "default_action": "maybe",
            "rules": [{"id": "x", "action": "allow", "protocol": "icmp"}]}"#,
    )
    .expect("write");

    hostwall()
        .arg("validate")
        .arg("--policy")
        .arg(&path)
        .assert()
        .code(2)
        .stdout(predicate::str::contains("\"is_valid\": false"))
        .stdout(predicate::str::contains("default_action"))
        .stdout(predicate::str::contains("ICMP"));
}

#[test]
fn validate_reads_the_policy_from_stdin() {
    hostwall()
        .arg("validate")
        .arg("--policy")
        .arg("-")
        .write_stdin(POLICY)
        .assert()
        .success();
}

#[test]
fn compile_emits_one_filter_per_expansion() {
    let dir = TempDir::new().expect("tempdir");
    hostwall()
        .arg("compile")
        .arg("--policy")
        .arg(write_policy(&dir))
        .assert()
        .success()
        // dns: one port token; web: two port tokens.
        .stdout(predicate::str::contains("\"filter_count\": 3"));
}

#[test]
fn simulate_reports_the_matching_rule() {
    let dir = TempDir::new().expect("tempdir");
    hostwall()
        .args(["simulate", "--direction", "outbound", "--protocol", "udp"])
        .args(["--remote-port", "53"])
        .arg("--policy")
        .arg(write_policy(&dir))
        .assert()
        .success()
        .stdout(predicate::str::contains("\"would_allow\": true"))
        .stdout(predicate::str::contains("\"matched_rule_id\": \"dns\""));
}

#[test]
fn simulate_falls_through_to_the_default_action() {
    let dir = TempDir::new().expect("tempdir");
    hostwall()
        .args(["simulate", "--direction", "inbound", "--protocol", "tcp"])
        .arg("--policy")
        .arg(write_policy(&dir))
        .assert()
        .success()
        .stdout(predicate::str::contains("\"would_allow\": false"))
        .stdout(predicate::str::contains("\"used_default_action\": true"));
}

#[test]
fn simulate_rejects_an_unknown_direction() {
    let dir = TempDir::new().expect("tempdir");
    hostwall()
        .args(["simulate", "--direction", "sideways", "--protocol", "tcp"])
        .arg("--policy")
        .arg(write_policy(&dir))
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown direction"));
}

#[test]
fn apply_then_reapply_is_idempotent() {
    let dir = TempDir::new().expect("tempdir");
    let policy = write_policy(&dir);
    let state = dir.path().join("state.json");
    let lkg = dir.path().join("lkg");

    apply(&policy, &state, &lkg)
        .success()
        .stdout(predicate::str::contains("\"created\": 3"));

    apply(&policy, &state, &lkg)
        .success()
        .stdout(predicate::str::contains("\"created\": 0"))
        .stdout(predicate::str::contains("\"unchanged\": 3"));
}

#[test]
fn apply_of_an_invalid_policy_exits_2_and_leaves_no_state() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("bad.json");
    std::fs::write(&path, r#"{"version": "", "default_action": "block", "rules": []}"#)
        .expect("write");
    let state = dir.path().join("state.json");

    apply(&path, &state, &dir.path().join("lkg"))
        .code(2)
        .stdout(predicate::str::contains("policy validation failed"));
    assert!(!state.exists());
}

#[test]
fn rollback_removes_every_filter_from_the_state_file() {
    let dir = TempDir::new().expect("tempdir");
    let policy = write_policy(&dir);
    let state = dir.path().join("state.json");

    apply(&policy, &state, &dir.path().join("lkg")).success();

    hostwall()
        .arg("rollback")
        .arg("--state")
        .arg(&state)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"removed\": 3"));

    hostwall()
        .arg("rollback")
        .arg("--state")
        .arg(&state)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"removed\": 0"));
}

#[test]
fn teardown_removes_the_provider_and_sublayer() {
    let dir = TempDir::new().expect("tempdir");
    let policy = write_policy(&dir);
    let state = dir.path().join("state.json");

    apply(&policy, &state, &dir.path().join("lkg")).success();

    hostwall()
        .arg("teardown")
        .arg("--state")
        .arg(&state)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"provider_removed\": true"))
        .stdout(predicate::str::contains("\"sublayer_removed\": true"));
}

#[test]
fn lkg_show_reflects_the_last_successful_apply() {
    let dir = TempDir::new().expect("tempdir");
    let policy = write_policy(&dir);
    let state = dir.path().join("state.json");
    let lkg = dir.path().join("lkg");

    hostwall()
        .args(["lkg", "show"])
        .arg("--lkg-dir")
        .arg(&lkg)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"exists\": false"));

    apply(&policy, &state, &lkg).success();

    hostwall()
        .args(["lkg", "show"])
        .arg("--lkg-dir")
        .arg(&lkg)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"exists\": true"))
        .stdout(predicate::str::contains("\"policy_version\": \"v7\""));
}

#[test]
fn lkg_revert_restores_the_stored_policy() {
    let dir = TempDir::new().expect("tempdir");
    let policy = write_policy(&dir);
    let state = dir.path().join("state.json");
    let lkg = dir.path().join("lkg");

    apply(&policy, &state, &lkg).success();
    hostwall()
        .arg("rollback")
        .arg("--state")
        .arg(&state)
        .assert()
        .success();

    hostwall()
        .args(["lkg", "revert"])
        .arg("--state")
        .arg(&state)
        .arg("--lkg-dir")
        .arg(&lkg)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"created\": 3"));
}

#[test]
fn bootstrap_reapplies_the_stored_policy_after_a_wipe() {
    let dir = TempDir::new().expect("tempdir");
    let policy = write_policy(&dir);
    let state = dir.path().join("state.json");
    let lkg = dir.path().join("lkg");

    apply(&policy, &state, &lkg).success();
    std::fs::remove_file(&state).expect("wipe state");

    hostwall()
        .arg("bootstrap")
        .arg("--state")
        .arg(&state)
        .arg("--lkg-dir")
        .arg(&lkg)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"outcome\": \"applied\""));
}

#[test]
fn bootstrap_with_no_stored_policy_still_exits_cleanly() {
    let dir = TempDir::new().expect("tempdir");
    hostwall()
        .arg("bootstrap")
        .arg("--state")
        .arg(dir.path().join("state.json"))
        .arg("--lkg-dir")
        .arg(dir.path().join("lkg"))
        .assert()
        .success()
        .stdout(predicate::str::contains("no_policy"));
}
