#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn rollout(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("rollout").unwrap();
    cmd.current_dir(dir.path())
        .env("ROLLOUT_CONFIG", dir.path().join("rollout.yaml"))
        .env("ROLLOUT_DB", dir.path().join("runs.db"))
        .env_remove("RUST_LOG");
    cmd
}

// ---------------------------------------------------------------------------
// rollout config
// ---------------------------------------------------------------------------

#[test]
fn config_init_writes_defaults() {
    let dir = TempDir::new().unwrap();
    rollout(&dir)
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote default configuration"));

    let raw = std::fs::read_to_string(dir.path().join("rollout.yaml")).unwrap();
    let value: serde_yaml::Value = serde_yaml::from_str(&raw).unwrap();
    assert_eq!(value["store"]["baseline_branch"].as_str(), Some("main"));
    assert_eq!(value["device"]["port"].as_u64(), Some(57400));
    assert_eq!(value["server"]["bind"].as_str(), Some("0.0.0.0:8001"));
}

#[test]
fn config_init_refuses_to_overwrite() {
    let dir = TempDir::new().unwrap();
    rollout(&dir).args(["config", "init"]).assert().success();
    rollout(&dir)
        .args(["config", "init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));
    rollout(&dir)
        .args(["config", "init", "--force"])
        .assert()
        .success();
}

#[test]
fn config_check_reports_warnings() {
    let dir = TempDir::new().unwrap();
    rollout(&dir).args(["config", "init"]).assert().success();
    rollout(&dir)
        .args(["config", "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[warning] device.password is empty"));
}

#[test]
fn config_check_json() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("rollout.yaml"),
        "device:\n  password: hunter2\n",
    )
    .unwrap();
    let out = rollout(&dir)
        .args(["--json", "config", "check"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(value["warnings"], serde_json::json!([]));
}

#[test]
fn config_check_fails_on_errors() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("rollout.yaml"),
        "store:\n  address: localhost:8000\n  baseline_branch: ''\n",
    )
    .unwrap();
    rollout(&dir)
        .args(["config", "check"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("[error] store.baseline_branch"))
        .stderr(predicate::str::contains("config validation found errors"));
}

#[test]
fn config_check_without_file_fails() {
    let dir = TempDir::new().unwrap();
    rollout(&dir)
        .args(["config", "check"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("config file not found"));
}

// ---------------------------------------------------------------------------
// rollout runs
// ---------------------------------------------------------------------------

#[test]
fn runs_list_on_empty_database() {
    let dir = TempDir::new().unwrap();
    rollout(&dir)
        .args(["runs", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No runs recorded."));
}

#[test]
fn runs_list_json_is_an_array() {
    let dir = TempDir::new().unwrap();
    rollout(&dir)
        .args(["--json", "runs", "list"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("["));
}

#[test]
fn runs_show_unknown_run_fails() {
    let dir = TempDir::new().unwrap();
    rollout(&dir)
        .args(["runs", "show", "proposed-change-404"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("run not found: proposed-change-404"));
}

// ---------------------------------------------------------------------------
// rollout serve
// ---------------------------------------------------------------------------

#[test]
fn serve_refuses_invalid_config() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("rollout.yaml"),
        "engine:\n  poll_interval_ms: 0\n",
    )
    .unwrap();
    rollout(&dir)
        .args(["serve", "--bind", "127.0.0.1:0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid configuration"));
}

#[test]
fn help_lists_commands() {
    let dir = TempDir::new().unwrap();
    rollout(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("diff"))
        .stdout(predicate::str::contains("runs"));
}
