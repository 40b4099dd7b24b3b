//! End-to-end runs of the `agx` binary: the parent re-executes itself as the
//! detached runner, which runs a scripted executor.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use tempfile::TempDir;

// ============================================================================
// Constants
// ============================================================================

const POLL_MS: u64 = 100;

/// Process exit and the final store write on top of one poll interval.
const DISCOVERY_SLACK_MS: u128 = 400;

/// Announces `abc123` after one second and exits a little later.
/// `$1` receives the runner variables it can see, `$2` the announce time.
const DELAYED_EXECUTOR: &str = r#"echo "marker=${AGX_BACKGROUND_RUNNER-unset} handoff=${AGX_RUNNER_HANDOFF-unset}" > "$1"
sleep 1
date +%s%3N > "$2"
echo '{"type":"session.created","session_id":"abc123"}'
sleep 1"#;

// ============================================================================
// Test Helpers
// ============================================================================

fn agx(state: &Path) -> Command {
    let mut command = Command::cargo_bin("agx").unwrap();
    command
        .arg("--state-dir")
        .arg(state)
        .env_remove("AGX_BACKGROUND_RUNNER")
        .env_remove("AGX_RUNNER_HANDOFF")
        .env_remove("AGX_STATE_DIR");
    command
}

fn state_dir(timeout_ms: u64) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("config.toml"),
        format!("[launch]\npoll_interval_ms = {POLL_MS}\ntimeout_ms = {timeout_ms}\n"),
    )
    .unwrap();
    dir
}

fn sessions(state: &Path) -> serde_json::Map<String, Value> {
    let raw = fs::read_to_string(state.join("sessions.json")).unwrap();
    let json: Value = serde_json::from_str(&raw).unwrap();
    json["sessions"].as_object().cloned().unwrap()
}

fn now_millis() -> u128 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis()
}

fn wait_for_status(state: &Path, key: &str, status: &str) -> Value {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let entry = sessions(state).get(key).cloned().unwrap_or(Value::Null);
        if entry["status"] == status || Instant::now() > deadline {
            return entry;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

// ============================================================================
// Background Launch
// ============================================================================

#[test]
fn test_background_run_discovers_and_rekeys() {
    let state = state_dir(10_000);
    let env_out: PathBuf = state.path().join("executor-env");
    let stamp: PathBuf = state.path().join("announced-at");

    let output = agx(state.path())
        .args(["run", "demo", "--background", "--", "sh", "-c", DELAYED_EXECUTOR, "sh"])
        .arg(&env_out)
        .arg(&stamp)
        .output()
        .unwrap();
    let returned_at = now_millis();

    assert!(output.status.success(), "{output:?}");
    assert_eq!(stdout(&output).trim(), "abc123");

    let announced_at: u128 = fs::read_to_string(&stamp).unwrap().trim().parse().unwrap();
    let lag = returned_at.saturating_sub(announced_at);
    assert!(
        lag <= u128::from(POLL_MS) + DISCOVERY_SLACK_MS,
        "id returned {lag}ms after it was written"
    );

    // Moved, not copied, under the discovered id.
    let store = sessions(state.path());
    assert_eq!(store.len(), 1, "{store:?}");
    let entry = &store["abc123"];
    assert!(entry["name"].as_str().unwrap().starts_with("demo-"));
    assert_eq!(entry["sessionId"], "abc123");
    assert_eq!(entry["background"], true);
    assert!(entry["runnerPid"].is_u64());
    assert!(entry["executorPid"].is_u64());

    let finished = wait_for_status(state.path(), "abc123", "completed");
    assert_eq!(finished["status"], "completed", "{finished}");
    assert_eq!(finished["exitCode"], 0);

    // The executor saw none of the runner's handoff.
    let seen = fs::read_to_string(&env_out).unwrap();
    assert_eq!(seen.trim(), "marker=unset handoff=unset");
}

#[test]
fn test_background_timeout_exits_2_and_job_can_be_stopped() {
    let state = state_dir(500);

    let output = agx(state.path())
        .args(["run", "quiet", "-b", "--name", "quiet-job", "--", "sleep", "30"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2), "{output:?}");

    let entry = wait_for_status(state.path(), "quiet-job", "running");
    assert_eq!(entry["status"], "running");

    agx(state.path())
        .arg("list")
        .assert()
        .success()
        .stdout(contains("quiet-job"));

    agx(state.path())
        .args(["stop", "quiet-job"])
        .assert()
        .success()
        .stdout(contains("Stopped quiet-job"));
    let entry = wait_for_status(state.path(), "quiet-job", "stopped");
    assert_eq!(entry["status"], "stopped");
}

// ============================================================================
// View
// ============================================================================

#[test]
fn test_view_without_log_still_shows_entry() {
    let state = state_dir(10_000);
    fs::write(
        state.path().join("sessions.json"),
        r#"{"version":3,"sessions":{"abc123":{"agent":"demo","name":"demo-1","sessionId":"abc123","status":"completed","exitCode":0,"logFile":"/nonexistent/agx/demo.log"}}}"#,
    )
    .unwrap();

    agx(state.path())
        .args(["view", "demo-1"])
        .assert()
        .success()
        .stdout(contains("Status:  completed"))
        .stdout(contains("Session: abc123"))
        .stdout(contains("log unavailable"));
}
