// Operator CLI: trace replay and config printing

mod fixtures;

use assert_cmd::Command;
use fixtures::*;
use predicates::prelude::*;
use tempfile::TempDir;

use tickwork::trace::TraceRecord;
use tickwork::workflows::{Engine, TickOptions};

async fn finished_run_traces() -> Vec<TraceRecord> {
    let wf = linear_workflow();
    let mut task = new_task(&wf);
    drive(&Engine::new(), &mut task, None, &wf, &TickOptions::with_budget(2))
        .await
        .traces
}

fn tickwork(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("tickwork").unwrap();
    cmd.current_dir(dir.path()).env("RUST_LOG", "off");
    cmd
}

#[tokio::test]
async fn test_replay_jsonl_file() {
    let dir = TempDir::new().unwrap();
    let traces = finished_run_traces().await;
    let jsonl: String = traces
        .iter()
        .map(|t| serde_json::to_string(t).unwrap() + "\n")
        .collect();
    std::fs::write(dir.path().join("run.jsonl"), jsonl).unwrap();

    tickwork(&dir)
        .args(["replay", "run.jsonl", "--expect", "done"])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("{}: done", traces[0].run_id)));
}

#[tokio::test]
async fn test_replay_json_array_with_wrong_expectation() {
    let dir = TempDir::new().unwrap();
    let traces = finished_run_traces().await;
    std::fs::write(
        dir.path().join("run.json"),
        serde_json::to_string_pretty(&traces).unwrap(),
    )
    .unwrap();

    tickwork(&dir)
        .args(["replay", "run.json", "--expect", "blocked"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected blocked"));
}

#[tokio::test]
async fn test_replay_rejects_schema_violation() {
    let dir = TempDir::new().unwrap();
    let mut traces = finished_run_traces().await;
    traces[1].reason = None;
    let lines: Vec<String> = traces.iter().map(|t| serde_json::to_string(t).unwrap()).collect();
    std::fs::write(dir.path().join("bad.jsonl"), lines.join("\n")).unwrap();

    tickwork(&dir)
        .args(["replay", "bad.jsonl"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("reason"));
}

#[tokio::test]
async fn test_replay_reports_mismatch() {
    let dir = TempDir::new().unwrap();
    let mut traces = finished_run_traces().await;
    traces.remove(1);
    std::fs::write(
        dir.path().join("gap.json"),
        serde_json::to_string(&traces).unwrap(),
    )
    .unwrap();

    tickwork(&dir)
        .args(["replay", "gap.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to replay"));
}

#[test]
fn test_config_prints_toml() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("tickwork.toml"),
        "[engine]\nclaim_lease_seconds = 90\n",
    )
    .unwrap();

    tickwork(&dir)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[engine]"))
        .stdout(predicate::str::contains("claim_lease_seconds = 90"));
}

#[test]
fn test_help_lists_commands() {
    let dir = TempDir::new().unwrap();
    tickwork(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("replay"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_help_works_with_broken_config() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("tickwork.toml"), "[engine\nclaim_lease_seconds = ").unwrap();

    tickwork(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("replay"));

    tickwork(&dir).arg("config").assert().failure();
}
