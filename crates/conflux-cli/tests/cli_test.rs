use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::Path;

fn init_project() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    cargo_bin_cmd!("conflux")
        .args(["init", dir.path().to_str().unwrap(), "--name", "shop"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created project 'shop'"));
    dir
}

fn read_jsonl(path: &Path) -> Vec<Value> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[test]
fn test_init_and_validate() {
    let dir = init_project();

    assert!(dir.path().join("conflux.yaml").exists());
    assert!(dir.path().join("sources/orders.yaml").exists());
    assert!(dir.path().join("workflows/route-orders.yaml").exists());

    cargo_bin_cmd!("conflux")
        .args(["--project", dir.path().to_str().unwrap(), "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Workflow 'route-orders'"))
        .stdout(predicate::str::contains("Configuration is valid"));
}

#[test]
fn test_run_pipeline_request() {
    let dir = init_project();

    cargo_bin_cmd!("conflux")
        .args(["--project", dir.path().to_str().unwrap(), "run"])
        .arg(dir.path().join("pipeline.yaml"))
        .assert()
        .success()
        .stdout(predicate::str::contains("Succeeded"));

    let archived = read_jsonl(&dir.path().join("data/archive.jsonl"));
    assert_eq!(archived.len(), 4);
    for record in &archived {
        assert!(record.get("internal_notes").is_none());
        assert_eq!(record["archived"], true);
    }
    assert_eq!(archived[1]["customer"], "grace");
}

#[test]
fn test_workflow_run_with_vars() {
    let dir = init_project();

    let output = cargo_bin_cmd!("conflux")
        .args(["--project", dir.path().to_str().unwrap(), "workflow", "run"])
        .arg(dir.path().join("workflows/route-orders.yaml"))
        .args(["--var", "threshold=200", "--var", "region=EU", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let result: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result["status"], "Succeeded");
    assert_eq!(result["context"]["threshold"], 200);
    assert_eq!(result["context"]["region"], "EU");
    assert_eq!(result["context"]["environment"], "development");

    let path: Vec<&str> = result["steps"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["stepId"].as_str().unwrap())
        .collect();
    assert_eq!(path, ["extract", "large", "any-large", "load-large", "archive"]);

    assert_eq!(read_jsonl(&dir.path().join("data/large-orders.jsonl")).len(), 2);
    assert_eq!(read_jsonl(&dir.path().join("data/archive.jsonl")).len(), 4);
}

#[test]
fn test_workflow_validate_rejects_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("loop.yaml");
    fs::write(
        &file,
        "id: loop\nstartStepId: a\nsteps:\n  - { id: a, type: Transform, config: {}, onSuccess: b }\n  - { id: b, type: Transform, config: {}, onSuccess: a }\n",
    )
    .unwrap();

    cargo_bin_cmd!("conflux")
        .args(["--project", dir.path().to_str().unwrap(), "workflow", "validate"])
        .arg(&file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Workflow 'loop' is invalid"));
}

#[test]
fn test_failed_run_exits_non_zero() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("request.yaml"),
        r#"
source:
  id: missing
  name: Missing
  type: FileSystem
  connectionProperties: { path: nowhere/orders.jsonl }
destination:
  id: out
  name: Out
  type: FileSystem
  connectionProperties: { path: out.jsonl }
"#,
    )
    .unwrap();

    cargo_bin_cmd!("conflux")
        .args(["--project", dir.path().to_str().unwrap(), "run"])
        .arg(dir.path().join("request.yaml"))
        .assert()
        .failure()
        .stdout(predicate::str::contains("Failed"))
        .stderr(predicate::str::contains("failed"));
    assert!(!dir.path().join("out.jsonl").exists());
}

#[test]
fn test_connector_test() {
    let dir = init_project();

    cargo_bin_cmd!("conflux")
        .args(["--project", dir.path().to_str().unwrap(), "connector", "test"])
        .arg(dir.path().join("sources/orders.yaml"))
        .assert()
        .success()
        .stdout(predicate::str::contains("Connector 'orders' is reachable"));
}

#[test]
fn test_json_log_format() {
    let dir = init_project();

    cargo_bin_cmd!("conflux")
        .args([
            "--project",
            dir.path().to_str().unwrap(),
            "--log-format",
            "json",
            "run",
        ])
        .arg(dir.path().join("pipeline.yaml"))
        .assert()
        .success()
        .stderr(predicate::str::contains("\"level\":\"INFO\""));
}
