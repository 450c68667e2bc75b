//! CLI tests for the `sb` binary

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// `sb` running inside `dir`, with logs and user config redirected there
fn sb(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("sb").expect("sb binary should build");
    cmd.current_dir(dir)
        .env("XDG_DATA_HOME", dir.join("data"))
        .env("XDG_CONFIG_HOME", dir.join("config"))
        .env("NO_COLOR", "1");
    cmd
}

fn write_config(dir: &Path) -> String {
    let path = dir.join("substrate.yml");
    let storage_dir = dir.join("state");
    fs::write(&path, format!("state:\n  storage-dir: {}\n", storage_dir.display())).unwrap();
    path.display().to_string()
}

const MANIFEST: &str = r#"
services:
  - name: mapManager
    deps: [eventBus, stateManager]
  - name: eventBus
  - name: stateManager
    deps: [eventBus]
"#;

#[test]
fn test_graph_prints_initialization_order() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let manifest = temp_dir.path().join("services.yml");
    fs::write(&manifest, MANIFEST).unwrap();

    sb(temp_dir.path())
        .arg("graph")
        .arg(&manifest)
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialization order"))
        .stdout(predicate::str::contains("1. eventBus"))
        .stdout(predicate::str::contains("3. mapManager"));
}

#[test]
fn test_graph_json_with_init() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let manifest = temp_dir.path().join("services.yml");
    fs::write(&manifest, MANIFEST).unwrap();

    sb(temp_dir.path())
        .args(["graph", "--format", "json", "--init"])
        .arg(&manifest)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"order\""))
        .stdout(predicate::str::contains("Initialized 3 services"));
}

#[test]
fn test_graph_reports_cycle() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let manifest = temp_dir.path().join("cycle.yml");
    fs::write(&manifest, "services:\n  - name: A\n    deps: [B]\n  - name: B\n    deps: [A]\n").unwrap();

    sb(temp_dir.path())
        .arg("graph")
        .arg(&manifest)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Circular dependency"));
}

#[test]
fn test_state_set_get_show_clear() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = write_config(temp_dir.path());

    sb(temp_dir.path())
        .args(["--config", &config, "state", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No persisted state"));

    sb(temp_dir.path())
        .args(["--config", &config, "state", "set", "mapView", "{\"zoom\": 11}"])
        .assert()
        .success();

    sb(temp_dir.path())
        .args(["--config", &config, "state", "get", "mapView"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"zoom\": 11"));

    sb(temp_dir.path())
        .args(["--config", &config, "state", "clear"])
        .assert()
        .success();

    sb(temp_dir.path())
        .args(["--config", &config, "state", "get", "mapView"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Key not persisted"));
}

#[test]
fn test_state_set_rejects_invalid_json() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = write_config(temp_dir.path());

    sb(temp_dir.path())
        .args(["--config", &config, "state", "set", "mapView", "{zoom"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid JSON value"));
}

#[test]
fn test_demo_runs() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    sb(temp_dir.path())
        .arg("demo")
        .assert()
        .success()
        .stdout(predicate::str::contains("3. mapManager"))
        .stdout(predicate::str::contains("ui:datasetChanged"))
        .stdout(predicate::str::contains("Unheard events"))
        .stdout(predicate::str::contains("Instantiated eventBus, stateManager, mapManager"))
        .stdout(predicate::str::contains("Cleaned up 3 services"));
}
