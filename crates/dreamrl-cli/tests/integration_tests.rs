use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn dreamrl() -> Command {
    Command::cargo_bin("dreamrl").unwrap()
}

#[test]
fn test_cli_help() {
    dreamrl()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("World-model reinforcement learning"));
}

#[test]
fn test_cli_list_envs() {
    dreamrl()
        .arg("list-envs")
        .assert()
        .success()
        .stdout(predicate::str::contains("Available environments:"))
        .stdout(predicate::str::contains("point_mass"))
        .stdout(predicate::str::contains("pixel_grid"));
}

#[test]
fn test_cli_demo() {
    dreamrl()
        .args(["demo", "pixel_grid", "--steps", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Step 2"));
}

#[test]
fn test_cli_demo_unknown_env() {
    dreamrl()
        .args(["demo", "atari", "--steps", "3"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown environment 'atari'"));
}

#[test]
fn test_cli_validate_config() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("run.json");
    std::fs::write(
        &path,
        r#"{"env": {"id": "point_mass", "num_envs": 2}, "algo": {"total_steps": 1000}}"#,
    )
    .unwrap();

    dreamrl()
        .arg("validate-config")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("is valid"))
        .stdout(predicate::str::contains("total_steps=1000"));
}

#[test]
fn test_cli_validate_config_rejects_single_rank() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("run.json");
    std::fs::write(&path, r#"{"distributed": {"world_size": 1}}"#).unwrap();

    dreamrl()
        .arg("validate-config")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("world_size must be at least 2"));
}

#[test]
fn test_cli_validate_config_missing_file() {
    dreamrl()
        .args(["validate-config", "/nonexistent/run.json"])
        .assert()
        .failure();
}

#[test]
#[cfg(not(feature = "torch"))]
fn test_cli_train_requires_torch() {
    let dir = tempdir().unwrap();
    dreamrl()
        .arg("train")
        .arg("--root-dir")
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("requires the 'torch' feature"));
}
