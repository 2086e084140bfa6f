//! 命令行界面测试（不连接机械臂）

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

const VALID: &str = r#"
[[robots]]
robot_id = "wafer-arm"
ip = "127.0.0.1"
lease_duration_ms = 5000
heartbeat_interval_ms = 1000

[movement]
align_speed = 15.0
"#;

fn cli() -> Command {
    Command::cargo_bin("meca-cli").unwrap()
}

fn write_config(dir: &TempDir, text: &str) -> std::path::PathBuf {
    let path = dir.path().join("config.toml");
    fs::write(&path, text).unwrap();
    path
}

#[test]
fn test_help_lists_commands() {
    cli()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("config"))
        .stdout(predicate::str::contains("batch"))
        .stdout(predicate::str::contains("recover"))
        .stdout(predicate::str::contains("stop"));
}

#[test]
fn test_config_check_valid_file() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, VALID);

    cli()
        .args(["config", "check", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("wafer-arm"))
        .stdout(predicate::str::contains("租约 5000 ms"))
        .stdout(predicate::str::contains("align 15"))
        .stdout(predicate::str::contains("配置有效"));
}

#[test]
fn test_config_check_missing_file_fails() {
    let dir = TempDir::new().unwrap();

    cli()
        .args(["config", "check", "--config"])
        .arg(dir.path().join("absent.toml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("加载配置失败"));
}

#[test]
fn test_config_check_duplicate_robot_fails() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
[[robots]]
robot_id = "meca"

[[robots]]
robot_id = "meca"
"#,
    );

    cli()
        .args(["config", "check", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("duplicate robot id"));
}

#[test]
fn test_config_init_then_show() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    cli()
        .args(["config", "init", "--config"])
        .arg(&path)
        .assert()
        .success();
    assert!(path.exists());

    cli()
        .args(["config", "show", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("robot_id = \"meca\""));

    // 已存在时需要 --force
    cli()
        .args(["config", "init", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));
    cli()
        .args(["config", "init", "--force", "--config"])
        .arg(&path)
        .assert()
        .success();
}

#[test]
fn test_move_rejects_short_pose_before_connecting() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, VALID);

    cli()
        .args(["move", "--pose", "1,2,3", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("需要 6 个数值"));
}

#[test]
fn test_move_pose_and_joints_conflict() {
    cli()
        .args(["move", "--pose", "1,2,3,4,5,6", "--joints", "0,0,0,0,0,0"])
        .assert()
        .failure();
}

#[test]
fn test_speed_out_of_range() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, VALID);

    cli()
        .args(["speed", "150", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("(0, 100]"));
}

#[test]
fn test_recover_speed_out_of_range() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, VALID);

    cli()
        .args(["recover", "--speed", "0", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("(0, 100]"));
}

#[test]
fn test_batch_requires_count() {
    cli()
        .args(["batch", "pickup", "--start", "3"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--count"));
}

#[test]
fn test_unknown_robot_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, VALID);

    cli()
        .args(["status", "--robot", "nope", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("nope"));
}
