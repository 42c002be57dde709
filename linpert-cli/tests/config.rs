use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn config_prints_yaml_with_default_gauge() {
    Command::cargo_bin("linpert")
        .unwrap()
        .args(["config"])
        .assert()
        .success()
        .stdout(predicate::str::contains("gauge: synchronous"));
}

#[test]
fn config_writes_to_file() {
    let dir = temp_dir();
    let out = dir.join("precision.yaml");
    Command::cargo_bin("linpert")
        .unwrap()
        .args(["config", "--output"])
        .arg(&out)
        .assert()
        .success();
    let contents = std::fs::read_to_string(&out).unwrap();
    assert!(contents.contains("tol_perturb_integration"));
}

fn temp_dir() -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("linpert-cli-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
