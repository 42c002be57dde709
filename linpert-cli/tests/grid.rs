use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn grid_prints_a_monotone_k_table() {
    Command::cargo_bin("linpert")
        .unwrap()
        .args(["grid"])
        .assert()
        .success()
        .stdout(predicate::str::contains("total k values"));
}

#[test]
fn grid_includes_requested_output_k() {
    Command::cargo_bin("linpert")
        .unwrap()
        .args(["grid", "--output-k", "1e-3,5e-2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("index"));
}
