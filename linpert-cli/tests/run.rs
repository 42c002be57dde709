use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn run_produces_a_finite_cl_table() {
    Command::cargo_bin("linpert")
        .unwrap()
        .args(["run", "--l-max", "20", "--quiet"])
        .assert()
        .success()
        .stdout(predicate::str::contains("l(l+1)Cl/2pi"));
}
