//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

#[test]
fn help_lists_the_run_subcommand() {
    let mut cmd = cargo_bin_cmd!("vmwatch");
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("kernel crashes"));
}

#[test]
fn run_requires_a_command() {
    let mut cmd = cargo_bin_cmd!("vmwatch");
    cmd.arg("run");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("<COMMAND>"));
}

#[test]
fn control_characters_are_rejected_before_booting() {
    let mut cmd = cargo_bin_cmd!("vmwatch");
    cmd.args(["run", "--", "echo\tbad"]);

    cmd.assert()
        .code(1)
        .stderr(predicate::str::contains("control characters"));
}
