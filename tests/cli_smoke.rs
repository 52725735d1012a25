//! Behavioural smoke tests for the binaries' command lines.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

#[test]
fn plugin_help_lists_its_options() {
    let mut cmd = cargo_bin_cmd!("stowage");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--mode"))
        .stdout(predicate::str::contains("--endpoint"))
        .stdout(predicate::str::contains("--node-id"));
}

#[test]
fn plugin_rejects_unknown_modes() {
    let mut cmd = cargo_bin_cmd!("stowage");
    cmd.args(["--mode", "sideways"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("sideways"));
}

#[test]
fn plugin_without_configuration_names_the_missing_field() {
    let mut cmd = cargo_bin_cmd!("stowage");
    cmd.env_clear()
        .env("STOWAGE_ENDPOINT_DOMAIN", "cloud.example.com")
        .assert()
        .failure()
        .stderr(predicate::str::contains("STOWAGE_").or(predicate::str::contains("region")));
}

#[test]
fn connector_help_lists_its_socket_option() {
    let mut cmd = cargo_bin_cmd!("stowage-connector");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--socket"));
}
