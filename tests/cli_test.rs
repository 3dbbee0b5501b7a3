//! Integration tests for the `reqpm` command line
//!
//! Each test runs the real binary with its config, data and cache
//! directories inside a temporary project.

mod common;

use common::{stderr, stdout, TestProject, FAILED_BUILD_LOG};
use serde_json::Value;

fn json(output: &std::process::Output) -> Value {
    serde_json::from_str(&stdout(output))
        .unwrap_or_else(|e| panic!("invalid JSON ({e}): {}", stdout(output)))
}

#[test]
fn test_help_lists_commands() {
    let project = TestProject::new();
    let output = project.run(&["--help"]);

    assert!(output.status.success());
    let out = stdout(&output);
    for command in ["import", "build", "worker", "analyze", "clear-slots"] {
        assert!(out.contains(command), "missing {command} in help");
    }
}

#[test]
fn test_analyze_log_text_and_json() {
    let project = TestProject::new();
    project.create_file("build.log", FAILED_BUILD_LOG);

    let output = project.run(&["analyze", "build.log"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("Build Error Analysis:"));
    assert!(out.contains("Missing Python Modules"));
    assert!(out.contains("- setuptools"));

    let output = project.run(&["--json", "analyze", "build.log"]);
    assert!(output.status.success());
    let findings = json(&output);
    let categories: Vec<&str> = findings
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["category"].as_str().unwrap())
        .collect();
    assert!(categories.contains(&"Missing Header Files"));
}

#[test]
fn test_analyze_missing_log_fails() {
    let project = TestProject::new();
    let output = project.run(&["analyze", "nope.log"]);

    assert!(!output.status.success());
    assert!(stderr(&output).contains("Failed to read log file"));
}

#[test]
fn test_add_and_levels() {
    let project = TestProject::new();
    project.create_file("six.spec", "Name: python3-six\nVersion: 1.16.0\n");

    let output = project.run(&["add", "six", "--version", "1.16.0", "--spec", "six.spec"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let output = project.run(&["add", "python-dateutil", "-d", "six"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("level 1"));

    let output = project.run(&["--json", "levels"]);
    assert!(output.status.success());
    let doc = json(&output);
    assert_eq!(doc["levels"][0][0], "six@rhel-9");
    assert_eq!(doc["levels"][1][0], "python-dateutil@rhel-9");
    assert!(doc["cyclic"].as_array().unwrap().is_empty());
}

#[test]
fn test_cycle_is_reported() {
    let project = TestProject::new();
    project.run(&["add", "alpha", "-d", "beta"]);
    project.run(&["add", "beta", "-d", "alpha"]);

    let output = project.run(&["levels"]);
    assert!(output.status.success());
    assert!(stderr(&output).contains("Dependency cycle among"));
}

#[test]
fn test_detached_build_waits_for_dependencies() {
    let project = TestProject::new();
    project.run(&["add", "six"]);
    project.run(&["add", "python-dateutil", "-d", "six"]);

    let output = project.run(&["build", "python-dateutil", "--detach"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("waiting for"));

    let output = project.run(&["build", "six", "--detach"]);
    assert!(output.status.success());

    let output = project.run(&["--json", "status"]);
    assert!(output.status.success());
    let doc = json(&output);
    assert_eq!(doc["summary"]["total"], 2);
    assert_eq!(doc["summary"]["counts"]["pending"], 1);
    assert_eq!(doc["summary"]["counts"]["waiting_for_deps"], 1);
}

#[test]
fn test_cancel_rules() {
    let project = TestProject::new();
    project.run(&["add", "six"]);

    let output = project.run(&["cancel", "six"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Cannot cancel six@rhel-9"));

    project.run(&["build", "six", "--detach"]);
    let output = project.run(&["cancel", "six"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let output = project.run(&["--json", "show", "six"]);
    assert_eq!(json(&output)["status"], "cancelled");
}

#[test]
fn test_import_with_manifest() {
    let project = TestProject::new();
    project.create_file(
        "requirements.txt",
        "# app deps\nrequests==2.31.0\n-e git+https://example.com/repo.git#egg=local\n",
    );
    project.create_file("specs/requests.spec", "Name: python3-requests\n");
    project.create_file(
        "packages.toml",
        r#"
[packages.requests]
version = "2.31.0"
spec = "specs/requests.spec"
dependencies = ["idna"]

[packages.idna]
version = "3.6"
"#,
    );

    let output = project.run(&["import", "requirements.txt", "-m", "packages.toml"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("Imported 1 requirement(s)"));
    assert!(out.contains("+ idna@rhel-9"));

    let output = project.run(&["--json", "show", "requests"]);
    let unit = json(&output);
    assert_eq!(unit["version"], "2.31.0");
    assert_eq!(unit["is_direct"], true);
    assert_eq!(unit["build_order"], 1);
    assert!(unit["descriptor"].as_str().unwrap().contains("python3-requests"));
}

#[test]
fn test_slots_and_clear() {
    let project = TestProject::new();
    project.create_file("settings.toml", "[gate]\nmax_concurrent_builds = 2\n");

    let output = project.run(&["--json", "--config", "settings.toml", "slots"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let doc = json(&output);
    assert_eq!(doc["capacity"], 2);
    assert!(doc["holders"].as_array().unwrap().is_empty());

    let output = project.run(&["clear-slots", "--yes"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Build slot pool cleared"));

    let output = project.run(&["release", "six"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("held no build slot"));
}

#[test]
fn test_invalid_settings_are_rejected() {
    let project = TestProject::new();
    project.create_file("settings.toml", "[gate]\nmax_concurrent_builds = 0\n");

    let output = project.run(&["--config", "settings.toml", "status"]);
    assert!(!output.status.success());
}

#[test]
fn test_recover_resets_nothing_on_clean_state() {
    let project = TestProject::new();
    project.run(&["add", "six"]);

    let output = project.run(&["recover"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("Reset 0 unit(s), cleared 0 build slot(s)"));
}

#[test]
fn test_targets_lists_chroot_configs() {
    let project = TestProject::new();
    project.create_file("mock/rhel-9-x86_64.cfg", "");
    project.create_file("mock/fedora-40-aarch64.cfg", "");
    project.create_file("mock/site-defaults.txt", "");
    project.create_file(
        "settings.toml",
        &format!(
            "[builder]\nmock_config_dir = \"{}\"\n",
            project.path().join("mock").display()
        ),
    );

    let output = project.run(&["--json", "--config", "settings.toml", "targets"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let doc = json(&output);
    assert_eq!(
        doc["targets"],
        serde_json::json!(["fedora-40-aarch64", "rhel-9-x86_64"])
    );
}
