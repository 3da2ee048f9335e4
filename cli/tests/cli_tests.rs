//! Integration tests for the moltagent CLI surface.

#![allow(clippy::expect_used)]

use assert_cmd::Command;
use predicates::prelude::*;

fn moltagent() -> Command {
    let mut cmd = Command::cargo_bin("moltagent").expect("moltagent binary should exist");
    // Isolate from any real control plane or ambient mode selection.
    for var in [
        "MOLTAGENT_MANIFEST",
        "MOLTAGENT_CONTROL_PLANE",
        "MOLTAGENT_API_TOKEN",
        "MOLTAGENT_API_URL",
        "MOLTAGENT_CP_PORT",
        "MOLTAGENT_DATA_DIR",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

const VALID_MANIFEST: &str = r#"{
    "identity": {
        "id": "6f2b8a9e-0c1d-4e5f-8a7b-112233445566",
        "name": "a1",
        "ownerId": "owner-1"
    },
    "controlPlane": {"url": "ws://localhost:18790", "token": "T"},
    "resources": {"provider": "docker-local"},
    "financialControls": {"maxPerDay": 10}
}"#;

// --- Help and parsing ---

#[test]
fn help_flag_describes_the_tool() {
    moltagent()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("autonomous agent workers"))
        .stdout(predicate::str::contains("provision"))
        .stdout(predicate::str::contains("approve"));
}

#[test]
fn no_args_without_mode_env_fails_with_guidance() {
    moltagent()
        .assert()
        .failure()
        .stderr(predicate::str::contains("MOLTAGENT_MANIFEST"))
        .stderr(predicate::str::contains("MOLTAGENT_CONTROL_PLANE"));
}

#[test]
fn unknown_subcommand_is_rejected() {
    moltagent().arg("teleport").assert().failure();
}

// --- validate ---

#[test]
fn validate_accepts_a_valid_manifest() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("agent.json");
    std::fs::write(&path, VALID_MANIFEST).expect("write manifest");

    moltagent()
        .arg("validate")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("manifest valid: a1"));
}

#[test]
fn validate_json_flag_emits_machine_output() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("agent.json");
    std::fs::write(&path, VALID_MANIFEST).expect("write manifest");

    moltagent()
        .arg("--json")
        .arg("validate")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"valid\": true"))
        .stdout(predicate::str::contains("6f2b8a9e-0c1d-4e5f-8a7b-112233445566"));
}

#[test]
fn validate_rejects_bad_priority_with_issue_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("agent.json");
    std::fs::write(
        &path,
        r#"{"goals": [{"description": "g", "priority": 9}], "financialControls": {"maxPerDay": -5}}"#,
    )
    .expect("write manifest");

    moltagent()
        .arg("validate")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("goals[0].priority"))
        .stderr(predicate::str::contains("maxPerDay"));
}

#[test]
fn validate_missing_file_fails() {
    moltagent()
        .arg("validate")
        .arg("/nonexistent/agent.json")
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot read manifest"));
}

// --- commands needing a control plane ---

#[test]
fn list_without_control_plane_fails_cleanly() {
    moltagent()
        .env("MOLTAGENT_CP_PORT", "1")
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("control plane"));
}

#[test]
fn approve_rejects_both_flags_at_once() {
    moltagent()
        .arg("approve")
        .arg("--approve")
        .arg("R1")
        .arg("--deny")
        .arg("R2")
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}
