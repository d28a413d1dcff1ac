//! Integration tests that lock main-binary startup behavior and smoke paths.

use std::fs;
use std::process::Command;

#[test]
fn main_lists_input_devices() {
    let bin = env!("CARGO_BIN_EXE_sota-interact");
    let output = Command::new(bin)
        .arg("--list-input-devices")
        .env("SOTA_INTERACT_TEST_DEVICES", "Mic A,Mic B")
        .output()
        .expect("run sota-interact");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Available audio input devices:"));
    assert!(stdout.contains("Mic A"));
    assert!(stdout.contains("Mic B"));
}

#[test]
fn main_reports_no_input_devices() {
    let bin = env!("CARGO_BIN_EXE_sota-interact");
    let output = Command::new(bin)
        .arg("--list-input-devices")
        .env("SOTA_INTERACT_TEST_DEVICES", "")
        .output()
        .expect("run sota-interact");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("No audio input devices detected."));
}

#[test]
fn main_requires_a_service_host() {
    let bin = env!("CARGO_BIN_EXE_sota-interact");
    let output = Command::new(bin)
        .env_remove("SOTA_SERVICE_HOST")
        .env_remove("SOTA_SPEECH_URL")
        .env_remove("SOTA_CHAT_URL")
        .output()
        .expect("run sota-interact");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("HOST"), "stderr: {stderr}");
}

#[test]
fn main_exits_with_failure_when_robot_is_unavailable() {
    let dir = tempfile::tempdir().expect("temp dir");
    let blocker = dir.path().join("not-a-dir");
    fs::write(&blocker, "file").expect("write blocker");
    let presence = blocker.join("presence");

    let bin = env!("CARGO_BIN_EXE_sota-interact");
    let output = Command::new(bin)
        .args(["127.0.0.1", "--status-port", "0", "--presence-file"])
        .arg(&presence)
        .arg("--data-dir")
        .arg(dir.path())
        .output()
        .expect("run sota-interact");
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("robot collaborators unavailable"), "stderr: {stderr}");
}
