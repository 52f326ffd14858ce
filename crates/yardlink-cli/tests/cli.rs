//! End-to-end checks of the `yardlink` binary that need no broker.

use assert_cmd::Command;
use tempfile::TempDir;

fn yardlink(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("yardlink").unwrap();
    cmd.env("HOME", home.path())
        .env_remove("REGISTRATION_TOKEN")
        .env_remove("RUST_LOG");
    cmd
}

fn stdout(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn keys_on_empty_store() {
    let home = TempDir::new().unwrap();
    let output = yardlink(&home).arg("keys").output().unwrap();
    assert!(output.status.success());
    assert!(stdout(&output).contains("No keys found"));
}

#[test]
fn keygen_then_list() {
    let home = TempDir::new().unwrap();

    let output = yardlink(&home).args(["keygen", "agent"]).output().unwrap();
    assert!(output.status.success(), "{}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("Generated RSA key pair 'agent'"));
    assert!(out.contains("BEGIN PUBLIC KEY"));
    assert!(home.path().join(".yardlink/keys/agent.pem").exists());

    let output = yardlink(&home).arg("keys").output().unwrap();
    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.contains("agent"));
    assert!(out.contains("1 key(s) found."));
}

#[test]
fn keygen_refuses_existing_name() {
    let home = TempDir::new().unwrap();
    yardlink(&home).args(["keygen", "dup"]).assert().success();

    let output = yardlink(&home).args(["keygen", "dup"]).output().unwrap();
    assert!(!output.status.success());
    assert!(stderr(&output).contains("already exists"));
}

#[test]
fn checkin_needs_a_yard() {
    let home = TempDir::new().unwrap();
    let output = yardlink(&home).arg("checkin").output().unwrap();
    assert!(!output.status.success());
    assert!(stderr(&output).contains("no yard given"));
}

#[test]
fn checkin_needs_the_identity_key() {
    let home = TempDir::new().unwrap();
    let output = yardlink(&home)
        .args(["checkin", "--yard", "yard-1", "--identity", "missing"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(stderr(&output).contains("failed to load key 'missing'"));
}

#[test]
fn transport_flag_conflicts_with_broker_url() {
    let home = TempDir::new().unwrap();
    let config = home.path().join("agent.toml");
    std::fs::write(&config, "[broker]\nurl = \"amqp://broker:5672\"\n").unwrap();

    let output = yardlink(&home)
        .args(["checkin", "--yard", "y", "--transport", "mqtt", "--config"])
        .arg(&config)
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(stderr(&output).contains("--transport conflicts with broker.url"));
}

#[test]
fn password_requires_username() {
    let home = TempDir::new().unwrap();
    let output = yardlink(&home)
        .args(["checkin", "--yard", "y", "--password", "pw"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}
