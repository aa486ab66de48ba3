use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

#[test]
fn test_setup_config_prints_json() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::new(cargo_bin!("payrail"));
    cmd.args(["setup-config", "--provider", "stripe", "--project-id", "proj_1"]);

    let output = cmd.output()?;
    assert!(output.status.success());
    let setup: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(setup["provider"], "stripe");
    assert_eq!(setup["project_id"], "proj_1");
    assert_eq!(setup["webhook_path"], "/webhooks/stripe?key={webhook_key}");
    assert_eq!(setup["fields"][0]["name"], "signing_secret");

    Ok(())
}

#[test]
fn test_setup_config_rejects_unknown_provider() {
    let mut cmd = Command::new(cargo_bin!("payrail"));
    cmd.args(["setup-config", "--provider", "paypal", "--project-id", "proj_1"]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("unknown provider"));
}

#[test]
fn test_serve_fails_closed_without_internal_secret() {
    let mut cmd = Command::new(cargo_bin!("payrail"));
    cmd.env_remove("INTERNAL_API_SECRET")
        .args(["serve", "--projects", "tests/fixtures/projects.csv"]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("INTERNAL_API_SECRET must be set"));
}

#[test]
fn test_serve_fails_on_missing_projects_file() {
    let mut cmd = Command::new(cargo_bin!("payrail"));
    cmd.env("INTERNAL_API_SECRET", "s3cret")
        .env("PAYRAIL_BIND_ADDR", "127.0.0.1:0")
        .args(["serve", "--projects", "tests/fixtures/does_not_exist.csv"]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("cannot load projects"));
}

#[test]
fn test_serve_rejects_invalid_configuration() {
    let mut cmd = Command::new(cargo_bin!("payrail"));
    cmd.env("INTERNAL_API_SECRET", "s3cret")
        .env("PAYRAIL_WORKER_BATCH_SIZE", "zero")
        .arg("serve");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("PAYRAIL_WORKER_BATCH_SIZE"));
}
