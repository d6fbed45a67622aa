//! The one-shot CLI commands, run as a separate process against a temp dir.

mod common;

use common::{board_fixture, fixed_now, rfc3339_micros, POST_OLD, POST_PAST_EVENT};
use serde_json::Value;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn boardkeeper(db_dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_boardkeeper"))
        .arg("--db-dir")
        .arg(db_dir)
        .args(args)
        .env("LOG_LEVEL", "warn")
        .output()
        .expect("failed to run boardkeeper")
}

fn stdout_json(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout is not JSON")
}

#[test]
fn test_import_scan_audit_export() {
    let dir = TempDir::new().unwrap();
    let now = fixed_now();
    let board_file = dir.path().join("board.json");
    std::fs::write(&board_file, board_fixture(now).to_string()).unwrap();

    let import = boardkeeper(dir.path(), &["import", board_file.to_str().unwrap()]);
    assert!(import.status.success());

    let audit = stdout_json(&boardkeeper(dir.path(), &["--json", "audit"]));
    assert_eq!(audit["missing_entries"], Value::Array(vec![]));

    let at = rfc3339_micros(now);
    let scan = stdout_json(&boardkeeper(dir.path(), &["--json", "scan", "--at", at.as_str()]));
    assert_eq!(scan["scanned"], 4);
    let expired: Vec<&str> = scan["expired"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["post_id"].as_str().unwrap())
        .collect();
    assert_eq!(expired, vec![POST_OLD, POST_PAST_EVENT]);

    let export = stdout_json(&boardkeeper(dir.path(), &["export"]));
    assert!(export["posts"].get(POST_OLD).is_none());
    assert_eq!(export["applications"].as_object().unwrap().len(), 1);
}

#[test]
fn test_audit_exits_nonzero_on_drift() {
    let dir = TempDir::new().unwrap();
    let board_file = dir.path().join("board.json");
    std::fs::write(
        &board_file,
        r#"{"posts": {"p1": {"category": "x"}}, "applications": {"a1": {"post": "p1", "applicant": "u1"}}}"#,
    )
    .unwrap();
    assert!(boardkeeper(dir.path(), &["import", board_file.to_str().unwrap()])
        .status
        .success());

    let audit = boardkeeper(dir.path(), &["--json", "audit"]);
    assert_eq!(audit.status.code(), Some(1));

    let reconcile = stdout_json(&boardkeeper(dir.path(), &["--json", "reconcile"]));
    assert_eq!(reconcile["indexed"], 1);
    assert!(boardkeeper(dir.path(), &["audit"]).status.success());
}

#[test]
fn test_subscribers_from_flags() {
    let dir = TempDir::new().unwrap();
    let board_file = dir.path().join("board.json");
    std::fs::write(
        &board_file,
        serde_json::json!({
            "subscriptions": common::subscriptions_fixture(),
            "users": {"u1": {"pushToken": "token-u1"}}
        })
        .to_string(),
    )
    .unwrap();
    assert!(boardkeeper(dir.path(), &["import", board_file.to_str().unwrap()])
        .status
        .success());

    let tokens = stdout_json(&boardkeeper(
        dir.path(),
        &[
            "--json",
            "subscribers",
            "--latitude",
            "45.4642",
            "--longitude",
            "9.19",
            "--category",
            "garden",
        ],
    ));
    assert_eq!(tokens, serde_json::json!(["token-u1"]));
}

#[test]
fn test_jobs_lists_runs_and_audit_entries() {
    use boardkeeper::server_store::JobAuditEventType;
    use boardkeeper::{ServerStore, SqliteServerStore};

    let dir = TempDir::new().unwrap();
    {
        let server_store = SqliteServerStore::new(dir.path().join("server.db")).unwrap();
        server_store.record_job_start("expiry_scan", "manual").unwrap();
        server_store
            .log_job_audit(
                "expiry_scan",
                JobAuditEventType::Completed,
                Some(12),
                Some(&serde_json::json!({"posts_deleted": 2})),
                None,
            )
            .unwrap();
    }

    let jobs = stdout_json(&boardkeeper(dir.path(), &["--json", "jobs"]));
    let scan = jobs
        .as_array()
        .unwrap()
        .iter()
        .find(|job| job["job_id"] == "expiry_scan")
        .unwrap();
    assert_eq!(scan["runs"].as_array().unwrap().len(), 1);
    let audit = scan["audit"].as_array().unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0]["event_type"], "completed");
    assert_eq!(audit[0]["details"]["posts_deleted"], 2);

    let reconcile = jobs
        .as_array()
        .unwrap()
        .iter()
        .find(|job| job["job_id"] == "index_reconcile")
        .unwrap();
    assert!(reconcile["audit"].as_array().unwrap().is_empty());
}
