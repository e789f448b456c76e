use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use orchestrate::audit::{AuditKind, AuditLog};
use orchestrate::error::OrchError;
use orchestrate::lock::LockManager;

mod common;

fn log_in(dir: &std::path::Path) -> AuditLog {
    let locks = Arc::new(LockManager::new(dir.join("locks")));
    AuditLog::new(dir.join("audit.jsonl"), locks, Duration::from_secs(5))
}

#[test]
fn chain_survives_many_appends() {
    let dir = tempfile::tempdir().unwrap();
    let log = log_in(dir.path());

    log.append(AuditKind::WorkflowStart, json!({"task": "t"})).unwrap();
    for i in 0..50 {
        log.append(AuditKind::ItemComplete, json!({"item_id": format!("item-{}", i)}))
            .unwrap();
    }
    log.append(AuditKind::WorkflowFinish, json!({})).unwrap();

    assert_eq!(log.verify_chain().unwrap(), 52);
}

#[test]
fn tail_read_stays_correct_past_the_scan_window() {
    let dir = tempfile::tempdir().unwrap();
    let log = log_in(dir.path());

    // Push the file well beyond the 4 KiB tail scan with bulky payloads.
    let filler = "x".repeat(512);
    for i in 0..32 {
        log.append(AuditKind::ItemComplete, json!({"i": i, "filler": filler}))
            .unwrap();
    }

    let last = log
        .append(AuditKind::WorkflowFinish, json!({"done": true}))
        .unwrap();
    assert_eq!(last.seq, 33);
    assert_eq!(log.verify_chain().unwrap(), 33);
}

#[test]
fn two_handles_on_one_file_share_the_chain() {
    let dir = tempfile::tempdir().unwrap();
    let log_a = log_in(dir.path());
    let log_b = log_in(dir.path());

    log_a.append(AuditKind::WorkflowStart, json!({})).unwrap();
    let second = log_b.append(AuditKind::PhaseTransition, json!({})).unwrap();

    assert_eq!(second.seq, 2);
    assert_eq!(log_a.verify_chain().unwrap(), 2);
}

#[test]
fn truncating_the_log_breaks_verification() {
    let dir = tempfile::tempdir().unwrap();
    let log = log_in(dir.path());

    log.append(AuditKind::WorkflowStart, json!({})).unwrap();
    log.append(AuditKind::ItemComplete, json!({"item_id": "a"})).unwrap();
    log.append(AuditKind::WorkflowFinish, json!({})).unwrap();

    // Drop the middle line.
    let path = dir.path().join("audit.jsonl");
    let lines: Vec<String> = std::fs::read_to_string(&path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    std::fs::write(&path, format!("{}\n{}\n", lines[0], lines[2])).unwrap();

    let err = log.verify_chain().unwrap_err();
    assert!(matches!(err, OrchError::AuditTamper { .. }));
}

#[test]
fn records_carry_rfc3339_timestamps() {
    let dir = tempfile::tempdir().unwrap();
    let log = log_in(dir.path());

    let record = log.append(AuditKind::GatePass, json!({})).unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(&record.ts).is_ok());
}

#[test]
fn kinds_serialize_snake_case() {
    let dir = tempfile::tempdir().unwrap();
    let log = log_in(dir.path());
    log.append(AuditKind::EmergencyOverride, json!({})).unwrap();

    let raw = std::fs::read_to_string(dir.path().join("audit.jsonl")).unwrap();
    assert!(raw.contains("\"kind\":\"emergency_override\""));
}
