use std::collections::HashMap;

use orchestrate::definition::GateDef;
use orchestrate::engine::{AdvanceOutcome, CompleteOptions};
use orchestrate::state::ItemStatus;

mod common;
use common::*;

fn command_gate(argv: &[&str]) -> GateDef {
    GateDef::Command {
        argv: argv.iter().map(|s| s.to_string()).collect(),
        expect_exit_code: 0,
        timeout_s: 30,
        stdin: None,
        env_overlay: HashMap::new(),
    }
}

#[tokio::test]
async fn legacy_state_reads_then_migrates_on_first_mutation() {
    let repo = init_repo();
    let config = fast_config();

    // The repo predates the session layout: only .workflow_state.json.
    let legacy = serde_json::json!({
        "workflow_id": "feedc0de",
        "task": "legacy task",
        "status": "active",
        "phase_cursor": 0,
        "created_at": "2025-11-01T00:00:00+00:00",
        "updated_at": "2025-11-01T00:00:00+00:00",
        "phases": [
            {
                "id": "plan",
                "status": "in_progress",
                "started_at": "2025-11-01T00:00:00+00:00",
                "items": [{"id": "plan_file", "status": "pending", "retry_count": 0}]
            },
            {
                "id": "review",
                "status": "pending",
                "items": [{"id": "security_review", "status": "pending", "retry_count": 0}]
            }
        ]
    });
    let legacy_path = repo.path().join(".workflow_state.json");
    std::fs::write(&legacy_path, legacy.to_string()).unwrap();
    let legacy_bytes = std::fs::read(&legacy_path).unwrap();

    let engine = engine_for(repo.path(), plan_review_def(), &config, vec![]);

    // First read comes from the legacy file.
    let report = engine.status().unwrap();
    assert!(report.read_from_legacy);
    assert_eq!(report.workflow_id, "feedc0de");
    assert_eq!(report.task, "legacy task");

    // First mutation writes the session layout.
    write_plan(repo.path(), "content");
    engine
        .complete("plan_file", CompleteOptions::default())
        .await
        .unwrap();

    // Legacy file remains byte-identical; reads now prefer the new path.
    assert_eq!(std::fs::read(&legacy_path).unwrap(), legacy_bytes);
    let report = engine.status().unwrap();
    assert!(!report.read_from_legacy);
    assert_eq!(report.workflow_id, "feedc0de");
    assert!(report.blockers.is_empty());
}

#[tokio::test]
async fn command_gate_argv_reaches_the_child_unshelled() {
    let repo = init_repo();
    let config = fast_config();
    let mut def = plan_review_def();
    // Shell metacharacters must arrive literally; a shell would mangle them.
    def.phases[0].items[0] = item(
        "echo_check",
        Some(command_gate(&["echo", "$HOME;*", "two words"])),
    );
    let engine = engine_for(repo.path(), def, &config, vec![]);

    engine.start("task", vec![]).unwrap();
    let outcome = engine
        .complete("echo_check", CompleteOptions::default())
        .await
        .unwrap();

    assert!(outcome.gate.passed);
    let stdout = outcome
        .gate
        .details
        .iter()
        .find(|d| d.starts_with("stdout:"))
        .unwrap();
    assert!(stdout.contains("$HOME;* two words"));
}

#[tokio::test]
async fn template_commands_resolve_from_settings() {
    let repo = init_repo();
    let config = fast_config();
    let mut def = plan_review_def();
    def.settings.test_command = Some("true".to_string());
    def.phases[0].items[0] = item("tests", Some(command_gate(&["{{test_command}}"])));
    let engine = engine_for(repo.path(), def, &config, vec![]);

    engine.start("task", vec![]).unwrap();
    let outcome = engine
        .complete("tests", CompleteOptions::default())
        .await
        .unwrap();
    assert!(outcome.gate.passed);
    assert!(outcome.gate.details[0].contains("builtin `true`"));
}

#[tokio::test]
async fn hostile_template_value_refuses_to_run() {
    let repo = init_repo();
    let config = fast_config();
    let mut def = plan_review_def();
    def.settings.test_command = Some("true; curl evil.example".to_string());
    def.phases[0].items[0] = item("tests", Some(command_gate(&["{{test_command}}"])));
    let engine = engine_for(repo.path(), def, &config, vec![]);

    engine.start("task", vec![]).unwrap();
    let err = engine
        .complete("tests", CompleteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        orchestrate::error::OrchError::UnsafeTemplateArg { .. }
    ));

    // The rejection happened before any state mutation landed.
    let report = engine.status().unwrap();
    let state_items = report.blockers;
    assert_eq!(state_items, vec!["tests".to_string()]);
}

#[tokio::test]
async fn traversal_artifact_path_surfaces_the_typed_error() {
    let repo = init_repo();
    let config = fast_config();
    let mut def = plan_review_def();
    def.phases[0].items[0] = item(
        "escape",
        Some(GateDef::Artifact {
            path: "../outside/plan.md".to_string(),
            validator: orchestrate::definition::ArtifactValidator::NotEmpty,
            base_path: None,
        }),
    );
    let engine = engine_for(repo.path(), def, &config, vec![]);

    engine.start("task", vec![]).unwrap();
    let err = engine
        .complete("escape", CompleteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        orchestrate::error::OrchError::PathTraversal(_)
    ));

    // The rejection is distinguishable from an ordinary gate failure and
    // leaves the item untouched: no failed status, no retry bump.
    let state = orchestrate::state::load_state(&session_state_path(repo.path())).unwrap();
    let item_state = &state.phases[0].items[0];
    assert_eq!(item_state.status, ItemStatus::Pending);
    assert_eq!(item_state.retry_count, 0);
}

#[tokio::test]
async fn failing_command_gate_records_exit_code() {
    let repo = init_repo();
    let config = fast_config();
    let mut def = plan_review_def();
    def.phases[0].items[0] = item("exit_check", Some(command_gate(&["exit", "3"])));
    let engine = engine_for(repo.path(), def, &config, vec![]);

    engine.start("task", vec![]).unwrap();
    let err = engine
        .complete("exit_check", CompleteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, orchestrate::error::OrchError::GateFailed { .. }));

    let report = engine.status().unwrap();
    assert_eq!(report.blockers, vec!["exit_check".to_string()]);
}

#[tokio::test]
async fn full_run_leaves_a_verifiable_audit_and_event_log() {
    let repo = init_repo();
    let config = fast_config();
    let engine = engine_for(repo.path(), plan_review_def(), &config, vec![review_pass()]);

    engine.start("task", vec!["small diffs".to_string()]).unwrap();
    write_plan(repo.path(), "plan");
    engine
        .complete("plan_file", CompleteOptions::default())
        .await
        .unwrap();
    engine.advance().unwrap();
    engine
        .complete("security_review", CompleteOptions::default())
        .await
        .unwrap();
    assert_eq!(engine.advance().unwrap(), AdvanceOutcome::Terminal);

    let entries = engine.verify_audit().unwrap();
    assert!(entries >= 6, "expected a full trail, got {}", entries);

    let events = engine.events().read_all().unwrap();
    let names: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
    assert!(names.contains(&"workflow_start"));
    assert!(names.contains(&"item_complete"));
    assert!(names.contains(&"phase_transition"));

    // Completed review item carries the metadata consumers read.
    let state = orchestrate::state::load_state(&session_state_path(repo.path())).unwrap();
    let review_item = &state.phases[1].items[0];
    assert_eq!(review_item.status, ItemStatus::Completed);
    assert!(review_item.review_metadata.is_some());
}
