use std::sync::Arc;

use orchestrate::audit::AuditKind;
use orchestrate::definition::{GateDef, SupervisionMode};
use orchestrate::engine::{AdvanceOutcome, CompleteOptions};
use orchestrate::error::OrchError;
use orchestrate::state::{ItemStatus, WorkflowStatus};

mod common;
use common::*;

#[tokio::test]
async fn happy_path_runs_both_phases_to_terminal() {
    let repo = init_repo();
    let config = fast_config();
    let engine = engine_for(repo.path(), plan_review_def(), &config, vec![review_pass()]);

    let state = engine.start("ship the feature", vec![]).unwrap();
    assert_eq!(state.phase_cursor, 0);

    write_plan(repo.path(), "# Plan\n\n1. do the thing\n");
    let outcome = engine
        .complete("plan_file", CompleteOptions::default())
        .await
        .unwrap();
    assert!(outcome.gate.passed);

    assert_eq!(
        engine.advance().unwrap(),
        AdvanceOutcome::NextPhase("review".to_string())
    );

    let outcome = engine
        .complete("security_review", CompleteOptions::default())
        .await
        .unwrap();
    let meta = outcome
        .state
        .current_phase()
        .unwrap()
        .items
        .iter()
        .find(|i| i.id == "security_review")
        .unwrap()
        .review_metadata
        .clone()
        .unwrap();
    assert_eq!(meta.model_used, "primary");
    assert!(!meta.was_fallback);

    assert_eq!(engine.advance().unwrap(), AdvanceOutcome::Terminal);

    let report = engine.status().unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);

    // The audit chain for the whole run verifies.
    assert!(engine.verify_audit().unwrap() > 0);
}

#[tokio::test]
async fn empty_artifact_fails_gate_and_blocks_advance() {
    let repo = init_repo();
    let config = fast_config();
    let engine = engine_for(repo.path(), plan_review_def(), &config, vec![]);

    engine.start("task", vec![]).unwrap();
    write_plan(repo.path(), "");

    let err = engine
        .complete("plan_file", CompleteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchError::GateFailed { .. }));

    let report = engine.status().unwrap();
    assert_eq!(report.blockers, vec!["plan_file".to_string()]);

    // The failed attempt is on the item.
    match engine.advance().unwrap_err() {
        OrchError::PhaseIncomplete { blockers, .. } => {
            assert_eq!(blockers, vec!["plan_file".to_string()])
        }
        other => panic!("expected PhaseIncomplete, got {:?}", other),
    }

    let err = engine
        .complete("plan_file", CompleteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchError::GateFailed { .. }));
}

#[tokio::test]
async fn retry_count_increments_on_each_failed_attempt() {
    let repo = init_repo();
    let config = fast_config();
    let engine = engine_for(repo.path(), plan_review_def(), &config, vec![review_pass()]);

    engine.start("task", vec![]).unwrap();
    write_plan(repo.path(), "");

    let _ = engine.complete("plan_file", CompleteOptions::default()).await;
    let _ = engine.complete("plan_file", CompleteOptions::default()).await;

    // After two failures the file gains content and the item recovers.
    write_plan(repo.path(), "content");
    let outcome = engine
        .complete("plan_file", CompleteOptions::default())
        .await
        .unwrap();
    let item = outcome.state.phases[0]
        .items
        .iter()
        .find(|i| i.id == "plan_file")
        .unwrap();
    assert_eq!(item.status, ItemStatus::Completed);
    assert_eq!(item.retry_count, 2);
}

#[tokio::test]
async fn second_start_in_session_is_rejected() {
    let repo = init_repo();
    let config = fast_config();
    let engine = engine_for(repo.path(), plan_review_def(), &config, vec![]);

    engine.start("first", vec![]).unwrap();
    let err = engine.start("second", vec![]).unwrap_err();
    assert!(matches!(err, OrchError::AlreadyActive(_)));
}

#[tokio::test]
async fn complete_on_completed_item_reports_already_completed() {
    let repo = init_repo();
    let config = fast_config();
    let engine = engine_for(repo.path(), plan_review_def(), &config, vec![]);

    engine.start("task", vec![]).unwrap();
    write_plan(repo.path(), "content");
    engine
        .complete("plan_file", CompleteOptions::default())
        .await
        .unwrap();

    let err = engine
        .complete("plan_file", CompleteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchError::AlreadyCompleted(_)));
}

#[tokio::test]
async fn items_outside_the_active_phase_reject_mutation() {
    let repo = init_repo();
    let config = fast_config();
    let engine = engine_for(repo.path(), plan_review_def(), &config, vec![]);

    engine.start("task", vec![]).unwrap();

    let err = engine
        .complete("security_review", CompleteOptions::default())
        .await
        .unwrap_err();
    match err {
        OrchError::NotCurrentPhase { active_phase, .. } => assert_eq!(active_phase, "plan"),
        other => panic!("expected NotCurrentPhase, got {:?}", other),
    }
}

#[tokio::test]
async fn skip_without_reason_or_permission_fails_and_changes_nothing() {
    let repo = init_repo();
    let config = fast_config();
    let engine = engine_for(repo.path(), plan_review_def(), &config, vec![]);

    engine.start("task", vec![]).unwrap();

    assert!(matches!(
        engine.skip("plan_file", "  "),
        Err(OrchError::MissingReason)
    ));
    // plan_file is not skippable and no override is active.
    assert!(matches!(
        engine.skip("plan_file", "in a hurry"),
        Err(OrchError::NotSkippable(_))
    ));

    let report = engine.status().unwrap();
    assert_eq!(report.next_item.as_deref(), Some("plan_file"));
    assert_eq!(report.blockers, vec!["plan_file".to_string()]);
}

#[tokio::test]
async fn skippable_item_skips_with_reason() {
    let repo = init_repo();
    let config = fast_config();
    let mut def = plan_review_def();
    def.phases[0].items[0].skippable = true;
    let engine = engine_for(repo.path(), def, &config, vec![]);

    engine.start("task", vec![]).unwrap();
    let state = engine.skip("plan_file", "plan exists upstream").unwrap();
    let item = &state.phases[0].items[0];
    assert_eq!(item.status, ItemStatus::Skipped);
    assert_eq!(item.skip_reason.as_deref(), Some("plan exists upstream"));

    // A sanctioned skip satisfies the phase.
    assert_eq!(
        engine.advance().unwrap(),
        AdvanceOutcome::NextPhase("review".to_string())
    );
}

#[tokio::test]
async fn zero_human_mode_bypasses_manual_gate_with_one_audit_record() {
    let repo = init_repo();
    let config = fast_config();
    let mut def = plan_review_def();
    def.settings.supervision_mode = SupervisionMode::ZeroHuman;
    def.phases[0].items.push({
        let mut signoff = item(
            "human_signoff",
            Some(GateDef::Manual {
                rationale_required: true,
            }),
        );
        signoff.risk = orchestrate::definition::RiskLevel::High;
        signoff
    });
    let engine = engine_for(repo.path(), def, &config, vec![]);

    engine.start("task", vec![]).unwrap();
    let outcome = engine
        .complete("human_signoff", CompleteOptions::default())
        .await
        .unwrap();
    assert!(outcome.gate.passed);

    let bypasses: Vec<_> = engine
        .audit()
        .read_all()
        .unwrap()
        .into_iter()
        .filter(|r| r.kind == AuditKind::GateBypass)
        .collect();
    assert_eq!(bypasses.len(), 1);
    assert!(bypasses[0].data["marker"]
        .as_str()
        .unwrap()
        .contains("[ZERO-HUMAN MODE]"));
}

#[tokio::test]
async fn supervised_manual_gate_requires_approval() {
    let repo = init_repo();
    let config = fast_config();
    let mut def = plan_review_def();
    def.phases[0].items.push(item(
        "human_signoff",
        Some(GateDef::Manual {
            rationale_required: true,
        }),
    ));
    let engine = engine_for(repo.path(), def, &config, vec![]);

    engine.start("task", vec![]).unwrap();

    let err = engine
        .complete("human_signoff", CompleteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchError::GateFailed { .. }));

    let outcome = engine
        .complete(
            "human_signoff",
            CompleteOptions {
                approval_rationale: Some("reviewed the diff by hand".to_string()),
                ..CompleteOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(outcome.gate.passed);
}

#[tokio::test]
async fn checkpoint_then_resume_restores_the_snapshot() {
    let repo = init_repo();
    let config = fast_config();
    let engine = engine_for(repo.path(), plan_review_def(), &config, vec![]);

    engine.start("task", vec![]).unwrap();
    write_plan(repo.path(), "content");

    let checkpoint_id = engine
        .checkpoint("before completing plan", vec!["kept scope small".to_string()])
        .unwrap();
    let before = engine.status().unwrap();

    engine
        .complete("plan_file", CompleteOptions::default())
        .await
        .unwrap();
    engine.advance().unwrap();
    assert_eq!(engine.status().unwrap().phase_id.as_deref(), Some("review"));

    let restored = engine.resume(&checkpoint_id).unwrap();
    assert_eq!(restored.phase_cursor, 0);
    assert_eq!(
        restored.phases[0].items[0].status,
        ItemStatus::Pending
    );
    assert_eq!(engine.status().unwrap().phase_id, before.phase_id);
}

#[tokio::test]
async fn resume_from_unknown_checkpoint_fails() {
    let repo = init_repo();
    let config = fast_config();
    let engine = engine_for(repo.path(), plan_review_def(), &config, vec![]);
    engine.start("task", vec![]).unwrap();

    assert!(matches!(
        engine.resume("1700000000000-beef"),
        Err(OrchError::CheckpointNotFound(_))
    ));
}

#[tokio::test]
async fn finish_requires_all_phases_unless_abandoned() {
    let repo = init_repo();
    let config = fast_config();
    let engine = engine_for(repo.path(), plan_review_def(), &config, vec![]);

    engine.start("task", vec![]).unwrap();

    match engine.finish(false).unwrap_err() {
        OrchError::NotAllPhasesComplete(phases) => {
            assert!(phases.contains(&"plan".to_string()));
            assert!(phases.contains(&"review".to_string()));
        }
        other => panic!("expected NotAllPhasesComplete, got {:?}", other),
    }

    let state = engine.finish(true).unwrap();
    assert_eq!(state.status, WorkflowStatus::Abandoned);

    // Terminal workflows refuse further mutation.
    assert!(matches!(engine.advance(), Err(OrchError::AtTerminal)));
    assert!(matches!(engine.finish(true), Err(OrchError::AlreadyTerminal)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_completes_serialize_to_one_winner() {
    let repo = init_repo();
    let config = fast_config();
    let engine = Arc::new(engine_for(repo.path(), plan_review_def(), &config, vec![]));

    engine.start("task", vec![]).unwrap();
    write_plan(repo.path(), "content");

    let a = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .complete("plan_file", CompleteOptions::default())
                .await
        })
    };
    let b = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .complete("plan_file", CompleteOptions::default())
                .await
        })
    };

    let results = [a.await.unwrap(), b.await.unwrap()];
    let wins = results.iter().filter(|r| r.is_ok()).count();
    let already = results
        .iter()
        .filter(|r| matches!(r, Err(OrchError::AlreadyCompleted(_))))
        .count();
    assert_eq!(wins, 1, "exactly one writer commits");
    assert_eq!(already, 1, "the loser observes the committed state");

    // The committed state is intact: one completion, no retries recorded.
    let report = engine.status().unwrap();
    assert!(report.blockers.is_empty());
}
