#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;

use orchestrate::config::{OrchestrateConfig, RetryConfig};
use orchestrate::definition::{
    ArtifactValidator, GateDef, ItemDef, OnInsufficient, PhaseDef, PhaseType, ReviewSettings,
    RiskLevel, Settings, SupervisionMode, WorkflowDef,
};
use orchestrate::engine::WorkflowEngine;
use orchestrate::paths::{PathMode, Paths};
use orchestrate::review::{
    ExecutorError, ExecutorResponse, MockReviewExecutor, ReviewErrorType,
};
use orchestrate::session::SessionManager;

/// Creates a temp directory that looks like a repo root (has `.git/`).
pub fn init_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join(".git")).unwrap();
    dir
}

/// Retry config tuned for tests: real semantics, millisecond delays.
pub fn fast_config() -> OrchestrateConfig {
    OrchestrateConfig {
        retry: RetryConfig {
            base_delay_ms: 1,
            factor: 2,
            max_attempts: 3,
            jitter: 0.0,
            call_timeout_secs: 5,
        },
        ..OrchestrateConfig::default()
    }
}

pub fn item(id: &str, gate: Option<GateDef>) -> ItemDef {
    ItemDef {
        id: id.to_string(),
        name: format!("Test item {}", id),
        description: String::new(),
        required: true,
        skippable: false,
        risk: RiskLevel::Low,
        verification: gate,
        review_type: None,
        notes: vec![],
    }
}

pub fn review_item(id: &str, review_type: &str) -> ItemDef {
    ItemDef {
        review_type: Some(review_type.to_string()),
        ..item(id, None)
    }
}

pub fn phase(id: &str, items: Vec<ItemDef>) -> PhaseDef {
    PhaseDef {
        id: id.to_string(),
        name: id.to_uppercase(),
        description: String::new(),
        phase_type: PhaseType::Strict,
        intended_tools: vec![],
        notes: vec![],
        items,
    }
}

pub fn artifact_gate(path: &str) -> GateDef {
    GateDef::Artifact {
        path: path.to_string(),
        validator: ArtifactValidator::NotEmpty,
        base_path: None,
    }
}

/// The scenario definition used across the engine tests: a PLAN phase
/// gated on `docs/plan.md` and a REVIEW phase requiring a `security`
/// review with quorum 1.
pub fn plan_review_def() -> WorkflowDef {
    WorkflowDef {
        name: "changes".to_string(),
        version: "1".to_string(),
        settings: Settings {
            supervision_mode: SupervisionMode::Supervised,
            review: ReviewSettings {
                required_reviews: vec!["security".to_string()],
                minimum_required: 1,
                fallback_chains: [(
                    "security".to_string(),
                    vec!["primary".to_string(), "backup".to_string()],
                )]
                .into_iter()
                .collect(),
                on_insufficient: OnInsufficient::Block,
                max_fallback_attempts: 2,
            },
            ..Settings::default()
        },
        phases: vec![
            phase("plan", vec![item("plan_file", Some(artifact_gate("docs/plan.md")))]),
            phase("review", vec![review_item("security_review", "security")]),
        ],
    }
}

/// Create a session in the repo and wire an engine over the mock executor.
pub fn engine_for(
    repo: &Path,
    def: WorkflowDef,
    config: &OrchestrateConfig,
    review_results: Vec<Result<ExecutorResponse, ExecutorError>>,
) -> WorkflowEngine<MockReviewExecutor> {
    let paths = Paths::new(repo, None, PathMode::Normal).unwrap();
    let manager = SessionManager::new(paths.clone(), Duration::from_secs(5));
    let session_id = match manager.get_current().unwrap() {
        Some(id) => id,
        None => manager.create_session().unwrap(),
    };
    let executor = MockReviewExecutor::new(review_results);
    WorkflowEngine::for_session(def, paths.with_session(&session_id), config, executor).unwrap()
}

pub fn review_pass() -> Result<ExecutorResponse, ExecutorError> {
    Ok(ExecutorResponse {
        raw_output: "{\"verdict\":\"pass\"}".to_string(),
        ..ExecutorResponse::default()
    })
}

pub fn review_rate_limited() -> Result<ExecutorResponse, ExecutorError> {
    Err(ExecutorError::new(ReviewErrorType::RateLimited, "HTTP 429"))
}

pub fn review_key_invalid() -> Result<ExecutorResponse, ExecutorError> {
    Err(ExecutorError::new(ReviewErrorType::KeyInvalid, "HTTP 401"))
}

/// Write the plan artifact the PLAN phase gate checks.
pub fn write_plan(repo: &Path, contents: &str) {
    let docs = repo.join("docs");
    std::fs::create_dir_all(&docs).unwrap();
    std::fs::write(docs.join("plan.md"), contents).unwrap();
}

/// Path to the current session's state.json.
pub fn session_state_path(repo: &Path) -> std::path::PathBuf {
    let paths = Paths::new(repo, None, PathMode::Normal).unwrap();
    let manager = SessionManager::new(paths.clone(), Duration::from_secs(5));
    let id = manager.get_current().unwrap().expect("a session exists");
    paths.with_session(&id).state_file().unwrap()
}
