use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditKind, AuditLog};
use crate::checkpoint::CheckpointStore;
use crate::config::OrchestrateConfig;
use crate::definition::{GateDef, ItemDef, WorkflowDef};
use crate::error::{OrchError, OrchResult};
use crate::events::EventLog;
use crate::gate::{self, GateContext, GateResult};
use crate::lock::{LockManager, LockMode};
use crate::mode::{self, ManualDisposition, SupervisionPolicy, ZERO_HUMAN_MARKER};
use crate::paths::Paths;
use crate::review::{
    evaluate_quorum, ReviewContext, ReviewExecutor, ReviewRequest, ReviewRouter,
};
use crate::session::short_id;
use crate::state::{
    self, GateRecord, ItemState, ItemStatus, PhaseState, PhaseStatus, ReviewMetadata,
    WorkflowState, WorkflowStatus,
};
use crate::{log_info, log_warn};

/// Fallback salt when the configured env var is unset. Telemetry ids stay
/// deterministic per workflow either way.
const DEFAULT_TELEMETRY_SALT: &str = "orchestrate-default-salt";

/// Result of a `complete` call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompleteOutcome {
    pub state: WorkflowState,
    pub gate: GateRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceOutcome {
    NextPhase(String),
    Terminal,
}

/// What `status` reports to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub workflow_id: String,
    pub telemetry_id: String,
    pub task: String,
    pub status: WorkflowStatus,
    pub phase_id: Option<String>,
    pub phase_index: usize,
    pub total_phases: usize,
    pub next_item: Option<String>,
    pub gate_hint: Option<String>,
    pub blockers: Vec<String>,
    pub read_from_legacy: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CompleteOptions {
    pub notes: Option<String>,
    pub completed_by: Option<String>,
    pub approval_rationale: Option<String>,
}

/// The workflow state machine. One engine instance owns a session's state
/// file while holding its advisory lock; every public operation serializes
/// through that lock, while gate commands and review calls run outside it.
pub struct WorkflowEngine<E: ReviewExecutor> {
    def: WorkflowDef,
    paths: Paths,
    locks: Arc<LockManager>,
    audit: AuditLog,
    events: EventLog,
    checkpoints: CheckpointStore,
    router: ReviewRouter<E>,
    policy: SupervisionPolicy,
    lock_timeout: Duration,
    output_cap: usize,
    cancel: CancellationToken,
}

impl<E: ReviewExecutor> WorkflowEngine<E> {
    /// Wire an engine for a session. Dependencies are built here once and
    /// passed down explicitly; nothing engine-scoped lives in globals.
    pub fn for_session(
        def: WorkflowDef,
        paths: Paths,
        config: &OrchestrateConfig,
        executor: E,
    ) -> OrchResult<Self> {
        let lock_timeout = Duration::from_secs(config.execution.lock_timeout_secs);
        let locks = Arc::new(LockManager::new(paths.locks_dir()?));

        let audit = AuditLog::new(paths.audit_file()?, Arc::clone(&locks), lock_timeout);
        let events = EventLog::new(paths.log_file()?, paths.find_legacy_log_file());
        let checkpoints = CheckpointStore::new(
            paths.checkpoints_dir()?,
            paths.find_legacy_checkpoints_dir(),
            Arc::clone(&locks),
            lock_timeout,
        );
        let router = ReviewRouter::new(executor, config.retry.clone());

        let supervision = config
            .supervision
            .mode
            .unwrap_or(def.settings.supervision_mode);
        let policy = SupervisionPolicy::new(supervision);

        Ok(Self {
            def,
            paths,
            locks,
            audit,
            events,
            checkpoints,
            router,
            policy,
            lock_timeout,
            output_cap: config.execution.command_output_cap_bytes,
            cancel: CancellationToken::new(),
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn definition(&self) -> &WorkflowDef {
        &self.def
    }

    // --- Start ---

    /// Create a new workflow in this session. Fails with `AlreadyActive`
    /// when a non-terminal workflow exists (including one only visible
    /// through the legacy layout).
    pub fn start(&self, task: &str, constraints: Vec<String>) -> OrchResult<WorkflowState> {
        let _lock = self
            .locks
            .acquire("state", LockMode::Exclusive, self.lock_timeout)?;

        if let Some((existing, _)) = self.load_current_state_opt()? {
            if !existing.status.is_terminal() {
                return Err(OrchError::AlreadyActive(existing.workflow_id));
            }
        }

        let now = chrono::Utc::now().to_rfc3339();
        let phases: Vec<PhaseState> = self
            .def
            .phases
            .iter()
            .enumerate()
            .map(|(index, phase)| PhaseState {
                id: phase.id.clone(),
                status: if index == 0 {
                    PhaseStatus::InProgress
                } else {
                    PhaseStatus::Pending
                },
                started_at: (index == 0).then(|| now.clone()),
                completed_at: None,
                items: phase
                    .items
                    .iter()
                    .map(|item| ItemState {
                        id: item.id.clone(),
                        ..ItemState::default()
                    })
                    .collect(),
            })
            .collect();

        let state = WorkflowState {
            workflow_id: short_id(),
            task: task.to_string(),
            constraints,
            status: WorkflowStatus::Active,
            phase_cursor: 0,
            created_at: now.clone(),
            updated_at: now,
            metadata: serde_json::Map::new(),
            phases,
        };

        self.audit_mode_detection()?;
        self.persist(&state)?;
        self.audit.append(
            AuditKind::WorkflowStart,
            json!({"workflow_id": &state.workflow_id, "task": &state.task}),
        )?;
        self.events.emit(
            "workflow_start",
            json!({"workflow_id": &state.workflow_id, "task": &state.task}),
        )?;
        log_info!(
            "Started workflow {} in phase '{}'",
            state.workflow_id,
            state.phases[0].id
        );
        Ok(state)
    }

    // --- Status ---

    pub fn status(&self) -> OrchResult<StatusReport> {
        let _lock = self
            .locks
            .acquire("state", LockMode::Shared, self.lock_timeout)?;
        let (state, from_legacy) = self.load_current_state()?;

        let phase_def = state
            .current_phase()
            .and_then(|p| self.def.phase(&p.id));
        let next_item = state.current_phase().and_then(|phase| {
            phase
                .items
                .iter()
                .find(|i| !i.status.is_terminal())
                .map(|i| i.id.clone())
        });
        let gate_hint = next_item.as_deref().and_then(|item_id| {
            let phase = state.current_phase()?;
            let item = self.def.item(&phase.id, item_id)?;
            item.verification.as_ref().map(gate_hint_for)
        });

        Ok(StatusReport {
            telemetry_id: self.telemetry_id(&state.workflow_id),
            workflow_id: state.workflow_id.clone(),
            task: state.task.clone(),
            status: state.status,
            phase_id: state.current_phase().map(|p| p.id.clone()),
            phase_index: state.phase_cursor,
            total_phases: state.phases.len(),
            next_item,
            gate_hint: gate_hint.or_else(|| {
                phase_def.map(|p| format!("phase type: {:?}", p.phase_type))
            }),
            blockers: self.phase_blockers(&state),
            read_from_legacy: from_legacy,
        })
    }

    // --- Complete ---

    /// Complete an item: run its gate (or dispatch its review) and apply
    /// the verdict. The gate executes outside the state lock; the item is
    /// re-validated before the result lands.
    pub async fn complete(
        &self,
        item_id: &str,
        options: CompleteOptions,
    ) -> OrchResult<CompleteOutcome> {
        // Phase 1: validate under the lock and snapshot what the gate needs.
        let (item_def, breaking_change) = {
            let _lock = self
                .locks
                .acquire("state", LockMode::Exclusive, self.lock_timeout)?;
            let (state, _) = self.load_current_state()?;
            let item_def = self.validate_item_actionable(&state, item_id)?;
            let breaking = state
                .metadata
                .get("breaking_change")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            (item_def, breaking)
        };

        // Phase 2: evaluate outside the lock.
        let verdict = self
            .evaluate_item(&item_def, &options, breaking_change)
            .await?;

        // Phase 3: re-validate and apply under the lock.
        let _lock = self
            .locks
            .acquire("state", LockMode::Exclusive, self.lock_timeout)?;
        let (mut state, _) = self.load_current_state()?;
        self.validate_item_actionable(&state, item_id)?;

        let gate_record = verdict.gate.to_record();
        let passed = verdict.gate.passed;
        let now = chrono::Utc::now().to_rfc3339();

        {
            let item = state
                .current_item_mut(item_id)
                .ok_or_else(|| OrchError::ItemNotFound(item_id.to_string()))?;
            item.gate_result = Some(gate_record.clone());
            item.notes = options.notes.clone();
            item.review_metadata = verdict.review_metadata.clone();
            if passed {
                item.status = ItemStatus::Completed;
                item.completed_at = Some(now.clone());
                item.completed_by = options.completed_by.clone();
            } else {
                item.status = ItemStatus::Failed;
                item.retry_count += 1;
            }
        }
        state.updated_at = now;
        self.persist(&state)?;

        // One audit line per transition; bypassed manual gates record the
        // dedicated bypass kind instead of a plain pass.
        if verdict.bypassed {
            self.audit.append(
                AuditKind::GateBypass,
                json!({"item_id": item_id, "marker": ZERO_HUMAN_MARKER}),
            )?;
        } else if passed {
            self.audit.append(
                AuditKind::GatePass,
                json!({"item_id": item_id, "details": &gate_record.details}),
            )?;
        } else {
            self.audit.append(
                AuditKind::GateFail,
                json!({"item_id": item_id, "details": &gate_record.details}),
            )?;
        }

        if passed {
            self.audit.append(
                AuditKind::ItemComplete,
                json!({"item_id": item_id, "notes": options.notes}),
            )?;
            self.events
                .emit("item_complete", json!({"item_id": item_id}))?;
            Ok(CompleteOutcome {
                state,
                gate: gate_record,
            })
        } else {
            self.events.emit(
                "item_failed",
                json!({"item_id": item_id, "details": &gate_record.details}),
            )?;
            Err(OrchError::GateFailed {
                item_id: item_id.to_string(),
                detail: gate_record.details.join("; "),
            })
        }
    }

    // --- Skip ---

    pub fn skip(&self, item_id: &str, reason: &str) -> OrchResult<WorkflowState> {
        if reason.trim().is_empty() {
            return Err(OrchError::MissingReason);
        }

        let _lock = self
            .locks
            .acquire("state", LockMode::Exclusive, self.lock_timeout)?;
        let (mut state, _) = self.load_current_state()?;
        let item_def = self.validate_item_actionable(&state, item_id)?;

        let forced = !item_def.skippable;
        if forced && !self.policy.may_force_skip() {
            return Err(OrchError::NotSkippable(item_id.to_string()));
        }

        let now = chrono::Utc::now().to_rfc3339();
        {
            let item = state
                .current_item_mut(item_id)
                .ok_or_else(|| OrchError::ItemNotFound(item_id.to_string()))?;
            item.status = ItemStatus::Skipped;
            item.skip_reason = Some(reason.to_string());
        }
        state.updated_at = now;
        self.persist(&state)?;

        if forced {
            self.audit.append(
                AuditKind::EmergencyOverride,
                json!({"item_id": item_id, "action": "skip_non_skippable", "reason": reason}),
            )?;
        }
        self.audit.append(
            AuditKind::ItemSkip,
            json!({"item_id": item_id, "reason": reason, "forced": forced}),
        )?;
        self.events
            .emit("item_skip", json!({"item_id": item_id, "reason": reason}))?;
        Ok(state)
    }

    // --- Advance ---

    /// Move to the next phase, provided every required item in the current
    /// phase is terminal in a sanctioned way and review quorum holds.
    pub fn advance(&self) -> OrchResult<AdvanceOutcome> {
        let _lock = self
            .locks
            .acquire("state", LockMode::Exclusive, self.lock_timeout)?;
        let (mut state, _) = self.load_current_state()?;

        if state.status.is_terminal() {
            return Err(OrchError::AtTerminal);
        }
        let phase_id = state
            .current_phase()
            .map(|p| p.id.clone())
            .ok_or(OrchError::AtTerminal)?;

        // Quorum first: an unmet review quorum names the real problem even
        // when the failed review items would also show up as blockers.
        self.enforce_quorum(&state, &phase_id)?;

        let blockers = self.phase_blockers(&state);
        if !blockers.is_empty() {
            return Err(OrchError::PhaseIncomplete { phase_id, blockers });
        }

        let now = chrono::Utc::now().to_rfc3339();
        if let Some(phase) = state.current_phase_mut() {
            phase.status = PhaseStatus::Completed;
            phase.completed_at = Some(now.clone());
        }

        let outcome = if state.phase_cursor + 1 >= state.phases.len() {
            state.status = WorkflowStatus::Completed;
            state.phase_cursor = state.phases.len();
            self.audit.append(
                AuditKind::WorkflowFinish,
                json!({"workflow_id": &state.workflow_id, "abandoned": false}),
            )?;
            AdvanceOutcome::Terminal
        } else {
            state.phase_cursor += 1;
            let next_id = {
                let phase = state
                    .current_phase_mut()
                    .expect("cursor bounds checked above");
                phase.status = PhaseStatus::InProgress;
                phase.started_at = Some(now.clone());
                phase.id.clone()
            };
            self.audit.append(
                AuditKind::PhaseTransition,
                json!({"from": &phase_id, "to": &next_id}),
            )?;
            AdvanceOutcome::NextPhase(next_id)
        };

        state.updated_at = now;
        self.persist(&state)?;
        self.events.emit(
            "phase_transition",
            json!({"from": &phase_id, "terminal": outcome == AdvanceOutcome::Terminal}),
        )?;
        Ok(outcome)
    }

    // --- Finish ---

    pub fn finish(&self, abandon: bool) -> OrchResult<WorkflowState> {
        let _lock = self
            .locks
            .acquire("state", LockMode::Exclusive, self.lock_timeout)?;
        let (mut state, _) = self.load_current_state()?;

        if state.status.is_terminal() {
            return Err(OrchError::AlreadyTerminal);
        }

        if !abandon {
            let incomplete: Vec<String> = state
                .phases
                .iter()
                .filter(|p| {
                    !matches!(p.status, PhaseStatus::Completed | PhaseStatus::Skipped)
                })
                .map(|p| p.id.clone())
                .collect();
            if !incomplete.is_empty() {
                return Err(OrchError::NotAllPhasesComplete(incomplete));
            }
        }

        state.status = if abandon {
            WorkflowStatus::Abandoned
        } else {
            WorkflowStatus::Completed
        };
        state.updated_at = chrono::Utc::now().to_rfc3339();
        self.persist(&state)?;

        self.audit.append(
            AuditKind::WorkflowFinish,
            json!({"workflow_id": &state.workflow_id, "abandoned": abandon}),
        )?;
        self.events.emit(
            "workflow_finish",
            json!({"workflow_id": &state.workflow_id, "abandoned": abandon}),
        )?;
        Ok(state)
    }

    // --- Checkpoint / Resume ---

    pub fn checkpoint(&self, label: &str, decisions: Vec<String>) -> OrchResult<String> {
        let _lock = self
            .locks
            .acquire("state", LockMode::Exclusive, self.lock_timeout)?;
        let (state, _) = self.load_current_state()?;

        let manifest = self.file_manifest();
        let summary = format!(
            "task: {}; phase {}/{}",
            state.task,
            state.phase_cursor + 1,
            state.phases.len()
        );
        let parent = state
            .metadata
            .get("last_checkpoint_id")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);

        let id = self.checkpoints.create(
            label,
            parent.as_deref(),
            decisions,
            manifest,
            summary,
            &state,
        )?;

        let mut state = state;
        state.metadata.insert(
            "last_checkpoint_id".to_string(),
            serde_json::Value::String(id.clone()),
        );
        state.updated_at = chrono::Utc::now().to_rfc3339();
        self.persist(&state)?;

        self.audit.append(
            AuditKind::CheckpointCreated,
            json!({"checkpoint_id": &id, "label": label}),
        )?;
        self.events
            .emit("checkpoint_created", json!({"checkpoint_id": &id}))?;
        Ok(id)
    }

    pub fn resume(&self, checkpoint_id: &str) -> OrchResult<WorkflowState> {
        let _lock = self
            .locks
            .acquire("state", LockMode::Exclusive, self.lock_timeout)?;

        let checkpoint = self.checkpoints.load(checkpoint_id)?;
        let state = checkpoint.state_snapshot;
        self.persist(&state)?;

        self.audit.append(
            AuditKind::WorkflowStart,
            json!({
                "workflow_id": &state.workflow_id,
                "resumed_from": checkpoint_id,
            }),
        )?;
        self.events.emit(
            "workflow_resumed",
            json!({"checkpoint_id": checkpoint_id}),
        )?;
        Ok(state)
    }

    pub fn verify_audit(&self) -> OrchResult<usize> {
        self.audit.verify_chain()
    }

    // --- Internals ---

    fn telemetry_id(&self, workflow_id: &str) -> String {
        let salt = std::env::var(&self.def.settings.salt_env_var)
            .unwrap_or_else(|_| DEFAULT_TELEMETRY_SALT.to_string());
        let mut buf = Vec::new();
        buf.extend_from_slice(salt.as_bytes());
        buf.extend_from_slice(workflow_id.as_bytes());
        state::sha256_hex(&buf)[..16].to_string()
    }

    fn file_manifest(&self) -> Vec<String> {
        ["state.json", "log.jsonl", "audit.jsonl", "meta.json"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    /// Load state with legacy dual-read: prefer the session path, fall
    /// back to `.workflow_state.json`. Legacy files are never written.
    fn load_current_state(&self) -> OrchResult<(WorkflowState, bool)> {
        self.load_current_state_opt()?.ok_or(OrchError::NoSession)
    }

    fn load_current_state_opt(&self) -> OrchResult<Option<(WorkflowState, bool)>> {
        let state_file = self.paths.state_file()?;
        if state_file.exists() {
            return Ok(Some((state::load_state(&state_file)?, false)));
        }
        if let Some(legacy) = self.paths.find_legacy_state_file() {
            log_warn!(
                "Reading legacy state from {}; next write goes to the session layout",
                legacy.display()
            );
            return Ok(Some((state::load_legacy_state(&legacy)?, true)));
        }
        Ok(None)
    }

    /// Write-through target is always the session path.
    fn persist(&self, state: &WorkflowState) -> OrchResult<()> {
        self.paths.ensure_session_dir()?;
        state::save_state(state, &self.paths.state_file()?)
    }

    fn audit_mode_detection(&self) -> OrchResult<()> {
        if mode::first_detection_in_process() {
            let detection = mode::detect(None);
            self.audit.append(
                AuditKind::ModeDetected,
                serde_json::to_value(&detection)?,
            )?;
        }
        Ok(())
    }

    /// Checks shared by complete and skip. Returns the item's definition.
    fn validate_item_actionable(
        &self,
        state: &WorkflowState,
        item_id: &str,
    ) -> OrchResult<ItemDef> {
        if state.status.is_terminal() {
            return Err(OrchError::AlreadyTerminal);
        }
        let phase = state.current_phase().ok_or(OrchError::AtTerminal)?;

        let item_state = match phase.items.iter().find(|i| i.id == item_id) {
            Some(item) => item,
            None if state.contains_item(item_id) => {
                return Err(OrchError::NotCurrentPhase {
                    item_id: item_id.to_string(),
                    active_phase: phase.id.clone(),
                })
            }
            None => return Err(OrchError::ItemNotFound(item_id.to_string())),
        };

        match item_state.status {
            ItemStatus::Completed => Err(OrchError::AlreadyCompleted(item_id.to_string())),
            ItemStatus::Skipped => Err(OrchError::AlreadyCompleted(item_id.to_string())),
            _ => self
                .def
                .item(&phase.id, item_id)
                .cloned()
                .ok_or_else(|| OrchError::ItemNotFound(item_id.to_string())),
        }
    }

    /// Required items that are not yet terminal in a sanctioned way.
    fn phase_blockers(&self, state: &WorkflowState) -> Vec<String> {
        let Some(phase) = state.current_phase() else {
            return Vec::new();
        };
        let Some(phase_def) = self.def.phase(&phase.id) else {
            return Vec::new();
        };

        phase
            .items
            .iter()
            .filter(|item| {
                let required = phase_def
                    .items
                    .iter()
                    .find(|d| d.id == item.id)
                    .map(|d| d.required)
                    .unwrap_or(true);
                if !required {
                    return false;
                }
                match item.status {
                    ItemStatus::Completed => false,
                    ItemStatus::Skipped => item
                        .skip_reason
                        .as_deref()
                        .map(|r| r.trim().is_empty())
                        .unwrap_or(true),
                    _ => true,
                }
            })
            .map(|item| item.id.clone())
            .collect()
    }

    /// Review quorum for phases that carry review items.
    fn enforce_quorum(&self, state: &WorkflowState, phase_id: &str) -> OrchResult<()> {
        let Some(phase_def) = self.def.phase(phase_id) else {
            return Ok(());
        };
        let review_item_ids: Vec<&str> = phase_def
            .items
            .iter()
            .filter(|i| i.review_type.is_some())
            .map(|i| i.id.as_str())
            .collect();
        let review = &self.def.settings.review;
        if review_item_ids.is_empty() || review.required_reviews.is_empty() {
            return Ok(());
        }

        // Quorum speaks only once every review item has been attempted;
        // until then the pending items surface as ordinary blockers.
        let all_attempted = state
            .current_phase()
            .map(|phase| {
                phase
                    .items
                    .iter()
                    .filter(|i| review_item_ids.contains(&i.id.as_str()))
                    .all(|i| i.status.is_terminal())
            })
            .unwrap_or(false);
        if !all_attempted {
            return Ok(());
        }

        // A review type counts only when its executor actually succeeded;
        // items completed under the warn policy still carry an error_type.
        let succeeded: HashSet<String> = state
            .current_phase()
            .map(|phase| {
                phase
                    .items
                    .iter()
                    .filter(|i| i.status == ItemStatus::Completed)
                    .filter_map(|i| i.review_metadata.as_ref())
                    .filter(|m| m.error_type.is_none())
                    .map(|m| m.review_type.clone())
                    .collect()
            })
            .unwrap_or_default();

        let outcome = evaluate_quorum(review, &succeeded);
        if outcome.met {
            return Ok(());
        }

        match outcome.on_insufficient {
            crate::definition::OnInsufficient::Block => Err(OrchError::ReviewThreshold {
                satisfied: outcome.satisfied,
                required: outcome.required,
            }),
            crate::definition::OnInsufficient::Warn => {
                log_warn!(
                    "Review quorum not met ({}/{}); advancing per warn policy",
                    outcome.satisfied,
                    outcome.required
                );
                self.audit.append(
                    AuditKind::ReviewCompleted,
                    json!({
                        "phase_id": phase_id,
                        "quorum_met": false,
                        "satisfied": outcome.satisfied,
                        "required": outcome.required,
                        "policy": "warn",
                    }),
                )?;
                Ok(())
            }
        }
    }

    /// Evaluate whatever stands between an item and completion: its gate,
    /// its review, or nothing.
    async fn evaluate_item(
        &self,
        item_def: &ItemDef,
        options: &CompleteOptions,
        breaking_change: bool,
    ) -> OrchResult<ItemVerdict> {
        if let Some(ref review_type) = item_def.review_type {
            return self.run_review(review_type).await;
        }

        let Some(ref gate_def) = item_def.verification else {
            return Ok(ItemVerdict {
                gate: GateResult::pass("no verification gate"),
                review_metadata: None,
                bypassed: false,
            });
        };

        let effective = self.resolve_gate(gate_def)?;
        let disposition = self
            .policy
            .manual_gate_disposition(item_def.risk, breaking_change);
        let ctx = GateContext {
            base_path: self.paths.repo_root().to_path_buf(),
            manual_disposition: disposition,
            approval_rationale: options.approval_rationale.clone(),
            output_cap: self.output_cap,
            cancel: self.cancel.clone(),
        };

        let result = gate::evaluate(&effective, &ctx).await?;
        let bypassed = matches!(effective, GateDef::Manual { .. })
            && disposition == ManualDisposition::AutoPass
            && result.details.iter().any(|d| d == ZERO_HUMAN_MARKER);
        Ok(ItemVerdict {
            gate: result,
            review_metadata: None,
            bypassed,
        })
    }

    /// Substitute command templates at evaluation time.
    fn resolve_gate(&self, gate_def: &GateDef) -> OrchResult<GateDef> {
        Ok(match gate_def {
            GateDef::Command {
                argv,
                expect_exit_code,
                timeout_s,
                stdin,
                env_overlay,
            } => GateDef::Command {
                argv: gate::substitute_templates(argv, &self.def.settings)?,
                expect_exit_code: *expect_exit_code,
                timeout_s: *timeout_s,
                stdin: stdin.clone(),
                env_overlay: env_overlay.clone(),
            },
            GateDef::Composite { op, children } => GateDef::Composite {
                op: *op,
                children: children
                    .iter()
                    .map(|c| self.resolve_gate(c))
                    .collect::<OrchResult<Vec<_>>>()?,
            },
            other => other.clone(),
        })
    }

    async fn run_review(&self, review_type: &str) -> OrchResult<ItemVerdict> {
        let review = &self.def.settings.review;
        let chain = review
            .fallback_chains
            .get(review_type)
            .cloned()
            .unwrap_or_default();
        let Some((primary, fallbacks)) = chain.split_first() else {
            return Ok(ItemVerdict {
                gate: GateResult::fail(format!(
                    "no fallback chain configured for review type '{}'",
                    review_type
                )),
                review_metadata: None,
                bypassed: false,
            });
        };

        let (state, _) = self.load_current_state()?;
        let request = ReviewRequest {
            review_type: review_type.to_string(),
            context: ReviewContext {
                diff: String::new(),
                files: Vec::new(),
                task: state.task.clone(),
                constraints: state.constraints.clone(),
                phase_notes: state
                    .current_phase()
                    .map(|p| {
                        p.items
                            .iter()
                            .filter_map(|i| i.notes.clone())
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            primary_model: primary.clone(),
            fallback_chain: fallbacks.to_vec(),
        };

        self.audit.append(
            AuditKind::ReviewStarted,
            json!({"review_type": review_type, "model": primary}),
        )?;

        let result = self
            .router
            .dispatch(&request, review.max_fallback_attempts, &self.cancel)
            .await?;

        self.audit.append(
            AuditKind::ReviewCompleted,
            json!({
                "review_type": review_type,
                "model": &result.model,
                "success": result.success,
                "was_fallback": result.was_fallback,
                "fallback_reason": &result.fallback_reason,
                "error_type": result.error_type.map(|e| e.to_string()),
            }),
        )?;

        let metadata = ReviewMetadata {
            review_type: review_type.to_string(),
            model_used: result.model.clone().unwrap_or_default(),
            was_fallback: result.was_fallback,
            fallback_reason: result.fallback_reason.clone(),
            fallbacks_tried: result.fallbacks_tried.clone(),
            error_type: result.error_type.map(|e| e.to_string()),
            raw_output_ref: None,
        };

        let gate = if result.success {
            GateResult::pass(format!(
                "review '{}' passed via {}",
                review_type,
                result.model.as_deref().unwrap_or("?")
            ))
        } else if review.on_insufficient == crate::definition::OnInsufficient::Warn {
            // Warn policy: the item completes, but the shortfall is on the
            // record, never silent.
            log_warn!(
                "Review '{}' failed ({}); completing item per warn policy",
                review_type,
                result
                    .error_type
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string())
            );
            self.audit.append(
                AuditKind::ReviewCompleted,
                json!({
                    "review_type": review_type,
                    "policy": "warn",
                    "completed_despite_failure": true,
                    "error_type": result.error_type.map(|e| e.to_string()),
                }),
            )?;
            GateResult::pass(format!(
                "review '{}' failed but completed per warn policy",
                review_type
            ))
        } else {
            let mut detail = format!(
                "review '{}' failed: {}",
                review_type,
                result
                    .error_type
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string())
            );
            if let Some(hint) = result.error_type.and_then(|e| e.remediation_hint(None)) {
                detail.push_str(&format!(" ({})", hint));
            }
            GateResult::fail(detail)
        };

        Ok(ItemVerdict {
            gate,
            review_metadata: Some(metadata),
            bypassed: false,
        })
    }
}

struct ItemVerdict {
    gate: GateResult,
    review_metadata: Option<ReviewMetadata>,
    bypassed: bool,
}

fn gate_hint_for(gate: &GateDef) -> String {
    match gate {
        GateDef::Artifact { path, validator, .. } => {
            format!("artifact gate: {} ({:?})", path, validator)
        }
        GateDef::Command { argv, .. } => format!("command gate: {}", argv.join(" ")),
        GateDef::Manual { .. } => "manual approval gate".to_string(),
        GateDef::Composite { op, children } => {
            format!("composite {:?} gate with {} children", op, children.len())
        }
    }
}
