use std::path::PathBuf;
use std::time::Duration;

/// Error enum for every failure a public orchestrate operation can return.
///
/// Categories:
/// - Integrity: state/audit corruption, never downgraded to warnings
/// - Concurrency: lock acquisition and session contention
/// - Policy: state-machine rule violations, surfaced unchanged to the caller
/// - Gate: verification failures and unsafe gate inputs
/// - Review: external review dispatch failures
/// - Environment: missing repo markers or artifacts
#[derive(Debug, thiserror::Error)]
pub enum OrchError {
    // Integrity -- never downgraded
    #[error("State integrity check failed for {path}: {detail}")]
    StateIntegrity { path: PathBuf, detail: String },

    #[error("State version '{found}' is incompatible (expected major {expected_major})")]
    StateVersion { found: String, expected_major: u32 },

    #[error("Audit chain broken at seq {seq}: {detail}")]
    AuditTamper { seq: u64, detail: String },

    // Concurrency
    #[error("Lock '{name}' timed out after {timeout:?}")]
    LockTimeout { name: String, timeout: Duration },

    #[error("Refusing lock path {0}: not a regular file location")]
    LockPathNotSafe(PathBuf),

    #[error("Lock ordering violation: '{requested}' after '{held}'")]
    LockCycle { requested: String, held: String },

    #[error("Session conflict: {0}")]
    SessionConflict(String),

    // Policy
    #[error("Item '{item_id}' is not in the active phase '{active_phase}'")]
    NotCurrentPhase { item_id: String, active_phase: String },

    #[error("Phase '{phase_id}' incomplete; blockers: {}", blockers.join(", "))]
    PhaseIncomplete { phase_id: String, blockers: Vec<String> },

    #[error("Item '{0}' is not skippable")]
    NotSkippable(String),

    #[error("Skip requires a non-empty reason")]
    MissingReason,

    #[error("Workflow is already terminal")]
    AlreadyTerminal,

    #[error("A non-terminal workflow already exists in this session: {0}")]
    AlreadyActive(String),

    #[error("Item '{0}' is already completed")]
    AlreadyCompleted(String),

    #[error("Workflow is already at the terminal phase")]
    AtTerminal,

    #[error("Cannot finish: phases incomplete: {}", .0.join(", "))]
    NotAllPhasesComplete(Vec<String>),

    // Gate
    #[error("Gate failed for '{item_id}': {detail}")]
    GateFailed { item_id: String, detail: String },

    #[error("Artifact path escapes the gate base directory: {0}")]
    PathTraversal(PathBuf),

    #[error("Template variable '{name}' resolved to unsafe value '{value}'")]
    UnsafeTemplateArg { name: String, value: String },

    #[error("Gate command timed out after {0:?}")]
    GateTimeout(Duration),

    // Review
    #[error("Review quorum not met: {satisfied}/{required} required reviews succeeded")]
    ReviewThreshold { satisfied: usize, required: usize },

    // Environment
    #[error("No repository root found (looked for .git or workflow.yaml within {0} levels)")]
    RepoNotFound(u32),

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Checkpoint chain contains a cycle at '{0}'")]
    CheckpointCycle(String),

    #[error("No session selected; run `orchestrate start` first")]
    NoSession,

    #[error("Item not found: {0}")]
    ItemNotFound(String),

    #[error("Workflow definition invalid: {}", .0.join("; "))]
    InvalidDefinition(Vec<String>),

    #[error("Operation cancelled")]
    Cancelled,

    // Carriers
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serde(String),
}

impl OrchError {
    /// Returns true if the error is transient and the operation may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchError::LockTimeout { .. } | OrchError::GateTimeout(_)
        )
    }

    /// Returns true if the error is unrecoverable for the current session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OrchError::StateIntegrity { .. }
                | OrchError::StateVersion { .. }
                | OrchError::SessionConflict(_)
        )
    }

    /// A one-line remediation hint for the user, when one exists.
    pub fn hint(&self) -> Option<String> {
        match self {
            OrchError::StateIntegrity { path, .. } => Some(format!(
                "State file may be corrupt or hand-edited. Restore {} from a checkpoint with `orchestrate resume`",
                path.display()
            )),
            OrchError::AuditTamper { seq, .. } => Some(format!(
                "Run `orchestrate audit verify` to locate the break (first bad entry: seq {})",
                seq
            )),
            OrchError::LockTimeout { name, .. } => Some(format!(
                "Another orchestrate process may hold the '{}' lock. If it crashed, the stale lock is recovered automatically on retry",
                name
            )),
            OrchError::PhaseIncomplete { blockers, .. } => Some(format!(
                "Complete or skip the blocking items first: {}",
                blockers.join(", ")
            )),
            OrchError::RepoNotFound(_) => {
                Some("Run from inside a git repository or create workflow.yaml at the project root".to_string())
            }
            _ => None,
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        OrchError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<serde_json::Error> for OrchError {
    fn from(err: serde_json::Error) -> Self {
        OrchError::Serde(err.to_string())
    }
}

pub type OrchResult<T> = Result<T, OrchError>;
