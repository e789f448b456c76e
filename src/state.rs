use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::error::{OrchError, OrchResult};
use crate::log_warn;

/// On-disk state format version. Loads reject a different major.
pub const STATE_VERSION: &str = "3.0";

/// Reserved top-level fields managed by the persistence layer.
const FIELD_VERSION: &str = "_version";
const FIELD_CHECKSUM: &str = "_checksum";
const FIELD_UPDATED_AT: &str = "_updated_at";

// --- Enums ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Skipped,
    Failed,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Completed | ItemStatus::Skipped | ItemStatus::Failed
        )
    }

    /// Validates whether a transition from this status to `to` is allowed.
    ///
    /// Rules:
    /// - Forward progression: Pending -> InProgress -> {Completed, Skipped, Failed}
    /// - Pending may jump straight to a terminal status (single-call complete/skip)
    /// - Failed may return to InProgress (the agent retries)
    /// - Completed and Skipped are terminal
    pub fn is_valid_transition(&self, to: &ItemStatus) -> bool {
        use ItemStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (Pending, Completed)
                | (Pending, Skipped)
                | (Pending, Failed)
                | (InProgress, Completed)
                | (InProgress, Skipped)
                | (InProgress, Failed)
                | (Failed, InProgress)
                | (Failed, Completed)
                | (Failed, Skipped)
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Skipped,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Active,
    Completed,
    Abandoned,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::Active)
    }
}

// --- Structs ---

/// Result of a gate evaluation as recorded on the item.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct GateRecord {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct ReviewMetadata {
    pub review_type: String,
    pub model_used: String,
    #[serde(default)]
    pub was_fallback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallbacks_tried: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output_ref: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct ItemState {
    pub id: String,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_result: Option<GateRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_metadata: Option<ReviewMetadata>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct PhaseState {
    pub id: String,
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub items: Vec<ItemState>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub task: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub status: WorkflowStatus,
    #[serde(default)]
    pub phase_cursor: usize,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, Value>,
    #[serde(default)]
    pub phases: Vec<PhaseState>,
}

impl WorkflowState {
    pub fn current_phase(&self) -> Option<&PhaseState> {
        self.phases.get(self.phase_cursor)
    }

    pub fn current_phase_mut(&mut self) -> Option<&mut PhaseState> {
        self.phases.get_mut(self.phase_cursor)
    }

    /// Find an item in the current phase.
    pub fn current_item_mut(&mut self, item_id: &str) -> Option<&mut ItemState> {
        self.current_phase_mut()?
            .items
            .iter_mut()
            .find(|i| i.id == item_id)
    }

    /// True when the item exists somewhere in the workflow, regardless of phase.
    pub fn contains_item(&self, item_id: &str) -> bool {
        self.phases
            .iter()
            .any(|p| p.items.iter().any(|i| i.id == item_id))
    }
}

// --- Integrity primitives ---

/// Canonical representation: compact JSON with sorted object keys.
///
/// serde_json's default map is ordered by key, so serializing a `Value`
/// built from map insertion yields sorted keys without extra work.
pub fn canonical_json(value: &Value) -> String {
    value.to_string()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Compare two strings without early exit, so a checksum probe cannot time
/// its way to a matching prefix.
pub fn constant_time_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Compute the checksum of a state document: canonical JSON of the value
/// with `_checksum` and `_updated_at` removed. `_version` participates.
pub fn compute_checksum(value: &Value) -> String {
    let mut copy = value.clone();
    if let Some(map) = copy.as_object_mut() {
        map.remove(FIELD_CHECKSUM);
        map.remove(FIELD_UPDATED_AT);
    }
    sha256_hex(canonical_json(&copy).as_bytes())
}

/// What to do when a loaded state file fails its checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntegrityPolicy {
    #[default]
    Fail,
    WarnAndContinue,
}

// --- Persistence ---

/// Serialize state to canonical JSON with embedded version, timestamp, and
/// checksum, then write atomically: temp file, fsync, rename, parent fsync.
///
/// A write that cannot complete the fsync-rename sequence leaves any old
/// file intact.
pub fn save_state(state: &WorkflowState, path: &Path) -> OrchResult<()> {
    let mut value = serde_json::to_value(state)?;
    let map = value
        .as_object_mut()
        .ok_or_else(|| OrchError::Serde("state did not serialize to an object".to_string()))?;
    map.insert(FIELD_VERSION.to_string(), Value::String(STATE_VERSION.to_string()));
    let checksum = compute_checksum(&value);
    let map = value.as_object_mut().expect("object checked above");
    map.insert(FIELD_CHECKSUM.to_string(), Value::String(checksum));
    map.insert(
        FIELD_UPDATED_AT.to_string(),
        Value::String(chrono::Utc::now().to_rfc3339()),
    );

    write_atomic(path, canonical_json(&value).as_bytes())
}

/// Atomic write-temp-fsync-rename, then best-effort fsync of the parent
/// directory so the rename itself is durable.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> OrchResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| OrchError::io(path.to_path_buf(), std::io::Error::other("no parent")))?;

    fs::create_dir_all(parent).map_err(|e| OrchError::io(parent.to_path_buf(), e))?;

    let temp_file =
        NamedTempFile::new_in(parent).map_err(|e| OrchError::io(parent.to_path_buf(), e))?;

    fs::write(temp_file.path(), bytes)
        .map_err(|e| OrchError::io(temp_file.path().to_path_buf(), e))?;

    let file = fs::File::open(temp_file.path())
        .map_err(|e| OrchError::io(temp_file.path().to_path_buf(), e))?;
    file.sync_all()
        .map_err(|e| OrchError::io(temp_file.path().to_path_buf(), e))?;

    temp_file
        .persist(path)
        .map_err(|e| OrchError::io(path.to_path_buf(), e.error))?;

    if let Ok(dir) = fs::File::open(parent) {
        let _ = dir.sync_all();
    }

    Ok(())
}

/// Load a state file, verifying version and checksum.
pub fn load_state(path: &Path) -> OrchResult<WorkflowState> {
    load_state_with_policy(path, IntegrityPolicy::Fail)
}

pub fn load_state_with_policy(path: &Path, policy: IntegrityPolicy) -> OrchResult<WorkflowState> {
    let contents = fs::read_to_string(path).map_err(|e| OrchError::io(path.to_path_buf(), e))?;
    let mut value: Value = serde_json::from_str(&contents)?;

    let version = value
        .get(FIELD_VERSION)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let major = version.split('.').next().unwrap_or("");
    let expected_major = STATE_VERSION.split('.').next().unwrap_or("3");
    if major != expected_major {
        return Err(OrchError::StateVersion {
            found: version,
            expected_major: expected_major.parse().unwrap_or(3),
        });
    }

    let stored = value
        .get(FIELD_CHECKSUM)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let computed = compute_checksum(&value);
    if !constant_time_equal(&stored, &computed) {
        match policy {
            IntegrityPolicy::Fail => {
                return Err(OrchError::StateIntegrity {
                    path: path.to_path_buf(),
                    detail: "checksum mismatch".to_string(),
                })
            }
            IntegrityPolicy::WarnAndContinue => {
                log_warn!(
                    "checksum mismatch in {}; continuing per policy",
                    path.display()
                );
            }
        }
    }

    if let Some(map) = value.as_object_mut() {
        map.remove(FIELD_VERSION);
        map.remove(FIELD_CHECKSUM);
        map.remove(FIELD_UPDATED_AT);
    }

    Ok(serde_json::from_value(value)?)
}

/// Read a legacy `.workflow_state.json`. Legacy files predate the checksum
/// scheme, so they load leniently and are never verified or rewritten.
pub fn load_legacy_state(path: &Path) -> OrchResult<WorkflowState> {
    let contents = fs::read_to_string(path).map_err(|e| OrchError::io(path.to_path_buf(), e))?;
    let mut value: Value = serde_json::from_str(&contents)?;
    if let Some(map) = value.as_object_mut() {
        map.remove(FIELD_VERSION);
        map.remove(FIELD_CHECKSUM);
        map.remove(FIELD_UPDATED_AT);
    }
    Ok(serde_json::from_value(value)?)
}
