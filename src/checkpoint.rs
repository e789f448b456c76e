use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OrchError, OrchResult};
use crate::lock::{LockManager, LockMode};
use crate::state::{compute_checksum, constant_time_equal, write_atomic, WorkflowState};

/// Bound on chain walks; a deeper lineage than this is assumed cyclic.
const MAX_CHAIN_DEPTH: usize = 1024;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Checkpoint {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub label: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub decisions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_manifest: Vec<String>,
    #[serde(default)]
    pub context_summary: String,
    pub orchestrator_version: String,
    pub state_snapshot: WorkflowState,
}

/// Named, chained snapshots of workflow state. Checkpoints are immutable
/// once written; the store only ever adds files.
pub struct CheckpointStore {
    dir: PathBuf,
    legacy_dir: Option<PathBuf>,
    locks: Arc<LockManager>,
    lock_timeout: Duration,
}

impl CheckpointStore {
    pub fn new(
        dir: PathBuf,
        legacy_dir: Option<PathBuf>,
        locks: Arc<LockManager>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            dir,
            legacy_dir,
            locks,
            lock_timeout,
        }
    }

    /// Millisecond timestamp plus a random suffix, so ids cannot collide
    /// even under a high creation rate.
    fn new_id() -> String {
        let millis = chrono::Utc::now().timestamp_millis();
        let suffix: u16 = rand::thread_rng().gen();
        format!("{}-{:04x}", millis, suffix)
    }

    /// Snapshot the given state under a new checkpoint id.
    ///
    /// A declared parent must exist, and linking to it must not create a
    /// cycle; both are checked on insert rather than deferred to readers.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        label: &str,
        parent_id: Option<&str>,
        decisions: Vec<String>,
        file_manifest: Vec<String>,
        context_summary: String,
        state: &WorkflowState,
    ) -> OrchResult<String> {
        let _lock = self
            .locks
            .acquire("checkpoint", LockMode::Exclusive, self.lock_timeout)?;

        if let Some(parent) = parent_id {
            // Walking the parent's ancestry proves it exists and is acyclic.
            self.chain_ids(parent)?;
        }

        let id = Self::new_id();
        let checkpoint = Checkpoint {
            id: id.clone(),
            parent_id: parent_id.map(str::to_string),
            label: label.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            decisions,
            file_manifest,
            context_summary,
            orchestrator_version: env!("CARGO_PKG_VERSION").to_string(),
            state_snapshot: state.clone(),
        };

        let mut value = serde_json::to_value(&checkpoint)?;
        let map = value
            .as_object_mut()
            .ok_or_else(|| OrchError::Serde("checkpoint did not serialize to an object".into()))?;
        map.insert("_version".to_string(), Value::String(crate::state::STATE_VERSION.into()));
        let checksum = compute_checksum(&value);
        let map = value.as_object_mut().expect("object checked above");
        map.insert("_checksum".to_string(), Value::String(checksum));
        map.insert(
            "_updated_at".to_string(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );

        let path = self.dir.join(format!("{}.json", id));
        write_atomic(&path, value.to_string().as_bytes())?;
        Ok(id)
    }

    /// Load and checksum-verify one checkpoint. Falls back to the legacy
    /// checkpoints directory when the session store lacks the id.
    pub fn load(&self, id: &str) -> OrchResult<Checkpoint> {
        let path = self.resolve(id)?;
        let contents =
            std::fs::read_to_string(&path).map_err(|e| OrchError::io(path.clone(), e))?;
        let mut value: Value = serde_json::from_str(&contents)?;

        // Legacy checkpoints predate checksums; verify only when present.
        let stored = value
            .get("_checksum")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(stored) = stored {
            let computed = compute_checksum(&value);
            if !constant_time_equal(&stored, &computed) {
                return Err(OrchError::StateIntegrity {
                    path,
                    detail: "checkpoint checksum mismatch".to_string(),
                });
            }
        }

        if let Some(map) = value.as_object_mut() {
            map.remove("_version");
            map.remove("_checksum");
            map.remove("_updated_at");
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Return the checkpoint and its ancestors, nearest first. Rejects
    /// cycles and unbounded depth.
    pub fn get_chain(&self, id: &str) -> OrchResult<Vec<Checkpoint>> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut cursor = Some(id.to_string());

        while let Some(current) = cursor {
            if !visited.insert(current.clone()) || visited.len() > MAX_CHAIN_DEPTH {
                return Err(OrchError::CheckpointCycle(current));
            }
            let checkpoint = self.load(&current)?;
            cursor = checkpoint.parent_id.clone();
            chain.push(checkpoint);
        }

        Ok(chain)
    }

    /// Like `get_chain` but returns only ids, without deserializing
    /// snapshots twice. Used by the insert-time cycle check.
    fn chain_ids(&self, id: &str) -> OrchResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut visited = HashSet::new();
        let mut cursor = Some(id.to_string());

        while let Some(current) = cursor {
            if !visited.insert(current.clone()) || visited.len() > MAX_CHAIN_DEPTH {
                return Err(OrchError::CheckpointCycle(current));
            }
            let checkpoint = self.load(&current)?;
            cursor = checkpoint.parent_id.clone();
            ids.push(checkpoint.id);
        }

        Ok(ids)
    }

    pub fn list(&self) -> OrchResult<Vec<String>> {
        let mut ids = Vec::new();
        for dir in std::iter::once(&self.dir).chain(self.legacy_dir.iter()) {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(OrchError::io(dir.clone(), e)),
            };
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some(id) = name.strip_suffix(".json") {
                    if !ids.contains(&id.to_string()) {
                        ids.push(id.to_string());
                    }
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn resolve(&self, id: &str) -> OrchResult<PathBuf> {
        let path = self.dir.join(format!("{}.json", id));
        if path.exists() {
            return Ok(path);
        }
        if let Some(ref legacy) = self.legacy_dir {
            let legacy_path = legacy.join(format!("{}.json", id));
            if legacy_path.exists() {
                return Ok(legacy_path);
            }
        }
        Err(OrchError::CheckpointNotFound(id.to_string()))
    }
}
