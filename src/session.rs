use std::path::Path;
use std::process::Command;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OrchError, OrchResult};
use crate::lock::{LockManager, LockMode};
use crate::paths::Paths;
use crate::state::write_atomic;

/// Generate a short identifier: 8 hex chars of a v4 UUID.
pub fn short_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// Repo identity recorded when a session is created.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SessionMeta {
    pub created_at: String,
    pub repo_root: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_remote: Option<String>,
    pub orchestrator_version: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub id: String,
    pub created_at: Option<String>,
    pub is_current: bool,
}

/// Creates and selects sessions under the containment directory.
pub struct SessionManager {
    paths: Paths,
    locks: LockManager,
    lock_timeout: Duration,
}

impl SessionManager {
    /// `paths` need not be bound to a session; the manager operates on the
    /// containment directory itself.
    pub fn new(paths: Paths, lock_timeout: Duration) -> Self {
        let locks = LockManager::new(paths.orchestrator_dir().join("locks"));
        Self {
            paths,
            locks,
            lock_timeout,
        }
    }

    /// Create a session directory, write its `meta.json`, and point
    /// `current` at it.
    pub fn create_session(&self) -> OrchResult<String> {
        let id = short_id();
        let session_paths = self.paths.with_session(&id);
        session_paths.ensure_session_dir()?;

        let meta = SessionMeta {
            created_at: chrono::Utc::now().to_rfc3339(),
            repo_root: self.paths.repo_root().display().to_string(),
            git_remote: git_remote_url(self.paths.repo_root()),
            orchestrator_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let meta_path = session_paths.meta_file()?;
        write_atomic(&meta_path, serde_json::to_string_pretty(&meta)?.as_bytes())?;

        self.set_current(&id, None)?;
        Ok(id)
    }

    /// Read the active session id from the `current` pointer.
    pub fn get_current(&self) -> OrchResult<Option<String>> {
        let pointer = self.paths.current_pointer();
        match std::fs::read_to_string(&pointer) {
            Ok(contents) => {
                let id = contents.trim().to_string();
                Ok((!id.is_empty()).then_some(id))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OrchError::io(pointer, e)),
        }
    }

    /// Enumerate session directories, newest pointer first by created_at.
    pub fn list_sessions(&self) -> OrchResult<Vec<SessionSummary>> {
        let sessions_dir = self.paths.sessions_dir();
        let current = self.get_current()?;

        let entries = match std::fs::read_dir(&sessions_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(OrchError::io(sessions_dir, e)),
        };

        let mut sessions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| OrchError::io(sessions_dir.clone(), e))?;
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            let created_at = read_meta(&entry.path().join("meta.json"))
                .map(|m| m.created_at);
            sessions.push(SessionSummary {
                is_current: current.as_deref() == Some(id.as_str()),
                id,
                created_at,
            });
        }

        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    /// Switch the `current` pointer to an existing session.
    ///
    /// When `expected_current` is provided and another process has moved
    /// the pointer since the caller observed it, the switch fails with
    /// `SessionConflict` instead of clobbering the concurrent change.
    pub fn switch_session(&self, id: &str, expected_current: Option<&str>) -> OrchResult<()> {
        let session_dir = self.paths.sessions_dir().join(id);
        if !session_dir.is_dir() {
            return Err(OrchError::SessionConflict(format!(
                "session '{}' does not exist",
                id
            )));
        }
        self.set_current(id, expected_current)
    }

    /// Atomically rewrite the pointer under the sessions lock.
    fn set_current(&self, id: &str, expected_current: Option<&str>) -> OrchResult<()> {
        let _lock = self
            .locks
            .acquire("sessions", LockMode::Exclusive, self.lock_timeout)?;

        if let Some(expected) = expected_current {
            let actual = self.get_current()?;
            if actual.as_deref() != Some(expected) {
                return Err(OrchError::SessionConflict(format!(
                    "current session moved from '{}' to '{}'",
                    expected,
                    actual.as_deref().unwrap_or("<none>")
                )));
            }
        }

        write_atomic(&self.paths.current_pointer(), format!("{}\n", id).as_bytes())
    }

    pub fn read_session_meta(&self, id: &str) -> Option<SessionMeta> {
        read_meta(&self.paths.sessions_dir().join(id).join("meta.json"))
    }
}

fn read_meta(path: &Path) -> Option<SessionMeta> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

/// Resolve the repo's origin URL, when one exists. Failure is not an
/// error; metadata simply omits the remote.
fn git_remote_url(repo_root: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(["remote", "get-url", "origin"])
        .current_dir(repo_root)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let url = String::from_utf8(output.stdout).ok()?.trim().to_string();
    (!url.is_empty()).then_some(url)
}
