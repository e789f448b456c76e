use std::path::{Path, PathBuf};

use crate::error::{OrchError, OrchResult};

/// Maximum number of parent directories searched for a repo root marker.
const MAX_ROOT_WALK_LEVELS: u32 = 32;

/// Name of the containment directory under the repo root.
pub const ORCHESTRATOR_DIR: &str = ".orchestrator";

/// Legacy single-session layout, readable but never written.
pub const LEGACY_STATE_FILE: &str = ".workflow_state.json";
pub const LEGACY_LOG_FILE: &str = ".workflow_log.jsonl";
pub const LEGACY_CHECKPOINTS_DIR: &str = ".workflow_checkpoints";

/// Whether session artifacts are hidden from git (`normal`) or intended to
/// be committed alongside the repo (`portable`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathMode {
    #[default]
    Normal,
    Portable,
}

/// Resolved paths for one session's artifacts.
///
/// Accessors never touch the filesystem; `ensure_session_dir` is the single
/// place directories come into existence.
#[derive(Debug, Clone)]
pub struct Paths {
    repo_root: PathBuf,
    session_id: Option<String>,
    mode: PathMode,
}

impl Paths {
    /// Resolve the repo root from `base_dir` and bind to a session.
    ///
    /// Walks up from `base_dir` until a `.git` directory or `workflow.yaml`
    /// marker is found, at most 32 levels.
    pub fn new(base_dir: &Path, session_id: Option<&str>, mode: PathMode) -> OrchResult<Self> {
        let repo_root = find_repo_root(base_dir)?;
        Ok(Self {
            repo_root,
            session_id: session_id.map(str::to_string),
            mode,
        })
    }

    /// Bind these paths to a (different) session id.
    pub fn with_session(&self, session_id: &str) -> Self {
        Self {
            repo_root: self.repo_root.clone(),
            session_id: Some(session_id.to_string()),
            mode: self.mode,
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn mode(&self) -> PathMode {
        self.mode
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn orchestrator_dir(&self) -> PathBuf {
        self.repo_root.join(ORCHESTRATOR_DIR)
    }

    /// The `current` file holding the active session id.
    pub fn current_pointer(&self) -> PathBuf {
        self.orchestrator_dir().join("current")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.orchestrator_dir().join("sessions")
    }

    pub fn session_dir(&self) -> OrchResult<PathBuf> {
        let sid = self.session_id.as_deref().ok_or(OrchError::NoSession)?;
        Ok(self.sessions_dir().join(sid))
    }

    pub fn state_file(&self) -> OrchResult<PathBuf> {
        Ok(self.session_dir()?.join("state.json"))
    }

    pub fn log_file(&self) -> OrchResult<PathBuf> {
        Ok(self.session_dir()?.join("log.jsonl"))
    }

    pub fn audit_file(&self) -> OrchResult<PathBuf> {
        Ok(self.session_dir()?.join("audit.jsonl"))
    }

    pub fn checkpoints_dir(&self) -> OrchResult<PathBuf> {
        Ok(self.session_dir()?.join("checkpoints"))
    }

    pub fn feedback_dir(&self) -> OrchResult<PathBuf> {
        Ok(self.session_dir()?.join("feedback"))
    }

    pub fn meta_file(&self) -> OrchResult<PathBuf> {
        Ok(self.session_dir()?.join("meta.json"))
    }

    pub fn locks_dir(&self) -> OrchResult<PathBuf> {
        Ok(self.session_dir()?.join("locks"))
    }

    /// The workflow definition at the repo root.
    pub fn workflow_def_file(&self) -> PathBuf {
        self.repo_root.join("workflow.yaml")
    }

    /// Returns the legacy state file path only when it exists on disk.
    pub fn find_legacy_state_file(&self) -> Option<PathBuf> {
        let path = self.repo_root.join(LEGACY_STATE_FILE);
        path.exists().then_some(path)
    }

    /// Returns the legacy event log path only when it exists on disk.
    pub fn find_legacy_log_file(&self) -> Option<PathBuf> {
        let path = self.repo_root.join(LEGACY_LOG_FILE);
        path.exists().then_some(path)
    }

    /// Returns the legacy checkpoints directory only when it exists on disk.
    pub fn find_legacy_checkpoints_dir(&self) -> Option<PathBuf> {
        let path = self.repo_root.join(LEGACY_CHECKPOINTS_DIR);
        path.is_dir().then_some(path)
    }

    /// Create the session directory tree on first write.
    ///
    /// In normal mode a `.gitignore` containing `*` keeps session artifacts
    /// out of the repo; portable mode leaves them visible to git.
    pub fn ensure_session_dir(&self) -> OrchResult<PathBuf> {
        let dir = self.session_dir()?;
        for sub in ["checkpoints", "feedback", "locks"] {
            let sub_dir = dir.join(sub);
            std::fs::create_dir_all(&sub_dir).map_err(|e| OrchError::io(sub_dir.clone(), e))?;
        }
        if self.mode == PathMode::Normal {
            let gitignore = dir.join(".gitignore");
            if !gitignore.exists() {
                std::fs::write(&gitignore, "*\n")
                    .map_err(|e| OrchError::io(gitignore.clone(), e))?;
            }
        }
        Ok(dir)
    }
}

/// Walk up from `base_dir` looking for a `.git` directory or a
/// `workflow.yaml` marker file.
fn find_repo_root(base_dir: &Path) -> OrchResult<PathBuf> {
    let start = if base_dir.is_absolute() {
        base_dir.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| OrchError::io(base_dir.to_path_buf(), e))?
            .join(base_dir)
    };

    let mut current = start.as_path();
    for _ in 0..MAX_ROOT_WALK_LEVELS {
        if current.join(".git").is_dir() || current.join("workflow.yaml").is_file() {
            return Ok(current.to_path_buf());
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }
    Err(OrchError::RepoNotFound(MAX_ROOT_WALK_LEVELS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_found_via_git_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let paths = Paths::new(&nested, None, PathMode::Normal).unwrap();
        assert_eq!(
            paths.repo_root().canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn root_found_via_workflow_marker() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("workflow.yaml"), "name: x\nphases: []\n").unwrap();

        let paths = Paths::new(dir.path(), None, PathMode::Normal).unwrap();
        assert_eq!(paths.workflow_def_file(), dir.path().join("workflow.yaml"));
    }

    #[test]
    fn missing_root_is_an_error() {
        // /tmp itself has no .git marker; a fresh tempdir has neither.
        let dir = tempfile::tempdir().unwrap();
        let result = Paths::new(dir.path(), None, PathMode::Normal);
        assert!(matches!(result, Err(OrchError::RepoNotFound(32))));
    }

    #[test]
    fn accessors_do_not_create_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        let paths = Paths::new(dir.path(), Some("ab12cd34"), PathMode::Normal).unwrap();

        let state = paths.state_file().unwrap();
        assert!(!state.parent().unwrap().exists());
    }

    #[test]
    fn ensure_session_dir_writes_gitignore_in_normal_mode() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        let paths = Paths::new(dir.path(), Some("ab12cd34"), PathMode::Normal).unwrap();

        let session_dir = paths.ensure_session_dir().unwrap();
        let gitignore = std::fs::read_to_string(session_dir.join(".gitignore")).unwrap();
        assert_eq!(gitignore, "*\n");
    }

    #[test]
    fn portable_mode_skips_gitignore() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        let paths = Paths::new(dir.path(), Some("ab12cd34"), PathMode::Portable).unwrap();

        let session_dir = paths.ensure_session_dir().unwrap();
        assert!(!session_dir.join(".gitignore").exists());
    }

    #[test]
    fn legacy_state_only_reported_when_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        let paths = Paths::new(dir.path(), None, PathMode::Normal).unwrap();

        assert!(paths.find_legacy_state_file().is_none());
        std::fs::write(dir.path().join(LEGACY_STATE_FILE), "{}").unwrap();
        assert!(paths.find_legacy_state_file().is_some());
    }
}
