use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OrchError, OrchResult};

/// One engine event. Consumers tolerate unknown fields; the payload is
/// intentionally schema-less.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WorkflowEvent {
    pub ts: String,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// In-process observers notified of every event the engine emits.
pub trait EventSubscriber: Send + Sync {
    fn on_event(&self, event: &WorkflowEvent);
}

/// Appends events to `log.jsonl` and fans them out to subscribers.
///
/// The file is append-only; a legacy `.workflow_log.jsonl` is readable for
/// history but never written.
pub struct EventLog {
    path: PathBuf,
    legacy_path: Option<PathBuf>,
    subscribers: Mutex<Vec<Arc<dyn EventSubscriber>>>,
}

impl EventLog {
    pub fn new(path: PathBuf, legacy_path: Option<PathBuf>) -> Self {
        Self {
            path,
            legacy_path,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(subscriber);
        }
    }

    pub fn emit(&self, event: &str, data: Value) -> OrchResult<WorkflowEvent> {
        let event = WorkflowEvent {
            ts: chrono::Utc::now().to_rfc3339(),
            event: event.to_string(),
            data,
        };

        let line = serde_json::to_string(&event)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| OrchError::io(parent.to_path_buf(), e))?;
        }
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| OrchError::io(self.path.clone(), e))?;
        writeln!(file, "{}", line).map_err(|e| OrchError::io(self.path.clone(), e))?;

        if let Ok(subs) = self.subscribers.lock() {
            for sub in subs.iter() {
                sub.on_event(&event);
            }
        }

        Ok(event)
    }

    /// Read event history. Falls back to the legacy log when the session
    /// log does not exist yet.
    pub fn read_all(&self) -> OrchResult<Vec<WorkflowEvent>> {
        let path = if self.path.exists() {
            self.path.clone()
        } else if let Some(ref legacy) = self.legacy_path {
            legacy.clone()
        } else {
            return Ok(Vec::new());
        };

        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(OrchError::io(path, e)),
        };

        Ok(contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}
