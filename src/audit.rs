use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OrchError, OrchResult};
use crate::lock::{LockManager, LockMode};
use crate::state::{canonical_json, constant_time_equal, sha256_hex};

/// How much of the file tail is scanned to find the previous entry's hash.
/// Audit lines are compact; 4 KiB always covers at least the last line.
const TAIL_SCAN_BYTES: u64 = 4096;

/// Record kinds. Serialized snake_case into the `kind` field.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    WorkflowStart,
    WorkflowFinish,
    PhaseTransition,
    ItemComplete,
    ItemSkip,
    GatePass,
    GateFail,
    GateBypass,
    ReviewStarted,
    ReviewCompleted,
    CheckpointCreated,
    ModeDetected,
    EmergencyOverride,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AuditRecord {
    pub seq: u64,
    pub ts: String,
    pub prev_hash: String,
    pub entry_hash: String,
    pub kind: AuditKind,
    pub data: Value,
}

/// Append-only, hash-chained audit log.
///
/// Each entry's hash covers the previous entry's hash plus the canonical
/// form of its own data, so any edit to a committed entry breaks the chain
/// from that point forward.
pub struct AuditLog {
    path: PathBuf,
    locks: Arc<LockManager>,
    lock_timeout: Duration,
}

impl AuditLog {
    pub fn new(path: PathBuf, locks: Arc<LockManager>, lock_timeout: Duration) -> Self {
        Self {
            path,
            locks,
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Takes the exclusive audit lock, reads the last
    /// entry's hash from the file tail, and writes a single JSONL line.
    pub fn append(&self, kind: AuditKind, data: Value) -> OrchResult<AuditRecord> {
        let _lock = self
            .locks
            .acquire("audit", LockMode::Exclusive, self.lock_timeout)?;

        let (prev_seq, prev_hash) = self.read_tail()?;
        let data = sanitize_data(data);

        let entry_hash = chain_hash(&prev_hash, &data);
        let record = AuditRecord {
            seq: prev_seq + 1,
            ts: chrono::Utc::now().to_rfc3339(),
            prev_hash,
            entry_hash,
            kind,
            data,
        };

        let line = serde_json::to_string(&record)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| OrchError::io(parent.to_path_buf(), e))?;
        }
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| OrchError::io(self.path.clone(), e))?;
        writeln!(file, "{}", line).map_err(|e| OrchError::io(self.path.clone(), e))?;

        Ok(record)
    }

    /// Walk the whole file, recomputing every entry hash and checking the
    /// `prev_hash` linkage. Returns the number of verified entries.
    ///
    /// Comparison uses `constant_time_equal` to resist timing probes.
    pub fn verify_chain(&self) -> OrchResult<usize> {
        let _lock = self
            .locks
            .acquire("audit", LockMode::Shared, self.lock_timeout)?;

        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(OrchError::io(self.path.clone(), e)),
        };

        let mut prev_hash = String::new();
        let mut prev_seq = 0u64;
        let mut count = 0usize;

        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            let record: AuditRecord = serde_json::from_str(line).map_err(|e| {
                OrchError::AuditTamper {
                    seq: prev_seq + 1,
                    detail: format!("unparseable entry: {}", e),
                }
            })?;

            if record.seq != prev_seq + 1 {
                return Err(OrchError::AuditTamper {
                    seq: record.seq,
                    detail: format!("sequence gap: expected {}, found {}", prev_seq + 1, record.seq),
                });
            }
            if !constant_time_equal(&record.prev_hash, &prev_hash) {
                return Err(OrchError::AuditTamper {
                    seq: record.seq,
                    detail: "prev_hash does not match preceding entry".to_string(),
                });
            }
            let expected = chain_hash(&record.prev_hash, &record.data);
            if !constant_time_equal(&record.entry_hash, &expected) {
                return Err(OrchError::AuditTamper {
                    seq: record.seq,
                    detail: "entry_hash does not match entry data".to_string(),
                });
            }

            prev_hash = record.entry_hash;
            prev_seq = record.seq;
            count += 1;
        }

        Ok(count)
    }

    /// Read every record, without verifying. Used by status displays.
    pub fn read_all(&self) -> OrchResult<Vec<AuditRecord>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(OrchError::io(self.path.clone(), e)),
        };
        contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(OrchError::from))
            .collect()
    }

    /// Read `(last_seq, last_entry_hash)` by scanning only the file tail.
    fn read_tail(&self) -> OrchResult<(u64, String)> {
        let mut file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((0, String::new()))
            }
            Err(e) => return Err(OrchError::io(self.path.clone(), e)),
        };

        let len = file
            .metadata()
            .map_err(|e| OrchError::io(self.path.clone(), e))?
            .len();
        let start = len.saturating_sub(TAIL_SCAN_BYTES);
        file.seek(SeekFrom::Start(start))
            .map_err(|e| OrchError::io(self.path.clone(), e))?;

        let mut tail = String::new();
        file.read_to_string(&mut tail)
            .map_err(|e| OrchError::io(self.path.clone(), e))?;

        // When seeking into the middle of the file the first line fragment
        // is discarded; full lines follow.
        let last_line = tail
            .lines()
            .filter(|l| !l.trim().is_empty())
            .last()
            .map(str::to_string);

        match last_line {
            None => Ok((0, String::new())),
            Some(line) => {
                let record: AuditRecord = serde_json::from_str(&line).map_err(|e| {
                    OrchError::AuditTamper {
                        seq: 0,
                        detail: format!("unparseable tail entry: {}", e),
                    }
                })?;
                Ok((record.seq, record.entry_hash))
            }
        }
    }
}

fn chain_hash(prev_hash: &str, data: &Value) -> String {
    let mut buf = Vec::with_capacity(64 + 256);
    buf.extend_from_slice(prev_hash.as_bytes());
    buf.extend_from_slice(canonical_json(data).as_bytes());
    sha256_hex(&buf)
}

/// Reduce absolute paths in audit data to their basename. Secrets and
/// operator home directories never reach the audit store.
pub fn sanitize_data(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(sanitize_string(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_data).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, sanitize_data(v)))
                .collect(),
        ),
        other => other,
    }
}

fn sanitize_string(s: &str) -> String {
    if !s.starts_with('/') || s.contains(char::is_whitespace) {
        return s.to_string();
    }
    Path::new(s)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| s.to_string())
}
