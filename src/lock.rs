use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::fcntl::{Flock, FlockArg};

use crate::error::{OrchError, OrchResult};
use crate::log_warn;

/// Polling interval while waiting for a contended resource lock.
const ACQUIRE_POLL_INTERVAL_MS: u64 = 50;

/// Canonical acquire order. Acquiring a lower-ranked resource while holding
/// a higher-ranked one is a `LockCycle` error.
fn lock_rank(name: &str) -> u8 {
    match name {
        "migration" => 0,
        "state" => 1,
        "audit" => 2,
        _ => 3, // checkpoints, session-scoped resources
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

// --- Named resource locks (per session) ---

/// Hands out advisory file locks for named resources under a session's
/// `locks/` directory. One manager per engine instance; held-lock tracking
/// backs the canonical-order check.
pub struct LockManager {
    locks_dir: PathBuf,
    held: Arc<Mutex<Vec<(std::thread::ThreadId, String)>>>,
}

/// An acquired resource lock. Released on drop; the pid marker is cleared
/// best-effort so stale detection stays accurate.
#[must_use = "lock is released when ResourceLock is dropped"]
pub struct ResourceLock {
    // Option so Drop can take the flock out and unlock before bookkeeping.
    flock: Option<Flock<File>>,
    name: String,
    path: PathBuf,
    mode: LockMode,
    held: Arc<Mutex<Vec<(std::thread::ThreadId, String)>>>,
}

impl std::fmt::Debug for ResourceLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLock")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .finish()
    }
}

impl ResourceLock {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for ResourceLock {
    fn drop(&mut self) {
        if self.mode == LockMode::Exclusive {
            // Clear the pid marker while still holding the flock, so a
            // successor's freshly written marker is never clobbered.
            let _ = fs::write(&self.path, "");
        }
        if let Some(flock) = self.flock.take() {
            if let Err((_, e)) = flock.unlock() {
                log_warn!("failed to release lock '{}': {}", self.name, e);
            }
        }
        if let Ok(mut held) = self.held.lock() {
            let tid = std::thread::current().id();
            if let Some(pos) = held
                .iter()
                .position(|(t, n)| *t == tid && n == &self.name)
                .or_else(|| held.iter().position(|(_, n)| n == &self.name))
            {
                held.remove(pos);
            }
        }
    }
}

impl LockManager {
    pub fn new(locks_dir: PathBuf) -> Self {
        Self {
            locks_dir,
            held: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Acquire the named resource lock, waiting up to `timeout`.
    ///
    /// Stale-lock recovery: when acquisition stalls and the pid recorded in
    /// the lock file is dead, the file is renamed to `<name>.removing` and
    /// unlinked, then acquisition retries once against a fresh file.
    pub fn acquire(
        &self,
        name: &str,
        mode: LockMode,
        timeout: Duration,
    ) -> OrchResult<ResourceLock> {
        self.check_order(name)?;

        fs::create_dir_all(&self.locks_dir)
            .map_err(|e| OrchError::io(self.locks_dir.clone(), e))?;

        let path = self.locks_dir.join(format!("{}.lock", name));

        match self.acquire_at(&path, name, mode, timeout) {
            Ok(lock) => Ok(lock),
            Err(OrchError::LockTimeout { .. }) if Self::recover_stale(&path, name)? => {
                // Retry exactly once after clearing a dead holder's file.
                self.acquire_at(&path, name, mode, timeout)
            }
            Err(e) => Err(e),
        }
    }

    fn acquire_at(
        &self,
        path: &Path,
        name: &str,
        mode: LockMode,
        timeout: Duration,
    ) -> OrchResult<ResourceLock> {
        refuse_symlink(path)?;

        let deadline = Instant::now() + timeout;
        let arg = match mode {
            LockMode::Shared => FlockArg::LockSharedNonblock,
            LockMode::Exclusive => FlockArg::LockExclusiveNonblock,
        };

        loop {
            let file = open_lock_file(path)?;
            match Flock::lock(file, arg) {
                Ok(flock) => {
                    if mode == LockMode::Exclusive {
                        // pid marker for diagnostics and stale detection
                        let mut f = OpenOptions::new()
                            .write(true)
                            .truncate(true)
                            .open(path)
                            .map_err(|e| OrchError::io(path.to_path_buf(), e))?;
                        write!(f, "{}", std::process::id())
                            .map_err(|e| OrchError::io(path.to_path_buf(), e))?;
                    }
                    if let Ok(mut held) = self.held.lock() {
                        held.push((std::thread::current().id(), name.to_string()));
                    }
                    return Ok(ResourceLock {
                        flock: Some(flock),
                        name: name.to_string(),
                        path: path.to_path_buf(),
                        mode,
                        held: Arc::clone(&self.held),
                    });
                }
                Err((_, e)) if e == nix::errno::Errno::EWOULDBLOCK => {
                    if Instant::now() >= deadline {
                        return Err(OrchError::LockTimeout {
                            name: name.to_string(),
                            timeout,
                        });
                    }
                    std::thread::sleep(Duration::from_millis(ACQUIRE_POLL_INTERVAL_MS));
                }
                Err((_, e)) => {
                    return Err(OrchError::io(
                        path.to_path_buf(),
                        std::io::Error::other(e),
                    ))
                }
            }
        }
    }

    /// Returns true when a dead holder's lock file was removed and a retry
    /// is worthwhile.
    fn recover_stale(path: &Path, name: &str) -> OrchResult<bool> {
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return Ok(false),
        };
        let pid = match contents.trim().parse::<i32>() {
            Ok(pid) => pid,
            Err(_) => return Ok(false),
        };
        if is_pid_alive(pid) {
            return Ok(false);
        }

        log_warn!(
            "Recovering stale lock '{}' held by dead pid {}",
            name,
            pid
        );
        let removing = path.with_extension("removing");
        // rename-then-unlink keeps the recovery atomic with respect to
        // concurrent recoverers: only one rename succeeds.
        match fs::rename(path, &removing) {
            Ok(()) => {
                let _ = fs::remove_file(&removing);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// The canonical-order check applies per thread of execution; two
    /// threads holding unrelated locks do not constrain each other.
    fn check_order(&self, name: &str) -> OrchResult<()> {
        let rank = lock_rank(name);
        let tid = std::thread::current().id();
        if let Ok(held) = self.held.lock() {
            for (held_tid, held_name) in held.iter() {
                if *held_tid == tid && lock_rank(held_name) > rank {
                    return Err(OrchError::LockCycle {
                        requested: name.to_string(),
                        held: held_name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn refuse_symlink(path: &Path) -> OrchResult<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            Err(OrchError::LockPathNotSafe(path.to_path_buf()))
        }
        _ => Ok(()),
    }
}

/// std opens files with O_CLOEXEC, so gate child processes never inherit
/// lock descriptors.
fn open_lock_file(path: &Path) -> OrchResult<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| OrchError::io(path.to_path_buf(), e))
}

fn is_pid_alive(pid: i32) -> bool {
    // signal 0 checks if process exists without sending a signal
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

// --- Process-instance lock ---

/// A lock guard that releases the orchestrator instance lock on drop.
#[must_use = "lock is released when LockGuard is dropped"]
pub struct LockGuard {
    lock: fslock::LockFile,
    pid_path: PathBuf,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("pid_path", &self.pid_path)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            log_warn!("failed to release the instance lock: {}", e);
        }
        if let Err(e) = fs::remove_file(&self.pid_path) {
            log_warn!(
                "failed to remove PID file {}: {}",
                self.pid_path.display(),
                e
            );
        }
    }
}

/// Attempts to acquire the single-instance orchestrator lock.
///
/// Creates the containment directory if it doesn't exist. Acquires the file
/// lock first (atomic mutual exclusion), then writes a PID file for
/// diagnostics. On contention, checks the PID file to provide actionable
/// error messages about the holding process.
pub fn try_acquire(runtime_dir: &Path) -> Result<LockGuard, String> {
    fs::create_dir_all(runtime_dir)
        .map_err(|e| format!("Failed to create {}: {}", runtime_dir.display(), e))?;

    let lock_path = runtime_dir.join("orchestrator.lock");
    let pid_path = runtime_dir.join("orchestrator.pid");

    let mut lock = fslock::LockFile::open(&lock_path)
        .map_err(|e| format!("Failed to open lock file {}: {}", lock_path.display(), e))?;

    let acquired = lock
        .try_lock()
        .map_err(|e| format!("Failed to acquire lock: {}", e))?;

    if !acquired {
        let holder_info = fs::read_to_string(&pid_path)
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok());

        return match holder_info {
            Some(pid) if is_pid_alive(pid) => Err(format!(
                "Another orchestrator instance is running (PID {})",
                pid
            )),
            Some(pid) => Err(format!(
                "Lock file is held but recorded PID {} is not alive. \
                 Remove {} and {} to recover",
                pid,
                lock_path.display(),
                pid_path.display()
            )),
            None => Err(format!(
                "Another orchestrator instance holds the lock. \
                 If this is stale, remove {}",
                lock_path.display()
            )),
        };
    }

    // We hold the lock — safe to write PID
    fs::write(&pid_path, std::process::id().to_string())
        .map_err(|e| format!("Failed to write PID file: {}", e))?;

    Ok(LockGuard { lock, pid_path })
}
