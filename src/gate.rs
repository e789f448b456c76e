use std::collections::HashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::definition::{ArtifactValidator, CompositeOp, GateDef, Settings};
use crate::error::{OrchError, OrchResult};
use crate::mode::{ManualDisposition, ZERO_HUMAN_MARKER};
use crate::state::GateRecord;
use crate::{log_debug, log_warn};

/// Maximum time to wait for graceful shutdown after SIGTERM before SIGKILL.
const SIGTERM_GRACE_PERIOD_SECONDS: u64 = 5;

/// Polling interval when waiting for a process group to exit after SIGTERM.
const KILL_POLL_INTERVAL_MS: u64 = 100;

/// Hard cap on captured stdout/stderr bytes per stream.
pub const OUTPUT_CAP_BYTES: usize = 1024 * 1024;

// --- Shutdown flag & process registry ---

/// Global shutdown flag shared with signal handlers.
fn shutdown_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

/// Check if a shutdown has been requested via signal.
pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

/// Install signal handlers for SIGTERM and SIGINT that set the shutdown flag.
///
/// Call once at program startup. Subsequent calls are safe.
pub fn install_signal_handlers() -> Result<(), String> {
    let flag = Arc::clone(shutdown_flag());
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .map_err(|e| format!("Failed to register SIGTERM handler: {}", e))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag)
        .map_err(|e| format!("Failed to register SIGINT handler: {}", e))?;
    Ok(())
}

/// Global registry of active gate child process group IDs.
fn process_registry() -> &'static Arc<std::sync::Mutex<HashSet<Pid>>> {
    static REGISTRY: OnceLock<Arc<std::sync::Mutex<HashSet<Pid>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Arc::new(std::sync::Mutex::new(HashSet::new())))
}

fn register_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.insert(pgid);
    }
}

fn unregister_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.remove(&pgid);
    }
}

/// Kill all registered gate child process groups: SIGTERM, grace period,
/// then SIGKILL survivors. Clears the registry when done.
pub fn kill_all_children() {
    use nix::sys::signal::{killpg, Signal};

    let pgids: Vec<Pid> = {
        let Ok(registry) = process_registry().lock() else {
            return;
        };
        registry.iter().copied().collect()
    };

    if pgids.is_empty() {
        return;
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGTERM);
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
    let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);
    while std::time::Instant::now() < deadline {
        let all_gone = pgids
            .iter()
            .all(|&pgid| matches!(killpg(pgid, None), Err(nix::errno::Errno::ESRCH)));
        if all_gone {
            break;
        }
        std::thread::sleep(poll_interval);
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGKILL);
    }

    if let Ok(mut registry) = process_registry().lock() {
        registry.clear();
    }
}

// --- Gate evaluation ---

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GateResult {
    pub passed: bool,
    pub details: Vec<String>,
    pub exit_code: Option<i32>,
    pub artifact_path: Option<PathBuf>,
}

impl GateResult {
    pub fn pass(detail: impl Into<String>) -> Self {
        Self {
            passed: true,
            details: vec![detail.into()],
            ..Self::default()
        }
    }

    pub fn fail(detail: impl Into<String>) -> Self {
        Self {
            passed: false,
            details: vec![detail.into()],
            ..Self::default()
        }
    }

    pub fn to_record(&self) -> GateRecord {
        GateRecord {
            passed: self.passed,
            details: self.details.clone(),
            exit_code: self.exit_code,
            artifact_path: self
                .artifact_path
                .as_ref()
                .map(|p| p.display().to_string()),
        }
    }
}

/// Everything a gate evaluation needs besides the gate definition itself.
/// Evaluation never mutates workflow state.
pub struct GateContext {
    /// Repo root; artifact gates resolve inside it, command gates run in it.
    pub base_path: PathBuf,
    /// Disposition for manual gates under the active supervision policy.
    pub manual_disposition: ManualDisposition,
    /// Rationale supplied by an external approval, when one arrived.
    pub approval_rationale: Option<String>,
    /// Byte cap applied to each captured child output stream.
    pub output_cap: usize,
    pub cancel: CancellationToken,
}

/// Evaluate a gate definition. Pure with respect to workflow state; may
/// touch the filesystem and exec processes.
pub async fn evaluate(gate: &GateDef, ctx: &GateContext) -> OrchResult<GateResult> {
    match gate {
        GateDef::Artifact {
            path,
            validator,
            base_path,
        } => {
            let base = match base_path {
                Some(p) => ctx.base_path.join(p),
                None => ctx.base_path.clone(),
            };
            evaluate_artifact(path, validator, &base)
        }
        GateDef::Command {
            argv,
            expect_exit_code,
            timeout_s,
            stdin,
            env_overlay,
        } => {
            evaluate_command(
                argv,
                *expect_exit_code,
                Duration::from_secs(*timeout_s as u64),
                stdin.as_deref(),
                env_overlay,
                ctx,
            )
            .await
        }
        GateDef::Manual { rationale_required } => {
            Ok(evaluate_manual(*rationale_required, ctx))
        }
        GateDef::Composite { op, children } => {
            let mut details = Vec::new();
            match op {
                CompositeOp::And => {
                    for child in children {
                        let result = Box::pin(evaluate(child, ctx)).await?;
                        details.extend(result.details.clone());
                        if !result.passed {
                            return Ok(GateResult {
                                passed: false,
                                details,
                                exit_code: result.exit_code,
                                artifact_path: result.artifact_path,
                            });
                        }
                    }
                    Ok(GateResult {
                        passed: true,
                        details,
                        ..GateResult::default()
                    })
                }
                CompositeOp::Or => {
                    for child in children {
                        let result = Box::pin(evaluate(child, ctx)).await?;
                        details.extend(result.details.clone());
                        if result.passed {
                            return Ok(GateResult {
                                passed: true,
                                details,
                                exit_code: result.exit_code,
                                artifact_path: result.artifact_path,
                            });
                        }
                    }
                    Ok(GateResult {
                        passed: false,
                        details,
                        ..GateResult::default()
                    })
                }
            }
        }
    }
}

// --- Artifact gates ---

/// Resolve and validate an artifact path without ever following an escape
/// outside the base directory. Traversal components and symlinks whose
/// targets leave the base are `PathTraversal` errors; the target is never
/// read.
fn evaluate_artifact(
    raw_path: &str,
    validator: &ArtifactValidator,
    base: &Path,
) -> OrchResult<GateResult> {
    use std::path::Component;

    let rel = Path::new(raw_path);
    if rel.is_absolute()
        || rel
            .components()
            .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(OrchError::PathTraversal(rel.to_path_buf()));
    }

    let base_canonical = match base.canonicalize() {
        Ok(p) => p,
        Err(e) => return Ok(GateResult::fail(format!("base path unavailable: {}", e))),
    };
    let full = base_canonical.join(rel);

    let exists = full.symlink_metadata().is_ok();
    if exists {
        match full.canonicalize() {
            Ok(resolved) if resolved.starts_with(&base_canonical) => {}
            Ok(_) => return Err(OrchError::PathTraversal(full)),
            Err(e) => {
                return Ok(GateResult::fail(format!(
                    "cannot resolve {}: {}",
                    raw_path, e
                )))
            }
        }
    }

    let mut result = match validator {
        ArtifactValidator::Exists => {
            if exists {
                GateResult::pass(format!("{} exists", raw_path))
            } else {
                GateResult::fail(format!("{} does not exist", raw_path))
            }
        }
        ArtifactValidator::NotEmpty => match std::fs::metadata(&full) {
            Ok(meta) if meta.len() > 0 => {
                GateResult::pass(format!("{} is non-empty ({} bytes)", raw_path, meta.len()))
            }
            Ok(_) => GateResult::fail(format!("{} is empty", raw_path)),
            Err(_) => GateResult::fail(format!("{} does not exist", raw_path)),
        },
        ArtifactValidator::MinSize(min) => match std::fs::metadata(&full) {
            Ok(meta) if meta.len() >= *min => GateResult::pass(format!(
                "{} has {} bytes (minimum {})",
                raw_path,
                meta.len(),
                min
            )),
            Ok(meta) => GateResult::fail(format!(
                "{} has {} bytes, below minimum {}",
                raw_path,
                meta.len(),
                min
            )),
            Err(_) => GateResult::fail(format!("{} does not exist", raw_path)),
        },
        ArtifactValidator::JsonValid => match std::fs::read_to_string(&full) {
            Ok(contents) => match serde_json::from_str::<serde_json::Value>(&contents) {
                Ok(_) => GateResult::pass(format!("{} parses as JSON", raw_path)),
                Err(e) => GateResult::fail(format!("{} is not valid JSON: {}", raw_path, e)),
            },
            Err(e) => GateResult::fail(format!("cannot read {}: {}", raw_path, e)),
        },
        ArtifactValidator::YamlValid => match std::fs::read_to_string(&full) {
            Ok(contents) => match serde_yaml_ng::from_str::<serde_yaml_ng::Value>(&contents) {
                Ok(_) => GateResult::pass(format!("{} parses as YAML", raw_path)),
                Err(e) => GateResult::fail(format!("{} is not valid YAML: {}", raw_path, e)),
            },
            Err(e) => GateResult::fail(format!("cannot read {}: {}", raw_path, e)),
        },
    };

    result.artifact_path = Some(full);
    Ok(result)
}

// --- Manual gates ---

fn evaluate_manual(rationale_required: bool, ctx: &GateContext) -> GateResult {
    match ctx.manual_disposition {
        ManualDisposition::AutoPass => GateResult::pass(ZERO_HUMAN_MARKER),
        ManualDisposition::Block => match ctx.approval_rationale.as_deref() {
            Some(rationale) if !rationale_required || !rationale.trim().is_empty() => {
                GateResult::pass(format!("approved: {}", rationale))
            }
            Some(_) => GateResult::fail("approval rationale required but empty"),
            None => GateResult::fail(
                "awaiting manual approval; run `orchestrate approve <item_id> --rationale ...`",
            ),
        },
    }
}

// --- Command gates ---

/// Shell builtins emulated in-process so smoke tests need no shell.
fn builtin_exit_code(argv: &[String]) -> Option<i32> {
    match argv.first().map(String::as_str) {
        Some("true") => Some(0),
        Some("false") => Some(1),
        Some("exit") => Some(
            argv.get(1)
                .and_then(|s| s.parse::<i32>().ok())
                .unwrap_or(0),
        ),
        _ => None,
    }
}

async fn evaluate_command(
    argv: &[String],
    expect_exit_code: i32,
    timeout: Duration,
    stdin_payload: Option<&str>,
    env_overlay: &HashMap<String, String>,
    ctx: &GateContext,
) -> OrchResult<GateResult> {
    if argv.is_empty() {
        return Ok(GateResult::fail("command gate has empty argv"));
    }

    if let Some(code) = builtin_exit_code(argv) {
        let passed = code == expect_exit_code;
        return Ok(GateResult {
            passed,
            details: vec![format!(
                "builtin `{}` exited {} (expected {})",
                argv.join(" "),
                code,
                expect_exit_code
            )],
            exit_code: Some(code),
            artifact_path: None,
        });
    }

    // argv is execed directly; elements reach the child byte-for-byte.
    let mut cmd = tokio::process::Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd.current_dir(&ctx.base_path);
    for (key, value) in env_overlay {
        cmd.env(key, value);
    }
    cmd.stdin(if stdin_payload.is_some() {
        std::process::Stdio::piped()
    } else {
        std::process::Stdio::null()
    });
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    // SAFETY: pre_exec runs between fork() and exec() where only
    // async-signal-safe functions are permitted. setpgid qualifies.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                .map_err(std::io::Error::other)?;
            Ok(())
        });
    }

    log_debug!("[gate] Spawning {:?}", argv);
    let mut child = cmd
        .spawn()
        .map_err(|e| OrchError::io(PathBuf::from(&argv[0]), e))?;

    let child_pid = child.id().map(|id| id as i32).unwrap_or(0);
    let pgid = Pid::from_raw(child_pid);
    register_child(pgid);

    if let (Some(payload), Some(mut stdin)) = (stdin_payload, child.stdin.take()) {
        use tokio::io::AsyncWriteExt;
        let payload = payload.to_string();
        tokio::spawn(async move {
            let _ = stdin.write_all(payload.as_bytes()).await;
        });
    }

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_task = tokio::spawn(read_capped(stdout, ctx.output_cap));
    let stderr_task = tokio::spawn(read_capped(stderr, ctx.output_cap));

    let wait_result = tokio::select! {
        result = tokio::time::timeout(timeout, child.wait()) => result,
        _ = ctx.cancel.cancelled() => {
            kill_process_group(child_pid).await;
            let _ = child.wait().await;
            unregister_child(pgid);
            return Err(OrchError::Cancelled);
        }
    };

    let exit_status = match wait_result {
        Err(_) => {
            log_debug!(
                "[gate] TIMEOUT after {}s — killing process group",
                timeout.as_secs()
            );
            kill_process_group(child_pid).await;
            let _ = child.wait().await;
            unregister_child(pgid);
            return Err(OrchError::GateTimeout(timeout));
        }
        Ok(result) => {
            unregister_child(pgid);
            result.map_err(|e| OrchError::io(PathBuf::from(&argv[0]), e))?
        }
    };

    let stdout_text = stdout_task.await.unwrap_or_default();
    let stderr_text = stderr_task.await.unwrap_or_default();

    let exit_code = exit_status.code().unwrap_or(-1);
    let passed = exit_code == expect_exit_code;

    let mut details = vec![format!(
        "`{}` exited {} (expected {})",
        argv.join(" "),
        exit_code,
        expect_exit_code
    )];
    if !stdout_text.is_empty() {
        details.push(format!("stdout: {}", stdout_text));
    }
    if !stderr_text.is_empty() {
        details.push(format!("stderr: {}", stderr_text));
    }

    Ok(GateResult {
        passed,
        details,
        exit_code: Some(exit_code),
        artifact_path: None,
    })
}

/// Read a child stream up to `cap` bytes, then drain the rest so the child
/// never blocks on a full pipe. Notes truncation in the returned text.
async fn read_capped<R>(reader: Option<R>, cap: usize) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return String::new();
    };

    let mut buf = vec![0u8; 8192];
    let mut captured: Vec<u8> = Vec::new();
    let mut truncated = false;

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if captured.len() < cap {
                    let take = n.min(cap - captured.len());
                    captured.extend_from_slice(&buf[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }

    let mut text = String::from_utf8_lossy(&captured).trim_end().to_string();
    if truncated {
        text.push_str("\n[output truncated]");
    }
    text
}

/// Kill a process group by PID. Sends SIGTERM, polls for exit, then SIGKILL
/// if needed. Runs on the blocking pool to avoid stalling async workers.
async fn kill_process_group(pgid: i32) {
    tokio::task::spawn_blocking(move || {
        use nix::sys::signal::{killpg, Signal};

        let pgid = Pid::from_raw(pgid);

        if let Err(nix::errno::Errno::ESRCH) = killpg(pgid, Signal::SIGTERM) {
            return; // already gone
        }

        let deadline =
            std::time::Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
        let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

        while std::time::Instant::now() < deadline {
            match killpg(pgid, None) {
                Err(nix::errno::Errno::ESRCH) => return,
                _ => std::thread::sleep(poll_interval),
            }
        }

        let _ = killpg(pgid, Signal::SIGKILL);
    })
    .await
    .unwrap_or_else(|e| log_warn!("kill_process_group task panicked: {}", e));
}

// --- Template substitution ---

/// Resolve `{{test_command}}`-style placeholders in a command gate's argv
/// against the workflow settings.
///
/// A standalone `{{var}}` element expands to one argv element per
/// whitespace-separated word of the value; embedded placeholders must
/// resolve to a single safe token. Every substituted word is validated
/// against `[A-Za-z0-9._/-]+`; anything else rejects the substitution.
pub fn substitute_templates(argv: &[String], settings: &Settings) -> OrchResult<Vec<String>> {
    let lookup = |name: &str| -> Option<&str> {
        match name {
            "test_command" => settings.test_command.as_deref(),
            "smoke_test_command" => settings.smoke_test_command.as_deref(),
            "build_command" => settings.build_command.as_deref(),
            _ => None,
        }
    };

    let mut out = Vec::with_capacity(argv.len());
    for element in argv {
        let trimmed = element.trim();
        if let Some(name) = template_name(trimmed) {
            let value = lookup(name).ok_or_else(|| OrchError::UnsafeTemplateArg {
                name: name.to_string(),
                value: "<unset>".to_string(),
            })?;
            for word in value.split_whitespace() {
                validate_template_word(name, word)?;
                out.push(word.to_string());
            }
        } else if element.contains("{{") {
            out.push(substitute_embedded(element, &lookup)?);
        } else {
            out.push(element.clone());
        }
    }
    Ok(out)
}

fn template_name(element: &str) -> Option<&str> {
    let inner = element.strip_prefix("{{")?.strip_suffix("}}")?;
    let inner = inner.trim();
    (!inner.is_empty() && !inner.contains("{{")).then_some(inner)
}

fn substitute_embedded<'a>(
    element: &str,
    lookup: &impl Fn(&str) -> Option<&'a str>,
) -> OrchResult<String> {
    // Embedded form: the value must be a single safe token.
    let mut result = String::new();
    let mut rest = element;
    while let Some(start) = rest.find("{{") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| OrchError::UnsafeTemplateArg {
            name: element.to_string(),
            value: "unterminated placeholder".to_string(),
        })?;
        let name = after[..end].trim();
        let value = lookup(name).ok_or_else(|| OrchError::UnsafeTemplateArg {
            name: name.to_string(),
            value: "<unset>".to_string(),
        })?;
        validate_template_word(name, value)?;
        result.push_str(value);
        rest = &after[end + 2..];
    }
    result.push_str(rest);
    Ok(result)
}

fn validate_template_word(name: &str, word: &str) -> OrchResult<()> {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'));
    if safe {
        Ok(())
    } else {
        Err(OrchError::UnsafeTemplateArg {
            name: name.to_string(),
            value: word.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_in(base: &Path) -> GateContext {
        GateContext {
            base_path: base.to_path_buf(),
            manual_disposition: ManualDisposition::Block,
            approval_rationale: None,
            output_cap: OUTPUT_CAP_BYTES,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn builtin_table_covers_true_false_exit() {
        let argv = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(builtin_exit_code(&argv(&["true"])), Some(0));
        assert_eq!(builtin_exit_code(&argv(&["false"])), Some(1));
        assert_eq!(builtin_exit_code(&argv(&["exit", "7"])), Some(7));
        assert_eq!(builtin_exit_code(&argv(&["exit"])), Some(0));
        assert_eq!(builtin_exit_code(&argv(&["ls"])), None);
    }

    #[test]
    fn traversal_path_is_a_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = evaluate_artifact("../outside.txt", &ArtifactValidator::Exists, dir.path());
        assert!(matches!(result, Err(OrchError::PathTraversal(_))));
    }

    #[test]
    fn absolute_path_is_a_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = evaluate_artifact("/etc/passwd", &ArtifactValidator::Exists, dir.path());
        assert!(matches!(result, Err(OrchError::PathTraversal(_))));
    }

    #[test]
    fn default_validator_requires_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("empty.md"), "").unwrap();
        std::fs::write(dir.path().join("full.md"), "plan\n").unwrap();

        let empty = evaluate_artifact("empty.md", &ArtifactValidator::NotEmpty, dir.path()).unwrap();
        assert!(!empty.passed);
        let full = evaluate_artifact("full.md", &ArtifactValidator::NotEmpty, dir.path()).unwrap();
        assert!(full.passed);
    }

    #[test]
    fn json_validator_is_parse_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ok.json"), "{\"any\": [1, 2]}").unwrap();
        std::fs::write(dir.path().join("bad.json"), "{nope").unwrap();

        assert!(
            evaluate_artifact("ok.json", &ArtifactValidator::JsonValid, dir.path())
                .unwrap()
                .passed
        );
        assert!(
            !evaluate_artifact("bad.json", &ArtifactValidator::JsonValid, dir.path())
                .unwrap()
                .passed
        );
    }

    #[cfg(unix)]
    #[test]
    fn escaping_symlink_fails() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "s").unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            dir.path().join("link.txt"),
        )
        .unwrap();

        let result = evaluate_artifact("link.txt", &ArtifactValidator::NotEmpty, dir.path());
        assert!(matches!(result, Err(OrchError::PathTraversal(_))));
    }

    #[tokio::test]
    async fn command_gate_execs_argv_directly() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_in(dir.path());
        let argv = vec![
            "echo".to_string(),
            "a b".to_string(), // one element with a space, preserved as-is
        ];
        let result = evaluate_command(&argv, 0, Duration::from_secs(10), None, &HashMap::new(), &ctx)
            .await
            .unwrap();
        assert!(result.passed);
        assert!(result.details.iter().any(|d| d.contains("a b")));
    }

    #[tokio::test]
    async fn builtin_false_fails_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_in(dir.path());
        let result = evaluate_command(
            &["false".to_string()],
            0,
            Duration::from_secs(10),
            None,
            &HashMap::new(),
            &ctx,
        )
        .await
        .unwrap();
        assert!(!result.passed);
        assert_eq!(result.exit_code, Some(1));
    }

    #[tokio::test]
    async fn command_gate_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_in(dir.path());
        let result = evaluate_command(
            &["sleep".to_string(), "30".to_string()],
            0,
            Duration::from_millis(200),
            None,
            &HashMap::new(),
            &ctx,
        )
        .await;
        assert!(matches!(result, Err(OrchError::GateTimeout(_))));
    }

    #[tokio::test]
    async fn composite_and_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_in(dir.path());
        let gate = GateDef::Composite {
            op: CompositeOp::And,
            children: vec![
                GateDef::Command {
                    argv: vec!["false".to_string()],
                    expect_exit_code: 0,
                    timeout_s: 5,
                    stdin: None,
                    env_overlay: HashMap::new(),
                },
                GateDef::Artifact {
                    path: "never-checked.md".to_string(),
                    validator: ArtifactValidator::Exists,
                    base_path: None,
                },
            ],
        };
        let result = evaluate(&gate, &ctx).await.unwrap();
        assert!(!result.passed);
        // Short circuit: the artifact child never ran
        assert!(!result.details.iter().any(|d| d.contains("never-checked")));
    }

    #[tokio::test]
    async fn composite_or_passes_on_first_success() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_in(dir.path());
        let gate = GateDef::Composite {
            op: CompositeOp::Or,
            children: vec![
                GateDef::Command {
                    argv: vec!["true".to_string()],
                    expect_exit_code: 0,
                    timeout_s: 5,
                    stdin: None,
                    env_overlay: HashMap::new(),
                },
                GateDef::Command {
                    argv: vec!["false".to_string()],
                    expect_exit_code: 0,
                    timeout_s: 5,
                    stdin: None,
                    env_overlay: HashMap::new(),
                },
            ],
        };
        let result = evaluate(&gate, &ctx).await.unwrap();
        assert!(result.passed);
    }

    #[test]
    fn manual_gate_blocks_without_approval() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_in(dir.path());
        let result = evaluate_manual(true, &ctx);
        assert!(!result.passed);
        assert!(result.details[0].contains("awaiting manual approval"));
    }

    #[test]
    fn manual_gate_autopass_records_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx_in(dir.path());
        ctx.manual_disposition = ManualDisposition::AutoPass;
        let result = evaluate_manual(true, &ctx);
        assert!(result.passed);
        assert_eq!(result.details[0], ZERO_HUMAN_MARKER);
    }

    #[test]
    fn template_expands_to_argv_words() {
        let settings = Settings {
            test_command: Some("cargo test --workspace".to_string()),
            ..Settings::default()
        };
        let argv = vec!["{{test_command}}".to_string()];
        let resolved = substitute_templates(&argv, &settings).unwrap();
        assert_eq!(resolved, vec!["cargo", "test", "--workspace"]);
    }

    #[test]
    fn unsafe_template_value_rejected() {
        let settings = Settings {
            test_command: Some("cargo test; rm -rf /".to_string()),
            ..Settings::default()
        };
        let argv = vec!["{{test_command}}".to_string()];
        let err = substitute_templates(&argv, &settings).unwrap_err();
        assert!(matches!(err, OrchError::UnsafeTemplateArg { .. }));
    }

    #[test]
    fn unset_template_variable_rejected() {
        let settings = Settings::default();
        let argv = vec!["{{build_command}}".to_string()];
        assert!(substitute_templates(&argv, &settings).is_err());
    }
}
