use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::definition::{is_safe_model_id, SupervisionMode};

/// Runtime configuration loaded from `orchestrate.toml` at the repo root.
///
/// The workflow definition (`workflow.yaml`) owns workflow semantics; this
/// file owns operator-side knobs: supervision override, provider wiring,
/// lock patience, and retry pacing.
#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct OrchestrateConfig {
    pub supervision: SupervisionConfig,
    pub execution: ExecutionConfig,
    pub retry: RetryConfig,
    pub providers: HashMap<String, ProviderConfig>,
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SupervisionConfig {
    /// When set, overrides the workflow definition's `supervision_mode`.
    pub mode: Option<SupervisionMode>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    pub lock_timeout_secs: u64,
    pub command_output_cap_bytes: usize,
    pub sigterm_grace_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: 10,
            command_output_cap_bytes: 1024 * 1024,
            sigterm_grace_secs: 5,
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub factor: u32,
    pub max_attempts: u32,
    /// Jitter applied to each delay, as a fraction (0.2 = plus or minus 20%).
    pub jitter: f64,
    pub call_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            factor: 2,
            max_attempts: 3,
            jitter: 0.2,
            call_timeout_secs: 120,
        }
    }
}

/// One review model provider endpoint. The key in `providers` is the model
/// id referenced by fallback chains in the workflow definition.
#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderConfig {
    pub endpoint: Option<String>,
    pub api_key_env: Option<String>,
    pub model: Option<String>,
}

pub fn validate(config: &OrchestrateConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.retry.max_attempts < 1 {
        errors.push("retry.max_attempts must be >= 1".to_string());
    }
    if config.retry.factor < 1 {
        errors.push("retry.factor must be >= 1".to_string());
    }
    if !(0.0..1.0).contains(&config.retry.jitter) {
        errors.push("retry.jitter must be in [0.0, 1.0)".to_string());
    }
    if config.execution.lock_timeout_secs == 0 {
        errors.push("execution.lock_timeout_secs must be >= 1".to_string());
    }

    for (model_id, provider) in &config.providers {
        if !is_safe_model_id(model_id) {
            errors.push(format!(
                "providers.{}: model id contains invalid characters (allowed: alphanumeric, '.', '_', '/', '-')",
                model_id
            ));
        } else if model_id.starts_with('-') {
            errors.push(format!(
                "providers.{}: model id must not start with '-' (flag-like values are rejected)",
                model_id
            ));
        }
        if let Some(ref endpoint) = provider.endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                errors.push(format!(
                    "providers.{}: endpoint must be an http(s) URL",
                    model_id
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Load config from an explicit path (if provided) or fall back to
/// `{repo_root}/orchestrate.toml`.
///
/// When `config_path` is `Some`, the file MUST exist. When `None`, a
/// missing file yields defaults.
pub fn load_config_from(
    config_path: Option<&Path>,
    repo_root: &Path,
) -> Result<OrchestrateConfig, String> {
    match config_path {
        Some(path) => {
            if !path.exists() {
                return Err(format!("Config file not found: {}", path.display()));
            }
            load_config_at(path)
        }
        None => load_config(repo_root),
    }
}

pub fn load_config(repo_root: &Path) -> Result<OrchestrateConfig, String> {
    let config_path = repo_root.join("orchestrate.toml");
    if !config_path.exists() {
        return Ok(OrchestrateConfig::default());
    }
    load_config_at(&config_path)
}

fn load_config_at(path: &Path) -> Result<OrchestrateConfig, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;

    let config: OrchestrateConfig = toml::from_str(&contents)
        .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;

    validate(&config).map_err(|errors| {
        format!(
            "Config validation failed:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        )
    })?;

    Ok(config)
}
