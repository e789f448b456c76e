use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{OrchError, OrchResult};

/// Review types the router understands. Definitions referencing anything
/// else are rejected at load time, not at evaluation time.
pub const KNOWN_REVIEW_TYPES: &[&str] = &["security", "quality", "consistency", "holistic"];

// --- Enums ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseType {
    #[default]
    Strict,
    Guided,
    Autonomous,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SupervisionMode {
    #[default]
    Supervised,
    ZeroHuman,
    Hybrid,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnInsufficient {
    #[default]
    Warn,
    Block,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompositeOp {
    And,
    Or,
}

/// Validators for artifact gates. Parse checks only, no schema validation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactValidator {
    Exists,
    #[default]
    NotEmpty,
    MinSize(u64),
    JsonValid,
    YamlValid,
}

// --- Gates ---

/// A programmatic check deciding whether an item may complete.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateDef {
    Artifact {
        path: String,
        #[serde(default)]
        validator: ArtifactValidator,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_path: Option<String>,
    },
    Command {
        argv: Vec<String>,
        #[serde(default)]
        expect_exit_code: i32,
        #[serde(default = "default_command_timeout_s")]
        timeout_s: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stdin: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env_overlay: HashMap<String, String>,
    },
    Manual {
        #[serde(default)]
        rationale_required: bool,
    },
    Composite {
        op: CompositeOp,
        children: Vec<GateDef>,
    },
}

fn default_command_timeout_s() -> u32 {
    60
}

// --- Definition structs ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ItemDef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub skippable: bool,
    #[serde(default)]
    pub risk: RiskLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<GateDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PhaseDef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub phase_type: PhaseType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub intended_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    #[serde(default)]
    pub items: Vec<ItemDef>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct ReviewSettings {
    pub required_reviews: Vec<String>,
    pub minimum_required: usize,
    pub fallback_chains: HashMap<String, Vec<String>>,
    pub on_insufficient: OnInsufficient,
    #[serde(default = "default_max_fallback_attempts")]
    pub max_fallback_attempts: u32,
}

pub fn default_max_fallback_attempts() -> u32 {
    2
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub supervision_mode: SupervisionMode,
    pub test_command: Option<String>,
    pub smoke_test_command: Option<String>,
    pub build_command: Option<String>,
    pub review: ReviewSettings,
    pub salt_env_var: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            supervision_mode: SupervisionMode::default(),
            test_command: None,
            smoke_test_command: None,
            build_command: None,
            review: ReviewSettings {
                max_fallback_attempts: default_max_fallback_attempts(),
                ..ReviewSettings::default()
            },
            salt_env_var: "ORCHESTRATOR_TELEMETRY_SALT".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WorkflowDef {
    pub name: String,
    #[serde(default = "default_def_version")]
    pub version: String,
    #[serde(default)]
    pub settings: Settings,
    pub phases: Vec<PhaseDef>,
}

fn default_def_version() -> String {
    "1".to_string()
}

// --- Loading & validation ---

/// Load a workflow definition from a YAML file and validate it.
pub fn load(path: &Path) -> OrchResult<WorkflowDef> {
    let contents =
        std::fs::read_to_string(path).map_err(|e| OrchError::io(path.to_path_buf(), e))?;
    let def: WorkflowDef = serde_yaml_ng::from_str(&contents)
        .map_err(|e| OrchError::Serde(format!("{}: {}", path.display(), e)))?;
    validate(&def)?;
    Ok(def)
}

/// Validate a workflow definition. Collects all problems rather than
/// stopping at the first, so a user can fix a definition in one pass.
pub fn validate(def: &WorkflowDef) -> OrchResult<()> {
    let mut errors = Vec::new();

    if def.phases.is_empty() {
        errors.push("workflow must have at least one phase".to_string());
    }

    let mut seen_phases = HashSet::new();
    for phase in &def.phases {
        if !seen_phases.insert(&phase.id) {
            errors.push(format!("duplicate phase id '{}'", phase.id));
        }

        let mut seen_items = HashSet::new();
        for item in &phase.items {
            if !seen_items.insert(&item.id) {
                errors.push(format!(
                    "phase '{}': duplicate item id '{}'",
                    phase.id, item.id
                ));
            }

            if let Some(ref review_type) = item.review_type {
                if !KNOWN_REVIEW_TYPES.contains(&review_type.as_str()) {
                    errors.push(format!(
                        "phase '{}', item '{}': unknown review type '{}' (known: {})",
                        phase.id,
                        item.id,
                        review_type,
                        KNOWN_REVIEW_TYPES.join(", ")
                    ));
                }
            }

            if let Some(ref gate) = item.verification {
                validate_gate(gate, &phase.id, &item.id, &mut errors);
            }
        }
    }

    let review = &def.settings.review;
    for review_type in &review.required_reviews {
        if !KNOWN_REVIEW_TYPES.contains(&review_type.as_str()) {
            errors.push(format!(
                "settings.review.required_reviews: unknown review type '{}'",
                review_type
            ));
        }
    }
    if review.minimum_required > review.required_reviews.len() {
        errors.push(format!(
            "settings.review.minimum_required ({}) exceeds required_reviews count ({})",
            review.minimum_required,
            review.required_reviews.len()
        ));
    }
    for (review_type, chain) in &review.fallback_chains {
        if !KNOWN_REVIEW_TYPES.contains(&review_type.as_str()) {
            errors.push(format!(
                "settings.review.fallback_chains: unknown review type '{}'",
                review_type
            ));
        }
        for model in chain {
            if !is_safe_model_id(model) {
                errors.push(format!(
                    "settings.review.fallback_chains.{}: invalid model id '{}'",
                    review_type, model
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(OrchError::InvalidDefinition(errors))
    }
}

fn validate_gate(gate: &GateDef, phase_id: &str, item_id: &str, errors: &mut Vec<String>) {
    match gate {
        GateDef::Artifact { path, .. } => {
            if path.is_empty() {
                errors.push(format!(
                    "phase '{}', item '{}': artifact gate has empty path",
                    phase_id, item_id
                ));
            }
        }
        GateDef::Command { argv, timeout_s, .. } => {
            if argv.is_empty() {
                errors.push(format!(
                    "phase '{}', item '{}': command gate has empty argv",
                    phase_id, item_id
                ));
            }
            if *timeout_s == 0 {
                errors.push(format!(
                    "phase '{}', item '{}': command gate timeout_s must be >= 1",
                    phase_id, item_id
                ));
            }
        }
        GateDef::Manual { .. } => {}
        GateDef::Composite { children, .. } => {
            if children.is_empty() {
                errors.push(format!(
                    "phase '{}', item '{}': composite gate has no children",
                    phase_id, item_id
                ));
            }
            for child in children {
                validate_gate(child, phase_id, item_id, errors);
            }
        }
    }
}

/// Model ids and template substitutions share the same allowed character
/// set. Flag-like values are rejected separately by callers that exec.
pub fn is_safe_model_id(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'))
}

impl WorkflowDef {
    pub fn phase(&self, phase_id: &str) -> Option<&PhaseDef> {
        self.phases.iter().find(|p| p.id == phase_id)
    }

    pub fn item(&self, phase_id: &str, item_id: &str) -> Option<&ItemDef> {
        self.phase(phase_id)?.items.iter().find(|i| i.id == item_id)
    }
}
