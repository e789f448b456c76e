use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::definition::{RiskLevel, SupervisionMode};

/// The emergency-override sentinel. Both the variable name and the exact
/// expected value are fixed here; any other value is treated as unset.
/// Every use of the override is audited.
pub const EMERGENCY_OVERRIDE_ENV: &str = "ORCHESTRATOR_EMERGENCY_OVERRIDE";
pub const EMERGENCY_OVERRIDE_VALUE: &str = "i-understand-the-risks";

/// Env var a harness sets to declare the process runs under an autonomous
/// agent. Any non-empty value counts.
pub const AGENT_ENV_VAR: &str = "ORCHESTRATOR_AGENT";

/// Marker recorded on every bypassed manual gate.
pub const ZERO_HUMAN_MARKER: &str = "[ZERO-HUMAN MODE] gate bypassed";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperatorMode {
    Human,
    Autonomous,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ModeDetection {
    pub mode: OperatorMode,
    pub confidence: Confidence,
    pub reason: String,
}

static MODE_AUDITED: AtomicBool = AtomicBool::new(false);

/// Returns true the first time it is called in this process. The engine
/// uses this to audit the detection result exactly once.
pub fn first_detection_in_process() -> bool {
    !MODE_AUDITED.swap(true, Ordering::SeqCst)
}

#[cfg(test)]
pub fn reset_detection_flag_for_testing() {
    MODE_AUDITED.store(false, Ordering::SeqCst);
}

/// True when the emergency-override sentinel is set to its exact value.
pub fn emergency_override_active() -> bool {
    std::env::var(EMERGENCY_OVERRIDE_ENV)
        .map(|v| v == EMERGENCY_OVERRIDE_VALUE)
        .unwrap_or(false)
}

/// Detect the operator mode from the live environment.
pub fn detect(explicit: Option<OperatorMode>) -> ModeDetection {
    use std::io::IsTerminal;

    let env = |name: &str| std::env::var(name).ok();
    let stdin_is_tty = std::io::stdin().is_terminal();
    detect_with(env, stdin_is_tty, explicit)
}

/// Pure detection chain, in priority order:
/// 1. emergency-override sentinel (exact value) promotes to human
/// 2. explicit config setting
/// 3. agent-environment signal
/// 4. whether stdin is a terminal
pub fn detect_with(
    env: impl Fn(&str) -> Option<String>,
    stdin_is_tty: bool,
    explicit: Option<OperatorMode>,
) -> ModeDetection {
    if env(EMERGENCY_OVERRIDE_ENV).as_deref() == Some(EMERGENCY_OVERRIDE_VALUE) {
        return ModeDetection {
            mode: OperatorMode::Human,
            confidence: Confidence::High,
            reason: format!("emergency override sentinel {} set", EMERGENCY_OVERRIDE_ENV),
        };
    }

    if let Some(mode) = explicit {
        return ModeDetection {
            mode,
            confidence: Confidence::High,
            reason: "explicit configuration".to_string(),
        };
    }

    if env(AGENT_ENV_VAR).map(|v| !v.is_empty()).unwrap_or(false) {
        return ModeDetection {
            mode: OperatorMode::Autonomous,
            confidence: Confidence::Medium,
            reason: format!("{} is set", AGENT_ENV_VAR),
        };
    }

    if stdin_is_tty {
        ModeDetection {
            mode: OperatorMode::Human,
            confidence: Confidence::Low,
            reason: "stdin is a terminal".to_string(),
        }
    } else {
        ModeDetection {
            mode: OperatorMode::Autonomous,
            confidence: Confidence::Low,
            reason: "stdin is not a terminal".to_string(),
        }
    }
}

/// What a manual gate should do under the active policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualDisposition {
    /// Block until an explicit approval arrives.
    Block,
    /// Auto-pass, recording the zero-human marker.
    AutoPass,
}

/// Supervision policy applied to manual gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisionPolicy {
    pub mode: SupervisionMode,
}

impl SupervisionPolicy {
    pub fn new(mode: SupervisionMode) -> Self {
        Self { mode }
    }

    /// Decide a manual gate's fate given the item's risk and whether a
    /// breaking-change signal is set on the workflow.
    pub fn manual_gate_disposition(
        &self,
        risk: RiskLevel,
        breaking_change: bool,
    ) -> ManualDisposition {
        match self.mode {
            SupervisionMode::Supervised => ManualDisposition::Block,
            SupervisionMode::ZeroHuman => ManualDisposition::AutoPass,
            SupervisionMode::Hybrid => {
                if risk <= RiskLevel::Medium && !breaking_change {
                    ManualDisposition::AutoPass
                } else {
                    ManualDisposition::Block
                }
            }
        }
    }

    /// Non-skippable items may be skipped only under an audited emergency
    /// override.
    pub fn may_force_skip(&self) -> bool {
        emergency_override_active()
    }
}
