//! Execution modes and their confidence thresholds.

use serde::{Deserialize, Serialize};

use super::error::ConfigError;

/// Default minimum confidence for unattended local runs.
pub const DEFAULT_AUTONOMOUS_THRESHOLD: f64 = 0.8;
/// Default minimum confidence in CI, where blocking on a human is costlier.
pub const DEFAULT_AUTONOMOUS_CI_THRESHOLD: f64 = 0.7;
/// Default retry budget.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// How fixes get approved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ModeKind {
    /// Apply fixes above the threshold without asking.
    Autonomous,
    /// Every fix waits for a human.
    HumanInLoop,
    /// Like `Autonomous`, with a lower threshold and no prompts.
    AutonomousCi,
}

impl ModeKind {
    /// Kebab-case name, as accepted in config, `--mode` and `PIPEMEND_MODE`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModeKind::Autonomous => "autonomous",
            ModeKind::HumanInLoop => "human-in-loop",
            ModeKind::AutonomousCi => "autonomous-ci",
        }
    }

    pub fn is_autonomous(&self) -> bool {
        matches!(self, ModeKind::Autonomous | ModeKind::AutonomousCi)
    }
}

impl std::fmt::Display for ModeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ModeKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "autonomous" => Ok(ModeKind::Autonomous),
            "human-in-loop" | "human-in-the-loop" | "human" => Ok(ModeKind::HumanInLoop),
            "autonomous-ci" | "ci" => Ok(ModeKind::AutonomousCi),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

/// Resolved execution mode for one loop invocation. Immutable once loaded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ExecutionMode {
    pub kind: ModeKind,
    pub min_confidence: f64,
    pub max_retries: u32,
}

impl ExecutionMode {
    /// Mode with the default threshold for its kind.
    pub fn new(kind: ModeKind) -> Self {
        let min_confidence = match kind {
            ModeKind::AutonomousCi => DEFAULT_AUTONOMOUS_CI_THRESHOLD,
            ModeKind::Autonomous | ModeKind::HumanInLoop => DEFAULT_AUTONOMOUS_THRESHOLD,
        };
        Self {
            kind,
            min_confidence,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::new(ModeKind::Autonomous)
    }
}
