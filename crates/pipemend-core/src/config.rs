//! Configuration loading.
//!
//! `pipemend.toml` is read once per invocation, then overridden by the
//! environment (`PIPEMEND_MODE`) and finally by command-line flags. The
//! result is validated and turned into an immutable [`ExecutionMode`] and
//! [`LoopSettings`] handed to the loop.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::error::ConfigError;
use crate::domain::mode::{
    ExecutionMode, ModeKind, DEFAULT_AUTONOMOUS_CI_THRESHOLD, DEFAULT_AUTONOMOUS_THRESHOLD,
    DEFAULT_MAX_RETRIES,
};
use crate::orchestration::backoff::{BackoffPolicy, DEFAULT_MULTIPLIER};
use crate::orchestration::engine::LoopSettings;
use crate::proposer::artifacts::default_search_dirs;

pub const DEFAULT_CONFIG_FILE: &str = "pipemend.toml";
pub const MODE_ENV: &str = "PIPEMEND_MODE";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionSection {
    pub mode: ModeKind,
    pub max_retries: u32,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            mode: ModeKind::Autonomous,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Minimum confidence per autonomous mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThresholdsSection {
    pub autonomous: f64,
    pub autonomous_ci: f64,
}

impl Default for ThresholdsSection {
    fn default() -> Self {
        Self {
            autonomous: DEFAULT_AUTONOMOUS_THRESHOLD,
            autonomous_ci: DEFAULT_AUTONOMOUS_CI_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffSection {
    pub base_delay_secs: f64,
    pub multiplier: f64,
    pub max_delay_secs: Option<f64>,
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            base_delay_secs: 5.0,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackupSection {
    pub dir: PathBuf,
    pub retain_on_success: bool,
    /// Retained backups kept per artifact; unlimited when unset.
    pub keep: Option<usize>,
}

impl Default for BackupSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".pipemend/backups"),
            retain_on_success: false,
            keep: None,
        }
    }
}

/// The external build command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerSection {
    pub command: String,
    pub args: Vec<String>,
    /// Project root; relative paths elsewhere in the config resolve against it.
    pub work_dir: PathBuf,
    pub results_path: PathBuf,
    /// Flag used to scope a run to one unit.
    pub select_flag: String,
    pub timeout_secs: Option<u64>,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            command: "dbt".to_string(),
            args: vec!["build".to_string()],
            work_dir: PathBuf::from("."),
            results_path: PathBuf::from("target/run_results.json"),
            select_flag: "--select".to_string(),
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuditSection {
    pub dir: PathBuf,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".pipemend/audit"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CatalogSection {
    pub path: PathBuf,
}

impl Default for CatalogSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("target/catalog.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArtifactsSection {
    pub search_dirs: Vec<String>,
}

impl Default for ArtifactsSection {
    fn default() -> Self {
        Self {
            search_dirs: default_search_dirs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApprovalSection {
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReportSection {
    pub dir: PathBuf,
}

impl Default for ReportSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".pipemend/reports"),
        }
    }
}

/// Complete configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub execution: ExecutionSection,
    pub thresholds: ThresholdsSection,
    pub backoff: BackoffSection,
    pub backup: BackupSection,
    pub runner: RunnerSection,
    pub audit: AuditSection,
    pub catalog: CatalogSection,
    pub artifacts: ArtifactsSection,
    pub approval: ApprovalSection,
    pub report: ReportSection,
}

/// Command-line overrides; they win over everything else.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub mode: Option<ModeKind>,
    pub max_retries: Option<u32>,
}

impl Config {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Load `path` if it exists, otherwise start from defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = lookup(MODE_ENV).filter(|v| !v.trim().is_empty()) {
            self.execution.mode = mode.parse()?;
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(mode) = overrides.mode {
            self.execution.mode = mode;
        }
        if let Some(max_retries) = overrides.max_retries {
            self.execution.max_retries = max_retries;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("thresholds.autonomous", self.thresholds.autonomous),
            ("thresholds.autonomous_ci", self.thresholds.autonomous_ci),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(field, format!("{value} is outside [0, 1]")));
            }
        }
        if !self.backoff.multiplier.is_finite() || self.backoff.multiplier < 1.0 {
            return Err(invalid(
                "backoff.multiplier",
                format!("{} must be at least 1.0", self.backoff.multiplier),
            ));
        }
        let delays = [
            ("backoff.base_delay_secs", Some(self.backoff.base_delay_secs)),
            ("backoff.max_delay_secs", self.backoff.max_delay_secs),
        ];
        for (field, value) in delays {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(invalid(field, format!("{v} must be a non-negative number")));
                }
            }
        }
        if self.runner.command.trim().is_empty() {
            return Err(invalid("runner.command", "must not be empty".to_string()));
        }
        if self.backup.keep == Some(0) && self.backup.retain_on_success {
            return Err(invalid(
                "backup.keep",
                "must be at least 1 when backups are retained".to_string(),
            ));
        }
        Ok(())
    }

    /// File, then environment, then flags; validated.
    pub fn resolve(path: &Path, overrides: &Overrides) -> Result<Self, ConfigError> {
        let mut config = Self::load_or_default(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        let min_confidence = match self.execution.mode {
            ModeKind::AutonomousCi => self.thresholds.autonomous_ci,
            ModeKind::Autonomous | ModeKind::HumanInLoop => self.thresholds.autonomous,
        };
        ExecutionMode::new(self.execution.mode)
            .with_min_confidence(min_confidence)
            .with_max_retries(self.execution.max_retries)
    }

    pub fn loop_settings(&self) -> LoopSettings {
        let mut backoff = BackoffPolicy::new(
            secs(self.backoff.base_delay_secs),
            self.backoff.multiplier,
        );
        if let Some(max) = self.backoff.max_delay_secs {
            backoff = backoff.with_max_delay(secs(max));
        }
        LoopSettings {
            backoff,
            approval_timeout: self.approval.timeout_secs.map(Duration::from_secs),
        }
    }

    /// Resolve a configured path against the project root.
    pub fn project_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.runner.work_dir.join(path)
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

fn invalid(field: &str, reason: String) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason,
    }
}
