//! Execution results and per-unit outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Overall status of one build invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failure,
}

/// Status of a single unit (model, test, seed, snapshot).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Success,
    Warn,
    Error,
    Skipped,
}

impl UnitStatus {
    /// Map a build-tool status label onto a unit status.
    ///
    /// Unrecognised labels are treated as errors.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "success" | "pass" | "ok" => UnitStatus::Success,
            "warn" | "warning" => UnitStatus::Warn,
            "skipped" | "skip" | "no-op" => UnitStatus::Skipped,
            _ => UnitStatus::Error,
        }
    }

    /// Only errors fail a run; warnings and skips do not.
    pub fn is_failure(&self) -> bool {
        matches!(self, UnitStatus::Error)
    }
}

/// Result of one execution unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnitResult {
    /// Unit identifier (e.g. `model.shop.stg_orders`).
    pub unit_id: String,

    pub status: UnitStatus,

    /// Status or error message reported for the unit.
    pub message: String,

    /// Execution time in milliseconds.
    pub duration_ms: u64,
}

impl UnitResult {
    pub fn new(
        unit_id: impl Into<String>,
        status: UnitStatus,
        message: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            unit_id: unit_id.into(),
            status,
            message: message.into(),
            duration_ms,
        }
    }

    /// Short unit name: the last dot-separated segment of the id.
    pub fn name(&self) -> &str {
        unit_name(&self.unit_id)
    }
}

/// Short name of a unit id (`model.shop.stg_orders` -> `stg_orders`).
pub fn unit_name(unit_id: &str) -> &str {
    unit_id.rsplit('.').next().unwrap_or(unit_id)
}

/// Outcome of one Execution Runner invocation. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub status: RunStatus,

    /// Per-unit results in execution order.
    pub units: Vec<UnitResult>,

    /// Total wall-clock duration in milliseconds.
    pub duration_ms: u64,

    /// Raw error text when the run failed.
    pub error_text: Option<String>,

    /// Process exit code, if the process exited normally.
    pub exit_code: Option<i32>,

    /// Command line that produced this result.
    pub command: String,

    pub started_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// Build a result from unit outcomes.
    ///
    /// The run is a failure when the exit code is non-zero or any unit
    /// errored, so a zero-exit run with failed units still counts as failed.
    pub fn new(
        command: impl Into<String>,
        exit_code: Option<i32>,
        units: Vec<UnitResult>,
        duration_ms: u64,
        error_text: Option<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let exited_clean = exit_code == Some(0);
        let unit_failed = units.iter().any(|u| u.status.is_failure());
        let status = if exited_clean && !unit_failed {
            RunStatus::Success
        } else {
            RunStatus::Failure
        };
        let error_text = match status {
            RunStatus::Success => None,
            RunStatus::Failure => error_text.filter(|t| !t.trim().is_empty()).or_else(|| {
                units
                    .iter()
                    .find(|u| u.status.is_failure())
                    .map(|u| u.message.clone())
            }),
        };

        Self {
            status,
            units,
            duration_ms,
            error_text,
            exit_code,
            command: command.into(),
            started_at,
        }
    }

    /// True for a clean exit with no errored unit.
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// First unit that errored, if any.
    pub fn first_failed_unit(&self) -> Option<&UnitResult> {
        self.units.iter().find(|u| u.status.is_failure())
    }

    pub fn count(&self, status: UnitStatus) -> usize {
        self.units.iter().filter(|u| u.status == status).count()
    }
}
