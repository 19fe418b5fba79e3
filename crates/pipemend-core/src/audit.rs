//! Append-only audit trail.
//!
//! Four JSON-lines logs live in the audit directory:
//! - `run_history.jsonl`: every runner invocation with unit counts
//! - `error_log.jsonl`: every classified failure
//! - `fix_history.jsonl`: every proposal and what became of it
//! - `loop_events.jsonl`: transitions, approvals and outcomes
//!
//! One JSON object per line keeps the logs both greppable and parseable.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain::classification::ErrorKind;
use crate::domain::error::Result;
use crate::domain::execution::{RunStatus, UnitStatus};
use crate::domain::mode::ModeKind;
use crate::gate::GateDecision;
use crate::orchestration::state::{LoopIssue, LoopOutcome, LoopPhase};

pub const RUN_HISTORY_FILE: &str = "run_history.jsonl";
pub const ERROR_LOG_FILE: &str = "error_log.jsonl";
pub const FIX_HISTORY_FILE: &str = "fix_history.jsonl";
pub const LOOP_EVENTS_FILE: &str = "loop_events.jsonl";

/// One runner invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub timestamp: DateTime<Utc>,
    pub loop_id: String,
    pub attempt: u32,
    pub scope: String,
    pub command: String,
    pub status: RunStatus,
    pub duration_ms: u64,
    pub pass: usize,
    pub fail: usize,
    pub skip: usize,
}

/// One classified failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub loop_id: String,
    pub attempt: u32,
    pub unit: Option<String>,
    pub error_text: String,
    pub kind: ErrorKind,
    pub root_cause: String,
    pub confidence_seed: f64,
    pub rule: Option<String>,
}

/// One proposal and its fate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixRecord {
    pub timestamp: DateTime<Utc>,
    pub loop_id: String,
    pub attempt: u32,
    pub mode: ModeKind,
    pub artifact: String,
    pub old_text: String,
    pub new_text: String,
    pub confidence: f64,
    pub decision: GateDecision,
    pub applied: bool,
    pub rolled_back: bool,
    /// `None` when no verification ran.
    pub verified: Option<bool>,
}

/// Loop-level happenings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    Transition { from: LoopPhase, to: LoopPhase },
    Issue { issue: LoopIssue },
    Finished { outcome: LoopOutcome, duration_ms: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoopEventRecord {
    pub timestamp: DateTime<Utc>,
    pub loop_id: String,
    pub attempt: u32,
    #[serde(flatten)]
    pub event: LoopEvent,
}

/// Any audit entry.
#[derive(Debug, Clone, PartialEq)]
pub enum AuditRecord {
    Run(RunRecord),
    Error(ErrorRecord),
    Fix(FixRecord),
    Event(LoopEventRecord),
}

impl AuditRecord {
    /// Log file the record belongs in.
    pub fn file_name(&self) -> &'static str {
        match self {
            AuditRecord::Run(_) => RUN_HISTORY_FILE,
            AuditRecord::Error(_) => ERROR_LOG_FILE,
            AuditRecord::Fix(_) => FIX_HISTORY_FILE,
            AuditRecord::Event(_) => LOOP_EVENTS_FILE,
        }
    }

    fn to_json_line(&self) -> Result<String> {
        let line = match self {
            AuditRecord::Run(r) => serde_json::to_string(r)?,
            AuditRecord::Error(r) => serde_json::to_string(r)?,
            AuditRecord::Fix(r) => serde_json::to_string(r)?,
            AuditRecord::Event(r) => serde_json::to_string(r)?,
        };
        Ok(line)
    }
}

impl RunRecord {
    pub fn from_result(
        loop_id: &str,
        attempt: u32,
        scope: &str,
        result: &crate::domain::execution::ExecutionResult,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            loop_id: loop_id.to_string(),
            attempt,
            scope: scope.to_string(),
            command: result.command.clone(),
            status: result.status,
            duration_ms: result.duration_ms,
            pass: result.count(UnitStatus::Success) + result.count(UnitStatus::Warn),
            fail: result.count(UnitStatus::Error),
            skip: result.count(UnitStatus::Skipped),
        }
    }
}

/// Destination for audit records.
pub trait AuditSink: Send + Sync {
    fn append(&self, record: &AuditRecord) -> Result<()>;
}

/// JSON-lines audit log in a directory.
#[derive(Debug)]
pub struct JsonlAuditLog {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl JsonlAuditLog {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }
}

impl AuditSink for JsonlAuditLog {
    fn append(&self, record: &AuditRecord) -> Result<()> {
        let mut line = record.to_json_line()?;
        line.push('\n');
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(record.file_name()))?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

/// In-memory audit sink.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn runs(&self) -> Vec<RunRecord> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                AuditRecord::Run(run) => Some(run),
                _ => None,
            })
            .collect()
    }

    pub fn fixes(&self) -> Vec<FixRecord> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                AuditRecord::Fix(fix) => Some(fix),
                _ => None,
            })
            .collect()
    }
}

impl AuditSink for MemoryAuditLog {
    fn append(&self, record: &AuditRecord) -> Result<()> {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
        Ok(())
    }
}

/// Read every record from one audit log file. Blank lines are skipped.
pub fn read_audit_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = std::fs::File::open(path)?;
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}
