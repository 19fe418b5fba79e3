//! pipemend core library
//!
//! A self-healing control loop for data pipelines: run the build, classify
//! what broke, propose the smallest fix, gate it on confidence and mode,
//! apply it with a backup, verify, and retry with backoff.

pub mod approval;
pub mod audit;
pub mod backup;
pub mod classifier;
pub mod config;
pub mod domain;
pub mod gate;
pub mod obs;
pub mod orchestration;
pub mod proposer;
pub mod report;
pub mod runner;
pub mod telemetry;

pub use domain::{
    unit_name, ApplyError, ConfigError, ErrorClassification, ErrorKind, ExecutionMode,
    ExecutionResult, FixProposal, MatchQuality, ModeKind, PipemendError, Result, RunStatus,
    RunnerError, UnitResult, UnitStatus, VerificationStep,
};

pub use approval::{
    request_approval, ApprovalChannel, ApprovalRequest, ApprovalResponse, NonInteractive,
    Scripted,
};
pub use audit::{
    read_audit_records, AuditRecord, AuditSink, ErrorRecord, FixRecord, JsonlAuditLog,
    LoopEvent, LoopEventRecord, MemoryAuditLog, RunRecord,
};
pub use backup::{ApplyOutcome, BackupManager, BackupRef};
pub use classifier::{standard_rules, ClassifierRule, ErrorClassifier};
pub use config::{Config, Overrides};
pub use gate::{decide, GateDecision};
pub use orchestration::{
    AttemptRecord, BackoffPolicy, HealingLoop, LoopIssue, LoopOutcome, LoopPhase, LoopSettings,
    LoopState, UnrecoverableReason,
};
pub use proposer::{
    ArtifactSource, CatalogFile, FixProposer, ProjectArtifacts, SchemaCatalog, StaticCatalog,
};
pub use report::{read_report_artifact, render_markdown, write_report_artifact, FailureReport};
pub use runner::{ExecutionRunner, RunScope};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
