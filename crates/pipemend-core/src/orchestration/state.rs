//! Loop state: phases, outcomes and the per-attempt record kept for audit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::approval::ApprovalResponse;
use crate::backup::BackupRef;
use crate::domain::classification::{ErrorClassification, ErrorKind};
use crate::domain::execution::ExecutionResult;
use crate::domain::mode::ExecutionMode;
use crate::domain::proposal::FixProposal;
use crate::gate::GateDecision;

/// Phases of the healing loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    Idle,
    Running,
    Succeeded,
    Diagnosing,
    Proposing,
    Gating,
    Applying,
    Deferred,
    Verifying,
    Exhausted,
    Unrecoverable,
    Cancelled,
}

impl LoopPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopPhase::Idle => "idle",
            LoopPhase::Running => "running",
            LoopPhase::Succeeded => "succeeded",
            LoopPhase::Diagnosing => "diagnosing",
            LoopPhase::Proposing => "proposing",
            LoopPhase::Gating => "gating",
            LoopPhase::Applying => "applying",
            LoopPhase::Deferred => "deferred",
            LoopPhase::Verifying => "verifying",
            LoopPhase::Exhausted => "exhausted",
            LoopPhase::Unrecoverable => "unrecoverable",
            LoopPhase::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoopPhase::Succeeded
                | LoopPhase::Exhausted
                | LoopPhase::Unrecoverable
                | LoopPhase::Cancelled
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: LoopPhase) -> bool {
        use LoopPhase::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Running, Succeeded | Diagnosing | Verifying | Cancelled)
                | (Diagnosing, Proposing | Exhausted | Unrecoverable)
                | (Proposing, Gating | Unrecoverable)
                | (Gating, Applying | Deferred)
                | (Deferred, Applying | Unrecoverable | Cancelled)
                | (Applying, Verifying | Unrecoverable)
                | (Verifying, Running | Exhausted | Unrecoverable | Cancelled)
        )
    }
}

impl std::fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a loop stopped without success or exhaustion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnrecoverableReason {
    /// No classifier rule matched the failure.
    ClassificationAmbiguous,
    /// No safe fix could be proposed.
    ProposalUnavailable,
    /// Approval was needed but nobody could give it.
    PendingReview,
    ApprovalDenied,
    /// The fix could not be applied safely.
    ApplyFailed,
    /// A failed fix could not be undone.
    RollbackFailed,
}

impl UnrecoverableReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnrecoverableReason::ClassificationAmbiguous => "classification_ambiguous",
            UnrecoverableReason::ProposalUnavailable => "proposal_unavailable",
            UnrecoverableReason::PendingReview => "pending_review",
            UnrecoverableReason::ApprovalDenied => "approval_denied",
            UnrecoverableReason::ApplyFailed => "apply_failed",
            UnrecoverableReason::RollbackFailed => "rollback_failed",
        }
    }
}

/// Terminal result of one loop invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum LoopOutcome {
    Succeeded,
    Exhausted,
    Unrecoverable(UnrecoverableReason),
    Cancelled,
}

impl LoopOutcome {
    pub fn phase(&self) -> LoopPhase {
        match self {
            LoopOutcome::Succeeded => LoopPhase::Succeeded,
            LoopOutcome::Exhausted => LoopPhase::Exhausted,
            LoopOutcome::Unrecoverable(_) => LoopPhase::Unrecoverable,
            LoopOutcome::Cancelled => LoopPhase::Cancelled,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, LoopOutcome::Succeeded)
    }
}

impl std::fmt::Display for LoopOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopOutcome::Unrecoverable(reason) => write!(f, "unrecoverable ({})", reason.as_str()),
            other => f.write_str(other.phase().as_str()),
        }
    }
}

/// Component-level problems caught at the loop boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum LoopIssue {
    /// No rule matched; the raw text is kept verbatim.
    ClassificationAmbiguous { raw_text: String },
    ProposalUnavailable { kind: ErrorKind, root_cause: String },
    VerificationFailed {
        unit_id: Option<String>,
        error_text: Option<String>,
    },
    ApplyFailed { artifact: String, error: String },
    RollbackFailed { artifact: String, error: String },
    ApprovalUnavailable,
    ApprovalDenied { reason: Option<String> },
    /// The runner could not be invoked; the loop aborted.
    RunnerFailed { error: String },
    /// Audit, backup cleanup or similar side effect failed.
    SideEffect { what: String, error: String },
}

/// Everything that happened in one attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptRecord {
    pub attempt: u32,
    /// Delay waited before this attempt's full run.
    pub backoff_ms: u64,
    pub run: ExecutionResult,
    pub classification: Option<ErrorClassification>,
    pub proposal: Option<FixProposal>,
    pub decision: Option<GateDecision>,
    pub approval: Option<ApprovalResponse>,
    pub applied: bool,
    pub backup: Option<BackupRef>,
    pub verification: Option<ExecutionResult>,
    /// `None` until the fix has been checked, by a scoped run or by the
    /// next full run when no unit could be isolated.
    pub verified: Option<bool>,
    pub rolled_back: bool,
}

impl AttemptRecord {
    pub fn new(attempt: u32, backoff_ms: u64, run: ExecutionResult) -> Self {
        Self {
            attempt,
            backoff_ms,
            run,
            classification: None,
            proposal: None,
            decision: None,
            approval: None,
            applied: false,
            backup: None,
            verification: None,
            verified: None,
            rolled_back: false,
        }
    }

    /// Applied, still on disk, and not yet checked by any run.
    pub fn awaits_check(&self) -> bool {
        self.applied && self.verified.is_none() && !self.rolled_back
    }
}

/// A recorded phase change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transition {
    pub from: LoopPhase,
    pub to: LoopPhase,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

/// Full machine-readable state of one loop invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoopState {
    pub loop_id: String,
    pub mode: ExecutionMode,
    pub phase: LoopPhase,
    pub attempts: Vec<AttemptRecord>,
    pub transitions: Vec<Transition>,
    pub issues: Vec<LoopIssue>,
    pub outcome: Option<LoopOutcome>,
    pub full_runs: u32,
    pub scoped_runs: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

impl LoopState {
    pub fn new(loop_id: impl Into<String>, mode: ExecutionMode) -> Self {
        Self {
            loop_id: loop_id.into(),
            mode,
            phase: LoopPhase::Idle,
            attempts: Vec::new(),
            transitions: Vec::new(),
            issues: Vec::new(),
            outcome: None,
            full_runs: 0,
            scoped_runs: 0,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
        }
    }

    /// Move to `to`, recording the transition.
    pub fn enter(&mut self, to: LoopPhase, attempt: u32) -> Transition {
        let transition = Transition {
            from: self.phase,
            to,
            attempt,
            at: Utc::now(),
        };
        self.phase = to;
        self.transitions.push(transition.clone());
        transition
    }

    pub fn finish(&mut self, outcome: LoopOutcome, duration_ms: u64) {
        self.outcome = Some(outcome);
        self.finished_at = Some(Utc::now());
        self.duration_ms = duration_ms;
    }

    pub fn last_attempt(&self) -> Option<&AttemptRecord> {
        self.attempts.last()
    }

    /// Most recent classification.
    pub fn last_diagnosis(&self) -> Option<&ErrorClassification> {
        self.attempts
            .iter()
            .rev()
            .find_map(|a| a.classification.as_ref())
    }

    pub fn proposals(&self) -> impl Iterator<Item = &FixProposal> {
        self.attempts.iter().filter_map(|a| a.proposal.as_ref())
    }

    pub fn rollbacks(&self) -> usize {
        self.attempts.iter().filter(|a| a.rolled_back).count()
    }

    pub fn total_runs(&self) -> u32 {
        self.full_runs + self.scoped_runs
    }

    /// Delays waited before each retry, in order.
    pub fn backoff_delays_ms(&self) -> Vec<u64> {
        self.attempts
            .iter()
            .filter(|a| a.attempt > 0)
            .map(|a| a.backoff_ms)
            .collect()
    }

    /// True when every recorded transition is permitted by the state machine.
    pub fn transitions_are_valid(&self) -> bool {
        self.transitions.iter().all(|t| t.from.can_transition_to(t.to))
    }
}
