//! Failure reports.
//!
//! Every terminal loop state produces a [`FailureReport`]: a summary line,
//! the last diagnosis, every proposal tried and the full [`LoopState`]. The
//! report is the payload handed to whatever notifier the caller wires up.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backup::{sha256_hex, write_atomic};
use crate::domain::classification::ErrorClassification;
use crate::domain::error::{PipemendError, Result};
use crate::gate::GateDecision;
use crate::orchestration::state::{LoopOutcome, LoopPhase, LoopState};

pub const REPORT_FILE: &str = "report.json";
pub const DIGEST_FILE: &str = "report.digest";

/// One proposal as it appears in a report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProposalSummary {
    pub attempt: u32,
    pub artifact: String,
    pub old_text: String,
    pub new_text: String,
    pub confidence: f64,
    pub decision: Option<GateDecision>,
    pub applied: bool,
    pub verified: Option<bool>,
    pub rolled_back: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureReport {
    pub loop_id: String,
    pub generated_at: DateTime<Utc>,
    pub summary: String,
    pub outcome: Option<LoopOutcome>,
    pub final_phase: LoopPhase,
    pub last_diagnosis: Option<ErrorClassification>,
    pub proposals: Vec<ProposalSummary>,
    pub state: LoopState,
}

impl FailureReport {
    pub fn from_state(state: &LoopState) -> Self {
        let proposals = state
            .attempts
            .iter()
            .filter_map(|a| {
                a.proposal.as_ref().map(|p| ProposalSummary {
                    attempt: a.attempt,
                    artifact: p.artifact.clone(),
                    old_text: p.old_text.clone(),
                    new_text: p.new_text.clone(),
                    confidence: p.confidence,
                    decision: a.decision,
                    applied: a.applied,
                    verified: a.verified,
                    rolled_back: a.rolled_back,
                })
            })
            .collect();

        Self {
            loop_id: state.loop_id.clone(),
            generated_at: Utc::now(),
            summary: summarize(state),
            outcome: state.outcome,
            final_phase: state.phase,
            last_diagnosis: state.last_diagnosis().cloned(),
            proposals,
            state: state.clone(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_some_and(|o| o.is_success())
    }
}

/// One human-readable line describing how the loop ended.
pub fn summarize(state: &LoopState) -> String {
    let runs = format!(
        "{} full run(s), {} verification run(s)",
        state.full_runs, state.scoped_runs
    );
    let Some(outcome) = state.outcome else {
        return format!("loop {} still in {} after {}", state.loop_id, state.phase, runs);
    };
    let diagnosis = state
        .last_diagnosis()
        .map(|d| format!(": {} error, {}", d.kind, d.root_cause))
        .unwrap_or_default();
    match outcome {
        LoopOutcome::Succeeded => format!(
            "pipeline succeeded after {} ({} fix(es) applied)",
            runs,
            state.attempts.iter().filter(|a| a.applied && !a.rolled_back).count()
        ),
        LoopOutcome::Exhausted => format!(
            "retries exhausted after {}, {} rollback(s){}",
            runs,
            state.rollbacks(),
            diagnosis
        ),
        LoopOutcome::Unrecoverable(reason) => {
            format!("unrecoverable ({}) after {}{}", reason.as_str(), runs, diagnosis)
        }
        LoopOutcome::Cancelled => format!("cancelled after {runs}"),
    }
}

/// Persist `<dir>/<loop_id>/report.json` and its SHA-256 digest.
pub fn write_report_artifact(report: &FailureReport, dir: &Path) -> Result<PathBuf> {
    let loop_dir = dir.join(&report.loop_id);
    std::fs::create_dir_all(&loop_dir)?;

    let report_path = loop_dir.join(REPORT_FILE);
    let json = serde_json::to_vec_pretty(report)?;
    write_atomic(&report_path, &json)?;
    write_atomic(&loop_dir.join(DIGEST_FILE), sha256_hex(&json).as_bytes())?;
    Ok(report_path)
}

/// Read `<dir>/<loop_id>/report.json`, refusing it if the digest does not match.
pub fn read_report_artifact(loop_id: &str, dir: &Path) -> Result<FailureReport> {
    let loop_dir = dir.join(loop_id);
    let json = std::fs::read(loop_dir.join(REPORT_FILE))?;
    let expected = std::fs::read_to_string(loop_dir.join(DIGEST_FILE))?;
    let actual = sha256_hex(&json);
    if expected.trim() != actual {
        return Err(PipemendError::DigestMismatch {
            expected: expected.trim().to_string(),
            actual,
        });
    }
    Ok(serde_json::from_slice(&json)?)
}

/// Render a markdown summary for issue trackers and chat notifications.
pub fn render_markdown(report: &FailureReport) -> String {
    let mut out = String::new();
    let outcome = report
        .outcome
        .map(|o| o.to_string())
        .unwrap_or_else(|| "in progress".to_string());
    let _ = writeln!(out, "# pipemend loop {}\n", report.loop_id);
    let _ = writeln!(out, "**Outcome:** {outcome}\n");
    let _ = writeln!(out, "{}\n", report.summary);

    if let Some(d) = &report.last_diagnosis {
        out.push_str("## Last diagnosis\n\n");
        let _ = writeln!(out, "- kind: `{}`", d.kind);
        if let Some(unit) = &d.unit_id {
            let _ = writeln!(out, "- unit: `{unit}`");
        }
        let _ = writeln!(out, "- root cause: {}", d.root_cause);
        out.push_str("\n```text\n");
        out.push_str(d.message.trim_end());
        out.push_str("\n```\n\n");
    }

    if report.proposals.is_empty() {
        out.push_str("No fixes were proposed.\n");
    } else {
        out.push_str("## Proposals\n\n");
        out.push_str("| # | Artifact | Change | Confidence | Decision | Applied | Verified | Rolled back |\n");
        out.push_str("|---|---|---|---|---|---|---|---|\n");
        for p in &report.proposals {
            let _ = writeln!(
                out,
                "| {} | `{}` | `{}` → `{}` | {:.2} | {} | {} | {} | {} |",
                p.attempt,
                p.artifact,
                one_line(&p.old_text),
                one_line(&p.new_text),
                p.confidence,
                p.decision.map(|d| d.as_str()).unwrap_or("-"),
                yes_no(p.applied),
                p.verified.map(yes_no).unwrap_or("-"),
                yes_no(p.rolled_back),
            );
        }
    }
    out
}

fn yes_no(b: bool) -> &'static str {
    if b {
        "yes"
    } else {
        "no"
    }
}

fn one_line(s: &str) -> String {
    s.replace('\n', "⏎").replace('|', "\\|")
}
