//! The healing loop driver.
//!
//! Runs the pipeline, and on failure walks classify → propose → gate →
//! apply → verify, retrying with backoff until the pipeline passes, the
//! retry budget is spent, or no safe fix exists. Exactly one runner
//! invocation is in flight at a time and mutations happen strictly in
//! sequence, so an artifact is never touched by two attempts at once.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};
use uuid::Uuid;

use crate::approval::{self, ApprovalChannel, ApprovalRequest, ApprovalResponse, NonInteractive};
use crate::audit::{
    AuditRecord, AuditSink, ErrorRecord, FixRecord, LoopEvent, LoopEventRecord, MemoryAuditLog,
    RunRecord,
};
use crate::backup::BackupManager;
use crate::classifier::ErrorClassifier;
use crate::domain::classification::ErrorClassification;
use crate::domain::error::RunnerError;
use crate::domain::execution::ExecutionResult;
use crate::domain::mode::ExecutionMode;
use crate::domain::proposal::FixProposal;
use crate::gate::{self, GateDecision};
use crate::obs;
use crate::proposer::{ArtifactSource, FixProposer, SchemaCatalog};
use crate::runner::{ExecutionRunner, RunScope};

use super::backoff::BackoffPolicy;
use super::state::{
    AttemptRecord, LoopIssue, LoopOutcome, LoopPhase, LoopState, UnrecoverableReason,
};

/// Loop tunables that are not part of the execution mode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopSettings {
    pub backoff: BackoffPolicy,
    /// How long to wait for a reviewer before treating approval as unavailable.
    pub approval_timeout: Option<Duration>,
}

/// Self-healing control loop over one pipeline.
pub struct HealingLoop {
    runner: Arc<dyn ExecutionRunner>,
    artifacts: Arc<dyn ArtifactSource>,
    catalog: Arc<dyn SchemaCatalog>,
    backups: BackupManager,
    mode: ExecutionMode,
    settings: LoopSettings,
    classifier: ErrorClassifier,
    proposer: FixProposer,
    approvals: Arc<dyn ApprovalChannel>,
    audit: Arc<dyn AuditSink>,
    cancel: CancellationToken,
}

/// How a single attempt ended.
enum Step {
    Retry,
    Finished(LoopOutcome),
}

impl HealingLoop {
    pub fn new(
        runner: Arc<dyn ExecutionRunner>,
        artifacts: Arc<dyn ArtifactSource>,
        catalog: Arc<dyn SchemaCatalog>,
        backups: BackupManager,
        mode: ExecutionMode,
    ) -> Self {
        Self {
            runner,
            artifacts,
            catalog,
            backups,
            mode,
            settings: LoopSettings::default(),
            classifier: ErrorClassifier::default(),
            proposer: FixProposer::new(),
            approvals: Arc::new(NonInteractive),
            audit: Arc::new(MemoryAuditLog::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_settings(mut self, settings: LoopSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_approvals(mut self, approvals: Arc<dyn ApprovalChannel>) -> Self {
        self.approvals = approvals;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Token that stops the loop at the next safe point when cancelled.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn mode(&self) -> &ExecutionMode {
        &self.mode
    }

    /// Run the loop to a terminal state.
    ///
    /// Returns `Err` only when the runner cannot be invoked at all; every
    /// other failure ends up in the returned [`LoopState`].
    pub async fn run(&self) -> Result<LoopState, RunnerError> {
        let loop_id = Uuid::new_v4().to_string();
        let span = obs::loop_span(&loop_id);
        self.drive(loop_id).instrument(span).await
    }

    async fn drive(&self, loop_id: String) -> Result<LoopState, RunnerError> {
        let started = Instant::now();
        let mut state = LoopState::new(loop_id, self.mode);
        obs::emit_loop_started(&state.loop_id, self.mode.kind.as_str(), self.mode.max_retries);
        self.step(&mut state, LoopPhase::Running, 0);

        let mut attempt: u32 = 0;
        let outcome = loop {
            match self.attempt(&mut state, attempt).await {
                Ok(Step::Retry) => {
                    attempt += 1;
                    self.step(&mut state, LoopPhase::Running, attempt);
                }
                Ok(Step::Finished(outcome)) => break outcome,
                Err(e) => {
                    self.issue(
                        &mut state,
                        attempt,
                        LoopIssue::RunnerFailed {
                            error: e.to_string(),
                        },
                    );
                    return Err(e);
                }
            }
        };

        let duration_ms = elapsed_ms(started);
        if state.phase != outcome.phase() {
            self.step(&mut state, outcome.phase(), attempt);
        }
        state.finish(outcome, duration_ms);
        let finished = AuditRecord::Event(LoopEventRecord {
            timestamp: Utc::now(),
            loop_id: state.loop_id.clone(),
            attempt,
            event: LoopEvent::Finished {
                outcome,
                duration_ms,
            },
        });
        self.record(&mut state, finished);
        obs::emit_loop_finished(
            &state.loop_id,
            &outcome.to_string(),
            state.attempts.len() as u32,
            duration_ms,
        );
        Ok(state)
    }

    /// One pass through Running and, on failure, the repair phases.
    async fn attempt(&self, state: &mut LoopState, attempt: u32) -> Result<Step, RunnerError> {
        let backoff = self.settings.backoff.delay_for(attempt);
        if !backoff.is_zero() {
            debug!(attempt, delay_ms = backoff.as_millis() as u64, "backing off before retry");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.settle_unchecked(state, attempt, None);
                    return Ok(Step::Finished(LoopOutcome::Cancelled));
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        let run = match self.invoke(&RunScope::Full).await {
            Ok(Some(run)) => run,
            Ok(None) => {
                self.settle_unchecked(state, attempt, None);
                return Ok(Step::Finished(LoopOutcome::Cancelled));
            }
            Err(e) => {
                self.settle_unchecked(state, attempt, None);
                return Err(e);
            }
        };
        state.full_runs += 1;
        self.record_run(state, attempt, &RunScope::Full, &run);

        // A fix applied without a scoped check is verified by this run.
        let check_failed = !run.succeeded()
            && state
                .last_attempt()
                .is_some_and(AttemptRecord::awaits_check);
        if check_failed {
            self.step(state, LoopPhase::Verifying, attempt);
        }
        let settled = self.settle_unchecked(state, attempt, Some(&run));

        let mut record = AttemptRecord::new(attempt, backoff.as_millis() as u64, run);
        let step = if !settled {
            Ok(unrecoverable(UnrecoverableReason::RollbackFailed))
        } else if check_failed {
            // The failure belongs to the fix that was just rolled back.
            let classification = self.classifier.classify(&record.run);
            self.record_error(state, attempt, &classification);
            record.classification = Some(classification);
            if attempt >= self.mode.max_retries {
                Ok(Step::Finished(LoopOutcome::Exhausted))
            } else {
                Ok(Step::Retry)
            }
        } else {
            self.repair(state, attempt, &mut record).await
        };
        state.attempts.push(record);
        step
    }

    /// Settle the previous attempt's fix if it was applied without a scoped
    /// check. `run` is the full run that followed it; `None` means the loop
    /// is stopping before that run finished.
    ///
    /// Returns false if a failed fix could not be rolled back.
    fn settle_unchecked(
        &self,
        state: &mut LoopState,
        attempt: u32,
        run: Option<&ExecutionResult>,
    ) -> bool {
        if !state
            .last_attempt()
            .is_some_and(AttemptRecord::awaits_check)
        {
            return true;
        }
        let Some(mut previous) = state.attempts.pop() else {
            return true;
        };

        let settled = match run {
            Some(run) if run.succeeded() => {
                previous.verified = Some(true);
                self.release(state, attempt, &previous);
                true
            }
            Some(run) => {
                previous.verified = Some(false);
                self.issue(
                    state,
                    attempt,
                    LoopIssue::VerificationFailed {
                        unit_id: None,
                        error_text: run.error_text.clone(),
                    },
                );
                self.undo(state, attempt, &mut previous)
            }
            None => self.undo(state, attempt, &mut previous),
        };
        if let (Some(proposal), Some(decision)) = (previous.proposal.clone(), previous.decision) {
            self.record_fix(state, previous.attempt, &proposal, decision, &previous);
        }
        state.attempts.push(previous);
        settled
    }

    async fn repair(
        &self,
        state: &mut LoopState,
        attempt: u32,
        record: &mut AttemptRecord,
    ) -> Result<Step, RunnerError> {
        if record.run.succeeded() {
            return Ok(Step::Finished(LoopOutcome::Succeeded));
        }

        self.step(state, LoopPhase::Diagnosing, attempt);
        let classification = self.classifier.classify(&record.run);
        self.record_error(state, attempt, &classification);
        record.classification = Some(classification.clone());

        if attempt >= self.mode.max_retries {
            return Ok(Step::Finished(LoopOutcome::Exhausted));
        }
        if classification.is_unknown() {
            self.issue(
                state,
                attempt,
                LoopIssue::ClassificationAmbiguous {
                    raw_text: classification.message.clone(),
                },
            );
            return Ok(unrecoverable(UnrecoverableReason::ClassificationAmbiguous));
        }

        self.step(state, LoopPhase::Proposing, attempt);
        let proposal = match self.proposer.propose(
            &classification,
            self.artifacts.as_ref(),
            self.catalog.as_ref(),
        ) {
            Ok(p) => p,
            Err(e) => {
                self.side_effect(state, attempt, "propose", &e);
                None
            }
        };
        let Some(proposal) = proposal else {
            self.issue(
                state,
                attempt,
                LoopIssue::ProposalUnavailable {
                    kind: classification.kind,
                    root_cause: classification.root_cause.clone(),
                },
            );
            return Ok(unrecoverable(UnrecoverableReason::ProposalUnavailable));
        };
        obs::emit_fix_proposed(&state.loop_id, &proposal.artifact, proposal.confidence);
        record.proposal = Some(proposal.clone());

        self.step(state, LoopPhase::Gating, attempt);
        let decision = gate::decide(Some(&proposal), &self.mode);
        record.decision = Some(decision);
        obs::emit_gate_decided(
            &state.loop_id,
            decision.as_str(),
            proposal.confidence,
            self.mode.min_confidence,
        );

        if decision != GateDecision::AutoApply {
            self.step(state, LoopPhase::Deferred, attempt);
            let request = ApprovalRequest {
                loop_id: state.loop_id.clone(),
                attempt,
                kind: classification.kind,
                root_cause: classification.root_cause.clone(),
                proposal: proposal.clone(),
            };
            let response = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                r = approval::request_approval(
                    self.approvals.as_ref(),
                    &request,
                    self.settings.approval_timeout,
                ) => Some(r),
            };
            record.approval = response.clone();

            let outcome = match response {
                Some(ApprovalResponse::Approved) => None,
                Some(ApprovalResponse::Denied { reason }) => {
                    self.issue(state, attempt, LoopIssue::ApprovalDenied { reason });
                    Some(unrecoverable(UnrecoverableReason::ApprovalDenied))
                }
                Some(ApprovalResponse::Unavailable) => {
                    self.issue(state, attempt, LoopIssue::ApprovalUnavailable);
                    Some(unrecoverable(UnrecoverableReason::PendingReview))
                }
                None => Some(Step::Finished(LoopOutcome::Cancelled)),
            };
            if let Some(step) = outcome {
                self.record_fix(state, attempt, &proposal, decision, record);
                return Ok(step);
            }
        }

        self.step(state, LoopPhase::Applying, attempt);
        let applied = match self.backups.apply(&proposal) {
            Ok(applied) => applied,
            Err(e) => {
                self.issue(
                    state,
                    attempt,
                    LoopIssue::ApplyFailed {
                        artifact: proposal.artifact.clone(),
                        error: e.to_string(),
                    },
                );
                self.record_fix(state, attempt, &proposal, decision, record);
                return Ok(unrecoverable(UnrecoverableReason::ApplyFailed));
            }
        };
        obs::emit_fix_applied(
            &state.loop_id,
            &proposal.artifact,
            &applied.backup.path.display().to_string(),
        );
        record.applied = true;
        record.backup = Some(applied.backup.clone());

        self.step(state, LoopPhase::Verifying, attempt);
        let unit = proposal
            .unit_id
            .clone()
            .or_else(|| classification.unit_id.clone());
        let Some(unit) = unit else {
            debug!("no unit to verify in isolation; the next full run checks the fix");
            self.record_fix(state, attempt, &proposal, decision, record);
            return Ok(Step::Retry);
        };

        let scope = RunScope::Unit(unit.clone());
        let verification = match self.invoke(&scope).await {
            Ok(v) => v,
            Err(e) => {
                self.undo(state, attempt, record);
                self.record_fix(state, attempt, &proposal, decision, record);
                return Err(e);
            }
        };
        let Some(verification) = verification else {
            self.undo(state, attempt, record);
            self.record_fix(state, attempt, &proposal, decision, record);
            return Ok(Step::Finished(LoopOutcome::Cancelled));
        };
        state.scoped_runs += 1;
        self.record_run(state, attempt, &scope, &verification);

        let passed = verification.succeeded();
        record.verified = Some(passed);
        if passed {
            self.release(state, attempt, record);
        } else {
            self.issue(
                state,
                attempt,
                LoopIssue::VerificationFailed {
                    unit_id: Some(unit),
                    error_text: verification.error_text.clone(),
                },
            );
            if !self.undo(state, attempt, record) {
                record.verification = Some(verification);
                self.record_fix(state, attempt, &proposal, decision, record);
                return Ok(unrecoverable(UnrecoverableReason::RollbackFailed));
            }
        }
        record.verification = Some(verification);
        self.record_fix(state, attempt, &proposal, decision, record);
        Ok(Step::Retry)
    }

    /// Invoke the runner unless cancelled first. `Ok(None)` means cancelled.
    async fn invoke(&self, scope: &RunScope) -> Result<Option<ExecutionResult>, RunnerError> {
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(None),
            r = self.runner.run(scope) => r,
        };
        match result {
            Ok(run) => Ok(Some(run)),
            Err(RunnerError::Cancelled) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Roll back the attempt's fix. Returns false if the rollback failed.
    fn undo(&self, state: &mut LoopState, attempt: u32, record: &mut AttemptRecord) -> bool {
        let Some(backup) = record.backup.clone() else {
            return true;
        };
        match self.backups.rollback(&backup) {
            Ok(()) => {
                record.rolled_back = true;
                obs::emit_fix_rolled_back(&state.loop_id, &backup.artifact);
                true
            }
            Err(e) => {
                self.issue(
                    state,
                    attempt,
                    LoopIssue::RollbackFailed {
                        artifact: backup.artifact.clone(),
                        error: e.to_string(),
                    },
                );
                false
            }
        }
    }

    fn release(&self, state: &mut LoopState, attempt: u32, record: &AttemptRecord) {
        if let Some(backup) = &record.backup {
            if let Err(e) = self.backups.release(backup) {
                self.side_effect(state, attempt, "release backup", &e);
            }
        }
    }

    fn step(&self, state: &mut LoopState, to: LoopPhase, attempt: u32) {
        let transition = state.enter(to, attempt);
        obs::emit_transition(
            &state.loop_id,
            transition.from.as_str(),
            transition.to.as_str(),
            attempt,
        );
        let entry = AuditRecord::Event(LoopEventRecord {
            timestamp: transition.at,
            loop_id: state.loop_id.clone(),
            attempt,
            event: LoopEvent::Transition {
                from: transition.from,
                to: transition.to,
            },
        });
        self.record(state, entry);
    }

    fn issue(&self, state: &mut LoopState, attempt: u32, issue: LoopIssue) {
        state.issues.push(issue.clone());
        let entry = AuditRecord::Event(LoopEventRecord {
            timestamp: Utc::now(),
            loop_id: state.loop_id.clone(),
            attempt,
            event: LoopEvent::Issue { issue },
        });
        self.record(state, entry);
    }

    fn side_effect(
        &self,
        state: &mut LoopState,
        attempt: u32,
        what: &str,
        error: &dyn std::fmt::Display,
    ) {
        obs::emit_side_effect_error(&state.loop_id, what, error);
        self.issue(
            state,
            attempt,
            LoopIssue::SideEffect {
                what: what.to_string(),
                error: error.to_string(),
            },
        );
    }

    /// Append to the audit trail. Audit failures never change the outcome.
    fn record(&self, state: &mut LoopState, record: AuditRecord) {
        if let Err(e) = self.audit.append(&record) {
            obs::emit_side_effect_error(&state.loop_id, "audit", &e);
            state.issues.push(LoopIssue::SideEffect {
                what: "audit".to_string(),
                error: e.to_string(),
            });
        }
    }

    fn record_run(&self, state: &mut LoopState, attempt: u32, scope: &RunScope, run: &ExecutionResult) {
        let scope_label = match scope {
            RunScope::Full => "full".to_string(),
            RunScope::Unit(unit) => format!("unit:{unit}"),
        };
        obs::emit_run_finished(&state.loop_id, &scope_label, run.succeeded(), run.duration_ms);
        let entry = RunRecord::from_result(&state.loop_id, attempt, &scope_label, run);
        self.record(state, AuditRecord::Run(entry));
    }

    fn record_error(&self, state: &mut LoopState, attempt: u32, classification: &ErrorClassification) {
        obs::emit_error_classified(
            &state.loop_id,
            classification.kind.as_str(),
            classification.unit_id.as_deref(),
            classification.confidence_seed,
        );
        let entry = ErrorRecord {
            timestamp: Utc::now(),
            loop_id: state.loop_id.clone(),
            attempt,
            unit: classification.unit_id.clone(),
            error_text: classification.message.clone(),
            kind: classification.kind,
            root_cause: classification.root_cause.clone(),
            confidence_seed: classification.confidence_seed,
            rule: classification.rule.clone(),
        };
        self.record(state, AuditRecord::Error(entry));
    }

    fn record_fix(
        &self,
        state: &mut LoopState,
        attempt: u32,
        proposal: &FixProposal,
        decision: GateDecision,
        record: &AttemptRecord,
    ) {
        let entry = FixRecord {
            timestamp: Utc::now(),
            loop_id: state.loop_id.clone(),
            attempt,
            mode: self.mode.kind,
            artifact: proposal.artifact.clone(),
            old_text: proposal.old_text.clone(),
            new_text: proposal.new_text.clone(),
            confidence: proposal.confidence,
            decision,
            applied: record.applied,
            rolled_back: record.rolled_back,
            verified: record.verified,
        };
        self.record(state, AuditRecord::Fix(entry));
    }
}

fn unrecoverable(reason: UnrecoverableReason) -> Step {
    Step::Finished(LoopOutcome::Unrecoverable(reason))
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
