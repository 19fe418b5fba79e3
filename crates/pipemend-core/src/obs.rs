//! Structured lifecycle events for the healing loop.
//!
//! Every event carries an `event` field (`loop.started`, `run.finished`, ...)
//! so log pipelines can filter on it. [`loop_span`] tags everything logged
//! while a loop is active with its `loop_id`.

use tracing::{info, warn};

/// The `pipemend.loop` span. Attach it with `Instrument`; an entered guard
/// must not be held across `.await`.
pub fn loop_span(loop_id: &str) -> tracing::Span {
    tracing::info_span!("pipemend.loop", loop_id = %loop_id)
}

/// Emit event: loop started in a mode with its retry budget.
///
/// # Example
///
/// ```ignore
/// emit_loop_started("loop-1", "autonomous", 3);
/// // logs: event=loop.started loop_id=loop-1 mode=autonomous max_retries=3
/// ```
pub fn emit_loop_started(loop_id: &str, mode: &str, max_retries: u32) {
    info!(event = "loop.started", loop_id = %loop_id, mode = %mode, max_retries);
}

/// Emit event: the loop moved between phases.
pub fn emit_transition(loop_id: &str, from: &str, to: &str, attempt: u32) {
    info!(event = "loop.transition", loop_id = %loop_id, from = %from, to = %to, attempt);
}

/// Emit event: one runner invocation finished. `scope` is `full` or `unit:<id>`.
pub fn emit_run_finished(loop_id: &str, scope: &str, success: bool, duration_ms: u64) {
    info!(
        event = "run.finished",
        loop_id = %loop_id,
        scope = %scope,
        success,
        duration_ms,
    );
}

/// Emit event: a failure was classified; `unit` logs as `-` when unknown.
pub fn emit_error_classified(loop_id: &str, kind: &str, unit: Option<&str>, seed: f64) {
    info!(
        event = "error.classified",
        loop_id = %loop_id,
        kind = %kind,
        unit = unit.unwrap_or("-"),
        confidence_seed = seed,
    );
}

/// Emit event: a fix was proposed for an artifact.
pub fn emit_fix_proposed(loop_id: &str, artifact: &str, confidence: f64) {
    info!(event = "fix.proposed", loop_id = %loop_id, artifact = %artifact, confidence);
}

/// Emit event: gate decision with the confidence it was checked against.
pub fn emit_gate_decided(loop_id: &str, decision: &str, confidence: f64, min_confidence: f64) {
    info!(
        event = "gate.decided",
        loop_id = %loop_id,
        decision = %decision,
        confidence,
        min_confidence,
    );
}

/// Emit event: a fix was written, with the backup that can undo it.
pub fn emit_fix_applied(loop_id: &str, artifact: &str, backup: &str) {
    info!(event = "fix.applied", loop_id = %loop_id, artifact = %artifact, backup = %backup);
}

/// Emit event: an artifact was restored from its backup.
pub fn emit_fix_rolled_back(loop_id: &str, artifact: &str) {
    info!(event = "fix.rolled_back", loop_id = %loop_id, artifact = %artifact);
}

/// Emit event: loop reached a terminal outcome.
///
/// # Example
///
/// ```ignore
/// emit_loop_finished("loop-1", "exhausted", 4, 35_120);
/// // logs: event=loop.finished loop_id=loop-1 outcome=exhausted attempts=4 duration_ms=35120
/// ```
pub fn emit_loop_finished(loop_id: &str, outcome: &str, attempts: u32, duration_ms: u64) {
    info!(
        event = "loop.finished",
        loop_id = %loop_id,
        outcome = %outcome,
        attempts,
        duration_ms,
    );
}

/// Warning for side effects that failed without changing the loop outcome.
pub fn emit_side_effect_error(loop_id: &str, what: &str, error: &dyn std::fmt::Display) {
    warn!(event = "loop.side_effect_error", loop_id = %loop_id, what = %what, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_inside_loop_span() {
        let span = loop_span("loop-1");
        let _guard = span.enter();
        emit_transition("loop-1", "idle", "running", 0);
        emit_side_effect_error("loop-1", "audit", &"disk full");
    }
}
