//! Approval gate.
//!
//! A pure decision over a proposal's confidence and the active execution
//! mode. The gate never talks to a human itself; `RequestApproval` is handed
//! to an [`ApprovalChannel`](crate::approval::ApprovalChannel) by the loop.

use serde::{Deserialize, Serialize};

use crate::domain::mode::{ExecutionMode, ModeKind};
use crate::domain::proposal::FixProposal;

/// What to do with a proposal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    /// Confidence clears the mode's threshold; apply without asking.
    AutoApply,
    /// A human must approve before anything is written.
    RequestApproval,
    /// Nothing to approve.
    Defer,
}

impl GateDecision {
    /// Stable snake_case label used in logs and audit records.
    pub fn as_str(&self) -> &'static str {
        match self {
            GateDecision::AutoApply => "auto_apply",
            GateDecision::RequestApproval => "request_approval",
            GateDecision::Defer => "defer",
        }
    }
}

impl std::fmt::Display for GateDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decide whether a proposal may be applied without a human.
///
/// `HumanInLoop` always asks. The autonomous modes apply when
/// `confidence >= mode.min_confidence` and ask otherwise. No proposal
/// means [`GateDecision::Defer`].
pub fn decide(proposal: Option<&FixProposal>, mode: &ExecutionMode) -> GateDecision {
    let Some(proposal) = proposal else {
        return GateDecision::Defer;
    };
    match mode.kind {
        ModeKind::HumanInLoop => GateDecision::RequestApproval,
        ModeKind::Autonomous | ModeKind::AutonomousCi => {
            if proposal.confidence >= mode.min_confidence {
                GateDecision::AutoApply
            } else {
                GateDecision::RequestApproval
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::classification::ErrorKind;
    use crate::domain::proposal::MatchQuality;

    fn proposal(confidence: f64) -> FixProposal {
        FixProposal::new(
            "models/stg_orders.sql",
            ErrorKind::Schema,
            "order_date",
            "ordered_at",
            confidence,
            MatchQuality::Sole,
        )
        .expect("proposal")
    }

    #[test]
    fn test_autonomous_threshold() {
        let mode = ExecutionMode::new(ModeKind::Autonomous);
        assert_eq!(decide(Some(&proposal(0.8)), &mode), GateDecision::AutoApply);
        assert_eq!(decide(Some(&proposal(0.95)), &mode), GateDecision::AutoApply);
        assert_eq!(
            decide(Some(&proposal(0.75)), &mode),
            GateDecision::RequestApproval
        );
    }

    #[test]
    fn test_ci_has_lower_bar() {
        let mode = ExecutionMode::new(ModeKind::AutonomousCi);
        assert_eq!(decide(Some(&proposal(0.75)), &mode), GateDecision::AutoApply);
        assert_eq!(
            decide(Some(&proposal(0.69)), &mode),
            GateDecision::RequestApproval
        );
    }

    #[test]
    fn test_human_in_loop_always_asks() {
        let mode = ExecutionMode::new(ModeKind::HumanInLoop);
        for confidence in [0.0, 0.5, 0.99, 1.0] {
            assert_eq!(
                decide(Some(&proposal(confidence)), &mode),
                GateDecision::RequestApproval
            );
        }
    }

    #[test]
    fn test_no_proposal_defers() {
        for kind in [ModeKind::Autonomous, ModeKind::HumanInLoop, ModeKind::AutonomousCi] {
            assert_eq!(decide(None, &ExecutionMode::new(kind)), GateDecision::Defer);
        }
    }

    #[test]
    fn test_custom_threshold() {
        let mode = ExecutionMode::new(ModeKind::Autonomous).with_min_confidence(0.5);
        assert_eq!(decide(Some(&proposal(0.5)), &mode), GateDecision::AutoApply);
    }
}
