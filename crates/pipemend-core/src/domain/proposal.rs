//! Fix proposals and their verification steps.

use serde::{Deserialize, Serialize};

use super::classification::ErrorKind;

/// How well the replacement matched the offending identifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchQuality {
    /// Case-insensitive equality with a single candidate.
    Exact,
    /// The only similarly-named candidate available.
    ///
    /// Ranks with `Exact`: with no competing candidate there is nothing to
    /// confuse it with, so it keeps the full seed while `Near` pays 0.8.
    Sole,
    /// Unique best candidate within edit distance 2.
    Near,
    /// Several equally likely candidates.
    Ambiguous,
    /// Produced by a deterministic rewrite rule, not a name match.
    Rule,
}

impl MatchQuality {
    /// Multiplier applied to the classifier's confidence seed.
    pub fn multiplier(&self) -> f64 {
        match self {
            MatchQuality::Exact | MatchQuality::Sole | MatchQuality::Rule => 1.0,
            MatchQuality::Near => 0.8,
            MatchQuality::Ambiguous => 0.5,
        }
    }
}

/// A command or query to run to confirm a fix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VerificationStep {
    /// Re-run the build scoped to one unit.
    Rerun { unit_id: String },
    /// Query expected to succeed once the fix is in place.
    Query { sql: String },
}

/// A concrete text substitution proposed for one artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixProposal {
    /// Artifact path, relative to the project root.
    pub artifact: String,

    /// Unit the fix targets, when known.
    pub unit_id: Option<String>,

    pub kind: ErrorKind,

    /// Exact text to replace. Never empty.
    pub old_text: String,

    /// Replacement text. Never equal to `old_text`.
    pub new_text: String,

    /// Replace every occurrence instead of exactly one.
    pub replace_all: bool,

    /// Confidence in [0, 1].
    pub confidence: f64,

    pub match_quality: MatchQuality,

    pub description: String,

    pub verification: Vec<VerificationStep>,
}

impl FixProposal {
    /// Build a proposal, refusing empty or no-op substitutions.
    pub fn new(
        artifact: impl Into<String>,
        kind: ErrorKind,
        old_text: impl Into<String>,
        new_text: impl Into<String>,
        confidence: f64,
        match_quality: MatchQuality,
    ) -> Option<Self> {
        let old_text = old_text.into();
        let new_text = new_text.into();
        if old_text.is_empty() || old_text == new_text {
            return None;
        }
        Some(Self {
            artifact: artifact.into(),
            unit_id: None,
            kind,
            old_text,
            new_text,
            replace_all: false,
            confidence: confidence.clamp(0.0, 1.0),
            match_quality,
            description: String::new(),
            verification: Vec::new(),
        })
    }

    /// Target unit, used to scope the verification run.
    pub fn with_unit(mut self, unit_id: impl Into<String>) -> Self {
        self.unit_id = Some(unit_id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_step(mut self, step: VerificationStep) -> Self {
        self.verification.push(step);
        self
    }

    /// Replace every occurrence of `old_text` instead of exactly one.
    pub fn replacing_all(mut self) -> Self {
        self.replace_all = true;
        self
    }

    /// Re-check the substitution invariants.
    pub fn is_well_formed(&self) -> bool {
        !self.old_text.is_empty() && self.old_text != self.new_text
    }
}
