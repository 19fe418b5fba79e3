//! Error taxonomy produced by the classifier.

use serde::{Deserialize, Serialize};

/// Failure kinds the classifier distinguishes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A column or field does not exist upstream.
    Schema,
    /// The SQL does not parse.
    Syntax,
    /// A referenced model, source or relation does not exist.
    MissingRef,
    /// Data tests or constraints failed; the SQL itself is fine.
    DataQuality,
    /// Connection, lock, permission or resource trouble in the warehouse.
    Database,
    /// No rule matched. Never auto-fixed.
    Unknown,
}

impl ErrorKind {
    /// Inclusive confidence-seed range for this kind.
    ///
    /// Reflects how mechanically fixable the class usually is.
    pub fn seed_range(&self) -> (f64, f64) {
        match self {
            ErrorKind::Schema => (0.70, 0.95),
            ErrorKind::Syntax => (0.80, 0.90),
            ErrorKind::MissingRef => (0.60, 0.85),
            ErrorKind::DataQuality => (0.50, 0.80),
            ErrorKind::Database => (0.30, 0.60),
            ErrorKind::Unknown => (0.0, 0.0),
        }
    }

    /// Clamp a seed into this kind's range.
    pub fn clamp_seed(&self, seed: f64) -> f64 {
        let (lo, hi) = self.seed_range();
        seed.clamp(lo, hi)
    }

    /// Whether the proposer can attempt a text fix for this kind.
    pub fn is_mechanically_fixable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Schema | ErrorKind::Syntax | ErrorKind::MissingRef
        )
    }

    /// Snake_case label, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Schema => "schema",
            ErrorKind::Syntax => "syntax",
            ErrorKind::MissingRef => "missing_ref",
            ErrorKind::DataQuality => "data_quality",
            ErrorKind::Database => "database",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified build failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorClassification {
    pub kind: ErrorKind,

    /// Unit the failure originated from, when known.
    pub unit_id: Option<String>,

    /// Raw error message, surfaced verbatim.
    pub message: String,

    /// Free-text root-cause explanation.
    pub root_cause: String,

    /// Confidence seed in the kind's range, 0 for `Unknown`.
    pub confidence_seed: f64,

    /// Offending identifier or token extracted from the message.
    pub subject: Option<String>,

    /// Artifact path mentioned by the error text, if any.
    pub artifact_hint: Option<String>,

    /// Name of the classifier rule that matched.
    pub rule: Option<String>,
}

impl ErrorClassification {
    /// An unrecognised failure. Never guessed at.
    pub fn unknown(unit_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Unknown,
            unit_id,
            message: message.into(),
            root_cause: "no classification rule matched; raw error surfaced verbatim".to_string(),
            confidence_seed: 0.0,
            subject: None,
            artifact_hint: None,
            rule: None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.kind == ErrorKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_ranges_are_ordered() {
        for kind in [
            ErrorKind::Schema,
            ErrorKind::Syntax,
            ErrorKind::MissingRef,
            ErrorKind::DataQuality,
            ErrorKind::Database,
            ErrorKind::Unknown,
        ] {
            let (lo, hi) = kind.seed_range();
            assert!(lo <= hi, "{kind} range inverted");
            assert!((0.0..=1.0).contains(&lo) && (0.0..=1.0).contains(&hi));
        }
    }

    #[test]
    fn test_clamp_seed() {
        assert_eq!(ErrorKind::Syntax.clamp_seed(0.99), 0.90);
        assert_eq!(ErrorKind::Database.clamp_seed(0.1), 0.30);
        assert_eq!(ErrorKind::Unknown.clamp_seed(0.5), 0.0);
    }

    #[test]
    fn test_error_kind_serde_names() {
        let json = serde_json::to_string(&ErrorKind::MissingRef).expect("serialize");
        assert_eq!(json, "\"missing_ref\"");
        let back: ErrorKind = serde_json::from_str("\"data_quality\"").expect("deserialize");
        assert_eq!(back, ErrorKind::DataQuality);
    }

    #[test]
    fn test_unknown_has_zero_seed() {
        let c = ErrorClassification::unknown(None, "something odd");
        assert!(c.is_unknown());
        assert_eq!(c.confidence_seed, 0.0);
        assert_eq!(c.message, "something odd");
    }
}
