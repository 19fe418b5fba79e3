//! Error classifier for failed build runs.
//!
//! Maps raw error text onto the [`ErrorKind`] taxonomy with an ordered list of
//! regex rules evaluated first-match-wins. Classification is pure: it never
//! mutates state and never guesses when no rule matches.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::classification::{ErrorClassification, ErrorKind};
use crate::domain::execution::ExecutionResult;

/// A single classification rule.
///
/// `pattern` may carry a named `subject` group capturing the offending
/// identifier or token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierRule {
    pub name: String,
    pub pattern: String,
    pub kind: ErrorKind,
    /// Confidence seed, clamped into the kind's range.
    pub seed: f64,
    /// Root-cause template; `{subject}` is replaced by the captured subject.
    pub root_cause: String,
}

impl ClassifierRule {
    pub fn new(
        name: impl Into<String>,
        pattern: impl Into<String>,
        kind: ErrorKind,
        seed: f64,
        root_cause: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            kind,
            seed,
            root_cause: root_cause.into(),
        }
    }
}

/// Rules shipped by default, in evaluation order.
pub fn standard_rules() -> Vec<ClassifierRule> {
    vec![
        // Schema
        ClassifierRule::new(
            "column_not_found",
            r#"(?i)column\s+["'`]?(?P<subject>[\w.]+)["'`]?(?:\s+of\s+relation\s+["'`]?[\w.]+["'`]?)?\s+(?:was\s+)?(?:not\s+found|does\s+not\s+exist|cannot\s+be\s+resolved)"#,
            ErrorKind::Schema,
            0.90,
            "column `{subject}` is referenced but not present in the upstream relation",
        ),
        ClassifierRule::new(
            "invalid_identifier",
            r#"(?i)invalid\s+identifier\s+'"?(?P<subject>[\w.]+)"?'"#,
            ErrorKind::Schema,
            0.85,
            "identifier `{subject}` does not resolve to a column",
        ),
        ClassifierRule::new(
            "unrecognized_name",
            r"(?i)(?:unrecognized\s+name|no\s+such\s+column):\s*(?P<subject>[\w.]+)",
            ErrorKind::Schema,
            0.85,
            "name `{subject}` does not resolve to a column",
        ),
        // Syntax
        ClassifierRule::new(
            "syntax_error_near",
            r#"(?i)syntax\s+error\s+at\s+or\s+near\s+["'`]?(?P<subject>[^"'`\s]+)["'`]?"#,
            ErrorKind::Syntax,
            0.85,
            "SQL does not parse near `{subject}`",
        ),
        ClassifierRule::new(
            "syntax_error",
            r"(?i)\b(?:syntax\s+error|parser\s+error)\b",
            ErrorKind::Syntax,
            0.80,
            "SQL does not parse",
        ),
        // Missing references
        ClassifierRule::new(
            "missing_node",
            r"(?i)depends\s+on\s+a\s+(?:node|source)\s+named\s+'(?P<subject>[\w.]+)'.*?not\s+found",
            ErrorKind::MissingRef,
            0.85,
            "reference to `{subject}` does not match any known node",
        ),
        ClassifierRule::new(
            "relation_missing",
            r#"(?i)(?:relation|table|view)\s+(?:with\s+name\s+)?["'`]?(?P<subject>[\w.]+)["'`]?\s+does\s+not\s+exist"#,
            ErrorKind::MissingRef,
            0.75,
            "relation `{subject}` does not exist",
        ),
        // Data quality
        ClassifierRule::new(
            "test_failures",
            r"(?i)got\s+\d+\s+results?,\s+configured\s+to\s+(?:fail|warn)\s+if",
            ErrorKind::DataQuality,
            0.65,
            "data test returned failing rows",
        ),
        ClassifierRule::new(
            "constraint_violation",
            r"(?i)(?:violates\s+(?:unique|not-null|foreign\s+key|check)\s+constraint|duplicate\s+key|constraint\s+error)",
            ErrorKind::DataQuality,
            0.55,
            "data violates a declared constraint",
        ),
        // Database
        ClassifierRule::new(
            "lock_contention",
            r"(?i)(?:could\s+not\s+set\s+lock|database\s+is\s+locked|deadlock\s+detected)",
            ErrorKind::Database,
            0.45,
            "database lock contention",
        ),
        ClassifierRule::new(
            "connection",
            r"(?i)(?:could\s+not\s+connect|connection\s+(?:refused|reset|timed\s+out)|could\s+not\s+translate\s+host)",
            ErrorKind::Database,
            0.40,
            "database connection failure",
        ),
        ClassifierRule::new(
            "permission",
            r"(?i)(?:permission\s+denied|insufficient\s+privileges|access\s+denied)",
            ErrorKind::Database,
            0.35,
            "database permission failure",
        ),
        ClassifierRule::new(
            "resources",
            r"(?i)(?:out\s+of\s+memory|no\s+space\s+left|disk\s+full)",
            ErrorKind::Database,
            0.30,
            "database resource exhaustion",
        ),
    ]
}

struct CompiledRule {
    rule: ClassifierRule,
    regex: Regex,
}

/// Ordered first-match-wins classifier.
pub struct ErrorClassifier {
    rules: Vec<CompiledRule>,
    artifact_path: Option<Regex>,
    unit_mention: Option<Regex>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(standard_rules())
    }
}

impl ErrorClassifier {
    /// Compile a rule list. Rules with invalid patterns are skipped.
    pub fn new(rules: Vec<ClassifierRule>) -> Self {
        let rules = rules
            .into_iter()
            .filter_map(|rule| match Regex::new(&rule.pattern) {
                Ok(regex) => Some(CompiledRule { rule, regex }),
                Err(e) => {
                    warn!(rule = %rule.name, error = %e, "skipping invalid classifier rule");
                    None
                }
            })
            .collect();

        Self {
            rules,
            artifact_path: Regex::new(r"(?:^|[\s(])((?:[\w.-]+/)*[\w.-]+\.sql)\b").ok(),
            unit_mention: Regex::new(r"(?i)\bin\s+(?:model|test|seed|snapshot)\s+([\w.]+)").ok(),
        }
    }

    /// Standard rules preceded by caller-supplied ones.
    pub fn with_extra_rules(extra: Vec<ClassifierRule>) -> Self {
        let mut rules = extra;
        rules.extend(standard_rules());
        Self::new(rules)
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.rule.name.as_str()).collect()
    }

    /// Classify a failed run.
    ///
    /// Rules are tried in order against the failing unit's message first and
    /// then the raw error text.
    pub fn classify(&self, result: &ExecutionResult) -> ErrorClassification {
        let failed = result.first_failed_unit();
        let unit_message = failed.map(|u| u.message.as_str()).unwrap_or("");
        let raw = result.error_text.as_deref().unwrap_or("");

        let mut message = String::new();
        for part in [unit_message, raw] {
            if !part.trim().is_empty() && !message.contains(part.trim()) {
                if !message.is_empty() {
                    message.push('\n');
                }
                message.push_str(part.trim());
            }
        }
        if message.is_empty() && result.succeeded() {
            message.push_str("run succeeded; nothing to classify");
        }

        let unit_id = failed.map(|u| u.unit_id.clone());
        self.classify_texts(unit_id, &[unit_message, raw], message)
    }

    /// Classify a bare error message.
    pub fn classify_text(&self, unit_id: Option<String>, text: &str) -> ErrorClassification {
        self.classify_texts(unit_id, &[text], text.trim().to_string())
    }

    fn classify_texts(
        &self,
        unit_id: Option<String>,
        texts: &[&str],
        message: String,
    ) -> ErrorClassification {
        let unit_id = unit_id.or_else(|| first_capture(self.unit_mention.as_ref(), texts));
        let artifact_hint = first_capture(self.artifact_path.as_ref(), texts);

        for compiled in &self.rules {
            for text in texts {
                let Some(caps) = compiled.regex.captures(text) else {
                    continue;
                };
                let subject = caps
                    .name("subject")
                    .map(|m| m.as_str().trim_matches('"').to_string());
                let root_cause = match &subject {
                    Some(s) => compiled.rule.root_cause.replace("{subject}", s),
                    None => compiled.rule.root_cause.replace(" `{subject}`", ""),
                };

                return ErrorClassification {
                    kind: compiled.rule.kind,
                    unit_id,
                    message,
                    root_cause,
                    confidence_seed: compiled.rule.kind.clamp_seed(compiled.rule.seed),
                    subject,
                    artifact_hint,
                    rule: Some(compiled.rule.name.clone()),
                };
            }
        }

        let mut unknown = ErrorClassification::unknown(unit_id, message);
        unknown.artifact_hint = artifact_hint;
        unknown
    }
}

fn first_capture(regex: Option<&Regex>, texts: &[&str]) -> Option<String> {
    let regex = regex?;
    texts.iter().find_map(|t| {
        regex
            .captures(t)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    })
}
