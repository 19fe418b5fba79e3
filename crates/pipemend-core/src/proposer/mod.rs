//! Fix proposer.
//!
//! Given a classified failure, inspects the offending artifact and the schema
//! catalog and produces the smallest text substitution likely to fix it.
//! Confidence is the classifier's seed scaled by the match quality, so the
//! result is deterministic and testable without a model in the loop.

pub mod artifacts;
pub mod catalog;
pub mod matching;

use regex::Regex;
use tracing::debug;

use crate::domain::classification::{ErrorClassification, ErrorKind};
use crate::domain::error::Result;
use crate::domain::execution::unit_name;
use crate::domain::proposal::{FixProposal, MatchQuality, VerificationStep};

pub use artifacts::{referenced_relations, ArtifactSource, ProjectArtifacts};
pub use catalog::{CatalogFile, SchemaCatalog, StaticCatalog};
pub use matching::{best_match, edit_distance, CandidateMatch};

/// Clause keywords considered when fixing misspelled SQL tokens.
///
/// Two-letter keywords are left out: too many typos sit within reach of them.
pub const SQL_KEYWORDS: &[&str] = &[
    "SELECT", "FROM", "WHERE", "GROUP", "ORDER", "HAVING", "JOIN", "LEFT", "RIGHT", "INNER",
    "OUTER", "FULL", "CROSS", "CASE", "WHEN", "THEN", "ELSE", "END", "UNION", "ALL", "DISTINCT",
    "LIMIT", "WITH", "LIKE", "BETWEEN", "CAST", "OVER", "PARTITION", "NULL", "NOT", "AND",
    "USING", "QUALIFY", "EXCEPT", "INTERSECT", "VALUES",
];

/// A text substitution inside one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substitution {
    pub old_text: String,
    pub new_text: String,
    pub replace_all: bool,
}

/// Build the minimal substitution renaming `ident` to `replacement` in `text`.
///
/// - one occurrence: replace it
/// - several occurrences, all whole words: replace all
/// - otherwise widen to the unique line holding the first whole-word
///   occurrence, or give up when that line is not unique
pub fn identifier_substitution(text: &str, ident: &str, replacement: &str) -> Option<Substitution> {
    let word = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(ident))).ok()?;
    let first = word.find(text)?;
    // Use the artifact's own spelling; error messages may change case.
    let spelled = first.as_str();

    let substring_hits = text.matches(spelled).count();
    let exact_word = Regex::new(&format!(r"\b{}\b", regex::escape(spelled))).ok()?;
    let word_hits = exact_word.find_iter(text).count();

    if substring_hits == 1 {
        return Some(Substitution {
            old_text: spelled.to_string(),
            new_text: replacement.to_string(),
            replace_all: false,
        });
    }
    if substring_hits == word_hits {
        return Some(Substitution {
            old_text: spelled.to_string(),
            new_text: replacement.to_string(),
            replace_all: true,
        });
    }

    let line_start = text[..first.start()].rfind('\n').map_or(0, |i| i + 1);
    let line_end = text[first.end()..]
        .find('\n')
        .map_or(text.len(), |i| first.end() + i);
    let line = &text[line_start..line_end];
    if text.matches(line).count() != 1 {
        return None;
    }
    let new_line = exact_word.replace_all(line, replacement).into_owned();
    Some(Substitution {
        old_text: line.to_string(),
        new_text: new_line,
        replace_all: false,
    })
}

/// Rule-based fix proposer.
#[derive(Debug, Clone, Default)]
pub struct FixProposer;

impl FixProposer {
    pub fn new() -> Self {
        Self
    }

    /// Propose a fix for a classified failure.
    ///
    /// Returns `Ok(None)` when no safe fix exists: unknown or
    /// non-mechanical kinds, no locatable artifact, or no plausible candidate.
    pub fn propose(
        &self,
        classification: &ErrorClassification,
        artifacts: &dyn ArtifactSource,
        catalog: &dyn SchemaCatalog,
    ) -> Result<Option<FixProposal>> {
        if !classification.kind.is_mechanically_fixable() {
            debug!(kind = %classification.kind, "no mechanical fix for error kind");
            return Ok(None);
        }

        let Some(artifact) = resolve_artifact(classification, artifacts) else {
            debug!(unit = ?classification.unit_id, "no artifact located for failure");
            return Ok(None);
        };
        let text = artifacts.read(&artifact)?;

        let proposal = match classification.kind {
            ErrorKind::Schema => self.propose_column_fix(classification, &artifact, &text, catalog)?,
            ErrorKind::Syntax => self.propose_syntax_fix(classification, &artifact, &text, catalog)?,
            ErrorKind::MissingRef => {
                self.propose_reference_fix(classification, &artifact, &text, catalog)?
            }
            ErrorKind::DataQuality | ErrorKind::Database | ErrorKind::Unknown => None,
        };

        Ok(proposal
            .filter(FixProposal::is_well_formed)
            .map(|p| attach_unit(p, classification)))
    }

    fn propose_column_fix(
        &self,
        classification: &ErrorClassification,
        artifact: &str,
        text: &str,
        catalog: &dyn SchemaCatalog,
    ) -> Result<Option<FixProposal>> {
        let Some(subject) = classification.subject.as_deref() else {
            return Ok(None);
        };
        let ident = last_segment(subject);

        let mut relation_for_query = None;
        let mut candidates = Vec::new();
        for relation in referenced_relations(text) {
            if let Some(columns) = catalog.describe(&relation)? {
                if relation_for_query.is_none() {
                    relation_for_query = Some(relation.clone());
                }
                candidates.extend(columns);
            }
        }
        if candidates.is_empty() {
            for relation in catalog.known_identifiers()? {
                if let Some(columns) = catalog.describe(&relation)? {
                    candidates.extend(columns);
                }
            }
        }

        let Some(m) = best_match(ident, &candidates) else {
            return Ok(None);
        };
        let Some(sub) = identifier_substitution(text, ident, &m.candidate) else {
            return Ok(None);
        };

        let confidence = classification.confidence_seed * m.quality.multiplier();
        let proposal = build(artifact, classification.kind, sub, confidence, m.quality).map(|p| {
            let p = p.with_description(format!(
                "rename column `{}` to `{}` ({:?} match among {} candidate(s))",
                ident, m.candidate, m.quality, m.considered
            ));
            match &relation_for_query {
                Some(rel) => p.with_step(VerificationStep::Query {
                    sql: format!("select {} from {} limit 1", m.candidate, rel),
                }),
                None => p,
            }
        });
        Ok(proposal)
    }

    fn propose_syntax_fix(
        &self,
        classification: &ErrorClassification,
        artifact: &str,
        text: &str,
        catalog: &dyn SchemaCatalog,
    ) -> Result<Option<FixProposal>> {
        let Some(subject) = classification.subject.as_deref() else {
            return Ok(None);
        };
        let seed = classification.confidence_seed;

        if subject.eq_ignore_ascii_case("from") {
            return Ok(trailing_comma_fix(text).and_then(|sub| {
                build(artifact, ErrorKind::Syntax, sub, seed, MatchQuality::Rule)
                    .map(|p| p.with_description("remove trailing comma before FROM"))
            }));
        }

        // The parser points past a misspelled keyword at the name after it,
        // so a known name is never the typo; look at the word before it.
        if is_known_name(subject, text, catalog)? {
            let Some(previous) = preceding_word(text, subject) else {
                return Ok(None);
            };
            return Ok(keyword_fix(artifact, text, &previous, seed).map(|mut p| {
                p.confidence = seed * MatchQuality::Ambiguous.multiplier();
                p.match_quality = MatchQuality::Ambiguous;
                p
            }));
        }
        Ok(keyword_fix(artifact, text, subject, seed))
    }

    fn propose_reference_fix(
        &self,
        classification: &ErrorClassification,
        artifact: &str,
        text: &str,
        catalog: &dyn SchemaCatalog,
    ) -> Result<Option<FixProposal>> {
        let Some(subject) = classification.subject.as_deref() else {
            return Ok(None);
        };
        let ident = last_segment(subject);
        let known = catalog.known_identifiers()?;

        let Some(m) = best_match(ident, &known) else {
            return Ok(None);
        };
        let Some(sub) = identifier_substitution(text, ident, &m.candidate) else {
            return Ok(None);
        };
        let confidence = classification.confidence_seed * m.quality.multiplier();
        Ok(
            build(artifact, classification.kind, sub, confidence, m.quality).map(|p| {
                p.with_description(format!(
                    "point reference `{}` at existing `{}` ({:?} match)",
                    ident, m.candidate, m.quality
                ))
            }),
        )
    }
}

/// Rewrite `token` to the keyword it most likely misspells.
fn keyword_fix(artifact: &str, text: &str, token: &str, seed: f64) -> Option<FixProposal> {
    if SQL_KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(token)) {
        return None;
    }
    let keywords: Vec<String> = SQL_KEYWORDS.iter().map(|k| k.to_string()).collect();
    let m = best_match(token, &keywords)?;
    let replacement = if token.chars().any(|c| c.is_ascii_lowercase()) {
        m.candidate.to_lowercase()
    } else {
        m.candidate.clone()
    };
    let sub = identifier_substitution(text, token, &replacement)?;
    let confidence = seed * m.quality.multiplier();
    build(artifact, ErrorKind::Syntax, sub, confidence, m.quality).map(|p| {
        p.with_description(format!("correct misspelled keyword `{token}` to `{replacement}`"))
    })
}

/// Whether `name` is a relation or identifier the project already uses.
fn is_known_name(name: &str, text: &str, catalog: &dyn SchemaCatalog) -> Result<bool> {
    let key = catalog::relation_key(name);
    if referenced_relations(text).iter().any(|r| catalog::relation_key(r) == key) {
        return Ok(true);
    }
    if catalog.describe(name)?.is_some() {
        return Ok(true);
    }
    Ok(catalog
        .known_identifiers()?
        .iter()
        .any(|id| catalog::relation_key(id) == key))
}

/// The word directly before the first whole-word occurrence of `name`.
fn preceding_word(text: &str, name: &str) -> Option<String> {
    let word = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(name))).ok()?;
    let at = word.find(text)?.start();
    text[..at]
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .rev()
        .find(|w| !w.is_empty())
        .map(str::to_string)
}

fn resolve_artifact(
    classification: &ErrorClassification,
    artifacts: &dyn ArtifactSource,
) -> Option<String> {
    classification
        .artifact_hint
        .as_deref()
        .filter(|hint| !hint.starts_with("target/") && artifacts.exists(hint))
        .map(str::to_string)
        .or_else(|| {
            classification
                .unit_id
                .as_deref()
                .and_then(|unit| artifacts.locate(unit))
        })
}

fn build(
    artifact: &str,
    kind: ErrorKind,
    sub: Substitution,
    confidence: f64,
    quality: MatchQuality,
) -> Option<FixProposal> {
    let proposal = FixProposal::new(artifact, kind, sub.old_text, sub.new_text, confidence, quality)?;
    Some(if sub.replace_all {
        proposal.replacing_all()
    } else {
        proposal
    })
}

fn attach_unit(proposal: FixProposal, classification: &ErrorClassification) -> FixProposal {
    match &classification.unit_id {
        Some(unit) => {
            let rerun = VerificationStep::Rerun {
                unit_id: unit.clone(),
            };
            let mut p = proposal.with_unit(unit.clone());
            p.verification.insert(0, rerun);
            p
        }
        None => proposal,
    }
}

fn last_segment(subject: &str) -> &str {
    unit_name(subject.trim_matches(|c| c == '"' || c == '`' || c == '\''))
}

fn trailing_comma_fix(text: &str) -> Option<Substitution> {
    let re = Regex::new(r"(?i),(\s*)\bfrom\b").ok()?;
    let mut hits = re.captures_iter(text);
    let caps = hits.next()?;
    if hits.next().is_some() {
        return None;
    }
    let whole = caps.get(0)?.as_str();
    Some(Substitution {
        old_text: whole.to_string(),
        new_text: whole[1..].to_string(),
        replace_all: false,
    })
}
