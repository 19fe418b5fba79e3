//! Fallback parser for the build tool's console output.
//!
//! Used when no fresh results file exists. Recognises per-unit result lines
//! (`2 of 5 ERROR creating sql view model main.stg_orders .... [ERROR in 0.05s]`),
//! error blocks (`Database Error in model stg_orders (models/stg_orders.sql)`)
//! and the closing `Done. PASS=.. ERROR=..` summary.

use std::collections::BTreeMap;

use pipemend_core::{UnitResult, UnitStatus};
use regex::Regex;

/// Counts from the closing summary line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub pass: u32,
    pub warn: u32,
    pub error: u32,
    pub skip: u32,
    pub total: u32,
}

/// What the parser recovered from a run's output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOutput {
    pub units: Vec<UnitResult>,
    pub summary: Option<RunSummary>,
    /// Error blocks that could not be matched to a result line.
    pub orphan_errors: Vec<String>,
}

pub struct TextParser {
    timestamp: Option<Regex>,
    result_line: Option<Regex>,
    unit_kind: Option<Regex>,
    error_head: Option<Regex>,
    summary_line: Option<Regex>,
    summary_pair: Option<Regex>,
}

impl Default for TextParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TextParser {
    pub fn new() -> Self {
        Self {
            timestamp: Regex::new(r"^\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:\s+|$)").ok(),
            result_line: Regex::new(
                r"^\d+ of \d+ (OK|PASS|ERROR|FAIL|WARN|SKIP)\b(.*?)[\s.]*\[(\w[\w-]*)(?: \d+)?(?: in ([\d.]+)s)?\]\s*$",
            )
            .ok(),
            unit_kind: Regex::new(r"\b(model|seed|snapshot|relation)\s+([\w.]+)").ok(),
            error_head: Regex::new(
                r"^(.*?(?:Error|Failure)) in (model|test|seed|snapshot) ([\w.]+)(?: \(([^)]+)\))?",
            )
            .ok(),
            summary_line: Regex::new(r"^Done\.\s+(.*)$").ok(),
            summary_pair: Regex::new(r"([A-Z][A-Z-]*)=(\d+)").ok(),
        }
    }

    fn strip_timestamp<'a>(&self, line: &'a str) -> &'a str {
        match &self.timestamp {
            Some(re) => match re.find(line) {
                Some(m) => &line[m.end()..],
                None => line,
            },
            None => line,
        }
    }

    /// Parse combined stdout/stderr of one run.
    pub fn parse(&self, output: &str) -> ParsedOutput {
        let mut parsed = ParsedOutput::default();
        let mut errors: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut orphan_order: Vec<String> = Vec::new();

        let lines: Vec<&str> = output.lines().map(|l| self.strip_timestamp(l)).collect();
        let mut i = 0;
        while i < lines.len() {
            let line = lines[i];
            let trimmed = line.trim();

            if let Some(unit) = self.parse_result_line(trimmed) {
                parsed.units.push(unit);
                i += 1;
                continue;
            }

            if let Some(summary) = self.parse_summary(trimmed) {
                parsed.summary = Some(summary);
                i += 1;
                continue;
            }

            if let Some((name, head)) = self.parse_error_head(trimmed) {
                let mut block = vec![head];
                i += 1;
                while i < lines.len() {
                    let body = lines[i].trim();
                    if body.is_empty()
                        || self.parse_error_head(body).is_some()
                        || self.parse_result_line(body).is_some()
                        || self.parse_summary(body).is_some()
                    {
                        break;
                    }
                    block.push(body.to_string());
                    i += 1;
                }
                if !errors.contains_key(&name) {
                    orphan_order.push(name.clone());
                }
                errors.entry(name).or_default().push(block.join("\n"));
                continue;
            }

            i += 1;
        }

        for unit in parsed.units.iter_mut() {
            if let Some(blocks) = errors.remove(unit.name()) {
                unit.message = blocks.join("\n");
            }
        }
        for name in orphan_order {
            if let Some(blocks) = errors.remove(&name) {
                parsed.orphan_errors.extend(blocks);
            }
        }
        parsed
    }

    fn parse_result_line(&self, line: &str) -> Option<UnitResult> {
        let caps = self.result_line.as_ref()?.captures(line)?;
        let label = caps.get(3).map_or("", |m| m.as_str());
        let status = match label.to_ascii_uppercase().as_str() {
            "FAIL" => UnitStatus::Error,
            other => UnitStatus::from_label(other),
        };
        let middle = caps.get(2).map_or("", |m| m.as_str()).trim();

        let (kind, name) = match self
            .unit_kind
            .as_ref()
            .and_then(|re| re.captures(middle))
        {
            Some(kc) => {
                let kind = match kc.get(1).map_or("model", |m| m.as_str()) {
                    "relation" => "model",
                    other => other,
                };
                let qualified = kc.get(2).map_or("", |m| m.as_str());
                let name = qualified.rsplit('.').next().unwrap_or(qualified);
                (kind.to_string(), name.to_string())
            }
            None => {
                // Test lines carry the test name, after a failure count on FAIL/WARN.
                let name = middle
                    .split_whitespace()
                    .find(|token| !token.chars().all(|c| c.is_ascii_digit()))?;
                ("test".to_string(), name.to_string())
            }
        };
        if name.is_empty() {
            return None;
        }

        let duration_ms = caps
            .get(4)
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .map(|secs| (secs * 1000.0).round() as u64)
            .unwrap_or(0);

        Some(UnitResult::new(
            format!("{kind}.{name}"),
            status,
            label.to_string(),
            duration_ms,
        ))
    }

    fn parse_error_head(&self, line: &str) -> Option<(String, String)> {
        let caps = self.error_head.as_ref()?.captures(line)?;
        let qualified = caps.get(3)?.as_str();
        let name = qualified.rsplit('.').next().unwrap_or(qualified);
        Some((name.to_string(), line.to_string()))
    }

    fn parse_summary(&self, line: &str) -> Option<RunSummary> {
        let rest = self.summary_line.as_ref()?.captures(line)?.get(1)?.as_str();
        let pair = self.summary_pair.as_ref()?;
        let mut summary = RunSummary::default();
        let mut seen = false;
        for caps in pair.captures_iter(rest) {
            let value: u32 = caps[2].parse().unwrap_or(0);
            seen = true;
            match &caps[1] {
                "PASS" => summary.pass = value,
                "WARN" => summary.warn = value,
                "ERROR" => summary.error = value,
                "SKIP" => summary.skip = value,
                "TOTAL" => summary.total = value,
                _ => {}
            }
        }
        seen.then_some(summary)
    }
}
