//! Structured results files (`run_results.json`).

use std::path::Path;
use std::time::SystemTime;

use pipemend_core::{UnitResult, UnitStatus};
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct RunResultsDocument {
    results: Vec<ResultEntry>,
    #[serde(default)]
    elapsed_time: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ResultEntry {
    unique_id: String,
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    execution_time: Option<f64>,
    #[serde(default)]
    failures: Option<u64>,
}

/// Parsed contents of a results file.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResults {
    pub units: Vec<UnitResult>,
    pub elapsed_ms: Option<u64>,
}

fn secs_to_ms(secs: f64) -> u64 {
    if secs.is_finite() && secs > 0.0 {
        (secs * 1000.0).round() as u64
    } else {
        0
    }
}

/// Parse a results document.
pub fn parse_run_results(json: &str) -> Result<RunResults, serde_json::Error> {
    let doc: RunResultsDocument = serde_json::from_str(json)?;
    let units = doc
        .results
        .into_iter()
        .map(|entry| {
            let mut status = UnitStatus::from_label(&entry.status);
            // Tests report "fail"; a warn-severity test that found rows is a warning.
            if status == UnitStatus::Success && entry.failures.unwrap_or(0) > 0 {
                status = UnitStatus::Warn;
            }
            let message = entry
                .message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| entry.status.clone());
            UnitResult::new(
                entry.unique_id,
                status,
                message,
                entry.execution_time.map(secs_to_ms).unwrap_or(0),
            )
        })
        .collect();
    Ok(RunResults {
        units,
        elapsed_ms: doc.elapsed_time.map(secs_to_ms),
    })
}

/// Modification time and size of a results file, taken before a run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    modified: SystemTime,
    len: u64,
}

impl FileStamp {
    /// Stamp of the file at `path`, or `None` when it does not exist.
    pub fn of(path: &Path) -> Option<Self> {
        let meta = std::fs::metadata(path).ok()?;
        Some(Self {
            modified: meta.modified().ok()?,
            len: meta.len(),
        })
    }
}

/// Load a results file written by the run that started at `since`.
///
/// Returns `None` when the file is missing, older than `since`, unchanged
/// from `before` (left over from a previous run in the same second) or
/// cannot be parsed.
pub fn load_fresh(path: &Path, since: SystemTime, before: Option<FileStamp>) -> Option<RunResults> {
    let now = FileStamp::of(path)?;
    if now.modified < since || before == Some(now) {
        debug!(path = %path.display(), "ignoring stale results file");
        return None;
    }
    let json = match std::fs::read_to_string(path) {
        Ok(json) => json,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read results file");
            return None;
        }
    };
    match parse_run_results(&json) {
        Ok(results) => Some(results),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt results file, falling back to text output");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SAMPLE: &str = r#"{
        "metadata": {"dbt_version": "1.7.4"},
        "results": [
            {"unique_id": "model.shop.stg_orders", "status": "error",
             "message": "Binder Error: Referenced column \"order_date\" not found",
             "execution_time": 0.051, "failures": null},
            {"unique_id": "model.shop.orders", "status": "skipped", "message": null,
             "execution_time": 0.0},
            {"unique_id": "test.shop.not_null_orders_id", "status": "warn",
             "message": "Got 2 results, configured to warn if != 0",
             "execution_time": 0.02, "failures": 2},
            {"unique_id": "seed.shop.raw_orders", "status": "success", "message": "INSERT 10",
             "execution_time": 0.2}
        ],
        "elapsed_time": 1.25
    }"#;

    #[test]
    fn test_parse_sample() {
        let results = parse_run_results(SAMPLE).unwrap();
        assert_eq!(results.units.len(), 4);
        assert_eq!(results.elapsed_ms, Some(1250));

        let first = &results.units[0];
        assert_eq!(first.status, UnitStatus::Error);
        assert_eq!(first.duration_ms, 51);
        assert!(first.message.contains("order_date"));

        assert_eq!(results.units[1].status, UnitStatus::Skipped);
        assert_eq!(results.units[1].message, "skipped");
        assert_eq!(results.units[2].status, UnitStatus::Warn);
        assert_eq!(results.units[3].status, UnitStatus::Success);
    }

    #[test]
    fn test_fail_status_is_error() {
        let results = parse_run_results(
            r#"{"results": [{"unique_id": "test.shop.unique_id", "status": "fail", "failures": 3}]}"#,
        )
        .unwrap();
        assert_eq!(results.units[0].status, UnitStatus::Error);
    }

    #[test]
    fn test_corrupt_document() {
        assert!(parse_run_results("{\"results\": [").is_err());
        assert!(parse_run_results("{}").is_err());
    }

    #[test]
    fn test_load_fresh_rejects_stale_and_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_results.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let before = SystemTime::now() - Duration::from_secs(60);
        assert!(load_fresh(&path, before, None).is_some());

        let later = SystemTime::now() + Duration::from_secs(60);
        assert!(load_fresh(&path, later, None).is_none());

        std::fs::write(&path, "not json").unwrap();
        assert!(load_fresh(&path, before, None).is_none());
        assert!(load_fresh(&dir.path().join("missing.json"), before, None).is_none());
    }

    #[test]
    fn test_load_fresh_rejects_file_untouched_since_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_results.json");
        std::fs::write(&path, SAMPLE).unwrap();
        let since = SystemTime::now() - Duration::from_secs(60);

        let stamp = FileStamp::of(&path);
        assert!(stamp.is_some());
        assert!(load_fresh(&path, since, stamp).is_none());

        std::fs::write(&path, format!("{SAMPLE}\n")).unwrap();
        assert!(load_fresh(&path, since, stamp).is_some());
    }
}
