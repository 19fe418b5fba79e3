//! Subprocess-backed execution runner.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::Utc;
use pipemend_core::config::RunnerSection;
use pipemend_core::{ExecutionResult, ExecutionRunner, RunScope, RunnerError, UnitStatus};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::results::{self, FileStamp};
use crate::text::TextParser;

/// Lines of combined output kept as error text when nothing better parses.
pub const OUTPUT_TAIL_LINES: usize = 40;

/// Runs the build tool as a child process.
///
/// Units come from the structured results file when the run wrote a fresh
/// one, otherwise from the console output.
pub struct CommandRunner {
    command: String,
    args: Vec<String>,
    work_dir: PathBuf,
    results_path: Option<PathBuf>,
    select_flag: String,
    timeout: Option<Duration>,
    env: Vec<(String, String)>,
    parser: TextParser,
}

impl CommandRunner {
    pub fn new(command: impl Into<String>, args: Vec<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args,
            work_dir: work_dir.into(),
            results_path: None,
            select_flag: "--select".to_string(),
            timeout: None,
            env: Vec::new(),
            parser: TextParser::new(),
        }
    }

    /// Build from the `[runner]` config section. `work_dir` must already be
    /// resolved against the config file location.
    pub fn from_config(section: &RunnerSection) -> Self {
        let mut runner = Self::new(
            section.command.clone(),
            section.args.clone(),
            section.work_dir.clone(),
        )
        .with_results_path(section.results_path.clone())
        .with_select_flag(section.select_flag.clone());
        if let Some(secs) = section.timeout_secs {
            runner = runner.with_timeout(Duration::from_secs(secs));
        }
        runner
    }

    /// Results file, relative to the working directory unless absolute.
    pub fn with_results_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.results_path = Some(path.into());
        self
    }

    pub fn with_select_flag(mut self, flag: impl Into<String>) -> Self {
        self.select_flag = flag.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn args_for(&self, scope: &RunScope) -> Vec<String> {
        let mut args = self.args.clone();
        if let Some(selector) = scope.selector() {
            args.push(self.select_flag.clone());
            args.push(selector.to_string());
        }
        args
    }

    fn resolved_results_path(&self) -> Option<PathBuf> {
        self.results_path.as_ref().map(|p| {
            if p.is_absolute() {
                p.clone()
            } else {
                self.work_dir.join(p)
            }
        })
    }
}

/// Start time floored to the second, so filesystems with coarse mtimes
/// still count a results file written during the run as fresh.
fn freshness_floor(now: SystemTime) -> SystemTime {
    match now.duration_since(UNIX_EPOCH) {
        Ok(since_epoch) => UNIX_EPOCH + Duration::from_secs(since_epoch.as_secs()),
        Err(_) => now,
    }
}

fn output_tail(output: &str, lines: usize) -> String {
    let all: Vec<&str> = output.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[async_trait]
impl ExecutionRunner for CommandRunner {
    async fn run(&self, scope: &RunScope) -> Result<ExecutionResult, RunnerError> {
        if self.command.trim().is_empty() {
            return Err(RunnerError::EmptyCommand);
        }
        if !self.work_dir.is_dir() {
            return Err(RunnerError::InvalidWorkDir(self.work_dir.clone()));
        }

        let args = self.args_for(scope);
        let command_line = std::iter::once(self.command.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");

        let started_at = Utc::now();
        let since = freshness_floor(SystemTime::now());
        let results_path = self.resolved_results_path();
        let before = results_path.as_deref().and_then(FileStamp::of);
        let start = Instant::now();

        debug!(command = %command_line, work_dir = %self.work_dir.display(), "spawning build");
        let child = Command::new(&self.command)
            .args(&args)
            .current_dir(&self.work_dir)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => RunnerError::BinaryMissing(self.command.clone()),
                _ => RunnerError::Spawn {
                    command: command_line.clone(),
                    source: e,
                },
            })?;

        let waited = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(waited) => Some(waited),
                Err(_) => None,
            },
            None => Some(child.wait_with_output().await),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        let output = match waited {
            Some(Ok(output)) => output,
            Some(Err(e)) => {
                return Err(RunnerError::Spawn {
                    command: command_line,
                    source: e,
                })
            }
            None => {
                let limit = self.timeout.unwrap_or_default();
                warn!(command = %command_line, timeout_secs = limit.as_secs_f64(), "build timed out");
                return Ok(ExecutionResult::new(
                    command_line,
                    None,
                    Vec::new(),
                    duration_ms,
                    Some(format!(
                        "build timed out after {:.1}s and was killed",
                        limit.as_secs_f64()
                    )),
                    started_at,
                ));
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }

        let parsed = self.parser.parse(&combined);
        let units = match results_path
            .as_deref()
            .and_then(|path| results::load_fresh(path, since, before))
        {
            Some(structured) => structured.units,
            None => parsed.units,
        };

        let mut failures: Vec<String> = units
            .iter()
            .filter(|u| u.status == UnitStatus::Error)
            .map(|u| format!("{}: {}", u.unit_id, u.message))
            .collect();
        failures.extend(parsed.orphan_errors);
        let error_text = if failures.is_empty() {
            output_tail(&combined, OUTPUT_TAIL_LINES)
        } else {
            failures.join("\n")
        };

        let result = ExecutionResult::new(
            command_line,
            output.status.code(),
            units,
            duration_ms,
            Some(error_text),
            started_at,
        );
        info!(
            command = %result.command,
            succeeded = result.succeeded(),
            units = result.units.len(),
            duration_ms,
            "build finished"
        );
        Ok(result)
    }
}
