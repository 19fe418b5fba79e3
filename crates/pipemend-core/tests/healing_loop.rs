use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pipemend_core::{
    ApprovalChannel, ApprovalRequest, ApprovalResponse, BackoffPolicy, BackupManager,
    ClassifierRule, ErrorClassifier, ErrorKind, ExecutionMode, ExecutionResult, ExecutionRunner,
    HealingLoop, LoopIssue, LoopOutcome, LoopPhase, LoopSettings, MemoryAuditLog, ModeKind,
    ProjectArtifacts, RunScope, RunnerError, Scripted, StaticCatalog, UnitResult, UnitStatus,
    UnrecoverableReason,
};
use tempfile::TempDir;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const UNIT: &str = "model.shop.stg_orders";
const ARTIFACT: &str = "models/staging/stg_orders.sql";
const ORIGINAL: &str = "select\n    order_id,\n    order_date\nfrom {{ ref('orders') }}\n";
const COLUMN_ERROR: &str = r#"Binder Error: Referenced column "order_date" not found in FROM clause!"#;

type Behaviour = Box<dyn Fn(&RunScope, &str) -> ExecutionResult + Send + Sync>;

struct FakeRunner {
    artifact: PathBuf,
    behaviour: Behaviour,
    calls: Mutex<Vec<(RunScope, Instant)>>,
}

#[async_trait]
impl ExecutionRunner for FakeRunner {
    async fn run(&self, scope: &RunScope) -> Result<ExecutionResult, RunnerError> {
        let text = std::fs::read_to_string(&self.artifact).unwrap_or_default();
        self.calls
            .lock()
            .unwrap()
            .push((scope.clone(), Instant::now()));
        Ok((self.behaviour)(scope, &text))
    }
}

struct BrokenRunner;

#[async_trait]
impl ExecutionRunner for BrokenRunner {
    async fn run(&self, _scope: &RunScope) -> Result<ExecutionResult, RunnerError> {
        Err(RunnerError::BinaryMissing("dbt".to_string()))
    }
}

fn failed(message: &str) -> ExecutionResult {
    ExecutionResult::new(
        "dbt build",
        Some(1),
        vec![UnitResult::new(UNIT, UnitStatus::Error, message, 5)],
        5,
        Some(message.to_string()),
        Utc::now(),
    )
}

fn passed() -> ExecutionResult {
    ExecutionResult::new(
        "dbt build",
        Some(0),
        vec![UnitResult::new(UNIT, UnitStatus::Success, "OK", 5)],
        5,
        None,
        Utc::now(),
    )
}

/// A failed run that names no unit, only the artifact path.
fn failed_without_units(message: &str) -> ExecutionResult {
    ExecutionResult::new(
        "dbt build",
        Some(1),
        Vec::new(),
        5,
        Some(message.to_string()),
        Utc::now(),
    )
}

const UNITLESS_ERROR: &str =
    "Runtime Error (models/staging/stg_orders.sql)\n  column \"order_date\" not found";

/// Fails while the artifact still mentions `order_date`.
fn column_bug() -> Behaviour {
    Box::new(|_scope: &RunScope, text: &str| {
        if text.contains("order_date") {
            failed(COLUMN_ERROR)
        } else {
            passed()
        }
    })
}

/// Full runs hit the column bug; verification runs never pass.
fn stubborn_bug() -> Behaviour {
    Box::new(|scope: &RunScope, _text: &str| match scope {
        RunScope::Full => failed(COLUMN_ERROR),
        RunScope::Unit(_) => failed("Runtime Error: still broken"),
    })
}

struct Fixture {
    dir: TempDir,
    runner: Arc<FakeRunner>,
    audit: Arc<MemoryAuditLog>,
}

impl Fixture {
    fn new(behaviour: Behaviour) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(ARTIFACT);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, ORIGINAL).unwrap();
        let runner = Arc::new(FakeRunner {
            artifact: path,
            behaviour,
            calls: Mutex::new(Vec::new()),
        });
        Self {
            dir,
            runner,
            audit: Arc::new(MemoryAuditLog::new()),
        }
    }

    fn healing_loop(&self, mode: ExecutionMode) -> HealingLoop {
        let catalog = StaticCatalog::new()
            .with_relation("orders", ["order_id", "customer_id", "ordered_at", "amount"])
            .with_identifier("stg_orders")
            .with_identifier("stg_customers");
        let backups = BackupManager::new(self.dir.path(), self.backup_dir());
        HealingLoop::new(
            self.runner.clone(),
            Arc::new(ProjectArtifacts::new(self.dir.path())),
            Arc::new(catalog),
            backups,
            mode,
        )
        .with_audit(self.audit.clone())
    }

    fn backup_dir(&self) -> PathBuf {
        self.dir.path().join(".pipemend/backups")
    }

    fn artifact_text(&self) -> String {
        std::fs::read_to_string(self.dir.path().join(ARTIFACT)).unwrap()
    }

    fn full_run_times(&self) -> Vec<Instant> {
        self.runner
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(scope, _)| scope.is_full())
            .map(|(_, at)| *at)
            .collect()
    }

    fn runner_calls(&self) -> usize {
        self.runner.calls.lock().unwrap().len()
    }
}

fn backups_left(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

fn assert_close(actual: Duration, expected: Duration) {
    assert!(
        actual >= expected && actual < expected + Duration::from_millis(50),
        "expected ~{expected:?}, got {actual:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn schema_typo_is_fixed_verified_and_rerun() {
    let fx = Fixture::new(column_bug());
    let state = fx
        .healing_loop(ExecutionMode::new(ModeKind::Autonomous))
        .run()
        .await
        .unwrap();

    assert_eq!(state.outcome, Some(LoopOutcome::Succeeded));
    assert_eq!(state.phase, LoopPhase::Succeeded);
    assert!(fx.artifact_text().contains("ordered_at"));
    assert!(!fx.artifact_text().contains("order_date"));

    let first = &state.attempts[0];
    let classification = first.classification.as_ref().unwrap();
    assert_eq!(classification.kind, ErrorKind::Schema);
    let proposal = first.proposal.as_ref().unwrap();
    assert_eq!(proposal.old_text, "order_date");
    assert_eq!(proposal.new_text, "ordered_at");
    assert!(proposal.confidence >= 0.8);
    assert_eq!(first.verified, Some(true));
    assert!(!first.rolled_back);

    assert_eq!(state.full_runs, 2);
    assert_eq!(state.scoped_runs, 1);
    assert_eq!(state.backoff_delays_ms(), vec![5_000]);
    assert_eq!(backups_left(&fx.backup_dir()), 0);
    assert!(state.transitions_are_valid());

    let fixes = fx.audit.fixes();
    assert_eq!(fixes.len(), 1);
    assert!(fixes[0].applied);
    assert_eq!(fixes[0].verified, Some(true));
    assert_eq!(fx.audit.runs().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn missing_relation_without_candidate_is_unrecoverable() {
    let fx = Fixture::new(Box::new(|_: &RunScope, _: &str| {
        failed(r#"Catalog Error: relation "stg_foo" does not exist"#)
    }));
    let state = fx
        .healing_loop(ExecutionMode::new(ModeKind::Autonomous))
        .run()
        .await
        .unwrap();

    assert_eq!(
        state.outcome,
        Some(LoopOutcome::Unrecoverable(
            UnrecoverableReason::ProposalUnavailable
        ))
    );
    assert_eq!(state.attempts.len(), 1);
    assert_eq!(
        state.attempts[0].classification.as_ref().unwrap().kind,
        ErrorKind::MissingRef
    );
    assert!(state.attempts[0].proposal.is_none());
    assert_eq!(fx.runner_calls(), 1);
    assert_eq!(fx.artifact_text(), ORIGINAL);
    assert!(state
        .issues
        .iter()
        .any(|i| matches!(i, LoopIssue::ProposalUnavailable { .. })));
}

#[tokio::test(start_paused = true)]
async fn human_in_loop_defers_without_applying() {
    let fx = Fixture::new(column_bug());
    let approvals = Arc::new(Scripted::default());
    let state = fx
        .healing_loop(ExecutionMode::new(ModeKind::HumanInLoop))
        .with_approvals(approvals.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(
        state.outcome,
        Some(LoopOutcome::Unrecoverable(UnrecoverableReason::PendingReview))
    );
    let phases: Vec<LoopPhase> = state.transitions.iter().map(|t| t.to).collect();
    assert!(phases.contains(&LoopPhase::Deferred));
    assert!(!phases.contains(&LoopPhase::Applying));
    assert_eq!(fx.artifact_text(), ORIGINAL);
    assert_eq!(approvals.requests().len(), 1);
    assert!(approvals.requests()[0].proposal.confidence >= 0.8);
    assert!(!state.attempts[0].applied);
}

#[tokio::test(start_paused = true)]
async fn human_approval_lets_fix_through() {
    let fx = Fixture::new(column_bug());
    let approvals = Arc::new(Scripted::new([ApprovalResponse::Approved]));
    let state = fx
        .healing_loop(ExecutionMode::new(ModeKind::HumanInLoop))
        .with_approvals(approvals)
        .run()
        .await
        .unwrap();

    assert_eq!(state.outcome, Some(LoopOutcome::Succeeded));
    assert!(fx.artifact_text().contains("ordered_at"));
    assert!(state.transitions_are_valid());
}

#[tokio::test(start_paused = true)]
async fn denied_approval_is_unrecoverable() {
    let fx = Fixture::new(column_bug());
    let approvals = Arc::new(Scripted::new([ApprovalResponse::Denied {
        reason: Some("rename upstream instead".to_string()),
    }]));
    let state = fx
        .healing_loop(ExecutionMode::new(ModeKind::HumanInLoop))
        .with_approvals(approvals)
        .run()
        .await
        .unwrap();

    assert_eq!(
        state.outcome,
        Some(LoopOutcome::Unrecoverable(UnrecoverableReason::ApprovalDenied))
    );
    assert_eq!(fx.artifact_text(), ORIGINAL);
}

#[tokio::test(start_paused = true)]
async fn failed_verifications_roll_back_and_exhaust_with_backoff() {
    let fx = Fixture::new(stubborn_bug());
    let state = fx
        .healing_loop(ExecutionMode::new(ModeKind::Autonomous))
        .run()
        .await
        .unwrap();

    assert_eq!(state.outcome, Some(LoopOutcome::Exhausted));
    assert_eq!(state.rollbacks(), 3);
    assert_eq!(state.full_runs, 4);
    assert_eq!(state.scoped_runs, 3);
    assert_eq!(state.backoff_delays_ms(), vec![5_000, 10_000, 20_000]);
    assert_eq!(fx.artifact_text(), ORIGINAL);
    assert_eq!(backups_left(&fx.backup_dir()), 0);
    assert!(state.transitions_are_valid());

    let times = fx.full_run_times();
    assert_eq!(times.len(), 4);
    assert_close(times[1] - times[0], Duration::from_secs(5));
    assert_close(times[2] - times[1], Duration::from_secs(10));
    assert_close(times[3] - times[2], Duration::from_secs(20));

    let fixes = fx.audit.fixes();
    assert_eq!(fixes.len(), 3);
    assert!(fixes.iter().all(|f| f.applied && f.rolled_back));
    assert!(state.last_attempt().unwrap().proposal.is_none());
    assert_eq!(
        state
            .issues
            .iter()
            .filter(|i| matches!(i, LoopIssue::VerificationFailed { .. }))
            .count(),
        3
    );
}

#[tokio::test(start_paused = true)]
async fn full_runs_never_exceed_retry_budget() {
    for max_retries in [0, 1, 2, 5] {
        let fx = Fixture::new(stubborn_bug());
        let mode = ExecutionMode::new(ModeKind::Autonomous).with_max_retries(max_retries);
        let state = fx
            .healing_loop(mode)
            .with_settings(LoopSettings {
                backoff: BackoffPolicy::none(),
                approval_timeout: None,
            })
            .run()
            .await
            .unwrap();

        assert_eq!(state.outcome, Some(LoopOutcome::Exhausted));
        assert_eq!(fx.full_run_times().len() as u32, max_retries + 1);
        assert!(state.full_runs <= max_retries + 1);
        assert!(state.scoped_runs <= max_retries);
    }
}

#[tokio::test(start_paused = true)]
async fn low_confidence_fix_never_applied_without_approval() {
    let fx = Fixture::new(Box::new(|_: &RunScope, text: &str| {
        if text.contains("order_date") {
            failed(r#"soft column "order_date" missing"#)
        } else {
            passed()
        }
    }));
    let classifier = ErrorClassifier::with_extra_rules(vec![ClassifierRule::new(
        "soft_column",
        r#"(?i)soft column "(?P<subject>\w+)" missing"#,
        ErrorKind::Schema,
        0.75,
        "column `{subject}` may be misspelled",
    )]);
    let mode = ExecutionMode::new(ModeKind::Autonomous).with_min_confidence(0.8);

    let state = fx
        .healing_loop(mode)
        .with_classifier(classifier)
        .run()
        .await
        .unwrap();

    let proposal = state.attempts[0].proposal.as_ref().unwrap();
    assert!((proposal.confidence - 0.75).abs() < 1e-9);
    assert_eq!(
        state.outcome,
        Some(LoopOutcome::Unrecoverable(UnrecoverableReason::PendingReview))
    );
    assert!(!state
        .transitions
        .iter()
        .any(|t| t.to == LoopPhase::Applying));
    assert_eq!(fx.artifact_text(), ORIGINAL);
}

#[tokio::test(start_paused = true)]
async fn unknown_failure_surfaces_raw_text() {
    let raw = "Segmentation fault in adapter plugin";
    let fx = Fixture::new(Box::new(move |_: &RunScope, _: &str| failed(raw)));
    let state = fx
        .healing_loop(ExecutionMode::new(ModeKind::Autonomous))
        .run()
        .await
        .unwrap();

    assert_eq!(
        state.outcome,
        Some(LoopOutcome::Unrecoverable(
            UnrecoverableReason::ClassificationAmbiguous
        ))
    );
    assert!(state.attempts[0].proposal.is_none());
    assert!(state.issues.iter().any(
        |i| matches!(i, LoopIssue::ClassificationAmbiguous { raw_text } if raw_text == raw)
    ));
}

#[tokio::test(start_paused = true)]
async fn unitless_fix_rolled_back_when_next_full_run_fails() {
    let fx = Fixture::new(Box::new(|_: &RunScope, _: &str| {
        failed_without_units(UNITLESS_ERROR)
    }));
    let state = fx
        .healing_loop(ExecutionMode::new(ModeKind::Autonomous))
        .with_settings(LoopSettings {
            backoff: BackoffPolicy::none(),
            approval_timeout: None,
        })
        .run()
        .await
        .unwrap();

    assert_eq!(state.outcome, Some(LoopOutcome::Exhausted));
    assert_eq!(state.full_runs, 4);
    assert_eq!(state.scoped_runs, 0);
    assert_eq!(state.rollbacks(), 2);
    assert_eq!(fx.artifact_text(), ORIGINAL);
    assert_eq!(backups_left(&fx.backup_dir()), 0);
    assert!(state.transitions_are_valid());

    let first = &state.attempts[0];
    assert!(first.applied);
    assert_eq!(first.verified, Some(false));
    assert!(first.rolled_back);
    assert_eq!(
        state
            .issues
            .iter()
            .filter(|i| matches!(i, LoopIssue::VerificationFailed { unit_id: None, .. }))
            .count(),
        2
    );
    let rolled_back = fx.audit.fixes().iter().filter(|f| f.rolled_back).count();
    assert_eq!(rolled_back, 2);
}

#[tokio::test(start_paused = true)]
async fn unitless_fix_kept_once_next_full_run_passes() {
    let fx = Fixture::new(Box::new(|_: &RunScope, text: &str| {
        if text.contains("order_date") {
            failed_without_units(UNITLESS_ERROR)
        } else {
            passed()
        }
    }));
    let state = fx
        .healing_loop(ExecutionMode::new(ModeKind::Autonomous))
        .with_settings(LoopSettings {
            backoff: BackoffPolicy::none(),
            approval_timeout: None,
        })
        .run()
        .await
        .unwrap();

    assert_eq!(state.outcome, Some(LoopOutcome::Succeeded));
    assert_eq!(state.full_runs, 2);
    assert_eq!(state.scoped_runs, 0);
    assert_eq!(state.attempts[0].verified, Some(true));
    assert_eq!(state.rollbacks(), 0);
    assert!(fx.artifact_text().contains("ordered_at"));
    assert_eq!(backups_left(&fx.backup_dir()), 0);
    assert!(state.transitions_are_valid());
}

#[tokio::test(start_paused = true)]
async fn cancellation_rolls_back_unchecked_fix() {
    let fx = Fixture::new(Box::new(|_: &RunScope, _: &str| {
        failed_without_units(UNITLESS_ERROR)
    }));
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        canceller.cancel();
    });

    let state = fx
        .healing_loop(ExecutionMode::new(ModeKind::Autonomous))
        .with_cancellation(token)
        .run()
        .await
        .unwrap();

    assert_eq!(state.outcome, Some(LoopOutcome::Cancelled));
    assert_eq!(state.full_runs, 1);
    assert_eq!(state.rollbacks(), 1);
    assert_eq!(fx.artifact_text(), ORIGINAL);
    assert_eq!(backups_left(&fx.backup_dir()), 0);
}

#[tokio::test(start_paused = true)]
async fn runner_error_aborts_loop() {
    let dir = tempfile::tempdir().unwrap();
    let healing = HealingLoop::new(
        Arc::new(BrokenRunner),
        Arc::new(ProjectArtifacts::new(dir.path())),
        Arc::new(StaticCatalog::new()),
        BackupManager::new(dir.path(), dir.path().join("backups")),
        ExecutionMode::default(),
    );
    let err = healing.run().await.unwrap_err();
    assert!(matches!(err, RunnerError::BinaryMissing(_)));
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_backoff_leaves_artifact_intact() {
    let fx = Fixture::new(stubborn_bug());
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        canceller.cancel();
    });

    let state = fx
        .healing_loop(ExecutionMode::new(ModeKind::Autonomous))
        .with_cancellation(token)
        .run()
        .await
        .unwrap();

    assert_eq!(state.outcome, Some(LoopOutcome::Cancelled));
    assert_eq!(state.full_runs, 1);
    assert_eq!(state.rollbacks(), 1);
    assert_eq!(fx.artifact_text(), ORIGINAL);
    assert!(state.transitions_are_valid());
}

struct SlowReviewer;

#[async_trait]
impl ApprovalChannel for SlowReviewer {
    async fn request(&self, _request: &ApprovalRequest) -> ApprovalResponse {
        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        ApprovalResponse::Approved
    }
}

#[tokio::test(start_paused = true)]
async fn approval_timeout_counts_as_pending_review() {
    let fx = Fixture::new(column_bug());
    let state = fx
        .healing_loop(ExecutionMode::new(ModeKind::HumanInLoop))
        .with_approvals(Arc::new(SlowReviewer))
        .with_settings(LoopSettings {
            backoff: BackoffPolicy::default(),
            approval_timeout: Some(Duration::from_secs(60)),
        })
        .run()
        .await
        .unwrap();

    assert_eq!(
        state.outcome,
        Some(LoopOutcome::Unrecoverable(UnrecoverableReason::PendingReview))
    );
    assert_eq!(
        state.attempts[0].approval,
        Some(ApprovalResponse::Unavailable)
    );
}
