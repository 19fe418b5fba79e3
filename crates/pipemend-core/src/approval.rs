//! Approval channels.
//!
//! When the gate returns `RequestApproval` the loop suspends on an
//! [`ApprovalChannel`]. Channels that cannot reach a human answer
//! `Unavailable`, which the loop records as pending review.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::classification::ErrorKind;
use crate::domain::proposal::FixProposal;

/// What a reviewer is asked to approve.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalRequest {
    pub loop_id: String,
    pub attempt: u32,
    pub kind: ErrorKind,
    pub root_cause: String,
    pub proposal: FixProposal,
}

/// A reviewer's answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum ApprovalResponse {
    Approved,
    Denied { reason: Option<String> },
    /// No reviewer could be reached (non-interactive, timed out, closed input).
    Unavailable,
}

#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    async fn request(&self, request: &ApprovalRequest) -> ApprovalResponse;
}

/// Channel for unattended runs; never approves anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonInteractive;

#[async_trait]
impl ApprovalChannel for NonInteractive {
    async fn request(&self, _request: &ApprovalRequest) -> ApprovalResponse {
        ApprovalResponse::Unavailable
    }
}

/// Channel that replays canned responses and records what it was asked.
///
/// Once the script runs out every request is answered `Unavailable`.
#[derive(Debug, Default)]
pub struct Scripted {
    responses: Mutex<VecDeque<ApprovalResponse>>,
    seen: Mutex<Vec<ApprovalRequest>>,
}

impl Scripted {
    pub fn new(responses: impl IntoIterator<Item = ApprovalResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<ApprovalRequest> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ApprovalChannel for Scripted {
    async fn request(&self, request: &ApprovalRequest) -> ApprovalResponse {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(request.clone());
        }
        self.responses
            .lock()
            .ok()
            .and_then(|mut r| r.pop_front())
            .unwrap_or(ApprovalResponse::Unavailable)
    }
}

/// Ask `channel`, treating an expired `timeout` as `Unavailable`.
pub async fn request_approval(
    channel: &dyn ApprovalChannel,
    request: &ApprovalRequest,
    timeout: Option<Duration>,
) -> ApprovalResponse {
    match timeout {
        None => channel.request(request).await,
        Some(limit) => match tokio::time::timeout(limit, channel.request(request)).await {
            Ok(response) => response,
            Err(_) => {
                warn!(
                    loop_id = %request.loop_id,
                    attempt = request.attempt,
                    timeout_secs = limit.as_secs(),
                    "approval request timed out"
                );
                ApprovalResponse::Unavailable
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::proposal::MatchQuality;

    fn request() -> ApprovalRequest {
        ApprovalRequest {
            loop_id: "loop-1".to_string(),
            attempt: 0,
            kind: ErrorKind::Schema,
            root_cause: "column missing".to_string(),
            proposal: FixProposal::new(
                "models/a.sql",
                ErrorKind::Schema,
                "a",
                "b",
                0.5,
                MatchQuality::Ambiguous,
            )
            .expect("proposal"),
        }
    }

    struct Silent;

    #[async_trait]
    impl ApprovalChannel for Silent {
        async fn request(&self, _request: &ApprovalRequest) -> ApprovalResponse {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            ApprovalResponse::Approved
        }
    }

    #[tokio::test]
    async fn test_non_interactive_is_unavailable() {
        assert_eq!(
            NonInteractive.request(&request()).await,
            ApprovalResponse::Unavailable
        );
    }

    #[tokio::test]
    async fn test_scripted_replays_then_runs_dry() {
        let channel = Scripted::new([
            ApprovalResponse::Approved,
            ApprovalResponse::Denied {
                reason: Some("wrong column".to_string()),
            },
        ]);
        assert_eq!(channel.request(&request()).await, ApprovalResponse::Approved);
        assert!(matches!(
            channel.request(&request()).await,
            ApprovalResponse::Denied { .. }
        ));
        assert_eq!(channel.request(&request()).await, ApprovalResponse::Unavailable);
        assert_eq!(channel.requests().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_maps_to_unavailable() {
        let response = request_approval(&Silent, &request(), Some(Duration::from_secs(30))).await;
        assert_eq!(response, ApprovalResponse::Unavailable);
    }

    #[tokio::test]
    async fn test_no_timeout_passes_through() {
        let channel = Scripted::new([ApprovalResponse::Approved]);
        let response = request_approval(&channel, &request(), None).await;
        assert_eq!(response, ApprovalResponse::Approved);
    }

    #[test]
    fn test_response_serde() {
        let json = serde_json::to_string(&ApprovalResponse::Unavailable).unwrap();
        assert_eq!(json, r#"{"response":"unavailable"}"#);
    }
}
