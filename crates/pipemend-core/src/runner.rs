//! Execution runner trait.
//!
//! Defines the `ExecutionRunner` async trait the healing loop drives. The
//! subprocess-backed implementation lives in the `pipemend-runner` crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::error::RunnerError;
use crate::domain::execution::{unit_name, ExecutionResult};

/// How much of the pipeline a run covers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "scope", content = "unit_id", rename_all = "snake_case")]
pub enum RunScope {
    /// The whole pipeline.
    Full,
    /// A single unit, used to verify a fix cheaply.
    Unit(String),
}

impl RunScope {
    pub fn is_full(&self) -> bool {
        matches!(self, RunScope::Full)
    }

    /// Selector passed to the build tool, if the run is scoped.
    pub fn selector(&self) -> Option<&str> {
        match self {
            RunScope::Full => None,
            RunScope::Unit(unit_id) => Some(unit_name(unit_id)),
        }
    }
}

/// Trait for build-job runner backends.
///
/// Job failure is reported through [`ExecutionResult`]; `Err` is reserved
/// for being unable to invoke the job at all.
#[async_trait]
pub trait ExecutionRunner: Send + Sync {
    async fn run(&self, scope: &RunScope) -> std::result::Result<ExecutionResult, RunnerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_selector() {
        assert_eq!(RunScope::Full.selector(), None);
        assert_eq!(
            RunScope::Unit("model.shop.stg_orders".to_string()).selector(),
            Some("stg_orders")
        );
    }

    #[test]
    fn test_scope_serde_roundtrip() {
        let scope = RunScope::Unit("model.shop.x".to_string());
        let json = serde_json::to_string(&scope).expect("serialize");
        let back: RunScope = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(scope, back);
        assert!(!back.is_full());
    }
}
