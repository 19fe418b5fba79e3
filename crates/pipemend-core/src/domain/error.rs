//! Error taxonomy for pipemend.

use std::path::PathBuf;

/// Failure to invoke the build job at all.
///
/// A job that runs and fails is a valid [`ExecutionResult`](super::ExecutionResult),
/// never a `RunnerError`.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("build tool binary not found: {0}")]
    BinaryMissing(String),

    #[error("working directory is not usable: {}", .0.display())]
    InvalidWorkDir(PathBuf),

    #[error("runner command is empty")]
    EmptyCommand,

    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("runner invocation cancelled")]
    Cancelled,
}

/// Reasons a fix could not be applied or rolled back safely.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("old text not found in {artifact}")]
    NotFound { artifact: String },

    #[error("old text occurs {occurrences} times in {artifact}")]
    Ambiguous { artifact: String, occurrences: usize },

    #[error("backup missing: {}", .0.display())]
    BackupMissing(PathBuf),

    #[error("backup digest mismatch for {}: expected {expected}, got {actual}", .path.display())]
    BackupCorrupt {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("proposal rejected: {0}")]
    InvalidProposal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unknown execution mode: {0}")]
    UnknownMode(String),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

/// pipemend domain errors.
#[derive(Debug, thiserror::Error)]
pub enum PipemendError {
    #[error("runner error: {0}")]
    Runner(#[from] RunnerError),

    #[error("apply error: {0}")]
    Apply(#[from] ApplyError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for pipemend domain operations.
pub type Result<T> = std::result::Result<T, PipemendError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_error_display() {
        let err = ApplyError::NotFound {
            artifact: "models/stg_orders.sql".to_string(),
        };
        assert!(err.to_string().contains("models/stg_orders.sql"));

        let err = ApplyError::Ambiguous {
            artifact: "models/x.sql".to_string(),
            occurrences: 3,
        };
        assert!(err.to_string().contains("3 times"));
    }

    #[test]
    fn test_runner_error_wraps_into_domain_error() {
        let err: PipemendError = RunnerError::BinaryMissing("dbt".to_string()).into();
        assert!(err.to_string().contains("runner error"));
        assert!(err.to_string().contains("dbt"));
    }

    #[test]
    fn test_digest_mismatch_error() {
        let err = PipemendError::DigestMismatch {
            expected: "abc123".to_string(),
            actual: "def456".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("abc123"));
        assert!(msg.contains("def456"));
    }
}
