//! Domain models for pipemend.
//!
//! Canonical definitions for the core entities:
//! - `ExecutionResult`: outcome of one build invocation
//! - `ErrorClassification`: a failure mapped onto the error taxonomy
//! - `FixProposal`: a text substitution with a confidence score
//! - `ExecutionMode`: how fixes get approved

pub mod classification;
pub mod error;
pub mod execution;
pub mod mode;
pub mod proposal;

pub use classification::{ErrorClassification, ErrorKind};
pub use error::{ApplyError, ConfigError, PipemendError, Result, RunnerError};
pub use execution::{unit_name, ExecutionResult, RunStatus, UnitResult, UnitStatus};
pub use mode::{ExecutionMode, ModeKind};
pub use proposal::{FixProposal, MatchQuality, VerificationStep};
