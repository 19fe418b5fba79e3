//! pipemend runner
//!
//! Invokes the pipeline build tool as a subprocess and turns its results
//! file or console output into an [`pipemend_core::ExecutionResult`].

pub mod command;
pub mod results;
pub mod text;

pub use command::CommandRunner;
pub use results::{load_fresh, parse_run_results, FileStamp, RunResults};
pub use text::{ParsedOutput, RunSummary, TextParser};
