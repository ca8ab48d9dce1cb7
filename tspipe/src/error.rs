//! Error types for the processing engine.

use thiserror::Error;

/// Errors reported by a stage during its lifecycle.
#[derive(Error, Debug)]
pub enum StageError {
    /// I/O error in a file or network operation.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid option value or option combination.
    #[error("{0}")]
    Options(String),

    /// Runtime failure while processing packets.
    #[error("{0}")]
    Runtime(String),

    /// ECMG communication failure.
    #[error("ECMG error: {0}")]
    Ecmg(String),
}

/// A pipeline failure: the first error recorded by any stage.
#[derive(Error, Debug)]
#[error("stage '{stage}': {error}")]
pub struct PipelineError {
    /// Name of the failing stage.
    pub stage: String,
    /// The underlying stage error.
    pub error: StageError,
}

impl PipelineError {
    /// Wrap a stage error with the stage name.
    pub fn new(stage: impl Into<String>, error: StageError) -> Self {
        PipelineError {
            stage: stage.into(),
            error,
        }
    }
}
