use std::path::PathBuf;
use thiserror::Error;

/// `Configuration` is fatal for a whole batch; the row-scoped variants never
/// abort the remaining rows.
#[derive(Error, Debug)]
pub enum SweepError {
    #[error("File not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("malformed row {row}: {reason}")]
    MalformedRow { row: usize, reason: String },

    #[error("submission failed for row {row}: {message}")]
    Submission { row: usize, message: String },

    #[error("simulation failed for run {run_id}: exit status {status}")]
    SimulationFailure { run_id: String, status: String },
}

impl SweepError {
    pub fn configuration(message: impl Into<String>) -> Self {
        SweepError::Configuration(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            SweepError::NotFound(_) | SweepError::Configuration(_) => "configuration_error",
            SweepError::MalformedRow { .. } => "malformed_row",
            SweepError::Submission { .. } => "submission_error",
            SweepError::SimulationFailure { .. } => "simulation_failure",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, SweepError::NotFound(_) | SweepError::Configuration(_))
    }

    pub fn row(&self) -> Option<usize> {
        match self {
            SweepError::MalformedRow { row, .. } | SweepError::Submission { row, .. } => Some(*row),
            _ => None,
        }
    }
}
