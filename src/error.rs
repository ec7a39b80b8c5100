// Positioning engine faults

use thiserror::Error;

/// Faults raised by the positioning pipeline.
///
/// Recoverable conditions (no sync history yet, no clock model yet) are not
/// errors; they are reported through the outcome enums of the stores instead.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PositionError {
    #[error("malformed report: {0}")]
    MalformedReport(String),

    #[error("rollover ambiguity for {key}: {elapsed:.3}s elapsed, wrap period is {period:.3}s")]
    RolloverAmbiguity {
        key: String,
        elapsed: f64,
        period: f64,
    },

    #[error("zero sequence delta between sync frames for anchor {anchor_id} (sequence {sequence})")]
    ClockModelDivisionFault { anchor_id: String, sequence: u64 },

    #[error("non-finite corrected time for anchor {anchor_id}")]
    NonFiniteCorrectedTime { anchor_id: String },

    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(String),

    #[error("solver did not converge after {iterations} iterations")]
    ConvergenceFailure { iterations: usize },
}

impl PositionError {
    /// Stable reason code reported to callers.
    pub fn reason_code(&self) -> &'static str {
        match self {
            PositionError::MalformedReport(_) => "MalformedReport",
            PositionError::RolloverAmbiguity { .. } => "RolloverAmbiguity",
            PositionError::ClockModelDivisionFault { .. } => "ClockModelDivisionFault",
            PositionError::NonFiniteCorrectedTime { .. } => "NonFiniteCorrectedTime",
            PositionError::DegenerateGeometry(_) => "DegenerateGeometry",
            PositionError::ConvergenceFailure { .. } => "ConvergenceFailure",
        }
    }

    /// Solver faults, as opposed to faults in the submitted data.
    pub fn is_solver_fault(&self) -> bool {
        matches!(
            self,
            PositionError::DegenerateGeometry(_) | PositionError::ConvergenceFailure { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PositionError>;
