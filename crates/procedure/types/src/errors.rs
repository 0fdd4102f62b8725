//! Error types for procedure definitions

use crate::StepId;

/// Errors raised while building or validating a procedure definition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcedureError {
    #[error("Step not found: {0}")]
    StepNotFound(StepId),

    #[error("Duplicate step ID: {0}")]
    DuplicateStep(StepId),

    #[error("Duplicate transition: {from} -> {to}")]
    DuplicateTransition { from: StepId, to: StepId },

    #[error("No start event defined")]
    NoStartStep,

    #[error("No end event defined")]
    NoEndStep,

    #[error("Disconnected graph: step '{0}' is unreachable from the start event")]
    DisconnectedGraph(StepId),

    #[error("Invalid guard expression '{expression}': {reason}")]
    InvalidGuard { expression: String, reason: String },

    #[error("Procedure validation error: {0}")]
    Validation(String),
}

/// Result type alias for definition operations
pub type ProcedureResult<T> = Result<T, ProcedureError>;
