//! Engine error taxonomy

use crate::store::StoreError;
use procedure_types::{
    InstanceId, InstanceStatus, ProcedureError, RoleName, StepId, SubjectId, SubjectKind,
};

/// How a caller (or the timer manager) should treat an error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Broken definition; the affected instance is aborted
    Configuration,
    /// Lost a race; reload and retry
    Contention,
    /// Caller lacks the required role
    Authorization,
    /// Request does not fit the instance's state
    Usage,
    /// Storage trouble; safe to retry with backoff
    Infrastructure,
}

/// Errors surfaced by the workflow engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Instance not found: {0}")]
    NotFound(InstanceId),

    #[error("Instance {instance} is already {status}")]
    AlreadyTerminal {
        instance: InstanceId,
        status: InstanceStatus,
    },

    #[error("Forbidden: {action} requires role '{required}'")]
    Forbidden { action: String, required: RoleName },

    #[error("Invalid transition: signal '{signal}' is not enabled at step '{step}'")]
    InvalidTransition { step: StepId, signal: String },

    #[error("No matching transition at gateway '{step}'")]
    NoMatchingTransition { step: StepId },

    #[error("Instance {0} was already transitioned by a concurrent signal")]
    AlreadyTransitioned(InstanceId),

    #[error("Subject '{subject}' already has a running '{procedure}' instance")]
    DuplicateActive {
        procedure: String,
        subject: SubjectId,
    },

    #[error("Procedure '{procedure}' runs for a {expected}, not a {actual}")]
    WrongSubjectKind {
        procedure: String,
        expected: SubjectKind,
        actual: SubjectKind,
    },

    #[error("Unknown procedure: {0}")]
    UnknownProcedure(String),

    #[error("Invalid definition: {0}")]
    InvalidDefinition(#[from] ProcedureError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoMatchingTransition { .. }
            | Self::InvalidDefinition(_)
            | Self::Configuration(_) => ErrorKind::Configuration,
            Self::AlreadyTransitioned(_) => ErrorKind::Contention,
            Self::Forbidden { .. } => ErrorKind::Authorization,
            Self::NotFound(_)
            | Self::AlreadyTerminal { .. }
            | Self::InvalidTransition { .. }
            | Self::DuplicateActive { .. }
            | Self::WrongSubjectKind { .. }
            | Self::UnknownProcedure(_) => ErrorKind::Usage,
            Self::Store(_) => ErrorKind::Infrastructure,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Contention | ErrorKind::Infrastructure)
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::VersionConflict { id, .. } => Self::AlreadyTransitioned(id),
            StoreError::DuplicateActive { procedure, subject } => {
                Self::DuplicateActive { procedure, subject }
            }
            other => Self::Store(other),
        }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
