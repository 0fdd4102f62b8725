//! Instance store: durable record of every procedure instance
//!
//! Writes are optimistic. [`InstanceStore::save`] succeeds only when the
//! stored version still equals the version the caller loaded, which is what
//! makes `advance` an atomic read-modify-write without holding locks across
//! await points. The same store doubles as the durable timer schedule through
//! [`InstanceStore::due_timers`].

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::InMemoryInstanceStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresInstanceStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crate::Instance;
use procedure_types::{InstanceId, InstanceStatus, StepId, SubjectId};
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Store-layer errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("instance not found: {0}")]
    NotFound(InstanceId),

    #[error("version conflict on {id}: expected {expected}, found {actual}")]
    VersionConflict {
        id: InstanceId,
        expected: u64,
        actual: u64,
    },

    #[error("subject '{subject}' already has a running '{procedure}' instance")]
    DuplicateActive {
        procedure: String,
        subject: SubjectId,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Selects instances for listing
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstanceFilter {
    pub procedure: Option<String>,
    pub subject: Option<SubjectId>,
    pub status: Option<InstanceStatus>,
    /// Maximum number of results; 0 means unbounded
    pub limit: usize,
}

impl InstanceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn procedure(mut self, procedure: impl Into<String>) -> Self {
        self.procedure = Some(procedure.into());
        self
    }

    pub fn subject(mut self, subject: SubjectId) -> Self {
        self.subject = Some(subject);
        self
    }

    pub fn status(mut self, status: InstanceStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, instance: &Instance) -> bool {
        self.procedure
            .as_deref()
            .map_or(true, |p| instance.procedure() == p)
            && self
                .subject
                .as_ref()
                .map_or(true, |s| instance.subject() == s)
            && self.status.map_or(true, |s| instance.status() == s)
    }
}

/// One entry of the durable timer schedule
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DueTimer {
    pub instance_id: InstanceId,
    pub step: StepId,
    pub due_at: DateTime<Utc>,
    pub armed_version: u64,
}

/// Storage interface for procedure instances.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Insert a new instance. Rejects a second Running instance of the same
    /// procedure for the same subject.
    async fn insert(&self, instance: &Instance) -> StoreResult<()>;

    /// Load one instance by id.
    async fn load(&self, id: &InstanceId) -> StoreResult<Option<Instance>>;

    /// Replace an instance if the stored version equals `expected_version`.
    /// The instance passed in must carry `expected_version + 1`.
    async fn save(&self, instance: &Instance, expected_version: u64) -> StoreResult<()>;

    /// List instances oldest-first.
    async fn list(&self, filter: &InstanceFilter) -> StoreResult<Vec<Instance>>;

    /// Running instances whose armed timer is due at `now`, earliest first.
    async fn due_timers(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<DueTimer>>;
}

fn check_next_version(instance: &Instance, expected_version: u64) -> StoreResult<()> {
    if instance.version() != expected_version + 1 {
        return Err(StoreError::Backend(format!(
            "instance {} saved with version {}, expected {}",
            instance.id(),
            instance.version(),
            expected_version + 1
        )));
    }
    Ok(())
}
