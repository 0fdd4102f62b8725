//! Instance data: identifiers, variables, history records and snapshots
//!
//! The mutable instance record itself lives in the engine crate; callers only
//! ever see an [`InstanceSnapshot`].

use crate::{StepId, SubjectKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Named, typed instance variables
pub type Variables = BTreeMap<String, Value>;

// ── Identifiers ──────────────────────────────────────────────────────

/// Unique identifier for a procedure instance
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "proc:{}", self.short())
    }
}

/// Identifier of the provider or community an instance is bound to
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubjectId(pub String);

impl SubjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A subject together with its kind, as handed to the engine when starting
/// an instance
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    pub id: SubjectId,
    pub kind: SubjectKind,
}

impl Subject {
    pub fn new(id: impl Into<String>, kind: SubjectKind) -> Self {
        Self {
            id: SubjectId::new(id),
            kind,
        }
    }

    pub fn provider(id: impl Into<String>) -> Self {
        Self::new(id, SubjectKind::Provider)
    }

    pub fn community(id: impl Into<String>) -> Self {
        Self::new(id, SubjectKind::Community)
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

// ── Values ───────────────────────────────────────────────────────────

/// A typed instance variable value
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(n) => write!(f, "{}", n),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

// ── Status / Actor / History ─────────────────────────────────────────

/// Lifecycle status of an instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    Running,
    Completed,
    Aborted,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who caused a history record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Actor {
    /// A verified caller
    Identity { subject: String, issuer: String },
    /// The engine traversing an automatic step
    Engine,
    /// An expired timer
    Timer,
}

impl Actor {
    pub fn identity(subject: impl Into<String>, issuer: impl Into<String>) -> Self {
        Self::Identity {
            subject: subject.into(),
            issuer: issuer.into(),
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Identity { subject, issuer } => write!(f, "{}@{}", subject, issuer),
            Self::Engine => write!(f, "engine"),
            Self::Timer => write!(f, "timer"),
        }
    }
}

/// One append-only history record: the instance left `from` for `to`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub sequence: u64,
    pub from: StepId,
    pub to: StepId,
    /// The signal that triggered the transition; automatic hops record
    /// [`AUTO_SIGNAL`](crate::AUTO_SIGNAL)
    pub signal: String,
    pub actor: Actor,
    pub timestamp: DateTime<Utc>,
}

/// A pending timer for the step the instance is waiting on
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmedTimer {
    /// The waiting step the timer guards
    pub step: StepId,
    pub due_at: DateTime<Utc>,
    /// Instance version at which the timer was armed
    pub armed_version: u64,
}

/// A point-in-time copy of an instance
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub id: InstanceId,
    pub procedure: String,
    pub procedure_version: u32,
    pub subject: SubjectId,
    pub status: InstanceStatus,
    pub current_step: StepId,
    pub variables: Variables,
    pub history: Vec<HistoryEntry>,
    pub version: u64,
    pub timer_due_at: Option<DateTime<Utc>>,
    pub abort_reason: Option<String>,
}
