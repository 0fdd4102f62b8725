//! The mutable instance record
//!
//! Only the engine changes an instance. Every mutator is crate-private and is
//! applied to a freshly loaded copy that is then saved back with an
//! optimistic version check, so a rejected transition never leaves a trace.
//! Outside this crate an instance can be read and stored, never moved:
//!
//! ```compile_fail
//! use procedure_engine::Instance;
//! use procedure_types::{Actor, StepId};
//!
//! fn skip_ahead(instance: &mut Instance) {
//!     instance.record_transition(StepId::new("federated"), "complete", Actor::Engine, chrono::Utc::now());
//! }
//! ```

use chrono::{DateTime, Utc};
use procedure_types::{
    Actor, ArmedTimer, HistoryEntry, InstanceId, InstanceSnapshot, InstanceStatus,
    ProcedureDefinition, ProcedureError, ProcedureResult, StepId, SubjectId, SubjectKind, Value,
    Variables,
};
use serde::{Deserialize, Serialize};

/// A running (or finished) execution of a procedure definition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    id: InstanceId,
    procedure: String,
    procedure_version: u32,
    subject: SubjectId,
    subject_kind: SubjectKind,
    status: InstanceStatus,
    current_step: StepId,
    /// When the current step was entered
    entered_at: DateTime<Utc>,
    variables: Variables,
    history: Vec<HistoryEntry>,
    timer: Option<ArmedTimer>,
    version: u64,
    initiator: Actor,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    abort_reason: Option<String>,
}

impl Instance {
    /// Create an instance positioned on the definition's start event
    pub(crate) fn new(
        definition: &ProcedureDefinition,
        subject: SubjectId,
        initiator: Actor,
        variables: Variables,
        now: DateTime<Utc>,
    ) -> ProcedureResult<Self> {
        let start = definition.start_step().ok_or(ProcedureError::NoStartStep)?;
        Ok(Self {
            id: InstanceId::generate(),
            procedure: definition.name.clone(),
            procedure_version: definition.version,
            subject,
            subject_kind: definition.subject_kind,
            status: InstanceStatus::Running,
            current_step: start.id.clone(),
            entered_at: now,
            variables,
            history: Vec::new(),
            timer: None,
            version: 0,
            initiator,
            created_at: now,
            updated_at: now,
            completed_at: None,
            abort_reason: None,
        })
    }

    // ── Accessors ──

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    pub fn procedure_version(&self) -> u32 {
        self.procedure_version
    }

    pub fn subject(&self) -> &SubjectId {
        &self.subject
    }

    pub fn subject_kind(&self) -> SubjectKind {
        self.subject_kind
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    pub fn current_step(&self) -> &StepId {
        &self.current_step
    }

    pub fn entered_at(&self) -> DateTime<Utc> {
        self.entered_at
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn timer(&self) -> Option<&ArmedTimer> {
        self.timer.as_ref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn initiator(&self) -> &Actor {
        &self.initiator
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.as_deref()
    }

    /// Number of history records leaving `step`
    pub fn exits_from(&self, step: &StepId) -> usize {
        self.history.iter().filter(|h| &h.from == step).count()
    }

    // ── Engine mutators ──

    /// Merge variable updates, overwriting existing names
    pub(crate) fn merge_variables(&mut self, updates: Variables) {
        self.variables.extend(updates);
    }

    /// Move to `to`, appending a history record
    pub(crate) fn record_transition(
        &mut self,
        to: StepId,
        signal: impl Into<String>,
        actor: Actor,
        now: DateTime<Utc>,
    ) {
        let from = std::mem::replace(&mut self.current_step, to.clone());
        self.history.push(HistoryEntry {
            sequence: self.history.len() as u64 + 1,
            from,
            to,
            signal: signal.into(),
            actor,
            timestamp: now,
        });
        self.entered_at = now;
        self.updated_at = now;
    }

    /// Replace (or clear) the pending timer
    pub(crate) fn set_timer(&mut self, timer: Option<ArmedTimer>) {
        self.timer = timer;
    }

    /// Advance the version ahead of an optimistic save, returning the
    /// version the save must expect
    pub(crate) fn bump_version(&mut self) -> u64 {
        let expected = self.version;
        self.version += 1;
        expected
    }

    pub(crate) fn complete(&mut self, now: DateTime<Utc>) {
        self.status = InstanceStatus::Completed;
        self.timer = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub(crate) fn abort(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = InstanceStatus::Aborted;
        self.timer = None;
        self.abort_reason = Some(reason.into());
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Read-only view handed to callers
    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            id: self.id.clone(),
            procedure: self.procedure.clone(),
            procedure_version: self.procedure_version,
            subject: self.subject.clone(),
            status: self.status,
            current_step: self.current_step.clone(),
            variables: self.variables.clone(),
            history: self.history.clone(),
            version: self.version,
            timer_due_at: self.timer.as_ref().map(|t| t.due_at),
            abort_reason: self.abort_reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procedure_types::{Step, Transition};

    fn make_definition() -> ProcedureDefinition {
        let mut def = ProcedureDefinition::new("tiny", SubjectKind::Provider).with_version(3);
        def.add_step(Step::start("start")).unwrap();
        def.add_step(Step::user_task("task", "Task")).unwrap();
        def.add_step(Step::end("end")).unwrap();
        def.add_transition(Transition::new("start", "task")).unwrap();
        def.add_transition(Transition::new("task", "end")).unwrap();
        def
    }

    fn make_instance() -> Instance {
        Instance::new(
            &make_definition(),
            SubjectId::new("provider-1"),
            Actor::identity("alice", "https://idp.example"),
            Variables::new(),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_new_instance_starts_at_start_event() {
        let inst = make_instance();
        assert_eq!(inst.current_step(), &StepId::new("start"));
        assert_eq!(inst.status(), InstanceStatus::Running);
        assert_eq!(inst.procedure_version(), 3);
        assert_eq!(inst.subject_kind(), SubjectKind::Provider);
        assert_eq!(inst.version(), 0);
        assert!(inst.history().is_empty());
    }

    #[test]
    fn test_record_transition_appends_history() {
        let mut inst = make_instance();
        let now = Utc::now();
        inst.record_transition(StepId::new("task"), "start", Actor::Engine, now);
        inst.record_transition(
            StepId::new("end"),
            "complete",
            Actor::identity("bob", "https://idp.example"),
            now,
        );

        assert_eq!(inst.current_step(), &StepId::new("end"));
        assert_eq!(inst.history().len(), 2);
        assert_eq!(inst.history()[0].sequence, 1);
        assert_eq!(inst.history()[1].from, StepId::new("task"));
        assert_eq!(inst.exits_from(&StepId::new("task")), 1);
    }

    #[test]
    fn test_merge_overwrites() {
        let mut inst = make_instance();
        let mut first = Variables::new();
        first.insert("ok".into(), Value::Bool(false));
        inst.merge_variables(first);
        let mut second = Variables::new();
        second.insert("ok".into(), Value::Bool(true));
        inst.merge_variables(second);
        assert_eq!(inst.variable("ok"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_terminal_states_clear_timer() {
        let mut inst = make_instance();
        inst.set_timer(Some(ArmedTimer {
            step: StepId::new("task"),
            due_at: Utc::now(),
            armed_version: 1,
        }));
        inst.abort("broken definition", Utc::now());
        assert!(inst.status().is_terminal());
        assert!(inst.timer().is_none());
        assert_eq!(inst.abort_reason(), Some("broken definition"));
    }

    #[test]
    fn test_bump_version() {
        let mut inst = make_instance();
        assert_eq!(inst.bump_version(), 0);
        assert_eq!(inst.version(), 1);
    }

    #[test]
    fn test_snapshot_round_trips_through_json() {
        let mut inst = make_instance();
        inst.record_transition(StepId::new("task"), "__auto__", Actor::Engine, Utc::now());
        let json = serde_json::to_string(&inst).unwrap();
        let back: Instance = serde_json::from_str(&json).unwrap();
        assert_eq!(back.snapshot(), inst.snapshot());
    }
}
