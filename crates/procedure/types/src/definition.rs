//! Procedure definitions: the blueprint for approval procedures
//!
//! A ProcedureDefinition is a directed, possibly cyclic graph where:
//! - Steps are tasks, events, gateways and timers
//! - Transitions are edges, stored as an adjacency map keyed by source step
//!
//! Definitions are immutable once validated. To modify, register a new version.

use crate::{ProcedureError, ProcedureResult, Transition};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Longest timer a definition may declare (ten years)
pub const MAX_TIMER_SECS: u64 = 10 * 365 * 24 * 60 * 60;

// ── Identifiers ──────────────────────────────────────────────────────

/// Identifier of a step, unique within one definition
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named entitlement that can gate a step
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoleName(pub String);

impl RoleName {
    pub fn new(role: impl Into<String>) -> Self {
        Self(role.into())
    }

    pub fn site_admin() -> Self {
        Self::new("site_admin")
    }

    pub fn site_tester() -> Self {
        Self::new("site_tester")
    }

    pub fn user_group_mgr() -> Self {
        Self::new("user_group_mgr")
    }

    pub fn sla_mod() -> Self {
        Self::new("sla_mod")
    }

    pub fn admin() -> Self {
        Self::new("admin")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoleName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of entity a procedure instance is bound to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    /// A resource provider being federated
    Provider,
    /// A scientific community being onboarded
    Community,
}

impl std::fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provider => write!(f, "provider"),
            Self::Community => write!(f, "community"),
        }
    }
}

// ── Procedure Definition ─────────────────────────────────────────────

/// A procedure definition: the template every instance of a procedure runs
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcedureDefinition {
    /// Procedure name, e.g. `provider_federation`
    pub name: String,
    /// Version for tracking definition evolution
    #[serde(default = "default_version")]
    pub version: u32,
    /// What this procedure accomplishes
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Which kind of subject instances are bound to
    pub subject_kind: SubjectKind,
    /// Role required to start an instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator_role: Option<RoleName>,
    /// Steps in declaration order
    pub steps: Vec<Step>,
    /// Adjacency map: source step → outgoing transitions in declared order
    #[serde(default)]
    pub transitions: BTreeMap<StepId, Vec<Transition>>,
    /// When this definition was created
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

fn default_version() -> u32 {
    1
}

impl ProcedureDefinition {
    /// Create an empty definition
    pub fn new(name: impl Into<String>, subject_kind: SubjectKind) -> Self {
        Self {
            name: name.into(),
            version: 1,
            description: String::new(),
            subject_kind,
            initiator_role: None,
            steps: Vec::new(),
            transitions: BTreeMap::new(),
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_initiator_role(mut self, role: RoleName) -> Self {
        self.initiator_role = Some(role);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Add a step to the graph
    pub fn add_step(&mut self, step: Step) -> ProcedureResult<()> {
        if self.steps.iter().any(|s| s.id == step.id) {
            return Err(ProcedureError::DuplicateStep(step.id));
        }
        self.steps.push(step);
        Ok(())
    }

    /// Add a transition to the graph
    pub fn add_transition(&mut self, transition: Transition) -> ProcedureResult<()> {
        if self.step(&transition.from).is_none() {
            return Err(ProcedureError::StepNotFound(transition.from));
        }
        if self.step(&transition.to).is_none() {
            return Err(ProcedureError::StepNotFound(transition.to));
        }
        let outgoing = self.transitions.entry(transition.from.clone()).or_default();
        if outgoing.iter().any(|t| t.to == transition.to) {
            return Err(ProcedureError::DuplicateTransition {
                from: transition.from,
                to: transition.to,
            });
        }
        outgoing.push(transition);
        Ok(())
    }

    /// The single start event
    pub fn start_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.kind == StepKind::StartEvent)
    }

    /// All end events
    pub fn end_steps(&self) -> Vec<&Step> {
        self.steps
            .iter()
            .filter(|s| s.kind == StepKind::EndEvent)
            .collect()
    }

    /// Get a step by ID
    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|s| &s.id == id)
    }

    /// Outgoing transitions of a step, in declared order
    pub fn outgoing(&self, id: &StepId) -> &[Transition] {
        self.transitions.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Incoming transitions of a step
    pub fn incoming(&self, id: &StepId) -> Vec<&Transition> {
        self.transitions
            .values()
            .flatten()
            .filter(|t| &t.to == id)
            .collect()
    }

    /// The boundary timer step attached to a task, if any
    pub fn boundary_for(&self, task: &StepId) -> Option<&Step> {
        self.steps.iter().find(|s| {
            s.kind == StepKind::TimerBoundary
                && s.timer.as_ref().and_then(|t| t.attached_to.as_ref()) == Some(task)
        })
    }

    /// The timer that runs while an instance waits on `step`.
    ///
    /// Returns the step owning the timer (the boundary for a task, the step
    /// itself for a timer catch) together with the timer.
    pub fn timer_for(&self, step: &StepId) -> Option<(&Step, &AttachedTimer)> {
        let owner = match self.step(step)? {
            s if s.kind == StepKind::TimerCatch => s,
            s if s.kind.is_task() => self.boundary_for(&s.id)?,
            _ => return None,
        };
        owner.timer.as_ref().map(|timer| (owner, timer))
    }

    /// Validate the definition for structural correctness
    pub fn validate(&self) -> ProcedureResult<()> {
        if self.steps.is_empty() {
            return Err(ProcedureError::Validation(
                "Procedure must have at least one step".into(),
            ));
        }

        let start_count = self
            .steps
            .iter()
            .filter(|s| s.kind == StepKind::StartEvent)
            .count();
        if start_count == 0 {
            return Err(ProcedureError::NoStartStep);
        }
        if start_count > 1 {
            return Err(ProcedureError::Validation(
                "Procedure must have exactly one start event".into(),
            ));
        }
        if self.end_steps().is_empty() {
            return Err(ProcedureError::NoEndStep);
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(&step.id) {
                return Err(ProcedureError::DuplicateStep(step.id.clone()));
            }
        }

        for (source, outgoing) in &self.transitions {
            for transition in outgoing {
                if &transition.from != source {
                    return Err(ProcedureError::Validation(format!(
                        "Transition {} -> {} is filed under step '{}'",
                        transition.from, transition.to, source
                    )));
                }
                if self.step(&transition.from).is_none() {
                    return Err(ProcedureError::StepNotFound(transition.from.clone()));
                }
                if self.step(&transition.to).is_none() {
                    return Err(ProcedureError::StepNotFound(transition.to.clone()));
                }
            }
        }

        for step in &self.steps {
            self.validate_step(step)?;
        }

        if let Some(start) = self.start_step() {
            let reachable = self.reachable_from(&start.id);
            if let Some(island) = self.steps.iter().find(|s| !reachable.contains(&s.id)) {
                return Err(ProcedureError::DisconnectedGraph(island.id.clone()));
            }
        }

        Ok(())
    }

    fn validate_step(&self, step: &Step) -> ProcedureResult<()> {
        let outgoing = self.outgoing(&step.id);
        let invalid = |reason: String| Err(ProcedureError::Validation(reason));

        if step.required_role.is_some() && !step.kind.is_task() {
            return invalid(format!(
                "Step '{}' is a {:?} and cannot require a role",
                step.id, step.kind
            ));
        }

        match (&step.kind, &step.timer) {
            (StepKind::TimerCatch, Some(timer)) if timer.attached_to.is_none() => {}
            (StepKind::TimerCatch, _) => {
                return invalid(format!(
                    "Timer catch '{}' needs an unattached timer",
                    step.id
                ));
            }
            (StepKind::TimerBoundary, Some(timer)) => {
                let Some(host_id) = &timer.attached_to else {
                    return invalid(format!(
                        "Timer boundary '{}' must be attached to a task",
                        step.id
                    ));
                };
                let host = self
                    .step(host_id)
                    .ok_or_else(|| ProcedureError::StepNotFound(host_id.clone()))?;
                if !host.kind.is_task() {
                    return invalid(format!(
                        "Timer boundary '{}' is attached to '{}', which is not a task",
                        step.id, host_id
                    ));
                }
                if self.boundary_for(host_id).map(|b| &b.id) != Some(&step.id) {
                    return invalid(format!("Task '{}' has more than one boundary timer", host_id));
                }
                if !self.incoming(&step.id).is_empty() {
                    return invalid(format!(
                        "Timer boundary '{}' is entered only by its timeout",
                        step.id
                    ));
                }
            }
            (StepKind::TimerBoundary, None) => {
                return invalid(format!("Timer boundary '{}' has no timer", step.id));
            }
            (_, Some(_)) => {
                return invalid(format!(
                    "Step '{}' is a {:?} and cannot carry a timer",
                    step.id, step.kind
                ));
            }
            (_, None) => {}
        }

        if let Some(timer) = &step.timer {
            if timer.duration_secs == 0 || timer.duration_secs > MAX_TIMER_SECS {
                return invalid(format!(
                    "Timer on '{}' must last between 1 and {} seconds",
                    step.id, MAX_TIMER_SECS
                ));
            }
        }

        if step.kind != StepKind::ExclusiveGateway
            && outgoing.iter().any(|t| t.guard.is_some() || t.is_default)
        {
            return invalid(format!(
                "Only gateways may have guarded or default transitions ('{}')",
                step.id
            ));
        }

        match step.kind {
            StepKind::EndEvent if !outgoing.is_empty() => {
                invalid(format!("End event '{}' cannot have outgoing transitions", step.id))
            }
            StepKind::ExclusiveGateway => {
                if outgoing.is_empty() {
                    return invalid(format!("Gateway '{}' has no outgoing transitions", step.id));
                }
                if outgoing.iter().filter(|t| t.is_default).count() > 1 {
                    return invalid(format!(
                        "Gateway '{}' has more than one default transition",
                        step.id
                    ));
                }
                if outgoing.iter().any(|t| t.signal.is_some()) {
                    return invalid(format!(
                        "Gateway '{}' is advanced automatically and cannot name signals",
                        step.id
                    ));
                }
                Ok(())
            }
            StepKind::StartEvent
            | StepKind::IntermediateEvent
            | StepKind::TimerBoundary
            | StepKind::TimerCatch
                if outgoing.len() != 1 =>
            {
                invalid(format!(
                    "Step '{}' must have exactly one outgoing transition",
                    step.id
                ))
            }
            StepKind::UserTask | StepKind::AutomatedTask => {
                if outgoing.is_empty() {
                    return invalid(format!("Task '{}' has no outgoing transitions", step.id));
                }
                let mut signals = HashSet::new();
                for transition in outgoing {
                    if !signals.insert(transition.signal_name()) {
                        return invalid(format!(
                            "Task '{}' answers signal '{}' more than once",
                            step.id,
                            transition.signal_name()
                        ));
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Find all steps reachable from a given step.
    ///
    /// A boundary timer counts as reachable from the task it is attached to.
    fn reachable_from(&self, start: &StepId) -> HashSet<StepId> {
        let mut visited = HashSet::new();
        let mut queue = vec![start.clone()];

        while let Some(current) = queue.pop() {
            if visited.insert(current.clone()) {
                for transition in self.outgoing(&current) {
                    if !visited.contains(&transition.to) {
                        queue.push(transition.to.clone());
                    }
                }
                if let Some(boundary) = self.boundary_for(&current) {
                    queue.push(boundary.id.clone());
                }
            }
        }

        visited
    }

    /// Total number of steps
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Total number of transitions
    pub fn transition_count(&self) -> usize {
        self.transitions.values().map(Vec::len).sum()
    }
}

// ── Step ─────────────────────────────────────────────────────────────

/// A step in the procedure graph
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Step {
    /// Unique identifier within this definition
    pub id: StepId,
    /// Human-readable name
    pub name: String,
    /// What kind of node this is
    pub kind: StepKind,
    /// Role required to complete this step (tasks only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_role: Option<RoleName>,
    /// Timer carried by boundary and catch steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer: Option<AttachedTimer>,
    /// Description shown to the people working the task
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl Step {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: StepId::new(id),
            name: name.into(),
            kind,
            required_role: None,
            timer: None,
            description: String::new(),
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, "Start", StepKind::StartEvent)
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, "End", StepKind::EndEvent)
    }

    pub fn user_task(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, name, StepKind::UserTask)
    }

    pub fn automated_task(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, name, StepKind::AutomatedTask)
    }

    pub fn gateway(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, name, StepKind::ExclusiveGateway)
    }

    pub fn intermediate(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, name, StepKind::IntermediateEvent)
    }

    /// A step that waits for `duration_secs` and then moves on
    pub fn timer_catch(id: impl Into<String>, name: impl Into<String>, duration_secs: u64) -> Self {
        let mut step = Self::new(id, name, StepKind::TimerCatch);
        step.timer = Some(AttachedTimer::new(duration_secs));
        step
    }

    /// A timer that interrupts `task` after `duration_secs`
    pub fn timer_boundary(
        id: impl Into<String>,
        name: impl Into<String>,
        task: impl Into<String>,
        duration_secs: u64,
    ) -> Self {
        let mut step = Self::new(id, name, StepKind::TimerBoundary);
        step.timer = Some(AttachedTimer::new(duration_secs).attached_to(StepId::new(task)));
        step
    }

    pub fn with_required_role(mut self, role: RoleName) -> Self {
        self.required_role = Some(role);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// The kind of a procedure step
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepKind {
    /// Entry point; left immediately
    StartEvent,
    /// Work done by a person holding the required role
    UserTask,
    /// Work reported by an automated system
    AutomatedTask,
    /// A pass-through event
    IntermediateEvent,
    /// Timer attached to a task; entered only when the task times out
    TimerBoundary,
    /// Waits until its timer expires
    TimerCatch,
    /// Chooses one outgoing transition by evaluating guards
    ExclusiveGateway,
    /// Terminal step; reaching it completes the instance
    EndEvent,
}

impl StepKind {
    /// Tasks are completed by explicit signals
    pub fn is_task(&self) -> bool {
        matches!(self, Self::UserTask | Self::AutomatedTask)
    }

    /// Steps the engine leaves on its own as soon as they are entered
    pub fn is_automatic(&self) -> bool {
        matches!(
            self,
            Self::StartEvent | Self::IntermediateEvent | Self::TimerBoundary | Self::ExclusiveGateway
        )
    }
}

/// A timer carried by a boundary or catch step
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedTimer {
    /// How long after entering the guarded step the timer fires
    pub duration_secs: u64,
    /// The task this timer interrupts (boundary timers only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_to: Option<StepId>,
}

impl AttachedTimer {
    pub fn new(duration_secs: u64) -> Self {
        Self {
            duration_secs,
            attached_to: None,
        }
    }

    pub fn attached_to(mut self, task: StepId) -> Self {
        self.attached_to = Some(task);
        self
    }

    pub fn duration(&self) -> Duration {
        let secs = self.duration_secs.min(MAX_TIMER_SECS);
        Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
    }
}
