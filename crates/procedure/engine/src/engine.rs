//! Workflow Engine: the main entry point for running procedures
//!
//! The engine coordinates procedure instances. It:
//! 1. Registers procedure definitions
//! 2. Starts instances for a subject, checking the initiator's role
//! 3. Advances instances on signals through the authorization gate
//! 4. Traverses automatic steps (events, gateways, fired boundaries)
//! 5. Arms and cancels step timers as part of every transition
//!
//! Every mutation is a load → apply → compare-and-swap save. Nothing is
//! written unless the whole transition (variables, history, step, timer,
//! status) commits together.

use crate::catalog;
use crate::clock::{Clock, SystemClock};
use crate::gate::{AuthorizationGate, GateDecision};
use crate::instance::Instance;
use crate::roles::{AuthConfig, RoleResolver, VerifiedIdentity};
use crate::store::{DueTimer, InstanceFilter, InstanceStore};
use crate::{DefinitionRegistry, EngineError, EngineResult, ErrorKind};
use chrono::{DateTime, Utc};
use procedure_types::*;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// The Workflow Engine
pub struct WorkflowEngine {
    /// Registry of procedure definitions
    definitions: RwLock<DefinitionRegistry>,
    /// Durable instance records
    store: Arc<dyn InstanceStore>,
    /// Identity → role grant
    resolver: RoleResolver,
    /// Role checks for enabled transitions
    gate: AuthorizationGate,
    clock: Arc<dyn Clock>,
}

impl WorkflowEngine {
    /// Create an engine over `store` using the system clock
    pub fn new(store: Arc<dyn InstanceStore>, auth: AuthConfig) -> Self {
        Self {
            definitions: RwLock::new(DefinitionRegistry::new()),
            store,
            resolver: RoleResolver::new(auth),
            gate: AuthorizationGate::new(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock (tests inject a manual clock)
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn resolver(&self) -> &RoleResolver {
        &self.resolver
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ── Definition Management ────────────────────────────────────────

    fn registry(&self) -> EngineResult<RwLockReadGuard<'_, DefinitionRegistry>> {
        self.definitions
            .read()
            .map_err(|_| EngineError::Configuration("definition registry lock poisoned".into()))
    }

    fn registry_mut(&self) -> EngineResult<RwLockWriteGuard<'_, DefinitionRegistry>> {
        self.definitions
            .write()
            .map_err(|_| EngineError::Configuration("definition registry lock poisoned".into()))
    }

    /// Register a procedure definition
    pub fn register_definition(&self, definition: ProcedureDefinition) -> EngineResult<()> {
        self.registry_mut()?.register(definition)?;
        Ok(())
    }

    /// Register the provider federation and community onboarding procedures
    pub fn register_builtin_procedures(&self) -> EngineResult<usize> {
        let procedures = catalog::builtin_procedures()?;
        let count = procedures.len();
        let mut registry = self.registry_mut()?;
        for procedure in procedures {
            registry.register(procedure)?;
        }
        Ok(count)
    }

    /// Latest version of a procedure
    pub fn definition(&self, name: &str) -> EngineResult<Arc<ProcedureDefinition>> {
        self.registry()?
            .latest(name)
            .ok_or_else(|| EngineError::UnknownProcedure(name.to_string()))
    }

    /// Latest version of every registered procedure
    pub fn list_definitions(&self) -> EngineResult<Vec<Arc<ProcedureDefinition>>> {
        let registry = self.registry()?;
        Ok(registry
            .names()
            .iter()
            .filter_map(|name| registry.latest(name))
            .collect())
    }

    /// The exact definition version an instance runs against
    fn definition_for(&self, instance: &Instance) -> EngineResult<Arc<ProcedureDefinition>> {
        self.registry()?
            .get(instance.procedure(), instance.procedure_version())
            .ok_or_else(|| {
                EngineError::Configuration(format!(
                    "procedure '{}' version {} is not registered",
                    instance.procedure(),
                    instance.procedure_version()
                ))
            })
    }

    // ── Instance Lifecycle ───────────────────────────────────────────

    /// Start an instance of the latest version of `procedure` for `subject`.
    ///
    /// The subject must be of the kind the procedure declares. The instance
    /// leaves its start event immediately and comes to rest on the first task.
    pub async fn start_instance(
        &self,
        procedure: &str,
        subject: Subject,
        initiator: &VerifiedIdentity,
        variables: Variables,
    ) -> EngineResult<InstanceId> {
        let definition = self.definition(procedure)?;

        if subject.kind != definition.subject_kind {
            return Err(EngineError::WrongSubjectKind {
                procedure: procedure.to_string(),
                expected: definition.subject_kind,
                actual: subject.kind,
            });
        }

        if let Some(required) = &definition.initiator_role {
            let grant = self.resolver.resolve(initiator);
            if !grant.contains(required) {
                tracing::warn!(
                    procedure = %procedure,
                    subject = %subject,
                    caller = %initiator.subject,
                    required = %required,
                    "Start rejected: missing initiator role"
                );
                return Err(EngineError::Forbidden {
                    action: format!("starting '{}'", procedure),
                    required: required.clone(),
                });
            }
        }

        let now = self.clock.now();
        let mut instance =
            Instance::new(&definition, subject.id, initiator.actor(), variables, now)?;

        if let Err(err) = self.run_automatic(&definition, &mut instance, now) {
            if err.kind() == ErrorKind::Configuration {
                instance.abort(err.to_string(), now);
                self.store.insert(&instance).await?;
                tracing::error!(
                    instance_id = %instance.id(),
                    procedure = %procedure,
                    error = %err,
                    "Procedure instance aborted on start"
                );
            }
            return Err(err);
        }
        self.arm_timer(&definition, &mut instance);
        self.store.insert(&instance).await?;

        tracing::info!(
            instance_id = %instance.id(),
            procedure = %procedure,
            version = definition.version,
            subject = %instance.subject(),
            step = %instance.current_step(),
            "Procedure instance started"
        );

        Ok(instance.id().clone())
    }

    /// Get a snapshot of an instance
    pub async fn get_instance(&self, id: &InstanceId) -> EngineResult<InstanceSnapshot> {
        self.store
            .load(id)
            .await?
            .map(|i| i.snapshot())
            .ok_or_else(|| EngineError::NotFound(id.clone()))
    }

    /// List instances matching a filter, oldest first
    pub async fn list_instances(&self, filter: &InstanceFilter) -> EngineResult<Vec<InstanceSnapshot>> {
        Ok(self
            .store
            .list(filter)
            .await?
            .iter()
            .map(Instance::snapshot)
            .collect())
    }

    // ── Signal Processing ────────────────────────────────────────────

    /// Advance an instance with an external signal.
    ///
    /// The current step must be a task with an outgoing transition answering
    /// `signal.name`, and `caller` must hold the task's role. On success the
    /// signal's variables are merged, the transition is recorded and the
    /// engine continues through any automatic steps.
    pub async fn advance(
        &self,
        id: &InstanceId,
        signal: Signal,
        caller: &VerifiedIdentity,
    ) -> EngineResult<InstanceSnapshot> {
        let mut instance = self.load_running(id).await?;

        if let Some(expected) = signal.expected_version {
            if expected != instance.version() {
                tracing::debug!(
                    instance_id = %id,
                    expected,
                    actual = instance.version(),
                    "Signal raced a newer transition"
                );
                return Err(EngineError::AlreadyTransitioned(id.clone()));
            }
        }

        let step_id = instance.current_step().clone();
        let invalid = || EngineError::InvalidTransition {
            step: step_id.clone(),
            signal: signal.name.clone(),
        };
        if signal.is_reserved() {
            return Err(invalid());
        }
        if !signal.targets(&step_id) {
            tracing::debug!(
                instance_id = %id,
                addressed = %signal.step,
                current = %step_id,
                "Signal addressed to a step the instance has left"
            );
            return Err(invalid());
        }

        let definition = match self.definition_for(&instance) {
            Ok(definition) => definition,
            Err(err) => return Err(self.abort_on_configuration(instance, err).await),
        };
        let step = match definition.step(&step_id) {
            Some(step) => step,
            None => {
                let err = EngineError::Configuration(format!(
                    "current step '{}' is not in the definition",
                    step_id
                ));
                return Err(self.abort_on_configuration(instance, err).await);
            }
        };
        if !step.kind.is_task() {
            return Err(invalid());
        }
        let transition = definition
            .outgoing(&step_id)
            .iter()
            .find(|t| t.answers(&signal.name))
            .cloned()
            .ok_or_else(invalid)?;

        let grant = self.resolver.resolve(caller);
        if let GateDecision::Deny { required } =
            self.gate.authorize(&definition, &instance, &transition, &grant)?
        {
            tracing::warn!(
                instance_id = %id,
                step = %step_id,
                caller = %caller.subject,
                required = %required,
                "Transition denied"
            );
            return Err(EngineError::Forbidden {
                action: format!("'{}' at step '{}'", signal.name, step_id),
                required,
            });
        }

        let now = self.clock.now();
        let original = instance.clone();
        instance.merge_variables(signal.variables);
        instance.record_transition(transition.to.clone(), signal.name, caller.actor(), now);
        self.commit_transition(&definition, original, instance, now)
            .await
    }

    /// Deliver the expiry of the timer armed at `armed_version`.
    ///
    /// Stale deliveries (the instance moved on, or the timer was already
    /// delivered) fail with [`EngineError::AlreadyTransitioned`].
    pub(crate) async fn deliver_timeout(
        &self,
        id: &InstanceId,
        armed_version: u64,
    ) -> EngineResult<InstanceSnapshot> {
        let mut instance = self.load_running(id).await?;
        let timer = instance
            .timer()
            .cloned()
            .filter(|t| {
                t.armed_version == armed_version
                    && instance.version() == armed_version
                    && &t.step == instance.current_step()
            })
            .ok_or_else(|| EngineError::AlreadyTransitioned(id.clone()))?;

        let now = self.clock.now();
        if timer.due_at > now {
            return Err(EngineError::InvalidTransition {
                step: timer.step,
                signal: TIMEOUT_SIGNAL.to_string(),
            });
        }

        let resolved = self
            .definition_for(&instance)
            .and_then(|definition| {
                let target = timeout_target(&definition, &timer.step)?;
                Ok((definition, target))
            });
        let (definition, target) = match resolved {
            Ok(resolved) => resolved,
            Err(err) => return Err(self.abort_on_configuration(instance, err).await),
        };

        let original = instance.clone();
        instance.record_transition(target, TIMEOUT_SIGNAL, Actor::Timer, now);
        self.commit_transition(&definition, original, instance, now)
            .await
    }

    /// Cancel a running instance. Requires the `admin` role.
    pub async fn cancel_instance(
        &self,
        id: &InstanceId,
        caller: &VerifiedIdentity,
        reason: &str,
    ) -> EngineResult<InstanceSnapshot> {
        let mut instance = self.load_running(id).await?;

        let required = RoleName::admin();
        if !self.resolver.resolve(caller).contains(&required) {
            return Err(EngineError::Forbidden {
                action: "cancelling an instance".to_string(),
                required,
            });
        }

        let now = self.clock.now();
        let expected = instance.bump_version();
        let step = instance.current_step().clone();
        instance.record_transition(step, CANCEL_SIGNAL, caller.actor(), now);
        instance.abort(reason, now);
        self.save(&instance, expected).await?;

        tracing::info!(
            instance_id = %id,
            procedure = %instance.procedure(),
            caller = %caller.subject,
            reason = %reason,
            "Procedure instance cancelled"
        );
        Ok(instance.snapshot())
    }

    /// Timers due now, earliest first
    pub(crate) async fn due_timers(&self, limit: usize) -> EngineResult<Vec<DueTimer>> {
        Ok(self.store.due_timers(self.clock.now(), limit).await?)
    }

    // ── Internals ────────────────────────────────────────────────────

    async fn load_running(&self, id: &InstanceId) -> EngineResult<Instance> {
        let instance = self
            .store
            .load(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(id.clone()))?;
        if !instance.is_running() {
            return Err(EngineError::AlreadyTerminal {
                instance: id.clone(),
                status: instance.status(),
            });
        }
        Ok(instance)
    }

    /// Finish a transition already recorded on `instance` and persist it.
    ///
    /// Configuration errors discard the transition and persist `original`
    /// as Aborted instead.
    async fn commit_transition(
        &self,
        definition: &ProcedureDefinition,
        original: Instance,
        mut instance: Instance,
        now: DateTime<Utc>,
    ) -> EngineResult<InstanceSnapshot> {
        let from = original.current_step().clone();

        if let Err(err) = self.run_automatic(definition, &mut instance, now) {
            return Err(self.abort_on_configuration(original, err).await);
        }

        let expected = instance.bump_version();
        self.arm_timer(definition, &mut instance);
        self.save(&instance, expected).await?;

        tracing::info!(
            instance_id = %instance.id(),
            procedure = %instance.procedure(),
            from = %from,
            to = %instance.current_step(),
            version = instance.version(),
            "Transition applied"
        );
        if instance.status() == InstanceStatus::Completed {
            tracing::info!(
                instance_id = %instance.id(),
                procedure = %instance.procedure(),
                end = %instance.current_step(),
                "Procedure instance completed"
            );
        }

        Ok(instance.snapshot())
    }

    /// Persist `instance` as Aborted when `err` is a configuration error.
    ///
    /// Returns the error the caller should see: `err` itself, or the store
    /// error if the abort could not be saved.
    async fn abort_on_configuration(
        &self,
        mut instance: Instance,
        err: EngineError,
    ) -> EngineError {
        if err.kind() != ErrorKind::Configuration {
            return err;
        }

        let now = self.clock.now();
        let expected = instance.bump_version();
        instance.abort(err.to_string(), now);
        if let Err(save_err) = self.save(&instance, expected).await {
            return save_err;
        }
        tracing::error!(
            instance_id = %instance.id(),
            procedure = %instance.procedure(),
            step = %instance.current_step(),
            error = %err,
            "Procedure instance aborted"
        );
        err
    }

    async fn save(&self, instance: &Instance, expected: u64) -> EngineResult<()> {
        self.store
            .save(instance, expected)
            .await
            .map_err(|err| {
                let err = EngineError::from(err);
                if err.kind() == ErrorKind::Contention {
                    tracing::debug!(
                        instance_id = %instance.id(),
                        "Lost the optimistic race; transition discarded"
                    );
                }
                err
            })
    }

    /// Leave automatic steps until the instance rests on a task, a timer
    /// catch, or an end event.
    fn run_automatic(
        &self,
        definition: &ProcedureDefinition,
        instance: &mut Instance,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let mut hops = 0usize;
        loop {
            let step = definition.step(instance.current_step()).ok_or_else(|| {
                EngineError::Configuration(format!(
                    "step '{}' is not in '{}'",
                    instance.current_step(),
                    definition.name
                ))
            })?;

            if step.kind == StepKind::EndEvent {
                instance.complete(now);
                return Ok(());
            }
            if !step.kind.is_automatic() {
                return Ok(());
            }

            hops += 1;
            if hops > definition.step_count() {
                return Err(EngineError::Configuration(format!(
                    "automatic steps cycle without reaching a task (last at '{}')",
                    step.id
                )));
            }

            let next = select_automatic(definition, step, instance.variables())?;
            instance.record_transition(next, AUTO_SIGNAL, Actor::Engine, now);
        }
    }

    /// Arm the timer of the current step, or clear it
    fn arm_timer(&self, definition: &ProcedureDefinition, instance: &mut Instance) {
        let timer = if instance.is_running() {
            definition
                .timer_for(instance.current_step())
                .map(|(_, timer)| ArmedTimer {
                    step: instance.current_step().clone(),
                    due_at: instance.entered_at() + timer.duration(),
                    armed_version: instance.version(),
                })
        } else {
            None
        };

        if let Some(armed) = &timer {
            tracing::debug!(
                instance_id = %instance.id(),
                step = %armed.step,
                due_at = %armed.due_at,
                "Timer armed"
            );
        }
        instance.set_timer(timer);
    }
}

/// Where an expired timer on `step` sends the instance
fn timeout_target(definition: &ProcedureDefinition, step: &StepId) -> EngineResult<StepId> {
    let (owner, _) = definition.timer_for(step).ok_or_else(|| {
        EngineError::Configuration(format!("step '{}' no longer carries a timer", step))
    })?;
    match owner.kind {
        StepKind::TimerBoundary => Ok(owner.id.clone()),
        StepKind::TimerCatch => definition
            .outgoing(&owner.id)
            .first()
            .map(|t| t.to.clone())
            .ok_or_else(|| {
                EngineError::Configuration(format!("timer '{}' has no way out", owner.id))
            }),
        other => Err(EngineError::Configuration(format!(
            "step '{}' of kind {:?} cannot own a timer",
            owner.id, other
        ))),
    }
}

/// Pick the transition out of an automatic step.
///
/// Gateways take the first unguarded or satisfied transition in declared
/// order, then the default. Other automatic steps have exactly one.
fn select_automatic(
    definition: &ProcedureDefinition,
    step: &Step,
    variables: &Variables,
) -> EngineResult<StepId> {
    let outgoing = definition.outgoing(&step.id);

    if step.kind == StepKind::ExclusiveGateway {
        return outgoing
            .iter()
            .filter(|t| !t.is_default)
            .find(|t| t.guard.as_ref().map_or(true, |g| g.evaluate(variables)))
            .or_else(|| outgoing.iter().find(|t| t.is_default))
            .map(|t| t.to.clone())
            .ok_or_else(|| EngineError::NoMatchingTransition {
                step: step.id.clone(),
            });
    }

    match outgoing {
        [only] => Ok(only.to.clone()),
        _ => Err(EngineError::Configuration(format!(
            "automatic step '{}' needs exactly one outgoing transition",
            step.id
        ))),
    }
}
