//! Authorization gate: may this grant take this transition right now?
//!
//! The gate does NOT produce side effects. It is a pure decision over the
//! definition, the instance's current step and the caller's grant.

use crate::{EngineError, EngineResult, Instance, RoleGrant};
use procedure_types::{ProcedureDefinition, RoleName, Transition};

/// Outcome of an authorization check
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Deny { required: RoleName },
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Decides whether a grant may take an enabled transition
#[derive(Clone, Debug, Default)]
pub struct AuthorizationGate;

impl AuthorizationGate {
    pub fn new() -> Self {
        Self
    }

    /// Authorize `transition` for `grant`.
    ///
    /// Only transitions leaving the instance's current step are enabled;
    /// anything else is [`EngineError::InvalidTransition`], never a denial.
    pub fn authorize(
        &self,
        definition: &ProcedureDefinition,
        instance: &Instance,
        transition: &Transition,
        grant: &RoleGrant,
    ) -> EngineResult<GateDecision> {
        let enabled = &transition.from == instance.current_step()
            && definition
                .outgoing(instance.current_step())
                .iter()
                .any(|t| t == transition);
        if !enabled {
            return Err(EngineError::InvalidTransition {
                step: instance.current_step().clone(),
                signal: transition.signal_name().to_string(),
            });
        }

        let required = definition
            .step(&transition.from)
            .and_then(|step| step.required_role.as_ref());
        Ok(match required {
            Some(role) if !grant.contains(role) => GateDecision::Deny {
                required: role.clone(),
            },
            _ => GateDecision::Allow,
        })
    }
}
