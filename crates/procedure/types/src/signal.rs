//! Signals: the stimuli that advance an instance

use crate::{StepId, Value, Variables};
use serde::{Deserialize, Serialize};

/// Signal answered by task transitions that do not name one
pub const COMPLETE_SIGNAL: &str = "complete";

/// Synthetic signal delivered when a timer expires
pub const TIMEOUT_SIGNAL: &str = "__timeout__";

/// Recorded in history when the engine leaves an automatic step
pub const AUTO_SIGNAL: &str = "__auto__";

/// Recorded in history when an operator cancels an instance
pub const CANCEL_SIGNAL: &str = "__cancel__";

/// A request to advance an instance.
///
/// A signal is addressed to the task it acts on. Once the instance has left
/// that task (a timer fired, another caller won) the signal is rejected
/// instead of being applied to whatever step the instance rests on now.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// The task this signal completes or answers
    pub step: StepId,
    pub name: String,
    /// Variable updates merged into the instance when the signal is accepted
    #[serde(default)]
    pub variables: Variables,
    /// Instance version the caller observed; a mismatch is a lost race
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
}

impl Signal {
    pub fn new(step: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            step: StepId::new(step),
            name: name.into(),
            variables: Variables::new(),
            expected_version: None,
        }
    }

    /// The default completion signal for `step`
    pub fn complete(step: impl Into<String>) -> Self {
        Self::new(step, COMPLETE_SIGNAL)
    }

    /// Is this signal addressed to `step`?
    pub fn targets(&self, step: &StepId) -> bool {
        &self.step == step
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables.extend(variables);
        self
    }

    pub fn expecting_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }

    /// Engine-internal names that callers may never send
    pub fn is_reserved(&self) -> bool {
        is_reserved_signal(&self.name)
    }
}

/// Is `name` one of the engine's internal signal names?
pub fn is_reserved_signal(name: &str) -> bool {
    matches!(name, TIMEOUT_SIGNAL | AUTO_SIGNAL | CANCEL_SIGNAL)
}
