//! Definition registry: stores and retrieves procedure definitions
//!
//! Procedure definitions are immutable once registered. To modify,
//! register a new version. The registry keeps all versions so instances
//! keep running against the version they were started with.

use crate::{EngineError, EngineResult};
use procedure_types::{ProcedureDefinition, ProcedureError};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Registry of procedure definitions
#[derive(Clone, Debug, Default)]
pub struct DefinitionRegistry {
    /// name → version → definition
    by_name: HashMap<String, BTreeMap<u32, Arc<ProcedureDefinition>>>,
}

impl DefinitionRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a procedure definition
    ///
    /// Validates the definition before storing. Re-registering an existing
    /// (name, version) pair is rejected.
    pub fn register(&mut self, definition: ProcedureDefinition) -> EngineResult<Arc<ProcedureDefinition>> {
        definition.validate()?;

        let versions = self.by_name.entry(definition.name.clone()).or_default();
        if versions.contains_key(&definition.version) {
            return Err(EngineError::InvalidDefinition(ProcedureError::Validation(
                format!(
                    "Procedure '{}' version {} is already registered",
                    definition.name, definition.version
                ),
            )));
        }

        let name = definition.name.clone();
        let version = definition.version;
        let definition = Arc::new(definition);
        versions.insert(version, Arc::clone(&definition));

        tracing::info!(procedure = %name, version, "Procedure definition registered");
        Ok(definition)
    }

    /// Get one version of a definition
    pub fn get(&self, name: &str, version: u32) -> Option<Arc<ProcedureDefinition>> {
        self.by_name
            .get(name)
            .and_then(|versions| versions.get(&version))
            .cloned()
    }

    /// Get the latest version of a definition by name
    pub fn latest(&self, name: &str) -> Option<Arc<ProcedureDefinition>> {
        self.by_name
            .get(name)
            .and_then(|versions| versions.values().next_back())
            .cloned()
    }

    /// Get all versions of a definition, oldest first
    pub fn versions(&self, name: &str) -> Vec<Arc<ProcedureDefinition>> {
        self.by_name
            .get(name)
            .map(|versions| versions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of all registered procedures, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    /// Total number of registered definitions (all versions)
    pub fn count(&self) -> usize {
        self.by_name.values().map(BTreeMap::len).sum()
    }
}
