//! Loading procedure definitions from a directory of JSON files

use crate::error::{DaemonError, DaemonResult};
use procedure_engine::WorkflowEngine;
use procedure_types::ProcedureDefinition;
use std::path::{Path, PathBuf};

/// Read every `*.json` file in `dir` as a [`ProcedureDefinition`].
///
/// Files are read in name order so registration is reproducible. Anything
/// without a `.json` extension is ignored.
pub fn read_definitions(dir: &Path) -> DaemonResult<Vec<(PathBuf, ProcedureDefinition)>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            let raw = std::fs::read_to_string(&path)?;
            let definition: ProcedureDefinition =
                serde_json::from_str(&raw).map_err(|e| DaemonError::Definition {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            Ok((path, definition))
        })
        .collect()
}

/// Validate and register every definition in `dir`. Returns how many were
/// registered.
pub fn load_definitions(engine: &WorkflowEngine, dir: &Path) -> DaemonResult<usize> {
    let definitions = read_definitions(dir)?;
    let count = definitions.len();

    for (path, definition) in definitions {
        let name = definition.name.clone();
        engine
            .register_definition(definition)
            .map_err(|e| DaemonError::Definition {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        tracing::debug!(procedure = %name, path = %path.display(), "Loaded definition file");
    }

    tracing::info!(dir = %dir.display(), count, "Procedure definitions loaded");
    Ok(count)
}
