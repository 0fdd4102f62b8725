//! In-memory reference implementation of [`InstanceStore`].
//!
//! This adapter is deterministic and test-friendly. Production deployments
//! should use a transactional backend (e.g. PostgreSQL).

use super::{check_next_version, DueTimer, InstanceFilter, InstanceStore, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crate::Instance;
use procedure_types::InstanceId;
use std::collections::HashMap;
use std::sync::RwLock;

/// In-memory instance store.
#[derive(Default)]
pub struct InMemoryInstanceStore {
    instances: RwLock<HashMap<InstanceId, Instance>>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> StoreError {
    StoreError::Backend("instances lock poisoned".to_string())
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn insert(&self, instance: &Instance) -> StoreResult<()> {
        let mut guard = self.instances.write().map_err(|_| poisoned())?;

        if guard.contains_key(instance.id()) {
            return Err(StoreError::Backend(format!(
                "instance {} already exists",
                instance.id()
            )));
        }
        if instance.is_running()
            && guard.values().any(|existing| {
                existing.is_running()
                    && existing.procedure() == instance.procedure()
                    && existing.subject() == instance.subject()
            })
        {
            return Err(StoreError::DuplicateActive {
                procedure: instance.procedure().to_string(),
                subject: instance.subject().clone(),
            });
        }

        guard.insert(instance.id().clone(), instance.clone());
        Ok(())
    }

    async fn load(&self, id: &InstanceId) -> StoreResult<Option<Instance>> {
        let guard = self.instances.read().map_err(|_| poisoned())?;
        Ok(guard.get(id).cloned())
    }

    async fn save(&self, instance: &Instance, expected_version: u64) -> StoreResult<()> {
        check_next_version(instance, expected_version)?;
        let mut guard = self.instances.write().map_err(|_| poisoned())?;
        let stored = guard
            .get_mut(instance.id())
            .ok_or_else(|| StoreError::NotFound(instance.id().clone()))?;

        if stored.version() != expected_version {
            return Err(StoreError::VersionConflict {
                id: instance.id().clone(),
                expected: expected_version,
                actual: stored.version(),
            });
        }

        *stored = instance.clone();
        Ok(())
    }

    async fn list(&self, filter: &InstanceFilter) -> StoreResult<Vec<Instance>> {
        let guard = self.instances.read().map_err(|_| poisoned())?;
        let mut values = guard
            .values()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        if filter.limit > 0 {
            values.truncate(filter.limit);
        }
        Ok(values)
    }

    async fn due_timers(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<DueTimer>> {
        let guard = self.instances.read().map_err(|_| poisoned())?;
        let mut due = guard
            .values()
            .filter(|i| i.is_running())
            .filter_map(|i| {
                i.timer()
                    .filter(|t| t.due_at <= now)
                    .map(|t| DueTimer {
                        instance_id: i.id().clone(),
                        step: t.step.clone(),
                        due_at: t.due_at,
                        armed_version: t.armed_version,
                    })
            })
            .collect::<Vec<_>>();
        due.sort_by(|a, b| {
            a.due_at
                .cmp(&b.due_at)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        due.truncate(limit);
        Ok(due)
    }
}
