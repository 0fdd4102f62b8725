//! PostgreSQL adapter for the instance store.
//!
//! The full instance is kept as a JSONB body. Columns duplicated out of the
//! body carry the constraints: `version` for compare-and-swap, a partial
//! unique index for one Running instance per (procedure, subject), and an
//! indexed `timer_due_at` that serves as the durable timer schedule.

use super::{check_next_version, DueTimer, InstanceFilter, InstanceStore, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crate::Instance;
use procedure_types::InstanceId;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

const ONE_RUNNING_INDEX: &str = "procedure_instances_one_running";

/// PostgreSQL-backed instance store.
#[derive(Clone)]
pub struct PostgresInstanceStore {
    pool: PgPool,
}

impl PostgresInstanceStore {
    /// Connect to PostgreSQL and initialize required schema.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    /// Connect with explicit pool parameters.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to connect postgres: {e}")))?;
        Self::from_pool(pool).await
    }

    /// Create adapter from an existing pool.
    pub async fn from_pool(pool: PgPool) -> StoreResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> StoreResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS procedure_instances (
                instance_id TEXT PRIMARY KEY,
                procedure TEXT NOT NULL,
                procedure_version INTEGER NOT NULL,
                subject_id TEXT NOT NULL,
                status TEXT NOT NULL,
                version BIGINT NOT NULL,
                timer_due_at TIMESTAMPTZ,
                body JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS procedure_instances_one_running
                ON procedure_instances (procedure, subject_id)
             WHERE status = 'running'
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS procedure_instances_timer_due
                ON procedure_instances (timer_due_at)
             WHERE timer_due_at IS NOT NULL
            "#,
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }

    async fn stored_version(&self, id: &InstanceId) -> StoreResult<Option<u64>> {
        let row = sqlx::query("SELECT version FROM procedure_instances WHERE instance_id = $1")
            .bind(id.0.clone())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        row.map(|r| {
            r.try_get::<i64, _>("version")
                .map_err(|e| StoreError::Backend(e.to_string()))
                .and_then(from_i64)
        })
        .transpose()
    }
}

#[async_trait]
impl InstanceStore for PostgresInstanceStore {
    async fn insert(&self, instance: &Instance) -> StoreResult<()> {
        let body = to_body(instance)?;
        sqlx::query(
            r#"
            INSERT INTO procedure_instances
                (instance_id, procedure, procedure_version, subject_id, status, version,
                 timer_due_at, body, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(instance.id().0.clone())
        .bind(instance.procedure().to_string())
        .bind(i64::from(instance.procedure_version()))
        .bind(instance.subject().0.clone())
        .bind(instance.status().as_str())
        .bind(to_i64(instance.version())?)
        .bind(timer_due_at(instance))
        .bind(body)
        .bind(instance.created_at())
        .bind(instance.updated_at())
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, instance))?;
        Ok(())
    }

    async fn load(&self, id: &InstanceId) -> StoreResult<Option<Instance>> {
        let row = sqlx::query("SELECT body FROM procedure_instances WHERE instance_id = $1")
            .bind(id.0.clone())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        row.map(row_to_instance).transpose()
    }

    async fn save(&self, instance: &Instance, expected_version: u64) -> StoreResult<()> {
        check_next_version(instance, expected_version)?;
        let body = to_body(instance)?;

        let result = sqlx::query(
            r#"
            UPDATE procedure_instances
               SET status = $1,
                   version = $2,
                   timer_due_at = $3,
                   body = $4,
                   updated_at = $5
             WHERE instance_id = $6
               AND version = $7
            "#,
        )
        .bind(instance.status().as_str())
        .bind(to_i64(instance.version())?)
        .bind(timer_due_at(instance))
        .bind(body)
        .bind(instance.updated_at())
        .bind(instance.id().0.clone())
        .bind(to_i64(expected_version)?)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return match self.stored_version(instance.id()).await? {
                Some(actual) => Err(StoreError::VersionConflict {
                    id: instance.id().clone(),
                    expected: expected_version,
                    actual,
                }),
                None => Err(StoreError::NotFound(instance.id().clone())),
            };
        }
        Ok(())
    }

    async fn list(&self, filter: &InstanceFilter) -> StoreResult<Vec<Instance>> {
        let limit = if filter.limit == 0 {
            None
        } else {
            Some(to_i64(filter.limit as u64)?)
        };
        let rows = sqlx::query(
            r#"
            SELECT body
              FROM procedure_instances
             WHERE ($1::TEXT IS NULL OR procedure = $1)
               AND ($2::TEXT IS NULL OR subject_id = $2)
               AND ($3::TEXT IS NULL OR status = $3)
             ORDER BY created_at ASC, instance_id ASC
             LIMIT $4
            "#,
        )
        .bind(filter.procedure.clone())
        .bind(filter.subject.as_ref().map(|s| s.0.clone()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        rows.into_iter().map(row_to_instance).collect()
    }

    async fn due_timers(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<DueTimer>> {
        let rows = sqlx::query(
            r#"
            SELECT body
              FROM procedure_instances
             WHERE status = 'running'
               AND timer_due_at IS NOT NULL
               AND timer_due_at <= $1
             ORDER BY timer_due_at ASC, instance_id ASC
             LIMIT $2
            "#,
        )
        .bind(now)
        .bind(to_i64(limit as u64)?)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut due = Vec::with_capacity(rows.len());
        for row in rows {
            let instance = row_to_instance(row)?;
            if let Some(timer) = instance.timer() {
                due.push(DueTimer {
                    instance_id: instance.id().clone(),
                    step: timer.step.clone(),
                    due_at: timer.due_at,
                    armed_version: timer.armed_version,
                });
            }
        }
        Ok(due)
    }
}

fn timer_due_at(instance: &Instance) -> Option<DateTime<Utc>> {
    instance
        .timer()
        .filter(|_| instance.is_running())
        .map(|t| t.due_at)
}

fn to_body(instance: &Instance) -> StoreResult<serde_json::Value> {
    serde_json::to_value(instance).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn row_to_instance(row: PgRow) -> StoreResult<Instance> {
    let body: serde_json::Value = row
        .try_get("body")
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    serde_json::from_value(body).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn map_insert_error(err: sqlx::Error, instance: &Instance) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            if db_err.constraint() == Some(ONE_RUNNING_INDEX) {
                return StoreError::DuplicateActive {
                    procedure: instance.procedure().to_string(),
                    subject: instance.subject().clone(),
                };
            }
            return StoreError::Backend(format!(
                "instance {} already exists",
                instance.id()
            ));
        }
    }
    StoreError::Backend(err.to_string())
}

fn to_i64(value: u64) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| StoreError::Backend("value too large for BIGINT".to_string()))
}

fn from_i64(value: i64) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| StoreError::Backend("negative version".to_string()))
}
