//! Runtime setup and lifecycle management

use crate::config::{DaemonConfig, StorageConfig};
use crate::definitions::load_definitions;
use crate::error::{DaemonError, DaemonResult};
use procedure_engine::{InMemoryInstanceStore, InstanceStore, TimerManager, WorkflowEngine};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

/// The engine plus its timer manager, ready to run
pub struct Runtime {
    engine: Arc<WorkflowEngine>,
    timers: Arc<TimerManager>,
    wake_rx: mpsc::Receiver<()>,
}

impl Runtime {
    /// Build the store, engine and timer manager from configuration
    pub async fn build(config: &DaemonConfig) -> DaemonResult<Self> {
        let store = build_store(&config.storage).await?;
        let engine = WorkflowEngine::new(store, config.auth.clone());

        if config.procedures.builtin {
            let count = engine.register_builtin_procedures()?;
            tracing::info!(count, "Built-in procedures registered");
        }
        if let Some(dir) = &config.procedures.definition_dir {
            load_definitions(&engine, dir)?;
        }
        if config.auth.trusted_issuers.is_empty() {
            tracing::warn!("No trusted issuers configured; every caller resolves to no roles");
        }

        let engine = Arc::new(engine);
        let (timers, wake_rx) = TimerManager::new(engine.clone(), config.timers.clone());

        Ok(Self {
            engine,
            timers,
            wake_rx,
        })
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    pub fn timers(&self) -> &Arc<TimerManager> {
        &self.timers
    }

    /// Run the timer manager until `shutdown` resolves, then stop it
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> DaemonResult<()> {
        let timers = self.timers.clone();
        let handle = tokio::spawn(timers.start(self.wake_rx));

        // Deliver anything that fell due while the daemon was down
        self.timers.trigger_poll().await;

        shutdown.await;
        tracing::info!("Procedure daemon shutting down");

        self.timers.stop().await;
        handle
            .await
            .map_err(|e| DaemonError::Config(format!("timer manager task failed: {e}")))?;

        Ok(())
    }
}

async fn build_store(config: &StorageConfig) -> DaemonResult<Arc<dyn InstanceStore>> {
    match config {
        StorageConfig::Memory => {
            tracing::info!("Using in-memory instance store");
            Ok(Arc::new(InMemoryInstanceStore::new()))
        }
        #[cfg(feature = "postgres")]
        StorageConfig::Postgres {
            url,
            max_connections,
            connect_timeout_secs,
        } => {
            let store = procedure_engine::PostgresInstanceStore::connect_with_options(
                url,
                *max_connections,
                *connect_timeout_secs,
            )
            .await?;
            tracing::info!(max_connections, "Using PostgreSQL instance store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        StorageConfig::Postgres { .. } => Err(DaemonError::Config(
            "postgres storage requires building with the `postgres` feature".into(),
        )),
    }
}
