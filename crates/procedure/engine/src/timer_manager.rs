//! Timer manager: delivers expired step timers to the engine
//!
//! The durable schedule is the instance store itself, so nothing is lost
//! across restarts: every poll asks the store for armed timers that are due
//! and submits each one through the engine's ordinary compare-and-swap path.
//! A timer that loses a race to a concurrent transition is simply dropped;
//! a timer whose delivery failed on storage is retried with backoff until
//! it lands.

use crate::config::TimerConfig;
use crate::{EngineResult, ErrorKind, WorkflowEngine};
use chrono::{DateTime, Utc};
use procedure_types::InstanceId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Outcome counts for one poll
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Timers that moved their instance
    pub delivered: usize,
    /// Timers that lost to a concurrent transition or were already handled
    pub superseded: usize,
    /// Timers whose delivery hit a broken definition (instance aborted)
    pub aborted: usize,
    /// Deliveries that failed and are scheduled for retry
    pub failed: usize,
    /// Timers skipped because their retry backoff has not elapsed
    pub deferred: usize,
}

#[derive(Debug, Clone)]
struct RetryState {
    armed_version: u64,
    attempts: u32,
    next_attempt_at: DateTime<Utc>,
}

/// Background task that polls for due timers
pub struct TimerManager {
    engine: Arc<WorkflowEngine>,
    config: TimerConfig,
    retries: Mutex<HashMap<InstanceId, RetryState>>,
    running: Arc<RwLock<bool>>,
    wake_tx: mpsc::Sender<()>,
}

impl TimerManager {
    /// Create a new timer manager
    pub fn new(
        engine: Arc<WorkflowEngine>,
        config: TimerConfig,
    ) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (wake_tx, wake_rx) = mpsc::channel(10);

        let manager = Arc::new(Self {
            engine,
            config,
            retries: Mutex::new(HashMap::new()),
            running: Arc::new(RwLock::new(false)),
            wake_tx,
        });

        (manager, wake_rx)
    }

    /// Trigger an immediate poll
    pub async fn trigger_poll(&self) {
        let _ = self.wake_tx.send(()).await;
    }

    /// Run the polling loop until [`TimerManager::stop`] is called
    pub async fn start(self: Arc<Self>, mut wake_rx: mpsc::Receiver<()>) {
        {
            let mut running = self.running.write().await;
            *running = true;
        }

        tracing::info!(
            poll_interval_secs = self.config.poll_interval_secs,
            batch_size = self.config.batch_size,
            "Timer manager started"
        );

        let mut ticker = interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                received = wake_rx.recv() => {
                    if received.is_none() {
                        break;
                    }
                }
            }

            if !*self.running.read().await {
                break;
            }

            if let Err(e) = self.poll_once().await {
                tracing::warn!(error = %e, "Timer poll failed");
            }
        }

        tracing::info!("Timer manager stopped");
    }

    /// Stop the polling loop
    pub async fn stop(&self) {
        {
            let mut running = self.running.write().await;
            *running = false;
        }
        self.trigger_poll().await;
    }

    /// Is the polling loop running?
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Deliver every timer that is due now
    pub async fn poll_once(&self) -> EngineResult<PollReport> {
        let due = self.engine.due_timers(self.config.batch_size).await?;
        let now = self.engine.now();
        let mut report = PollReport::default();
        let mut retries = self.retries.lock().await;

        if due.len() < self.config.batch_size {
            let due_ids: HashSet<&InstanceId> = due.iter().map(|t| &t.instance_id).collect();
            retries.retain(|id, _| due_ids.contains(id));
        }

        for timer in &due {
            if let Some(state) = retries.get(&timer.instance_id) {
                if state.armed_version == timer.armed_version && state.next_attempt_at > now {
                    report.deferred += 1;
                    continue;
                }
            }

            match self
                .engine
                .deliver_timeout(&timer.instance_id, timer.armed_version)
                .await
            {
                Ok(snapshot) => {
                    retries.remove(&timer.instance_id);
                    report.delivered += 1;
                    tracing::info!(
                        instance_id = %timer.instance_id,
                        step = %timer.step,
                        now_at = %snapshot.current_step,
                        "Timer delivered"
                    );
                }
                Err(err) => match err.kind() {
                    ErrorKind::Infrastructure => {
                        let attempts = retries
                            .get(&timer.instance_id)
                            .filter(|s| s.armed_version == timer.armed_version)
                            .map_or(1, |s| s.attempts + 1);
                        let delay = self.config.backoff.delay_for(attempts);
                        let next_attempt_at = now
                            + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::minutes(5));
                        retries.insert(
                            timer.instance_id.clone(),
                            RetryState {
                                armed_version: timer.armed_version,
                                attempts,
                                next_attempt_at,
                            },
                        );
                        report.failed += 1;
                        tracing::warn!(
                            instance_id = %timer.instance_id,
                            attempt = attempts,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %err,
                            "Timer delivery failed, backing off"
                        );
                    }
                    ErrorKind::Configuration | ErrorKind::Authorization => {
                        retries.remove(&timer.instance_id);
                        report.aborted += 1;
                        tracing::error!(
                            instance_id = %timer.instance_id,
                            step = %timer.step,
                            error = %err,
                            "Timer delivery hit a configuration error"
                        );
                    }
                    ErrorKind::Contention | ErrorKind::Usage => {
                        retries.remove(&timer.instance_id);
                        report.superseded += 1;
                        tracing::debug!(
                            instance_id = %timer.instance_id,
                            step = %timer.step,
                            reason = %err,
                            "Timer superseded"
                        );
                    }
                },
            }
        }

        Ok(report)
    }
}
