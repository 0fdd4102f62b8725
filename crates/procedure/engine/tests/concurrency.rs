//! Concurrent signals and timers against one instance
//!
//! At most one of any set of racing transitions may commit; the others see
//! `AlreadyTransitioned` and the instance history records a single exit.

mod common;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::*;
use procedure_engine::*;
use procedure_types::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Barrier;

/// Holds the next `pending` loads at a barrier so racers read the same
/// version before either of them saves
struct LockstepStore {
    inner: InMemoryInstanceStore,
    pending: AtomicUsize,
    barrier: Barrier,
}

impl LockstepStore {
    fn new() -> Self {
        Self {
            inner: InMemoryInstanceStore::new(),
            pending: AtomicUsize::new(0),
            barrier: Barrier::new(2),
        }
    }

    fn hold_next_two_loads(&self) {
        self.pending.store(2, Ordering::SeqCst);
    }
}

#[async_trait]
impl InstanceStore for LockstepStore {
    async fn insert(&self, instance: &Instance) -> StoreResult<()> {
        self.inner.insert(instance).await
    }

    async fn load(&self, id: &InstanceId) -> StoreResult<Option<Instance>> {
        let loaded = self.inner.load(id).await?;
        if self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            self.barrier.wait().await;
        }
        Ok(loaded)
    }

    async fn save(&self, instance: &Instance, expected_version: u64) -> StoreResult<()> {
        self.inner.save(instance, expected_version).await
    }

    async fn list(&self, filter: &InstanceFilter) -> StoreResult<Vec<Instance>> {
        self.inner.list(filter).await
    }

    async fn due_timers(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<DueTimer>> {
        self.inner.due_timers(now, limit).await
    }
}

#[tokio::test]
async fn test_two_completions_one_wins() {
    let store = Arc::new(LockstepStore::new());
    let h = make_harness_with_store(store.clone());
    let id = start_provider(&h, "prov-race").await;

    store.hold_next_two_loads();
    let actor = site_admin();
    let (first, second) = futures::join!(
        h.engine.advance(&id, Signal::complete("submit_configuration"), &actor),
        h.engine.advance(&id, Signal::complete("submit_configuration"), &actor),
    );

    let outcomes = [first, second];
    let wins = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1);
    let loser = outcomes.into_iter().find_map(Result::err).unwrap();
    assert!(matches!(loser, EngineError::AlreadyTransitioned(_)));
    assert!(loser.is_retryable());

    let snap = h.engine.get_instance(&id).await.unwrap();
    assert_eq!(snap.current_step, StepId::new("assign_tester"));
    assert_eq!(snap.version, 1);
    let exits = snap
        .history
        .iter()
        .filter(|e| e.from.as_str() == "submit_configuration")
        .count();
    assert_eq!(exits, 1);
}

#[tokio::test]
async fn test_expected_version_rejects_stale_caller() {
    let h = make_harness();
    let id = start_provider(&h, "prov-stale").await;
    let seen = h.engine.get_instance(&id).await.unwrap().version;

    let actor = site_admin();
    let (first, second) = futures::join!(
        h.engine.advance(
            &id,
            Signal::complete("submit_configuration").expecting_version(seen),
            &actor,
        ),
        h.engine.advance(
            &id,
            Signal::complete("submit_configuration").expecting_version(seen),
            &actor,
        ),
    );
    assert_eq!([&first, &second].iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(h.step_of(&id).await, StepId::new("assign_tester"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_racers_single_commit() {
    let h = make_harness();
    let id = start_provider(&h, "prov-crowd").await;
    let seen = h.engine.get_instance(&id).await.unwrap().version;

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let engine = h.engine.clone();
            let id = id.clone();
            tokio::spawn(async move {
                engine
                    .advance(
                        &id,
                        Signal::complete("submit_configuration").expecting_version(seen),
                        &site_admin(),
                    )
                    .await
            })
        })
        .collect();

    let mut wins = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => wins += 1,
            Err(EngineError::AlreadyTransitioned(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(wins, 1);

    let snap = h.engine.get_instance(&id).await.unwrap();
    assert_eq!(snap.version, seen + 1);
    assert_eq!(snap.history.len(), 2);
}

#[tokio::test]
async fn test_timer_and_completion_race() {
    let store = Arc::new(LockstepStore::new());
    let h = make_harness_with_store(store.clone());
    let id = provider_at_automated_test(&h, "prov-photo-finish").await;
    h.clock.advance(Duration::days(1));

    store.hold_next_two_loads();
    let actor = pipeline();
    let (report, completion) = futures::join!(
        h.timers.poll_once(),
        h.engine.advance(
            &id,
            Signal::complete("automated_test").with_variable("test_auto_ok", true),
            &actor,
        ),
    );
    let report = report.unwrap();

    let snap = h.engine.get_instance(&id).await.unwrap();
    match completion {
        Ok(_) => {
            assert_eq!(report.superseded, 1);
            assert_eq!(snap.current_step, StepId::new("manual_test"));
        }
        Err(err) => {
            assert!(matches!(err, EngineError::AlreadyTransitioned(_)));
            assert_eq!(report.delivered, 1);
            assert_eq!(snap.current_step, StepId::new("update_provider"));
        }
    }
    let exits = snap
        .history
        .iter()
        .filter(|e| e.from.as_str() == "automated_test")
        .count();
    assert_eq!(exits, 1);
}

#[tokio::test]
async fn test_timer_not_redelivered_after_completion() {
    let h = make_harness();
    let id = provider_at_automated_test(&h, "prov-late-poll").await;

    // the deadline passes but the poller has not run yet
    h.clock.advance(Duration::days(2));
    h.engine
        .advance(
            &id,
            Signal::complete("automated_test").with_variable("test_auto_ok", true),
            &pipeline(),
        )
        .await
        .unwrap();

    let report = h.timers.poll_once().await.unwrap();
    assert_eq!(report, PollReport::default());
    assert_eq!(h.step_of(&id).await, StepId::new("manual_test"));
}
