//! End-to-end tests for the provider federation procedure

mod common;

use chrono::Duration;
use common::*;
use procedure_engine::*;
use procedure_types::*;

fn exits_from(snapshot: &InstanceSnapshot, step: &str) -> usize {
    snapshot
        .history
        .iter()
        .filter(|entry| entry.from.as_str() == step)
        .count()
}

#[tokio::test]
async fn test_full_federation_with_one_retry() {
    let h = make_harness();
    let id = start_provider(&h, "prov-1").await;
    assert_eq!(h.step_of(&id).await, StepId::new("submit_configuration"));

    let snap = h
        .engine
        .advance(
            &id,
            Signal::complete("submit_configuration")
                .with_variable("endpoint", "https://prov-1.example.org"),
            &site_admin(),
        )
        .await
        .unwrap();
    assert_eq!(snap.current_step, StepId::new("assign_tester"));

    let snap = h
        .engine
        .advance(
            &id,
            Signal::complete("assign_tester").with_variable("tester", "tomas"),
            &site_admin(),
        )
        .await
        .unwrap();
    assert_eq!(snap.current_step, StepId::new("automated_test"));
    assert_eq!(snap.timer_due_at, Some(h.clock.now() + Duration::days(1)));

    // first run fails before the deadline
    h.clock.advance(Duration::hours(5));
    let snap = h
        .engine
        .advance(
            &id,
            Signal::complete("automated_test").with_variable("test_auto_ok", false),
            &pipeline(),
        )
        .await
        .unwrap();
    assert_eq!(snap.current_step, StepId::new("update_provider"));
    assert!(snap.timer_due_at.is_none());

    h.clock.advance(Duration::hours(2));
    let snap = h
        .engine
        .advance(&id, Signal::complete("update_provider"), &site_admin())
        .await
        .unwrap();
    assert_eq!(snap.current_step, StepId::new("automated_test"));
    assert_eq!(snap.timer_due_at, Some(h.clock.now() + Duration::days(1)));

    let snap = h
        .engine
        .advance(
            &id,
            Signal::complete("automated_test").with_variable("test_auto_ok", true),
            &pipeline(),
        )
        .await
        .unwrap();
    assert_eq!(snap.current_step, StepId::new("manual_test"));

    let snap = h
        .engine
        .advance(
            &id,
            Signal::complete("manual_test").with_variable("test_man_ok", true),
            &site_tester(),
        )
        .await
        .unwrap();
    assert_eq!(snap.current_step, StepId::new("monitoring"));

    let snap = h
        .engine
        .advance(&id, Signal::complete("monitoring"), &pipeline())
        .await
        .unwrap();
    assert_eq!(snap.current_step, StepId::new("monitoring_window"));
    assert_eq!(snap.timer_due_at, Some(h.clock.now() + Duration::days(3)));

    // the window has not elapsed yet
    let report = h.elapse(Duration::days(2)).await;
    assert_eq!(report, PollReport::default());
    assert_eq!(h.step_of(&id).await, StepId::new("monitoring_window"));

    let report = h.elapse(Duration::days(1)).await;
    assert_eq!(report.delivered, 1);
    assert_eq!(h.step_of(&id).await, StepId::new("federate_provider"));

    let snap = h
        .engine
        .advance(&id, Signal::complete("federate_provider"), &admin())
        .await
        .unwrap();
    assert_eq!(snap.status, InstanceStatus::Completed);
    assert_eq!(snap.current_step, StepId::new("federated"));
    assert!(snap.timer_due_at.is_none());
    assert_eq!(exits_from(&snap, "automated_test"), 2);
    assert_eq!(
        snap.variables.get("endpoint").and_then(Value::as_text),
        Some("https://prov-1.example.org")
    );
    assert_eq!(
        snap.history.last().unwrap().actor,
        Actor::identity("ada", IDP)
    );

    let err = h
        .engine
        .advance(&id, Signal::complete("federate_provider"), &admin())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyTerminal { .. }));
}

#[tokio::test]
async fn test_automated_test_timeout_routes_to_update() {
    let h = make_harness();
    let id = provider_at_automated_test(&h, "prov-slow").await;
    let armed_at = h.engine.get_instance(&id).await.unwrap().version;

    let report = h.elapse(Duration::hours(23)).await;
    assert_eq!(report.delivered, 0);

    let report = h.elapse(Duration::hours(1)).await;
    assert_eq!(report.delivered, 1);

    let snap = h.engine.get_instance(&id).await.unwrap();
    assert_eq!(snap.current_step, StepId::new("update_provider"));
    let tail: Vec<_> = snap
        .history
        .iter()
        .rev()
        .take(2)
        .map(|e| (e.to.as_str(), e.signal.as_str(), e.actor.clone()))
        .collect();
    assert_eq!(
        tail,
        vec![
            ("update_provider", AUTO_SIGNAL, Actor::Engine),
            ("automated_test_timeout", TIMEOUT_SIGNAL, Actor::Timer),
        ]
    );

    // the pipeline reports after the deadline, against the version it saw
    let err = h
        .engine
        .advance(
            &id,
            Signal::complete("automated_test")
                .with_variable("test_auto_ok", true)
                .expecting_version(armed_at),
            &pipeline(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyTransitioned(_)));

    // without a version the report is still addressed to a task the
    // instance has left, whoever sends it
    let before = h.engine.get_instance(&id).await.unwrap();
    for caller in [pipeline(), site_admin()] {
        let err = h
            .engine
            .advance(
                &id,
                Signal::complete("automated_test").with_variable("test_auto_ok", true),
                &caller,
            )
            .await
            .unwrap_err();
        match err {
            EngineError::InvalidTransition { step, .. } => {
                assert_eq!(step, StepId::new("update_provider"))
            }
            other => panic!("expected InvalidTransition, got {other:?}"),
        }
    }
    assert_eq!(h.engine.get_instance(&id).await.unwrap(), before);
}

#[tokio::test]
async fn test_completion_before_deadline_cancels_timer() {
    let h = make_harness();
    let id = provider_at_automated_test(&h, "prov-fast").await;

    h.clock.advance(Duration::hours(23));
    h.engine
        .advance(
            &id,
            Signal::complete("automated_test").with_variable("test_auto_ok", true),
            &pipeline(),
        )
        .await
        .unwrap();

    let report = h.elapse(Duration::days(2)).await;
    assert_eq!(report, PollReport::default());
    assert_eq!(h.step_of(&id).await, StepId::new("manual_test"));
}

#[tokio::test]
async fn test_role_gating() {
    let h = make_harness();

    let err = h
        .engine
        .start_instance(
            catalog::PROVIDER_FEDERATION,
            Subject::provider("prov-x"),
            &site_tester(),
            Variables::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden { .. }));
    assert_eq!(err.kind(), ErrorKind::Authorization);

    let id = start_provider(&h, "prov-2").await;
    for caller in [site_tester(), admin(), pipeline(), impostor()] {
        let err = h
            .engine
            .advance(&id, Signal::complete("submit_configuration"), &caller)
            .await
            .unwrap_err();
        match err {
            EngineError::Forbidden { required, .. } => {
                assert_eq!(required, RoleName::site_admin())
            }
            other => panic!("expected Forbidden, got {other:?}"),
        }
    }

    // a denied signal leaves no trace
    let snap = h.engine.get_instance(&id).await.unwrap();
    assert_eq!(snap.current_step, StepId::new("submit_configuration"));
    assert_eq!(snap.version, 0);
    assert_eq!(snap.history.len(), 1);
}

#[tokio::test]
async fn test_manual_test_needs_site_tester() {
    let h = make_harness();
    let id = provider_at_automated_test(&h, "prov-3").await;
    h.engine
        .advance(
            &id,
            Signal::complete("automated_test").with_variable("test_auto_ok", true),
            &pipeline(),
        )
        .await
        .unwrap();

    let err = h
        .engine
        .advance(
            &id,
            Signal::complete("manual_test").with_variable("test_man_ok", true),
            &site_admin(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden { .. }));

    let snap = h
        .engine
        .advance(
            &id,
            Signal::complete("manual_test").with_variable("test_man_ok", false),
            &site_tester(),
        )
        .await
        .unwrap();
    assert_eq!(snap.current_step, StepId::new("update_provider"));
}

#[tokio::test]
async fn test_provider_procedure_rejects_communities() {
    let h = make_harness();
    let err = h
        .engine
        .start_instance(
            catalog::PROVIDER_FEDERATION,
            Subject::community("astro-vo"),
            &site_admin(),
            Variables::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::WrongSubjectKind { .. }));
    assert_eq!(err.kind(), ErrorKind::Usage);
}

#[tokio::test]
async fn test_unknown_signal_is_invalid() {
    let h = make_harness();
    let id = start_provider(&h, "prov-4").await;
    let err = h
        .engine
        .advance(&id, Signal::new("submit_configuration", "approve"), &site_admin())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
    assert_eq!(err.kind(), ErrorKind::Usage);
}

#[tokio::test]
async fn test_repeated_failures_loop_until_success() {
    const FAILURES: usize = 4;
    let h = make_harness();
    let id = provider_at_automated_test(&h, "prov-flaky").await;

    for _ in 0..FAILURES {
        h.engine
            .advance(
                &id,
                Signal::complete("automated_test").with_variable("test_auto_ok", false),
                &pipeline(),
            )
            .await
            .unwrap();
        h.engine
            .advance(&id, Signal::complete("update_provider"), &site_admin())
            .await
            .unwrap();
    }
    let snap = h
        .engine
        .advance(
            &id,
            Signal::complete("automated_test").with_variable("test_auto_ok", true),
            &pipeline(),
        )
        .await
        .unwrap();

    assert_eq!(snap.current_step, StepId::new("manual_test"));
    assert_eq!(exits_from(&snap, "automated_test"), FAILURES + 1);
    assert_eq!(exits_from(&snap, "update_provider"), FAILURES);
    assert_eq!(
        snap.variables.get("test_auto_ok").and_then(Value::as_bool),
        Some(true)
    );
}

#[tokio::test]
async fn test_one_running_instance_per_provider() {
    let h = make_harness();
    let id = start_provider(&h, "prov-5").await;

    let err = h
        .engine
        .start_instance(
            catalog::PROVIDER_FEDERATION,
            Subject::provider("prov-5"),
            &site_admin(),
            Variables::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DuplicateActive { .. }));

    // other subjects are unaffected
    start_provider(&h, "prov-6").await;

    h.engine
        .cancel_instance(&id, &admin(), "resubmitting")
        .await
        .unwrap();
    let again = start_provider(&h, "prov-5").await;
    assert_ne!(again, id);

    let running = h
        .engine
        .list_instances(
            &InstanceFilter::new()
                .subject(SubjectId::new("prov-5"))
                .status(InstanceStatus::Running),
        )
        .await
        .unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].id, again);
}

#[tokio::test]
async fn test_same_signals_same_path() {
    async fn run(h: &Harness) -> Vec<(String, String, String)> {
        let id = provider_at_automated_test(h, "prov-det").await;
        h.engine
            .advance(
                &id,
                Signal::complete("automated_test").with_variable("test_auto_ok", false),
                &pipeline(),
            )
            .await
            .unwrap();
        h.engine
            .advance(&id, Signal::complete("update_provider"), &site_admin())
            .await
            .unwrap();
        h.elapse(Duration::days(1)).await;
        h.engine
            .advance(&id, Signal::complete("update_provider"), &site_admin())
            .await
            .unwrap();
        h.engine
            .advance(
                &id,
                Signal::complete("automated_test").with_variable("test_auto_ok", true),
                &pipeline(),
            )
            .await
            .unwrap();
        h.engine
            .get_instance(&id)
            .await
            .unwrap()
            .history
            .iter()
            .map(|e| (e.from.to_string(), e.to.to_string(), e.signal.clone()))
            .collect()
    }

    let first = run(&make_harness()).await;
    let second = run(&make_harness()).await;
    assert_eq!(first, second);
    assert_eq!(first.last().unwrap().1, "manual_test");
}
