//! Community onboarding: review escalation, rejection and the SLA loop

mod common;

use chrono::Duration;
use common::*;
use procedure_engine::*;
use procedure_types::*;

/// Drive a fresh onboarding instance to `review_request`
async fn community_in_review(h: &Harness, community: &str) -> InstanceId {
    let id = start_community(h, community).await;
    h.engine
        .advance(
            &id,
            Signal::complete("submit_request").with_variable("cpu_hours", 50_000i64),
            &group_manager(),
        )
        .await
        .unwrap();
    let snap = h
        .engine
        .advance(
            &id,
            Signal::complete("assign_moderator").with_variable("moderator", "max"),
            &admin(),
        )
        .await
        .unwrap();
    assert_eq!(snap.current_step, StepId::new("review_request"));
    id
}

#[tokio::test]
async fn test_onboarding_happy_path() {
    let h = make_harness();
    let id = community_in_review(&h, "astro").await;

    let snap = h
        .engine
        .advance(
            &id,
            Signal::complete("review_request").with_variable("request_accepted", true),
            &sla_moderator(),
        )
        .await
        .unwrap();
    assert_eq!(snap.current_step, StepId::new("negotiate_sla"));
    assert!(snap.timer_due_at.is_none());

    h.engine
        .advance(&id, Signal::complete("negotiate_sla"), &sla_moderator())
        .await
        .unwrap();
    let snap = h
        .engine
        .advance(
            &id,
            Signal::complete("validate_sla").with_variable("sla_accepted", true),
            &group_manager(),
        )
        .await
        .unwrap();
    assert_eq!(snap.status, InstanceStatus::Completed);
    assert_eq!(snap.current_step, StepId::new("onboarded"));
    assert_eq!(snap.variables.get("cpu_hours").and_then(Value::as_int), Some(50_000));
}

#[tokio::test]
async fn test_rejected_request_ends_on_rejected() {
    let h = make_harness();
    let id = community_in_review(&h, "bio").await;

    let snap = h
        .engine
        .advance(
            &id,
            Signal::complete("review_request").with_variable("request_accepted", false),
            &sla_moderator(),
        )
        .await
        .unwrap();
    assert_eq!(snap.status, InstanceStatus::Completed);
    assert_eq!(snap.current_step, StepId::new("rejected"));

    // a finished onboarding does not block a new one
    start_community(&h, "bio").await;
}

#[tokio::test]
async fn test_missing_decision_takes_default_branch() {
    let h = make_harness();
    let id = community_in_review(&h, "geo").await;

    let snap = h
        .engine
        .advance(&id, Signal::complete("review_request"), &sla_moderator())
        .await
        .unwrap();
    assert_eq!(snap.current_step, StepId::new("rejected"));
}

#[tokio::test]
async fn test_overdue_review_escalates_and_rearms() {
    let h = make_harness();
    let id = community_in_review(&h, "chem").await;

    let report = h.elapse(Duration::days(3)).await;
    assert_eq!(report.delivered, 1);
    let snap = h.engine.get_instance(&id).await.unwrap();
    assert_eq!(snap.current_step, StepId::new("escalate_review"));
    assert!(snap.timer_due_at.is_none());

    // the reviewer's late decision no longer applies
    let err = h
        .engine
        .advance(
            &id,
            Signal::complete("review_request").with_variable("request_accepted", true),
            &sla_moderator(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
    let snap = h.engine.get_instance(&id).await.unwrap();
    assert_eq!(snap.current_step, StepId::new("escalate_review"));
    assert!(!snap.variables.contains_key("request_accepted"));

    // only an admin can chase the reviewer
    let err = h
        .engine
        .advance(&id, Signal::complete("escalate_review"), &sla_moderator())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden { .. }));

    let snap = h
        .engine
        .advance(&id, Signal::complete("escalate_review"), &admin())
        .await
        .unwrap();
    assert_eq!(snap.current_step, StepId::new("review_request"));
    assert_eq!(snap.timer_due_at, Some(h.clock.now() + Duration::days(3)));

    // the reviewer answers within the new window
    h.clock.advance(Duration::days(1));
    let snap = h
        .engine
        .advance(
            &id,
            Signal::complete("review_request").with_variable("request_accepted", true),
            &sla_moderator(),
        )
        .await
        .unwrap();
    assert_eq!(snap.current_step, StepId::new("negotiate_sla"));

    let report = h.elapse(Duration::days(5)).await;
    assert_eq!(report, PollReport::default());
}

#[tokio::test]
async fn test_sla_renegotiation_loop() {
    let h = make_harness();
    let id = community_in_review(&h, "hep").await;
    h.engine
        .advance(
            &id,
            Signal::complete("review_request").with_variable("request_accepted", true),
            &sla_moderator(),
        )
        .await
        .unwrap();

    for round in 0..3 {
        h.engine
            .advance(
                &id,
                Signal::complete("negotiate_sla").with_variable("round", round as i64),
                &sla_moderator(),
            )
            .await
            .unwrap();
        let snap = h
            .engine
            .advance(
                &id,
                Signal::complete("validate_sla").with_variable("sla_accepted", false),
                &group_manager(),
            )
            .await
            .unwrap();
        assert_eq!(snap.current_step, StepId::new("negotiate_sla"));
    }

    h.engine
        .advance(&id, Signal::complete("negotiate_sla"), &sla_moderator())
        .await
        .unwrap();
    let snap = h
        .engine
        .advance(
            &id,
            Signal::complete("validate_sla").with_variable("sla_accepted", true),
            &group_manager(),
        )
        .await
        .unwrap();
    assert_eq!(snap.current_step, StepId::new("onboarded"));
    let negotiations = snap
        .history
        .iter()
        .filter(|e| e.from.as_str() == "negotiate_sla")
        .count();
    assert_eq!(negotiations, 4);
    assert_eq!(snap.variables.get("round").and_then(Value::as_int), Some(2));
}

#[tokio::test]
async fn test_initiator_must_be_group_manager() {
    let h = make_harness();
    let err = h
        .engine
        .start_instance(
            catalog::COMMUNITY_ONBOARDING,
            Subject::community("astro"),
            &site_admin(),
            Variables::new(),
        )
        .await
        .unwrap_err();
    match err {
        EngineError::Forbidden { required, .. } => assert_eq!(required, RoleName::user_group_mgr()),
        other => panic!("expected Forbidden, got {other:?}"),
    }
}

#[tokio::test]
async fn test_instances_listed_per_procedure() {
    let h = make_harness();
    start_community(&h, "c1").await;
    start_community(&h, "c2").await;
    start_provider(&h, "p1").await;

    let communities = h
        .engine
        .list_instances(&InstanceFilter::new().procedure(catalog::COMMUNITY_ONBOARDING))
        .await
        .unwrap();
    let subjects: Vec<_> = communities.iter().map(|s| s.subject.as_str()).collect();
    assert_eq!(subjects.len(), 2);
    assert!(subjects.contains(&"c1") && subjects.contains(&"c2"));

    let limited = h
        .engine
        .list_instances(&InstanceFilter::new().limit(1))
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);
}
