//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use chrono::Duration;
use procedure_engine::*;
use procedure_types::*;
use std::sync::Arc;

pub const IDP: &str = "https://aai.example.org/";

pub struct Harness {
    pub engine: Arc<WorkflowEngine>,
    pub clock: Arc<ManualClock>,
    pub timers: Arc<TimerManager>,
}

impl Harness {
    /// Move the clock and deliver whatever fell due
    pub async fn elapse(&self, by: Duration) -> PollReport {
        self.clock.advance(by);
        self.timers.poll_once().await.unwrap()
    }

    pub async fn step_of(&self, id: &InstanceId) -> StepId {
        self.engine.get_instance(id).await.unwrap().current_step
    }
}

pub fn make_auth_config() -> AuthConfig {
    AuthConfig::default()
        .with_trusted_issuer(IDP)
        .with_role(RoleMapping::new(RoleName::site_admin(), ["fed:site-admins"]))
        .with_role(RoleMapping::new(RoleName::site_tester(), ["fed:site-testers"]))
        .with_role(RoleMapping::new(RoleName::user_group_mgr(), ["fed:group-managers"]))
        .with_role(RoleMapping::new(RoleName::sla_mod(), ["fed:sla-moderators"]))
        .with_role(RoleMapping::new(RoleName::admin(), ["fed:admins"]))
}

pub fn make_harness() -> Harness {
    make_harness_with_store(Arc::new(InMemoryInstanceStore::new()))
}

pub fn make_harness_with_store(store: Arc<dyn InstanceStore>) -> Harness {
    let clock = Arc::new(ManualClock::default());
    let engine = Arc::new(
        WorkflowEngine::new(store, make_auth_config()).with_clock(clock.clone()),
    );
    engine.register_builtin_procedures().unwrap();
    let (timers, _wake_rx) = TimerManager::new(engine.clone(), TimerConfig::default());
    Harness {
        engine,
        clock,
        timers,
    }
}

pub fn site_admin() -> VerifiedIdentity {
    VerifiedIdentity::new("sofia", IDP).with_group("fed:site-admins")
}

pub fn site_tester() -> VerifiedIdentity {
    VerifiedIdentity::new("tomas", IDP).with_group("fed:site-testers")
}

pub fn admin() -> VerifiedIdentity {
    VerifiedIdentity::new("ada", IDP).with_group("fed:admins")
}

pub fn group_manager() -> VerifiedIdentity {
    VerifiedIdentity::new("gina", IDP).with_group("fed:group-managers")
}

pub fn sla_moderator() -> VerifiedIdentity {
    VerifiedIdentity::new("max", IDP).with_group("fed:sla-moderators")
}

/// Trusted caller holding no roles, e.g. the test pipeline
pub fn pipeline() -> VerifiedIdentity {
    VerifiedIdentity::new("ci-runner", IDP)
}

/// Holds every group but comes from an untrusted issuer
pub fn impostor() -> VerifiedIdentity {
    VerifiedIdentity::new("mallory", "https://evil.example.net")
        .with_group("fed:site-admins")
        .with_group("fed:site-testers")
        .with_group("fed:admins")
}

pub async fn start_provider(h: &Harness, provider: &str) -> InstanceId {
    h.engine
        .start_instance(
            catalog::PROVIDER_FEDERATION,
            Subject::provider(provider),
            &site_admin(),
            Variables::new(),
        )
        .await
        .unwrap()
}

pub async fn start_community(h: &Harness, community: &str) -> InstanceId {
    h.engine
        .start_instance(
            catalog::COMMUNITY_ONBOARDING,
            Subject::community(community),
            &group_manager(),
            Variables::new(),
        )
        .await
        .unwrap()
}

/// Drive a fresh provider federation instance to `automated_test`
pub async fn provider_at_automated_test(h: &Harness, provider: &str) -> InstanceId {
    let id = start_provider(h, provider).await;
    h.engine
        .advance(&id, Signal::complete("submit_configuration"), &site_admin())
        .await
        .unwrap();
    h.engine
        .advance(&id, Signal::complete("assign_tester"), &site_admin())
        .await
        .unwrap();
    id
}
