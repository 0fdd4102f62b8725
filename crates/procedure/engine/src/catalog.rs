//! Built-in procedures: provider federation and community onboarding

use procedure_types::{
    Guard, ProcedureDefinition, ProcedureResult, RoleName, Step, SubjectKind, Transition,
};

pub const PROVIDER_FEDERATION: &str = "provider_federation";
pub const COMMUNITY_ONBOARDING: &str = "community_onboarding";

const DAY_SECS: u64 = 24 * 60 * 60;

/// Every built-in procedure, validated
pub fn builtin_procedures() -> ProcedureResult<Vec<ProcedureDefinition>> {
    let procedures = vec![provider_federation()?, community_onboarding()?];
    for procedure in &procedures {
        procedure.validate()?;
    }
    Ok(procedures)
}

/// Federating a resource provider: configuration, automated and manual
/// testing with a retry loop through `update_provider`, a monitoring
/// window, then final approval.
pub fn provider_federation() -> ProcedureResult<ProcedureDefinition> {
    let mut def = ProcedureDefinition::new(PROVIDER_FEDERATION, SubjectKind::Provider)
        .with_description("Federate a new resource provider")
        .with_initiator_role(RoleName::site_admin());

    def.add_step(Step::start("start"))?;
    def.add_step(
        Step::user_task("submit_configuration", "Submit provider configuration")
            .with_required_role(RoleName::site_admin()),
    )?;
    def.add_step(
        Step::user_task("assign_tester", "Assign a site tester")
            .with_required_role(RoleName::site_admin()),
    )?;
    def.add_step(
        Step::automated_task("automated_test", "Run automated tests")
            .with_description("Completed by the test pipeline with `test_auto_ok`"),
    )?;
    def.add_step(Step::timer_boundary(
        "automated_test_timeout",
        "Automated tests timed out",
        "automated_test",
        DAY_SECS,
    ))?;
    def.add_step(Step::gateway("automated_test_result", "Automated tests passed?"))?;
    def.add_step(
        Step::user_task("update_provider", "Update provider configuration")
            .with_required_role(RoleName::site_admin()),
    )?;
    def.add_step(
        Step::user_task("manual_test", "Run manual tests")
            .with_required_role(RoleName::site_tester()),
    )?;
    def.add_step(Step::gateway("manual_test_result", "Manual tests passed?"))?;
    def.add_step(
        Step::automated_task("monitoring", "Enable monitoring")
            .with_description("Completed by the monitoring event consumer"),
    )?;
    def.add_step(Step::timer_catch(
        "monitoring_window",
        "Observe provider under monitoring",
        3 * DAY_SECS,
    ))?;
    def.add_step(
        Step::user_task("federate_provider", "Approve federation")
            .with_required_role(RoleName::admin()),
    )?;
    def.add_step(Step::end("federated"))?;

    def.add_transition(Transition::new("start", "submit_configuration"))?;
    def.add_transition(Transition::new("submit_configuration", "assign_tester"))?;
    def.add_transition(Transition::new("assign_tester", "automated_test"))?;
    def.add_transition(Transition::new("automated_test", "automated_test_result"))?;
    def.add_transition(Transition::new("automated_test_timeout", "update_provider"))?;
    def.add_transition(
        Transition::guarded(
            "automated_test_result",
            "manual_test",
            Guard::is_true("test_auto_ok"),
        )
        .with_label("passed"),
    )?;
    def.add_transition(
        Transition::default_branch("automated_test_result", "update_provider").with_label("failed"),
    )?;
    def.add_transition(Transition::new("update_provider", "automated_test"))?;
    def.add_transition(Transition::new("manual_test", "manual_test_result"))?;
    def.add_transition(
        Transition::guarded("manual_test_result", "monitoring", Guard::is_true("test_man_ok"))
            .with_label("passed"),
    )?;
    def.add_transition(
        Transition::default_branch("manual_test_result", "update_provider").with_label("failed"),
    )?;
    def.add_transition(Transition::new("monitoring", "monitoring_window"))?;
    def.add_transition(Transition::new("monitoring_window", "federate_provider"))?;
    def.add_transition(Transition::new("federate_provider", "federated"))?;

    Ok(def)
}

/// Onboarding a scientific community: request review with an overdue
/// escalation, then an SLA negotiation loop.
pub fn community_onboarding() -> ProcedureResult<ProcedureDefinition> {
    let mut def = ProcedureDefinition::new(COMMUNITY_ONBOARDING, SubjectKind::Community)
        .with_description("Onboard a new scientific community")
        .with_initiator_role(RoleName::user_group_mgr());

    def.add_step(Step::start("start"))?;
    def.add_step(
        Step::user_task("submit_request", "Submit resource usage request")
            .with_required_role(RoleName::user_group_mgr()),
    )?;
    def.add_step(
        Step::user_task("assign_moderator", "Assign an SLA moderator")
            .with_required_role(RoleName::admin()),
    )?;
    def.add_step(
        Step::user_task("review_request", "Review the request")
            .with_required_role(RoleName::sla_mod()),
    )?;
    def.add_step(Step::timer_boundary(
        "review_overdue",
        "Review overdue",
        "review_request",
        3 * DAY_SECS,
    ))?;
    def.add_step(
        Step::user_task("escalate_review", "Chase the overdue review")
            .with_required_role(RoleName::admin()),
    )?;
    def.add_step(Step::gateway("review_decision", "Request accepted?"))?;
    def.add_step(
        Step::user_task("negotiate_sla", "Negotiate the SLA")
            .with_required_role(RoleName::sla_mod()),
    )?;
    def.add_step(
        Step::user_task("validate_sla", "Validate the SLA")
            .with_required_role(RoleName::user_group_mgr()),
    )?;
    def.add_step(Step::gateway("sla_decision", "SLA accepted?"))?;
    def.add_step(Step::end("onboarded"))?;
    def.add_step(Step::end("rejected"))?;

    def.add_transition(Transition::new("start", "submit_request"))?;
    def.add_transition(Transition::new("submit_request", "assign_moderator"))?;
    def.add_transition(Transition::new("assign_moderator", "review_request"))?;
    def.add_transition(Transition::new("review_request", "review_decision"))?;
    def.add_transition(Transition::new("review_overdue", "escalate_review"))?;
    def.add_transition(Transition::new("escalate_review", "review_request"))?;
    def.add_transition(
        Transition::guarded(
            "review_decision",
            "negotiate_sla",
            Guard::is_true("request_accepted"),
        )
        .with_label("accepted"),
    )?;
    def.add_transition(
        Transition::default_branch("review_decision", "rejected").with_label("rejected"),
    )?;
    def.add_transition(Transition::new("negotiate_sla", "validate_sla"))?;
    def.add_transition(Transition::new("validate_sla", "sla_decision"))?;
    def.add_transition(
        Transition::guarded("sla_decision", "onboarded", Guard::is_true("sla_accepted"))
            .with_label("accepted"),
    )?;
    def.add_transition(
        Transition::default_branch("sla_decision", "negotiate_sla").with_label("renegotiate"),
    )?;

    Ok(def)
}
