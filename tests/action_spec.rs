//! Action orchestration against an in-process manager.
//!
//! Tests are organized by concern:
//! - Gating: which components get a call at all
//! - Fan-out: concurrency, itemised failures, latency
//! - Waiting: timeouts, cancellation, disconnects

use std::sync::Arc;
use std::time::Duration;

use planet_admin::action::*;
use planet_admin::gateway::{CallScript, GatewayError, MemoryGateway};
use planet_admin::models::*;
use planet_admin::session::{Session, SessionStatus};

/// Helper to create a manager with one flow named `default`.
fn manager() -> Arc<MemoryGateway> {
    let gateway = Arc::new(MemoryGateway::new());
    gateway.add_flow("default");
    gateway
}

fn flow() -> Scope {
    Scope::Flow("default".into())
}

/// Helper to add a component to the `default` flow.
fn component(gateway: &MemoryGateway, name: &str, mood: Mood) -> NodeId {
    gateway.add_component(&flow(), name, "test-component", mood)
}

async fn connect(gateway: &Arc<MemoryGateway>) -> Session {
    Session::connect(gateway.clone())
        .await
        .expect("Failed to connect session")
}

fn target(path: &str) -> LogicalTarget {
    path.parse().expect("Invalid target path")
}

fn listeners_on(session: &Session, node: NodeId) -> usize {
    session
        .mirror()
        .read()
        .node(node)
        .map(|n| n.listener_count())
        .unwrap_or(0)
}

// ============================================================
// Gating
// ============================================================

mod gating {
    use super::*;

    #[tokio::test]
    async fn batch_stop_skips_sleeping_components() {
        let gateway = manager();
        component(&gateway, "producer", Mood::Happy);
        component(&gateway, "encoder", Mood::Sleeping);
        component(&gateway, "muxer", Mood::Happy);
        let session = connect(&gateway).await;

        let report = session
            .orchestrator()
            .perform_action(&target("/default"), &Action::stop(), &ActionOptions::default())
            .await
            .expect("Action failed");

        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.failed(), 0);
        assert_eq!(report.calls_issued, 2);
        assert_eq!(gateway.call_count("componentStop"), 2);
        assert_eq!(
            report.outcome_of(&AvatarId::in_flow("default", "encoder")),
            Some(&TargetOutcome::Skipped {
                mood: Some(Mood::Sleeping)
            })
        );
        assert_eq!(
            report.outcome_of(&AvatarId::in_flow("default", "producer")),
            Some(&TargetOutcome::Done {
                mood: Some(Mood::Sleeping)
            })
        );
        assert_eq!(
            report.summary_line(),
            "Components in flow default now completed action stop."
        );
    }

    #[tokio::test]
    async fn empty_flow_issues_no_calls() {
        let gateway = manager();
        let session = connect(&gateway).await;

        let report = session
            .orchestrator()
            .perform_action(&target("/default"), &Action::start(), &ActionOptions::default())
            .await
            .expect("Action failed");

        assert!(report.targets.is_empty());
        assert_eq!(report.summary(), ActionSummary::NoEligibleTargets);
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn all_ineligible_reports_no_eligible_targets() {
        let gateway = manager();
        component(&gateway, "producer", Mood::Happy);
        let session = connect(&gateway).await;

        let report = session
            .orchestrator()
            .perform_action(&target("/default"), &Action::start(), &ActionOptions::default())
            .await
            .expect("Action failed");

        assert_eq!(report.summary(), ActionSummary::NoEligibleTargets);
        assert_eq!(
            report.to_string(),
            "Cannot start component /default/producer, it is in mood: happy.\n\
             No eligible components to start in flow default."
        );
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_component_fails_before_any_call() {
        let gateway = manager();
        component(&gateway, "producer", Mood::Happy);
        let session = connect(&gateway).await;

        let err = session
            .orchestrator()
            .perform_action(&target("/default/ghost"), &Action::stop(), &ActionOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ActionError::TargetNotFound(_)));
        assert_eq!(err.to_string(), "Could not find component /default/ghost");
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_flow_is_reported_by_name() {
        let gateway = manager();
        let session = connect(&gateway).await;

        let err = session
            .orchestrator()
            .perform_action(&target("/elsewhere"), &Action::stop(), &ActionOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "The flow elsewhere is not found.");
    }

    #[tokio::test]
    async fn root_covers_flow_and_atmosphere() {
        let gateway = manager();
        component(&gateway, "producer", Mood::Sleeping);
        gateway.add_component(&Scope::Atmosphere, "porter", "porter", Mood::Sleeping);
        let session = connect(&gateway).await;

        let report = session
            .orchestrator()
            .perform_action(&target("/"), &Action::start(), &ActionOptions::default())
            .await
            .expect("Action failed");

        assert_eq!(report.succeeded(), 2);
        assert_eq!(
            report.outcome_of(&AvatarId::in_atmosphere("porter")),
            Some(&TargetOutcome::Done {
                mood: Some(Mood::Happy)
            })
        );
        assert_eq!(report.summary_line(), "Components in / now completed action start.");
    }

    #[tokio::test]
    async fn delete_does_not_wait_for_a_mood() {
        let gateway = manager();
        let stopped = component(&gateway, "producer", Mood::Sleeping);
        component(&gateway, "muxer", Mood::Happy);
        let session = connect(&gateway).await;

        let report = session
            .orchestrator()
            .perform_action(&target("/default"), &Action::delete(), &ActionOptions::default())
            .await
            .expect("Action failed");

        assert_eq!(
            report.outcome_of(&AvatarId::in_flow("default", "producer")),
            Some(&TargetOutcome::Done { mood: None })
        );
        assert_eq!(report.skipped(), 1);
        assert_eq!(gateway.mood_of(stopped), None);
    }
}

// ============================================================
// Fan-out
// ============================================================

mod fan_out {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn latency_is_the_slowest_branch_and_failures_are_itemised() {
        let gateway = manager();
        for i in 1..=5u64 {
            let name = format!("c{}", i);
            let id = component(&gateway, &name, Mood::Sleeping);
            let delay = Duration::from_millis(100 * i);
            let script = if i == 3 {
                CallScript::fail(GatewayError::NoMethod {
                    target: format!("/default/{}", name),
                    method: "componentStart".into(),
                })
                .after(delay)
            } else {
                CallScript::ok()
                    .with_deltas(vec![
                        Delta::set(id, "mood", "waking"),
                        Delta::set(id, "mood", "happy"),
                    ])
                    .after(delay)
            };
            gateway.script(&name, "componentStart", script);
        }
        let session = connect(&gateway).await;

        let started = tokio::time::Instant::now();
        let report = session
            .orchestrator()
            .perform_action(&target("/default"), &Action::start(), &ActionOptions::default())
            .await
            .expect("Action failed");
        let elapsed = started.elapsed();

        assert_eq!(report.succeeded(), 4);
        assert_eq!(report.failed(), 1);
        assert_eq!(
            report.outcome_of(&AvatarId::in_flow("default", "c3")),
            Some(&TargetOutcome::Failed(TargetError::NoMethod(
                "componentStart".into()
            )))
        );
        assert!(elapsed >= Duration::from_millis(500), "took {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(600), "took {:?}", elapsed);
        assert_eq!(
            report.summary_line(),
            "Failed to start some components: 1 of 5 failed."
        );
    }

    #[tokio::test]
    async fn busy_component_does_not_abort_siblings() {
        let gateway = manager();
        component(&gateway, "producer", Mood::Happy);
        component(&gateway, "muxer", Mood::Happy);
        gateway.script(
            "producer",
            "componentStop",
            CallScript::fail(GatewayError::BusyComponent("tearing down".into())),
        );
        let session = connect(&gateway).await;

        let report = session
            .orchestrator()
            .perform_action(&target("/default"), &Action::stop(), &ActionOptions::default())
            .await
            .expect("Action failed");

        assert_eq!(
            report.outcome_of(&AvatarId::in_flow("default", "producer")),
            Some(&TargetOutcome::Failed(TargetError::Busy("tearing down".into())))
        );
        assert_eq!(report.succeeded(), 1);
    }

    #[tokio::test]
    async fn invoke_ignores_the_mood_gate() {
        let gateway = manager();
        component(&gateway, "producer", Mood::Lost);
        gateway.script("producer", "reloadConfig", CallScript::ok());
        let session = connect(&gateway).await;

        let report = session
            .orchestrator()
            .perform_action(
                &target("/default/producer"),
                &Action::invoke("reloadConfig"),
                &ActionOptions::default(),
            )
            .await
            .expect("Action failed");

        assert_eq!(report.succeeded(), 1);
        assert_eq!(gateway.call_count("reloadConfig"), 1);
    }
}

// ============================================================
// Waiting
// ============================================================

mod waiting {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_only_that_target_and_detaches_its_waiter() {
        let gateway = manager();
        let stuck = component(&gateway, "producer", Mood::Happy);
        component(&gateway, "muxer", Mood::Happy);
        // acknowledges the call but never reports the new mood
        gateway.script("producer", "componentStop", CallScript::ok());
        let session = connect(&gateway).await;

        let options = ActionOptions {
            timeout: Some(Duration::from_secs(5)),
        };
        let report = session
            .orchestrator()
            .perform_action(&target("/default"), &Action::stop(), &options)
            .await
            .expect("Action failed");

        assert_eq!(
            report.outcome_of(&AvatarId::in_flow("default", "producer")),
            Some(&TargetOutcome::Failed(TargetError::TimedOut(
                Duration::from_secs(5)
            )))
        );
        assert_eq!(report.succeeded(), 1);
        assert_eq!(listeners_on(&session, stuck), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_the_action_detaches_pending_waiters() {
        let gateway = manager();
        let stuck = component(&gateway, "producer", Mood::Happy);
        gateway.script("producer", "componentStop", CallScript::ok());
        let session = connect(&gateway).await;
        let orchestrator = session.orchestrator();

        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            orchestrator.perform_action(
                &target("/default"),
                &Action::stop(),
                &ActionOptions::default(),
            ),
        )
        .await;
        assert!(outcome.is_err());

        // aborted branches are dropped the next time the runtime runs them
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(listeners_on(&session, stuck), 0);
        assert_eq!(gateway.call_count("componentStop"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_fails_pending_waits_as_gone() {
        let gateway = manager();
        component(&gateway, "producer", Mood::Happy);
        gateway.script("producer", "componentStop", CallScript::ok());
        let session = connect(&gateway).await;
        let orchestrator = session.orchestrator();

        let stop_target = target("/default");
        let stop_action = Action::stop();
        let stop_options = ActionOptions::default();
        let (report, _) = tokio::join!(
            orchestrator.perform_action(&stop_target, &stop_action, &stop_options),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                gateway.disconnect();
            }
        );

        let report = report.expect("Action failed");
        assert_eq!(
            report.outcome_of(&AvatarId::in_flow("default", "producer")),
            Some(&TargetOutcome::Failed(TargetError::TargetGone))
        );
    }

    #[tokio::test]
    async fn disconnected_session_fails_fast() {
        let gateway = manager();
        component(&gateway, "producer", Mood::Happy);
        let session = connect(&gateway).await;

        gateway.disconnect();
        let mut status = session.status();
        status
            .wait_for(|s| matches!(s, SessionStatus::Disconnected(_)))
            .await
            .expect("Session dropped");

        let err = session
            .orchestrator()
            .perform_action(&target("/default"), &Action::stop(), &ActionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::Disconnected(_)));
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn start_waits_through_waking() {
        let gateway = manager();
        let id = component(&gateway, "producer", Mood::Sleeping);
        let session = connect(&gateway).await;

        let report = session
            .orchestrator()
            .perform_action(
                &target("/default/producer"),
                &Action::start(),
                &ActionOptions::default(),
            )
            .await
            .expect("Action failed");

        assert_eq!(
            report.targets[0].outcome,
            TargetOutcome::Done {
                mood: Some(Mood::Happy)
            }
        );
        assert_eq!(
            report.summary_line(),
            "Component now completed action start."
        );
        assert_eq!(listeners_on(&session, id), 0);
    }
}
