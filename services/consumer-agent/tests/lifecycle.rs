//! Agent lifecycle tests against the in-memory orchestrator and dispatcher.
//!
//! All tests run on paused time so reassertion cadence can be checked to the
//! second.

use std::sync::Arc;
use std::time::Duration;

use rescon_agent::workload::OrchestratorCall;
use rescon_agent::{
    Agent, AgentError, AgentSettings, AgentState, ConsumerSpec, DialKind, Levels, MockDispatcher,
    MockOrchestrator, WorkloadKind,
};
use tokio::time::Instant;

fn initial() -> Levels {
    Levels {
        cpu_millicores: 250,
        mem_megabytes: 100,
        custom_metric: 40,
    }
}

fn spec() -> ConsumerSpec {
    ConsumerSpec::dynamic("web", "e2e", WorkloadKind::Deployment, 1, initial(), 500, 200)
}

async fn start(
    orchestrator: &MockOrchestrator,
    dispatcher: &MockDispatcher,
) -> Result<Agent, AgentError> {
    Agent::start(
        spec(),
        Arc::new(orchestrator.clone()),
        Arc::new(dispatcher.clone()),
        AgentSettings::default(),
    )
    .await
}

/// Let freshly spawned dial tasks run without moving the clock noticeably.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_setup_creates_services_before_workloads() {
    let orchestrator = MockOrchestrator::new();
    let dispatcher = MockDispatcher::new();
    let agent = start(&orchestrator, &dispatcher).await.unwrap();

    assert_eq!(agent.state(), AgentState::Active);
    assert_eq!(
        orchestrator.calls().await,
        vec![
            OrchestratorCall::CreateService("web".to_string()),
            OrchestratorCall::CreateWorkload(WorkloadKind::Deployment, "web".to_string()),
            OrchestratorCall::CreateService("web-ctrl".to_string()),
            OrchestratorCall::CreateWorkload(
                WorkloadKind::ReplicationController,
                "web-ctrl".to_string()
            ),
        ]
    );

    let service = orchestrator.service("web").await.unwrap();
    assert_eq!(service.port, 80);
    assert_eq!(service.target_port, 8080);
}

#[tokio::test(start_paused = true)]
async fn test_initial_levels_dispatched_immediately_and_reasserted() {
    let orchestrator = MockOrchestrator::new();
    let dispatcher = MockDispatcher::new();
    let _agent = start(&orchestrator, &dispatcher).await.unwrap();

    settle().await;
    assert_eq!(dispatcher.levels(DialKind::Cpu).await, vec![250]);
    assert_eq!(dispatcher.levels(DialKind::Memory).await, vec![100]);
    assert_eq!(dispatcher.levels(DialKind::CustomMetric).await, vec![40]);

    tokio::time::sleep(Duration::from_secs(65)).await;
    assert_eq!(dispatcher.levels(DialKind::Cpu).await, vec![250, 250, 250]);
    assert_eq!(dispatcher.levels(DialKind::Memory).await, vec![100, 100, 100]);

    for request in dispatcher.requests().await {
        assert_eq!(request.duration_secs, 30);
        let expected_size = match request.dial {
            DialKind::Cpu => 20,
            DialKind::Memory => 100,
            DialKind::CustomMetric => 10,
        };
        assert_eq!(request.request_size, expected_size);
    }
}

#[tokio::test(start_paused = true)]
async fn test_new_level_lands_on_next_tick() {
    let orchestrator = MockOrchestrator::new();
    let dispatcher = MockDispatcher::new();
    let agent = start(&orchestrator, &dispatcher).await.unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    agent.consume_cpu(600).await.unwrap();
    agent.consume_custom_metric(90).await.unwrap();
    assert_eq!(dispatcher.levels(DialKind::Cpu).await, vec![250]);

    tokio::time::sleep(Duration::from_secs(21)).await;
    assert_eq!(dispatcher.levels(DialKind::Cpu).await, vec![250, 600]);
    assert_eq!(dispatcher.levels(DialKind::CustomMetric).await, vec![40, 90]);
    assert_eq!(dispatcher.levels(DialKind::Memory).await, vec![100, 100]);
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_deletes_everything_once() {
    let orchestrator = MockOrchestrator::new();
    let dispatcher = MockDispatcher::new();
    let agent = start(&orchestrator, &dispatcher).await.unwrap();
    settle().await;

    let report = agent.cleanup().await.unwrap();
    assert_eq!(report.state, AgentState::Cleaned);
    assert_eq!(report.dials.len(), 3);
    assert!(report.aborted.is_empty());
    assert!(report.dials.iter().all(|d| d.dispatches == 1));

    let deletes: Vec<_> = orchestrator
        .calls()
        .await
        .into_iter()
        .filter(|c| {
            matches!(
                c,
                OrchestratorCall::DeleteWorkload(..) | OrchestratorCall::DeleteService(_)
            )
        })
        .collect();
    assert_eq!(
        deletes,
        vec![
            OrchestratorCall::DeleteWorkload(WorkloadKind::Deployment, "web".to_string()),
            OrchestratorCall::DeleteService("web".to_string()),
            OrchestratorCall::DeleteWorkload(
                WorkloadKind::ReplicationController,
                "web-ctrl".to_string()
            ),
            OrchestratorCall::DeleteService("web-ctrl".to_string()),
        ]
    );
    assert!(!orchestrator.workload_exists(WorkloadKind::Deployment, "web").await);
    assert!(orchestrator.service("web-ctrl").await.is_none());

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(dispatcher.requests().await.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_attempts_all_deletions_on_failure() {
    let orchestrator = MockOrchestrator::new();
    let dispatcher = MockDispatcher::new();
    let agent = start(&orchestrator, &dispatcher).await.unwrap();
    orchestrator.fail_deletes().await;

    let err = agent.cleanup().await.unwrap_err();
    assert!(matches!(err, AgentError::Orchestrator(_)));

    let attempted = orchestrator
        .calls()
        .await
        .into_iter()
        .filter(|c| {
            matches!(
                c,
                OrchestratorCall::DeleteWorkload(..) | OrchestratorCall::DeleteService(_)
            )
        })
        .count();
    assert_eq!(attempted, 4);
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent() {
    let orchestrator = MockOrchestrator::new();
    let dispatcher = MockDispatcher::new();
    let mut agent = start(&orchestrator, &dispatcher).await.unwrap();
    settle().await;

    agent.stop();
    agent.stop();
    assert_eq!(agent.state(), AgentState::Stopping);

    settle().await;
    assert!(agent.running_dials().is_empty());
    assert!(matches!(
        agent.consume_mem(500).await,
        Err(AgentError::DialStopped(DialKind::Memory))
    ));

    tokio::time::sleep(Duration::from_secs(90)).await;
    assert_eq!(dispatcher.requests().await.len(), 3);

    let report = agent.cleanup().await.unwrap();
    assert_eq!(report.state, AgentState::Cleaned);
}

#[tokio::test(start_paused = true)]
async fn test_setup_fails_without_controller_endpoints() {
    let orchestrator = MockOrchestrator::without_ready_endpoints();
    let dispatcher = MockDispatcher::new();

    let started = Instant::now();
    let err = start(&orchestrator, &dispatcher).await.err().unwrap();

    match err {
        AgentError::NotReady { what, .. } => assert!(what.contains("web-ctrl")),
        other => panic!("unexpected error: {other}"),
    }
    assert!(started.elapsed() >= Duration::from_secs(60));
    assert!(dispatcher.requests().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_failure_is_fatal_to_agent() {
    let orchestrator = MockOrchestrator::new();
    let dispatcher = MockDispatcher::new().failing_on(DialKind::Memory);
    let agent = start(&orchestrator, &dispatcher).await.unwrap();
    settle().await;

    assert_eq!(agent.running_dials(), vec![DialKind::Cpu, DialKind::CustomMetric]);
    assert!(matches!(
        agent.failure(),
        Some(AgentError::Dispatch {
            dial: DialKind::Memory,
            ..
        })
    ));

    // Healthy dials refuse new levels too, and report the cause.
    for result in [agent.consume_mem(10).await, agent.consume_cpu(10).await] {
        let err = result.unwrap_err();
        assert!(!err.is_assertion());
        assert!(matches!(
            err,
            AgentError::Dispatch {
                dial: DialKind::Memory,
                ..
            }
        ));
    }

    let err = agent.cleanup().await.unwrap_err();
    assert!(matches!(
        err,
        AgentError::Dispatch {
            dial: DialKind::Memory,
            ..
        }
    ));
    assert!(!orchestrator.workload_exists(WorkloadKind::Deployment, "web").await);
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_failure_ends_replica_wait() {
    let orchestrator = MockOrchestrator::new();
    let dispatcher = MockDispatcher::new().failing_on(DialKind::Cpu);
    let agent = start(&orchestrator, &dispatcher).await.unwrap();

    let started = Instant::now();
    let err = agent.wait_for_replicas(3).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!err.is_assertion());
    assert!(matches!(
        err,
        AgentError::Dispatch {
            dial: DialKind::Cpu,
            ..
        }
    ));

    let err = agent
        .ensure_desired_replicas(1, Duration::from_secs(60))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Dispatch { .. }));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_failure_during_wait() {
    let orchestrator = MockOrchestrator::new();
    // The first dispatch completes after 45 s and then fails.
    let dispatcher = MockDispatcher::new()
        .with_latency(Duration::from_secs(45))
        .failing_on(DialKind::CustomMetric);
    let agent = start(&orchestrator, &dispatcher).await.unwrap();

    let started = Instant::now();
    let err = agent.wait_for_replicas(3).await.unwrap_err();
    assert!(matches!(
        err,
        AgentError::Dispatch {
            dial: DialKind::CustomMetric,
            ..
        }
    ));
    assert!(started.elapsed() >= Duration::from_secs(45));
    assert!(started.elapsed() < Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn test_stuck_dials_are_aborted_after_grace() {
    let orchestrator = MockOrchestrator::new();
    let dispatcher = MockDispatcher::new().with_latency(Duration::from_secs(60));
    let agent = start(&orchestrator, &dispatcher).await.unwrap();
    settle().await;

    let started = Instant::now();
    let report = agent.cleanup().await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(report.aborted.len(), 3);
    assert!(report.dials.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_replicas_through_agent() {
    let orchestrator = MockOrchestrator::new();
    let dispatcher = MockDispatcher::new();
    let agent = start(&orchestrator, &dispatcher).await.unwrap();
    assert_eq!(agent.get_replicas().await.unwrap(), 1);

    tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            orchestrator
                .set_replicas(WorkloadKind::Deployment, "web", 3)
                .await;
        }
    });

    agent.wait_for_replicas(3).await.unwrap();
    agent
        .ensure_desired_replicas(3, Duration::from_secs(60))
        .await
        .unwrap();
    agent.cleanup().await.unwrap();
}
