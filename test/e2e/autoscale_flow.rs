//! End-to-end autoscaling flow against a simulated autoscaler.
//!
//! The autoscaler reads the last CPU level the controller received and
//! sizes the consumer workload at one replica per 250 millicores. The test
//! drives the agent the way an autoscaling suite would:
//!
//! 1. Start a consumer at 250 millicores (one replica)
//! 2. Raise CPU to 750 and wait for three replicas
//! 3. Check the count holds for a minute
//! 4. Drop CPU back and wait for one replica
//! 5. Clean up
//!
//! ## Running
//!
//! ```bash
//! cargo test -p rescon-e2e --test autoscale_flow
//! ```

use std::sync::Arc;
use std::time::Duration;

use rescon_agent::{
    Agent, AgentError, AgentSettings, ConsumerSpec, DialKind, Levels, MockDispatcher,
    MockOrchestrator, WorkloadKind,
};
use tokio::task::JoinHandle;

const MILLICORES_PER_REPLICA: i64 = 250;
const AUTOSCALER_PERIOD: Duration = Duration::from_secs(15);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,rescon_agent=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Periodically size `name` from the CPU level the controller last saw.
fn spawn_autoscaler(
    orchestrator: MockOrchestrator,
    dispatcher: MockDispatcher,
    kind: WorkloadKind,
    name: &'static str,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(AUTOSCALER_PERIOD).await;
            let Some(level) = dispatcher.levels(DialKind::Cpu).await.last().copied() else {
                continue;
            };
            let desired = (level + MILLICORES_PER_REPLICA - 1) / MILLICORES_PER_REPLICA;
            let desired = u32::try_from(desired.max(1)).unwrap_or(u32::MAX);
            tracing::debug!(level, desired, "Autoscaler tick");
            orchestrator.set_replicas(kind, name, desired).await;
        }
    })
}

#[tokio::test(start_paused = true)]
async fn test_scale_up_hold_and_scale_down() -> Result<(), AgentError> {
    init_tracing();

    let orchestrator = MockOrchestrator::new();
    let dispatcher = MockDispatcher::new();
    let spec = ConsumerSpec::dynamic(
        "rc-light",
        "e2e-autoscaling",
        WorkloadKind::Deployment,
        1,
        Levels {
            cpu_millicores: 250,
            mem_megabytes: 0,
            custom_metric: 0,
        },
        500,
        200,
    );

    let agent = Agent::start(
        spec,
        Arc::new(orchestrator.clone()),
        Arc::new(dispatcher.clone()),
        AgentSettings::default(),
    )
    .await?;
    let autoscaler = spawn_autoscaler(
        orchestrator.clone(),
        dispatcher.clone(),
        WorkloadKind::Deployment,
        "rc-light",
    );

    agent.wait_for_replicas(1).await?;

    agent.consume_cpu(750).await?;
    agent.wait_for_replicas(3).await?;
    agent
        .ensure_desired_replicas(3, Duration::from_secs(60))
        .await?;

    agent.consume_cpu(250).await?;
    agent.wait_for_replicas(1).await?;

    autoscaler.abort();
    let report = agent.cleanup().await?;
    assert!(report.aborted.is_empty());

    let cpu = dispatcher.levels(DialKind::Cpu).await;
    assert_eq!(cpu.first(), Some(&250));
    assert!(cpu.contains(&750));
    assert!(!orchestrator
        .workload_exists(WorkloadKind::Deployment, "rc-light")
        .await);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unreached_target_times_out() {
    init_tracing();

    let orchestrator = MockOrchestrator::new();
    let dispatcher = MockDispatcher::new();
    let spec = ConsumerSpec::dynamic(
        "rc-stuck",
        "e2e-autoscaling",
        WorkloadKind::ReplicaSet,
        2,
        Levels::default(),
        500,
        200,
    );

    let agent = Agent::start(
        spec,
        Arc::new(orchestrator.clone()),
        Arc::new(dispatcher.clone()),
        AgentSettings::default(),
    )
    .await
    .unwrap();

    // No autoscaler runs, so the count stays at 2.
    let err = agent.wait_for_replicas(5).await.unwrap_err();
    assert!(err.is_assertion());
    assert!(matches!(
        err,
        AgentError::ReplicaTimeout {
            desired: 5,
            last_seen: Some(2),
            ..
        }
    ));

    agent.cleanup().await.unwrap();
}
