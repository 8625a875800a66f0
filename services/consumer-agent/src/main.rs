//! Resource consumer agent
//!
//! Stands up one resource consumer against an orchestration API, keeps its
//! load levels asserted until told to stop, then removes everything it
//! created.
//!
//! ## Flow
//!
//! - **Setup**: consumer service and workload, controller service and workload
//! - **Dials**: CPU, memory and custom metric re-asserted on their own timers
//! - **Observation**: optional wait for an expected replica count
//! - **Cleanup**: dials stopped and joined, workloads and services deleted

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rescon_agent::config::Config;
use rescon_agent::{Agent, AgentSettings, HttpDispatcher, KubeApiOrchestrator, StimulusDispatcher};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        name = %config.name,
        kind = %config.kind,
        namespace = %config.namespace,
        api_url = %config.api_url,
        "Starting resource consumer agent"
    );

    let spec = config.consumer_spec()?;
    let client = KubeApiOrchestrator::http_client().context("Failed to build HTTP client")?;

    let orchestrator = Arc::new(KubeApiOrchestrator::new(
        client.clone(),
        &config.api_url,
        &config.namespace,
        config.bearer_token.clone(),
    ));

    let dispatcher: Arc<dyn StimulusDispatcher> = match &config.controller_url {
        Some(url) => Arc::new(HttpDispatcher::direct(client, url)),
        None => Arc::new(HttpDispatcher::via_api_proxy(
            client,
            &config.api_url,
            &config.namespace,
            &spec.controller_name(),
            config.bearer_token.clone(),
        )),
    };

    let agent = Agent::start(spec, orchestrator, dispatcher, AgentSettings::default()).await?;

    let observed = async {
        if let Some(desired) = config.expect_replicas {
            agent.wait_for_replicas(desired).await?;
        }
        let hold = async {
            match config.run_for {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            e = agent.wait_for_failure() => Err(e),
            () = hold => Ok::<_, rescon_agent::AgentError>(()),
        }
    };

    // Stop early on Ctrl-C even while waiting for replicas
    let outcome = tokio::select! {
        result = observed => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            Ok(())
        }
    };

    if let Err(e) = &outcome {
        error!(error = %e, "Observation failed");
    }

    let report = agent.cleanup().await?;
    info!(
        dials = report.dials.len(),
        aborted = report.aborted.len(),
        "Resource consumer agent shutdown complete"
    );

    outcome.map_err(Into::into)
}
