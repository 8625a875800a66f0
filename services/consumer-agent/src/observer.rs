//! Replica observer.
//!
//! Re-reads the live replica count on every query; nothing is cached.
//! `wait_for_replicas` is a convergence wait and tolerates transient
//! mismatches. `ensure_desired_replicas` is a stability assertion and fails
//! on the first sample that differs.
//!
//! An observer attached to an agent's [`DialFailures`] gives up with the
//! dispatch error as soon as any dial fails, instead of polling on.

use std::future::Future;
use std::time::Duration;

use rescon_converge::{
    ensure_stable, wait_until_equal, Convergence, PollPolicy, Stability,
    DEFAULT_STABILITY_INTERVAL, DEFAULT_WAIT_INTERVAL, DEFAULT_WAIT_TIMEOUT,
};
use tracing::{debug, info, warn};

use crate::dial::DialFailures;
use crate::error::{AgentError, Result};
use crate::workload::WorkloadHandle;

/// Poll cadence for replica queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverConfig {
    /// Deadline and poll interval for `wait_for_replicas`.
    pub wait: PollPolicy,

    /// Poll interval inside a stability window.
    pub stability_interval: Duration,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            wait: PollPolicy::new(DEFAULT_WAIT_TIMEOUT, DEFAULT_WAIT_INTERVAL),
            stability_interval: DEFAULT_STABILITY_INTERVAL,
        }
    }
}

/// Answers replica-count questions about one workload.
#[derive(Clone)]
pub struct ReplicaObserver {
    workload: WorkloadHandle,
    config: ObserverConfig,
    failures: Option<DialFailures>,
}

impl ReplicaObserver {
    pub fn new(workload: WorkloadHandle, config: ObserverConfig) -> Self {
        Self {
            workload,
            config,
            failures: None,
        }
    }

    /// Abort queries with the dial's error once any dial fails.
    pub fn with_failures(mut self, failures: DialFailures) -> Self {
        self.failures = Some(failures);
        self
    }

    async fn guarded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match &self.failures {
            Some(failures) => failures.guard(fut).await,
            None => fut.await,
        }
    }

    pub fn config(&self) -> &ObserverConfig {
        &self.config
    }

    /// Current replica count from the workload's status.
    pub async fn get_replicas(&self) -> Result<u32> {
        self.guarded(self.workload.replica_count()).await
    }

    /// Wait until the replica count equals `desired`, with the default policy.
    pub async fn wait_for_replicas(&self, desired: u32) -> Result<()> {
        self.wait_for_replicas_with(desired, self.config.wait).await
    }

    /// Wait until the replica count equals `desired`.
    pub async fn wait_for_replicas_with(&self, desired: u32, policy: PollPolicy) -> Result<()> {
        self.guarded(self.poll_replicas(desired, policy)).await
    }

    /// Assert the replica count stays at `desired` for the whole `window`.
    pub async fn ensure_desired_replicas(&self, desired: u32, window: Duration) -> Result<()> {
        self.guarded(self.check_stable(desired, window)).await
    }

    async fn poll_replicas(&self, desired: u32, policy: PollPolicy) -> Result<()> {
        let kind = self.workload.kind();
        let observer = self;
        let outcome = wait_until_equal(&desired, policy, move || async move {
            let current = observer.workload.replica_count().await?;
            if current != desired {
                info!(
                    %kind,
                    current,
                    desired,
                    "Current replicas number waiting to be desired"
                );
            }
            Ok::<_, AgentError>(current)
        })
        .await?;

        match outcome {
            Convergence::Converged { elapsed, samples } => {
                info!(
                    %kind,
                    desired,
                    samples,
                    elapsed_secs = elapsed.as_secs(),
                    "Current replicas number is equal to desired replicas number"
                );
                Ok(())
            }
            Convergence::TimedOut { last_seen, .. } => {
                warn!(%kind, desired, ?last_seen, timeout = ?policy.timeout, "Timed out waiting for replicas");
                Err(AgentError::ReplicaTimeout {
                    desired,
                    timeout: policy.timeout,
                    last_seen,
                })
            }
        }
    }

    async fn check_stable(&self, desired: u32, window: Duration) -> Result<()> {
        let observer = self;
        let interval = self.config.stability_interval;
        let outcome = ensure_stable(&desired, window, interval, move || async move {
            let actual = observer.workload.replica_count().await?;
            if actual == desired {
                debug!(desired, "Number of replicas is as expected");
            }
            Ok::<_, AgentError>(actual)
        })
        .await?;

        match outcome {
            Stability::Stable { samples } => {
                info!(desired, samples, window = ?window, "Number of replicas was stable");
                Ok(())
            }
            Stability::Deviated {
                actual, elapsed, ..
            } => {
                warn!(expected = desired, actual, elapsed = ?elapsed, "Number of replicas has changed");
                Err(AgentError::ReplicaDeviation {
                    expected: desired,
                    actual,
                    elapsed,
                })
            }
        }
    }
}
