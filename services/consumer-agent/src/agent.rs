//! Resource consumer agent.
//!
//! An agent owns one consumer workload, its controller, and the three dials
//! that keep re-asserting load levels to the controller.
//!
//! ```text
//! Agent
//! ├── DialHandle(cpu)            ConsumeCPU every reassert interval
//! ├── DialHandle(memory)         ConsumeMem every reassert interval
//! ├── DialHandle(custom-metric)  BumpMetric every reassert interval
//! └── ReplicaObserver            replica waits and stability checks
//! ```
//!
//! Lifecycle: `Created → Active → Stopping → Cleaned`. `cleanup` consumes
//! the agent, so it runs at most once.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use rescon_converge::{wait_until_equal, Convergence, PollPolicy};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::dial::{spawn_dial, DialFailures, DialHandle, DialSettings, DialSummary};
use crate::dispatch::{DialKind, StimulusDispatcher};
use crate::error::{AgentError, Result};
use crate::observer::{ObserverConfig, ReplicaObserver};
use crate::workload::{Orchestrator, ServiceSpec, WorkloadHandle, WorkloadKind, WorkloadSpec};

pub const DYNAMIC_CONSUMPTION_TIME_SECS: u64 = 30;
pub const STATIC_CONSUMPTION_TIME_SECS: u64 = 3600;
pub const DYNAMIC_REQUEST_SIZE_MILLICORES: i64 = 20;
pub const DYNAMIC_REQUEST_SIZE_MEGABYTES: i64 = 100;
pub const DYNAMIC_REQUEST_SIZE_CUSTOM_METRIC: i64 = 10;

pub const SERVICE_PORT: u16 = 80;
pub const TARGET_PORT: u16 = 8080;

pub const CONSUMER_IMAGE: &str = "gcr.io/google_containers/resource_consumer:beta4";
pub const CONTROLLER_IMAGE: &str = "gcr.io/google_containers/resource_consumer/controller:beta4";

/// How long an agent may take to bring up its workloads and endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupTimeouts {
    /// Wait for a freshly created workload to report its replica count.
    pub workload: PollPolicy,

    /// Wait for the controller service to have a ready endpoint.
    pub controller_endpoints: PollPolicy,
}

impl Default for SetupTimeouts {
    fn default() -> Self {
        Self {
            workload: PollPolicy::new(Duration::from_secs(120), Duration::from_secs(5)),
            controller_endpoints: PollPolicy::new(Duration::from_secs(60), Duration::from_secs(5)),
        }
    }
}

/// Agent-wide tunables that are not part of the consumer itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentSettings {
    pub setup: SetupTimeouts,
    pub observer: ObserverConfig,

    /// Upper bound on waiting for the dial loops to exit during cleanup.
    pub shutdown_grace: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            setup: SetupTimeouts::default(),
            observer: ObserverConfig::default(),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Initial or requested levels for the three dials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Levels {
    pub cpu_millicores: i64,
    pub mem_megabytes: i64,
    pub custom_metric: i64,
}

impl Levels {
    pub fn get(&self, dial: DialKind) -> i64 {
        match dial {
            DialKind::Cpu => self.cpu_millicores,
            DialKind::Memory => self.mem_megabytes,
            DialKind::CustomMetric => self.custom_metric,
        }
    }
}

/// Reassertion cadence and per-request sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumptionProfile {
    pub consumption_time_secs: u64,
    pub request_sizes: Levels,
}

impl ConsumptionProfile {
    /// Frequent small requests: 30 s cadence, 20 m / 100 MB / 10.
    pub fn dynamic() -> Self {
        Self {
            consumption_time_secs: DYNAMIC_CONSUMPTION_TIME_SECS,
            request_sizes: Levels {
                cpu_millicores: DYNAMIC_REQUEST_SIZE_MILLICORES,
                mem_megabytes: DYNAMIC_REQUEST_SIZE_MEGABYTES,
                custom_metric: DYNAMIC_REQUEST_SIZE_CUSTOM_METRIC,
            },
        }
    }

    /// One long request per replica: 3600 s cadence, totals split evenly.
    pub fn static_for(replicas: u32, initial: &Levels) -> Result<Self> {
        if replicas == 0 {
            return Err(AgentError::InvalidSpec(
                "static consumer needs at least one replica".to_string(),
            ));
        }
        let replicas = i64::from(replicas);
        Ok(Self {
            consumption_time_secs: STATIC_CONSUMPTION_TIME_SECS,
            request_sizes: Levels {
                cpu_millicores: initial.cpu_millicores / replicas,
                mem_megabytes: initial.mem_megabytes / replicas,
                custom_metric: initial.custom_metric / replicas,
            },
        })
    }

    pub fn reassert_interval(&self) -> Duration {
        Duration::from_secs(self.consumption_time_secs)
    }

    fn dial_settings(&self, kind: DialKind) -> DialSettings {
        DialSettings {
            kind,
            request_size: self.request_sizes.get(kind),
            duration_secs: self.consumption_time_secs,
            reassert_interval: self.reassert_interval(),
        }
    }
}

/// Everything needed to stand up a resource consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub name: String,
    pub namespace: String,
    pub kind: WorkloadKind,
    pub replicas: u32,
    pub initial: Levels,

    /// Per-pod CPU request and limit in millicores.
    pub cpu_limit_millis: u64,

    /// Per-pod memory request and limit in megabytes.
    pub mem_limit_mb: u64,

    pub profile: ConsumptionProfile,
}

impl ConsumerSpec {
    /// Consumer with the dynamic profile.
    pub fn dynamic(
        name: &str,
        namespace: &str,
        kind: WorkloadKind,
        replicas: u32,
        initial: Levels,
        cpu_limit_millis: u64,
        mem_limit_mb: u64,
    ) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            kind,
            replicas,
            initial,
            cpu_limit_millis,
            mem_limit_mb,
            profile: ConsumptionProfile::dynamic(),
        }
    }

    /// Consumer with the static profile, always backed by a replication
    /// controller.
    pub fn static_rc(
        name: &str,
        namespace: &str,
        replicas: u32,
        initial: Levels,
        cpu_limit_millis: u64,
        mem_limit_mb: u64,
    ) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            kind: WorkloadKind::ReplicationController,
            replicas,
            initial,
            cpu_limit_millis,
            mem_limit_mb,
            profile: ConsumptionProfile::static_for(replicas, &initial)?,
        })
    }

    pub fn controller_name(&self) -> String {
        format!("{}-ctrl", self.name)
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(AgentError::InvalidSpec("name must not be empty".to_string()));
        }
        if self.profile.consumption_time_secs == 0 {
            return Err(AgentError::InvalidSpec(
                "consumption time must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn consumer_workload(&self) -> WorkloadSpec {
        let mem_bytes = self.mem_limit_mb * 1024 * 1024;
        WorkloadSpec {
            kind: self.kind,
            name: self.name.clone(),
            replicas: self.replicas,
            cpu_request_millis: self.cpu_limit_millis,
            cpu_limit_millis: self.cpu_limit_millis,
            mem_request_bytes: mem_bytes,
            mem_limit_bytes: mem_bytes,
            image: CONSUMER_IMAGE.to_string(),
            command: vec![],
            labels: name_selector(&self.name),
        }
    }

    fn controller_workload(&self) -> WorkloadSpec {
        let controller = self.controller_name();
        WorkloadSpec {
            kind: WorkloadKind::ReplicationController,
            name: controller.clone(),
            replicas: 1,
            cpu_request_millis: 0,
            cpu_limit_millis: 0,
            mem_request_bytes: 0,
            mem_limit_bytes: 0,
            image: CONTROLLER_IMAGE.to_string(),
            command: vec![
                "/controller".to_string(),
                format!("--consumer-service-name={}", self.name),
                format!("--consumer-service-namespace={}", self.namespace),
                format!("--consumer-port={SERVICE_PORT}"),
            ],
            labels: name_selector(&controller),
        }
    }
}

fn name_selector(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("name".to_string(), name.to_string())])
}

fn service_for(name: &str) -> ServiceSpec {
    ServiceSpec {
        name: name.to_string(),
        port: SERVICE_PORT,
        target_port: TARGET_PORT,
        selector: name_selector(name),
    }
}

/// Agent lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Setup in progress. Transient: `Agent::start` only returns an agent
    /// that is already `Active`.
    Created,
    /// Dials running.
    Active,
    /// Dials told to exit.
    Stopping,
    /// Workloads and services deleted.
    Cleaned,
}

/// Outcome of a successful cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    /// Summaries of dials that exited within the grace period.
    pub dials: Vec<DialSummary>,

    /// Dials aborted after the grace period expired.
    pub aborted: Vec<DialKind>,

    pub state: AgentState,
}

/// A running resource consumer.
pub struct Agent {
    spec: ConsumerSpec,
    settings: AgentSettings,
    state: AgentState,
    orchestrator: Arc<dyn Orchestrator>,
    consumer: WorkloadHandle,
    controller: WorkloadHandle,
    observer: ReplicaObserver,
    dials: Vec<DialHandle>,
    failures: DialFailures,
    shutdown_tx: watch::Sender<bool>,
}

impl Agent {
    /// Create the consumer and controller, wait for them, and start the dials.
    pub async fn start(
        spec: ConsumerSpec,
        orchestrator: Arc<dyn Orchestrator>,
        dispatcher: Arc<dyn StimulusDispatcher>,
        settings: AgentSettings,
    ) -> Result<Self> {
        spec.validate()?;

        info!(
            agent = %spec.name,
            kind = %spec.kind,
            replicas = spec.replicas,
            "Running consuming workload"
        );

        let consumer = WorkloadHandle::new(spec.kind, spec.name.clone(), Arc::clone(&orchestrator));
        orchestrator.create_service(&service_for(&spec.name)).await?;
        consumer.create(&spec.consumer_workload()).await?;
        wait_for_workload(&consumer, spec.replicas, settings.setup.workload).await?;

        info!(agent = %spec.name, controller = %spec.controller_name(), "Running controller");
        let controller = WorkloadHandle::new(
            WorkloadKind::ReplicationController,
            spec.controller_name(),
            Arc::clone(&orchestrator),
        );
        orchestrator
            .create_service(&service_for(&spec.controller_name()))
            .await?;
        controller.create(&spec.controller_workload()).await?;
        wait_for_endpoints(
            orchestrator.as_ref(),
            &spec.controller_name(),
            settings.setup.controller_endpoints,
        )
        .await?;

        let failures = DialFailures::new();
        let observer = ReplicaObserver::new(consumer.clone(), settings.observer)
            .with_failures(failures.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut agent = Self {
            spec,
            settings,
            state: AgentState::Created,
            orchestrator,
            consumer,
            controller,
            observer,
            dials: Vec::with_capacity(DialKind::ALL.len()),
            failures,
            shutdown_tx,
        };

        for kind in DialKind::ALL {
            let dial = spawn_dial(
                &agent.spec.name,
                agent.spec.profile.dial_settings(kind),
                agent.spec.initial.get(kind),
                Arc::clone(&dispatcher),
                shutdown_rx.clone(),
                agent.failures.clone(),
            );
            agent.dials.push(dial);
        }
        agent.state = AgentState::Active;

        info!(agent = %agent.spec.name, "Resource consumer active");
        Ok(agent)
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ConsumerSpec {
        &self.spec
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn observer(&self) -> &ReplicaObserver {
        &self.observer
    }

    fn dial(&self, kind: DialKind) -> Result<&DialHandle> {
        self.dials
            .iter()
            .find(|d| d.kind() == kind)
            .ok_or(AgentError::DialStopped(kind))
    }

    /// Set a dial's target. Blocks while that dial has a dispatch in flight.
    ///
    /// Fails with the dispatch error once any dial of this agent has failed.
    pub async fn set_level(&self, kind: DialKind, level: i64) -> Result<()> {
        if self.state != AgentState::Active {
            return Err(AgentError::DialStopped(kind));
        }
        info!(agent = %self.spec.name, dial = %kind, level, unit = kind.unit(), "Consume in total");
        let dial = self.dial(kind)?;
        self.failures.guard(dial.set_level(level)).await
    }

    pub async fn consume_cpu(&self, millicores: i64) -> Result<()> {
        self.set_level(DialKind::Cpu, millicores).await
    }

    pub async fn consume_mem(&self, megabytes: i64) -> Result<()> {
        self.set_level(DialKind::Memory, megabytes).await
    }

    pub async fn consume_custom_metric(&self, amount: i64) -> Result<()> {
        self.set_level(DialKind::CustomMetric, amount).await
    }

    pub async fn get_replicas(&self) -> Result<u32> {
        self.observer.get_replicas().await
    }

    pub async fn wait_for_replicas(&self, desired: u32) -> Result<()> {
        self.observer.wait_for_replicas(desired).await
    }

    pub async fn ensure_desired_replicas(&self, desired: u32, window: Duration) -> Result<()> {
        self.observer.ensure_desired_replicas(desired, window).await
    }

    /// First dispatch failure of any dial, if one happened.
    pub fn failure(&self) -> Option<AgentError> {
        self.failures.first()
    }

    /// Resolve with the dispatch error as soon as any dial fails.
    pub async fn wait_for_failure(&self) -> AgentError {
        self.failures.wait().await
    }

    /// Kinds of dials whose loops are still running.
    pub fn running_dials(&self) -> Vec<DialKind> {
        self.dials
            .iter()
            .filter(|d| d.is_running())
            .map(|d| d.kind())
            .collect()
    }

    /// Tell every dial to exit. Safe to call any number of times.
    pub fn stop(&mut self) {
        self.shutdown_tx.send_replace(true);
        if self.state == AgentState::Active {
            info!(agent = %self.spec.name, "Stopping dials");
            self.state = AgentState::Stopping;
        }
    }

    /// Stop the dials, wait for them, and delete everything the agent created.
    ///
    /// All four deletions are attempted even if one fails; the first
    /// deletion error is returned. A dial that failed while running is
    /// reported after successful deletions.
    pub async fn cleanup(mut self) -> Result<CleanupReport> {
        info!(agent = %self.spec.name, "Removing consuming workload");
        self.stop();

        let dials = std::mem::take(&mut self.dials);
        let aborts: Vec<_> = dials
            .iter()
            .map(|d| (d.kind(), d.abort_handle()))
            .collect();

        let mut summaries = Vec::new();
        let mut aborted = Vec::new();
        let mut dial_failure = None;

        match tokio::time::timeout(
            self.settings.shutdown_grace,
            join_all(dials.into_iter().map(DialHandle::join)),
        )
        .await
        {
            Ok(results) => {
                for result in results {
                    match result {
                        Ok(summary) => summaries.push(summary),
                        Err(e) => {
                            error!(agent = %self.spec.name, error = %e, "Dial failed during run");
                            dial_failure.get_or_insert(e);
                        }
                    }
                }
            }
            Err(_) => {
                warn!(
                    agent = %self.spec.name,
                    grace_secs = self.settings.shutdown_grace.as_secs(),
                    "Dials did not exit within grace period, aborting"
                );
                for (kind, handle) in aborts {
                    if !handle.is_finished() {
                        handle.abort();
                        aborted.push(kind);
                    }
                }
            }
        }

        let deletions = [
            self.consumer.delete().await,
            self.orchestrator
                .delete_service(&self.spec.name)
                .await
                .map_err(AgentError::from),
            self.controller.delete().await,
            self.orchestrator
                .delete_service(&self.spec.controller_name())
                .await
                .map_err(AgentError::from),
        ];

        let mut first_error = None;
        for result in deletions {
            if let Err(e) = result {
                error!(agent = %self.spec.name, error = %e, "Cleanup deletion failed");
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        if let Some(e) = dial_failure {
            return Err(e);
        }

        self.state = AgentState::Cleaned;
        info!(agent = %self.spec.name, "Resource consumer cleaned up");

        Ok(CleanupReport {
            dials: summaries,
            aborted,
            state: self.state,
        })
    }
}

async fn wait_for_workload(handle: &WorkloadHandle, replicas: u32, policy: PollPolicy) -> Result<()> {
    let outcome = wait_until_equal(&replicas, policy, move || handle.replica_count()).await?;
    match outcome {
        Convergence::Converged { .. } => Ok(()),
        Convergence::TimedOut { elapsed, .. } => Err(AgentError::NotReady {
            what: format!("{} {}", handle.kind(), handle.name()),
            elapsed,
        }),
    }
}

async fn wait_for_endpoints(
    orchestrator: &dyn Orchestrator,
    service: &str,
    policy: PollPolicy,
) -> Result<()> {
    let outcome = wait_until_equal(&true, policy, move || async move {
        let ready = orchestrator.ready_endpoints(service).await?;
        Ok::<_, AgentError>(ready >= 1)
    })
    .await?;
    match outcome {
        Convergence::Converged { .. } => Ok(()),
        Convergence::TimedOut { elapsed, .. } => Err(AgentError::NotReady {
            what: format!("endpoints for service {service}"),
            elapsed,
        }),
    }
}
