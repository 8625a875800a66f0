//! Workload handle and orchestration capability.
//!
//! The orchestration API that runs the consumer pods is an external
//! collaborator. The agent only needs a handful of operations from it, so
//! they sit behind the [`Orchestrator`] trait:
//!
//! - workloads: create, read replica count, delete
//! - services: create, delete, count ready endpoints
//!
//! [`WorkloadHandle`] binds a kind and a name to an orchestrator once, so no
//! call site has to switch on the kind again.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{AgentError, OrchestratorError};

/// Object type backing a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkloadKind {
    ReplicationController,
    Deployment,
    ReplicaSet,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::ReplicationController => "ReplicationController",
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::ReplicaSet => "ReplicaSet",
        }
    }
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadKind {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "replicationcontroller" | "rc" => Ok(WorkloadKind::ReplicationController),
            "deployment" => Ok(WorkloadKind::Deployment),
            "replicaset" | "rs" => Ok(WorkloadKind::ReplicaSet),
            _ => Err(AgentError::InvalidKind(s.to_string())),
        }
    }
}

/// Desired shape of a workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSpec {
    pub kind: WorkloadKind,
    pub name: String,
    pub replicas: u32,
    pub cpu_request_millis: u64,
    pub cpu_limit_millis: u64,
    pub mem_request_bytes: u64,
    pub mem_limit_bytes: u64,
    pub image: String,
    /// Empty means the image entrypoint.
    pub command: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

/// Desired shape of a service fronting a workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub port: u16,
    pub target_port: u16,
    pub selector: BTreeMap<String, String>,
}

/// Orchestration operations used by the agent.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<(), OrchestratorError>;

    /// Observed replica count from the object's status.
    async fn replica_count(&self, kind: WorkloadKind, name: &str)
        -> Result<u32, OrchestratorError>;

    /// Delete the workload together with its pods.
    async fn delete_workload(&self, kind: WorkloadKind, name: &str)
        -> Result<(), OrchestratorError>;

    async fn create_service(&self, spec: &ServiceSpec) -> Result<(), OrchestratorError>;

    async fn delete_service(&self, name: &str) -> Result<(), OrchestratorError>;

    /// Number of ready endpoint addresses behind a service.
    async fn ready_endpoints(&self, service: &str) -> Result<usize, OrchestratorError>;
}

/// A named workload of a fixed kind.
#[derive(Clone)]
pub struct WorkloadHandle {
    kind: WorkloadKind,
    name: String,
    orchestrator: Arc<dyn Orchestrator>,
}

impl WorkloadHandle {
    pub fn new(kind: WorkloadKind, name: impl Into<String>, orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self {
            kind,
            name: name.into(),
            orchestrator,
        }
    }

    pub fn kind(&self) -> WorkloadKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create the workload. The spec's kind and name must match the handle.
    pub async fn create(&self, spec: &WorkloadSpec) -> Result<(), AgentError> {
        if spec.kind != self.kind || spec.name != self.name {
            return Err(AgentError::InvalidSpec(format!(
                "spec {} {} does not match handle {} {}",
                spec.kind, spec.name, self.kind, self.name
            )));
        }
        self.orchestrator.create_workload(spec).await?;
        Ok(())
    }

    pub async fn replica_count(&self) -> Result<u32, AgentError> {
        Ok(self.orchestrator.replica_count(self.kind, &self.name).await?)
    }

    pub async fn delete(&self) -> Result<(), AgentError> {
        self.orchestrator.delete_workload(self.kind, &self.name).await?;
        Ok(())
    }
}

/// Operations recorded by [`MockOrchestrator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorCall {
    CreateWorkload(WorkloadKind, String),
    DeleteWorkload(WorkloadKind, String),
    CreateService(String),
    DeleteService(String),
}

#[derive(Default)]
struct MockState {
    workloads: HashMap<(WorkloadKind, String), u32>,
    services: HashMap<String, ServiceSpec>,
    endpoints: HashMap<String, usize>,
    calls: Vec<OrchestratorCall>,
    fail_deletes: bool,
    endpoints_ready_on_create: bool,
}

/// In-memory orchestrator for tests and development.
///
/// New workloads report their requested replica count right away and new
/// services get one ready endpoint, unless told otherwise.
#[derive(Clone)]
pub struct MockOrchestrator {
    state: Arc<RwLock<MockState>>,
}

impl MockOrchestrator {
    pub fn new() -> Self {
        Self::with_endpoints_ready(true)
    }

    /// Services start without ready endpoints until
    /// [`set_ready_endpoints`](Self::set_ready_endpoints) is called.
    pub fn without_ready_endpoints() -> Self {
        Self::with_endpoints_ready(false)
    }

    fn with_endpoints_ready(ready: bool) -> Self {
        Self {
            state: Arc::new(RwLock::new(MockState {
                endpoints_ready_on_create: ready,
                ..MockState::default()
            })),
        }
    }

    /// Fail every delete call.
    pub async fn fail_deletes(&self) {
        self.state.write().await.fail_deletes = true;
    }

    /// Overwrite the observed replica count of an existing workload.
    pub async fn set_replicas(&self, kind: WorkloadKind, name: &str, replicas: u32) {
        let mut state = self.state.write().await;
        if let Some(count) = state.workloads.get_mut(&(kind, name.to_string())) {
            *count = replicas;
        }
    }

    pub async fn set_ready_endpoints(&self, service: &str, ready: usize) {
        self.state
            .write()
            .await
            .endpoints
            .insert(service.to_string(), ready);
    }

    pub async fn calls(&self) -> Vec<OrchestratorCall> {
        self.state.read().await.calls.clone()
    }

    pub async fn workload_exists(&self, kind: WorkloadKind, name: &str) -> bool {
        self.state
            .read()
            .await
            .workloads
            .contains_key(&(kind, name.to_string()))
    }

    pub async fn service(&self, name: &str) -> Option<ServiceSpec> {
        self.state.read().await.services.get(name).cloned()
    }
}

impl Default for MockOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<(), OrchestratorError> {
        info!(kind = %spec.kind, name = %spec.name, replicas = spec.replicas, "[MOCK] Creating workload");
        let mut state = self.state.write().await;
        state
            .workloads
            .insert((spec.kind, spec.name.clone()), spec.replicas);
        state
            .calls
            .push(OrchestratorCall::CreateWorkload(spec.kind, spec.name.clone()));
        Ok(())
    }

    async fn replica_count(
        &self,
        kind: WorkloadKind,
        name: &str,
    ) -> Result<u32, OrchestratorError> {
        let state = self.state.read().await;
        let count = state
            .workloads
            .get(&(kind, name.to_string()))
            .copied()
            .ok_or_else(|| OrchestratorError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            })?;
        debug!(%kind, name, count, "[MOCK] Replica count");
        Ok(count)
    }

    async fn delete_workload(
        &self,
        kind: WorkloadKind,
        name: &str,
    ) -> Result<(), OrchestratorError> {
        let mut state = self.state.write().await;
        state
            .calls
            .push(OrchestratorCall::DeleteWorkload(kind, name.to_string()));
        if state.fail_deletes {
            return Err(OrchestratorError::Injected(format!(
                "[MOCK] delete {kind} {name} rejected"
            )));
        }
        state
            .workloads
            .remove(&(kind, name.to_string()))
            .map(|_| ())
            .ok_or_else(|| OrchestratorError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            })
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<(), OrchestratorError> {
        let mut state = self.state.write().await;
        let ready = usize::from(state.endpoints_ready_on_create);
        state.services.insert(spec.name.clone(), spec.clone());
        state.endpoints.entry(spec.name.clone()).or_insert(ready);
        state
            .calls
            .push(OrchestratorCall::CreateService(spec.name.clone()));
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> Result<(), OrchestratorError> {
        let mut state = self.state.write().await;
        state
            .calls
            .push(OrchestratorCall::DeleteService(name.to_string()));
        if state.fail_deletes {
            return Err(OrchestratorError::Injected(format!(
                "[MOCK] delete service {name} rejected"
            )));
        }
        state.endpoints.remove(name);
        state
            .services
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| OrchestratorError::NotFound {
                kind: "Service".to_string(),
                name: name.to_string(),
            })
    }

    async fn ready_endpoints(&self, service: &str) -> Result<usize, OrchestratorError> {
        let state = self.state.read().await;
        if !state.services.contains_key(service) {
            return Err(OrchestratorError::NotFound {
                kind: "Endpoints".to_string(),
                name: service.to_string(),
            });
        }
        Ok(state.endpoints.get(service).copied().unwrap_or(0))
    }
}
