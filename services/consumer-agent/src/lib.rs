//! Resource consumer agent library.
//!
//! Drives synthetic CPU, memory and custom-metric load into a workload under
//! test so an external autoscaler reacts to a controllable signal, and
//! observes the replica count to check how it reacted.
//!
//! ## Architecture
//!
//! ```text
//! Agent
//! ├── Dial(cpu | memory | custom-metric)  -> StimulusDispatcher -> controller
//! └── ReplicaObserver                     -> WorkloadHandle -> Orchestrator
//! ```
//!
//! ## Modules
//!
//! - `agent`: lifecycle, setup and teardown
//! - `dial`: per-metric control loops
//! - `dispatch`: stimulus calls to the controller
//! - `observer`: replica convergence waits and stability checks
//! - `workload`: orchestration capability and in-memory mock
//! - `kube_api`: REST-backed orchestrator

pub mod agent;
pub mod config;
pub mod dial;
pub mod dispatch;
pub mod error;
pub mod kube_api;
pub mod observer;
pub mod workload;

// Re-export commonly used types
pub use agent::{
    Agent, AgentSettings, AgentState, CleanupReport, ConsumerSpec, ConsumptionProfile, Levels,
};
pub use dispatch::{DialKind, HttpDispatcher, MockDispatcher, StimulusDispatcher, StimulusRequest};
pub use error::{AgentError, DispatchError, OrchestratorError};
pub use kube_api::KubeApiOrchestrator;
pub use observer::{ObserverConfig, ReplicaObserver};
pub use workload::{MockOrchestrator, Orchestrator, WorkloadHandle, WorkloadKind};
