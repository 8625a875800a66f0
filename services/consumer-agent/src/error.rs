//! Error types for the consumer agent.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::dispatch::DialKind;

/// Errors raised by a stimulus dispatch.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The controller answered with a non-success status.
    #[error("{suffix} returned {status}: {body}")]
    Status {
        suffix: &'static str,
        status: u16,
        body: String,
    },

    /// The request never completed.
    #[error("{suffix} request failed: {source}")]
    Transport {
        suffix: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// Injected by the mock dispatcher.
    #[error("{0}")]
    Injected(String),
}

/// Errors raised by the orchestration API.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The object does not exist.
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    /// The API answered with an unexpected status.
    #[error("{operation} {name} failed with {status}: {body}")]
    Api {
        operation: &'static str,
        name: String,
        status: u16,
        body: String,
    },

    /// Transport or decode failure.
    #[error("{operation} {name}: {source}")]
    Http {
        operation: &'static str,
        name: String,
        #[source]
        source: reqwest::Error,
    },

    /// Injected by the mock orchestrator.
    #[error("{0}")]
    Injected(String),
}

/// Errors surfaced to code driving an agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A stimulus call failed. Fatal, never retried. The source is shared
    /// with every caller waiting on the agent.
    #[error("{dial} dispatch failed: {source}")]
    Dispatch {
        dial: DialKind,
        #[source]
        source: Arc<DispatchError>,
    },

    /// An orchestration call failed. Fatal, never retried.
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    /// `wait_for_replicas` ran out of time.
    #[error("timeout waiting {timeout:?} for pods size to be {desired} (last seen: {last_seen:?})")]
    ReplicaTimeout {
        desired: u32,
        timeout: Duration,
        last_seen: Option<u32>,
    },

    /// `ensure_desired_replicas` saw a different count.
    #[error("number of replicas has changed after {elapsed:?}: expected {expected}, got {actual}")]
    ReplicaDeviation {
        expected: u32,
        actual: u32,
        elapsed: Duration,
    },

    /// Unknown workload kind tag.
    #[error("invalid workload kind for resource consumer: {0}")]
    InvalidKind(String),

    /// Consumer spec rejected before anything was created.
    #[error("invalid consumer spec: {0}")]
    InvalidSpec(String),

    /// A setup step did not become ready in time.
    #[error("{what} not ready after {elapsed:?}")]
    NotReady { what: String, elapsed: Duration },

    /// The dial loop has exited and no longer accepts levels.
    #[error("{0} dial is stopped")]
    DialStopped(DialKind),

    /// The dial task panicked or was aborted.
    #[error("{dial} dial task ended abnormally: {reason}")]
    DialAborted { dial: DialKind, reason: String },
}

impl AgentError {
    /// Returns true for the named test failures (timeout, deviation) as
    /// opposed to crashes of the agent itself.
    pub fn is_assertion(&self) -> bool {
        matches!(
            self,
            Self::ReplicaTimeout { .. } | Self::ReplicaDeviation { .. }
        )
    }
}

pub type Result<T, E = AgentError> = std::result::Result<T, E>;
