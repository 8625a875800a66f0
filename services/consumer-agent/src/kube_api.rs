//! Orchestrator backed by a Kubernetes-style REST API.
//!
//! Only the handful of calls the agent needs are implemented: create, read
//! status and delete for the three workload kinds, create/delete services,
//! and counting ready endpoint addresses.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::error::OrchestratorError;
use crate::workload::{Orchestrator, ServiceSpec, WorkloadKind, WorkloadSpec};

/// REST client for the orchestration API server.
pub struct KubeApiOrchestrator {
    client: reqwest::Client,
    api_url: String,
    namespace: String,
    bearer_token: Option<String>,
}

impl KubeApiOrchestrator {
    pub fn new(
        client: reqwest::Client,
        api_url: &str,
        namespace: &str,
        bearer_token: Option<String>,
    ) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            namespace: namespace.to_string(),
            bearer_token,
        }
    }

    /// Build a client with the default request timeout.
    pub fn http_client() -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn collection_url(&self, kind: WorkloadKind) -> String {
        let (group, resource) = match kind {
            WorkloadKind::ReplicationController => ("api/v1", "replicationcontrollers"),
            WorkloadKind::Deployment => ("apis/apps/v1", "deployments"),
            WorkloadKind::ReplicaSet => ("apis/apps/v1", "replicasets"),
        };
        format!(
            "{}/{}/namespaces/{}/{}",
            self.api_url, group, self.namespace, resource
        )
    }

    fn core_url(&self, resource: &str) -> String {
        format!(
            "{}/api/v1/namespaces/{}/{}",
            self.api_url, self.namespace, resource
        )
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.bearer_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(
        &self,
        operation: &'static str,
        kind: &str,
        name: &str,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, OrchestratorError> {
        let response = builder.send().await.map_err(|source| OrchestratorError::Http {
            operation,
            name: name.to_string(),
            source,
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(OrchestratorError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(operation, name, status = %status, body = %body, "Orchestration call failed");
            return Err(OrchestratorError::Api {
                operation,
                name: name.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }
}

/// Object manifest for a workload of the given kind.
pub fn workload_manifest(spec: &WorkloadSpec) -> Value {
    let mut container = json!({
        "name": spec.name,
        "image": spec.image,
        "resources": {
            "requests": {
                "cpu": format!("{}m", spec.cpu_request_millis),
                "memory": spec.mem_request_bytes.to_string(),
            },
            "limits": {
                "cpu": format!("{}m", spec.cpu_limit_millis),
                "memory": spec.mem_limit_bytes.to_string(),
            },
        },
    });
    if !spec.command.is_empty() {
        container["command"] = json!(spec.command);
    }

    let template = json!({
        "metadata": { "labels": spec.labels },
        "spec": {
            "containers": [container],
            "dnsPolicy": "ClusterFirst",
        },
    });

    let selector = match spec.kind {
        WorkloadKind::ReplicationController => json!(spec.labels),
        WorkloadKind::Deployment | WorkloadKind::ReplicaSet => {
            json!({ "matchLabels": spec.labels })
        }
    };
    let api_version = match spec.kind {
        WorkloadKind::ReplicationController => "v1",
        WorkloadKind::Deployment | WorkloadKind::ReplicaSet => "apps/v1",
    };

    json!({
        "apiVersion": api_version,
        "kind": spec.kind.as_str(),
        "metadata": { "name": spec.name, "labels": spec.labels },
        "spec": {
            "replicas": spec.replicas,
            "selector": selector,
            "template": template,
        },
    })
}

/// Object manifest for a service.
pub fn service_manifest(spec: &ServiceSpec) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": spec.name },
        "spec": {
            "ports": [{ "port": spec.port, "targetPort": spec.target_port }],
            "selector": spec.selector,
        },
    })
}

#[derive(Debug, Deserialize)]
struct WorkloadObject {
    #[serde(default)]
    status: WorkloadStatus,
}

#[derive(Debug, Default, Deserialize)]
struct WorkloadStatus {
    #[serde(default)]
    replicas: u32,
}

#[derive(Debug, Deserialize)]
struct EndpointsObject {
    #[serde(default)]
    subsets: Vec<EndpointSubset>,
}

#[derive(Debug, Deserialize)]
struct EndpointSubset {
    #[serde(default)]
    addresses: Vec<Value>,
}

#[async_trait]
impl Orchestrator for KubeApiOrchestrator {
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<(), OrchestratorError> {
        info!(kind = %spec.kind, name = %spec.name, replicas = spec.replicas, "Creating workload");
        let builder = self
            .request(reqwest::Method::POST, &self.collection_url(spec.kind))
            .json(&workload_manifest(spec));
        self.send("create", spec.kind.as_str(), &spec.name, builder)
            .await?;
        Ok(())
    }

    async fn replica_count(
        &self,
        kind: WorkloadKind,
        name: &str,
    ) -> Result<u32, OrchestratorError> {
        let url = format!("{}/{}", self.collection_url(kind), name);
        let builder = self.request(reqwest::Method::GET, &url);
        let object: WorkloadObject = self
            .send("get", kind.as_str(), name, builder)
            .await?
            .json()
            .await
            .map_err(|source| OrchestratorError::Http {
                operation: "get",
                name: name.to_string(),
                source,
            })?;
        debug!(%kind, name, replicas = object.status.replicas, "Read replica count");
        Ok(object.status.replicas)
    }

    async fn delete_workload(
        &self,
        kind: WorkloadKind,
        name: &str,
    ) -> Result<(), OrchestratorError> {
        info!(%kind, name, "Deleting workload and pods");
        let url = format!("{}/{}", self.collection_url(kind), name);
        let builder = self
            .request(reqwest::Method::DELETE, &url)
            .json(&json!({ "propagationPolicy": "Foreground" }));
        self.send("delete", kind.as_str(), name, builder).await?;
        Ok(())
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<(), OrchestratorError> {
        info!(name = %spec.name, port = spec.port, target_port = spec.target_port, "Creating service");
        let builder = self
            .request(reqwest::Method::POST, &self.core_url("services"))
            .json(&service_manifest(spec));
        self.send("create", "Service", &spec.name, builder).await?;
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> Result<(), OrchestratorError> {
        info!(name, "Deleting service");
        let url = format!("{}/{}", self.core_url("services"), name);
        let builder = self.request(reqwest::Method::DELETE, &url);
        self.send("delete", "Service", name, builder).await?;
        Ok(())
    }

    async fn ready_endpoints(&self, service: &str) -> Result<usize, OrchestratorError> {
        let url = format!("{}/{}", self.core_url("endpoints"), service);
        let builder = self.request(reqwest::Method::GET, &url);
        let endpoints: EndpointsObject = self
            .send("get", "Endpoints", service, builder)
            .await?
            .json()
            .await
            .map_err(|source| OrchestratorError::Http {
                operation: "get",
                name: service.to_string(),
                source,
            })?;
        Ok(endpoints.subsets.iter().map(|s| s.addresses.len()).sum())
    }
}
