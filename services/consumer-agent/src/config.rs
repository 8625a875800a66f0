//! Configuration for the consumer agent binary.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::agent::{ConsumerSpec, Levels};
use crate::workload::WorkloadKind;

/// Which consumption profile to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileName {
    Dynamic,
    Static,
}

/// Consumer agent configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Orchestration API server URL.
    pub api_url: String,

    /// Namespace the consumer runs in.
    pub namespace: String,

    /// Optional bearer token for the API server.
    pub bearer_token: Option<String>,

    /// Dispatch straight to this controller URL instead of the API proxy.
    pub controller_url: Option<String>,

    /// Consumer name; the controller is `<name>-ctrl`.
    pub name: String,

    pub kind: WorkloadKind,
    pub replicas: u32,
    pub initial: Levels,
    pub cpu_limit_millis: u64,
    pub mem_limit_mb: u64,
    pub profile: ProfileName,

    /// Hold the load this long before cleaning up. `None` waits for Ctrl-C.
    pub run_for: Option<Duration>,

    /// Wait for this replica count after start.
    pub expect_replicas: Option<u32>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    std::env::var(name)
        .ok()
        .map(|v| v.parse::<T>())
        .transpose()
        .with_context(|| format!("{name} has an invalid value."))
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let api_url = std::env::var("RESCON_API_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8001".to_string());

        let namespace =
            std::env::var("RESCON_NAMESPACE").unwrap_or_else(|_| "default".to_string());

        let bearer_token = std::env::var("RESCON_BEARER_TOKEN").ok();
        let controller_url = std::env::var("RESCON_CONTROLLER_URL").ok();

        let name = std::env::var("RESCON_NAME")
            .context("Missing consumer name. Set RESCON_NAME.")?;

        let kind = match std::env::var("RESCON_KIND") {
            Ok(v) => v.parse::<WorkloadKind>()?,
            Err(_) => WorkloadKind::Deployment,
        };

        let replicas = parse_var::<u32>("RESCON_REPLICAS")?.unwrap_or(1);

        let initial = Levels {
            cpu_millicores: parse_var("RESCON_INIT_CPU_MILLICORES")?.unwrap_or(0),
            mem_megabytes: parse_var("RESCON_INIT_MEM_MB")?.unwrap_or(0),
            custom_metric: parse_var("RESCON_INIT_CUSTOM_METRIC")?.unwrap_or(0),
        };

        let cpu_limit_millis = parse_var("RESCON_CPU_LIMIT_MILLIS")?.unwrap_or(500);
        let mem_limit_mb = parse_var("RESCON_MEM_LIMIT_MB")?.unwrap_or(200);

        let profile = match std::env::var("RESCON_PROFILE")
            .unwrap_or_else(|_| "dynamic".to_string())
            .to_lowercase()
            .as_str()
        {
            "dynamic" => ProfileName::Dynamic,
            "static" => ProfileName::Static,
            other => anyhow::bail!("RESCON_PROFILE must be 'dynamic' or 'static', got '{other}'."),
        };

        let run_for = parse_var::<u64>("RESCON_RUN_SECS")?.map(Duration::from_secs);
        let expect_replicas = parse_var::<u32>("RESCON_EXPECT_REPLICAS")?;

        let log_level = std::env::var("RESCON_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            api_url,
            namespace,
            bearer_token,
            controller_url,
            name,
            kind,
            replicas,
            initial,
            cpu_limit_millis,
            mem_limit_mb,
            profile,
            run_for,
            expect_replicas,
            log_level,
        })
    }

    /// Consumer spec described by this configuration.
    pub fn consumer_spec(&self) -> Result<ConsumerSpec> {
        match self.profile {
            ProfileName::Dynamic => Ok(ConsumerSpec::dynamic(
                &self.name,
                &self.namespace,
                self.kind,
                self.replicas,
                self.initial,
                self.cpu_limit_millis,
                self.mem_limit_mb,
            )),
            ProfileName::Static => {
                if self.kind != WorkloadKind::ReplicationController {
                    anyhow::bail!("static consumers run as a ReplicationController, not {}", self.kind);
                }
                Ok(ConsumerSpec::static_rc(
                    &self.name,
                    &self.namespace,
                    self.replicas,
                    self.initial,
                    self.cpu_limit_millis,
                    self.mem_limit_mb,
                )?)
            }
        }
    }
}
