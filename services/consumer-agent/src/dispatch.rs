//! Stimulus dispatch to the consumer controller.
//!
//! One dispatch is one blocking remote call that asks the controller to hold
//! a consumption level for a while. The call schema depends on the dial:
//!
//! | Dial | Suffix | Level param | Extra params |
//! |---|---|---|---|
//! | CPU | `ConsumeCPU` | `millicores` | `durationSec`, `requestSizeMillicores` |
//! | Memory | `ConsumeMem` | `megabytes` | `durationSec`, `requestSizeMegabytes` |
//! | Custom metric | `BumpMetric` | `delta` | `metric=QPS`, `durationSec`, `requestSizeMetrics` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::error::DispatchError;

/// Name of the custom metric bumped by the controller.
pub const CUSTOM_METRIC_NAME: &str = "QPS";

/// One of the three load dials an agent drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialKind {
    Cpu,
    Memory,
    CustomMetric,
}

impl DialKind {
    pub const ALL: [DialKind; 3] = [DialKind::Cpu, DialKind::Memory, DialKind::CustomMetric];

    /// Controller endpoint name.
    pub fn suffix(&self) -> &'static str {
        match self {
            DialKind::Cpu => "ConsumeCPU",
            DialKind::Memory => "ConsumeMem",
            DialKind::CustomMetric => "BumpMetric",
        }
    }

    /// Query parameter carrying the level.
    pub fn level_param(&self) -> &'static str {
        match self {
            DialKind::Cpu => "millicores",
            DialKind::Memory => "megabytes",
            DialKind::CustomMetric => "delta",
        }
    }

    /// Query parameter carrying the per-replica request size.
    pub fn request_size_param(&self) -> &'static str {
        match self {
            DialKind::Cpu => "requestSizeMillicores",
            DialKind::Memory => "requestSizeMegabytes",
            DialKind::CustomMetric => "requestSizeMetrics",
        }
    }

    /// Unit used in log lines.
    pub fn unit(&self) -> &'static str {
        match self {
            DialKind::Cpu => "millicores",
            DialKind::Memory => "MB",
            DialKind::CustomMetric => "QPS",
        }
    }
}

impl std::fmt::Display for DialKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialKind::Cpu => write!(f, "cpu"),
            DialKind::Memory => write!(f, "memory"),
            DialKind::CustomMetric => write!(f, "custom-metric"),
        }
    }
}

/// Parameters of a single dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StimulusRequest {
    pub dial: DialKind,
    pub level: i64,
    pub duration_secs: u64,
    pub request_size: i64,
}

impl StimulusRequest {
    /// Query parameters in the order the controller documents them.
    pub fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::with_capacity(4);
        if self.dial == DialKind::CustomMetric {
            params.push(("metric", CUSTOM_METRIC_NAME.to_string()));
        }
        params.push((self.dial.level_param(), self.level.to_string()));
        params.push(("durationSec", self.duration_secs.to_string()));
        params.push((self.dial.request_size_param(), self.request_size.to_string()));
        params
    }
}

/// Issues stimulus calls to a controller.
#[async_trait]
pub trait StimulusDispatcher: Send + Sync {
    /// Perform one call. Returns only once the call completed or failed.
    async fn dispatch(&self, request: &StimulusRequest) -> Result<(), DispatchError>;
}

/// HTTP dispatcher that POSTs to `<base>/<suffix>?<params>`.
pub struct HttpDispatcher {
    client: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpDispatcher {
    /// Dispatch through the API server's service proxy for `controller`.
    pub fn via_api_proxy(
        client: reqwest::Client,
        api_url: &str,
        namespace: &str,
        controller: &str,
        bearer_token: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url: format!(
                "{}/api/v1/namespaces/{}/services/{}/proxy",
                api_url.trim_end_matches('/'),
                namespace,
                controller
            ),
            bearer_token,
        }
    }

    /// Dispatch straight to a controller URL.
    pub fn direct(client: reqwest::Client, controller_url: &str) -> Self {
        Self {
            client,
            base_url: controller_url.trim_end_matches('/').to_string(),
            bearer_token: None,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl StimulusDispatcher for HttpDispatcher {
    async fn dispatch(&self, request: &StimulusRequest) -> Result<(), DispatchError> {
        let suffix = request.dial.suffix();
        let url = format!("{}/{}", self.base_url, suffix);
        let params = request.params();
        debug!(url = %url, ?params, "Dispatching stimulus");

        let mut builder = self.client.post(&url).query(&params);
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|source| DispatchError::Transport { suffix, source })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            error!(status, body = %body, suffix, "Stimulus call rejected");
            return Err(DispatchError::Status {
                suffix,
                status,
                body,
            });
        }

        Ok(())
    }
}

/// Recording dispatcher for tests and dry runs.
#[derive(Clone, Default)]
pub struct MockDispatcher {
    requests: Arc<Mutex<Vec<StimulusRequest>>>,
    latency: Duration,
    fail_on: Option<DialKind>,
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every dispatch for `latency` before recording it.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail every dispatch for `dial`.
    pub fn failing_on(mut self, dial: DialKind) -> Self {
        self.fail_on = Some(dial);
        self
    }

    /// All recorded requests in completion order.
    pub async fn requests(&self) -> Vec<StimulusRequest> {
        self.requests.lock().await.clone()
    }

    /// Levels recorded for one dial.
    pub async fn levels(&self, dial: DialKind) -> Vec<i64> {
        self.requests
            .lock()
            .await
            .iter()
            .filter(|r| r.dial == dial)
            .map(|r| r.level)
            .collect()
    }
}

#[async_trait]
impl StimulusDispatcher for MockDispatcher {
    async fn dispatch(&self, request: &StimulusRequest) -> Result<(), DispatchError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if self.fail_on == Some(request.dial) {
            return Err(DispatchError::Injected(format!(
                "[MOCK] {} rejected",
                request.dial.suffix()
            )));
        }

        debug!(dial = %request.dial, level = request.level, "[MOCK] Stimulus recorded");
        self.requests.lock().await.push(request.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(DialKind::Cpu, vec![("millicores", "600"), ("durationSec", "30"), ("requestSizeMillicores", "20")])]
    #[case(DialKind::Memory, vec![("megabytes", "600"), ("durationSec", "30"), ("requestSizeMegabytes", "20")])]
    #[case(DialKind::CustomMetric, vec![("metric", "QPS"), ("delta", "600"), ("durationSec", "30"), ("requestSizeMetrics", "20")])]
    fn test_request_params(#[case] dial: DialKind, #[case] expected: Vec<(&str, &str)>) {
        let request = StimulusRequest {
            dial,
            level: 600,
            duration_secs: 30,
            request_size: 20,
        };

        let params = request.params();
        let params: Vec<(&str, &str)> = params.iter().map(|(k, v)| (*k, v.as_str())).collect();
        assert_eq!(params, expected);
    }

    #[test]
    fn test_proxy_base_url() {
        let dispatcher = HttpDispatcher::via_api_proxy(
            reqwest::Client::new(),
            "https://api.local:6443/",
            "e2e-42",
            "web-ctrl",
            None,
        );
        assert_eq!(
            dispatcher.base_url(),
            "https://api.local:6443/api/v1/namespaces/e2e-42/services/web-ctrl/proxy"
        );
    }

    #[tokio::test]
    async fn test_mock_dispatcher_failing() {
        let dispatcher = MockDispatcher::new().failing_on(DialKind::Memory);
        let ok = StimulusRequest {
            dial: DialKind::Cpu,
            level: 1,
            duration_secs: 1,
            request_size: 1,
        };
        let bad = StimulusRequest {
            dial: DialKind::Memory,
            ..ok.clone()
        };

        dispatcher.dispatch(&ok).await.unwrap();
        assert!(dispatcher.dispatch(&bad).await.is_err());
        assert_eq!(dispatcher.requests().await, vec![ok]);
    }
}
