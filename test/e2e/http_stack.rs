//! End-to-end run of the agent over HTTP.
//!
//! One wiremock server plays the orchestration API server, including the
//! service proxy that forwards stimulus calls to the controller. The agent
//! uses the real REST orchestrator and HTTP dispatcher.
//!
//! ## Running
//!
//! ```bash
//! cargo test -p rescon-e2e --test http_stack
//! ```

use std::sync::Arc;
use std::time::Duration;

use rescon_agent::{
    Agent, AgentSettings, ConsumerSpec, HttpDispatcher, KubeApiOrchestrator, Levels, WorkloadKind,
};
use serde_json::json;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PROXY_PREFIX: &str = "/api/v1/namespaces/e2e/services/web-ctrl/proxy/";

async fn mount_api_server(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/v1/namespaces/e2e/services"))
        .respond_with(ResponseTemplate::new(201))
        .expect(2)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/apis/apps/v1/namespaces/e2e/deployments"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/namespaces/e2e/replicationcontrollers"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/apis/apps/v1/namespaces/e2e/deployments/web"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": { "replicas": 2 },
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces/e2e/endpoints/web-ctrl"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "subsets": [{ "addresses": [{ "ip": "10.0.0.9" }] }],
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/api/v1/namespaces/e2e/services/web-ctrl/proxy/.+$"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
    Mock::given(method("DELETE"))
        .and(path_regex(
            r"^/api/v1/namespaces/e2e/(services/web|services/web-ctrl|replicationcontrollers/web-ctrl)$",
        ))
        .respond_with(ResponseTemplate::new(200))
        .expect(3)
        .mount(server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/apis/apps/v1/namespaces/e2e/deployments/web"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(server)
        .await;
}

async fn stimulus_paths(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter_map(|r| r.url.path().strip_prefix(PROXY_PREFIX).map(str::to_string))
        .collect()
}

#[tokio::test]
async fn test_agent_over_http() {
    let server = MockServer::start().await;
    mount_api_server(&server).await;

    let client = KubeApiOrchestrator::http_client().unwrap();
    let orchestrator = Arc::new(KubeApiOrchestrator::new(
        client.clone(),
        &server.uri(),
        "e2e",
        None,
    ));
    let dispatcher = Arc::new(HttpDispatcher::via_api_proxy(
        client,
        &server.uri(),
        "e2e",
        "web-ctrl",
        None,
    ));

    let spec = ConsumerSpec::dynamic(
        "web",
        "e2e",
        WorkloadKind::Deployment,
        2,
        Levels {
            cpu_millicores: 100,
            mem_megabytes: 50,
            custom_metric: 5,
        },
        500,
        200,
    );
    let agent = Agent::start(spec, orchestrator, dispatcher, AgentSettings::default())
        .await
        .unwrap();
    assert_eq!(agent.get_replicas().await.unwrap(), 2);

    // Every dial sends its initial level right away.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut seen = stimulus_paths(&server).await;
    while seen.len() < 3 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
        seen = stimulus_paths(&server).await;
    }
    seen.sort();
    assert_eq!(seen, vec!["BumpMetric", "ConsumeCPU", "ConsumeMem"]);

    let report = agent.cleanup().await.unwrap();
    assert_eq!(report.dials.len(), 3);
}
