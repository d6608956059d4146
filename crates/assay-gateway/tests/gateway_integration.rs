#![allow(clippy::unwrap_used, clippy::expect_used)]

use assay_core::WorkerResultEnvelope;
use assay_gateway::{verify_signature, AuthConfig, GatewayServer, WebhookNotifier, SIGNATURE_HEADER};
use assay_orchestrator::{CapabilityRegistry, InProcessTransport, Orchestrator};
use assay_resilience::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Start a gateway on a random port with in-process regression and security
/// workers. Returns the base URL and the orchestrator.
async fn start_test_server(auth: AuthConfig) -> (String, Arc<Orchestrator>) {
    let transport = Arc::new(InProcessTransport::new());
    transport.spawn_worker("assay.regression", |env| async move {
        WorkerResultEnvelope::succeeded(env.scenario_id, 0.9, "all green")
    });
    transport.spawn_worker("assay.security", |env| async move {
        WorkerResultEnvelope::failed(env.scenario_id, "XSS in search box")
    });

    let orchestrator = Orchestrator::builder(
        Arc::new(CapabilityRegistry::with_defaults().unwrap()),
        transport,
    )
    .retry(RetryPolicy::none())
    .notifier(Arc::new(WebhookNotifier::new(Duration::from_secs(5)).unwrap()))
    .build()
    .unwrap();
    let app = GatewayServer::build_with_auth(orchestrator.clone(), auth);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://127.0.0.1:{}", addr.port()), orchestrator)
}

async fn wait_for_terminal(client: &reqwest::Client, url: &str) -> serde_json::Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let body: serde_json::Value = client.get(url).send().await.unwrap().json().await.unwrap();
            if body["status"] == "completed" || body["status"] == "failed" {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_submit_and_poll() {
    let (base, _orch) = start_test_server(AuthConfig::default()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/tasks"))
        .json(&serde_json::json!({
            "title": "Search page",
            "description": "Scenario: results render [@regression]\nScenario: input is escaped [@security] [priority: critical]",
            "priority": "high",
            "businessGoals": ["trustworthy search"]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let receipt: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(receipt["status"], "pending");
    assert_eq!(receipt["scenarios"].as_array().unwrap().len(), 2);
    let task_id = receipt["taskId"].as_str().unwrap().to_string();

    let record = wait_for_terminal(&client, &format!("{base}/tasks/{task_id}")).await;
    assert_eq!(record["status"], "completed");
    assert_eq!(record["sessionId"], receipt["sessionId"]);

    let verification = &record["result"]["verification"];
    // (3 * 0.9 + 4 * 0) / 7
    let score = verification["overallScore"].as_f64().unwrap();
    assert!((score - 2.7 / 7.0).abs() < 1e-9);
    assert_eq!(verification["confidence"], "low");
    assert_eq!(record["result"]["scenarios"][1]["status"], "failed");
    assert_eq!(
        record["result"]["scenarios"][1]["failure"]["kind"],
        "worker_failed"
    );
}

#[tokio::test]
async fn test_bad_requests() {
    let (base, _orch) = start_test_server(AuthConfig::default()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/tasks"))
        .json(&serde_json::json!({"title": "", "description": "", "priority": "low"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["kind"], "bad_request");

    // Missing priority is rejected by the JSON extractor.
    let resp = client
        .post(format!("{base}/tasks"))
        .json(&serde_json::json!({"title": "x"}))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_client_error());

    let resp = client
        .get(format!("{base}/tasks/not-a-uuid"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .get(format!("{base}/tasks/{}", uuid::Uuid::new_v4()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_heartbeat_and_health() {
    let (base, _orch) = start_test_server(AuthConfig::default()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/workers/sast/heartbeat"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .post(format!("{base}/workers/unknown-agent/heartbeat"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let health: serde_json::Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let security = health["capabilities"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["capability"] == "security-scan")
        .unwrap();
    assert_eq!(security["liveness"], "alive");
    assert_eq!(health["circuits"][0]["state"], "CLOSED");
}

#[tokio::test]
async fn test_auth_guards_api_but_not_health() {
    let (base, _orch) = start_test_server(AuthConfig::new(vec!["secret-key".into()])).await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client.get(format!("{base}/agents")).send().await.unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .get(format!("{base}/agents"))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .get(format!("{base}/agents"))
        .bearer_auth("secret-key")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let agents: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(agents.as_array().unwrap().len(), 6);
}

#[tokio::test]
async fn test_submissions_rejected_while_draining() {
    let (base, orch) = start_test_server(AuthConfig::default()).await;
    orch.shutdown().trigger();

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/tasks"))
        .json(&serde_json::json!({"title": "late", "priority": "low"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["kind"], "shutting_down");
}

#[tokio::test]
async fn test_signed_webhook_delivery() {
    let receiver = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/qa"))
        .and(header_exists("x-signature"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&receiver)
        .await;

    let (base, _orch) = start_test_server(AuthConfig::default()).await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/tasks"))
        .json(&serde_json::json!({
            "title": "Smoke",
            "description": "Scenario: homepage loads [@regression]",
            "priority": "medium",
            "callbackUrl": format!("{}/hooks/qa", receiver.uri()),
            "callbackSecret": "hook-secret"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);

    let requests = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let received = receiver.received_requests().await.unwrap_or_default();
            if !received.is_empty() {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let hook = &requests[0];
    let signature = hook
        .headers
        .get(SIGNATURE_HEADER)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(verify_signature("hook-secret", &hook.body, signature));

    let body: serde_json::Value = serde_json::from_slice(&hook.body).unwrap();
    assert_eq!(body["status"], "completed");
    assert!(body.get("callback").is_none());
    assert!(!String::from_utf8_lossy(&hook.body).contains("hook-secret"));
}

#[tokio::test]
async fn test_webhook_failure_leaves_record_intact() {
    let receiver = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&receiver)
        .await;

    let (base, _orch) = start_test_server(AuthConfig::default()).await;
    let client = reqwest::Client::new();
    let receipt: serde_json::Value = client
        .post(format!("{base}/tasks"))
        .json(&serde_json::json!({
            "title": "Smoke",
            "description": "Scenario: homepage loads [@regression]",
            "priority": "medium",
            "callbackUrl": receiver.uri(),
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let url = format!("{base}/tasks/{}", receipt["taskId"].as_str().unwrap());
    let record = wait_for_terminal(&client, &url).await;
    assert_eq!(record["status"], "completed");

    // Give the delivery attempt time to finish, then confirm nothing changed.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let again: serde_json::Value = client.get(&url).send().await.unwrap().json().await.unwrap();
    assert_eq!(again["status"], "completed");
    assert_eq!(again["updatedAt"], record["updatedAt"]);
}
