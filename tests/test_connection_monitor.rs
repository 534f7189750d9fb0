//! Connection monitor against fake inference, transcription and optimization servers

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use quill::health::ConnectionMonitor;
use quill::QuillConfig;

struct Servers {
    inference: MockServer,
    transcription: MockServer,
    optimization: MockServer,
}

async fn servers(expected_probes: u64) -> Servers {
    let inference = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"data": [{"id": "qwen/qwen3-4b-2507"}]}))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(expected_probes)
        .mount(&inference)
        .await;

    let transcription = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "healthy",
            "model_status": "loaded"
        })))
        .expect(expected_probes)
        .mount(&transcription)
        .await;

    let optimization = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "healthy",
            "dspy": {"ready": false}
        })))
        .expect(expected_probes)
        .mount(&optimization)
        .await;

    Servers {
        inference,
        transcription,
        optimization,
    }
}

fn config_for(servers: &Servers) -> QuillConfig {
    let mut config = QuillConfig::default();
    config.inference.base_url = servers.inference.uri();
    config.transcription.base_url = servers.transcription.uri();
    config.optimization.base_url = servers.optimization.uri();
    config
}

#[tokio::test]
async fn test_concurrent_checks_share_one_probe_per_subsystem() {
    let servers = servers(1).await;
    let monitor = Arc::new(ConnectionMonitor::from_config(
        &config_for(&servers),
        reqwest::Client::new(),
    ));

    let checks = (0..25).map(|_| {
        let monitor = Arc::clone(&monitor);
        async move { monitor.check_connection().await }
    });
    let results = futures::future::join_all(checks).await;

    for status in &results {
        assert!(status.is_connected);
        assert!(status.transcription.ready);
        assert!(status.optimization.running);
        assert!(!status.optimization.ready);
    }
    assert_eq!(results[0], results[24]);

    // Within the TTL the cache answers without any network activity
    let cached = monitor.check_connection().await;
    assert_eq!(cached, results[0]);
    // Mock expectations (one request each) are verified when the servers drop
}

#[tokio::test]
async fn test_refresh_forces_new_probes() {
    let servers = servers(2).await;
    let monitor = ConnectionMonitor::from_config(&config_for(&servers), reqwest::Client::new());

    monitor.check_connection().await;
    monitor.check_connection().await;
    let refreshed = monitor.refresh().await;
    assert!(refreshed.is_connected);
    assert_eq!(monitor.status(), refreshed);
}

#[tokio::test]
async fn test_unreachable_servers_degrade_status() {
    let mut config = QuillConfig::default();
    config.inference.base_url = "http://127.0.0.1:9".to_string();
    config.transcription.base_url = "http://127.0.0.1:9".to_string();
    config.optimization.base_url = "http://127.0.0.1:9".to_string();
    config.health.probe_timeout = Duration::from_millis(500);

    let monitor = ConnectionMonitor::from_config(&config, reqwest::Client::new());
    let status = monitor.check_connection().await;

    assert!(!status.is_connected);
    assert!(status.error.is_some());
    assert!(!status.transcription.running);
    assert!(!status.optimization.running);
    assert_eq!(status.optimization.port, Some(9));
}

#[tokio::test]
async fn test_subscribers_receive_snapshots() {
    let servers = servers(1).await;
    let monitor = ConnectionMonitor::from_config(&config_for(&servers), reqwest::Client::new());
    let mut receiver = monitor.subscribe();
    assert!(!receiver.borrow().is_connected);

    monitor.check_connection().await;
    receiver.changed().await.unwrap();
    assert!(receiver.borrow_and_update().is_connected);
}
