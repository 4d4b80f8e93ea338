//! Failure tests for the relay
//!
//! These tests verify that the relay handles failures gracefully:
//! - Probes that fail, hang or cannot connect
//! - An orchestrator outage followed by recovery
//! - Shutdown while a delivery hangs

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;
use state_relay::{
    HealthState,
    config::ResolvedTarget,
    error::ProbeError,
    monitors::{MetricSource, Metrics},
    relay::Relay,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

async fn accepting_orchestrator() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_probe_status_drives_state() {
    let orchestrator = accepting_orchestrator().await;
    let site = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&site)
        .await;

    let mut config = config_json(&orchestrator_url(&orchestrator), &[]);
    config["targets"] = json!([
        {
            "id": "site",
            "kind": "custom-probe",
            "url": format!("{}/health", site.uri()),
            "interval": 3600,
            "expected_status": [200],
            "body_pattern": "^ok$"
        },
        {
            "id": "gone",
            "kind": "custom-probe",
            "url": "http://127.0.0.1:1/health",
            "interval": 3600
        }
    ]);
    let relay = Relay::start(resolve(config), memory_backend()).await.unwrap();
    let status = relay.status();

    assert!(relay.monitor().poll_now().await.unwrap().is_empty());
    assert_eq!(
        status.current_state("site").await.unwrap(),
        Some(HealthState::Healthy)
    );

    // Unmatched requests get a 404 once the mock is gone
    site.reset().await;
    let events = relay.monitor().poll_now().await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].target_id, "site");
    assert_eq!(events[0].new_state, HealthState::Critical);
    assert!(events[0].summary.contains("status_code=404"));

    // A probe that cannot connect never leaves unknown
    assert_eq!(
        status.current_state("gone").await.unwrap(),
        Some(HealthState::Unknown)
    );

    let orchestrator_ref = &orchestrator;
    assert!(wait_until(|| async move { received(orchestrator_ref).await.len() == 1 }).await);

    relay.shutdown().await.unwrap();
}

/// Never answers within any reasonable read timeout
struct HangingSource;

#[async_trait]
impl MetricSource for HangingSource {
    async fn read(&self, _target: &ResolvedTarget) -> Result<Metrics, ProbeError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Metrics::new())
    }
}

#[tokio::test]
async fn test_hanging_read_times_out_as_unknown() {
    let orchestrator = accepting_orchestrator().await;
    let mut config = config_json(&orchestrator_url(&orchestrator), &["db-1"]);
    config["sampler"] = json!({ "read_timeout_secs": 1 });
    config["detector"] = json!({ "announce_initial_state": true });

    let relay = Relay::start_with_source(resolve(config), memory_backend(), Arc::new(HangingSource))
        .await
        .unwrap();

    let started = Instant::now();
    let events = relay.monitor().poll_now().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    // unknown -> unknown is not a change, even when announcing
    assert!(events.is_empty());
    assert_eq!(
        relay.status().current_state("db-1").await.unwrap(),
        Some(HealthState::Unknown)
    );

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_orchestrator_outage_then_recovery() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut config = config_json(&orchestrator_url(&server), &["db-1"]);
    config["dispatch"]["max_retries"] = json!(1000);
    let source = ScriptedSource::new().with("db-1", &[40.0, 95.0]);
    let relay = Relay::start_with_source(resolve(config), memory_backend(), Arc::new(source))
        .await
        .unwrap();
    let status = relay.status();

    relay.monitor().poll_now().await.unwrap();
    relay.monitor().poll_now().await.unwrap();

    let server_ref = &server;
    assert!(wait_until(|| async move { received(server_ref).await.len() >= 3 }).await);
    assert_eq!(status.pending_count().await.unwrap(), 1);

    server.reset().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let status_ref = &status;
    assert!(wait_until(|| async move { status_ref.pending_count().await.unwrap() == 0 }).await);
    assert!(status.dead_letters().await.unwrap().is_empty());

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_bounded_by_grace_when_delivery_hangs() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
        .mount(&server)
        .await;

    let mut config = config_json(&orchestrator_url(&server), &["db-1"]);
    config["orchestrator"]["timeout_secs"] = json!(60);
    config["dispatch"]["shutdown_grace_secs"] = json!(1);
    let source = ScriptedSource::new().with("db-1", &[40.0, 95.0]);
    let relay = Relay::start_with_source(resolve(config), memory_backend(), Arc::new(source))
        .await
        .unwrap();

    relay.monitor().poll_now().await.unwrap();
    relay.monitor().poll_now().await.unwrap();

    let server_ref = &server;
    assert!(wait_until(|| async move { received(server_ref).await.len() == 1 }).await);

    let started = Instant::now();
    relay.shutdown().await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(900), "grace was not honored: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "shutdown took {elapsed:?}");
}
