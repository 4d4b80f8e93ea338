//! End-to-end tests: sampled readings in, orchestrator requests out
//!
//! These tests verify that:
//! - The first reading only sets a baseline
//! - A confirmed change is delivered exactly once with a stable key
//! - Debounce suppresses flapping readings
//! - Each target keeps its own state and event order

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use state_relay::HealthState;
use state_relay::relay::Relay;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

async fn orchestrator() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/webhook/relay"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_healthy_to_critical_is_delivered_once() {
    let server = orchestrator().await;
    let config = resolve(config_json(&orchestrator_url(&server), &["db-1"]));
    let source = ScriptedSource::new().with("db-1", &[40.0, 95.0]);

    let relay = Relay::start_with_source(config, memory_backend(), Arc::new(source))
        .await
        .unwrap();
    let status = relay.status();

    // Baseline: confirmed but silent
    assert!(relay.monitor().poll_now().await.unwrap().is_empty());
    assert_eq!(
        status.current_state("db-1").await.unwrap(),
        Some(HealthState::Healthy)
    );

    let events = relay.monitor().poll_now().await.unwrap();
    assert_eq!(events.len(), 1);

    let server_ref = &server;
    assert!(wait_until(|| async move { received(server_ref).await.len() == 1 }).await);

    let requests = received(&server).await;
    let body: serde_json::Value = requests[0].body_json().unwrap();
    assert_eq!(body["target_id"], "db-1");
    assert_eq!(body["previous_state"], "healthy");
    assert_eq!(body["new_state"], "critical");
    assert_eq!(body.as_object().unwrap().len(), 5);

    let key = requests[0]
        .headers
        .get("idempotency-key")
        .unwrap()
        .to_str()
        .unwrap();
    assert_eq!(body["idempotency_key"], json!(key));

    // Still critical: nothing new
    assert!(relay.monitor().poll_now().await.unwrap().is_empty());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(received(&server).await.len(), 1);
    assert_eq!(status.pending_count().await.unwrap(), 0);

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_announce_initial_state_delivers_baseline() {
    let server = orchestrator().await;
    let mut config = config_json(&orchestrator_url(&server), &["db-1"]);
    config["detector"] = json!({ "announce_initial_state": true });
    let source = ScriptedSource::new().with("db-1", &[80.0]);

    let relay = Relay::start_with_source(resolve(config), memory_backend(), Arc::new(source))
        .await
        .unwrap();

    let events = relay.monitor().poll_now().await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].previous_state, HealthState::Unknown);
    assert_eq!(events[0].new_state, HealthState::Degraded);

    let server_ref = &server;
    assert!(wait_until(|| async move { received(server_ref).await.len() == 1 }).await);
    assert_eq!(received_bodies(&server).await[0]["previous_state"], "unknown");

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_debounce_suppresses_short_spike() {
    let server = orchestrator().await;
    let mut config = config_json(&orchestrator_url(&server), &["db-1"]);
    config["detector"] = json!({ "debounce_cycles": 3 });
    // Three healthy readings set the baseline, a two-cycle spike is ignored,
    // then three critical readings in a row confirm the change.
    let source = ScriptedSource::new().with(
        "db-1",
        &[40.0, 40.0, 40.0, 95.0, 95.0, 40.0, 95.0, 95.0, 95.0, 95.0],
    );

    let relay = Relay::start_with_source(resolve(config), memory_backend(), Arc::new(source))
        .await
        .unwrap();

    let mut emitted = Vec::new();
    for _ in 0..10 {
        emitted.extend(relay.monitor().poll_now().await.unwrap());
    }

    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].target_id, "db-1");
    assert_eq!(emitted[0].previous_state, HealthState::Healthy);
    assert_eq!(emitted[0].new_state, HealthState::Critical);

    let server_ref = &server;
    assert!(wait_until(|| async move { received(server_ref).await.len() == 1 }).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(received(&server).await.len(), 1);

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_targets_are_tracked_independently() {
    let server = orchestrator().await;
    let config = resolve(config_json(&orchestrator_url(&server), &["db-1", "web-1"]));
    let source = ScriptedSource::new()
        .with("db-1", &[40.0, 95.0, 40.0])
        .with("web-1", &[40.0, 80.0, 80.0]);

    let relay = Relay::start_with_source(config, memory_backend(), Arc::new(source))
        .await
        .unwrap();
    for _ in 0..3 {
        relay.monitor().poll_now().await.unwrap();
    }

    let server_ref = &server;
    assert!(wait_until(|| async move { received(server_ref).await.len() == 3 }).await);

    let bodies = received_bodies(&server).await;
    let transitions = |target: &str| -> Vec<(String, String)> {
        bodies
            .iter()
            .filter(|body| body["target_id"] == target)
            .map(|body| {
                (
                    body["previous_state"].as_str().unwrap().to_string(),
                    body["new_state"].as_str().unwrap().to_string(),
                )
            })
            .collect()
    };

    assert_eq!(
        transitions("db-1"),
        vec![
            ("healthy".to_string(), "critical".to_string()),
            ("critical".to_string(), "healthy".to_string()),
        ]
    );
    assert_eq!(
        transitions("web-1"),
        vec![("healthy".to_string(), "degraded".to_string())]
    );

    let states = relay.status().target_states().await.unwrap();
    assert_eq!(states["db-1"], HealthState::Healthy);
    assert_eq!(states["web-1"], HealthState::Degraded);

    relay.shutdown().await.unwrap();
}
