//! Durable queue tests (SQLite backend)
//!
//! These tests verify that:
//! - Entries abandoned by a shutdown are delivered after a restart
//! - The idempotency key survives the restart
//! - Overflow eviction keeps only the newest entries per target

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use state_relay::{config::ResolvedConfig, relay::Relay, storage};
use tempfile::TempDir;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

fn sqlite_config(endpoint: &str, dir: &TempDir) -> Value {
    let mut config = config_json(endpoint, &["db-1"]);
    config["storage"] = json!({
        "backend": "sqlite",
        "path": dir.path().join("relay.db"),
    });
    config
}

async fn start(config: ResolvedConfig, readings: &[f64]) -> Relay {
    let backend = storage::open(&config.storage).await.unwrap();
    let source = ScriptedSource::new().with("db-1", readings);
    Relay::start_with_source(config, backend, Arc::new(source))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_abandoned_delivery_survives_restart() {
    let dir = TempDir::new().unwrap();

    // First run: the orchestrator hangs and shutdown gives up on the delivery
    let hanging = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
        .mount(&hanging)
        .await;
    let mut config = sqlite_config(&orchestrator_url(&hanging), &dir);
    config["orchestrator"]["timeout_secs"] = json!(60);
    config["dispatch"]["shutdown_grace_secs"] = json!(1);

    let relay = start(resolve(config), &[40.0, 95.0]).await;
    relay.monitor().poll_now().await.unwrap();
    relay.monitor().poll_now().await.unwrap();

    let hanging_ref = &hanging;
    assert!(wait_until(|| async move { received(hanging_ref).await.len() == 1 }).await);
    let first_key = received(&hanging).await[0]
        .headers
        .get("idempotency-key")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    relay.shutdown().await.unwrap();

    // Second run: the entry is recovered and delivered with the same key
    let accepting = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&accepting)
        .await;
    let relay = start(resolve(sqlite_config(&orchestrator_url(&accepting), &dir)), &[95.0]).await;
    let status = relay.status();

    let accepting_ref = &accepting;
    assert!(wait_until(|| async move { received(accepting_ref).await.len() == 1 }).await);

    let bodies = received_bodies(&accepting).await;
    assert_eq!(bodies[0]["new_state"], "critical");
    assert_eq!(bodies[0]["idempotency_key"], json!(first_key));

    let status_ref = &status;
    assert!(wait_until(|| async move { status_ref.pending_count().await.unwrap() == 0 }).await);

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_overflow_keeps_newest_entries() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut config = sqlite_config(&orchestrator_url(&server), &dir);
    config["dispatch"]["queue_capacity_per_target"] = json!(2);
    config["dispatch"]["max_retries"] = json!(1000);
    // Long backoff keeps the head waiting so the tail can overflow
    config["dispatch"]["backoff_base_ms"] = json!(60_000);
    config["dispatch"]["backoff_max_ms"] = json!(60_000);

    let relay = start(resolve(config), &[40.0, 95.0, 40.0, 95.0, 40.0]).await;
    let status = relay.status();
    for _ in 0..5 {
        relay.monitor().poll_now().await.unwrap();
    }

    let stats = status.queue_stats().await.unwrap();
    assert_eq!(stats.counts.live(), 2);
    assert_eq!(stats.dropped, 2);
    assert_eq!(stats.capacity_per_target, 2);
    assert!(!stats.closed);

    relay.shutdown().await.unwrap();

    // The two newest transitions are what a restart finds
    let backend = storage::open(&state_relay::config::StorageConfig::Sqlite {
        path: dir.path().join("relay.db"),
        dead_letter_retention_days: None,
    })
    .await
    .unwrap();
    backend.recover_in_flight().await.unwrap();
    // Far enough ahead that a scheduled retry is due as well
    let later = chrono::Utc::now() + chrono::Duration::days(1);
    let batch = backend.dequeue_batch(10, later).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].event.previous_state, state_relay::HealthState::Healthy);
    assert_eq!(batch[0].event.new_state, state_relay::HealthState::Critical);
    assert_eq!(backend.target_len("db-1").await.unwrap(), 2);
    backend.close().await.unwrap();
}
