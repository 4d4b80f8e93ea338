//! Integration tests for the status API
//!
//! These tests verify that:
//! - Target state endpoints report confirmed states
//! - Queue statistics and dead letters are exposed
//! - Redrive works and answers 404 for unknown entries
//! - Authentication middleware functions properly

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use pretty_assertions::assert_eq;
use serde_json::Value;
use state_relay::{
    api::{ApiConfig, ApiState, spawn_api_server},
    relay::Relay,
};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

const TOKEN: &str = "api-token";

async fn spawn_test_api(relay: &Relay) -> SocketAddr {
    let config = ApiConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        auth_token: Some(TOKEN.to_string()),
        enable_cors: true,
    };

    spawn_api_server(config, ApiState::new(relay.status()))
        .await
        .unwrap()
}

async fn get(addr: SocketAddr, route: &str) -> (StatusCode, Value) {
    let response = reqwest::Client::new()
        .get(format!("http://{addr}{route}"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    let status = StatusCode::from_u16(response.status().as_u16()).unwrap();
    (status, response.json().await.unwrap())
}

async fn post(addr: SocketAddr, route: &str) -> (StatusCode, Value) {
    let response = reqwest::Client::new()
        .post(format!("http://{addr}{route}"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    let status = StatusCode::from_u16(response.status().as_u16()).unwrap();
    (status, response.json().await.unwrap())
}

/// Relay whose orchestrator rejects every event, so each transition ends up
/// as a dead letter
async fn rejecting_relay(server: &MockServer) -> Relay {
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400))
        .mount(server)
        .await;

    let config = resolve(config_json(&orchestrator_url(server), &["db-1", "web-1"]));
    let source = ScriptedSource::new()
        .with("db-1", &[40.0, 95.0])
        .with("web-1", &[40.0]);
    Relay::start_with_source(config, memory_backend(), Arc::new(source))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = MockServer::start().await;
    let relay = rejecting_relay(&server).await;
    let addr = spawn_test_api(&relay).await;

    let (status, body) = get(addr, "/api/v1/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["backend"]["healthy"], true);
    assert_eq!(body["backend"]["metadata"]["backend"], "memory");
    assert!(body["timestamp"].is_string());

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_target_state_endpoints() {
    let server = MockServer::start().await;
    let relay = rejecting_relay(&server).await;
    let addr = spawn_test_api(&relay).await;

    let (_, body) = get(addr, "/api/v1/targets/db-1/state").await;
    assert_eq!(body["state"], "unknown");

    relay.monitor().poll_now().await.unwrap();
    relay.monitor().poll_now().await.unwrap();

    let (status, body) = get(addr, "/api/v1/targets").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    assert_eq!(body["targets"][0]["target_id"], "db-1");
    assert_eq!(body["targets"][0]["state"], "critical");
    assert_eq!(body["targets"][1]["target_id"], "web-1");
    assert_eq!(body["targets"][1]["state"], "healthy");

    let (status, body) = get(addr, "/api/v1/targets/db-1/state").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["target_id"], "db-1");
    assert_eq!(body["state"], "critical");

    let (status, body) = get(addr, "/api/v1/targets/nope/state").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("nope"));

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_dead_letters_and_redrive() {
    let server = MockServer::start().await;
    let relay = rejecting_relay(&server).await;
    let addr = spawn_test_api(&relay).await;
    let status_handle = relay.status();

    relay.monitor().poll_now().await.unwrap();
    relay.monitor().poll_now().await.unwrap();

    let status_ref = &status_handle;
    assert!(wait_until(|| async move { status_ref.dead_letters().await.unwrap().len() == 1 }).await);

    let (status, body) = get(addr, "/api/v1/dispatch/dead-letters").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    let dead = &body["dead_letters"][0];
    assert_eq!(dead["target_id"], "db-1");
    assert_eq!(dead["new_state"], "critical");
    assert_eq!(dead["attempts"], 1);
    let id = dead["id"].as_i64().unwrap();
    let key = dead["idempotency_key"].as_str().unwrap().to_string();

    let (status, body) = get(addr, "/api/v1/dispatch/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["dead_lettered"], 1);
    assert_eq!(body["pending"], 0);
    assert_eq!(body["closed"], false);

    let (status, body) = post(addr, &format!("/api/v1/dispatch/dead-letters/{id}/redrive")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["redriven"], id);
    assert_eq!(body["idempotency_key"], key.as_str());

    // Rejected again, so it is a dead letter once more, under its new id
    let new_id = body["entry_id"].as_i64().unwrap();
    assert!(new_id > id);
    assert!(
        wait_until(|| async move {
            status_ref
                .dead_letters()
                .await
                .unwrap()
                .iter()
                .any(|entry| entry.id == new_id)
        })
        .await
    );

    let (status, _) = post(addr, &format!("/api/v1/dispatch/dead-letters/{id}/redrive")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_auth_required() {
    let server = MockServer::start().await;
    let relay = rejecting_relay(&server).await;
    let addr = spawn_test_api(&relay).await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/api/v1/targets");

    let missing = client.get(&url).send().await.unwrap();
    assert_eq!(missing.status().as_u16(), 401);

    let malformed = client
        .get(&url)
        .header("Authorization", TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(malformed.status().as_u16(), 401);

    let wrong = client.get(&url).bearer_auth("wrong").send().await.unwrap();
    assert_eq!(wrong.status().as_u16(), 403);

    let right = client.get(&url).bearer_auth(TOKEN).send().await.unwrap();
    assert_eq!(right.status().as_u16(), 200);

    relay.shutdown().await.unwrap();
}
