//! Helper functions for integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use state_relay::{
    config::{Config, ResolvedConfig, ResolvedTarget},
    error::ProbeError,
    monitors::{MetricSource, Metrics},
    storage::{MemoryBackend, QueueBackend},
};
use wiremock::{MockServer, Request};

/// Replays scripted cpu readings per target. The last reading repeats once
/// the script runs out; a target without a script is unreadable.
#[derive(Default)]
pub struct ScriptedSource {
    scripts: Mutex<HashMap<String, VecDeque<f64>>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, target_id: &str, readings: &[f64]) -> Self {
        self.push(target_id, readings);
        self
    }

    /// Append readings to a target's script
    pub fn push(&self, target_id: &str, readings: &[f64]) {
        self.scripts
            .lock()
            .unwrap()
            .entry(target_id.to_string())
            .or_default()
            .extend(readings.iter().copied());
    }
}

#[async_trait]
impl MetricSource for ScriptedSource {
    async fn read(&self, target: &ResolvedTarget) -> Result<Metrics, ProbeError> {
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts
            .get_mut(&target.id)
            .ok_or_else(|| ProbeError::Unreadable("no script".into()))?;

        let cpu = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().copied()
        };
        cpu.map(|cpu| Metrics::from([("cpu".to_string(), cpu)]))
            .ok_or_else(|| ProbeError::Unreadable("script empty".into()))
    }
}

/// Host target on cpu with degraded at 75 and critical at 90. The hour
/// interval keeps the timer out of the way; tests drive cycles with PollNow.
pub fn host_target(id: &str) -> Value {
    json!({
        "id": id,
        "kind": "host-resource",
        "interval": 3600,
        "thresholds": [
            { "metric": "cpu", "degraded": { "above": 75 }, "critical": { "above": 90 } }
        ]
    })
}

/// Config JSON with fast retries and an in-memory queue
pub fn config_json(endpoint: &str, target_ids: &[&str]) -> Value {
    json!({
        "targets": target_ids.iter().map(|id| host_target(id)).collect::<Vec<_>>(),
        "orchestrator": { "endpoint_url": endpoint, "auth_token": "test-token", "timeout_secs": 2 },
        "dispatch": {
            "max_retries": 3,
            "queue_capacity_per_target": 100,
            "batch_size": 8,
            "poll_interval_ms": 20,
            "backoff_base_ms": 10,
            "backoff_max_ms": 40,
            "shutdown_grace_secs": 2
        },
        "storage": { "backend": "none" }
    })
}

pub fn resolve(config: Value) -> ResolvedConfig {
    serde_json::from_value::<Config>(config)
        .unwrap()
        .resolve()
        .unwrap()
}

pub fn orchestrator_url(server: &MockServer) -> String {
    format!("{}/webhook/relay", server.uri())
}

pub fn memory_backend() -> Arc<dyn QueueBackend> {
    Arc::new(MemoryBackend::new())
}

/// Poll `condition` until it holds or five seconds have passed
pub async fn wait_until<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition().await
}

/// Requests the mock orchestrator has seen so far
pub async fn received(server: &MockServer) -> Vec<Request> {
    server.received_requests().await.unwrap_or_default()
}

pub async fn received_bodies(server: &MockServer) -> Vec<Value> {
    received(server)
        .await
        .iter()
        .map(|request| request.body_json::<Value>().unwrap())
        .collect()
}
