//! HTTP delivery of transition events to the orchestrator

use chrono::SecondsFormat;
use reqwest::{StatusCode, Url, redirect};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use super::entry::DispatchEntry;
use crate::HealthState;
use crate::config::ResolvedOrchestrator;

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Outcome of a single delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    Success,
    /// Worth another attempt (network trouble, overload, server error)
    RetryableFailure(String),
    /// Will never succeed as sent
    PermanentFailure(String),
}

/// JSON body POSTed to the orchestrator
#[derive(Debug, Serialize)]
pub struct TransitionPayload<'a> {
    pub target_id: &'a str,
    pub previous_state: HealthState,
    pub new_state: HealthState,
    pub timestamp: String,
    pub idempotency_key: &'a str,
}

impl<'a> From<&'a DispatchEntry> for TransitionPayload<'a> {
    fn from(entry: &'a DispatchEntry) -> Self {
        Self {
            target_id: &entry.event.target_id,
            previous_state: entry.event.previous_state,
            new_state: entry.event.new_state,
            timestamp: entry
                .event
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            idempotency_key: &entry.idempotency_key,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorClient {
    client: reqwest::Client,
    endpoint: Url,
    auth_token: Option<String>,
}

impl OrchestratorClient {
    pub fn new(config: &ResolvedOrchestrator) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint_url.clone(),
            auth_token: config.auth_token.clone(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Attempt to deliver one entry. Never panics, never retries by itself.
    #[instrument(skip(self, entry), fields(entry_id = entry.id, target_id = %entry.event.target_id, attempt = entry.attempts))]
    pub async fn deliver(&self, entry: &DispatchEntry) -> DeliveryResult {
        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header(IDEMPOTENCY_HEADER, &entry.idempotency_key)
            .json(&TransitionPayload::from(entry));
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let result = match request.send().await {
            Ok(response) => classify_status(response.status()),
            Err(e) => classify_error(&e),
        };

        match &result {
            DeliveryResult::Success => debug!("delivered"),
            DeliveryResult::RetryableFailure(reason) => warn!("delivery failed, retryable: {reason}"),
            DeliveryResult::PermanentFailure(reason) => warn!("delivery failed permanently: {reason}"),
        }
        result
    }
}

pub fn classify_status(status: StatusCode) -> DeliveryResult {
    if status.is_success() {
        return DeliveryResult::Success;
    }

    let reason = format!("HTTP {status}");
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        DeliveryResult::RetryableFailure(reason)
    } else {
        DeliveryResult::PermanentFailure(reason)
    }
}

fn classify_error(err: &reqwest::Error) -> DeliveryResult {
    if err.is_builder() || err.is_redirect() {
        DeliveryResult::PermanentFailure(format!("invalid request: {err}"))
    } else if err.is_timeout() {
        DeliveryResult::RetryableFailure(format!("timed out: {err}"))
    } else if err.is_connect() {
        DeliveryResult::RetryableFailure(format!("connection failed: {err}"))
    } else {
        DeliveryResult::RetryableFailure(err.to_string())
    }
}
