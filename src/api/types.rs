//! API response types

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::HealthState;
use crate::dispatch::{DispatchEntry, EntryId};
use crate::storage::HealthStatus;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" when the queue backend is unhealthy
    pub status: String,
    pub timestamp: String,
    pub backend: HealthStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetStateResponse {
    pub target_id: String,
    pub state: HealthState,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetsResponse {
    pub targets: Vec<TargetStateResponse>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterInfo {
    pub id: EntryId,
    pub target_id: String,
    pub previous_state: HealthState,
    pub new_state: HealthState,
    pub timestamp: DateTime<Utc>,
    pub idempotency_key: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl From<DispatchEntry> for DeadLetterInfo {
    fn from(entry: DispatchEntry) -> Self {
        Self {
            id: entry.id,
            target_id: entry.event.target_id,
            previous_state: entry.event.previous_state,
            new_state: entry.event.new_state,
            timestamp: entry.event.timestamp,
            idempotency_key: entry.idempotency_key,
            attempts: entry.attempts,
            last_error: entry.last_error,
            enqueued_at: entry.enqueued_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLettersResponse {
    pub dead_letters: Vec<DeadLetterInfo>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RedriveResponse {
    /// Id of the dead letter that was redriven
    pub redriven: EntryId,
    /// Id of the new queue entry
    pub entry_id: EntryId,
    pub idempotency_key: String,
}
