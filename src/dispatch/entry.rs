//! Queue entries and their delivery state machine
//!
//! ```text
//! Pending ──dequeue──▶ InFlight ──success──▶ (acked, removed)
//!    ▲                   │  │
//!    │            retryable  permanent / exhausted
//!    │                   ▼  ▼
//!    └──due── RetryScheduled(at)   DeadLettered ──redrive──▶ Pending
//! ```

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::TransitionEvent;

/// Identifier assigned by the queue backend, increasing in enqueue order
pub type EntryId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    InFlight,
    RetryScheduled { at: DateTime<Utc> },
    DeadLettered,
}

impl DeliveryState {
    pub fn label(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::InFlight => "in_flight",
            DeliveryState::RetryScheduled { .. } => "retry_scheduled",
            DeliveryState::DeadLettered => "dead_lettered",
        }
    }
}

/// A transition event waiting for (or done with) delivery
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchEntry {
    pub id: EntryId,
    pub event: TransitionEvent,
    pub idempotency_key: String,
    /// Delivery attempts started so far
    pub attempts: u32,
    pub state: DeliveryState,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl DispatchEntry {
    pub fn new(id: EntryId, event: TransitionEvent, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            id,
            idempotency_key: idempotency_key(&event),
            event,
            attempts: 0,
            state: DeliveryState::Pending,
            last_error: None,
            enqueued_at,
        }
    }

    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            DeliveryState::RetryScheduled { at } => Some(at),
            _ => None,
        }
    }

    pub fn is_dead_lettered(&self) -> bool {
        self.state == DeliveryState::DeadLettered
    }

    /// Whether the dispatcher may start an attempt at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            DeliveryState::Pending => true,
            DeliveryState::RetryScheduled { at } => at <= now,
            DeliveryState::InFlight | DeliveryState::DeadLettered => false,
        }
    }
}

/// Deterministic key for a transition.
///
/// Derived only from the target, the transition timestamp and the state
/// pair, so the same event redelivered after a restart carries the same key.
pub fn idempotency_key(event: &TransitionEvent) -> String {
    let material = format!(
        "{}\n{}\n{}\n{}",
        event.target_id,
        event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        event.previous_state,
        event.new_state
    );
    let hash = Sha256::digest(material.as_bytes());
    format!("{hash:x}")
}
