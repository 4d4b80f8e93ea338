//! Row layout of the `dispatch_entries` table
//!
//! Timestamps are stored as unix milliseconds. The delivery state is split
//! over two columns: `state` holds the label and `next_attempt_at` the time
//! a `retry_scheduled` entry becomes due (for other states it is the time
//! the entry became eligible).

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::error::{StorageError, StorageResult};
use crate::dispatch::entry::{DeliveryState, DispatchEntry, EntryId};
use crate::{HealthState, TransitionEvent};

/// Column list matching [`EntryRow::from_row`]
pub const ENTRY_COLUMNS: &str = "id, target_id, previous_state, new_state, detected_at, summary, \
     idempotency_key, attempts, state, next_attempt_at, last_error, enqueued_at";

/// One raw row of the queue table
#[derive(Debug, Clone)]
pub struct EntryRow {
    pub id: EntryId,
    pub target_id: String,
    pub previous_state: String,
    pub new_state: String,
    pub detected_at: i64,
    pub summary: String,
    pub idempotency_key: String,
    pub attempts: i64,
    pub state: String,
    pub next_attempt_at: i64,
    pub last_error: Option<String>,
    pub enqueued_at: i64,
}

impl EntryRow {
    pub fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            target_id: row.try_get("target_id")?,
            previous_state: row.try_get("previous_state")?,
            new_state: row.try_get("new_state")?,
            detected_at: row.try_get("detected_at")?,
            summary: row.try_get("summary")?,
            idempotency_key: row.try_get("idempotency_key")?,
            attempts: row.try_get("attempts")?,
            state: row.try_get("state")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            last_error: row.try_get("last_error")?,
            enqueued_at: row.try_get("enqueued_at")?,
        })
    }

    pub fn into_entry(self) -> StorageResult<DispatchEntry> {
        let id = self.id;
        let corrupt = |message: String| StorageError::Corrupt { id, message };

        let previous_state: HealthState = self.previous_state.parse().map_err(corrupt)?;
        let new_state: HealthState = self.new_state.parse().map_err(corrupt)?;
        let timestamp = millis_to_timestamp(self.detected_at)
            .ok_or_else(|| corrupt(format!("invalid detected_at {}", self.detected_at)))?;
        let enqueued_at = millis_to_timestamp(self.enqueued_at)
            .ok_or_else(|| corrupt(format!("invalid enqueued_at {}", self.enqueued_at)))?;

        let state = match self.state.as_str() {
            "pending" => DeliveryState::Pending,
            "in_flight" => DeliveryState::InFlight,
            "dead_lettered" => DeliveryState::DeadLettered,
            "retry_scheduled" => DeliveryState::RetryScheduled {
                at: millis_to_timestamp(self.next_attempt_at).ok_or_else(|| {
                    corrupt(format!("invalid next_attempt_at {}", self.next_attempt_at))
                })?,
            },
            other => return Err(corrupt(format!("unknown delivery state '{other}'"))),
        };

        Ok(DispatchEntry {
            id,
            event: TransitionEvent {
                target_id: self.target_id,
                previous_state,
                new_state,
                timestamp,
                summary: self.summary,
            },
            idempotency_key: self.idempotency_key,
            attempts: u32::try_from(self.attempts).unwrap_or(u32::MAX),
            state,
            last_error: self.last_error,
            enqueued_at,
        })
    }
}

pub fn timestamp_to_millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub fn millis_to_timestamp(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}
