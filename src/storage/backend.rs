//! Queue backend trait definition
//!
//! This module defines the `QueueBackend` trait that both the durable
//! (SQLite) and the in-memory dispatch queue implement.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::StorageResult;
use crate::TransitionEvent;
use crate::dispatch::entry::{DispatchEntry, EntryId};

/// Outcome of an enqueue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueReceipt {
    pub id: EntryId,
    pub idempotency_key: String,
    /// Oldest entries of the same target evicted to stay within capacity
    pub dropped: Vec<EntryId>,
}

/// Number of live and dead entries per delivery state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub retry_scheduled: usize,
    pub dead_lettered: usize,
}

impl QueueCounts {
    /// Entries still awaiting a delivery outcome
    pub fn live(&self) -> usize {
        self.pending + self.in_flight + self.retry_scheduled
    }
}

/// Health status of the queue backend
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

/// Storage for the dispatch queue
///
/// Every method is a single atomic operation: the sampling loop (producer)
/// and the delivery loop (consumer) only ever meet through these calls.
///
/// ## Ordering
///
/// Entry ids grow in enqueue order. The *head* of a target is its live
/// (not dead-lettered) entry with the smallest id. `dequeue_batch` returns
/// only heads, so a target never has more than one entry in flight and its
/// entries are attempted strictly in enqueue order.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Append an event, evicting the target's oldest live entries while the
    /// target holds `capacity` or more of them.
    async fn enqueue(&self, event: TransitionEvent, capacity: usize)
    -> StorageResult<EnqueueReceipt>;

    /// Claim up to `max_n` due target heads, marking them in flight and
    /// counting the attempt.
    async fn dequeue_batch(
        &self,
        max_n: usize,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<DispatchEntry>>;

    /// Remove a delivered entry. Returns `false` if it no longer exists.
    async fn ack(&self, entry_id: EntryId) -> StorageResult<bool>;

    /// Schedule another attempt of an in-flight entry at `retry_at`.
    async fn requeue(
        &self,
        entry_id: EntryId,
        retry_at: DateTime<Utc>,
        error: &str,
    ) -> StorageResult<bool>;

    /// Park an entry for operator inspection; it no longer blocks its target.
    async fn dead_letter(&self, entry_id: EntryId, error: &str) -> StorageResult<bool>;

    /// Move a dead letter back to the tail of its target with a fresh
    /// attempt budget. `None` if `entry_id` is not a dead letter.
    async fn redrive(
        &self,
        entry_id: EntryId,
        capacity: usize,
    ) -> StorageResult<Option<EnqueueReceipt>>;

    /// Reset entries left in flight by a previous process to pending.
    async fn recover_in_flight(&self) -> StorageResult<usize>;

    /// Live entries (pending, in flight or scheduled for retry)
    async fn pending_count(&self) -> StorageResult<usize>;

    /// Live entries of a single target
    async fn target_len(&self, target_id: &str) -> StorageResult<usize>;

    /// All dead letters, oldest first
    async fn dead_letters(&self) -> StorageResult<Vec<DispatchEntry>>;

    /// Delete dead letters enqueued before `before`. Returns the count.
    async fn purge_dead_letters(&self, before: DateTime<Utc>) -> StorageResult<usize>;

    async fn counts(&self) -> StorageResult<QueueCounts>;

    /// Lightweight check that the backend is operational
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Release resources
    async fn close(&self) -> StorageResult<()>;
}
