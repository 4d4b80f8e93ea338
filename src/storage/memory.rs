//! In-memory queue backend (no persistence)
//!
//! Useful for tests and for deployments that accept losing queued events on
//! restart (`"storage": { "backend": "none" }`). Ordering, capacity and
//! dead-letter semantics match the SQLite backend.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use super::backend::{EnqueueReceipt, HealthStatus, QueueBackend, QueueCounts};
use super::error::StorageResult;
use crate::TransitionEvent;
use crate::dispatch::entry::{DeliveryState, DispatchEntry, EntryId};

#[derive(Debug, Default)]
struct MemoryQueue {
    next_id: EntryId,
    /// Keyed by id, so iteration is enqueue order
    entries: BTreeMap<EntryId, DispatchEntry>,
}

impl MemoryQueue {
    fn live_ids(&self, target_id: &str) -> Vec<EntryId> {
        self.entries
            .values()
            .filter(|entry| entry.event.target_id == target_id && !entry.is_dead_lettered())
            .map(|entry| entry.id)
            .collect()
    }

    fn push(&mut self, event: TransitionEvent, capacity: usize) -> EnqueueReceipt {
        let live = self.live_ids(&event.target_id);
        let excess = (live.len() + 1).saturating_sub(capacity);
        let dropped: Vec<EntryId> = live.into_iter().take(excess).collect();
        for id in &dropped {
            self.entries.remove(id);
        }

        self.next_id += 1;
        let entry = DispatchEntry::new(self.next_id, event, Utc::now());
        let receipt = EnqueueReceipt {
            id: entry.id,
            idempotency_key: entry.idempotency_key.clone(),
            dropped,
        };
        self.entries.insert(entry.id, entry);
        receipt
    }

    fn update(&mut self, entry_id: EntryId, apply: impl FnOnce(&mut DispatchEntry)) -> bool {
        match self.entries.get_mut(&entry_id) {
            Some(entry) if !entry.is_dead_lettered() => {
                apply(entry);
                true
            }
            _ => false,
        }
    }
}

/// In-memory queue backend
#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: Mutex<MemoryQueue>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn enqueue(
        &self,
        event: TransitionEvent,
        capacity: usize,
    ) -> StorageResult<EnqueueReceipt> {
        Ok(self.inner.lock().await.push(event, capacity))
    }

    async fn dequeue_batch(
        &self,
        max_n: usize,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<DispatchEntry>> {
        let mut queue = self.inner.lock().await;

        let due: Vec<EntryId> = {
            let mut seen_targets = HashSet::new();
            queue
                .entries
                .values()
                .filter(|entry| !entry.is_dead_lettered())
                .filter(|entry| seen_targets.insert(entry.event.target_id.as_str()))
                .filter(|entry| entry.is_due(now))
                .map(|entry| entry.id)
                .take(max_n)
                .collect()
        };

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            if let Some(entry) = queue.entries.get_mut(&id) {
                entry.state = DeliveryState::InFlight;
                entry.attempts += 1;
                claimed.push(entry.clone());
            }
        }

        debug!("claimed {} entries", claimed.len());
        Ok(claimed)
    }

    async fn ack(&self, entry_id: EntryId) -> StorageResult<bool> {
        Ok(self.inner.lock().await.entries.remove(&entry_id).is_some())
    }

    async fn requeue(
        &self,
        entry_id: EntryId,
        retry_at: DateTime<Utc>,
        error: &str,
    ) -> StorageResult<bool> {
        Ok(self.inner.lock().await.update(entry_id, |entry| {
            entry.state = DeliveryState::RetryScheduled { at: retry_at };
            entry.last_error = Some(error.to_string());
        }))
    }

    async fn dead_letter(&self, entry_id: EntryId, error: &str) -> StorageResult<bool> {
        Ok(self.inner.lock().await.update(entry_id, |entry| {
            entry.state = DeliveryState::DeadLettered;
            entry.last_error = Some(error.to_string());
        }))
    }

    async fn redrive(
        &self,
        entry_id: EntryId,
        capacity: usize,
    ) -> StorageResult<Option<EnqueueReceipt>> {
        let mut queue = self.inner.lock().await;
        let is_dead = queue
            .entries
            .get(&entry_id)
            .is_some_and(DispatchEntry::is_dead_lettered);
        if !is_dead {
            return Ok(None);
        }

        let Some(entry) = queue.entries.remove(&entry_id) else {
            return Ok(None);
        };
        Ok(Some(queue.push(entry.event, capacity)))
    }

    async fn recover_in_flight(&self) -> StorageResult<usize> {
        let mut queue = self.inner.lock().await;
        let mut recovered = 0;
        for entry in queue.entries.values_mut() {
            if entry.state == DeliveryState::InFlight {
                entry.state = DeliveryState::Pending;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn pending_count(&self) -> StorageResult<usize> {
        Ok(self.counts().await?.live())
    }

    async fn target_len(&self, target_id: &str) -> StorageResult<usize> {
        Ok(self.inner.lock().await.live_ids(target_id).len())
    }

    async fn dead_letters(&self) -> StorageResult<Vec<DispatchEntry>> {
        let queue = self.inner.lock().await;
        Ok(queue
            .entries
            .values()
            .filter(|entry| entry.is_dead_lettered())
            .cloned()
            .collect())
    }

    async fn purge_dead_letters(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let mut queue = self.inner.lock().await;
        let count_before = queue.entries.len();
        queue
            .entries
            .retain(|_, entry| !(entry.is_dead_lettered() && entry.enqueued_at < before));
        Ok(count_before - queue.entries.len())
    }

    async fn counts(&self) -> StorageResult<QueueCounts> {
        let queue = self.inner.lock().await;
        let mut counts = QueueCounts::default();
        for entry in queue.entries.values() {
            match entry.state {
                DeliveryState::Pending => counts.pending += 1,
                DeliveryState::InFlight => counts.in_flight += 1,
                DeliveryState::RetryScheduled { .. } => counts.retry_scheduled += 1,
                DeliveryState::DeadLettered => counts.dead_lettered += 1,
            }
        }
        Ok(counts)
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let entries = self.inner.lock().await.entries.len();
        Ok(HealthStatus {
            healthy: true,
            message: "In-memory queue operational".to_string(),
            metadata: HashMap::from([
                ("backend".to_string(), "memory".to_string()),
                ("entries".to_string(), entries.to_string()),
            ]),
        })
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing in-memory backend (no-op)");
        Ok(())
    }
}
