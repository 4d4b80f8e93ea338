//! Bounded, per-target FIFO queue between the monitor and the dispatcher

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::entry::{DispatchEntry, EntryId};
use crate::TransitionEvent;
use crate::storage::{EnqueueReceipt, QueueBackend, QueueCounts, StorageError, StorageResult};

/// Snapshot of queue health for status queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    #[serde(flatten)]
    pub counts: QueueCounts,
    /// Entries evicted by overflow since startup
    pub dropped: u64,
    pub capacity_per_target: usize,
    pub closed: bool,
}

/// Front over a [`QueueBackend`] adding capacity, overflow accounting,
/// the closed flag and the enqueue notification.
#[derive(Clone)]
pub struct DispatchQueue {
    backend: Arc<dyn QueueBackend>,
    capacity: usize,
    closed: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    notify: Arc<Notify>,
}

impl DispatchQueue {
    pub fn new(backend: Arc<dyn QueueBackend>, capacity_per_target: usize) -> Self {
        Self {
            backend,
            capacity: capacity_per_target.max(1),
            closed: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicU64::new(0)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    /// Fired after every successful enqueue
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    pub async fn enqueue(&self, event: TransitionEvent) -> StorageResult<EnqueueReceipt> {
        if self.is_closed() {
            return Err(StorageError::QueueClosed);
        }

        let target_id = event.target_id.clone();
        let receipt = self.backend.enqueue(event, self.capacity).await?;
        if !receipt.dropped.is_empty() {
            self.dropped
                .fetch_add(receipt.dropped.len() as u64, Ordering::Relaxed);
            warn!(
                target_id = %target_id,
                dropped = ?receipt.dropped,
                "dispatch queue full, dropped oldest entries"
            );
        }

        debug!(target_id = %target_id, entry_id = receipt.id, "event enqueued");
        self.notify.notify_one();
        Ok(receipt)
    }

    /// Claim due target heads for delivery
    pub async fn dequeue_batch(&self, max_n: usize) -> StorageResult<Vec<DispatchEntry>> {
        self.backend.dequeue_batch(max_n, Utc::now()).await
    }

    pub async fn ack(&self, entry_id: EntryId) -> StorageResult<bool> {
        self.backend.ack(entry_id).await
    }

    /// Schedule another attempt after `backoff`
    pub async fn requeue(
        &self,
        entry_id: EntryId,
        backoff: Duration,
        reason: &str,
    ) -> StorageResult<bool> {
        let backoff = chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::MAX);
        let retry_at = Utc::now()
            .checked_add_signed(backoff)
            .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC);
        self.backend.requeue(entry_id, retry_at, reason).await
    }

    pub async fn dead_letter(&self, entry_id: EntryId, reason: &str) -> StorageResult<bool> {
        self.backend.dead_letter(entry_id, reason).await
    }

    /// Put a dead letter back at the tail of its target
    pub async fn redrive(&self, entry_id: EntryId) -> StorageResult<Option<EnqueueReceipt>> {
        if self.is_closed() {
            return Err(StorageError::QueueClosed);
        }

        let receipt = self.backend.redrive(entry_id, self.capacity).await?;
        if let Some(receipt) = &receipt {
            if !receipt.dropped.is_empty() {
                self.dropped
                    .fetch_add(receipt.dropped.len() as u64, Ordering::Relaxed);
                warn!(dropped = ?receipt.dropped, "redrive evicted oldest entries");
            }
            self.notify.notify_one();
        }
        Ok(receipt)
    }

    pub async fn pending_count(&self) -> StorageResult<usize> {
        self.backend.pending_count().await
    }

    pub async fn dead_letters(&self) -> StorageResult<Vec<DispatchEntry>> {
        self.backend.dead_letters().await
    }

    pub async fn stats(&self) -> StorageResult<QueueStats> {
        Ok(QueueStats {
            counts: self.backend.counts().await?,
            dropped: self.dropped.load(Ordering::Relaxed),
            capacity_per_target: self.capacity,
            closed: self.is_closed(),
        })
    }

    /// Refuse further enqueues. Entries already queued stay available.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("dispatch queue closed for enqueues");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
