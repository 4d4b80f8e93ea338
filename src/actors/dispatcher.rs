//! DispatcherActor - Delivers queued transition events to the orchestrator
//!
//! ## Wake-ups
//!
//! - **Ticker**: every `poll_interval`, picks up retries that became due
//! - **Enqueue notification**: new events are delivered without waiting
//! - **DrainNow command**: explicit drain, used by tests and tooling
//! - **Cleanup**: periodic purge of expired dead letters (when retention is set)
//!
//! ## Drain pass
//!
//! ```text
//! dequeue_batch ──▶ deliver heads concurrently ──▶ ack | requeue(backoff) | dead_letter
//!       ▲                                                      │
//!       └──────────────── until nothing is due ────────────────┘
//! ```
//!
//! Retry timing lives in the queue entries (`RetryScheduled { at }`), so the
//! actor never sleeps on behalf of a single entry.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::dispatch::{DeliveryResult, DispatchEntry, DispatchQueue, OrchestratorClient, RetryPolicy};
use crate::storage::StorageResult;

use super::messages::{DispatcherCommand, DrainReport};

/// Cleanup interval for dead letter retention
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Dispatcher tuning taken from the `dispatch` config section
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub policy: RetryPolicy,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
    /// Dead letters older than this many days are purged
    pub dead_letter_retention_days: Option<u32>,
}

pub struct DispatcherActor {
    queue: DispatchQueue,
    client: OrchestratorClient,
    settings: DispatcherSettings,
    command_rx: mpsc::Receiver<DispatcherCommand>,
    cancel: CancellationToken,
}

impl DispatcherActor {
    pub fn new(
        queue: DispatchQueue,
        client: OrchestratorClient,
        settings: DispatcherSettings,
        command_rx: mpsc::Receiver<DispatcherCommand>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue,
            client,
            settings,
            command_rx,
            cancel,
        }
    }

    #[instrument(skip(self), fields(endpoint = %self.client.endpoint()))]
    pub async fn run(mut self) {
        debug!("starting dispatcher actor");

        let notify = self.queue.notifier();
        let mut ticker = time::interval(self.settings.poll_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cleanup_interval = time::interval(CLEANUP_INTERVAL);
        let has_retention = self.settings.dead_letter_retention_days.is_some();

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    debug!("shutdown requested");
                    break;
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        DispatcherCommand::DrainNow { respond_to } => {
                            debug!("received DrainNow command");
                            let report = self.drain_until_cancelled().await.unwrap_or_default();
                            let _ = respond_to.send(report);
                        }
                    }
                }

                _ = notify.notified() => {
                    trace!("woken by enqueue");
                    self.drain_until_cancelled().await;
                }

                _ = ticker.tick() => {
                    self.drain_until_cancelled().await;
                }

                _ = cleanup_interval.tick(), if has_retention => {
                    self.purge_expired().await;
                }
            }
        }

        debug!("dispatcher actor stopped");
    }

    /// Drain, but if shutdown is requested meanwhile, allow only the grace
    /// period for the deliveries in flight. `None` when they were abandoned.
    async fn drain_until_cancelled(&self) -> Option<DrainReport> {
        let drain = self.drain();
        tokio::pin!(drain);

        tokio::select! {
            report = &mut drain => Some(report),
            _ = self.cancel.cancelled() => {
                info!(
                    "shutdown requested during delivery, waiting up to {:?}",
                    self.settings.shutdown_grace
                );
                match time::timeout(self.settings.shutdown_grace, drain).await {
                    Ok(report) => Some(report),
                    Err(_) => {
                        warn!("grace period elapsed, abandoning in-flight deliveries");
                        None
                    }
                }
            }
        }
    }

    /// Deliver due heads until nothing is due anymore
    async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();

        loop {
            let batch = match self.queue.dequeue_batch(self.settings.batch_size).await {
                Ok(batch) => batch,
                Err(e) => {
                    error!("failed to dequeue: {e}");
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }
            trace!("delivering {} entries", batch.len());

            let results = join_all(batch.iter().map(|entry| self.client.deliver(entry))).await;
            for (entry, result) in batch.iter().zip(results) {
                match self.settle(entry, result).await {
                    Ok(outcome) => report.absorb(outcome),
                    Err(e) => error!(entry_id = entry.id, "failed to record delivery outcome: {e}"),
                }
            }

            if self.cancel.is_cancelled() {
                break;
            }
        }

        if report.attempted() > 0 {
            debug!(
                delivered = report.delivered,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                "drain pass complete"
            );
        }
        report
    }

    /// Advance one entry's state machine according to the attempt's outcome
    async fn settle(&self, entry: &DispatchEntry, result: DeliveryResult) -> StorageResult<DrainReport> {
        let mut outcome = DrainReport::default();

        match result {
            DeliveryResult::Success => {
                self.queue.ack(entry.id).await?;
                info!(
                    entry_id = entry.id,
                    target_id = %entry.event.target_id,
                    "delivered {} -> {}",
                    entry.event.previous_state,
                    entry.event.new_state
                );
                outcome.delivered += 1;
            }

            DeliveryResult::RetryableFailure(reason) => {
                if self.settings.policy.is_exhausted(entry.attempts) {
                    let reason = format!("{reason} (gave up after {} attempts)", entry.attempts);
                    self.queue.dead_letter(entry.id, &reason).await?;
                    error!(entry_id = entry.id, target_id = %entry.event.target_id, "dead-lettered: {reason}");
                    outcome.dead_lettered += 1;
                } else {
                    let backoff = self.settings.policy.backoff(entry.attempts);
                    self.queue.requeue(entry.id, backoff, &reason).await?;
                    debug!(
                        entry_id = entry.id,
                        attempt = entry.attempts,
                        "retrying in {:?}: {reason}",
                        backoff
                    );
                    outcome.retried += 1;
                }
            }

            DeliveryResult::PermanentFailure(reason) => {
                self.queue.dead_letter(entry.id, &reason).await?;
                error!(entry_id = entry.id, target_id = %entry.event.target_id, "dead-lettered: {reason}");
                outcome.dead_lettered += 1;
            }
        }

        Ok(outcome)
    }

    async fn purge_expired(&self) {
        let Some(days) = self.settings.dead_letter_retention_days else {
            return;
        };
        let Some(before) = chrono::Duration::try_days(i64::from(days))
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            warn!("dead letter retention of {days} days is out of range, skipping cleanup");
            return;
        };

        match self.queue.backend().purge_dead_letters(before).await {
            Ok(0) => trace!("no expired dead letters"),
            Ok(purged) => info!("purged {purged} dead letters older than {days} days"),
            Err(e) => error!("dead letter cleanup failed: {e}"),
        }
    }
}

/// Handle for controlling the DispatcherActor
#[derive(Clone)]
pub struct DispatcherHandle {
    sender: mpsc::Sender<DispatcherCommand>,
    cancel: CancellationToken,
}

impl DispatcherHandle {
    /// Spawn the dispatcher. The join handle completes once the actor stopped.
    pub fn spawn(
        queue: DispatchQueue,
        client: OrchestratorClient,
        settings: DispatcherSettings,
    ) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();

        let actor = DispatcherActor::new(queue, client, settings, cmd_rx, cancel.clone());
        let task = tokio::spawn(actor.run());

        (
            Self {
                sender: cmd_tx,
                cancel,
            },
            task,
        )
    }

    /// Run a drain pass now and wait for its outcome
    pub async fn drain_now(&self) -> Result<DrainReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(DispatcherCommand::DrainNow { respond_to: tx })
            .await
            .context("failed to send DrainNow command")?;

        rx.await.context("failed to receive response")
    }

    /// Ask the actor to stop; deliveries in flight get the grace period
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
