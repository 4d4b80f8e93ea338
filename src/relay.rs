//! Wiring of the monitor, the queue and the dispatcher
//!
//! [`Relay::start`] brings the pipeline up; [`Relay::shutdown`] takes it
//! down in order:
//!
//! 1. the monitor finishes its current cycle and stops
//! 2. the queue stops accepting events
//! 3. the dispatcher gets the grace period for deliveries in flight
//! 4. the backend is closed; undelivered entries stay stored

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::HealthState;
use crate::actors::{DispatcherHandle, DispatcherSettings, MonitorHandle};
use crate::config::{ResolvedConfig, StorageConfig};
use crate::dispatch::{DispatchEntry, DispatchQueue, EntryId, OrchestratorClient, QueueStats};
use crate::monitors::{MetricSource, Sampler, SystemSource};
use crate::storage::{EnqueueReceipt, HealthStatus, QueueBackend};

/// Time allowed on top of the grace period for the dispatcher to wind down
const STOP_MARGIN: Duration = Duration::from_secs(5);

pub struct Relay {
    monitor: MonitorHandle,
    dispatcher: DispatcherHandle,
    dispatcher_task: JoinHandle<()>,
    queue: DispatchQueue,
    shutdown_grace: Duration,
}

impl Relay {
    /// Start sampling the real host and delivering to the orchestrator
    pub async fn start(config: ResolvedConfig, backend: Arc<dyn QueueBackend>) -> Result<Self> {
        let source = SystemSource::new(config.sampler.read_timeout())
            .context("failed to build probe HTTP client")?;
        Self::start_with_source(config, backend, Arc::new(source)).await
    }

    /// Start with a custom metric source
    pub async fn start_with_source(
        config: ResolvedConfig,
        backend: Arc<dyn QueueBackend>,
        source: Arc<dyn MetricSource>,
    ) -> Result<Self> {
        let recovered = backend
            .recover_in_flight()
            .await
            .context("failed to recover in-flight entries")?;
        if recovered > 0 {
            info!("recovered {recovered} entries left in flight by a previous run");
        }

        let queue = DispatchQueue::new(backend, config.dispatch.queue_capacity_per_target);
        let client = OrchestratorClient::new(&config.orchestrator)
            .context("failed to build orchestrator client")?;

        let dead_letter_retention_days = match &config.storage {
            StorageConfig::Sqlite {
                dead_letter_retention_days,
                ..
            } => *dead_letter_retention_days,
            StorageConfig::None => None,
        };
        let settings = DispatcherSettings {
            policy: config.dispatch.retry_policy(),
            batch_size: config.dispatch.batch_size,
            poll_interval: config.dispatch.poll_interval(),
            shutdown_grace: config.dispatch.shutdown_grace(),
            dead_letter_retention_days,
        };
        let (dispatcher, dispatcher_task) =
            DispatcherHandle::spawn(queue.clone(), client, settings);

        let sampler = Sampler::new(source, config.sampler.read_timeout());
        info!(
            "monitoring {} targets, delivering to {}",
            config.targets.len(),
            config.orchestrator.endpoint_url
        );
        let monitor = MonitorHandle::spawn(config.targets, sampler, &config.detector, queue.clone());

        Ok(Self {
            monitor,
            dispatcher,
            dispatcher_task,
            queue,
            shutdown_grace: config.dispatch.shutdown_grace(),
        })
    }

    pub fn status(&self) -> StatusHandle {
        StatusHandle {
            monitor: self.monitor.clone(),
            queue: self.queue.clone(),
        }
    }

    pub fn monitor(&self) -> &MonitorHandle {
        &self.monitor
    }

    pub fn dispatcher(&self) -> &DispatcherHandle {
        &self.dispatcher
    }

    pub async fn shutdown(self) -> Result<()> {
        info!("shutting down relay");

        if let Err(e) = self.monitor.shutdown().await {
            warn!("monitor did not stop cleanly: {e:#}");
        }
        self.queue.close();

        self.dispatcher.shutdown();
        let mut task = self.dispatcher_task;
        match tokio::time::timeout(self.shutdown_grace.saturating_add(STOP_MARGIN), &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("dispatcher task failed: {e}"),
            Err(_) => {
                warn!("dispatcher did not stop in time, aborting");
                task.abort();
            }
        }

        match self.queue.pending_count().await {
            Ok(0) => {}
            Ok(pending) => info!("{pending} undelivered entries remain queued"),
            Err(e) => warn!("failed to count remaining entries: {e}"),
        }

        self.queue
            .backend()
            .close()
            .await
            .context("failed to close queue backend")?;
        info!("relay stopped");
        Ok(())
    }
}

/// Read-mostly view of the running relay for operators and the status API
#[derive(Clone)]
pub struct StatusHandle {
    monitor: MonitorHandle,
    queue: DispatchQueue,
}

impl StatusHandle {
    /// Confirmed state of a target, `None` if no such target is configured
    pub async fn current_state(&self, target_id: &str) -> Result<Option<HealthState>> {
        self.monitor.current_state(target_id).await
    }

    pub async fn target_states(&self) -> Result<BTreeMap<String, HealthState>> {
        self.monitor.states().await
    }

    /// Entries still awaiting delivery
    pub async fn pending_count(&self) -> Result<usize> {
        Ok(self.queue.pending_count().await?)
    }

    pub async fn dead_letters(&self) -> Result<Vec<DispatchEntry>> {
        Ok(self.queue.dead_letters().await?)
    }

    /// Give a dead letter another round of attempts. `None` if `entry_id`
    /// is not a dead letter.
    pub async fn redrive(&self, entry_id: EntryId) -> Result<Option<EnqueueReceipt>> {
        let receipt = self.queue.redrive(entry_id).await?;
        if let Some(receipt) = &receipt {
            info!("dead letter {entry_id} redriven as entry {}", receipt.id);
        }
        Ok(receipt)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        Ok(self.queue.stats().await?)
    }

    pub async fn backend_health(&self) -> Result<HealthStatus> {
        Ok(self.queue.backend().health_check().await?)
    }
}
