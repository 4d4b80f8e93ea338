//! MonitorActor - Samples targets and turns state changes into queued events
//!
//! A single actor drives every target. It ticks at the greatest common
//! divisor of the target intervals and only samples targets that are due,
//! so a 15s and a 30s target share one loop without drifting apart.
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick → Sample due targets (concurrently) → Evaluate → Detect → DispatchQueue::enqueue
//!     ↑
//!     └─── Commands (PollNow, CurrentState, States, Shutdown)
//! ```
//!
//! Evaluation and detection run sequentially in configuration order, and the
//! detector state is owned by this actor alone.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::{DetectorConfig, ResolvedTarget};
use crate::dispatch::DispatchQueue;
use crate::monitors::{Sampler, TransitionDetector, evaluate};
use crate::storage::StorageError;
use crate::{HealthState, TransitionEvent};

use super::messages::MonitorCommand;

/// Enqueue attempts per event before the transition is given up
const ENQUEUE_ATTEMPTS: u32 = 3;

/// Pause before the second enqueue attempt, doubled for each further one
const ENQUEUE_BACKOFF: Duration = Duration::from_millis(50);

/// Longest tick period, so the ticker never schedules past the clock's range
const MAX_CADENCE: Duration = Duration::from_secs(24 * 60 * 60);

/// Tick period shared by all targets
pub fn cadence(targets: &[ResolvedTarget]) -> Duration {
    fn gcd(a: u64, b: u64) -> u64 {
        if b == 0 { a } else { gcd(b, a % b) }
    }

    let secs = targets
        .iter()
        .map(|target| target.interval.as_secs().max(1))
        .reduce(gcd)
        .unwrap_or(1);
    Duration::from_secs(secs).min(MAX_CADENCE)
}

pub struct MonitorActor {
    targets: Vec<ResolvedTarget>,

    /// When each target (same index as `targets`) is next due
    next_due: Vec<Instant>,

    sampler: Sampler,

    detector: TransitionDetector,

    queue: DispatchQueue,

    command_rx: mpsc::Receiver<MonitorCommand>,

    cadence: Duration,
}

impl MonitorActor {
    pub fn new(
        targets: Vec<ResolvedTarget>,
        sampler: Sampler,
        detector_config: &DetectorConfig,
        queue: DispatchQueue,
        command_rx: mpsc::Receiver<MonitorCommand>,
    ) -> Self {
        let mut detector = TransitionDetector::new(detector_config);
        for target in &targets {
            detector.register(&target.id);
        }

        Self {
            cadence: cadence(&targets),
            next_due: Vec::new(),
            targets,
            sampler,
            detector,
            queue,
            command_rx,
        }
    }

    /// Run the actor's main loop
    ///
    /// Runs until a Shutdown command is received or the command channel is
    /// closed. A cycle in progress always completes first.
    #[instrument(skip(self), fields(targets = self.targets.len()))]
    pub async fn run(mut self) {
        debug!("starting monitor actor with a {:?} cadence", self.cadence);

        let now = Instant::now();
        let first_tick = now.checked_add(self.cadence).unwrap_or(now);
        self.next_due = vec![first_tick; self.targets.len()];

        let mut ticker = interval_at(first_tick, self.cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_ack = None;

        loop {
            tokio::select! {
                tick = ticker.tick() => {
                    let due = self.due_targets(tick);
                    if !due.is_empty() {
                        self.run_cycle(&due).await;
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        MonitorCommand::PollNow { respond_to } => {
                            debug!("received PollNow command");
                            let all: Vec<usize> = (0..self.targets.len()).collect();
                            let events = self.run_cycle(&all).await;
                            let _ = respond_to.send(events);
                        }

                        MonitorCommand::CurrentState { target_id, respond_to } => {
                            let _ = respond_to.send(self.detector.confirmed_state(&target_id));
                        }

                        MonitorCommand::States { respond_to } => {
                            let _ = respond_to.send(self.detector.states());
                        }

                        MonitorCommand::Shutdown { respond_to } => {
                            debug!("received shutdown command");
                            shutdown_ack = Some(respond_to);
                            break;
                        }
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        debug!("monitor actor stopped");
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
    }

    /// Indices of targets due at the scheduled `tick`, advancing their schedule
    fn due_targets(&mut self, tick: Instant) -> Vec<usize> {
        let mut due = Vec::new();
        for (index, target) in self.targets.iter().enumerate() {
            if self.next_due[index] <= tick {
                // an interval too large to schedule falls back to every tick
                self.next_due[index] = tick.checked_add(target.interval).unwrap_or(tick);
                due.push(index);
            }
        }
        trace!("{} of {} targets due", due.len(), self.targets.len());
        due
    }

    /// One monitoring cycle over the given targets. Returns the emitted events.
    async fn run_cycle(&mut self, indices: &[usize]) -> Vec<TransitionEvent> {
        let targets: Vec<&ResolvedTarget> = indices
            .iter()
            .filter_map(|&index| self.targets.get(index))
            .collect();
        let snapshots = self.sampler.sample_all(&targets).await;

        let mut events = Vec::new();
        for (target, snapshot) in targets.iter().zip(&snapshots) {
            let state = evaluate(target, snapshot);
            trace!(target_id = %target.id, %state, "evaluated");

            let Some(event) = self.detector.detect(&target.id, state, snapshot) else {
                continue;
            };
            info!(
                target_id = %event.target_id,
                "{} -> {} ({})",
                event.previous_state,
                event.new_state,
                event.summary
            );

            self.enqueue(&event).await;
            events.push(event);
        }
        events
    }

    /// Queue a confirmed transition, retrying transient storage failures.
    ///
    /// The detector has already moved on, so a failed enqueue would lose the
    /// transition for good. Only a closed queue gives up at once.
    async fn enqueue(&self, event: &TransitionEvent) {
        let mut backoff = ENQUEUE_BACKOFF;
        for attempt in 1..=ENQUEUE_ATTEMPTS {
            match self.queue.enqueue(event.clone()).await {
                Ok(receipt) => {
                    trace!("queued as entry {}", receipt.id);
                    return;
                }
                Err(StorageError::QueueClosed) => {
                    warn!(target_id = %event.target_id, "queue closed, transition not queued");
                    return;
                }
                Err(e) if attempt < ENQUEUE_ATTEMPTS => {
                    warn!(
                        target_id = %event.target_id,
                        "enqueue attempt {attempt}/{ENQUEUE_ATTEMPTS} failed: {e}"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => {
                    error!(
                        target_id = %event.target_id,
                        "failed to queue transition after {ENQUEUE_ATTEMPTS} attempts: {e}"
                    );
                }
            }
        }
    }
}

/// Handle for controlling the MonitorActor
///
/// Cheap to clone and share across tasks.
#[derive(Clone)]
pub struct MonitorHandle {
    sender: mpsc::Sender<MonitorCommand>,
}

impl MonitorHandle {
    /// Spawn the monitor actor for the given targets
    pub fn spawn(
        targets: Vec<ResolvedTarget>,
        sampler: Sampler,
        detector_config: &DetectorConfig,
        queue: DispatchQueue,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let actor = MonitorActor::new(targets, sampler, detector_config, queue, cmd_rx);

        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    /// Run a cycle over every target immediately
    pub async fn poll_now(&self) -> Result<Vec<TransitionEvent>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(MonitorCommand::PollNow { respond_to: tx })
            .await
            .context("failed to send PollNow command")?;

        rx.await.context("failed to receive response")
    }

    pub async fn current_state(&self, target_id: &str) -> Result<Option<HealthState>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(MonitorCommand::CurrentState {
                target_id: target_id.to_string(),
                respond_to: tx,
            })
            .await
            .context("failed to send CurrentState command")?;

        rx.await.context("failed to receive response")
    }

    pub async fn states(&self) -> Result<BTreeMap<String, HealthState>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(MonitorCommand::States { respond_to: tx })
            .await
            .context("failed to send States command")?;

        rx.await.context("failed to receive response")
    }

    /// Stop the actor, waiting for a cycle in progress to complete
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(MonitorCommand::Shutdown { respond_to: tx })
            .await
            .context("failed to send Shutdown command")?;

        rx.await.context("monitor actor stopped without acknowledging")
    }
}
