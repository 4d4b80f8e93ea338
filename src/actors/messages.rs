//! Message types for actor communication
//!
//! Commands are sent to one specific actor over its mpsc channel. Queries
//! carry a oneshot sender for the reply.

use std::collections::BTreeMap;

use tokio::sync::oneshot;

use crate::{HealthState, TransitionEvent};

/// Commands that can be sent to the MonitorActor
#[derive(Debug)]
pub enum MonitorCommand {
    /// Run one cycle over every target now, due or not
    ///
    /// Replies with the events the cycle produced. Used for testing and
    /// manual refresh operations.
    PollNow {
        respond_to: oneshot::Sender<Vec<TransitionEvent>>,
    },

    /// Confirmed state of one target, `None` if it is not configured
    CurrentState {
        target_id: String,
        respond_to: oneshot::Sender<Option<HealthState>>,
    },

    /// Confirmed state of every target
    States {
        respond_to: oneshot::Sender<BTreeMap<String, HealthState>>,
    },

    /// Finish the current cycle and stop
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Commands that can be sent to the DispatcherActor
#[derive(Debug)]
pub enum DispatcherCommand {
    /// Run one drain pass now and report what it did
    DrainNow {
        respond_to: oneshot::Sender<DrainReport>,
    },
}

/// Outcome counts of one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

impl DrainReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.retried + self.dead_lettered
    }

    pub(crate) fn absorb(&mut self, other: DrainReport) {
        self.delivered += other.delivered;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
    }
}
