//! Transition detection with debounce
//!
//! Keeps the confirmed state of every target. A newly observed state has to
//! be seen for `debounce_cycles` consecutive cycles before it replaces the
//! confirmed one; any other reading in between starts the count over.
//!
//! Every target starts out `Unknown`, which is a placeholder rather than a
//! real prior state: the first confirmed state only sets the baseline,
//! unless `announce_initial_state` asks for an `unknown -> x` event.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, trace};

use crate::config::DetectorConfig;
use crate::{HealthState, Snapshot, TransitionEvent, now_millis};

#[derive(Debug, Clone)]
struct DetectorState {
    confirmed: HealthState,
    /// A real state has been confirmed at least once
    baselined: bool,
    /// Differing state being observed and for how many consecutive cycles
    candidate: Option<(HealthState, u32)>,
}

impl Default for DetectorState {
    fn default() -> Self {
        Self {
            confirmed: HealthState::Unknown,
            baselined: false,
            candidate: None,
        }
    }
}

#[derive(Debug)]
pub struct TransitionDetector {
    debounce_cycles: u32,
    announce_initial: bool,
    targets: HashMap<String, DetectorState>,
}

impl TransitionDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            debounce_cycles: config.debounce_cycles.max(1),
            announce_initial: config.announce_initial_state,
            targets: HashMap::new(),
        }
    }

    /// Start tracking a target so it shows up as `Unknown` before its first reading
    pub fn register(&mut self, target_id: &str) {
        self.targets.entry(target_id.to_string()).or_default();
    }

    pub fn confirmed_state(&self, target_id: &str) -> Option<HealthState> {
        self.targets.get(target_id).map(|state| state.confirmed)
    }

    pub fn states(&self) -> BTreeMap<String, HealthState> {
        self.targets
            .iter()
            .map(|(id, state)| (id.clone(), state.confirmed))
            .collect()
    }

    /// Feed one evaluated reading. Returns an event when the confirmed state changes.
    pub fn detect(
        &mut self,
        target_id: &str,
        observed: HealthState,
        snapshot: &Snapshot,
    ) -> Option<TransitionEvent> {
        let state = self.targets.entry(target_id.to_string()).or_default();

        if observed == state.confirmed {
            if state.candidate.take().is_some() {
                trace!(target_id, "candidate state interrupted");
            }
            return None;
        }

        let streak = match state.candidate {
            Some((candidate, streak)) if candidate == observed => streak + 1,
            _ => 1,
        };
        if streak < self.debounce_cycles {
            trace!(target_id, %observed, streak, "awaiting confirmation");
            state.candidate = Some((observed, streak));
            return None;
        }

        let previous = state.confirmed;
        state.confirmed = observed;
        state.candidate = None;

        if !state.baselined {
            state.baselined = true;
            debug!(target_id, %observed, "baseline established");
            if !self.announce_initial {
                return None;
            }
        }

        debug!(target_id, %previous, %observed, "state transition");
        Some(TransitionEvent {
            target_id: target_id.to_string(),
            previous_state: previous,
            new_state: observed,
            timestamp: now_millis(),
            summary: snapshot.summary(),
        })
    }
}
