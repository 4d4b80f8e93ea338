//! Threshold rules: snapshot in, health state out

use crate::config::{ResolvedTarget, Threshold};
use crate::{HealthState, Snapshot};

/// Classify a snapshot against the target's rules.
///
/// Pure and deterministic. Each rule is judged on its own (critical tier
/// first), and the most severe verdict wins.
pub fn evaluate(target: &ResolvedTarget, snapshot: &Snapshot) -> HealthState {
    if snapshot.is_unreadable() {
        return HealthState::Unknown;
    }

    target
        .thresholds
        .iter()
        .map(|rule| evaluate_rule(rule, snapshot))
        .max_by_key(|state| state.severity())
        .unwrap_or(HealthState::Healthy)
}

fn evaluate_rule(rule: &Threshold, snapshot: &Snapshot) -> HealthState {
    let Some(value) = snapshot.metric(&rule.metric) else {
        return HealthState::Unknown;
    };

    if rule.critical.is_some_and(|bound| bound.is_triggered_by(value)) {
        HealthState::Critical
    } else if rule.degraded.is_some_and(|bound| bound.is_triggered_by(value)) {
        HealthState::Degraded
    } else {
        HealthState::Healthy
    }
}
