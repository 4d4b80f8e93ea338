pub mod actors;
#[cfg(feature = "api")]
pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod monitors;
pub mod relay;
pub mod storage;
pub mod util;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Discrete health classification of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Critical,
    Unknown,
}

impl HealthState {
    /// Rank used when several rules disagree: the worst reading wins.
    pub fn severity(self) -> u8 {
        match self {
            HealthState::Healthy => 0,
            HealthState::Unknown => 1,
            HealthState::Degraded => 2,
            HealthState::Critical => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Critical => "critical",
            HealthState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(HealthState::Healthy),
            "degraded" => Ok(HealthState::Degraded),
            "critical" => Ok(HealthState::Critical),
            "unknown" => Ok(HealthState::Unknown),
            other => Err(format!("unknown health state '{other}'")),
        }
    }
}

/// Raw metric reading of one sampling cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reading {
    Values { metrics: BTreeMap<String, f64> },
    Unreadable { reason: String },
}

/// Immutable record of what the sampler saw for a target at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub target_id: String,
    pub taken_at: DateTime<Utc>,
    pub reading: Reading,
}

impl Snapshot {
    pub fn new(target_id: impl Into<String>, metrics: BTreeMap<String, f64>) -> Self {
        Self {
            target_id: target_id.into(),
            taken_at: Utc::now(),
            reading: Reading::Values { metrics },
        }
    }

    pub fn unreadable(target_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            taken_at: Utc::now(),
            reading: Reading::Unreadable {
                reason: reason.into(),
            },
        }
    }

    pub fn is_unreadable(&self) -> bool {
        matches!(self.reading, Reading::Unreadable { .. })
    }

    /// Value of a named metric, `None` if unreadable or not sampled
    pub fn metric(&self, name: &str) -> Option<f64> {
        match &self.reading {
            Reading::Values { metrics } => metrics.get(name).copied(),
            Reading::Unreadable { .. } => None,
        }
    }

    /// Short human-readable summary, carried along with transition events
    pub fn summary(&self) -> String {
        match &self.reading {
            Reading::Values { metrics } if metrics.is_empty() => "no metrics".to_string(),
            Reading::Values { metrics } => metrics
                .iter()
                .map(|(name, value)| format!("{name}={value:.2}"))
                .collect::<Vec<_>>()
                .join(" "),
            Reading::Unreadable { reason } => format!("unreadable: {reason}"),
        }
    }
}

/// A confirmed change of a target's health state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub target_id: String,
    pub previous_state: HealthState,
    pub new_state: HealthState,
    pub timestamp: DateTime<Utc>,
    pub summary: String,
}

/// Current time truncated to milliseconds, the precision events are persisted with.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}
