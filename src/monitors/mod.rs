//! Sampling, evaluation and transition detection
//!
//! One monitoring cycle for a target runs through all three stages:
//!
//! ```text
//! Sampler::sample ──Snapshot──▶ evaluate ──HealthState──▶ TransitionDetector::detect ──▶ Option<TransitionEvent>
//! ```

pub mod detector;
pub mod evaluator;
pub mod sampler;

pub use detector::TransitionDetector;
pub use evaluator::evaluate;
pub use sampler::{MetricSource, Metrics, Sampler, SystemSource};
