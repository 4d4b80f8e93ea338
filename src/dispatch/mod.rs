//! Reliable delivery of transition events to the orchestrator
//!
//! - [`entry`]: queue entries and their delivery state machine
//! - [`queue`]: bounded per-target FIFO front over a storage backend
//! - [`retry`]: backoff policy for retryable failures
//! - [`client`]: HTTP delivery and failure classification

pub mod client;
pub mod entry;
pub mod queue;
pub mod retry;

pub use client::{DeliveryResult, OrchestratorClient};
pub use entry::{DeliveryState, DispatchEntry, EntryId};
pub use queue::{DispatchQueue, QueueStats};
pub use retry::RetryPolicy;
