//! Actor-based relay core
//!
//! Each actor runs as an independent async task, controlled through a
//! cloneable handle that sends commands over an mpsc channel.
//!
//! ## Architecture Overview
//!
//! ```text
//!   ┌──────────────┐  enqueue   ┌───────────────┐  dequeue   ┌─────────────────┐  POST
//!   │ MonitorActor │──────────▶│ DispatchQueue │◀──────────│ DispatcherActor │───────▶ orchestrator
//!   └──────────────┘   notify   └───────────────┘ ack/requeue└─────────────────┘
//!          ▲                           │
//!          │ commands                  │ QueueBackend (SQLite / memory)
//!     MonitorHandle                    ▼
//! ```
//!
//! The two actors share nothing but the queue, whose operations are atomic.
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: Each actor has an mpsc command channel for control messages
//! 2. **Request/Response**: oneshot channels for queries (states, drain reports)
//! 3. **Wake-ups**: the queue's `Notify` tells the dispatcher about new entries

pub mod dispatcher;
pub mod messages;
pub mod monitor;

pub use dispatcher::{DispatcherHandle, DispatcherSettings};
pub use messages::DrainReport;
pub use monitor::MonitorHandle;
