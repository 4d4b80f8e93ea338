//! Storage backends for the dispatch queue
//!
//! ## Design
//!
//! - **Trait-based**: `QueueBackend` allows swapping implementations
//! - **Async**: All operations are async for compatibility with Tokio actors
//! - **Atomic**: Each call is one unit of work; producer and consumer never
//!   share any other state
//!
//! ## Backends
//!
//! - **SQLite** (default): Durable, survives restarts
//! - **In-Memory**: No persistence, for tests or when loss on restart is fine
//!
//! ## Usage
//!
//! ```no_run
//! use state_relay::storage::{QueueBackend, sqlite::SqliteBackend};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = SqliteBackend::new("./relay.db").await?;
//!     println!("{} entries pending", backend.pending_count().await?);
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use tracing::info;

use crate::config::StorageConfig;

pub mod backend;
pub mod error;
pub mod memory;
#[cfg(feature = "storage-sqlite")]
pub mod schema;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use backend::{EnqueueReceipt, HealthStatus, QueueBackend, QueueCounts};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryBackend;

/// Open the backend selected by the configuration
pub async fn open(config: &StorageConfig) -> StorageResult<Arc<dyn QueueBackend>> {
    match config {
        StorageConfig::None => {
            info!("using in-memory dispatch queue (events are lost on restart)");
            Ok(Arc::new(MemoryBackend::new()))
        }
        #[cfg(feature = "storage-sqlite")]
        StorageConfig::Sqlite { path, .. } => {
            Ok(Arc::new(sqlite::SqliteBackend::new(path).await?))
        }
        #[cfg(not(feature = "storage-sqlite"))]
        StorageConfig::Sqlite { .. } => Err(StorageError::ConnectionFailed(
            "built without the storage-sqlite feature".to_string(),
        )),
    }
}
