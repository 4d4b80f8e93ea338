//! SQLite queue backend
//!
//! Durable dispatch queue stored in a local SQLite database file.
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Readers (status API) don't block the dispatcher
//! - **Migrations**: Automatic schema versioning with sqlx
//!
//! The pool holds a single connection. Every queue operation is a short
//! read-modify-write, and serializing them avoids lock upgrade failures
//! (`SQLITE_BUSY`) between concurrent transactions.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::{Pool, Sqlite};
use tracing::{debug, info, instrument, warn};

use super::backend::{EnqueueReceipt, HealthStatus, QueueBackend, QueueCounts};
use super::error::{StorageError, StorageResult};
use super::schema::{ENTRY_COLUMNS, EntryRow, timestamp_to_millis};
use crate::TransitionEvent;
use crate::dispatch::entry::{DispatchEntry, EntryId, idempotency_key};

/// SQLite queue backend
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Open (or create) the queue database and run migrations.
    ///
    /// ```no_run
    /// # use state_relay::storage::sqlite::SqliteBackend;
    /// # async fn example() -> anyhow::Result<()> {
    /// let backend = SqliteBackend::new("./relay.db").await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite queue at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    async fn fetch_entries(&self, sql: &str) -> StorageResult<Vec<DispatchEntry>> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| EntryRow::from_row(row)?.into_entry())
            .collect()
    }
}

/// Append `event` to its target, evicting the oldest live entries first.
async fn push(
    conn: &mut SqliteConnection,
    event: &TransitionEvent,
    capacity: usize,
) -> StorageResult<EnqueueReceipt> {
    let live: Vec<EntryId> = sqlx::query_scalar(
        "SELECT id FROM dispatch_entries
         WHERE target_id = ? AND state != 'dead_lettered'
         ORDER BY id",
    )
    .bind(&event.target_id)
    .fetch_all(&mut *conn)
    .await?;

    let excess = (live.len() + 1).saturating_sub(capacity);
    let dropped: Vec<EntryId> = live.into_iter().take(excess).collect();
    for id in &dropped {
        sqlx::query("DELETE FROM dispatch_entries WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
    }

    let now = timestamp_to_millis(&Utc::now());
    let key = idempotency_key(event);
    let result = sqlx::query(
        r#"
        INSERT INTO dispatch_entries (
            target_id, previous_state, new_state, detected_at, summary,
            idempotency_key, attempts, state, next_attempt_at, last_error, enqueued_at
        )
        VALUES (?, ?, ?, ?, ?, ?, 0, 'pending', ?, NULL, ?)
        "#,
    )
    .bind(&event.target_id)
    .bind(event.previous_state.as_str())
    .bind(event.new_state.as_str())
    .bind(timestamp_to_millis(&event.timestamp))
    .bind(&event.summary)
    .bind(&key)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(EnqueueReceipt {
        id: result.last_insert_rowid(),
        idempotency_key: key,
        dropped,
    })
}

#[async_trait]
impl QueueBackend for SqliteBackend {
    #[instrument(skip(self, event), fields(target_id = %event.target_id))]
    async fn enqueue(
        &self,
        event: TransitionEvent,
        capacity: usize,
    ) -> StorageResult<EnqueueReceipt> {
        let mut tx = self.pool.begin().await?;
        let receipt = push(&mut *tx, &event, capacity).await?;
        tx.commit().await?;

        debug!("enqueued entry {}", receipt.id);
        Ok(receipt)
    }

    #[instrument(skip(self))]
    async fn dequeue_batch(
        &self,
        max_n: usize,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<DispatchEntry>> {
        let now_millis = timestamp_to_millis(&now);
        let mut tx = self.pool.begin().await?;

        let ids: Vec<EntryId> = sqlx::query_scalar(
            r#"
            SELECT e.id FROM dispatch_entries e
            WHERE (e.state = 'pending'
                   OR (e.state = 'retry_scheduled' AND e.next_attempt_at <= ?))
              AND e.id = (
                  SELECT MIN(h.id) FROM dispatch_entries h
                  WHERE h.target_id = e.target_id AND h.state != 'dead_lettered'
              )
            ORDER BY e.id
            LIMIT ?
            "#,
        )
        .bind(now_millis)
        .bind(max_n as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            let sql = format!(
                "UPDATE dispatch_entries SET state = 'in_flight', attempts = attempts + 1
                 WHERE id = ? RETURNING {ENTRY_COLUMNS}"
            );
            let row = sqlx::query(&sql).bind(id).fetch_one(&mut *tx).await?;
            claimed.push(EntryRow::from_row(&row)?.into_entry()?);
        }

        tx.commit().await?;
        debug!("claimed {} entries", claimed.len());
        Ok(claimed)
    }

    #[instrument(skip(self))]
    async fn ack(&self, entry_id: EntryId) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM dispatch_entries WHERE id = ?")
            .bind(entry_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, error))]
    async fn requeue(
        &self,
        entry_id: EntryId,
        retry_at: DateTime<Utc>,
        error: &str,
    ) -> StorageResult<bool> {
        let result = sqlx::query(
            "UPDATE dispatch_entries
             SET state = 'retry_scheduled', next_attempt_at = ?, last_error = ?
             WHERE id = ? AND state != 'dead_lettered'",
        )
        .bind(timestamp_to_millis(&retry_at))
        .bind(error)
        .bind(entry_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, error))]
    async fn dead_letter(&self, entry_id: EntryId, error: &str) -> StorageResult<bool> {
        let result = sqlx::query(
            "UPDATE dispatch_entries SET state = 'dead_lettered', last_error = ?
             WHERE id = ? AND state != 'dead_lettered'",
        )
        .bind(error)
        .bind(entry_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn redrive(
        &self,
        entry_id: EntryId,
        capacity: usize,
    ) -> StorageResult<Option<EnqueueReceipt>> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM dispatch_entries
             WHERE id = ? AND state = 'dead_lettered'"
        );
        let Some(row) = sqlx::query(&sql)
            .bind(entry_id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };
        let entry = EntryRow::from_row(&row)?.into_entry()?;

        sqlx::query("DELETE FROM dispatch_entries WHERE id = ?")
            .bind(entry_id)
            .execute(&mut *tx)
            .await?;
        let receipt = push(&mut *tx, &entry.event, capacity).await?;
        tx.commit().await?;

        info!("redrove dead letter {} as entry {}", entry_id, receipt.id);
        Ok(Some(receipt))
    }

    #[instrument(skip(self))]
    async fn recover_in_flight(&self) -> StorageResult<usize> {
        let result =
            sqlx::query("UPDATE dispatch_entries SET state = 'pending' WHERE state = 'in_flight'")
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn pending_count(&self) -> StorageResult<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM dispatch_entries WHERE state != 'dead_lettered'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    async fn target_len(&self, target_id: &str) -> StorageResult<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM dispatch_entries
             WHERE target_id = ? AND state != 'dead_lettered'",
        )
        .bind(target_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    async fn dead_letters(&self) -> StorageResult<Vec<DispatchEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM dispatch_entries
             WHERE state = 'dead_lettered' ORDER BY id"
        );
        self.fetch_entries(&sql).await
    }

    #[instrument(skip(self), fields(before = %before))]
    async fn purge_dead_letters(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let result = sqlx::query(
            "DELETE FROM dispatch_entries WHERE state = 'dead_lettered' AND enqueued_at < ?",
        )
        .bind(timestamp_to_millis(&before))
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected() as usize;
        if deleted > 0 {
            info!("purged {} dead letters", deleted);
        }
        Ok(deleted)
    }

    async fn counts(&self) -> StorageResult<QueueCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM dispatch_entries GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = QueueCounts::default();
        for (state, count) in rows {
            let count = count as usize;
            match state.as_str() {
                "pending" => counts.pending = count,
                "in_flight" => counts.in_flight = count,
                "retry_scheduled" => counts.retry_scheduled = count,
                "dead_lettered" => counts.dead_lettered = count,
                other => warn!("ignoring rows with unknown state '{}'", other),
            }
        }
        Ok(counts)
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => Ok(HealthStatus {
                healthy: true,
                message: "SQLite queue operational".to_string(),
                metadata: HashMap::from([
                    ("backend".to_string(), "sqlite".to_string()),
                    ("db_path".to_string(), self.db_path.clone()),
                ]),
            }),
            Err(e) => {
                warn!("health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {}", e),
                    metadata: HashMap::new(),
                })
            }
        }
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite backend");
        self.pool.close().await;
        Ok(())
    }
}
