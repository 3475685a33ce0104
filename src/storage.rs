use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};

use crate::error::{BridgeError, Result};
use crate::types::{Message, MessageStatus};

/// Retry backoff step: two minutes per accumulated retry.
const BACKOFF_STEP_SECS: i64 = 120;

/// Durable message store.
///
/// The store is the only shared mutable state in the bridge: the ingest
/// path inserts, the scheduler claims and advances, the retention sweep
/// deletes. All operations are individually atomic; the store assumes a
/// single process writer.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Upsert a message by id. The row is durable once this returns.
    async fn save(&self, msg: &Message) -> Result<()>;

    /// Return up to `limit` messages eligible for delivery now, oldest
    /// first. This is a plain read, not a lock: it is only safe with a
    /// single scheduler claiming from the store.
    async fn claim_due(&self, limit: u32) -> Result<Vec<Message>>;

    /// Record a failed attempt: increments `retries`, stores the error and
    /// schedules the next attempt at `now + 2 * retries` minutes.
    async fn mark_retrying(&self, id: &str, error: &str) -> Result<()>;

    /// Terminal failure. The row is kept for operator inspection.
    async fn mark_failed(&self, id: &str, error: &str) -> Result<()>;

    /// Remove a row, used after a successful send.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Histogram of current rows by status.
    async fn stats(&self) -> Result<HashMap<String, i64>>;

    /// Delete `sent` rows older than the retention window. Returns the
    /// number of rows removed. `failed` rows are never swept.
    async fn sweep(&self, retention_days: u32) -> Result<u64>;

    async fn close(&self);
}

/// SQLite-backed [`MessageStore`].
///
/// WAL journal with `synchronous = NORMAL`: a crash may lose the last
/// unreplicated write, which under at-least-once delivery is equivalent to
/// the sender having to retry.
#[derive(Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path`. The parent
    /// directory is created first.
    pub async fn open(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|err| {
                    BridgeError::Storage(format!("failed to create database directory: {err}"))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store, used by tests. A single pooled connection keeps
    /// every caller on the same database.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                queue TEXT NOT NULL,
                body BLOB NOT NULL,
                headers TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                retries INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                error TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                next_retry_at INTEGER
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_status ON messages(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_next_retry ON messages(next_retry_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_queue ON messages(queue)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
impl SqliteStore {
    /// Test hook: read one row back.
    pub(crate) async fn get(&self, id: &str) -> Option<Message> {
        let row = sqlx::query(
            "SELECT id, path, queue, body, headers, timestamp, retries, status, error,
                    created_at, updated_at, next_retry_at
             FROM messages WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .unwrap();
        row.map(|row| row_to_message(&row).unwrap())
    }

    /// Test hook: collapse a pending backoff so the row is claimable now.
    pub(crate) async fn force_due(&self, id: &str) {
        sqlx::query("UPDATE messages SET next_retry_at = updated_at WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .unwrap();
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn save(&self, msg: &Message) -> Result<()> {
        let headers = serde_json::to_string(&msg.headers)
            .map_err(|err| BridgeError::Storage(format!("failed to serialize headers: {err}")))?;

        sqlx::query(
            "INSERT OR REPLACE INTO messages
             (id, path, queue, body, headers, timestamp, retries, status, error,
              created_at, updated_at, next_retry_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(&msg.id)
        .bind(&msg.path)
        .bind(&msg.queue)
        .bind(&msg.body)
        .bind(&headers)
        .bind(msg.timestamp.timestamp())
        .bind(i64::from(msg.retries))
        .bind(msg.status.as_str())
        .bind(&msg.error)
        .bind(msg.created_at.timestamp())
        .bind(msg.updated_at.timestamp())
        .bind(msg.next_retry_at.map(|t| t.timestamp()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn claim_due(&self, limit: u32) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT id, path, queue, body, headers, timestamp, retries, status, error,
                    created_at, updated_at, next_retry_at
             FROM messages
             WHERE status IN (?1, ?2) AND (next_retry_at IS NULL OR next_retry_at <= ?3)
             ORDER BY created_at ASC
             LIMIT ?4",
        )
        .bind(MessageStatus::Pending.as_str())
        .bind(MessageStatus::Retrying.as_str())
        .bind(Utc::now().timestamp())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_message).collect()
    }

    async fn mark_retrying(&self, id: &str, error: &str) -> Result<()> {
        // `retries` on the right-hand side is the pre-update value, so the
        // delay lands at 2 minutes per retry counted after the increment.
        sqlx::query(
            "UPDATE messages
             SET status = ?1, error = ?2, updated_at = ?3,
                 retries = retries + 1,
                 next_retry_at = ?3 + (retries + 1) * ?4
             WHERE id = ?5",
        )
        .bind(MessageStatus::Retrying.as_str())
        .bind(error)
        .bind(Utc::now().timestamp())
        .bind(BACKOFF_STEP_SECS)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE messages
             SET status = ?1, error = ?2, updated_at = ?3, next_retry_at = NULL
             WHERE id = ?4",
        )
        .bind(MessageStatus::Failed.as_str())
        .bind(error)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn stats(&self) -> Result<HashMap<String, i64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) FROM messages GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = HashMap::new();
        for row in rows {
            stats.insert(row.try_get::<String, _>(0)?, row.try_get::<i64, _>(1)?);
        }
        Ok(stats)
    }

    async fn sweep(&self, retention_days: u32) -> Result<u64> {
        let cutoff = Utc::now().timestamp() - i64::from(retention_days) * 86_400;
        let result = sqlx::query("DELETE FROM messages WHERE status = ?1 AND created_at < ?2")
            .bind(MessageStatus::Sent.as_str())
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message> {
    let headers: String = row.try_get("headers")?;
    let headers: HashMap<String, String> = serde_json::from_str(&headers)
        .map_err(|err| BridgeError::Storage(format!("failed to deserialize headers: {err}")))?;

    let status: String = row.try_get("status")?;
    let status = MessageStatus::parse(&status)
        .ok_or_else(|| BridgeError::Storage(format!("unknown message status: {status}")))?;

    let retries: i64 = row.try_get("retries")?;

    Ok(Message {
        id: row.try_get("id")?,
        path: row.try_get("path")?,
        queue: row.try_get("queue")?,
        body: row.try_get("body")?,
        headers,
        timestamp: timestamp_from_secs(row.try_get("timestamp")?)?,
        retries: retries.try_into().unwrap_or(0),
        status,
        error: row.try_get("error")?,
        created_at: timestamp_from_secs(row.try_get("created_at")?)?,
        updated_at: timestamp_from_secs(row.try_get("updated_at")?)?,
        next_retry_at: row
            .try_get::<Option<i64>, _>("next_retry_at")?
            .map(timestamp_from_secs)
            .transpose()?,
    })
}

fn timestamp_from_secs(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| BridgeError::Storage(format!("timestamp out of range: {secs}")))
}
