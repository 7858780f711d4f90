//! Offline cache and audit log queries for the `PaperMinder` server.

use paperminder_core::db::{unix_timestamp, SECONDS_PER_DAY};
use sqlx::{QueryBuilder, Sqlite};

use super::db::{Database, DatabaseError};
use super::models::{CachedMessage, MessageLog};

impl Database {
    // =========================================================================
    // Offline cache queries
    // =========================================================================

    /// Stage a message for a recipient with no live connection.
    pub async fn cache_offline_message(
        &self,
        recipient_id: &str,
        sender_id: Option<&str>,
        sender_name: &str,
        message: &str,
    ) -> Result<i64, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO message_cache (recipient_id, sender_id, sender_name, message, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(recipient_id)
        .bind(sender_id)
        .bind(sender_name)
        .bind(message)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Undelivered cache entries for a recipient, oldest first.
    ///
    /// Entries are NOT marked delivered by this call. Use `mark_delivered`
    /// once they have been written to a connection.
    pub async fn list_undelivered_for(
        &self,
        recipient_id: &str,
    ) -> Result<Vec<CachedMessage>, DatabaseError> {
        let messages = sqlx::query_as::<_, CachedMessage>(
            "SELECT * FROM message_cache WHERE recipient_id = ? AND delivered = 0 ORDER BY created_at ASC, id ASC",
        )
        .bind(recipient_id)
        .fetch_all(self.pool())
        .await?;

        Ok(messages)
    }

    /// Mark a batch of cache entries delivered. Already-delivered rows are untouched.
    pub async fn mark_delivered(&self, ids: &[i64]) -> Result<u64, DatabaseError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE message_cache SET delivered = 1, delivered_at = ");
        qb.push_bind(unix_timestamp());
        qb.push(" WHERE delivered = 0 AND id IN (");
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = qb.build().execute(self.pool()).await?;
        Ok(result.rows_affected())
    }

    /// Delete delivered entries created more than `days` days ago.
    pub async fn purge_delivered_older_than(&self, days: u32) -> Result<u64, DatabaseError> {
        let cutoff = unix_timestamp() - i64::from(days) * SECONDS_PER_DAY;

        let result =
            sqlx::query("DELETE FROM message_cache WHERE delivered = 1 AND created_at < ?")
                .bind(cutoff)
                .execute(self.pool())
                .await?;

        Ok(result.rows_affected())
    }

    /// Count undelivered cache entries for a recipient.
    pub async fn count_undelivered_for(&self, recipient_id: &str) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM message_cache WHERE recipient_id = ? AND delivered = 0",
        )
        .bind(recipient_id)
        .fetch_one(self.pool())
        .await?;

        Ok(row.0)
    }

    // =========================================================================
    // Audit log queries
    // =========================================================================

    /// Persist an audit record of a message sent to `recipient_id`.
    pub async fn persist_audit_log(
        &self,
        sender_id: Option<&str>,
        recipient_id: &str,
        sender_name: &str,
        message: &str,
    ) -> Result<i64, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO message_logs (sender_id, recipient_id, sender_name, message, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(sender_id)
        .bind(recipient_id)
        .bind(sender_name)
        .bind(message)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Audit records for a recipient, newest first.
    pub async fn list_audit_logs_for(
        &self,
        recipient_id: &str,
    ) -> Result<Vec<MessageLog>, DatabaseError> {
        let logs = sqlx::query_as::<_, MessageLog>(
            "SELECT * FROM message_logs WHERE recipient_id = ? ORDER BY created_at DESC, id DESC",
        )
        .bind(recipient_id)
        .fetch_all(self.pool())
        .await?;

        Ok(logs)
    }
}
