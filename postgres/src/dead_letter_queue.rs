//! Dead Letter Queue (DLQ) for messages listeners gave up on.
//!
//! Provides persistent storage of poison messages exactly as they were
//! delivered, plus the operator workflow around them: list what is pending,
//! then resolve (after manual replay) or discard.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use ticketbus_core::aggregate::StoreError;
use ticketbus_core::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink};

/// Status of a failed message in the Dead Letter Queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DLQStatus {
    /// Waiting for an operator
    Pending,
    /// Being replayed or investigated
    Processing,
    /// Successfully reprocessed
    Resolved,
    /// Permanently discarded (cannot be fixed)
    Discarded,
}

impl DLQStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] if the string is not a known status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(StoreError::DatabaseError(format!("Invalid DLQ status: {s}"))),
        }
    }
}

/// An entry in the Dead Letter Queue.
#[derive(Debug, Clone)]
pub struct FailedMessage {
    /// Unique identifier for this DLQ entry
    pub id: i64,
    /// The dead letter as recorded by the listener
    pub letter: DeadLetter,
    /// Current processing status
    pub status: DLQStatus,
    /// When the entry was resolved or discarded
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved it
    pub resolved_by: Option<String>,
    /// Resolution or discard notes
    pub resolution_notes: Option<String>,
}

/// `PostgreSQL`-based Dead Letter Queue.
///
/// Implements [`DeadLetterSink`], so it plugs straight into
/// `Listener::with_dead_letter`.
///
/// # Example
///
/// ```no_run
/// use ticketbus_postgres::{DLQStatus, DeadLetterQueue};
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = DeadLetterQueue::new(pool);
///
/// for entry in dlq.list_pending(100).await? {
///     println!("{} #{}: {}", entry.letter.subject, entry.letter.sequence, entry.letter.error);
///     dlq.update_status(entry.id, DLQStatus::Processing).await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DeadLetterQueue {
    pool: PgPool,
}

impl DeadLetterQueue {
    /// Create a new Dead Letter Queue with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Add a dead letter.
    ///
    /// Returns the id of the created entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] if the insert fails.
    pub async fn add_entry(&self, letter: &DeadLetter) -> Result<i64, StoreError> {
        let sequence = i64::try_from(letter.sequence).map_err(|_| {
            StoreError::SerializationError(format!("sequence {} exceeds BIGINT", letter.sequence))
        })?;
        let attempts = i32::try_from(letter.attempts).unwrap_or(i32::MAX);

        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO failed_messages (
                subject, queue_group, sequence, attempts, data, error_message, failed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            ",
        )
        .bind(&letter.subject)
        .bind(&letter.queue_group)
        .bind(sequence)
        .bind(attempts)
        .bind(&letter.data)
        .bind(&letter.error)
        .bind(letter.failed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        tracing::warn!(
            dlq_id = id,
            subject = %letter.subject,
            queue_group = %letter.queue_group,
            sequence = letter.sequence,
            attempts = letter.attempts,
            error = %letter.error,
            "Message added to Dead Letter Queue"
        );

        metrics::counter!("ticketbus.dlq.added", "subject" => letter.subject.clone()).increment(1);

        Ok(id)
    }

    /// List pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<FailedMessage>, StoreError> {
        self.list_by_status(DLQStatus::Pending, limit).await
    }

    /// List entries by status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DLQStatus,
        limit: usize,
    ) -> Result<Vec<FailedMessage>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r"
            SELECT
                id, subject, queue_group, sequence, attempts, data, error_message,
                failed_at, status, resolved_at, resolved_by, resolution_notes
            FROM failed_messages
            WHERE status = $1
            ORDER BY failed_at ASC
            LIMIT $2
            ",
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        rows.iter().map(Self::row_to_failed_message).collect()
    }

    /// Get a specific entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if there is no such entry, or
    /// [`StoreError::DatabaseError`] if the query fails.
    pub async fn get_by_id(&self, id: i64) -> Result<FailedMessage, StoreError> {
        let row = sqlx::query(
            r"
            SELECT
                id, subject, queue_group, sequence, attempts, data, error_message,
                failed_at, status, resolved_at, resolved_by, resolution_notes
            FROM failed_messages
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(e.to_string()))?
        .ok_or_else(|| StoreError::NotFound(format!("dead letter {id}")))?;

        Self::row_to_failed_message(&row)
    }

    /// Update the status of an entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] if the update fails.
    pub async fn update_status(&self, id: i64, status: DLQStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE failed_messages SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        tracing::info!(dlq_id = id, status = status.as_str(), "DLQ entry status updated");

        Ok(())
    }

    /// Mark an entry as resolved.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] if the update fails.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE failed_messages
            SET status = 'resolved',
                resolved_at = NOW(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        tracing::info!(dlq_id = id, resolved_by, "DLQ entry marked as resolved");
        metrics::counter!("ticketbus.dlq.resolved").increment(1);

        Ok(())
    }

    /// Mark an entry as discarded (will never be replayed).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE failed_messages
            SET status = 'discarded',
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        tracing::warn!(dlq_id = id, reason, "DLQ entry marked as discarded");
        metrics::counter!("ticketbus.dlq.discarded").increment(1);

        Ok(())
    }

    /// Count pending entries.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM failed_messages WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        Ok(count)
    }

    fn row_to_failed_message(row: &sqlx::postgres::PgRow) -> Result<FailedMessage, StoreError> {
        let status: String = row.get("status");
        let sequence: i64 = row.get("sequence");
        let attempts: i32 = row.get("attempts");

        Ok(FailedMessage {
            id: row.get("id"),
            letter: DeadLetter {
                subject: row.get("subject"),
                queue_group: row.get("queue_group"),
                sequence: u64::try_from(sequence).unwrap_or_default(),
                attempts: u32::try_from(attempts).unwrap_or_default(),
                data: row.get("data"),
                error: row.get("error_message"),
                failed_at: row.get("failed_at"),
            },
            status: DLQStatus::parse(&status)?,
            resolved_at: row.get("resolved_at"),
            resolved_by: row.get("resolved_by"),
            resolution_notes: row.get("resolution_notes"),
        })
    }
}

impl DeadLetterSink for DeadLetterQueue {
    fn record(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            self.add_entry(&letter)
                .await
                .map(|_| ())
                .map_err(|e| DeadLetterError(e.to_string()))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn dlq_status_parses_its_own_names() {
        for status in [
            DLQStatus::Pending,
            DLQStatus::Processing,
            DLQStatus::Resolved,
            DLQStatus::Discarded,
        ] {
            assert_eq!(DLQStatus::parse(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn dlq_status_invalid() {
        assert!(DLQStatus::parse("archived").is_err());
    }
}
