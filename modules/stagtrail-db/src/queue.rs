//! DB-backed dispatch queue: named FIFO lanes with at-least-once delivery
//! and visibility timeouts.
//!
//! Work items carry ids only, never image bytes or embeddings. Attempts are
//! charged when a reservation is handed out, so a consumer that dies
//! without nacking still burns a try; an item that would exceed the retry
//! budget is moved to `dead_letters` instead of being delivered, and only
//! an operator puts it back.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::PgPool;
use uuid::Uuid;

/// Nack backoff: 2s * 2^(attempt-1), capped at 60s, plus up to 1s jitter.
const BACKOFF_BASE_SECS: f64 = 2.0;
const BACKOFF_CAP_SECS: f64 = 60.0;

/// A leased work item. Neither acked nor nacked within the visibility
/// timeout, it becomes visible again on its own.
#[derive(Debug, Clone)]
pub struct Reserved {
    pub handle: i64,
    pub queue: String,
    pub item_id: Uuid,
    /// 1-based reservation attempt for this item.
    pub attempt: i32,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeadLetter {
    pub id: i64,
    pub queue: String,
    pub item_id: Uuid,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub moved_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct DispatchQueue {
    pool: PgPool,
    max_retries: i32,
}

impl DispatchQueue {
    pub fn new(pool: PgPool, max_retries: u32) -> Self {
        Self {
            pool,
            max_retries: max_retries as i32,
        }
    }

    /// Append to the named FIFO. Safe to call repeatedly with the same id;
    /// consumers are idempotent, so duplicate entries only cost a no-op
    /// handler pass.
    pub async fn enqueue(&self, queue: &str, item_id: Uuid) -> Result<()> {
        sqlx::query("INSERT INTO dispatch_queue (queue, item_id) VALUES ($1, $2)")
            .bind(queue)
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Hand the next visible item to exactly one consumer and hide it for
    /// `visibility`. Items past the retry budget are swept to the
    /// dead-letter table first.
    pub async fn reserve(&self, queue: &str, visibility: Duration) -> Result<Option<Reserved>> {
        self.sweep_exhausted(queue).await?;

        let row = sqlx::query_as::<_, (i64, Uuid, i32)>(
            r#"
            UPDATE dispatch_queue
            SET reserved_until = NOW() + make_interval(secs => $3),
                attempts = attempts + 1
            WHERE id = (
                SELECT id FROM dispatch_queue
                WHERE queue = $1
                  AND available_at <= NOW()
                  AND (reserved_until IS NULL OR reserved_until < NOW())
                  AND attempts < $2
                ORDER BY id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, item_id, attempts
            "#,
        )
        .bind(queue)
        .bind(self.max_retries)
        .bind(visibility.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(handle, item_id, attempt)| Reserved {
            handle,
            queue: queue.to_string(),
            item_id,
            attempt,
        }))
    }

    /// Remove the item permanently.
    pub async fn ack(&self, reserved: &Reserved) -> Result<()> {
        sqlx::query("DELETE FROM dispatch_queue WHERE id = $1")
            .bind(reserved.handle)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Release the item for retry. `quick` skips the backoff (device OOM,
    /// where the remedy is elsewhere and the item itself is fine).
    pub async fn nack(&self, reserved: &Reserved, quick: bool, error: Option<&str>) -> Result<()> {
        let delay_secs = if quick {
            0.0
        } else {
            backoff_secs(reserved.attempt)
        };
        sqlx::query(
            r#"
            UPDATE dispatch_queue
            SET reserved_until = NULL,
                available_at = NOW() + make_interval(secs => $2),
                last_error = COALESCE($3, last_error)
            WHERE id = $1
            "#,
        )
        .bind(reserved.handle)
        .bind(delay_secs)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Move items past the retry budget to `dead_letters`.
    async fn sweep_exhausted(&self, queue: &str) -> Result<()> {
        let moved = sqlx::query(
            r#"
            WITH exhausted AS (
                DELETE FROM dispatch_queue
                WHERE id IN (
                    SELECT id FROM dispatch_queue
                    WHERE queue = $1
                      AND available_at <= NOW()
                      AND (reserved_until IS NULL OR reserved_until < NOW())
                      AND attempts >= $2
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING queue, item_id, attempts, last_error
            )
            INSERT INTO dead_letters (queue, item_id, attempts, last_error)
            SELECT queue, item_id, attempts, last_error FROM exhausted
            "#,
        )
        .bind(queue)
        .bind(self.max_retries)
        .execute(&self.pool)
        .await?;

        if moved.rows_affected() > 0 {
            tracing::warn!(
                queue,
                count = moved.rows_affected(),
                "items moved to dead-letter queue"
            );
        }
        Ok(())
    }

    pub async fn dead_letters(&self, queue: Option<&str>) -> Result<Vec<DeadLetter>> {
        sqlx::query_as::<_, DeadLetter>(
            r#"
            SELECT * FROM dead_letters
            WHERE $1::text IS NULL OR queue = $1
            ORDER BY moved_at ASC
            "#,
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    /// Put a dead letter back on its queue with a fresh retry budget.
    /// Operator-explicit only.
    pub async fn requeue_dead(&self, dead_letter_id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, (String, Uuid)>(
            "DELETE FROM dead_letters WHERE id = $1 RETURNING queue, item_id",
        )
        .bind(dead_letter_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((queue, item_id)) = row else {
            tx.rollback().await?;
            return Ok(false);
        };

        sqlx::query("INSERT INTO dispatch_queue (queue, item_id) VALUES ($1, $2)")
            .bind(&queue)
            .bind(item_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }
}

fn backoff_secs(attempt: i32) -> f64 {
    let exp = BACKOFF_BASE_SECS * 2f64.powi((attempt - 1).max(0));
    let jitter: f64 = rand::rng().random_range(0.0..1.0);
    exp.min(BACKOFF_CAP_SECS) + jitter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let first = backoff_secs(1);
        assert!((2.0..3.0).contains(&first));
        let fifth = backoff_secs(5);
        assert!((32.0..33.0).contains(&fifth));
        let huge = backoff_secs(20);
        assert!((60.0..61.0).contains(&huge));
    }
}
