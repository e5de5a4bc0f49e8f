use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use uuid::Uuid;

use stagtrail_common::ProcessingStatus;

/// One camera still. Status follows `pending → processing → {completed,
/// failed}`; every transition here is a compare-and-swap so concurrent
/// workers cannot double-process.
#[derive(Debug, Clone)]
pub struct Image {
    pub id: Uuid,
    pub location_id: Uuid,
    pub path: String,
    pub filename: String,
    pub captured_at: DateTime<Utc>,
    pub processing_status: ProcessingStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl FromRow<'_, PgRow> for Image {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        let status_raw: String = row.try_get("processing_status")?;
        let processing_status = status_raw.parse::<ProcessingStatus>().map_err(|e| {
            sqlx::Error::ColumnDecode {
                index: "processing_status".into(),
                source: e.into(),
            }
        })?;
        Ok(Self {
            id: row.try_get("id")?,
            location_id: row.try_get("location_id")?,
            path: row.try_get("path")?,
            filename: row.try_get("filename")?,
            captured_at: row.try_get("captured_at")?,
            processing_status,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl Image {
    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM images WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    /// CAS on `processing_status`. Returns false when the stored status no
    /// longer matches `from`, i.e. the caller lost the race.
    pub async fn try_transition(
        id: Uuid,
        from: ProcessingStatus,
        to: ProcessingStatus,
        pool: &PgPool,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE images SET processing_status = $3 WHERE id = $1 AND processing_status = $2",
        )
        .bind(id)
        .bind(from.to_string())
        .bind(to.to_string())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Terminal failure. Only a `processing` image can fail; the message is
    /// the short operator-facing classification, never a stack trace.
    pub async fn mark_failed(id: Uuid, message: &str, pool: &PgPool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE images SET processing_status = 'failed', error_message = $2
            WHERE id = $1 AND processing_status = 'processing'
            "#,
        )
        .bind(id)
        .bind(message)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Images never picked up by a detection worker, oldest first. Used by
    /// the backfill script.
    pub async fn pending_ids(limit: i64, pool: &PgPool) -> Result<Vec<Uuid>> {
        let rows = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM images
            WHERE processing_status = 'pending'
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}
