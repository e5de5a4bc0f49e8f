use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgConnection, PgPool, Row};
use uuid::Uuid;

use stagtrail_common::{BBox, DeerClass};

/// One detector box on one image. Duplicates are persisted so the full
/// detector output stays auditable, but they never enter Re-ID.
#[derive(Debug, Clone)]
pub struct Detection {
    pub id: Uuid,
    pub image_id: Uuid,
    pub bbox_x: i32,
    pub bbox_y: i32,
    pub bbox_width: i32,
    pub bbox_height: i32,
    pub confidence: f32,
    pub class: DeerClass,
    pub deer_id: Option<Uuid>,
    pub burst_group_id: Option<Uuid>,
    pub is_duplicate: bool,
    pub created_at: DateTime<Utc>,
}

/// Capture context a Re-ID worker needs alongside the detection row.
#[derive(Debug, Clone)]
pub struct DetectionContext {
    pub location_id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub image_path: String,
}

/// Insert payload for one detector result.
#[derive(Debug, Clone)]
pub struct NewDetection {
    pub image_id: Uuid,
    pub bbox: BBox,
    pub confidence: f32,
    pub class: DeerClass,
    pub is_duplicate: bool,
}

impl FromRow<'_, PgRow> for Detection {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        let class_raw: String = row.try_get("class")?;
        let class = class_raw
            .parse::<DeerClass>()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "class".into(),
                source: e.into(),
            })?;
        Ok(Self {
            id: row.try_get("id")?,
            image_id: row.try_get("image_id")?,
            bbox_x: row.try_get("bbox_x")?,
            bbox_y: row.try_get("bbox_y")?,
            bbox_width: row.try_get("bbox_width")?,
            bbox_height: row.try_get("bbox_height")?,
            confidence: row.try_get("confidence")?,
            class,
            deer_id: row.try_get("deer_id")?,
            burst_group_id: row.try_get("burst_group_id")?,
            is_duplicate: row.try_get("is_duplicate")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl Detection {
    pub fn bbox(&self) -> BBox {
        BBox::new(self.bbox_x, self.bbox_y, self.bbox_width, self.bbox_height)
    }

    /// Multi-row insert inside the caller's transaction. Returns rows in
    /// input order.
    pub async fn insert_bulk(rows: &[NewDetection], conn: &mut PgConnection) -> Result<Vec<Self>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let image_ids: Vec<Uuid> = rows.iter().map(|r| r.image_id).collect();
        let xs: Vec<i32> = rows.iter().map(|r| r.bbox.x).collect();
        let ys: Vec<i32> = rows.iter().map(|r| r.bbox.y).collect();
        let widths: Vec<i32> = rows.iter().map(|r| r.bbox.width).collect();
        let heights: Vec<i32> = rows.iter().map(|r| r.bbox.height).collect();
        let confidences: Vec<f32> = rows.iter().map(|r| r.confidence).collect();
        let classes: Vec<String> = rows.iter().map(|r| r.class.to_string()).collect();
        let duplicates: Vec<bool> = rows.iter().map(|r| r.is_duplicate).collect();

        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO detections
                (image_id, bbox_x, bbox_y, bbox_width, bbox_height,
                 confidence, class, is_duplicate)
            SELECT * FROM UNNEST(
                $1::uuid[], $2::int[], $3::int[], $4::int[], $5::int[],
                $6::real[], $7::text[], $8::bool[])
            RETURNING *
            "#,
        )
        .bind(&image_ids)
        .bind(&xs)
        .bind(&ys)
        .bind(&widths)
        .bind(&heights)
        .bind(&confidences)
        .bind(&classes)
        .bind(&duplicates)
        .fetch_all(conn)
        .await
        .map_err(Into::into)
    }

    /// Detection joined with its image's location, capture time, and path.
    pub async fn with_context(
        id: Uuid,
        pool: &PgPool,
    ) -> Result<Option<(Self, DetectionContext)>> {
        let row = sqlx::query(
            r#"
            SELECT d.*, i.location_id AS location_id,
                   i.captured_at AS captured_at, i.path AS image_path
            FROM detections d
            JOIN images i ON i.id = d.image_id
            WHERE d.id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;

        match row {
            Some(row) => {
                let detection = Detection::from_row(&row)?;
                let context = DetectionContext {
                    location_id: row.try_get("location_id")?,
                    captured_at: row.try_get("captured_at")?,
                    image_path: row.try_get("image_path")?,
                };
                Ok(Some((detection, context)))
            }
            None => Ok(None),
        }
    }

    /// Non-duplicate deer-class detections at a location whose image
    /// capture time lies within ±`window_secs` (inclusive) of `at`.
    /// Non-deer detections never join a burst: they can never share its
    /// profile.
    pub async fn burst_members(
        location_id: Uuid,
        at: DateTime<Utc>,
        window_secs: f64,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT d.* FROM detections d
            JOIN images i ON i.id = d.image_id
            WHERE i.location_id = $1
              AND d.is_duplicate = false
              AND d.class <> 'other'
              AND i.captured_at >= $2 - make_interval(secs => $3)
              AND i.captured_at <= $2 + make_interval(secs => $3)
            ORDER BY i.captured_at ASC
            "#,
        )
        .bind(location_id)
        .bind(at)
        .bind(window_secs)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    /// Stamp a burst group on every listed detection that lacks one.
    pub async fn stamp_burst_group(
        ids: &[Uuid],
        burst_group_id: Uuid,
        conn: &mut PgConnection,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE detections SET burst_group_id = $2 WHERE id = ANY($1) AND burst_group_id IS NULL",
        )
        .bind(ids)
        .bind(burst_group_id)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Deer-class detections that never got a profile assignment, oldest
    /// first. Used by the requeue script.
    pub async fn unassigned_deer_ids(limit: i64, pool: &PgPool) -> Result<Vec<Uuid>> {
        let rows = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM detections
            WHERE deer_id IS NULL AND is_duplicate = false AND class <> 'other'
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Most recent non-duplicate sighting of a profile, with context. Used
    /// by the re-embed script to pick an exemplar crop.
    pub async fn exemplar_for_deer(
        deer_id: Uuid,
        pool: &PgPool,
    ) -> Result<Option<(Self, DetectionContext)>> {
        let row = sqlx::query(
            r#"
            SELECT d.*, i.location_id AS location_id,
                   i.captured_at AS captured_at, i.path AS image_path
            FROM detections d
            JOIN images i ON i.id = d.image_id
            WHERE d.deer_id = $1 AND d.is_duplicate = false
            ORDER BY i.captured_at DESC
            LIMIT 1
            "#,
        )
        .bind(deer_id)
        .fetch_optional(pool)
        .await?;

        match row {
            Some(row) => {
                let detection = Detection::from_row(&row)?;
                let context = DetectionContext {
                    location_id: row.try_get("location_id")?,
                    captured_at: row.try_get("captured_at")?,
                    image_path: row.try_get("image_path")?,
                };
                Ok(Some((detection, context)))
            }
            None => Ok(None),
        }
    }
}
