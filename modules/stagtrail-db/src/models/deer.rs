use anyhow::Result;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgConnection, PgPool, Row};
use uuid::Uuid;

use stagtrail_common::Sex;

/// A persistent individual-animal profile. `embedding` is the primary
/// search key; `embedding_alt` only re-ranks the shortlist. Both are unit
/// vectors.
#[derive(Debug, Clone)]
pub struct Deer {
    pub id: Uuid,
    pub sex: Sex,
    pub embedding: Vector,
    pub embedding_alt: Option<Vector>,
    pub embedding_version: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub sighting_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for a freshly discovered individual.
#[derive(Debug, Clone)]
pub struct NewDeer {
    pub sex: Sex,
    pub embedding: Vector,
    pub embedding_alt: Option<Vector>,
    pub embedding_version: String,
    pub seen_at: DateTime<Utc>,
}

impl FromRow<'_, PgRow> for Deer {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        let sex_raw: String = row.try_get("sex")?;
        let sex = sex_raw.parse::<Sex>().map_err(|e| sqlx::Error::ColumnDecode {
            index: "sex".into(),
            source: e.into(),
        })?;
        Ok(Self {
            id: row.try_get("id")?,
            sex,
            embedding: row.try_get("embedding")?,
            embedding_alt: row.try_get("embedding_alt")?,
            embedding_version: row.try_get("embedding_version")?,
            first_seen: row.try_get("first_seen")?,
            last_seen: row.try_get("last_seen")?,
            sighting_count: row.try_get("sighting_count")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl Deer {
    pub async fn insert(new: &NewDeer, conn: &mut PgConnection) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO deer
                (sex, embedding, embedding_alt, embedding_version,
                 first_seen, last_seen, sighting_count)
            VALUES ($1, $2, $3, $4, $5, $5, 1)
            RETURNING *
            "#,
        )
        .bind(new.sex.to_string())
        .bind(&new.embedding)
        .bind(&new.embedding_alt)
        .bind(&new.embedding_version)
        .bind(new.seen_at)
        .fetch_one(conn)
        .await
        .map_err(Into::into)
    }

    /// Approximate top-k by cosine distance on the primary embedding,
    /// optionally restricted by sex (profiles of unknown sex always pass
    /// the restriction). Returns `(profile, cosine_distance)` pairs nearest
    /// first.
    pub async fn nearest(
        query: &Vector,
        sex: Option<Sex>,
        k: i64,
        pool: &PgPool,
    ) -> Result<Vec<(Self, f64)>> {
        let rows = sqlx::query(
            r#"
            SELECT *, (embedding <=> $1) AS distance
            FROM deer
            WHERE $2::text IS NULL OR sex = $2 OR sex = 'unknown'
            ORDER BY embedding <=> $1
            LIMIT $3
            "#,
        )
        .bind(query)
        .bind(sex.map(|s| s.to_string()))
        .bind(k)
        .fetch_all(pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let deer = Deer::from_row(&row)?;
                let distance: f64 = row.try_get("distance")?;
                Ok((deer, distance))
            })
            .collect::<sqlx::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    /// Row-lock read for the Re-ID update path. Blocks until the caller
    /// holds the lock; the profile may have moved since it was scored, so
    /// callers re-score against the returned row.
    pub async fn find_for_update(id: Uuid, conn: &mut PgConnection) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM deer WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(conn)
            .await
            .map_err(Into::into)
    }

    /// Absorb a sighting under the caller's row lock: new (EMA-updated)
    /// embeddings, widened seen range, count bump, and sex inheritance for
    /// profiles that were unknown.
    pub async fn apply_sighting(
        id: Uuid,
        embedding: &Vector,
        embedding_alt: Option<&Vector>,
        sex: Sex,
        seen_at: DateTime<Utc>,
        conn: &mut PgConnection,
    ) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE deer SET
                embedding = $2,
                embedding_alt = COALESCE($3, embedding_alt),
                sex = CASE WHEN sex = 'unknown' THEN $4 ELSE sex END,
                first_seen = LEAST(first_seen, $5),
                last_seen = GREATEST(last_seen, $5),
                sighting_count = sighting_count + 1,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(embedding)
        .bind(embedding_alt)
        .bind(sex.to_string())
        .bind(seen_at)
        .fetch_one(conn)
        .await
        .map_err(Into::into)
    }

    /// Count a burst-reuse sighting: no embedding change, just the seen
    /// range and counter.
    pub async fn bump_sighting(
        id: Uuid,
        seen_at: DateTime<Utc>,
        conn: &mut PgConnection,
    ) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE deer SET
                first_seen = LEAST(first_seen, $2),
                last_seen = GREATEST(last_seen, $2),
                sighting_count = sighting_count + 1,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(seen_at)
        .fetch_one(conn)
        .await
        .map_err(Into::into)
    }

    /// Swap in embeddings from a new extractor version, atomically per
    /// profile. Used by the re-embed script.
    pub async fn update_embedding(
        id: Uuid,
        embedding: &Vector,
        embedding_alt: Option<&Vector>,
        version: &str,
        pool: &PgPool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE deer SET embedding = $2, embedding_alt = $3,
                   embedding_version = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(embedding)
        .bind(embedding_alt)
        .bind(version)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn all_ids(pool: &PgPool) -> Result<Vec<Uuid>> {
        let rows = sqlx::query_scalar::<_, Uuid>("SELECT id FROM deer ORDER BY created_at ASC")
            .fetch_all(pool)
            .await?;
        Ok(rows)
    }
}
