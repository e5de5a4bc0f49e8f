use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// A fixed camera site. Created out of band; immutable during pipeline
/// operation. The FK from `images` refuses deletion while images reference
/// it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Location {
    pub id: Uuid,
    pub name: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl Location {
    pub async fn create(
        name: &str,
        lat: Option<f64>,
        lon: Option<f64>,
        pool: &PgPool,
    ) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO locations (name, lat, lon)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(lat)
        .bind(lon)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn find_by_name(name: &str, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM locations WHERE name = $1")
            .bind(name)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn list_all(pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM locations ORDER BY name ASC")
            .fetch_all(pool)
            .await
            .map_err(Into::into)
    }
}
