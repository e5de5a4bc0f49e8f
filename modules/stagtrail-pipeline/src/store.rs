//! Postgres adapters for the worker trait seams.
//!
//! Transaction boundaries live here: an operation that the design calls
//! atomic is one transaction in this file. Lock order inside a transaction
//! is always profile row first, then burst member detections ordered by id,
//! so concurrent Re-ID workers cannot deadlock each other.

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use stagtrail_common::{
    cosine_similarity, ema_update, ensemble_score, ProcessingStatus, Sex,
};
use stagtrail_db::models::{Deer, Detection, Image, NewDeer, NewDetection};
use stagtrail_db::{DispatchQueue, Reserved};

use crate::traits::{
    AbsorbRequest, AssignOutcome, BurstMember, ClaimOutcome, CreateProfileRequest,
    DetectionRecord, ImageRecord, MetadataStore, NewDetectionRow, ProfileMatch, ProfileRecord,
    ReservedItem, WorkQueue,
};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn profile_record(deer: Deer) -> ProfileRecord {
    ProfileRecord {
        id: deer.id,
        sex: deer.sex,
        embedding: deer.embedding.to_vec(),
        embedding_alt: deer.embedding_alt.as_ref().map(|v| v.to_vec()),
        embedding_version: deer.embedding_version,
        first_seen: deer.first_seen,
        last_seen: deer.last_seen,
        sighting_count: deer.sighting_count,
    }
}

/// Lock every burst member row and return the profile another member is
/// already pinned to, if any. Serialises concurrent burst resolution.
async fn lock_members(
    member_ids: &[Uuid],
    exclude_deer: Option<Uuid>,
    conn: &mut PgConnection,
) -> Result<Option<Uuid>> {
    if member_ids.is_empty() {
        return Ok(None);
    }
    let rows = sqlx::query(
        "SELECT deer_id FROM detections WHERE id = ANY($1) ORDER BY id FOR UPDATE",
    )
    .bind(member_ids)
    .fetch_all(conn)
    .await?;

    for row in rows {
        let deer_id: Option<Uuid> = row.try_get("deer_id")?;
        if let Some(deer_id) = deer_id {
            if Some(deer_id) != exclude_deer {
                return Ok(Some(deer_id));
            }
        }
    }
    Ok(None)
}

/// Conditional assignment; false means the detection acquired a profile
/// since the caller read it.
async fn try_assign(
    detection_id: Uuid,
    deer_id: Uuid,
    burst_group_id: Option<Uuid>,
    conn: &mut PgConnection,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE detections
        SET deer_id = $2, burst_group_id = COALESCE(burst_group_id, $3)
        WHERE id = $1 AND deer_id IS NULL AND is_duplicate = false AND class <> 'other'
        "#,
    )
    .bind(detection_id)
    .bind(deer_id)
    .bind(burst_group_id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

#[async_trait]
impl MetadataStore for PgStore {
    async fn image(&self, id: Uuid) -> Result<Option<ImageRecord>> {
        let image = Image::find_by_id(id, &self.pool).await?;
        Ok(image.map(|i| ImageRecord {
            id: i.id,
            location_id: i.location_id,
            path: i.path,
            captured_at: i.captured_at,
            status: i.processing_status,
        }))
    }

    async fn claim_image(&self, id: Uuid) -> Result<ClaimOutcome> {
        let Some(image) = Image::find_by_id(id, &self.pool).await? else {
            return Ok(ClaimOutcome::Missing);
        };

        match image.processing_status {
            ProcessingStatus::Pending => {
                let won = Image::try_transition(
                    id,
                    ProcessingStatus::Pending,
                    ProcessingStatus::Processing,
                    &self.pool,
                )
                .await?;
                if won {
                    Ok(ClaimOutcome::Claimed)
                } else {
                    // Lost the CAS; report whatever the winner left behind.
                    match Image::find_by_id(id, &self.pool).await? {
                        Some(current) if current.processing_status.is_terminal() => {
                            Ok(ClaimOutcome::AlreadyTerminal(current.processing_status))
                        }
                        Some(_) => Ok(ClaimOutcome::InFlight),
                        None => Ok(ClaimOutcome::Missing),
                    }
                }
            }
            ProcessingStatus::Processing => Ok(ClaimOutcome::InFlight),
            status => Ok(ClaimOutcome::AlreadyTerminal(status)),
        }
    }

    async fn release_image(&self, id: Uuid) -> Result<bool> {
        Image::try_transition(
            id,
            ProcessingStatus::Processing,
            ProcessingStatus::Pending,
            &self.pool,
        )
        .await
    }

    async fn complete_image(&self, image_id: Uuid, rows: Vec<NewDetectionRow>) -> Result<Vec<Uuid>> {
        let mut tx = self.pool.begin().await?;

        let new_rows: Vec<NewDetection> = rows
            .into_iter()
            .map(|r| NewDetection {
                image_id,
                bbox: r.bbox,
                confidence: r.confidence,
                class: r.class,
                is_duplicate: r.is_duplicate,
            })
            .collect();

        let inserted = Detection::insert_bulk(&new_rows, &mut *tx).await?;

        let moved = sqlx::query(
            "UPDATE images SET processing_status = 'completed' WHERE id = $1 AND processing_status = 'processing'",
        )
        .bind(image_id)
        .execute(&mut *tx)
        .await?;
        if moved.rows_affected() != 1 {
            bail!("image {image_id} left processing before completion");
        }

        tx.commit().await?;
        Ok(inserted.into_iter().map(|d| d.id).collect())
    }

    async fn fail_image(&self, image_id: Uuid, message: &str) -> Result<()> {
        Image::mark_failed(image_id, message, &self.pool).await?;
        Ok(())
    }

    async fn detection(&self, id: Uuid) -> Result<Option<DetectionRecord>> {
        let found = Detection::with_context(id, &self.pool).await?;
        Ok(found.map(|(d, ctx)| DetectionRecord {
            id: d.id,
            image_id: d.image_id,
            location_id: ctx.location_id,
            captured_at: ctx.captured_at,
            image_path: ctx.image_path,
            bbox: d.bbox(),
            confidence: d.confidence,
            class: d.class,
            deer_id: d.deer_id,
            burst_group_id: d.burst_group_id,
            is_duplicate: d.is_duplicate,
        }))
    }

    async fn burst_members(
        &self,
        location_id: Uuid,
        at: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<BurstMember>> {
        let members =
            Detection::burst_members(location_id, at, window.as_secs_f64(), &self.pool).await?;
        Ok(members
            .into_iter()
            .map(|d| BurstMember {
                detection_id: d.id,
                deer_id: d.deer_id,
                burst_group_id: d.burst_group_id,
            })
            .collect())
    }

    async fn reuse_burst_assignment(
        &self,
        detection_id: Uuid,
        deer_id: Uuid,
        fallback_group: Uuid,
        member_ids: &[Uuid],
        seen_at: DateTime<Utc>,
    ) -> Result<AssignOutcome> {
        let mut tx = self.pool.begin().await?;

        let Some(_locked) = Deer::find_for_update(deer_id, &mut *tx).await? else {
            tx.rollback().await?;
            return Ok(AssignOutcome::ProfileMissing);
        };

        let _ = lock_members(member_ids, Some(deer_id), &mut *tx).await?;

        let group = sqlx::query_scalar::<_, Option<Uuid>>(
            "SELECT burst_group_id FROM detections WHERE id = ANY($1) AND burst_group_id IS NOT NULL LIMIT 1",
        )
        .bind(member_ids)
        .fetch_optional(&mut *tx)
        .await?
        .flatten()
        .unwrap_or(fallback_group);

        if !try_assign(detection_id, deer_id, Some(group), &mut *tx).await? {
            tx.rollback().await?;
            return Ok(AssignOutcome::AlreadyAssigned);
        }

        Detection::stamp_burst_group(member_ids, group, &mut *tx).await?;
        let profile = Deer::bump_sighting(deer_id, seen_at, &mut *tx).await?;

        tx.commit().await?;
        Ok(AssignOutcome::Assigned(profile_record(profile)))
    }

    async fn nearest_profiles(
        &self,
        query: &[f32],
        sex: Option<Sex>,
        k: usize,
    ) -> Result<Vec<ProfileMatch>> {
        let query = Vector::from(query.to_vec());
        let matches = Deer::nearest(&query, sex, k as i64, &self.pool).await?;
        Ok(matches
            .into_iter()
            .map(|(deer, distance)| ProfileMatch {
                primary_similarity: 1.0 - distance as f32,
                profile: profile_record(deer),
            })
            .collect())
    }

    async fn absorb_sighting(&self, request: AbsorbRequest) -> Result<AssignOutcome> {
        let mut tx = self.pool.begin().await?;

        let Some(locked) = Deer::find_for_update(request.profile_id, &mut *tx).await? else {
            tx.rollback().await?;
            return Ok(AssignOutcome::ProfileMissing);
        };

        // The profile may have moved while we waited on the lock; score the
        // row we actually hold.
        let stored = locked.embedding.to_vec();
        let primary = cosine_similarity(&request.query, &stored);
        let aux_sims: Vec<f32> = match (&request.query_alt, &locked.embedding_alt) {
            (Some(q), Some(stored_alt)) => vec![cosine_similarity(q, &stored_alt.to_vec())],
            _ => Vec::new(),
        };
        let rescored = ensemble_score(primary, &aux_sims, &request.weights);
        if rescored < request.min_score {
            tx.rollback().await?;
            return Ok(AssignOutcome::ScoreDrifted { rescored });
        }

        if let Some(other) =
            lock_members(&request.member_ids, Some(request.profile_id), &mut *tx).await?
        {
            tx.rollback().await?;
            return Ok(AssignOutcome::BurstConflict { deer_id: other });
        }

        if !try_assign(
            request.detection_id,
            request.profile_id,
            request.burst_group_id,
            &mut *tx,
        )
        .await?
        {
            tx.rollback().await?;
            return Ok(AssignOutcome::AlreadyAssigned);
        }

        if let Some(group) = request.burst_group_id {
            Detection::stamp_burst_group(&request.member_ids, group, &mut *tx).await?;
        }

        let new_embedding = ema_update(&stored, &request.query, request.alpha);
        let new_alt = match (&locked.embedding_alt, &request.query_alt) {
            (Some(stored_alt), Some(q)) => {
                Some(Vector::from(ema_update(&stored_alt.to_vec(), q, request.alpha)))
            }
            (None, Some(q)) => Some(Vector::from(q.clone())),
            _ => None,
        };

        let profile = Deer::apply_sighting(
            request.profile_id,
            &Vector::from(new_embedding),
            new_alt.as_ref(),
            request.sex,
            request.seen_at,
            &mut *tx,
        )
        .await?;

        tx.commit().await?;
        Ok(AssignOutcome::Assigned(profile_record(profile)))
    }

    async fn create_profile(&self, request: CreateProfileRequest) -> Result<AssignOutcome> {
        let mut tx = self.pool.begin().await?;

        if let Some(other) = lock_members(&request.member_ids, None, &mut *tx).await? {
            tx.rollback().await?;
            return Ok(AssignOutcome::BurstConflict { deer_id: other });
        }

        let profile = Deer::insert(
            &NewDeer {
                sex: request.sex,
                embedding: Vector::from(request.embedding.clone()),
                embedding_alt: request.embedding_alt.clone().map(Vector::from),
                embedding_version: request.embedding_version.clone(),
                seen_at: request.seen_at,
            },
            &mut *tx,
        )
        .await?;

        if !try_assign(
            request.detection_id,
            profile.id,
            request.burst_group_id,
            &mut *tx,
        )
        .await?
        {
            tx.rollback().await?;
            return Ok(AssignOutcome::AlreadyAssigned);
        }

        if let Some(group) = request.burst_group_id {
            Detection::stamp_burst_group(&request.member_ids, group, &mut *tx).await?;
        }

        tx.commit().await?;
        Ok(AssignOutcome::Assigned(profile_record(profile)))
    }
}

/// WorkQueue adapter over the DB-backed dispatch queue.
pub struct PgQueue {
    queue: DispatchQueue,
}

impl PgQueue {
    pub fn new(pool: PgPool, max_retries: u32) -> Self {
        Self {
            queue: DispatchQueue::new(pool, max_retries),
        }
    }
}

fn to_item(reserved: Reserved) -> ReservedItem {
    ReservedItem {
        handle: reserved.handle,
        queue: reserved.queue,
        item_id: reserved.item_id,
        attempt: reserved.attempt,
    }
}

fn to_reserved(item: &ReservedItem) -> Reserved {
    Reserved {
        handle: item.handle,
        queue: item.queue.clone(),
        item_id: item.item_id,
        attempt: item.attempt,
    }
}

#[async_trait]
impl WorkQueue for PgQueue {
    async fn enqueue(&self, queue: &str, item_id: Uuid) -> Result<()> {
        self.queue.enqueue(queue, item_id).await
    }

    async fn reserve(&self, queue: &str, visibility: Duration) -> Result<Option<ReservedItem>> {
        Ok(self.queue.reserve(queue, visibility).await?.map(to_item))
    }

    async fn ack(&self, item: &ReservedItem) -> Result<()> {
        self.queue.ack(&to_reserved(item)).await
    }

    async fn nack(&self, item: &ReservedItem, quick: bool, error: Option<&str>) -> Result<()> {
        self.queue.nack(&to_reserved(item), quick, error).await
    }
}
