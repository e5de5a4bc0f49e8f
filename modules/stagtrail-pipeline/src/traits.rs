//! Trait abstractions for worker dependencies.
//!
//! MetadataStore covers every metadata-DB operation the workers touch, at
//! transaction granularity: an op that must be atomic is one method.
//! WorkQueue is the dispatch queue contract (at-least-once, visibility
//! timeouts, dead letters).
//!
//! These enable deterministic testing with MemoryStore and MemoryQueue:
//! no network, no database, no Docker. `cargo test` in seconds.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use stagtrail_common::{BBox, DeerClass, EnsembleWeights, ProcessingStatus, Sex};

// ---------------------------------------------------------------------------
// Records exchanged with the store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub id: Uuid,
    pub location_id: Uuid,
    pub path: String,
    pub captured_at: DateTime<Utc>,
    pub status: ProcessingStatus,
}

/// A detection joined with the capture context Re-ID needs.
#[derive(Debug, Clone)]
pub struct DetectionRecord {
    pub id: Uuid,
    pub image_id: Uuid,
    pub location_id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub image_path: String,
    pub bbox: BBox,
    pub confidence: f32,
    pub class: DeerClass,
    pub deer_id: Option<Uuid>,
    pub burst_group_id: Option<Uuid>,
    pub is_duplicate: bool,
}

/// Insert payload for one detector result on one image.
#[derive(Debug, Clone)]
pub struct NewDetectionRow {
    pub bbox: BBox,
    pub confidence: f32,
    pub class: DeerClass,
    pub is_duplicate: bool,
}

#[derive(Debug, Clone)]
pub struct ProfileRecord {
    pub id: Uuid,
    pub sex: Sex,
    pub embedding: Vec<f32>,
    pub embedding_alt: Option<Vec<f32>>,
    pub embedding_version: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub sighting_count: i32,
}

/// Candidate from the vector index with its primary cosine similarity.
#[derive(Debug, Clone)]
pub struct ProfileMatch {
    pub profile: ProfileRecord,
    pub primary_similarity: f32,
}

/// Another detection in the same burst window.
#[derive(Debug, Clone)]
pub struct BurstMember {
    pub detection_id: Uuid,
    pub deer_id: Option<Uuid>,
    pub burst_group_id: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// Operation outcomes
// ---------------------------------------------------------------------------

/// Result of the pending→processing CAS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This worker owns the image now.
    Claimed,
    /// Terminal state reached earlier; a retry observes it and acks.
    AlreadyTerminal(ProcessingStatus),
    /// Another consumer holds the image.
    InFlight,
    /// No such image.
    Missing,
}

/// Result of a profile-assignment operation. Every variant is an outcome,
/// not an error: the store reports what it found once it held the locks.
#[derive(Debug, Clone)]
pub enum AssignOutcome {
    /// Detection now points at the profile; counters and stamps applied.
    Assigned(ProfileRecord),
    /// The detection acquired a `deer_id` since the caller read it.
    AlreadyAssigned,
    /// A burst member is pinned to another profile; the caller should
    /// join that one instead of splitting the burst.
    BurstConflict { deer_id: Uuid },
    /// Absorb only: under the row lock the candidate re-scored below the
    /// threshold. The caller re-runs candidate search.
    ScoreDrifted { rescored: f32 },
    /// Absorb only: the candidate profile no longer exists.
    ProfileMissing,
}

/// Everything `absorb_sighting` needs to re-score and update under the
/// profile row lock.
#[derive(Debug, Clone)]
pub struct AbsorbRequest {
    pub profile_id: Uuid,
    pub detection_id: Uuid,
    pub query: Vec<f32>,
    pub query_alt: Option<Vec<f32>>,
    pub sex: Sex,
    pub seen_at: DateTime<Utc>,
    /// Group to stamp when the burst has other members; `None` for a lone
    /// detection.
    pub burst_group_id: Option<Uuid>,
    pub member_ids: Vec<Uuid>,
    pub min_score: f32,
    pub weights: EnsembleWeights,
    pub alpha: f32,
}

#[derive(Debug, Clone)]
pub struct CreateProfileRequest {
    pub detection_id: Uuid,
    pub sex: Sex,
    pub embedding: Vec<f32>,
    pub embedding_alt: Option<Vec<f32>>,
    /// Extraction-scheme tag from the engine handle that produced the
    /// vectors (`Embedder::version()`).
    pub embedding_version: String,
    pub seen_at: DateTime<Utc>,
    pub burst_group_id: Option<Uuid>,
    pub member_ids: Vec<Uuid>,
}

// ---------------------------------------------------------------------------
// MetadataStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn image(&self, id: Uuid) -> Result<Option<ImageRecord>>;

    /// CAS `pending → processing`.
    async fn claim_image(&self, id: Uuid) -> Result<ClaimOutcome>;

    /// Best-effort CAS `processing → pending` so a transient failure after
    /// a claim does not strand the image. Returns false when the image is
    /// no longer `processing`.
    async fn release_image(&self, id: Uuid) -> Result<bool>;

    /// One transaction: insert all rows (duplicates included, for audit)
    /// and move the image to `completed`. Returns detection ids in input
    /// order.
    async fn complete_image(&self, image_id: Uuid, rows: Vec<NewDetectionRow>) -> Result<Vec<Uuid>>;

    /// Terminal failure with a short operator-facing message.
    async fn fail_image(&self, image_id: Uuid, message: &str) -> Result<()>;

    async fn detection(&self, id: Uuid) -> Result<Option<DetectionRecord>>;

    /// Non-duplicate deer-class detections at the location within
    /// ±`window` (inclusive) of `at`. Includes the caller's own detection.
    async fn burst_members(
        &self,
        location_id: Uuid,
        at: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<BurstMember>>;

    /// Join an already-identified burst: assign the detection to the
    /// profile, make the whole burst share a group id, bump the profile's
    /// counters. One transaction.
    async fn reuse_burst_assignment(
        &self,
        detection_id: Uuid,
        deer_id: Uuid,
        fallback_group: Uuid,
        member_ids: &[Uuid],
        seen_at: DateTime<Utc>,
    ) -> Result<AssignOutcome>;

    /// Approximate top-k by cosine on the primary embedding, restricted by
    /// sex when given (profiles of unknown sex always pass).
    async fn nearest_profiles(
        &self,
        query: &[f32],
        sex: Option<Sex>,
        k: usize,
    ) -> Result<Vec<ProfileMatch>>;

    /// Take the profile row lock, re-score, and either fold the sighting
    /// into the profile (EMA) or report why not. One transaction.
    async fn absorb_sighting(&self, request: AbsorbRequest) -> Result<AssignOutcome>;

    /// Insert a new profile and assign the detection to it. One
    /// transaction; refuses (BurstConflict) when a burst member got
    /// assigned elsewhere in the meantime.
    async fn create_profile(&self, request: CreateProfileRequest) -> Result<AssignOutcome>;
}

// ---------------------------------------------------------------------------
// WorkQueue
// ---------------------------------------------------------------------------

/// A leased work item. Neither acked nor nacked within the visibility
/// timeout, it becomes visible to other consumers again.
#[derive(Debug, Clone)]
pub struct ReservedItem {
    pub handle: i64,
    pub queue: String,
    pub item_id: Uuid,
    /// 1-based reservation attempt.
    pub attempt: i32,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Append to the named FIFO. Duplicate ids are permitted; handlers are
    /// idempotent.
    async fn enqueue(&self, queue: &str, item_id: Uuid) -> Result<()>;

    async fn reserve(&self, queue: &str, visibility: Duration) -> Result<Option<ReservedItem>>;

    async fn ack(&self, item: &ReservedItem) -> Result<()>;

    /// Release for retry. `quick` skips backoff.
    async fn nack(&self, item: &ReservedItem, quick: bool, error: Option<&str>) -> Result<()>;
}
