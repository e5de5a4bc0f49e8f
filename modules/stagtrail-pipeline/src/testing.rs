//! Test doubles for the pipeline trait seams.
//!
//! Four mocks matching the four boundaries:
//! - MemoryStore (MetadataStore) — stateful in-memory metadata DB with the
//!   same CAS / lock-equivalent semantics as the Postgres adapter
//! - MemoryQueue (WorkQueue) — FIFO with attempts and dead letters;
//!   retries are immediate (backoff is a Postgres concern)
//! - ScriptedDetector (Detector) — responses keyed by image bytes
//! - FixedEmbedder (Embedder) — constant or hash-deterministic vectors
//!
//! Plus fixtures for images on disk and a synchronous queue-drain driver.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use inference_client::{Detector, Embedder, InferenceError, RawDetection};
use stagtrail_common::{
    cosine_similarity, ema_update, ensemble_score, l2_normalize, BBox, DeerClass,
    PipelineSettings, ProcessingStatus, Sex, DETECT_QUEUE, REID_QUEUE,
};

use crate::deps::{RunStats, WorkerDeps};
use crate::traits::{
    AbsorbRequest, AssignOutcome, BurstMember, ClaimOutcome, CreateProfileRequest,
    DetectionRecord, ImageRecord, NewDetectionRow, ProfileMatch, ProfileRecord, ReservedItem,
};
use crate::worker::{self, QueueKind};

pub use crate::traits::{MetadataStore, WorkQueue};

/// Embedding dimension for test vectors.
pub const TEST_EMBEDDING_DIM: usize = 16;

// ---------------------------------------------------------------------------
// Vector helpers
// ---------------------------------------------------------------------------

/// Unit vector along the first axis.
pub fn axis_vec(dim: usize) -> Vec<f32> {
    let mut v = vec![0.0; dim];
    v[0] = 1.0;
    v
}

/// Unit vector whose cosine against `axis_vec(dim)` is exactly `target`.
pub fn unit_vec_with_cos(target: f32, dim: usize) -> Vec<f32> {
    let mut v = vec![0.0; dim];
    v[0] = target;
    v[1] = (1.0 - target * target).max(0.0).sqrt();
    v
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredImage {
    id: Uuid,
    location_id: Uuid,
    path: String,
    captured_at: DateTime<Utc>,
    status: ProcessingStatus,
    error_message: Option<String>,
}

#[derive(Debug, Clone)]
struct StoredProfile {
    id: Uuid,
    sex: Sex,
    embedding: Vec<f32>,
    embedding_alt: Option<Vec<f32>>,
    embedding_version: String,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    sighting_count: i32,
}

#[derive(Default)]
struct StoreInner {
    images: HashMap<Uuid, StoredImage>,
    detections: HashMap<Uuid, DetectionRecord>,
    insertion_order: Vec<Uuid>,
    profiles: HashMap<Uuid, StoredProfile>,
}

/// Stateful in-memory metadata store. The single mutex stands in for the
/// row locks: every mutating op is serialised exactly as the Postgres
/// transactions are.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // --- fixtures ---

    pub fn seed_image(&self, location_id: Uuid, path: &Path, captured_at: DateTime<Utc>) -> Uuid {
        let id = Uuid::new_v4();
        self.inner.lock().unwrap().images.insert(
            id,
            StoredImage {
                id,
                location_id,
                path: path.to_string_lossy().into_owned(),
                captured_at,
                status: ProcessingStatus::Pending,
                error_message: None,
            },
        );
        id
    }

    /// A completed image with one non-duplicate detection, for driving the
    /// Re-ID handler directly.
    pub fn seed_completed_detection(
        &self,
        location_id: Uuid,
        path: &Path,
        captured_at: DateTime<Utc>,
        bbox: BBox,
        class: DeerClass,
    ) -> Uuid {
        let image_id = Uuid::new_v4();
        let detection_id = Uuid::new_v4();
        let mut inner = self.inner.lock().unwrap();
        inner.images.insert(
            image_id,
            StoredImage {
                id: image_id,
                location_id,
                path: path.to_string_lossy().into_owned(),
                captured_at,
                status: ProcessingStatus::Completed,
                error_message: None,
            },
        );
        inner.detections.insert(
            detection_id,
            DetectionRecord {
                id: detection_id,
                image_id,
                location_id,
                captured_at,
                image_path: path.to_string_lossy().into_owned(),
                bbox,
                confidence: 0.9,
                class,
                deer_id: None,
                burst_group_id: None,
                is_duplicate: false,
            },
        );
        inner.insertion_order.push(detection_id);
        detection_id
    }

    pub fn seed_profile(&self, sex: Sex, embedding: Vec<f32>, seen_at: DateTime<Utc>) -> Uuid {
        self.seed_profile_with_alt(sex, embedding, None, seen_at)
    }

    pub fn seed_profile_with_alt(
        &self,
        sex: Sex,
        embedding: Vec<f32>,
        embedding_alt: Option<Vec<f32>>,
        seen_at: DateTime<Utc>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.inner.lock().unwrap().profiles.insert(
            id,
            StoredProfile {
                id,
                sex,
                embedding: l2_normalize(embedding),
                embedding_alt: embedding_alt.map(l2_normalize),
                embedding_version: "fixed-test".to_string(),
                first_seen: seen_at,
                last_seen: seen_at,
                sighting_count: 1,
            },
        );
        id
    }

    /// Move a profile's embedding out from under a scored candidate, to
    /// exercise the re-score-under-lock path.
    pub fn set_profile_embedding(&self, id: Uuid, embedding: Vec<f32>) {
        let mut inner = self.inner.lock().unwrap();
        let profile = inner.profiles.get_mut(&id).expect("profile exists");
        profile.embedding = l2_normalize(embedding);
    }

    // --- assertions ---

    pub fn image_status(&self, id: Uuid) -> Option<ProcessingStatus> {
        self.inner.lock().unwrap().images.get(&id).map(|i| i.status)
    }

    pub fn image_error(&self, id: Uuid) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .images
            .get(&id)
            .and_then(|i| i.error_message.clone())
    }

    pub fn detections_for_image(&self, image_id: Uuid) -> Vec<DetectionRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .insertion_order
            .iter()
            .filter_map(|id| inner.detections.get(id))
            .filter(|d| d.image_id == image_id)
            .cloned()
            .collect()
    }

    pub fn detection_record(&self, id: Uuid) -> Option<DetectionRecord> {
        self.inner.lock().unwrap().detections.get(&id).cloned()
    }

    pub fn all_detections(&self) -> Vec<DetectionRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .insertion_order
            .iter()
            .filter_map(|id| inner.detections.get(id))
            .cloned()
            .collect()
    }

    pub fn profile_record(&self, id: Uuid) -> Option<ProfileRecord> {
        self.inner.lock().unwrap().profiles.get(&id).map(to_profile)
    }

    pub fn profile_count(&self) -> usize {
        self.inner.lock().unwrap().profiles.len()
    }

    pub fn all_profiles(&self) -> Vec<ProfileRecord> {
        self.inner
            .lock()
            .unwrap()
            .profiles
            .values()
            .map(to_profile)
            .collect()
    }
}

fn to_profile(p: &StoredProfile) -> ProfileRecord {
    ProfileRecord {
        id: p.id,
        sex: p.sex,
        embedding: p.embedding.clone(),
        embedding_alt: p.embedding_alt.clone(),
        embedding_version: p.embedding_version.clone(),
        first_seen: p.first_seen,
        last_seen: p.last_seen,
        sighting_count: p.sighting_count,
    }
}

impl StoreInner {
    fn resolve_group(&self, member_ids: &[Uuid], fallback: Uuid) -> Uuid {
        member_ids
            .iter()
            .filter_map(|id| self.detections.get(id))
            .find_map(|d| d.burst_group_id)
            .unwrap_or(fallback)
    }

    fn member_conflict(&self, member_ids: &[Uuid], exclude: Option<Uuid>) -> Option<Uuid> {
        member_ids
            .iter()
            .filter_map(|id| self.detections.get(id))
            .filter_map(|d| d.deer_id)
            .find(|deer_id| Some(*deer_id) != exclude)
    }

    fn stamp(&mut self, member_ids: &[Uuid], group: Uuid) {
        for id in member_ids {
            if let Some(d) = self.detections.get_mut(id) {
                if d.burst_group_id.is_none() {
                    d.burst_group_id = Some(group);
                }
            }
        }
    }

    /// Conditional assignment mirroring the SQL `WHERE deer_id IS NULL`.
    fn try_assign(&mut self, detection_id: Uuid, deer_id: Uuid, group: Option<Uuid>) -> bool {
        match self.detections.get_mut(&detection_id) {
            Some(d)
                if d.deer_id.is_none() && !d.is_duplicate && d.class != DeerClass::Other =>
            {
                d.deer_id = Some(deer_id);
                if d.burst_group_id.is_none() {
                    d.burst_group_id = group;
                }
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn image(&self, id: Uuid) -> Result<Option<ImageRecord>> {
        Ok(self.inner.lock().unwrap().images.get(&id).map(|i| ImageRecord {
            id: i.id,
            location_id: i.location_id,
            path: i.path.clone(),
            captured_at: i.captured_at,
            status: i.status,
        }))
    }

    async fn claim_image(&self, id: Uuid) -> Result<ClaimOutcome> {
        let mut inner = self.inner.lock().unwrap();
        match inner.images.get_mut(&id) {
            None => Ok(ClaimOutcome::Missing),
            Some(image) => match image.status {
                ProcessingStatus::Pending => {
                    image.status = ProcessingStatus::Processing;
                    Ok(ClaimOutcome::Claimed)
                }
                ProcessingStatus::Processing => Ok(ClaimOutcome::InFlight),
                status => Ok(ClaimOutcome::AlreadyTerminal(status)),
            },
        }
    }

    async fn release_image(&self, id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.images.get_mut(&id) {
            Some(image) if image.status == ProcessingStatus::Processing => {
                image.status = ProcessingStatus::Pending;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_image(&self, image_id: Uuid, rows: Vec<NewDetectionRow>) -> Result<Vec<Uuid>> {
        let mut inner = self.inner.lock().unwrap();
        let (location_id, captured_at, path) = match inner.images.get(&image_id) {
            Some(image) if image.status == ProcessingStatus::Processing => {
                (image.location_id, image.captured_at, image.path.clone())
            }
            Some(image) => bail!("image {image_id} not in processing (is {})", image.status),
            None => bail!("image {image_id} not found"),
        };

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let id = Uuid::new_v4();
            inner.detections.insert(
                id,
                DetectionRecord {
                    id,
                    image_id,
                    location_id,
                    captured_at,
                    image_path: path.clone(),
                    bbox: row.bbox,
                    confidence: row.confidence,
                    class: row.class,
                    deer_id: None,
                    burst_group_id: None,
                    is_duplicate: row.is_duplicate,
                },
            );
            inner.insertion_order.push(id);
            ids.push(id);
        }

        inner.images.get_mut(&image_id).expect("checked above").status =
            ProcessingStatus::Completed;
        Ok(ids)
    }

    async fn fail_image(&self, image_id: Uuid, message: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(image) = inner.images.get_mut(&image_id) {
            if image.status == ProcessingStatus::Processing {
                image.status = ProcessingStatus::Failed;
                image.error_message = Some(message.to_string());
            }
        }
        Ok(())
    }

    async fn detection(&self, id: Uuid) -> Result<Option<DetectionRecord>> {
        Ok(self.inner.lock().unwrap().detections.get(&id).cloned())
    }

    async fn burst_members(
        &self,
        location_id: Uuid,
        at: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<BurstMember>> {
        let window = chrono::Duration::from_std(window).expect("window fits");
        let inner = self.inner.lock().unwrap();
        let mut members: Vec<(DateTime<Utc>, BurstMember)> = inner
            .insertion_order
            .iter()
            .filter_map(|id| inner.detections.get(id))
            .filter(|d| {
                d.location_id == location_id
                    && !d.is_duplicate
                    && d.class != DeerClass::Other
                    && d.captured_at >= at - window
                    && d.captured_at <= at + window
            })
            .map(|d| {
                (
                    d.captured_at,
                    BurstMember {
                        detection_id: d.id,
                        deer_id: d.deer_id,
                        burst_group_id: d.burst_group_id,
                    },
                )
            })
            .collect();
        members.sort_by_key(|(ts, _)| *ts);
        Ok(members.into_iter().map(|(_, m)| m).collect())
    }

    async fn reuse_burst_assignment(
        &self,
        detection_id: Uuid,
        deer_id: Uuid,
        fallback_group: Uuid,
        member_ids: &[Uuid],
        seen_at: DateTime<Utc>,
    ) -> Result<AssignOutcome> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.profiles.contains_key(&deer_id) {
            return Ok(AssignOutcome::ProfileMissing);
        }

        let group = inner.resolve_group(member_ids, fallback_group);
        if !inner.try_assign(detection_id, deer_id, Some(group)) {
            return Ok(AssignOutcome::AlreadyAssigned);
        }
        inner.stamp(member_ids, group);

        let profile = inner.profiles.get_mut(&deer_id).expect("checked above");
        profile.first_seen = profile.first_seen.min(seen_at);
        profile.last_seen = profile.last_seen.max(seen_at);
        profile.sighting_count += 1;
        Ok(AssignOutcome::Assigned(to_profile(profile)))
    }

    async fn nearest_profiles(
        &self,
        query: &[f32],
        sex: Option<Sex>,
        k: usize,
    ) -> Result<Vec<ProfileMatch>> {
        let inner = self.inner.lock().unwrap();
        let mut matches: Vec<ProfileMatch> = inner
            .profiles
            .values()
            .filter(|p| match sex {
                Some(sex) => p.sex == sex || p.sex == Sex::Unknown,
                None => true,
            })
            .map(|p| ProfileMatch {
                primary_similarity: cosine_similarity(query, &p.embedding),
                profile: to_profile(p),
            })
            .collect();
        matches.sort_by(|a, b| {
            b.primary_similarity
                .partial_cmp(&a.primary_similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(k);
        Ok(matches)
    }

    async fn absorb_sighting(&self, request: AbsorbRequest) -> Result<AssignOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let Some(profile) = inner.profiles.get(&request.profile_id) else {
            return Ok(AssignOutcome::ProfileMissing);
        };

        let primary = cosine_similarity(&request.query, &profile.embedding);
        let aux_sims: Vec<f32> = match (&request.query_alt, &profile.embedding_alt) {
            (Some(q), Some(stored)) => vec![cosine_similarity(q, stored)],
            _ => Vec::new(),
        };
        let rescored = ensemble_score(primary, &aux_sims, &request.weights);
        if rescored < request.min_score {
            return Ok(AssignOutcome::ScoreDrifted { rescored });
        }

        if let Some(other) = inner.member_conflict(&request.member_ids, Some(request.profile_id)) {
            return Ok(AssignOutcome::BurstConflict { deer_id: other });
        }

        if !inner.try_assign(request.detection_id, request.profile_id, request.burst_group_id) {
            return Ok(AssignOutcome::AlreadyAssigned);
        }
        if let Some(group) = request.burst_group_id {
            inner.stamp(&request.member_ids, group);
        }

        let profile = inner
            .profiles
            .get_mut(&request.profile_id)
            .expect("checked above");
        profile.embedding = ema_update(&profile.embedding, &request.query, request.alpha);
        profile.embedding_alt = match (&profile.embedding_alt, &request.query_alt) {
            (Some(stored), Some(q)) => Some(ema_update(stored, q, request.alpha)),
            (None, Some(q)) => Some(q.clone()),
            (existing, None) => existing.clone(),
        };
        if profile.sex == Sex::Unknown {
            profile.sex = request.sex;
        }
        profile.first_seen = profile.first_seen.min(request.seen_at);
        profile.last_seen = profile.last_seen.max(request.seen_at);
        profile.sighting_count += 1;
        Ok(AssignOutcome::Assigned(to_profile(profile)))
    }

    async fn create_profile(&self, request: CreateProfileRequest) -> Result<AssignOutcome> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(other) = inner.member_conflict(&request.member_ids, None) {
            return Ok(AssignOutcome::BurstConflict { deer_id: other });
        }

        let id = Uuid::new_v4();
        if !inner.try_assign(request.detection_id, id, request.burst_group_id) {
            return Ok(AssignOutcome::AlreadyAssigned);
        }
        if let Some(group) = request.burst_group_id {
            inner.stamp(&request.member_ids, group);
        }

        let profile = StoredProfile {
            id,
            sex: request.sex,
            embedding: request.embedding,
            embedding_alt: request.embedding_alt,
            embedding_version: request.embedding_version,
            first_seen: request.seen_at,
            last_seen: request.seen_at,
            sighting_count: 1,
        };
        let record = to_profile(&profile);
        inner.profiles.insert(id, profile);
        Ok(AssignOutcome::Assigned(record))
    }
}

// ---------------------------------------------------------------------------
// MemoryQueue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct QueueEntry {
    handle: i64,
    queue: String,
    item_id: Uuid,
    attempts: i32,
    reserved_until: Option<Instant>,
}

#[derive(Default)]
struct QueueInner {
    next_handle: i64,
    entries: Vec<QueueEntry>,
    dead: Vec<(String, Uuid, i32)>,
}

/// FIFO queue with reservation attempts and dead letters. Nacked items are
/// immediately visible; backoff timing is exercised against Postgres, not
/// here.
pub struct MemoryQueue {
    inner: Mutex<QueueInner>,
    max_retries: i32,
}

impl MemoryQueue {
    pub fn new(max_retries: u32) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            max_retries: max_retries as i32,
        }
    }

    pub fn depth(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .filter(|e| e.queue == queue)
            .count()
    }

    pub fn dead_letters(&self) -> Vec<(String, Uuid, i32)> {
        self.inner.lock().unwrap().dead.clone()
    }

    /// Simulate visibility-timeout expiry for every in-flight item.
    pub fn expire_reservations(&self) {
        let mut inner = self.inner.lock().unwrap();
        for entry in inner.entries.iter_mut() {
            entry.reserved_until = None;
        }
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, queue: &str, item_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_handle += 1;
        let handle = inner.next_handle;
        inner.entries.push(QueueEntry {
            handle,
            queue: queue.to_string(),
            item_id,
            attempts: 0,
            reserved_until: None,
        });
        Ok(())
    }

    async fn reserve(&self, queue: &str, visibility: Duration) -> Result<Option<ReservedItem>> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        // Sweep exhausted items to the dead letters first.
        let max = self.max_retries;
        let mut kept = Vec::with_capacity(inner.entries.len());
        let mut dead = Vec::new();
        for entry in inner.entries.drain(..) {
            let visible = entry.reserved_until.map(|t| t <= now).unwrap_or(true);
            if entry.queue == queue && visible && entry.attempts >= max {
                dead.push((entry.queue, entry.item_id, entry.attempts));
            } else {
                kept.push(entry);
            }
        }
        inner.entries = kept;
        inner.dead.extend(dead);

        for entry in inner.entries.iter_mut() {
            let visible = entry.reserved_until.map(|t| t <= now).unwrap_or(true);
            if entry.queue == queue && visible {
                entry.attempts += 1;
                entry.reserved_until = Some(now + visibility);
                return Ok(Some(ReservedItem {
                    handle: entry.handle,
                    queue: entry.queue.clone(),
                    item_id: entry.item_id,
                    attempt: entry.attempts,
                }));
            }
        }
        Ok(None)
    }

    async fn ack(&self, item: &ReservedItem) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.retain(|e| e.handle != item.handle);
        Ok(())
    }

    async fn nack(&self, item: &ReservedItem, _quick: bool, _error: Option<&str>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.handle == item.handle) {
            entry.reserved_until = None;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ScriptedDetector
// ---------------------------------------------------------------------------

enum DetectScript {
    Results(Vec<RawDetection>),
    OutOfMemory,
}

/// Detector keyed by exact image bytes. Unregistered images detect nothing.
pub struct ScriptedDetector {
    scripts: Mutex<HashMap<Vec<u8>, DetectScript>>,
}

impl ScriptedDetector {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
        }
    }

    pub fn on(&self, image_bytes: &[u8], results: Vec<RawDetection>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(image_bytes.to_vec(), DetectScript::Results(results));
    }

    pub fn oom_on(&self, image_bytes: &[u8]) {
        self.scripts
            .lock()
            .unwrap()
            .insert(image_bytes.to_vec(), DetectScript::OutOfMemory);
    }
}

impl Default for ScriptedDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Detector for ScriptedDetector {
    async fn detect(&self, image: &[u8]) -> Result<Vec<RawDetection>, InferenceError> {
        match self.scripts.lock().unwrap().get(image) {
            Some(DetectScript::Results(results)) => Ok(results.clone()),
            Some(DetectScript::OutOfMemory) => Err(InferenceError::OutOfMemory),
            None => Ok(Vec::new()),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Convenience constructor for detector output.
pub fn raw_detection(bbox: BBox, confidence: f32, label: &str) -> RawDetection {
    RawDetection {
        bbox: [bbox.x, bbox.y, bbox.width, bbox.height],
        confidence,
        label: label.to_string(),
    }
}

// ---------------------------------------------------------------------------
// FixedEmbedder
// ---------------------------------------------------------------------------

enum EmbedMode {
    Constant(Vec<f32>),
    HashBased(usize),
}

/// Deterministic embedder: either one constant vector, or a vector derived
/// from a hash of the crop bytes (identical crops embed identically).
pub struct FixedEmbedder {
    mode: EmbedMode,
}

impl FixedEmbedder {
    pub fn constant(vector: Vec<f32>) -> Self {
        Self {
            mode: EmbedMode::Constant(vector),
        }
    }

    pub fn hash_based(dim: usize) -> Self {
        Self {
            mode: EmbedMode::HashBased(dim),
        }
    }
}

#[async_trait]
impl Embedder for FixedEmbedder {
    async fn embed(&self, crop: &[u8]) -> Result<Vec<f32>, InferenceError> {
        match &self.mode {
            EmbedMode::Constant(v) => Ok(v.clone()),
            EmbedMode::HashBased(dim) => {
                use std::collections::hash_map::DefaultHasher;
                use std::hash::{Hash, Hasher};
                let mut v = Vec::with_capacity(*dim);
                for i in 0..*dim {
                    let mut hasher = DefaultHasher::new();
                    crop.hash(&mut hasher);
                    i.hash(&mut hasher);
                    let unit = (hasher.finish() % 2000) as f32 / 1000.0 - 1.0;
                    v.push(unit);
                }
                Ok(l2_normalize(v))
            }
        }
    }

    fn version(&self) -> &str {
        "fixed-test"
    }
}

// ---------------------------------------------------------------------------
// Fixtures and drivers
// ---------------------------------------------------------------------------

/// Write a small solid-colour PNG into `dir`; returns its path and bytes.
/// Distinct colours give distinct bytes, which keys the scripted detector.
pub fn write_test_image(dir: &Path, name: &str, rgb: [u8; 3]) -> (PathBuf, Vec<u8>) {
    let img = image::RgbImage::from_pixel(96, 96, image::Rgb(rgb));
    let path = dir.join(name);
    img.save(&path).expect("write test image");
    let bytes = std::fs::read(&path).expect("read test image back");
    (path, bytes)
}

/// Deps over the in-memory doubles with default settings.
pub fn test_deps(
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
    detector: Arc<ScriptedDetector>,
    embedder: Arc<FixedEmbedder>,
) -> WorkerDeps {
    WorkerDeps {
        store,
        queue,
        detector,
        embedder,
        aux_embedder: None,
        settings: PipelineSettings::default(),
        stats: Arc::new(RunStats::default()),
    }
}

/// Drive both queues synchronously until they are empty, with the same
/// ack/nack discipline as the worker loops. Deterministic: one item at a
/// time, detect before reid.
pub async fn run_until_idle(deps: &WorkerDeps, queue: &MemoryQueue) {
    let visibility = Duration::from_secs(60);
    for _ in 0..10_000 {
        let (kind, item) = if let Some(item) = queue
            .reserve(DETECT_QUEUE, visibility)
            .await
            .expect("reserve detect")
        {
            (QueueKind::Detect, item)
        } else if let Some(item) = queue
            .reserve(REID_QUEUE, visibility)
            .await
            .expect("reserve reid")
        {
            (QueueKind::Reid, item)
        } else {
            return;
        };

        let result = match kind {
            QueueKind::Detect => crate::detect::handle_image(item.item_id, deps).await,
            QueueKind::Reid => crate::reid::handle_detection(item.item_id, deps).await,
        };
        worker::finish_item(kind, &item, result.err(), deps).await;
    }
    panic!("queues did not drain");
}
