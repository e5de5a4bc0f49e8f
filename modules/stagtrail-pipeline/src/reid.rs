//! Re-ID handler: one `detection_id` from the `reid` queue.
//!
//! Order of battle: guards, burst reuse, embed, candidate search, threshold
//! decision, profile mutation. The profile-side mutation happens under a
//! row lock inside the store; on contention the candidate is re-scored and
//! the search repeated, bounded, so workers never coordinate directly.

use std::io::ErrorKind;

use tracing::{debug, info, warn};
use uuid::Uuid;

use inference_client::Embedder as _;
use stagtrail_common::{
    cosine_similarity, ensemble_score, l2_normalize, DeerClass, Sex, WorkError,
};

use crate::crop;
use crate::deps::{from_inference, transient, WorkerDeps};
use crate::traits::{
    AbsorbRequest, AssignOutcome, BurstMember, CreateProfileRequest, DetectionRecord,
    MetadataStore as _, ProfileMatch,
};

/// Shortlist size for the first-pass nearest-neighbour query.
const CANDIDATE_K: usize = 5;

/// Bounded re-runs of candidate search when the locked profile re-scores
/// below threshold or vanishes.
const RESCORE_ATTEMPTS: usize = 3;

pub async fn handle_detection(detection_id: Uuid, deps: &WorkerDeps) -> Result<(), WorkError> {
    let Some(detection) = deps.store.detection(detection_id).await.map_err(transient)? else {
        warn!(%detection_id, "reid item references unknown detection");
        return Ok(());
    };

    if detection.is_duplicate {
        debug!(%detection_id, "duplicate detection, skipping reid");
        return Ok(());
    }
    if detection.class == DeerClass::Other {
        debug!(%detection_id, "non-deer detection, skipping reid");
        return Ok(());
    }
    if detection.deer_id.is_some() {
        debug!(%detection_id, "detection already assigned");
        return Ok(());
    }

    let members = deps
        .store
        .burst_members(
            detection.location_id,
            detection.captured_at,
            deps.settings.burst_window,
        )
        .await
        .map_err(transient)?;
    let member_ids: Vec<Uuid> = members.iter().map(|m| m.detection_id).collect();
    let has_peers = members.iter().any(|m| m.detection_id != detection.id);

    // An already-identified burst member decides for the whole burst.
    if let Some(peer) = members
        .iter()
        .find(|m| m.detection_id != detection.id && m.deer_id.is_some())
    {
        let deer_id = peer.deer_id.expect("peer filtered on deer_id");
        return join_burst(deps, &detection, deer_id, &members, &member_ids).await;
    }

    let (query, query_alt) = embed_crop(deps, &detection).await?;

    let sex_filter = match detection.class.implied_sex() {
        Sex::Unknown => None,
        sex => Some(sex),
    };

    // Burst group only exists when the burst has more than one member.
    let burst_group_id = if has_peers {
        Some(
            members
                .iter()
                .find_map(|m| m.burst_group_id)
                .unwrap_or_else(Uuid::new_v4),
        )
    } else {
        None
    };

    for attempt in 0..RESCORE_ATTEMPTS {
        let candidates = deps
            .store
            .nearest_profiles(&query, sex_filter, CANDIDATE_K)
            .await
            .map_err(transient)?;

        let best = best_candidate(&candidates, query_alt.as_deref(), deps);

        let outcome = match best {
            Some((candidate, score)) if score >= deps.settings.reid_threshold => {
                debug!(
                    %detection_id,
                    profile = %candidate.profile.id,
                    score,
                    attempt,
                    "absorbing sighting into nearest profile"
                );
                deps.store
                    .absorb_sighting(AbsorbRequest {
                        profile_id: candidate.profile.id,
                        detection_id: detection.id,
                        query: query.clone(),
                        query_alt: query_alt.clone(),
                        sex: detection.class.implied_sex(),
                        seen_at: detection.captured_at,
                        burst_group_id,
                        member_ids: member_ids.clone(),
                        min_score: deps.settings.reid_threshold,
                        weights: deps.settings.ensemble_weights.clone(),
                        alpha: deps.settings.profile_ema_alpha,
                    })
                    .await
                    .map_err(transient)?
            }
            _ => deps
                .store
                .create_profile(CreateProfileRequest {
                    detection_id: detection.id,
                    sex: detection.class.implied_sex(),
                    embedding: query.clone(),
                    embedding_alt: query_alt.clone(),
                    embedding_version: deps.embedder.version().to_string(),
                    seen_at: detection.captured_at,
                    burst_group_id,
                    member_ids: member_ids.clone(),
                })
                .await
                .map_err(transient)?,
        };

        match outcome {
            AssignOutcome::Assigned(profile) => {
                if profile.sighting_count == 1 {
                    info!(%detection_id, profile = %profile.id, "new profile created");
                    deps.stats.bump(&deps.stats.profiles_created);
                } else {
                    info!(
                        %detection_id,
                        profile = %profile.id,
                        sightings = profile.sighting_count,
                        "sighting assigned"
                    );
                    deps.stats.bump(&deps.stats.sightings_assigned);
                }
                return Ok(());
            }
            AssignOutcome::AlreadyAssigned => {
                debug!(%detection_id, "detection assigned concurrently");
                return Ok(());
            }
            AssignOutcome::BurstConflict { deer_id } => {
                debug!(%detection_id, %deer_id, "burst resolved concurrently, joining");
                return join_burst(deps, &detection, deer_id, &members, &member_ids).await;
            }
            AssignOutcome::ScoreDrifted { rescored } => {
                debug!(%detection_id, rescored, attempt, "profile moved under lock, re-scoring");
                continue;
            }
            AssignOutcome::ProfileMissing => {
                debug!(%detection_id, attempt, "candidate profile vanished, re-searching");
                continue;
            }
        }
    }

    Err(WorkError::ProfileContention(format!(
        "re-score budget exhausted for detection {detection_id}"
    )))
}

/// Assign the detection to an already-identified burst profile and make the
/// burst share one group id.
async fn join_burst(
    deps: &WorkerDeps,
    detection: &DetectionRecord,
    deer_id: Uuid,
    members: &[BurstMember],
    member_ids: &[Uuid],
) -> Result<(), WorkError> {
    let fallback_group = members
        .iter()
        .find_map(|m| m.burst_group_id)
        .unwrap_or_else(Uuid::new_v4);

    match deps
        .store
        .reuse_burst_assignment(
            detection.id,
            deer_id,
            fallback_group,
            member_ids,
            detection.captured_at,
        )
        .await
        .map_err(transient)?
    {
        AssignOutcome::Assigned(profile) => {
            info!(
                detection_id = %detection.id,
                profile = %profile.id,
                "joined burst assignment"
            );
            deps.stats.bump(&deps.stats.burst_reuses);
            Ok(())
        }
        other => {
            debug!(detection_id = %detection.id, outcome = ?other, "burst join resolved without update");
            Ok(())
        }
    }
}

/// Crop the detection out of its image and run the extractor(s). Vectors
/// are normalised here regardless of what the engine returns.
async fn embed_crop(
    deps: &WorkerDeps,
    detection: &DetectionRecord,
) -> Result<(Vec<f32>, Option<Vec<f32>>), WorkError> {
    let bytes = match tokio::fs::read(&detection.image_path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(WorkError::CorruptInput(format!(
                "image file missing for detection {}",
                detection.id
            )));
        }
        Err(e) => return Err(WorkError::TransientIo(e.to_string())),
    };

    let img = crop::decode(&bytes).map_err(|e| WorkError::CorruptInput(e.to_string()))?;
    let crop_png =
        crop::crop_to_png(&img, detection.bbox).map_err(|e| WorkError::CorruptInput(e.to_string()))?;

    let query = l2_normalize(
        deps.embedder
            .embed(&crop_png)
            .await
            .map_err(from_inference)?,
    );

    let query_alt = match &deps.aux_embedder {
        Some(embedder) => Some(l2_normalize(
            embedder.embed(&crop_png).await.map_err(from_inference)?,
        )),
        None => None,
    };

    Ok((query, query_alt))
}

/// Score the shortlist; the primary similarity comes from the index, the
/// auxiliary similarities are computed here against the stored alt vectors.
fn best_candidate<'a>(
    candidates: &'a [ProfileMatch],
    query_alt: Option<&[f32]>,
    deps: &WorkerDeps,
) -> Option<(&'a ProfileMatch, f32)> {
    candidates
        .iter()
        .map(|candidate| {
            let aux_sims: Vec<f32> = match (query_alt, candidate.profile.embedding_alt.as_ref()) {
                (Some(q), Some(stored)) => vec![cosine_similarity(q, stored)],
                _ => Vec::new(),
            };
            let score = ensemble_score(
                candidate.primary_similarity,
                &aux_sims,
                &deps.settings.ensemble_weights,
            );
            (candidate, score)
        })
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
}
