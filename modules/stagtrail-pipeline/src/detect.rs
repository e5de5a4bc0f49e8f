//! Detection handler: one `image_id` from the `detect` queue, straight
//! line over claim, load, infer, filter, dedup, persist, hand off.
//!
//! Idempotency: the claim CAS refuses images already in a terminal state,
//! so a redelivery after a post-commit crash observes `completed` and acks.
//! The persist step is a single transaction, so partial writes are
//! impossible.

use std::io::ErrorKind;

use tracing::{debug, info, warn};
use uuid::Uuid;

use inference_client::Detector as _;
use stagtrail_common::{BBox, DeerClass, WorkError, REID_QUEUE};

use crate::crop;
use crate::dedup::{mark_duplicates, Candidate};
use crate::deps::{from_inference, transient, WorkerDeps};
use crate::traits::{ClaimOutcome, MetadataStore as _, NewDetectionRow, WorkQueue as _};

pub async fn handle_image(image_id: Uuid, deps: &WorkerDeps) -> Result<(), WorkError> {
    match deps.store.claim_image(image_id).await.map_err(transient)? {
        ClaimOutcome::Claimed => {}
        ClaimOutcome::AlreadyTerminal(status) => {
            debug!(%image_id, %status, "image already terminal, nothing to do");
            return Ok(());
        }
        ClaimOutcome::InFlight => {
            debug!(%image_id, "image owned by another worker");
            return Ok(());
        }
        ClaimOutcome::Missing => {
            warn!(%image_id, "detect item references unknown image");
            return Ok(());
        }
    }

    let image = match deps.store.image(image_id).await.map_err(transient)? {
        Some(image) => image,
        None => {
            warn!(%image_id, "image row vanished after claim");
            return Ok(());
        }
    };

    let bytes = match tokio::fs::read(&image.path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return fail_terminal(deps, image_id, "corrupt: image file missing").await;
        }
        Err(e) => return Err(WorkError::TransientIo(e.to_string())),
    };

    if let Err(e) = crop::decode(&bytes) {
        debug!(%image_id, error = %e, "image failed decode validation");
        return fail_terminal(deps, image_id, "corrupt: unreadable image").await;
    }

    let raw = deps.detector.detect(&bytes).await.map_err(from_inference)?;
    let total = raw.len();

    // Confidence cutoff keeps results at the threshold; class labels
    // outside the closed set mean model/pipeline version skew and park the
    // item for an operator rather than guessing.
    let mut candidates = Vec::new();
    for detection in raw {
        if detection.confidence < deps.settings.detector_confidence {
            continue;
        }
        let class: DeerClass = detection.label.parse().map_err(WorkError::Config)?;
        if class == DeerClass::Other && !deps.settings.record_non_deer {
            continue;
        }
        let [x, y, w, h] = detection.bbox;
        candidates.push(Candidate {
            bbox: BBox::new(x, y, w, h),
            confidence: detection.confidence,
            class,
        });
    }

    let marked = mark_duplicates(candidates, deps.settings.iou_dedup_threshold);
    let rows: Vec<NewDetectionRow> = marked
        .iter()
        .map(|(candidate, duplicate)| NewDetectionRow {
            bbox: candidate.bbox,
            confidence: candidate.confidence,
            class: candidate.class,
            is_duplicate: *duplicate,
        })
        .collect();

    let kept = rows.len();
    let ids = deps
        .store
        .complete_image(image_id, rows.clone())
        .await
        .map_err(transient)?;

    deps.stats.bump(&deps.stats.images_completed);
    deps.stats
        .bump_by(&deps.stats.detections_recorded, kept as u64);

    // Hand-off after the commit. A crash between commit and these enqueues
    // loses queue items, not data; the requeue script re-covers them.
    for (row, detection_id) in rows.iter().zip(ids.iter()) {
        if row.is_duplicate || !row.class.is_deer() {
            continue;
        }
        match deps.queue.enqueue(REID_QUEUE, *detection_id).await {
            Ok(()) => deps.stats.bump(&deps.stats.reid_enqueued),
            Err(e) => warn!(%detection_id, error = %e, "reid enqueue failed; requeue script will recover"),
        }
    }

    info!(
        %image_id,
        detector_results = total,
        recorded = kept,
        "image completed"
    );
    Ok(())
}

/// Terminal input failure: record it on the image, then surface the error
/// so the worker acks (no retry will change the outcome).
async fn fail_terminal(deps: &WorkerDeps, image_id: Uuid, message: &str) -> Result<(), WorkError> {
    deps.store
        .fail_image(image_id, message)
        .await
        .map_err(transient)?;
    deps.stats.bump(&deps.stats.images_failed);
    Err(WorkError::CorruptInput(message.to_string()))
}
