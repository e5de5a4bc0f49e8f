//! Detection-worker scenarios: claim discipline, filtering, in-image
//! dedup, terminal failures, idempotent redelivery.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use uuid::Uuid;

use stagtrail_common::{BBox, DeerClass, ProcessingStatus, Sex, DETECT_QUEUE};
use stagtrail_pipeline::testing::*;
use stagtrail_pipeline::WorkerDeps;

fn doe_box() -> BBox {
    BBox::new(10, 10, 40, 40)
}

fn fresh_harness() -> (Arc<MemoryStore>, Arc<MemoryQueue>, Arc<ScriptedDetector>, WorkerDeps) {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new(5));
    let detector = Arc::new(ScriptedDetector::new());
    let embedder = Arc::new(FixedEmbedder::constant(axis_vec(TEST_EMBEDDING_DIM)));
    let deps = test_deps(store.clone(), queue.clone(), detector.clone(), embedder);
    (store, queue, detector, deps)
}

#[tokio::test]
async fn single_detection_creates_profile_end_to_end() {
    let (store, queue, detector, deps) = fresh_harness();
    let dir = tempfile::tempdir().unwrap();
    let location = Uuid::new_v4();
    let captured = Utc.with_ymd_and_hms(2024, 10, 12, 6, 30, 0).unwrap();

    let (path, bytes) = write_test_image(dir.path(), "cam-a-001.png", [120, 90, 60]);
    detector.on(&bytes, vec![raw_detection(doe_box(), 0.87, "doe")]);
    let image_id = store.seed_image(location, &path, captured);
    queue.enqueue(DETECT_QUEUE, image_id).await.unwrap();

    run_until_idle(&deps, &queue).await;

    assert_eq!(store.image_status(image_id), Some(ProcessingStatus::Completed));

    let detections = store.detections_for_image(image_id);
    assert_eq!(detections.len(), 1);
    let detection = &detections[0];
    assert!(!detection.is_duplicate);
    assert_eq!(detection.class, DeerClass::Doe);
    // Lone detection: no burst, no group.
    assert_eq!(detection.burst_group_id, None);

    assert_eq!(store.profile_count(), 1);
    let profile = store.profile_record(detection.deer_id.unwrap()).unwrap();
    assert_eq!(profile.sex, Sex::Doe);
    assert_eq!(profile.sighting_count, 1);
    assert_eq!(profile.first_seen, captured);
    assert_eq!(profile.last_seen, captured);
    // The persisted tag comes from the engine handle that made the vector.
    assert_eq!(profile.embedding_version, "fixed-test");
}

#[tokio::test]
async fn overlapping_boxes_mark_lower_confidence_duplicate() {
    let (store, queue, detector, deps) = fresh_harness();
    let dir = tempfile::tempdir().unwrap();
    let location = Uuid::new_v4();
    let captured = Utc.with_ymd_and_hms(2024, 10, 12, 6, 30, 0).unwrap();

    let (path, bytes) = write_test_image(dir.path(), "cam-a-002.png", [10, 200, 30]);
    // Same box shifted slightly: IoU well above the 0.5 default.
    detector.on(
        &bytes,
        vec![
            raw_detection(BBox::new(10, 10, 50, 50), 0.7, "doe"),
            raw_detection(BBox::new(10, 14, 50, 50), 0.9, "doe"),
        ],
    );
    let image_id = store.seed_image(location, &path, captured);
    queue.enqueue(DETECT_QUEUE, image_id).await.unwrap();

    run_until_idle(&deps, &queue).await;

    let detections = store.detections_for_image(image_id);
    assert_eq!(detections.len(), 2);

    let winner = detections.iter().find(|d| d.confidence > 0.8).unwrap();
    let loser = detections.iter().find(|d| d.confidence < 0.8).unwrap();
    assert!(!winner.is_duplicate);
    assert!(loser.is_duplicate);
    // The duplicate never entered Re-ID.
    assert_eq!(loser.deer_id, None);
    assert!(winner.deer_id.is_some());
    assert_eq!(store.profile_count(), 1);
}

#[tokio::test]
async fn confidence_exactly_at_cutoff_is_kept() {
    let (store, queue, detector, deps) = fresh_harness();
    let dir = tempfile::tempdir().unwrap();
    let captured = Utc.with_ymd_and_hms(2024, 10, 12, 7, 0, 0).unwrap();

    let (path, bytes) = write_test_image(dir.path(), "cam-a-003.png", [5, 5, 250]);
    detector.on(
        &bytes,
        vec![
            raw_detection(BBox::new(5, 5, 30, 30), 0.5, "doe"),
            raw_detection(BBox::new(50, 50, 30, 30), 0.49, "doe"),
        ],
    );
    let image_id = store.seed_image(Uuid::new_v4(), &path, captured);
    queue.enqueue(DETECT_QUEUE, image_id).await.unwrap();

    run_until_idle(&deps, &queue).await;

    // At the cutoff survives, strictly below is discarded entirely.
    let detections = store.detections_for_image(image_id);
    assert_eq!(detections.len(), 1);
    assert!((detections[0].confidence - 0.5).abs() < 1e-6);
}

#[tokio::test]
async fn non_deer_detection_is_recorded_but_never_identified() {
    let (store, queue, detector, deps) = fresh_harness();
    let dir = tempfile::tempdir().unwrap();
    let captured = Utc.with_ymd_and_hms(2024, 10, 12, 7, 0, 0).unwrap();

    let (path, bytes) = write_test_image(dir.path(), "cam-a-004.png", [80, 80, 80]);
    detector.on(&bytes, vec![raw_detection(doe_box(), 0.95, "other")]);
    let image_id = store.seed_image(Uuid::new_v4(), &path, captured);
    queue.enqueue(DETECT_QUEUE, image_id).await.unwrap();

    run_until_idle(&deps, &queue).await;

    let detections = store.detections_for_image(image_id);
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].class, DeerClass::Other);
    assert_eq!(detections[0].deer_id, None);
    assert_eq!(store.profile_count(), 0);
}

#[tokio::test]
async fn non_deer_detection_dropped_when_not_recording_inventory() {
    let (store, queue, detector, mut deps) = fresh_harness();
    deps.settings.record_non_deer = false;
    let dir = tempfile::tempdir().unwrap();
    let captured = Utc.with_ymd_and_hms(2024, 10, 12, 7, 0, 0).unwrap();

    let (path, bytes) = write_test_image(dir.path(), "cam-a-005.png", [81, 81, 81]);
    detector.on(&bytes, vec![raw_detection(doe_box(), 0.95, "other")]);
    let image_id = store.seed_image(Uuid::new_v4(), &path, captured);
    queue.enqueue(DETECT_QUEUE, image_id).await.unwrap();

    run_until_idle(&deps, &queue).await;

    assert_eq!(store.image_status(image_id), Some(ProcessingStatus::Completed));
    assert!(store.detections_for_image(image_id).is_empty());
}

#[tokio::test]
async fn corrupt_image_fails_terminally_without_retry() {
    let (store, queue, _detector, deps) = fresh_harness();
    let dir = tempfile::tempdir().unwrap();
    let captured = Utc.with_ymd_and_hms(2024, 10, 12, 7, 30, 0).unwrap();

    let path = dir.path().join("cam-a-006.png");
    std::fs::write(&path, b"definitely not a png").unwrap();
    let image_id = store.seed_image(Uuid::new_v4(), &path, captured);
    queue.enqueue(DETECT_QUEUE, image_id).await.unwrap();

    run_until_idle(&deps, &queue).await;

    assert_eq!(store.image_status(image_id), Some(ProcessingStatus::Failed));
    assert_eq!(
        store.image_error(image_id).as_deref(),
        Some("corrupt: unreadable image")
    );
    assert!(store.detections_for_image(image_id).is_empty());
    // Terminal: acked, not dead-lettered.
    assert!(queue.dead_letters().is_empty());
}

#[tokio::test]
async fn missing_image_file_fails_terminally() {
    let (store, queue, _detector, deps) = fresh_harness();
    let captured = Utc.with_ymd_and_hms(2024, 10, 12, 7, 30, 0).unwrap();

    let image_id = store.seed_image(
        Uuid::new_v4(),
        std::path::Path::new("/nonexistent/cam-a-007.png"),
        captured,
    );
    queue.enqueue(DETECT_QUEUE, image_id).await.unwrap();

    run_until_idle(&deps, &queue).await;

    assert_eq!(store.image_status(image_id), Some(ProcessingStatus::Failed));
    assert_eq!(
        store.image_error(image_id).as_deref(),
        Some("corrupt: image file missing")
    );
}

#[tokio::test]
async fn resubmitting_completed_image_changes_nothing() {
    let (store, queue, detector, deps) = fresh_harness();
    let dir = tempfile::tempdir().unwrap();
    let captured = Utc.with_ymd_and_hms(2024, 10, 12, 8, 0, 0).unwrap();

    let (path, bytes) = write_test_image(dir.path(), "cam-a-008.png", [1, 2, 3]);
    detector.on(&bytes, vec![raw_detection(doe_box(), 0.9, "doe")]);
    let image_id = store.seed_image(Uuid::new_v4(), &path, captured);
    queue.enqueue(DETECT_QUEUE, image_id).await.unwrap();
    run_until_idle(&deps, &queue).await;

    let before: Vec<Uuid> = store
        .detections_for_image(image_id)
        .iter()
        .map(|d| d.id)
        .collect();
    let profiles_before = store.profile_count();

    queue.enqueue(DETECT_QUEUE, image_id).await.unwrap();
    run_until_idle(&deps, &queue).await;

    let after: Vec<Uuid> = store
        .detections_for_image(image_id)
        .iter()
        .map(|d| d.id)
        .collect();
    assert_eq!(before, after);
    assert_eq!(store.profile_count(), profiles_before);
    assert_eq!(store.image_status(image_id), Some(ProcessingStatus::Completed));
}

#[tokio::test]
async fn crash_between_commit_and_ack_is_idempotent() {
    let (store, queue, detector, deps) = fresh_harness();
    let dir = tempfile::tempdir().unwrap();
    let captured = Utc.with_ymd_and_hms(2024, 10, 12, 8, 30, 0).unwrap();

    let (path, bytes) = write_test_image(dir.path(), "cam-a-009.png", [9, 9, 9]);
    detector.on(&bytes, vec![raw_detection(doe_box(), 0.9, "doe")]);
    let image_id = store.seed_image(Uuid::new_v4(), &path, captured);
    queue.enqueue(DETECT_QUEUE, image_id).await.unwrap();

    // First delivery: the handler commits, then the worker dies before ack.
    let item = queue
        .reserve(DETECT_QUEUE, Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    stagtrail_pipeline::detect::handle_image(item.item_id, &deps)
        .await
        .unwrap();
    assert_eq!(store.image_status(image_id), Some(ProcessingStatus::Completed));

    // Visibility timeout expires; the item is redelivered and the burst of
    // queued reid work drains normally.
    queue.expire_reservations();
    run_until_idle(&deps, &queue).await;

    let detections = store.detections_for_image(image_id);
    assert_eq!(detections.len(), 1);
    assert_eq!(store.profile_count(), 1);
    assert!(queue.dead_letters().is_empty());
}

#[tokio::test]
async fn device_oom_retries_then_dead_letters_without_status_change() {
    let (store, queue, detector, deps) = fresh_harness();
    let dir = tempfile::tempdir().unwrap();
    let captured = Utc.with_ymd_and_hms(2024, 10, 12, 9, 0, 0).unwrap();

    let (path, bytes) = write_test_image(dir.path(), "cam-a-010.png", [200, 0, 0]);
    detector.oom_on(&bytes);
    let image_id = store.seed_image(Uuid::new_v4(), &path, captured);
    queue.enqueue(DETECT_QUEUE, image_id).await.unwrap();

    run_until_idle(&deps, &queue).await;

    // The claim was rolled back on every attempt, so the image is still
    // eligible once an operator lowers concurrency and requeues.
    assert_eq!(store.image_status(image_id), Some(ProcessingStatus::Pending));
    let dead = queue.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].1, image_id);
}

#[tokio::test]
async fn unknown_class_label_parks_item_for_operator() {
    let (store, queue, detector, deps) = fresh_harness();
    let dir = tempfile::tempdir().unwrap();
    let captured = Utc.with_ymd_and_hms(2024, 10, 12, 9, 30, 0).unwrap();

    let (path, bytes) = write_test_image(dir.path(), "cam-a-011.png", [0, 0, 200]);
    detector.on(&bytes, vec![raw_detection(doe_box(), 0.9, "elk")]);
    let image_id = store.seed_image(Uuid::new_v4(), &path, captured);
    queue.enqueue(DETECT_QUEUE, image_id).await.unwrap();

    run_until_idle(&deps, &queue).await;

    assert_eq!(store.image_status(image_id), Some(ProcessingStatus::Pending));
    assert_eq!(queue.dead_letters().len(), 1);
    assert!(store.detections_for_image(image_id).is_empty());
}

#[tokio::test]
async fn two_animals_in_frame_share_the_burst_profile() {
    let (store, queue, detector, deps) = fresh_harness();
    let dir = tempfile::tempdir().unwrap();
    let captured = Utc.with_ymd_and_hms(2024, 10, 12, 10, 0, 0).unwrap();

    let (path, bytes) = write_test_image(dir.path(), "cam-a-012.png", [30, 60, 90]);
    detector.on(
        &bytes,
        vec![
            raw_detection(BBox::new(5, 5, 25, 25), 0.9, "doe"),
            raw_detection(BBox::new(60, 60, 25, 25), 0.8, "doe"),
        ],
    );
    let image_id = store.seed_image(Uuid::new_v4(), &path, captured);
    queue.enqueue(DETECT_QUEUE, image_id).await.unwrap();

    run_until_idle(&deps, &queue).await;

    // Same location, same second: one burst, so the second detection reuses
    // the first assignment rather than re-identifying.
    let detections = store.detections_for_image(image_id);
    assert_eq!(detections.len(), 2);
    let deer_ids: Vec<_> = detections.iter().filter_map(|d| d.deer_id).collect();
    assert_eq!(deer_ids.len(), 2);
    assert_eq!(deer_ids[0], deer_ids[1]);
    let groups: Vec<_> = detections.iter().filter_map(|d| d.burst_group_id).collect();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0], groups[1]);
    assert_eq!(store.profile_count(), 1);

    let profile = store.profile_record(deer_ids[0]).unwrap();
    assert_eq!(profile.sighting_count, 2);
}
