//! Re-ID scenarios: burst grouping, threshold decisions, sex restriction,
//! EMA profile maintenance, idempotent redelivery, and the herd-level
//! properties.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use stagtrail_common::{cosine_similarity, norm, BBox, DeerClass, Sex, REID_QUEUE};
use stagtrail_pipeline::testing::*;
use stagtrail_pipeline::WorkerDeps;

fn deer_box() -> BBox {
    BBox::new(12, 12, 40, 40)
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 11, 2, 5, 45, 0).unwrap()
}

fn harness_with_embedder(
    embedder: FixedEmbedder,
) -> (Arc<MemoryStore>, Arc<MemoryQueue>, WorkerDeps) {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new(5));
    let detector = Arc::new(ScriptedDetector::new());
    let deps = test_deps(store.clone(), queue.clone(), detector, Arc::new(embedder));
    (store, queue, deps)
}

fn axis_harness() -> (Arc<MemoryStore>, Arc<MemoryQueue>, WorkerDeps) {
    harness_with_embedder(FixedEmbedder::constant(axis_vec(TEST_EMBEDDING_DIM)))
}

#[tokio::test]
async fn burst_of_three_resolves_to_one_profile_out_of_order() {
    let (store, queue, deps) = axis_harness();
    let dir = tempfile::tempdir().unwrap();
    let location = Uuid::new_v4();

    let (path, _) = write_test_image(dir.path(), "burst.png", [44, 44, 44]);
    let d_t0 = store.seed_completed_detection(location, &path, t0(), deer_box(), DeerClass::Doe);
    let d_t2 = store.seed_completed_detection(
        location,
        &path,
        t0() + chrono::Duration::seconds(2),
        deer_box(),
        DeerClass::Doe,
    );
    let d_t4 = store.seed_completed_detection(
        location,
        &path,
        t0() + chrono::Duration::seconds(4),
        deer_box(),
        DeerClass::Doe,
    );

    // Arrival order deliberately scrambled: T+4s, T, T+2s.
    for id in [d_t4, d_t0, d_t2] {
        queue.enqueue(REID_QUEUE, id).await.unwrap();
    }
    run_until_idle(&deps, &queue).await;

    assert_eq!(store.profile_count(), 1);
    let records: Vec<_> = [d_t0, d_t2, d_t4]
        .iter()
        .map(|id| store.detection_record(*id).unwrap())
        .collect();

    let deer_id = records[0].deer_id.unwrap();
    assert!(records.iter().all(|d| d.deer_id == Some(deer_id)));

    let group = records[0].burst_group_id.unwrap();
    assert!(records.iter().all(|d| d.burst_group_id == Some(group)));

    let profile = store.profile_record(deer_id).unwrap();
    assert_eq!(profile.sighting_count, 3);
    assert_eq!(profile.first_seen, t0());
    assert_eq!(profile.last_seen, t0() + chrono::Duration::seconds(4));
}

#[tokio::test]
async fn burst_window_is_inclusive_at_the_boundary() {
    let (store, queue, deps) = axis_harness();
    let dir = tempfile::tempdir().unwrap();
    let location = Uuid::new_v4();

    let (path, _) = write_test_image(dir.path(), "edge.png", [45, 45, 45]);
    let d_a = store.seed_completed_detection(location, &path, t0(), deer_box(), DeerClass::Doe);
    let d_b = store.seed_completed_detection(
        location,
        &path,
        t0() + chrono::Duration::seconds(5),
        deer_box(),
        DeerClass::Doe,
    );

    queue.enqueue(REID_QUEUE, d_a).await.unwrap();
    queue.enqueue(REID_QUEUE, d_b).await.unwrap();
    run_until_idle(&deps, &queue).await;

    // Exactly Δ apart: one burst, one shared group.
    let a = store.detection_record(d_a).unwrap();
    let b = store.detection_record(d_b).unwrap();
    assert_eq!(store.profile_count(), 1);
    assert!(a.burst_group_id.is_some());
    assert_eq!(a.burst_group_id, b.burst_group_id);
}

#[tokio::test]
async fn one_second_past_the_window_is_not_a_burst() {
    let (store, queue, deps) = axis_harness();
    let dir = tempfile::tempdir().unwrap();
    let location = Uuid::new_v4();

    let (path, _) = write_test_image(dir.path(), "edge2.png", [46, 46, 46]);
    let d_a = store.seed_completed_detection(location, &path, t0(), deer_box(), DeerClass::Doe);
    let d_b = store.seed_completed_detection(
        location,
        &path,
        t0() + chrono::Duration::seconds(6),
        deer_box(),
        DeerClass::Doe,
    );

    queue.enqueue(REID_QUEUE, d_a).await.unwrap();
    queue.enqueue(REID_QUEUE, d_b).await.unwrap();
    run_until_idle(&deps, &queue).await;

    // The second sighting still matches by similarity, but it is not burst
    // grouping: no group ids are allocated.
    let a = store.detection_record(d_a).unwrap();
    let b = store.detection_record(d_b).unwrap();
    assert_eq!(a.burst_group_id, None);
    assert_eq!(b.burst_group_id, None);
    assert_eq!(a.deer_id, b.deer_id);
}

#[tokio::test]
async fn nearest_profile_below_threshold_creates_a_new_one() {
    let (store, queue, deps) = axis_harness();
    let dir = tempfile::tempdir().unwrap();

    let existing = store.seed_profile(
        Sex::Doe,
        unit_vec_with_cos(0.62, TEST_EMBEDDING_DIM),
        t0() - chrono::Duration::days(3),
    );
    let before = store.profile_record(existing).unwrap();

    let (path, _) = write_test_image(dir.path(), "miss.png", [47, 47, 47]);
    let detection =
        store.seed_completed_detection(Uuid::new_v4(), &path, t0(), deer_box(), DeerClass::Doe);
    queue.enqueue(REID_QUEUE, detection).await.unwrap();
    run_until_idle(&deps, &queue).await;

    assert_eq!(store.profile_count(), 2);

    // The near miss left the existing profile untouched.
    let after = store.profile_record(existing).unwrap();
    assert_eq!(after.sighting_count, before.sighting_count);
    assert_eq!(after.embedding, before.embedding);

    let record = store.detection_record(detection).unwrap();
    assert_ne!(record.deer_id, Some(existing));
    assert!(record.deer_id.is_some());
}

#[tokio::test]
async fn score_exactly_at_threshold_assigns() {
    let (store, queue, mut deps) = axis_harness();
    deps.settings.reid_threshold = 1.0;
    let dir = tempfile::tempdir().unwrap();

    // Identical stored and query vectors score exactly 1.0.
    let existing = store.seed_profile(
        Sex::Doe,
        axis_vec(TEST_EMBEDDING_DIM),
        t0() - chrono::Duration::days(1),
    );

    let (path, _) = write_test_image(dir.path(), "exact.png", [48, 48, 48]);
    let detection =
        store.seed_completed_detection(Uuid::new_v4(), &path, t0(), deer_box(), DeerClass::Doe);
    queue.enqueue(REID_QUEUE, detection).await.unwrap();
    run_until_idle(&deps, &queue).await;

    assert_eq!(store.profile_count(), 1);
    let record = store.detection_record(detection).unwrap();
    assert_eq!(record.deer_id, Some(existing));
}

#[tokio::test]
async fn sex_restriction_skips_a_closer_candidate_of_the_wrong_sex() {
    let (store, queue, deps) = axis_harness();
    let dir = tempfile::tempdir().unwrap();

    let doe = store.seed_profile(
        Sex::Doe,
        unit_vec_with_cos(0.82, TEST_EMBEDDING_DIM),
        t0() - chrono::Duration::days(2),
    );
    let buck = store.seed_profile(
        Sex::Buck,
        unit_vec_with_cos(0.77, TEST_EMBEDDING_DIM),
        t0() - chrono::Duration::days(2),
    );

    let (path, _) = write_test_image(dir.path(), "buck.png", [49, 49, 49]);
    let detection = store.seed_completed_detection(
        Uuid::new_v4(),
        &path,
        t0(),
        deer_box(),
        DeerClass::Mature,
    );
    queue.enqueue(REID_QUEUE, detection).await.unwrap();
    run_until_idle(&deps, &queue).await;

    let record = store.detection_record(detection).unwrap();
    assert_eq!(record.deer_id, Some(buck));

    let doe_profile = store.profile_record(doe).unwrap();
    assert_eq!(doe_profile.sighting_count, 1);
}

#[tokio::test]
async fn unknown_sex_profile_matches_and_inherits_sex() {
    let (store, queue, deps) = axis_harness();
    let dir = tempfile::tempdir().unwrap();

    let profile = store.seed_profile(
        Sex::Unknown,
        unit_vec_with_cos(0.8, TEST_EMBEDDING_DIM),
        t0() - chrono::Duration::days(2),
    );

    let (path, _) = write_test_image(dir.path(), "inherit.png", [50, 50, 50]);
    let detection =
        store.seed_completed_detection(Uuid::new_v4(), &path, t0(), deer_box(), DeerClass::Doe);
    queue.enqueue(REID_QUEUE, detection).await.unwrap();
    run_until_idle(&deps, &queue).await;

    let record = store.detection_record(detection).unwrap();
    assert_eq!(record.deer_id, Some(profile));
    assert_eq!(store.profile_record(profile).unwrap().sex, Sex::Doe);
}

#[tokio::test]
async fn assignment_updates_profile_by_ema_and_stays_normalised() {
    let (store, queue, deps) = axis_harness();
    let dir = tempfile::tempdir().unwrap();

    let stored = unit_vec_with_cos(0.8, TEST_EMBEDDING_DIM);
    let profile = store.seed_profile(Sex::Doe, stored.clone(), t0() - chrono::Duration::days(1));

    let (path, _) = write_test_image(dir.path(), "ema.png", [51, 51, 51]);
    let detection =
        store.seed_completed_detection(Uuid::new_v4(), &path, t0(), deer_box(), DeerClass::Doe);
    queue.enqueue(REID_QUEUE, detection).await.unwrap();
    run_until_idle(&deps, &queue).await;

    let after = store.profile_record(profile).unwrap();
    assert_eq!(after.sighting_count, 2);
    assert_eq!(after.last_seen, t0());

    // Unit norm within the persisted-embedding tolerance.
    assert!((norm(&after.embedding) - 1.0).abs() < 1e-4);
    // Moved towards the query, but only partially (alpha = 0.3).
    let query = axis_vec(TEST_EMBEDDING_DIM);
    let sim_after = cosine_similarity(&after.embedding, &query);
    assert!(sim_after > 0.8);
    assert!(sim_after < 0.999);
}

#[tokio::test]
async fn resubmitting_an_assigned_detection_is_a_noop() {
    let (store, queue, deps) = axis_harness();
    let dir = tempfile::tempdir().unwrap();

    let (path, _) = write_test_image(dir.path(), "noop.png", [52, 52, 52]);
    let detection =
        store.seed_completed_detection(Uuid::new_v4(), &path, t0(), deer_box(), DeerClass::Doe);
    queue.enqueue(REID_QUEUE, detection).await.unwrap();
    run_until_idle(&deps, &queue).await;

    let first = store.detection_record(detection).unwrap();
    let profile_first = store.profile_record(first.deer_id.unwrap()).unwrap();

    queue.enqueue(REID_QUEUE, detection).await.unwrap();
    run_until_idle(&deps, &queue).await;

    let second = store.detection_record(detection).unwrap();
    assert_eq!(first.deer_id, second.deer_id);
    assert_eq!(first.burst_group_id, second.burst_group_id);

    let profile_second = store.profile_record(second.deer_id.unwrap()).unwrap();
    assert_eq!(profile_first.sighting_count, profile_second.sighting_count);
}

#[tokio::test]
async fn ensemble_weights_rerank_the_shortlist() {
    let aux_query = unit_vec_with_cos(1.0, TEST_EMBEDDING_DIM);
    let (store, queue, mut deps) = axis_harness();
    deps.aux_embedder = Some(Arc::new(FixedEmbedder::constant(aux_query.clone())));
    deps.settings.ensemble_weights =
        stagtrail_common::EnsembleWeights::new(vec![0.6, 0.4]).unwrap();
    let dir = tempfile::tempdir().unwrap();

    // A is closer on the primary extractor, B wins on the weighted sum:
    //   A: 0.6 * 0.80 + 0.4 * 0.20 = 0.56 (below threshold)
    //   B: 0.6 * 0.72 + 0.4 * 0.90 = 0.792
    let _a = store.seed_profile_with_alt(
        Sex::Doe,
        unit_vec_with_cos(0.80, TEST_EMBEDDING_DIM),
        Some(unit_vec_with_cos(0.20, TEST_EMBEDDING_DIM)),
        t0() - chrono::Duration::days(2),
    );
    let b = store.seed_profile_with_alt(
        Sex::Doe,
        unit_vec_with_cos(0.72, TEST_EMBEDDING_DIM),
        Some(unit_vec_with_cos(0.90, TEST_EMBEDDING_DIM)),
        t0() - chrono::Duration::days(2),
    );

    let (path, _) = write_test_image(dir.path(), "ensemble.png", [53, 53, 53]);
    let detection =
        store.seed_completed_detection(Uuid::new_v4(), &path, t0(), deer_box(), DeerClass::Doe);
    queue.enqueue(REID_QUEUE, detection).await.unwrap();
    run_until_idle(&deps, &queue).await;

    let record = store.detection_record(detection).unwrap();
    assert_eq!(record.deer_id, Some(b));
    assert_eq!(store.profile_count(), 2);
}

#[tokio::test]
async fn burst_reuse_leaves_the_profile_embedding_alone() {
    let (store, queue, deps) = axis_harness();
    let dir = tempfile::tempdir().unwrap();
    let location = Uuid::new_v4();

    let (path, _) = write_test_image(dir.path(), "freeze.png", [54, 54, 54]);
    let d_a = store.seed_completed_detection(location, &path, t0(), deer_box(), DeerClass::Doe);
    let d_b = store.seed_completed_detection(
        location,
        &path,
        t0() + chrono::Duration::seconds(1),
        deer_box(),
        DeerClass::Doe,
    );

    queue.enqueue(REID_QUEUE, d_a).await.unwrap();
    run_until_idle(&deps, &queue).await;
    let deer_id = store.detection_record(d_a).unwrap().deer_id.unwrap();
    let embedding_before = store.profile_record(deer_id).unwrap().embedding;

    queue.enqueue(REID_QUEUE, d_b).await.unwrap();
    run_until_idle(&deps, &queue).await;

    let after = store.profile_record(deer_id).unwrap();
    assert_eq!(after.sighting_count, 2);
    assert_eq!(after.embedding, embedding_before);
}

// ---------------------------------------------------------------------------
// Herd-level properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn profile_count_never_exceeds_nonduplicate_deer_detections() {
    let (store, queue, deps) =
        harness_with_embedder(FixedEmbedder::hash_based(TEST_EMBEDDING_DIM));
    let dir = tempfile::tempdir().unwrap();

    // A spread of captures across locations and times; nothing shares a
    // burst window.
    for (i, class) in [
        DeerClass::Doe,
        DeerClass::Mature,
        DeerClass::Fawn,
        DeerClass::Other,
        DeerClass::Young,
        DeerClass::Doe,
    ]
    .iter()
    .enumerate()
    {
        let (path, _) =
            write_test_image(dir.path(), &format!("spread-{i}.png"), [i as u8, 100, 7]);
        let detection = store.seed_completed_detection(
            Uuid::new_v4(),
            &path,
            t0() + chrono::Duration::minutes(i as i64 * 10),
            deer_box(),
            *class,
        );
        queue.enqueue(REID_QUEUE, detection).await.unwrap();
    }
    run_until_idle(&deps, &queue).await;

    let eligible = store
        .all_detections()
        .iter()
        .filter(|d| !d.is_duplicate && d.class != DeerClass::Other)
        .count();
    assert!(store.profile_count() <= eligible);

    // Invariant: non-deer detections never acquire a profile.
    assert!(store
        .all_detections()
        .iter()
        .filter(|d| d.class == DeerClass::Other)
        .all(|d| d.deer_id.is_none()));
}

#[tokio::test]
async fn identical_crops_converge_on_a_single_profile() {
    let (store, queue, deps) =
        harness_with_embedder(FixedEmbedder::hash_based(TEST_EMBEDDING_DIM));
    let dir = tempfile::tempdir().unwrap();

    // Same pixels, same box, far apart in space and time: every crop embeds
    // identically, so everything after the first sighting matches.
    for i in 0..4 {
        let (path, _) = write_test_image(dir.path(), &format!("same-{i}.png"), [77, 77, 77]);
        let detection = store.seed_completed_detection(
            Uuid::new_v4(),
            &path,
            t0() + chrono::Duration::hours(i),
            deer_box(),
            DeerClass::Doe,
        );
        queue.enqueue(REID_QUEUE, detection).await.unwrap();
    }
    run_until_idle(&deps, &queue).await;

    assert_eq!(store.profile_count(), 1);
    let profile = store.all_profiles().pop().unwrap();
    assert_eq!(profile.sighting_count, 4);
    assert!((norm(&profile.embedding) - 1.0).abs() < 1e-4);
}

#[tokio::test]
async fn sighting_counts_match_assigned_detections() {
    let (store, queue, deps) =
        harness_with_embedder(FixedEmbedder::hash_based(TEST_EMBEDDING_DIM));
    let dir = tempfile::tempdir().unwrap();
    let location = Uuid::new_v4();

    // A burst of two plus two solo sightings elsewhere.
    let (path, _) = write_test_image(dir.path(), "count-a.png", [60, 61, 62]);
    for offset in [0, 3] {
        let d = store.seed_completed_detection(
            location,
            &path,
            t0() + chrono::Duration::seconds(offset),
            deer_box(),
            DeerClass::Doe,
        );
        queue.enqueue(REID_QUEUE, d).await.unwrap();
    }
    for i in 0..2 {
        let (path, _) = write_test_image(dir.path(), &format!("count-b{i}.png"), [90 + i, 2, 2]);
        let d = store.seed_completed_detection(
            Uuid::new_v4(),
            &path,
            t0() + chrono::Duration::hours(i as i64 + 1),
            deer_box(),
            DeerClass::Mature,
        );
        queue.enqueue(REID_QUEUE, d).await.unwrap();
    }
    run_until_idle(&deps, &queue).await;

    for profile in store.all_profiles() {
        let assigned = store
            .all_detections()
            .iter()
            .filter(|d| d.deer_id == Some(profile.id) && !d.is_duplicate)
            .count();
        assert_eq!(profile.sighting_count as usize, assigned);
        assert!(profile.first_seen <= profile.last_seen);
    }
}
