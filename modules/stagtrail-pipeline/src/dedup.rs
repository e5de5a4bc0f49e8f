//! In-image deduplication of detector output.
//!
//! The detector fires several boxes on the same animal when it is large in
//! frame. Walking the results by descending confidence, any box overlapping
//! an already-kept box at or above the IoU threshold is marked duplicate.
//! Duplicates are still persisted (the full detector output stays
//! auditable) but never enter Re-ID.

use stagtrail_common::{BBox, DeerClass};

/// One filtered detector result, pre-dedup.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub bbox: BBox,
    pub confidence: f32,
    pub class: DeerClass,
}

/// Mark duplicates in place. Returns candidates sorted by descending
/// confidence, each paired with its duplicate flag. Ties on confidence keep
/// input order, so the outcome is deterministic for a fixed detector
/// output.
pub fn mark_duplicates(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<(Candidate, bool)> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<BBox> = Vec::new();
    let mut out = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        let duplicate = kept
            .iter()
            .any(|k| candidate.bbox.iou(k) >= iou_threshold);
        if !duplicate {
            kept.push(candidate.bbox);
        }
        out.push((candidate, duplicate));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(bbox: BBox, confidence: f32) -> Candidate {
        Candidate {
            bbox,
            confidence,
            class: DeerClass::Doe,
        }
    }

    #[test]
    fn overlapping_pair_keeps_higher_confidence() {
        // IoU of these two is 0.8-ish: same box shifted slightly.
        let a = BBox::new(0, 0, 100, 100);
        let b = BBox::new(0, 10, 100, 100);
        let marked = mark_duplicates(vec![candidate(a, 0.7), candidate(b, 0.9)], 0.5);

        assert_eq!(marked.len(), 2);
        // Sorted: 0.9 first, kept; 0.7 marked duplicate.
        assert!((marked[0].0.confidence - 0.9).abs() < 1e-6);
        assert!(!marked[0].1);
        assert!(marked[1].1);
    }

    #[test]
    fn disjoint_boxes_all_kept() {
        let marked = mark_duplicates(
            vec![
                candidate(BBox::new(0, 0, 50, 50), 0.9),
                candidate(BBox::new(200, 200, 50, 50), 0.6),
            ],
            0.5,
        );
        assert!(marked.iter().all(|(_, dup)| !dup));
    }

    #[test]
    fn iou_exactly_at_threshold_marks_duplicate() {
        // Two 10x10 boxes overlapping in a 10x5 strip: IoU = 50/150 = 1/3.
        let a = BBox::new(0, 0, 10, 10);
        let b = BBox::new(0, 5, 10, 10);
        let threshold = a.iou(&b);
        let marked = mark_duplicates(vec![candidate(a, 0.9), candidate(b, 0.8)], threshold);
        assert!(marked[1].1);

        // Strictly above the observed IoU: both kept.
        let marked = mark_duplicates(
            vec![candidate(a, 0.9), candidate(b, 0.8)],
            threshold + 1e-4,
        );
        assert!(!marked[1].1);
    }

    #[test]
    fn duplicate_of_a_duplicate_compares_against_kept_only() {
        // b duplicates a; c overlaps b but not a, so c survives.
        let a = BBox::new(0, 0, 100, 100);
        let b = BBox::new(0, 40, 100, 100);
        let c = BBox::new(0, 90, 100, 100);
        let marked = mark_duplicates(
            vec![candidate(a, 0.9), candidate(b, 0.8), candidate(c, 0.7)],
            0.4,
        );
        assert!(!marked[0].1);
        assert!(marked[1].1);
        assert!(!marked[2].1);
    }
}
