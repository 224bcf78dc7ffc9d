//! Greedy non-maximum suppression.

use super::result::BoundingBox;

/// Indices of the boxes kept, ordered by descending score.
///
/// Boxes scoring at or below `score_threshold` are dropped first. A box is
/// suppressed when its IoU with an already-kept box is at least
/// `iou_threshold`.
pub fn non_max_suppression(
    boxes: &[BoundingBox],
    scores: &[f32],
    score_threshold: f32,
    iou_threshold: f32,
) -> Vec<usize> {
    let mut order: Vec<usize> = (0..boxes.len().min(scores.len()))
        .filter(|&i| scores[i] > score_threshold)
        .collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));

    let mut kept: Vec<usize> = Vec::with_capacity(order.len());
    for idx in order {
        let overlaps = kept
            .iter()
            .any(|&k| boxes[k].iou(&boxes[idx]) >= iou_threshold);
        if !overlaps {
            kept.push(idx);
        }
    }
    kept
}
