//! Priority-ordered deduplication of boxes contributed by several detectors.

use crate::types::BoundingBox;

/// IoU threshold for two- or three-detector ensembles.
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.5;
/// Looser threshold used when every detector family is combined.
pub const FULL_ENSEMBLE_IOU_THRESHOLD: f32 = 0.4;

/// Intersection-over-Union of two boxes, computed on their edges directly.
///
/// Returns 0.0 when the boxes do not overlap.
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let left = a.left.max(b.left);
    let top = a.top.max(b.top);
    let right = a.right.min(b.right);
    let bottom = a.bottom.min(b.bottom);

    let inter_w = (right - left).max(0) as i64;
    let inter_h = (bottom - top).max(0) as i64;
    let inter_area = inter_w * inter_h;
    if inter_area == 0 {
        return 0.0;
    }

    let union_area = a.area() + b.area() - inter_area;
    if union_area > 0 {
        inter_area as f32 / union_area as f32
    } else {
        0.0
    }
}

/// Merge boxes ordered by detector priority.
///
/// The first box is always kept. Every later box is discarded when its IoU
/// with any kept box reaches `iou_threshold`, so the higher-priority
/// detector's box wins for a shared face while faces found only by a
/// lower-priority detector survive.
pub fn merge(boxes: &[BoundingBox], iou_threshold: f32) -> Vec<BoundingBox> {
    let mut kept: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        let duplicate = kept.iter().any(|k| iou(candidate, k) >= iou_threshold);
        if !duplicate {
            kept.push(*candidate);
        }
    }
    kept
}
