//! Greedy non-max suppression

use super::Detection;

pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
pub const DEFAULT_MAX_DETECTIONS: usize = 50;

/// Intersection over union of two relative boxes. Zero when the union is empty.
pub fn iou(a: &Detection, b: &Detection) -> f32 {
    let x1 = a.xmin.max(b.xmin);
    let y1 = a.ymin.max(b.ymin);
    let x2 = a.xmax.min(b.xmax);
    let y2 = a.ymax.min(b.ymax);
    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Keep the highest-scoring boxes whose IoU with every kept box is below
/// `iou_threshold`, at most `max_detections` of them, in descending score order.
pub fn suppress(
    mut detections: Vec<Detection>,
    score_floor: f32,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<Detection> {
    detections.retain(|d| d.score >= score_floor);
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<Detection> = Vec::with_capacity(max_detections.min(detections.len()));
    for candidate in detections {
        if kept.len() >= max_detections {
            break;
        }
        if kept.iter().all(|k| iou(&candidate, k) < iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}
