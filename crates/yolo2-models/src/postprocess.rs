//! Non-maximum suppression and letterbox correction.

// Image dimensions are far below f32's exact-integer range
#![allow(clippy::cast_precision_loss)]

use crate::region::{BBox, Detection};

/// Intersection-over-union of two boxes.
#[must_use]
pub fn box_iou(a: &BBox, b: &BBox) -> f32 {
    let overlap = |ax: f32, aw: f32, bx: f32, bw: f32| -> f32 {
        let l = (ax - aw / 2.0).max(bx - bw / 2.0);
        let r = (ax + aw / 2.0).min(bx + bw / 2.0);
        (r - l).max(0.0)
    };
    let inter = overlap(a.x, a.w, b.x, b.w) * overlap(a.y, a.h, b.y, b.h);
    let union = a.w * a.h + b.w * b.h - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Greedy per-class suppression.
///
/// For each class, detections are visited in descending probability;
/// anything overlapping an already-kept box beyond `iou_thresh` has
/// its probability for that class zeroed. Detections stay in place so
/// a box can still win a different class.
pub fn nms_sort(dets: &mut [Detection], iou_thresh: f32) {
    let classes = dets.first().map_or(0, |d| d.class_probs.len());
    for class in 0..classes {
        let mut order: Vec<usize> = (0..dets.len()).collect();
        order.sort_by(|&a, &b| {
            dets[b].class_probs[class]
                .partial_cmp(&dets[a].class_probs[class])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for i in 0..order.len() {
            if dets[order[i]].class_probs[class] == 0.0 {
                continue;
            }
            let keeper = dets[order[i]].bbox;
            for &j in &order[i + 1..] {
                if box_iou(&keeper, &dets[j].bbox) > iou_thresh {
                    dets[j].class_probs[class] = 0.0;
                }
            }
        }
    }
}

/// A thresholded, suppressed detection ready for the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalDetection {
    /// Box in original-image relative coordinates.
    pub bbox: BBox,
    /// Winning class index.
    pub class: usize,
    /// Winning class probability.
    pub prob: f32,
}

/// Collapse suppressed candidates to their winning classes.
#[must_use]
pub fn finalize(dets: &[Detection], thresh: f32) -> Vec<FinalDetection> {
    let mut out: Vec<FinalDetection> = dets
        .iter()
        .filter_map(|d| {
            let (class, prob) = d.best_class();
            (prob > thresh).then(|| FinalDetection {
                bbox: d.bbox,
                class,
                prob,
            })
        })
        .collect();
    out.sort_by(|a, b| b.prob.partial_cmp(&a.prob).unwrap_or(std::cmp::Ordering::Equal));
    out
}

/// Undo the letterbox: map boxes from network-square coordinates back
/// to the original `img_w × img_h` frame.
pub fn correct_region_boxes(
    dets: &mut [Detection],
    img_w: usize,
    img_h: usize,
    net_w: usize,
    net_h: usize,
) {
    let (img_w, img_h, net_w, net_h) = (img_w as f32, img_h as f32, net_w as f32, net_h as f32);
    // Whichever axis limited the resize kept the full network extent.
    let (new_w, new_h) = if net_w / img_w < net_h / img_h {
        (net_w, img_h * net_w / img_w)
    } else {
        (img_w * net_h / img_h, net_h)
    };
    for d in dets {
        d.bbox.x = (d.bbox.x - (net_w - new_w) / 2.0 / net_w) / (new_w / net_w);
        d.bbox.y = (d.bbox.y - (net_h - new_h) / 2.0 / net_h) / (new_h / net_h);
        d.bbox.w *= net_w / new_w;
        d.bbox.h *= net_h / new_h;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32, y: f32, w: f32, h: f32, probs: &[f32]) -> Detection {
        Detection {
            bbox: BBox { x, y, w, h },
            objectness: 1.0,
            class_probs: probs.to_vec(),
        }
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = BBox {
            x: 0.5,
            y: 0.5,
            w: 0.2,
            h: 0.2,
        };
        assert!((box_iou(&b, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BBox { x: 0.2, y: 0.2, w: 0.1, h: 0.1 };
        let b = BBox { x: 0.8, y: 0.8, w: 0.1, h: 0.1 };
        assert_eq!(box_iou(&a, &b), 0.0);
    }

    #[test]
    fn nms_keeps_the_strongest_of_an_overlapping_pair() {
        let mut dets = vec![
            det(0.50, 0.50, 0.20, 0.20, &[0.9, 0.0]),
            det(0.51, 0.50, 0.20, 0.20, &[0.6, 0.0]),
            det(0.90, 0.90, 0.10, 0.10, &[0.7, 0.0]),
        ];
        nms_sort(&mut dets, 0.45);
        let finals = finalize(&dets, 0.5);
        assert_eq!(finals.len(), 2);
        assert!((finals[0].prob - 0.9).abs() < 1e-6);
        assert!((finals[1].prob - 0.7).abs() < 1e-6);
    }

    #[test]
    fn nms_is_per_class() {
        // Same geometry, different classes: both survive.
        let mut dets = vec![
            det(0.5, 0.5, 0.2, 0.2, &[0.9, 0.0]),
            det(0.5, 0.5, 0.2, 0.2, &[0.0, 0.8]),
        ];
        nms_sort(&mut dets, 0.45);
        assert_eq!(finalize(&dets, 0.5).len(), 2);
    }

    #[test]
    fn nms_is_idempotent() {
        let mut dets = vec![
            det(0.50, 0.50, 0.20, 0.20, &[0.9]),
            det(0.51, 0.50, 0.20, 0.20, &[0.6]),
        ];
        nms_sort(&mut dets, 0.45);
        let once: Vec<Vec<f32>> = dets.iter().map(|d| d.class_probs.clone()).collect();
        nms_sort(&mut dets, 0.45);
        let twice: Vec<Vec<f32>> = dets.iter().map(|d| d.class_probs.clone()).collect();
        assert_eq!(once, twice);
    }

    #[test]
    fn letterbox_correction_centers_a_wide_image() {
        // A 832x416 frame letterboxed into 416x416 occupies the middle
        // half vertically; a box at the network center maps back to
        // the image center with doubled relative height.
        let mut dets = vec![det(0.5, 0.5, 0.25, 0.25, &[1.0])];
        correct_region_boxes(&mut dets, 832, 416, 416, 416);
        let b = dets[0].bbox;
        assert!((b.x - 0.5).abs() < 1e-6);
        assert!((b.y - 0.5).abs() < 1e-6);
        assert!((b.w - 0.25).abs() < 1e-6);
        assert!((b.h - 0.5).abs() < 1e-6);
    }
}
