//! Region head decoding.
//!
//! The final convolution leaves a `13×13×(boxes·(5+classes))` grid of
//! raw predictions. Decoding applies the logistic to the box centers
//! and objectness, softmax over class scores, and sizes boxes by the
//! anchor priors. All coordinates come out relative to the network
//! input square; letterbox correction happens afterwards in
//! [`crate::postprocess`].

// Grid indices are tiny; f32 holds them exactly
#![allow(clippy::cast_precision_loss)]

use crate::error::{ModelError, Result};
use crate::network::{LayerKind, Network};

/// A box in relative coordinates (center x/y, width, height in 0..1
/// of the network input).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    /// Center x.
    pub x: f32,
    /// Center y.
    pub y: f32,
    /// Width.
    pub w: f32,
    /// Height.
    pub h: f32,
}

/// One decoded candidate with per-class scores.
#[derive(Debug, Clone)]
pub struct Detection {
    /// Box geometry.
    pub bbox: BBox,
    /// Objectness score.
    pub objectness: f32,
    /// Per-class probability (objectness already folded in).
    pub class_probs: Vec<f32>,
}

impl Detection {
    /// Best class and its probability.
    #[must_use]
    pub fn best_class(&self) -> (usize, f32) {
        self.class_probs
            .iter()
            .enumerate()
            .fold((0, 0.0), |best, (i, &p)| if p > best.1 { (i, p) } else { best })
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Decoder configured for one network's region head.
#[derive(Debug, Clone)]
pub struct RegionDecoder {
    grid_w: usize,
    grid_h: usize,
    classes: usize,
    boxes: usize,
    softmax: bool,
    anchors: Vec<(f32, f32)>,
    /// Candidates below this objectness-scaled probability are dropped.
    pub thresh: f32,
}

impl RegionDecoder {
    /// Build a decoder from the network's region layer.
    ///
    /// # Errors
    ///
    /// Fails if the network has no region head or the anchor count
    /// does not match its boxes-per-cell.
    pub fn for_network(net: &Network, anchors: &[(f32, f32)], thresh: f32) -> Result<Self> {
        let head = net
            .layers()
            .iter()
            .rev()
            .find_map(|l| match l.kind {
                LayerKind::Region {
                    classes,
                    boxes,
                    softmax,
                } => Some((l, classes, boxes, softmax)),
                _ => None,
            })
            .ok_or_else(|| ModelError::invalid_network("network has no region head"))?;
        let (layer, classes, boxes, softmax) = head;
        if anchors.len() != boxes {
            return Err(ModelError::invalid_network(format!(
                "{} anchors for {boxes} boxes per cell",
                anchors.len()
            )));
        }
        Ok(Self {
            grid_w: layer.in_w,
            grid_h: layer.in_h,
            classes,
            boxes,
            softmax,
            anchors: anchors.to_vec(),
            thresh,
        })
    }

    /// Decode a dequantized feature map laid out channel-major
    /// (`c` planes of `grid_h × grid_w`).
    #[must_use]
    pub fn decode(&self, feat: &[f32]) -> Vec<Detection> {
        let cells = self.grid_w * self.grid_h;
        debug_assert_eq!(feat.len(), cells * self.boxes * (5 + self.classes));
        let at = |n: usize, ch: usize, row: usize, col: usize| -> f32 {
            feat[((n * (5 + self.classes) + ch) * self.grid_h + row) * self.grid_w + col]
        };

        let mut out = Vec::new();
        for n in 0..self.boxes {
            let (aw, ah) = self.anchors[n];
            for row in 0..self.grid_h {
                for col in 0..self.grid_w {
                    let objectness = sigmoid(at(n, 4, row, col));
                    let bbox = BBox {
                        x: (col as f32 + sigmoid(at(n, 0, row, col))) / self.grid_w as f32,
                        y: (row as f32 + sigmoid(at(n, 1, row, col))) / self.grid_h as f32,
                        w: at(n, 2, row, col).exp() * aw / self.grid_w as f32,
                        h: at(n, 3, row, col).exp() * ah / self.grid_h as f32,
                    };

                    let mut scores: Vec<f32> = (0..self.classes)
                        .map(|c| at(n, 5 + c, row, col))
                        .collect();
                    if self.softmax {
                        softmax_in_place(&mut scores);
                    }
                    let class_probs: Vec<f32> = scores
                        .iter()
                        .map(|&s| {
                            let p = objectness * s;
                            if p > self.thresh {
                                p
                            } else {
                                0.0
                            }
                        })
                        .collect();
                    if class_probs.iter().any(|&p| p > 0.0) {
                        out.push(Detection {
                            bbox,
                            objectness,
                            class_probs,
                        });
                    }
                }
            }
        }
        out
    }

    /// Grid width of the head.
    #[must_use]
    pub const fn grid_w(&self) -> usize {
        self.grid_w
    }

    /// Grid height of the head.
    #[must_use]
    pub const fn grid_h(&self) -> usize {
        self.grid_h
    }

    /// Class count of the head.
    #[must_use]
    pub const fn classes(&self) -> usize {
        self.classes
    }
}

fn softmax_in_place(scores: &mut [f32]) {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for s in scores.iter_mut() {
        *s = (*s - max).exp();
        sum += *s;
    }
    for s in scores {
        *s /= sum;
    }
}
