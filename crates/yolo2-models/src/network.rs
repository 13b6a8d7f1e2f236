//! Network description as an explicit dataflow graph.
//!
//! Every layer names the layers it consumes. Straight-line layers
//! consume their predecessor; routes name arbitrary earlier layers.
//! The memory planner and the quantization tracker both work from
//! these edges rather than from layer positions, so a network with a
//! different skip structure plans correctly without special cases.

use crate::error::{ModelError, Result};
use yolo2_chip::align_row_8;

/// What a layer computes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerKind {
    /// Convolution, runs on the accelerator.
    Conv {
        /// Output channels.
        filters: usize,
        /// Kernel size.
        size: usize,
        /// Kernel stride.
        stride: usize,
        /// Spatial padding.
        pad: usize,
        /// Bias folded from batch norm.
        batch_norm: bool,
        /// Leaky ReLU on the output.
        leaky: bool,
    },
    /// Max pooling, runs on the accelerator.
    Maxpool {
        /// Window size.
        size: usize,
        /// Window stride.
        stride: usize,
    },
    /// Space-to-depth shuffle, runs on the CPU.
    Reorg {
        /// Spatial reduction factor.
        stride: usize,
    },
    /// Channel concatenation of the named inputs. Zero-copy when the
    /// planner can alias the source buffers.
    Route,
    /// Final detection head, decoded on the CPU.
    Region {
        /// Object classes.
        classes: usize,
        /// Anchor boxes per cell.
        boxes: usize,
        /// Apply softmax over class scores.
        softmax: bool,
    },
}

/// One layer with resolved shapes and edges.
#[derive(Debug, Clone)]
pub struct Layer {
    /// What the layer computes.
    pub kind: LayerKind,
    /// Producer layer indices, in concatenation order. Empty means the
    /// network input.
    pub inputs: Vec<usize>,
    /// Input width.
    pub in_w: usize,
    /// Input height.
    pub in_h: usize,
    /// Input channels.
    pub in_c: usize,
    /// Output width.
    pub out_w: usize,
    /// Output height.
    pub out_h: usize,
    /// Output channels.
    pub out_c: usize,
}

impl Layer {
    /// Output size in words with rows padded to 8 elements.
    #[must_use]
    pub fn out_words(&self) -> usize {
        align_row_8(self.out_w) * self.out_h * self.out_c
    }

    /// Input size in words with rows padded to 8 elements.
    #[must_use]
    pub fn in_words(&self) -> usize {
        align_row_8(self.in_w) * self.in_h * self.in_c
    }

    /// Weight element count for a convolution, zero otherwise.
    #[must_use]
    pub fn weight_elems(&self) -> usize {
        match self.kind {
            LayerKind::Conv { filters, size, .. } => self.in_c * filters * size * size,
            _ => 0,
        }
    }

    /// Bias element count for a convolution, zero otherwise.
    #[must_use]
    pub fn bias_elems(&self) -> usize {
        match self.kind {
            LayerKind::Conv { filters, .. } => filters,
            _ => 0,
        }
    }
}

/// A validated network.
#[derive(Debug, Clone)]
pub struct Network {
    layers: Vec<Layer>,
    input_w: usize,
    input_h: usize,
    input_c: usize,
}

impl Network {
    /// All layers in execution order.
    #[must_use]
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Network input width.
    #[must_use]
    pub const fn input_w(&self) -> usize {
        self.input_w
    }

    /// Network input height.
    #[must_use]
    pub const fn input_h(&self) -> usize {
        self.input_h
    }

    /// Network input channels.
    #[must_use]
    pub const fn input_c(&self) -> usize {
        self.input_c
    }

    /// Network input size in words, rows padded to 8 elements.
    #[must_use]
    pub fn input_words(&self) -> usize {
        align_row_8(self.input_w) * self.input_h * self.input_c
    }

    /// Number of convolution layers, in order.
    #[must_use]
    pub fn conv_count(&self) -> usize {
        self.layers
            .iter()
            .filter(|l| matches!(l.kind, LayerKind::Conv { .. }))
            .count()
    }

    /// For each layer, the layers that consume its output.
    #[must_use]
    pub fn consumers(&self) -> Vec<Vec<usize>> {
        let mut out = vec![Vec::new(); self.layers.len()];
        for (i, layer) in self.layers.iter().enumerate() {
            for &p in &layer.inputs {
                out[p].push(i);
            }
        }
        out
    }
}

/// Incremental network builder.
///
/// Each added layer consumes the previous one unless it names its
/// sources explicitly (routes).
#[derive(Debug)]
pub struct NetworkBuilder {
    layers: Vec<Layer>,
    input_w: usize,
    input_h: usize,
    input_c: usize,
}

impl NetworkBuilder {
    /// Start a network with the given input shape.
    #[must_use]
    pub fn new(input_w: usize, input_h: usize, input_c: usize) -> Self {
        Self {
            layers: Vec::new(),
            input_w,
            input_h,
            input_c,
        }
    }

    fn prev_shape(&self) -> (usize, usize, usize) {
        self.layers.last().map_or(
            (self.input_w, self.input_h, self.input_c),
            |l| (l.out_w, l.out_h, l.out_c),
        )
    }

    fn prev_edge(&self) -> Vec<usize> {
        if self.layers.is_empty() {
            Vec::new()
        } else {
            vec![self.layers.len() - 1]
        }
    }

    /// Add a convolution layer.
    pub fn conv(
        &mut self,
        filters: usize,
        size: usize,
        stride: usize,
        batch_norm: bool,
        leaky: bool,
    ) -> &mut Self {
        let pad = size / 2;
        let (w, h, c) = self.prev_shape();
        let out_w = (w + 2 * pad - size) / stride + 1;
        let out_h = (h + 2 * pad - size) / stride + 1;
        self.layers.push(Layer {
            kind: LayerKind::Conv {
                filters,
                size,
                stride,
                pad,
                batch_norm,
                leaky,
            },
            inputs: self.prev_edge(),
            in_w: w,
            in_h: h,
            in_c: c,
            out_w,
            out_h,
            out_c: filters,
        });
        self
    }

    /// Add a max-pooling layer.
    pub fn maxpool(&mut self, size: usize, stride: usize) -> &mut Self {
        let (w, h, c) = self.prev_shape();
        let out_w = w.div_ceil(stride);
        let out_h = h.div_ceil(stride);
        self.layers.push(Layer {
            kind: LayerKind::Maxpool { size, stride },
            inputs: self.prev_edge(),
            in_w: w,
            in_h: h,
            in_c: c,
            out_w,
            out_h,
            out_c: c,
        });
        self
    }

    /// Add a reorg layer.
    pub fn reorg(&mut self, stride: usize) -> &mut Self {
        let (w, h, c) = self.prev_shape();
        self.layers.push(Layer {
            kind: LayerKind::Reorg { stride },
            inputs: self.prev_edge(),
            in_w: w,
            in_h: h,
            in_c: c,
            out_w: w / stride,
            out_h: h / stride,
            out_c: c * stride * stride,
        });
        self
    }

    /// Add a route concatenating the named layers, first source first.
    pub fn route(&mut self, sources: &[usize]) -> &mut Self {
        // Shapes resolved against whatever the sources currently are;
        // finish() re-validates the indices.
        let (w, h) = sources
            .first()
            .and_then(|&s| self.layers.get(s))
            .map_or((0, 0), |l| (l.out_w, l.out_h));
        let c: usize = sources
            .iter()
            .filter_map(|&s| self.layers.get(s))
            .map(|l| l.out_c)
            .sum();
        self.layers.push(Layer {
            kind: LayerKind::Route,
            inputs: sources.to_vec(),
            in_w: w,
            in_h: h,
            in_c: c,
            out_w: w,
            out_h: h,
            out_c: c,
        });
        self
    }

    /// Add the region detection head.
    pub fn region(&mut self, classes: usize, boxes: usize, softmax: bool) -> &mut Self {
        let (w, h, c) = self.prev_shape();
        self.layers.push(Layer {
            kind: LayerKind::Region {
                classes,
                boxes,
                softmax,
            },
            inputs: self.prev_edge(),
            in_w: w,
            in_h: h,
            in_c: c,
            out_w: w,
            out_h: h,
            out_c: c,
        });
        self
    }

    /// Validate and freeze the network.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidNetwork`] for dangling edges,
    /// mismatched route shapes, non-divisible reorg strides, or a
    /// region head whose channel count does not match its anchors.
    pub fn finish(self) -> Result<Network> {
        for (i, layer) in self.layers.iter().enumerate() {
            if i > 0 && layer.inputs.is_empty() {
                return Err(ModelError::invalid_network(format!(
                    "layer {i} has no producer"
                )));
            }
            for &p in &layer.inputs {
                if p >= i {
                    return Err(ModelError::invalid_network(format!(
                        "layer {i} consumes layer {p} which does not precede it"
                    )));
                }
            }
            match &layer.kind {
                LayerKind::Route => {
                    if layer.inputs.is_empty() {
                        return Err(ModelError::invalid_network(format!(
                            "route {i} has no sources"
                        )));
                    }
                    let first = &self.layers[layer.inputs[0]];
                    for &s in &layer.inputs[1..] {
                        let src = &self.layers[s];
                        if src.out_w != first.out_w || src.out_h != first.out_h {
                            return Err(ModelError::invalid_network(format!(
                                "route {i} sources disagree on spatial size: \
                                 {}x{} vs {}x{}",
                                first.out_w, first.out_h, src.out_w, src.out_h
                            )));
                        }
                    }
                }
                LayerKind::Reorg { stride } => {
                    if layer.in_w % stride != 0 || layer.in_h % stride != 0 {
                        return Err(ModelError::invalid_network(format!(
                            "reorg {i}: {}x{} not divisible by stride {stride}",
                            layer.in_w, layer.in_h
                        )));
                    }
                }
                LayerKind::Region { classes, boxes, .. } => {
                    let needed = boxes * (classes + 5);
                    if layer.in_c != needed {
                        return Err(ModelError::invalid_network(format!(
                            "region {i} expects {needed} channels, got {}",
                            layer.in_c
                        )));
                    }
                    if i + 1 != self.layers.len() {
                        return Err(ModelError::invalid_network(
                            "region must be the final layer",
                        ));
                    }
                }
                LayerKind::Conv { .. } | LayerKind::Maxpool { .. } => {}
            }
        }
        Ok(Network {
            layers: self.layers,
            input_w: self.input_w,
            input_h: self.input_h,
            input_c: self.input_c,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes_propagate_through_a_small_chain() {
        let mut b = NetworkBuilder::new(32, 32, 3);
        b.conv(16, 3, 1, true, true).maxpool(2, 2).conv(8, 1, 1, true, true);
        let net = b.finish().unwrap();
        let l = net.layers();
        assert_eq!((l[0].out_w, l[0].out_h, l[0].out_c), (32, 32, 16));
        assert_eq!((l[1].out_w, l[1].out_h, l[1].out_c), (16, 16, 16));
        assert_eq!((l[2].out_w, l[2].out_h, l[2].out_c), (16, 16, 8));
        assert_eq!(net.conv_count(), 2);
    }

    #[test]
    fn route_concatenates_channels() {
        let mut b = NetworkBuilder::new(16, 16, 4);
        b.conv(8, 1, 1, true, true);
        b.conv(6, 1, 1, true, true);
        b.route(&[0, 1]);
        let net = b.finish().unwrap();
        assert_eq!(net.layers()[2].out_c, 14);
        assert_eq!(net.consumers()[0], vec![1, 2]);
    }

    #[test]
    fn route_rejects_mismatched_spatial_sizes() {
        let mut b = NetworkBuilder::new(16, 16, 4);
        b.conv(8, 1, 1, true, true);
        b.maxpool(2, 2);
        b.route(&[0, 1]);
        assert!(b.finish().is_err());
    }

    #[test]
    fn region_channel_count_is_checked() {
        let mut b = NetworkBuilder::new(16, 16, 4);
        b.conv(30, 1, 1, false, false);
        // 30 channels cannot carry 5 boxes of 85 values.
        b.region(80, 5, true);
        assert!(b.finish().is_err());
    }

    #[test]
    fn reorg_divisibility_is_checked() {
        let mut b = NetworkBuilder::new(13, 13, 4);
        b.reorg(2);
        assert!(b.finish().is_err());
    }

    #[test]
    fn stride_one_pool_keeps_size() {
        let mut b = NetworkBuilder::new(13, 13, 8);
        b.maxpool(2, 1);
        let net = b.finish().unwrap();
        assert_eq!(net.layers()[0].out_w, 13);
    }
}
