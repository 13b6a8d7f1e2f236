//! Weight and bias slicing.
//!
//! The blobs carry every convolution's parameters back to back in
//! execution order. Each convolution's extent is fully determined by
//! the network description (`in_c · filters · k²` weights, `filters`
//! biases), so offsets are derived rather than tabulated, and a blob
//! that does not add up to the network is rejected outright.

use crate::error::{ModelError, Result};
use crate::network::{LayerKind, Network};

/// Sliced weight and bias blobs for one network.
#[derive(Debug)]
pub struct WeightSet {
    weights: Vec<i16>,
    biases: Vec<i16>,
    /// (offset, len) per convolution, in conv order.
    weight_spans: Vec<(usize, usize)>,
    bias_spans: Vec<(usize, usize)>,
}

impl WeightSet {
    /// Slice blobs against a network.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::BlobSizeMismatch`] if either blob's total
    /// size differs from what the network's convolutions require.
    pub fn new(weights: Vec<i16>, biases: Vec<i16>, net: &Network) -> Result<Self> {
        let mut weight_spans = Vec::new();
        let mut bias_spans = Vec::new();
        let mut w_off = 0;
        let mut b_off = 0;
        for layer in net.layers() {
            if !matches!(layer.kind, LayerKind::Conv { .. }) {
                continue;
            }
            let w_len = layer.weight_elems();
            let b_len = layer.bias_elems();
            weight_spans.push((w_off, w_len));
            bias_spans.push((b_off, b_len));
            w_off += w_len;
            b_off += b_len;
        }
        if weights.len() != w_off {
            return Err(ModelError::BlobSizeMismatch {
                what: "weights".into(),
                expected: w_off,
                actual: weights.len(),
            });
        }
        if biases.len() != b_off {
            return Err(ModelError::BlobSizeMismatch {
                what: "biases".into(),
                expected: b_off,
                actual: biases.len(),
            });
        }
        Ok(Self {
            weights,
            biases,
            weight_spans,
            bias_spans,
        })
    }

    /// Weights of the `k`-th convolution.
    #[must_use]
    pub fn weight_slice(&self, k: usize) -> &[i16] {
        let (off, len) = self.weight_spans[k];
        &self.weights[off..off + len]
    }

    /// Biases of the `k`-th convolution.
    #[must_use]
    pub fn bias_slice(&self, k: usize) -> &[i16] {
        let (off, len) = self.bias_spans[k];
        &self.biases[off..off + len]
    }

    /// Word offset of the `k`-th convolution's weights in the blob.
    #[must_use]
    pub fn weight_offset(&self, k: usize) -> usize {
        self.weight_spans[k].0
    }

    /// Word offset of the `k`-th convolution's biases in the blob.
    #[must_use]
    pub fn bias_offset(&self, k: usize) -> usize {
        self.bias_spans[k].0
    }

    /// Whole weight blob.
    #[must_use]
    pub fn weights(&self) -> &[i16] {
        &self.weights
    }

    /// Whole bias blob.
    #[must_use]
    pub fn biases(&self) -> &[i16] {
        &self.biases
    }

    /// Number of convolutions covered.
    #[must_use]
    pub fn conv_count(&self) -> usize {
        self.weight_spans.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkBuilder;

    fn net() -> Network {
        let mut b = NetworkBuilder::new(8, 8, 2);
        b.conv(4, 3, 1, true, true); // 2*4*9 = 72 weights, 4 biases
        b.maxpool(2, 2);
        b.conv(3, 1, 1, true, true); // 4*3*1 = 12 weights, 3 biases
        b.finish().unwrap()
    }

    #[test]
    fn offsets_are_derived_from_the_network() {
        let net = net();
        let ws = WeightSet::new(vec![0; 84], vec![0; 7], &net).unwrap();
        assert_eq!(ws.conv_count(), 2);
        assert_eq!(ws.weight_offset(0), 0);
        assert_eq!(ws.weight_offset(1), 72);
        assert_eq!(ws.weight_slice(1).len(), 12);
        assert_eq!(ws.bias_offset(1), 4);
        assert_eq!(ws.bias_slice(1).len(), 3);
    }

    #[test]
    fn wrong_sized_blob_is_rejected() {
        let net = net();
        let err = WeightSet::new(vec![0; 83], vec![0; 7], &net).unwrap_err();
        match err {
            ModelError::BlobSizeMismatch {
                expected, actual, ..
            } => {
                assert_eq!(expected, 84);
                assert_eq!(actual, 83);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(WeightSet::new(vec![0; 84], vec![0; 8], &net).is_err());
    }
}
