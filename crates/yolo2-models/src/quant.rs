//! Fixed-point bookkeeping across the network.
//!
//! Every buffer is `i16` with a per-layer number of fractional bits
//! (its Q value). The accelerator is told four Q values per layer and
//! produces outputs at the Q the activation table dictates; the host's
//! only job is to know which Q each buffer is at, and to re-scale the
//! one place two buffers with different Q values meet: the reorg
//! output merging with a backbone band in a route.
//!
//! Q values propagate along the dataflow edges. A convolution consumes
//! its producer's Q and emits the next activation-table entry; pooling
//! and routes pass Q through unchanged. Missing or short tables are an
//! error at load time — a defaulted Q would silently scale a third of
//! the network's activations.

// Saturating fixed-point conversions clamp before narrowing
#![allow(clippy::cast_possible_truncation)]

use crate::error::{ModelError, Result};
use crate::network::Network;
use yolo2_driver::QSet;

/// Largest representable Q value; the GPIO ports carry 4 bits.
pub const Q_MAX: i32 = 15;

/// Per-network quantization tables, one entry per convolution (plus
/// one leading activation entry for the network input).
#[derive(Debug, Clone)]
pub struct QTables {
    weight_q: Vec<i32>,
    bias_q: Vec<i32>,
    act_q: Vec<i32>,
}

impl QTables {
    /// Validate raw tables against a network.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::QTableInvalid`] if any table is shorter
    /// than the network's convolution count or holds out-of-range
    /// values.
    pub fn new(weight_q: Vec<i32>, bias_q: Vec<i32>, act_q: Vec<i32>, net: &Network) -> Result<Self> {
        let convs = net.conv_count();
        if weight_q.len() != convs {
            return Err(ModelError::q_table(format!(
                "weight table has {} entries, network has {convs} convolutions",
                weight_q.len()
            )));
        }
        if bias_q.len() != convs {
            return Err(ModelError::q_table(format!(
                "bias table has {} entries, network has {convs} convolutions",
                bias_q.len()
            )));
        }
        if act_q.len() < convs + 1 {
            return Err(ModelError::q_table(format!(
                "activation table has {} entries, need {}",
                act_q.len(),
                convs + 1
            )));
        }
        for (name, table) in [("weight", &weight_q), ("bias", &bias_q), ("activation", &act_q)] {
            if let Some(&bad) = table.iter().find(|&&q| !(0..=Q_MAX).contains(&q)) {
                return Err(ModelError::q_table(format!(
                    "{name} table holds {bad}, outside 0..={Q_MAX}"
                )));
            }
        }
        Ok(Self {
            weight_q,
            bias_q,
            act_q,
        })
    }

    /// Q of the network input buffer.
    #[must_use]
    pub fn input_q(&self) -> i32 {
        self.act_q[0]
    }
}

/// Re-scale a buffer by `shift` fractional bits in place.
///
/// Positive shifts drop precision and round to nearest; negative
/// shifts gain headroom and saturate.
pub fn apply_shift(data: &mut [i16], shift: i32) {
    if shift == 0 {
        return;
    }
    if shift > 0 {
        let round = 1i32 << (shift - 1);
        for v in data {
            let x = (i32::from(*v) + round) >> shift;
            *v = x.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
        }
    } else {
        let shift = u32::try_from(-shift).unwrap_or(15);
        for v in data {
            let x = i32::from(*v) << shift;
            *v = x.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
        }
    }
}

/// Quantize a float buffer to `i16` at `q` fractional bits.
#[must_use]
pub fn quantize(data: &[f32], q: i32) -> Vec<i16> {
    let scale = (2f32).powi(q);
    data.iter()
        .map(|&x| {
            (x * scale)
                .round()
                .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
        })
        .collect()
}

/// Dequantize one value from `q` fractional bits.
#[must_use]
pub fn dequantize(v: i16, q: i32) -> f32 {
    f32::from(v) / (2f32).powi(q)
}

/// Per-layer Q shifts for one convolution invocation.
#[derive(Debug, Clone, Copy)]
pub struct ConvQ {
    /// Register values handed to the driver.
    pub regs: QSet,
    /// Q of the output buffer.
    pub out_q: i32,
}

/// Tracks the Q of every buffer as layers execute.
#[derive(Debug)]
pub struct QuantizationTracker {
    tables: QTables,
    conv_idx: usize,
    out_q: Vec<Option<i32>>,
}

impl QuantizationTracker {
    /// Start tracking a run of `layer_count` layers.
    #[must_use]
    pub fn new(tables: QTables, layer_count: usize) -> Self {
        Self {
            tables,
            conv_idx: 0,
            out_q: vec![None; layer_count],
        }
    }

    /// Q of the quantized input image.
    #[must_use]
    pub fn input_q(&self) -> i32 {
        self.tables.input_q()
    }

    /// Index of the next convolution to be accounted.
    #[must_use]
    pub const fn conv_index(&self) -> usize {
        self.conv_idx
    }

    /// Q of a finished layer's output buffer.
    ///
    /// # Errors
    ///
    /// Fails if the layer has not executed yet.
    pub fn q_of(&self, layer: usize) -> Result<i32> {
        self.out_q
            .get(layer)
            .copied()
            .flatten()
            .ok_or_else(|| ModelError::q_table(format!("layer {layer} has no recorded Q yet")))
    }

    fn producer_q(&self, producer: Option<usize>) -> Result<i32> {
        match producer {
            None => Ok(self.tables.input_q()),
            Some(p) => self.q_of(p),
        }
    }

    /// Account for the next convolution; returns its register values.
    ///
    /// # Errors
    ///
    /// Fails if more convolutions run than the tables cover, or the
    /// producer has no recorded Q.
    #[allow(clippy::cast_sign_loss)]
    pub fn conv(&mut self, layer: usize, producer: Option<usize>) -> Result<ConvQ> {
        let k = self.conv_idx;
        if k >= self.tables.weight_q.len() {
            return Err(ModelError::q_table(format!(
                "convolution {k} has no table entry"
            )));
        }
        let qa_in = self.producer_q(producer)?;
        let qa_out = self.tables.act_q[k + 1];
        let q = ConvQ {
            regs: QSet {
                qw: self.tables.weight_q[k] as u32,
                qa_in: qa_in as u32,
                qa_out: qa_out as u32,
                qb: self.tables.bias_q[k] as u32,
            },
            out_q: qa_out,
        };
        self.conv_idx += 1;
        self.out_q[layer] = Some(qa_out);
        Ok(q)
    }

    /// Account for a layer that leaves values unscaled (pooling, the
    /// region head reading in place).
    ///
    /// # Errors
    ///
    /// Fails if the producer has no recorded Q.
    pub fn passthrough(&mut self, layer: usize, producer: Option<usize>) -> Result<()> {
        self.out_q[layer] = Some(self.producer_q(producer)?);
        Ok(())
    }

    /// Account for a route. All sources should already agree on Q;
    /// the recorded Q is the minimum, and disagreement is logged.
    ///
    /// # Errors
    ///
    /// Fails if any source has no recorded Q.
    pub fn route(&mut self, layer: usize, sources: &[usize]) -> Result<()> {
        let mut q = i32::MAX;
        for &s in sources {
            q = q.min(self.q_of(s)?);
        }
        for &s in sources {
            let sq = self.q_of(s)?;
            if sq != q {
                tracing::warn!(
                    layer,
                    source = s,
                    source_q = sq,
                    route_q = q,
                    "route sources disagree on Q; values from this source are mis-scaled"
                );
            }
        }
        self.out_q[layer] = Some(q);
        Ok(())
    }

    /// Plan the re-scale of a reorg output that a route will merge
    /// with already-written bands.
    ///
    /// The target is the minimum of this buffer's Q and every merge
    /// companion's Q; the returned shift (current − target, never
    /// negative against the companions) is applied to the reorg buffer
    /// before it is written back.
    ///
    /// # Errors
    ///
    /// Fails if the producer or a companion has no recorded Q.
    pub fn align_for_merge(
        &mut self,
        layer: usize,
        producer: usize,
        companions: &[usize],
    ) -> Result<i32> {
        let current = self.q_of(producer)?;
        let mut target = current;
        for &c in companions {
            target = target.min(self.q_of(c)?);
        }
        self.out_q[layer] = Some(target);
        Ok(current - target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkBuilder;

    fn small_net() -> Network {
        let mut b = NetworkBuilder::new(8, 8, 2);
        b.conv(4, 1, 1, true, true);
        b.maxpool(2, 2);
        b.conv(4, 1, 1, true, true);
        b.finish().unwrap()
    }

    #[test]
    fn short_tables_are_fatal() {
        let net = small_net();
        assert!(QTables::new(vec![10], vec![10, 10], vec![7, 7, 7], &net).is_err());
        assert!(QTables::new(vec![10, 10], vec![10, 10], vec![7, 7], &net).is_err());
        assert!(QTables::new(vec![10, 16], vec![10, 10], vec![7, 7, 7], &net).is_err());
        assert!(QTables::new(vec![10, 10], vec![10, 10], vec![7, 7, 7], &net).is_ok());
    }

    #[test]
    fn q_flows_along_edges() {
        let net = small_net();
        let tables =
            QTables::new(vec![12, 11], vec![12, 11], vec![7, 6, 5], &net).unwrap();
        let mut t = QuantizationTracker::new(tables, 3);
        let q0 = t.conv(0, None).unwrap();
        assert_eq!(q0.regs.qa_in, 7);
        assert_eq!(q0.out_q, 6);
        t.passthrough(1, Some(0)).unwrap();
        let q2 = t.conv(2, Some(1)).unwrap();
        // The pool passed layer 0's Q through.
        assert_eq!(q2.regs.qa_in, 6);
        assert_eq!(q2.regs.qw, 11);
        assert_eq!(q2.out_q, 5);
    }

    #[test]
    fn shift_rounds_to_nearest() {
        let mut data = [5i16, -5, 7, -7, 32760];
        apply_shift(&mut data, 1);
        // (x + 1) >> 1.
        assert_eq!(data, [3, -2, 4, -3, 16380]);
    }

    #[test]
    fn negative_shift_saturates() {
        let mut data = [20000i16, -20000, 3];
        apply_shift(&mut data, -2);
        assert_eq!(data, [i16::MAX, i16::MIN, 12]);
    }

    #[test]
    fn merge_alignment_preserves_value() {
        // A value at Q=9 shifted to a companion's Q=6 dequantizes to
        // (nearly) the same real number.
        let net = small_net();
        let tables = QTables::new(vec![12, 11], vec![12, 11], vec![7, 9, 5], &net).unwrap();
        let mut t = QuantizationTracker::new(tables, 4);
        t.conv(0, None).unwrap(); // out at Q=9
        t.out_q[2] = Some(6); // companion band
        let shift = t.align_for_merge(3, 0, &[2]).unwrap();
        assert_eq!(shift, 3);
        let mut buf = [512i16, -100];
        let before: Vec<f32> = buf.iter().map(|&v| dequantize(v, 9)).collect();
        apply_shift(&mut buf, shift);
        let after: Vec<f32> = buf.iter().map(|&v| dequantize(v, 6)).collect();
        for (b, a) in before.iter().zip(&after) {
            assert!((b - a).abs() <= 1.0 / 64.0, "{b} vs {a}");
        }
        assert_eq!(t.q_of(3).unwrap(), 6);
    }

    #[test]
    fn quantize_round_trips_within_half_a_step() {
        let q = 8;
        let values = [0.0f32, 0.5, -1.25, 3.14159, -20.0];
        let quantized = quantize(&values, q);
        for (&x, &v) in values.iter().zip(&quantized) {
            assert!((dequantize(v, q) - x).abs() <= 1.0 / 512.0);
        }
    }
}
