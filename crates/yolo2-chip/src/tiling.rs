//! Tile-parameter planning.
//!
//! The core processes a layer as a grid of tiles held in on-chip BRAM.
//! The host picks per-layer tile sizes that fit both the synthesized
//! capacities ([`crate::limits`]) and the layer geometry, and derives
//! the three loop-bound scalars the core iterates with. Those scalars
//! are raw iteration counts, not hints: a wrong bound makes the core
//! read or write out of bounds.

use crate::limits;

/// Planned tile sizes and loop bounds for one hardware layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileParams {
    /// Output-channel tile.
    pub tm: u32,
    /// Input-channel tile.
    pub tn: u32,
    /// Row tile.
    pub tr: u32,
    /// Column tile.
    pub tc: u32,
    /// Output-channel tile count: `ceil(out_c / tm)`.
    pub m_loops: u32,
    /// Value for the `OFM_NUM_BOUND` register.
    pub ofm_num_bound: u32,
    /// Value for the `MLOOPS_X_TM` register.
    pub mloops_x_tm: u32,
    /// Value for the `MLOOPS_A1_X_TM` register.
    pub mloops_a1_x_tm: u32,
}

/// Largest row tile whose input window fits the on-chip buffer.
fn tr_fit(k: u32, s: u32, out_h: u32) -> u32 {
    ((limits::ONCHIP_IB_HEIGHT - k) / s + 1)
        .min(limits::TR_MAX)
        .min(out_h)
}

/// Largest column tile whose input window fits the on-chip buffer.
fn tc_fit(k: u32, s: u32, out_w: u32) -> u32 {
    ((limits::ONCHIP_IB_WIDTH - k) / s + 1)
        .min(limits::TC_MAX)
        .min(out_w)
}

/// Plan tiles for a convolution layer.
///
/// The core's output-channel loop runs to `(m_loops + 1) * tm`: the
/// extra iteration past the last productive tile drains the pipelined
/// write-back. Load and compute gate on `m != m_loops * tm`, so every
/// tile up to `m_loops * tm` is processed and the final pass only
/// flushes.
#[must_use]
pub fn plan_conv(in_c: u32, out_c: u32, out_w: u32, out_h: u32, k: u32, s: u32) -> TileParams {
    let tm = limits::TM_MAX.min(out_c);
    let tn = limits::TN_MAX.min(in_c);
    let tr = tr_fit(k, s, out_h);
    let tc = tc_fit(k, s, out_w);
    let m_loops = out_c.div_ceil(tm);
    TileParams {
        tm,
        tn,
        tr,
        tc,
        m_loops,
        ofm_num_bound: (m_loops + 1) * tm,
        mloops_x_tm: m_loops * tm,
        mloops_a1_x_tm: (m_loops + 1) * tm,
    }
}

/// Plan tiles for a max-pooling layer.
///
/// Pooling streams channels through the input buffer, so the channel
/// tile is bounded by `min(TM_MAX, TN_MAX)`. The loop bounds differ
/// from convolution: pooling is pipelined one stage deeper, so the
/// outer loop runs to `(m_loops + 2) * tm` and compute gates on both
/// `m != 0` and `m != (m_loops + 1) * tm`.
#[must_use]
pub fn plan_maxpool(channels: u32, out_w: u32, out_h: u32, k: u32, s: u32) -> TileParams {
    let tm = limits::TM_MAX.min(limits::TN_MAX).min(channels);
    let tr = tr_fit(k, s, out_h);
    let tc = tc_fit(k, s, out_w);
    let m_loops = channels.div_ceil(tm);
    TileParams {
        tm,
        tn: tm,
        tr,
        tc,
        m_loops,
        ofm_num_bound: (m_loops + 2) * tm,
        mloops_x_tm: m_loops * tm,
        mloops_a1_x_tm: (m_loops + 1) * tm,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv_3x3_full_tiles() {
        // Layer 0 of the COCO network: 3 -> 32 channels, 416x416 out.
        let p = plan_conv(3, 32, 416, 416, 3, 1);
        assert_eq!(p.tm, 32);
        assert_eq!(p.tn, 3);
        assert_eq!(p.tr, 26);
        assert_eq!(p.tc, 32);
        assert_eq!(p.m_loops, 1);
        assert_eq!(p.ofm_num_bound, 2 * 32);
        assert_eq!(p.mloops_x_tm, 32);
        assert_eq!(p.mloops_a1_x_tm, 2 * 32);
    }

    #[test]
    fn conv_partial_last_tile() {
        // 425 output channels does not divide by 32.
        let p = plan_conv(1024, 425, 13, 13, 1, 1);
        assert_eq!(p.tm, 32);
        assert_eq!(p.m_loops, 14);
        assert_eq!(p.ofm_num_bound, 15 * 32);
        assert_eq!(p.mloops_x_tm, 14 * 32);
        assert_eq!(p.mloops_a1_x_tm, 15 * 32);
        // Row/column tiles clamp to the output size.
        assert_eq!(p.tr, 13);
        assert_eq!(p.tc, 13);
    }

    #[test]
    fn conv_1x1_tile_height_uses_kernel() {
        let p = plan_conv(512, 256, 26, 26, 1, 1);
        // (53 - 1) / 1 + 1 = 53, clamped to TR_MAX then out_h.
        assert_eq!(p.tr, 26);
        assert_eq!(p.tc, 26);
    }

    #[test]
    fn maxpool_channel_tile_is_narrow() {
        let p = plan_maxpool(32, 208, 208, 2, 2);
        assert_eq!(p.tm, 4);
        assert_eq!(p.tn, 4);
        assert_eq!(p.m_loops, 8);
        assert_eq!(p.ofm_num_bound, 10 * 4);
        assert_eq!(p.mloops_x_tm, 8 * 4);
        assert_eq!(p.mloops_a1_x_tm, 9 * 4);
        // (53 - 2) / 2 + 1 = 26 rows per tile.
        assert_eq!(p.tr, 26);
    }

    #[test]
    fn stride_1_pool_fits_buffer() {
        // The stride-1 pool on the 13x13 grid.
        let p = plan_maxpool(512, 13, 13, 2, 1);
        assert_eq!(p.tr, 13);
        assert_eq!(p.tc, 13);
    }
}
