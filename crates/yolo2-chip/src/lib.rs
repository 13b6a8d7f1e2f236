//! Silicon model for the YOLOv2 HLS convolution accelerator.
//!
//! This crate has **no dependencies** and **no hardware access** — it is a
//! pure model of the IP core as synthesized for the Zynq UltraScale+ fabric:
//! the AXI-Lite control register map, the ap_ctrl handshake bits, the AXI
//! GPIO side channel carrying per-layer Q shift values, fixed on-chip buffer
//! capacities, and the tile-parameter derivation the core's loop bounds
//! expect.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`regs`] | CTRL_BUS register offsets, ap_ctrl bits, GPIO bases |
//! | [`limits`] | On-chip buffer capacities and hard parameter limits |
//! | [`tiling`] | Per-layer tile parameters and raw loop-bound scalars |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod limits;
pub mod regs;
pub mod tiling;

pub use tiling::{plan_conv, plan_maxpool, TileParams};

/// Layer-type discriminator written to [`regs::LAYER_TYPE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HwLayerType {
    /// Convolution (optionally batch-normalized / leaky).
    Conv = 0,
    /// 2-D max pooling.
    Maxpool = 1,
}

/// Pad a feature-map row width up to the core's burst granularity.
///
/// The accelerator's AXI masters move 256-bit (8 × int16) bursts; every
/// per-channel row in DDR is laid out with its stride rounded up to the next
/// multiple of 8 elements. Host-side buffer arithmetic must use the same
/// stride or the core reads misaligned columns.
#[must_use]
pub const fn align_row_8(w: usize) -> usize {
    (w + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_alignment_rounds_up_to_burst() {
        assert_eq!(align_row_8(8), 8);
        assert_eq!(align_row_8(13), 16);
        assert_eq!(align_row_8(26), 32);
        assert_eq!(align_row_8(416), 416);
    }
}
