//! CTRL_BUS register map for the YOLO2_FPGA IP core.
//!
//! The core is controlled through a single AXI-Lite window. Offsets follow
//! the Vitis HLS `s_axilite` layout: 64-bit pointer arguments occupy two
//! consecutive 32-bit registers (lo then hi), scalar arguments are spaced
//! 8 bytes apart with a reserved word between them.
//!
//! The four Q shift values (weight, input activation, output activation,
//! bias) are **not** part of CTRL_BUS — the IP samples them from dedicated
//! AXI GPIO blocks, one 32-bit data word each, at the [`gpio`] base
//! addresses.

/// Physical base address of the CTRL_BUS window.
pub const CTRL_BASE: u64 = 0xA000_0000;
/// Size of the CTRL_BUS window in bytes.
pub const CTRL_SIZE: usize = 0x1000;

/// ap_ctrl handshake register. START is write-one; DONE and READY are
/// **clear-on-read**.
pub const AP_CTRL: usize = 0x00;
/// Global interrupt enable (unused, polling mode).
pub const GIE: usize = 0x04;
/// IP interrupt enable (unused, polling mode).
pub const IER: usize = 0x08;
/// IP interrupt status (unused, polling mode).
pub const ISR: usize = 0x0C;

/// Input feature-map base address, low 32 bits.
pub const INPUT_ADDR_LO: usize = 0x10;
/// Input feature-map base address, high 32 bits.
pub const INPUT_ADDR_HI: usize = 0x14;
/// Output feature-map base address, low 32 bits.
pub const OUTPUT_ADDR_LO: usize = 0x1C;
/// Output feature-map base address, high 32 bits.
pub const OUTPUT_ADDR_HI: usize = 0x20;
/// Weight base address, low 32 bits.
pub const WEIGHT_ADDR_LO: usize = 0x28;
/// Weight base address, high 32 bits.
pub const WEIGHT_ADDR_HI: usize = 0x2C;
/// Bias (beta) base address, low 32 bits.
pub const BETA_ADDR_LO: usize = 0x34;
/// Bias (beta) base address, high 32 bits.
pub const BETA_ADDR_HI: usize = 0x38;

/// Input channel count (IFM_num).
pub const IFM_NUM: usize = 0x40;
/// Output channel count (OFM_num).
pub const OFM_NUM: usize = 0x48;
/// Kernel size.
pub const KSIZE: usize = 0x50;
/// Kernel stride.
pub const KSTRIDE: usize = 0x58;
/// Input feature-map width.
pub const INPUT_W: usize = 0x60;
/// Input feature-map height.
pub const INPUT_H: usize = 0x68;
/// Output feature-map width.
pub const OUTPUT_W: usize = 0x70;
/// Output feature-map height.
pub const OUTPUT_H: usize = 0x78;
/// Spatial padding.
pub const PADDING: usize = 0x80;
/// Leaky-ReLU enable (IsNL).
pub const IS_NL: usize = 0x88;
/// Batch-norm enable (IsBN).
pub const IS_BN: usize = 0x90;
/// Output-channel tile (TM).
pub const TM: usize = 0x98;
/// Input-channel tile (TN).
pub const TN: usize = 0xA0;
/// Row tile (TR).
pub const TR: usize = 0xA8;
/// Column tile (TC).
pub const TC: usize = 0xB0;
/// Output-channel loop bound; the core iterates to this literal value.
pub const OFM_NUM_BOUND: usize = 0xB8;
/// `mLoops * TM` — raw iteration count, not a hint.
pub const MLOOPS_X_TM: usize = 0xC0;
/// `(mLoops + 1) * TM` — raw iteration count, not a hint.
pub const MLOOPS_A1_X_TM: usize = 0xC8;
/// Layer-type discriminator (see [`crate::HwLayerType`]).
pub const LAYER_TYPE: usize = 0xD0;

/// ap_ctrl bit definitions.
pub mod ap_ctrl {
    /// Start the core (self-clears on handshake).
    pub const START: u32 = 1 << 0;
    /// Operation complete. Clear-on-read.
    pub const DONE: u32 = 1 << 1;
    /// Core is idle.
    pub const IDLE: u32 = 1 << 2;
    /// Core can accept new arguments. Clear-on-read.
    pub const READY: u32 = 1 << 3;
}

/// AXI GPIO blocks carrying the four Q shift values.
pub mod gpio {
    /// Weight Q shift (Qw) GPIO base.
    pub const QW_BASE: u64 = 0xA001_0000;
    /// Input activation Q shift (Qa_in) GPIO base.
    pub const QA_IN_BASE: u64 = 0xA002_0000;
    /// Output activation Q shift (Qa_out) GPIO base.
    pub const QA_OUT_BASE: u64 = 0xA003_0000;
    /// Bias Q shift (Qb) GPIO base.
    pub const QB_BASE: u64 = 0xA004_0000;
    /// Size of each GPIO window in bytes.
    pub const SIZE: usize = 0x1000;
    /// Offset of the GPIO data word within its window.
    pub const DATA: usize = 0x0;
}
