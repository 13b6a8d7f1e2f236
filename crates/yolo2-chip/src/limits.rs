//! Synthesis-time capacities of the accelerator.
//!
//! These mirror the constants the RTL was built with. Exceeding any of
//! them does not fail gracefully in hardware — the core reads out of
//! bounds on its on-chip BRAMs — so the driver validates every job
//! against this module before touching a register.

/// Maximum output-channel tile the core was synthesized for.
pub const TM_MAX: u32 = 32;
/// Maximum input-channel tile.
pub const TN_MAX: u32 = 4;
/// Maximum row tile.
pub const TR_MAX: u32 = 26;
/// Maximum column tile.
pub const TC_MAX: u32 = 32;
/// Maximum kernel size.
pub const K_MAX: u32 = 3;
/// Maximum kernel stride.
pub const S_MAX: u32 = 2;

/// On-chip input-buffer height: `(TR_MAX - 1) * S_MAX + K_MAX`.
pub const ONCHIP_IB_HEIGHT: u32 = (TR_MAX - 1) * S_MAX + K_MAX;
/// On-chip input-buffer width: `(TC_MAX - 1) * S_MAX + K_MAX`.
pub const ONCHIP_IB_WIDTH: u32 = (TC_MAX - 1) * S_MAX + K_MAX;

/// Maximum channel count in either direction.
pub const CHANNELS_MAX: u32 = 2048;
/// Maximum feature-map width or height.
pub const DIM_MAX: u32 = 1024;
/// Maximum spatial padding.
pub const PADDING_MAX: u32 = 4;
/// Depth of the on-chip bias buffer, in elements.
pub const MAX_BETA_LENGTH: u32 = 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn onchip_buffer_covers_max_tile() {
        assert_eq!(ONCHIP_IB_HEIGHT, 53);
        assert_eq!(ONCHIP_IB_WIDTH, 65);
    }
}
