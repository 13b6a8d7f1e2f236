//! Register-level driver for the YOLO2_FPGA convolution accelerator.
//!
//! The core runs one layer at a time: the host programs every argument
//! through an AXI-Lite window, pulses START, and polls until the layer
//! completes. This crate owns that protocol and the DMA memory the
//! core reads and writes.
//!
//! # Layers of the stack
//!
//! ```text
//! Accelerator<B>        — validate, program, start, poll ([`accel`])
//!   RegisterBus         — transport seam ([`mmio`])
//!     DevMem            — /dev/mem mappings on the Zynq target
//!     SimBus            — register-faithful software model ([`sim`])
//!   DmaMemory           — allocation seam ([`dma`])
//!     UdmabufPool       — u-dma-buf regions on the target
//!     SimPool           — software DDR shared with SimBus
//! ```
//!
//! Network topology, memory planning, and quantization bookkeeping live
//! one level up in `yolo2-models`; this crate knows nothing about
//! YOLOv2 itself.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

pub mod accel;
pub mod dma;
mod error;
pub mod mmio;
pub mod sim;

pub use accel::{Accelerator, LayerJob, QSet};
pub use dma::{DmaBuffer, DmaMemory, SimPool, UdmabufPool};
pub use error::{AccelError, Result};
pub use mmio::{DevMem, QPort, RegisterBus};
pub use sim::SimBus;
