//! YOLOv2 network description and inference engine for the FPGA
//! convolution accelerator.
//!
//! The accelerator runs one convolution or pooling layer per
//! invocation; everything that makes those invocations add up to a
//! detection network lives here:
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`network`] | layer graph with explicit dataflow edges |
//! | [`zoo`] | built-in YOLOv2 COCO description and anchors |
//! | [`layout`] | feature-map placement in the shared DMA arena |
//! | [`quant`] | fixed-point tables and Q propagation |
//! | [`weights`] | blob slicing with offsets derived from the graph |
//! | [`loading`] | blob file IO |
//! | [`cpu`] | host-side reorg and route fallbacks |
//! | [`region`] | detection head decoding |
//! | [`postprocess`] | NMS and letterbox correction |
//! | [`inference`] | the per-layer walk tying it all together |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod cpu;
mod error;
pub mod inference;
pub mod layout;
pub mod loading;
pub mod network;
pub mod postprocess;
pub mod quant;
pub mod region;
pub mod weights;
pub mod zoo;

pub use error::{ModelError, Result};
pub use inference::{EngineConfig, InferenceEngine};
pub use layout::{MemoryPlan, Placement};
pub use network::{Layer, LayerKind, Network, NetworkBuilder};
pub use postprocess::FinalDetection;
pub use quant::{QTables, QuantizationTracker};
pub use region::{BBox, Detection, RegionDecoder};
pub use weights::WeightSet;

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        EngineConfig, FinalDetection, InferenceEngine, ModelError, Network, NetworkBuilder,
        QTables, Result, WeightSet,
    };
    pub use crate::zoo::{yolov2_coco, COCO_CLASSES, YOLOV2_ANCHORS};
}
