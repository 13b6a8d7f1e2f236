//! End-to-end inference over the accelerator.
//!
//! The engine owns the arena plan, the weight blobs in DMA memory,
//! and the per-layer walk: convolutions and pools go to the core, the
//! reorg shuffle and non-aliasable routes run on the CPU, and the
//! region head is decoded from the final buffer. One engine instance
//! runs one network; `run` may be called repeatedly.

// Dimensions validated against chip limits before narrowing to registers
#![allow(clippy::cast_possible_truncation)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use yolo2_chip::{plan_conv, plan_maxpool, HwLayerType};
use yolo2_driver::{Accelerator, DmaBuffer, DmaMemory, LayerJob, QSet, RegisterBus};

use crate::cpu;
use crate::error::{ModelError, Result};
use crate::layout::{self, MemoryPlan};
use crate::network::{LayerKind, Network};
use crate::postprocess::{correct_region_boxes, finalize, nms_sort, FinalDetection};
use crate::quant::{apply_shift, dequantize, quantize, QTables, QuantizationTracker};
use crate::region::RegionDecoder;
use crate::weights::WeightSet;

/// Engine-level knobs, all explicit; nothing is read from the
/// environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Per-layer completion timeout.
    pub layer_timeout: Duration,
    /// Candidate threshold for the region decoder.
    pub detect_thresh: f32,
    /// IoU threshold for suppression.
    pub nms_thresh: f32,
    /// If set, every layer's output buffer is dumped here as
    /// `layer_NN.bin` for bring-up debugging. Dump failures are
    /// logged, not fatal.
    pub dump_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            layer_timeout: Duration::from_millis(5000),
            detect_thresh: 0.24,
            nms_thresh: 0.45,
            dump_dir: None,
        }
    }
}

/// A network bound to an accelerator and ready to run.
pub struct InferenceEngine<B: RegisterBus> {
    accel: Accelerator<B>,
    net: Network,
    plan: MemoryPlan,
    arena: Arc<dyn DmaBuffer>,
    weight_buf: Arc<dyn DmaBuffer>,
    bias_buf: Arc<dyn DmaBuffer>,
    weights: WeightSet,
    tables: QTables,
    decoder: RegionDecoder,
    config: EngineConfig,
}

impl<B: RegisterBus> InferenceEngine<B> {
    /// Plan the arena, stage the blobs into DMA memory, and wrap the
    /// bus.
    ///
    /// # Errors
    ///
    /// Fails if planning fails, DMA memory is exhausted, or the
    /// network has no region head matching `anchors`.
    pub fn new(
        bus: B,
        dma: &mut dyn DmaMemory,
        net: Network,
        weights: WeightSet,
        tables: QTables,
        anchors: &[(f32, f32)],
        config: EngineConfig,
    ) -> Result<Self> {
        let plan = layout::plan(&net)?;
        let decoder = RegionDecoder::for_network(&net, anchors, config.detect_thresh)?;

        let arena = dma.alloc(plan.arena_words)?;
        let weight_buf = dma.alloc(weights.weights().len())?;
        let bias_buf = dma.alloc(weights.biases().len())?;
        weight_buf.write_words(0, weights.weights())?;
        bias_buf.write_words(0, weights.biases())?;
        weight_buf.flush();
        bias_buf.flush();

        tracing::info!(
            arena_words = plan.arena_words,
            weight_words = weights.weights().len(),
            "Engine staged"
        );

        Ok(Self {
            accel: Accelerator::new(bus),
            net,
            plan,
            arena,
            weight_buf,
            bias_buf,
            weights,
            tables,
            decoder,
            config,
        })
    }

    /// Run one frame.
    ///
    /// `image` is the letterboxed network input in channel-major
    /// planes (`input_c` planes of `input_h × input_w`, no row
    /// padding). `img_w`/`img_h` are the original frame dimensions
    /// used to undo the letterbox on the way out.
    ///
    /// # Errors
    ///
    /// Fails on a wrongly-sized input, any accelerator fault, or a
    /// quantization bookkeeping hole.
    pub fn run(
        &mut self,
        image: &[f32],
        img_w: usize,
        img_h: usize,
    ) -> Result<Vec<FinalDetection>> {
        let (w, h, c) = (
            self.net.input_w(),
            self.net.input_h(),
            self.net.input_c(),
        );
        if image.len() != w * h * c {
            return Err(ModelError::invalid_input(format!(
                "input has {} values, network wants {w}x{h}x{c}",
                image.len()
            )));
        }

        let mut tracker =
            QuantizationTracker::new(self.tables.clone(), self.net.layers().len());

        // Stage the quantized input at the top of the arena.
        let quantized = quantize(image, tracker.input_q());
        let padded = cpu::pad_rows(&quantized, w, h * c);
        self.arena.write_words(self.plan.input_offset, &padded)?;
        self.arena.flush();

        let mut detections = Vec::new();
        let layers: Vec<_> = self.net.layers().to_vec();
        for (i, layer) in layers.iter().enumerate() {
            let producer = layer.inputs.first().copied();
            let place = self.plan.placements[i].clone();
            tracing::debug!(layer = i, kind = ?layer.kind, "Running layer");

            match &layer.kind {
                LayerKind::Conv {
                    filters,
                    size,
                    stride,
                    pad,
                    batch_norm,
                    leaky,
                } => {
                    let k = tracker.conv_index();
                    let q = tracker.conv(i, producer)?;
                    let job = LayerJob {
                        kind: HwLayerType::Conv,
                        input_addr: self.word_addr(place.input_offsets[0]),
                        output_addr: self.word_addr(place.output_offset),
                        weight_addr: self.weight_buf.phys_addr()
                            + (self.weights.weight_offset(k) * 2) as u64,
                        beta_addr: self.bias_buf.phys_addr()
                            + (self.weights.bias_offset(k) * 2) as u64,
                        ifm_num: layer.in_c as u32,
                        ofm_num: *filters as u32,
                        ksize: *size as u32,
                        kstride: *stride as u32,
                        input_w: layer.in_w as u32,
                        input_h: layer.in_h as u32,
                        output_w: layer.out_w as u32,
                        output_h: layer.out_h as u32,
                        padding: *pad as u32,
                        is_nl: *leaky,
                        is_bn: *batch_norm,
                        tiles: plan_conv(
                            layer.in_c as u32,
                            *filters as u32,
                            layer.out_w as u32,
                            layer.out_h as u32,
                            *size as u32,
                            *stride as u32,
                        ),
                        q: q.regs,
                    };
                    self.accel.run_layer(&job, self.config.layer_timeout)?;
                }
                LayerKind::Maxpool { size, stride } => {
                    tracker.passthrough(i, producer)?;
                    let job = LayerJob {
                        kind: HwLayerType::Maxpool,
                        input_addr: self.word_addr(place.input_offsets[0]),
                        output_addr: self.word_addr(place.output_offset),
                        weight_addr: 0,
                        beta_addr: 0,
                        ifm_num: layer.in_c as u32,
                        ofm_num: layer.out_c as u32,
                        ksize: *size as u32,
                        kstride: *stride as u32,
                        input_w: layer.in_w as u32,
                        input_h: layer.in_h as u32,
                        output_w: layer.out_w as u32,
                        output_h: layer.out_h as u32,
                        padding: 0,
                        is_nl: false,
                        is_bn: false,
                        tiles: plan_maxpool(
                            layer.in_c as u32,
                            layer.out_w as u32,
                            layer.out_h as u32,
                            *size as u32,
                            *stride as u32,
                        ),
                        q: QSet {
                            qw: 0,
                            qa_in: 0,
                            qa_out: 0,
                            qb: 0,
                        },
                    };
                    self.accel.run_layer(&job, self.config.layer_timeout)?;
                }
                LayerKind::Reorg { stride } => {
                    self.run_reorg(i, layer, &place, *stride, &mut tracker)?;
                }
                LayerKind::Route => {
                    tracker.route(i, &layer.inputs)?;
                    if place.copy_route {
                        self.copy_route(&layer.inputs, place.output_offset)?;
                    }
                }
                LayerKind::Region { .. } => {
                    tracker.passthrough(i, producer)?;
                    let q = tracker.q_of(i)?;
                    detections = self.decode_head(layer, &place, q, img_w, img_h)?;
                }
            }

            // Dumps are a debugging aid; a failed write never aborts
            // the run.
            if let Some(dir) = &self.config.dump_dir {
                if let Err(e) = self.dump_layer(dir, i, layer.out_words(), place.output_offset) {
                    tracing::warn!(layer = i, error = %e, "Layer dump failed");
                }
            }
        }
        Ok(detections)
    }

    fn word_addr(&self, offset: usize) -> u64 {
        self.arena.phys_addr() + (offset * 2) as u64
    }

    /// Pull the producer's buffer out of DMA, shuffle, re-scale to the
    /// merge target, and write the result back as the reorg output.
    fn run_reorg(
        &mut self,
        i: usize,
        layer: &crate::network::Layer,
        place: &layout::Placement,
        stride: usize,
        tracker: &mut QuantizationTracker,
    ) -> Result<()> {
        let producer = layer.inputs[0];
        self.arena.invalidate();
        let mut padded = vec![0i16; layer.in_words()];
        self.arena.read_words(place.input_offsets[0], &mut padded)?;
        let flat = cpu::strip_row_padding(&padded, layer.in_w, layer.in_h * layer.in_c);

        let mut shuffled = cpu::reorg(
            &flat,
            layer.in_w,
            layer.in_h * layer.in_c / (stride * stride),
            stride * stride,
            stride,
        );

        // Bring the buffer to the Q the consuming route merges at.
        let consumers = self.net.consumers();
        let companions: Vec<usize> = consumers[i]
            .iter()
            .filter(|&&c| matches!(self.net.layers()[c].kind, LayerKind::Route))
            .flat_map(|&c| self.net.layers()[c].inputs.clone())
            .filter(|&s| s != i)
            .collect();
        let shift = tracker.align_for_merge(i, producer, &companions)?;
        if shift != 0 {
            tracing::debug!(layer = i, shift, "Aligning reorg output for merge");
            apply_shift(&mut shuffled, shift);
        }

        let out = cpu::pad_rows(&shuffled, layer.out_w, layer.out_h * layer.out_c);
        self.arena.write_words(place.output_offset, &out)?;
        self.arena.flush();
        Ok(())
    }

    /// Concatenate route sources that could not be aliased.
    fn copy_route(&mut self, sources: &[usize], output_offset: usize) -> Result<()> {
        self.arena.invalidate();
        let mut blocks = Vec::with_capacity(sources.len());
        for &p in sources {
            let src = &self.net.layers()[p];
            let mut buf = vec![0i16; src.out_words()];
            self.arena
                .read_words(self.plan.placements[p].output_offset, &mut buf)?;
            blocks.push(buf);
        }
        let joined = cpu::route_concat(&blocks);
        self.arena.write_words(output_offset, &joined)?;
        self.arena.flush();
        Ok(())
    }

    fn decode_head(
        &self,
        layer: &crate::network::Layer,
        place: &layout::Placement,
        q: i32,
        img_w: usize,
        img_h: usize,
    ) -> Result<Vec<FinalDetection>> {
        self.arena.invalidate();
        let mut padded = vec![0i16; layer.in_words()];
        self.arena.read_words(place.input_offsets[0], &mut padded)?;
        let flat = cpu::strip_row_padding(&padded, layer.in_w, layer.in_h * layer.in_c);
        let feat: Vec<f32> = flat.iter().map(|&v| dequantize(v, q)).collect();

        let mut dets = self.decoder.decode(&feat);
        nms_sort(&mut dets, self.config.nms_thresh);
        correct_region_boxes(&mut dets, img_w, img_h, self.net.input_w(), self.net.input_h());
        Ok(finalize(&dets, self.config.detect_thresh))
    }

    fn dump_layer(&self, dir: &std::path::Path, i: usize, words: usize, offset: usize) -> Result<()> {
        self.arena.invalidate();
        let mut buf = vec![0i16; words];
        self.arena.read_words(offset, &mut buf)?;
        let mut raw = Vec::with_capacity(words * 2);
        for v in &buf {
            raw.extend_from_slice(&v.to_le_bytes());
        }
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(format!("layer_{i:02}.bin")), raw)?;
        Ok(())
    }

    /// Layers run on the accelerator so far.
    #[must_use]
    pub const fn hw_layers_run(&self) -> u64 {
        self.accel.layers_run()
    }

    /// The arena plan in use.
    #[must_use]
    pub const fn plan(&self) -> &MemoryPlan {
        &self.plan
    }
}
