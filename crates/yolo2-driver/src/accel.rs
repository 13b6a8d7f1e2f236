//! Blocking control protocol for the YOLO2_FPGA core.
//!
//! The core is a classic HLS `ap_ctrl_hs` block: the host programs every
//! argument register, pulses START, and polls ap_ctrl until the layer
//! finishes. Two handshake quirks shape the protocol:
//!
//! - DONE and READY are **clear-on-read**. A status read consumes them,
//!   so every read result must be carried forward, never re-sampled.
//! - Short layers can finish inside the start-confirmation window, so
//!   "START no longer visible" is not an error by itself.
//!
//! Every register write is validated against [`yolo2_chip::limits`]
//! first. The core has no fault signalling; a bad parameter silently
//! corrupts on-chip memory.

use std::time::{Duration, Instant};

use yolo2_chip::regs::{self, ap_ctrl};
use yolo2_chip::{limits, HwLayerType, TileParams};

use crate::error::{AccelError, Result};
use crate::mmio::{QPort, RegisterBus};

/// The four Q shift values sampled by the core at layer start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QSet {
    /// Weight fractional bits (Qw).
    pub qw: u32,
    /// Input activation fractional bits (Qa_in).
    pub qa_in: u32,
    /// Output activation fractional bits (Qa_out).
    pub qa_out: u32,
    /// Bias fractional bits (Qb).
    pub qb: u32,
}

/// Fully-resolved description of one hardware layer invocation.
///
/// Addresses are physical; the caller resolves them from its DMA
/// allocations before building the job.
#[derive(Debug, Clone, Copy)]
pub struct LayerJob {
    /// Convolution or max-pooling.
    pub kind: HwLayerType,
    /// Input feature-map physical address.
    pub input_addr: u64,
    /// Output feature-map physical address.
    pub output_addr: u64,
    /// Weight blob physical address (ignored by pooling).
    pub weight_addr: u64,
    /// Bias blob physical address (ignored by pooling).
    pub beta_addr: u64,
    /// Input channel count.
    pub ifm_num: u32,
    /// Output channel count.
    pub ofm_num: u32,
    /// Kernel size.
    pub ksize: u32,
    /// Kernel stride.
    pub kstride: u32,
    /// Input width (unpadded elements per row).
    pub input_w: u32,
    /// Input height.
    pub input_h: u32,
    /// Output width.
    pub output_w: u32,
    /// Output height.
    pub output_h: u32,
    /// Spatial padding.
    pub padding: u32,
    /// Apply leaky ReLU on write-back.
    pub is_nl: bool,
    /// Fold batch-norm bias on write-back.
    pub is_bn: bool,
    /// Planned tile sizes and loop bounds.
    pub tiles: TileParams,
    /// Q shifts for this layer.
    pub q: QSet,
}

impl LayerJob {
    /// Check every parameter against the synthesized capacities.
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::InvalidParams`] naming the first violated
    /// limit. Nothing is written to hardware on failure.
    pub fn validate(&self) -> Result<()> {
        let check = |name: &str, value: u32, max: u32| -> Result<()> {
            if value == 0 || value > max {
                return Err(AccelError::invalid_params(format!(
                    "{name} = {value} outside 1..={max}"
                )));
            }
            Ok(())
        };
        check("IFM_num", self.ifm_num, limits::CHANNELS_MAX)?;
        check("OFM_num", self.ofm_num, limits::CHANNELS_MAX)?;
        check("ksize", self.ksize, limits::K_MAX)?;
        check("kstride", self.kstride, limits::S_MAX)?;
        check("input_w", self.input_w, limits::DIM_MAX)?;
        check("input_h", self.input_h, limits::DIM_MAX)?;
        check("output_w", self.output_w, limits::DIM_MAX)?;
        check("output_h", self.output_h, limits::DIM_MAX)?;
        if self.padding > limits::PADDING_MAX {
            return Err(AccelError::invalid_params(format!(
                "padding = {} exceeds {}",
                self.padding,
                limits::PADDING_MAX
            )));
        }
        let t = &self.tiles;
        check("TM", t.tm, limits::TM_MAX)?;
        check("TN", t.tn, limits::TN_MAX)?;
        check("TR", t.tr, limits::TR_MAX)?;
        check("TC", t.tc, limits::TC_MAX)?;
        // Input window of one tile must fit the on-chip buffer.
        let ib_h = (t.tr - 1) * self.kstride + self.ksize;
        let ib_w = (t.tc - 1) * self.kstride + self.ksize;
        if ib_h > limits::ONCHIP_IB_HEIGHT || ib_w > limits::ONCHIP_IB_WIDTH {
            return Err(AccelError::invalid_params(format!(
                "tile input window {ib_h}x{ib_w} exceeds on-chip buffer {}x{}",
                limits::ONCHIP_IB_HEIGHT,
                limits::ONCHIP_IB_WIDTH
            )));
        }
        if self.kind == HwLayerType::Conv && self.ofm_num > limits::MAX_BETA_LENGTH {
            return Err(AccelError::invalid_params(format!(
                "OFM_num = {} exceeds bias buffer depth {}",
                self.ofm_num,
                limits::MAX_BETA_LENGTH
            )));
        }
        Ok(())
    }
}

/// How long to wait after START before confirming the core saw it.
const START_CONFIRM_DELAY: Duration = Duration::from_micros(10);
/// Status poll interval while waiting for completion.
const POLL_INTERVAL: Duration = Duration::from_micros(50);

/// Protocol engine over a [`RegisterBus`].
pub struct Accelerator<B: RegisterBus> {
    bus: B,
    layers_run: u64,
}

impl<B: RegisterBus> Accelerator<B> {
    /// Wrap a register bus.
    pub fn new(bus: B) -> Self {
        Self { bus, layers_run: 0 }
    }

    /// Number of layers run since construction.
    #[must_use]
    pub const fn layers_run(&self) -> u64 {
        self.layers_run
    }

    /// Access the underlying bus.
    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Run one hardware layer to completion.
    ///
    /// Blocks until the core finishes or `timeout` elapses. The
    /// sequence is: validate, program Q shifts, drain stale handshake
    /// bits, wait for IDLE, program arguments, pulse START, confirm the
    /// core observed it, then poll for completion.
    ///
    /// # Errors
    ///
    /// - [`AccelError::InvalidParams`] before any register is touched.
    /// - [`AccelError::StartNotObserved`] if the start pulse vanished
    ///   without any evidence of execution.
    /// - [`AccelError::Timeout`] if the layer does not finish in time;
    ///   START is cleared best-effort and the last status snapshot is
    ///   reported. The core state is unknown after a timeout.
    pub fn run_layer(&mut self, job: &LayerJob, timeout: Duration) -> Result<()> {
        job.validate()?;
        let deadline = Instant::now() + timeout;
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);

        self.bus.write_q(QPort::Weight, job.q.qw);
        self.bus.write_q(QPort::ActIn, job.q.qa_in);
        self.bus.write_q(QPort::ActOut, job.q.qa_out);
        self.bus.write_q(QPort::Bias, job.q.qb);

        // A DONE/READY left over from a previous layer would be
        // indistinguishable from this layer completing. Reading the
        // status clears them.
        let stale = self.bus.read_ctrl(regs::AP_CTRL);
        if stale & (ap_ctrl::DONE | ap_ctrl::READY) != 0 {
            tracing::warn!(status = format_args!("{stale:#06x}"), "Draining stale handshake bits");
            let _ = self.bus.read_ctrl(regs::AP_CTRL);
        }

        // The core must be idle before arguments change under it.
        loop {
            let status = self.bus.read_ctrl(regs::AP_CTRL);
            if status & ap_ctrl::IDLE != 0 {
                break;
            }
            if Instant::now() >= deadline {
                return Err(AccelError::Timeout {
                    duration_ms: timeout_ms,
                    status,
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        self.program(job);

        self.bus.barrier();
        self.bus.write_ctrl(regs::AP_CTRL, ap_ctrl::START);
        self.bus.barrier();

        // Confirm the core latched START. DONE/READY count as evidence
        // too (short layers can already be finished), as does IDLE
        // having dropped. This read may consume a clear-on-read DONE,
        // so it is handed to the completion wait rather than discarded.
        std::thread::sleep(START_CONFIRM_DELAY);
        let first = self.bus.read_ctrl(regs::AP_CTRL);
        let evidence = first & (ap_ctrl::START | ap_ctrl::DONE | ap_ctrl::READY) != 0
            || first & ap_ctrl::IDLE == 0;
        if !evidence {
            tracing::error!(status = format_args!("{first:#06x}"), "START was not observed");
            return Err(AccelError::StartNotObserved { status: first });
        }

        self.wait_for_completion(first, deadline, timeout_ms)?;
        self.layers_run += 1;
        Ok(())
    }

    fn program(&self, job: &LayerJob) {
        let b = &self.bus;
        b.write_ctrl(regs::INPUT_ADDR_LO, (job.input_addr & 0xffff_ffff) as u32);
        b.write_ctrl(regs::INPUT_ADDR_HI, (job.input_addr >> 32) as u32);
        b.write_ctrl(regs::OUTPUT_ADDR_LO, (job.output_addr & 0xffff_ffff) as u32);
        b.write_ctrl(regs::OUTPUT_ADDR_HI, (job.output_addr >> 32) as u32);
        b.write_ctrl(regs::WEIGHT_ADDR_LO, (job.weight_addr & 0xffff_ffff) as u32);
        b.write_ctrl(regs::WEIGHT_ADDR_HI, (job.weight_addr >> 32) as u32);
        b.write_ctrl(regs::BETA_ADDR_LO, (job.beta_addr & 0xffff_ffff) as u32);
        b.write_ctrl(regs::BETA_ADDR_HI, (job.beta_addr >> 32) as u32);

        b.write_ctrl(regs::IFM_NUM, job.ifm_num);
        b.write_ctrl(regs::OFM_NUM, job.ofm_num);
        b.write_ctrl(regs::KSIZE, job.ksize);
        b.write_ctrl(regs::KSTRIDE, job.kstride);
        b.write_ctrl(regs::INPUT_W, job.input_w);
        b.write_ctrl(regs::INPUT_H, job.input_h);
        b.write_ctrl(regs::OUTPUT_W, job.output_w);
        b.write_ctrl(regs::OUTPUT_H, job.output_h);
        b.write_ctrl(regs::PADDING, job.padding);
        b.write_ctrl(regs::IS_NL, u32::from(job.is_nl));
        b.write_ctrl(regs::IS_BN, u32::from(job.is_bn));

        let t = &job.tiles;
        b.write_ctrl(regs::TM, t.tm);
        b.write_ctrl(regs::TN, t.tn);
        b.write_ctrl(regs::TR, t.tr);
        b.write_ctrl(regs::TC, t.tc);
        b.write_ctrl(regs::OFM_NUM_BOUND, t.ofm_num_bound);
        b.write_ctrl(regs::MLOOPS_X_TM, t.mloops_x_tm);
        b.write_ctrl(regs::MLOOPS_A1_X_TM, t.mloops_a1_x_tm);
        b.write_ctrl(regs::LAYER_TYPE, job.kind as u32);

        tracing::debug!(
            kind = ?job.kind,
            ifm = job.ifm_num,
            ofm = job.ofm_num,
            k = job.ksize,
            s = job.kstride,
            out = format_args!("{}x{}", job.output_w, job.output_h),
            "Layer programmed"
        );
    }

    /// Poll ap_ctrl until the layer completes.
    ///
    /// Completion is IDLE re-asserting after having dropped, or a
    /// DONE/READY observed while IDLE never dropped at all (the layer
    /// finished before the first poll).
    fn wait_for_completion(&self, first: u32, deadline: Instant, timeout_ms: u64) -> Result<()> {
        let mut status = first;
        let mut idle_dropped = false;
        let mut handshake_seen = false;
        loop {
            if status & (ap_ctrl::DONE | ap_ctrl::READY) != 0 {
                handshake_seen = true;
            }
            if status & ap_ctrl::IDLE == 0 {
                idle_dropped = true;
            } else if idle_dropped || handshake_seen {
                tracing::trace!(status = format_args!("{status:#06x}"), "Layer complete");
                return Ok(());
            }
            if Instant::now() >= deadline {
                // Best effort: stop the core re-launching with stale
                // arguments. If it is wedged this write changes nothing.
                self.bus.write_ctrl(regs::AP_CTRL, 0);
                tracing::error!(
                    status = format_args!("{status:#06x}"),
                    timeout_ms,
                    "Layer timed out"
                );
                return Err(AccelError::Timeout {
                    duration_ms: timeout_ms,
                    status,
                });
            }
            std::thread::sleep(POLL_INTERVAL);
            status = self.bus.read_ctrl(regs::AP_CTRL);
        }
    }
}
