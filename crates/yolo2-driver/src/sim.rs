//! Register-faithful software model of the accelerator.
//!
//! [`SimBus`] implements [`RegisterBus`] over a software DDR (shared
//! with [`crate::dma::SimPool`]) and executes a full layer when START
//! is written, reproducing the handshake the driver has to cope with:
//! clear-on-read DONE/READY, IDLE dropping for a configurable number of
//! status reads, and instant completion for zero-latency layers. Knobs
//! can wedge the core or swallow START to exercise the failure paths.
//!
//! Arithmetic model: `i16` feature maps and weights, `i64` accumulator,
//! bias pre-shifted by `qw + qa_in - qb`, leaky ReLU as integer `acc / 10`
//! on negative accumulators, write-back as an arithmetic right shift by
//! `qw + qa_in - qa_out` saturated to `i16`. Rows are padded to a
//! multiple of 8 elements, channel-major.
//!
//! Like the core, the channel loops honor the `MLOOPS_X_TM` register:
//! compute gates on it, so channels past the programmed bound are never
//! written and a misprogrammed bound shows up as a truncated output.

use std::sync::{Arc, Mutex};

use yolo2_chip::regs::{self, ap_ctrl};
use yolo2_chip::{align_row_8, HwLayerType};

use crate::mmio::{QPort, RegisterBus};

struct SimState {
    regs: Vec<u32>,
    q: [u32; 4],
    idle: bool,
    done: bool,
    ready: bool,
    /// Status reads left before the running layer completes.
    busy_reads_left: u32,
    /// Latency knob applied to each started layer.
    latency_reads: u32,
    wedged: bool,
    ignore_start: bool,
    start_seen: bool,
}

/// Simulated register bus and execution engine.
pub struct SimBus {
    mem: Arc<Mutex<Vec<i16>>>,
    base_phys: u64,
    state: Mutex<SimState>,
}

impl std::fmt::Debug for SimBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimBus")
            .field("base_phys", &format_args!("{:#x}", self.base_phys))
            .finish_non_exhaustive()
    }
}

impl SimBus {
    /// Create a bus over a software DDR.
    ///
    /// `mem` and `base_phys` normally come from
    /// [`crate::dma::SimPool::backing`] and
    /// [`crate::dma::SimPool::base_phys`] so that addresses allocated
    /// from the pool resolve inside the simulated memory.
    #[must_use]
    pub fn new(mem: Arc<Mutex<Vec<i16>>>, base_phys: u64) -> Self {
        Self {
            mem,
            base_phys,
            state: Mutex::new(SimState {
                regs: vec![0; regs::CTRL_SIZE / 4],
                q: [0; 4],
                idle: true,
                done: false,
                ready: false,
                busy_reads_left: 0,
                latency_reads: 0,
                wedged: false,
                ignore_start: false,
                start_seen: false,
            }),
        }
    }

    /// Make each layer hold IDLE low for `reads` status reads.
    pub fn set_latency_reads(&self, reads: u32) {
        self.state.lock().unwrap().latency_reads = reads;
    }

    /// Accept START but never complete.
    pub fn wedge(&self) {
        self.state.lock().unwrap().wedged = true;
    }

    /// Silently drop START writes.
    pub fn swallow_start(&self) {
        self.state.lock().unwrap().ignore_start = true;
    }

    /// Whether a START write ever reached the core.
    pub fn start_seen(&self) -> bool {
        self.state.lock().unwrap().start_seen
    }

    fn word_index(&self, phys: u64) -> usize {
        usize::try_from((phys - self.base_phys) / 2).unwrap_or(usize::MAX)
    }

    fn reg(state: &SimState, offset: usize) -> u32 {
        state.regs[offset / 4]
    }

    fn addr64(state: &SimState, lo: usize, hi: usize) -> u64 {
        u64::from(Self::reg(state, lo)) | (u64::from(Self::reg(state, hi)) << 32)
    }

    fn execute(&self, state: &SimState) {
        let mut mem = self.mem.lock().unwrap();
        let kind = if Self::reg(state, regs::LAYER_TYPE) == HwLayerType::Maxpool as u32 {
            HwLayerType::Maxpool
        } else {
            HwLayerType::Conv
        };
        match kind {
            HwLayerType::Conv => self.run_conv(state, &mut mem),
            HwLayerType::Maxpool => self.run_maxpool(state, &mut mem),
        }
    }

    #[allow(clippy::too_many_lines)]
    fn run_conv(&self, state: &SimState, mem: &mut [i16]) {
        let in_base = self.word_index(Self::addr64(state, regs::INPUT_ADDR_LO, regs::INPUT_ADDR_HI));
        let out_base =
            self.word_index(Self::addr64(state, regs::OUTPUT_ADDR_LO, regs::OUTPUT_ADDR_HI));
        let w_base =
            self.word_index(Self::addr64(state, regs::WEIGHT_ADDR_LO, regs::WEIGHT_ADDR_HI));
        let b_base = self.word_index(Self::addr64(state, regs::BETA_ADDR_LO, regs::BETA_ADDR_HI));

        let in_c = Self::reg(state, regs::IFM_NUM) as usize;
        let out_c = Self::reg(state, regs::OFM_NUM) as usize;
        let k = Self::reg(state, regs::KSIZE) as usize;
        let s = Self::reg(state, regs::KSTRIDE) as usize;
        let in_w = Self::reg(state, regs::INPUT_W) as usize;
        let in_h = Self::reg(state, regs::INPUT_H) as usize;
        let out_w = Self::reg(state, regs::OUTPUT_W) as usize;
        let out_h = Self::reg(state, regs::OUTPUT_H) as usize;
        let pad = Self::reg(state, regs::PADDING) as usize;
        let is_nl = Self::reg(state, regs::IS_NL) != 0;
        let is_bn = Self::reg(state, regs::IS_BN) != 0;

        let qw = i64::from(state.q[0]);
        let qa_in = i64::from(state.q[1]);
        let qa_out = i64::from(state.q[2]);
        let qb = i64::from(state.q[3]);
        let bias_shift = qw + qa_in - qb;
        let out_shift = qw + qa_in - qa_out;

        let in_stride = align_row_8(in_w);
        let out_stride = align_row_8(out_w);

        // The core only loads and computes while m != mLoops*TM, so the
        // programmed bound caps the output channels actually produced.
        let chan_bound = Self::reg(state, regs::MLOOPS_X_TM) as usize;

        for m in 0..out_c.min(chan_bound) {
            let bias = if is_bn {
                shift_left_or_right(i64::from(mem[b_base + m]), bias_shift)
            } else {
                0
            };
            for r in 0..out_h {
                for c in 0..out_w {
                    let mut acc = bias;
                    for n in 0..in_c {
                        for kh in 0..k {
                            for kw in 0..k {
                                let ir = (r * s + kh) as isize - pad as isize;
                                let ic = (c * s + kw) as isize - pad as isize;
                                if ir < 0 || ic < 0 || ir >= in_h as isize || ic >= in_w as isize {
                                    continue;
                                }
                                let x = mem[in_base
                                    + n * in_h * in_stride
                                    + ir as usize * in_stride
                                    + ic as usize];
                                let w = mem[w_base + ((m * in_c + n) * k + kh) * k + kw];
                                acc += i64::from(x) * i64::from(w);
                            }
                        }
                    }
                    if is_nl && acc < 0 {
                        acc /= 10;
                    }
                    let out = sat16(shift_left_or_right(acc, -out_shift));
                    mem[out_base + m * out_h * out_stride + r * out_stride + c] = out;
                }
            }
        }
    }

    fn run_maxpool(&self, state: &SimState, mem: &mut [i16]) {
        let in_base = self.word_index(Self::addr64(state, regs::INPUT_ADDR_LO, regs::INPUT_ADDR_HI));
        let out_base =
            self.word_index(Self::addr64(state, regs::OUTPUT_ADDR_LO, regs::OUTPUT_ADDR_HI));

        let channels = Self::reg(state, regs::IFM_NUM) as usize;
        let k = Self::reg(state, regs::KSIZE) as usize;
        let s = Self::reg(state, regs::KSTRIDE) as usize;
        let in_w = Self::reg(state, regs::INPUT_W) as usize;
        let in_h = Self::reg(state, regs::INPUT_H) as usize;
        let out_w = Self::reg(state, regs::OUTPUT_W) as usize;
        let out_h = Self::reg(state, regs::OUTPUT_H) as usize;

        let in_stride = align_row_8(in_w);
        let out_stride = align_row_8(out_w);

        let chan_bound = Self::reg(state, regs::MLOOPS_X_TM) as usize;

        for n in 0..channels.min(chan_bound) {
            for r in 0..out_h {
                for c in 0..out_w {
                    let mut best = i16::MIN;
                    for kh in 0..k {
                        for kw in 0..k {
                            let ir = r * s + kh;
                            let ic = c * s + kw;
                            if ir >= in_h || ic >= in_w {
                                continue;
                            }
                            let x = mem[in_base + n * in_h * in_stride + ir * in_stride + ic];
                            best = best.max(x);
                        }
                    }
                    mem[out_base + n * out_h * out_stride + r * out_stride + c] = best;
                }
            }
        }
    }
}

fn sat16(v: i64) -> i16 {
    v.clamp(i64::from(i16::MIN), i64::from(i16::MAX)) as i16
}

/// Shift left for positive `amount`, arithmetic right for negative.
fn shift_left_or_right(v: i64, amount: i64) -> i64 {
    if amount >= 0 {
        v << amount
    } else {
        v >> (-amount)
    }
}

impl RegisterBus for SimBus {
    fn read_ctrl(&self, offset: usize) -> u32 {
        let mut state = self.state.lock().unwrap();
        if offset == regs::AP_CTRL {
            if state.busy_reads_left > 0 {
                state.busy_reads_left -= 1;
                if state.busy_reads_left == 0 && !state.wedged {
                    state.idle = true;
                    state.done = true;
                    state.ready = true;
                }
            }
            let mut status = 0;
            if state.idle {
                status |= ap_ctrl::IDLE;
            } else {
                // ap_ctrl_hs holds START high until the handshake.
                status |= ap_ctrl::START;
            }
            if state.done {
                status |= ap_ctrl::DONE;
            }
            if state.ready {
                status |= ap_ctrl::READY;
            }
            // Clear-on-read, like the real handshake registers.
            state.done = false;
            state.ready = false;
            status
        } else {
            SimBus::reg(&state, offset)
        }
    }

    fn write_ctrl(&self, offset: usize, value: u32) {
        let mut state = self.state.lock().unwrap();
        if offset == regs::AP_CTRL {
            if value & ap_ctrl::START == 0 || state.ignore_start {
                return;
            }
            state.start_seen = true;
            if state.wedged {
                state.idle = false;
                state.busy_reads_left = u32::MAX;
                return;
            }
            self.execute(&state);
            if state.latency_reads == 0 {
                // Instant completion: IDLE never observed low.
                state.done = true;
                state.ready = true;
            } else {
                state.idle = false;
                state.busy_reads_left = state.latency_reads;
            }
        } else {
            state.regs[offset / 4] = value;
        }
    }

    fn write_q(&self, port: QPort, value: u32) {
        let idx = match port {
            QPort::Weight => 0,
            QPort::ActIn => 1,
            QPort::ActOut => 2,
            QPort::Bias => 3,
        };
        self.state.lock().unwrap().q[idx] = value;
    }

    fn barrier(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::{Accelerator, LayerJob, QSet};
    use crate::dma::{DmaMemory, SimPool};
    use crate::error::AccelError;
    use std::time::Duration;
    use yolo2_chip::{plan_conv, plan_maxpool};

    const BASE: u64 = 0x4000_0000;

    fn setup(words: usize) -> (SimPool, SimBus) {
        let pool = SimPool::new(BASE, words);
        let bus = SimBus::new(pool.backing(), pool.base_phys());
        (pool, bus)
    }

    /// 2x2 input, single channel, 1x1 kernel: output = (x * w) >> qw.
    fn tiny_conv_job(pool: &mut SimPool) -> LayerJob {
        let input = pool.alloc(16).unwrap();
        let output = pool.alloc(16).unwrap();
        let weight = pool.alloc(1).unwrap();
        let beta = pool.alloc(1).unwrap();
        // Row stride is 8 even for a 2-wide map.
        input.write_words(0, &[10, -20, 0, 0, 0, 0, 0, 0, 30, -40]).unwrap();
        weight.write_words(0, &[4]).unwrap();
        beta.write_words(0, &[0]).unwrap();
        LayerJob {
            kind: HwLayerType::Conv,
            input_addr: input.phys_addr(),
            output_addr: output.phys_addr(),
            weight_addr: weight.phys_addr(),
            beta_addr: beta.phys_addr(),
            ifm_num: 1,
            ofm_num: 1,
            ksize: 1,
            kstride: 1,
            input_w: 2,
            input_h: 2,
            output_w: 2,
            output_h: 2,
            padding: 0,
            is_nl: false,
            is_bn: false,
            tiles: plan_conv(1, 1, 2, 2, 1, 1),
            q: QSet {
                qw: 2,
                qa_in: 4,
                qa_out: 4,
                qb: 2,
            },
        }
    }

    #[test]
    fn conv_known_answer() {
        let (mut pool, bus) = setup(64);
        let job = tiny_conv_job(&mut pool);
        let mut accel = Accelerator::new(bus);
        accel.run_layer(&job, Duration::from_millis(100)).unwrap();

        // out = (x * 4) >> 2 = x.
        let mem = pool.backing();
        let mem = mem.lock().unwrap();
        // Output region starts at word 16.
        assert_eq!(mem[16], 10);
        assert_eq!(mem[17], -20);
        assert_eq!(mem[24], 30);
        assert_eq!(mem[25], -40);
    }

    #[test]
    fn conv_leaky_and_bias() {
        let (mut pool, bus) = setup(64);
        let mut job = tiny_conv_job(&mut pool);
        job.is_nl = true;
        job.is_bn = true;
        // bias = -3, shifted left by qw + qa_in - qb = 4 bits: -48.
        let mem = pool.backing();
        {
            let mut m = mem.lock().unwrap();
            m[33] = -3; // beta region is word 33
        }
        let mut accel = Accelerator::new(bus);
        accel.run_layer(&job, Duration::from_millis(100)).unwrap();
        let m = mem.lock().unwrap();
        // x=10: acc = 40 - 48 = -8, leaky -> 0 (integer /10), >>2 -> 0.
        assert_eq!(m[16], 0);
        // x=-20: acc = -80 - 48 = -128, leaky -> -12, >>2 -> -3.
        assert_eq!(m[17], -3);
    }

    #[test]
    fn maxpool_known_answer() {
        let (mut pool, bus) = setup(64);
        let input = pool.alloc(16).unwrap();
        let output = pool.alloc(8).unwrap();
        input
            .write_words(0, &[1, 5, 2, 0, 0, 0, 0, 0, 7, -3, 4, 6])
            .unwrap();
        let job = LayerJob {
            kind: HwLayerType::Maxpool,
            input_addr: input.phys_addr(),
            output_addr: output.phys_addr(),
            weight_addr: 0,
            beta_addr: 0,
            ifm_num: 1,
            ofm_num: 1,
            ksize: 2,
            kstride: 2,
            input_w: 4,
            input_h: 2,
            output_w: 2,
            output_h: 1,
            padding: 0,
            is_nl: false,
            is_bn: false,
            tiles: plan_maxpool(1, 2, 1, 2, 2),
            q: QSet {
                qw: 0,
                qa_in: 0,
                qa_out: 0,
                qb: 0,
            },
        };
        let mut accel = Accelerator::new(bus);
        accel.run_layer(&job, Duration::from_millis(100)).unwrap();
        let mut out = [0i16; 2];
        output.read_words(0, &mut out).unwrap();
        assert_eq!(out, [7, 6]);
    }

    #[test]
    fn compute_gates_on_the_programmed_channel_bound() {
        let (mut pool, bus) = setup(64);
        let mut job = tiny_conv_job(&mut pool);
        // One tile short of the planner's value: the core would spend
        // every iteration draining and never write the output.
        job.tiles.mloops_x_tm = 0;
        let mut accel = Accelerator::new(bus);
        accel.run_layer(&job, Duration::from_millis(100)).unwrap();
        let mem = pool.backing();
        let mem = mem.lock().unwrap();
        assert_eq!(&mem[16..18], &[0, 0]);
    }

    #[test]
    fn instant_completion_is_not_an_error() {
        let (mut pool, bus) = setup(64);
        bus.set_latency_reads(0);
        let job = tiny_conv_job(&mut pool);
        let mut accel = Accelerator::new(bus);
        assert!(accel.run_layer(&job, Duration::from_millis(100)).is_ok());
        assert_eq!(accel.layers_run(), 1);
    }

    #[test]
    fn slow_layer_completes_after_idle_drop() {
        let (mut pool, bus) = setup(64);
        bus.set_latency_reads(5);
        let job = tiny_conv_job(&mut pool);
        let mut accel = Accelerator::new(bus);
        assert!(accel.run_layer(&job, Duration::from_millis(500)).is_ok());
    }

    #[test]
    fn wedged_core_times_out_with_status() {
        let (mut pool, bus) = setup(64);
        bus.wedge();
        let job = tiny_conv_job(&mut pool);
        let mut accel = Accelerator::new(bus);
        let start = std::time::Instant::now();
        let err = accel.run_layer(&job, Duration::from_millis(50)).unwrap_err();
        // Bounded wait, and the snapshot shows IDLE low.
        assert!(start.elapsed() < Duration::from_millis(500));
        match err {
            AccelError::Timeout { status, .. } => assert_eq!(status & ap_ctrl::IDLE, 0),
            other => panic!("expected timeout, got {other}"),
        }
    }

    #[test]
    fn swallowed_start_is_detected() {
        let (mut pool, bus) = setup(64);
        bus.swallow_start();
        let job = tiny_conv_job(&mut pool);
        let mut accel = Accelerator::new(bus);
        let err = accel.run_layer(&job, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, AccelError::StartNotObserved { .. }));
    }

    #[test]
    fn stale_done_is_drained_before_start() {
        let (mut pool, bus) = setup(64);
        // Leave a stale DONE latched, as if a previous layer's
        // completion was never consumed.
        {
            let mut s = bus.state.lock().unwrap();
            s.done = true;
        }
        let job = tiny_conv_job(&mut pool);
        let mut accel = Accelerator::new(bus);
        assert!(accel.run_layer(&job, Duration::from_millis(100)).is_ok());
    }
}
