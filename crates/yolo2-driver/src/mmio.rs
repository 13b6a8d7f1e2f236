//! Memory-mapped register access for the YOLO2_FPGA core.
//!
//! The core exposes one AXI-Lite CTRL_BUS window plus four single-word
//! AXI GPIO blocks carrying the Q shift values. [`RegisterBus`] is the
//! seam between the protocol engine and the transport: [`DevMem`] maps
//! the real windows through `/dev/mem`, while the simulator backend
//! provides a register-faithful software implementation.

use crate::error::{AccelError, Result};
use rustix::fs::{open, Mode, OFlags};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::os::unix::io::AsFd;
use std::path::Path;
use std::sync::atomic::{fence, Ordering};

use yolo2_chip::regs;

/// The four Q shift ports, one AXI GPIO block each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QPort {
    /// Weight shift (Qw).
    Weight,
    /// Input activation shift (Qa_in).
    ActIn,
    /// Output activation shift (Qa_out).
    ActOut,
    /// Bias shift (Qb).
    Bias,
}

/// Register transport for the accelerator.
///
/// Implementations take `&self` for writes: MMIO stores are hardware
/// side effects, not Rust-visible mutation, and the protocol engine
/// serializes access itself.
pub trait RegisterBus: Send {
    /// Read a 32-bit CTRL_BUS register.
    fn read_ctrl(&self, offset: usize) -> u32;
    /// Write a 32-bit CTRL_BUS register.
    fn write_ctrl(&self, offset: usize, value: u32);
    /// Write one of the Q shift GPIO ports.
    fn write_q(&self, port: QPort, value: u32);
    /// Order all prior register writes before any later ones.
    fn barrier(&self);
}

/// One physically-addressed MMIO window.
struct MappedWindow {
    ptr: *mut u8,
    size: usize,
}

// SAFETY: Send - MappedWindow owns its mapping exclusively; mmap'd memory
// is process-wide and carries no thread-local state.
unsafe impl Send for MappedWindow {}

impl MappedWindow {
    fn map(devmem: &std::fs::File, phys: u64, size: usize, name: &str) -> Result<Self> {
        // SAFETY: mmap necessary for MMIO - maps the physical window into the
        // process. Invariants: (1) devmem is an open /dev/mem fd; (2) phys is
        // page-aligned per the address map; (3) ptr valid for size bytes or Err.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                devmem.as_fd(),
                phys,
            )
            .map_err(|e| AccelError::map_failed(name, e.to_string()))?
        };
        tracing::debug!("Mapped {name} at {ptr:p} (phys {phys:#x}, size {size:#x})");
        Ok(Self {
            ptr: ptr.cast(),
            size,
        })
    }

    fn read32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.size, "Register offset out of bounds");
        // SAFETY: read_volatile necessary for MMIO - hardware can change the
        // value, and DONE/READY are clear-on-read so the load must not be
        // elided. Invariants: (1) ptr from mmap, valid for self.size;
        // (2) offset+4 <= size; (3) u32 aligned.
        unsafe { std::ptr::read_volatile(self.ptr.add(offset).cast::<u32>()) }
    }

    fn write32(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.size, "Register offset out of bounds");
        // SAFETY: write_volatile necessary for MMIO - triggers hardware side
        // effects. Invariants: (1) ptr from mmap; (2) offset+4 <= size;
        // (3) u32 aligned.
        unsafe {
            std::ptr::write_volatile(self.ptr.add(offset).cast::<u32>(), value);
        }
    }
}

impl Drop for MappedWindow {
    fn drop(&mut self) {
        // SAFETY: ptr/size come from a successful mmap in map(); Drop runs
        // at most once and no references outlive the window.
        unsafe {
            let _ = munmap(self.ptr.cast(), self.size);
        }
    }
}

/// Hardware register bus over `/dev/mem`.
pub struct DevMem {
    ctrl: MappedWindow,
    q_weight: MappedWindow,
    q_act_in: MappedWindow,
    q_act_out: MappedWindow,
    q_bias: MappedWindow,
}

impl std::fmt::Debug for DevMem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevMem")
            .field("ctrl_size", &self.ctrl.size)
            .finish_non_exhaustive()
    }
}

impl DevMem {
    /// Map the CTRL_BUS window and the four Q GPIO windows.
    ///
    /// # Errors
    ///
    /// Returns an error if `/dev/mem` cannot be opened or any window
    /// fails to map.
    pub fn open() -> Result<Self> {
        let path = Path::new("/dev/mem");
        if !path.exists() {
            return Err(AccelError::device_not_found(path));
        }
        // O_SYNC gives an uncached mapping; register accesses must not be
        // combined or buffered.
        let fd = open(path, OFlags::RDWR | OFlags::SYNC, Mode::empty())
            .map_err(|e| AccelError::map_failed("/dev/mem", e.to_string()))?;
        let devmem = std::fs::File::from(fd);

        let ctrl = MappedWindow::map(&devmem, regs::CTRL_BASE, regs::CTRL_SIZE, "CTRL_BUS")?;
        let q_weight = MappedWindow::map(&devmem, regs::gpio::QW_BASE, regs::gpio::SIZE, "Qw GPIO")?;
        let q_act_in =
            MappedWindow::map(&devmem, regs::gpio::QA_IN_BASE, regs::gpio::SIZE, "Qa_in GPIO")?;
        let q_act_out = MappedWindow::map(
            &devmem,
            regs::gpio::QA_OUT_BASE,
            regs::gpio::SIZE,
            "Qa_out GPIO",
        )?;
        let q_bias = MappedWindow::map(&devmem, regs::gpio::QB_BASE, regs::gpio::SIZE, "Qb GPIO")?;

        tracing::info!("Accelerator register windows mapped");
        Ok(Self {
            ctrl,
            q_weight,
            q_act_in,
            q_act_out,
            q_bias,
        })
    }
}

impl RegisterBus for DevMem {
    fn read_ctrl(&self, offset: usize) -> u32 {
        self.ctrl.read32(offset)
    }

    fn write_ctrl(&self, offset: usize, value: u32) {
        self.ctrl.write32(offset, value);
    }

    fn write_q(&self, port: QPort, value: u32) {
        let window = match port {
            QPort::Weight => &self.q_weight,
            QPort::ActIn => &self.q_act_in,
            QPort::ActOut => &self.q_act_out,
            QPort::Bias => &self.q_bias,
        };
        window.write32(regs::gpio::DATA, value);
    }

    fn barrier(&self) {
        fence(Ordering::SeqCst);
    }
}
