//! Physically-contiguous DMA memory for feature maps and weights.
//!
//! The core reads and writes DDR directly, so every blob it touches
//! must live in a physically-contiguous region whose physical address
//! the host knows. [`DmaMemory`] is the allocation seam: [`UdmabufPool`]
//! carves regions out of a `u-dma-buf` kernel buffer, while the
//! simulator backend hands out regions of its software DDR.
//!
//! All transfers are explicit copies. Nothing in the driver hands out
//! references into DMA memory; the core can write it at any time while
//! a layer runs.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rustix::fs::{open, Mode, OFlags};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::os::unix::io::AsFd;

use crate::error::{AccelError, Result};

/// One allocated region of DMA-visible memory, addressed in i16 words.
pub trait DmaBuffer: Send + Sync {
    /// Physical address of the first word.
    fn phys_addr(&self) -> u64;
    /// Capacity in i16 words.
    fn len(&self) -> usize;
    /// Whether the region is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Copy words out of the region.
    ///
    /// # Errors
    ///
    /// Returns an error if `offset + out.len()` exceeds the region.
    fn read_words(&self, offset: usize, out: &mut [i16]) -> Result<()>;
    /// Copy words into the region.
    ///
    /// # Errors
    ///
    /// Returns an error if `offset + data.len()` exceeds the region.
    fn write_words(&self, offset: usize, data: &[i16]) -> Result<()>;
    /// Make host writes visible to the core.
    fn flush(&self);
    /// Make core writes visible to the host.
    fn invalidate(&self);
}

/// DMA allocation seam.
pub trait DmaMemory {
    /// Allocate a region of `words` i16 elements.
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::Allocation`] if the pool is exhausted.
    fn alloc(&mut self, words: usize) -> Result<Arc<dyn DmaBuffer>>;
}

struct UdmabufMapping {
    ptr: *mut u8,
    size: usize,
    phys: u64,
}

// SAFETY: Send/Sync - the mapping is plain DDR shared with the device,
// accessed only through bounds-checked copies under region ownership.
unsafe impl Send for UdmabufMapping {}
unsafe impl Sync for UdmabufMapping {}

impl Drop for UdmabufMapping {
    fn drop(&mut self) {
        // SAFETY: ptr/size come from a successful mmap; Drop runs once.
        unsafe {
            let _ = munmap(self.ptr.cast(), self.size);
        }
    }
}

fn read_sysfs_u64(path: &Path) -> Result<u64> {
    let text = fs::read_to_string(path)?;
    let text = text.trim();
    let parsed = if let Some(hex) = text.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        text.parse()
    };
    parsed.map_err(|e| AccelError::allocation(format!("bad sysfs value {}: {e}", path.display())))
}

/// Bump allocator over one `u-dma-buf` buffer.
///
/// The kernel module exports the buffer as `/dev/<name>` with its
/// physical address and size under `/sys/class/u-dma-buf/<name>/`.
pub struct UdmabufPool {
    mapping: Arc<UdmabufMapping>,
    next: usize,
}

impl std::fmt::Debug for UdmabufPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdmabufPool")
            .field("phys", &format_args!("{:#x}", self.mapping.phys))
            .field("size", &self.mapping.size)
            .field("next", &self.next)
            .finish()
    }
}

impl UdmabufPool {
    /// Open and map `/dev/<name>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the device node or its sysfs entries are
    /// missing, or the mapping fails.
    pub fn open(name: &str) -> Result<Self> {
        let dev = PathBuf::from(format!("/dev/{name}"));
        if !dev.exists() {
            return Err(AccelError::device_not_found(dev));
        }
        let sys = PathBuf::from(format!("/sys/class/u-dma-buf/{name}"));
        let phys = read_sysfs_u64(&sys.join("phys_addr"))?;
        let size = usize::try_from(read_sysfs_u64(&sys.join("size"))?)
            .map_err(|e| AccelError::allocation(e.to_string()))?;

        // O_SYNC keeps the mapping uncached, so flush/invalidate are
        // no-ops and the core always sees current data.
        let fd = open(&dev, OFlags::RDWR | OFlags::SYNC, Mode::empty())
            .map_err(|e| AccelError::map_failed(dev.display().to_string(), e.to_string()))?;
        let file = std::fs::File::from(fd);
        // SAFETY: mmap of the whole u-dma-buf buffer. Invariants:
        // (1) file is the open device node; (2) size comes from the
        // kernel's sysfs entry; (3) ptr valid for size bytes or Err.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                0,
            )
            .map_err(|e| AccelError::map_failed(name, e.to_string()))?
        };
        tracing::info!(
            name,
            phys = format_args!("{phys:#x}"),
            size,
            "DMA pool mapped"
        );
        Ok(Self {
            mapping: Arc::new(UdmabufMapping {
                ptr: ptr.cast(),
                size,
                phys,
            }),
            next: 0,
        })
    }

    /// Remaining capacity in i16 words.
    #[must_use]
    pub fn remaining(&self) -> usize {
        (self.mapping.size - self.next) / 2
    }
}

impl DmaMemory for UdmabufPool {
    fn alloc(&mut self, words: usize) -> Result<Arc<dyn DmaBuffer>> {
        let bytes = words * 2;
        if self.next + bytes > self.mapping.size {
            return Err(AccelError::allocation(format!(
                "pool exhausted: requested {bytes} bytes, {} free",
                self.mapping.size - self.next
            )));
        }
        let region = UdmabufRegion {
            mapping: Arc::clone(&self.mapping),
            byte_offset: self.next,
            words,
        };
        self.next += bytes;
        Ok(Arc::new(region))
    }
}

/// A sub-range of a [`UdmabufPool`].
pub struct UdmabufRegion {
    mapping: Arc<UdmabufMapping>,
    byte_offset: usize,
    words: usize,
}

impl UdmabufRegion {
    fn bounds_check(&self, offset: usize, len: usize) -> Result<()> {
        if offset + len > self.words {
            return Err(AccelError::allocation(format!(
                "DMA access {offset}+{len} exceeds region of {} words",
                self.words
            )));
        }
        Ok(())
    }
}

impl DmaBuffer for UdmabufRegion {
    fn phys_addr(&self) -> u64 {
        self.mapping.phys + self.byte_offset as u64
    }

    fn len(&self) -> usize {
        self.words
    }

    fn read_words(&self, offset: usize, out: &mut [i16]) -> Result<()> {
        self.bounds_check(offset, out.len())?;
        // SAFETY: src is inside the mapping (bounds checked against the
        // region, region carved inside the pool); i16 copies from DDR
        // need no alignment beyond 2 which the word addressing gives.
        unsafe {
            let src = self
                .mapping
                .ptr
                .add(self.byte_offset + offset * 2)
                .cast::<i16>();
            std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    fn write_words(&self, offset: usize, data: &[i16]) -> Result<()> {
        self.bounds_check(offset, data.len())?;
        // SAFETY: dst is inside the mapping, bounds checked as above.
        unsafe {
            let dst = self
                .mapping
                .ptr
                .add(self.byte_offset + offset * 2)
                .cast::<i16>();
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        Ok(())
    }

    // The O_SYNC mapping is uncached; there is nothing to maintain.
    fn flush(&self) {}
    fn invalidate(&self) {}
}

/// In-memory DMA pool for tests and the simulator backend.
///
/// Backed by a plain `Vec<i16>` shared with [`crate::sim`], with a
/// fake physical base so address arithmetic exercises the same paths
/// as hardware.
pub struct SimPool {
    state: Arc<Mutex<Vec<i16>>>,
    base_phys: u64,
    next: usize,
}

impl SimPool {
    /// Create a pool of `words` elements at the given fake physical base.
    #[must_use]
    pub fn new(base_phys: u64, words: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(vec![0; words])),
            base_phys,
            next: 0,
        }
    }

    /// Shared handle to the backing store, for wiring up a simulator.
    #[must_use]
    pub fn backing(&self) -> Arc<Mutex<Vec<i16>>> {
        Arc::clone(&self.state)
    }

    /// Fake physical base address.
    #[must_use]
    pub const fn base_phys(&self) -> u64 {
        self.base_phys
    }
}

impl DmaMemory for SimPool {
    fn alloc(&mut self, words: usize) -> Result<Arc<dyn DmaBuffer>> {
        let total = self.state.lock().map_or(0, |v| v.len());
        if self.next + words > total {
            return Err(AccelError::allocation(format!(
                "sim pool exhausted: requested {words} words, {} free",
                total - self.next
            )));
        }
        let region = SimRegion {
            state: Arc::clone(&self.state),
            phys: self.base_phys + (self.next as u64) * 2,
            word_offset: self.next,
            words,
        };
        self.next += words;
        Ok(Arc::new(region))
    }
}

struct SimRegion {
    state: Arc<Mutex<Vec<i16>>>,
    phys: u64,
    word_offset: usize,
    words: usize,
}

impl DmaBuffer for SimRegion {
    fn phys_addr(&self) -> u64 {
        self.phys
    }

    fn len(&self) -> usize {
        self.words
    }

    fn read_words(&self, offset: usize, out: &mut [i16]) -> Result<()> {
        if offset + out.len() > self.words {
            return Err(AccelError::allocation("sim DMA read out of bounds"));
        }
        let mem = self
            .state
            .lock()
            .map_err(|_| AccelError::allocation("sim memory poisoned"))?;
        let start = self.word_offset + offset;
        out.copy_from_slice(&mem[start..start + out.len()]);
        Ok(())
    }

    fn write_words(&self, offset: usize, data: &[i16]) -> Result<()> {
        if offset + data.len() > self.words {
            return Err(AccelError::allocation("sim DMA write out of bounds"));
        }
        let mut mem = self
            .state
            .lock()
            .map_err(|_| AccelError::allocation("sim memory poisoned"))?;
        let start = self.word_offset + offset;
        mem[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn flush(&self) {}
    fn invalidate(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_pool_bump_allocates() {
        let mut pool = SimPool::new(0x4000_0000, 1024);
        let a = pool.alloc(256).unwrap();
        let b = pool.alloc(256).unwrap();
        assert_eq!(a.phys_addr(), 0x4000_0000);
        assert_eq!(b.phys_addr(), 0x4000_0000 + 512);
        assert!(pool.alloc(1024).is_err());
    }

    #[test]
    fn sim_regions_round_trip_and_bounds_check() {
        let mut pool = SimPool::new(0x4000_0000, 64);
        let a = pool.alloc(8).unwrap();
        a.write_words(2, &[1, -2, 3]).unwrap();
        let mut out = [0i16; 3];
        a.read_words(2, &mut out).unwrap();
        assert_eq!(out, [1, -2, 3]);
        assert!(a.write_words(6, &[0; 4]).is_err());
    }
}
