//! Device register access
//!
//! Backends talk to hardware through [`RegisterIo`] so the same driver code
//! runs against real MMIO at EL2 and against a register model in tests.
//!
//! - offsets are relative to the start of the register frame
//! - 32-bit accessors require 4-byte alignment, 64-bit ones 8-byte alignment

/// Register-frame accessor.
pub trait RegisterIo: Sync {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
    fn read64(&self, offset: usize) -> u64;
    fn write64(&self, offset: usize, value: u64);
}

/// A physical register frame mapped at EL2.
#[derive(Debug)]
pub struct MmioRegion {
    base: usize,
    size: usize,
}

impl MmioRegion {
    /// # Safety
    /// `base..base + size` must be device memory mapped in the hypervisor's
    /// stage-1 and owned by the hypervisor for the lifetime of the region.
    pub const unsafe fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    fn addr(&self, offset: usize, width: usize) -> usize {
        assert!(offset + width <= self.size && offset % width == 0, "bad register offset");
        self.base + offset
    }
}

impl RegisterIo for MmioRegion {
    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        let val = unsafe { core::ptr::read_volatile(self.addr(offset, 4) as *const u32) };
        #[cfg(feature = "mmio_trace")]
        log::trace!("mmio: r32 {:#x}+{:#x} = {:#x}", self.base, offset, val);
        val
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        #[cfg(feature = "mmio_trace")]
        log::trace!("mmio: w32 {:#x}+{:#x} <- {:#x}", self.base, offset, value);
        unsafe { core::ptr::write_volatile(self.addr(offset, 4) as *mut u32, value) }
    }

    #[inline]
    fn read64(&self, offset: usize) -> u64 {
        let val = unsafe { core::ptr::read_volatile(self.addr(offset, 8) as *const u64) };
        #[cfg(feature = "mmio_trace")]
        log::trace!("mmio: r64 {:#x}+{:#x} = {:#x}", self.base, offset, val);
        val
    }

    #[inline]
    fn write64(&self, offset: usize, value: u64) {
        #[cfg(feature = "mmio_trace")]
        log::trace!("mmio: w64 {:#x}+{:#x} <- {:#x}", self.base, offset, value);
        unsafe { core::ptr::write_volatile(self.addr(offset, 8) as *mut u64, value) }
    }
}
