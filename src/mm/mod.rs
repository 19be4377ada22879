//! Memory management subsystem
//!
//! The hypervisor's own mappings are identity (VA == PA) so the helpers
//! below are plain casts; they exist so every dereference of a physical
//! address is visible at one place.

pub mod pool;
pub mod request;

pub use pool::{PageAllocator, PagePool};
pub use request::{HypRequest, MemDest, MemRequest};

use crate::config::{PAGE_SHIFT, PAGE_SIZE};

#[inline]
pub fn phys_to_virt(phys: u64) -> *mut u8 {
    phys as usize as *mut u8
}

#[inline]
pub fn virt_to_phys<T>(ptr: *const T) -> u64 {
    ptr as usize as u64
}

/// Pages needed to hold `bytes`.
#[inline]
pub const fn pages_for(bytes: usize) -> usize {
    (bytes + PAGE_SIZE - 1) >> PAGE_SHIFT
}
