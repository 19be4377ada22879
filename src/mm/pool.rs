//! Bounded page pool for IOMMU metadata
//!
//! Pages are donated by the host (already owned by the hypervisor when they
//! reach the pool) and kept on an intrusive free list: the first dword of a
//! free page holds the physical address of the next one. The pool never
//! grows on its own; when it runs dry the caller posts a memory request and
//! the host refills it.

use super::phys_to_virt;
use crate::config::{PAGE_MASK, PAGE_SIZE};
use crate::sync::SpinLock;

/// Source of zeroed, page-sized, page-aligned metadata pages.
pub trait PageAllocator {
    fn alloc_page(&self) -> Option<u64>;
    fn free_page(&self, phys: u64);
}

struct PoolInner {
    /// Physical address of the first free page, 0 when empty.
    head: u64,
    free: usize,
    allocated: usize,
}

pub struct PagePool {
    inner: SpinLock<PoolInner>,
}

impl PagePool {
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(PoolInner {
                head: 0,
                free: 0,
                allocated: 0,
            }),
        }
    }

    /// Add a hypervisor-owned page to the pool.
    ///
    /// # Safety
    /// `phys` must be a page-aligned, identity-mapped page owned by the
    /// hypervisor and not referenced by anything else.
    pub unsafe fn refill_page(&self, phys: u64) {
        debug_assert_eq!(phys & !PAGE_MASK, 0);
        let mut inner = self.inner.lock();
        core::ptr::write(phys_to_virt(phys) as *mut u64, inner.head);
        inner.head = phys;
        inner.free += 1;
    }

    /// Remove up to `target` free pages, handing each to `give_back`.
    /// Returns the number of pages reclaimed.
    pub fn reclaim(&self, target: usize, mut give_back: impl FnMut(u64)) -> usize {
        let mut done = 0;
        while done < target {
            let Some(phys) = self.pop() else { break };
            give_back(phys);
            done += 1;
        }
        done
    }

    /// Pages that could be handed back to the host right now.
    pub fn free_pages(&self) -> usize {
        self.inner.lock().free
    }

    /// Pages currently handed out.
    pub fn allocated_pages(&self) -> usize {
        self.inner.lock().allocated
    }

    fn pop(&self) -> Option<u64> {
        let mut inner = self.inner.lock();
        if inner.head == 0 {
            return None;
        }
        let phys = inner.head;
        inner.head = unsafe { core::ptr::read(phys_to_virt(phys) as *const u64) };
        inner.free -= 1;
        Some(phys)
    }
}

impl PageAllocator for PagePool {
    fn alloc_page(&self) -> Option<u64> {
        let phys = self.pop()?;
        unsafe { core::ptr::write_bytes(phys_to_virt(phys), 0, PAGE_SIZE) };
        self.inner.lock().allocated += 1;
        Some(phys)
    }

    fn free_page(&self, phys: u64) {
        // Order MUST match allocation: pool pages are single pages.
        assert_eq!(phys & !PAGE_MASK, 0, "freeing unaligned pool page");
        self.inner.lock().allocated -= 1;
        unsafe { self.refill_page(phys) };
    }
}

impl Default for PagePool {
    fn default() -> Self {
        Self::new()
    }
}
