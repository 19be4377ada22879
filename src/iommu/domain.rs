//! Domain records and the two-level domain table
//!
//! The root is an array of leaf pointers; each leaf is one pool page holding
//! [`DOMAINS_PER_LEAF`] records. Leaves are installed once and never freed,
//! so a `&Domain` handed out by the table stays valid for the life of the
//! hypervisor. Whether the record is *in use* is decided by its refcount.

use core::mem::size_of;
use core::ptr::null_mut;
use core::sync::atomic::{AtomicI32, AtomicPtr, AtomicU32, Ordering};

use super::ops::IoPgtable;
use crate::arch::index_nospec;
use crate::config::{DOMAINS_PER_LEAF, DOMAIN_RECORD_MAX, DOMAIN_ROOT_ENTRIES, MAX_DOMAINS};
use crate::error::{IommuError, Result};
use crate::mm::{phys_to_virt, PageAllocator};
use crate::sync::{SpinLock, SpinLockGuard};

/// Mutable part of a domain, behind the per-domain lock.
pub struct DomainState<D> {
    /// Set on first attach, then fixed until the domain is freed.
    pub pgtable: Option<&'static dyn IoPgtable>,
    /// Backend-private data, present while the domain is allocated.
    pub data: Option<D>,
}

pub struct Domain<D> {
    /// 0 = free, 1 = allocated, 1 + n = n devices attached or n pins held.
    refs: AtomicI32,
    id: AtomicU32,
    state: SpinLock<DomainState<D>>,
}

impl<D> Domain<D> {
    const fn empty() -> Self {
        Self {
            refs: AtomicI32::new(0),
            id: AtomicU32::new(0),
            state: SpinLock::new(DomainState {
                pgtable: None,
                data: None,
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Relaxed)
    }

    pub fn refs(&self) -> i32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SpinLockGuard<'_, DomainState<D>> {
        self.state.lock()
    }

    pub fn pgtable(&self) -> Option<&'static dyn IoPgtable> {
        self.state.lock().pgtable
    }

    /// Take a reference on an allocated domain.
    ///
    /// A free domain (refs == 0) is left untouched.
    pub fn get(&self) -> Result<()> {
        let mut old = self.refs.load(Ordering::Relaxed);
        loop {
            if old == 0 {
                log::warn!("iommu: domain {} is not allocated", self.id());
                return Err(IommuError::InvalidArgument);
            }
            let new = match old.checked_add(1) {
                Some(new) if old > 0 => new,
                _ => return Err(IommuError::Overflow),
            };
            match self
                .refs
                .compare_exchange_weak(old, new, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return Ok(()),
                Err(cur) => old = cur,
            }
        }
    }

    /// Drop a reference taken by [`Domain::get`].
    pub fn put(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::Release);
        // Only free_domain may take the count to zero.
        assert!(prev > 1, "iommu: domain {} released while in use", self.id());
    }

    pub(super) fn activate(&self, id: u32) {
        self.id.store(id, Ordering::Relaxed);
        self.refs.store(1, Ordering::Release);
    }

    /// 1 -> 0, only if nobody holds a reference.
    pub(super) fn try_release(&self) -> bool {
        self.refs
            .compare_exchange(1, 0, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    pub(super) fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::Relaxed);
    }

    /// Return the record to its initial state.
    pub(super) fn reset(&self) {
        {
            let mut state = self.state.lock();
            state.pgtable = None;
            state.data = None;
        }
        self.id.store(0, Ordering::Relaxed);
        self.refs.store(0, Ordering::Release);
    }

    /// True when the record is indistinguishable from a fresh one.
    pub fn is_clear(&self) -> bool {
        let state = self.state.lock();
        self.refs() == 0 && self.id() == 0 && state.pgtable.is_none() && state.data.is_none()
    }
}

pub struct DomainTable<D> {
    root: [AtomicPtr<Domain<D>>; DOMAIN_ROOT_ENTRIES],
}

impl<D> DomainTable<D> {
    const RECORD_FITS: () = assert!(
        size_of::<Domain<D>>() <= DOMAIN_RECORD_MAX,
        "domain record too large for the leaf page"
    );

    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::RECORD_FITS;
        Self {
            root: core::array::from_fn(|_| AtomicPtr::new(null_mut())),
        }
    }

    fn slot(id: u32) -> Option<(usize, usize)> {
        if id >= MAX_DOMAINS {
            return None;
        }
        let id = index_nospec(id as u64, MAX_DOMAINS as u64) as usize;
        Some((id / DOMAINS_PER_LEAF, id % DOMAINS_PER_LEAF))
    }

    /// Find the record for `id` without allocating.
    pub fn lookup(&self, id: u32) -> Option<&Domain<D>> {
        let (idx, off) = Self::slot(id)?;
        let leaf = self.root[idx].load(Ordering::Acquire);
        if leaf.is_null() {
            return None;
        }
        Some(unsafe { &*leaf.add(off) })
    }

    /// Find the record for `id`, installing its leaf from `pages` if needed.
    pub fn lookup_or_create(&self, id: u32, pages: &dyn PageAllocator) -> Option<&Domain<D>> {
        let (idx, off) = Self::slot(id)?;
        let mut leaf = self.root[idx].load(Ordering::Acquire);
        if leaf.is_null() {
            let phys = pages.alloc_page()?;
            let fresh = phys_to_virt(phys) as *mut Domain<D>;
            for i in 0..DOMAINS_PER_LEAF {
                unsafe { fresh.add(i).write(Domain::empty()) };
            }
            leaf = match self.root[idx].compare_exchange(
                null_mut(),
                fresh,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => fresh,
                Err(winner) => {
                    log::debug!("iommu: lost domain leaf {} install race", idx);
                    pages.free_page(phys);
                    winner
                }
            };
        }
        Some(unsafe { &*leaf.add(off) })
    }

    /// Number of leaves installed so far.
    pub fn leaves(&self) -> usize {
        self.root
            .iter()
            .filter(|slot| !slot.load(Ordering::Relaxed).is_null())
            .count()
    }
}

impl<D> Default for DomainTable<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use std::vec::Vec;

    #[repr(C, align(4096))]
    struct Page([u8; PAGE_SIZE]);

    /// Hands out leaked pages and counts frees.
    struct LeakPages {
        freed: SpinLock<Vec<u64>>,
        fail: bool,
    }

    impl LeakPages {
        fn new() -> Self {
            Self {
                freed: SpinLock::new(Vec::new()),
                fail: false,
            }
        }
    }

    impl PageAllocator for LeakPages {
        fn alloc_page(&self) -> Option<u64> {
            if self.fail {
                return None;
            }
            let page = std::boxed::Box::leak(std::boxed::Box::new(Page([0xff; PAGE_SIZE])));
            Some(page as *mut Page as u64)
        }

        fn free_page(&self, phys: u64) {
            self.freed.lock().push(phys);
        }
    }

    #[test]
    fn test_leaf_allocated_lazily() {
        let table: DomainTable<u64> = DomainTable::new();
        let pages = LeakPages::new();
        assert!(table.lookup(70).is_none());

        let d = table.lookup_or_create(70, &pages).unwrap();
        assert!(d.is_clear());
        assert_eq!(table.leaves(), 1);

        // Same leaf serves the neighbours
        assert!(table.lookup(64).is_some());
        assert!(table.lookup(127).is_some());
        assert!(table.lookup(128).is_none());
        assert!(core::ptr::eq(table.lookup(70).unwrap(), d));
    }

    #[test]
    fn test_out_of_range_and_alloc_failure() {
        let table: DomainTable<u64> = DomainTable::new();
        let mut pages = LeakPages::new();
        assert!(table.lookup_or_create(MAX_DOMAINS, &pages).is_none());
        pages.fail = true;
        assert!(table.lookup_or_create(3, &pages).is_none());
        assert_eq!(table.leaves(), 0);
    }

    #[test]
    fn test_refcount_rules() {
        let table: DomainTable<u64> = DomainTable::new();
        let pages = LeakPages::new();
        let d = table.lookup_or_create(9, &pages).unwrap();

        // Free domain cannot be pinned and is not modified
        assert_eq!(d.get(), Err(IommuError::InvalidArgument));
        assert_eq!(d.refs(), 0);

        d.activate(9);
        d.get().unwrap();
        assert_eq!(d.refs(), 2);
        assert!(!d.try_release());
        d.put();
        assert!(d.try_release());
        assert_eq!(d.refs(), 0);
    }

    #[test]
    fn test_get_overflow() {
        let d: Domain<u64> = Domain::empty();
        d.refs.store(i32::MAX, Ordering::Relaxed);
        assert_eq!(d.get(), Err(IommuError::Overflow));
        assert_eq!(d.refs(), i32::MAX);
    }

    #[test]
    #[should_panic(expected = "released while in use")]
    fn test_put_to_zero_panics() {
        let d: Domain<u64> = Domain::empty();
        d.activate(1);
        d.put();
    }

    #[test]
    fn test_reset_clears_record() {
        let d: Domain<u64> = Domain::empty();
        d.activate(42);
        d.state().data = Some(7);
        assert!(!d.is_clear());
        d.reset();
        assert!(d.is_clear());
    }
}
