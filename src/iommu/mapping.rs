//! Map/unmap engine
//!
//! Page ownership and translation move together: pages are taken for DMA
//! before they are mapped, and handed back only after every translation to
//! them has been invalidated.

use super::domain::Domain;
use super::gather::IotlbGather;
use super::ops::{Caps, HostMemProtect, IommuBackend, IommuProt, UnmapVisitor};
use super::{Iommu, IommuCpu};
use crate::config::UNMAP_CACHE_MAX;
use crate::error::{IommuError, Result};

/// Physical ranges unmapped but not yet released to the host.
pub struct PaddrCache {
    len: usize,
    entries: [(u64, usize); UNMAP_CACHE_MAX],
}

impl PaddrCache {
    pub const fn new() -> Self {
        Self {
            len: 0,
            entries: [(0, 0); UNMAP_CACHE_MAX],
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == UNMAP_CACHE_MAX
    }

    /// Callers drain before the cache overflows.
    fn push(&mut self, paddr: u64, size: usize) {
        assert!(!self.is_full(), "unmap cache overflow");
        self.entries[self.len] = (paddr, size);
        self.len += 1;
    }

    fn drain(&mut self, mut f: impl FnMut(u64, usize)) {
        while self.len > 0 {
            self.len -= 1;
            let (paddr, size) = self.entries[self.len];
            f(paddr, size);
        }
    }
}

impl Default for PaddrCache {
    fn default() -> Self {
        Self::new()
    }
}

fn invalidate<B: IommuBackend>(
    backend: &B,
    domain: &Domain<B::DomainData>,
    gather: &IotlbGather,
) -> Result<()> {
    if !backend.caps().contains(Caps::IOTLB_SYNC) {
        return Ok(());
    }
    match backend.iotlb_sync(domain, gather) {
        // A powered-off IOMMU is reset before it translates again
        Err(IommuError::Unavailable) => Ok(()),
        ret => ret,
    }
}

/// Visitor state for one unmap call.
struct UnmapWalk<'a, B: IommuBackend> {
    backend: &'a B,
    domain: &'a Domain<B::DomainData>,
    mem: &'a dyn HostMemProtect,
    gather: IotlbGather,
    cache: &'a mut PaddrCache,
    /// An invalidation covering cached ranges failed since the last flush.
    sync_failed: bool,
}

impl<B: IommuBackend> UnmapWalk<'_, B> {
    fn sync_gather(&mut self) {
        let (backend, domain) = (self.backend, self.domain);
        let mut failed = false;
        self.gather.sync(|g| failed |= invalidate(backend, domain, g).is_err());
        self.sync_failed |= failed;
    }

    /// Invalidate first, then release the pages behind the invalidated
    /// translations. If any invalidation failed the IOTLB may still point
    /// at them, so they stay pinned.
    fn flush(&mut self) {
        self.sync_gather();

        let mem = self.mem;
        if self.sync_failed {
            log::error!(
                "iommu: domain {}: invalidation failed, {} ranges stay pinned",
                self.domain.id(),
                self.cache.len()
            );
            self.cache.drain(|_, _| {});
            self.sync_failed = false;
            return;
        }
        self.cache.drain(|paddr, size| {
            if let Err(err) = mem.host_unuse_dma(paddr, size) {
                log::warn!("iommu: unuse {:#x}+{:#x} failed: {}", paddr, size, err);
            }
        });
    }
}

impl<B: IommuBackend> UnmapVisitor for UnmapWalk<'_, B> {
    fn add_page(&mut self, iova: u64, size: usize) {
        let (backend, domain) = (self.backend, self.domain);
        let mut failed = false;
        self.gather
            .add_page(iova, size, |g| failed |= invalidate(backend, domain, g).is_err());
        self.sync_failed |= failed;
    }

    fn visit_leaf(&mut self, paddr: u64, size: usize) {
        self.cache.push(paddr, size);
        if self.cache.is_full() {
            self.flush();
        }
    }
}

impl<B: IommuBackend> Iommu<B> {
    /// Map `pgcount` pages of `pgsize` at `iova` to `paddr`.
    ///
    /// Returns the number of bytes mapped; anything short of
    /// `pgsize * pgcount` is a partial map the host must finish or undo,
    /// and 0 means nothing was mapped.
    pub fn map_pages(
        &self,
        domain_id: u32,
        iova: u64,
        paddr: u64,
        pgsize: usize,
        pgcount: usize,
        prot: IommuProt,
    ) -> usize {
        if !self.is_ready() || pgsize == 0 || pgcount == 0 {
            return 0;
        }
        if IommuProt::from_bits(prot.bits()).is_none() {
            log::warn!("iommu: unknown prot bits {:#x}", prot.bits());
            return 0;
        }
        let Some(size) = pgsize.checked_mul(pgcount) else {
            return 0;
        };
        if iova.checked_add(size as u64).is_none() || paddr.checked_add(size as u64).is_none() {
            return 0;
        }

        let Some(domain) = self.domains.lookup(domain_id) else {
            return 0;
        };
        if domain.get().is_err() {
            return 0;
        }
        let mapped = self.map_pinned(domain, iova, paddr, pgsize, pgcount, prot);
        domain.put();
        mapped
    }

    fn map_pinned(
        &self,
        domain: &Domain<B::DomainData>,
        mut iova: u64,
        mut paddr: u64,
        pgsize: usize,
        mut pgcount: usize,
        prot: IommuProt,
    ) -> usize {
        let Some(pgtable) = domain.pgtable() else {
            return 0;
        };
        let granule = pgtable.cfg().granule() as u64;
        if (iova | paddr | pgsize as u64) % granule != 0 {
            return 0;
        }

        let size = pgsize * pgcount;
        if self.mem.host_use_dma(paddr, size).is_err() {
            return 0;
        }

        let mut total = 0;
        while pgcount > 0 {
            let mapped = pgtable.map_pages(iova, paddr, pgsize, pgcount, prot);
            if mapped % pgsize != 0 || mapped > pgcount * pgsize {
                log::warn!("iommu: page table mapped {:#x} of {:#x}", mapped, pgcount * pgsize);
            }
            let pages = (mapped / pgsize).min(pgcount);
            if pages == 0 {
                break;
            }
            let bytes = pages * pgsize;
            pgcount -= pages;
            total += bytes;
            iova += bytes as u64;
            paddr += bytes as u64;
        }

        // Release the unmapped tail; the host either retries the rest or
        // unmaps what was done.
        if pgcount > 0 {
            if let Err(err) = self.mem.host_unuse_dma(paddr, pgcount * pgsize) {
                log::warn!("iommu: unuse tail {:#x} failed: {}", paddr, err);
            }
        }
        total
    }

    /// Physical address `iova` translates to in `domain_id`, 0 if none.
    pub fn iova_to_phys(&self, domain_id: u32, iova: u64) -> u64 {
        if !self.is_ready() {
            return 0;
        }
        let Some(domain) = self.domains.lookup(domain_id) else {
            return 0;
        };
        if domain.get().is_err() {
            return 0;
        }
        let phys = domain.pgtable().map_or(0, |pgtable| pgtable.iova_to_phys(iova));
        domain.put();
        phys
    }
}

impl<B: IommuBackend> IommuCpu<'_, B> {
    /// Unmap `pgcount` pages of `pgsize` at `iova`; returns bytes unmapped.
    pub fn unmap_pages(&self, domain_id: u32, iova: u64, pgsize: usize, pgcount: usize) -> usize {
        let iommu = self.iommu;
        if !iommu.is_ready() || pgsize == 0 || pgcount == 0 {
            return 0;
        }
        let Some(size) = pgsize.checked_mul(pgcount) else {
            return 0;
        };
        if iova.checked_add(size as u64).is_none() {
            return 0;
        }

        let Some(domain) = iommu.domains.lookup(domain_id) else {
            return 0;
        };
        if domain.get().is_err() {
            return 0;
        }
        let unmapped = self.unmap_pinned(domain, iova, pgsize, pgcount);
        domain.put();
        unmapped
    }

    fn unmap_pinned(
        &self,
        domain: &Domain<B::DomainData>,
        mut iova: u64,
        pgsize: usize,
        mut pgcount: usize,
    ) -> usize {
        let iommu = self.iommu;
        let Some(pgtable) = domain.pgtable() else {
            return 0;
        };
        let granule = pgtable.cfg().granule() as u64;
        if (iova | pgsize as u64) % granule != 0 {
            return 0;
        }

        let size = pgsize * pgcount;
        let mut cache = iommu.unmap_cache.get(self.cpu);
        let mut walk = UnmapWalk {
            backend: &iommu.backend,
            domain,
            mem: iommu.mem,
            gather: IotlbGather::new(),
            cache: &mut *cache,
            sync_failed: false,
        };

        let mut total = 0;
        while total < size {
            let chunk = pgcount.min(UNMAP_CACHE_MAX);
            let unmapped = pgtable.unmap_pages_walk(iova, pgsize, chunk, &mut walk);
            walk.flush();
            if unmapped == 0 {
                break;
            }
            iova += unmapped as u64;
            total += unmapped;
            pgcount = pgcount.saturating_sub(unmapped / pgsize);
        }
        total
    }
}
