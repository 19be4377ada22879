//! Interfaces between the IOMMU core, its hardware backend and the rest of
//! the hypervisor.
//!
//! The core never touches page-table memory or page ownership directly; it
//! goes through [`IoPgtable`] and [`HostMemProtect`]. Hardware specifics
//! live behind [`IommuBackend`].

use bitflags::bitflags;

use super::domain::{Domain, DomainState};
use super::gather::IotlbGather;
use super::power::{HypIommu, IommuState};
use crate::config::IommuConfig;
use crate::error::Result;
use crate::mm::PageAllocator;

bitflags! {
    /// IOMMU mapping protections (values shared with the host driver).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IommuProt: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const CACHE = 1 << 2;
        const NOEXEC = 1 << 3;
        const MMIO = 1 << 4;
        const PRIV = 1 << 5;
    }
}

/// Host stage-2 protection classes forwarded to the identity domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostProt {
    /// Unmapped from the host.
    None,
    /// Normal memory owned by the host.
    Mem,
    /// Device memory owned by the host.
    Mmio,
}

impl HostProt {
    pub const fn to_iommu(self) -> IommuProt {
        match self {
            HostProt::None => IommuProt::empty(),
            HostProt::Mem => IommuProt::READ.union(IommuProt::WRITE),
            HostProt::Mmio => IommuProt::READ.union(IommuProt::WRITE).union(IommuProt::MMIO),
        }
    }
}

bitflags! {
    /// Optional backend entry points. Required ones are trait methods
    /// without a default and are always present.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Caps: u32 {
        const INIT = 1 << 0;
        const IOTLB_SYNC = 1 << 1;
        const HOST_STAGE2_IDMAP = 1 << 2;
        const DABT_HANDLER = 1 << 3;
        const SUSPEND = 1 << 4;
        const RESUME = 1 << 5;
    }
}

/// Stage-2 translation control values the page table was built for, in
/// VTCR_EL2 field encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VtcrCfg {
    pub ps: u8,
    pub tg: u8,
    pub sh: u8,
    pub orgn: u8,
    pub irgn: u8,
    pub sl: u8,
    pub tsz: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoPgtableCfg {
    /// Supported page and block sizes, one bit per size.
    pub pgsize_bitmap: u64,
    /// Input address size in bits.
    pub ias: u32,
    /// Output address size in bits.
    pub oas: u32,
    /// Table walks snoop CPU caches.
    pub coherent_walk: bool,
    pub vtcr: VtcrCfg,
    /// Root table address in VTTBR format. Filled in by the allocator.
    pub vttbr: u64,
}

impl IoPgtableCfg {
    /// Smallest supported page size.
    pub const fn granule(&self) -> usize {
        1usize << self.pgsize_bitmap.trailing_zeros()
    }
}

/// Callbacks from a page-table walk that removes leaves.
///
/// For each leaf the walker calls `add_page` before `visit_leaf`.
pub trait UnmapVisitor {
    /// A leaf covering `iova..iova + size` was removed from the table.
    fn add_page(&mut self, iova: u64, size: usize);
    /// The removed leaf pointed at `paddr..paddr + size`.
    fn visit_leaf(&mut self, paddr: u64, size: usize);
}

/// A finalized IO page table. Implementations report partial progress
/// instead of failing.
pub trait IoPgtable: Sync {
    fn cfg(&self) -> &IoPgtableCfg;

    /// Map up to `pgcount` pages; returns bytes mapped.
    fn map_pages(&self, iova: u64, paddr: u64, pgsize: usize, pgcount: usize, prot: IommuProt)
        -> usize;

    /// Unmap up to `pgcount` pages, reporting each removed leaf to
    /// `visitor`; returns bytes unmapped.
    fn unmap_pages_walk(
        &self,
        iova: u64,
        pgsize: usize,
        pgcount: usize,
        visitor: &mut dyn UnmapVisitor,
    ) -> usize;

    /// 0 if `iova` is not mapped.
    fn iova_to_phys(&self, iova: u64) -> u64;
}

pub trait IoPgtableAlloc: Sync {
    fn alloc(&self, cfg: &IoPgtableCfg, domain_id: u32) -> Result<&'static dyn IoPgtable>;
    fn free(&self, pgtable: &'static dyn IoPgtable);
}

/// Page ownership transitions between host and hypervisor.
pub trait HostMemProtect: Sync {
    /// Pin host pages for DMA.
    fn host_use_dma(&self, phys: u64, size: usize) -> Result<()>;
    fn host_unuse_dma(&self, phys: u64, size: usize) -> Result<()>;
    /// Move pages from the host to the hypervisor.
    fn host_donate_hyp(&self, phys: u64, size: usize, accept_mmio: bool) -> Result<()>;
    /// Give hypervisor pages back to the host.
    fn host_reclaim(&self, phys: u64, size: usize) -> Result<()>;
}

/// Host stage-2 leaf, as replayed into the identity domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostRegion {
    pub start: u64,
    pub end: u64,
    pub prot: HostProt,
}

/// One IOMMU hardware family.
///
/// Required entry points have no default. Optional ones are declared in
/// [`IommuBackend::caps`]; the core only calls those that are declared.
pub trait IommuBackend: Sync {
    /// Backend state stored in each domain record.
    type DomainData: Send;
    /// Per-device state, kept under the device lock.
    type Device: Send;

    fn caps(&self) -> Caps;

    fn init(&self, _config: &IommuConfig, _pages: &dyn PageAllocator) -> Result<()> {
        Ok(())
    }

    fn get_iommu(&self, iommu_id: u32) -> Option<&HypIommu<Self::Device>>;

    /// Fill in `state` for a newly allocated domain.
    fn alloc_domain(
        &self,
        domain_id: u32,
        domain_type: u32,
        state: &mut DomainState<Self::DomainData>,
    ) -> Result<()>;

    /// Tear down backend state. The page table, if one was finalized, is
    /// released here too.
    fn free_domain(&self, domain_id: u32, state: &mut DomainState<Self::DomainData>);

    fn attach_dev(
        &self,
        iommu: &HypIommu<Self::Device>,
        domain: &Domain<Self::DomainData>,
        sid: u32,
        pasid: u32,
        pasid_bits: u32,
        pages: &dyn PageAllocator,
    ) -> Result<()>;

    fn detach_dev(
        &self,
        iommu: &HypIommu<Self::Device>,
        domain: &Domain<Self::DomainData>,
        sid: u32,
        pasid: u32,
    ) -> Result<()>;

    /// Invalidate the range collected in `gather`. Pages behind the range
    /// are only released to the host if this succeeds.
    fn iotlb_sync(&self, _domain: &Domain<Self::DomainData>, _gather: &IotlbGather) -> Result<()> {
        Ok(())
    }

    /// Mirror a host stage-2 change into the identity domain.
    fn host_stage2_idmap(
        &self,
        _domain: &Domain<Self::DomainData>,
        _start: u64,
        _end: u64,
        _prot: IommuProt,
    ) {
    }

    /// Emulate a trapped host access to IOMMU registers.
    fn dabt_handler(&self, _regs: &mut [u64; 31], _esr: u64, _addr: u64) -> bool {
        false
    }

    /// Called with the device lock held and `power_is_off` already set.
    fn suspend(
        &self,
        _iommu: &HypIommu<Self::Device>,
        _state: &mut IommuState<Self::Device>,
    ) -> Result<()> {
        Ok(())
    }

    /// Called with the device lock held and `power_is_off` already clear.
    fn resume(
        &self,
        _iommu: &HypIommu<Self::Device>,
        _state: &mut IommuState<Self::Device>,
    ) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_prot_translation() {
        assert_eq!(HostProt::None.to_iommu(), IommuProt::empty());
        assert_eq!(HostProt::Mem.to_iommu(), IommuProt::READ | IommuProt::WRITE);
        assert_eq!(
            HostProt::Mmio.to_iommu().bits(),
            0x1 | 0x2 | 0x10
        );
    }

    #[test]
    fn test_prot_rejects_unknown_bits() {
        assert!(IommuProt::from_bits(0x40).is_none());
        assert_eq!(IommuProt::all().bits(), 0x3f);
    }

    #[test]
    fn test_granule_is_lowest_page_size() {
        let cfg = IoPgtableCfg {
            pgsize_bitmap: (1 << 12) | (1 << 21) | (1 << 30),
            ..Default::default()
        };
        assert_eq!(cfg.granule(), 4096);
    }
}
