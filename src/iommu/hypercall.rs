//! Host-facing IOMMU calls
//!
//! The host issues these as SMCCC fast calls from the vendor hypervisor
//! service range. Arguments arrive in x1..x6; the result goes back in x1 as
//! a negative errno, a byte count or a physical address.

use super::ops::{IommuBackend, IommuProt};
use super::IommuCpu;
use crate::error::{IommuError, Result};

// SMCCC 64-bit fast calls, vendor hypervisor service owner.
pub const HVC_IOMMU_ALLOC_DOMAIN: u64 = 0xC600_0040;
pub const HVC_IOMMU_FREE_DOMAIN: u64 = 0xC600_0041;
pub const HVC_IOMMU_ATTACH_DEV: u64 = 0xC600_0042;
pub const HVC_IOMMU_DETACH_DEV: u64 = 0xC600_0043;
pub const HVC_IOMMU_MAP_PAGES: u64 = 0xC600_0044;
pub const HVC_IOMMU_UNMAP_PAGES: u64 = 0xC600_0045;
pub const HVC_IOMMU_IOVA_TO_PHYS: u64 = 0xC600_0046;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCall {
    AllocDomain {
        domain_id: u32,
        domain_type: u32,
    },
    FreeDomain {
        domain_id: u32,
    },
    AttachDev {
        iommu_id: u32,
        domain_id: u32,
        sid: u32,
        pasid: u32,
        pasid_bits: u32,
    },
    DetachDev {
        iommu_id: u32,
        domain_id: u32,
        sid: u32,
        pasid: u32,
    },
    MapPages {
        domain_id: u32,
        iova: u64,
        paddr: u64,
        pgsize: usize,
        pgcount: usize,
        prot: u32,
    },
    UnmapPages {
        domain_id: u32,
        iova: u64,
        pgsize: usize,
        pgcount: usize,
    },
    IovaToPhys {
        domain_id: u32,
        iova: u64,
    },
}

fn arg32(val: u64) -> Result<u32> {
    u32::try_from(val).map_err(|_| IommuError::InvalidArgument)
}

fn arg_size(val: u64) -> Result<usize> {
    usize::try_from(val).map_err(|_| IommuError::InvalidArgument)
}

impl HostCall {
    pub fn is_iommu_call(func_id: u64) -> bool {
        (HVC_IOMMU_ALLOC_DOMAIN..=HVC_IOMMU_IOVA_TO_PHYS).contains(&func_id)
    }

    /// Decode a call from the host's x0 and x1..x6.
    pub fn decode(func_id: u64, args: &[u64; 6]) -> Result<Self> {
        let call = match func_id {
            HVC_IOMMU_ALLOC_DOMAIN => HostCall::AllocDomain {
                domain_id: arg32(args[0])?,
                domain_type: arg32(args[1])?,
            },
            HVC_IOMMU_FREE_DOMAIN => HostCall::FreeDomain {
                domain_id: arg32(args[0])?,
            },
            HVC_IOMMU_ATTACH_DEV => HostCall::AttachDev {
                iommu_id: arg32(args[0])?,
                domain_id: arg32(args[1])?,
                sid: arg32(args[2])?,
                pasid: arg32(args[3])?,
                pasid_bits: arg32(args[4])?,
            },
            HVC_IOMMU_DETACH_DEV => HostCall::DetachDev {
                iommu_id: arg32(args[0])?,
                domain_id: arg32(args[1])?,
                sid: arg32(args[2])?,
                pasid: arg32(args[3])?,
            },
            HVC_IOMMU_MAP_PAGES => HostCall::MapPages {
                domain_id: arg32(args[0])?,
                iova: args[1],
                paddr: args[2],
                pgsize: arg_size(args[3])?,
                pgcount: arg_size(args[4])?,
                prot: arg32(args[5])?,
            },
            HVC_IOMMU_UNMAP_PAGES => HostCall::UnmapPages {
                domain_id: arg32(args[0])?,
                iova: args[1],
                pgsize: arg_size(args[2])?,
                pgcount: arg_size(args[3])?,
            },
            HVC_IOMMU_IOVA_TO_PHYS => HostCall::IovaToPhys {
                domain_id: arg32(args[0])?,
                iova: args[1],
            },
            _ => return Err(IommuError::InvalidArgument),
        };
        Ok(call)
    }
}

fn status(ret: Result<()>) -> i64 {
    match ret {
        Ok(()) => 0,
        Err(err) => err.to_errno() as i64,
    }
}

impl<B: IommuBackend> IommuCpu<'_, B> {
    /// Run a decoded host call and produce the value returned in x1.
    pub fn handle_host_call(&self, call: HostCall) -> i64 {
        let iommu = self.iommu();
        match call {
            HostCall::AllocDomain {
                domain_id,
                domain_type,
            } => status(self.alloc_domain(domain_id, domain_type)),
            HostCall::FreeDomain { domain_id } => status(iommu.free_domain(domain_id)),
            HostCall::AttachDev {
                iommu_id,
                domain_id,
                sid,
                pasid,
                pasid_bits,
            } => status(self.attach_dev(iommu_id, domain_id, sid, pasid, pasid_bits)),
            HostCall::DetachDev {
                iommu_id,
                domain_id,
                sid,
                pasid,
            } => status(iommu.detach_dev(iommu_id, domain_id, sid, pasid)),
            HostCall::MapPages {
                domain_id,
                iova,
                paddr,
                pgsize,
                pgcount,
                prot,
            } => iommu.map_pages(
                domain_id,
                iova,
                paddr,
                pgsize,
                pgcount,
                IommuProt::from_bits_retain(prot),
            ) as i64,
            HostCall::UnmapPages {
                domain_id,
                iova,
                pgsize,
                pgcount,
            } => self.unmap_pages(domain_id, iova, pgsize, pgcount) as i64,
            HostCall::IovaToPhys { domain_id, iova } => iommu.iova_to_phys(domain_id, iova) as i64,
        }
    }
}
