//! SMMUv3 discovery from the host DTB
//!
//! The `fdt` crate parses in place, so this works before any pool has been
//! filled. Each `arm,smmu-v3` node yields one [`SmmuDescriptor`]; the
//! platform turns those into devices in the order they are found, which is
//! also the iommu id the host uses.

use fdt::node::FdtNode;
use fdt::Fdt;

use crate::iommu::PowerDomain;

pub const SMMU_V3_COMPATIBLE: &str = "arm,smmu-v3";

/// What the DTB says about one SMMU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmmuDescriptor {
    /// Register frame (both 64K pages).
    pub base: u64,
    pub size: usize,
    /// `dma-coherent`: table walks and queues snoop CPU caches.
    pub coherent: bool,
    /// Domain index from `power-domains = <&pd N>`.
    pub power_domain_id: Option<u32>,
}

impl SmmuDescriptor {
    /// Devices in a power domain are switched by the host, which reports
    /// each transition with a hypercall.
    pub fn power_domain(&self) -> PowerDomain {
        match self.power_domain_id {
            Some(_) => PowerDomain::HostHvc,
            None => PowerDomain::None,
        }
    }

    fn from_node(node: &FdtNode) -> Option<Self> {
        let reg = node.reg()?.next()?;
        let power_domain_id = node
            .property("power-domains")
            .and_then(|prop| prop.value.get(4..8))
            .and_then(|cell| cell.try_into().ok())
            .map(u32::from_be_bytes);
        Some(Self {
            base: reg.starting_address as u64,
            size: reg.size?,
            coherent: node.property("dma-coherent").is_some(),
            power_domain_id,
        })
    }
}

fn is_smmu_v3(node: &FdtNode) -> bool {
    node.compatible()
        .map_or(false, |compat| compat.all().any(|c| c == SMMU_V3_COMPATIBLE))
}

/// All usable SMMUv3 nodes. Nodes without a sized `reg` are skipped.
pub fn smmu_descriptors<'b, 'a: 'b>(fdt: &'b Fdt<'a>) -> impl Iterator<Item = SmmuDescriptor> + 'b {
    fdt.all_nodes().filter(is_smmu_v3).filter_map(|node| {
        let desc = SmmuDescriptor::from_node(&node);
        if desc.is_none() {
            log::warn!("dtb: {} has no usable reg", node.name);
        }
        desc
    })
}

/// Parse the blob at `addr`.
///
/// # Safety
/// `addr` must point at a complete flattened device tree that stays mapped
/// and unmodified for `'static`.
pub unsafe fn from_addr(addr: usize) -> Option<Fdt<'static>> {
    if addr == 0 {
        return None;
    }
    Fdt::from_ptr(addr as *const u8).ok()
}
