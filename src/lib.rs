#![cfg_attr(not(test), no_std)]

//! IOMMU management for a protected hypervisor.
//!
//! The host kernel keeps driving its IOMMUs, but every change that affects
//! what a device may reach goes through the hypervisor: domains and their
//! page tables live here, pages are pinned before they are mapped and only
//! handed back once the IOTLB has forgotten them, and the SMMU's command
//! queue and stream table are owned by EL2.
//!
//! - [`iommu`]: domain table, lifecycle, map/unmap engine, host call surface
//! - [`smmu_v3`]: Arm SMMUv3 backend
//! - [`mm`]: metadata page pools and the per-core memory request mailbox

pub mod arch;
pub mod config;
pub mod dtb;
pub mod error;
pub mod iommu;
pub mod logger;
pub mod mm;
pub mod mmio;
pub mod percpu;
pub mod smmu_v3;
pub mod sync;

pub use config::IommuConfig;
pub use error::{IommuError, Result};
pub use iommu::{Iommu, IommuBackend, IommuCpu};
pub use percpu::CpuId;
pub use smmu_v3::{SmmuDevice, SmmuDomain, SmmuV3};
