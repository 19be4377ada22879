//! Hypervisor IOMMU Constants
//!
//! Table geometry, identity-domain ids and polling bounds live here so they
//! can be changed in one place when targeting a different platform.

// ── Pages ────────────────────────────────────────────────────────────
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u64 = !(PAGE_SIZE as u64 - 1);

// ── Domain table ─────────────────────────────────────────────────────
/// Domain ids share the SMMU VMID space (16 bits).
pub const MAX_DOMAINS: u32 = 1 << 16;
/// Records per leaf page of the domain table.
pub const DOMAINS_PER_LEAF: usize = 64;
/// Upper bound on `size_of::<Domain<_>>()` so a leaf fits in one page.
pub const DOMAIN_RECORD_MAX: usize = PAGE_SIZE / DOMAINS_PER_LEAF;
pub const DOMAIN_ROOT_ENTRIES: usize = MAX_DOMAINS as usize / DOMAINS_PER_LEAF;

/// Domain the host attaches to get the same mapping as its CPU stage-2.
pub const DOMAIN_IDMAP_ID: u32 = 0;
/// `alloc_domain` type argument for the identity domain.
pub const DOMAIN_IDMAP_TYPE: u32 = 0;

// ── Unmap path ───────────────────────────────────────────────────────
/// Capacity of the per-core cache of unmapped physical ranges.
pub const UNMAP_CACHE_MAX: usize = 511;

// ── Hardware polling ─────────────────────────────────────────────────
/// 100ms arbitrary timeout, counted in 1us steps.
pub const POLL_TIMEOUT_US: u32 = 100_000;

// ── CPUs ─────────────────────────────────────────────────────────────
pub const SMP_CPUS: usize = 8;

// ── Page pools ───────────────────────────────────────────────────────
/// Largest number of pages the atomic (identity-domain) pool will hold.
pub const ATOMIC_POOL_MAX_PAGES: usize = 64;

/// Runtime knobs handed to [`crate::iommu::Iommu::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IommuConfig {
    /// Bound on every hardware poll, in microseconds.
    pub poll_timeout_us: u32,
    /// Whether the identity domain is created during init.
    pub idmap: bool,
}

impl IommuConfig {
    pub const fn new() -> Self {
        Self {
            poll_timeout_us: POLL_TIMEOUT_US,
            idmap: true,
        }
    }

    pub const fn with_poll_timeout(mut self, us: u32) -> Self {
        self.poll_timeout_us = us;
        self
    }

    pub const fn without_idmap(mut self) -> Self {
        self.idmap = false;
        self
    }
}

impl Default for IommuConfig {
    fn default() -> Self {
        Self::new()
    }
}
