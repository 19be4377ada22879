//! Per-core request mailbox
//!
//! When a pool runs dry the hypervisor cannot allocate on its own; instead it
//! leaves a [`HypRequest`] in the current core's slot and fails the call with
//! `OutOfMemory`. The host drains the slot on return, donates memory, and
//! retries.

use crate::config::PAGE_SIZE;
use crate::error::{IommuError, Result};

/// Which allocator the host should feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemDest {
    /// The IOMMU host pool (`Iommu::refill`).
    HypIommu,
    /// The hypervisor's general allocator, used by backend driver state.
    HypAlloc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRequest {
    pub dest: MemDest,
    /// Size of each allocation, in bytes.
    pub sz_alloc: usize,
    pub nr_pages: usize,
}

impl MemRequest {
    /// One page for the IOMMU pool.
    pub const fn iommu_page() -> Self {
        Self {
            dest: MemDest::HypIommu,
            sz_alloc: PAGE_SIZE,
            nr_pages: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HypRequest {
    /// No pending request.
    #[default]
    None,
    Mem(MemRequest),
}

impl HypRequest {
    pub fn is_pending(&self) -> bool {
        !matches!(self, HypRequest::None)
    }

    /// Store `req` if the slot is free. A pending request is never
    /// overwritten; the host has to consume it first.
    pub fn post(&mut self, req: HypRequest) -> Result<()> {
        if self.is_pending() {
            return Err(IommuError::Busy);
        }
        *self = req;
        Ok(())
    }

    /// Consume the pending request, leaving the slot empty.
    pub fn take(&mut self) -> HypRequest {
        core::mem::take(self)
    }
}
