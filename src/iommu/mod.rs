//! Hypervisor IOMMU core
//!
//! Owns the domain table, the metadata page pools and the per-core state
//! used by the host-facing IOMMU calls. Hardware is reached through an
//! [`IommuBackend`].
//!
//! Locking:
//! - `domains_lock` serializes alloc/free/attach/detach
//! - map/unmap/iova_to_phys run without it and hold a domain reference
//! - each device has its own lock for queue and stream-table updates

pub mod domain;
pub mod gather;
pub mod hypercall;
pub mod mapping;
pub mod ops;
pub mod power;

pub use domain::{Domain, DomainState, DomainTable};
pub use gather::IotlbGather;
pub use hypercall::HostCall;
pub use mapping::PaddrCache;
pub use ops::{
    Caps, HostMemProtect, HostProt, HostRegion, IoPgtable, IoPgtableAlloc, IoPgtableCfg,
    IommuBackend, IommuProt, UnmapVisitor, VtcrCfg,
};
pub use power::{HypIommu, IommuState, PowerDomain};

use core::sync::atomic::{AtomicBool, Ordering};

use crate::config::{
    IommuConfig, ATOMIC_POOL_MAX_PAGES, DOMAIN_IDMAP_ID, DOMAIN_IDMAP_TYPE, MAX_DOMAINS,
    PAGE_SIZE,
};
use crate::error::{IommuError, Result};
use crate::mm::{HypRequest, MemRequest, PageAllocator, PagePool};
use crate::percpu::{CpuId, PerCpu};
use crate::sync::SpinLock;

pub struct Iommu<B: IommuBackend> {
    backend: B,
    mem: &'static dyn HostMemProtect,
    config: IommuConfig,
    domains: DomainTable<B::DomainData>,
    domains_lock: SpinLock<()>,
    host_pool: PagePool,
    atomic_pool: PagePool,
    requests: PerCpu<HypRequest>,
    unmap_cache: PerCpu<PaddrCache>,
    ready: AtomicBool,
    idmap_ready: AtomicBool,
}

impl<B: IommuBackend> Iommu<B> {
    /// Register `backend`. Fails if its optional entry points do not cover
    /// what `config` asks for.
    pub fn new(backend: B, mem: &'static dyn HostMemProtect, config: IommuConfig) -> Result<Self> {
        let caps = backend.caps();
        if caps.contains(Caps::SUSPEND) != caps.contains(Caps::RESUME) {
            log::error!("iommu: backend must provide both suspend and resume");
            return Err(IommuError::InvalidArgument);
        }
        if config.idmap && !caps.contains(Caps::HOST_STAGE2_IDMAP) {
            log::error!("iommu: identity domain requested but backend cannot follow host stage-2");
            return Err(IommuError::InvalidArgument);
        }

        Ok(Self {
            backend,
            mem,
            config,
            domains: DomainTable::new(),
            domains_lock: SpinLock::new(()),
            host_pool: PagePool::new(),
            atomic_pool: PagePool::new(),
            requests: PerCpu::default(),
            unmap_cache: PerCpu::default(),
            ready: AtomicBool::new(false),
            idmap_ready: AtomicBool::new(false),
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &IommuConfig {
        &self.config
    }

    /// Per-core view for calls that use per-core state.
    pub fn on_cpu(&self, cpu: CpuId) -> IommuCpu<'_, B> {
        IommuCpu { iommu: self, cpu }
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Domain record for `domain_id`, if its leaf exists.
    pub fn domain(&self, domain_id: u32) -> Option<&Domain<B::DomainData>> {
        self.domains.lookup(domain_id)
    }

    pub fn free_domain(&self, domain_id: u32) -> Result<()> {
        let _guard = self.domains_lock.lock();
        let domain = self
            .domains
            .lookup(domain_id)
            .ok_or(IommuError::InvalidArgument)?;

        if !domain.try_release() {
            // Still attached somewhere, or never allocated
            log::warn!(
                "iommu: free of domain {} with refs {}",
                domain_id,
                domain.refs()
            );
            return Err(if domain.refs() == 0 {
                IommuError::InvalidArgument
            } else {
                IommuError::Busy
            });
        }

        self.backend.free_domain(domain_id, &mut domain.state());
        domain.reset();
        Ok(())
    }

    pub fn detach_dev(&self, iommu_id: u32, domain_id: u32, sid: u32, pasid: u32) -> Result<()> {
        let iommu = self.backend.get_iommu(iommu_id).ok_or(IommuError::NotFound)?;

        let _guard = self.domains_lock.lock();
        let domain = self
            .domains
            .lookup(domain_id)
            .ok_or(IommuError::InvalidArgument)?;
        if domain.refs() <= 1 {
            log::warn!("iommu: detach from unattached domain {}", domain_id);
            return Err(IommuError::InvalidArgument);
        }

        self.backend.detach_dev(iommu, domain, sid, pasid)?;
        domain.put();
        Ok(())
    }

    /// Take pages donated by the host into the metadata pool.
    pub fn refill(&self, pages: &[u64]) -> Result<()> {
        if !self.is_ready() {
            return Err(IommuError::InvalidArgument);
        }
        fill_pool(&self.host_pool, self.mem, pages)
    }

    /// Hand up to `target` free pool pages back to the host.
    pub fn reclaim(&self, target: usize, mut give_back: impl FnMut(u64)) -> usize {
        if !self.is_ready() {
            return 0;
        }
        let mem = self.mem;
        self.host_pool.reclaim(target, |phys| {
            if let Err(err) = mem.host_reclaim(phys, PAGE_SIZE) {
                log::error!("iommu: reclaim of {:#x} failed: {}", phys, err);
            }
            give_back(phys)
        })
    }

    pub fn reclaimable(&self) -> usize {
        if !self.is_ready() {
            return 0;
        }
        self.host_pool.free_pages()
    }

    pub fn is_idmap_ready(&self) -> bool {
        self.idmap_ready.load(Ordering::Acquire)
    }

    /// Replay the host stage-2 into the identity domain, then start
    /// following live changes.
    ///
    /// The caller holds the host stage-2 lock across this call so no change
    /// is missed between the walk and going live.
    pub fn snapshot_host_stage2(&self, regions: impl IntoIterator<Item = HostRegion>) -> Result<()> {
        if !self.backend.caps().contains(Caps::HOST_STAGE2_IDMAP) {
            return Err(IommuError::InvalidArgument);
        }
        let domain = self
            .domains
            .lookup(DOMAIN_IDMAP_ID)
            .filter(|d| d.refs() > 0)
            .ok_or(IommuError::InvalidArgument)?;

        for region in regions {
            if region.start >= region.end {
                return Err(IommuError::InvalidArgument);
            }
            self.backend
                .host_stage2_idmap(domain, region.start, region.end, region.prot.to_iommu());
        }
        self.idmap_ready.store(true, Ordering::Release);
        log::info!("iommu: identity domain live");
        Ok(())
    }

    /// Host stage-2 changed `start..end` to `prot`.
    pub fn host_stage2_idmap(&self, start: u64, end: u64, prot: HostProt) {
        if !self.is_idmap_ready() {
            return;
        }
        if let Some(domain) = self.domains.lookup(DOMAIN_IDMAP_ID) {
            self.backend
                .host_stage2_idmap(domain, start, end, prot.to_iommu());
        }
    }

    /// Host data abort on an address the hypervisor took from it. Returns
    /// true if the access was emulated and the instruction can be skipped.
    pub fn host_dabt_handler(&self, regs: &mut [u64; 31], esr: u64, addr: u64) -> bool {
        self.backend.caps().contains(Caps::DABT_HANDLER)
            && self.backend.dabt_handler(regs, esr, addr)
    }

    pub fn power_on(&self, iommu_id: u32) -> Result<()> {
        let iommu = self.backend.get_iommu(iommu_id).ok_or(IommuError::NotFound)?;
        power::set_power(&self.backend, iommu, false)
    }

    pub fn power_off(&self, iommu_id: u32) -> Result<()> {
        let iommu = self.backend.get_iommu(iommu_id).ok_or(IommuError::NotFound)?;
        power::set_power(&self.backend, iommu, true)
    }
}

fn fill_pool(pool: &PagePool, mem: &dyn HostMemProtect, pages: &[u64]) -> Result<()> {
    for &phys in pages {
        if phys % PAGE_SIZE as u64 != 0 {
            return Err(IommuError::InvalidArgument);
        }
        mem.host_donate_hyp(phys, PAGE_SIZE, false)?;
        // SAFETY: the page was just donated to the hypervisor.
        unsafe { pool.refill_page(phys) };
    }
    Ok(())
}

/// Host pool allocations from one core. Exhaustion leaves a memory
/// request in that core's mailbox.
struct RequestingPool<'a> {
    pool: &'a PagePool,
    requests: &'a PerCpu<HypRequest>,
    cpu: CpuId,
}

impl PageAllocator for RequestingPool<'_> {
    fn alloc_page(&self) -> Option<u64> {
        let page = self.pool.alloc_page();
        if page.is_none() {
            let mut slot = self.requests.get(self.cpu);
            if slot.post(HypRequest::Mem(MemRequest::iommu_page())).is_err() {
                log::debug!("iommu: cpu{} already has a pending request", self.cpu.index());
            }
        }
        page
    }

    fn free_page(&self, phys: u64) {
        self.pool.free_page(phys)
    }
}

/// [`Iommu`] bound to the calling core.
pub struct IommuCpu<'a, B: IommuBackend> {
    iommu: &'a Iommu<B>,
    cpu: CpuId,
}

impl<'a, B: IommuBackend> IommuCpu<'a, B> {
    pub fn iommu(&self) -> &'a Iommu<B> {
        self.iommu
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    fn host_pages(&self) -> RequestingPool<'a> {
        RequestingPool {
            pool: &self.iommu.host_pool,
            requests: &self.iommu.requests,
            cpu: self.cpu,
        }
    }

    /// Bring up the backend and, if configured and `atomic_pages` were
    /// given, the identity domain.
    pub fn init(&self, atomic_pages: &[u64]) -> Result<()> {
        let iommu = self.iommu;
        if iommu.is_ready() {
            return Err(IommuError::Busy);
        }
        if iommu.backend.caps().contains(Caps::INIT) {
            iommu.backend.init(&iommu.config, &self.host_pages())?;
        }
        iommu.ready.store(true, Ordering::Release);

        if !iommu.config.idmap || atomic_pages.is_empty() {
            return Ok(());
        }
        if atomic_pages.len() > ATOMIC_POOL_MAX_PAGES {
            return Err(IommuError::InvalidArgument);
        }
        fill_pool(&iommu.atomic_pool, iommu.mem, atomic_pages)?;
        self.alloc_domain(DOMAIN_IDMAP_ID, DOMAIN_IDMAP_TYPE)
    }

    pub fn alloc_domain(&self, domain_id: u32, domain_type: u32) -> Result<()> {
        let iommu = self.iommu;
        if !iommu.is_ready() || domain_id >= MAX_DOMAINS {
            return Err(IommuError::InvalidArgument);
        }

        let _guard = iommu.domains_lock.lock();
        let domain = if domain_id == DOMAIN_IDMAP_ID {
            iommu.domains.lookup_or_create(domain_id, &iommu.atomic_pool)
        } else {
            iommu.domains.lookup_or_create(domain_id, &self.host_pages())
        };
        let domain = match domain {
            Some(d) if d.refs() == 0 => d,
            Some(_) => return Err(IommuError::InvalidArgument),
            None if self.has_request() => return Err(IommuError::OutOfMemory),
            None => return Err(IommuError::InvalidArgument),
        };

        domain.set_id(domain_id);
        if let Err(err) = iommu
            .backend
            .alloc_domain(domain_id, domain_type, &mut domain.state())
        {
            domain.reset();
            return Err(err);
        }
        domain.activate(domain_id);
        Ok(())
    }

    pub fn attach_dev(
        &self,
        iommu_id: u32,
        domain_id: u32,
        sid: u32,
        pasid: u32,
        pasid_bits: u32,
    ) -> Result<()> {
        let iommu = self.iommu;
        let dev = iommu
            .backend
            .get_iommu(iommu_id)
            .ok_or(IommuError::NotFound)?;

        let _guard = iommu.domains_lock.lock();
        let domain = iommu
            .domains
            .lookup(domain_id)
            .ok_or(IommuError::InvalidArgument)?;
        domain.get()?;

        let pages = self.host_pages();
        if let Err(err) = iommu
            .backend
            .attach_dev(dev, domain, sid, pasid, pasid_bits, &pages)
        {
            domain.put();
            return Err(err);
        }
        Ok(())
    }

    /// Leave `req` for the host. Busy if a request is already pending.
    pub fn request(&self, req: HypRequest) -> Result<()> {
        self.iommu.requests.get(self.cpu).post(req)
    }

    pub fn has_request(&self) -> bool {
        self.iommu.requests.get(self.cpu).is_pending()
    }

    /// Hand the pending request to the host, clearing the mailbox.
    pub fn take_request(&self) -> HypRequest {
        self.iommu.requests.get(self.cpu).take()
    }
}
