//! Arm SMMUv3 backend
//!
//! The host driver probes the SMMU, allocates its command queue and stream
//! table, and hands the device to the hypervisor before enabling it. From
//! then on the hypervisor owns the register frame, the queue and the table:
//! every configuration change and every TLB invalidation goes through the
//! command queue below, under the device lock.
//!
//! Only stage-2 translation is used. The domain id doubles as the VMID.

pub mod cmdq;
pub mod regs;
pub mod strtab;

use cmdq::{Cmdq, Command, TlbiRange};
use regs::{
    Cr0, Gerror, Idr0, QueueBase, StrtabCfg, CMDQ_BASE, CMDQ_CONS, CMDQ_PROD, CR0, CR0ACK, CR1,
    CR2, CR2_PTM, EVTQ_CONS, EVTQ_PROD, GBPA, GBPA_ABORT, GERROR, GERRORN, IDR0, IDR3, IDR3_RIL,
    STRTAB_BASE, STRTAB_BASE_CFG,
};
use strtab::{Ste, Strtab};

use crate::arch::esr::DataAbort;
use crate::arch::{index_nospec, mb, udelay, wfe};
use crate::config::{IommuConfig, DOMAIN_IDMAP_ID, PAGE_SIZE, POLL_TIMEOUT_US};
use crate::error::{IommuError, Result};
use crate::iommu::{
    Caps, Domain, DomainState, HostMemProtect, HypIommu, IoPgtable, IoPgtableAlloc, IoPgtableCfg,
    IommuBackend, IommuProt, IommuState, IotlbGather, PowerDomain, UnmapVisitor,
};
use crate::mm::{pages_for, phys_to_virt, PageAllocator};
use crate::mmio::RegisterIo;

/// One SMMU, protected by the [`HypIommu`] device lock.
pub struct SmmuDevice<R> {
    regs: R,
    mmio_addr: u64,
    mmio_size: usize,
    features: Idr0,
    range_inv: bool,
    cmdq: Cmdq,
    strtab: Strtab,
    /// TLBs and configuration caches come up empty after a power cycle, so
    /// invalidations can be skipped while the SMMU is off.
    caches_clean_on_power_on: bool,
    /// Service failure seen; no further commands are issued.
    failed: bool,
    poll_timeout_us: u32,
}

impl<R: RegisterIo> SmmuDevice<R> {
    pub const fn new(regs: R, mmio_addr: u64, mmio_size: usize, caches_clean_on_power_on: bool) -> Self {
        Self {
            regs,
            mmio_addr,
            mmio_size,
            features: Idr0::empty(),
            range_inv: false,
            cmdq: Cmdq::empty(),
            strtab: Strtab::empty(),
            caches_clean_on_power_on,
            failed: false,
            poll_timeout_us: POLL_TIMEOUT_US,
        }
    }

    pub fn regs(&self) -> &R {
        &self.regs
    }

    pub fn features(&self) -> Idr0 {
        self.features
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn cmdq(&self) -> &Cmdq {
        &self.cmdq
    }

    pub fn strtab(&self) -> &Strtab {
        &self.strtab
    }

    fn contains(&self, addr: u64) -> bool {
        addr >= self.mmio_addr && addr - self.mmio_addr < self.mmio_size as u64
    }

    /// Wait for `cond`, at most `poll_timeout_us` steps of 1us (or one WFE
    /// each when `use_wfe`).
    fn wait(&mut self, use_wfe: bool, mut cond: impl FnMut(&Self) -> bool) -> Result<()> {
        let mut steps = 0;
        while !cond(&*self) {
            if steps >= self.poll_timeout_us {
                return Err(self.timeout_error());
            }
            if use_wfe {
                wfe();
            } else {
                udelay(1);
            }
            steps += 1;
        }
        Ok(())
    }

    /// Tell a stalled SMMU from a dead one.
    fn timeout_error(&mut self) -> IommuError {
        let active = Gerror::active(self.regs.read32(GERROR), self.regs.read32(GERRORN));
        if active.contains(Gerror::SFM_ERR) {
            log::error!("smmu@{:#x}: service failure mode, device disabled", self.mmio_addr);
            self.failed = true;
            IommuError::Io
        } else {
            log::warn!("smmu@{:#x}: timeout, gerror {:?}", self.mmio_addr, active);
            IommuError::Timeout
        }
    }

    fn wait_event(&mut self, cond: impl FnMut(&Self) -> bool) -> Result<()> {
        let use_wfe = self.features.contains(Idr0::SEV);
        self.wait(use_wfe, cond)
    }

    fn write_cr0(&mut self, val: Cr0) -> Result<()> {
        self.regs.write32(CR0, val.bits());
        self.wait(false, |smmu| smmu.regs.read32(CR0ACK) == val.bits())
    }

    fn cmdq_full(&self) -> bool {
        self.cmdq.is_full(self.regs.read32(CMDQ_CONS))
    }

    fn cmdq_empty(&self) -> bool {
        self.cmdq.is_empty(self.regs.read32(CMDQ_CONS))
    }

    fn init_registers(&mut self) -> Result<()> {
        if self.regs.read32(GBPA) & GBPA_ABORT == 0 {
            log::error!("smmu@{:#x}: GBPA does not abort", self.mmio_addr);
            return Err(IommuError::InvalidArgument);
        }
        self.write_cr0(Cr0::empty())?;
        self.regs.write32(CR1, regs::cr1_value());
        self.regs.write32(CR2, CR2_PTM);

        let gerror = self.regs.read32(GERROR);
        if Gerror::active(gerror, self.regs.read32(GERRORN)).contains(Gerror::SFM_ERR) {
            log::error!("smmu@{:#x}: in service failure mode", self.mmio_addr);
            return Err(IommuError::Io);
        }
        // Acknowledge stale errors
        self.regs.write32(GERRORN, gerror);
        Ok(())
    }

    fn init_cmdq(&mut self, mem: &dyn HostMemProtect) -> Result<()> {
        let base = QueueBase::decode(self.regs.read64(CMDQ_BASE))?;
        let cmdq = Cmdq::new(base.addr, base.log2size);
        if base.addr % PAGE_SIZE as u64 != 0 {
            return Err(IommuError::InvalidArgument);
        }
        mem.host_donate_hyp(base.addr, pages_for(cmdq.size_bytes()) * PAGE_SIZE, false)?;

        unsafe { core::ptr::write_bytes(phys_to_virt(base.addr), 0, cmdq.size_bytes()) };
        self.cmdq = cmdq;
        self.regs.write32(CMDQ_PROD, 0);
        self.regs.write32(CMDQ_CONS, 0);
        Ok(())
    }

    fn init_strtab(&mut self, mem: &dyn HostMemProtect) -> Result<()> {
        let cfg = StrtabCfg::decode(
            self.regs.read64(STRTAB_BASE),
            self.regs.read32(STRTAB_BASE_CFG),
        )?;
        let strtab = Strtab::new(&cfg);
        if cfg.addr % PAGE_SIZE as u64 != 0 {
            return Err(IommuError::InvalidArgument);
        }
        mem.host_donate_hyp(cfg.addr, strtab.size_pages() * PAGE_SIZE, false)?;

        // Disable every STE
        strtab.clear();
        self.strtab = strtab;
        Ok(())
    }
}

/// Queue `cmd`. The caller publishes it with [`sync`] or more commands.
fn add_cmd<R: RegisterIo>(state: &mut IommuState<SmmuDevice<R>>, cmd: &Command) -> Result<()> {
    if state.power_is_off {
        return Err(IommuError::Unavailable);
    }
    let smmu = &mut state.dev;
    if smmu.failed {
        return Err(IommuError::Io);
    }
    smmu.wait_event(|smmu| !smmu.cmdq_full())?;

    smmu.cmdq.push(cmd);
    // Entry visible before the producer update
    mb();
    smmu.regs.write32(CMDQ_PROD, smmu.cmdq.prod());
    Ok(())
}

/// Issue CMD_SYNC and wait for the queue to drain.
fn sync<R: RegisterIo>(state: &mut IommuState<SmmuDevice<R>>) -> Result<()> {
    add_cmd(state, &Command::Sync)?;
    state.dev.wait_event(|smmu| smmu.cmdq_empty())
}

fn send_cmd<R: RegisterIo>(state: &mut IommuState<SmmuDevice<R>>, cmd: &Command) -> Result<()> {
    add_cmd(state, cmd)?;
    sync(state)
}

/// Invalidations are pointless on a powered-off SMMU whose caches come up
/// clean.
fn skip_invalidation<R>(state: &IommuState<SmmuDevice<R>>) -> bool {
    state.power_is_off && state.dev.caches_clean_on_power_on
}

fn sync_ste<R: RegisterIo>(state: &mut IommuState<SmmuDevice<R>>, sid: u32) -> Result<()> {
    if skip_invalidation(state) {
        return Ok(());
    }
    send_cmd(state, &Command::CfgiSte { sid, leaf: true })
}

/// Best-effort teardown of a STE whose enable may not have been seen.
fn disable_ste<R: RegisterIo>(state: &mut IommuState<SmmuDevice<R>>, ste: &Ste, sid: u32) {
    ste.write_head(0);
    if let Err(err) = sync_ste(state, sid) {
        log::warn!("smmu: sid {} disable not acknowledged: {}", sid, err);
    }
    ste.clear_tail();
    let _ = sync_ste(state, sid);
}

fn tlb_flush_all<R: RegisterIo>(state: &mut IommuState<SmmuDevice<R>>, vmid: u16) -> Result<()> {
    if skip_invalidation(state) {
        return Ok(());
    }
    send_cmd(state, &Command::TlbiS12Vmall { vmid })
}

fn tlb_inv_range<R: RegisterIo>(
    state: &mut IommuState<SmmuDevice<R>>,
    vmid: u16,
    gather: &IotlbGather,
    pgsize_bitmap: u64,
) -> Result<()> {
    if skip_invalidation(state) {
        return Ok(());
    }
    let range = TlbiRange::new(
        vmid,
        gather.start,
        gather.size(),
        gather.pgsize as u64,
        true,
        pgsize_bitmap,
        state.dev.range_inv,
    );
    for cmd in range {
        add_cmd(state, &cmd)?;
    }
    sync(state)
}

fn invalidate_all<R: RegisterIo>(state: &mut IommuState<SmmuDevice<R>>) -> Result<()> {
    add_cmd(state, &Command::CfgiAll)?;
    add_cmd(state, &Command::TlbiNsnhAll)?;
    sync(state)
}

/// Invalidate everything and turn translation on.
fn reset_device<R: RegisterIo>(state: &mut IommuState<SmmuDevice<R>>) -> Result<()> {
    state.dev.write_cr0(Cr0::CMDQEN)?;
    match invalidate_all(state) {
        Ok(()) => state
            .dev
            .write_cr0(Cr0::SMMUEN | Cr0::CMDQEN | Cr0::ATSCHK | Cr0::EVTQEN),
        Err(err) => {
            state.dev.write_cr0(Cr0::empty())?;
            Err(err)
        }
    }
}

/// Backend data of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SmmuDomain {
    /// SMMU the page table was finalized for.
    pub iommu: Option<u32>,
    /// Usable from every SMMU (the identity domain).
    pub shared: bool,
}

/// Discards what the identity domain unmaps; those pages were never pinned.
struct IgnoreLeaves;

impl UnmapVisitor for IgnoreLeaves {
    fn add_page(&mut self, _iova: u64, _size: usize) {}
    fn visit_leaf(&mut self, _paddr: u64, _size: usize) {}
}

pub struct SmmuV3<R: 'static> {
    devices: &'static [HypIommu<SmmuDevice<R>>],
    mem: &'static dyn HostMemProtect,
    pgtables: &'static dyn IoPgtableAlloc,
    /// Template for every domain page table; `vttbr` is filled in per table.
    pgtable_cfg: IoPgtableCfg,
}

impl<R: RegisterIo + Send + 'static> SmmuV3<R> {
    /// `devices[i]` must have id `i`.
    pub fn new(
        devices: &'static [HypIommu<SmmuDevice<R>>],
        mem: &'static dyn HostMemProtect,
        pgtables: &'static dyn IoPgtableAlloc,
        pgtable_cfg: IoPgtableCfg,
    ) -> Self {
        Self {
            devices,
            mem,
            pgtables,
            pgtable_cfg,
        }
    }

    pub fn devices(&self) -> &'static [HypIommu<SmmuDevice<R>>] {
        self.devices
    }

    fn init_device(&self, state: &mut IommuState<SmmuDevice<R>>, config: &IommuConfig) -> Result<()> {
        let mem = self.mem;
        let smmu = &mut state.dev;
        smmu.poll_timeout_us = config.poll_timeout_us;
        if (smmu.mmio_addr | smmu.mmio_size as u64) % PAGE_SIZE as u64 != 0 {
            return Err(IommuError::InvalidArgument);
        }
        mem.host_donate_hyp(smmu.mmio_addr, smmu.mmio_size, true)?;

        smmu.features = Idr0::from_bits_truncate(smmu.regs.read32(IDR0));
        smmu.range_inv = smmu.regs.read32(IDR3) & IDR3_RIL != 0;

        smmu.init_registers()?;
        smmu.init_cmdq(mem)?;
        smmu.init_strtab(mem)?;
        reset_device(state)
    }

    /// Run `f` on every SMMU that may cache translations of `domain`.
    fn for_each_target(
        &self,
        domain: &Domain<SmmuDomain>,
        mut f: impl FnMut(&HypIommu<SmmuDevice<R>>),
    ) {
        let data = domain.state().data;
        match data {
            Some(SmmuDomain { shared: true, .. }) => self.devices.iter().for_each(f),
            Some(SmmuDomain {
                iommu: Some(id), ..
            }) => {
                if let Some(iommu) = self.get_iommu(id) {
                    f(iommu)
                }
            }
            _ => {}
        }
    }

    fn flush_domain(&self, domain: &Domain<SmmuDomain>) {
        let vmid = domain.id() as u16;
        self.for_each_target(domain, |iommu| {
            if let Err(err) = tlb_flush_all(&mut iommu.lock(), vmid) {
                log::warn!("smmu{}: flush of vmid {} failed: {}", iommu.id(), vmid, err);
            }
        });
    }

    fn emulate(&self, smmu: &SmmuDevice<R>, regs: &mut [u64; 31], esr: u64, off: usize) -> bool {
        let Some(access) = DataAbort::decode(esr) else {
            return false;
        };
        // 32-bit registers only
        if access.size != 4 || off % 4 != 0 {
            return false;
        }
        let writable = match off {
            EVTQ_PROD | EVTQ_CONS | GERRORN => true,
            GERROR => false,
            _ => return false,
        };

        if access.is_write {
            if !writable {
                return false;
            }
            smmu.regs.write32(off, access.store_value(regs) as u32);
        } else {
            access.complete_load(regs, smmu.regs.read32(off) as u64);
        }
        true
    }
}

impl<R: RegisterIo + Send + 'static> IommuBackend for SmmuV3<R> {
    type DomainData = SmmuDomain;
    type Device = SmmuDevice<R>;

    fn caps(&self) -> Caps {
        Caps::INIT
            | Caps::IOTLB_SYNC
            | Caps::HOST_STAGE2_IDMAP
            | Caps::DABT_HANDLER
            | Caps::SUSPEND
            | Caps::RESUME
    }

    fn init(&self, config: &IommuConfig, _pages: &dyn PageAllocator) -> Result<()> {
        for (idx, iommu) in self.devices.iter().enumerate() {
            if iommu.id() as usize != idx {
                log::error!("smmu: device {} registered as id {}", idx, iommu.id());
                return Err(IommuError::InvalidArgument);
            }
            let mut state = iommu.lock();
            if let Err(err) = self.init_device(&mut state, config) {
                log::error!("smmu{}: init failed: {}", idx, err);
                return Err(err);
            }
            log::info!(
                "smmu{}: enabled, {} streams, features {:?}",
                idx,
                state.dev.strtab.num_entries(),
                state.dev.features
            );
        }
        Ok(())
    }

    fn get_iommu(&self, iommu_id: u32) -> Option<&HypIommu<SmmuDevice<R>>> {
        let count = self.devices.len() as u64;
        if iommu_id as u64 >= count {
            return None;
        }
        self.devices
            .get(index_nospec(iommu_id as u64, count) as usize)
    }

    fn alloc_domain(
        &self,
        domain_id: u32,
        domain_type: u32,
        state: &mut DomainState<SmmuDomain>,
    ) -> Result<()> {
        if domain_id == DOMAIN_IDMAP_ID {
            // Mirrors the host stage-2 before any device is attached
            state.pgtable = Some(self.pgtables.alloc(&self.pgtable_cfg, domain_id)?);
            state.data = Some(SmmuDomain {
                iommu: None,
                shared: true,
            });
        } else {
            state.data = Some(SmmuDomain::default());
        }
        log::debug!("smmu: domain {} type {} allocated", domain_id, domain_type);
        Ok(())
    }

    fn free_domain(&self, _domain_id: u32, state: &mut DomainState<SmmuDomain>) {
        // Never attached: no page table
        if let Some(pgtable) = state.pgtable.take() {
            self.pgtables.free(pgtable);
        }
        state.data = None;
    }

    fn attach_dev(
        &self,
        iommu: &HypIommu<SmmuDevice<R>>,
        domain: &Domain<SmmuDomain>,
        sid: u32,
        _pasid: u32,
        _pasid_bits: u32,
        pages: &dyn PageAllocator,
    ) -> Result<()> {
        let mut state = iommu.lock();
        let ste = state.dev.strtab.ste(sid, pages)?;
        if ste.is_live() {
            log::warn!("smmu{}: sid {} already attached", iommu.id(), sid);
            return Err(IommuError::InvalidArgument);
        }

        let ent = {
            let mut dom = domain.state();
            let DomainState { pgtable, data } = &mut *dom;
            let data = data.as_mut().ok_or(IommuError::InvalidArgument)?;
            let pgtable = match pgtable {
                Some(pgtable) => *pgtable,
                None => {
                    // First attach binds the domain to this SMMU
                    let fresh = self.pgtables.alloc(&self.pgtable_cfg, domain.id())?;
                    data.iommu = Some(iommu.id());
                    *pgtable = Some(fresh);
                    fresh
                }
            };
            if !data.shared && data.iommu != Some(iommu.id()) {
                return Err(IommuError::Busy);
            }
            strtab::s2_ste(pgtable.cfg(), domain.id() as u16)
        };

        // The SMMU may cache a disabled STE: fill it, sync, then enable
        ste.write_tail(&ent);
        if let Err(err) = sync_ste(&mut state, sid) {
            ste.clear_tail();
            return Err(err);
        }
        ste.write_head(ent[0]);
        if let Err(err) = sync_ste(&mut state, sid) {
            // The caller drops its reference and may free the page table;
            // the stream must not be left translating through it.
            log::error!("smmu{}: sid {} enable not acknowledged: {}", iommu.id(), sid, err);
            disable_ste(&mut state, &ste, sid);
            return Err(err);
        }
        Ok(())
    }

    fn detach_dev(
        &self,
        iommu: &HypIommu<SmmuDevice<R>>,
        domain: &Domain<SmmuDomain>,
        sid: u32,
        _pasid: u32,
    ) -> Result<()> {
        let mut state = iommu.lock();
        let ste = state.dev.strtab.lookup(sid)?;
        if !ste.is_live() || ste.vmid() != domain.id() as u16 {
            log::warn!("smmu{}: sid {} not attached to domain {}", iommu.id(), sid, domain.id());
            return Err(IommuError::InvalidArgument);
        }

        ste.write_head(0);
        sync_ste(&mut state, sid)?;
        ste.clear_tail();
        sync_ste(&mut state, sid)
    }

    fn iotlb_sync(&self, domain: &Domain<SmmuDomain>, gather: &IotlbGather) -> Result<()> {
        let Some(pgtable) = domain.pgtable() else {
            return Ok(());
        };
        let vmid = domain.id() as u16;
        let pgsize_bitmap = pgtable.cfg().pgsize_bitmap;
        let mut ret = Ok(());
        self.for_each_target(domain, |iommu| {
            match tlb_inv_range(&mut iommu.lock(), vmid, gather, pgsize_bitmap) {
                Ok(()) => {}
                Err(IommuError::Unavailable) => {
                    if ret.is_ok() {
                        ret = Err(IommuError::Unavailable);
                    }
                }
                Err(err) => {
                    log::warn!(
                        "smmu{}: invalidation of {:#x}+{:#x} failed: {}",
                        iommu.id(),
                        gather.start,
                        gather.size(),
                        err
                    );
                    // Timeout and Io outrank a powered-off SMMU
                    if matches!(ret, Ok(()) | Err(IommuError::Unavailable)) {
                        ret = Err(err);
                    }
                }
            }
        });
        ret
    }

    fn host_stage2_idmap(&self, domain: &Domain<SmmuDomain>, start: u64, end: u64, prot: IommuProt) {
        let Some(pgtable) = domain.pgtable() else {
            return;
        };
        let granule = pgtable.cfg().granule();
        let mask = granule as u64 - 1;
        let start = start & !mask;
        let end = end.saturating_add(mask) & !mask;
        if end <= start {
            return;
        }
        let pgcount = ((end - start) / granule as u64) as usize;

        if prot.is_empty() {
            unmap_all(pgtable, start, granule, pgcount);
        } else {
            map_all(pgtable, start, granule, pgcount, prot);
        }
        self.flush_domain(domain);
    }

    fn dabt_handler(&self, regs: &mut [u64; 31], esr: u64, addr: u64) -> bool {
        for iommu in self.devices {
            let state = iommu.lock();
            if !state.dev.contains(addr) {
                continue;
            }
            let off = (addr - state.dev.mmio_addr) as usize;
            return self.emulate(&state.dev, regs, esr, off);
        }
        false
    }

    fn suspend(&self, iommu: &HypIommu<SmmuDevice<R>>, state: &mut IommuState<SmmuDevice<R>>) -> Result<()> {
        // GBPA aborts, so all DMA faults while disabled
        if iommu.power_domain() == PowerDomain::HostHvc {
            state.dev.write_cr0(Cr0::empty())?;
        }
        Ok(())
    }

    fn resume(&self, iommu: &HypIommu<SmmuDevice<R>>, state: &mut IommuState<SmmuDevice<R>>) -> Result<()> {
        if iommu.power_domain() == PowerDomain::HostHvc {
            reset_device(state)?;
        }
        Ok(())
    }
}

fn map_all(pgtable: &dyn IoPgtable, mut addr: u64, pgsize: usize, mut pgcount: usize, prot: IommuProt) {
    while pgcount > 0 {
        let mapped = pgtable.map_pages(addr, addr, pgsize, pgcount, prot) / pgsize;
        if mapped == 0 {
            log::warn!("smmu: identity map stopped at {:#x}", addr);
            return;
        }
        pgcount = pgcount.saturating_sub(mapped);
        addr += (mapped * pgsize) as u64;
    }
}

fn unmap_all(pgtable: &dyn IoPgtable, mut addr: u64, pgsize: usize, mut pgcount: usize) {
    while pgcount > 0 {
        let unmapped = pgtable.unmap_pages_walk(addr, pgsize, pgcount, &mut IgnoreLeaves) / pgsize;
        if unmapped == 0 {
            // Nothing mapped here
            return;
        }
        pgcount = pgcount.saturating_sub(unmapped);
        addr += (unmapped * pgsize) as u64;
    }
}
