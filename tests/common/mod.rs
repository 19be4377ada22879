//! Shared fakes for the integration tests
//!
//! Everything handed to the library is leaked so it is `'static`, the same
//! lifetime the real collaborators have at EL2. Page "physical addresses"
//! are host addresses of leaked, page-aligned buffers; the library's
//! identity mapping makes that work.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use pkvm_iommu::config::PAGE_SIZE;
use pkvm_iommu::iommu::{
    Caps, Domain, DomainState, HostMemProtect, HypIommu, IoPgtable, IoPgtableAlloc, IoPgtableCfg,
    IommuBackend, IommuProt, IommuState, IotlbGather, PowerDomain, UnmapVisitor, VtcrCfg,
};
use pkvm_iommu::mm::PageAllocator;
use pkvm_iommu::mmio::RegisterIo;
use pkvm_iommu::smmu_v3::cmdq::Command;
use pkvm_iommu::smmu_v3::regs::*;
use pkvm_iommu::smmu_v3::{SmmuDevice, SmmuV3};
use pkvm_iommu::{CpuId, Iommu, IommuConfig, IommuError, Result};

// ── Memory ───────────────────────────────────────────────────────────

#[repr(C, align(4096))]
pub struct Page([u8; PAGE_SIZE]);

pub fn leak<T>(val: T) -> &'static T {
    Box::leak(Box::new(val))
}

/// `n` contiguous zeroed pages.
pub fn leak_pages(n: usize) -> u64 {
    let pages: Vec<Page> = (0..n).map(|_| Page([0; PAGE_SIZE])).collect();
    Box::leak(pages.into_boxed_slice()).as_mut_ptr() as u64
}

/// `n` separate pages, as the host would donate them.
pub fn page_list(n: usize) -> Vec<u64> {
    (0..n).map(|_| leak_pages(1)).collect()
}

pub fn cpu0() -> CpuId {
    CpuId::new(0).unwrap()
}

// ── Event log ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    UseDma { phys: u64, size: usize },
    UnuseDma { phys: u64, size: usize },
    Donate { phys: u64, size: usize, mmio: bool },
    Reclaim { phys: u64, size: usize },
    /// IOTLB invalidation of `[start, end]` reached the backend.
    Sync { start: u64, end: u64 },
    /// Command consumed by a fake SMMU.
    Cmd { smmu: usize, cmd: Command },
    Power { iommu: u32, off: bool },
}

#[derive(Default)]
pub struct EventLog(Mutex<Vec<Event>>);

impl EventLog {
    pub fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn commands(&self, smmu: usize) -> Vec<Command> {
        commands_in(&self.events(), smmu)
    }
}

/// Commands consumed by SMMU `smmu`, in order.
pub fn commands_in(events: &[Event], smmu: usize) -> Vec<Command> {
    events
        .iter()
        .filter_map(|e| match *e {
            Event::Cmd { smmu: s, cmd } if s == smmu => Some(cmd),
            _ => None,
        })
        .collect()
}

/// Bytes covered by one TLBI_S2_IPA. Without TG it covers one 4K granule.
pub fn tlbi_len(num: u8, scale: u8, tg: u8) -> u64 {
    if tg == 0 {
        return PAGE_SIZE as u64;
    }
    ((num as u64 + 1) << scale) << (10 + 2 * tg as u32)
}

/// Every released page must have had its IOVA invalidated before. The
/// mock page tables map `iova` to `iova + delta`.
pub fn assert_invalidated_before_release(events: &[Event], delta: u64) {
    for (i, event) in events.iter().enumerate() {
        let Event::UnuseDma { phys, size } = *event else {
            continue;
        };
        let iova = phys - delta;
        let covered = events[..i].iter().any(|e| match *e {
            Event::Sync { start, end } => start <= iova && iova + size as u64 - 1 <= end,
            Event::Cmd {
                cmd: Command::TlbiS12Vmall { .. },
                ..
            } => true,
            Event::Cmd {
                cmd: Command::TlbiS2Ipa { addr, num, scale, tg, .. },
                ..
            } => addr <= iova && iova + size as u64 <= addr + tlbi_len(num, scale, tg),
            _ => false,
        });
        assert!(covered, "page {:#x} released before its IOVA {:#x} was invalidated", phys, iova);
    }
}

// ── Page ownership ───────────────────────────────────────────────────

pub struct FakeMemProtect {
    pub log: &'static EventLog,
    pub fail_use: AtomicBool,
}

impl FakeMemProtect {
    pub fn new(log: &'static EventLog) -> Self {
        Self {
            log,
            fail_use: AtomicBool::new(false),
        }
    }
}

impl HostMemProtect for FakeMemProtect {
    fn host_use_dma(&self, phys: u64, size: usize) -> Result<()> {
        if self.fail_use.load(Ordering::Relaxed) {
            return Err(IommuError::Busy);
        }
        self.log.push(Event::UseDma { phys, size });
        Ok(())
    }

    fn host_unuse_dma(&self, phys: u64, size: usize) -> Result<()> {
        self.log.push(Event::UnuseDma { phys, size });
        Ok(())
    }

    fn host_donate_hyp(&self, phys: u64, size: usize, accept_mmio: bool) -> Result<()> {
        self.log.push(Event::Donate {
            phys,
            size,
            mmio: accept_mmio,
        });
        Ok(())
    }

    fn host_reclaim(&self, phys: u64, size: usize) -> Result<()> {
        self.log.push(Event::Reclaim { phys, size });
        Ok(())
    }
}

// ── Page tables ──────────────────────────────────────────────────────

pub fn s2_cfg() -> IoPgtableCfg {
    IoPgtableCfg {
        pgsize_bitmap: (1 << 12) | (1 << 21) | (1 << 30),
        ias: 40,
        oas: 40,
        coherent_walk: true,
        vtcr: VtcrCfg {
            ps: 2,
            tg: 0,
            sh: 3,
            orgn: 1,
            irgn: 1,
            sl: 1,
            tsz: 24,
        },
        vttbr: 0,
    }
}

/// One leaf per page, no blocks.
pub struct MockPgtable {
    cfg: IoPgtableCfg,
    leaves: Mutex<BTreeMap<u64, (u64, usize)>>,
    /// Pages that may still be mapped before map_pages stops short.
    pub budget: Mutex<Option<usize>>,
}

impl MockPgtable {
    pub fn leaves(&self) -> usize {
        self.leaves.lock().unwrap().len()
    }

    pub fn vttbr(&self) -> u64 {
        self.cfg.vttbr
    }
}

impl IoPgtable for MockPgtable {
    fn cfg(&self) -> &IoPgtableCfg {
        &self.cfg
    }

    fn map_pages(&self, iova: u64, paddr: u64, pgsize: usize, pgcount: usize, _prot: IommuProt) -> usize {
        let mut leaves = self.leaves.lock().unwrap();
        let mut budget = self.budget.lock().unwrap();
        let mut done = 0;
        while done < pgcount {
            if *budget == Some(0) {
                break;
            }
            let off = (done * pgsize) as u64;
            if leaves.contains_key(&(iova + off)) {
                break;
            }
            leaves.insert(iova + off, (paddr + off, pgsize));
            if let Some(left) = budget.as_mut() {
                *left -= 1;
            }
            done += 1;
        }
        done * pgsize
    }

    fn unmap_pages_walk(
        &self,
        iova: u64,
        pgsize: usize,
        pgcount: usize,
        visitor: &mut dyn UnmapVisitor,
    ) -> usize {
        let mut done = 0;
        while done < pgcount {
            let at = iova + (done * pgsize) as u64;
            // Release the table lock before calling out, like a real walker
            let leaf = self.leaves.lock().unwrap().remove(&at);
            let Some((paddr, size)) = leaf else { break };
            visitor.add_page(at, size);
            visitor.visit_leaf(paddr, size);
            done += 1;
        }
        done * pgsize
    }

    fn iova_to_phys(&self, iova: u64) -> u64 {
        let leaves = self.leaves.lock().unwrap();
        match leaves.range(..=iova).next_back() {
            Some((&base, &(paddr, size))) if iova < base + size as u64 => paddr + (iova - base),
            _ => 0,
        }
    }
}

#[derive(Default)]
pub struct MockPgtableAlloc {
    pub tables: Mutex<Vec<&'static MockPgtable>>,
    pub freed: AtomicUsize,
    pub fail: AtomicBool,
}

impl MockPgtableAlloc {
    pub fn last(&self) -> &'static MockPgtable {
        *self.tables.lock().unwrap().last().unwrap()
    }

    pub fn live(&self) -> usize {
        self.tables.lock().unwrap().len() - self.freed.load(Ordering::Relaxed)
    }
}

impl IoPgtableAlloc for MockPgtableAlloc {
    fn alloc(&self, cfg: &IoPgtableCfg, _domain_id: u32) -> Result<&'static dyn IoPgtable> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(IommuError::OutOfMemory);
        }
        let table = leak(MockPgtable {
            cfg: IoPgtableCfg {
                vttbr: leak_pages(1),
                ..*cfg
            },
            leaves: Mutex::new(BTreeMap::new()),
            budget: Mutex::new(None),
        });
        self.tables.lock().unwrap().push(table);
        Ok(table)
    }

    fn free(&self, _pgtable: &'static dyn IoPgtable) {
        self.freed.fetch_add(1, Ordering::Relaxed);
    }
}

// ── Generic backend ──────────────────────────────────────────────────

#[derive(Default)]
pub struct MockDevice {
    /// (sid, domain id)
    pub attached: Vec<(u32, u32)>,
    pub fail_attach: bool,
}

/// Backend without hardware: records attachments and invalidations.
pub struct MockBackend {
    pub iommus: &'static [HypIommu<MockDevice>],
    pub pgtables: &'static MockPgtableAlloc,
    pub log: &'static EventLog,
    pub caps: Caps,
    pub init_calls: AtomicUsize,
}

impl IommuBackend for MockBackend {
    /// Domain type passed to alloc_domain.
    type DomainData = u32;
    type Device = MockDevice;

    fn caps(&self) -> Caps {
        self.caps
    }

    fn init(&self, _config: &IommuConfig, _pages: &dyn PageAllocator) -> Result<()> {
        self.init_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn get_iommu(&self, iommu_id: u32) -> Option<&HypIommu<MockDevice>> {
        self.iommus.get(iommu_id as usize)
    }

    fn alloc_domain(&self, _domain_id: u32, domain_type: u32, state: &mut DomainState<u32>) -> Result<()> {
        if domain_type > 1 {
            return Err(IommuError::InvalidArgument);
        }
        state.data = Some(domain_type);
        Ok(())
    }

    fn free_domain(&self, _domain_id: u32, state: &mut DomainState<u32>) {
        if let Some(pgtable) = state.pgtable.take() {
            self.pgtables.free(pgtable);
        }
        state.data = None;
    }

    fn attach_dev(
        &self,
        iommu: &HypIommu<MockDevice>,
        domain: &Domain<u32>,
        sid: u32,
        _pasid: u32,
        _pasid_bits: u32,
        _pages: &dyn PageAllocator,
    ) -> Result<()> {
        let mut dev = iommu.lock();
        if dev.dev.fail_attach || dev.dev.attached.iter().any(|&(s, _)| s == sid) {
            return Err(IommuError::Busy);
        }
        let mut state = domain.state();
        if state.pgtable.is_none() {
            state.pgtable = Some(self.pgtables.alloc(&s2_cfg(), domain.id())?);
        }
        dev.dev.attached.push((sid, domain.id()));
        Ok(())
    }

    fn detach_dev(&self, iommu: &HypIommu<MockDevice>, domain: &Domain<u32>, sid: u32, _pasid: u32) -> Result<()> {
        let mut dev = iommu.lock();
        let pos = dev
            .dev
            .attached
            .iter()
            .position(|&entry| entry == (sid, domain.id()))
            .ok_or(IommuError::NotFound)?;
        dev.dev.attached.remove(pos);
        Ok(())
    }

    fn iotlb_sync(&self, _domain: &Domain<u32>, gather: &IotlbGather) -> Result<()> {
        self.log.push(Event::Sync {
            start: gather.start,
            end: gather.end,
        });
        Ok(())
    }

    fn suspend(&self, iommu: &HypIommu<MockDevice>, _state: &mut IommuState<MockDevice>) -> Result<()> {
        self.log.push(Event::Power {
            iommu: iommu.id(),
            off: true,
        });
        Ok(())
    }

    fn resume(&self, iommu: &HypIommu<MockDevice>, _state: &mut IommuState<MockDevice>) -> Result<()> {
        self.log.push(Event::Power {
            iommu: iommu.id(),
            off: false,
        });
        Ok(())
    }
}

pub struct MockPlatform {
    pub iommu: &'static Iommu<MockBackend>,
    pub log: &'static EventLog,
    pub mem: &'static FakeMemProtect,
    pub pgtables: &'static MockPgtableAlloc,
}

/// Two mock IOMMUs, initialized, with `pool_pages` in the host pool.
pub fn mock_platform(pool_pages: usize) -> MockPlatform {
    mock_platform_with(pool_pages, Caps::IOTLB_SYNC | Caps::SUSPEND | Caps::RESUME)
}

pub fn mock_platform_with(pool_pages: usize, caps: Caps) -> MockPlatform {
    let log = leak(EventLog::default());
    let mem = leak(FakeMemProtect::new(log));
    let pgtables = leak(MockPgtableAlloc::default());
    let iommus: &'static [HypIommu<MockDevice>] = Box::leak(
        vec![
            HypIommu::new(0, PowerDomain::HostHvc, MockDevice::default()),
            HypIommu::new(1, PowerDomain::None, MockDevice::default()),
        ]
        .into_boxed_slice(),
    );
    let backend = MockBackend {
        iommus,
        pgtables,
        log,
        caps,
        init_calls: AtomicUsize::new(0),
    };
    let iommu = leak(Iommu::new(backend, mem, IommuConfig::new().without_idmap()).unwrap());
    iommu.on_cpu(cpu0()).init(&[]).unwrap();
    if pool_pages > 0 {
        iommu.refill(&page_list(pool_pages)).unwrap();
    }
    log.take();
    MockPlatform {
        iommu,
        log,
        mem,
        pgtables,
    }
}

// ── SMMUv3 register model ────────────────────────────────────────────

/// Register frame of one SMMU. CR0 is acknowledged immediately and, while
/// `consume` is set, every producer update drains the command queue into
/// the event log.
///
/// With `pace` non-zero the queue is instead consumed one command per
/// `pace` reads of CMDQ_CONS, so the queue can be seen full.
pub struct FakeSmmu {
    index: usize,
    log: &'static EventLog,
    r32: Mutex<BTreeMap<usize, u32>>,
    r64: Mutex<BTreeMap<usize, u64>>,
    pub consume: AtomicBool,
    pub pace: AtomicUsize,
    cons_reads: AtomicUsize,
    /// Producer updates still drained before the SMMU stalls.
    drains_left: Mutex<Option<usize>>,
}

impl FakeSmmu {
    pub fn new(index: usize, log: &'static EventLog) -> Self {
        let smmu = Self {
            index,
            log,
            r32: Mutex::new(BTreeMap::new()),
            r64: Mutex::new(BTreeMap::new()),
            consume: AtomicBool::new(true),
            pace: AtomicUsize::new(0),
            cons_reads: AtomicUsize::new(0),
            drains_left: Mutex::new(None),
        };
        smmu.set32(GBPA, GBPA_ABORT);
        smmu
    }

    pub fn get32(&self, offset: usize) -> u32 {
        self.r32.lock().unwrap().get(&offset).copied().unwrap_or(0)
    }

    pub fn set32(&self, offset: usize, value: u32) {
        self.r32.lock().unwrap().insert(offset, value);
    }

    pub fn set64(&self, offset: usize, value: u64) {
        self.r64.lock().unwrap().insert(offset, value);
    }

    fn get64(&self, offset: usize) -> u64 {
        self.r64.lock().unwrap().get(&offset).copied().unwrap_or(0)
    }

    /// Stop consuming after `drains` more producer updates.
    pub fn stall_after(&self, drains: usize) {
        *self.drains_left.lock().unwrap() = Some(drains);
    }

    /// Consume every producer update again.
    pub fn resume(&self) {
        *self.drains_left.lock().unwrap() = None;
    }

    /// Run the command at CONS, if any.
    fn consume_one(&self) -> bool {
        let base = QueueBase::decode(self.get64(CMDQ_BASE)).unwrap();
        let wrap_mask = (2u32 << base.log2size) - 1;
        let cons = self.get32(CMDQ_CONS);
        if cons == self.get32(CMDQ_PROD) {
            return false;
        }
        let idx = (cons & ((1 << base.log2size) - 1)) as usize;
        let slot = (base.addr as usize + idx * 16) as *const u64;
        let raw = unsafe { [slot.read_volatile(), slot.add(1).read_volatile()] };
        let cmd = Command::decode([u64::from_le(raw[0]), u64::from_le(raw[1])]).unwrap();
        self.log.push(Event::Cmd {
            smmu: self.index,
            cmd,
        });
        self.set32(CMDQ_CONS, (cons + 1) & wrap_mask);
        true
    }

    /// Run every command between CONS and PROD.
    pub fn drain_cmdq(&self) {
        while self.consume_one() {}
    }

    fn on_prod_write(&self) {
        if !self.consume.load(Ordering::Relaxed) {
            return;
        }
        let mut left = self.drains_left.lock().unwrap();
        match left.as_mut() {
            Some(0) => return,
            Some(n) => *n -= 1,
            None => {}
        }
        drop(left);
        self.drain_cmdq();
    }
}

impl RegisterIo for &'static FakeSmmu {
    fn read32(&self, offset: usize) -> u32 {
        let pace = self.pace.load(Ordering::Relaxed);
        if offset == CMDQ_CONS && pace > 0 {
            let reads = self.cons_reads.fetch_add(1, Ordering::Relaxed) + 1;
            if reads % pace == 0 {
                self.consume_one();
            }
        }
        self.get32(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.set32(offset, value);
        match offset {
            CR0 => self.set32(CR0ACK, value),
            CMDQ_PROD => self.on_prod_write(),
            _ => {}
        }
    }

    fn read64(&self, offset: usize) -> u64 {
        self.get64(offset)
    }

    fn write64(&self, offset: usize, value: u64) {
        self.set64(offset, value);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SmmuOpts {
    pub two_level: bool,
    pub idr0: Idr0,
    pub ril: bool,
    pub caches_clean_on_power_on: bool,
    pub power: PowerDomain,
    pub cmdq_log2size: u32,
}

impl Default for SmmuOpts {
    fn default() -> Self {
        Self {
            two_level: true,
            idr0: Idr0::S2P | Idr0::COHACC | Idr0::VMID16,
            ril: false,
            caches_clean_on_power_on: false,
            power: PowerDomain::HostHvc,
            cmdq_log2size: 4,
        }
    }
}

pub type SmmuBackend = SmmuV3<&'static FakeSmmu>;

pub struct SmmuPlatform {
    pub iommu: &'static Iommu<SmmuBackend>,
    pub log: &'static EventLog,
    pub mem: &'static FakeMemProtect,
    pub pgtables: &'static MockPgtableAlloc,
    pub smmus: Vec<&'static FakeSmmu>,
}

pub const SMMU_MMIO_BASE: u64 = 0x2b40_0000;
pub const SMMU_MMIO_SIZE: usize = 0x2_0000;

pub fn smmu_mmio(index: usize) -> u64 {
    SMMU_MMIO_BASE + index as u64 * 0x10_0000
}

/// `count` fake SMMUs set up the way the host driver leaves them, wrapped
/// in an `Iommu` that has not been initialized yet.
pub fn smmu_platform(count: usize, opts: SmmuOpts, config: IommuConfig) -> SmmuPlatform {
    let log = leak(EventLog::default());
    let mem = leak(FakeMemProtect::new(log));
    let pgtables = leak(MockPgtableAlloc::default());

    let mut smmus = Vec::new();
    let mut devices = Vec::new();
    for index in 0..count {
        let smmu = leak(FakeSmmu::new(index, log));
        smmu.set32(IDR0, opts.idr0.bits());
        if opts.ril {
            smmu.set32(IDR3, IDR3_RIL);
        }

        let cmdq = QueueBase {
            addr: leak_pages(1),
            log2size: opts.cmdq_log2size,
        };
        smmu.set64(CMDQ_BASE, cmdq.encode());

        let strtab = if opts.two_level {
            // 1024 L1 descriptors, 64 STEs per L2 page
            StrtabCfg {
                addr: leak_pages(2),
                fmt: StrtabFmt::TwoLevel,
                split: 6,
                log2size: 16,
            }
        } else {
            // 256 STEs
            StrtabCfg {
                addr: leak_pages(4),
                fmt: StrtabFmt::Linear,
                split: 0,
                log2size: 8,
            }
        };
        smmu.set64(STRTAB_BASE, strtab.addr | STRTAB_BASE_RA);
        smmu.set32(STRTAB_BASE_CFG, strtab.encode_cfg());

        devices.push(HypIommu::new(
            index as u32,
            opts.power,
            SmmuDevice::new(smmu, smmu_mmio(index), SMMU_MMIO_SIZE, opts.caches_clean_on_power_on),
        ));
        smmus.push(smmu);
    }

    let devices: &'static [HypIommu<SmmuDevice<&'static FakeSmmu>>] =
        Box::leak(devices.into_boxed_slice());
    let backend = SmmuV3::new(devices, mem, pgtables, s2_cfg());
    let iommu = leak(Iommu::new(backend, mem, config).unwrap());
    SmmuPlatform {
        iommu,
        log,
        mem,
        pgtables,
        smmus,
    }
}

/// Short polls so timeouts are quick.
pub fn test_config() -> IommuConfig {
    IommuConfig::new().with_poll_timeout(1000).without_idmap()
}
