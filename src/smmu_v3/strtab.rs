//! Stream table
//!
//! Maps a stream id to its STE. The table memory is the one the host driver
//! allocated and described in STRTAB_BASE; it is owned by the hypervisor
//! after init.
//!
//! Two-level tables hold L1 descriptors pointing at L2 pages. An L2 page is
//! installed the first time one of its streams is attached and is never
//! removed.

use super::regs::{field_get, field_prep, genmask, StrtabCfg, StrtabFmt};
use crate::arch::{index_nospec, wmb};
use crate::config::PAGE_SHIFT;
use crate::error::{IommuError, Result};
use crate::iommu::IoPgtableCfg;
use crate::mm::{pages_for, phys_to_virt, virt_to_phys, PageAllocator};

pub const STRTAB_STE_DWORDS: usize = 8;
pub const STRTAB_STE_SIZE: usize = STRTAB_STE_DWORDS * 8;
const STRTAB_STE_DWORDS_BITS: u32 = 3;
const STRTAB_L1_DESC_SIZE: usize = 8;

const STRTAB_L1_DESC_SPAN: u64 = genmask(4, 0);
const STRTAB_L1_DESC_L2PTR_MASK: u64 = genmask(51, 6);

pub const STRTAB_STE_0_V: u64 = 1 << 0;
const STRTAB_STE_0_CFG: u64 = genmask(3, 1);
const STRTAB_STE_0_CFG_S2_TRANS: u64 = 6;

const STRTAB_STE_1_SHCFG: u64 = genmask(45, 44);
const STRTAB_STE_1_SHCFG_INCOMING: u64 = 1;

const STRTAB_STE_2_S2VMID: u64 = genmask(15, 0);
const STRTAB_STE_2_VTCR: u64 = genmask(50, 32);
const STRTAB_STE_2_VTCR_S2T0SZ: u64 = genmask(5, 0);
const STRTAB_STE_2_VTCR_S2SL0: u64 = genmask(7, 6);
const STRTAB_STE_2_VTCR_S2IR0: u64 = genmask(9, 8);
const STRTAB_STE_2_VTCR_S2OR0: u64 = genmask(11, 10);
const STRTAB_STE_2_VTCR_S2SH0: u64 = genmask(13, 12);
const STRTAB_STE_2_VTCR_S2TG: u64 = genmask(15, 14);
const STRTAB_STE_2_VTCR_S2PS: u64 = genmask(18, 16);
const STRTAB_STE_2_S2AA64: u64 = 1 << 51;
const STRTAB_STE_2_S2R: u64 = 1 << 58;

const STRTAB_STE_3_S2TTB_MASK: u64 = genmask(51, 4);

/// STE for stage-2 translation with `cfg`, tagged with `vmid`.
pub fn s2_ste(cfg: &IoPgtableCfg, vmid: u16) -> [u64; STRTAB_STE_DWORDS] {
    let vtcr = &cfg.vtcr;
    let vtcr_field = field_prep(STRTAB_STE_2_VTCR_S2PS, vtcr.ps as u64)
        | field_prep(STRTAB_STE_2_VTCR_S2TG, vtcr.tg as u64)
        | field_prep(STRTAB_STE_2_VTCR_S2SH0, vtcr.sh as u64)
        | field_prep(STRTAB_STE_2_VTCR_S2OR0, vtcr.orgn as u64)
        | field_prep(STRTAB_STE_2_VTCR_S2IR0, vtcr.irgn as u64)
        | field_prep(STRTAB_STE_2_VTCR_S2SL0, vtcr.sl as u64)
        | field_prep(STRTAB_STE_2_VTCR_S2T0SZ, vtcr.tsz as u64);

    let mut ent = [0u64; STRTAB_STE_DWORDS];
    ent[0] = STRTAB_STE_0_V | field_prep(STRTAB_STE_0_CFG, STRTAB_STE_0_CFG_S2_TRANS);
    ent[1] = field_prep(STRTAB_STE_1_SHCFG, STRTAB_STE_1_SHCFG_INCOMING);
    ent[2] = field_prep(STRTAB_STE_2_VTCR, vtcr_field)
        | field_prep(STRTAB_STE_2_S2VMID, vmid as u64)
        | STRTAB_STE_2_S2AA64
        | STRTAB_STE_2_S2R;
    ent[3] = cfg.vttbr & STRTAB_STE_3_S2TTB_MASK;
    ent
}

/// One stream table entry in table memory.
#[derive(Debug, Clone, Copy)]
pub struct Ste {
    ptr: *mut u64,
}

impl Ste {
    fn read(&self, i: usize) -> u64 {
        u64::from_le(unsafe { core::ptr::read_volatile(self.ptr.add(i)) })
    }

    fn write(&self, i: usize, val: u64) {
        unsafe { core::ptr::write_volatile(self.ptr.add(i), val.to_le()) }
    }

    pub fn phys(&self) -> u64 {
        virt_to_phys(self.ptr)
    }

    /// Dword 0 non-zero: the SMMU may be using this entry.
    pub fn is_live(&self) -> bool {
        self.read(0) != 0
    }

    pub fn dword(&self, i: usize) -> u64 {
        self.read(i)
    }

    /// VMID the entry translates for.
    pub fn vmid(&self) -> u16 {
        field_get(STRTAB_STE_2_S2VMID, self.read(2)) as u16
    }

    /// Dwords 1.. of `ent`. Dword 0 is left alone.
    pub fn write_tail(&self, ent: &[u64; STRTAB_STE_DWORDS]) {
        for (i, &val) in ent.iter().enumerate().skip(1) {
            self.write(i, val);
        }
    }

    /// Publish dword 0 after everything before it.
    pub fn write_head(&self, val: u64) {
        wmb();
        self.write(0, val);
    }

    pub fn clear_tail(&self) {
        for i in 1..STRTAB_STE_DWORDS {
            self.write(i, 0);
        }
    }
}

#[derive(Debug)]
pub struct Strtab {
    base: u64,
    fmt: StrtabFmt,
    split: u32,
    num_entries: u64,
}

impl Strtab {
    pub const fn empty() -> Self {
        Self {
            base: 0,
            fmt: StrtabFmt::Linear,
            split: 0,
            num_entries: 0,
        }
    }

    pub fn new(cfg: &StrtabCfg) -> Self {
        Self {
            base: cfg.addr,
            fmt: cfg.fmt,
            split: cfg.split,
            num_entries: 1u64 << cfg.log2size,
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Bytes of table memory at `base`: all STEs, or all L1 descriptors.
    pub fn size_bytes(&self) -> usize {
        match self.fmt {
            StrtabFmt::Linear => self.num_entries as usize * STRTAB_STE_SIZE,
            StrtabFmt::TwoLevel => self.num_l1() * STRTAB_L1_DESC_SIZE,
        }
    }

    pub fn size_pages(&self) -> usize {
        pages_for(self.size_bytes())
    }

    fn num_l1(&self) -> usize {
        1 << (self.num_entries.trailing_zeros().saturating_sub(self.split))
    }

    fn l1_desc(&self, idx: usize) -> *mut u64 {
        unsafe { (phys_to_virt(self.base) as *mut u64).add(idx) }
    }

    fn alloc_l2(&self, desc: *mut u64, pages: &dyn PageAllocator) -> Result<u64> {
        // L2 tables are single pool pages
        if self.split + STRTAB_STE_DWORDS_BITS + 3 != PAGE_SHIFT {
            log::warn!("smmu: cannot allocate L2 stream table with split {}", self.split);
            return Err(IommuError::InvalidArgument);
        }
        let l2 = pages.alloc_page().ok_or(IommuError::OutOfMemory)?;
        let span = (self.split + 1) as u64;
        // Zeroed L2 must be visible before the descriptor pointing at it
        wmb();
        let val = (l2 & STRTAB_L1_DESC_L2PTR_MASK) | field_prep(STRTAB_L1_DESC_SPAN, span);
        unsafe { core::ptr::write_volatile(desc, val.to_le()) };
        log::debug!("smmu: L2 stream table {:#x} span {}", l2, span);
        Ok(val)
    }

    /// STE for `sid`. With a two-level table the L2 page is allocated from
    /// `pages` if missing.
    pub fn ste(&self, sid: u32, pages: &dyn PageAllocator) -> Result<Ste> {
        self.find(sid, Some(pages))
    }

    /// STE for `sid` without installing anything. NotFound if its L2 table
    /// was never allocated.
    pub fn lookup(&self, sid: u32) -> Result<Ste> {
        self.find(sid, None)
    }

    fn find(&self, sid: u32, pages: Option<&dyn PageAllocator>) -> Result<Ste> {
        let sid = sid as u64;
        if sid >= self.num_entries {
            return Err(IommuError::InvalidArgument);
        }
        let sid = index_nospec(sid, self.num_entries);

        let ptr = match self.fmt {
            StrtabFmt::Linear => unsafe {
                (phys_to_virt(self.base) as *mut u64).add(sid as usize * STRTAB_STE_DWORDS)
            },
            StrtabFmt::TwoLevel => {
                let desc = self.l1_desc((sid >> self.split) as usize);
                let mut l1 = u64::from_le(unsafe { core::ptr::read_volatile(desc) });
                if l1 == 0 {
                    let pages = pages.ok_or(IommuError::NotFound)?;
                    l1 = self.alloc_l2(desc, pages)?;
                }
                let span = (l1 & STRTAB_L1_DESC_SPAN) as u32;
                let idx = sid & ((1 << self.split) - 1);
                if span == 0 || idx >= 1 << (span - 1) {
                    return Err(IommuError::InvalidArgument);
                }
                let l2 = l1 & STRTAB_L1_DESC_L2PTR_MASK;
                unsafe { (phys_to_virt(l2) as *mut u64).add(idx as usize * STRTAB_STE_DWORDS) }
            }
        };
        Ok(Ste { ptr })
    }

    /// Zero the table memory at `base`.
    pub fn clear(&self) {
        unsafe { core::ptr::write_bytes(phys_to_virt(self.base), 0, self.size_bytes()) };
    }
}
