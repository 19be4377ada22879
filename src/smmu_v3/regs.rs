//! SMMUv3 register layout
//!
//! Offsets and field positions follow the ARM SMMUv3 architecture
//! specification (IHI 0070). Multi-bit fields are described by their mask;
//! [`field_prep`] and [`field_get`] shift values in and out of them.

use bitflags::bitflags;

use crate::error::{IommuError, Result};

/// Bits `h..=l` set.
pub const fn genmask(h: u32, l: u32) -> u64 {
    (u64::MAX >> (63 - h)) & !((1u64 << l) - 1)
}

/// Place `val` in the field described by `mask`.
pub const fn field_prep(mask: u64, val: u64) -> u64 {
    (val << mask.trailing_zeros()) & mask
}

/// Extract the field described by `mask`.
pub const fn field_get(mask: u64, reg: u64) -> u64 {
    (reg & mask) >> mask.trailing_zeros()
}

// ── Page 0 ───────────────────────────────────────────────────────────
pub const IDR0: usize = 0x0;
pub const IDR1: usize = 0x4;
pub const IDR3: usize = 0xc;
pub const IDR5: usize = 0x14;
pub const CR0: usize = 0x20;
pub const CR0ACK: usize = 0x24;
pub const CR1: usize = 0x28;
pub const CR2: usize = 0x2c;
pub const GBPA: usize = 0x44;
pub const IRQ_CTRL: usize = 0x50;
pub const GERROR: usize = 0x60;
pub const GERRORN: usize = 0x64;
pub const STRTAB_BASE: usize = 0x80;
pub const STRTAB_BASE_CFG: usize = 0x88;
pub const CMDQ_BASE: usize = 0x90;
pub const CMDQ_PROD: usize = 0x98;
pub const CMDQ_CONS: usize = 0x9c;
pub const EVTQ_BASE: usize = 0xa0;

// ── Page 1 ───────────────────────────────────────────────────────────
pub const PAGE1: usize = 0x1_0000;
pub const EVTQ_PROD: usize = PAGE1 + 0xa8;
pub const EVTQ_CONS: usize = PAGE1 + 0xac;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Idr0: u32 {
        const S2P = 1 << 0;
        const S1P = 1 << 1;
        const COHACC = 1 << 4;
        const HYP = 1 << 9;
        const ATS = 1 << 10;
        const SEV = 1 << 14;
        const VMID16 = 1 << 18;
    }
}

pub const IDR3_RIL: u32 = 1 << 10;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr0: u32 {
        const SMMUEN = 1 << 0;
        const PRIQEN = 1 << 1;
        const EVTQEN = 1 << 2;
        const CMDQEN = 1 << 3;
        const ATSCHK = 1 << 4;
    }
}

pub const CR1_TABLE_SH: u64 = genmask(11, 10);
pub const CR1_TABLE_OC: u64 = genmask(9, 8);
pub const CR1_TABLE_IC: u64 = genmask(7, 6);
pub const CR1_QUEUE_SH: u64 = genmask(5, 4);
pub const CR1_QUEUE_OC: u64 = genmask(3, 2);
pub const CR1_QUEUE_IC: u64 = genmask(1, 0);
pub const CR1_CACHE_WB: u64 = 1;
pub const SH_ISH: u64 = 3;

/// Tables and queues inner-shareable, write-back cacheable.
pub const fn cr1_value() -> u32 {
    (field_prep(CR1_TABLE_SH, SH_ISH)
        | field_prep(CR1_TABLE_OC, CR1_CACHE_WB)
        | field_prep(CR1_TABLE_IC, CR1_CACHE_WB)
        | field_prep(CR1_QUEUE_SH, SH_ISH)
        | field_prep(CR1_QUEUE_OC, CR1_CACHE_WB)
        | field_prep(CR1_QUEUE_IC, CR1_CACHE_WB)) as u32
}

/// Private TLB maintenance.
pub const CR2_PTM: u32 = 1 << 2;

pub const GBPA_UPDATE: u32 = 1 << 31;
pub const GBPA_ABORT: u32 = 1 << 20;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Gerror: u32 {
        const CMDQ_ERR = 1 << 0;
        const EVTQ_ABT_ERR = 1 << 2;
        const PRIQ_ABT_ERR = 1 << 3;
        const MSI_CMDQ_ABT_ERR = 1 << 4;
        const MSI_EVTQ_ABT_ERR = 1 << 5;
        const MSI_PRIQ_ABT_ERR = 1 << 6;
        const MSI_GERROR_ABT_ERR = 1 << 7;
        /// Service failure mode.
        const SFM_ERR = 1 << 8;
    }
}

impl Gerror {
    /// Errors raised since the last acknowledgement in GERRORN.
    pub fn active(gerror: u32, gerrorn: u32) -> Self {
        Self::from_bits_truncate(gerror ^ gerrorn)
    }
}

// ── Queue base registers ─────────────────────────────────────────────
pub const Q_BASE_RWA: u64 = 1 << 62;
pub const Q_BASE_ADDR_MASK: u64 = genmask(51, 5);
pub const Q_BASE_LOG2SIZE: u64 = genmask(4, 0);

/// Decoded CMDQ_BASE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueBase {
    pub addr: u64,
    pub log2size: u32,
}

/// Largest queue an SMMU may advertise in IDR1.CMDQS.
pub const CMDQ_MAX_LOG2SIZE: u32 = 19;

impl QueueBase {
    pub fn decode(reg: u64) -> Result<Self> {
        if reg & !(Q_BASE_RWA | Q_BASE_ADDR_MASK | Q_BASE_LOG2SIZE) != 0 {
            return Err(IommuError::InvalidArgument);
        }
        let log2size = field_get(Q_BASE_LOG2SIZE, reg) as u32;
        if log2size > CMDQ_MAX_LOG2SIZE {
            return Err(IommuError::InvalidArgument);
        }
        Ok(Self {
            addr: reg & Q_BASE_ADDR_MASK,
            log2size,
        })
    }

    pub const fn encode(&self) -> u64 {
        Q_BASE_RWA | (self.addr & Q_BASE_ADDR_MASK) | field_prep(Q_BASE_LOG2SIZE, self.log2size as u64)
    }
}

// ── Stream table base registers ──────────────────────────────────────
pub const STRTAB_BASE_RA: u64 = 1 << 62;
pub const STRTAB_BASE_ADDR_MASK: u64 = genmask(51, 6);

pub const STRTAB_BASE_CFG_FMT: u64 = genmask(17, 16);
pub const STRTAB_BASE_CFG_SPLIT: u64 = genmask(10, 6);
pub const STRTAB_BASE_CFG_LOG2SIZE: u64 = genmask(5, 0);
pub const STRTAB_BASE_CFG_FMT_LINEAR: u64 = 0;
pub const STRTAB_BASE_CFG_FMT_2LVL: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrtabFmt {
    Linear,
    TwoLevel,
}

/// Decoded STRTAB_BASE + STRTAB_BASE_CFG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrtabCfg {
    pub addr: u64,
    pub fmt: StrtabFmt,
    pub split: u32,
    pub log2size: u32,
}

impl StrtabCfg {
    pub fn decode(base: u64, cfg: u32) -> Result<Self> {
        if base & !(STRTAB_BASE_ADDR_MASK | STRTAB_BASE_RA) != 0 {
            return Err(IommuError::InvalidArgument);
        }
        let cfg = cfg as u64;
        if cfg & !(STRTAB_BASE_CFG_FMT | STRTAB_BASE_CFG_SPLIT | STRTAB_BASE_CFG_LOG2SIZE) != 0 {
            return Err(IommuError::InvalidArgument);
        }

        // StreamIDs are 32 bits
        let log2size = field_get(STRTAB_BASE_CFG_LOG2SIZE, cfg) as u32;
        if log2size > 32 {
            return Err(IommuError::InvalidArgument);
        }
        let split = field_get(STRTAB_BASE_CFG_SPLIT, cfg) as u32;
        let fmt = match field_get(STRTAB_BASE_CFG_FMT, cfg) {
            STRTAB_BASE_CFG_FMT_LINEAR if split == 0 => StrtabFmt::Linear,
            STRTAB_BASE_CFG_FMT_2LVL if matches!(split, 6 | 8 | 10) => StrtabFmt::TwoLevel,
            _ => return Err(IommuError::InvalidArgument),
        };
        Ok(Self {
            addr: base & STRTAB_BASE_ADDR_MASK,
            fmt,
            split,
            log2size,
        })
    }

    pub const fn encode_cfg(&self) -> u32 {
        let fmt = match self.fmt {
            StrtabFmt::Linear => STRTAB_BASE_CFG_FMT_LINEAR,
            StrtabFmt::TwoLevel => STRTAB_BASE_CFG_FMT_2LVL,
        };
        (field_prep(STRTAB_BASE_CFG_FMT, fmt)
            | field_prep(STRTAB_BASE_CFG_SPLIT, self.split as u64)
            | field_prep(STRTAB_BASE_CFG_LOG2SIZE, self.log2size as u64)) as u32
    }
}
