//! SMMUv3 command queue
//!
//! Commands are two little-endian dwords. The producer index lives in
//! hypervisor memory (shadow state, advanced under the device lock) and is
//! published through CMDQ_PROD; the consumer index is only ever read back
//! from CMDQ_CONS.
//!
//! Both indices carry a wrap bit just above the index bits, so a full queue
//! (same index, different wrap) and an empty one (same index, same wrap) are
//! told apart without giving up a slot.

use super::regs::{field_get, field_prep, genmask};
use crate::mm::phys_to_virt;

pub const CMDQ_ENT_DWORDS: usize = 2;
pub const CMDQ_ENT_SIZE: usize = CMDQ_ENT_DWORDS * 8;

pub const CMDQ_OP_CFGI_STE: u64 = 0x3;
pub const CMDQ_OP_CFGI_ALL: u64 = 0x4;
pub const CMDQ_OP_TLBI_S12_VMALL: u64 = 0x28;
pub const CMDQ_OP_TLBI_S2_IPA: u64 = 0x2a;
pub const CMDQ_OP_TLBI_NSNH_ALL: u64 = 0x30;
pub const CMDQ_OP_CMD_SYNC: u64 = 0x46;

const CMDQ_0_OP: u64 = genmask(7, 0);

const CMDQ_CFGI_0_SID: u64 = genmask(63, 32);
const CMDQ_CFGI_1_LEAF: u64 = 1 << 0;
const CMDQ_CFGI_1_RANGE: u64 = genmask(4, 0);

const CMDQ_TLBI_0_NUM: u64 = genmask(16, 12);
const CMDQ_TLBI_0_SCALE: u64 = genmask(24, 20);
const CMDQ_TLBI_0_VMID: u64 = genmask(47, 32);
const CMDQ_TLBI_1_LEAF: u64 = 1 << 0;
const CMDQ_TLBI_1_TTL: u64 = genmask(9, 8);
const CMDQ_TLBI_1_TG: u64 = genmask(11, 10);
const CMDQ_TLBI_1_IPA_MASK: u64 = genmask(51, 12);

const CMDQ_SYNC_0_CS: u64 = genmask(13, 12);
const CMDQ_SYNC_0_CS_SEV: u64 = 2;

/// Largest `num` a range invalidation can carry.
pub const CMDQ_TLBI_RANGE_NUM_MAX: u64 = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Invalidate every cached configuration structure.
    CfgiAll,
    /// Invalidate the cached STE of one stream.
    CfgiSte { sid: u32, leaf: bool },
    /// Invalidate all non-secure, non-hyp TLB entries.
    TlbiNsnhAll,
    /// Invalidate all stage-1 and stage-2 entries of one VMID.
    TlbiS12Vmall { vmid: u16 },
    /// Invalidate stage-2 entries for an IPA (range when `num`/`scale` are
    /// used).
    TlbiS2Ipa {
        vmid: u16,
        num: u8,
        scale: u8,
        leaf: bool,
        ttl: u8,
        tg: u8,
        addr: u64,
    },
    /// Completion barrier; signals an event when consumed.
    Sync,
}

impl Command {
    pub const fn opcode(&self) -> u64 {
        match self {
            Command::CfgiAll => CMDQ_OP_CFGI_ALL,
            Command::CfgiSte { .. } => CMDQ_OP_CFGI_STE,
            Command::TlbiNsnhAll => CMDQ_OP_TLBI_NSNH_ALL,
            Command::TlbiS12Vmall { .. } => CMDQ_OP_TLBI_S12_VMALL,
            Command::TlbiS2Ipa { .. } => CMDQ_OP_TLBI_S2_IPA,
            Command::Sync => CMDQ_OP_CMD_SYNC,
        }
    }

    pub fn encode(&self) -> [u64; CMDQ_ENT_DWORDS] {
        let mut cmd = [field_prep(CMDQ_0_OP, self.opcode()), 0];
        match *self {
            Command::CfgiAll => {
                cmd[1] |= field_prep(CMDQ_CFGI_1_RANGE, 31);
            }
            Command::CfgiSte { sid, leaf } => {
                cmd[0] |= field_prep(CMDQ_CFGI_0_SID, sid as u64);
                cmd[1] |= field_prep(CMDQ_CFGI_1_LEAF, leaf as u64);
            }
            Command::TlbiNsnhAll => {}
            Command::TlbiS12Vmall { vmid } => {
                cmd[0] |= field_prep(CMDQ_TLBI_0_VMID, vmid as u64);
            }
            Command::TlbiS2Ipa {
                vmid,
                num,
                scale,
                leaf,
                ttl,
                tg,
                addr,
            } => {
                cmd[0] |= field_prep(CMDQ_TLBI_0_NUM, num as u64);
                cmd[0] |= field_prep(CMDQ_TLBI_0_SCALE, scale as u64);
                cmd[0] |= field_prep(CMDQ_TLBI_0_VMID, vmid as u64);
                cmd[1] |= field_prep(CMDQ_TLBI_1_LEAF, leaf as u64);
                cmd[1] |= field_prep(CMDQ_TLBI_1_TTL, ttl as u64);
                cmd[1] |= field_prep(CMDQ_TLBI_1_TG, tg as u64);
                cmd[1] |= addr & CMDQ_TLBI_1_IPA_MASK;
            }
            Command::Sync => {
                cmd[0] |= field_prep(CMDQ_SYNC_0_CS, CMDQ_SYNC_0_CS_SEV);
            }
        }
        cmd
    }

    /// Inverse of [`Command::encode`] for the opcodes issued here.
    pub fn decode(cmd: [u64; CMDQ_ENT_DWORDS]) -> Option<Self> {
        let decoded = match field_get(CMDQ_0_OP, cmd[0]) {
            CMDQ_OP_CFGI_ALL => Command::CfgiAll,
            CMDQ_OP_CFGI_STE => Command::CfgiSte {
                sid: field_get(CMDQ_CFGI_0_SID, cmd[0]) as u32,
                leaf: cmd[1] & CMDQ_CFGI_1_LEAF != 0,
            },
            CMDQ_OP_TLBI_NSNH_ALL => Command::TlbiNsnhAll,
            CMDQ_OP_TLBI_S12_VMALL => Command::TlbiS12Vmall {
                vmid: field_get(CMDQ_TLBI_0_VMID, cmd[0]) as u16,
            },
            CMDQ_OP_TLBI_S2_IPA => Command::TlbiS2Ipa {
                vmid: field_get(CMDQ_TLBI_0_VMID, cmd[0]) as u16,
                num: field_get(CMDQ_TLBI_0_NUM, cmd[0]) as u8,
                scale: field_get(CMDQ_TLBI_0_SCALE, cmd[0]) as u8,
                leaf: cmd[1] & CMDQ_TLBI_1_LEAF != 0,
                ttl: field_get(CMDQ_TLBI_1_TTL, cmd[1]) as u8,
                tg: field_get(CMDQ_TLBI_1_TG, cmd[1]) as u8,
                addr: cmd[1] & CMDQ_TLBI_1_IPA_MASK,
            },
            CMDQ_OP_CMD_SYNC => Command::Sync,
            _ => return None,
        };
        Some(decoded)
    }
}

/// Shadow state of a command queue in hypervisor-owned memory.
#[derive(Debug)]
pub struct Cmdq {
    base: u64,
    log2size: u32,
    /// Index and wrap bit of the next free slot.
    prod: u32,
}

impl Cmdq {
    pub const fn empty() -> Self {
        Self {
            base: 0,
            log2size: 0,
            prod: 0,
        }
    }

    /// `base` must point at `1 << log2size` zeroed entries owned by the
    /// hypervisor.
    pub const fn new(base: u64, log2size: u32) -> Self {
        Self {
            base,
            log2size,
            prod: 0,
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn entries(&self) -> usize {
        1 << self.log2size
    }

    pub fn size_bytes(&self) -> usize {
        self.entries() * CMDQ_ENT_SIZE
    }

    fn idx(&self, reg: u32) -> u32 {
        reg & ((1 << self.log2size) - 1)
    }

    fn wrap(&self, reg: u32) -> u32 {
        reg & (1 << self.log2size)
    }

    /// Producer value in CMDQ_PROD format.
    pub fn prod(&self) -> u32 {
        self.prod
    }

    pub fn is_full(&self, cons: u32) -> bool {
        self.idx(self.prod) == self.idx(cons) && self.wrap(self.prod) != self.wrap(cons)
    }

    pub fn is_empty(&self, cons: u32) -> bool {
        self.idx(self.prod) == self.idx(cons) && self.wrap(self.prod) == self.wrap(cons)
    }

    /// Write `cmd` at the producer slot and advance the producer. The caller
    /// has checked that the queue is not full and publishes the new
    /// producer to the hardware.
    pub fn push(&mut self, cmd: &Command) {
        let slot = self.idx(self.prod) as usize;
        let ptr = phys_to_virt(self.base) as *mut u64;
        for (i, dword) in cmd.encode().iter().enumerate() {
            unsafe {
                core::ptr::write_volatile(ptr.add(slot * CMDQ_ENT_DWORDS + i), dword.to_le());
            }
        }
        let mask = (2u32 << self.log2size) - 1;
        self.prod = self.prod.wrapping_add(1) & mask;
    }

    /// Reset producer shadow state, e.g. after CMDQ_PROD was cleared.
    pub fn reset(&mut self) {
        self.prod = 0;
    }
}

/// Commands covering one stage-2 invalidation.
///
/// With range invalidation each command covers up to 31 chunks of
/// `2^scale` pages; without, one command per `granule`.
pub struct TlbiRange {
    vmid: u16,
    leaf: bool,
    iova: u64,
    end: u64,
    granule: u64,
    /// Range mode: log2 of the leaf page size and remaining page count.
    range: Option<(u32, u64)>,
    tg: u8,
    ttl: u8,
}

impl TlbiRange {
    /// `pgsize_bitmap` of the domain's page table; `ril` if the SMMU
    /// supports range invalidation.
    pub fn new(
        vmid: u16,
        iova: u64,
        size: u64,
        granule: u64,
        leaf: bool,
        pgsize_bitmap: u64,
        ril: bool,
    ) -> Self {
        let mut this = Self {
            vmid,
            leaf,
            iova,
            end: iova.saturating_add(size),
            granule,
            range: None,
            tg: 0,
            ttl: 0,
        };
        if ril && size > 0 {
            let tg = pgsize_bitmap.trailing_zeros();
            let mut num_pages = size >> tg;
            // log2 page size 12, 14, 16 -> 1, 2, 3
            this.tg = ((tg - 10) / 2) as u8;
            if leaf {
                this.ttl = (4 - ((granule.ilog2() - 3) / (tg - 3))) as u8;
            } else if num_pages & CMDQ_TLBI_RANGE_NUM_MAX == 1 {
                // Non-leaf walks must not use NUM=0 with TTL=0
                num_pages += 1;
            }
            this.range = Some((tg, num_pages));
        }
        this
    }
}

impl Iterator for TlbiRange {
    type Item = Command;

    fn next(&mut self) -> Option<Command> {
        if self.iova >= self.end {
            return None;
        }
        let (num, scale, inv_range) = match &mut self.range {
            Some((tg, num_pages)) => {
                if *num_pages == 0 {
                    return None;
                }
                let scale = num_pages.trailing_zeros();
                let num = (*num_pages >> scale) & CMDQ_TLBI_RANGE_NUM_MAX;
                *num_pages -= num << scale;
                ((num - 1) as u8, scale as u8, num << (scale + *tg))
            }
            None => (0, 0, self.granule),
        };
        let cmd = Command::TlbiS2Ipa {
            vmid: self.vmid,
            num,
            scale,
            leaf: self.leaf,
            ttl: self.ttl,
            tg: self.tg,
            addr: self.iova,
        };
        self.iova = self.iova.saturating_add(inv_range);
        Some(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    #[test]
    fn test_encode_sync_and_cfgi() {
        assert_eq!(Command::Sync.encode(), [0x46 | (2 << 12), 0]);
        assert_eq!(Command::CfgiAll.encode(), [0x4, 31]);
        assert_eq!(
            Command::CfgiSte { sid: 100, leaf: true }.encode(),
            [0x3 | (100 << 32), 1]
        );
        assert_eq!(Command::TlbiNsnhAll.encode(), [0x30, 0]);
        assert_eq!(Command::TlbiS12Vmall { vmid: 5 }.encode(), [0x28 | (5 << 32), 0]);
    }

    #[test]
    fn test_encode_tlbi_s2_ipa() {
        let cmd = Command::TlbiS2Ipa {
            vmid: 7,
            num: 3,
            scale: 2,
            leaf: true,
            ttl: 3,
            tg: 1,
            addr: 0x1234_5000,
        };
        let raw = cmd.encode();
        assert_eq!(raw[0], 0x2a | (3 << 12) | (2 << 20) | (7 << 32));
        assert_eq!(raw[1], 1 | (3 << 8) | (1 << 10) | 0x1234_5000);
        assert_eq!(Command::decode(raw), Some(cmd));
    }

    #[test]
    fn test_decode_unknown_opcode() {
        assert_eq!(Command::decode([0x11, 0]), None);
    }

    #[test]
    fn test_queue_full_and_empty() {
        let mut backing = [0u64; 4 * CMDQ_ENT_DWORDS];
        let mut q = Cmdq::new(backing.as_mut_ptr() as u64, 2);
        assert!(q.is_empty(0));
        for _ in 0..4 {
            assert!(!q.is_full(0));
            q.push(&Command::TlbiNsnhAll);
        }
        // Index wrapped back to 0 with the wrap bit flipped
        assert_eq!(q.prod(), 1 << 2);
        assert!(q.is_full(0));
        assert!(!q.is_empty(0));
        assert!(q.is_empty(1 << 2));
        assert_eq!(backing[6], 0x30);
    }

    #[test]
    fn test_prod_wraps_twice() {
        let mut backing = [0u64; 2 * CMDQ_ENT_DWORDS];
        let mut q = Cmdq::new(backing.as_mut_ptr() as u64, 1);
        for _ in 0..4 {
            q.push(&Command::Sync);
        }
        assert_eq!(q.prod(), 0);
        assert!(q.is_empty(0));
    }

    #[test]
    fn test_tlbi_per_granule() {
        let cmds: Vec<_> = TlbiRange::new(1, 0x1000, 0x4000, 0x1000, true, 0x1000, false).collect();
        assert_eq!(cmds.len(), 4);
        assert!(matches!(cmds[3], Command::TlbiS2Ipa { addr: 0x4000, num: 0, scale: 0, .. }));
    }

    #[test]
    fn test_tlbi_range_single_command() {
        // 4 pages of 4K: scale 2, num 1
        let cmds: Vec<_> =
            TlbiRange::new(1, 0x1000, 0x4000, 0x1000, true, 0x4020_1000, true).collect();
        assert_eq!(
            cmds,
            [Command::TlbiS2Ipa {
                vmid: 1,
                num: 0,
                scale: 2,
                leaf: true,
                ttl: 3,
                tg: 1,
                addr: 0x1000,
            }]
        );
    }

    #[test]
    fn test_tlbi_range_split() {
        // 33 pages: 1 page (scale 0), then 32 pages (scale 5, num 1)
        let cmds: Vec<_> =
            TlbiRange::new(2, 0, 33 * 0x1000, 0x1000, true, 0x1000, true).collect();
        assert_eq!(cmds.len(), 2);
        assert!(matches!(cmds[0], Command::TlbiS2Ipa { num: 0, scale: 0, addr: 0, .. }));
        assert!(matches!(cmds[1], Command::TlbiS2Ipa { num: 0, scale: 5, addr: 0x1000, .. }));
    }
}
