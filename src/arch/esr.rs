//! Data-abort syndrome decoding for emulated register accesses
//!
//! Only the ISS-valid path is handled: accesses the IOMMU emulation accepts
//! are plain 32-bit loads and stores, for which the hardware always reports
//! a valid syndrome.

/// ISS[24]: syndrome fields below are valid.
pub const ESR_ISV: u64 = 1 << 24;
/// Access size, log2 bytes.
const ESR_SAS_SHIFT: u32 = 22;
const ESR_SAS_MASK: u64 = 0x3;
/// Transfer register.
const ESR_SRT_SHIFT: u32 = 16;
const ESR_SRT_MASK: u64 = 0x1f;
/// Write, not read.
pub const ESR_WNR: u64 = 1 << 6;

/// One trapped access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataAbort {
    /// General-purpose register moved to or from (0-30, 31 = xzr).
    pub reg: u8,
    /// Access size in bytes (1, 2, 4, 8).
    pub size: u8,
    pub is_write: bool,
}

impl DataAbort {
    /// `None` when the syndrome does not describe the access.
    pub fn decode(esr: u64) -> Option<Self> {
        if esr & ESR_ISV == 0 {
            return None;
        }
        let sas = (esr >> ESR_SAS_SHIFT) & ESR_SAS_MASK;
        Some(Self {
            reg: ((esr >> ESR_SRT_SHIFT) & ESR_SRT_MASK) as u8,
            size: 1 << sas,
            is_write: esr & ESR_WNR != 0,
        })
    }

    /// Value the access stores, truncated to its size. xzr reads as 0.
    pub fn store_value(&self, regs: &[u64; 31]) -> u64 {
        let val = regs.get(self.reg as usize).copied().unwrap_or(0);
        match self.size {
            8 => val,
            size => val & ((1u64 << (size * 8)) - 1),
        }
    }

    /// Complete a load into the transfer register. Writes to xzr vanish.
    pub fn complete_load(&self, regs: &mut [u64; 31], val: u64) {
        if let Some(reg) = regs.get_mut(self.reg as usize) {
            *reg = val;
        }
    }
}
