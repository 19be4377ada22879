//! Architecture-specific primitives
//!
//! Barriers, event wait/signal, the generic-timer delay and the core id.
//! Non-ARM64 builds (host unit tests) get functionally equivalent fallbacks.

pub mod esr;

#[cfg(not(target_arch = "aarch64"))]
use core::sync::atomic::{fence, Ordering};

/// Read current physical CPU ID from MPIDR_EL1.Aff0
#[inline(always)]
pub fn current_cpu_id() -> usize {
    #[cfg(target_arch = "aarch64")]
    {
        let mpidr: u64;
        unsafe { core::arch::asm!("mrs {}, MPIDR_EL1", out(reg) mpidr, options(nomem, nostack)) };
        (mpidr & 0xFF) as usize
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        0
    }
}

/// Wait for event. Returns on SEV, an interrupt, or spuriously.
#[inline(always)]
pub fn wfe() {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!("wfe", options(nomem, nostack))
    };
    #[cfg(not(target_arch = "aarch64"))]
    core::hint::spin_loop();
}

/// Send event to all cores.
#[inline(always)]
pub fn sev() {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!("sev", options(nomem, nostack))
    };
}

/// Order normal-memory stores before a following store observed by a device
/// (e.g. zeroed table before the descriptor pointing at it).
#[inline(always)]
pub fn wmb() {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!("dsb st", options(nostack))
    };
    #[cfg(not(target_arch = "aarch64"))]
    fence(Ordering::Release);
}

/// Full system barrier before an MMIO write that publishes memory
/// (e.g. the command-queue producer register).
#[inline(always)]
pub fn mb() {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!("dsb sy", options(nostack))
    };
    #[cfg(not(target_arch = "aarch64"))]
    fence(Ordering::SeqCst);
}

/// Busy-wait for `us` microseconds using the generic timer.
pub fn udelay(us: u64) {
    #[cfg(target_arch = "aarch64")]
    {
        let freq: u64;
        let start: u64;
        unsafe {
            core::arch::asm!("mrs {}, cntfrq_el0", out(reg) freq, options(nomem, nostack));
            core::arch::asm!("isb", "mrs {}, cntpct_el0", out(reg) start, options(nomem, nostack));
        }
        let ticks = freq.saturating_mul(us) / 1_000_000;
        loop {
            let now: u64;
            unsafe {
                core::arch::asm!("isb", "mrs {}, cntpct_el0", out(reg) now, options(nomem, nostack));
            }
            if now.wrapping_sub(start) >= ticks {
                break;
            }
            core::hint::spin_loop();
        }
    }
    #[cfg(not(target_arch = "aarch64"))]
    for _ in 0..us {
        core::hint::spin_loop();
    }
}

/// `idx` if `idx < size`, 0 otherwise, without a branch the CPU can
/// speculate past. `size` must be non-zero.
#[inline(always)]
pub fn index_nospec(idx: u64, size: u64) -> u64 {
    let mask = !((idx | size.wrapping_sub(1).wrapping_sub(idx)) as i64 >> 63) as u64;
    idx & mask
}
