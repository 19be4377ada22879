use crate::config::SMP_CPUS;
use crate::sync::{SpinLock, SpinLockGuard};

/// Index of a physical core, checked against [`SMP_CPUS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuId(usize);

impl CpuId {
    pub const fn new(id: usize) -> Option<Self> {
        if id < SMP_CPUS {
            Some(Self(id))
        } else {
            None
        }
    }

    /// Core currently executing (MPIDR_EL1.Aff0).
    pub fn current() -> Self {
        let id = crate::arch::current_cpu_id();
        assert!(id < SMP_CPUS, "MPIDR Aff0 out of range");
        Self(id)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

/// One `T` per physical core.
///
/// Each core only touches its own slot, so the lock is never contended; it
/// exists so that handing out `&mut T` is sound without `static mut`.
pub struct PerCpu<T> {
    slots: [SpinLock<T>; SMP_CPUS],
}

impl<T> PerCpu<T> {
    pub fn new_with(mut init: impl FnMut() -> T) -> Self {
        Self {
            slots: core::array::from_fn(|_| SpinLock::new(init())),
        }
    }

    /// Get the context for `cpu`.
    pub fn get(&self, cpu: CpuId) -> SpinLockGuard<'_, T> {
        self.slots[cpu.0].lock()
    }
}

impl<T: Default> Default for PerCpu<T> {
    fn default() -> Self {
        Self::new_with(T::default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_id_bounds() {
        assert!(CpuId::new(0).is_some());
        assert!(CpuId::new(SMP_CPUS - 1).is_some());
        assert!(CpuId::new(SMP_CPUS).is_none());
    }

    #[test]
    fn test_slots_are_independent() {
        let percpu: PerCpu<u32> = PerCpu::default();
        let cpu0 = CpuId::new(0).unwrap();
        let cpu1 = CpuId::new(1).unwrap();
        *percpu.get(cpu0) = 7;
        assert_eq!(*percpu.get(cpu0), 7);
        assert_eq!(*percpu.get(cpu1), 0);
    }
}
