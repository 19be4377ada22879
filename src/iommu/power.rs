//! IOMMU device records and power-domain hooks

use super::ops::{Caps, IommuBackend};
use crate::error::Result;
use crate::sync::{SpinLock, SpinLockGuard};

/// How the device's power is controlled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerDomain {
    /// Always on.
    None,
    /// The host reports transitions with a hypercall.
    HostHvc,
    /// Transitions are observed on the SCMI channel to firmware.
    ArmScmi { smc_id: u32, domain_id: u32 },
}

/// Device state protected by the device lock.
pub struct IommuState<S> {
    pub power_is_off: bool,
    pub dev: S,
}

/// One IOMMU instance, as seen by the core.
pub struct HypIommu<S> {
    id: u32,
    power_domain: PowerDomain,
    state: SpinLock<IommuState<S>>,
}

impl<S> HypIommu<S> {
    pub const fn new(id: u32, power_domain: PowerDomain, dev: S) -> Self {
        Self {
            id,
            power_domain,
            state: SpinLock::new(IommuState {
                power_is_off: false,
                dev,
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn power_domain(&self) -> PowerDomain {
        self.power_domain
    }

    /// Take the device lock.
    pub fn lock(&self) -> SpinLockGuard<'_, IommuState<S>> {
        self.state.lock()
    }

    pub fn is_powered_off(&self) -> bool {
        self.state.lock().power_is_off
    }
}

/// Flip the power state and let the backend follow. The previous state is
/// restored if the backend refuses.
pub(super) fn set_power<B: IommuBackend>(
    backend: &B,
    iommu: &HypIommu<B::Device>,
    off: bool,
) -> Result<()> {
    let mut state = iommu.lock();
    let prev = state.power_is_off;
    state.power_is_off = off;

    let caps = backend.caps();
    let ret = if off {
        if caps.contains(Caps::SUSPEND) {
            backend.suspend(iommu, &mut state)
        } else {
            Ok(())
        }
    } else if caps.contains(Caps::RESUME) {
        backend.resume(iommu, &mut state)
    } else {
        Ok(())
    };

    if let Err(err) = ret {
        log::warn!(
            "iommu{}: power {} failed: {}",
            iommu.id(),
            if off { "off" } else { "on" },
            err
        );
        state.power_is_off = prev;
    }
    ret
}
