//! Error taxonomy shared by the IOMMU core and its backends.
//!
//! Host-facing calls flatten these into negative errno values, the same
//! convention the host kernel driver expects from the hypervisor.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IommuError {
    /// Bad id, bad configuration, or protocol misuse by the caller.
    InvalidArgument,
    /// No IOMMU instance with the given id.
    NotFound,
    /// Conflicting state, e.g. domain bound to another IOMMU.
    Busy,
    /// Reference count saturation.
    Overflow,
    /// Pool exhausted; a memory request has been posted for the host.
    OutOfMemory,
    /// Hardware did not respond within the polling bound.
    Timeout,
    /// Hardware reported an unrecoverable failure.
    Io,
    /// Device is powered off.
    Unavailable,
}

pub type Result<T> = core::result::Result<T, IommuError>;

// Linux errno values, as seen by the host.
const EIO: i32 = 5;
const ENOMEM: i32 = 12;
const EBUSY: i32 = 16;
const ENODEV: i32 = 19;
const EINVAL: i32 = 22;
const EPIPE: i32 = 32;
const EOVERFLOW: i32 = 75;
const ETIMEDOUT: i32 = 110;

impl IommuError {
    /// Negative errno for the host-facing call surface.
    pub const fn to_errno(self) -> i32 {
        -match self {
            IommuError::InvalidArgument => EINVAL,
            IommuError::NotFound => ENODEV,
            IommuError::Busy => EBUSY,
            IommuError::Overflow => EOVERFLOW,
            IommuError::OutOfMemory => ENOMEM,
            IommuError::Timeout => ETIMEDOUT,
            IommuError::Io => EIO,
            IommuError::Unavailable => EPIPE,
        }
    }

    pub const fn from_errno(errno: i32) -> Option<Self> {
        Some(match -errno {
            EINVAL => IommuError::InvalidArgument,
            ENODEV => IommuError::NotFound,
            EBUSY => IommuError::Busy,
            EOVERFLOW => IommuError::Overflow,
            ENOMEM => IommuError::OutOfMemory,
            ETIMEDOUT => IommuError::Timeout,
            EIO => IommuError::Io,
            EPIPE => IommuError::Unavailable,
            _ => return None,
        })
    }
}

impl fmt::Display for IommuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            IommuError::InvalidArgument => "invalid argument",
            IommuError::NotFound => "no such IOMMU",
            IommuError::Busy => "resource busy",
            IommuError::Overflow => "reference count overflow",
            IommuError::OutOfMemory => "out of memory, request posted",
            IommuError::Timeout => "hardware poll timed out",
            IommuError::Io => "hardware service failure",
            IommuError::Unavailable => "device powered off",
        };
        f.write_str(msg)
    }
}
