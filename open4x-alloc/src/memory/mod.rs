//! Backing stores and the suballocators that divide them.
//!
//! # Memory hierarchies
//!
//! The root of every hierarchy is a [`BackingStore`]: one contiguous block of memory with a fixed
//! capacity, either in host memory or in device memory with an optional host mapping. Stores are
//! created through a [`StoreRegistry`], which hands out [`SharedStore`]s. A shared store can be
//! grown in place: a new, bigger backing store is created, the valid contents are copied forward
//! and the old one is retired, all while the store keeps its name and identity.
//!
//! [Suballocators] divide a region into smaller suballocations. The region is either a shared
//! store or a [`SubRegion`] carved out of a [`LinearAllocator`], so hierarchies of arbitrary height
//! can be built: a per-object stack allocator carved from a global linear allocator carved from a
//! device store, for instance.
//!
//! # Growth
//!
//! Suballocators never fail because their region is full. Instead they grow the region and retry.
//! Offsets of existing suballocations are relative to their region and are unaffected by growth,
//! but the region itself may move within its own parent, so anything caching an absolute address
//! has to re-query it. Every region exposes a [`generation`] that changes whenever that happens.
//!
//! [Suballocators]: suballocator
//! [`SubRegion`]: suballocator::SubRegion
//! [`LinearAllocator`]: suballocator::LinearAllocator
//! [`generation`]: suballocator::Region::generation

pub use self::{
    backend::{HostBackend, HostBackendCreateInfo, MemoryBackend, RawMemory},
    registry::{RegistryError, StoreRegistry},
    store::{BackingStore, SharedStore, StoreCreateInfo},
};
use crate::{vk, DeviceSize};
use std::{error::Error, fmt};

mod backend;
mod registry;
mod store;
pub mod suballocator;
pub mod vulkan;

/// Where the memory of a [`BackingStore`] lives and who gets to touch it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessIntent {
    /// Host memory that the device never reads directly.
    HostOnly,

    /// Device-local memory without a host mapping. Reads and writes from the host are not
    /// possible, only copies.
    DeviceOnly,

    /// Device memory that is also mapped into the host address space.
    HostVisibleDevice,
}

impl AccessIntent {
    /// Returns whether memory with this intent can be read and written from the host.
    #[inline]
    pub const fn is_host_accessible(self) -> bool {
        matches!(self, AccessIntent::HostOnly | AccessIntent::HostVisibleDevice)
    }

    /// Returns whether memory with this intent should live on the device.
    #[inline]
    pub const fn is_device_local(self) -> bool {
        matches!(self, AccessIntent::DeviceOnly | AccessIntent::HostVisibleDevice)
    }
}

/// Error that can be returned when the platform fails to provide a backing store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationError {
    /// There is no memory available on the host.
    OutOfHostMemory,

    /// There is no memory available on the device.
    OutOfDeviceMemory,

    /// A store with a capacity of zero was requested.
    ZeroSized,

    /// The requested size does not fit in the address space.
    CapacityOverflow,

    /// The backend cannot provide memory with the given access intent.
    UnsupportedAccessIntent(AccessIntent),

    /// None of the device's memory types can back the store.
    NoSuitableMemoryType,

    /// Copying the contents of a store into its replacement failed.
    TransferFailed(AccessError),

    /// Some other Vulkan error occurred.
    Vulkan(vk::Result),
}

impl From<vk::Result> for AllocationError {
    fn from(err: vk::Result) -> Self {
        match err {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => AllocationError::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => AllocationError::OutOfDeviceMemory,
            err => AllocationError::Vulkan(err),
        }
    }
}

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfHostMemory => f.write_str("no memory available on the host"),
            Self::OutOfDeviceMemory => f.write_str("no memory available on the device"),
            Self::ZeroSized => f.write_str("tried to create a zero-sized backing store"),
            Self::CapacityOverflow => f.write_str("the requested capacity overflows"),
            Self::UnsupportedAccessIntent(intent) => {
                write!(f, "the backend does not support the access intent {intent:?}")
            }
            Self::NoSuitableMemoryType => {
                f.write_str("no memory type of the device can back the store")
            }
            Self::TransferFailed(_) => {
                f.write_str("copying the contents into the grown store failed")
            }
            Self::Vulkan(result) => write!(f, "a Vulkan error occurred: {result}"),
        }
    }
}

impl Error for AllocationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::TransferFailed(err) => Some(err),
            _ => None,
        }
    }
}

/// Error that can be returned when reading, writing or copying bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessError {
    /// The accessed range does not lie within the store or the suballocation.
    CapacityExceeded {
        offset: DeviceSize,
        len: DeviceSize,
        capacity: DeviceSize,
    },

    /// The memory is not mapped into the host address space.
    NotHostMapped,

    /// A transfer on the device failed.
    Vulkan(vk::Result),
}

impl fmt::Display for AccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapacityExceeded {
                offset,
                len,
                capacity,
            } => write!(
                f,
                "the range {offset}..{} exceeds the capacity of {capacity} bytes",
                offset.saturating_add(*len),
            ),
            Self::NotHostMapped => f.write_str("the memory is not host-mapped"),
            Self::Vulkan(result) => write!(f, "a device transfer failed: {result}"),
        }
    }
}

impl Error for AccessError {}

/// Checks that `offset..offset + len` lies within `0..capacity`.
#[inline]
pub(crate) fn check_range(
    offset: DeviceSize,
    len: DeviceSize,
    capacity: DeviceSize,
) -> Result<(), AccessError> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(AccessError::CapacityExceeded {
            offset,
            len,
            capacity,
        }),
    }
}

/// Rounds `val` up to the next multiple of `alignment`, which must be a power of two.
#[inline(always)]
pub(crate) const fn align_up(val: DeviceSize, alignment: DeviceSize) -> DeviceSize {
    debug_assert!(alignment.is_power_of_two());

    (val + alignment - 1) & !(alignment - 1)
}

#[inline(always)]
pub(crate) const fn is_aligned(val: DeviceSize, alignment: DeviceSize) -> bool {
    val & (alignment - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_checks() {
        assert!(check_range(0, 16, 16).is_ok());
        assert!(check_range(16, 0, 16).is_ok());
        assert_eq!(
            check_range(8, 9, 16),
            Err(AccessError::CapacityExceeded {
                offset: 8,
                len: 9,
                capacity: 16,
            }),
        );
        assert!(check_range(DeviceSize::MAX, 2, DeviceSize::MAX).is_err());
    }

    #[test]
    fn alignment() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert!(is_aligned(128, 64));
        assert!(!is_aligned(130, 64));
    }

    #[test]
    fn vulkan_results_map_to_oom() {
        assert_eq!(
            AllocationError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            AllocationError::OutOfDeviceMemory,
        );
        assert_eq!(
            AllocationError::from(vk::Result::ERROR_INITIALIZATION_FAILED),
            AllocationError::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED),
        );
    }
}
