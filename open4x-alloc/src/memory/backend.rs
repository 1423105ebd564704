use super::{AccessError, AccessIntent, AllocationError, StoreCreateInfo};
use crate::{vk, DeviceSize, NonExhaustive};
use std::{
    any::Any,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// Provides the raw memory that [`BackingStore`]s are made of.
///
/// The backend is shared by every store created through the same [`StoreRegistry`], and is also
/// used to create the replacement memory when a store grows.
///
/// [`BackingStore`]: super::BackingStore
/// [`StoreRegistry`]: super::StoreRegistry
pub trait MemoryBackend: Send + Sync + fmt::Debug {
    /// Allocates a new block of memory of `create_info.capacity` bytes, zero-initialized if it is
    /// host-visible. `name` is only used for debugging.
    fn allocate(
        &self,
        name: &str,
        create_info: &StoreCreateInfo,
    ) -> Result<Box<dyn RawMemory>, AllocationError>;
}

/// A block of memory handed out by a [`MemoryBackend`].
///
/// Implementations don't need to bounds-check offsets: [`BackingStore`] verifies every range
/// against [`capacity`] before calling into the raw memory.
///
/// [`BackingStore`]: super::BackingStore
/// [`capacity`]: Self::capacity
pub trait RawMemory: Send + Sync + fmt::Debug {
    /// Returns the size of the memory block in bytes.
    fn capacity(&self) -> DeviceSize;

    /// Returns whether the memory can be read and written from the host.
    fn is_host_mapped(&self) -> bool;

    /// Returns the device address of the start of the block, if it has one.
    fn device_address(&self) -> Option<DeviceSize> {
        None
    }

    /// Returns the Vulkan buffer that wraps this memory, or a null handle.
    fn buffer(&self) -> vk::Buffer {
        vk::Buffer::null()
    }

    fn read(&self, offset: DeviceSize, dst: &mut [u8]) -> Result<(), AccessError>;

    fn write(&mut self, offset: DeviceSize, src: &[u8]) -> Result<(), AccessError>;

    /// Copies `len` bytes from `src_offset` to `dst_offset`. The ranges may overlap.
    fn copy_within(
        &mut self,
        dst_offset: DeviceSize,
        src_offset: DeviceSize,
        len: DeviceSize,
    ) -> Result<(), AccessError>;

    /// Copies `len` bytes from `self` at `src_offset` into `dst` at `dst_offset`.
    ///
    /// The default implementation goes through a host staging buffer, which requires both blocks
    /// to be host-mapped. Backends override this to copy on the device.
    fn copy_to(
        &self,
        dst: &mut dyn RawMemory,
        dst_offset: DeviceSize,
        src_offset: DeviceSize,
        len: DeviceSize,
    ) -> Result<(), AccessError> {
        let len = usize::try_from(len).map_err(|_| AccessError::CapacityExceeded {
            offset: src_offset,
            len,
            capacity: self.capacity(),
        })?;
        let mut staging = vec![0; len];
        self.read(src_offset, &mut staging)?;

        dst.write(dst_offset, &staging)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Parameters to create a new `HostBackend`.
#[derive(Clone, Debug)]
pub struct HostBackendCreateInfo {
    /// The maximum number of bytes that may be allocated at the same time. Allocations beyond
    /// that fail with [`AllocationError::OutOfHostMemory`], or
    /// [`AllocationError::OutOfDeviceMemory`] for device access intents.
    ///
    /// The default value is `None`, which means no limit other than the system's.
    pub budget: Option<DeviceSize>,

    pub _ne: NonExhaustive,
}

impl Default for HostBackendCreateInfo {
    #[inline]
    fn default() -> Self {
        HostBackendCreateInfo {
            budget: None,
            _ne: crate::NE,
        }
    }
}

/// A [`MemoryBackend`] that keeps every store in host memory.
///
/// Device access intents are emulated: [`AccessIntent::DeviceOnly`] memory can only be copied,
/// never read or written from the host, and every block gets a unique fake device address so that
/// descriptors can be encoded for it.
#[derive(Debug)]
pub struct HostBackend {
    budget: Option<DeviceSize>,
    used: Arc<AtomicU64>,
    next_address: AtomicU64,
}

impl HostBackend {
    const ADDRESS_ALIGNMENT: DeviceSize = 256;

    /// Creates a new `HostBackend`.
    pub fn new(create_info: HostBackendCreateInfo) -> Self {
        let HostBackendCreateInfo { budget, _ne: _ } = create_info;

        HostBackend {
            budget,
            used: Arc::new(AtomicU64::new(0)),
            next_address: AtomicU64::new(Self::ADDRESS_ALIGNMENT),
        }
    }

    /// Returns the number of bytes that are currently allocated.
    #[inline]
    pub fn used(&self) -> DeviceSize {
        self.used.load(Ordering::Relaxed)
    }

    fn reserve_budget(
        &self,
        capacity: DeviceSize,
        intent: AccessIntent,
    ) -> Result<(), AllocationError> {
        let oom = if intent.is_device_local() {
            AllocationError::OutOfDeviceMemory
        } else {
            AllocationError::OutOfHostMemory
        };

        self.used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                let new_used = used.checked_add(capacity)?;

                match self.budget {
                    Some(budget) if new_used > budget => None,
                    _ => Some(new_used),
                }
            })
            .map(|_| ())
            .map_err(|_| oom)
    }
}

impl Default for HostBackend {
    #[inline]
    fn default() -> Self {
        HostBackend::new(HostBackendCreateInfo::default())
    }
}

impl MemoryBackend for HostBackend {
    fn allocate(
        &self,
        _name: &str,
        create_info: &StoreCreateInfo,
    ) -> Result<Box<dyn RawMemory>, AllocationError> {
        let capacity = create_info.capacity;
        let intent = create_info.access_intent;

        if capacity == 0 {
            return Err(AllocationError::ZeroSized);
        }

        let len = usize::try_from(capacity).map_err(|_| AllocationError::CapacityOverflow)?;

        self.reserve_budget(capacity, intent)?;

        let mut bytes = Vec::new();

        if bytes.try_reserve_exact(len).is_err() {
            self.used.fetch_sub(capacity, Ordering::Relaxed);

            return Err(AllocationError::OutOfHostMemory);
        }

        bytes.resize(len, 0);

        let address = self.next_address.fetch_add(
            super::align_up(capacity, Self::ADDRESS_ALIGNMENT),
            Ordering::Relaxed,
        );

        Ok(Box::new(HostMemory {
            bytes,
            intent,
            address,
            used: self.used.clone(),
        }))
    }
}

#[derive(Debug)]
struct HostMemory {
    bytes: Vec<u8>,
    intent: AccessIntent,
    address: DeviceSize,
    used: Arc<AtomicU64>,
}

impl HostMemory {
    fn range(&self, offset: DeviceSize, len: usize) -> std::ops::Range<usize> {
        let start = offset as usize;
        debug_assert!(start + len <= self.bytes.len());

        start..start + len
    }
}

impl RawMemory for HostMemory {
    #[inline]
    fn capacity(&self) -> DeviceSize {
        self.bytes.len() as DeviceSize
    }

    #[inline]
    fn is_host_mapped(&self) -> bool {
        self.intent.is_host_accessible()
    }

    #[inline]
    fn device_address(&self) -> Option<DeviceSize> {
        self.intent.is_device_local().then_some(self.address)
    }

    fn read(&self, offset: DeviceSize, dst: &mut [u8]) -> Result<(), AccessError> {
        if !self.is_host_mapped() {
            return Err(AccessError::NotHostMapped);
        }

        dst.copy_from_slice(&self.bytes[self.range(offset, dst.len())]);

        Ok(())
    }

    fn write(&mut self, offset: DeviceSize, src: &[u8]) -> Result<(), AccessError> {
        if !self.is_host_mapped() {
            return Err(AccessError::NotHostMapped);
        }

        let range = self.range(offset, src.len());
        self.bytes[range].copy_from_slice(src);

        Ok(())
    }

    fn copy_within(
        &mut self,
        dst_offset: DeviceSize,
        src_offset: DeviceSize,
        len: DeviceSize,
    ) -> Result<(), AccessError> {
        let src = self.range(src_offset, len as usize);
        self.bytes.copy_within(src, dst_offset as usize);

        Ok(())
    }

    fn copy_to(
        &self,
        dst: &mut dyn RawMemory,
        dst_offset: DeviceSize,
        src_offset: DeviceSize,
        len: DeviceSize,
    ) -> Result<(), AccessError> {
        let src = self.range(src_offset, len as usize);

        // Both blocks live on the host, so this stands in for a device-side transfer and works
        // regardless of the host mapping.
        if let Some(dst) = dst.as_any_mut().downcast_mut::<HostMemory>() {
            let dst_range = dst.range(dst_offset, len as usize);
            dst.bytes[dst_range].copy_from_slice(&self.bytes[src]);

            return Ok(());
        }

        dst.write(dst_offset, &self.bytes[src])
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        self.used
            .fetch_sub(self.bytes.len() as DeviceSize, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_info(capacity: DeviceSize, access_intent: AccessIntent) -> StoreCreateInfo {
        StoreCreateInfo {
            capacity,
            access_intent,
            ..Default::default()
        }
    }

    #[test]
    fn host_memory_is_zeroed() {
        let backend = HostBackend::default();
        let memory = backend
            .allocate("zeroed", &create_info(64, AccessIntent::HostOnly))
            .unwrap();

        let mut bytes = [0xff; 64];
        memory.read(0, &mut bytes).unwrap();
        assert_eq!(bytes, [0; 64]);
        assert_eq!(memory.device_address(), None);
    }

    #[test]
    fn budget_is_enforced_and_released() {
        let backend = HostBackend::new(HostBackendCreateInfo {
            budget: Some(100),
            ..Default::default()
        });

        let a = backend
            .allocate("a", &create_info(60, AccessIntent::HostOnly))
            .unwrap();
        assert_eq!(
            backend
                .allocate("b", &create_info(60, AccessIntent::HostOnly))
                .unwrap_err(),
            AllocationError::OutOfHostMemory,
        );
        assert_eq!(
            backend
                .allocate("b", &create_info(60, AccessIntent::DeviceOnly))
                .unwrap_err(),
            AllocationError::OutOfDeviceMemory,
        );
        assert_eq!(backend.used(), 60);

        drop(a);
        assert_eq!(backend.used(), 0);
        backend
            .allocate("b", &create_info(100, AccessIntent::HostOnly))
            .unwrap();
    }

    #[test]
    fn zero_sized_is_rejected() {
        let backend = HostBackend::default();

        assert_eq!(
            backend
                .allocate("empty", &create_info(0, AccessIntent::HostOnly))
                .unwrap_err(),
            AllocationError::ZeroSized,
        );
    }

    #[test]
    fn device_only_memory_is_not_mapped() {
        let backend = HostBackend::default();
        let mut src = backend
            .allocate("src", &create_info(16, AccessIntent::DeviceOnly))
            .unwrap();
        let mut dst = backend
            .allocate("dst", &create_info(16, AccessIntent::HostVisibleDevice))
            .unwrap();

        assert_eq!(src.write(0, &[1; 4]), Err(AccessError::NotHostMapped));
        assert!(src.device_address().is_some());
        assert_ne!(src.device_address(), dst.device_address());

        // Device-side copies still work.
        dst.write(0, &[7; 16]).unwrap();
        dst.copy_to(&mut *src, 0, 0, 16).unwrap();
        dst.write(0, &[0; 16]).unwrap();
        src.copy_to(&mut *dst, 4, 0, 8).unwrap();

        let mut bytes = [0; 16];
        dst.read(0, &mut bytes).unwrap();
        assert_eq!(bytes, [0, 0, 0, 0, 7, 7, 7, 7, 7, 7, 7, 7, 0, 0, 0, 0]);
    }
}
