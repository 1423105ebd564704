use super::{
    check_range, AccessError, AccessIntent, AllocationError, MemoryBackend, RawMemory,
};
use crate::{vk, DeviceSize, NonExhaustive};
use parking_lot::RwLock;
use std::{
    ptr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// Parameters to create a new [`BackingStore`].
#[derive(Clone, Debug)]
pub struct StoreCreateInfo {
    /// The size of the store in bytes.
    ///
    /// The default value is `0`, which must be overridden.
    pub capacity: DeviceSize,

    /// Where the memory lives and whether the host can access it.
    ///
    /// The default value is [`AccessIntent::HostVisibleDevice`].
    pub access_intent: AccessIntent,

    /// How the buffer wrapping the memory will be used on the device. Transfer usage is always
    /// added, since growing a store copies its contents.
    ///
    /// Backends that don't create Vulkan buffers ignore this.
    ///
    /// The default value is [`vk::BufferUsageFlags::STORAGE_BUFFER`].
    pub buffer_usage: vk::BufferUsageFlags,

    pub _ne: NonExhaustive,
}

impl Default for StoreCreateInfo {
    #[inline]
    fn default() -> Self {
        StoreCreateInfo {
            capacity: 0,
            access_intent: AccessIntent::HostVisibleDevice,
            buffer_usage: vk::BufferUsageFlags::STORAGE_BUFFER,
            _ne: crate::NE,
        }
    }
}

/// One contiguous block of memory with a fixed capacity.
///
/// Every access is checked against the capacity and fails with
/// [`AccessError::CapacityExceeded`] if it doesn't fit.
#[derive(Debug)]
pub struct BackingStore {
    memory: Box<dyn RawMemory>,
    access_intent: AccessIntent,
    buffer_usage: vk::BufferUsageFlags,
    // Whether anything has ever been written or copied into the store. Growth skips the copy of a
    // store that was never written.
    written: bool,
}

impl BackingStore {
    /// Creates a new `BackingStore` using memory from `backend`.
    ///
    /// # Errors
    ///
    /// - Returns an error if the backend cannot satisfy the requested capacity and access intent.
    pub fn new(
        backend: &dyn MemoryBackend,
        name: &str,
        create_info: &StoreCreateInfo,
    ) -> Result<Self, AllocationError> {
        let memory = backend.allocate(name, create_info)?;

        Ok(BackingStore {
            memory,
            access_intent: create_info.access_intent,
            buffer_usage: create_info.buffer_usage,
            written: false,
        })
    }

    /// Returns the capacity of the store in bytes.
    #[inline]
    pub fn capacity(&self) -> DeviceSize {
        self.memory.capacity()
    }

    #[inline]
    pub fn access_intent(&self) -> AccessIntent {
        self.access_intent
    }

    #[inline]
    pub fn buffer_usage(&self) -> vk::BufferUsageFlags {
        self.buffer_usage
    }

    /// Returns the device address of the start of the store, if it has one.
    #[inline]
    pub fn device_address(&self) -> Option<DeviceSize> {
        self.memory.device_address()
    }

    /// Returns the Vulkan buffer wrapping the store, or a null handle for backends that don't
    /// create buffers.
    #[inline]
    pub fn buffer(&self) -> vk::Buffer {
        self.memory.buffer()
    }

    /// Returns whether anything has been written or copied into the store.
    #[inline]
    pub fn is_written(&self) -> bool {
        self.written
    }

    /// Reads `dst.len()` bytes starting at `src_offset`.
    pub fn read(&self, src_offset: DeviceSize, dst: &mut [u8]) -> Result<(), AccessError> {
        check_range(src_offset, dst.len() as DeviceSize, self.capacity())?;

        self.memory.read(src_offset, dst)
    }

    /// Writes `src` starting at `dst_offset`.
    pub fn write(&mut self, dst_offset: DeviceSize, src: &[u8]) -> Result<(), AccessError> {
        check_range(dst_offset, src.len() as DeviceSize, self.capacity())?;

        self.memory.write(dst_offset, src)?;
        self.written = true;

        Ok(())
    }

    /// Copies `len` bytes from `src_offset` to `dst_offset` within the store. The ranges may
    /// overlap.
    pub fn copy_within(
        &mut self,
        dst_offset: DeviceSize,
        src_offset: DeviceSize,
        len: DeviceSize,
    ) -> Result<(), AccessError> {
        let capacity = self.capacity();
        check_range(src_offset, len, capacity)?;
        check_range(dst_offset, len, capacity)?;

        if len == 0 || dst_offset == src_offset {
            return Ok(());
        }

        self.memory.copy_within(dst_offset, src_offset, len)?;
        self.written = true;

        Ok(())
    }

    /// Copies `len` bytes from `self` at `src_offset` into `dst_store` at `dst_offset`.
    pub fn copy(
        &self,
        dst_store: &mut BackingStore,
        dst_offset: DeviceSize,
        src_offset: DeviceSize,
        len: DeviceSize,
    ) -> Result<(), AccessError> {
        check_range(src_offset, len, self.capacity())?;
        check_range(dst_offset, len, dst_store.capacity())?;

        if len == 0 {
            return Ok(());
        }

        self.memory
            .copy_to(&mut *dst_store.memory, dst_offset, src_offset, len)?;
        dst_store.written = true;

        Ok(())
    }

    /// Creates a new store with a capacity of at least `new_capacity` and the same access intent
    /// and usage, and copies the contents of `self` into it.
    ///
    /// The capacity never shrinks: if `new_capacity` is smaller than the current capacity, the
    /// new store has the current capacity. The copy is skipped if `self` was never written.
    ///
    /// `self` is left untouched, so that if this fails the old store remains valid. On success the
    /// caller is expected to drop `self` in favor of the returned store.
    pub fn grow(
        &self,
        backend: &dyn MemoryBackend,
        name: &str,
        new_capacity: DeviceSize,
    ) -> Result<BackingStore, AllocationError> {
        let capacity = self.capacity();
        let create_info = StoreCreateInfo {
            capacity: new_capacity.max(capacity),
            access_intent: self.access_intent,
            buffer_usage: self.buffer_usage,
            _ne: crate::NE,
        };
        let mut new_store = BackingStore::new(backend, name, &create_info)?;

        if self.written {
            self.copy(&mut new_store, 0, 0, capacity)
                .map_err(AllocationError::TransferFailed)?;
        }

        Ok(new_store)
    }
}

/// A named [`BackingStore`] that can grow in place.
///
/// Shared stores are created by a [`StoreRegistry`] and handed out behind an [`Arc`]. Growth
/// replaces the underlying backing store while the `SharedStore` keeps its identity, so every
/// suballocator and handle referring to it stays valid.
///
/// Reads share the lock of the store. Writes and growth take it exclusively, writes only for the
/// duration of the copy.
///
/// [`StoreRegistry`]: super::StoreRegistry
#[derive(Debug)]
pub struct SharedStore {
    name: Box<str>,
    backend: Arc<dyn MemoryBackend>,
    inner: RwLock<BackingStore>,
    generation: AtomicU64,
}

impl SharedStore {
    /// Creates a new `SharedStore`. Prefer [`StoreRegistry::create_store`] unless the store
    /// doesn't need a registry entry, for example when it is owned by a single suballocator.
    ///
    /// [`StoreRegistry::create_store`]: super::StoreRegistry::create_store
    pub fn new(
        backend: Arc<dyn MemoryBackend>,
        name: impl Into<Box<str>>,
        create_info: &StoreCreateInfo,
    ) -> Result<Arc<Self>, AllocationError> {
        let name = name.into();
        let store = BackingStore::new(&*backend, &name, create_info)?;

        tracing::debug!(
            name = &*name,
            capacity = create_info.capacity,
            access_intent = ?create_info.access_intent,
            "created backing store"
        );

        Ok(Arc::new(SharedStore {
            name,
            backend,
            inner: RwLock::new(store),
            generation: AtomicU64::new(0),
        }))
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn capacity(&self) -> DeviceSize {
        self.inner.read().capacity()
    }

    #[inline]
    pub fn access_intent(&self) -> AccessIntent {
        self.inner.read().access_intent()
    }

    /// Returns the device address of the current backing store. This changes when the store
    /// grows.
    #[inline]
    pub fn device_address(&self) -> Option<DeviceSize> {
        self.inner.read().device_address()
    }

    /// Returns the Vulkan buffer of the current backing store. This changes when the store grows.
    #[inline]
    pub fn buffer(&self) -> vk::Buffer {
        self.inner.read().buffer()
    }

    /// Returns a counter that is incremented every time the store grows.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn read(&self, src_offset: DeviceSize, dst: &mut [u8]) -> Result<(), AccessError> {
        self.inner.read().read(src_offset, dst)
    }

    pub fn write(&self, dst_offset: DeviceSize, src: &[u8]) -> Result<(), AccessError> {
        self.inner.write().write(dst_offset, src)
    }

    pub fn copy_within(
        &self,
        dst_offset: DeviceSize,
        src_offset: DeviceSize,
        len: DeviceSize,
    ) -> Result<(), AccessError> {
        self.inner.write().copy_within(dst_offset, src_offset, len)
    }

    /// Copies `len` bytes from `self` at `src_offset` into `dst` at `dst_offset`.
    pub fn copy_to(
        &self,
        dst: &SharedStore,
        dst_offset: DeviceSize,
        src_offset: DeviceSize,
        len: DeviceSize,
    ) -> Result<(), AccessError> {
        if ptr::eq(self, dst) {
            return self.copy_within(dst_offset, src_offset, len);
        }

        // Lock in address order so that two opposite copies can't deadlock.
        if (self as *const SharedStore) < (dst as *const SharedStore) {
            let src = self.inner.read();
            let mut dst = dst.inner.write();

            src.copy(&mut dst, dst_offset, src_offset, len)
        } else {
            let mut dst = dst.inner.write();
            let src = self.inner.read();

            src.copy(&mut dst, dst_offset, src_offset, len)
        }
    }

    /// Grows the store so that its capacity is at least `new_capacity`, and returns the resulting
    /// capacity. Does nothing if the store is already big enough.
    ///
    /// # Errors
    ///
    /// - Returns an error if the replacement store could not be created or filled. The current
    ///   store is kept in that case.
    pub fn grow(&self, new_capacity: DeviceSize) -> Result<DeviceSize, AllocationError> {
        let mut inner = self.inner.write();
        let old_capacity = inner.capacity();

        if new_capacity <= old_capacity {
            return Ok(old_capacity);
        }

        let new_store = inner.grow(&*self.backend, &self.name, new_capacity)?;
        // The old store is retired here.
        *inner = new_store;
        self.generation.fetch_add(1, Ordering::AcqRel);

        tracing::debug!(
            name = &*self.name,
            old_capacity,
            new_capacity,
            "grew backing store"
        );

        Ok(new_capacity)
    }
}
