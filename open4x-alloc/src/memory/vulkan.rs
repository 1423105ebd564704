//! A [`MemoryBackend`] that allocates real Vulkan buffers.
//!
//! Every backing store becomes one `VkBuffer` bound to its own dedicated `VkDeviceMemory`. Stores
//! are large and few, so dedicated allocations are the right granularity here. Host-visible memory
//! is mapped once when it is allocated and stays mapped until the store is dropped. Copies that
//! involve memory the host can't see are recorded into a one-shot command buffer, submitted to the
//! transfer queue and waited on.
//!
//! The device is created by the renderer and handed in ready to use. If stores are created with
//! uniform, storage or descriptor-buffer usage, the device must have the `bufferDeviceAddress`
//! feature enabled unless [`VulkanBackendCreateInfo::buffer_device_address`] is turned off.

use super::{
    AccessError, AccessIntent, AllocationError, MemoryBackend, RawMemory, StoreCreateInfo,
};
use crate::{vk, DeviceSize, NonExhaustive};
use parking_lot::Mutex;
use std::{any::Any, ffi::CString, fmt, ptr, ptr::NonNull, sync::Arc};

/// Parameters to create a new [`VulkanBackend`].
#[derive(Clone, Debug)]
pub struct VulkanBackendCreateInfo {
    /// The queue that copies are submitted to. It must support transfer operations, and must not
    /// be used from elsewhere while a copy is in progress.
    ///
    /// The default value is a null handle, which must be overridden.
    pub queue: vk::Queue,

    /// The queue family that `queue` belongs to.
    ///
    /// The default value is `0`.
    pub queue_family_index: u32,

    /// Whether to create buffers with uniform, storage or descriptor-buffer usage with
    /// `SHADER_DEVICE_ADDRESS`, so that their device address can be queried.
    ///
    /// The default value is `true`.
    pub buffer_device_address: bool,

    /// Whether `VK_EXT_debug_utils` is enabled on the instance, in which case buffers and memory
    /// are given the name of their store.
    ///
    /// The default value is `false`.
    pub debug_utils: bool,

    pub _ne: NonExhaustive,
}

impl Default for VulkanBackendCreateInfo {
    #[inline]
    fn default() -> Self {
        VulkanBackendCreateInfo {
            queue: vk::Queue::null(),
            queue_family_index: 0,
            buffer_device_address: true,
            debug_utils: false,
            _ne: crate::NE,
        }
    }
}

/// A [`MemoryBackend`] that creates a Vulkan buffer with dedicated device memory for every store.
pub struct VulkanBackend {
    shared: Arc<DeviceShared>,
}

struct DeviceShared {
    device: ash::Device,
    memory_types: Vec<vk::MemoryType>,
    queue: vk::Queue,
    // The pool is also what serializes submissions to the queue.
    command_pool: Mutex<vk::CommandPool>,
    buffer_device_address: bool,
    debug_utils: Option<ash::ext::debug_utils::Device>,
}

impl VulkanBackend {
    /// Creates a new `VulkanBackend` that allocates from `device`.
    ///
    /// # Safety
    ///
    /// - `device` must have been created from `physical_device`, which must belong to `instance`.
    /// - `create_info.queue` must be a queue of `device` from the queue family
    ///   `create_info.queue_family_index`.
    /// - `device` must outlive the backend and every store allocated from it.
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        create_info: VulkanBackendCreateInfo,
    ) -> Result<Self, AllocationError> {
        let VulkanBackendCreateInfo {
            queue,
            queue_family_index,
            buffer_device_address,
            debug_utils,
            _ne: _,
        } = create_info;

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let memory_types = memory_properties.memory_types
            [..memory_properties.memory_type_count as usize]
            .to_vec();

        let command_pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::default()
                    .flags(vk::CommandPoolCreateFlags::TRANSIENT)
                    .queue_family_index(queue_family_index),
                None,
            )
        }?;

        let debug_utils =
            debug_utils.then(|| ash::ext::debug_utils::Device::new(instance, &device));

        Ok(VulkanBackend {
            shared: Arc::new(DeviceShared {
                device,
                memory_types,
                queue,
                command_pool: Mutex::new(command_pool),
                buffer_device_address,
                debug_utils,
            }),
        })
    }

    /// Returns the device that memory is allocated from.
    #[inline]
    pub fn device(&self) -> &ash::Device {
        &self.shared.device
    }
}

impl fmt::Debug for VulkanBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VulkanBackend")
            .field("device", &self.shared.device.handle())
            .field("queue", &self.shared.queue)
            .finish_non_exhaustive()
    }
}

impl MemoryBackend for VulkanBackend {
    fn allocate(
        &self,
        name: &str,
        create_info: &StoreCreateInfo,
    ) -> Result<Box<dyn RawMemory>, AllocationError> {
        if create_info.capacity == 0 {
            return Err(AllocationError::ZeroSized);
        }

        let memory = unsafe { VulkanMemory::new(&self.shared, name, create_info) }?;

        Ok(Box::new(memory))
    }
}

/// Returns the usage a store's buffer is created with. Growth copies stores, so transfer usage is
/// always added.
fn buffer_usage(usage: vk::BufferUsageFlags, buffer_device_address: bool) -> vk::BufferUsageFlags {
    let mut usage =
        usage | vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;

    if buffer_device_address
        && usage.intersects(
            vk::BufferUsageFlags::UNIFORM_BUFFER
                | vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::RESOURCE_DESCRIPTOR_BUFFER_EXT
                | vk::BufferUsageFlags::SAMPLER_DESCRIPTOR_BUFFER_EXT,
        )
    {
        usage |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    }

    usage
}

impl DeviceShared {
    unsafe fn set_debug_name<T: vk::Handle>(&self, handle: T, name: &CString) {
        if let Some(debug_utils) = &self.debug_utils {
            let name_info = vk::DebugUtilsObjectNameInfoEXT::default()
                .object_handle(handle)
                .object_name(name);

            if let Err(err) = unsafe { debug_utils.set_debug_utils_object_name(&name_info) } {
                tracing::warn!(?err, "failed to set a debug name");
            }
        }
    }

    /// Records commands with `record`, submits them and waits for them to complete.
    unsafe fn submit_and_wait(
        &self,
        record: impl FnOnce(vk::CommandBuffer),
    ) -> Result<(), vk::Result> {
        let command_pool = self.command_pool.lock();
        let device = &self.device;

        let command_buffer = unsafe {
            device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::default()
                    .command_pool(*command_pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1),
            )
        }?[0];

        let result = unsafe { self.record_and_submit(command_buffer, record) };

        unsafe { device.free_command_buffers(*command_pool, &[command_buffer]) };

        result
    }

    unsafe fn record_and_submit(
        &self,
        command_buffer: vk::CommandBuffer,
        record: impl FnOnce(vk::CommandBuffer),
    ) -> Result<(), vk::Result> {
        let device = &self.device;

        unsafe {
            device.begin_command_buffer(
                command_buffer,
                &vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )
        }?;
        record(command_buffer);
        unsafe { device.end_command_buffer(command_buffer) }?;

        let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) }?;
        let command_buffers = [command_buffer];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        let result = unsafe { device.queue_submit(self.queue, &[submit_info], fence) }
            .and_then(|()| unsafe { device.wait_for_fences(&[fence], true, u64::MAX) });
        unsafe { device.destroy_fence(fence, None) };

        result
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        unsafe {
            self.device
                .destroy_command_pool(*self.command_pool.get_mut(), None)
        };
    }
}

/// Picks the memory type for an access intent, ranking the types that satisfy the required
/// properties by how many of the preferred properties they have and how few of the unwanted ones.
fn find_memory_type_index(
    memory_types: &[vk::MemoryType],
    memory_type_bits: u32,
    intent: AccessIntent,
) -> Option<u32> {
    use vk::MemoryPropertyFlags as F;

    let (required_flags, preferred_flags, not_preferred_flags) = match intent {
        AccessIntent::HostOnly => (
            F::HOST_VISIBLE | F::HOST_COHERENT,
            F::HOST_CACHED,
            F::DEVICE_LOCAL,
        ),
        AccessIntent::DeviceOnly => (F::DEVICE_LOCAL, F::empty(), F::HOST_VISIBLE),
        AccessIntent::HostVisibleDevice => (
            F::HOST_VISIBLE | F::HOST_COHERENT,
            F::DEVICE_LOCAL,
            F::empty(),
        ),
    };

    memory_types
        .iter()
        .map(|memory_type| memory_type.property_flags)
        .enumerate()
        .filter(|&(index, flags)| {
            memory_type_bits & (1 << index) != 0 && flags.contains(required_flags)
        })
        .min_by_key(|&(_, flags)| {
            (preferred_flags & !flags).as_raw().count_ones()
                + (not_preferred_flags & flags).as_raw().count_ones()
        })
        .map(|(index, _)| index as u32)
}

struct VulkanMemory {
    shared: Arc<DeviceShared>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    capacity: DeviceSize,
    mapped: Option<NonNull<u8>>,
    device_address: Option<DeviceSize>,
}

// SAFETY: The mapped pointer is only dereferenced through `&self` for reads and `&mut self` for
// writes, so the borrow rules of the `VulkanMemory` extend to the mapping.
unsafe impl Send for VulkanMemory {}
unsafe impl Sync for VulkanMemory {}

impl VulkanMemory {
    unsafe fn new(
        shared: &Arc<DeviceShared>,
        name: &str,
        create_info: &StoreCreateInfo,
    ) -> Result<Self, AllocationError> {
        let device = &shared.device;
        let usage = buffer_usage(create_info.buffer_usage, shared.buffer_device_address);

        let buffer = unsafe {
            device.create_buffer(
                &vk::BufferCreateInfo::default()
                    .size(create_info.capacity)
                    .usage(usage)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE),
                None,
            )
        }?;

        // From here on the buffer (and then the memory) is destroyed again on failure.
        let mut memory = VulkanMemory {
            shared: shared.clone(),
            buffer,
            memory: vk::DeviceMemory::null(),
            capacity: create_info.capacity,
            mapped: None,
            device_address: None,
        };

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let intent = create_info.access_intent;
        let memory_type_index =
            find_memory_type_index(&shared.memory_types, requirements.memory_type_bits, intent)
                .ok_or(AllocationError::NoSuitableMemoryType)?;
        let property_flags = shared.memory_types[memory_type_index as usize].property_flags;

        if intent == AccessIntent::HostVisibleDevice
            && !property_flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
        {
            tracing::warn!(
                name,
                "no device-local host-visible memory type, falling back to host-visible memory"
            );
        }

        let needs_address = usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS);
        let mut flags_info =
            vk::MemoryAllocateFlagsInfo::default().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let mut allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        if needs_address {
            allocate_info = allocate_info.push_next(&mut flags_info);
        }

        memory.memory = unsafe { device.allocate_memory(&allocate_info, None) }?;
        unsafe { device.bind_buffer_memory(buffer, memory.memory, 0) }?;

        if intent.is_host_accessible() {
            let pointer = unsafe {
                device.map_memory(
                    memory.memory,
                    0,
                    vk::WHOLE_SIZE,
                    vk::MemoryMapFlags::empty(),
                )
            }?;
            memory.mapped = NonNull::new(pointer.cast());

            // Host-visible memory starts out zeroed, like host memory does.
            if let Some(mapped) = memory.mapped {
                unsafe { ptr::write_bytes(mapped.as_ptr(), 0, create_info.capacity as usize) };
            }
        }

        if needs_address {
            let address_info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
            let address = unsafe { device.get_buffer_device_address(&address_info) };
            memory.device_address = Some(address);
        }

        if shared.debug_utils.is_some() {
            if let Ok(name) = CString::new(name) {
                unsafe { shared.set_debug_name(buffer, &name) };
                unsafe { shared.set_debug_name(memory.memory, &name) };
            }
        }

        Ok(memory)
    }

    /// Copies between two buffers on the device. The ranges must not overlap if the buffers are the
    /// same.
    fn copy_on_device(
        &self,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    ) -> Result<(), AccessError> {
        unsafe {
            self.shared.submit_and_wait(|command_buffer| {
                self.shared
                    .device
                    .cmd_copy_buffer(command_buffer, src, dst, &[region]);
            })
        }
        .map_err(AccessError::Vulkan)
    }
}

impl fmt::Debug for VulkanMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VulkanMemory")
            .field("buffer", &self.buffer)
            .field("memory", &self.memory)
            .field("capacity", &self.capacity)
            .field("device_address", &self.device_address)
            .finish_non_exhaustive()
    }
}

impl RawMemory for VulkanMemory {
    #[inline]
    fn capacity(&self) -> DeviceSize {
        self.capacity
    }

    #[inline]
    fn is_host_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    #[inline]
    fn device_address(&self) -> Option<DeviceSize> {
        self.device_address
    }

    #[inline]
    fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    fn read(&self, offset: DeviceSize, dst: &mut [u8]) -> Result<(), AccessError> {
        let mapped = self.mapped.ok_or(AccessError::NotHostMapped)?;

        // SAFETY: The range was checked against the capacity by the caller, and the memory is
        // host-coherent.
        unsafe {
            ptr::copy_nonoverlapping(
                mapped.as_ptr().add(offset as usize),
                dst.as_mut_ptr(),
                dst.len(),
            )
        };

        Ok(())
    }

    fn write(&mut self, offset: DeviceSize, src: &[u8]) -> Result<(), AccessError> {
        let mapped = self.mapped.ok_or(AccessError::NotHostMapped)?;

        // SAFETY: Same as in `read`.
        unsafe {
            ptr::copy_nonoverlapping(
                src.as_ptr(),
                mapped.as_ptr().add(offset as usize),
                src.len(),
            )
        };

        Ok(())
    }

    fn copy_within(
        &mut self,
        dst_offset: DeviceSize,
        src_offset: DeviceSize,
        len: DeviceSize,
    ) -> Result<(), AccessError> {
        if let Some(mapped) = self.mapped {
            // SAFETY: Same as in `read`. `ptr::copy` allows the ranges to overlap.
            unsafe {
                ptr::copy(
                    mapped.as_ptr().add(src_offset as usize),
                    mapped.as_ptr().add(dst_offset as usize),
                    len as usize,
                )
            };

            return Ok(());
        }

        let overlaps = src_offset < dst_offset + len && dst_offset < src_offset + len;

        if !overlaps {
            return self.copy_on_device(
                self.buffer,
                self.buffer,
                vk::BufferCopy {
                    src_offset,
                    dst_offset,
                    size: len,
                },
            );
        }

        // Overlapping copies within one buffer aren't allowed, so bounce through a temporary.
        let temporary = unsafe {
            VulkanMemory::new(
                &self.shared,
                "copy_within",
                &StoreCreateInfo {
                    capacity: len,
                    access_intent: AccessIntent::DeviceOnly,
                    buffer_usage: vk::BufferUsageFlags::empty(),
                    _ne: crate::NE,
                },
            )
        }
        .map_err(|err| {
            AccessError::Vulkan(match err {
                AllocationError::OutOfHostMemory => vk::Result::ERROR_OUT_OF_HOST_MEMORY,
                AllocationError::Vulkan(result) => result,
                _ => vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            })
        })?;
        let device = &self.shared.device;

        unsafe {
            self.shared.submit_and_wait(|command_buffer| {
                device.cmd_copy_buffer(
                    command_buffer,
                    self.buffer,
                    temporary.buffer,
                    &[vk::BufferCopy {
                        src_offset,
                        dst_offset: 0,
                        size: len,
                    }],
                );
                device.cmd_pipeline_barrier(
                    command_buffer,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[vk::MemoryBarrier::default()
                        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                        .dst_access_mask(vk::AccessFlags::TRANSFER_READ)],
                    &[],
                    &[],
                );
                device.cmd_copy_buffer(
                    command_buffer,
                    temporary.buffer,
                    self.buffer,
                    &[vk::BufferCopy {
                        src_offset: 0,
                        dst_offset,
                        size: len,
                    }],
                );
            })
        }
        .map_err(AccessError::Vulkan)
    }

    fn copy_to(
        &self,
        dst: &mut dyn RawMemory,
        dst_offset: DeviceSize,
        src_offset: DeviceSize,
        len: DeviceSize,
    ) -> Result<(), AccessError> {
        if let Some(dst) = dst.as_any_mut().downcast_mut::<VulkanMemory>() {
            if let (Some(src_mapped), Some(dst_mapped)) = (self.mapped, dst.mapped) {
                // SAFETY: Same as in `read`. Distinct stores never share memory.
                unsafe {
                    ptr::copy_nonoverlapping(
                        src_mapped.as_ptr().add(src_offset as usize),
                        dst_mapped.as_ptr().add(dst_offset as usize),
                        len as usize,
                    )
                };

                return Ok(());
            }

            return self.copy_on_device(
                self.buffer,
                dst.buffer,
                vk::BufferCopy {
                    src_offset,
                    dst_offset,
                    size: len,
                },
            );
        }

        let mut staging = vec![0; len as usize];
        self.read(src_offset, &mut staging)?;

        dst.write(dst_offset, &staging)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Drop for VulkanMemory {
    fn drop(&mut self) {
        let device = &self.shared.device;

        unsafe {
            if self.mapped.is_some() {
                device.unmap_memory(self.memory);
            }

            device.destroy_buffer(self.buffer, None);

            if self.memory != vk::DeviceMemory::null() {
                device.free_memory(self.memory, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vk::MemoryPropertyFlags as F;

    fn memory_types(flags: &[vk::MemoryPropertyFlags]) -> Vec<vk::MemoryType> {
        flags
            .iter()
            .map(|&property_flags| vk::MemoryType {
                property_flags,
                heap_index: 0,
            })
            .collect()
    }

    #[test]
    fn discrete_gpu_memory_types() {
        let types = memory_types(&[
            F::DEVICE_LOCAL,
            F::HOST_VISIBLE | F::HOST_COHERENT,
            F::HOST_VISIBLE | F::HOST_COHERENT | F::HOST_CACHED,
            F::DEVICE_LOCAL | F::HOST_VISIBLE | F::HOST_COHERENT,
        ]);

        assert_eq!(
            find_memory_type_index(&types, !0, AccessIntent::DeviceOnly),
            Some(0),
        );
        assert_eq!(
            find_memory_type_index(&types, !0, AccessIntent::HostOnly),
            Some(2),
        );
        assert_eq!(
            find_memory_type_index(&types, !0, AccessIntent::HostVisibleDevice),
            Some(3),
        );
    }

    #[test]
    fn respects_memory_type_bits() {
        let types = memory_types(&[
            F::DEVICE_LOCAL,
            F::HOST_VISIBLE | F::HOST_COHERENT,
            F::DEVICE_LOCAL | F::HOST_VISIBLE | F::HOST_COHERENT,
        ]);

        // Without the device-local host-visible type, fall back to plain host-visible memory.
        assert_eq!(
            find_memory_type_index(&types, 0b011, AccessIntent::HostVisibleDevice),
            Some(1),
        );
        assert_eq!(
            find_memory_type_index(&types, 0b110, AccessIntent::DeviceOnly),
            Some(2),
        );
        assert_eq!(
            find_memory_type_index(&types, 0b001, AccessIntent::HostOnly),
            None,
        );
    }

    #[test]
    fn device_address_usage() {
        use vk::BufferUsageFlags as U;

        let storage = buffer_usage(U::STORAGE_BUFFER, true);
        assert!(storage.contains(U::SHADER_DEVICE_ADDRESS | U::TRANSFER_SRC | U::TRANSFER_DST));
        assert!(!buffer_usage(U::STORAGE_BUFFER, false).contains(U::SHADER_DEVICE_ADDRESS));
        assert!(!buffer_usage(U::VERTEX_BUFFER, true).contains(U::SHADER_DEVICE_ADDRESS));
        assert!(buffer_usage(U::RESOURCE_DESCRIPTOR_BUFFER_EXT, true)
            .contains(U::SHADER_DEVICE_ADDRESS));
    }
}
