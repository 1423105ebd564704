use super::{DescriptorData, DescriptorType};
use crate::{memory::align_up, vk, DeviceSize, NonExhaustive};
use foldhash::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

/// The descriptor-buffer limits of a device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorBufferProperties {
    /// The alignment that the offset of every descriptor set within a descriptor buffer must
    /// have.
    ///
    /// The default value is `64`.
    pub offset_alignment: DeviceSize,

    /// The default value is `16`.
    pub uniform_buffer_descriptor_size: DeviceSize,

    /// The default value is `16`.
    pub storage_buffer_descriptor_size: DeviceSize,

    /// The default value is `16`.
    pub sampler_descriptor_size: DeviceSize,

    /// The default value is `32`.
    pub sampled_image_descriptor_size: DeviceSize,

    /// The default value is `48`.
    pub combined_image_sampler_descriptor_size: DeviceSize,

    /// The default value is `32`.
    pub storage_image_descriptor_size: DeviceSize,

    pub _ne: NonExhaustive,
}

impl Default for DescriptorBufferProperties {
    #[inline]
    fn default() -> Self {
        DescriptorBufferProperties {
            offset_alignment: 64,
            uniform_buffer_descriptor_size: 16,
            storage_buffer_descriptor_size: 16,
            sampler_descriptor_size: 16,
            sampled_image_descriptor_size: 32,
            combined_image_sampler_descriptor_size: 48,
            storage_image_descriptor_size: 32,
            _ne: crate::NE,
        }
    }
}

impl DescriptorBufferProperties {
    /// Returns the size in bytes of one descriptor of the given type.
    #[inline]
    pub fn descriptor_size(&self, descriptor_type: DescriptorType) -> DeviceSize {
        match descriptor_type {
            DescriptorType::UniformBuffer => self.uniform_buffer_descriptor_size,
            DescriptorType::StorageBuffer => self.storage_buffer_descriptor_size,
            DescriptorType::Sampler => self.sampler_descriptor_size,
            DescriptorType::SampledImage => self.sampled_image_descriptor_size,
            DescriptorType::CombinedImageSampler => self.combined_image_sampler_descriptor_size,
            DescriptorType::StorageImage => self.storage_image_descriptor_size,
        }
    }
}

impl From<&vk::PhysicalDeviceDescriptorBufferPropertiesEXT<'_>> for DescriptorBufferProperties {
    fn from(val: &vk::PhysicalDeviceDescriptorBufferPropertiesEXT<'_>) -> Self {
        DescriptorBufferProperties {
            offset_alignment: val.descriptor_buffer_offset_alignment,
            uniform_buffer_descriptor_size: val.uniform_buffer_descriptor_size as DeviceSize,
            storage_buffer_descriptor_size: val.storage_buffer_descriptor_size as DeviceSize,
            sampler_descriptor_size: val.sampler_descriptor_size as DeviceSize,
            sampled_image_descriptor_size: val.sampled_image_descriptor_size as DeviceSize,
            combined_image_sampler_descriptor_size: val.combined_image_sampler_descriptor_size
                as DeviceSize,
            storage_image_descriptor_size: val.storage_image_descriptor_size as DeviceSize,
            _ne: crate::NE,
        }
    }
}

/// One binding of a descriptor set layout. Every binding holds a single descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetLayoutBinding {
    pub binding: u32,
    pub descriptor_type: DescriptorType,
    pub stages: vk::ShaderStageFlags,
}

/// The device-side half of descriptor buffers: creates set layouts, reports where descriptors go
/// and encodes them.
pub trait DescriptorDevice: Send + Sync + fmt::Debug {
    fn properties(&self) -> &DescriptorBufferProperties;

    /// Creates a set layout usable with descriptor buffers.
    fn create_set_layout(
        &self,
        bindings: &[SetLayoutBinding],
    ) -> Result<vk::DescriptorSetLayout, vk::Result>;

    /// Destroys a set layout created with [`create_set_layout`].
    ///
    /// [`create_set_layout`]: Self::create_set_layout
    fn destroy_set_layout(&self, layout: vk::DescriptorSetLayout);

    /// Returns the number of bytes a set with the given layout takes in a descriptor buffer,
    /// before alignment.
    fn layout_size(&self, layout: vk::DescriptorSetLayout) -> DeviceSize;

    /// Returns the offset of `binding` within a set with the given layout.
    fn binding_offset(&self, layout: vk::DescriptorSetLayout, binding: u32) -> DeviceSize;

    /// Encodes a descriptor into `dst`, which must be exactly
    /// [`DescriptorBufferProperties::descriptor_size`] bytes long.
    ///
    /// If `data` is not [compatible] with `descriptor_type`, `dst` is zeroed instead.
    ///
    /// [compatible]: DescriptorData::is_compatible_with
    fn get_descriptor(
        &self,
        descriptor_type: DescriptorType,
        data: &DescriptorData,
        dst: &mut [u8],
    );
}

/// A [`DescriptorDevice`] that computes layouts on the host, without a Vulkan device.
///
/// Bindings are packed in ascending binding order, each one at the next offset that is a multiple
/// of its descriptor size rounded up to a power of two. Buffer descriptors are encoded as the
/// device address followed by the range, both little-endian `u64`s. Other descriptors are encoded
/// as the raw handles they refer to.
#[derive(Debug)]
pub struct SoftwareDescriptorDevice {
    properties: DescriptorBufferProperties,
    layouts: Mutex<HashMap<u64, SoftwareSetLayout>>,
    next_handle: AtomicU64,
}

#[derive(Debug)]
struct SoftwareSetLayout {
    size: DeviceSize,
    offsets: SmallVec<[(u32, DeviceSize); 8]>,
}

impl SoftwareDescriptorDevice {
    /// Creates a new `SoftwareDescriptorDevice` with the given limits.
    ///
    /// # Panics
    ///
    /// - Panics if `properties.offset_alignment` is not a power of two.
    pub fn new(properties: DescriptorBufferProperties) -> Self {
        assert!(properties.offset_alignment.is_power_of_two());

        SoftwareDescriptorDevice {
            properties,
            layouts: Mutex::new(HashMap::default()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Returns the number of set layouts that are currently alive.
    pub fn layout_count(&self) -> usize {
        self.layouts.lock().len()
    }
}

impl Default for SoftwareDescriptorDevice {
    #[inline]
    fn default() -> Self {
        SoftwareDescriptorDevice::new(DescriptorBufferProperties::default())
    }
}

impl DescriptorDevice for SoftwareDescriptorDevice {
    #[inline]
    fn properties(&self) -> &DescriptorBufferProperties {
        &self.properties
    }

    fn create_set_layout(
        &self,
        bindings: &[SetLayoutBinding],
    ) -> Result<vk::DescriptorSetLayout, vk::Result> {
        let mut bindings = SmallVec::<[_; 8]>::from(bindings);
        bindings.sort_unstable_by_key(|binding| binding.binding);

        let mut offsets = SmallVec::new();
        let mut size = 0;

        for binding in &bindings {
            let descriptor_size = self.properties.descriptor_size(binding.descriptor_type);
            let offset = align_up(size, descriptor_size.max(1).next_power_of_two());
            offsets.push((binding.binding, offset));
            size = offset + descriptor_size;
        }

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.layouts
            .lock()
            .insert(handle, SoftwareSetLayout { size, offsets });

        Ok(vk::Handle::from_raw(handle))
    }

    fn destroy_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.layouts.lock().remove(&vk::Handle::as_raw(layout));
    }

    fn layout_size(&self, layout: vk::DescriptorSetLayout) -> DeviceSize {
        self.layouts
            .lock()
            .get(&vk::Handle::as_raw(layout))
            .map_or(0, |layout| layout.size)
    }

    fn binding_offset(&self, layout: vk::DescriptorSetLayout, binding: u32) -> DeviceSize {
        self.layouts
            .lock()
            .get(&vk::Handle::as_raw(layout))
            .and_then(|layout| {
                layout
                    .offsets
                    .iter()
                    .find(|&&(b, _)| b == binding)
                    .map(|&(_, offset)| offset)
            })
            .unwrap_or(0)
    }

    fn get_descriptor(
        &self,
        descriptor_type: DescriptorType,
        data: &DescriptorData,
        dst: &mut [u8],
    ) {
        dst.fill(0);

        if !data.is_compatible_with(descriptor_type) {
            return;
        }

        let words: SmallVec<[u64; 3]> = match *data {
            DescriptorData::Buffer { address, range } => [address, range].into_iter().collect(),
            DescriptorData::Sampler(sampler) => [vk::Handle::as_raw(sampler)].into_iter().collect(),
            DescriptorData::Image {
                image_view,
                image_layout,
                sampler,
            } => [
                vk::Handle::as_raw(image_view),
                image_layout.as_raw() as u64,
                vk::Handle::as_raw(sampler),
            ]
            .into_iter()
            .collect(),
        };

        for (chunk, word) in dst.chunks_mut(8).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes()[..chunk.len()]);
        }
    }
}

/// A [`DescriptorDevice`] backed by `VK_EXT_descriptor_buffer`.
pub struct VulkanDescriptorDevice {
    device: ash::Device,
    descriptor_buffer: ash::ext::descriptor_buffer::Device,
    properties: DescriptorBufferProperties,
}

impl VulkanDescriptorDevice {
    /// Creates a new `VulkanDescriptorDevice`, querying the limits of `physical_device`.
    ///
    /// # Safety
    ///
    /// - `device` must have been created from `physical_device`, which must belong to `instance`.
    /// - `device` must have the `VK_EXT_descriptor_buffer` extension and the `descriptorBuffer`
    ///   feature enabled.
    /// - `device` must outlive the descriptor device.
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
    ) -> Self {
        let mut descriptor_buffer_properties =
            vk::PhysicalDeviceDescriptorBufferPropertiesEXT::default();

        {
            let mut properties2 = vk::PhysicalDeviceProperties2::default()
                .push_next(&mut descriptor_buffer_properties);
            unsafe { instance.get_physical_device_properties2(physical_device, &mut properties2) };
        }

        let properties = DescriptorBufferProperties::from(&descriptor_buffer_properties);
        let descriptor_buffer = ash::ext::descriptor_buffer::Device::new(instance, &device);

        VulkanDescriptorDevice {
            device,
            descriptor_buffer,
            properties,
        }
    }
}

impl fmt::Debug for VulkanDescriptorDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VulkanDescriptorDevice")
            .field("device", &self.device.handle())
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

impl DescriptorDevice for VulkanDescriptorDevice {
    #[inline]
    fn properties(&self) -> &DescriptorBufferProperties {
        &self.properties
    }

    fn create_set_layout(
        &self,
        bindings: &[SetLayoutBinding],
    ) -> Result<vk::DescriptorSetLayout, vk::Result> {
        let bindings_vk = bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding.binding)
                    .descriptor_type(binding.descriptor_type.into())
                    .descriptor_count(1)
                    .stage_flags(binding.stages)
            })
            .collect::<SmallVec<[_; 8]>>();
        let create_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::DESCRIPTOR_BUFFER_EXT)
            .bindings(&bindings_vk);

        unsafe { self.device.create_descriptor_set_layout(&create_info, None) }
    }

    fn destroy_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn layout_size(&self, layout: vk::DescriptorSetLayout) -> DeviceSize {
        unsafe { self.descriptor_buffer.get_descriptor_set_layout_size(layout) }
    }

    fn binding_offset(&self, layout: vk::DescriptorSetLayout, binding: u32) -> DeviceSize {
        unsafe {
            self.descriptor_buffer
                .get_descriptor_set_layout_binding_offset(layout, binding)
        }
    }

    fn get_descriptor(
        &self,
        descriptor_type: DescriptorType,
        data: &DescriptorData,
        dst: &mut [u8],
    ) {
        if !data.is_compatible_with(descriptor_type) {
            dst.fill(0);
            return;
        }

        let address_info;
        let sampler_handle;
        let image_info;

        let data_vk = match (descriptor_type, *data) {
            (DescriptorType::UniformBuffer, DescriptorData::Buffer { address, range }) => {
                address_info = vk::DescriptorAddressInfoEXT::default()
                    .address(address)
                    .range(range);
                vk::DescriptorDataEXT {
                    p_uniform_buffer: &address_info,
                }
            }
            (_, DescriptorData::Buffer { address, range }) => {
                address_info = vk::DescriptorAddressInfoEXT::default()
                    .address(address)
                    .range(range);
                vk::DescriptorDataEXT {
                    p_storage_buffer: &address_info,
                }
            }
            (_, DescriptorData::Sampler(handle)) => {
                sampler_handle = handle;
                vk::DescriptorDataEXT {
                    p_sampler: &sampler_handle,
                }
            }
            (
                _,
                DescriptorData::Image {
                    image_view,
                    image_layout,
                    sampler,
                },
            ) => {
                image_info = vk::DescriptorImageInfo {
                    sampler,
                    image_view,
                    image_layout,
                };

                match descriptor_type {
                    DescriptorType::CombinedImageSampler => vk::DescriptorDataEXT {
                        p_combined_image_sampler: &image_info,
                    },
                    DescriptorType::StorageImage => vk::DescriptorDataEXT {
                        p_storage_image: &image_info,
                    },
                    _ => vk::DescriptorDataEXT {
                        p_sampled_image: &image_info,
                    },
                }
            }
        };
        let get_info = vk::DescriptorGetInfoEXT::default()
            .ty(descriptor_type.into())
            .data(data_vk);

        unsafe { self.descriptor_buffer.get_descriptor(&get_info, dst) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(binding: u32, descriptor_type: DescriptorType) -> SetLayoutBinding {
        SetLayoutBinding {
            binding,
            descriptor_type,
            stages: vk::ShaderStageFlags::ALL,
        }
    }

    #[test]
    fn software_packing() {
        let device = SoftwareDescriptorDevice::default();
        let layout = device
            .create_set_layout(&[
                binding(3, DescriptorType::CombinedImageSampler),
                binding(0, DescriptorType::UniformBuffer),
                binding(1, DescriptorType::StorageBuffer),
            ])
            .unwrap();

        assert_eq!(device.binding_offset(layout, 0), 0);
        assert_eq!(device.binding_offset(layout, 1), 16);
        // 48-byte descriptors are aligned to 64.
        assert_eq!(device.binding_offset(layout, 3), 64);
        assert_eq!(device.layout_size(layout), 112);

        device.destroy_set_layout(layout);
        assert_eq!(device.layout_count(), 0);
    }

    #[test]
    fn software_buffer_descriptors() {
        let device = SoftwareDescriptorDevice::default();
        let mut descriptor = [0xff; 16];

        device.get_descriptor(
            DescriptorType::StorageBuffer,
            &DescriptorData::Buffer {
                address: 0x1234,
                range: 256,
            },
            &mut descriptor,
        );

        assert_eq!(descriptor[..8], 0x1234u64.to_le_bytes());
        assert_eq!(descriptor[8..], 256u64.to_le_bytes());

        // Mismatched data encodes nothing.
        device.get_descriptor(
            DescriptorType::UniformBuffer,
            &DescriptorData::Sampler(vk::Handle::from_raw(7)),
            &mut descriptor,
        );
        assert_eq!(descriptor, [0; 16]);
    }

    #[test]
    fn properties_from_the_device() {
        let raw = vk::PhysicalDeviceDescriptorBufferPropertiesEXT {
            descriptor_buffer_offset_alignment: 256,
            uniform_buffer_descriptor_size: 24,
            storage_buffer_descriptor_size: 32,
            ..Default::default()
        };
        let properties = DescriptorBufferProperties::from(&raw);

        assert_eq!(properties.offset_alignment, 256);
        assert_eq!(
            properties.descriptor_size(DescriptorType::UniformBuffer),
            24,
        );
        assert_eq!(
            properties.descriptor_size(DescriptorType::StorageBuffer),
            32,
        );
    }
}
