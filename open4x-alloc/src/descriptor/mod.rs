//! Layouts of packed descriptor buffers.
//!
//! With `VK_EXT_descriptor_buffer`, descriptors are plain bytes in a buffer rather than objects
//! allocated from a pool. A pipeline's descriptor sets are laid out back to back in one region of
//! a descriptor buffer: each set takes as many bytes as the device reports for its layout, rounded
//! up to the device's offset alignment, and each binding lives at a device-reported offset within
//! its set.
//!
//! A [`DescriptorLayout`] collects the bindings of a pipeline, computes that layout once when it is
//! [finalized], and then writes descriptors at the right place. The sizes and offsets come from a
//! [`DescriptorDevice`]: [`VulkanDescriptorDevice`] asks the driver, [`SoftwareDescriptorDevice`]
//! packs the bindings itself and is what headless tools and tests use.
//!
//! [finalized]: DescriptorLayout::finalize

pub use self::{
    device::{
        DescriptorBufferProperties, DescriptorDevice, SetLayoutBinding, SoftwareDescriptorDevice,
        VulkanDescriptorDevice,
    },
    layout::{BindingInfo, DescriptorLayout, LayoutError, SetLayout},
};
use crate::{vk, DeviceSize};

mod device;
mod layout;

/// The kind of resource a descriptor refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    UniformBuffer,
    StorageBuffer,
    Sampler,
    SampledImage,
    CombinedImageSampler,
    StorageImage,
}

impl DescriptorType {
    /// Returns whether descriptors of this type refer to a buffer.
    #[inline]
    pub const fn is_buffer(self) -> bool {
        matches!(self, Self::UniformBuffer | Self::StorageBuffer)
    }
}

impl From<DescriptorType> for vk::DescriptorType {
    #[inline]
    fn from(val: DescriptorType) -> Self {
        match val {
            DescriptorType::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            DescriptorType::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            DescriptorType::Sampler => vk::DescriptorType::SAMPLER,
            DescriptorType::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
            DescriptorType::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            DescriptorType::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        }
    }
}

/// The resource a descriptor is encoded from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorData {
    /// A range of a buffer, given by its device address.
    Buffer {
        address: DeviceSize,
        range: DeviceSize,
    },

    Sampler(vk::Sampler),

    /// An image view, with the sampler that is used for combined image samplers.
    Image {
        image_view: vk::ImageView,
        image_layout: vk::ImageLayout,
        sampler: vk::Sampler,
    },
}

impl DescriptorData {
    /// Returns whether a descriptor of `descriptor_type` can be encoded from `self`.
    #[inline]
    pub const fn is_compatible_with(&self, descriptor_type: DescriptorType) -> bool {
        match self {
            DescriptorData::Buffer { .. } => descriptor_type.is_buffer(),
            DescriptorData::Sampler(_) => matches!(descriptor_type, DescriptorType::Sampler),
            DescriptorData::Image { .. } => matches!(
                descriptor_type,
                DescriptorType::SampledImage
                    | DescriptorType::CombinedImageSampler
                    | DescriptorType::StorageImage,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_types() {
        assert!(DescriptorType::UniformBuffer.is_buffer());
        assert!(DescriptorType::StorageBuffer.is_buffer());
        assert!(!DescriptorType::CombinedImageSampler.is_buffer());
        assert_eq!(
            vk::DescriptorType::from(DescriptorType::StorageImage),
            vk::DescriptorType::STORAGE_IMAGE,
        );
    }

    #[test]
    fn data_compatibility() {
        let buffer = DescriptorData::Buffer {
            address: 256,
            range: 64,
        };
        let sampler = DescriptorData::Sampler(vk::Sampler::null());
        let image = DescriptorData::Image {
            image_view: vk::ImageView::null(),
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            sampler: vk::Sampler::null(),
        };

        assert!(buffer.is_compatible_with(DescriptorType::UniformBuffer));
        assert!(buffer.is_compatible_with(DescriptorType::StorageBuffer));
        assert!(!buffer.is_compatible_with(DescriptorType::StorageImage));
        assert!(sampler.is_compatible_with(DescriptorType::Sampler));
        assert!(!sampler.is_compatible_with(DescriptorType::UniformBuffer));
        assert!(image.is_compatible_with(DescriptorType::CombinedImageSampler));
        assert!(!image.is_compatible_with(DescriptorType::Sampler));
    }
}
