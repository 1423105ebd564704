//! Memory allocation core of the Open4X renderer.
//!
//! Everything the renderer puts on the GPU lives in a handful of large *backing stores*. This
//! crate owns those stores, carves them up into *suballocations* and lays out the packed
//! descriptor buffers that reference them.
//!
//! # Overview
//!
//! - A [`MemoryBackend`] provides raw memory. [`HostBackend`] keeps everything in host memory and
//!   is what the tests and headless tools use, [`VulkanBackend`] creates real buffers and device
//!   memory through [`ash`].
//!
//! - A [`StoreRegistry`] creates [`SharedStore`]s under unique names. A store can be grown, which
//!   replaces its memory with a bigger block and copies the existing contents forward.
//!
//! - [Suballocators] carve regions out of a store, or out of a region carved by another
//!   suballocator, and hand out [`Suballocation`] handles that can be read from and written to.
//!
//! - A [`DescriptorLayout`] computes where every descriptor of a pipeline lives inside a
//!   descriptor buffer and writes the descriptor bytes there.
//!
//! Nothing in this crate reaches for process-wide state: the backend, the registry and the
//! descriptor device are always passed in explicitly.
//!
//! [`MemoryBackend`]: memory::MemoryBackend
//! [`HostBackend`]: memory::HostBackend
//! [`VulkanBackend`]: memory::vulkan::VulkanBackend
//! [`StoreRegistry`]: memory::StoreRegistry
//! [`SharedStore`]: memory::SharedStore
//! [Suballocators]: memory::suballocator
//! [`Suballocation`]: memory::suballocator::Suballocation
//! [`DescriptorLayout`]: descriptor::DescriptorLayout

pub use ash::vk;

pub mod descriptor;
pub mod memory;

/// Represents memory size and offset values on a Vulkan device.
/// Analogous to the Rust `usize` type on the host.
pub use ash::vk::DeviceSize;

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside this crate. Structures with a field of this type can
/// only be constructed by calling a constructor function or `Default::default()`. The effect is
/// similar to the standard Rust `#[non_exhaustive]` attribute, except that it does not prevent
/// update syntax from being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NonExhaustive(pub(crate) ());

pub(crate) const NE: NonExhaustive = NonExhaustive(());
