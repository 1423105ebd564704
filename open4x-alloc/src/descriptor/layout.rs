use super::{DescriptorData, DescriptorDevice, DescriptorType, SetLayoutBinding};
use crate::{
    memory::{
        align_up,
        suballocator::{LinearAllocator, Suballocation, SuballocatorError},
        AccessError, RegistryError, StoreRegistry,
    },
    vk, DeviceSize,
};
use smallvec::SmallVec;
use std::{collections::BTreeMap, error::Error, fmt, sync::Arc};

/// The layout of every descriptor set of a pipeline inside a descriptor buffer.
///
/// A layout starts out *building*: bindings are added with [`add_binding`]. [`finalize`] then
/// creates the set layouts on the device, computes where every set and binding lives, and
/// allocates one packed region for all sets from the descriptor-buffer allocator. From then on the
/// layout is *finalized* and descriptors can be written, but no more bindings can be added.
///
/// [`add_binding`]: Self::add_binding
/// [`finalize`]: Self::finalize
#[derive(Debug)]
pub struct DescriptorLayout {
    device: Arc<dyn DescriptorDevice>,
    descriptor_buffer: Arc<LinearAllocator>,
    sets: BTreeMap<u32, SetLayout>,
    state: LayoutState,
}

#[derive(Debug)]
enum LayoutState {
    Building,
    Finalized {
        region: Suballocation,
        total_size: DeviceSize,
    },
}

/// The layout of one descriptor set.
#[derive(Debug)]
pub struct SetLayout {
    bindings: BTreeMap<u32, BindingInfo>,
    raw: vk::DescriptorSetLayout,
    offset: DeviceSize,
    aligned_size: DeviceSize,
}

impl SetLayout {
    fn new() -> Self {
        SetLayout {
            bindings: BTreeMap::new(),
            raw: vk::DescriptorSetLayout::null(),
            offset: 0,
            aligned_size: 0,
        }
    }

    /// Returns the bindings of the set, by binding number.
    #[inline]
    pub fn bindings(&self) -> &BTreeMap<u32, BindingInfo> {
        &self.bindings
    }

    /// Returns the set layout object, or a null handle before the layout is finalized.
    #[inline]
    pub fn raw(&self) -> vk::DescriptorSetLayout {
        self.raw
    }

    /// Returns the offset of the set within the packed region.
    #[inline]
    pub fn offset(&self) -> DeviceSize {
        self.offset
    }

    /// Returns the size of the set, rounded up to the descriptor-buffer offset alignment.
    #[inline]
    pub fn aligned_size(&self) -> DeviceSize {
        self.aligned_size
    }
}

/// One binding of a [`SetLayout`].
#[derive(Clone, Debug)]
pub struct BindingInfo {
    descriptor_type: DescriptorType,
    stages: vk::ShaderStageFlags,
    backing_name: String,
    offset: DeviceSize,
    descriptor_size: DeviceSize,
    generation: Option<u64>,
}

impl BindingInfo {
    #[inline]
    pub fn descriptor_type(&self) -> DescriptorType {
        self.descriptor_type
    }

    #[inline]
    pub fn stages(&self) -> vk::ShaderStageFlags {
        self.stages
    }

    /// Returns the name of the store the binding refers to.
    #[inline]
    pub fn backing_name(&self) -> &str {
        &self.backing_name
    }

    /// Returns the offset of the binding within its set.
    #[inline]
    pub fn offset(&self) -> DeviceSize {
        self.offset
    }

    #[inline]
    pub fn descriptor_size(&self) -> DeviceSize {
        self.descriptor_size
    }
}

impl DescriptorLayout {
    /// Creates a new, empty `DescriptorLayout` whose region is going to be allocated from
    /// `descriptor_buffer`.
    pub fn new(device: Arc<dyn DescriptorDevice>, descriptor_buffer: Arc<LinearAllocator>) -> Self {
        DescriptorLayout {
            device,
            descriptor_buffer,
            sets: BTreeMap::new(),
            state: LayoutState::Building,
        }
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn DescriptorDevice> {
        &self.device
    }

    #[inline]
    pub fn descriptor_buffer(&self) -> &Arc<LinearAllocator> {
        &self.descriptor_buffer
    }

    /// Returns whether [`finalize`] has been called successfully.
    ///
    /// [`finalize`]: Self::finalize
    #[inline]
    pub fn is_finalized(&self) -> bool {
        matches!(self.state, LayoutState::Finalized { .. })
    }

    /// Adds a binding holding one descriptor of `descriptor_type` to `set`. `backing_name` names
    /// the store the descriptor refers to.
    ///
    /// # Errors
    ///
    /// - Returns [`LayoutError::AlreadyFinalized`] if the layout has been finalized.
    /// - Returns [`LayoutError::DuplicateBinding`] if `set` already has a binding `binding`.
    pub fn add_binding(
        &mut self,
        set: u32,
        binding: u32,
        descriptor_type: DescriptorType,
        stages: vk::ShaderStageFlags,
        backing_name: impl Into<String>,
    ) -> Result<(), LayoutError> {
        if self.is_finalized() {
            return Err(LayoutError::AlreadyFinalized);
        }

        let bindings = &mut self.sets.entry(set).or_insert_with(SetLayout::new).bindings;

        if bindings.contains_key(&binding) {
            return Err(LayoutError::DuplicateBinding { set, binding });
        }

        bindings.insert(
            binding,
            BindingInfo {
                descriptor_type,
                stages,
                backing_name: backing_name.into(),
                offset: 0,
                descriptor_size: self.device.properties().descriptor_size(descriptor_type),
                generation: None,
            },
        );

        Ok(())
    }

    /// Computes the layout of every set and allocates the packed region. Returns the size of the
    /// region.
    ///
    /// Sets are laid out in ascending set order, each one starting at a multiple of the device's
    /// descriptor-buffer offset alignment. If anything fails, the layout stays building and no
    /// set layout objects are left behind.
    pub fn finalize(&mut self) -> Result<DeviceSize, LayoutError> {
        if self.is_finalized() {
            return Err(LayoutError::AlreadyFinalized);
        }

        let alignment = self.device.properties().offset_alignment.max(1);
        let mut total_size: DeviceSize = 0;
        let mut result = Ok(());

        for (&set, set_layout) in &mut self.sets {
            let bindings = set_layout
                .bindings
                .iter()
                .map(|(&binding, info)| SetLayoutBinding {
                    binding,
                    descriptor_type: info.descriptor_type,
                    stages: info.stages,
                })
                .collect::<SmallVec<[_; 8]>>();

            let raw = match self.device.create_set_layout(&bindings) {
                Ok(raw) => raw,
                Err(err) => {
                    result = Err(err);
                    break;
                }
            };
            let size = self.device.layout_size(raw);

            set_layout.raw = raw;
            set_layout.offset = total_size;
            set_layout.aligned_size = align_up(size, alignment);

            for (&binding, info) in &mut set_layout.bindings {
                info.offset = self.device.binding_offset(raw, binding);
            }

            tracing::trace!(set, size, offset = total_size, "laid out descriptor set");

            total_size += set_layout.aligned_size;
        }

        if let Err(err) = result {
            destroy_set_layouts(&*self.device, &mut self.sets);
            return Err(LayoutError::Vulkan(err));
        }

        let region = match self.descriptor_buffer.alloc_aligned(total_size, alignment) {
            Ok(region) => region,
            Err(err) => {
                destroy_set_layouts(&*self.device, &mut self.sets);
                return Err(LayoutError::Suballocator(err));
            }
        };

        tracing::debug!(
            set_count = self.sets.len(),
            total_size,
            offset = region.absolute_offset(),
            "finalized descriptor layout"
        );

        self.state = LayoutState::Finalized { region, total_size };

        Ok(total_size)
    }

    /// Returns the size of the packed region, or `None` before the layout is finalized.
    #[inline]
    pub fn total_size(&self) -> Option<DeviceSize> {
        match self.state {
            LayoutState::Building => None,
            LayoutState::Finalized { total_size, .. } => Some(total_size),
        }
    }

    /// Returns the packed region, or `None` before the layout is finalized.
    #[inline]
    pub fn region(&self) -> Option<&Suballocation> {
        match &self.state {
            LayoutState::Building => None,
            LayoutState::Finalized { region, .. } => Some(region),
        }
    }

    /// Returns the layout of `set`.
    #[inline]
    pub fn set_layout(&self, set: u32) -> Option<&SetLayout> {
        self.sets.get(&set)
    }

    /// Returns the layout of every set, in ascending set order.
    #[inline]
    pub fn set_layouts(&self) -> impl ExactSizeIterator<Item = (u32, &SetLayout)> {
        self.sets.iter().map(|(&set, set_layout)| (set, set_layout))
    }

    /// Returns the set layout objects, in ascending set order.
    pub fn raw_set_layouts(&self) -> SmallVec<[vk::DescriptorSetLayout; 4]> {
        self.sets.values().map(|set_layout| set_layout.raw).collect()
    }

    /// Returns the offset of `set` within the descriptor buffer, which is what has to be passed
    /// when binding the set.
    pub fn set_offset(&self, set: u32) -> Result<DeviceSize, LayoutError> {
        let region = self.finalized_region()?;
        let set_layout = self
            .sets
            .get(&set)
            .ok_or(LayoutError::UnknownSet { set })?;

        Ok(region.absolute_offset() + set_layout.offset)
    }

    /// Returns the offset of every set within the descriptor buffer, in ascending set order.
    pub fn set_offsets(&self) -> Result<SmallVec<[DeviceSize; 4]>, LayoutError> {
        let base = self.finalized_region()?.absolute_offset();

        Ok(self
            .sets
            .values()
            .map(|set_layout| base + set_layout.offset)
            .collect())
    }

    /// Returns the offset of the descriptor of `binding` in `set` within the descriptor buffer.
    pub fn absolute_offset(&self, set: u32, binding: u32) -> Result<DeviceSize, LayoutError> {
        let region = self.finalized_region()?;
        let (set_layout, info) = self.binding(set, binding)?;

        Ok(region.absolute_offset() + set_layout.offset + info.offset)
    }

    /// Writes already-encoded descriptor bytes to `binding` in `set`.
    ///
    /// # Errors
    ///
    /// - Returns [`LayoutError::NotFinalized`] if the layout hasn't been finalized.
    /// - Returns [`LayoutError::UnknownBinding`] if the binding was never added.
    /// - Returns [`LayoutError::DescriptorTooLarge`] if `bytes` is bigger than a descriptor of the
    ///   binding's type.
    pub fn write_binding(&self, set: u32, binding: u32, bytes: &[u8]) -> Result<(), LayoutError> {
        let region = self.finalized_region()?;
        let (set_layout, info) = self.binding(set, binding)?;
        let len = bytes.len() as DeviceSize;

        if len > info.descriptor_size {
            return Err(LayoutError::DescriptorTooLarge {
                set,
                binding,
                len,
                descriptor_size: info.descriptor_size,
            });
        }

        region.write_at(set_layout.offset + info.offset, bytes)?;

        Ok(())
    }

    /// Encodes a descriptor for `data` with the device and writes it to `binding` in `set`.
    pub fn write_descriptor(
        &self,
        set: u32,
        binding: u32,
        data: &DescriptorData,
    ) -> Result<(), LayoutError> {
        let (_, info) = self.binding(set, binding)?;
        let descriptor_type = info.descriptor_type;

        if !data.is_compatible_with(descriptor_type) {
            return Err(LayoutError::MismatchedDescriptorData {
                set,
                binding,
                descriptor_type,
            });
        }

        let mut bytes = SmallVec::<[u8; 64]>::from_elem(0, info.descriptor_size as usize);

        self.device.get_descriptor(descriptor_type, data, &mut bytes);

        self.write_binding(set, binding, &bytes)
    }

    /// Writes a buffer descriptor for the whole store that `binding` in `set` refers to.
    ///
    /// The store is looked up in `registry` by the binding's backing name. Its generation is
    /// recorded, so that [`stale_bindings`] can tell when the store has grown since.
    ///
    /// [`stale_bindings`]: Self::stale_bindings
    pub fn write_buffer_binding(
        &mut self,
        registry: &StoreRegistry,
        set: u32,
        binding: u32,
    ) -> Result<(), LayoutError> {
        let (_, info) = self.binding(set, binding)?;

        if !info.descriptor_type.is_buffer() {
            return Err(LayoutError::UnsupportedDescriptorType {
                set,
                binding,
                descriptor_type: info.descriptor_type,
            });
        }

        let store = registry.get_store(&info.backing_name)?;
        // Read the generation first, so that a concurrent growth shows up as stale.
        let generation = store.generation();
        let address = store
            .device_address()
            .ok_or_else(|| LayoutError::NoDeviceAddress(info.backing_name.clone()))?;
        let data = DescriptorData::Buffer {
            address,
            range: store.capacity(),
        };

        self.write_descriptor(set, binding, &data)?;

        if let Some(info) = self
            .sets
            .get_mut(&set)
            .and_then(|set_layout| set_layout.bindings.get_mut(&binding))
        {
            info.generation = Some(generation);
        }

        Ok(())
    }

    /// Returns the bindings written with [`write_buffer_binding`] whose store has grown or been
    /// deleted since, as `(set, binding)` pairs in ascending order.
    ///
    /// [`write_buffer_binding`]: Self::write_buffer_binding
    pub fn stale_bindings(&self, registry: &StoreRegistry) -> Vec<(u32, u32)> {
        self.sets
            .iter()
            .flat_map(|(&set, set_layout)| {
                set_layout
                    .bindings
                    .iter()
                    .map(move |(&binding, info)| (set, binding, info))
            })
            .filter(|(_, _, info)| {
                info.generation.is_some_and(|generation| {
                    registry
                        .get_store(&info.backing_name)
                        .map_or(true, |store| store.generation() != generation)
                })
            })
            .map(|(set, binding, _)| (set, binding))
            .collect()
    }

    fn finalized_region(&self) -> Result<&Suballocation, LayoutError> {
        self.region().ok_or(LayoutError::NotFinalized)
    }

    fn binding(&self, set: u32, binding: u32) -> Result<(&SetLayout, &BindingInfo), LayoutError> {
        self.sets
            .get(&set)
            .and_then(|set_layout| Some((set_layout, set_layout.bindings.get(&binding)?)))
            .ok_or(LayoutError::UnknownBinding { set, binding })
    }
}

impl Drop for DescriptorLayout {
    fn drop(&mut self) {
        destroy_set_layouts(&*self.device, &mut self.sets);
    }
}

fn destroy_set_layouts(device: &dyn DescriptorDevice, sets: &mut BTreeMap<u32, SetLayout>) {
    for set_layout in sets.values_mut() {
        if set_layout.raw != vk::DescriptorSetLayout::null() {
            device.destroy_set_layout(set_layout.raw);
            set_layout.raw = vk::DescriptorSetLayout::null();
        }
    }
}

/// Error that can be returned when using a [`DescriptorLayout`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LayoutError {
    /// The binding was already added to the set.
    DuplicateBinding { set: u32, binding: u32 },

    /// The binding was never added to the set.
    UnknownBinding { set: u32, binding: u32 },

    /// No binding was ever added to the set.
    UnknownSet { set: u32 },

    /// The layout must be finalized first.
    NotFinalized,

    /// The layout has already been finalized.
    AlreadyFinalized,

    /// The descriptor bytes don't fit in the binding.
    DescriptorTooLarge {
        set: u32,
        binding: u32,
        len: DeviceSize,
        descriptor_size: DeviceSize,
    },

    /// The operation requires a buffer descriptor.
    UnsupportedDescriptorType {
        set: u32,
        binding: u32,
        descriptor_type: DescriptorType,
    },

    /// The descriptor data can't be encoded as the binding's descriptor type.
    MismatchedDescriptorData {
        set: u32,
        binding: u32,
        descriptor_type: DescriptorType,
    },

    /// The named store has no device address.
    NoDeviceAddress(String),

    Registry(RegistryError),

    /// Allocating the packed region failed.
    Suballocator(SuballocatorError),

    /// Writing to the packed region failed.
    Access(AccessError),

    /// Creating a set layout failed.
    Vulkan(vk::Result),
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateBinding { set, binding } => {
                write!(f, "binding {binding} of set {set} was already added")
            }
            Self::UnknownBinding { set, binding } => {
                write!(f, "binding {binding} of set {set} doesn't exist")
            }
            Self::UnknownSet { set } => write!(f, "set {set} doesn't exist"),
            Self::NotFinalized => f.write_str("the descriptor layout hasn't been finalized"),
            Self::AlreadyFinalized => f.write_str("the descriptor layout was already finalized"),
            Self::DescriptorTooLarge {
                set,
                binding,
                len,
                descriptor_size,
            } => write!(
                f,
                "{len} bytes were written to binding {binding} of set {set}, but its descriptors \
                are only {descriptor_size} bytes",
            ),
            Self::UnsupportedDescriptorType {
                set,
                binding,
                descriptor_type,
            } => write!(
                f,
                "binding {binding} of set {set} holds {descriptor_type:?} descriptors, which don't \
                refer to a buffer",
            ),
            Self::MismatchedDescriptorData {
                set,
                binding,
                descriptor_type,
            } => write!(
                f,
                "the data written to binding {binding} of set {set} can't be encoded as a \
                {descriptor_type:?} descriptor",
            ),
            Self::NoDeviceAddress(name) => {
                write!(f, "the store `{name}` doesn't have a device address")
            }
            Self::Registry(_) => f.write_str("failed to look up the backing store"),
            Self::Suballocator(_) => f.write_str("failed to allocate the descriptor region"),
            Self::Access(_) => f.write_str("failed to write to the descriptor region"),
            Self::Vulkan(_) => f.write_str("a runtime error occurred"),
        }
    }
}

impl Error for LayoutError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Registry(err) => Some(err),
            Self::Suballocator(err) => Some(err),
            Self::Access(err) => Some(err),
            Self::Vulkan(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RegistryError> for LayoutError {
    fn from(err: RegistryError) -> Self {
        LayoutError::Registry(err)
    }
}

impl From<SuballocatorError> for LayoutError {
    fn from(err: SuballocatorError) -> Self {
        LayoutError::Suballocator(err)
    }
}

impl From<AccessError> for LayoutError {
    fn from(err: AccessError) -> Self {
        LayoutError::Access(err)
    }
}
