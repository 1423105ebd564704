//! Suballocators are used to divide a *region* into smaller *suballocations*.
//!
//! # Regions
//!
//! A region is a contiguous, growable portion of memory that a suballocator works with. It is
//! either a whole [`SharedStore`] or a [`SubRegion`] that was carved out of a [`LinearAllocator`].
//! Both are wrapped in a [`Parent`], which every suballocator is created with. A suballocator
//! assumes that it is the only user of its parent region, which means that the whole size of the
//! region is its capacity.
//!
//! # Growth
//!
//! When a suballocator runs out of space, it grows its parent region instead of failing. Growing a
//! store replaces its memory, growing a sub-region extends it in place if it is the last
//! allocation of its linear allocator, or moves it otherwise. Either way, the offsets of
//! suballocations relative to their region stay the same, but absolute offsets and device addresses
//! may change. [`Region::generation`] changes whenever that happens.
//!
//! # Available allocators
//!
//! - [`LinearAllocator`] hands out arbitrarily-sized suballocations by bumping a cursor. Individual
//!   suballocations can't be freed.
//! - [`FixedAllocator`] hands out blocks of one size and reuses the lowest free block first.
//! - [`ContiguousFixedAllocator`] hands out blocks of one size and keeps all live blocks densely
//!   packed at the start of the region, by moving the last block into the hole left by a free.
//! - [`StackAllocator`] hands out blocks of one size and reuses the most recently freed block
//!   first.

pub use self::{
    contiguous::{ContiguousFixedAllocator, ContiguousTable, SlotMove},
    fixed::FixedAllocator,
    linear::{GrowthPolicy, LinearAllocator, LinearAllocatorCreateInfo},
    stack::StackAllocator,
};
use super::{check_range, AccessError, AllocationError, SharedStore};
use crate::DeviceSize;
use bytemuck::Pod;
use parking_lot::RwLock;
use std::{
    error::Error,
    fmt,
    hash::{Hash, Hasher},
    num::NonZero,
    ops::Range,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

mod contiguous;
mod fixed;
mod linear;
mod stack;

/// A contiguous, growable portion of memory that can be suballocated.
pub trait Region: Send + Sync {
    /// Returns the current size of the region in bytes.
    fn size(&self) -> DeviceSize;

    /// Returns the offset of the start of the region within the backing store at the root of the
    /// hierarchy. This may change when the region or one of its ancestors grows.
    fn base_offset(&self) -> DeviceSize;

    /// Grows the region so that its size is at least `new_size`, and returns the resulting size.
    /// Does nothing if the region is already big enough. The contents are preserved.
    fn grow(&self, new_size: DeviceSize) -> Result<DeviceSize, AllocationError>;

    fn read(&self, offset: DeviceSize, dst: &mut [u8]) -> Result<(), AccessError>;

    fn write(&self, offset: DeviceSize, src: &[u8]) -> Result<(), AccessError>;

    fn copy_within(
        &self,
        dst_offset: DeviceSize,
        src_offset: DeviceSize,
        len: DeviceSize,
    ) -> Result<(), AccessError>;

    /// Returns a counter that changes whenever the region's memory is replaced or the region moves
    /// within its parent.
    fn generation(&self) -> u64;
}

impl Region for SharedStore {
    #[inline]
    fn size(&self) -> DeviceSize {
        self.capacity()
    }

    #[inline]
    fn base_offset(&self) -> DeviceSize {
        0
    }

    #[inline]
    fn grow(&self, new_size: DeviceSize) -> Result<DeviceSize, AllocationError> {
        SharedStore::grow(self, new_size)
    }

    #[inline]
    fn read(&self, offset: DeviceSize, dst: &mut [u8]) -> Result<(), AccessError> {
        SharedStore::read(self, offset, dst)
    }

    #[inline]
    fn write(&self, offset: DeviceSize, src: &[u8]) -> Result<(), AccessError> {
        SharedStore::write(self, offset, src)
    }

    #[inline]
    fn copy_within(
        &self,
        dst_offset: DeviceSize,
        src_offset: DeviceSize,
        len: DeviceSize,
    ) -> Result<(), AccessError> {
        SharedStore::copy_within(self, dst_offset, src_offset, len)
    }

    #[inline]
    fn generation(&self) -> u64 {
        SharedStore::generation(self)
    }
}

/// The region a suballocator divides.
#[derive(Clone, Debug)]
pub enum Parent {
    /// A whole backing store.
    Store(Arc<SharedStore>),

    /// A region carved out of a linear allocator.
    Allocator(Arc<SubRegion>),
}

impl Parent {
    /// Returns the backing store at the root of the hierarchy.
    pub fn root_store(&self) -> &Arc<SharedStore> {
        match self {
            Parent::Store(store) => store,
            Parent::Allocator(sub_region) => sub_region.allocator.parent().root_store(),
        }
    }

    /// Returns whether `self` and `other` refer to the same region.
    #[inline]
    pub fn ptr_eq(&self, other: &Parent) -> bool {
        self.as_ptr() == other.as_ptr()
    }

    fn as_ptr(&self) -> *const () {
        match self {
            Parent::Store(store) => Arc::as_ptr(store).cast(),
            Parent::Allocator(sub_region) => Arc::as_ptr(sub_region).cast(),
        }
    }
}

impl From<Arc<SharedStore>> for Parent {
    #[inline]
    fn from(store: Arc<SharedStore>) -> Self {
        Parent::Store(store)
    }
}

impl From<Arc<SubRegion>> for Parent {
    #[inline]
    fn from(sub_region: Arc<SubRegion>) -> Self {
        Parent::Allocator(sub_region)
    }
}

macro_rules! forward_to_parent {
    ($self:ident, $region:ident => $expr:expr) => {
        match $self {
            Parent::Store($region) => $expr,
            Parent::Allocator($region) => $expr,
        }
    };
}

impl Region for Parent {
    #[inline]
    fn size(&self) -> DeviceSize {
        forward_to_parent!(self, region => region.size())
    }

    #[inline]
    fn base_offset(&self) -> DeviceSize {
        forward_to_parent!(self, region => region.base_offset())
    }

    #[inline]
    fn grow(&self, new_size: DeviceSize) -> Result<DeviceSize, AllocationError> {
        forward_to_parent!(self, region => Region::grow(&**region, new_size))
    }

    #[inline]
    fn read(&self, offset: DeviceSize, dst: &mut [u8]) -> Result<(), AccessError> {
        forward_to_parent!(self, region => Region::read(&**region, offset, dst))
    }

    #[inline]
    fn write(&self, offset: DeviceSize, src: &[u8]) -> Result<(), AccessError> {
        forward_to_parent!(self, region => Region::write(&**region, offset, src))
    }

    #[inline]
    fn copy_within(
        &self,
        dst_offset: DeviceSize,
        src_offset: DeviceSize,
        len: DeviceSize,
    ) -> Result<(), AccessError> {
        forward_to_parent!(self, region => {
            Region::copy_within(&**region, dst_offset, src_offset, len)
        })
    }

    #[inline]
    fn generation(&self) -> u64 {
        forward_to_parent!(self, region => Region::generation(&**region))
    }
}

/// A growable region carved out of a [`LinearAllocator`] with [`LinearAllocator::carve`].
///
/// Growing a sub-region reallocates it within its linear allocator: it is extended in place if it
/// is the most recent allocation, and moved to the end otherwise.
#[derive(Debug)]
pub struct SubRegion {
    allocator: Arc<LinearAllocator>,
    allocation: RwLock<Suballocation>,
    moves: AtomicU64,
}

impl SubRegion {
    pub(super) fn new(allocator: Arc<LinearAllocator>, allocation: Suballocation) -> Self {
        SubRegion {
            allocator,
            allocation: RwLock::new(allocation),
            moves: AtomicU64::new(0),
        }
    }

    /// Returns the linear allocator the region was carved out of.
    #[inline]
    pub fn allocator(&self) -> &Arc<LinearAllocator> {
        &self.allocator
    }

    /// Returns the offset of the region within the region of its linear allocator.
    #[inline]
    pub fn offset(&self) -> DeviceSize {
        self.allocation.read().offset()
    }
}

impl Region for SubRegion {
    #[inline]
    fn size(&self) -> DeviceSize {
        self.allocation.read().size()
    }

    #[inline]
    fn base_offset(&self) -> DeviceSize {
        self.allocation.read().absolute_offset()
    }

    fn grow(&self, new_size: DeviceSize) -> Result<DeviceSize, AllocationError> {
        let mut allocation = self.allocation.write();

        if new_size <= allocation.size() {
            return Ok(allocation.size());
        }

        let old_offset = allocation.offset();

        self.allocator.resize(&mut allocation, new_size)?;

        if allocation.offset() != old_offset {
            self.moves.fetch_add(1, Ordering::AcqRel);
        }

        Ok(allocation.size())
    }

    #[inline]
    fn read(&self, offset: DeviceSize, dst: &mut [u8]) -> Result<(), AccessError> {
        self.allocation.read().read_at(offset, dst)
    }

    #[inline]
    fn write(&self, offset: DeviceSize, src: &[u8]) -> Result<(), AccessError> {
        self.allocation.read().write_at(offset, src)
    }

    #[inline]
    fn copy_within(
        &self,
        dst_offset: DeviceSize,
        src_offset: DeviceSize,
        len: DeviceSize,
    ) -> Result<(), AccessError> {
        self.allocation
            .read()
            .copy_within(dst_offset, src_offset, len)
    }

    #[inline]
    fn generation(&self) -> u64 {
        // Both counters only ever increase, so the sum changes whenever either does.
        self.moves.load(Ordering::Acquire) + self.allocator.parent().generation()
    }
}

/// A region handed out by one of the suballocators.
///
/// A suballocation doesn't own its memory: it stays readable and writable for as long as the
/// parent region lives, and it's up to the caller to stop using it once it has been freed. Every
/// access is checked against the size of the suballocation.
///
/// Two suballocations are equal if they have the same offset and size within the same parent.
#[derive(Clone, Debug)]
pub struct Suballocation {
    offset: DeviceSize,
    size: DeviceSize,
    parent: Parent,
    allocator_id: NonZero<u64>,
}

impl Suballocation {
    pub(super) fn new(
        offset: DeviceSize,
        size: DeviceSize,
        parent: Parent,
        allocator_id: NonZero<u64>,
    ) -> Self {
        Suballocation {
            offset,
            size,
            parent,
            allocator_id,
        }
    }

    /// Returns the offset of the suballocation within its parent region.
    #[inline]
    pub fn offset(&self) -> DeviceSize {
        self.offset
    }

    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn parent(&self) -> &Parent {
        &self.parent
    }

    /// Returns the offset of the suballocation within the backing store at the root of the
    /// hierarchy.
    #[inline]
    pub fn absolute_offset(&self) -> DeviceSize {
        self.parent.base_offset() + self.offset
    }

    /// Returns the device address of the start of the suballocation, if the root store has one.
    #[inline]
    pub fn device_address(&self) -> Option<DeviceSize> {
        self.parent
            .root_store()
            .device_address()
            .map(|address| address + self.absolute_offset())
    }

    /// Reads `dst.len()` bytes from the start of the suballocation.
    #[inline]
    pub fn read(&self, dst: &mut [u8]) -> Result<(), AccessError> {
        self.read_at(0, dst)
    }

    /// Reads `dst.len()` bytes starting at `offset` within the suballocation.
    pub fn read_at(&self, offset: DeviceSize, dst: &mut [u8]) -> Result<(), AccessError> {
        check_range(offset, dst.len() as DeviceSize, self.size)?;

        self.parent.read(self.offset + offset, dst)
    }

    /// Writes `src` to the start of the suballocation.
    #[inline]
    pub fn write(&self, src: &[u8]) -> Result<(), AccessError> {
        self.write_at(0, src)
    }

    /// Writes `src` starting at `offset` within the suballocation.
    pub fn write_at(&self, offset: DeviceSize, src: &[u8]) -> Result<(), AccessError> {
        check_range(offset, src.len() as DeviceSize, self.size)?;

        self.parent.write(self.offset + offset, src)
    }

    /// Writes the bytes of `value` starting at `offset`.
    #[inline]
    pub fn write_pod<T: Pod>(&self, offset: DeviceSize, value: &T) -> Result<(), AccessError> {
        self.write_at(offset, bytemuck::bytes_of(value))
    }

    /// Writes the bytes of every element of `values`, tightly packed, starting at `offset`.
    #[inline]
    pub fn write_slice<T: Pod>(&self, offset: DeviceSize, values: &[T]) -> Result<(), AccessError> {
        self.write_at(offset, bytemuck::cast_slice(values))
    }

    /// Reads a `T` starting at `offset`.
    pub fn read_pod<T: Pod>(&self, offset: DeviceSize) -> Result<T, AccessError> {
        let mut value = T::zeroed();
        self.read_at(offset, bytemuck::bytes_of_mut(&mut value))?;

        Ok(value)
    }

    /// Copies the contents of `self` into `other`. As many bytes are copied as fit in the smaller
    /// of the two.
    #[inline]
    pub fn copy_to(&self, other: &Suballocation) -> Result<(), AccessError> {
        self.copy_range_to(other, 0, 0, self.size.min(other.size))
    }

    /// Copies `len` bytes from `self` at `src_offset` into `other` at `dst_offset`.
    ///
    /// Copies between suballocations of different parents go through the root stores, using the
    /// absolute offsets at the time of the call. They must not race with growth of either parent.
    pub fn copy_range_to(
        &self,
        other: &Suballocation,
        dst_offset: DeviceSize,
        src_offset: DeviceSize,
        len: DeviceSize,
    ) -> Result<(), AccessError> {
        check_range(src_offset, len, self.size)?;
        check_range(dst_offset, len, other.size)?;

        if self.parent.ptr_eq(&other.parent) {
            return self
                .parent
                .copy_within(other.offset + dst_offset, self.offset + src_offset, len);
        }

        self.parent.root_store().copy_to(
            other.parent.root_store(),
            other.absolute_offset() + dst_offset,
            self.absolute_offset() + src_offset,
            len,
        )
    }

    fn copy_within(
        &self,
        dst_offset: DeviceSize,
        src_offset: DeviceSize,
        len: DeviceSize,
    ) -> Result<(), AccessError> {
        check_range(src_offset, len, self.size)?;
        check_range(dst_offset, len, self.size)?;

        self.parent
            .copy_within(self.offset + dst_offset, self.offset + src_offset, len)
    }

    #[inline]
    pub(super) fn allocator_id(&self) -> NonZero<u64> {
        self.allocator_id
    }
}

impl PartialEq for Suballocation {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset && self.size == other.size && self.parent.ptr_eq(&other.parent)
    }
}

impl Eq for Suballocation {}

impl Hash for Suballocation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.offset.hash(state);
        self.size.hash(state);
        self.parent.as_ptr().hash(state);
    }
}

/// Error that can be returned when using a suballocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuballocatorError {
    /// Growing the parent region failed.
    Allocation(AllocationError),

    /// Moving or copying bytes within the parent region failed.
    Access(AccessError),

    /// The suballocation was already freed.
    DoubleFree { offset: DeviceSize },

    /// The suballocation was not handed out by this allocator.
    ForeignAllocation,
}

impl From<AllocationError> for SuballocatorError {
    fn from(err: AllocationError) -> Self {
        SuballocatorError::Allocation(err)
    }
}

impl From<AccessError> for SuballocatorError {
    fn from(err: AccessError) -> Self {
        SuballocatorError::Access(err)
    }
}

impl Error for SuballocatorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Allocation(err) => Some(err),
            Self::Access(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for SuballocatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allocation(_) => f.write_str("failed to grow the parent region"),
            Self::Access(_) => f.write_str("failed to move bytes within the parent region"),
            Self::DoubleFree { offset } => {
                write!(f, "the suballocation at offset {offset} was already freed")
            }
            Self::ForeignAllocation => {
                f.write_str("the suballocation was not allocated by this allocator")
            }
        }
    }
}

fn next_allocator_id() -> NonZero<u64> {
    static COUNTER: AtomicU64 = AtomicU64::new(1);

    NonZero::new(COUNTER.fetch_add(1, Ordering::Relaxed)).unwrap_or_else(|| {
        eprintln!("an ID counter has overflown ...somehow");
        std::process::abort();
    })
}

/// Bookkeeping of the allocators that hand out blocks of a single size.
#[derive(Debug)]
struct Blocks {
    block_size: DeviceSize,
    live: Vec<bool>,
}

impl Blocks {
    /// Covers as many whole blocks as fit in `capacity`, all of them free.
    fn new(block_size: DeviceSize, capacity: DeviceSize) -> Self {
        assert_ne!(block_size, 0, "the block size must be non-zero");

        Blocks {
            block_size,
            live: vec![false; (capacity / block_size) as usize],
        }
    }

    #[inline]
    fn count(&self) -> DeviceSize {
        self.live.len() as DeviceSize
    }

    /// Grows `parent` so that it holds at least `count` blocks, and returns the indices of the
    /// blocks that were added.
    fn grow_to(
        &mut self,
        parent: &Parent,
        count: DeviceSize,
    ) -> Result<Range<DeviceSize>, AllocationError> {
        let old_count = self.count();

        if count <= old_count {
            return Ok(old_count..old_count);
        }

        let required = count
            .checked_mul(self.block_size)
            .ok_or(AllocationError::CapacityOverflow)?;
        let new_count = parent.grow(required)? / self.block_size;
        self.live.resize(new_count as usize, false);

        Ok(old_count..new_count)
    }

    /// Returns the index of the block that `allocation` refers to, if it's a block of this
    /// allocator.
    fn index_of(
        &self,
        allocator_id: NonZero<u64>,
        allocation: &Suballocation,
    ) -> Result<DeviceSize, SuballocatorError> {
        if allocation.allocator_id() != allocator_id
            || allocation.size() != self.block_size
            || allocation.offset() % self.block_size != 0
        {
            return Err(SuballocatorError::ForeignAllocation);
        }

        let index = allocation.offset() / self.block_size;

        if index >= self.count() {
            return Err(SuballocatorError::ForeignAllocation);
        }

        Ok(index)
    }

    #[inline]
    fn is_live(&self, index: DeviceSize) -> bool {
        self.live[index as usize]
    }

    #[inline]
    fn set_live(&mut self, index: DeviceSize, live: bool) {
        self.live[index as usize] = live;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{HostBackend, StoreCreateInfo};
    use bytemuck::{Pod, Zeroable};
    use std::collections::HashSet;

    pub(super) fn store(capacity: DeviceSize) -> Arc<SharedStore> {
        SharedStore::new(
            Arc::new(HostBackend::default()),
            "test",
            &StoreCreateInfo {
                capacity,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[repr(C)]
    #[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
    struct Light {
        position: [f32; 3],
        radius: f32,
    }

    #[test]
    fn read_after_write() {
        let allocator = LinearAllocator::new(store(64).into(), Default::default());
        let a = allocator.alloc(16).unwrap();
        let b = allocator.alloc(16).unwrap();

        a.write(&[1; 16]).unwrap();
        b.write_at(8, &[2; 8]).unwrap();

        let mut bytes = [0; 16];
        a.read(&mut bytes).unwrap();
        assert_eq!(bytes, [1; 16]);
        b.read(&mut bytes).unwrap();
        assert_eq!(bytes[..8], [0; 8]);
        assert_eq!(bytes[8..], [2; 8]);
    }

    #[test]
    fn accesses_are_bounded_by_the_suballocation() {
        let allocator = LinearAllocator::new(store(64).into(), Default::default());
        let a = allocator.alloc(8).unwrap();

        assert_eq!(
            a.write_at(4, &[0; 8]),
            Err(AccessError::CapacityExceeded {
                offset: 4,
                len: 8,
                capacity: 8,
            }),
        );
        assert!(a.read(&mut [0; 9]).is_err());
    }

    #[test]
    fn pod_values() {
        let allocator = LinearAllocator::new(store(64).into(), Default::default());
        let lights = allocator.alloc(32).unwrap();
        let light = Light {
            position: [1.0, 2.0, 3.0],
            radius: 4.0,
        };

        lights.write_slice(0, &[Light::zeroed(), light]).unwrap();
        assert_eq!(lights.read_pod::<Light>(16).unwrap(), light);
        assert_eq!(lights.read_pod::<Light>(0).unwrap(), Light::zeroed());
        assert!(lights.write_pod(20, &light).is_err());
    }

    #[test]
    fn copy_to_uses_the_smaller_size() {
        let a_store = store(64);
        let b_store = store(64);
        let a = LinearAllocator::new(a_store.into(), Default::default());
        let b = LinearAllocator::new(b_store.into(), Default::default());

        let src = a.alloc(8).unwrap();
        let same_parent = a.alloc(4).unwrap();
        let other_parent = b.alloc(16).unwrap();
        src.write(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        src.copy_to(&same_parent).unwrap();
        src.copy_to(&other_parent).unwrap();

        let mut bytes = [0; 4];
        same_parent.read(&mut bytes).unwrap();
        assert_eq!(bytes, [1, 2, 3, 4]);

        let mut bytes = [0; 16];
        other_parent.read(&mut bytes).unwrap();
        assert_eq!(bytes, [1, 2, 3, 4, 5, 6, 7, 8, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn equality_is_structural() {
        let store = store(64);
        let a = LinearAllocator::new(store.clone().into(), Default::default());
        let b = LinearAllocator::new(store.into(), Default::default());
        let c = LinearAllocator::new(self::store(64).into(), Default::default());

        let from_a = a.alloc(16).unwrap();
        let from_b = b.alloc(16).unwrap();
        let from_c = c.alloc(16).unwrap();

        assert_eq!(from_a, from_b);
        assert_ne!(from_a, from_c);
        assert_ne!(from_a, a.alloc(16).unwrap());

        let set: HashSet<_> = [from_a.clone(), from_b, from_c].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&from_a));
    }

    #[test]
    fn nested_hierarchy() {
        let store = store(64);
        let global = Arc::new(LinearAllocator::new(store.clone().into(), Default::default()));
        let _header = global.alloc(16).unwrap();
        let per_object = StackAllocator::new(global.carve(32).unwrap(), 16);

        let a = per_object.alloc().unwrap();
        let b = per_object.alloc().unwrap();
        a.write(&[1; 16]).unwrap();
        b.write(&[2; 16]).unwrap();
        assert_eq!(a.absolute_offset(), 16);
        assert_eq!(b.absolute_offset(), 32);

        let mut bytes = [0; 16];
        store.read(32, &mut bytes).unwrap();
        assert_eq!(bytes, [2; 16]);

        // The sub-region is the tail of the global allocator, so it's extended in place.
        let generation = per_object.parent().generation();
        let c = per_object.alloc().unwrap();
        assert_eq!(c.absolute_offset(), 48);
        assert_eq!(per_object.parent().base_offset(), 16);
        assert_eq!(per_object.parent().generation(), generation);

        // Once something else is allocated behind it, growing moves it.
        let _tail = global.alloc(8).unwrap();
        let d = per_object.alloc().unwrap();
        assert_ne!(per_object.parent().generation(), generation);
        assert_eq!(per_object.parent().base_offset(), 72);
        assert_eq!(d.offset(), 48);

        // Offsets relative to the region survive the move, and so do the contents.
        a.read(&mut bytes).unwrap();
        assert_eq!(bytes, [1; 16]);
        b.read(&mut bytes).unwrap();
        assert_eq!(bytes, [2; 16]);
        assert_eq!(b.absolute_offset(), 72 + 16);
    }

    #[test]
    fn root_store_device_address() {
        let store = store(256);
        let base = store.device_address().unwrap();
        let allocator = Arc::new(LinearAllocator::new(store.into(), Default::default()));
        let _ = allocator.alloc(64).unwrap();
        let fixed = FixedAllocator::new(allocator.carve(64).unwrap(), 32);

        let _ = fixed.alloc().unwrap();
        let block = fixed.alloc().unwrap();
        assert_eq!(block.device_address(), Some(base + 64 + 32));
    }
}
