use super::{next_allocator_id, Parent, Region, SubRegion, Suballocation, SuballocatorError};
use crate::{
    memory::{align_up, is_aligned, AllocationError},
    DeviceSize, NonExhaustive,
};
use parking_lot::Mutex;
use std::{num::NonZero, sync::Arc};

/// A [suballocator] that allocates by bumping a cursor, and can only free all allocations at once.
///
/// Every allocation receives the current cursor as its offset, after which the cursor is bumped
/// past it. Allocation is *O*(1). There is no individual free: the space is only reclaimed by
/// [`reset`], or by dropping the allocator together with its region.
///
/// When the region is exhausted, it is grown according to the [`GrowthPolicy`].
///
/// Linear allocators are also what [`SubRegion`]s are carved from, see [`carve`].
///
/// [suballocator]: super
/// [`reset`]: Self::reset
/// [`carve`]: Self::carve
#[derive(Debug)]
pub struct LinearAllocator {
    id: NonZero<u64>,
    parent: Parent,
    growth_policy: GrowthPolicy,
    cursor: Mutex<DeviceSize>,
}

impl LinearAllocator {
    /// Creates a new `LinearAllocator` for the given region. The whole region is considered free.
    pub fn new(parent: Parent, create_info: LinearAllocatorCreateInfo) -> Self {
        let LinearAllocatorCreateInfo {
            growth_policy,
            _ne: _,
        } = create_info;

        LinearAllocator {
            id: next_allocator_id(),
            parent,
            growth_policy,
            cursor: Mutex::new(0),
        }
    }

    #[inline]
    pub fn parent(&self) -> &Parent {
        &self.parent
    }

    #[inline]
    pub fn growth_policy(&self) -> GrowthPolicy {
        self.growth_policy
    }

    /// Returns the offset at which the next allocation will be placed, before alignment.
    #[inline]
    pub fn cursor(&self) -> DeviceSize {
        *self.cursor.lock()
    }

    /// Returns the current size of the region.
    #[inline]
    pub fn capacity(&self) -> DeviceSize {
        self.parent.size()
    }

    /// Allocates `size` bytes at the cursor.
    #[inline]
    pub fn alloc(&self, size: DeviceSize) -> Result<Suballocation, SuballocatorError> {
        self.alloc_aligned(size, 1)
    }

    /// Allocates `size` bytes such that the offset within the root store is a multiple of
    /// `alignment`.
    ///
    /// The alignment is only meaningful while the region doesn't move within its own parent.
    ///
    /// # Panics
    ///
    /// - Panics if `alignment` is not a power of two.
    pub fn alloc_aligned(
        &self,
        size: DeviceSize,
        alignment: DeviceSize,
    ) -> Result<Suballocation, SuballocatorError> {
        assert!(alignment.is_power_of_two());

        let mut cursor = self.cursor.lock();

        // Growing may move a sub-region, and with it the base offset the alignment is relative to.
        loop {
            let base_offset = self.parent.base_offset();
            // This can't overflow because offsets are bounded by the capacity of the root store,
            // which itself fits in the address space.
            let offset = align_up(base_offset + *cursor, alignment) - base_offset;
            let end = offset
                .checked_add(size)
                .ok_or(AllocationError::CapacityOverflow)?;

            if end <= self.parent.size() {
                debug_assert!(is_aligned(base_offset + offset, alignment));
                *cursor = end;

                return Ok(Suballocation::new(offset, size, self.parent.clone(), self.id));
            }

            self.ensure_capacity(*cursor, end)?;
        }
    }

    /// Returns an empty suballocation at the cursor, without touching the region.
    #[inline]
    pub fn alloc_empty(&self) -> Suballocation {
        let cursor = *self.cursor.lock();

        Suballocation::new(cursor, 0, self.parent.clone(), self.id)
    }

    /// Grows `allocation` to `new_size` bytes, keeping its contents. Does nothing if the
    /// allocation is already at least that big.
    ///
    /// If `allocation` is the most recent allocation it is extended in place. Otherwise a new
    /// block is allocated at the cursor, the contents are copied over and `allocation` is updated
    /// to refer to the new block. The old block is not reclaimed until the allocator is reset.
    ///
    /// # Errors
    ///
    /// - Returns [`SuballocatorError::ForeignAllocation`] if `allocation` wasn't allocated by
    ///   `self`.
    pub fn realloc(
        &self,
        allocation: &mut Suballocation,
        new_size: DeviceSize,
    ) -> Result<(), SuballocatorError> {
        if allocation.allocator_id() != self.id {
            return Err(SuballocatorError::ForeignAllocation);
        }

        self.resize(allocation, new_size)?;

        Ok(())
    }

    pub(super) fn resize(
        &self,
        allocation: &mut Suballocation,
        new_size: DeviceSize,
    ) -> Result<(), AllocationError> {
        let old_size = allocation.size();

        if new_size <= old_size {
            return Ok(());
        }

        let mut cursor = self.cursor.lock();
        let old_offset = allocation.offset;
        let is_tail = old_offset + old_size == *cursor;
        let new_offset = if is_tail { old_offset } else { *cursor };
        let end = new_offset
            .checked_add(new_size)
            .ok_or(AllocationError::CapacityOverflow)?;

        self.ensure_capacity(*cursor, end)?;

        if !is_tail {
            self.parent
                .copy_within(new_offset, old_offset, old_size)
                .map_err(AllocationError::TransferFailed)?;

            tracing::trace!(old_offset, new_offset, new_size, "moved linear allocation");
        }

        *cursor = end;
        allocation.offset = new_offset;
        allocation.size = new_size;

        Ok(())
    }

    /// Grows the region, if needed, so that at least `size` bytes can be allocated without any
    /// further growth.
    pub fn preallocate(&self, size: DeviceSize) -> Result<(), SuballocatorError> {
        let cursor = self.cursor.lock();
        let required = cursor
            .checked_add(size)
            .ok_or(AllocationError::CapacityOverflow)?;
        self.parent.grow(required)?;

        Ok(())
    }

    /// Moves the cursor back to the start of the region, freeing every allocation at once.
    ///
    /// Existing suballocations stay readable and writable, but alias whatever is allocated next.
    /// The region keeps its size.
    #[inline]
    pub fn reset(&mut self) {
        *self.cursor.get_mut() = 0;
    }

    /// Allocates `size` bytes and wraps them in a [`SubRegion`] that can be used as the parent of
    /// another suballocator.
    pub fn carve(self: &Arc<Self>, size: DeviceSize) -> Result<Parent, SuballocatorError> {
        let allocation = self.alloc(size)?;

        Ok(Parent::Allocator(Arc::new(SubRegion::new(
            self.clone(),
            allocation,
        ))))
    }

    fn ensure_capacity(&self, cursor: DeviceSize, end: DeviceSize) -> Result<(), AllocationError> {
        let capacity = self.parent.size();

        if end <= capacity {
            return Ok(());
        }

        let new_capacity = match self.growth_policy {
            GrowthPolicy::Exact => capacity.checked_add(end - cursor),
            GrowthPolicy::Doubling => capacity.checked_mul(2),
        }
        .ok_or(AllocationError::CapacityOverflow)?
        .max(end);

        self.parent.grow(new_capacity)?;

        tracing::debug!(capacity, new_capacity, "grew linear allocator region");

        Ok(())
    }
}

/// Parameters to create a new [`LinearAllocator`].
#[derive(Clone, Debug)]
pub struct LinearAllocatorCreateInfo {
    /// How the region is grown when an allocation doesn't fit.
    ///
    /// The default value is [`GrowthPolicy::Doubling`].
    pub growth_policy: GrowthPolicy,

    pub _ne: NonExhaustive,
}

impl Default for LinearAllocatorCreateInfo {
    #[inline]
    fn default() -> Self {
        LinearAllocatorCreateInfo {
            growth_policy: GrowthPolicy::Doubling,
            _ne: crate::NE,
        }
    }
}

/// How a [`LinearAllocator`] grows its region when an allocation of `n` bytes doesn't fit.
///
/// The new size is never less than what the allocation requires.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum GrowthPolicy {
    /// Grow to `capacity + n`.
    Exact,

    /// Grow to `max(2 * capacity, cursor + n)`.
    #[default]
    Doubling,
}
