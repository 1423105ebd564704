use super::{next_allocator_id, Blocks, Parent, Region, Suballocation, SuballocatorError};
use crate::{memory::AllocationError, DeviceSize};
use parking_lot::Mutex;
use std::{collections::BTreeSet, num::NonZero, ops::Range};

/// A [suballocator] whose suballocations all have the same size, and can be freed in any order.
///
/// The region is divided into blocks of `block_size` bytes. Allocation hands out the free block
/// with the lowest index, so that live blocks stay grouped at the start of the region as much as
/// possible. When no block is free, the region is grown by one block.
///
/// Freeing a block that is already free is reported as [`SuballocatorError::DoubleFree`], and
/// freeing a suballocation that is not one of the blocks of this allocator as
/// [`SuballocatorError::ForeignAllocation`].
///
/// Allocation and free are *O*(log *n*) where *n* is the number of free blocks.
///
/// [suballocator]: super
#[derive(Debug)]
pub struct FixedAllocator {
    id: NonZero<u64>,
    parent: Parent,
    state: Mutex<FixedAllocatorState>,
}

#[derive(Debug)]
struct FixedAllocatorState {
    blocks: Blocks,
    free_list: BTreeSet<DeviceSize>,
}

impl FixedAllocator {
    /// Creates a new `FixedAllocator` for the given region. Every whole block that fits in the
    /// region is free.
    ///
    /// # Panics
    ///
    /// - Panics if `block_size` is zero.
    pub fn new(parent: Parent, block_size: DeviceSize) -> Self {
        let blocks = Blocks::new(block_size, parent.size());
        let free_list = (0..blocks.count()).collect();

        FixedAllocator {
            id: next_allocator_id(),
            parent,
            state: Mutex::new(FixedAllocatorState { blocks, free_list }),
        }
    }

    #[inline]
    pub fn parent(&self) -> &Parent {
        &self.parent
    }

    #[inline]
    pub fn block_size(&self) -> DeviceSize {
        self.state.lock().blocks.block_size
    }

    /// Returns the number of blocks that fit in the region, live or free.
    #[inline]
    pub fn block_count(&self) -> DeviceSize {
        self.state.lock().blocks.count()
    }

    /// Returns the number of free blocks.
    #[inline]
    pub fn free_count(&self) -> DeviceSize {
        self.state.lock().free_list.len() as DeviceSize
    }

    /// Allocates a block.
    pub fn alloc(&self) -> Result<Suballocation, SuballocatorError> {
        let mut state = self.state.lock();

        let index = match state.free_list.pop_first() {
            Some(index) => index,
            None => {
                let added = self.grow_locked(&mut state, 1)?;
                state.free_list.remove(&added.start);

                added.start
            }
        };

        state.blocks.set_live(index, true);
        let block_size = state.blocks.block_size;

        Ok(Suballocation::new(
            index * block_size,
            block_size,
            self.parent.clone(),
            self.id,
        ))
    }

    /// Frees the block that `allocation` refers to and returns its index.
    pub fn free(&self, allocation: &Suballocation) -> Result<DeviceSize, SuballocatorError> {
        let mut state = self.state.lock();
        let index = state.blocks.index_of(self.id, allocation)?;

        if !state.blocks.is_live(index) {
            return Err(SuballocatorError::DoubleFree {
                offset: allocation.offset(),
            });
        }

        state.blocks.set_live(index, false);
        state.free_list.insert(index);

        Ok(index)
    }

    /// Grows the region, if needed, so that at least `count` blocks are free.
    pub fn reserve(&self, count: DeviceSize) -> Result<(), SuballocatorError> {
        let mut state = self.state.lock();
        let free_count = state.free_list.len() as DeviceSize;

        if free_count < count {
            self.grow_locked(&mut state, count - free_count)?;
        }

        Ok(())
    }

    /// Grows the region by `count` blocks.
    pub fn grow(&self, count: DeviceSize) -> Result<(), SuballocatorError> {
        self.grow_locked(&mut self.state.lock(), count)?;

        Ok(())
    }

    fn grow_locked(
        &self,
        state: &mut FixedAllocatorState,
        count: DeviceSize,
    ) -> Result<Range<DeviceSize>, AllocationError> {
        let old_count = state.blocks.count();
        let new_count = old_count
            .checked_add(count)
            .ok_or(AllocationError::CapacityOverflow)?;
        let added = state.blocks.grow_to(&self.parent, new_count)?;
        state.free_list.extend(added.clone());

        tracing::debug!(
            old_count,
            new_count = state.blocks.count(),
            "grew fixed allocator region"
        );

        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::suballocator::{tests::store, LinearAllocator};
    use crossbeam_queue::ArrayQueue;
    use std::{collections::HashSet, sync::Arc, thread};

    #[test]
    fn grows_by_one_block_and_reuses_freed_blocks() {
        let store = store(32);
        let allocator = FixedAllocator::new(store.clone().into(), 16);

        let first = allocator.alloc().unwrap();
        let second = allocator.alloc().unwrap();
        assert_eq!((first.offset(), first.size()), (0, 16));
        assert_eq!((second.offset(), second.size()), (16, 16));
        assert_eq!(store.capacity(), 32);

        let third = allocator.alloc().unwrap();
        assert_eq!(third.offset(), 32);
        assert_eq!(store.capacity(), 48);
        assert_eq!(allocator.block_count(), 3);

        allocator.free(&first).unwrap();
        let reused = allocator.alloc().unwrap();
        assert_eq!((reused.offset(), reused.size()), (0, 16));
        assert_eq!(reused, first);
    }

    #[test]
    fn lowest_free_block_first() {
        let allocator = FixedAllocator::new(store(64).into(), 16);
        let blocks = (0..4).map(|_| allocator.alloc().unwrap()).collect::<Vec<_>>();

        assert_eq!(allocator.free(&blocks[3]).unwrap(), 3);
        allocator.free(&blocks[1]).unwrap();
        allocator.free(&blocks[2]).unwrap();

        assert_eq!(allocator.alloc().unwrap().offset(), 16);
        assert_eq!(allocator.alloc().unwrap().offset(), 32);
        assert_eq!(allocator.free_count(), 1);
    }

    #[test]
    fn double_free() {
        let allocator = FixedAllocator::new(store(64).into(), 16);
        let block = allocator.alloc().unwrap();

        allocator.free(&block).unwrap();
        assert_eq!(
            allocator.free(&block),
            Err(SuballocatorError::DoubleFree { offset: 0 }),
        );
    }

    #[test]
    fn foreign_allocations() {
        let store = store(64);
        let a = FixedAllocator::new(store.clone().into(), 16);
        let b = FixedAllocator::new(store.clone().into(), 16);
        let linear = LinearAllocator::new(store.into(), Default::default());

        assert_eq!(
            a.free(&b.alloc().unwrap()),
            Err(SuballocatorError::ForeignAllocation),
        );
        assert_eq!(
            a.free(&linear.alloc(16).unwrap()),
            Err(SuballocatorError::ForeignAllocation),
        );
    }

    #[test]
    fn reserve_and_grow() {
        let store = store(16);
        let allocator = FixedAllocator::new(store.clone().into(), 16);

        allocator.reserve(4).unwrap();
        assert_eq!(allocator.free_count(), 4);
        assert_eq!(store.capacity(), 64);

        allocator.reserve(2).unwrap();
        assert_eq!(store.capacity(), 64);

        allocator.grow(2).unwrap();
        assert_eq!(allocator.block_count(), 6);
        assert_eq!(allocator.free_count(), 6);
    }

    #[test]
    fn growth_preserves_data() {
        let store = store(16);
        let allocator = FixedAllocator::new(store.into(), 8);
        let a = allocator.alloc().unwrap();
        let b = allocator.alloc().unwrap();
        a.write(&[1; 8]).unwrap();
        b.write(&[2; 8]).unwrap();

        let c = allocator.alloc().unwrap();
        c.write(&[3; 8]).unwrap();

        let mut bytes = [0; 8];
        a.read(&mut bytes).unwrap();
        assert_eq!(bytes, [1; 8]);
        b.read(&mut bytes).unwrap();
        assert_eq!(bytes, [2; 8]);
    }

    #[test]
    fn nested_in_a_linear_allocator() {
        let global = Arc::new(LinearAllocator::new(store(64).into(), Default::default()));
        let allocator = FixedAllocator::new(global.carve(20).unwrap(), 8);

        // Only whole blocks count.
        assert_eq!(allocator.block_count(), 2);
        allocator.reserve(3).unwrap();
        assert_eq!(allocator.block_count(), 3);
    }

    #[test]
    fn concurrent_allocations_never_overlap() {
        const THREADS: usize = 8;
        const ALLOCATIONS_PER_THREAD: usize = 40;
        const BLOCK_SIZE: DeviceSize = 32;

        let allocator = FixedAllocator::new(store(BLOCK_SIZE).into(), BLOCK_SIZE);
        let allocs = ArrayQueue::new(ALLOCATIONS_PER_THREAD * THREADS);

        // Using threads to randomize allocation order.
        thread::scope(|scope| {
            for _ in 0..THREADS {
                let (allocator, allocs) = (&allocator, &allocs);

                scope.spawn(move || {
                    for i in 0..ALLOCATIONS_PER_THREAD {
                        let block = allocator.alloc().unwrap();

                        // Give some of them back to exercise reuse under contention.
                        if i % 4 == 3 {
                            allocator.free(&block).unwrap();
                        } else {
                            allocs.push(block).unwrap();
                        }
                    }
                });
            }
        });

        let offsets = allocs
            .into_iter()
            .map(|block| block.offset())
            .collect::<HashSet<_>>();
        assert_eq!(offsets.len(), ALLOCATIONS_PER_THREAD * THREADS * 3 / 4);
        assert!(offsets.iter().all(|offset| offset % BLOCK_SIZE == 0));
        assert_eq!(
            allocator.block_count() - allocator.free_count(),
            offsets.len() as DeviceSize,
        );
    }
}
