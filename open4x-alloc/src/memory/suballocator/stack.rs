use super::{next_allocator_id, Blocks, Parent, Region, Suballocation, SuballocatorError};
use crate::{memory::AllocationError, DeviceSize};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{num::NonZero, ops::Range};

/// A [suballocator] whose suballocations all have the same size, reusing the most recently freed
/// block first.
///
/// The free blocks are kept on a stack. Initially it holds every block that fits in the region,
/// with block 0 on top, so that a fresh allocator hands out blocks in ascending order. When the
/// stack is empty, the region is grown by exactly one block. Allocation and free are *O*(1).
///
/// [suballocator]: super
#[derive(Debug)]
pub struct StackAllocator {
    id: NonZero<u64>,
    parent: Parent,
    state: Mutex<StackState>,
}

#[derive(Debug)]
struct StackState {
    blocks: Blocks,
    free_stack: SmallVec<[DeviceSize; 16]>,
}

impl StackAllocator {
    /// Creates a new `StackAllocator` for the given region. Every whole block that fits in the
    /// region is free.
    ///
    /// # Panics
    ///
    /// - Panics if `block_size` is zero.
    pub fn new(parent: Parent, block_size: DeviceSize) -> Self {
        let blocks = Blocks::new(block_size, parent.size());
        let free_stack = (0..blocks.count()).rev().collect();

        StackAllocator {
            id: next_allocator_id(),
            parent,
            state: Mutex::new(StackState { blocks, free_stack }),
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

    /// Returns the number of free blocks.
    #[inline]
    pub fn free_count(&self) -> DeviceSize {
        self.state.lock().free_stack.len() as DeviceSize
    }

    /// Allocates a block.
    pub fn alloc(&self) -> Result<Suballocation, SuballocatorError> {
        let mut state = self.state.lock();

        let index = match state.free_stack.pop() {
            Some(index) => index,
            None => {
                let added = self.grow_locked(&mut state, 1)?;
                state.free_stack.extend((added.start + 1..added.end).rev());

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

    /// Frees the block that `allocation` refers to. It's the first to be handed out again.
    pub fn free(&self, allocation: &Suballocation) -> Result<(), SuballocatorError> {
        let mut state = self.state.lock();
        let index = state.blocks.index_of(self.id, allocation)?;

        if !state.blocks.is_live(index) {
            return Err(SuballocatorError::DoubleFree {
                offset: allocation.offset(),
            });
        }

        state.blocks.set_live(index, false);
        state.free_stack.push(index);

        Ok(())
    }

    /// Grows the region, if needed, so that at least `count` blocks are free.
    pub fn reserve(&self, count: DeviceSize) -> Result<(), SuballocatorError> {
        let mut state = self.state.lock();
        let free_count = state.free_stack.len() as DeviceSize;

        if free_count < count {
            let added = self.grow_locked(&mut state, count - free_count)?;

            // The blocks that were already free stay on top.
            state.free_stack.insert_many(0, added.rev());
        }

        Ok(())
    }

    fn grow_locked(
        &self,
        state: &mut StackState,
        count: DeviceSize,
    ) -> Result<Range<DeviceSize>, AllocationError> {
        let new_count = state
            .blocks
            .count()
            .checked_add(count)
            .ok_or(AllocationError::CapacityOverflow)?;
        let added = state.blocks.grow_to(&self.parent, new_count)?;

        tracing::debug!(
            block_count = state.blocks.count(),
            "grew stack allocator region"
        );

        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::suballocator::{tests::store, LinearAllocator};
    use crossbeam_queue::ArrayQueue;
    use std::{sync::Arc, thread};

    #[test]
    fn fresh_allocator_hands_out_blocks_in_order() {
        let allocator = StackAllocator::new(store(64).into(), 16);

        for expected in [0, 16, 32, 48] {
            assert_eq!(allocator.alloc().unwrap().offset(), expected);
        }
        assert_eq!(allocator.free_count(), 0);
    }

    #[test]
    fn lifo_reuse() {
        let allocator = StackAllocator::new(store(64).into(), 16);
        let blocks = (0..4).map(|_| allocator.alloc().unwrap()).collect::<Vec<_>>();

        allocator.free(&blocks[2]).unwrap();
        allocator.free(&blocks[0]).unwrap();
        allocator.free(&blocks[3]).unwrap();

        assert_eq!(allocator.alloc().unwrap(), blocks[3]);
        assert_eq!(allocator.alloc().unwrap(), blocks[0]);
        assert_eq!(allocator.alloc().unwrap(), blocks[2]);
    }

    #[test]
    fn grows_by_exactly_one_block() {
        let store = store(32);
        let allocator = StackAllocator::new(store.clone().into(), 16);

        allocator.alloc().unwrap();
        allocator.alloc().unwrap();
        assert_eq!(allocator.alloc().unwrap().offset(), 32);
        assert_eq!(store.capacity(), 48);
        assert_eq!(allocator.free_count(), 0);
    }

    #[test]
    fn reserve_keeps_freed_blocks_on_top() {
        let store = store(32);
        let allocator = StackAllocator::new(store.clone().into(), 16);
        let a = allocator.alloc().unwrap();
        allocator.alloc().unwrap();

        allocator.free(&a).unwrap();
        allocator.reserve(3).unwrap();
        assert_eq!(store.capacity(), 64);
        assert_eq!(allocator.free_count(), 3);

        assert_eq!(allocator.alloc().unwrap(), a);
        assert_eq!(allocator.alloc().unwrap().offset(), 32);
        assert_eq!(allocator.alloc().unwrap().offset(), 48);
    }

    #[test]
    fn double_free_and_foreign() {
        let store = store(64);
        let allocator = StackAllocator::new(store.clone().into(), 16);
        let other = StackAllocator::new(store.into(), 16);
        let block = allocator.alloc().unwrap();

        assert_eq!(
            other.free(&block),
            Err(SuballocatorError::ForeignAllocation),
        );
        allocator.free(&block).unwrap();
        assert_eq!(
            allocator.free(&block),
            Err(SuballocatorError::DoubleFree { offset: 0 }),
        );
    }

    #[test]
    fn carved_from_a_linear_allocator() {
        let global = Arc::new(LinearAllocator::new(store(16).into(), Default::default()));
        let allocator = StackAllocator::new(global.carve(0).unwrap(), 8);
        assert_eq!(allocator.free_count(), 0);

        let a = allocator.alloc().unwrap();
        let b = allocator.alloc().unwrap();
        a.write(&[4; 8]).unwrap();
        b.write(&[5; 8]).unwrap();
        assert_eq!(allocator.parent().size(), 16);

        let mut bytes = [0; 8];
        global.parent().read(8, &mut bytes).unwrap();
        assert_eq!(bytes, [5; 8]);
    }

    #[test]
    fn interleaved_allocations_never_overlap() {
        const THREADS: u64 = 8;
        const ALLOCATIONS_PER_THREAD: u64 = 40;
        const BLOCK_SIZE: DeviceSize = 16;

        let allocator = StackAllocator::new(store(BLOCK_SIZE).into(), BLOCK_SIZE);
        let allocs = ArrayQueue::new((ALLOCATIONS_PER_THREAD * THREADS) as usize);

        thread::scope(|scope| {
            for t in 0..THREADS {
                let (allocator, allocs) = (&allocator, &allocs);

                scope.spawn(move || {
                    let mut held = Vec::new();

                    for i in 0..ALLOCATIONS_PER_THREAD {
                        let tag = (t << 32) | i;
                        let block = allocator.alloc().unwrap();
                        block.write_pod(0, &tag).unwrap();
                        held.push((tag, block));

                        // Free the most recent block every third round, and an older one every
                        // fifth, so that freed blocks are reused out of order.
                        if i % 3 == 2 {
                            let (_, block) = held.pop().unwrap();
                            allocator.free(&block).unwrap();
                        }
                        if i % 5 == 4 && held.len() > 1 {
                            let (_, block) = held.swap_remove(0);
                            allocator.free(&block).unwrap();
                        }
                    }

                    for alloc in held {
                        allocs.push(alloc).unwrap();
                    }
                });
            }
        });

        let mut survivors = allocs.into_iter().collect::<Vec<_>>();
        survivors.sort_by_key(|(_, block)| block.offset());

        for pair in survivors.windows(2) {
            let (a, b) = (&pair[0].1, &pair[1].1);
            assert!(a.offset() + a.size() <= b.offset());
        }
        for (tag, block) in &survivors {
            assert_eq!(block.offset() % BLOCK_SIZE, 0);
            assert_eq!(block.read_pod::<u64>(0).unwrap(), *tag);
        }

        let capacity = allocator.parent().size();
        assert_eq!(
            capacity / BLOCK_SIZE - allocator.free_count(),
            survivors.len() as DeviceSize,
        );
    }
}
