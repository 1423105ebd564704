use super::{next_allocator_id, Blocks, Parent, Region, Suballocation, SuballocatorError};
use crate::{memory::AllocationError, DeviceSize};
use foldhash::HashMap;
use parking_lot::Mutex;
use std::{hash::Hash, num::NonZero};

/// A [suballocator] whose suballocations all have the same size and are kept densely packed.
///
/// The live blocks always occupy slots `0..live_count` of the region, so that the whole array can
/// be handed to the device as is, for example as an instance buffer. Allocation takes the slot at
/// `live_count`, growing the region by one block if it's full. Freeing any slot other than the last
/// one moves the last live block into the freed slot, and returns a [`SlotMove`] so that the caller
/// can update whatever maps its objects to slots. [`ContiguousTable`] does that bookkeeping.
///
/// [suballocator]: super
#[derive(Debug)]
pub struct ContiguousFixedAllocator {
    id: NonZero<u64>,
    parent: Parent,
    state: Mutex<ContiguousState>,
}

#[derive(Debug)]
struct ContiguousState {
    blocks: Blocks,
    live_count: DeviceSize,
}

/// Reports that a [`ContiguousFixedAllocator`] moved a block from one slot into another.
///
/// Handles that referred to the slot `from` must be replaced with handles to the slot `to`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotMove {
    pub from: DeviceSize,
    pub to: DeviceSize,
}

impl ContiguousFixedAllocator {
    /// Creates a new `ContiguousFixedAllocator` for the given region. No slot is live.
    ///
    /// # Panics
    ///
    /// - Panics if `block_size` is zero.
    pub fn new(parent: Parent, block_size: DeviceSize) -> Self {
        let blocks = Blocks::new(block_size, parent.size());

        ContiguousFixedAllocator {
            id: next_allocator_id(),
            parent,
            state: Mutex::new(ContiguousState {
                blocks,
                live_count: 0,
            }),
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

    /// Returns the number of live slots. The live slots are `0..live_slots()`.
    #[inline]
    pub fn live_slots(&self) -> DeviceSize {
        self.state.lock().live_count
    }

    /// Returns the number of slots that fit in the region.
    #[inline]
    pub fn slot_count(&self) -> DeviceSize {
        self.state.lock().blocks.count()
    }

    /// Returns a handle to the live slot `index`.
    pub fn slot(&self, index: DeviceSize) -> Option<Suballocation> {
        let state = self.state.lock();

        (index < state.live_count).then(|| self.handle(index, state.blocks.block_size))
    }

    /// Allocates the slot at the end of the live range.
    pub fn alloc(&self) -> Result<Suballocation, SuballocatorError> {
        let mut state = self.state.lock();
        let index = state.live_count;

        if index == state.blocks.count() {
            let new_count = index
                .checked_add(1)
                .ok_or(AllocationError::CapacityOverflow)?;
            state.blocks.grow_to(&self.parent, new_count)?;

            tracing::debug!(
                slot_count = state.blocks.count(),
                "grew contiguous allocator region"
            );
        }

        state.blocks.set_live(index, true);
        state.live_count += 1;

        Ok(self.handle(index, state.blocks.block_size))
    }

    /// Frees the slot that `allocation` refers to.
    ///
    /// If the slot isn't the last live one, the contents of the last live slot are copied into it
    /// and the move is returned. The live range shrinks by one either way.
    ///
    /// # Errors
    ///
    /// - Returns [`SuballocatorError::DoubleFree`] if the slot is not live.
    /// - Returns [`SuballocatorError::ForeignAllocation`] if `allocation` is not a slot of this
    ///   allocator.
    /// - Returns [`SuballocatorError::Access`] if the last slot couldn't be moved. Nothing is freed
    ///   in that case.
    pub fn free(&self, allocation: &Suballocation) -> Result<Option<SlotMove>, SuballocatorError> {
        let mut state = self.state.lock();
        let index = state.blocks.index_of(self.id, allocation)?;

        if index >= state.live_count {
            return Err(SuballocatorError::DoubleFree {
                offset: allocation.offset(),
            });
        }

        let last = state.live_count - 1;
        let block_size = state.blocks.block_size;
        let slot_move = if index != last {
            self.parent
                .copy_within(index * block_size, last * block_size, block_size)?;

            tracing::trace!(from = last, to = index, "moved contiguous slot");

            Some(SlotMove {
                from: last,
                to: index,
            })
        } else {
            None
        };

        state.blocks.set_live(last, false);
        state.live_count = last;

        Ok(slot_move)
    }

    /// Grows the region, if needed, so that at least `count` slots fit in it.
    pub fn preallocate(&self, count: DeviceSize) -> Result<(), SuballocatorError> {
        self.state.lock().blocks.grow_to(&self.parent, count)?;

        Ok(())
    }

    fn handle(&self, index: DeviceSize, block_size: DeviceSize) -> Suballocation {
        Suballocation::new(
            index * block_size,
            block_size,
            self.parent.clone(),
            self.id,
        )
    }
}

/// Keeps track of which key lives in which slot of a [`ContiguousFixedAllocator`].
///
/// This is the bookkeeping every user of a contiguous allocator has to do, bundled up: when a free
/// moves the last slot, the key that owned it is pointed at its new slot.
#[derive(Debug)]
pub struct ContiguousTable<K> {
    allocator: ContiguousFixedAllocator,
    slots: HashMap<K, DeviceSize>,
    keys: Vec<K>,
}

impl<K> ContiguousTable<K>
where
    K: Clone + Eq + Hash,
{
    /// Creates a new, empty `ContiguousTable` that stores its values in `allocator`.
    ///
    /// # Panics
    ///
    /// - Panics if `allocator` already has live slots.
    pub fn new(allocator: ContiguousFixedAllocator) -> Self {
        assert_eq!(allocator.live_slots(), 0);

        ContiguousTable {
            allocator,
            slots: HashMap::default(),
            keys: Vec::new(),
        }
    }

    #[inline]
    pub fn allocator(&self) -> &ContiguousFixedAllocator {
        &self.allocator
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Returns the slot index of `key`.
    #[inline]
    pub fn slot_of(&self, key: &K) -> Option<DeviceSize> {
        self.slots.get(key).copied()
    }

    /// Returns the key that lives in slot `index`.
    #[inline]
    pub fn key_at(&self, index: DeviceSize) -> Option<&K> {
        self.keys.get(usize::try_from(index).ok()?)
    }

    /// Returns a handle to the slot of `key`.
    pub fn get(&self, key: &K) -> Option<Suballocation> {
        self.allocator.slot(self.slot_of(key)?)
    }

    /// Writes `bytes` to the slot of `key`, allocating a slot first if `key` doesn't have one.
    ///
    /// If the write fails, a newly allocated slot is freed again and `key` is not inserted.
    pub fn insert(&mut self, key: K, bytes: &[u8]) -> Result<Suballocation, SuballocatorError> {
        if let Some(slot) = self.get(&key) {
            slot.write(bytes)?;

            return Ok(slot);
        }

        let slot = self.allocator.alloc()?;

        if let Err(err) = slot.write(bytes) {
            // The new slot is the last live one, so freeing it moves nothing.
            self.allocator.free(&slot)?;

            return Err(err.into());
        }

        self.slots.insert(key.clone(), self.keys.len() as DeviceSize);
        self.keys.push(key);

        Ok(slot)
    }

    /// Frees the slot of `key`. Returns `false` if `key` doesn't have one.
    pub fn remove(&mut self, key: &K) -> Result<bool, SuballocatorError> {
        let Some(index) = self.slot_of(key) else {
            return Ok(false);
        };
        let slot = self.allocator.slot(index).ok_or(SuballocatorError::DoubleFree {
            offset: index * self.allocator.block_size(),
        })?;
        let slot_move = self.allocator.free(&slot)?;

        self.slots.remove(key);
        self.keys.swap_remove(index as usize);

        if let Some(SlotMove { from, to }) = slot_move {
            debug_assert_eq!(from, self.keys.len() as DeviceSize);
            self.slots.insert(self.keys[to as usize].clone(), to);
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{suballocator::tests::store, AccessError};
    use crossbeam_queue::ArrayQueue;
    use std::thread;

    #[test]
    fn free_keeps_live_slots_dense() {
        let allocator = ContiguousFixedAllocator::new(store(64).into(), 16);
        let slots = (0..4u8)
            .map(|i| {
                let slot = allocator.alloc().unwrap();
                slot.write(&[i; 16]).unwrap();

                slot
            })
            .collect::<Vec<_>>();
        assert_eq!(allocator.live_slots(), 4);

        let slot_move = allocator.free(&slots[1]).unwrap();
        assert_eq!(slot_move, Some(SlotMove { from: 3, to: 1 }));
        assert_eq!(allocator.live_slots(), 3);

        // The old last slot's contents now live in slot 1.
        let mut bytes = [0; 16];
        allocator.slot(1).unwrap().read(&mut bytes).unwrap();
        assert_eq!(bytes, [3; 16]);
        assert!(allocator.slot(3).is_none());

        // Freeing the last slot moves nothing.
        assert_eq!(allocator.free(&slots[2]).unwrap(), None);
        assert_eq!(allocator.live_slots(), 2);

        // New slots are appended to the live range.
        assert_eq!(allocator.alloc().unwrap().offset(), 32);
    }

    #[test]
    fn grows_when_full() {
        let store = store(32);
        let allocator = ContiguousFixedAllocator::new(store.clone().into(), 16);

        allocator.alloc().unwrap();
        allocator.alloc().unwrap();
        assert_eq!(allocator.alloc().unwrap().offset(), 32);
        assert_eq!(store.capacity(), 48);

        allocator.preallocate(8).unwrap();
        assert_eq!(allocator.slot_count(), 8);
        assert_eq!(store.capacity(), 128);
    }

    #[test]
    fn freeing_a_dead_slot() {
        let allocator = ContiguousFixedAllocator::new(store(64).into(), 16);
        let a = allocator.alloc().unwrap();
        let b = allocator.alloc().unwrap();

        allocator.free(&b).unwrap();
        assert_eq!(
            allocator.free(&b),
            Err(SuballocatorError::DoubleFree { offset: 16 }),
        );
        allocator.free(&a).unwrap();
        assert_eq!(allocator.live_slots(), 0);
    }

    #[test]
    fn table_follows_moves() {
        let allocator = ContiguousFixedAllocator::new(store(16).into(), 4);
        let mut table = ContiguousTable::new(allocator);

        for (key, value) in ["a", "b", "c", "d", "e"].into_iter().zip(1u32..) {
            table.insert(key, &value.to_le_bytes()).unwrap();
        }
        assert_eq!(table.len(), 5);

        assert!(table.remove(&"b").unwrap());
        assert!(!table.remove(&"b").unwrap());
        assert_eq!(table.slot_of(&"e"), Some(1));
        assert_eq!(table.key_at(1), Some(&"e"));

        assert!(table.remove(&"a").unwrap());
        assert_eq!(table.slot_of(&"d"), Some(0));

        // Every key still reads back its own value, and the live range is dense.
        for (key, value) in [("c", 3u32), ("d", 4), ("e", 5)] {
            let slot = table.get(&key).unwrap();
            assert_eq!(slot.read_pod::<u32>(0).unwrap(), value);
            assert!(slot.offset() < 3 * 4);
        }
        assert_eq!(table.allocator().live_slots(), 3);

        // Overwriting keeps the slot.
        let slot = table.insert("c", &9u32.to_le_bytes()).unwrap();
        assert_eq!(Some(slot.offset() / 4), table.slot_of(&"c"));
        assert_eq!(table.get(&"c").unwrap().read_pod::<u32>(0).unwrap(), 9);
    }

    #[test]
    fn failed_insert_leaves_no_key_behind() {
        let allocator = ContiguousFixedAllocator::new(store(16).into(), 4);
        let mut table = ContiguousTable::new(allocator);

        assert_eq!(
            table.insert("a", &[0; 8]).map(|slot| slot.offset()),
            Err(SuballocatorError::Access(AccessError::CapacityExceeded {
                offset: 0,
                len: 8,
                capacity: 4,
            })),
        );
        assert_eq!(table.slot_of(&"a"), None);
        assert!(table.is_empty());
        assert_eq!(table.allocator().live_slots(), 0);

        let slot = table.insert("a", &7u32.to_le_bytes()).unwrap();
        assert_eq!(slot.offset(), 0);
        assert_eq!(table.slot_of(&"a"), Some(0));
        assert_eq!(table.key_at(0), Some(&"a"));

        // A failed overwrite keeps the existing value.
        assert!(table.insert("a", &[0; 8]).is_err());
        assert_eq!(table.get(&"a").unwrap().read_pod::<u32>(0).unwrap(), 7);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn concurrent_allocations_stay_dense() {
        const THREADS: usize = 8;
        const ALLOCATIONS_PER_THREAD: usize = 32;
        const BLOCK_SIZE: DeviceSize = 8;

        let allocator = ContiguousFixedAllocator::new(store(BLOCK_SIZE).into(), BLOCK_SIZE);
        let allocs = ArrayQueue::new(ALLOCATIONS_PER_THREAD * THREADS);

        thread::scope(|scope| {
            for _ in 0..THREADS {
                let (allocator, allocs) = (&allocator, &allocs);

                scope.spawn(move || {
                    for _ in 0..ALLOCATIONS_PER_THREAD {
                        allocs.push(allocator.alloc().unwrap()).unwrap();
                    }
                });
            }
        });

        let mut offsets = allocs
            .into_iter()
            .map(|slot| slot.offset())
            .collect::<Vec<_>>();
        offsets.sort_unstable();

        let count = (ALLOCATIONS_PER_THREAD * THREADS) as DeviceSize;
        assert!(offsets.into_iter().eq((0..count).map(|i| i * BLOCK_SIZE)));
        assert_eq!(allocator.live_slots(), count);
    }

    #[test]
    fn interleaved_allocations_stay_dense() {
        const BLOCK_SIZE: DeviceSize = 8;

        let allocator = ContiguousFixedAllocator::new(store(4 * BLOCK_SIZE).into(), BLOCK_SIZE);
        // What each live slot is expected to hold.
        let mut tags: Vec<u64> = Vec::new();
        let mut state = 0x2545_f491_4f6c_dd1du64;
        let mut next_tag = 0;

        for _ in 0..500 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;

            if tags.is_empty() || state % 5 < 3 {
                let slot = allocator.alloc().unwrap();
                assert_eq!(slot.offset(), tags.len() as DeviceSize * BLOCK_SIZE);
                slot.write_pod(0, &next_tag).unwrap();
                tags.push(next_tag);
                next_tag += 1;
            } else {
                let index = (state >> 32) % tags.len() as u64;
                let slot = allocator.slot(index).unwrap();
                let slot_move = allocator.free(&slot).unwrap();

                match slot_move {
                    Some(SlotMove { from, to }) => {
                        assert_eq!(to, index);
                        assert_eq!(from, allocator.live_slots());
                    }
                    None => assert_eq!(index, allocator.live_slots()),
                }
                tags.swap_remove(index as usize);
            }

            let live = allocator.live_slots();
            assert_eq!(live, tags.len() as DeviceSize);
            assert!(allocator.slot(live).is_none());

            for (index, &tag) in (0..).zip(&tags) {
                let slot = allocator.slot(index).unwrap();
                assert_eq!(slot.offset(), index * BLOCK_SIZE);
                assert_eq!(slot.read_pod::<u64>(0).unwrap(), tag);
            }
        }
    }
}
