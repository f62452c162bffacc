//! Exact-size caches of recently freed blocks.
//!
//! Quick list `k` holds blocks of exactly `MIN_BLOCK_SIZE + k * BLOCK_ALIGN`
//! bytes as a singly-linked LIFO threaded through the first payload word of
//! each block. Cached blocks stay marked allocated, so they are invisible to
//! coalescing until the list overflows and is flushed back into the free
//! lists.

use alloc::vec::Vec;

use platform_cast::{CastFrom as _, CastInto as _};

use crate::{
    block::{BLOCK_ALIGN, BlockRef, MIN_BLOCK_SIZE},
    extent::ExtentProvider,
    memory::HeapMemory,
};

#[derive(Debug, Clone, Copy, Default)]
struct QuickList {
    first: Option<BlockRef>,
    len: usize,
}

#[derive(Debug)]
pub(crate) struct QuickLists {
    lists: Vec<QuickList>,
    capacity: usize,
}

/// Entries detached from a quick list, in LIFO order.
#[derive(Debug)]
pub(crate) struct Detached {
    pub(crate) first: Option<BlockRef>,
    pub(crate) len: usize,
}

impl QuickLists {
    pub(crate) fn new(count: usize, capacity: usize) -> Self {
        Self {
            lists: alloc::vec![QuickList::default(); count],
            capacity,
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.lists.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Block size cached by list `index`.
    pub(crate) const fn block_size(index: usize) -> usize {
        MIN_BLOCK_SIZE + index * BLOCK_ALIGN
    }

    /// Returns the list caching blocks of exactly `size` bytes, if any.
    pub(crate) fn index_of(&self, size: usize) -> Option<usize> {
        let offset = size.checked_sub(MIN_BLOCK_SIZE)?;
        if !offset.is_multiple_of(BLOCK_ALIGN) {
            return None;
        }
        let index = offset / BLOCK_ALIGN;
        (index < self.lists.len()).then_some(index)
    }

    pub(crate) fn len(&self, index: usize) -> usize {
        self.lists[index].len
    }

    pub(crate) fn is_full(&self, index: usize) -> bool {
        self.lists[index].len >= self.capacity
    }

    /// Reads the entry that follows `block` in its quick list.
    pub(crate) fn next_entry<P>(memory: &HeapMemory<P>, block: BlockRef) -> Option<BlockRef>
    where
        P: ExtentProvider,
    {
        match memory.word(block.next_link()) {
            0 => None,
            offset => Some(BlockRef::new(offset.cast_into())),
        }
    }

    /// Pops the most recently cached block of exactly `size` bytes.
    pub(crate) fn pop<P>(&mut self, memory: &HeapMemory<P>, size: usize) -> Option<BlockRef>
    where
        P: ExtentProvider,
    {
        let index = self.index_of(size)?;
        let list = &mut self.lists[index];
        let block = list.first?;
        list.first = Self::next_entry(memory, block);
        list.len -= 1;
        Some(block)
    }

    /// Pushes `block` onto list `index`, which must have room for it.
    pub(crate) fn push<P>(&mut self, memory: &mut HeapMemory<P>, index: usize, block: BlockRef)
    where
        P: ExtentProvider,
    {
        assert!(!self.is_full(index), "quick list {index} is full");
        let list = &mut self.lists[index];
        let next = list.first.map_or(0, |next| u64::cast_from(next.offset()));
        memory.set_word(block.next_link(), next);
        list.first = Some(block);
        list.len += 1;
    }

    /// Empties list `index` and hands its entries to the caller.
    pub(crate) fn detach(&mut self, index: usize) -> Detached {
        let list = core::mem::take(&mut self.lists[index]);
        Detached {
            first: list.first,
            len: list.len,
        }
    }

    /// Collects the entries of list `index`, most recent first.
    pub(crate) fn entries<P>(&self, memory: &HeapMemory<P>, index: usize) -> Vec<BlockRef>
    where
        P: ExtentProvider,
    {
        let list = &self.lists[index];
        let mut entries = Vec::with_capacity(list.len);
        let mut cursor = list.first;
        while let Some(block) = cursor {
            if entries.len() == list.len {
                break;
            }
            entries.push(block);
            cursor = Self::next_entry(memory, block);
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::PageArena;

    fn memory() -> HeapMemory<PageArena> {
        let mut memory = HeapMemory::new(PageArena::new(1024, 1), 0);
        memory.grow_one_extent().unwrap();
        memory
    }

    #[test]
    fn test_index_of() {
        let lists = QuickLists::new(20, 5);
        assert_eq!(lists.index_of(32), Some(0));
        assert_eq!(lists.index_of(48), Some(1));
        assert_eq!(lists.index_of(336), Some(19));
        assert_eq!(lists.index_of(352), None);
        assert_eq!(lists.index_of(16), None);
        assert_eq!(lists.index_of(40), None);
        assert_eq!(QuickLists::block_size(19), 336);

        let disabled = QuickLists::new(0, 0);
        assert_eq!(disabled.index_of(32), None);
    }

    #[test]
    fn test_push_pop_is_lifo() {
        let mut memory = memory();
        let mut lists = QuickLists::new(4, 3);
        let a = BlockRef::new(0x28);
        let b = BlockRef::new(0x68);
        lists.push(&mut memory, 1, a);
        lists.push(&mut memory, 1, b);
        assert_eq!(lists.len(1), 2);
        assert_eq!(lists.entries(&memory, 1), [b, a]);

        assert_eq!(lists.pop(&memory, 32), None);
        assert_eq!(lists.pop(&memory, 48), Some(b));
        assert_eq!(lists.pop(&memory, 48), Some(a));
        assert_eq!(lists.pop(&memory, 48), None);
        assert_eq!(lists.len(1), 0);
    }

    #[test]
    fn test_capacity() {
        let mut memory = memory();
        let mut lists = QuickLists::new(1, 2);
        lists.push(&mut memory, 0, BlockRef::new(0x28));
        assert!(!lists.is_full(0));
        lists.push(&mut memory, 0, BlockRef::new(0x48));
        assert!(lists.is_full(0));
        assert_eq!(lists.capacity(), 2);
    }

    #[test]
    #[should_panic(expected = "quick list 0 is full")]
    fn test_push_past_capacity() {
        let mut memory = memory();
        let mut lists = QuickLists::new(1, 1);
        lists.push(&mut memory, 0, BlockRef::new(0x28));
        lists.push(&mut memory, 0, BlockRef::new(0x48));
    }

    #[test]
    fn test_detach() {
        let mut memory = memory();
        let mut lists = QuickLists::new(2, 5);
        let a = BlockRef::new(0x28);
        let b = BlockRef::new(0x48);
        lists.push(&mut memory, 0, a);
        lists.push(&mut memory, 0, b);

        let detached = lists.detach(0);
        assert_eq!(detached.first, Some(b));
        assert_eq!(detached.len, 2);
        assert_eq!(QuickLists::next_entry(&memory, b), Some(a));
        assert_eq!(QuickLists::next_entry(&memory, a), None);
        assert_eq!(lists.len(0), 0);
        assert!(lists.entries(&memory, 0).is_empty());
    }
}
