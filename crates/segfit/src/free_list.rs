//! Segregated free lists.
//!
//! Free blocks are kept in circular doubly-linked lists, one per size class.
//! Each list is fronted by a sentinel node that lives outside the heap and
//! never stands for a block. The links of a block are stored in its first
//! two payload words:
//!
//! ```text
//! Free Block Layout:
//! ┌────────┬──────────┬──────────┬─────────────┬────────┐
//! │ header │ next     │ prev     │ ...         │ footer │
//! └────────┴──────────┴──────────┴─────────────┴────────┘
//! ```
//!
//! Size classes are powers of two anchored at [`MIN_BLOCK_SIZE`]: class 0
//! holds exactly `M`, class `i` holds `(2^(i-1)·M, 2^i·M]`, and the last
//! class holds everything larger.

use alloc::vec::Vec;

use platform_cast::{CastFrom as _, CastInto as _};

use crate::{
    block::{BlockRef, MIN_BLOCK_SIZE},
    extent::ExtentProvider,
    memory::HeapMemory,
};

/// Returns the lowest class whose range can hold a block of `size` bytes,
/// given `count` classes.
pub(crate) fn class_of(size: usize, count: usize) -> usize {
    let mut bin_max = MIN_BLOCK_SIZE;
    let mut index = 0;
    while size > bin_max && index < count - 1 {
        bin_max <<= 1;
        index += 1;
    }
    index
}

/// One end of a free-list link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Link {
    Sentinel(usize),
    Block(BlockRef),
}

impl Link {
    const SENTINEL_TAG: u64 = 1;
    const SENTINEL_SHIFT: u32 = 4;

    /// Encodes a link as a heap word. Zero marks an unlinked block.
    ///
    /// Block offsets are never odd, so the low bit tells sentinels apart.
    fn encode(link: Option<Self>) -> u64 {
        match link {
            None => 0,
            Some(Self::Sentinel(class)) => {
                (u64::cast_from(class) << Self::SENTINEL_SHIFT) | Self::SENTINEL_TAG
            }
            Some(Self::Block(block)) => u64::cast_from(block.offset()),
        }
    }

    fn decode(word: u64) -> Option<Self> {
        if word == 0 {
            None
        } else if word & Self::SENTINEL_TAG != 0 {
            Some(Self::Sentinel((word >> Self::SENTINEL_SHIFT).cast_into()))
        } else {
            Some(Self::Block(BlockRef::new(word.cast_into())))
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sentinel {
    next: Link,
    prev: Link,
}

/// The array of size-class lists.
#[derive(Debug)]
pub(crate) struct FreeLists {
    sentinels: Vec<Sentinel>,
}

impl FreeLists {
    pub(crate) fn new(count: usize) -> Self {
        assert!(count > 0, "at least one free list is required");
        let sentinels = (0..count)
            .map(|class| Sentinel {
                next: Link::Sentinel(class),
                prev: Link::Sentinel(class),
            })
            .collect();
        Self { sentinels }
    }

    pub(crate) fn count(&self) -> usize {
        self.sentinels.len()
    }

    pub(crate) fn class_of(&self, size: usize) -> usize {
        class_of(size, self.count())
    }

    /// Clears the links of a block that is about to become free.
    pub(crate) fn clear_links<P>(memory: &mut HeapMemory<P>, block: BlockRef)
    where
        P: ExtentProvider,
    {
        memory.set_word(block.next_link(), 0);
        memory.set_word(block.prev_link(), 0);
    }

    pub(crate) fn is_linked<P>(memory: &HeapMemory<P>, block: BlockRef) -> bool
    where
        P: ExtentProvider,
    {
        memory.word(block.next_link()) != 0 || memory.word(block.prev_link()) != 0
    }

    fn linked_block<P>(memory: &HeapMemory<P>, offset: usize, block: BlockRef) -> Link
    where
        P: ExtentProvider,
    {
        let Some(link) = Link::decode(memory.word(offset)) else {
            panic!("free block {:#x} lost its links", block.offset());
        };
        link
    }

    fn next<P>(&self, memory: &HeapMemory<P>, link: Link) -> Link
    where
        P: ExtentProvider,
    {
        match link {
            Link::Sentinel(class) => self.sentinels[class].next,
            Link::Block(block) => Self::linked_block(memory, block.next_link(), block),
        }
    }

    fn set_next<P>(&mut self, memory: &mut HeapMemory<P>, link: Link, next: Link)
    where
        P: ExtentProvider,
    {
        match link {
            Link::Sentinel(class) => self.sentinels[class].next = next,
            Link::Block(block) => memory.set_word(block.next_link(), Link::encode(Some(next))),
        }
    }

    fn set_prev<P>(&mut self, memory: &mut HeapMemory<P>, link: Link, prev: Link)
    where
        P: ExtentProvider,
    {
        match link {
            Link::Sentinel(class) => self.sentinels[class].prev = prev,
            Link::Block(block) => memory.set_word(block.prev_link(), Link::encode(Some(prev))),
        }
    }

    /// Links `block` at the head of the list for its current size.
    pub(crate) fn insert<P>(&mut self, memory: &mut HeapMemory<P>, block: BlockRef)
    where
        P: ExtentProvider,
    {
        assert!(
            !Self::is_linked(memory, block),
            "free block {:#x} is already linked",
            block.offset()
        );
        let class = self.class_of(memory.header(block).size());
        let head = Link::Sentinel(class);
        let first = self.sentinels[class].next;
        self.set_next(memory, Link::Block(block), first);
        self.set_prev(memory, Link::Block(block), head);
        self.set_prev(memory, first, Link::Block(block));
        self.set_next(memory, head, Link::Block(block));
    }

    /// Unlinks `block` from whichever list holds it. Unlinked blocks are
    /// left alone.
    pub(crate) fn remove<P>(&mut self, memory: &mut HeapMemory<P>, block: BlockRef)
    where
        P: ExtentProvider,
    {
        let next = Link::decode(memory.word(block.next_link()));
        let prev = Link::decode(memory.word(block.prev_link()));
        let (Some(next), Some(prev)) = (next, prev) else {
            return;
        };
        self.set_next(memory, prev, next);
        self.set_prev(memory, next, prev);
        Self::clear_links(memory, block);
    }

    /// Finds and unlinks the first block of at least `size` bytes.
    ///
    /// Classes are scanned upward from `class_of(size)`; within a class the
    /// first fitting block wins.
    pub(crate) fn find_fit<P>(&mut self, memory: &mut HeapMemory<P>, size: usize) -> Option<BlockRef>
    where
        P: ExtentProvider,
    {
        for class in self.class_of(size)..self.count() {
            let head = Link::Sentinel(class);
            let mut cursor = self.next(memory, head);
            while let Link::Block(block) = cursor {
                if memory.header(block).size() >= size {
                    self.remove(memory, block);
                    return Some(block);
                }
                cursor = self.next(memory, cursor);
            }
            debug_assert_eq!(cursor, head, "free list {class} is corrupted");
        }
        None
    }

    /// Walks the blocks of one class, stopping after `limit` steps.
    ///
    /// Returns `None` if the walk does not come back to the sentinel.
    pub(crate) fn collect_class<P>(
        &self,
        memory: &HeapMemory<P>,
        class: usize,
        limit: usize,
    ) -> Option<Vec<BlockRef>>
    where
        P: ExtentProvider,
    {
        let head = Link::Sentinel(class);
        let mut blocks = Vec::new();
        let mut prev = head;
        let mut cursor = self.sentinels[class].next;
        while let Link::Block(block) = cursor {
            if blocks.len() == limit {
                return None;
            }
            if Link::decode(memory.word(block.prev_link())) != Some(prev) {
                return None;
            }
            blocks.push(block);
            prev = cursor;
            cursor = Link::decode(memory.word(block.next_link()))?;
        }
        (cursor == head && self.sentinels[class].prev == prev).then_some(blocks)
    }
}
