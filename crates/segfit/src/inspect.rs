//! Read-only views of a heap: block walking, statistics, consistency checks
//! and a printable dump.

use alloc::collections::{BTreeMap, BTreeSet};
use core::fmt;

use snafu::ensure;

use crate::{
    block::{BlockRef, HEADER_SIZE, MIN_BLOCK_SIZE, Payload, WORD_SIZE},
    error::{
        AdjacentFreeSnafu, BrokenFreeListSnafu, BrokenSentinelSnafu, ContractViolation,
        CorruptHeaderSnafu, FooterMismatchSnafu, InvalidBlockSizeSnafu, ListedBlockNotFreeSnafu,
        PayloadTooLargeSnafu, PrevAllocatedMismatchSnafu, QuickListMismatchSnafu,
        SizeSumMismatchSnafu, StaleQuickFlagSnafu, UnlistedFreeBlockSnafu, WrongFreeListSnafu,
    },
    extent::ExtentProvider,
    free_list::FreeLists,
    memory::HeapMemory,
    quick_list::QuickLists,
};

/// Offset of the prologue header from the heap start; the first word is
/// padding that keeps payloads 16-byte aligned.
pub(crate) const PROLOGUE_OFFSET: usize = WORD_SIZE;

/// Offset of the first real block from the heap start.
pub(crate) const FIRST_BLOCK_OFFSET: usize = PROLOGUE_OFFSET + MIN_BLOCK_SIZE;

/// Bytes of every heap that never belong to a real block.
pub(crate) const SENTINEL_OVERHEAD: usize = FIRST_BLOCK_OFFSET + WORD_SIZE;

/// Positions of the sentinels of an initialized heap.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Bounds {
    pub(crate) prologue: BlockRef,
    pub(crate) first: BlockRef,
    pub(crate) epilogue: BlockRef,
}

impl Bounds {
    pub(crate) fn of<P>(memory: &HeapMemory<P>) -> Self
    where
        P: ExtentProvider,
    {
        debug_assert!(memory.is_initialized());
        let start = memory.start();
        Self {
            prologue: BlockRef::new(start + PROLOGUE_OFFSET),
            first: BlockRef::new(start + FIRST_BLOCK_OFFSET),
            epilogue: BlockRef::new(memory.end() - WORD_SIZE),
        }
    }
}

/// What a block is currently used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display, derive_more::IsVariant)]
pub enum BlockState {
    #[display("free")]
    Free,
    #[display("allocated, {payload_size} byte payload")]
    Allocated { payload_size: usize },
    #[display("quick-listed")]
    QuickListed,
}

/// A block seen while walking the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Where the block's payload starts.
    pub payload: Payload,
    /// Total block size, header included.
    pub size: usize,
    pub state: BlockState,
}

/// Iterator over the blocks between the prologue and the epilogue, in
/// address order.
pub struct Blocks<'a, P> {
    memory: &'a HeapMemory<P>,
    cursor: BlockRef,
    end: BlockRef,
}

impl<'a, P> Blocks<'a, P>
where
    P: ExtentProvider,
{
    pub(crate) fn new(memory: &'a HeapMemory<P>) -> Self {
        if !memory.is_initialized() {
            let empty = BlockRef::new(memory.start());
            return Self {
                memory,
                cursor: empty,
                end: empty,
            };
        }
        let bounds = Bounds::of(memory);
        Self {
            memory,
            cursor: bounds.first,
            end: bounds.epilogue,
        }
    }
}

impl<P> Iterator for Blocks<'_, P>
where
    P: ExtentProvider,
{
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.end {
            return None;
        }
        let block = self.cursor;
        let header = self.memory.header(block);
        if header.size() < MIN_BLOCK_SIZE || header.size() > self.end.offset() - block.offset() {
            // Corrupted size; stop rather than wander off.
            self.cursor = self.end;
            return None;
        }
        self.cursor = block.next(header.size());

        let state = if !header.is_allocated() {
            BlockState::Free
        } else if header.is_quick_listed() {
            BlockState::QuickListed
        } else {
            BlockState::Allocated {
                payload_size: header.payload_size(),
            }
        };
        Some(BlockInfo {
            payload: block.payload(),
            size: header.size(),
            state,
        })
    }
}

/// A snapshot of heap occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes covered by the heap layout, sentinels included.
    pub heap_size: usize,
    /// Bytes held by free blocks, quick-listed blocks excluded.
    pub free_bytes: usize,
    pub free_blocks: usize,
    pub allocated_blocks: usize,
    pub quick_blocks: usize,
    /// Sum of the payload sizes of allocated blocks.
    pub live_payload: usize,
    /// Largest `live_payload` observed so far.
    pub peak_payload: usize,
}

/// Verifies every structural invariant of the heap.
pub(crate) fn check_consistency<P>(
    memory: &HeapMemory<P>,
    free_lists: &FreeLists,
    quick_lists: &QuickLists,
) -> Result<(), ContractViolation>
where
    P: ExtentProvider,
{
    if !memory.is_initialized() {
        return Ok(());
    }
    let Bounds {
        prologue,
        first,
        epilogue,
    } = Bounds::of(memory);
    let in_heap = |block: BlockRef| block >= first && block < epilogue;

    let header = memory.header(prologue);
    ensure!(
        header.is_allocated() && header.size() == MIN_BLOCK_SIZE,
        BrokenSentinelSnafu {
            offset: prologue.offset()
        }
    );

    let limit = (epilogue.offset() - first.offset()) / MIN_BLOCK_SIZE;
    let mut listed = BTreeMap::new();
    for class in 0..free_lists.count() {
        let Some(blocks) = free_lists.collect_class(memory, class, limit) else {
            return BrokenFreeListSnafu { class }.fail();
        };
        for block in blocks {
            ensure!(
                in_heap(block),
                ListedBlockNotFreeSnafu {
                    offset: block.offset()
                }
            );
            listed.insert(block, class);
        }
    }

    let mut quick = BTreeSet::new();
    for index in 0..quick_lists.count() {
        let entries = quick_lists.entries(memory, index);
        let len = quick_lists.len(index);
        if entries.len() != len || len > quick_lists.capacity() {
            let offset = entries.last().map_or(0, |block| block.offset());
            return QuickListMismatchSnafu { offset, index }.fail();
        }
        for block in entries {
            let offset = block.offset();
            ensure!(in_heap(block), QuickListMismatchSnafu { offset, index });
            let header = memory.header(block);
            ensure!(
                header.is_allocated()
                    && header.is_quick_listed()
                    && header.size() == QuickLists::block_size(index),
                QuickListMismatchSnafu { offset, index }
            );
            quick.insert(block);
        }
    }

    let mut seen = BTreeSet::new();
    let mut prev_allocated = true;
    let mut total = 0;
    let mut cursor = first;
    while cursor < epilogue {
        let offset = cursor.offset();
        let header = memory.header(cursor);
        let size = header.size();
        ensure!(!header.has_reserved_bits(), CorruptHeaderSnafu { offset });
        ensure!(
            size >= MIN_BLOCK_SIZE && size <= epilogue.offset() - offset,
            InvalidBlockSizeSnafu { offset, size }
        );
        ensure!(
            header.is_prev_allocated() == prev_allocated,
            PrevAllocatedMismatchSnafu { offset }
        );
        if header.is_allocated() {
            ensure!(
                !header.is_quick_listed() || quick.remove(&cursor),
                StaleQuickFlagSnafu { offset }
            );
            ensure!(
                header.payload_size() + HEADER_SIZE <= size,
                PayloadTooLargeSnafu {
                    offset,
                    payload: header.payload_size(),
                    size
                }
            );
        } else {
            ensure!(!header.is_quick_listed(), StaleQuickFlagSnafu { offset });
            ensure!(prev_allocated, AdjacentFreeSnafu { offset });
            ensure!(
                memory.word(cursor.footer(size)) == memory.encode(header),
                FooterMismatchSnafu { offset }
            );
            let Some(&actual) = listed.get(&cursor) else {
                return UnlistedFreeBlockSnafu { offset }.fail();
            };
            let expected = free_lists.class_of(size);
            ensure!(
                actual == expected,
                WrongFreeListSnafu {
                    offset,
                    expected,
                    actual
                }
            );
            seen.insert(cursor);
        }
        prev_allocated = header.is_allocated();
        total += size;
        cursor = cursor.next(size);
    }

    let expected = memory.end() - memory.start() - SENTINEL_OVERHEAD;
    ensure!(
        cursor == epilogue && total == expected,
        SizeSumMismatchSnafu { total, expected }
    );
    let header = memory.header(epilogue);
    ensure!(
        header.is_allocated() && header.size() == 0 && !header.has_reserved_bits(),
        BrokenSentinelSnafu {
            offset: epilogue.offset()
        }
    );
    ensure!(
        header.is_prev_allocated() == prev_allocated,
        PrevAllocatedMismatchSnafu {
            offset: epilogue.offset()
        }
    );

    if let Some(block) = listed.keys().find(|block| !seen.contains(*block)) {
        return ListedBlockNotFreeSnafu {
            offset: block.offset(),
        }
        .fail();
    }
    // Entries left over were never reached while walking the heap.
    if let Some(block) = quick.first() {
        let index = quick_lists
            .index_of(memory.header(*block).size())
            .unwrap_or_default();
        return QuickListMismatchSnafu {
            offset: block.offset(),
            index,
        }
        .fail();
    }
    Ok(())
}

/// Printable description of every block and every non-empty list.
pub struct HeapDump<'a, P> {
    memory: &'a HeapMemory<P>,
    free_lists: &'a FreeLists,
    quick_lists: &'a QuickLists,
}

impl<'a, P> HeapDump<'a, P> {
    pub(crate) fn new(
        memory: &'a HeapMemory<P>,
        free_lists: &'a FreeLists,
        quick_lists: &'a QuickLists,
    ) -> Self {
        Self {
            memory,
            free_lists,
            quick_lists,
        }
    }
}

impl<P> fmt::Display for HeapDump<'_, P>
where
    P: ExtentProvider,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let memory = self.memory;
        if !memory.is_initialized() {
            return writeln!(f, "heap is empty");
        }
        writeln!(
            f,
            "heap {:#x}..{:#x} ({} bytes)",
            memory.start(),
            memory.end(),
            memory.end() - memory.start()
        )?;
        for info in Blocks::new(memory) {
            writeln!(f, "  {:>8} {:>6} {}", info.payload, info.size, info.state)?;
        }

        let limit = (memory.end() - memory.start()) / MIN_BLOCK_SIZE;
        for class in 0..self.free_lists.count() {
            let Some(blocks) = self.free_lists.collect_class(memory, class, limit) else {
                writeln!(f, "free list {class}: corrupted")?;
                continue;
            };
            if blocks.is_empty() {
                continue;
            }
            write!(f, "free list {class}:")?;
            for block in blocks {
                write!(f, " {}", block.payload())?;
            }
            writeln!(f)?;
        }

        for index in 0..self.quick_lists.count() {
            let entries = self.quick_lists.entries(memory, index);
            if entries.is_empty() {
                continue;
            }
            write!(
                f,
                "quick list {index} ({} bytes):",
                QuickLists::block_size(index)
            )?;
            for block in entries {
                write!(f, " {}", block.payload())?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
