//! A segregated-fits heap allocator with quick lists.
//!
//! The heap manages the memory of an [`ExtentProvider`], which hands out
//! extents that are appended to the end of the heap. Allocated
//! payloads are identified by [`Payload`] offsets into that memory. The crate
//! is `no_std` compatible and only needs `alloc` for its bookkeeping vectors.
//!
//! # Block Layout
//!
//! Every block starts with a one-word header holding the block size, the
//! requested payload size and three flags (allocated, previous block
//! allocated, quick-listed). Headers are stored XOR-ed with a configurable
//! magic value, so stray writes are likely to be caught when the block is
//! next validated. Free blocks also carry a copy of the header in their last
//! word, which lets a block find its predecessor during coalescing.
//! Allocated blocks carry no footer.
//!
//! The heap is bracketed by an allocated prologue block and a zero-sized
//! allocated epilogue header, so coalescing never has to special-case the
//! heap boundaries.
//!
//! # Allocation Strategy
//!
//! ## Quick Lists
//!
//! Small blocks of a few exact sizes are cached on release in per-size LIFO
//! lists and handed back out without splitting or coalescing. Cached blocks
//! stay marked allocated. When a list overflows it is flushed: every cached
//! block is freed and coalesced before the new block is cached.
//!
//! **Performance**: O(1) allocation and release.
//!
//! ## Segregated Free Lists
//!
//! Free blocks live in circular doubly-linked lists, one per power-of-two
//! size class. Allocation searches upward from the request's class and takes
//! the first fitting block, splitting off the tail when it can stand as a
//! block of its own. Released blocks are coalesced immediately with free
//! neighbors.
//!
//! **Performance**: O(n) allocation where n is the number of free blocks
//! searched, O(1) release.
//!
//! # Usage Examples
//!
//! ```rust
//! use segfit::{Heap, HeapConfig, PageArena};
//!
//! let config = HeapConfig::DEFAULT.with_quick_lists(8, 4);
//! let mut heap = Heap::with_config(PageArena::new(4096, 16), config)?;
//!
//! let p = heap.allocate(100)?.expect("non-zero request");
//! heap.payload_mut(p)?.fill(0xab);
//!
//! let stats = heap.stats();
//! assert_eq!(stats.allocated_blocks, 1);
//! assert_eq!(stats.live_payload, 100);
//!
//! heap.release(p)?;
//! heap.check_consistency()?;
//! # Ok::<(), Box<dyn core::error::Error>>(())
//! ```
//!
//! # Errors
//!
//! Running out of memory and oversized requests are recoverable. Contract
//! violations, such as releasing a payload twice, are fatal: the heap is
//! poisoned and refuses every later operation. [`error::abort_on_fatal`]
//! turns fatal errors into a panic carrying a full error report.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub use self::{
    block::{BLOCK_ALIGN, MIN_BLOCK_SIZE, Payload},
    config::HeapConfig,
    error::{AllocError, ContractViolation},
    extent::{ExtentError, ExtentProvider, PageArena},
    heap::Heap,
    inspect::{BlockInfo, BlockState, Blocks, HeapDump, HeapStats},
};

mod block;
pub mod config;
pub mod error;
pub mod extent;
mod free_list;
mod heap;
mod inspect;
mod memory;
mod quick_list;
