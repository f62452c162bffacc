use core::cmp;

use log::{debug, error, trace, warn};
use snafu::{IntoError as _, OptionExt as _, ResultExt as _, ensure};

use crate::{
    block::{BLOCK_ALIGN, BlockRef, HEADER_SIZE, Header, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, Payload},
    config::{ConfigError, HeapConfig},
    error::{
        AllocError, AlreadyQuickListedSnafu, ContractViolation, ContractViolationSnafu,
        CorruptHeaderSnafu, InvalidBlockSizeSnafu, MisalignedPointerSnafu, NotAllocatedSnafu,
        NullPointerSnafu, OutOfMemorySnafu, OutsideHeapSnafu, PayloadTooLargeSnafu,
        PoisonedSnafu, PrevAllocatedMismatchSnafu, SizeOverflowSnafu, UninitializedHeapSnafu,
    },
    extent::{ExtentError, ExtentProvider, HeapLimitSnafu, PageArena},
    free_list::FreeLists,
    inspect::{
        self, BlockInfo, BlockState, Blocks, Bounds, HeapDump, HeapStats, SENTINEL_OVERHEAD,
    },
    memory::HeapMemory,
    quick_list::QuickLists,
};

/// Smallest heap that holds the sentinels and one block.
const MIN_HEAP_SIZE: usize = SENTINEL_OVERHEAD + MIN_BLOCK_SIZE;

/// Largest heap whose free blocks all fit the header's size field.
const MAX_HEAP_SIZE: usize = MAX_BLOCK_SIZE.saturating_add(SENTINEL_OVERHEAD);

/// Running payload accounting, kept incrementally so the utilization
/// queries never walk the heap.
#[derive(Debug, Clone, Copy, Default)]
struct Usage {
    live_payload: usize,
    live_block_bytes: usize,
    peak_payload: usize,
}

impl Usage {
    fn allocated(&mut self, payload_size: usize, block_size: usize) {
        self.live_payload += payload_size;
        self.live_block_bytes += block_size;
        self.peak_payload = cmp::max(self.peak_payload, self.live_payload);
    }

    fn released(&mut self, payload_size: usize, block_size: usize) {
        self.live_payload -= payload_size;
        self.live_block_bytes -= block_size;
    }
}

/// A segregated-fits heap over the memory of an [`ExtentProvider`].
///
/// Payloads are handed out as [`Payload`] offsets into the provider's
/// memory and are always aligned to [`BLOCK_ALIGN`] bytes. The heap is laid
/// out lazily on the first allocation.
///
/// Misuse (releasing a payload twice, passing an offset the heap never
/// handed out, or finding a corrupted header) is reported as a fatal
/// [`AllocError::ContractViolation`]. A violation found by
/// [`release`](Self::release), [`resize`](Self::resize) or
/// [`payload_mut`](Self::payload_mut) poisons the heap, and every further
/// operation fails with [`AllocError::Poisoned`]. The read-only
/// [`payload`](Self::payload) reports violations without poisoning.
///
/// # Examples
///
/// ```
/// use segfit::Heap;
///
/// let mut heap = Heap::default();
/// let p = heap.allocate(40)?.unwrap();
/// heap.payload_mut(p)?.copy_from_slice(&[7; 40]);
///
/// let q = heap.resize(p, 100)?.unwrap();
/// assert_eq!(heap.payload(q)?[..40], [7; 40]);
///
/// heap.release(q)?;
/// assert_eq!(heap.utilization(), 0.0);
/// # Ok::<(), segfit::AllocError>(())
/// ```
#[derive(Debug)]
pub struct Heap<P = PageArena> {
    memory: HeapMemory<P>,
    free_lists: FreeLists,
    quick_lists: QuickLists,
    config: HeapConfig,
    usage: Usage,
    poisoned: bool,
}

impl Default for Heap<PageArena> {
    fn default() -> Self {
        Self::new(PageArena::default())
    }
}

fn check_heap_size(size: usize) -> Result<(), ExtentError> {
    ensure!(
        size <= MAX_HEAP_SIZE,
        HeapLimitSnafu {
            limit: MAX_HEAP_SIZE
        }
    );
    Ok(())
}

/// Effective block size for a request of `size` payload bytes.
fn block_size_for(size: usize) -> Result<usize, AllocError> {
    size.checked_add(HEADER_SIZE)
        .and_then(|bytes| bytes.checked_next_multiple_of(BLOCK_ALIGN))
        .map(|bytes| cmp::max(bytes, MIN_BLOCK_SIZE))
        .filter(|&bytes| bytes <= MAX_BLOCK_SIZE)
        .context(SizeOverflowSnafu { size })
}

impl<P> Heap<P>
where
    P: ExtentProvider,
{
    /// Creates a heap with the default configuration.
    ///
    /// # Panics
    ///
    /// Panics if `provider` has already handed out memory.
    pub fn new(provider: P) -> Self {
        Self::build(provider, HeapConfig::DEFAULT)
    }

    /// Creates a heap with a custom configuration.
    ///
    /// # Panics
    ///
    /// Panics if `provider` has already handed out memory.
    pub fn with_config(provider: P, config: HeapConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(provider, config))
    }

    fn build(provider: P, config: HeapConfig) -> Self {
        let memory = HeapMemory::new(provider, config.magic);
        assert_eq!(
            memory.provider_end(),
            memory.start(),
            "extent provider must start out empty"
        );
        Self {
            memory,
            free_lists: FreeLists::new(config.free_lists),
            quick_lists: QuickLists::new(config.quick_lists, config.quick_list_capacity),
            config,
            usage: Usage::default(),
            poisoned: false,
        }
    }

    /// The configuration the heap was built with.
    #[must_use]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// The extent provider backing the heap.
    #[must_use]
    pub fn provider(&self) -> &P {
        self.memory.provider()
    }

    /// Tears the heap down and returns its provider, memory included.
    pub fn into_provider(self) -> P {
        self.memory.into_provider()
    }

    /// Returns `true` once a contract violation has been detected.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Bytes covered by the heap layout, sentinels included.
    #[must_use]
    pub fn heap_size(&self) -> usize {
        self.memory.end() - self.memory.start()
    }

    fn ensure_usable(&self) -> Result<(), AllocError> {
        ensure!(!self.poisoned, PoisonedSnafu);
        Ok(())
    }

    /// Allocates a block with room for at least `size` payload bytes.
    ///
    /// Returns `Ok(None)` for a zero-sized request. Running out of memory
    /// and oversized requests are recoverable; the heap stays usable.
    pub fn allocate(&mut self, size: usize) -> Result<Option<Payload>, AllocError> {
        self.ensure_usable()?;
        if size == 0 {
            return Ok(None);
        }
        self.allocate_block(size).map(Some)
    }

    fn allocate_block(&mut self, size: usize) -> Result<Payload, AllocError> {
        let block_size = block_size_for(size)?;
        if !self.memory.is_initialized() {
            self.init()?;
        }

        let block = if let Some(block) = self.quick_lists.pop(&self.memory, block_size) {
            let header = self.memory.header(block);
            self.memory.set_header(
                block,
                Header::allocated(block_size, size, header.is_prev_allocated()),
            );
            block
        } else {
            let block = self.find_or_grow(block_size)?;
            self.place(block, block_size, size);
            block
        };

        let block_size = self.memory.header(block).size();
        self.usage.allocated(size, block_size);
        trace!(
            "allocated {size} bytes at {} ({block_size} byte block)",
            block.payload()
        );
        Ok(block.payload())
    }

    /// Lays out the prologue, one free block and the epilogue over the
    /// first extent.
    fn init(&mut self) -> Result<(), AllocError> {
        assert!(
            self.memory.start().is_multiple_of(BLOCK_ALIGN),
            "heap start must be aligned to {BLOCK_ALIGN} bytes"
        );
        self.obtain(MIN_HEAP_SIZE)?;
        self.memory.commit();

        let Bounds {
            prologue,
            first,
            epilogue,
        } = Bounds::of(&self.memory);
        self.memory
            .set_header(prologue, Header::allocated(MIN_BLOCK_SIZE, 0, true));
        self.memory
            .write_block(first, Header::free(epilogue.offset() - first.offset(), true));
        self.memory.set_header(epilogue, Header::epilogue(false));
        FreeLists::clear_links(&mut self.memory, first);
        self.free_lists.insert(&mut self.memory, first);

        debug!(
            "initialized heap at {:#x}..{:#x}",
            self.memory.start(),
            self.memory.end()
        );
        Ok(())
    }

    /// Adds one extent at the end of the heap, merged with a free tail.
    fn grow(&mut self) -> Result<(), AllocError> {
        let old_epilogue = Bounds::of(&self.memory).epilogue;
        let prev_allocated = self.memory.header(old_epilogue).is_prev_allocated();
        self.obtain(MIN_BLOCK_SIZE)?;
        self.memory.commit();

        let new_epilogue = Bounds::of(&self.memory).epilogue;
        self.memory
            .set_header(new_epilogue, Header::epilogue(false));
        let size = new_epilogue.offset() - old_epilogue.offset();
        self.memory
            .write_block(old_epilogue, Header::free(size, prev_allocated));
        FreeLists::clear_links(&mut self.memory, old_epilogue);
        let block = self.coalesce(old_epilogue);

        debug!(
            "grew heap to {:#x}..{:#x}, tail block {} is {} bytes",
            self.memory.start(),
            self.memory.end(),
            block.payload(),
            self.memory.header(block).size()
        );
        Ok(())
    }

    /// Asks the provider for extents until at least `bytes` can be
    /// committed past the end of the heap.
    ///
    /// Nothing is committed here. Extents obtained before a failure stay
    /// pending and count toward the next attempt.
    fn obtain(&mut self, bytes: usize) -> Result<(), AllocError> {
        while self.memory.pending() < bytes {
            self.memory
                .grow_one_extent()
                .inspect_err(|err| warn!("failed to grow heap: {err}"))
                .context(OutOfMemorySnafu)?;
        }
        let size = self.memory.end() + self.memory.pending() - self.memory.start();
        check_heap_size(size)
            .inspect_err(|err| warn!("refusing to grow heap: {err}"))
            .context(OutOfMemorySnafu)
    }

    fn find_or_grow(&mut self, block_size: usize) -> Result<BlockRef, AllocError> {
        loop {
            if let Some(block) = self.free_lists.find_fit(&mut self.memory, block_size) {
                return Ok(block);
            }
            self.grow()?;
        }
    }

    /// Marks the unlinked free `block` allocated, splitting off the tail
    /// when it can form a block of its own.
    fn place(&mut self, block: BlockRef, block_size: usize, payload_size: usize) {
        let header = self.memory.header(block);
        if header.size() - block_size >= MIN_BLOCK_SIZE {
            self.split(block, block_size, payload_size);
            return;
        }
        self.memory.set_header(
            block,
            Header::allocated(header.size(), payload_size, header.is_prev_allocated()),
        );
        self.memory
            .set_prev_allocated(block.next(header.size()), true);
    }

    /// Shrinks `block` to `block_size` bytes and frees the rest.
    fn split(&mut self, block: BlockRef, block_size: usize, payload_size: usize) {
        let header = self.memory.header(block);
        let rest_size = header.size() - block_size;
        debug_assert!(rest_size >= MIN_BLOCK_SIZE);

        self.memory.set_header(
            block,
            Header::allocated(block_size, payload_size, header.is_prev_allocated()),
        );
        let rest = block.next(block_size);
        self.memory.write_block(rest, Header::free(rest_size, true));
        FreeLists::clear_links(&mut self.memory, rest);
        self.coalesce(rest);
    }

    /// Merges the unlinked free `block` with its free neighbors and links
    /// the result into its free list.
    fn coalesce(&mut self, block: BlockRef) -> BlockRef {
        let header = self.memory.header(block);
        let mut start = block;
        let mut size = header.size();
        let mut prev_allocated = header.is_prev_allocated();

        let next = block.next(size);
        let next_header = self.memory.header(next);
        if !next_header.is_allocated() {
            self.free_lists.remove(&mut self.memory, next);
            size += next_header.size();
        }

        if !prev_allocated {
            let prev = self.memory.prev_block(block);
            let prev_header = self.memory.header(prev);
            self.free_lists.remove(&mut self.memory, prev);
            start = prev;
            size += prev_header.size();
            prev_allocated = prev_header.is_prev_allocated();
        }

        self.memory
            .write_block(start, Header::free(size, prev_allocated));
        FreeLists::clear_links(&mut self.memory, start);
        self.memory.set_prev_allocated(start.next(size), false);
        self.free_lists.insert(&mut self.memory, start);
        start
    }

    /// Returns a payload to the heap.
    ///
    /// Small blocks are cached in their quick list; everything else is
    /// coalesced immediately.
    pub fn release(&mut self, payload: Payload) -> Result<(), AllocError> {
        let block = self.validate(payload)?;
        self.release_block(block);
        trace!("released {payload}");
        Ok(())
    }

    fn release_block(&mut self, block: BlockRef) {
        let header = self.memory.header(block);
        self.usage.released(header.payload_size(), header.size());
        if let Some(index) = self.quick_lists.index_of(header.size()) {
            self.cache(block, index);
            return;
        }
        self.memory
            .write_block(block, Header::free(header.size(), header.is_prev_allocated()));
        FreeLists::clear_links(&mut self.memory, block);
        self.coalesce(block);
    }

    fn cache(&mut self, block: BlockRef, index: usize) {
        let header = self.memory.header(block);
        self.memory
            .set_header(block, Header::quick(header.size(), header.is_prev_allocated()));
        if self.quick_lists.is_full(index) {
            self.flush_quick_list(index);
        }
        self.quick_lists.push(&mut self.memory, index, block);
    }

    /// Moves every entry of quick list `index` back into the free lists.
    fn flush_quick_list(&mut self, index: usize) {
        let detached = self.quick_lists.detach(index);
        debug!(
            "flushing {} blocks of {} bytes from quick list {index}",
            detached.len,
            QuickLists::block_size(index)
        );
        let mut cursor = detached.first;
        for _ in 0..detached.len {
            let Some(block) = cursor else {
                break;
            };
            cursor = QuickLists::next_entry(&self.memory, block);

            let header = self.memory.header(block);
            self.memory
                .write_block(block, Header::free(header.size(), header.is_prev_allocated()));
            FreeLists::clear_links(&mut self.memory, block);
            self.coalesce(block);
        }
    }

    /// Changes the payload size of an allocated block.
    ///
    /// A size of zero releases the block and returns `Ok(None)`. Growing
    /// moves the payload to a new block, copying the old contents, and
    /// leaves `payload` untouched if no memory is available. Shrinking
    /// happens in place.
    pub fn resize(
        &mut self,
        payload: Payload,
        new_size: usize,
    ) -> Result<Option<Payload>, AllocError> {
        if new_size == 0 {
            self.release(payload)?;
            return Ok(None);
        }
        let block = self.validate(payload)?;
        let block_size = block_size_for(new_size)?;
        let header = self.memory.header(block);

        if block_size > header.size() {
            let moved = self.allocate_block(new_size)?;
            let len = cmp::min(header.payload_size(), new_size);
            self.memory
                .copy_within(payload.offset()..payload.offset() + len, moved.offset());
            self.release_block(block);
            trace!("moved {payload} to {moved} for {new_size} bytes");
            return Ok(Some(moved));
        }

        self.usage.released(header.payload_size(), header.size());
        if header.size() - block_size < MIN_BLOCK_SIZE {
            self.memory.set_header(
                block,
                Header::allocated(header.size(), new_size, header.is_prev_allocated()),
            );
        } else {
            self.split(block, block_size, new_size);
        }
        let block_size = self.memory.header(block).size();
        self.usage.allocated(new_size, block_size);
        trace!("resized {payload} in place to {new_size} bytes");
        Ok(Some(payload))
    }

    /// Checks `payload` and poisons the heap if it breaks the contract.
    fn validate(&mut self, payload: Payload) -> Result<BlockRef, AllocError> {
        self.ensure_usable()?;
        match self.check_payload(payload) {
            Ok(block) => Ok(block),
            Err(violation) => {
                error!("rejected payload {payload}: {violation}");
                self.poisoned = true;
                Err(ContractViolationSnafu.into_error(violation))
            }
        }
    }

    fn check_payload(&self, payload: Payload) -> Result<BlockRef, ContractViolation> {
        let offset = payload.offset();
        ensure!(offset != 0, NullPointerSnafu);
        ensure!(
            offset.is_multiple_of(BLOCK_ALIGN),
            MisalignedPointerSnafu { offset }
        );
        ensure!(self.memory.is_initialized(), UninitializedHeapSnafu);

        let Bounds {
            first, epilogue, ..
        } = Bounds::of(&self.memory);
        let block = BlockRef::from_payload(payload)
            .filter(|block| {
                *block >= first
                    && epilogue
                        .offset()
                        .checked_sub(MIN_BLOCK_SIZE)
                        .is_some_and(|last| block.offset() <= last)
            })
            .context(OutsideHeapSnafu {
                offset,
                start: first.payload().offset(),
                end: epilogue.offset(),
            })?;

        let at = block.offset();
        let header = self.memory.header(block);
        let size = header.size();
        ensure!(
            !header.has_reserved_bits(),
            CorruptHeaderSnafu { offset: at }
        );
        ensure!(
            size >= MIN_BLOCK_SIZE && size <= epilogue.offset() - at,
            InvalidBlockSizeSnafu { offset: at, size }
        );
        ensure!(header.is_allocated(), NotAllocatedSnafu { offset: at });
        ensure!(
            !header.is_quick_listed(),
            AlreadyQuickListedSnafu { offset: at }
        );
        ensure!(
            header.payload_size() + HEADER_SIZE <= size,
            PayloadTooLargeSnafu {
                offset: at,
                payload: header.payload_size(),
                size
            }
        );

        if !header.is_prev_allocated() {
            let footer = self.memory.footer_before(block);
            let prev_size = footer.size();
            let plausible = !footer.is_allocated()
                && !footer.has_reserved_bits()
                && prev_size >= MIN_BLOCK_SIZE
                && prev_size <= at - first.offset();
            ensure!(
                plausible && !self.memory.header(BlockRef::new(at - prev_size)).is_allocated(),
                PrevAllocatedMismatchSnafu { offset: at }
            );
        }
        let next = block.next(size);
        ensure!(
            self.memory.header(next).is_prev_allocated(),
            PrevAllocatedMismatchSnafu {
                offset: next.offset()
            }
        );
        Ok(block)
    }

    /// The payload bytes of an allocated block, exactly as many as were
    /// requested.
    ///
    /// An invalid `payload` is reported as a contract violation but leaves
    /// the heap usable, since nothing was modified.
    pub fn payload(&self, payload: Payload) -> Result<&[u8], AllocError> {
        self.ensure_usable()?;
        let block = self
            .check_payload(payload)
            .context(ContractViolationSnafu)?;
        let len = self.memory.header(block).payload_size();
        Ok(self.memory.bytes(payload.offset()..payload.offset() + len))
    }

    /// Mutable access to the payload bytes of an allocated block.
    pub fn payload_mut(&mut self, payload: Payload) -> Result<&mut [u8], AllocError> {
        let block = self.validate(payload)?;
        let len = self.memory.header(block).payload_size();
        Ok(self
            .memory
            .bytes_mut(payload.offset()..payload.offset() + len))
    }

    /// Live payload bytes over the bytes of the blocks holding them.
    ///
    /// Returns `0.0` when nothing is allocated.
    #[must_use]
    #[expect(clippy::cast_precision_loss)]
    pub fn utilization(&self) -> f64 {
        if self.usage.live_block_bytes == 0 {
            return 0.0;
        }
        self.usage.live_payload as f64 / self.usage.live_block_bytes as f64
    }

    /// Highest live payload ever observed over the current heap size.
    ///
    /// Returns `0.0` before the heap is initialized.
    #[must_use]
    #[expect(clippy::cast_precision_loss)]
    pub fn peak_utilization(&self) -> f64 {
        let heap_size = self.heap_size();
        if heap_size == 0 {
            return 0.0;
        }
        self.usage.peak_payload as f64 / heap_size as f64
    }

    /// Walks every block in address order.
    #[must_use]
    pub fn blocks(&self) -> Blocks<'_, P> {
        Blocks::new(&self.memory)
    }

    /// Takes a snapshot of block counts and payload totals.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            heap_size: self.heap_size(),
            live_payload: self.usage.live_payload,
            peak_payload: self.usage.peak_payload,
            ..HeapStats::default()
        };
        for BlockInfo { size, state, .. } in self.blocks() {
            match state {
                BlockState::Free => {
                    stats.free_blocks += 1;
                    stats.free_bytes += size;
                }
                BlockState::Allocated { .. } => stats.allocated_blocks += 1,
                BlockState::QuickListed => stats.quick_blocks += 1,
            }
        }
        stats
    }

    /// Verifies every structural invariant of the heap.
    ///
    /// Meant for tests and debugging; the cost is linear in the number of
    /// blocks.
    pub fn check_consistency(&self) -> Result<(), ContractViolation> {
        inspect::check_consistency(&self.memory, &self.free_lists, &self.quick_lists)
    }

    /// Returns a printable description of the heap.
    #[must_use]
    pub fn dump(&self) -> HeapDump<'_, P> {
        HeapDump::new(&self.memory, &self.free_lists, &self.quick_lists)
    }
}
