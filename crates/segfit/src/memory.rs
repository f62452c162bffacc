//! Word-level access to heap memory.

use core::ops::Range;

use crate::{
    block::{BLOCK_ALIGN, BlockRef, Header, WORD_SIZE},
    extent::{ExtentError, ExtentProvider},
};

/// The heap's view of its [`ExtentProvider`].
///
/// All header reads and writes go through [`header`](Self::header) and
/// [`set_header`](Self::set_header) so the magic transform is applied in one
/// place. Every access is bounds-checked against the provider's bytes.
///
/// Extents obtained from the provider are pending until they are committed
/// into the heap layout; `end()` is the end of the committed part.
#[derive(Debug)]
pub(crate) struct HeapMemory<P> {
    provider: P,
    magic: u64,
    committed: usize,
}

impl<P> HeapMemory<P>
where
    P: ExtentProvider,
{
    pub(crate) const fn new(provider: P, magic: u64) -> Self {
        Self {
            provider,
            magic,
            committed: 0,
        }
    }

    pub(crate) const fn provider(&self) -> &P {
        &self.provider
    }

    pub(crate) fn into_provider(self) -> P {
        self.provider
    }

    pub(crate) fn start(&self) -> usize {
        self.provider.heap_start()
    }

    pub(crate) fn end(&self) -> usize {
        self.start() + self.committed
    }

    /// End of the memory obtained from the provider, committed or not.
    pub(crate) fn provider_end(&self) -> usize {
        self.provider.heap_end()
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.committed != 0
    }

    /// Obtained bytes past `end()` that can be committed, in whole
    /// alignment units.
    pub(crate) fn pending(&self) -> usize {
        let pending = self.provider_end() - self.end();
        pending - pending % BLOCK_ALIGN
    }

    /// Extends the committed part over every pending byte and returns the
    /// new end.
    pub(crate) fn commit(&mut self) -> usize {
        self.committed += self.pending();
        self.end()
    }

    pub(crate) fn grow_one_extent(&mut self) -> Result<usize, ExtentError> {
        let end = self.provider_end();
        let start = self.provider.grow_one_extent()?;
        assert_eq!(start, end, "extents must be contiguous");
        Ok(start)
    }

    pub(crate) fn word(&self, offset: usize) -> u64 {
        let Some(bytes) = self
            .provider
            .memory()
            .get(offset..)
            .and_then(<[u8]>::first_chunk::<WORD_SIZE>)
        else {
            panic!("heap word {offset:#x} is out of bounds");
        };
        u64::from_ne_bytes(*bytes)
    }

    pub(crate) fn set_word(&mut self, offset: usize, value: u64) {
        let Some(bytes) = self
            .provider
            .memory_mut()
            .get_mut(offset..)
            .and_then(<[u8]>::first_chunk_mut::<WORD_SIZE>)
        else {
            panic!("heap word {offset:#x} is out of bounds");
        };
        *bytes = value.to_ne_bytes();
    }

    pub(crate) fn header(&self, block: BlockRef) -> Header {
        Header::decode(self.word(block.offset()), self.magic)
    }

    pub(crate) fn set_header(&mut self, block: BlockRef, header: Header) {
        self.set_word(block.offset(), header.encode(self.magic));
    }

    /// Writes `header`, mirroring it into the footer if the block is free.
    pub(crate) fn write_block(&mut self, block: BlockRef, header: Header) {
        let word = header.encode(self.magic);
        self.set_word(block.offset(), word);
        if !header.is_allocated() {
            self.set_word(block.footer(header.size()), word);
        }
    }

    /// Raw footer word stored just before `block`.
    pub(crate) fn footer_word_before(&self, block: BlockRef) -> u64 {
        self.word(block.prev_footer())
    }

    pub(crate) fn footer_before(&self, block: BlockRef) -> Header {
        Header::decode(self.footer_word_before(block), self.magic)
    }

    /// Returns the block before `block`.
    ///
    /// Only meaningful when that block is free, since allocated blocks
    /// leave no footer behind.
    pub(crate) fn prev_block(&self, block: BlockRef) -> BlockRef {
        let footer = self.footer_before(block);
        debug_assert!(!footer.is_allocated(), "previous block has no footer");
        BlockRef::new(block.offset() - footer.size())
    }

    pub(crate) fn set_prev_allocated(&mut self, block: BlockRef, prev_allocated: bool) {
        let header = self.header(block).with_prev_allocated(prev_allocated);
        self.write_block(block, header);
    }

    pub(crate) fn encode(&self, header: Header) -> u64 {
        header.encode(self.magic)
    }

    pub(crate) fn bytes(&self, range: Range<usize>) -> &[u8] {
        &self.provider.memory()[range]
    }

    pub(crate) fn bytes_mut(&mut self, range: Range<usize>) -> &mut [u8] {
        &mut self.provider.memory_mut()[range]
    }

    pub(crate) fn copy_within(&mut self, src: Range<usize>, dest: usize) {
        self.provider.memory_mut().copy_within(src, dest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::PageArena;

    const MAGIC: u64 = 0x1234_5678_9abc_def0;

    fn memory() -> HeapMemory<PageArena> {
        let mut memory = HeapMemory::new(PageArena::new(256, 1), MAGIC);
        memory.grow_one_extent().unwrap();
        memory.commit();
        memory
    }

    #[test]
    fn test_commit_pending_extents() {
        let mut memory = HeapMemory::new(PageArena::new(128, 2), MAGIC);
        assert!(!memory.is_initialized());
        assert_eq!(memory.pending(), 0);

        memory.grow_one_extent().unwrap();
        assert!(!memory.is_initialized());
        assert_eq!(memory.pending(), 128);
        assert_eq!(memory.commit(), 128);
        assert!(memory.is_initialized());
        assert_eq!(memory.pending(), 0);

        assert_eq!(memory.grow_one_extent().unwrap(), 128);
        assert_eq!(memory.end(), 128);
        assert_eq!(memory.provider_end(), 256);
        assert_eq!(memory.commit(), 256);
    }

    #[test]
    fn test_word_access() {
        let mut memory = memory();
        memory.set_word(0x10, 0xdead_beef);
        assert_eq!(memory.word(0x10), 0xdead_beef);
        assert_eq!(memory.word(0x18), 0);
        memory.set_word(256 - WORD_SIZE, u64::MAX);
        assert_eq!(memory.word(256 - WORD_SIZE), u64::MAX);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_word_out_of_bounds() {
        let memory = memory();
        let _ = memory.word(256 - WORD_SIZE + 1);
    }

    #[test]
    fn test_headers_are_transformed() {
        let mut memory = memory();
        let block = BlockRef::new(0x28);
        let header = Header::allocated(0x40, 0x30, true);
        memory.set_header(block, header);
        assert_eq!(memory.header(block), header);
        assert_eq!(memory.word(0x28), header.encode(0) ^ MAGIC);
    }

    #[test]
    fn test_free_blocks_get_footers() {
        let mut memory = memory();
        let block = BlockRef::new(0x28);
        memory.write_block(block, Header::free(0x40, true));
        let next = block.next(0x40);
        assert_eq!(memory.footer_before(next), Header::free(0x40, true));
        assert_eq!(memory.prev_block(next), block);

        memory.set_prev_allocated(block, false);
        assert_eq!(memory.footer_before(next), Header::free(0x40, false));

        let untouched = memory.word(block.footer(0x20));
        memory.write_block(block, Header::allocated(0x20, 8, false));
        assert_eq!(memory.word(block.footer(0x20)), untouched);
    }

    #[test]
    fn test_copy_within() {
        let mut memory = memory();
        memory.bytes_mut(0x30..0x34).copy_from_slice(&[1, 2, 3, 4]);
        memory.copy_within(0x30..0x34, 0x80);
        assert_eq!(memory.bytes(0x80..0x84), &[1, 2, 3, 4]);
    }
}
