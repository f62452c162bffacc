//! Block header encoding.
//!
//! Every block starts with a single header word. The word packs the block
//! size, three status flags and, for allocated blocks, the payload size that
//! the caller asked for:
//!
//! ```text
//!  63                 32 31                4   3   2   1   0
//! ┌─────────────────────┬───────────────────┬───┬───┬───┬───┐
//! │ payload size        │ block size >> 4   │ 0 │ A │ P │ Q │
//! └─────────────────────┴───────────────────┴───┴───┴───┴───┘
//!   A: this block is allocated
//!   P: the previous block is allocated
//!   Q: this block sits in a quick list
//! ```
//!
//! Header words are stored XOR-ed with a magic value. [`Header::encode`] and
//! [`Header::decode`] are the only places that apply the transform.
//!
//! A free block repeats its header in its last word (the footer), which is
//! how the following block finds it when coalescing. Allocated blocks carry
//! no footer; the following block's `P` flag stands in for it.

use bitflags::bitflags;
use platform_cast::{CastFrom as _, CastInto as _};

pub(crate) const WORD_SIZE: usize = 8;
pub(crate) const HEADER_SIZE: usize = WORD_SIZE;

/// Alignment of every block size and every payload offset.
pub const BLOCK_ALIGN: usize = 16;

/// Smallest block the allocator creates: header, two links and a footer.
pub const MIN_BLOCK_SIZE: usize = 32;

const SIZE_MASK: u64 = 0xffff_fff0;
const FLAGS_MASK: u64 = 0xf;
const PAYLOAD_SHIFT: u32 = 32;

/// Largest block size the header can describe.
#[expect(clippy::cast_possible_truncation)]
pub(crate) const MAX_BLOCK_SIZE: usize = SIZE_MASK as usize;

const _: () = assert!(MIN_BLOCK_SIZE == HEADER_SIZE + 3 * WORD_SIZE);
const _: () = assert!(MIN_BLOCK_SIZE.is_multiple_of(BLOCK_ALIGN));

bitflags! {
    /// Status bits kept in the low nibble of a header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct BlockFlags: u64 {
        /// The block is cached in a quick list.
        ///
        /// Quick-listed blocks keep `ALLOCATED` set so that neighbours never
        /// coalesce into them.
        const IN_QUICK_LIST = 1 << 0;

        /// The block immediately before this one is allocated.
        const PREV_ALLOCATED = 1 << 1;

        /// The block holds a live payload.
        const ALLOCATED = 1 << 2;
    }
}

/// Decoded form of a header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    size: usize,
    flags: BlockFlags,
    payload_size: usize,
}

const fn prev_flag(prev_allocated: bool) -> BlockFlags {
    if prev_allocated {
        BlockFlags::PREV_ALLOCATED
    } else {
        BlockFlags::empty()
    }
}

impl Header {
    pub(crate) const fn free(size: usize, prev_allocated: bool) -> Self {
        Self {
            size,
            flags: prev_flag(prev_allocated),
            payload_size: 0,
        }
    }

    pub(crate) const fn allocated(size: usize, payload_size: usize, prev_allocated: bool) -> Self {
        Self {
            size,
            flags: BlockFlags::ALLOCATED.union(prev_flag(prev_allocated)),
            payload_size,
        }
    }

    pub(crate) const fn quick(size: usize, prev_allocated: bool) -> Self {
        Self {
            size,
            flags: BlockFlags::ALLOCATED
                .union(BlockFlags::IN_QUICK_LIST)
                .union(prev_flag(prev_allocated)),
            payload_size: 0,
        }
    }

    /// Header of the zero-sized block that terminates the heap.
    pub(crate) const fn epilogue(prev_allocated: bool) -> Self {
        Self::allocated(0, 0, prev_allocated)
    }

    pub(crate) const fn size(&self) -> usize {
        self.size
    }

    pub(crate) const fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub(crate) const fn is_allocated(&self) -> bool {
        self.flags.contains(BlockFlags::ALLOCATED)
    }

    pub(crate) const fn is_prev_allocated(&self) -> bool {
        self.flags.contains(BlockFlags::PREV_ALLOCATED)
    }

    pub(crate) const fn is_quick_listed(&self) -> bool {
        self.flags.contains(BlockFlags::IN_QUICK_LIST)
    }

    /// Returns `true` if bits outside the known flags are set.
    pub(crate) const fn has_reserved_bits(&self) -> bool {
        !BlockFlags::all().contains(self.flags)
    }

    #[must_use]
    pub(crate) const fn with_prev_allocated(self, prev_allocated: bool) -> Self {
        Self {
            flags: self
                .flags
                .difference(BlockFlags::PREV_ALLOCATED)
                .union(prev_flag(prev_allocated)),
            ..self
        }
    }

    pub(crate) fn encode(self, magic: u64) -> u64 {
        debug_assert!(self.size <= MAX_BLOCK_SIZE && self.size.is_multiple_of(BLOCK_ALIGN));
        debug_assert!(u32::try_from(self.payload_size).is_ok());
        let word = (u64::cast_from(self.payload_size) << PAYLOAD_SHIFT)
            | (u64::cast_from(self.size) & SIZE_MASK)
            | self.flags.bits();
        word ^ magic
    }

    pub(crate) fn decode(word: u64, magic: u64) -> Self {
        let word = word ^ magic;
        Self {
            size: (word & SIZE_MASK).cast_into(),
            flags: BlockFlags::from_bits_retain(word & FLAGS_MASK),
            payload_size: (word >> PAYLOAD_SHIFT).cast_into(),
        }
    }
}

/// Offset of a block's header word inside the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockRef(usize);

impl BlockRef {
    pub(crate) const fn new(offset: usize) -> Self {
        Self(offset)
    }

    pub(crate) const fn offset(self) -> usize {
        self.0
    }

    /// Returns the block whose payload starts at `payload`.
    pub(crate) const fn from_payload(payload: Payload) -> Option<Self> {
        match payload.0.checked_sub(HEADER_SIZE) {
            Some(offset) => Some(Self(offset)),
            None => None,
        }
    }

    pub(crate) const fn payload(self) -> Payload {
        Payload(self.0 + HEADER_SIZE)
    }

    /// Returns the block that follows this one, given this block's size.
    pub(crate) const fn next(self, size: usize) -> Self {
        Self(self.0 + size)
    }

    /// Offset of the footer word of a free block of `size` bytes.
    pub(crate) const fn footer(self, size: usize) -> usize {
        self.0 + size - WORD_SIZE
    }

    /// Offset of the previous block's footer.
    pub(crate) const fn prev_footer(self) -> usize {
        self.0 - WORD_SIZE
    }

    /// Offset of the forward link of a free or quick-listed block.
    pub(crate) const fn next_link(self) -> usize {
        self.0 + WORD_SIZE
    }

    /// Offset of the backward link of a free block.
    pub(crate) const fn prev_link(self) -> usize {
        self.0 + 2 * WORD_SIZE
    }
}

/// Handle to an allocated payload, expressed as an offset into the heap.
///
/// Payload offsets are always multiples of [`BLOCK_ALIGN`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
#[display("{_0:#x}")]
pub struct Payload(usize);

impl Payload {
    /// Wraps a raw offset.
    ///
    /// Any value is accepted; the heap validates payloads when they are
    /// handed back to it.
    #[must_use]
    pub const fn from_offset(offset: usize) -> Self {
        Self(offset)
    }

    /// The raw offset of the payload inside the heap memory.
    #[must_use]
    pub const fn offset(self) -> usize {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: u64 = 0x5a5a_c3c3_0f0f_a5a5;

    #[test]
    fn test_encode_decode() {
        let headers = [
            Header::free(32, true),
            Header::free(4096, false),
            Header::allocated(48, 37, true),
            Header::allocated(MAX_BLOCK_SIZE, u32::MAX as usize, false),
            Header::quick(64, true),
            Header::epilogue(false),
        ];
        for header in headers {
            assert_eq!(Header::decode(header.encode(MAGIC), MAGIC), header);
            assert_eq!(Header::decode(header.encode(0), 0), header);
        }
    }

    #[test]
    fn test_bit_layout() {
        let header = Header::allocated(0x40, 0x31, true);
        assert_eq!(header.encode(0), (0x31 << 32) | 0x40 | 0b110);

        let header = Header::quick(0x20, false);
        assert_eq!(header.encode(0), 0x20 | 0b101);
    }

    #[test]
    fn test_magic_is_applied() {
        let header = Header::free(32, true);
        assert_eq!(header.encode(MAGIC), header.encode(0) ^ MAGIC);
        assert_ne!(Header::decode(header.encode(0), MAGIC), header);
    }

    #[test]
    fn test_flags() {
        let header = Header::free(64, true);
        assert!(!header.is_allocated());
        assert!(header.is_prev_allocated());
        assert!(!header.is_quick_listed());

        let header = header.with_prev_allocated(false);
        assert!(!header.is_prev_allocated());
        assert_eq!(header.size(), 64);

        let header = Header::quick(48, false).with_prev_allocated(true);
        assert!(header.is_allocated());
        assert!(header.is_quick_listed());
        assert!(header.is_prev_allocated());
        assert_eq!(header.payload_size(), 0);
    }

    #[test]
    fn test_reserved_bits() {
        assert!(!Header::decode(0x8 ^ MAGIC, MAGIC).is_allocated());
        assert!(Header::decode(0x8 ^ MAGIC, MAGIC).has_reserved_bits());
        assert!(!Header::allocated(32, 1, true).has_reserved_bits());
    }

    #[test]
    fn test_block_navigation() {
        let block = BlockRef::new(0x28);
        assert_eq!(block.payload(), Payload::from_offset(0x30));
        assert_eq!(BlockRef::from_payload(block.payload()), Some(block));
        assert_eq!(BlockRef::from_payload(Payload::from_offset(4)), None);
        assert_eq!(block.next(0x40), BlockRef::new(0x68));
        assert_eq!(block.footer(0x40), 0x60);
        assert_eq!(block.prev_footer(), 0x20);
        assert_eq!(block.next_link(), 0x30);
        assert_eq!(block.prev_link(), 0x38);
    }

    #[test]
    fn test_payload_display() {
        assert_eq!(alloc::format!("{}", Payload::from_offset(0x30)), "0x30");
    }
}
