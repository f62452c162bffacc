//! Sources of raw heap memory.
//!
//! The heap never obtains memory on its own. It asks an [`ExtentProvider`]
//! for one more extent whenever its free lists cannot satisfy a request, and
//! it reads and writes heap words only through the provider's byte view.
//!
//! [`PageArena`] is the provider used by default: a growable byte buffer
//! that hands out fixed-size pages up to a configured budget.

use alloc::{collections::TryReserveError, vec::Vec};

use snafu::{ResultExt as _, Snafu, ensure};

use crate::{block::BLOCK_ALIGN, error::Location};

/// Errors raised when the heap cannot obtain any more memory.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ExtentError {
    #[snafu(display("page budget of {max_pages} pages is exhausted"))]
    Exhausted {
        max_pages: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to reserve {page_size} more bytes"))]
    Reserve {
        page_size: usize,
        #[snafu(source)]
        source: TryReserveError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap would grow past {limit:#x} bytes"))]
    HeapLimit {
        limit: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

impl ExtentError {
    /// Where the error was raised.
    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::Exhausted { location, .. }
            | Self::Reserve { location, .. }
            | Self::HeapLimit { location, .. } => *location,
        }
    }
}

/// A supplier of contiguous memory extents.
///
/// The heap occupies the offset range `heap_start()..heap_end()` of
/// `memory()`. Each successful [`grow_one_extent`](Self::grow_one_extent)
/// appends one extent at the old `heap_end()`, so the range stays contiguous.
///
/// Implementations must keep `heap_start()` and `heap_end()` multiples of
/// [`BLOCK_ALIGN`], and `memory().len()` must be at least `heap_end()`.
///
/// Extents may be of any size. The heap keeps asking for more until the
/// bytes obtained past its current end can hold a whole block, so a small
/// extent is merged with the ones that follow it.
pub trait ExtentProvider {
    /// Appends one extent to the heap and returns the offset where it starts.
    fn grow_one_extent(&mut self) -> Result<usize, ExtentError>;

    /// Offset of the first heap byte.
    fn heap_start(&self) -> usize;

    /// Offset one past the last heap byte.
    fn heap_end(&self) -> usize;

    /// Bytes backing the heap, indexed by offset.
    fn memory(&self) -> &[u8];

    /// Mutable bytes backing the heap, indexed by offset.
    fn memory_mut(&mut self) -> &mut [u8];
}

/// Smallest page that can hold the initial heap layout.
///
/// The first extent carries a padding word, the prologue block, the
/// epilogue header and one minimum-sized free block.
pub const MIN_PAGE_SIZE: usize = 80;

/// Default extent size.
pub const DEFAULT_PAGE_SIZE: usize = 1024;

/// Default number of extents a [`PageArena`] may hand out.
pub const DEFAULT_MAX_PAGES: usize = 100;

/// An [`ExtentProvider`] backed by a growable byte buffer.
///
/// Every extent is `page_size` zero-filled bytes. The arena refuses to grow
/// beyond `max_pages` extents.
#[derive(Debug, Clone)]
pub struct PageArena {
    bytes: Vec<u8>,
    page_size: usize,
    max_pages: usize,
}

impl Default for PageArena {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE, DEFAULT_MAX_PAGES)
    }
}

impl PageArena {
    /// Creates an empty arena.
    ///
    /// # Panics
    ///
    /// Panics if `page_size` is smaller than [`MIN_PAGE_SIZE`] or not a
    /// multiple of [`BLOCK_ALIGN`].
    #[must_use]
    pub const fn new(page_size: usize, max_pages: usize) -> Self {
        assert!(
            page_size >= MIN_PAGE_SIZE,
            "page size must hold the initial heap layout"
        );
        assert!(
            page_size.is_multiple_of(BLOCK_ALIGN),
            "page size must be a multiple of the block alignment"
        );
        Self {
            bytes: Vec::new(),
            page_size,
            max_pages,
        }
    }

    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub const fn max_pages(&self) -> usize {
        self.max_pages
    }

    /// Number of extents handed out so far.
    #[must_use]
    pub fn pages(&self) -> usize {
        self.bytes.len() / self.page_size
    }
}

impl ExtentProvider for PageArena {
    fn grow_one_extent(&mut self) -> Result<usize, ExtentError> {
        ensure!(
            self.pages() < self.max_pages,
            ExhaustedSnafu {
                max_pages: self.max_pages
            }
        );
        let start = self.bytes.len();
        self.bytes
            .try_reserve_exact(self.page_size)
            .context(ReserveSnafu {
                page_size: self.page_size,
            })?;
        self.bytes.resize(start + self.page_size, 0);
        Ok(start)
    }

    fn heap_start(&self) -> usize {
        0
    }

    fn heap_end(&self) -> usize {
        self.bytes.len()
    }

    fn memory(&self) -> &[u8] {
        &self.bytes
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grow_until_exhausted() {
        let mut arena = PageArena::new(256, 3);
        assert_eq!(arena.heap_start(), arena.heap_end());

        assert_eq!(arena.grow_one_extent().unwrap(), 0);
        assert_eq!(arena.grow_one_extent().unwrap(), 256);
        assert_eq!(arena.grow_one_extent().unwrap(), 512);
        assert_eq!(arena.pages(), 3);
        assert_eq!(arena.heap_end(), 768);

        let err = arena.grow_one_extent().unwrap_err();
        assert!(matches!(err, ExtentError::Exhausted { max_pages: 3, .. }));
        assert_eq!(arena.heap_end(), 768);
    }

    #[test]
    fn test_extents_are_zeroed() {
        let mut arena = PageArena::new(128, 2);
        arena.grow_one_extent().unwrap();
        arena.memory_mut().fill(0xaa);
        arena.grow_one_extent().unwrap();
        assert!(arena.memory()[..128].iter().all(|&b| b == 0xaa));
        assert!(arena.memory()[128..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_zero_budget() {
        let mut arena = PageArena::new(MIN_PAGE_SIZE, 0);
        assert!(arena.grow_one_extent().is_err());
        assert_eq!(arena.memory().len(), 0);
    }

    #[test]
    #[should_panic(expected = "multiple of the block alignment")]
    fn test_misaligned_page_size() {
        let _ = PageArena::new(100, 1);
    }

    #[test]
    #[should_panic(expected = "initial heap layout")]
    fn test_tiny_page_size() {
        let _ = PageArena::new(64, 1);
    }
}
