//! Heap tuning parameters.

use snafu::{Snafu, ensure};

use crate::{
    block::{BLOCK_ALIGN, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE},
    error::Location,
};

/// Value XOR-ed into every stored header word.
pub const DEFAULT_MAGIC: u64 = 0x5a5a_c3c3_0f0f_a5a5;

/// Default number of segregated free lists.
pub const DEFAULT_FREE_LISTS: usize = 10;

/// Default number of quick lists.
pub const DEFAULT_QUICK_LISTS: usize = 20;

/// Default number of blocks a quick list holds before it is flushed.
pub const DEFAULT_QUICK_LIST_CAPACITY: usize = 5;

/// Highest useful free-list count: class `n - 1` starts above
/// `MIN_BLOCK_SIZE << (n - 2)`, which must stay below the largest block.
pub const MAX_FREE_LISTS: usize = (MAX_BLOCK_SIZE / MIN_BLOCK_SIZE).ilog2() as usize + 1;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("at least one free list is required"))]
    NoFreeLists {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{count} free lists exceed the limit of {MAX_FREE_LISTS}"))]
    TooManyFreeLists {
        count: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{count} quick lists would cache blocks larger than the largest block"))]
    TooManyQuickLists {
        count: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("quick lists need a capacity of at least one block"))]
    ZeroQuickListCapacity {
        #[snafu(implicit)]
        location: Location,
    },
}

impl ConfigError {
    /// Where the error was raised.
    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::NoFreeLists { location }
            | Self::TooManyFreeLists { location, .. }
            | Self::TooManyQuickLists { location, .. }
            | Self::ZeroQuickListCapacity { location } => *location,
        }
    }
}

/// Tunable parameters of a [`Heap`](crate::Heap).
///
/// ```
/// use segfit::HeapConfig;
///
/// let config = HeapConfig::DEFAULT
///     .with_magic(0)
///     .with_quick_lists(8, 3);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Value XOR-ed into every stored header word.
    pub magic: u64,
    /// Number of segregated free lists.
    pub free_lists: usize,
    /// Number of quick lists. List `k` caches blocks of
    /// `MIN_BLOCK_SIZE + k * BLOCK_ALIGN` bytes. Zero disables quick lists.
    pub quick_lists: usize,
    /// Blocks a quick list holds before it is flushed.
    pub quick_list_capacity: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl HeapConfig {
    pub const DEFAULT: Self = Self {
        magic: DEFAULT_MAGIC,
        free_lists: DEFAULT_FREE_LISTS,
        quick_lists: DEFAULT_QUICK_LISTS,
        quick_list_capacity: DEFAULT_QUICK_LIST_CAPACITY,
    };

    #[must_use]
    pub const fn with_magic(self, magic: u64) -> Self {
        Self { magic, ..self }
    }

    #[must_use]
    pub const fn with_free_lists(self, free_lists: usize) -> Self {
        Self { free_lists, ..self }
    }

    #[must_use]
    pub const fn with_quick_lists(self, quick_lists: usize, capacity: usize) -> Self {
        Self {
            quick_lists,
            quick_list_capacity: capacity,
            ..self
        }
    }

    /// Checks that the parameters describe a usable heap.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(self.free_lists > 0, NoFreeListsSnafu);
        ensure!(
            self.free_lists <= MAX_FREE_LISTS,
            TooManyFreeListsSnafu {
                count: self.free_lists
            }
        );
        let largest_quick = self
            .quick_lists
            .checked_mul(BLOCK_ALIGN)
            .and_then(|n| n.checked_add(MIN_BLOCK_SIZE));
        ensure!(
            largest_quick.is_some_and(|size| size <= MAX_BLOCK_SIZE),
            TooManyQuickListsSnafu {
                count: self.quick_lists
            }
        );
        ensure!(
            self.quick_lists == 0 || self.quick_list_capacity > 0,
            ZeroQuickListCapacitySnafu
        );
        Ok(())
    }
}
