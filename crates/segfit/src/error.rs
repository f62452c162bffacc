//! Error types and fatal error reporting.
//!
//! Failures fall into two groups. [`AllocError::OutOfMemory`] and
//! [`AllocError::SizeOverflow`] are ordinary failures: the heap is left
//! intact and the caller may keep using it. [`AllocError::ContractViolation`]
//! means the caller handed the heap a pointer it never issued, freed a block
//! twice, or overwrote heap metadata. The heap refuses all further work after
//! such an error (see [`AllocError::Poisoned`]) and callers are expected to
//! terminate, for example through [`abort_on_fatal`].

use core::{error::Error, fmt};

use snafu::{GenerateImplicitData, Snafu};

use crate::{config::ConfigError, extent::ExtentError};

/// Source location captured when an error is constructed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static core::panic::Location<'static>);

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(core::panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Errors returned by the public heap operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AllocError {
    #[snafu(display("out of memory"))]
    OutOfMemory {
        #[snafu(source)]
        source: ExtentError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("requested size {size} does not fit in a block"))]
    SizeOverflow {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap contract violated"))]
    ContractViolation {
        #[snafu(source)]
        source: ContractViolation,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap is poisoned by an earlier contract violation"))]
    Poisoned {
        #[snafu(implicit)]
        location: Location,
    },
}

impl AllocError {
    /// Returns `true` if the error signals heap corruption or misuse.
    ///
    /// Fatal errors must not be recovered from; the heap rejects every
    /// operation after the first one.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ContractViolation { .. } | Self::Poisoned { .. })
    }

    /// Returns the violation behind a [`AllocError::ContractViolation`].
    #[must_use]
    pub fn violation(&self) -> Option<&ContractViolation> {
        match self {
            Self::ContractViolation { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Where the error was raised.
    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::OutOfMemory { location, .. }
            | Self::SizeOverflow { location, .. }
            | Self::ContractViolation { location, .. }
            | Self::Poisoned { location } => *location,
        }
    }
}

/// Ways in which a caller or a corrupted heap breaks the allocator's contract.
///
/// Offsets are block header offsets unless the variant says otherwise.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ContractViolation {
    #[snafu(display("null pointer"))]
    NullPointer {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("pointer {offset:#x} is not 16-byte aligned"))]
    MisalignedPointer {
        offset: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap has not been initialized"))]
    UninitializedHeap {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("pointer {offset:#x} is outside the heap {start:#x}..{end:#x}"))]
    OutsideHeap {
        offset: usize,
        start: usize,
        end: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block {offset:#x} has a corrupted header"))]
    CorruptHeader {
        offset: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block {offset:#x} has an invalid size {size:#x}"))]
    InvalidBlockSize {
        offset: usize,
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block {offset:#x} is not allocated"))]
    NotAllocated {
        offset: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block {offset:#x} was already freed into a quick list"))]
    AlreadyQuickListed {
        offset: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block {offset:#x} records payload {payload} larger than its size {size}"))]
    PayloadTooLarge {
        offset: usize,
        payload: usize,
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block {offset:#x} disagrees with the allocation state of its predecessor"))]
    PrevAllocatedMismatch {
        offset: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("free block {offset:#x} has a footer that does not match its header"))]
    FooterMismatch {
        offset: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("free block {offset:#x} follows another free block"))]
    AdjacentFree {
        offset: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("free block {offset:#x} is listed in class {actual} instead of {expected}"))]
    WrongFreeList {
        offset: usize,
        expected: usize,
        actual: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("free block {offset:#x} is not in any free list"))]
    UnlistedFreeBlock {
        offset: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block {offset:#x} is listed as free but is not free"))]
    ListedBlockNotFree {
        offset: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("free list {class} does not form a closed cycle"))]
    BrokenFreeList {
        class: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block {offset:#x} is flagged as quick-listed but is not in a quick list"))]
    StaleQuickFlag {
        offset: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block {offset:#x} does not belong in quick list {index}"))]
    QuickListMismatch {
        offset: usize,
        index: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block sizes add up to {total:#x}, heap holds {expected:#x}"))]
    SizeSumMismatch {
        total: usize,
        expected: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap sentinel at {offset:#x} is corrupted"))]
    BrokenSentinel {
        offset: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

impl ContractViolation {
    /// Where the error was raised.
    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::NullPointer { location }
            | Self::MisalignedPointer { location, .. }
            | Self::UninitializedHeap { location }
            | Self::OutsideHeap { location, .. }
            | Self::CorruptHeader { location, .. }
            | Self::InvalidBlockSize { location, .. }
            | Self::NotAllocated { location, .. }
            | Self::AlreadyQuickListed { location, .. }
            | Self::PayloadTooLarge { location, .. }
            | Self::PrevAllocatedMismatch { location, .. }
            | Self::FooterMismatch { location, .. }
            | Self::AdjacentFree { location, .. }
            | Self::WrongFreeList { location, .. }
            | Self::UnlistedFreeBlock { location, .. }
            | Self::ListedBlockNotFree { location, .. }
            | Self::BrokenFreeList { location, .. }
            | Self::StaleQuickFlag { location, .. }
            | Self::QuickListMismatch { location, .. }
            | Self::SizeSumMismatch { location, .. }
            | Self::BrokenSentinel { location, .. } => *location,
        }
    }
}

fn location_of(err: &(dyn Error + 'static)) -> Option<Location> {
    if let Some(err) = err.downcast_ref::<AllocError>() {
        return Some(err.location());
    }
    if let Some(err) = err.downcast_ref::<ContractViolation>() {
        return Some(err.location());
    }
    if let Some(err) = err.downcast_ref::<ExtentError>() {
        return Some(err.location());
    }
    err.downcast_ref::<ConfigError>().map(ConfigError::location)
}

/// Renders an error, the place it was raised and its chain of causes.
pub struct Report<'a> {
    error: &'a (dyn Error + 'static),
}

impl<'a> Report<'a> {
    /// Wraps `error` for display.
    pub fn new(error: &'a (dyn Error + 'static)) -> Self {
        Self { error }
    }
}

impl fmt::Debug for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Error: {}", self.error)?;
        if let Some(loc) = location_of(self.error) {
            writeln!(f, "  at {loc}")?;
        }
        let mut source = self.error.source();
        if source.is_some() {
            writeln!(f)?;
            writeln!(f, "Caused by:")?;
        }
        let mut index = 0;
        while let Some(s) = source {
            writeln!(f, "{index:4}: {s}")?;
            if let Some(loc) = location_of(s) {
                writeln!(f, "      at {loc}")?;
            }
            source = s.source();
            index += 1;
        }
        Ok(())
    }
}

/// Panics with a full report of `err`.
///
/// The workspace builds with `panic = "abort"`, so this ends the process.
#[track_caller]
pub fn report(err: &(dyn Error + 'static)) -> ! {
    panic!("Critical heap error occurred\n\n{}", Report::new(err));
}

/// Passes recoverable results through and terminates on fatal ones.
///
/// ```should_panic
/// use segfit::{Heap, Payload, error::abort_on_fatal};
///
/// let mut heap = Heap::default();
/// let _ = heap.allocate(16);
/// // Not a pointer the heap handed out.
/// let _ = abort_on_fatal(heap.release(Payload::from_offset(0x18)));
/// ```
#[track_caller]
pub fn abort_on_fatal<T>(result: Result<T, AllocError>) -> Result<T, AllocError> {
    match result {
        Err(err) if err.is_fatal() => report(&err),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::ToString as _;

    use snafu::IntoError as _;

    use super::*;

    #[test]
    fn test_fatal_classification() {
        let violation = NotAllocatedSnafu { offset: 0x28_usize }.build();
        let err = ContractViolationSnafu.into_error(violation);
        assert!(err.is_fatal());
        assert!(matches!(
            err.violation(),
            Some(ContractViolation::NotAllocated { offset: 0x28, .. })
        ));

        let err = SizeOverflowSnafu { size: usize::MAX }.build();
        assert!(!err.is_fatal());
        assert!(err.violation().is_none());

        assert!(PoisonedSnafu.build().is_fatal());
    }

    #[test]
    fn test_report_lists_causes() {
        let violation = MisalignedPointerSnafu { offset: 0x31_usize }.build();
        let err = ContractViolationSnafu.into_error(violation);
        let report = Report::new(&err).to_string();
        assert!(report.starts_with("Error: heap contract violated\n"));
        assert!(report.contains("Caused by:"));
        assert!(report.contains("   0: pointer 0x31 is not 16-byte aligned"));
        assert!(report.contains("error.rs"));
    }

    #[test]
    #[should_panic(expected = "Critical heap error occurred")]
    fn test_abort_on_fatal_panics() {
        let err = ContractViolationSnafu.into_error(NullPointerSnafu.build());
        let _ = abort_on_fatal::<()>(Err(err));
    }

    #[test]
    fn test_abort_on_fatal_passes_recoverable() {
        let err = SizeOverflowSnafu { size: 1_usize }.build();
        let result = abort_on_fatal::<()>(Err(err));
        assert!(matches!(result, Err(AllocError::SizeOverflow { size: 1, .. })));
    }
}
