use std::alloc::{self, Layout, LayoutError};

use thiserror::Error;

/// Errors that can occur when allocating or describing a combined block.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The base allocator could not provide memory for the block.
    #[error("base allocator could not provide a block with layout {layout:?}")]
    AllocationFailed {
        /// The layout that was requested from the base allocator.
        layout: Layout,
    },

    /// The requested block size does not form a valid memory layout.
    #[error("a block of {bytes} bytes aligned to {align} exceeds the maximum allocation size")]
    LayoutOverflow {
        /// The requested block size in bytes.
        bytes: usize,

        /// The alignment of the managed type.
        align: usize,

        /// The reason the layout was rejected.
        #[source]
        source: LayoutError,
    },

    /// A deleter was given a block size that cannot even hold the header.
    #[error("block size {size} is smaller than the {header_size} byte header")]
    SizeBelowHeader {
        /// The block size given to the deleter.
        size: usize,

        /// The size of the header type.
        header_size: usize,
    },

    /// A deleter was given a block size that cannot hold the managed type.
    #[error("block size {size} is smaller than the {managed_size} byte managed type")]
    SizeBelowManaged {
        /// The block size given to the deleter.
        size: usize,

        /// The size of the managed type, including its first element.
        managed_size: usize,
    },
}

impl Error {
    /// Reports the error through the standard channels for infallible allocation paths.
    ///
    /// Allocation failure goes to [`std::alloc::handle_alloc_error()`], anything else panics.
    pub(crate) fn raise(self) -> ! {
        match self {
            Self::AllocationFailed { layout } => alloc::handle_alloc_error(layout),
            other => panic!("{other}"),
        }
    }
}

/// A specialized `Result` type for packed array operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::error::Error as _;
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn size_below_header_names_both_sizes() {
        let error = Error::SizeBelowHeader {
            size: 4,
            header_size: 16,
        };

        assert_eq!(
            error.to_string(),
            "block size 4 is smaller than the 16 byte header"
        );
    }

    #[test]
    fn layout_overflow_keeps_source() {
        let source = Layout::from_size_align(usize::MAX, 8).unwrap_err();
        let error = Error::LayoutOverflow {
            bytes: usize::MAX,
            align: 8,
            source,
        };

        assert!(error.source().is_some());
    }

    #[test]
    #[should_panic(expected = "smaller than the 32 byte managed type")]
    fn raise_panics_for_non_allocation_errors() {
        Error::SizeBelowManaged {
            size: 8,
            managed_size: 32,
        }
        .raise();
    }
}
