use std::alloc::{self, Layout};
use std::mem::{align_of, size_of};
use std::ptr::NonNull;

use crate::{Error, Result};

/// The strategy used to obtain and release the memory of combined blocks.
///
/// A base allocator treats blocks as raw memory. It never inspects their contents; constructing
/// and dropping the header and elements is done before a block is handed back for release.
///
/// The default strategy is [`Global`], which uses the Rust global allocator.
#[cfg_attr(test, mockall::automock)]
pub trait BaseAllocator {
    /// Obtains a block of memory that fits `layout`.
    ///
    /// Returns `None` if the memory cannot be provided.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Releases a block of memory.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `block` was obtained from `allocate()` on this allocator
    /// with the same `layout` and that it has not already been released.
    unsafe fn deallocate(&self, block: NonNull<u8>, layout: Layout);
}

/// Base allocator that obtains blocks from the Rust global allocator.
///
/// Zero-sized layouts are never satisfied, as every combined block holds at least one element.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[expect(clippy::exhaustive_structs, reason = "intentionally an empty struct")]
pub struct Global;

impl BaseAllocator for Global {
    #[inline]
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return None;
        }

        // SAFETY: The layout is not zero-sized, checked above.
        NonNull::new(unsafe { alloc::alloc(layout) })
    }

    #[inline]
    unsafe fn deallocate(&self, block: NonNull<u8>, layout: Layout) {
        // SAFETY: Forwarding safety requirements to the caller.
        unsafe { alloc::dealloc(block.as_ptr(), layout) };
    }
}

/// Calculates the layout of a combined block for `T` that is at least `enlarged` bytes long.
///
/// The block is never smaller than `T` itself, so the managed value always fits.
pub(crate) fn enlarged_layout<T>(enlarged: usize) -> Result<Layout> {
    let bytes = enlarged.max(size_of::<T>());
    let align = align_of::<T>();

    Layout::from_size_align(bytes, align).map_err(|source| Error::LayoutOverflow {
        bytes,
        align,
        source,
    })
}

/// Obtains raw memory for a combined block of `T` holding at least `enlarged` bytes.
///
/// This is the enlarged counterpart of allocating a single `T`: the block has the alignment of
/// `T` and a size of `max(size_of::<T>(), enlarged)`. Nothing is constructed in it. The returned
/// layout must be used to release the block through the same allocator.
///
/// # Errors
///
/// Returns [`Error::LayoutOverflow`] if the size cannot form a valid layout and
/// [`Error::AllocationFailed`] if the allocator cannot provide the memory.
pub fn allocate_enlarged<T, A: BaseAllocator>(
    allocator: &A,
    enlarged: usize,
) -> Result<(NonNull<T>, Layout)> {
    let layout = enlarged_layout::<T>(enlarged)?;

    let block = allocator
        .allocate(layout)
        .ok_or(Error::AllocationFailed { layout })?;

    Ok((block.cast(), layout))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::as_conversions,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use super::*;

    #[test]
    fn global_round_trip() {
        let layout = Layout::new::<u64>();

        let block = Global.allocate(layout).unwrap();
        assert_eq!(block.as_ptr() as usize % layout.align(), 0);

        // SAFETY: The block came from this allocator with this layout.
        unsafe { Global.deallocate(block, layout) };
    }

    #[test]
    fn global_rejects_zero_sized() {
        assert!(Global.allocate(Layout::new::<()>()).is_none());
    }

    #[test]
    fn enlarged_layout_never_smaller_than_type() {
        let layout = enlarged_layout::<[u64; 4]>(0).unwrap();
        assert_eq!(layout.size(), 32);
        assert_eq!(layout.align(), align_of::<u64>());

        let layout = enlarged_layout::<[u64; 4]>(100).unwrap();
        assert_eq!(layout.size(), 100);
    }

    #[test]
    fn enlarged_layout_overflow() {
        let error = enlarged_layout::<u64>(usize::MAX).unwrap_err();

        assert!(matches!(
            error,
            Error::LayoutOverflow {
                bytes: usize::MAX,
                align: 8,
                ..
            }
        ));
    }

    #[test]
    fn allocate_enlarged_reports_failure() {
        let mut allocator = MockBaseAllocator::new();
        allocator.expect_allocate().times(1).returning(|_| None);

        let error = allocate_enlarged::<u32, _>(&allocator, 64).unwrap_err();

        assert!(matches!(error, Error::AllocationFailed { layout } if layout.size() == 64));
    }

    #[test]
    fn allocate_enlarged_uses_enlarged_size() {
        let mut allocator = MockBaseAllocator::new();
        allocator
            .expect_allocate()
            .withf(|layout| layout.size() == 40 && layout.align() == align_of::<u32>())
            .times(1)
            .returning(|layout| Global.allocate(layout));

        let (block, layout) = allocate_enlarged::<u32, _>(&allocator, 40).unwrap();
        assert_eq!(layout.size(), 40);

        // SAFETY: The block came from the global allocator with this layout.
        unsafe { Global.deallocate(block.cast(), layout) };
    }
}
