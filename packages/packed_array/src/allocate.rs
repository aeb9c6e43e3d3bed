use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::NonNull;

use scopeguard::ScopeGuard;
use tracing::trace;

use crate::{
    BaseAllocator, Deleter, Error, Global, LayoutCheck, PackedLayout, PackedPtr,
    allocate_enlarged, drop_contents, element_count, first_element,
};

/// Prepares a combined block of at least `total_bytes` bytes for the managed type `T`.
///
/// The block is never smaller than `T` itself, so it always holds at least one element. The
/// memory is obtained when the returned [`Allocation`] is given the managed value.
///
/// # Example
///
/// ```
/// use packed_array::allocate_bytes;
///
/// let values = allocate_bytes::<u32>(12).construct(1);
///
/// assert_eq!(values.count(), 3);
/// assert_eq!(values.as_slice(), [1, 0, 0]);
/// ```
#[must_use]
pub fn allocate_bytes<T: PackedLayout>(total_bytes: usize) -> Allocation<T> {
    allocate_bytes_in(total_bytes, Global)
}

/// Prepares a combined block of at least `total_bytes` bytes for the managed type `T`, using a
/// custom base allocator.
#[must_use]
pub fn allocate_bytes_in<T: PackedLayout, A: BaseAllocator>(
    total_bytes: usize,
    allocator: A,
) -> Allocation<T, A> {
    () = LayoutCheck::<T>::VERIFIED;

    Allocation {
        bytes: total_bytes.max(size_of::<T>()),
        allocator,
        _managed: PhantomData,
    }
}

/// Prepares a combined block holding `count` elements for the managed type `T`.
///
/// The block always holds at least one element because the managed type itself contains the
/// first element, so requesting zero elements yields one.
///
/// # Example
///
/// ```
/// use packed_array::allocate_count;
///
/// let values = allocate_count::<u64>(5).construct_with(10, |index| index as u64 * 10);
///
/// assert_eq!(values.as_slice(), [10, 10, 20, 30, 40]);
/// ```
#[must_use]
pub fn allocate_count<T: PackedLayout>(count: usize) -> Allocation<T> {
    allocate_count_in(count, Global)
}

/// Prepares a combined block holding `count` elements for the managed type `T`, using a custom
/// base allocator.
#[must_use]
pub fn allocate_count_in<T: PackedLayout, A: BaseAllocator>(
    count: usize,
    allocator: A,
) -> Allocation<T, A> {
    // An impossible size surfaces as a layout error once the allocation is attempted.
    let bytes = count
        .saturating_mul(size_of::<T::Element>())
        .saturating_add(size_of::<T::Header>());

    allocate_bytes_in(bytes, allocator)
}

/// A combined block that is ready to be allocated and constructed.
///
/// Returned by [`allocate_bytes()`] and [`allocate_count()`]. Supply the managed value (which
/// carries the header and element 0) and a way to create the remaining elements to obtain a
/// [`PackedPtr`] that owns the block.
///
/// Allocation and construction form one transaction. If creating the managed value or any
/// element fails or panics, everything constructed so far is dropped in the same order the
/// deleter would use and the memory is released exactly once.
pub struct Allocation<T, A = Global> {
    bytes: usize,

    allocator: A,

    _managed: PhantomData<fn() -> T>,
}

impl<T: PackedLayout, A: BaseAllocator> Allocation<T, A> {
    /// Returns the size of the block in bytes.
    #[must_use]
    #[inline]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Returns the number of elements the block will hold.
    #[must_use]
    #[inline]
    pub fn count(&self) -> usize {
        element_count::<T>(self.bytes)
    }

    /// Allocates the block, moves `value` into it and fills elements `1..count()` with their
    /// default value.
    ///
    /// # Panics
    ///
    /// Panics if the block size exceeds the maximum allocation size. Allocation failure is
    /// reported via [`std::alloc::handle_alloc_error()`].
    #[must_use]
    pub fn construct(self, value: T) -> PackedPtr<T, A>
    where
        T::Element: Default,
    {
        self.construct_with(value, |_| T::Element::default())
    }

    /// Allocates the block, moves `value` into it and fills elements `1..count()` by calling
    /// `fill` with the index of each element, in increasing order.
    ///
    /// # Panics
    ///
    /// Panics if the block size exceeds the maximum allocation size. Allocation failure is
    /// reported via [`std::alloc::handle_alloc_error()`].
    #[must_use]
    pub fn construct_with(
        self,
        value: T,
        mut fill: impl FnMut(usize) -> T::Element,
    ) -> PackedPtr<T, A> {
        match self.build(|| Ok::<_, Infallible>(value), |index| Ok(fill(index))) {
            Ok(ptr) => ptr,
            Err(BuildError::Allocate(error)) => error.raise(),
            Err(BuildError::Construct(never)) => match never {},
        }
    }

    /// Allocates the block, moves the value returned by `make` into it and fills elements
    /// `1..count()` by calling `fill` with the index of each element, in increasing order.
    ///
    /// `make` is called after the memory is obtained.
    ///
    /// # Errors
    ///
    /// Returns the first error from `make` or `fill`, or the allocation error converted into
    /// `E`. No memory is leaked in either case.
    ///
    /// # Example
    ///
    /// ```
    /// use packed_array::{Error, allocate_count};
    ///
    /// #[derive(Debug)]
    /// enum LoadError {
    ///     Parse(std::num::ParseIntError),
    ///     Allocate(Error),
    /// }
    ///
    /// impl From<Error> for LoadError {
    ///     fn from(error: Error) -> Self {
    ///         Self::Allocate(error)
    ///     }
    /// }
    ///
    /// let input = ["1", "2", "x"];
    ///
    /// let result = allocate_count::<u32>(input.len()).try_construct_with(
    ///     || input[0].parse().map_err(LoadError::Parse),
    ///     |index| input[index].parse().map_err(LoadError::Parse),
    /// );
    ///
    /// assert!(matches!(result, Err(LoadError::Parse(_))));
    /// ```
    pub fn try_construct_with<E: From<Error>>(
        self,
        make: impl FnOnce() -> Result<T, E>,
        fill: impl FnMut(usize) -> Result<T::Element, E>,
    ) -> Result<PackedPtr<T, A>, E> {
        self.build(make, fill).map_err(|error| match error {
            BuildError::Allocate(error) => E::from(error),
            BuildError::Construct(error) => error,
        })
    }

    fn build<E>(
        self,
        make: impl FnOnce() -> Result<T, E>,
        mut fill: impl FnMut(usize) -> Result<T::Element, E>,
    ) -> Result<PackedPtr<T, A>, BuildError<E>> {
        let (block, layout) =
            allocate_enlarged::<T, A>(&self.allocator, self.bytes).map_err(BuildError::Allocate)?;

        let deleter = Deleter::for_layout(layout, self.allocator);
        let count = deleter.count();

        let mut partial = scopeguard::guard(
            PartialBlock {
                block,
                deleter,
                constructed: None,
            },
            PartialBlock::abandon,
        );

        let value = make().map_err(BuildError::Construct)?;

        // SAFETY: The block is freshly allocated with the size and alignment of at least `T`.
        unsafe { block.write(value) };
        partial.constructed = Some(1);

        // SAFETY: The block is allocated with room for at least the managed type.
        let first = unsafe { first_element(block) };

        for index in 1..count {
            let element = fill(index).map_err(BuildError::Construct)?;

            // SAFETY: index < count, so the element slot lies within the block.
            let slot = unsafe { first.add(index) };

            // SAFETY: The slot is allocated, aligned and not yet initialized.
            unsafe { slot.write(element) };

            // Cannot overflow because index < count.
            partial.constructed = Some(index.wrapping_add(1));
        }

        let PartialBlock { block, deleter, .. } = ScopeGuard::into_inner(partial);

        trace!(bytes = layout.size(), count, "allocated packed block");

        Ok(PackedPtr::new(block, deleter))
    }
}

// Debug implementations have no API contract to test.
#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg_attr(test, mutants::skip)]
impl<T, A> fmt::Debug for Allocation<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("bytes", &self.bytes)
            .finish_non_exhaustive()
    }
}

enum BuildError<E> {
    Allocate(Error),
    Construct(E),
}

/// A block whose construction is in progress.
struct PartialBlock<T: PackedLayout, A: BaseAllocator> {
    block: NonNull<T>,

    deleter: Deleter<T, A>,

    /// `None` until the managed value is written, then the number of initialized elements
    /// (element 0 is part of the managed value).
    constructed: Option<usize>,
}

impl<T: PackedLayout, A: BaseAllocator> PartialBlock<T, A> {
    /// Drops whatever was constructed and releases the memory.
    fn abandon(mut self) {
        trace!(constructed = ?self.constructed, "abandoning partially constructed packed block");

        let Some(constructed) = self.constructed else {
            // SAFETY: Nothing was constructed, the block came from the deleter's allocator with
            // the deleter's layout and is not used after this.
            unsafe { self.deleter.release(self.block) };
            return;
        };

        self.deleter.truncate(constructed);

        // SAFETY: The managed value and elements 1..constructed are initialized and the block
        // came from the deleter's allocator with the deleter's layout.
        unsafe { self.deleter.delete(self.block.as_ptr()) };
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::arithmetic_side_effects,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};

    use thiserror::Error;

    use super::*;
    use crate::test_types::{Event, Log, Logged, LoggedElement, LoggedHeader, element, new_log};
    use crate::{MockBaseAllocator, Plain, count};

    #[derive(Debug, Error)]
    enum TestError {
        #[error("constructor refused")]
        Refused,

        #[error(transparent)]
        Allocation(#[from] Error),
    }

    /// An allocator that expects exactly one allocation and one deallocation.
    fn single_block_allocator() -> MockBaseAllocator {
        let mut allocator = MockBaseAllocator::new();
        allocator
            .expect_allocate()
            .times(1)
            .returning(|layout| Global.allocate(layout));
        allocator
            .expect_deallocate()
            .times(1)
            .returning(|block, layout| unsafe { Global.deallocate(block, layout) });
        allocator
    }

    fn construct_logged(log: &Log, count: usize) -> PackedPtr<Logged> {
        allocate_count::<Logged>(count).construct_with(Logged::new(log, 1), |index| {
            element(log, index)
        })
    }

    #[test]
    fn count_matches_request_for_header_type() {
        let log = new_log();

        for requested in [1, 5, 100] {
            assert_eq!(allocate_count::<Logged>(requested).count(), requested);

            let ptr = construct_logged(&log, requested);
            assert_eq!(count(&ptr), requested);
        }
    }

    #[test]
    fn zero_count_holds_one_element_for_header_type() {
        let log = new_log();

        assert_eq!(allocate_count::<Logged>(0).count(), 1);

        let ptr = construct_logged(&log, 0);
        assert_eq!(count(&ptr), 1);
    }

    #[test]
    fn count_matches_request_for_plain_type() {
        for requested in [1, 5, 100] {
            let ptr = allocate_count::<u16>(requested).construct(7);

            assert_eq!(count(&ptr), requested);
            assert_eq!(ptr.iter().filter(|&&value| value == 7).count(), 1);
        }

        assert_eq!(count(&allocate_count::<u16>(0).construct(7)), 1);
    }

    #[test]
    fn bytes_match_count() {
        let header = size_of::<LoggedHeader>();
        let element_size = size_of::<LoggedElement>();
        let log = new_log();

        for requested in [0_usize, 1, 5, 100] {
            let bytes = header + requested * element_size;
            let allocation = allocate_bytes::<Logged>(bytes);

            assert_eq!(allocation.bytes(), bytes.max(size_of::<Logged>()));
            assert_eq!(allocation.count(), requested.max(1));

            let ptr = allocation.construct_with(Logged::new(&log, 2), |index| element(&log, index));
            assert_eq!(count(&ptr), requested.max(1));
        }
    }

    #[test]
    fn partial_trailing_element_is_not_counted() {
        let ptr = allocate_bytes::<u32>(4 * 3 + 2).construct(5);

        assert_eq!(ptr.count(), 3);
        assert_eq!(ptr.deleter().layout().size(), 14);
    }

    #[test]
    fn fill_sees_increasing_indexes() {
        let mut seen = Vec::new();

        let ptr = allocate_count::<u64>(4).construct_with(0, |index| {
            seen.push(index);
            index as u64
        });

        assert_eq!(seen, [1, 2, 3]);
        assert_eq!(ptr.as_slice(), [0, 1, 2, 3]);
    }

    #[test]
    fn teardown_order_is_reverse_then_header() {
        let log = new_log();

        let ptr = allocate_count_in::<Logged, _>(5, single_block_allocator())
            .construct_with(Logged::new(&log, 4), |index| element(&log, index));

        assert!(log.borrow().is_empty());
        drop(ptr);

        assert_eq!(
            *log.borrow(),
            [
                Event::Element(4),
                Event::Element(3),
                Event::Element(2),
                Event::Element(1),
                Event::Element(0),
                Event::Header(4),
            ]
        );
    }

    #[test]
    fn failed_make_releases_memory_without_drops() {
        let log = new_log();

        let result = allocate_count_in::<Logged, _>(3, single_block_allocator())
            .try_construct_with(
                || Err(TestError::Refused),
                |index| Ok(element(&log, index)),
            );

        assert!(matches!(result, Err(TestError::Refused)));
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn failed_fill_drops_constructed_part_in_reverse() {
        let log = new_log();

        let result = allocate_count_in::<Logged, _>(5, single_block_allocator())
            .try_construct_with(
                || Ok(Logged::new(&log, 6)),
                |index| {
                    if index == 3 {
                        Err(TestError::Refused)
                    } else {
                        Ok(element(&log, index))
                    }
                },
            );

        assert!(matches!(result, Err(TestError::Refused)));
        assert_eq!(
            *log.borrow(),
            [
                Event::Element(2),
                Event::Element(1),
                Event::Element(0),
                Event::Header(6),
            ]
        );
    }

    #[test]
    fn panicking_make_releases_memory_without_drops() {
        let log = new_log();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            allocate_count_in::<Logged, _>(2, single_block_allocator()).try_construct_with(
                || -> Result<Logged, TestError> { panic!("constructor panicked") },
                |index| Ok(element(&log, index)),
            )
        }));

        assert!(result.is_err());
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn panicking_fill_drops_constructed_part() {
        let log = new_log();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            allocate_count_in::<Logged, _>(3, single_block_allocator()).construct_with(
                Logged::new(&log, 8),
                |index| {
                    assert!(index < 2, "fill panicked at {index}");
                    element(&log, index)
                },
            )
        }));

        assert!(result.is_err());
        assert_eq!(
            *log.borrow(),
            [Event::Element(1), Event::Element(0), Event::Header(8)]
        );
    }

    #[test]
    fn allocation_failure_converts_into_caller_error() {
        let mut allocator = MockBaseAllocator::new();
        allocator.expect_allocate().times(1).returning(|_| None);

        let made = std::cell::Cell::new(false);

        let result = allocate_count_in::<Plain<String>, _>(4, allocator).try_construct_with(
            || {
                made.set(true);
                Ok::<_, TestError>(Plain(String::new()))
            },
            |_| Ok(String::new()),
        );

        assert!(matches!(
            result,
            Err(TestError::Allocation(Error::AllocationFailed { .. }))
        ));
        assert!(!made.get());
    }

    #[test]
    fn oversized_request_is_layout_overflow() {
        let result = allocate_count::<u64>(usize::MAX)
            .try_construct_with(|| Ok::<_, TestError>(0), |_| Ok(0));

        assert!(matches!(
            result,
            Err(TestError::Allocation(Error::LayoutOverflow { .. }))
        ));
    }

    #[test]
    #[should_panic(expected = "exceeds the maximum allocation size")]
    fn oversized_infallible_request_panics() {
        _ = allocate_count::<u64>(usize::MAX).construct(0);
    }

    #[test]
    fn plain_strings_default_fill() {
        let ptr = allocate_count::<Plain<String>>(3).construct(Plain("a".to_string()));

        assert_eq!(ptr.as_slice(), ["a", "", ""]);
        assert!(ptr.header().is_some());
    }
}
