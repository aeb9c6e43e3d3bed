use std::alloc::Layout;
use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;

use tracing::trace;

use crate::{
    BaseAllocator, Error, Global, LayoutCheck, PackedLayout, Result, drop_contents, element_count,
};

/// Tears down a combined block: drops its elements by decreasing index, then its header, then
/// hands the memory back to the base allocator.
///
/// The deleter remembers how many elements the block holds. That count is fixed when the
/// deleter is created and never changes afterwards.
///
/// Every [`PackedPtr`](crate::PackedPtr) owns a deleter. You only need to create one yourself
/// when adopting a raw block via [`PackedPtr::from_raw()`](crate::PackedPtr::from_raw).
pub struct Deleter<T, A = Global> {
    count: usize,

    /// Layout the block was allocated with, required to release it.
    layout: Layout,

    allocator: A,

    _managed: PhantomData<fn() -> T>,
}

impl<T: PackedLayout, A: BaseAllocator> Deleter<T, A> {
    /// Creates a deleter for a block of `size` bytes released through `allocator`.
    ///
    /// The element count is the number of whole elements that fit after the header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SizeBelowHeader`] if `size` cannot hold the header,
    /// [`Error::SizeBelowManaged`] if it cannot hold the managed type and
    /// [`Error::LayoutOverflow`] if it does not form a valid layout.
    ///
    /// # Example
    ///
    /// ```
    /// use packed_array::{Deleter, Global};
    ///
    /// let deleter = Deleter::<u32>::new(20, Global).unwrap();
    /// assert_eq!(deleter.count(), 5);
    ///
    /// assert!(Deleter::<u32>::new(2, Global).is_err());
    /// ```
    pub fn new(size: usize, allocator: A) -> Result<Self> {
        let header_size = size_of::<T::Header>();

        if size < header_size {
            return Err(Error::SizeBelowHeader { size, header_size });
        }

        if size < size_of::<T>() {
            return Err(Error::SizeBelowManaged {
                size,
                managed_size: size_of::<T>(),
            });
        }

        let layout = Layout::from_size_align(size, align_of::<T>()).map_err(|source| {
            Error::LayoutOverflow {
                bytes: size,
                align: align_of::<T>(),
                source,
            }
        })?;

        Ok(Self::for_layout(layout, allocator))
    }

    /// Creates a deleter for a block allocated with `layout`, which must be at least as large
    /// as the managed type.
    pub(crate) fn for_layout(layout: Layout, allocator: A) -> Self {
        () = LayoutCheck::<T>::VERIFIED;

        debug_assert!(layout.size() >= size_of::<T>());

        Self {
            count: element_count::<T>(layout.size()),
            layout,
            allocator,
            _managed: PhantomData,
        }
    }

    /// Returns the number of elements in the block this deleter releases.
    #[must_use]
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns the layout the block was allocated with.
    #[must_use]
    #[inline]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Returns the base allocator that releases the block.
    #[must_use]
    #[inline]
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Forgets the element count, for when the block has been released.
    pub(crate) fn clear(&mut self) {
        self.count = 0;
    }

    /// Replaces the element count, for blocks whose tail is only partially constructed.
    pub(crate) fn truncate(&mut self, count: usize) {
        debug_assert!(count <= self.count);

        self.count = count;
    }

    /// Drops the contents of a block and releases its memory.
    ///
    /// Elements are dropped from the highest index down to index 0, then the header is dropped
    /// once, then the memory is released through the base allocator. Does nothing if `block`
    /// is null.
    ///
    /// The memory is released even if dropping an element or the header panics. The remaining
    /// elements and the header are not dropped in that case.
    ///
    /// # Safety
    ///
    /// If `block` is not null, the caller must ensure that:
    ///
    /// 1. It was allocated by this deleter's base allocator with this deleter's layout.
    /// 2. Its managed value is initialized, as are elements `1..count()`.
    /// 3. It is not accessed again after this call.
    pub unsafe fn delete(&self, block: *mut T) {
        let Some(block) = NonNull::new(block) else {
            return;
        };

        trace!(count = self.count, bytes = self.layout.size(), "releasing packed block");

        let _release = scopeguard::guard(block, |block| {
            // SAFETY: The caller guarantees the block came from this allocator with this
            // layout and is not used after this call.
            unsafe { self.release(block) };
        });

        // SAFETY: The caller guarantees the header and all elements are initialized and not
        // used after this call.
        unsafe { drop_contents(block, self.count) };
    }

    /// Releases the memory of a block without dropping anything in it.
    ///
    /// # Safety
    ///
    /// The block must have been allocated by this deleter's base allocator with this deleter's
    /// layout and must not be accessed again.
    pub(crate) unsafe fn release(&self, block: NonNull<T>) {
        // SAFETY: Forwarding safety requirements to the caller.
        unsafe { self.allocator.deallocate(block.cast(), self.layout) };
    }
}

impl<T, A: Default> Default for Deleter<T, A> {
    /// Creates a deleter for no block at all, with an element count of zero.
    fn default() -> Self {
        Self {
            count: 0,
            layout: Layout::new::<()>(),
            allocator: A::default(),
            _managed: PhantomData,
        }
    }
}

// Debug implementations have no API contract to test.
#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg_attr(test, mutants::skip)]
impl<T, A> fmt::Debug for Deleter<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deleter")
            .field("count", &self.count)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};
    use std::ptr;

    use super::*;
    use crate::test_types::{Event, Log, Logged, LoggedElement, LoggedHeader, element, new_log};
    use crate::{MockBaseAllocator, Plain, first_element};

    fn counting_allocator(deallocations: usize) -> MockBaseAllocator {
        let mut allocator = MockBaseAllocator::new();
        allocator
            .expect_deallocate()
            .times(deallocations)
            .returning(|block, layout| unsafe { Global.deallocate(block, layout) });
        allocator
    }

    /// Allocates a block of `Logged` with `count` elements and constructs all of it.
    fn logged_block(log: &Log, count: usize) -> (NonNull<Logged>, usize) {
        let size = size_of::<LoggedHeader>() + count * size_of::<LoggedElement>();
        let layout = Layout::from_size_align(size, align_of::<Logged>()).unwrap();
        let block = Global.allocate(layout).unwrap().cast::<Logged>();

        unsafe {
            block.write(Logged::new(log, 7));
            let first = first_element(block);
            for index in 1..count {
                first.add(index).write(element(log, index));
            }
        }

        (block, size)
    }

    #[test]
    fn count_from_size() {
        let deleter = Deleter::<Logged>::new(size_of::<Logged>(), Global).unwrap();
        assert_eq!(deleter.count(), 1);

        let size = size_of::<LoggedHeader>() + 5 * size_of::<LoggedElement>();
        let deleter = Deleter::<Logged>::new(size, Global).unwrap();
        assert_eq!(deleter.count(), 5);

        // A partial trailing element is not counted.
        let deleter = Deleter::<Logged>::new(size + 3, Global).unwrap();
        assert_eq!(deleter.count(), 5);
    }

    #[test]
    fn size_below_header_is_rejected() {
        let result = Deleter::<Logged>::new(size_of::<LoggedHeader>() - 1, Global);

        assert!(matches!(result, Err(Error::SizeBelowHeader { .. })));
    }

    #[test]
    fn size_below_managed_is_rejected() {
        let result = Deleter::<Logged>::new(size_of::<LoggedHeader>(), Global);

        assert!(matches!(result, Err(Error::SizeBelowManaged { .. })));
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(Deleter::<Logged>::new(0, Global).is_err());
        assert!(Deleter::<u64>::new(0, Global).is_err());
    }

    #[test]
    fn default_has_no_elements() {
        let deleter = Deleter::<Logged>::default();

        assert_eq!(deleter.count(), 0);
    }

    #[test]
    fn delete_null_does_nothing() {
        // No expectations are set, so any call into the allocator would fail the test.
        let deleter = Deleter::<Logged, MockBaseAllocator>::default();

        unsafe { deleter.delete(ptr::null_mut()) };
    }

    #[test]
    fn delete_drops_elements_in_reverse_then_header_then_releases() {
        let log = new_log();
        let (block, size) = logged_block(&log, 5);

        let deleter = Deleter::<Logged, _>::new(size, counting_allocator(1)).unwrap();
        assert_eq!(deleter.count(), 5);

        unsafe { deleter.delete(block.as_ptr()) };

        assert_eq!(
            *log.borrow(),
            [
                Event::Element(4),
                Event::Element(3),
                Event::Element(2),
                Event::Element(1),
                Event::Element(0),
                Event::Header(7),
            ]
        );

        // Dropping the deleter verifies the single deallocation.
        drop(deleter);
    }

    #[test]
    fn delete_releases_memory_when_element_drop_panics() {
        let log = new_log();
        let (block, size) = logged_block(&log, 3);

        // Element 2 panics when dropped, which stops the teardown early.
        unsafe {
            let first = first_element(block);
            (*first.add(2).as_ptr()).panic_on_drop = true;
        }

        let deleter = Deleter::<Logged, _>::new(size, counting_allocator(1)).unwrap();

        let result = panic::catch_unwind(AssertUnwindSafe(|| unsafe {
            deleter.delete(block.as_ptr());
        }));

        assert!(result.is_err());
        assert_eq!(*log.borrow(), [Event::Element(2)]);

        drop(deleter);
    }

    #[test]
    fn delete_releases_memory_when_header_drop_panics() {
        let log = new_log();
        let (block, size) = logged_block(&log, 2);

        unsafe { (*block.as_ptr()).header.panic_on_drop = true };

        let deleter = Deleter::<Logged, _>::new(size, counting_allocator(1)).unwrap();

        let result = panic::catch_unwind(AssertUnwindSafe(|| unsafe {
            deleter.delete(block.as_ptr());
        }));

        assert!(result.is_err());
        assert_eq!(
            *log.borrow(),
            [Event::Element(1), Event::Element(0), Event::Header(7)]
        );

        // Dropping the deleter verifies the single deallocation.
        drop(deleter);
    }

    // Compiles only if the deleter is covariant in the managed type.
    fn shorten_lifetime<'a>(deleter: Deleter<Plain<&'static str>>) -> Deleter<Plain<&'a str>> {
        deleter
    }

    #[test]
    fn deleter_is_covariant() {
        let deleter = Deleter::<Plain<&'static str>>::new(32, Global).unwrap();

        assert_eq!(shorten_lifetime(deleter).count(), 2);
    }

    #[test]
    fn allocator_is_the_one_given() {
        let mut allocator = MockBaseAllocator::new();
        allocator.expect_allocate().times(1).returning(|_| None);

        let deleter = Deleter::<u64, _>::new(16, allocator).unwrap();

        assert!(deleter.allocator().allocate(deleter.layout()).is_none());
    }

    #[test]
    fn truncate_limits_dropped_elements() {
        let log = new_log();
        let (block, size) = logged_block(&log, 4);

        // Elements 2 and 3 go away on their own, as if their construction never happened.
        unsafe {
            let first = first_element(block);
            first.add(3).drop_in_place();
            first.add(2).drop_in_place();
        }
        log.borrow_mut().clear();

        let mut deleter = Deleter::<Logged, _>::new(size, counting_allocator(1)).unwrap();
        deleter.truncate(2);

        unsafe { deleter.delete(block.as_ptr()) };

        assert_eq!(
            *log.borrow(),
            [Event::Element(1), Event::Element(0), Event::Header(7)]
        );
    }
}
