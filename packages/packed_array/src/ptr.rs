use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop};
use std::ops::{Index, IndexMut};
use std::ptr::{self, NonNull};
use std::{fmt, slice};

use crate::{BaseAllocator, Deleter, Global, IterCheck, PackedIter, PackedLayout, first_element};

/// Exclusive owner of a combined block: a header followed by a runtime-determined number of
/// elements, all in one allocation.
///
/// Created by [`allocate_bytes()`](crate::allocate_bytes) or
/// [`allocate_count()`](crate::allocate_count). When the pointer is dropped, reset or
/// overwritten, its [`Deleter`] drops the elements by decreasing index, then the header, and
/// releases the memory through the base allocator `A`.
///
/// A pointer may also be null, owning nothing. Dropping a null pointer does nothing.
///
/// If the managed type implements [`PackedIter`], the elements can be accessed by index and
/// iterated over.
///
/// # Example
///
/// ```
/// use packed_array::{PackedIter, PackedLayout, allocate_count};
///
/// #[repr(C)]
/// struct Header {
///     id: u32,
///     flags: u32,
/// }
///
/// #[repr(C)]
/// struct Message {
///     header: Header,
///     payload: [u64; 1],
/// }
///
/// // SAFETY: Message is repr(C), starts with a Header, ends in [u64; 1] and has no Drop impl.
/// unsafe impl PackedLayout for Message {
///     type Header = Header;
///     type Element = u64;
/// }
///
/// // SAFETY: Items are the elements themselves.
/// unsafe impl PackedIter for Message {
///     type Item = u64;
/// }
///
/// let mut message = allocate_count::<Message>(4).construct(Message {
///     header: Header { id: 7, flags: 0 },
///     payload: [10],
/// });
///
/// message[3] = 40;
///
/// assert_eq!(message.count(), 4);
/// assert_eq!(message.header().map(|header| header.id), Some(7));
/// assert_eq!(message.as_slice(), [10, 0, 0, 40]);
/// ```
///
/// # Thread safety
///
/// The pointer is [`Send`] and [`Sync`] if the managed type, its header, its elements and the
/// base allocator are. The item type of a [`PackedIter`] implementation is required to follow
/// the element type in this regard.
pub struct PackedPtr<T: PackedLayout, A: BaseAllocator = Global> {
    block: Option<NonNull<T>>,

    deleter: Deleter<T, A>,

    // The header and elements are dropped separately, but their types can only name lifetimes
    // that `T` names too.
    _owns: PhantomData<T>,
}

impl<T: PackedLayout, A: BaseAllocator> PackedPtr<T, A> {
    pub(crate) fn new(block: NonNull<T>, deleter: Deleter<T, A>) -> Self {
        Self {
            block: Some(block),
            deleter,
            _owns: PhantomData,
        }
    }

    /// Creates a pointer that owns nothing.
    #[must_use]
    pub fn null() -> Self
    where
        A: Default,
    {
        Self {
            block: None,
            deleter: Deleter::default(),
            _owns: PhantomData,
        }
    }

    /// Takes ownership of a combined block previously released via
    /// [`into_raw()`](Self::into_raw).
    ///
    /// # Safety
    ///
    /// The caller must ensure that the block satisfies the safety requirements of
    /// [`Deleter::delete()`] for this deleter and that nothing else owns it.
    #[must_use]
    pub unsafe fn from_raw(block: NonNull<T>, deleter: Deleter<T, A>) -> Self {
        Self::new(block, deleter)
    }

    /// Gives up ownership of the block without dropping anything or releasing memory.
    ///
    /// Returns `None` for a null pointer. Use [`from_raw()`](Self::from_raw) to hand the block
    /// back to a pointer, or release it manually via [`Deleter::delete()`].
    #[must_use]
    pub fn into_raw(self) -> Option<(NonNull<T>, Deleter<T, A>)> {
        let this = ManuallyDrop::new(self);

        // SAFETY: `this` is never used or dropped again, so the deleter is moved out only once.
        let deleter = unsafe { ptr::read(&this.deleter) };

        this.block.map(|block| (block, deleter))
    }

    /// Returns `true` if the pointer owns no block.
    #[must_use]
    #[inline]
    pub fn is_null(&self) -> bool {
        self.block.is_none()
    }

    /// Returns a raw pointer to the managed value, or a null pointer if there is no block.
    #[must_use]
    #[inline]
    pub fn as_ptr(&self) -> *mut T {
        self.block.map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// Returns a reference to the managed value, or `None` if there is no block.
    ///
    /// The managed value spans the header and the first element.
    #[must_use]
    #[inline]
    pub fn get(&self) -> Option<&T> {
        // SAFETY: The block holds an initialized managed value for as long as we own it.
        self.block.map(|block| unsafe { block.as_ref() })
    }

    /// Returns an exclusive reference to the managed value, or `None` if there is no block.
    #[must_use]
    #[inline]
    pub fn get_mut(&mut self) -> Option<&mut T> {
        // SAFETY: The block holds an initialized managed value and we have exclusive access.
        self.block.map(|mut block| unsafe { block.as_mut() })
    }

    /// Returns a reference to the header, or `None` if there is no block.
    #[must_use]
    #[inline]
    pub fn header(&self) -> Option<&T::Header> {
        // SAFETY: The managed value begins with a valid header.
        self.block.map(|block| unsafe { block.cast::<T::Header>().as_ref() })
    }

    /// Returns an exclusive reference to the header, or `None` if there is no block.
    #[must_use]
    #[inline]
    pub fn header_mut(&mut self) -> Option<&mut T::Header> {
        // SAFETY: The managed value begins with a valid header and we have exclusive access.
        self.block.map(|block| unsafe { block.cast::<T::Header>().as_mut() })
    }

    /// Returns the number of elements in the block, zero if there is no block.
    #[must_use]
    #[inline]
    pub fn count(&self) -> usize {
        self.deleter.count()
    }

    /// Returns the deleter that will release the block.
    #[must_use]
    #[inline]
    pub fn deleter(&self) -> &Deleter<T, A> {
        &self.deleter
    }

    /// Drops the contents of the block and releases it, leaving the pointer null.
    ///
    /// Does nothing if the pointer is already null.
    pub fn reset(&mut self) {
        if let Some(block) = self.block.take() {
            // SAFETY: We owned the block, which was allocated and constructed together with
            // this deleter. The block is no longer reachable through `self`.
            unsafe { self.deleter.delete(block.as_ptr()) };
        }

        self.deleter.clear();
    }

    /// Moves the block out of this pointer, leaving it null.
    #[must_use]
    pub fn take(&mut self) -> Self
    where
        A: Default,
    {
        mem::take(self)
    }
}

impl<T: PackedIter, A: BaseAllocator> PackedPtr<T, A> {
    /// Returns a pointer to the first element, or a null pointer if there is no block.
    ///
    /// Together with [`end()`](Self::end) this delimits the elements of the block.
    #[must_use]
    pub fn begin(&self) -> *const T::Item {
        () = IterCheck::<T>::VERIFIED;

        self.block.map_or(ptr::null(), |block| {
            // SAFETY: The block was allocated with room for at least the managed type.
            let first = unsafe { first_element(block) };
            first.cast::<T::Item>().as_ptr().cast_const()
        })
    }

    /// Returns a pointer one past the last element, or a null pointer if there is no block.
    #[must_use]
    pub fn end(&self) -> *const T::Item {
        let begin = self.begin();

        if begin.is_null() {
            return begin;
        }

        // SAFETY: The block holds `count()` elements after `begin`, so the result is at most one
        // past the end of the allocation.
        unsafe { begin.add(self.count()) }
    }

    /// Returns a reference to the element at `index` without bounds checking.
    ///
    /// # Safety
    ///
    /// The pointer must not be null and `index` must be less than [`count()`](Self::count).
    #[must_use]
    pub unsafe fn at(&self, index: usize) -> &T::Item {
        // SAFETY: The caller guarantees the element exists.
        let item = unsafe { self.begin().add(index) };

        // SAFETY: The element is initialized and lives as long as `self` owns the block.
        unsafe { &*item }
    }

    /// Returns an exclusive reference to the element at `index` without bounds checking.
    ///
    /// # Safety
    ///
    /// The pointer must not be null and `index` must be less than [`count()`](Self::count).
    #[must_use]
    pub unsafe fn at_mut(&mut self, index: usize) -> &mut T::Item {
        // SAFETY: The caller guarantees the element exists.
        let item = unsafe { self.begin().add(index) }.cast_mut();

        // SAFETY: The element is initialized and we have exclusive access to the block.
        unsafe { &mut *item }
    }

    /// Returns the elements as a slice, empty if there is no block.
    #[must_use]
    pub fn as_slice(&self) -> &[T::Item] {
        let begin = self.begin();

        if begin.is_null() {
            return &[];
        }

        // SAFETY: All `count()` elements after `begin` are initialized and owned by us.
        unsafe { slice::from_raw_parts(begin, self.count()) }
    }

    /// Returns the elements as an exclusive slice, empty if there is no block.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [T::Item] {
        let begin = self.begin().cast_mut();

        if begin.is_null() {
            return &mut [];
        }

        // SAFETY: All `count()` elements after `begin` are initialized and we have exclusive
        // access to the block.
        unsafe { slice::from_raw_parts_mut(begin, self.count()) }
    }

    /// Iterates over the elements in index order.
    pub fn iter(&self) -> slice::Iter<'_, T::Item> {
        self.as_slice().iter()
    }

    /// Iterates over exclusive references to the elements in index order.
    pub fn iter_mut(&mut self) -> slice::IterMut<'_, T::Item> {
        self.as_mut_slice().iter_mut()
    }
}

/// Returns the number of elements in the block owned by `ptr`, zero if it is null.
#[must_use]
#[inline]
pub fn count<T: PackedLayout, A: BaseAllocator>(ptr: &PackedPtr<T, A>) -> usize {
    ptr.count()
}

impl<T: PackedLayout, A: BaseAllocator> Drop for PackedPtr<T, A> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T: PackedLayout, A: BaseAllocator + Default> Default for PackedPtr<T, A> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: PackedIter, A: BaseAllocator> Index<usize> for PackedPtr<T, A> {
    type Output = T::Item;

    fn index(&self, index: usize) -> &Self::Output {
        let count = self.count();

        self.as_slice().get(index).unwrap_or_else(|| {
            panic!("index {index} out of bounds for packed array of {count} elements")
        })
    }
}

impl<T: PackedIter, A: BaseAllocator> IndexMut<usize> for PackedPtr<T, A> {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        let count = self.count();

        self.as_mut_slice().get_mut(index).unwrap_or_else(|| {
            panic!("index {index} out of bounds for packed array of {count} elements")
        })
    }
}

impl<'a, T: PackedIter, A: BaseAllocator> IntoIterator for &'a PackedPtr<T, A> {
    type Item = &'a T::Item;
    type IntoIter = slice::Iter<'a, T::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, T: PackedIter, A: BaseAllocator> IntoIterator for &'a mut PackedPtr<T, A> {
    type Item = &'a mut T::Item;
    type IntoIter = slice::IterMut<'a, T::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter_mut()
    }
}

// Debug implementations have no API contract to test.
#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg_attr(test, mutants::skip)]
impl<T: PackedLayout, A: BaseAllocator> fmt::Debug for PackedPtr<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackedPtr")
            .field("block", &self.as_ptr())
            .field("count", &self.count())
            .finish_non_exhaustive()
    }
}

// SAFETY: The pointer exclusively owns its block, like a Box would, so moving it to another
// thread moves the managed value, header and elements along with it.
unsafe impl<T, A> Send for PackedPtr<T, A>
where
    T: PackedLayout + Send,
    T::Header: Send,
    T::Element: Send,
    A: BaseAllocator + Send,
{
}

// SAFETY: Shared access to the pointer only grants shared access to the block contents. Items
// are Sync whenever elements are and add no interior mutability, per the PackedIter contract.
unsafe impl<T, A> Sync for PackedPtr<T, A>
where
    T: PackedLayout + Sync,
    T::Header: Sync,
    T::Element: Sync,
    A: BaseAllocator + Sync,
{
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::indexing_slicing,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::test_types::{Event, Log, Logged, element, new_log};
    use crate::{Global, MockBaseAllocator, Plain, allocate_count, allocate_count_in};

    assert_impl_all!(PackedPtr<u32>: Send, Sync);
    assert_impl_all!(PackedPtr<Plain<String>>: Send, Sync);
    assert_not_impl_any!(PackedPtr<Plain<Rc<u32>>>: Send, Sync);
    assert_not_impl_any!(PackedPtr<Plain<Cell<u32>>>: Sync);
    assert_not_impl_any!(PackedPtr<u32>: Clone, Copy);

    fn logged(count: usize) -> (Log, PackedPtr<Logged>) {
        let log = new_log();
        let ptr = allocate_count::<Logged>(count)
            .construct_with(Logged::new(&log, 1), |index| element(&log, index));
        (log, ptr)
    }

    #[test]
    fn null_is_empty() {
        let ptr = PackedPtr::<Logged>::null();

        assert!(ptr.is_null());
        assert!(ptr.as_ptr().is_null());
        assert!(ptr.get().is_none());
        assert!(ptr.header().is_none());
        assert_eq!(ptr.count(), 0);
        assert_eq!(count(&ptr), 0);
        assert!(ptr.begin().is_null());
        assert_eq!(ptr.begin(), ptr.end());
        assert!(ptr.as_slice().is_empty());
        assert_eq!(ptr.iter().count(), 0);
    }

    #[test]
    fn dropping_null_touches_nothing() {
        // No expectations are set, so any call into the allocator would fail the test.
        let ptr = PackedPtr::<Logged, MockBaseAllocator>::null();

        drop(ptr);
    }

    #[test]
    fn iteration_is_in_index_order() {
        let (_log, ptr) = logged(3);

        let indexes = ptr.iter().map(|element| element.index).collect::<Vec<_>>();
        assert_eq!(indexes, [0, 1, 2]);

        let indexes = (&ptr).into_iter().map(|element| element.index).collect::<Vec<_>>();
        assert_eq!(indexes, [0, 1, 2]);
    }

    #[test]
    fn begin_and_end_span_count_elements() {
        let (_log, ptr) = logged(3);

        // SAFETY: Both pointers are derived from the same block.
        let span = unsafe { ptr.end().offset_from(ptr.begin()) };
        assert_eq!(span, 3);

        // Element 0 lives inside the managed value itself.
        let managed = ptr.get().unwrap();
        assert_eq!(ptr.begin(), &raw const managed.elements[0]);
    }

    #[test]
    fn unchecked_access() {
        let (_log, mut ptr) = logged(4);

        assert_eq!(unsafe { ptr.at(3) }.index, 3);

        unsafe { ptr.at_mut(2) }.index = 20;
        assert_eq!(ptr[2].index, 20);
    }

    #[test]
    fn checked_index_mut() {
        let (_log, mut ptr) = logged(2);

        ptr[1].index = 11;

        assert_eq!(ptr.as_slice()[1].index, 11);
        for element in &mut ptr {
            element.index += 100;
        }
        assert_eq!(ptr[0].index, 100);
        assert_eq!(ptr[1].index, 111);

        // Restore the indexes so teardown logs stay readable.
        ptr[0].index = 0;
        ptr[1].index = 1;
    }

    #[test]
    #[should_panic(expected = "index 3 out of bounds for packed array of 3 elements")]
    fn index_out_of_bounds_panics() {
        let (_log, ptr) = logged(3);

        _ = &ptr[3];
    }

    #[test]
    fn header_access() {
        let (_log, mut ptr) = logged(1);

        assert_eq!(ptr.header().unwrap().id, 1);

        ptr.header_mut().unwrap().id = 9;
        assert_eq!(ptr.get().unwrap().header.id, 9);
    }

    // Compiles only if the pointer is covariant in the managed type, like a Box.
    fn shorten_lifetime<'a>(ptr: PackedPtr<Plain<&'static str>>) -> PackedPtr<Plain<&'a str>> {
        ptr
    }

    #[test]
    fn pointer_is_covariant() {
        let ptr = allocate_count::<Plain<&'static str>>(2).construct(Plain("static"));

        let ptr = shorten_lifetime(ptr);

        assert_eq!(ptr.as_slice(), ["static", ""]);
    }

    #[test]
    fn managed_value_is_mutable_in_place() {
        let (log, mut ptr) = logged(2);

        let managed = ptr.get_mut().unwrap();
        managed.header.id = 5;
        managed.elements[0].index = 10;

        assert_eq!(ptr.header().unwrap().id, 5);
        assert_eq!(ptr[0].index, 10);
        assert_eq!(ptr[1].index, 1);

        drop(ptr);
        assert_eq!(
            *log.borrow(),
            [Event::Element(1), Event::Element(10), Event::Header(5)]
        );

        assert!(PackedPtr::<Logged>::null().get_mut().is_none());
    }

    #[test]
    fn reset_tears_down_once() {
        let (log, mut ptr) = logged(2);

        ptr.reset();

        assert!(ptr.is_null());
        assert_eq!(ptr.count(), 0);
        assert_eq!(
            *log.borrow(),
            [Event::Element(1), Event::Element(0), Event::Header(1)]
        );

        // Resetting again and dropping are no-ops.
        ptr.reset();
        drop(ptr);
        assert_eq!(log.borrow().len(), 3);
    }

    #[test]
    fn take_transfers_ownership() {
        let (log, mut source) = logged(2);
        let block = source.as_ptr();

        let target = source.take();

        assert!(source.is_null());
        assert_eq!(count(&source), 0);
        assert_eq!(target.as_ptr(), block);
        assert_eq!(count(&target), 2);

        drop(source);
        assert!(log.borrow().is_empty());

        drop(target);
        assert_eq!(
            *log.borrow(),
            [Event::Element(1), Event::Element(0), Event::Header(1)]
        );
    }

    #[test]
    fn move_transfers_single_teardown() {
        let log = new_log();

        let mut allocator = MockBaseAllocator::new();
        allocator
            .expect_allocate()
            .times(1)
            .returning(|layout| Global.allocate(layout));
        allocator
            .expect_deallocate()
            .times(1)
            .returning(|block, layout| unsafe { Global.deallocate(block, layout) });

        let source = allocate_count_in::<Logged, _>(2, allocator)
            .construct_with(Logged::new(&log, 3), |index| element(&log, index));

        let moved = source;
        let mut holder = vec![moved];
        let target = holder.pop().unwrap();

        assert_eq!(count(&target), 2);
        drop(target);

        assert_eq!(
            *log.borrow(),
            [Event::Element(1), Event::Element(0), Event::Header(3)]
        );
    }

    #[test]
    fn reassignment_releases_previous_block() {
        let (log, mut ptr) = logged(1);
        let (other_log, other) = logged(2);

        ptr = other;

        assert_eq!(*log.borrow(), [Event::Element(0), Event::Header(1)]);
        assert!(other_log.borrow().is_empty());
        assert_eq!(ptr.count(), 2);
    }

    #[test]
    fn raw_round_trip() {
        let (log, ptr) = logged(2);

        let (block, deleter) = ptr.into_raw().unwrap();
        assert!(log.borrow().is_empty());
        assert_eq!(deleter.count(), 2);

        let ptr = unsafe { PackedPtr::from_raw(block, deleter) };
        drop(ptr);

        assert_eq!(log.borrow().len(), 3);
    }

    #[test]
    fn null_into_raw_is_none() {
        assert!(PackedPtr::<u32>::null().into_raw().is_none());
    }
}
