use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;

/// The header of a combined block that has no header.
///
/// Zero-sized, so the element array starts at the very beginning of the block.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[expect(clippy::exhaustive_structs, reason = "intentionally an empty struct")]
pub struct NoHeader;

/// Describes a type that is laid out as a fixed header followed by an array of elements whose
/// length is only known at runtime.
///
/// The managed type itself declares room for exactly one element (its last field is
/// `[Self::Element; 1]`). A combined block allocated through [`allocate_bytes()`] or
/// [`allocate_count()`] extends that trailing array in place, so a single heap allocation holds
/// the header and every element.
///
/// The managed value is never dropped as a whole. Instead, the header and each element are
/// dropped separately when the owning [`PackedPtr`] releases the block.
///
/// # Layout verification
///
/// The checkable part of the layout contract is verified at compile time whenever an
/// allocation, deleter or pointer is instantiated for the type, so a mismatched implementation
/// fails to build. Use [`verify_layout()`] to assert it directly next to the implementation:
///
/// ```
/// use packed_array::{PackedLayout, verify_layout};
///
/// #[repr(C)]
/// struct Samples {
///     rate: u32,
///     channels: u32,
///     frames: [f32; 1],
/// }
///
/// #[repr(C)]
/// struct SamplesHeader {
///     rate: u32,
///     channels: u32,
/// }
///
/// // SAFETY: Samples is repr(C), begins with the fields of SamplesHeader, ends with
/// // [f32; 1] and has no Drop implementation of its own.
/// unsafe impl PackedLayout for Samples {
///     type Header = SamplesHeader;
///     type Element = f32;
/// }
///
/// const _: () = assert!(verify_layout::<Samples>());
/// ```
///
/// # Safety
///
/// The implementor must guarantee that:
///
/// 1. The type is `#[repr(C)]`.
/// 2. The leading `size_of::<Self::Header>()` bytes of any value of the type are a valid
///    `Self::Header`.
/// 3. The last field of the type is `[Self::Element; 1]`.
/// 4. Dropping the header in place and then the element in place is equivalent to dropping the
///    whole value. In particular, the type must not implement [`Drop`] itself.
///
/// [`allocate_bytes()`]: crate::allocate_bytes
/// [`allocate_count()`]: crate::allocate_count
/// [`PackedPtr`]: crate::PackedPtr
pub unsafe trait PackedLayout: Sized {
    /// The fixed prefix of the combined block. Use [`NoHeader`] if there is none.
    type Header;

    /// The type of each slot in the trailing array.
    type Element;
}

/// Enables indexed access and iteration over the elements of a [`PackedLayout`] type.
///
/// Types that do not implement this trait can still be allocated and released but their
/// [`PackedPtr`] offers no element access.
///
/// The item type exists so elements can be viewed through a `#[repr(transparent)]` wrapper.
/// Most implementations use the element type itself.
///
/// # Safety
///
/// The implementor must guarantee that:
///
/// 1. Every initialized `Self::Element` is also a valid `Self::Item`. Size and alignment
///    equality are checked at compile time.
/// 2. `Self::Item` adds no interior mutability that `Self::Element` lacks. Shared access to the
///    managed value and shared access to the items alias the same memory.
/// 3. `Self::Item` is [`Send`] whenever `Self::Element` is [`Send`] and [`Sync`] whenever
///    `Self::Element` is [`Sync`]. The thread safety of [`PackedPtr`] follows the element type.
///
/// [`PackedPtr`]: crate::PackedPtr
pub unsafe trait PackedIter: PackedLayout {
    /// The type exposed when indexing or iterating.
    type Item;
}

/// Imitates the layout of a managed type: the header followed by a one-element array.
#[repr(C)]
#[allow(
    dead_code,
    reason = "only the layout of the overlay is inspected, it is never constructed"
)]
struct Overlay<H, E> {
    header: H,
    elements: [E; 1],
}

/// Returns `true` if the memory layout of `T` matches its header followed by a one-element
/// array of elements, with nothing in between and nothing after.
///
/// Intended for `const` assertions next to a [`PackedLayout`] implementation.
#[must_use]
pub const fn verify_layout<T: PackedLayout>() -> bool {
    let header_size = size_of::<T::Header>();
    let element_size = size_of::<T::Element>();

    let Some(packed_size) = header_size.checked_add(element_size) else {
        return false;
    };

    element_size > 0
        && size_of::<Overlay<T::Header, T::Element>>() == size_of::<T>()
        && align_of::<Overlay<T::Header, T::Element>>() == align_of::<T>()
        && elements_offset::<T>() == header_size
        && packed_size == size_of::<T>()
}

/// Returns `true` if the iterated type of `T` can stand in for its element type.
#[must_use]
pub const fn verify_iter_layout<T: PackedIter>() -> bool {
    size_of::<T::Item>() == size_of::<T::Element>()
        && align_of::<T::Item>() == align_of::<T::Element>()
}

/// Offset of the element array in the overlay, following `#[repr(C)]` field placement.
const fn elements_offset<T: PackedLayout>() -> usize {
    size_of::<T::Header>().next_multiple_of(align_of::<T::Element>())
}

/// Compile-time layout checks, evaluated when referenced from code instantiated for `T`.
pub(crate) struct LayoutCheck<T>(PhantomData<T>);

impl<T: PackedLayout> LayoutCheck<T> {
    pub(crate) const VERIFIED: () = {
        assert!(
            size_of::<T::Element>() > 0,
            "packed element type must not be zero-sized"
        );
        assert!(
            size_of::<Overlay<T::Header, T::Element>>() == size_of::<T>(),
            "managed type size differs from its header followed by a one-element array"
        );
        assert!(
            align_of::<Overlay<T::Header, T::Element>>() == align_of::<T>(),
            "managed type alignment differs from its header followed by a one-element array"
        );
        assert!(
            elements_offset::<T>() == size_of::<T::Header>(),
            "element array does not start immediately after the header"
        );
        assert!(
            verify_layout::<T>(),
            "managed type has padding after its one-element array"
        );
    };
}

pub(crate) struct IterCheck<T>(PhantomData<T>);

impl<T: PackedIter> IterCheck<T> {
    pub(crate) const VERIFIED: () = assert!(
        verify_iter_layout::<T>(),
        "iterated type must have the same size and alignment as the element type"
    );
}

/// Number of whole elements that fit in a block of `bytes` bytes after the header.
///
/// The caller must ensure `bytes` is at least the size of the header.
#[expect(
    clippy::integer_division,
    clippy::arithmetic_side_effects,
    reason = "a partial trailing element does not count and element size is checked to be non-zero"
)]
pub(crate) const fn element_count<T: PackedLayout>(bytes: usize) -> usize {
    bytes.saturating_sub(size_of::<T::Header>()) / size_of::<T::Element>()
}

/// Returns a pointer to the first element of a combined block.
///
/// # Safety
///
/// The block must be allocated with room for at least the managed type `T`.
pub(crate) unsafe fn first_element<T: PackedLayout>(block: NonNull<T>) -> NonNull<T::Element> {
    // SAFETY: The header occupies the first size_of::<Header>() bytes of a block that is at
    // least size_of::<T>() bytes long, so the offset stays within the allocation.
    unsafe { block.byte_add(size_of::<T::Header>()) }.cast()
}

/// Drops the elements of a combined block by decreasing index, then its header.
///
/// # Safety
///
/// The header and elements `0..count` must be initialized and must not be used afterwards.
pub(crate) unsafe fn drop_contents<T: PackedLayout>(block: NonNull<T>, count: usize) {
    // SAFETY: Forwarding the allocation guarantee from the caller.
    let first = unsafe { first_element(block) };

    for index in (0..count).rev() {
        // SAFETY: index < count and elements 0..count are within the block.
        let element = unsafe { first.add(index) };

        // SAFETY: The caller guarantees the element is initialized and not used afterwards.
        unsafe { element.drop_in_place() };
    }

    // SAFETY: The caller guarantees the header is initialized and not used afterwards.
    unsafe { block.cast::<T::Header>().drop_in_place() };
}

/// A transparent wrapper that describes a plain array of `E` with no header.
///
/// Use this for element types from other crates, which cannot be given a [`PackedLayout`]
/// implementation via [`plain_packed_layout!`](crate::plain_packed_layout) due to coherence rules.
///
/// ```
/// use packed_array::{Plain, allocate_count};
///
/// let names = allocate_count::<Plain<String>>(3).construct(Plain("first".to_string()));
///
/// assert_eq!(names.as_slice(), ["first", "", ""]);
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
#[expect(
    clippy::exhaustive_structs,
    reason = "the wrapper is constructed directly and will never gain fields"
)]
pub struct Plain<E>(pub E);

// SAFETY: Plain<E> is transparent over E, so it is exactly one element with no header.
unsafe impl<E> PackedLayout for Plain<E> {
    type Header = NoHeader;
    type Element = E;
}

// SAFETY: Items are the elements themselves.
unsafe impl<E> PackedIter for Plain<E> {
    type Item = E;
}

/// Implements [`PackedLayout`] and [`PackedIter`] for types that are a plain array of themselves,
/// with no header.
///
/// ```
/// use packed_array::{allocate_count, plain_packed_layout};
///
/// #[derive(Clone, Copy, Debug, Default, PartialEq)]
/// struct Point {
///     x: i32,
///     y: i32,
/// }
///
/// plain_packed_layout!(Point);
///
/// let points = allocate_count::<Point>(2).construct(Point { x: 1, y: 2 });
///
/// assert_eq!(points[0], Point { x: 1, y: 2 });
/// assert_eq!(points[1], Point::default());
/// ```
#[macro_export]
macro_rules! plain_packed_layout {
    ($($managed:ty),+ $(,)?) => {
        $(
            // SAFETY: A type is trivially laid out as zero header bytes followed by one of itself.
            unsafe impl $crate::PackedLayout for $managed {
                type Header = $crate::NoHeader;
                type Element = $managed;
            }

            // SAFETY: Items are the elements themselves.
            unsafe impl $crate::PackedIter for $managed {
                type Item = $managed;
            }
        )+
    };
}

plain_packed_layout!(
    u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, bool, char
);

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::arithmetic_side_effects,
    clippy::as_conversions,
    dead_code,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::cell::Cell;
    use std::mem::offset_of;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::allocate_count;
    use crate::test_types::{Logged, LoggedElement, LoggedHeader};

    /// Compiles only if the items of `T` are its elements.
    fn items_are_elements<T>()
    where
        T: PackedIter<Item = <T as PackedLayout>::Element>,
    {
    }

    // The built-in impls hand out the elements themselves, so items carry exactly the interior
    // mutability and thread safety of the elements.
    assert_impl_all!(<Plain<String> as PackedIter>::Item: Send, Sync);
    assert_impl_all!(<u64 as PackedIter>::Item: Send, Sync);
    assert_not_impl_any!(<Plain<Cell<u32>> as PackedIter>::Item: Sync);

    /// Degrees Celsius, stored as plain integers.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    struct Celsius(u32);

    #[repr(C)]
    struct Temperatures {
        station: u32,
        readings: [u32; 1],
    }

    // SAFETY: Temperatures is repr(C), starts with a u32 header and ends in [u32; 1].
    unsafe impl PackedLayout for Temperatures {
        type Header = u32;
        type Element = u32;
    }

    // SAFETY: Celsius is a transparent u32 without interior mutability, Send and Sync like u32.
    unsafe impl PackedIter for Temperatures {
        type Item = Celsius;
    }

    #[repr(C)]
    struct Words {
        words: [u32; 1],
    }

    // SAFETY: Words is repr(C) and consists of [u32; 1] only.
    unsafe impl PackedLayout for Words {
        type Header = NoHeader;
        type Element = u32;
    }

    // SAFETY: Only used to exercise verify_iter_layout(), never iterated.
    unsafe impl PackedIter for Words {
        type Item = u16;
    }

    #[repr(C)]
    struct Message {
        id: u32,
        flags: u32,
        payload: [u64; 1],
    }

    #[repr(C)]
    struct MessageHeader {
        id: u32,
        flags: u32,
    }

    // SAFETY: Message is repr(C), starts with the MessageHeader fields and ends in [u64; 1].
    unsafe impl PackedLayout for Message {
        type Header = MessageHeader;
        type Element = u64;
    }

    /// The header is smaller than the element alignment, leaving a gap before the array.
    #[repr(C)]
    struct Gapped {
        tag: u8,
        values: [u64; 1],
    }

    // SAFETY: Only used to exercise verify_layout(), never allocated.
    unsafe impl PackedLayout for Gapped {
        type Header = u8;
        type Element = u64;
    }

    /// The header alignment leaves padding after the one-element array.
    #[repr(C)]
    struct Padded {
        wide: u64,
        bytes: [u8; 1],
    }

    // SAFETY: Only used to exercise verify_layout(), never allocated.
    unsafe impl PackedLayout for Padded {
        type Header = u64;
        type Element = u8;
    }

    #[repr(C)]
    struct Empty {
        nothing: [(); 1],
    }

    // SAFETY: Only used to exercise verify_layout(), never allocated.
    unsafe impl PackedLayout for Empty {
        type Header = NoHeader;
        type Element = ();
    }

    const _: () = assert!(verify_layout::<Message>());
    const _: () = assert!(verify_layout::<Logged>());
    const _: () = assert!(verify_iter_layout::<Logged>());
    const _: () = assert!(verify_layout::<Plain<String>>());
    const _: () = assert!(verify_layout::<u8>());
    const _: () = assert!(verify_layout::<u128>());
    const _: () = assert!(verify_layout::<char>());

    #[test]
    fn registered_types_pass_layout_verification() {
        assert!(verify_layout::<Message>());
        assert!(verify_layout::<Logged>());
        assert!(verify_layout::<Plain<Vec<u8>>>());
        assert!(verify_layout::<f64>());
        assert!(verify_iter_layout::<Plain<String>>());
    }

    #[test]
    fn header_and_one_element_fill_the_managed_type() {
        assert_eq!(
            size_of::<MessageHeader>() + size_of::<u64>(),
            size_of::<Message>()
        );
        assert_eq!(
            size_of::<LoggedHeader>() + size_of::<LoggedElement>(),
            size_of::<Logged>()
        );
    }

    #[test]
    fn computed_offset_matches_real_field_offset() {
        assert_eq!(elements_offset::<Message>(), offset_of!(Message, payload));
        assert_eq!(elements_offset::<Logged>(), offset_of!(Logged, elements));
        assert_eq!(elements_offset::<Plain<String>>(), 0);
        assert_eq!(
            offset_of!(Overlay<MessageHeader, u64>, elements),
            size_of::<MessageHeader>()
        );
    }

    #[test]
    fn builtin_items_are_elements() {
        items_are_elements::<u8>();
        items_are_elements::<u64>();
        items_are_elements::<i128>();
        items_are_elements::<f32>();
        items_are_elements::<bool>();
        items_are_elements::<char>();
        items_are_elements::<Plain<String>>();
        items_are_elements::<Plain<Cell<u32>>>();
    }

    #[test]
    fn smaller_item_fails_iter_verification() {
        assert!(!verify_iter_layout::<Words>());
    }

    #[test]
    fn transparent_item_wraps_elements() {
        assert!(verify_layout::<Temperatures>());
        assert!(verify_iter_layout::<Temperatures>());

        let ptr = allocate_count::<Temperatures>(3).construct_with(
            Temperatures {
                station: 7,
                readings: [20],
            },
            |index| 20 + index as u32,
        );

        assert_eq!(ptr.header(), Some(&7));
        assert_eq!(ptr.as_slice(), [Celsius(20), Celsius(21), Celsius(22)]);
        assert_eq!(ptr[2], Celsius(22));
    }

    #[test]
    fn gap_before_elements_fails_verification() {
        assert!(!verify_layout::<Gapped>());
    }

    #[test]
    fn padding_after_elements_fails_verification() {
        assert!(!verify_layout::<Padded>());
    }

    #[test]
    fn zero_sized_elements_fail_verification() {
        assert!(!verify_layout::<Empty>());
    }

    #[test]
    fn element_count_rounds_down() {
        assert_eq!(element_count::<Message>(8), 0);
        assert_eq!(element_count::<Message>(16), 1);
        assert_eq!(element_count::<Message>(23), 1);
        assert_eq!(element_count::<Message>(48), 5);
        assert_eq!(element_count::<u32>(0), 0);
        assert_eq!(element_count::<u32>(20), 5);
    }

    #[test]
    fn first_element_follows_header() {
        let mut message = Message {
            id: 1,
            flags: 2,
            payload: [3],
        };
        let block = NonNull::from(&mut message);

        // SAFETY: The block holds a whole Message.
        let first = unsafe { first_element(block) };

        // SAFETY: The first element is the payload field of the message.
        assert_eq!(unsafe { *first.as_ref() }, 3);
        assert_eq!(
            first.as_ptr() as usize - block.as_ptr() as usize,
            size_of::<MessageHeader>()
        );
    }
}
