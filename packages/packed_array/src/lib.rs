#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A header and a runtime-sized array of elements in one heap allocation, owned by a single
//! smart pointer.
//!
//! This package lets you allocate "flexible array member" objects: a type whose last field is
//! logically an array with a length only known at runtime. The header and every element live in
//! one contiguous block and are released together.
//!
//! The building blocks are:
//!
//! - [`PackedLayout`] describes a managed type as a `Header` followed by `[Element; 1]`, with
//!   the layout verified at compile time. [`PackedIter`] additionally enables element access.
//! - [`PackedPtr`] exclusively owns a combined block. Dropping, resetting or overwriting it
//!   drops the elements by decreasing index, then the header, then releases the memory.
//! - [`Deleter`] remembers the element count of a block and performs the teardown.
//! - [`allocate_bytes()`] and [`allocate_count()`] size the block, then construct the managed
//!   value in place and return a [`PackedPtr`].
//! - [`BaseAllocator`] is the pluggable strategy that obtains and releases the raw memory,
//!   [`Global`] by default.
//!
//! # Example
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use packed_array::{PackedIter, PackedLayout, allocate_count};
//!
//! #[repr(C)]
//! struct Batch {
//!     name: String,
//!     jobs: [Job; 1],
//! }
//!
//! #[repr(C)]
//! struct BatchHeader {
//!     name: String,
//! }
//!
//! struct Job {
//!     id: usize,
//!     finished: Rc<RefCell<Vec<usize>>>,
//! }
//!
//! impl Drop for Job {
//!     fn drop(&mut self) {
//!         self.finished.borrow_mut().push(self.id);
//!     }
//! }
//!
//! // SAFETY: Batch is repr(C), begins with the fields of BatchHeader, ends in [Job; 1]
//! // and has no Drop implementation of its own.
//! unsafe impl PackedLayout for Batch {
//!     type Header = BatchHeader;
//!     type Element = Job;
//! }
//!
//! // SAFETY: Items are the elements themselves.
//! unsafe impl PackedIter for Batch {
//!     type Item = Job;
//! }
//!
//! let finished = Rc::new(RefCell::new(Vec::new()));
//!
//! let batch = allocate_count::<Batch>(3).construct_with(
//!     Batch {
//!         name: "nightly".to_string(),
//!         jobs: [Job { id: 0, finished: Rc::clone(&finished) }],
//!     },
//!     |id| Job { id, finished: Rc::clone(&finished) },
//! );
//!
//! assert_eq!(batch.count(), 3);
//! assert_eq!(batch.header().unwrap().name, "nightly");
//! assert_eq!(batch.iter().map(|job| job.id).collect::<Vec<_>>(), [0, 1, 2]);
//!
//! drop(batch);
//!
//! // Elements are dropped by decreasing index.
//! assert_eq!(*finished.borrow(), [2, 1, 0]);
//! ```
//!
//! # Element count
//!
//! The managed type always contains element 0, so every block holds at least one element, even
//! if zero elements are requested. A byte size that leaves room for a partial trailing element
//! rounds down.
//!
//! # Thread safety
//!
//! A [`PackedPtr`] is an exclusive owner, like a `Box`. It can be sent or shared between threads
//! if its contents and base allocator can. Synchronizing access to the contents is up to the
//! caller.

mod allocate;
mod allocator;
mod deleter;
mod error;
mod ptr;
#[cfg(test)]
mod test_types;
mod traits;

pub use allocate::*;
#[cfg(test)]
pub(crate) use allocator::MockBaseAllocator;
pub use allocator::{BaseAllocator, Global, allocate_enlarged};
pub use deleter::*;
pub use error::Error;
pub(crate) use error::Result;
pub use ptr::*;
pub(crate) use traits::{IterCheck, LayoutCheck, drop_contents, element_count, first_element};
pub use traits::{NoHeader, PackedIter, PackedLayout, Plain, verify_iter_layout, verify_layout};
