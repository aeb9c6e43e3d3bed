//! End-to-end tests that exercise the public API of `packed_array` the way a consumer would.

#![allow(
    clippy::undocumented_unsafe_blocks,
    clippy::arithmetic_side_effects,
    clippy::indexing_slicing,
    dead_code,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]

use std::alloc::Layout;
use std::cell::RefCell;
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use packed_array::{
    BaseAllocator, Deleter, Global, PackedIter, PackedLayout, PackedPtr, Plain, allocate_bytes,
    allocate_count, allocate_count_in, allocate_enlarged, count, verify_layout,
};

/// Counts the calls into the global allocator made on behalf of combined blocks.
#[derive(Clone, Debug, Default)]
struct CountingAllocator {
    allocations: Arc<AtomicUsize>,
    deallocations: Arc<AtomicUsize>,
}

impl CountingAllocator {
    fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    fn deallocations(&self) -> usize {
        self.deallocations.load(Ordering::Relaxed)
    }
}

impl BaseAllocator for CountingAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Global.allocate(layout)
    }

    unsafe fn deallocate(&self, block: NonNull<u8>, layout: Layout) {
        self.deallocations.fetch_add(1, Ordering::Relaxed);
        unsafe { Global.deallocate(block, layout) };
    }
}

type Log = Rc<RefCell<Vec<String>>>;

#[repr(C)]
struct Track {
    title: String,
    log: Log,
}

impl Drop for Track {
    fn drop(&mut self) {
        self.log.borrow_mut().push(format!("header {}", self.title));
    }
}

struct Note {
    index: usize,
    log: Log,
}

impl Drop for Note {
    fn drop(&mut self) {
        self.log.borrow_mut().push(format!("note {}", self.index));
    }
}

#[repr(C)]
struct Melody {
    track: Track,
    notes: [Note; 1],
}

// SAFETY: Melody is repr(C), starts with a Track, ends in [Note; 1] and has no Drop impl.
unsafe impl PackedLayout for Melody {
    type Header = Track;
    type Element = Note;
}

// SAFETY: Items are the elements themselves.
unsafe impl PackedIter for Melody {
    type Item = Note;
}

const _: () = assert!(verify_layout::<Melody>());

fn melody(
    log: &Log,
    notes: usize,
    allocator: CountingAllocator,
) -> PackedPtr<Melody, CountingAllocator> {
    allocate_count_in::<Melody, _>(notes, allocator).construct_with(
        Melody {
            track: Track {
                title: "theme".to_string(),
                log: Rc::clone(log),
            },
            notes: [Note {
                index: 0,
                log: Rc::clone(log),
            }],
        },
        |index| Note {
            index,
            log: Rc::clone(log),
        },
    )
}

#[test]
fn five_notes_torn_down_in_reverse_then_header_then_one_release() {
    let log = Log::default();
    let allocator = CountingAllocator::default();

    let ptr = melody(&log, 5, allocator.clone());
    assert_eq!(allocator.allocations(), 1);
    assert_eq!(count(&ptr), 5);

    drop(ptr);

    assert_eq!(
        *log.borrow(),
        [
            "note 4",
            "note 3",
            "note 2",
            "note 1",
            "note 0",
            "header theme"
        ]
    );
    assert_eq!(allocator.deallocations(), 1);
}

#[test]
fn empty_pointer_releases_nothing() {
    let allocator = CountingAllocator::default();

    let ptr = PackedPtr::<Melody, CountingAllocator>::null();
    assert!(ptr.begin().is_null());
    assert_eq!(ptr.begin(), ptr.end());
    drop(ptr);

    let ptr = PackedPtr::<Melody, CountingAllocator>::default();
    drop(ptr);

    assert_eq!(allocator.allocations(), 0);
    assert_eq!(allocator.deallocations(), 0);
}

#[test]
fn iteration_visits_every_note_forward() {
    let log = Log::default();
    let ptr = melody(&log, 3, CountingAllocator::default());

    let indexes: Vec<_> = (&ptr).into_iter().map(|note| note.index).collect();
    assert_eq!(indexes, [0, 1, 2]);

    let mut visited = 0;
    let mut cursor = ptr.begin();
    while cursor != ptr.end() {
        assert_eq!(unsafe { &*cursor }.index, visited);
        cursor = unsafe { cursor.add(1) };
        visited += 1;
    }
    assert_eq!(visited, 3);
}

#[test]
fn moved_pointer_tears_down_exactly_once() {
    let log = Log::default();
    let allocator = CountingAllocator::default();

    let mut first = melody(&log, 2, allocator.clone());
    let second = first.take();

    assert!(first.is_null());
    assert_eq!(count(&first), 0);
    assert_eq!(count(&second), 2);

    drop(first);
    assert!(log.borrow().is_empty());
    assert_eq!(allocator.deallocations(), 0);

    drop(second);
    assert_eq!(log.borrow().len(), 3);
    assert_eq!(allocator.deallocations(), 1);
}

#[test]
fn counts_for_both_helpers() {
    for requested in [0_usize, 1, 5, 100] {
        let by_count = allocate_count::<u32>(requested).construct(0);
        let by_bytes = allocate_bytes::<u32>(requested * size_of::<u32>()).construct(0);

        assert_eq!(count(&by_count), requested.max(1));
        assert_eq!(count(&by_bytes), requested.max(1));
    }
}

#[test]
fn plain_wrapper_holds_foreign_types() {
    let mut words = allocate_count::<Plain<String>>(3).construct(Plain("alpha".to_string()));

    words[1].push_str("beta");
    words[2] = "gamma".to_string();

    assert_eq!(words.as_slice(), ["alpha", "beta", "gamma"]);
    assert_eq!(words.iter().map(String::len).sum::<usize>(), 14);
}

#[test]
fn pointer_moves_between_threads() {
    let allocator = CountingAllocator::default();

    let ptr = allocate_count_in::<u64, _>(8, allocator.clone()).construct_with(1, |index| {
        u64::try_from(index).unwrap() + 1
    });

    let sum = thread::spawn(move || ptr.iter().sum::<u64>()).join().unwrap();

    assert_eq!(sum, 36);
    assert_eq!(allocator.deallocations(), 1);
}

#[test]
fn manual_block_adopted_by_pointer() {
    let allocator = CountingAllocator::default();

    let (block, layout) = allocate_enlarged::<u32, _>(&allocator, 16).unwrap();
    for index in 0..4 {
        unsafe { block.add(index).write(u32::try_from(index).unwrap() * 2) };
    }

    let deleter = Deleter::<u32, _>::new(layout.size(), allocator.clone()).unwrap();
    let ptr = unsafe { PackedPtr::from_raw(block, deleter) };

    assert_eq!(ptr.as_slice(), [0, 2, 4, 6]);

    drop(ptr);
    assert_eq!(allocator.allocations(), 1);
    assert_eq!(allocator.deallocations(), 1);
}
