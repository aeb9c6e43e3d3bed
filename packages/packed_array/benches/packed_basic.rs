//! Basic benchmarks for the `packed_array` crate.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::time::Instant;

use alloc_tracker::Allocator;
use criterion::{Criterion, criterion_group, criterion_main};
use packed_array::{PackedLayout, Plain, allocate_count};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

#[global_allocator]
static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();

#[allow(dead_code, reason = "fields only occupy space in the benchmark")]
#[repr(C)]
struct Frame {
    sequence: u64,
    length: u64,
    bytes: [u64; 1],
}

#[allow(dead_code, reason = "fields only occupy space in the benchmark")]
#[repr(C)]
struct FrameHeader {
    sequence: u64,
    length: u64,
}

// SAFETY: Frame is repr(C), starts with the FrameHeader fields, ends in [u64; 1] and has no
// Drop implementation of its own.
unsafe impl PackedLayout for Frame {
    type Header = FrameHeader;
    type Element = u64;
}

const ELEMENT_COUNT: usize = 64;

fn entrypoint(c: &mut Criterion) {
    let allocs = alloc_tracker::Session::new();

    let mut group = c.benchmark_group("packed_basic");

    let allocs_op = allocs.operation("allocate_header_and_elements");
    group.bench_function("allocate_header_and_elements", |b| {
        b.iter_custom(|iters| {
            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                let frame = allocate_count::<Frame>(black_box(ELEMENT_COUNT)).construct(Frame {
                    sequence: 1,
                    length: 64,
                    bytes: [0],
                });

                drop(black_box(frame));
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("allocate_plain_strings");
    group.bench_function("allocate_plain_strings", |b| {
        b.iter_custom(|iters| {
            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                let strings = allocate_count::<Plain<String>>(black_box(ELEMENT_COUNT))
                    .construct(Plain(String::new()));

                drop(black_box(strings));
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("vec_of_elements");
    group.bench_function("vec_of_elements", |b| {
        b.iter_custom(|iters| {
            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                let header = Box::new(FrameHeader {
                    sequence: 1,
                    length: 64,
                });
                let elements = vec![0_u64; black_box(ELEMENT_COUNT)];

                drop(black_box((header, elements)));
            }

            start.elapsed()
        });
    });

    group.finish();

    allocs.print_to_stdout();
}
