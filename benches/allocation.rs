//! Allocation-pattern benchmarks
//!
//! Benchmarks that simulate the workloads the allocators are built for:
//! per-iteration scratch memory released in bulk.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use region_alloc::{
    LinearAllocator, RegionAllocator, StackFrameAllocator, VMemLinearAllocator,
    VMemStackFrameAllocator,
};
use std::alloc::Layout;

/// Simulate a frame of scratch allocations released wholesale.
fn bench_frame_scratch(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_scratch");
    group.throughput(Throughput::Elements(64));

    let layout = Layout::from_size_align(256, 16).unwrap();

    group.bench_function("linear_with_reset", |b| {
        let mut buffer = vec![0u8; 64 * 1024];
        let allocator =
            unsafe { LinearAllocator::with_buffer(buffer.as_mut_ptr(), buffer.len()).unwrap() };

        b.iter(|| unsafe {
            for _ in 0..64 {
                let ptr = allocator.allocate(layout).unwrap();
                black_box(ptr);
            }
            allocator.reset().unwrap();
        });
    });

    group.bench_function("vmem_linear_with_reset", |b| {
        let allocator = VMemLinearAllocator::with_capacity(64 * 1024).unwrap();

        b.iter(|| unsafe {
            for _ in 0..64 {
                let ptr = allocator.allocate(layout).unwrap();
                black_box(ptr);
            }
            allocator.reset().unwrap();
        });
    });

    group.bench_function("stack_frame_push_pop", |b| {
        let allocator = StackFrameAllocator::with_segment_size(64 * 1024).unwrap();

        b.iter(|| unsafe {
            let mut frame = allocator.push_frame();
            for _ in 0..64 {
                let ptr = allocator.allocate(layout).unwrap();
                black_box(ptr);
            }
            frame.pop();
        });
    });

    group.bench_function("vmem_stack_frame_push_pop", |b| {
        let allocator = VMemStackFrameAllocator::with_capacity(64 * 1024).unwrap();

        b.iter(|| unsafe {
            let mut frame = allocator.push_frame();
            for _ in 0..64 {
                let ptr = allocator.allocate(layout).unwrap();
                black_box(ptr);
            }
            frame.pop();
        });
    });

    group.finish();
}

/// Grow a buffer in place through the reallocation fast path.
fn bench_realloc_growth(c: &mut Criterion) {
    let mut group = c.benchmark_group("realloc_growth");
    group.throughput(Throughput::Elements(1));

    group.bench_function("linear_in_place", |b| {
        let mut buffer = vec![0u8; 1024 * 1024];
        let allocator =
            unsafe { LinearAllocator::with_buffer(buffer.as_mut_ptr(), buffer.len()).unwrap() };

        b.iter(|| unsafe {
            let mut size = 64;
            let mut ptr = allocator.allocate(Layout::from_size_align(size, 8).unwrap()).unwrap();
            while size < 64 * 1024 {
                let grown = size * 2;
                ptr = allocator
                    .reallocate(ptr.as_ptr(), size, Layout::from_size_align(grown, 8).unwrap())
                    .unwrap();
                size = grown;
            }
            black_box(ptr);
            allocator.reset().unwrap();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_frame_scratch, bench_realloc_growth);
criterion_main!(benches);
