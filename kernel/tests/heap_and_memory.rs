//! Exercises the heap allocator against the physical page allocator it
//! grows from: a `Vec` large enough to outgrow one bump region forces a
//! second frame-run to be pulled in mid-allocation, and the page
//! allocator must still have frames to hand out directly afterward.
#![feature(custom_test_frameworks)]
#![no_main]
#![no_std]
#![reexport_test_harness_main = "test_main"]
#![test_runner(virt_kernel::test_runner)]

extern crate alloc;

use alloc::vec::Vec;

use virt_kernel::{add_test, heap, memory};

#[global_allocator]
static ALLOCATOR: heap::KernelHeap = heap::KernelHeap;

extern "C" {
    static __kernel_start: u8;
    static __kernel_end: u8;
}

#[no_mangle]
extern "C" fn kernel_main() -> ! {
    // SAFETY: `__kernel_start`/`__kernel_end` are linker-defined symbols;
    // only their addresses are read, to reserve the test image from the
    // frame allocator.
    let (kernel_start, kernel_end) =
        unsafe { (&__kernel_start as *const u8 as u64, &__kernel_end as *const u8 as u64) };
    // SAFETY: runs once, before any other code touches physical memory in
    // this binary.
    unsafe { memory::init(core::iter::once((kernel_start, kernel_end - kernel_start))) };

    test_main();
    virt_kernel::halt()
}

add_test!(heap_growth_serves_allocations_past_a_single_region, {
    // Pushing enough `u64`s to exceed one bump region forces the heap to
    // grow by pulling another run of frames from `memory`; if that growth
    // path were broken this would return early with a truncated `Vec`
    // instead of panicking, so check the full length and contents.
    let mut numbers: Vec<u64> = Vec::new();
    for i in 0..500_000_u64 {
        numbers.push(i);
    }
    assert_eq!(numbers.len(), 500_000);
    assert_eq!(numbers[499_999], 499_999);
    drop(numbers);

    // The page allocator still has frames to hand out directly after the
    // heap's growth above.
    let frame = memory::alloc_frame().expect("page allocator still has frames after heap growth");
    assert_eq!(frame.count(), 1);
});

add_test!(freed_allocation_is_recycled_by_a_same_size_request, {
    let mut first: Vec<u8> = Vec::with_capacity(64);
    first.extend_from_slice(&[0xAA; 64]);
    let first_ptr = first.as_ptr();
    drop(first);

    let mut second: Vec<u8> = Vec::with_capacity(64);
    second.extend_from_slice(&[0xBB; 64]);
    assert_eq!(second.as_ptr(), first_ptr, "same-size allocation should reuse the freed block");
});
