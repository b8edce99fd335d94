//! Kernel entry point and bring-up sequence: the physical allocator and
//! VMM construct the kernel map and enable the MMU; the heap, GIC, timer,
//! and exception vectors come up; the VirtIO devices probe and
//! initialize; the compositor starts; the ELF loader brings in the init
//! program through the (external) filesystem; the first process is
//! installed and the timer/scheduler drive everything from there.
#![no_main]
#![no_std]
#![feature(strict_provenance)]

extern crate alloc;

use virt_kernel::virtio::{block, gpu, input};
use virt_kernel::{compositor, config, elf, exception, fs, gic, heap, memory, process, timer, uart, vm};

#[global_allocator]
static ALLOCATOR: heap::KernelHeap = heap::KernelHeap;

extern "C" {
    static __kernel_start: u8;
    static __kernel_end: u8;
}

/// Called from the library's boot stub with interrupts masked, the MMU
/// off, one hart active at EL1. Never returns. `#[no_mangle]` so the
/// stub, linked from `virt_kernel`, can resolve it by name.
#[no_mangle]
extern "C" fn kernel_main() -> ! {
    // SAFETY: `__kernel_start`/`__kernel_end` are linker-defined symbols;
    // only their addresses are read, to reserve the kernel image from the
    // frame allocator.
    let (kernel_start, kernel_end) =
        unsafe { (&__kernel_start as *const u8 as u64, &__kernel_end as *const u8 as u64) };

    // SAFETY: runs exactly once, before any other module touches physical
    // memory.
    unsafe { memory::init(core::iter::once((kernel_start, kernel_end - kernel_start))) };

    // SAFETY: runs exactly once, before any virtual-address access beyond
    // the identity range the MMU-off boot stub already relied on.
    unsafe { vm::init() };

    // SAFETY: the UART's MMIO range is identity-mapped by `vm::init`.
    unsafe { uart::init() };

    virt_kernel::println!();
    virt_kernel::println!("booting kernel, image [{kernel_start:#x}, {kernel_end:#x})");

    // SAFETY: runs exactly once, before any exception can fire on this
    // hart, and installs the GIC the timer and device IRQ handlers below
    // depend on.
    unsafe { exception::init() };

    timer::init();

    let block_device = block::probe();
    virt_kernel::log!("block device: {}", if block_device.is_some() { "present" } else { "absent" });

    let input_device = input::probe();
    if let Some(input_device) = &input_device {
        gic::register(config::IRQ_VIRTIO_BASE, dispatch_input_irq, core::ptr::addr_of!(*input_device) as usize);
        gic::set_priority(config::IRQ_VIRTIO_BASE, 0);
        gic::set_target(config::IRQ_VIRTIO_BASE, 0b1);
        gic::enable(config::IRQ_VIRTIO_BASE);
    }

    match gpu::probe() {
        Some(gpu_device) => {
            compositor::init(gpu_device);
            virt_kernel::log!("GPU device present, compositor online");
        }
        None => virt_kernel::log!("no GPU device found; compositor has no display"),
    }

    // The filesystem is a documented external boundary: no concrete
    // block-backed driver lives in this core, so bring-up uses an empty
    // in-memory double. A deployment wires a real driver satisfying
    // `fs::Filesystem` in its place.
    let filesystem = fs::MemoryFs::new();

    match elf::load(&filesystem, "/init", "init") {
        Ok(pid) => {
            virt_kernel::log!("loaded /init as pid {pid}");
            // SAFETY: `pid`'s address space and entry point were just
            // populated by the loader; no exception has fired yet.
            unsafe { process::start_first_process(pid) };
        }
        Err(_) => {
            virt_kernel::log!("no /init image available; halting");
            virt_kernel::halt();
        }
    }
}

fn dispatch_input_irq(device_ptr: usize, _irq: u32) {
    // SAFETY: `device_ptr` was registered above from a `&InputDevice` that
    // outlives the kernel's lifetime (leaked by `compositor`/bring-up
    // retaining no owner to drop it).
    let device = unsafe { &*(device_ptr as *const input::InputDevice) };
    device.handle_irq(|event| match event {
        input::Event::RelativeMotion { axis_is_y, delta } => {
            if axis_is_y {
                compositor::update_mouse(0, delta, None);
            } else {
                compositor::update_mouse(delta, 0, None);
            }
        }
        input::Event::AbsoluteMotion { axis_is_y, value } => {
            let (x, y) = if axis_is_y { (0, value) } else { (value, 0) };
            compositor::update_mouse(0, 0, Some((x, y)));
        }
        input::Event::Button { pressed } => compositor::handle_click(pressed),
        input::Event::Key { .. } => {}
    });
}

