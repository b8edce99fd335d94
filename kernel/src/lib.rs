//! The privileged kernel of the operating system.
//!
//! Owns physical memory, virtual memory, interrupts, the timer, the process
//! table and scheduler, the ELF loader, the supervisor-call dispatcher, the
//! VirtIO transport and device drivers, and the window compositor.
#![no_main]
#![no_std]
#![feature(allocator_api)]
#![feature(strict_provenance)]
#![feature(pointer_is_aligned)]
#![feature(naked_functions)]
#![feature(panic_info_message)]
#![feature(custom_test_frameworks)]
#![reexport_test_harness_main = "test_main"]
#![test_runner(crate::test_runner)]
#![warn(clippy::correctness)]
#![warn(clippy::suspicious)]
#![allow(clippy::module_name_repetitions)]

extern crate alloc;

mod boot;

use core::panic::PanicInfo;

pub mod compositor;
pub mod config;
pub mod elf;
pub mod exception;
pub mod fs;
pub mod gic;
pub mod heap;
pub mod memory;
pub mod process;
pub mod sync;
pub mod syscall;
pub mod timer;
pub mod uart;
pub mod vm;
pub mod virtio;

#[macro_export]
macro_rules! println {
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        writeln!(&mut *$crate::uart::console().lock(), $($arg)*).ok();
    }};
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        write!(&mut *$crate::uart::console().lock(), $($arg)*).ok();
    }};
}

/// Logs with the current jiffies count prefixed, once the timer is live.
#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {{
        $crate::println!("[{:>10}] {}", $crate::timer::jiffies(), format_args!($($arg)*));
    }};
}

/// A single `#[test_case]`-registered unit test, in the style of
/// `src/lib.rs`'s `TestCase`: the kernel has no host process to hand tests
/// off to, so the binary itself becomes the test harness when built with
/// the `custom_test_frameworks` reexported main.
pub struct TestCase {
    pub name: &'static str,
    pub test: fn(),
}

/// Registers a test function under `name`, matching `add_test!` from
/// `src/kernel/macros.rs` in spirit but without the timeout-callback
/// machinery, which this kernel's core does not need.
#[macro_export]
macro_rules! add_test {
    ($name:ident, $test:block) => {
        #[test_case]
        const $name: $crate::TestCase = $crate::TestCase {
            name: stringify!($name),
            test: || $test,
        };
    };
}

/// Runs every registered test in sequence, printing a pass line for each.
/// Exits QEMU with a success code once all tests complete.
pub fn test_runner(tests: &[&TestCase]) -> ! {
    println!("running {} tests", tests.len());
    for test in tests {
        print!("test {} ... ", test.name);
        (test.test)();
        println!("ok");
    }
    use qemu_exit::QEMUExit;
    qemu_exit::AArch64::new().exit_success();
}

/// Parks the hart in a `wfe` loop. The last thing any entry point does,
/// whether bring-up finishes normally or a fatal error cuts it short.
pub fn halt() -> ! {
    loop {
        // SAFETY: `wfe` with interrupts masked simply parks the hart.
        unsafe { core::arch::asm!("wfe", options(nomem, nostack, preserves_flags)) };
    }
}

/// Masks all exceptions, prints the panic message, then parks the hart.
///
/// Lives here rather than in `src/main.rs` so that every linked binary —
/// the production kernel, and each `tests/*.rs` integration test, which
/// links only against this library — shares one definition instead of each
/// needing its own.
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    exception::mask_irqs();
    println!("PANIC: {info}");
    halt()
}

/// The entry point every linked binary supplies: the production kernel in
/// `src/main.rs`, and each `tests/*.rs` integration test via its own
/// `#[no_mangle] fn kernel_main() { test_main() }`. Resolved at link time
/// against [`boot`]'s `global_asm!` stub, exactly as `libkernel`'s
/// `kernel::init()` forwards to an `extern "Rust" { fn kernel_main(); }`
/// supplied by whichever binary is being linked.
#[cfg(test)]
#[no_mangle]
extern "C" fn kernel_main() -> ! {
    test_main();
    halt()
}
