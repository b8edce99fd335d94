//! The initial boot sequence: the entry point the linker script points
//! `ENTRY(_start)` at, running with interrupts masked and the MMU off.
//! Zeroes BSS, installs a boot stack, and transfers to `kernel_main`.
//!
//! `kernel_main` is declared `extern "C"` below rather than defined here,
//! so that this stub — and the panic handler next to it in `src/lib.rs` —
//! live once in the library crate while the production binary
//! (`src/main.rs`) and each `tests/*.rs` integration test supply their own
//! `kernel_main`, resolved at link time. This mirrors `architecture::boot`'s
//! `extern "Rust" { fn kernel_main(); }` boundary in the reference kernel
//! this crate is built from.
//!
//! Grounded on `os/src/bin/kernel/boot.rs`'s `global_asm!` stub, stripped
//! of that file's higher-half virtual-offset relocation and per-core
//! dispatch (this kernel is single-hart and identity-mapped at entry, so
//! physical and link addresses already coincide; the MMU comes up later,
//! from Rust, rather than in the boot stub).

use core::arch::global_asm;

extern "C" {
    static __stack_top: u8;
    static __bss_start: u8;
    static __bss_end: u8;
    fn kernel_main() -> !;
}

global_asm!(
    r#"
.section .init
.global _start
_start:
    msr DAIFSet, 0b1111

    adrp x1, __bss_start
    add x1, x1, :lo12:__bss_start
    adrp x2, __bss_end
    add x2, x2, :lo12:__bss_end
0:
    cmp x1, x2
    b.hs 1f
    str xzr, [x1], #8
    b 0b
1:
    adrp x1, __stack_top
    add x1, x1, :lo12:__stack_top
    mov sp, x1

    bl {kernel_main}
    b .
"#,
    kernel_main = sym kernel_main,
);

/// The top of the boot stack, for diagnostics only.
pub fn stack_top() -> u64 {
    // SAFETY: `__stack_top` is a linker-defined symbol; only its address
    // is read.
    unsafe { &__stack_top as *const u8 as u64 }
}
