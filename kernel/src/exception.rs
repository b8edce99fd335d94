//! Exception entry and context: the fixed-layout saved register frame,
//! vector table installation, and dispatch to the synchronous/IRQ/SError
//! handlers.
//!
//! Grounded directly on `os/src/bin/kernel/exception/mod.rs` (`ExceptionClass`,
//! the `ExceptionSyndrome` bitfield, and its `global_asm!` vector-table
//! hookup) and `os/src/bin/kernel/execution/mod.rs` (the register-frame
//! save/restore shape). That file only shows the EL0-synchronous and IRQ
//! paths in the retrieved slice; this module adds EL1-synchronous and
//! SError handling, and drops the per-instruction-class sub-handler files
//! (`data_abort.rs`, `instruction_abort.rs`, `svc/mod.rs`) in favor of a
//! flat syscall-and-fault dispatch.

use core::arch::{asm, global_asm};
use core::fmt;

use macros::AsBits;

use crate::{gic, process, syscall, timer};

/// The exception class field of `ESR_EL1.EC`, used throughout exception
/// dispatch below.
#[derive(AsBits, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ExceptionClass {
    Unknown = 0b000_000,
    TrappedWfiWfe = 0b000_001,
    SvcAArch64 = 0b010_101,
    InstructionAbortEl0 = 0b100_000,
    InstructionAbortEl1 = 0b100_001,
    PcAlignmentFault = 0b100_010,
    DataAbortEl0 = 0b100_100,
    DataAbortEl1 = 0b100_101,
    SpAlignmentFault = 0b100_110,
    SError = 0b101_111,
    BreakpointEl0 = 0b110_000,
    BreakpointEl1 = 0b110_001,
}

impl ExceptionClass {
    fn from_esr(esr: u64) -> Self {
        let ec = (esr >> 26) & 0x3f;
        // Any class this kernel does not enumerate is treated as `Unknown`
        // for dispatch purposes: only SVC is distinguished from "everything
        // else is fatal".
        match ec {
            0b000_000 => Self::Unknown,
            0b000_001 => Self::TrappedWfiWfe,
            0b010_101 => Self::SvcAArch64,
            0b100_000 => Self::InstructionAbortEl0,
            0b100_001 => Self::InstructionAbortEl1,
            0b100_010 => Self::PcAlignmentFault,
            0b100_100 => Self::DataAbortEl0,
            0b100_101 => Self::DataAbortEl1,
            0b100_110 => Self::SpAlignmentFault,
            0b101_111 => Self::SError,
            0b110_000 => Self::BreakpointEl0,
            0b110_001 => Self::BreakpointEl1,
            _ => Self::Unknown,
        }
    }
}

/// The fixed-layout block saved on the kernel stack on every exception
/// entry from EL0 or EL1: 31 general registers, the exception-link
/// register, the saved program-status register, and the user stack
/// pointer.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SavedFrame {
    /// `x0`-`x30`, in order. `x0` carries the syscall return value back to
    /// user space on return.
    pub regs: [u64; 31],
    pub sp_el0: u64,
    pub elr_el1: u64,
    pub spsr_el1: u64,
}

impl SavedFrame {
    pub const fn zeroed() -> Self {
        Self {
            regs: [0; 31],
            sp_el0: 0,
            elr_el1: 0,
            spsr_el1: 0,
        }
    }

    /// `EL0t`, interrupts unmasked, used to build a fresh process's initial
    /// frame.
    pub const EL0_UNMASKED: u64 = 0;

    pub fn syscall_number(&self) -> u64 {
        self.regs[8]
    }

    pub fn syscall_arg(&self, n: usize) -> u64 {
        self.regs[n]
    }

    pub fn set_return(&mut self, value: i64) {
        self.regs[0] = value as u64;
    }
}

impl fmt::Debug for SavedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SavedFrame {{ elr={:#x} spsr={:#x} sp_el0={:#x} x0={:#x} }}",
            self.elr_el1, self.spsr_el1, self.sp_el0, self.regs[0]
        )
    }
}

/// Reads `ESR_EL1` and `FAR_EL1` (syndrome and fault address), used by
/// every synchronous-exception path.
fn read_syndrome() -> (u64, u64) {
    let esr: u64;
    let far: u64;
    // SAFETY: reads only ESR_EL1/FAR_EL1.
    unsafe {
        asm!(
            "mrs {esr}, ESR_EL1",
            "mrs {far}, FAR_EL1",
            esr = out(reg) esr,
            far = out(reg) far,
            options(nomem, nostack, preserves_flags),
        );
    }
    (esr, far)
}

/// Synchronous exception taken from EL0: exception class 0x15 (SVC)
/// dispatches to the syscall handler; everything else is fatal for the
/// user process.
extern "C" fn synchronous_from_el0(frame: &mut SavedFrame) {
    let (esr, far) = read_syndrome();
    let class = ExceptionClass::from_esr(esr);
    if class == ExceptionClass::SvcAArch64 {
        // Interrupts are re-enabled for the duration of the syscall handler
        // so user I/O may block on the timer or a device IRQ.
        unmask_irqs();
        syscall::dispatch(frame);
        mask_irqs();
    } else {
        crate::log!("fatal-process: {class:?} esr={esr:#x} far={far:#x} frame={frame:?}");
        process::exit_current(-1, frame);
    }
}

/// Synchronous exception taken from EL1: a kernel fault or, in debug
/// builds, an SVC (illegal at EL1).
extern "C" fn synchronous_from_el1(frame: &SavedFrame) -> ! {
    let (esr, far) = read_syndrome();
    let class = ExceptionClass::from_esr(esr);
    panic!("fatal-kernel: EL1 synchronous exception {class:?} esr={esr:#x} far={far:#x} frame={frame:?}");
}

/// IRQ taken from either EL0 or EL1. Dispatches through the GIC, handling
/// the timer line specially so it can return a different process's saved
/// frame to the caller.
extern "C" fn irq(frame: &mut SavedFrame) {
    let mut next_frame: Option<*mut SavedFrame> = None;
    gic::dispatch_pending(|| {
        timer::handle_tick(|| {
            next_frame = Some(process::schedule(frame as *mut SavedFrame));
        });
    });
    if let Some(next) = next_frame {
        // SAFETY: `schedule` returns a pointer into the newly-selected
        // process's kernel stack, which outlives this handler's return.
        unsafe { *frame = *next };
    }
}

/// SError: always fatal.
extern "C" fn serror(frame: &SavedFrame) -> ! {
    let (esr, far) = read_syndrome();
    panic!("fatal-kernel: SError esr={esr:#x} far={far:#x} frame={frame:?}");
}

/// Masks all exception types.
pub fn mask_irqs() {
    // SAFETY: touches only DAIF.
    unsafe { asm!("msr DAIFSet, 0b1111", options(nomem, nostack, preserves_flags)) };
}

/// Unmasks IRQs (leaves FIQ/SError/Debug masked); used on entry to the
/// syscall handler so user I/O may block.
pub fn unmask_irqs() {
    // SAFETY: touches only DAIF.
    unsafe { asm!("msr DAIFClr, 0b0010", options(nomem, nostack, preserves_flags)) };
}

// The vector table: 16 entries of 0x80 bytes each (4 exception types ×
// 4 entry sources), 2 KiB aligned as `VBAR_EL1` requires. Each entry pushes
// the fixed `SavedFrame` layout onto the current kernel stack, calls the
// matching Rust handler with a pointer to it, then pops the (possibly
// rewritten, in the IRQ case) frame back out and `eret`s.
global_asm!(
    r#"
.macro SAVE_FRAME
    sub sp, sp, #{frame_size}
    stp x0, x1, [sp, #0]
    stp x2, x3, [sp, #16]
    stp x4, x5, [sp, #32]
    stp x6, x7, [sp, #48]
    stp x8, x9, [sp, #64]
    stp x10, x11, [sp, #80]
    stp x12, x13, [sp, #96]
    stp x14, x15, [sp, #112]
    stp x16, x17, [sp, #128]
    stp x18, x19, [sp, #144]
    stp x20, x21, [sp, #160]
    stp x22, x23, [sp, #176]
    stp x24, x25, [sp, #192]
    stp x26, x27, [sp, #208]
    stp x28, x29, [sp, #224]
    str x30, [sp, #240]
    mrs x0, sp_el0
    mrs x1, elr_el1
    mrs x2, spsr_el1
    stp x0, x1, [sp, #248]
    str x2, [sp, #264]
.endm

.macro RESTORE_FRAME
    ldp x0, x1, [sp, #248]
    ldr x2, [sp, #264]
    msr sp_el0, x0
    msr elr_el1, x1
    msr spsr_el1, x2
    ldp x0, x1, [sp, #0]
    ldp x2, x3, [sp, #16]
    ldp x4, x5, [sp, #32]
    ldp x6, x7, [sp, #48]
    ldp x8, x9, [sp, #64]
    ldp x10, x11, [sp, #80]
    ldp x12, x13, [sp, #96]
    ldp x14, x15, [sp, #112]
    ldp x16, x17, [sp, #128]
    ldp x18, x19, [sp, #144]
    ldp x20, x21, [sp, #160]
    ldp x22, x23, [sp, #176]
    ldp x24, x25, [sp, #192]
    ldp x26, x27, [sp, #208]
    ldp x28, x29, [sp, #224]
    ldr x30, [sp, #240]
    add sp, sp, #{frame_size}
.endm

.macro UNHANDLED_ENTRY
    b .
.endm

.balign 2048
.global exception_vector_table
exception_vector_table:
// EL1 with SP_EL0
.balign 128
UNHANDLED_ENTRY
.balign 128
UNHANDLED_ENTRY
.balign 128
UNHANDLED_ENTRY
.balign 128
UNHANDLED_ENTRY
// EL1 with SP_EL1 (current-EL handlers, used while already in the kernel)
.balign 128
    SAVE_FRAME
    mov x0, sp
    bl {sync_el1}
.balign 128
    SAVE_FRAME
    mov x0, sp
    bl {irq_handler}
    RESTORE_FRAME
    eret
.balign 128
UNHANDLED_ENTRY
.balign 128
    SAVE_FRAME
    mov x0, sp
    bl {serror_handler}
// Lower EL, AArch64
.balign 128
    SAVE_FRAME
    mov x0, sp
    bl {sync_el0}
    RESTORE_FRAME
    eret
.balign 128
    SAVE_FRAME
    mov x0, sp
    bl {irq_handler}
    RESTORE_FRAME
    eret
.balign 128
UNHANDLED_ENTRY
.balign 128
    SAVE_FRAME
    mov x0, sp
    bl {serror_handler}
// Lower EL, AArch32 (never used; this kernel only runs AArch64 binaries)
.balign 128
UNHANDLED_ENTRY
.balign 128
UNHANDLED_ENTRY
.balign 128
UNHANDLED_ENTRY
.balign 128
UNHANDLED_ENTRY
"#,
    frame_size = const core::mem::size_of::<SavedFrame>(),
    sync_el0 = sym synchronous_from_el0,
    sync_el1 = sym synchronous_from_el1,
    irq_handler = sym irq,
    serror_handler = sym serror,
);

extern "C" {
    static exception_vector_table: u8;
}

/// Installs the vector table at `VBAR_EL1` and brings up the GIC.
///
/// # Safety
///
/// Must run exactly once, early in boot, before any exception can fire.
pub unsafe fn init() {
    // SAFETY: `exception_vector_table`'s address is the only value written,
    // and it is a valid, 2 KiB-aligned vector table built above.
    unsafe {
        asm!(
            "msr VBAR_EL1, {base}",
            "isb",
            base = in(reg) &exception_vector_table as *const u8,
            options(nostack, preserves_flags),
        );
    }
    // SAFETY: runs once, before any IRQ is unmasked.
    unsafe { gic::init() };
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::add_test!(exception_class_decodes_svc, {
        let esr = (0b010_101_u64) << 26;
        assert_eq!(ExceptionClass::from_esr(esr), ExceptionClass::SvcAArch64);
    });

    crate::add_test!(saved_frame_syscall_fields_match_linux_abi, {
        let mut frame = SavedFrame::zeroed();
        frame.regs[8] = 64;
        frame.regs[0] = 1;
        assert_eq!(frame.syscall_number(), 64);
        frame.set_return(-1);
        assert_eq!(frame.regs[0] as i64, -1);
    });
}
