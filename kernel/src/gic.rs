//! Generic Interrupt Controller (GICv2) driver: distributor + per-hart CPU
//! interface bring-up, line enable/mask/priority/target, acknowledge and
//! end-of-interrupt, and the IRQ-handler dispatch table.
//!
//! `src/board/irq.rs` is BCM2836-specific (per-core local timer enables),
//! so this module is written fresh in the same `tock_registers` idiom
//! (`register_bitfields!`, `register_structs!`, `ReadWrite`/`WriteOnly`
//! wrappers) against the real GICv2 register layout QEMU `virt` exposes,
//! following the `NonNull`-wrapped-register-block shape `kernel/src/uart.rs`
//! already establishes in this crate.

use core::ptr::NonNull;

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::{ReadOnly, ReadWrite, WriteOnly};
use tock_registers::{register_bitfields, register_structs};

use crate::config;
use crate::sync::{OnceLock, SpinLock};

/// Sentinel returned by [`acknowledge`] when no interrupt is pending.
pub const SPURIOUS: u32 = 1023;

register_bitfields! {
    u32,
    GICD_CTLR [
        ENABLE OFFSET(0) NUMBITS(1) [],
    ],
    GICD_TYPER [
        ITLINES OFFSET(0) NUMBITS(5) [],
    ],
    GICD_SGIR [
        SGIINTID OFFSET(0) NUMBITS(4) [],
        CPU_TARGET_LIST OFFSET(16) NUMBITS(8) [],
        TARGET_LIST_FILTER OFFSET(24) NUMBITS(2) [],
    ],
    GICC_CTLR [
        ENABLE OFFSET(0) NUMBITS(1) [],
    ],
    GICC_IAR [
        INTERRUPT_ID OFFSET(0) NUMBITS(10) [],
    ],
}

register_structs! {
    #[allow(non_snake_case)]
    Distributor {
        (0x000 => CTLR: ReadWrite<u32, GICD_CTLR::Register>),
        (0x004 => TYPER: ReadOnly<u32, GICD_TYPER::Register>),
        (0x008 => _reserved0),
        (0x080 => ISENABLER: [ReadWrite<u32>; 32]),
        (0x100 => _reserved1),
        (0x180 => ICENABLER: [ReadWrite<u32>; 32]),
        (0x200 => _reserved2),
        (0x280 => ICPENDR: [WriteOnly<u32>; 32]),
        (0x300 => _reserved3),
        (0x400 => IPRIORITYR: [ReadWrite<u8>; 1020]),
        (0x7f4 => _reserved4),
        (0x800 => ITARGETSR: [ReadWrite<u8>; 1020]),
        (0xbf4 => _reserved5),
        (0xc00 => ICFGR: [ReadWrite<u32>; 64]),
        (0xd00 => _reserved6),
        (0xf00 => SGIR: WriteOnly<u32, GICD_SGIR::Register>),
        (0xf04 => @END),
    }
}

register_structs! {
    #[allow(non_snake_case)]
    CpuInterface {
        (0x00 => CTLR: ReadWrite<u32, GICC_CTLR::Register>),
        (0x04 => PMR: ReadWrite<u32>),
        (0x08 => BPR: ReadWrite<u32>),
        (0x0c => IAR: ReadOnly<u32, GICC_IAR::Register>),
        (0x10 => EOIR: WriteOnly<u32>),
        (0x14 => @END),
    }
}

/// One registered line handler: a callback plus an opaque data pointer,
/// indexed by line number in the dispatch table.
#[derive(Clone, Copy)]
struct Handler {
    callback: fn(usize, u32),
    data: usize,
}

const NUM_LINES: usize = 1024;

struct Gic {
    distributor: NonNull<Distributor>,
    cpu_interface: NonNull<CpuInterface>,
    handlers: SpinLock<[Option<Handler>; NUM_LINES]>,
}

// SAFETY: every access is serialized by the owning `OnceLock`'s
// single-initialization discipline and the internal `SpinLock`.
unsafe impl Send for Gic {}
// SAFETY: see above.
unsafe impl Sync for Gic {}

impl Gic {
    fn distributor(&self) -> &Distributor {
        // SAFETY: mapped device memory for the life of the kernel.
        unsafe { self.distributor.as_ref() }
    }

    fn cpu_interface(&self) -> &CpuInterface {
        // SAFETY: mapped device memory for the life of the kernel.
        unsafe { self.cpu_interface.as_ref() }
    }
}

static GIC: OnceLock<Gic> = OnceLock::new();

/// Initializes the distributor and this hart's CPU interface: disable,
/// mask every line, clear pending bits, set SPIs to a middle priority
/// routed to hart 0 and level-triggered, re-enable; per-hart: mask
/// SGIs/PPIs, set their priorities, accept-all priority mask, no priority
/// grouping, enable the CPU interface.
///
/// # Safety
///
/// Must run exactly once, after the kernel identity map is installed and
/// before any IRQ is unmasked.
pub unsafe fn init() {
    let gic = Gic {
        // SAFETY: `config::GICD_BASE`/`GICC_BASE` are the fixed GICv2 MMIO
        // bases on QEMU `virt`, identity-mapped as device memory.
        distributor: unsafe {
            NonNull::new_unchecked(core::ptr::without_provenance_mut(config::GICD_BASE as usize))
        },
        // SAFETY: see above.
        cpu_interface: unsafe {
            NonNull::new_unchecked(core::ptr::without_provenance_mut(config::GICC_BASE as usize))
        },
        handlers: SpinLock::new([None; NUM_LINES]),
    };

    let distributor = gic.distributor();
    distributor.CTLR.write(GICD_CTLR::ENABLE::CLEAR);

    let num_lines = ((distributor.TYPER.read(GICD_TYPER::ITLINES) + 1) * 32) as usize;
    for word in &distributor.ICENABLER[..num_lines / 32] {
        word.set(u32::MAX);
    }
    for word in &distributor.ICPENDR[..num_lines / 32] {
        word.set(u32::MAX);
    }
    // Middle priority (0x80 of a 0-255 range), routed to hart 0, level-triggered.
    for byte in &distributor.IPRIORITYR[32..num_lines] {
        byte.set(0x80);
    }
    for byte in &distributor.ITARGETSR[32..num_lines] {
        byte.set(0b0000_0001);
    }
    for word in &distributor.ICFGR[2..num_lines / 16] {
        word.set(0);
    }
    distributor.CTLR.write(GICD_CTLR::ENABLE::SET);

    let cpu_interface = gic.cpu_interface();
    for word in &distributor.ICENABLER[..1] {
        word.set(u32::MAX);
    }
    for byte in &distributor.IPRIORITYR[..32] {
        byte.set(0x80);
    }
    cpu_interface.PMR.set(0xff);
    cpu_interface.BPR.set(0);
    cpu_interface.CTLR.write(GICC_CTLR::ENABLE::SET);

    GIC.set(gic);
}

fn gic() -> &'static Gic {
    GIC.get().expect("GIC used before init")
}

/// Unmasks `irq` at the distributor.
pub fn enable(irq: u32) {
    let distributor = gic().distributor();
    distributor.ISENABLER[irq as usize / 32].set(1 << (irq % 32));
}

/// Masks `irq` at the distributor.
pub fn disable(irq: u32) {
    let distributor = gic().distributor();
    distributor.ICENABLER[irq as usize / 32].set(1 << (irq % 32));
}

/// Sets `irq`'s priority (0 = highest).
pub fn set_priority(irq: u32, priority: u8) {
    gic().distributor().IPRIORITYR[irq as usize].set(priority);
}

/// Sets `irq`'s target-hart mask (bit `n` = hart `n`).
pub fn set_target(irq: u32, mask: u8) {
    gic().distributor().ITARGETSR[irq as usize].set(mask);
}

/// Reads the interrupt-acknowledge register, returning [`SPURIOUS`] when
/// no interrupt is pending.
pub fn acknowledge() -> u32 {
    gic().cpu_interface().IAR.read(GICC_IAR::INTERRUPT_ID)
}

/// Signals end-of-interrupt for `irq`.
pub fn end(irq: u32) {
    gic().cpu_interface().EOIR.set(irq);
}

/// Sends a software-generated interrupt (`irq`, one of lines 0-15) to the
/// harts in `target_mask` (bit `n` = hart `n`).
///
/// QEMU `virt`'s single-hart configuration never exercises the
/// multi-target encoding, but the GICD_SGIR write follows the GICv2
/// architecture so a future multi-hart build only needs to widen
/// `target_mask`.
pub fn send_software_interrupt(irq: u32, target_mask: u8) {
    debug_assert!(irq < 16, "SGIs are lines 0-15");
    gic().distributor().SGIR.write(
        GICD_SGIR::SGIINTID.val(irq)
            + GICD_SGIR::CPU_TARGET_LIST.val(target_mask as u32)
            + GICD_SGIR::TARGET_LIST_FILTER.val(0b00),
    );
}

/// Registers `callback` for `irq` in the line-indexed dispatch table.
pub fn register(irq: u32, callback: fn(usize, u32), data: usize) {
    gic().handlers.lock()[irq as usize] = Some(Handler { callback, data });
}

/// The top-level IRQ handler loop: acknowledge, dispatch (timer line is
/// special-cased by the caller before this runs), end, repeat until
/// acknowledge returns [`SPURIOUS`].
pub fn dispatch_pending(mut on_timer: impl FnMut()) {
    loop {
        let irq = acknowledge();
        if irq == SPURIOUS {
            break;
        }
        if irq == config::IRQ_TIMER {
            on_timer();
        } else if let Some(handler) = gic().handlers.lock()[irq as usize] {
            (handler.callback)(handler.data, irq);
        } else {
            crate::log!("spurious dispatch for unregistered irq {irq}");
        }
        end(irq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::add_test!(spurious_sentinel_is_out_of_line_range, {
        assert!(SPURIOUS >= NUM_LINES as u32);
    });
}
