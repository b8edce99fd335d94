//! Board constants for QEMU's `virt` AArch64 machine.
//!
//! Centralized the way `src/architecture/config.rs` centralizes the
//! Raspberry Pi's board constants, so that magic numbers used by more than
//! one module (the page-table walker, the GIC driver, the VirtIO probe)
//! have a single source of truth.

/// Base of RAM.
pub const RAM_BASE: u64 = 0x4000_0000;

/// Size of the region the physical frame allocator owns, once reserved
/// regions (kernel image, early device maps) are excluded.
pub const RAM_SIZE: u64 = 1 << 30;

/// Size of the "DMA-eligible" zone at the bottom of RAM.
pub const DMA_ZONE_SIZE: u64 = 16 * 1024 * 1024;

/// GIC distributor base.
pub const GICD_BASE: u64 = 0x0800_0000;
/// GIC CPU interface base.
pub const GICC_BASE: u64 = 0x0801_0000;

/// UART base (PL011).
pub const UART_BASE: u64 = 0x0900_0000;

/// Start of the VirtIO MMIO probe band.
pub const VIRTIO_MMIO_BASE: u64 = 0x0A00_0000;
/// Stride between successive VirtIO MMIO slots.
pub const VIRTIO_MMIO_STRIDE: u64 = 0x200;
/// Number of VirtIO MMIO slots to probe.
pub const VIRTIO_MMIO_SLOTS: usize = 32;

/// Interrupt line for the non-secure physical timer.
pub const IRQ_TIMER: u32 = 27;
/// Interrupt line for the UART.
pub const IRQ_UART: u32 = 33;
/// Interrupt line of the first VirtIO MMIO slot.
pub const IRQ_VIRTIO_BASE: u32 = 48;

/// Timer ticks per second.
pub const HZ: u64 = 100;

/// Frame size used by the physical page allocator and the VMM.
pub const PAGE_SIZE: u64 = 4096;
/// `PAGE_SIZE.ilog2()`, kept as a constant to avoid repeated `ilog2` calls.
pub const PAGE_SHIFT: u32 = 12;

/// Fixed process-table capacity.
pub const MAX_PROCESSES: usize = 16;

/// Fixed window-table capacity.
pub const MAX_WINDOWS: usize = 16;

/// High virtual address at which every process's user stack is mapped.
pub const USER_STACK_TOP: u64 = 0xC000_0000;
/// Size of the user stack region.
pub const USER_STACK_SIZE: u64 = 1024 * 1024;

/// Default virtqueue size used for block/input/GPU devices.
pub const DEFAULT_QUEUE_SIZE: u16 = 16;

/// Framebuffer/display extent the GPU driver requests from the host and
/// the compositor renders into.
pub const FRAMEBUFFER_WIDTH: u32 = 800;
pub const FRAMEBUFFER_HEIGHT: u32 = 600;

/// Height in pixels of a window's title-bar strip.
pub const TITLE_BAR_HEIGHT: i32 = 20;
/// Size of the close-button box, inset from the title bar's right edge.
pub const CLOSE_BOX_SIZE: i32 = 16;
pub const CLOSE_BOX_INSET: i32 = 2;

/// Identifier of the main shell process, whose windows are born
/// "protected" (un-closable).
pub const SHELL_PID: u32 = 2;
/// Identifier of the init process, exempt from window-ownership checks.
pub const INIT_PID: u32 = 1;
