//! VirtIO MMIO transport: device probe over the fixed slot band, feature
//! negotiation, modern split-virtqueue setup, and the synchronous and
//! asynchronous request protocols the device drivers in
//! [`crate::virtio::block`], [`crate::virtio::input`], and
//! [`crate::virtio::gpu`] build on.
//!
//! Grounded on `e22ea588_*virtqueue.rs`'s descriptor free list and
//! avail/used index bookkeeping (ported here from its legacy
//! single-contiguous-allocation layout to the modern split-physical-address
//! default) and on `e464cb61_*drivers-virtio.rs`'s probe-by-magic loop and
//! MMIO register layout, re-expressed through `tock_registers`
//! `register_structs!` to match this crate's own device-driver idiom
//! (`kernel/src/gic.rs`, `kernel/src/uart.rs`).

pub mod block;
pub mod gpu;
pub mod input;

use core::ptr::NonNull;
use core::sync::atomic::{fence, Ordering};

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::{ReadOnly, ReadWrite, WriteOnly};
use tock_registers::register_structs;

use crate::config;
use crate::memory;

const MAGIC: u32 = 0x7472_6976; // "virt" little-endian

/// Device-id register values the block/input/GPU drivers probe for.
pub const DEVICE_ID_BLOCK: u32 = 2;
pub const DEVICE_ID_INPUT: u32 = 18;
pub const DEVICE_ID_GPU: u32 = 16;

const STATUS_ACKNOWLEDGE: u32 = 1;
const STATUS_DRIVER: u32 = 2;
const STATUS_DRIVER_OK: u32 = 4;
const STATUS_FEATURES_OK: u32 = 8;

register_structs! {
    #[allow(non_snake_case)]
    pub Registers {
        (0x000 => MagicValue: ReadOnly<u32>),
        (0x004 => Version: ReadOnly<u32>),
        (0x008 => DeviceId: ReadOnly<u32>),
        (0x00c => VendorId: ReadOnly<u32>),
        (0x010 => DeviceFeatures: ReadOnly<u32>),
        (0x014 => DeviceFeaturesSel: WriteOnly<u32>),
        (0x018 => _reserved0),
        (0x020 => DriverFeatures: WriteOnly<u32>),
        (0x024 => DriverFeaturesSel: WriteOnly<u32>),
        (0x028 => _reserved1),
        (0x030 => QueueSel: WriteOnly<u32>),
        (0x034 => QueueNumMax: ReadOnly<u32>),
        (0x038 => QueueNum: WriteOnly<u32>),
        (0x03c => _reserved2),
        (0x044 => QueueReady: ReadWrite<u32>),
        (0x048 => _reserved3),
        (0x050 => QueueNotify: WriteOnly<u32>),
        (0x054 => _reserved4),
        (0x060 => InterruptStatus: ReadOnly<u32>),
        (0x064 => InterruptAck: WriteOnly<u32>),
        (0x068 => _reserved5),
        (0x070 => Status: ReadWrite<u32>),
        (0x074 => _reserved6),
        (0x080 => QueueDescLow: WriteOnly<u32>),
        (0x084 => QueueDescHigh: WriteOnly<u32>),
        (0x088 => _reserved7),
        (0x090 => QueueDriverLow: WriteOnly<u32>),
        (0x094 => QueueDriverHigh: WriteOnly<u32>),
        (0x098 => _reserved8),
        (0x0a0 => QueueDeviceLow: WriteOnly<u32>),
        (0x0a4 => QueueDeviceHigh: WriteOnly<u32>),
        (0x0a8 => _reserved9),
        (0x0fc => ConfigGeneration: ReadOnly<u32>),
        (0x100 => Config: [ReadWrite<u8>; 256]),
        (0x200 => @END),
    }
}

/// A slot found to hold a live device of `device_id`, not yet probed
/// further by a specific driver.
pub struct Slot {
    pub index: usize,
    pub registers: NonNull<Registers>,
    pub device_id: u32,
}

/// Scans every slot in the fixed MMIO band and returns those whose magic
/// value and device-id register indicate a live device.
pub fn probe() -> alloc::vec::Vec<Slot> {
    let mut found = alloc::vec::Vec::new();
    for index in 0..config::VIRTIO_MMIO_SLOTS {
        let addr = config::VIRTIO_MMIO_BASE + index as u64 * config::VIRTIO_MMIO_STRIDE;
        // SAFETY: every slot in the band is identity-mapped device memory.
        let registers: NonNull<Registers> =
            unsafe { NonNull::new_unchecked(core::ptr::without_provenance_mut(addr as usize)) };
        // SAFETY: reading the magic/device-id registers has no side effects.
        let regs = unsafe { registers.as_ref() };
        if regs.MagicValue.get() != MAGIC {
            continue;
        }
        let device_id = regs.DeviceId.get();
        if device_id == 0 {
            continue;
        }
        found.push(Slot { index, registers, device_id });
    }
    found
}

/// Runs the device/driver bring-up handshake common to every device type:
/// reset, acknowledge, driver, accept every offered feature, features-OK
/// on version >= 2, driver-OK.
///
/// # Safety
///
/// `registers` must point at a live, identity-mapped VirtIO-MMIO register
/// block that has not yet been claimed by another driver.
pub unsafe fn negotiate(registers: NonNull<Registers>) -> NonNull<Registers> {
    // SAFETY: caller guarantees `registers` is live device memory.
    let regs = unsafe { registers.as_ref() };
    regs.Status.set(0);
    regs.Status.set(STATUS_ACKNOWLEDGE);
    regs.Status.set(STATUS_ACKNOWLEDGE | STATUS_DRIVER);

    for selector in 0..2_u32 {
        regs.DeviceFeaturesSel.set(selector);
        let offered = regs.DeviceFeatures.get();
        regs.DriverFeaturesSel.set(selector);
        regs.DriverFeatures.set(offered);
    }

    if regs.Version.get() >= 2 {
        regs.Status.set(STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_FEATURES_OK);
        assert_eq!(
            regs.Status.get() & STATUS_FEATURES_OK,
            STATUS_FEATURES_OK,
            "device rejected negotiated features"
        );
    }

    registers
}

/// Marks device bring-up complete; the device may begin processing
/// requests from here on.
pub fn set_driver_ok(registers: NonNull<Registers>) {
    // SAFETY: caller-established invariant that `registers` is live.
    let regs = unsafe { registers.as_ref() };
    regs.Status.set(regs.Status.get() | STATUS_DRIVER_OK);
}

/// One descriptor in the split-virtqueue descriptor table (16 bytes).
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct Descriptor {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

const DESC_F_NEXT: u16 = 1;
const DESC_F_WRITE: u16 = 2;

#[repr(C)]
struct AvailHeader {
    flags: u16,
    idx: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct UsedElem {
    id: u32,
    len: u32,
}

#[repr(C)]
struct UsedHeader {
    flags: u16,
    idx: u16,
}

/// A single split virtqueue, backed by three separately allocated,
/// page-aligned regions (the "modern" layout, this crate's default):
/// descriptor table, available ring, used ring.
pub struct Virtqueue {
    registers: NonNull<Registers>,
    queue_index: u32,
    size: u16,
    desc: NonNull<Descriptor>,
    avail: NonNull<AvailHeader>,
    used: NonNull<UsedHeader>,
    free_head: u16,
    num_free: u16,
    last_used_idx: u16,
}

// SAFETY: every access to a `Virtqueue` in this kernel happens from a
// single hart, either under the owning driver's lock or exclusively from
// its IRQ handler.
unsafe impl Send for Virtqueue {}

fn avail_ring_ptr(avail: NonNull<AvailHeader>) -> *mut u16 {
    // SAFETY: the ring array immediately follows the 4-byte header within
    // the same allocation.
    unsafe { avail.as_ptr().add(1).cast::<u16>() }
}

fn used_ring_ptr(used: NonNull<UsedHeader>) -> *const UsedElem {
    // SAFETY: see `avail_ring_ptr`.
    unsafe { used.as_ptr().add(1).cast::<UsedElem>() }
}

impl Virtqueue {
    /// Selects queue `queue_index`, reads its maximum size, allocates a
    /// size no larger than [`config::DEFAULT_QUEUE_SIZE`], and installs
    /// the modern split-ring physical addresses.
    pub fn new(registers: NonNull<Registers>, queue_index: u32) -> Self {
        // SAFETY: caller-established invariant that `registers` is live.
        let regs = unsafe { registers.as_ref() };
        regs.QueueSel.set(queue_index);
        let max = regs.QueueNumMax.get();
        assert!(max > 0, "device rejected queue {queue_index}");
        let size = config::DEFAULT_QUEUE_SIZE.min(max) as u16;
        regs.QueueNum.set(size as u32);

        let desc = alloc_zeroed_pages::<Descriptor>(size as usize);
        let avail = alloc_zeroed_pages::<AvailHeader>(1);
        let used = alloc_zeroed_pages::<UsedHeader>(1);

        for i in 0..size {
            // SAFETY: `desc` has `size` live `Descriptor` slots.
            unsafe { (*desc.as_ptr().add(i as usize)).next = if i + 1 < size { i + 1 } else { 0 } };
        }

        regs.QueueDescLow.set(desc.as_ptr() as u64 as u32);
        regs.QueueDescHigh.set((desc.as_ptr() as u64 >> 32) as u32);
        regs.QueueDriverLow.set(avail.as_ptr() as u64 as u32);
        regs.QueueDriverHigh.set((avail.as_ptr() as u64 >> 32) as u32);
        regs.QueueDeviceLow.set(used.as_ptr() as u64 as u32);
        regs.QueueDeviceHigh.set((used.as_ptr() as u64 >> 32) as u32);
        regs.QueueReady.set(1);

        Self {
            registers,
            queue_index,
            size,
            desc,
            avail,
            used,
            free_head: 0,
            num_free: size,
            last_used_idx: 0,
        }
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    /// Claims a free descriptor for `addr`/`len`, chained to `next` if
    /// given, marked device-writable when `write` is set.
    fn claim(&mut self, addr: u64, len: u32, write: bool, next: Option<u16>) -> Option<u16> {
        if self.num_free == 0 {
            return None;
        }
        let index = self.free_head;
        // SAFETY: `index` is a descriptor this queue owns exclusively.
        unsafe {
            let desc = self.desc.as_ptr().add(index as usize);
            self.free_head = (*desc).next;
            (*desc).addr = addr;
            (*desc).len = len;
            (*desc).flags = (if write { DESC_F_WRITE } else { 0 }) | (if next.is_some() { DESC_F_NEXT } else { 0 });
            (*desc).next = next.unwrap_or(0);
        }
        self.num_free -= 1;
        Some(index)
    }

    /// Builds a descriptor chain from `segments` (address, length,
    /// device-writable) and submits the chain head to the available ring.
    /// Returns the head index.
    pub fn submit_chain(&mut self, segments: &[(u64, u32, bool)]) -> Option<u16> {
        let mut next: Option<u16> = None;
        for &(addr, len, write) in segments.iter().rev() {
            next = Some(self.claim(addr, len, write, next)?);
        }
        let head = next?;
        self.push_available(head);
        Some(head)
    }

    fn push_available(&mut self, head: u16) {
        // SAFETY: `self.avail` is a live page-aligned allocation for the
        // life of this queue.
        unsafe {
            let avail = self.avail.as_ptr();
            let idx = (*avail).idx;
            let ring = avail_ring_ptr(self.avail);
            ring.add((idx % self.size) as usize).write_volatile(head);
            fence(Ordering::Release);
            (*avail).idx = idx.wrapping_add(1);
        }
    }

    /// Rings the device's notify register for this queue.
    pub fn notify(&self) {
        // SAFETY: caller-established invariant that `self.registers` is live.
        let regs = unsafe { self.registers.as_ref() };
        regs.QueueNotify.set(self.queue_index);
    }

    /// Busy-waits for the used index to advance past `observed_idx`, then
    /// returns the completed descriptor's id and length.
    pub fn wait_for_completion(&mut self, observed_idx: u16) -> (u16, u32) {
        loop {
            // SAFETY: `self.used` is a live page-aligned allocation.
            let current = unsafe { (*self.used.as_ptr()).idx };
            if current != observed_idx {
                break;
            }
            core::hint::spin_loop();
        }
        fence(Ordering::Acquire);
        self.pop_used().expect("used index advanced but ring was empty")
    }

    /// The current used-ring index, to sample before submission.
    pub fn used_idx(&self) -> u16 {
        // SAFETY: see above.
        unsafe { (*self.used.as_ptr()).idx }
    }

    /// Drains one completed entry, returning its descriptor to the free
    /// list, or `None` if the device has produced nothing new.
    pub fn pop_used(&mut self) -> Option<(u16, u32)> {
        // SAFETY: `self.used` is a live page-aligned allocation.
        let current_idx = unsafe { (*self.used.as_ptr()).idx };
        if self.last_used_idx == current_idx {
            return None;
        }
        fence(Ordering::Acquire);
        let ring_idx = (self.last_used_idx % self.size) as usize;
        // SAFETY: `ring_idx` is within the ring's allocated capacity.
        let entry = unsafe { used_ring_ptr(self.used).add(ring_idx).read_volatile() };
        self.last_used_idx = self.last_used_idx.wrapping_add(1);

        // SAFETY: `entry.id` names a descriptor this queue allocated.
        unsafe {
            let desc = self.desc.as_ptr().add(entry.id as usize);
            (*desc).next = self.free_head;
        }
        self.free_head = entry.id as u16;
        self.num_free += 1;

        Some((entry.id as u16, entry.len))
    }

    /// Re-posts descriptor `index` as device-writable for `len` bytes
    /// without reclaiming it to the free list first, for the input
    /// driver's pre-post/drain/re-post cycle.
    pub fn repost(&mut self, index: u16, addr: u64, len: u32) {
        // SAFETY: `index` was previously claimed by this queue and is not
        // concurrently accessed by the device (the used entry already
        // referenced it as complete).
        unsafe {
            let desc = self.desc.as_ptr().add(index as usize);
            (*desc).addr = addr;
            (*desc).len = len;
            (*desc).flags = DESC_F_WRITE;
            (*desc).next = 0;
        }
        self.push_available(index);
    }
}

/// Allocates `count` page-rounded, zeroed frames and returns a pointer to
/// `T::default()`-sized slots within, identity-mapped so the physical and
/// virtual addresses coincide.
fn alloc_zeroed_pages<T>(count: usize) -> NonNull<T> {
    let bytes = (count * core::mem::size_of::<T>()).max(1);
    let frames = (bytes as u64).div_ceil(config::PAGE_SIZE) as usize;
    let region = memory::alloc_frames(frames.max(1)).expect("virtqueue ring allocation failed");
    let addr = region.addr();
    core::mem::forget(region);
    // SAFETY: freshly allocated, zeroed, identity-mapped frames.
    unsafe {
        core::ptr::without_provenance_mut::<u8>(addr as usize).write_bytes(0, frames * config::PAGE_SIZE as usize)
    };
    // SAFETY: `addr` is non-null (page allocator never returns frame 0 for
    // RAM, which is reserved by `memory::init`).
    unsafe { NonNull::new_unchecked(core::ptr::without_provenance_mut(addr as usize)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::add_test!(magic_constant_matches_ascii_virt, {
        assert_eq!(&MAGIC.to_le_bytes(), b"virt");
    });
}
