//! VirtIO block driver: one request is a header
//! (request type + sector number) plus a data buffer plus a one-byte
//! status, submitted as a three-descriptor chain and awaited synchronously.
//!
//! Grounded on the descriptor-chain submission dance from
//! `e22ea588_*virtqueue.rs`, applied to
//! [`crate::virtio::Virtqueue::submit_chain`] instead of that file's
//! single-descriptor `add_buf`.

use crate::memory;
use crate::sync::SpinLock;
use crate::virtio::{self, Registers, Virtqueue};

const SECTOR_SIZE: u64 = 512;

const TYPE_IN: u32 = 0;
const TYPE_OUT: u32 = 1;

const STATUS_OK: u8 = 0;

#[repr(C)]
struct RequestHeader {
    request_type: u32,
    reserved: u32,
    sector: u64,
}

struct Inner {
    queue: Virtqueue,
    /// Scratch header/status buffers, reused across requests since the
    /// driver is single-issue and synchronous; concurrent callers are
    /// serialized implicitly.
    header: *mut RequestHeader,
    status: *mut u8,
}

// SAFETY: every field is either owned outright or a pointer into a
// dedicated, never-aliased scratch allocation, and all access is
// serialized by the enclosing `SpinLock`.
unsafe impl Send for Inner {}

pub struct BlockDevice {
    inner: SpinLock<Inner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoError;

/// Probes the MMIO band for a block device, negotiates features, and
/// brings up its single request queue.
pub fn probe() -> Option<BlockDevice> {
    let slot = virtio::probe().into_iter().find(|s| s.device_id == virtio::DEVICE_ID_BLOCK)?;
    // SAFETY: the slot was just discovered by `virtio::probe` and is not
    // yet claimed by any other driver.
    let registers: core::ptr::NonNull<Registers> = unsafe { virtio::negotiate(slot.registers) };
    let queue = Virtqueue::new(registers, 0);
    virtio::set_driver_ok(registers);

    let header = alloc_scratch::<RequestHeader>();
    let status = alloc_scratch::<u8>();

    Some(BlockDevice { inner: SpinLock::new(Inner { queue, header, status }) })
}

fn alloc_scratch<T>() -> *mut T {
    let frame = memory::alloc_frame().expect("block driver scratch allocation failed");
    let addr = frame.addr();
    core::mem::forget(frame);
    core::ptr::without_provenance_mut(addr as usize)
}

impl BlockDevice {
    /// Reads `buf.len()` bytes (must be a multiple of 512) starting at
    /// `sector` into `buf`.
    pub fn read(&self, sector: u64, buf: &mut [u8]) -> Result<(), IoError> {
        self.request(TYPE_IN, sector, buf.as_mut_ptr() as u64, buf.len() as u32, true)
    }

    /// Writes `buf` (must be a multiple of 512 bytes) starting at `sector`.
    pub fn write(&self, sector: u64, buf: &[u8]) -> Result<(), IoError> {
        self.request(TYPE_OUT, sector, buf.as_ptr() as u64, buf.len() as u32, false)
    }

    fn request(&self, request_type: u32, sector: u64, data_addr: u64, data_len: u32, data_writable: bool) -> Result<(), IoError> {
        let mut inner = self.inner.lock();
        // SAFETY: `inner.header`/`inner.status` are dedicated scratch
        // frames exclusively owned by this driver, accessed under its lock.
        unsafe {
            inner.header.write(RequestHeader { request_type, reserved: 0, sector });
            inner.status.write(0xff);
        }

        let observed = inner.queue.used_idx();
        let header_addr = inner.header as u64;
        let status_addr = inner.status as u64;
        inner
            .queue
            .submit_chain(&[(header_addr, core::mem::size_of::<RequestHeader>() as u32, false), (data_addr, data_len, data_writable), (status_addr, 1, true)])
            .expect("block queue unexpectedly full for a single in-flight request");
        inner.queue.notify();
        inner.queue.wait_for_completion(observed);

        // SAFETY: the device has completed the request, so it no longer
        // writes to `inner.status`.
        let status = unsafe { inner.status.read() };
        if status == STATUS_OK {
            Ok(())
        } else {
            Err(IoError)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::add_test!(sector_size_is_512, {
        assert_eq!(SECTOR_SIZE, 512);
    });
}
