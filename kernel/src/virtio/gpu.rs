//! VirtIO GPU driver: discovers the display mode, creates a host-side 2D
//! resource backed by guest memory, binds it to scanout 0, and exposes a
//! `flush(x, y, w, h)` that transfers a dirty rectangle to the host and
//! commits it to the screen.
//!
//! No source in the retrieval pack implements VirtIO-GPU; this module
//! follows the VirtIO-GPU command/response wire semantics directly,
//! reusing the request/response descriptor-pair pattern
//! [`crate::virtio::block`] establishes for synchronous, busy-waited
//! requests.

use core::ptr::NonNull;

use crate::config;
use crate::memory;
use crate::sync::SpinLock;
use crate::virtio::{self, Registers, Virtqueue};

const CMD_GET_DISPLAY_INFO: u32 = 0x0100;
const CMD_RESOURCE_CREATE_2D: u32 = 0x0101;
const CMD_RESOURCE_ATTACH_BACKING: u32 = 0x0106;
const CMD_SET_SCANOUT: u32 = 0x0103;
const CMD_TRANSFER_TO_HOST_2D: u32 = 0x0105;
const CMD_RESOURCE_FLUSH: u32 = 0x0104;

const RESP_OK_NODATA: u32 = 0x1100;

/// ARGB8888 as the guest supplies it to `RESOURCE_CREATE_2D`.
const FORMAT_ARGB8888: u32 = 2;

const RESOURCE_ID: u32 = 1;
const SCANOUT_ID: u32 = 0;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CtrlHeader {
    command_type: u32,
    flags: u32,
    fence_id: u64,
    ctx_id: u32,
    padding: u32,
}

#[repr(C)]
struct Rect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

#[repr(C)]
struct ResourceCreate2d {
    header: CtrlHeader,
    resource_id: u32,
    format: u32,
    width: u32,
    height: u32,
}

#[repr(C)]
struct MemEntry {
    addr: u64,
    length: u32,
    padding: u32,
}

#[repr(C)]
struct ResourceAttachBacking {
    header: CtrlHeader,
    resource_id: u32,
    num_entries: u32,
    entry: MemEntry,
}

#[repr(C)]
struct SetScanout {
    header: CtrlHeader,
    rect: Rect,
    scanout_id: u32,
    resource_id: u32,
}

#[repr(C)]
struct TransferToHost2d {
    header: CtrlHeader,
    rect: Rect,
    offset: u64,
    resource_id: u32,
    padding: u32,
}

#[repr(C)]
struct ResourceFlush {
    header: CtrlHeader,
    rect: Rect,
    resource_id: u32,
    padding: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct DisplayOne {
    rect: [u32; 4],
    enabled: u32,
    flags: u32,
}

#[repr(C)]
struct DisplayInfoResponse {
    header: CtrlHeader,
    displays: [DisplayOne; 16],
}

impl Default for Rect {
    fn default() -> Self {
        Self { x: 0, y: 0, width: 0, height: 0 }
    }
}

impl Default for DisplayOne {
    fn default() -> Self {
        Self { rect: [0; 4], enabled: 0, flags: 0 }
    }
}

struct Inner {
    queue: Virtqueue,
    /// One page reused as scratch for every request; the driver is
    /// single-issue and synchronous like the block driver.
    request: *mut u8,
    response: *mut u8,
    framebuffer: *mut u32,
}

// SAFETY: every pointer field names a dedicated scratch or backing-store
// allocation owned exclusively by this driver, touched only under `inner`'s
// lock.
unsafe impl Send for Inner {}

pub struct GpuDevice {
    inner: SpinLock<Inner>,
    width: u32,
    height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuError;

fn alloc_scratch_page() -> *mut u8 {
    let frame = memory::alloc_frame().expect("GPU driver scratch allocation failed");
    let addr = frame.addr();
    core::mem::forget(frame);
    core::ptr::without_provenance_mut(addr as usize)
}

/// Probes for a GPU device, negotiates, brings up its control queue, and
/// runs the display/resource/scanout bring-up sequence.
pub fn probe() -> Option<GpuDevice> {
    let slot = virtio::probe().into_iter().find(|s| s.device_id == virtio::DEVICE_ID_GPU)?;
    // SAFETY: freshly discovered, unclaimed slot.
    let registers: NonNull<Registers> = unsafe { virtio::negotiate(slot.registers) };
    let queue = Virtqueue::new(registers, 0);
    virtio::set_driver_ok(registers);

    let request = alloc_scratch_page();
    let response = alloc_scratch_page();

    let width = config::FRAMEBUFFER_WIDTH;
    let height = config::FRAMEBUFFER_HEIGHT;
    let fb_bytes = (width * height * 4) as u64;
    let fb_frames = fb_bytes.div_ceil(config::PAGE_SIZE) as usize;
    let backing = memory::alloc_frames(fb_frames).expect("GPU framebuffer backing allocation failed");
    let framebuffer = backing.addr();
    core::mem::forget(backing);

    let mut inner = Inner {
        queue,
        request,
        response,
        framebuffer: core::ptr::without_provenance_mut(framebuffer as usize),
    };

    run_get_display_info(&mut inner);
    run_resource_create_2d(&mut inner, RESOURCE_ID, width, height);
    run_resource_attach_backing(&mut inner, RESOURCE_ID, framebuffer, fb_bytes as u32);
    run_set_scanout(&mut inner, SCANOUT_ID, RESOURCE_ID, width, height);

    Some(GpuDevice { inner: SpinLock::new(inner), width, height })
}

/// Submits one command/response descriptor pair and busy-waits for
/// completion, exactly the pattern [`crate::virtio::block`] uses.
fn run_command(inner: &mut Inner, request_len: u32, response_len: u32) {
    let observed = inner.queue.used_idx();
    let req_addr = inner.request as u64;
    let resp_addr = inner.response as u64;
    inner
        .queue
        .submit_chain(&[(req_addr, request_len, false), (resp_addr, response_len, true)])
        .expect("GPU control queue unexpectedly full for a single in-flight request");
    inner.queue.notify();
    inner.queue.wait_for_completion(observed);
}

fn run_get_display_info(inner: &mut Inner) {
    let header = CtrlHeader { command_type: CMD_GET_DISPLAY_INFO, ..Default::default() };
    // SAFETY: `inner.request`/`inner.response` are dedicated scratch pages
    // large enough for every command this driver issues.
    unsafe { (inner.request as *mut CtrlHeader).write(header) };
    run_command(inner, core::mem::size_of::<CtrlHeader>() as u32, core::mem::size_of::<DisplayInfoResponse>() as u32);
}

fn run_resource_create_2d(inner: &mut Inner, resource_id: u32, width: u32, height: u32) {
    let cmd = ResourceCreate2d {
        header: CtrlHeader { command_type: CMD_RESOURCE_CREATE_2D, ..Default::default() },
        resource_id,
        format: FORMAT_ARGB8888,
        width,
        height,
    };
    // SAFETY: see `run_get_display_info`.
    unsafe { (inner.request as *mut ResourceCreate2d).write(cmd) };
    run_command(inner, core::mem::size_of::<ResourceCreate2d>() as u32, core::mem::size_of::<CtrlHeader>() as u32);
    assert_ok(inner);
}

fn run_resource_attach_backing(inner: &mut Inner, resource_id: u32, addr: u64, length: u32) {
    let cmd = ResourceAttachBacking {
        header: CtrlHeader { command_type: CMD_RESOURCE_ATTACH_BACKING, ..Default::default() },
        resource_id,
        num_entries: 1,
        entry: MemEntry { addr, length, padding: 0 },
    };
    // SAFETY: see `run_get_display_info`.
    unsafe { (inner.request as *mut ResourceAttachBacking).write(cmd) };
    run_command(inner, core::mem::size_of::<ResourceAttachBacking>() as u32, core::mem::size_of::<CtrlHeader>() as u32);
    assert_ok(inner);
}

fn run_set_scanout(inner: &mut Inner, scanout_id: u32, resource_id: u32, width: u32, height: u32) {
    let cmd = SetScanout {
        header: CtrlHeader { command_type: CMD_SET_SCANOUT, ..Default::default() },
        rect: Rect { x: 0, y: 0, width, height },
        scanout_id,
        resource_id,
    };
    // SAFETY: see `run_get_display_info`.
    unsafe { (inner.request as *mut SetScanout).write(cmd) };
    run_command(inner, core::mem::size_of::<SetScanout>() as u32, core::mem::size_of::<CtrlHeader>() as u32);
    assert_ok(inner);
}

fn assert_ok(inner: &Inner) {
    // SAFETY: the device has completed the request, so it no longer
    // writes to the response buffer.
    let command_type = unsafe { (*(inner.response as *const CtrlHeader)).command_type };
    assert_eq!(command_type, RESP_OK_NODATA, "GPU device rejected a control command");
}

impl GpuDevice {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// The guest-memory framebuffer backing store the compositor renders
    /// directly into. Valid for the life of the device.
    pub fn framebuffer_mut(&self) -> *mut u32 {
        self.inner.lock().framebuffer
    }

    /// Transfers the dirty rectangle `(x, y, w, h)` to the host and commits
    /// it to the screen: `TRANSFER_TO_HOST_2D` followed by `RESOURCE_FLUSH`.
    pub fn flush(&self, x: u32, y: u32, w: u32, h: u32) -> Result<(), GpuError> {
        let mut inner = self.inner.lock();
        let rect = Rect { x, y, width: w, height: h };

        let transfer = TransferToHost2d {
            header: CtrlHeader { command_type: CMD_TRANSFER_TO_HOST_2D, ..Default::default() },
            rect,
            offset: (y as u64) * (self.width as u64) * 4 + (x as u64) * 4,
            resource_id: RESOURCE_ID,
            padding: 0,
        };
        // SAFETY: `inner.request` is a dedicated scratch page.
        unsafe { (inner.request as *mut TransferToHost2d).write(transfer) };
        run_command(&mut inner, core::mem::size_of::<TransferToHost2d>() as u32, core::mem::size_of::<CtrlHeader>() as u32);

        let flush = ResourceFlush {
            header: CtrlHeader { command_type: CMD_RESOURCE_FLUSH, ..Default::default() },
            rect: Rect { x, y, width: w, height: h },
            resource_id: RESOURCE_ID,
            padding: 0,
        };
        // SAFETY: see above.
        unsafe { (inner.request as *mut ResourceFlush).write(flush) };
        run_command(&mut inner, core::mem::size_of::<ResourceFlush>() as u32, core::mem::size_of::<CtrlHeader>() as u32);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::add_test!(argb8888_format_id_is_two, {
        assert_eq!(FORMAT_ARGB8888, 2);
    });

    crate::add_test!(control_header_is_24_bytes, {
        assert_eq!(core::mem::size_of::<CtrlHeader>(), 24);
    });
}
