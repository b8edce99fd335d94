//! Supervisor-call dispatcher: decodes the syscall number and arguments
//! out of a [`SavedFrame`] and marshals them to the fixed table of
//! recognized calls (I/O, time, pid, exit, window ops).
//!
//! Grounded on `os/src/bin/kernel/exception/svc/mod.rs`'s `CallCode`
//! enum-over-register dispatch shape, generalized from that file's
//! two-call demo table to the full syscall table this kernel supports.

use crate::compositor;
use crate::exception::SavedFrame;
use crate::process;
use crate::timer;
use crate::uart;
use crate::virtio::input;

/// Negative sentinel returned for an unrecognized syscall number or a
/// recoverable failure.
const ERROR: i64 = -1;

const SYS_READ: u64 = 63;
const SYS_WRITE: u64 = 64;
const SYS_EXIT: u64 = 93;
const SYS_GET_TIME: u64 = 169;
const SYS_GETPID: u64 = 172;
const SYS_DRAW: u64 = 200;
const SYS_FLUSH: u64 = 201;
const SYS_CREATE_WINDOW: u64 = 210;
const SYS_WINDOW_DRAW: u64 = 211;
const SYS_COMPOSITOR_RENDER: u64 = 212;

/// Decodes `frame`'s syscall number/arguments, dispatches to the matching
/// handler below, and writes the return value back into `frame`'s `x0`.
///
/// Called with IRQs unmasked: the syscall handler re-enables interrupts
/// on entry so user I/O may block.
pub fn dispatch(frame: &mut SavedFrame) {
    let number = frame.syscall_number();
    let a0 = frame.syscall_arg(0);
    let a1 = frame.syscall_arg(1);
    let a2 = frame.syscall_arg(2);
    let a3 = frame.syscall_arg(3);
    let a4 = frame.syscall_arg(4);
    let a5 = frame.syscall_arg(5);

    let pid = process::current_pid().expect("syscall dispatched with no current process");

    let result = match number {
        SYS_READ => sys_read(pid, a0, a1, a2),
        SYS_WRITE => sys_write(pid, a0, a1, a2),
        SYS_EXIT => {
            process::exit_current(a0 as i64, frame);
            return;
        }
        SYS_GET_TIME => timer::jiffies() as i64,
        SYS_GETPID => i64::from(pid),
        SYS_DRAW => sys_draw(pid, a0, a1, a2, a3, a4),
        SYS_FLUSH | SYS_COMPOSITOR_RENDER => {
            compositor::render();
            0
        }
        SYS_CREATE_WINDOW => sys_create_window(pid, a0, a1, a2, a3, a4),
        SYS_WINDOW_DRAW => sys_window_draw(pid, a0, a1, a2, a3, a4, a5),
        _ => {
            crate::log!("unknown syscall {number} from pid {pid}");
            ERROR
        }
    };

    frame.set_return(result);
}

/// `read`: only fd=0 is honored, reading one character from the keyboard
/// buffer, blocking on `wfe` if empty and the process holds input focus.
fn sys_read(pid: u32, fd: u64, buf: u64, count: u64) -> i64 {
    if fd != 0 || count == 0 {
        return 0;
    }
    if compositor::focused_pid() != Some(pid) {
        return 0;
    }
    let byte = loop {
        if let Some(byte) = input::read_keyboard_byte() {
            break byte;
        }
        // SAFETY: `wfe` with IRQs unmasked simply waits for the next event
        // (a device completion or the timer tick); no memory is touched.
        unsafe { core::arch::asm!("wfe", options(nomem, nostack, preserves_flags)) };
    };
    // SAFETY: `buf` is a user-space address the caller is responsible for;
    // there is no user-pointer validation layer at the syscall seam.
    unsafe { core::ptr::without_provenance_mut::<u8>(buf as usize).write(byte) };
    1
}

/// `write`: fd 1/2 route to the caller's window if one exists, else to
/// the console.
fn sys_write(pid: u32, fd: u64, buf: u64, count: u64) -> i64 {
    if fd != 1 && fd != 2 {
        return ERROR;
    }
    let count = count as usize;
    // SAFETY: see `sys_read`'s note on the user-pointer trust boundary.
    let bytes = unsafe { core::slice::from_raw_parts(core::ptr::without_provenance::<u8>(buf as usize), count) };

    if let Some(window) = process::with_process(pid, |p| p.window).flatten() {
        compositor::write(window, bytes);
    } else {
        for &byte in bytes {
            crate::print!("{}", byte as char);
        }
    }
    count as i64
}

fn sys_draw(pid: u32, x: u64, y: u64, w: u64, h: u64, color: u64) -> i64 {
    let color = color as u32;
    if let Some(window) = process::with_process(pid, |p| p.window).flatten() {
        // A permission failure here is silent per the syscall table: the
        // compositor already logged it, and the fill simply has no effect.
        let _ = compositor::draw_rect(window, x as i32, y as i32, w as u32, h as u32, color, pid);
    } else {
        compositor::draw_framebuffer_rect(x as i32, y as i32, w as u32, h as u32, color);
    }
    0
}

fn sys_create_window(pid: u32, x: u64, y: u64, w: u64, h: u64, title_ptr: u64) -> i64 {
    let title = read_c_string(title_ptr);
    match compositor::create(x as i32, y as i32, w as u32, h as u32, &title, pid) {
        Ok(id) => i64::from(id),
        Err(_) => ERROR,
    }
}

/// `window_draw`: fills a rectangle in window `win_id`, subject to the
/// same ownership check as `draw_rect` (caller must own the window, or
/// be the init process). Ownership failures are silent per the syscall
/// table: the compositor logs a warning and the call still reports
/// success, matching "complete without effect" rather than a visible
/// error code.
fn sys_window_draw(pid: u32, win_id: u64, x: u64, y: u64, w: u64, h: u64, color: u64) -> i64 {
    let _ = compositor::draw_rect(win_id as u32, x as i32, y as i32, w as u32, h as u32, color as u32, pid);
    0
}

/// Reads a NUL-terminated string out of user memory, capped at a small
/// fixed length so a malformed pointer cannot run the kernel unbounded.
fn read_c_string(ptr: u64) -> alloc::string::String {
    const MAX_LEN: usize = 64;
    let mut out = alloc::string::String::new();
    for i in 0..MAX_LEN {
        // SAFETY: see `sys_read`'s note on the user-pointer trust boundary.
        let byte = unsafe { core::ptr::without_provenance::<u8>((ptr + i as u64) as usize).read() };
        if byte == 0 {
            break;
        }
        out.push(byte as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::add_test!(unknown_syscall_returns_negative_sentinel, {
        assert_eq!(ERROR, -1);
    });
}
