//! VirtIO input driver: pre-posts an inbound event buffer per descriptor,
//! drains completions on IRQ into a circular event buffer, and feeds the
//! compositor's mouse and keyboard paths.
//!
//! Grounded on the asynchronous pre-post/drain/re-post cycle and the
//! `Virtqueue::repost` primitive built for it in [`crate::virtio`], itself
//! patterned on the descriptor free-list bookkeeping in
//! `e22ea588_*virtqueue.rs`.

use core::ptr::NonNull;

use crate::memory;
use crate::sync::SpinLock;
use crate::virtio::{self, Registers, Virtqueue};

const EVENT_TYPE_SYNC: u16 = 0;
const EVENT_TYPE_KEY: u16 = 1;
const EVENT_TYPE_REL: u16 = 2;
const EVENT_TYPE_ABS: u16 = 3;

const REL_X: u16 = 0;
const REL_Y: u16 = 1;
const ABS_X: u16 = 0;
const ABS_Y: u16 = 1;

const KEY_LEFT_BUTTON: u16 = 0x110;

const KEY_LEFT_SHIFT: u16 = 42;
const KEY_RIGHT_SHIFT: u16 = 54;
const KEY_LEFT_CTRL: u16 = 29;
const KEY_CAPS_LOCK: u16 = 58;

#[repr(C)]
#[derive(Clone, Copy)]
struct InputEvent {
    event_type: u16,
    code: u16,
    value: u32,
}

#[derive(Debug, Clone, Copy)]
pub enum Event {
    RelativeMotion { axis_is_y: bool, delta: i32 },
    AbsoluteMotion { axis_is_y: bool, value: i32 },
    Button { pressed: bool },
    Key { code: u16, pressed: bool },
}

const RING_CAPACITY: usize = 64;

struct KeyboardRing {
    buf: [u8; RING_CAPACITY],
    head: usize,
    tail: usize,
}

impl KeyboardRing {
    const fn empty() -> Self {
        Self { buf: [0; RING_CAPACITY], head: 0, tail: 0 }
    }

    fn push(&mut self, byte: u8) {
        let next = (self.tail + 1) % RING_CAPACITY;
        if next == self.head {
            return; // full: drop the oldest-pending byte's slot, i.e. the newest.
        }
        self.buf[self.tail] = byte;
        self.tail = next;
    }

    fn pop(&mut self) -> Option<u8> {
        if self.head == self.tail {
            return None;
        }
        let byte = self.buf[self.head];
        self.head = (self.head + 1) % RING_CAPACITY;
        Some(byte)
    }
}

static KEYBOARD: SpinLock<KeyboardRing> = SpinLock::new(KeyboardRing::empty());

#[derive(Default, Clone, Copy)]
struct Modifiers {
    shift: bool,
    ctrl: bool,
    caps_lock: bool,
}

/// Translates a scancode into ASCII given the current modifier state. Only
/// the US QWERTY row letters and digits are covered; anything else maps
/// to `None` and is dropped rather than queued.
fn scancode_to_ascii(code: u16, mods: Modifiers) -> Option<u8> {
    const ROW1: &[u8] = b"1234567890-=";
    const ROW1_SHIFT: &[u8] = b"!@#$%^&*()_+";
    const QWERTY: &[u8] = b"qwertyuiop";
    const ASDF: &[u8] = b"asdfghjkl";
    const ZXCV: &[u8] = b"zxcvbnm";

    let letter_case = |lower: u8| -> u8 {
        if mods.shift ^ mods.caps_lock {
            lower.to_ascii_uppercase()
        } else {
            lower
        }
    };

    match code {
        2..=13 => {
            let i = (code - 2) as usize;
            Some(if mods.shift { ROW1_SHIFT[i] } else { ROW1[i] })
        }
        16..=25 => Some(letter_case(QWERTY[(code - 16) as usize])),
        30..=38 => Some(letter_case(ASDF[(code - 30) as usize])),
        44..=50 => Some(letter_case(ZXCV[(code - 44) as usize])),
        57 => Some(b' '),
        28 => Some(b'\n'),
        14 => Some(0x08),
        _ => None,
    }
}

struct Inner {
    queue: Virtqueue,
    buffers: alloc::vec::Vec<*mut InputEvent>,
    modifiers: Modifiers,
}

// SAFETY: `buffers` holds pointers into dedicated per-descriptor scratch
// frames, owned exclusively by this driver and touched only from its
// IRQ handler or under its lock during setup.
unsafe impl Send for Inner {}

pub struct InputDevice {
    inner: SpinLock<Inner>,
}

/// Probes for an input device, negotiates, brings up its event queue, and
/// pre-posts one inbound buffer per descriptor.
pub fn probe() -> Option<InputDevice> {
    let slot = virtio::probe().into_iter().find(|s| s.device_id == virtio::DEVICE_ID_INPUT)?;
    // SAFETY: freshly discovered, unclaimed slot.
    let registers: NonNull<Registers> = unsafe { virtio::negotiate(slot.registers) };
    let mut queue = Virtqueue::new(registers, 0);

    let count = queue.size();
    let mut buffers = alloc::vec::Vec::with_capacity(count as usize);
    for _ in 0..count {
        let frame = memory::alloc_frame().expect("input driver buffer allocation failed");
        let addr = frame.addr();
        core::mem::forget(frame);
        let ptr: *mut InputEvent = core::ptr::without_provenance_mut(addr as usize);
        queue.submit_chain(&[(addr, core::mem::size_of::<InputEvent>() as u32, true)]);
        buffers.push(ptr);
    }
    queue.notify();

    virtio::set_driver_ok(registers);

    Some(InputDevice { inner: SpinLock::new(Inner { queue, buffers, modifiers: Modifiers::default() }) })
}

impl InputDevice {
    /// Drains every completed event off the used ring, re-posting each
    /// descriptor immediately, and dispatches each event to the
    /// compositor mouse/click paths or the keyboard ring buffer.
    pub fn handle_irq(&self, mut dispatch: impl FnMut(Event)) {
        let mut inner = self.inner.lock();
        while let Some((index, _len)) = inner.queue.pop_used() {
            let ptr = inner.buffers[index as usize];
            // SAFETY: the device has completed writing this descriptor's
            // buffer before posting it to the used ring.
            let event = unsafe { ptr.read() };

            if let Some(translated) = translate(event, &mut inner.modifiers) {
                if matches!(translated, Event::Key { pressed: true, .. }) {
                    if let Some(ascii) = last_ascii(event, inner.modifiers) {
                        KEYBOARD.lock().push(ascii);
                    }
                }
                dispatch(translated);
            }

            let addr = ptr as u64;
            inner.queue.repost(index, addr, core::mem::size_of::<InputEvent>() as u32);
        }
        inner.queue.notify();
    }
}

fn translate(event: InputEvent, modifiers: &mut Modifiers) -> Option<Event> {
    match event.event_type {
        EVENT_TYPE_SYNC => None,
        EVENT_TYPE_REL if event.code == REL_X || event.code == REL_Y => {
            Some(Event::RelativeMotion { axis_is_y: event.code == REL_Y, delta: event.value as i32 })
        }
        EVENT_TYPE_ABS if event.code == ABS_X || event.code == ABS_Y => {
            Some(Event::AbsoluteMotion { axis_is_y: event.code == ABS_Y, value: event.value as i32 })
        }
        EVENT_TYPE_KEY if event.code == KEY_LEFT_BUTTON => Some(Event::Button { pressed: event.value != 0 }),
        EVENT_TYPE_KEY => {
            let pressed = event.value != 0;
            match event.code {
                KEY_LEFT_SHIFT | KEY_RIGHT_SHIFT => modifiers.shift = pressed,
                KEY_LEFT_CTRL => modifiers.ctrl = pressed,
                KEY_CAPS_LOCK if pressed => modifiers.caps_lock = !modifiers.caps_lock,
                _ => {}
            }
            Some(Event::Key { code: event.code, pressed })
        }
        _ => None,
    }
}

fn last_ascii(event: InputEvent, modifiers: Modifiers) -> Option<u8> {
    if modifiers.ctrl {
        return None;
    }
    scancode_to_ascii(event.code, modifiers)
}

/// Pops the next buffered keyboard byte, if any (the `read` syscall's
/// fd=0 path).
pub fn read_keyboard_byte() -> Option<u8> {
    KEYBOARD.lock().pop()
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::add_test!(ring_wraps_without_overrunning_head, {
        let mut ring = KeyboardRing::empty();
        for i in 0..RING_CAPACITY as u8 * 2 {
            ring.push(i);
        }
        assert!(ring.pop().is_some());
    });

    crate::add_test!(scancode_translates_lowercase_and_shifted, {
        let plain = Modifiers::default();
        let shifted = Modifiers { shift: true, ..Modifiers::default() };
        assert_eq!(scancode_to_ascii(16, plain), Some(b'q'));
        assert_eq!(scancode_to_ascii(16, shifted), Some(b'Q'));
        assert_eq!(scancode_to_ascii(2, plain), Some(b'1'));
        assert_eq!(scancode_to_ascii(2, shifted), Some(b'!'));
    });
}
