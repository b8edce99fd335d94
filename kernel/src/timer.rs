//! Periodic timer: programs the virtual timer's compare register for
//! fixed-rate ticks, maintains the monotonic "jiffies" counter, walks the
//! software-timer list, and hands control to the scheduler on every firing.
//!
//! Grounded on the `CNTP_CTL_EL0`/`CNTP_TVAL_EL0` reprogramming sequence
//! seen in `src/board/irq.rs` and the inline `CNTP_TVAL_EL0` reprogram in
//! `os/src/bin/kernel/exception/mod.rs`'s IRQ handler, ported from
//! `aarch64-cpu` register wrappers (not a dependency of this crate) to the
//! inline-`asm!` idiom `kernel/src/vm.rs` already uses for system-register
//! access.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::config;
use crate::gic;
use crate::sync::SpinLock;

static JIFFIES: AtomicU64 = AtomicU64::new(0);
static TICKS_PER_PERIOD: AtomicU64 = AtomicU64::new(0);

/// A one-shot software timer callback, invoked from the tick handler once
/// `deadline` has passed.
struct SoftTimer {
    deadline: u64,
    callback: fn(usize),
    data: usize,
}

static SOFT_TIMERS: SpinLock<alloc::vec::Vec<SoftTimer>> = SpinLock::new(alloc::vec::Vec::new());

fn read_freq() -> u64 {
    let freq: u64;
    // SAFETY: reads only CNTFRQ_EL0.
    unsafe {
        core::arch::asm!("mrs {freq}, CNTFRQ_EL0", freq = out(reg) freq, options(nomem, nostack, preserves_flags));
    }
    freq
}

fn read_counter() -> u64 {
    let value: u64;
    // SAFETY: reads only CNTPCT_EL0, with an isb to prevent the read from
    // being hoisted ahead of program order.
    unsafe {
        core::arch::asm!(
            "isb",
            "mrs {value}, CNTPCT_EL0",
            value = out(reg) value,
            options(nomem, nostack, preserves_flags),
        );
    }
    value
}

fn write_compare(ticks_from_now: u64) {
    // SAFETY: writes only CNTP_TVAL_EL0.
    unsafe {
        core::arch::asm!("msr CNTP_TVAL_EL0, {v}", v = in(reg) ticks_from_now, options(nomem, nostack, preserves_flags));
    }
}

fn enable_comparator() {
    // SAFETY: writes only CNTP_CTL_EL0, enabling the comparator and
    // unmasking its interrupt.
    unsafe {
        core::arch::asm!("msr CNTP_CTL_EL0, {v}", v = in(reg) 1_u64, options(nomem, nostack, preserves_flags));
    }
}

/// Programs the compare register for the first tick and registers the
/// timer line with the GIC. Must run after [`crate::gic::init`].
pub fn init() {
    let freq = read_freq();
    let period = freq / config::HZ;
    TICKS_PER_PERIOD.store(period, Ordering::Relaxed);
    write_compare(period);
    enable_comparator();
    gic::set_priority(config::IRQ_TIMER, 0);
    gic::set_target(config::IRQ_TIMER, 0b1);
    gic::enable(config::IRQ_TIMER);
}

/// The monotonic tick count since boot ("jiffies").
pub fn jiffies() -> u64 {
    JIFFIES.load(Ordering::Relaxed)
}

/// Registers a one-shot callback to run at or after `jiffies() + delay_ticks`.
pub fn register_timer(delay_ticks: u64, callback: fn(usize), data: usize) {
    SOFT_TIMERS.lock().push(SoftTimer {
        deadline: jiffies() + delay_ticks,
        callback,
        data,
    });
}

/// Invoked from the IRQ dispatcher on the timer line. Increments jiffies,
/// reprograms the compare register for the next tick, runs expired
/// software timers, then calls `on_tick` so the caller (the scheduler) may
/// select a different process to resume.
pub fn handle_tick(mut on_tick: impl FnMut()) {
    JIFFIES.fetch_add(1, Ordering::Relaxed);
    write_compare(TICKS_PER_PERIOD.load(Ordering::Relaxed));

    let now = jiffies();
    let mut timers = SOFT_TIMERS.lock();
    let mut i = 0;
    while i < timers.len() {
        if timers[i].deadline <= now {
            let timer = timers.swap_remove(i);
            (timer.callback)(timer.data);
        } else {
            i += 1;
        }
    }
    drop(timers);

    on_tick();
}

/// Busy-loops on the virtual counter for `us` microseconds. Only safe in
/// contexts where a long stall is acceptable.
pub fn delay_us(us: u64) {
    let freq = read_freq();
    let ticks = freq.saturating_mul(us) / 1_000_000;
    let start = read_counter();
    while read_counter().wrapping_sub(start) < ticks {
        core::hint::spin_loop();
    }
}

/// Busy-loops for `ms` milliseconds.
pub fn delay_ms(ms: u64) {
    delay_us(ms * 1000);
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::add_test!(jiffies_starts_at_zero_before_any_tick, {
        assert_eq!(JIFFIES.load(Ordering::Relaxed), 0);
    });
}
