//! Synchronization primitives.
//!
//! On a single hart, mutual exclusion between kernel-side critical sections
//! and interrupt handlers is achieved by masking interrupts for the
//! duration of the section. [`IrqGuard`] wraps that pattern in a scoped
//! acquisition primitive with a guaranteed release on every exit path,
//! including early returns and panics-that-unwind-never (the kernel
//! aborts on panic, so the only exit path that matters in practice is the
//! normal one, but the type still gives the release a single, auditable
//! place to live).
//!
//! [`SpinLock`] and [`RwLock`] are carried over from `src/sync/mod.rs`,
//! with locking itself bracketed by an [`IrqGuard`] so that a lock taken
//! from process context can never be re-entered by an interrupt handler
//! that fires on the same hart while the lock is held.

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Reads and clears `DAIF`, returning the previous value so it can be
/// restored exactly.
#[inline]
fn mask_irqs() -> u64 {
    let daif: u64;
    // SAFETY: touches only the DAIF system register.
    unsafe {
        core::arch::asm! {
            "mrs {daif}, DAIF",
            "msr DAIFSet, 0b1111",
            daif = out(reg) daif,
            options(nomem, nostack, preserves_flags),
        }
    }
    daif
}

/// Restores `DAIF` to a value previously returned by [`mask_irqs`].
#[inline]
fn restore_irqs(daif: u64) {
    // SAFETY: touches only the DAIF system register.
    unsafe {
        core::arch::asm! {
            "msr DAIF, {daif}",
            daif = in(reg) daif,
            options(nomem, nostack, preserves_flags),
        }
    }
}

/// A scoped IRQ-masking critical section. Interrupts are restored to
/// whatever state they were in before acquisition when the guard drops,
/// not unconditionally re-enabled, so these nest correctly.
pub struct IrqGuard {
    saved_daif: u64,
}

impl IrqGuard {
    /// Masks interrupts and returns a guard that restores them on drop.
    #[inline]
    #[must_use]
    pub fn acquire() -> Self {
        Self {
            saved_daif: mask_irqs(),
        }
    }
}

impl Drop for IrqGuard {
    #[inline]
    fn drop(&mut self) {
        restore_irqs(self.saved_daif);
    }
}

/// A spinlock mutex that additionally masks interrupts while held.
pub struct SpinLock<T: ?Sized> {
    is_locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: the spinlock guarantees exclusive access to `data` while locked.
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a spinlock around the given data.
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            data: UnsafeCell::new(data),
            is_locked: AtomicBool::new(false),
        }
    }

    /// Locks the mutex, masking interrupts for as long as the guard lives.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let irq_guard = IrqGuard::acquire();
        while self.is_locked.swap(true, Ordering::Acquire) {
            while self.is_locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
        SpinLockGuard {
            lock: self,
            _irq_guard: irq_guard,
        }
    }
}

pub struct SpinLockGuard<'locked, T> {
    lock: &'locked SpinLock<T>,
    _irq_guard: IrqGuard,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // SAFETY: the lock is held for the lifetime of this guard.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the lock is held for the lifetime of this guard.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.is_locked.store(false, Ordering::Release);
    }
}

/// A spinlock reader-writer lock, carried over from `src/sync/mod.rs`.
pub struct RwLock<T: ?Sized> {
    state: AtomicU8,
    data: UnsafeCell<T>,
}

// SAFETY: the reader-writer lock guarantees thread safety.
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    const UNLOCKED: u8 = 0;
    const MAX_READERS: u8 = u8::MAX - 1;
    const WRITER: u8 = u8::MAX;

    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            data: UnsafeCell::new(data),
            state: AtomicU8::new(Self::UNLOCKED),
        }
    }

    #[inline]
    pub fn read(&self) -> ReadGuard<'_, T> {
        let irq_guard = IrqGuard::acquire();
        while self
            .state
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |state| match state {
                Self::MAX_READERS | Self::WRITER => None,
                state => Some(state + 1),
            })
            .is_err()
        {
            hint::spin_loop();
        }
        ReadGuard {
            lock: self,
            _irq_guard: irq_guard,
        }
    }

    #[inline]
    pub fn write(&self) -> WriteGuard<'_, T> {
        let irq_guard = IrqGuard::acquire();
        while self
            .state
            .compare_exchange_weak(
                Self::UNLOCKED,
                Self::WRITER,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_err()
        {
            hint::spin_loop();
        }
        WriteGuard {
            lock: self,
            _irq_guard: irq_guard,
        }
    }
}

pub struct ReadGuard<'locked, T> {
    lock: &'locked RwLock<T>,
    _irq_guard: IrqGuard,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &Self::Target {
        // SAFETY: at least one reader slot is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

pub struct WriteGuard<'locked, T> {
    lock: &'locked RwLock<T>,
    _irq_guard: IrqGuard,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &Self::Target {
        // SAFETY: the writer slot is held exclusively.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the writer slot is held exclusively.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.state.store(RwLock::<T>::UNLOCKED, Ordering::Release);
    }
}

/// A cell that is set exactly once, early in boot, and read many times
/// afterwards without further synchronization. Grounded on `src/cell/mod.rs`'s
/// `InitCell`, but built from stable primitives (`UnsafeCell` + `AtomicBool`)
/// rather than the unstable `SyncUnsafeCell`.
pub struct OnceLock<T> {
    is_set: AtomicBool,
    data: UnsafeCell<Option<T>>,
}

// SAFETY: `set` establishes a happens-before edge via `Ordering::Release`,
// and every read after it observes `is_set` with `Ordering::Acquire`.
unsafe impl<T: Send + Sync> Sync for OnceLock<T> {}

impl<T> OnceLock<T> {
    #[inline]
    pub const fn new() -> Self {
        Self {
            is_set: AtomicBool::new(false),
            data: UnsafeCell::new(None),
        }
    }

    /// Sets the cell's value.
    ///
    /// # Panics
    ///
    /// Panics if the cell has already been set.
    pub fn set(&self, value: T) {
        assert!(
            !self.is_set.load(Ordering::Relaxed),
            "OnceLock::set called twice"
        );
        // SAFETY: `is_set` is still false, so no reader has taken a reference yet,
        // and the assert above rules out a concurrent writer on this single hart.
        unsafe { *self.data.get() = Some(value) };
        self.is_set.store(true, Ordering::Release);
    }

    /// Returns the value, or `None` if [`Self::set`] has not yet run.
    pub fn get(&self) -> Option<&T> {
        if self.is_set.load(Ordering::Acquire) {
            // SAFETY: `is_set` is true, so the value is initialized and no
            // further mutation will occur.
            Some(unsafe { (*self.data.get()).as_ref().unwrap_unchecked() })
        } else {
            None
        }
    }
}

impl<T> Deref for OnceLock<T> {
    type Target = T;

    /// # Panics
    ///
    /// Panics if the cell has not yet been set.
    fn deref(&self) -> &Self::Target {
        self.get().expect("OnceLock read before it was set")
    }
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::SpinLock;

    crate::add_test!(spinlock_allows_mutation, {
        let lock = SpinLock::new(0_u32);
        *lock.lock() += 1;
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 2);
    });

    crate::add_test!(oncelock_reads_back_set_value, {
        use super::OnceLock;
        let cell: OnceLock<u32> = OnceLock::new();
        assert!(cell.get().is_none());
        cell.set(7);
        assert_eq!(*cell, 7);
    });
}
