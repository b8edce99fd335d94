//! Exercises `sync::SpinLock`'s IRQ-masking discipline across nesting:
//! the inner lock's guard must not re-enable interrupts out from under the
//! outer one when it drops first.
#![feature(custom_test_frameworks)]
#![no_main]
#![no_std]
#![reexport_test_harness_main = "test_main"]
#![test_runner(virt_kernel::test_runner)]

use virt_kernel::add_test;
use virt_kernel::exception;
use virt_kernel::sync::SpinLock;

#[no_mangle]
extern "C" fn kernel_main() -> ! {
    // The boot stub masks every exception type before handing off here;
    // unmask IRQs so the tests below start from the baseline a running
    // process sees, with only `SpinLock` itself masking and restoring it.
    exception::unmask_irqs();
    test_main();
    virt_kernel::halt()
}

/// Reads `DAIF`'s IRQ-mask bit (bit 7, the `I` bit).
fn irqs_are_masked() -> bool {
    let daif: u64;
    // SAFETY: reads only DAIF.
    unsafe {
        core::arch::asm!(
            "mrs {daif}, DAIF",
            daif = out(reg) daif,
            options(nomem, nostack, preserves_flags),
        );
    }
    daif & (1 << 7) != 0
}

add_test!(nested_locks_restore_the_outer_mask_state, {
    assert!(!irqs_are_masked(), "interrupts should start unmasked");

    let outer = SpinLock::new(1_u32);
    let inner = SpinLock::new(2_u32);

    let outer_guard = outer.lock();
    assert!(irqs_are_masked(), "acquiring a lock must mask interrupts");

    {
        let inner_guard = inner.lock();
        assert!(irqs_are_masked());
        drop(inner_guard);
        // The inner guard's drop must restore to "masked", since that was
        // the state in effect when it was acquired, not unconditionally
        // unmask.
        assert!(irqs_are_masked(), "dropping the inner guard must not unmask while the outer lock is held");
    }

    assert_eq!(*outer_guard, 1);
    drop(outer_guard);
    assert!(!irqs_are_masked(), "dropping the last guard restores the original unmasked state");
});

add_test!(lock_contents_survive_a_nested_acquisition, {
    let counter = SpinLock::new(0_u32);
    let other = SpinLock::new(0_u32);
    {
        let mut guard = counter.lock();
        *guard += 1;
        {
            // A distinct lock, not `counter` itself: re-locking the same
            // `SpinLock` from the same hart would spin forever.
            let mut other_guard = other.lock();
            *other_guard += 1;
        }
        *guard += 1;
    }
    assert_eq!(*counter.lock(), 2);
    assert_eq!(*other.lock(), 1);
});
