//! Driver for the PL011 UART at [`config::UART_BASE`], used for kernel
//! diagnostics. Carried over from `os/src/bin/kernel/uart.rs`'s register
//! layout and write path; the Raspberry Pi's `__dmb` barrier calls are
//! dropped since `virt`'s UART is plain device memory with no posted-write
//! ordering quirk to account for here.

use core::fmt::{self, Write};
use core::hint;
use core::ptr::NonNull;

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::{Aliased, ReadOnly};
use tock_registers::{register_bitfields, register_structs};

use crate::config;
use crate::sync::{OnceLock, SpinLock};

/// IO errors surfaced by the UART's raw interrupt status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    Break,
    Frame,
    Overrun,
    Parity,
}

register_bitfields! {
    u32,
    DR_R [
        DATA OFFSET(0) NUMBITS(8) [],
    ],
    DR_W [
        DATA OFFSET(0) NUMBITS(8),
    ],
    FR [
        /// Transmit FIFO full.
        TXFF OFFSET(5) NUMBITS(1) [
            Nonfull = 0,
            Full = 1,
        ],
        /// Receive FIFO empty.
        RXFE OFFSET(4) NUMBITS(1) [
            NotEmpty = 0,
            Empty = 1,
        ],
    ],
    RIS [
        OERIS OFFSET(10) NUMBITS(1) [
            Idle = 0,
            Pending = 1,
        ],
        BERIS OFFSET(9) NUMBITS(1) [
            Idle = 0,
            Pending = 1,
        ],
        PERIS OFFSET(8) NUMBITS(1) [
            Idle = 0,
            Pending = 1,
        ],
        FERIS OFFSET(7) NUMBITS(1) [
            Idle = 0,
            Pending = 1,
        ],
    ],
}

register_structs! {
    pub UartRegisters {
        (0x00 => dr: Aliased<u32, DR_R::Register, DR_W::Register>),
        (0x04 => _unused0),
        (0x18 => fr: ReadOnly<u32, FR::Register>),
        (0x1C => _unused1),
        (0x3C => ris: ReadOnly<u32, RIS::Register>),
        (0x40 => @END),
    }
}

/// A wrapper for a memory-mapped PL011 interface.
pub struct Uart {
    registers: NonNull<UartRegisters>,
}

// SAFETY: every access goes through the owning `SpinLock`, so there is
// never more than one live mutable borrow of the registers.
unsafe impl Send for Uart {}

impl Uart {
    /// # Safety
    ///
    /// `base_address` must point to a valid, mapped PL011 register block
    /// that is never accessed through any other handle.
    unsafe fn new(base_address: u64) -> Self {
        Self {
            // SAFETY: the caller guarantees `base_address` is valid and exclusive.
            registers: unsafe {
                NonNull::new_unchecked(core::ptr::without_provenance_mut(base_address as usize))
            },
        }
    }

    fn registers(&self) -> &UartRegisters {
        // SAFETY: the registers are mapped device memory for the life of the kernel.
        unsafe { self.registers.as_ref() }
    }

    fn check_errors(&self) -> Result<(), IoError> {
        let ris = self.registers().ris.extract();
        if ris.matches_any(&[RIS::OERIS::Pending]) {
            Err(IoError::Overrun)
        } else if ris.matches_any(&[RIS::BERIS::Pending]) {
            Err(IoError::Break)
        } else if ris.matches_any(&[RIS::PERIS::Pending]) {
            Err(IoError::Parity)
        } else if ris.matches_any(&[RIS::FERIS::Pending]) {
            Err(IoError::Frame)
        } else {
            Ok(())
        }
    }

    pub fn write_byte(&mut self, byte: u8) -> Result<(), IoError> {
        while self.registers().fr.matches_any(&[FR::TXFF::Full]) {
            self.check_errors()?;
            hint::spin_loop();
        }
        self.registers().dr.write(DR_W::DATA.val(byte.into()));
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), IoError> {
        for &byte in bytes {
            self.write_byte(byte)?;
        }
        Ok(())
    }

    /// Reads one byte if the receive FIFO is non-empty, without blocking.
    pub fn try_read_byte(&mut self) -> Option<u8> {
        if self.registers().fr.matches_any(&[FR::RXFE::Empty]) {
            None
        } else {
            Some(self.registers().dr.read(DR_R::DATA) as u8)
        }
    }
}

impl Write for Uart {
    fn write_str(&mut self, string: &str) -> fmt::Result {
        self.write_bytes(string.as_bytes()).map_err(|_| fmt::Error)
    }
}

static CONSOLE: OnceLock<SpinLock<Uart>> = OnceLock::new();

/// Installs the kernel console. Must be called exactly once, before the
/// first use of [`crate::println`].
///
/// # Safety
///
/// Must be called exactly once, before any other core reads [`console`],
/// and [`config::UART_BASE`] must not otherwise be accessed.
pub unsafe fn init() {
    // SAFETY: caller guarantees this runs once, before any concurrent access.
    CONSOLE.set(SpinLock::new(unsafe { Uart::new(config::UART_BASE) }));
}

/// The global console lock. Panics if [`init`] has not yet run.
pub fn console() -> &'static SpinLock<Uart> {
    &CONSOLE
}

pub fn try_read_byte() -> Option<u8> {
    console().lock().try_read_byte()
}
