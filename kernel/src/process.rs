//! Process table and round-robin scheduler.
//!
//! `Execution`/`ExecutionMap` (`os/src/bin/kernel/execution/`) models
//! cooperative blocking via a token and a multi-core run queue; this
//! kernel wants strict single-hart round-robin driven purely by the timer
//! IRQ, so this module is a fixed-capacity array, keeping the
//! pid-assignment style (`execution_map.rs`'s "first free slot, else
//! push") but dropping the run-queue/blocking-token machinery, which this
//! scheduling model has no use for.

use core::arch::asm;

use crate::config;
use crate::exception::SavedFrame;
use crate::memory;
use crate::sync::SpinLock;
use crate::vm::{self, AddressSpace};

/// A process's lifecycle state: created, runnable, running, zombie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    Runnable,
    Running,
    /// Carries the exit status. The scheduler skips zombies (a step
    /// beyond the source's "park forever, scheduler still visits the
    /// slot" behavior, since modeling the state explicitly costs nothing
    /// and documents the non-goal of reclaiming a zombie's resources).
    Zombie(i64),
}

/// A process table entry. `name` is a short, fixed-capacity label so the
/// record stays `Copy`-free but allocation-free outside of its one-time
/// frame allocations.
pub struct Process {
    pub pid: u32,
    pub name: alloc::string::String,
    ttbr0: u64,
    kernel_stack: memory::Frames,
    /// Points into `kernel_stack`; valid once the process has taken at
    /// least one exception (or been freshly created by the loader).
    saved_frame: *mut SavedFrame,
    pub entry: u64,
    pub user_sp: u64,
    pub state: State,
    /// Window id owned by this process, if the compositor has created one.
    /// Tracked here (rather than only in the compositor) so the scheduler
    /// and syscall dispatcher can answer "does pid N have a window" without
    /// taking the compositor lock from contexts that must not block on it.
    pub window: Option<u32>,
}

// SAFETY: every field is either `Copy`, owned outright, or a raw pointer
// into memory this process exclusively owns; access is serialized by the
// table's `SpinLock` and the single-hart execution model.
unsafe impl Send for Process {}

impl Process {
    pub fn saved_frame(&self) -> *mut SavedFrame {
        self.saved_frame
    }

    pub fn ttbr0(&self) -> u64 {
        self.ttbr0
    }
}

struct Table {
    slots: [Option<Process>; config::MAX_PROCESSES],
    /// Index into `slots` of the process currently executing.
    current: usize,
    populated: usize,
}

static TABLE: SpinLock<Table> = SpinLock::new(Table {
    slots: [const { None }; config::MAX_PROCESSES],
    current: 0,
    populated: 0,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableFull;

/// Reserves the next free slot, allocates a kernel stack frame, and
/// records an as-yet-unpopulated address space root. The ELF loader fills
/// in `entry`/`user_sp`/the saved frame afterward.
pub fn create(name: &str, address_space: &AddressSpace) -> Result<u32, TableFull> {
    let kernel_stack = memory::alloc_frame().map_err(|_| TableFull)?;
    let stack_top = kernel_stack.addr() + config::PAGE_SIZE;
    let saved_frame = core::ptr::without_provenance_mut::<SavedFrame>(
        (stack_top - core::mem::size_of::<SavedFrame>() as u64) as usize,
    );
    // SAFETY: `saved_frame` lies within the freshly allocated, zeroed
    // kernel stack frame.
    unsafe { saved_frame.write(SavedFrame::zeroed()) };

    let mut table = TABLE.lock();
    let slot = (0..config::MAX_PROCESSES).find(|&i| table.slots[i].is_none()).ok_or(TableFull)?;
    let pid = (slot + 1) as u32;
    table.slots[slot] = Some(Process {
        pid,
        name: alloc::string::String::from(name),
        ttbr0: address_space.top_phys(),
        kernel_stack,
        saved_frame,
        entry: 0,
        user_sp: 0,
        state: State::Created,
        window: None,
    });
    table.populated = table.populated.max(slot + 1);
    Ok(pid)
}

fn index_of(pid: u32) -> Option<usize> {
    pid.checked_sub(1).map(|i| i as usize)
}

/// Runs `f` with mutable access to process `pid`'s table entry.
pub fn with_process<R>(pid: u32, f: impl FnOnce(&mut Process) -> R) -> Option<R> {
    let index = index_of(pid)?;
    let mut table = TABLE.lock();
    table.slots.get_mut(index)?.as_mut().map(f)
}

/// The currently scheduled process's pid, or `None` before the first
/// process has been installed.
pub fn current_pid() -> Option<u32> {
    let table = TABLE.lock();
    table.slots[table.current].as_ref().map(|p| p.pid)
}

/// Marks process `pid` as runnable, ready to be picked up by the
/// scheduler on its next turn. Called by the loader once an address space
/// and entry point are fully populated.
pub fn mark_runnable(pid: u32) {
    with_process(pid, |p| p.state = State::Runnable);
}

/// Invoked from the timer IRQ handler: records `current_frame` against
/// the process that was running, advances round-robin to the next
/// runnable slot, switches `TTBR0_EL1`, and returns a pointer to the
/// newly selected process's saved frame.
pub fn schedule(current_frame: *mut SavedFrame) -> *mut SavedFrame {
    let mut table = TABLE.lock();
    let populated = table.populated;
    assert!(populated > 0, "scheduler invoked with no processes installed");

    if let Some(current) = table.slots[table.current].as_mut() {
        current.saved_frame = current_frame;
        if current.state == State::Running {
            current.state = State::Runnable;
        }
    }

    let start = table.current;
    let mut next = (start + 1) % populated;
    let selected = loop {
        let runnable = table.slots[next]
            .as_ref()
            .is_some_and(|p| matches!(p.state, State::Runnable | State::Running));
        if runnable || next == start {
            break next;
        }
        next = (next + 1) % populated;
    };
    table.current = selected;

    let process = table.slots[selected].as_mut().expect("populated slot must exist");
    process.state = State::Running;
    let ttbr0 = process.ttbr0;
    let frame = process.saved_frame;
    drop(table);

    switch_address_space(ttbr0);
    frame
}

/// Installs `ttbr0`, broadcasts a full TLB invalidate, and instruction
/// synchronizes.
fn switch_address_space(ttbr0: u64) {
    // SAFETY: `ttbr0` is a process's top-level table, previously
    // initialized by `vm::create_address_space`.
    unsafe {
        asm!(
            "msr ttbr0_el1, {ttbr0}",
            "isb",
            "tlbi vmalle1is",
            "dsb ish",
            "isb",
            ttbr0 = in(reg) ttbr0,
            options(nostack, preserves_flags),
        );
    }
}

/// Parks process `pid`: marks it a zombie carrying `status` and writes
/// the status into `frame` so a caller inspecting the frame after the
/// fact sees it, though per the documented non-goal the process never
/// actually resumes progress, the scheduler simply stops selecting it as
/// `Running`.
pub fn exit_current(status: i64, frame: &mut SavedFrame) {
    frame.set_return(status);
    if let Some(pid) = current_pid() {
        with_process(pid, |p| p.state = State::Zombie(status));
    }
    park_hart();
}

/// Parks the calling hart in a wait-for-event loop. The next timer tick
/// still fires and the scheduler still advances past this (now zombie)
/// slot, so this only blocks forward progress of the exiting process, not
/// the rest of the system.
fn park_hart() -> ! {
    loop {
        // SAFETY: `wfe` with interrupts masked simply halts until the next
        // IRQ, which the timer guarantees will arrive.
        unsafe { asm!("wfe", options(nomem, nostack, preserves_flags)) };
    }
}

/// Installs the first process's address space, marks it current, and
/// transfers to EL0 via a dedicated assembly primitive that loads the
/// entry PC, user SP, and target exception level, then executes an
/// exception return. Never returns.
///
/// # Safety
///
/// Must be called exactly once, with `pid` fully populated by the loader
/// (entry point, user stack, and saved frame all valid), and no exception
/// may have fired yet on this hart.
pub unsafe fn start_first_process(pid: u32) -> ! {
    let (ttbr0, entry, user_sp) = with_process(pid, |p| {
        p.state = State::Running;
        (p.ttbr0, p.entry, p.user_sp)
    })
    .expect("start_first_process: pid not found");

    {
        let mut table = TABLE.lock();
        table.current = index_of(pid).expect("valid pid");
    }

    switch_address_space(ttbr0);

    // SAFETY: `entry`/`user_sp` were populated by the ELF loader for a
    // freshly mapped address space; SPSR selects EL0t with interrupts
    // unmasked, matching the ELF loader's initial frame.
    unsafe {
        asm!(
            "msr elr_el1, {entry}",
            "msr sp_el0, {sp}",
            "msr spsr_el1, {spsr}",
            "eret",
            entry = in(reg) entry,
            sp = in(reg) user_sp,
            spsr = in(reg) SavedFrame::EL0_UNMASKED,
            options(noreturn),
        );
    }
}

/// Allocates a fresh address space and process slot in one step, the
/// shape the ELF loader starts from.
pub fn spawn(name: &str) -> Result<(u32, AddressSpace), TableFull> {
    let space = vm::create_address_space().map_err(|_| TableFull)?;
    let pid = create(name, &space)?;
    Ok((pid, space))
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::add_test!(index_of_is_one_based, {
        assert_eq!(index_of(1), Some(0));
        assert_eq!(index_of(0), None);
    });
}
