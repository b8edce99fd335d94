//! Virtual memory manager: builds and mutates 4-level page tables, installs
//! the initial kernel identity map, and creates per-process address
//! spaces.
//!
//! Grounded on `os/src/bin/kernel/vm.rs`'s `TranslationDescriptor` bitfield
//! (`MemoryAttribute`/`Shareability` enums via `num_derive`, packed with
//! `bitfield_struct`) and `AddressSpace::map`, generalized from that file's
//! single flat 64 KiB-page table to a full four-level, 4 KiB-page walk.

use bitfield_struct::bitfield;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};

use crate::config;
use crate::memory::{self, OutOfMemory};
use crate::sync::SpinLock;

extern "C" {
    static __kernel_start: u8;
    static __kernel_end: u8;
}

/// Attribute indices programmed into `MAIR_EL1`; `Normal` and `Device`
/// are the only two this kernel ever needs.
#[derive(FromPrimitive, ToPrimitive, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryAttribute {
    Normal = 0,
    Device = 1,
}

impl From<u64> for MemoryAttribute {
    fn from(value: u64) -> Self {
        FromPrimitive::from_u64(value).expect("invalid memory attribute index")
    }
}

impl From<MemoryAttribute> for u64 {
    fn from(value: MemoryAttribute) -> Self {
        // SAFETY: `MemoryAttribute` always fits into a `u64`.
        unsafe { ToPrimitive::to_u64(&value).unwrap_unchecked() }
    }
}

#[derive(FromPrimitive, ToPrimitive, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shareability {
    Non = 0b00,
    Outer = 0b10,
    Inner = 0b11,
}

impl From<u64> for Shareability {
    fn from(value: u64) -> Self {
        FromPrimitive::from_u64(value).expect("invalid shareability attribute")
    }
}

impl From<Shareability> for u64 {
    fn from(value: Shareability) -> Self {
        // SAFETY: `Shareability` always fits into a `u64`.
        unsafe { ToPrimitive::to_u64(&value).unwrap_unchecked() }
    }
}

/// A single 64-bit translation table descriptor, valid as either a table
/// descriptor (levels 0-2) or a page descriptor (level 3); this kernel
/// never creates block descriptors.
#[bitfield(u64, debug = false)]
pub struct Descriptor {
    valid: bool,
    /// Must be 1: table descriptor at levels 0-2, page descriptor at level 3.
    table_or_page: bool,
    #[bits(3)]
    memory_type: MemoryAttribute,
    _ns: bool,
    /// AP[1]: lets EL0 access this mapping.
    user_accessible: bool,
    /// AP[2]: disables writes.
    writeable_never: bool,
    #[bits(2)]
    shareability: Shareability,
    access: bool,
    /// Not-global: 0 here since this kernel never tags entries by ASID.
    not_global: bool,
    #[bits(36)]
    ppn: u64,
    #[bits(2)]
    _res0_2: u8,
    _guarded_page: bool,
    dirty: bool,
    _contiguous: bool,
    privileged_execute_never: bool,
    unprivileged_execute_never: bool,
    #[bits(4)]
    _ignored2: u8,
    #[bits(4)]
    _hw_use: u8,
    _ignored: bool,
}

impl Descriptor {
    fn table(pa: u64) -> Self {
        Self::new()
            .with_valid(true)
            .with_table_or_page(true)
            .with_access(true)
            .with_shareability(Shareability::Inner)
            .with_ppn(pa >> config::PAGE_SHIFT)
            .with_privileged_execute_never(false)
            .with_unprivileged_execute_never(false)
    }

    fn leaf(pa: u64, flags: MapFlags) -> Self {
        Self::new()
            .with_valid(true)
            .with_table_or_page(true)
            .with_access(true)
            .with_shareability(Shareability::Inner)
            .with_memory_type(if flags.device {
                MemoryAttribute::Device
            } else {
                MemoryAttribute::Normal
            })
            .with_writeable_never(!flags.writeable)
            .with_user_accessible(flags.user_accessible)
            .with_privileged_execute_never(flags.privileged_execute_never)
            .with_unprivileged_execute_never(flags.user_execute_never)
            .with_ppn(pa >> config::PAGE_SHIFT)
    }

    fn output_addr(self) -> u64 {
        self.ppn() << config::PAGE_SHIFT
    }
}

/// Leaf permissions for a [`AddressSpace::map`] call.
#[derive(Clone, Copy, Debug)]
pub struct MapFlags {
    pub writeable: bool,
    pub user_accessible: bool,
    pub device: bool,
    pub privileged_execute_never: bool,
    pub user_execute_never: bool,
}

impl MapFlags {
    /// Kernel RW, execute-never from user and privileged (data pages).
    pub const KERNEL_DATA: Self = Self {
        writeable: true,
        user_accessible: false,
        device: false,
        privileged_execute_never: true,
        user_execute_never: true,
    };

    /// Kernel RW, executable at EL1 (user execution never permitted).
    /// Used only for the kernel image's own identity-mapped range, so
    /// the instruction fetch that follows enabling the MMU — and every
    /// vector-table entry after it — does not land on a PXN page.
    pub const KERNEL_TEXT: Self = Self {
        writeable: true,
        user_accessible: false,
        device: false,
        privileged_execute_never: false,
        user_execute_never: true,
    };

    /// Device nGnRE, both execute-never bits set, kernel-only.
    pub const DEVICE: Self = Self {
        writeable: true,
        user_accessible: false,
        device: true,
        privileged_execute_never: true,
        user_execute_never: true,
    };

    /// User RW data, no execution anywhere.
    pub const USER_DATA: Self = Self {
        writeable: true,
        user_accessible: true,
        device: false,
        privileged_execute_never: true,
        user_execute_never: true,
    };

    /// User read-execute code, never writeable.
    pub const USER_CODE: Self = Self {
        writeable: false,
        user_accessible: true,
        device: false,
        privileged_execute_never: true,
        user_execute_never: false,
    };

    /// User read-only data (rodata segments).
    pub const USER_RODATA: Self = Self {
        writeable: false,
        user_accessible: true,
        device: false,
        privileged_execute_never: true,
        user_execute_never: true,
    };
}

const ENTRIES_PER_TABLE: usize = 512;

/// One level of the translation table: 512 8-byte descriptors, 4 KiB
/// aligned, exactly as required by the hardware table walker.
#[repr(C, align(4096))]
pub struct Table([Descriptor; ENTRIES_PER_TABLE]);

impl Table {
    const fn zeroed() -> Self {
        Self([Descriptor::new(); ENTRIES_PER_TABLE])
    }
}

fn index_for_level(va: u64, level: u32) -> usize {
    let shift = config::PAGE_SHIFT + 9 * (3 - level);
    ((va >> shift) & 0x1ff) as usize
}

/// Failure modes for [`AddressSpace::map`] / [`AddressSpace::unmap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    Misaligned,
    OutOfMemory,
    NotMapped,
}

impl From<OutOfMemory> for MapError {
    fn from(_: OutOfMemory) -> Self {
        Self::OutOfMemory
    }
}

/// Owns one top-level translation table and every intermediate table it
/// transitively references.
pub struct AddressSpace {
    top_phys: u64,
}

impl AddressSpace {
    /// Wraps an already-constructed top-level table at `top_phys`
    /// (identity-mapped, so the physical and virtual addresses coincide
    /// before the MMU is enabled and after, since RAM is identity mapped).
    const fn from_phys(top_phys: u64) -> Self {
        Self { top_phys }
    }

    fn table_mut(phys: u64) -> &'static mut Table {
        // SAFETY: every table this module creates lives in identity-mapped,
        // frame-allocator-owned memory for as long as its address space does.
        unsafe { &mut *core::ptr::without_provenance_mut::<Table>(phys as usize) }
    }

    /// Walks the four levels, allocating and zeroing intermediate tables
    /// on demand, and installs a page descriptor for `va -> pa`.
    pub fn map(&mut self, va: u64, pa: u64, flags: MapFlags) -> Result<(), MapError> {
        if va % config::PAGE_SIZE != 0 || pa % config::PAGE_SIZE != 0 {
            return Err(MapError::Misaligned);
        }
        let mut table_phys = self.top_phys;
        for level in 0..3 {
            let table = Self::table_mut(table_phys);
            let index = index_for_level(va, level);
            let entry = table.0[index];
            table_phys = if entry.valid() {
                entry.output_addr()
            } else {
                let frames = memory::alloc_frame()?;
                let child_phys = frames.addr();
                core::mem::forget(frames);
                table.0[index] = Descriptor::table(child_phys);
                child_phys
            };
        }
        let leaf_table = Self::table_mut(table_phys);
        let index = index_for_level(va, 3);
        leaf_table.0[index] = Descriptor::leaf(pa, flags);
        invalidate_va(va);
        Ok(())
    }

    /// Walks without allocating; zeroes the leaf if present.
    pub fn unmap(&mut self, va: u64) -> Result<(), MapError> {
        if va % config::PAGE_SIZE != 0 {
            return Err(MapError::Misaligned);
        }
        let mut table_phys = self.top_phys;
        for level in 0..3 {
            let table = Self::table_mut(table_phys);
            let entry = table.0[index_for_level(va, level)];
            if !entry.valid() {
                return Err(MapError::NotMapped);
            }
            table_phys = entry.output_addr();
        }
        let leaf_table = Self::table_mut(table_phys);
        let index = index_for_level(va, 3);
        if !leaf_table.0[index].valid() {
            return Err(MapError::NotMapped);
        }
        leaf_table.0[index] = Descriptor::new();
        invalidate_va(va);
        Ok(())
    }

    /// Translates `va` to its mapped physical address, if any.
    pub fn translate(&self, va: u64) -> Option<u64> {
        let mut table_phys = self.top_phys;
        for level in 0..3 {
            let table = Self::table_mut(table_phys);
            let entry = table.0[index_for_level(va, level)];
            if !entry.valid() {
                return None;
            }
            table_phys = entry.output_addr();
        }
        let leaf_table = Self::table_mut(table_phys);
        let entry = leaf_table.0[index_for_level(va, 3)];
        entry
            .valid()
            .then(|| entry.output_addr() | (va & (config::PAGE_SIZE - 1)))
    }

    pub fn top_phys(&self) -> u64 {
        self.top_phys
    }
}

/// Broadcasts a TLB invalidate by VA, then barriers and synchronizes.
fn invalidate_va(va: u64) {
    // SAFETY: standard ARMv8 TLB maintenance sequence; no memory is touched
    // beyond the architectural state the instructions themselves define.
    unsafe {
        core::arch::asm!(
            "dsb ishst",
            "tlbi vaae1is, {page}",
            "dsb ish",
            "isb",
            page = in(reg) va >> 12,
            options(nostack),
        );
    }
}

/// The kernel's own top-level table, statically allocated so it exists
/// before the frame allocator is initialized.
static mut KERNEL_TABLE: Table = Table::zeroed();

static KERNEL_ADDRESS_SPACE: SpinLock<Option<AddressSpace>> = SpinLock::new(None);

/// Builds the kernel identity map and programs `MAIR_EL1` / `TCR_EL1` /
/// `TTBR0_EL1`, then enables the MMU.
///
/// # Safety
///
/// Must run exactly once, very early in boot, before any other core
/// accesses virtual memory through the kernel map.
pub unsafe fn init() {
    // SAFETY: single hart, single call, before any concurrent use.
    let top_phys = (&raw mut KERNEL_TABLE) as u64;
    let mut space = AddressSpace::from_phys(top_phys);

    // SAFETY: linker-defined symbols; only their addresses are read, to
    // carve the kernel image's own pages out of the plain-data identity
    // map below.
    let (kernel_start, kernel_end) =
        unsafe { (&__kernel_start as *const u8 as u64, &__kernel_end as *const u8 as u64) };
    let kernel_start_page = kernel_start - kernel_start % config::PAGE_SIZE;
    let kernel_end_page = kernel_end.div_ceil(config::PAGE_SIZE) * config::PAGE_SIZE;

    let ram_pages = config::RAM_SIZE / config::PAGE_SIZE;
    for i in 0..ram_pages {
        let pa = config::RAM_BASE + i * config::PAGE_SIZE;
        let flags = if pa >= kernel_start_page && pa < kernel_end_page {
            MapFlags::KERNEL_TEXT
        } else {
            MapFlags::KERNEL_DATA
        };
        space.map(pa, pa, flags).expect("kernel identity map must not fail");
    }

    let mmio_start = config::GICD_BASE;
    let mmio_end = config::VIRTIO_MMIO_BASE
        + config::VIRTIO_MMIO_STRIDE * config::VIRTIO_MMIO_SLOTS as u64;
    let mut pa = mmio_start - mmio_start % config::PAGE_SIZE;
    while pa < mmio_end {
        space
            .map(pa, pa, MapFlags::DEVICE)
            .expect("device identity map must not fail");
        pa += config::PAGE_SIZE;
    }

    *KERNEL_ADDRESS_SPACE.lock() = Some(space);

    // MAIR_EL1: index 0 = normal write-back write-allocate, index 1 =
    // device nGnRE.
    let mair: u64 = 0xff | (0x04 << 8);
    // TCR_EL1: T0SZ=16 (48-bit input), IRGN0/ORGN0 = write-back
    // write-allocate, SH0 = inner shareable, TG0 = 4 KiB, IPS = 40-bit.
    let tcr: u64 = 16 | (1 << 8) | (1 << 10) | (3 << 12) | (2 << 32);

    // SAFETY: programs the translation-control and table-base registers per
    // the architecturally required sequence, then enables the MMU with
    // caches in one barrier-bracketed store.
    unsafe {
        core::arch::asm!(
            "msr mair_el1, {mair}",
            "msr tcr_el1, {tcr}",
            "msr ttbr0_el1, {ttbr0}",
            "isb",
            "mrs {sctlr}, sctlr_el1",
            "orr {sctlr}, {sctlr}, {mmu_cache_bits}",
            "dsb sy",
            "msr sctlr_el1, {sctlr}",
            "isb",
            mair = in(reg) mair,
            tcr = in(reg) tcr,
            ttbr0 = in(reg) top_phys,
            sctlr = out(reg) _,
            mmu_cache_bits = in(reg) (1_u64 << 0) | (1_u64 << 2) | (1_u64 << 12), // M | C | I
            options(nostack),
        );
    }
}

/// Allocates a frame for a new top-level table and copies the kernel's
/// top-level entries into it, so the kernel half stays mapped regardless
/// of which address space is installed.
pub fn create_address_space() -> Result<AddressSpace, MapError> {
    let frames = memory::alloc_frame()?;
    let top_phys = frames.addr();
    core::mem::forget(frames);

    let new_table = AddressSpace::table_mut(top_phys);
    let kernel_table = AddressSpace::table_mut(
        KERNEL_ADDRESS_SPACE
            .lock()
            .as_ref()
            .expect("kernel address space not yet initialized")
            .top_phys(),
    );
    new_table.0.copy_from_slice(&kernel_table.0);

    Ok(AddressSpace::from_phys(top_phys))
}

/// Frees the top-level frame. Lower-level tables are not recursively
/// freed (a documented limitation).
pub fn destroy_address_space(space: AddressSpace) {
    let addr = space.top_phys();
    core::mem::forget(space);
    // SAFETY: the top-level frame was allocated by `create_address_space`
    // and is not referenced elsewhere once the address space is destroyed.
    let frames = unsafe { memory::Frames::from_raw(addr, 1) };
    drop(frames);
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::add_test!(descriptor_round_trips_physical_address, {
        let d = Descriptor::leaf(0x4000_1000, MapFlags::KERNEL_DATA);
        assert_eq!(d.output_addr(), 0x4000_1000);
        assert!(d.valid());
        assert!(!d.writeable_never());
    });

    crate::add_test!(index_for_level_splits_48_bit_va, {
        let va = 0x0000_1234_5678_9000_u64;
        let mut reconstructed = 0_u64;
        for level in 0..4 {
            let idx = index_for_level(va, level);
            reconstructed |= (idx as u64) << (config::PAGE_SHIFT + 9 * (3 - level));
        }
        assert_eq!(reconstructed, va & !0xfff);
    });
}
