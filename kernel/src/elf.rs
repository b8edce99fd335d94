//! ELF64 loader: parses a statically-linked AArch64 executable, maps and
//! populates its `PT_LOAD` segments in a fresh process address space,
//! sets up the user stack, and builds the process's initial saved
//! register frame.
//!
//! The header and program-header schemas are decoded field-by-field from
//! explicit byte offsets rather than read through a `#[repr(C, packed)]`
//! struct pun (the same discipline `kernel/src/vm.rs`'s `Descriptor`
//! bitfield already applies to in-memory page-table words, here applied
//! to a little-endian on-disk format instead).

use crate::config;
use crate::exception::SavedFrame;
use crate::fs::{Filesystem, InodeNumber, NotFound};
use crate::memory;
use crate::process;
use crate::vm::{AddressSpace, MapError, MapFlags};

const MAGIC: [u8; 4] = *b"\x7fELF";
const CLASS_64: u8 = 2;
const DATA_LITTLE_ENDIAN: u8 = 1;
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;
const EM_AARCH64: u16 = 183;
const PT_LOAD: u32 = 1;

const PF_EXECUTE: u32 = 1 << 0;
const PF_WRITE: u32 = 1 << 1;
const PF_READ: u32 = 1 << 2;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

#[derive(Debug)]
pub enum LoadError {
    NotFound,
    BadMagic,
    WrongClass,
    WrongEndianness,
    WrongMachine,
    Truncated,
    Map(MapError),
    Process(process::TableFull),
}

impl From<NotFound> for LoadError {
    fn from(_: NotFound) -> Self {
        LoadError::NotFound
    }
}

impl From<MapError> for LoadError {
    fn from(e: MapError) -> Self {
        LoadError::Map(e)
    }
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(buf[offset..offset + 2].try_into().expect("slice is 2 bytes"))
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().expect("slice is 4 bytes"))
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().expect("slice is 8 bytes"))
}

struct Header {
    entry: u64,
    phoff: u64,
    phentsize: u16,
    phnum: u16,
}

fn parse_header(buf: &[u8]) -> Result<Header, LoadError> {
    if buf.len() < EHDR_SIZE {
        return Err(LoadError::Truncated);
    }
    if buf[0..4] != MAGIC {
        return Err(LoadError::BadMagic);
    }
    if buf[4] != CLASS_64 {
        return Err(LoadError::WrongClass);
    }
    if buf[5] != DATA_LITTLE_ENDIAN {
        return Err(LoadError::WrongEndianness);
    }
    let ty = read_u16(buf, 16);
    if ty != ET_EXEC && ty != ET_DYN {
        return Err(LoadError::WrongMachine);
    }
    if read_u16(buf, 18) != EM_AARCH64 {
        return Err(LoadError::WrongMachine);
    }
    Ok(Header {
        entry: read_u64(buf, 24),
        phoff: read_u64(buf, 32),
        phentsize: read_u16(buf, 54),
        phnum: read_u16(buf, 56),
    })
}

struct ProgramHeader {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
}

fn parse_program_header(buf: &[u8]) -> ProgramHeader {
    ProgramHeader {
        p_type: read_u32(buf, 0),
        p_flags: read_u32(buf, 4),
        p_offset: read_u64(buf, 8),
        p_vaddr: read_u64(buf, 16),
        p_filesz: read_u64(buf, 32),
        p_memsz: read_u64(buf, 40),
    }
}

fn segment_flags(p_flags: u32) -> MapFlags {
    if p_flags & PF_EXECUTE != 0 {
        MapFlags::USER_CODE
    } else if p_flags & PF_WRITE != 0 {
        MapFlags::USER_DATA
    } else {
        debug_assert!(p_flags & PF_READ != 0, "segment with no permission bits set");
        MapFlags::USER_RODATA
    }
}

/// Cleans the data cache to the point of unification over `len` bytes
/// starting at `addr`, then invalidates the instruction cache and
/// synchronizes the pipeline, so freshly written instruction bytes are
/// visible to fetch.
fn sync_instruction_stream(addr: u64, len: u64) {
    const LINE: u64 = 64;
    let mut cursor = addr & !(LINE - 1);
    let end = addr + len;
    while cursor < end {
        // SAFETY: `cursor` lies within the just-mapped, just-written page.
        unsafe { core::arch::asm!("dc cvau, {addr}", addr = in(reg) cursor, options(nostack, preserves_flags)) };
        cursor += LINE;
    }
    // SAFETY: no operands; orders the cache maintenance above against the
    // subsequent instruction-cache invalidate.
    unsafe {
        core::arch::asm!(
            "dsb ish",
            "ic ialluis",
            "dsb ish",
            "isb",
            options(nostack, preserves_flags),
        );
    }
}

fn map_zeroed_page(space: &mut AddressSpace, va: u64, flags: MapFlags) -> Result<u64, LoadError> {
    let frame = memory::alloc_frame().map_err(|_| MapError::OutOfMemory)?;
    let pa = frame.addr();
    core::mem::forget(frame);
    // SAFETY: the frame was just allocated and is not yet mapped anywhere.
    unsafe { core::ptr::without_provenance_mut::<u8>(pa as usize).write_bytes(0, config::PAGE_SIZE as usize) };
    space.map(va, pa, flags)?;
    Ok(pa)
}

/// Loads `path` from `fs` into a fresh process, mapping its `PT_LOAD`
/// segments, setting up a 1 MiB user stack, and installing the initial
/// saved frame. Returns the new process's pid, runnable.
pub fn load(fs: &impl Filesystem, path: &str, name: &str) -> Result<u32, LoadError> {
    let inode: InodeNumber = fs.find_inode(path)?;

    let mut ehdr_buf = [0_u8; EHDR_SIZE];
    fs.read_inode(inode, 0, &mut ehdr_buf);
    let header = parse_header(&ehdr_buf)?;
    assert_eq!(header.phentsize as usize, PHDR_SIZE, "unexpected program header size");

    let (pid, mut space) = process::spawn(name).map_err(LoadError::Process)?;

    for i in 0..header.phnum {
        let mut phdr_buf = [0_u8; PHDR_SIZE];
        fs.read_inode(inode, header.phoff + u64::from(i) * u64::from(header.phentsize), &mut phdr_buf);
        let phdr = parse_program_header(&phdr_buf);
        if phdr.p_type != PT_LOAD {
            continue;
        }
        load_segment(fs, inode, &phdr, &mut space)?;
    }

    let stack_top = setup_user_stack(&mut space)?;

    let saved_frame = process::with_process(pid, |p| {
        p.entry = header.entry;
        p.user_sp = stack_top;
        p.saved_frame()
    })
    .expect("pid was just created");
    // SAFETY: `saved_frame` points into the process's freshly allocated
    // kernel stack, which no other hart or handler can yet observe.
    unsafe { saved_frame.write(initial_frame(header.entry, stack_top)) };
    process::mark_runnable(pid);

    Ok(pid)
}

fn load_segment(
    fs: &impl Filesystem,
    inode: InodeNumber,
    phdr: &ProgramHeader,
    space: &mut AddressSpace,
) -> Result<(), LoadError> {
    let flags = segment_flags(phdr.p_flags);
    let page_size = config::PAGE_SIZE;
    let start = phdr.p_vaddr & !(page_size - 1);
    let end = (phdr.p_vaddr + phdr.p_memsz).next_multiple_of(page_size);

    let mut va = start;
    while va < end {
        let pa = map_zeroed_page(space, va, flags)?;

        // Copy only the intersection of this page with the segment's file
        // extent; bytes outside it (BSS, and any padding to the page
        // boundary) stay zero from the fresh frame.
        let page_start_offset = va.saturating_sub(phdr.p_vaddr);
        let page_end_offset = (va + page_size).saturating_sub(phdr.p_vaddr);
        let file_start = page_start_offset.min(phdr.p_filesz);
        let file_end = page_end_offset.min(phdr.p_filesz);
        if file_end > file_start {
            let copy_len = (file_end - file_start) as usize;
            let dest_offset = file_start.saturating_sub(page_start_offset) as usize;
            // SAFETY: `pa` was just mapped and zeroed above, with room for
            // a full page.
            let dest = unsafe {
                core::slice::from_raw_parts_mut(
                    core::ptr::without_provenance_mut::<u8>(pa as usize).add(dest_offset),
                    copy_len,
                )
            };
            fs.read_inode(inode, phdr.p_offset + file_start, dest);
        }

        if !flags.user_execute_never {
            sync_instruction_stream(pa, page_size);
        }

        va += page_size;
    }
    Ok(())
}

fn setup_user_stack(space: &mut AddressSpace) -> Result<u64, LoadError> {
    let base = config::USER_STACK_TOP - config::USER_STACK_SIZE;
    let mut va = base;
    while va < config::USER_STACK_TOP {
        map_zeroed_page(space, va, MapFlags::USER_DATA)?;
        va += config::PAGE_SIZE;
    }
    Ok(config::USER_STACK_TOP)
}

/// Builds the initial saved frame for a just-loaded process: zero
/// registers, `elr_el1` = entry, `sp_el0` = stack top, `spsr_el1` = EL0
/// with interrupts unmasked.
pub fn initial_frame(entry: u64, user_sp: u64) -> SavedFrame {
    let mut frame = SavedFrame::zeroed();
    frame.elr_el1 = entry;
    frame.sp_el0 = user_sp;
    frame.spsr_el1 = SavedFrame::EL0_UNMASKED;
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header(entry: u64, phnum: u16) -> [u8; EHDR_SIZE] {
        let mut buf = [0_u8; EHDR_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = CLASS_64;
        buf[5] = DATA_LITTLE_ENDIAN;
        buf[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        buf[18..20].copy_from_slice(&EM_AARCH64.to_le_bytes());
        buf[24..32].copy_from_slice(&entry.to_le_bytes());
        buf[32..40].copy_from_slice(&(EHDR_SIZE as u64).to_le_bytes());
        buf[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        buf[56..58].copy_from_slice(&phnum.to_le_bytes());
        buf
    }

    crate::add_test!(parse_header_accepts_well_formed_aarch64_exec, {
        let buf = sample_header(0x4000_0000, 1);
        let header = parse_header(&buf).expect("well-formed header should parse");
        assert_eq!(header.entry, 0x4000_0000);
        assert_eq!(header.phnum, 1);
    });

    crate::add_test!(parse_header_rejects_bad_magic, {
        let mut buf = sample_header(0, 0);
        buf[0] = 0;
        assert!(matches!(parse_header(&buf), Err(LoadError::BadMagic)));
    });

    crate::add_test!(parse_header_rejects_wrong_machine, {
        let mut buf = sample_header(0, 0);
        buf[18..20].copy_from_slice(&0_u16.to_le_bytes());
        assert!(matches!(parse_header(&buf), Err(LoadError::WrongMachine)));
    });

    crate::add_test!(segment_flags_maps_permission_bits, {
        assert!(matches!(segment_flags(PF_EXECUTE | PF_READ), f if !f.writeable && !f.user_execute_never));
        assert!(matches!(segment_flags(PF_WRITE | PF_READ), f if f.writeable && f.user_execute_never));
        assert!(matches!(segment_flags(PF_READ), f if !f.writeable && f.user_execute_never));
    });
}
