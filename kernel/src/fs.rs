//! The read-only filesystem interface the ELF loader reads through. The
//! driver behind this interface is out of scope for this crate; only the
//! boundary it presents to [`crate::elf`] lives here, plus an in-memory
//! test double exercising that boundary.
//!
//! Grounded on the `AllocatorBackend`-style narrow trait seam in
//! `os/src/heap/mod.rs` (a minimal interface a concrete backend plugs
//! into), applied here to the filesystem/loader boundary instead of the
//! heap/page-allocator one.

/// Opaque inode handle. Paths are `/`-prefixed single-component names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeNumber(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotFound;

/// The boundary the ELF loader reads through. A concrete block-backed
/// driver implements this; this crate does not provide one.
pub trait Filesystem {
    /// Resolves `path` to an inode number.
    fn find_inode(&self, path: &str) -> Result<InodeNumber, NotFound>;

    /// Reads up to `out.len()` bytes starting at `offset` into `out`,
    /// returning the number of bytes actually read. Offsets past the
    /// inode's extent, and holes within it, read as zeroes.
    fn read_inode(&self, inode: InodeNumber, offset: u64, out: &mut [u8]) -> usize;
}

/// An in-memory filesystem double for tests and for bring-up before a
/// real block-backed driver is wired in: a flat map of path to bytes.
pub struct MemoryFs {
    files: alloc::vec::Vec<(alloc::string::String, alloc::vec::Vec<u8>)>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self { files: alloc::vec::Vec::new() }
    }

    pub fn insert(&mut self, path: &str, contents: alloc::vec::Vec<u8>) {
        self.files.push((alloc::string::String::from(path), contents));
    }
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl Filesystem for MemoryFs {
    fn find_inode(&self, path: &str) -> Result<InodeNumber, NotFound> {
        self.files
            .iter()
            .position(|(p, _)| p == path)
            .map(|i| InodeNumber(i as u64))
            .ok_or(NotFound)
    }

    fn read_inode(&self, inode: InodeNumber, offset: u64, out: &mut [u8]) -> usize {
        let Some((_, contents)) = self.files.get(inode.0 as usize) else {
            out.fill(0);
            return 0;
        };
        let offset = offset as usize;
        if offset >= contents.len() {
            out.fill(0);
            return 0;
        }
        let available = &contents[offset..];
        let read_len = available.len().min(out.len());
        out[..read_len].copy_from_slice(&available[..read_len]);
        out[read_len..].fill(0);
        read_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::add_test!(memory_fs_round_trips_a_file, {
        let mut fs = MemoryFs::new();
        fs.insert("/init", alloc::vec![1, 2, 3, 4]);
        let inode = fs.find_inode("/init").expect("file should resolve");
        let mut buf = [0_u8; 8];
        let n = fs.read_inode(inode, 0, &mut buf);
        assert_eq!(n, 4, "only the file's own bytes count toward the return value");
        assert_eq!(&buf[..4], &[1, 2, 3, 4]);
        assert_eq!(&buf[4..], &[0, 0, 0, 0]);
    });

    crate::add_test!(memory_fs_missing_path_is_not_found, {
        let fs = MemoryFs::new();
        assert_eq!(fs.find_inode("/missing"), Err(NotFound));
    });
}
