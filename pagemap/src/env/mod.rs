//! Platform primitives the page store is built on.
//!
//! The page store never talks to the operating system directly. Mapping,
//! growing and advising memory all go through an [`Env`], so that stores can
//! run on top of different platforms (and tests can observe what happens).

use std::{io::Result, path::Path};

mod mmap;
pub use mmap::{MmapEnv, MmapFile};

/// Describes one contiguous mapped memory region.
///
/// An `AllocationInfo` is a plain description: it does not own the memory it
/// points to. The address is only dereferenced while the [`Mapping`] that
/// produced it is alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationInfo {
    base: *mut u8,
    size: usize,
}

// Safety: the address is never dereferenced through `AllocationInfo` itself,
// only through a pinned generation that keeps the mapping alive.
unsafe impl Send for AllocationInfo {}
unsafe impl Sync for AllocationInfo {}

impl AllocationInfo {
    /// Creates a description of `size` bytes mapped at `base`.
    pub fn new(base: *mut u8, size: usize) -> Self {
        AllocationInfo { base, size }
    }

    /// The first byte of the region.
    #[inline]
    pub fn base_address(&self) -> *mut u8 {
        self.base
    }

    /// The length of the region in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns true if `next` starts exactly where this region ends.
    #[inline]
    pub fn is_adjacent_to(&self, next: &AllocationInfo) -> bool {
        self.base as usize + self.size == next.base as usize
    }
}

/// Provides an environment to interact with a specific platform.
pub trait Env: Clone + Send + Sync + 'static {
    /// The backing file type of this environment.
    type File: StorageFile;

    /// Opens (or creates) the file at `path`.
    ///
    /// If `copy_on_write` is true, mappings of the file are private and
    /// writes through them never reach the file.
    fn open_file(&self, path: &Path, copy_on_write: bool) -> Result<Self::File>;

    /// Returns true if [`Env::prefetch`] does anything on this platform.
    fn supports_prefetch(&self) -> bool;

    /// Advises the platform that `len` bytes at `addr` will be needed soon.
    ///
    /// This is only a hint, it never changes the content of the memory.
    fn prefetch(&self, addr: *mut u8, len: usize) -> Result<()>;

    /// Advises the platform that the resident pages of `len` bytes at `addr`
    /// can be dropped.
    ///
    /// # Safety
    ///
    /// The range must be part of a live mapping of a file. For file-backed
    /// shared mappings the content is re-read from the file on next access,
    /// private pages are lost.
    unsafe fn discard(&self, addr: *mut u8, len: usize) -> Result<()>;
}

/// A file that can be grown and mapped into memory.
pub trait StorageFile: Send + Sync + 'static {
    /// The path of the file.
    fn path(&self) -> &Path;

    /// The current length of the file in bytes.
    fn len(&self) -> Result<u64>;

    /// Extends the file to at least `size` bytes and maps `[0, size)`.
    ///
    /// Mappings returned by former calls stay valid until they are dropped.
    fn allocate_more(&self, size: u64) -> Result<Box<dyn Mapping>>;

    /// Synchronizes the content of the file to disk.
    fn sync(&self) -> Result<()>;
}

/// A live mapping of a file. Dropping it unmaps the memory.
pub trait Mapping: Send + Sync {
    /// The regions of this mapping, in file order.
    fn allocations(&self) -> &[AllocationInfo];

    /// Writes modified pages of this mapping back to the file.
    fn flush(&self) -> Result<()>;
}
