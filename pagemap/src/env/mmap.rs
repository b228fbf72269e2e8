use std::{
    fs::{File, OpenOptions},
    io::{Error, ErrorKind, Result},
    path::{Path, PathBuf},
};

use log::debug;
use memmap2::{MmapMut, MmapOptions, MmapRaw};

use super::{AllocationInfo, Env, Mapping, StorageFile};

/// An implementation of [`Env`] based on memory-mapped files.
///
/// Every call to [`StorageFile::allocate_more`] maps the whole file again, so
/// a mapping always consists of exactly one region.
#[derive(Clone, Debug, Default)]
pub struct MmapEnv;

impl Env for MmapEnv {
    type File = MmapFile;

    fn open_file(&self, path: &Path, copy_on_write: bool) -> Result<Self::File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(MmapFile {
            path: path.to_owned(),
            file,
            copy_on_write,
        })
    }

    fn supports_prefetch(&self) -> bool {
        cfg!(unix)
    }

    fn prefetch(&self, addr: *mut u8, len: usize) -> Result<()> {
        // Safety: `WillNeed` never changes the content of the memory.
        unsafe { advise(addr, len, Advice::WillNeed) }
    }

    unsafe fn discard(&self, addr: *mut u8, len: usize) -> Result<()> {
        advise(addr, len, Advice::DontNeed)
    }
}

/// A file mapped by [`MmapEnv`].
#[derive(Debug)]
pub struct MmapFile {
    path: PathBuf,
    file: File,
    copy_on_write: bool,
}

impl StorageFile for MmapFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn allocate_more(&self, size: u64) -> Result<Box<dyn Mapping>> {
        let len = usize::try_from(size).map_err(|_| {
            Error::new(
                ErrorKind::InvalidInput,
                format!("mapping size {size} exceeds the address space"),
            )
        })?;
        if self.len()? < size {
            debug!("Extend '{}' to {size} bytes", self.path.display());
            self.file.set_len(size)?;
        }
        if len == 0 {
            return Ok(Box::new(MmapMapping {
                region: Region::Empty,
                allocations: Vec::new(),
            }));
        }

        let (region, base) = if self.copy_on_write {
            // Safety: the mapping is private, modifications of the file by
            // other processes are the only hazard and the store owns the file.
            let mut mmap = unsafe { MmapOptions::new().len(len).map_copy(&self.file)? };
            let base = mmap.as_mut_ptr();
            (Region::Private(mmap), base)
        } else {
            let mmap = MmapOptions::new().len(len).map_raw(&self.file)?;
            let base = mmap.as_mut_ptr();
            (Region::Shared(mmap), base)
        };
        Ok(Box::new(MmapMapping {
            region,
            allocations: vec![AllocationInfo::new(base, len)],
        }))
    }

    fn sync(&self) -> Result<()> {
        if self.copy_on_write {
            return Ok(());
        }
        self.file.sync_data()
    }
}

enum Region {
    Empty,
    Shared(MmapRaw),
    Private(MmapMut),
}

struct MmapMapping {
    region: Region,
    allocations: Vec<AllocationInfo>,
}

impl Mapping for MmapMapping {
    fn allocations(&self) -> &[AllocationInfo] {
        &self.allocations
    }

    fn flush(&self) -> Result<()> {
        match &self.region {
            Region::Shared(mmap) => mmap.flush(),
            Region::Private(_) | Region::Empty => Ok(()),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Advice {
    WillNeed,
    DontNeed,
}

/// Calls `madvise` on the OS pages covering `len` bytes at `addr`.
#[cfg(unix)]
unsafe fn advise(addr: *mut u8, len: usize, advice: Advice) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let advice = match advice {
        Advice::WillNeed => libc::MADV_WILLNEED,
        Advice::DontNeed => libc::MADV_DONTNEED,
    };
    let os_page = os_page_size();
    let start = addr as usize & !(os_page - 1);
    let len = len + (addr as usize - start);
    if libc::madvise(start as *mut libc::c_void, len, advice) != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
unsafe fn advise(_addr: *mut u8, _len: usize, _advice: Advice) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn os_page_size() -> usize {
    use once_cell::sync::Lazy;

    static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
        // Safety: `sysconf` has no preconditions.
        match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            n if n > 0 => n as usize,
            _ => 4096,
        }
    });
    *PAGE_SIZE
}
