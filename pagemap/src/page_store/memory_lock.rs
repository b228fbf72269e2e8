//! Locking mapped regions in physical memory.
//!
//! Locking keeps pages out of swap and core dumps. How a failed lock can be
//! remedied depends on the platform, so the platform specific parts live
//! behind [`MemoryPolicy`].

use std::{io, sync::Arc};

use log::{debug, warn};

use super::{generation::Generation, stats::AtomicStoreStats, Error, Result};
use crate::env::AllocationInfo;

/// Platform specific memory locking.
pub trait MemoryPolicy: Send + Sync {
    /// A short name of the policy, used in logs.
    fn name(&self) -> &'static str;

    /// Locks `region` in physical memory.
    fn lock(&self, region: &AllocationInfo) -> io::Result<()>;

    /// Unlocks a region locked by [`MemoryPolicy::lock`].
    fn unlock(&self, region: &AllocationInfo) -> io::Result<()>;

    /// Tries to make room for locking `region` after a failed lock.
    ///
    /// Returns true if a retry may succeed.
    fn remediate(&self, region: &AllocationInfo) -> io::Result<bool>;

    /// Tells the operator how to make locking `region` possible.
    fn advice(&self, region: &AllocationInfo, err: &io::Error) -> String;
}

/// Returns the memory policy of the platform this crate is built for.
pub fn native_memory_policy() -> Arc<dyn MemoryPolicy> {
    #[cfg(windows)]
    let policy = Arc::new(WindowsMemoryPolicy);
    #[cfg(not(windows))]
    let policy = Arc::new(PosixMemoryPolicy);
    policy
}

/// Memory locking with `mlock(2)`.
///
/// The locked amount is bounded by `RLIMIT_MEMLOCK`, which can only be raised
/// from outside the process.
#[derive(Clone, Copy, Debug, Default)]
pub struct PosixMemoryPolicy;

#[cfg(unix)]
impl MemoryPolicy for PosixMemoryPolicy {
    fn name(&self) -> &'static str {
        "posix"
    }

    fn lock(&self, region: &AllocationInfo) -> io::Result<()> {
        // Safety: locking doesn't change the content of the memory.
        let ret = unsafe { libc::mlock(region.base_address() as *const _, region.size()) };
        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn unlock(&self, region: &AllocationInfo) -> io::Result<()> {
        // Safety: see `lock`.
        let ret = unsafe { libc::munlock(region.base_address() as *const _, region.size()) };
        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn remediate(&self, _: &AllocationInfo) -> io::Result<bool> {
        Ok(false)
    }

    fn advice(&self, region: &AllocationInfo, err: &io::Error) -> String {
        format!(
            "Failed to lock {} bytes in memory: {err}. Raise the RLIMIT_MEMLOCK limit of the \
             process (for example `ulimit -l unlimited`, or `memlock` in \
             /etc/security/limits.conf) or disable memory locking",
            region.size()
        )
    }
}

#[cfg(not(unix))]
impl MemoryPolicy for PosixMemoryPolicy {
    fn name(&self) -> &'static str {
        "posix"
    }

    fn lock(&self, _: &AllocationInfo) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    fn unlock(&self, _: &AllocationInfo) -> io::Result<()> {
        Ok(())
    }

    fn remediate(&self, _: &AllocationInfo) -> io::Result<bool> {
        Ok(false)
    }

    fn advice(&self, region: &AllocationInfo, err: &io::Error) -> String {
        format!("Failed to lock {} bytes in memory: {err}", region.size())
    }
}

/// Memory locking with `VirtualLock`.
///
/// The locked amount is bounded by the working set of the process, which the
/// process may raise itself.
#[cfg(windows)]
#[derive(Clone, Copy, Debug, Default)]
pub struct WindowsMemoryPolicy;

#[cfg(windows)]
mod win32 {
    use std::ffi::c_void;

    pub(super) type Handle = *mut c_void;

    #[link(name = "kernel32")]
    extern "system" {
        pub(super) fn GetCurrentProcess() -> Handle;
        pub(super) fn GetProcessWorkingSetSize(
            process: Handle,
            minimum: *mut usize,
            maximum: *mut usize,
        ) -> i32;
        pub(super) fn SetProcessWorkingSetSize(process: Handle, minimum: usize, maximum: usize)
            -> i32;
        pub(super) fn VirtualLock(addr: *mut c_void, size: usize) -> i32;
        pub(super) fn VirtualUnlock(addr: *mut c_void, size: usize) -> i32;
    }
}

#[cfg(windows)]
impl MemoryPolicy for WindowsMemoryPolicy {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn lock(&self, region: &AllocationInfo) -> io::Result<()> {
        // Safety: locking doesn't change the content of the memory.
        let ok = unsafe { win32::VirtualLock(region.base_address().cast(), region.size()) };
        if ok != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn unlock(&self, region: &AllocationInfo) -> io::Result<()> {
        // Safety: see `lock`.
        let ok = unsafe { win32::VirtualUnlock(region.base_address().cast(), region.size()) };
        if ok != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn remediate(&self, region: &AllocationInfo) -> io::Result<bool> {
        let (mut minimum, mut maximum) = (0usize, 0usize);
        // Safety: the pseudo handle of the current process is always valid.
        unsafe {
            let process = win32::GetCurrentProcess();
            if win32::GetProcessWorkingSetSize(process, &mut minimum, &mut maximum) == 0 {
                return Err(io::Error::last_os_error());
            }
            let minimum = minimum.saturating_add(region.size());
            let maximum = maximum.max(minimum);
            if win32::SetProcessWorkingSetSize(process, minimum, maximum) == 0 {
                return Err(io::Error::last_os_error());
            }
            debug!("Raised working set to [{minimum}, {maximum}] bytes");
        }
        Ok(true)
    }

    fn advice(&self, region: &AllocationInfo, err: &io::Error) -> String {
        format!(
            "Failed to lock {} bytes in memory: {err}. Raise the minimum working set of the \
             process (SetProcessWorkingSetSize, or grant the account the 'Lock pages in memory' \
             privilege) or disable memory locking",
            region.size()
        )
    }
}

/// Regions of a generation that are locked in memory.
pub(crate) struct LockedRegions {
    policy: Arc<dyn MemoryPolicy>,
    regions: Vec<AllocationInfo>,
}

impl LockedRegions {
    pub(crate) fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Unlocks every region. Failures are ignored, the memory is about to be
    /// unmapped anyway.
    pub(crate) fn unlock_all(self) {
        for region in &self.regions {
            if let Err(err) = self.policy.unlock(region) {
                debug!("Unlock {} bytes: {err}", region.size());
            }
        }
    }
}

/// Locks every region of `generation` in memory.
///
/// If a region can't be locked and `fatal` is false, the region is left
/// unlocked. Otherwise the policy gets one chance to remediate before the
/// lock fails with [`Error::InsufficientMemory`].
pub(crate) fn lock_generation(
    policy: &Arc<dyn MemoryPolicy>,
    generation: &Generation,
    fatal: bool,
    stats: &AtomicStoreStats,
) -> Result<()> {
    let mut locked = LockedRegions {
        policy: policy.clone(),
        regions: Vec::with_capacity(generation.allocations().len()),
    };
    let outcome = lock_regions(policy, generation, fatal, stats, &mut locked.regions);
    // Record even a partial lock so it is undone on release.
    generation.set_locked(locked);
    outcome
}

fn lock_regions(
    policy: &Arc<dyn MemoryPolicy>,
    generation: &Generation,
    fatal: bool,
    stats: &AtomicStoreStats,
    locked: &mut Vec<AllocationInfo>,
) -> Result<()> {
    for region in generation.allocations().iter().filter(|r| r.size() > 0) {
        let Err(err) = policy.lock(region) else {
            locked.push(*region);
            continue;
        };
        stats.lock_failures.inc();
        if !fatal {
            warn!(
                "Generation {} runs with {} bytes unlocked ({} policy): {err}",
                generation.id(),
                region.size(),
                policy.name()
            );
            continue;
        }

        let retry = match policy.remediate(region) {
            Ok(true) => policy.lock(region),
            Ok(false) => Err(err),
            Err(remediate_err) => {
                warn!("Remediation with {} policy failed: {remediate_err}", policy.name());
                Err(err)
            }
        };
        match retry {
            Ok(()) => locked.push(*region),
            Err(err) => return Err(Error::InsufficientMemory(policy.advice(region, &err))),
        }
    }
    debug!(
        "Locked {} regions of generation {}",
        locked.len(),
        generation.id()
    );
    Ok(())
}
