use std::{
    fmt,
    ops::{Deref, Range},
    ptr::NonNull,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use log::debug;
use parking_lot::Mutex;

use super::{
    memory_lock::LockedRegions, stats::AtomicStoreStats, Error, Result, PAGE_SIZE,
    PREFETCH_GRANULE_PAGES,
};
use crate::{
    env::{AllocationInfo, Mapping},
    util::bitmap::FixedBitmap,
};

/// Set in `state` once the mapping has been released. The remaining bits hold
/// the number of pins.
const RELEASED: usize = 1 << (usize::BITS - 1);

/// An immutable, reference-counted snapshot of a store's memory mapping.
///
/// A generation is created whenever the store grows. Pointers derived from a
/// generation stay valid as long as at least one [`GenerationPin`] on it is
/// alive; the mapping is released exactly once, when the last pin goes away.
pub struct Generation {
    id: u64,
    store_id: u64,
    num_pages: u64,
    base: *mut u8,
    allocations: Vec<AllocationInfo>,

    state: AtomicUsize,
    mapping: Mutex<Option<Box<dyn Mapping>>>,
    locked: Mutex<Option<LockedRegions>>,
    prefetched: Mutex<FixedBitmap>,

    stats: Arc<AtomicStoreStats>,
}

// Safety: `base` and `allocations` describe memory owned by `mapping`, which
// is only released after the last pin is dropped. The generation itself never
// writes through them.
unsafe impl Send for Generation {}
unsafe impl Sync for Generation {}

/// A pin on a [`Generation`], keeping its mapping alive.
///
/// Cloning a pin pins the generation again; dropping it releases the pin.
pub struct GenerationPin {
    generation: Arc<Generation>,
}

impl Generation {
    pub(crate) fn new(
        id: u64,
        store_id: u64,
        mapping: Box<dyn Mapping>,
        stats: Arc<AtomicStoreStats>,
    ) -> Arc<Generation> {
        let allocations = mapping.allocations().to_vec();
        let size: usize = allocations.iter().map(AllocationInfo::size).sum();
        let num_pages = (size / PAGE_SIZE) as u64;
        let base = allocations
            .first()
            .map_or(std::ptr::null_mut(), AllocationInfo::base_address);
        let granules = u32::try_from(num_pages.div_ceil(PREFETCH_GRANULE_PAGES)).unwrap_or(u32::MAX);
        Arc::new(Generation {
            id,
            store_id,
            num_pages,
            base,
            allocations,
            state: AtomicUsize::new(0),
            mapping: Mutex::new(Some(mapping)),
            locked: Mutex::new(None),
            prefetched: Mutex::new(FixedBitmap::new(granules)),
            stats,
        })
    }

    /// The id of this generation, unique within its store.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The id of the store this generation maps.
    #[inline]
    pub fn store_id(&self) -> u64 {
        self.store_id
    }

    /// The number of pages covered by this generation.
    #[inline]
    pub fn num_pages(&self) -> u64 {
        self.num_pages
    }

    /// The address page 0 is mapped at, null if no page is mapped.
    #[inline]
    pub fn base_address(&self) -> *mut u8 {
        self.base
    }

    /// The mapped regions, in file order.
    #[inline]
    pub fn allocations(&self) -> &[AllocationInfo] {
        &self.allocations
    }

    /// The number of live pins.
    pub fn ref_count(&self) -> usize {
        self.state.load(Ordering::Acquire) & !RELEASED
    }

    /// Returns true if the mapping has been released.
    pub fn is_released(&self) -> bool {
        self.state.load(Ordering::Acquire) & RELEASED != 0
    }

    /// Returns true if any region of this generation is locked in memory.
    pub fn is_locked(&self) -> bool {
        self.locked
            .lock()
            .as_ref()
            .map_or(false, |locked| !locked.is_empty())
    }

    /// Pins this generation.
    ///
    /// Fails with [`Error::InvalidMappingState`] if the mapping has already
    /// been released.
    pub fn pin(self: &Arc<Self>) -> Result<GenerationPin> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current & RELEASED != 0 {
                return Err(Error::InvalidMappingState(self.id));
            }
            match self.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.stats.pins.inc();
        Ok(GenerationPin {
            generation: self.clone(),
        })
    }

    fn release(&self) {
        let former = self.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(former & !RELEASED > 0, "release without pin");
        if former == 1
            && self
                .state
                .compare_exchange(0, RELEASED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.unmap();
        }
    }

    fn unmap(&self) {
        if let Some(locked) = self.locked.lock().take() {
            locked.unlock_all();
        }
        let mapping = self.mapping.lock().take();
        if mapping.is_some() {
            debug!(
                "Release generation {} of {} pages",
                self.id, self.num_pages
            );
            drop(mapping);
            self.stats.generations_released.inc();
        }
    }

    pub(crate) fn set_locked(&self, regions: LockedRegions) {
        *self.locked.lock() = Some(regions);
    }

    /// Returns the address of `page`.
    ///
    /// # Safety
    ///
    /// `page` must be less than [`Self::num_pages`] and the generation must be
    /// pinned for as long as the address is used.
    pub(crate) unsafe fn page_ptr(&self, page: u64) -> NonNull<u8> {
        debug_assert!(page < self.num_pages);
        NonNull::new_unchecked(self.base.add(page as usize * PAGE_SIZE))
    }

    /// Writes modified pages back to the file.
    pub(crate) fn flush(&self) -> std::io::Result<()> {
        match self.mapping.lock().as_ref() {
            Some(mapping) => mapping.flush(),
            None => Ok(()),
        }
    }

    /// Translates `count` pages starting at `page` into address ranges,
    /// split at region boundaries. Pages past the end are ignored.
    pub(crate) fn translate(&self, page: u64, count: u64) -> Vec<AllocationInfo> {
        let end_page = page.saturating_add(count).min(self.num_pages);
        if page >= end_page {
            return Vec::new();
        }
        let start = page as usize * PAGE_SIZE;
        let end = end_page as usize * PAGE_SIZE;

        let mut ranges = Vec::new();
        let mut offset = 0usize;
        for region in &self.allocations {
            let (region_start, region_end) = (offset, offset + region.size());
            offset = region_end;
            if region_end <= start {
                continue;
            }
            if region_start >= end {
                break;
            }
            let from = start.max(region_start);
            let to = end.min(region_end);
            let addr = region.base_address().wrapping_add(from - region_start);
            ranges.push(AllocationInfo::new(addr, to - from));
        }
        ranges
    }

    /// Returns the page ranges in `[page, page + count)` that have not been
    /// prefetched yet and marks them as prefetched.
    ///
    /// Ranges are widened to whole prefetch granules.
    pub(crate) fn take_unprefetched(&self, page: u64, count: u64) -> Vec<Range<u64>> {
        let end = page.saturating_add(count).min(self.num_pages);
        if page >= end {
            return Vec::new();
        }

        let mut prefetched = self.prefetched.lock();
        let cap = prefetched.cap() as u64;
        let mut ranges: Vec<Range<u64>> = Vec::new();
        for granule in page / PREFETCH_GRANULE_PAGES..=(end - 1) / PREFETCH_GRANULE_PAGES {
            if granule < cap && !prefetched.set(granule as u32) {
                continue;
            }
            let from = granule * PREFETCH_GRANULE_PAGES;
            let to = (from + PREFETCH_GRANULE_PAGES).min(self.num_pages);
            match ranges.last_mut() {
                Some(last) if last.end == from => last.end = to,
                _ => ranges.push(from..to),
            }
        }
        ranges
    }

    /// Forgets that the granules covering `[page, page + count)` have been
    /// prefetched.
    pub(crate) fn reset_prefetched(&self, page: u64, count: u64) {
        let end = page.saturating_add(count).min(self.num_pages);
        if page >= end {
            return;
        }
        let mut prefetched = self.prefetched.lock();
        let cap = prefetched.cap() as u64;
        for granule in page / PREFETCH_GRANULE_PAGES..=(end - 1) / PREFETCH_GRANULE_PAGES {
            if granule >= cap {
                break;
            }
            prefetched.clear(granule as u32);
        }
    }

    pub(crate) fn reset_all_prefetched(&self) {
        self.prefetched.lock().clear_all();
    }

    pub(crate) fn mark_all_prefetched(&self) {
        let mut prefetched = self.prefetched.lock();
        if prefetched.is_full() {
            return;
        }
        for granule in 0..prefetched.cap() {
            prefetched.set(granule);
        }
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        // Generations that were never pinned still own their mapping.
        if *self.state.get_mut() & RELEASED == 0 {
            self.unmap();
        }
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generation")
            .field("id", &self.id)
            .field("store_id", &self.store_id)
            .field("num_pages", &self.num_pages)
            .field("ref_count", &self.ref_count())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Folds adjacent regions into as few ranges as possible.
pub(crate) fn coalesce(regions: &[AllocationInfo]) -> Vec<AllocationInfo> {
    let mut folded: Vec<AllocationInfo> = Vec::with_capacity(regions.len());
    for region in regions.iter().filter(|r| r.size() > 0) {
        match folded.last_mut() {
            Some(last) if last.is_adjacent_to(region) => {
                *last = AllocationInfo::new(last.base_address(), last.size() + region.size());
            }
            _ => folded.push(*region),
        }
    }
    folded
}

impl GenerationPin {
    #[inline]
    pub(crate) fn generation(&self) -> &Arc<Generation> {
        &self.generation
    }
}

impl Deref for GenerationPin {
    type Target = Generation;

    fn deref(&self) -> &Self::Target {
        &self.generation
    }
}

impl Clone for GenerationPin {
    fn clone(&self) -> Self {
        // Can't be released while `self` holds a pin.
        self.generation.state.fetch_add(1, Ordering::AcqRel);
        self.generation.stats.pins.inc();
        GenerationPin {
            generation: self.generation.clone(),
        }
    }
}

impl Drop for GenerationPin {
    fn drop(&mut self) {
        self.generation.release();
    }
}

impl fmt::Debug for GenerationPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GenerationPin")
            .field(&self.generation)
            .finish()
    }
}
