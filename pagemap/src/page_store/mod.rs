use std::{
    fmt,
    ops::Range,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use log::{debug, error, info};
use parking_lot::Mutex;

pub use crate::error::{Error, Result};
use crate::{
    env::{AllocationInfo, Env, StorageFile},
    util::atomic::Sequencer,
};

mod context;
pub use context::{ContextOptions, MappedFileInfo, SharedContext};

mod generation;
use generation::coalesce;
pub use generation::{Generation, GenerationPin};

mod growth;
pub use growth::{round_allocation_size, GrowthPolicy, MAX_INCREASE, MIN_INCREASE};

mod low_memory;
pub use low_memory::{LowMemoryHandler, LowMemoryMonitor};

mod memory_lock;
use memory_lock::lock_generation;
#[cfg(windows)]
pub use memory_lock::WindowsMemoryPolicy;
pub use memory_lock::{native_memory_policy, MemoryPolicy, PosixMemoryPolicy};

mod prefetch;
use prefetch::PrefetchTask;

mod stats;
use stats::AtomicStoreStats;
pub use stats::StoreStats;

mod txn;
pub use txn::{PagePtr, TxnState};

#[cfg(test)]
mod testutil;

/// The size of a page in bytes.
pub const PAGE_SIZE: usize = 8 << 10;

/// The default name of the data file of a database.
pub const DATA_FILE_NAME: &str = "data.pages";

/// The number of pages tracked by one "already prefetched" marker.
pub(crate) const PREFETCH_GRANULE_PAGES: u64 = 16;

/// Options to configure a page store.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct Options {
    /// If true, the file is mapped privately. Writes through the mapping never
    /// reach the file, and separate generations don't share their writes.
    ///
    /// Default: false
    pub copy_on_write: bool,

    /// The name of a file that must not grow while it is mapped
    /// copy-on-write.
    ///
    /// Default: "data.pages"
    pub protected_file_name: String,

    /// If true, every generation is locked in physical memory.
    ///
    /// Default: false
    pub lock_memory: bool,

    /// If true, a region that can't be locked is remediated once and then
    /// fails with [`Error::InsufficientMemory`]. Otherwise the store keeps
    /// running with the region unlocked.
    ///
    /// Default: true
    pub lock_failure_is_fatal: bool,

    /// If false, prefetch requests are ignored.
    ///
    /// Default: true
    pub prefetch: bool,

    /// The minimum size of the file when the store is opened, rounded up to
    /// whole pages.
    ///
    /// Default: 0
    pub initial_size: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            copy_on_write: false,
            protected_file_name: DATA_FILE_NAME.to_owned(),
            lock_memory: false,
            lock_failure_is_fatal: true,
            prefetch: true,
            initial_size: 0,
        }
    }
}

type Listener = Box<dyn Fn(&Generation) + Send + Sync>;

struct StoreState {
    /// The baseline pin of the current generation, `None` once disposed.
    current: Option<GenerationPin>,
    growth: GrowthPolicy,
    listeners: Vec<Listener>,
}

/// A growable file, mapped into memory and addressed by page number.
///
/// Every growth maps the file anew and installs the mapping as a new
/// [`Generation`]. Transactions pin the generations they read through, so
/// pointers handed out earlier stay valid while the store keeps growing.
pub struct PageStore<E: Env> {
    id: u64,
    options: Options,
    env: E,
    file: E::File,
    context: Arc<SharedContext>,

    state: Mutex<StoreState>,
    allocated_pages: AtomicU64,
    disposed: AtomicBool,

    generation_ids: Sequencer,
    stats: Arc<AtomicStoreStats>,
}

impl<E: Env> PageStore<E> {
    /// Opens the file at `path` as a page store.
    ///
    /// The file is created if it doesn't exist and extended to
    /// [`Options::initial_size`] if it is smaller.
    pub fn open<P: AsRef<Path>>(
        env: E,
        context: Arc<SharedContext>,
        path: P,
        options: Options,
    ) -> Result<Self> {
        let path = path.as_ref();
        let file = env.open_file(path, options.copy_on_write)?;
        let file_pages = file.len()? / PAGE_SIZE as u64;
        let initial_pages = options.initial_size.div_ceil(PAGE_SIZE as u64);
        if initial_pages > file_pages && is_protected(&options, file.path()) {
            return Err(Error::WriteProtectedGrowth(file.path().to_owned()));
        }
        let num_pages = file_pages.max(initial_pages);

        let stats = Arc::new(AtomicStoreStats::default());
        let generation_ids = Sequencer::default();
        let id = context.next_store_id();
        let generation = map_generation(
            &file,
            &context,
            &options,
            &stats,
            id,
            generation_ids.next(),
            num_pages * PAGE_SIZE as u64,
        )?;
        let baseline = generation.pin()?;
        stats.generations_installed.inc();

        context.register_mapped_file(MappedFileInfo {
            store_id: id,
            path: file.path().to_owned(),
            size: num_pages * PAGE_SIZE as u64,
        });
        info!(
            "Open store {id} '{}' with {num_pages} pages, copy_on_write {}",
            file.path().display(),
            options.copy_on_write
        );

        Ok(PageStore {
            id,
            options,
            env,
            file,
            context,
            state: Mutex::new(StoreState {
                current: Some(baseline),
                growth: GrowthPolicy::default(),
                listeners: Vec::new(),
            }),
            allocated_pages: AtomicU64::new(num_pages),
            disposed: AtomicBool::new(false),
            generation_ids,
            stats,
        })
    }

    /// The process-unique id of this store.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The path of the backing file.
    #[inline]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// The options this store was opened with.
    #[inline]
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// The number of pages that can be addressed. It never decreases.
    #[inline]
    pub fn allocated_pages(&self) -> u64 {
        self.allocated_pages.load(Ordering::Acquire)
    }

    /// Returns true once [`PageStore::dispose`] has been called.
    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Returns a snapshot of the statistics of this store.
    pub fn stats(&self) -> StoreStats {
        self.stats.snapshot()
    }

    /// Pins the current generation.
    pub fn current_generation(&self) -> Result<GenerationPin> {
        self.check_disposed()?;
        self.pin_current()
    }

    /// Returns a pointer to `page`.
    ///
    /// The pointer is derived from `generation` if given, otherwise from the
    /// newest generation `txn` has pinned that maps the page, otherwise from
    /// the current generation, which `txn` then pins.
    ///
    /// Fails with [`Error::InvalidMappingState`] if `generation` belongs to
    /// another store.
    pub fn acquire_page_pointer<'t>(
        &self,
        txn: &'t TxnState,
        page: u64,
        generation: Option<&GenerationPin>,
    ) -> Result<PagePtr<'t>> {
        self.acquire_pages(txn, page, 1, generation)
    }

    /// Returns a pointer to `count` pages starting at `page`, which the caller
    /// is about to initialize.
    pub fn acquire_page_pointer_for_new_page<'t>(
        &self,
        txn: &'t TxnState,
        page: u64,
        count: u64,
    ) -> Result<PagePtr<'t>> {
        self.acquire_pages(txn, page, count.max(1), None)
    }

    fn acquire_pages<'t>(
        &self,
        txn: &'t TxnState,
        page: u64,
        count: u64,
        generation: Option<&GenerationPin>,
    ) -> Result<PagePtr<'t>> {
        self.check_disposed()?;
        let allocated = self.allocated_pages();
        let end = page.saturating_add(count);
        if end > allocated {
            return Err(Error::InvalidPageNumber { page, allocated });
        }

        let generation = match generation {
            Some(pin) if pin.store_id() != self.id => {
                return Err(Error::InvalidMappingState(pin.id()));
            }
            Some(pin) => {
                txn.ensure_pinned(self.id, pin.generation())?;
                pin.generation().clone()
            }
            None => match txn.covering(self.id, end) {
                Some(generation) => generation,
                None => {
                    let pin = self.pin_current()?;
                    let generation = pin.generation().clone();
                    txn.adopt(self.id, pin);
                    generation
                }
            },
        };
        if end > generation.num_pages() {
            return Err(Error::InvalidPageNumber {
                page,
                allocated: generation.num_pages(),
            });
        }

        // Safety: the page is mapped by `generation`, which `txn` keeps pinned
        // for as long as the pointer can be used.
        let ptr = unsafe { generation.page_ptr(page) };
        Ok(PagePtr::new(ptr, page, count))
    }

    /// Makes sure that `count` pages starting at `page` can be addressed,
    /// growing the file if needed.
    ///
    /// Returns the newly installed generation if the store grew.
    pub fn ensure_continuous(&self, page: u64, count: u64) -> Result<Option<GenerationPin>> {
        self.check_disposed()?;
        let end = page.saturating_add(count);
        if end <= self.allocated_pages() {
            return Ok(None);
        }

        let mut state = self.state.lock();
        if state.current.is_none() {
            return Err(Error::AlreadyDisposed);
        }
        let allocated = self.allocated_pages();
        if end <= allocated {
            return Ok(None);
        }
        if is_protected(&self.options, self.path()) {
            return Err(Error::WriteProtectedGrowth(self.path().to_owned()));
        }

        let min_required = end.saturating_mul(PAGE_SIZE as u64);
        let low_memory = self.context.low_memory().is_low_memory();
        let now = Instant::now();
        let mut size = allocated.saturating_mul(PAGE_SIZE as u64).max(PAGE_SIZE as u64);
        loop {
            size = state.growth.next_size(now, size, min_required, low_memory);
            if size >= min_required {
                break;
            }
        }

        let generation = map_generation(
            &self.file,
            &self.context,
            &self.options,
            &self.stats,
            self.id,
            self.generation_ids.next(),
            size,
        )?;
        let pin = self.install(&mut state, generation)?;
        drop(state);

        self.stats.growths.inc();
        self.context
            .update_mapped_size(self.id, pin.num_pages() * PAGE_SIZE as u64);
        info!(
            "Grow store {} from {allocated} to {} pages with generation {}, low_memory {low_memory}",
            self.id,
            pin.num_pages(),
            pin.id()
        );
        Ok(Some(pin))
    }

    fn install(&self, state: &mut StoreState, generation: Arc<Generation>) -> Result<GenerationPin> {
        let baseline = generation.pin()?;
        let pin = baseline.clone();
        let previous = state.current.replace(baseline);
        self.allocated_pages
            .fetch_max(generation.num_pages(), Ordering::AcqRel);
        for listener in &state.listeners {
            listener(&generation);
        }
        self.stats.generations_installed.inc();
        debug!(
            "Install generation {} of store {}, replacing {:?}",
            generation.id(),
            self.id,
            previous.as_ref().map(|pin| pin.id())
        );
        drop(previous);
        Ok(pin)
    }

    /// Registers `listener`, called with every newly installed generation.
    ///
    /// The listener runs while the store can't grow, so it must not call back
    /// into the store.
    pub fn on_generation_changed<F>(&self, listener: F)
    where
        F: Fn(&Generation) + Send + Sync + 'static,
    {
        self.state.lock().listeners.push(Box::new(listener));
    }

    /// Hints that `count` pages starting at `page` will be needed soon.
    ///
    /// Pages that were prefetched before are skipped. Nothing happens if the
    /// platform can't prefetch, prefetch is disabled, or memory is low.
    pub fn request_prefetch(&self, page: u64, count: u64) -> Result<()> {
        self.check_disposed()?;
        if !self.should_prefetch() {
            return Ok(());
        }
        let pin = self.pin_current()?;
        let pages = pin.take_unprefetched(page, count);
        if pages.is_empty() {
            return Ok(());
        }
        let ranges: Vec<_> = pages
            .iter()
            .flat_map(|r| pin.translate(r.start, r.end - r.start))
            .collect();
        self.submit_prefetch(pin, pages, ranges);
        Ok(())
    }

    /// Hints that the whole file will be needed soon.
    pub fn request_whole_file_prefetch(&self) -> Result<()> {
        self.check_disposed()?;
        if !self.should_prefetch() {
            return Ok(());
        }
        let pin = self.pin_current()?;
        let ranges = coalesce(pin.allocations());
        if ranges.is_empty() {
            return Ok(());
        }
        pin.mark_all_prefetched();
        let pages = vec![0..pin.num_pages()];
        self.submit_prefetch(pin, pages, ranges);
        Ok(())
    }

    fn should_prefetch(&self) -> bool {
        self.options.prefetch
            && self.env.supports_prefetch()
            && !self.context.low_memory().is_low_memory()
    }

    /// Queues a prefetch of `ranges`, the addresses of `pages`. If the job is
    /// rejected, or dropped before it runs, `pages` are no longer considered
    /// prefetched.
    fn submit_prefetch(
        &self,
        pin: GenerationPin,
        pages: Vec<Range<u64>>,
        ranges: Vec<AllocationInfo>,
    ) {
        let generation = pin.id();
        let num_ranges = ranges.len();
        let task = PrefetchTask::new(self.env.clone(), pin, pages, ranges);
        if self.context.submit_prefetch(Box::new(task)) {
            self.stats.prefetch_requests.inc();
            debug!("Prefetch {num_ranges} ranges of generation {generation}");
        } else {
            self.stats.prefetch_dropped.inc();
            debug!("Drop prefetch of {num_ranges} ranges of generation {generation}");
        }
    }

    /// Hints that the resident memory of `count` pages starting at `page` can
    /// be dropped. The content of the pages is kept in the file.
    ///
    /// This does nothing for copy-on-write stores, whose private pages would
    /// be lost.
    pub fn discard_pages(&self, page: u64, count: u64) -> Result<()> {
        self.check_disposed()?;
        if self.options.copy_on_write {
            return Ok(());
        }
        let pin = self.pin_current()?;
        pin.reset_prefetched(page, count);
        self.discard_ranges(&pin, pin.translate(page, count));
        Ok(())
    }

    /// Hints that the resident memory of the whole file can be dropped.
    pub fn discard_whole_file(&self) -> Result<()> {
        self.check_disposed()?;
        if self.options.copy_on_write {
            return Ok(());
        }
        let pin = self.pin_current()?;
        pin.reset_all_prefetched();
        self.discard_ranges(&pin, coalesce(pin.allocations()));
        Ok(())
    }

    fn discard_ranges(&self, pin: &GenerationPin, ranges: Vec<AllocationInfo>) {
        self.stats.discards.inc();
        for range in ranges {
            // Safety: the range belongs to `pin`, a shared mapping of the file.
            if let Err(err) = unsafe { self.env.discard(range.base_address(), range.size()) } {
                debug!(
                    "Discard {} bytes of generation {}: {err}",
                    range.size(),
                    pin.id()
                );
            }
        }
    }

    /// Writes modified pages to the file and syncs the file to disk.
    ///
    /// `total_unsynced_bytes` is the amount of data the caller wrote since the
    /// last sync. This does nothing for copy-on-write stores.
    pub fn sync(&self, total_unsynced_bytes: u64) -> Result<()> {
        self.check_disposed()?;
        if self.options.copy_on_write {
            return Ok(());
        }
        let pin = self.pin_current()?;
        pin.flush()?;
        self.file.sync()?;
        self.stats.syncs.inc();
        self.stats.synced_bytes.add(total_unsynced_bytes);
        debug!(
            "Sync store {} with {total_unsynced_bytes} unsynced bytes",
            self.id
        );
        Ok(())
    }

    /// Releases the store's pin on its current generation. The mapping goes
    /// away once no transaction pins it anymore.
    ///
    /// Every later operation fails with [`Error::AlreadyDisposed`]. Disposing
    /// again does nothing.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let current = self.state.lock().current.take();
        let generation = current.as_ref().map(|pin| pin.id());
        drop(current);
        self.context.unregister_mapped_file(self.id);
        info!(
            "Dispose store {} '{}' at generation {generation:?}",
            self.id,
            self.path().display()
        );
    }

    fn pin_current(&self) -> Result<GenerationPin> {
        match self.state.lock().current.as_ref() {
            Some(pin) => Ok(pin.clone()),
            None => Err(Error::AlreadyDisposed),
        }
    }

    #[inline]
    fn check_disposed(&self) -> Result<()> {
        if self.is_disposed() {
            Err(Error::AlreadyDisposed)
        } else {
            Ok(())
        }
    }
}

impl<E: Env> Drop for PageStore<E> {
    fn drop(&mut self) {
        if !*self.disposed.get_mut() {
            error!(
                "Store {} '{}' dropped without dispose",
                self.id,
                self.path().display()
            );
            self.dispose();
        }
    }
}

impl<E: Env> fmt::Debug for PageStore<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageStore")
            .field("id", &self.id)
            .field("path", &self.path())
            .field("allocated_pages", &self.allocated_pages())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

fn is_protected(options: &Options, path: &Path) -> bool {
    options.copy_on_write
        && path
            .file_name()
            .map_or(false, |name| name == options.protected_file_name.as_str())
}

fn map_generation<F: StorageFile>(
    file: &F,
    context: &SharedContext,
    options: &Options,
    stats: &Arc<AtomicStoreStats>,
    store_id: u64,
    id: u64,
    size: u64,
) -> Result<Arc<Generation>> {
    let mapping = file.allocate_more(size)?;
    let generation = Generation::new(id, store_id, mapping, stats.clone());
    if options.lock_memory {
        lock_generation(
            context.memory_policy(),
            &generation,
            options.lock_failure_is_fatal,
            stats,
        )?;
    }
    debug!(
        "Map generation {id} of store {store_id} '{}' with {} pages in {} regions",
        file.path().display(),
        generation.num_pages(),
        generation.allocations().len()
    );
    Ok(generation)
}
