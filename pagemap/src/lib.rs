//! A page store over memory-mapped files.
//!
//! A [`PageStore`] turns a growable file into fixed-size pages addressed by
//! page number. Pages are read and written in place through the mapping, and
//! many transactions can use a store concurrently while it grows.
//!
//! Features:
//!
//! - Generational remapping: growth installs a new [`Generation`], while
//!   pointers derived from older generations stay valid until their pins are
//!   released.
//! - Adaptive growth sizing that backs off when memory is low.
//! - Optional locking of mapped memory, with platform specific remediation.
//! - Cooperative prefetching through a single dispatcher per process.
//!
//! State shared by all stores of a process lives in a [`SharedContext`],
//! created once and passed to every store.

#![warn(missing_docs, unreachable_pub)]

pub mod env;

mod error;
pub use error::{Error, Result};

mod page_store;
pub use page_store::{
    native_memory_policy, round_allocation_size, ContextOptions, Generation, GenerationPin,
    GrowthPolicy, LowMemoryHandler, LowMemoryMonitor, MappedFileInfo, MemoryPolicy,
    Options as PageStoreOptions, PagePtr, PageStore, PosixMemoryPolicy, SharedContext, StoreStats,
    TxnState, DATA_FILE_NAME, MAX_INCREASE, MIN_INCREASE, PAGE_SIZE,
};
#[cfg(windows)]
pub use page_store::WindowsMemoryPolicy;

mod util;

#[cfg(test)]
mod tests {
    use std::{
        io,
        path::Path,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
    };

    use rand::{thread_rng, Rng};
    use tempfile::tempdir;

    use super::*;
    use crate::env::{AllocationInfo, MmapEnv};

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn new_context() -> Arc<SharedContext> {
        init_logger();
        SharedContext::new(ContextOptions::default()).unwrap()
    }

    fn open(
        context: &Arc<SharedContext>,
        path: impl AsRef<Path>,
        options: PageStoreOptions,
    ) -> PageStore<MmapEnv> {
        PageStore::open(MmapEnv, context.clone(), path, options).unwrap()
    }

    #[test]
    fn empty_store_grows_to_one_page() {
        let context = new_context();
        let dir = tempdir().unwrap();
        let store = open(&context, dir.path().join("a.pages"), Default::default());
        assert_eq!(store.allocated_pages(), 0);

        let txn = TxnState::new();
        assert!(matches!(
            store.acquire_page_pointer(&txn, 0, None),
            Err(Error::InvalidPageNumber { page: 0, allocated: 0 })
        ));

        // A first growth normally reserves ahead to 4 pages, see
        // `first_growth_reserves_ahead`. Under low memory it grows to exactly
        // the requested page.
        context.low_memory().set_low_memory(true);
        let generation = store.ensure_continuous(0, 1).unwrap().unwrap();
        assert_eq!(generation.num_pages(), 1);
        assert_eq!(store.allocated_pages(), 1);
        assert!(store.ensure_continuous(0, 1).unwrap().is_none());

        let page = store.acquire_page_pointer(&txn, 0, None).unwrap();
        assert_eq!(page.page_number(), 0);
        assert_eq!(page.len(), PAGE_SIZE);
        assert!(matches!(
            store.acquire_page_pointer(&txn, 1, None),
            Err(Error::InvalidPageNumber { page: 1, allocated: 1 })
        ));

        drop(generation);
        drop(txn);
        store.dispose();
    }

    #[test]
    fn first_growth_reserves_ahead() {
        let context = new_context();
        let dir = tempdir().unwrap();
        let store = open(&context, dir.path().join("a.pages"), Default::default());

        let generation = store.ensure_continuous(0, 1).unwrap().unwrap();
        // 8 KiB plus the minimum increase, rounded to a power of two.
        assert_eq!(generation.num_pages(), 4);
        assert_eq!(std::fs::metadata(store.path()).unwrap().len(), 4 * PAGE_SIZE as u64);

        let txn = TxnState::new();
        for page in 0..4 {
            store.acquire_page_pointer(&txn, page, None).unwrap();
        }
        assert!(matches!(
            store.acquire_page_pointer(&txn, 4, None),
            Err(Error::InvalidPageNumber { page: 4, allocated: 4 })
        ));
        // The transaction pinned the generation once.
        assert_eq!(txn.pinned_generations(store.id()), vec![generation.id()]);
        drop(txn);
        store.dispose();
    }

    #[test]
    fn reject_generation_of_other_store() {
        let context = new_context();
        let dir = tempdir().unwrap();
        let a = open(&context, dir.path().join("a.pages"), Default::default());
        let b = open(&context, dir.path().join("b.pages"), Default::default());
        let a_generation = a.ensure_continuous(0, 4).unwrap().unwrap();
        let b_generation = b.ensure_continuous(0, 4).unwrap().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a_generation.store_id(), a.id());
        assert_eq!(b_generation.store_id(), b.id());
        // Both stores number their generations alike.
        assert_eq!(a_generation.id(), b_generation.id());

        let txn = TxnState::new();
        assert!(matches!(
            a.acquire_page_pointer(&txn, 0, Some(&b_generation)),
            Err(Error::InvalidMappingState(_))
        ));
        assert!(txn.pinned_generations(a.id()).is_empty());
        assert!(txn.pinned_generations(b.id()).is_empty());

        let page = a.acquire_page_pointer(&txn, 0, Some(&a_generation)).unwrap();
        assert_eq!(page.as_ptr(), a_generation.base_address());
        b.acquire_page_pointer(&txn, 0, Some(&b_generation)).unwrap();
        assert_eq!(txn.pinned_generations(a.id()), vec![a_generation.id()]);
        assert_eq!(txn.pinned_generations(b.id()), vec![b_generation.id()]);

        drop(txn);
        drop((a_generation, b_generation));
        a.dispose();
        b.dispose();
    }

    #[test]
    fn allocation_is_monotonic() {
        let context = new_context();
        let dir = tempdir().unwrap();
        let store = open(&context, dir.path().join("a.pages"), Default::default());
        let mut rng = thread_rng();
        let mut last = store.allocated_pages();
        for _ in 0..64 {
            let page = rng.gen_range(0..2048);
            let count = rng.gen_range(1..64);
            store.ensure_continuous(page, count).unwrap();
            let allocated = store.allocated_pages();
            assert!(allocated >= last);
            assert!(allocated >= page + count);
            last = allocated;

            let txn = TxnState::new();
            store.acquire_page_pointer(&txn, allocated - 1, None).unwrap();
            assert!(store.acquire_page_pointer(&txn, allocated, None).is_err());
        }
        store.dispose();
    }

    #[test]
    fn new_pages_span_multiple_pages() {
        let context = new_context();
        let dir = tempdir().unwrap();
        let store = open(&context, dir.path().join("a.pages"), Default::default());
        store.ensure_continuous(0, 8).unwrap();

        let txn = TxnState::new();
        let pages = store.acquire_page_pointer_for_new_page(&txn, 2, 6).unwrap();
        assert_eq!(pages.page_count(), 6);
        assert_eq!(pages.len(), 6 * PAGE_SIZE);
        // Safety: nothing else touches the pages.
        unsafe { pages.as_mut_slice().fill(0x5a) };
        assert!(store.acquire_page_pointer_for_new_page(&txn, 4, 6).is_err());
        drop(txn);
        store.dispose();
    }

    #[test]
    fn pointers_survive_concurrent_growth() {
        let context = new_context();
        let dir = tempdir().unwrap();
        let store = Arc::new(open(&context, dir.path().join("a.pages"), Default::default()));
        store.ensure_continuous(0, 1).unwrap();

        let mut txn = TxnState::new();
        let page = store.acquire_page_pointer(&txn, 0, None).unwrap();
        // Safety: the page is only accessed by this thread.
        unsafe { page.as_mut_slice().fill(0xab) };
        let addr = page.as_ptr();

        let handles: Vec<_> = (0..4u64)
            .map(|i| {
                let store = store.clone();
                thread::spawn(move || {
                    for n in 1..16 {
                        store.ensure_continuous(i * 1024 + n * 16, 16).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = store.stats();
        assert!(stats.growths > 1);
        // Every replaced generation is gone except the one `txn` pins.
        assert_eq!(stats.generations_released, stats.generations_installed - 2);
        assert_eq!(page.as_ptr(), addr);
        // Safety: see above.
        assert!(unsafe { page.as_slice() }.iter().all(|b| *b == 0xab));

        // A new transaction sees the same bytes through the current generation.
        let other = TxnState::new();
        let current = store.acquire_page_pointer(&other, 0, None).unwrap();
        assert!(unsafe { current.as_slice() }.iter().all(|b| *b == 0xab));
        drop(other);

        txn.release();
        assert_eq!(
            store.stats().generations_released,
            stats.generations_installed - 1
        );
        store.dispose();
    }

    #[test]
    fn pin_requested_generation() {
        let context = new_context();
        let dir = tempdir().unwrap();
        let store = open(&context, dir.path().join("a.pages"), Default::default());
        let old = store.ensure_continuous(0, 1).unwrap().unwrap();
        let new = store.ensure_continuous(0, 64).unwrap().unwrap();
        assert!(new.id() > old.id());

        let txn = TxnState::new();
        let page = store.acquire_page_pointer(&txn, 1, Some(&old)).unwrap();
        assert_eq!(page.as_ptr(), old.base_address().wrapping_add(PAGE_SIZE));
        // Page 10 exists in the store, but not in the old generation.
        assert!(matches!(
            store.acquire_page_pointer(&txn, 10, Some(&old)),
            Err(Error::InvalidPageNumber { page: 10, .. })
        ));
        // Without a request, the newest pinned generation that maps the page
        // is used, then the current one.
        let page = store.acquire_page_pointer(&txn, 1, None).unwrap();
        assert_eq!(page.as_ptr(), old.base_address().wrapping_add(PAGE_SIZE));
        store.acquire_page_pointer(&txn, 10, None).unwrap();
        assert_eq!(txn.pinned_generations(store.id()), vec![old.id(), new.id()]);

        drop(txn);
        drop(old);
        drop(new);
        store.dispose();
    }

    #[test]
    fn dispose_is_idempotent() {
        let context = new_context();
        let dir = tempdir().unwrap();
        let store = open(&context, dir.path().join("a.pages"), Default::default());
        store.ensure_continuous(0, 1).unwrap();
        assert_eq!(context.mapped_files().len(), 1);

        let txn = TxnState::new();
        let page = store.acquire_page_pointer(&txn, 0, None).unwrap();
        unsafe { page.as_mut_slice()[0] = 1 };

        store.dispose();
        let stats = store.stats();
        store.dispose();
        assert_eq!(store.stats(), stats);
        assert!(store.is_disposed());
        assert!(context.mapped_files().is_empty());

        assert!(matches!(
            store.acquire_page_pointer(&txn, 0, None),
            Err(Error::AlreadyDisposed)
        ));
        assert!(matches!(store.ensure_continuous(0, 8), Err(Error::AlreadyDisposed)));
        assert!(matches!(store.request_prefetch(0, 1), Err(Error::AlreadyDisposed)));
        assert!(matches!(store.discard_whole_file(), Err(Error::AlreadyDisposed)));
        assert!(matches!(store.sync(0), Err(Error::AlreadyDisposed)));
        assert!(matches!(store.current_generation(), Err(Error::AlreadyDisposed)));

        // The transaction still holds the mapping.
        assert_eq!(unsafe { page.as_slice()[0] }, 1);
        drop(txn);
        assert_eq!(
            store.stats().generations_released,
            store.stats().generations_installed
        );
    }

    #[test]
    fn drop_without_dispose() {
        let context = new_context();
        let dir = tempdir().unwrap();
        let store = open(&context, dir.path().join("a.pages"), Default::default());
        assert_eq!(context.mapped_files().len(), 1);
        drop(store);
        assert!(context.mapped_files().is_empty());
    }

    #[test]
    fn copy_on_write_protects_data_file() {
        let context = new_context();
        let dir = tempdir().unwrap();
        let path = dir.path().join(DATA_FILE_NAME);
        std::fs::write(&path, vec![7u8; 2 * PAGE_SIZE]).unwrap();

        let mut options = PageStoreOptions::default();
        options.copy_on_write = true;
        let store = open(&context, &path, options.clone());
        assert_eq!(store.allocated_pages(), 2);
        assert!(store.ensure_continuous(0, 2).unwrap().is_none());
        assert!(matches!(
            store.ensure_continuous(0, 3),
            Err(Error::WriteProtectedGrowth(ref p)) if p == &path
        ));

        let txn = TxnState::new();
        let page = store.acquire_page_pointer(&txn, 1, None).unwrap();
        unsafe { page.as_mut_slice().fill(9) };
        store.sync(PAGE_SIZE as u64).unwrap();
        assert_eq!(store.stats().syncs, 0);
        drop(txn);
        store.dispose();
        assert!(std::fs::read(&path).unwrap().iter().all(|b| *b == 7));

        options.initial_size = 4 * PAGE_SIZE as u64;
        assert!(matches!(
            PageStore::open(MmapEnv, context.clone(), &path, options.clone()),
            Err(Error::WriteProtectedGrowth(_))
        ));

        // Other files may grow.
        let store = open(&context, dir.path().join("scratch.pages"), options);
        assert_eq!(store.allocated_pages(), 4);
        store.ensure_continuous(0, 16).unwrap().unwrap();
        store.dispose();
    }

    #[test]
    fn sync_writes_pages_to_file() {
        let context = new_context();
        let dir = tempdir().unwrap();
        let store = open(&context, dir.path().join("a.pages"), Default::default());
        store.ensure_continuous(0, 2).unwrap();

        let txn = TxnState::new();
        let page = store.acquire_page_pointer(&txn, 1, None).unwrap();
        unsafe { page.as_mut_slice()[..4].copy_from_slice(b"page") };
        store.sync(PAGE_SIZE as u64).unwrap();
        drop(txn);

        let stats = store.stats();
        assert_eq!(stats.syncs, 1);
        assert_eq!(stats.synced_bytes, PAGE_SIZE as u64);
        let content = std::fs::read(store.path()).unwrap();
        assert_eq!(&content[PAGE_SIZE..PAGE_SIZE + 4], b"page");
        store.dispose();

        // Reopen and read it back.
        let store = open(&context, dir.path().join("a.pages"), Default::default());
        let txn = TxnState::new();
        let page = store.acquire_page_pointer(&txn, 1, None).unwrap();
        assert_eq!(unsafe { &page.as_slice()[..4] }, b"page");
        drop(txn);
        store.dispose();
    }

    #[cfg(unix)]
    #[test]
    fn prefetch_skips_known_ranges() {
        let context = new_context();
        let dir = tempdir().unwrap();
        let store = open(&context, dir.path().join("a.pages"), Default::default());
        store.ensure_continuous(0, 64).unwrap();

        store.request_prefetch(0, 32).unwrap();
        assert_eq!(store.stats().prefetch_requests, 1);
        store.request_prefetch(4, 8).unwrap();
        assert_eq!(store.stats().prefetch_requests, 1);

        store.discard_pages(0, 16).unwrap();
        assert_eq!(store.stats().discards, 1);
        store.request_prefetch(4, 8).unwrap();
        assert_eq!(store.stats().prefetch_requests, 2);

        store.request_whole_file_prefetch().unwrap();
        assert_eq!(store.stats().prefetch_requests, 3);
        store.request_prefetch(0, 64).unwrap();
        assert_eq!(store.stats().prefetch_requests, 3);

        store.discard_whole_file().unwrap();
        context.low_memory().set_low_memory(true);
        store.request_prefetch(0, 64).unwrap();
        store.request_whole_file_prefetch().unwrap();
        assert_eq!(store.stats().prefetch_requests, 3);
        context.low_memory().set_low_memory(false);
        store.request_prefetch(0, 64).unwrap();
        assert_eq!(store.stats().prefetch_requests, 4);
        store.dispose();
    }

    #[test]
    fn prefetch_can_be_disabled() {
        let context = new_context();
        let dir = tempdir().unwrap();
        let mut options = PageStoreOptions::default();
        options.prefetch = false;
        let store = open(&context, dir.path().join("a.pages"), options);
        store.ensure_continuous(0, 64).unwrap();
        store.request_prefetch(0, 64).unwrap();
        store.request_whole_file_prefetch().unwrap();
        assert_eq!(store.stats().prefetch_requests, 0);
        store.dispose();
    }

    #[test]
    fn listeners_see_new_generations() {
        let context = new_context();
        let dir = tempdir().unwrap();
        let store = open(&context, dir.path().join("a.pages"), Default::default());
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            store.on_generation_changed(move |generation| {
                assert!(generation.ref_count() > 0);
                seen.store(generation.num_pages() as usize, Ordering::SeqCst);
            });
        }
        store.ensure_continuous(0, 1).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 4);
        store.ensure_continuous(0, 100).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst) as u64, store.allocated_pages());
        store.dispose();
    }

    #[test]
    fn mapped_files_follow_stores() {
        let context = new_context();
        let dir = tempdir().unwrap();
        let a = open(&context, dir.path().join("a.pages"), Default::default());
        let b = open(&context, dir.path().join("b.pages"), Default::default());
        a.ensure_continuous(0, 1).unwrap();

        let files = context.mapped_files();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].store_id, a.id());
        assert_eq!(files[0].size, 4 * PAGE_SIZE as u64);
        assert_eq!(files[1].path, b.path());
        assert_eq!(files[1].size, 0);

        a.dispose();
        assert_eq!(context.mapped_files()[0].store_id, b.id());
        b.dispose();
    }

    /// Locks the first `allowed` regions, then fails.
    struct LimitedPolicy {
        allowed: AtomicUsize,
    }

    impl MemoryPolicy for LimitedPolicy {
        fn name(&self) -> &'static str {
            "limited"
        }

        fn lock(&self, _: &AllocationInfo) -> io::Result<()> {
            self.allowed
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .map(|_| ())
                .map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))
        }

        fn unlock(&self, _: &AllocationInfo) -> io::Result<()> {
            Ok(())
        }

        fn remediate(&self, _: &AllocationInfo) -> io::Result<bool> {
            Ok(false)
        }

        fn advice(&self, region: &AllocationInfo, _: &io::Error) -> String {
            format!("can't lock {} bytes", region.size())
        }
    }

    #[test]
    fn lock_failure_fails_growth() {
        init_logger();
        let policy = Arc::new(LimitedPolicy {
            allowed: AtomicUsize::new(1),
        });
        let context = SharedContext::with_memory_policy(ContextOptions::default(), policy).unwrap();
        let dir = tempdir().unwrap();
        let mut options = PageStoreOptions::default();
        options.lock_memory = true;
        let store = open(&context, dir.path().join("a.pages"), options);

        let generation = store.ensure_continuous(0, 1).unwrap().unwrap();
        assert!(generation.is_locked());
        let err = store.ensure_continuous(0, 8).unwrap_err();
        assert!(matches!(err, Error::InsufficientMemory(ref msg) if msg.contains("can't lock")));
        assert_eq!(store.allocated_pages(), 4);
        assert_eq!(store.stats().lock_failures, 1);
        drop(generation);
        store.dispose();
    }

    #[test]
    fn lock_failure_degrades_when_not_fatal() {
        init_logger();
        let policy = Arc::new(LimitedPolicy {
            allowed: AtomicUsize::new(0),
        });
        let context = SharedContext::with_memory_policy(ContextOptions::default(), policy).unwrap();
        let dir = tempdir().unwrap();
        let mut options = PageStoreOptions::default();
        options.lock_memory = true;
        options.lock_failure_is_fatal = false;
        let store = open(&context, dir.path().join("a.pages"), options);

        let generation = store.ensure_continuous(0, 1).unwrap().unwrap();
        assert!(!generation.is_locked());
        assert_eq!(store.stats().lock_failures, 1);
        drop(generation);
        store.dispose();
    }
}
