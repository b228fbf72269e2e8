use std::{path::PathBuf, sync::Arc};

use log::info;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::{
    low_memory::LowMemoryMonitor,
    memory_lock::{native_memory_policy, MemoryPolicy},
    prefetch::{PrefetchDispatcher, PrefetchJob},
    Result,
};
use crate::util::atomic::Sequencer;

/// Options of a [`SharedContext`].
#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct ContextOptions {
    /// The maximum number of prefetch batches waiting to be dispatched,
    /// across all stores.
    ///
    /// Default: 1024
    pub prefetch_queue_capacity: usize,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            prefetch_queue_capacity: 1024,
        }
    }
}

/// A file mapped by a live store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MappedFileInfo {
    /// The id of the store that maps the file.
    pub store_id: u64,
    /// The path of the file.
    pub path: PathBuf,
    /// The mapped size in bytes.
    pub size: u64,
}

/// State shared by every store of a process.
///
/// A context is created once, at process start, and handed to each
/// [`PageStore`](super::PageStore) when it is opened. It owns the prefetch
/// dispatcher, the low-memory flag and the memory locking policy.
pub struct SharedContext {
    low_memory: LowMemoryMonitor,
    prefetcher: PrefetchDispatcher,
    memory_policy: Arc<dyn MemoryPolicy>,
    mapped_files: Mutex<FxHashMap<u64, MappedFileInfo>>,
    store_ids: Sequencer,
}

impl SharedContext {
    /// Creates a context with the memory policy of the platform.
    pub fn new(options: ContextOptions) -> Result<Arc<SharedContext>> {
        Self::with_memory_policy(options, native_memory_policy())
    }

    /// Creates a context that locks memory with `memory_policy`.
    pub fn with_memory_policy(
        options: ContextOptions,
        memory_policy: Arc<dyn MemoryPolicy>,
    ) -> Result<Arc<SharedContext>> {
        let prefetcher = PrefetchDispatcher::start(options.prefetch_queue_capacity)?;
        let context = Arc::new(SharedContext {
            low_memory: LowMemoryMonitor::default(),
            prefetcher,
            memory_policy,
            mapped_files: Mutex::default(),
            store_ids: Sequencer::default(),
        });
        context
            .low_memory
            .register_handler(context.prefetcher.core());
        info!(
            "Create shared context with {} memory policy",
            context.memory_policy.name()
        );
        Ok(context)
    }

    /// The process-wide low-memory flag.
    #[inline]
    pub fn low_memory(&self) -> &LowMemoryMonitor {
        &self.low_memory
    }

    /// The policy used to lock memory.
    #[inline]
    pub fn memory_policy(&self) -> &Arc<dyn MemoryPolicy> {
        &self.memory_policy
    }

    /// Lists the files mapped by live stores, ordered by store id.
    pub fn mapped_files(&self) -> Vec<MappedFileInfo> {
        let mut files: Vec<_> = self.mapped_files.lock().values().cloned().collect();
        files.sort_unstable_by_key(|f| f.store_id);
        files
    }

    /// Stops the prefetch dispatcher. Later prefetch requests are dropped.
    pub fn shutdown(&self) {
        self.prefetcher.shutdown();
    }

    pub(crate) fn next_store_id(&self) -> u64 {
        self.store_ids.next()
    }

    pub(crate) fn submit_prefetch(&self, job: Box<dyn PrefetchJob>) -> bool {
        self.prefetcher.submit(job)
    }

    pub(crate) fn register_mapped_file(&self, info: MappedFileInfo) {
        self.mapped_files.lock().insert(info.store_id, info);
    }

    pub(crate) fn update_mapped_size(&self, store_id: u64, size: u64) {
        if let Some(info) = self.mapped_files.lock().get_mut(&store_id) {
            info.size = size;
        }
    }

    pub(crate) fn unregister_mapped_file(&self, store_id: u64) {
        self.mapped_files.lock().remove(&store_id);
    }
}

impl std::fmt::Debug for SharedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedContext")
            .field("low_memory", &self.low_memory)
            .field("memory_policy", &self.memory_policy.name())
            .field("mapped_files", &self.mapped_files.lock().len())
            .finish()
    }
}
