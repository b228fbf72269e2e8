use std::{
    io::Result,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use super::PAGE_SIZE;
use crate::env::{AllocationInfo, Mapping};

/// A mapping backed by heap buffers, one buffer per region.
pub(crate) struct HeapMapping {
    _buffers: Vec<Box<[u8]>>,
    allocations: Vec<AllocationInfo>,
    drops: Arc<AtomicUsize>,
}

impl HeapMapping {
    /// Creates a mapping whose regions hold `pages[i]` pages each. `drops` is
    /// incremented when the mapping is released.
    pub(crate) fn with_regions(pages: &[usize], drops: Arc<AtomicUsize>) -> Box<dyn Mapping> {
        let mut buffers = Vec::with_capacity(pages.len());
        let mut allocations = Vec::with_capacity(pages.len());
        for &n in pages {
            let mut buf = vec![0u8; n * PAGE_SIZE].into_boxed_slice();
            allocations.push(AllocationInfo::new(buf.as_mut_ptr(), buf.len()));
            buffers.push(buf);
        }
        Box::new(HeapMapping {
            _buffers: buffers,
            allocations,
            drops,
        })
    }
}

impl Mapping for HeapMapping {
    fn allocations(&self) -> &[AllocationInfo] {
        &self.allocations
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

impl Drop for HeapMapping {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}
