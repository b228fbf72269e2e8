use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

use log::info;
use parking_lot::Mutex;

/// Receives process-wide low-memory notifications.
pub trait LowMemoryHandler: Send + Sync {
    /// Called when the process enters a low-memory state.
    fn low_memory(&self);

    /// Called when the low-memory state is over.
    fn low_memory_over(&self) {}
}

/// The process-wide low-memory flag.
///
/// The flag is set and cleared by whatever notification source the embedding
/// process has. Handlers are only told about transitions.
#[derive(Default)]
pub struct LowMemoryMonitor {
    low: AtomicBool,
    handlers: Mutex<Vec<Weak<dyn LowMemoryHandler>>>,
}

impl LowMemoryMonitor {
    /// Returns true if the process is currently low on memory.
    #[inline]
    pub fn is_low_memory(&self) -> bool {
        self.low.load(Ordering::Acquire)
    }

    /// Registers `handler`. The monitor only keeps a weak reference, the
    /// handler is forgotten once it is dropped.
    pub fn register_handler<H: LowMemoryHandler + 'static>(&self, handler: &Arc<H>) {
        let handler: Arc<dyn LowMemoryHandler> = handler.clone();
        self.handlers.lock().push(Arc::downgrade(&handler));
    }

    /// Sets the low-memory flag, notifying handlers if it changed.
    pub fn set_low_memory(&self, low: bool) {
        if self.low.swap(low, Ordering::AcqRel) == low {
            return;
        }
        info!("Low memory state {}", if low { "entered" } else { "over" });

        let handlers: Vec<_> = {
            let mut handlers = self.handlers.lock();
            handlers.retain(|h| h.strong_count() > 0);
            handlers.iter().filter_map(Weak::upgrade).collect()
        };
        for handler in handlers {
            if low {
                handler.low_memory();
            } else {
                handler.low_memory_over();
            }
        }
    }

    #[cfg(test)]
    fn num_handlers(&self) -> usize {
        self.handlers.lock().len()
    }
}

impl std::fmt::Debug for LowMemoryMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LowMemoryMonitor")
            .field("low", &self.is_low_memory())
            .finish()
    }
}
