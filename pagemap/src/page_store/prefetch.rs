//! The process-wide prefetch dispatcher.
//!
//! Stores hand batches of address ranges to a single background thread,
//! which issues the prefetch advice. A single bounded queue limits how much
//! prefetching all stores in the process can cause together.

use std::{
    collections::VecDeque,
    ops::Range,
    sync::Arc,
    thread::{self, JoinHandle},
};

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use super::{generation::GenerationPin, low_memory::LowMemoryHandler, Result};
use crate::{
    env::{AllocationInfo, Env},
    util::atomic::Counter,
};

/// A unit of work for the dispatcher thread.
pub(crate) trait PrefetchJob: Send {
    fn run(self: Box<Self>);
}

/// Prefetches ranges of one generation. The pin keeps the ranges mapped
/// while the task waits in the queue.
///
/// `pages` were marked as prefetched when the task was created. A task that
/// is dropped without running forgets those marks again.
pub(crate) struct PrefetchTask<E: Env> {
    env: E,
    ranges: Vec<AllocationInfo>,
    pages: Vec<Range<u64>>,
    pin: GenerationPin,
    done: bool,
}

impl<E: Env> PrefetchTask<E> {
    pub(crate) fn new(
        env: E,
        pin: GenerationPin,
        pages: Vec<Range<u64>>,
        ranges: Vec<AllocationInfo>,
    ) -> Self {
        PrefetchTask {
            env,
            ranges,
            pages,
            pin,
            done: false,
        }
    }
}

impl<E: Env> PrefetchJob for PrefetchTask<E> {
    fn run(mut self: Box<Self>) {
        for range in &self.ranges {
            if let Err(err) = self.env.prefetch(range.base_address(), range.size()) {
                debug!(
                    "Prefetch {} bytes of generation {}: {err}",
                    range.size(),
                    self.pin.id()
                );
            }
        }
        self.done = true;
    }
}

impl<E: Env> Drop for PrefetchTask<E> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        for r in &self.pages {
            self.pin.reset_prefetched(r.start, r.end - r.start);
        }
    }
}

struct Queue {
    jobs: VecDeque<Box<dyn PrefetchJob>>,
    closed: bool,
}

pub(crate) struct DispatcherCore {
    queue: Mutex<Queue>,
    cond: Condvar,
    capacity: usize,
    dispatched: Counter,
    dropped: Counter,
}

impl DispatcherCore {
    fn clear(&self) -> usize {
        let jobs = std::mem::take(&mut self.queue.lock().jobs);
        // Pins held by the jobs are released outside the queue lock.
        jobs.len()
    }

    fn next_job(&self) -> Option<Box<dyn PrefetchJob>> {
        let mut queue = self.queue.lock();
        loop {
            if queue.closed {
                return None;
            }
            if let Some(job) = queue.jobs.pop_front() {
                return Some(job);
            }
            self.cond.wait(&mut queue);
        }
    }

    fn run(&self) {
        while let Some(job) = self.next_job() {
            job.run();
            self.dispatched.inc();
        }
    }
}

impl LowMemoryHandler for DispatcherCore {
    fn low_memory(&self) {
        let n = self.clear();
        if n > 0 {
            warn!("Drop {n} prefetch jobs on low memory");
            self.dropped.add(n as u64);
        }
    }
}

/// The background consumer of prefetch requests.
pub(crate) struct PrefetchDispatcher {
    core: Arc<DispatcherCore>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PrefetchDispatcher {
    /// Starts the dispatcher thread with a queue of at most `capacity` jobs.
    pub(crate) fn start(capacity: usize) -> Result<PrefetchDispatcher> {
        let core = Arc::new(DispatcherCore {
            queue: Mutex::new(Queue {
                jobs: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            cond: Condvar::new(),
            capacity,
            dispatched: Counter::default(),
            dropped: Counter::default(),
        });
        let worker = {
            let core = core.clone();
            thread::Builder::new()
                .name("pagemap-prefetch".into())
                .spawn(move || core.run())?
        };
        info!("Start prefetch dispatcher with capacity {capacity}");
        Ok(PrefetchDispatcher {
            core,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queues `job`. Returns false if the queue is full or closed.
    pub(crate) fn submit(&self, job: Box<dyn PrefetchJob>) -> bool {
        let mut queue = self.core.queue.lock();
        if queue.closed || queue.jobs.len() >= self.core.capacity {
            drop(queue);
            self.core.dropped.inc();
            return false;
        }
        queue.jobs.push_back(job);
        drop(queue);
        self.core.cond.notify_one();
        true
    }

    pub(crate) fn core(&self) -> &Arc<DispatcherCore> {
        &self.core
    }

    /// Stops the dispatcher thread. Pending jobs are dropped.
    pub(crate) fn shutdown(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let pending = {
            let mut queue = self.core.queue.lock();
            queue.closed = true;
            std::mem::take(&mut queue.jobs)
        };
        self.core.cond.notify_all();
        // Pins held by pending jobs are released outside the queue lock.
        drop(pending);
        if worker.join().is_err() {
            warn!("Prefetch dispatcher panicked");
        }
        info!(
            "Stop prefetch dispatcher, {} jobs dispatched, {} dropped",
            self.core.dispatched.get(),
            self.core.dropped.get()
        );
    }

    #[cfg(test)]
    pub(crate) fn dispatched(&self) -> u64 {
        self.core.dispatched.get()
    }
}

impl Drop for PrefetchDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
