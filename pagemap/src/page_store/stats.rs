use std::fmt::Display;

use crate::util::atomic::Counter;

/// Statistics of a page store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// The number of times the store grew.
    pub growths: u64,
    /// The number of generations installed as current, including the initial one.
    pub generations_installed: u64,
    /// The number of generations whose mapping has been released.
    pub generations_released: u64,
    /// The number of pins taken on generations, counting clones of a pin.
    /// Includes the pins a store takes for itself while installing a
    /// generation, queueing a prefetch, discarding or syncing pages.
    pub pins: u64,
    /// The number of prefetch batches handed to the dispatcher.
    pub prefetch_requests: u64,
    /// The number of prefetch batches dropped because the queue was full.
    pub prefetch_dropped: u64,
    /// The number of discard requests.
    pub discards: u64,
    /// The number of regions that could not be locked in memory.
    pub lock_failures: u64,
    /// The number of syncs.
    pub syncs: u64,
    /// The number of bytes reported as synced.
    pub synced_bytes: u64,
}

impl StoreStats {
    /// Sub other stats to produce an new stats.
    pub fn sub(&self, o: &StoreStats) -> StoreStats {
        StoreStats {
            growths: self.growths.wrapping_sub(o.growths),
            generations_installed: self
                .generations_installed
                .wrapping_sub(o.generations_installed),
            generations_released: self
                .generations_released
                .wrapping_sub(o.generations_released),
            pins: self.pins.wrapping_sub(o.pins),
            prefetch_requests: self.prefetch_requests.wrapping_sub(o.prefetch_requests),
            prefetch_dropped: self.prefetch_dropped.wrapping_sub(o.prefetch_dropped),
            discards: self.discards.wrapping_sub(o.discards),
            lock_failures: self.lock_failures.wrapping_sub(o.lock_failures),
            syncs: self.syncs.wrapping_sub(o.syncs),
            synced_bytes: self.synced_bytes.wrapping_sub(o.synced_bytes),
        }
    }
}

impl Display for StoreStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "StoreStats_generations: growths: {}, installed: {}, released: {}, pins: {}",
            self.growths, self.generations_installed, self.generations_released, self.pins)?;
        writeln!(f, "StoreStats_memory: prefetch_requests: {}, prefetch_dropped: {}, discards: {}, lock_failures: {}",
            self.prefetch_requests, self.prefetch_dropped, self.discards, self.lock_failures)?;
        writeln!(f, "StoreStats_sync: syncs: {}, synced_bytes: {}", self.syncs, self.synced_bytes)
    }
}

#[derive(Default, Debug)]
pub(crate) struct AtomicStoreStats {
    pub(crate) growths: Counter,
    pub(crate) generations_installed: Counter,
    pub(crate) generations_released: Counter,
    pub(crate) pins: Counter,
    pub(crate) prefetch_requests: Counter,
    pub(crate) prefetch_dropped: Counter,
    pub(crate) discards: Counter,
    pub(crate) lock_failures: Counter,
    pub(crate) syncs: Counter,
    pub(crate) synced_bytes: Counter,
}

impl AtomicStoreStats {
    pub(crate) fn snapshot(&self) -> StoreStats {
        StoreStats {
            growths: self.growths.get(),
            generations_installed: self.generations_installed.get(),
            generations_released: self.generations_released.get(),
            pins: self.pins.get(),
            prefetch_requests: self.prefetch_requests.get(),
            prefetch_dropped: self.prefetch_dropped.get(),
            discards: self.discards.get(),
            lock_failures: self.lock_failures.get(),
            syncs: self.syncs.get(),
            synced_bytes: self.synced_bytes.get(),
        }
    }
}
