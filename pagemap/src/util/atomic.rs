use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
    pub(crate) const fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    pub(crate) fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn inc(&self) -> u64 {
        self.add(1)
    }

    pub(crate) fn add(&self, n: u64) -> u64 {
        self.0.fetch_add(n, Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Hands out process-unique, monotonically increasing ids.
#[derive(Debug)]
pub(crate) struct Sequencer(AtomicU64);

impl Sequencer {
    pub(crate) const fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Returns the next id.
    pub(crate) fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel)
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_add() {
        let counter = Counter::default();
        assert_eq!(counter.inc(), 0);
        assert_eq!(counter.add(5), 1);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn sequencer_is_monotonic() {
        let seq = Sequencer::default();
        let a = seq.next();
        let b = seq.next();
        assert_eq!(a, 1);
        assert!(b > a);
    }
}
