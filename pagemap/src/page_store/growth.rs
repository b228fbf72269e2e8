//! Sizing of file growth.
//!
//! The store grows in steps that adapt to how fast it is growing: frequent
//! growth doubles the step, rare growth halves it. Sizes are rounded so that
//! small files stay powers of two and large files grow in whole GiB.

use std::time::{Duration, Instant};

/// The smallest growth step.
pub const MIN_INCREASE: u64 = 16 << 10;
/// The largest growth step.
pub const MAX_INCREASE: u64 = 1 << 30;

const GIB: u64 = 1 << 30;
/// Below this size, sizes are rounded to the next power of two.
const POWER_OF_TWO_THRESHOLD: u64 = 512 << 20;

/// Growth within this window doubles the step.
const FAST_GROWTH: Duration = Duration::from_secs(3 * 60);
/// No growth within this window halves the step.
const SLOW_GROWTH: Duration = Duration::from_secs(15 * 60);

/// Decides the next size of a growing file.
#[derive(Clone, Debug, Default)]
pub struct GrowthPolicy {
    last_increase: Option<Instant>,
    increase_size: u64,
}

impl GrowthPolicy {
    /// Returns the next size for a file of `current` bytes that needs at least
    /// `min_requested` bytes.
    ///
    /// The result may still be less than `min_requested`; callers ask again
    /// with the returned size until it is large enough. While `low_memory` is
    /// set the result is `min_requested` rounded, even for the first growth.
    pub fn next_size(
        &mut self,
        now: Instant,
        current: u64,
        min_requested: u64,
        low_memory: bool,
    ) -> u64 {
        let last_increase = self.last_increase.replace(now);
        if self.increase_size == 0 {
            self.increase_size = MIN_INCREASE;
        }

        // Don't reserve more than needed while memory is scarce.
        if low_memory {
            return round_allocation_size(min_requested);
        }

        let Some(last_increase) = last_increase else {
            return round_allocation_size(current.saturating_add(MIN_INCREASE));
        };

        let elapsed = now.saturating_duration_since(last_increase);
        if elapsed < FAST_GROWTH {
            self.increase_size = (self.increase_size * 2).min(MAX_INCREASE);
        } else if elapsed > SLOW_GROWTH {
            self.increase_size = (self.increase_size / 2).max(MIN_INCREASE);
        }

        let increase = self.increase_size.min(current / 2);
        round_allocation_size(current.saturating_add(increase))
    }

    /// The current growth step in bytes, zero before the first growth.
    pub fn increase_size(&self) -> u64 {
        self.increase_size
    }
}

/// Rounds `size` up to the next power of two below 512 MiB, and up to the next
/// whole GiB from there on.
pub fn round_allocation_size(size: u64) -> u64 {
    if size < POWER_OF_TWO_THRESHOLD {
        return size.next_power_of_two();
    }
    size.div_ceil(GIB).saturating_mul(GIB)
}
