/// A simple fixed size bitmap implementation.
#[derive(Clone, Debug)]
pub(crate) struct FixedBitmap {
    cap: u32,
    len: u32,
    bits: Vec<u64>,
}

impl FixedBitmap {
    pub(crate) fn new(cap: u32) -> Self {
        let size = match cap % 64 {
            0 => cap / 64,
            _ => cap / 64 + 1,
        };
        let bits = vec![0u64; size as usize];
        FixedBitmap { cap, len: 0, bits }
    }

    /// Set the corresponding bit.
    ///
    /// Returns true if the bit was unset before.
    pub(crate) fn set(&mut self, index: u32) -> bool {
        debug_assert!(index < self.cap);
        let (key, bit) = (key(index), bit(index));
        let old_w = self.bits[key];
        let new_w = old_w | 1 << bit;
        let inserted = (old_w ^ new_w) >> bit; // 1 or 0
        self.bits[key] = new_w;
        self.len += inserted as u32;
        inserted != 0
    }

    /// Clear the corresponding bit.
    pub(crate) fn clear(&mut self, index: u32) -> bool {
        debug_assert!(index < self.cap);
        let (key, bit) = (key(index), bit(index));
        let old_w = self.bits[key];
        let new_w = old_w & !(1 << bit);
        let removed = (old_w ^ new_w) >> bit; // 0 or 1
        self.bits[key] = new_w;
        self.len -= removed as u32;
        removed != 0
    }

    /// Clear all bits.
    pub(crate) fn clear_all(&mut self) {
        self.bits.iter_mut().for_each(|w| *w = 0);
        self.len = 0;
    }

    /// Test whether the specified bit is set.
    #[cfg(test)]
    pub(crate) fn test(&self, index: u32) -> bool {
        let (key, bit) = (key(index), bit(index));
        self.bits[key] & (1 << bit) != 0
    }

    /// Returns the number of set bits.
    #[cfg(test)]
    #[inline]
    pub(crate) fn len(&self) -> u32 {
        self.len
    }

    /// Returns the total bits.
    #[inline]
    pub(crate) fn cap(&self) -> u32 {
        self.cap
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.len == self.cap
    }
}

#[inline]
fn key(index: u32) -> usize {
    index as usize / 64
}

#[inline]
fn bit(index: u32) -> usize {
    index as usize % 64
}
