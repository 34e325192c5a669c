//! Fixed-size slot bitmap.

/// One bit per port slot of a single IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotBitmap {
    words: Vec<u64>,
    len: u32,
    used: u32,
}

impl SlotBitmap {
    /// A bitmap of `len` free slots.
    pub fn new(len: u32) -> Self {
        Self {
            words: vec![0; (len as usize).div_ceil(64)],
            len,
            used: 0,
        }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn is_full(&self) -> bool {
        self.used == self.len
    }

    pub fn is_set(&self, slot: u32) -> bool {
        slot < self.len && self.words[(slot / 64) as usize] & (1u64 << (slot % 64)) != 0
    }

    /// Mark `slot` used. Returns false if it was already used or out of range.
    pub fn set(&mut self, slot: u32) -> bool {
        if slot >= self.len || self.is_set(slot) {
            return false;
        }
        self.words[(slot / 64) as usize] |= 1u64 << (slot % 64);
        self.used += 1;
        true
    }

    /// Lowest free slot.
    pub fn first_free(&self) -> Option<u32> {
        if self.is_full() {
            return None;
        }
        self.words
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)
            .map(|(i, word)| i as u32 * 64 + word.trailing_ones())
            .filter(|slot| *slot < self.len)
    }
}
