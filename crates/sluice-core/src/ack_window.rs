use std::fmt;

/// Fixed-capacity bitset used to track window slots and fragment presence.
///
/// Bits are stored in 32-bit words. The number of set bits is maintained on every
/// `set` so `count` is O(1).
///
/// Out-of-range indices are a programming error: debug builds panic, release builds
/// log the violation and treat the bit as clear.
#[derive(Clone, PartialEq, Eq)]
pub struct AckWindow {
    words: Vec<u32>,
    capacity: usize,
    num_set: usize,
}

impl AckWindow {
    /// Creates an empty window holding `capacity` bits.
    pub fn new(capacity: usize) -> Self {
        Self { words: vec![0; capacity.div_ceil(32)], capacity, num_set: 0 }
    }

    /// Number of addressable bits.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.num_set
    }

    /// Returns true if no bit is set.
    pub fn is_empty(&self) -> bool {
        self.num_set == 0
    }

    /// Returns the bit at `index`.
    pub fn get(&self, index: usize) -> bool {
        if !self.check_index(index) {
            return false;
        }
        self.words[index / 32] & (1 << (index % 32)) != 0
    }

    /// Sets or clears the bit at `index`.
    pub fn set(&mut self, index: usize, value: bool) {
        if !self.check_index(index) {
            return;
        }
        let word = &mut self.words[index / 32];
        let mask = 1u32 << (index % 32);
        let was_set = *word & mask != 0;
        if value && !was_set {
            *word |= mask;
            self.num_set += 1;
        } else if !value && was_set {
            *word &= !mask;
            self.num_set -= 1;
        }
    }

    /// Clears every bit.
    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|word| *word = 0);
        self.num_set = 0;
    }

    /// Shifts every bit one position toward index zero; bit zero wraps to the top.
    ///
    /// Windows clear slot zero before rotating so the slot re-enters empty at the far
    /// end of the window.
    pub fn rotate_down(&mut self) {
        if self.capacity == 0 {
            return;
        }
        let first = self.words[0] & 1;
        let last_word = self.words.len() - 1;
        for i in 0..last_word {
            self.words[i] = (self.words[i] >> 1) | ((self.words[i + 1] & 1) << 31);
        }
        self.words[last_word] >>= 1;

        let top = self.capacity - 1;
        self.words[top / 32] |= first << (top % 32);
    }

    /// Index of the lowest set bit.
    pub fn first_set_index(&self) -> Option<usize> {
        self.words.iter().enumerate().find_map(|(i, &word)| {
            (word != 0).then(|| i * 32 + word.trailing_zeros() as usize)
        })
    }

    fn check_index(&self, index: usize) -> bool {
        if index < self.capacity {
            return true;
        }
        debug_assert!(false, "ack window index {} out of range 0..{}", index, self.capacity);
        tracing::error!("ack window index {} out of range 0..{}", index, self.capacity);
        false
    }
}

impl fmt::Debug for AckWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits: String =
            (0..self.capacity).map(|i| if self.get(i) { '1' } else { '0' }).collect();
        f.debug_struct("AckWindow")
            .field("capacity", &self.capacity)
            .field("count", &self.num_set)
            .field("bits", &bits)
            .finish()
    }
}
