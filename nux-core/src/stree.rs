//! The searchable bitmap (S-tree): a bitmap plus a stack of OR-reduction
//! ancestor levels giving `O(log n)` `setbit`/`clrbit`/`find_lowest`/
//! `find_highest` instead of the `O(n)` linear scan a flat bitmap needs
//! once its word count runs into the thousands (whole-machine frame
//! tracking, KVA arenas).
//!
//! Level 0 is the real bitmap, one bit per tracked index. Level `k+1` has
//! one bit per *word* of level `k`: that bit is the OR of all 64 bits in
//! the word it summarizes. The top level is always exactly one word, so a
//! search starts with one 64-bit word test and descends one level (one
//! more word test) per level until it lands on the real bit. `setbit`/
//! `clrbit` walk the same path bottom-up and stop as soon as a word's
//! zero/nonzero status doesn't change, since that's the only thing an
//! ancestor level records.
//!
//! The caller owns the backing storage (see [`STree::required_words`]):
//! this mirrors how the rest of this substrate's allocators are handed a
//! pre-mapped slice of memory to work in rather than allocating one
//! themselves.

const MAX_LEVELS: usize = 8;

/// A searchable bitmap over `bits` indices, backed by caller-provided
/// storage.
pub struct STree<'a> {
    bits: usize,
    num_levels: usize,
    level_offset: [usize; MAX_LEVELS],
    level_words: [usize; MAX_LEVELS],
    storage: &'a mut [u64],
}

fn div_round_up(n: usize, d: usize) -> usize {
    (n + d - 1) / d
}

impl<'a> STree<'a> {
    /// Returns the number of `u64` words of backing storage a tree over
    /// `bits` indices needs. Callers size their buffer with this before
    /// calling [`STree::new`].
    #[must_use]
    pub fn required_words(bits: usize) -> usize {
        let (_, _, _, total) = Self::compute_levels(bits);
        total
    }

    fn compute_levels(bits: usize) -> ([usize; MAX_LEVELS], [usize; MAX_LEVELS], usize, usize) {
        let mut level_offset = [0usize; MAX_LEVELS];
        let mut level_words = [0usize; MAX_LEVELS];
        let mut n = bits.max(1);
        let mut total = 0usize;
        let mut levels = 0usize;
        loop {
            let words = div_round_up(n, 64).max(1);
            level_offset[levels] = total;
            level_words[levels] = words;
            total += words;
            levels += 1;
            if words <= 1 || levels == MAX_LEVELS {
                break;
            }
            n = words;
        }
        (level_offset, level_words, levels, total)
    }

    /// Builds a tree over `bits` indices using `storage` (cleared to all
    /// zero bits). Panics if `storage` is shorter than
    /// [`STree::required_words`].
    pub fn new(bits: usize, storage: &'a mut [u64]) -> Self {
        let (level_offset, level_words, num_levels, total) = Self::compute_levels(bits);
        assert!(storage.len() >= total, "S-tree backing storage too small");
        storage[..total].fill(0);
        Self {
            bits,
            num_levels,
            level_offset,
            level_words,
            storage,
        }
    }

    /// Total number of indices this tree tracks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bits
    }

    /// Whether this tree tracks zero indices.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    fn level(&self, level: usize) -> &[u64] {
        &self.storage[self.level_offset[level]..self.level_offset[level] + self.level_words[level]]
    }

    fn level_mut(&mut self, level: usize) -> &mut [u64] {
        &mut self.storage[self.level_offset[level]..self.level_offset[level] + self.level_words[level]]
    }

    /// Returns whether `idx` is set.
    #[must_use]
    pub fn testbit(&self, idx: usize) -> bool {
        debug_assert!(idx < self.bits);
        let word = self.level(0)[idx / 64];
        word & (1u64 << (idx % 64)) != 0
    }

    /// Sets bit `idx`, propagating the change up the ancestor levels.
    pub fn setbit(&mut self, idx: usize) {
        debug_assert!(idx < self.bits);
        let mut word_idx = idx / 64;
        let mut bit = (idx % 64) as u32;
        for level in 0..self.num_levels {
            let word = &mut self.level_mut(level)[word_idx];
            let was_zero = *word == 0;
            *word |= 1u64 << bit;
            if level + 1 == self.num_levels || !was_zero {
                break;
            }
            bit = (word_idx % 64) as u32;
            word_idx /= 64;
        }
    }

    /// Clears bit `idx`, propagating the change up the ancestor levels.
    pub fn clrbit(&mut self, idx: usize) {
        debug_assert!(idx < self.bits);
        let mut word_idx = idx / 64;
        let mut bit = (idx % 64) as u32;
        for level in 0..self.num_levels {
            let word = &mut self.level_mut(level)[word_idx];
            *word &= !(1u64 << bit);
            let now_zero = *word == 0;
            if level + 1 == self.num_levels || !now_zero {
                break;
            }
            bit = (word_idx % 64) as u32;
            word_idx /= 64;
        }
    }

    fn find_by(&self, pick: impl Fn(u64) -> Option<u32>) -> Option<usize> {
        if self.bits == 0 {
            return None;
        }
        let mut word_idx = 0usize;
        for level in (0..self.num_levels).rev() {
            let word = self.level(level)[word_idx];
            let bit = pick(word)?;
            word_idx = word_idx * 64 + bit as usize;
        }
        if word_idx < self.bits {
            Some(word_idx)
        } else {
            None
        }
    }

    /// Returns the lowest-indexed set bit, or `None` if every bit is clear.
    #[must_use]
    pub fn find_lowest(&self) -> Option<usize> {
        self.find_by(|w| (w != 0).then(|| w.trailing_zeros()))
    }

    /// Returns the highest-indexed set bit, or `None` if every bit is clear.
    #[must_use]
    pub fn find_highest(&self) -> Option<usize> {
        self.find_by(|w| (w != 0).then(|| 63 - w.leading_zeros()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(bits: usize) -> Vec<u64> {
        vec![0u64; STree::required_words(bits)]
    }

    #[test]
    fn single_word_roundtrip() {
        let mut storage = make(64);
        let mut t = STree::new(64, &mut storage);
        assert_eq!(t.find_lowest(), None);
        t.setbit(5);
        t.setbit(40);
        assert!(t.testbit(5));
        assert!(t.testbit(40));
        assert!(!t.testbit(6));
        assert_eq!(t.find_lowest(), Some(5));
        assert_eq!(t.find_highest(), Some(40));
        t.clrbit(5);
        assert!(!t.testbit(5));
        assert_eq!(t.find_lowest(), Some(40));
    }

    #[test]
    fn multi_level_tree_finds_across_words() {
        let bits = 64 * 200; // needs 2 levels: 200 words, then 4 summary words
        let mut storage = make(bits);
        let mut t = STree::new(bits, &mut storage);
        assert_eq!(t.num_levels, 3);

        t.setbit(12_000);
        assert_eq!(t.find_lowest(), Some(12_000));
        assert_eq!(t.find_highest(), Some(12_000));

        t.setbit(5);
        t.setbit(9_999);
        assert_eq!(t.find_lowest(), Some(5));
        assert_eq!(t.find_highest(), Some(12_000));

        t.clrbit(12_000);
        assert_eq!(t.find_highest(), Some(9_999));
    }

    #[test]
    fn clearing_last_bit_in_word_clears_ancestors() {
        let bits = 64 * 64 * 3;
        let mut storage = make(bits);
        let mut t = STree::new(bits, &mut storage);
        t.setbit(1000);
        t.clrbit(1000);
        assert_eq!(t.find_lowest(), None);
        assert_eq!(t.find_highest(), None);
    }

    #[test]
    fn required_words_matches_actual_levels() {
        assert_eq!(STree::required_words(1), 1);
        // 64 bits: level0 = 1 word, already <= 1, stop.
        assert_eq!(STree::required_words(64), 1);
        // 65 bits: level0 = 2 words, level1 = 1 word.
        assert_eq!(STree::required_words(65), 2 + 1);
    }

    #[test]
    fn dense_fill_and_drain_preserves_search_correctness() {
        let bits = 2000;
        let mut storage = make(bits);
        let mut t = STree::new(bits, &mut storage);
        for i in (0..bits).step_by(3) {
            t.setbit(i);
        }
        let mut prev = None;
        while let Some(idx) = t.find_lowest() {
            assert!(prev.is_none_or(|p| idx > p));
            prev = Some(idx);
            t.clrbit(idx);
        }
        assert_eq!(t.find_lowest(), None);
    }
}
