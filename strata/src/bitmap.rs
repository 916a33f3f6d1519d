//! Bitmap over machine words
//!
//! The bitmap tracks the occupancy of a pool's blocks: bit `i` set means block
//! `i` is free, clear means it is allocated. The word array is not owned by the
//! bitmap, it is laid over a caller-provided region of the arena.
//!
//! Scans skip whole words first (fully clear words when looking for a set bit,
//! fully set words when looking for a clear bit) and only then locate the exact
//! bit with a trailing-zeros count.

use core::ptr::NonNull;

/// Number of blocks tracked by a single word
pub const BITS_PER_WORD: usize = usize::BITS as usize;

/// A fixed-capacity bit-vector laid over raw memory
pub struct Bitmap {
    /// First word of the array
    words: NonNull<usize>,
    /// Number of words covering `len` bits
    word_count: usize,
    /// Number of addressable bits
    len: usize,
}

impl Bitmap {
    /// Number of words needed to track `len` bits
    #[must_use]
    #[inline]
    pub const fn words_for(len: usize) -> usize {
        len.div_ceil(BITS_PER_WORD)
    }

    /// Size in bytes of the word array tracking `len` bits
    #[must_use]
    #[inline]
    pub const fn footprint(len: usize) -> usize {
        Self::words_for(len) * size_of::<usize>()
    }

    /// Lay a bitmap of `len` bits over `region`.
    ///
    /// When `init_all_free` is false every addressable bit starts clear.
    /// Padding bits in the last word are always initialized set.
    ///
    /// # Safety
    ///
    /// - `region` must be aligned for `usize` and valid for reads and writes
    ///   of `Bitmap::footprint(len)` bytes
    /// - The region must not be accessed through any other pointer while the
    ///   bitmap is alive
    pub unsafe fn new(region: NonNull<usize>, len: usize, init_all_free: bool) -> Self {
        let mut bitmap = Self {
            words: region,
            word_count: Self::words_for(len),
            len,
        };

        if init_all_free {
            bitmap.set_all();
        } else {
            bitmap.clear_all();
        }

        bitmap
    }

    #[must_use]
    #[inline]
    /// Number of addressable bits
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    #[inline]
    pub const fn word_count(&self) -> usize {
        self.word_count
    }

    #[inline]
    fn words(&self) -> &[usize] {
        // SAFETY: `new` guarantees `word_count` words are valid and exclusively ours
        unsafe { core::slice::from_raw_parts(self.words.as_ptr(), self.word_count) }
    }

    #[inline]
    fn words_mut(&mut self) -> &mut [usize] {
        // SAFETY: `new` guarantees `word_count` words are valid and exclusively ours
        unsafe { core::slice::from_raw_parts_mut(self.words.as_ptr(), self.word_count) }
    }

    /// Mask of the addressable bits in the last word
    #[inline]
    const fn last_word_mask(&self) -> usize {
        match self.len % BITS_PER_WORD {
            0 => usize::MAX,
            rem => (1 << rem) - 1,
        }
    }

    /// Find the lowest set (free) bit
    #[must_use]
    pub fn find_first_set(&self) -> Option<usize> {
        let (word_idx, word) = self
            .words()
            .iter()
            .enumerate()
            .find(|&(_, &word)| word != 0)?;

        let idx = word_idx * BITS_PER_WORD + word.trailing_zeros() as usize;
        // Padding bits are set, so a hit past `len` means every real bit is clear
        (idx < self.len).then_some(idx)
    }

    /// Find the lowest clear (allocated) bit
    #[must_use]
    pub fn find_first_clear(&self) -> Option<usize> {
        let (word_idx, word) = self
            .words()
            .iter()
            .enumerate()
            .find(|&(_, &word)| word != usize::MAX)?;

        let idx = word_idx * BITS_PER_WORD + (!word).trailing_zeros() as usize;
        (idx < self.len).then_some(idx)
    }

    /// Mark block `idx` as free
    ///
    /// `idx` must be lower than `len()`. This is only checked in debug builds.
    #[inline]
    pub fn set(&mut self, idx: usize) {
        debug_assert!(idx < self.len);
        self.words_mut()[idx / BITS_PER_WORD] |= 1 << (idx % BITS_PER_WORD);
    }

    /// Mark block `idx` as allocated
    ///
    /// `idx` must be lower than `len()`. This is only checked in debug builds.
    #[inline]
    pub fn clear(&mut self, idx: usize) {
        debug_assert!(idx < self.len);
        self.words_mut()[idx / BITS_PER_WORD] &= !(1 << (idx % BITS_PER_WORD));
    }

    #[must_use]
    #[inline]
    pub fn is_set(&self, idx: usize) -> bool {
        debug_assert!(idx < self.len);
        self.words()[idx / BITS_PER_WORD] & (1 << (idx % BITS_PER_WORD)) != 0
    }

    #[must_use]
    #[inline]
    pub fn is_clear(&self, idx: usize) -> bool {
        !self.is_set(idx)
    }

    pub fn set_all(&mut self) {
        self.words_mut().fill(usize::MAX);
    }

    /// Clear every addressable bit, leaving the padding set
    pub fn clear_all(&mut self) {
        let mask = self.last_word_mask();
        let words = self.words_mut();
        words.fill(0);
        if let Some(last) = words.last_mut() {
            *last = !mask;
        }
    }

    /// Returns `true` if every addressable bit is set
    #[must_use]
    pub fn all_set(&self) -> bool {
        let mask = self.last_word_mask();
        match self.words().split_last() {
            None => true,
            Some((last, rest)) => {
                rest.iter().all(|&word| word == usize::MAX) && last & mask == mask
            }
        }
    }

    /// Returns `true` if every addressable bit is clear
    #[must_use]
    pub fn all_clear(&self) -> bool {
        let mask = self.last_word_mask();
        match self.words().split_last() {
            None => true,
            Some((last, rest)) => rest.iter().all(|&word| word == 0) && last & mask == 0,
        }
    }

    /// Iterate over the indices of clear (allocated) bits in ascending order
    pub fn iter_clear(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|&idx| self.is_clear(idx))
    }
}
