//! Size classes and the mapping between offsets and block indices.
//!
//! All quantities here are arena-relative: offset 0 is the (leaf-aligned)
//! base of the arena, and the nominal arena spans
//! `leaf_size << max_class` bytes.

use core::ops::Range;

/// The shape of a buddy arena: its leaf size and number of size classes.
///
/// Class `k` holds blocks of `leaf_size << k` bytes. Class 0 is the leaf
/// granularity; class `max_class` is a single block spanning the whole
/// nominal arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    leaf_size: usize,
    max_class: usize,
}

impl Geometry {
    /// Returns the smallest geometry whose nominal arena covers `len` bytes.
    ///
    /// Returns `None` if `leaf_size` is not a power of two, if `len` is zero,
    /// or if the nominal arena size would overflow a `usize`.
    pub fn covering(leaf_size: usize, len: usize) -> Option<Geometry> {
        if !leaf_size.is_power_of_two() || len == 0 {
            return None;
        }

        let num_leaves = len.div_ceil(leaf_size).checked_next_power_of_two()?;
        let max_class = num_leaves.trailing_zeros() as usize;

        // The nominal arena size must itself be representable.
        leaf_size.checked_mul(num_leaves)?;

        Some(Geometry {
            leaf_size,
            max_class,
        })
    }

    /// Returns the size of a class-0 block.
    #[inline]
    pub fn leaf_size(&self) -> usize {
        self.leaf_size
    }

    /// Returns the index of the largest size class.
    #[inline]
    pub fn max_class(&self) -> usize {
        self.max_class
    }

    /// Returns the number of size classes.
    #[inline]
    pub fn num_classes(&self) -> usize {
        self.max_class + 1
    }

    /// Returns the size of the nominal arena, i.e. of the single top-class
    /// block.
    #[inline]
    pub fn arena_size(&self) -> usize {
        self.block_size(self.max_class)
    }

    /// Returns the size of a block of class `k`.
    #[inline]
    pub fn block_size(&self, k: usize) -> usize {
        debug_assert!(k <= self.max_class);
        self.leaf_size << k
    }

    /// Returns the number of blocks of class `k` that tile the nominal arena.
    #[inline]
    pub fn num_blocks(&self, k: usize) -> usize {
        debug_assert!(k <= self.max_class);
        1 << (self.max_class - k)
    }

    /// Returns the smallest class whose blocks can hold `nbytes` bytes.
    ///
    /// Returns `None` if `nbytes` exceeds the top class.
    pub fn class_for(&self, nbytes: usize) -> Option<usize> {
        if nbytes > self.arena_size() {
            return None;
        }

        let leaves = nbytes.div_ceil(self.leaf_size).max(1);

        // `leaves` is at most 2^max_class, so this cannot overflow.
        Some(leaves.next_power_of_two().trailing_zeros() as usize)
    }

    /// Returns the index of the class-`k` block containing `offset`.
    #[inline]
    pub fn index_of(&self, k: usize, offset: usize) -> usize {
        offset >> (self.leaf_size.trailing_zeros() as usize + k)
    }

    /// Returns the index of the first class-`k` block that starts at or after
    /// `offset`.
    #[inline]
    pub fn index_at_or_after(&self, k: usize, offset: usize) -> usize {
        offset.div_ceil(self.block_size(k))
    }

    /// Returns the range of class-`k` block indices whose blocks intersect
    /// the byte range `range`.
    pub fn indices_touching(&self, k: usize, range: Range<usize>) -> Range<usize> {
        if range.is_empty() {
            return 0..0;
        }

        self.index_of(k, range.start)..self.index_at_or_after(k, range.end)
    }

    /// Returns the offset of class-`k` block `index`.
    #[inline]
    pub fn offset_of(&self, k: usize, index: usize) -> usize {
        debug_assert!(index < self.num_blocks(k));
        index * self.block_size(k)
    }

    /// Returns the index of the buddy of block `index`.
    #[inline]
    pub const fn buddy_index(index: usize) -> usize {
        index ^ 1
    }

    /// Returns the index, one class up, of the parent of block `index`.
    #[inline]
    pub const fn parent_index(index: usize) -> usize {
        index >> 1
    }
}
