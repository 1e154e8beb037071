use core::fmt;

/// The maximum number of size classes any arena can have.
pub(crate) const MAX_CLASSES: usize = usize::BITS as usize;

/// Block counts for one size class.
///
/// Each block of the class is counted exactly once: as split if its split bit
/// is set, otherwise as allocated if its allocation bit is set, otherwise as
/// free. Free blocks that descend from a larger free block are counted as
/// free without being on the free list; `listed` counts the free list alone.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassStats {
    /// The size of each block in this class.
    pub block_size: usize,
    /// The number of blocks of this class tiling the nominal arena.
    pub num_blocks: usize,
    /// Blocks granted to a caller or permanently reserved.
    pub allocated: usize,
    /// Blocks subdivided into smaller classes.
    pub split: usize,
    /// Blocks that are neither allocated nor split.
    pub free: usize,
    /// Blocks on this class's free list.
    pub listed: usize,
}

/// A snapshot of the per-class occupancy of a buddy arena.
///
/// Obtained from [`Buddy::stats`](crate::Buddy::stats). The `Display`
/// implementation prints one line per class.
#[derive(Clone, PartialEq, Eq)]
pub struct Stats {
    classes: [ClassStats; MAX_CLASSES],
    num_classes: usize,
}

impl Stats {
    pub(crate) fn new() -> Stats {
        Stats {
            classes: [ClassStats::default(); MAX_CLASSES],
            num_classes: 0,
        }
    }

    pub(crate) fn push(&mut self, class: ClassStats) {
        self.classes[self.num_classes] = class;
        self.num_classes += 1;
    }

    /// Returns the counts for every class, smallest blocks first.
    pub fn classes(&self) -> &[ClassStats] {
        &self.classes[..self.num_classes]
    }

    /// Returns the total size of all blocks on free lists.
    pub fn listed_bytes(&self) -> usize {
        self.classes()
            .iter()
            .map(|c| c.listed * c.block_size)
            .sum()
    }
}

impl fmt::Debug for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.classes()).finish()
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, c) in self.classes().iter().enumerate() {
            writeln!(
                f,
                "class {k:>2} ({:>8} bytes x {:>6}): allocated {}, split {}, free {} ({} listed)",
                c.block_size, c.num_blocks, c.allocated, c.split, c.free, c.listed
            )?;
        }

        Ok(())
    }
}
