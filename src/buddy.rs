//! A binary-buddy allocator over a single arena.
//!
//! Each size class owns an allocation bitmap, a split bitmap (all classes but
//! the smallest), and a free list threaded through its free blocks. The
//! bookkeeping obeys two rules:
//!
//! - a block on the free list of class `k` is neither allocated nor split, and
//!   its parent (if any) is split;
//! - every ancestor of an allocated block is both allocated and split.
//!
//! Together these let `release` recover a block's size class from its
//! address alone: the class of a block is the first class whose parent is
//! split.

use core::{
    alloc::Layout,
    fmt,
    mem::{self, ManuallyDrop},
    ops::Range,
    ptr::NonNull,
    slice,
};

use spin::Mutex;

#[cfg(any(feature = "alloc", test))]
use crate::Global;
use crate::{
    base::{BasePtr, DoubleBlockLink},
    bitmap::Bitmap,
    free_list::FreeList,
    geometry::Geometry,
    polyfill::NonNullStrict,
    stats::{ClassStats, Stats},
    AllocError, AllocInitError, BackingAllocator, Raw,
};

/// The metadata for one size class.
struct SizeClass {
    alloc: Bitmap,
    splits: Option<Bitmap>,
    free: FreeList,
}

impl SizeClass {
    #[inline]
    fn is_split(&self, index: usize) -> bool {
        self.splits.as_ref().map_or(false, |s| s.get(index))
    }

    #[inline]
    fn set_split(&mut self, index: usize, value: bool) {
        self.splits
            .as_mut()
            .expect("leaf blocks have no split bits")
            .set(index, value);
    }

    /// Returns true if the block is neither allocated nor split.
    #[inline]
    fn is_free(&self, index: usize) -> bool {
        !self.alloc.get(index) && !self.is_split(index)
    }
}

/// Where bootstrap places the allocator's metadata.
#[derive(Copy, Clone, Debug)]
enum MetadataPlacement {
    /// At the head of the arena. The bytes it occupies, rounded up to the leaf
    /// size, are reserved for the lifetime of the allocator.
    InArena,
    /// In a caller-provided buffer outside the arena. Nothing is reserved.
    External { ptr: NonNull<u8>, len: usize },
}

/// Returns the layout of the metadata for an arena of the given geometry.
///
/// The per-class records come first, followed by the allocation bitmaps of
/// every class, followed by the split bitmaps of classes 1 and up.
fn metadata_layout(geometry: &Geometry) -> Result<Layout, AllocInitError> {
    let mut layout = Layout::array::<SizeClass>(geometry.num_classes())
        .map_err(|_| AllocInitError::InvalidConfig)?;

    let alloc_maps = (0..geometry.num_classes()).map(|k| geometry.num_blocks(k));
    let split_maps = (1..geometry.num_classes()).map(|k| geometry.num_blocks(k));

    for num_bits in alloc_maps.chain(split_maps) {
        let (extended, _) = layout
            .extend(Bitmap::map_layout(num_bits))
            .map_err(|_| AllocInitError::InvalidConfig)?;
        layout = extended;
    }

    Ok(layout)
}

/// The unsynchronized allocator state.
struct RawBuddy {
    /// The leaf-aligned base of the arena, covering only the bytes that
    /// actually exist.
    base: BasePtr,
    geometry: Geometry,
    /// The per-class records, `geometry.num_classes()` of them.
    classes: NonNull<SizeClass>,
    /// The number of bytes at the head of the arena reserved for metadata.
    reserved: usize,
}

// SAFETY: `RawBuddy` exclusively owns the arena and its metadata; the raw
// pointers it holds are never shared outside of it.
unsafe impl Send for RawBuddy {}

impl RawBuddy {
    /// Bootstraps an allocator over `len` bytes starting at `region`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `region` must be valid for reads and writes for `len` bytes.
    /// - If `metadata` is `External`, its buffer must be valid for reads and
    ///   writes for its full length and must not overlap the region.
    /// - Neither buffer may be accessed by anything but the returned value for
    ///   as long as it exists.
    unsafe fn new(
        region: NonNull<u8>,
        len: usize,
        leaf_size: usize,
        metadata: MetadataPlacement,
    ) -> Result<RawBuddy, AllocInitError> {
        let region = BasePtr::new(region, len).ok_or(AllocInitError::InvalidConfig)?;

        // Round the base up to leaf alignment and the end down to it.
        let base_addr = region
            .addr()
            .get()
            .checked_next_multiple_of(leaf_size)
            .ok_or(AllocInitError::InvalidConfig)?;
        let skip = base_addr - region.addr().get();
        if skip >= len {
            return Err(AllocInitError::InvalidConfig);
        }
        let real_len = (len - skip) / leaf_size * leaf_size;
        if real_len == 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        let base = BasePtr::new(region.with_offset(skip), real_len)
            .ok_or(AllocInitError::InvalidConfig)?;
        let geometry =
            Geometry::covering(leaf_size, real_len).ok_or(AllocInitError::InvalidConfig)?;
        let layout = metadata_layout(&geometry)?;

        let (meta_ptr, reserved) = match metadata {
            MetadataPlacement::InArena => {
                let reserved = layout
                    .size()
                    .checked_next_multiple_of(leaf_size)
                    .ok_or(AllocInitError::InvalidConfig)?;

                if reserved > real_len {
                    return Err(AllocInitError::MetadataTooLarge {
                        required: reserved,
                        available: real_len,
                    });
                }

                (base.ptr(), reserved)
            }

            MetadataPlacement::External { ptr, len } => {
                if len < layout.size() {
                    return Err(AllocInitError::MetadataTooLarge {
                        required: layout.size(),
                        available: len,
                    });
                }

                if ptr.addr().get() % layout.align() != 0 {
                    return Err(AllocInitError::MisalignedMetadata);
                }

                (ptr, 0)
            }
        };

        let classes = unsafe { Self::carve_metadata(&geometry, meta_ptr) };

        let mut raw = RawBuddy {
            base,
            geometry,
            classes,
            reserved,
        };

        log::debug!(
            "buddy: {real_len} bytes at {:#x} in {} size classes of {leaf_size}..={} bytes",
            base.addr(),
            geometry.num_classes(),
            geometry.arena_size(),
        );

        // The metadata footprint, then the padding introduced by rounding the
        // arena up to a power of two.
        raw.mark_reserved(0..reserved);
        raw.mark_reserved(real_len..geometry.arena_size());

        log::debug!(
            "buddy: {reserved} bytes reserved for metadata, {} bytes of tail padding",
            geometry.arena_size() - real_len
        );

        raw.reconcile_free_lists();

        let usable = raw.free_bytes();
        assert_eq!(
            usable,
            geometry.arena_size() - reserved - (geometry.arena_size() - real_len),
            "buddy: free-byte reconciliation mismatch at bootstrap"
        );

        log::debug!("buddy: {usable} bytes usable");

        Ok(raw)
    }

    /// Writes the per-class records and zeroed bitmaps to `meta`.
    ///
    /// # Safety
    ///
    /// `meta` must be aligned for `SizeClass` and valid for reads and writes
    /// for `metadata_layout(geometry).size()` bytes.
    unsafe fn carve_metadata(geometry: &Geometry, meta: NonNull<u8>) -> NonNull<SizeClass> {
        let num_classes = geometry.num_classes();
        let classes = meta.cast::<SizeClass>();

        let alloc_bytes: usize = (0..num_classes)
            .map(|k| Bitmap::num_bytes(geometry.num_blocks(k)))
            .sum();

        unsafe {
            let mut alloc_curs = meta.as_ptr().add(mem::size_of::<SizeClass>() * num_classes);
            let mut split_curs = alloc_curs.add(alloc_bytes);

            for k in 0..num_classes {
                let num_blocks = geometry.num_blocks(k);

                let alloc = Bitmap::new(num_blocks, alloc_curs);
                alloc_curs = alloc_curs.add(Bitmap::num_bytes(num_blocks));

                let splits = if k > 0 {
                    let splits = Bitmap::new(num_blocks, split_curs);
                    split_curs = split_curs.add(Bitmap::num_bytes(num_blocks));
                    Some(splits)
                } else {
                    None
                };

                classes.as_ptr().add(k).write(SizeClass {
                    alloc,
                    splits,
                    free: FreeList::new(),
                });
            }
        }

        classes
    }

    #[inline]
    fn classes(&self) -> &[SizeClass] {
        // SAFETY: `classes` points to `num_classes()` initialized records
        // owned by `self`.
        unsafe { slice::from_raw_parts(self.classes.as_ptr(), self.geometry.num_classes()) }
    }

    #[inline]
    fn classes_mut(&mut self) -> &mut [SizeClass] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { slice::from_raw_parts_mut(self.classes.as_ptr(), self.geometry.num_classes()) }
    }

    /// Marks every block intersecting `range` as allocated, and as split in
    /// every class above the leaves.
    ///
    /// Only used during bootstrap.
    fn mark_reserved(&mut self, range: Range<usize>) {
        if range.is_empty() {
            return;
        }

        let geometry = self.geometry;
        assert!(
            range.start % geometry.leaf_size() == 0 && range.end % geometry.leaf_size() == 0,
            "buddy: reserved range {range:#x?} is not leaf-aligned"
        );

        for (k, class) in self.classes_mut().iter_mut().enumerate() {
            for i in geometry.indices_touching(k, range.clone()) {
                class.alloc.set(i, true);

                if let Some(s) = class.splits.as_mut() {
                    s.set(i, true);
                }
            }
        }
    }

    /// Puts every block that is free at its own class onto that class's free
    /// list.
    ///
    /// A block is listed if it is unmarked and its parent is marked, or if it
    /// is the unmarked top-level block. Descendants of a listed block are
    /// covered by it. Blocks are pushed highest-first so that the lowest
    /// address ends up at the head of each list.
    fn reconcile_free_lists(&mut self) {
        let base = self.base;
        let geometry = self.geometry;
        let max_class = geometry.max_class();
        let classes = self.classes_mut();

        for k in 0..=max_class {
            for i in (0..geometry.num_blocks(k)).rev() {
                let parent_split =
                    k == max_class || classes[k + 1].is_split(Geometry::parent_index(i));

                if parent_split && !classes[k].alloc.get(i) {
                    // SAFETY: unmarked blocks lie entirely inside the real
                    // arena and outside the reserved region.
                    unsafe { classes[k].free.push(base, geometry.offset_of(k, i)) };
                }
            }
        }
    }

    /// Returns the total size of the blocks on all free lists.
    fn free_bytes(&self) -> usize {
        self.classes()
            .iter()
            .enumerate()
            .map(|(k, c)| c.free.len() * self.geometry.block_size(k))
            .sum()
    }

    fn allocate(&mut self, nbytes: usize) -> Result<NonNull<[u8]>, AllocError> {
        if nbytes == 0 {
            return Err(AllocError::ZeroSize);
        }

        let base = self.base;
        let geometry = self.geometry;
        let target = geometry
            .class_for(nbytes)
            .ok_or(AllocError::CapacityExceeded)?;
        let classes = self.classes_mut();

        // Take the first free block at or above the target class.
        let mut k = (target..=geometry.max_class())
            .find(|&k| !classes[k].free.is_empty())
            .ok_or(AllocError::Exhausted)?;
        let block_ofs = unsafe { classes[k].free.pop(base) }.ok_or(AllocError::Exhausted)?;

        debug_assert!(classes[k].is_free(geometry.index_of(k, block_ofs)));
        classes[k].alloc.set(geometry.index_of(k, block_ofs), true);

        // Split the block repeatedly to obtain a suitably sized block. The
        // address of the front half does not change.
        while k > target {
            classes[k].set_split(geometry.index_of(k, block_ofs), true);

            k -= 1;
            classes[k].alloc.set(geometry.index_of(k, block_ofs), true);

            let back_half = block_ofs + geometry.block_size(k);
            // SAFETY: the back half was part of a free block.
            unsafe { classes[k].free.push(base, back_half) };

            log::trace!("buddy: split off {back_half:#x} at class {k}");
        }

        log::trace!("buddy: allocate({nbytes}) -> {block_ofs:#x} at class {target}");

        Ok(base.with_offset_and_size(block_ofs, geometry.block_size(target)))
    }

    /// Returns the class at which the block starting at `block_ofs` is owned.
    ///
    /// This is the first class whose parent is split. A block with no split
    /// ancestor at all is the top-level block.
    fn class_of(&self, block_ofs: usize) -> usize {
        let geometry = self.geometry;
        let classes = self.classes();

        (0..geometry.max_class())
            .find(|&k| classes[k + 1].is_split(geometry.index_of(k + 1, block_ofs)))
            .unwrap_or(geometry.max_class())
    }

    /// Releases the block at `ptr`, coalescing it with free buddies.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` does not denote a currently allocated block.
    fn release(&mut self, ptr: NonNull<u8>) {
        let base = self.base;
        let geometry = self.geometry;

        let mut block_ofs = match base.offset_to(ptr.addr()) {
            Some(ofs) if ofs >= self.reserved => ofs,
            _ => panic!("buddy: released pointer {ptr:p} was not allocated from this arena"),
        };

        assert!(
            block_ofs % geometry.leaf_size() == 0,
            "buddy: released pointer {ptr:p} is not leaf-aligned"
        );

        let class = self.class_of(block_ofs);
        let classes = self.classes_mut();

        let index = geometry.index_of(class, block_ofs);
        assert!(
            block_ofs % geometry.block_size(class) == 0
                && classes[class].alloc.get(index)
                && !classes[class].is_split(index),
            "buddy: released pointer {ptr:p} is not an allocated block"
        );

        let mut k = class;
        loop {
            let index = geometry.index_of(k, block_ofs);
            classes[k].alloc.set(index, false);

            if k == geometry.max_class() {
                break;
            }

            let buddy = Geometry::buddy_index(index);
            if !classes[k].is_free(buddy) {
                break;
            }

            // The buddy is free, so it is on this class's free list.
            let buddy_ofs = geometry.offset_of(k, buddy);
            unsafe { classes[k].free.remove(base, buddy_ofs) };

            classes[k + 1].set_split(Geometry::parent_index(index), false);
            block_ofs = block_ofs.min(buddy_ofs);
            k += 1;

            log::trace!("buddy: merged into {block_ofs:#x} at class {k}");
        }

        // SAFETY: the block was allocated, so it is free to hold a link now.
        unsafe { classes[k].free.push(base, block_ofs) };

        log::trace!("buddy: release({ptr:p}) from class {class}, listed at class {k}");
    }

    fn stats(&self) -> Stats {
        let mut stats = Stats::new();

        for (k, class) in self.classes().iter().enumerate() {
            let num_blocks = self.geometry.num_blocks(k);
            let split = class.splits.as_ref().map_or(0, Bitmap::count_ones);
            let allocated = (0..num_blocks)
                .filter(|&i| class.alloc.get(i) && !class.is_split(i))
                .count();

            stats.push(ClassStats {
                block_size: self.geometry.block_size(k),
                num_blocks,
                allocated,
                split,
                free: num_blocks - allocated - split,
                listed: class.free.len(),
            });
        }

        stats
    }

    /// Returns the number of classes that own the leaf at `ofs`.
    ///
    /// A class owns an address if the block containing it is allocated as a
    /// unit at that class, or is on that class's free list.
    #[cfg(test)]
    fn owning_classes(&self, ofs: usize) -> usize {
        let geometry = self.geometry;
        let classes = self.classes();
        let max_class = geometry.max_class();

        (0..=max_class)
            .filter(|&k| {
                let index = geometry.index_of(k, ofs);
                let class = &classes[k];

                let unit = class.alloc.get(index) && !class.is_split(index);
                let listed = class.is_free(index)
                    && (k == max_class || classes[k + 1].is_split(Geometry::parent_index(index)));

                unit || listed
            })
            .count()
    }
}

/// A binary-buddy allocator.
///
/// `LEAF_SIZE` is the size of the smallest block the allocator hands out. It
/// must be a power of two no smaller than two pointers, since free blocks
/// hold the links of their free list. Every request is rounded up to
/// `LEAF_SIZE << k` for the smallest suitable `k`.
///
/// All operations take `&self`; a spin lock inside the handle serializes
/// them, so the allocator may be shared between threads.
///
/// For example, a buddy allocator with 16-byte leaves over a 64 KiB arena
/// obtained from the global allocator:
///
/// ```
/// use buddy_arena::{Buddy, Global};
///
/// let buddy = Buddy::<16, Global>::try_new(64 * 1024).unwrap();
/// assert_eq!(buddy.geometry().max_class(), 12);
/// ```
pub struct Buddy<const LEAF_SIZE: usize, A: BackingAllocator> {
    raw: Mutex<RawBuddy>,
    /// Copies of immutable state, readable without taking the lock.
    base: BasePtr,
    geometry: Geometry,
    reserved: usize,
    /// The region and metadata buffer as they were handed to the allocator.
    ///
    /// These must not be used while the allocator exists; they are stored
    /// solely so that they can be returned to the backing allocator.
    region: (NonNull<u8>, Layout),
    metadata: Option<(NonNull<u8>, Layout)>,
    backing_allocator: A,
}

// SAFETY: all access to the arena and its metadata goes through the lock.
unsafe impl<const LEAF_SIZE: usize, A: BackingAllocator + Send> Send for Buddy<LEAF_SIZE, A> {}
unsafe impl<const LEAF_SIZE: usize, A: BackingAllocator + Sync> Sync for Buddy<LEAF_SIZE, A> {}

impl<const LEAF_SIZE: usize> Buddy<LEAF_SIZE, Raw> {
    /// Constructs a new `Buddy` over a raw region, storing its metadata at
    /// the head of the region.
    ///
    /// The start of the region is rounded up and its end rounded down to
    /// `LEAF_SIZE` alignment.
    ///
    /// # Errors
    ///
    /// Returns an error if the region cannot hold a leaf block plus the
    /// allocator's own metadata.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `region` must be valid for reads and writes for `len` bytes.
    /// - The region must not be accessed except through this allocator until
    ///   it is dropped or decomposed with [`into_raw_parts`](Self::into_raw_parts).
    pub unsafe fn new_raw(region: NonNull<u8>, len: usize) -> Result<Self, AllocInitError> {
        Self::assert_const_param_invariants();

        let region_layout = raw_layout(len)?;
        let raw = unsafe { RawBuddy::new(region, len, LEAF_SIZE, MetadataPlacement::InArena)? };

        Ok(Self::from_raw(raw, (region, region_layout), None, Raw))
    }

    /// Constructs a new `Buddy` over a raw region, storing its metadata in a
    /// separate buffer.
    ///
    /// No part of the region is reserved. The buffer must satisfy the
    /// [`Layout`] returned by [`Self::metadata_layout(len)`].
    ///
    /// # Errors
    ///
    /// Returns an error if the region cannot hold a leaf block, or if the
    /// metadata buffer is too small or misaligned.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `region` must be valid for reads and writes for `len` bytes.
    /// - `metadata` must be valid for reads and writes for `metadata_len`
    ///   bytes, and must not overlap the region.
    /// - Neither buffer may be accessed except through this allocator until
    ///   it is dropped or decomposed with [`into_raw_parts`](Self::into_raw_parts).
    ///
    /// [`Self::metadata_layout(len)`]: Self::metadata_layout
    pub unsafe fn new_raw_with_metadata(
        metadata: NonNull<u8>,
        metadata_len: usize,
        region: NonNull<u8>,
        len: usize,
    ) -> Result<Self, AllocInitError> {
        Self::assert_const_param_invariants();

        let region_layout = raw_layout(len)?;
        let metadata_layout = raw_layout(metadata_len)?;
        let placement = MetadataPlacement::External {
            ptr: metadata,
            len: metadata_len,
        };
        let raw = unsafe { RawBuddy::new(region, len, LEAF_SIZE, placement)? };

        Ok(Self::from_raw(
            raw,
            (region, region_layout),
            Some((metadata, metadata_layout)),
            Raw,
        ))
    }

    /// Decomposes the allocator into its raw components.
    ///
    /// The returned tuple contains the region pointer and, if one was
    /// supplied, the metadata pointer. All outstanding allocations are
    /// invalidated; the caller becomes the sole owner of both buffers again.
    pub fn into_raw_parts(self) -> (NonNull<u8>, Option<NonNull<u8>>) {
        let this = ManuallyDrop::new(self);

        (this.region.0, this.metadata.map(|(ptr, _)| ptr))
    }
}

#[cfg(any(feature = "alloc", test))]
impl<const LEAF_SIZE: usize> Buddy<LEAF_SIZE, Global> {
    /// Constructs a new `Buddy` over `len` bytes obtained from the global
    /// allocator, storing its metadata at the head of the arena.
    ///
    /// # Errors
    ///
    /// Returns an error if the arena cannot hold a leaf block plus the
    /// allocator's own metadata, or if the global allocator fails.
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(len: usize) -> Result<Self, AllocInitError> {
        Self::try_new_global(len, false)
    }

    /// Constructs a new `Buddy` over `len` bytes obtained from the global
    /// allocator, storing its metadata in a separate global allocation.
    ///
    /// The whole arena is available for allocation; if `len` is a power of
    /// two multiple of `LEAF_SIZE`, a single `len`-byte block can be
    /// allocated.
    ///
    /// # Errors
    ///
    /// Returns an error if `len` cannot hold a leaf block, or if the global
    /// allocator fails.
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new_with_external_metadata(len: usize) -> Result<Self, AllocInitError> {
        Self::try_new_global(len, true)
    }

    fn try_new_global(len: usize, external: bool) -> Result<Self, AllocInitError> {
        Self::assert_const_param_invariants();

        if len == 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        let region_layout =
            Layout::from_size_align(len, LEAF_SIZE).map_err(|_| AllocInitError::InvalidConfig)?;
        let metadata_layout = external.then(|| Self::metadata_layout(len)).transpose()?;

        let region = NonNull::new(unsafe { alloc::alloc::alloc(region_layout) })
            .ok_or(AllocInitError::AllocFailed(region_layout))?;

        let metadata = match metadata_layout {
            Some(layout) => match NonNull::new(unsafe { alloc::alloc::alloc(layout) }) {
                Some(ptr) => Some((ptr, layout)),
                None => {
                    unsafe { Global.deallocate(region, region_layout) };
                    return Err(AllocInitError::AllocFailed(layout));
                }
            },
            None => None,
        };

        let placement = match metadata {
            Some((ptr, layout)) => MetadataPlacement::External {
                ptr,
                len: layout.size(),
            },
            None => MetadataPlacement::InArena,
        };

        match unsafe { RawBuddy::new(region, len, LEAF_SIZE, placement) } {
            Ok(raw) => Ok(Self::from_raw(
                raw,
                (region, region_layout),
                metadata,
                Global,
            )),

            Err(e) => {
                unsafe {
                    Global.deallocate(region, region_layout);
                    if let Some((ptr, layout)) = metadata {
                        Global.deallocate(ptr, layout);
                    }
                }

                Err(e)
            }
        }
    }
}

impl<const LEAF_SIZE: usize, A: BackingAllocator> Buddy<LEAF_SIZE, A> {
    fn assert_const_param_invariants() {
        assert!(
            LEAF_SIZE.is_power_of_two(),
            "buddy allocator leaf size must be a power of two"
        );
        assert!(
            LEAF_SIZE >= mem::size_of::<DoubleBlockLink>(),
            "buddy allocator leaf size must be at least mem::size_of::<DoubleBlockLink>() bytes"
        );
        assert!(
            LEAF_SIZE >= mem::align_of::<SizeClass>(),
            "buddy allocator leaf size must be at least the alignment of its metadata"
        );
    }

    fn from_raw(
        raw: RawBuddy,
        region: (NonNull<u8>, Layout),
        metadata: Option<(NonNull<u8>, Layout)>,
        backing_allocator: A,
    ) -> Self {
        Buddy {
            base: raw.base,
            geometry: raw.geometry,
            reserved: raw.reserved,
            raw: Mutex::new(raw),
            region,
            metadata,
            backing_allocator,
        }
    }

    /// Returns the layout requirements of an external metadata buffer for an
    /// arena of `len` bytes.
    ///
    /// This assumes the arena starts `LEAF_SIZE`-aligned; a misaligned region
    /// loses its unaligned head and never needs more metadata than this.
    ///
    /// # Errors
    ///
    /// Returns an error if `len` cannot hold a single leaf block, or if the
    /// arena is too large to describe.
    pub fn metadata_layout(len: usize) -> Result<Layout, AllocInitError> {
        Self::assert_const_param_invariants();

        let real_len = len / LEAF_SIZE * LEAF_SIZE;
        let geometry =
            Geometry::covering(LEAF_SIZE, real_len).ok_or(AllocInitError::InvalidConfig)?;

        metadata_layout(&geometry)
    }

    /// Returns the size classes of the arena.
    #[inline]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Returns the managed arena: the leaf-aligned part of the region that
    /// actually exists, including any reserved metadata.
    pub fn arena(&self) -> NonNull<[u8]> {
        self.base.with_offset_and_size(0, self.base.extent())
    }

    /// Returns the number of bytes at the head of the arena that hold the
    /// allocator's metadata.
    #[inline]
    pub fn reserved_bytes(&self) -> usize {
        self.reserved
    }

    /// Attempts to allocate a block of at least `nbytes` bytes.
    ///
    /// On success, returns a [`NonNull<[u8]>`] spanning the whole block, whose
    /// length is the request rounded up to the block size of its class. The
    /// block is `LEAF_SIZE`-aligned and its contents are uninitialized.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `nbytes` is zero, if it exceeds the largest size
    /// class, or if no block of a sufficient class is free.
    ///
    /// [`NonNull<[u8]>`]: NonNull
    pub fn allocate(&self, nbytes: usize) -> Result<NonNull<[u8]>, AllocError> {
        self.raw.lock().allocate(nbytes)
    }

    /// Releases the block referenced by `ptr`.
    ///
    /// The block is merged with its buddy for as long as the buddy is free,
    /// so it may rejoin the arena as part of a much larger block.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is not the start of a block currently allocated from
    /// this allocator and this is detectable: a pointer outside the arena,
    /// into the reserved metadata, not leaf-aligned, or to a block that is not
    /// allocated.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated via this
    /// allocator. The block must not be accessed after this call.
    pub unsafe fn release(&self, ptr: NonNull<u8>) {
        self.raw.lock().release(ptr);
    }

    /// Returns a snapshot of the per-class block counts.
    pub fn stats(&self) -> Stats {
        self.raw.lock().stats()
    }

    /// Returns the total size of all free blocks.
    pub fn free_bytes(&self) -> usize {
        self.raw.lock().free_bytes()
    }

    /// Runs `f` with the allocator state locked.
    #[cfg(test)]
    fn with_raw<R>(&self, f: impl FnOnce(&RawBuddy) -> R) -> R {
        f(&*self.raw.lock())
    }

    /// Returns the number of size classes owning the leaf at `ofs`.
    #[cfg(test)]
    pub(crate) fn owning_classes(&self, ofs: usize) -> usize {
        self.with_raw(|raw| raw.owning_classes(ofs))
    }

    /// Returns the class a released block at `ofs` would be returned to.
    #[cfg(test)]
    pub(crate) fn class_of(&self, ofs: usize) -> usize {
        self.with_raw(|raw| raw.class_of(ofs))
    }
}

impl<const LEAF_SIZE: usize, A: BackingAllocator> fmt::Debug for Buddy<LEAF_SIZE, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buddy")
            .field("base", &self.base.ptr())
            .field("geometry", &self.geometry)
            .field("reserved", &self.reserved)
            .finish_non_exhaustive()
    }
}

impl<const LEAF_SIZE: usize, A: BackingAllocator> Drop for Buddy<LEAF_SIZE, A> {
    fn drop(&mut self) {
        let (region, region_layout) = self.region;

        unsafe {
            self.backing_allocator.deallocate(region, region_layout);

            if let Some((metadata, metadata_layout)) = self.metadata {
                self.backing_allocator
                    .deallocate(metadata, metadata_layout);
            }
        }
    }
}

/// Describes a caller-provided buffer of `len` bytes.
fn raw_layout(len: usize) -> Result<Layout, AllocInitError> {
    Layout::from_size_align(len, 1).map_err(|_| AllocInitError::InvalidConfig)
}
