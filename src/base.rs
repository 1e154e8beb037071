use core::{
    num::NonZeroUsize,
    ptr::{self, NonNull},
};

use crate::polyfill::{NonNullStrict, Strict};

/// A pointer to the base of the arena managed by an allocator.
///
/// Everything inside the allocator is expressed as byte offsets from this
/// pointer; absolute addresses are only produced at the API boundary.
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr` covering `extent` bytes.
    ///
    /// The returned value assumes the provenance of `ptr`. Returns `None` if
    /// the end of the region would overflow the address space.
    #[inline]
    pub fn new(ptr: NonNull<u8>, extent: usize) -> Option<BasePtr> {
        ptr.addr().get().checked_add(extent)?;

        Some(BasePtr { ptr, extent })
    }

    /// Returns the base pointer as a `NonNull<u8>`.
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the number of bytes covered by the region.
    #[inline]
    pub fn extent(self) -> usize {
        self.extent
    }

    #[inline]
    pub fn limit(self) -> usize {
        self.ptr.addr().get() + self.extent
    }

    #[inline]
    pub fn contains_addr(self, addr: NonZeroUsize) -> bool {
        self.ptr.addr() <= addr && addr.get() < self.limit()
    }

    /// Returns the address of the base pointer.
    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        self.ptr.addr()
    }

    /// Calculates the offset from `self` to `addr`.
    ///
    /// Returns `None` if `addr` lies outside the region.
    #[inline]
    pub fn offset_to(self, addr: NonZeroUsize) -> Option<usize> {
        self.contains_addr(addr)
            .then(|| addr.get() - self.ptr.addr().get())
    }

    /// Returns the address `offset` bytes past the base.
    #[inline]
    pub fn addr_at(self, offset: usize) -> NonZeroUsize {
        debug_assert!(offset < self.extent, "offset {offset:#x} out of region");

        // The region limit was checked for overflow on construction, and the
        // base address is non-zero.
        NonZeroUsize::new(self.ptr.addr().get() + offset).unwrap()
    }

    /// Creates a new pointer `offset` bytes past the base.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_offset(self, offset: usize) -> NonNull<u8> {
        self.ptr.with_addr(self.addr_at(offset))
    }

    /// Creates a slice pointer of `len` bytes starting `offset` bytes past the
    /// base.
    #[inline]
    pub fn with_offset_and_size(self, offset: usize, len: usize) -> NonNull<[u8]> {
        let ptr = self.ptr.as_ptr().with_addr(self.addr_at(offset).get());
        let raw_slice = ptr::slice_from_raw_parts_mut(ptr, len);

        // SAFETY: `ptr` carries a non-zero address.
        unsafe { NonNull::new_unchecked(raw_slice) }
    }

    /// Initializes a `DoubleBlockLink` at the given offset.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `offset` must be properly aligned for `DoubleBlockLink` values.
    /// - The memory at `offset` must be valid for reads and writes for
    ///   `size_of::<DoubleBlockLink>()` bytes.
    /// - The memory at `offset` must be unallocated by the associated allocator.
    #[inline]
    pub unsafe fn init_link_at(self, offset: usize, link: DoubleBlockLink) {
        debug_assert!(
            link.next.map_or(true, |next| self.contains_addr(next)),
            "next link out of region"
        );
        debug_assert!(
            link.prev.map_or(true, |prev| self.contains_addr(prev)),
            "prev link out of region"
        );

        unsafe {
            self.with_offset(offset)
                .cast::<DoubleBlockLink>()
                .as_ptr()
                .write(link)
        };
    }

    /// Returns a mutable reference to the `DoubleBlockLink` at `link`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `link` must be a properly aligned address for `DoubleBlockLink` values.
    /// - The memory at `link` must contain a properly initialized `DoubleBlockLink` value.
    /// - The memory at `link` must be unallocated by the associated allocator.
    #[inline]
    pub unsafe fn link_mut<'a>(self, link: NonZeroUsize) -> &'a mut DoubleBlockLink {
        debug_assert!(self.contains_addr(link));

        unsafe { self.ptr.with_addr(link).cast::<DoubleBlockLink>().as_mut() }
    }
}

// Rather than using pointers, store only the addresses of the previous and
// next links. This avoids accidentally violating stacked borrows; the
// links "point to" other blocks, but by forgoing actual pointers, no borrow
// is implied.
//
// NOTE: Any actual pointer to a block must be acquired via the arena base
// pointer, and NOT by casting these addresses directly!

/// A double link in a linked list of free blocks.
///
/// This type is embedded in the block itself, forming an intrusive doubly
/// linked list.
#[repr(C)]
#[derive(Debug)]
pub struct DoubleBlockLink {
    pub prev: Option<NonZeroUsize>,
    pub next: Option<NonZeroUsize>,
}
