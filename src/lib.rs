//! A binary-buddy allocator for a single contiguous arena.
//!
//! The arena is managed as a hierarchy of power-of-two size classes. Every
//! class keeps an allocation bitmap, a split bitmap, and an intrusive free
//! list threaded through the free blocks themselves. By default the metadata
//! lives at the head of the arena it describes, so no other allocator is
//! needed to bring the buddy allocator up.
//!
//! ```
//! use buddy_arena::{AllocError, Buddy, Global};
//!
//! let buddy = Buddy::<16, Global>::try_new(64 * 1024).unwrap();
//!
//! let block = buddy.allocate(100).unwrap();
//! assert_eq!(block.len(), 128);
//!
//! unsafe { buddy.release(block.cast()) };
//!
//! assert_eq!(buddy.allocate(1 << 20), Err(AllocError::CapacityExceeded));
//! ```

#![doc(html_root_url = "https://docs.rs/buddy_arena/0.1.0")]
#![no_std]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(docs_rs, feature(doc_cfg))]
// This is necessary to allow `sptr` and `polyfill` to shadow methods that are
// also provided inherently by newer toolchains.
#![allow(unstable_name_collisions)]

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

mod base;
mod bitmap;
pub mod buddy;
mod free_list;
pub mod geometry;
mod polyfill;
mod stats;

#[cfg(test)]
mod tests;

use core::{alloc::Layout, fmt, ptr::NonNull};

pub use crate::{
    buddy::Buddy,
    geometry::Geometry,
    stats::{ClassStats, Stats},
};

/// The error type for allocator constructors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocInitError {
    /// A necessary allocation failed.
    ///
    /// This variant is returned when a constructor attempts to allocate
    /// memory, either for metadata or the managed region, but the
    /// underlying allocator fails.
    ///
    /// The variant contains the [`Layout`] that could not be allocated.
    AllocFailed(Layout),

    /// The configuration of the allocator is invalid.
    ///
    /// This variant is returned when the region cannot hold a single leaf
    /// block, or when it is too large to be described by the address space.
    InvalidConfig,

    /// The metadata does not fit in the space set aside for it.
    ///
    /// For self-hosted metadata this means the arena is too small to hold
    /// its own bookkeeping; for external metadata, the supplied buffer is
    /// smaller than [`Buddy::metadata_layout`] requires.
    MetadataTooLarge {
        /// The number of bytes the metadata requires.
        required: usize,
        /// The number of bytes available for it.
        available: usize,
    },

    /// The external metadata buffer is not suitably aligned.
    MisalignedMetadata,
}

impl fmt::Display for AllocInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocInitError::AllocFailed(layout) => write!(
                f,
                "backing allocation of {} bytes (align {}) failed",
                layout.size(),
                layout.align()
            ),
            AllocInitError::InvalidConfig => f.write_str("invalid allocator configuration"),
            AllocInitError::MetadataTooLarge {
                required,
                available,
            } => write!(
                f,
                "metadata needs {required} bytes but only {available} are available"
            ),
            AllocInitError::MisalignedMetadata => f.write_str("metadata buffer is misaligned"),
        }
    }
}

/// Indicates an allocation failure.
///
/// All variants are ordinary, recoverable outcomes. Contract violations on
/// release are not reported through this type; they panic.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AllocError {
    /// A zero-byte block was requested.
    ZeroSize,

    /// The request is larger than the largest size class.
    CapacityExceeded,

    /// No free block exists at or above the requested size class.
    Exhausted,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AllocError::ZeroSize => "zero-sized allocation request",
            AllocError::CapacityExceeded => "request exceeds the largest size class",
            AllocError::Exhausted => "no free block of a sufficient size class",
        })
    }
}

/// Types which provide memory which backs an allocator.
///
/// This trait is implemented by the following types:
/// - The `Raw` marker type indicates that an allocator is not backed by another
///   allocator. This is the case when constructing the allocator from raw
///   pointers. Memory used by this allocator can be reclaimed using
///   `.into_raw_parts()`.
/// - The `Global` marker type indicates that an allocator is backed by the
///   global allocator. The allocator will free its memory on drop.
pub trait BackingAllocator: Sealed {
    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block of memory currently allocated via this allocator, and
    /// * `layout` must be the layout that block was allocated with.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A marker type indicating that an allocator is backed by raw pointers.
#[derive(Clone, Debug)]
pub struct Raw;
impl Sealed for Raw {}
impl BackingAllocator for Raw {
    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
}

#[cfg(any(feature = "alloc", test))]
/// The global memory allocator.
#[derive(Clone, Debug)]
pub struct Global;

#[cfg(any(feature = "alloc", test))]
impl Sealed for Global {}

#[cfg(any(feature = "alloc", test))]
impl BackingAllocator for Global {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
