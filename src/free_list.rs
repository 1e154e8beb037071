use core::num::NonZeroUsize;

use crate::base::{BasePtr, DoubleBlockLink};

/// An intrusive, doubly linked list of free blocks.
///
/// The links live in the first bytes of each listed block, so every block on
/// the list must be at least `size_of::<DoubleBlockLink>()` bytes and aligned
/// for it. The list itself stores only the head address and a length.
///
/// Blocks are named by their offset from the arena base.
#[derive(Debug, Default)]
pub struct FreeList {
    head: Option<NonZeroUsize>,
    len: usize,
}

impl FreeList {
    pub const fn new() -> FreeList {
        FreeList { head: None, len: 0 }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Pushes the block at `offset` onto the front of the list.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - The block at `offset` must be free, unlisted, and valid for reads and
    ///   writes for `size_of::<DoubleBlockLink>()` bytes.
    /// - Every block already on the list must lie within `base`.
    pub unsafe fn push(&mut self, base: BasePtr, offset: usize) {
        let new_head = base.addr_at(offset);

        if let Some(old_head) = self.head {
            let old_head_mut = unsafe { base.link_mut(old_head) };
            old_head_mut.prev = Some(new_head);
        }

        unsafe {
            base.init_link_at(
                offset,
                DoubleBlockLink {
                    prev: None,
                    next: self.head,
                },
            )
        };

        self.head = Some(new_head);
        self.len += 1;
    }

    /// Removes the block at the front of the list and returns its offset.
    ///
    /// # Safety
    ///
    /// Every block on the list must lie within `base`.
    pub unsafe fn pop(&mut self, base: BasePtr) -> Option<usize> {
        let head = self.head?;

        unsafe { self.unlink(base, head) };

        base.offset_to(head)
    }

    /// Removes the block at `offset` from the list.
    ///
    /// # Safety
    ///
    /// The block at `offset` must be an element of this list, and every block
    /// on the list must lie within `base`.
    pub unsafe fn remove(&mut self, base: BasePtr, offset: usize) {
        unsafe { self.unlink(base, base.addr_at(offset)) };
    }

    unsafe fn unlink(&mut self, base: BasePtr, block: NonZeroUsize) {
        unsafe {
            let removed = base.link_mut(block);
            let (prev, next) = (removed.prev, removed.next);

            match prev {
                // Link `prev` forward to `next`.
                Some(p) => base.link_mut(p).next = next,

                // If there's no previous block, then `removed` is the head of
                // the list.
                None => {
                    debug_assert_eq!(self.head, Some(block), "unlinked block is not listed");
                    self.head = next;
                }
            }

            if let Some(n) = next {
                // Link `next` back to `prev`.
                base.link_mut(n).prev = prev;
            }
        }

        self.len -= 1;
    }
}
