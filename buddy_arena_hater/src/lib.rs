#![deny(unsafe_op_in_unsafe_fn)]

use std::ptr::NonNull;

use alloc_hater::Subject;
use buddy_arena::{AllocInitError, Buddy, Global};

pub struct BuddySubject<const LEAF_SIZE: usize>(Buddy<LEAF_SIZE, Global>);

impl<const LEAF_SIZE: usize> BuddySubject<LEAF_SIZE> {
    /// Creates a subject whose metadata lives at the head of its arena.
    pub fn new(len: usize) -> Result<Self, AllocInitError> {
        let b = Buddy::try_new(len)?;
        Ok(BuddySubject(b))
    }

    /// Creates a subject whose metadata lives in a separate allocation.
    pub fn new_with_external_metadata(len: usize) -> Result<Self, AllocInitError> {
        let b = Buddy::try_new_with_external_metadata(len)?;
        Ok(BuddySubject(b))
    }
}

impl<const LEAF_SIZE: usize> Subject for BuddySubject<LEAF_SIZE> {
    type AllocError = buddy_arena::AllocError;

    fn allocate(&mut self, nbytes: usize) -> Result<NonNull<[u8]>, Self::AllocError> {
        self.0.allocate(nbytes)
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>) {
        unsafe { self.0.release(ptr) };
    }

    fn check(&self) -> bool {
        let stats = self.0.stats();

        let counts_agree = stats
            .classes()
            .iter()
            .all(|c| c.allocated + c.split + c.free == c.num_blocks && c.listed <= c.free);

        counts_agree && stats.listed_bytes() == self.0.free_bytes()
    }
}
