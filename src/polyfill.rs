//! Strict-provenance helpers for `NonNull`.
//!
//! `sptr` covers raw pointers; this fills in the `NonNull` half so that
//! addresses can be taken and reattached without casting integers to
//! pointers.

use core::{num::NonZeroUsize, ptr::NonNull};

pub use sptr::Strict;

pub trait NonNullStrict<T> {
    fn addr(self) -> NonZeroUsize
    where
        T: Sized;

    fn with_addr(self, addr: NonZeroUsize) -> Self
    where
        T: Sized;
}

impl<T> NonNullStrict<T> for NonNull<T> {
    #[inline]
    fn addr(self) -> NonZeroUsize
    where
        T: Sized,
    {
        // SAFETY: The pointer is guaranteed by the type to be non-null,
        // meaning that the address will be non-zero.
        unsafe { NonZeroUsize::new_unchecked(Strict::addr(self.as_ptr())) }
    }

    #[inline]
    fn with_addr(self, addr: NonZeroUsize) -> Self
    where
        T: Sized,
    {
        // SAFETY: The result of `with_addr` is non-null because `addr` is
        // guaranteed to be non-zero.
        unsafe { NonNull::new_unchecked(Strict::with_addr(self.as_ptr(), addr.get())) }
    }
}
