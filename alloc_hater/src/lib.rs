//! A small library for ~~hating on~~ evaluating the correctness of size-class
//! allocators.
//!
//! An [`Evaluator`] drives a [`Subject`] through an arbitrary sequence of
//! allocations and releases. Every live block is painted with the ID of the
//! operation that produced it; a block whose paint has changed by the time it
//! is released was handed out twice.
#![deny(unsafe_op_in_unsafe_fn)]

use core::{mem::MaybeUninit, ptr::NonNull, slice};

/// The largest request an [`AllocatorOp::Alloc`] carries, in bits.
pub const MAX_SIZE_BITS: u32 = 24;

/// A request size which implements `Arbitrary`.
///
/// Sizes are drawn from a log-uniform distribution so that small requests are
/// as likely as large ones.
#[derive(Copy, Clone, Debug)]
pub struct ArbSize(pub usize);

impl arbitrary::Arbitrary<'_> for ArbSize {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        // Select a random bit index and shift to obtain a limit.
        let limit_shift = u32::from(u8::arbitrary(u)?) % (MAX_SIZE_BITS + 1);
        let limit: usize = 1 << limit_shift;

        Ok(ArbSize(usize::arbitrary(u)? % limit))
    }
}

#[derive(arbitrary::Arbitrary)]
enum AllocatorOpTag {
    Alloc,
    Release,
}

#[derive(Clone, Debug)]
pub enum AllocatorOp {
    /// Allocate a block of at least this many bytes.
    Alloc(usize),
    /// Release the outstanding block at this index, modulo the number of
    /// outstanding blocks.
    Release(usize),
}

impl arbitrary::Arbitrary<'_> for AllocatorOp {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let tag = AllocatorOpTag::arbitrary(u)?;

        let op = match tag {
            AllocatorOpTag::Alloc => AllocatorOp::Alloc(ArbSize::arbitrary(u)?.0),
            AllocatorOpTag::Release => AllocatorOp::Release(usize::arbitrary(u)?),
        };

        Ok(op)
    }
}

pub trait Subject {
    type AllocError;

    /// Allocates a block of at least `nbytes` bytes.
    fn allocate(&mut self, nbytes: usize) -> Result<NonNull<[u8]>, Self::AllocError>;

    /// Releases the block pointed to by `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated by this
    /// allocator.
    unsafe fn release(&mut self, ptr: NonNull<u8>);

    /// Checks the subject's internal bookkeeping after an operation.
    ///
    /// The default implementation accepts every state.
    fn check(&self) -> bool {
        true
    }
}

/// A list of allocated blocks.
#[derive(Default)]
pub struct Blocks {
    blocks: Vec<Block>,
}

impl Blocks {
    pub fn new() -> Blocks {
        Blocks { blocks: Vec::new() }
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn remove_modulo(&mut self, idx: usize) -> Option<Block> {
        let len = self.blocks.len();
        (len != 0).then(|| self.blocks.swap_remove(idx % len))
    }
}

impl IntoIterator for Blocks {
    type Item = Block;

    type IntoIter = std::vec::IntoIter<Block>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

/// An allocated block of memory.
pub struct Block {
    // A pointer to the allocated region.
    ptr: NonNull<[u8]>,
    // The number of bytes originally requested.
    requested: usize,
    // The unique ID of the last operation that wrote to this allocation.
    id: u64,
}

unsafe fn slice_ptr_to_uninit_slice_mut<'a>(ptr: NonNull<[u8]>) -> &'a mut [MaybeUninit<u8>] {
    unsafe { slice::from_raw_parts_mut(ptr.cast().as_ptr(), ptr.len()) }
}

fn paint(slice: &mut [MaybeUninit<u8>], id: u64) {
    let id_bytes = id.to_le_bytes().into_iter().cycle();

    for (byte, value) in slice.iter_mut().zip(id_bytes) {
        byte.write(value);
    }
}

impl Block {
    /// Creates a block from `ptr` and paints it according to `id`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ptr` must be valid for reads and writes for `ptr.len()` bytes.
    /// - No references to the memory at `ptr` may exist when this function is called.
    /// - No accesses to the memory at `ptr` may be made except by way of the
    ///   returned `Block` until said `Block` is dropped.
    pub unsafe fn init(ptr: NonNull<[u8]>, requested: usize, id: u64) -> Block {
        let mut b = Block { ptr, requested, id };
        b.paint(id);
        b
    }

    /// Returns true if the block is at least as large as the request.
    pub fn fits_request(&self) -> bool {
        self.ptr.len() >= self.requested
    }

    /// Returns the `Block`'s memory as a mutable slice of uninitialized bytes.
    pub fn as_uninit_slice_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        // SAFETY: self is mutably borrowed, so no other references to the
        // slice can exist
        unsafe { slice_ptr_to_uninit_slice_mut(self.ptr) }
    }

    pub fn into_raw_parts(self) -> (NonNull<[u8]>, usize) {
        (self.ptr, self.requested)
    }

    /// "Paints" the memory contained by `self` with the value of `id`.
    pub fn paint(&mut self, id: u64) {
        self.id = id;
        paint(self.as_uninit_slice_mut(), id);
    }

    /// Verifies that the memory contained by `self` has not been overwritten.
    pub fn verify(&self) -> bool {
        let slice: &[u8] = unsafe { self.ptr.as_ref() };
        let id_bytes = self.id.to_le_bytes().into_iter().cycle();

        slice.iter().zip(id_bytes).all(|(byte, value)| *byte == value)
    }
}

pub struct Evaluator<S: Subject> {
    subject: S,
}

#[derive(Clone, Debug)]
pub struct Failed {
    pub completed: Vec<AllocatorOp>,
    pub failed_op: AllocatorOp,
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failed>
    where
        I: IntoIterator<Item = AllocatorOp>,
    {
        let mut completed = Vec::new();
        let mut blocks = Blocks::new();

        for (op_id, op) in ops.into_iter().enumerate() {
            let op_id = op_id as u64;

            let ok = match op {
                AllocatorOp::Alloc(nbytes) => match self.subject.allocate(nbytes) {
                    Ok(ptr) => {
                        let block = unsafe { Block::init(ptr, nbytes, op_id) };
                        let fits = block.fits_request();
                        blocks.push(block);
                        fits
                    }

                    Err(_) => true,
                },

                AllocatorOp::Release(raw_idx) => match blocks.remove_modulo(raw_idx) {
                    Some(block) => {
                        let intact = block.verify();
                        let (ptr, _) = block.into_raw_parts();
                        unsafe { self.subject.release(ptr.cast()) };
                        intact
                    }

                    None => true,
                },
            };

            if !ok || !self.subject.check() {
                return Err(Failed {
                    completed,
                    failed_op: op,
                });
            }

            completed.push(op);
        }

        for block in blocks {
            let intact = block.verify();
            let (ptr, _) = block.into_raw_parts();
            unsafe { self.subject.release(ptr.cast()) };

            if !intact {
                return Err(Failed {
                    failed_op: AllocatorOp::Release(0),
                    completed,
                });
            }
        }

        Ok(())
    }
}
