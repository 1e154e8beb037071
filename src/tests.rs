#![cfg(test)]
extern crate std;

use core::{mem, ptr::NonNull, slice};
use std::{prelude::rust_2021::*, thread};

use quickcheck::{Arbitrary, Gen, QuickCheck};

use crate::{polyfill::Strict, AllocError, AllocInitError, Buddy, Global, Raw, Stats};

const LEAF: usize = 16;

type TestBuddy = Buddy<LEAF, Global>;

/// Returns the offset of `block` from the start of the arena.
fn offset_of<A: crate::BackingAllocator>(buddy: &Buddy<LEAF, A>, block: NonNull<[u8]>) -> usize {
    let base = buddy.arena().cast::<u8>().as_ptr().addr();
    block.cast::<u8>().as_ptr().addr() - base
}

/// Asserts that every leaf of the real arena is owned by exactly one class.
fn assert_unique_ownership<A: crate::BackingAllocator>(buddy: &Buddy<LEAF, A>) {
    for ofs in (0..buddy.arena().len()).step_by(LEAF) {
        assert_eq!(
            buddy.owning_classes(ofs),
            1,
            "leaf at {ofs:#x} is not owned by exactly one class"
        );
    }
}

/// Leaf-sized, leaf-aligned storage for raw regions.
#[repr(C, align(16))]
#[derive(Copy, Clone)]
struct Leaf([u8; LEAF]);

fn leaves(n: usize) -> Vec<Leaf> {
    std::vec![Leaf([0; LEAF]); n]
}

/// Returns the `listed` count of every class.
fn listed(stats: &Stats) -> Vec<usize> {
    stats.classes().iter().map(|c| c.listed).collect()
}

// Scenarios ===================================================================

#[test]
fn mixed_sizes_round_up_and_release_in_any_order() {
    let buddy = TestBuddy::try_new(64 * 1024).unwrap();
    let initial = buddy.stats();

    let orders: [[usize; 4]; 4] = [[0, 1, 2, 3], [3, 2, 1, 0], [2, 0, 3, 1], [1, 3, 0, 2]];

    for order in orders {
        let blocks: Vec<_> = [100, 900, 1000, 1000]
            .into_iter()
            .map(|n| buddy.allocate(n).unwrap())
            .collect();

        let lens: Vec<_> = blocks.iter().map(|b| b.len()).collect();
        assert_eq!(lens, [128, 1024, 1024, 1024]);
        assert_unique_ownership(&buddy);

        for i in order {
            unsafe { buddy.release(blocks[i].cast()) };
            assert_unique_ownership(&buddy);
        }

        assert_eq!(buddy.stats(), initial);
    }
}

#[test]
fn lone_buddy_stays_unmerged() {
    let buddy = TestBuddy::try_new_with_external_metadata(256).unwrap();
    let initial = buddy.stats();
    assert_eq!(listed(&initial), [0, 0, 0, 0, 1]);

    let a = buddy.allocate(LEAF).unwrap();
    let b = buddy.allocate(LEAF).unwrap();
    assert_eq!(offset_of(&buddy, a), 0);
    assert_eq!(offset_of(&buddy, b), LEAF);

    // Splitting the top block left one free half behind at every class.
    assert_eq!(listed(&buddy.stats()), [0, 1, 1, 1, 0]);

    unsafe { buddy.release(a.cast()) };
    assert_eq!(listed(&buddy.stats()), [1, 1, 1, 1, 0]);
    assert_unique_ownership(&buddy);

    unsafe { buddy.release(b.cast()) };
    assert_eq!(buddy.stats(), initial);
}

#[test]
fn buddies_merge_in_either_order() {
    let buddy = TestBuddy::try_new_with_external_metadata(256).unwrap();
    let initial = buddy.stats();

    for reverse in [false, true] {
        let a = buddy.allocate(LEAF).unwrap();
        let b = buddy.allocate(LEAF).unwrap();

        let (first, second) = if reverse { (b, a) } else { (a, b) };

        unsafe {
            buddy.release(first.cast());
            buddy.release(second.cast());
        }

        assert_eq!(buddy.stats(), initial);

        // The whole arena is a single block again.
        let whole = buddy.allocate(256).unwrap();
        unsafe { buddy.release(whole.cast()) };
    }
}

#[test]
fn merge_cascade_stops_below_an_allocated_buddy() {
    let buddy = TestBuddy::try_new_with_external_metadata(256).unwrap();
    let initial = buddy.stats();

    let a = buddy.allocate(LEAF).unwrap();
    let b = buddy.allocate(LEAF).unwrap();
    let c = buddy.allocate(64).unwrap();
    assert_eq!(offset_of(&buddy, c), 64);

    unsafe {
        buddy.release(a.cast());
        buddy.release(b.cast());
    }

    // `a` and `b` merged up to 64 bytes, where `c` blocks further merging.
    assert_eq!(listed(&buddy.stats()), [0, 0, 1, 1, 0]);
    assert_unique_ownership(&buddy);

    unsafe { buddy.release(c.cast()) };
    assert_eq!(buddy.stats(), initial);
}

#[test]
fn top_class_block_is_granted_exactly_once() {
    let buddy = TestBuddy::try_new_with_external_metadata(256).unwrap();
    let initial = buddy.stats();
    let top = buddy.geometry().max_class();

    assert_eq!(buddy.allocate(257), Err(AllocError::CapacityExceeded));
    assert_eq!(buddy.allocate(0), Err(AllocError::ZeroSize));

    let whole = buddy.allocate(256).unwrap();
    assert_eq!(whole.len(), 256);
    assert_eq!(buddy.allocate(256), Err(AllocError::Exhausted));
    assert_eq!(buddy.allocate(1), Err(AllocError::Exhausted));
    assert_unique_ownership(&buddy);

    // No ancestor is split, so the block is recognized as the top block.
    assert_eq!(buddy.class_of(0), top);

    unsafe { buddy.release(whole.cast()) };
    assert_eq!(buddy.stats(), initial);

    let again = buddy.allocate(256).unwrap();
    unsafe { buddy.release(again.cast()) };
}

#[test]
fn self_hosted_metadata_is_reserved() {
    let buddy = TestBuddy::try_new(4096).unwrap();
    let reserved = buddy.reserved_bytes();

    assert!(reserved > 0);
    assert_eq!(reserved % LEAF, 0);
    assert_eq!(buddy.free_bytes(), 4096 - reserved);

    // The metadata occupies part of every class's first block.
    assert_eq!(buddy.allocate(4096), Err(AllocError::Exhausted));

    let mut blocks = Vec::new();
    while let Ok(block) = buddy.allocate(LEAF) {
        assert!(offset_of(&buddy, block) >= reserved);
        blocks.push(block);
    }
    assert_eq!(blocks.len() * LEAF, 4096 - reserved);

    for block in blocks {
        unsafe { buddy.release(block.cast()) };
    }
    assert_eq!(buddy.free_bytes(), 4096 - reserved);
}

#[test]
fn tail_padding_is_never_handed_out() {
    let len = 1000 * LEAF;
    let buddy = TestBuddy::try_new(len).unwrap();
    let initial = buddy.stats();

    assert_eq!(buddy.geometry().arena_size(), 1024 * LEAF);
    assert_eq!(buddy.free_bytes(), len - buddy.reserved_bytes());

    let mut blocks = Vec::new();
    while let Ok(block) = buddy.allocate(LEAF) {
        assert!(offset_of(&buddy, block) + block.len() <= len);
        blocks.push(block);
    }
    assert_eq!(blocks.len() * LEAF, len - buddy.reserved_bytes());
    assert_unique_ownership(&buddy);

    for block in blocks.into_iter().rev() {
        unsafe { buddy.release(block.cast()) };
    }
    assert_eq!(buddy.stats(), initial);
}

#[test]
fn bootstrap_accounts_for_every_byte() {
    for len in [512, 1000, 1024, 4097, 12345, 65536 + LEAF, 100_000] {
        for external in [false, true] {
            let buddy = if external {
                TestBuddy::try_new_with_external_metadata(len)
            } else {
                TestBuddy::try_new(len)
            }
            .unwrap();

            let real_len = len / LEAF * LEAF;
            assert_eq!(buddy.arena().len(), real_len);
            assert_eq!(buddy.free_bytes(), real_len - buddy.reserved_bytes());
            assert_eq!(buddy.stats().listed_bytes(), buddy.free_bytes());
            assert_eq!(buddy.reserved_bytes() == 0, external, "len {len}");
            assert!(buddy.geometry().arena_size() >= real_len);
            assert!(buddy.geometry().arena_size() / 2 < real_len);

            assert_unique_ownership(&buddy);
        }
    }
}

#[test]
fn stats_count_each_block_once() {
    let buddy = TestBuddy::try_new(8192).unwrap();
    let _a = buddy.allocate(300).unwrap();
    let _b = buddy.allocate(LEAF).unwrap();

    for class in buddy.stats().classes() {
        assert_eq!(
            class.allocated + class.split + class.free,
            class.num_blocks
        );
        assert!(class.listed <= class.free);
    }
}

#[test]
fn stats_display_has_a_line_per_class() {
    let buddy = TestBuddy::try_new(4096).unwrap();
    let text = std::format!("{}", buddy.stats());

    assert_eq!(text.lines().count(), buddy.geometry().num_classes());
    assert!(text.starts_with("class  0"));
}

// Construction ================================================================

#[test]
fn undersized_regions_are_rejected() {
    assert_eq!(TestBuddy::try_new(0).unwrap_err(), AllocInitError::InvalidConfig);
    assert!(matches!(
        TestBuddy::try_new(LEAF).unwrap_err(),
        AllocInitError::MetadataTooLarge { available: LEAF, .. }
    ));

    // A single leaf is a valid arena when the metadata lives elsewhere.
    let one = TestBuddy::try_new_with_external_metadata(LEAF).unwrap();
    let block = one.allocate(1).unwrap();
    assert_eq!(one.allocate(1), Err(AllocError::Exhausted));
    unsafe { one.release(block.cast()) };
}

#[test]
fn external_metadata_must_fit_and_be_aligned() {
    let len = 4096;
    let layout = Buddy::<LEAF, Raw>::metadata_layout(len).unwrap();

    let mut region = leaves(len / LEAF);
    let mut meta = leaves(layout.size() / LEAF + 2);

    let region_ptr = NonNull::new(region.as_mut_ptr().cast::<u8>()).unwrap();
    let meta_ptr = NonNull::new(meta.as_mut_ptr().cast::<u8>()).unwrap();

    let too_small = unsafe {
        Buddy::<LEAF, Raw>::new_raw_with_metadata(meta_ptr, layout.size() - 1, region_ptr, len)
    };
    assert!(matches!(
        too_small.unwrap_err(),
        AllocInitError::MetadataTooLarge { .. }
    ));

    let misaligned_ptr = NonNull::new(unsafe { meta_ptr.as_ptr().add(1) }).unwrap();
    let misaligned = unsafe {
        Buddy::<LEAF, Raw>::new_raw_with_metadata(misaligned_ptr, layout.size(), region_ptr, len)
    };
    assert_eq!(misaligned.unwrap_err(), AllocInitError::MisalignedMetadata);

    let buddy = unsafe {
        Buddy::<LEAF, Raw>::new_raw_with_metadata(meta_ptr, layout.size(), region_ptr, len)
    }
    .unwrap();
    assert_eq!(buddy.free_bytes(), len);

    let whole = buddy.allocate(len).unwrap();
    unsafe { buddy.release(whole.cast()) };

    let (r, m) = buddy.into_raw_parts();
    assert_eq!(r, region_ptr);
    assert_eq!(m, Some(meta_ptr));
}

#[test]
fn raw_region_is_rounded_to_leaf_alignment() {
    let len = 4096;
    let mut storage = leaves(len / LEAF + 1);

    // Three bytes past a 16-byte boundary.
    let region = NonNull::new(unsafe { storage.as_mut_ptr().cast::<u8>().add(3) }).unwrap();
    let buddy = unsafe { Buddy::<LEAF, Raw>::new_raw(region, len) }.unwrap();

    let arena = buddy.arena();
    assert_eq!(arena.cast::<u8>().as_ptr().addr() % LEAF, 0);
    assert_eq!(arena.len(), (len - 13) / LEAF * LEAF);

    let block = buddy.allocate(200).unwrap();
    unsafe {
        slice::from_raw_parts_mut(block.cast::<u8>().as_ptr(), block.len()).fill(0xAA);
        buddy.release(block.cast());
    }

    let (r, m) = buddy.into_raw_parts();
    assert_eq!(r, region);
    assert_eq!(m, None);
}

// Contract violations =========================================================

#[test]
#[should_panic(expected = "not leaf-aligned")]
fn releasing_a_misaligned_pointer_panics() {
    let buddy = TestBuddy::try_new(4096).unwrap();
    let block = buddy.allocate(64).unwrap();

    let inner = NonNull::new(unsafe { block.cast::<u8>().as_ptr().add(8) }).unwrap();
    unsafe { buddy.release(inner) };
}

#[test]
#[should_panic(expected = "not an allocated block")]
fn releasing_twice_panics() {
    let buddy = TestBuddy::try_new(4096).unwrap();
    let a = buddy.allocate(LEAF).unwrap();
    let _b = buddy.allocate(LEAF).unwrap();

    unsafe {
        buddy.release(a.cast());
        buddy.release(a.cast());
    }
}

#[test]
#[should_panic(expected = "not an allocated block")]
fn releasing_the_interior_of_a_block_panics() {
    let buddy = TestBuddy::try_new(4096).unwrap();
    let block = buddy.allocate(64).unwrap();

    let inner = NonNull::new(unsafe { block.cast::<u8>().as_ptr().add(LEAF) }).unwrap();
    unsafe { buddy.release(inner) };
}

#[test]
#[should_panic(expected = "was not allocated from this arena")]
fn releasing_a_foreign_pointer_panics() {
    let buddy = TestBuddy::try_new(4096).unwrap();
    let mut elsewhere = 0u128;

    unsafe { buddy.release(NonNull::from(&mut elsewhere).cast()) };
}

#[test]
#[should_panic(expected = "was not allocated from this arena")]
fn releasing_metadata_panics() {
    let buddy = TestBuddy::try_new(4096).unwrap();

    unsafe { buddy.release(buddy.arena().cast()) };
}

// Concurrency =================================================================

#[test]
fn threads_share_one_allocator() {
    const THREADS: u8 = 4;
    const ROUNDS: usize = 200;

    let buddy = TestBuddy::try_new(256 * 1024).unwrap();
    let initial = buddy.stats();

    thread::scope(|s| {
        for id in 0..THREADS {
            let buddy = &buddy;

            s.spawn(move || {
                let mut held = Vec::new();

                for round in 0..ROUNDS {
                    let size = 1 + (round * 37 + usize::from(id) * 101) % 2048;

                    if let Ok(block) = buddy.allocate(size) {
                        let bytes = unsafe {
                            slice::from_raw_parts_mut(block.cast::<u8>().as_ptr(), block.len())
                        };
                        bytes.fill(id);
                        held.push(block);
                    }

                    if round % 3 == 2 {
                        if let Some(block) = held.pop() {
                            let bytes = unsafe {
                                slice::from_raw_parts(block.cast::<u8>().as_ptr(), block.len())
                            };
                            assert!(bytes.iter().all(|&b| b == id), "block overwritten");
                            unsafe { buddy.release(block.cast()) };
                        }
                    }
                }

                for block in held {
                    unsafe { buddy.release(block.cast()) };
                }
            });
        }
    });

    assert_eq!(buddy.stats(), initial);
}

// Properties ==================================================================

#[derive(Clone, Debug)]
struct ArenaParams {
    len: usize,
    external: bool,
}

impl Arbitrary for ArenaParams {
    fn arbitrary(g: &mut Gen) -> Self {
        ArenaParams {
            len: 1024 + usize::arbitrary(g) % (16 * 1024),
            external: bool::arbitrary(g),
        }
    }
}

impl ArenaParams {
    fn build(&self) -> Result<TestBuddy, AllocInitError> {
        if self.external {
            TestBuddy::try_new_with_external_metadata(self.len)
        } else {
            TestBuddy::try_new(self.len)
        }
    }
}

#[derive(Clone, Debug)]
enum AllocatorOp {
    /// Allocate a block of at least `size` bytes.
    Allocate { size: usize },
    /// Release an outstanding allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to release is at
    /// index `index % n`.
    Release { index: usize },
}

/// Limit on allocation size, expressed in bits.
const ALLOC_LIMIT_BITS: u8 = 15;

fn limited_size(g: &mut Gen) -> usize {
    let exp = u8::arbitrary(g) % (ALLOC_LIMIT_BITS + 1);
    usize::arbitrary(g) % 2_usize.pow(exp.into())
}

impl Arbitrary for AllocatorOp {
    fn arbitrary(g: &mut Gen) -> Self {
        if bool::arbitrary(g) {
            AllocatorOp::Allocate {
                size: limited_size(g),
            }
        } else {
            AllocatorOp::Release {
                index: usize::arbitrary(g),
            }
        }
    }
}

type OpId = u32;

struct Allocation {
    op_id: OpId,
    block: NonNull<[u8]>,
}

impl Allocation {
    fn paint(&self) {
        let paint = self.op_id.to_le_bytes();
        let bytes = unsafe {
            slice::from_raw_parts_mut(self.block.cast::<u8>().as_ptr(), self.block.len())
        };

        for (byte, value) in bytes.iter_mut().zip(paint.iter().cycle()) {
            *byte = *value;
        }
    }

    fn verify(&self) -> bool {
        let paint = self.op_id.to_le_bytes();
        let bytes =
            unsafe { slice::from_raw_parts(self.block.cast::<u8>().as_ptr(), self.block.len()) };

        bytes
            .iter()
            .zip(paint.iter().cycle())
            .all(|(byte, value)| byte == value)
    }
}

trait Prop {
    /// Examines the result of an allocation.
    fn post_allocate(
        buddy: &TestBuddy,
        size: usize,
        res: &Result<NonNull<[u8]>, AllocError>,
    ) -> bool {
        let arena_size = buddy.geometry().arena_size();

        match res {
            Ok(block) => block.len() >= size && block.len().is_power_of_two(),
            Err(AllocError::ZeroSize) => size == 0,
            Err(AllocError::CapacityExceeded) => size > arena_size,
            Err(AllocError::Exhausted) => size > 0 && size <= arena_size,
        }
    }

    fn on_allocate(allocation: &Allocation) {
        let _ = allocation;
    }

    fn pre_release(allocation: &Allocation) -> bool {
        let _ = allocation;
        true
    }

    fn after_op(buddy: &TestBuddy) -> bool {
        let _ = buddy;
        true
    }
}

struct AllocatorChecker {
    buddy: TestBuddy,
    initial: Stats,
    allocations: Vec<Allocation>,
    num_ops: OpId,
}

impl AllocatorChecker {
    fn new(params: &ArenaParams) -> Result<Self, AllocInitError> {
        let buddy = params.build()?;
        let initial = buddy.stats();

        Ok(AllocatorChecker {
            buddy,
            initial,
            allocations: Vec::new(),
            num_ops: 0,
        })
    }

    fn do_op<P: Prop>(&mut self, op: AllocatorOp) -> bool {
        let op_id = self.num_ops;
        self.num_ops += 1;

        match op {
            AllocatorOp::Allocate { size } => {
                let res = self.buddy.allocate(size);

                if !P::post_allocate(&self.buddy, size, &res) {
                    return false;
                }

                if let Ok(block) = res {
                    let allocation = Allocation { op_id, block };
                    P::on_allocate(&allocation);
                    self.allocations.push(allocation);
                }
            }

            AllocatorOp::Release { index } => {
                if self.allocations.is_empty() {
                    return true;
                }

                let index = index % self.allocations.len();
                let a = self.allocations.swap_remove(index);

                if !P::pre_release(&a) {
                    return false;
                }

                unsafe { self.buddy.release(a.block.cast()) };
            }
        }

        P::after_op(&self.buddy)
    }

    /// Runs `ops`, then releases everything still outstanding and checks that
    /// the allocator is back in its initial state.
    fn run<P: Prop>(&mut self, ops: Vec<AllocatorOp>) -> bool {
        if !ops.into_iter().all(|op| self.do_op::<P>(op)) {
            return false;
        }

        for a in mem::take(&mut self.allocations) {
            if !P::pre_release(&a) {
                return false;
            }

            unsafe { self.buddy.release(a.block.cast()) };
        }

        self.buddy.stats() == self.initial
    }
}

fn check<P: Prop>(params: ArenaParams, ops: Vec<AllocatorOp>) -> bool {
    let mut checker = AllocatorChecker::new(&params).unwrap();
    checker.run::<P>(ops)
}

// Miri is substantially slower to run property tests, so the number of test
// cases is reduced to keep the runtime in check.

#[cfg(not(miri))]
const MAX_TESTS: u64 = 100;

#[cfg(miri)]
const MAX_TESTS: u64 = 10;

/// Every allocation is painted with the ID of the operation that made it, and
/// must still hold that paint when released.
struct MutuallyExclusive;

impl Prop for MutuallyExclusive {
    fn on_allocate(allocation: &Allocation) {
        allocation.paint();
    }

    fn pre_release(allocation: &Allocation) -> bool {
        allocation.verify()
    }
}

/// Every leaf of the arena is owned by exactly one size class after every
/// operation.
struct UniqueOwnership;

impl Prop for UniqueOwnership {
    fn after_op(buddy: &TestBuddy) -> bool {
        (0..buddy.arena().len())
            .step_by(LEAF)
            .all(|ofs| buddy.owning_classes(ofs) == 1)
    }
}

/// Only the baseline checks: results are consistent with the request, and
/// releasing everything restores the initial class occupancy.
struct RoundTrip;

impl Prop for RoundTrip {}

#[test]
fn allocations_are_mutually_exclusive() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<MutuallyExclusive> as fn(_, _) -> bool);
}

#[test]
fn every_leaf_has_exactly_one_owner() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<UniqueOwnership> as fn(_, _) -> bool);
}

#[test]
fn releasing_everything_restores_initial_state() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<RoundTrip> as fn(_, _) -> bool);
}

// Version sync ================================================================
#[test]
fn html_root_url() {
    version_sync::assert_html_root_url_updated!("src/lib.rs");
}
