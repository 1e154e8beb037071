#![no_main]

use std::{alloc::Layout, ptr::NonNull};

use arbitrary::{Arbitrary, Unstructured};
use buddy_arena::{Buddy, Raw};
use libfuzzer_sys::fuzz_target;

const LEAF_SIZE: usize = 32;
const MAX_LEN: usize = 1 << 16;

// Drives the allocator over a caller-owned region whose start is deliberately
// misaligned, then checks the region is returned intact.
#[derive(Clone, Debug)]
struct Region {
    skew: usize,
    len: usize,
}

impl Arbitrary<'_> for Region {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Region> {
        let skew = usize::from(u8::arbitrary(un)?) % LEAF_SIZE;
        let len = usize::arbitrary(un)? % MAX_LEN;

        Ok(Region { skew, len })
    }
}

#[derive(Clone, Debug, Arbitrary)]
enum BuddyOp {
    Allocate(u16),
    Release(usize),
}

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    region: Region,
    ops: Vec<BuddyOp>,
}

fuzz_target!(|args: Args| {
    let Region { skew, len } = args.region;
    let layout = Layout::from_size_align(skew + len + 1, LEAF_SIZE).unwrap();

    let storage = match NonNull::new(unsafe { std::alloc::alloc(layout) }) {
        Some(p) => p,
        None => return,
    };
    let region = NonNull::new(unsafe { storage.as_ptr().add(skew) }).unwrap();

    let alloc = match unsafe { Buddy::<LEAF_SIZE, Raw>::new_raw(region, len) } {
        Ok(a) => a,
        Err(_) => {
            unsafe { std::alloc::dealloc(storage.as_ptr(), layout) };
            return;
        }
    };

    let mut outstanding = Vec::new();

    for op in args.ops {
        match op {
            BuddyOp::Allocate(nbytes) => {
                let nbytes = usize::from(nbytes);
                if let Ok(block) = alloc.allocate(nbytes) {
                    assert!(block.len() >= nbytes);
                    outstanding.push(block);
                }
            }

            BuddyOp::Release(raw_idx) => {
                if outstanding.is_empty() {
                    continue;
                }

                let idx = raw_idx % outstanding.len();
                let block = outstanding.swap_remove(idx);
                unsafe { alloc.release(block.cast()) };
            }
        }
    }

    for block in outstanding {
        unsafe { alloc.release(block.cast()) };
    }

    let free = alloc.free_bytes();
    assert_eq!(free, alloc.arena().len() - alloc.reserved_bytes());

    let (returned, metadata) = alloc.into_raw_parts();
    assert_eq!(returned, region);
    assert!(metadata.is_none());

    unsafe { std::alloc::dealloc(storage.as_ptr(), layout) };
});
