#![no_main]

use alloc_hater::{AllocatorOp, Evaluator};
use arbitrary::Arbitrary;
use buddy_arena_hater::BuddySubject;
use libfuzzer_sys::fuzz_target;

const LEAF_SIZE: usize = 64;
const MAX_LEN: usize = 1 << 22;

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    len: usize,
    ops: Vec<AllocatorOp>,
}

fuzz_target!(|args: Args| {
    let subject = match BuddySubject::<LEAF_SIZE>::new_with_external_metadata(args.len % MAX_LEN)
    {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut eval = Evaluator::new(subject);
    eval.evaluate(args.ops).unwrap();
});
