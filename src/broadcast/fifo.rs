use std::collections::BTreeSet;

use rustc_hash::FxHashMap;

/// Per-origin re-sequencing of URB-delivered messages: each origin's seqs
/// leave in order 1, 2, 3, ... regardless of the order the majority rule
/// released them in. Pure state, no I/O.
#[derive(Default)]
pub struct FifoResequencer {
    /// next seq to let through, per origin; origins start at 1
    next_seq: FxHashMap<u32, u32>,
    /// URB-delivered seqs still waiting for a predecessor, per origin
    parked: FxHashMap<u32, BTreeSet<u32>>,
}

impl FifoResequencer {
    pub fn new() -> FifoResequencer {
        FifoResequencer::default()
    }

    /// Accepts one URB-delivered `(origin, seq)` and returns the seqs that
    /// are now deliverable for that origin, in order. Empty if `seq` is still
    /// waiting for a predecessor.
    pub fn push(&mut self, origin: u32, seq: u32) -> Vec<u32> {
        let next = self.next_seq.entry(origin).or_insert(1);

        if seq != *next {
            self.parked.entry(origin).or_default().insert(seq);
            return Vec::new();
        }

        let mut deliverable = vec![seq];
        *next += 1;

        if let Some(parked) = self.parked.get_mut(&origin) {
            while parked.first() == Some(&*next) {
                deliverable.push(parked.pop_first().expect("checked non-empty"));
                *next += 1;
            }
        }
        deliverable
    }
}
