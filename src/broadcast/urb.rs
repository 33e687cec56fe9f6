use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

/// Uniform reliable broadcast bookkeeping, pure state without any I/O. The
/// owning app is expected to hold one lock around every call so that the
/// forward / ack-in / majority-check transition stays atomic, and to do the
/// actual network sends after releasing it.
pub struct UrbState {
    self_id: u32,
    majority: usize,
    /// messages this process has already relayed (or originated)
    forwarded: FxHashSet<(u32, u32)>,
    /// processes known to have seen a message. An entry is dropped as soon
    /// as the message is URB-delivered, the set has done its job then
    ack_set: FxHashMap<(u32, u32), FxHashSet<u32>>,
    urb_delivered: FxHashSet<(u32, u32)>,
}

impl UrbState {
    pub fn new(self_id: u32, majority: usize) -> UrbState {
        UrbState {
            self_id,
            majority,
            forwarded: FxHashSet::default(),
            ack_set: FxHashMap::default(),
            urb_delivered: FxHashSet::default(),
        }
    }

    /// Books a broadcast of this process' own `seq`: marks it forwarded and
    /// seen by self. The caller sends the DATA to every peer afterwards and
    /// only then runs [`try_urb_deliver`](UrbState::try_urb_deliver), which
    /// matters for nothing but is the order the protocol prescribes.
    pub fn note_local_broadcast(&mut self, seq: u32) {
        let msg = (self.self_id, seq);
        self.forwarded.insert(msg);
        self.ack_set.entry(msg).or_default().insert(self.self_id);
    }

    /// Books one receipt of `(origin, seq)` from transport peer `from` and
    /// returns whether the message still needs relaying. Both the relayer
    /// and the origin have evidently seen the message; this process has too
    /// once it relays.
    pub fn note_receipt(&mut self, origin: u32, seq: u32, from: u32) -> bool {
        let msg = (origin, seq);

        if !self.urb_delivered.contains(&msg) {
            let acks = self.ack_set.entry(msg).or_default();
            acks.insert(from);
            acks.insert(origin);
        }

        if self.forwarded.insert(msg) {
            if !self.urb_delivered.contains(&msg) {
                self.ack_set.entry(msg).or_default().insert(self.self_id);
            }
            trace!("first receipt of {:?} - relaying", msg);
            true
        } else {
            false
        }
    }

    /// True exactly once per message: when the ack set first reaches a
    /// majority of the membership.
    pub fn try_urb_deliver(&mut self, origin: u32, seq: u32) -> bool {
        let msg = (origin, seq);
        if self.urb_delivered.contains(&msg) {
            return false;
        }

        let num_acks = self.ack_set.get(&msg).map(|acks| acks.len()).unwrap_or(0);
        if num_acks < self.majority {
            return false;
        }

        self.urb_delivered.insert(msg);
        self.ack_set.remove(&msg);
        trace!("{:?} seen by {} processes - urb-delivering", msg, num_acks);
        true
    }
}
