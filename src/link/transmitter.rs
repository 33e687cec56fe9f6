use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

use crate::link::packet::{Packet, MAX_SEQS_PER_PACKET};
use crate::link::socket::SendSocket;

/// Interval after which an unacknowledged seq is sent again.
pub const RETRANSMIT_TIMEOUT: Duration = Duration::from_millis(80);

/// Every this many fruitless retransmissions of a seq, a diagnostic is
/// emitted. Purely observability, the transmitter never gives up.
const STALL_REPORT_EVERY: u32 = 64;

struct UnackedEntry {
    origin: u32,
    last_sent: Instant,
    retries: u32,
}

struct TransmitterInner {
    /// seqs waiting for their first transmission, in enqueue order
    pending: VecDeque<(u32, u32)>,
    /// sent but not yet acknowledged, keyed by seq. ACKs carry no origin, so
    /// relay traffic can put several origins' entries under the same seq;
    /// each ACK instance then settles the oldest one (see [`Transmitter::on_ack`])
    unacked: FxHashMap<u32, Vec<UnackedEntry>>,
    num_unacked: usize,
    /// retransmit schedule: (deadline, seq, origin). Entries are never
    /// removed eagerly, stale ones are filtered when they surface
    timeouts: BinaryHeap<Reverse<(Instant, u32, u32)>>,
}

impl TransmitterInner {
    /// Claims the next run of same-origin pending seqs as one DATA batch and
    /// books them as in flight.
    fn take_next_batch(&mut self, now: Instant) -> Option<(u32, Vec<u32>)> {
        let &(origin, _) = self.pending.front()?;

        let mut seqs = Vec::new();
        while seqs.len() < MAX_SEQS_PER_PACKET {
            let Some(&(o, seq)) = self.pending.front() else {
                break;
            };
            if o != origin {
                break;
            }
            self.pending.pop_front();

            self.unacked.entry(seq).or_default().push(UnackedEntry {
                origin,
                last_sent: now,
                retries: 0,
            });
            self.num_unacked += 1;
            self.timeouts.push(Reverse((now + RETRANSMIT_TIMEOUT, seq, origin)));
            seqs.push(seq);
        }
        Some((origin, seqs))
    }

    /// Pops all due timeout entries, books the retransmissions and returns
    /// them grouped into single-origin batches, together with the next
    /// deadline the retransmit loop should sleep until.
    fn collect_due_retransmits(&mut self, now: Instant) -> (Vec<(u32, Vec<u32>)>, Option<Instant>) {
        let mut due: Vec<(u32, u32)> = Vec::new();

        while let Some(&Reverse((deadline, seq, origin))) = self.timeouts.peek() {
            if deadline > now {
                break;
            }
            self.timeouts.pop();

            let Some(entries) = self.unacked.get_mut(&seq) else {
                // acknowledged in the meantime, the heap entry is a tombstone
                continue;
            };
            let Some(entry) = entries.iter_mut().find(|e| e.origin == origin) else {
                continue;
            };
            if entry.last_sent + RETRANSMIT_TIMEOUT > now {
                // re-sent since this heap entry was pushed, a fresher entry exists
                continue;
            }

            entry.last_sent = now;
            entry.retries += 1;
            if entry.retries % STALL_REPORT_EVERY == 0 {
                debug!("seq {} of origin {} re-sent {} times without an ack", seq, origin, entry.retries);
            }
            self.timeouts.push(Reverse((now + RETRANSMIT_TIMEOUT, seq, origin)));
            due.push((origin, seq));
        }

        let mut batches: Vec<(u32, Vec<u32>)> = Vec::new();
        for (origin, seq) in due {
            match batches.last_mut() {
                Some((o, seqs)) if *o == origin && seqs.len() < MAX_SEQS_PER_PACKET => seqs.push(seq),
                _ => batches.push((origin, vec![seq])),
            }
        }

        let next_deadline = self.timeouts.peek().map(|&Reverse((d, _, _))| d);
        (batches, next_deadline)
    }

    fn all_acked(&self) -> bool {
        self.pending.is_empty() && self.num_unacked == 0
    }
}

/// The sending half of a perfect link, one instance per destination.
///
/// [`enqueue`](Transmitter::enqueue) guarantees that the destination observes
/// the seq at least once unless both ends fail permanently. Two background
/// tasks do the work: a *sender* that drains the pending queue into DATA
/// batches when signalled, and a *retransmitter* that sleeps until the
/// earliest timeout deadline and re-sends whatever is still unacknowledged.
/// ACK ingestion happens on the caller's receive loop via
/// [`on_ack`](Transmitter::on_ack).
pub struct Transmitter {
    peer_addr: SocketAddr,
    socket: Arc<dyn SendSocket>,
    inner: Arc<Mutex<TransmitterInner>>,
    sender_notify: Arc<Notify>,
    retransmit_notify: Arc<Notify>,
    completion_notify: Arc<Notify>,
    shut_down_flag: Arc<AtomicBool>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Transmitter {
    pub fn new(peer_addr: SocketAddr, socket: Arc<dyn SendSocket>) -> Transmitter {
        Transmitter {
            peer_addr,
            socket,
            inner: Arc::new(Mutex::new(TransmitterInner {
                pending: VecDeque::new(),
                unacked: FxHashMap::default(),
                num_unacked: 0,
                timeouts: BinaryHeap::new(),
            })),
            sender_notify: Arc::new(Notify::new()),
            retransmit_notify: Arc::new(Notify::new()),
            completion_notify: Arc::new(Notify::new()),
            shut_down_flag: Arc::new(AtomicBool::new(false)),
            task_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn spawn_active_loops(&self) {
        let mut handles = self.task_handles.lock().expect("transmitter handle lock poisoned");
        if !handles.is_empty() {
            warn!("active loops already spawned");
            return;
        }

        handles.push(tokio::spawn(Self::run_sender_loop(
            self.peer_addr,
            self.socket.clone(),
            self.inner.clone(),
            self.sender_notify.clone(),
            self.retransmit_notify.clone(),
            self.shut_down_flag.clone(),
        )));
        handles.push(tokio::spawn(Self::run_retransmit_loop(
            self.peer_addr,
            self.socket.clone(),
            self.inner.clone(),
            self.retransmit_notify.clone(),
            self.shut_down_flag.clone(),
        )));
    }

    /// Queues a seq for (re)transmission until acknowledged. `origin` is the
    /// process that first broadcast the seq, kept verbatim for relay traffic.
    pub fn enqueue(&self, origin: u32, seq: u32) {
        self.inner.lock().expect("transmitter lock poisoned")
            .pending.push_back((origin, seq));
        self.sender_notify.notify_one();
    }

    /// Settles acknowledged seqs. Every ACK instance settles at most one
    /// in-flight entry per seq, oldest first: with relay traffic two origins
    /// can have the same seq in flight, and the peer re-acknowledges every
    /// DATA receipt, so a transiently mis-paired ACK is corrected by the
    /// retransmission of whichever entry was left behind.
    pub fn on_ack(&self, seqs: &[u32]) {
        let all_acked = {
            let mut guard = self.inner.lock().expect("transmitter lock poisoned");
            let inner = &mut *guard;
            for &seq in seqs {
                if let Some(entries) = inner.unacked.get_mut(&seq) {
                    entries.remove(0);
                    inner.num_unacked -= 1;
                    if entries.is_empty() {
                        inner.unacked.remove(&seq);
                    }
                } else {
                    trace!("ACK for seq {} with nothing in flight - ignoring", seq);
                }
            }
            inner.all_acked()
        };

        self.retransmit_notify.notify_one();
        if all_acked {
            self.completion_notify.notify_waiters();
        }
    }

    /// True once nothing is pending and nothing is in flight.
    pub fn all_acked(&self) -> bool {
        self.inner.lock().expect("transmitter lock poisoned")
            .all_acked()
    }

    pub async fn wait_all_acked(&self) {
        loop {
            let notified = self.completion_notify.notified();
            if self.all_acked() {
                return;
            }
            notified.await;
        }
    }

    pub async fn shut_down(&self) {
        self.shut_down_flag.store(true, Ordering::Relaxed);
        self.sender_notify.notify_one();
        self.retransmit_notify.notify_one();

        let handles = std::mem::take(
            &mut *self.task_handles.lock().expect("transmitter handle lock poisoned"),
        );
        for handle in handles {
            handle.await.ok();
        }
    }

    async fn run_sender_loop(
        peer_addr: SocketAddr,
        socket: Arc<dyn SendSocket>,
        inner: Arc<Mutex<TransmitterInner>>,
        sender_notify: Arc<Notify>,
        retransmit_notify: Arc<Notify>,
        shut_down: Arc<AtomicBool>,
    ) {
        loop {
            let notified = sender_notify.notified();
            if shut_down.load(Ordering::Relaxed) {
                break;
            }

            loop {
                let batch = inner.lock().expect("transmitter lock poisoned")
                    .take_next_batch(Instant::now());
                let Some((origin, seqs)) = batch else {
                    break;
                };

                trace!("sending DATA batch to {:?}: origin {} seqs {:?}", peer_addr, origin, seqs);
                let mut buf = BytesMut::new();
                Packet::Data { origin, seqs }.ser(&mut buf);
                socket.send_packet(peer_addr, &buf).await;

                // the retransmit loop may be in a deadline-less wait
                retransmit_notify.notify_one();
            }

            notified.await;
        }
        debug!("sender loop for {:?} shut down", peer_addr);
    }

    async fn run_retransmit_loop(
        peer_addr: SocketAddr,
        socket: Arc<dyn SendSocket>,
        inner: Arc<Mutex<TransmitterInner>>,
        retransmit_notify: Arc<Notify>,
        shut_down: Arc<AtomicBool>,
    ) {
        loop {
            let notified = retransmit_notify.notified();
            if shut_down.load(Ordering::Relaxed) {
                break;
            }

            let (batches, next_deadline) = inner.lock().expect("transmitter lock poisoned")
                .collect_due_retransmits(Instant::now());

            for (origin, seqs) in batches {
                debug!("retransmitting to {:?}: origin {} seqs {:?}", peer_addr, origin, seqs);
                let mut buf = BytesMut::new();
                Packet::Data { origin, seqs }.ser(&mut buf);
                socket.send_packet(peer_addr, &buf).await;
            }

            match next_deadline {
                Some(deadline) => {
                    select! {
                        _ = sleep_until(deadline) => {}
                        _ = notified => {}
                    }
                }
                None => notified.await,
            }
        }
        debug!("retransmit loop for {:?} shut down", peer_addr);
    }
}

impl Drop for Transmitter {
    fn drop(&mut self) {
        for handle in self.task_handles.lock().expect("transmitter handle lock poisoned").drain(..) {
            handle.abort();
        }
    }
}
