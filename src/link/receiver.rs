use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, trace, warn};

use crate::link::packet::{Packet, MAX_SEQS_PER_PACKET};
use crate::link::socket::SendSocket;

/// Cadence of the background task that drains pending ACKs. A same-path
/// flush also fires whenever a peer's pending list reaches a full batch, so
/// this is a latency bound, not a throughput bound.
pub const ACK_FLUSH_INTERVAL: Duration = Duration::from_millis(2);

/// Which seqs of one origin were delivered so far: a high-water mark (all
/// seqs up to and including it are in) plus the out-of-order seqs above it.
/// Memory is O(reordering window) per origin instead of O(stream length),
/// and no seq is ever evicted, so arbitrary reordering stays safe.
#[derive(Default)]
struct DeliveredTracker {
    high_water_mark: u32,
    out_of_order: BTreeSet<u32>,
}

impl DeliveredTracker {
    /// True if the seq was not seen before.
    fn record(&mut self, seq: u32) -> bool {
        if seq <= self.high_water_mark {
            return false;
        }
        if seq == self.high_water_mark + 1 {
            self.high_water_mark = seq;
            while self.out_of_order.first() == Some(&(self.high_water_mark + 1)) {
                self.out_of_order.pop_first();
                self.high_water_mark += 1;
            }
            return true;
        }
        self.out_of_order.insert(seq)
    }
}

struct ReceiverInner {
    delivered: FxHashMap<u32, DeliveredTracker>,
    /// ACKs owed per transport source address, in receipt order. Keyed by
    /// address rather than process id on purpose: a peer that sends DATA
    /// from a secondary port gets its ACKs back on that port
    pending_acks: FxHashMap<SocketAddr, Vec<u32>>,
}

/// The receiving half of the perfect link, one instance per local endpoint.
///
/// For every inbound DATA packet it suppresses duplicates, reports which
/// seqs are first-sight deliveries, and owes the transport source one ACK
/// per received seq (duplicates included, so a lost ACK is eventually
/// replaced). ACKs leave in batches of up to eight, either on the inbound
/// fast path when a full batch accumulates or from a periodic flush task.
pub struct Receiver {
    socket: Arc<dyn SendSocket>,
    inner: Arc<Mutex<ReceiverInner>>,
    shut_down_flag: Arc<AtomicBool>,
    shut_down_notify: Arc<Notify>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Receiver {
    pub fn new(socket: Arc<dyn SendSocket>) -> Receiver {
        Receiver {
            socket,
            inner: Arc::new(Mutex::new(ReceiverInner {
                delivered: FxHashMap::default(),
                pending_acks: FxHashMap::default(),
            })),
            shut_down_flag: Arc::new(AtomicBool::new(false)),
            shut_down_notify: Arc::new(Notify::new()),
            task_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn spawn_active_loop(&self) {
        let mut handles = self.task_handles.lock().expect("receiver handle lock poisoned");
        if !handles.is_empty() {
            warn!("ack flush loop already spawned");
            return;
        }
        handles.push(tokio::spawn(Self::run_ack_flush_loop(
            self.socket.clone(),
            self.inner.clone(),
            self.shut_down_flag.clone(),
            self.shut_down_notify.clone(),
        )));
    }

    /// Handles the seqs of one inbound DATA packet and returns the subset
    /// that was delivered for the first time, in packet order. The caller
    /// decides what a delivery means (log it, feed it to a broadcast layer).
    pub async fn on_data(&self, origin: u32, seqs: &[u32], from: SocketAddr) -> Vec<u32> {
        let (newly_delivered, fast_path_acks) = {
            let mut inner = self.inner.lock().expect("receiver lock poisoned");

            let mut newly_delivered = Vec::new();
            for &seq in seqs {
                if inner.delivered.entry(origin).or_default().record(seq) {
                    newly_delivered.push(seq);
                } else {
                    trace!("duplicate seq {} from origin {} - suppressing", seq, origin);
                }
                inner.pending_acks.entry(from).or_default().push(seq);
            }

            let owed = inner.pending_acks.get(&from).map(Vec::len).unwrap_or(0);
            let fast_path_acks = if owed >= MAX_SEQS_PER_PACKET {
                inner.pending_acks.remove(&from)
            } else {
                None
            };
            (newly_delivered, fast_path_acks)
        };

        // the lock is released before touching the socket
        if let Some(acks) = fast_path_acks {
            Self::send_acks(self.socket.as_ref(), from, &acks).await;
        }

        newly_delivered
    }

    pub async fn shut_down(&self) {
        self.shut_down_flag.store(true, Ordering::Relaxed);
        self.shut_down_notify.notify_one();

        let handles = std::mem::take(
            &mut *self.task_handles.lock().expect("receiver handle lock poisoned"),
        );
        for handle in handles {
            handle.await.ok();
        }
    }

    async fn run_ack_flush_loop(
        socket: Arc<dyn SendSocket>,
        inner: Arc<Mutex<ReceiverInner>>,
        shut_down: Arc<AtomicBool>,
        shut_down_notify: Arc<Notify>,
    ) {
        let mut flush_ticks = interval(ACK_FLUSH_INTERVAL);
        loop {
            select! {
                _ = flush_ticks.tick() => {}
                _ = shut_down_notify.notified() => {}
            }
            if shut_down.load(Ordering::Relaxed) {
                break;
            }

            let owed = std::mem::take(
                &mut inner.lock().expect("receiver lock poisoned").pending_acks,
            );
            for (peer, seqs) in owed {
                Self::send_acks(socket.as_ref(), peer, &seqs).await;
            }
        }
        debug!("ack flush loop shut down");
    }

    async fn send_acks(socket: &dyn SendSocket, to: SocketAddr, seqs: &[u32]) {
        for chunk in seqs.chunks(MAX_SEQS_PER_PACKET) {
            trace!("sending ACK batch to {:?}: {:?}", to, chunk);
            let mut buf = BytesMut::new();
            Packet::Ack { seqs: chunk.to_vec() }.ser(&mut buf);
            socket.send_packet(to, &buf).await;
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        for handle in self.task_handles.lock().expect("receiver handle lock poisoned").drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::socket::MockSendSocket;
    use rstest::rstest;
    use tokio::time::sleep;

    #[rstest]
    #[case::in_order(vec![1, 2, 3], vec![true, true, true], 3, 0)]
    #[case::duplicate(vec![1, 1, 2], vec![true, false, true], 2, 0)]
    #[case::gap(vec![1, 3, 5], vec![true, true, true], 1, 2)]
    #[case::gap_closed(vec![2, 3, 1], vec![true, true, true], 3, 0)]
    #[case::below_watermark(vec![1, 2, 1], vec![true, true, false], 2, 0)]
    #[case::duplicate_above_gap(vec![5, 5], vec![true, false], 0, 1)]
    fn test_delivered_tracker(
        #[case] seqs: Vec<u32>,
        #[case] expected: Vec<bool>,
        #[case] expected_hwm: u32,
        #[case] expected_out_of_order: usize,
    ) {
        let mut tracker = DeliveredTracker::default();
        let actual: Vec<bool> = seqs.iter().map(|&s| tracker.record(s)).collect();
        assert_eq!(actual, expected);
        assert_eq!(tracker.high_water_mark, expected_hwm);
        assert_eq!(tracker.out_of_order.len(), expected_out_of_order);
    }

    #[test]
    fn test_delivered_tracker_drains_consecutive_run() {
        let mut tracker = DeliveredTracker::default();
        for seq in [2, 3, 4, 6] {
            assert!(tracker.record(seq));
        }
        assert_eq!(tracker.high_water_mark, 0);

        assert!(tracker.record(1));
        assert_eq!(tracker.high_water_mark, 4);
        assert_eq!(tracker.out_of_order.iter().copied().collect::<Vec<_>>(), vec![6]);
    }

    fn capturing_socket() -> (Arc<MockSendSocket>, Arc<Mutex<Vec<(SocketAddr, Packet)>>>) {
        let captured: Arc<Mutex<Vec<(SocketAddr, Packet)>>> = Arc::new(Mutex::new(Vec::new()));
        let mut socket = MockSendSocket::new();
        let c = captured.clone();
        socket.expect_send_packet()
            .returning(move |to, buf| {
                let mut b: &[u8] = buf;
                c.lock().unwrap().push((to, Packet::deser(&mut b).unwrap()));
            });
        (Arc::new(socket), captured)
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 18001))
    }

    #[tokio::test]
    async fn test_first_sight_and_duplicate_deliveries() {
        let (socket, _captured) = capturing_socket();
        let receiver = Receiver::new(socket);

        assert_eq!(receiver.on_data(1, &[1, 2], peer()).await, vec![1, 2]);
        assert_eq!(receiver.on_data(1, &[2, 3], peer()).await, vec![3]);
        assert_eq!(receiver.on_data(1, &[1, 2, 3], peer()).await, Vec::<u32>::new());

        // a different origin has its own seq space
        assert_eq!(receiver.on_data(2, &[1], peer()).await, vec![1]);
    }

    #[tokio::test]
    async fn test_duplicates_are_acked_again() {
        let (socket, captured) = capturing_socket();
        let receiver = Receiver::new(socket);
        receiver.spawn_active_loop();

        receiver.on_data(1, &[5], peer()).await;
        receiver.on_data(1, &[5], peer()).await;
        sleep(Duration::from_millis(20)).await;

        let acked: Vec<u32> = captured.lock().unwrap().iter()
            .flat_map(|(to, p)| {
                assert_eq!(*to, peer());
                match p {
                    Packet::Ack { seqs } => seqs.clone(),
                    Packet::Data { .. } => panic!("receiver must never send DATA"),
                }
            })
            .collect();
        assert_eq!(acked, vec![5, 5]);

        receiver.shut_down().await;
    }

    #[tokio::test]
    async fn test_full_batch_acks_on_fast_path() {
        let (socket, captured) = capturing_socket();
        let receiver = Receiver::new(socket);
        // no flush loop: only the fast path can emit here

        let seqs: Vec<u32> = (1..=8).collect();
        receiver.on_data(1, &seqs, peer()).await;

        let sent = captured.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, Packet::Ack { seqs });
    }

    #[tokio::test]
    async fn test_flush_loop_acks_partial_batches_per_peer() {
        let (socket, captured) = capturing_socket();
        let receiver = Receiver::new(socket);
        receiver.spawn_active_loop();

        let other_peer = SocketAddr::from(([127, 0, 0, 1], 18002));
        receiver.on_data(1, &[1, 2], peer()).await;
        receiver.on_data(1, &[3], other_peer).await;
        sleep(Duration::from_millis(20)).await;

        let sent = captured.lock().unwrap();
        assert!(sent.contains(&(peer(), Packet::Ack { seqs: vec![1, 2] })));
        assert!(sent.contains(&(other_peer, Packet::Ack { seqs: vec![3] })));

        drop(sent);
        receiver.shut_down().await;
    }
}
