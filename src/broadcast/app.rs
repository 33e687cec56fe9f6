use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broadcast::fifo::FifoResequencer;
use crate::broadcast::urb::UrbState;
use crate::config::Hosts;
use crate::event_log::EventLog;
use crate::link::{bind_socket, Packet, Receiver, Transmitter, RECEIVE_BUFFER_SIZE};

/// All URB and FIFO bookkeeping sits behind one lock so that the
/// relay / ack-in / majority-check transition of a receipt is atomic.
struct BroadcastState {
    urb: UrbState,
    fifo: FifoResequencer,
}

/// Uniform reliable FIFO broadcast: this process broadcasts seqs 1..=m and
/// relays, URB-delivers and FIFO-reorders everyone's messages.
///
/// Topology per process: the configured port receives DATA from all peers,
/// the port 1000 above it carries outbound DATA (own and relayed) and the
/// ACKs coming back for it. One [`Transmitter`] per peer shares the send
/// socket; inbound ACKs are routed to their transmitter by resolving the
/// ACK's transport source back to a process id.
pub struct FifoBroadcastApp {
    self_id: u32,
    message_count: u32,
    hosts: Arc<Hosts>,
    log: Arc<EventLog>,
    data_socket: Arc<UdpSocket>,
    send_socket: Arc<UdpSocket>,
    receiver: Arc<Receiver>,
    transmitters: Arc<FxHashMap<u32, Arc<Transmitter>>>,
    state: Arc<Mutex<BroadcastState>>,
    recv_handles: Vec<JoinHandle<()>>,
}

impl FifoBroadcastApp {
    pub async fn new(
        self_id: u32,
        hosts: Arc<Hosts>,
        message_count: u32,
        log: Arc<EventLog>,
    ) -> anyhow::Result<FifoBroadcastApp> {
        let self_host = hosts.get(self_id)?;
        let data_socket = bind_socket(self_host.addr).await?;
        let send_socket = bind_socket(self_host.send_addr()).await?;

        let receiver = Arc::new(Receiver::new(data_socket.clone()));

        let mut transmitters = FxHashMap::default();
        for host in hosts.iter().filter(|h| h.id != self_id) {
            transmitters.insert(
                host.id,
                Arc::new(Transmitter::new(host.addr, send_socket.clone())),
            );
        }

        info!(
            "fifo broadcast: {} messages, {} processes, majority {}",
            message_count,
            hosts.num_processes(),
            hosts.majority(),
        );

        Ok(FifoBroadcastApp {
            self_id,
            message_count,
            log,
            data_socket,
            send_socket,
            receiver,
            transmitters: Arc::new(transmitters),
            state: Arc::new(Mutex::new(BroadcastState {
                urb: UrbState::new(self_id, hosts.majority()),
                fifo: FifoResequencer::new(),
            })),
            hosts,
            recv_handles: Vec::new(),
        })
    }

    pub fn start(&mut self) {
        self.receiver.spawn_active_loop();
        for transmitter in self.transmitters.values() {
            transmitter.spawn_active_loops();
        }

        self.recv_handles.push(tokio::spawn(Self::run_data_receive_loop(
            self.data_socket.clone(),
            self.receiver.clone(),
            self.hosts.clone(),
            self.transmitters.clone(),
            self.state.clone(),
            self.log.clone(),
        )));
        self.recv_handles.push(tokio::spawn(Self::run_ack_receive_loop(
            self.send_socket.clone(),
            self.hosts.clone(),
            self.transmitters.clone(),
        )));

        for seq in 1..=self.message_count {
            self.broadcast(seq);
        }
    }

    /// Broadcasts one own seq: log `b`, book it, fan the DATA out, then run
    /// the delivery rule (which only fires here for a single-process run).
    fn broadcast(&self, seq: u32) {
        {
            let mut state = self.state.lock().expect("broadcast state lock poisoned");
            self.log.log_broadcast(seq);
            state.urb.note_local_broadcast(seq);
        }

        for transmitter in self.transmitters.values() {
            transmitter.enqueue(self.self_id, seq);
        }

        let mut state = self.state.lock().expect("broadcast state lock poisoned");
        if state.urb.try_urb_deliver(self.self_id, seq) {
            for s in state.fifo.push(self.self_id, seq) {
                self.log.log_delivery(self.self_id, s);
            }
        }
    }

    pub async fn shut_down(&mut self) {
        debug!("shutting down fifo broadcast app");

        for handle in self.recv_handles.drain(..) {
            handle.abort();
            handle.await.ok();
        }

        for transmitter in self.transmitters.values() {
            transmitter.shut_down().await;
        }
        self.receiver.shut_down().await;

        self.log.flush();
    }

    async fn run_data_receive_loop(
        socket: Arc<UdpSocket>,
        receiver: Arc<Receiver>,
        hosts: Arc<Hosts>,
        transmitters: Arc<FxHashMap<u32, Arc<Transmitter>>>,
        state: Arc<Mutex<BroadcastState>>,
        log: Arc<EventLog>,
    ) {
        let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
        loop {
            let (num_read, from) = match socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let parse_buf = &mut &buf[..num_read];
            let (origin, seqs) = match Packet::deser(parse_buf) {
                Ok(Packet::Data { origin, seqs }) => (origin, seqs),
                Ok(Packet::Ack { .. }) => {
                    debug!("ACK on the DATA port from {:?} - dropping", from);
                    continue;
                }
                Err(_) => {
                    warn!("received unparsable packet from {:?}, dropping", from);
                    continue;
                }
            };

            let Some(from_id) = hosts.process_by_source_addr(from) else {
                debug!("DATA from {:?} which is not in the hosts table - dropping", from);
                continue;
            };
            if hosts.get(origin).is_err() {
                debug!("DATA with unknown origin {} from {:?} - dropping", origin, from);
                continue;
            }

            // link-level dedup and ACK bookkeeping. The URB layer below runs
            // on every receipt, not just first sight: a duplicate arriving
            // from a different relayer carries new ack-set information
            receiver.on_data(origin, &seqs, from).await;

            for &seq in &seqs {
                let relay = {
                    let mut state = state.lock().expect("broadcast state lock poisoned");
                    let relay = state.urb.note_receipt(origin, seq, from_id);
                    if state.urb.try_urb_deliver(origin, seq) {
                        for s in state.fifo.push(origin, seq) {
                            log.log_delivery(origin, s);
                        }
                    }
                    relay
                };

                // enqueueing only books the seq and wakes the per-peer
                // sender task, so doing it after dropping the state lock
                // keeps the lock clear of any socket I/O
                if relay {
                    for transmitter in transmitters.values() {
                        transmitter.enqueue(origin, seq);
                    }
                }
            }
        }
    }

    async fn run_ack_receive_loop(
        socket: Arc<UdpSocket>,
        hosts: Arc<Hosts>,
        transmitters: Arc<FxHashMap<u32, Arc<Transmitter>>>,
    ) {
        let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
        loop {
            let (num_read, from) = match socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let parse_buf = &mut &buf[..num_read];
            let seqs = match Packet::deser(parse_buf) {
                Ok(Packet::Ack { seqs }) => seqs,
                Ok(Packet::Data { .. }) => {
                    debug!("DATA on the ACK port from {:?} - dropping", from);
                    continue;
                }
                Err(_) => {
                    warn!("received unparsable packet from {:?}, dropping", from);
                    continue;
                }
            };

            let transmitter = hosts.process_by_source_addr(from)
                .and_then(|id| transmitters.get(&id));
            match transmitter {
                Some(transmitter) => transmitter.on_ack(&seqs),
                None => debug!("ACK from {:?} which maps to no transmitter - dropping", from),
            }
        }
    }
}
