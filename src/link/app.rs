use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Hosts;
use crate::event_log::EventLog;
use crate::link::packet::Packet;
use crate::link::receiver::Receiver;
use crate::link::socket::{bind_socket, RECEIVE_BUFFER_SIZE};
use crate::link::transmitter::Transmitter;

/// One reliable point-to-point stream: a single designated receiver process,
/// every other process sends seqs 1..=m to it.
///
/// Dual-socket topology: the configured port receives DATA, the port 1000
/// above it sends DATA and receives the ACKs coming back, so shutdown of one
/// receive loop never races the other's traffic.
pub struct PerfectLinkApp {
    self_id: u32,
    message_count: u32,
    hosts: Arc<Hosts>,
    log: Arc<EventLog>,
    data_socket: Arc<UdpSocket>,
    link_socket: Arc<UdpSocket>,
    receiver: Arc<Receiver>,
    transmitter: Option<Arc<Transmitter>>,
    recv_handles: Vec<JoinHandle<()>>,
}

impl PerfectLinkApp {
    pub async fn new(
        self_id: u32,
        hosts: Arc<Hosts>,
        message_count: u32,
        receiver_id: u32,
        log: Arc<EventLog>,
    ) -> anyhow::Result<PerfectLinkApp> {
        let self_host = hosts.get(self_id)?;
        let data_socket = bind_socket(self_host.addr).await?;
        let link_socket = bind_socket(self_host.send_addr()).await?;

        let receiver = Arc::new(Receiver::new(data_socket.clone()));

        let transmitter = if self_id == receiver_id {
            None
        } else {
            let peer = hosts.get(receiver_id)?;
            info!("sender role: {} messages for {:?}", message_count, peer);
            Some(Arc::new(Transmitter::new(peer.addr, link_socket.clone())))
        };

        Ok(PerfectLinkApp {
            self_id,
            message_count,
            hosts,
            log,
            data_socket,
            link_socket,
            receiver,
            transmitter,
            recv_handles: Vec::new(),
        })
    }

    pub fn start(&mut self) {
        self.receiver.spawn_active_loop();
        if let Some(transmitter) = &self.transmitter {
            transmitter.spawn_active_loops();
        }

        self.recv_handles.push(tokio::spawn(Self::run_data_receive_loop(
            self.data_socket.clone(),
            self.receiver.clone(),
            self.hosts.clone(),
            self.log.clone(),
        )));
        self.recv_handles.push(tokio::spawn(Self::run_ack_receive_loop(
            self.link_socket.clone(),
            self.transmitter.clone(),
        )));

        if let Some(transmitter) = &self.transmitter {
            for seq in 1..=self.message_count {
                self.log.log_broadcast(seq);
                transmitter.enqueue(self.self_id, seq);
            }
        }
    }

    /// Resolves once every sent seq is acknowledged. The receiver role has
    /// no local completion condition and pends until the process is told to
    /// stop from the outside.
    pub async fn wait_done(&self) {
        match &self.transmitter {
            Some(transmitter) => transmitter.wait_all_acked().await,
            None => std::future::pending().await,
        }
    }

    pub async fn shut_down(&mut self) {
        debug!("shutting down perfect link app");

        // cancelling the receive tasks is what unblocks the pending
        // recv_from, the same role closing the socket plays for a blocking
        // read
        for handle in self.recv_handles.drain(..) {
            handle.abort();
            handle.await.ok();
        }

        if let Some(transmitter) = &self.transmitter {
            transmitter.shut_down().await;
        }
        self.receiver.shut_down().await;

        self.log.flush();
    }

    async fn run_data_receive_loop(
        socket: Arc<UdpSocket>,
        receiver: Arc<Receiver>,
        hosts: Arc<Hosts>,
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
            match Packet::deser(parse_buf) {
                Ok(Packet::Data { origin, seqs }) => {
                    if hosts.get(origin).is_err() {
                        debug!("DATA with unknown origin {} from {:?} - dropping", origin, from);
                        continue;
                    }
                    for seq in receiver.on_data(origin, &seqs, from).await {
                        log.log_delivery(origin, seq);
                    }
                }
                Ok(Packet::Ack { .. }) => {
                    debug!("ACK on the DATA port from {:?} - dropping", from);
                }
                Err(_) => {
                    warn!("received unparsable packet from {:?}, dropping", from);
                }
            }
        }
    }

    async fn run_ack_receive_loop(socket: Arc<UdpSocket>, transmitter: Option<Arc<Transmitter>>) {
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
            match Packet::deser(parse_buf) {
                Ok(Packet::Ack { seqs }) => match &transmitter {
                    Some(transmitter) => transmitter.on_ack(&seqs),
                    None => debug!("ACK from {:?} but nothing was ever sent - dropping", from),
                },
                Ok(Packet::Data { .. }) => {
                    debug!("DATA on the ACK port from {:?} - dropping", from);
                }
                Err(_) => {
                    warn!("received unparsable packet from {:?}, dropping", from);
                }
            }
        }
    }
}
