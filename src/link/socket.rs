use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{info, trace, warn};

use crate::link::packet::Packet;

/// Receive buffer size, deliberately far above anything this protocol puts
/// in a datagram: oversized traffic should reach the codec and be rejected
/// there, not get silently truncated by the socket.
pub const RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

/// Where outbound packets leave the process. The transmitter and receiver
/// only ever need "fire this buffer at that address" - addressing lives in
/// the hosts table, framing in the codec - so the seam is a single method,
/// which also lets unit tests capture traffic without binding sockets.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    /// Best effort. A send that fails is dropped after a log line; loss
    /// recovery lives in the retransmit schedule, not here.
    async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]);
}

#[async_trait]
impl SendSocket for UdpSocket {
    async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        debug_assert!(packet_buf.len() <= Packet::MAX_SERIALIZED_LEN);

        match self.send_to(packet_buf, to).await {
            Ok(_) => trace!("{} byte packet out to {:?}", packet_buf.len(), to),
            Err(e) => warn!("dropping outbound packet for {:?}: {}", to, e),
        }
    }
}

pub async fn bind_socket(addr: SocketAddr) -> anyhow::Result<Arc<UdpSocket>> {
    let socket = Arc::new(UdpSocket::bind(addr).await?);
    info!("bound UDP socket to {:?}", socket.local_addr()?);
    Ok(socket)
}
