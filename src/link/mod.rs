//! The perfect point-to-point link: reliable delivery, no duplication, no
//! creation, on top of best-effort UDP datagrams.
//!
//! The [`Transmitter`] side owns a pending queue, a table of unacknowledged
//! seqs and a timeout heap, and keeps re-sending DATA packets until the peer
//! acknowledges every seq. The [`Receiver`] side suppresses duplicates and
//! batches ACKs back to the transport source of each DATA packet. The
//! [`PerfectLinkApp`] wires one transmitter and one receiver into the
//! dual-socket topology used by the CLI.

mod app;
mod packet;
mod receiver;
mod socket;
mod transmitter;

pub use app::PerfectLinkApp;
pub use packet::{Packet, MAX_SEQS_PER_PACKET};
pub use receiver::{Receiver, ACK_FLUSH_INTERVAL};
pub use socket::{bind_socket, SendSocket, RECEIVE_BUFFER_SIZE};
pub use transmitter::{Transmitter, RETRANSMIT_TIMEOUT};
