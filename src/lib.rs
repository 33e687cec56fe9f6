//! Lower layers of a distributed-algorithms stack on top of plain UDP:
//!
//! * [`link`] implements a *perfect point-to-point link*: reliable delivery,
//!   no duplication, no creation. A per-destination transmitter keeps a
//!   pending queue and a table of unacknowledged sequence numbers, batches up
//!   to eight seqs into one DATA datagram, and retransmits on a timeout heap
//!   until the peer acknowledges. The receiver suppresses duplicates and
//!   returns batched ACKs to the transport source of each DATA packet.
//! * [`broadcast`] builds *uniform reliable FIFO broadcast* on those links:
//!   every process relays a message on first receipt, a message is delivered
//!   once a majority of processes is known to have seen it, and deliveries
//!   are re-sequenced per origin before they reach the log.
//!
//! Both layers write their observable events to an append-only [`event_log`]
//! with two line kinds: `b <seq>` when a message is broadcast and
//! `d <origin> <seq>` when a message is delivered.
//!
//! ## Wire format
//!
//! All numbers big-endian, one packet per UDP datagram, no length prefix:
//!
//! ```ascii
//! DATA: u8(0x01) | u32(origin) | u8(count) | count x u32(seq)
//! ACK : u8(0x02) |               u8(count) | count x u32(seq)
//! ```
//!
//! `count` is between 1 and 8, and all seqs of a DATA packet belong to the
//! same origin. An ACK carries no origin and no address: it closes the loop
//! on whichever transmitter sent the DATA, identified by the transport-level
//! source address of the DATA datagram.

pub mod broadcast;
pub mod config;
pub mod event_log;
pub mod link;
