//! Uniform reliable FIFO broadcast on top of the perfect links.
//!
//! Every process broadcasts its own seqs and relays every foreign message on
//! first receipt, so a message sent by anyone reaches everyone even if the
//! original sender crashes mid-broadcast. A message is *URB-delivered* once
//! a majority of processes is known to have seen it, which makes delivery
//! uniform: whatever any process delivered, every correct process will. The
//! [`FifoResequencer`] then holds URB-delivered messages back until all of
//! the same origin's predecessors are out.
//!
//! The state transitions per `(origin, seq)`:
//!
//! ```ascii
//! fresh --receive/broadcast--> forwarded --majority seen--> urb_delivered --next in line--> fifo_delivered
//!                                                                |
//!                                         (out of order) --> parked --predecessor delivered--^
//! ```

mod app;
mod fifo;
mod urb;

pub use app::FifoBroadcastApp;
pub use fifo::FifoResequencer;
pub use urb::UrbState;
