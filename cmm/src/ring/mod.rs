//! The ring transport.
//!
//! Nodes are arranged in ascending id order, wrapping around. Each node dials its nearest
//! reachable successor and accepts connections from its predecessors, so a frame sent to both
//! neighbours and forwarded in its direction of travel reaches every node twice, once per
//! direction. A link carries length-prefixed frames in both directions once both ends exchanged
//! a `Discovery` frame.
//!
//! Losing the left or right neighbour is reported to membership as
//! [`Input::LinkDown`](crate::membership::Input::LinkDown); the transport then dials the next
//! successor, backing off exponentially per peer.

mod link;
mod order;
mod transport;

#[rustfmt::skip]
pub use {
  link::read_frame,
  link::read_raw,
  link::write_frame,
  link::write_raw,
  order::RingOrder,
  transport::RingCmd,
};

pub(crate) use transport::RingTransport;
