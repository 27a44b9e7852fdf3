//! The membership state machine.
//!
//! [`Membership`] consumes ring frames, timer ticks and local commands, mutates the
//! [`NodeTable`](crate::table::NodeTable), and returns the frames to send and the notifications to
//! publish as [`Effect`]s. It performs no I/O, so it can be driven by the real ring transport or
//! by a simulated ring in tests. The runner task owns it at runtime and serializes every mutation.
//!
//! ### Liveness
//! Every node originates a heartbeat each `hb_interval`, sent in both ring directions and
//! forwarded by every node until it returns to its origin. A heartbeat is applied only if its
//! `(incarnation, sequence)` is newer than anything applied from that node before, which makes
//! duplicates from the two directions harmless. A node silent for `max_missed` intervals is
//! declared left.
//!
//! ### Election
//! Candidates are alive, eligible nodes. The lowest candidate claims master once the role has
//! been vacant, or held by a higher id, for `election_delay`; the next lowest claims vice-master
//! the same way. A claim is accepted unless a lower id already holds the role, so two masters
//! after a partition converge on the lower id. Elections only run while the local view is valid.

pub mod election;
mod config_store;
mod liveness;
mod machine;
mod runner;

#[rustfmt::skip]
pub use {
  config_store::ConfigStore,
  config_store::ConfigUpdate,
  config_store::MemoryConfigStore,
  liveness::Freshness,
  liveness::PeerTracker,
  liveness::SeenCache,
  machine::Effect,
  machine::InfoReply,
  machine::Input,
  machine::Membership,
};

#[rustfmt::skip]
pub(crate) use {
  runner::Command,
  runner::Runner,
};
