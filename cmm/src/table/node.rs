use crate::core::NodeId;
use crate::frame::{CNodeRecord, NodeInfoRecord, SFlags};
use serde::{Deserialize, Serialize};

/// Whether a node takes part in the ring, as observed locally.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Presence {
  /// Configured but never heard from.
  Unknown,
  /// Seen on a link handshake or a hello, but no heartbeat yet.
  Joining,
  Alive,
  /// Left gracefully, timed out, or lost its link.
  Left,
}

/// The observable state of a member, derived from its presence and flags.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum NodeState {
  Unknown,
  Joining,
  Alive,
  Master,
  ViceMaster,
  Ineligible,
  Left,
}

/// One cluster member as seen by the local node.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Node {
  pub id: NodeId,
  /// Position in the static configuration. Iteration follows it.
  pub index: usize,
  pub name: String,
  pub address: String,
  pub presence: Presence,
  pub eligible: bool,
  pub master: bool,
  pub vice_master: bool,
  pub active_disks: u32,
  /// The lifetime of the node the record describes. Zero until first heard from.
  pub incarnation: u32,
}
impl Node {
  pub fn is_alive(&self) -> bool {
    self.presence == Presence::Alive
  }

  pub fn state(&self) -> NodeState {
    match self.presence {
      Presence::Unknown => NodeState::Unknown,
      Presence::Joining => NodeState::Joining,
      Presence::Left => NodeState::Left,
      Presence::Alive if self.master => NodeState::Master,
      Presence::Alive if self.vice_master => NodeState::ViceMaster,
      Presence::Alive if !self.eligible => NodeState::Ineligible,
      Presence::Alive => NodeState::Alive,
    }
  }

  pub fn sflags(&self) -> SFlags {
    SFlags::default()
      .with(SFlags::MASTER, self.master)
      .with(SFlags::VICEMASTER, self.vice_master)
      .with(SFlags::OUT_OF_CLUSTER, !self.is_alive())
      .with(SFlags::ELIGIBLE, self.eligible)
  }

  pub fn info_record(&self) -> NodeInfoRecord {
    NodeInfoRecord {
      id: self.id,
      name: self.name.clone(),
      alive: self.is_alive(),
      eligible: self.eligible,
      master: self.master,
      vice_master: self.vice_master,
      off: !self.is_alive(),
      active_disks: self.active_disks,
    }
  }

  pub fn c_record(&self, swload: &str) -> CNodeRecord {
    CNodeRecord {
      id: self.id,
      name: self.name.clone(),
      addr: self.address.clone(),
      domain: 0,
      sflags: self.sflags(),
      incarnation: self.incarnation,
      swload: swload.to_string(),
    }
  }
}

#[test]
fn test_node_state() {
  let mut node = Node {
    id: NodeId(101),
    index: 0,
    name: "node-101".to_string(),
    address: "127.0.0.1:7101".to_string(),
    presence: Presence::Joining,
    eligible: true,
    master: false,
    vice_master: false,
    active_disks: 4,
    incarnation: 1,
  };
  assert_eq!(node.state(), NodeState::Joining);
  assert!(node.sflags().contains(SFlags::OUT_OF_CLUSTER));
  node.presence = Presence::Alive;
  assert_eq!(node.state(), NodeState::Alive);
  node.master = true;
  assert_eq!(node.state(), NodeState::Master);
  assert_eq!(node.sflags().0, SFlags::MASTER | SFlags::ELIGIBLE);
  node.master = false;
  node.eligible = false;
  assert_eq!(node.state(), NodeState::Ineligible);
  assert!(node.info_record().alive);
}
