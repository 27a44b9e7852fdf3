use crate::config::ClusterConfig;
use crate::core::NodeId;
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};

/// The ring: configured nodes in ascending id order, wrapping around. Each node links to its
/// nearest reachable successor, so walking the successors of a node yields, nearest first, the
/// nodes it should try to link to.
#[derive(Clone, Debug)]
pub struct RingOrder {
  local: NodeId,
  addresses: BTreeMap<NodeId, String>,
}
impl RingOrder {
  pub fn new(config: &ClusterConfig) -> RingOrder {
    RingOrder {
      local: config.local,
      addresses: config
        .nodes
        .iter()
        .map(|n| (n.id, n.address.clone()))
        .collect(),
    }
  }

  pub fn local(&self) -> NodeId {
    self.local
  }

  /// Every other node, nearest successor first.
  pub fn successors(&self) -> impl Iterator<Item = NodeId> + '_ {
    self
      .addresses
      .range((Excluded(self.local), Unbounded))
      .chain(self.addresses.range(..self.local))
      .map(|(id, _)| *id)
  }

  /// Every other node, nearest predecessor first.
  pub fn predecessors(&self) -> impl Iterator<Item = NodeId> + '_ {
    self
      .addresses
      .range(..self.local)
      .rev()
      .chain(self.addresses.range((Excluded(self.local), Unbounded)).rev())
      .map(|(id, _)| *id)
  }

  /// Hops from the local node forward to `to`.
  pub fn distance(&self, to: NodeId) -> Option<usize> {
    self.successors().position(|id| id == to).map(|p| p + 1)
  }

  /// Hops from `from` forward to the local node.
  pub fn back_distance(&self, from: NodeId) -> Option<usize> {
    self.predecessors().position(|id| id == from).map(|p| p + 1)
  }

  pub fn address(&self, id: NodeId) -> Option<&str> {
    self.addresses.get(&id).map(String::as_str)
  }

  pub fn contains(&self, id: NodeId) -> bool {
    self.addresses.contains_key(&id)
  }
}

#[test]
fn test_ring_order() {
  use crate::config::NodeConfig;
  let nodes = [104u16, 101, 103, 102, 105]
    .iter()
    .map(|id| NodeConfig::new(*id, format!("127.0.0.1:{}", 7000 + id)))
    .collect::<Vec<_>>();
  let ring = RingOrder::new(&ClusterConfig::new(103, nodes));
  let ids = |it: &mut dyn Iterator<Item = NodeId>| it.map(|id| id.0).collect::<Vec<_>>();
  assert_eq!(ids(&mut ring.successors()), vec![104, 105, 101, 102]);
  assert_eq!(ids(&mut ring.predecessors()), vec![102, 101, 105, 104]);
  assert_eq!(ring.distance(NodeId(101)), Some(3));
  assert_eq!(ring.back_distance(NodeId(101)), Some(2));
  assert_eq!(ring.distance(NodeId(103)), None);
  assert_eq!(ring.address(NodeId(105)), Some("127.0.0.1:7105"));
}
