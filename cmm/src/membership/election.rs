//! The deterministic election rule. Every node evaluates it over its own table, so nodes with the
//! same view compute the same winners without a voting round.

use crate::core::NodeId;
use crate::table::NodeTable;

/// The node that should hold the master role: the lowest alive eligible id.
pub fn rightful_master(table: &NodeTable) -> Option<NodeId> {
  table.candidates().first().copied()
}

/// The node that should hold the vice-master role: the lowest alive eligible id other than the
/// rightful and the sitting master.
pub fn rightful_vice_master(table: &NodeTable) -> Option<NodeId> {
  let master = rightful_master(table);
  let sitting = table.master_id();
  table
    .candidates()
    .into_iter()
    .find(|id| Some(*id) != master && Some(*id) != sitting)
}

/// Whether a claim by `claimant` displaces `holder`. Lower ids win; a claim by the holder itself
/// is a no-op and accepted.
pub fn accepts_claim(holder: Option<NodeId>, claimant: NodeId) -> bool {
  holder.map_or(true, |holder| holder >= claimant)
}

#[cfg(test)]
fn table(alive: &[u16], eligible: &[u16]) -> NodeTable {
  use crate::config::{ClusterConfig, NodeConfig};
  use crate::table::Presence;
  let config = ClusterConfig::new(
    101,
    (101..=105)
      .map(|id| NodeConfig::new(id, format!("127.0.0.1:{}", 7000 + id)))
      .collect(),
  );
  let mut t = NodeTable::new(&config, 1).unwrap();
  t.set_eligible(NodeId(101), false);
  for id in alive {
    t.set_presence(NodeId(*id), Presence::Alive);
  }
  for id in eligible {
    t.set_eligible(NodeId(*id), true);
  }
  t
}

#[test]
fn test_lowest_id_wins() {
  use itertools::Itertools;
  // Arrival order of the observations must not matter.
  for order in [102u16, 103, 104, 105].iter().copied().permutations(4) {
    let t = table(&order, &order[..3]);
    let mut expected = order[..3].to_vec();
    expected.sort();
    assert_eq!(rightful_master(&t), Some(NodeId(expected[0])));
    assert_eq!(rightful_vice_master(&t), Some(NodeId(expected[1])));
  }
}

#[test]
fn test_vice_skips_sitting_master() {
  let mut t = table(&[102, 103, 104], &[102, 103, 104]);
  t.set_master(Some(NodeId(104)));
  assert_eq!(rightful_master(&t), Some(NodeId(102)));
  assert_eq!(rightful_vice_master(&t), Some(NodeId(103)));
  let t = table(&[102, 103], &[103]);
  assert_eq!(rightful_master(&t), Some(NodeId(103)));
  assert_eq!(rightful_vice_master(&t), None);
}

#[test]
fn test_accepts_claim() {
  assert!(accepts_claim(None, NodeId(103)));
  assert!(accepts_claim(Some(NodeId(103)), NodeId(102)));
  assert!(accepts_claim(Some(NodeId(103)), NodeId(103)));
  assert!(!accepts_claim(Some(NodeId(102)), NodeId(103)));
}
