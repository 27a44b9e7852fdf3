use crate::config::ClusterConfig;
use crate::core::NodeId;
use crate::error::ConfigError;
use crate::frame::{CNodeInfo, InfoRequest, NodeInfo};
use crate::table::{Node, NodeState, Presence};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The local verdict on whether the cluster view can be trusted.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum ClusterValidity {
  /// Still discovering peers after start.
  Stale,
  /// Too few nodes alive; elections are suspended.
  Invalid,
  Valid,
}

/// A read-only view of the table, published after every change.
pub type TableSnapshot = Arc<NodeTable>;

/// Who is in the cluster, and in which role.
///
/// Built once from the static configuration; nodes are never added or removed afterwards, only
/// their observed state changes. All mutators are crate-private and used by the membership task
/// alone. They keep the role invariant: at most one master, at most one vice-master, never the
/// same node. The table is a persistent map, so cloning it for a snapshot is cheap.
#[derive(Clone, Debug)]
pub struct NodeTable {
  local: NodeId,
  nodes: im::HashMap<NodeId, Node>,
  order: im::Vector<NodeId>,
  master: Option<NodeId>,
  vice_master: Option<NodeId>,
  validity: ClusterValidity,
  quorum: bool,
  software_load: String,
  version: u64,
}
impl NodeTable {
  pub fn new(config: &ClusterConfig, incarnation: u32) -> Result<NodeTable, ConfigError> {
    config.validate()?;
    let mut nodes = im::HashMap::new();
    let mut order = im::Vector::new();
    for (index, nc) in config.nodes.iter().enumerate() {
      let local = nc.id == config.local;
      nodes.insert(
        nc.id,
        Node {
          id: nc.id,
          index: index,
          name: nc.name(),
          address: nc.address.clone(),
          presence: if local { Presence::Alive } else { Presence::Unknown },
          eligible: local && config.active_disks >= config.min_eligible_disks,
          master: false,
          vice_master: false,
          active_disks: if local { config.active_disks } else { 0 },
          incarnation: if local { incarnation } else { 0 },
        },
      );
      order.push_back(nc.id);
    }
    Ok(NodeTable {
      local: config.local,
      nodes: nodes,
      order: order,
      master: None,
      vice_master: None,
      validity: ClusterValidity::Stale,
      quorum: false,
      software_load: config.software_load.clone(),
      version: 0,
    })
  }

  pub fn local_id(&self) -> NodeId {
    self.local
  }

  pub fn local_node(&self) -> &Node {
    // The local node is inserted at construction and never removed.
    &self.nodes[&self.local]
  }

  pub fn node(&self, id: NodeId) -> Option<&Node> {
    self.nodes.get(&id)
  }

  pub fn master(&self) -> Option<&Node> {
    self.master.and_then(|id| self.nodes.get(&id))
  }

  pub fn vice_master(&self) -> Option<&Node> {
    self.vice_master.and_then(|id| self.nodes.get(&id))
  }

  pub fn master_id(&self) -> Option<NodeId> {
    self.master
  }

  pub fn vice_master_id(&self) -> Option<NodeId> {
    self.vice_master
  }

  pub fn state(&self, id: NodeId) -> Option<NodeState> {
    self.node(id).map(Node::state)
  }

  pub fn is_alive(&self, id: NodeId) -> bool {
    self.node(id).map_or(false, Node::is_alive)
  }

  /// All nodes in configuration order.
  pub fn iter(&self) -> impl Iterator<Item = &Node> + '_ {
    self.order.iter().filter_map(move |id| self.nodes.get(id))
  }

  pub fn count(&self) -> usize {
    self.order.len()
  }

  pub fn alive(&self) -> impl Iterator<Item = &Node> + '_ {
    self.iter().filter(|n| n.is_alive())
  }

  pub fn alive_count(&self) -> usize {
    self.alive().count()
  }

  pub fn alive_disks(&self) -> u32 {
    self.alive().map(|n| n.active_disks).sum()
  }

  /// Alive and eligible node ids, lowest first.
  pub fn candidates(&self) -> Vec<NodeId> {
    self
      .alive()
      .filter(|n| n.eligible)
      .map(|n| n.id)
      .sorted()
      .collect()
  }

  pub fn validity(&self) -> ClusterValidity {
    self.validity
  }

  pub fn has_quorum(&self) -> bool {
    self.quorum
  }

  pub fn software_load(&self) -> &str {
    &self.software_load
  }

  /// Bumped by every mutation that changed something.
  pub fn version(&self) -> u64 {
    self.version
  }

  /// True if the role flags agree with the cached holders.
  pub fn roles_consistent(&self) -> bool {
    let masters = self.iter().filter(|n| n.master).map(|n| n.id).collect::<Vec<_>>();
    let vices = self.iter().filter(|n| n.vice_master).map(|n| n.id).collect::<Vec<_>>();
    masters.len() <= 1
      && vices.len() <= 1
      && masters.first().copied() == self.master
      && vices.first().copied() == self.vice_master
      && self.master.map_or(true, |m| Some(m) != self.vice_master)
  }

  fn select(&self, request: InfoRequest, given: Option<NodeId>) -> Vec<&Node> {
    match request {
      InfoRequest::Me => vec![self.local_node()],
      InfoRequest::Master => self.master().into_iter().collect(),
      InfoRequest::ViceMaster => self.vice_master().into_iter().collect(),
      InfoRequest::GivenNode => given.and_then(|id| self.node(id)).into_iter().collect(),
      InfoRequest::All | InfoRequest::AllCountOnly => self.iter().collect(),
    }
  }

  /// Answers a query with length-prefixed records. An unoccupied role or an unknown given node
  /// yields an empty answer.
  pub fn node_info(&self, request: InfoRequest, given: Option<NodeId>) -> NodeInfo {
    match request {
      InfoRequest::AllCountOnly => NodeInfo::count_only(self.count() as u32),
      _ => NodeInfo::answer(
        request,
        given,
        self
          .select(request, given)
          .into_iter()
          .map(Node::info_record)
          .collect(),
      ),
    }
  }

  /// Answers a query with fixed-width legacy records.
  pub fn c_node_info(&self, request: InfoRequest, given: Option<NodeId>) -> CNodeInfo {
    match request {
      InfoRequest::AllCountOnly => CNodeInfo::count_only(self.count() as u32),
      _ => CNodeInfo::answer(
        request,
        given,
        self
          .select(request, given)
          .into_iter()
          .map(|n| n.c_record(&self.software_load))
          .collect(),
      ),
    }
  }

  fn update<F: FnOnce(&mut Node) -> bool>(&mut self, id: NodeId, f: F) -> bool {
    let changed = self.nodes.get_mut(&id).map_or(false, f);
    if changed {
      self.version += 1;
    }
    changed
  }

  pub(crate) fn set_presence(&mut self, id: NodeId, presence: Presence) -> bool {
    self.update(id, |n| assign(&mut n.presence, presence))
  }

  pub(crate) fn set_incarnation(&mut self, id: NodeId, incarnation: u32) -> bool {
    self.update(id, |n| assign(&mut n.incarnation, incarnation))
  }

  pub(crate) fn set_eligible(&mut self, id: NodeId, eligible: bool) -> bool {
    self.update(id, |n| assign(&mut n.eligible, eligible))
  }

  pub(crate) fn set_active_disks(&mut self, id: NodeId, disks: u32) -> bool {
    self.update(id, |n| assign(&mut n.active_disks, disks))
  }

  /// Moves the master role. A vice-master promoted to master loses the vice role. Returns the
  /// previous master.
  pub(crate) fn set_master(&mut self, id: Option<NodeId>) -> Option<NodeId> {
    let prior = self.master;
    if prior == id || id.map_or(false, |id| !self.nodes.contains_key(&id)) {
      return prior;
    }
    if let Some(old) = prior {
      self.update(old, |n| assign(&mut n.master, false));
    }
    if let Some(new) = id {
      if self.vice_master == Some(new) {
        self.set_vice_master(None);
      }
      self.update(new, |n| assign(&mut n.master, true));
    }
    self.master = id;
    self.version += 1;
    prior
  }

  /// Moves the vice-master role. Refused for the sitting master. Returns whether the role moved.
  pub(crate) fn set_vice_master(&mut self, id: Option<NodeId>) -> bool {
    if self.vice_master == id
      || id.map_or(false, |id| Some(id) == self.master || !self.nodes.contains_key(&id))
    {
      return false;
    }
    if let Some(old) = self.vice_master {
      self.update(old, |n| assign(&mut n.vice_master, false));
    }
    if let Some(new) = id {
      self.update(new, |n| assign(&mut n.vice_master, true));
    }
    self.vice_master = id;
    self.version += 1;
    true
  }

  pub(crate) fn set_validity(&mut self, validity: ClusterValidity) -> bool {
    let changed = assign(&mut self.validity, validity);
    self.version += changed as u64;
    changed
  }

  pub(crate) fn set_quorum(&mut self, quorum: bool) -> bool {
    let changed = assign(&mut self.quorum, quorum);
    self.version += changed as u64;
    changed
  }
}

fn assign<T: PartialEq>(slot: &mut T, value: T) -> bool {
  if *slot == value {
    false
  } else {
    *slot = value;
    true
  }
}

#[cfg(test)]
fn table() -> NodeTable {
  use crate::config::NodeConfig;
  let config = ClusterConfig::new(
    102,
    (101..=104)
      .map(|id| NodeConfig::new(id, format!("127.0.0.1:{}", 7000 + id)))
      .collect(),
  );
  let mut t = NodeTable::new(&config, 9).unwrap();
  for id in 101..=104 {
    t.set_presence(NodeId(id), Presence::Alive);
    t.set_eligible(NodeId(id), true);
  }
  t
}

#[test]
fn test_role_invariants() {
  let mut t = table();
  assert!(t.set_vice_master(Some(NodeId(101))));
  assert!(!t.set_vice_master(Some(NodeId(101))));
  assert_eq!(t.set_master(Some(NodeId(101))), None);
  assert_eq!(t.vice_master_id(), None);
  assert!(!t.node(NodeId(101)).unwrap().vice_master);
  assert!(!t.set_vice_master(Some(NodeId(101))));
  assert!(t.set_vice_master(Some(NodeId(103))));
  assert_eq!(t.set_master(Some(NodeId(102))), Some(NodeId(101)));
  assert_eq!(t.state(NodeId(101)), Some(NodeState::Alive));
  assert_eq!(t.state(NodeId(102)), Some(NodeState::Master));
  assert_eq!(t.state(NodeId(103)), Some(NodeState::ViceMaster));
  assert!(t.roles_consistent());
  assert_eq!(t.set_master(Some(NodeId(999))), Some(NodeId(102)));
  assert_eq!(t.master_id(), Some(NodeId(102)));
}

#[test]
fn test_version_counts_changes() {
  let mut t = table();
  let v = t.version();
  assert!(!t.set_presence(NodeId(101), Presence::Alive));
  assert_eq!(t.version(), v);
  assert!(t.set_active_disks(NodeId(101), 2));
  assert_eq!(t.version(), v + 1);
  assert!(!t.set_active_disks(NodeId(999), 2));
  assert_eq!(t.version(), v + 1);
}

#[test]
fn test_queries() {
  let mut t = table();
  t.set_master(Some(NodeId(101)));
  t.set_presence(NodeId(104), Presence::Left);
  assert_eq!(t.local_node().id, NodeId(102));
  assert_eq!(t.local_node().incarnation, 9);
  assert_eq!(t.candidates(), vec![NodeId(101), NodeId(102), NodeId(103)]);
  assert_eq!(
    t.iter().map(|n| n.id.0).collect::<Vec<_>>(),
    vec![101, 102, 103, 104]
  );

  let me = t.node_info(InfoRequest::Me, None);
  assert!(me.response);
  assert_eq!(me.records.len(), 1);
  assert_eq!(me.records[0].id, NodeId(102));

  assert!(t.node_info(InfoRequest::ViceMaster, None).records.is_empty());
  let master = t.c_node_info(InfoRequest::Master, None);
  assert_eq!(master.records[0].id, NodeId(101));
  assert_eq!(master.records[0].swload, t.software_load());

  let given = t.node_info(InfoRequest::GivenNode, Some(NodeId(104)));
  assert!(given.records[0].off);
  assert!(t.node_info(InfoRequest::GivenNode, Some(NodeId(7))).records.is_empty());

  let count = t.c_node_info(InfoRequest::AllCountOnly, None);
  assert_eq!(count.count, 4);
  assert!(count.records.is_empty());
  assert_eq!(t.node_info(InfoRequest::All, None).count, 4);
}
