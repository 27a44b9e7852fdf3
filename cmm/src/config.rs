use crate::core::NodeId;
use crate::error::ConfigError;
use crate::frame::{ADDR_WIDTH, NAME_WIDTH, SWLOAD_WIDTH};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A statically configured cluster member.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct NodeConfig {
  pub id: NodeId,
  /// The `host:port` ring links to this node are dialed on.
  pub address: String,
  /// Display name reported in member records.
  ///
  /// default: `node-<id>`
  #[serde(default)]
  pub name: Option<String>,
}
impl NodeConfig {
  pub fn new<S: Into<String>>(id: u16, address: S) -> NodeConfig {
    NodeConfig {
      id: NodeId(id),
      address: address.into(),
      name: None,
    }
  }

  pub fn name(&self) -> String {
    self
      .name
      .clone()
      .unwrap_or_else(|| format!("node-{}", self.id))
  }
}

/// Configures a [`Cluster`](crate::cluster::Cluster). Every node of a cluster must agree on
/// `nodes`; the timing fields may differ between nodes but rarely should.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ClusterConfig {
  /// The id of the node this process runs as. Must appear in `nodes`.
  ///
  /// default: `1`
  pub local: NodeId,
  /// The static cluster membership. Ring order is ascending id.
  ///
  /// default: `[]`
  pub nodes: Vec<NodeConfig>,
  /// The interval at which heartbeats are originated.
  ///
  /// default: `500 milliseconds`
  pub hb_interval: Duration,
  /// The number of consecutive heartbeat intervals a node may stay silent before it is declared
  /// not alive.
  ///
  /// default: `5`
  pub max_missed: u32,
  /// How long a role must stay vacant, or held by a higher id, before the rightful node claims
  /// it.
  ///
  /// default: `2 * hb_interval`
  pub election_delay: Option<Duration>,
  /// How long after start the local view is reported stale. No elections run while stale.
  ///
  /// default: `2 * hb_interval`
  pub discovery_window: Option<Duration>,
  /// Bound on dialing a ring neighbour, including the handshake.
  ///
  /// default: `1 second`
  pub connect_timeout: Duration,
  /// Bound on writing one frame to a ring link.
  ///
  /// default: `1 second`
  pub write_timeout: Duration,
  /// The first delay before an unreachable neighbour is dialed again.
  ///
  /// default: `hb_interval`
  pub reconnect_min: Option<Duration>,
  /// The reconnect delay doubles up to this bound.
  ///
  /// default: `8 * hb_interval`
  pub reconnect_max: Option<Duration>,
  /// How long a relayed frame is remembered to suppress duplicates and loops.
  ///
  /// default: `2 * hb_interval`
  pub dedup_window: Option<Duration>,
  /// The bounded queue length of each subscriber. A subscriber that falls this far behind is
  /// dropped.
  ///
  /// default: `128`
  pub subscriber_capacity: usize,
  /// The number of healthy local disks at start.
  ///
  /// default: `4`
  pub active_disks: u32,
  /// The number of disks each node is provisioned with.
  ///
  /// default: `4`
  pub disks_per_node: u32,
  /// The local node is eligible for master and vice-master while it has at least this many
  /// healthy disks.
  ///
  /// default: `1`
  pub min_eligible_disks: u32,
  /// The number of alive nodes needed for a valid cluster.
  ///
  /// default: a majority of `nodes`
  pub min_alive: Option<usize>,
  /// The number of healthy disks across alive nodes needed for quorum.
  ///
  /// default: `nodes.len() * disks_per_node / 2 + 1`
  pub quorum_disks: Option<u32>,
  /// The software load reported in legacy member records.
  ///
  /// default: `cmm-<crate version>`
  pub software_load: String,
  /// The lifetime counter of this process. Must grow across restarts.
  ///
  /// default: seconds since the unix epoch at start
  pub incarnation: Option<u32>,
  /// Where notification subscribers connect, if anywhere.
  ///
  /// default: `None`
  pub notify_addr: Option<SocketAddr>,
  /// Where admin queries are answered, if anywhere.
  ///
  /// default: `None`
  pub admin_addr: Option<SocketAddr>,
}
impl Default for ClusterConfig {
  #[inline]
  fn default() -> Self {
    ClusterConfig {
      local: NodeId(1),
      nodes: Vec::new(),
      hb_interval: Duration::from_millis(500),
      max_missed: 5,
      election_delay: None,
      discovery_window: None,
      connect_timeout: Duration::from_secs(1),
      write_timeout: Duration::from_secs(1),
      reconnect_min: None,
      reconnect_max: None,
      dedup_window: None,
      subscriber_capacity: 128,
      active_disks: 4,
      disks_per_node: 4,
      min_eligible_disks: 1,
      min_alive: None,
      quorum_disks: None,
      software_load: concat!("cmm-", env!("CARGO_PKG_VERSION")).to_string(),
      incarnation: None,
      notify_addr: None,
      admin_addr: None,
    }
  }
}
impl ClusterConfig {
  pub fn new(local: u16, nodes: Vec<NodeConfig>) -> ClusterConfig {
    ClusterConfig {
      local: NodeId(local),
      nodes: nodes,
      ..Default::default()
    }
  }

  /// Reads a JSON config file and validates it.
  pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<ClusterConfig, ConfigError> {
    let text =
      std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read(e.to_string()))?;
    let config: ClusterConfig =
      serde_json::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.nodes.is_empty() {
      return Err(ConfigError::NoNodes);
    }
    let mut ids = HashSet::new();
    for node in &self.nodes {
      if node.id.0 == 0 {
        return Err(ConfigError::ZeroId);
      }
      if !ids.insert(node.id) {
        return Err(ConfigError::Duplicate(node.id));
      }
      check_width(node.id, "name", &node.name(), NAME_WIDTH)?;
      check_width(node.id, "address", &node.address, ADDR_WIDTH)?;
    }
    if !ids.contains(&self.local) {
      return Err(ConfigError::MissingLocal(self.local));
    }
    check_width(self.local, "software_load", &self.software_load, SWLOAD_WIDTH)?;
    if self.hb_interval == Duration::from_secs(0) {
      return Err(ConfigError::Zero("hb_interval"));
    }
    if self.max_missed == 0 {
      return Err(ConfigError::Zero("max_missed"));
    }
    if self.subscriber_capacity == 0 {
      return Err(ConfigError::Zero("subscriber_capacity"));
    }
    Ok(())
  }

  pub fn node(&self, id: NodeId) -> Option<&NodeConfig> {
    self.nodes.iter().find(|n| n.id == id)
  }

  pub fn local_node(&self) -> Option<&NodeConfig> {
    self.node(self.local)
  }

  /// How long a node may stay silent before it is declared not alive.
  pub fn timeout(&self) -> Duration {
    self.hb_interval * self.max_missed
  }

  pub fn election_delay(&self) -> Duration {
    self.election_delay.unwrap_or(self.hb_interval * 2)
  }

  pub fn discovery_window(&self) -> Duration {
    self.discovery_window.unwrap_or(self.hb_interval * 2)
  }

  pub fn reconnect_min(&self) -> Duration {
    self.reconnect_min.unwrap_or(self.hb_interval)
  }

  pub fn reconnect_max(&self) -> Duration {
    self.reconnect_max.unwrap_or(self.hb_interval * 8)
  }

  pub fn dedup_window(&self) -> Duration {
    self.dedup_window.unwrap_or(self.hb_interval * 2)
  }

  pub fn min_alive(&self) -> usize {
    self.min_alive.unwrap_or(self.nodes.len() / 2 + 1)
  }

  pub fn quorum_disks(&self) -> u32 {
    self
      .quorum_disks
      .unwrap_or(self.nodes.len() as u32 * self.disks_per_node / 2 + 1)
  }

  /// The configured incarnation, or one derived from the wall clock. Always fits the wire's
  /// non-negative int.
  pub fn resolved_incarnation(&self) -> u32 {
    self.incarnation.unwrap_or_else(|| {
      let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(1);
      (secs & i32::MAX as u64) as u32
    }) & i32::MAX as u32
  }
}

fn check_width(id: NodeId, field: &'static str, s: &str, width: usize) -> Result<(), ConfigError> {
  if s.len() >= width {
    return Err(ConfigError::TooLong {
      id: id,
      field: field,
      max: width - 1,
    });
  }
  Ok(())
}

#[cfg(test)]
fn four_nodes() -> ClusterConfig {
  ClusterConfig::new(
    101,
    (101..=104)
      .map(|id| NodeConfig::new(id, format!("127.0.0.1:{}", 7000 + id)))
      .collect(),
  )
}

#[test]
fn test_derived_defaults() {
  let config = four_nodes();
  config.validate().unwrap();
  assert_eq!(config.timeout(), Duration::from_millis(2500));
  assert_eq!(config.election_delay(), Duration::from_secs(1));
  assert_eq!(config.min_alive(), 3);
  assert_eq!(config.quorum_disks(), 9);
  assert_eq!(config.nodes[1].name(), "node-102");
}

#[test]
fn test_validation() {
  let mut config = four_nodes();
  config.nodes.push(NodeConfig::new(103, "127.0.0.1:1"));
  assert_eq!(config.validate(), Err(ConfigError::Duplicate(NodeId(103))));

  let mut config = four_nodes();
  config.local = NodeId(105);
  assert_eq!(config.validate(), Err(ConfigError::MissingLocal(NodeId(105))));

  let mut config = four_nodes();
  config.nodes[0].name = Some("x".repeat(NAME_WIDTH));
  assert!(matches!(
    config.validate(),
    Err(ConfigError::TooLong { field: "name", .. })
  ));

  assert_eq!(ClusterConfig::default().validate(), Err(ConfigError::NoNodes));
}

#[test]
fn test_json_defaults() {
  let config: ClusterConfig = serde_json::from_str(
    r#"{
      "local": 102,
      "nodes": [
        {"id": 101, "address": "10.0.0.1:7001"},
        {"id": 102, "address": "10.0.0.2:7001", "name": "hcb102"}
      ],
      "max_missed": 3
    }"#,
  )
  .unwrap();
  config.validate().unwrap();
  assert_eq!(config.local, NodeId(102));
  assert_eq!(config.max_missed, 3);
  assert_eq!(config.hb_interval, Duration::from_millis(500));
  assert_eq!(config.node(NodeId(102)).unwrap().name(), "hcb102");
  assert_eq!(config.min_alive(), 2);
}
