use crate::config::ClusterConfig;
use crate::core::NodeId;
use crate::error::{CmmError, ConfigError, ProtocolError};
use crate::frame::{CNodeInfo, InfoRequest, NodeInfo};
use crate::membership::{
  Command, ConfigStore, ConfigUpdate, InfoReply, MemoryConfigStore, Membership, Runner,
};
use crate::notify::Subscription;
use crate::ring::RingTransport;
use crate::table::TableSnapshot;
use crate::{admin, notify};
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::info;

const INPUT_QUEUE: usize = 1024;
const COMMAND_QUEUE: usize = 64;

pub struct Cluster;
impl Cluster {
  /// Joins the cluster described by `config`, listening on the local node's configured address.
  pub async fn start(config: ClusterConfig) -> Result<ClusterHandle, CmmError> {
    config.validate()?;
    let address = config
      .local_node()
      .map(|n| n.address.clone())
      .ok_or(ConfigError::MissingLocal(config.local))?;
    let listener = TcpListener::bind(address.as_str()).await?;
    Cluster::start_with(config, listener, Box::new(MemoryConfigStore::new())).await
  }

  /// Like [`start`](Cluster::start), with an already bound ring listener and a custom store.
  pub async fn start_with(
    mut config: ClusterConfig,
    listener: TcpListener,
    store: Box<dyn ConfigStore>,
  ) -> Result<ClusterHandle, CmmError> {
    config.validate()?;
    let incarnation = config.resolved_incarnation();
    config.incarnation = Some(incarnation);
    let config = Arc::new(config);

    let membership = Membership::new(config.clone(), store, Instant::now())?;
    let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
    let (ring, ring_task) = RingTransport::spawn(&config, incarnation, listener, input_tx);
    let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(membership.table().clone()));
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let runner = Runner::new(membership, ring, snapshot_tx);
    let runner_task = tokio::spawn(runner.run(input_rx, command_rx));

    let client = ClusterClient {
      local: config.local,
      commands: command_tx,
      snapshots: snapshot_rx,
    };
    let mut tasks = vec![runner_task, ring_task];
    if let Some(addr) = config.notify_addr {
      let listener = TcpListener::bind(addr).await?;
      tasks.push(tokio::spawn(notify::server::serve(
        listener,
        client.clone(),
        config.write_timeout,
      )));
    }
    if let Some(addr) = config.admin_addr {
      let listener = TcpListener::bind(addr).await?;
      tasks.push(tokio::spawn(admin::serve(listener, client.clone())));
    }
    info!(node = %config.local, incarnation = incarnation, nodes = config.nodes.len(), "node started");
    Ok(ClusterHandle {
      client: client,
      leave_timeout: config.write_timeout + config.connect_timeout,
      tasks: tasks,
    })
  }
}

/// A cheap, cloneable way to talk to a running node.
#[derive(Clone)]
pub struct ClusterClient {
  local: NodeId,
  commands: mpsc::Sender<Command>,
  snapshots: watch::Receiver<TableSnapshot>,
}
impl ClusterClient {
  pub fn local_id(&self) -> NodeId {
    self.local
  }

  /// The latest published table.
  pub fn snapshot(&self) -> TableSnapshot {
    self.snapshots.borrow().clone()
  }

  /// A receiver that sees every published table.
  pub fn watch(&self) -> watch::Receiver<TableSnapshot> {
    self.snapshots.clone()
  }

  /// Registers a subscriber. The returned snapshot and the notifications after it are
  /// consistent: nothing is missed or repeated between them.
  pub async fn subscribe(&self) -> Result<Subscription, CmmError> {
    let (tx, rx) = oneshot::channel();
    self.command(Command::Subscribe(tx)).await?;
    rx.await.map_err(|_| CmmError::Shutdown)
  }

  pub fn node_info(&self, request: InfoRequest, given: Option<NodeId>) -> Result<NodeInfo, CmmError> {
    let snapshot = self.snapshot();
    check_given(&snapshot, request, given)?;
    Ok(snapshot.node_info(request, given))
  }

  pub fn c_node_info(
    &self,
    request: InfoRequest,
    given: Option<NodeId>,
  ) -> Result<CNodeInfo, CmmError> {
    let snapshot = self.snapshot();
    check_given(&snapshot, request, given)?;
    Ok(snapshot.c_node_info(request, given))
  }

  /// Asks `node` for its own view over the ring.
  pub async fn remote_node_info(
    &self,
    node: NodeId,
    request: InfoRequest,
    given: Option<NodeId>,
  ) -> Result<NodeInfo, CmmError> {
    match self.query(node, request, given, false).await? {
      InfoReply::Node(info) => Ok(info),
      InfoReply::CNode(_) => Err(ProtocolError::InvalidValue {
        field: "response",
        value: 1,
      }
      .into()),
    }
  }

  pub async fn remote_c_node_info(
    &self,
    node: NodeId,
    request: InfoRequest,
    given: Option<NodeId>,
  ) -> Result<CNodeInfo, CmmError> {
    match self.query(node, request, given, true).await? {
      InfoReply::CNode(info) => Ok(info),
      InfoReply::Node(_) => Err(ProtocolError::InvalidValue {
        field: "response",
        value: 0,
      }
      .into()),
    }
  }

  /// Reports the local node's usable disk count. Crossing the eligibility threshold changes
  /// the node's role eligibility.
  pub async fn set_active_disks(&self, disks: u32) -> Result<(), CmmError> {
    self.command(Command::SetActiveDisks(disks)).await
  }

  /// Installs a configuration file version locally and propagates it to every member. Refused
  /// without quorum.
  pub async fn update_config(&self, update: ConfigUpdate) -> Result<(), CmmError> {
    let (tx, rx) = oneshot::channel();
    self.command(Command::UpdateConfig(update, tx)).await?;
    rx.await.map_err(|_| CmmError::Shutdown)?
  }

  async fn query(
    &self,
    node: NodeId,
    request: InfoRequest,
    given: Option<NodeId>,
    legacy: bool,
  ) -> Result<InfoReply, CmmError> {
    check_given(&self.snapshot(), request, given)?;
    let (tx, rx) = oneshot::channel();
    self
      .command(Command::Query {
        node: node,
        request: request,
        given: given,
        legacy: legacy,
        reply: tx,
      })
      .await?;
    rx.await.map_err(|_| CmmError::Shutdown)?
  }

  async fn command(&self, cmd: Command) -> Result<(), CmmError> {
    self.commands.send(cmd).await.map_err(|_| CmmError::Shutdown)
  }
}

fn check_given(
  snapshot: &TableSnapshot,
  request: InfoRequest,
  given: Option<NodeId>,
) -> Result<(), CmmError> {
  if request != InfoRequest::GivenNode {
    return Ok(());
  }
  match given {
    None => Err(ProtocolError::Unset("given").into()),
    Some(id) if snapshot.node(id).is_none() => Err(CmmError::UnknownNode(id)),
    Some(_) => Ok(()),
  }
}

/// Owns the tasks of a running node. Dropping it stops the node without announcing a departure;
/// [`leave`](ClusterHandle::leave) announces it first.
pub struct ClusterHandle {
  client: ClusterClient,
  leave_timeout: Duration,
  tasks: Vec<JoinHandle<()>>,
}
impl ClusterHandle {
  pub fn client(&self) -> ClusterClient {
    self.client.clone()
  }

  /// Broadcasts a graceful departure, waits for it to reach the ring links, then stops.
  pub async fn leave(mut self) -> Result<(), CmmError> {
    let (tx, rx) = oneshot::channel();
    self.client.command(Command::Leave(tx)).await?;
    timeout(self.leave_timeout, rx)
      .await
      .map_err(|_| CmmError::Timeout)?
      .map_err(|_| CmmError::Shutdown)?;
    // The runner stops after leaving and tells the transport to stop.
    let mut tasks = std::mem::take(&mut self.tasks).into_iter();
    for task in tasks.by_ref().take(2) {
      let _ = timeout(self.leave_timeout, task).await;
    }
    for task in tasks {
      task.abort();
    }
    Ok(())
  }

  /// Stops the node immediately. Peers see the links drop.
  pub fn shutdown(mut self) {
    for task in self.tasks.drain(..) {
      task.abort();
    }
  }
}
impl Deref for ClusterHandle {
  type Target = ClusterClient;

  fn deref(&self) -> &ClusterClient {
    &self.client
  }
}
impl Drop for ClusterHandle {
  fn drop(&mut self) {
    for task in &self.tasks {
      task.abort();
    }
  }
}
