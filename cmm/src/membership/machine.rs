use crate::config::ClusterConfig;
use crate::core::{Direction, NodeId, Route};
use crate::error::{CmmError, ConfigError};
use crate::frame::NodeChangeCause::*;
use crate::frame::{
  CNodeInfo, ConfigChange, ConfigChangeNotif, ConfigNotifCause, ConfigStatus, Destination,
  Discovery, Election, Frame, Heartbeat, InfoRequest, Message, NodeChange, NodeChangeCause,
  NodeInfo, SFlags,
};
use crate::membership::election::{accepts_claim, rightful_master, rightful_vice_master};
use crate::membership::{ConfigStore, ConfigUpdate, Freshness, PeerTracker, SeenCache};
use crate::notify::Notification;
use crate::table::{ClusterValidity, NodeTable, Presence};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Something the membership core reacts to.
#[derive(Clone, Debug)]
pub enum Input {
  /// The heartbeat timer fired.
  Tick,
  /// A frame arrived on a ring link. `from` is the link it arrived on.
  Frame { frame: Frame, from: Direction },
  /// A ring link to `peer` completed its handshake.
  LinkUp { peer: NodeId, incarnation: u32 },
  /// The link to a ring neighbour failed.
  LinkDown { peer: NodeId },
  /// The number of healthy local disks changed.
  SetActiveDisks(u32),
  /// The local node is leaving the cluster.
  Leave,
}

/// A snapshot answer received from another node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InfoReply {
  Node(NodeInfo),
  CNode(CNodeInfo),
}
impl InfoReply {
  pub fn request(&self) -> InfoRequest {
    match self {
      InfoReply::Node(i) => i.request,
      InfoReply::CNode(i) => i.request,
    }
  }

  pub fn given(&self) -> Option<NodeId> {
    match self {
      InfoReply::Node(i) => i.given,
      InfoReply::CNode(i) => i.given,
    }
  }

  pub fn is_legacy(&self) -> bool {
    matches!(self, InfoReply::CNode(_))
  }
}

/// What the membership core asks its runner to do.
#[derive(Clone, Debug)]
pub enum Effect {
  Send { frame: Frame, route: Route },
  Notify(Notification),
  /// The node is alive again; the transport may want it as a neighbour.
  Reachable(NodeId),
  /// The node stopped heartbeating; the transport should stop relying on its link.
  Unreachable(NodeId),
  /// A response to a query this node sent.
  InfoReply { from: NodeId, reply: InfoReply },
}

/// The membership state machine of one node.
///
/// It owns the [`NodeTable`] and mutates it only in response to [`Input`]s. It performs no I/O
/// and reads no clock; the caller passes the current instant and carries out the returned
/// [`Effect`]s.
pub struct Membership {
  config: Arc<ClusterConfig>,
  table: NodeTable,
  peers: HashMap<NodeId, PeerTracker>,
  seen: SeenCache,
  store: Box<dyn ConfigStore>,
  incarnation: u32,
  sequence: u64,
  started: Instant,
  master_contest: Option<Instant>,
  vice_contest: Option<Instant>,
  left: bool,
}
impl Membership {
  pub fn new(
    config: Arc<ClusterConfig>,
    store: Box<dyn ConfigStore>,
    now: Instant,
  ) -> Result<Membership, ConfigError> {
    let incarnation = config.resolved_incarnation();
    let table = NodeTable::new(&config, incarnation)?;
    Ok(Membership {
      seen: SeenCache::new(config.dedup_window()),
      config: config,
      table: table,
      peers: HashMap::new(),
      store: store,
      incarnation: incarnation,
      sequence: 0,
      started: now,
      master_contest: None,
      vice_contest: None,
      left: false,
    })
  }

  pub fn table(&self) -> &NodeTable {
    &self.table
  }

  pub fn local(&self) -> NodeId {
    self.table.local_id()
  }

  pub fn incarnation(&self) -> u32 {
    self.incarnation
  }

  pub fn config(&self) -> &ClusterConfig {
    &self.config
  }

  pub fn config_store(&self) -> &dyn ConfigStore {
    &*self.store
  }

  pub fn has_left(&self) -> bool {
    self.left
  }

  pub fn handle(&mut self, input: Input, now: Instant) -> Vec<Effect> {
    let mut out = Vec::new();
    if self.left {
      return out;
    }
    match input {
      Input::Tick => self.tick(now, &mut out),
      Input::Frame { frame, from } => self.on_frame(frame, from, now, &mut out),
      Input::LinkUp { peer, incarnation } => self.on_link_up(peer, incarnation),
      Input::LinkDown { peer } => self.on_link_down(peer, &mut out),
      Input::SetActiveDisks(disks) => self.set_active_disks(disks, &mut out),
      Input::Leave => {
        info!(node = %self.local(), "leaving the cluster");
        let leave = NodeChange::new(MemberLeft, self.local());
        self.broadcast(leave, &mut out);
        self.left = true;
        return out;
      }
    }
    self.reconcile(now, &mut out);
    out
  }

  /// Applies a configuration update locally and broadcasts it. Refused without quorum.
  pub fn update_config(
    &mut self,
    update: ConfigUpdate,
    now: Instant,
    out: &mut Vec<Effect>,
  ) -> Result<(), CmmError> {
    self.reconcile(now, out);
    let local = self.local();
    if !self.table.has_quorum() {
      warn!(node = %local, file = ?update.file, "configuration update refused: no quorum");
      self.notify_config(ConfigNotifCause::ConfigFailed, local, update, out);
      return Err(CmmError::NoQuorum);
    }
    if let Err(e) = self.store.apply(&update) {
      warn!(node = %local, file = ?update.file, error = %e, "configuration update refused");
      self.notify_config(ConfigNotifCause::ConfigFailed, local, update, out);
      return Err(e.into());
    }
    info!(node = %local, file = ?update.file, version = update.version, "configuration updated");
    self.notify_config(ConfigNotifCause::ConfigUpdated, local, update, out);
    let change = ConfigChange {
      source: local,
      file: update.file,
      clear_mode: update.clear_mode,
      version: Some(update.version),
      md5: update.md5,
      status: ConfigStatus::Pending,
      error_code: 0,
    };
    self.broadcast(change, out);
    Ok(())
  }

  /// Builds the frame asking `node` for a snapshot.
  pub fn query(
    &self,
    node: NodeId,
    request: InfoRequest,
    given: Option<NodeId>,
    legacy: bool,
  ) -> Effect {
    let message: Message = if legacy {
      CNodeInfo::query(request, given).into()
    } else {
      NodeInfo::query(request, given).into()
    };
    Effect::Send {
      frame: Frame::new(self.local(), Destination::Node(node), message),
      route: Route::Both,
    }
  }

  fn tick(&mut self, now: Instant, out: &mut Vec<Effect>) {
    self.sequence += 1;
    let local = self.table.local_node();
    let hb = Heartbeat {
      incarnation: self.incarnation,
      sequence: self.sequence,
      flags: local.sflags(),
      active_disks: local.active_disks,
    };
    self.broadcast(hb, out);

    let timeout = self.config.timeout();
    let silent = self
      .table
      .alive()
      .filter(|n| n.id != self.local())
      .filter(|n| {
        self
          .peers
          .get(&n.id)
          .map_or(true, |t| t.silent_for(now) >= timeout)
      })
      .map(|n| n.id)
      .collect::<Vec<_>>();
    for id in silent {
      warn!(
        node = %self.local(),
        peer = %id,
        missed = self.config.max_missed,
        "no heartbeat within timeout, declaring node dead"
      );
      self.depart(id, out);
      out.push(Effect::Unreachable(id));
    }
    self.seen.expire(now);
  }

  fn on_frame(&mut self, frame: Frame, from: Direction, now: Instant, out: &mut Vec<Effect>) {
    let local = self.local();
    if frame.source == local {
      trace!(node = %local, "frame returned to its origin");
      return;
    }
    if self.table.node(frame.source).is_none() {
      warn!(node = %local, source = %frame.source, "frame from an unconfigured node dropped");
      return;
    }
    let (consume, forward) = match frame.destination {
      Destination::Broadcast => (true, true),
      Destination::Peer => (true, false),
      Destination::Node(id) => (id == local, id != local),
    };
    let fresh = match &frame.message {
      Message::Heartbeat(hb) => {
        let tracker = self
          .peers
          .entry(frame.source)
          .or_insert_with(|| PeerTracker::new(now));
        tracker.observe(hb.incarnation, hb.sequence, now)
      }
      _ if self.seen.insert(frame.digest(), from, now) => Freshness::Fresh,
      _ => Freshness::Stale,
    };
    if fresh == Freshness::Stale {
      trace!(node = %local, source = %frame.source, "stale or duplicate frame dropped");
      return;
    }
    if forward {
      out.push(Effect::Send {
        frame: frame.clone(),
        route: Route::Toward(from.opposite()),
      });
    }
    if !consume {
      return;
    }
    let source = frame.source;
    match frame.message {
      Message::Heartbeat(hb) => self.on_heartbeat(source, hb, fresh, out),
      Message::Election(e) => self.on_election(source, e, out),
      Message::Discovery(d) => self.on_discovery(source, d),
      Message::NodeChange(c) => self.on_node_change(source, c, now, out),
      Message::NodeInfo(q) if q.response => out.push(Effect::InfoReply {
        from: source,
        reply: InfoReply::Node(q),
      }),
      Message::NodeInfo(q) => {
        let answer = self.table.node_info(q.request, q.given);
        self.send_to(source, answer, out);
      }
      Message::CNodeInfo(q) if q.response => out.push(Effect::InfoReply {
        from: source,
        reply: InfoReply::CNode(q),
      }),
      Message::CNodeInfo(q) => {
        let answer = self.table.c_node_info(q.request, q.given);
        self.send_to(source, answer, out);
      }
      Message::ConfigChange(c) => self.on_config_change(source, c, out),
      Message::ConfigChangeNotif(n) => {
        debug!(node = %local, source = %source, cause = ?n.cause, "ignoring relayed notification")
      }
    }
  }

  fn on_heartbeat(&mut self, source: NodeId, hb: Heartbeat, fresh: Freshness, out: &mut Vec<Effect>) {
    let alive = self.table.is_alive(source);
    if fresh == Freshness::NewIncarnation && alive {
      info!(node = %self.local(), peer = %source, incarnation = hb.incarnation, "node restarted");
      self.depart(source, out);
    }
    if !self.table.is_alive(source) {
      self.join(source, &hb, out);
    } else {
      self.refresh(source, &hb, out);
    }
    self.apply_roles(source, &hb, out);
  }

  fn join(&mut self, id: NodeId, hb: &Heartbeat, out: &mut Vec<Effect>) {
    info!(node = %self.local(), peer = %id, incarnation = hb.incarnation, "node joined");
    self.table.set_incarnation(id, hb.incarnation);
    self.table.set_eligible(id, hb.flags.contains(SFlags::ELIGIBLE));
    self.table.set_active_disks(id, hb.active_disks);
    self.table.set_presence(id, Presence::Alive);
    self.notify(MemberJoined, id, out);
    out.push(Effect::Reachable(id));
  }

  fn refresh(&mut self, id: NodeId, hb: &Heartbeat, out: &mut Vec<Effect>) {
    if self.table.set_active_disks(id, hb.active_disks) {
      self.notify(DiskChange, id, out);
    }
    let eligible = hb.flags.contains(SFlags::ELIGIBLE);
    if self.table.set_eligible(id, eligible) {
      self.notify(if eligible { NodeEligible } else { NodeIneligible }, id, out);
    }
  }

  /// Heartbeats repeat the sender's role claims, so roles converge even if an election frame
  /// was lost.
  fn apply_roles(&mut self, source: NodeId, hb: &Heartbeat, out: &mut Vec<Effect>) {
    let holds_master = self.table.master_id() == Some(source);
    match (hb.flags.contains(SFlags::MASTER), holds_master) {
      (true, false) => {
        self.master_claim(source, out);
      }
      (false, true) => self.master_release(source, out),
      _ => {}
    }
    let holds_vice = self.table.vice_master_id() == Some(source);
    match (hb.flags.contains(SFlags::VICEMASTER), holds_vice) {
      (true, false) => {
        self.vice_claim(source, out);
      }
      (false, true) => self.vice_release(source, out),
      _ => {}
    }
  }

  fn on_election(&mut self, source: NodeId, e: Election, out: &mut Vec<Effect>) {
    if e.node != source || !self.table.is_alive(source) {
      debug!(node = %self.local(), source = %source, "election frame from a non-member ignored");
      return;
    }
    let incarnation = self.peers.get(&source).map(PeerTracker::incarnation);
    if incarnation != Some(e.incarnation) {
      debug!(node = %self.local(), source = %source, "election frame from an old incarnation");
      return;
    }
    if let Some(tracker) = self.peers.get_mut(&source) {
      tracker.raise(e.incarnation, e.sequence);
    }
    match e.cause {
      MasterElected => {
        self.master_claim(source, out);
      }
      MasterDemoted => self.master_release(source, out),
      ViceMasterElected => {
        self.vice_claim(source, out);
      }
      ViceMasterDemoted => self.vice_release(source, out),
      _ => {}
    }
  }

  fn on_discovery(&mut self, source: NodeId, d: Discovery) {
    if matches!(
      self.table.node(source).map(|n| n.presence),
      Some(Presence::Unknown) | Some(Presence::Left)
    ) {
      debug!(node = %self.local(), peer = %source, address = %d.address, "node discovered");
      self.table.set_presence(source, Presence::Joining);
    }
  }

  fn on_node_change(&mut self, source: NodeId, c: NodeChange, now: Instant, out: &mut Vec<Effect>) {
    let node = match c.node {
      Some(node) => node,
      None => return,
    };
    match c.cause {
      MemberLeft if node == self.local() => {
        info!(node = %node, reporter = %source, "reported as left, heartbeats will correct it")
      }
      MemberLeft if node == source => {
        let incarnation = self.table.node(node).map_or(0, |n| n.incarnation);
        self
          .peers
          .entry(node)
          .or_insert_with(|| PeerTracker::new(now))
          .depart(incarnation);
        info!(node = %self.local(), peer = %node, "node left gracefully");
        self.depart(node, out);
      }
      MemberLeft => {
        info!(node = %self.local(), peer = %node, reporter = %source, "node lost its ring link");
        self.depart(node, out);
      }
      cause => debug!(node = %self.local(), cause = ?cause, "ignoring relayed node change"),
    }
  }

  fn on_config_change(&mut self, source: NodeId, c: ConfigChange, out: &mut Vec<Effect>) {
    let local = self.local();
    match c.status {
      ConfigStatus::Pending => {
        let update = match ConfigUpdate::from_change(&c) {
          Some(update) => update,
          None => return,
        };
        let result = if self.table.has_quorum() {
          self.store.apply(&update).map_err(|e| e.code())
        } else {
          Err(crate::error::ConfigApplyError::NO_QUORUM)
        };
        let reply = match result {
          Ok(()) => {
            info!(node = %local, origin = %source, file = ?c.file, "configuration updated");
            self.notify_config(ConfigNotifCause::ConfigUpdated, local, update, out);
            c.reply(ConfigStatus::Success, 0)
          }
          Err(code) => {
            warn!(node = %local, origin = %source, file = ?c.file, code = code, "configuration update failed");
            self.notify_config(ConfigNotifCause::ConfigFailed, local, update, out);
            c.reply(ConfigStatus::Failure, code)
          }
        };
        self.send_to(c.source, reply, out);
      }
      ConfigStatus::Failure => {
        warn!(node = %local, peer = %source, code = c.error_code, "peer failed to apply configuration");
        if let Some(update) = ConfigUpdate::from_change(&c) {
          self.notify_config(ConfigNotifCause::ConfigFailed, source, update, out);
        }
      }
      ConfigStatus::Success => {
        debug!(node = %local, peer = %source, file = ?c.file, "peer applied configuration")
      }
    }
  }

  fn on_link_up(&mut self, peer: NodeId, incarnation: u32) {
    if matches!(
      self.table.node(peer).map(|n| n.presence),
      Some(Presence::Unknown) | Some(Presence::Left)
    ) {
      debug!(node = %self.local(), peer = %peer, incarnation = incarnation, "ring link up");
      self.table.set_presence(peer, Presence::Joining);
    }
  }

  fn on_link_down(&mut self, peer: NodeId, out: &mut Vec<Effect>) {
    if self.table.is_alive(peer) {
      warn!(node = %self.local(), peer = %peer, "ring link lost, declaring neighbour left");
      self.depart(peer, out);
      self.broadcast(NodeChange::new(MemberLeft, peer), out);
    }
  }

  fn set_active_disks(&mut self, disks: u32, out: &mut Vec<Effect>) {
    let local = self.local();
    if self.table.set_active_disks(local, disks) {
      info!(node = %local, disks = disks, "active disk count changed");
      self.notify(DiskChange, local, out);
    }
    let eligible = disks >= self.config.min_eligible_disks;
    if self.table.set_eligible(local, eligible) {
      self.notify(if eligible { NodeEligible } else { NodeIneligible }, local, out);
    }
  }

  /// Marks a node as gone. Role releases are notified before the departure itself.
  fn depart(&mut self, id: NodeId, out: &mut Vec<Effect>) {
    if !self.table.is_alive(id) {
      return;
    }
    if self.table.master_id() == Some(id) {
      self.table.set_master(None);
      self.notify(MasterDemoted, id, out);
    }
    if self.table.vice_master_id() == Some(id) {
      self.table.set_vice_master(None);
      self.notify(ViceMasterDemoted, id, out);
    }
    self.table.set_presence(id, Presence::Left);
    self.notify(MemberLeft, id, out);
  }

  /// Applies a master claim. Returns whether the claimant holds the role afterwards.
  fn master_claim(&mut self, claimant: NodeId, out: &mut Vec<Effect>) -> bool {
    let holder = self.table.master_id();
    if holder == Some(claimant) {
      return true;
    }
    if !accepts_claim(holder, claimant) {
      debug!(node = %self.local(), claimant = %claimant, "master claim ignored, a lower id holds the role");
      return false;
    }
    if let Some(holder) = holder {
      if holder == self.local() {
        info!(node = %holder, claimant = %claimant, "demoting self in favour of a lower id");
      }
      self.table.set_master(None);
      self.notify(MasterDemoted, holder, out);
    }
    if self.table.vice_master_id() == Some(claimant) {
      self.table.set_vice_master(None);
      self.notify(ViceMasterDemoted, claimant, out);
    }
    self.table.set_master(Some(claimant));
    info!(node = %self.local(), master = %claimant, "master elected");
    self.notify(MasterElected, claimant, out);
    true
  }

  fn master_release(&mut self, id: NodeId, out: &mut Vec<Effect>) {
    if self.table.master_id() == Some(id) {
      self.table.set_master(None);
      self.notify(MasterDemoted, id, out);
    }
  }

  fn vice_claim(&mut self, claimant: NodeId, out: &mut Vec<Effect>) -> bool {
    let holder = self.table.vice_master_id();
    if holder == Some(claimant) {
      return true;
    }
    if self.table.master_id() == Some(claimant) || !accepts_claim(holder, claimant) {
      debug!(node = %self.local(), claimant = %claimant, "vice-master claim ignored");
      return false;
    }
    if let Some(holder) = holder {
      self.table.set_vice_master(None);
      self.notify(ViceMasterDemoted, holder, out);
    }
    self.table.set_vice_master(Some(claimant));
    info!(node = %self.local(), vice_master = %claimant, "vice-master elected");
    self.notify(ViceMasterElected, claimant, out);
    true
  }

  fn vice_release(&mut self, id: NodeId, out: &mut Vec<Effect>) {
    if self.table.vice_master_id() == Some(id) {
      self.table.set_vice_master(None);
      self.notify(ViceMasterDemoted, id, out);
    }
  }

  /// Re-derives validity and quorum, then runs the local side of the election.
  fn reconcile(&mut self, now: Instant, out: &mut Vec<Effect>) {
    let local = self.local();
    let validity = if now.saturating_duration_since(self.started) < self.config.discovery_window() {
      ClusterValidity::Stale
    } else if self.table.alive_count() >= self.config.min_alive() {
      ClusterValidity::Valid
    } else {
      ClusterValidity::Invalid
    };
    if self.table.set_validity(validity) {
      info!(node = %local, validity = ?validity, alive = self.table.alive_count(), "cluster validity changed");
      let cause = match validity {
        ClusterValidity::Stale => StaleCluster,
        ClusterValidity::Invalid => InvalidCluster,
        ClusterValidity::Valid => ValidCluster,
      };
      self.notify(cause, local, out);
    }
    let quorum = validity == ClusterValidity::Valid
      && self.table.alive_disks() >= self.config.quorum_disks();
    if self.table.set_quorum(quorum) {
      info!(node = %local, quorum = quorum, disks = self.table.alive_disks(), "quorum changed");
      self.notify(if quorum { GainedQuorum } else { LostQuorum }, local, out);
    }

    if !self.table.local_node().eligible {
      self.master_contest = None;
      self.vice_contest = None;
      if self.table.master_id() == Some(local) {
        info!(node = %local, "ineligible, releasing master");
        self.master_release(local, out);
        self.announce(MasterDemoted, out);
      }
      if self.table.vice_master_id() == Some(local) {
        info!(node = %local, "ineligible, releasing vice-master");
        self.vice_release(local, out);
        self.announce(ViceMasterDemoted, out);
      }
      return;
    }
    if validity != ClusterValidity::Valid {
      self.master_contest = None;
      self.vice_contest = None;
      return;
    }

    let delay = self.config.election_delay();
    let master = self.table.master_id();
    if rightful_master(&self.table) == Some(local) && master != Some(local) {
      let promoted = master.is_none() && self.table.vice_master_id() == Some(local);
      let since = *self.master_contest.get_or_insert(now);
      if promoted || now.saturating_duration_since(since) >= delay {
        self.master_contest = None;
        if self.master_claim(local, out) {
          self.announce(MasterElected, out);
        }
      }
    } else {
      self.master_contest = None;
    }

    let master = self.table.master_id();
    let wants_vice = master.is_some()
      && master != Some(local)
      && rightful_vice_master(&self.table) == Some(local)
      && self.table.vice_master_id() != Some(local);
    if wants_vice {
      let since = *self.vice_contest.get_or_insert(now);
      if now.saturating_duration_since(since) >= delay {
        self.vice_contest = None;
        if self.vice_claim(local, out) {
          self.announce(ViceMasterElected, out);
        }
      }
    } else {
      self.vice_contest = None;
    }
    debug_assert!(self.table.roles_consistent());
  }

  /// Broadcasts a role change of the local node.
  fn announce(&mut self, cause: NodeChangeCause, out: &mut Vec<Effect>) {
    let election = Election {
      cause: cause,
      node: self.local(),
      incarnation: self.incarnation,
      sequence: self.sequence,
    };
    self.broadcast(election, out);
  }

  fn broadcast<M: Into<Message>>(&self, msg: M, out: &mut Vec<Effect>) {
    out.push(Effect::Send {
      frame: Frame::new(self.local(), Destination::Broadcast, msg),
      route: Route::Both,
    });
  }

  fn send_to<M: Into<Message>>(&self, dest: NodeId, msg: M, out: &mut Vec<Effect>) {
    out.push(Effect::Send {
      frame: Frame::new(self.local(), Destination::Node(dest), msg),
      route: Route::Both,
    });
  }

  fn notify(&self, cause: NodeChangeCause, id: NodeId, out: &mut Vec<Effect>) {
    out.push(Effect::Notify(NodeChange::new(cause, id).into()));
  }

  fn notify_config(
    &self,
    cause: ConfigNotifCause,
    node: NodeId,
    update: ConfigUpdate,
    out: &mut Vec<Effect>,
  ) {
    let notif = ConfigChangeNotif {
      cause: cause,
      node: node,
      file: update.file,
    };
    out.push(Effect::Notify(notif.into()));
  }
}

#[cfg(test)]
const HB: std::time::Duration = std::time::Duration::from_millis(100);

#[cfg(test)]
fn machine(local: u16, ids: &[u16]) -> (Membership, Instant) {
  use crate::config::NodeConfig;
  use crate::membership::MemoryConfigStore;
  let nodes = ids
    .iter()
    .map(|id| NodeConfig::new(*id, format!("127.0.0.1:{}", 7000 + id)))
    .collect();
  let mut config = ClusterConfig::new(local, nodes);
  config.hb_interval = HB;
  config.incarnation = Some(1);
  let now = Instant::now();
  let store = Box::new(MemoryConfigStore::new());
  (Membership::new(Arc::new(config), store, now).unwrap(), now)
}

#[cfg(test)]
fn heartbeat(source: u16, incarnation: u32, sequence: u64) -> Input {
  let hb = Heartbeat {
    incarnation: incarnation,
    sequence: sequence,
    flags: SFlags::default().with(SFlags::ELIGIBLE, true),
    active_disks: 4,
  };
  Input::Frame {
    frame: Frame::new(NodeId(source), Destination::Broadcast, hb),
    from: Direction::Left,
  }
}

#[cfg(test)]
fn changes(effects: &[Effect]) -> Vec<(NodeChangeCause, u16)> {
  effects
    .iter()
    .filter_map(|e| match e {
      Effect::Notify(Notification::Node(NodeChange {
        cause,
        node: Some(node),
      })) => Some((*cause, node.0)),
      _ => None,
    })
    .collect()
}

#[cfg(test)]
fn sent(effects: &[Effect]) -> Vec<(&Message, Route)> {
  effects
    .iter()
    .filter_map(|e| match e {
      Effect::Send { frame, route } => Some((&frame.message, *route)),
      _ => None,
    })
    .collect()
}

#[test]
fn test_heartbeat_joins_once_and_is_forwarded() {
  let (mut m, t0) = machine(101, &[101, 102, 103]);
  let effects = m.handle(heartbeat(102, 1, 1), t0);
  assert_eq!(changes(&effects), vec![(MemberJoined, 102)]);
  assert!(matches!(
    sent(&effects)[..],
    [(Message::Heartbeat(_), Route::Toward(Direction::Right))]
  ));
  assert!(effects
    .iter()
    .any(|e| matches!(e, Effect::Reachable(NodeId(102)))));
  assert!(m.handle(heartbeat(102, 1, 1), t0).is_empty());
  assert!(m.table().is_alive(NodeId(102)));
}

#[test]
fn test_two_missed_heartbeats_keep_node_alive() {
  let (mut m, t0) = machine(101, &[101, 102, 103]);
  let mut seq = 0;
  for step in 1..=7u32 {
    let now = t0 + HB * step;
    if step != 3 && step != 4 {
      seq += 1;
      let effects = m.handle(heartbeat(102, 1, seq), now);
      assert!(!changes(&effects).contains(&(MemberLeft, 102)));
    }
    let effects = m.handle(Input::Tick, now);
    assert!(!changes(&effects).contains(&(MemberLeft, 102)));
  }
  assert!(m.table().is_alive(NodeId(102)));

  let mut left = Vec::new();
  for step in 8..=13u32 {
    left.extend(m.handle(Input::Tick, t0 + HB * step));
  }
  assert!(changes(&left).contains(&(MemberLeft, 102)));
  assert!(left
    .iter()
    .any(|e| matches!(e, Effect::Unreachable(NodeId(102)))));
  assert!(!m.table().is_alive(NodeId(102)));
}

#[test]
fn test_graceful_leave_ignores_late_heartbeats() {
  let (mut m, t0) = machine(101, &[101, 102, 103]);
  m.handle(heartbeat(102, 7, 1), t0);
  let leave = Input::Frame {
    frame: Frame::new(
      NodeId(102),
      Destination::Broadcast,
      NodeChange::new(MemberLeft, NodeId(102)),
    ),
    from: Direction::Left,
  };
  let effects = m.handle(leave, t0 + HB);
  assert_eq!(changes(&effects), vec![(MemberLeft, 102)]);

  let effects = m.handle(heartbeat(102, 7, 2), t0 + HB * 2);
  assert!(!changes(&effects).contains(&(MemberJoined, 102)));
  assert!(!m.table().is_alive(NodeId(102)));

  let effects = m.handle(heartbeat(102, 8, 1), t0 + HB * 3);
  assert!(changes(&effects).contains(&(MemberJoined, 102)));
}

#[test]
fn test_config_update_needs_quorum() {
  use crate::frame::{ConfigFile, Md5Sum};
  let (mut m, t0) = machine(101, &[101, 102, 103]);
  let update = ConfigUpdate {
    file: ConfigFile::Cluster,
    version: 3,
    md5: Md5Sum([7; 16]),
    clear_mode: false,
  };
  let mut out = Vec::new();
  assert!(matches!(
    m.update_config(update, t0, &mut out),
    Err(CmmError::NoQuorum)
  ));
  assert!(sent(&out).is_empty());
  assert!(out.iter().any(|e| matches!(
    e,
    Effect::Notify(Notification::Config(ConfigChangeNotif {
      cause: ConfigNotifCause::ConfigFailed,
      ..
    }))
  )));

  m.handle(heartbeat(102, 1, 1), t0 + HB * 3);
  assert!(m.table().has_quorum());
  let mut out = Vec::new();
  m.update_config(update, t0 + HB * 3, &mut out).unwrap();
  assert!(matches!(
    sent(&out)[..],
    [(Message::ConfigChange(ConfigChange { status: ConfigStatus::Pending, .. }), Route::Both)]
  ));
  assert_eq!(
    m.config_store().installed(ConfigFile::Cluster),
    Some((3, Md5Sum([7; 16])))
  );
}

#[test]
fn test_lower_id_claim_demotes_sitting_master() {
  let (mut m, t0) = machine(102, &[101, 102, 103]);
  m.handle(heartbeat(103, 1, 1), t0);
  m.handle(heartbeat(103, 1, 2), t0 + HB * 3);
  m.handle(Input::Tick, t0 + HB * 3);
  let mut effects = m.handle(heartbeat(103, 1, 3), t0 + HB * 6);
  effects.extend(m.handle(Input::Tick, t0 + HB * 6));
  assert!(changes(&effects).contains(&(MasterElected, 102)));
  assert!(sent(&effects)
    .iter()
    .any(|(msg, _)| matches!(msg, Message::Election(Election { cause: MasterElected, .. }))));
  assert_eq!(m.table().master_id(), Some(NodeId(102)));

  m.handle(heartbeat(101, 1, 1), t0 + HB * 7);
  let claim = Input::Frame {
    frame: Frame::new(
      NodeId(101),
      Destination::Broadcast,
      Election {
        cause: MasterElected,
        node: NodeId(101),
        incarnation: 1,
        sequence: 1,
      },
    ),
    from: Direction::Right,
  };
  let effects = m.handle(claim, t0 + HB * 7);
  assert_eq!(
    changes(&effects)[..2],
    [(MasterDemoted, 102), (MasterElected, 101)]
  );
  assert_eq!(m.table().master_id(), Some(NodeId(101)));
  assert!(m.table().roles_consistent());
}

#[test]
fn test_ineligible_master_releases_role() {
  let (mut m, t0) = machine(101, &[101, 102]);
  m.handle(heartbeat(102, 1, 1), t0);
  m.handle(heartbeat(102, 1, 2), t0 + HB * 3);
  m.handle(Input::Tick, t0 + HB * 3);
  m.handle(heartbeat(102, 1, 3), t0 + HB * 6);
  m.handle(Input::Tick, t0 + HB * 6);
  assert_eq!(m.table().master_id(), Some(NodeId(101)));

  let effects = m.handle(Input::SetActiveDisks(0), t0 + HB * 6);
  assert_eq!(
    changes(&effects),
    vec![
      (DiskChange, 101),
      (NodeIneligible, 101),
      (LostQuorum, 101),
      (MasterDemoted, 101),
    ]
  );
  assert!(sent(&effects)
    .iter()
    .any(|(msg, _)| matches!(msg, Message::Election(Election { cause: MasterDemoted, .. }))));
  assert_eq!(m.table().master_id(), None);
}

#[test]
fn test_link_down_departs_and_reports() {
  let (mut m, t0) = machine(101, &[101, 102, 103]);
  m.handle(heartbeat(102, 1, 1), t0);
  let effects = m.handle(Input::LinkDown { peer: NodeId(102) }, t0);
  assert_eq!(changes(&effects), vec![(MemberLeft, 102)]);
  assert!(matches!(
    sent(&effects)[..],
    [(Message::NodeChange(NodeChange { cause: MemberLeft, node: Some(NodeId(102)) }), Route::Both)]
  ));
  assert!(m.handle(Input::LinkDown { peer: NodeId(102) }, t0).is_empty());
}

#[test]
fn test_own_frames_and_leave() {
  let (mut m, t0) = machine(101, &[101, 102]);
  assert!(m.handle(heartbeat(101, 1, 99), t0).is_empty());
  let effects = m.handle(Input::Leave, t0);
  assert!(m.has_left());
  assert!(matches!(
    sent(&effects)[..],
    [(Message::NodeChange(NodeChange { cause: MemberLeft, node: Some(NodeId(101)) }), Route::Both)]
  ));
  assert!(m.handle(heartbeat(102, 1, 1), t0).is_empty());
}

#[cfg(test)]
fn answers(effects: &[Effect]) -> usize {
  sent(effects)
    .iter()
    .filter(|(msg, _)| matches!(msg, Message::NodeInfo(i) if i.response))
    .count()
}

#[test]
fn test_repeated_query_is_answered_each_time() {
  let (mut m, t0) = machine(102, &[101, 102, 103]);
  let query = |from| Input::Frame {
    frame: Frame::new(
      NodeId(101),
      Destination::Node(NodeId(102)),
      NodeInfo::query(InfoRequest::Me, None),
    ),
    from: from,
  };
  assert_eq!(answers(&m.handle(query(Direction::Left), t0 + HB)), 1);
  assert_eq!(answers(&m.handle(query(Direction::Right), t0 + HB)), 0);
  assert_eq!(answers(&m.handle(query(Direction::Left), t0 + HB * 2)), 1);
  assert_eq!(answers(&m.handle(query(Direction::Left), t0 + HB * 2)), 1);
  assert_eq!(answers(&m.handle(query(Direction::Right), t0 + HB * 2)), 0);

  let (mut asker, t0) = machine(101, &[101, 102, 103]);
  let reply = Input::Frame {
    frame: Frame::new(
      NodeId(102),
      Destination::Node(NodeId(101)),
      m.table().node_info(InfoRequest::Me, None),
    ),
    from: Direction::Right,
  };
  let replies = |effects: Vec<Effect>| {
    effects
      .iter()
      .filter(|e| matches!(e, Effect::InfoReply { from: NodeId(102), .. }))
      .count()
  };
  assert_eq!(replies(asker.handle(reply.clone(), t0 + HB)), 1);
  assert_eq!(replies(asker.handle(reply, t0 + HB * 2)), 1);
}

#[cfg(test)]
fn config_change(version: u64, status: ConfigStatus, error_code: i32) -> ConfigChange {
  use crate::frame::{ConfigFile, Md5Sum};
  ConfigChange {
    source: NodeId(101),
    file: ConfigFile::Cluster,
    clear_mode: false,
    version: Some(version),
    md5: Md5Sum([version as u8; 16]),
    status: status,
    error_code: error_code,
  }
}

#[cfg(test)]
fn config_replies(effects: &[Effect]) -> Vec<(NodeId, ConfigStatus, i32)> {
  effects
    .iter()
    .filter_map(|e| match e {
      Effect::Send { frame, .. } => match (&frame.message, frame.destination) {
        (Message::ConfigChange(c), Destination::Node(to)) => Some((to, c.status, c.error_code)),
        _ => None,
      },
      _ => None,
    })
    .collect()
}

#[cfg(test)]
fn config_notes(effects: &[Effect]) -> Vec<(ConfigNotifCause, u16)> {
  effects
    .iter()
    .filter_map(|e| match e {
      Effect::Notify(Notification::Config(n)) => Some((n.cause, n.node.0)),
      _ => None,
    })
    .collect()
}

#[test]
fn test_config_change_failures_are_reported_back() {
  use crate::error::ConfigApplyError;
  let pending = |version| Input::Frame {
    frame: Frame::new(
      NodeId(101),
      Destination::Broadcast,
      config_change(version, ConfigStatus::Pending, 0),
    ),
    from: Direction::Left,
  };

  let (mut m, t0) = machine(102, &[101, 102, 103]);
  assert!(!m.table().has_quorum());
  let effects = m.handle(pending(5), t0);
  assert_eq!(
    config_replies(&effects),
    vec![(NodeId(101), ConfigStatus::Failure, ConfigApplyError::NO_QUORUM)]
  );
  assert_eq!(config_notes(&effects), vec![(ConfigNotifCause::ConfigFailed, 102)]);

  m.handle(heartbeat(101, 1, 1), t0 + HB * 3);
  assert!(m.table().has_quorum());
  let effects = m.handle(pending(5), t0 + HB * 3);
  assert_eq!(
    config_replies(&effects),
    vec![(NodeId(101), ConfigStatus::Success, 0)]
  );
  assert_eq!(config_notes(&effects), vec![(ConfigNotifCause::ConfigUpdated, 102)]);
  let effects = m.handle(pending(4), t0 + HB * 3);
  assert_eq!(
    config_replies(&effects),
    vec![(NodeId(101), ConfigStatus::Failure, ConfigApplyError::STALE_VERSION)]
  );

  let (mut origin, t0) = machine(101, &[101, 102, 103]);
  let failure = Input::Frame {
    frame: Frame::new(
      NodeId(102),
      Destination::Node(NodeId(101)),
      config_change(4, ConfigStatus::Failure, ConfigApplyError::STALE_VERSION),
    ),
    from: Direction::Right,
  };
  let effects = origin.handle(failure, t0);
  assert_eq!(config_notes(&effects), vec![(ConfigNotifCause::ConfigFailed, 102)]);
  assert!(config_replies(&effects).is_empty());
}
