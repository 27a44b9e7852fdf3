#![allow(dead_code)]

use cmm::core::{Direction, Route};
use cmm::frame::{decode, encode, Frame, NodeChange, NodeChangeCause};
use cmm::membership::{Effect, Input, Membership, MemoryConfigStore};
use cmm::notify::Notification;
use cmm::table::NodeTable;
use cmm::{ClusterConfig, NodeConfig, NodeId};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const HB: Duration = Duration::from_millis(100);

pub fn config(local: u16, ids: &[u16], incarnation: u32) -> ClusterConfig {
  let nodes = ids
    .iter()
    .map(|id| NodeConfig::new(*id, format!("127.0.0.1:{}", 20000 + id)))
    .collect();
  let mut config = ClusterConfig::new(local, nodes);
  config.hb_interval = HB;
  config.incarnation = Some(incarnation);
  config
}

/// A whole ring of membership cores wired together in memory, driven by a manual clock.
/// Frames go through the real codec and travel between neighbours among the nodes that are up.
pub struct SimRing {
  ids: Vec<u16>,
  tweak: fn(&mut ClusterConfig),
  nodes: BTreeMap<u16, Membership>,
  queue: VecDeque<(u16, Frame, Direction)>,
  notes: HashMap<u16, Vec<Notification>>,
  pub now: Instant,
  /// While set, no frame reaches another node.
  pub partitioned: bool,
}
impl SimRing {
  pub fn new(ids: &[u16]) -> SimRing {
    let mut ring = SimRing::empty(ids, |_| {});
    for id in ids {
      ring.boot(*id, 1);
    }
    ring
  }

  /// A ring with no node up yet. `tweak` adjusts every node's config.
  pub fn empty(ids: &[u16], tweak: fn(&mut ClusterConfig)) -> SimRing {
    SimRing {
      ids: ids.to_vec(),
      tweak: tweak,
      nodes: BTreeMap::new(),
      queue: VecDeque::new(),
      notes: HashMap::new(),
      now: Instant::now(),
      partitioned: false,
    }
  }

  pub fn boot(&mut self, id: u16, incarnation: u32) {
    let mut config = config(id, &self.ids, incarnation);
    (self.tweak)(&mut config);
    let store = Box::new(MemoryConfigStore::new());
    let m = Membership::new(Arc::new(config), store, self.now).unwrap();
    self.nodes.insert(id, m);
  }

  pub fn up(&self) -> BTreeSet<u16> {
    self.nodes.keys().copied().collect()
  }

  pub fn table(&self, id: u16) -> &NodeTable {
    self.nodes[&id].table()
  }

  pub fn membership(&mut self, id: u16) -> &mut Membership {
    self.nodes.get_mut(&id).unwrap()
  }

  fn right_of(&self, id: u16) -> Option<u16> {
    self
      .nodes
      .range(id + 1..)
      .chain(self.nodes.range(..id))
      .map(|(k, _)| *k)
      .next()
  }

  fn left_of(&self, id: u16) -> Option<u16> {
    self
      .nodes
      .range(..id)
      .rev()
      .chain(self.nodes.range(id + 1..).rev())
      .map(|(k, _)| *k)
      .next()
  }

  pub fn input(&mut self, id: u16, input: Input) {
    let now = self.now;
    let effects = match self.nodes.get_mut(&id) {
      Some(m) => m.handle(input, now),
      None => return,
    };
    self.apply(id, effects);
  }

  fn apply(&mut self, id: u16, effects: Vec<Effect>) {
    for effect in effects {
      match effect {
        Effect::Send { frame, route } => {
          let frame = decode(&encode(&frame).unwrap()).unwrap();
          let right = self.right_of(id).map(|to| (to, Direction::Left));
          let left = self.left_of(id).map(|to| (to, Direction::Right));
          let targets = match route {
            Route::Both => vec![right, left],
            Route::Toward(Direction::Right) => vec![right],
            Route::Toward(Direction::Left) => vec![left],
          };
          if self.partitioned {
            continue;
          }
          for (to, from) in targets.into_iter().flatten() {
            self.queue.push_back((to, frame.clone(), from));
          }
        }
        Effect::Notify(n) => self.notes.entry(id).or_default().push(n),
        Effect::Reachable(_) | Effect::Unreachable(_) | Effect::InfoReply { .. } => {}
      }
    }
  }

  /// Delivers every queued frame, including the ones sent in reaction.
  pub fn deliver(&mut self) {
    while let Some((to, frame, from)) = self.queue.pop_front() {
      self.input(
        to,
        Input::Frame {
          frame: frame,
          from: from,
        },
      );
    }
  }

  /// Advances the clock one heartbeat interval and ticks every node.
  pub fn step(&mut self) {
    self.now += HB;
    for id in self.up() {
      self.input(id, Input::Tick);
      self.deliver();
    }
  }

  pub fn run(&mut self, steps: usize) {
    for _ in 0..steps {
      self.step();
    }
  }

  /// Runs until every node agrees on the alive set and both roles, or panics.
  pub fn converge(&mut self) {
    for _ in 0..100 {
      self.step();
      if self.converged() {
        return;
      }
    }
    panic!("ring did not converge: {:?}", self.views());
  }

  pub fn converged(&self) -> bool {
    let up = self.up();
    let views = self.views();
    views.iter().all(|(_, v)| v.0 == up)
      && views.iter().map(|(_, v)| (v.1, v.2)).collect::<BTreeSet<_>>().len() == 1
      && views.iter().all(|(_, v)| v.1.is_some())
  }

  /// Per node: alive set, master and vice-master.
  pub fn views(&self) -> Vec<(u16, (BTreeSet<u16>, Option<u16>, Option<u16>))> {
    self
      .nodes
      .iter()
      .map(|(id, m)| {
        let t = m.table();
        let alive = t.alive().map(|n| n.id.0).collect();
        (*id, (alive, t.master_id().map(|n| n.0), t.vice_master_id().map(|n| n.0)))
      })
      .collect()
  }

  pub fn roles(&self, id: u16) -> (Option<u16>, Option<u16>) {
    let t = self.table(id);
    (t.master_id().map(|n| n.0), t.vice_master_id().map(|n| n.0))
  }

  /// The node stops without a word. Its neighbours lose their links to it.
  pub fn crash(&mut self, id: u16) {
    let neighbours = [self.left_of(id), self.right_of(id)];
    self.nodes.remove(&id);
    for n in neighbours.iter().flatten() {
      self.input(*n, Input::LinkDown { peer: NodeId(id) });
    }
    self.deliver();
  }

  /// The node announces its departure, then stops.
  pub fn leave(&mut self, id: u16) {
    self.input(id, Input::Leave);
    self.deliver();
    self.crash(id);
  }

  pub fn take_notes(&mut self, id: u16) -> Vec<Notification> {
    self.notes.remove(&id).unwrap_or_default()
  }

  /// The node changes a node notified, in order.
  pub fn changes(&mut self, id: u16) -> Vec<(NodeChangeCause, u16)> {
    self
      .take_notes(id)
      .into_iter()
      .filter_map(|n| match n {
        Notification::Node(NodeChange {
          cause,
          node: Some(node),
        }) => Some((cause, node.0)),
        _ => None,
      })
      .collect()
  }
}
