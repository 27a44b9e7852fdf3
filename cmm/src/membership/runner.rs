use crate::core::NodeId;
use crate::error::CmmError;
use crate::frame::InfoRequest;
use crate::membership::{ConfigUpdate, Effect, InfoReply, Input, Membership};
use crate::notify::{Notifier, Subscription};
use crate::ring::RingCmd;
use crate::table::TableSnapshot;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, trace};

/// Requests from [`ClusterHandle`](crate::cluster::ClusterHandle)s to the membership task.
pub(crate) enum Command {
  Subscribe(oneshot::Sender<Subscription>),
  SetActiveDisks(u32),
  UpdateConfig(ConfigUpdate, oneshot::Sender<Result<(), CmmError>>),
  Query {
    node: NodeId,
    request: InfoRequest,
    given: Option<NodeId>,
    legacy: bool,
    reply: oneshot::Sender<Result<InfoReply, CmmError>>,
  },
  Leave(oneshot::Sender<()>),
}

struct PendingQuery {
  node: NodeId,
  request: InfoRequest,
  given: Option<NodeId>,
  legacy: bool,
  deadline: Instant,
  reply: oneshot::Sender<Result<InfoReply, CmmError>>,
}
impl PendingQuery {
  fn answers(&self, from: NodeId, reply: &InfoReply) -> bool {
    self.node == from
      && self.request == reply.request()
      && self.given == reply.given()
      && self.legacy == reply.is_legacy()
  }
}

/// The single task that owns the [`Membership`] state machine. Ring links feed it [`Input`]s,
/// handles send it [`Command`]s, and it is the only writer of the node table.
pub(crate) struct Runner {
  membership: Membership,
  ring: mpsc::UnboundedSender<RingCmd>,
  notifier: Notifier,
  snapshots: watch::Sender<TableSnapshot>,
  pending: Vec<PendingQuery>,
  published: u64,
  hb_interval: Duration,
  query_timeout: Duration,
  flush_timeout: Duration,
}
impl Runner {
  pub fn new(
    membership: Membership,
    ring: mpsc::UnboundedSender<RingCmd>,
    snapshots: watch::Sender<TableSnapshot>,
  ) -> Runner {
    let config = membership.config();
    let notifier = Notifier::new(membership.local(), config.subscriber_capacity);
    Runner {
      hb_interval: config.hb_interval,
      query_timeout: config.connect_timeout,
      flush_timeout: config.write_timeout,
      published: membership.table().version(),
      membership: membership,
      ring: ring,
      notifier: notifier,
      snapshots: snapshots,
      pending: Vec::new(),
    }
  }

  pub async fn run(mut self, mut inputs: mpsc::Receiver<Input>, mut commands: mpsc::Receiver<Command>) {
    let local = self.membership.local();
    info!(node = %local, incarnation = self.membership.incarnation(), "membership task started");
    let mut ticker = interval(self.hb_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
      tokio::select! {
        _ = ticker.tick() => {
          let now = Instant::now();
          let effects = self.membership.handle(Input::Tick, now);
          self.apply(effects);
          self.expire_queries(now);
        }
        input = inputs.recv() => match input {
          Some(input) => {
            trace!(node = %local, input = ?input, "input");
            let effects = self.membership.handle(input, Instant::now());
            self.apply(effects);
          }
          None => break,
        },
        cmd = commands.recv() => match cmd {
          Some(cmd) => {
            if self.command(cmd).await {
              break;
            }
          }
          None => {
            debug!(node = %local, "every cluster handle dropped");
            break;
          }
        },
      }
      self.publish();
    }
    self.publish();
    let _ = self.ring.send(RingCmd::Shutdown);
    info!(node = %local, "membership task stopped");
  }

  /// Returns true once the task should stop.
  async fn command(&mut self, cmd: Command) -> bool {
    let now = Instant::now();
    match cmd {
      Command::Subscribe(reply) => {
        let snapshot = Arc::new(self.membership.table().clone());
        let _ = reply.send(self.notifier.subscribe(snapshot));
      }
      Command::SetActiveDisks(disks) => {
        let effects = self.membership.handle(Input::SetActiveDisks(disks), now);
        self.apply(effects);
      }
      Command::UpdateConfig(update, reply) => {
        let mut effects = Vec::new();
        let result = self.membership.update_config(update, now, &mut effects);
        self.apply(effects);
        let _ = reply.send(result);
      }
      Command::Query {
        node,
        request,
        given,
        legacy,
        reply,
      } => {
        let table = self.membership.table();
        if table.node(node).is_none() {
          let _ = reply.send(Err(CmmError::UnknownNode(node)));
        } else if node == table.local_id() {
          let answer = if legacy {
            InfoReply::CNode(table.c_node_info(request, given))
          } else {
            InfoReply::Node(table.node_info(request, given))
          };
          let _ = reply.send(Ok(answer));
        } else {
          let effect = self.membership.query(node, request, given, legacy);
          self.apply(vec![effect]);
          self.pending.push(PendingQuery {
            node: node,
            request: request,
            given: given,
            legacy: legacy,
            deadline: now + self.query_timeout,
            reply: reply,
          });
        }
      }
      Command::Leave(done) => {
        self.leave().await;
        let _ = done.send(());
        return true;
      }
    }
    false
  }

  fn apply(&mut self, effects: Vec<Effect>) {
    for effect in effects {
      match effect {
        Effect::Send { frame, route } => {
          let _ = self.ring.send(RingCmd::Send {
            frame: frame,
            route: route,
          });
        }
        Effect::Notify(n) => self.notifier.publish(n),
        Effect::Reachable(id) => {
          let _ = self.ring.send(RingCmd::Reachable(id));
        }
        Effect::Unreachable(id) => {
          let _ = self.ring.send(RingCmd::Unreachable(id));
        }
        Effect::InfoReply { from, reply } => {
          match self.pending.iter().position(|q| q.answers(from, &reply)) {
            Some(i) => {
              let _ = self.pending.remove(i).reply.send(Ok(reply));
            }
            None => debug!(from = %from, "unsolicited node info response"),
          }
        }
      }
    }
  }

  fn expire_queries(&mut self, now: Instant) {
    let (expired, pending) = std::mem::take(&mut self.pending)
      .into_iter()
      .partition::<Vec<_>, _>(|q| q.deadline <= now);
    self.pending = pending;
    for q in expired {
      debug!(node = %q.node, request = ?q.request, "node info query timed out");
      let _ = q.reply.send(Err(CmmError::Timeout));
    }
  }

  async fn leave(&mut self) {
    let effects = self.membership.handle(Input::Leave, Instant::now());
    self.apply(effects);
    let (tx, rx) = oneshot::channel();
    if self.ring.send(RingCmd::Flush(tx)).is_ok() {
      if timeout(self.flush_timeout, rx).await.is_err() {
        debug!(node = %self.membership.local(), "ring links did not drain before leaving");
      }
    }
  }

  fn publish(&mut self) {
    let version = self.membership.table().version();
    if version != self.published {
      self.published = version;
      let _ = self.snapshots.send(Arc::new(self.membership.table().clone()));
    }
  }
}
