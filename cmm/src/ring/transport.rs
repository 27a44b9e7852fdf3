use crate::config::ClusterConfig;
use crate::core::{Direction, NodeId, Route};
use crate::frame::{encode, Destination, Discovery, Frame};
use crate::membership::Input;
use crate::ring::link::{self, Link, LinkEvent};
use crate::ring::RingOrder;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

const EVENT_QUEUE: usize = 1024;

/// Requests from the membership task to the ring transport.
#[derive(Debug)]
pub enum RingCmd {
  Send { frame: Frame, route: Route },
  /// The node is alive again. Its reconnect backoff is cleared.
  Reachable(NodeId),
  /// The node was declared left. A link to it is dropped.
  Unreachable(NodeId),
  /// Resolves once every frame queued so far was written.
  Flush(oneshot::Sender<()>),
  Shutdown,
}

struct Backoff {
  delay: Duration,
  until: Instant,
}

/// Owns every ring connection of one node: at most one outbound link to the nearest reachable
/// successor (the right neighbour) and any inbound links, of which the one from the nearest
/// predecessor is the left neighbour. Frames arriving on any link are handed to membership tagged
/// with the side they came from.
pub(crate) struct RingTransport {
  local: NodeId,
  order: RingOrder,
  hello: Frame,
  connect_timeout: Duration,
  write_timeout: Duration,
  reconnect_min: Duration,
  reconnect_max: Duration,
  inputs: mpsc::Sender<Input>,
  events: mpsc::Sender<LinkEvent>,
  links: HashMap<u64, Link>,
  right: Option<u64>,
  left: Option<u64>,
  next_link: u64,
  dialing: Option<NodeId>,
  backoff: HashMap<NodeId, Backoff>,
  rng: SmallRng,
}
impl RingTransport {
  /// Starts accepting on `listener` and linking to successors. Frames and link changes go to
  /// `inputs`; the returned sender drives the transport.
  pub fn spawn(
    config: &ClusterConfig,
    incarnation: u32,
    listener: TcpListener,
    inputs: mpsc::Sender<Input>,
  ) -> (mpsc::UnboundedSender<RingCmd>, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
    let address = config
      .local_node()
      .map(|n| n.address.clone())
      .unwrap_or_default();
    let transport = RingTransport {
      local: config.local,
      order: RingOrder::new(config),
      hello: Frame::new(
        config.local,
        Destination::Peer,
        Discovery {
          incarnation: incarnation,
          address: address,
        },
      ),
      connect_timeout: config.connect_timeout,
      write_timeout: config.write_timeout,
      reconnect_min: config.reconnect_min(),
      reconnect_max: config.reconnect_max(),
      inputs: inputs,
      events: events_tx,
      links: HashMap::new(),
      right: None,
      left: None,
      next_link: 0,
      dialing: None,
      backoff: HashMap::new(),
      rng: SmallRng::from_entropy(),
    };
    let relink = config.hb_interval;
    let task = tokio::spawn(transport.run(listener, cmd_rx, events_rx, relink));
    (cmd_tx, task)
  }

  async fn run(
    mut self,
    listener: TcpListener,
    mut commands: mpsc::UnboundedReceiver<RingCmd>,
    mut events: mpsc::Receiver<LinkEvent>,
    relink_every: Duration,
  ) {
    let _acceptor = Acceptor(tokio::spawn(accept_loop(
      listener,
      self.order.clone(),
      self.hello.clone(),
      self.connect_timeout,
      self.events.clone(),
    )));
    let mut relink = interval(relink_every);
    relink.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
      tokio::select! {
        cmd = commands.recv() => match cmd {
          Some(RingCmd::Shutdown) | None => break,
          Some(cmd) => self.command(cmd),
        },
        Some(event) = events.recv() => self.event(event).await,
        _ = relink.tick() => self.relink(Instant::now()),
      }
    }
    self.links.clear();
    info!(node = %self.local, "ring transport stopped");
  }

  fn command(&mut self, cmd: RingCmd) {
    let now = Instant::now();
    match cmd {
      RingCmd::Send { frame, route } => self.send(frame, route),
      RingCmd::Reachable(id) => {
        if self.backoff.remove(&id).is_some() {
          debug!(node = %self.local, peer = %id, "backoff cleared");
        }
        self.relink(now);
      }
      RingCmd::Unreachable(id) => {
        if let Some(link) = self.right.and_then(|l| self.links.get(&l)) {
          if link.peer == id {
            let link = link.id;
            self.remove(link);
          }
        }
        let stale = self
          .links
          .values()
          .filter(|l| l.peer == id && l.direction == Direction::Left)
          .map(|l| l.id)
          .collect::<Vec<_>>();
        for link in stale {
          self.remove(link);
        }
        self.bump_backoff(id, now);
        self.relink(now);
      }
      RingCmd::Flush(done) => {
        let pending = self
          .links
          .values()
          .filter_map(Link::flush)
          .collect::<Vec<_>>();
        tokio::spawn(async move {
          for rx in pending {
            let _ = rx.await;
          }
          let _ = done.send(());
        });
      }
      RingCmd::Shutdown => {}
    }
  }

  fn send(&mut self, frame: Frame, route: Route) {
    let bytes = match encode(&frame) {
      Ok(bytes) => Arc::new(bytes),
      Err(error) => {
        warn!(node = %self.local, frame = ?frame.header(), error = %error, "cannot encode frame");
        return;
      }
    };
    let targets = match route {
      Route::Both => vec![self.right, self.left],
      Route::Toward(Direction::Right) => vec![self.right],
      Route::Toward(Direction::Left) => vec![self.left],
    };
    let mut sent = false;
    for link in targets.into_iter().flatten() {
      if let Some(link) = self.links.get(&link) {
        if link.send(bytes.clone()) {
          sent = true;
        } else {
          warn!(node = %self.local, peer = %link.peer, "link queue full, frame dropped");
        }
      }
    }
    if !sent {
      trace!(node = %self.local, frame = ?frame.header(), route = ?route, "no link for frame");
    }
  }

  async fn event(&mut self, event: LinkEvent) {
    match event {
      LinkEvent::Frame { link, frame } => {
        let from = match self.links.get(&link) {
          Some(link) => link.direction,
          None => return,
        };
        let _ = self
          .inputs
          .send(Input::Frame {
            frame: frame,
            from: from,
          })
          .await;
      }
      LinkEvent::Closed { link, error } => {
        let peer = match self.links.get(&link) {
          Some(link) => link.peer,
          None => return,
        };
        let was_right = self.right == Some(link);
        let was_left = self.left == Some(link);
        self.remove(link);
        if was_right || was_left {
          info!(node = %self.local, peer = %peer, error = %error, "ring neighbour lost");
          let _ = self.inputs.send(Input::LinkDown { peer: peer }).await;
        } else {
          debug!(node = %self.local, peer = %peer, error = %error, "redundant link closed");
        }
        if was_right {
          self.bump_backoff(peer, Instant::now());
          self.relink(Instant::now());
        }
      }
      LinkEvent::Dialed { peer, result } => {
        self.dialing = None;
        let now = Instant::now();
        match result {
          Ok((stream, incarnation)) => {
            if !self.nearer_than_right(peer) {
              debug!(node = %self.local, peer = %peer, "dialed link no longer needed");
              return;
            }
            self.backoff.remove(&peer);
            let id = self.add(peer, Direction::Right, stream);
            if let Some(old) = self.right.replace(id) {
              self.remove(old);
            }
            info!(node = %self.local, peer = %peer, "right neighbour linked");
            let _ = self
              .inputs
              .send(Input::LinkUp {
                peer: peer,
                incarnation: incarnation,
              })
              .await;
          }
          Err(error) => {
            debug!(node = %self.local, peer = %peer, error = %error, "dial failed");
            self.bump_backoff(peer, now);
            self.relink(now);
          }
        }
      }
      LinkEvent::Accepted {
        stream,
        peer,
        incarnation,
      } => {
        let older = self
          .links
          .values()
          .filter(|l| l.peer == peer && l.direction == Direction::Left)
          .map(|l| l.id)
          .collect::<Vec<_>>();
        for link in older {
          self.remove(link);
        }
        self.add(peer, Direction::Left, stream);
        self.select_left();
        let _ = self
          .inputs
          .send(Input::LinkUp {
            peer: peer,
            incarnation: incarnation,
          })
          .await;
      }
    }
  }

  fn add(&mut self, peer: NodeId, direction: Direction, stream: tokio::net::TcpStream) -> u64 {
    self.next_link += 1;
    let id = self.next_link;
    let link = Link::spawn(
      id,
      peer,
      direction,
      stream,
      self.write_timeout,
      self.events.clone(),
    );
    self.links.insert(id, link);
    id
  }

  fn remove(&mut self, link: u64) {
    self.links.remove(&link);
    if self.right == Some(link) {
      self.right = None;
    }
    if self.left == Some(link) {
      self.left = None;
      self.select_left();
    }
  }

  /// The left neighbour is the inbound link from the nearest predecessor.
  fn select_left(&mut self) {
    let order = &self.order;
    let left = self
      .links
      .values()
      .filter(|l| l.direction == Direction::Left)
      .min_by_key(|l| (order.back_distance(l.peer), Reverse(l.id)))
      .map(|l| (l.id, l.peer));
    if left.map(|(id, _)| id) != self.left {
      if let Some((_, peer)) = left {
        info!(node = %self.local, peer = %peer, "left neighbour linked");
      }
      self.left = left.map(|(id, _)| id);
    }
  }

  fn nearer_than_right(&self, peer: NodeId) -> bool {
    let right = self
      .right
      .and_then(|l| self.links.get(&l))
      .and_then(|l| self.order.distance(l.peer));
    match (self.order.distance(peer), right) {
      (Some(d), Some(r)) => d < r,
      (Some(_), None) => true,
      (None, _) => false,
    }
  }

  /// Dials the nearest successor that is nearer than the current right neighbour and not
  /// backing off. One dial runs at a time.
  fn relink(&mut self, now: Instant) {
    if self.dialing.is_some() {
      return;
    }
    let target = self
      .order
      .successors()
      .take_while(|id| self.nearer_than_right(*id))
      .find(|id| self.backoff.get(id).map_or(true, |b| b.until <= now));
    let peer = match target {
      Some(peer) => peer,
      None => return,
    };
    let address = match self.order.address(peer) {
      Some(address) => address.to_string(),
      None => return,
    };
    self.dialing = Some(peer);
    trace!(node = %self.local, peer = %peer, address = %address, "dialing");
    let hello = self.hello.clone();
    let timeout = self.connect_timeout;
    let events = self.events.clone();
    tokio::spawn(async move {
      let result = link::dial(&address, peer, &hello, timeout).await;
      let _ = events
        .send(LinkEvent::Dialed {
          peer: peer,
          result: result,
        })
        .await;
    });
  }

  fn bump_backoff(&mut self, peer: NodeId, now: Instant) {
    let delay = match self.backoff.get(&peer) {
      Some(b) => std::cmp::min(b.delay * 2, self.reconnect_max),
      None => self.reconnect_min,
    };
    let jitter_ms = (delay.as_millis() / 4) as u64;
    let jitter = Duration::from_millis(self.rng.gen_range(0..=jitter_ms));
    self.backoff.insert(
      peer,
      Backoff {
        delay: delay,
        until: now + delay + jitter,
      },
    );
  }
}

/// Stops accepting when the transport stops, including when its task is aborted.
struct Acceptor(JoinHandle<()>);
impl Drop for Acceptor {
  fn drop(&mut self) {
    self.0.abort();
  }
}

async fn accept_loop(
  listener: TcpListener,
  order: RingOrder,
  hello: Frame,
  connect_timeout: Duration,
  events: mpsc::Sender<LinkEvent>,
) {
  let order = Arc::new(order);
  loop {
    match listener.accept().await {
      Ok((stream, addr)) => {
        let order = order.clone();
        let hello = hello.clone();
        let events = events.clone();
        tokio::spawn(async move {
          match link::accept(stream, &order, &hello, connect_timeout).await {
            Ok((stream, peer, incarnation)) => {
              let _ = events
                .send(LinkEvent::Accepted {
                  stream: stream,
                  peer: peer,
                  incarnation: incarnation,
                })
                .await;
            }
            Err(error) => debug!(address = %addr, error = %error, "inbound handshake failed"),
          }
        });
      }
      Err(error) => {
        warn!(error = %error, "accept failed");
        sleep(Duration::from_millis(100)).await;
      }
    }
  }
}
