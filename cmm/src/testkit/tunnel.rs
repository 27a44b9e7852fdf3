use crate::core::NodeId;
use crate::frame::{Destination, FrameHeader, FrameType};
use crate::ring::{read_raw, write_raw};
use crate::testkit::FailureConfig;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace};

/// Selects frames by header. `None` fields match anything.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameMatch {
  pub frame_type: Option<FrameType>,
  pub source: Option<NodeId>,
  pub destination: Option<Destination>,
}
impl FrameMatch {
  pub fn of_type(frame_type: FrameType) -> FrameMatch {
    FrameMatch {
      frame_type: Some(frame_type),
      ..Default::default()
    }
  }

  pub fn from(mut self, source: NodeId) -> FrameMatch {
    self.source = Some(source);
    self
  }

  pub fn to(mut self, destination: Destination) -> FrameMatch {
    self.destination = Some(destination);
    self
  }

  pub fn matches(&self, header: &FrameHeader) -> bool {
    self.frame_type.map_or(true, |t| t == header.frame_type)
      && self.source.map_or(true, |s| s == header.source)
      && self.destination.map_or(true, |d| d == header.destination)
  }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TunnelAction {
  Pass,
  Drop,
  Delay(Duration),
  Random(FailureConfig),
}

/// The first rule matching a frame decides its fate. A rule with a limit stops matching after
/// that many frames.
#[derive(Clone, Debug, PartialEq)]
pub struct TunnelRule {
  pub matches: FrameMatch,
  pub action: TunnelAction,
  pub limit: Option<u32>,
}
impl TunnelRule {
  pub fn new(matches: FrameMatch, action: TunnelAction) -> TunnelRule {
    TunnelRule {
      matches: matches,
      action: action,
      limit: None,
    }
  }

  pub fn limit(mut self, frames: u32) -> TunnelRule {
    self.limit = Some(frames);
    self
  }
}

struct Shared {
  rules: Mutex<Vec<TunnelRule>>,
  dropped: AtomicU64,
  relayed: AtomicU64,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}
impl Shared {
  fn rules(&self) -> MutexGuard<'_, Vec<TunnelRule>> {
    self.rules.lock().unwrap_or_else(|p| p.into_inner())
  }

  fn track(&self, task: JoinHandle<()>) {
    let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
    tasks.retain(|t| !t.is_finished());
    tasks.push(task);
  }

  fn decide(&self, header: &FrameHeader) -> TunnelAction {
    let mut rules = self.rules();
    for rule in rules.iter_mut() {
      if rule.limit == Some(0) || !rule.matches.matches(header) {
        continue;
      }
      if let Some(limit) = rule.limit.as_mut() {
        *limit -= 1;
      }
      return rule.action;
    }
    TunnelAction::Pass
  }
}

/// A TCP relay that sits in front of a node's ring listener and interferes with frames in both
/// directions according to its rules. Point the node's configured address at
/// [`local_addr`](Tunnel::local_addr) and the real listener at the target.
pub struct Tunnel {
  local_addr: SocketAddr,
  shared: Arc<Shared>,
  acceptor: JoinHandle<()>,
}
impl Tunnel {
  pub async fn start(target: SocketAddr) -> std::io::Result<Tunnel> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    Tunnel::with_listener(listener, target)
  }

  pub fn with_listener(listener: TcpListener, target: SocketAddr) -> std::io::Result<Tunnel> {
    let local_addr = listener.local_addr()?;
    let shared = Arc::new(Shared {
      rules: Mutex::new(Vec::new()),
      dropped: AtomicU64::new(0),
      relayed: AtomicU64::new(0),
      tasks: Mutex::new(Vec::new()),
    });
    let acceptor = tokio::spawn(accept_loop(listener, target, shared.clone()));
    Ok(Tunnel {
      local_addr: local_addr,
      shared: shared,
      acceptor: acceptor,
    })
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  pub fn push_rule(&self, rule: TunnelRule) {
    self.shared.rules().push(rule);
  }

  pub fn clear_rules(&self) {
    self.shared.rules().clear();
  }

  /// Frames dropped so far, in both directions.
  pub fn dropped(&self) -> u64 {
    self.shared.dropped.load(Ordering::SeqCst)
  }

  /// Frames delivered so far, in both directions.
  pub fn relayed(&self) -> u64 {
    self.shared.relayed.load(Ordering::SeqCst)
  }

  /// Cuts every relayed connection. New connections are still accepted.
  pub fn sever(&self) {
    let mut tasks = self.shared.tasks.lock().unwrap_or_else(|p| p.into_inner());
    for task in tasks.drain(..) {
      task.abort();
    }
  }
}
impl Drop for Tunnel {
  fn drop(&mut self) {
    self.acceptor.abort();
    self.sever();
  }
}

async fn accept_loop(listener: TcpListener, target: SocketAddr, shared: Arc<Shared>) {
  loop {
    let (inbound, addr) = match listener.accept().await {
      Ok(accepted) => accepted,
      Err(error) => {
        debug!(error = %error, "tunnel accept failed");
        continue;
      }
    };
    let outbound = match TcpStream::connect(target).await {
      Ok(stream) => stream,
      Err(error) => {
        debug!(target = %target, error = %error, "tunnel target unreachable");
        continue;
      }
    };
    trace!(client = %addr, target = %target, "tunnel connection opened");
    let (in_r, in_w) = inbound.into_split();
    let (out_r, out_w) = outbound.into_split();
    shared.track(tokio::spawn(pump(in_r, out_w, shared.clone())));
    shared.track(tokio::spawn(pump(out_r, in_w, shared.clone())));
  }
}

async fn pump<R, W>(mut r: R, mut w: W, shared: Arc<Shared>)
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut rng = SmallRng::from_entropy();
  while let Ok(frame) = read_raw(&mut r).await {
    let action = match FrameHeader::peek(&frame) {
      Ok(header) => shared.decide(&header),
      Err(_) => TunnelAction::Pass,
    };
    let delay = match action {
      TunnelAction::Pass => None,
      TunnelAction::Drop => {
        shared.dropped.fetch_add(1, Ordering::SeqCst);
        continue;
      }
      TunnelAction::Delay(d) => Some(d),
      TunnelAction::Random(fail) => {
        if fail.drops(&mut rng) {
          shared.dropped.fetch_add(1, Ordering::SeqCst);
          continue;
        }
        fail.delay(&mut rng)
      }
    };
    if let Some(d) = delay {
      sleep(d).await;
    }
    if write_raw(&mut w, &frame).await.is_err() {
      break;
    }
    shared.relayed.fetch_add(1, Ordering::SeqCst);
  }
}

#[test]
fn test_rules_first_match_and_limit() {
  let shared = Shared {
    rules: Mutex::new(Vec::new()),
    dropped: AtomicU64::new(0),
    relayed: AtomicU64::new(0),
    tasks: Mutex::new(Vec::new()),
  };
  shared.rules().push(
    TunnelRule::new(
      FrameMatch::of_type(FrameType::Heartbeat).from(NodeId(103)),
      TunnelAction::Drop,
    )
    .limit(2),
  );
  let header = |t, s| FrameHeader {
    frame_type: t,
    source: NodeId(s),
    destination: Destination::Broadcast,
  };
  assert_eq!(shared.decide(&header(FrameType::Heartbeat, 102)), TunnelAction::Pass);
  assert_eq!(shared.decide(&header(FrameType::Election, 103)), TunnelAction::Pass);
  assert_eq!(shared.decide(&header(FrameType::Heartbeat, 103)), TunnelAction::Drop);
  assert_eq!(shared.decide(&header(FrameType::Heartbeat, 103)), TunnelAction::Drop);
  assert_eq!(shared.decide(&header(FrameType::Heartbeat, 103)), TunnelAction::Pass);
}
