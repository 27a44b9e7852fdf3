use crate::core::NodeId;
use crate::frame::{ConfigChangeNotif, Destination, Frame, Message, NodeChange};
use crate::table::TableSnapshot;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use std::time::Duration;
use tracing::{debug, warn};

/// A state transition pushed to subscribers.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Notification {
  Node(NodeChange),
  Config(ConfigChangeNotif),
}
impl Notification {
  /// The frame written to notification sockets.
  pub fn to_frame(&self, local: NodeId) -> Frame {
    let message: Message = match self {
      Notification::Node(n) => n.clone().into(),
      Notification::Config(n) => n.clone().into(),
    };
    Frame::new(local, Destination::Peer, message)
  }

  pub fn node_change(&self) -> Option<&NodeChange> {
    match self {
      Notification::Node(n) => Some(n),
      Notification::Config(_) => None,
    }
  }
}
impl From<NodeChange> for Notification {
  fn from(n: NodeChange) -> Self {
    Notification::Node(n)
  }
}
impl From<ConfigChangeNotif> for Notification {
  fn from(n: ConfigChangeNotif) -> Self {
    Notification::Config(n)
  }
}

/// A registered subscriber's end of the notification stream.
///
/// `snapshot` is the table as it was when the subscription was registered; every transition
/// after it arrives on the channel, in the order the membership task produced them. If the
/// subscriber falls behind by more than its queue length it is dropped and the channel reports
/// disconnection.
pub struct Subscription {
  pub local: NodeId,
  pub snapshot: TableSnapshot,
  receiver: Receiver<Notification>,
}
impl Subscription {
  pub fn recv(&self) -> Option<Notification> {
    self.receiver.recv().ok()
  }

  /// `Ok(None)` on timeout, `Err` once the subscription was dropped.
  pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Notification>, ()> {
    match self.receiver.recv_timeout(timeout) {
      Ok(n) => Ok(Some(n)),
      Err(RecvTimeoutError::Timeout) => Ok(None),
      Err(RecvTimeoutError::Disconnected) => Err(()),
    }
  }

  pub fn try_recv(&self) -> Result<Option<Notification>, ()> {
    match self.receiver.try_recv() {
      Ok(n) => Ok(Some(n)),
      Err(TryRecvError::Empty) => Ok(None),
      Err(TryRecvError::Disconnected) => Err(()),
    }
  }

  /// Everything queued right now.
  pub fn drain(&self) -> Vec<Notification> {
    self.receiver.try_iter().collect()
  }

  pub fn receiver(&self) -> &Receiver<Notification> {
    &self.receiver
  }
}

/// Fans notifications out to subscribers without ever blocking the caller.
pub struct Notifier {
  local: NodeId,
  capacity: usize,
  next_id: u64,
  subscribers: Vec<(u64, Sender<Notification>)>,
}
impl Notifier {
  pub fn new(local: NodeId, capacity: usize) -> Notifier {
    Notifier {
      local: local,
      capacity: capacity,
      next_id: 0,
      subscribers: Vec::new(),
    }
  }

  pub fn subscribe(&mut self, snapshot: TableSnapshot) -> Subscription {
    let (tx, rx) = bounded(self.capacity);
    self.subscribers.push((self.next_id, tx));
    debug!(node = %self.local, subscriber = self.next_id, "subscriber registered");
    self.next_id += 1;
    Subscription {
      local: self.local,
      snapshot: snapshot,
      receiver: rx,
    }
  }

  pub fn publish(&mut self, notification: Notification) {
    let local = self.local;
    self.subscribers.retain(|(id, tx)| match tx.try_send(notification.clone()) {
      Ok(()) => true,
      Err(TrySendError::Full(_)) => {
        warn!(node = %local, subscriber = id, "subscriber queue full, dropping subscriber");
        false
      }
      Err(TrySendError::Disconnected(_)) => {
        debug!(node = %local, subscriber = id, "subscriber went away");
        false
      }
    });
  }

  pub fn len(&self) -> usize {
    self.subscribers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.subscribers.is_empty()
  }
}

#[cfg(test)]
fn snapshot() -> TableSnapshot {
  use crate::config::{ClusterConfig, NodeConfig};
  use crate::table::NodeTable;
  let config = ClusterConfig::new(101, vec![NodeConfig::new(101, "127.0.0.1:7101")]);
  std::sync::Arc::new(NodeTable::new(&config, 1).unwrap())
}

#[test]
fn test_fifo_per_subscriber() {
  use crate::frame::NodeChangeCause::*;
  let mut notifier = Notifier::new(NodeId(101), 8);
  let a = notifier.subscribe(snapshot());
  notifier.publish(NodeChange::new(MemberJoined, NodeId(102)).into());
  let b = notifier.subscribe(snapshot());
  notifier.publish(NodeChange::new(MasterElected, NodeId(101)).into());
  let causes = |s: &Subscription| {
    s.drain()
      .iter()
      .filter_map(|n| n.node_change().map(|c| c.cause))
      .collect::<Vec<_>>()
  };
  assert_eq!(causes(&a), vec![MemberJoined, MasterElected]);
  assert_eq!(causes(&b), vec![MasterElected]);
}

#[test]
fn test_overflow_drops_subscriber() {
  use crate::frame::NodeChangeCause::*;
  let mut notifier = Notifier::new(NodeId(101), 2);
  let slow = notifier.subscribe(snapshot());
  let fast = notifier.subscribe(snapshot());
  for id in 102..=104 {
    notifier.publish(NodeChange::new(MemberJoined, NodeId(id)).into());
    assert!(fast.try_recv().unwrap().is_some());
  }
  assert_eq!(notifier.len(), 1);
  assert_eq!(slow.drain().len(), 2);
  assert_eq!(slow.try_recv(), Err(()));
  drop(fast);
  notifier.publish(NodeChange::new(MemberLeft, NodeId(104)).into());
  assert!(notifier.is_empty());
}
