//! Notifications over TCP. Each connection gets a `NodeInfo` frame listing every member, then
//! one `NodeChange` or `ConfigChangeNotif` frame per transition until either side goes away.

use crate::cluster::ClusterClient;
use crate::error::TransportError;
use crate::frame::{Destination, Frame, InfoRequest};
use crate::notify::{Notification, Subscription};
use crate::ring::write_frame;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// How often the subscription bridge checks whether its writer is gone.
const BRIDGE_POLL: Duration = Duration::from_millis(100);

/// Accepts subscribers until the membership task stops. A subscriber that does not take a frame
/// within `write_timeout` is disconnected.
pub async fn serve(listener: TcpListener, client: ClusterClient, write_timeout: Duration) {
  let local = client.local_id();
  if let Ok(addr) = listener.local_addr() {
    info!(node = %local, address = %addr, "notification server listening");
  }
  loop {
    let (stream, addr) = match listener.accept().await {
      Ok(accepted) => accepted,
      Err(error) => {
        warn!(node = %local, error = %error, "notification accept failed");
        continue;
      }
    };
    let subscription = match client.subscribe().await {
      Ok(subscription) => subscription,
      Err(_) => return,
    };
    debug!(node = %local, subscriber = %addr, "notification subscriber connected");
    tokio::spawn(async move {
      if let Err(error) = stream_to(stream, subscription, write_timeout).await {
        debug!(node = %local, subscriber = %addr, error = %error, "notification subscriber gone");
      }
    });
  }
}

/// Writes the snapshot, then every notification, until the subscription is dropped or a write
/// fails or stalls for `write_timeout`.
pub async fn stream_to<W: AsyncWrite + Unpin>(
  mut w: W,
  subscription: Subscription,
  write_timeout: Duration,
) -> Result<(), TransportError> {
  let local = subscription.local;
  let snapshot = Frame::new(
    local,
    Destination::Peer,
    subscription.snapshot.node_info(InfoRequest::All, None),
  );
  send(&mut w, &snapshot, write_timeout).await?;

  let (tx, mut rx) = mpsc::channel(1);
  tokio::task::spawn_blocking(move || bridge(subscription, tx));
  while let Some(notification) = rx.recv().await {
    send(&mut w, &notification.to_frame(local), write_timeout).await?;
  }
  Ok(())
}

async fn send<W: AsyncWrite + Unpin>(
  w: &mut W,
  frame: &Frame,
  write_timeout: Duration,
) -> Result<(), TransportError> {
  timeout(write_timeout, write_frame(w, frame))
    .await
    .map_err(|_| TransportError::Timeout(write_timeout))?
}

/// Moves notifications from the blocking subscription onto the writer's channel. Ends when the
/// subscription is dropped or the writer is gone.
fn bridge(subscription: Subscription, tx: mpsc::Sender<Notification>) {
  loop {
    match subscription.recv_timeout(BRIDGE_POLL) {
      Ok(Some(notification)) => {
        if tx.blocking_send(notification).is_err() {
          return;
        }
      }
      Ok(None) if tx.is_closed() => return,
      Ok(None) => {}
      Err(()) => return,
    }
  }
}

#[cfg(test)]
fn subscription() -> (crate::notify::Notifier, Subscription) {
  use crate::config::{ClusterConfig, NodeConfig};
  use crate::core::NodeId;
  use crate::notify::Notifier;
  use crate::table::NodeTable;
  use std::sync::Arc;

  let config = ClusterConfig::new(
    101,
    vec![
      NodeConfig::new(101, "127.0.0.1:7101"),
      NodeConfig::new(102, "127.0.0.1:7102"),
    ],
  );
  let mut notifier = Notifier::new(NodeId(101), 4);
  let subscription = notifier.subscribe(Arc::new(NodeTable::new(&config, 1).unwrap()));
  (notifier, subscription)
}

#[test]
fn test_stream_starts_with_snapshot() {
  use crate::core::NodeId;
  use crate::frame::{decode, Message, NodeChange, NodeChangeCause, LEN_PREFIX};
  use std::convert::TryInto;

  let (mut notifier, subscription) = subscription();
  notifier.publish(NodeChange::new(NodeChangeCause::MemberJoined, NodeId(102)).into());
  drop(notifier);

  let mut out = Vec::new();
  tokio_test::block_on(stream_to(&mut out, subscription, Duration::from_secs(1))).unwrap();
  let mut frames = Vec::new();
  let mut rest = &out[..];
  while !rest.is_empty() {
    let len = u32::from_be_bytes(rest[..LEN_PREFIX].try_into().unwrap()) as usize;
    frames.push(decode(&rest[..LEN_PREFIX + len]).unwrap());
    rest = &rest[LEN_PREFIX + len..];
  }
  assert_eq!(frames.len(), 2);
  match &frames[0].message {
    Message::NodeInfo(info) => assert_eq!(info.records.len(), 2),
    other => panic!("expected node info, got {:?}", other),
  }
  assert_eq!(
    frames[1].message,
    Message::NodeChange(NodeChange::new(NodeChangeCause::MemberJoined, NodeId(102)))
  );
}

#[test]
fn test_stalled_subscriber_times_out() {
  let (_notifier, subscription) = subscription();
  let (writer, _unread) = tokio::io::duplex(8);
  let write_timeout = Duration::from_millis(50);
  let result = tokio_test::block_on(stream_to(writer, subscription, write_timeout));
  assert!(matches!(result, Err(TransportError::Timeout(t)) if t == write_timeout));
}
