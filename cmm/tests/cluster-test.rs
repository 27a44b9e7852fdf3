use cmm::admin;
use cmm::error::ProtocolError;
use cmm::frame::{
  ConfigChangeNotif, ConfigFile, ConfigNotifCause, FrameType, InfoRequest, Message, NodeChange,
  NodeChangeCause,
};
use cmm::membership::{ConfigUpdate, InfoReply, MemoryConfigStore};
use cmm::notify::{Notification, Subscription};
use cmm::ring::read_frame;
use cmm::testkit::{init_logging, FrameMatch, Tunnel, TunnelAction, TunnelRule};
use cmm::{Cluster, ClusterConfig, ClusterHandle, CmmError, NodeConfig, NodeId};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

const HB: Duration = Duration::from_millis(100);
const DEADLINE: Duration = Duration::from_secs(10);

type Nodes = BTreeMap<u16, ClusterHandle>;

fn free_addr() -> SocketAddr {
  std::net::TcpListener::bind("127.0.0.1:0")
    .unwrap()
    .local_addr()
    .unwrap()
}

fn config(local: u16, addrs: &[(u16, SocketAddr)]) -> ClusterConfig {
  let nodes = addrs
    .iter()
    .map(|(id, addr)| NodeConfig::new(*id, addr.to_string()))
    .collect();
  let mut config = ClusterConfig::new(local, nodes);
  config.hb_interval = HB;
  config.incarnation = Some(1);
  config
}

async fn listeners(ids: &[u16]) -> Vec<(u16, TcpListener)> {
  let mut listeners = Vec::new();
  for id in ids {
    listeners.push((*id, TcpListener::bind("127.0.0.1:0").await.unwrap()));
  }
  listeners
}

/// Starts one node per listener. `addrs` is what the nodes dial, which need not be the listeners.
async fn start(
  listeners: Vec<(u16, TcpListener)>,
  addrs: &[(u16, SocketAddr)],
  tweak: impl Fn(&mut ClusterConfig),
) -> Nodes {
  let mut nodes = BTreeMap::new();
  for (id, listener) in listeners {
    let mut config = config(id, addrs);
    tweak(&mut config);
    let store = Box::new(MemoryConfigStore::new());
    let node = Cluster::start_with(config, listener, store).await.unwrap();
    nodes.insert(id, node);
  }
  nodes
}

async fn start_ring(ids: &[u16]) -> Nodes {
  let listeners = listeners(ids).await;
  let addrs = listeners
    .iter()
    .map(|(id, l)| (*id, l.local_addr().unwrap()))
    .collect::<Vec<_>>();
  start(listeners, &addrs, |_| {}).await
}

async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
  let deadline = Instant::now() + DEADLINE;
  while !check() {
    if Instant::now() > deadline {
      panic!("timed out waiting for {}", what);
    }
    sleep(Duration::from_millis(20)).await;
  }
}

fn agree(nodes: &Nodes, master: u16, vice: u16) -> bool {
  nodes.values().all(|n| {
    let t = n.snapshot();
    t.alive_count() == nodes.len()
      && t.master_id() == Some(NodeId(master))
      && t.vice_master_id() == Some(NodeId(vice))
  })
}

fn left(id: u16) -> Notification {
  NodeChange::new(NodeChangeCause::MemberLeft, NodeId(id)).into()
}

fn collect(sub: &Subscription, into: &mut Vec<Notification>) {
  into.extend(sub.drain());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ring_boot_converges() {
  init_logging();
  let nodes = start_ring(&[101, 102, 103, 104]).await;
  eventually("master 101 and vice 102", || agree(&nodes, 101, 102)).await;
  for node in nodes.values() {
    assert!(node.snapshot().roles_consistent());
    assert!(node.snapshot().has_quorum());
  }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_master_leave_reelects() {
  init_logging();
  let mut nodes = start_ring(&[101, 102, 103, 104]).await;
  eventually("initial election", || agree(&nodes, 101, 102)).await;
  let sub = nodes[&104].subscribe().await.unwrap();

  nodes.remove(&101).unwrap().leave().await.unwrap();
  eventually("master 102 and vice 103", || agree(&nodes, 102, 103)).await;

  let seen = sub.drain();
  let demoted: Notification = NodeChange::new(NodeChangeCause::MasterDemoted, NodeId(101)).into();
  let at = |n: &Notification| seen.iter().position(|s| s == n);
  assert!(at(&demoted) < at(&left(101)), "{:?}", seen);
  assert!(at(&demoted).is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_crashed_node_is_routed_around() {
  init_logging();
  let mut nodes = start_ring(&[101, 102, 103, 104]).await;
  eventually("initial election", || agree(&nodes, 101, 102)).await;

  drop(nodes.remove(&102));
  eventually("vice 103 after the crash", || agree(&nodes, 101, 103)).await;

  // 101 now links straight to 103; heartbeats keep flowing both ways round the ring.
  nodes[&103].set_active_disks(2).await.unwrap();
  eventually("disk count of 103 at 101", || {
    nodes[&101]
      .snapshot()
      .node(NodeId(103))
      .map_or(false, |n| n.active_disks == 2)
  })
  .await;
  sleep(HB * 10).await;
  assert!(agree(&nodes, 101, 103));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dropped_heartbeats_within_timeout() {
  init_logging();
  let ids = [101, 102, 103, 104];
  let listeners = listeners(&ids).await;
  let mut tunnels = BTreeMap::new();
  let mut addrs = Vec::new();
  for (id, listener) in &listeners {
    let real = listener.local_addr().unwrap();
    if *id == 102 || *id == 103 {
      let tunnel = Tunnel::start(real).await.unwrap();
      addrs.push((*id, tunnel.local_addr()));
      tunnels.insert(*id, tunnel);
    } else {
      addrs.push((*id, real));
    }
  }
  let nodes = start(listeners, &addrs, |_| {}).await;
  eventually("initial election", || agree(&nodes, 101, 102)).await;
  let sub = nodes[&103].subscribe().await.unwrap();

  // Every copy of 102's heartbeat crosses one of the two tunnels on its way to 103.
  let rule = TunnelRule::new(
    FrameMatch::of_type(FrameType::Heartbeat).from(NodeId(102)),
    TunnelAction::Drop,
  )
  .limit(2);
  for tunnel in tunnels.values() {
    tunnel.push_rule(rule.clone());
  }
  eventually("heartbeats dropped", || {
    tunnels.values().all(|t| t.dropped() == 2)
  })
  .await;
  sleep(HB * 10).await;

  assert!(nodes[&103].snapshot().is_alive(NodeId(102)));
  assert!(agree(&nodes, 101, 102));
  let seen = sub.drain();
  assert!(!seen.contains(&left(102)), "{:?}", seen);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_slow_subscriber_is_dropped() {
  init_logging();
  let listeners = listeners(&[101]).await;
  let addrs = [(101, listeners[0].1.local_addr().unwrap())];
  let nodes = start(listeners, &addrs, |c| c.subscriber_capacity = 2).await;
  let slow = nodes[&101].subscribe().await.unwrap();

  // Valid, quorum, then master: one more than fits.
  eventually("single node election", || {
    nodes[&101].snapshot().master_id() == Some(NodeId(101))
  })
  .await;
  let queued = slow.drain();
  assert_eq!(queued.len(), 2, "{:?}", queued);
  assert!(slow.try_recv().is_err());

  let fresh = nodes[&101].subscribe().await.unwrap();
  assert_eq!(fresh.snapshot.master_id(), Some(NodeId(101)));
  nodes[&101].set_active_disks(3).await.unwrap();
  let expected: Notification = NodeChange::new(NodeChangeCause::DiskChange, NodeId(101)).into();
  assert_eq!(fresh.recv_timeout(DEADLINE), Ok(Some(expected)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_snapshot_queries() {
  init_logging();
  let admin_addr = free_addr();
  let notify_addr = free_addr();
  let listeners = listeners(&[101, 102, 103]).await;
  let addrs = listeners
    .iter()
    .map(|(id, l)| (*id, l.local_addr().unwrap()))
    .collect::<Vec<_>>();
  let nodes = start(listeners, &addrs, move |c| {
    if c.local == NodeId(101) {
      c.admin_addr = Some(admin_addr);
      c.notify_addr = Some(notify_addr);
    }
  })
  .await;
  eventually("election", || agree(&nodes, 101, 102)).await;
  let node = &nodes[&101];

  match admin::query(admin_addr, InfoRequest::All, None, false, DEADLINE).await {
    Ok(InfoReply::Node(info)) => {
      assert_eq!(info.count, 3);
      let ids = info.records.iter().map(|r| r.id.0).collect::<Vec<_>>();
      assert_eq!(ids, vec![101, 102, 103]);
      assert!(info.records[0].master && info.records[1].vice_master);
    }
    other => panic!("{:?}", other),
  }
  match admin::query(admin_addr, InfoRequest::AllCountOnly, None, false, DEADLINE).await {
    Ok(InfoReply::Node(info)) => {
      assert_eq!(info.count, 3);
      assert!(info.records.is_empty());
    }
    other => panic!("{:?}", other),
  }
  match admin::query(admin_addr, InfoRequest::Me, None, true, DEADLINE).await {
    Ok(InfoReply::CNode(info)) => {
      assert_eq!(info.records.len(), 1);
      assert_eq!(info.records[0].id, NodeId(101));
      assert_eq!(info.records[0].incarnation, 1);
      assert!(info.records[0].swload.starts_with("cmm-"));
    }
    other => panic!("{:?}", other),
  }

  assert!(matches!(
    node.node_info(InfoRequest::GivenNode, None),
    Err(CmmError::Protocol(ProtocolError::Unset(_)))
  ));
  assert!(matches!(
    node.node_info(InfoRequest::GivenNode, Some(NodeId(999))),
    Err(CmmError::UnknownNode(NodeId(999)))
  ));
  let info = node.node_info(InfoRequest::GivenNode, Some(NodeId(103))).unwrap();
  assert_eq!(info.records[0].id, NodeId(103));

  let info = node
    .remote_node_info(NodeId(103), InfoRequest::Me, None)
    .await
    .unwrap();
  assert_eq!(info.records[0].id, NodeId(103));
  for _ in 0..3 {
    let again = node
      .remote_node_info(NodeId(103), InfoRequest::Me, None)
      .await
      .unwrap();
    assert_eq!(again.records[0].id, NodeId(103));
  }
  let (a, b) = tokio::join!(
    node.remote_node_info(NodeId(103), InfoRequest::Me, None),
    node.remote_node_info(NodeId(103), InfoRequest::Me, None)
  );
  assert_eq!(a.unwrap().records[0].id, NodeId(103));
  assert_eq!(b.unwrap().records[0].id, NodeId(103));
  let info = node
    .remote_c_node_info(NodeId(102), InfoRequest::ViceMaster, None)
    .await
    .unwrap();
  assert_eq!(info.records[0].id, NodeId(102));

  let mut stream = TcpStream::connect(notify_addr).await.unwrap();
  match read_frame(&mut stream).await.unwrap().message {
    Message::NodeInfo(info) => assert_eq!(info.count, 3),
    other => panic!("{:?}", other),
  }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_config_update_reaches_every_member() {
  init_logging();
  let nodes = start_ring(&[101, 102, 103]).await;
  eventually("election", || agree(&nodes, 101, 102)).await;
  let subs = nodes
    .iter()
    .map(|(id, n)| (*id, n.client()))
    .collect::<Vec<_>>();
  let mut subscriptions = Vec::new();
  for (id, client) in subs {
    subscriptions.push((id, client.subscribe().await.unwrap()));
  }

  let update = ConfigUpdate {
    file: ConfigFile::Cluster,
    version: 5,
    md5: "d41d8cd98f00b204e9800998ecf8427e".parse().unwrap(),
    clear_mode: false,
  };
  nodes[&101].update_config(update).await.unwrap();

  let mut seen = subscriptions.iter().map(|_| Vec::new()).collect::<Vec<_>>();
  eventually("every member updated", || {
    subscriptions.iter().zip(seen.iter_mut()).all(|((id, sub), seen)| {
      collect(sub, seen);
      seen.contains(&Notification::Config(ConfigChangeNotif {
        cause: ConfigNotifCause::ConfigUpdated,
        node: NodeId(*id),
        file: ConfigFile::Cluster,
      }))
    })
  })
  .await;

  // An older version is refused locally.
  let stale = ConfigUpdate { version: 4, ..update };
  assert!(matches!(
    nodes[&102].update_config(stale).await,
    Err(CmmError::ConfigApply(_))
  ));
}
