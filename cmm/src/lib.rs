//! A cluster membership monitor for a ring of storage nodes.
//!
//! Every node keeps a [`NodeTable`](crate::table::NodeTable) describing who is in the cluster,
//! exchanges binary [`Frame`](crate::frame::Frame)s with its two ring neighbours, detects silent
//! nodes through missed heartbeats, and elects a master and a vice-master with a deterministic
//! lowest-id rule. Every transition is pushed to subscribers as a
//! [`NodeChange`](crate::frame::NodeChange) or [`ConfigChangeNotif`](crate::frame::ConfigChangeNotif).
//!
//! The usual entry point is [`Cluster::start`](crate::cluster::Cluster::start), which spawns the
//! ring transport, the heartbeat timer and the membership task on the current tokio runtime and
//! returns a [`ClusterHandle`](crate::cluster::ClusterHandle).

pub mod admin;
pub mod cluster;
pub mod config;
pub mod core;
pub mod error;
pub mod frame;
pub mod membership;
pub mod notify;
pub mod ring;
pub mod table;
pub mod testkit;

#[rustfmt::skip]
pub use {
  cluster::Cluster,
  cluster::ClusterClient,
  cluster::ClusterHandle,
  config::ClusterConfig,
  config::NodeConfig,
  core::NodeId,
  error::CmmError,
};
