//! The node table: the single source of truth for who is in the cluster.

mod node;
mod node_table;

#[rustfmt::skip]
pub use {
  node::Node,
  node::NodeState,
  node::Presence,
  node_table::ClusterValidity,
  node_table::NodeTable,
  node_table::TableSnapshot,
};
