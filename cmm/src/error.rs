//! Error taxonomy. Protocol errors drop a single frame, transport errors become membership
//! events, and configuration errors are the only fatal case.

use crate::core::NodeId;
use crate::frame::MAX_FRAME_LEN;
use std::time::Duration;
use thiserror::Error;

/// A frame could not be encoded or decoded.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum ProtocolError {
  #[error("unknown frame type {0}")]
  UnknownFrameType(i32),
  #[error("required field `{0}` is unset")]
  Unset(&'static str),
  #[error("frame truncated while reading `{field}`: {needed} more bytes needed")]
  Truncated { field: &'static str, needed: usize },
  #[error("invalid value {value} for `{field}`")]
  InvalidValue { field: &'static str, value: i64 },
  #[error("field `{field}` is {len} bytes, at most {max} fit")]
  TooLong {
    field: &'static str,
    len: usize,
    max: usize,
  },
  #[error("field `{0}` is not valid UTF-8")]
  Utf8(&'static str),
  #[error("frame of {0} bytes exceeds the {} byte limit", MAX_FRAME_LEN)]
  FrameTooLarge(usize),
  #[error("length prefix declares {declared} bytes but {actual} follow")]
  LengthMismatch { declared: usize, actual: usize },
  #[error("{0} unread bytes after the frame body")]
  Trailing(usize),
}

/// A ring link failed.
#[derive(Debug, Error)]
pub enum TransportError {
  #[error("ring link i/o: {0}")]
  Io(#[from] std::io::Error),
  #[error("ring link timed out after {0:?}")]
  Timeout(Duration),
  #[error("ring link closed by peer")]
  Closed,
  #[error("ring link handshake failed: {0}")]
  Handshake(String),
  #[error(transparent)]
  Protocol(#[from] ProtocolError),
}

/// The static cluster configuration is unusable. Fatal at startup.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum ConfigError {
  #[error("no nodes configured")]
  NoNodes,
  #[error("node id 0 is reserved")]
  ZeroId,
  #[error("node {0} is configured twice")]
  Duplicate(NodeId),
  #[error("local node {0} is not in the node list")]
  MissingLocal(NodeId),
  #[error("`{0}` must be non-zero")]
  Zero(&'static str),
  #[error("node {id}: `{field}` is longer than {max} bytes")]
  TooLong {
    id: NodeId,
    field: &'static str,
    max: usize,
  },
  #[error("cannot read config file: {0}")]
  Read(String),
  #[error("cannot parse config file: {0}")]
  Parse(String),
}

/// A configuration store refused an update. The code travels in `ConfigChange.errorCode`.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum ConfigApplyError {
  #[error("no quorum")]
  NoQuorum,
  #[error("version {offered} is older than installed version {installed}")]
  StaleVersion { offered: u64, installed: u64 },
  #[error("store rejected the update with code {0}")]
  Rejected(i32),
}
impl ConfigApplyError {
  pub const NO_QUORUM: i32 = 1;
  pub const STALE_VERSION: i32 = 2;

  pub fn code(&self) -> i32 {
    match self {
      ConfigApplyError::NoQuorum => Self::NO_QUORUM,
      ConfigApplyError::StaleVersion { .. } => Self::STALE_VERSION,
      ConfigApplyError::Rejected(code) => *code,
    }
  }
}

/// Errors surfaced by [`ClusterHandle`](crate::cluster::ClusterHandle).
#[derive(Debug, Error)]
pub enum CmmError {
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error(transparent)]
  Transport(#[from] TransportError),
  #[error(transparent)]
  Protocol(#[from] ProtocolError),
  #[error("configuration update refused: {0}")]
  ConfigApply(#[from] ConfigApplyError),
  #[error("the cluster has no quorum")]
  NoQuorum,
  #[error("node {0} is not configured")]
  UnknownNode(NodeId),
  #[error("request timed out")]
  Timeout,
  #[error("the membership task has shut down")]
  Shutdown,
}
impl From<std::io::Error> for CmmError {
  fn from(e: std::io::Error) -> Self {
    CmmError::Transport(TransportError::Io(e))
  }
}
