//! Identifiers shared by every layer of the membership monitor.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The stable identifier of a cluster member. Ids are small positive integers, unique within the
/// cluster, and also define the ring order and the election tie-break.
#[derive(
  Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(transparent)]
pub struct NodeId(pub u16);
impl NodeId {
  pub fn get(self) -> u16 {
    self.0
  }
}
impl fmt::Display for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}
impl From<u16> for NodeId {
  fn from(id: u16) -> Self {
    NodeId(id)
  }
}
impl FromStr for NodeId {
  type Err = std::num::ParseIntError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    s.parse().map(NodeId)
  }
}

/// One of the two ring links a frame can travel on. `Left` is the link from the ring
/// predecessor, `Right` the link to the ring successor.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Direction {
  Left,
  Right,
}
impl Direction {
  /// The direction a frame keeps travelling in after arriving on `self`.
  pub fn opposite(self) -> Direction {
    match self {
      Direction::Left => Direction::Right,
      Direction::Right => Direction::Left,
    }
  }
}

/// Where an outbound frame is written.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Route {
  /// Both ring neighbours; used for frames this node originates.
  Both,
  /// A single link; used to forward a frame in its direction of travel.
  Toward(Direction),
}

#[test]
fn test_direction_opposite() {
  assert_eq!(Direction::Left.opposite(), Direction::Right);
  assert_eq!(Direction::Right.opposite().opposite(), Direction::Right);
  assert_eq!("104".parse::<NodeId>().unwrap(), NodeId(104));
}
