use crate::core::NodeId;
use crate::error::ProtocolError;
use crate::frame::{FrameReader, FrameType, FrameWriter, WireMessage};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::convert::TryFrom;
use NodeChangeCause::*;

/// Why a [`NodeChange`] was emitted.
#[derive(
  Clone, Copy, Debug, Eq, Hash, IntoPrimitive, Ord, PartialEq, PartialOrd, TryFromPrimitive,
)]
#[repr(i32)]
pub enum NodeChangeCause {
  MasterElected = 1,
  MasterDemoted = 2,
  ViceMasterElected = 3,
  ViceMasterDemoted = 4,
  MemberJoined = 5,
  MemberLeft = 6,
  StaleCluster = 7,
  InvalidCluster = 8,
  ValidCluster = 9,
  NodeEligible = 10,
  NodeIneligible = 11,
  DiskChange = 12,
  GainedQuorum = 13,
  LostQuorum = 14,
}
impl NodeChangeCause {
  /// Causes that claim or release the master or vice-master role.
  pub fn is_role_change(self) -> bool {
    matches!(
      self,
      MasterElected | MasterDemoted | ViceMasterElected | ViceMasterDemoted
    )
  }

  /// Causes describing the whole cluster rather than one member; they carry the local node id.
  pub fn is_cluster_wide(self) -> bool {
    matches!(
      self,
      StaleCluster | InvalidCluster | ValidCluster | GainedQuorum | LostQuorum
    )
  }

  pub(crate) fn read(r: &mut FrameReader<'_>) -> Result<NodeChangeCause, ProtocolError> {
    let v = r.get_i32("cause")?;
    NodeChangeCause::try_from(v).map_err(|_| ProtocolError::InvalidValue {
      field: "cause",
      value: v as i64,
    })
  }
}

/// A membership transition: `{cause, nodeid}`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct NodeChange {
  pub cause: NodeChangeCause,
  /// Required on the wire; `None` refuses to encode.
  pub node: Option<NodeId>,
}
impl NodeChange {
  pub fn new(cause: NodeChangeCause, node: NodeId) -> NodeChange {
    NodeChange {
      cause: cause,
      node: Some(node),
    }
  }
}
impl WireMessage for NodeChange {
  const FRAME_TYPE: FrameType = FrameType::NodeChange;

  fn copy_into(&self, w: &mut FrameWriter) -> Result<(), ProtocolError> {
    w.put_i32(self.cause.into());
    w.put_required_node("nodeid", self.node)
  }

  fn copy_from(r: &mut FrameReader<'_>) -> Result<Self, ProtocolError> {
    Ok(NodeChange {
      cause: NodeChangeCause::read(r)?,
      node: Some(r.get_node("nodeid")?),
    })
  }
}

#[test]
fn test_node_change_unset_node() {
  let mut w = FrameWriter::new();
  let unset = NodeChange {
    cause: MemberLeft,
    node: None,
  };
  assert_eq!(unset.copy_into(&mut w), Err(ProtocolError::Unset("nodeid")));

  let mut w = FrameWriter::new();
  w.put_i32(MemberLeft.into());
  w.put_i32(-1);
  let bytes = w.into_bytes();
  assert_eq!(
    NodeChange::copy_from(&mut FrameReader::new(&bytes)),
    Err(ProtocolError::Unset("nodeid"))
  );
}

#[test]
fn test_node_change_cause_codes() {
  assert_eq!(i32::from(MasterElected), 1);
  assert_eq!(i32::from(LostQuorum), 14);
  assert!(ViceMasterDemoted.is_role_change());
  assert!(!MemberJoined.is_role_change());
  assert!(GainedQuorum.is_cluster_wide());
  let mut w = FrameWriter::new();
  w.put_i32(15);
  let bytes = w.into_bytes();
  assert!(NodeChangeCause::read(&mut FrameReader::new(&bytes)).is_err());
}
