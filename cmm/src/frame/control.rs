use crate::core::NodeId;
use crate::error::ProtocolError;
use crate::frame::{FrameReader, FrameType, FrameWriter, NodeChangeCause, SFlags, WireMessage};

/// Periodic liveness beacon. Carries everything peers learn about the sender: its lifetime, a
/// sequence number for ordering, its role claims and eligibility, and its disk count.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Heartbeat {
  pub incarnation: u32,
  pub sequence: u64,
  pub flags: SFlags,
  pub active_disks: u32,
}
impl WireMessage for Heartbeat {
  const FRAME_TYPE: FrameType = FrameType::Heartbeat;

  fn copy_into(&self, w: &mut FrameWriter) -> Result<(), ProtocolError> {
    w.put_u31("incarnation", self.incarnation)?;
    w.put_u63("sequence", self.sequence)?;
    w.put_i32(self.flags.0);
    w.put_u31("activeDiskCount", self.active_disks)
  }

  fn copy_from(r: &mut FrameReader<'_>) -> Result<Self, ProtocolError> {
    Ok(Heartbeat {
      incarnation: r.get_u31("incarnation")?,
      sequence: r.get_u63("sequence")?,
      flags: SFlags(r.get_i32("sflags")?),
      active_disks: r.get_u31("activeDiskCount")?,
    })
  }
}

/// A node claiming or releasing a role. `sequence` is the sender's heartbeat sequence at the
/// time of the change, so heartbeats sent before it are recognised as stale.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Election {
  /// One of the four role causes.
  pub cause: NodeChangeCause,
  pub node: NodeId,
  pub incarnation: u32,
  pub sequence: u64,
}
impl WireMessage for Election {
  const FRAME_TYPE: FrameType = FrameType::Election;

  fn copy_into(&self, w: &mut FrameWriter) -> Result<(), ProtocolError> {
    if !self.cause.is_role_change() {
      return Err(ProtocolError::InvalidValue {
        field: "cause",
        value: i32::from(self.cause) as i64,
      });
    }
    w.put_i32(self.cause.into());
    w.put_node(self.node);
    w.put_u31("incarnation", self.incarnation)?;
    w.put_u63("sequence", self.sequence)
  }

  fn copy_from(r: &mut FrameReader<'_>) -> Result<Self, ProtocolError> {
    let cause = NodeChangeCause::read(r)?;
    if !cause.is_role_change() {
      return Err(ProtocolError::InvalidValue {
        field: "cause",
        value: i32::from(cause) as i64,
      });
    }
    Ok(Election {
      cause: cause,
      node: r.get_node("nodeid")?,
      incarnation: r.get_u31("incarnation")?,
      sequence: r.get_u63("sequence")?,
    })
  }
}

/// Link handshake and boot-time hello.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Discovery {
  pub incarnation: u32,
  pub address: String,
}
impl WireMessage for Discovery {
  const FRAME_TYPE: FrameType = FrameType::Discovery;

  fn copy_into(&self, w: &mut FrameWriter) -> Result<(), ProtocolError> {
    w.put_u31("incarnation", self.incarnation)?;
    w.put_string("address", &self.address)
  }

  fn copy_from(r: &mut FrameReader<'_>) -> Result<Self, ProtocolError> {
    Ok(Discovery {
      incarnation: r.get_u31("incarnation")?,
      address: r.get_string("address")?,
    })
  }
}

#[test]
fn test_election_rejects_non_role_cause() {
  let e = Election {
    cause: NodeChangeCause::MemberJoined,
    node: NodeId(101),
    incarnation: 1,
    sequence: 1,
  };
  assert!(e.copy_into(&mut FrameWriter::new()).is_err());
}

#[test]
fn test_heartbeat_layout() {
  let hb = Heartbeat {
    incarnation: 3,
    sequence: 0x0102030405,
    flags: SFlags(SFlags::ELIGIBLE),
    active_disks: 4,
  };
  let mut w = FrameWriter::new();
  hb.copy_into(&mut w).unwrap();
  let bytes = w.into_bytes();
  assert_eq!(
    bytes,
    vec![0, 0, 0, 3, 0, 0, 0, 1, 2, 3, 4, 5, 0, 0, 4, 0, 0, 0, 0, 4]
  );
  assert_eq!(Heartbeat::copy_from(&mut FrameReader::new(&bytes)), Ok(hb));
}
