use crate::core::NodeId;
use crate::error::ProtocolError;
use crate::frame::{FrameReader, FrameWriter};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::convert::TryFrom;

/// Bytes taken by the length prefix in front of every frame.
pub const LEN_PREFIX: usize = 4;
/// Upper bound on the declared length of one frame.
pub const MAX_FRAME_LEN: usize = 1 << 20;

pub const BROADCAST: i32 = -1;
pub const PEER: i32 = -2;

/// The closed set of frame types. The tag is the first int of every frame.
#[derive(
  Clone, Copy, Debug, Eq, Hash, IntoPrimitive, Ord, PartialEq, PartialOrd, TryFromPrimitive,
)]
#[repr(i32)]
pub enum FrameType {
  Heartbeat = 1,
  Election = 2,
  Discovery = 3,
  NodeChange = 4,
  NodeInfo = 5,
  CNodeInfo = 6,
  ConfigChange = 7,
  ConfigChangeNotif = 8,
}

/// Who a frame is addressed to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Destination {
  /// Every node; consumed and forwarded around the ring.
  Broadcast,
  /// Only the node at the other end of the link.
  Peer,
  Node(NodeId),
}
impl Destination {
  pub fn to_wire(self) -> i32 {
    match self {
      Destination::Broadcast => BROADCAST,
      Destination::Peer => PEER,
      Destination::Node(id) => id.0 as i32,
    }
  }

  pub fn from_wire(v: i32) -> Result<Destination, ProtocolError> {
    match v {
      BROADCAST => Ok(Destination::Broadcast),
      PEER => Ok(Destination::Peer),
      v if v > 0 && v <= u16::MAX as i32 => Ok(Destination::Node(NodeId(v as u16))),
      v => Err(ProtocolError::InvalidValue {
        field: "destination",
        value: v as i64,
      }),
    }
  }
}

/// The common prefix of every frame: type tag, source node and destination.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FrameHeader {
  pub frame_type: FrameType,
  pub source: NodeId,
  pub destination: Destination,
}
impl FrameHeader {
  pub const SIZE: usize = 12;

  pub fn put(&self, w: &mut FrameWriter) {
    w.put_i32(self.frame_type.into());
    w.put_node(self.source);
    w.put_i32(self.destination.to_wire());
  }

  pub fn read(r: &mut FrameReader<'_>) -> Result<FrameHeader, ProtocolError> {
    let tag = r.get_i32("type")?;
    let frame_type =
      FrameType::try_from(tag).map_err(|_| ProtocolError::UnknownFrameType(tag))?;
    let source = r.get_node("source")?;
    let destination = Destination::from_wire(r.get_i32("destination")?)?;
    Ok(FrameHeader {
      frame_type: frame_type,
      source: source,
      destination: destination,
    })
  }

  /// Reads the header of a complete, length-prefixed frame without touching the body. Relays use
  /// this to apply rules to frames they forward byte for byte.
  pub fn peek(frame: &[u8]) -> Result<FrameHeader, ProtocolError> {
    let body = frame_body(frame)?;
    FrameHeader::read(&mut FrameReader::new(body))
  }
}

/// Strips and checks the length prefix of a complete frame.
pub fn frame_body(frame: &[u8]) -> Result<&[u8], ProtocolError> {
  if frame.len() < LEN_PREFIX {
    return Err(ProtocolError::Truncated {
      field: "length",
      needed: LEN_PREFIX - frame.len(),
    });
  }
  let mut prefix = [0u8; LEN_PREFIX];
  prefix.copy_from_slice(&frame[..LEN_PREFIX]);
  let declared = u32::from_be_bytes(prefix) as usize;
  if declared > MAX_FRAME_LEN {
    return Err(ProtocolError::FrameTooLarge(declared));
  }
  let body = &frame[LEN_PREFIX..];
  if body.len() != declared {
    return Err(ProtocolError::LengthMismatch {
      declared: declared,
      actual: body.len(),
    });
  }
  Ok(body)
}

#[test]
fn test_header_serde() {
  let header = FrameHeader {
    frame_type: FrameType::ConfigChange,
    source: NodeId(103),
    destination: Destination::Peer,
  };
  let mut w = FrameWriter::new();
  header.put(&mut w);
  let bytes = w.into_bytes();
  assert_eq!(bytes.len(), FrameHeader::SIZE);
  assert_eq!(&bytes[..4], &[0, 0, 0, 7]);
  assert_eq!(&bytes[8..], &[0xff, 0xff, 0xff, 0xfe]);
  assert_eq!(FrameHeader::read(&mut FrameReader::new(&bytes)), Ok(header));
}

#[test]
fn test_header_rejects_unknown_type() {
  let mut w = FrameWriter::new();
  w.put_i32(42);
  w.put_i32(101);
  w.put_i32(BROADCAST);
  let bytes = w.into_bytes();
  assert_eq!(
    FrameHeader::read(&mut FrameReader::new(&bytes)),
    Err(ProtocolError::UnknownFrameType(42))
  );
}
