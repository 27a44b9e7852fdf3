//! The binary frame codec.
//!
//! Every frame on a ring link is a big-endian `len:u32` prefix followed by a [`FrameHeader`]
//! (`type`, `source`, `destination`) and a type-specific body. Each message type implements
//! [`WireMessage`], whose `copy_into` and `copy_from` are exact inverses. Decoding dispatches on
//! the type tag through a closed table, see [`decode`].
//!
//! Fields that are required but were historically marked unset with `-1` are `Option`s at the
//! API boundary. Encoding a `None` there is a [`ProtocolError::Unset`], and so is decoding a `-1`.

mod buf;
mod config_change;
mod control;
mod header;
mod node_change;
mod node_info;

#[rustfmt::skip]
pub use {
  buf::FrameReader,
  buf::FrameWriter,
  config_change::ConfigChange,
  config_change::ConfigChangeNotif,
  config_change::ConfigFile,
  config_change::ConfigNotifCause,
  config_change::ConfigStatus,
  config_change::Md5ParseError,
  config_change::Md5Sum,
  control::Discovery,
  control::Election,
  control::Heartbeat,
  header::frame_body,
  header::Destination,
  header::FrameHeader,
  header::FrameType,
  header::BROADCAST,
  header::LEN_PREFIX,
  header::MAX_FRAME_LEN,
  header::PEER,
  node_change::NodeChange,
  node_change::NodeChangeCause,
  node_info::CNodeInfo,
  node_info::CNodeRecord,
  node_info::InfoRecord,
  node_info::InfoRequest,
  node_info::NodeInfo,
  node_info::NodeInfoFrame,
  node_info::NodeInfoRecord,
  node_info::SFlags,
  node_info::ADDR_WIDTH,
  node_info::NAME_WIDTH,
  node_info::SWLOAD_WIDTH,
};

use crate::core::NodeId;
use crate::error::ProtocolError;
use std::convert::TryFrom;
use std::hash::{Hash, Hasher};
use wyhash::WyHash;

/// A message body with a fixed binary layout.
pub trait WireMessage: Sized {
  /// The header tag of frames carrying this body.
  const FRAME_TYPE: FrameType;

  fn copy_into(&self, w: &mut FrameWriter) -> Result<(), ProtocolError>;
  fn copy_from(r: &mut FrameReader<'_>) -> Result<Self, ProtocolError>;
}

/// The closed union of frame bodies.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Message {
  Heartbeat(Heartbeat),
  Election(Election),
  Discovery(Discovery),
  NodeChange(NodeChange),
  NodeInfo(NodeInfo),
  CNodeInfo(CNodeInfo),
  ConfigChange(ConfigChange),
  ConfigChangeNotif(ConfigChangeNotif),
}
impl Message {
  pub fn frame_type(&self) -> FrameType {
    match self {
      Message::Heartbeat(_) => Heartbeat::FRAME_TYPE,
      Message::Election(_) => Election::FRAME_TYPE,
      Message::Discovery(_) => Discovery::FRAME_TYPE,
      Message::NodeChange(_) => NodeChange::FRAME_TYPE,
      Message::NodeInfo(_) => NodeInfo::FRAME_TYPE,
      Message::CNodeInfo(_) => CNodeInfo::FRAME_TYPE,
      Message::ConfigChange(_) => ConfigChange::FRAME_TYPE,
      Message::ConfigChangeNotif(_) => ConfigChangeNotif::FRAME_TYPE,
    }
  }

  fn copy_into(&self, w: &mut FrameWriter) -> Result<(), ProtocolError> {
    match self {
      Message::Heartbeat(m) => m.copy_into(w),
      Message::Election(m) => m.copy_into(w),
      Message::Discovery(m) => m.copy_into(w),
      Message::NodeChange(m) => m.copy_into(w),
      Message::NodeInfo(m) => m.copy_into(w),
      Message::CNodeInfo(m) => m.copy_into(w),
      Message::ConfigChange(m) => m.copy_into(w),
      Message::ConfigChangeNotif(m) => m.copy_into(w),
    }
  }
}

macro_rules! message_from {
  ($($variant:ident),*) => {
    $(
      impl From<$variant> for Message {
        fn from(m: $variant) -> Self {
          Message::$variant(m)
        }
      }
    )*
  };
}
message_from!(
  Heartbeat,
  Election,
  Discovery,
  NodeChange,
  NodeInfo,
  CNodeInfo,
  ConfigChange,
  ConfigChangeNotif
);

/// A decoded frame: header fields plus a typed body.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Frame {
  pub source: NodeId,
  pub destination: Destination,
  pub message: Message,
}
impl Frame {
  pub fn new<M: Into<Message>>(source: NodeId, destination: Destination, msg: M) -> Frame {
    Frame {
      source: source,
      destination: destination,
      message: msg.into(),
    }
  }

  pub fn header(&self) -> FrameHeader {
    FrameHeader {
      frame_type: self.message.frame_type(),
      source: self.source,
      destination: self.destination,
    }
  }

  /// A digest of the whole frame, used to recognise re-deliveries.
  pub fn digest(&self) -> u64 {
    let mut hasher = WyHash::with_seed(0);
    self.hash(&mut hasher);
    hasher.finish()
  }
}

/// Encodes a frame including its length prefix.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
  let mut w = FrameWriter::new();
  w.put_i32(0);
  frame.header().put(&mut w);
  frame.message.copy_into(&mut w)?;
  let len = w.len() - LEN_PREFIX;
  if len > MAX_FRAME_LEN {
    return Err(ProtocolError::FrameTooLarge(len));
  }
  // Infallible: len <= MAX_FRAME_LEN.
  let prefix = u32::try_from(len).unwrap_or(u32::MAX).to_be_bytes();
  w.as_mut_slice()[..LEN_PREFIX].copy_from_slice(&prefix);
  Ok(w.into_bytes())
}

/// Decodes a complete frame including its length prefix.
pub fn decode(bytes: &[u8]) -> Result<Frame, ProtocolError> {
  decode_body(frame_body(bytes)?)
}

/// Decodes a frame body whose length prefix was already consumed by the reader.
pub fn decode_body(body: &[u8]) -> Result<Frame, ProtocolError> {
  let mut r = FrameReader::new(body);
  let header = FrameHeader::read(&mut r)?;
  let message = decoder(header.frame_type)(&mut r)?;
  r.finish()?;
  Ok(Frame {
    source: header.source,
    destination: header.destination,
    message: message,
  })
}

type Decoder = fn(&mut FrameReader<'_>) -> Result<Message, ProtocolError>;

fn decode_as<M: WireMessage + Into<Message>>(
  r: &mut FrameReader<'_>,
) -> Result<Message, ProtocolError> {
  M::copy_from(r).map(Into::into)
}

fn decoder(frame_type: FrameType) -> Decoder {
  match frame_type {
    FrameType::Heartbeat => decode_as::<Heartbeat>,
    FrameType::Election => decode_as::<Election>,
    FrameType::Discovery => decode_as::<Discovery>,
    FrameType::NodeChange => decode_as::<NodeChange>,
    FrameType::NodeInfo => decode_as::<NodeInfo>,
    FrameType::CNodeInfo => decode_as::<CNodeInfo>,
    FrameType::ConfigChange => decode_as::<ConfigChange>,
    FrameType::ConfigChangeNotif => decode_as::<ConfigChangeNotif>,
  }
}

#[test]
fn test_encode_sets_length_prefix() {
  let frame = Frame::new(
    NodeId(101),
    Destination::Broadcast,
    NodeChange::new(NodeChangeCause::MemberJoined, NodeId(102)),
  );
  let bytes = encode(&frame).unwrap();
  assert_eq!(bytes.len(), LEN_PREFIX + FrameHeader::SIZE + 8);
  assert_eq!(&bytes[..4], &[0, 0, 0, 20]);
  assert_eq!(decode(&bytes), Ok(frame));
}

#[test]
fn test_decode_rejects_trailing_bytes() {
  let frame = Frame::new(
    NodeId(101),
    Destination::Peer,
    NodeChange::new(NodeChangeCause::MemberLeft, NodeId(104)),
  );
  let mut body = encode(&frame).unwrap().split_off(LEN_PREFIX);
  body.push(0);
  assert_eq!(decode_body(&body), Err(ProtocolError::Trailing(1)));
}

#[test]
fn test_digest_distinguishes_frames() {
  let a = Frame::new(
    NodeId(101),
    Destination::Broadcast,
    NodeChange::new(NodeChangeCause::MemberLeft, NodeId(104)),
  );
  let mut b = a.clone();
  b.source = NodeId(102);
  assert_eq!(a.digest(), a.clone().digest());
  assert_ne!(a.digest(), b.digest());
}

#[test]
fn test_decoder_table_matches_frame_types() {
  let messages: Vec<Message> = vec![
    NodeChange::new(NodeChangeCause::MemberJoined, NodeId(102)).into(),
    NodeInfo::query(InfoRequest::Me, None).into(),
    CNodeInfo::query(InfoRequest::All, None).into(),
  ];
  for message in messages {
    let frame = Frame::new(NodeId(101), Destination::Peer, message);
    let mut w = FrameWriter::new();
    frame.message.copy_into(&mut w).unwrap();
    let bytes = w.into_bytes();
    let decoded = decoder(frame.message.frame_type())(&mut FrameReader::new(&bytes)).unwrap();
    assert_eq!(decoded.frame_type(), frame.message.frame_type());
    assert_eq!(decoded, frame.message);
  }
}
