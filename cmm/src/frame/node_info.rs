use crate::core::NodeId;
use crate::error::ProtocolError;
use crate::frame::{FrameReader, FrameType, FrameWriter, WireMessage};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::convert::TryFrom;

/// Width of the legacy `name` field.
pub const NAME_WIDTH: usize = 256;
/// Width of the legacy `addr` field.
pub const ADDR_WIDTH: usize = 64;
/// Width of the legacy `swload` field.
pub const SWLOAD_WIDTH: usize = 32;

/// Role and state bits of a legacy member record, also carried by heartbeats.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct SFlags(pub i32);
impl SFlags {
  pub const MASTER: i32 = 0x1;
  pub const VICEMASTER: i32 = 0x2;
  pub const OUT_OF_CLUSTER: i32 = 0x4;
  pub const ELIGIBLE: i32 = 0x400;

  pub fn contains(self, flag: i32) -> bool {
    self.0 & flag == flag
  }

  pub fn with(self, flag: i32, on: bool) -> SFlags {
    if on {
      SFlags(self.0 | flag)
    } else {
      SFlags(self.0 & !flag)
    }
  }
}

/// Which nodes a [`NodeInfo`] query asks about.
#[derive(
  Clone, Copy, Debug, Eq, Hash, IntoPrimitive, Ord, PartialEq, PartialOrd, TryFromPrimitive,
)]
#[repr(i32)]
pub enum InfoRequest {
  Me = 1,
  Master = 2,
  ViceMaster = 3,
  GivenNode = 4,
  All = 5,
  AllCountOnly = 6,
}

/// A member record in the length-prefixed layout.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct NodeInfoRecord {
  pub id: NodeId,
  pub name: String,
  pub alive: bool,
  pub eligible: bool,
  pub master: bool,
  pub vice_master: bool,
  pub off: bool,
  pub active_disks: u32,
}

/// A member record in the fixed-width legacy layout.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct CNodeRecord {
  pub id: NodeId,
  pub name: String,
  pub addr: String,
  pub domain: i32,
  pub sflags: SFlags,
  pub incarnation: u32,
  pub swload: String,
}

/// A record layout usable inside a [`NodeInfoFrame`].
pub trait InfoRecord: Sized {
  fn put(&self, w: &mut FrameWriter) -> Result<(), ProtocolError>;
  fn get(r: &mut FrameReader<'_>) -> Result<Self, ProtocolError>;
}
impl InfoRecord for NodeInfoRecord {
  fn put(&self, w: &mut FrameWriter) -> Result<(), ProtocolError> {
    w.put_node(self.id);
    w.put_string("name", &self.name)?;
    w.put_bool(self.alive);
    w.put_bool(self.eligible);
    w.put_bool(self.master);
    w.put_bool(self.vice_master);
    w.put_bool(self.off);
    w.put_u31("activeDiskCount", self.active_disks)
  }

  fn get(r: &mut FrameReader<'_>) -> Result<Self, ProtocolError> {
    Ok(NodeInfoRecord {
      id: r.get_node("nodeId")?,
      name: r.get_string("name")?,
      alive: r.get_bool("isAlive")?,
      eligible: r.get_bool("isEligible")?,
      master: r.get_bool("isMaster")?,
      vice_master: r.get_bool("isViceMaster")?,
      off: r.get_bool("isOff")?,
      active_disks: r.get_u31("activeDiskCount")?,
    })
  }
}
impl InfoRecord for CNodeRecord {
  fn put(&self, w: &mut FrameWriter) -> Result<(), ProtocolError> {
    w.put_node(self.id);
    w.put_fixed("name", &self.name, NAME_WIDTH)?;
    w.put_fixed("addr", &self.addr, ADDR_WIDTH)?;
    w.put_i32(self.domain);
    w.put_i32(self.sflags.0);
    w.put_u31("incarnation", self.incarnation)?;
    w.put_fixed("swload", &self.swload, SWLOAD_WIDTH)
  }

  fn get(r: &mut FrameReader<'_>) -> Result<Self, ProtocolError> {
    Ok(CNodeRecord {
      id: r.get_node("nodeid")?,
      name: r.get_fixed("name", NAME_WIDTH)?,
      addr: r.get_fixed("addr", ADDR_WIDTH)?,
      domain: r.get_i32("domain")?,
      sflags: SFlags(r.get_i32("sflags")?),
      incarnation: r.get_u31("incarnation")?,
      swload: r.get_fixed("swload", SWLOAD_WIDTH)?,
    })
  }
}

/// A snapshot query and its response. The same envelope carries either record layout, see
/// [`NodeInfo`] and [`CNodeInfo`].
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct NodeInfoFrame<R> {
  pub request: InfoRequest,
  /// The node asked about; required for [`InfoRequest::GivenNode`], `-1` on the wire otherwise.
  pub given: Option<NodeId>,
  pub response: bool,
  /// Number of nodes described. Equals `records.len()` except in `AllCountOnly` responses.
  pub count: u32,
  pub records: Vec<R>,
}
pub type NodeInfo = NodeInfoFrame<NodeInfoRecord>;
pub type CNodeInfo = NodeInfoFrame<CNodeRecord>;

impl<R: InfoRecord> NodeInfoFrame<R> {
  pub fn query(request: InfoRequest, given: Option<NodeId>) -> NodeInfoFrame<R> {
    NodeInfoFrame {
      request: request,
      given: given,
      response: false,
      count: 0,
      records: Vec::new(),
    }
  }

  pub fn answer(request: InfoRequest, given: Option<NodeId>, records: Vec<R>) -> NodeInfoFrame<R> {
    NodeInfoFrame {
      request: request,
      given: given,
      response: true,
      count: records.len() as u32,
      records: records,
    }
  }

  pub fn count_only(count: u32) -> NodeInfoFrame<R> {
    NodeInfoFrame {
      request: InfoRequest::AllCountOnly,
      given: None,
      response: true,
      count: count,
      records: Vec::new(),
    }
  }

  fn put(&self, w: &mut FrameWriter) -> Result<(), ProtocolError> {
    if self.request == InfoRequest::GivenNode && self.given.is_none() {
      return Err(ProtocolError::Unset("given"));
    }
    let expected = match self.request {
      InfoRequest::AllCountOnly => 0,
      _ => self.count as usize,
    };
    if self.records.len() != expected {
      return Err(ProtocolError::InvalidValue {
        field: "count",
        value: self.count as i64,
      });
    }
    w.put_i32(self.request.into());
    w.put_opt_node(self.given);
    w.put_bool(self.response);
    w.put_u31("count", self.count)?;
    for record in &self.records {
      record.put(w)?;
    }
    Ok(())
  }

  fn get(r: &mut FrameReader<'_>) -> Result<Self, ProtocolError> {
    let tag = r.get_i32("request")?;
    let request = InfoRequest::try_from(tag).map_err(|_| ProtocolError::InvalidValue {
      field: "request",
      value: tag as i64,
    })?;
    let given = r.get_opt_node("given")?;
    if request == InfoRequest::GivenNode && given.is_none() {
      return Err(ProtocolError::Unset("given"));
    }
    let response = r.get_bool("response")?;
    let count = r.get_u31("count")?;
    let records = match request {
      InfoRequest::AllCountOnly => Vec::new(),
      _ => (0..count).map(|_| R::get(r)).collect::<Result<Vec<_>, _>>()?,
    };
    Ok(NodeInfoFrame {
      request: request,
      given: given,
      response: response,
      count: count,
      records: records,
    })
  }
}
impl WireMessage for NodeInfo {
  const FRAME_TYPE: FrameType = FrameType::NodeInfo;

  fn copy_into(&self, w: &mut FrameWriter) -> Result<(), ProtocolError> {
    self.put(w)
  }

  fn copy_from(r: &mut FrameReader<'_>) -> Result<Self, ProtocolError> {
    Self::get(r)
  }
}
impl WireMessage for CNodeInfo {
  const FRAME_TYPE: FrameType = FrameType::CNodeInfo;

  fn copy_into(&self, w: &mut FrameWriter) -> Result<(), ProtocolError> {
    self.put(w)
  }

  fn copy_from(r: &mut FrameReader<'_>) -> Result<Self, ProtocolError> {
    Self::get(r)
  }
}

#[cfg(test)]
fn c_record(id: u16) -> CNodeRecord {
  CNodeRecord {
    id: NodeId(id),
    name: format!("hcb{}", id),
    addr: format!("10.123.45.{}", id),
    domain: 0,
    sflags: SFlags::default().with(SFlags::ELIGIBLE, true),
    incarnation: 7,
    swload: "1.1-48".to_string(),
  }
}

#[test]
fn test_c_record_is_fixed_width() {
  let mut w = FrameWriter::new();
  c_record(101).put(&mut w).unwrap();
  assert_eq!(w.len(), 4 + NAME_WIDTH + ADDR_WIDTH + 4 + 4 + 4 + SWLOAD_WIDTH);
  let bytes = w.into_bytes();
  let mut r = FrameReader::new(&bytes);
  assert_eq!(CNodeRecord::get(&mut r).unwrap(), c_record(101));
  r.finish().unwrap();
}

#[test]
fn test_given_node_requires_node() {
  let mut w = FrameWriter::new();
  let q = NodeInfo::query(InfoRequest::GivenNode, None);
  assert_eq!(q.copy_into(&mut w), Err(ProtocolError::Unset("given")));
}

#[test]
fn test_count_only_carries_no_records() {
  let mut w = FrameWriter::new();
  CNodeInfo::count_only(16).copy_into(&mut w).unwrap();
  assert_eq!(w.len(), 16);
  let bytes = w.into_bytes();
  let decoded = CNodeInfo::copy_from(&mut FrameReader::new(&bytes)).unwrap();
  assert_eq!(decoded.count, 16);
  assert!(decoded.records.is_empty());

  let mut bad = CNodeInfo::count_only(1);
  bad.records.push(c_record(101));
  assert!(bad.copy_into(&mut FrameWriter::new()).is_err());
}

#[test]
fn test_sflags() {
  let f = SFlags::default()
    .with(SFlags::MASTER, true)
    .with(SFlags::ELIGIBLE, true);
  assert_eq!(f.0, 0x401);
  assert!(f.contains(SFlags::MASTER));
  assert!(!f.with(SFlags::MASTER, false).contains(SFlags::MASTER));
}
