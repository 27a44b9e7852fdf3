use crate::core::NodeId;
use crate::error::ProtocolError;
use std::convert::TryFrom;

// Serialization is big endian. Booleans are 4-byte ints. Strings come in two conventions:
// length-prefixed (`put_string`) for newer frames and NUL-padded fixed width (`put_fixed`) for
// the legacy member records. Peers decode by field sequence, so the two must never be mixed up.

/// Appends wire fields to a frame buffer.
pub struct FrameWriter {
  buf: Vec<u8>,
}
impl FrameWriter {
  pub fn new() -> FrameWriter {
    FrameWriter { buf: Vec::with_capacity(64) }
  }

  pub fn put_i32(&mut self, v: i32) {
    self.buf.extend_from_slice(&v.to_be_bytes());
  }

  pub fn put_i64(&mut self, v: i64) {
    self.buf.extend_from_slice(&v.to_be_bytes());
  }

  pub fn put_u8(&mut self, v: u8) {
    self.buf.push(v);
  }

  pub fn put_bool(&mut self, v: bool) {
    self.put_i32(v as i32);
  }

  pub fn put_bytes(&mut self, bytes: &[u8]) {
    self.buf.extend_from_slice(bytes);
  }

  /// A non-negative int field.
  pub fn put_u31(&mut self, field: &'static str, v: u32) -> Result<(), ProtocolError> {
    let v = i32::try_from(v).map_err(|_| ProtocolError::InvalidValue {
      field: field,
      value: v as i64,
    })?;
    self.put_i32(v);
    Ok(())
  }

  /// A non-negative long field.
  pub fn put_u63(&mut self, field: &'static str, v: u64) -> Result<(), ProtocolError> {
    let v = i64::try_from(v).map_err(|_| ProtocolError::InvalidValue {
      field: field,
      value: i64::MAX,
    })?;
    self.put_i64(v);
    Ok(())
  }

  pub fn put_node(&mut self, id: NodeId) {
    self.put_i32(id.0 as i32);
  }

  /// A node id that may legitimately be absent; absence is the legacy `-1`.
  pub fn put_opt_node(&mut self, id: Option<NodeId>) {
    self.put_i32(id.map_or(-1, |id| id.0 as i32));
  }

  /// A required node id; absence is an error rather than a `-1` on the wire.
  pub fn put_required_node(
    &mut self,
    field: &'static str,
    id: Option<NodeId>,
  ) -> Result<(), ProtocolError> {
    let id = id.ok_or(ProtocolError::Unset(field))?;
    self.put_node(id);
    Ok(())
  }

  pub fn put_string(&mut self, field: &'static str, s: &str) -> Result<(), ProtocolError> {
    let len = u32::try_from(s.len()).map_err(|_| ProtocolError::TooLong {
      field: field,
      len: s.len(),
      max: i32::MAX as usize,
    })?;
    self.put_u31(field, len)?;
    self.put_bytes(s.as_bytes());
    Ok(())
  }

  pub fn put_fixed(
    &mut self,
    field: &'static str,
    s: &str,
    width: usize,
  ) -> Result<(), ProtocolError> {
    // One byte stays free so C readers always find a terminator.
    if s.len() >= width {
      return Err(ProtocolError::TooLong {
        field: field,
        len: s.len(),
        max: width - 1,
      });
    }
    self.put_bytes(s.as_bytes());
    self.buf.resize(self.buf.len() + width - s.len(), 0);
    Ok(())
  }

  pub fn len(&self) -> usize {
    self.buf.len()
  }

  pub fn is_empty(&self) -> bool {
    self.buf.is_empty()
  }

  pub(in crate::frame) fn as_mut_slice(&mut self) -> &mut [u8] {
    &mut self.buf[..]
  }

  pub fn into_bytes(self) -> Vec<u8> {
    self.buf
  }
}
impl Default for FrameWriter {
  fn default() -> Self {
    FrameWriter::new()
  }
}

/// Reads wire fields from a frame body.
pub struct FrameReader<'a> {
  buf: &'a [u8],
  pos: usize,
}
impl<'a> FrameReader<'a> {
  pub fn new(buf: &'a [u8]) -> FrameReader<'a> {
    FrameReader { buf: buf, pos: 0 }
  }

  pub fn remaining(&self) -> usize {
    self.buf.len() - self.pos
  }

  pub fn take(&mut self, field: &'static str, n: usize) -> Result<&'a [u8], ProtocolError> {
    if self.remaining() < n {
      return Err(ProtocolError::Truncated {
        field: field,
        needed: n - self.remaining(),
      });
    }
    let slice = &self.buf[self.pos..self.pos + n];
    self.pos += n;
    Ok(slice)
  }

  pub fn get_array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], ProtocolError> {
    let mut out = [0u8; N];
    out.copy_from_slice(self.take(field, N)?);
    Ok(out)
  }

  pub fn get_i32(&mut self, field: &'static str) -> Result<i32, ProtocolError> {
    self.get_array::<4>(field).map(i32::from_be_bytes)
  }

  pub fn get_i64(&mut self, field: &'static str) -> Result<i64, ProtocolError> {
    self.get_array::<8>(field).map(i64::from_be_bytes)
  }

  pub fn get_u8(&mut self, field: &'static str) -> Result<u8, ProtocolError> {
    self.get_array::<1>(field).map(|b| b[0])
  }

  pub fn get_bool(&mut self, field: &'static str) -> Result<bool, ProtocolError> {
    match self.get_i32(field)? {
      0 => Ok(false),
      1 => Ok(true),
      v => Err(ProtocolError::InvalidValue {
        field: field,
        value: v as i64,
      }),
    }
  }

  pub fn get_u31(&mut self, field: &'static str) -> Result<u32, ProtocolError> {
    let v = self.get_i32(field)?;
    u32::try_from(v).map_err(|_| ProtocolError::InvalidValue {
      field: field,
      value: v as i64,
    })
  }

  pub fn get_u63(&mut self, field: &'static str) -> Result<u64, ProtocolError> {
    let v = self.get_i64(field)?;
    u64::try_from(v).map_err(|_| ProtocolError::InvalidValue {
      field: field,
      value: v,
    })
  }

  /// A required node id. `-1` is the legacy unset marker and is rejected as such.
  pub fn get_node(&mut self, field: &'static str) -> Result<NodeId, ProtocolError> {
    self.get_opt_node(field)?.ok_or(ProtocolError::Unset(field))
  }

  pub fn get_opt_node(&mut self, field: &'static str) -> Result<Option<NodeId>, ProtocolError> {
    match self.get_i32(field)? {
      -1 => Ok(None),
      v if v > 0 && v <= u16::MAX as i32 => Ok(Some(NodeId(v as u16))),
      v => Err(ProtocolError::InvalidValue {
        field: field,
        value: v as i64,
      }),
    }
  }

  pub fn get_string(&mut self, field: &'static str) -> Result<String, ProtocolError> {
    let len = self.get_u31(field)? as usize;
    let bytes = self.take(field, len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::Utf8(field))
  }

  pub fn get_fixed(&mut self, field: &'static str, width: usize) -> Result<String, ProtocolError> {
    let bytes = self.take(field, width)?;
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(width);
    std::str::from_utf8(&bytes[..end])
      .map(str::to_string)
      .map_err(|_| ProtocolError::Utf8(field))
  }

  /// Succeeds only if the whole buffer was consumed.
  pub fn finish(self) -> Result<(), ProtocolError> {
    match self.remaining() {
      0 => Ok(()),
      n => Err(ProtocolError::Trailing(n)),
    }
  }
}

#[test]
fn test_fixed_width_strings() {
  let mut w = FrameWriter::new();
  w.put_fixed("name", "hcb101", 8).unwrap();
  w.put_string("addr", "10.0.0.1").unwrap();
  assert_eq!(w.len(), 8 + 4 + 8);
  assert!(matches!(
    w.put_fixed("name", "12345678", 8),
    Err(ProtocolError::TooLong { max: 7, .. })
  ));
  let bytes = w.into_bytes();
  let mut r = FrameReader::new(&bytes);
  assert_eq!(r.get_fixed("name", 8).unwrap(), "hcb101");
  assert_eq!(r.get_string("addr").unwrap(), "10.0.0.1");
  r.finish().unwrap();
}

#[test]
fn test_node_sentinels() {
  let mut w = FrameWriter::new();
  w.put_opt_node(None);
  w.put_i32(0);
  w.put_node(NodeId(101));
  assert_eq!(
    w.put_required_node("nodeid", None),
    Err(ProtocolError::Unset("nodeid"))
  );
  let bytes = w.into_bytes();
  let mut r = FrameReader::new(&bytes);
  assert_eq!(r.get_node("nodeid"), Err(ProtocolError::Unset("nodeid")));
  assert!(matches!(
    r.get_node("nodeid"),
    Err(ProtocolError::InvalidValue { value: 0, .. })
  ));
  assert_eq!(r.get_node("nodeid"), Ok(NodeId(101)));
  assert!(matches!(r.get_i32("x"), Err(ProtocolError::Truncated { needed: 4, .. })));
}

#[test]
fn test_bools_are_ints() {
  let mut w = FrameWriter::new();
  w.put_bool(true);
  w.put_i32(2);
  let bytes = w.into_bytes();
  assert_eq!(&bytes[..4], &[0, 0, 0, 1]);
  let mut r = FrameReader::new(&bytes);
  assert_eq!(r.get_bool("alive"), Ok(true));
  assert!(r.get_bool("alive").is_err());
}
