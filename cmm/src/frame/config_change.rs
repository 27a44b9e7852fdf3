use crate::core::NodeId;
use crate::error::ProtocolError;
use crate::frame::{FrameReader, FrameType, FrameWriter, WireMessage};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The configuration file a [`ConfigChange`] updates.
#[derive(
  Clone,
  Copy,
  Debug,
  Deserialize,
  Eq,
  Hash,
  IntoPrimitive,
  Ord,
  PartialEq,
  PartialOrd,
  Serialize,
  TryFromPrimitive,
)]
#[repr(u8)]
pub enum ConfigFile {
  Cluster = 1,
  Silo = 2,
  Multicell = 3,
}
impl ConfigFile {
  fn read(r: &mut FrameReader<'_>, field: &'static str) -> Result<ConfigFile, ProtocolError> {
    let v = r.get_u8(field)?;
    ConfigFile::try_from(v).map_err(|_| ProtocolError::InvalidValue {
      field: field,
      value: v as i64,
    })
  }
}

#[derive(
  Clone, Copy, Debug, Eq, Hash, IntoPrimitive, Ord, PartialEq, PartialOrd, TryFromPrimitive,
)]
#[repr(i32)]
pub enum ConfigStatus {
  Pending = 0,
  Success = 1,
  Failure = 2,
}

#[derive(
  Clone, Copy, Debug, Eq, Hash, IntoPrimitive, Ord, PartialEq, PartialOrd, TryFromPrimitive,
)]
#[repr(i32)]
pub enum ConfigNotifCause {
  ConfigUpdated = 1,
  ConfigFailed = 2,
}

#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[error("md5sum must be 32 hex digits")]
pub struct Md5ParseError;

/// A 16-byte digest, written as 32 hex digits.
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
pub struct Md5Sum(pub [u8; 16]);
impl FromStr for Md5Sum {
  type Err = Md5ParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut out = [0u8; 16];
    hex::decode_to_slice(s, &mut out).map_err(|_| Md5ParseError)?;
    Ok(Md5Sum(out))
  }
}
impl fmt::Display for Md5Sum {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&hex::encode(self.0))
  }
}
impl fmt::Debug for Md5Sum {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Md5Sum({})", self)
  }
}

/// A configuration file update attempt and, in replies, its outcome on one node.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ConfigChange {
  /// The node that originated the update.
  pub source: NodeId,
  pub file: ConfigFile,
  pub clear_mode: bool,
  /// Required; `None` (the legacy `-1`) refuses to encode.
  pub version: Option<u64>,
  pub md5: Md5Sum,
  pub status: ConfigStatus,
  pub error_code: i32,
}
impl ConfigChange {
  /// Maps a legacy wire version to its optional form: negative values mean unset.
  pub fn version_from_wire(v: i64) -> Option<u64> {
    u64::try_from(v).ok()
  }

  pub fn reply(&self, status: ConfigStatus, error_code: i32) -> ConfigChange {
    ConfigChange {
      status: status,
      error_code: error_code,
      ..self.clone()
    }
  }
}
impl WireMessage for ConfigChange {
  const FRAME_TYPE: FrameType = FrameType::ConfigChange;

  fn copy_into(&self, w: &mut FrameWriter) -> Result<(), ProtocolError> {
    let version = self.version.ok_or(ProtocolError::Unset("version"))?;
    w.put_i32(self.status.into());
    w.put_i32(self.error_code);
    w.put_u8(self.file.into());
    w.put_u8(self.clear_mode as u8);
    w.put_u63("version", version)?;
    w.put_node(self.source);
    w.put_bytes(&self.md5.0);
    Ok(())
  }

  fn copy_from(r: &mut FrameReader<'_>) -> Result<Self, ProtocolError> {
    let status = r.get_i32("status")?;
    let status = ConfigStatus::try_from(status).map_err(|_| ProtocolError::InvalidValue {
      field: "status",
      value: status as i64,
    })?;
    let error_code = r.get_i32("errorCode")?;
    let file = ConfigFile::read(r, "fileToUpdate")?;
    let clear_mode = match r.get_u8("clearMode")? {
      0 => false,
      1 => true,
      v => {
        return Err(ProtocolError::InvalidValue {
          field: "clearMode",
          value: v as i64,
        })
      }
    };
    let version = match r.get_i64("version")? {
      -1 => return Err(ProtocolError::Unset("version")),
      v if v < 0 => {
        return Err(ProtocolError::InvalidValue {
          field: "version",
          value: v,
        })
      }
      v => v as u64,
    };
    Ok(ConfigChange {
      status: status,
      error_code: error_code,
      file: file,
      clear_mode: clear_mode,
      version: Some(version),
      source: r.get_node("source")?,
      md5: Md5Sum(r.get_array::<16>("md5sum")?),
    })
  }
}

/// Tells subscribers that a configuration file was updated, or failed to update, on a node.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ConfigChangeNotif {
  pub cause: ConfigNotifCause,
  pub node: NodeId,
  pub file: ConfigFile,
}
impl WireMessage for ConfigChangeNotif {
  const FRAME_TYPE: FrameType = FrameType::ConfigChangeNotif;

  fn copy_into(&self, w: &mut FrameWriter) -> Result<(), ProtocolError> {
    w.put_i32(self.cause.into());
    w.put_node(self.node);
    w.put_u8(self.file.into());
    Ok(())
  }

  fn copy_from(r: &mut FrameReader<'_>) -> Result<Self, ProtocolError> {
    let cause = r.get_i32("cause")?;
    let cause = ConfigNotifCause::try_from(cause).map_err(|_| ProtocolError::InvalidValue {
      field: "cause",
      value: cause as i64,
    })?;
    Ok(ConfigChangeNotif {
      cause: cause,
      node: r.get_node("nodeid")?,
      file: ConfigFile::read(r, "fileUpdated")?,
    })
  }
}

#[test]
fn test_md5_hex() {
  let sum: Md5Sum = "d41d8cd98f00b204e9800998ecf8427e".parse().unwrap();
  assert_eq!(sum.0[0], 0xd4);
  assert_eq!(sum.0[15], 0x7e);
  assert_eq!(sum.to_string(), "d41d8cd98f00b204e9800998ecf8427e");
  assert_eq!("D41D8CD98F00B204E9800998ECF8427E".parse::<Md5Sum>(), Ok(sum));
  assert_eq!("d41d8c".parse::<Md5Sum>(), Err(Md5ParseError));
  assert_eq!(
    "z41d8cd98f00b204e9800998ecf8427e".parse::<Md5Sum>(),
    Err(Md5ParseError)
  );
}

#[test]
fn test_config_change_layout() {
  let change = ConfigChange {
    source: NodeId(101),
    file: ConfigFile::Silo,
    clear_mode: true,
    version: Some(5),
    md5: Md5Sum([0xab; 16]),
    status: ConfigStatus::Failure,
    error_code: 2,
  };
  let mut w = FrameWriter::new();
  change.copy_into(&mut w).unwrap();
  let bytes = w.into_bytes();
  assert_eq!(bytes.len(), 4 + 4 + 1 + 1 + 8 + 4 + 16);
  assert_eq!(&bytes[8..10], &[2, 1]);
  assert_eq!(
    ConfigChange::copy_from(&mut FrameReader::new(&bytes)),
    Ok(change)
  );
}

#[test]
fn test_config_change_version_sentinel() {
  assert_eq!(ConfigChange::version_from_wire(-1), None);
  assert_eq!(ConfigChange::version_from_wire(5), Some(5));
  let mut w = FrameWriter::new();
  w.put_i32(ConfigStatus::Pending.into());
  w.put_i32(0);
  w.put_u8(ConfigFile::Cluster.into());
  w.put_u8(0);
  w.put_i64(-1);
  w.put_i32(101);
  w.put_bytes(&[0u8; 16]);
  let bytes = w.into_bytes();
  assert_eq!(
    ConfigChange::copy_from(&mut FrameReader::new(&bytes)),
    Err(ProtocolError::Unset("version"))
  );
}
