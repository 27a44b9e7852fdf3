use crate::error::ConfigApplyError;
use crate::frame::{ConfigChange, ConfigFile, Md5Sum};
use std::collections::HashMap;

/// A configuration file update, as offered to a [`ConfigStore`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ConfigUpdate {
  pub file: ConfigFile,
  pub version: u64,
  pub md5: Md5Sum,
  /// Replace whatever is installed, even a newer version.
  pub clear_mode: bool,
}
impl ConfigUpdate {
  pub(crate) fn from_change(change: &ConfigChange) -> Option<ConfigUpdate> {
    Some(ConfigUpdate {
      file: change.file,
      version: change.version?,
      md5: change.md5,
      clear_mode: change.clear_mode,
    })
  }
}

/// Where configuration files are installed. The membership task calls it synchronously, so
/// implementations must not block for long.
pub trait ConfigStore: Send {
  fn apply(&mut self, update: &ConfigUpdate) -> Result<(), ConfigApplyError>;
  fn installed(&self, file: ConfigFile) -> Option<(u64, Md5Sum)>;
}

/// Keeps installed versions in memory.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
  files: HashMap<ConfigFile, (u64, Md5Sum)>,
}
impl MemoryConfigStore {
  pub fn new() -> MemoryConfigStore {
    MemoryConfigStore::default()
  }
}
impl ConfigStore for MemoryConfigStore {
  fn apply(&mut self, update: &ConfigUpdate) -> Result<(), ConfigApplyError> {
    if let Some((installed, _)) = self.files.get(&update.file) {
      if !update.clear_mode && *installed > update.version {
        return Err(ConfigApplyError::StaleVersion {
          offered: update.version,
          installed: *installed,
        });
      }
    }
    self.files.insert(update.file, (update.version, update.md5));
    Ok(())
  }

  fn installed(&self, file: ConfigFile) -> Option<(u64, Md5Sum)> {
    self.files.get(&file).copied()
  }
}

#[test]
fn test_memory_store_versions() {
  let mut store = MemoryConfigStore::new();
  let update = |version, clear_mode| ConfigUpdate {
    file: ConfigFile::Cluster,
    version: version,
    md5: Md5Sum([version as u8; 16]),
    clear_mode: clear_mode,
  };
  store.apply(&update(5, false)).unwrap();
  assert_eq!(
    store.apply(&update(4, false)),
    Err(ConfigApplyError::StaleVersion {
      offered: 4,
      installed: 5
    })
  );
  store.apply(&update(5, false)).unwrap();
  store.apply(&update(3, true)).unwrap();
  assert_eq!(store.installed(ConfigFile::Cluster), Some((3, Md5Sum([3; 16]))));
  assert_eq!(store.installed(ConfigFile::Silo), None);
}
