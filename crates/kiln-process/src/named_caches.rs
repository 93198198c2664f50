use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use crate::ProcessError;

/// Persistent directories shared by sandboxes across runs, keyed by a stable
/// name.
///
/// Their contents are not content-addressed and play no part in caching.
/// Tools that write to them are not assumed to tolerate concurrent writers,
/// so each cache is held by at most one process at a time.
#[derive(Clone)]
pub struct NamedCaches {
  base: PathBuf,
  locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl NamedCaches {
  pub fn new(base: impl Into<PathBuf>) -> Self {
    Self {
      base: base.into(),
      locks: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  pub fn base(&self) -> &Path {
    &self.base
  }

  /// The directory backing cache `name`.
  pub fn path(&self, name: &str) -> Result<PathBuf, ProcessError> {
    let valid = !name.is_empty()
      && name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !valid {
      return Err(ProcessError::SandboxSetup {
        description: format!("named cache {}", name),
        message: "cache names may only contain a-z, 0-9, '_' and '-'".to_string(),
      });
    }
    Ok(self.base.join(name))
  }

  /// Take exclusive use of cache `name`, creating its directory if needed.
  /// The cache is released when the returned lease is dropped.
  pub async fn acquire(&self, name: &str) -> Result<CacheLease, ProcessError> {
    let path = self.path(name)?;
    let lock = {
      let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
      locks.entry(name.to_string()).or_default().clone()
    };
    let guard = lock.lock_owned().await;
    tokio::fs::create_dir_all(&path)
      .await
      .map_err(|e| ProcessError::SandboxSetup {
        description: format!("named cache {}", name),
        message: e.to_string(),
      })?;
    Ok(CacheLease {
      path,
      _guard: guard,
    })
  }
}

/// Exclusive use of one named cache.
pub struct CacheLease {
  path: PathBuf,
  _guard: OwnedMutexGuard<()>,
}

impl CacheLease {
  pub fn path(&self) -> &Path {
    &self.path
  }
}
