use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::remote::RemoteConfig;

/// Environment variables copied from the engine's own environment into
/// process sandboxes when nothing else is configured.
pub const DEFAULT_ENV_PASSTHROUGH: &[&str] =
  &["LANG", "LC_CTYPE", "LC_ALL", "SSL_CERT_FILE", "SSL_CERT_DIR"];

/// Top-level engine configuration.
///
/// Every path is absolute once loaded through [`EngineConfig::load`] or
/// [`EngineConfig::default_for`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
  /// Durable local content store directory.
  pub store_dir: PathBuf,
  /// Root under which named caches are created, one directory per cache name.
  pub named_caches_dir: PathBuf,
  /// Workspace root used for source reads and workspace-mode processes.
  pub workspace_root: PathBuf,
  /// Worker threads for the scheduler runtime.
  #[serde(default = "default_worker_threads")]
  pub worker_threads: usize,
  /// Maximum number of concurrently running local processes.
  #[serde(default = "default_process_concurrency")]
  pub process_concurrency: usize,
  /// Files at or above this size are materialized writable.
  #[serde(default = "default_large_file_threshold")]
  pub large_file_threshold_bytes: u64,
  /// How many times a node is re-run after a concurrent invalidation before
  /// the request fails.
  #[serde(default = "default_max_invalidation_retries")]
  pub max_invalidation_retries: u32,
  /// Persist process results in the local action cache.
  #[serde(default = "default_local_cache")]
  pub local_cache: bool,
  /// Variable names passed through to processes from the engine environment.
  #[serde(default = "default_env_passthrough")]
  pub env_passthrough: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub remote: Option<RemoteConfig>,
}

impl EngineConfig {
  /// Configuration rooted at `data_dir`, with the workspace at `workspace_root`.
  pub fn default_for(data_dir: impl AsRef<Path>, workspace_root: impl Into<PathBuf>) -> Self {
    let data_dir = data_dir.as_ref();
    Self {
      store_dir: data_dir.join("store"),
      named_caches_dir: data_dir.join("named_caches"),
      workspace_root: workspace_root.into(),
      worker_threads: default_worker_threads(),
      process_concurrency: default_process_concurrency(),
      large_file_threshold_bytes: default_large_file_threshold(),
      max_invalidation_retries: default_max_invalidation_retries(),
      local_cache: default_local_cache(),
      env_passthrough: default_env_passthrough(),
      remote: None,
    }
  }

  /// Load and validate a JSON configuration file.
  ///
  /// Relative paths in the file are resolved against the file's directory.
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let mut config: EngineConfig =
      serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
      })?;

    if let Some(base) = path.parent() {
      config.store_dir = absolutize(base, &config.store_dir);
      config.named_caches_dir = absolutize(base, &config.named_caches_dir);
      config.workspace_root = absolutize(base, &config.workspace_root);
    }

    config.validate()?;
    Ok(config)
  }

  /// Check values the engine cannot run with.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.worker_threads == 0 {
      return Err(ConfigError::invalid("worker_threads", "must be at least 1"));
    }
    if self.process_concurrency == 0 {
      return Err(ConfigError::invalid(
        "process_concurrency",
        "must be at least 1",
      ));
    }
    if self.store_dir == self.named_caches_dir {
      return Err(ConfigError::invalid(
        "named_caches_dir",
        "must differ from store_dir",
      ));
    }
    if let Some(remote) = &self.remote {
      remote.validate()?;
    }
    Ok(())
  }

  /// Directory holding the persistent action cache index.
  pub fn action_cache_path(&self) -> PathBuf {
    self.store_dir.join("action_cache.sqlite")
  }
}

fn absolutize(base: &Path, path: &Path) -> PathBuf {
  if path.is_absolute() {
    path.to_path_buf()
  } else {
    base.join(path)
  }
}

fn default_worker_threads() -> usize {
  std::thread::available_parallelism()
    .map(|n| n.get())
    .unwrap_or(4)
}

fn default_process_concurrency() -> usize {
  default_worker_threads()
}

fn default_large_file_threshold() -> u64 {
  512 * 1024
}

fn default_max_invalidation_retries() -> u32 {
  8
}

fn default_local_cache() -> bool {
  true
}

fn default_env_passthrough() -> Vec<String> {
  DEFAULT_ENV_PASSTHROUGH
    .iter()
    .map(|name| name.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_for_derives_paths() {
    let config = EngineConfig::default_for("/data", "/work");
    assert_eq!(config.store_dir, PathBuf::from("/data/store"));
    assert_eq!(config.named_caches_dir, PathBuf::from("/data/named_caches"));
    assert_eq!(config.workspace_root, PathBuf::from("/work"));
    assert!(config.local_cache);
    assert!(config.env_passthrough.contains(&"LANG".to_string()));
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_load_resolves_relative_paths_and_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kiln.json");
    std::fs::write(
      &path,
      r#"{
        "store_dir": "store",
        "named_caches_dir": "caches",
        "workspace_root": ".",
        "process_concurrency": 2,
        "remote": { "store_url": "http://cache.local:8080" }
      }"#,
    )
    .unwrap();

    let config = EngineConfig::load(&path).unwrap();
    assert_eq!(config.store_dir, dir.path().join("store"));
    assert_eq!(config.process_concurrency, 2);
    assert_eq!(config.max_invalidation_retries, 8);

    let remote = config.remote.unwrap();
    assert_eq!(remote.max_attempts, 3);
    assert_eq!(remote.fanout, 16);
    assert!(remote.cache_read);
    assert!(!remote.execution);
  }

  #[test]
  fn test_validate_rejects_zero_concurrency() {
    let mut config = EngineConfig::default_for("/data", "/work");
    config.process_concurrency = 0;
    let err = config.validate().unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "process_concurrency"));
  }

  #[test]
  fn test_validate_rejects_bad_remote() {
    let mut config = EngineConfig::default_for("/data", "/work");
    let mut remote = RemoteConfig::new("http://cache");
    remote.max_attempts = 0;
    config.remote = Some(remote);
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_load_reports_parse_errors() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kiln.json");
    std::fs::write(&path, "{ not json").unwrap();
    assert!(matches!(
      EngineConfig::load(&path),
      Err(ConfigError::Parse { .. })
    ));
  }
}
